// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model.rs - 模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::fmt;

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 检测类别：人脸模型输出记为 Person，通用物体模型输出记为 Object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
  Person,
  Object,
}

impl Category {
  pub fn as_str(&self) -> &'static str {
    match self {
      Category::Person => "Person",
      Category::Object => "Object",
    }
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub category: Category,
  /// 模型原始类别编号
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，帧像素坐标
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Vec<DetectItem>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self { items }
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("ONNX Runtime 错误: {0}")]
  Ort(String),
  #[error("模型输出形状异常: {0}")]
  UnexpectedShape(String),
  #[error("推理会话锁已被污染")]
  SessionPoisoned,
  #[error("推理失败: {0}")]
  Inference(String),
}

/// 可在线程间共享的检测模型
pub type Detector =
  Box<dyn Model<Input = RgbImage, Output = DetectResult, Error = ModelError> + Send + Sync>;

/// 检测阶段：每帧依次运行人脸模型与物体模型
///
/// 两个模型互不共享状态。两者的输出都以同一阈值过滤，并按所在位置标记类别，
/// 人脸结果在前。
pub struct DetectionStage {
  face: Detector,
  object: Detector,
  confidence: f32,
}

impl DetectionStage {
  pub fn new(face: Detector, object: Detector, confidence: f32) -> Self {
    Self {
      face,
      object,
      confidence: confidence.clamp(0.0, 1.0),
    }
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  fn run(
    &self,
    detector: &Detector,
    category: Category,
    frame: &RgbImage,
  ) -> Result<Vec<DetectItem>, ModelError> {
    let result = detector.infer(frame)?;
    Ok(
      result
        .items
        .into_iter()
        .filter(|item| item.score >= self.confidence)
        .map(|item| DetectItem { category, ..item })
        .collect(),
    )
  }
}

impl Model for DetectionStage {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let mut items = self.run(&self.face, Category::Person, input)?;
    let faces = items.len();
    items.extend(self.run(&self.object, Category::Object, input)?);
    debug!("检测到 {} 张人脸, {} 个物体", faces, items.len() - faces);
    Ok(DetectResult { items })
  }
}

mod yolov8;
pub use self::yolov8::{Yolov8, Yolov8Builder};


#[cfg(test)]
mod tests {
  use super::testing::{FixedModel, item};
  use super::*;

  struct FailingModel;

  impl Model for FailingModel {
    type Input = RgbImage;
    type Output = DetectResult;
    type Error = ModelError;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      Err(ModelError::Inference("boom".to_string()))
    }
  }

  fn fixed(items: Vec<DetectItem>) -> Detector {
    Box::new(FixedModel { items })
  }

  #[test]
  fn threshold_applies_to_both_detectors() {
    // 故意把类别标反，检测阶段按位置重新标记
    let stage = DetectionStage::new(
      fixed(vec![
        item(Category::Object, 0.49, [0.0, 0.0, 10.0, 10.0]),
        item(Category::Object, 0.5, [1.0, 1.0, 10.0, 10.0]),
      ]),
      fixed(vec![
        item(Category::Person, 0.3, [2.0, 2.0, 10.0, 10.0]),
        item(Category::Person, 0.9, [3.0, 3.0, 10.0, 10.0]),
      ]),
      0.5,
    );

    let result = stage.infer(&RgbImage::new(16, 16)).unwrap();
    assert_eq!(result.len(), 2);
    assert_eq!(result.items[0].category, Category::Person);
    assert_eq!(result.items[0].score, 0.5);
    assert_eq!(result.items[1].category, Category::Object);
    assert_eq!(result.items[1].score, 0.9);
  }

  #[test]
  fn either_detector_may_be_empty() {
    let stage = DetectionStage::new(
      fixed(vec![]),
      fixed(vec![item(Category::Object, 0.8, [0.0, 0.0, 4.0, 4.0])]),
      0.5,
    );
    let result = stage.infer(&RgbImage::new(8, 8)).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].category, Category::Object);
  }

  #[test]
  fn detector_failure_propagates() {
    let stage = DetectionStage::new(fixed(vec![]), Box::new(FailingModel), 0.5);
    assert!(matches!(
      stage.infer(&RgbImage::new(8, 8)),
      Err(ModelError::Inference(_))
    ));
  }

  #[test]
  fn category_names() {
    assert_eq!(Category::Person.to_string(), "Person");
    assert_eq!(Category::Object.to_string(), "Object");
  }
}
