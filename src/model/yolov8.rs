// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/yolov8.rs - YOLOv8 ONNX 模型
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

use std::{path::Path, sync::Mutex, time::Instant};

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array4, ArrayView3, Ix3};
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::{Value, ValueType},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  model::{Category, DetectItem, DetectResult, Model, ModelError},
};

const YOLOV8_INPUT_SIZE: u32 = 640;
const YOLOV8_OBJECT_THRESH: f32 = 0.5;
const YOLOV8_NMS_THRESH: f32 = 0.7;
const YOLOV8_MAX_DETECTIONS: usize = 300;
/// 4 个框坐标 + 至少一个类别分数
const YOLOV8_MIN_FEATURES: usize = 5;
/// letterbox 填充灰度 114/255
const YOLOV8_PAD_VALUE: f32 = 114.0 / 255.0;
/// 检测头的下采样倍率
const YOLOV8_STRIDES: [u32; 3] = [8, 16, 32];

fn ort_error(e: impl std::fmt::Display) -> ModelError {
  ModelError::Ort(e.to_string())
}

pub struct Yolov8Builder {
  model_path: String,
  category: Category,
  confidence: f32,
  iou: f32,
  input_size: Option<u32>,
  max_detections: usize,
}

impl FromUrlWithScheme for Yolov8Builder {
  const SCHEME: &'static str = "yolov8";
}

impl FromUrl for Yolov8Builder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(Self::new(decoded_path(url)))
  }
}

impl Yolov8Builder {
  pub fn new(model_path: impl Into<String>) -> Self {
    Self {
      model_path: model_path.into(),
      category: Category::Object,
      confidence: YOLOV8_OBJECT_THRESH,
      iou: YOLOV8_NMS_THRESH,
      input_size: None,
      max_detections: YOLOV8_MAX_DETECTIONS,
    }
  }

  pub fn category(mut self, category: Category) -> Self {
    self.category = category;
    self
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence.clamp(0.0, 1.0);
    self
  }

  pub fn iou(mut self, iou: f32) -> Self {
    self.iou = iou.clamp(0.0, 1.0);
    self
  }

  /// 仅对动态输入尺寸的模型生效，静态模型以模型声明的尺寸为准
  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = Some(input_size.max(32));
    self
  }

  pub fn max_detections(mut self, max_detections: usize) -> Self {
    self.max_detections = max_detections;
    self
  }

  pub fn build(self) -> Result<Yolov8, ModelError> {
    let path = Path::new(&self.model_path);
    if !path.exists() {
      return Err(ModelError::ModelNotFound(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path);
    let now = Instant::now();

    let builder = Session::builder()
      .map_err(ort_error)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(ort_error)?;

    #[cfg(feature = "cuda")]
    let builder = builder
      .with_execution_providers([
        ort::execution_providers::CUDAExecutionProvider::default().build(),
      ])
      .map_err(ort_error)?;

    let session = builder.commit_from_file(path).map_err(ort_error)?;

    let declared = session
      .inputs
      .first()
      .and_then(|input| match &input.input_type {
        ValueType::Tensor { shape, .. } => declared_input_size(&shape[..]),
        _ => None,
      });
    let input_size = match (declared, self.input_size) {
      (Some(size), Some(requested)) if size != requested => {
        warn!(
          "模型 {} 的输入尺寸固定为 {}，忽略指定的 {}",
          self.model_path, size, requested
        );
        size
      }
      (Some(size), _) => size,
      (None, requested) => requested.unwrap_or(YOLOV8_INPUT_SIZE),
    };
    info!(
      "模型加载完成: {} ({}，输入 {}x{}，耗时 {:.2?})",
      self.model_path,
      self.category,
      input_size,
      input_size,
      now.elapsed()
    );

    Ok(Yolov8 {
      session: Mutex::new(session),
      category: self.category,
      confidence: self.confidence,
      iou: self.iou,
      input_size,
      max_detections: self.max_detections,
    })
  }
}

/// YOLOv8 检测模型
///
/// 输入为任意尺寸的 RGB 帧，输出框坐标映射回该帧的像素坐标。
pub struct Yolov8 {
  session: Mutex<Session>,
  category: Category,
  confidence: f32,
  iou: f32,
  input_size: u32,
  max_detections: usize,
}

impl Model for Yolov8 {
  type Input = RgbImage;
  type Output = DetectResult;
  type Error = ModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let (tensor, letterbox) = letterbox(input, self.input_size);
    let input_value = Value::from_array(tensor).map_err(ort_error)?;

    let now = Instant::now();
    let mut items = {
      let mut session = self
        .session
        .lock()
        .map_err(|_| ModelError::SessionPoisoned)?;
      let outputs = session.run(ort::inputs![input_value]).map_err(ort_error)?;
      let output = outputs[0].try_extract_array::<f32>().map_err(ort_error)?;
      let output = output
        .into_dimensionality::<Ix3>()
        .map_err(|e| ModelError::UnexpectedShape(e.to_string()))?;
      decode_output(
        output,
        anchor_count(self.input_size),
        &letterbox,
        input.dimensions(),
        self.category,
        self.confidence,
      )?
    };
    debug!("推理完成，耗时: {:.2?}", now.elapsed());

    nms(&mut items, self.iou);
    items.truncate(self.max_detections);

    debug!("{} 模型检测到 {} 个目标", self.category, items.len());
    Ok(DetectResult { items })
  }
}

/// letterbox 变换参数，用于把模型坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
}

/// 等比缩放并居中填充到 `size` x `size`，输出 NCHW、0~1 的张量
fn letterbox(image: &RgbImage, size: u32) -> (Array4<f32>, Letterbox) {
  let (w, h) = image.dimensions();
  let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
  let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
  let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);
  let pad_x = (size - new_w) / 2;
  let pad_y = (size - new_h) / 2;

  let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

  let size = size as usize;
  let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), YOLOV8_PAD_VALUE);
  for (x, y, pixel) in resized.enumerate_pixels() {
    let tx = (pad_x + x) as usize;
    let ty = (pad_y + y) as usize;
    for c in 0..3 {
      tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
    }
  }

  (
    tensor,
    Letterbox {
      scale,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
    },
  )
}

/// NCHW 输入形状中的边长，动态维度返回 `None`
fn declared_input_size(shape: &[i64]) -> Option<u32> {
  match shape {
    [_, _, h, w, ..] if *h > 0 && *w > 0 => Some(*h as u32),
    _ => None,
  }
}

/// 各检测头网格数之和，640 输入为 8400
fn anchor_count(input_size: u32) -> usize {
  YOLOV8_STRIDES
    .iter()
    .map(|stride| ((input_size / stride) as usize).pow(2))
    .sum()
}

/// 解析 `[1, 4 + classes, anchors]`（或转置后的 `[1, anchors, 4 + classes]`）输出
fn decode_output(
  output: ArrayView3<f32>,
  expected_anchors: usize,
  letterbox: &Letterbox,
  (frame_w, frame_h): (u32, u32),
  category: Category,
  confidence: f32,
) -> Result<Vec<DetectItem>, ModelError> {
  let (_, d1, d2) = output.dim();
  // 类别很多而输入很小时特征数可能多于锚点数，优先按锚点数判断布局
  let features_first = if d2 == expected_anchors {
    true
  } else if d1 == expected_anchors {
    false
  } else {
    d1 < d2
  };
  let (num_feats, num_anchors) = if features_first { (d1, d2) } else { (d2, d1) };

  if num_feats < YOLOV8_MIN_FEATURES {
    return Err(ModelError::UnexpectedShape(format!(
      "{:?}",
      output.shape()
    )));
  }

  let value = |anchor: usize, feat: usize| {
    if features_first {
      output[[0, feat, anchor]]
    } else {
      output[[0, anchor, feat]]
    }
  };

  let (fw, fh) = (frame_w as f32, frame_h as f32);
  let mut items = Vec::new();
  for anchor in 0..num_anchors {
    let (class_id, score) = (YOLOV8_MIN_FEATURES - 1..num_feats)
      .map(|f| (f - 4, value(anchor, f)))
      .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if score < confidence {
      continue;
    }

    let cx = value(anchor, 0);
    let cy = value(anchor, 1);
    let w = value(anchor, 2);
    let h = value(anchor, 3);

    let x_min = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, fw);
    let y_min = ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, fh);
    let x_max = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, fw);
    let y_max = ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, fh);

    if x_max <= x_min || y_max <= y_min {
      continue;
    }

    items.push(DetectItem {
      category,
      class_id: class_id as u32,
      score,
      bbox: [x_min, y_min, x_max, y_max],
    });
  }

  Ok(items)
}

/// 按类别的贪心 NMS，结果按分数降序
fn nms(items: &mut Vec<DetectItem>, iou_thresh: f32) {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut keep: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items.drain(..) {
    let suppressed = keep
      .iter()
      .any(|k| k.class_id == item.class_id && bbox_iou(&k.bbox, &item.bbox) > iou_thresh);
    if !suppressed {
      keep.push(item);
    }
  }
  *items = keep;
}

fn bbox_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  if inter == 0.0 {
    return 0.0;
  }
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  inter / (area_a + area_b - inter)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;
  use ndarray::Array3;
  use rstest::rstest;

  const IDENTITY: Letterbox = Letterbox {
    scale: 1.0,
    pad_x: 0.0,
    pad_y: 0.0,
  };

  fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      category: Category::Object,
      class_id,
      score,
      bbox,
    }
  }

  #[test]
  fn letterbox_pipeline_frame() {
    // 1000x560 -> scale 0.64 -> 640x358, pad_y = 141
    let frame = RgbImage::from_pixel(1000, 560, Rgb([255, 255, 255]));
    let (tensor, lb) = letterbox(&frame, 640);

    assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
    assert!((lb.scale - 0.64).abs() < 1e-6);
    assert_eq!(lb.pad_x, 0.0);
    assert_eq!(lb.pad_y, 141.0);
    assert!((tensor[[0, 0, 0, 0]] - YOLOV8_PAD_VALUE).abs() < 1e-6);
    assert!((tensor[[0, 1, 320, 320]] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn decode_features_major_output() {
    // [1, 4 + 2 classes, 8 anchors]，未填充的锚点分数为 0
    let mut out = Array3::<f32>::zeros((1, 6, 8));
    // anchor 0: class 1 @ 0.8
    for (f, v) in [50.0, 60.0, 20.0, 40.0, 0.1, 0.8].into_iter().enumerate() {
      out[[0, f, 0]] = v;
    }
    // anchor 1: 低于阈值
    for (f, v) in [10.0, 10.0, 4.0, 4.0, 0.3, 0.2].into_iter().enumerate() {
      out[[0, f, 1]] = v;
    }
    // anchor 2: 恰好等于阈值
    for (f, v) in [80.0, 80.0, 10.0, 10.0, 0.5, 0.0].into_iter().enumerate() {
      out[[0, f, 2]] = v;
    }

    let items = decode_output(
      out.view(),
      8,
      &IDENTITY,
      (100, 100),
      Category::Person,
      0.5,
    )
    .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 1);
    assert_eq!(items[0].category, Category::Person);
    assert_eq!(items[0].bbox, [40.0, 40.0, 60.0, 80.0]);
    assert_eq!(items[1].class_id, 0);
    assert_eq!(items[1].score, 0.5);
  }

  #[test]
  fn decode_anchor_major_output_maps_letterbox() {
    // [1, 6 anchors, 5 features]，单类别人脸模型
    let mut out = Array3::<f32>::zeros((1, 6, 5));
    for (f, v) in [320.0, 320.0, 64.0, 64.0, 0.9].into_iter().enumerate() {
      out[[0, 0, f]] = v;
    }
    let lb = Letterbox {
      scale: 0.64,
      pad_x: 0.0,
      pad_y: 141.0,
    };

    let items = decode_output(
      out.view(),
      6,
      &lb,
      (1000, 560),
      Category::Person,
      0.5,
    )
    .unwrap();
    assert_eq!(items.len(), 1);
    let [x1, y1, x2, y2] = items[0].bbox;
    assert!((x1 - 450.0).abs() < 1e-3);
    assert!((x2 - 550.0).abs() < 1e-3);
    assert!((y1 - (288.0 - 141.0) / 0.64).abs() < 1e-3);
    assert!((y2 - (352.0 - 141.0) / 0.64).abs() < 1e-3);
  }

  #[test]
  fn decode_clips_to_frame() {
    let mut out = Array3::<f32>::zeros((1, 5, 8));
    for (f, v) in [5.0, 5.0, 40.0, 40.0, 0.9].into_iter().enumerate() {
      out[[0, f, 0]] = v;
    }
    let items = decode_output(
      out.view(),
      8,
      &IDENTITY,
      (20, 20),
      Category::Object,
      0.5,
    )
    .unwrap();
    assert_eq!(items[0].bbox, [0.0, 0.0, 20.0, 20.0]);
  }

  #[test]
  fn decode_rejects_too_few_features() {
    let out = Array3::<f32>::zeros((1, 4, 100));
    assert!(matches!(
      decode_output(out.view(), 100, &IDENTITY, (10, 10), Category::Object, 0.5),
      Err(ModelError::UnexpectedShape(_))
    ));
  }

  #[test]
  fn nms_suppresses_same_class_only() {
    let mut items = vec![
      item(0, 0.8, [0.0, 0.0, 100.0, 100.0]),
      item(0, 0.9, [2.0, 2.0, 102.0, 102.0]),
      item(1, 0.7, [1.0, 1.0, 101.0, 101.0]),
    ];
    nms(&mut items, 0.7);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].score, 0.9);
    assert_eq!(items[1].class_id, 1);
  }

  #[test]
  fn nms_keeps_disjoint_boxes() {
    let mut items = vec![
      item(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
      item(0, 0.9, [50.0, 50.0, 60.0, 60.0]),
    ];
    nms(&mut items, 0.7);
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].score, 0.9);
  }

  #[test]
  fn iou_of_identical_boxes_is_one() {
    let b = [0.0, 0.0, 10.0, 10.0];
    assert!((bbox_iou(&b, &b) - 1.0).abs() < 1e-6);
    assert_eq!(bbox_iou(&b, &[20.0, 20.0, 30.0, 30.0]), 0.0);
  }

  #[test]
  fn wide_class_head_at_small_input_uses_anchor_count() {
    // 601 类模型在 160 输入下：605 个特征多于 525 个锚点
    let anchors = anchor_count(160);
    assert_eq!(anchors, 525);
    let mut out = Array3::<f32>::zeros((1, 4 + 601, anchors));
    for (f, v) in [80.0, 80.0, 20.0, 20.0].into_iter().enumerate() {
      out[[0, f, 0]] = v;
    }
    out[[0, 4 + 600, 0]] = 0.9;

    let items = decode_output(
      out.view(),
      anchors,
      &IDENTITY,
      (160, 160),
      Category::Object,
      0.5,
    )
    .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 600);
    assert_eq!(items[0].bbox, [70.0, 70.0, 90.0, 90.0]);
  }

  #[test]
  fn anchor_count_for_default_input() {
    assert_eq!(anchor_count(640), 8400);
    assert_eq!(anchor_count(320), 2100);
  }

  #[rstest]
  #[case(&[1, 3, 640, 640], Some(640))]
  #[case(&[1, 3, 320, 320], Some(320))]
  #[case(&[-1, 3, -1, -1], None)]
  #[case(&[1, 3, 640, -1], None)]
  #[case(&[1, 3], None)]
  fn input_size_from_model_shape(#[case] shape: &[i64], #[case] expected: Option<u32>) {
    assert_eq!(declared_input_size(shape), expected);
  }

  #[test]
  fn builder_rejects_foreign_scheme() {
    let url = Url::parse("rknn:models/yolo.rknn").unwrap();
    assert!(matches!(
      Yolov8Builder::from_url(&url),
      Err(ModelError::ModelPathError(_))
    ));
  }

  #[test]
  fn missing_model_file_is_reported() {
    let url = Url::parse("yolov8:does/not/exist.onnx").unwrap();
    let err = Yolov8Builder::from_url(&url).unwrap().build().err();
    assert!(matches!(err, Some(ModelError::ModelNotFound(p)) if p == "does/not/exist.onnx"));
  }
}
