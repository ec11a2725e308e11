// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};

use crate::{
  model::{Category, DetectItem, DetectResult},
  output::OutputError,
};

const LABEL_FONT_SIZE: f32 = 20.0;
/// 标签文字顶部相对框顶部的偏移
const LABEL_OFFSET_Y: i32 = 30;
const PERSON_COLOR: Rgb<u8> = Rgb([0, 255, 0]); // 绿色
const OBJECT_COLOR: Rgb<u8> = Rgb([255, 165, 0]); // 橙色

/// 各类别的框与标签颜色
pub fn category_color(category: Category) -> Rgb<u8> {
  match category {
    Category::Person => PERSON_COLOR,
    Category::Object => OBJECT_COLOR,
  }
}

/// 标签文本，例如 `Person | 87.3%`
pub fn label_text(item: &DetectItem) -> String {
  format!("{} | {:.1}%", item.category, item.score * 100.0)
}

pub struct Draw {
  font: FontArc,
  font_scale: PxScale,
}

impl Draw {
  pub fn new() -> Result<Self, OutputError> {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    let font =
      FontArc::try_from_slice(font_data).map_err(|e| OutputError::FontError(e.to_string()))?;

    Ok(Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
    })
  }

  /// 在图像上原地绘制检测结果；结果为空时图像保持不变
  pub fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in &result.items {
      self.draw_item(image, item);
    }
  }

  fn draw_item(&self, image: &mut RgbImage, item: &DetectItem) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = category_color(item.category);
    let width = (x_max - x_min + 1) as u32;
    let height = (y_max - y_min + 1) as u32;

    // 边框加粗为 2 像素
    draw_hollow_rect_mut(image, Rect::at(x_min, y_min).of_size(width, height), color);
    if width > 2 && height > 2 {
      let inner = Rect::at(x_min + 1, y_min + 1).of_size(width - 2, height - 2);
      draw_hollow_rect_mut(image, inner, color);
    }

    let label = label_text(item);
    let text_y = (y_min - LABEL_OFFSET_Y).max(0);
    draw_text_mut(
      image,
      color,
      x_min,
      text_y,
      self.font_scale,
      &self.font,
      &label,
    );
  }
}
