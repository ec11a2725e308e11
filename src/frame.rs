// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - 帧定义
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

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;

/// 推理与推流使用的帧宽度
pub const FRAME_WIDTH: u32 = 1000;
/// 推理与推流使用的帧高度
pub const FRAME_HEIGHT: u32 = 560;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("Invalid stride {stride} for width {width}")]
  InvalidStride { stride: usize, width: usize },
}

/// 像素通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
  Rgb,
  Bgr,
}

/// 将帧缩放到固定的 1000x560，已是该尺寸的帧原样返回
pub fn fit_frame(image: RgbImage) -> RgbImage {
  if image.dimensions() == (FRAME_WIDTH, FRAME_HEIGHT) {
    return image;
  }
  image::imageops::resize(&image, FRAME_WIDTH, FRAME_HEIGHT, FilterType::Triangle)
}

/// 从按行对齐（带 stride）的打包像素数据构造 RGB 图像
pub fn frame_from_strided(
  data: &[u8],
  width: u32,
  height: u32,
  stride: usize,
  order: ChannelOrder,
) -> Result<RgbImage, FrameError> {
  let width_usize = width as usize;
  let height_usize = height as usize;
  let row_bytes = width_usize * RGB_CHANNELS;

  if stride < row_bytes {
    return Err(FrameError::InvalidStride {
      stride,
      width: width_usize,
    });
  }

  // 最后一行不需要包含填充
  let expected = if height_usize == 0 {
    0
  } else {
    stride * (height_usize - 1) + row_bytes
  };
  if data.len() < expected {
    return Err(FrameError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row_bytes * height_usize);
  for y in 0..height_usize {
    let row = &data[y * stride..y * stride + row_bytes];
    match order {
      ChannelOrder::Rgb => pixels.extend_from_slice(row),
      ChannelOrder::Bgr => {
        for px in row.chunks_exact(RGB_CHANNELS) {
          pixels.extend_from_slice(&[px[2], px[1], px[0]]);
        }
      }
    }
  }

  RgbImage::from_raw(width, height, pixels).ok_or(FrameError::BufferSizeMismatch {
    expected: row_bytes * height_usize,
    actual: 0,
  })
}
