// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/mjpeg.rs - MJPEG 分块编码
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

//! 每帧编码为一个 `multipart/x-mixed-replace` 分块：
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <JPEG>\r\n
//! ```

use image::{RgbImage, codecs::jpeg::JpegEncoder};

use crate::output::OutputError;

pub const BOUNDARY: &str = "frame";
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

const CHUNK_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const CHUNK_TRAILER: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy)]
pub struct MjpegEncoder {
  quality: u8,
}

impl Default for MjpegEncoder {
  fn default() -> Self {
    Self::new(DEFAULT_JPEG_QUALITY)
  }
}

impl MjpegEncoder {
  pub fn new(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }

  pub fn quality(&self) -> u8 {
    self.quality
  }

  pub fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>, OutputError> {
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode_image(image)?;
    Ok(jpeg)
  }

  /// 编码一帧并加上分块头尾
  pub fn encode_chunk(&self, image: &RgbImage) -> Result<Vec<u8>, OutputError> {
    let jpeg = self.encode_jpeg(image)?;

    let mut chunk = Vec::with_capacity(CHUNK_HEADER.len() + jpeg.len() + CHUNK_TRAILER.len());
    chunk.extend_from_slice(CHUNK_HEADER);
    chunk.extend_from_slice(&jpeg);
    chunk.extend_from_slice(CHUNK_TRAILER);
    Ok(chunk)
  }
}
