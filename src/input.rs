// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input.rs - 视频输入
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

use std::{
  path::Path,
  sync::{Arc, Mutex},
};

use image::RgbImage;
use thiserror::Error;
use tracing::error;

use crate::{FromUrl, FromUrlWithScheme};

mod gstreamer_input;
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder, SourceKind,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

/// 帧源：逐帧产出 RGB 图像，`None` 表示流结束（包括读取失败）
pub trait FrameSource: Iterator<Item = RgbImage> + Send {}

impl<T: Iterator<Item = RgbImage> + Send> FrameSource for T {}

/// 按 URL 打开输入源并启动管道
pub fn open_input(url: &url::Url) -> Result<GStreamerInput, InputError> {
  if url.scheme() != GStreamerInputPipelineBuilder::SCHEME {
    return Err(InputError::SchemeMismatch(url.scheme().to_string()));
  }
  Ok(GStreamerInputPipelineBuilder::from_url(url)?.build()?)
}

/// 打开已落盘的视频文件
pub fn open_video_file(path: &Path) -> Result<GStreamerInput, InputError> {
  let input = GStreamerInputPipelineBuilder::new()
    .file(path.to_string_lossy())
    .target_format("RGB")
    .build()?;
  Ok(input)
}

/// 进程内共享的摄像头
///
/// 摄像头在启动时打开一次，所有 `/webcam` 会话共用同一个句柄。
/// 每次取帧只持有一帧时间的锁，因此并发会话之间会交错取帧。
/// 设备停止出帧又不报错时，持锁的读取会一直等待，所有 `/webcam` 会话随之阻塞；
/// 给摄像头设置 [`GStreamerInput::with_cancel`] 后，取消令牌可以结束这次等待。
#[derive(Clone)]
pub struct SharedCamera {
  inner: Arc<Mutex<Box<dyn FrameSource>>>,
}

impl SharedCamera {
  pub fn new<S: FrameSource + 'static>(source: S) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Box::new(source))),
    }
  }
}

impl Iterator for SharedCamera {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    match self.inner.lock() {
      Ok(mut camera) => camera.next(),
      Err(_) => {
        error!("摄像头锁已被污染，结束会话");
        None
      }
    }
  }
}
