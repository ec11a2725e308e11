// 该文件是 Qianli （千里眼） 项目的一部分。
// src/task.rs - 推流会话
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

use std::{sync::Arc, time::Instant};

use image::RgbImage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  frame::fit_frame,
  model::{DetectionStage, Model, ModelError},
  output::{Draw, MjpegEncoder, OutputError},
};

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("检测失败: {0}")]
  Detection(#[from] ModelError),
  #[error("输出失败: {0}")]
  Output(#[from] OutputError),
}

/// 会话状态
///
/// `Idle → Reading → Detecting → Annotating → Encoding → Emitted → Reading …`，
/// 帧源结束、会话被取消或任一步骤失败后进入 `Closed`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Idle,
  Reading,
  Detecting,
  Annotating,
  Encoding,
  Emitted,
  Closed,
}

/// 一帧的完整处理流程：检测、绘制、编码
pub struct StreamTask {
  stage: DetectionStage,
  draw: Draw,
  encoder: MjpegEncoder,
}

impl StreamTask {
  pub fn new(stage: DetectionStage, draw: Draw, encoder: MjpegEncoder) -> Self {
    Self {
      stage,
      draw,
      encoder,
    }
  }

  /// 以 `source` 为帧源打开一个会话
  pub fn session<I>(
    self: &Arc<Self>,
    name: impl Into<String>,
    source: I,
    cancel: CancellationToken,
  ) -> StreamSession<I>
  where
    I: Iterator<Item = RgbImage>,
  {
    let name = name.into();
    info!("会话 {} 开始", name);
    StreamSession {
      name,
      task: Arc::clone(self),
      source,
      cancel,
      state: SessionState::Idle,
      frames: 0,
      started: Instant::now(),
    }
  }
}

/// 单个 HTTP 响应对应的帧循环
///
/// 每次 `next` 读取一帧并产出一个 MJPEG 分块。帧源结束时返回 `None`；
/// 处理失败时产出一次 `Err`，之后会话关闭。
pub struct StreamSession<I> {
  name: String,
  task: Arc<StreamTask>,
  source: I,
  cancel: CancellationToken,
  state: SessionState,
  frames: usize,
  started: Instant,
}

impl<I> StreamSession<I> {
  pub fn state(&self) -> SessionState {
    self.state
  }

  /// 已输出的帧数
  pub fn frames(&self) -> usize {
    self.frames
  }

  fn close(&mut self, reason: &str) {
    if self.state == SessionState::Closed {
      return;
    }
    self.state = SessionState::Closed;
    info!(
      "会话 {} 结束（{}），共输出 {} 帧，耗时 {:.2?}",
      self.name,
      reason,
      self.frames,
      self.started.elapsed()
    );
  }

  fn fail(&mut self, err: SessionError) -> Option<Result<Vec<u8>, SessionError>> {
    error!("会话 {} 在 {:?} 阶段失败: {}", self.name, self.state, err);
    self.close("失败");
    Some(Err(err))
  }
}

impl<I: Iterator<Item = RgbImage>> StreamSession<I> {
  /// 在阻塞线程中把分块逐个送入 `tx`，直到会话结束或接收端关闭
  ///
  /// 通道容量为 1 时，最多只有一帧在等待客户端读取。
  pub fn forward(mut self, tx: mpsc::Sender<Result<Vec<u8>, SessionError>>) -> usize {
    while let Some(chunk) = self.next() {
      if tx.blocking_send(chunk).is_err() {
        warn!("会话 {} 的客户端已断开", self.name);
        self.close("客户端断开");
        break;
      }
    }
    self.frames
  }
}

impl<I: Iterator<Item = RgbImage>> Iterator for StreamSession<I> {
  type Item = Result<Vec<u8>, SessionError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.state == SessionState::Closed {
      return None;
    }

    self.state = SessionState::Reading;
    if self.cancel.is_cancelled() {
      self.close("已取消");
      return None;
    }
    let Some(frame) = self.source.next() else {
      self.close("帧源结束");
      return None;
    };
    let mut frame = fit_frame(frame);

    self.state = SessionState::Detecting;
    let now = Instant::now();
    let result = match self.task.stage.infer(&frame) {
      Ok(result) => result,
      Err(e) => return self.fail(e.into()),
    };
    debug!(
      "会话 {} 第 {} 帧检测到 {} 个目标，耗时: {:.2?}",
      self.name,
      self.frames + 1,
      result.len(),
      now.elapsed()
    );

    self.state = SessionState::Annotating;
    self.task.draw.draw_detections_on_image(&mut frame, &result);

    self.state = SessionState::Encoding;
    let chunk = match self.task.encoder.encode_chunk(&frame) {
      Ok(chunk) => chunk,
      Err(e) => return self.fail(e.into()),
    };

    self.state = SessionState::Emitted;
    self.frames += 1;
    Some(Ok(chunk))
  }
}

impl<I> Drop for StreamSession<I> {
  fn drop(&mut self) {
    self.close("会话释放");
  }
}
