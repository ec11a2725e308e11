// 该文件是 Qianli （千里眼） 项目的一部分。
// src/server.rs - HTTP 服务
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

//! HTTP 服务：
//!
//! - `GET /` 控制面板页面
//! - `GET /webcam` 共享摄像头的 MJPEG 流
//! - `POST /upload` 上传视频（表单字段 `video`）并以 MJPEG 流返回检测结果

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use axum::{
  Router,
  body::Body,
  extract::{DefaultBodyLimit, State},
  http::{StatusCode, header},
  response::{Html, IntoResponse, Response},
  routing::{get, post},
};
use axum_extra::extract::{Multipart, multipart::MultipartError};
use image::RgbImage;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
  input::{SharedCamera, open_video_file},
  output::mjpeg::MJPEG_CONTENT_TYPE,
  task::StreamTask,
};

const DASHBOARD_HTML: &str = include_str!("server/dashboard.html");
const VIDEO_FIELD: &str = "video";
const DEFAULT_VIDEO_EXT: &str = "mp4";
const MAX_EXT_LEN: usize = 8;
pub const DEFAULT_MAX_UPLOAD_MB: usize = 512;

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("表单中缺少 `video` 字段")]
  MissingVideoField,
  #[error("表单解析失败: {0}")]
  Multipart(#[from] MultipartError),
  #[error("保存上传文件失败: {0}")]
  UploadWrite(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
  fn into_response(self) -> Response {
    let status = match &self {
      ServerError::MissingVideoField => StatusCode::BAD_REQUEST,
      ServerError::Multipart(e) => e.status(),
      ServerError::UploadWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
      error!("{}", self);
    } else {
      warn!("{}", self);
    }
    (status, self.to_string()).into_response()
  }
}

/// 各请求共享的服务状态
#[derive(Clone)]
pub struct AppState {
  task: Arc<StreamTask>,
  camera: SharedCamera,
  upload_dir: Arc<PathBuf>,
  max_upload_bytes: usize,
  cancel: CancellationToken,
}

impl AppState {
  pub fn new(
    task: StreamTask,
    camera: SharedCamera,
    upload_dir: impl Into<PathBuf>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      task: Arc::new(task),
      camera,
      upload_dir: Arc::new(upload_dir.into()),
      max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
      cancel,
    }
  }

  pub fn with_max_upload_mb(mut self, max_upload_mb: usize) -> Self {
    self.max_upload_bytes = max_upload_mb.saturating_mul(1024 * 1024);
    self
  }
}

pub fn create_app(state: AppState) -> Router {
  let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);
  Router::new()
    .route("/", get(index))
    .route("/webcam", get(webcam))
    .route("/upload", post(upload))
    .layer(body_limit)
    .with_state(state)
}

/// 运行服务直到 `cancel` 被取消
pub async fn serve(
  listener: TcpListener,
  app: Router,
  cancel: CancellationToken,
) -> std::io::Result<()> {
  if let Ok(addr) = listener.local_addr() {
    info!("HTTP 服务监听于 http://{}", addr);
  }
  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      cancel.cancelled().await;
      info!("HTTP 服务开始关闭");
    })
    .await
}

async fn index() -> Html<&'static str> {
  Html(DASHBOARD_HTML)
}

async fn webcam(State(state): State<AppState>) -> Response {
  let camera = state.camera.clone();
  mjpeg_response(&state, "webcam".to_string(), move || camera)
}

async fn upload(
  State(state): State<AppState>,
  mut multipart: Multipart,
) -> Result<Response, ServerError> {
  while let Some(mut field) = multipart.next_field().await? {
    if field.name() != Some(VIDEO_FIELD) {
      continue;
    }

    let path = upload_path(&state.upload_dir, field.file_name());
    let mut file = tokio::fs::File::create(&path).await?;
    let mut size = 0usize;
    while let Some(chunk) = field.chunk().await? {
      size += chunk.len();
      file.write_all(&chunk).await?;
    }
    file.flush().await?;
    info!("上传文件已保存: {} ({} 字节)", path.display(), size);

    let name = format!("upload:{}", path.display());
    return Ok(mjpeg_response(&state, name, move || {
      match open_video_file(&path) {
        Ok(input) => Some(input),
        Err(e) => {
          warn!("无法打开上传的视频 {}: {}", path.display(), e);
          None
        }
      }
      .into_iter()
      .flatten()
    }));
  }

  Err(ServerError::MissingVideoField)
}

/// 在阻塞线程中打开帧源并运行会话，分块经容量为 1 的通道交给响应体
fn mjpeg_response<F, I>(state: &AppState, name: String, open: F) -> Response
where
  F: FnOnce() -> I + Send + 'static,
  I: Iterator<Item = RgbImage>,
{
  let (tx, rx) = mpsc::channel(1);
  let task = Arc::clone(&state.task);
  let cancel = state.cancel.child_token();

  tokio::task::spawn_blocking(move || {
    let source = open();
    task.session(name, source, cancel).forward(tx)
  });

  (
    [
      (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
      (header::CACHE_CONTROL, "no-cache"),
    ],
    Body::from_stream(ReceiverStream::new(rx)),
  )
    .into_response()
}

/// `<upload_dir>/<时间戳>-<uuid>.<扩展名>`，扩展名取自客户端文件名
fn upload_path(upload_dir: &Path, file_name: Option<&str>) -> PathBuf {
  let ext = file_name
    .and_then(|name| Path::new(name).extension())
    .and_then(|ext| ext.to_str())
    .filter(|ext| {
      !ext.is_empty() && ext.len() <= MAX_EXT_LEN && ext.chars().all(|c| c.is_ascii_alphanumeric())
    })
    .map(|ext| ext.to_ascii_lowercase())
    .unwrap_or_else(|| DEFAULT_VIDEO_EXT.to_string());

  upload_dir.join(format!(
    "{}-{}.{}",
    chrono::Local::now().format("%Y%m%d%H%M%S"),
    Uuid::new_v4().simple(),
    ext
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  #[case(Some("clip.MOV"), "mov")]
  #[case(Some("holiday.mkv"), "mkv")]
  #[case(Some("noext"), "mp4")]
  #[case(Some("evil.m p4"), "mp4")]
  #[case(Some("archive.verylongextension"), "mp4")]
  #[case(None, "mp4")]
  fn upload_extension(#[case] file_name: Option<&str>, #[case] ext: &str) {
    let path = upload_path(Path::new("uploads"), file_name);
    assert_eq!(path.parent(), Some(Path::new("uploads")));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some(ext));
  }

  #[test]
  fn upload_paths_are_unique() {
    let a = upload_path(Path::new("uploads"), Some("a.mp4"));
    let b = upload_path(Path::new("uploads"), Some("a.mp4"));
    assert_ne!(a, b);
  }

  #[test]
  fn missing_field_is_bad_request() {
    let response = ServerError::MissingVideoField.into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}
