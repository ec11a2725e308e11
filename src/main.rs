// 该文件是 Qianli （千里眼） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::{thread, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use qianli::{
  FromUrl,
  input::{SharedCamera, open_input},
  model::{Category, DetectionStage, Detector, Yolov8Builder},
  output::{Draw, MjpegEncoder},
  server::{AppState, create_app, serve},
  task::StreamTask,
};

use crate::args::Args;

const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

fn load_model(url: &Url, category: Category, args: &Args) -> Result<Detector> {
  let model = Yolov8Builder::from_url(url)?
    .category(category)
    .confidence(args.confidence)
    .iou(args.iou)
    .input_size(args.input_size)
    .build()
    .with_context(|| format!("无法加载{}模型 {}", category, url))?;
  Ok(Box::new(model))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("监听地址: {}", args.bind);
  info!("人脸模型: {}", args.face_model);
  info!("物体模型: {}", args.object_model);
  info!("摄像头: {}", args.camera);
  info!("置信度阈值: {}", args.confidence);
  info!("NMS 阈值: {}", args.iou);
  info!("JPEG 质量: {}", args.jpeg_quality);
  info!("上传目录: {}", args.upload_dir.display());

  let face = load_model(&args.face_model, Category::Person, &args)?;
  let object = load_model(&args.object_model, Category::Object, &args)?;
  let stage = DetectionStage::new(face, object, args.confidence);

  let cancel = CancellationToken::new();

  let camera = open_input(&args.camera)
    .with_context(|| format!("无法打开摄像头 {}", args.camera))?
    .with_cancel(cancel.clone());
  info!("摄像头已打开: {} ({:?})", args.camera, camera.kind());

  std::fs::create_dir_all(&args.upload_dir)
    .with_context(|| format!("无法创建上传目录 {}", args.upload_dir.display()))?;

  let signal = cancel.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    signal.cancel();
    thread::spawn(|| {
      thread::sleep(FORCE_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .context("无法设置 Ctrl-C 处理函数")?;

  let task = StreamTask::new(stage, Draw::new()?, MjpegEncoder::new(args.jpeg_quality));
  let state = AppState::new(
    task,
    SharedCamera::new(camera),
    args.upload_dir.clone(),
    cancel.clone(),
  )
  .with_max_upload_mb(args.max_upload_mb);

  let runtime = tokio::runtime::Runtime::new()?;
  runtime.block_on(async {
    let listener = tokio::net::TcpListener::bind(args.bind)
      .await
      .with_context(|| format!("无法监听 {}", args.bind))?;
    serve(listener, create_app(state), cancel).await?;
    Ok::<_, anyhow::Error>(())
  })?;

  info!("服务已退出");
  Ok(())
}
