// 该文件是 Qianli （千里眼） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;
use url::Url;

/// Qianli 人脸与物体检测推流服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// HTTP 监听地址
  #[arg(long, default_value = "127.0.0.1:5000", value_name = "ADDR")]
  pub bind: SocketAddr,

  /// 人脸模型
  #[arg(
    long,
    default_value = "yolov8:models/yolov8s-face-lindevs.onnx",
    value_name = "MODEL"
  )]
  pub face_model: Url,

  /// 物体模型
  #[arg(
    long,
    default_value = "yolov8:models/yolov8s-oiv7.onnx",
    value_name = "MODEL"
  )]
  pub object_model: Url,

  /// 摄像头，例如 gst://camera/dev/video0?width=1280&height=720
  #[arg(long, default_value = "gst://camera/dev/video0", value_name = "SOURCE")]
  pub camera: Url,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.5, value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = 0.7, value_name = "THRESHOLD")]
  pub iou: f32,

  /// 模型输入边长
  #[arg(long, default_value_t = 640, value_name = "PIXELS")]
  pub input_size: u32,

  /// JPEG 质量 (1 - 100)
  #[arg(long, default_value_t = 95, value_parser = clap::value_parser!(u8).range(1..=100))]
  pub jpeg_quality: u8,

  /// 上传视频的保存目录
  #[arg(long, default_value = "uploads", value_name = "DIR")]
  pub upload_dir: PathBuf,

  /// 上传大小上限（MiB）
  #[arg(long, default_value_t = 512, value_name = "MB")]
  pub max_upload_mb: usize,
}
