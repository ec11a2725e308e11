// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 摄像头与视频文件都通过 GStreamer 管道读取，管道末端为 `appsink`，
//! 输出统一转换为 RGB。
//!
//! ## URL 格式
//!
//! - 摄像头：`gst://camera/dev/video0?width=1280&height=720&fps=30&format=YUY2`
//! - 文件：`gst://file/path/to/video.mp4`
//!
//! 两者都支持 `rotate=0|90|180|270` 参数。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use qianli::{FromUrl, input::GStreamerInputPipelineBuilder};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/tmp/video.mp4")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.build()?;
//!
//! for frame in input {
//!     println!("处理帧: {}x{}", frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## 安全性注意
//!
//! 文件路径会被转义后拼入管道描述，其余参数只接受数字或固定取值。

use std::collections::HashMap;

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  frame::{ChannelOrder, FrameError, frame_from_strided},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// 每次轮询 appsink 的等待时间
const PULL_TIMEOUT_MS: u64 = 100;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// URI 主机既不是 camera 也不是 file
  #[error("Unknown source kind: {0}")]
  UnknownSource(String),
  /// 管道中没有数据源
  #[error("Pipeline has no source element")]
  MissingSource,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format: {0}")]
  UnsupportedFormat(String),
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 帧数据错误
  #[error("Frame error: {0}")]
  FrameError(#[from] FrameError),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

/// 数据源类型，决定 appsink 的缓冲策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
  /// 实时摄像头：丢弃过期帧
  Camera,
  /// 视频文件：逐帧解码，不丢帧
  File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
  },
  TargetFormat {
    format: String,
  },
  VideoFlip {
    method: u32,
    direction: u32,
  },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", quote(path))
      }
      GStreamerInputBuilderItem::CameraSource {
        camera,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let mut desc = format!("v4l2src device={}", quote(camera));
        if let Some(mode) = io_mode {
          desc.push_str(&format!(" io-mode={}", mode));
        }

        let mut caps = Vec::new();
        if let Some(format) = format {
          caps.push(format!("format={}", format));
        }
        if let Some(width) = width {
          caps.push(format!("width={}", width));
        }
        if let Some(height) = height {
          caps.push(format!("height={}", height));
        }
        if let Some(fps) = fps {
          caps.push(format!("framerate={}/1", fps));
        }
        if !caps.is_empty() {
          desc.push_str(&format!(" ! video/x-raw,{}", caps.join(",")));
        }
        desc
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
    }
  }
}

/// 为管道描述中的字符串属性加引号
fn quote(value: &str) -> String {
  let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
  format!("\"{}\"", escaped)
}

/// GStreamer 输入管道构建器
///
/// ```no_run
/// use qianli::input::GStreamerInputPipelineBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let input = GStreamerInputPipelineBuilder::new()
///     .camera("/dev/video0")
///     .target_format("RGB")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
  kind: Option<SourceKind>,
}

impl GStreamerInputPipelineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// 使用视频文件作为数据源
  pub fn file(mut self, path: impl Into<String>) -> Self {
    self
      .items
      .push(GStreamerInputBuilderItem::FileSource(path.into()));
    self.kind = Some(SourceKind::File);
    self
  }

  /// 使用 V4L2 摄像头作为数据源，采集格式由设备协商
  pub fn camera(mut self, device: impl Into<String>) -> Self {
    self.items.push(GStreamerInputBuilderItem::CameraSource {
      camera: device.into(),
      io_mode: None,
      format: None,
      width: None,
      height: None,
      fps: None,
    });
    self.kind = Some(SourceKind::Camera);
    self
  }

  pub fn target_format(mut self, format: impl Into<String>) -> Self {
    self.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: format.into(),
    });
    self
  }

  fn build_camera_pipeline(path: &str, query: &HashMap<String, String>) -> Self {
    let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u32>().ok());

    let mut builder = Self::new();
    builder.items.push(GStreamerInputBuilderItem::CameraSource {
      camera: path.to_string(),
      io_mode: parse("io-mode"),
      format: query
        .get("format")
        .filter(|f| f.chars().all(|c| c.is_ascii_alphanumeric()))
        .cloned(),
      width: parse("width"),
      height: parse("height"),
      fps: parse("fps"),
    });
    builder.kind = Some(SourceKind::Camera);
    builder
  }

  fn build_file_pipeline(path: &str) -> Self {
    Self::new().file(path)
  }

  fn video_flip(rotate: Option<&str>) -> Option<GStreamerInputBuilderItem> {
    let (method, direction) = match rotate? {
      "0" => return None,
      "90" => (1, 1),
      "180" => (2, 2),
      "270" => (3, 3),
      other => {
        warn!("忽略无效的旋转角度: {}", other);
        return None;
      }
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method, direction })
  }

  /// 完整的管道描述
  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let sink = match self.kind {
      Some(SourceKind::Camera) => "appsink name=sink sync=false max-buffers=2 drop=true",
      _ => "appsink name=sink sync=false max-buffers=2 drop=false",
    };
    format!("{} ! {}", basic_pipeline, sink)
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    let kind = self.kind.ok_or(GStreamerInputError::MissingSource)?;

    gst::init()?;

    let full_pipeline = self.description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
      let _ = pipeline.set_state(gst::State::Null);
      return Err(e.into());
    }

    Ok(GStreamerInput {
      pipeline,
      appsink,
      kind,
      cancel: None,
      frames: 0,
      finished: false,
    })
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let path = decoded_path(url);
    let mut builder = match url.host_str() {
      Some("camera") => Self::build_camera_pipeline(&path, &query),
      Some("file") => Self::build_file_pipeline(&path),
      other => {
        return Err(GStreamerInputError::UnknownSource(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    if let Some(flip) = Self::video_flip(query.get("rotate").map(|s| s.as_ref())) {
      builder.items.push(flip);
    }

    builder.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: "RGB".to_string(),
    });

    Ok(builder)
  }
}

/// GStreamer 视频输入
///
/// 以迭代器形式逐帧输出 RGB 图像。读取失败或到达流末尾时返回 `None`，
/// 之后不再产出帧。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  kind: SourceKind,
  cancel: Option<CancellationToken>,
  frames: u64,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  pub fn kind(&self) -> SourceKind {
    self.kind
  }

  /// 取消后，正在等待的读取在下一次轮询时结束
  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = Some(cancel);
    self
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    loop {
      if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
        info!("输入已取消，共 {} 帧", self.frames);
        return None;
      }

      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
      {
        return Some(sample);
      }

      if self.appsink.is_eos() {
        info!("输入流结束，共 {} 帧", self.frames);
        return None;
      }

      // 上游出错时 appsink 不会收到 EOS，需要主动检查总线
      if let Some(bus) = self.pipeline.bus() {
        while let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
          if let gst::MessageView::Error(err) = msg.view() {
            error!(
              "GStreamer pipeline error: {} ({})",
              err.error(),
              err.debug().map(|d| d.to_string()).unwrap_or_default()
            );
            return None;
          }
        }
      }
    }
  }
}

impl Iterator for GStreamerInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }

    let frame = self.pull_sample().and_then(|sample| {
      convert_sample_to_rgb(&sample)
        .map_err(|e| {
          error!("Failed to fetch sample: {}", e);
          e
        })
        .ok()
    });

    match frame {
      Some(frame) => {
        self.frames += 1;
        debug!("读取第 {} 帧", self.frames);
        Some(frame)
      }
      None => {
        self.finished = true;
        None
      }
    }
  }
}

fn convert_sample_to_rgb(sample: &gst::Sample) -> Result<RgbImage, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let order = match video_info.format() {
    gst_video::VideoFormat::Rgb => ChannelOrder::Rgb,
    gst_video::VideoFormat::Bgr => ChannelOrder::Bgr,
    other => return Err(GStreamerInputError::UnsupportedFormat(format!("{:?}", other))),
  };

  let stride = video_info
    .stride()
    .first()
    .copied()
    .unwrap_or((video_info.width() * 3) as i32)
    .max(0) as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;

  let image = frame_from_strided(
    map.as_slice(),
    video_info.width(),
    video_info.height(),
    stride,
    order,
  )?;
  Ok(image)
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;
  use std::path::Path;

  /// 用 videotestsrc 写出一段 320x240 的 MJPEG/AVI 视频
  fn write_test_clip(path: &Path, frames: u32) {
    gst::init().unwrap();
    let description = format!(
      "videotestsrc num-buffers={} pattern=black ! \
       video/x-raw,width=320,height=240,framerate=10/1 ! jpegenc ! avimux ! filesink location={}",
      frames,
      quote(&path.to_string_lossy())
    );
    let pipeline = gst::parse::launch(&description).unwrap();
    pipeline.set_state(gst::State::Playing).unwrap();
    let msg = pipeline
      .bus()
      .unwrap()
      .timed_pop_filtered(
        gst::ClockTime::from_seconds(10),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      )
      .expect("写入测试视频超时");
    pipeline.set_state(gst::State::Null).unwrap();
    assert!(matches!(msg.view(), gst::MessageView::Eos(_)));
  }

  #[test]
  fn file_source_decodes_every_frame_then_ends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.avi");
    write_test_clip(&path, 3);

    let mut input = crate::input::open_video_file(&path).unwrap();
    assert_eq!(input.kind(), SourceKind::File);

    for _ in 0..3 {
      let frame = input.next().expect("缺少视频帧");
      assert_eq!(frame.dimensions(), (320, 240));
      let pixel = frame.get_pixel(160, 120);
      assert!(pixel.0.iter().all(|&c| c < 40), "{:?}", pixel);
    }
    assert!(input.next().is_none());
    assert!(input.next().is_none());
  }

  #[test]
  fn cancelled_input_stops_reading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.avi");
    write_test_clip(&path, 3);

    let cancel = CancellationToken::new();
    let mut input = crate::input::open_video_file(&path)
      .unwrap()
      .with_cancel(cancel.clone());
    assert!(input.next().is_some());
    cancel.cancel();
    assert!(input.next().is_none());
  }

  #[test]
  fn camera_url_without_caps() {
    let url = Url::parse("gst://camera/dev/video0").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "v4l2src device=\"/dev/video0\" ! videoconvert ! video/x-raw,format=RGB \
       ! appsink name=sink sync=false max-buffers=2 drop=true"
    );
  }

  #[test]
  fn camera_url_with_caps() {
    let url =
      Url::parse("gst://camera/dev/video2?width=1280&height=720&fps=30&format=YUY2&io-mode=2")
        .unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert!(builder.description().starts_with(
      "v4l2src device=\"/dev/video2\" io-mode=2 ! \
       video/x-raw,format=YUY2,width=1280,height=720,framerate=30/1 ! "
    ));
  }

  #[test]
  fn file_url_keeps_every_frame() {
    let url = Url::parse("gst://file/tmp/clip%20one.mp4").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "filesrc location=\"/tmp/clip one.mp4\" ! decodebin ! videoconvert ! \
       video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=2 drop=false"
    );
  }

  #[rstest]
  #[case("90", Some("videoflip method=1 video-direction=1"))]
  #[case("180", Some("videoflip method=2 video-direction=2"))]
  #[case("270", Some("videoflip method=3 video-direction=3"))]
  #[case("0", None)]
  #[case("45", None)]
  fn rotation_inserts_videoflip(#[case] rotate: &str, #[case] expected: Option<&str>) {
    let url = Url::parse(&format!("gst://file/a.mp4?rotate={}", rotate)).unwrap();
    let description = GStreamerInputPipelineBuilder::from_url(&url)
      .unwrap()
      .description();
    match expected {
      Some(flip) => assert!(description.contains(flip)),
      None => assert!(!description.contains("videoflip")),
    }
  }

  #[test]
  fn unknown_host_is_rejected() {
    let url = Url::parse("gst://screen/0").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::UnknownSource(host)) if host == "screen"
    ));
  }

  #[test]
  fn wrong_scheme_is_rejected() {
    let url = Url::parse("file:///tmp/a.mp4").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::SchemeMismatch)
    ));
  }

  #[test]
  fn quotes_are_escaped_in_locations() {
    assert_eq!(quote("a\"b"), "\"a\\\"b\"");
  }

  #[test]
  fn builder_without_source_fails() {
    assert!(matches!(
      GStreamerInputPipelineBuilder::new().target_format("RGB").build(),
      Err(GStreamerInputError::MissingSource)
    ));
  }
}
