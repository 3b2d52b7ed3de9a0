// 该文件是 Shuanglu （双路） 项目的一部分。
// src/input.rs - 视频帧输入
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

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::frame::Frame;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInputError, GStreamerOpener, GStreamerSource, GStreamerSourceBuilder,
};

/// 打开输入源时请求的分辨率；底层传输不保证严格满足
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

pub const DEFAULT_RESOLUTION: Resolution = Resolution {
  width: 320,
  height: 240,
};

impl fmt::Display for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("Source unavailable: {0}")]
  SourceUnavailable(String),
}

/// 已打开的视频源
///
/// 丢弃即释放底层传输。
pub trait FrameSource {
  /// 阻塞直到解码出下一帧
  ///
  /// 断流、流结束、解码失败都折叠为 `None`，不区分原因。
  fn read(&mut self) -> Option<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn read(&mut self) -> Option<Frame> {
    (**self).read()
  }
}

/// 按定位符打开视频源
pub trait OpenSource {
  type Source: FrameSource;

  fn open(&self, locator: &Url, hint: Resolution) -> Result<Self::Source, InputError>;
}

/// 去掉用户名和密码后的定位符，用于日志
pub fn redact_locator(locator: &Url) -> String {
  let mut redacted = locator.clone();
  if !locator.username().is_empty() || locator.password().is_some() {
    // 无法携带凭据的 URL（如 file://）不会走到这里
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
  }
  redacted.to_string()
}
