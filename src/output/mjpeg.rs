// 该文件是 Shuanglu （双路） 项目的一部分。
// src/output/mjpeg.rs - JPEG 编码与 multipart 分段
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

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

use crate::frame::Frame;

pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const TAIL: &[u8] = b"\r\n\r\n";

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("JPEG 编码错误: {0}")]
  Jpeg(#[from] image::ImageError),
  #[error("空图像无法编码: {width}x{height}")]
  EmptyImage { width: u32, height: u32 },
}

/// 把一帧编码为图像字节
pub trait EncodeFrame {
  fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct JpegFrameEncoder {
  quality: u8,
}

impl Default for JpegFrameEncoder {
  fn default() -> Self {
    Self::new(DEFAULT_JPEG_QUALITY)
  }
}

impl JpegFrameEncoder {
  /// `quality` 取值 1..=100，超出范围会被钳制
  pub fn new(quality: u8) -> Self {
    Self {
      quality: quality.clamp(1, 100),
    }
  }

  pub fn quality(&self) -> u8 {
    self.quality
  }
}

impl EncodeFrame for JpegFrameEncoder {
  fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = (frame.width(), frame.height());
    if width == 0 || height == 0 {
      return Err(EncodeError::EmptyImage { width, height });
    }

    let mut jpeg = Vec::new();
    let mut enc = JpegEncoder::new_with_quality(&mut jpeg, self.quality);
    enc.encode(frame.image().as_raw(), width, height, ExtendedColorType::Rgb8)?;
    Ok(jpeg)
  }
}

/// 把一张 JPEG 包装成一个 multipart 分段
///
/// ```text
/// --frame\r\n
/// Content-Type: image/jpeg\r\n\r\n
/// <JPEG>\r\n\r\n
/// ```
pub fn multipart_segment(jpeg: &[u8]) -> Vec<u8> {
  let mut part = Vec::with_capacity(HEAD.len() + jpeg.len() + TAIL.len());
  part.extend_from_slice(HEAD);
  part.extend_from_slice(jpeg);
  part.extend_from_slice(TAIL);
  part
}

/// 取出 multipart 分段中的 JPEG；分段格式不符时返回 `None`
pub fn segment_payload(segment: &[u8]) -> Option<&[u8]> {
  segment.strip_prefix(HEAD)?.strip_suffix(TAIL)
}
