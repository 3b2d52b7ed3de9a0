// 该文件是 Shuanglu （双路） 项目的一部分。
// src/frame.rs - RGB 帧定义与拼接
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

use image::{Rgb, RgbImage};
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("Row stride {stride} is smaller than row size {row}")]
  InvalidStride { stride: usize, row: usize },
}

/// 一帧解码后的 RGB 图像（HWC，8 位）
///
/// 标注阶段会原地修改帧内容，编码后即丢弃。
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
  image: RgbImage,
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl Frame {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      image: RgbImage::new(width, height),
    }
  }

  /// 用单一颜色填充的帧，主要用于测试和占位
  pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
    Self {
      image: RgbImage::from_pixel(width, height, Rgb(color)),
    }
  }

  /// 从带行跨度（stride）的 RGB 打包数据构建帧
  pub fn from_rgb_strided(
    width: u32,
    height: u32,
    stride: usize,
    data: &[u8],
  ) -> Result<Self, FrameError> {
    Self::from_packed(width, height, stride, data, false)
  }

  /// 从带行跨度的 BGR 打包数据构建帧，通道顺序会被转换为 RGB
  pub fn from_bgr_strided(
    width: u32,
    height: u32,
    stride: usize,
    data: &[u8],
  ) -> Result<Self, FrameError> {
    Self::from_packed(width, height, stride, data, true)
  }

  fn from_packed(
    width: u32,
    height: u32,
    stride: usize,
    data: &[u8],
    swap_rb: bool,
  ) -> Result<Self, FrameError> {
    let row = width as usize * RGB_CHANNELS;
    if stride < row {
      return Err(FrameError::InvalidStride { stride, row });
    }

    // 最后一行不要求包含填充字节
    let expected = if height == 0 {
      0
    } else {
      stride * (height as usize - 1) + row
    };
    if data.len() < expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    let mut pixels = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
      let line = &data[y * stride..y * stride + row];
      if swap_rb {
        for px in line.chunks_exact(RGB_CHANNELS) {
          pixels.extend_from_slice(&[px[2], px[1], px[0]]);
        }
      } else {
        pixels.extend_from_slice(line);
      }
    }

    let image = RgbImage::from_raw(width, height, pixels).ok_or(FrameError::BufferSizeMismatch {
      expected: row * height as usize,
      actual: data.len(),
    })?;
    Ok(Self { image })
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn image_mut(&mut self) -> &mut RgbImage {
    &mut self.image
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }

  /// 水平拼接两帧：`self` 在左，`right` 在右
  ///
  /// 结果宽度为两帧宽度之和，高度取两帧中较矮者，较高一帧底部多出的行被裁掉。
  pub fn hconcat(&self, right: &Frame) -> Frame {
    let width = self.width() + right.width();
    let height = self.height().min(right.height());

    let mut out = RgbImage::new(width, height);
    image::imageops::replace(&mut out, &self.image, 0, 0);
    image::imageops::replace(&mut out, &right.image, i64::from(self.width()), 0);
    Frame { image: out }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strided_rgb_drops_row_padding() {
    // 2x2 图像，每行 8 字节（6 字节像素 + 2 字节填充）
    let data = [
      1, 2, 3, 4, 5, 6, 0xEE, 0xEE, //
      7, 8, 9, 10, 11, 12,
    ];
    let frame = Frame::from_rgb_strided(2, 2, 8, &data).unwrap();
    assert_eq!(frame.image().get_pixel(1, 0).0, [4, 5, 6]);
    assert_eq!(frame.image().get_pixel(0, 1).0, [7, 8, 9]);
    assert_eq!(frame.image().get_pixel(1, 1).0, [10, 11, 12]);
  }

  #[test]
  fn bgr_is_swapped_to_rgb() {
    let data = [10, 20, 30];
    let frame = Frame::from_bgr_strided(1, 1, 3, &data).unwrap();
    assert_eq!(frame.image().get_pixel(0, 0).0, [30, 20, 10]);
  }

  #[test]
  fn short_buffer_is_rejected() {
    let err = Frame::from_rgb_strided(2, 2, 6, &[0u8; 10]).unwrap_err();
    assert_eq!(
      err,
      FrameError::BufferSizeMismatch {
        expected: 12,
        actual: 10
      }
    );
  }

  #[test]
  fn stride_smaller_than_row_is_rejected() {
    let err = Frame::from_rgb_strided(4, 1, 6, &[0u8; 12]).unwrap_err();
    assert_eq!(err, FrameError::InvalidStride { stride: 6, row: 12 });
  }

  #[test]
  fn hconcat_places_left_then_right() {
    let left = Frame::filled(320, 240, [255, 0, 0]);
    let right = Frame::filled(320, 240, [0, 255, 0]);
    let out = left.hconcat(&right);

    assert_eq!((out.width(), out.height()), (640, 240));
    assert_eq!(out.image().get_pixel(0, 0).0, [255, 0, 0]);
    assert_eq!(out.image().get_pixel(319, 239).0, [255, 0, 0]);
    assert_eq!(out.image().get_pixel(320, 0).0, [0, 255, 0]);
    assert_eq!(out.image().get_pixel(639, 239).0, [0, 255, 0]);
  }

  #[test]
  fn hconcat_crops_to_shorter_height() {
    let left = Frame::filled(4, 6, [1, 1, 1]);
    let right = Frame::filled(2, 3, [2, 2, 2]);
    let out = left.hconcat(&right);

    assert_eq!((out.width(), out.height()), (6, 3));
    assert_eq!(out.image().get_pixel(5, 2).0, [2, 2, 2]);
  }
}
