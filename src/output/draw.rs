// 该文件是 Shuanglu （双路） 项目的一部分。
// src/output/draw.rs - 目标检测结果标注
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

use ab_glyph::{FontRef, InvalidFont, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::{
  frame::Frame,
  model::{ClassFilter, ClassNames, Detection},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const BOX_THICKNESS: i32 = 3;
const BOX_COLOR: [u8; 3] = [255, 0, 255]; // 品红
const LABEL_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色

static FONT_DATA: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum AnnotateError {
  #[error("无法加载嵌入的字体文件: {0}")]
  InvalidFont(#[from] InvalidFont),
}

/// 在帧上绘制检测框和类别标签
pub struct Annotator {
  font: FontRef<'static>,
  font_size: f32,
  box_thickness: i32,
  box_color: [u8; 3],
  label_color: [u8; 3],
}

impl Annotator {
  pub fn new() -> Result<Self, AnnotateError> {
    let font = FontRef::try_from_slice(FONT_DATA)?;
    Ok(Self {
      font,
      font_size: LABEL_FONT_SIZE,
      box_thickness: BOX_THICKNESS,
      box_color: BOX_COLOR,
      label_color: LABEL_COLOR,
    })
  }

  /// 标注一帧并原样返回
  ///
  /// 只绘制类别在 `filter` 中的检测，其他检测直接忽略。
  pub fn annotate(
    &self,
    mut frame: Frame,
    detections: &[Detection],
    filter: &ClassFilter,
    names: &ClassNames,
  ) -> Frame {
    for det in detections.iter().filter(|d| filter.contains(d.class_id)) {
      self.draw_detection(frame.image_mut(), det, &label_text(det, names));
    }
    frame
  }

  fn draw_detection(&self, image: &mut RgbImage, det: &Detection, label: &str) {
    let Some((x1, y1, x2, y2)) = det.bbox.to_pixels() else {
      return;
    };

    // 标签锚定在框左上角，位于上边框之上；空间不足时贴着图像顶部。
    // 先画标签再画框，标签与框重叠时框线保持完整
    let scale = PxScale::from(self.font_size);
    let (_, text_height) = text_size(scale, &self.font, label);
    let text_y = (y1 - text_height as i32).max(0);
    draw_text_mut(
      image,
      Rgb(self.label_color),
      x1.max(0),
      text_y,
      scale,
      &self.font,
      label,
    );

    // 边框向内加粗
    for t in 0..self.box_thickness {
      let (w, h) = (x2 - x1 - 2 * t, y2 - y1 - 2 * t);
      if w <= 0 || h <= 0 {
        break;
      }
      let rect = Rect::at(x1 + t, y1 + t).of_size(w as u32 + 1, h as u32 + 1);
      draw_hollow_rect_mut(image, rect, Rgb(self.box_color));
    }
  }
}

/// 标签文本：`"<类别名> <置信度>"`
pub fn label_text(det: &Detection, names: &ClassNames) -> String {
  format!("{} {}", names.name(det.class_id), det.display_confidence())
}
