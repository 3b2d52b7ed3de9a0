// 该文件是 Shuanglu （双路） 项目的一部分。
// src/model.rs - 检测模型接口与类别表
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

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::frame::Frame;

#[cfg(feature = "onnx_detector")]
mod onnx_yolo;
#[cfg(feature = "onnx_detector")]
pub use self::onnx_yolo::{OnnxYolo, OnnxYoloBuilder, OnnxYoloError, YoloParams};

/// 类别名称表中找不到对应编号时使用的名称
pub const UNKNOWN_LABEL: &str = "unknown";

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorbike",
  "aeroplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "sofa",
  "pottedplant",
  "bed",
  "diningtable",
  "toilet",
  "tvmonitor",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 默认关注的类别：person、car、dog
pub const DEFAULT_CLASS_FILTER: [u32; 3] = [0, 2, 16];

/// 检测模型
///
/// 权重在进程启动时加载一次，之后被所有请求共享，因此 `detect` 只借用 `&self`。
pub trait Detector {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, Self::Error>;
}

impl<D: Detector + ?Sized> Detector for Arc<D> {
  type Error = D::Error;

  fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, Self::Error> {
    (**self).detect(frame)
  }
}

/// 边界框，帧像素坐标 [x1, y1, x2, y2]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl BoundingBox {
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  /// 截断为整数像素坐标，截断后退化（x1 >= x2 或 y1 >= y2）时返回 `None`
  pub fn to_pixels(&self) -> Option<(i32, i32, i32, i32)> {
    let (x1, y1, x2, y2) = (
      self.x1 as i32,
      self.y1 as i32,
      self.x2 as i32,
      self.y2 as i32,
    );
    (x1 < x2 && y1 < y2).then_some((x1, y1, x2, y2))
  }

  pub fn area(&self) -> f32 {
    (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
  }

  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x1.max(other.x1);
    let y1 = self.y1.max(other.y1);
    let x2 = self.x2.min(other.x2);
    let y2 = self.y2.min(other.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 一条检测结果，只在产生它的那一帧内有效
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

impl Detection {
  /// 用于显示的置信度：截断（非四舍五入）到两位小数
  pub fn display_confidence(&self) -> String {
    // 在最短十进制表示上截断，避免浮点乘法把 0.29 变成 0.28
    let confidence = if self.confidence.is_nan() {
      0.0
    } else {
      self.confidence.clamp(0.0, 1.0)
    };
    let text = confidence.to_string();
    let (int, frac) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let frac: String = frac.chars().chain(std::iter::repeat('0')).take(2).collect();
    format!("{}.{}", int, frac)
  }
}

/// 关注的类别集合，启动后只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFilter {
  ids: BTreeSet<u32>,
}

impl Default for ClassFilter {
  fn default() -> Self {
    DEFAULT_CLASS_FILTER.into_iter().collect()
  }
}

impl FromIterator<u32> for ClassFilter {
  fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
    Self {
      ids: iter.into_iter().collect(),
    }
  }
}

impl ClassFilter {
  pub fn contains(&self, class_id: u32) -> bool {
    self.ids.contains(&class_id)
  }

  pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
    self.ids.iter().copied()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }
}

/// 按类别编号索引的名称表，启动后只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames {
  names: Box<[String]>,
}

impl Default for ClassNames {
  fn default() -> Self {
    COCO_CLASSES.iter().map(|s| s.to_string()).collect()
  }
}

impl FromIterator<String> for ClassNames {
  fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
    Self {
      names: iter.into_iter().collect(),
    }
  }
}

impl ClassNames {
  /// 查找类别名称，越界编号返回 [`UNKNOWN_LABEL`]
  pub fn name(&self, class_id: u32) -> &str {
    self
      .names
      .get(class_id as usize)
      .map(String::as_str)
      .unwrap_or(UNKNOWN_LABEL)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}

/// 按置信度降序的逐类别非极大值抑制
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
  for det in detections {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) >= iou_threshold);
    if !suppressed {
      kept.push(det);
    }
  }
  kept
}
