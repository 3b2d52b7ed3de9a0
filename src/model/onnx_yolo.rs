// 该文件是 Shuanglu （双路） 项目的一部分。
// src/model/onnx_yolo.rs - 基于 ONNX Runtime 的 YOLOv8 检测器
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

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::imageops::FilterType;
use ndarray::ArrayView2;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::{Tensor, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::Frame,
  model::{BoundingBox, Detection, Detector, non_max_suppression},
};

/// YOLOv8 输出中边界框占用的通道数（cx, cy, w, h）
const YOLO_BOX_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum OnnxYoloError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("ONNX Runtime 错误: {0}")]
  OrtError(#[from] ort::Error),
  #[error("输出形状错误: {0}")]
  ShapeError(#[from] ndarray::ShapeError),
  #[error("模型输出不符合预期: {0}")]
  UnexpectedOutput(String),
  #[error("推理会话锁已损坏")]
  SessionPoisoned,
}

/// YOLO 推理参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloParams {
  /// 模型输入边长，通常为 640
  pub input_size: u32,
  pub conf_threshold: f32,
  pub iou_threshold: f32,
  pub max_detections: usize,
}

impl Default for YoloParams {
  fn default() -> Self {
    Self {
      input_size: 640,
      conf_threshold: 0.25,
      iou_threshold: 0.45,
      max_detections: 100,
    }
  }
}

pub struct OnnxYoloBuilder {
  model_path: PathBuf,
  params: YoloParams,
  intra_threads: usize,
}

impl OnnxYoloBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      params: YoloParams::default(),
      intra_threads: 4,
    }
  }

  pub fn params(mut self, params: YoloParams) -> Self {
    self.params = params;
    self
  }

  pub fn intra_threads(mut self, threads: usize) -> Self {
    self.intra_threads = threads;
    self
  }

  pub fn build(self) -> Result<OnnxYolo, OnnxYoloError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_bytes = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_bytes.len() as f64 / (1024.0 * 1024.0)
    );

    let session = Session::builder()?
      .with_optimization_level(GraphOptimizationLevel::Level3)?
      .with_intra_threads(self.intra_threads)?
      .commit_from_memory(&model_bytes)?;
    info!("模型加载完成");

    Ok(OnnxYolo {
      session: Mutex::new(session),
      params: self.params,
    })
  }
}

/// YOLOv8 ONNX 检测器
///
/// ONNX Runtime 的会话推理需要 `&mut`，并发请求通过互斥锁串行使用同一会话。
pub struct OnnxYolo {
  session: Mutex<Session>,
  params: YoloParams,
}

impl OnnxYolo {
  pub fn params(&self) -> &YoloParams {
    &self.params
  }

  /// 缩放到模型输入尺寸，归一化到 [0, 1]，HWC -> NCHW
  fn preprocess(&self, frame: &Frame) -> Result<Value, OnnxYoloError> {
    let size = self.params.input_size;
    let resized = image::imageops::resize(frame.image(), size, size, FilterType::Triangle);

    let (w, h) = (size as usize, size as usize);
    let mut chw = vec![0f32; 3 * h * w];
    for (x, y, pixel) in resized.enumerate_pixels() {
      let idx = y as usize * w + x as usize;
      for c in 0..3 {
        chw[c * h * w + idx] = f32::from(pixel[c]) / 255.0;
      }
    }

    let tensor = Tensor::from_array((vec![1usize, 3, h, w], chw.into_boxed_slice()))?;
    Ok(Value::from(tensor))
  }
}

impl Detector for OnnxYolo {
  type Error = OnnxYoloError;

  fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, Self::Error> {
    let input = self.preprocess(frame)?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| OnnxYoloError::SessionPoisoned)?;
    let outputs = session.run(ort::inputs![input])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

    // YOLOv8 输出形状: [1, 4 + 类别数, 候选数]
    let (channels, candidates) = match dims.as_slice() {
      [1, c, n] if *c > YOLO_BOX_CHANNELS => (*c, *n),
      _ => {
        return Err(OnnxYoloError::UnexpectedOutput(format!(
          "期望形状 [1, 4+C, N]，实际为 {:?}",
          dims
        )));
      }
    };
    let view = ArrayView2::from_shape((channels, candidates), data)?;

    let detections = decode_predictions(view, frame.width(), frame.height(), &self.params);
    debug!("检测到 {} 个目标", detections.len());
    Ok(detections)
  }
}

/// 解码 `[4 + C, N]` 的预测矩阵，坐标换算回原始帧尺寸并裁剪到帧内
pub(crate) fn decode_predictions(
  view: ArrayView2<'_, f32>,
  frame_width: u32,
  frame_height: u32,
  params: &YoloParams,
) -> Vec<Detection> {
  let input_size = params.input_size as f32;
  let sx = frame_width as f32 / input_size;
  let sy = frame_height as f32 / input_size;
  let (max_x, max_y) = (frame_width as f32, frame_height as f32);

  let mut candidates = Vec::new();
  for column in view.columns() {
    let best = column
      .iter()
      .skip(YOLO_BOX_CHANNELS)
      .copied()
      .enumerate()
      .max_by(|(_, a), (_, b)| a.total_cmp(b));

    let Some((class_id, score)) = best else {
      continue;
    };
    if score <= params.conf_threshold {
      continue;
    }

    let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
    candidates.push(Detection {
      class_id: class_id as u32,
      confidence: score.clamp(0.0, 1.0),
      bbox: BoundingBox::new(
        ((cx - w / 2.0) * sx).clamp(0.0, max_x),
        ((cy - h / 2.0) * sy).clamp(0.0, max_y),
        ((cx + w / 2.0) * sx).clamp(0.0, max_x),
        ((cy + h / 2.0) * sy).clamp(0.0, max_y),
      ),
    });
  }

  let mut kept = non_max_suppression(candidates, params.iou_threshold);
  kept.truncate(params.max_detections);
  kept
}
