// 该文件是 Shuanglu （双路） 项目的一部分。
// src/config.rs - 启动时构建的只读配置
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
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
  args::StreamArgs,
  input::Resolution,
  model::{ClassFilter, ClassNames},
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取类别表 {}: {source}", .path.display())]
  LabelFileIo {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("类别表格式错误: {0}")]
  LabelFileFormat(#[from] toml::de::Error),
  #[error("类别表为空")]
  EmptyLabels,
  #[error("无效的分辨率: {0}")]
  InvalidResolution(Resolution),
  #[error("{name} 必须在 0.0 到 1.0 之间，实际为 {value}")]
  InvalidThreshold { name: &'static str, value: f32 },
  #[error("JPEG 质量必须在 1 到 100 之间，实际为 {0}")]
  InvalidJpegQuality(u8),
}

#[derive(Deserialize)]
struct LabelFile {
  labels: Vec<String>,
}

/// 从 TOML 文本解析类别名称表
pub fn parse_labels(text: &str) -> Result<ClassNames, ConfigError> {
  let file: LabelFile = toml::from_str(text)?;
  if file.labels.is_empty() {
    return Err(ConfigError::EmptyLabels);
  }
  Ok(file.labels.into_iter().collect())
}

pub fn load_labels(path: &Path) -> Result<ClassNames, ConfigError> {
  let text = std::fs::read_to_string(path).map_err(|source| ConfigError::LabelFileIo {
    path: path.to_path_buf(),
    source,
  })?;
  parse_labels(&text)
}

/// 每个请求的合成流水线共享的只读设置
#[derive(Debug, Clone)]
pub struct PipelineSettings {
  pub left: Url,
  pub right: Url,
  pub resolution: Resolution,
  pub class_filter: ClassFilter,
  pub class_names: ClassNames,
  pub jpeg_quality: u8,
}

/// 检测模型设置
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
  pub model_path: PathBuf,
  pub input_size: u32,
  pub conf_threshold: f32,
  pub iou_threshold: f32,
  pub max_detections: usize,
}

#[cfg(feature = "onnx_detector")]
impl DetectorSettings {
  pub fn yolo_params(&self) -> crate::model::YoloParams {
    crate::model::YoloParams {
      input_size: self.input_size,
      conf_threshold: self.conf_threshold,
      iou_threshold: self.iou_threshold,
      max_detections: self.max_detections,
    }
  }

  pub fn load(&self) -> Result<crate::model::OnnxYolo, crate::model::OnnxYoloError> {
    crate::model::OnnxYoloBuilder::new(&self.model_path)
      .params(self.yolo_params())
      .build()
  }
}

/// 进程启动时构建一次的配置
#[derive(Debug, Clone)]
pub struct StreamConfig {
  pub pipeline: Arc<PipelineSettings>,
  pub detector: DetectorSettings,
  pub open_timeout: Duration,
}

impl StreamConfig {
  pub fn from_args(args: &StreamArgs) -> Result<Self, ConfigError> {
    let resolution = Resolution {
      width: args.width,
      height: args.height,
    };
    if resolution.width == 0 || resolution.height == 0 {
      return Err(ConfigError::InvalidResolution(resolution));
    }
    check_threshold("confidence", args.confidence)?;
    check_threshold("nms-threshold", args.nms_threshold)?;
    if !(1..=100).contains(&args.jpeg_quality) {
      return Err(ConfigError::InvalidJpegQuality(args.jpeg_quality));
    }

    let class_names = match &args.labels {
      Some(path) => load_labels(path)?,
      None => ClassNames::default(),
    };
    let class_filter: ClassFilter = args.classes.iter().copied().collect();
    if class_filter.is_empty() {
      warn!("类别过滤为空，不会标注任何目标");
    }
    for id in class_filter.iter() {
      if id as usize >= class_names.len() {
        warn!("类别 {} 超出类别表范围 ({} 项)，将显示为 unknown", id, class_names.len());
      }
    }

    Ok(Self {
      pipeline: Arc::new(PipelineSettings {
        left: args.left.clone(),
        right: args.right.clone(),
        resolution,
        class_filter,
        class_names,
        jpeg_quality: args.jpeg_quality,
      }),
      detector: DetectorSettings {
        model_path: args.model.clone(),
        input_size: args.input_size,
        conf_threshold: args.confidence,
        iou_threshold: args.nms_threshold,
        max_detections: args.max_detections,
      },
      open_timeout: Duration::from_secs(args.open_timeout),
    })
  }
}

fn check_threshold(name: &'static str, value: f32) -> Result<(), ConfigError> {
  if (0.0..=1.0).contains(&value) {
    Ok(())
  } else {
    Err(ConfigError::InvalidThreshold { name, value })
  }
}
