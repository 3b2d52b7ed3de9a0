// 该文件是 Shuanglu （双路） 项目的一部分。
// src/bin/dual_snapshot.rs - 不经 HTTP 保存若干张拼接结果
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use shuanglu::{
  args::StreamArgs,
  config::StreamConfig,
  input::{GStreamerOpener, redact_locator},
  output::{Annotator, segment_payload},
  task::DualSourceCompositor,
};

/// 运行双路合成若干个 tick，把每张拼接图写入目录
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub stream: StreamArgs,

  /// 保存的帧数
  #[arg(long, default_value_t = 10, value_name = "FRAME_NUMBER")]
  pub frames: usize,

  /// 输出目录
  #[arg(long, default_value = "snapshots", value_name = "DIR")]
  pub output: PathBuf,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = StreamConfig::from_args(&args.stream)?;

  info!("视频源 1: {}", redact_locator(&config.pipeline.left));
  info!("视频源 2: {}", redact_locator(&config.pipeline.right));
  info!("输出目录: {}", args.output.display());

  std::fs::create_dir_all(&args.output)
    .with_context(|| format!("无法创建目录 {}", args.output.display()))?;

  let detector = config.detector.load()?;
  let compositor = DualSourceCompositor::new(
    GStreamerOpener::new(config.open_timeout),
    detector,
    Arc::new(Annotator::new()?),
    config.pipeline.clone(),
  );

  let mut saved = 0;
  for segment in compositor.take(args.frames) {
    let segment = segment?;
    let Some(jpeg) = segment_payload(&segment) else {
      warn!("分段格式异常，跳过");
      continue;
    };
    saved += 1;
    let path = args.output.join(format!("frame-{:06}.jpg", saved));
    std::fs::write(&path, jpeg).with_context(|| format!("无法写入 {}", path.display()))?;
    info!("已保存 {}", path.display());
  }

  if saved == 0 {
    bail!("没有得到任何帧，请检查两路视频源");
  }
  info!("完成，共保存 {} 帧", saved);
  Ok(())
}
