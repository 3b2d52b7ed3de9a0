// 该文件是 Shuanglu （双路） 项目的一部分。
// src/main.rs - 双路检测 MJPEG 服务
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

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use shuanglu::{
  args::StreamArgs,
  config::StreamConfig,
  input::{GStreamerOpener, redact_locator},
  output::Annotator,
  server::{AppState, router},
};

/// 两路视频源检测后拼接，以 MJPEG 形式在 /video_feed 提供
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub stream: StreamArgs,

  /// 监听地址
  #[arg(long, default_value = "0.0.0.0:5000", value_name = "ADDR")]
  pub bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  let config = StreamConfig::from_args(&args.stream)?;

  info!("视频源 1: {}", redact_locator(&config.pipeline.left));
  info!("视频源 2: {}", redact_locator(&config.pipeline.right));
  info!("模型文件路径: {}", config.detector.model_path.display());
  info!("分辨率提示: {}", config.pipeline.resolution);

  let detector = config
    .detector
    .load()
    .with_context(|| format!("无法加载模型 {}", config.detector.model_path.display()))?;
  let annotator = Annotator::new()?;

  let state = AppState::new(
    GStreamerOpener::new(config.open_timeout),
    Arc::new(detector),
    Arc::new(annotator),
    config.pipeline.clone(),
  );

  let listener = tokio::net::TcpListener::bind(args.bind)
    .await
    .with_context(|| format!("无法监听 {}", args.bind))?;
  info!("监听 http://{}/video_feed", args.bind);

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已退出");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!("无法监听 Ctrl-C: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到退出信号");
}
