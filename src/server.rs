// 该文件是 Shuanglu （双路） 项目的一部分。
// src/server.rs - MJPEG HTTP 服务
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

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
  Router,
  body::Body,
  extract::State,
  http::header,
  response::{IntoResponse, Response},
  routing::get,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
  config::PipelineSettings,
  input::OpenSource,
  model::Detector,
  output::{Annotator, MULTIPART_CONTENT_TYPE},
  task::{DualSourceCompositor, Step},
};

/// 所有请求共享的状态；每个请求据此构建独立的合成器
pub struct AppState<O, D> {
  pub opener: O,
  pub detector: Arc<D>,
  pub annotator: Arc<Annotator>,
  pub settings: Arc<PipelineSettings>,
}

impl<O: Clone, D> Clone for AppState<O, D> {
  fn clone(&self) -> Self {
    Self {
      opener: self.opener.clone(),
      detector: self.detector.clone(),
      annotator: self.annotator.clone(),
      settings: self.settings.clone(),
    }
  }
}

impl<O, D> AppState<O, D> {
  pub fn new(
    opener: O,
    detector: Arc<D>,
    annotator: Arc<Annotator>,
    settings: Arc<PipelineSettings>,
  ) -> Self {
    Self {
      opener,
      detector,
      annotator,
      settings,
    }
  }
}

pub fn router<O, D>(state: AppState<O, D>) -> Router
where
  O: OpenSource + Clone + Send + Sync + 'static,
  O::Source: Send + 'static,
  D: Detector + Send + Sync + 'static,
{
  Router::new()
    .route("/video_feed", get(video_feed::<O, D>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

async fn video_feed<O, D>(State(state): State<AppState<O, D>>) -> Response
where
  O: OpenSource + Clone + Send + Sync + 'static,
  O::Source: Send + 'static,
  D: Detector + Send + Sync + 'static,
{
  let mut compositor = DualSourceCompositor::new(
    state.opener,
    state.detector,
    state.annotator,
    state.settings,
  );

  // 容量为 1：合成器按客户端的消费速度被拉取
  let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
  tokio::task::spawn_blocking(move || {
    pump(compositor.steps(), tx);
    drop(compositor);
  });

  let segments = futures_util::stream::unfold(rx, |mut rx| async move {
    rx.recv()
      .await
      .map(|segment| (Ok::<_, Infallible>(segment), rx))
  });

  (
    [(header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE)],
    Body::from_stream(segments),
  )
    .into_response()
}

/// 在阻塞线程上驱动合成器，直到流结束或客户端断开
///
/// 没有输出的步骤之间也会检查客户端是否还在，编码一直失败时同样能及时退出。
/// 返回后由调用方丢弃合成器，两路输入源随之释放。
pub fn pump<I>(steps: I, tx: mpsc::Sender<Vec<u8>>) -> u64
where
  I: Iterator<Item = Step>,
{
  let mut sent = 0;
  for step in steps {
    match step {
      Step::Segment(segment) => {
        if tx.blocking_send(segment).is_err() {
          info!("客户端已断开，已发送 {} 个分段", sent);
          return sent;
        }
        sent += 1;
      }
      Step::Advanced | Step::Skipped => {
        if tx.is_closed() {
          info!("客户端已断开，已发送 {} 个分段", sent);
          return sent;
        }
      }
      Step::Failed(e) => {
        error!("视频流中止: {}", e);
        return sent;
      }
    }
  }
  info!("视频流结束，已发送 {} 个分段", sent);
  sent
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use url::Url;

  use super::*;
  use crate::{
    frame::Frame,
    input::{FrameSource, InputError, Resolution},
    model::{ClassFilter, ClassNames, Detection},
    output::{EncodeError, EncodeFrame},
    task::CompositorError,
  };

  #[test]
  fn pump_stops_when_receiver_is_gone() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let steps = (0..10).map(|i| Step::Segment(vec![i as u8]));
    assert_eq!(pump(steps, tx), 0);
  }

  #[test]
  fn pump_forwards_until_error() {
    let (tx, mut rx) = mpsc::channel(8);
    let steps = vec![
      Step::Advanced,
      Step::Segment(vec![1]),
      Step::Skipped,
      Step::Segment(vec![2]),
      Step::Failed(CompositorError::Detection(Box::new(std::io::Error::other("boom")))),
      Step::Segment(vec![3]),
    ];
    assert_eq!(pump(steps.into_iter(), tx), 2);
    assert_eq!(rx.try_recv().unwrap(), vec![1]);
    assert_eq!(rx.try_recv().unwrap(), vec![2]);
    assert!(rx.try_recv().is_err());
  }

  /// 永不结束的视频源，丢弃时计数
  struct EndlessSource(Arc<AtomicUsize>);

  impl FrameSource for EndlessSource {
    fn read(&mut self) -> Option<Frame> {
      Some(Frame::filled(8, 8, [0, 0, 0]))
    }
  }

  impl Drop for EndlessSource {
    fn drop(&mut self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct EndlessOpener(Arc<AtomicUsize>);

  impl OpenSource for EndlessOpener {
    type Source = EndlessSource;

    fn open(&self, _locator: &Url, _hint: Resolution) -> Result<EndlessSource, InputError> {
      Ok(EndlessSource(self.0.clone()))
    }
  }

  struct NoDetections;

  impl Detector for NoDetections {
    type Error = std::io::Error;

    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, Self::Error> {
      Ok(Vec::new())
    }
  }

  struct BrokenEncoder;

  impl EncodeFrame for BrokenEncoder {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
      Err(EncodeError::EmptyImage {
        width: frame.width(),
        height: frame.height(),
      })
    }
  }

  #[test]
  fn disconnect_releases_sources_while_every_encode_fails() {
    let dropped = Arc::new(AtomicUsize::new(0));
    let settings = Arc::new(PipelineSettings {
      left: Url::parse("rtsp://left/stream").unwrap(),
      right: Url::parse("rtsp://right/stream").unwrap(),
      resolution: Resolution {
        width: 8,
        height: 8,
      },
      class_filter: ClassFilter::default(),
      class_names: ClassNames::default(),
      jpeg_quality: 90,
    });
    let mut compositor = DualSourceCompositor::new(
      EndlessOpener(dropped.clone()),
      NoDetections,
      Arc::new(Annotator::new().unwrap()),
      settings,
    )
    .with_encoder(BrokenEncoder);

    let (tx, rx) = mpsc::channel(1);
    // 先跑几步进入推流，再让客户端离开
    let mut steps = compositor.steps();
    for _ in 0..4 {
      assert!(steps.next().is_some());
    }
    drop(rx);
    assert_eq!(pump(steps, tx), 0);
    drop(compositor);
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
  }
}
