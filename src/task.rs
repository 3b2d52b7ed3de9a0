// 该文件是 Shuanglu （双路） 项目的一部分。
// src/task.rs - 双路合成流水线
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

//! 双路合成流水线
//!
//! 每次拉取（一个 tick）：依次从左、右两路各读一帧，分别检测并标注，水平拼接，
//! 编码为 JPEG，包装成一个 multipart 分段返回。
//!
//! 状态：`Idle → Opening → Streaming → Terminated`。`step` 每次推进一步，
//! `Iterator` 在其上跳过没有输出的步骤。
//! - 任一路打开失败：不输出任何分段，直接结束。
//! - 任一路读帧失败：整条流结束，不重试、不重连。
//! - 编码失败：跳过本 tick，立即进行下一个 tick。
//! - 检测失败：返回一个错误，然后结束。
//!
//! 进入 `Terminated` 时两路输入源随状态一起被丢弃释放。

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::PipelineSettings,
  frame::Frame,
  input::{FrameSource, OpenSource, redact_locator},
  model::Detector,
  output::{Annotator, EncodeFrame, JpegFrameEncoder, multipart_segment},
};

#[derive(Error, Debug)]
pub enum CompositorError {
  #[error("目标检测失败: {0}")]
  Detection(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 合成流水线所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Opening,
  Streaming,
  Terminated,
}

enum State<S> {
  Idle,
  Opening,
  Streaming { left: S, right: S },
  Terminated,
}

/// 合成器单步推进的结果
#[derive(Debug)]
pub enum Step {
  /// 状态迁移，没有输出
  Advanced,
  /// 一个 multipart 分段
  Segment(Vec<u8>),
  /// 编码失败，本 tick 被跳过
  Skipped,
  /// 检测失败，之后流结束
  Failed(CompositorError),
}

/// 运行计数，仅用于日志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositorStats {
  pub ticks: u64,
  pub segments: u64,
  pub skipped_encodes: u64,
}

enum Tick {
  Segment(Vec<u8>),
  Skipped,
  Ended,
  Failed(CompositorError),
}

/// 双路合成器
///
/// 作为拉取式迭代器使用：`Some(Ok(segment))` 为一个 multipart 分段，
/// `Some(Err(_))` 为失败（之后恒为 `None`），`None` 表示流已结束。
pub struct DualSourceCompositor<O: OpenSource, D, E = JpegFrameEncoder> {
  opener: O,
  detector: D,
  encoder: E,
  annotator: Arc<Annotator>,
  settings: Arc<PipelineSettings>,
  state: State<O::Source>,
  stats: CompositorStats,
}

impl<O: OpenSource, D: Detector> DualSourceCompositor<O, D> {
  pub fn new(
    opener: O,
    detector: D,
    annotator: Arc<Annotator>,
    settings: Arc<PipelineSettings>,
  ) -> Self {
    let encoder = JpegFrameEncoder::new(settings.jpeg_quality);
    Self {
      opener,
      detector,
      encoder,
      annotator,
      settings,
      state: State::Idle,
      stats: CompositorStats::default(),
    }
  }
}

impl<O: OpenSource, D: Detector, E: EncodeFrame> DualSourceCompositor<O, D, E> {
  pub fn with_encoder<E2: EncodeFrame>(self, encoder: E2) -> DualSourceCompositor<O, D, E2> {
    DualSourceCompositor {
      opener: self.opener,
      detector: self.detector,
      encoder,
      annotator: self.annotator,
      settings: self.settings,
      state: self.state,
      stats: self.stats,
    }
  }

  pub fn phase(&self) -> Phase {
    match self.state {
      State::Idle => Phase::Idle,
      State::Opening => Phase::Opening,
      State::Streaming { .. } => Phase::Streaming,
      State::Terminated => Phase::Terminated,
    }
  }

  pub fn stats(&self) -> CompositorStats {
    self.stats
  }

  fn open_sources(&self) -> State<O::Source> {
    let s = &self.settings;
    let left = match self.opener.open(&s.left, s.resolution) {
      Ok(source) => source,
      Err(e) => {
        error!("无法打开视频源 1 ({}): {}", redact_locator(&s.left), e);
        return State::Terminated;
      }
    };
    let right = match self.opener.open(&s.right, s.resolution) {
      Ok(source) => source,
      Err(e) => {
        error!("无法打开视频源 2 ({}): {}", redact_locator(&s.right), e);
        return State::Terminated;
      }
    };

    info!("两路视频源已打开，分辨率提示 {}", s.resolution);
    State::Streaming { left, right }
  }

  fn annotate(&self, frame: Frame) -> Result<Frame, CompositorError> {
    let detections = self
      .detector
      .detect(&frame)
      .map_err(|e| CompositorError::Detection(Box::new(e)))?;
    Ok(self.annotator.annotate(
      frame,
      &detections,
      &self.settings.class_filter,
      &self.settings.class_names,
    ))
  }

  fn tick(&mut self, left: &mut O::Source, right: &mut O::Source) -> Tick {
    self.stats.ticks += 1;
    let tick = self.stats.ticks;

    let Some(frame_left) = left.read() else {
      info!("视频源 1 没有更多帧 (tick {})", tick);
      return Tick::Ended;
    };
    let Some(frame_right) = right.read() else {
      info!("视频源 2 没有更多帧 (tick {})", tick);
      return Tick::Ended;
    };

    let now = Instant::now();
    let annotated = self
      .annotate(frame_left)
      .and_then(|l| self.annotate(frame_right).map(|r| (l, r)));
    let (frame_left, frame_right) = match annotated {
      Ok(frames) => frames,
      Err(e) => return Tick::Failed(e),
    };
    let infer_elapsed = now.elapsed();

    let composite = frame_left.hconcat(&frame_right);
    match self.encoder.encode(&composite) {
      Ok(jpeg) => {
        debug!(
          "tick {}: {}x{}, 推理 {:.2?}, 总计 {:.2?}",
          tick,
          composite.width(),
          composite.height(),
          infer_elapsed,
          now.elapsed()
        );
        Tick::Segment(multipart_segment(&jpeg))
      }
      Err(e) => {
        warn!("tick {} 编码失败，跳过: {}", tick, e);
        Tick::Skipped
      }
    }
  }
}

impl<O: OpenSource, D: Detector, E: EncodeFrame> DualSourceCompositor<O, D, E> {
  /// 推进一步：一次状态迁移或一个 tick；流已结束时返回 `None`
  pub fn step(&mut self) -> Option<Step> {
    // 先置为 Terminated，只有继续推流时才放回源
    match std::mem::replace(&mut self.state, State::Terminated) {
      State::Idle => {
        debug!("合成器阶段: {:?}", Phase::Opening);
        self.state = State::Opening;
        Some(Step::Advanced)
      }
      State::Opening => {
        self.state = self.open_sources();
        Some(Step::Advanced)
      }
      State::Streaming {
        mut left,
        mut right,
      } => match self.tick(&mut left, &mut right) {
        Tick::Segment(segment) => {
          self.stats.segments += 1;
          self.state = State::Streaming { left, right };
          Some(Step::Segment(segment))
        }
        Tick::Skipped => {
          self.stats.skipped_encodes += 1;
          self.state = State::Streaming { left, right };
          Some(Step::Skipped)
        }
        Tick::Ended => {
          info!("合成流结束: {:?}", self.stats);
          None
        }
        Tick::Failed(e) => {
          error!("合成流失败: {}", e);
          Some(Step::Failed(e))
        }
      },
      State::Terminated => None,
    }
  }

  /// 逐步推进的迭代器，调用方可以在跳过的 tick 之间检查是否该停下
  pub fn steps(&mut self) -> impl Iterator<Item = Step> + '_ {
    std::iter::from_fn(move || self.step())
  }
}

impl<O: OpenSource, D: Detector, E: EncodeFrame> Iterator for DualSourceCompositor<O, D, E> {
  type Item = Result<Vec<u8>, CompositorError>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      match self.step()? {
        Step::Segment(segment) => return Some(Ok(segment)),
        Step::Failed(e) => return Some(Err(e)),
        Step::Advanced | Step::Skipped => {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;
  use std::sync::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use url::Url;

  use super::*;
  use crate::{
    input::{InputError, Resolution},
    model::{BoundingBox, ClassFilter, ClassNames, Detection},
    output::EncodeError,
  };

  type Log = Arc<Mutex<Vec<String>>>;

  /// 按主机名区分左右两路的内存视频源
  struct FakeSource {
    name: String,
    frames: VecDeque<Frame>,
    log: Log,
  }

  impl FrameSource for FakeSource {
    fn read(&mut self) -> Option<Frame> {
      self.log.lock().unwrap().push(format!("read {}", self.name));
      self.frames.pop_front()
    }
  }

  impl Drop for FakeSource {
    fn drop(&mut self) {
      self.log.lock().unwrap().push(format!("drop {}", self.name));
    }
  }

  struct FakeOpener {
    frames: Vec<(String, usize)>,
    fail: Option<String>,
    log: Log,
  }

  impl FakeOpener {
    fn new(left_frames: usize, right_frames: usize) -> Self {
      Self {
        frames: vec![("left".into(), left_frames), ("right".into(), right_frames)],
        fail: None,
        log: Log::default(),
      }
    }

    fn failing(mut self, host: &str) -> Self {
      self.fail = Some(host.to_string());
      self
    }
  }

  impl OpenSource for FakeOpener {
    type Source = FakeSource;

    fn open(&self, locator: &Url, hint: Resolution) -> Result<FakeSource, InputError> {
      let name = locator.host_str().unwrap_or_default().to_string();
      self.log.lock().unwrap().push(format!("open {}", name));
      if self.fail.as_deref() == Some(name.as_str()) {
        return Err(InputError::SourceUnavailable(name));
      }
      let count = self
        .frames
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, c)| *c)
        .unwrap_or(0);
      Ok(FakeSource {
        name,
        frames: (0..count)
          .map(|_| Frame::filled(hint.width, hint.height, [90, 90, 90]))
          .collect(),
        log: self.log.clone(),
      })
    }
  }

  struct FixedDetector(Vec<Detection>);

  impl Detector for FixedDetector {
    type Error = std::io::Error;

    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, Self::Error> {
      Ok(self.0.clone())
    }
  }

  struct BrokenDetector;

  impl Detector for BrokenDetector {
    type Error = std::io::Error;

    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, Self::Error> {
      Err(std::io::Error::other("model crashed"))
    }
  }

  /// 前 `fail_first` 次编码失败
  struct FlakyEncoder {
    calls: AtomicUsize,
    fail_first: usize,
  }

  impl EncodeFrame for FlakyEncoder {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, EncodeError> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if call < self.fail_first {
        return Err(EncodeError::EmptyImage {
          width: frame.width(),
          height: frame.height(),
        });
      }
      JpegFrameEncoder::default().encode(frame)
    }
  }

  fn settings(filter: ClassFilter) -> Arc<PipelineSettings> {
    Arc::new(PipelineSettings {
      left: Url::parse("rtsp://left/stream").unwrap(),
      right: Url::parse("rtsp://right/stream").unwrap(),
      resolution: Resolution {
        width: 320,
        height: 240,
      },
      class_filter: filter,
      class_names: ClassNames::default(),
      jpeg_quality: 90,
    })
  }

  fn compositor<D: Detector>(opener: FakeOpener, detector: D) -> DualSourceCompositor<FakeOpener, D> {
    DualSourceCompositor::new(
      opener,
      detector,
      Arc::new(Annotator::new().unwrap()),
      settings(ClassFilter::default()),
    )
  }

  fn jpeg_of(segment: &[u8]) -> &[u8] {
    let head = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".len();
    &segment[head..segment.len() - 4]
  }

  #[test]
  fn starts_idle_and_opens_lazily() {
    let opener = FakeOpener::new(1, 1);
    let log = opener.log.clone();
    let c = compositor(opener, FixedDetector(vec![]));

    assert_eq!(c.phase(), Phase::Idle);
    assert!(log.lock().unwrap().is_empty());
  }

  #[test]
  fn steps_pass_through_opening() {
    let opener = FakeOpener::new(1, 1);
    let log = opener.log.clone();
    let mut c = compositor(opener, FixedDetector(vec![]));

    assert!(matches!(c.step(), Some(Step::Advanced)));
    assert_eq!(c.phase(), Phase::Opening);
    assert!(log.lock().unwrap().is_empty());

    assert!(matches!(c.step(), Some(Step::Advanced)));
    assert_eq!(c.phase(), Phase::Streaming);
    assert_eq!(*log.lock().unwrap(), vec!["open left", "open right"]);

    assert!(matches!(c.step(), Some(Step::Segment(_))));
    assert!(c.step().is_none());
    assert_eq!(c.phase(), Phase::Terminated);
  }

  #[test]
  fn second_source_open_failure_yields_nothing() {
    let opener = FakeOpener::new(5, 5).failing("right");
    let log = opener.log.clone();
    let mut c = compositor(opener, FixedDetector(vec![]));

    assert!(c.next().is_none());
    assert_eq!(c.phase(), Phase::Terminated);
    assert!(c.next().is_none());
    assert_eq!(
      *log.lock().unwrap(),
      vec!["open left", "open right", "drop left"]
    );
  }

  #[test]
  fn first_source_open_failure_skips_second() {
    let opener = FakeOpener::new(5, 5).failing("left");
    let log = opener.log.clone();
    let mut c = compositor(opener, FixedDetector(vec![]));

    assert_eq!(c.by_ref().count(), 0);
    assert_eq!(c.phase(), Phase::Terminated);
    assert_eq!(*log.lock().unwrap(), vec!["open left"]);
  }

  #[test]
  fn read_failure_on_tick_k_yields_k_minus_one_segments() {
    // 右路只有 3 帧，第 4 个 tick 读帧失败
    let opener = FakeOpener::new(10, 3);
    let log = opener.log.clone();
    let mut c = compositor(opener, FixedDetector(vec![]));

    let segments: Vec<_> = c.by_ref().collect::<Result<_, _>>().unwrap();
    assert_eq!(segments.len(), 3);
    assert_eq!(c.phase(), Phase::Terminated);
    assert_eq!(
      c.stats(),
      CompositorStats {
        ticks: 4,
        segments: 3,
        skipped_encodes: 0
      }
    );

    let log = log.lock().unwrap();
    // 每个 tick 先读左再读右，结束时两路都被释放
    assert_eq!(&log[2..4], &["read left", "read right"]);
    let tail = &log[log.len() - 2..];
    assert!(tail.contains(&"drop left".to_string()));
    assert!(tail.contains(&"drop right".to_string()));
  }

  #[test]
  fn left_read_failure_does_not_touch_right() {
    let opener = FakeOpener::new(0, 3);
    let log = opener.log.clone();
    let mut c = compositor(opener, FixedDetector(vec![]));

    assert!(c.next().is_none());
    let log = log.lock().unwrap();
    assert!(!log.contains(&"read right".to_string()));
  }

  #[test]
  fn composite_is_side_by_side_with_annotation_on_left() {
    let person = Detection {
      class_id: 0,
      confidence: 0.91,
      bbox: BoundingBox::new(10.0, 10.0, 50.0, 80.0),
    };
    let mut c = DualSourceCompositor::new(
      FakeOpener::new(1, 1),
      FixedDetector(vec![person]),
      Arc::new(Annotator::new().unwrap()),
      settings([0].into_iter().collect()),
    )
    .with_encoder(JpegFrameEncoder::new(100));

    let segment = c.next().unwrap().unwrap();
    assert!(segment.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    assert!(segment.ends_with(b"\r\n\r\n"));

    let image = image::load_from_memory(jpeg_of(&segment)).unwrap().to_rgb8();
    assert_eq!((image.width(), image.height()), (640, 240));

    // 框的左边线在左半幅 x=11 处（三像素线宽的中间），接近品红
    let edge = image.get_pixel(11, 45).0;
    assert!(edge[0] > 200 && edge[1] < 60 && edge[2] > 200, "{:?}", edge);
    // 右半幅同一检测同样被标注
    let edge = image.get_pixel(320 + 11, 45).0;
    assert!(edge[0] > 200 && edge[1] < 60 && edge[2] > 200, "{:?}", edge);
    // 远离检测框的区域保持原色
    let plain = image.get_pixel(200, 200).0;
    assert!(plain.iter().all(|&v| (80..=100).contains(&v)), "{:?}", plain);

    assert!(c.next().is_none());
  }

  #[test]
  fn encode_failure_skips_tick_and_continues() {
    let mut c = compositor(FakeOpener::new(4, 4), FixedDetector(vec![])).with_encoder(FlakyEncoder {
      calls: AtomicUsize::new(0),
      fail_first: 2,
    });

    assert_eq!(c.by_ref().filter(Result::is_ok).count(), 2);
    assert_eq!(
      c.stats(),
      CompositorStats {
        ticks: 5,
        segments: 2,
        skipped_encodes: 2
      }
    );
  }

  #[test]
  fn detector_failure_ends_stream_with_error() {
    let opener = FakeOpener::new(4, 4);
    let log = opener.log.clone();
    let mut c = compositor(opener, BrokenDetector);

    assert!(matches!(c.next(), Some(Err(CompositorError::Detection(_)))));
    assert_eq!(c.phase(), Phase::Terminated);
    assert!(c.next().is_none());
    assert!(log.lock().unwrap().contains(&"drop right".to_string()));
  }
}
