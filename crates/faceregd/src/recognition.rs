//! Live recognition loop.
//!
//! Detection frames are published into a single-slot `watch` channel: a
//! frame that arrives before the previous one was picked up replaces it.
//! A periodic task classifies every detection of the newest unseen frame
//! and hands the labeled boxes to an [`Annotator`]. Slow cycles therefore
//! skip frames instead of building a queue.

use crate::engine::EngineHandle;
use facereg_core::{BoundingBox, Detection, Verdict, VerdictView, UNREGISTERED_LABEL};
use serde::{Deserialize, Serialize, Serializer};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// One frame's worth of detections from the external detector.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// A published frame with its sequence number (starting at 1).
#[derive(Debug, Clone)]
pub struct FrameSlot {
    pub seq: u64,
    pub frame: Arc<Frame>,
}

/// Producer side of the frame slot.
pub struct FrameSender {
    tx: watch::Sender<Option<FrameSlot>>,
    seq: u64,
}

impl FrameSender {
    /// Replace the current frame. Returns its sequence number.
    pub fn publish(&mut self, frame: Frame) -> u64 {
        self.seq += 1;
        self.tx.send_replace(Some(FrameSlot {
            seq: self.seq,
            frame: Arc::new(frame),
        }));
        self.seq
    }
}

/// Consumer side of the frame slot. Clones observe the same frames.
#[derive(Clone)]
pub struct FrameReceiver {
    rx: watch::Receiver<Option<FrameSlot>>,
}

impl FrameReceiver {
    /// The most recently published frame.
    pub fn latest(&self) -> Option<FrameSlot> {
        self.rx.borrow().clone()
    }

    /// Highest-confidence detection of the latest frame.
    pub fn best_detection(&self) -> Option<Detection> {
        let slot = self.latest()?;
        slot.frame
            .detections
            .iter()
            .fold(None::<&Detection>, |best, d| match best {
                Some(b) if b.bbox.confidence >= d.bbox.confidence => Some(b),
                _ => Some(d),
            })
            .cloned()
    }
}

pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    let (tx, rx) = watch::channel(None);
    (FrameSender { tx, seq: 0 }, FrameReceiver { rx })
}

/// A labeled box to draw over the live feed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Annotation {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Overlay text, e.g. `"Alice (0.31)"`.
    pub label: String,
    /// `{"label", "distance"}`, or `null` when nothing is registered.
    #[serde(serialize_with = "serialize_verdict")]
    pub verdict: Option<Verdict>,
}

fn serialize_verdict<S: Serializer>(verdict: &Option<Verdict>, s: S) -> Result<S::Ok, S::Error> {
    verdict.as_ref().map(VerdictView::from).serialize(s)
}

/// Sink for per-frame annotations.
pub trait Annotator: Send {
    fn annotate(&mut self, frame: u64, annotations: &[Annotation]) -> std::io::Result<()>;
}

/// Writes one JSON object per frame: `{"frame": n, "annotations": [...]}`.
pub struct JsonLinesAnnotator<W> {
    out: W,
}

impl<W: Write + Send> JsonLinesAnnotator<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

#[derive(Serialize)]
struct AnnotatedFrame<'a> {
    frame: u64,
    annotations: &'a [Annotation],
}

impl<W: Write + Send> Annotator for JsonLinesAnnotator<W> {
    fn annotate(&mut self, frame: u64, annotations: &[Annotation]) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, &AnnotatedFrame { frame, annotations })?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Classify every detection of `frame` against the engine's current matcher.
///
/// Detections whose descriptor has the wrong shape are logged and dropped.
pub fn annotate_frame(engine: &EngineHandle, frame: &Frame) -> Vec<Annotation> {
    // One snapshot for the whole frame so every box sees the same matcher.
    let snapshot = engine.snapshot();

    frame
        .detections
        .iter()
        .filter_map(|detection| {
            let Some(matcher) = snapshot.as_deref() else {
                return Some(Annotation {
                    bbox: detection.bbox.clone(),
                    label: UNREGISTERED_LABEL.to_string(),
                    verdict: None,
                });
            };
            match facereg_core::classify_with(
                Some(matcher),
                &detection.descriptor,
                engine.descriptor_dim(),
            ) {
                Ok(verdict) => Some(annotation_for(&detection.bbox, verdict)),
                Err(e) => {
                    tracing::error!(error = %e, "dropping detection with unusable descriptor");
                    None
                }
            }
        })
        .collect()
}

fn annotation_for(bbox: &BoundingBox, verdict: Verdict) -> Annotation {
    Annotation {
        bbox: bbox.clone(),
        label: verdict.display_label(),
        verdict: Some(verdict),
    }
}

/// Run the recognition loop until the frame sender is dropped.
///
/// The annotator runs on the blocking pool so a stalled sink (a full stdout
/// pipe) never holds up a runtime worker.
pub async fn run_recognition<A: Annotator + 'static>(
    engine: EngineHandle,
    mut frames: FrameReceiver,
    mut annotator: A,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seq = 0u64;
    let mut skipped = 0u64;

    tracing::info!(period_ms = period.as_millis() as u64, "recognition loop started");

    loop {
        interval.tick().await;

        let closed = frames.rx.has_changed().is_err();
        let slot = frames.rx.borrow_and_update().clone();
        let slot = match slot {
            Some(slot) if slot.seq > last_seq => slot,
            _ if closed => break,
            _ => continue,
        };

        let missed = slot.seq - last_seq - 1;
        if missed > 0 {
            skipped += missed;
            tracing::trace!(missed, seq = slot.seq, "frames skipped");
        }
        last_seq = slot.seq;

        let annotations = annotate_frame(&engine, &slot.frame);
        tracing::debug!(
            seq = slot.seq,
            faces = annotations.len(),
            "frame classified"
        );

        let seq = slot.seq;
        let written = tokio::task::spawn_blocking(move || {
            let result = annotator.annotate(seq, &annotations);
            (annotator, result)
        })
        .await;
        annotator = match written {
            Ok((annotator, Ok(()))) => annotator,
            Ok((annotator, Err(e))) => {
                tracing::warn!(seq, error = %e, "annotation sink failed");
                annotator
            }
            Err(e) => {
                tracing::error!(error = %e, "annotation sink panicked; stopping");
                break;
            }
        };
    }

    tracing::info!(frames = last_seq, skipped, "recognition loop stopped");
}

/// Publish frames read as JSON lines from `reader` until EOF.
///
/// Malformed lines are logged and skipped. The sender is dropped on
/// return, which stops [`run_recognition`].
pub async fn feed_json_lines<R>(reader: R, mut frames: FrameSender)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "detection feed read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => {
                let seq = frames.publish(frame);
                tracing::trace!(seq, "frame published");
            }
            Err(e) => tracing::warn!(error = %e, "skipping malformed detection line"),
        }
    }
    tracing::info!("detection feed ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use facereg_core::{FaceRegistry, MemoryStorage, RegistryConfig};
    use std::sync::Mutex;

    const DIM: usize = 2;

    fn engine() -> EngineHandle {
        let config = RegistryConfig {
            descriptor_dim: DIM,
            ..RegistryConfig::default()
        };
        spawn_engine(FaceRegistry::open(Box::new(MemoryStorage::new()), config).unwrap()).unwrap()
    }

    fn detection(x: f32, confidence: f32, descriptor: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox { x, y: 0.0, width: 10.0, height: 10.0, confidence },
            descriptor,
        }
    }

    #[derive(Clone, Default)]
    struct Collector(Arc<Mutex<Vec<(u64, Vec<Annotation>)>>>);

    impl Annotator for Collector {
        fn annotate(&mut self, frame: u64, annotations: &[Annotation]) -> std::io::Result<()> {
            self.0.lock().unwrap().push((frame, annotations.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unregistered_label_before_any_registration() {
        let engine = engine();
        let frame = Frame { detections: vec![detection(0.0, 0.9, vec![0.0, 0.0])] };
        let annotations = annotate_frame(&engine, &frame);
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].label, "Unregistered");
        assert_eq!(annotations[0].verdict, None);
    }

    #[tokio::test]
    async fn test_annotations_after_registration() {
        let engine = engine();
        engine.register("Alice".into(), vec![0.0, 0.0]).await.unwrap();

        let frame = Frame {
            detections: vec![
                detection(0.0, 0.9, vec![0.0, 0.1]),
                detection(50.0, 0.8, vec![3.0, 4.0]),
                detection(90.0, 0.7, vec![1.0]),
            ],
        };
        let annotations = annotate_frame(&engine, &frame);
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].label, "Alice (0.10)");
        assert_eq!(annotations[1].label, "unknown (5.00)");
        assert_eq!(annotations[1].verdict, Some(Verdict::Unknown { distance: 5.0 }));
        assert_eq!(annotations[1].bbox.x, 50.0);
    }

    #[test]
    fn test_best_detection_picks_highest_confidence() {
        let (mut tx, rx) = frame_channel();
        assert!(rx.best_detection().is_none());

        tx.publish(Frame {
            detections: vec![
                detection(1.0, 0.5, vec![0.0, 0.0]),
                detection(2.0, 0.95, vec![1.0, 1.0]),
                detection(3.0, 0.7, vec![2.0, 2.0]),
            ],
        });
        assert_eq!(rx.best_detection().unwrap().bbox.x, 2.0);

        tx.publish(Frame::default());
        assert!(rx.best_detection().is_none());
    }

    #[test]
    fn test_publish_replaces_unread_frame() {
        let (mut tx, rx) = frame_channel();
        for _ in 0..100 {
            tx.publish(Frame::default());
        }
        assert_eq!(rx.latest().unwrap().seq, 100);
    }

    #[tokio::test]
    async fn test_loop_processes_latest_frame_and_stops_on_close() {
        let engine = engine();
        engine.register("Alice".into(), vec![0.0, 0.0]).await.unwrap();

        let input = concat!(
            r#"{"detections":[{"box":{"x":0,"y":0,"width":5,"height":5},"descriptor":[9,9]}]}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"detections":[{"box":{"x":1,"y":1,"width":5,"height":5},"descriptor":[0,0]}]}"#,
            "\n",
        );

        let (tx, rx) = frame_channel();
        let collector = Collector::default();
        let looped = tokio::spawn(run_recognition(
            engine,
            rx,
            collector.clone(),
            Duration::from_millis(5),
        ));
        feed_json_lines(input.as_bytes(), tx).await;
        looped.await.unwrap();

        let seen = collector.0.lock().unwrap().clone();
        assert!(!seen.is_empty() && seen.len() <= 2);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        let (last_seq, last) = seen.last().unwrap();
        assert_eq!(*last_seq, 2);
        assert_eq!(last[0].label, "Alice (0.00)");
    }

    #[test]
    fn test_json_lines_annotator_format() {
        let mut out = Vec::new();
        {
            let mut sink = JsonLinesAnnotator::new(&mut out);
            let annotation = Annotation {
                bbox: BoundingBox { x: 1.0, y: 2.0, width: 3.0, height: 4.0, confidence: 0.5 },
                label: "Alice (0.12)".into(),
                verdict: Some(Verdict::Match { label: "Alice".into(), distance: 0.125 }),
            };
            let unregistered = Annotation {
                bbox: BoundingBox { x: 5.0, y: 5.0, width: 1.0, height: 1.0, confidence: 0.0 },
                label: "Unregistered".into(),
                verdict: None,
            };
            sink.annotate(7, &[annotation, unregistered]).unwrap();
        }
        let line = String::from_utf8(out).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["frame"], 7);
        assert_eq!(value["annotations"][0]["label"], "Alice (0.12)");
        assert_eq!(value["annotations"][0]["box"]["width"], 3.0);
        assert_eq!(value["annotations"][0]["verdict"]["label"], "Alice");
        assert_eq!(value["annotations"][0]["verdict"]["distance"], 0.125);
        assert!(value["annotations"][1]["verdict"].is_null());
    }

    /// Sink that blocks the calling thread before recording.
    #[derive(Clone, Default)]
    struct SlowCollector(Collector);

    impl Annotator for SlowCollector {
        fn annotate(&mut self, frame: u64, annotations: &[Annotation]) -> std::io::Result<()> {
            std::thread::sleep(Duration::from_millis(200));
            self.0.annotate(frame, annotations)
        }
    }

    #[tokio::test]
    async fn test_blocking_sink_does_not_stall_runtime() {
        let engine = engine();
        let (mut tx, rx) = frame_channel();
        tx.publish(Frame { detections: vec![detection(0.0, 0.9, vec![0.0, 0.0])] });

        let sink = SlowCollector::default();
        let looped = tokio::spawn(run_recognition(engine, rx, sink.clone(), Duration::from_millis(1)));

        // A current-thread runtime: this timer only fires on time if the sink
        // is not running on the runtime thread.
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(started.elapsed() < Duration::from_millis(100));

        drop(tx);
        looped.await.unwrap();
        assert_eq!(sink.0 .0.lock().unwrap().len(), 1);
    }
}
