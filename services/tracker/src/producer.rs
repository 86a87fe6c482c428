//! Per-feed event production.
//!
//! Each feed runs one [`FeedProducer`] on its own task. The producer samples
//! frames, runs detection, matches embeddings against the catalog and passes
//! known identities through the presence filter and cooldown gate owned by its
//! [`FeedTracker`]. Approved events go to the recorder channel.

use crate::catalog::{IdentityCatalog, IdentityMatch};
use crate::config::RecognitionConfig;
use crate::event::RecognitionEvent;
use crate::feed::{Feed, FeedConnector, FeedError, Frame, FrameStream};
use crate::gate::{GateDecision, RecognitionGate};
use crate::recognizer::Recognizer;
use crate::recorder::EventSink;
use crate::region::{Placement, Point, RegionIndex, ZoneSet};
use crate::site::SiteSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Placement and cooldown state for one feed.
#[derive(Debug)]
pub struct FeedTracker {
    source_id: String,
    regions: RegionIndex,
    gate: RecognitionGate,
}

impl FeedTracker {
    pub fn new(source_id: impl Into<String>, zones: ZoneSet, cooldown: Duration) -> Self {
        Self {
            source_id: source_id.into(),
            regions: RegionIndex::new(zones),
            gate: RecognitionGate::new(cooldown),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Adjust zone geometry to the frame resolution.
    pub fn prepare(&mut self, width: u32, height: u32) {
        if self.regions.rescale(width, height) {
            debug!(source_id = %self.source_id, width, height, "Zones rescaled");
        }
    }

    /// Run a known identity through the presence filter and the gate.
    ///
    /// A sighting outside every zone is dropped without touching gate state.
    pub fn observe(
        &mut self,
        identity: &str,
        centroid: Point,
        at: DateTime<Utc>,
    ) -> Option<RecognitionEvent> {
        let placement = self.regions.resolve(centroid);
        if !placement.is_present() {
            debug!(
                source_id = %self.source_id,
                identity,
                x = centroid.x,
                y = centroid.y,
                "Sighting outside configured zones"
            );
            return None;
        }

        match self.gate.evaluate(identity, &self.source_id, at) {
            GateDecision::Suppressed => {
                metrics::counter!("tracker.events.suppressed").increment(1);
                None
            }
            GateDecision::Approved => {
                metrics::counter!("tracker.events.emitted").increment(1);
                Some(build_event(identity, &self.source_id, at, &placement))
            }
        }
    }
}

fn build_event(
    identity: &str,
    source_id: &str,
    at: DateTime<Utc>,
    placement: &Placement,
) -> RecognitionEvent {
    RecognitionEvent {
        identity: identity.to_string(),
        source_id: source_id.to_string(),
        timestamp: at,
        block_zone: placement.block().map(str::to_string),
        seat_zone: placement.seat().map(str::to_string),
    }
}

/// Why a frame stream stopped being consumed.
#[derive(Debug)]
enum StreamEnd {
    Ended,
    Failed(FeedError),
    Cancelled,
}

/// Sequential capture-detect-emit loop for one feed.
pub struct FeedProducer {
    feed: Feed,
    connector: Arc<dyn FeedConnector>,
    recognizer: Arc<dyn Recognizer>,
    catalog: Arc<IdentityCatalog>,
    tracker: FeedTracker,
    sink: EventSink,
    skip_frames: u32,
    threshold: f32,
    retry_delay: Duration,
}

impl FeedProducer {
    pub fn new(
        feed: Feed,
        site: &SiteSnapshot,
        connector: Arc<dyn FeedConnector>,
        recognizer: Arc<dyn Recognizer>,
        sink: EventSink,
        config: &RecognitionConfig,
    ) -> Self {
        let tracker = FeedTracker::new(
            feed.source_id.clone(),
            site.zones_for(&feed.source_id),
            config.cooldown(),
        );

        Self {
            skip_frames: feed.status.skip_frames(config),
            feed,
            connector,
            recognizer,
            catalog: site.catalog.clone(),
            tracker,
            sink,
            threshold: config.similarity_threshold,
            retry_delay: config.feed_retry_delay(),
        }
    }

    /// Open and consume the feed until cancelled, reopening after failures.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            source_id = %self.feed.source_id,
            status = ?self.feed.status,
            skip_frames = self.skip_frames,
            "Feed producer started"
        );

        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.connector.open(&self.feed) => opened,
            };

            match opened {
                Ok(stream) => {
                    info!(source_id = %self.feed.source_id, "Feed opened");
                    match self.consume(stream, &cancel).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Ended => {
                            info!(source_id = %self.feed.source_id, "Feed ended")
                        }
                        StreamEnd::Failed(e) => {
                            warn!(source_id = %self.feed.source_id, error = %e, "Feed failed")
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        source_id = %self.feed.source_id,
                        error = %e,
                        retry_secs = self.retry_delay.as_secs(),
                        "Failed to open feed"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(source_id = %self.feed.source_id, "Feed producer stopped");
    }

    async fn consume(
        &mut self,
        mut stream: Box<dyn FrameStream>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        loop {
            for _ in 0..self.skip_frames {
                let grabbed = tokio::select! {
                    _ = cancel.cancelled() => return StreamEnd::Cancelled,
                    grabbed = stream.grab() => grabbed,
                };
                match grabbed {
                    Ok(true) => {}
                    Ok(false) => return StreamEnd::Ended,
                    Err(e) if e.is_frame_local() => {
                        debug!(source_id = %self.feed.source_id, error = %e, "Skipped frame unreadable")
                    }
                    Err(e) => return StreamEnd::Failed(e),
                }
            }

            let read = tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                read = stream.read() => read,
            };
            match read {
                Ok(Some(frame)) => {
                    self.process_frame(&frame).await;
                }
                Ok(None) => return StreamEnd::Ended,
                Err(e) if e.is_frame_local() => {
                    warn!(source_id = %self.feed.source_id, error = %e, "Dropping undecodable frame")
                }
                Err(e) => return StreamEnd::Failed(e),
            }
        }
    }

    /// Detect, match and gate every face in one frame.
    ///
    /// Returns the number of events emitted.
    pub async fn process_frame(&mut self, frame: &Frame) -> usize {
        let detections = match self.recognizer.detect(frame).await {
            Ok(detections) => detections,
            Err(e) => {
                warn!(
                    source_id = %self.feed.source_id,
                    sequence = frame.sequence,
                    error = %e,
                    "Detection failed"
                );
                return 0;
            }
        };

        self.tracker.prepare(frame.width, frame.height);

        let mut emitted = 0;
        for detection in detections {
            let identity = match self.catalog.best_match(&detection.embedding, self.threshold) {
                IdentityMatch::Known { identity, .. } => identity,
                IdentityMatch::Unknown { score } => {
                    debug!(source_id = %self.feed.source_id, score, "Unknown face");
                    continue;
                }
            };

            let centroid = detection.bbox.centroid(frame.width, frame.height);
            let Some(event) = self.tracker.observe(&identity, centroid, frame.captured_at) else {
                continue;
            };

            info!(
                source_id = %event.source_id,
                identity = %event.identity,
                name = self.catalog.display_name(&event.identity).unwrap_or("-"),
                block = event.block_zone.as_deref().unwrap_or("-"),
                seat = event.seat_zone.as_deref().unwrap_or("-"),
                "Recognition event"
            );

            if self.sink.send(event).is_err() {
                error!(source_id = %self.feed.source_id, "Event recorder is gone, event lost");
                continue;
            }
            emitted += 1;
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedStatus;
    use crate::recognizer::{BoundingBox, Detection, MockRecognizer, RecognitionError};
    use crate::recorder::event_channel;
    use crate::region::SeatZone;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap()
    }

    fn seat_zones() -> ZoneSet {
        ZoneSet {
            blocks: vec![],
            seats: vec![SeatZone {
                name: "S3".to_string(),
                origin_x: 0.25,
                origin_y: 0.25,
                width: 0.5,
                height: 0.5,
            }],
        }
    }

    fn frame(sequence: u64, captured_at: DateTime<Utc>) -> Frame {
        Frame {
            data: Bytes::from_static(b"jpeg"),
            width: 1000,
            height: 800,
            format: "jpeg".to_string(),
            sequence,
            captured_at,
        }
    }

    fn u1_at_seat() -> Detection {
        Detection {
            bbox: BoundingBox::from([450.0, 350.0, 550.0, 450.0]),
            embedding: vec![1.0, 0.0],
        }
    }

    fn site() -> SiteSnapshot {
        SiteSnapshot {
            catalog: Arc::new(IdentityCatalog::new(vec![
                ("U1".to_string(), vec![1.0, 0.0]),
                ("U2".to_string(), vec![0.0, 1.0]),
            ])),
            zones: Arc::new(HashMap::from([("cam-a".to_string(), seat_zones())])),
            camera_status: Arc::new(HashMap::new()),
        }
    }

    fn feed() -> Feed {
        Feed {
            url: "rtsp://cam-a/stream".to_string(),
            source_id: "cam-a".to_string(),
            status: FeedStatus::Idle,
        }
    }

    struct ScriptedStream {
        frames: VecDeque<Frame>,
        grabs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn grab(&mut self) -> Result<bool, FeedError> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            Ok(self.frames.pop_front().is_some())
        }

        async fn read(&mut self) -> Result<Option<Frame>, FeedError> {
            Ok(self.frames.pop_front())
        }
    }

    /// Hands out one scripted stream per open; fails once the script runs out.
    struct ScriptedConnector {
        opens: Mutex<VecDeque<Option<Vec<Frame>>>>,
        open_calls: AtomicUsize,
        grabs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedConnector for ScriptedConnector {
        async fn open(&self, feed: &Feed) -> Result<Box<dyn FrameStream>, FeedError> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            match self.opens.lock().pop_front().flatten() {
                Some(frames) => Ok(Box::new(ScriptedStream {
                    frames: frames.into(),
                    grabs: self.grabs.clone(),
                })),
                None => Err(FeedError::Open {
                    url: feed.url.clone(),
                    reason: "camera offline".to_string(),
                }),
            }
        }
    }

    #[test]
    fn test_seated_identity_emits_with_seat() {
        let mut tracker = FeedTracker::new("cam-a", seat_zones(), Duration::from_secs(60));
        tracker.prepare(1000, 800);

        let event = tracker.observe("U1", Point::new(500, 400), t0()).unwrap();
        assert_eq!(event.seat_zone.as_deref(), Some("S3"));
        assert_eq!(event.block_zone, None);
        assert_eq!(event.source_id, "cam-a");

        let later = t0() + chrono::Duration::seconds(1);
        assert!(tracker.observe("U1", Point::new(500, 400), later).is_none());
    }

    #[test]
    fn test_lingering_and_moving_between_feeds() {
        let cooldown = Duration::from_secs(60);
        let mut feed_a = FeedTracker::new("cam-a", seat_zones(), cooldown);
        let mut feed_b = FeedTracker::new("cam-b", ZoneSet::default(), cooldown);
        feed_a.prepare(1000, 800);
        feed_b.prepare(1000, 800);
        let seat = Point::new(500, 400);
        let at = |secs| t0() + chrono::Duration::seconds(secs);

        let first = feed_a.observe("U1", seat, at(0)).unwrap();
        assert_eq!(first.seat_zone.as_deref(), Some("S3"));
        assert!(feed_b.observe("U1", seat, at(10)).is_some());
        assert!(feed_a.observe("U1", seat, at(30)).is_none());
        assert!(feed_a.observe("U1", seat, at(65)).is_some());
    }

    #[test]
    fn test_sighting_outside_zones_leaves_gate_untouched() {
        let mut tracker = FeedTracker::new("cam-a", seat_zones(), Duration::from_secs(60));
        tracker.prepare(1000, 800);

        // one pixel past the seat's right edge
        assert!(tracker.observe("U1", Point::new(751, 400), t0()).is_none());
        let event = tracker.observe("U1", Point::new(500, 400), t0() + chrono::Duration::seconds(1));
        assert!(event.is_some());
    }

    #[test]
    fn test_feed_without_zones_accepts_everywhere() {
        let mut tracker = FeedTracker::new("cam-b", ZoneSet::default(), Duration::from_secs(60));
        tracker.prepare(640, 480);
        let event = tracker.observe("U2", Point::new(5, 5), t0()).unwrap();
        assert_eq!(event.seat_zone, None);
        assert_eq!(event.block_zone, None);
    }

    #[tokio::test]
    async fn test_process_frame_emits_known_identities_only() {
        let mut recognizer = MockRecognizer::new();
        recognizer.expect_detect().returning(|_| {
            Ok(vec![
                u1_at_seat(),
                Detection {
                    bbox: BoundingBox::from([450.0, 350.0, 550.0, 450.0]),
                    embedding: vec![-1.0, -1.0],
                },
            ])
        });

        let (sink, mut events) = event_channel();
        let connector = Arc::new(ScriptedConnector {
            opens: Mutex::new(VecDeque::new()),
            open_calls: AtomicUsize::new(0),
            grabs: Arc::new(AtomicUsize::new(0)),
        });
        let mut producer = FeedProducer::new(
            feed(),
            &site(),
            connector,
            Arc::new(recognizer),
            sink,
            &RecognitionConfig::default(),
        );

        assert_eq!(producer.process_frame(&frame(0, t0())).await, 1);
        let event = events.try_recv().unwrap();
        assert_eq!(event.identity, "U1");
        assert_eq!(event.seat_zone.as_deref(), Some("S3"));
        assert!(events.try_recv().is_err());

        // same identity one second later is within the cooldown
        let later = t0() + chrono::Duration::seconds(1);
        assert_eq!(producer.process_frame(&frame(1, later)).await, 0);
    }

    #[tokio::test]
    async fn test_detection_failure_is_isolated_to_the_frame() {
        let mut recognizer = MockRecognizer::new();
        let mut calls = 0;
        recognizer.expect_detect().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(RecognitionError::Status(500))
            } else {
                Ok(vec![u1_at_seat()])
            }
        });

        let (sink, mut events) = event_channel();
        let connector = Arc::new(ScriptedConnector {
            opens: Mutex::new(VecDeque::new()),
            open_calls: AtomicUsize::new(0),
            grabs: Arc::new(AtomicUsize::new(0)),
        });
        let mut producer = FeedProducer::new(
            feed(),
            &site(),
            connector,
            Arc::new(recognizer),
            sink,
            &RecognitionConfig::default(),
        );

        assert_eq!(producer.process_frame(&frame(0, t0())).await, 0);
        assert_eq!(producer.process_frame(&frame(1, t0())).await, 1);
        assert_eq!(events.try_recv().unwrap().identity, "U1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_samples_frames_and_reopens_after_failure() {
        let mut recognizer = MockRecognizer::new();
        recognizer
            .expect_detect()
            .returning(|_| Ok(vec![u1_at_seat()]));

        // frames a minute apart so the cooldown never suppresses
        let frames: Vec<Frame> = (0..4)
            .map(|i| frame(i, t0() + chrono::Duration::minutes(i as i64)))
            .collect();

        let grabs = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(ScriptedConnector {
            opens: Mutex::new(VecDeque::from([None, Some(frames)])),
            open_calls: AtomicUsize::new(0),
            grabs: grabs.clone(),
        });

        let mut config = RecognitionConfig::default();
        config.skip_frames_idle = 1;

        let (sink, mut events) = event_channel();
        let producer = FeedProducer::new(
            feed(),
            &site(),
            connector.clone(),
            Arc::new(recognizer),
            sink,
            &config,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(producer.run(cancel.clone()));

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        cancel.cancel();
        handle.await.unwrap();

        // frames 0 and 2 are skipped, 1 and 3 are processed
        assert_eq!(first.timestamp, t0() + chrono::Duration::minutes(1));
        assert_eq!(second.timestamp, t0() + chrono::Duration::minutes(3));
        assert!(connector.open_calls.load(Ordering::SeqCst) >= 2);
        assert!(grabs.load(Ordering::SeqCst) >= 2);
    }
}
