//! Feed-to-collector scenario over the real outbox, recorder and delivery worker.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use presence_tracker::config::{DeliveryConfig, RecognitionConfig};
use presence_tracker::region::SeatZone;
use presence_tracker::{
    event_channel, BoundingBox, Collector, CycleOutcome, DeliveryError, DeliveryWorker,
    Detection, EventRecorder, Feed, FeedConnector, FeedError, FeedProducer, FeedStatus, Frame,
    FrameStream, IdentityCatalog, Outbox, RecognitionError, Recognizer, SiteSnapshot,
    TrackRecord, ZoneSet,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct OneShotStream {
    frames: VecDeque<Frame>,
    exhausted: Arc<Notify>,
}

#[async_trait]
impl FrameStream for OneShotStream {
    async fn grab(&mut self) -> Result<bool, FeedError> {
        Ok(self.frames.pop_front().is_some())
    }

    async fn read(&mut self) -> Result<Option<Frame>, FeedError> {
        let frame = self.frames.pop_front();
        if frame.is_none() {
            self.exhausted.notify_one();
        }
        Ok(frame)
    }
}

struct OneShotConnector {
    frames: Mutex<Option<Vec<Frame>>>,
    exhausted: Arc<Notify>,
}

#[async_trait]
impl FeedConnector for OneShotConnector {
    async fn open(&self, feed: &Feed) -> Result<Box<dyn FrameStream>, FeedError> {
        match self.frames.lock().take() {
            Some(frames) => Ok(Box::new(OneShotStream {
                frames: frames.into(),
                exhausted: self.exhausted.clone(),
            })),
            None => Err(FeedError::Open {
                url: feed.url.clone(),
                reason: "stream already consumed".to_string(),
            }),
        }
    }
}

/// Sees U1 centred on seat S3 in every frame.
struct SeatedU1;

#[async_trait]
impl Recognizer for SeatedU1 {
    async fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>, RecognitionError> {
        Ok(vec![Detection {
            bbox: BoundingBox::from([450.0, 350.0, 550.0, 450.0]),
            embedding: vec![0.98, 0.02],
        }])
    }
}

#[derive(Default)]
struct RecordingCollector {
    requests: Mutex<Vec<Vec<TrackRecord>>>,
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn submit(&self, records: &[TrackRecord]) -> Result<(), DeliveryError> {
        self.requests.lock().push(records.to_vec());
        Ok(())
    }
}

fn frame(sequence: u64, offset_secs: i64) -> Frame {
    Frame {
        data: Bytes::from_static(b"frame"),
        width: 1000,
        height: 800,
        format: "jpeg".to_string(),
        sequence,
        captured_at: Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs),
    }
}

fn site() -> SiteSnapshot {
    let zones = ZoneSet {
        blocks: vec![],
        seats: vec![SeatZone {
            name: "S3".to_string(),
            origin_x: 0.25,
            origin_y: 0.25,
            width: 0.5,
            height: 0.5,
        }],
    };

    SiteSnapshot {
        catalog: Arc::new(IdentityCatalog::new(vec![
            ("U1".to_string(), vec![1.0, 0.0]),
            ("U2".to_string(), vec![0.0, 1.0]),
        ])),
        zones: Arc::new(HashMap::from([("172.14.0.112".to_string(), zones)])),
        camera_status: Arc::new(HashMap::new()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seated_identity_is_delivered_once() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let outbox = Arc::new(Outbox::open(&data_dir).unwrap());

    let (sink, events) = event_channel();
    let recorder = tokio::spawn(EventRecorder::new(outbox.clone(), None, events).run());

    let exhausted = Arc::new(Notify::new());
    let connector = Arc::new(OneShotConnector {
        // the second sighting is one second later, inside the cooldown
        frames: Mutex::new(Some(vec![frame(0, 0), frame(1, 1)])),
        exhausted: exhausted.clone(),
    });

    let mut recognition = RecognitionConfig::default();
    recognition.skip_frames_idle = 0;

    let feed = Feed {
        url: "rtsp://172.14.0.112:554/stream".to_string(),
        source_id: "172.14.0.112".to_string(),
        status: FeedStatus::Idle,
    };
    let producer = FeedProducer::new(
        feed,
        &site(),
        connector,
        Arc::new(SeatedU1),
        sink,
        &recognition,
    );

    let cancel = CancellationToken::new();
    let producer_handle = tokio::spawn(producer.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), exhausted.notified())
        .await
        .expect("stream was not consumed");
    cancel.cancel();
    producer_handle.await.unwrap();
    recorder.await.unwrap();

    assert_eq!(outbox.pending_count().unwrap(), 1);

    let mut delivery = DeliveryConfig::new("http://collector.test/api/track");
    delivery.backoff_base_ms = 10;

    let collector = Arc::new(RecordingCollector::default());
    let worker = DeliveryWorker::new(outbox, collector.clone(), &delivery);
    let outcome = worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Delivered {
            batches: 1,
            events: 1,
            attempts: 1
        }
    );

    let requests = collector.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].len(), 1);
    let record = &requests[0][0];
    assert_eq!(record.user_pin, "U1");
    assert_eq!(record.cam_ip, "172.14.0.112");
    assert_eq!(record.seat.as_deref(), Some("S3"));
    assert_eq!(record.region, None);

    // a restart over the same directory has nothing left to send
    let reopened = Arc::new(Outbox::open(&data_dir).unwrap());
    let collector = Arc::new(RecordingCollector::default());
    let worker = DeliveryWorker::new(reopened, collector.clone(), &delivery);
    let outcome = worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);
    assert!(collector.requests.lock().is_empty());
}
