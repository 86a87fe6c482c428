//! Presence Tracker - multi-camera identity tracking with durable delivery
//!
//! The tracker watches a set of camera feeds, recognizes known people in
//! configured zones and reports each sighting to a remote collector:
//!
//! - Per-feed producers sample frames, detect faces and match them against an
//!   identity catalog
//! - A per-feed cooldown gate suppresses repeated sightings
//! - Approved events are persisted to a durable outbox
//! - A delivery worker batches the outbox and posts it with retries
//!
//! # Architecture
//!
//! ```text
//! FeedConnector -> FeedProducer -> EventRecorder -> Outbox -> DeliveryWorker -> Collector
//!                     |   ^
//!            Recognizer   IdentityCatalog, RegionIndex, RecognitionGate
//! ```

pub mod catalog;
pub mod config;
pub mod delivery;
pub mod event;
pub mod feed;
pub mod gate;
pub mod history;
pub mod outbox;
pub mod producer;
pub mod recognizer;
pub mod recorder;
pub mod region;
#[cfg(feature = "rtsp")]
pub mod rtsp_source;
pub mod site;

// Re-export main types
pub use catalog::{IdentityCatalog, IdentityMatch};
pub use config::{ConfigValidationError, TrackerConfig};
pub use delivery::{Collector, CycleOutcome, DeliveryError, DeliveryWorker, HttpCollector};
pub use event::{RecognitionEvent, TrackRecord};
pub use feed::{Feed, FeedConnector, FeedError, FeedStatus, Frame, FrameStream, SchemeConnector};
pub use gate::{GateDecision, RecognitionGate};
pub use outbox::{Batch, Outbox, OutboxError};
pub use producer::{FeedProducer, FeedTracker};
pub use recognizer::{BoundingBox, Detection, HttpRecognizer, RecognitionError, Recognizer};
pub use recorder::{event_channel, EventRecorder, EventSink};
pub use region::{Placement, Point, RegionError, RegionIndex, ZoneSet};
pub use site::SiteSnapshot;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::IdentityCatalog;
    pub use crate::config::TrackerConfig;
    pub use crate::delivery::{Collector, DeliveryWorker};
    pub use crate::event::RecognitionEvent;
    pub use crate::feed::{Feed, FeedConnector, FrameStream};
    pub use crate::outbox::Outbox;
    pub use crate::producer::FeedProducer;
    pub use crate::recognizer::Recognizer;
    pub use crate::site::SiteSnapshot;
}
