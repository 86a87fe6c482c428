//! Recognition events and their collector wire format.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// An approved sighting of a known identity on one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    /// Identity key from the catalog
    pub identity: String,
    /// Source identifier of the feed
    pub source_id: String,
    /// When the match was approved
    pub timestamp: DateTime<Utc>,
    /// Block zone containing the face centroid, if any
    #[serde(default)]
    pub block_zone: Option<String>,
    /// Seat zone containing the face centroid, if any
    #[serde(default)]
    pub seat_zone: Option<String>,
}

impl RecognitionEvent {
    /// The `(identity, source_id, timestamp)` tuple the collector deduplicates on.
    pub fn natural_key(&self) -> (&str, &str, DateTime<Utc>) {
        (&self.identity, &self.source_id, self.timestamp)
    }
}

/// Record shape expected by the remote collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    #[serde(rename = "userPin")]
    pub user_pin: String,
    /// Local date, `YYYY-MM-DD`
    pub date: String,
    /// Local time of day, `HH:MM:SS`
    pub time: String,
    #[serde(rename = "camIP")]
    pub cam_ip: String,
    pub region: Option<String>,
    pub seat: Option<String>,
}

impl From<&RecognitionEvent> for TrackRecord {
    fn from(event: &RecognitionEvent) -> Self {
        let local = event.timestamp.with_timezone(&Local);
        Self {
            user_pin: event.identity.clone(),
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
            cam_ip: event.source_id.clone(),
            region: event.block_zone.clone(),
            seat: event.seat_zone.clone(),
        }
    }
}
