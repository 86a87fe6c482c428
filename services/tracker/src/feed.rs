//! Camera feeds and frame sources.
//!
//! A [`FeedConnector`] opens a [`FrameStream`] for a feed URL. Snapshot URLs
//! (`http`, `https`) are polled with reqwest; RTSP URLs are decoded through
//! GStreamer when the `rtsp` feature is enabled.

use crate::config::{FeedConfig, RecognitionConfig};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

/// Errors raised by frame sources.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to open feed {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("Feed disconnected: {0}")]
    Disconnected(String),

    #[error("Frame decode failed: {0}")]
    Decode(String),
}

impl FeedError {
    /// Whether the producer should drop this frame and keep reading.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, FeedError::Decode(_))
    }
}

/// Operational status of a camera, selecting the sampling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Working,
    Idle,
}

impl FeedStatus {
    /// `"Working"` is the only active status; anything else is idle.
    pub fn parse(status: &str) -> Self {
        if status == "Working" {
            FeedStatus::Working
        } else {
            FeedStatus::Idle
        }
    }

    /// Frames to skip before each read at this status.
    pub fn skip_frames(self, config: &RecognitionConfig) -> u32 {
        match self {
            FeedStatus::Working => config.skip_frames_working,
            FeedStatus::Idle => config.skip_frames_idle,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded or raw pixel data, depending on `format`
    pub data: Bytes,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Pixel or container format (`RGB`, `jpeg`, `png`)
    pub format: String,

    /// Sequence number within the current stream
    pub sequence: u64,

    /// Capture time
    pub captured_at: DateTime<Utc>,
}

/// A configured feed with its resolved source identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub url: String,
    pub source_id: String,
    pub status: FeedStatus,
}

impl Feed {
    /// Resolve a configured feed; the status starts idle until looked up.
    pub fn new(config: &FeedConfig) -> Self {
        let source_id = config
            .source_id
            .clone()
            .unwrap_or_else(|| source_id_from_url(&config.url));
        Self {
            url: config.url.clone(),
            source_id,
            status: FeedStatus::Idle,
        }
    }

    pub fn with_status(self, status: FeedStatus) -> Self {
        Self { status, ..self }
    }
}

/// Host component of a feed URL, or the URL itself when it has none.
pub fn source_id_from_url(feed_url: &str) -> String {
    url::Url::parse(feed_url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| feed_url.to_string())
}

/// Opens frame streams for feeds.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn open(&self, feed: &Feed) -> Result<Box<dyn FrameStream>, FeedError>;
}

/// A sequential source of frames.
#[async_trait]
pub trait FrameStream: Send {
    /// Advance past one frame without decoding it. Returns `false` at end of stream.
    async fn grab(&mut self) -> Result<bool, FeedError>;

    /// Read and decode the next frame. Returns `None` at end of stream.
    async fn read(&mut self) -> Result<Option<Frame>, FeedError>;
}

/// Polls a still-image URL at a fixed interval.
#[derive(Debug, Clone)]
pub struct SnapshotConnector {
    client: reqwest::Client,
    interval: Duration,
}

impl SnapshotConnector {
    pub fn new(client: reqwest::Client, interval: Duration) -> Self {
        Self { client, interval }
    }
}

#[async_trait]
impl FeedConnector for SnapshotConnector {
    async fn open(&self, feed: &Feed) -> Result<Box<dyn FrameStream>, FeedError> {
        // probe once so unreachable cameras go through the reopen delay
        let response = self
            .client
            .head(&feed.url)
            .send()
            .await
            .map_err(|e| FeedError::Open {
                url: feed.url.clone(),
                reason: e.to_string(),
            })?;

        if response.status().is_server_error() {
            return Err(FeedError::Open {
                url: feed.url.clone(),
                reason: format!("status {}", response.status()),
            });
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(SnapshotStream {
            client: self.client.clone(),
            url: feed.url.clone(),
            ticker,
            sequence: 0,
        }))
    }
}

struct SnapshotStream {
    client: reqwest::Client,
    url: String,
    ticker: Interval,
    sequence: u64,
}

#[async_trait]
impl FrameStream for SnapshotStream {
    async fn grab(&mut self) -> Result<bool, FeedError> {
        self.ticker.tick().await;
        self.sequence += 1;
        Ok(true)
    }

    async fn read(&mut self) -> Result<Option<Frame>, FeedError> {
        self.ticker.tick().await;

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FeedError::Disconnected(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FeedError::Disconnected(format!(
                "snapshot returned {}",
                response.status()
            )));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| FeedError::Disconnected(e.to_string()))?;

        let frame = decode_snapshot(data, self.sequence)?;
        self.sequence += 1;
        debug!(url = %self.url, sequence = frame.sequence, "Snapshot received");
        Ok(Some(frame))
    }
}

/// Read dimensions and container format from an encoded still image.
pub fn decode_snapshot(data: Bytes, sequence: u64) -> Result<Frame, FeedError> {
    let reader = image::ImageReader::new(Cursor::new(data.as_ref()))
        .with_guessed_format()
        .map_err(|e| FeedError::Decode(e.to_string()))?;

    let format = match reader.format() {
        Some(image::ImageFormat::Jpeg) => "jpeg",
        Some(image::ImageFormat::Png) => "png",
        Some(other) => return Err(FeedError::Decode(format!("unsupported format {:?}", other))),
        None => return Err(FeedError::Decode("unrecognized image data".to_string())),
    };

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| FeedError::Decode(e.to_string()))?;

    Ok(Frame {
        data,
        width,
        height,
        format: format.to_string(),
        sequence,
        captured_at: Utc::now(),
    })
}

/// Dispatches to the snapshot or RTSP connector by URL scheme.
pub struct SchemeConnector {
    snapshot: SnapshotConnector,
    #[cfg(feature = "rtsp")]
    rtsp: crate::rtsp_source::RtspConnector,
}

impl SchemeConnector {
    pub fn new(config: &RecognitionConfig, client: reqwest::Client) -> Self {
        Self {
            snapshot: SnapshotConnector::new(client, config.snapshot_interval()),
            #[cfg(feature = "rtsp")]
            rtsp: crate::rtsp_source::RtspConnector::new(config),
        }
    }
}

#[async_trait]
impl FeedConnector for SchemeConnector {
    async fn open(&self, feed: &Feed) -> Result<Box<dyn FrameStream>, FeedError> {
        let scheme = url::Url::parse(&feed.url)
            .map(|parsed| parsed.scheme().to_string())
            .map_err(|e| FeedError::Open {
                url: feed.url.clone(),
                reason: e.to_string(),
            })?;

        match scheme.as_str() {
            "http" | "https" => self.snapshot.open(feed).await,
            #[cfg(feature = "rtsp")]
            "rtsp" | "rtsps" => self.rtsp.open(feed).await,
            #[cfg(not(feature = "rtsp"))]
            "rtsp" | "rtsps" => Err(FeedError::Open {
                url: feed.url.clone(),
                reason: "built without the rtsp feature".to_string(),
            }),
            other => Err(FeedError::Open {
                url: feed.url.clone(),
                reason: format!("unsupported scheme {}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_from_host() {
        assert_eq!(
            source_id_from_url("rtsp://admin:pw@172.14.0.112:554/Streaming/101"),
            "172.14.0.112"
        );
        assert_eq!(
            source_id_from_url("http://cam-3.local/snapshot.jpg"),
            "cam-3.local"
        );
        assert_eq!(source_id_from_url("not a url"), "not a url");
    }

    #[test]
    fn test_feed_prefers_configured_source_id() {
        let config = FeedConfig {
            url: "rtsp://172.14.0.112/stream".to_string(),
            source_id: Some("lobby".to_string()),
        };
        let feed = Feed::new(&config);
        assert_eq!(feed.source_id, "lobby");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(FeedStatus::parse("Working"), FeedStatus::Working);
        assert_eq!(FeedStatus::parse("working"), FeedStatus::Idle);
        assert_eq!(FeedStatus::parse("Off"), FeedStatus::Idle);
    }

    #[test]
    fn test_decode_png_snapshot() {
        let image = image::RgbImage::new(4, 3);
        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, image::ImageFormat::Png)
            .unwrap();

        let frame = decode_snapshot(Bytes::from(encoded.into_inner()), 7).unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.format, "png");
        assert_eq!(frame.sequence, 7);
    }

    #[test]
    fn test_decode_garbage_is_frame_local() {
        let err = decode_snapshot(Bytes::from_static(b"garbage"), 0).unwrap_err();
        assert!(err.is_frame_local());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let connector =
            SchemeConnector::new(&RecognitionConfig::default(), reqwest::Client::new());
        let feed = Feed {
            url: "ftp://172.14.0.112/frame".to_string(),
            source_id: "172.14.0.112".to_string(),
            status: FeedStatus::Idle,
        };
        let result = connector.open(&feed).await;
        assert!(matches!(result, Err(FeedError::Open { .. })));
    }
}
