//! Face detection and embedding extraction.
//!
//! Detection runs in an external inference service; this module defines the
//! seam and an HTTP client for it.

use crate::feed::Frame;
use crate::region::Point;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors from the recognition capability.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("Inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Inference service returned status {0}")]
    Status(u16),
}

/// Axis-aligned face box in pixel coordinates, `[x1, y1, x2, y2]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl BoundingBox {
    /// Clamp the box to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Integer midpoint of the box after clamping it to the frame.
    pub fn centroid(&self, width: u32, height: u32) -> Point {
        let clamped = self.clamp_to(width, height);
        let (x1, y1) = (clamped.x1 as i32, clamped.y1 as i32);
        let (x2, y2) = (clamped.x2 as i32, clamped.y2 as i32);
        Point::new((x1 + x2) / 2, (y1 + y2) / 2)
    }
}

/// One detected face.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Detects faces in a frame and returns their boxes and embeddings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, RecognitionError>;
}

/// Client for an HTTP inference service.
///
/// The frame body is posted as-is with its dimensions in headers; the service
/// answers `{"detections": [{"bbox": [x1, y1, x2, y2], "embedding": [...]}]}`.
#[derive(Debug, Clone)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpRecognizer {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

fn content_type(format: &str) -> &'static str {
    match format {
        "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, RecognitionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, content_type(&frame.format))
            .header("X-Frame-Width", frame.width)
            .header("X-Frame-Height", frame.height)
            .header("X-Frame-Format", frame.format.as_str())
            .body(frame.data.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecognitionError::Status(status.as_u16()));
        }

        let body: DetectResponse = response.json().await?;
        Ok(body.detections)
    }
}
