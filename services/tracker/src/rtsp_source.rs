//! RTSP frame source backed by a GStreamer pipeline.
//!
//! Decoded RGB frames are pushed from the appsink callback into a small bounded
//! channel; frames are dropped under backpressure. A blocking bus monitor marks
//! the stream failed on pipeline error or end of stream.

use crate::config::RecognitionConfig;
use crate::feed::{Feed, FeedConnector, FeedError, Frame, FrameStream};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FRAME_BUFFER: usize = 4;
const STATE_CHANGE_TIMEOUT_SECS: u64 = 10;

/// Opens RTSP feeds through GStreamer.
#[derive(Debug, Clone)]
pub struct RtspConnector {
    transport: String,
    latency_ms: u32,
}

impl RtspConnector {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            transport: config.transport.clone(),
            latency_ms: config.buffer_ms,
        }
    }

    fn pipeline_description(&self, url: &str) -> String {
        let protocols = match self.transport.as_str() {
            "udp" => "0",
            "udp-mcast" => "1",
            _ => "2",
        };

        format!(
            "rtspsrc location={url} protocols={protocols} latency={latency} \
             ! decodebin ! videoconvert \
             ! video/x-raw,format=RGB \
             ! appsink name=sink emit-signals=true sync=false max-buffers=2 drop=true",
            url = url,
            protocols = protocols,
            latency = self.latency_ms,
        )
    }
}

#[async_trait]
impl FeedConnector for RtspConnector {
    async fn open(&self, feed: &Feed) -> Result<Box<dyn FrameStream>, FeedError> {
        let open_err = |reason: String| FeedError::Open {
            url: feed.url.clone(),
            reason,
        };

        gst::init().map_err(|e| open_err(e.to_string()))?;

        let description = self.pipeline_description(&feed.url);
        debug!(source_id = %feed.source_id, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| open_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("not a pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_err("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_err("sink is not an appsink".to_string()))?;

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let running = Arc::new(AtomicBool::new(true));
        let failed = CancellationToken::new();

        install_sample_callback(&appsink, tx, running.clone(), feed.source_id.clone());

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_err(e.to_string()))?;

        let (result, _current, _pending) =
            pipeline.state(gst::ClockTime::from_seconds(STATE_CHANGE_TIMEOUT_SECS));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_err("timeout waiting for pipeline to start".to_string()));
        }

        spawn_bus_monitor(
            pipeline.clone(),
            running.clone(),
            failed.clone(),
            feed.source_id.clone(),
        );

        info!(source_id = %feed.source_id, "Connected to RTSP stream");

        Ok(Box::new(RtspStream {
            pipeline,
            frames: rx,
            running,
            failed,
        }))
    }
}

fn install_sample_callback(
    appsink: &gst_app::AppSink,
    sender: mpsc::Sender<Frame>,
    running: Arc<AtomicBool>,
    source_id: String,
) {
    let sequence = Arc::new(AtomicU64::new(0));

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                if !running.load(Ordering::SeqCst) {
                    return Err(gst::FlowError::Eos);
                }

                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                let structure = caps.structure(0).ok_or(gst::FlowError::Error)?;

                let width: i32 = structure.get("width").map_err(|_| gst::FlowError::Error)?;
                let height: i32 = structure.get("height").map_err(|_| gst::FlowError::Error)?;
                let format = structure
                    .get::<&str>("format")
                    .unwrap_or("RGB")
                    .to_string();

                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

                let frame = Frame {
                    data: Bytes::copy_from_slice(map.as_slice()),
                    width: width as u32,
                    height: height as u32,
                    format,
                    sequence: sequence.fetch_add(1, Ordering::SeqCst),
                    captured_at: Utc::now(),
                };

                match sender.try_send(frame) {
                    Ok(()) => Ok(gst::FlowSuccess::Ok),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(source_id = %source_id, "Frame dropped due to backpressure");
                        Ok(gst::FlowSuccess::Ok)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(gst::FlowError::Eos),
                }
            })
            .build(),
    );
}

fn spawn_bus_monitor(
    pipeline: gst::Pipeline,
    running: Arc<AtomicBool>,
    failed: CancellationToken,
    source_id: String,
) {
    let Some(bus) = pipeline.bus() else {
        return;
    };

    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::SeqCst) {
            let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };

            match msg.view() {
                gst::MessageView::Error(err) => {
                    error!(
                        source_id = %source_id,
                        error = %err.error(),
                        debug = ?err.debug(),
                        "GStreamer pipeline error"
                    );
                    failed.cancel();
                    break;
                }
                gst::MessageView::Eos(_) => {
                    info!(source_id = %source_id, "End of stream");
                    failed.cancel();
                    break;
                }
                gst::MessageView::Warning(w) => {
                    warn!(source_id = %source_id, warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }
    });
}

struct RtspStream {
    pipeline: gst::Pipeline,
    frames: mpsc::Receiver<Frame>,
    running: Arc<AtomicBool>,
    failed: CancellationToken,
}

impl RtspStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, FeedError> {
        tokio::select! {
            frame = self.frames.recv() => Ok(frame),
            _ = self.failed.cancelled() => {
                Err(FeedError::Disconnected("pipeline stopped".to_string()))
            }
        }
    }
}

#[async_trait]
impl FrameStream for RtspStream {
    async fn grab(&mut self) -> Result<bool, FeedError> {
        Ok(self.next_frame().await?.is_some())
    }

    async fn read(&mut self) -> Result<Option<Frame>, FeedError> {
        self.next_frame().await
    }
}

impl Drop for RtspStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_description_tcp() {
        let connector = RtspConnector::new(&RecognitionConfig::default());
        let description = connector.pipeline_description("rtsp://172.14.0.112:554/stream");
        assert!(description.contains("protocols=2"));
        assert!(description.contains("latency=200"));
        assert!(description.contains("rtsp://172.14.0.112:554/stream"));
    }

    #[test]
    fn test_pipeline_description_udp() {
        let mut config = RecognitionConfig::default();
        config.transport = "udp".to_string();
        let connector = RtspConnector::new(&config);
        assert!(connector
            .pipeline_description("rtsp://cam/stream")
            .contains("protocols=0"));
    }
}
