//! Event recorder task.
//!
//! Producers hand approved events to an unbounded channel so a slow disk never
//! stalls frame processing. The recorder drains the channel in arrival order,
//! persisting each event to the outbox and to the identity's history file.

use crate::event::RecognitionEvent;
use crate::history::HistoryWriter;
use crate::outbox::Outbox;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Sending half used by producers.
pub type EventSink = mpsc::UnboundedSender<RecognitionEvent>;

/// Create a connected sink and recorder input.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<RecognitionEvent>) {
    mpsc::unbounded_channel()
}

pub struct EventRecorder {
    outbox: Arc<Outbox>,
    history: Option<HistoryWriter>,
    events: mpsc::UnboundedReceiver<RecognitionEvent>,
}

impl EventRecorder {
    pub fn new(
        outbox: Arc<Outbox>,
        history: Option<HistoryWriter>,
        events: mpsc::UnboundedReceiver<RecognitionEvent>,
    ) -> Self {
        Self {
            outbox,
            history,
            events,
        }
    }

    /// Record events until every sink has been dropped.
    pub async fn run(mut self) {
        let mut recorded = 0u64;

        while let Some(event) = self.events.recv().await {
            let outbox = self.outbox.clone();
            let history = self.history.clone();

            match tokio::task::spawn_blocking(move || persist(&outbox, history.as_ref(), &event))
                .await
            {
                Ok(true) => recorded += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "Recorder write task failed"),
            }
        }

        info!(recorded, "Event recorder stopped");
    }
}

fn persist(outbox: &Outbox, history: Option<&HistoryWriter>, event: &RecognitionEvent) -> bool {
    if let Err(e) = outbox.append(event) {
        error!(
            identity = %event.identity,
            source_id = %event.source_id,
            error = %e,
            "Failed to append event to outbox"
        );
        return false;
    }

    if let Some(history) = history {
        match history.record(event) {
            Ok(path) => debug!(path = %path.display(), "History record written"),
            Err(e) => warn!(
                identity = %event.identity,
                error = %e,
                "Failed to write history record"
            ),
        }
    }

    true
}
