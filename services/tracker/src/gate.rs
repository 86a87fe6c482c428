//! Per-identity cooldown gate.
//!
//! One gate instance is owned by each feed producer. A match is approved when
//! the identity has never been emitted, when the cooldown has elapsed since the
//! last approval, or when it was last emitted from a different source.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;

/// Outcome of submitting a match to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Approved,
    Suppressed,
}

impl GateDecision {
    pub fn is_approved(self) -> bool {
        self == GateDecision::Approved
    }
}

#[derive(Debug, Clone)]
struct LastEmission {
    at: DateTime<Utc>,
    source_id: String,
}

/// Cooldown state table keyed by identity.
#[derive(Debug)]
pub struct RecognitionGate {
    cooldown: TimeDelta,
    last_emitted: HashMap<String, LastEmission>,
}

impl RecognitionGate {
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            cooldown: TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX),
            last_emitted: HashMap::new(),
        }
    }

    /// Evaluate a match and record it when approved.
    pub fn evaluate(&mut self, identity: &str, source_id: &str, at: DateTime<Utc>) -> GateDecision {
        let approved = match self.last_emitted.get(identity) {
            None => true,
            Some(last) => at - last.at >= self.cooldown || last.source_id != source_id,
        };

        if !approved {
            return GateDecision::Suppressed;
        }

        self.last_emitted.insert(
            identity.to_string(),
            LastEmission {
                at,
                source_id: source_id.to_string(),
            },
        );
        GateDecision::Approved
    }

    /// Number of identities with recorded state.
    pub fn tracked(&self) -> usize {
        self.last_emitted.len()
    }
}
