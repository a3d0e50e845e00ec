use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::event::ReducedEvent;
use crate::reconcile::merge_display_text;

/// One finalized utterance.
///
/// Immutable once created; `index` strictly increases in emission order
/// within a session, starting at 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptSegment {
    pub id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub index: u64,
}

/// Turns reduced recognition events into ordered segments plus an in-flight
/// interim string.
///
/// Deltas are appended to the interim buffer (concatenation, not
/// replacement); a completed event resets the buffer and appends a segment.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    segments: Vec<TranscriptSegment>,
    interim: String,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one reduced event. Returns the new segment when the event
    /// finalized an utterance.
    pub fn apply(&mut self, event: ReducedEvent) -> Option<TranscriptSegment> {
        match event {
            ReducedEvent::Delta(fragment) => {
                self.interim.push_str(&fragment);
                None
            }
            ReducedEvent::Completed(text) => {
                self.interim.clear();
                // An empty final still clears the interim but produces no
                // segment; segment text is always non-empty.
                if text.trim().is_empty() {
                    return None;
                }
                let segment = TranscriptSegment {
                    id: uuid::Uuid::new_v4().to_string(),
                    text,
                    received_at: Utc::now(),
                    index: self.segments.len() as u64,
                };
                debug!(index = segment.index, text = %segment.text, "segment finalized");
                self.segments.push(segment.clone());
                Some(segment)
            }
        }
    }

    /// Finalized segments, in emission order.
    pub fn segments(&self) -> &[TranscriptSegment] {
        &self.segments
    }

    /// The current in-progress fragment.
    pub fn interim(&self) -> &str {
        &self.interim
    }

    /// The reconciled display text for the whole session so far.
    pub fn display_text(&self) -> String {
        let finals: Vec<&str> = self.segments.iter().map(|s| s.text.as_str()).collect();
        merge_display_text(&finals, &self.interim)
    }

    /// Drop the in-progress fragment. Called on session stop.
    pub fn clear_interim(&mut self) {
        self.interim.clear();
    }

    /// Reset for a new session; indices restart at 0.
    pub fn reset(&mut self) {
        self.segments.clear();
        self.interim.clear();
    }
}
