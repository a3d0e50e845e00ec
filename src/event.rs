use serde::Deserialize;

/// A recognition event reduced from a raw control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReducedEvent {
    /// Incremental text fragment, not yet finalized.
    Delta(String),
    /// Whole finalized utterance.
    Completed(String),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RawEvent {
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    Delta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    Completed { transcript: String },
    #[serde(other)]
    Other,
}

/// Classify a raw control-channel message.
///
/// Returns `None` for malformed or unrecognized messages; streaming control
/// channels routinely carry event types this subsystem does not care about,
/// so that is protocol noise rather than an error.
pub fn reduce(raw: &str) -> Option<ReducedEvent> {
    match serde_json::from_str(raw) {
        Ok(RawEvent::Delta { delta }) => Some(ReducedEvent::Delta(delta)),
        Ok(RawEvent::Completed { transcript }) => Some(ReducedEvent::Completed(transcript)),
        Ok(RawEvent::Other) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduces_delta_events() {
        let raw = r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"hel"}"#;
        assert_eq!(reduce(raw), Some(ReducedEvent::Delta("hel".into())));
    }

    #[test]
    fn reduces_completed_events() {
        let raw = r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hello doc"}"#;
        assert_eq!(
            reduce(raw),
            Some(ReducedEvent::Completed("hello doc".into()))
        );
    }

    #[test]
    fn ignores_unrecognized_event_types() {
        let raw = r#"{"type":"session.created","session":{"id":"abc"}}"#;
        assert_eq!(reduce(raw), None);
    }

    #[test]
    fn ignores_malformed_messages() {
        assert_eq!(reduce("not json"), None);
        assert_eq!(reduce(""), None);
        assert_eq!(reduce("{}"), None);
    }

    #[test]
    fn ignores_delta_with_missing_field() {
        let raw = r#"{"type":"conversation.item.input_audio_transcription.delta"}"#;
        assert_eq!(reduce(raw), None);
    }

    #[test]
    fn preserves_whitespace_in_fragments() {
        let raw = r#"{"type":"conversation.item.input_audio_transcription.delta","delta":" world"}"#;
        assert_eq!(reduce(raw), Some(ReducedEvent::Delta(" world".into())));
    }
}
