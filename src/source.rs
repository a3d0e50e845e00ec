use async_trait::async_trait;

use crate::error::TranscribeError;

/// Event emitted by a running transcription source over its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// In-progress fragment, to be appended to the interim buffer.
    Interim(String),
    /// Finalized utterance.
    Final(String),
    /// A failure the caller should see; whether the session survives depends
    /// on the variant (channel errors leave it stoppable, chunk errors keep
    /// going).
    Error(TranscribeError),
}

/// Abstract transcription source.
///
/// Implemented by the realtime transport path and the chunked batch
/// fallback. A source is handed an `mpsc::Sender<SourceEvent>` at
/// construction and emits everything through it; callers drive it only
/// through this trait.
#[async_trait]
pub trait TranscriptionSource: Send {
    /// Whether this source can run in the current environment.
    fn supported(&self) -> bool;

    /// Acquire resources and begin streaming events. On failure the source
    /// is left fully stopped (no capture device leak).
    async fn start(&mut self) -> Result<(), TranscribeError>;

    /// Tear down. Synchronous, idempotent, and a no-op when never started.
    fn stop(&mut self);
}
