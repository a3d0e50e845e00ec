//! Streaming transcription client.
//!
//! Captures microphone audio, streams it to a remote recognizer over a
//! negotiated realtime transport (with a chunked batch fallback), and
//! assembles the partial/final recognition events into a single live
//! transcript.

pub mod capture;
pub mod chunked;
pub mod error;
pub mod event;
pub mod realtime;
pub mod reconcile;
pub mod recorder;
pub mod source;
pub mod token;
pub mod transcript;

pub use error::TranscribeError;
pub use event::{ReducedEvent, reduce};
pub use reconcile::merge_display_text;
pub use recorder::{Recorder, RecorderConfig, RecorderUpdate, RecordingState};
pub use source::{SourceEvent, TranscriptionSource};
pub use token::{Credential, CredentialBroker};
pub use transcript::{TranscriptAssembler, TranscriptSegment};
