use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::capture::{AudioCapture, CpalCapture};
use crate::chunked::ChunkedFallbackSource;
use crate::error::TranscribeError;
use crate::event::ReducedEvent;
use crate::realtime::RealtimeTransportSource;
use crate::source::{SourceEvent, TranscriptionSource};
use crate::token::CredentialBroker;
use crate::transcript::{TranscriptAssembler, TranscriptSegment};

/// Where the recorder is in its session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Starting,
    Recording,
    Stopping,
}

/// Update pushed to the caller while a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderUpdate {
    /// Current reconciled display text, republished on every event.
    Interim(String),
    /// A newly finalized segment.
    Segment(TranscriptSegment),
    Error(TranscribeError),
}

/// Endpoints and knobs for a recorder.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Backend endpoint issuing the ephemeral credential.
    pub token_url: String,
    /// Remote recognizer negotiation endpoint (offer SDP in, answer out).
    pub negotiate_url: String,
    /// Backend batch endpoint used by the chunked fallback.
    pub transcribe_url: String,
    /// Language hint for the batch endpoint.
    pub language: String,
    /// Fallback chunk duration.
    pub chunk: Duration,
    /// Force the chunked fallback even where realtime transport would work.
    pub use_fallback: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            negotiate_url: "https://api.openai.com/v1/realtime?intent=transcription".into(),
            transcribe_url: String::new(),
            language: "en".into(),
            chunk: ChunkedFallbackSource::DEFAULT_CHUNK,
            use_fallback: false,
        }
    }
}

struct Inner {
    state: RecordingState,
    /// Bumped on every accepted start; guards stale setups and pumps.
    session: u64,
    assembler: TranscriptAssembler,
    source: Option<Box<dyn TranscriptionSource + Send>>,
}

/// The recording state machine.
///
/// Owns all mutable transcript state; sources push [`SourceEvent`]s through
/// an internal channel and a pump task applies them to the assembler.
/// Exactly one session can be active; `start()` is a silent no-op outside
/// `Idle`, and `stop()` is safe at any time, including concurrently with an
/// in-flight `start()`.
pub struct Recorder {
    config: RecorderConfig,
    broker: Arc<CredentialBroker>,
    inner: Arc<Mutex<Inner>>,
    updates: mpsc::Sender<RecorderUpdate>,
}

impl Recorder {
    pub fn new(config: RecorderConfig) -> (Self, mpsc::Receiver<RecorderUpdate>) {
        let broker = Arc::new(CredentialBroker::new(config.token_url.clone()));
        Self::with_broker(config, broker)
    }

    /// Construct with an injected broker, so several recorders (or an
    /// embedding application) can share one credential.
    pub fn with_broker(
        config: RecorderConfig,
        broker: Arc<CredentialBroker>,
    ) -> (Self, mpsc::Receiver<RecorderUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(64);
        let recorder = Self {
            config,
            broker,
            inner: Arc::new(Mutex::new(Inner {
                state: RecordingState::Idle,
                session: 0,
                assembler: TranscriptAssembler::new(),
                source: None,
            })),
            updates: updates_tx,
        };
        (recorder, updates_rx)
    }

    pub fn state(&self) -> RecordingState {
        self.locked().state
    }

    /// Finalized segments of the current (or most recent) session.
    pub fn segments(&self) -> Vec<TranscriptSegment> {
        self.locked().assembler.segments().to_vec()
    }

    /// The reconciled display text, recomputed on demand.
    pub fn transcript(&self) -> String {
        self.locked().assembler.display_text()
    }

    /// Start a session. A silent no-op unless currently `Idle`, so repeated
    /// or concurrent calls never produce two sessions.
    pub async fn start(&self) -> Result<(), TranscribeError> {
        let Some(session) = self.claim_start() else {
            return Ok(());
        };
        let (events_tx, events_rx) = mpsc::channel(64);
        match self.build_source(events_tx).await {
            Ok(source) => self.connect(source, events_rx, session).await,
            Err(e) => {
                self.abandon_start(session);
                let _ = self.updates.send(RecorderUpdate::Error(e.clone())).await;
                Err(e)
            }
        }
    }

    /// Start with a caller-provided source implementation; the source must
    /// have been built around the sender side of `events`.
    pub async fn start_with_source(
        &self,
        source: Box<dyn TranscriptionSource + Send>,
        events: mpsc::Receiver<SourceEvent>,
    ) -> Result<(), TranscribeError> {
        let Some(session) = self.claim_start() else {
            return Ok(());
        };
        if !source.supported() {
            let e = TranscribeError::Unsupported("source not supported here".into());
            self.abandon_start(session);
            let _ = self.updates.send(RecorderUpdate::Error(e.clone())).await;
            return Err(e);
        }
        self.connect(source, events, session).await
    }

    /// Stop the active session, cancelling an in-flight start if there is
    /// one. The capture device is released exactly once; calling this when
    /// already idle does nothing.
    pub fn stop(&self) {
        let source = {
            let mut inner = self.locked();
            if inner.state == RecordingState::Idle {
                debug!("stop ignored; already idle");
                return;
            }
            inner.state = RecordingState::Stopping;
            // Invalidate the session so straggler events still queued (or
            // emitted by callbacks racing teardown) are discarded by the
            // pump instead of mutating an idle recorder.
            inner.session += 1;
            inner.assembler.clear_interim();
            inner.source.take()
        };
        if let Some(mut source) = source {
            source.stop();
        }
        self.locked().state = RecordingState::Idle;
        info!("recording stopped");
    }

    fn claim_start(&self) -> Option<u64> {
        let mut inner = self.locked();
        if inner.state != RecordingState::Idle {
            debug!(state = ?inner.state, "start ignored; session already active");
            return None;
        }
        inner.state = RecordingState::Starting;
        inner.session += 1;
        inner.assembler.reset();
        info!(session = inner.session, "starting recording session");
        Some(inner.session)
    }

    fn abandon_start(&self, session: u64) {
        let mut inner = self.locked();
        if inner.session == session && inner.state == RecordingState::Starting {
            inner.state = RecordingState::Idle;
        }
    }

    async fn build_source(
        &self,
        events: mpsc::Sender<SourceEvent>,
    ) -> Result<Box<dyn TranscriptionSource + Send>, TranscribeError> {
        let capture = Box::new(CpalCapture::new());
        if !capture.supported() {
            return Err(TranscribeError::Unsupported(
                "no audio input device".into(),
            ));
        }
        if self.config.use_fallback {
            debug!("using chunked fallback source");
            return Ok(Box::new(ChunkedFallbackSource::new(
                self.config.transcribe_url.clone(),
                self.config.language.clone(),
                self.config.chunk,
                capture,
                events,
            )));
        }
        let credential = self.broker.obtain().await?;
        Ok(Box::new(RealtimeTransportSource::new(
            self.config.negotiate_url.clone(),
            credential,
            capture,
            events,
        )))
    }

    async fn connect(
        &self,
        mut source: Box<dyn TranscriptionSource + Send>,
        events: mpsc::Receiver<SourceEvent>,
        session: u64,
    ) -> Result<(), TranscribeError> {
        match source.start().await {
            Ok(()) => {
                let cancelled = {
                    let mut inner = self.locked();
                    if inner.session == session && inner.state == RecordingState::Starting {
                        inner.state = RecordingState::Recording;
                        inner.source = Some(source);
                        None
                    } else {
                        Some(source)
                    }
                };
                if let Some(mut source) = cancelled {
                    debug!(session, "start cancelled during setup; discarding session");
                    source.stop();
                    return Ok(());
                }
                info!(session, "recording");
                self.spawn_pump(events, session);
                Ok(())
            }
            Err(e) => {
                self.abandon_start(session);
                let _ = self.updates.send(RecorderUpdate::Error(e.clone())).await;
                Err(e)
            }
        }
    }

    fn spawn_pump(&self, mut events: mpsc::Receiver<SourceEvent>, session: u64) {
        let inner = Arc::clone(&self.inner);
        let updates = self.updates.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let out = {
                    let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    if guard.session != session {
                        break;
                    }
                    match event {
                        SourceEvent::Interim(fragment) => {
                            guard.assembler.apply(ReducedEvent::Delta(fragment));
                            vec![RecorderUpdate::Interim(guard.assembler.display_text())]
                        }
                        SourceEvent::Final(text) => {
                            let segment = guard.assembler.apply(ReducedEvent::Completed(text));
                            let mut out = Vec::with_capacity(2);
                            if let Some(segment) = segment {
                                out.push(RecorderUpdate::Segment(segment));
                            }
                            out.push(RecorderUpdate::Interim(guard.assembler.display_text()));
                            out
                        }
                        SourceEvent::Error(e) => vec![RecorderUpdate::Error(e)],
                    }
                };
                for update in out {
                    let _ = updates.send(update).await;
                }
            }
            trace!(session, "event pump finished");
        });
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
