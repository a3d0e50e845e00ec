use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::capture::AudioCapture;
use crate::error::TranscribeError;
use crate::source::{SourceEvent, TranscriptionSource};

/// Batch-endpoint fallback for environments without realtime transport.
///
/// Captured audio is sliced into fixed-duration chunks; each closed chunk is
/// WAV-encoded and posted to the batch recognition endpoint, and a successful
/// response becomes one final segment. This path never produces interim text.
pub struct ChunkedFallbackSource {
    transcribe_url: String,
    language: String,
    chunk: Duration,
    capture: Box<dyn AudioCapture>,
    events: mpsc::Sender<SourceEvent>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    ok: bool,
    text: Option<String>,
    error: Option<String>,
}

impl ChunkedFallbackSource {
    pub const DEFAULT_CHUNK: Duration = Duration::from_secs(4);

    pub fn new(
        transcribe_url: impl Into<String>,
        language: impl Into<String>,
        chunk: Duration,
        capture: Box<dyn AudioCapture>,
        events: mpsc::Sender<SourceEvent>,
    ) -> Self {
        Self {
            transcribe_url: transcribe_url.into(),
            language: language.into(),
            chunk,
            capture,
            events,
            worker: None,
        }
    }
}

#[async_trait]
impl TranscriptionSource for ChunkedFallbackSource {
    fn supported(&self) -> bool {
        self.capture.supported()
    }

    async fn start(&mut self) -> Result<(), TranscribeError> {
        let stream = self.capture.start()?;
        let chunk_samples =
            ((stream.sample_rate as f64 * self.chunk.as_secs_f64()) as usize).max(1);
        info!(
            chunk_samples,
            sample_rate = stream.sample_rate,
            "chunked fallback source started"
        );
        self.worker = Some(tokio::spawn(run_chunks(
            stream.frames,
            stream.sample_rate,
            chunk_samples,
            self.transcribe_url.clone(),
            self.language.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    /// Releases the capture device; the worker then drains buffered frames,
    /// transcribing the in-progress chunk so no trailing audio is dropped.
    fn stop(&mut self) {
        self.capture.stop();
        self.worker.take();
    }
}

async fn run_chunks(
    mut frames: mpsc::Receiver<Vec<i16>>,
    sample_rate: u32,
    chunk_samples: usize,
    url: String,
    language: String,
    events: mpsc::Sender<SourceEvent>,
) {
    let client = reqwest::Client::new();
    let mut buffer: Vec<i16> = Vec::new();
    while let Some(frame) = frames.recv().await {
        buffer.extend_from_slice(&frame);
        while buffer.len() >= chunk_samples {
            let chunk: Vec<i16> = buffer.drain(..chunk_samples).collect();
            transcribe_chunk(&client, &url, &language, sample_rate, chunk, &events).await;
        }
    }
    // Capture ended; flush the in-progress chunk.
    if !buffer.is_empty() {
        transcribe_chunk(&client, &url, &language, sample_rate, buffer, &events).await;
    }
    debug!("chunk worker finished");
}

/// Send one chunk to the batch endpoint. A failed chunk reports an error
/// event and the session continues with the next chunk.
async fn transcribe_chunk(
    client: &reqwest::Client,
    url: &str,
    language: &str,
    sample_rate: u32,
    samples: Vec<i16>,
    events: &mpsc::Sender<SourceEvent>,
) {
    debug!(samples = samples.len(), "transcribing chunk");
    let result = upload_chunk(client, url, language, sample_rate, samples).await;
    let event = match result {
        Ok(Some(text)) => SourceEvent::Final(text),
        Ok(None) => return,
        Err(e) => {
            error!(%e, "chunk transcription failed");
            SourceEvent::Error(e)
        }
    };
    let _ = events.send(event).await;
}

async fn upload_chunk(
    client: &reqwest::Client,
    url: &str,
    language: &str,
    sample_rate: u32,
    samples: Vec<i16>,
) -> Result<Option<String>, TranscribeError> {
    let wav = encode_wav(&samples, sample_rate)
        .map_err(|e| TranscribeError::Transcription(e.to_string()))?;
    let part = reqwest::multipart::Part::bytes(wav)
        .file_name("chunk.wav")
        .mime_str("audio/wav")
        .map_err(|e| TranscribeError::Transcription(e.to_string()))?;
    let form = reqwest::multipart::Form::new()
        .part("audio", part)
        .text("language", language.to_string());

    let response = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .map_err(|e| TranscribeError::Transcription(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(TranscribeError::Transcription(format!(
            "http status {status}"
        )));
    }
    let body: TranscribeResponse = response
        .json()
        .await
        .map_err(|e| TranscribeError::Transcription(e.to_string()))?;
    if !body.ok {
        return Err(TranscribeError::Transcription(
            body.error.unwrap_or_else(|| "transcription refused".into()),
        ));
    }
    Ok(body.text.filter(|t| !t.trim().is_empty()))
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for sample in samples {
        writer.write_sample(*sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureStream;
    use httpmock::prelude::*;

    /// Capture double that hands out a pre-filled frame channel.
    struct ScriptedCapture {
        frames: Vec<Vec<i16>>,
        sample_rate: u32,
        stopped: bool,
    }

    impl ScriptedCapture {
        fn new(frames: Vec<Vec<i16>>, sample_rate: u32) -> Self {
            Self {
                frames,
                sample_rate,
                stopped: false,
            }
        }
    }

    impl AudioCapture for ScriptedCapture {
        fn supported(&self) -> bool {
            true
        }

        fn start(&mut self) -> Result<CaptureStream, TranscribeError> {
            let (tx, rx) = mpsc::channel(self.frames.len().max(1));
            for frame in self.frames.drain(..) {
                tx.try_send(frame).unwrap();
            }
            // Dropping the sender ends the stream once buffered frames drain.
            Ok(CaptureStream {
                frames: rx,
                sample_rate: self.sample_rate,
            })
        }

        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    #[tokio::test]
    async fn emits_one_final_per_chunk_and_flushes_the_tail() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/transcribe");
                then.status(200)
                    .json_body(serde_json::json!({"ok": true, "text": "chunk text"}));
            })
            .await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        // 8 kHz with 1 s chunks: 20 000 samples = 2 full chunks + a tail.
        let frames: Vec<Vec<i16>> = (0..20).map(|_| vec![100i16; 1000]).collect();
        let mut source = ChunkedFallbackSource::new(
            server.url("/transcribe"),
            "en",
            Duration::from_secs(1),
            Box::new(ScriptedCapture::new(frames, 8000)),
            events_tx,
        );
        assert!(source.supported());
        source.start().await.unwrap();
        source.stop();
        drop(source);

        let mut finals = 0;
        while let Some(event) = events_rx.recv().await {
            assert_eq!(event, SourceEvent::Final("chunk text".into()));
            finals += 1;
        }
        assert_eq!(finals, 3);
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn failed_chunk_reports_error_and_continues() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/transcribe");
                then.status(200)
                    .json_body(serde_json::json!({"ok": false, "error": "overloaded"}));
            })
            .await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let frames: Vec<Vec<i16>> = (0..16).map(|_| vec![7i16; 1000]).collect();
        let mut source = ChunkedFallbackSource::new(
            server.url("/transcribe"),
            "en",
            Duration::from_secs(1),
            Box::new(ScriptedCapture::new(frames, 8000)),
            events_tx,
        );
        source.start().await.unwrap();
        drop(source);

        let mut errors = 0;
        while let Some(event) = events_rx.recv().await {
            assert!(matches!(
                event,
                SourceEvent::Error(TranscribeError::Transcription(_))
            ));
            errors += 1;
        }
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn empty_transcript_produces_no_event() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/transcribe");
                then.status(200)
                    .json_body(serde_json::json!({"ok": true, "text": "  "}));
            })
            .await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let frames: Vec<Vec<i16>> = (0..8).map(|_| vec![7i16; 1000]).collect();
        let mut source = ChunkedFallbackSource::new(
            server.url("/transcribe"),
            "en",
            Duration::from_secs(1),
            Box::new(ScriptedCapture::new(frames, 8000)),
            events_tx,
        );
        source.start().await.unwrap();
        drop(source);

        assert_eq!(events_rx.recv().await, None);
    }

    #[test]
    fn wav_encoding_roundtrips_header() {
        let wav = encode_wav(&[0i16; 160], 16000).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 160);
    }
}
