use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::capture::{AudioCapture, CaptureStream};
use crate::error::{TranscribeError, truncate_detail};
use crate::event::{ReducedEvent, reduce};
use crate::source::{SourceEvent, TranscriptionSource};
use crate::token::Credential;

/// Soft deadline for ICE candidate gathering. Waiting lets the offer carry a
/// complete candidate set so the remote side connects in one round trip;
/// when the deadline fires the offer is sent with whatever was gathered.
pub const GATHERING_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound audio is G.711 μ-law so the track needs no native codec stack.
const ULAW_RATE: u32 = 8000;

/// Primary streaming path: a negotiated peer connection carrying the
/// microphone track out and recognition events back over a data channel.
pub struct RealtimeTransportSource {
    negotiate_url: String,
    credential: Credential,
    capture: Box<dyn AudioCapture>,
    events: mpsc::Sender<SourceEvent>,
    client: reqwest::Client,
    pc: Option<Arc<RTCPeerConnection>>,
    forward: Option<tokio::task::JoinHandle<()>>,
}

impl RealtimeTransportSource {
    pub fn new(
        negotiate_url: impl Into<String>,
        credential: Credential,
        capture: Box<dyn AudioCapture>,
        events: mpsc::Sender<SourceEvent>,
    ) -> Self {
        Self {
            negotiate_url: negotiate_url.into(),
            credential,
            capture,
            events,
            client: reqwest::Client::new(),
            pc: None,
            forward: None,
        }
    }

    async fn connect(&mut self, stream: CaptureStream) -> Result<(), TranscribeError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;
        let api = APIBuilder::new().with_media_engine(media).build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| TranscribeError::Connection(e.to_string()))?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: ULAW_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "microphone".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;

        let channel = pc
            .create_data_channel("oai-events", None)
            .await
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;
        let events = self.events.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let text = String::from_utf8_lossy(&msg.data);
                trace!(len = text.len(), "control channel message");
                let event = match reduce(&text) {
                    Some(ReducedEvent::Delta(fragment)) => SourceEvent::Interim(fragment),
                    Some(ReducedEvent::Completed(utterance)) => SourceEvent::Final(utterance),
                    // Unrecognized event types are expected protocol noise.
                    None => return,
                };
                let _ = events.send(event).await;
            })
        }));
        let events = self.events.clone();
        channel.on_error(Box::new(move |e| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events
                    .send(SourceEvent::Error(TranscribeError::Channel(e.to_string())))
                    .await;
            })
        }));

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;
        if !wait_for_gathering(&mut gathered, GATHERING_TIMEOUT).await {
            warn!("candidate gathering incomplete; sending offer with partial candidates");
        }
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| TranscribeError::Connection("local description missing".into()))?;

        let answer_sdp = post_offer(
            &self.client,
            &self.negotiate_url,
            &self.credential.secret,
            local.sdp,
        )
        .await?;
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| TranscribeError::Connection(e.to_string()))?;
        info!("realtime session negotiated");

        self.forward = Some(tokio::spawn(forward_audio(
            stream.frames,
            stream.sample_rate,
            track,
        )));
        self.pc = Some(pc);
        Ok(())
    }
}

#[async_trait]
impl TranscriptionSource for RealtimeTransportSource {
    fn supported(&self) -> bool {
        // The transport stack is compiled in; only the device can be absent.
        self.capture.supported()
    }

    async fn start(&mut self) -> Result<(), TranscribeError> {
        // Capture comes first; a denied or missing microphone means the
        // session never reaches "connected".
        let stream = self.capture.start()?;
        match self.connect(stream).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Capture succeeded before the failing step and must not leak.
                self.stop();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.capture.stop();
        if let Some(forward) = self.forward.take() {
            forward.abort();
        }
        if let Some(pc) = self.pc.take() {
            debug!("closing peer connection");
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let _ = pc.close().await;
                    });
                }
                Err(_) => {
                    warn!("no async runtime at teardown; peer connection dropped unclosed");
                }
            }
        }
    }
}

/// Wait for candidate gathering to finish, giving up at `deadline`. Returns
/// whether gathering completed; a timeout is not an error, the offer just
/// carries whatever candidates were collected so far.
async fn wait_for_gathering(gathered: &mut mpsc::Receiver<()>, deadline: Duration) -> bool {
    tokio::time::timeout(deadline, gathered.recv())
        .await
        .is_ok()
}

/// Send the local offer to the negotiation endpoint and return the answer
/// SDP. A non-success response surfaces its body, truncated, as detail.
async fn post_offer(
    client: &reqwest::Client,
    url: &str,
    secret: &str,
    sdp: String,
) -> Result<String, TranscribeError> {
    let response = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/sdp")
        .bearer_auth(secret)
        .body(sdp)
        .send()
        .await
        .map_err(|e| TranscribeError::Connection(e.to_string()))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(TranscribeError::Connection(format!(
            "http status {status}: {}",
            truncate_detail(&body)
        )));
    }
    Ok(body)
}

/// Pump capture frames into the outbound track, decimating to 8 kHz μ-law.
async fn forward_audio(
    mut frames: mpsc::Receiver<Vec<i16>>,
    sample_rate: u32,
    track: Arc<TrackLocalStaticSample>,
) {
    let step = (sample_rate / ULAW_RATE).max(1) as usize;
    while let Some(frame) = frames.recv().await {
        let encoded: Vec<u8> = frame
            .iter()
            .step_by(step)
            .map(|s| linear_to_ulaw(*s))
            .collect();
        if encoded.is_empty() {
            continue;
        }
        let duration = Duration::from_secs_f64(encoded.len() as f64 / ULAW_RATE as f64);
        let sample = Sample {
            data: Bytes::from(encoded),
            duration,
            ..Default::default()
        };
        if track.write_sample(&sample).await.is_err() {
            break;
        }
    }
    trace!("audio forwarding finished");
}

/// G.711 μ-law companding of one linear PCM sample.
fn linear_to_ulaw(pcm: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut sample = pcm as i32;
    let sign: u8 = if sample < 0 {
        sample = -sample;
        0x80
    } else {
        0x00
    };
    if sample > CLIP {
        sample = CLIP;
    }
    sample += BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (sample & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((sample >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}
