use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::error::TranscribeError;

/// Frames flowing out of an active capture, plus the device's native rate.
pub struct CaptureStream {
    /// Mono PCM frames. The channel closes when capture stops.
    pub frames: mpsc::Receiver<Vec<i16>>,
    pub sample_rate: u32,
}

/// Microphone capture seam.
///
/// Both transcription sources consume PCM through this trait; tests
/// substitute a scripted implementation.
pub trait AudioCapture: Send {
    /// Whether an input device is available at all.
    fn supported(&self) -> bool;
    /// Acquire the device and start delivering frames. Permission or device
    /// failures surface here, before any session is considered started.
    fn start(&mut self) -> Result<CaptureStream, TranscribeError>;
    /// Release the device. Idempotent; a no-op when never started.
    fn stop(&mut self);
}

/// Default microphone capture backed by cpal.
///
/// The `cpal::Stream` is not `Send`, so a dedicated thread owns it and
/// forwards converted frames; `stop()` signals the thread, which drops the
/// stream (releasing the device) and closes the frame channel.
#[derive(Default)]
pub struct CpalCapture {
    stop_flag: Option<Arc<AtomicBool>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioCapture for CpalCapture {
    fn supported(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&mut self) -> Result<CaptureStream, TranscribeError> {
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<i16>>(64);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32, String>>();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop = stop_flag.clone();

        let thread = std::thread::spawn(move || {
            run_capture_thread(frames_tx, ready_tx, stop);
        });

        let sample_rate = ready_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| TranscribeError::Capture("capture thread did not start".into()))?
            .map_err(TranscribeError::Capture)?;

        debug!(sample_rate, "microphone capture started");
        self.stop_flag = Some(stop_flag);
        self.thread = Some(thread);
        Ok(CaptureStream {
            frames: frames_rx,
            sample_rate,
        })
    }

    fn stop(&mut self) {
        if let Some(flag) = self.stop_flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("microphone capture released");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_thread(
    frames_tx: mpsc::Sender<Vec<i16>>,
    ready_tx: std::sync::mpsc::Sender<Result<u32, String>>,
    stop: Arc<AtomicBool>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = ready_tx.send(Err("no input device available".into()));
        return;
    };
    let config = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let err_fn = |e: cpal::StreamError| error!(%e, "capture stream error");

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            let tx = frames_tx.clone();
            device.build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    forward(data, channels, &tx, |v| {
                        (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                    });
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let tx = frames_tx.clone();
            device.build_input_stream(
                &config.into(),
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    forward(data, channels, &tx, |v| v);
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::U16 => {
            let tx = frames_tx.clone();
            device.build_input_stream(
                &config.into(),
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    forward(data, channels, &tx, |v| (v as i32 - (i16::MAX as i32 + 1)) as i16);
                },
                err_fn,
                None,
            )
        }
        other => {
            let _ = ready_tx.send(Err(format!("unsupported sample format {other:?}")));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(e.to_string()));
        return;
    }
    let _ = ready_tx.send(Ok(sample_rate));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    // Dropping the stream here releases the device and closes the channel.
}

/// Down-mix interleaved samples to mono i16 and hand them off without
/// blocking the audio callback; a full channel drops the frame.
fn forward<T: Copy>(
    data: &[T],
    channels: usize,
    tx: &mpsc::Sender<Vec<i16>>,
    convert: impl Fn(T) -> i16,
) {
    let mut frame = Vec::with_capacity(data.len() / channels.max(1));
    for group in data.chunks(channels.max(1)) {
        let sum: i32 = group.iter().map(|s| convert(*s) as i32).sum();
        frame.push((sum / group.len() as i32) as i16);
    }
    if tx.try_send(frame).is_err() {
        trace!("capture frame dropped; consumer behind");
    }
}
