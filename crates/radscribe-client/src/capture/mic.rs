use crate::capture::{AudioChunk, CaptureControl, CaptureFactory, CaptureStream};
use crate::error::{DictationError, Result};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Cadence for handing encoded chunks to the transport.
const CHUNK_INTERVAL: Duration = Duration::from_millis(250);

/// Sample formats we can encode, most preferred first. Acquisition fails if
/// the device supports none of them.
const FORMAT_PREFERENCES: &[SampleFormat] =
    &[SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Microphone-backed [`CaptureFactory`] using the default cpal host.
#[derive(Clone, Debug, Default)]
pub struct MicCaptureFactory;

#[async_trait]
impl CaptureFactory for MicCaptureFactory {
    fn is_available(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    async fn open(&self) -> Result<(Box<dyn CaptureStream>, Arc<dyn CaptureControl>)> {
        let (capture, control) = MicCapture::start().await?;
        Ok((Box::new(capture), control))
    }
}

/// Chunk stream for an open microphone. The cpal stream itself lives on a
/// dedicated thread because it is not `Send`; the audio callback appends
/// mono 16-bit PCM into a shared buffer, and an emitter task drains that
/// buffer on the chunk cadence or on demand.
pub struct MicCapture {
    rx: mpsc::Receiver<AudioChunk>,
}

struct MicControl {
    stopped: Arc<AtomicBool>,
    flush: Arc<Notify>,
    device_stop: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl CaptureControl for MicControl {
    fn flush(&self) {
        self.flush.notify_one();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.flush.notify_waiters();
        // Dropping the sender unparks the device thread, which releases the
        // cpal stream.
        if let Ok(mut guard) = self.device_stop.lock() {
            guard.take();
        }
    }
}

impl MicCapture {
    pub async fn start() -> Result<(Self, Arc<dyn CaptureControl>)> {
        let pcm_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let flush = Arc::new(Notify::new());

        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (device_stop_tx, device_stop_rx) = std::sync::mpsc::channel::<()>();

        {
            let pcm_buf = Arc::clone(&pcm_buf);
            let stopped = Arc::clone(&stopped);
            std::thread::spawn(move || {
                let stream = match build_input_stream(pcm_buf, stopped) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DictationError::Capability(e.to_string())));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Parked until the control handle drops our sender.
                let _ = device_stop_rx.recv();
                drop(stream);
                debug!("microphone released");
            });
        }

        ready_rx
            .await
            .map_err(|_| {
                DictationError::Capability("capture thread exited during startup".to_string())
            })??;

        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>(8);

        tokio::spawn({
            let pcm_buf = Arc::clone(&pcm_buf);
            let stopped = Arc::clone(&stopped);
            let flush = Arc::clone(&flush);
            async move {
                let mut ticker = interval(CHUNK_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = flush.notified() => {}
                    }

                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }

                    // Zero-byte chunks are forwarded on purpose; they tell
                    // the service the encoder is alive but has nothing yet.
                    let bytes = std::mem::take(&mut *lock_pcm(&pcm_buf));
                    if chunk_tx.send(AudioChunk::new(bytes)).await.is_err() {
                        break;
                    }
                }

                debug!("chunk emitter stopped");
            }
        });

        let control = Arc::new(MicControl {
            stopped,
            flush,
            device_stop: Mutex::new(Some(device_stop_tx)),
        });

        Ok((Self { rx: chunk_rx }, control))
    }
}

#[async_trait]
impl CaptureStream for MicCapture {
    async fn recv(&mut self) -> Option<AudioChunk> {
        self.rx.recv().await
    }
}

fn build_input_stream(pcm_buf: Arc<Mutex<Vec<u8>>>, stopped: Arc<AtomicBool>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DictationError::Capability("no audio input device available".to_string()))?;

    let supported: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| DictationError::Capability(e.to_string()))?
        .collect();

    let chosen = FORMAT_PREFERENCES
        .iter()
        .find_map(|format| {
            supported
                .iter()
                .find(|range| range.sample_format() == *format)
                .map(|range| range.clone().with_max_sample_rate())
        })
        .ok_or_else(|| {
            DictationError::Capability(
                "no supported input encoding (tried f32, i16, u16)".to_string(),
            )
        })?;

    let channels = usize::from(chosen.channels());
    if channels == 0 {
        return Err(DictationError::Capability(
            "input device reports no active channels".to_string(),
        ));
    }

    debug!(
        format = ?chosen.sample_format(),
        sample_rate_hz = chosen.sample_rate().0,
        channels,
        "negotiated microphone encoding"
    );

    let config: StreamConfig = chosen.config();
    let err_stopped = Arc::clone(&stopped);
    let err_fn = move |err| {
        warn!(error = %err, "microphone stream error");
        err_stopped.store(true, Ordering::SeqCst);
    };

    let stream = match chosen.sample_format() {
        SampleFormat::F32 => device
            .build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    append_pcm16(data, channels, |s| s, &pcm_buf, &stopped);
                },
                err_fn,
                None,
            )
            .map_err(|e| DictationError::Capability(e.to_string()))?,
        SampleFormat::I16 => device
            .build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    append_pcm16(data, channels, |s| s as f32 / 32768.0, &pcm_buf, &stopped);
                },
                err_fn,
                None,
            )
            .map_err(|e| DictationError::Capability(e.to_string()))?,
        SampleFormat::U16 => device
            .build_input_stream(
                &config,
                move |data: &[u16], _info| {
                    append_pcm16(
                        data,
                        channels,
                        |s| (s as f32 - 32768.0) / 32768.0,
                        &pcm_buf,
                        &stopped,
                    );
                },
                err_fn,
                None,
            )
            .map_err(|e| DictationError::Capability(e.to_string()))?,
        other => {
            return Err(DictationError::Capability(format!(
                "unsupported input sample format: {other:?}"
            )));
        }
    };

    Ok(stream)
}

/// Downmix interleaved input to mono and append it to the shared buffer as
/// little-endian 16-bit PCM. Runs on the audio callback thread.
fn append_pcm16<T: Copy>(
    data: &[T],
    channels: usize,
    to_f32: impl Fn(T) -> f32,
    pcm_buf: &Mutex<Vec<u8>>,
    stopped: &AtomicBool,
) {
    if stopped.load(Ordering::SeqCst) {
        return;
    }

    let frames = data.len() / channels.max(1);
    let mut out = lock_pcm(pcm_buf);
    out.reserve(frames * 2);

    for frame in data.chunks_exact(channels.max(1)) {
        let mut sum = 0.0f32;
        for &sample in frame {
            sum += to_f32(sample);
        }
        let mono = (sum / channels.max(1) as f32).clamp(-1.0, 1.0);
        let quantized = (mono * 32767.0) as i16;
        out.extend_from_slice(&quantized.to_le_bytes());
    }
}

fn lock_pcm(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    match buf.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
