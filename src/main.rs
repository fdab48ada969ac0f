use std::{f32::consts::TAU, time::Duration};

use mediaport::{
    Adapter, BoxedEngine, FillInfo, FrameQueueSurface, Notification, RemoteEngine, SoftwareEngine,
    buffer::SharedMemory,
    common::{logger, types::AnyResult},
    configs::{Config, EngineConfig, EngineKind},
    constants::FRAMES_PER_SECOND,
    format::MediaFormat,
};
use tracing::{error, info, warn};

/// Buffers fed before end of input is signalled (five seconds of audio).
const TONE_BUFFERS: u64 = 250;
const TONE_HZ: f32 = 440.0;
const TONE_AMPLITUDE: f32 = 8_000.0;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("{}, using built-in defaults", e);
        Config::default()
    });
    logger::init(&config);

    let adapter = Adapter::spawn(config.adapter.clone(), build_engine(&config.engine));
    info!(
        "[{}] {:?} engine, input {}",
        adapter.name(),
        config.engine.kind,
        config.stream.input
    );

    if config.surface.enabled {
        adapter.set_output_sink(Some(Box::new(FrameQueueSurface::new(&config.surface))))?;
    }
    adapter.allocate()?;
    adapter.configure(config.stream.clone())?;
    adapter.start()?;

    let mut tone = Tone::new(config.stream.input);
    let mut fed = 0u64;
    let mut drained = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("[{}] interrupted after {} buffers", adapter.name(), fed);
                break;
            }
            note = adapter.next_notification() => {
                let Some(note) = note else {
                    break;
                };
                match note {
                    Notification::FillThisBuffer(desc) if fed < TONE_BUFFERS => {
                        tone.fill(desc.payload.memory(), fed)?;
                        adapter.buffer_filled(
                            desc.id(),
                            FillInfo {
                                timestamp_us: fed * 1_000_000 / u64::from(FRAMES_PER_SECOND),
                                ..Default::default()
                            },
                        )?;
                        fed += 1;
                        if fed == TONE_BUFFERS {
                            adapter.signal_end_of_input()?;
                        }
                    }
                    Notification::DrainThisBuffer(desc, _) => {
                        drained += 1;
                        adapter.buffer_released(desc.id())?;
                    }
                    Notification::OutputFormatChanged(format) => {
                        info!("[{}] output is now {}", adapter.name(), format);
                    }
                    Notification::EndOfStream => {
                        info!(
                            "[{}] end of stream: {} buffers in, {} drained",
                            adapter.name(),
                            fed,
                            drained
                        );
                        break;
                    }
                    Notification::Error(e) => error!("[{}] {}", adapter.name(), e),
                    _ => {}
                }
            }
        }
    }

    adapter.shutdown(false)?;
    let completed = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(note) = adapter.next_notification().await {
            if matches!(note, Notification::ShutdownCompleted) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !completed {
        warn!("[{}] shutdown did not complete", adapter.name());
    }

    info!(
        "[{}] stats {}",
        adapter.name(),
        serde_json::to_string(&adapter.stats())?
    );
    adapter.close().await;
    Ok(())
}

fn build_engine(config: &EngineConfig) -> BoxedEngine {
    match config.kind {
        EngineKind::Software => Box::new(SoftwareEngine::with_latency(config.latency())),
        EngineKind::Remote => Box::new(RemoteEngine::new().with_link_depth(config.link_depth)),
    }
}

/// Test signal written into input buffers: a sine for audio, flat frames
/// whose brightness follows the frame number for video.
struct Tone {
    media: MediaFormat,
    phase: f32,
}

impl Tone {
    fn new(media: MediaFormat) -> Self {
        Self { media, phase: 0.0 }
    }

    fn fill(&mut self, memory: &SharedMemory, frame: u64) -> mediaport::Result<()> {
        let bytes = match self.media {
            MediaFormat::Audio {
                sample_rate,
                channels,
            } => {
                let channels = usize::from(channels.max(1));
                let step = TAU * TONE_HZ / sample_rate as f32;
                let frames = memory.capacity() / (2 * channels);
                let mut out = Vec::with_capacity(frames * 2 * channels);
                for _ in 0..frames {
                    let sample = (self.phase.sin() * TONE_AMPLITUDE) as i16;
                    for _ in 0..channels {
                        out.extend_from_slice(&sample.to_le_bytes());
                    }
                    self.phase = (self.phase + step) % TAU;
                }
                out
            }
            MediaFormat::Video { .. } => vec![(frame % 256) as u8; memory.capacity()],
        };
        memory.write(&bytes)
    }
}
