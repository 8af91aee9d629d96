//! Offline rendering to memory or WAV.
//!
//! [`render_offline`] runs a compiled plan on the calling thread as fast as it
//! can, writing exactly `ceil(duration × sample_rate)` frames. The last block
//! is truncated to fit. Latency compensation is refreshed between blocks on the
//! same thread, so there is no background worker to manage.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hound::{SampleFormat, WavWriter};
use loam_core::{CompiledPlan, NodeId, ProcessingMode, RenderEngine};

use crate::{EngineConfig, Error, Result};

/// Destination for rendered blocks of interleaved samples.
pub trait BlockSink {
    /// Writes one block. `samples.len()` is a multiple of `channels`.
    fn write_block(&mut self, samples: &[f32], channels: usize) -> Result<()>;

    /// Flushes and closes the sink.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: BlockSink + ?Sized> BlockSink for &mut S {
    fn write_block(&mut self, samples: &[f32], channels: usize) -> Result<()> {
        (**self).write_block(samples, channels)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Collects rendered audio in memory.
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    samples: Vec<f32>,
    channels: usize,
}

impl VecSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interleaved samples written so far.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Channel count of the written audio, 0 before the first block.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Frames written so far.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }

    /// Consumes the sink and returns its samples.
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

impl BlockSink for VecSink {
    fn write_block(&mut self, samples: &[f32], channels: usize) -> Result<()> {
        self.channels = channels;
        self.samples.extend_from_slice(samples);
        Ok(())
    }
}

/// Writes rendered audio to a WAV file through `hound`.
///
/// 32-bit output is IEEE float; 16-bit output is clamped integer PCM.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    channels: usize,
    bits: u16,
}

impl WavSink {
    /// Creates the file using the sample rate, channel count, and bit depth in `config`.
    pub fn create(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: config.wav_bits,
            sample_format: if config.wav_bits == 32 {
                SampleFormat::Float
            } else {
                SampleFormat::Int
            },
        };
        Ok(Self {
            writer: Some(WavWriter::create(path, spec)?),
            channels: usize::from(config.channels),
            bits: config.wav_bits,
        })
    }
}

impl BlockSink for WavSink {
    fn write_block(&mut self, samples: &[f32], channels: usize) -> Result<()> {
        if channels != self.channels {
            return Err(Error::InvalidConfig(format!(
                "WAV file has {} channels, block has {channels}",
                self.channels
            )));
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if self.bits == 32 {
            for &sample in samples {
                writer.write_sample(sample)?;
            }
        } else {
            let max_val = (1i32 << (self.bits - 1)) as f32;
            for &sample in samples {
                let int_sample = (sample * max_val).clamp(-max_val, max_val - 1.0) as i32;
                writer.write_sample(int_sample)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

/// Cooperative cancellation for offline renders.
///
/// Cheap to clone; every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The render stops before its next block.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What an offline render produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSummary {
    /// Frames written to the sink.
    pub frames: u64,
    /// Blocks rendered.
    pub blocks: u64,
    /// Whether the render stopped early.
    pub cancelled: bool,
    /// Nodes that failed during the render.
    pub failed_nodes: Vec<NodeId>,
}

/// Renders `duration` of `plan` into `sink`.
///
/// `config` must describe the plan: its block size has to match the one the
/// plan was compiled with. The sink is finished even when the render is
/// cancelled.
pub fn render_offline<S: BlockSink>(
    plan: &mut CompiledPlan,
    config: &EngineConfig,
    duration: Duration,
    mut sink: S,
    cancel: &CancelToken,
) -> Result<RenderSummary> {
    config.validate()?;
    if config.block_size != plan.block_size() {
        return Err(Error::InvalidConfig(format!(
            "config block_size {} does not match plan block size {}",
            config.block_size,
            plan.block_size()
        )));
    }

    let total = config.frames_for(duration);
    let block_size = plan.block_size() as u64;
    let channels = plan.output_channels();
    let compensator = plan.compensator();
    let mut engine = RenderEngine::for_plan(plan);
    let mut ctx = config.process_context(ProcessingMode::Offline);

    tracing::info!(
        frames = total,
        sample_rate = config.sample_rate,
        block_size,
        "offline render started"
    );

    let mut written = 0u64;
    let mut blocks = 0u64;
    let mut cancelled = false;
    while written < total {
        if cancel.is_cancelled() {
            cancelled = true;
            tracing::info!(frames = written, "offline render cancelled");
            break;
        }
        let block = engine.process(plan, &mut ctx);
        let frames = block_size.min(total - written);
        let samples = frames as usize * channels;
        sink.write_block(&block.as_slice()[..samples], channels)?;
        written += frames;
        blocks += 1;

        if let Some(report) = compensator.refresh_if_dirty() {
            tracing::debug!(
                changed = report.changed,
                max_compensation = report.max_compensation,
                "latency compensation updated"
            );
        }
    }
    sink.finish()?;

    let failed_nodes = plan.monitor().failed_nodes();
    if !failed_nodes.is_empty() {
        tracing::warn!(count = failed_nodes.len(), "nodes failed during offline render");
    }
    tracing::info!(frames = written, blocks, "offline render finished");

    Ok(RenderSummary {
        frames: written,
        blocks,
        cancelled,
        failed_nodes,
    })
}
