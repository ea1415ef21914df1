use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use crate::config::DaqConfig;
use crate::message::InitMessage;

/// Format of the creation timestamp reported to clients.
pub const DATE_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Largest streamed chunk, in sample bytes across all channels.
pub const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// Requests that cannot be turned into an acquisition run.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    #[error("block size must be positive")]
    ZeroBlockSize,

    #[error("experiment length {0} is not a finite, non-negative number of seconds")]
    BadLength(f32),

    #[error("a block of {samples} samples on {nchannels} channels exceeds {limit} bytes")]
    ChunkTooLarge {
        samples: u32,
        nchannels: u16,
        limit: u64,
    },
}

/// The server's description of one client's acquisition run.
///
/// Built once from the client's `INIT_EXPERIMENT` and never modified.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Task {
    pub handle: u32,
    pub nchannels: u16,
    /// Requested experiment length, seconds.
    pub length: f32,
    /// Samples per channel over the whole run.
    pub nsamples: u32,
    pub block_size: u32,
    pub sample_rate: f32,
    pub adc_range: f32,
    /// Volts per quantisation step.
    pub adc_resolution: f32,
    pub trigger: String,
    pub date: String,
    pub created_at: DateTime<Local>,
}

impl Task {
    pub fn trigger_length(&self) -> u32 {
        self.trigger.len() as u32
    }

    pub fn date_length(&self) -> u32 {
        self.date.len() as u32
    }

    /// Samples per channel in the largest chunk actually streamed.
    pub fn chunk_samples(&self) -> u32 {
        self.block_size.min(self.nsamples)
    }

    /// Number of blocks needed to deliver `nsamples`; the last may be short.
    pub fn nchunks(&self) -> u32 {
        self.nsamples.div_ceil(self.block_size)
    }

    /// Bytes streamed for `samples` samples on every channel.
    pub fn bytes_for(&self, samples: u64) -> u64 {
        samples * self.nchannels as u64 * 2
    }
}

pub fn create_task(init: &InitMessage, config: &DaqConfig) -> Result<Task, TaskError> {
    create_task_at(init, config, Local::now())
}

pub fn create_task_at(
    init: &InitMessage,
    config: &DaqConfig,
    now: DateTime<Local>,
) -> Result<Task, TaskError> {
    if init.block_size == 0 {
        return Err(TaskError::ZeroBlockSize);
    }
    if !init.expt_length.is_finite() || init.expt_length < 0.0 {
        return Err(TaskError::BadLength(init.expt_length));
    }

    // Truncates, saturating at u32::MAX
    let nsamples = (init.expt_length as f64 * config.sample_rate as f64) as u32;
    let chunk_samples = init.block_size.min(nsamples);
    if chunk_samples as u64 * config.nchannels as u64 * 2 > MAX_CHUNK_BYTES {
        return Err(TaskError::ChunkTooLarge {
            samples: chunk_samples,
            nchannels: config.nchannels,
            limit: MAX_CHUNK_BYTES,
        });
    }
    let adc_resolution = ((init.adc_range as f64 / 2.0) / 65536.0) as f32;

    Ok(Task {
        handle: config.task_handle,
        nchannels: config.nchannels,
        length: init.expt_length,
        nsamples,
        block_size: init.block_size,
        sample_rate: config.sample_rate,
        adc_range: init.adc_range,
        adc_resolution,
        trigger: init.trigger.clone(),
        date: now.format(DATE_FORMAT).to_string(),
        created_at: now,
    })
}
