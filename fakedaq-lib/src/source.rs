//! Where streamed samples come from.

use std::borrow::Cow;
use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::PathBuf;

use log::info;
use thiserror::Error;

use crate::bin_file::BinFileSource;
use crate::task::Task;

/// Errors returned by sample sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("recording I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed recording header: {0}")]
    BadHeader(String),

    #[error("recording has {available} channels, task needs {requested}")]
    ChannelMismatch { requested: u32, available: u32 },

    #[error("samples {start}..{end} requested, recording holds {available}")]
    OutOfRange { start: u64, end: u64, available: u64 },
}

/// A provider of blocks of 16-bit signed samples.
pub trait SampleSource {
    /// Returns `samples.len()` consecutive samples for each channel in
    /// `channels`, big-endian, grouped by channel (all of the first channel,
    /// then all of the next).
    fn read_block(
        &mut self,
        channels: Range<u16>,
        samples: Range<u64>,
    ) -> Result<Cow<'_, [u8]>, SourceError>;
}

/// Repeats one precomputed block in which every sample of channel `c` is `c`.
#[derive(Debug)]
pub struct SyntheticSource {
    nchannels: u16,
    block_size: usize,
    template: Vec<u8>,
}

impl SyntheticSource {
    pub fn new(nchannels: u16, block_size: u32) -> Self {
        let block_size = block_size as usize;
        Self {
            nchannels,
            block_size,
            template: Self::pattern(0..nchannels, block_size),
        }
    }

    fn pattern(channels: Range<u16>, nsamples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(channels.len() * nsamples * 2);
        for chan in channels {
            let sample = (chan as i16).to_be_bytes();
            for _ in 0..nsamples {
                out.extend_from_slice(&sample);
            }
        }
        out
    }
}

impl SampleSource for SyntheticSource {
    fn read_block(
        &mut self,
        channels: Range<u16>,
        samples: Range<u64>,
    ) -> Result<Cow<'_, [u8]>, SourceError> {
        let nsamples = (samples.end - samples.start) as usize;
        if channels == (0..self.nchannels) && nsamples == self.block_size {
            Ok(Cow::Borrowed(self.template.as_slice()))
        } else {
            Ok(Cow::Owned(Self::pattern(channels, nsamples)))
        }
    }
}

/// Which kind of source each session streams from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    Synthetic,
    Recording(PathBuf),
}

impl SourceSpec {
    /// Opens a source for one session's task.
    pub fn open(&self, task: &Task) -> Result<Box<dyn SampleSource + Send>, SourceError> {
        match self {
            SourceSpec::Synthetic => Ok(Box::new(SyntheticSource::new(
                task.nchannels,
                task.chunk_samples(),
            ))),
            SourceSpec::Recording(path) => {
                let source = BinFileSource::new(File::open(path)?)?;
                source.require_channels(task.nchannels)?;
                Ok(Box::new(source))
            }
        }
    }

    /// Fails early if a recording cannot be read at all.
    pub fn check(&self) -> Result<(), SourceError> {
        if let SourceSpec::Recording(path) = self {
            let source = BinFileSource::new(File::open(path)?)?;
            let header = source.header();
            info!(
                "Serving recording {} ({} channels, {} samples at {} Hz)",
                path.display(),
                header.nchannels,
                header.nsamples,
                header.sample_rate
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_file::tests::recording;
    use crate::config::DaqConfig;
    use crate::message::InitMessage;
    use crate::task::create_task;

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn synthetic_block_is_channel_index_grouped_by_channel() {
        let mut source = SyntheticSource::new(3, 4);
        let block = source.read_block(0..3, 0..4).unwrap();
        assert!(matches!(block, Cow::Borrowed(_)));
        assert_eq!(samples(&block), vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn synthetic_block_ignores_offset() {
        let mut source = SyntheticSource::new(2, 2);
        let first = source.read_block(0..2, 0..2).unwrap().into_owned();
        let later = source.read_block(0..2, 998..1000).unwrap().into_owned();
        assert_eq!(first, later);
    }

    #[test]
    fn synthetic_partial_block_keeps_channel_grouping() {
        let mut source = SyntheticSource::new(3, 4);
        let block = source.read_block(0..3, 8..10).unwrap();
        assert_eq!(samples(&block), vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn recording_source_serves_file_windows() {
        let path = std::env::temp_dir().join(format!("fakedaq-source-{}.bin", std::process::id()));
        std::fs::write(&path, recording(4, 20, 8)).unwrap();
        let kind = SourceSpec::Recording(path.clone());
        kind.check().unwrap();

        let config = DaqConfig {
            nchannels: 2,
            ..DaqConfig::default()
        };
        let task = create_task(&InitMessage::new("T", 0.002, 10.0, 5), &config).unwrap();
        let mut source = kind.open(&task).unwrap();
        let block = source.read_block(0..2, 5..10).unwrap();
        assert_eq!(
            samples(&block),
            vec![5, 6, 7, 8, 9, 1005, 1006, 1007, 1008, 1009]
        );
        drop(source);

        let wide = DaqConfig {
            nchannels: 8,
            ..DaqConfig::default()
        };
        let task = create_task(&InitMessage::new("T", 0.002, 10.0, 5), &wide).unwrap();
        assert!(matches!(
            kind.open(&task),
            Err(SourceError::ChannelMismatch {
                requested: 8,
                available: 4
            })
        ));

        std::fs::remove_file(&path).unwrap();
    }
}
