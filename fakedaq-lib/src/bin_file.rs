//! Reader for the big-endian `*.bin` recordings produced by MEA rigs.
//!
//! A file is a self-describing header followed by blocks of
//! `nchannels x block_size` samples, grouped by channel within each block.
//! The last block holds whatever samples remain.

use std::borrow::Cow;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;

use crate::source::{SampleSource, SourceError};

#[derive(Clone, Debug, PartialEq)]
pub struct BinHeader {
    pub header_size: u32,
    pub file_type: i16,
    pub version: i16,
    /// Samples per channel.
    pub nsamples: u32,
    pub nchannels: u32,
    pub channels: Vec<i16>,
    pub sample_rate: f32,
    /// Samples per channel in one stored block.
    pub block_size: u32,
    pub gain: f32,
    pub offset: f32,
    pub date: String,
    pub time: String,
    pub room: String,
}

impl BinHeader {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, SourceError> {
        let mut size = [0u8; 4];
        reader.read_exact(&mut size)?;
        let header_size = u32::from_be_bytes(size);
        if header_size < 4 {
            return Err(SourceError::BadHeader(format!(
                "header size {header_size} is too small"
            )));
        }
        // Grows with the bytes actually present, whatever size is declared
        let mut rest = Vec::new();
        let expected = header_size as u64 - 4;
        reader.take(expected).read_to_end(&mut rest)?;
        if (rest.len() as u64) < expected {
            return Err(SourceError::BadHeader(format!(
                "header size {header_size} exceeds the file"
            )));
        }

        let mut cur = Fields { buf: &rest, pos: 0 };
        let file_type = cur.i16()?;
        let version = cur.i16()?;
        let nsamples = cur.u32()?;
        let nchannels = cur.u32()?;
        let channels = (0..nchannels)
            .map(|_| cur.i16())
            .collect::<Result<Vec<_>, _>>()?;
        let sample_rate = cur.f32()?;
        let block_size = cur.u32()?;
        let gain = cur.f32()?;
        let offset = cur.f32()?;
        let date = cur.text()?;
        let time = cur.text()?;
        let room = cur.text()?;

        if block_size == 0 {
            return Err(SourceError::BadHeader("block size is zero".into()));
        }

        Ok(Self {
            header_size,
            file_type,
            version,
            nsamples,
            nchannels,
            channels,
            sample_rate,
            block_size,
            gain,
            offset,
            date,
            time,
            room,
        })
    }

    /// Samples per channel stored in block `index`.
    fn block_len(&self, index: u64) -> u64 {
        let block = self.block_size as u64;
        block.min(self.nsamples as u64 - index * block)
    }

    /// File offset of sample `sample` of channel `chan`.
    fn offset_of(&self, chan: u16, sample: u64) -> u64 {
        let block = self.block_size as u64;
        let index = sample / block;
        let block_start =
            self.header_size as u64 + index * block * self.nchannels as u64 * 2;
        block_start + (chan as u64 * self.block_len(index) + sample % block) * 2
    }
}

struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Fields<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], SourceError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + N)
            .ok_or_else(|| SourceError::BadHeader("header ends early".into()))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn i16(&mut self) -> Result<i16, SourceError> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, SourceError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn f32(&mut self) -> Result<f32, SourceError> {
        Ok(f32::from_be_bytes(self.take()?))
    }

    fn text(&mut self) -> Result<String, SourceError> {
        let len = self.u32()? as usize;
        let bytes = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| SourceError::BadHeader("header string ends early".into()))?;
        self.pos += len;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Serves arbitrary sample windows out of a `*.bin` recording.
#[derive(Debug)]
pub struct BinFileSource<R> {
    reader: R,
    header: BinHeader,
    buf: Vec<u8>,
}

impl<R: Read + Seek> BinFileSource<R> {
    pub fn new(mut reader: R) -> Result<Self, SourceError> {
        reader.seek(SeekFrom::Start(0))?;
        let header = BinHeader::read_from(&mut reader)?;
        Ok(Self {
            reader,
            header,
            buf: Vec::new(),
        })
    }

    pub fn header(&self) -> &BinHeader {
        &self.header
    }

    pub fn require_channels(&self, nchannels: u16) -> Result<(), SourceError> {
        if nchannels as u32 > self.header.nchannels {
            return Err(SourceError::ChannelMismatch {
                requested: nchannels as u32,
                available: self.header.nchannels,
            });
        }
        Ok(())
    }
}

impl<R: Read + Seek> SampleSource for BinFileSource<R> {
    fn read_block(
        &mut self,
        channels: Range<u16>,
        samples: Range<u64>,
    ) -> Result<Cow<'_, [u8]>, SourceError> {
        self.require_channels(channels.end)?;
        if samples.end > self.header.nsamples as u64 {
            return Err(SourceError::OutOfRange {
                start: samples.start,
                end: samples.end,
                available: self.header.nsamples as u64,
            });
        }

        let per_channel = (samples.end - samples.start) as usize * 2;
        self.buf.clear();
        self.buf.resize(channels.len() * per_channel, 0);

        let header = &self.header;
        let reader = &mut self.reader;
        let block = header.block_size as u64;
        for (slot, chan) in channels.enumerate() {
            let mut out = &mut self.buf[slot * per_channel..(slot + 1) * per_channel];
            let mut sample = samples.start;
            while sample < samples.end {
                // Stay within the stored block holding `sample`
                let run = (block - sample % block).min(samples.end - sample);
                let (head, tail) = out.split_at_mut(run as usize * 2);
                reader.seek(SeekFrom::Start(header.offset_of(chan, sample)))?;
                reader.read_exact(head)?;
                out = tail;
                sample += run;
            }
        }
        Ok(Cow::Borrowed(self.buf.as_slice()))
    }
}
