//! Wire messages exchanged with DAQ clients.
//!
//! Every multi-byte field is big-endian and every string is ASCII preceded
//! by an explicit `u32` length. All messages except raw data chunks start
//! with an 8-byte header `msg_type(u32), msg_size(u32)` where `msg_size`
//! counts the payload bytes after the header.

use thiserror::Error;

use crate::task::Task;

/// Length of the `msg_type, msg_size` header.
pub const HEADER_LEN: usize = 8;

/// Errors returned while decoding wire messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Framing { needed: usize, available: usize },

    #[error("{field} is not valid ASCII")]
    Encoding { field: &'static str },

    #[error("unknown message type {0:#04x}")]
    UnknownType(u32),

    #[error("declared {field} length {length} exceeds limit of {limit} bytes")]
    TooLong {
        field: &'static str,
        length: usize,
        limit: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    InitExperiment = 0x00,
    ExptParamsReq = 0x01,
    ExptParams = 0x02,
    CheckReady = 0x03,
    ReadyStatus = 0x04,
    StartExpt = 0x05,
    DataChunk = 0x06,
    Close = 0x07,
    ErrorMsg = 0x08,
}

impl TryFrom<u32> for MsgType {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => MsgType::InitExperiment,
            0x01 => MsgType::ExptParamsReq,
            0x02 => MsgType::ExptParams,
            0x03 => MsgType::CheckReady,
            0x04 => MsgType::ReadyStatus,
            0x05 => MsgType::StartExpt,
            0x06 => MsgType::DataChunk,
            0x07 => MsgType::Close,
            0x08 => MsgType::ErrorMsg,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub msg_type: u32,
    pub msg_size: u32,
}

/// A client's request to initialise an experiment.
#[derive(Clone, Debug, PartialEq)]
pub struct InitMessage {
    pub msg_type: u32,
    pub msg_size: u32,
    pub trigger_length: u32,
    pub trigger: String,
    pub expt_length: f32,
    pub adc_range: f32,
    pub block_size: u32,
}

impl InitMessage {
    /// Builds a well-formed request, as a client would send it.
    pub fn new(trigger: &str, expt_length: f32, adc_range: f32, block_size: u32) -> Self {
        let trigger_length = trigger.len() as u32;
        Self {
            msg_type: MsgType::InitExperiment as u32,
            msg_size: 4 + trigger_length + 12,
            trigger_length,
            trigger: trigger.to_owned(),
            expt_length,
            adc_range,
            block_size,
        }
    }
}

/// The server's reply to `EXPT_PARAMS_REQ`, echoing the session's task.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamsMessage {
    pub msg_type: u32,
    pub msg_size: u32,
    pub nseconds: f32,
    pub nsamples: u32,
    pub sample_rate: f32,
    pub adc_range: f32,
    pub adc_resolution: f32,
    pub block_size: u32,
    pub nchannels: u16,
    pub trigger_length: u32,
    pub trigger: String,
    pub date_length: u32,
    pub date: String,
}

impl ParamsMessage {
    // nseconds..block_size (6 x 4) + nchannels (2) + the two length prefixes (2 x 4)
    const FIXED_PAYLOAD: u32 = 6 * 4 + 2 + 2 * 4;

    pub fn from_task(task: &Task) -> Self {
        let trigger_length = task.trigger.len() as u32;
        let date_length = task.date.len() as u32;
        Self {
            msg_type: MsgType::ExptParams as u32,
            msg_size: Self::FIXED_PAYLOAD + trigger_length + date_length,
            nseconds: task.length,
            nsamples: task.nsamples,
            sample_rate: task.sample_rate,
            adc_range: task.adc_range,
            adc_resolution: task.adc_resolution,
            block_size: task.block_size,
            nchannels: task.nchannels,
            trigger_length,
            trigger: task.trigger.clone(),
            date_length,
            date: task.date.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.msg_size as usize);
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.msg_size.to_be_bytes());
        out.extend_from_slice(&self.nseconds.to_be_bytes());
        out.extend_from_slice(&self.nsamples.to_be_bytes());
        out.extend_from_slice(&self.sample_rate.to_be_bytes());
        out.extend_from_slice(&self.adc_range.to_be_bytes());
        out.extend_from_slice(&self.adc_resolution.to_be_bytes());
        out.extend_from_slice(&self.block_size.to_be_bytes());
        out.extend_from_slice(&self.nchannels.to_be_bytes());
        out.extend_from_slice(&self.trigger_length.to_be_bytes());
        out.extend_from_slice(self.trigger.as_bytes());
        out.extend_from_slice(&self.date_length.to_be_bytes());
        out.extend_from_slice(self.date.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        let msg_type = r.u32()?;
        let msg_size = r.u32()?;
        let nseconds = r.f32()?;
        let nsamples = r.u32()?;
        let sample_rate = r.f32()?;
        let adc_range = r.f32()?;
        let adc_resolution = r.f32()?;
        let block_size = r.u32()?;
        let nchannels = r.u16()?;
        let trigger_length = r.u32()?;
        let trigger = r.ascii(trigger_length as usize, "trigger")?;
        let date_length = r.u32()?;
        let date = r.ascii(date_length as usize, "date")?;
        Ok(Self {
            msg_type,
            msg_size,
            nseconds,
            nsamples,
            sample_rate,
            adc_range,
            adc_resolution,
            block_size,
            nchannels,
            trigger_length,
            trigger,
            date_length,
            date,
        })
    }
}

/// A human-readable error report, sent server to client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMessage {
    pub text: String,
}

impl ErrorMessage {
    /// Builds an error report, replacing any non-ASCII character with `?`.
    pub fn new(text: impl AsRef<str>) -> Self {
        let text = text
            .as_ref()
            .chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .collect();
        Self { text }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.text.len() as u32;
        let mut out = Vec::with_capacity(HEADER_LEN + 4 + self.text.len());
        out.extend_from_slice(&(MsgType::ErrorMsg as u32).to_be_bytes());
        out.extend_from_slice(&(4 + len).to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);
        r.skip(HEADER_LEN)?;
        let len = r.u32()?;
        let text = r.ascii(len as usize, "error message")?;
        Ok(Self { text })
    }
}

pub fn decode_header(buf: &[u8]) -> Result<Header, CodecError> {
    let mut r = Reader::new(buf);
    Ok(Header {
        msg_type: r.u32()?,
        msg_size: r.u32()?,
    })
}

pub fn decode_init(buf: &[u8]) -> Result<InitMessage, CodecError> {
    let mut r = Reader::new(buf);
    let msg_type = r.u32()?;
    let msg_size = r.u32()?;
    let trigger_length = r.u32()?;
    let trigger = r.ascii(trigger_length as usize, "trigger")?;
    let expt_length = r.f32()?;
    let adc_range = r.f32()?;
    let block_size = r.u32()?;
    Ok(InitMessage {
        msg_type,
        msg_size,
        trigger_length,
        trigger,
        expt_length,
        adc_range,
        block_size,
    })
}

pub fn encode_init(msg: &InitMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 4 + msg.trigger.len() + 12);
    out.extend_from_slice(&msg.msg_type.to_be_bytes());
    out.extend_from_slice(&msg.msg_size.to_be_bytes());
    out.extend_from_slice(&msg.trigger_length.to_be_bytes());
    out.extend_from_slice(msg.trigger.as_bytes());
    out.extend_from_slice(&msg.expt_length.to_be_bytes());
    out.extend_from_slice(&msg.adc_range.to_be_bytes());
    out.extend_from_slice(&msg.block_size.to_be_bytes());
    out
}

pub fn encode_params(task: &Task) -> Vec<u8> {
    ParamsMessage::from_task(task).encode()
}

/// Header for a payload-free message such as `START_EXPT`.
pub fn encode_header_only(msg_type: MsgType) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&(msg_type as u32).to_be_bytes());
    out
}

/// Optional prefix for a streamed block of `nchannels x nsamples` samples.
///
/// `msg_size` saturates at `u32::MAX`; tasks never stream chunks that large.
pub fn encode_chunk_header(nchannels: u16, nsamples: u32) -> [u8; 14] {
    let data_len = nchannels as u64 * nsamples as u64 * 2;
    let msg_size = u32::try_from(6 + data_len).unwrap_or(u32::MAX);
    let mut out = [0u8; 14];
    out[0..4].copy_from_slice(&(MsgType::DataChunk as u32).to_be_bytes());
    out[4..8].copy_from_slice(&msg_size.to_be_bytes());
    out[8..10].copy_from_slice(&nchannels.to_be_bytes());
    out[10..14].copy_from_slice(&nsamples.to_be_bytes());
    out
}

/// A complete message cut from the inbound byte stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Init(InitMessage),
    ParamsRequest,
    CheckReady,
    Start,
    Close,
    Error(ErrorMessage),
    /// A type the server never receives, one it does not know, or an
    /// `ERROR_MSG` it cannot read. Unknown types take the rest of the
    /// buffered bytes with them.
    Other(u32),
}

/// Accumulates bytes read from a client and cuts them into messages.
///
/// Frame boundaries come from each type's layout rather than `msg_size`,
/// which existing clients fill inconsistently.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_string_len: usize,
    /// Bytes of a discarded frame still to arrive.
    skip: usize,
}

impl FrameBuffer {
    pub fn new(max_string_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_string_len,
            skip: 0,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        let skipped = self.skip.min(bytes.len());
        self.skip -= skipped;
        self.buf.extend_from_slice(&bytes[skipped..]);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.skip = 0;
    }

    /// Drops the next `len` bytes, including any not yet received.
    fn discard(&mut self, len: usize) {
        let now = len.min(self.buf.len());
        self.buf.drain(..now);
        self.skip = len - now;
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Inbound>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = decode_header(&self.buf)?;
        let frame = match MsgType::try_from(header.msg_type) {
            Ok(MsgType::InitExperiment) => {
                let Some(len) = self.string_frame_len(12, "trigger")? else {
                    return Ok(None);
                };
                let Some(len) = len.checked_add(12).filter(|len| *len <= self.buf.len()) else {
                    return Ok(None);
                };
                let msg = decode_init(&self.buf[..len])?;
                self.buf.drain(..len);
                Inbound::Init(msg)
            }
            Ok(MsgType::ErrorMsg) => {
                if self.buf.len() < 12 {
                    return Ok(None);
                }
                let declared = Reader::new(&self.buf[8..12]).u32()? as usize;
                let len = declared.saturating_add(12);
                if declared > self.max_string_len {
                    self.discard(len);
                    return Ok(Some(Inbound::Other(header.msg_type)));
                }
                if self.buf.len() < len {
                    return Ok(None);
                }
                let msg = ErrorMessage::decode(&self.buf[..len]);
                self.buf.drain(..len);
                match msg {
                    Ok(msg) => Inbound::Error(msg),
                    Err(_) => Inbound::Other(header.msg_type),
                }
            }
            Ok(kind @ (MsgType::ExptParamsReq
            | MsgType::CheckReady
            | MsgType::StartExpt
            | MsgType::Close)) => {
                self.buf.drain(..HEADER_LEN);
                match kind {
                    MsgType::ExptParamsReq => Inbound::ParamsRequest,
                    MsgType::CheckReady => Inbound::CheckReady,
                    MsgType::StartExpt => Inbound::Start,
                    _ => Inbound::Close,
                }
            }
            _ => {
                self.buf.clear();
                Inbound::Other(header.msg_type)
            }
        };
        Ok(Some(frame))
    }

    /// Length of a frame whose variable-length string is prefixed at
    /// `prefix_end - 4`, up to the end of that string.
    fn string_frame_len(
        &self,
        prefix_end: usize,
        field: &'static str,
    ) -> Result<Option<usize>, CodecError> {
        if self.buf.len() < prefix_end {
            return Ok(None);
        }
        let mut r = Reader::new(&self.buf[prefix_end - 4..]);
        let length = r.u32()? as usize;
        if length > self.max_string_len {
            return Err(CodecError::TooLong {
                field,
                length,
                limit: self.max_string_len,
            });
        }
        Ok(Some(prefix_end + length))
    }
}

/// Big-endian cursor over a borrowed buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(CodecError::Framing {
                needed: self.pos.saturating_add(n),
                available: self.buf.len(),
            });
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.take(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    fn ascii(&mut self, n: usize, field: &'static str) -> Result<String, CodecError> {
        let bytes = self.take(n)?;
        if !bytes.is_ascii() {
            return Err(CodecError::Encoding { field });
        }
        // ASCII is always valid UTF-8
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaqConfig;
    use crate::task::create_task;

    fn scenario_init() -> InitMessage {
        InitMessage::new("T1234", 1.0, 10.0, 1000)
    }

    #[test]
    fn header_needs_eight_bytes() {
        assert_eq!(
            decode_header(&[0, 0, 0, 1, 0, 0]),
            Err(CodecError::Framing {
                needed: 8,
                available: 6
            })
        );
        let header = decode_header(&[0, 0, 0, 5, 0, 0, 0, 8, 0xff]).unwrap();
        assert_eq!(header.msg_type, MsgType::StartExpt as u32);
        assert_eq!(header.msg_size, 8);
    }

    #[test]
    fn decodes_init_layout() {
        let bytes = encode_init(&scenario_init());
        assert_eq!(bytes.len(), 8 + 4 + 5 + 12);
        assert_eq!(&bytes[12..17], b"T1234");

        let msg = decode_init(&bytes).unwrap();
        assert_eq!(msg.trigger_length, 5);
        assert_eq!(msg.trigger, "T1234");
        assert_eq!(msg.expt_length, 1.0);
        assert_eq!(msg.adc_range, 10.0);
        assert_eq!(msg.block_size, 1000);
    }

    #[test]
    fn truncated_init_is_a_framing_error() {
        let bytes = encode_init(&scenario_init());
        let err = decode_init(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, CodecError::Framing { .. }));
    }

    #[test]
    fn non_ascii_trigger_is_rejected() {
        let mut bytes = encode_init(&scenario_init());
        bytes[13] = 0xC3;
        assert_eq!(
            decode_init(&bytes),
            Err(CodecError::Encoding { field: "trigger" })
        );
    }

    #[test]
    fn params_round_trip_task_fields() {
        let task = create_task(&scenario_init(), &DaqConfig::default()).unwrap();
        let bytes = encode_params(&task);
        let msg = ParamsMessage::decode(&bytes).unwrap();

        assert_eq!(msg.msg_type, MsgType::ExptParams as u32);
        assert_eq!(msg.msg_size as usize, bytes.len() - HEADER_LEN);
        assert_eq!(msg.nseconds, task.length);
        assert_eq!(msg.nsamples, task.nsamples);
        assert_eq!(msg.sample_rate, task.sample_rate);
        assert_eq!(msg.adc_range, task.adc_range);
        assert_eq!(msg.adc_resolution, task.adc_resolution);
        assert_eq!(msg.block_size, task.block_size);
        assert_eq!(msg.nchannels, task.nchannels);
        assert_eq!(msg.trigger, task.trigger);
        assert_eq!(msg.date, task.date);
        assert_eq!(msg.date_length as usize, task.date.len());
    }

    #[test]
    fn params_size_counts_payload_only() {
        let task = create_task(&scenario_init(), &DaqConfig::default()).unwrap();
        let msg = ParamsMessage::from_task(&task);
        // 19-character date, 5-character trigger
        assert_eq!(msg.msg_size, 34 + 5 + 19);
    }

    #[test]
    fn error_message_layout() {
        let bytes = ErrorMessage::new("bad trigger").encode();
        assert_eq!(decode_header(&bytes).unwrap().msg_type, 0x08);
        assert_eq!(decode_header(&bytes).unwrap().msg_size, 4 + 11);
        assert_eq!(&bytes[8..12], &11u32.to_be_bytes());
        assert_eq!(ErrorMessage::decode(&bytes).unwrap().text, "bad trigger");
        assert_eq!(ErrorMessage::new("µs").text, "?s");
    }

    #[test]
    fn chunk_header_counts_samples() {
        let header = encode_chunk_header(64, 1000);
        assert_eq!(&header[0..4], &6u32.to_be_bytes());
        assert_eq!(&header[4..8], &(6u32 + 128_000).to_be_bytes());
        assert_eq!(&header[8..10], &64u16.to_be_bytes());
        assert_eq!(&header[10..14], &1000u32.to_be_bytes());
    }

    #[test]
    fn frame_buffer_splits_coalesced_requests() {
        let mut frames = FrameBuffer::new(1024);
        frames.extend(&encode_header_only(MsgType::ExptParamsReq));
        frames.extend(&encode_header_only(MsgType::ExptParamsReq));
        frames.extend(&encode_header_only(MsgType::StartExpt)[..5]);

        assert_eq!(frames.next_frame().unwrap(), Some(Inbound::ParamsRequest));
        assert_eq!(frames.next_frame().unwrap(), Some(Inbound::ParamsRequest));
        assert_eq!(frames.next_frame().unwrap(), None);

        frames.extend(&encode_header_only(MsgType::StartExpt)[5..]);
        assert_eq!(frames.next_frame().unwrap(), Some(Inbound::Start));
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_buffer_waits_for_whole_init() {
        let bytes = encode_init(&scenario_init());
        let mut frames = FrameBuffer::new(1024);
        for piece in bytes.chunks(7) {
            assert_eq!(frames.next_frame().unwrap(), None);
            frames.extend(piece);
        }
        assert_eq!(
            frames.next_frame().unwrap(),
            Some(Inbound::Init(scenario_init()))
        );
    }

    #[test]
    fn frame_buffer_drops_unknown_types() {
        let mut frames = FrameBuffer::new(1024);
        frames.extend(&[0, 0, 0, 0x42, 0, 0, 0, 4, 1, 2, 3, 4]);
        assert_eq!(frames.next_frame().unwrap(), Some(Inbound::Other(0x42)));
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_buffer_skips_unreadable_error_reports() {
        let init = encode_init(&scenario_init());
        let mut frames = FrameBuffer::new(16);

        // Over the limit: the body is skipped even when it arrives later
        let long = ErrorMessage::new("x".repeat(40)).encode();
        frames.extend(&long[..20]);
        assert_eq!(
            frames.next_frame().unwrap(),
            Some(Inbound::Other(MsgType::ErrorMsg as u32))
        );
        let mut rest = long[20..].to_vec();
        rest.extend_from_slice(&init);
        frames.extend(&rest);
        assert_eq!(
            frames.next_frame().unwrap(),
            Some(Inbound::Init(scenario_init()))
        );

        let mut bad = ErrorMessage::new("oops").encode();
        bad[13] = 0x80;
        frames.extend(&bad);
        frames.extend(&encode_header_only(MsgType::StartExpt));
        assert_eq!(
            frames.next_frame().unwrap(),
            Some(Inbound::Other(MsgType::ErrorMsg as u32))
        );
        assert_eq!(frames.next_frame().unwrap(), Some(Inbound::Start));
    }

    #[test]
    fn chunk_header_size_saturates() {
        let header = encode_chunk_header(64, 40_000_000);
        assert_eq!(&header[4..8], &u32::MAX.to_be_bytes());
    }

    #[test]
    fn frame_buffer_rejects_oversized_trigger() {
        let mut frames = FrameBuffer::new(16);
        frames.extend(&encode_init(&InitMessage::new(&"x".repeat(17), 1.0, 1.0, 1)));
        assert_eq!(
            frames.next_frame(),
            Err(CodecError::TooLong {
                field: "trigger",
                length: 17,
                limit: 16
            })
        );
    }
}
