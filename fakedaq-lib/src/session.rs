//! The per-connection protocol state machine.
//!
//! `AwaitInit -> AwaitParamsOrStart -> Streaming -> Closed`. A session owns
//! its stream for the whole connection and suspends only while waiting for
//! the client to send something, or between streamed chunks.

use std::fmt;
use std::io;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::DaqConfig;
use crate::message::{
    CodecError, ErrorMessage, FrameBuffer, InitMessage, Inbound, MsgType, encode_params,
};
use crate::pacer::{Pacer, StreamReport};
use crate::source::{SourceError, SourceSpec};
use crate::task::{Task, TaskError, create_task};

/// Errors that end a session abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed message: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid experiment parameters: {0}")]
    InvalidParameter(#[from] TaskError),

    #[error("client closed the connection")]
    ConnectionClosed,

    #[error("client is not draining data, send would block")]
    Backpressure,

    #[error("connection reset by peer: {0}")]
    PeerReset(io::Error),

    #[error("sample source error: {0}")]
    Source(#[from] SourceError),

    #[error("socket error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => SessionError::PeerReset(err),
            _ => SessionError::Io(err),
        }
    }
}

impl SessionError {
    /// Faults caused by what the client sent, which are reported back to it.
    fn is_client_fault(&self) -> bool {
        matches!(
            self,
            SessionError::Codec(_) | SessionError::InvalidParameter(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    AwaitInit,
    AwaitParamsOrStart,
    Streaming,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a session reached `Closed` without an error.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum SessionOutcome {
    /// The run started; the report tells how far it got.
    Streamed(StreamReport),
    /// The client hung up before starting a run.
    Disconnected { during: SessionState },
    /// The client sent something other than a parameter request or start
    /// after initialising.
    Dismissed { msg_type: u32 },
}

pub struct Session<S> {
    stream: S,
    config: DaqConfig,
    source: SourceSpec,
    frames: FrameBuffer,
    recv_buf: Vec<u8>,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: DaqConfig, source: SourceSpec) -> Self {
        let frames = FrameBuffer::new(config.max_trigger_length);
        let recv_buf = vec![0; config.recv_buffer_size.max(1)];
        Self {
            stream,
            config,
            source,
            frames,
            recv_buf,
            state: SessionState::AwaitInit,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Gives the stream back for cleanup.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Drives the connection to `Closed`.
    ///
    /// A client hanging up at any point is an ordinary outcome. Protocol
    /// faults are reported to the client with `ERROR_MSG` before the error
    /// is returned.
    pub async fn run(&mut self) -> Result<SessionOutcome, SessionError> {
        let result = self.drive().await;
        let during = self.state;
        self.transition(SessionState::Closed);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(SessionError::ConnectionClosed) => {
                info!("Client disconnected during {}", during);
                Ok(SessionOutcome::Disconnected { during })
            }
            Err(err) => {
                if err.is_client_fault() {
                    self.report_error(&err).await;
                }
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<SessionOutcome, SessionError> {
        info!("Waiting for init msg");
        let init = self.recv_init().await?;
        let task = create_task(&init, &self.config)?;
        self.log_task(&task);
        self.transition(SessionState::AwaitParamsOrStart);

        if let Some(outcome) = self.negotiate(&task).await? {
            return Ok(outcome);
        }

        info!("Received START_EXPT message, serving data to client");
        self.transition(SessionState::Streaming);
        let mut source = self.source.open(&task)?;
        let report = Pacer::new(&task, &self.config)
            .run(&mut self.stream, source.as_mut(), &mut self.frames)
            .await?;
        Ok(SessionOutcome::Streamed(report))
    }

    /// Waits for `INIT_EXPERIMENT`, ignoring anything else.
    async fn recv_init(&mut self) -> Result<InitMessage, SessionError> {
        loop {
            match self.next_message().await? {
                Inbound::Init(init) => return Ok(init),
                other => debug!("Ignoring {:?} before INIT_EXPERIMENT", other),
            }
        }
    }

    /// Answers parameter requests until the client starts the run.
    /// Returns an outcome if the session should close instead.
    async fn negotiate(&mut self, task: &Task) -> Result<Option<SessionOutcome>, SessionError> {
        loop {
            match self.next_message().await {
                Ok(Inbound::ParamsRequest) => {
                    info!("Received EXPT_PARAMS_REQ, sending parameters");
                    self.stream.write_all(&encode_params(task)).await?;
                    self.stream.flush().await?;
                }
                Ok(Inbound::Start) => return Ok(None),
                Ok(other) => {
                    let msg_type = inbound_type(&other);
                    info!("Received message type {:#04x}, closing session", msg_type);
                    return Ok(Some(SessionOutcome::Dismissed { msg_type }));
                }
                Err(SessionError::ConnectionClosed) => {
                    info!("Client disconnected before START_EXPT");
                    return Ok(Some(SessionOutcome::Disconnected {
                        during: SessionState::AwaitParamsOrStart,
                    }));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Returns the next complete message, reading from the client as needed.
    async fn next_message(&mut self) -> Result<Inbound, SessionError> {
        loop {
            if let Some(msg) = self.frames.next_frame()? {
                return Ok(msg);
            }
            let n = self.stream.read(&mut self.recv_buf).await?;
            if n == 0 {
                return Err(SessionError::ConnectionClosed);
            }
            self.frames.extend(&self.recv_buf[..n]);
        }
    }

    /// Best effort: the connection is being torn down regardless.
    async fn report_error(&mut self, err: &SessionError) {
        let msg = ErrorMessage::new(err.to_string()).encode();
        let sent = async {
            self.stream.write_all(&msg).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(self.config.send_timeout, sent).await {
            Ok(Ok(())) => debug!("Sent ERROR_MSG: {}", err),
            Ok(Err(e)) => debug!("Could not send ERROR_MSG: {}", e),
            Err(_) => debug!("Timed out sending ERROR_MSG"),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn log_task(&self, task: &Task) {
        match serde_json::to_string(task) {
            Ok(json) => info!("Task initialized: {}", json),
            Err(e) => warn!("Task initialized (unprintable: {})", e),
        }
    }
}

fn inbound_type(msg: &Inbound) -> u32 {
    match msg {
        Inbound::Init(_) => MsgType::InitExperiment as u32,
        Inbound::ParamsRequest => MsgType::ExptParamsReq as u32,
        Inbound::CheckReady => MsgType::CheckReady as u32,
        Inbound::Start => MsgType::StartExpt as u32,
        Inbound::Close => MsgType::Close as u32,
        Inbound::Error(_) => MsgType::ErrorMsg as u32,
        Inbound::Other(raw) => *raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode_header_only, encode_init};
    use tokio::io::duplex;

    fn session(stream: tokio::io::DuplexStream) -> Session<tokio::io::DuplexStream> {
        Session::new(stream, DaqConfig::default(), SourceSpec::Synthetic)
    }

    #[tokio::test]
    async fn hang_up_before_init_is_a_clean_close() {
        let (client, server) = duplex(1024);
        drop(client);
        let mut session = session(server);
        let outcome = session.run().await.unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Disconnected {
                during: SessionState::AwaitInit
            }
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn messages_before_init_are_ignored() {
        let (mut client, server) = duplex(1 << 16);
        client
            .write_all(&encode_header_only(MsgType::StartExpt))
            .await
            .unwrap();
        client
            .write_all(&encode_init(&InitMessage::new("T1234", 1.0, 10.0, 1000)))
            .await
            .unwrap();
        client
            .write_all(&encode_header_only(MsgType::Close))
            .await
            .unwrap();

        let outcome = session(server).run().await.unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Dismissed {
                msg_type: MsgType::Close as u32
            }
        );
    }

    #[tokio::test]
    async fn zero_block_size_is_reported_to_the_client() {
        let (mut client, server) = duplex(1 << 16);
        client
            .write_all(&encode_init(&InitMessage::new("T", 1.0, 10.0, 0)))
            .await
            .unwrap();

        let err = session(server).run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidParameter(TaskError::ZeroBlockSize)
        ));

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        let msg = ErrorMessage::decode(&reply).unwrap();
        assert!(msg.text.contains("block size"));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_block_size_streams_only_the_run() {
        let (mut client, server) = duplex(1 << 16);
        client
            .write_all(&encode_init(&InitMessage::new("T", 0.001, 10.0, u32::MAX)))
            .await
            .unwrap();
        client
            .write_all(&encode_header_only(MsgType::StartExpt))
            .await
            .unwrap();

        let outcome = session(server).run().await.unwrap();
        let SessionOutcome::Streamed(report) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(report.chunks, 1);
        assert_eq!(report.samples, 10);

        let mut data = Vec::new();
        client.read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len(), 64 * 10 * 2);
    }

    #[tokio::test]
    async fn oversized_chunk_is_refused() {
        let (mut client, server) = duplex(1 << 16);
        client
            .write_all(&encode_init(&InitMessage::new("T", 1000.0, 10.0, u32::MAX)))
            .await
            .unwrap();

        let err = session(server).run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidParameter(TaskError::ChunkTooLarge { .. })
        ));

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(ErrorMessage::decode(&reply).unwrap().text.contains("exceeds"));
    }

    #[tokio::test]
    async fn unreadable_error_reports_before_init_are_ignored() {
        let (mut client, server) = duplex(1 << 16);
        // Declares a 2000-byte error text, over the 1024-byte limit
        let mut report = ErrorMessage::new("x".repeat(2000)).encode();
        client.write_all(&report).await.unwrap();
        // Non-ASCII text
        report = ErrorMessage::new("oops").encode();
        report[12] = 0xFF;
        client.write_all(&report).await.unwrap();
        client
            .write_all(&encode_init(&InitMessage::new("T1234", 1.0, 10.0, 1000)))
            .await
            .unwrap();
        client
            .write_all(&encode_header_only(MsgType::Close))
            .await
            .unwrap();

        let outcome = session(server).run().await.unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Dismissed {
                msg_type: MsgType::Close as u32
            }
        );
    }

    #[test]
    fn io_errors_are_classified() {
        let reset: SessionError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(matches!(reset, SessionError::PeerReset(_)));
        let other: SessionError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(matches!(other, SessionError::Io(_)));
    }
}
