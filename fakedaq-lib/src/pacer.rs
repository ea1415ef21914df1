//! Paced delivery of sample blocks at the emulated acquisition rate.

use std::io;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use crate::config::DaqConfig;
use crate::message::{FrameBuffer, Inbound, encode_chunk_header};
use crate::session::SessionError;
use crate::source::SampleSource;
use crate::task::Task;

/// Why a run of chunks ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StreamEnd {
    /// Every sample of the task was sent.
    Completed,
    /// The client closed its end of the connection.
    Disconnected,
    /// The client sent `CLOSE`.
    CloseRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamReport {
    pub chunks: u32,
    /// Samples per channel delivered.
    pub samples: u64,
    /// Sample bytes delivered, excluding any chunk headers.
    pub bytes: u64,
    pub end: StreamEnd,
}

/// Result of peeking at the client between chunks.
enum Probe {
    Quiet,
    Closed,
    CloseRequested,
}

/// Streams one task's blocks over `stream`.
pub struct Pacer<'a> {
    task: &'a Task,
    send_timeout: Duration,
    frame_chunks: bool,
    probe_buf: Vec<u8>,
}

impl<'a> Pacer<'a> {
    pub fn new(task: &'a Task, config: &DaqConfig) -> Self {
        Self {
            task,
            send_timeout: config.send_timeout,
            frame_chunks: config.frame_chunks,
            probe_buf: vec![0; config.recv_buffer_size.max(1)],
        }
    }

    /// Sends `ceil(nsamples / block_size)` blocks, sleeping one block's worth
    /// of acquisition time after each.
    ///
    /// `frames` holds any bytes the client sent ahead of the stream.
    pub async fn run<S, Src>(
        &mut self,
        stream: &mut S,
        source: &mut Src,
        frames: &mut FrameBuffer,
    ) -> Result<StreamReport, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        Src: SampleSource + ?Sized,
    {
        let task = self.task;
        let total = task.nsamples as u64;
        let progress_step = (total / 10).max(1);
        let mut sent: u64 = 0;
        let mut chunks: u32 = 0;

        info!(
            "Streaming {} samples on {} channels in {} chunks",
            total,
            task.nchannels,
            task.nchunks()
        );

        while sent < total {
            match self.probe(stream, frames)? {
                Probe::Quiet => {}
                Probe::Closed => {
                    info!("Client disconnected, closing task after {} samples", sent);
                    return Ok(self.report(chunks, sent, StreamEnd::Disconnected));
                }
                Probe::CloseRequested => {
                    info!("Received CLOSE, stopping task after {} samples", sent);
                    return Ok(self.report(chunks, sent, StreamEnd::CloseRequested));
                }
            }

            let block = (task.block_size as u64).min(total - sent);
            let data = source.read_block(0..task.nchannels, sent..sent + block)?;
            let header = self
                .frame_chunks
                .then(|| encode_chunk_header(task.nchannels, block as u32));

            let write = async {
                if let Some(header) = header {
                    stream.write_all(&header).await?;
                }
                stream.write_all(&data).await?;
                stream.flush().await
            };
            match timeout(self.send_timeout, write).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("Client would block, closing task after {} samples", sent);
                    return Err(SessionError::Backpressure);
                }
            }

            let before = sent;
            sent += block;
            chunks += 1;
            debug!("{} total samples sent", sent);
            if sent / progress_step > before / progress_step {
                info!(
                    "Sent {} of {} samples ({}%)",
                    sent,
                    total,
                    sent * 100 / total
                );
            }

            sleep(Duration::from_secs_f64(block as f64 / task.sample_rate as f64)).await;
        }

        let report = self.report(chunks, sent, StreamEnd::Completed);
        info!(
            "Task completed, {} total samples sent ({} bytes)",
            report.samples, report.bytes
        );
        Ok(report)
    }

    /// Reads whatever the client has sent without waiting. Clients are not
    /// expected to talk during a run, so anything but `CLOSE` is dropped.
    fn probe<S>(&mut self, stream: &mut S, frames: &mut FrameBuffer) -> Result<Probe, SessionError>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            match stream.read(&mut self.probe_buf).now_or_never() {
                None => break,
                Some(Ok(0)) => return Ok(Probe::Closed),
                Some(Ok(n)) => frames.extend(&self.probe_buf[..n]),
                Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Some(Err(e)) => return Err(e.into()),
            }
        }

        loop {
            match frames.next_frame() {
                Ok(None) => return Ok(Probe::Quiet),
                Ok(Some(Inbound::Close)) => return Ok(Probe::CloseRequested),
                Ok(Some(other)) => debug!("Ignoring {:?} while streaming", other),
                Err(e) => {
                    debug!("Discarding unreadable client bytes while streaming: {}", e);
                    frames.clear();
                }
            }
        }
    }

    fn report(&self, chunks: u32, samples: u64, end: StreamEnd) -> StreamReport {
        StreamReport {
            chunks,
            samples,
            bytes: self.task.bytes_for(samples),
            end,
        }
    }
}
