//! Connection struct definition
//!
//! One accepted TCP stream together with its inbound frame buffer and its
//! unsent outbound bytes. All socket IO is non-blocking (`try_read` /
//! `try_write`) and only happens after the multiplexer has reported the
//! stream ready.

use std::io::ErrorKind;
use std::net::SocketAddr;

use futures_util::FutureExt;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::codec::{self, FrameBuffer};
use crate::error::TransportError;
use crate::message::ServerMessage;
use crate::types::ConnId;

const READ_CHUNK: usize = 4096;

/// Accepted client connection
#[derive(Debug)]
pub struct Connection {
    /// Handle other components use to refer to this connection
    pub id: ConnId,
    /// Remote address
    pub peer: SocketAddr,
    stream: TcpStream,
    inbound: FrameBuffer,
    outbound: Vec<u8>,
    max_outbound: usize,
    /// Peer closed its write half
    eof: bool,
}

impl Connection {
    /// Wrap an accepted stream
    ///
    /// `max_frame` bounds one inbound frame, `max_outbound` bounds the bytes
    /// waiting for the peer to read.
    pub fn new(stream: TcpStream, peer: SocketAddr, max_frame: usize, max_outbound: usize) -> Self {
        Self {
            id: ConnId::new(),
            peer,
            stream,
            inbound: FrameBuffer::new(max_frame),
            outbound: Vec::new(),
            max_outbound,
            eof: false,
        }
    }

    /// Whether there is inbound work that needs no further socket readiness
    pub fn has_buffered_input(&self) -> bool {
        self.eof || self.inbound.has_frame()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Wait until the socket may have data
    pub async fn readable(&self) -> std::io::Result<()> {
        self.stream.readable().await
    }

    /// Current readiness without waiting
    ///
    /// `None` means nothing is ready right now. A pending socket error (for
    /// instance a reset from the peer) shows up as `Ready::is_error`.
    pub fn readiness(&self) -> std::io::Result<Option<Ready>> {
        self.stream
            .ready(Interest::READABLE | Interest::WRITABLE | Interest::ERROR)
            .now_or_never()
            .transpose()
    }

    /// Read what the socket has and return at most one complete frame
    ///
    /// Extra frames stay buffered for later cycles. EOF is only reported once
    /// the buffered frames have been handed out.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(frame) = self.inbound.next_frame()? {
            return Ok(Some(frame));
        }

        let mut chunk = [0u8; READ_CHUNK];
        while !self.eof {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!("Peer {} closed its side of {}", self.peer, self.id);
                    self.eof = true;
                }
                Ok(n) => {
                    trace!("Read {} bytes from {}", n, self.id);
                    self.inbound.extend(&chunk[..n]);
                    if self.inbound.has_frame() {
                        break;
                    }
                    // surfaces FrameTooLong before the buffer grows unbounded
                    self.inbound.next_frame()?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match self.inbound.next_frame()? {
            Some(frame) => Ok(Some(frame)),
            None if self.eof => Err(TransportError::Closed),
            None => Ok(None),
        }
    }

    /// Queue a frame and write as much as the socket takes now
    ///
    /// Fails with `OutboundFull` instead of queueing past `max_outbound`.
    pub fn send(&mut self, msg: &ServerMessage) -> Result<(), TransportError> {
        let bytes = codec::encode(msg)?;
        let pending = self.outbound.len() + bytes.len();
        if pending > self.max_outbound {
            return Err(TransportError::OutboundFull(pending));
        }
        self.outbound.extend_from_slice(&bytes);
        self.flush()
    }

    /// Write pending bytes until done or the socket would block
    pub fn flush(&mut self) -> Result<(), TransportError> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    trace!("Wrote {} bytes to {}", n, self.id);
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
