//! Control channel I/O.
//!
//! Framed, non-blocking reads and writes over the kernel control path.
//! Reads never suspend: when no complete frame is available the channel
//! reports [`ReadOutcome::WouldBlock`] and the caller waits for the event
//! loop to signal readiness. Writes that the transport only partly accepts
//! leave the tail queued in order; [`ControlChannel::flush`] retries it.
//! Key and peer operations use [`ControlChannel::write_message_all`]
//! instead, which reports success only once the whole frame is out.

use std::io;
use tracing::{debug, error, info, trace, warn};

use shared_utils::framing::{ControlDecoder, ControlEncoder, ControlFrame, Opcode};

use crate::error::{DcoError, DcoResult};
use crate::event::{EventLoopRegistrar, Registration};
use crate::transport::ControlTransport;
use crate::types::{LoopToken, PeerId};

/// A framed unit on the control channel.
pub type ControlMessage = ControlFrame;

const READ_CHUNK: usize = 4096;

/// Position of a frame appended to the outbound queue.
#[derive(Debug, Clone, Copy)]
struct Queued {
    start: usize,
    len: usize,
}

impl Queued {
    fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Result of a non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Message(ControlMessage),
    WouldBlock,
}

/// Framed control channel over an exclusively owned transport.
pub struct ControlChannel {
    transport: Box<dyn ControlTransport>,
    encoder: ControlEncoder,
    decoder: ControlDecoder,
    outbound: Vec<u8>,
    registration: Option<Box<dyn Registration>>,
    closed: bool,
}

impl ControlChannel {
    pub fn new(transport: Box<dyn ControlTransport>, max_payload: usize) -> Self {
        ControlChannel {
            transport,
            encoder: ControlEncoder::new(),
            decoder: ControlDecoder::with_max_payload(max_payload),
            outbound: Vec::new(),
            registration: None,
            closed: false,
        }
    }

    /// Read the next complete control message.
    ///
    /// A malformed frame yields `DcoError::Framing` and resets the decoder,
    /// so the following call starts clean.
    pub fn read_message(&mut self) -> DcoResult<ReadOutcome> {
        if self.closed {
            return Err(DcoError::Closed);
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(ReadOutcome::Message(frame));
            }

            match self.transport.read(&mut buf) {
                Ok(0) => {
                    self.decoder.finish()?;
                    error!("Kernel closed the control channel");
                    return Err(DcoError::Transport {
                        op: "read",
                        code: -libc::EPIPE,
                    });
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from control transport");
                    self.decoder.feed(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Control channel read failed");
                    return Err(DcoError::transport("read", &e));
                }
            }
        }
    }

    /// Frame and send a message for `peer_id`.
    ///
    /// Returns the number of bytes the transport accepted during this call.
    /// Whatever it did not accept stays queued behind earlier frames.
    pub fn write_message(
        &mut self,
        peer_id: PeerId,
        opcode: Opcode,
        payload: &[u8],
    ) -> DcoResult<usize> {
        let queued = self.enqueue(peer_id, opcode, payload)?;
        let mut written = 0;
        match self.push_outbound(&mut written) {
            Ok(()) => {
                debug!(
                    peer_id,
                    opcode = ?opcode,
                    frame_len = queued.len,
                    written,
                    queued = self.outbound.len(),
                    "Wrote control message"
                );
                Ok(written)
            }
            Err(e) => {
                self.abandon(queued, written);
                Err(e)
            }
        }
    }

    /// Frame and send a message that must reach the kernel in this call.
    ///
    /// Succeeds only once every byte of the frame has been written. If the
    /// transport blocks or fails before the frame starts, the frame is
    /// withdrawn and the channel is unchanged (`DcoError::WouldBlock` or the
    /// transport error). A frame cut off part way can neither be finished
    /// in order nor taken back, so the channel is closed and a transport
    /// error returned.
    pub fn write_message_all(
        &mut self,
        peer_id: PeerId,
        opcode: Opcode,
        payload: &[u8],
    ) -> DcoResult<()> {
        let queued = self.enqueue(peer_id, opcode, payload)?;
        let mut written = 0;
        let result = self.push_outbound(&mut written);
        if result.is_ok() && written >= queued.end() {
            debug!(peer_id, opcode = ?opcode, frame_len = queued.len, "Wrote control message in full");
            return Ok(());
        }

        self.abandon(queued, written);
        match result {
            Err(e) => Err(e),
            Ok(()) if self.closed => Err(DcoError::Transport {
                op: "write",
                code: -libc::EAGAIN,
            }),
            Ok(()) => Err(DcoError::WouldBlock),
        }
    }

    fn enqueue(&mut self, peer_id: PeerId, opcode: Opcode, payload: &[u8]) -> DcoResult<Queued> {
        if self.closed {
            return Err(DcoError::Closed);
        }
        let frame = ControlFrame::new(opcode, peer_id, payload.to_vec())?;
        let encoded = self.encoder.encode(&frame);
        let queued = Queued {
            start: self.outbound.len(),
            len: encoded.len(),
        };
        self.outbound.extend_from_slice(&encoded);
        Ok(queued)
    }

    /// Take back a frame that did not fully go out.
    ///
    /// `written` counts bytes drained from the front of the queue since the
    /// frame was appended.
    fn abandon(&mut self, queued: Queued, written: usize) {
        if written <= queued.start {
            let frame_at = queued.start - written;
            self.outbound.truncate(frame_at);
            return;
        }
        if written >= queued.end() {
            return;
        }
        warn!(
            sent = written - queued.start,
            frame_len = queued.len,
            "Control frame cut off mid-write, closing channel"
        );
        self.close();
    }

    /// Push queued bytes to the transport until it would block.
    pub fn flush(&mut self) -> DcoResult<usize> {
        let mut written = 0;
        self.push_outbound(&mut written)?;
        Ok(written)
    }

    fn push_outbound(&mut self, written: &mut usize) -> DcoResult<()> {
        if self.closed {
            return Err(DcoError::Closed);
        }

        while !self.outbound.is_empty() {
            match self.transport.write(&self.outbound) {
                Ok(0) => {
                    return Err(DcoError::transport(
                        "write",
                        &io::Error::from(io::ErrorKind::WriteZero),
                    ));
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                    *written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Control channel write failed");
                    return Err(DcoError::transport("write", &e));
                }
            }
        }
        Ok(())
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Register the transport with the daemon's event loop.
    ///
    /// Allowed once per channel; the registration is dropped on close.
    pub fn register_with_event_loop(
        &mut self,
        registrar: &dyn EventLoopRegistrar,
        token: LoopToken,
    ) -> DcoResult<()> {
        if self.closed {
            return Err(DcoError::Closed);
        }
        if self.registration.is_some() {
            return Err(DcoError::AlreadyRegistered);
        }

        let registration = registrar
            .register(self.transport.raw_fd(), token)
            .map_err(|e| DcoError::transport("register", &e))?;
        info!(token = %token, "Control channel registered with event loop");
        self.registration = Some(registration);
        Ok(())
    }

    pub fn token(&self) -> Option<LoopToken> {
        self.registration.as_ref().map(|r| r.token())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Deregister, discard buffered frames and release the transport.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.registration = None;
        self.decoder.clear();
        self.outbound.clear();
        if let Err(e) = self.transport.close() {
            debug!(error = %e, "Ignoring error while closing control transport");
        }
        self.closed = true;
    }
}
