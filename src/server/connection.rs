//! Per-client state: bounded input/output buffers and newline framing.

use bytes::{Buf, BytesMut};
use std::io::{self, ErrorKind};
use tracing::debug;

use super::socket::ClientStream;

/// Frame delimiter for both requests and responses.
pub const DELIMITER: u8 = b'\n';

/// Result of one read attempt on a connection.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes were appended to the input buffer.
    Data(usize),
    /// Nothing available right now.
    NotReady,
    /// Peer closed its write side.
    Closed,
    /// Input buffer is full but still holds frames waiting for dispatch.
    Stalled,
    /// Input buffer is full and holds no complete frame.
    Overflow,
    Failed(io::Error),
}

/// Result of one write attempt on a connection.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Nothing was queued.
    Idle,
    /// The whole output buffer was transmitted.
    Flushed(usize),
    /// Only a prefix was transmitted; the rest stays queued.
    Partial(usize),
    NotReady,
    Failed(io::Error),
}

/// Errors that only mean "try again on the next pass".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// A live client connection occupying one slot of the server table.
#[derive(Debug)]
pub struct ClientConnection<S> {
    id: usize,
    stream: S,
    input: BytesMut,
    input_ready: bool,
    output: BytesMut,
    want_write: bool,
    max_buffer: usize,
}

impl<S: ClientStream> ClientConnection<S> {
    pub fn new(id: usize, stream: S, max_buffer: usize) -> Self {
        Self {
            id,
            stream,
            input: BytesMut::with_capacity(max_buffer),
            input_ready: false,
            output: BytesMut::with_capacity(max_buffer),
            want_write: false,
            max_buffer,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn input_ready(&self) -> bool {
        self.input_ready
    }

    pub fn want_write(&self) -> bool {
        self.want_write
    }

    #[cfg(test)]
    pub fn buffered_input(&self) -> &[u8] {
        &self.input
    }

    #[cfg(test)]
    pub fn pending_output(&self) -> &[u8] {
        &self.output
    }

    /// Read as many bytes as fit in the remaining input capacity.
    pub fn fill(&mut self) -> ReadOutcome {
        let start = self.input.len();
        let room = self.max_buffer.saturating_sub(start);
        if room == 0 {
            return if self.next_frame_len().is_some() {
                ReadOutcome::Stalled
            } else {
                ReadOutcome::Overflow
            };
        }

        self.input.resize(start + room, 0);
        let result = self.stream.read(&mut self.input[start..]);

        match result {
            Ok(0) => {
                self.input.truncate(start);
                ReadOutcome::Closed
            }
            Ok(n) => {
                self.input.truncate(start + n);
                if self.input[start..].contains(&DELIMITER) {
                    self.input_ready = true;
                }
                ReadOutcome::Data(n)
            }
            Err(err) => {
                self.input.truncate(start);
                if is_transient(&err) {
                    ReadOutcome::NotReady
                } else {
                    ReadOutcome::Failed(err)
                }
            }
        }
    }

    /// Transmit as much of the output buffer as the peer accepts.
    pub fn flush(&mut self) -> WriteOutcome {
        if self.output.is_empty() {
            self.want_write = false;
            return WriteOutcome::Idle;
        }

        match self.stream.write(&self.output) {
            Ok(0) => WriteOutcome::Failed(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) if n >= self.output.len() => {
                self.output.clear();
                self.want_write = false;
                WriteOutcome::Flushed(n)
            }
            Ok(n) => {
                self.output.advance(n);
                WriteOutcome::Partial(n)
            }
            Err(err) if is_transient(&err) => WriteOutcome::NotReady,
            Err(err) => WriteOutcome::Failed(err),
        }
    }

    /// Length of the oldest complete frame, without its delimiter.
    pub fn next_frame_len(&self) -> Option<usize> {
        self.input.iter().position(|b| *b == DELIMITER)
    }

    /// Bytes of the oldest complete frame, without its delimiter.
    pub fn peek_frame(&self) -> Option<&[u8]> {
        self.next_frame_len().map(|len| &self.input[..len])
    }

    /// Drop the oldest complete frame (delimiter included) from the input buffer.
    pub fn consume_frame(&mut self) {
        if let Some(len) = self.next_frame_len() {
            self.input.advance(len + 1);
        }
        self.input_ready = self.next_frame_len().is_some();
    }

    /// Remaining output capacity.
    pub fn output_room(&self) -> usize {
        self.max_buffer.saturating_sub(self.output.len())
    }

    /// Append a response; callers check `output_room` first.
    pub fn queue(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.output_room() {
            return false;
        }
        self.output.extend_from_slice(bytes);
        self.want_write = true;
        true
    }

    /// Shut down both directions and release the stream.
    pub fn close(self) {
        if let Err(err) = self.stream.shutdown_both() {
            if err.kind() != ErrorKind::NotConnected {
                debug!("Shutdown of client {} failed: {}", self.id, err);
            }
        }
    }
}
