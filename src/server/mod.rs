//! Non-blocking query server multiplexing local clients over one listener.
//!
//! The server never blocks: each call to [`QueryServer::run_pass`] does one
//! bounded unit of work and returns, so it can share a thread with the
//! activity driver and be called on every tick.
//!
//! Within a pass the order is fixed:
//! 1. accept at most one queued connection into the first free slot,
//! 2. read whatever fits into each connection's input buffer,
//! 3. write queued output for connections waiting to drain,
//! 4. dispatch every complete request frame, queueing responses.
//!
//! Responses queued in step 4 go out on the next pass.

pub mod command;
pub mod connection;
pub mod socket;

use tracing::{debug, info, trace, warn};

use crate::status;
use crate::tracker::Tracker;

pub use command::Command;
pub use connection::{is_transient, ClientConnection, ReadOutcome, WriteOutcome};
pub use socket::{default_socket_dir, Listener, SocketEndpoint};

/// Default number of simultaneously connected clients.
pub const DEFAULT_MAX_CLIENTS: usize = 16;

/// Default bound for each connection's input and output buffers.
pub const DEFAULT_MAX_BUFFER: usize = 1024;

/// Counters for events that degrade service without failing the pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub closed: u64,
    /// Passes where a connection was pending but every slot was taken.
    pub rejected_full: u64,
    pub status_requests: u64,
    pub info_requests: u64,
    pub unknown_commands: u64,
    /// Dispatches postponed because the response did not fit the output buffer yet.
    pub deferred_dispatches: u64,
    /// Responses larger than the whole output buffer, dropped.
    pub dropped_responses: u64,
    /// Connections evicted for filling the input buffer without a frame.
    pub overflow_evictions: u64,
    pub io_errors: u64,
}

/// Fixed-size table of client connections served from one listener.
pub struct QueryServer<L: Listener> {
    listener: L,
    slots: Vec<Option<ClientConnection<L::Stream>>>,
    max_buffer: usize,
    stats: ServerStats,
    full_reported: bool,
}

impl<L: Listener> QueryServer<L> {
    /// Wrap an already bound, non-blocking listener.
    pub fn new(listener: L, max_clients: usize, max_buffer: usize) -> Self {
        Self {
            listener,
            slots: (0..max_clients).map(|_| None).collect(),
            max_buffer,
            stats: ServerStats::default(),
            full_reported: false,
        }
    }

    #[cfg(test)]
    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Number of occupied slots.
    #[cfg(test)]
    pub fn client_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[cfg(test)]
    pub fn connection(&self, slot: usize) -> Option<&ClientConnection<L::Stream>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// One non-blocking accept/read/write/dispatch cycle.
    pub fn run_pass(&mut self, tracker: &Tracker) {
        self.accept_pending();
        self.service_io();
        self.dispatch_requests(tracker);
    }

    fn accept_pending(&mut self) {
        match self.listener.poll_pending() {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!("Failed to poll listener: {}", err);
                return;
            }
        }

        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            // Leave the connection queued until a slot frees up.
            self.stats.rejected_full += 1;
            if self.full_reported {
                trace!("Connection pending, all {} slots still occupied", self.slots.len());
            } else {
                warn!("Too many clients connected ({}) to accept another", self.slots.len());
                self.full_reported = true;
            }
            return;
        };

        match self.listener.accept_one() {
            Ok(stream) => {
                info!("New client connection in slot {}", slot);
                self.slots[slot] = Some(ClientConnection::new(slot, stream, self.max_buffer));
                self.stats.accepted += 1;
                self.full_reported = false;
            }
            Err(err) if is_transient(&err) => {
                debug!("Pending connection vanished before accept: {}", err);
            }
            Err(err) => {
                warn!("Failed to accept incoming client connection: {}", err);
            }
        }
    }

    fn service_io(&mut self) {
        for slot in self.slots.iter_mut() {
            let Some(conn) = slot.as_mut() else {
                continue;
            };
            let id = conn.id();

            let mut evict = false;
            match conn.fill() {
                ReadOutcome::Data(n) => trace!("Read {} bytes from client {}", n, id),
                ReadOutcome::NotReady | ReadOutcome::Stalled => {}
                ReadOutcome::Closed => {
                    debug!("Client {} closed the connection", id);
                    evict = true;
                }
                ReadOutcome::Overflow => {
                    warn!(
                        "Client {} filled its {}-byte input buffer without a complete request",
                        id, self.max_buffer
                    );
                    self.stats.overflow_evictions += 1;
                    evict = true;
                }
                ReadOutcome::Failed(err) => {
                    // Retried on the next pass; a dead peer reads as closed then.
                    warn!("Unable to read client {} request: {}", id, err);
                    self.stats.io_errors += 1;
                    continue;
                }
            }

            // A peer that half-closed after its request still gets what is queued.
            if conn.want_write() {
                match conn.flush() {
                    WriteOutcome::Flushed(n) => trace!("Flushed {} bytes to client {}", n, id),
                    WriteOutcome::Partial(n) => {
                        trace!("Partial write of {} bytes to client {}", n, id)
                    }
                    WriteOutcome::Idle | WriteOutcome::NotReady => {}
                    WriteOutcome::Failed(err) => {
                        warn!("Unable to write to client {}: {}", id, err);
                        self.stats.io_errors += 1;
                    }
                }
            }

            if evict {
                if let Some(conn) = slot.take() {
                    conn.close();
                    self.stats.closed += 1;
                }
            }
        }
    }

    fn dispatch_requests(&mut self, tracker: &Tracker) {
        let mut encoded: Option<Vec<u8>> = None;

        for conn in self.slots.iter_mut().flatten() {
            if !conn.input_ready() {
                continue;
            }
            let id = conn.id();

            while let Some(frame) = conn.peek_frame() {
                match Command::parse(frame) {
                    Command::Status => {
                        debug!("Client {} requested status", id);
                        let response: &[u8] =
                            encoded.get_or_insert_with(|| status::encode(&tracker.snapshot()));

                        if response.len() > self.max_buffer {
                            warn!(
                                "Status response ({} bytes) exceeds the {}-byte output buffer, dropped",
                                response.len(),
                                self.max_buffer
                            );
                            self.stats.dropped_responses += 1;
                        } else if !conn.queue(response) {
                            // Leave the frame buffered until the writer drains.
                            debug!("Client {} output full, deferring status response", id);
                            self.stats.deferred_dispatches += 1;
                            break;
                        } else {
                            self.stats.status_requests += 1;
                        }
                    }
                    Command::Info => {
                        debug!("Client {} requested info, nothing to report", id);
                        self.stats.info_requests += 1;
                    }
                    Command::Unknown(token) => {
                        debug!("Client {} made unknown request {:?}", id, token);
                        self.stats.unknown_commands += 1;
                    }
                }
                conn.consume_frame();
            }
        }
    }

    /// Close every live connection and free all slots.
    pub fn shutdown(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(conn) = slot.take() {
                info!("Dropping connection to client {}", conn.id());
                conn.close();
                self.stats.closed += 1;
            }
        }
    }
}

impl<L: Listener> Drop for QueryServer<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
