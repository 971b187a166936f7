//! Sessions
//!
//! A [`Session`] owns one of the MCU's ports. It claims the port, runs a reader thread that
//! decodes incoming bytes into [`Event`]s, queues them for the caller and runs matching
//! reactions. Writes happen synchronously on the caller's thread.
//!
//! ```rust,ignore
//! use karbon_core::prelude::*;
//!
//! let ports = locate()?;
//! let can = Session::open(&ports.can, SessionConfig::default())?;
//! can.register(Matcher::CanId(0x123), |event| {
//!     println!("{:?}", event);
//!     Ok(None)
//! }, None);
//! can.send(CanFrame::new(0x7DF, vec![0x02, 0x01, 0x0C])?)?;
//! let event = can.recv(Duration::from_secs(1))?;
//! ```

mod config;
mod reader;

pub use config::SessionConfig;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::event::{Event, Outgoing};
use crate::protocol::{
    open_port, ChannelKind, CommunicationChannel, Decoder, Encoder, KarbonError, PortClaim,
    PortRef, SerialChannel,
};
use crate::queue::EventQueue;
use crate::reaction::{log_sink, ErrorSink, Matcher, ReactionId, ReactionRegistry};
use reader::Reader;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Reader running, port writable
    Open,
    /// Reader stopped on an I/O error
    Faulted,
    /// Closed by the caller
    Closed,
}

type Writer = Arc<Mutex<Option<Box<dyn CommunicationChannel>>>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Encode and write one message on the shared writer handle
fn write_message(
    writer: &Writer,
    encoder: &dyn Encoder,
    message: &Outgoing,
) -> Result<(), KarbonError> {
    let bytes = encoder.encode(message)?;
    let mut guard = lock(writer);
    let channel = guard.as_mut().ok_or(KarbonError::NotOpen)?;
    channel.write_all(&bytes)?;
    channel.flush()?;
    Ok(())
}

/// State shared between a session and its reader thread
struct Shared {
    queue: EventQueue,
    reactions: Mutex<ReactionRegistry>,
    state: Mutex<SessionState>,
    stop: AtomicBool,
    bootstrap: AtomicBool,
    /// Live CAN bus rate, 0 until known
    can_baud: AtomicU32,
    malformed: AtomicU64,
    info: Mutex<BTreeMap<String, String>>,
    sink: Mutex<ErrorSink>,
}

impl Shared {
    fn reactions(&self) -> MutexGuard<'_, ReactionRegistry> {
        lock(&self.reactions)
    }

    fn sink(&self) -> ErrorSink {
        lock(&self.sink).clone()
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state_if_open(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state == SessionState::Open {
            *state = next;
        }
    }

    /// Track the latest value of everything the terminal reports
    fn record(&self, event: &Event) {
        match event {
            Event::ConfigEntry { key, value } => {
                lock(&self.info).insert(key.clone(), value.clone());
            }
            Event::Dio(state) => {
                lock(&self.info).insert("dio-state".to_string(), state.to_string());
            }
            _ => {}
        }
    }
}

struct ReaderHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the reader thread exits
    done: Receiver<()>,
}

/// An open connection to one of the MCU's ports
pub struct Session {
    name: String,
    kind: ChannelKind,
    config: SessionConfig,
    shared: Arc<Shared>,
    writer: Writer,
    encoder: Arc<dyn Encoder>,
    reader: Mutex<Option<ReaderHandle>>,
    claim: Mutex<Option<PortClaim>>,
}

impl Session {
    /// Claim and open a located port, then start reading
    pub fn open(port: &PortRef, config: SessionConfig) -> Result<Self, KarbonError> {
        let claim = PortClaim::acquire(&port.name)?;
        let serial = open_port(&port.name, Some(config.baud_rate), Some(config.read_timeout()))?;
        let mut channel = SerialChannel::new(serial);
        channel.clear_input_buffer()?;

        let (decoder, encoder) = config.codec.build(port.kind);
        Self::start(
            port.name.clone(),
            port.kind,
            Box::new(channel),
            config,
            claim,
            decoder,
            encoder,
        )
    }

    /// Start a session over any transport. `name` is claimed like a port name.
    pub fn open_channel<C>(
        name: &str,
        kind: ChannelKind,
        channel: C,
        config: SessionConfig,
    ) -> Result<Self, KarbonError>
    where
        C: CommunicationChannel + 'static,
    {
        let (decoder, encoder) = config.codec.build(kind);
        Self::open_with_codec(name, kind, channel, config, decoder, encoder)
    }

    /// Start a session with a caller-supplied codec pair
    pub fn open_with_codec<C>(
        name: &str,
        kind: ChannelKind,
        channel: C,
        config: SessionConfig,
        decoder: Box<dyn Decoder>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, KarbonError>
    where
        C: CommunicationChannel + 'static,
    {
        let claim = PortClaim::acquire(name)?;
        Self::start(
            name.to_string(),
            kind,
            Box::new(channel),
            config,
            claim,
            decoder,
            encoder,
        )
    }

    /// Open a port, run `f`, and close the port again whatever `f` returns
    pub fn scoped<T, F>(port: &PortRef, config: SessionConfig, f: F) -> Result<T, KarbonError>
    where
        F: FnOnce(&Session) -> Result<T, KarbonError>,
    {
        let session = Session::open(port, config)?;
        let result = f(&session);
        let closed = session.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    fn start(
        name: String,
        kind: ChannelKind,
        mut channel: Box<dyn CommunicationChannel>,
        config: SessionConfig,
        claim: PortClaim,
        decoder: Box<dyn Decoder>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, KarbonError> {
        channel.set_timeout(config.read_timeout())?;
        let mut read_channel = channel.try_clone()?;
        read_channel.set_timeout(config.read_timeout())?;

        let shared = Arc::new(Shared {
            queue: EventQueue::new(config.queue_capacity),
            reactions: Mutex::new(ReactionRegistry::new()),
            state: Mutex::new(SessionState::Open),
            stop: AtomicBool::new(false),
            bootstrap: AtomicBool::new(false),
            can_baud: AtomicU32::new(0),
            malformed: AtomicU64::new(0),
            info: Mutex::new(BTreeMap::new()),
            sink: Mutex::new(log_sink()),
        });
        let writer: Writer = Arc::new(Mutex::new(Some(channel)));

        let reader = Reader {
            name: name.clone(),
            channel: read_channel,
            decoder,
            encoder: encoder.clone(),
            writer: writer.clone(),
            shared: shared.clone(),
        };
        let (done_tx, done) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(format!("karbon-{}", kind))
            .spawn(move || {
                let _done = done_tx;
                reader.run();
            })?;

        info!("Opened {} session on {}", kind, name);
        Ok(Self {
            name,
            kind,
            config,
            shared,
            writer,
            encoder,
            reader: Mutex::new(Some(ReaderHandle { thread, done })),
            claim: Mutex::new(Some(claim)),
        })
    }

    /// Write a frame, remote request, command or raw line
    pub fn send(&self, message: impl Into<Outgoing>) -> Result<(), KarbonError> {
        if self.state() != SessionState::Open {
            return Err(KarbonError::NotOpen);
        }
        let message = message.into();
        debug!("{} tx {:?}", self.name, message);
        write_message(&self.writer, self.encoder.as_ref(), &message)
    }

    /// Ask the node with `id` for `len` bytes
    pub fn send_remote(&self, id: u32, len: u8) -> Result<(), KarbonError> {
        self.send(Outgoing::Remote { id, len })
    }

    /// Next event, waiting up to `timeout`
    pub fn recv(&self, timeout: Duration) -> Result<Event, KarbonError> {
        self.shared.queue.pop_timeout(timeout)
    }

    /// Next event, waiting until one arrives or the session stops
    pub fn recv_forever(&self) -> Result<Event, KarbonError> {
        self.shared.queue.pop_blocking()
    }

    /// First queued event `select` accepts, waiting up to `timeout`. Other events keep their
    /// place in the queue.
    pub fn recv_matching<T, F>(&self, timeout: Duration, select: F) -> Result<T, KarbonError>
    where
        F: FnMut(&Event) -> Option<T>,
    {
        self.shared.queue.take_matching(timeout, select)
    }

    /// Next event if one is queued, `WouldBlock` otherwise
    pub fn try_recv(&self) -> Result<Event, KarbonError> {
        self.shared.queue.try_pop()
    }

    /// Next event without consuming it
    pub fn peek(&self, timeout: Duration) -> Result<Event, KarbonError> {
        self.shared.queue.peek_timeout(timeout)
    }

    /// Everything queued right now
    pub fn drain(&self) -> Vec<Event> {
        self.shared.queue.drain()
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Add a reaction; see [`ReactionRegistry::register`]. Must not be called from a callback
    /// of this session.
    pub fn register<F>(
        &self,
        matcher: Matcher,
        callback: F,
        auto_response: Option<Outgoing>,
    ) -> ReactionId
    where
        F: FnMut(&Event) -> anyhow::Result<Option<Outgoing>> + Send + 'static,
    {
        self.shared.reactions().register(matcher, callback, auto_response)
    }

    /// Remove a reaction. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ReactionId) -> bool {
        self.shared.reactions().unregister(id)
    }

    /// Number of registered reactions
    pub fn reaction_count(&self) -> usize {
        self.shared.reactions().len()
    }

    /// Where reaction failures and reader faults are reported. Defaults to a `warn!` log.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *lock(&self.shared.sink) = sink;
    }

    /// Suspend (or resume) reaction dispatch. Events are still queued.
    pub fn set_bootstrap(&self, enabled: bool) {
        debug!("{} bootstrap mode {}", self.name, if enabled { "on" } else { "off" });
        self.shared.bootstrap.store(enabled, Ordering::Release);
    }

    /// Whether reaction dispatch is suspended
    pub fn is_bootstrap(&self) -> bool {
        self.shared.bootstrap.load(Ordering::Acquire)
    }

    /// Change the host-side line rate of the underlying channel
    pub fn reconfigure_channel(&self, baud_rate: u32) -> Result<(), KarbonError> {
        let mut guard = lock(&self.writer);
        let channel = guard.as_mut().ok_or(KarbonError::NotOpen)?;
        channel.set_baud_rate(baud_rate)?;
        Ok(())
    }

    /// Record the CAN bus rate in use
    pub fn set_can_baud(&self, baud_rate: u32) {
        self.shared.can_baud.store(baud_rate, Ordering::Release);
    }

    /// CAN bus rate, once detected or set
    pub fn baud_rate(&self) -> Option<u32> {
        match self.shared.can_baud.load(Ordering::Acquire) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Which MCU port this session talks to
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Name the port was claimed under
    pub fn port_name(&self) -> &str {
        &self.name
    }

    /// Settings the session was opened with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Events evicted from a full queue
    pub fn overflow_count(&self) -> u64 {
        self.shared.queue.overflow_count()
    }

    /// Input the decoder could not parse
    pub fn malformed_count(&self) -> u64 {
        self.shared.malformed.load(Ordering::Relaxed)
    }

    /// Latest value of every configuration key the terminal has reported
    pub fn device_info(&self) -> BTreeMap<String, String> {
        lock(&self.shared.info).clone()
    }

    /// Stop the reader, release the port and wake blocked receivers.
    ///
    /// Calling it again is a no-op. If the reader does not stop within the configured close
    /// timeout, returns [`KarbonError::ReaderStuck`] and keeps the port claimed.
    pub fn close(&self) -> Result<(), KarbonError> {
        let mut reader = lock(&self.reader);
        let Some(handle) = reader.as_ref() else {
            return Ok(());
        };

        debug!("Closing {} session on {}", self.kind, self.name);
        self.shared.stop.store(true, Ordering::Release);
        *lock(&self.shared.state) = SessionState::Closed;
        self.shared.queue.close();

        let timeout = self.config.close_timeout();
        if let Err(RecvTimeoutError::Timeout) = handle.done.recv_timeout(timeout) {
            warn!("Reader for {} did not stop within {:?}", self.name, timeout);
            return Err(KarbonError::ReaderStuck(timeout));
        }
        if let Some(handle) = reader.take() {
            if handle.thread.join().is_err() {
                warn!("Reader for {} panicked", self.name);
            }
        }

        lock(&self.writer).take();
        lock(&self.claim).take();
        info!("Closed {}", self.name);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing {} on drop: {}", self.name, e);
        }
    }
}
