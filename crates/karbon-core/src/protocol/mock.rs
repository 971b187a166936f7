//! In-memory channel
//!
//! Stands in for the MCU in tests and simulations. Bytes injected with [`MockChannel::inject`]
//! become readable on every clone; bytes written are recorded and can be answered by a
//! responder closure that sees the current line rate.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::stream::CommunicationChannel;
use super::DEFAULT_BAUD_RATE;

type Responder = Box<dyn FnMut(u32, &[u8]) -> Option<Vec<u8>> + Send>;

struct MockState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    baud_rate: u32,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    responder: Option<Responder>,
}

struct Shared {
    state: Mutex<MockState>,
    readable: Condvar,
}

/// Cloneable in-memory [`CommunicationChannel`]
#[derive(Clone)]
pub struct MockChannel {
    shared: Arc<Shared>,
    timeout: Duration,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChannel {
    /// Idle channel with nothing to read
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    rx: VecDeque::new(),
                    tx: Vec::new(),
                    baud_rate: DEFAULT_BAUD_RATE,
                    read_error: None,
                    write_error: None,
                    responder: None,
                }),
                readable: Condvar::new(),
            }),
            timeout: Duration::from_millis(10),
        }
    }

    /// Answer writes: the closure gets the line rate and the written bytes and may return
    /// bytes for the host to read.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(u32, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
        self
    }

    /// Make bytes available to readers, as if the device sent them
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes.iter().copied());
        self.shared.readable.notify_all();
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// Everything written so far, clearing the record
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().tx)
    }

    /// Fail every following read with `kind`
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.lock().read_error = Some(kind);
        self.shared.readable.notify_all();
    }

    /// Fail every following write with `kind`
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.lock().write_error = Some(kind);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Read for MockChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock();
        loop {
            if let Some(kind) = state.read_error {
                return Err(io::Error::new(kind, "mock read failure"));
            }
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            state = self
                .shared
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

impl Write for MockChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if let Some(kind) = state.write_error {
            return Err(io::Error::new(kind, "mock write failure"));
        }
        state.tx.extend_from_slice(buf);

        let baud = state.baud_rate;
        let reply = state.responder.as_mut().and_then(|respond| respond(baud, buf));
        if let Some(reply) = reply {
            state.rx.extend(reply);
            self.shared.readable.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for MockChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.lock().rx.clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(self.clone()))
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.lock().baud_rate = baud_rate;
        Ok(())
    }
}
