//! Background reader thread

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use super::{write_message, SessionState, Shared, Writer};
use crate::event::Event;
use crate::protocol::stream::is_idle;
use crate::protocol::{CommunicationChannel, Decoder, Encoder, KarbonError};

pub(super) struct Reader {
    pub(super) name: String,
    pub(super) channel: Box<dyn CommunicationChannel>,
    pub(super) decoder: Box<dyn Decoder>,
    pub(super) encoder: Arc<dyn Encoder>,
    pub(super) writer: Writer,
    pub(super) shared: Arc<Shared>,
}

impl Reader {
    pub(super) fn run(mut self) {
        debug!("Reader for {} started", self.name);
        let mut buf = [0u8; 256];

        while !self.shared.stop.load(Ordering::Acquire) {
            match self.channel.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.handle_bytes(&buf[..n]),
                Err(e) if is_idle(&e) => continue,
                Err(e) => {
                    self.fault(e);
                    break;
                }
            }
        }

        debug!("Reader for {} exiting", self.name);
    }

    fn handle_bytes(&mut self, bytes: &[u8]) {
        trace!("{} rx {} bytes", self.name, bytes.len());
        for item in self.decoder.decode(bytes) {
            match item {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!("{}: {}", self.name, e);
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        self.shared.record(&event);

        if self.shared.queue.push(event.clone()) {
            debug!("{}: queue full, dropped oldest event", self.name);
        }

        if self.shared.bootstrap.load(Ordering::Acquire) {
            self.shared.reactions().observe(&event);
            return;
        }
        let sink = self.shared.sink();
        let responses = self.shared.reactions().dispatch(&event, &sink);

        for response in responses {
            if let Err(e) = write_message(&self.writer, self.encoder.as_ref(), &response) {
                warn!("{}: auto-response failed: {}", self.name, e);
                (self.shared.sink())(&e);
            }
        }
    }

    fn fault(&mut self, e: io::Error) {
        if self.shared.stop.load(Ordering::Acquire) {
            return;
        }
        error!("Reader for {} failed: {}", self.name, e);
        self.shared.set_state_if_open(SessionState::Faulted);
        self.shared.queue.fault(&e);
        (self.shared.sink())(&KarbonError::IoError(io::Error::new(e.kind(), e.to_string())));
    }
}
