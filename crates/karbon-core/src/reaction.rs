//! Reaction registry
//!
//! Binds callbacks to bus events. Every decoded event is checked against all registered
//! matchers in registration order; each match runs its callback once on the reader thread
//! and may answer with an automatic response written to the same session.
//!
//! Callbacks run while the registry is locked. They must not register or unregister
//! reactions on the session that invoked them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{DioState, Event, Outgoing};
use crate::protocol::KarbonError;

/// Handle returned by [`ReactionRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReactionId(u64);

impl ReactionId {
    /// Raw id, as reported in [`KarbonError::ReactionCallbackError`]
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Receives reaction failures and reader-thread faults
pub type ErrorSink = Arc<dyn Fn(&KarbonError) + Send + Sync>;

/// Sink that only logs
pub fn log_sink() -> ErrorSink {
    Arc::new(|e: &KarbonError| warn!("{}", e))
}

/// Reaction callback. `Ok(Some(_))` replaces the registered auto-response for this event.
pub type Callback = Box<dyn FnMut(&Event) -> anyhow::Result<Option<Outgoing>> + Send>;

/// Direction of a digital-input transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    /// 0 → 1
    Rising,
    /// 1 → 0
    Falling,
    /// Either direction
    Either,
}

/// Partial DIO bus state: bits in `mask` must equal the same bits of `expected`.
///
/// Bit layout follows [`DioState::bus`]: inputs in bits 0-3, outputs in bits 4-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DioPattern {
    /// Bits that are checked
    pub mask: u8,
    /// Required value of the checked bits
    pub expected: u8,
}

impl DioPattern {
    /// Parse the terminal's shorthand, e.g. `"---0 ---1"`; `-` means don't care
    pub fn parse(text: &str) -> Option<Self> {
        let chars: Vec<char> = text.chars().filter(|c| *c != ' ').collect();
        if chars.len() != 8 {
            return None;
        }
        let mut pattern = DioPattern {
            mask: 0,
            expected: 0,
        };
        for (bit, c) in chars.iter().enumerate() {
            match c {
                '-' => {}
                '0' => pattern.mask |= 1 << bit,
                '1' => {
                    pattern.mask |= 1 << bit;
                    pattern.expected |= 1 << bit;
                }
                _ => return None,
            }
        }
        Some(pattern)
    }

    /// Whether `state` agrees with every checked bit
    pub fn matches(&self, state: &DioState) -> bool {
        state.bus() & self.mask == self.expected & self.mask
    }
}

/// What a reaction fires on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    /// CAN frame with exactly this id
    CanId(u32),
    /// CAN frame whose id bits under `mask` equal those of `id`
    CanIdMask {
        /// Id to compare against
        id: u32,
        /// Bits of the id that must agree
        mask: u32,
    },
    /// Digital input `pin` changed in direction `edge`, optionally only while the bus
    /// matches `when`
    InputEdge {
        /// Input pin, 0-3
        pin: u8,
        /// Transition that fires
        edge: Edge,
        /// Bus state required after the transition
        when: Option<DioPattern>,
    },
    /// DIO report matching a partial bus state
    DioState(DioPattern),
}

impl Matcher {
    /// Check an event; `previous` is the DIO state reported before this one
    pub fn matches(&self, event: &Event, previous: Option<DioState>) -> bool {
        match (self, event) {
            (Matcher::CanId(id), Event::CanFrame(frame)) => frame.id == *id,
            (Matcher::CanIdMask { id, mask }, Event::CanFrame(frame)) => {
                frame.id & mask == id & mask
            }
            (Matcher::InputEdge { pin, edge, when }, Event::Dio(state)) => {
                let Some(previous) = previous else {
                    return false;
                };
                let before = previous.input(*pin);
                let after = state.input(*pin);
                let fired = match edge {
                    Edge::Rising => !before && after,
                    Edge::Falling => before && !after,
                    Edge::Either => before != after,
                };
                fired && when.map_or(true, |pattern| pattern.matches(state))
            }
            (Matcher::DioState(pattern), Event::Dio(state)) => pattern.matches(state),
            _ => false,
        }
    }
}

struct Reaction {
    id: ReactionId,
    matcher: Matcher,
    callback: Callback,
    auto_response: Option<Outgoing>,
}

/// Ordered set of reactions for one session
#[derive(Default)]
pub struct ReactionRegistry {
    reactions: Vec<Reaction>,
    next_id: u64,
    last_dio: Option<DioState>,
}

impl ReactionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reaction after all existing ones
    pub fn register<F>(
        &mut self,
        matcher: Matcher,
        callback: F,
        auto_response: Option<Outgoing>,
    ) -> ReactionId
    where
        F: FnMut(&Event) -> anyhow::Result<Option<Outgoing>> + Send + 'static,
    {
        self.next_id += 1;
        let id = ReactionId(self.next_id);
        debug!("Registered reaction {} on {:?}", id.0, matcher);
        self.reactions.push(Reaction {
            id,
            matcher,
            callback: Box::new(callback),
            auto_response,
        });
        id
    }

    /// Remove a reaction. Returns `false` if it was not registered.
    pub fn unregister(&mut self, id: ReactionId) -> bool {
        let before = self.reactions.len();
        self.reactions.retain(|r| r.id != id);
        before != self.reactions.len()
    }

    /// Number of registered reactions
    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    /// Whether no reactions are registered
    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    /// Last DIO report seen by [`ReactionRegistry::dispatch`] or [`ReactionRegistry::observe`]
    pub fn last_dio(&self) -> Option<DioState> {
        self.last_dio
    }

    /// Track `event` without running any reaction, so edges stay relative to the latest report
    pub fn observe(&mut self, event: &Event) {
        if let Event::Dio(state) = event {
            self.last_dio = Some(*state);
        }
    }

    /// Run every matching reaction for `event` and collect the responses to send.
    ///
    /// A failing or panicking callback is reported to `sink` and skipped; the rest still run.
    pub fn dispatch(&mut self, event: &Event, sink: &ErrorSink) -> Vec<Outgoing> {
        let previous = self.last_dio;
        let mut responses = Vec::new();

        for reaction in &mut self.reactions {
            if !reaction.matcher.matches(event, previous) {
                continue;
            }

            let callback = &mut reaction.callback;
            let result = catch_unwind(AssertUnwindSafe(|| callback(event)));
            match result {
                Ok(Ok(response)) => {
                    if let Some(out) = response.or_else(|| reaction.auto_response.clone()) {
                        responses.push(out);
                    }
                }
                Ok(Err(e)) => sink(&KarbonError::ReactionCallbackError {
                    id: reaction.id.0,
                    message: format!("{:#}", e),
                }),
                Err(_) => sink(&KarbonError::ReactionCallbackError {
                    id: reaction.id.0,
                    message: "callback panicked".to_string(),
                }),
            }
        }

        self.observe(event);
        responses
    }
}
