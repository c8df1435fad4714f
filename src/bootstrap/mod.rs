//! LoWPAN bootstrap protocol
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Design
//! The state machines are sans-IO: every entry point receives a [Context] holding the current
//! time, the outbound interface, a random source and the task timers, and returns as soon as the
//! next message has been issued. Waiting on a peer is an armed timer plus a state to resume from.
pub mod client;
pub mod conf_param;
pub mod devices;
pub mod join_table;
pub mod lbp;
pub mod server;

use crate::adp::AdpRequest;
use crate::hif::HostMessage;
use crate::interface::G3Interface;
use crate::timer::{millis, Duration, Instant, Timers};
use crate::Error;
use rand_core::{CryptoRng, RngCore};

/// The number of timers the protocol task can arm at once.
pub const MAX_TIMERS: usize = 24;

pub type TaskTimers = Timers<TimerId, MAX_TIMERS>;

/// Every timer of the protocol task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerId {
    /// Periodic eviction of stale joining entries.
    ServerSweep,
    /// The host did not provide the PSK of the joining entry in this slot.
    PskGet(usize),
    /// Pacing between re-keying phases.
    Rekeying,
    /// A device did not complete its re-keying exchange.
    RekeyingMsg,
    Kick,
    /// Randomized wait before discovery or the next join attempt.
    ClientWait,
    /// The server did not answer a bootstrap message.
    ClientMessage,
    ClientPanSort,
    KeepAlivePeriod,
    KeepAliveResponse,
    LastGasp,
}

/// Everything a state machine may touch while processing one event.
pub struct Context<'a, I, R> {
    pub now: Instant,
    pub iface: &'a mut I,
    pub rng: &'a mut R,
    pub timers: &'a mut TaskTimers,
}

impl<I: G3Interface, R: RngCore + CryptoRng> Context<'_, I, R> {
    pub fn request(&mut self, request: AdpRequest) -> Result<(), Error> {
        self.iface.request(request)
    }

    pub fn notify(&mut self, message: HostMessage) {
        self.iface.notify(message)
    }

    /// Arm a timer, replacing any running instance.
    pub fn start_timer(&mut self, id: TimerId, delay: Duration) {
        if self.timers.start(id, self.now, delay).is_err() {
            log::error!("No timer available for {:?}", id);
        }
    }

    pub fn stop_timer(&mut self, id: TimerId) {
        self.timers.stop(id)
    }

    /// A uniformly distributed delay of at most `max_ms`.
    pub fn random_delay(&mut self, max_ms: u32) -> Duration {
        millis(self.rng.next_u32() % max_ms.saturating_add(1))
    }
}
