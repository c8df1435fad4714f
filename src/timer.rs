//! G3 bridge one-shot timers
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Design
//! The protocol task never blocks while waiting on a peer. Each state machine arms named one-shot
//! deadlines here, and the task converts expired deadlines into events that are queued behind any
//! frames already received. A timeout and a message racing each other are therefore resolved by
//! queue order alone.
use crate::Error;
use heapless::Vec;

/// A point in time of the 1 kHz system tick.
pub type Instant = fugit::TimerInstantU32<1000>;

/// A span of time of the 1 kHz system tick.
pub type Duration = fugit::MillisDurationU32;

/// Construct a duration from milliseconds.
pub const fn millis(ms: u32) -> Duration {
    Duration::from_ticks(ms)
}

/// A fixed-capacity set of named one-shot timers.
#[derive(Debug)]
pub struct Timers<T, const N: usize> {
    armed: Vec<(T, Instant), N>,
}

impl<T: Copy + PartialEq, const N: usize> Timers<T, N> {
    /// Construct an empty timer set.
    pub const fn new() -> Self {
        Self { armed: Vec::new() }
    }

    /// Arm a timer, replacing any running timer with the same id.
    ///
    /// # Args
    /// * `id` - The timer to arm.
    /// * `now` - The current time.
    /// * `delay` - The time until the timer expires.
    pub fn start(&mut self, id: T, now: Instant, delay: Duration) -> Result<(), Error> {
        let deadline = now + delay;
        if let Some(slot) = self.armed.iter_mut().find(|(armed, _)| *armed == id) {
            slot.1 = deadline;
            return Ok(());
        }

        self.armed.push((id, deadline)).map_err(|_| Error::Bounds)
    }

    /// Cancel a timer. Cancelling a timer that is not running has no effect.
    pub fn stop(&mut self, id: T) {
        self.armed.retain(|(armed, _)| *armed != id);
    }

    /// Cancel every timer matching `filter`.
    pub fn stop_matching<F: Fn(&T) -> bool>(&mut self, filter: F) {
        self.armed.retain(|(armed, _)| !filter(armed));
    }

    /// Check if a timer is running.
    pub fn is_running(&self, id: T) -> bool {
        self.armed.iter().any(|(armed, _)| *armed == id)
    }

    /// Cancel all timers.
    pub fn clear(&mut self) {
        self.armed.clear();
    }

    /// The earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.iter().map(|(_, deadline)| *deadline).min()
    }

    /// Remove and return the earliest timer that has expired at `now`.
    pub fn expired(&mut self, now: Instant) -> Option<T> {
        let (index, _) = self
            .armed
            .iter()
            .enumerate()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .min_by_key(|(_, (_, deadline))| *deadline)?;

        Some(self.armed.swap_remove(index).0)
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for Timers<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, PartialEq)]
    enum Id {
        Sweep,
        Psk(u8),
    }

    #[test]
    fn expire_in_deadline_order() {
        let mut timers: Timers<Id, 4> = Timers::new();
        let now = Instant::from_ticks(1_000);
        timers.start(Id::Sweep, now, millis(500)).unwrap();
        timers.start(Id::Psk(2), now, millis(100)).unwrap();

        assert_eq!(timers.next_deadline(), Some(Instant::from_ticks(1_100)));
        assert_eq!(timers.expired(Instant::from_ticks(1_050)), None);

        let later = Instant::from_ticks(2_000);
        assert_eq!(timers.expired(later), Some(Id::Psk(2)));
        assert_eq!(timers.expired(later), Some(Id::Sweep));
        assert_eq!(timers.expired(later), None);
    }

    #[test]
    fn restart_replaces_deadline() {
        let mut timers: Timers<Id, 1> = Timers::new();
        let now = Instant::from_ticks(0);
        timers.start(Id::Sweep, now, millis(10)).unwrap();
        timers.start(Id::Sweep, now, millis(50)).unwrap();
        assert_eq!(timers.expired(Instant::from_ticks(20)), None);
        assert!(timers.is_running(Id::Sweep));

        assert_eq!(timers.start(Id::Psk(0), now, millis(1)), Err(Error::Bounds));

        timers.stop(Id::Sweep);
        assert_eq!(timers.next_deadline(), None);
    }
}
