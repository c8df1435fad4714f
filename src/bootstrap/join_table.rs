//! Table of devices with a bootstrap in progress
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
use crate::adp::{ExtendedAddress, MediaType, BROADCAST_SHORT_ADDR};
use crate::settings::Identity;
use crate::timer::{Duration, Instant};
use eap_psk::{PskContext, Rand};

/// The number of devices that may bootstrap at the same time.
pub const MAX_JOINING_NODES: usize = 8;

/// The extended address marking a free slot.
const FREE: ExtendedAddress = [0; 8];

/// Progress of a single device through the bootstrap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JoinState {
    WaitJoin,
    /// Message 1 sent.
    WaitSecond,
    /// Message 2 received, waiting for the host to provide the PSK.
    WaitPsk,
    /// Message 3 sent.
    WaitFourth,
    /// Accepted or Decline sent, waiting for the LBP confirm.
    WaitCnf,
    /// GMK activation sent, waiting for the Parameter-Result.
    WaitParam,
}

/// One device bootstrap session.
#[derive(Debug, Clone)]
pub struct JoinEntry {
    pub ext_addr: ExtendedAddress,
    pub short_addr: u16,
    /// The agent relaying the bootstrap, or the device itself once it is joined.
    pub lba_addr: u16,
    pub state: JoinState,
    pub psk: PskContext,
    pub rand_s: Rand,
    pub rand_p: Rand,
    pub mac_p: [u8; 16],
    pub id_p: Identity,
    /// The EAP identifier of the last request sent.
    pub identifier: u8,
    /// The P-Channel nonce expected in message 4.
    pub nonce: u32,
    pub join_time: Instant,
    pub psk_request_time: Instant,
    pub media_type: MediaType,
    /// The NSDU handle of the last LBP request sent.
    pub handle: Option<u8>,
    pub disable_backup: bool,
    /// The session delivers a new GMK to a joined device.
    pub rekeying: bool,
    /// Message 3 carried the GMK of a rotation in progress.
    pub new_gmk: bool,
}

impl JoinEntry {
    fn free() -> Self {
        Self {
            ext_addr: FREE,
            short_addr: BROADCAST_SHORT_ADDR,
            lba_addr: BROADCAST_SHORT_ADDR,
            state: JoinState::WaitJoin,
            psk: PskContext::default(),
            rand_s: [0; 16],
            rand_p: [0; 16],
            mac_p: [0; 16],
            id_p: Identity::new(),
            identifier: 0,
            nonce: 0,
            join_time: Instant::from_ticks(0),
            psk_request_time: Instant::from_ticks(0),
            media_type: MediaType::Plc,
            handle: None,
            disable_backup: false,
            rekeying: false,
            new_gmk: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.ext_addr == FREE
    }

    /// Restart the session from scratch, keeping the device address.
    pub fn restart(&mut self, now: Instant) {
        let ext_addr = self.ext_addr;
        *self = JoinEntry::free();
        self.ext_addr = ext_addr;
        self.join_time = now;
    }
}

/// Fixed pool of bootstrap sessions, indexed by slot.
#[derive(Debug)]
pub struct JoinTable<const N: usize = MAX_JOINING_NODES> {
    entries: [JoinEntry; N],
}

impl<const N: usize> Default for JoinTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> JoinTable<N> {
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| JoinEntry::free()),
        }
    }

    /// Allocate a session for a device.
    ///
    /// # Note
    /// The all-zero address marks free slots and can never be added. A device that already has
    /// a session keeps it.
    ///
    /// # Args
    /// * `ext_addr` - The EUI-64 of the device.
    /// * `now` - The time the join started.
    ///
    /// # Returns
    /// The slot of the session, or None if the table is full.
    pub fn add(&mut self, ext_addr: ExtendedAddress, now: Instant) -> Option<usize> {
        if ext_addr == FREE {
            log::warn!("Refusing all-zero extended address");
            return None;
        }

        if let Some(index) = self.find(&ext_addr) {
            return Some(index);
        }

        let index = self.find_free()?;
        let entry = &mut self.entries[index];
        entry.ext_addr = ext_addr;
        entry.join_time = now;
        Some(index)
    }

    pub fn find(&self, ext_addr: &ExtendedAddress) -> Option<usize> {
        if *ext_addr == FREE {
            return None;
        }
        self.entries.iter().position(|entry| entry.ext_addr == *ext_addr)
    }

    /// Find the session waiting for the confirm of the LBP request with `handle`.
    pub fn find_handle(&self, handle: u8) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.is_free() && entry.handle == Some(handle))
    }

    pub fn find_free(&self) -> Option<usize> {
        self.entries.iter().position(JoinEntry::is_free)
    }

    pub fn get(&self, index: usize) -> Option<&JoinEntry> {
        self.entries.get(index).filter(|entry| !entry.is_free())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut JoinEntry> {
        self.entries.get_mut(index).filter(|entry| !entry.is_free())
    }

    /// The slot of an entry borrowed from this table.
    pub fn index(&self, entry: &JoinEntry) -> Option<usize> {
        self.entries
            .iter()
            .position(|candidate| core::ptr::eq(candidate, entry))
    }

    /// Free a slot. The key material of the session is wiped.
    pub fn remove(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            *entry = JoinEntry::free();
        }
    }

    /// Iterate over the sessions in use.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &JoinEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_free())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free every session that started more than `ttl` ago.
    ///
    /// # Returns
    /// The number of sessions freed.
    pub fn reset_expired_entries(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|entry| !entry.is_free()) {
            let expired = now
                .checked_duration_since(entry.join_time)
                .map_or(false, |age| age > ttl);

            if expired {
                log::info!("Joining entry {:02x?} expired in {:?}", entry.ext_addr, entry.state);
                *entry = JoinEntry::free();
                count += 1;
            }
        }

        count
    }

    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = JoinEntry::free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::millis;

    fn eui(last: u8) -> ExtendedAddress {
        [0x02, 0x80, 0xE1, 0, 0, 0, 0, last]
    }

    #[test]
    fn single_entry_per_device() {
        let mut table: JoinTable = JoinTable::new();
        let now = Instant::from_ticks(0);

        let first = table.add(eui(1), now).unwrap();
        assert_eq!(table.add(eui(1), now), Some(first));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&eui(1)), Some(first));

        table.remove(first);
        assert!(table.is_empty());
        assert_eq!(table.find(&eui(1)), None);
    }

    #[test]
    fn zero_address_is_never_a_device() {
        let mut table: JoinTable = JoinTable::new();
        assert_eq!(table.add([0; 8], Instant::from_ticks(0)), None);
        assert_eq!(table.find(&[0; 8]), None);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn full_table() {
        let mut table: JoinTable<2> = JoinTable::new();
        let now = Instant::from_ticks(0);
        table.add(eui(1), now).unwrap();
        table.add(eui(2), now).unwrap();
        assert_eq!(table.add(eui(3), now), None);
        assert_eq!(table.find(&eui(1)), Some(0));
        assert_eq!(table.find(&eui(2)), Some(1));
    }

    #[test]
    fn lookup_by_handle_and_reference() {
        let mut table: JoinTable = JoinTable::new();
        let index = table.add(eui(4), Instant::from_ticks(0)).unwrap();
        table.get_mut(index).unwrap().handle = Some(9);

        assert_eq!(table.find_handle(9), Some(index));
        assert_eq!(table.find_handle(8), None);

        let entry = table.get(index).unwrap();
        assert_eq!(table.index(entry), Some(index));
    }

    #[test]
    fn expiry_is_idempotent() {
        let mut table: JoinTable = JoinTable::new();
        table.add(eui(1), Instant::from_ticks(0)).unwrap();
        table.add(eui(2), Instant::from_ticks(50_000)).unwrap();

        let now = Instant::from_ticks(75_000);
        assert_eq!(table.reset_expired_entries(now, millis(70_000)), 1);
        assert_eq!(table.reset_expired_entries(now, millis(70_000)), 0);
        assert_eq!(table.find(&eui(1)), None);
        assert!(table.find(&eui(2)).is_some());
    }
}
