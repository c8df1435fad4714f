//! Table of devices admitted to the PAN
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
use super::join_table::MAX_JOINING_NODES;
use crate::adp::{ExtendedAddress, MediaType, BROADCAST_SHORT_ADDR};
use crate::timer::Instant;
use crate::Error;

/// Connection state of a device. The values are bit flags so that lookups can match a set of
/// states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected = 0x01,
    Bootstrapping = 0x02,
    Connected = 0x04,
}

/// Devices holding a record: joined, or with their join in progress.
pub const IN_USE: u8 = DeviceState::Bootstrapping as u8 | DeviceState::Connected as u8;

impl DeviceState {
    pub fn matches(self, mask: u8) -> bool {
        (self as u8) & mask != 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub state: DeviceState,
    pub short_addr: u16,
    pub ext_addr: ExtendedAddress,
    /// Keep-alive requests the device may still miss.
    pub lives: u8,
    pub last_keep_alive: Instant,
    pub media_type: MediaType,
    pub disable_backup: bool,
    /// The device acknowledged the GMK of the running re-keying.
    pub rekeyed: bool,
}

impl DeviceRecord {
    const fn empty() -> Self {
        Self {
            state: DeviceState::Disconnected,
            short_addr: BROADCAST_SHORT_ADDR,
            ext_addr: [0; 8],
            lives: 0,
            last_keep_alive: Instant::from_ticks(0),
            media_type: MediaType::Plc,
            disable_backup: false,
            rekeyed: false,
        }
    }
}

#[derive(Debug)]
pub struct DeviceTable<const N: usize = MAX_JOINING_NODES> {
    devices: [DeviceRecord; N],
}

impl<const N: usize> Default for DeviceTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DeviceTable<N> {
    pub const fn new() -> Self {
        Self {
            devices: [DeviceRecord::empty(); N],
        }
    }

    /// Find a device in one of the states of `mask`.
    pub fn find(&self, ext_addr: &ExtendedAddress, mask: u8) -> Option<usize> {
        self.devices
            .iter()
            .position(|device| device.state.matches(mask) && device.ext_addr == *ext_addr)
    }

    pub fn find_short(&self, short_addr: u16, mask: u8) -> Option<usize> {
        self.devices
            .iter()
            .position(|device| device.state.matches(mask) && device.short_addr == short_addr)
    }

    /// Reserve a record for a device that is bootstrapping.
    ///
    /// # Note
    /// A device that is already known keeps its record and short address. Otherwise the first
    /// free slot is taken and, without a requested address, the short address is the slot index
    /// plus one.
    ///
    /// # Args
    /// * `ext_addr` - The EUI-64 of the device.
    /// * `short_addr` - The short address to assign, if it is fixed by configuration.
    ///
    /// # Returns
    /// The slot of the record.
    pub fn reserve(
        &mut self,
        ext_addr: ExtendedAddress,
        short_addr: Option<u16>,
    ) -> Result<usize, Error> {
        if let Some(index) = self.find(&ext_addr, IN_USE) {
            if let Some(short_addr) = short_addr {
                self.devices[index].short_addr = short_addr;
            }
            return Ok(index);
        }

        let index = self
            .devices
            .iter()
            .position(|device| device.state == DeviceState::Disconnected)
            .ok_or(Error::TableFull)?;

        self.devices[index] = DeviceRecord {
            state: DeviceState::Bootstrapping,
            short_addr: short_addr.unwrap_or(index as u16 + 1),
            ext_addr,
            ..DeviceRecord::empty()
        };

        Ok(index)
    }

    /// Release a reservation that did not complete. Connected devices are kept.
    pub fn release(&mut self, index: usize) {
        if self.devices.get(index).map(|device| device.state) == Some(DeviceState::Bootstrapping) {
            self.remove(index);
        }
    }

    /// Mark a device connected.
    pub fn connect(&mut self, index: usize, lives: u8, now: Instant) -> Option<&DeviceRecord> {
        let device = self.devices.get_mut(index)?;
        device.state = DeviceState::Connected;
        device.lives = lives;
        device.last_keep_alive = now;
        Some(device)
    }

    pub fn remove(&mut self, index: usize) {
        if let Some(device) = self.devices.get_mut(index) {
            *device = DeviceRecord::empty();
        }
    }

    pub fn get(&self, index: usize) -> Option<&DeviceRecord> {
        self.devices
            .get(index)
            .filter(|device| device.state != DeviceState::Disconnected)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceRecord> {
        self.devices
            .get_mut(index)
            .filter(|device| device.state != DeviceState::Disconnected)
    }

    /// The first slot at or after `from` holding a device accepted by `filter`.
    pub fn next(&self, from: usize, filter: impl Fn(&DeviceRecord) -> bool) -> Option<usize> {
        (from..N).find(|&index| filter(&self.devices[index]))
    }

    pub fn count(&self, mask: u8) -> usize {
        self.devices
            .iter()
            .filter(|device| device.state.matches(mask))
            .count()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices
            .iter_mut()
            .filter(|device| device.state != DeviceState::Disconnected)
    }

    pub fn clear(&mut self) {
        self.devices = [DeviceRecord::empty(); N];
    }
}
