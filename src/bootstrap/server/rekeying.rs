//! GMK rotation and device removal
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! Re-keying walks the connected devices one at a time. Each device first receives the new GMK
//! at the inactive index through a fresh EAP-PSK handshake, then a cleartext activation of that
//! index. Devices that missed the key are dropped before the coordinator switches its own active
//! index and removes the old key. Only then are the devices told to remove the old key as well.
//! Phases are paced by a fixed delay so that the PAN is never flooded.
//!
//! Devices joining while the new key is out receive both keys and count as re-keyed. An abort
//! sends every device that may hold the new key back to the old one.
use super::{rekeying_error, BootServer, ServerState, CONNECTED};
use crate::adp::{
    AdpRequest, Address, Attribute, AttributeId, ExtendedAddress, LbpRequest, Nsdu, Status,
};
use crate::bootstrap::conf_param::{self, NO_ACTIVE_INDEX};
use crate::bootstrap::devices::{DeviceRecord, DeviceState};
use crate::bootstrap::join_table::{JoinState, MAX_JOINING_NODES};
use crate::bootstrap::lbp::{self, Header, MessageType};
use crate::bootstrap::{Context, TimerId};
use crate::hif::{HostMessage, RekeyingError};
use crate::interface::G3Interface;
use crate::timer::millis;
use crate::Error;
use eap_psk::Key;
use heapless::Vec;
use log::{debug, info, warn};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RekeyingStep {
    #[default]
    Idle,
    /// A Kick is waiting for its LBP confirm.
    Kicking,
    /// The new GMK is being written to the coordinator.
    SetGmk,
    SendGmk,
    ActivateGmk,
    DeactivateGmk,
    SetGmkIndex,
    SetGmkIndexWaitCnf,
}

#[derive(Default)]
pub(super) struct Rekeying {
    step: RekeyingStep,
    new_index: u8,
    new_gmk: Key,
    /// The key the coordinator held at `new_index` before the rotation.
    previous: Option<Key>,
    /// The next device slot to visit.
    cursor: usize,
    /// The device being served.
    current: Option<ExtendedAddress>,
    /// The first failure of the rotation.
    error: Option<RekeyingError>,
    kick: Option<(ExtendedAddress, u8)>,
}

impl Rekeying {
    pub(super) fn is_kick_handle(&self, handle: u8) -> bool {
        self.step == RekeyingStep::Kicking && matches!(self.kick, Some((_, kick)) if kick == handle)
    }

    /// The GMKs delivered to a device being re-keyed: the new key only, without activation.
    pub(super) fn delivered_keys(&self) -> ([Option<Key>; 2], u8) {
        let mut gmk = [None, None];
        gmk[self.new_index as usize & 1] = Some(self.new_gmk);
        (gmk, NO_ACTIVE_INDEX)
    }

    /// Regular joins hand out the new GMK alongside the active one.
    pub(super) fn distributes_new_gmk(&self) -> bool {
        matches!(
            self.step,
            RekeyingStep::SendGmk
                | RekeyingStep::ActivateGmk
                | RekeyingStep::DeactivateGmk
                | RekeyingStep::SetGmkIndex
                | RekeyingStep::SetGmkIndexWaitCnf
        )
    }

    fn record(&mut self, error: RekeyingError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

impl BootServer {
    pub fn rekeying_step(&self) -> RekeyingStep {
        self.rekeying.step
    }

    /// Handle BOOT-SERVER-REKEYING.request.
    ///
    /// # Args
    /// * `gmk` - The key to distribute and activate.
    pub fn start_rekeying<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        gmk: Key,
    ) {
        let refused = if self.state != ServerState::Active {
            Some((Status::InvalidRequest, RekeyingError::Procedure))
        } else if self.rekeying.step != RekeyingStep::Idle {
            Some((Status::Busy, RekeyingError::Procedure))
        } else if self.devices.count(CONNECTED) == 0 {
            Some((Status::Failed, RekeyingError::NoDevice))
        } else {
            None
        };

        if let Some((status, error)) = refused {
            warn!("Re-keying refused: {:?}", error);
            ctx.notify(HostMessage::ServerRekeyingConfirm { status, error });
            return;
        }

        let new_index = 1 - (self.active_index & 1);
        self.rekeying = Rekeying {
            step: RekeyingStep::SetGmk,
            new_index,
            new_gmk: gmk,
            previous: self.gmk[new_index as usize],
            ..Default::default()
        };

        info!(
            "Re-keying {} devices to GMK index {}",
            self.devices.count(CONNECTED),
            new_index
        );

        let request = AdpRequest::Set(Attribute::Gmk {
            index: new_index,
            key: gmk,
        });
        if ctx.request(request).is_err() {
            self.finish_rekeying(ctx, Some(RekeyingError::SetAttribute));
        }
    }

    /// Handle BOOT-SERVER-ABORT-RK.request.
    ///
    /// # Note
    /// The coordinator gets its previous key back at the re-keyed index. Devices that may hold the
    /// new key are told to activate the old one and remove the new one. Devices not reached yet
    /// are left untouched.
    pub fn abort_rekeying<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        let step = self.rekeying.step;
        if matches!(step, RekeyingStep::Idle | RekeyingStep::Kicking) {
            ctx.notify(HostMessage::ServerAbortRekeyingConfirm {
                status: Status::InvalidRequest,
            });
            return;
        }

        info!("Aborting re-keying in {:?}", step);

        if step == RekeyingStep::SetGmkIndexWaitCnf {
            let restore = AdpRequest::Set(Attribute::ActiveKeyIndex(self.active_index));
            if ctx.request(restore).is_err() {
                warn!("Failed to restore the active GMK index");
            }
        }

        let index = self.rekeying.new_index;
        let previous = self.rekeying.previous;
        self.gmk[index as usize] = previous;
        let rollback = match previous {
            Some(key) => Attribute::Gmk { index, key },
            None => Attribute::GmkRemoval { index },
        };
        if ctx.request(AdpRequest::Set(rollback)).is_err() {
            warn!("Failed to roll back GMK {}", index);
        }

        let current = self.rekeying.current;
        self.send_parameters_to(
            ctx,
            |device| device.rekeyed || Some(device.ext_addr) == current,
            Some(self.active_index),
            Some(index),
        );

        ctx.notify(HostMessage::ServerAbortRekeyingConfirm {
            status: Status::Success,
        });
        self.finish_rekeying(ctx, Some(RekeyingError::Abort));
    }

    /// Handle BOOT-SERVER-KICK.request.
    pub fn kick<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        ext_addr: ExtendedAddress,
    ) {
        let status = if self.state != ServerState::Active {
            Status::InvalidRequest
        } else if self.rekeying.step != RekeyingStep::Idle {
            Status::Busy
        } else {
            let device = self
                .devices
                .find(&ext_addr, CONNECTED)
                .and_then(|slot| self.devices.get(slot).copied());

            match device {
                None => Status::InvalidParameter,
                Some(device) => match self.send_kick(ctx, &device) {
                    Ok(()) => return,
                    Err(error) => {
                        warn!("Failed to kick {:02x?}: {:?}", ext_addr, error);
                        Status::Failed
                    }
                },
            }
        };

        ctx.notify(HostMessage::ServerKickConfirm { status });
    }

    fn send_kick<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        device: &DeviceRecord,
    ) -> Result<(), Error> {
        let nsdu = lbp::encode_empty(&Self::device_header(device, MessageType::KickToLbd))?;
        let handle = self.send_to_device(ctx, device, nsdu)?;

        info!("Kicking {:02x?}", device.ext_addr);
        self.rekeying.step = RekeyingStep::Kicking;
        self.rekeying.kick = Some((device.ext_addr, handle));
        ctx.start_timer(TimerId::Kick, millis(self.settings.rekeying_msg_timeout_ms));
        Ok(())
    }

    /// The Kick was confirmed or timed out. The device is removed either way.
    pub(super) fn kick_done<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        status: Status,
    ) {
        let Some((ext_addr, _)) = self.rekeying.kick.take() else {
            return;
        };

        ctx.stop_timer(TimerId::Kick);
        self.rekeying.step = RekeyingStep::Idle;
        if !status.is_success() {
            warn!("Kick of {:02x?} not confirmed: {:?}", ext_addr, status);
        }

        let device = self.remove_device(ctx, &ext_addr);
        ctx.notify(HostMessage::ServerKickConfirm { status });
        if let Some(device) = device {
            ctx.notify(HostMessage::ServerLeaveIndication {
                ext_addr,
                short_addr: device.short_addr,
            });
        }
    }

    pub(super) fn handle_set_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        attribute: AttributeId,
        status: Status,
    ) {
        match (self.rekeying.step, attribute) {
            (RekeyingStep::SetGmk, AttributeId::Gmk) => {
                if !status.is_success() {
                    self.finish_rekeying(ctx, Some(RekeyingError::SetAttribute));
                    return;
                }

                self.gmk[self.rekeying.new_index as usize] = Some(self.rekeying.new_gmk);
                self.rekeying.step = RekeyingStep::SendGmk;
                self.rekeying.cursor = 0;
                self.start_phase(ctx);
            }
            (RekeyingStep::SetGmkIndexWaitCnf, AttributeId::ActiveKeyIndex) => {
                if !status.is_success() {
                    self.finish_rekeying(ctx, Some(RekeyingError::SetAttribute));
                    return;
                }

                let old = self.active_index;
                let new = self.rekeying.new_index;
                self.active_index = new;
                self.gmk[old as usize].zeroize();

                let removal = AdpRequest::Set(Attribute::GmkRemoval { index: old });
                if ctx.request(removal).is_err() {
                    warn!("Failed to remove GMK {}", old);
                }

                self.send_parameters_to(ctx, |_| true, Some(new), Some(old));
                self.finish_rekeying(ctx, None);
            }
            (_, attribute) if !status.is_success() => {
                warn!("Setting {:?} failed: {:?}", attribute, status)
            }
            _ => {}
        }
    }

    /// Run the next re-keying phase once the pacing delay elapsed.
    pub(super) fn rekeying_phase<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        match self.rekeying.step {
            RekeyingStep::SendGmk => self.send_next_gmk(ctx),
            RekeyingStep::ActivateGmk => self.send_next_activation(ctx),
            RekeyingStep::DeactivateGmk => self.deactivate_gmk(ctx),
            RekeyingStep::SetGmkIndex => {
                let index = self.rekeying.new_index;
                if ctx
                    .request(AdpRequest::Set(Attribute::ActiveKeyIndex(index)))
                    .is_err()
                {
                    self.finish_rekeying(ctx, Some(RekeyingError::SetAttribute));
                    return;
                }
                self.rekeying.step = RekeyingStep::SetGmkIndexWaitCnf;
            }
            step => debug!("No re-keying phase in {:?}", step),
        }
    }

    /// The device being served did not finish its exchange in time.
    pub(super) fn rekeying_timeout<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        let Some(ext_addr) = self.rekeying.current else {
            return;
        };

        let error = match self.joining.find(&ext_addr) {
            Some(index) => {
                let error = self
                    .joining
                    .get(index)
                    .map_or(RekeyingError::Procedure, |entry| rekeying_error(entry.state));
                ctx.stop_timer(TimerId::PskGet(index));
                self.joining.remove(index);
                error
            }
            None => RekeyingError::Procedure,
        };

        warn!("Re-keying of {:02x?} timed out", ext_addr);
        self.rekeying_device_done(ctx, Err(error));
    }

    /// A device left the re-keying exchange, successfully or not.
    pub(super) fn rekeying_device_done<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        result: Result<(), RekeyingError>,
    ) {
        if !matches!(
            self.rekeying.step,
            RekeyingStep::SendGmk | RekeyingStep::ActivateGmk
        ) {
            return;
        }

        ctx.stop_timer(TimerId::RekeyingMsg);
        let ext_addr = self.rekeying.current.take();

        match result {
            Ok(()) => debug!("{:?} done for {:02x?}", self.rekeying.step, ext_addr),
            Err(error) => {
                warn!("Re-keying of {:02x?} failed: {:?}", ext_addr, error);
                self.rekeying.record(error);
            }
        }

        self.start_phase(ctx);
    }

    /// A joined device answered the GMK activation.
    pub(super) fn handle_param_result<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        header: &Header,
        data: &[u8],
    ) {
        let Some(index) = self.joining.find(&header.ext_addr) else {
            debug!("Parameters from unknown device {:02x?}", header.ext_addr);
            return;
        };

        let waiting = self
            .joining
            .get(index)
            .map_or(false, |entry| entry.rekeying && entry.state == JoinState::WaitParam);
        if !waiting {
            debug!("Unexpected parameters from {:02x?}", header.ext_addr);
            return;
        }

        let result = conf_param::decode_4_params(data).map_err(|_| RekeyingError::Param);
        self.joining.remove(index);
        self.rekeying_device_done(ctx, result);
    }

    fn start_phase<I: G3Interface, R: RngCore + CryptoRng>(&self, ctx: &mut Context<'_, I, R>) {
        ctx.start_timer(
            TimerId::Rekeying,
            millis(self.settings.rekeying_phase_delay_ms),
        );
    }

    fn send_next_gmk<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        // Devices that joined with the new key are skipped.
        let next = self.devices.next(self.rekeying.cursor, |device| {
            device.state == DeviceState::Connected && !device.rekeyed
        });

        let Some(slot) = next else {
            debug!("New GMK delivered");
            self.rekeying.step = RekeyingStep::ActivateGmk;
            self.rekeying.cursor = 0;
            self.start_phase(ctx);
            return;
        };

        self.rekeying.cursor = slot + 1;
        let Some(device) = self.devices.get(slot).copied() else {
            return;
        };

        match self.send_new_gmk(ctx, &device) {
            Ok(()) => {
                self.rekeying.current = Some(device.ext_addr);
                ctx.start_timer(
                    TimerId::RekeyingMsg,
                    millis(self.settings.rekeying_msg_timeout_ms),
                );
            }
            Err(error) => {
                warn!("Cannot re-key {:02x?}: {:?}", device.ext_addr, error);
                self.rekeying.record(error);
                self.start_phase(ctx);
            }
        }
    }

    /// Open a handshake delivering the new GMK to a joined device.
    fn send_new_gmk<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        device: &DeviceRecord,
    ) -> Result<(), RekeyingError> {
        let index = self.open_entry(ctx, device)?;

        if let Err(error) = self.send_first_message(ctx, index) {
            warn!("Failed to challenge {:02x?}: {:?}", device.ext_addr, error);
            self.joining.remove(index);
            return Err(RekeyingError::Procedure);
        }

        Ok(())
    }

    fn send_next_activation<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        let next = self.devices.next(self.rekeying.cursor, |device| {
            device.state == DeviceState::Connected && device.rekeyed
        });

        let Some(slot) = next else {
            debug!("New GMK activated on all devices");
            self.rekeying.step = RekeyingStep::DeactivateGmk;
            self.start_phase(ctx);
            return;
        };

        self.rekeying.cursor = slot + 1;
        let Some(device) = self.devices.get(slot).copied() else {
            return;
        };

        match self.send_activation(ctx, &device) {
            Ok(()) => {
                self.rekeying.current = Some(device.ext_addr);
                ctx.start_timer(
                    TimerId::RekeyingMsg,
                    millis(self.settings.rekeying_msg_timeout_ms),
                );
            }
            Err(error) => {
                warn!("Cannot activate GMK on {:02x?}: {:?}", device.ext_addr, error);
                self.rekeying.record(error);
                self.start_phase(ctx);
            }
        }
    }

    /// Send the cleartext GMK activation to a joined device.
    fn send_activation<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        device: &DeviceRecord,
    ) -> Result<(), RekeyingError> {
        let index = self.open_entry(ctx, device)?;
        let header = match self.joining.get_mut(index) {
            Some(entry) => {
                entry.state = JoinState::WaitParam;
                Self::header(entry, MessageType::Accepted)
            }
            None => return Err(RekeyingError::Procedure),
        };

        let active = self.rekeying.new_index;
        let sent = lbp::encode(&header, |buf| {
            conf_param::encode_activation(buf, Some(active), None)
        })
        .and_then(|nsdu| self.transmit(ctx, index, nsdu));

        if let Err(error) = sent {
            warn!("Failed to send activation: {:?}", error);
            self.joining.remove(index);
            return Err(RekeyingError::Procedure);
        }

        Ok(())
    }

    /// A device finished a regular join with the GMK of a rotation.
    pub(super) fn joined_during_rekeying<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        slot: usize,
    ) {
        if self.rekeying.distributes_new_gmk() {
            if let Some(device) = self.devices.get_mut(slot) {
                debug!("Device {:02x?} joined with the new GMK", device.ext_addr);
                device.rekeyed = true;
            }
            return;
        }

        // The rotation ended in the meantime.
        let Some(device) = self.devices.get(slot).copied() else {
            return;
        };
        let active = self.active_index;
        if let Err(error) = self.send_parameters(ctx, &device, Some(active), Some(1 - (active & 1)))
        {
            warn!("Failed to align the GMK of {:02x?}: {:?}", device.ext_addr, error);
        }
    }

    /// Send cleartext GMK parameters to the connected devices selected by `filter`.
    ///
    /// # Note
    /// The answers are not awaited.
    fn send_parameters_to<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        filter: impl Fn(&DeviceRecord) -> bool,
        active: Option<u8>,
        removed: Option<u8>,
    ) {
        let targets: Vec<DeviceRecord, MAX_JOINING_NODES> = (0..MAX_JOINING_NODES)
            .filter_map(|slot| self.devices.get(slot))
            .filter(|device| device.state == DeviceState::Connected && filter(*device))
            .copied()
            .collect();

        for device in targets {
            if let Err(error) = self.send_parameters(ctx, &device, active, removed) {
                warn!("Failed to update the GMK of {:02x?}: {:?}", device.ext_addr, error);
            }
        }
    }

    fn send_parameters<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        device: &DeviceRecord,
        active: Option<u8>,
        removed: Option<u8>,
    ) -> Result<(), Error> {
        let header = Self::device_header(device, MessageType::Accepted);
        let nsdu = lbp::encode(&header, |buf| {
            conf_param::encode_activation(buf, active, removed)
        })?;
        self.send_to_device(ctx, device, nsdu)?;

        debug!(
            "GMK {:?} active, {:?} removed on {:02x?}",
            active, removed, device.ext_addr
        );
        Ok(())
    }

    fn device_header(device: &DeviceRecord, kind: MessageType) -> Header {
        let mut header = Header::new(kind, device.ext_addr, device.media_type);
        header.disable_backup = device.disable_backup;
        header
    }

    /// Send a secured LBP frame to a joined device.
    ///
    /// # Returns
    /// The NSDU handle of the request.
    fn send_to_device<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        device: &DeviceRecord,
        nsdu: Nsdu,
    ) -> Result<u8, Error> {
        let handle = self.next_handle();
        ctx.request(AdpRequest::Lbp(LbpRequest {
            dst: Address::Short(device.short_addr),
            nsdu,
            handle,
            max_hops: self.settings.max_hops,
            discover_route: true,
            qos: 0,
            security_enabled: true,
            media_type: device.media_type,
            disable_backup: device.disable_backup,
        }))?;
        Ok(handle)
    }

    /// Allocate the joining entry of a device taking part in the re-keying.
    fn open_entry<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        device: &DeviceRecord,
    ) -> Result<usize, RekeyingError> {
        // The device is rejoining on its own.
        if self.joining.find(&device.ext_addr).is_some() {
            return Err(RekeyingError::Procedure);
        }

        let index = self
            .joining
            .add(device.ext_addr, ctx.now)
            .ok_or(RekeyingError::TableFull)?;
        let entry = self
            .joining
            .get_mut(index)
            .ok_or(RekeyingError::Procedure)?;

        entry.rekeying = true;
        entry.short_addr = device.short_addr;
        entry.lba_addr = device.short_addr;
        entry.media_type = device.media_type;
        entry.disable_backup = device.disable_backup;
        Ok(index)
    }

    /// Drop every device that can't follow the switch to the new GMK.
    fn deactivate_gmk<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        for slot in 0..MAX_JOINING_NODES {
            let stale = self
                .devices
                .get(slot)
                .filter(|device| device.state == DeviceState::Connected && !device.rekeyed)
                .copied();

            if let Some(device) = stale {
                warn!("Device {:02x?} missed the new GMK", device.ext_addr);
                self.devices.remove(slot);
                ctx.notify(HostMessage::ServerLeaveIndication {
                    ext_addr: device.ext_addr,
                    short_addr: device.short_addr,
                });
            }
        }

        self.rekeying.step = RekeyingStep::SetGmkIndex;
        self.start_phase(ctx);
    }

    fn finish_rekeying<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        error: Option<RekeyingError>,
    ) {
        ctx.stop_timer(TimerId::Rekeying);
        ctx.stop_timer(TimerId::RekeyingMsg);

        let stale: Vec<usize, MAX_JOINING_NODES> = self
            .joining
            .iter()
            .filter(|(_, entry)| entry.rekeying)
            .map(|(index, _)| index)
            .collect();
        for index in stale {
            ctx.stop_timer(TimerId::PskGet(index));
            self.joining.remove(index);
        }

        for device in self.devices.iter_mut() {
            device.rekeyed = false;
        }

        let error = error.or(self.rekeying.error);
        self.rekeying.new_gmk.zeroize();
        self.rekeying = Rekeying::default();

        let status = match error {
            None => {
                info!("Re-keying complete, GMK index {} active", self.active_index);
                Status::Success
            }
            Some(error) => {
                warn!("Re-keying finished with {:?}", error);
                Status::Failed
            }
        };

        ctx.notify(HostMessage::ServerRekeyingConfirm {
            status,
            error: error.unwrap_or(RekeyingError::None),
        });
    }
}
