//! LoWPAN bootstrap server
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! The server runs on the PAN coordinator. It starts the network and then authenticates every
//! joining device with EAP-PSK, delivering its short address and the GMKs in the third message.
//! Each device progresses independently through its own joining entry. Any failure to
//! authenticate declines the device and frees its entry.
mod rekeying;

pub use rekeying::RekeyingStep;

use self::rekeying::Rekeying;
use super::conf_param::{self, EXT_TYPE_CONFIG, MAX_PARAMS_LEN};
use super::devices::{DeviceRecord, DeviceState, DeviceTable, IN_USE};
use super::join_table::{JoinEntry, JoinState, JoinTable, MAX_JOINING_NODES};
use super::lbp::{self, Header, MessageType, Payload};
use super::{Context, TimerId};
use crate::adp::{
    AdpIndication, AdpRequest, Address, Attribute, ExtendedAddress, LbpIndication, LbpRequest,
    MediaType, Nsdu, PanDescriptor, Status, BROADCAST_SHORT_ADDR,
};
use crate::hif::{HostMessage, RekeyingError};
use crate::interface::G3Interface;
use crate::settings::{G3Settings, Identity, ServerSettings};
use crate::timer::millis;
use crate::Error;
use eap_psk::{Code, Key, PChannelResult, PskContext, Subtype};
use heapless::Vec;
use log::{debug, error, info, warn};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// The number of PSKs the host can provision.
pub const MAX_PSK_ENTRIES: usize = MAX_JOINING_NODES;

const CONNECTED: u8 = DeviceState::Connected as u8;
const BOOTSTRAPPING: u8 = DeviceState::Bootstrapping as u8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServerState {
    Inactive,
    WaitDiscoverCnf,
    WaitNetworkStartCnf,
    Active,
}

/// A PSK provisioned by the host.
#[derive(Clone, Zeroize)]
struct PskEntry {
    ext_addr: ExtendedAddress,
    psk: Key,
    short_addr: u16,
}

pub struct BootServer {
    settings: ServerSettings,
    media_type: MediaType,
    lives: u8,
    state: ServerState,
    joining: JoinTable,
    devices: DeviceTable,
    psk_table: Vec<PskEntry, MAX_PSK_ENTRIES>,
    gmk: [Option<Key>; 2],
    active_index: u8,
    handle: u8,
    identifier: u8,
    rekeying: Rekeying,
}

impl BootServer {
    pub fn new(settings: &G3Settings) -> Self {
        Self {
            settings: settings.server.clone(),
            media_type: settings.media_type,
            lives: settings.keep_alive.lives,
            state: ServerState::Inactive,
            joining: JoinTable::new(),
            devices: DeviceTable::new(),
            psk_table: Vec::new(),
            gmk: [None, None],
            active_index: 0,
            handle: 0,
            identifier: 0,
            rekeying: Rekeying::default(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn joining(&self) -> &JoinTable {
        &self.joining
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceTable {
        &mut self.devices
    }

    /// The GMK slots and the active index.
    pub fn gmk(&self) -> (&[Option<Key>; 2], u8) {
        (&self.gmk, self.active_index)
    }

    /// Handle BOOT-SERVER-START.request.
    pub fn start<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        if self.state != ServerState::Inactive {
            ctx.notify(HostMessage::ServerStartConfirm {
                status: Status::InvalidRequest,
            });
            return;
        }

        let request = AdpRequest::Discovery {
            duration_s: self.settings.discovery_duration_s,
        };
        if ctx.request(request).is_err() {
            ctx.notify(HostMessage::ServerStartConfirm {
                status: Status::Failed,
            });
            return;
        }

        info!("Scanning for PANs before starting {:#06x}", self.settings.pan_id);
        self.state = ServerState::WaitDiscoverCnf;
    }

    /// Handle BOOT-SERVER-STOP.request.
    pub fn stop<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        if self.state != ServerState::Inactive {
            info!("Stopping bootstrap server");
            ctx.request(AdpRequest::Reset).ok();
        }

        self.reset(ctx);
        ctx.notify(HostMessage::ServerStopConfirm {
            status: Status::Success,
        });
    }

    fn reset<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        ctx.timers.stop_matching(|id| {
            matches!(
                id,
                TimerId::ServerSweep
                    | TimerId::PskGet(_)
                    | TimerId::Rekeying
                    | TimerId::RekeyingMsg
                    | TimerId::Kick
            )
        });

        self.state = ServerState::Inactive;
        self.joining.clear();
        self.devices.clear();
        self.gmk.zeroize();
        self.active_index = 0;
        self.rekeying = Rekeying::default();
    }

    /// Handle BOOT-SERVER-SETPSK.request and resume a handshake waiting for it.
    pub fn set_psk<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        ext_addr: ExtendedAddress,
        psk: Key,
        short_addr: u16,
    ) {
        let entry = PskEntry {
            ext_addr,
            psk,
            short_addr,
        };

        let status = match self
            .psk_table
            .iter_mut()
            .find(|entry| entry.ext_addr == ext_addr)
        {
            Some(existing) => {
                *existing = entry;
                Status::Success
            }
            None => match self.psk_table.push(entry) {
                Ok(()) => Status::Success,
                Err(mut entry) => {
                    entry.zeroize();
                    warn!("PSK table full");
                    Status::Failed
                }
            },
        };

        ctx.notify(HostMessage::ServerSetPskConfirm { status });

        if let Some(index) = self.joining.find(&ext_addr) {
            if self.joining.get(index).map(|entry| entry.state) == Some(JoinState::WaitPsk) {
                ctx.stop_timer(TimerId::PskGet(index));
                self.authenticate(ctx, index, &psk);
            }
        }
    }

    /// Process an indication or confirm of the modem.
    pub fn handle_adp<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        indication: AdpIndication,
    ) {
        match indication {
            AdpIndication::Lbp(indication) => self.handle_lbp(ctx, indication),
            AdpIndication::LbpConfirm { handle, status } => {
                self.handle_lbp_confirm(ctx, handle, status)
            }
            AdpIndication::DiscoveryConfirm { descriptors, .. } => {
                self.handle_discovery_confirm(ctx, &descriptors)
            }
            AdpIndication::NetworkStartConfirm { status } => {
                self.handle_network_start_confirm(ctx, status)
            }
            AdpIndication::SetConfirm { attribute, status } => {
                self.handle_set_confirm(ctx, attribute, status)
            }
            other => debug!("Ignoring {:?}", other),
        }
    }

    /// Process an expired timer.
    pub fn handle_timer<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        id: TimerId,
    ) {
        if self.state != ServerState::Active {
            return;
        }

        match id {
            TimerId::ServerSweep => self.sweep(ctx),
            TimerId::PskGet(index) => {
                if self.joining.get(index).map(|entry| entry.state) == Some(JoinState::WaitPsk) {
                    warn!("PSK request timed out");
                    self.decline(ctx, index);
                }
            }
            TimerId::Rekeying => self.rekeying_phase(ctx),
            TimerId::RekeyingMsg => self.rekeying_timeout(ctx),
            TimerId::Kick => self.kick_done(ctx, Status::Timeout),
            _ => {}
        }
    }

    /// Remove a device from the PAN, dropping any bootstrap in progress.
    ///
    /// # Returns
    /// The record of the removed device.
    pub fn remove_device<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        ext_addr: &ExtendedAddress,
    ) -> Option<DeviceRecord> {
        if let Some(index) = self.joining.find(ext_addr) {
            self.drop_entry(ctx, index);
        }

        let index = self.devices.find(ext_addr, IN_USE)?;
        let device = self.devices.get(index).copied();
        self.devices.remove(index);
        device
    }

    fn handle_discovery_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        descriptors: &[PanDescriptor],
    ) {
        if self.state != ServerState::WaitDiscoverCnf {
            return;
        }

        let pan_id = self.settings.pan_id;
        let status = if descriptors.iter().any(|pan| pan.pan_id == pan_id) {
            error!("PAN {:#06x} is already in use", pan_id);
            Status::InvalidParameter
        } else if ctx.request(AdpRequest::NetworkStart { pan_id }).is_err() {
            Status::Failed
        } else {
            self.state = ServerState::WaitNetworkStartCnf;
            return;
        };

        self.state = ServerState::Inactive;
        ctx.notify(HostMessage::ServerStartConfirm { status });
    }

    fn handle_network_start_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        status: Status,
    ) {
        if self.state != ServerState::WaitNetworkStartCnf {
            return;
        }

        if !status.is_success() {
            warn!("Network start failed: {:?}", status);
            self.state = ServerState::Inactive;
            ctx.notify(HostMessage::ServerStartConfirm { status });
            return;
        }

        self.gmk = [Some(self.settings.gmk), None];
        self.active_index = 0;

        let result = ctx
            .request(AdpRequest::Set(Attribute::Gmk {
                index: 0,
                key: self.settings.gmk,
            }))
            .and_then(|_| {
                ctx.request(AdpRequest::Set(Attribute::ActiveKeyIndex(0)))
            });
        if result.is_err() {
            self.reset(ctx);
            ctx.notify(HostMessage::ServerStartConfirm {
                status: Status::Failed,
            });
            return;
        }

        info!("Network {:#06x} started", self.settings.pan_id);
        self.state = ServerState::Active;
        ctx.start_timer(TimerId::ServerSweep, millis(self.settings.sweep_period_ms));
        ctx.notify(HostMessage::ServerStartConfirm {
            status: Status::Success,
        });
    }

    fn handle_lbp<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        mut indication: LbpIndication,
    ) {
        if self.state != ServerState::Active {
            return;
        }

        let (header, data) = match lbp::decode(&indication.nsdu) {
            Ok(decoded) => decoded,
            Err(_) => {
                warn!("Dropping malformed LBP frame");
                return;
            }
        };

        match (header.kind, Payload::classify(data)) {
            (MessageType::Joining, Payload::Empty) => {
                self.handle_joining(ctx, &header, indication.src_addr)
            }
            (MessageType::Joining, Payload::Eap) => {
                self.handle_eap(ctx, &header, &mut indication.nsdu[lbp::HEADER_LEN..])
            }
            (MessageType::Joining, Payload::Parameters) => {
                self.handle_param_result(ctx, &header, data)
            }
            (MessageType::KickFromLbd, _) => {
                if let Some(device) = self.remove_device(ctx, &header.ext_addr) {
                    info!("Device {:02x?} left", device.ext_addr);
                    ctx.notify(HostMessage::ServerLeaveIndication {
                        ext_addr: device.ext_addr,
                        short_addr: device.short_addr,
                    });
                }
            }
            (kind, _) => debug!("Ignoring {:?} sent to the server", kind),
        }
    }

    /// Start the bootstrap of a device.
    fn handle_joining<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        header: &Header,
        src_addr: Address,
    ) {
        let lba_addr = match src_addr {
            Address::Short(addr) => addr,
            Address::Extended(_) => {
                warn!("Joining relayed without short address");
                return;
            }
        };

        if header.ext_addr == [0; 8] {
            warn!("Dropping Joining without device address");
            return;
        }

        let index = match self.joining.find(&header.ext_addr) {
            Some(index) => {
                let Some(entry) = self.joining.get_mut(index) else {
                    return;
                };

                let age = ctx.now.checked_duration_since(entry.join_time);
                if age.map_or(true, |age| age < millis(self.settings.ignore_time_ms)) {
                    debug!("Ignoring repeated Joining of {:02x?}", header.ext_addr);
                    return;
                }

                if entry.rekeying {
                    debug!("Joining of {:02x?} during re-keying", header.ext_addr);
                    return;
                }

                ctx.stop_timer(TimerId::PskGet(index));
                entry.restart(ctx.now);
                index
            }
            None => match self.joining.add(header.ext_addr, ctx.now) {
                Some(index) => index,
                None => {
                    warn!("Joining table full, dropping {:02x?}", header.ext_addr);
                    return;
                }
            },
        };

        if let Some(entry) = self.joining.get_mut(index) {
            entry.lba_addr = lba_addr;
            entry.media_type = header.media_type;
            entry.disable_backup = header.disable_backup;
        }

        debug!("Joining of {:02x?} via {:#06x}", header.ext_addr, lba_addr);
        if let Err(error) = self.send_first_message(ctx, index) {
            warn!("Failed to challenge {:02x?}: {:?}", header.ext_addr, error);
            self.drop_entry(ctx, index);
        }
    }

    fn handle_eap<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        header: &Header,
        msg: &mut [u8],
    ) {
        let Some(index) = self.joining.find(&header.ext_addr) else {
            debug!("EAP response from unknown device {:02x?}", header.ext_addr);
            return;
        };
        let Some(entry) = self.joining.get(index) else {
            return;
        };

        let (eap, subtype) = match eap_psk::classify(msg) {
            Ok(classified) => classified,
            Err(error) => {
                warn!("Malformed EAP from {:02x?}: {:?}", header.ext_addr, error);
                self.decline(ctx, index);
                return;
            }
        };

        if eap.code != Code::Response || eap.identifier != entry.identifier {
            debug!("Ignoring stale EAP {:?} {}", eap.code, eap.identifier);
            return;
        }

        match (entry.state, subtype) {
            (JoinState::WaitSecond, Some(Subtype::Second)) => self.handle_second(ctx, index, msg),
            (JoinState::WaitFourth, Some(Subtype::Fourth)) => self.handle_fourth(ctx, index, msg),
            (state, subtype) => debug!("Ignoring {:?} in {:?}", subtype, state),
        }
    }

    fn handle_second<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
        msg: &[u8],
    ) {
        let Some(entry) = self.joining.get_mut(index) else {
            return;
        };

        let parsed = eap_psk::decode_message2_step1(msg, &entry.rand_s)
            .map_err(Error::from)
            .and_then(|message| {
                entry.id_p = Identity::from_slice(message.id_p).map_err(|_| Error::Bounds)?;
                entry.rand_p = message.rand_p;
                entry.mac_p = message.mac_p;
                Ok(())
            });

        if let Err(error) = parsed {
            warn!("Invalid second message from {:02x?}: {:?}", entry.ext_addr, error);
            self.decline(ctx, index);
            return;
        }

        let ext_addr = entry.ext_addr;
        if let Some(psk) = self.lookup_psk(&ext_addr) {
            self.authenticate(ctx, index, &psk);
            return;
        }

        if !self.settings.psk_from_host {
            warn!("No PSK for {:02x?}", ext_addr);
            self.decline(ctx, index);
            return;
        }

        let Some(entry) = self.joining.get_mut(index) else {
            return;
        };
        entry.state = JoinState::WaitPsk;
        entry.psk_request_time = ctx.now;
        let idp = entry.id_p.clone();

        ctx.notify(HostMessage::ServerGetPskIndication { ext_addr, idp });
        ctx.start_timer(
            TimerId::PskGet(index),
            millis(self.settings.psk_get_timeout_ms),
        );
    }

    fn lookup_psk(&self, ext_addr: &ExtendedAddress) -> Option<Key> {
        self.psk_table
            .iter()
            .find(|entry| entry.ext_addr == *ext_addr)
            .map(|entry| entry.psk)
            .or(self.settings.default_psk)
    }

    /// Verify MAC_P with the PSK of the device and answer with message 3.
    fn authenticate<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
        psk: &Key,
    ) {
        let ids = &self.settings.ids;
        let Some(entry) = self.joining.get_mut(index) else {
            return;
        };

        let mut context = PskContext::new(psk);
        let message = eap_psk::Message2 {
            identifier: entry.identifier,
            rand_s: entry.rand_s,
            rand_p: entry.rand_p,
            mac_p: entry.mac_p,
            id_p: &entry.id_p,
        };

        if let Err(error) = eap_psk::decode_message2_step2(&mut context, &message, ids) {
            warn!("Authentication of {:02x?} failed: {:?}", entry.ext_addr, error);
            self.decline(ctx, index);
            return;
        }

        entry.psk = context;
        let ext_addr = entry.ext_addr;
        let rekeying = entry.rekeying;
        let (media_type, disable_backup) = (entry.media_type, entry.disable_backup);

        let short_addr = if rekeying {
            BROADCAST_SHORT_ADDR
        } else {
            let requested = self
                .psk_table
                .iter()
                .find(|entry| entry.ext_addr == ext_addr)
                .map(|entry| entry.short_addr)
                .filter(|addr| *addr != BROADCAST_SHORT_ADDR);

            let Ok(slot) = self.devices.reserve(ext_addr, requested) else {
                warn!("Device table full, declining {:02x?}", ext_addr);
                self.decline(ctx, index);
                return;
            };

            match self.devices.get_mut(slot) {
                Some(device) => {
                    device.media_type = media_type;
                    device.disable_backup = disable_backup;
                    device.short_addr
                }
                None => return,
            }
        };

        if let Err(error) = self.send_third_message(ctx, index, short_addr) {
            warn!("Failed to send third message: {:?}", error);
            self.decline(ctx, index);
        }
    }

    fn handle_fourth<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
        msg: &mut [u8],
    ) {
        let Some(entry) = self.joining.get_mut(index) else {
            return;
        };

        let verified = eap_psk::decode_message4(msg, &entry.psk, &entry.rand_s, entry.nonce)
            .map_err(Error::from)
            .and_then(|message| {
                if message.pchannel.result != PChannelResult::DoneSuccess {
                    return Err(Error::Authentication);
                }

                let extension = message
                    .pchannel
                    .extension
                    .filter(|extension| extension.ext_type == EXT_TYPE_CONFIG)
                    .ok_or(Error::Invalid)?;
                conf_param::decode_4_params(extension.payload).map_err(|_| Error::Invalid)
            });

        if let Err(error) = verified {
            warn!("Invalid fourth message from {:02x?}: {:?}", entry.ext_addr, error);
            self.decline(ctx, index);
            return;
        }

        // A replay of this message no longer matches.
        entry.nonce = entry.nonce.wrapping_add(2);
        entry.state = JoinState::WaitCnf;

        let identifier = entry.identifier;
        let header = Self::header(entry, MessageType::Accepted);
        let sent = lbp::encode(&header, |buf| {
            Ok(eap_psk::encode_result(buf, Code::Success, identifier)?)
        })
        .and_then(|nsdu| self.transmit(ctx, index, nsdu));

        if let Err(error) = sent {
            warn!("Failed to accept: {:?}", error);
            self.drop_entry(ctx, index);
        }
    }

    fn handle_lbp_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        handle: u8,
        status: Status,
    ) {
        if self.rekeying.is_kick_handle(handle) {
            self.kick_done(ctx, status);
            return;
        }

        let Some(index) = self.joining.find_handle(handle) else {
            return;
        };
        let Some(entry) = self.joining.get(index) else {
            return;
        };

        if !status.is_success() {
            warn!("LBP request to {:02x?} failed: {:?}", entry.ext_addr, status);
            self.drop_entry(ctx, index);
        } else if entry.state == JoinState::WaitCnf {
            self.complete(ctx, index);
        }
    }

    /// The Accepted of a successful handshake was delivered.
    fn complete<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
    ) {
        let Some(entry) = self.joining.get(index) else {
            return;
        };
        let ext_addr = entry.ext_addr;
        let rekeying = entry.rekeying;
        let new_gmk = entry.new_gmk;
        self.joining.remove(index);

        if rekeying {
            if let Some(device) = self
                .devices
                .find(&ext_addr, CONNECTED)
                .and_then(|slot| self.devices.get_mut(slot))
            {
                device.rekeyed = true;
            }
            self.rekeying_device_done(ctx, Ok(()));
            return;
        }

        let Some(slot) = self.devices.find(&ext_addr, IN_USE) else {
            warn!("Joined device {:02x?} has no record", ext_addr);
            return;
        };

        let Some(device) = self.devices.connect(slot, self.lives, ctx.now).copied() else {
            return;
        };

        info!("Device {:02x?} joined as {:#06x}", ext_addr, device.short_addr);
        ctx.notify(HostMessage::ServerJoinIndication {
            ext_addr,
            short_addr: device.short_addr,
        });

        if new_gmk {
            self.joined_during_rekeying(ctx, slot);
        }
    }

    /// Send an EAP-Failure in a Decline and free the entry.
    fn decline<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
    ) {
        let Some(entry) = self.joining.get(index) else {
            return;
        };

        warn!("Declining {:02x?} in {:?}", entry.ext_addr, entry.state);
        let identifier = entry.identifier;
        let header = Self::header(entry, MessageType::Decline);
        let sent = lbp::encode(&header, |buf| {
            Ok(eap_psk::encode_result(buf, Code::Failure, identifier)?)
        })
        .and_then(|nsdu| self.transmit(ctx, index, nsdu));

        if let Err(error) = sent {
            warn!("Failed to send Decline: {:?}", error);
        }

        self.drop_entry(ctx, index);
    }

    /// Free a joining entry along with any unfinished device reservation.
    fn drop_entry<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
    ) {
        let Some(entry) = self.joining.get(index) else {
            return;
        };
        let ext_addr = entry.ext_addr;
        let rekeying = entry.rekeying;
        let error = rekeying_error(entry.state);

        ctx.stop_timer(TimerId::PskGet(index));
        self.joining.remove(index);

        if rekeying {
            self.rekeying_device_done(ctx, Err(error));
        } else if let Some(slot) = self.devices.find(&ext_addr, BOOTSTRAPPING) {
            self.devices.release(slot);
        }
    }

    fn sweep<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        let expired = self
            .joining
            .reset_expired_entries(ctx.now, millis(self.settings.ttl_ms));

        if expired > 0 {
            info!("Evicted {} stale joining entries", expired);

            // Reservations of evicted entries are released.
            for slot in 0..MAX_JOINING_NODES {
                let orphaned = self.devices.get(slot).map_or(false, |device| {
                    device.state == DeviceState::Bootstrapping
                        && self.joining.find(&device.ext_addr).is_none()
                });
                if orphaned {
                    self.devices.release(slot);
                }
            }
        }

        ctx.start_timer(TimerId::ServerSweep, millis(self.settings.sweep_period_ms));
    }

    fn send_first_message<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
    ) -> Result<(), Error> {
        self.identifier = self.identifier.wrapping_add(1);
        let identifier = self.identifier;
        let ids = &self.settings.ids;
        let entry = self.joining.get_mut(index).ok_or(Error::NotPresent)?;

        let mut rand_s = [0u8; 16];
        let nsdu = lbp::encode(&Self::header(entry, MessageType::Challenge), |buf| {
            let (len, rand) = eap_psk::encode_message1(buf, identifier, ids, &mut *ctx.rng)?;
            rand_s = rand;
            Ok(len)
        })?;

        entry.rand_s = rand_s;
        entry.identifier = identifier;
        entry.state = JoinState::WaitSecond;
        self.transmit(ctx, index, nsdu)
    }

    fn send_third_message<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
        short_addr: u16,
    ) -> Result<(), Error> {
        let (gmk, active_index) = self.distributed_keys(index);

        self.identifier = self.identifier.wrapping_add(1);
        let identifier = self.identifier;
        let ids = &self.settings.ids;
        let entry = self.joining.get_mut(index).ok_or(Error::NotPresent)?;

        let mut params = [0u8; MAX_PARAMS_LEN];
        let len = conf_param::encode_3_params(&mut params, short_addr, &gmk, active_index)?;
        let extension = eap_psk::Extension {
            ext_type: EXT_TYPE_CONFIG,
            payload: &params[..len],
        };

        let nsdu = lbp::encode(&Self::header(entry, MessageType::Challenge), |buf| {
            Ok(eap_psk::encode_message3(
                buf,
                identifier,
                &entry.psk,
                &entry.rand_s,
                &entry.rand_p,
                ids,
                0,
                PChannelResult::DoneSuccess,
                Some(&extension),
            )?)
        });
        params.zeroize();
        let nsdu = nsdu?;

        entry.short_addr = short_addr;
        entry.new_gmk = !entry.rekeying && self.rekeying.distributes_new_gmk();
        entry.identifier = identifier;
        entry.nonce = 1;
        entry.state = JoinState::WaitFourth;
        self.transmit(ctx, index, nsdu)
    }

    /// The GMKs delivered in message 3 and the index to activate.
    fn distributed_keys(&self, index: usize) -> ([Option<Key>; 2], u8) {
        let rekeying = self.joining.get(index).map_or(false, |entry| entry.rekeying);
        if rekeying {
            self.rekeying.delivered_keys()
        } else {
            (self.gmk, self.active_index)
        }
    }

    fn header(entry: &JoinEntry, kind: MessageType) -> Header {
        Header {
            kind,
            media_type: entry.media_type,
            disable_backup: entry.disable_backup,
            ext_addr: entry.ext_addr,
        }
    }

    /// Send an LBP message to the device of a joining entry.
    fn transmit<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        index: usize,
        nsdu: Nsdu,
    ) -> Result<(), Error> {
        let handle = self.next_handle();
        let max_hops = self.settings.max_hops;
        let entry = self.joining.get_mut(index).ok_or(Error::NotPresent)?;

        ctx.request(AdpRequest::Lbp(LbpRequest {
            dst: Address::Short(entry.lba_addr),
            nsdu,
            handle,
            max_hops,
            discover_route: true,
            qos: 0,
            // Joined devices share the GMK, devices being bootstrapped do not.
            security_enabled: entry.rekeying,
            media_type: entry.media_type,
            disable_backup: entry.disable_backup,
        }))?;

        entry.handle = Some(handle);
        Ok(())
    }

    fn next_handle(&mut self) -> u8 {
        self.handle = self.handle.wrapping_add(1);
        self.handle
    }
}

/// The re-keying failure matching the step a device stopped at.
fn rekeying_error(state: JoinState) -> RekeyingError {
    match state {
        JoinState::WaitSecond | JoinState::WaitPsk => RekeyingError::Msg2,
        JoinState::WaitFourth => RekeyingError::Msg4,
        JoinState::WaitParam => RekeyingError::Param,
        JoinState::WaitJoin | JoinState::WaitCnf => RekeyingError::Procedure,
    }
}
