//! LoWPAN bootstrap client
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! The client runs on a device. It discovers the PANs in range, picks a bootstrap agent and runs
//! the EAP-PSK handshake through it. The parameters delivered in message 3 are programmed into
//! the modem once the server accepted the device. Failed attempts are retried with a randomized
//! back-off, moving on to the next PAN once the retries are exhausted.
//!
//! Once connected, the client answers re-keying handshakes and GMK activations from the server.
use super::conf_param::{
    self, ParamResult, Received, Rejection, ATTR_GMK, ATTR_GMK_ACTIVATION, ATTR_SHORT_ADDR,
    EXT_TYPE_CONFIG,
};
use super::lbp::{self, Header, MessageType, Payload};
use super::{Context, TimerId};
use crate::adp::{
    AdpIndication, AdpRequest, Address, Attribute, ExtendedAddress, LbpIndication, LbpRequest,
    MediaType, Nsdu, PanDescriptor, Status, BROADCAST_SHORT_ADDR, COORDINATOR_SHORT_ADDR,
};
use crate::hif::{HostMessage, PanDescriptors};
use crate::interface::G3Interface;
use crate::settings::restore::RestoreImage;
use crate::settings::{ClientSettings, G3Settings, Identity, RestoreRecord};
use crate::timer::{millis, Duration};
use crate::Error;
use eap_psk::{Code, Extension, Key, PChannelResult, PskContext, Rand, Subtype};
use log::{debug, info, trace, warn};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// What the client does once its randomized wait is over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Next {
    Discover,
    Join,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Programming the parameters of a restore record.
    FastRestore,
    WaitTimer(Next),
    WaitDiscoverCnf,
    /// Waiting for the host to order the PAN descriptors.
    WaitPanSort,
    Bootstrapping,
    /// Programming the parameters received during the bootstrap.
    Configuring,
    Routing,
    Connected,
    Leaving,
}

/// Progress through an EAP-PSK handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handshake {
    Idle,
    WaitFirst,
    WaitThird,
    WaitAccept,
}

pub struct BootClient {
    settings: ClientSettings,
    ext_addr: ExtendedAddress,
    media_type: MediaType,
    idp: Identity,
    state: ClientState,
    handshake: Handshake,

    descriptors: PanDescriptors,
    candidate: usize,
    retries: u8,

    pan_id: u16,
    lba_addr: u16,
    short_addr: u16,
    gmk: [Option<Key>; 2],
    active_index: u8,

    psk: PskContext,
    rand_s: Rand,
    rand_p: Rand,
    id_s: Identity,
    identifier: u8,
    received: Received,

    pending_sets: u8,
    handle: u8,
    leave_handle: Option<u8>,
}

impl BootClient {
    pub fn new(settings: &G3Settings) -> Self {
        Self {
            settings: settings.client.clone(),
            ext_addr: settings.ext_addr,
            media_type: settings.media_type,
            idp: settings.device_identity(),
            state: ClientState::Disconnected,
            handshake: Handshake::Idle,
            descriptors: PanDescriptors::new(),
            candidate: 0,
            retries: 0,
            pan_id: BROADCAST_SHORT_ADDR,
            lba_addr: BROADCAST_SHORT_ADDR,
            short_addr: BROADCAST_SHORT_ADDR,
            gmk: [None, None],
            active_index: 0,
            psk: PskContext::default(),
            rand_s: [0; 16],
            rand_p: [0; 16],
            id_s: Identity::new(),
            identifier: 0,
            received: Received::default(),
            pending_sets: 0,
            handle: 0,
            leave_handle: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn ext_addr(&self) -> ExtendedAddress {
        self.ext_addr
    }

    pub fn short_addr(&self) -> u16 {
        self.short_addr
    }

    pub fn pan_id(&self) -> u16 {
        self.pan_id
    }

    /// The GMK slots and the active index.
    pub fn gmk(&self) -> (&[Option<Key>; 2], u8) {
        (&self.gmk, self.active_index)
    }

    /// Handle BOOT-DEVICE-START.request.
    ///
    /// # Args
    /// * `restore` - A restore image stored by the host after a previous join.
    pub fn start<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        restore: Option<RestoreImage>,
    ) {
        if self.state != ClientState::Disconnected {
            ctx.notify(HostMessage::DeviceStartConfirm {
                status: Status::InvalidRequest,
                short_addr: self.short_addr,
                pan_id: self.pan_id,
            });
            return;
        }

        self.retries = 0;

        let record = restore
            .filter(|_| self.settings.fast_restore)
            .and_then(|image| match RestoreRecord::try_deserialize(&image) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!("Ignoring restore image: {:?}", error);
                    None
                }
            });

        match record {
            Some(record) => self.fast_restore(ctx, &record),
            None => {
                let delay = ctx.random_delay(self.settings.start_wait_ms);
                self.wait(ctx, Next::Discover, delay);
            }
        }
    }

    /// Handle BOOT-DEVICE-LEAVE.request.
    pub fn leave<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        match self.state {
            ClientState::Disconnected => {
                ctx.notify(HostMessage::DeviceLeaveConfirm {
                    status: Status::InvalidRequest,
                });
            }
            ClientState::Leaving => {
                ctx.notify(HostMessage::DeviceLeaveConfirm {
                    status: Status::Busy,
                });
            }
            ClientState::Connected => {
                let header = self.header(MessageType::KickFromLbd);
                let sent = lbp::encode_empty(&header)
                    .and_then(|nsdu| self.send(ctx, COORDINATOR_SHORT_ADDR, true, nsdu));

                match sent {
                    Ok(handle) => {
                        info!("Leaving PAN {:#06x}", self.pan_id);
                        self.leave_handle = Some(handle);
                        self.state = ClientState::Leaving;
                        ctx.start_timer(
                            TimerId::ClientMessage,
                            millis(self.settings.msg_timeout_ms),
                        );
                    }
                    Err(error) => {
                        warn!("Failed to send Kick: {:?}", error);
                        self.disconnect(ctx);
                        ctx.notify(HostMessage::DeviceLeaveConfirm {
                            status: Status::Failed,
                        });
                    }
                }
            }
            _ => {
                info!("Bootstrap aborted in {:?}", self.state);
                self.disconnect(ctx);
                ctx.notify(HostMessage::DeviceLeaveConfirm {
                    status: Status::Success,
                });
            }
        }
    }

    /// Handle BOOT-DEVICE-PANSORT.request.
    pub fn pan_sort<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        descriptors: PanDescriptors,
    ) {
        if self.state != ClientState::WaitPanSort {
            ctx.notify(HostMessage::DevicePanSortConfirm {
                status: Status::InvalidRequest,
            });
            return;
        }

        ctx.stop_timer(TimerId::ClientPanSort);
        ctx.notify(HostMessage::DevicePanSortConfirm {
            status: Status::Success,
        });

        self.descriptors = descriptors;
        self.begin_joining(ctx);
    }

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
            AdpIndication::DiscoveryConfirm {
                status,
                descriptors,
            } => self.handle_discovery_confirm(ctx, status, &descriptors),
            AdpIndication::SetConfirm { attribute, status } => {
                trace!("Set {:?}: {:?}", attribute, status);
                self.handle_set_confirm(ctx, status)
            }
            AdpIndication::RouteDiscoveryConfirm { status } => {
                if self.state == ClientState::Routing {
                    if !status.is_success() {
                        warn!("No route to the coordinator yet: {:?}", status);
                    }
                    self.connected(ctx);
                }
            }
            other => debug!("Ignoring {:?}", other),
        }
    }

    pub fn handle_timer<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        id: TimerId,
    ) {
        match (id, self.state) {
            (TimerId::ClientWait, ClientState::WaitTimer(Next::Discover)) => self.discover(ctx),
            (TimerId::ClientWait, ClientState::WaitTimer(Next::Join)) => self.join_attempt(ctx),
            (TimerId::ClientPanSort, ClientState::WaitPanSort) => {
                warn!("Host did not sort the PANs");
                sort_descriptors(&mut self.descriptors);
                self.begin_joining(ctx);
            }
            (TimerId::ClientMessage, ClientState::Leaving) => {
                self.leave_done(ctx, Status::Timeout)
            }
            (TimerId::ClientMessage, ClientState::FastRestore) => {
                warn!("Modem did not confirm the restored network");
                self.restore_failed(ctx);
            }
            (TimerId::ClientMessage, ClientState::Connected) => {
                warn!("Re-keying handshake abandoned in {:?}", self.handshake);
                self.handshake = Handshake::Idle;
            }
            (
                TimerId::ClientMessage,
                ClientState::Bootstrapping | ClientState::Configuring | ClientState::Routing,
            ) => {
                warn!("Bootstrap timed out in {:?}", self.handshake);
                self.join_failed(ctx);
            }
            (id, state) => debug!("Ignoring {:?} in {:?}", id, state),
        }
    }

    fn fast_restore<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        record: &RestoreRecord,
    ) {
        info!("Restoring PAN {:#06x} as {:#06x}", record.pan_id, record.short_addr);
        self.pan_id = record.pan_id;
        self.short_addr = record.short_addr;
        self.lba_addr = record.lba_addr;
        self.media_type = record.media_type;
        self.gmk = record.gmk;
        self.active_index = record.active_index;

        match self.program(ctx, true) {
            Ok(()) => {
                self.state = ClientState::FastRestore;
                ctx.start_timer(TimerId::ClientMessage, millis(self.settings.msg_timeout_ms));
            }
            Err(error) => {
                warn!("Fast restore failed: {:?}", error);
                self.restore_failed(ctx);
            }
        }
    }

    /// Give up on the restored network and look for a PAN instead.
    fn restore_failed<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        ctx.stop_timer(TimerId::ClientMessage);
        self.forget_network();
        let delay = ctx.random_delay(self.settings.start_wait_ms);
        self.wait(ctx, Next::Discover, delay);
    }

    /// Write the network parameters into the modem.
    ///
    /// # Args
    /// * `with_pan_id` - The PAN id is written too. It is already set during a regular join.
    fn program<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        with_pan_id: bool,
    ) -> Result<(), Error> {
        self.pending_sets = 0;

        if with_pan_id {
            ctx.request(AdpRequest::Set(Attribute::PanId(self.pan_id)))?;
            self.pending_sets += 1;
        }

        ctx.request(AdpRequest::Set(Attribute::ShortAddress(self.short_addr)))?;
        self.pending_sets += 1;

        for (index, key) in self.gmk.iter().enumerate() {
            if let Some(key) = key {
                ctx.request(AdpRequest::Set(Attribute::Gmk {
                    index: index as u8,
                    key: *key,
                }))?;
                self.pending_sets += 1;
            }
        }

        ctx.request(AdpRequest::Set(Attribute::ActiveKeyIndex(self.active_index)))?;
        self.pending_sets += 1;
        Ok(())
    }

    fn handle_set_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        status: Status,
    ) {
        match self.state {
            ClientState::FastRestore | ClientState::Configuring if !status.is_success() => {
                warn!("Programming failed in {:?}: {:?}", self.state, status);
                if self.state == ClientState::FastRestore {
                    self.restore_failed(ctx);
                } else {
                    self.join_failed(ctx);
                }
            }
            ClientState::FastRestore | ClientState::Configuring => {
                self.pending_sets = self.pending_sets.saturating_sub(1);
                if self.pending_sets > 0 {
                    return;
                }

                if self.state == ClientState::FastRestore {
                    self.connected(ctx);
                } else {
                    self.route(ctx);
                }
            }
            ClientState::Bootstrapping if !status.is_success() => {
                warn!("Failed to select the PAN: {:?}", status);
                self.join_failed(ctx);
            }
            state if !status.is_success() => warn!("Set failed in {:?}: {:?}", state, status),
            _ => {}
        }
    }

    fn discover<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        let request = AdpRequest::Discovery {
            duration_s: self.settings.discovery_duration_s,
        };

        if let Err(error) = ctx.request(request) {
            warn!("Discovery failed: {:?}", error);
            let delay = ctx.random_delay(self.settings.rand_wait_ms);
            self.wait(ctx, Next::Discover, delay);
            return;
        }

        debug!("Scanning for PANs");
        self.state = ClientState::WaitDiscoverCnf;
    }

    fn handle_discovery_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        status: Status,
        descriptors: &[PanDescriptor],
    ) {
        if self.state != ClientState::WaitDiscoverCnf {
            return;
        }

        let threshold = self.settings.lqi_threshold;
        self.descriptors = descriptors
            .iter()
            .filter(|pan| pan.link_quality >= threshold)
            .copied()
            .collect();

        if self.descriptors.is_empty() {
            info!("No usable PAN found: {:?}", status);
            let delay = ctx.random_delay(self.settings.rand_wait_ms);
            self.wait(ctx, Next::Discover, delay);
            return;
        }

        if self.settings.pansort_from_host {
            self.state = ClientState::WaitPanSort;
            ctx.notify(HostMessage::DevicePanSortIndication {
                descriptors: self.descriptors.clone(),
            });
            ctx.start_timer(
                TimerId::ClientPanSort,
                millis(self.settings.pansort_timeout_ms),
            );
            return;
        }

        sort_descriptors(&mut self.descriptors);
        self.begin_joining(ctx);
    }

    fn begin_joining<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        self.candidate = 0;
        self.retries = 0;
        self.join_attempt(ctx);
    }

    /// Send a Joining to the bootstrap agent of the current PAN candidate.
    fn join_attempt<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        let Some(pan) = self.descriptors.get(self.candidate).copied() else {
            let delay = ctx.random_delay(self.settings.rand_wait_ms);
            self.wait(ctx, Next::Discover, delay);
            return;
        };

        self.clear_handshake();
        self.pan_id = pan.pan_id;
        self.lba_addr = pan.lba_addr;
        self.media_type = pan.media_type;

        info!(
            "Joining PAN {:#06x} via {:#06x}, attempt {}",
            pan.pan_id,
            pan.lba_addr,
            self.retries + 1
        );

        let header = self.header(MessageType::Joining);
        let sent = ctx
            .request(AdpRequest::Set(Attribute::PanId(pan.pan_id)))
            .and_then(|_| lbp::encode_empty(&header))
            .and_then(|nsdu| self.send(ctx, pan.lba_addr, false, nsdu));

        self.state = ClientState::Bootstrapping;
        match sent {
            Ok(_) => {
                self.handshake = Handshake::WaitFirst;
                ctx.start_timer(
                    TimerId::ClientMessage,
                    millis(self.settings.msg_timeout_ms),
                );
            }
            Err(error) => {
                warn!("Failed to send Joining: {:?}", error);
                self.join_failed(ctx);
            }
        }
    }

    /// Back off and retry, moving to the next PAN once the retries are exhausted.
    fn join_failed<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        ctx.stop_timer(TimerId::ClientMessage);
        self.clear_handshake();
        self.forget_network();

        self.retries += 1;
        if self.retries >= self.settings.max_join_retries {
            self.retries = 0;
            self.candidate += 1;
            if self.candidate >= self.descriptors.len() {
                info!("Join failed on every PAN, rediscovering");
                let delay = ctx.random_delay(self.settings.rand_wait_ms);
                self.wait(ctx, Next::Discover, delay);
                return;
            }
        }

        let delay = ctx.random_delay(self.settings.rand_wait_ms);
        self.wait(ctx, Next::Join, delay);
    }

    fn handle_lbp<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        mut indication: LbpIndication,
    ) {
        let (header, data) = match lbp::decode(&indication.nsdu) {
            Ok(decoded) => decoded,
            Err(_) => {
                warn!("Dropping malformed LBP frame");
                return;
            }
        };

        if header.ext_addr != self.ext_addr || header.kind.from_lbd() {
            trace!("Ignoring {:?} for {:02x?}", header.kind, header.ext_addr);
            return;
        }

        match (header.kind, Payload::classify(data)) {
            (MessageType::Challenge, Payload::Eap) => {
                self.handle_challenge(ctx, &mut indication.nsdu[lbp::HEADER_LEN..])
            }
            (MessageType::Accepted, Payload::Eap) => self.handle_accepted(ctx, data),
            (MessageType::Accepted, Payload::Parameters) => self.handle_activation(ctx, data),
            (MessageType::Decline, _) => {
                if self.state == ClientState::Bootstrapping {
                    warn!("Join declined by PAN {:#06x}", self.pan_id);
                    self.join_failed(ctx);
                } else if self.handshake != Handshake::Idle {
                    warn!("Re-keying declined");
                    self.clear_handshake();
                }
            }
            (MessageType::KickToLbd, _) => self.kicked(ctx),
            (kind, payload) => debug!("Ignoring {:?} with {:?}", kind, payload),
        }
    }

    fn handle_challenge<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        msg: &mut [u8],
    ) {
        let subtype = match eap_psk::classify(msg) {
            Ok((eap, subtype)) if eap.code == Code::Request => subtype,
            Ok(_) | Err(_) => {
                warn!("Malformed EAP request");
                return;
            }
        };

        let accepting = matches!(
            self.state,
            ClientState::Bootstrapping | ClientState::Connected
        );
        match (subtype, self.handshake) {
            (Some(Subtype::First), _) if accepting => self.handle_first(ctx, msg),
            (Some(Subtype::Third), Handshake::WaitThird) => self.handle_third(ctx, msg),
            (subtype, handshake) => debug!("Ignoring {:?} in {:?}", subtype, handshake),
        }
    }

    fn handle_first<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        msg: &[u8],
    ) {
        let first = match eap_psk::decode_message1(msg) {
            Ok(first) => first,
            Err(error) => {
                warn!("Invalid first message: {:?}", error);
                return;
            }
        };

        let Ok(id_s) = Identity::from_slice(first.id_s) else {
            warn!("Server identity too long");
            return;
        };

        self.id_s = id_s;
        self.rand_s = first.rand_s;
        self.identifier = first.identifier;
        self.psk = PskContext::new(&self.settings.psk);

        let header = self.header(MessageType::Joining);
        let (identifier, id_s, idp) = (self.identifier, &self.id_s, &self.idp);
        let (psk, rand_s) = (&mut self.psk, &self.rand_s);
        let mut rand_p = [0u8; 16];
        let nsdu = lbp::encode(&header, |buf| {
            let (len, rand) =
                eap_psk::encode_message2(buf, identifier, psk, rand_s, id_s, idp, &mut *ctx.rng)?;
            rand_p = rand;
            Ok(len)
        });
        self.rand_p = rand_p;

        match nsdu.and_then(|nsdu| self.send_to_server(ctx, nsdu)) {
            Ok(()) => {
                debug!("Second message sent");
                self.handshake = Handshake::WaitThird;
                ctx.start_timer(
                    TimerId::ClientMessage,
                    millis(self.settings.msg_timeout_ms),
                );
            }
            Err(error) => {
                warn!("Failed to send the second message: {:?}", error);
                self.abandon_handshake(ctx);
            }
        }
    }

    fn handle_third<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        msg: &mut [u8],
    ) {
        let decoded =
            eap_psk::decode_message3(msg, &self.psk, &self.rand_s, &self.rand_p, &self.id_s)
                .map_err(Error::from)
                .and_then(|third| {
                    if third.pchannel.result != PChannelResult::DoneSuccess {
                        return Err(Error::Authentication);
                    }

                    let params = third
                        .pchannel
                        .extension
                        .filter(|extension| extension.ext_type == EXT_TYPE_CONFIG)
                        .map(|extension| conf_param::decode_params(extension.payload))
                        .unwrap_or(Err(Rejection {
                            result: ParamResult::Missing,
                            attr_id: ATTR_GMK,
                        }));

                    Ok((third.identifier, third.pchannel.nonce, params))
                });

        let (identifier, nonce, params) = match decoded {
            Ok(decoded) => decoded,
            Err(error) => {
                // The server is not authenticated, nothing is answered.
                warn!("Invalid third message: {:?}", error);
                self.abandon_handshake(ctx);
                return;
            }
        };

        let params = params.and_then(|received| self.check_params(&received).map(|_| received));
        let (result, attr_id, pchannel) = match &params {
            Ok(_) => (ParamResult::Success, 0, PChannelResult::DoneSuccess),
            Err(rejection) => (
                rejection.result,
                rejection.attr_id,
                PChannelResult::DoneFailure,
            ),
        };

        let mut body = [0u8; 8];
        let header = self.header(MessageType::Joining);
        let nsdu = conf_param::encode_result(&mut body, result, attr_id).and_then(|len| {
            let extension = Extension {
                ext_type: EXT_TYPE_CONFIG,
                payload: &body[..len],
            };
            lbp::encode(&header, |buf| {
                Ok(eap_psk::encode_message4(
                    buf,
                    identifier,
                    &self.psk,
                    &self.rand_s,
                    nonce.wrapping_add(1),
                    pchannel,
                    Some(&extension),
                )?)
            })
        });

        self.identifier = identifier;
        let sent = nsdu.and_then(|nsdu| self.send_to_server(ctx, nsdu));

        match (params, sent) {
            (Ok(received), Ok(())) => {
                debug!("Fourth message sent");
                self.received = received;
                self.handshake = Handshake::WaitAccept;
                ctx.start_timer(
                    TimerId::ClientMessage,
                    millis(self.settings.msg_timeout_ms),
                );
            }
            (Err(rejection), _) => {
                warn!("Rejected parameters: {:?}", rejection);
                self.abandon_handshake(ctx);
            }
            (_, Err(error)) => {
                warn!("Failed to send the fourth message: {:?}", error);
                self.abandon_handshake(ctx);
            }
        }
    }

    /// Check that message 3 carried everything the device needs.
    fn check_params(&self, received: &Received) -> Result<(), Rejection> {
        let missing = |attr_id| Rejection {
            result: ParamResult::Missing,
            attr_id,
        };

        if self.state != ClientState::Bootstrapping {
            // A re-keying only delivers the new key.
            if received.gmk.iter().all(Option::is_none) {
                return Err(missing(ATTR_GMK));
            }
            return Ok(());
        }

        received.short_addr.ok_or(missing(ATTR_SHORT_ADDR))?;
        let active = received
            .active_index
            .ok_or(missing(ATTR_GMK_ACTIVATION))?;
        if received.gmk[active as usize].is_none() {
            return Err(missing(ATTR_GMK));
        }

        Ok(())
    }

    fn handle_accepted<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        data: &[u8],
    ) {
        let success = matches!(
            eap_psk::classify(data),
            Ok((eap, None)) if eap.code == Code::Success && eap.identifier == self.identifier
        );
        if !success || self.handshake != Handshake::WaitAccept {
            debug!("Unexpected Accepted in {:?}", self.handshake);
            return;
        }

        ctx.stop_timer(TimerId::ClientMessage);
        let received = self.received;
        self.clear_handshake();

        for (slot, key) in self.gmk.iter_mut().zip(received.gmk) {
            if key.is_some() {
                *slot = key;
            }
        }

        if self.state == ClientState::Connected {
            info!("New GMK installed");
            for (index, key) in received.gmk.iter().enumerate() {
                if let Some(key) = key {
                    let request = AdpRequest::Set(Attribute::Gmk {
                        index: index as u8,
                        key: *key,
                    });
                    if ctx.request(request).is_err() {
                        warn!("Failed to install GMK {}", index);
                    }
                }
            }
            self.emit_restore(ctx);
            return;
        }

        if let Some(short_addr) = received.short_addr {
            self.short_addr = short_addr;
        }
        if let Some(active_index) = received.active_index {
            self.active_index = active_index;
        }

        info!("Accepted into PAN {:#06x} as {:#06x}", self.pan_id, self.short_addr);
        match self.program(ctx, false) {
            Ok(()) => {
                self.state = ClientState::Configuring;
                ctx.start_timer(
                    TimerId::ClientMessage,
                    millis(self.settings.msg_timeout_ms),
                );
            }
            Err(error) => {
                warn!("Failed to program the network: {:?}", error);
                self.join_failed(ctx);
            }
        }
    }

    /// Apply a GMK activation sent in clear by the server and report the result.
    fn handle_activation<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        data: &[u8],
    ) {
        if self.state != ClientState::Connected {
            debug!("Ignoring parameters in {:?}", self.state);
            return;
        }

        let outcome = conf_param::decode_params(data).and_then(|received| {
            let invalid = |attr_id| Rejection {
                result: ParamResult::InvalidValue,
                attr_id,
            };

            if let Some(index) = received.active_index {
                if self.gmk[index as usize].is_none() {
                    return Err(invalid(ATTR_GMK_ACTIVATION));
                }
            }
            // The key in use after the activation is never removed.
            let active = received.active_index.unwrap_or(self.active_index);
            if received.removed_index == Some(active) {
                return Err(invalid(conf_param::ATTR_GMK_REMOVAL));
            }

            Ok(received)
        });

        let (result, attr_id) = match &outcome {
            Ok(received) => {
                if let Some(index) = received.active_index {
                    info!("Activating GMK {}", index);
                    self.active_index = index;
                    ctx.request(AdpRequest::Set(Attribute::ActiveKeyIndex(index)))
                        .ok();
                }
                if let Some(index) = received.removed_index {
                    self.gmk[index as usize].zeroize();
                    ctx.request(AdpRequest::Set(Attribute::GmkRemoval { index }))
                        .ok();
                }
                (ParamResult::Success, 0)
            }
            Err(rejection) => {
                warn!("Rejected GMK activation: {:?}", rejection);
                (rejection.result, rejection.attr_id)
            }
        };

        let header = self.header(MessageType::Joining);
        let sent = lbp::encode(&header, |buf| {
            conf_param::encode_result(buf, result, attr_id)
        })
        .and_then(|nsdu| self.send_to_server(ctx, nsdu));

        if let Err(error) = sent {
            warn!("Failed to send the parameter result: {:?}", error);
        }

        if outcome.is_ok() {
            self.emit_restore(ctx);
        }
    }

    fn handle_lbp_confirm<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        handle: u8,
        status: Status,
    ) {
        if self.state == ClientState::Leaving && self.leave_handle == Some(handle) {
            self.leave_done(ctx, status);
            return;
        }

        if handle != self.handle || status.is_success() {
            return;
        }

        warn!("LBP request failed: {:?}", status);
        if self.state == ClientState::Bootstrapping {
            self.join_failed(ctx);
        }
    }

    fn kicked<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        match self.state {
            ClientState::Connected | ClientState::Leaving => {
                info!("Kicked from PAN {:#06x}", self.pan_id);
                self.disconnect(ctx);
                ctx.notify(HostMessage::DeviceLeaveIndication);
            }
            ClientState::Bootstrapping => self.join_failed(ctx),
            state => debug!("Ignoring Kick in {:?}", state),
        }
    }

    fn leave_done<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        status: Status,
    ) {
        info!("Left PAN {:#06x}: {:?}", self.pan_id, status);
        self.disconnect(ctx);
        ctx.notify(HostMessage::DeviceLeaveConfirm { status });
    }

    fn route<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        if !self.settings.route_discovery {
            self.connected(ctx);
            return;
        }

        let request = AdpRequest::RouteDiscovery {
            dst: COORDINATOR_SHORT_ADDR,
            max_hops: self.settings.max_hops,
        };
        if ctx.request(request).is_err() {
            warn!("Route discovery failed");
            self.connected(ctx);
            return;
        }

        self.state = ClientState::Routing;
        ctx.start_timer(
            TimerId::ClientMessage,
            millis(self.settings.msg_timeout_ms),
        );
    }

    fn connected<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        ctx.stop_timer(TimerId::ClientMessage);
        self.state = ClientState::Connected;
        self.retries = 0;

        info!("Connected to PAN {:#06x} as {:#06x}", self.pan_id, self.short_addr);
        ctx.notify(HostMessage::DeviceStartConfirm {
            status: Status::Success,
            short_addr: self.short_addr,
            pan_id: self.pan_id,
        });
        self.emit_restore(ctx);
    }

    /// Hand a snapshot of the connection to the host for the next fast restore.
    fn emit_restore<I: G3Interface, R: RngCore + CryptoRng>(&self, ctx: &mut Context<'_, I, R>) {
        let record = RestoreRecord::new(
            self.pan_id,
            self.short_addr,
            self.lba_addr,
            self.media_type,
            self.gmk,
            self.active_index,
        );

        match record.serialize() {
            Ok(image) => ctx.notify(HostMessage::DeviceRestoreIndication { image }),
            Err(error) => warn!("Failed to serialize restore record: {:?}", error),
        }
    }

    fn disconnect<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        ctx.timers.stop_matching(|id| {
            matches!(
                id,
                TimerId::ClientWait | TimerId::ClientMessage | TimerId::ClientPanSort
            )
        });
        ctx.request(AdpRequest::Reset).ok();

        self.state = ClientState::Disconnected;
        self.leave_handle = None;
        self.descriptors.clear();
        self.clear_handshake();
        self.forget_network();
    }

    /// Drop a handshake the server can't complete anymore.
    fn abandon_handshake<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
    ) {
        if self.state == ClientState::Connected {
            ctx.stop_timer(TimerId::ClientMessage);
            self.clear_handshake();
        } else {
            self.join_failed(ctx);
        }
    }

    fn clear_handshake(&mut self) {
        self.handshake = Handshake::Idle;
        self.psk.zeroize();
        self.rand_s.zeroize();
        self.rand_p.zeroize();
        self.received = Received::default();
    }

    fn forget_network(&mut self) {
        self.short_addr = BROADCAST_SHORT_ADDR;
        self.gmk.zeroize();
        self.active_index = 0;
    }

    fn wait<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        next: Next,
        delay: Duration,
    ) {
        trace!("Waiting {} ms before {:?}", delay.to_millis(), next);
        self.state = ClientState::WaitTimer(next);
        ctx.start_timer(TimerId::ClientWait, delay);
    }

    fn header(&self, kind: MessageType) -> Header {
        Header::new(kind, self.ext_addr, self.media_type)
    }

    /// Send bootstrap data to the server: through the agent while joining, directly once joined.
    fn send_to_server<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        nsdu: Nsdu,
    ) -> Result<(), Error> {
        let joined = matches!(self.state, ClientState::Connected | ClientState::Leaving);
        let dst = if joined {
            COORDINATOR_SHORT_ADDR
        } else {
            self.lba_addr
        };

        self.send(ctx, dst, joined, nsdu).map(|_| ())
    }

    /// Issue an LBP request.
    ///
    /// # Returns
    /// The NSDU handle of the request.
    fn send<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        dst: u16,
        security_enabled: bool,
        nsdu: Nsdu,
    ) -> Result<u8, Error> {
        self.handle = self.handle.wrapping_add(1);

        ctx.request(AdpRequest::Lbp(LbpRequest {
            dst: Address::Short(dst),
            nsdu,
            handle: self.handle,
            max_hops: self.settings.max_hops,
            discover_route: security_enabled,
            qos: 0,
            security_enabled,
            media_type: self.media_type,
            disable_backup: false,
        }))?;

        Ok(self.handle)
    }
}

/// Order PAN candidates by route cost, then by link quality.
pub fn sort_descriptors(descriptors: &mut [PanDescriptor]) {
    descriptors.sort_unstable_by(|a, b| {
        a.route_cost
            .cmp(&b.route_cost)
            .then(b.link_quality.cmp(&a.link_quality))
    });
}
