//! Liveness supervision of joined devices
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! Once per period the coordinator pings every connected device in turn and waits for the
//! answer before moving on. A device that misses as many pings as it has lives is removed from
//! the PAN. Devices answer every ping they receive.
use crate::adp::{AdpRequest, DataPayload, ExtendedAddress};
use crate::bootstrap::client::BootClient;
use crate::bootstrap::devices::DeviceState;
use crate::bootstrap::server::BootServer;
use crate::bootstrap::{Context, TimerId};
use crate::hif::HostMessage;
use crate::interface::G3Interface;
use crate::settings::KeepAliveSettings;
use crate::timer::millis;
use log::{debug, info, trace, warn};
use rand_core::{CryptoRng, RngCore};

pub const KEEP_ALIVE_REQUEST: u8 = 0x01;
pub const KEEP_ALIVE_RESPONSE: u8 = 0x02;

const CONNECTED: u8 = DeviceState::Connected as u8;

/// A ping waiting for its answer.
#[derive(Debug, Copy, Clone)]
struct Pending {
    ext_addr: ExtendedAddress,
    short_addr: u16,
    sequence: u8,
}

pub struct KeepAlive {
    settings: KeepAliveSettings,
    running: bool,
    cursor: usize,
    sequence: u8,
    handle: u8,
    pending: Option<Pending>,
}

impl KeepAlive {
    pub fn new(settings: &KeepAliveSettings) -> Self {
        Self {
            settings: settings.clone(),
            running: false,
            cursor: 0,
            sequence: 0,
            handle: 0,
            pending: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begin supervision. Has no effect when keep-alive is disabled.
    pub fn start<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        if !self.settings.enabled || self.running {
            return;
        }

        debug!("Keep-alive started");
        self.running = true;
        self.cursor = 0;
        ctx.start_timer(TimerId::KeepAlivePeriod, millis(self.settings.period_ms));
    }

    pub fn stop<I: G3Interface, R: RngCore + CryptoRng>(&mut self, ctx: &mut Context<'_, I, R>) {
        self.running = false;
        self.pending = None;
        ctx.stop_timer(TimerId::KeepAlivePeriod);
        ctx.stop_timer(TimerId::KeepAliveResponse);
    }

    pub fn handle_timer<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        server: &mut BootServer,
        id: TimerId,
    ) {
        if !self.running {
            return;
        }

        match id {
            TimerId::KeepAlivePeriod => self.ping_next(ctx, server),
            TimerId::KeepAliveResponse => self.missed(ctx, server),
            _ => {}
        }
    }

    /// Process a keep-alive response received from `src`.
    pub fn handle_response<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        server: &mut BootServer,
        src: u16,
        payload: &[u8],
    ) {
        let Some(pending) = self.pending else {
            return;
        };

        if *payload != [KEEP_ALIVE_RESPONSE, pending.sequence] || src != pending.short_addr {
            trace!("Stale keep-alive response from {:#06x}", src);
            return;
        }

        ctx.stop_timer(TimerId::KeepAliveResponse);
        self.pending = None;

        let devices = server.devices_mut();
        if let Some(device) = devices
            .find(&pending.ext_addr, CONNECTED)
            .and_then(|slot| devices.get_mut(slot))
        {
            device.lives = self.settings.lives;
            device.last_keep_alive = ctx.now;
        }

        self.ping_next(ctx, server);
    }

    /// Ping the next connected device, or wait for the next period once every device was seen.
    fn ping_next<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        server: &mut BootServer,
    ) {
        let devices = server.devices();
        let next = devices
            .next(self.cursor, |device| device.state.matches(CONNECTED))
            .and_then(|slot| Some((slot, *devices.get(slot)?)));

        let Some((slot, device)) = next else {
            self.cursor = 0;
            ctx.start_timer(TimerId::KeepAlivePeriod, millis(self.settings.period_ms));
            return;
        };

        self.cursor = slot + 1;

        self.sequence = self.sequence.wrapping_add(1);
        self.handle = self.handle.wrapping_add(1);
        self.pending = Some(Pending {
            ext_addr: device.ext_addr,
            short_addr: device.short_addr,
            sequence: self.sequence,
        });

        let request = DataPayload::from_slice(&[KEEP_ALIVE_REQUEST, self.sequence])
            .map(|payload| AdpRequest::Data {
                dst: device.short_addr,
                handle: self.handle,
                payload,
            });

        // A ping that could not be sent counts as missed once the timeout expires.
        match request {
            Ok(request) => {
                if let Err(error) = ctx.request(request) {
                    warn!("Failed to ping {:#06x}: {:?}", device.short_addr, error);
                }
            }
            Err(()) => warn!("Keep-alive payload too long"),
        }

        ctx.start_timer(
            TimerId::KeepAliveResponse,
            millis(self.settings.timeout_ms),
        );
    }

    fn missed<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        server: &mut BootServer,
    ) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let devices = server.devices_mut();
        let lives = devices
            .find(&pending.ext_addr, CONNECTED)
            .and_then(|slot| devices.get_mut(slot))
            .map(|device| {
                device.lives = device.lives.saturating_sub(1);
                device.lives
            });

        match lives {
            Some(0) => {
                info!("Device {:02x?} stopped answering", pending.ext_addr);
                if let Some(device) = server.remove_device(ctx, &pending.ext_addr) {
                    ctx.notify(HostMessage::ServerLeaveIndication {
                        ext_addr: device.ext_addr,
                        short_addr: device.short_addr,
                    });
                }
            }
            Some(lives) => debug!(
                "Device {:#06x} missed a keep-alive, {} lives left",
                pending.short_addr, lives
            ),
            None => {}
        }

        self.ping_next(ctx, server);
    }

    /// Answer a ping on a device.
    pub fn answer<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        client: &BootClient,
        src: u16,
        payload: &[u8],
    ) {
        let [KEEP_ALIVE_REQUEST, sequence] = payload else {
            trace!("Ignoring data frame from {:#06x}", src);
            return;
        };

        if !client.is_connected() {
            return;
        }

        self.handle = self.handle.wrapping_add(1);
        let Ok(payload) = DataPayload::from_slice(&[KEEP_ALIVE_RESPONSE, *sequence]) else {
            return;
        };

        let response = AdpRequest::Data {
            dst: src,
            handle: self.handle,
            payload,
        };
        if let Err(error) = ctx.request(response) {
            warn!("Failed to answer keep-alive: {:?}", error);
        }
    }
}
