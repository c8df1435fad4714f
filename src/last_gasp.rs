//! Last-gasp notification of a device losing power
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
use crate::adp::{AdpRequest, DataPayload, ExtendedAddress, BROADCAST_SHORT_ADDR};
use crate::bootstrap::client::BootClient;
use crate::bootstrap::server::BootServer;
use crate::bootstrap::{Context, TimerId};
use crate::hif::HostMessage;
use crate::interface::G3Interface;
use crate::settings::LastGaspSettings;
use crate::timer::millis;
use crate::Error;
use log::{info, warn};
use rand_core::{CryptoRng, RngCore};

pub const LAST_GASP: u8 = 0x10;

const FRAME_LEN: usize = 9;

/// Build the last-gasp frame of a device.
pub fn encode(ext_addr: &ExtendedAddress) -> Result<DataPayload, Error> {
    let mut frame = [LAST_GASP; FRAME_LEN];
    frame[1..].copy_from_slice(ext_addr);
    DataPayload::from_slice(&frame).map_err(|_| Error::Bounds)
}

/// Extract the device address of a last-gasp frame.
pub fn decode(payload: &[u8]) -> Result<ExtendedAddress, Error> {
    match payload {
        [LAST_GASP, ext_addr @ ..] => ext_addr.try_into().map_err(|_| Error::Invalid),
        _ => Err(Error::Invalid),
    }
}

/// The device side: broadcasts the frame while the supply holds up.
pub struct LastGasp {
    settings: LastGaspSettings,
    remaining: u8,
    handle: u8,
}

impl LastGasp {
    pub fn new(settings: &LastGaspSettings) -> Self {
        Self {
            settings: settings.clone(),
            remaining: 0,
            handle: 0,
        }
    }

    /// Start announcing the power loss. Only a connected device announces it.
    pub fn power_lost<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        client: &BootClient,
    ) {
        if !self.settings.enabled || self.settings.repetitions == 0 {
            return;
        }

        if !client.is_connected() || self.remaining > 0 {
            return;
        }

        warn!("Power lost, sending last gasp");
        self.remaining = self.settings.repetitions;
        self.send(ctx, client);
    }

    pub fn handle_timer<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        client: &BootClient,
    ) {
        if self.remaining > 0 {
            self.send(ctx, client);
        }
    }

    fn send<I: G3Interface, R: RngCore + CryptoRng>(
        &mut self,
        ctx: &mut Context<'_, I, R>,
        client: &BootClient,
    ) {
        self.remaining = self.remaining.saturating_sub(1);
        self.handle = self.handle.wrapping_add(1);

        let sent = encode(&client.ext_addr()).and_then(|payload| {
            ctx.request(AdpRequest::Data {
                dst: BROADCAST_SHORT_ADDR,
                handle: self.handle,
                payload,
            })
        });
        if let Err(error) = sent {
            warn!("Failed to send last gasp: {:?}", error);
        }

        if self.remaining > 0 {
            ctx.start_timer(TimerId::LastGasp, millis(self.settings.interval_ms));
        }
    }
}

/// The coordinator side: a device announced its power loss and leaves the PAN.
pub fn handle_indication<I: G3Interface, R: RngCore + CryptoRng>(
    ctx: &mut Context<'_, I, R>,
    server: &mut BootServer,
    payload: &[u8],
) {
    let Ok(ext_addr) = decode(payload) else {
        warn!("Malformed last gasp");
        return;
    };

    if let Some(device) = server.remove_device(ctx, &ext_addr) {
        info!("Last gasp from {:02x?}", ext_addr);
        ctx.notify(HostMessage::LastGaspIndication {
            ext_addr,
            short_addr: device.short_addr,
        });
    }
}
