//! The G3 protocol task
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Design
//! Host requests, modem indications and expired timers all enter the task through a single
//! bounded queue and are processed one at a time by the engine of the configured role. No event
//! is ever processed while another one is in progress.
use crate::adp::{AdpIndication, Status, BROADCAST_SHORT_ADDR};
use crate::bootstrap::client::BootClient;
use crate::bootstrap::server::{BootServer, ServerState};
use crate::bootstrap::{Context, TaskTimers, TimerId};
use crate::hif::{HostMessage, HostRequest, RekeyingError};
use crate::interface::G3Interface;
use crate::keep_alive::{KeepAlive, KEEP_ALIVE_REQUEST, KEEP_ALIVE_RESPONSE};
use crate::last_gasp::{self, LastGasp, LAST_GASP};
use crate::settings::{G3Settings, Role};
use crate::timer::Instant;
use crate::Error;
use heapless::Deque;
use log::{debug, trace, warn};
use rand_core::{CryptoRng, RngCore};

/// The number of events that can wait for processing.
pub const EVENT_QUEUE_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Host(HostRequest),
    Adp(AdpIndication),
    Timer(TimerId),
    /// The supply is failing.
    PowerLoss,
}

/// The state machines of the configured role.
pub enum Engine {
    Coordinator {
        server: BootServer,
        keep_alive: KeepAlive,
    },
    Device {
        client: BootClient,
        keep_alive: KeepAlive,
        last_gasp: LastGasp,
    },
}

pub struct G3Task<I, R> {
    engine: Engine,
    queue: Deque<Event, EVENT_QUEUE_SIZE>,
    timers: TaskTimers,
    iface: I,
    rng: R,
}

impl<I: G3Interface, R: RngCore + CryptoRng> G3Task<I, R> {
    /// Construct the task.
    ///
    /// # Args
    /// * `settings` - The validated bridge settings.
    /// * `iface` - The modem and host sinks.
    /// * `rng` - The source of the EAP-PSK challenges and back-off delays.
    pub fn new(settings: &G3Settings, iface: I, rng: R) -> Result<Self, Error> {
        if !settings.validate() {
            return Err(Error::Invalid);
        }

        let engine = match settings.role {
            Role::Coordinator => Engine::Coordinator {
                server: BootServer::new(settings),
                keep_alive: KeepAlive::new(&settings.keep_alive),
            },
            Role::Device => Engine::Device {
                client: BootClient::new(settings),
                keep_alive: KeepAlive::new(&settings.keep_alive),
                last_gasp: LastGasp::new(&settings.last_gasp),
            },
        };

        Ok(Self {
            engine,
            queue: Deque::new(),
            timers: TaskTimers::new(),
            iface,
            rng,
        })
    }

    /// Queue an event for the next poll.
    pub fn post(&mut self, event: Event) -> Result<(), Error> {
        self.queue.push_back(event).map_err(|event| {
            warn!("Event queue full, dropping {:?}", event);
            Error::Bounds
        })
    }

    /// Process every queued event and every timer expired at `now`.
    pub fn poll(&mut self, now: Instant) {
        loop {
            while !self.queue.is_full() {
                let Some(id) = self.timers.expired(now) else {
                    break;
                };
                self.queue.push_back(Event::Timer(id)).ok();
            }

            let Some(event) = self.queue.pop_front() else {
                break;
            };

            self.dispatch(now, event);
        }
    }

    /// The time at which [G3Task::poll] has to run next.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn server(&self) -> Option<&BootServer> {
        match &self.engine {
            Engine::Coordinator { server, .. } => Some(server),
            Engine::Device { .. } => None,
        }
    }

    pub fn client(&self) -> Option<&BootClient> {
        match &self.engine {
            Engine::Device { client, .. } => Some(client),
            Engine::Coordinator { .. } => None,
        }
    }

    pub fn iface(&self) -> &I {
        &self.iface
    }

    pub fn iface_mut(&mut self) -> &mut I {
        &mut self.iface
    }

    fn dispatch(&mut self, now: Instant, event: Event) {
        trace!("Processing {:?}", event);

        let mut ctx = Context {
            now,
            iface: &mut self.iface,
            rng: &mut self.rng,
            timers: &mut self.timers,
        };

        match &mut self.engine {
            Engine::Coordinator { server, keep_alive } => {
                coordinator(&mut ctx, server, keep_alive, event)
            }
            Engine::Device {
                client,
                keep_alive,
                last_gasp,
            } => device(&mut ctx, client, keep_alive, last_gasp, event),
        }
    }
}

fn coordinator<I: G3Interface, R: RngCore + CryptoRng>(
    ctx: &mut Context<'_, I, R>,
    server: &mut BootServer,
    keep_alive: &mut KeepAlive,
    event: Event,
) {
    match event {
        Event::Host(HostRequest::ServerStart) => server.start(ctx),
        Event::Host(HostRequest::ServerStop) => server.stop(ctx),
        Event::Host(HostRequest::ServerKick { ext_addr }) => server.kick(ctx, ext_addr),
        Event::Host(HostRequest::ServerSetPsk {
            ext_addr,
            psk,
            short_addr,
        }) => server.set_psk(ctx, ext_addr, psk, short_addr),
        Event::Host(HostRequest::ServerRekeying { gmk }) => server.start_rekeying(ctx, gmk),
        Event::Host(HostRequest::ServerAbortRekeying) => server.abort_rekeying(ctx),
        Event::Host(request) => reject(ctx, &request),
        Event::Adp(AdpIndication::Data { src, payload }) => match payload.first() {
            Some(&KEEP_ALIVE_RESPONSE) => keep_alive.handle_response(ctx, server, src, &payload),
            Some(&LAST_GASP) => last_gasp::handle_indication(ctx, server, &payload),
            _ => debug!("Ignoring data frame from {:#06x}", src),
        },
        Event::Adp(AdpIndication::DataConfirm { handle, status }) => {
            trace!("Data {} confirmed: {:?}", handle, status)
        }
        Event::Adp(indication) => server.handle_adp(ctx, indication),
        Event::Timer(id @ (TimerId::KeepAlivePeriod | TimerId::KeepAliveResponse)) => {
            keep_alive.handle_timer(ctx, server, id)
        }
        Event::Timer(id) => server.handle_timer(ctx, id),
        Event::PowerLoss => debug!("Power loss on the coordinator"),
    }

    // Supervision follows the network.
    let active = server.state() == ServerState::Active;
    if active && !keep_alive.is_running() {
        keep_alive.start(ctx);
    } else if !active && keep_alive.is_running() {
        keep_alive.stop(ctx);
    }
}

fn device<I: G3Interface, R: RngCore + CryptoRng>(
    ctx: &mut Context<'_, I, R>,
    client: &mut BootClient,
    keep_alive: &mut KeepAlive,
    last_gasp: &mut LastGasp,
    event: Event,
) {
    match event {
        Event::Host(HostRequest::DeviceStart { restore }) => client.start(ctx, restore),
        Event::Host(HostRequest::DeviceLeave) => client.leave(ctx),
        Event::Host(HostRequest::DevicePanSort { descriptors }) => {
            client.pan_sort(ctx, descriptors)
        }
        Event::Host(request) => reject(ctx, &request),
        Event::Adp(AdpIndication::Data { src, payload }) => match payload.first() {
            Some(&KEEP_ALIVE_REQUEST) => keep_alive.answer(ctx, client, src, &payload),
            _ => debug!("Ignoring data frame from {:#06x}", src),
        },
        Event::Adp(AdpIndication::DataConfirm { handle, status }) => {
            trace!("Data {} confirmed: {:?}", handle, status)
        }
        Event::Adp(indication) => client.handle_adp(ctx, indication),
        Event::Timer(TimerId::LastGasp) => last_gasp.handle_timer(ctx, client),
        Event::Timer(id) => client.handle_timer(ctx, id),
        Event::PowerLoss => last_gasp.power_lost(ctx, client),
    }
}

/// Answer a request addressed to the other role.
fn reject<I: G3Interface, R: RngCore + CryptoRng>(
    ctx: &mut Context<'_, I, R>,
    request: &HostRequest,
) {
    warn!("{:?} is not supported in this role", request);

    let status = Status::InvalidRequest;
    let confirm = match request {
        HostRequest::ServerStart => HostMessage::ServerStartConfirm { status },
        HostRequest::ServerStop => HostMessage::ServerStopConfirm { status },
        HostRequest::ServerKick { .. } => HostMessage::ServerKickConfirm { status },
        HostRequest::ServerSetPsk { .. } => HostMessage::ServerSetPskConfirm { status },
        HostRequest::ServerRekeying { .. } => HostMessage::ServerRekeyingConfirm {
            status,
            error: RekeyingError::Procedure,
        },
        HostRequest::ServerAbortRekeying => HostMessage::ServerAbortRekeyingConfirm { status },
        HostRequest::DeviceStart { .. } => HostMessage::DeviceStartConfirm {
            status,
            short_addr: BROADCAST_SHORT_ADDR,
            pan_id: BROADCAST_SHORT_ADDR,
        },
        HostRequest::DeviceLeave => HostMessage::DeviceLeaveConfirm { status },
        HostRequest::DevicePanSort { .. } => HostMessage::DevicePanSortConfirm { status },
    };

    ctx.notify(confirm);
}
