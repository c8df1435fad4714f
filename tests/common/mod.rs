//! A simulated PAN for exercising the bootstrap state machines end to end
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
#![allow(dead_code)]

use eap_psk::{Key, Subtype};
use g3_bridge::adp::{
    AdpIndication, AdpRequest, Address, ExtendedAddress, LbpIndication, MediaType, Nsdu,
    PanDescriptor, Status, BROADCAST_SHORT_ADDR, COORDINATOR_SHORT_ADDR,
};
use g3_bridge::bootstrap::client::BootClient;
use g3_bridge::bootstrap::lbp::{self, MessageType, Payload};
use g3_bridge::bootstrap::server::BootServer;
use g3_bridge::hif::{HostMessage, HostRequest};
use g3_bridge::interface::G3Interface;
use g3_bridge::settings::{G3Settings, Role};
use g3_bridge::timer::Instant;
use g3_bridge::{Error, Event, G3Task};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

pub const PAN_ID: u16 = 0x781D;

pub const NEW_GMK: Key = [0x5A; 16];

/// Collects everything a node hands to its modem and host.
#[derive(Default)]
pub struct Recorder {
    pending: Vec<AdpRequest>,
    pub requests: Vec<AdpRequest>,
    pub messages: Vec<HostMessage>,
}

impl G3Interface for Recorder {
    fn request(&mut self, request: AdpRequest) -> Result<(), Error> {
        self.requests.push(request.clone());
        self.pending.push(request);
        Ok(())
    }

    fn notify(&mut self, message: HostMessage) {
        self.messages.push(message);
    }
}

pub type Node = G3Task<Recorder, ChaCha8Rng>;

pub fn eui(n: u8) -> ExtendedAddress {
    [0x02, 0x80, 0xE1, 0x00, 0x00, 0x00, 0x00, n]
}

pub fn coordinator_settings() -> G3Settings {
    let mut settings = G3Settings::default();
    settings.role = Role::Coordinator;
    settings.ext_addr = eui(0xC0);
    settings.server.default_psk = Some(settings.client.psk);
    settings
}

pub fn device_settings(n: u8) -> G3Settings {
    let mut settings = G3Settings::default();
    settings.role = Role::Device;
    settings.ext_addr = eui(n);
    settings
}

pub fn node(settings: &G3Settings, seed: u64) -> Node {
    G3Task::new(settings, Recorder::default(), ChaCha8Rng::seed_from_u64(seed)).unwrap()
}

/// An LBP frame seen on the air.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub subtype: Option<Subtype>,
    pub ext_addr: ExtendedAddress,
}

impl Frame {
    pub fn is(&self, kind: MessageType, subtype: Option<Subtype>) -> bool {
        self.kind == kind && self.subtype == subtype
    }
}

pub fn inspect(nsdu: &[u8]) -> Option<Frame> {
    let (header, data) = lbp::decode(nsdu).ok()?;
    let subtype = match Payload::classify(data) {
        Payload::Eap => eap_psk::classify(data).ok().and_then(|(_, subtype)| subtype),
        _ => None,
    };

    Some(Frame {
        kind: header.kind,
        subtype,
        ext_addr: header.ext_addr,
    })
}

/// Interference applied once to the first matching frame sent by a device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tamper {
    /// Flip a bit in the last byte.
    Corrupt,
    /// Deliver the frame twice.
    Replay,
    /// Lose the frame.
    Drop,
    /// Deliver the frame and keep a copy in [Pan::captured].
    Capture,
}

pub struct Pan {
    pub now: u32,
    pub coordinator: Node,
    pub devices: Vec<Node>,
    pub frames: Vec<Frame>,
    /// Devices cut off from the PAN in both directions.
    pub muted: Vec<ExtendedAddress>,
    /// Devices whose modem never confirms a Set.
    pub stuck_modems: Vec<usize>,
    /// The frame kept by [Tamper::Capture].
    pub captured: Option<Nsdu>,
    /// LBP confirms withheld from the coordinator, if holding is enabled.
    held: Option<Vec<AdpIndication>>,
    tamper: Option<(MessageType, Option<Subtype>, Tamper)>,
}

fn deliver(node: &mut Node, now: Instant, event: Event) {
    node.post(event).unwrap();
    node.poll(now);
}

impl Pan {
    /// A coordinator and one device per EUI suffix in `devices`.
    pub fn new(devices: &[u8]) -> Self {
        let devices = devices.iter().map(|&n| device_settings(n)).collect();
        Self::with_settings(&coordinator_settings(), devices)
    }

    pub fn with_settings(coordinator: &G3Settings, devices: Vec<G3Settings>) -> Self {
        Self {
            now: 0,
            coordinator: node(coordinator, 0),
            devices: devices
                .iter()
                .zip(1..)
                .map(|(settings, seed)| node(settings, seed))
                .collect(),
            frames: Vec::new(),
            muted: Vec::new(),
            stuck_modems: Vec::new(),
            captured: None,
            held: None,
            tamper: None,
        }
    }

    /// Withhold the LBP confirms of the coordinator until [Pan::release_confirms].
    pub fn hold_confirms(&mut self) {
        self.held.get_or_insert_with(Vec::new);
    }

    pub fn release_confirms(&mut self) {
        let now = self.instant();
        for confirm in self.held.take().unwrap_or_default() {
            deliver(&mut self.coordinator, now, Event::Adp(confirm));
        }
        self.settle();
    }

    /// Hand an LBP frame to the coordinator as if sent from `src`.
    pub fn inject(&mut self, src: u16, nsdu: Nsdu) {
        let now = self.instant();
        let indication = LbpIndication {
            src_addr: Address::Short(src),
            nsdu,
            link_quality: 200,
            security_enabled: false,
            media_type: MediaType::Plc,
        };
        deliver(
            &mut self.coordinator,
            now,
            Event::Adp(AdpIndication::Lbp(indication)),
        );
        self.settle();
    }

    pub fn tamper(&mut self, kind: MessageType, subtype: Option<Subtype>, tamper: Tamper) {
        self.tamper = Some((kind, subtype, tamper));
    }

    pub fn instant(&self) -> Instant {
        Instant::from_ticks(self.now)
    }

    pub fn server(&self) -> &BootServer {
        self.coordinator.server().unwrap()
    }

    pub fn client(&self, index: usize) -> &BootClient {
        self.devices[index].client().unwrap()
    }

    pub fn coordinator_messages(&self) -> &[HostMessage] {
        &self.coordinator.iface().messages
    }

    pub fn device_messages(&self, index: usize) -> &[HostMessage] {
        &self.devices[index].iface().messages
    }

    pub fn count_frames(&self, kind: MessageType, subtype: Option<Subtype>) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.is(kind, subtype))
            .count()
    }

    /// Issue a request of the coordinator host.
    pub fn host(&mut self, request: HostRequest) {
        let now = self.instant();
        deliver(&mut self.coordinator, now, Event::Host(request));
        self.settle();
    }

    /// Issue a request of the host of a device.
    pub fn device_host(&mut self, index: usize, request: HostRequest) {
        let now = self.instant();
        deliver(&mut self.devices[index], now, Event::Host(request));
        self.settle();
    }

    pub fn power_loss(&mut self, index: usize) {
        let now = self.instant();
        deliver(&mut self.devices[index], now, Event::PowerLoss);
        self.settle();
    }

    /// Start the network and check that the coordinator is up.
    pub fn start_network(&mut self) {
        self.host(HostRequest::ServerStart);
        assert_eq!(
            self.coordinator_messages().last(),
            Some(&HostMessage::ServerStartConfirm {
                status: Status::Success
            })
        );
    }

    /// Start the network and join every device.
    pub fn join_all(&mut self) {
        self.start_network();
        for index in 0..self.devices.len() {
            self.device_host(index, HostRequest::DeviceStart { restore: None });
        }
        self.advance(5_000);

        for index in 0..self.devices.len() {
            assert!(self.client(index).is_connected(), "device {} not joined", index);
        }
    }

    /// Let `ms` milliseconds pass, running every timer that expires meanwhile.
    pub fn advance(&mut self, ms: u32) {
        let end = self.now + ms;
        self.settle();

        loop {
            let next = core::iter::once(self.coordinator.next_deadline())
                .chain(self.devices.iter().map(|device| device.next_deadline()))
                .flatten()
                .map(|deadline| deadline.ticks())
                .filter(|deadline| *deadline <= end)
                .min();

            let Some(next) = next else {
                break;
            };

            self.now = self.now.max(next);
            self.settle();
        }

        self.now = end;
        self.settle();
    }

    /// Exchange requests, confirms and frames until every node is idle.
    pub fn settle(&mut self) {
        loop {
            let now = self.instant();
            self.coordinator.poll(now);
            for device in self.devices.iter_mut() {
                device.poll(now);
            }

            let mut idle = true;

            let requests = std::mem::take(&mut self.coordinator.iface_mut().pending);
            for request in requests {
                idle = false;
                self.from_coordinator(request);
            }

            for index in 0..self.devices.len() {
                let requests = std::mem::take(&mut self.devices[index].iface_mut().pending);
                for request in requests {
                    idle = false;
                    self.from_device(index, request);
                }
            }

            if idle {
                break;
            }
        }
    }

    fn reachable(&self, ext_addr: &ExtendedAddress) -> Option<usize> {
        if self.muted.contains(ext_addr) {
            return None;
        }

        self.devices
            .iter()
            .position(|device| device.client().map(|client| client.ext_addr()) == Some(*ext_addr))
    }

    fn from_coordinator(&mut self, request: AdpRequest) {
        let now = self.instant();
        let confirm = match request {
            AdpRequest::Discovery { .. } => AdpIndication::DiscoveryConfirm {
                status: Status::Success,
                descriptors: heapless::Vec::new(),
            },
            AdpRequest::NetworkStart { .. } => AdpIndication::NetworkStartConfirm {
                status: Status::Success,
            },
            AdpRequest::Set(attribute) => AdpIndication::SetConfirm {
                attribute: attribute.id(),
                status: Status::Success,
            },
            AdpRequest::RouteDiscovery { .. } => AdpIndication::RouteDiscoveryConfirm {
                status: Status::Success,
            },
            AdpRequest::Lbp(request) => {
                let confirm = AdpIndication::LbpConfirm {
                    handle: request.handle,
                    status: Status::Success,
                };
                match self.held.as_mut() {
                    Some(held) => held.push(confirm),
                    None => deliver(&mut self.coordinator, now, Event::Adp(confirm)),
                }

                let Some(frame) = inspect(&request.nsdu) else {
                    return;
                };
                self.frames.push(frame);

                if let Some(index) = self.reachable(&frame.ext_addr) {
                    let indication = LbpIndication {
                        src_addr: Address::Short(COORDINATOR_SHORT_ADDR),
                        nsdu: request.nsdu,
                        link_quality: 200,
                        security_enabled: request.security_enabled,
                        media_type: request.media_type,
                    };
                    deliver(
                        &mut self.devices[index],
                        now,
                        Event::Adp(AdpIndication::Lbp(indication)),
                    );
                }
                return;
            }
            AdpRequest::Data {
                dst,
                handle,
                payload,
            } => {
                deliver(
                    &mut self.coordinator,
                    now,
                    Event::Adp(AdpIndication::DataConfirm {
                        handle,
                        status: Status::Success,
                    }),
                );

                let target = self.devices.iter().position(|device| {
                    device.client().map_or(false, |client| {
                        client.is_connected()
                            && client.short_addr() == dst
                            && !self.muted.contains(&client.ext_addr())
                    })
                });
                if let Some(index) = target {
                    let data = AdpIndication::Data {
                        src: COORDINATOR_SHORT_ADDR,
                        payload,
                    };
                    deliver(&mut self.devices[index], now, Event::Adp(data));
                }
                return;
            }
            AdpRequest::Reset => return,
        };

        deliver(&mut self.coordinator, now, Event::Adp(confirm));
    }

    fn from_device(&mut self, index: usize, request: AdpRequest) {
        let now = self.instant();
        let confirm = match request {
            AdpRequest::Discovery { .. } => {
                let mut descriptors = heapless::Vec::new();
                descriptors
                    .push(PanDescriptor {
                        pan_id: PAN_ID,
                        lba_addr: COORDINATOR_SHORT_ADDR,
                        link_quality: 200,
                        route_cost: 0,
                        media_type: MediaType::Plc,
                    })
                    .unwrap();
                AdpIndication::DiscoveryConfirm {
                    status: Status::Success,
                    descriptors,
                }
            }
            AdpRequest::NetworkStart { .. } => AdpIndication::NetworkStartConfirm {
                status: Status::InvalidRequest,
            },
            AdpRequest::Set(_) if self.stuck_modems.contains(&index) => return,
            AdpRequest::Set(attribute) => AdpIndication::SetConfirm {
                attribute: attribute.id(),
                status: Status::Success,
            },
            AdpRequest::RouteDiscovery { .. } => AdpIndication::RouteDiscoveryConfirm {
                status: Status::Success,
            },
            AdpRequest::Lbp(mut request) => {
                deliver(
                    &mut self.devices[index],
                    now,
                    Event::Adp(AdpIndication::LbpConfirm {
                        handle: request.handle,
                        status: Status::Success,
                    }),
                );

                let client = self.client(index);
                let (ext_addr, short_addr) = (client.ext_addr(), client.short_addr());
                if self.muted.contains(&ext_addr) {
                    return;
                }

                let Some(frame) = inspect(&request.nsdu) else {
                    return;
                };
                self.frames.push(frame);

                let mut copies = 1;
                if let Some((kind, subtype, tamper)) = self.tamper {
                    if frame.is(kind, subtype) {
                        self.tamper = None;
                        match tamper {
                            Tamper::Corrupt => {
                                if let Some(byte) = request.nsdu.last_mut() {
                                    *byte ^= 0x01;
                                }
                            }
                            Tamper::Replay => copies = 2,
                            Tamper::Drop => copies = 0,
                            Tamper::Capture => self.captured = Some(request.nsdu.clone()),
                        }
                    }
                }

                let src = if short_addr == BROADCAST_SHORT_ADDR {
                    COORDINATOR_SHORT_ADDR
                } else {
                    short_addr
                };
                for _ in 0..copies {
                    let indication = LbpIndication {
                        src_addr: Address::Short(src),
                        nsdu: request.nsdu.clone(),
                        link_quality: 200,
                        security_enabled: request.security_enabled,
                        media_type: request.media_type,
                    };
                    deliver(
                        &mut self.coordinator,
                        now,
                        Event::Adp(AdpIndication::Lbp(indication)),
                    );
                }
                return;
            }
            AdpRequest::Data {
                handle, payload, ..
            } => {
                deliver(
                    &mut self.devices[index],
                    now,
                    Event::Adp(AdpIndication::DataConfirm {
                        handle,
                        status: Status::Success,
                    }),
                );

                let client = self.client(index);
                if !self.muted.contains(&client.ext_addr()) {
                    let data = AdpIndication::Data {
                        src: client.short_addr(),
                        payload,
                    };
                    deliver(&mut self.coordinator, now, Event::Adp(data));
                }
                return;
            }
            AdpRequest::Reset => return,
        };

        deliver(&mut self.devices[index], now, Event::Adp(confirm));
    }
}
