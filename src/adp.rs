//! Definitions of the ADP primitives exchanged with the ST8500 modem
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! The host-interface transport parses modem frames into these primitives before they reach the
//! protocol task, and serializes the requests produced by the task. Only the fields the bootstrap
//! core consumes or produces are modelled.
use eap_psk::Key;
use heapless::Vec;
use serde::{Deserialize, Serialize};

/// An EUI-64 extended address.
pub type ExtendedAddress = [u8; 8];

/// The short address of the PAN coordinator.
pub const COORDINATOR_SHORT_ADDR: u16 = 0x0000;

/// The broadcast short address. As a configuration value it means "do not assign".
pub const BROADCAST_SHORT_ADDR: u16 = 0xFFFF;

/// The largest NSDU carried by an LBP request or indication.
pub const MAX_NSDU_LEN: usize = 256;

/// The largest payload of the auxiliary keep-alive and last-gasp frames.
pub const MAX_DATA_LEN: usize = 16;

/// The maximum number of PAN descriptors returned by a discovery.
pub const MAX_PAN_DESCRIPTORS: usize = 16;

pub type Nsdu = Vec<u8, MAX_NSDU_LEN>;
pub type DataPayload = Vec<u8, MAX_DATA_LEN>;

/// G3 result codes as reported by the modem and forwarded to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    InvalidRequest,
    Failed,
    Busy,
    ChannelAccessFailure,
    InvalidParameter,
    NoAck,
    NoBeacon,
    TransactionExpired,
    Timeout,
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Status::Success,
            0xA1 => Status::InvalidRequest,
            0xA2 => Status::Failed,
            0xA3 => Status::Busy,
            0xE1 => Status::ChannelAccessFailure,
            0xE8 => Status::InvalidParameter,
            0xE9 => Status::NoAck,
            0xEA => Status::NoBeacon,
            0xF0 => Status::TransactionExpired,
            0xFE => Status::Timeout,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        match status {
            Status::Success => 0x00,
            Status::InvalidRequest => 0xA1,
            Status::Failed => 0xA2,
            Status::Busy => 0xA3,
            Status::ChannelAccessFailure => 0xE1,
            Status::InvalidParameter => 0xE8,
            Status::NoAck => 0xE9,
            Status::NoBeacon => 0xEA,
            Status::TransactionExpired => 0xF0,
            Status::Timeout => 0xFE,
            Status::Unknown(other) => other,
        }
    }
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// The physical medium a frame travelled on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaType {
    #[default]
    Plc,
    Rf,
}

impl MediaType {
    /// The value of the LBP media-type bit.
    pub fn bit(self) -> bool {
        matches!(self, MediaType::Rf)
    }

    pub fn from_bit(bit: bool) -> Self {
        if bit {
            MediaType::Rf
        } else {
            MediaType::Plc
        }
    }
}

/// A G3 network address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Address {
    Short(u16),
    Extended(ExtendedAddress),
}

/// A PAN found by an active discovery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanDescriptor {
    pub pan_id: u16,
    pub lba_addr: u16,
    pub link_quality: u8,
    pub route_cost: u16,
    pub media_type: MediaType,
}

/// ADP and MAC information-base attributes written by the bootstrap state machines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attribute {
    PanId(u16),
    ShortAddress(u16),
    Gmk { index: u8, key: Key },
    GmkRemoval { index: u8 },
    ActiveKeyIndex(u8),
}

/// The identifier of an [Attribute], used to match set confirms.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttributeId {
    PanId,
    ShortAddress,
    Gmk,
    GmkRemoval,
    ActiveKeyIndex,
}

impl Attribute {
    pub fn id(&self) -> AttributeId {
        match self {
            Attribute::PanId(_) => AttributeId::PanId,
            Attribute::ShortAddress(_) => AttributeId::ShortAddress,
            Attribute::Gmk { .. } => AttributeId::Gmk,
            Attribute::GmkRemoval { .. } => AttributeId::GmkRemoval,
            Attribute::ActiveKeyIndex(_) => AttributeId::ActiveKeyIndex,
        }
    }
}

/// An ADPM-LBP.request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbpRequest {
    pub dst: Address,
    pub nsdu: Nsdu,
    pub handle: u8,
    pub max_hops: u8,
    pub discover_route: bool,
    pub qos: u8,
    pub security_enabled: bool,
    pub media_type: MediaType,
    pub disable_backup: bool,
}

/// Requests issued by the protocol task towards the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdpRequest {
    Lbp(LbpRequest),
    Discovery { duration_s: u8 },
    NetworkStart { pan_id: u16 },
    Set(Attribute),
    RouteDiscovery { dst: u16, max_hops: u8 },
    Data {
        dst: u16,
        handle: u8,
        payload: DataPayload,
    },
    Reset,
}

/// An ADPM-LBP.indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbpIndication {
    /// The sender of the frame: the LBA relaying for a joining device, or a joined device.
    pub src_addr: Address,
    pub nsdu: Nsdu,
    pub link_quality: u8,
    pub security_enabled: bool,
    pub media_type: MediaType,
}

/// Indications and confirms delivered by the modem to the protocol task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdpIndication {
    Lbp(LbpIndication),
    LbpConfirm {
        handle: u8,
        status: Status,
    },
    DiscoveryConfirm {
        status: Status,
        descriptors: Vec<PanDescriptor, MAX_PAN_DESCRIPTORS>,
    },
    NetworkStartConfirm {
        status: Status,
    },
    SetConfirm {
        attribute: AttributeId,
        status: Status,
    },
    RouteDiscoveryConfirm {
        status: Status,
    },
    Data {
        src: u16,
        payload: DataPayload,
    },
    DataConfirm {
        handle: u8,
        status: Status,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        for code in [0x00u8, 0xA1, 0xA2, 0xE1, 0xE9, 0xEA, 0xFE, 0x42] {
            assert_eq!(u8::from(Status::from(code)), code);
        }
        assert!(Status::from(0).is_success());
        assert_eq!(Status::from(0x42), Status::Unknown(0x42));
    }
}
