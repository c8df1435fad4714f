//! Bootstrap primitives exchanged with the host application
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! Requests are answered by exactly one confirm carrying a [Status]. Indications are emitted
//! spontaneously by the bootstrap state machines.
use crate::adp::{ExtendedAddress, PanDescriptor, Status, MAX_PAN_DESCRIPTORS};
use crate::settings::restore::RestoreImage;
use crate::settings::Identity;
use eap_psk::Key;
use heapless::Vec;
use serde::Serialize;

pub type PanDescriptors = Vec<PanDescriptor, MAX_PAN_DESCRIPTORS>;

/// Failure causes of a re-keying procedure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum RekeyingError {
    None = 0,
    TableFull = 1,
    Procedure = 2,
    Msg2 = 3,
    Msg4 = 4,
    Param = 5,
    SetAttribute = 6,
    NoDevice = 7,
    Abort = 8,
}

/// Requests issued by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    ServerStart,
    ServerStop,
    ServerKick {
        ext_addr: ExtendedAddress,
    },
    ServerSetPsk {
        ext_addr: ExtendedAddress,
        psk: Key,
        /// The short address to assign, or the broadcast address to let the server choose.
        short_addr: u16,
    },
    ServerRekeying {
        gmk: Key,
    },
    ServerAbortRekeying,
    DeviceStart {
        restore: Option<RestoreImage>,
    },
    DeviceLeave,
    DevicePanSort {
        descriptors: PanDescriptors,
    },
}

/// Confirms and indications delivered to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    ServerStartConfirm {
        status: Status,
    },
    ServerStopConfirm {
        status: Status,
    },
    ServerKickConfirm {
        status: Status,
    },
    ServerSetPskConfirm {
        status: Status,
    },
    ServerRekeyingConfirm {
        status: Status,
        error: RekeyingError,
    },
    ServerAbortRekeyingConfirm {
        status: Status,
    },
    ServerJoinIndication {
        ext_addr: ExtendedAddress,
        short_addr: u16,
    },
    ServerLeaveIndication {
        ext_addr: ExtendedAddress,
        short_addr: u16,
    },
    ServerGetPskIndication {
        ext_addr: ExtendedAddress,
        idp: Identity,
    },
    LastGaspIndication {
        ext_addr: ExtendedAddress,
        short_addr: u16,
    },
    DeviceStartConfirm {
        status: Status,
        short_addr: u16,
        pan_id: u16,
    },
    DeviceLeaveConfirm {
        status: Status,
    },
    DeviceLeaveIndication,
    DevicePanSortIndication {
        descriptors: PanDescriptors,
    },
    DevicePanSortConfirm {
        status: Status,
    },
    DeviceRestoreIndication {
        image: RestoreImage,
    },
}
