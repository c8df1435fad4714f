//! G3-PLC bridge bootstrap core
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! The LoWPAN bootstrap protocol (LBP) of a G3-PLC/RF bridge. A coordinator runs the bootstrap
//! server, authenticates joining devices with EAP-PSK, hands out short addresses and group
//! master keys and supervises the PAN. A device runs the bootstrap client that discovers a PAN,
//! joins it and keeps its keys up to date.
//!
//! Everything is driven by [task::G3Task], which owns the state machines of the configured role
//! and consumes host requests, modem indications and timer expiries from a single queue.
#![cfg_attr(not(test), no_std)]

pub mod adp;
pub mod bootstrap;
pub mod error;
pub mod hif;
pub mod interface;
pub mod keep_alive;
pub mod last_gasp;
pub mod logger;
pub mod settings;
pub mod task;
pub mod timer;
mod wire;

pub use error::Error;
pub use task::{Event, G3Task};
