//! Error type definitions for the G3 bridge firmware
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.

/// An enumeration of possible errors in the bootstrap core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum Error {
    /// Malformed or truncated data.
    Invalid,
    /// The request is not valid in the current state.
    InvalidState,
    /// The addressed entry or device does not exist.
    NotPresent,
    /// The modem or host interface refused the request.
    Interface,
    /// A fixed-capacity buffer or queue is exhausted.
    Bounds,
    /// A MAC, tag, RAND or nonce check failed.
    Authentication,
    /// No free slot in a bounded table.
    TableFull,
    /// Another procedure is already running.
    Busy,
}

impl From<eap_psk::Error> for Error {
    fn from(error: eap_psk::Error) -> Self {
        match error {
            eap_psk::Error::Length | eap_psk::Error::Format => Error::Invalid,
            eap_psk::Error::Rand
            | eap_psk::Error::Mac
            | eap_psk::Error::Tag
            | eap_psk::Error::Nonce => Error::Authentication,
        }
    }
}
