//! The boundary between the protocol task and the rest of the firmware
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
use crate::adp::AdpRequest;
use crate::hif::HostMessage;
use crate::Error;

/// Sinks for everything the bootstrap state machines produce.
///
/// # Note
/// Implementations hand requests to the modem transport, which limits the number of requests in
/// flight. A request that cannot be queued is reported as [Error::Interface] and the state
/// machines treat it like a failed confirm.
pub trait G3Interface {
    /// Issue an ADP request to the modem.
    fn request(&mut self, request: AdpRequest) -> Result<(), Error>;

    /// Deliver a confirm or indication to the host application.
    fn notify(&mut self, message: HostMessage);
}
