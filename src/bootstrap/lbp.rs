//! LoWPAN Bootstrap Protocol framing
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! Every LBP message starts with a 10-byte header followed by the bootstrapping data, which is
//! either an EAP packet or a list of configuration parameters.
use crate::adp::{ExtendedAddress, MediaType, Nsdu, MAX_NSDU_LEN};
use crate::wire::{Deserializer, Serializer};
use crate::Error;
use bit_field::BitField;

pub const HEADER_LEN: usize = 10;

/// LBP message types. The wire code depends on the direction bit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// LBD to LBS: join request or EAP response.
    Joining,
    /// LBD to LBS: the device leaves the network.
    KickFromLbd,
    /// LBS to LBD: authentication succeeded, or cleartext parameters for a joined device.
    Accepted,
    /// LBS to LBD: EAP request.
    Challenge,
    /// LBS to LBD: authentication failed.
    Decline,
    /// LBS to LBD: the device is removed from the network.
    KickToLbd,
    Notification,
}

impl MessageType {
    /// The direction bit and 3-bit code of the message.
    fn bits(self) -> (bool, u8) {
        match self {
            MessageType::Joining => (true, 1),
            MessageType::KickFromLbd => (true, 4),
            MessageType::Accepted => (false, 1),
            MessageType::Challenge => (false, 2),
            MessageType::Decline => (false, 3),
            MessageType::KickToLbd => (false, 4),
            MessageType::Notification => (false, 5),
        }
    }

    fn from_bits(from_lbd: bool, code: u8) -> Result<Self, Error> {
        let kind = match (from_lbd, code) {
            (true, 1) => MessageType::Joining,
            (true, 4) => MessageType::KickFromLbd,
            (false, 1) => MessageType::Accepted,
            (false, 2) => MessageType::Challenge,
            (false, 3) => MessageType::Decline,
            (false, 4) => MessageType::KickToLbd,
            (false, 5) => MessageType::Notification,
            _ => return Err(Error::Invalid),
        };

        Ok(kind)
    }

    /// Check if the message travels from the bootstrap device to the server.
    pub fn from_lbd(self) -> bool {
        self.bits().0
    }
}

/// The fixed LBP header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub media_type: MediaType,
    pub disable_backup: bool,
    /// The EUI-64 of the bootstrap device the message is about.
    pub ext_addr: ExtendedAddress,
}

impl Header {
    pub fn new(kind: MessageType, ext_addr: ExtendedAddress, media_type: MediaType) -> Self {
        Self {
            kind,
            media_type,
            disable_backup: false,
            ext_addr,
        }
    }

    pub fn serialize(&self, serializer: &mut Serializer<'_>) -> Result<(), Error> {
        let (from_lbd, code) = self.kind.bits();

        let mut control = 0u8;
        control.set_bit(7, from_lbd);
        control.set_bits(4..7, code);
        control.set_bit(3, self.media_type.bit());
        control.set_bit(2, self.disable_backup);

        serializer.serialize_u8(control)?;
        serializer.serialize_u8(0)?;
        serializer.serialize_data(&self.ext_addr)
    }

    pub fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, Error> {
        let control = deserializer.deserialize_u8()?;
        let _reserved = deserializer.deserialize_u8()?;

        Ok(Self {
            kind: MessageType::from_bits(control.get_bit(7), control.get_bits(4..7))?,
            media_type: MediaType::from_bit(control.get_bit(3)),
            disable_backup: control.get_bit(2),
            ext_addr: deserializer.deserialize_array()?,
        })
    }
}

/// The kind of bootstrapping data following the header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Eap,
    Parameters,
}

impl Payload {
    /// Classify bootstrapping data by its first byte.
    ///
    /// # Note
    /// EAP codes occupy 1..=4, which decode as configuration attribute id 0. Attribute 0 is never
    /// assigned, so the two can't be confused.
    pub fn classify(data: &[u8]) -> Payload {
        match data.first() {
            None => Payload::Empty,
            Some(1..=4) => Payload::Eap,
            Some(_) => Payload::Parameters,
        }
    }
}

/// Split a received LBP message into its header and bootstrapping data.
pub fn decode(msg: &[u8]) -> Result<(Header, &[u8]), Error> {
    let mut deserializer = Deserializer::new(msg);
    let header = Header::deserialize(&mut deserializer)?;
    Ok((header, deserializer.remainder()))
}

/// Build an LBP message.
///
/// # Args
/// * `header` - The LBP header.
/// * `body` - Writes the bootstrapping data into the provided buffer and returns its length.
pub fn encode<F>(header: &Header, body: F) -> Result<Nsdu, Error>
where
    F: FnOnce(&mut [u8]) -> Result<usize, Error>,
{
    let mut buffer = [0u8; MAX_NSDU_LEN];
    let mut serializer = Serializer::new(&mut buffer);
    header.serialize(&mut serializer)?;

    let len = body(serializer.remainder())?;
    serializer.advance(len)?;
    let len = serializer.finish();

    Nsdu::from_slice(&buffer[..len]).map_err(|_| Error::Bounds)
}

/// Build an LBP message without bootstrapping data, e.g. a Kick or the first Joining.
pub fn encode_empty(header: &Header) -> Result<Nsdu, Error> {
    encode(header, |_| Ok(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EUI: ExtendedAddress = [0x00, 0x80, 0xE1, 0xFF, 0xFE, 0x00, 0x00, 0x07];

    #[test]
    fn header_layout() {
        let mut header = Header::new(MessageType::Joining, EUI, MediaType::Rf);
        header.disable_backup = true;

        let msg = encode(&header, |buf| {
            buf[..2].copy_from_slice(&[0xC5, 0x02]);
            Ok(2)
        })
        .unwrap();

        // T=1, code=1, media type RF, backup disabled.
        assert_eq!(msg[0], 0b1001_1100);
        assert_eq!(msg[1], 0);
        assert_eq!(&msg[2..10], &EUI);
        assert_eq!(&msg[10..], &[0xC5, 0x02]);

        let (decoded, data) = decode(&msg).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(Payload::classify(data), Payload::Parameters);
    }

    #[test]
    fn direction_selects_code() {
        let kick = encode_empty(&Header::new(MessageType::KickToLbd, EUI, MediaType::Plc)).unwrap();
        assert_eq!(kick[0], 0x40);
        assert_eq!(decode(&kick).unwrap().0.kind, MessageType::KickToLbd);

        let kick = encode_empty(&Header::new(MessageType::KickFromLbd, EUI, MediaType::Plc)).unwrap();
        assert_eq!(kick[0], 0xC0);
        assert!(decode(&kick).unwrap().0.kind.from_lbd());

        // Code 2 from an LBD is unassigned.
        let mut bad = kick.clone();
        bad[0] = 0xA0;
        assert_eq!(decode(&bad), Err(Error::Invalid));
        assert_eq!(decode(&kick[..9]), Err(Error::Invalid));
    }

    #[test]
    fn payload_classes() {
        assert_eq!(Payload::classify(&[]), Payload::Empty);
        assert_eq!(Payload::classify(&[2, 7, 0, 4]), Payload::Eap);
        assert_eq!(Payload::classify(&[0x77, 2, 0, 5]), Payload::Parameters);
    }
}
