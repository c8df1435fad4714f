//! Configuration-parameter TLVs carried in LBP bootstrapping data
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! Each parameter is encoded as an attribute byte (bit 0: configuration parameter flag, bit 1:
//! mandatory flag, bits 7..2: attribute id), a length byte and the value. The server delivers
//! the short address and GMKs inside the P-Channel of EAP-PSK message 3, and the device answers
//! with a Parameter-Result.
use crate::adp::BROADCAST_SHORT_ADDR;
use crate::wire::{Deserializer, Serializer};
use crate::Error;
use bit_field::BitField;
use eap_psk::Key;

pub const ATTR_SHORT_ADDR: u8 = 0x1D;
pub const ATTR_GMK: u8 = 0x27;
pub const ATTR_GMK_ACTIVATION: u8 = 0x2B;
pub const ATTR_GMK_REMOVAL: u8 = 0x2F;
pub const ATTR_PARAM_RESULT: u8 = 0x31;

/// The P-Channel extension type of G3 configuration parameters.
pub const EXT_TYPE_CONFIG: u8 = 0x02;

/// Sentinel of [encode_3_params] meaning "no GMK activation".
pub const NO_ACTIVE_INDEX: u8 = 0xFF;

/// The largest parameter list we ever build.
pub const MAX_PARAMS_LEN: usize = 64;

/// Processing result reported in a Parameter-Result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParamResult {
    Success = 0,
    Missing = 1,
    InvalidValue = 2,
    UnknownId = 3,
}

impl TryFrom<u8> for ParamResult {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(ParamResult::Success),
            1 => Ok(ParamResult::Missing),
            2 => Ok(ParamResult::InvalidValue),
            3 => Ok(ParamResult::UnknownId),
            _ => Err(Error::Invalid),
        }
    }
}

/// A parameter rejected by the receiver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub result: ParamResult,
    pub attr_id: u8,
}

/// One decoded configuration parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub attr_id: u8,
    pub mandatory: bool,
    pub value: &'a [u8],
}

/// Append one configuration parameter.
///
/// # Args
/// * `serializer` - The parameter list being built.
/// * `attr_id` - The 6-bit attribute id.
/// * `mandatory` - The receiver must reject the list if it does not understand the parameter.
/// * `value` - The encoded value.
pub fn encode(
    serializer: &mut Serializer<'_>,
    attr_id: u8,
    mandatory: bool,
    value: &[u8],
) -> Result<(), Error> {
    if value.len() > u8::MAX as usize || attr_id > 0x3F {
        return Err(Error::Invalid);
    }

    let mut attribute = 0u8;
    attribute.set_bit(0, true);
    attribute.set_bit(1, mandatory);
    attribute.set_bits(2..8, attr_id);

    serializer.serialize_u8(attribute)?;
    serializer.serialize_u8(value.len() as u8)?;
    serializer.serialize_data(value)
}

/// Iterator over the parameters of a list.
pub struct Tlvs<'a> {
    deserializer: Deserializer<'a>,
}

impl<'a> Tlvs<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            deserializer: Deserializer::new(data),
        }
    }

    fn next_tlv(&mut self) -> Result<Tlv<'a>, Error> {
        let attribute = self.deserializer.deserialize_u8()?;
        let len = self.deserializer.deserialize_u8()? as usize;
        let value = self.deserializer.try_take(len)?;

        Ok(Tlv {
            attr_id: attribute.get_bits(2..8),
            mandatory: attribute.get_bit(1),
            value,
        })
    }
}

impl<'a> Iterator for Tlvs<'a> {
    type Item = Result<Tlv<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.deserializer.is_empty() {
            return None;
        }

        let tlv = self.next_tlv();
        if tlv.is_err() {
            // A truncated parameter ends the list.
            self.deserializer.remainder();
        }
        Some(tlv)
    }
}

/// Compose the parameters of EAP-PSK message 3.
///
/// # Args
/// * `buf` - The output buffer.
/// * `short_addr` - The short address to assign. [BROADCAST_SHORT_ADDR] omits it.
/// * `gmk` - The GMKs to deliver at index 0 and 1. At least one must be present, otherwise
///   [Error::Invalid] is returned.
/// * `active_index` - The GMK index to activate. [NO_ACTIVE_INDEX] omits it.
///
/// # Returns
/// The length of the parameter list.
pub fn encode_3_params(
    buf: &mut [u8],
    short_addr: u16,
    gmk: &[Option<Key>; 2],
    active_index: u8,
) -> Result<usize, Error> {
    if gmk.iter().all(Option::is_none) {
        return Err(Error::Invalid);
    }

    let mut serializer = Serializer::new(buf);

    if short_addr != BROADCAST_SHORT_ADDR {
        encode(&mut serializer, ATTR_SHORT_ADDR, true, &short_addr.to_be_bytes())?;
    }

    for (index, key) in gmk.iter().enumerate() {
        if let Some(key) = key {
            let mut value = [0u8; 17];
            value[0] = index as u8;
            value[1..].copy_from_slice(key);
            encode(&mut serializer, ATTR_GMK, true, &value)?;
        }
    }

    if active_index != NO_ACTIVE_INDEX {
        encode(&mut serializer, ATTR_GMK_ACTIVATION, true, &[active_index])?;
    }

    Ok(serializer.finish())
}

/// Compose the cleartext parameters that activate and/or remove a GMK on a joined device.
pub fn encode_activation(
    buf: &mut [u8],
    active_index: Option<u8>,
    removed_index: Option<u8>,
) -> Result<usize, Error> {
    if active_index.is_none() && removed_index.is_none() {
        return Err(Error::Invalid);
    }

    let mut serializer = Serializer::new(buf);
    if let Some(index) = active_index {
        encode(&mut serializer, ATTR_GMK_ACTIVATION, true, &[index])?;
    }
    if let Some(index) = removed_index {
        encode(&mut serializer, ATTR_GMK_REMOVAL, true, &[index])?;
    }
    Ok(serializer.finish())
}

/// Compose a Parameter-Result.
pub fn encode_result(buf: &mut [u8], result: ParamResult, attr_id: u8) -> Result<usize, Error> {
    let mut serializer = Serializer::new(buf);
    encode(&mut serializer, ATTR_PARAM_RESULT, true, &[result as u8, attr_id])?;
    Ok(serializer.finish())
}

/// Check the parameters of EAP-PSK message 4, or of the answer to a GMK activation.
///
/// # Note
/// Only the Parameter-Result is expected. Any other parameter is ignored.
///
/// # Returns
/// Ok if the device reported success. Otherwise, the parameter the device rejected.
pub fn decode_4_params(data: &[u8]) -> Result<(), Rejection> {
    let malformed = Rejection {
        result: ParamResult::InvalidValue,
        attr_id: ATTR_PARAM_RESULT,
    };
    let mut outcome = Err(Rejection {
        result: ParamResult::Missing,
        attr_id: ATTR_PARAM_RESULT,
    });

    for tlv in Tlvs::new(data) {
        let tlv = tlv.map_err(|_| malformed)?;
        if tlv.attr_id != ATTR_PARAM_RESULT {
            log::debug!("Ignoring parameter {:#x}", tlv.attr_id);
            continue;
        }

        if tlv.value.len() != 2 {
            return Err(malformed);
        }

        let result = ParamResult::try_from(tlv.value[0]).map_err(|_| malformed)?;
        outcome = match result {
            ParamResult::Success => Ok(()),
            result => Err(Rejection {
                result,
                attr_id: tlv.value[1],
            }),
        };
    }

    if let Err(rejection) = outcome {
        log::warn!(
            "Device rejected parameter {:#x}: {:?}",
            rejection.attr_id,
            rejection.result
        );
    }

    outcome
}

/// Parameters received by a bootstrap device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Received {
    pub short_addr: Option<u16>,
    pub gmk: [Option<Key>; 2],
    pub active_index: Option<u8>,
    pub removed_index: Option<u8>,
}

/// Parse the parameters delivered to a bootstrap device.
///
/// # Note
/// Unknown parameters are ignored unless flagged mandatory.
pub fn decode_params(data: &[u8]) -> Result<Received, Rejection> {
    let mut received = Received::default();

    for tlv in Tlvs::new(data) {
        let tlv = tlv.map_err(|_| Rejection {
            result: ParamResult::InvalidValue,
            attr_id: 0,
        })?;
        let invalid = Rejection {
            result: ParamResult::InvalidValue,
            attr_id: tlv.attr_id,
        };

        match tlv.attr_id {
            ATTR_SHORT_ADDR => {
                let value: [u8; 2] = tlv.value.try_into().map_err(|_| invalid)?;
                let short_addr = u16::from_be_bytes(value);
                if short_addr == BROADCAST_SHORT_ADDR {
                    return Err(invalid);
                }
                received.short_addr = Some(short_addr);
            }
            ATTR_GMK => {
                if tlv.value.len() != 17 || tlv.value[0] > 1 {
                    return Err(invalid);
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&tlv.value[1..]);
                received.gmk[tlv.value[0] as usize] = Some(key);
            }
            ATTR_GMK_ACTIVATION | ATTR_GMK_REMOVAL => {
                if tlv.value.len() != 1 || tlv.value[0] > 1 {
                    return Err(invalid);
                }
                if tlv.attr_id == ATTR_GMK_ACTIVATION {
                    received.active_index = Some(tlv.value[0]);
                } else {
                    received.removed_index = Some(tlv.value[0]);
                }
            }
            id if tlv.mandatory => {
                return Err(Rejection {
                    result: ParamResult::UnknownId,
                    attr_id: id,
                })
            }
            id => log::debug!("Ignoring parameter {:#x}", id),
        }
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_byte_layout() {
        let mut buf = [0u8; 8];
        let mut serializer = Serializer::new(&mut buf);
        encode(&mut serializer, ATTR_SHORT_ADDR, true, &0x0005u16.to_be_bytes()).unwrap();
        assert_eq!(serializer.finish(), 4);
        assert_eq!(buf[..4], [0x77, 0x02, 0x00, 0x05]);

        let tlv = Tlvs::new(&buf[..4]).next().unwrap().unwrap();
        assert_eq!(tlv.attr_id, ATTR_SHORT_ADDR);
        assert!(tlv.mandatory);
        assert_eq!(tlv.value, &[0x00, 0x05]);
    }

    #[test]
    fn join_parameters_are_recovered() {
        let gmk0 = [0x11; 16];
        let gmk1 = [0x22; 16];
        let cases = [
            (0x0005, [Some(gmk0), None], 0),
            (0x1234, [Some(gmk0), Some(gmk1)], 1),
            (BROADCAST_SHORT_ADDR, [None, Some(gmk1)], NO_ACTIVE_INDEX),
        ];

        for (short_addr, gmk, active_index) in cases {
            let mut buf = [0u8; MAX_PARAMS_LEN];
            let len = encode_3_params(&mut buf, short_addr, &gmk, active_index).unwrap();
            let received = decode_params(&buf[..len]).unwrap();

            assert_eq!(
                received.short_addr,
                (short_addr != BROADCAST_SHORT_ADDR).then_some(short_addr)
            );
            assert_eq!(received.gmk, gmk);
            assert_eq!(
                received.active_index,
                (active_index != NO_ACTIVE_INDEX).then_some(active_index)
            );
        }
    }

    #[test]
    fn missing_gmk_rejected() {
        let mut buf = [0u8; MAX_PARAMS_LEN];
        assert_eq!(
            encode_3_params(&mut buf, 1, &[None, None], 0),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn parameter_result() {
        let mut buf = [0u8; 8];
        let len = encode_result(&mut buf, ParamResult::Success, 0).unwrap();
        assert_eq!(decode_4_params(&buf[..len]), Ok(()));

        let len = encode_result(&mut buf, ParamResult::InvalidValue, ATTR_GMK).unwrap();
        assert_eq!(
            decode_4_params(&buf[..len]),
            Err(Rejection {
                result: ParamResult::InvalidValue,
                attr_id: ATTR_GMK
            })
        );

        assert_eq!(decode_4_params(&[]).unwrap_err().result, ParamResult::Missing);

        // Other parameters are skipped.
        let mut serializer = Serializer::new(&mut buf);
        encode(&mut serializer, 0x20, false, &[1]).unwrap();
        let len = serializer.finish();
        let len = len + encode_result(&mut buf[len..], ParamResult::Success, 0).unwrap();
        assert_eq!(decode_4_params(&buf[..len]), Ok(()));
    }

    #[test]
    fn unknown_mandatory_parameter() {
        let mut buf = [0u8; 8];
        let mut serializer = Serializer::new(&mut buf);
        encode(&mut serializer, 0x3E, true, &[1, 2]).unwrap();
        let len = serializer.finish();

        assert_eq!(
            decode_params(&buf[..len]),
            Err(Rejection {
                result: ParamResult::UnknownId,
                attr_id: 0x3E
            })
        );

        // Truncated parameters are invalid.
        assert!(decode_params(&[0x77, 0x02, 0x00]).is_err());
    }

    #[test]
    fn activation_parameters() {
        let mut buf = [0u8; 8];
        let len = encode_activation(&mut buf, Some(1), Some(0)).unwrap();
        let received = decode_params(&buf[..len]).unwrap();
        assert_eq!(received.active_index, Some(1));
        assert_eq!(received.removed_index, Some(0));
        assert_eq!(received.short_addr, None);

        // Activation alone keeps the previous key.
        let len = encode_activation(&mut buf, Some(1), None).unwrap();
        let received = decode_params(&buf[..len]).unwrap();
        assert_eq!(received.active_index, Some(1));
        assert_eq!(received.removed_index, None);

        assert_eq!(encode_activation(&mut buf, None, None), Err(Error::Invalid));
    }
}
