//! Fast-restore snapshot of a device connection
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
//!
//! # Description
//! A joined device hands this record to the host for persistence after every successful join or
//! re-key. Handing it back at start-up lets the device resume its PAN membership without a new
//! bootstrap. The stored image is a big-endian CRC-32 followed by the postcard encoding of the
//! record.
use super::{SemVersion, EXPECTED_VERSION};
use crate::adp::MediaType;
use crate::Error;
use eap_psk::Key;
use heapless::Vec;
use serde::{Deserialize, Serialize};

/// The largest serialized restore record.
pub const MAX_RESTORE_LEN: usize = 64;

pub type RestoreImage = Vec<u8, MAX_RESTORE_LEN>;

/// The network parameters a device needs to resume its PAN membership.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct RestoreRecord {
    version: SemVersion,
    pub pan_id: u16,
    pub short_addr: u16,
    pub lba_addr: u16,
    pub media_type: MediaType,
    pub gmk: [Option<Key>; 2],
    pub active_index: u8,
}

impl RestoreRecord {
    pub fn new(
        pan_id: u16,
        short_addr: u16,
        lba_addr: u16,
        media_type: MediaType,
        gmk: [Option<Key>; 2],
        active_index: u8,
    ) -> Self {
        Self {
            version: EXPECTED_VERSION,
            pan_id,
            short_addr,
            lba_addr,
            media_type,
            gmk,
            active_index,
        }
    }

    /// Serialize the record into a storable image.
    pub fn serialize(&self) -> Result<RestoreImage, Error> {
        let mut buffer = [0u8; MAX_RESTORE_LEN];
        let len = postcard::to_slice(self, &mut buffer[4..])
            .map_err(|_| Error::Bounds)?
            .len();

        let crc32 = calculate_crc32(&buffer[4..4 + len]);
        buffer[..4].copy_from_slice(&crc32.to_be_bytes());

        Vec::from_slice(&buffer[..4 + len]).map_err(|_| Error::Bounds)
    }

    /// Attempt to deserialize a record from a stored image.
    ///
    /// # Returns
    /// The record if the CRC matched and the version is understood. Otherwise, an error.
    pub fn try_deserialize(image: &[u8]) -> Result<Self, Error> {
        if image.len() < 4 {
            return Err(Error::Invalid);
        }

        let (crc, data) = image.split_at(4);
        if u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]) != calculate_crc32(data) {
            log::warn!("Restore record CRC mismatch");
            return Err(Error::Invalid);
        }

        let record: RestoreRecord = postcard::from_bytes(data).map_err(|_| Error::Invalid)?;
        if !record.version.is_compatible_with(&EXPECTED_VERSION) {
            return Err(Error::Invalid);
        }

        if record.active_index > 1 || record.gmk[record.active_index as usize].is_none() {
            return Err(Error::Invalid);
        }

        Ok(record)
    }
}

fn calculate_crc32(data: &[u8]) -> u32 {
    let mut crc32 = crc_any::CRC::crc32();
    crc32.digest(data);
    crc32.get_crc() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RestoreRecord {
        RestoreRecord::new(0x781D, 0x0005, 0x0000, MediaType::Plc, [Some([7; 16]), None], 0)
    }

    #[test]
    fn image_is_restored() {
        let image = record().serialize().unwrap();
        assert_eq!(RestoreRecord::try_deserialize(&image), Ok(record()));
    }

    #[test]
    fn corrupt_image_rejected() {
        let mut image = record().serialize().unwrap();
        let last = image.len() - 1;
        image[last] ^= 0x01;
        assert_eq!(RestoreRecord::try_deserialize(&image), Err(Error::Invalid));
        assert_eq!(RestoreRecord::try_deserialize(&[0, 1]), Err(Error::Invalid));
    }

    #[test]
    fn inactive_key_rejected() {
        let mut bad = record();
        bad.active_index = 1;
        let image = bad.serialize().unwrap();
        assert_eq!(RestoreRecord::try_deserialize(&image), Err(Error::Invalid));
    }
}
