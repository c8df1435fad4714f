//! G3 bridge runtime settings
//!
//! # Copyright
//! Copyright (C) 2020 QUARTIQ GmbH - All Rights Reserved
//! Unauthorized usage, editing, or copying is strictly prohibited.
//! Proprietary and confidential.
pub mod restore;

use crate::adp::{ExtendedAddress, MediaType};
use crate::Error;
use eap_psk::Key;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub use restore::RestoreRecord;

/// The longest EAP-PSK identity (ID_S or ID_P) supported.
pub const MAX_IDENTITY_LEN: usize = 36;

pub type Identity = Vec<u8, MAX_IDENTITY_LEN>;

/// The expected semver of the settings. This version must be updated whenever the layout of
/// [G3Settings] or [RestoreRecord] changes.
pub const EXPECTED_VERSION: SemVersion = SemVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// A semantic version control for recording software versions.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Copy, Clone, Debug)]
pub struct SemVersion {
    major: u8,
    minor: u8,
    patch: u8,
}

impl SemVersion {
    /// Determine if this version is compatible with `rhs`.
    pub fn is_compatible_with(&self, rhs: &SemVersion) -> bool {
        (self.major == rhs.major) && (self.minor <= rhs.minor)
    }
}

/// The bootstrap role of the bridge.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// PAN coordinator running the LoWPAN bootstrap server.
    Coordinator,
    /// Device joining a PAN as bootstrap client.
    Device,
}

/// Settings of the LoWPAN bootstrap server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    pub pan_id: u16,

    /// The EAP-PSK identity of the server (ID_S).
    pub ids: Identity,

    /// The GMK installed at index 0 when the network starts.
    pub gmk: Key,

    /// The PSK used for devices missing from the PSK table, if any.
    pub default_psk: Option<Key>,

    /// Request unknown PSKs from the host instead of declining.
    pub psk_from_host: bool,

    pub discovery_duration_s: u8,
    pub max_hops: u8,
    pub ttl_ms: u32,
    pub ignore_time_ms: u32,
    pub psk_get_timeout_ms: u32,
    pub rekeying_phase_delay_ms: u32,
    pub rekeying_msg_timeout_ms: u32,
    pub sweep_period_ms: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let mut ids = Identity::new();
        ids.extend_from_slice(b"g3-lbs").ok();

        Self {
            pan_id: 0x781D,
            ids,
            gmk: [
                0xAF, 0x4D, 0x6D, 0xCC, 0xF1, 0x4D, 0xE7, 0xC1, 0xC4, 0x23, 0x5E, 0x6F, 0xEF, 0x6C,
                0x15, 0x1F,
            ],
            default_psk: None,
            psk_from_host: true,
            discovery_duration_s: 5,
            max_hops: 8,
            ttl_ms: 70_000,
            ignore_time_ms: 500,
            psk_get_timeout_ms: 10_000,
            rekeying_phase_delay_ms: 1_000,
            rekeying_msg_timeout_ms: 20_000,
            sweep_period_ms: 10_000,
        }
    }
}

/// Settings of the LoWPAN bootstrap client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSettings {
    pub psk: Key,

    /// The EAP-PSK identity of the device (ID_P). Empty means the EUI-64 is used.
    pub idp: Identity,

    /// PAN descriptors with a lower link quality are never joined.
    pub lqi_threshold: u8,
    pub discovery_duration_s: u8,
    pub max_join_retries: u8,
    pub rand_wait_ms: u32,
    pub start_wait_ms: u32,
    pub msg_timeout_ms: u32,
    pub pansort_from_host: bool,
    pub pansort_timeout_ms: u32,
    pub route_discovery: bool,
    pub max_hops: u8,
    pub fast_restore: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            psk: [
                0xAB, 0x10, 0x34, 0x11, 0x45, 0x11, 0x1B, 0xC3, 0xC1, 0x2D, 0xE8, 0xFF, 0x11, 0x14,
                0x22, 0x04,
            ],
            idp: Identity::new(),
            lqi_threshold: 52,
            discovery_duration_s: 5,
            max_join_retries: 10,
            rand_wait_ms: 30_000,
            start_wait_ms: 1_000,
            msg_timeout_ms: 40_000,
            pansort_from_host: false,
            pansort_timeout_ms: 5_000,
            route_discovery: true,
            max_hops: 8,
            fast_restore: false,
        }
    }
}

/// Settings of the keep-alive supervision of joined devices.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub enabled: bool,
    pub period_ms: u32,
    pub timeout_ms: u32,

    /// Consecutive unanswered pings before a device is considered gone.
    pub lives: u8,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            period_ms: 60_000,
            timeout_ms: 10_000,
            lives: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LastGaspSettings {
    pub enabled: bool,
    pub repetitions: u8,
    pub interval_ms: u32,
}

impl Default for LastGaspSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            repetitions: 3,
            interval_ms: 100,
        }
    }
}

/// Bridge-wide configurable settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct G3Settings {
    version: SemVersion,

    pub role: Role,
    pub ext_addr: ExtendedAddress,
    pub media_type: MediaType,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub keep_alive: KeepAliveSettings,
    pub last_gasp: LastGaspSettings,
}

impl Default for G3Settings {
    fn default() -> Self {
        Self {
            version: EXPECTED_VERSION,
            role: Role::Coordinator,
            ext_addr: [0x02, 0x80, 0xE1, 0x00, 0x00, 0x00, 0x00, 0x01],
            media_type: MediaType::Plc,
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            keep_alive: KeepAliveSettings::default(),
            last_gasp: LastGaspSettings::default(),
        }
    }
}

impl G3Settings {
    /// Load settings from their JSON representation.
    ///
    /// # Note
    /// Missing fields take their default value.
    ///
    /// # Args
    /// * `data` - The serialized settings.
    pub fn from_json(data: &[u8]) -> Result<Self, Error> {
        let (settings, _): (G3Settings, usize) =
            serde_json_core::from_slice(data).map_err(|_| Error::Invalid)?;

        // Settings from some future version that we don't understand are rejected.
        if !settings.version.is_compatible_with(&EXPECTED_VERSION) {
            log::error!("Incompatible settings version {:?}", settings.version);
            return Err(Error::Invalid);
        }

        if !settings.validate() {
            return Err(Error::Invalid);
        }

        Ok(settings)
    }

    pub fn validate(&self) -> bool {
        if self.ext_addr == [0; 8] {
            log::error!("The extended address must not be all-zero");
            return false;
        }

        if self.role == Role::Coordinator && self.server.ids.is_empty() {
            log::error!("The server identity must not be empty");
            return false;
        }

        let keep_alive = &self.keep_alive;
        if keep_alive.enabled && (keep_alive.lives == 0 || keep_alive.timeout_ms >= keep_alive.period_ms)
        {
            log::error!("Keep-alive needs at least one life and a timeout shorter than the period");
            return false;
        }

        if self.client.max_join_retries == 0 {
            log::error!("At least one join attempt is required");
            return false;
        }

        true
    }

    /// The EAP-PSK identity of this device as bootstrap client.
    pub fn device_identity(&self) -> Identity {
        if self.client.idp.is_empty() {
            let mut idp = Identity::new();
            idp.extend_from_slice(&self.ext_addr).ok();
            idp
        } else {
            self.client.idp.clone()
        }
    }
}
