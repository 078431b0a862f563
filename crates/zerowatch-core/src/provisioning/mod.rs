//! Device provisioning: identity and credentials held in non-volatile memory
//!
//! The provisioning record is written once by an operator (provisioning mode)
//! and read at every boot. Nothing else at runtime touches the region.
//!
//! ## Region layout
//!
//! ```text
//! [0 .. 32)                   identity, NUL-padded
//! [32 .. 44)                  6 × u16 field lengths (little-endian)
//! [44 .. 44 + Σlengths)       field bytes, concatenated in schema order
//! ```
//!
//! The field order is fixed by [`layout::SCHEMA`]: Wi-Fi SSID, Wi-Fi password,
//! backend host, backend port (always 2 bytes), backend password, update host.

pub mod layout;
pub mod region;
pub mod store;

pub use layout::{FieldHeader, FieldKind, FieldSpec, SCHEMA};
pub use region::{NvRegion, RamRegion, RamRegionError};
pub use store::ProvisioningStore;

use alloc::string::String;
use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Size of the identity slot at the start of the region
pub const IDENTITY_SLOT_SIZE: usize = 32;

/// Offset of the configuration area (header + fields)
pub const CONFIG_BASE: usize = IDENTITY_SLOT_SIZE;

/// Bytes reserved for the configuration area
pub const CONFIG_REGION_SIZE: usize = 3192;

/// Total bytes the region must provide
pub const REGION_SIZE: usize = IDENTITY_SLOT_SIZE + CONFIG_REGION_SIZE;

/// Number of length-prefixed fields
pub const FIELD_COUNT: usize = 6;

/// Size of the length header (one u16 per field)
pub const HEADER_SIZE: usize = FIELD_COUNT * core::mem::size_of::<u16>();

/// Largest length any single variable field may have
pub const FIELD_LENGTH_LIMIT: usize = CONFIG_REGION_SIZE / 2;

/// The backend port is always stored as a little-endian u16
pub const PORT_FIELD_SIZE: usize = core::mem::size_of::<u16>();

/// Identity and secrets of a provisioned device.
///
/// `Debug` redacts both passwords so records can be logged safely.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRecord {
    /// Device hostname, the namespace prefix for every store key
    pub identity: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    /// Host of the shared key-value store
    pub backend_host: String,
    pub backend_port: u16,
    pub backend_password: String,
    /// Host serving firmware images
    pub update_host: String,
}

impl ProvisioningRecord {
    /// Run every integrity check, returning the first one that fails.
    pub fn check(&self) -> Result<(), ValidationError> {
        if self.identity.is_empty() {
            return Err(ValidationError::EmptyIdentity);
        }
        if self.identity.len() > IDENTITY_SLOT_SIZE {
            return Err(ValidationError::IdentityTooLong {
                len: self.identity.len(),
            });
        }

        for (spec, len) in SCHEMA.iter().zip(self.field_lengths()) {
            if len > FIELD_LENGTH_LIMIT {
                return Err(ValidationError::FieldTooLong {
                    field: spec.name,
                    len,
                    limit: FIELD_LENGTH_LIMIT,
                });
            }
        }

        if self.backend_port == 0 {
            return Err(ValidationError::ZeroPort);
        }

        Ok(())
    }

    /// Whether this record can be used to bring the device up.
    ///
    /// A `false` result means "not provisioned": callers halt with a
    /// diagnostic instead of retrying.
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Stored length of every field, in schema order
    pub fn field_lengths(&self) -> [usize; FIELD_COUNT] {
        [
            self.wifi_ssid.len(),
            self.wifi_password.len(),
            self.backend_host.len(),
            PORT_FIELD_SIZE,
            self.backend_password.len(),
            self.update_host.len(),
        ]
    }
}

impl fmt::Debug for ProvisioningRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRecord")
            .field("identity", &self.identity)
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &"<redacted>")
            .field("backend_host", &self.backend_host)
            .field("backend_port", &self.backend_port)
            .field("backend_password", &"<redacted>")
            .field("update_host", &self.update_host)
            .finish()
    }
}

/// Reasons a record is not usable
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("identity slot is empty")]
    EmptyIdentity,
    #[error("identity is {len} bytes, slot holds {}", IDENTITY_SLOT_SIZE)]
    IdentityTooLong { len: usize },
    #[error("field {field} is {len} bytes, limit is {limit}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
    #[error("backend port is zero")]
    ZeroPort,
}

/// Failures of the provisioning store. All of them are fatal at boot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("region too small: need {required} bytes, have {capacity}")]
    RegionTooSmall { required: usize, capacity: usize },
    #[error("store corrupt at {field}: expected {expected} bytes, got {actual}")]
    StoreCorrupt {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field {field} is not valid UTF-8")]
    Encoding { field: &'static str },
    #[error("fields need {required} bytes, configuration area holds {capacity}")]
    TooLarge { required: usize, capacity: usize },
    #[error("device not provisioned: {0}")]
    NotProvisioned(ValidationError),
    #[error("field {field} decoded to the wrong kind")]
    KindMismatch { field: &'static str },
    #[error("write-verify mismatch at {field}")]
    VerifyMismatch { field: &'static str },
    #[error("region fault: {0}")]
    Region(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProvisioningRecord {
        ProvisioningRecord {
            identity: String::from("ezero"),
            wifi_ssid: String::from("attic"),
            wifi_password: String::from("hunter22"),
            backend_host: String::from("10.0.0.5"),
            backend_port: 6379,
            backend_password: String::from("redispw"),
            update_host: String::from("updates.local"),
        }
    }

    #[test]
    fn test_valid_record() {
        assert!(sample().validate());
    }

    #[test]
    fn test_empty_identity_is_invalid() {
        let mut record = sample();
        record.identity.clear();
        assert_eq!(record.check(), Err(ValidationError::EmptyIdentity));
        assert!(!record.validate());
    }

    #[test]
    fn test_identity_longer_than_slot_is_invalid() {
        let mut record = sample();
        record.identity = "h".repeat(IDENTITY_SLOT_SIZE + 1);
        assert_eq!(
            record.check(),
            Err(ValidationError::IdentityTooLong { len: 33 })
        );
    }

    #[test]
    fn test_field_over_half_region_is_invalid() {
        let mut record = sample();
        record.update_host = "u".repeat(FIELD_LENGTH_LIMIT + 1);
        assert_eq!(
            record.check(),
            Err(ValidationError::FieldTooLong {
                field: "updateHost",
                len: FIELD_LENGTH_LIMIT + 1,
                limit: FIELD_LENGTH_LIMIT
            })
        );

        record.update_host = "u".repeat(FIELD_LENGTH_LIMIT);
        assert!(record.validate());
    }

    #[test]
    fn test_zero_port_is_invalid() {
        let mut record = sample();
        record.backend_port = 0;
        assert_eq!(record.check(), Err(ValidationError::ZeroPort));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = alloc::format!("{:?}", sample());
        assert!(rendered.contains("ezero"));
        assert!(!rendered.contains("hunter22"));
        assert!(!rendered.contains("redispw"));
    }
}
