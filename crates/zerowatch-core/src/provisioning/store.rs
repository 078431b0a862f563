//! Provisioning store: load, validate and write the device's credentials

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error, info};

use super::layout::{self, EncodedConfig, FieldHeader, SCHEMA};
use super::{
    CONFIG_BASE, HEADER_SIZE, IDENTITY_SLOT_SIZE, NvRegion, ProvisioningError,
    ProvisioningRecord, REGION_SIZE,
};

/// Exclusive owner of the provisioning region.
///
/// The region is only ever written through [`write`](Self::write) and
/// [`erase`](Self::erase), both of which belong to the privileged
/// provisioning path. Normal boot only calls [`boot`](Self::boot).
pub struct ProvisioningStore<R: NvRegion> {
    region: R,
}

impl<R: NvRegion> ProvisioningStore<R> {
    pub fn new(region: R) -> Result<Self, ProvisioningError> {
        let capacity = region.capacity();
        if capacity < REGION_SIZE {
            return Err(ProvisioningError::RegionTooSmall {
                required: REGION_SIZE,
                capacity,
            });
        }
        Ok(Self { region })
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut R {
        &mut self.region
    }

    pub fn into_inner(self) -> R {
        self.region
    }

    /// Read the identity slot, the length header and every field.
    ///
    /// Any short read is reported as [`ProvisioningError::StoreCorrupt`].
    /// The result is not validated; see [`boot`](Self::boot).
    pub fn load(&mut self) -> Result<ProvisioningRecord, ProvisioningError> {
        let mut slot = [0u8; IDENTITY_SLOT_SIZE];
        self.read_exact(0, &mut slot, "identity")?;
        let end = slot
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IDENTITY_SLOT_SIZE);
        let identity = core::str::from_utf8(&slot[..end])
            .map_err(|_| ProvisioningError::Encoding { field: "identity" })?;

        let mut raw = [0u8; HEADER_SIZE];
        self.read_exact(CONFIG_BASE, &mut raw, "header")?;
        let header = FieldHeader::from_bytes(&raw);
        debug!("provisioning: field lengths {:?}", header.lengths);

        let mut offset = CONFIG_BASE + HEADER_SIZE;
        let mut values = Vec::with_capacity(SCHEMA.len());
        for (spec, &len) in SCHEMA.iter().zip(&header.lengths) {
            let mut buf = vec![0u8; len as usize];
            self.read_exact(offset, &mut buf, spec.name)?;
            values.push(layout::decode_field(spec, &buf)?);
            offset += len as usize;
        }

        layout::assemble(String::from(identity), values)
    }

    /// Load and validate; the only call made on a normal boot.
    ///
    /// An invalid record becomes [`ProvisioningError::NotProvisioned`]
    /// carrying the first failed check as operator diagnostic.
    pub fn boot(&mut self) -> Result<ProvisioningRecord, ProvisioningError> {
        let record = self.load()?;
        record.check().map_err(ProvisioningError::NotProvisioned)?;
        info!(
            "provisioning: identity '{}', backend {}:{}",
            record.identity, record.backend_host, record.backend_port
        );
        Ok(record)
    }

    /// Persist a record, then read it back and compare every field.
    ///
    /// Nothing is written if the record fails validation. A verify mismatch
    /// means the region cannot be trusted and the session must halt.
    pub fn write(&mut self, record: &ProvisioningRecord) -> Result<(), ProvisioningError> {
        record.check().map_err(ProvisioningError::NotProvisioned)?;
        let encoded = layout::encode(record)?;
        debug!("provisioning: writing field lengths {:?}", encoded.header.lengths);

        let mut slot = [0u8; IDENTITY_SLOT_SIZE];
        slot[..record.identity.len()].copy_from_slice(record.identity.as_bytes());
        self.write_exact(0, &slot, "identity")?;
        self.write_exact(CONFIG_BASE, &encoded.header.to_bytes(), "header")?;

        let mut offset = CONFIG_BASE + HEADER_SIZE;
        for (index, spec) in SCHEMA.iter().enumerate() {
            let field = encoded.field(index);
            self.write_exact(offset, field, spec.name)?;
            offset += field.len();
        }

        self.region.commit().map_err(region_fault)?;
        info!("provisioning: write committed, verifying");

        let stored = self.boot()?;
        verify(record, &encoded, &stored)?;
        info!("provisioning: verified {} bytes", offset);
        Ok(())
    }

    /// Zero the whole region and commit.
    pub fn erase(&mut self) -> Result<(), ProvisioningError> {
        let zeros = vec![0u8; REGION_SIZE];
        self.write_exact(0, &zeros, "region")?;
        self.region.commit().map_err(region_fault)?;
        info!("provisioning: region erased");
        Ok(())
    }

    fn read_exact(
        &mut self,
        offset: usize,
        buf: &mut [u8],
        field: &'static str,
    ) -> Result<(), ProvisioningError> {
        let read = self.region.read_bytes(offset, buf).map_err(region_fault)?;
        if read != buf.len() {
            error!(
                "provisioning: short read of {} ({} of {} bytes)",
                field,
                read,
                buf.len()
            );
            return Err(ProvisioningError::StoreCorrupt {
                field,
                expected: buf.len(),
                actual: read,
            });
        }
        Ok(())
    }

    fn write_exact(
        &mut self,
        offset: usize,
        data: &[u8],
        field: &'static str,
    ) -> Result<(), ProvisioningError> {
        let written = self.region.write_bytes(offset, data).map_err(region_fault)?;
        if written != data.len() {
            error!(
                "provisioning: short write of {} ({} of {} bytes)",
                field,
                written,
                data.len()
            );
            return Err(ProvisioningError::StoreCorrupt {
                field,
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }
}

fn verify(
    expected: &ProvisioningRecord,
    encoded: &EncodedConfig,
    stored: &ProvisioningRecord,
) -> Result<(), ProvisioningError> {
    if expected.identity != stored.identity {
        return Err(ProvisioningError::VerifyMismatch { field: "identity" });
    }

    let readback = layout::encode(stored)?;
    for (index, spec) in SCHEMA.iter().enumerate() {
        if encoded.field(index) != readback.field(index) {
            error!("provisioning: {} differs after write", spec.name);
            return Err(ProvisioningError::VerifyMismatch { field: spec.name });
        }
    }
    Ok(())
}

fn region_fault<E: core::fmt::Debug>(e: E) -> ProvisioningError {
    ProvisioningError::Region(format!("{:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioning::{RamRegion, RamRegionError, ValidationError};

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

    fn store() -> ProvisioningStore<RamRegion> {
        ProvisioningStore::new(RamRegion::new(REGION_SIZE)).unwrap()
    }

    /// Region that flips one committed byte, as a worn flash page might
    struct BitRotRegion {
        inner: RamRegion,
        rot_at: usize,
    }

    impl NvRegion for BitRotRegion {
        type Error = RamRegionError;

        fn capacity(&self) -> usize {
            self.inner.capacity()
        }

        fn read_bytes(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, Self::Error> {
            self.inner.read_bytes(offset, buf)
        }

        fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize, Self::Error> {
            self.inner.write_bytes(offset, data)
        }

        fn commit(&mut self) -> Result<(), Self::Error> {
            self.inner.commit()?;
            let byte = self.inner.contents()[self.rot_at] ^ 0x20;
            self.inner.poke(self.rot_at, &[byte]);
            Ok(())
        }
    }

    #[test]
    fn test_write_then_boot_round_trip() {
        let mut store = store();
        let record = sample();

        store.write(&record).unwrap();
        let loaded = store.boot().unwrap();

        assert_eq!(loaded, record);
        assert!(loaded.validate());
        assert_eq!(store.region().commit_count(), 1);
    }

    #[test]
    fn test_layout_on_region() {
        let mut store = store();
        store.write(&sample()).unwrap();
        let bytes = store.region().contents();

        assert_eq!(&bytes[0..5], b"ezero");
        assert!(bytes[5..IDENTITY_SLOT_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&bytes[CONFIG_BASE..CONFIG_BASE + 2], &[5, 0]);
        assert_eq!(&bytes[CONFIG_BASE + 12..CONFIG_BASE + 17], b"attic");
    }

    #[test]
    fn test_identity_filling_whole_slot_round_trips() {
        let mut store = store();
        let mut record = sample();
        record.identity = "x".repeat(IDENTITY_SLOT_SIZE);

        store.write(&record).unwrap();
        assert_eq!(store.boot().unwrap().identity.len(), IDENTITY_SLOT_SIZE);
    }

    #[test]
    fn test_empty_fields_round_trip() {
        let mut store = store();
        let mut record = sample();
        record.wifi_password.clear();
        record.backend_password.clear();

        store.write(&record).unwrap();
        assert_eq!(store.boot().unwrap(), record);
    }

    #[test]
    fn test_write_rejects_invalid_record_without_touching_region() {
        let mut store = store();
        let mut record = sample();
        record.backend_port = 0;

        assert_eq!(
            store.write(&record),
            Err(ProvisioningError::NotProvisioned(ValidationError::ZeroPort))
        );
        assert_eq!(store.region().commit_count(), 0);
    }

    #[test]
    fn test_erased_region_is_not_provisioned() {
        let mut store = store();
        assert_eq!(
            store.boot(),
            Err(ProvisioningError::NotProvisioned(
                ValidationError::EmptyIdentity
            ))
        );
    }

    #[test]
    fn test_erase_wipes_provisioning() {
        let mut store = store();
        store.write(&sample()).unwrap();
        store.erase().unwrap();

        assert!(store.region().contents().iter().all(|&b| b == 0));
        assert!(matches!(
            store.boot(),
            Err(ProvisioningError::NotProvisioned(_))
        ));
    }

    #[test]
    fn test_short_read_is_store_corrupt() {
        let mut store = store();
        store.write(&sample()).unwrap();
        // header ends at 44; cut the read inside the SSID field
        store.region_mut().truncate_reads_at(CONFIG_BASE + HEADER_SIZE + 3);

        assert_eq!(
            store.load(),
            Err(ProvisioningError::StoreCorrupt {
                field: "wifiSsid",
                expected: 5,
                actual: 3
            })
        );
    }

    #[test]
    fn test_short_header_read_is_store_corrupt() {
        let mut store = store();
        store.region_mut().truncate_reads_at(CONFIG_BASE + 4);

        assert!(matches!(
            store.load(),
            Err(ProvisioningError::StoreCorrupt {
                field: "header",
                ..
            })
        ));
    }

    #[test]
    fn test_lengths_past_region_end_are_store_corrupt() {
        let mut store = store();
        store.write(&sample()).unwrap();
        let header = FieldHeader {
            lengths: [u16::MAX, 0, 0, 2, 0, 0],
        };
        store.region_mut().poke(CONFIG_BASE, &header.to_bytes());

        assert!(matches!(
            store.load(),
            Err(ProvisioningError::StoreCorrupt {
                field: "wifiSsid",
                ..
            })
        ));
    }

    #[test]
    fn test_bad_port_length_is_store_corrupt() {
        let mut store = store();
        store.write(&sample()).unwrap();
        let header = FieldHeader {
            lengths: [5, 8, 8, 3, 7, 13],
        };
        store.region_mut().poke(CONFIG_BASE, &header.to_bytes());

        assert!(matches!(
            store.load(),
            Err(ProvisioningError::StoreCorrupt {
                field: "backendPort",
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_short_write_is_fatal() {
        let mut store = store();
        store.region_mut().truncate_writes_at(CONFIG_BASE + HEADER_SIZE + 10);

        assert!(matches!(
            store.write(&sample()),
            Err(ProvisioningError::StoreCorrupt { .. })
        ));
        assert_eq!(store.region().commit_count(), 0);
    }

    #[test]
    fn test_rejected_commit_is_region_fault() {
        let mut store = store();
        store.region_mut().reject_commits(true);

        assert!(matches!(
            store.write(&sample()),
            Err(ProvisioningError::Region(_))
        ));
    }

    #[test]
    fn test_write_verify_catches_silent_corruption() {
        // second byte of the Wi-Fi password
        let rot_at = CONFIG_BASE + HEADER_SIZE + 5 + 1;
        let region = BitRotRegion {
            inner: RamRegion::new(REGION_SIZE),
            rot_at,
        };
        let mut store = ProvisioningStore::new(region).unwrap();

        assert_eq!(
            store.write(&sample()),
            Err(ProvisioningError::VerifyMismatch {
                field: "wifiPassword"
            })
        );
    }

    #[test]
    fn test_region_too_small() {
        assert!(matches!(
            ProvisioningStore::new(RamRegion::new(64)),
            Err(ProvisioningError::RegionTooSmall { .. })
        ));
    }
}
