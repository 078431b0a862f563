//! Provisioning region stored as a fixed-size file on the SD card
//!
//! The file is read into RAM once when the region is opened. Reads and
//! writes work on that copy; `commit` rewrites the whole file.

use alloc::vec;
use alloc::vec::Vec;

use embedded_sdmmc::{
    Error, Mode, SdCard, SdCardError, TimeSource, Timestamp, VolumeIdx, VolumeManager,
};
use log::{debug, info};
use zerowatch_core::provisioning::{NvRegion, REGION_SIZE};

/// 8.3 name of the provisioning file in the card's root directory
pub const PROVISIONING_FILE: &str = "PROVISN.BIN";

pub type SdError = Error<SdCardError>;

/// The device has no RTC; every file gets the same timestamp.
pub struct FixedClock;

impl TimeSource for FixedClock {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

pub struct SdRegion<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
    cache: Vec<u8>,
    /// Bytes of `cache` backed by the card
    valid: usize,
}

impl<S, D, T> SdRegion<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    /// Load the provisioning file.
    ///
    /// A missing file reads as an erased region. A file shorter than the
    /// region yields short reads past its end.
    pub fn open(sd_card: SdCard<S, D>, ts: T) -> Result<Self, SdError> {
        let mut region = Self {
            volume_mgr: VolumeManager::new(sd_card, ts),
            cache: vec![0; REGION_SIZE],
            valid: 0,
        };

        region.valid = match region.load() {
            Ok(n) => n,
            Err(Error::NotFound) => {
                info!("sd: no {}, region is erased", PROVISIONING_FILE);
                REGION_SIZE
            }
            Err(e) => return Err(e),
        };
        debug!("sd: {} bytes of provisioning data", region.valid);
        Ok(region)
    }

    fn load(&mut self) -> Result<usize, SdError> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file = root_dir.open_file_in_dir(PROVISIONING_FILE, Mode::ReadOnly)?;

        let mut total = 0;
        while total < self.cache.len() {
            let n = file.read(&mut self.cache[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }

        file.close()?;
        root_dir.close()?;
        volume0.close()?;
        Ok(total)
    }
}

impl<S, D, T> NvRegion for SdRegion<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    type Error = SdError;

    fn capacity(&self) -> usize {
        REGION_SIZE
    }

    fn read_bytes(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = self.valid.saturating_sub(offset).min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&self.cache[offset..offset + n]);
        }
        Ok(n)
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize, Self::Error> {
        let n = REGION_SIZE.saturating_sub(offset).min(data.len());
        if n > 0 {
            self.cache[offset..offset + n].copy_from_slice(&data[..n]);
        }
        Ok(n)
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        let volume0 = self.volume_mgr.open_volume(VolumeIdx(0))?;
        let root_dir = volume0.open_root_dir()?;
        let file =
            root_dir.open_file_in_dir(PROVISIONING_FILE, Mode::ReadWriteCreateOrTruncate)?;

        file.write(&self.cache)?;

        file.close()?;
        root_dir.close()?;
        volume0.close()?;

        self.valid = REGION_SIZE;
        info!("sd: {} committed", PROVISIONING_FILE);
        Ok(())
    }
}
