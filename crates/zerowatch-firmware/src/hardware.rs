//! Hardware initialization for the zerowatch device
//!
//! Power comes up first: the SD card slot sits behind an AXP2101 LDO.
//! The SD card is then attached to SPI2.

use alloc::format;
use alloc::string::String;

use axp2101_embedded::AsyncAxp2101;
use embedded_hal_bus::spi::{ExclusiveDevice, NoDelay};
use embedded_sdmmc::SdCard;
use esp_hal::Blocking;
use esp_hal::delay::Delay;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::time::Rate;
use log::info;
use thiserror_no_std::Error;

/// SD card on an exclusive SPI device
pub type SdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, NoDelay>;
pub type SdCardDevice = SdCard<SdSpi, Delay>;

#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("I2C bus: {0}")]
    I2c(String),
    #[error("power management: {0}")]
    Power(String),
    #[error("SPI bus: {0}")]
    Spi(String),
}

/// Create the I2C bus the power management chip sits on
pub fn create_i2c_bus(
    i2c0: esp_hal::peripherals::I2C0<'static>,
    sda: esp_hal::peripherals::GPIO12<'static>,
    scl: esp_hal::peripherals::GPIO11<'static>,
) -> Result<I2c<'static, esp_hal::Async>, HardwareError> {
    let bus = I2c::new(
        i2c0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .map_err(|e| HardwareError::I2c(format!("{:?}", e)))?
    .with_sda(sda)
    .with_scl(scl)
    .into_async();
    Ok(bus)
}

/// Bring up the rails the SD card needs
pub async fn power_up(i2c: I2c<'static, esp_hal::Async>) -> Result<(), HardwareError> {
    let power = |e| HardwareError::Power(format!("{:?}", e));

    info!("Configuring power management");
    let mut pmu = AsyncAxp2101::new(i2c);
    pmu.init().await.map_err(power)?;
    pmu.enable_aldo4().await.map_err(power)?;
    // ALDO4 feeds the SD card slot
    pmu.set_aldo4_voltage(3300).await.map_err(power)?;
    info!("Power management ready");
    Ok(())
}

/// Attach the SD card to SPI2.
///
/// The card starts in SPI mode at 400 kHz, as initialization requires.
pub fn init_sd_card(
    spi2: esp_hal::peripherals::SPI2<'static>,
    sck: esp_hal::peripherals::GPIO36<'static>,
    mosi: esp_hal::peripherals::GPIO37<'static>,
    miso: esp_hal::peripherals::GPIO35<'static>,
    cs: esp_hal::peripherals::GPIO4<'static>,
) -> Result<SdCardDevice, HardwareError> {
    let bus = Spi::new(
        spi2,
        SpiConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .map_err(|e| HardwareError::Spi(format!("{:?}", e)))?
    .with_sck(sck)
    .with_mosi(mosi)
    .with_miso(miso);

    let cs = Output::new(cs, Level::High, OutputConfig::default());
    let device = ExclusiveDevice::new_no_delay(bus, cs)
        .map_err(|e| HardwareError::Spi(format!("{:?}", e)))?;

    Ok(SdCard::new(device, Delay::new()))
}
