//! ESP32-S3 audio backends. The shared port is I2S1 in full-duplex
//! standard mode: MAX98357A DAC on the TX half (BCLK=GPIO7, WS=GPIO8,
//! DOUT=GPIO9), INMP441 on the RX half (DIN=GPIO12, clocked by the TX
//! pair). The onboard PDM mic uses I2S0 (CLK=GPIO42, DATA=GPIO41).
//!
//! The INMP441 wants 64 BCLK per WS frame, so both halves run 32-bit
//! slots; sample data stays 16-bit left-justified.

use std::sync::Arc;
use std::time::Duration;

use esp_idf_hal::delay::TickType;
use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::i2s::config::{
    Config, DataBitWidth, PdmRxClkConfig, PdmRxConfig, PdmRxSlotConfig, SlotBitWidth,
    SlotMode, StdClkConfig, StdConfig, StdSlotConfig,
};
use esp_idf_hal::i2s::{I2sBiDir, I2sDriver, I2sRx};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::sys::EspError;
use parking_lot::Mutex;

use crate::audio::aac::AacEncoderElement;
use crate::audio::{RxChannel, TxChannel};
use crate::{HardwareError, Result, AUDIO_SAMPLE_RATE};

fn map_err(e: EspError) -> HardwareError {
    log::error!("i2s error: {e:?}");
    HardwareError::Audio("i2s error")
}

type SharedDriver = Arc<Mutex<I2sDriver<'static, I2sBiDir>>>;

struct EspTx {
    driver: SharedDriver,
}

struct EspRx {
    driver: SharedDriver,
}

impl TxChannel for EspTx {
    fn enable(&mut self) -> Result<()> {
        self.driver.lock().tx_enable().map_err(map_err)
    }

    fn disable(&mut self) -> Result<()> {
        self.driver.lock().tx_disable().map_err(map_err)
    }

    fn preload(&mut self, data: &[u8]) -> Result<usize> {
        self.driver.lock().preload_data(data).map_err(map_err)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        let ticks = TickType::from(timeout);
        self.driver.lock().write(data, ticks.into()).map_err(map_err)
    }
}

impl RxChannel for EspRx {
    fn enable(&mut self) -> Result<()> {
        self.driver.lock().rx_enable().map_err(map_err)
    }

    fn disable(&mut self) -> Result<()> {
        self.driver.lock().rx_disable().map_err(map_err)
    }

    fn read(&mut self, data: &mut [u8], timeout: Duration) -> Result<usize> {
        let ticks = TickType::from(timeout);
        self.driver.lock().read(data, ticks.into()).map_err(map_err)
    }
}

pub fn init_shared_bus() -> Result<(Box<dyn TxChannel>, Box<dyn RxChannel>)> {
    let peripherals = Peripherals::take().map_err(|_| HardwareError::Audio("peripherals taken"))?;
    let pins = peripherals.pins;

    // INMP441 requires 64 BCLK per WS frame (32-bit slots). The Philips
    // default keeps slot_bit_width at the 16-bit data width, giving only
    // 32 BCLK per WS, at which the mic outputs no valid data. Force
    // 32-bit slots; the bidir config applies to both halves, so the TX
    // clock master matches. BCLK = 16000 x 2 x 32 = 1.024 MHz.
    let slot_cfg = StdSlotConfig::philips_slot_default(DataBitWidth::Bits16, SlotMode::Stereo)
        .slot_bit_width(SlotBitWidth::Bits32);

    let config = StdConfig::new(
        Config::default(),
        StdClkConfig::from_sample_rate_hz(AUDIO_SAMPLE_RATE),
        slot_cfg,
    );

    let driver = I2sDriver::new_std_bidir(
        peripherals.i2s1,
        &config,
        pins.gpio7,                  // BCLK
        pins.gpio12,                 // DIN (INMP441 SD)
        pins.gpio9,                  // DOUT (MAX98357A)
        Option::<AnyIOPin>::None,    // MCLK unused
        pins.gpio8,                  // WS
    )
    .map_err(map_err)?;

    let shared: SharedDriver = Arc::new(Mutex::new(driver));
    Ok((
        Box::new(EspTx {
            driver: Arc::clone(&shared),
        }),
        Box::new(EspRx { driver: shared }),
    ))
}

struct EspPdmRx {
    driver: I2sDriver<'static, I2sRx>,
}

impl RxChannel for EspPdmRx {
    fn enable(&mut self) -> Result<()> {
        self.driver.rx_enable().map_err(map_err)
    }

    fn disable(&mut self) -> Result<()> {
        self.driver.rx_disable().map_err(map_err)
    }

    fn read(&mut self, data: &mut [u8], timeout: Duration) -> Result<usize> {
        let ticks = TickType::from(timeout);
        self.driver.read(data, ticks.into()).map_err(map_err)
    }
}

pub fn init_pdm_rx() -> Result<Box<dyn RxChannel>> {
    let peripherals = Peripherals::take().map_err(|_| HardwareError::Audio("peripherals taken"))?;
    let pins = peripherals.pins;

    let config = PdmRxConfig::new(
        Config::default(),
        PdmRxClkConfig::from_sample_rate_hz(AUDIO_SAMPLE_RATE),
        PdmRxSlotConfig::from_bits_per_sample_and_slot_mode(
            DataBitWidth::Bits16,
            SlotMode::Mono,
        ),
    );

    let driver = I2sDriver::new_pdm_rx(
        peripherals.i2s0,
        &config,
        pins.gpio42, // CLK
        pins.gpio41, // DATA
    )
    .map_err(map_err)?;

    Ok(Box::new(EspPdmRx { driver }))
}

/// Binding point for the vendor AAC encoder. Until the codec component is
/// wired in, initialization fails and the pipeline latches into its
/// permanent-failure state, which drops the RTSP audio track cleanly.
pub fn init_aac_encoder(
    _sample_rate: u32,
    _bitrate: u32,
) -> Result<Box<dyn AacEncoderElement>> {
    Err(HardwareError::Audio("vendor AAC encoder not wired"))
}
