//! Shared full-duplex audio bus. One hardware port carries both the
//! speaker (TX) and the external I²S microphone (RX) on common BCLK/WS
//! lines; TX is the clock master, so RX only sees a bit clock while TX is
//! enabled. The onboard PDM microphone lives on an independent port and is
//! not routed through this type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{RxChannel, TxChannel};
use crate::Result;

pub const DMA_BUF_COUNT: usize = 6;
pub const DMA_BUF_SAMPLES: usize = 256;

/// Which microphone feeds capture. Chosen from the persistent store at
/// boot; switching requires a reboot because the shared port cannot be
/// reconfigured while either channel may be live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MicSource {
    #[default]
    Pdm,
    ExternalI2s,
}

struct Half<T: ?Sized> {
    chan: Box<T>,
    enabled: bool,
}

pub struct AudioBus {
    tx: Mutex<Half<dyn TxChannel>>,
    rx: Mutex<Half<dyn RxChannel>>,
    /// True while MicCapture runs from the external I²S mic. While set,
    /// TX must stay enabled to keep BCLK flowing.
    external_mic_active: AtomicBool,
}

impl AudioBus {
    pub fn new() -> Result<Arc<Self>> {
        let (tx, rx) = crate::audio::init_shared_bus()?;
        log::info!("shared full-duplex audio bus ready");
        Ok(Arc::new(Self {
            tx: Mutex::new(Half {
                chan: tx,
                enabled: false,
            }),
            rx: Mutex::new(Half {
                chan: rx,
                enabled: false,
            }),
            external_mic_active: AtomicBool::new(false),
        }))
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx.lock().enabled
    }

    pub fn external_mic_active(&self) -> bool {
        self.external_mic_active.load(Ordering::Acquire)
    }

    pub fn set_external_mic_active(&self, active: bool) {
        self.external_mic_active.store(active, Ordering::Release);
    }

    pub fn enable_tx(&self) -> Result<()> {
        let mut tx = self.tx.lock();
        if tx.enabled {
            return Ok(());
        }
        tx.chan.enable()?;
        tx.enabled = true;
        Ok(())
    }

    /// Disable TX. Refused while the external mic is capturing: the mic
    /// derives BCLK from this channel and would read zeros from then on.
    pub fn disable_tx(&self) -> Result<()> {
        if self.external_mic_active() {
            log::debug!("TX kept active: external mic capture needs BCLK");
            return Ok(());
        }
        let mut tx = self.tx.lock();
        if tx.enabled {
            tx.chan.disable()?;
            tx.enabled = false;
        }
        Ok(())
    }

    /// Preload `frames` DMA buffers of silence so the DAC can lock onto
    /// the word clock before the first audible sample.
    pub fn preload_silence(&self, frames: usize) {
        let silence = [0u8; DMA_BUF_SAMPLES * 2 * 2]; // stereo 16-bit
        let mut tx = self.tx.lock();
        for _ in 0..frames {
            match tx.chan.preload(&silence) {
                Ok(n) if n == silence.len() => {}
                Ok(_) => break, // DMA full, good enough
                Err(e) => {
                    log::warn!("silence preload failed: {e}");
                    break;
                }
            }
        }
    }

    pub fn write_tx(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let mut tx = self.tx.lock();
        if !tx.enabled {
            return Err(crate::HardwareError::InvalidState("tx disabled"));
        }
        tx.chan.write(data, timeout)
    }

    /// Enable RX. When the capture source is the external I²S mic, TX is
    /// enabled first so the bit clock is running by the time samples are
    /// expected.
    pub fn enable_rx(&self, external_mic: bool) -> Result<()> {
        if external_mic {
            self.enable_tx()?;
            self.set_external_mic_active(true);
        }
        let mut rx = self.rx.lock();
        if rx.enabled {
            return Ok(());
        }
        rx.chan.enable()?;
        rx.enabled = true;
        Ok(())
    }

    pub fn disable_rx(&self) {
        {
            let mut rx = self.rx.lock();
            if rx.enabled {
                if let Err(e) = rx.chan.disable() {
                    log::warn!("RX disable failed: {e}");
                }
                rx.enabled = false;
            }
        }
        self.set_external_mic_active(false);
    }

    pub fn read_rx(&self, data: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut rx = self.rx.lock();
        if !rx.enabled {
            return Err(crate::HardwareError::InvalidState("rx disabled"));
        }
        rx.chan.read(data, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_disable_refused_while_external_mic_runs() {
        let bus = AudioBus::new().unwrap();
        bus.enable_rx(true).unwrap();
        assert!(bus.tx_enabled(), "enabling external RX must enable TX");

        bus.disable_tx().unwrap();
        assert!(bus.tx_enabled(), "TX is the mic's clock source");

        bus.disable_rx();
        bus.disable_tx().unwrap();
        assert!(!bus.tx_enabled());
    }

    #[test]
    fn pdm_capture_leaves_tx_alone() {
        let bus = AudioBus::new().unwrap();
        bus.enable_rx(false).unwrap();
        assert!(!bus.tx_enabled());
        assert!(!bus.external_mic_active());
    }

    #[test]
    fn write_requires_enabled_tx() {
        let bus = AudioBus::new().unwrap();
        let err = bus
            .write_tx(&[0u8; 4], Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, crate::HardwareError::InvalidState(_)));

        bus.enable_tx().unwrap();
        assert_eq!(
            bus.write_tx(&[0u8; 4], Duration::from_millis(10)).unwrap(),
            4
        );
    }
}
