//! Microphone capture. Two mutually exclusive sources, chosen from the
//! persistent store at init and fixed until reboot:
//!
//! * the external I²S mic on the shared full-duplex bus (32-bit slots, DMA
//!   delivers stereo-interleaved frames with the right slot always zero);
//! * the onboard PDM mic on its own port (true mono DMA).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::bus::{AudioBus, MicSource};
use crate::audio::RxChannel;
use crate::store::Store;
use crate::Result;

const STORE_NS: &str = "camera";

pub struct MicCapture {
    bus: Arc<AudioBus>,
    source: MicSource,
    pdm: Mutex<Option<Box<dyn RxChannel>>>,
    enabled: bool,
    muted: AtomicBool,
    sensitivity: AtomicU8,
    running: AtomicBool,
}

impl MicCapture {
    /// Read the mic configuration and commit to a source for this firmware
    /// session.
    pub fn new(bus: Arc<AudioBus>, store: &dyn Store) -> Self {
        let enabled = store.get_u8(STORE_NS, "mic_en").unwrap_or(0) != 0;
        let muted = store.get_u8(STORE_NS, "mic_mute").unwrap_or(0) != 0;
        let sensitivity = store.get_u8(STORE_NS, "mic_sens").unwrap_or(70);
        let source = match store.get_u8(STORE_NS, "mic_source") {
            Some(1) => MicSource::ExternalI2s,
            _ => MicSource::Pdm,
        };

        log::info!(
            "mic capture configured (source={:?}, enabled={}, sensitivity={}%)",
            source,
            enabled,
            sensitivity
        );

        Self {
            bus,
            source,
            pdm: Mutex::new(None),
            enabled,
            muted: AtomicBool::new(muted),
            sensitivity: AtomicU8::new(sensitivity),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.source {
            MicSource::ExternalI2s => {
                self.bus.enable_rx(true)?;
            }
            MicSource::Pdm => {
                let mut pdm = self.pdm.lock();
                if pdm.is_none() {
                    *pdm = Some(crate::audio::init_pdm_rx()?);
                }
                if let Some(chan) = pdm.as_mut() {
                    chan.enable()?;
                }
            }
        }

        self.running.store(true, Ordering::Release);
        log::info!("mic capture started ({:?})", self.source);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.source {
            MicSource::ExternalI2s => self.bus.disable_rx(),
            MicSource::Pdm => {
                if let Some(chan) = self.pdm.lock().as_mut() {
                    if let Err(e) = chan.disable() {
                        log::warn!("PDM disable failed: {e}");
                    }
                }
            }
        }
        log::info!("mic capture stopped");
    }

    /// Fill `buffer` with mono PCM. Muted capture yields silence and still
    /// reports success; a timeout zero-fills and reports failure so the
    /// caller can substitute comfort silence on the wire.
    pub fn read(&self, buffer: &mut [i16], timeout: Duration) -> bool {
        if !self.running.load(Ordering::Acquire) || buffer.is_empty() {
            return false;
        }

        if self.muted.load(Ordering::Acquire) {
            buffer.fill(0);
            return true;
        }

        let ok = match self.source {
            MicSource::ExternalI2s => self.read_shared_bus(buffer, timeout),
            MicSource::Pdm => self.read_pdm(buffer, timeout),
        };
        if !ok {
            return false;
        }

        let sensitivity = self.sensitivity.load(Ordering::Acquire) as i32;
        if sensitivity < 100 {
            for s in buffer.iter_mut() {
                *s = ((*s as i32 * sensitivity) / 100).clamp(-32768, 32767) as i16;
            }
        }
        true
    }

    /// Shared-bus DMA is stereo-interleaved `[L, R, L, R, ...]` with R
    /// always zero (the wiring selects the left slot). Read in 256-frame
    /// chunks and keep L.
    fn read_shared_bus(&self, buffer: &mut [i16], timeout: Duration) -> bool {
        let mut chunk = [0i16; 256 * 2];
        let mut filled = 0usize;
        let mut wait = timeout;

        while filled < buffer.len() {
            let frames = (buffer.len() - filled).min(256);
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut chunk[..frames * 2]);
            let got = match self.bus.read_rx(bytes, wait) {
                Ok(n) if n > 0 => n,
                _ => {
                    buffer[filled..].fill(0);
                    return false;
                }
            };
            let got_frames = got / 4;
            for i in 0..got_frames.min(frames) {
                buffer[filled + i] = chunk[2 * i];
            }
            filled += got_frames.min(frames);
            wait = Duration::from_millis(200); // relax after the first fill
        }
        true
    }

    fn read_pdm(&self, buffer: &mut [i16], timeout: Duration) -> bool {
        let mut pdm = self.pdm.lock();
        let Some(chan) = pdm.as_mut() else {
            return false;
        };
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(buffer);
        match chan.read(bytes, timeout) {
            Ok(n) if n > 0 => {
                bytes[n..].fill(0);
                true
            }
            _ => {
                bytes.fill(0);
                false
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn source(&self) -> MicSource {
        self.source
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity.load(Ordering::Acquire)
    }

    pub fn set_sensitivity(&self, percent: u8) {
        self.sensitivity.store(percent.min(100), Ordering::Release);
    }
}
