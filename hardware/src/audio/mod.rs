//! Audio fabric with pluggable channel backends.
//!
//! The rest of the codebase only talks to [`bus::AudioBus`],
//! [`mic::MicCapture`], [`speaker::SpeakerOutput`] and [`aac::AacPipeline`];
//! the concrete I²S (or host fake) backend is selected per target so the
//! `#[cfg]` usage stays localized to this module.

pub mod aac;
pub mod bus;
pub mod mic;
pub mod speaker;

#[cfg(not(target_os = "espidf"))]
mod host;
#[cfg(target_os = "espidf")]
mod esp;

use std::time::Duration;

use crate::Result;

/// Playback half of the shared full-duplex port. This channel is the bit
/// clock master for the whole bus.
pub trait TxChannel: Send {
    fn enable(&mut self) -> Result<()>;
    fn disable(&mut self) -> Result<()>;
    /// Queue data into DMA before the channel is enabled.
    fn preload(&mut self, data: &[u8]) -> Result<usize>;
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;
}

/// A capture channel: either the RX half of the shared port (external I²S
/// mic) or an independent PDM port.
pub trait RxChannel: Send {
    fn enable(&mut self) -> Result<()>;
    fn disable(&mut self) -> Result<()>;
    fn read(&mut self, data: &mut [u8], timeout: Duration) -> Result<usize>;
}

#[cfg(not(target_os = "espidf"))]
pub(crate) use host::{init_aac_encoder, init_pdm_rx, init_shared_bus};
#[cfg(target_os = "espidf")]
pub(crate) use esp::{init_aac_encoder, init_pdm_rx, init_shared_bus};
