//! Hardware seams: the shared full-duplex audio bus, mic capture, speaker
//! output, the AAC encoder pipeline, and the camera / persistent-store /
//! network collaborator interfaces.
//!
//! The rest of the firmware only talks to the types exported here; the
//! concrete backend is selected per target. Host backends are functional
//! fakes so the whole stack builds and tests on a desktop.

pub mod audio;
pub mod camera;
pub mod net;
pub mod store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("audio error: {0}")]
    Audio(&'static str),
    #[error("storage error: {0}")]
    Storage(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("timed out")]
    Timeout,
}

pub type Result<T> = core::result::Result<T, HardwareError>;

pub use audio::aac::{AacEncoderElement, AacPipeline, AAC_FRAME_SAMPLES};
pub use audio::bus::{AudioBus, MicSource};
pub use audio::mic::MicCapture;
pub use audio::speaker::SpeakerOutput;
pub use camera::{Camera, JpegFrame};
pub use net::NetInfo;
pub use store::Store;

/// Hardware sample rate of both audio directions (bit-exact rates are a
/// property of the I²S clock tree; everything downstream resamples).
pub const AUDIO_SAMPLE_RATE: u32 = 16_000;

#[cfg(not(target_os = "espidf"))]
pub fn random_u32() -> u32 {
    rand::random::<u32>()
}

#[cfg(target_os = "espidf")]
pub fn random_u32() -> u32 {
    unsafe { esp_idf_svc::sys::esp_random() }
}
