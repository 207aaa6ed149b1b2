//! RTSP 1.0 server streaming MJPEG (RFC 2435) and AAC-hbr audio
//! (RFC 3640) over RTP, with TCP-interleaved and UDP unicast transports.

pub mod aac_pack;
pub mod jpeg;
pub mod request;
pub mod server;
pub mod session;

pub use server::{AudioSource, RtspServer, RtspServerConfig};
pub use session::MAX_SESSIONS;

use thiserror::Error;

pub const RTSP_PORT: u16 = 8554;

#[derive(Debug, Error)]
pub enum RtspError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("camera not ready")]
    CameraNotReady,
    #[error("server already running")]
    AlreadyRunning,
}

pub type Result<T> = core::result::Result<T, RtspError>;
