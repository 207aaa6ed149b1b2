use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    /// Datagram too short for an RTP header, or inconsistent with its own
    /// CSRC/extension accounting.
    #[error("invalid packet")]
    InvalidPacket,
    /// RTP version field is not 2.
    #[error("unsupported RTP version")]
    UnsupportedVersion,
    /// Payload exceeds the fixed packet capacity.
    #[error("buffer full")]
    BufferFull,
}

// heapless::Vec::push hands back the rejected element on overflow.
impl From<u8> for AudioError {
    fn from(_: u8) -> Self {
        AudioError::BufferFull
    }
}
