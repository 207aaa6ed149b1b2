//! RTP packet model and the voice-path codecs: G.711 μ-law/A-law plus
//! RFC 4733 telephone-event decoding.

pub mod codecs;
pub mod dtmf;
pub mod error;
pub mod rtp;

pub use codecs::alaw::{alaw2linear, linear2alaw};
pub use codecs::ulaw::{linear2ulaw, ulaw2linear};
pub use codecs::{decode_g711, encode_g711, g711_silence_byte};
pub use dtmf::{dtmf_event_to_char, parse_telephone_event, TelephoneEvent};
pub use error::AudioError;
pub use rtp::{RtpHeader, RtpPacket};
