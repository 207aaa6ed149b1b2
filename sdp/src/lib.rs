//! SDP offer building and audio media-description parsing for the voice path.
//!
//! Only the subset a residential PBX exchanges with us is modeled: one audio
//! m-line with PCMU/PCMA plus telephone-event, a connection address, and the
//! four direction attributes.

use core::fmt::Write;
use std::net::Ipv4Addr;

use thiserror::Error;

pub const DEFAULT_DTMF_PAYLOAD: u8 = 101;

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("render failed")]
    Render,
}

/// Stream direction from our point of view, derived from which local audio
/// endpoints are usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn from_local_audio(mic_usable: bool, speaker_usable: bool) -> Self {
        match (mic_usable, speaker_usable) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }

    pub fn attribute(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

/// What an INVITE or 200 OK body told us about the remote audio endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub has_pcmu: bool,
    pub has_pcma: bool,
    pub preferred_audio_payload: Option<u8>,
    pub dtmf_payload: u8,
    pub remote_sends: bool,
    pub remote_receives: bool,
}

impl MediaInfo {
    fn new(fallback_ip: Ipv4Addr) -> Self {
        Self {
            remote_ip: fallback_ip,
            remote_port: 0,
            has_pcmu: false,
            has_pcma: false,
            preferred_audio_payload: None,
            dtmf_payload: DEFAULT_DTMF_PAYLOAD,
            remote_sends: true,
            remote_receives: true,
        }
    }

    /// The payload type we will actually use for the call.
    pub fn negotiated_audio_payload(&self) -> u8 {
        if let Some(pt) = self.preferred_audio_payload {
            return pt;
        }
        if self.has_pcmu {
            0
        } else if self.has_pcma {
            8
        } else {
            0
        }
    }
}

/// Build our audio offer. One m-line: PCMU, PCMA, telephone-event 0-15,
/// 20 ms packets.
pub fn build_audio_offer(
    out: &mut String,
    local_ip: Ipv4Addr,
    rtp_port: u16,
    direction: Direction,
) -> Result<usize, SdpError> {
    out.clear();
    write!(
        out,
        "v=0\r\n\
         o=- 0 0 IN IP4 {ip}\r\n\
         s=Doorbell\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 0 8 101\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-15\r\n\
         a=ptime:20\r\n\
         a={dir}\r\n",
        ip = local_ip,
        port = rtp_port,
        dir = direction.attribute(),
    )
    .map_err(|_| SdpError::Render)?;
    Ok(out.len())
}

/// Parse the audio media description out of an SDP body. Missing or
/// malformed lines fall back to defaults; the fallback IP is the SIP
/// signaling source so media still flows when c= is absent.
pub fn parse_media(sdp: &str, fallback_ip: Ipv4Addr) -> MediaInfo {
    let mut info = MediaInfo::new(fallback_ip);

    for raw in sdp.lines() {
        let line = raw.trim_end_matches('\r');

        if let Some(rest) = line.strip_prefix("c=") {
            if let Some(ip_str) = rest.split("IN IP4").nth(1) {
                if let Ok(ip) = ip_str.trim().parse::<Ipv4Addr>() {
                    info.remote_ip = ip;
                }
            }
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            let mut fields = rest.split_whitespace();
            if let Some(port) = fields.next().and_then(|p| p.parse::<u16>().ok()) {
                info.remote_port = port;
            }
            // skip the transport token, the rest are payload types
            for pt in fields.skip(1) {
                match pt {
                    "0" => {
                        info.has_pcmu = true;
                        info.preferred_audio_payload.get_or_insert(0);
                    }
                    "8" => {
                        info.has_pcma = true;
                        info.preferred_audio_payload.get_or_insert(8);
                    }
                    _ => {}
                }
            }
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            let pt = parts.next().and_then(|p| p.parse::<u8>().ok());
            let codec = parts.next().unwrap_or("");
            if let Some(pt) = pt {
                if codec.eq_ignore_ascii_case("PCMU/8000") {
                    info.has_pcmu = true;
                } else if codec.eq_ignore_ascii_case("PCMA/8000") {
                    info.has_pcma = true;
                } else if codec
                    .to_ascii_lowercase()
                    .starts_with("telephone-event")
                {
                    info.dtmf_payload = pt;
                }
            }
        } else {
            match line {
                "a=sendonly" => {
                    info.remote_sends = true;
                    info.remote_receives = false;
                }
                "a=recvonly" => {
                    info.remote_sends = false;
                    info.remote_receives = true;
                }
                "a=inactive" => {
                    info.remote_sends = false;
                    info.remote_receives = false;
                }
                "a=sendrecv" => {
                    info.remote_sends = true;
                    info.remote_receives = true;
                }
                _ => {}
            }
        }
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_parses_back() {
        let mut offer = String::new();
        build_audio_offer(
            &mut offer,
            Ipv4Addr::new(192, 168, 178, 30),
            40000,
            Direction::SendRecv,
        )
        .unwrap();

        let info = parse_media(&offer, Ipv4Addr::UNSPECIFIED);
        assert_eq!(info.remote_port, 40000);
        assert!(info.has_pcmu);
        assert!(info.has_pcma);
        assert_eq!(info.dtmf_payload, 101);
        assert_eq!(info.remote_ip, Ipv4Addr::new(192, 168, 178, 30));
        assert!(info.remote_sends && info.remote_receives);
    }

    #[test]
    fn parses_fritzbox_style_answer() {
        let sdp = "v=0\r\n\
                   o=- 12345 12345 IN IP4 192.168.178.2\r\n\
                   s=-\r\n\
                   c=IN IP4 192.168.178.2\r\n\
                   t=0 0\r\n\
                   m=audio 7078 RTP/AVP 0 8 101\r\n\
                   a=rtpmap:0 PCMU/8000\r\n\
                   a=rtpmap:101 telephone-event/8000\r\n\
                   a=sendrecv\r\n";
        let info = parse_media(sdp, Ipv4Addr::UNSPECIFIED);
        assert_eq!(info.remote_ip, Ipv4Addr::new(192, 168, 178, 2));
        assert_eq!(info.remote_port, 7078);
        assert_eq!(info.negotiated_audio_payload(), 0);
        assert_eq!(info.dtmf_payload, 101);
    }

    #[test]
    fn pcma_only_answer_selects_alaw() {
        let sdp = "c=IN IP4 10.0.0.1\r\n\
                   m=audio 5004 RTP/AVP 8\r\n\
                   a=rtpmap:8 PCMA/8000\r\n";
        let info = parse_media(sdp, Ipv4Addr::UNSPECIFIED);
        assert!(!info.has_pcmu);
        assert!(info.has_pcma);
        assert_eq!(info.negotiated_audio_payload(), 8);
    }

    #[test]
    fn direction_attributes() {
        let info = parse_media("a=recvonly\r\n", Ipv4Addr::UNSPECIFIED);
        assert!(!info.remote_sends);
        assert!(info.remote_receives);

        let info = parse_media("a=inactive\r\n", Ipv4Addr::UNSPECIFIED);
        assert!(!info.remote_sends);
        assert!(!info.remote_receives);
    }

    #[test]
    fn direction_from_local_audio() {
        assert_eq!(Direction::from_local_audio(true, true), Direction::SendRecv);
        assert_eq!(Direction::from_local_audio(true, false), Direction::SendOnly);
        assert_eq!(Direction::from_local_audio(false, true), Direction::RecvOnly);
        assert_eq!(Direction::from_local_audio(false, false), Direction::Inactive);
    }

    #[test]
    fn missing_connection_line_keeps_fallback() {
        let info = parse_media("m=audio 9000 RTP/AVP 0\r\n", Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(info.remote_ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(info.remote_port, 9000);
    }
}
