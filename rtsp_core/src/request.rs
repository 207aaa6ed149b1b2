//! RTSP request parsing: method token, CSeq, hex session id, Transport
//! header fields, and the track selector in the request URI.

/// First token of the request line.
pub fn method(req: &str) -> &str {
    req.split([' ', '\r', '\n']).next().unwrap_or("")
}

/// CSeq header value; defaults to 1 so a sloppy client still gets a
/// well-formed response.
pub fn cseq(req: &str) -> u32 {
    header(req, "CSeq")
        .and_then(|v| v.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Session header as a hex integer. Zero and absent both mean "none".
pub fn session_id(req: &str) -> Option<u32> {
    let value = header(req, "Session")?;
    let hex: String = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    let id = u32::from_str_radix(&hex, 16).ok()?;
    (id != 0).then_some(id)
}

/// Raw Transport header value.
pub fn transport(req: &str) -> Option<&str> {
    header(req, "Transport")
}

/// Whether the request URI addresses the audio track.
pub fn wants_track2(req: &str) -> bool {
    req.split("\r\n")
        .next()
        .map(|line| line.contains("track2"))
        .unwrap_or(false)
}

pub fn is_tcp_transport(transport: &str) -> bool {
    transport.contains("RTP/AVP/TCP")
}

/// `interleaved=a-b` channel pair.
pub fn interleaved_channels(transport: &str) -> Option<(u8, u8)> {
    let rest = &transport[transport.find("interleaved=")? + 12..];
    parse_pair(rest).map(|(a, b)| (a as u8, b as u8))
}

/// `client_port=a-b` port pair.
pub fn client_ports(transport: &str) -> Option<(u16, u16)> {
    let rest = &transport[transport.find("client_port=")? + 12..];
    parse_pair(rest)
}

fn parse_pair(s: &str) -> Option<(u16, u16)> {
    let end = s.find([';', '\r', ' ']).unwrap_or(s.len());
    let range = &s[..end];
    match range.split_once('-') {
        Some((a, b)) => {
            let a = a.trim().parse().ok()?;
            let b = b.trim().parse().unwrap_or(a + 1);
            Some((a, b))
        }
        None => {
            let a: u16 = range.trim().parse().ok()?;
            Some((a, a + 1))
        }
    }
}

fn header<'a>(req: &'a str, name: &str) -> Option<&'a str> {
    for line in req.split("\r\n") {
        if line.is_empty() {
            break;
        }
        if let Some((hname, value)) = line.split_once(':') {
            if hname.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP: &str = "SETUP rtsp://192.168.1.10:8554/mjpeg/1/track1 RTSP/1.0\r\n\
        CSeq: 3\r\n\
        Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\
        \r\n";

    #[test]
    fn parses_method_and_cseq() {
        assert_eq!(method(SETUP), "SETUP");
        assert_eq!(cseq(SETUP), 3);
        assert_eq!(cseq("OPTIONS * RTSP/1.0\r\n\r\n"), 1);
        assert_eq!(cseq("PLAY x RTSP/1.0\r\ncseq: 9\r\n\r\n"), 9);
    }

    #[test]
    fn parses_transport_variants() {
        let t = transport(SETUP).unwrap();
        assert!(is_tcp_transport(t));
        assert_eq!(interleaved_channels(t), Some((0, 1)));
        assert_eq!(client_ports(t), None);

        let udp = "Transport: RTP/AVP;unicast;client_port=5000-5001\r\n";
        let req = format!("SETUP x RTSP/1.0\r\n{udp}\r\n");
        let t = transport(&req).unwrap();
        assert!(!is_tcp_transport(t));
        assert_eq!(client_ports(t), Some((5000, 5001)));
    }

    #[test]
    fn single_value_pairs_get_partner() {
        assert_eq!(parse_pair("4"), Some((4, 5)));
        assert_eq!(parse_pair("6-"), Some((6, 7)));
    }

    #[test]
    fn session_id_hex() {
        let req = "PLAY x RTSP/1.0\r\nSession: 01a2b3c4;timeout=60\r\n\r\n";
        assert_eq!(session_id(req), Some(0x01a2b3c4));
        assert_eq!(session_id("PLAY x RTSP/1.0\r\n\r\n"), None);
        assert_eq!(session_id("PLAY x RTSP/1.0\r\nSession: 0\r\n\r\n"), None);
    }

    #[test]
    fn track_selection() {
        assert!(!wants_track2(SETUP));
        assert!(wants_track2(
            "SETUP rtsp://h:8554/mjpeg/1/track2 RTSP/1.0\r\n\r\n"
        ));
    }
}
