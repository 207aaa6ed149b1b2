//! Zero-copy helpers over raw SIP datagrams. Per RFC 3261 robustness,
//! anything that does not parse yields `None` and the caller ignores the
//! message.

/// True when the datagram is a response (starts with the SIP version).
pub fn is_response(msg: &str) -> bool {
    msg.starts_with("SIP/2.0")
}

/// Status code of a response line, e.g. 200 from "SIP/2.0 200 OK".
pub fn status_code(msg: &str) -> Option<u16> {
    let rest = msg.strip_prefix("SIP/2.0 ")?;
    rest.split_whitespace().next()?.parse().ok()
}

/// Method token of a request line.
pub fn method_token(msg: &str) -> Option<&str> {
    if is_response(msg) {
        return None;
    }
    let first_line = msg.split("\r\n").next()?;
    first_line.split(' ').next().filter(|m| !m.is_empty())
}

/// Request-URI of a request line.
pub fn request_uri(msg: &str) -> Option<&str> {
    let first_line = msg.split("\r\n").next()?;
    first_line.split(' ').nth(1)
}

/// First matching header value, folded whitespace trimmed. Matching is
/// case-insensitive; `compact` is the single-letter compact form ("t" for
/// To, "m" for Contact) or empty when the header has none.
pub fn extract_header<'a>(msg: &'a str, name: &str, compact: &str) -> Option<&'a str> {
    for line in msg.split("\r\n") {
        if line.is_empty() {
            break; // end of headers
        }
        let Some((hname, value)) = line.split_once(':') else {
            continue;
        };
        let hname = hname.trim();
        if hname.eq_ignore_ascii_case(name)
            || (!compact.is_empty() && hname.eq_ignore_ascii_case(compact))
        {
            return Some(value.trim());
        }
    }
    None
}

/// `tag=` parameter of a From/To header value.
pub fn extract_tag(header_value: &str) -> Option<&str> {
    let pos = header_value.to_ascii_lowercase().find("tag=")?;
    let rest = &header_value[pos + 4..];
    let end = rest.find([';', '>']).unwrap_or(rest.len());
    let tag = &rest[..end];
    (!tag.is_empty()).then_some(tag)
}

/// The `sip:` URI embedded in a header value, without angle brackets or
/// parameters.
pub fn extract_sip_uri(header_value: &str) -> Option<&str> {
    let start = header_value.find("sip:")?;
    let rest = &header_value[start..];
    let end = rest.find(['>', ';']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// `branch=` parameter of the topmost Via.
pub fn extract_via_branch(msg: &str) -> Option<&str> {
    let via = extract_header(msg, "Via", "v")?;
    let pos = via.find("branch=")?;
    let rest = &via[pos + 7..];
    let end = rest.find([';', ',']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// CSeq header split into number and method.
pub fn parse_cseq(msg: &str) -> Option<(u32, &str)> {
    let cseq = extract_header(msg, "CSeq", "")?;
    let (num, method) = cseq.split_once(' ')?;
    Some((num.trim().parse().ok()?, method.trim()))
}

/// Contact URI (compact form "m" accepted).
pub fn extract_contact_uri(msg: &str) -> Option<&str> {
    extract_sip_uri(extract_header(msg, "Contact", "m")?)
}

/// Tag of the To header.
pub fn extract_to_tag(msg: &str) -> Option<&str> {
    extract_tag(extract_header(msg, "To", "t")?)
}

/// Tag of the From header.
pub fn extract_from_tag(msg: &str) -> Option<&str> {
    extract_tag(extract_header(msg, "From", "f")?)
}

/// Body after the blank line, or `None` when absent/empty.
pub fn sdp_body(msg: &str) -> Option<&str> {
    let body = msg.split_once("\r\n\r\n")?.1;
    (!body.is_empty()).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "SIP/2.0 200 OK\r\n\
        Via: SIP/2.0/UDP 192.168.178.30:5062;branch=z9hG4bK-0000abcd;rport\r\n\
        From: \"Doorbell\" <sip:620@fritz.box>;tag=f00f\r\n\
        To: <sip:**610@fritz.box>;tag=a1b2c3\r\n\
        Call-ID: deadbeef@192.168.178.30\r\n\
        CSeq: 2 INVITE\r\n\
        Contact: <sip:610@192.168.178.2;transport=udp>\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn classifies_and_extracts() {
        assert!(is_response(RESPONSE));
        assert_eq!(status_code(RESPONSE), Some(200));
        assert_eq!(extract_to_tag(RESPONSE), Some("a1b2c3"));
        assert_eq!(extract_from_tag(RESPONSE), Some("f00f"));
        assert_eq!(
            extract_via_branch(RESPONSE),
            Some("z9hG4bK-0000abcd")
        );
        assert_eq!(parse_cseq(RESPONSE), Some((2, "INVITE")));
        assert_eq!(
            extract_contact_uri(RESPONSE),
            Some("sip:610@192.168.178.2")
        );
        assert_eq!(
            extract_header(RESPONSE, "Call-ID", "i"),
            Some("deadbeef@192.168.178.30")
        );
    }

    #[test]
    fn request_line_parsing() {
        let req = "INVITE sip:**610@fritz.box SIP/2.0\r\nCSeq: 1 INVITE\r\n\r\n";
        assert!(!is_response(req));
        assert_eq!(method_token(req), Some("INVITE"));
        assert_eq!(request_uri(req), Some("sip:**610@fritz.box"));
        assert_eq!(status_code(req), None);
    }

    #[test]
    fn compact_header_forms() {
        let msg = "BYE sip:x SIP/2.0\r\nt: <sip:620@fritz.box>;tag=zz\r\nm: <sip:620@10.0.0.5:5062>\r\n\r\n";
        assert_eq!(extract_to_tag(msg), Some("zz"));
        assert_eq!(extract_contact_uri(msg), Some("sip:620@10.0.0.5:5062"));
    }

    #[test]
    fn body_extraction() {
        let msg = "SIP/2.0 200 OK\r\nContent-Length: 5\r\n\r\nv=0\r\n";
        assert_eq!(sdp_body(msg), Some("v=0\r\n"));
        assert_eq!(sdp_body("SIP/2.0 200 OK\r\n\r\n"), None);
    }

    #[test]
    fn headers_stop_at_blank_line() {
        let msg = "SIP/2.0 200 OK\r\nCSeq: 1 OPTIONS\r\n\r\nFrom: not-a-header\r\n";
        assert_eq!(extract_header(msg, "From", "f"), None);
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(status_code("SIP/2.0"), None);
        assert_eq!(parse_cseq("no headers here"), None);
        assert_eq!(extract_tag("<sip:x@y>"), None);
    }
}
