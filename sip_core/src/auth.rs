//! Digest authentication (RFC 7616, MD5 profile) as spoken by residential
//! PBXes. Supports plain and qop=auth challenges, WWW- and Proxy- variants.

use core::fmt::Write;

use md5::Digest;

use crate::{Result, SipError};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: String,
    pub opaque: String,
    pub is_proxy: bool,
}

impl DigestChallenge {
    pub fn is_valid(&self) -> bool {
        !self.realm.is_empty() && !self.nonce.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Parse the challenge out of a 401/407 response. Looks for
/// WWW-Authenticate first, then Proxy-Authenticate.
pub fn parse_challenge(msg: &str) -> Option<DigestChallenge> {
    let (line, is_proxy) = find_auth_line(msg)?;

    let rest = line.trim();
    let (scheme, params) = rest.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return None;
    }

    let mut challenge = DigestChallenge {
        algorithm: "MD5".to_string(),
        is_proxy,
        ..Default::default()
    };

    for param in split_params(params) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let value = raw.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = value.to_string(),
            "nonce" => challenge.nonce = value.to_string(),
            "algorithm" => challenge.algorithm = value.to_string(),
            "qop" => challenge.qop = value.to_string(),
            "opaque" => challenge.opaque = value.to_string(),
            _ => {}
        }
    }

    challenge.is_valid().then_some(challenge)
}

fn find_auth_line(msg: &str) -> Option<(&str, bool)> {
    if let Some(v) = crate::message::extract_header(msg, "WWW-Authenticate", "") {
        return Some((v, false));
    }
    crate::message::extract_header(msg, "Proxy-Authenticate", "").map(|v| (v, true))
}

/// Split challenge parameters at commas that are outside quoted strings.
fn split_params(params: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut in_quotes = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts.into_iter()
}

/// MD5(username:realm:password), MD5(method:uri), then the final response
/// hash. With qop present, `nc` and `cnonce` join the chain.
pub fn compute_digest_response(
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(
        format!("{}:{}:{}", creds.username, challenge.realm, creds.password).as_bytes(),
    );
    let ha2 = md5_hex(format!("{method}:{uri}").as_bytes());

    let combo = if challenge.qop.is_empty() {
        format!("{ha1}:{}:{ha2}", challenge.nonce)
    } else {
        format!("{ha1}:{}:{nc}:{cnonce}:auth:{ha2}", challenge.nonce)
    };

    md5_hex(combo.as_bytes())
}

/// Append the full `Authorization:`/`Proxy-Authorization:` header line to
/// `out`. `nonce_count` advances only when the challenge carries qop, as
/// the counter is part of the digest there.
pub fn write_authorization_header(
    out: &mut String,
    challenge: &DigestChallenge,
    creds: &DigestCredentials<'_>,
    method: &str,
    uri: &str,
    nonce_count: &mut u32,
    cnonce_seed: u32,
) -> Result<()> {
    let has_qop = !challenge.qop.is_empty();

    let mut nc = String::new();
    let mut cnonce = String::new();
    if has_qop {
        write!(nc, "{:08x}", *nonce_count).map_err(|_| SipError::Capacity)?;
        write!(cnonce, "{cnonce_seed:08x}").map_err(|_| SipError::Capacity)?;
    }

    let response = compute_digest_response(challenge, creds, method, uri, &nc, &cnonce);

    let header_name = if challenge.is_proxy {
        "Proxy-Authorization"
    } else {
        "Authorization"
    };

    write!(
        out,
        "{header_name}: Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{response}\"",
        creds.username, challenge.realm, challenge.nonce,
    )
    .map_err(|_| SipError::Capacity)?;

    if !challenge.algorithm.is_empty() {
        write!(out, ", algorithm={}", challenge.algorithm).map_err(|_| SipError::Capacity)?;
    }
    if has_qop {
        write!(out, ", qop=auth, nc={nc}, cnonce=\"{cnonce}\"")
            .map_err(|_| SipError::Capacity)?;
        *nonce_count = nonce_count.wrapping_add(1);
    }
    if !challenge.opaque.is_empty() {
        write!(out, ", opaque=\"{}\"", challenge.opaque).map_err(|_| SipError::Capacity)?;
    }
    out.push_str("\r\n");

    Ok(())
}

fn md5_hex(data: &[u8]) -> String {
    let digest = md5::Md5::digest(data);
    let mut out = String::new();
    for b in &digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge_from(header: &str) -> DigestChallenge {
        let msg = format!("SIP/2.0 401 Unauthorized\r\nWWW-Authenticate: {header}\r\n\r\n");
        parse_challenge(&msg).unwrap()
    }

    #[test]
    fn md5_reference() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn digest_without_qop_matches_rfc2617_example() {
        let challenge = challenge_from(
            r#"Digest realm="testrealm@host.com", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", algorithm=MD5"#,
        );
        let creds = DigestCredentials {
            username: "Mufasa",
            password: "Circle Of Life",
        };
        let response =
            compute_digest_response(&challenge, &creds, "GET", "/dir/index.html", "", "");
        assert_eq!(response, "670fd8c2df070c60b045671b8b24ff02");
    }

    #[test]
    fn digest_with_qop_matches_rfc2617_example() {
        let challenge = challenge_from(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        );
        let creds = DigestCredentials {
            username: "Mufasa",
            password: "Circle Of Life",
        };
        let response = compute_digest_response(
            &challenge,
            &creds,
            "GET",
            "/dir/index.html",
            "00000001",
            "0a4f113b",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn challenge_requires_realm_and_nonce() {
        let msg = "SIP/2.0 401 Unauthorized\r\nWWW-Authenticate: Digest nonce=\"abc\"\r\n\r\n";
        assert!(parse_challenge(msg).is_none());
    }

    #[test]
    fn proxy_challenge_flagged() {
        let msg = "SIP/2.0 407 Proxy Authentication Required\r\n\
                   Proxy-Authenticate: Digest realm=\"fritz.box\", nonce=\"xyz\"\r\n\r\n";
        let c = parse_challenge(msg).unwrap();
        assert!(c.is_proxy);
        assert_eq!(c.algorithm, "MD5");
    }

    #[test]
    fn nonce_count_advances_only_with_qop() {
        let creds = DigestCredentials {
            username: "620",
            password: "secret",
        };

        let plain = challenge_from(r#"Digest realm="fritz.box", nonce="abc123""#);
        let mut nc = 1;
        let mut out = String::new();
        write_authorization_header(&mut out, &plain, &creds, "REGISTER", "sip:fritz.box", &mut nc, 0x1234)
            .unwrap();
        assert_eq!(nc, 1);
        assert!(!out.contains("qop"));

        let qop = challenge_from(r#"Digest realm="fritz.box", nonce="abc123", qop="auth""#);
        let mut out = String::new();
        write_authorization_header(&mut out, &qop, &creds, "REGISTER", "sip:fritz.box", &mut nc, 0x1234)
            .unwrap();
        assert_eq!(nc, 2);
        assert!(out.contains("nc=00000001"));
        assert!(out.contains("cnonce=\"00001234\""));
        assert!(out.starts_with("Authorization: Digest username=\"620\""));
        assert!(out.ends_with("\r\n"));
    }

    #[test]
    fn emitted_response_field_recomputes() {
        // Spec scenario: user 620, realm fritz.box, password secret,
        // nonce abc123, qop auth, nc 00000001.
        let qop = challenge_from(r#"Digest realm="fritz.box", nonce="abc123", qop="auth""#);
        let creds = DigestCredentials {
            username: "620",
            password: "secret",
        };
        let mut nc = 1;
        let mut out = String::new();
        write_authorization_header(
            &mut out, &qop, &creds, "REGISTER", "sip:fritz.box", &mut nc, 0xcafe,
        )
        .unwrap();

        let emitted = out
            .split("response=\"")
            .nth(1)
            .and_then(|r| r.split('"').next())
            .unwrap();
        let expected = compute_digest_response(
            &qop,
            &creds,
            "REGISTER",
            "sip:fritz.box",
            "00000001",
            "0000cafe",
        );
        assert_eq!(emitted, expected);
    }
}
