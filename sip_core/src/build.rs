//! Outgoing-message builders. Every builder renders the complete datagram
//! into a caller-owned `String`; the user agent keeps two such buffers in
//! its state so an ACK built during an auth retry cannot clobber the INVITE
//! being rebuilt. These builders are not reentrant by contract; only the
//! main task calls them.

use core::fmt::Write;
use std::net::Ipv4Addr;

use crate::{Result, SipError};

/// Who we are on the wire. Borrowed by every builder call.
#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity<'a> {
    pub user: &'a str,
    pub display_name: &'a str,
    pub domain: &'a str,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub user_agent: &'a str,
}

impl<'a> LocalIdentity<'a> {
    fn write_via(&self, out: &mut String, branch: &str) -> Result<()> {
        write!(
            out,
            "Via: SIP/2.0/UDP {}:{};branch={}\r\nMax-Forwards: 70\r\n",
            self.local_ip, self.local_port, branch
        )
        .map_err(|_| SipError::Capacity)
    }

    fn write_from(&self, out: &mut String, tag: &str) -> Result<()> {
        write!(
            out,
            "From: \"{}\" <sip:{}@{}>;tag={}\r\n",
            self.display_name, self.user, self.domain, tag
        )
        .map_err(|_| SipError::Capacity)
    }

    fn write_contact(&self, out: &mut String) -> Result<()> {
        write!(
            out,
            "Contact: <sip:{}@{}:{}>\r\n",
            self.user, self.local_ip, self.local_port
        )
        .map_err(|_| SipError::Capacity)
    }

    fn write_trailer(&self, out: &mut String, content_length: usize) -> Result<()> {
        write!(
            out,
            "User-Agent: {}\r\nContent-Length: {}\r\n\r\n",
            self.user_agent, content_length
        )
        .map_err(|_| SipError::Capacity)
    }
}

fn write_to(out: &mut String, target: &str, to_tag: &str) -> Result<()> {
    write!(out, "To: <sip:{}>", target).map_err(|_| SipError::Capacity)?;
    if !to_tag.is_empty() {
        write!(out, ";tag={}", to_tag).map_err(|_| SipError::Capacity)?;
    }
    out.push_str("\r\n");
    Ok(())
}

fn write_call_id_cseq(out: &mut String, call_id: &str, cseq: u32, method: &str) -> Result<()> {
    write!(out, "Call-ID: {}\r\nCSeq: {} {}\r\n", call_id, cseq, method)
        .map_err(|_| SipError::Capacity)
}

/// Normalize a request-URI so it always carries the `sip:` scheme.
fn write_request_line(out: &mut String, method: &str, uri: &str) -> Result<()> {
    if uri.starts_with("sip:") {
        write!(out, "{} {} SIP/2.0\r\n", method, uri)
    } else {
        write!(out, "{} sip:{} SIP/2.0\r\n", method, uri)
    }
    .map_err(|_| SipError::Capacity)
}

pub fn build_register(
    out: &mut String,
    id: &LocalIdentity<'_>,
    from_tag: &str,
    call_id: &str,
    branch: &str,
    cseq: u32,
    expires: u32,
    auth_header: Option<&str>,
) -> Result<usize> {
    out.clear();
    write!(out, "REGISTER sip:{} SIP/2.0\r\n", id.domain).map_err(|_| SipError::Capacity)?;
    id.write_via(out, branch)?;
    id.write_from(out, from_tag)?;
    write_to(out, &format!("{}@{}", id.user, id.domain), "")?;
    write_call_id_cseq(out, call_id, cseq, "REGISTER")?;
    id.write_contact(out)?;
    if let Some(auth) = auth_header {
        out.push_str(auth);
    }
    write!(out, "Expires: {}\r\n", expires).map_err(|_| SipError::Capacity)?;
    id.write_trailer(out, 0)?;
    Ok(out.len())
}

pub fn build_invite(
    out: &mut String,
    id: &LocalIdentity<'_>,
    target: &str, // user@domain
    from_tag: &str,
    call_id: &str,
    branch: &str,
    cseq: u32,
    auth_header: Option<&str>,
    sdp: &str,
) -> Result<usize> {
    out.clear();
    write_request_line(out, "INVITE", target)?;
    id.write_via(out, branch)?;
    id.write_from(out, from_tag)?;
    write_to(out, target, "")?;
    write_call_id_cseq(out, call_id, cseq, "INVITE")?;
    id.write_contact(out)?;
    if let Some(auth) = auth_header {
        out.push_str(auth);
    }
    write!(out, "User-Agent: {}\r\n", id.user_agent).map_err(|_| SipError::Capacity)?;
    write!(
        out,
        "Content-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
        sdp.len(),
        sdp
    )
    .map_err(|_| SipError::Capacity)?;
    Ok(out.len())
}

/// CANCEL must mirror the INVITE's branch and CSeq number (RFC 3261 §9.1).
pub fn build_cancel(
    out: &mut String,
    id: &LocalIdentity<'_>,
    target: &str,
    from_tag: &str,
    to_tag: &str,
    call_id: &str,
    branch: &str,
    cseq: u32,
) -> Result<usize> {
    out.clear();
    write_request_line(out, "CANCEL", target)?;
    id.write_via(out, branch)?;
    id.write_from(out, from_tag)?;
    write_to(out, target, to_tag)?;
    write_call_id_cseq(out, call_id, cseq, "CANCEL")?;
    id.write_trailer(out, 0)?;
    Ok(out.len())
}

/// ACK for a 2xx: fresh branch, sent to the dialog target.
pub fn build_ack(
    out: &mut String,
    id: &LocalIdentity<'_>,
    request_uri: &str,
    to_target: &str,
    from_tag: &str,
    to_tag: &str,
    call_id: &str,
    branch: &str,
    cseq: u32,
) -> Result<usize> {
    out.clear();
    write_request_line(out, "ACK", request_uri)?;
    id.write_via(out, branch)?;
    id.write_from(out, from_tag)?;
    write_to(out, to_target, to_tag)?;
    write_call_id_cseq(out, call_id, cseq, "ACK")?;
    id.write_trailer(out, 0)?;
    Ok(out.len())
}

/// ACK for a non-2xx final response: reuses the INVITE's Via branch and
/// CSeq number (RFC 3261 §17.1.1.3).
pub fn build_non_2xx_ack(
    out: &mut String,
    id: &LocalIdentity<'_>,
    target: &str,
    from_tag: &str,
    to_tag: &str,
    call_id: &str,
    invite_branch: &str,
    cseq: u32,
) -> Result<usize> {
    build_ack(
        out,
        id,
        target,
        target,
        from_tag,
        to_tag,
        call_id,
        invite_branch,
        cseq,
    )
}

pub fn build_bye(
    out: &mut String,
    id: &LocalIdentity<'_>,
    request_uri: &str,
    to_target: &str,
    from_tag: &str,
    to_tag: &str,
    call_id: &str,
    branch: &str,
    cseq: u32,
) -> Result<usize> {
    out.clear();
    write_request_line(out, "BYE", request_uri)?;
    id.write_via(out, branch)?;
    id.write_from(out, from_tag)?;
    write_to(out, to_target, to_tag)?;
    write_call_id_cseq(out, call_id, cseq, "BYE")?;
    id.write_trailer(out, 0)?;
    Ok(out.len())
}

/// Optional body for a response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseBody<'a> {
    pub content_type: &'a str,
    pub body: &'a str,
}

/// Build a response by mirroring Via/From/To/Call-ID/CSeq from the request.
/// `local_tag` is appended to To when the request's To has no tag yet.
/// `extra_headers` must be full `Name: value\r\n` lines.
pub fn build_response(
    out: &mut String,
    request: &str,
    status: u16,
    reason: &str,
    local_tag: &str,
    extra_headers: &str,
    body: Option<ResponseBody<'_>>,
) -> Result<usize> {
    let via = crate::message::extract_header(request, "Via", "v")
        .ok_or(SipError::Invalid("missing Via"))?;
    let from = crate::message::extract_header(request, "From", "f")
        .ok_or(SipError::Invalid("missing From"))?;
    let to = crate::message::extract_header(request, "To", "t")
        .ok_or(SipError::Invalid("missing To"))?;
    let call_id = crate::message::extract_header(request, "Call-ID", "i")
        .ok_or(SipError::Invalid("missing Call-ID"))?;
    let cseq = crate::message::extract_header(request, "CSeq", "")
        .ok_or(SipError::Invalid("missing CSeq"))?;

    out.clear();
    write!(out, "SIP/2.0 {} {}\r\n", status, reason).map_err(|_| SipError::Capacity)?;
    write!(out, "Via: {}\r\n", via).map_err(|_| SipError::Capacity)?;
    write!(out, "From: {}\r\n", from).map_err(|_| SipError::Capacity)?;

    if !local_tag.is_empty() && crate::message::extract_tag(to).is_none() {
        write!(out, "To: {};tag={}\r\n", to, local_tag).map_err(|_| SipError::Capacity)?;
    } else {
        write!(out, "To: {}\r\n", to).map_err(|_| SipError::Capacity)?;
    }

    write!(out, "Call-ID: {}\r\nCSeq: {}\r\n", call_id, cseq).map_err(|_| SipError::Capacity)?;
    out.push_str(extra_headers);

    match body {
        Some(b) => write!(
            out,
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
            b.content_type,
            b.body.len(),
            b.body
        )
        .map_err(|_| SipError::Capacity)?,
        None => out
            .write_str("Content-Length: 0\r\n\r\n")
            .map_err(|_| SipError::Capacity)?,
    }

    Ok(out.len())
}

/// Plain 200 OK mirror of a request (OPTIONS/BYE/CANCEL handling).
pub fn build_ok_response(out: &mut String, request: &str) -> Result<usize> {
    build_response(out, request, 200, "OK", "", "", None)
}
