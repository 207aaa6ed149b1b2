//! Dialog-side state carried by the user agent: the single pending INVITE,
//! the single active call session, and the registration status. All of it
//! is owned and mutated by the main task only, without locking (see the
//! concurrency notes in the app crate).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use sdp::MediaInfo;

/// Duplicate end-of-event suppression window for RFC 4733 digits.
pub const DTMF_DEDUP: Duration = Duration::from_millis(250);

/// Registration freshness bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RegistrarStatus {
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_status_code: u16,
    pub last_ok: bool,
}

impl RegistrarStatus {
    pub fn note_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
        self.last_ok = false;
    }

    pub fn note_result(&mut self, status: u16, now: Instant) {
        self.last_status_code = status;
        if (200..300).contains(&status) {
            self.last_ok = true;
            self.last_success = Some(now);
        } else {
            self.last_ok = false;
        }
    }

    /// Registered and fresh: the last success is within twice the refresh
    /// interval.
    pub fn is_registered(&self, now: Instant, register_interval: Duration) -> bool {
        if !self.last_ok {
            return false;
        }
        match self.last_success {
            Some(ok) => now.duration_since(ok) <= register_interval * 2,
            None => false,
        }
    }
}

/// Client-side INVITE transaction, alive from the first INVITE until a
/// terminal response, ring timeout, or transport error.
#[derive(Debug, Clone)]
pub struct PendingInvite {
    pub auth_sent: bool,
    pub can_cancel: bool,
    pub answered: bool,
    pub ack_sent: bool,
    pub bye_sent: bool,
    pub cancel_sent: bool,
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
    pub cseq: u32,
    pub branch: String,
    /// user@domain we are calling.
    pub target: String,
    /// Contact from a 1xx/2xx, used as the dialog request-URI.
    pub remote_target: String,
    pub started: Instant,
    pub answered_at: Option<Instant>,
    pub cancel_at: Option<Instant>,
    pub media: Option<MediaInfo>,
}

impl PendingInvite {
    pub fn new(
        target: String,
        call_id: String,
        from_tag: String,
        branch: String,
        now: Instant,
    ) -> Self {
        Self {
            auth_sent: false,
            can_cancel: false,
            answered: false,
            ack_sent: false,
            bye_sent: false,
            cancel_sent: false,
            call_id,
            from_tag,
            to_tag: String::new(),
            cseq: 1,
            branch,
            target,
            remote_target: String::new(),
            started: now,
            answered_at: None,
            cancel_at: None,
            media: None,
        }
    }

    /// Request-URI for in-dialog requests: the remote Contact when we have
    /// one, the original target otherwise.
    pub fn dialog_request_uri(&self) -> &str {
        if self.remote_target.is_empty() {
            &self.target
        } else {
            &self.remote_target
        }
    }

    pub fn media_ready(&self) -> bool {
        self.media
            .as_ref()
            .map(|m| m.remote_port > 0)
            .unwrap_or(false)
    }
}

/// Established call (inbound or outbound). At most one exists, and never
/// together with a pending INVITE for a different dialog.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub inbound: bool,
    pub acked: bool,
    pub bye_sent: bool,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
    pub remote_contact: String,
    pub remote_uri: String,
    pub request_uri: String,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    /// Where in-dialog requests go when it differs from the proxy.
    pub sip_remote: Option<SocketAddr>,
    pub rtp_remote_ip: Ipv4Addr,
    pub rtp_remote_port: u16,
    pub audio_payload: u8,
    pub dtmf_payload: u8,
    pub remote_sends: bool,
    pub remote_receives: bool,
    pub local_sends: bool,
    pub local_receives: bool,
    pub started: Instant,
    pub last_rtp_send: Option<Instant>,
    pub last_rtp_recv: Option<Instant>,
    pub rtp_seq: u16,
    pub rtp_timestamp: u32,
    pub rtp_ssrc: u32,
    last_dtmf_event: Option<u8>,
    last_dtmf_end: Option<Instant>,
}

impl CallSession {
    pub fn new(
        inbound: bool,
        call_id: String,
        local_tag: String,
        remote_tag: String,
        now: Instant,
    ) -> Self {
        Self {
            inbound,
            acked: false,
            bye_sent: false,
            call_id,
            local_tag,
            remote_tag,
            remote_contact: String::new(),
            remote_uri: String::new(),
            request_uri: String::new(),
            local_cseq: 1,
            remote_cseq: 0,
            sip_remote: None,
            rtp_remote_ip: Ipv4Addr::UNSPECIFIED,
            rtp_remote_port: 0,
            audio_payload: 0,
            dtmf_payload: sdp::DEFAULT_DTMF_PAYLOAD,
            remote_sends: true,
            remote_receives: true,
            local_sends: true,
            local_receives: true,
            started: now,
            last_rtp_send: None,
            last_rtp_recv: None,
            rtp_seq: 0,
            rtp_timestamp: 0,
            rtp_ssrc: 0,
            last_dtmf_event: None,
            last_dtmf_end: None,
        }
    }

    pub fn apply_media(&mut self, media: &MediaInfo) {
        self.rtp_remote_ip = media.remote_ip;
        self.rtp_remote_port = media.remote_port;
        self.audio_payload = media.negotiated_audio_payload();
        self.dtmf_payload = media.dtmf_payload;
        self.remote_sends = media.remote_sends;
        self.remote_receives = media.remote_receives;
    }

    /// Request-URI for BYE: remote Contact preferred, then the stored
    /// request-URI.
    pub fn bye_request_uri(&self) -> &str {
        if self.remote_contact.is_empty() {
            &self.request_uri
        } else {
            &self.remote_contact
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        let c = self.local_cseq;
        self.local_cseq = self.local_cseq.wrapping_add(1);
        c
    }

    /// Apply one decoded telephone-event. Returns the digit exactly once
    /// per keypress: only end-of-event marks count, and duplicate ends
    /// within the dedup window are dropped (RFC 4733 retransmits them).
    pub fn note_dtmf(&mut self, event: u8, end: bool, now: Instant) -> Option<char> {
        if !end {
            return None;
        }
        if self.last_dtmf_event == Some(event) {
            if let Some(t) = self.last_dtmf_end {
                if now.duration_since(t) < DTMF_DEDUP {
                    return None;
                }
            }
        }
        self.last_dtmf_event = Some(event);
        self.last_dtmf_end = Some(now);
        rtp_audio_digit(event)
    }
}

// Local alias so this crate does not depend on rtp_audio just for the map.
fn rtp_audio_digit(event: u8) -> Option<char> {
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12..=15 => Some((b'A' + (event - 12)) as char),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_freshness_window() {
        let interval = Duration::from_secs(60);
        let t0 = Instant::now();
        let mut reg = RegistrarStatus::default();

        assert!(!reg.is_registered(t0, interval));

        reg.note_attempt(t0);
        reg.note_result(200, t0);
        assert!(reg.is_registered(t0 + Duration::from_secs(119), interval));
        assert!(!reg.is_registered(t0 + Duration::from_secs(121), interval));

        reg.note_result(403, t0 + Duration::from_secs(10));
        assert!(!reg.is_registered(t0 + Duration::from_secs(11), interval));
    }

    #[test]
    fn dialog_request_uri_prefers_contact() {
        let now = Instant::now();
        let mut p = PendingInvite::new(
            "**610@fritz.box".into(),
            "cid".into(),
            "tag".into(),
            "branch".into(),
            now,
        );
        assert_eq!(p.dialog_request_uri(), "**610@fritz.box");
        p.remote_target = "sip:610@192.168.178.2".into();
        assert_eq!(p.dialog_request_uri(), "sip:610@192.168.178.2");
    }

    #[test]
    fn dtmf_end_dedup_within_window() {
        let t0 = Instant::now();
        let mut call = CallSession::new(false, "c".into(), "l".into(), "r".into(), t0);

        // press, not end -> nothing
        assert_eq!(call.note_dtmf(5, false, t0), None);
        // first end fires
        assert_eq!(call.note_dtmf(5, true, t0), Some('5'));
        // retransmitted end within 250 ms suppressed
        assert_eq!(call.note_dtmf(5, true, t0 + Duration::from_millis(100)), None);
        // same digit after the window fires again
        assert_eq!(
            call.note_dtmf(5, true, t0 + Duration::from_millis(400)),
            Some('5')
        );
        // different digit fires immediately
        assert_eq!(
            call.note_dtmf(11, true, t0 + Duration::from_millis(410)),
            Some('#')
        );
    }

    #[test]
    fn media_application() {
        let now = Instant::now();
        let mut call = CallSession::new(false, "c".into(), "l".into(), "r".into(), now);
        let media = sdp::parse_media(
            "c=IN IP4 192.168.178.2\r\nm=audio 7078 RTP/AVP 8 101\r\na=rtpmap:101 telephone-event/8000\r\n",
            Ipv4Addr::UNSPECIFIED,
        );
        call.apply_media(&media);
        assert_eq!(call.rtp_remote_port, 7078);
        assert_eq!(call.audio_payload, 8);
        assert_eq!(call.dtmf_payload, 101);
    }
}
