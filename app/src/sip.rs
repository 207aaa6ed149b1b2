//! SIP user agent: UDP signaling on a fixed local port, digest-
//! authenticated registration, outgoing ring (INVITE/CANCEL/ACK/BYE),
//! inbound call answering, and the in-call RTP receive path.
//!
//! All state lives in this struct and is touched only from the main task;
//! the one concession to other contexts is the deferred ring flag, a
//! single-writer atomic consumed by `check_pending_ring`. Message
//! assembly uses two buffers owned by the client (the ACK emitted while
//! handling a 401 must not clobber the INVITE being rebuilt), so the
//! builders are not reentrant, which the single-task ownership guarantees.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hardware::{MicCapture, NetInfo, SpeakerOutput};
use rtp_audio::{decode_g711, parse_telephone_event, RtpPacket};
use sdp::Direction;
use serde::Serialize;
use sip_core::{
    build_ack, build_bye, build_cancel, build_invite, build_non_2xx_ack,
    build_ok_response, build_register, build_response, parse_challenge,
    write_authorization_header, CallSession, DigestChallenge, DigestCredentials,
    LocalIdentity, PendingInvite, RegistrarStatus, ResponseBody,
};

use crate::config::SipConfig;
use crate::settings::SETTINGS;
use crate::tasks::rtp_tx::{spawn_rtp_tx, RtpTxHandle, RtpTxParams};

pub const LOCAL_SIP_PORT: u16 = 5062;
pub const REMOTE_SIP_PORT: u16 = 5060;
pub const SIP_RTP_PORT: u16 = 40000;

pub const REGISTER_INTERVAL: Duration = Duration::from_secs(60);
pub const RING_DURATION: Duration = Duration::from_secs(30);
pub const IN_CALL_HOLD: Duration = Duration::from_secs(60);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const CANCEL_WAIT: Duration = Duration::from_secs(3);
const PROXY_CACHE_TTL: Duration = Duration::from_secs(60);
const REGISTER_EXPIRES: u32 = 120;
const RX_BUF_SIZE: usize = 2048;
const MSG_BUF_CAPACITY: usize = 2048;
const SPEAKER_WRITE_TIMEOUT: Duration = Duration::from_millis(5);
const RTP_RX_PER_TICK: usize = 4;
const NET_WARN_INTERVAL: Duration = Duration::from_secs(10);

const ALLOW_METHODS: &str = "Allow: INVITE, ACK, BYE, CANCEL, OPTIONS\r\n";

/// Where this endpoint lives on the wire. Tests override the ports and
/// pin the proxy; production uses the defaults.
#[derive(Debug, Clone)]
pub struct SipEndpoint {
    pub domain: String,
    pub local_sip_port: u16,
    pub local_rtp_port: u16,
    /// Skips proxy resolution entirely when set.
    pub proxy_override: Option<SocketAddr>,
}

impl Default for SipEndpoint {
    fn default() -> Self {
        Self {
            domain: SETTINGS.sip_domain.to_string(),
            local_sip_port: LOCAL_SIP_PORT,
            local_rtp_port: SIP_RTP_PORT,
            proxy_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SipStatus {
    pub registered: bool,
    pub last_status_code: u16,
    pub ring_active: bool,
    pub call_active: bool,
}

/// Cloneable handle safe to use from any context (web handler, button
/// callback): it only flips a flag that the main loop consumes.
#[derive(Clone)]
pub struct RingRequester {
    flag: Arc<AtomicBool>,
}

impl RingRequester {
    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

pub struct SipClient {
    socket: UdpSocket,
    rtp_socket: Option<UdpSocket>,
    endpoint: SipEndpoint,
    net: Arc<dyn NetInfo>,
    mic: Arc<MicCapture>,
    speaker: Arc<SpeakerOutput>,

    registrar: RegistrarStatus,
    last_register: Option<Instant>,
    nonce_count: u32,
    last_challenge: Option<DigestChallenge>,

    pending: Option<PendingInvite>,
    call: Option<CallSession>,
    /// Config snapshot taken when the dialog started, so a mid-call web
    /// save cannot shear the identity under us.
    dialog_config: SipConfig,

    ring_requested: Arc<AtomicBool>,
    tx_task: Option<RtpTxHandle>,

    dtmf_cb: Option<Box<dyn FnMut(char) + Send>>,
    ring_tick_cb: Option<Box<dyn FnMut() + Send>>,

    proxy_cache: Option<(SocketAddr, Instant)>,
    last_remote: Option<SocketAddr>,
    last_net_warn: Option<Instant>,

    // State-owned message buffers (see module docs).
    msg_buf: String,
    msg_buf2: String,
    sdp_buf: String,
    auth_buf: String,

    verbose: bool,
}

impl SipClient {
    pub fn new(
        mut endpoint: SipEndpoint,
        net: Arc<dyn NetInfo>,
        mic: Arc<MicCapture>,
        speaker: Arc<SpeakerOutput>,
        verbose: bool,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, endpoint.local_sip_port))?;
        socket.set_nonblocking(true)?;
        endpoint.local_sip_port = socket.local_addr()?.port();

        // RTP bind failure is tolerated: signaling still works, calls run
        // without media.
        let rtp_socket =
            match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, endpoint.local_rtp_port)) {
                Ok(s) => {
                    let _ = s.set_nonblocking(true);
                    if let Ok(addr) = s.local_addr() {
                        endpoint.local_rtp_port = addr.port();
                    }
                    Some(s)
                }
                Err(e) => {
                    log::warn!("failed to bind RTP socket: {e}");
                    None
                }
            };

        log::info!(
            "SIP client initialized on port {}",
            socket.local_addr()?.port()
        );

        Ok(Self {
            socket,
            rtp_socket,
            endpoint,
            net,
            mic,
            speaker,
            registrar: RegistrarStatus::default(),
            last_register: None,
            nonce_count: 1,
            last_challenge: None,
            pending: None,
            call: None,
            dialog_config: SipConfig::default(),
            ring_requested: Arc::new(AtomicBool::new(false)),
            tx_task: None,
            dtmf_cb: None,
            ring_tick_cb: None,
            proxy_cache: None,
            last_remote: None,
            last_net_warn: None,
            msg_buf: String::with_capacity(MSG_BUF_CAPACITY),
            msg_buf2: String::with_capacity(MSG_BUF_CAPACITY),
            sdp_buf: String::with_capacity(512),
            auth_buf: String::with_capacity(512),
            verbose,
        })
    }

    pub fn local_sip_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn local_rtp_addr(&self) -> Option<SocketAddr> {
        self.rtp_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn set_dtmf_callback(&mut self, cb: impl FnMut(char) + Send + 'static) {
        self.dtmf_cb = Some(Box::new(cb));
    }

    pub fn set_ring_tick_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.ring_tick_cb = Some(Box::new(cb));
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn ring_requester(&self) -> RingRequester {
        RingRequester {
            flag: Arc::clone(&self.ring_requested),
        }
    }

    /// Deferred ring: only sets the flag. Safe from any context through
    /// [`RingRequester`]; this convenience form also refuses while busy.
    pub fn request_ring(&self) -> bool {
        if self.pending.is_some() || self.call.is_some() {
            return false;
        }
        self.ring_requested.store(true, Ordering::Release);
        log::info!("SIP ring requested (deferred)");
        true
    }

    pub fn ring_active(&self) -> bool {
        self.pending.is_some()
    }

    pub fn call_active(&self) -> bool {
        self.call.is_some()
    }

    pub fn is_registered(&self, now: Instant) -> bool {
        self.registrar.is_registered(now, REGISTER_INTERVAL)
    }

    pub fn status(&self, now: Instant) -> SipStatus {
        SipStatus {
            registered: self.is_registered(now),
            last_status_code: self.registrar.last_status_code,
            ring_active: self.ring_active(),
            call_active: self.call_active(),
        }
    }

    // --- Network plumbing --------------------------------------------------

    fn network_ready(&mut self, now: Instant) -> bool {
        if !self.net.is_connected() || self.net.local_ip().is_unspecified() {
            let warn_due = self
                .last_net_warn
                .map(|t| now.duration_since(t) > NET_WARN_INTERVAL)
                .unwrap_or(true);
            if warn_due {
                log::warn!("SIP paused: network not ready");
                self.last_net_warn = Some(now);
            }
            return false;
        }
        true
    }

    /// Proxy address, resolved once and cached for a minute. DNS first,
    /// default gateway as the residential-PBX fallback.
    fn resolve_proxy(&mut self, now: Instant) -> Option<SocketAddr> {
        if let Some(addr) = self.endpoint.proxy_override {
            return Some(addr);
        }
        if let Some((addr, at)) = self.proxy_cache {
            if now.duration_since(at) < PROXY_CACHE_TTL {
                return Some(addr);
            }
        }

        let resolved = (self.endpoint.domain.as_str(), REMOTE_SIP_PORT)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()));

        let addr = match resolved {
            Some(a) => a,
            None => {
                let gw = self.net.gateway_ip();
                if gw.is_unspecified() {
                    return None;
                }
                log::debug!("proxy DNS failed, using gateway");
                SocketAddr::from((gw, REMOTE_SIP_PORT))
            }
        };

        self.proxy_cache = Some((addr, now));
        Some(addr)
    }

    fn transmit(&mut self, data: &str, now: Instant) -> bool {
        if !self.network_ready(now) {
            return false;
        }
        let Some(dest) = self.resolve_proxy(now) else {
            log::warn!("cannot resolve SIP proxy");
            return false;
        };
        log_sip_message(">>> TX", data, self.verbose);
        match self.socket.send_to(data.as_bytes(), dest) {
            Ok(n) if n == data.len() => true,
            Ok(_) | Err(_) => {
                log::warn!("SIP send failed");
                false
            }
        }
    }

    fn transmit_response(&mut self, data: &str) -> bool {
        let Some(dest) = self.last_remote else {
            return false;
        };
        log_sip_message(">>> TX", data, self.verbose);
        self.socket.send_to(data.as_bytes(), dest).is_ok()
    }

    /// Blocking receive with a deadline, used only by the synchronous
    /// registration exchange.
    fn wait_for_response(&mut self, timeout: Duration) -> Option<String> {
        let _ = self.socket.set_nonblocking(false);
        let _ = self.socket.set_read_timeout(Some(timeout));
        let mut buf = [0u8; RX_BUF_SIZE];
        let result = self.socket.recv_from(&mut buf);
        let _ = self.socket.set_nonblocking(true);

        let (len, addr) = result.ok()?;
        self.last_remote = Some(addr);
        let text = String::from_utf8_lossy(&buf[..len]).into_owned();
        log_sip_message("<<< RX", &text, self.verbose);
        Some(text)
    }

    fn identity<'a>(&'a self, config: &'a SipConfig) -> LocalIdentity<'a> {
        LocalIdentity {
            user: &config.user,
            display_name: &config.display_name,
            domain: &self.endpoint.domain,
            local_ip: self.net.local_ip(),
            local_port: self.endpoint.local_sip_port,
            user_agent: SETTINGS.user_agent,
        }
    }

    fn registrar_uri(&self) -> String {
        format!("sip:{}", self.endpoint.domain)
    }

    /// Render the Authorization header for `method` into the client's
    /// auth buffer. The digest URI is always the registrar URI, also for
    /// INVITE, which strict servers would dislike but the Fritz!Box
    /// expects.
    fn render_auth_header(&mut self, config: &SipConfig, method: &str) -> Option<String> {
        let challenge = self.last_challenge.clone()?;
        let creds = DigestCredentials {
            username: &config.user,
            password: &config.password,
        };
        let uri = self.registrar_uri();

        let mut auth = std::mem::take(&mut self.auth_buf);
        auth.clear();
        let res = write_authorization_header(
            &mut auth,
            &challenge,
            &creds,
            method,
            &uri,
            &mut self.nonce_count,
            hardware::random_u32(),
        );
        let header = res.ok().map(|_| auth.clone());
        self.auth_buf = auth;
        header
    }

    // --- Registration ------------------------------------------------------

    /// First call registers immediately, afterwards every 60 s; skipped
    /// while a call is up.
    pub fn register_if_needed(&mut self, config: &SipConfig, now: Instant) {
        if let Some(last) = self.last_register {
            if now.duration_since(last) < REGISTER_INTERVAL {
                return;
            }
        }
        if self.call.is_some() || self.pending.is_some() {
            return;
        }
        if !self.network_ready(now) {
            return;
        }
        log::info!("attempting SIP registration...");
        self.register(config, now);
    }

    /// Synchronous REGISTER with one digest retry. Returns success.
    pub fn register(&mut self, config: &SipConfig, now: Instant) -> bool {
        if !config.is_valid() {
            log::warn!("SIP config incomplete");
            return false;
        }
        if !self.network_ready(now) {
            return false;
        }

        self.registrar.note_attempt(now);
        self.last_register = Some(now);

        let from_tag = fresh_tag();
        let call_id = fresh_call_id(self.net.local_ip());
        let mut branch = fresh_branch();
        let mut cseq = 1u32;

        if !self.send_register(config, &from_tag, &call_id, &branch, cseq, None, now) {
            log::error!("failed to send REGISTER");
            return false;
        }

        let Some(response) = self.wait_for_response(RESPONSE_TIMEOUT) else {
            log::warn!("no response to REGISTER (timeout)");
            return false;
        };

        let status = sip_core::status_code(&response).unwrap_or(0);
        self.registrar.note_result(status, Instant::now());

        if status == 401 || status == 407 {
            let Some(challenge) = parse_challenge(&response) else {
                log::error!("failed to parse auth challenge");
                return false;
            };
            self.last_challenge = Some(challenge);

            cseq += 1;
            branch = fresh_branch();
            let auth = self.render_auth_header(config, "REGISTER");
            if !self.send_register(
                config,
                &from_tag,
                &call_id,
                &branch,
                cseq,
                auth.as_deref(),
                now,
            ) {
                log::error!("failed to send authenticated REGISTER");
                return false;
            }

            let Some(response) = self.wait_for_response(RESPONSE_TIMEOUT) else {
                log::warn!("no response to authenticated REGISTER");
                return false;
            };
            let status = sip_core::status_code(&response).unwrap_or(0);
            self.registrar.note_result(status, Instant::now());
            if self.registrar.last_ok {
                log::info!("SIP registration successful");
            } else {
                log::warn!("SIP registration failed: {status}");
            }
        } else if self.registrar.last_ok {
            log::info!("SIP registration successful (no auth)");
        } else {
            log::warn!("SIP registration failed: {status}");
        }

        self.registrar.last_ok
    }

    fn send_register(
        &mut self,
        config: &SipConfig,
        from_tag: &str,
        call_id: &str,
        branch: &str,
        cseq: u32,
        auth_header: Option<&str>,
        now: Instant,
    ) -> bool {
        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_register(
            &mut buf,
            &self.identity(config),
            from_tag,
            call_id,
            branch,
            cseq,
            REGISTER_EXPIRES,
            auth_header,
        )
        .is_ok();
        let sent = built && self.transmit(&buf, now);
        self.msg_buf = buf;
        sent
    }

    // --- Outgoing ring -----------------------------------------------------

    /// Consume the deferred ring flag (main loop only).
    pub fn check_pending_ring(&mut self, config: &SipConfig, now: Instant) {
        if !self.ring_requested.swap(false, Ordering::AcqRel) {
            return;
        }
        if !config.is_valid() {
            log::warn!("cannot ring: invalid config");
            return;
        }
        if !self.ring(config, now) {
            log::warn!("deferred ring failed");
        }
    }

    /// Build and send the first INVITE. Further processing happens in
    /// `ring_process` and `handle_incoming`.
    pub fn ring(&mut self, config: &SipConfig, now: Instant) -> bool {
        if !config.is_valid() {
            log::warn!("SIP config incomplete");
            return false;
        }
        if !self.network_ready(now) {
            return false;
        }
        if self.pending.is_some() {
            log::info!("SIP ring already active");
            return false;
        }
        if self.call.is_some() {
            log::info!("SIP call already active");
            return false;
        }

        let target = format!("{}@{}", config.target, self.endpoint.domain);
        let pending = PendingInvite::new(
            target,
            fresh_call_id(self.net.local_ip()),
            fresh_tag(),
            fresh_branch(),
            now,
        );
        self.dialog_config = config.clone();

        self.render_local_sdp();
        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_invite(
            &mut buf,
            &self.identity(config),
            &pending.target,
            &pending.from_tag,
            &pending.call_id,
            &pending.branch,
            pending.cseq,
            None,
            &self.sdp_buf,
        )
        .is_ok();

        log::info!("sending INVITE to {}", config.target);
        let sent = built && self.transmit(&buf, now);
        self.msg_buf = buf;

        if sent {
            self.pending = Some(pending);
        }
        sent
    }

    /// Periodic driver for the pending-INVITE state machine.
    pub fn ring_process(&mut self, now: Instant) {
        if self.pending.is_none() {
            return;
        }
        if let Some(cb) = self.ring_tick_cb.as_mut() {
            cb();
        }

        let answered = self.pending.as_ref().map(|p| p.answered).unwrap_or(false);
        if answered {
            self.process_answered(now);
            return;
        }

        let (started, can_cancel, cancel_sent, cancel_at) = {
            let p = self.pending.as_ref().expect("checked above");
            (p.started, p.can_cancel, p.cancel_sent, p.cancel_at)
        };

        // Ring timer: CANCEL once we are allowed to (a provisional arrived),
        // otherwise just drop the transaction.
        if now.duration_since(started) >= RING_DURATION && !cancel_sent {
            if can_cancel {
                let sent = self.send_cancel(now);
                let p = self.pending.as_mut().expect("still pending");
                p.cancel_sent = sent;
                p.cancel_at = Some(now);
                if !sent {
                    self.clear_dialog_state();
                }
            } else {
                log::info!("ring timeout without provisional response");
                self.clear_dialog_state();
            }
            return;
        }

        // Grace period for the 487 after CANCEL.
        if cancel_sent {
            if let Some(at) = cancel_at {
                if now.duration_since(at) > CANCEL_WAIT {
                    self.clear_dialog_state();
                }
            }
        }
    }

    fn send_cancel(&mut self, now: Instant) -> bool {
        let (target, from_tag, to_tag, call_id, branch, cseq) = {
            let p = self.pending.as_ref().expect("pending");
            (
                p.target.clone(),
                p.from_tag.clone(),
                p.to_tag.clone(),
                p.call_id.clone(),
                p.branch.clone(),
                p.cseq,
            )
        };
        let config = self.dialog_config.clone();

        log::info!("ring timeout, sending CANCEL");
        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_cancel(
            &mut buf,
            &self.identity(&config),
            &target,
            &from_tag,
            &to_tag,
            &call_id,
            &branch,
            cseq,
        )
        .is_ok();
        let sent = built && self.transmit(&buf, now);
        self.msg_buf = buf;
        sent
    }

    fn process_answered(&mut self, now: Instant) {
        let ack_sent = self.pending.as_ref().map(|p| p.ack_sent).unwrap_or(false);

        if !ack_sent {
            let (request_uri, target, from_tag, to_tag, call_id, cseq, media, remote_target) = {
                let p = self.pending.as_ref().expect("pending");
                (
                    p.dialog_request_uri().to_string(),
                    p.target.clone(),
                    p.from_tag.clone(),
                    p.to_tag.clone(),
                    p.call_id.clone(),
                    p.cseq,
                    p.media.clone(),
                    p.remote_target.clone(),
                )
            };
            let config = self.dialog_config.clone();

            log::debug!("sending ACK");
            let mut buf = std::mem::take(&mut self.msg_buf);
            let built = build_ack(
                &mut buf,
                &self.identity(&config),
                &request_uri,
                &target,
                &from_tag,
                &to_tag,
                &call_id,
                &fresh_branch(),
                cseq,
            )
            .is_ok();
            let sent = built && self.transmit(&buf, now);
            self.msg_buf = buf;

            if !sent {
                self.clear_dialog_state();
                return;
            }

            {
                let p = self.pending.as_mut().expect("pending");
                p.ack_sent = true;
                p.answered_at = Some(now);
            }

            // Enter the active-call phase.
            let mut call = CallSession::new(false, call_id, from_tag, to_tag, now);
            call.acked = true;
            call.request_uri = request_uri;
            call.remote_contact = remote_target;
            if let Some(media) = &media {
                call.apply_media(media);
            }
            call.local_sends = self.mic.is_enabled();
            call.local_receives = true;
            call.rtp_ssrc = hardware::random_u32();
            self.call = Some(call);
            self.ensure_tx_task();
            return;
        }

        // Auto-BYE after the in-call hold.
        let bye_due = {
            let p = self.pending.as_ref().expect("pending");
            !p.bye_sent
                && p.answered_at
                    .map(|t| now.duration_since(t) > IN_CALL_HOLD)
                    .unwrap_or(false)
        };
        if bye_due {
            self.send_bye_for_pending(now);
            self.clear_dialog_state();
        }
    }

    fn send_bye_for_pending(&mut self, now: Instant) {
        let (request_uri, target, from_tag, to_tag, call_id, cseq) = {
            let p = self.pending.as_ref().expect("pending");
            (
                p.dialog_request_uri().to_string(),
                p.target.clone(),
                p.from_tag.clone(),
                p.to_tag.clone(),
                p.call_id.clone(),
                p.cseq + 1,
            )
        };
        let config = self.dialog_config.clone();

        log::debug!("sending BYE");
        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_bye(
            &mut buf,
            &self.identity(&config),
            &request_uri,
            &target,
            &from_tag,
            &to_tag,
            &call_id,
            &fresh_branch(),
            cseq,
        )
        .is_ok();
        if built {
            self.transmit(&buf, now);
        }
        self.msg_buf = buf;
    }

    fn send_bye_for_call(&mut self, now: Instant) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        if call.bye_sent {
            return;
        }
        let request_uri = call.bye_request_uri().to_string();
        let to_target = strip_sip_prefix(if call.remote_uri.is_empty() {
            &call.request_uri
        } else {
            &call.remote_uri
        })
        .to_string();
        let (from_tag, to_tag, call_id) =
            (call.local_tag.clone(), call.remote_tag.clone(), call.call_id.clone());
        let sip_remote = call.sip_remote;
        let cseq = {
            let call = self.call.as_mut().expect("checked");
            call.next_cseq()
        };
        let config = self.dialog_config.clone();

        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_bye(
            &mut buf,
            &self.identity(&config),
            &request_uri,
            &to_target,
            &from_tag,
            &to_tag,
            &call_id,
            &fresh_branch(),
            cseq,
        )
        .is_ok();
        if built {
            log::debug!("sending BYE");
            let sent = match sip_remote {
                Some(dest) => {
                    log_sip_message(">>> TX", &buf, self.verbose);
                    self.socket.send_to(buf.as_bytes(), dest).is_ok()
                }
                None => self.transmit(&buf, now),
            };
            if let Some(call) = self.call.as_mut() {
                call.bye_sent = sent;
            }
        }
        self.msg_buf = buf;
    }

    // --- Incoming datagrams ------------------------------------------------

    /// Drain the signaling socket. Malformed datagrams are ignored per
    /// RFC 3261 robustness.
    pub fn handle_incoming(&mut self, config: &SipConfig, now: Instant) {
        loop {
            let mut buf = [0u8; RX_BUF_SIZE];
            match self.socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    let Ok(text) = core::str::from_utf8(&buf[..len]) else {
                        continue;
                    };
                    let text = text.to_string();
                    self.last_remote = Some(addr);
                    log_sip_message("<<< RX", &text, self.verbose);

                    if sip_core::is_response(&text) {
                        self.handle_response(&text, now);
                    } else {
                        self.handle_request(&text, addr, config, now);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("SIP recv error: {e}");
                    break;
                }
            }
        }
    }

    fn handle_response(&mut self, text: &str, now: Instant) {
        if self.pending.is_none() {
            return;
        }

        let Some(call_id) = sip_core::extract_header(text, "Call-ID", "i") else {
            return;
        };
        if !call_id.eq_ignore_ascii_case(&self.pending.as_ref().unwrap().call_id) {
            return;
        }
        let Some((resp_cseq, resp_method)) = sip_core::parse_cseq(text) else {
            return;
        };
        if !resp_method.eq_ignore_ascii_case("INVITE") {
            return;
        }

        let status = sip_core::status_code(text).unwrap_or(0);
        let is_current = resp_cseq == self.pending.as_ref().unwrap().cseq;
        let to_tag = sip_core::extract_to_tag(text).unwrap_or("").to_string();

        if is_current {
            let contact = sip_core::extract_contact_uri(text).map(str::to_string);
            let media = sip_core::sdp_body(text).map(|body| {
                sdp::parse_media(body, self.remote_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED))
            });
            let p = self.pending.as_mut().expect("pending");
            if !to_tag.is_empty() {
                p.to_tag = to_tag.clone();
            }
            if let Some(contact) = contact {
                p.remote_target = contact;
            }
            if let Some(media) = media {
                p.media = Some(media);
            }
        }

        if status == 401 || status == 407 {
            // ACK the failure on the INVITE's branch, into the second
            // buffer, the first is about to rebuild the INVITE.
            let branch = sip_core::extract_via_branch(text)
                .unwrap_or(self.pending.as_ref().unwrap().branch.as_str())
                .to_string();
            self.send_auth_ack(&to_tag, &branch, resp_cseq, now);

            let auth_done = {
                let p = self.pending.as_ref().expect("pending");
                !is_current || p.auth_sent
            };
            if auth_done {
                return;
            }

            log::info!("INVITE needs authentication");
            let Some(challenge) = parse_challenge(text) else {
                log::error!("failed to parse INVITE auth challenge");
                return;
            };
            self.last_challenge = Some(challenge);
            self.resend_invite_with_auth(now);
            return;
        }

        if (100..200).contains(&status) {
            log::info!("received {status} provisional response");
            if is_current {
                self.pending.as_mut().expect("pending").can_cancel = true;
            }
            return;
        }

        if (200..300).contains(&status) {
            if is_current {
                log::info!("call answered");
                let p = self.pending.as_mut().expect("pending");
                p.can_cancel = false;
                p.answered = true;
            }
            return;
        }

        if status >= 300 {
            let branch = sip_core::extract_via_branch(text)
                .unwrap_or(self.pending.as_ref().unwrap().branch.as_str())
                .to_string();
            self.send_non_2xx_ack(&to_tag, &branch, resp_cseq, now, false);
            if is_current {
                log::warn!("INVITE failed with status {status}");
                self.clear_dialog_state();
            }
        }
    }

    /// Non-2xx ACK during the auth retry: must use the secondary buffer.
    fn send_auth_ack(&mut self, to_tag: &str, branch: &str, cseq: u32, now: Instant) {
        self.send_non_2xx_ack(to_tag, branch, cseq, now, true);
    }

    fn send_non_2xx_ack(
        &mut self,
        to_tag: &str,
        branch: &str,
        cseq: u32,
        now: Instant,
        use_secondary_buf: bool,
    ) {
        let (target, from_tag, call_id) = {
            let p = self.pending.as_ref().expect("pending");
            (p.target.clone(), p.from_tag.clone(), p.call_id.clone())
        };
        let config = self.dialog_config.clone();

        let mut buf = if use_secondary_buf {
            std::mem::take(&mut self.msg_buf2)
        } else {
            std::mem::take(&mut self.msg_buf)
        };
        let built = build_non_2xx_ack(
            &mut buf,
            &self.identity(&config),
            &target,
            &from_tag,
            to_tag,
            &call_id,
            branch,
            cseq,
        )
        .is_ok();
        if built {
            self.transmit(&buf, now);
        }
        if use_secondary_buf {
            self.msg_buf2 = buf;
        } else {
            self.msg_buf = buf;
        }
    }

    fn resend_invite_with_auth(&mut self, now: Instant) {
        let config = self.dialog_config.clone();
        let auth = self.render_auth_header(&config, "INVITE");

        let (target, from_tag, call_id, cseq, branch) = {
            let p = self.pending.as_mut().expect("pending");
            p.cseq += 1;
            p.branch = fresh_branch();
            (
                p.target.clone(),
                p.from_tag.clone(),
                p.call_id.clone(),
                p.cseq,
                p.branch.clone(),
            )
        };

        self.render_local_sdp();
        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_invite(
            &mut buf,
            &self.identity(&config),
            &target,
            &from_tag,
            &call_id,
            &branch,
            cseq,
            auth.as_deref(),
            &self.sdp_buf,
        )
        .is_ok();

        log::info!("sending authenticated INVITE");
        let sent = built && self.transmit(&buf, now);
        self.msg_buf = buf;

        if sent {
            self.pending.as_mut().expect("pending").auth_sent = true;
        } else {
            log::error!("failed to send authenticated INVITE");
            self.clear_dialog_state();
        }
    }

    fn handle_request(
        &mut self,
        text: &str,
        addr: SocketAddr,
        config: &SipConfig,
        now: Instant,
    ) {
        let Some(method) = sip_core::method_token(text) else {
            return;
        };

        if method.eq_ignore_ascii_case("OPTIONS") {
            let mut buf = std::mem::take(&mut self.msg_buf);
            if build_response(&mut buf, text, 200, "OK", "", ALLOW_METHODS, None).is_ok() {
                log::debug!("responding to OPTIONS");
                self.transmit_response(&buf);
            }
            self.msg_buf = buf;
            return;
        }

        if method.eq_ignore_ascii_case("BYE") || method.eq_ignore_ascii_case("CANCEL") {
            let mut buf = std::mem::take(&mut self.msg_buf);
            if build_ok_response(&mut buf, text).is_ok() {
                self.transmit_response(&buf);
            }
            self.msg_buf = buf;
            self.clear_dialog_state();
            return;
        }

        if method.eq_ignore_ascii_case("INVITE") {
            if self.pending.is_some() || self.call.is_some() {
                log::info!("incoming INVITE while busy, sending 486");
                let mut buf = std::mem::take(&mut self.msg_buf);
                if build_response(&mut buf, text, 486, "Busy Here", "", "", None).is_ok() {
                    self.transmit_response(&buf);
                }
                self.msg_buf = buf;
                return;
            }
            self.handle_inbound_invite(text, addr, config, now);
            return;
        }

        if method.eq_ignore_ascii_case("ACK") {
            let call_id = sip_core::extract_header(text, "Call-ID", "i").unwrap_or("");
            let matches = self
                .call
                .as_ref()
                .map(|c| c.inbound && c.call_id.eq_ignore_ascii_case(call_id))
                .unwrap_or(false);
            if matches {
                let call = self.call.as_mut().expect("matched");
                call.acked = true;
                call.started = now;
                self.ensure_tx_task();
            }
        }
    }

    /// Answer an inbound INVITE immediately: 100 Trying, then 200 OK with
    /// our SDP, so the PBX treats us as an intercom endpoint.
    fn handle_inbound_invite(
        &mut self,
        text: &str,
        addr: SocketAddr,
        config: &SipConfig,
        now: Instant,
    ) {
        let Some(call_id) = sip_core::extract_header(text, "Call-ID", "i") else {
            return;
        };
        let call_id = call_id.to_string();
        let from_line = sip_core::extract_header(text, "From", "f").unwrap_or("");
        let remote_tag = sip_core::extract_tag(from_line).unwrap_or("").to_string();
        let remote_uri = sip_core::extract_sip_uri(from_line).unwrap_or("").to_string();
        let request_uri = sip_core::request_uri(text).unwrap_or("").to_string();
        let remote_contact = sip_core::extract_contact_uri(text)
            .map(str::to_string)
            .unwrap_or_else(|| remote_uri.clone());
        let remote_cseq = sip_core::parse_cseq(text).map(|(n, _)| n).unwrap_or(0);

        let media = sip_core::sdp_body(text).map(|body| {
            sdp::parse_media(
                body,
                match addr.ip() {
                    std::net::IpAddr::V4(ip) => ip,
                    _ => Ipv4Addr::UNSPECIFIED,
                },
            )
        });

        let local_tag = fresh_tag();
        let mut call = CallSession::new(true, call_id, local_tag.clone(), remote_tag, now);
        call.remote_contact = remote_contact;
        call.remote_uri = remote_uri;
        call.request_uri = request_uri;
        call.remote_cseq = remote_cseq;
        call.sip_remote = Some(addr);
        if let Some(media) = &media {
            call.apply_media(media);
        }
        call.local_sends = self.mic.is_enabled();
        call.local_receives = true;
        call.rtp_seq = hardware::random_u32() as u16;
        call.rtp_timestamp = hardware::random_u32();
        call.rtp_ssrc = hardware::random_u32();
        self.dialog_config = config.clone();

        log::info!("SIP inbound INVITE received");

        // 100 Trying
        let mut buf = std::mem::take(&mut self.msg_buf);
        if build_response(&mut buf, text, 100, "Trying", "", "", None).is_ok() {
            self.transmit_response(&buf);
        }
        self.msg_buf = buf;

        // 200 OK with SDP and Contact
        self.render_local_sdp();
        let contact = format!(
            "Contact: <sip:{}@{}:{}>\r\n",
            config.user,
            self.net.local_ip(),
            self.endpoint.local_sip_port
        );
        let mut buf = std::mem::take(&mut self.msg_buf);
        let built = build_response(
            &mut buf,
            text,
            200,
            "OK",
            &local_tag,
            &contact,
            Some(ResponseBody {
                content_type: "application/sdp",
                body: &self.sdp_buf,
            }),
        )
        .is_ok();
        if built {
            self.transmit_response(&buf);
        }
        self.msg_buf = buf;

        self.call = Some(call);
    }

    // --- Media -------------------------------------------------------------

    /// In-call RTP receive path, polled from the main loop.
    pub fn media_process(&mut self, now: Instant) {
        let active = self
            .call
            .as_ref()
            .map(|c| c.acked)
            .unwrap_or(false);
        if !active {
            return;
        }
        self.ensure_tx_task();

        // Inbound calls hang up by themselves after the hold time.
        let hold_expired = {
            let call = self.call.as_ref().expect("active");
            call.inbound && now.duration_since(call.started) > IN_CALL_HOLD
        };
        if hold_expired {
            self.send_bye_for_call(now);
            self.clear_dialog_state();
            return;
        }

        let Some(rtp) = self.rtp_socket.as_ref() else {
            return;
        };

        for _ in 0..RTP_RX_PER_TICK {
            let mut buf = [0u8; 512];
            let (len, addr) = match rtp.recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => break,
            };

            let call = self.call.as_mut().expect("active");
            // Source filter: only the negotiated media address talks to us.
            if !call.rtp_remote_ip.is_unspecified() {
                match addr.ip() {
                    std::net::IpAddr::V4(ip) if ip == call.rtp_remote_ip => {}
                    _ => continue,
                }
            }

            let Ok(packet) = RtpPacket::<512>::unpack(&buf[..len]) else {
                continue;
            };

            if packet.header.payload_type == call.dtmf_payload {
                if let Some(event) = parse_telephone_event(&packet.payload) {
                    if let Some(digit) = call.note_dtmf(event.event, event.end, now) {
                        log::info!("DTMF digit '{digit}'");
                        if let Some(cb) = self.dtmf_cb.as_mut() {
                            cb(digit);
                        }
                    }
                }
                continue;
            }

            let pt = packet.header.payload_type;
            if pt != 0 && pt != 8 {
                continue;
            }
            if !call.local_receives || !call.remote_sends {
                continue;
            }

            let samples = packet.payload.len().min(160);
            let mut pcm = [0i16; 160];
            decode_g711(&packet.payload[..samples], pt, &mut pcm[..samples]);

            // Sample-hold upsample to the 16 kHz hardware rate.
            let mut out = [0i16; 320];
            crate::dsp::upsample(&pcm[..samples], &mut out[..samples * 2]);

            // Contention with the gong drops the packet, not the call.
            self.speaker.write(&out[..samples * 2], SPEAKER_WRITE_TIMEOUT);
            call.last_rtp_recv = Some(now);
        }
    }

    fn ensure_tx_task(&mut self) {
        if self
            .tx_task
            .as_ref()
            .map(|t| t.is_active())
            .unwrap_or(false)
        {
            return;
        }

        let Some(call) = self.call.as_ref() else {
            return;
        };
        if !call.acked || !call.remote_receives {
            return;
        }
        if call.rtp_remote_port == 0 || call.rtp_remote_ip.is_unspecified() {
            return;
        }
        let Some(socket) = self.rtp_socket.as_ref().and_then(|s| s.try_clone().ok())
        else {
            return;
        };

        let params = RtpTxParams {
            dest: SocketAddr::from((call.rtp_remote_ip, call.rtp_remote_port)),
            payload_type: call.audio_payload,
            ssrc: call.rtp_ssrc,
            start_seq: call.rtp_seq,
            start_timestamp: call.rtp_timestamp,
            local_sends: call.local_sends,
        };
        self.tx_task = Some(spawn_rtp_tx(socket, params, Arc::clone(&self.mic)));
    }

    // --- Shared teardown ---------------------------------------------------

    fn clear_dialog_state(&mut self) {
        if let Some(task) = self.tx_task.take() {
            task.stop();
        }
        self.pending = None;
        self.call = None;
    }

    fn render_local_sdp(&mut self) {
        let direction = Direction::from_local_audio(
            self.mic.is_enabled() && !self.mic.is_muted(),
            self.speaker.volume() > 0,
        );
        let mut buf = std::mem::take(&mut self.sdp_buf);
        let _ = sdp::build_audio_offer(
            &mut buf,
            self.net.local_ip(),
            self.endpoint.local_rtp_port,
            direction,
        );
        self.sdp_buf = buf;
    }

    fn remote_ipv4(&self) -> Option<Ipv4Addr> {
        match self.last_remote?.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            _ => None,
        }
    }
}

// --- Small helpers ---------------------------------------------------------

fn fresh_tag() -> String {
    format!("{:08x}", hardware::random_u32())
}

fn fresh_branch() -> String {
    format!("z9hG4bK-{:08x}", hardware::random_u32())
}

fn fresh_call_id(local_ip: Ipv4Addr) -> String {
    format!("{:08x}@{}", hardware::random_u32(), local_ip)
}

fn strip_sip_prefix(uri: &str) -> &str {
    uri.strip_prefix("sip:").unwrap_or(uri)
}

/// First line always; full dump when verbose logging is on.
fn log_sip_message(prefix: &str, msg: &str, verbose: bool) {
    let first = msg.split("\r\n").next().unwrap_or("");
    log::info!("{prefix}: {first}");
    if verbose {
        for line in msg.split("\r\n") {
            log::info!("{prefix} | {line}");
        }
    }
}
