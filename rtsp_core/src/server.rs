//! The RTSP serving task: accepts control connections, drives the
//! handshake, and fans out RTP media to every playing session from a
//! single loop. Sessions are owned exclusively by this task.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hardware::camera::Camera;

use crate::jpeg::{self, ScanData, MAX_RTP_PAYLOAD, RTP_JPEG_HEADER_LEN};
use crate::request;
use crate::session::{alloc_session_id, RtspSession, Track, Transport, MAX_SESSIONS};
use crate::{aac_pack, Result, RtspError};

const FRAME_INTERVAL: Duration = Duration::from_millis(67); // ~15 fps
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const REQ_BUF_SIZE: usize = 2048;
const MIN_AUDIO_INTERVAL_MS: u64 = 20;
const MAX_AAC_FRAME: usize = 2048;

/// AAC feed for the audio track. Implemented by the encoder pipeline; a
/// disabled source removes the track from DESCRIBE and 404s its SETUP.
pub trait AudioSource: Send + Sync {
    fn enabled(&self) -> bool;
    fn sample_rate(&self) -> u32;
    fn frame_samples(&self) -> u32 {
        1024
    }
    fn rtpmap(&self) -> String;
    fn fmtp(&self) -> String;
    /// One access unit into `out`; `None` when the pipeline has nothing.
    fn read_frame(&self, out: &mut [u8]) -> Option<usize>;
}

#[derive(Debug, Clone)]
pub struct RtspServerConfig {
    pub port: u16,
    /// Address advertised in DESCRIBE control URLs.
    pub local_ip: Ipv4Addr,
    pub allow_udp: bool,
}

impl Default for RtspServerConfig {
    fn default() -> Self {
        Self {
            port: crate::RTSP_PORT,
            local_ip: Ipv4Addr::UNSPECIFIED,
            allow_udp: false,
        }
    }
}

pub struct RtspServer {
    running: Arc<AtomicBool>,
    allow_udp: Arc<AtomicBool>,
    active_count: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl RtspServer {
    pub fn start(
        config: RtspServerConfig,
        camera: Arc<dyn Camera>,
        audio: Arc<dyn AudioSource>,
    ) -> Result<Self> {
        if !camera.is_ready() {
            return Err(RtspError::CameraNotReady);
        }

        let listener = bind_reusable(config.port)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let running = Arc::new(AtomicBool::new(true));
        let allow_udp = Arc::new(AtomicBool::new(config.allow_udp));
        let active_count = Arc::new(AtomicUsize::new(0));

        let mut task = ServerTask {
            listener,
            running: Arc::clone(&running),
            allow_udp: Arc::clone(&allow_udp),
            active_count: Arc::clone(&active_count),
            camera,
            audio,
            sessions: std::array::from_fn(|_| None),
            local_ip: config.local_ip,
            port,
            last_size: None,
        };

        let handle = std::thread::Builder::new()
            .name("rtsp_server".into())
            .stack_size(32 * 1024)
            .spawn(move || task.run())?;

        log::info!("RTSP server started on port {port}");
        Ok(Self {
            running,
            allow_udp,
            active_count,
            handle: Some(handle),
            port,
        })
    }

    /// Actual bound port (differs from the config when 0 was requested).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn active_session_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn set_allow_udp(&self, allow: bool) {
        self.allow_udp.store(allow, Ordering::Release);
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("stopping RTSP server...");
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_reusable(port: u16) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(2)?;
    Ok(socket.into())
}

struct ServerTask {
    listener: TcpListener,
    running: Arc<AtomicBool>,
    allow_udp: Arc<AtomicBool>,
    active_count: Arc<AtomicUsize>,
    camera: Arc<dyn Camera>,
    audio: Arc<dyn AudioSource>,
    sessions: [Option<RtspSession>; MAX_SESSIONS],
    local_ip: Ipv4Addr,
    port: u16,
    last_size: Option<(u16, u16)>,
}

impl ServerTask {
    fn run(&mut self) {
        while self.running.load(Ordering::Acquire) {
            self.accept_one();

            let now = Instant::now();
            self.poll_control(now);
            self.stream_video(now);
            self.stream_audio(now);
            self.publish_count();

            std::thread::sleep(Duration::from_millis(1));
        }

        for slot in self.sessions.iter_mut() {
            *slot = None;
        }
        self.publish_count();
        log::info!("RTSP server stopped");
    }

    // ----- Control connections -------------------------------------------

    fn accept_one(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                log::info!("client connected from {}", peer.ip());
                self.handshake(stream, peer);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }

    /// Serve one client's request sequence until PLAY, TEARDOWN, error or
    /// disconnect. Blocking (with a 10 s per-request timeout) by design:
    /// handshakes are short and rare compared to streaming.
    fn handshake(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let _ = stream.set_write_timeout(Some(SEND_TIMEOUT));
        let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));

        let mut setup_slot: Option<usize> = None;
        let mut session_started = false;

        while self.running.load(Ordering::Acquire) {
            let Some(req) = recv_request(&mut stream) else {
                break;
            };
            let cseq = request::cseq(&req);
            log::debug!("RTSP {} (CSeq={})", request::method(&req), cseq);

            match request::method(&req) {
                "OPTIONS" => {
                    send_response(
                        &mut stream,
                        cseq,
                        "200 OK",
                        "Public: DESCRIBE, SETUP, PLAY, TEARDOWN\r\n",
                    );
                }
                "DESCRIBE" => self.handle_describe(&mut stream, cseq),
                "SETUP" => {
                    if let Some(slot) = self.handle_setup(&mut stream, peer, &req, cseq) {
                        setup_slot = Some(slot);
                    }
                }
                "PLAY" => {
                    if self.handle_play(&mut stream, &req, cseq) {
                        session_started = true;
                        break;
                    }
                }
                "TEARDOWN" => {
                    let slot = request::session_id(&req)
                        .and_then(|id| self.find_by_id(id))
                        .or(setup_slot);
                    self.handle_teardown(&mut stream, cseq, slot);
                    setup_slot = None;
                    break;
                }
                _ => {
                    send_response(&mut stream, cseq, "501 Not Implemented", "");
                    break;
                }
            }
        }

        if !session_started {
            if let Some(slot) = setup_slot {
                if matches!(&self.sessions[slot], Some(s) if !s.is_playing) {
                    log::info!("client disconnected during handshake");
                    self.sessions[slot] = None;
                }
            }
        }
    }

    fn handle_describe(&mut self, stream: &mut TcpStream, cseq: u32) {
        use std::fmt::Write as _;

        let base = format!("rtsp://{}:{}/mjpeg/1", self.local_ip, self.port);

        let mut sdp = String::with_capacity(512);
        let _ = write!(
            sdp,
            "v=0\r\n\
             o=- 0 0 IN IP4 {ip}\r\n\
             s=Doorbell Camera\r\n\
             c=IN IP4 0.0.0.0\r\n\
             t=0 0\r\n\
             a=control:{base}\r\n\
             m=video 0 RTP/AVP 26\r\n\
             a=rtpmap:26 JPEG/90000\r\n",
            ip = self.local_ip,
        );
        if let Some((w, h)) = self.last_size {
            let _ = write!(sdp, "a=framesize:26 {w}-{h}\r\n");
        }
        let _ = write!(sdp, "a=control:{base}/track1\r\n");

        if self.audio.enabled() {
            let _ = write!(
                sdp,
                "m=audio 0 RTP/AVP 96\r\n\
                 a=rtpmap:96 {}\r\n\
                 a=fmtp:96 {}\r\n\
                 a=control:{base}/track2\r\n",
                self.audio.rtpmap(),
                self.audio.fmtp(),
            );
        }

        let mut response = String::with_capacity(sdp.len() + 256);
        let _ = write!(
            response,
            "RTSP/1.0 200 OK\r\n\
             CSeq: {cseq}\r\n\
             Content-Base: {base}/\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {sdp}",
            sdp.len(),
        );
        send_all(stream, response.as_bytes());
    }

    fn handle_setup(
        &mut self,
        stream: &mut TcpStream,
        peer: SocketAddr,
        req: &str,
        cseq: u32,
    ) -> Option<usize> {
        let is_audio = request::wants_track2(req);

        if is_audio && !self.audio.enabled() {
            send_response(stream, cseq, "404 Not Found", "");
            return None;
        }

        let Some(transport_hdr) = request::transport(req) else {
            send_response(stream, cseq, "461 Unsupported Transport", "");
            return None;
        };

        let transport = if request::is_tcp_transport(transport_hdr) {
            let (rtp_channel, rtcp_channel) = request::interleaved_channels(transport_hdr)
                .unwrap_or(if is_audio { (2, 3) } else { (0, 1) });
            Transport::Tcp {
                rtp_channel,
                rtcp_channel,
            }
        } else {
            if !self.allow_udp.load(Ordering::Acquire) {
                log::warn!("UDP requested but disabled");
                send_response(stream, cseq, "461 Unsupported Transport", "");
                return None;
            }
            let Some((client_rtp, client_rtcp)) = request::client_ports(transport_hdr)
            else {
                send_response(stream, cseq, "461 Unsupported Transport", "");
                return None;
            };
            Transport::Udp {
                client_rtp,
                client_rtcp,
            }
        };

        // Second SETUP joins its session via the Session header; the first
        // allocates a slot.
        let slot = match request::session_id(req) {
            Some(id) => match self.find_by_id(id) {
                Some(slot) => slot,
                None => {
                    send_response(stream, cseq, "454 Session Not Found", "");
                    return None;
                }
            },
            None => {
                let Some(slot) = self.sessions.iter().position(Option::is_none) else {
                    send_response(stream, cseq, "453 Not Enough Bandwidth", "");
                    return None;
                };
                let Ok(ctrl) = stream.try_clone() else {
                    send_response(stream, cseq, "500 Internal Server Error", "");
                    return None;
                };
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                let session =
                    RtspSession::new(ctrl, peer.ip(), alloc_session_id(now_ms), Instant::now());
                self.sessions[slot] = Some(session);
                slot
            }
        };

        let session = self.sessions[slot].as_mut().expect("slot filled above");
        let track = Track::new(transport, hardware::random_u32());
        if is_audio {
            session.audio = Some(track);
        } else {
            session.video = Some(track);
        }
        session.last_activity = Instant::now();

        let extra = match transport {
            Transport::Tcp {
                rtp_channel,
                rtcp_channel,
            } => format!(
                "Transport: RTP/AVP/TCP;unicast;interleaved={}-{}\r\nSession: {:08x};timeout=60\r\n",
                rtp_channel, rtcp_channel, session.id
            ),
            Transport::Udp {
                client_rtp,
                client_rtcp,
            } => format!(
                "Transport: RTP/AVP;unicast;client_port={}-{}\r\nSession: {:08x};timeout=60\r\n",
                client_rtp, client_rtcp, session.id
            ),
        };
        let id = session.id;
        send_response(stream, cseq, "200 OK", &extra);
        log::info!(
            "session {:08x} {} (slot {})",
            id,
            if is_audio { "audio track added" } else { "created" },
            slot
        );
        Some(slot)
    }

    fn handle_play(&mut self, stream: &mut TcpStream, req: &str, cseq: u32) -> bool {
        let slot = request::session_id(req).and_then(|id| self.find_by_id(id));
        let Some(slot) = slot else {
            send_response(stream, cseq, "454 Session Not Found", "");
            return false;
        };

        let session = self.sessions[slot].as_mut().expect("found above");
        let now = Instant::now();
        session.is_playing = true;
        session.last_frame = now;
        session.last_audio = now;
        session.last_activity = now;
        // From here on the control socket is polled between frame sends.
        let _ = session.ctrl.set_nonblocking(true);

        let extra = format!("Session: {:08x}\r\n", session.id);
        let id = session.id;
        send_response(stream, cseq, "200 OK", &extra);
        log::info!("PLAY session {:08x}", id);
        true
    }

    fn handle_teardown(&mut self, stream: &mut TcpStream, cseq: u32, slot: Option<usize>) {
        match slot.and_then(|s| self.sessions[s].as_ref().map(|sess| (s, sess.id))) {
            Some((slot, id)) => {
                let extra = format!("Session: {:08x}\r\n", id);
                send_response(stream, cseq, "200 OK", &extra);
                log::info!("TEARDOWN session {:08x}", id);
                self.sessions[slot] = None;
            }
            None => send_response(stream, cseq, "454 Session Not Found", ""),
        }
    }

    /// Poll playing sessions for in-band TEARDOWN, disconnects and the
    /// 60 s inactivity timeout.
    fn poll_control(&mut self, now: Instant) {
        for i in 0..MAX_SESSIONS {
            let mut remove = false;
            {
                let Some(session) = self.sessions[i].as_mut() else {
                    continue;
                };
                if !session.is_playing {
                    continue;
                }

                let mut buf = [0u8; REQ_BUF_SIZE];
                match session.ctrl.read(&mut buf) {
                    Ok(0) => {
                        log::info!("client disconnected: session {:08x}", session.id);
                        remove = true;
                    }
                    Ok(n) => {
                        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if text.contains("TEARDOWN") {
                            let cseq = request::cseq(&text);
                            let extra = format!("Session: {:08x}\r\n", session.id);
                            send_response(&mut session.ctrl, cseq, "200 OK", &extra);
                            log::info!("TEARDOWN session {:08x}", session.id);
                            remove = true;
                        } else {
                            session.last_activity = now;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(_) => remove = true,
                }

                if !remove && session.timed_out(now) {
                    log::info!("session timeout: {:08x}", session.id);
                    remove = true;
                }
            }
            if remove {
                self.sessions[i] = None;
            }
        }
    }

    // ----- Media fan-out --------------------------------------------------

    fn stream_video(&mut self, now: Instant) {
        let due = self
            .sessions
            .iter()
            .flatten()
            .any(|s| s.is_playing && now.duration_since(s.last_frame) >= FRAME_INTERVAL);
        if !due {
            return;
        }

        let Some(frame) = self.camera.capture() else {
            return;
        };
        self.last_size = Some((frame.width, frame.height));

        let Some(scan) = jpeg::find_scan_data(&frame.data) else {
            log::warn!("JPEG parse failed ({} bytes), frame dropped", frame.data.len());
            return;
        };

        for slot in self.sessions.iter_mut() {
            let Some(session) = slot.as_mut() else {
                continue;
            };
            if !session.is_playing
                || now.duration_since(session.last_frame) < FRAME_INTERVAL
            {
                continue;
            }

            send_jpeg(session, &scan, frame.width, frame.height, now);

            // Video timestamps follow the wall clock (capture jitter is
            // real); 90 kHz units.
            let delta_ms = now.duration_since(session.last_frame).as_millis() as u32;
            if let Some(track) = session.video.as_mut() {
                track.timestamp = track.timestamp.wrapping_add((delta_ms * 90).max(1));
            }
            session.last_frame = now;
            session.last_activity = now;
        }
    }

    fn stream_audio(&mut self, now: Instant) {
        let rate = self.audio.sample_rate();
        if rate == 0 || !self.audio.enabled() {
            return;
        }
        let frame_samples = self.audio.frame_samples();
        let interval = Duration::from_millis(
            (frame_samples as u64 * 1000 / rate as u64).max(MIN_AUDIO_INTERVAL_MS),
        );

        let due = self.sessions.iter().flatten().any(|s| {
            s.is_playing
                && s.audio_setup()
                && now.duration_since(s.last_audio) >= interval
        });
        if !due {
            return;
        }

        let mut aac = [0u8; MAX_AAC_FRAME];
        let Some(len) = self.audio.read_frame(&mut aac) else {
            return;
        };
        if len == 0 {
            return;
        }

        let mut pkt = Vec::with_capacity(16 + len);
        for slot in self.sessions.iter_mut() {
            let Some(session) = slot.as_mut() else {
                continue;
            };
            if !session.is_playing
                || !session.audio_setup()
                || now.duration_since(session.last_audio) < interval
            {
                continue;
            }

            send_aac(session, &mut pkt, &aac[..len], now);

            if let Some(track) = session.audio.as_mut() {
                track.seq = track.seq.wrapping_add(1);
                // Audio advances by exactly one frame of samples: AAC
                // frames are equally spaced regardless of wall-clock drift.
                track.timestamp = track.timestamp.wrapping_add(frame_samples);
            }
            session.last_audio = now;
            session.last_activity = now;
        }
    }

    fn publish_count(&self) {
        let playing = self
            .sessions
            .iter()
            .flatten()
            .filter(|s| s.is_playing)
            .count();
        self.active_count.store(playing, Ordering::Release);
    }

    fn find_by_id(&self, id: u32) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| matches!(s, Some(sess) if sess.id == id))
    }
}

// ----- Per-session senders ------------------------------------------------

fn send_jpeg(session: &mut RtspSession, scan: &ScanData<'_>, width: u16, height: u16, now: Instant) {
    let Some(transport) = session.video.as_ref().map(|t| t.transport) else {
        return;
    };
    match transport {
        Transport::Tcp { rtp_channel, .. } => {
            send_jpeg_tcp(session, rtp_channel, scan, width, height)
        }
        Transport::Udp { client_rtp, .. } => {
            send_jpeg_udp(session, client_rtp, scan, width, height, now)
        }
    }
}

fn send_jpeg_tcp(
    session: &mut RtspSession,
    channel: u8,
    scan: &ScanData<'_>,
    width: u16,
    height: u16,
) {
    let mut pkt = [0u8; 4 + RTP_JPEG_HEADER_LEN + MAX_RTP_PAYLOAD];

    for (offset, chunk, is_last) in jpeg::fragments(scan.data) {
        let (seq, timestamp, ssrc) = {
            let t = session.video.as_ref().expect("video track set");
            (t.seq, t.timestamp, t.ssrc)
        };

        let header: &mut [u8; RTP_JPEG_HEADER_LEN] =
            (&mut pkt[4..4 + RTP_JPEG_HEADER_LEN]).try_into().expect("header slice");
        jpeg::write_rtp_jpeg_header(
            header,
            seq,
            timestamp,
            ssrc,
            is_last,
            offset,
            scan.kind,
            scan.quality,
            width,
            height,
        );
        pkt[4 + RTP_JPEG_HEADER_LEN..4 + RTP_JPEG_HEADER_LEN + chunk.len()]
            .copy_from_slice(chunk);

        let rtp_len = RTP_JPEG_HEADER_LEN + chunk.len();
        pkt[0] = b'$';
        pkt[1] = channel;
        pkt[2..4].copy_from_slice(&(rtp_len as u16).to_be_bytes());

        if !send_all(&mut session.ctrl, &pkt[..4 + rtp_len]) {
            log::warn!("TCP write failed for session {:08x}", session.id);
            return;
        }

        if let Some(t) = session.video.as_mut() {
            t.seq = t.seq.wrapping_add(1);
        }
    }
}

fn send_jpeg_udp(
    session: &mut RtspSession,
    client_port: u16,
    scan: &ScanData<'_>,
    width: u16,
    height: u16,
    now: Instant,
) {
    if session.udp_blocked(now) {
        return;
    }
    if session.udp_video_sock.is_none() {
        session.udp_video_sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok();
        if session.udp_video_sock.is_none() {
            log::error!("failed to create video UDP socket");
            return;
        }
    }

    let dest = SocketAddr::new(session.peer_ip, client_port);
    let mut pkt = [0u8; RTP_JPEG_HEADER_LEN + MAX_RTP_PAYLOAD];

    for (offset, chunk, is_last) in jpeg::fragments(scan.data) {
        let (seq, timestamp, ssrc) = {
            let t = session.video.as_ref().expect("video track set");
            (t.seq, t.timestamp, t.ssrc)
        };

        let header: &mut [u8; RTP_JPEG_HEADER_LEN] =
            (&mut pkt[..RTP_JPEG_HEADER_LEN]).try_into().expect("header slice");
        jpeg::write_rtp_jpeg_header(
            header,
            seq,
            timestamp,
            ssrc,
            is_last,
            offset,
            scan.kind,
            scan.quality,
            width,
            height,
        );
        pkt[RTP_JPEG_HEADER_LEN..RTP_JPEG_HEADER_LEN + chunk.len()].copy_from_slice(chunk);

        let pkt_len = RTP_JPEG_HEADER_LEN + chunk.len();
        let sock = session.udp_video_sock.as_ref().expect("created above");
        match sock.send_to(&pkt[..pkt_len], dest) {
            Ok(n) if n == pkt_len => {}
            _ => {
                session.apply_udp_backoff(now);
                log::warn!("UDP send failed");
                return;
            }
        }

        if let Some(t) = session.video.as_mut() {
            t.seq = t.seq.wrapping_add(1);
        }

        // Pace fragments so the receiver's socket buffer keeps up.
        if !is_last {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    session.clear_udp_backoff();
}

fn send_aac(session: &mut RtspSession, pkt: &mut Vec<u8>, aac: &[u8], now: Instant) {
    let Some((transport, seq, timestamp, ssrc)) = session
        .audio
        .as_ref()
        .map(|t| (t.transport, t.seq, t.timestamp, t.ssrc))
    else {
        return;
    };

    aac_pack::write_rtp_aac_packet(pkt, seq, timestamp, ssrc, aac);

    match transport {
        Transport::Tcp { rtp_channel, .. } => {
            let mut framed = Vec::with_capacity(4 + pkt.len());
            framed.push(b'$');
            framed.push(rtp_channel);
            framed.extend_from_slice(&(pkt.len() as u16).to_be_bytes());
            framed.extend_from_slice(pkt);
            if !send_all(&mut session.ctrl, &framed) {
                log::warn!("audio TCP write failed for session {:08x}", session.id);
            }
        }
        Transport::Udp { client_rtp, .. } => {
            if session.udp_blocked(now) || client_rtp == 0 {
                return;
            }
            if session.udp_audio_sock.is_none() {
                session.udp_audio_sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok();
                if session.udp_audio_sock.is_none() {
                    log::error!("failed to create audio UDP socket");
                    return;
                }
            }
            let dest = SocketAddr::new(session.peer_ip, client_rtp);
            let sock = session.udp_audio_sock.as_ref().expect("created above");
            match sock.send_to(pkt, dest) {
                Ok(n) if n == pkt.len() => {}
                _ => {
                    session.apply_udp_backoff(now);
                    log::warn!("audio UDP send failed");
                }
            }
        }
    }
}

// ----- Socket helpers -----------------------------------------------------

/// Read until the `\r\n\r\n` terminator, a timeout, or EOF. `None` means
/// the client is gone or never said anything.
fn recv_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = [0u8; REQ_BUF_SIZE];
    let mut total = 0usize;

    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => {
                if total == 0 {
                    return None;
                }
                break;
            }
            Ok(n) => {
                total += n;
                if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                if total > 0 {
                    break;
                }
                return None;
            }
            Err(_) => return None,
        }
    }

    (total > 0).then(|| String::from_utf8_lossy(&buf[..total]).into_owned())
}

fn send_response(stream: &mut TcpStream, cseq: u32, status: &str, extra_headers: &str) {
    let response = format!("RTSP/1.0 {status}\r\nCSeq: {cseq}\r\n{extra_headers}\r\n");
    send_all(stream, response.as_bytes());
}

/// Write the whole buffer, riding out partial writes and WouldBlock on
/// the (possibly non-blocking) control socket.
fn send_all(stream: &mut TcpStream, mut data: &[u8]) -> bool {
    let deadline = Instant::now() + SEND_TIMEOUT;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return false,
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                if Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(_) => return false,
        }
    }
    true
}
