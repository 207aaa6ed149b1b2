//! End-to-end RTSP server tests over real sockets on ephemeral ports.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use hardware::camera::TestPatternCamera;
use rtsp_core::{AudioSource, RtspServer, RtspServerConfig};

struct StubAudio {
    enabled: bool,
    frame: Vec<u8>,
}

impl AudioSource for StubAudio {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn rtpmap(&self) -> String {
        "MPEG4-GENERIC/16000/1".into()
    }

    fn fmtp(&self) -> String {
        "profile-level-id=1;mode=AAC-hbr;config=1408;SizeLength=13;IndexLength=3;IndexDeltaLength=3".into()
    }

    fn read_frame(&self, out: &mut [u8]) -> Option<usize> {
        let n = self.frame.len().min(out.len());
        out[..n].copy_from_slice(&self.frame[..n]);
        Some(n)
    }
}

fn start_server(allow_udp: bool, audio_enabled: bool) -> RtspServer {
    let camera = Arc::new(TestPatternCamera::new(640, 480, 4000));
    let audio = Arc::new(StubAudio {
        enabled: audio_enabled,
        frame: vec![0xAB; 128],
    });
    RtspServer::start(
        RtspServerConfig {
            port: 0,
            local_ip: Ipv4Addr::new(127, 0, 0, 1),
            allow_udp,
        },
        camera,
        audio,
    )
    .expect("server start")
}

fn connect(server: &RtspServer) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", server.port())).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn send_request(stream: &mut TcpStream, req: &str) {
    stream.write_all(req.as_bytes()).expect("send request");
}

/// Read a text response byte-by-byte so no interleaved binary following it
/// is consumed.
fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => buf.push(byte[0]),
            _ => break,
        }
        if buf.len() > 8192 {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Read one `$`-framed interleaved packet: (channel, payload).
fn read_interleaved(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).ok()?;
    assert_eq!(header[0], b'$', "interleaved frame marker");
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).ok()?;
    Some((header[1], payload))
}

fn extract_session(response: &str) -> String {
    response
        .lines()
        .find_map(|l| l.strip_prefix("Session: "))
        .map(|v| v.split(';').next().unwrap().trim().to_string())
        .expect("session header")
}

fn setup_and_play(stream: &mut TcpStream) -> String {
    send_request(
        stream,
        "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track1 RTSP/1.0\r\n\
         CSeq: 2\r\n\
         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
    );
    let resp = read_response(stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "SETUP failed: {resp}");
    assert!(resp.contains("timeout=60"));
    let session = extract_session(&resp);
    assert_eq!(session.len(), 8, "8 hex digits: {session}");

    send_request(
        stream,
        &format!(
            "PLAY rtsp://127.0.0.1:8554/mjpeg/1/ RTSP/1.0\r\nCSeq: 3\r\nSession: {session}\r\n\r\n"
        ),
    );
    let resp = read_response(stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "PLAY failed: {resp}");
    session
}

#[test]
fn options_lists_public_methods() {
    let server = start_server(false, false);
    let mut stream = connect(&server);

    send_request(&mut stream, "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n");
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\nCSeq: 1\r\n"));
    assert!(resp.contains("Public: DESCRIBE, SETUP, PLAY, TEARDOWN"));
}

#[test]
fn describe_omits_audio_when_mic_disabled() {
    let server = start_server(false, false);
    let mut stream = connect(&server);

    send_request(
        &mut stream,
        "DESCRIBE rtsp://127.0.0.1:8554/mjpeg/1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.contains("m=video 0 RTP/AVP 26"));
    assert!(resp.contains("a=rtpmap:26 JPEG/90000"));
    assert!(resp.contains("Content-Type: application/sdp"));
    assert!(!resp.contains("m=audio"));
}

#[test]
fn describe_advertises_audio_when_enabled() {
    let server = start_server(false, true);
    let mut stream = connect(&server);

    send_request(
        &mut stream,
        "DESCRIBE rtsp://127.0.0.1:8554/mjpeg/1 RTSP/1.0\r\nCSeq: 1\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.contains("m=audio 0 RTP/AVP 96"));
    assert!(resp.contains("mode=AAC-hbr"));
    assert!(resp.contains("track2"));
}

#[test]
fn audio_setup_rejected_when_mic_disabled() {
    let server = start_server(false, false);
    let mut stream = connect(&server);

    send_request(
        &mut stream,
        "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track2 RTSP/1.0\r\n\
         CSeq: 2\r\n\
         Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 404 Not Found"), "{resp}");
}

#[test]
fn tcp_play_delivers_rtp_jpeg() {
    let server = start_server(false, false);
    let mut stream = connect(&server);
    setup_and_play(&mut stream);

    let (channel, rtp) = read_interleaved(&mut stream).expect("first fragment");
    assert_eq!(channel, 0);
    assert_eq!(rtp[0] >> 6, 2, "RTP version");
    assert_eq!(rtp[1] & 0x7F, 26, "PT=26");
    // JPEG header: offset 0 for the first fragment, type in {0,1}, Q=80
    assert_eq!(&rtp[13..16], &[0, 0, 0]);
    assert!(rtp[16] == 0 || rtp[16] == 1);
    assert_eq!(rtp[17], 80);
    assert_eq!(rtp[18], (640u32 / 8) as u8);
    assert_eq!(rtp[19], (480u32 / 8) as u8);
    assert_eq!(server.active_session_count(), 1);
}

#[test]
fn fragment_sequence_reassembles_scan() {
    let server = start_server(false, false);
    let mut stream = connect(&server);
    setup_and_play(&mut stream);

    // Collect fragments of exactly one frame (stop at the marker bit).
    let mut scan_len = 0usize;
    let mut marker_count = 0usize;
    let mut last_offset = None::<u32>;
    loop {
        let (_, rtp) = read_interleaved(&mut stream).expect("fragment");
        let offset =
            u32::from_be_bytes([0, rtp[13], rtp[14], rtp[15]]);
        if let Some(prev) = last_offset {
            assert!(offset > prev, "offsets grow contiguously");
        } else {
            assert_eq!(offset, 0, "first fragment at offset 0");
        }
        assert_eq!(offset as usize, scan_len, "offset equals bytes so far");
        last_offset = Some(offset);
        scan_len += rtp.len() - 20;
        if rtp[1] & 0x80 != 0 {
            marker_count += 1;
            break;
        }
    }
    assert_eq!(marker_count, 1);
    assert_eq!(scan_len, 4000, "sum of fragment payloads == scan length");
}

#[test]
fn udp_disabled_yields_461() {
    let server = start_server(false, false);
    let mut stream = connect(&server);

    send_request(
        &mut stream,
        "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track1 RTSP/1.0\r\n\
         CSeq: 2\r\n\
         Transport: RTP/AVP;unicast;client_port=50000-50001\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 461 Unsupported Transport"), "{resp}");
}

#[test]
fn udp_play_delivers_packets_to_client_port() {
    let server = start_server(true, false);
    let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
    udp.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    let rtp_port = udp.local_addr().unwrap().port();

    let mut stream = connect(&server);
    send_request(
        &mut stream,
        &format!(
            "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track1 RTSP/1.0\r\n\
             CSeq: 2\r\n\
             Transport: RTP/AVP;unicast;client_port={rtp_port}-{}\r\n\r\n",
            rtp_port + 1
        ),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
    assert!(resp.contains(&format!("client_port={rtp_port}-")));
    let session = extract_session(&resp);

    send_request(
        &mut stream,
        &format!("PLAY rtsp://127.0.0.1:8554/mjpeg/1/ RTSP/1.0\r\nCSeq: 3\r\nSession: {session}\r\n\r\n"),
    );
    assert!(read_response(&mut stream).starts_with("RTSP/1.0 200 OK"));

    let mut buf = [0u8; 2048];
    let (n, _) = udp.recv_from(&mut buf).expect("first UDP fragment");
    assert!(n > 20);
    assert_eq!(buf[1] & 0x7F, 26);
    assert_eq!(buf[5 + 12], 80, "Q=80");
}

#[test]
fn session_limit_answers_453_and_keeps_existing() {
    let server = start_server(false, false);

    let mut first = connect(&server);
    setup_and_play(&mut first);
    let mut second = connect(&server);
    setup_and_play(&mut second);

    let mut third = connect(&server);
    send_request(
        &mut third,
        "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track1 RTSP/1.0\r\n\
         CSeq: 2\r\n\
         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
    );
    let resp = read_response(&mut third);
    assert!(resp.starts_with("RTSP/1.0 453 Not Enough Bandwidth"), "{resp}");
    drop(third); // free the serving task from this handshake

    // existing sessions keep streaming
    assert!(read_interleaved(&mut first).is_some());
    assert!(read_interleaved(&mut second).is_some());
    assert_eq!(server.active_session_count(), 2);
}

#[test]
fn second_setup_joins_session_and_audio_flows() {
    let server = start_server(false, true);
    let mut stream = connect(&server);

    send_request(
        &mut stream,
        "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track1 RTSP/1.0\r\n\
         CSeq: 2\r\n\
         Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
    );
    let resp = read_response(&mut stream);
    let session = extract_session(&resp);

    send_request(
        &mut stream,
        &format!(
            "SETUP rtsp://127.0.0.1:8554/mjpeg/1/track2 RTSP/1.0\r\n\
             CSeq: 3\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\
             Session: {session}\r\n\r\n"
        ),
    );
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 200 OK"), "{resp}");
    assert_eq!(extract_session(&resp), session, "same session id");
    assert!(resp.contains("interleaved=2-3"));

    send_request(
        &mut stream,
        &format!("PLAY rtsp://127.0.0.1:8554/mjpeg/1/ RTSP/1.0\r\nCSeq: 4\r\nSession: {session}\r\n\r\n"),
    );
    assert!(read_response(&mut stream).starts_with("RTSP/1.0 200 OK"));

    // Interleaved stream now carries both tracks; find an audio packet.
    let mut audio_seen = false;
    for _ in 0..200 {
        let Some((channel, rtp)) = read_interleaved(&mut stream) else {
            break;
        };
        if channel == 2 {
            assert_eq!(rtp[1] & 0x7F, 96, "PT=96");
            assert_ne!(rtp[1] & 0x80, 0, "marker set on every AU");
            assert_eq!(
                u16::from_be_bytes([rtp[12], rtp[13]]),
                0x0010,
                "AU-headers-length"
            );
            let au = u16::from_be_bytes([rtp[14], rtp[15]]);
            assert_eq!((au >> 3) as usize, 128, "AU size");
            audio_seen = true;
            break;
        }
        assert_eq!(channel, 0, "video on channel 0");
    }
    assert!(audio_seen, "no audio packet observed");
}

#[test]
fn teardown_releases_session() {
    let server = start_server(false, false);
    let mut stream = connect(&server);
    let session = setup_and_play(&mut stream);

    // wait until streaming is active, then tear down in-band
    assert!(read_interleaved(&mut stream).is_some());
    send_request(
        &mut stream,
        &format!("TEARDOWN rtsp://127.0.0.1:8554/mjpeg/1/ RTSP/1.0\r\nCSeq: 9\r\nSession: {session}\r\n\r\n"),
    );

    // the 200 OK may be preceded by in-flight fragments; scan the byte
    // stream for the response line
    let mut seen = Vec::new();
    let mut byte = [0u8; 1];
    for _ in 0..200_000 {
        match stream.read(&mut byte) {
            Ok(1) => seen.push(byte[0]),
            _ => break,
        }
        if seen
            .windows(12)
            .any(|w| w == b"RTSP/1.0 200")
        {
            break;
        }
    }
    assert!(
        seen.windows(12).any(|w| w == b"RTSP/1.0 200"),
        "no TEARDOWN response"
    );

    // session slot is freed
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.active_session_count(), 0);
}

#[test]
fn unknown_method_gets_501() {
    let server = start_server(false, false);
    let mut stream = connect(&server);
    send_request(&mut stream, "RECORD * RTSP/1.0\r\nCSeq: 4\r\n\r\n");
    let resp = read_response(&mut stream);
    assert!(resp.starts_with("RTSP/1.0 501 Not Implemented"), "{resp}");
}
