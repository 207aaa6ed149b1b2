//! Dedicated RTP sender for an active SIP call. One 20 ms G.711 packet per
//! tick: 320 mic samples at 16 kHz, decimated to 160 at 8 kHz, companded
//! per the negotiated payload type. Capture trouble or a muted local
//! direction turns into codec silence on the wire, never into gaps.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hardware::MicCapture;
use rtp_audio::{encode_g711, g711_silence_byte, RtpHeader};

use crate::dsp;
use crate::tasks::task::{Spawner, TaskMeta, TaskSpawner, STREAM_CORE};

const TICK: Duration = Duration::from_millis(20);
const SAMPLES_8K: usize = 160;
const SAMPLES_16K: usize = 320;
const MIC_READ_TIMEOUT: Duration = Duration::from_millis(80);

#[derive(Debug, Clone)]
pub struct RtpTxParams {
    pub dest: SocketAddr,
    pub payload_type: u8,
    pub ssrc: u32,
    pub start_seq: u16,
    pub start_timestamp: u32,
    /// Local direction gate: false sends comfort silence.
    pub local_sends: bool,
}

/// Shared handle; dropping it does not stop the task, clear `active`.
pub struct RtpTxHandle {
    active: Arc<AtomicBool>,
}

impl RtpTxHandle {
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub fn spawn_rtp_tx(
    socket: UdpSocket,
    params: RtpTxParams,
    mic: Arc<MicCapture>,
) -> RtpTxHandle {
    let active = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&active);

    TaskSpawner.spawn(
        TaskMeta {
            name: "sip_rtp_tx",
            stack_bytes: Some(16384),
            pin_to_core: Some(STREAM_CORE),
        },
        Box::new(move || run(socket, params, mic, flag)),
    );

    RtpTxHandle { active }
}

fn run(socket: UdpSocket, params: RtpTxParams, mic: Arc<MicCapture>, active: Arc<AtomicBool>) {
    log::info!(
        "RTP TX started: dest={}, pt={}, ssrc={:08x}",
        params.dest,
        params.payload_type,
        params.ssrc
    );

    let mut seq = params.start_seq;
    let mut timestamp = params.start_timestamp;
    let mut next_tick = Instant::now() + TICK;

    let mut mic_buf = [0i16; SAMPLES_16K];
    let mut pcm8k = [0i16; SAMPLES_8K];
    let mut payload = [0u8; SAMPLES_8K];
    let mut packet = [0u8; 12 + SAMPLES_8K];

    while active.load(Ordering::Acquire) {
        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        }
        while next_tick <= Instant::now() {
            next_tick += TICK;
        }

        let captured = params.local_sends
            && !mic.is_muted()
            && mic.read(&mut mic_buf, MIC_READ_TIMEOUT);

        if captured {
            dsp::downsample(&mic_buf, &mut pcm8k);
            encode_g711(&pcm8k, params.payload_type, &mut payload);
        } else {
            payload.fill(g711_silence_byte(params.payload_type));
        }

        let header = RtpHeader {
            payload_type: params.payload_type,
            sequence_number: seq,
            timestamp,
            ssrc: params.ssrc,
            ..Default::default()
        };
        let (head, body) = packet.split_at_mut(12);
        header.write(head.try_into().expect("12-byte header"));
        body.copy_from_slice(&payload);

        if let Err(e) = socket.send_to(&packet, params.dest) {
            log::debug!("RTP TX send failed: {e}");
        }

        seq = seq.wrapping_add(1);
        timestamp = timestamp.wrapping_add(SAMPLES_8K as u32);
    }

    log::info!("RTP TX stopped");
}
