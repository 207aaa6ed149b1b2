//! AAC-LC encoder pipeline feeding the RTSP audio track. Pulls PCM from
//! the mic, decimates to the target rate, pushes it through the encoder
//! element and returns one raw AAC frame (ADTS header stripped) per call.
//!
//! Initialization is latched: a pipeline that failed to come up once must
//! not be re-entered, so the state moves one-way to `Failed` and every
//! later call fails fast. The streamer then simply stops offering audio.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio::mic::MicCapture;
use crate::store::Store;
use crate::{Result, AUDIO_SAMPLE_RATE};

pub const AAC_FRAME_SAMPLES: usize = 1024;

const STORE_NS: &str = "camera";
const LOCK_TIMEOUT: Duration = Duration::from_millis(200);
const READ_DEADLINE: Duration = Duration::from_millis(80);
const MIC_READ_TIMEOUT: Duration = Duration::from_millis(80);
const MAX_MIC_SAMPLES: usize = 2048;
const STASH_SIZE: usize = 4096;

/// The encoder element proper: vendor codec on the device, a functional
/// fake on the host. Consumes PCM frames, produces an ADTS byte stream.
pub trait AacEncoderElement: Send {
    fn write_pcm(&mut self, pcm: &[i16]) -> Result<()>;
    /// Drain whatever encoded bytes are available, up to `out.len()`.
    fn read(&mut self, out: &mut [u8]) -> usize;
}

enum PipeState {
    Uninitialized,
    Ready {
        encoder: Box<dyn AacEncoderElement>,
        stash: Vec<u8>,
    },
    Failed,
}

pub struct AacPipeline {
    mic: Arc<MicCapture>,
    state: Mutex<PipeState>,
    sample_rate: u32,
    bitrate: u32,
}

impl AacPipeline {
    pub fn new(mic: Arc<MicCapture>, store: &dyn Store) -> Self {
        let sample_rate = match store.get_u8(STORE_NS, "aac_rate") {
            Some(8) => 8_000,
            _ => 16_000,
        };
        let mut bitrate = store.get_u8(STORE_NS, "aac_bitr").map(|v| v as u32 * 1000)
            .unwrap_or(32_000);
        if !(16_000..=48_000).contains(&bitrate) {
            bitrate = 32_000;
        }

        log::info!("AAC pipeline configured ({sample_rate} Hz, {bitrate} bps)");
        Self {
            mic,
            state: Mutex::new(PipeState::Uninitialized),
            sample_rate,
            bitrate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sdp_rtpmap(&self) -> String {
        format!("MPEG4-GENERIC/{}/1", self.sample_rate)
    }

    pub fn sdp_fmtp(&self) -> String {
        let asc = audio_specific_config(self.sample_rate);
        format!(
            "profile-level-id=1;mode=AAC-hbr;config={asc:04X};SizeLength=13;IndexLength=3;IndexDeltaLength=3"
        )
    }

    /// Produce one raw AAC frame into `out`. Returns the frame length, or
    /// `None` on lock timeout, latched failure, capture trouble, or when
    /// the encoder does not deliver within the read deadline.
    pub fn get_frame(&self, out: &mut [u8]) -> Option<usize> {
        if out.is_empty() {
            return None;
        }
        let mut state = self.state.try_lock_for(LOCK_TIMEOUT)?;

        // Lazy one-shot init.
        if matches!(*state, PipeState::Uninitialized) {
            match crate::audio::init_aac_encoder(self.sample_rate, self.bitrate) {
                Ok(encoder) => {
                    *state = PipeState::Ready {
                        encoder,
                        stash: Vec::with_capacity(STASH_SIZE),
                    };
                    log::info!(
                        "AAC pipeline started ({} Hz, {} bps)",
                        self.sample_rate,
                        self.bitrate
                    );
                }
                Err(e) => {
                    log::error!("AAC pipeline init permanently failed: {e}");
                    *state = PipeState::Failed;
                    return None;
                }
            }
        }

        let PipeState::Ready { encoder, stash } = &mut *state else {
            return None;
        };

        // One output frame needs (src_rate / target_rate) × 1024 input
        // samples before decimation.
        let ratio = (AUDIO_SAMPLE_RATE / self.sample_rate).max(1) as usize;
        let input_samples = (ratio * AAC_FRAME_SAMPLES).min(MAX_MIC_SAMPLES);

        let mut mic_buf = [0i16; MAX_MIC_SAMPLES];
        if !self.mic.read(&mut mic_buf[..input_samples], MIC_READ_TIMEOUT) {
            mic_buf[..input_samples].fill(0);
        }

        let mut pcm = [0i16; AAC_FRAME_SAMPLES];
        decimate(&mic_buf[..input_samples], &mut pcm, ratio);

        if encoder.write_pcm(&pcm).is_err() {
            return None;
        }

        read_encoded_frame(encoder.as_mut(), stash, out)
    }
}

/// Pick every `ratio`-th sample.
fn decimate(input: &[i16], output: &mut [i16], ratio: usize) {
    for (i, o) in output.iter_mut().enumerate() {
        let idx = i * ratio;
        *o = if idx < input.len() { input[idx] } else { 0 };
    }
}

/// Accumulate encoder output in the stash until a whole ADTS frame is
/// present, then hand back its payload with the header stripped.
fn read_encoded_frame(
    encoder: &mut dyn AacEncoderElement,
    stash: &mut Vec<u8>,
    out: &mut [u8],
) -> Option<usize> {
    let deadline = Instant::now() + READ_DEADLINE;
    let mut temp = [0u8; 512];

    while Instant::now() < deadline {
        let rd = encoder.read(&mut temp);
        if rd > 0 {
            let room = STASH_SIZE.saturating_sub(stash.len());
            stash.extend_from_slice(&temp[..rd.min(room)]);
        }

        if stash.len() < 7 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        if let Some((frame_len, header_len)) = parse_adts_header(stash) {
            if stash.len() < frame_len {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            let raw_len = (frame_len - header_len).min(out.len());
            out[..raw_len].copy_from_slice(&stash[header_len..header_len + raw_len]);
            stash.drain(..frame_len);
            return (raw_len > 0).then_some(raw_len);
        }

        // No ADTS sync: flush the stash raw rather than stalling forever.
        if !stash.is_empty() {
            let raw_len = stash.len().min(out.len());
            out[..raw_len].copy_from_slice(&stash[..raw_len]);
            stash.clear();
            return (raw_len > 0).then_some(raw_len);
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    None
}

/// ADTS fixed-header parse: returns (frame length, header length).
pub fn parse_adts_header(data: &[u8]) -> Option<(usize, usize)> {
    if data.len() < 7 {
        return None;
    }
    if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
        return None;
    }
    let protection_absent = data[1] & 0x01 != 0;
    let frame_len = (((data[3] & 0x03) as usize) << 11)
        | ((data[4] as usize) << 3)
        | (((data[5] & 0xE0) as usize) >> 5);
    let header_len = if protection_absent { 7 } else { 9 };
    (frame_len >= header_len).then_some((frame_len, header_len))
}

/// Build a 7-byte ADTS header for an AAC-LC mono frame.
pub fn adts_header(sample_rate: u32, payload_len: usize) -> [u8; 7] {
    let frame_len = payload_len + 7;
    let fi = freq_index(sample_rate);
    [
        0xFF,
        0xF1, // MPEG-4, layer 0, no CRC
        (1 << 6) | (fi << 2), // AAC-LC, channel cfg high bit 0
        (1 << 6) | ((frame_len >> 11) & 0x03) as u8, // 1 channel
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x07) << 5) | 0x1F) as u8,
        0xFC,
    ]
}

/// MPEG-4 sampling-frequency index table.
pub fn freq_index(rate: u32) -> u8 {
    match rate {
        96_000 => 0,
        88_200 => 1,
        64_000 => 2,
        48_000 => 3,
        44_100 => 4,
        32_000 => 5,
        24_000 => 6,
        22_050 => 7,
        16_000 => 8,
        12_000 => 9,
        11_025 => 10,
        8_000 => 11,
        7_350 => 12,
        _ => 8,
    }
}

/// AudioSpecificConfig: AAC-LC (2), frequency index, 1 channel.
pub fn audio_specific_config(rate: u32) -> u16 {
    (2u16 << 11) | ((freq_index(rate) as u16) << 7) | (1 << 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::bus::AudioBus;
    use crate::store::{MemStore, Store};

    fn pipeline(rate_key: u8) -> AacPipeline {
        let store = MemStore::new();
        store.set_u8(STORE_NS, "mic_en", 1).unwrap();
        store.set_u8(STORE_NS, "aac_rate", rate_key).unwrap();
        let bus = AudioBus::new().unwrap();
        let mic = Arc::new(MicCapture::new(bus, &store));
        mic.start().unwrap();
        AacPipeline::new(mic, &store)
    }

    #[test]
    fn asc_matches_reference_values() {
        // AAC-LC, 16 kHz, mono -> 0x1408; 8 kHz -> 0x1588
        assert_eq!(audio_specific_config(16_000), 0x1408);
        assert_eq!(audio_specific_config(8_000), 0x1588);
    }

    #[test]
    fn fmtp_advertises_hbr_mode() {
        let pipe = pipeline(16);
        assert_eq!(pipe.sample_rate(), 16_000);
        assert_eq!(pipe.sdp_rtpmap(), "MPEG4-GENERIC/16000/1");
        let fmtp = pipe.sdp_fmtp();
        assert!(fmtp.contains("mode=AAC-hbr"));
        assert!(fmtp.contains("config=1408"));
        assert!(fmtp.contains("SizeLength=13"));
    }

    #[test]
    fn adts_header_roundtrips_through_parser() {
        let header = adts_header(16_000, 96);
        let (frame_len, header_len) = parse_adts_header(&header).unwrap();
        assert_eq!(header_len, 7);
        assert_eq!(frame_len, 96 + 7);
    }

    #[test]
    fn get_frame_returns_payload_without_header() {
        let pipe = pipeline(16);
        let mut out = [0u8; 2048];
        let len = pipe.get_frame(&mut out).expect("frame");
        // host encoder emits a 96-byte payload
        assert_eq!(len, 96);
    }

    #[test]
    fn eight_khz_target_decimates() {
        let pipe = pipeline(8);
        assert_eq!(pipe.sample_rate(), 8_000);
        let mut out = [0u8; 2048];
        assert!(pipe.get_frame(&mut out).is_some());
    }

    #[test]
    fn bad_adts_data_rejected() {
        assert!(parse_adts_header(&[0u8; 7]).is_none());
        assert!(parse_adts_header(&[0xFF, 0xF1, 0, 0]).is_none());
    }
}
