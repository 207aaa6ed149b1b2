//! Speaker output on the shared bus TX channel. Mono PCM in, volume-scaled
//! stereo out. The gong runs on its own short-lived task and holds the
//! playback lock so call audio cannot interleave with it.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::bus::{AudioBus, DMA_BUF_COUNT};
use crate::store::Store;
use crate::AUDIO_SAMPLE_RATE;

const STORE_NS: &str = "camera";
const TX_WRITE_TIMEOUT: Duration = Duration::from_millis(400);
/// The embedded gong peaks near full scale; this keeps 100% volume around
/// 16% of full scale, below the little speaker's distortion threshold.
const GONG_HEADROOM_PCT: i32 = 20;

/// Embedded 16 kHz mono gong PCM. Empty by default; the synthesized
/// two-tone fallback plays instead.
const GONG_PCM: &[u8] = &[];

pub struct SpeakerOutput {
    bus: Arc<AudioBus>,
    volume: AtomicU8,
    gong_running: AtomicBool,
    playback_lock: Mutex<()>,
}

impl SpeakerOutput {
    pub fn new(bus: Arc<AudioBus>, store: &dyn Store) -> Arc<Self> {
        let volume = store.get_u8(STORE_NS, "aud_volume").unwrap_or(70);
        log::info!("speaker ready (volume={volume}%)");
        Arc::new(Self {
            bus,
            volume: AtomicU8::new(volume),
            gong_running: AtomicBool::new(false),
            playback_lock: Mutex::new(()),
        })
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, percent: u8) {
        self.volume.store(percent.min(100), Ordering::Release);
    }

    pub fn gong_running(&self) -> bool {
        self.gong_running.load(Ordering::Acquire)
    }

    /// Write mono PCM to the speaker, scaled by the volume setting and
    /// duplicated to stereo. Returns false without blocking while a
    /// gong-class task owns the channel.
    pub fn write(&self, pcm: &[i16], timeout: Duration) -> bool {
        if self.gong_running() {
            return false;
        }
        let Some(_guard) = self.playback_lock.try_lock_for(timeout) else {
            return false;
        };

        if !self.bus.tx_enabled() {
            if self.bus.enable_tx().is_err() {
                return false;
            }
            // Let the DAC lock onto the word clock before audible samples.
            self.bus.preload_silence(3);
        }

        let volume = self.volume() as i32;
        self.write_scaled(pcm, volume, 100, timeout)
    }

    /// Flush the DMA ring with silence and stop TX (unless the external
    /// mic still needs the bit clock).
    pub fn flush_and_stop(&self) {
        if !self.bus.tx_enabled() {
            return;
        }
        let silence = [0i16; 256];
        for _ in 0..DMA_BUF_COUNT + 2 {
            let stereo = duplicate_stereo(&silence);
            let bytes: &[u8] = bytemuck::cast_slice(&stereo);
            let _ = self.bus.write_tx(bytes, TX_WRITE_TIMEOUT);
        }
        let _ = self.bus.disable_tx();
        log::info!("TX flushed and stopped");
    }

    /// Fire-and-forget gong. No-op when the volume is zero or a gong-class
    /// task is already playing.
    pub fn play_gong(speaker: &Arc<SpeakerOutput>) {
        if speaker.volume() == 0 || speaker.gong_running() {
            return;
        }
        let speaker = Arc::clone(speaker);
        let spawn = std::thread::Builder::new()
            .name("gong".into())
            .stack_size(16 * 1024)
            .spawn(move || speaker.gong_task());
        if let Err(e) = spawn {
            log::warn!("gong task spawn failed: {e}");
        }
    }

    fn gong_task(&self) {
        self.gong_running.store(true, Ordering::Release);

        let Some(_guard) = self.playback_lock.try_lock_for(Duration::from_secs(1)) else {
            self.gong_running.store(false, Ordering::Release);
            return;
        };

        if self.bus.enable_tx().is_ok() {
            self.bus.preload_silence(3);

            if !GONG_PCM.is_empty() {
                log::info!("playing embedded gong PCM ({} bytes)", GONG_PCM.len());
                self.play_embedded_pcm();
            } else {
                log::info!("playing synthesized gong (880/660 Hz)");
                self.play_synthesized_gong();
            }

            // Flush the circular DMA so the tail does not keep looping.
            let silence = [0i16; 256];
            for _ in 0..DMA_BUF_COUNT + 2 {
                let stereo = duplicate_stereo(&silence);
                let bytes: &[u8] = bytemuck::cast_slice(&stereo);
                let _ = self.bus.write_tx(bytes, TX_WRITE_TIMEOUT);
            }
            let _ = self.bus.disable_tx();
        }

        log::info!("gong playback finished");
        self.gong_running.store(false, Ordering::Release);
    }

    fn play_embedded_pcm(&self) {
        let volume = self.volume() as i32;
        let pcm: &[i16] = bytemuck::cast_slice(GONG_PCM);
        for chunk in pcm.chunks(256) {
            if !self.write_scaled(chunk, volume * GONG_HEADROOM_PCT, 10_000, TX_WRITE_TIMEOUT)
            {
                break;
            }
        }
    }

    fn play_synthesized_gong(&self) {
        let volume = self.volume() as i32;
        let samples_per_tone = (AUDIO_SAMPLE_RATE / 3) as usize;

        for (freq, peak) in [(880.0f32, 5000.0f32), (660.0, 4500.0)] {
            let mut phase = 0.0f32;
            let step = 2.0 * std::f32::consts::PI * freq / AUDIO_SAMPLE_RATE as f32;
            let mut buf = [0i16; 256];

            let mut produced = 0usize;
            while produced < samples_per_tone {
                let chunk = (samples_per_tone - produced).min(256);
                let envelope = 1.0 - produced as f32 / samples_per_tone as f32;
                for s in buf[..chunk].iter_mut() {
                    let sample = phase.sin() * envelope * peak;
                    *s = ((sample as i32 * volume) / 100).clamp(-32768, 32767) as i16;
                    phase += step;
                    if phase > 2.0 * std::f32::consts::PI {
                        phase -= 2.0 * std::f32::consts::PI;
                    }
                }
                if !self.write_raw(&buf[..chunk], TX_WRITE_TIMEOUT) {
                    return;
                }
                produced += chunk;
            }
        }
    }

    /// Scale by `numerator/denominator` with saturation, duplicate to
    /// stereo, and push to the bus in 256-sample chunks.
    fn write_scaled(
        &self,
        pcm: &[i16],
        numerator: i32,
        denominator: i32,
        timeout: Duration,
    ) -> bool {
        let mut scaled = [0i16; 256];
        for chunk in pcm.chunks(256) {
            for (i, s) in chunk.iter().enumerate() {
                scaled[i] = ((*s as i32 * numerator) / denominator).clamp(-32768, 32767) as i16;
            }
            if !self.write_raw(&scaled[..chunk.len()], timeout) {
                return false;
            }
        }
        true
    }

    fn write_raw(&self, pcm: &[i16], timeout: Duration) -> bool {
        let stereo = duplicate_stereo(pcm);
        let bytes: &[u8] = bytemuck::cast_slice(&stereo[..pcm.len() * 2]);
        self.bus.write_tx(bytes, timeout).is_ok()
    }
}

fn duplicate_stereo(mono: &[i16]) -> [i16; 512] {
    let mut stereo = [0i16; 512];
    for (i, s) in mono.iter().take(256).enumerate() {
        stereo[2 * i] = *s;
        stereo[2 * i + 1] = *s;
    }
    stereo
}
