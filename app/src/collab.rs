//! Collaborator seams the orchestrator drives but whose internals live
//! outside the core: HTTP server, captive-portal DNS, MJPEG server, SNTP,
//! status LED, and the doorbell button. Host builds get no-op fakes; the
//! device wires its real components behind these traits.

use std::sync::Arc;

use hardware::{AacPipeline, MicCapture};

pub trait HttpServerControl: Send {
    /// Returns true once the server is up.
    fn start(&mut self) -> bool;
    fn stop(&mut self);
}

pub trait DnsResponderControl: Send {
    fn start(&mut self);
    fn stop(&mut self);
}

pub trait MjpegServerControl: Send {
    fn start(&mut self) -> bool;
    fn stop(&mut self);
    fn client_count(&self) -> usize;
}

pub trait SntpControl: Send {
    fn init(&mut self, timezone: &str);
}

/// LED state bits; the LED module resolves priority and animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Ringing,
    ApMode,
    WifiConnecting,
    SipError,
    SipOk,
    RtspActive,
}

pub trait StatusLed: Send {
    fn set_state(&mut self, state: LedState, active: bool);
    fn update(&mut self);
    fn mark_ring(&mut self);
}

pub trait ButtonInput: Send {
    /// Debounced edge poll: true exactly once per press.
    fn poll_pressed(&mut self) -> bool;
}

// ----- Host no-op implementations -----------------------------------------

#[derive(Default)]
pub struct NullHttpServer {
    running: bool,
}

impl HttpServerControl for NullHttpServer {
    fn start(&mut self) -> bool {
        self.running = true;
        log::info!("web server started");
        true
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

#[derive(Default)]
pub struct NullDnsResponder;

impl DnsResponderControl for NullDnsResponder {
    fn start(&mut self) {
        log::info!("captive DNS started");
    }

    fn stop(&mut self) {}
}

#[derive(Default)]
pub struct NullMjpegServer;

impl MjpegServerControl for NullMjpegServer {
    fn start(&mut self) -> bool {
        log::info!("MJPEG server started on port 81");
        true
    }

    fn stop(&mut self) {}

    fn client_count(&self) -> usize {
        0
    }
}

#[derive(Default)]
pub struct NullSntp;

impl SntpControl for NullSntp {
    fn init(&mut self, timezone: &str) {
        log::info!("SNTP initialized (TZ={timezone})");
    }
}

#[derive(Default)]
pub struct NullLed;

impl StatusLed for NullLed {
    fn set_state(&mut self, _state: LedState, _active: bool) {}
    fn update(&mut self) {}
    fn mark_ring(&mut self) {}
}

#[derive(Default)]
pub struct NullButton;

impl ButtonInput for NullButton {
    fn poll_pressed(&mut self) -> bool {
        false
    }
}

// ----- RTSP audio adapter --------------------------------------------------

/// Feeds the RTSP server from the AAC pipeline. The audio track exists on
/// the wire only while the mic feature is enabled.
pub struct AacAudioSource {
    pipeline: Arc<AacPipeline>,
    mic: Arc<MicCapture>,
}

impl AacAudioSource {
    pub fn new(pipeline: Arc<AacPipeline>, mic: Arc<MicCapture>) -> Self {
        Self { pipeline, mic }
    }
}

impl rtsp_core::AudioSource for AacAudioSource {
    fn enabled(&self) -> bool {
        self.mic.is_enabled()
    }

    fn sample_rate(&self) -> u32 {
        self.pipeline.sample_rate()
    }

    fn rtpmap(&self) -> String {
        self.pipeline.sdp_rtpmap()
    }

    fn fmtp(&self) -> String {
        self.pipeline.sdp_fmtp()
    }

    fn read_frame(&self, out: &mut [u8]) -> Option<usize> {
        self.pipeline.get_frame(out)
    }
}
