//! Boot orchestrator and main loop.
//!
//! Event callbacks (Wi-Fi, web handlers) are forbidden from touching the
//! network or persistence APIs: they run on stacks with almost no
//! headroom. They only flip one-shot flags; the main loop services the
//! flags with its full stack, brings services up in dependency order, and
//! drives the SIP tick, the button, and the status LED every 50 ms.

pub mod collab;
pub mod config;
pub mod dsp;
pub mod logring;
pub mod settings;
pub mod sip;
pub mod tasks;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use hardware::{AacPipeline, AudioBus, Camera, MicCapture, NetInfo, SpeakerOutput, Store};
use rtsp_core::{RtspServer, RtspServerConfig};

use crate::collab::{
    AacAudioSource, ButtonInput, DnsResponderControl, HttpServerControl, LedState,
    MjpegServerControl, SntpControl, StatusLed,
};
use crate::config::SipConfig;
use crate::sip::{RingRequester, SipClient, SipEndpoint};

pub const MAIN_LOOP_PERIOD: Duration = Duration::from_millis(50);
const STATUS_LOG_TICKS: u32 = 200; // ~10 s

#[derive(Debug, Error)]
pub enum AppError {
    #[error("hardware error: {0}")]
    Hardware(#[from] hardware::HardwareError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rtsp error: {0}")]
    Rtsp(#[from] rtsp_core::RtspError),
}

/// Network-layer events, delivered from callback context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    StaGotIp,
    StaDisconnected,
    ApStarted,
    ApStopped,
}

/// One-shot flags set from restricted contexts and consumed by the main
/// loop. Single-writer-per-flag, so plain atomics suffice.
#[derive(Default)]
pub struct DeferredFlags {
    dns_start: AtomicBool,
    dns_stop: AtomicBool,
    web_start: AtomicBool,
    sip_init: AtomicBool,
    camera_init: AtomicBool,
    sntp_init: AtomicBool,
}

impl DeferredFlags {
    /// Callback-safe: nothing but flag stores happens here.
    pub fn on_event(&self, event: NetEvent) {
        match event {
            NetEvent::StaGotIp => {
                log::info!("got IP - queueing service start");
                self.dns_stop.store(true, Ordering::Release);
                self.web_start.store(true, Ordering::Release);
                self.sip_init.store(true, Ordering::Release);
                self.camera_init.store(true, Ordering::Release);
                self.sntp_init.store(true, Ordering::Release);
            }
            NetEvent::StaDisconnected => {
                log::warn!("WiFi disconnected");
            }
            NetEvent::ApStarted => {
                log::info!("AP mode active - queueing server start");
                self.dns_start.store(true, Ordering::Release);
                self.web_start.store(true, Ordering::Release);
            }
            NetEvent::ApStopped => {
                self.dns_stop.store(true, Ordering::Release);
            }
        }
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::AcqRel)
    }
}

pub struct Collaborators {
    pub http: Box<dyn HttpServerControl>,
    pub dns: Box<dyn DnsResponderControl>,
    pub mjpeg: Box<dyn MjpegServerControl>,
    pub sntp: Box<dyn SntpControl>,
    pub led: Box<dyn StatusLed>,
    pub button: Box<dyn ButtonInput>,
}

impl Collaborators {
    pub fn null_set() -> Self {
        Self {
            http: Box::<collab::NullHttpServer>::default(),
            dns: Box::<collab::NullDnsResponder>::default(),
            mjpeg: Box::<collab::NullMjpegServer>::default(),
            sntp: Box::<collab::NullSntp>::default(),
            led: Box::<collab::NullLed>::default(),
            button: Box::<collab::NullButton>::default(),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    net: Arc<dyn NetInfo>,
    camera: Arc<dyn Camera>,
    flags: Arc<DeferredFlags>,
    collab: Collaborators,

    mic: Arc<MicCapture>,
    speaker: Arc<SpeakerOutput>,
    aac: Arc<AacPipeline>,

    sip: Option<SipClient>,
    /// Present only when the loaded SIP config is complete.
    sip_config: Option<SipConfig>,
    rtsp: Option<RtspServer>,

    pub sip_endpoint: SipEndpoint,
    pub rtsp_port: u16,
    pub reboot_requested: Arc<AtomicBool>,

    http_started: bool,
    sntp_done: bool,
    camera_done: bool,
    tick_count: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        net: Arc<dyn NetInfo>,
        camera: Arc<dyn Camera>,
        collab: Collaborators,
        sip_endpoint: SipEndpoint,
    ) -> Result<Self, AppError> {
        // Diagnostic mode makes the whole audio/signaling path chatty.
        if config::hardware_diag_enabled(store.as_ref()) {
            log::set_max_level(log::LevelFilter::Debug);
            log::info!("hardware diagnostic mode enabled");
        }

        let bus = AudioBus::new()?;
        let mic = Arc::new(MicCapture::new(Arc::clone(&bus), store.as_ref()));
        let speaker = SpeakerOutput::new(bus, store.as_ref());
        let aac = Arc::new(AacPipeline::new(Arc::clone(&mic), store.as_ref()));

        Ok(Self {
            store,
            net,
            camera,
            flags: Arc::new(DeferredFlags::default()),
            collab,
            mic,
            speaker,
            aac,
            sip: None,
            sip_config: None,
            rtsp: None,
            sip_endpoint,
            rtsp_port: rtsp_core::RTSP_PORT,
            reboot_requested: Arc::new(AtomicBool::new(false)),
            http_started: false,
            sntp_done: false,
            camera_done: false,
            tick_count: 0,
        })
    }

    pub fn flags(&self) -> Arc<DeferredFlags> {
        Arc::clone(&self.flags)
    }

    pub fn sip(&self) -> Option<&SipClient> {
        self.sip.as_ref()
    }

    pub fn sip_mut(&mut self) -> Option<&mut SipClient> {
        self.sip.as_mut()
    }

    pub fn ring_requester(&self) -> Option<RingRequester> {
        self.sip.as_ref().map(|s| s.ring_requester())
    }

    pub fn rtsp(&self) -> Option<&RtspServer> {
        self.rtsp.as_ref()
    }

    pub fn mic(&self) -> &Arc<MicCapture> {
        &self.mic
    }

    pub fn speaker(&self) -> &Arc<SpeakerOutput> {
        &self.speaker
    }

    /// One main-loop iteration.
    pub fn tick(&mut self, now: Instant) {
        self.service_deferred(now);
        self.sip_tick(now);

        if self.collab.button.poll_pressed() {
            self.on_button_press();
        }

        self.update_led(now);

        self.tick_count = self.tick_count.wrapping_add(1);
        if self.tick_count % STATUS_LOG_TICKS == 0 {
            self.log_status(now);
        }
    }

    pub fn run_forever(&mut self) {
        log::info!("main loop starting");
        while !self.reboot_requested.load(Ordering::Acquire) {
            self.tick(Instant::now());
            std::thread::sleep(MAIN_LOOP_PERIOD);
        }
        log::info!("reboot requested, leaving main loop");
    }

    // --- Deferred bring-up -------------------------------------------------

    fn service_deferred(&mut self, _now: Instant) {
        if DeferredFlags::take(&self.flags.dns_stop) {
            self.collab.dns.stop();
        }
        if DeferredFlags::take(&self.flags.dns_start) {
            log::info!("starting DNS server...");
            self.collab.dns.start();
        }
        if DeferredFlags::take(&self.flags.sntp_init) && !self.sntp_done {
            self.collab.sntp.init(&config::timezone(self.store.as_ref()));
            self.sntp_done = true;
        }
        if DeferredFlags::take(&self.flags.web_start) && !self.http_started {
            log::info!("starting web server...");
            self.http_started = self.collab.http.start();
        }
        if DeferredFlags::take(&self.flags.sip_init) && self.sip.is_none() {
            self.init_sip();
        }
        if DeferredFlags::take(&self.flags.camera_init) && !self.camera_done {
            self.bring_up_camera_stack();
        }
    }

    fn init_sip(&mut self) {
        if !config::sip_enabled(self.store.as_ref()) {
            log::info!("SIP feature disabled - skipping init");
            return;
        }
        let cfg = SipConfig::load(self.store.as_ref());
        match SipClient::new(
            self.sip_endpoint.clone(),
            Arc::clone(&self.net),
            Arc::clone(&self.mic),
            Arc::clone(&self.speaker),
            cfg.verbose,
        ) {
            Ok(client) => {
                self.sip = Some(client);
                if cfg.is_valid() {
                    log::info!("SIP config loaded");
                    self.sip_config = Some(cfg);
                } else {
                    log::info!("no SIP config - configure via web interface");
                }
            }
            Err(e) => log::warn!("SIP client init failed: {e}"),
        }
    }

    /// Camera bring-up subsequence: driver, MJPEG, RTSP (if enabled), mic,
    /// AAC, speaker, strictly in that order.
    fn bring_up_camera_stack(&mut self) {
        self.camera_done = true;

        if !config::http_camera_enabled(self.store.as_ref()) {
            log::info!("HTTP camera streaming disabled - skipping camera init");
            return;
        }
        if !self.camera.is_ready() {
            log::warn!("camera not ready (streaming disabled)");
            return;
        }

        log::info!("camera initialized, starting MJPEG server...");
        if !self.collab.mjpeg.start() {
            log::warn!("MJPEG server start failed");
        }

        if config::rtsp_enabled(self.store.as_ref()) {
            let audio = Arc::new(AacAudioSource::new(
                Arc::clone(&self.aac),
                Arc::clone(&self.mic),
            ));
            match RtspServer::start(
                RtspServerConfig {
                    port: self.rtsp_port,
                    local_ip: self.net.local_ip(),
                    allow_udp: false,
                },
                Arc::clone(&self.camera),
                audio,
            ) {
                Ok(server) => {
                    log::info!("RTSP server started on port {}", server.port());
                    self.rtsp = Some(server);
                }
                Err(e) => log::warn!("RTSP server start failed: {e}"),
            }
        } else {
            log::info!("RTSP streaming disabled - skipping RTSP server");
        }

        if self.mic.is_enabled() {
            match self.mic.start() {
                Ok(()) => {
                    log::info!("audio capture started ({:?})", self.mic.source());
                    // Pipeline initializes lazily on the first frame pull.
                    log::info!("AAC encoder pipeline ready");
                }
                Err(e) => log::warn!("audio capture start failed: {e}"),
            }
        } else {
            log::info!("mic disabled - skipping audio capture");
        }

        log::info!("speaker output ready (volume={}%)", self.speaker.volume());
    }

    // --- Periodic work -----------------------------------------------------

    fn sip_tick(&mut self, now: Instant) {
        if !config::sip_enabled(self.store.as_ref()) || !self.net.is_connected() {
            return;
        }
        let Some(sip) = self.sip.as_mut() else {
            return;
        };

        let fallback;
        let (cfg, cfg_valid) = match self.sip_config.as_ref() {
            Some(c) => (c, true),
            None => {
                fallback = SipConfig::default();
                (&fallback, false)
            }
        };

        sip.handle_incoming(cfg, now);
        if cfg_valid {
            sip.check_pending_ring(cfg, now);
        }
        if sip.ring_active() {
            sip.ring_process(now);
        }
        sip.media_process(now);
        if cfg_valid {
            sip.register_if_needed(cfg, now);
        }
    }

    fn on_button_press(&mut self) {
        log::info!("doorbell button pressed!");

        self.collab.led.mark_ring();

        // Gong is fire-and-forget on its own task.
        hardware::SpeakerOutput::play_gong(&self.speaker);

        match self.sip.as_ref() {
            Some(sip) if config::sip_enabled(self.store.as_ref()) => {
                if sip.request_ring() {
                    log::info!("SIP ring requested");
                } else {
                    log::warn!("SIP ring request refused (busy)");
                }
            }
            _ => log::warn!("SIP not available - ring not sent"),
        }
    }

    fn update_led(&mut self, now: Instant) {
        let connected = self.net.is_connected();
        let provisioned = self.net.is_provisioned();
        let is_ap_mode = !provisioned;
        let is_connecting = provisioned && !connected;

        let ringing = self.sip.as_ref().map(|s| s.ring_active()).unwrap_or(false);
        let sip_ok = self
            .sip
            .as_ref()
            .map(|s| s.is_registered(now))
            .unwrap_or(false);
        let sip_error = self.sip.is_some() && self.sip_config.is_some() && !sip_ok;
        let rtsp_active = self
            .rtsp
            .as_ref()
            .map(|r| r.active_session_count() > 0)
            .unwrap_or(false)
            || self.collab.mjpeg.client_count() > 0;

        let led = &mut self.collab.led;
        led.set_state(LedState::Ringing, ringing);
        led.set_state(LedState::ApMode, is_ap_mode && !is_connecting);
        led.set_state(LedState::WifiConnecting, is_connecting);
        led.set_state(LedState::SipError, sip_error);
        led.set_state(LedState::SipOk, sip_ok && !sip_error);
        led.set_state(LedState::RtspActive, rtsp_active);
        led.update();
    }

    fn log_status(&self, now: Instant) {
        if self.net.is_connected() {
            if !config::sip_enabled(self.store.as_ref()) {
                log::info!("status: IP={} SIP=disabled", self.net.local_ip());
            } else {
                let registered = self
                    .sip
                    .as_ref()
                    .map(|s| s.is_registered(now))
                    .unwrap_or(false);
                log::info!(
                    "status: IP={} registered={}",
                    self.net.local_ip(),
                    if registered { "yes" } else { "no" }
                );
            }
        } else {
            log::info!(
                "status: {}",
                if self.net.is_provisioned() {
                    "connecting..."
                } else {
                    "AP mode"
                }
            );
        }
    }
}

// --- Entry point -----------------------------------------------------------

pub fn run() -> Result<(), AppError> {
    let ring = logring::LogRing::new();
    logring::RingLogger::install(Arc::clone(&ring));

    log::info!("====================================");
    log::info!("doorbell firmware starting");
    log::info!("====================================");

    let store = platform_store()?;
    let net = platform_net();
    let camera = platform_camera();

    let mut orchestrator = Orchestrator::new(
        store,
        net,
        camera,
        Collaborators::null_set(),
        SipEndpoint::default(),
    )?;

    // Wi-Fi association is a collaborator concern; once the stack reports
    // an address the event lands here. On the host the network already
    // exists, so report it immediately.
    orchestrator.flags().on_event(NetEvent::StaGotIp);

    orchestrator.run_forever();
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn platform_store() -> Result<Arc<dyn Store>, AppError> {
    Ok(Arc::new(hardware::store::MemStore::new()))
}

#[cfg(target_os = "espidf")]
fn platform_store() -> Result<Arc<dyn Store>, AppError> {
    let partition = esp_idf_svc::nvs::EspDefaultNvsPartition::take()
        .map_err(|_| hardware::HardwareError::Storage("nvs partition"))?;
    Ok(Arc::new(hardware::store::NvsStore::new(partition)))
}

#[cfg(not(target_os = "espidf"))]
fn platform_net() -> Arc<dyn NetInfo> {
    Arc::new(hardware::net::HostNet)
}

#[cfg(target_os = "espidf")]
fn platform_net() -> Arc<dyn NetInfo> {
    Arc::new(hardware::net::EspNet)
}

#[cfg(not(target_os = "espidf"))]
fn platform_camera() -> Arc<dyn Camera> {
    Arc::new(hardware::camera::TestPatternCamera::default())
}

#[cfg(target_os = "espidf")]
fn platform_camera() -> Arc<dyn Camera> {
    // Sensor driver binding point; until wired, streaming reports
    // "camera not ready".
    Arc::new(hardware::camera::NoCamera)
}
