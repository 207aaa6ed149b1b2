//! Boot orchestration: deferred flags, bring-up order, idempotent service
//! starts, button handling and LED state computation, with recording
//! collaborator fakes.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use app::collab::{
    ButtonInput, DnsResponderControl, HttpServerControl, LedState, MjpegServerControl,
    SntpControl, StatusLed,
};
use app::sip::SipEndpoint;
use app::{Collaborators, NetEvent, Orchestrator};
use hardware::camera::TestPatternCamera;
use hardware::net::StaticNet;
use hardware::store::{MemStore, Store};
use parking_lot::Mutex;

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    fn push(&self, e: &str) {
        self.0.lock().push(e.to_string());
    }

    fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn count(&self, e: &str) -> usize {
        self.0.lock().iter().filter(|x| x.as_str() == e).count()
    }

    fn position(&self, e: &str) -> Option<usize> {
        self.0.lock().iter().position(|x| x == e)
    }
}

struct RecHttp(Events);
impl HttpServerControl for RecHttp {
    fn start(&mut self) -> bool {
        self.0.push("http.start");
        true
    }
    fn stop(&mut self) {
        self.0.push("http.stop");
    }
}

struct RecDns(Events);
impl DnsResponderControl for RecDns {
    fn start(&mut self) {
        self.0.push("dns.start");
    }
    fn stop(&mut self) {
        self.0.push("dns.stop");
    }
}

struct RecMjpeg(Events);
impl MjpegServerControl for RecMjpeg {
    fn start(&mut self) -> bool {
        self.0.push("mjpeg.start");
        true
    }
    fn stop(&mut self) {
        self.0.push("mjpeg.stop");
    }
    fn client_count(&self) -> usize {
        0
    }
}

struct RecSntp(Events);
impl SntpControl for RecSntp {
    fn init(&mut self, timezone: &str) {
        self.0.push(&format!("sntp.init:{timezone}"));
    }
}

struct RecLed(Events);
impl StatusLed for RecLed {
    fn set_state(&mut self, state: LedState, active: bool) {
        if active {
            self.0.push(&format!("led.{state:?}"));
        }
    }
    fn update(&mut self) {}
    fn mark_ring(&mut self) {
        self.0.push("led.mark_ring");
    }
}

struct ScriptedButton {
    presses: Arc<Mutex<u32>>,
}
impl ButtonInput for ScriptedButton {
    fn poll_pressed(&mut self) -> bool {
        let mut presses = self.presses.lock();
        if *presses > 0 {
            *presses -= 1;
            true
        } else {
            false
        }
    }
}

fn recording_collaborators(events: Events, presses: Arc<Mutex<u32>>) -> Collaborators {
    Collaborators {
        http: Box::new(RecHttp(events.clone())),
        dns: Box::new(RecDns(events.clone())),
        mjpeg: Box::new(RecMjpeg(events.clone())),
        sntp: Box::new(RecSntp(events.clone())),
        led: Box::new(RecLed(events)),
        button: Box::new(ScriptedButton { presses }),
    }
}

fn orchestrator(
    store: Arc<MemStore>,
    connected: bool,
    events: Events,
    presses: Arc<Mutex<u32>>,
) -> Orchestrator {
    let net = Arc::new(StaticNet {
        connected,
        ip: Ipv4Addr::new(127, 0, 0, 1),
        gateway: Ipv4Addr::new(127, 0, 0, 1),
    });
    let camera = Arc::new(TestPatternCamera::default());
    let mut orch = Orchestrator::new(
        store,
        net,
        camera,
        recording_collaborators(events, presses),
        SipEndpoint {
            domain: "fritz.box".into(),
            local_sip_port: 0,
            local_rtp_port: 0,
            proxy_override: None,
        },
    )
    .unwrap();
    orch.rtsp_port = 0; // ephemeral for tests
    orch
}

#[test]
fn ip_acquired_brings_services_up_in_order() {
    let store = Arc::new(MemStore::new());
    store.set_u8("camera", "rtsp_enabled", 1).unwrap();
    store.set_u8("camera", "mic_en", 1).unwrap();
    // no SIP credentials: client comes up unconfigured

    let events = Events::default();
    let presses = Arc::new(Mutex::new(0));
    let mut orch = orchestrator(store, true, events.clone(), Arc::clone(&presses));

    orch.flags().on_event(NetEvent::StaGotIp);
    orch.tick(Instant::now());

    let dns_stop = events.position("dns.stop").expect("captive DNS stopped");
    let http = events.position("http.start").expect("http started");
    let mjpeg = events.position("mjpeg.start").expect("mjpeg started");
    assert!(dns_stop < http, "DNS teardown precedes HTTP");
    assert!(http < mjpeg, "HTTP precedes the camera stack");
    assert!(
        events.all().iter().any(|e| e.starts_with("sntp.init:")),
        "SNTP initialized with a timezone"
    );

    assert!(orch.sip().is_some(), "SIP client initialized");
    assert!(orch.rtsp().is_some(), "RTSP server started");
    assert!(orch.mic().is_running(), "mic capture started");
}

#[test]
fn repeated_ip_events_do_not_reinitialize() {
    let store = Arc::new(MemStore::new());
    store.set_u8("camera", "rtsp_enabled", 1).unwrap();

    let events = Events::default();
    let presses = Arc::new(Mutex::new(0));
    let mut orch = orchestrator(store, true, events.clone(), Arc::clone(&presses));

    orch.flags().on_event(NetEvent::StaGotIp);
    orch.tick(Instant::now());
    orch.flags().on_event(NetEvent::StaGotIp);
    orch.tick(Instant::now());
    orch.tick(Instant::now());

    assert_eq!(events.count("http.start"), 1, "HTTP started once");
    assert_eq!(events.count("mjpeg.start"), 1, "camera stack brought up once");
    assert_eq!(
        events.all().iter().filter(|e| e.starts_with("sntp.init")).count(),
        1,
        "SNTP initialized once"
    );
}

#[test]
fn ap_mode_starts_captive_portal() {
    let store = Arc::new(MemStore::new());
    let events = Events::default();
    let presses = Arc::new(Mutex::new(0));
    let mut orch = orchestrator(store, false, events.clone(), Arc::clone(&presses));

    orch.flags().on_event(NetEvent::ApStarted);
    orch.tick(Instant::now());

    assert_eq!(events.count("dns.start"), 1);
    assert_eq!(events.count("http.start"), 1);

    orch.flags().on_event(NetEvent::ApStopped);
    orch.tick(Instant::now());
    assert!(events.count("dns.stop") >= 1);
}

#[test]
fn sip_feature_toggle_skips_init() {
    let store = Arc::new(MemStore::new());
    store.set_u8("sip", "sip_enabled", 0).unwrap();

    let events = Events::default();
    let presses = Arc::new(Mutex::new(0));
    let mut orch = orchestrator(store, true, events, Arc::clone(&presses));

    orch.flags().on_event(NetEvent::StaGotIp);
    orch.tick(Instant::now());
    assert!(orch.sip().is_none(), "SIP disabled by config");
}

#[test]
fn button_press_marks_ring_and_plays_gong() {
    let store = Arc::new(MemStore::new());
    let events = Events::default();
    let presses = Arc::new(Mutex::new(1));
    let mut orch = orchestrator(store, true, events.clone(), Arc::clone(&presses));

    orch.flags().on_event(NetEvent::StaGotIp);
    orch.tick(Instant::now());

    assert_eq!(events.count("led.mark_ring"), 1);
    // second tick without a press: no new ring mark
    orch.tick(Instant::now());
    assert_eq!(events.count("led.mark_ring"), 1);
}

#[test]
fn led_reports_connecting_when_provisioned_but_offline() {
    let store = Arc::new(MemStore::new());
    let events = Events::default();
    let presses = Arc::new(Mutex::new(0));
    let mut orch = orchestrator(store, false, events.clone(), Arc::clone(&presses));

    orch.tick(Instant::now());
    assert!(events.count("led.WifiConnecting") >= 1);
    assert_eq!(events.count("led.ApMode"), 0);
    assert_eq!(events.count("led.SipOk"), 0);
}
