//! In-memory log ring served to the web UI. A `log::Log` tee keeps the
//! last ~100 records alongside the normal logger output; snapshots are
//! serialized to JSON filtered by a coarse category.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{Level, Log, Metadata, Record};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

pub const LOG_RING_CAPACITY: usize = 100;
const READ_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: String,
    pub tag: String,
    pub message: String,
}

/// Coarse filter categories offered by the web UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    All,
    Core,
    Camera,
    Doorbell,
}

impl LogCategory {
    pub fn from_name(name: &str) -> Self {
        match name {
            "camera" => LogCategory::Camera,
            "doorbell" => LogCategory::Doorbell,
            "core" => LogCategory::Core,
            _ => LogCategory::All,
        }
    }

    fn matches(&self, tag: &str) -> bool {
        const CAMERA_TAGS: [&str; 4] = ["rtsp_core", "camera", "mjpeg", "aac"];
        const DOORBELL_TAGS: [&str; 4] = ["sip", "rtp", "button", "gong"];
        match self {
            LogCategory::All => true,
            LogCategory::Camera => CAMERA_TAGS.iter().any(|t| tag.contains(t)),
            LogCategory::Doorbell => DOORBELL_TAGS.iter().any(|t| tag.contains(t)),
            LogCategory::Core => {
                !CAMERA_TAGS.iter().any(|t| tag.contains(t))
                    && !DOORBELL_TAGS.iter().any(|t| tag.contains(t))
            }
        }
    }
}

#[derive(Default)]
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn append(&self, level: Level, tag: &str, message: &str) {
        let entry = LogEntry {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            level: level.to_string(),
            tag: tag.to_string(),
            message: message.to_string(),
        };
        let mut entries = self.entries.lock();
        if entries.len() >= LOG_RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON snapshot for the web UI. Gives up (empty array) if the ring is
    /// contended for longer than the read budget.
    pub fn to_json(&self, category: LogCategory) -> String {
        let Some(entries) = self.entries.try_lock_for(READ_LOCK_TIMEOUT) else {
            return "[]".to_string();
        };
        let filtered: Vec<&LogEntry> = entries
            .iter()
            .filter(|e| category.matches(&e.tag))
            .collect();
        serde_json::to_string(&filtered).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Tee logger: forwards to an inner logger and mirrors into the ring.
pub struct RingLogger {
    ring: Arc<LogRing>,
    inner: Option<Box<dyn Log>>,
    max_level: Level,
}

impl RingLogger {
    /// Install as the global logger. On the host an `env_logger` backend
    /// prints to stderr; on the device the platform logger is already
    /// wired and only the ring tee is added.
    pub fn install(ring: Arc<LogRing>) {
        #[cfg(not(target_os = "espidf"))]
        let inner: Option<Box<dyn Log>> = Some(Box::new(
            env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Info)
                .build(),
        ));
        #[cfg(target_os = "espidf")]
        let inner: Option<Box<dyn Log>> = None;

        let logger = Box::new(RingLogger {
            ring,
            inner,
            max_level: Level::Debug,
        });
        if log::set_boxed_logger(logger).is_ok() {
            log::set_max_level(log::LevelFilter::Debug);
        }
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = record.target().split("::").next().unwrap_or("app");
        self.ring
            .append(record.level(), tag, &record.args().to_string());
        if let Some(inner) = &self.inner {
            inner.log(record);
        }
    }

    fn flush(&self) {
        if let Some(inner) = &self.inner {
            inner.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_at_capacity() {
        let ring = LogRing::new();
        for i in 0..150 {
            ring.append(Level::Info, "sip", &format!("msg {i}"));
        }
        assert_eq!(ring.len(), LOG_RING_CAPACITY);
        let json = ring.to_json(LogCategory::All);
        assert!(json.contains("msg 149"), "newest kept");
        assert!(!json.contains("\"msg 10\""), "oldest dropped");
    }

    #[test]
    fn category_filters_by_tag() {
        let ring = LogRing::new();
        ring.append(Level::Info, "sip", "ring sent");
        ring.append(Level::Warn, "rtsp_core", "client gone");
        ring.append(Level::Info, "app", "boot ok");

        let doorbell = ring.to_json(LogCategory::Doorbell);
        assert!(doorbell.contains("ring sent"));
        assert!(!doorbell.contains("client gone"));

        let camera = ring.to_json(LogCategory::Camera);
        assert!(camera.contains("client gone"));
        assert!(!camera.contains("boot ok"));

        let core = ring.to_json(LogCategory::Core);
        assert!(core.contains("boot ok"));
        assert!(!core.contains("ring sent"));
    }

    #[test]
    fn json_is_well_formed() {
        let ring = LogRing::new();
        ring.append(Level::Error, "sip", "with \"quotes\" and \\slashes\\");
        let json = ring.to_json(LogCategory::All);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn category_names() {
        assert_eq!(LogCategory::from_name("camera"), LogCategory::Camera);
        assert_eq!(LogCategory::from_name("doorbell"), LogCategory::Doorbell);
        assert_eq!(LogCategory::from_name("anything"), LogCategory::All);
    }
}
