//! Runtime configuration read from the persistent store. Namespace and key
//! layout matches what the web UI writes.

use hardware::Store;

pub const NS_SIP: &str = "sip";
pub const NS_CAMERA: &str = "camera";
pub const NS_SYSTEM: &str = "system";

pub const DEFAULT_TIMEZONE: &str = "CET-1CEST,M3.5.0,M10.5.0/3";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipConfig {
    pub user: String,
    pub password: String,
    pub display_name: String,
    pub target: String,
    pub verbose: bool,
}

impl SipConfig {
    pub fn load(store: &dyn Store) -> Self {
        Self {
            user: store.get_str(NS_SIP, "sip_user").unwrap_or_default(),
            // Stored clear-text; the store sits on local flash only.
            password: store.get_str(NS_SIP, "sip_password").unwrap_or_default(),
            display_name: store
                .get_str(NS_SIP, "sip_displayname")
                .unwrap_or_else(|| "Doorbell".to_string()),
            target: store
                .get_str(NS_SIP, "sip_target")
                .unwrap_or_else(|| "**610".to_string()),
            verbose: store.get_u8(NS_SIP, "sip_verbose").unwrap_or(0) != 0,
        }
    }

    pub fn save(&self, store: &dyn Store) -> hardware::Result<()> {
        store.set_str(NS_SIP, "sip_user", &self.user)?;
        store.set_str(NS_SIP, "sip_password", &self.password)?;
        store.set_str(NS_SIP, "sip_displayname", &self.display_name)?;
        store.set_str(NS_SIP, "sip_target", &self.target)?;
        store.set_u8(NS_SIP, "sip_verbose", self.verbose as u8)?;
        store.commit(NS_SIP)
    }

    pub fn is_valid(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty() && !self.target.is_empty()
    }
}

pub fn sip_enabled(store: &dyn Store) -> bool {
    store.get_u8(NS_SIP, "sip_enabled").unwrap_or(1) != 0
}

pub fn http_camera_enabled(store: &dyn Store) -> bool {
    store.get_u8(NS_CAMERA, "http_cam_en").unwrap_or(1) != 0
}

pub fn rtsp_enabled(store: &dyn Store) -> bool {
    store.get_u8(NS_CAMERA, "rtsp_enabled").unwrap_or(0) != 0
}

pub fn hardware_diag_enabled(store: &dyn Store) -> bool {
    store.get_u8(NS_CAMERA, "hw_diag").unwrap_or(0) != 0
}

pub fn timezone(store: &dyn Store) -> String {
    store
        .get_str(NS_SYSTEM, "timezone")
        .filter(|tz| !tz.is_empty())
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string())
}
