//! Compile-time configuration loaded via `toml-cfg`.

#[toml_cfg::toml_config]
pub struct Settings {
    #[default("fritz.box")]
    pub sip_domain: &'static str,
    #[default("fritz.box")]
    pub sip_proxy: &'static str,
    #[default("ESP32-Doorbell/1.0")]
    pub user_agent: &'static str,
    #[default("doorbell-setup")]
    pub ap_ssid: &'static str,
    #[default("doorbell123")]
    pub ap_password: &'static str,
}
