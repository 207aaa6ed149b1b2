//! Network state collaborator. Wi-Fi association itself is out of scope;
//! the core only asks whether the network is up and what the addresses are.

use std::net::{Ipv4Addr, UdpSocket};

pub trait NetInfo: Send + Sync {
    fn is_connected(&self) -> bool;
    fn local_ip(&self) -> Ipv4Addr;
    fn gateway_ip(&self) -> Ipv4Addr;
    fn rssi(&self) -> i8;
    /// Whether station credentials exist at all (false means the device
    /// sits in provisioning AP mode).
    fn is_provisioned(&self) -> bool {
        true
    }
}

/// Host-side network info derived from the default route.
#[derive(Debug, Default)]
pub struct HostNet;

impl HostNet {
    /// Route-based local address discovery: connect a UDP socket (no
    /// packets are sent) and read the chosen source address.
    fn route_ip() -> Ipv4Addr {
        let Ok(sock) = UdpSocket::bind("0.0.0.0:0") else {
            return Ipv4Addr::LOCALHOST;
        };
        if sock.connect(("8.8.8.8", 53)).is_err() {
            return Ipv4Addr::LOCALHOST;
        }
        match sock.local_addr() {
            Ok(std::net::SocketAddr::V4(a)) => *a.ip(),
            _ => Ipv4Addr::LOCALHOST,
        }
    }
}

impl NetInfo for HostNet {
    fn is_connected(&self) -> bool {
        true
    }

    fn local_ip(&self) -> Ipv4Addr {
        Self::route_ip()
    }

    fn gateway_ip(&self) -> Ipv4Addr {
        let ip = Self::route_ip();
        let o = ip.octets();
        Ipv4Addr::new(o[0], o[1], o[2], 1)
    }

    fn rssi(&self) -> i8 {
        -50
    }
}

#[cfg(target_os = "espidf")]
pub use esp::EspNet;

#[cfg(target_os = "espidf")]
mod esp {
    use std::net::Ipv4Addr;

    use esp_idf_svc::sys::{
        esp_netif_get_handle_from_ifkey, esp_netif_get_ip_info, esp_netif_ip_info_t,
        esp_wifi_sta_get_ap_info, wifi_ap_record_t,
    };

    use super::NetInfo;

    /// Station-interface network info straight from the IP stack.
    #[derive(Debug, Default)]
    pub struct EspNet;

    impl EspNet {
        fn ip_info() -> Option<esp_netif_ip_info_t> {
            unsafe {
                let netif =
                    esp_netif_get_handle_from_ifkey(b"WIFI_STA_DEF\0".as_ptr() as *const _);
                if netif.is_null() {
                    return None;
                }
                let mut info: esp_netif_ip_info_t = core::mem::zeroed();
                if esp_netif_get_ip_info(netif, &mut info) != 0 {
                    return None;
                }
                Some(info)
            }
        }
    }

    impl NetInfo for EspNet {
        fn is_connected(&self) -> bool {
            Self::ip_info()
                .map(|i| i.ip.addr != 0)
                .unwrap_or(false)
        }

        fn local_ip(&self) -> Ipv4Addr {
            Self::ip_info()
                .map(|i| Ipv4Addr::from(u32::from_be(i.ip.addr)))
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
        }

        fn gateway_ip(&self) -> Ipv4Addr {
            Self::ip_info()
                .map(|i| Ipv4Addr::from(u32::from_be(i.gw.addr)))
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
        }

        fn rssi(&self) -> i8 {
            unsafe {
                let mut record: wifi_ap_record_t = core::mem::zeroed();
                if esp_wifi_sta_get_ap_info(&mut record) == 0 {
                    record.rssi
                } else {
                    0
                }
            }
        }
    }
}

/// Fixed-address stand-in for tests that must not touch the routing table.
#[derive(Debug)]
pub struct StaticNet {
    pub connected: bool,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl NetInfo for StaticNet {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn gateway_ip(&self) -> Ipv4Addr {
        self.gateway
    }

    fn rssi(&self) -> i8 {
        -40
    }
}
