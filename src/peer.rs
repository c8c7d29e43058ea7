use std::net::{IpAddr, SocketAddr};

/// Synthetic target id for "this device" in fan-out requests.
pub const LOCAL_PEER_ID: &str = "local";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub online: bool,
    // unix ms of the last announcement, discovered peers only
    #[serde(default)]
    pub last_seen: Option<u64>,
    #[serde(default)]
    pub last_checked: Option<u64>,
}

impl Peer {
    pub fn discovered(ip: IpAddr, port: u16, name: String, now: u64) -> Self {
        Self {
            id: peer_id(ip, port),
            name,
            ip,
            port,
            manual: false,
            online: true,
            last_seen: Some(now),
            last_checked: None,
        }
    }

    pub fn manual(ip: IpAddr, port: u16, name: String) -> Self {
        Self {
            id: peer_id(ip, port),
            name,
            ip,
            port,
            manual: true,
            online: false,
            last_seen: None,
            last_checked: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// `http://ip:port`, with brackets for IPv6.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr())
    }
}

/// Canonical `"<ip>:<port>"` key.
pub fn peer_id(ip: IpAddr, port: u16) -> String {
    format!("{}:{}", ip, port)
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
