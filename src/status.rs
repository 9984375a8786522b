use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use num_traits::ToPrimitive;
use serde::Serialize;

use crate::{
    config::StatusBackend,
    control::{InterfaceControl, ServiceStatus},
    error::Result,
};

const KIB_F64: f64 = 1024.0;
const MIB_F64: f64 = KIB_F64 * 1024.0;
const GIB_F64: f64 = MIB_F64 * 1024.0;
const TIB_F64: f64 = GIB_F64 * 1024.0;

/// A peer whose last handshake is older than this is considered gone.
pub const HANDSHAKE_TIMEOUT_SECS: i64 = 180;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<String>,
    pub latest_handshake: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl PeerStatus {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }

    pub fn has_handshake(&self) -> bool {
        self.latest_handshake.is_some()
    }

    /// Time since the last handshake, from either `wg show` text or an RFC 3339 stamp.
    pub fn handshake_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        let text = self.latest_handshake.as_deref()?;
        if let Ok(at) = DateTime::parse_from_rfc3339(text) {
            return Some((now - at.with_timezone(&Utc)).max(Duration::zero()));
        }
        parse_handshake_age(text)
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.handshake_age(now)
            .is_some_and(|age| age <= Duration::seconds(HANDSHAKE_TIMEOUT_SECS))
    }
}

/// Read-only view of the live interface and its supervisor.
pub struct StatusInspector {
    control: Arc<dyn InterfaceControl>,
    backend: StatusBackend,
    interface: String,
}

impl StatusInspector {
    pub fn new(control: Arc<dyn InterfaceControl>, backend: StatusBackend, interface: impl Into<String>) -> Self {
        Self {
            control,
            backend,
            interface: interface.into(),
        }
    }

    pub fn list_active_peers(&self) -> Result<Vec<PeerStatus>> {
        match self.backend {
            StatusBackend::WgShow => Ok(parse_wg_show(&self.control.peer_dump()?)),
            StatusBackend::Netlink => netlink::read_peers(&self.interface),
        }
    }

    pub fn service_status(&self) -> Result<ServiceStatus> {
        self.control.service_status()
    }
}

/**
 * @brief Parse `wg show` text into one entry per `peer:` block.
 * Fields are matched by name in any order; absent ones stay `None`/zero.
 */
pub fn parse_wg_show(output: &str) -> Vec<PeerStatus> {
    let mut peers = Vec::new();
    let mut peer: Option<PeerStatus> = None;

    for line in output.lines().map(str::trim) {
        let Some((key, val)) = line.split_once(':') else {
            continue;
        };
        let val = val.trim();

        match (key.trim(), peer.as_mut()) {
            ("peer", _) => {
                peers.extend(peer.take());
                peer = Some(PeerStatus {
                    public_key: val.into(),
                    ..Default::default()
                });
            }
            ("interface", _) => peers.extend(peer.take()),
            ("endpoint", Some(p)) => p.endpoint = Some(val.into()),
            ("allowed ips", Some(p)) => {
                p.allowed_ips = val
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty() && *v != "(none)")
                    .map(Into::into)
                    .collect();
            }
            ("latest handshake", Some(p)) => p.latest_handshake = Some(val.into()),
            ("transfer", Some(p)) => {
                for part in val.split(',').map(str::trim) {
                    if let Some(rx) = part.strip_suffix("received") {
                        p.bytes_received = parse_bytes(rx);
                    } else if let Some(tx) = part.strip_suffix("sent") {
                        p.bytes_sent = parse_bytes(tx);
                    }
                }
            }
            _ => {}
        }
    }
    peers.extend(peer);
    peers
}

/// `"1 minute, 12 seconds ago"` to a duration. `wg` prints `Now` for a fresh handshake.
fn parse_handshake_age(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("now") {
        return Some(Duration::zero());
    }
    let mut age = Duration::zero();
    for part in text.strip_suffix("ago")?.split(',') {
        let mut words = part.split_whitespace();
        let n: i64 = words.next()?.parse().ok()?;
        let unit = match words.next()?.trim_end_matches('s') {
            "second" => Duration::seconds(1),
            "minute" => Duration::minutes(1),
            "hour" => Duration::hours(1),
            "day" => Duration::days(1),
            "year" => Duration::days(365),
            _ => return None,
        };
        age += unit * i32::try_from(n).ok()?;
    }
    Some(age)
}

/// `"1.50 MiB"` to bytes.
fn parse_bytes(s: &str) -> u64 {
    let mut parts = s.split_whitespace();
    let val: f64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);

    match parts.next().map(str::to_uppercase).as_deref() {
        Some("B") => round_to_u64(val),
        Some("KIB") => round_to_u64(val * KIB_F64),
        Some("MIB") => round_to_u64(val * MIB_F64),
        Some("GIB") => round_to_u64(val * GIB_F64),
        Some("TIB") => round_to_u64(val * TIB_F64),
        _ => 0,
    }
}

fn round_to_u64(value: f64) -> u64 {
    value.round().to_u64().unwrap_or(0)
}

#[cfg(target_os = "linux")]
mod netlink {
    use base64::{engine::general_purpose, Engine as _};
    use chrono::{DateTime, Utc};
    use defguard_wireguard_rs::{Kernel, WGApi, WireguardInterfaceApi};

    use super::PeerStatus;
    use crate::error::{Error, Result};

    pub fn read_peers(interface: &str) -> Result<Vec<PeerStatus>> {
        let wgapi = WGApi::<Kernel>::new(interface.to_string()).map_err(netlink_error)?;
        let data = wgapi.read_interface_data().map_err(netlink_error)?;
        let mut peers: Vec<PeerStatus> = data
            .peers
            .iter()
            .map(|(key, p)| PeerStatus {
                public_key: general_purpose::STANDARD.encode(key.as_slice()),
                endpoint: p.endpoint.map(|e| e.to_string()),
                allowed_ips: p.allowed_ips.iter().map(ToString::to_string).collect(),
                latest_handshake: p
                    .last_handshake
                    .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
                bytes_received: p.rx_bytes,
                bytes_sent: p.tx_bytes,
            })
            .collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(peers)
    }

    fn netlink_error(e: impl std::fmt::Display) -> Error {
        Error::ExternalTool {
            command: "netlink read_interface_data".into(),
            detail: e.to_string(),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod netlink {
    use super::PeerStatus;
    use crate::error::{Error, Result};

    pub fn read_peers(_interface: &str) -> Result<Vec<PeerStatus>> {
        Err(Error::Config(
            "the netlink status backend is only available on Linux".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "interface: wg0
  public key: c2VydmVyLXB1YmxpYy1rZXktZm9yLXRlc3RzLTAwMDA=
  private key: (hidden)
  listening port: 51820

peer: YWxpY2UtcHVibGljLWtleS1mb3ItdGVzdHMtMDAwMDA=
  endpoint: 203.0.113.7:40211
  allowed ips: 10.0.0.2/32
  latest handshake: 1 minute, 12 seconds ago
  transfer: 1.50 MiB received, 312.25 KiB sent

peer: Ym9iLXB1YmxpYy1rZXktZm9yLXRlc3RzLTAwMDAwMDA=
  allowed ips: 10.0.0.3/32
";

    #[test]
    fn parses_peers_and_tolerates_missing_fields() {
        let peers = parse_wg_show(DUMP);
        assert_eq!(peers.len(), 2);

        let alice = &peers[0];
        assert_eq!(alice.endpoint.as_deref(), Some("203.0.113.7:40211"));
        assert_eq!(alice.allowed_ips, vec!["10.0.0.2/32"]);
        assert_eq!(alice.latest_handshake.as_deref(), Some("1 minute, 12 seconds ago"));
        assert_eq!(alice.bytes_received, 1_572_864);
        assert_eq!(alice.bytes_sent, 319_744);

        let bob = &peers[1];
        assert!(!bob.has_handshake());
        assert_eq!(bob.endpoint, None);
        assert_eq!(bob.total_bytes(), 0);
    }

    #[test]
    fn field_order_does_not_matter() {
        let dump = "peer: a2V5\n  transfer: 10 B received, 20 B sent\n  allowed ips: (none)\n  endpoint: 198.51.100.1:1\n";
        let peers = parse_wg_show(dump);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].total_bytes(), 30);
        assert!(peers[0].allowed_ips.is_empty());
        assert_eq!(peers[0].endpoint.as_deref(), Some("198.51.100.1:1"));
    }

    #[test]
    fn handshake_age_decides_whether_a_peer_is_online() {
        let now = Utc::now();
        let peers = parse_wg_show(DUMP);
        assert_eq!(peers[0].handshake_age(now), Some(Duration::seconds(72)));
        assert!(peers[0].is_online(now));
        assert!(!peers[1].is_online(now));

        let stale = PeerStatus {
            latest_handshake: Some("3 minutes, 1 second ago".into()),
            ..Default::default()
        };
        assert!(!stale.is_online(now));

        let stamped = PeerStatus {
            latest_handshake: Some((now - Duration::seconds(30)).to_rfc3339()),
            ..Default::default()
        };
        assert!(stamped.is_online(now));

        let garbled = PeerStatus {
            latest_handshake: Some("a while back".into()),
            ..Default::default()
        };
        assert_eq!(garbled.handshake_age(now), None);
    }

    #[test]
    fn empty_dump_has_no_peers() {
        assert!(parse_wg_show("").is_empty());
        assert!(parse_wg_show("interface: wg0\n  listening port: 51820\n").is_empty());
    }
}
