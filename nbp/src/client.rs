//! Storage control-plane client interface.

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

use anyhow::Result;
use log::warn;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::{Deserialize, Serialize};

use crate::iscsi::initiators;

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub description: String,
    /// size in GB
    pub size: i64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostInfo {
    pub host: String,
    pub ip: String,
    pub platform: String,
    pub initiator: String,
}

impl HostInfo {
    /// Describes the local host: hostname, the first usable interface address
    /// (falling back to loopback) and the first configured initiator name.
    pub fn detect<P: AsRef<Path>>(initiator_file: P) -> Self {
        let host = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        HostInfo {
            host,
            ip: local_ip(),
            platform: std::env::consts::ARCH.to_string(),
            initiator: initiators(initiator_file)
                .into_iter()
                .next()
                .unwrap_or_default(),
        }
    }
}

fn local_ip() -> String {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("failed to list interface addresses: {}", e);
            return "127.0.0.1".to_string();
        }
    };

    let candidates = addrs
        .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
        .filter_map(|ifa| {
            let addr = ifa.address?;
            if let Some(sin) = addr.as_sockaddr_in() {
                Some(IpAddr::V4(*SocketAddrV4::from(*sin).ip()))
            } else {
                addr.as_sockaddr_in6()
                    .map(|sin6| IpAddr::V6(*SocketAddrV6::from(*sin6).ip()))
            }
        });

    pick_host_ip(candidates)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// First address usable by peers, IPv4 before IPv6. Loopback, unspecified
/// and IPv6 link-local addresses are skipped.
pub(crate) fn pick_host_ip<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Option<IpAddr> {
    let mut v6 = None;
    for ip in addrs {
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        match ip {
            IpAddr::V4(_) => return Some(ip),
            IpAddr::V6(v) if (v.segments()[0] & 0xffc0) == 0xfe80 => {}
            IpAddr::V6(_) => {
                v6.get_or_insert(ip);
            }
        }
    }
    v6
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use anyhow::Result;

    use super::*;
    use crate::ConnectionDescriptor;

    #[test]
    fn test_detect_host_info() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"InitiatorName=iqn.1993-08.org.debian:01:host1\n")?;

        let info = HostInfo::detect(file.path());
        assert_eq!(info.initiator, "iqn.1993-08.org.debian:01:host1");
        assert!(!info.ip.is_empty());
        assert!(!info.platform.is_empty());

        let info = HostInfo::detect("/nonexistent/initiatorname.iscsi");
        assert!(info.initiator.is_empty());
        Ok(())
    }

    #[test]
    fn test_pick_host_ip() {
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();

        let addrs = vec![ip("127.0.0.1"), ip("::1"), ip("192.168.10.7"), ip("10.0.0.5")];
        assert_eq!(pick_host_ip(addrs), Some(ip("192.168.10.7")));

        let addrs = vec![ip("fe80::1"), ip("2001:db8::7"), ip("172.16.0.9")];
        assert_eq!(pick_host_ip(addrs), Some(ip("172.16.0.9")));

        let addrs = vec![ip("::1"), ip("fe80::1"), ip("2001:db8::7")];
        assert_eq!(pick_host_ip(addrs), Some(ip("2001:db8::7")));

        let addrs = vec![ip("127.0.0.1"), ip("0.0.0.0"), ip("::1")];
        assert_eq!(pick_host_ip(addrs), None);
    }

    #[test]
    fn test_connection_info_to_descriptor() -> Result<()> {
        let info: ConnectionInfo = serde_json::from_str(
            r#"{
                "driverVolumeType": "iscsi",
                "data": {
                    "targetDiscovered": true,
                    "targetIqn": "iqn.2017-01.demo:vol1",
                    "targetPortal": "10.0.0.1:3260",
                    "targetLun": 1,
                    "volumeId": "bd5b12a8-a101-11e7-941e-d77981b584d8"
                }
            }"#,
        )?;
        assert_eq!(info.driver_volume_type, "iscsi");

        let desc = ConnectionDescriptor::from_json(serde_json::Value::Object(info.data))?;
        assert_eq!(desc.target_iqn, "iqn.2017-01.demo:vol1");
        assert_eq!(desc.target_lun, 1);
        assert!(!desc.has_auth());
        Ok(())
    }
}
