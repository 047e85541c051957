//! Wire format of the companion device's broadcast announcement.
//!
//! ```json
//! {"type": "PAIRLINK_ANNOUNCE", "ip": "192.168.1.23", "port": 9000, "name": "Pixel 8"}
//! ```
//!
//! Anything else on the discovery port (other tags, missing fields, an
//! unparseable address) is not an announcement and yields `None`.

use std::net::IpAddr;

use pairlink_core::PeerEndpoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "type")]
    pub tag: String,
    pub ip: String,
    pub port: u16,
    pub name: String,
}

impl Announcement {
    pub fn new(tag: &str, ip: IpAddr, port: u16, name: &str) -> Self {
        Self { tag: tag.to_owned(), ip: ip.to_string(), port, name: name.to_owned() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain struct of strings and integers; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Parse one datagram into a peer, or `None` if it is not a valid
/// announcement carrying `expected_tag`.
pub fn parse_announcement(datagram: &[u8], expected_tag: &str) -> Option<PeerEndpoint> {
    let ann: Announcement = serde_json::from_slice(datagram).ok()?;
    if ann.tag != expected_tag || ann.port == 0 {
        return None;
    }
    let address: IpAddr = ann.ip.trim().parse().ok()?;
    Some(PeerEndpoint::new(address, ann.port, ann.name))
}
