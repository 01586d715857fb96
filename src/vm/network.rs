//! Network identity: name-derived MAC addresses and IP discovery.
//!
//! A VM's MAC is a pure function of its name, so re-creating a VM under the
//! same name yields the same MAC and, in practice, the same DHCP lease from
//! the framework's NAT. The IP itself is never stored; [`discover_ip`] scans
//! the host neighbor table on demand.
//!
//! ## Neighbor table sources
//!
//! - macOS: `arp -an`, whose lines look like
//!   `? (192.168.64.3) at 5e:c3:7:6c:2c:b1 on bridge100 ifscope [ethernet]`
//!   (note the unpadded octet `7`).
//! - Linux: `/proc/net/arp`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::VmError;

// ---------------------------------------------------------------------------
// MAC addresses
// ---------------------------------------------------------------------------

/// Locally-administered bit of the first octet.
const LOCAL_BIT: u8 = 0b0000_0010;
/// Multicast (group) bit of the first octet.
const MULTICAST_BIT: u8 = 0b0000_0001;

/// An EUI-48 address, printed as lowercase colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(MacAddr6);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        let [a, b, c, d, e, f] = octets;
        Self(MacAddr6::new(a, b, c, d, e, f))
    }

    pub fn octets(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out.copy_from_slice(self.0.as_bytes());
        out
    }

    pub fn is_locally_administered(&self) -> bool {
        self.octets()[0] & LOCAL_BIT != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.octets()[0] & MULTICAST_BIT == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct MacParseError(String);

impl FromStr for MacAddress {
    type Err = MacParseError;

    /// Accepts `:` or `-` separators and one- or two-digit octets, so both
    /// `5e:c3:07:6c:2c:b1` and BSD `arp` output `5e:c3:7:6c:2c:b1` parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || MacParseError(s.to_owned());
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');
        for slot in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.is_empty() || part.len() > 2 {
                return Err(err());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self::new(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Derive the stable MAC for a VM name.
///
/// The first octet is only the forced bits: locally administered, unicast.
/// The first five bytes of the name's SHA-256 digest fill the other five.
pub fn derive_mac(name: &str) -> MacAddress {
    let digest = Sha256::digest(name.as_bytes());
    let mut octets = [LOCAL_BIT & !MULTICAST_BIT, 0, 0, 0, 0, 0];
    octets[1..].copy_from_slice(&digest[..5]);
    MacAddress::new(octets)
}

// ---------------------------------------------------------------------------
// Neighbor table
// ---------------------------------------------------------------------------

/// One resolved link-layer to network-layer mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub mac: MacAddress,
    pub ip: IpAddr,
}

/// Read-only view of the host's neighbor table.
///
/// Implementations must re-read the table on every call; discovery never
/// caches a previous answer.
pub trait NeighborTable: Send + Sync {
    fn list_neighbor_entries(&self) -> Result<Vec<NeighborEntry>, VmError>;
}

/// `arp -an` (macOS/BSD).
#[derive(Debug, Default, Clone, Copy)]
pub struct ArpCommand;

impl NeighborTable for ArpCommand {
    fn list_neighbor_entries(&self) -> Result<Vec<NeighborEntry>, VmError> {
        let output = std::process::Command::new("arp")
            .arg("-an")
            .output()
            .map_err(|e| VmError::NeighborTable(format!("spawn `arp -an`: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::NeighborTable(format!(
                "`arp -an` failed (exit {}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_arp_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// `/proc/net/arp` (Linux).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcNetArp;

impl NeighborTable for ProcNetArp {
    fn list_neighbor_entries(&self) -> Result<Vec<NeighborEntry>, VmError> {
        let text = std::fs::read_to_string("/proc/net/arp")
            .map_err(|e| VmError::NeighborTable(format!("read /proc/net/arp: {e}")))?;
        Ok(parse_proc_net_arp(&text))
    }
}

/// The neighbor table reader for the current platform.
pub fn host_neighbor_table() -> Arc<dyn NeighborTable> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcNetArp)
    } else {
        Arc::new(ArpCommand)
    }
}

/// Parse `arp -an` output. Incomplete and malformed lines are skipped.
pub fn parse_arp_output(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            // "?" "(ip)" "at" "mac" ...
            let ip_field = fields.nth(1)?;
            let ip = ip_field
                .strip_prefix('(')?
                .strip_suffix(')')?
                .parse::<IpAddr>()
                .ok()?;
            if fields.next()? != "at" {
                return None;
            }
            let mac = fields.next()?.parse::<MacAddress>().ok()?;
            Some(NeighborEntry { mac, ip })
        })
        .collect()
}

/// Parse `/proc/net/arp`. Entries with flags `0x0` are incomplete.
pub fn parse_proc_net_arp(text: &str) -> Vec<NeighborEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[2] == "0x0" {
                return None;
            }
            let ip = fields[0].parse::<IpAddr>().ok()?;
            let mac = fields[3].parse::<MacAddress>().ok()?;
            Some(NeighborEntry { mac, ip })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Poll the neighbor table until an entry for `mac` appears.
///
/// Returns `Ok(None)` once `timeout` has elapsed without a match; that is
/// the "not yet leased" answer, not an error. The final scan happens at the
/// deadline, so a miss never returns earlier than `timeout`.
pub async fn discover_ip(
    table: Arc<dyn NeighborTable>,
    mac: MacAddress,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<IpAddr>, VmError> {
    let deadline = Instant::now() + timeout;
    let mut scans = 0u32;

    loop {
        let table = Arc::clone(&table);
        let entries = tokio::task::spawn_blocking(move || table.list_neighbor_entries())
            .await
            .map_err(|e| VmError::NeighborTable(format!("neighbor scan task failed: {e}")))??;
        scans += 1;

        if let Some(entry) = entries.into_iter().find(|entry| entry.mac == mac) {
            info!(mac = %mac, ip = %entry.ip, scans, "Discovered VM address");
            return Ok(Some(entry.ip));
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(mac = %mac, scans, "No neighbor entry before deadline");
            return Ok(None);
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
