use std::{
    collections::BTreeSet,
    fs::File,
    io::{BufRead, BufReader},
    net::{IpAddr, Ipv4Addr, SocketAddrV4},
    path::Path,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One conntrack flow as seen at snapshot time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Entry {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    /// Instant at which the kernel expects to expire the flow. May be in the past.
    pub lifetime: DateTime<Utc>,
    pub proto: u8,
}

impl Entry {
    pub fn is_expired(&self, at: DateTime<Utc>) -> bool {
        self.lifetime <= at
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} proto:{} tx: {}B/{}p rx: {}B/{}p expires: {}",
            self.src,
            self.dst,
            self.proto,
            self.tx_bytes,
            self.tx_packets,
            self.rx_bytes,
            self.rx_packets,
            self.lifetime.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Composable entry predicate used by the agent.
///
/// An empty filter accepts every entry. Protocols, addresses and expiry are
/// combined with a logical AND.
#[derive(Clone, Default)]
pub struct EntryFilter {
    protocols: BTreeSet<u8>,
    addresses: Option<AddressList>,
    exclude_expired_at: Option<DateTime<Utc>>,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocols<I>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = u8>,
    {
        self.protocols.extend(protocols);
        self
    }

    /// Keep only entries with at least one endpoint inside `list`.
    pub fn with_addresses(mut self, list: AddressList) -> Self {
        if !list.is_empty() {
            self.addresses = Some(list);
        }
        self
    }

    /// Drop entries whose lifetime is not after `at`.
    pub fn excluding_expired_at(mut self, at: DateTime<Utc>) -> Self {
        self.exclude_expired_at = Some(at);
        self
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        if !self.protocols.is_empty() && !self.protocols.contains(&entry.proto) {
            return false;
        }
        if let Some(list) = &self.addresses {
            if !list.contains(entry.src.ip()) && !list.contains(entry.dst.ip()) {
                return false;
            }
        }
        if let Some(at) = self.exclude_expired_at {
            if entry.is_expired(at) {
                return false;
            }
        }
        true
    }
}

/// IPv4 networks an entry endpoint must fall into.
///
/// Conntrack snapshots only cover the IPv4 tables, so IPv6 networks are
/// rejected at parse time instead of silently never matching.
#[derive(Clone, Debug, Default)]
pub struct AddressList {
    networks: Vec<Ipv4Net>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Ipv4Net {
    network: u32,
    mask: u32,
}

impl Ipv4Net {
    fn new(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        let mask = match prefix {
            0 => 0,
            1..=32 => u32::MAX << (32 - u32::from(prefix)),
            _ => return None,
        };
        Some(Self {
            network: u32::from(addr) & mask,
            mask,
        })
    }

    fn contains(&self, addr: Ipv4Addr) -> bool {
        (u32::from(addr) & self.mask) == self.network
    }
}

impl AddressList {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_option(path: Option<&Path>, label: &str) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path, label),
            None => Ok(Self::empty()),
        }
    }

    fn from_path(path: &Path, label: &str) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {label} at {}", path.display()))?;
        Self::from_reader(BufReader::new(file), &path.display().to_string(), label)
    }

    /// Parses one `addr/prefix` per line. `#` starts a comment.
    pub fn from_reader<R: BufRead>(reader: R, origin: &str, label: &str) -> Result<Self> {
        let mut networks = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line
                .with_context(|| format!("failed to read line {line_no} of {origin} ({label})"))?;
            let cidr = line.split('#').next().unwrap_or("").trim();
            if cidr.is_empty() {
                continue;
            }
            let net = parse_cidr(cidr)
                .with_context(|| format!("line {line_no} of {origin} ({label})"))?;
            networks.push(net);
        }
        Ok(Self { networks })
    }

    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.networks.iter().any(|net| net.contains(*addr))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| anyhow!("'{cidr}' must be CIDR notation (addr/prefix)"))?;
    let (addr, prefix) = (addr.trim(), prefix.trim());
    let addr = match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => addr,
        Ok(IpAddr::V6(_)) => bail!("'{cidr}' is an IPv6 network; conntrack entries are IPv4"),
        Err(err) => return Err(err).with_context(|| format!("invalid IP address '{addr}'")),
    };
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("invalid prefix '{prefix}'"))?;
    Ipv4Net::new(addr, prefix).ok_or_else(|| anyhow!("prefix {prefix} exceeds IPv4 width"))
}
