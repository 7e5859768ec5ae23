use std::net::{Ipv4Addr, SocketAddrV4};

use chrono::{DateTime, TimeDelta, Utc};

use conntrack_snapshot_common::{CtEntry, CtKey4};

use crate::model::Entry;

/// Converts one raw conntrack pair into an [`Entry`].
///
/// The datapath stores the tuple with its endpoints inverted, so the key's
/// destination becomes `src` and its source becomes `dst`. The kernel
/// lifetime is relative to the monotonic clock; it is rebased on
/// `observed_at` with signed arithmetic, so a lifetime behind `now_mono`
/// yields an instant in the past.
pub fn decode(key: &CtKey4, value: &CtEntry, observed_at: DateTime<Utc>, now_mono: u32) -> Entry {
    let src = SocketAddrV4::new(Ipv4Addr::from(key.dest_addr), key.dest_port());
    let dst = SocketAddrV4::new(Ipv4Addr::from(key.source_addr), key.source_port());

    Entry {
        src,
        dst,
        tx_bytes: value.tx_bytes,
        tx_packets: value.tx_packets,
        rx_bytes: value.rx_bytes,
        rx_packets: value.rx_packets,
        lifetime: expiry(observed_at, value.lifetime, now_mono),
        proto: key.next_header,
    }
}

fn expiry(observed_at: DateTime<Utc>, lifetime: u32, now_mono: u32) -> DateTime<Utc> {
    let expire_seconds = i64::from(lifetime) - i64::from(now_mono);
    observed_at + TimeDelta::seconds(expire_seconds)
}
