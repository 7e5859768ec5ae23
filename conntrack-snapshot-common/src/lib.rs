#![no_std]

// Raw layouts of the datapath conntrack maps (`ipv4_ct_tuple` / `ct_entry`).
// Keep this crate `no_std` friendly so the layouts can be shared with eBPF code.

/// Key of the IPv4 conntrack tables, in kernel field order.
///
/// Addresses are network-order octets and ports are stored in network byte
/// order. The datapath records the tuple with source and destination
/// inverted; readers have to swap the endpoints back.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CtKey4 {
    pub dest_addr: [u8; 4],
    pub source_addr: [u8; 4],
    pub dest_port: u16,
    pub source_port: u16,
    pub next_header: u8,
    pub flags: u8,
}

impl CtKey4 {
    /// Destination port in host byte order.
    pub fn dest_port(&self) -> u16 {
        u16::from_be(self.dest_port)
    }

    /// Source port in host byte order.
    pub fn source_port(&self) -> u16 {
        u16::from_be(self.source_port)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CtEntry {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Expiry, in seconds of the kernel monotonic clock.
    pub lifetime: u32,
    pub flags: u16,
    pub rev_nat_index: u16,
    pub ifindex: u16,
    pub tx_flags_seen: u8,
    pub rx_flags_seen: u8,
    pub src_sec_id: u32,
    pub last_tx_report: u32,
    pub last_rx_report: u32,
}

pub const CT_KEY4_SIZE: usize = 14;
pub const CT_ENTRY_SIZE: usize = 56;

const _: () = assert!(core::mem::size_of::<CtKey4>() == CT_KEY4_SIZE);
const _: () = assert!(core::mem::size_of::<CtEntry>() == CT_ENTRY_SIZE);

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{CtEntry, CtKey4};
    use aya::Pod;

    unsafe impl Pod for CtKey4 {}
    unsafe impl Pod for CtEntry {}
}
