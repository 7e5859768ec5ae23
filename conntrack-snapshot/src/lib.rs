//! Point-in-time snapshots of the datapath conntrack tables.
//!
//! [`maps::resolve`] finds the pinned tables of the host,
//! [`snapshot::list_entries`] reads them and [`decode::decode`] turns each raw
//! pair into an [`Entry`].

pub mod clock;
pub mod decode;
pub mod error;
pub mod maps;
pub mod metrics;
pub mod model;
pub mod snapshot;

pub use clock::{Clock, SystemClock};
pub use error::SnapshotError;
pub use maps::{MapScope, MapSet, MapSetConfig, resolve};
pub use metrics::{Gauge, LogMetrics, MetricsSink};
pub use model::{AddressList, Entry, EntryFilter};
pub use snapshot::{Snapshot, list_entries};
