use chrono::{DateTime, Utc};
use log::debug;

use conntrack_snapshot_common::{CtEntry, CtKey4};

use crate::{
    clock::Clock,
    decode::decode,
    error::{MapOpenError, SnapshotError},
    maps::{CtMap, CtMapHandle, MapSet},
    metrics::MetricsSink,
    model::Entry,
};

/// Result of one pass over the conntrack tables.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Entries accepted by the filter, in map order then dump order.
    pub entries: Vec<Entry>,
    /// Raw pairs visited across all maps, including empty slots and
    /// filtered-out entries.
    pub scanned: u64,
}

/// Reads every map of `maps` and returns the entries accepted by `filter`.
///
/// Both clocks are sampled once so that lifetimes from different maps share
/// the same reference. Any clock, open or dump failure aborts the whole
/// snapshot and no entries are returned. Each map is closed as soon as its
/// own dump ends.
pub fn list_entries<M, F, C, S>(
    maps: &MapSet<M>,
    filter: F,
    clock: C,
    metrics: S,
) -> Result<Snapshot, SnapshotError>
where
    M: CtMap,
    F: Fn(&Entry) -> bool,
    C: Clock,
    S: MetricsSink,
{
    let observed_at = clock.wall_now();
    let now_mono = clock.monotonic_seconds().map_err(SnapshotError::Clock)?;

    let mut snapshot = Snapshot::default();
    for map in maps {
        scan_map(map, &filter, observed_at, now_mono, &mut snapshot)?;
    }

    metrics.set_conntrack_entries_count(snapshot.scanned);
    debug!(
        "conntrack snapshot: {} entries kept, {} scanned",
        snapshot.entries.len(),
        snapshot.scanned
    );
    Ok(snapshot)
}

fn scan_map<M, F>(
    map: &M,
    filter: &F,
    observed_at: DateTime<Utc>,
    now_mono: u32,
    snapshot: &mut Snapshot,
) -> Result<(), SnapshotError>
where
    M: CtMap,
    F: Fn(&Entry) -> bool,
{
    let path = map.path();
    let mut handle = map.open().map_err(|err| match err {
        MapOpenError::NotFound(source) => SnapshotError::MapMissing {
            path: path.to_path_buf(),
            source,
        },
        MapOpenError::Other(source) => SnapshotError::MapOpen {
            path: path.to_path_buf(),
            source,
        },
    })?;

    let Snapshot { entries, scanned } = snapshot;
    let mut cb = |key: CtKey4, value: CtEntry| {
        *scanned += 1;
        if key_is_empty(&key) {
            return;
        }
        let entry = decode(&key, &value, observed_at, now_mono);
        if filter(&entry) {
            entries.push(entry);
        }
    };
    handle
        .dump_with_callback(&mut cb)
        .map_err(|source| SnapshotError::Dump {
            path: path.to_path_buf(),
            source,
        })
}

fn key_is_empty(key: &CtKey4) -> bool {
    key.next_header == 0
}
