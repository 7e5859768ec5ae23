use std::{
    convert::TryFrom,
    io,
    path::{Path, PathBuf},
};

use aya::maps::{HashMap, Map, MapData, MapError, MapType};
use log::{debug, warn};

use conntrack_snapshot_common::{CtEntry, CtKey4};

use crate::error::{MapDumpError, MapOpenError};

pub const DEFAULT_MAP_ROOT: &str = "/sys/fs/bpf";
pub const DEFAULT_MAP_PREFIX: &str = "tc/globals";
pub const DEFAULT_TCP_MAX_ENTRIES: u32 = 2 << 18;
pub const DEFAULT_ANY_MAX_ENTRIES: u32 = 2 << 17;

const MAP_CT4: &str = "cilium_ct4";
const MAP_CT_ANY4: &str = "cilium_ct_any4";

/// Which instance of the conntrack tables to read.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MapScope {
    /// Node-wide tables shared by every endpoint.
    #[default]
    Global,
    /// Tables private to one endpoint.
    Endpoint(u16),
}

impl MapScope {
    fn suffix(&self) -> String {
        match self {
            MapScope::Global => "global".to_string(),
            MapScope::Endpoint(id) => format!("{id:05}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MapSetConfig {
    pub map_root: PathBuf,
    pub map_prefix: PathBuf,
    pub tcp_max_entries: u32,
    pub any_max_entries: u32,
    pub scope: MapScope,
}

impl Default for MapSetConfig {
    fn default() -> Self {
        Self {
            map_root: PathBuf::from(DEFAULT_MAP_ROOT),
            map_prefix: PathBuf::from(DEFAULT_MAP_PREFIX),
            tcp_max_entries: DEFAULT_TCP_MAX_ENTRIES,
            any_max_entries: DEFAULT_ANY_MAX_ENTRIES,
            scope: MapScope::Global,
        }
    }
}

impl MapSetConfig {
    pub fn map_dir(&self) -> PathBuf {
        self.map_root.join(&self.map_prefix)
    }
}

/// Reports whether the pinned map directory exists on this host.
pub fn bpf_maps_exist<P: AsRef<Path>, Q: AsRef<Path>>(root: P, prefix: Q) -> bool {
    root.as_ref().join(prefix).is_dir()
}

/// A conntrack table that can be opened for one dump.
pub trait CtMap {
    type Handle: CtMapHandle;

    fn path(&self) -> &Path;

    /// Opens the table. Dropping the returned handle closes it.
    fn open(&self) -> Result<Self::Handle, MapOpenError>;
}

/// An open conntrack table.
pub trait CtMapHandle {
    /// Streams every key/value pair currently stored in the table.
    fn dump_with_callback(
        &mut self,
        cb: &mut dyn FnMut(CtKey4, CtEntry),
    ) -> Result<(), MapDumpError>;
}

/// Ordered set of conntrack tables read by one snapshot.
#[derive(Debug)]
pub struct MapSet<M> {
    maps: Vec<M>,
}

impl<M: CtMap> MapSet<M> {
    pub fn new(maps: Vec<M>) -> Self {
        Self { maps }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, M> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

impl<'a, M> IntoIterator for &'a MapSet<M> {
    type Item = &'a M;
    type IntoIter = std::slice::Iter<'a, M>;

    fn into_iter(self) -> Self::IntoIter {
        self.maps.iter()
    }
}

/// Resolves the conntrack tables of this host.
///
/// Returns `None` when the pinned map directory is absent, i.e. conntrack
/// collection is not available at all. An available but empty table still
/// resolves to the full map set.
pub fn resolve(config: &MapSetConfig) -> Option<MapSet<PinnedCtMap>> {
    if !bpf_maps_exist(&config.map_root, &config.map_prefix) {
        debug!("no bpf maps under {}", config.map_dir().display());
        return None;
    }
    Some(MapSet::new(ct_maps(config)))
}

/// Builds the table set for `config`: the TCP table first, then the table for
/// every other protocol.
pub fn ct_maps(config: &MapSetConfig) -> Vec<PinnedCtMap> {
    let dir = config.map_dir();
    let suffix = config.scope.suffix();
    vec![
        PinnedCtMap::new(
            dir.join(format!("{MAP_CT4}_{suffix}")),
            config.tcp_max_entries,
        ),
        PinnedCtMap::new(
            dir.join(format!("{MAP_CT_ANY4}_{suffix}")),
            config.any_max_entries,
        ),
    ]
}

/// A conntrack table pinned on bpffs, read through aya.
#[derive(Clone, Debug)]
pub struct PinnedCtMap {
    path: PathBuf,
    max_entries: u32,
}

impl PinnedCtMap {
    pub fn new(path: PathBuf, max_entries: u32) -> Self {
        Self { path, max_entries }
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }
}

impl CtMap for PinnedCtMap {
    type Handle = PinnedCtMapHandle;

    fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Self::Handle, MapOpenError> {
        let map_data = match MapData::from_pin(&self.path) {
            Ok(map_data) => map_data,
            Err(MapError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::NotFound => {
                return Err(MapOpenError::NotFound(err.io_error));
            }
            Err(err) => return Err(MapOpenError::Other(err.into())),
        };

        let info = map_data
            .info()
            .map_err(|e| MapOpenError::Other(e.into()))?;
        if info.max_entries() != self.max_entries {
            warn!(
                "map {} holds {} entries, expected {}",
                self.path.display(),
                info.max_entries(),
                self.max_entries
            );
        }
        let map_type = info
            .map_type()
            .map_err(|e| MapOpenError::Other(e.into()))?;
        let wrap = hash_map_variant(&map_type).ok_or_else(|| {
            MapOpenError::Other(format!("unexpected map type {map_type:?}").into())
        })?;

        let map = HashMap::<_, CtKey4, CtEntry>::try_from(wrap(map_data))
            .map_err(|e| MapOpenError::Other(e.into()))?;
        debug!("opened map {}", self.path.display());

        Ok(PinnedCtMapHandle {
            path: self.path.clone(),
            map,
        })
    }
}

/// Conntrack tables are plain or LRU hash maps depending on the datapath
/// configuration; anything else is not a conntrack table.
fn hash_map_variant(map_type: &MapType) -> Option<fn(MapData) -> Map> {
    match map_type {
        MapType::Hash => Some(Map::HashMap),
        MapType::LruHash => Some(Map::LruHashMap),
        _ => None,
    }
}

pub struct PinnedCtMapHandle {
    path: PathBuf,
    map: HashMap<MapData, CtKey4, CtEntry>,
}

impl CtMapHandle for PinnedCtMapHandle {
    fn dump_with_callback(
        &mut self,
        cb: &mut dyn FnMut(CtKey4, CtEntry),
    ) -> Result<(), MapDumpError> {
        for item in self.map.iter() {
            let (key, value) = item.map_err(MapDumpError::new)?;
            cb(key, value);
        }
        Ok(())
    }
}

impl Drop for PinnedCtMapHandle {
    fn drop(&mut self) {
        debug!("closing map {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn global_scope_resolves_tcp_then_any_table() {
        let config = MapSetConfig::default();
        let maps = ct_maps(&config);
        let paths: Vec<_> = maps.iter().map(|m| m.path().to_path_buf()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/sys/fs/bpf/tc/globals/cilium_ct4_global"),
                PathBuf::from("/sys/fs/bpf/tc/globals/cilium_ct_any4_global"),
            ]
        );
        assert_eq!(maps[0].max_entries(), 524_288);
        assert_eq!(maps[1].max_entries(), 262_144);
    }

    #[test]
    fn endpoint_scope_uses_padded_endpoint_id() {
        let config = MapSetConfig {
            map_root: PathBuf::from("/run/bpf"),
            map_prefix: PathBuf::from("maps"),
            tcp_max_entries: 1024,
            any_max_entries: 512,
            scope: MapScope::Endpoint(42),
        };
        let maps = ct_maps(&config);
        assert_eq!(maps[0].path(), Path::new("/run/bpf/maps/cilium_ct4_00042"));
        assert_eq!(maps[1].path(), Path::new("/run/bpf/maps/cilium_ct_any4_00042"));
        assert_eq!(maps[0].max_entries(), 1024);
        assert_eq!(maps[1].max_entries(), 512);
    }

    #[test]
    fn resolve_reports_missing_subsystem() {
        let root = tempfile::tempdir().unwrap();
        let config = MapSetConfig {
            map_root: root.path().to_path_buf(),
            ..Default::default()
        };
        assert!(!bpf_maps_exist(root.path(), DEFAULT_MAP_PREFIX));
        assert!(resolve(&config).is_none());
    }

    #[test]
    fn resolve_returns_full_set_when_directory_exists() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(DEFAULT_MAP_PREFIX)).unwrap();
        let config = MapSetConfig {
            map_root: root.path().to_path_buf(),
            ..Default::default()
        };
        assert!(bpf_maps_exist(root.path(), DEFAULT_MAP_PREFIX));
        let set = resolve(&config).expect("maps should resolve");
        let paths: Vec<_> = set.iter().map(|m| m.path().to_path_buf()).collect();
        assert_eq!(
            paths,
            vec![
                root.path().join(DEFAULT_MAP_PREFIX).join("cilium_ct4_global"),
                root.path().join(DEFAULT_MAP_PREFIX).join("cilium_ct_any4_global"),
            ]
        );
    }

    #[test]
    fn presence_check_wants_a_directory() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("tc")).unwrap();
        fs::write(root.path().join(DEFAULT_MAP_PREFIX), b"").unwrap();
        assert!(!bpf_maps_exist(root.path(), DEFAULT_MAP_PREFIX));
    }

    #[test]
    fn only_hash_tables_are_accepted() {
        assert!(hash_map_variant(&MapType::Hash).is_some());
        assert!(hash_map_variant(&MapType::LruHash).is_some());
        assert!(hash_map_variant(&MapType::PerCpuHash).is_none());
        assert!(hash_map_variant(&MapType::Array).is_none());
    }
}
