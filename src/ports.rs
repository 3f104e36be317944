//! Port allocator: one base port plus a fixed offset table.

use crate::error::Error;
use crate::settings::{SettingsMap, SettingsStore};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_PORT: u16 = 63000;
pub const SUGGEST_START: u16 = 50000;
pub const SUGGEST_ATTEMPTS: u32 = 100;
pub const SUGGEST_STEP: u16 = 100;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const MIN_BASE_PORT: u32 = 1024;

/// Port variable -> offset from the base port. Compose files and external
/// tooling read these names; offsets must stay stable and distinct.
pub const PORT_OFFSETS: &[(&str, u16)] = &[
    ("SUPABASE_DB_PORT", 0),
    ("REDIS_PORT", 1),
    ("KONG_HTTP_PORT", 2),
    ("KONG_HTTPS_PORT", 3),
    ("SUPABASE_META_PORT", 4),
    ("SUPABASE_STORAGE_PORT", 5),
    ("SUPABASE_AUTH_PORT", 6),
    ("SUPABASE_API_PORT", 7),
    ("SUPABASE_REALTIME_PORT", 8),
    ("SUPABASE_STUDIO_PORT", 9),
    ("GRAPH_DB_PORT", 10),
    ("GRAPH_DB_DASHBOARD_PORT", 11),
    ("LLM_PROVIDER_PORT", 12),
    ("LOCAL_DEEP_RESEARCHER_PORT", 13),
    ("SEARXNG_PORT", 14),
    ("OPEN_WEB_UI_PORT", 15),
    ("BACKEND_PORT", 16),
    ("N8N_PORT", 17),
    ("COMFYUI_PORT", 18),
    ("WEAVIATE_PORT", 19),
    ("WEAVIATE_GRPC_PORT", 20),
    ("DOC_PROCESSOR_PORT", 21),
    ("STT_PROVIDER_PORT", 22),
    ("TTS_PROVIDER_PORT", 23),
    // add-on, kept clear of the core block
    ("JUPYTERHUB_PORT", 48),
];

pub fn max_offset() -> u16 {
    PORT_OFFSETS.iter().map(|(_, o)| *o).max().unwrap_or(0)
}

/// Highest base that still fits every offset under 65535.
pub fn max_base() -> u32 {
    u32::from(u16::MAX) - u32::from(max_offset())
}

pub fn is_valid_base(base: u32) -> bool {
    (MIN_BASE_PORT..=max_base()).contains(&base)
}

pub fn validate_base(base: u32) -> Result<u16, Error> {
    if !is_valid_base(base) {
        return Err(Error::InvalidBasePort {
            base,
            max: max_base(),
        });
    }
    // in range, so it fits
    Ok(base as u16)
}

/// `{variable -> base + offset}` over the whole table.
pub fn compute(base: u16) -> BTreeMap<String, u16> {
    PORT_OFFSETS
        .iter()
        .map(|(var, offset)| (var.to_string(), base.saturating_add(*offset)))
        .collect()
}

/// Local availability check.
pub trait PortProbe {
    fn in_use(&self, port: u16) -> bool;
}

/// Short-timeout connect to the loopback address. A successful connect means
/// something is listening; any error counts as available.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl PortProbe for TcpProbe {
    fn in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(_) => true,
            Err(err) => {
                debug!("port {} probe: {}", port, err);
                false
            }
        }
    }
}

pub struct PortAllocator<P: PortProbe> {
    probe: P,
}

impl PortAllocator<TcpProbe> {
    pub fn tcp() -> Self {
        Self::new(TcpProbe::default())
    }
}

impl<P: PortProbe> PortAllocator<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self, port: u16) -> bool {
        !self.probe.in_use(port)
    }

    /// Ports of `base` that are already taken.
    pub fn conflicts(&self, base: u16) -> BTreeMap<String, u16> {
        compute(base)
            .into_iter()
            .filter(|(_, port)| self.probe.in_use(*port))
            .collect()
    }

    /// First base from `start`, stepping by `step`, whose whole range is free.
    /// Invalid candidates are skipped, not counted as conflicts.
    pub fn suggest(&self, start: u16, max_attempts: u32, step: u16) -> Option<u16> {
        let step = u32::from(step.max(1));
        for attempt in 0..max_attempts {
            let candidate = u32::from(start) + attempt * step;
            if candidate > u32::from(u16::MAX) {
                break;
            }
            if !is_valid_base(candidate) {
                continue;
            }
            let candidate = candidate as u16;
            if self.conflicts(candidate).is_empty() {
                debug!("base {} is free after {} attempt(s)", candidate, attempt + 1);
                return Some(candidate);
            }
        }
        warn!(
            "no free base port found in {} attempt(s) from {}",
            max_attempts, start
        );
        None
    }

    /// Validate `base` and make sure every derived port is free. On conflict
    /// the error carries an alternate base when one can be found.
    pub fn check(&self, base: u32) -> Result<u16, Error> {
        let base = validate_base(base)?;
        let conflicts = self.conflicts(base);
        if conflicts.is_empty() {
            return Ok(base);
        }
        let suggestion = self.suggest(SUGGEST_START, SUGGEST_ATTEMPTS, SUGGEST_STEP);
        Err(Error::PortConflict {
            base,
            conflicts,
            suggestion,
        })
    }
}

/// Persist `compute(base)` in one rewrite of the settings file.
pub fn update_env_ports(
    store: &dyn SettingsStore,
    base: u16,
    backup: bool,
) -> Result<BTreeMap<String, u16>, Error> {
    let ports = compute(base);
    let values: SettingsMap = ports
        .iter()
        .map(|(var, port)| (var.clone(), port.to_string()))
        .chain(std::iter::once(("BASE_PORT".to_string(), base.to_string())))
        .collect();
    store.upsert_many(&values, backup)?;
    info!("assigned {} port(s) from base {}", ports.len(), base);
    Ok(ports)
}

/// Stored value of every port variable, as read back from the store.
pub fn assignment_report(store: &dyn SettingsStore) -> Result<Vec<(String, Option<String>)>, Error> {
    let settings = store.read_all()?;
    Ok(PORT_OFFSETS
        .iter()
        .map(|(var, _)| (var.to_string(), settings.get(*var).cloned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EnvFile;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::fs;
    use std::net::TcpListener;

    /// Probe backed by a fixed set of busy ports.
    struct Busy(BTreeSet<u16>);

    impl PortProbe for Busy {
        fn in_use(&self, port: u16) -> bool {
            self.0.contains(&port)
        }
    }

    #[test]
    fn base_63000_maps_first_offsets_exactly() {
        let ports = compute(63000);
        assert_eq!(ports["SUPABASE_DB_PORT"], 63000);
        assert_eq!(ports["REDIS_PORT"], 63001);
        assert_eq!(ports["KONG_HTTP_PORT"], 63002);
        assert_eq!(ports["JUPYTERHUB_PORT"], 63048);
    }

    #[test]
    fn offsets_are_distinct() {
        let offsets: BTreeSet<u16> = PORT_OFFSETS.iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets.len(), PORT_OFFSETS.len());
    }

    #[test]
    fn base_range_is_enforced() {
        assert!(validate_base(1023).is_err());
        assert_eq!(validate_base(1024).expect("low edge"), 1024);
        assert_eq!(validate_base(65535 - 48).expect("high edge"), 65487);
        assert!(matches!(
            validate_base(65535 - 47),
            Err(Error::InvalidBasePort { max: 65487, .. })
        ));
    }

    #[test]
    fn conflict_is_reported_and_next_free_base_suggested() {
        let allocator = PortAllocator::new(Busy([63005, 50010].into_iter().collect()));
        let conflicts = allocator.conflicts(63000);
        assert_eq!(
            conflicts,
            [("SUPABASE_STORAGE_PORT".to_string(), 63005)].into_iter().collect()
        );
        // 50000 covers 50010, 50100 is clear
        assert_eq!(allocator.suggest(50000, 100, 100), Some(50100));

        match allocator.check(63000) {
            Err(Error::PortConflict {
                base, suggestion, ..
            }) => {
                assert_eq!(base, 63000);
                assert_eq!(suggestion, Some(50100));
            }
            other => panic!("expected PortConflict, got {:?}", other),
        }
    }

    #[test]
    fn suggest_skips_invalid_candidates() {
        let allocator = PortAllocator::new(Busy(BTreeSet::new()));
        assert_eq!(allocator.suggest(1000, 10, 10), Some(1030));
        assert_eq!(allocator.suggest(65500, 5, 10), None);
    }

    #[test]
    fn tcp_probe_sees_a_bound_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let allocator = PortAllocator::tcp();
        assert!(!allocator.probe(port));
        drop(listener);
    }

    #[test]
    fn update_env_ports_rewrites_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".env");
        fs::write(&path, "# ports\nREDIS_PORT=1\n").expect("write");
        let store = EnvFile::new(&path);

        update_env_ports(&store, 63000, false).expect("update");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.starts_with("# ports\nREDIS_PORT=63001\n"), "{}", text);

        let report = assignment_report(&store).expect("report");
        assert_eq!(report.len(), PORT_OFFSETS.len());
        assert!(report.iter().all(|(_, value)| value.is_some()));
        assert_eq!(
            store.read_all().expect("read").get("BASE_PORT").map(String::as_str),
            Some("63000")
        );
    }

    proptest! {
        #[test]
        fn computed_ports_are_distinct_and_in_range(base in 1024u16..=65487) {
            let ports = compute(base);
            let distinct: BTreeSet<u16> = ports.values().copied().collect();
            prop_assert_eq!(distinct.len(), PORT_OFFSETS.len());
            for (var, offset) in PORT_OFFSETS {
                prop_assert_eq!(ports[*var], base + offset);
            }
        }
    }
}
