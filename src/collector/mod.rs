//! Collecting BGP configuration from routers.
//!
//! The collector connects to every device in the inventory, retrieves the
//! raw `protocols bgp` stanza, and couples it with the parsed group
//! structure into a [`RouterProfile`]. One device failing never cancels
//! the others; each device’s outcome is its own [`CollectionResult`].

pub mod ssh;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Instant;
use crossbeam_queue::SegQueue;
use crossbeam_utils::thread;
use log::{error, info, warn};
use crate::asn::Asn;
use crate::config::Config;
use crate::error::Failed;
use crate::inspector;
use crate::inspector::BgpGroup;
use crate::utils::sync::{Cancel, Mutex};
use self::ssh::SshCommand;


//------------ DeviceInfo ----------------------------------------------------

/// A single row of the device inventory.
#[derive(Clone, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
pub struct DeviceInfo {
    /// The address to connect to. Unique within a run.
    pub address: String,

    /// The host name. Synthesized from the address if absent.
    pub hostname: String,

    /// Free-form role of the device.
    pub role: Option<String>,

    /// Free-form region of the device.
    pub region: Option<String>,

    /// The SSH port.
    pub port: u16,
}

impl DeviceInfo {
    /// Creates a device from just an address.
    pub fn from_address(address: &str) -> Self {
        DeviceInfo {
            address: address.into(),
            hostname: hostname_from_address(address),
            role: None,
            region: None,
            port: 22,
        }
    }
}

/// Synthesizes a host name from an address.
fn hostname_from_address(address: &str) -> String {
    address.replace('.', "-").replace(':', "-")
}


//------------ load_devices --------------------------------------------------

/// Loads the device inventory from a CSV file.
///
/// The file has the columns `address,hostname,role,region`; additional
/// columns are ignored. Only `address` is required. Rows with a duplicate
/// address are rejected.
pub fn load_devices(path: &Path) -> Result<Vec<DeviceInfo>, Failed> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|err| {
            error!(
                "Failed to open device inventory {}: {}",
                path.display(), err
            );
            Failed
        })?;

    let headers = reader.headers().map_err(|err| {
        error!(
            "Failed to read device inventory {}: {}",
            path.display(), err
        );
        Failed
    })?.clone();
    let column = |name: &str| {
        headers.iter().position(|header| header.trim() == name)
    };
    let address_col = match column("address") {
        Some(col) => col,
        None => {
            error!(
                "Device inventory {} lacks an 'address' column.",
                path.display()
            );
            return Err(Failed)
        }
    };
    let hostname_col = column("hostname");
    let role_col = column("role");
    let region_col = column("region");

    let mut res = Vec::new();
    let mut seen = BTreeSet::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|err| {
            error!(
                "Failed to read device inventory {}: {}",
                path.display(), err
            );
            Failed
        })?;
        let field = |col: Option<usize>| {
            col.and_then(|col| record.get(col))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let address = match field(Some(address_col)) {
            Some(address) => address.to_string(),
            None => {
                warn!(
                    "Device inventory {} row {}: empty address. Skipping.",
                    path.display(), index + 2
                );
                continue
            }
        };
        if !seen.insert(address.clone()) {
            error!(
                "Device inventory {} row {}: duplicate address '{}'.",
                path.display(), index + 2, address
            );
            return Err(Failed)
        }
        res.push(DeviceInfo {
            hostname: field(hostname_col)
                .map(Into::into)
                .unwrap_or_else(|| hostname_from_address(&address)),
            role: field(role_col).map(Into::into),
            region: field(region_col).map(Into::into),
            port: 22,
            address,
        });
    }
    Ok(res)
}


//------------ RouterProfile -------------------------------------------------

/// The identity of a router carried through the pipeline.
///
/// Produced by collection and inspection; not mutated afterwards. The set
/// of discovered AS numbers is always the union over the groups.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RouterProfile {
    /// The host name. Primary key of the router.
    pub hostname: String,

    /// The address the router was collected from.
    pub address: String,

    /// The raw Junos `protocols bgp` text.
    pub bgp_config: String,

    /// The BGP groups in source-document order.
    pub bgp_groups: Vec<BgpGroup>,

    /// The union of all peer AS numbers over all groups.
    pub discovered_as_numbers: BTreeSet<Asn>,
}

impl RouterProfile {
    /// Creates a profile from collected configuration text.
    ///
    /// Strips CLI noise from the text, runs the inspector over it, and
    /// derives the AS number union from the resulting groups.
    pub fn from_collected(
        device: &DeviceInfo,
        bgp_config: String,
    ) -> Self {
        let bgp_config = crate::asn::clean_text(
            &bgp_config, crate::asn::DEFAULT_NOISE
        );
        let groups = inspector::inspect(&bgp_config);
        for diagnostic in groups.diagnostics() {
            warn!("{}: {}", device.hostname, diagnostic);
        }
        let discovered_as_numbers = groups.as_numbers();
        RouterProfile {
            hostname: device.hostname.clone(),
            address: device.address.clone(),
            bgp_config,
            bgp_groups: groups.groups().into(),
            discovered_as_numbers,
        }
    }
}


//------------ CollectFailure ------------------------------------------------

/// The kind of a per-device collection failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
pub enum CollectFailure {
    AuthFailed,
    HostKeyUnknown,
    HostKeyMismatch,
    ConnectTimeout,
    CommandTimeout,
    Transport,
    Unknown,
}

impl fmt::Display for CollectFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CollectFailure::AuthFailed => "AUTH_FAILED",
            CollectFailure::HostKeyUnknown => "HOST_KEY_UNKNOWN",
            CollectFailure::HostKeyMismatch => "HOST_KEY_MISMATCH",
            CollectFailure::ConnectTimeout => "CONNECT_TIMEOUT",
            CollectFailure::CommandTimeout => "COMMAND_TIMEOUT",
            CollectFailure::Transport => "TRANSPORT",
            CollectFailure::Unknown => "UNKNOWN",
        })
    }
}


//------------ CollectionResult ----------------------------------------------

/// The outcome of collecting from one device.
#[derive(Clone, Debug)]
pub enum CollectionResult {
    /// The device was collected successfully.
    Collected(RouterProfile),

    /// Collection failed.
    Failed {
        device: DeviceInfo,
        kind: CollectFailure,
        detail: String,
    },
}

impl CollectionResult {
    /// Returns the profile if collection succeeded.
    pub fn profile(&self) -> Option<&RouterProfile> {
        match self {
            CollectionResult::Collected(profile) => Some(profile),
            CollectionResult::Failed { .. } => None,
        }
    }
}


//------------ CollectionStats -----------------------------------------------

/// Aggregate statistics over a collection run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CollectionStats {
    /// The number of devices collected successfully.
    pub collected: usize,

    /// The number of devices that failed.
    pub failed: usize,

    /// The wall-clock duration of the whole run.
    pub duration: std::time::Duration,
}


//------------ CollectionReport ----------------------------------------------

/// The outcome of a collection run.
#[derive(Clone, Debug)]
pub struct CollectionReport {
    /// Per-device results in input order.
    pub results: Vec<CollectionResult>,

    /// Aggregate statistics.
    pub stats: CollectionStats,
}

impl CollectionReport {
    /// Returns an iterator over the successfully collected profiles.
    pub fn profiles(&self) -> impl Iterator<Item = &RouterProfile> {
        self.results.iter().filter_map(CollectionResult::profile)
    }
}


//------------ Collector -----------------------------------------------------

/// Collects BGP configuration from a fleet of devices.
#[derive(Clone, Debug)]
pub struct Collector {
    /// The prepared SSH command.
    command: SshCommand,

    /// The maximum number of concurrent sessions.
    max_workers: usize,
}

impl Collector {
    /// Creates a new collector from the configuration.
    pub fn new(config: &Config) -> Self {
        Collector {
            command: SshCommand::new(&config.ssh),
            max_workers: config.ssh.max_workers.max(1),
        }
    }

    /// Collects from all given devices.
    ///
    /// Devices are processed by a pool of `min(max_workers, devices)`
    /// workers, each owning its connection. Results arrive in input order
    /// regardless of completion order. The cancel token stops new devices
    /// from being started; devices already in flight run to completion of
    /// their own timeouts.
    pub fn collect(
        &self,
        devices: &[DeviceInfo],
        cancel: &Cancel,
    ) -> CollectionReport {
        let start = Instant::now();
        let tasks = SegQueue::new();
        for (index, device) in devices.iter().enumerate() {
            tasks.push((index, device.clone()));
        }
        let slots: Mutex<Vec<Option<CollectionResult>>> =
            Mutex::new(devices.iter().map(|_| None).collect());

        let workers = self.max_workers.min(devices.len()).max(1);
        let res = thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    while let Some((index, device)) = tasks.pop() {
                        if cancel.is_tripped() {
                            slots.lock()[index] = Some(
                                CollectionResult::Failed {
                                    device,
                                    kind: CollectFailure::Unknown,
                                    detail: "run canceled".into(),
                                }
                            );
                            continue
                        }
                        let result = self.collect_one(device);
                        slots.lock()[index] = Some(result);
                    }
                });
            }
        });
        if res.is_err() {
            error!(
                "Collector failed after a worker thread has panicked. \
                 This is most assuredly a bug."
            );
        }

        let results: Vec<_> = slots.into_inner().into_iter()
            .map(|slot| slot.expect("all slots filled"))
            .collect();
        let mut stats = CollectionStats {
            duration: start.elapsed(),
            ..Default::default()
        };
        for result in &results {
            match result {
                CollectionResult::Collected(_) => stats.collected += 1,
                CollectionResult::Failed { .. } => stats.failed += 1,
            }
        }
        info!(
            "Collected {} of {} devices in {:.1}s.",
            stats.collected, devices.len(),
            stats.duration.as_secs_f64()
        );
        CollectionReport { results, stats }
    }

    /// Collects from a single device.
    fn collect_one(&self, device: DeviceInfo) -> CollectionResult {
        match self.command.fetch_bgp_config(&device) {
            Ok(config) => {
                info!(
                    "{}: collected {} bytes of BGP configuration.",
                    device.hostname, config.len()
                );
                CollectionResult::Collected(
                    RouterProfile::from_collected(&device, config)
                )
            }
            Err((kind, detail)) => {
                warn!(
                    "{}: collection failed: {}: {}",
                    device.hostname, kind, detail
                );
                CollectionResult::Failed { device, kind, detail }
            }
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn inventory_synthesizes_hostnames() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address,hostname,role,region").unwrap();
        writeln!(file, "192.0.2.10,edge1,edge,eu").unwrap();
        writeln!(file, "192.0.2.11,,,").unwrap();
        file.flush().unwrap();

        let devices = load_devices(file.path()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].hostname, "edge1");
        assert_eq!(devices[0].role.as_deref(), Some("edge"));
        assert_eq!(devices[1].hostname, "192-0-2-11");
        assert_eq!(devices[1].role, None);
    }

    #[test]
    fn inventory_rejects_duplicate_addresses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address,hostname").unwrap();
        writeln!(file, "192.0.2.10,edge1").unwrap();
        writeln!(file, "192.0.2.10,edge2").unwrap();
        file.flush().unwrap();

        assert!(load_devices(file.path()).is_err());
    }

    #[test]
    fn inventory_ignores_extra_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "address,hostname,role,region,serial").unwrap();
        writeln!(file, "192.0.2.10,edge1,edge,eu,ABC123").unwrap();
        file.flush().unwrap();

        let devices = load_devices(file.path()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].hostname, "edge1");
    }

    #[test]
    fn profile_union_matches_groups() {
        let device = DeviceInfo::from_address("192.0.2.1");
        let profile = RouterProfile::from_collected(
            &device,
            "group transit {\n    neighbor 192.0.2.9 {\n        \
             peer-as 13335;\n    }\n}\n".into()
        );
        let union: BTreeSet<Asn> = profile.bgp_groups.iter()
            .flat_map(|group| group.peers.iter().copied())
            .collect();
        assert_eq!(profile.discovered_as_numbers, union);
    }
}
