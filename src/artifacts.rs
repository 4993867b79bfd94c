//! Durable artifacts of discovery and deployment.
//!
//! Every successful discovery refreshes the YAML mapping of routers to
//! BGP groups, keeps a timestamped snapshot in the history directory,
//! and writes a human-readable diff against the previous snapshot. The
//! deployment matrix projects the same data by AS number for operators
//! and downstream tooling.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{info, warn};
use crate::asn::Asn;
use crate::collector::RouterProfile;
use crate::error::Failed;
use crate::guardrails::PrefixCounts;
use crate::inspector::BgpGroup;
use crate::utils::date::format_file_stamp;
use crate::utils::fatal;


//------------ DiscoverySnapshot ---------------------------------------------

/// The discovered BGP structure of the fleet at one point in time.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct DiscoverySnapshot {
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,

    /// Per-router discovery keyed by host name.
    pub routers: BTreeMap<String, RouterDiscovery>,
}

/// What discovery found on one router.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RouterDiscovery {
    /// The address the router was collected from.
    pub address: String,

    /// The BGP groups in source-document order.
    pub bgp_groups: Vec<BgpGroup>,

    /// The union of all peer AS numbers.
    pub discovered_as_numbers: BTreeSet<Asn>,
}

impl DiscoverySnapshot {
    /// Builds a snapshot from collected profiles.
    pub fn from_profiles<'a>(
        profiles: impl Iterator<Item = &'a RouterProfile>
    ) -> Self {
        DiscoverySnapshot {
            generated_at: Utc::now(),
            routers: profiles.map(|profile| {
                (
                    profile.hostname.clone(),
                    RouterDiscovery {
                        address: profile.address.clone(),
                        bgp_groups: profile.bgp_groups.clone(),
                        discovered_as_numbers:
                            profile.discovered_as_numbers.clone(),
                    }
                )
            }).collect(),
        }
    }
}


//------------ Discovery persistence -----------------------------------------

/// The name of the primary discovery artifact.
const MAPPINGS_FILE: &str = "bgp-mappings.yaml";

/// The name of the router inventory artifact.
const INVENTORY_FILE: &str = "router-inventory.json";

/// Writes the discovery artifacts below the given directory.
///
/// Returns the path of the diff report if a previous snapshot existed
/// and differed.
pub fn write_discovery(
    dir: &Path,
    snapshot: &DiscoverySnapshot,
) -> Result<Option<PathBuf>, Failed> {
    fatal::create_dir_all(dir)?;
    let mappings_path = dir.join(MAPPINGS_FILE);

    let previous = load_discovery(&mappings_path);

    let yaml = serde_yaml::to_string(snapshot).map_err(|err| {
        log::error!("Failed to serialize discovery snapshot: {}", err);
        Failed
    })?;
    fatal::replace_file(&mappings_path, yaml.as_bytes())?;

    let inventory = serde_json::to_vec_pretty(
        &snapshot.routers
    ).map_err(|err| {
        log::error!("Failed to serialize router inventory: {}", err);
        Failed
    })?;
    fatal::replace_file(&dir.join(INVENTORY_FILE), &inventory)?;

    let stamp = format_file_stamp(snapshot.generated_at).to_string();
    let history = dir.join("history");
    fatal::create_dir_all(&history)?;
    fatal::replace_file(
        &history.join(format!("bgp-mappings-{}.yaml", stamp)),
        yaml.as_bytes()
    )?;

    let diff_path = match previous {
        Some(previous) => {
            let diff = render_discovery_diff(&previous, snapshot);
            if diff.is_empty() {
                info!("Discovery unchanged since previous snapshot.");
                None
            }
            else {
                let path = dir.join(
                    format!("diff_report_{}.txt", stamp)
                );
                fatal::replace_file(&path, diff.as_bytes())?;
                info!(
                    "Discovery changed; diff report at {}.",
                    path.display()
                );
                Some(path)
            }
        }
        None => None,
    };
    Ok(diff_path)
}

/// Loads a discovery snapshot, returning `None` if absent or broken.
pub fn load_discovery(path: &Path) -> Option<DiscoverySnapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(
                "Ignoring unreadable discovery snapshot {}: {}",
                path.display(), err
            );
            None
        }
    }
}

/// Renders the human-readable diff between two snapshots.
///
/// An empty string means the snapshots describe the same mappings.
pub fn render_discovery_diff(
    previous: &DiscoverySnapshot,
    current: &DiscoverySnapshot,
) -> String {
    let mut res = String::new();

    for (hostname, discovery) in &current.routers {
        match previous.routers.get(hostname) {
            None => {
                let _ = writeln!(
                    res, "+ router {} ({} AS numbers)",
                    hostname, discovery.discovered_as_numbers.len()
                );
            }
            Some(old) => {
                for asn in discovery.discovered_as_numbers
                    .difference(&old.discovered_as_numbers)
                {
                    let _ = writeln!(
                        res, "+ {}: {}", hostname, asn
                    );
                }
                for asn in old.discovered_as_numbers
                    .difference(&discovery.discovered_as_numbers)
                {
                    let _ = writeln!(
                        res, "- {}: {}", hostname, asn
                    );
                }
                let old_groups: BTreeSet<&str> = old.bgp_groups.iter()
                    .map(|group| group.name.as_str()).collect();
                let new_groups: BTreeSet<&str> = discovery.bgp_groups
                    .iter().map(|group| group.name.as_str()).collect();
                for group in new_groups.difference(&old_groups) {
                    let _ = writeln!(
                        res, "+ {}: group {}", hostname, group
                    );
                }
                for group in old_groups.difference(&new_groups) {
                    let _ = writeln!(
                        res, "- {}: group {}", hostname, group
                    );
                }
            }
        }
    }
    for hostname in previous.routers.keys() {
        if !current.routers.contains_key(hostname) {
            let _ = writeln!(res, "- router {}", hostname);
        }
    }

    res
}


//------------ DeploymentMatrix ----------------------------------------------

/// The projection of discovery by router and by AS number.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct DeploymentMatrix {
    /// AS numbers per router.
    pub router_to_as: BTreeMap<String, BTreeSet<Asn>>,

    /// Routers per AS number.
    pub as_to_routers: BTreeMap<Asn, BTreeSet<String>>,

    /// Group names per router.
    pub router_groups: BTreeMap<String, Vec<String>>,
}

impl DeploymentMatrix {
    /// Derives the matrix from a discovery snapshot.
    pub fn from_snapshot(snapshot: &DiscoverySnapshot) -> Self {
        let mut router_to_as = BTreeMap::new();
        let mut as_to_routers: BTreeMap<Asn, BTreeSet<String>> =
            BTreeMap::new();
        let mut router_groups = BTreeMap::new();
        for (hostname, discovery) in &snapshot.routers {
            router_to_as.insert(
                hostname.clone(),
                discovery.discovered_as_numbers.clone()
            );
            for asn in &discovery.discovered_as_numbers {
                as_to_routers.entry(*asn)
                    .or_insert_with(BTreeSet::new)
                    .insert(hostname.clone());
            }
            router_groups.insert(
                hostname.clone(),
                discovery.bgp_groups.iter()
                    .map(|group| group.name.clone())
                    .collect()
            );
        }
        DeploymentMatrix { router_to_as, as_to_routers, router_groups }
    }

    /// Writes the matrix artifacts below the reports directory.
    pub fn write(&self, dir: &Path) -> Result<(), Failed> {
        fatal::create_dir_all(dir)?;
        self.write_csv(&dir.join("deployment-matrix.csv"))?;
        let json = serde_json::to_vec_pretty(self).map_err(|err| {
            log::error!(
                "Failed to serialize deployment matrix: {}", err
            );
            Failed
        })?;
        fatal::replace_file(&dir.join("deployment-matrix.json"), &json)?;
        fatal::replace_file(
            &dir.join("deployment-summary.txt"),
            self.render_summary().as_bytes()
        )?;
        Ok(())
    }

    /// Writes the CSV projection: one row per (router, AS) pair.
    fn write_csv(&self, path: &Path) -> Result<(), Failed> {
        let mut writer = csv::Writer::from_path(path).map_err(|err| {
            log::error!(
                "Failed to write deployment matrix {}: {}",
                path.display(), err
            );
            Failed
        })?;
        writer.write_record(&["router", "as_number"]).map_err(|err| {
            log::error!("Failed to write CSV header: {}", err);
            Failed
        })?;
        for (hostname, as_numbers) in &self.router_to_as {
            for asn in as_numbers {
                let asn = asn.into_u32().to_string();
                writer.write_record(&[
                    hostname.as_str(), asn.as_str()
                ]).map_err(|err| {
                    log::error!("Failed to write CSV row: {}", err);
                    Failed
                })?;
            }
        }
        writer.flush().map_err(|err| {
            log::error!("Failed to flush CSV: {}", err);
            Failed
        })
    }

    /// Renders the human-readable summary.
    fn render_summary(&self) -> String {
        let mut res = String::new();
        let _ = writeln!(res, "Deployment matrix");
        let _ = writeln!(res, "=================");
        let _ = writeln!(
            res, "{} routers, {} distinct AS numbers",
            self.router_to_as.len(), self.as_to_routers.len()
        );
        res.push('\n');
        for (hostname, as_numbers) in &self.router_to_as {
            let _ = writeln!(
                res, "{}: {} AS numbers", hostname, as_numbers.len()
            );
            for asn in as_numbers {
                let routers = self.as_to_routers.get(asn)
                    .map(|set| set.len())
                    .unwrap_or(0);
                let _ = writeln!(
                    res, "    {} (on {} routers)", asn, routers
                );
            }
        }
        res
    }
}


//------------ Prefix-count state --------------------------------------------

/// The file holding the per-router prefix counts of the last run.
const PREFIX_COUNTS_FILE: &str = "prefix-counts.json";

/// Loads the prefix counts recorded by the previous run.
pub fn load_prefix_counts(
    dir: &Path
) -> BTreeMap<String, PrefixCounts> {
    let path = dir.join(PREFIX_COUNTS_FILE);
    match std::fs::read(&path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(counts) => counts,
            Err(err) => {
                warn!(
                    "Ignoring unreadable prefix counts {}: {}",
                    path.display(), err
                );
                BTreeMap::new()
            }
        },
        Err(_) => BTreeMap::new(),
    }
}

/// Stores the prefix counts for the next run.
pub fn store_prefix_counts(
    dir: &Path,
    counts: &BTreeMap<String, PrefixCounts>,
) -> Result<(), Failed> {
    let data = serde_json::to_vec_pretty(counts).map_err(|err| {
        log::error!("Failed to serialize prefix counts: {}", err);
        Failed
    })?;
    fatal::replace_file(&dir.join(PREFIX_COUNTS_FILE), &data)
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::collector::DeviceInfo;

    fn profile(hostname: &str, config: &str) -> RouterProfile {
        let mut device = DeviceInfo::from_address("192.0.2.1");
        device.hostname = hostname.into();
        RouterProfile::from_collected(&device, config.into())
    }

    const CONFIG_A: &str = "\
        group transit {\n\
            neighbor 192.0.2.9 { peer-as 13335; }\n\
            neighbor 192.0.2.10 { peer-as 15169; }\n\
        }\n\
    ";

    const CONFIG_B: &str = "\
        group transit {\n\
            neighbor 192.0.2.9 { peer-as 13335; }\n\
        }\n\
        group peers {\n\
            neighbor 192.0.2.11 { peer-as 64496; }\n\
        }\n\
    ";

    #[test]
    fn discovery_yaml_round_trips() {
        let profiles = [profile("edge1", CONFIG_A)];
        let snapshot = DiscoverySnapshot::from_profiles(
            profiles.iter()
        );
        let yaml = serde_yaml::to_string(&snapshot).unwrap();
        let parsed: DiscoverySnapshot =
            serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.routers["edge1"].discovered_as_numbers,
            snapshot.routers["edge1"].discovered_as_numbers
        );
        assert_eq!(
            parsed.routers["edge1"].bgp_groups.len(),
            snapshot.routers["edge1"].bgp_groups.len()
        );
    }

    #[test]
    fn diff_reports_changes() {
        let old = DiscoverySnapshot::from_profiles(
            [profile("edge1", CONFIG_A)].iter()
        );
        let new = DiscoverySnapshot::from_profiles(
            [profile("edge1", CONFIG_B)].iter()
        );
        let diff = render_discovery_diff(&old, &new);
        assert!(diff.contains("+ edge1: AS64496"));
        assert!(diff.contains("- edge1: AS15169"));
        assert!(diff.contains("+ edge1: group peers"));

        let unchanged = render_discovery_diff(&old, &old);
        assert!(unchanged.is_empty());
    }

    #[test]
    fn diff_reports_router_turnover() {
        let old = DiscoverySnapshot::from_profiles(
            [profile("edge1", CONFIG_A)].iter()
        );
        let new = DiscoverySnapshot::from_profiles(
            [profile("edge2", CONFIG_A)].iter()
        );
        let diff = render_discovery_diff(&old, &new);
        assert!(diff.contains("+ router edge2"));
        assert!(diff.contains("- router edge1"));
    }

    #[test]
    fn write_discovery_keeps_history_and_diff() {
        let dir = tempfile::tempdir().unwrap();
        let first = DiscoverySnapshot::from_profiles(
            [profile("edge1", CONFIG_A)].iter()
        );
        let diff = write_discovery(dir.path(), &first).unwrap();
        assert!(diff.is_none());
        assert!(dir.path().join(MAPPINGS_FILE).exists());
        assert!(dir.path().join(INVENTORY_FILE).exists());

        let mut second = DiscoverySnapshot::from_profiles(
            [profile("edge1", CONFIG_B)].iter()
        );
        // A later timestamp keeps the history file names distinct.
        second.generated_at = first.generated_at
            + chrono::Duration::seconds(1);
        let diff = write_discovery(dir.path(), &second).unwrap();
        let diff = diff.expect("diff report expected");
        let content = std::fs::read_to_string(diff).unwrap();
        assert!(content.contains("+ edge1: AS64496"));

        let history: Vec<_> = std::fs::read_dir(
            dir.path().join("history")
        ).unwrap().collect();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn matrix_projects_both_ways() {
        let snapshot = DiscoverySnapshot::from_profiles(
            [
                profile("edge1", CONFIG_A),
                profile("edge2", CONFIG_B),
            ].iter()
        );
        let matrix = DeploymentMatrix::from_snapshot(&snapshot);
        assert_eq!(matrix.router_to_as.len(), 2);
        assert!(matrix.router_to_as["edge1"]
            .contains(&Asn::from_u32(15169)));
        let routers = &matrix.as_to_routers[&Asn::from_u32(13335)];
        assert_eq!(routers.len(), 2);
        assert_eq!(
            matrix.router_groups["edge2"],
            ["transit", "peers"]
        );
    }

    #[test]
    fn matrix_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = DiscoverySnapshot::from_profiles(
            [profile("edge1", CONFIG_A)].iter()
        );
        let matrix = DeploymentMatrix::from_snapshot(&snapshot);
        matrix.write(dir.path()).unwrap();

        let csv = std::fs::read_to_string(
            dir.path().join("deployment-matrix.csv")
        ).unwrap();
        assert!(csv.starts_with("router,as_number\n"));
        assert!(csv.contains("edge1,13335"));

        let json = std::fs::read_to_string(
            dir.path().join("deployment-matrix.json")
        ).unwrap();
        assert!(json.contains("router_to_as"));

        assert!(dir.path().join("deployment-summary.txt").exists());
    }

    #[test]
    fn prefix_counts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_prefix_counts(dir.path()).is_empty());

        let mut counts = BTreeMap::new();
        counts.insert(
            "edge1".to_string(),
            PrefixCounts { ipv4: 100, ipv6: 10 }
        );
        store_prefix_counts(dir.path(), &counts).unwrap();
        assert_eq!(load_prefix_counts(dir.path()), counts);
    }
}
