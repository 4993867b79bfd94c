//! RPKI origin validation against a VRP cache.
//!
//! The validator loads a file of Validated ROA Payloads produced by a
//! relying party instance (rpki-client and Routinator formats are both
//! accepted) into an in-memory index and answers (prefix, origin) queries
//! with the classic tri-state outcome plus an error state for mechanical
//! failures.
//!
//! The states are determined based on two terms:
//!
//! * A VRP is said to _cover_ an announcement if its prefix covers the
//!   announcement, that is the VRP’s prefix length is less or equal and
//!   the bits of its network prefix match the respective bits of the
//!   announcement’s prefix.
//! * A VRP is said to _match_ an announcement if it covers the announcement
//!   and in addition the announcement’s origin AS number is equal to the
//!   VRP’s AS number and the announcement’s prefix length is less or equal
//!   to the VRP’s maximum length.
//!
//! An announcement is Valid if at least one VRP matches it and Invalid if
//! a VRP with a *different* origin covers it while no VRP matches. When no
//! VRP covers it at all, or the only covering VRPs carry the announced
//! origin but lose on the length check, the answer is NotFound. An
//! allowlist entry flips Invalid to Valid with an annotation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::SystemTime;
use crossbeam_queue::SegQueue;
use crossbeam_utils::thread;
use ipnet::IpNet;
use log::{error, info, warn};
use serde::Deserialize;
use crate::asn::Asn;
use crate::config::RpkiConf;
use crate::error::Failed;
use crate::utils::sync::Mutex;


//------------ Constants -----------------------------------------------------

/// Batch sizes up to this are evaluated sequentially.
const SEQUENTIAL_LIMIT: usize = 10;

/// The worker count used for chunked parallel evaluation.
const MAX_WORKERS: usize = 8;


//------------ RpkiState -----------------------------------------------------

/// The RPKI state of a route announcement.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpkiState {
    /// At least one VRP matches the announcement.
    Valid,

    /// A VRP with a different origin covers the announcement and no
    /// VRP matches it.
    Invalid,

    /// No VRP covers the announcement, or the covering VRPs carry the
    /// announced origin but fail the length check.
    NotFound,

    /// Validation failed mechanically. Fail-closed policy applies.
    Error,
}

impl fmt::Display for RpkiState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RpkiState::Valid => "valid",
            RpkiState::Invalid => "invalid",
            RpkiState::NotFound => "notfound",
            RpkiState::Error => "error",
        })
    }
}


//------------ RpkiValidationResult ------------------------------------------

/// The outcome of validating one (prefix, origin) pair.
#[derive(Clone, Debug)]
pub struct RpkiValidationResult {
    /// The prefix of the announcement.
    pub prefix: IpNet,

    /// The origin AS of the announcement.
    pub origin: Asn,

    /// The resulting state.
    pub state: RpkiState,

    /// Whether an allowlist entry turned Invalid into Valid.
    pub allowlisted: bool,

    /// For Invalid results, what failed. Always `"as"`: only a covering
    /// VRP with a different origin produces the Invalid state.
    pub reason: Option<&'static str>,
}


//------------ ValidationStats -----------------------------------------------

/// Aggregate counters over a batch of validation results.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ValidationStats {
    pub valid: usize,
    pub invalid: usize,
    pub not_found: usize,
    pub error: usize,
    pub allowlisted: usize,
    pub total: usize,
}

impl ValidationStats {
    /// Computes all counters in a single pass over the results.
    pub fn from_results(results: &[RpkiValidationResult]) -> Self {
        let mut res = ValidationStats::default();
        for result in results {
            res.total += 1;
            match result.state {
                RpkiState::Valid => res.valid += 1,
                RpkiState::Invalid => res.invalid += 1,
                RpkiState::NotFound => res.not_found += 1,
                RpkiState::Error => res.error += 1,
            }
            if result.allowlisted {
                res.allowlisted += 1;
            }
        }
        res
    }

    /// Returns the percentage of invalid results.
    pub fn invalid_percent(&self) -> f64 {
        percent(self.invalid, self.total)
    }

    /// Returns the percentage of not-found results.
    pub fn not_found_percent(&self) -> f64 {
        percent(self.not_found, self.total)
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.
    }
    else {
        part as f64 * 100. / total as f64
    }
}


//------------ Vrp -----------------------------------------------------------

/// A single Validated ROA Payload.
#[derive(Clone, Debug)]
pub struct Vrp {
    /// The prefix the origin is authorized for.
    pub prefix: IpNet,

    /// The maximum length of an announced prefix.
    pub max_length: u8,

    /// The authorized origin AS.
    pub origin_as: Asn,

    /// The trust anchor the ROA chains to.
    pub trust_anchor: Option<String>,
}


//------------ VrpIndex ------------------------------------------------------

/// The VRPs indexed for longest-prefix cover lookups.
///
/// Entries are bucketed by address family, prefix length, and the prefix
/// bits truncated to that length. A cover query walks the lengths present
/// in the index from 0 up to the query’s own length, masking the query
/// address each time. The index is immutable after load and shared
/// read-only between workers.
#[derive(Debug, Default)]
pub struct VrpIndex {
    /// IPv4 buckets by (length, truncated bits).
    v4: HashMap<(u8, u32), Vec<IndexEntry>>,

    /// IPv6 buckets by (length, truncated bits).
    v6: HashMap<(u8, u128), Vec<IndexEntry>>,

    /// The distinct IPv4 prefix lengths present, ascending.
    v4_lens: Vec<u8>,

    /// The distinct IPv6 prefix lengths present, ascending.
    v6_lens: Vec<u8>,

    /// The number of VRPs in the index.
    count: usize,
}

/// One VRP reduced to what a query needs.
#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    origin: Asn,
    max_length: u8,
}

impl VrpIndex {
    /// Builds the index from a list of VRPs.
    pub fn from_vrps(vrps: Vec<Vrp>) -> Self {
        let mut res = VrpIndex::default();
        for vrp in vrps {
            let entry = IndexEntry {
                origin: vrp.origin_as,
                max_length: vrp.max_length,
            };
            match vrp.prefix {
                IpNet::V4(net) => {
                    let key = (
                        net.prefix_len(),
                        u32::from(net.network())
                    );
                    res.v4.entry(key).or_insert_with(Vec::new).push(entry);
                }
                IpNet::V6(net) => {
                    let key = (
                        net.prefix_len(),
                        u128::from(net.network())
                    );
                    res.v6.entry(key).or_insert_with(Vec::new).push(entry);
                }
            }
            res.count += 1;
        }
        res.v4_lens = distinct_lens(res.v4.keys().map(|key| key.0));
        res.v6_lens = distinct_lens(res.v6.keys().map(|key| key.0));
        res
    }

    /// Returns the number of VRPs in the index.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Collects the covering VRPs for a prefix into the three buckets.
    ///
    /// Returns (matched, bad_asn, bad_len) counts. Origin decides the
    /// bucket first: any covering VRP with a foreign origin is `bad_asn`
    /// regardless of its maximum length, and `bad_len` is reserved for
    /// same-origin VRPs that only lose on the length check.
    fn cover(
        &self, prefix: IpNet, origin: Asn
    ) -> (usize, usize, usize) {
        let mut matched = 0;
        let mut bad_asn = 0;
        let mut bad_len = 0;
        let mut visit = |entry: &IndexEntry| {
            if entry.origin != origin {
                bad_asn += 1;
            }
            else if prefix.prefix_len() > entry.max_length {
                bad_len += 1;
            }
            else {
                matched += 1;
            }
        };
        match prefix {
            IpNet::V4(net) => {
                let addr = u32::from(net.addr());
                for &len in &self.v4_lens {
                    if len > net.prefix_len() {
                        break
                    }
                    let bits = mask_v4(addr, len);
                    if let Some(bucket) = self.v4.get(&(len, bits)) {
                        bucket.iter().for_each(&mut visit);
                    }
                }
            }
            IpNet::V6(net) => {
                let addr = u128::from(net.addr());
                for &len in &self.v6_lens {
                    if len > net.prefix_len() {
                        break
                    }
                    let bits = mask_v6(addr, len);
                    if let Some(bucket) = self.v6.get(&(len, bits)) {
                        bucket.iter().for_each(&mut visit);
                    }
                }
            }
        }
        (matched, bad_asn, bad_len)
    }
}

/// Returns the sorted distinct lengths of an iterator.
fn distinct_lens(iter: impl Iterator<Item = u8>) -> Vec<u8> {
    let mut res: Vec<u8> = iter.collect::<HashSet<_>>()
        .into_iter().collect();
    res.sort_unstable();
    res
}

/// Masks an IPv4 address to a prefix length.
fn mask_v4(addr: u32, len: u8) -> u32 {
    if len == 0 {
        0
    }
    else {
        addr & (u32::MAX << (32 - len))
    }
}

/// Masks an IPv6 address to a prefix length.
fn mask_v6(addr: u128, len: u8) -> u128 {
    if len == 0 {
        0
    }
    else {
        addr & (u128::MAX << (128 - len))
    }
}


//------------ VRP file formats ----------------------------------------------

/// The VRP file as written by rpki-client or Routinator.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VrpFile {
    /// The `{"roas": [...]}` wrapper both producers use.
    Wrapped { roas: Vec<RawVrp> },

    /// A bare array of VRP objects.
    Bare(Vec<RawVrp>),
}

/// A VRP as found in the cache file.
#[derive(Debug, Deserialize)]
struct RawVrp {
    prefix: String,
    #[serde(rename = "maxLength")]
    max_length: u8,
    asn: RawAsn,
    #[serde(default)]
    ta: Option<String>,
}

/// The origin AS, numeric or in `AS64496` notation.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAsn {
    Int(u32),
    Str(String),
}

impl RawVrp {
    /// Converts the raw VRP, checking its invariants.
    fn into_vrp(self) -> Result<Vrp, String> {
        let prefix = IpNet::from_str(&self.prefix).map_err(|_| {
            format!("malformed prefix '{}'", self.prefix)
        })?;
        let family_max = match prefix {
            IpNet::V4(_) => 32,
            IpNet::V6(_) => 128,
        };
        if self.max_length > family_max
            || self.max_length < prefix.prefix_len()
        {
            return Err(format!(
                "maxLength {} out of range for {}",
                self.max_length, self.prefix
            ))
        }
        let origin_as = match self.asn {
            RawAsn::Int(value) => Asn::from_u32(value),
            RawAsn::Str(value) => {
                Asn::from_str(&value).map_err(|_| {
                    format!("malformed origin AS '{}'", value)
                })?
            }
        };
        Ok(Vrp {
            prefix,
            max_length: self.max_length,
            origin_as,
            trust_anchor: self.ta,
        })
    }
}


//------------ RpkiValidator -------------------------------------------------

/// Validates (prefix, origin) pairs against the loaded VRP set.
#[derive(Debug)]
pub struct RpkiValidator {
    /// The immutable VRP index.
    index: VrpIndex,

    /// The allowlisted (prefix, origin) pairs.
    allowlist: HashSet<(IpNet, Asn)>,

    /// Whether the cache exceeded its maximum age at load time.
    stale: bool,

    /// Whether a stale cache forces the error state.
    fail_closed: bool,
}

impl RpkiValidator {
    /// Loads the validator per the configuration.
    ///
    /// Fails if the cache file cannot be read or parsed at all. A stale
    /// cache loads fine but, with fail-closed set, makes every query
    /// return the error state.
    pub fn load(conf: &RpkiConf) -> Result<Self, Failed> {
        let stale = match cache_age_hours(&conf.vrp_cache_path) {
            Some(age) => age > conf.max_vrp_age_hours as f64,
            None => {
                error!(
                    "VRP cache {} is absent or unreadable.",
                    conf.vrp_cache_path.display()
                );
                return Err(Failed)
            }
        };
        if stale {
            if conf.fail_closed {
                warn!(
                    "VRP cache {} exceeds maximum age of {} hours; \
                     failing closed.",
                    conf.vrp_cache_path.display(), conf.max_vrp_age_hours
                );
            }
            else {
                warn!(
                    "VRP cache {} exceeds maximum age of {} hours.",
                    conf.vrp_cache_path.display(), conf.max_vrp_age_hours
                );
            }
        }

        let vrps = load_vrps(&conf.vrp_cache_path)?;
        let allowlist = match conf.allowlist_path.as_ref() {
            Some(path) => load_allowlist(path)?,
            None => HashSet::new(),
        };
        let index = VrpIndex::from_vrps(vrps);
        info!(
            "Loaded {} VRPs, {} allowlist entries.",
            index.len(), allowlist.len()
        );
        Ok(RpkiValidator {
            index,
            allowlist,
            stale,
            fail_closed: conf.fail_closed,
        })
    }

    /// Creates a validator from parts. Used in tests.
    #[cfg(test)]
    pub fn from_parts(
        index: VrpIndex,
        allowlist: HashSet<(IpNet, Asn)>,
        stale: bool,
        fail_closed: bool,
    ) -> Self {
        RpkiValidator { index, allowlist, stale, fail_closed }
    }

    /// Validates a single (prefix, origin) pair.
    pub fn validate(
        &self, prefix: IpNet, origin: Asn
    ) -> RpkiValidationResult {
        if self.stale && self.fail_closed {
            return RpkiValidationResult {
                prefix, origin,
                state: RpkiState::Error,
                allowlisted: false,
                reason: None,
            }
        }

        // Invalid needs a covering VRP with a foreign origin. Covering
        // VRPs that carry the announced origin but fail the length
        // check leave the announcement without an authorization either
        // way, so without a foreign-origin VRP the answer is NotFound.
        let (matched, bad_asn, _bad_len) =
            self.index.cover(prefix, origin);
        let (state, reason) = if matched > 0 {
            (RpkiState::Valid, None)
        }
        else if bad_asn > 0 {
            (RpkiState::Invalid, Some("as"))
        }
        else {
            (RpkiState::NotFound, None)
        };

        if state == RpkiState::Invalid
            && self.allowlist.contains(&(prefix, origin))
        {
            RpkiValidationResult {
                prefix, origin,
                state: RpkiState::Valid,
                allowlisted: true,
                reason,
            }
        }
        else {
            RpkiValidationResult {
                prefix, origin,
                state,
                allowlisted: false,
                reason,
            }
        }
    }

    /// Validates a batch of prefixes against one origin.
    ///
    /// Results are returned in input order. Small batches are evaluated
    /// sequentially; larger ones are partitioned into chunks evaluated by
    /// a thread pool against the read-only index. Chunk size grows
    /// sub-linearly with the batch so pool overhead stays bounded.
    pub fn validate_prefixes(
        &self,
        prefixes: &[IpNet],
        origin: Asn,
        max_workers: Option<usize>,
    ) -> Vec<RpkiValidationResult> {
        if prefixes.len() <= SEQUENTIAL_LIMIT {
            return prefixes.iter()
                .map(|prefix| self.validate(*prefix, origin))
                .collect()
        }

        let chunk_size = chunk_size_for(prefixes.len());
        let workers = max_workers.unwrap_or(MAX_WORKERS)
            .min(prefixes.len() / chunk_size + 1)
            .max(1);

        let tasks = SegQueue::new();
        for (index, chunk) in prefixes.chunks(chunk_size).enumerate() {
            tasks.push((index * chunk_size, chunk));
        }
        let slots: Mutex<Vec<Option<RpkiValidationResult>>> =
            Mutex::new(prefixes.iter().map(|_| None).collect());

        let res = thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    while let Some((start, chunk)) = tasks.pop() {
                        let results: Vec<_> = chunk.iter()
                            .map(|prefix| self.validate(*prefix, origin))
                            .collect();
                        let mut slots = slots.lock();
                        for (offset, result) in
                            results.into_iter().enumerate()
                        {
                            slots[start + offset] = Some(result);
                        }
                    }
                });
            }
        });
        if res.is_err() {
            error!(
                "RPKI validation failed after a worker thread has \
                 panicked. This is most assuredly a bug."
            );
        }

        slots.into_inner().into_iter()
            .map(|slot| slot.expect("all slots filled"))
            .collect()
    }
}

/// Returns the chunk size for a batch of the given size.
fn chunk_size_for(len: usize) -> usize {
    ((len as f64).sqrt().ceil() as usize * 4).max(SEQUENTIAL_LIMIT)
}


//------------ preflight -----------------------------------------------------

/// Checks the VRP cache independently of a run.
///
/// Fails when the cache is absent, unreadable, or stale. The `rpki-check`
/// verb maps the failure to its own exit code.
pub fn preflight(conf: &RpkiConf) -> Result<PreflightReport, Failed> {
    let age = match cache_age_hours(&conf.vrp_cache_path) {
        Some(age) => age,
        None => {
            error!(
                "RPKI preflight: VRP cache {} is absent or unreadable.",
                conf.vrp_cache_path.display()
            );
            return Err(Failed)
        }
    };
    if age > conf.max_vrp_age_hours as f64 {
        error!(
            "RPKI preflight: VRP cache {} is {:.1} hours old, \
             maximum is {}.",
            conf.vrp_cache_path.display(), age, conf.max_vrp_age_hours
        );
        return Err(Failed)
    }
    let vrps = load_vrps(&conf.vrp_cache_path)?;
    if let Some(path) = conf.allowlist_path.as_ref() {
        load_allowlist(path)?;
    }
    Ok(PreflightReport {
        vrp_count: vrps.len(),
        age_hours: age,
    })
}

/// What the preflight check found.
#[derive(Clone, Copy, Debug)]
pub struct PreflightReport {
    /// The number of VRPs in the cache.
    pub vrp_count: usize,

    /// The age of the cache in hours.
    pub age_hours: f64,
}

/// Returns the age of the cache file in hours.
///
/// `None` if the file or its metadata cannot be accessed.
fn cache_age_hours(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    Some(age.as_secs_f64() / 3600.)
}


//------------ load_vrps -----------------------------------------------------

/// Loads and checks the VRP cache file.
pub fn load_vrps(path: &Path) -> Result<Vec<Vrp>, Failed> {
    let data = std::fs::read(path).map_err(|err| {
        error!(
            "Failed to read VRP cache {}: {}", path.display(), err
        );
        Failed
    })?;
    let file: VrpFile = serde_json::from_slice(&data).map_err(|err| {
        error!(
            "Failed to parse VRP cache {}: {}", path.display(), err
        );
        Failed
    })?;
    let raw = match file {
        VrpFile::Wrapped { roas } => roas,
        VrpFile::Bare(roas) => roas,
    };
    let mut res = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;
    for vrp in raw {
        match vrp.into_vrp() {
            Ok(vrp) => res.push(vrp),
            Err(reason) => {
                if skipped == 0 {
                    warn!(
                        "VRP cache {}: skipping entry: {}",
                        path.display(), reason
                    );
                }
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(
            "VRP cache {}: skipped {} malformed entries.",
            path.display(), skipped
        );
    }
    Ok(res)
}


//------------ load_allowlist ------------------------------------------------

/// Loads the allowlist file.
///
/// The format is one `prefix asn` pair per line; blank lines and lines
/// starting with `#` are ignored. Anything else is rejected.
pub fn load_allowlist(
    path: &Path
) -> Result<HashSet<(IpNet, Asn)>, Failed> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        error!(
            "Failed to read RPKI allowlist {}: {}", path.display(), err
        );
        Failed
    })?;
    let mut res = HashSet::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue
        }
        let mut parts = line.split_whitespace();
        let prefix = parts.next();
        let asn = parts.next();
        let extra = parts.next();
        let (prefix, asn) = match (prefix, asn, extra) {
            (Some(prefix), Some(asn), None) => (prefix, asn),
            _ => {
                error!(
                    "RPKI allowlist {} line {}: expected 'prefix asn'.",
                    path.display(), number + 1
                );
                return Err(Failed)
            }
        };
        let prefix = IpNet::from_str(prefix).map_err(|_| {
            error!(
                "RPKI allowlist {} line {}: malformed prefix '{}'.",
                path.display(), number + 1, prefix
            );
            Failed
        })?;
        let asn = Asn::from_str(asn).map_err(|_| {
            error!(
                "RPKI allowlist {} line {}: malformed AS '{}'.",
                path.display(), number + 1, asn
            );
            Failed
        })?;
        res.insert((prefix, asn));
    }
    Ok(res)
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn v4(s: &str) -> IpNet {
        IpNet::from_str(s).expect("valid IPv4 prefix")
    }

    fn v6(s: &str) -> IpNet {
        IpNet::from_str(s).expect("valid IPv6 prefix")
    }

    fn vrp(prefix: &str, max_length: u8, origin: u32) -> Vrp {
        Vrp {
            prefix: IpNet::from_str(prefix).unwrap(),
            max_length,
            origin_as: Asn::from_u32(origin),
            trust_anchor: None,
        }
    }

    fn validator(vrps: Vec<Vrp>) -> RpkiValidator {
        RpkiValidator::from_parts(
            VrpIndex::from_vrps(vrps), HashSet::new(), false, true
        )
    }

    #[test]
    fn valid_invalid_notfound() {
        let validator = validator(vec![
            vrp("192.0.2.0/24", 24, 64496),
            vrp("198.51.100.0/22", 24, 64497),
        ]);

        // Exact match, correct origin.
        let res = validator.validate(v4("192.0.2.0/24"), 64496.into());
        assert_eq!(res.state, RpkiState::Valid);

        // Covered, wrong origin.
        let res = validator.validate(v4("192.0.2.0/24"), 64497.into());
        assert_eq!(res.state, RpkiState::Invalid);
        assert_eq!(res.reason, Some("as"));

        // Covered, correct origin, too specific: no foreign-origin VRP
        // covers it, so the prefix has no verdict at all.
        let res = validator.validate(v4("192.0.2.0/25"), 64496.into());
        assert_eq!(res.state, RpkiState::NotFound);
        assert_eq!(res.reason, None);

        // A foreign-origin covering VRP makes it Invalid even when the
        // announcement is too specific for that VRP as well.
        let res = validator.validate(v4("198.51.100.0/26"), 64496.into());
        assert_eq!(res.state, RpkiState::Invalid);
        assert_eq!(res.reason, Some("as"));

        // Less specific announcement than any VRP.
        let res = validator.validate(v4("192.0.0.0/16"), 64496.into());
        assert_eq!(res.state, RpkiState::NotFound);

        // Not covered at all.
        let res = validator.validate(v4("203.0.113.0/24"), 64496.into());
        assert_eq!(res.state, RpkiState::NotFound);

        // More specific within maxLength window.
        let res = validator.validate(
            v4("198.51.100.0/24"), 64497.into()
        );
        assert_eq!(res.state, RpkiState::Valid);
    }

    #[test]
    fn ipv6_lookups() {
        let validator = validator(vec![
            vrp("2001:db8::/32", 48, 64496),
        ]);
        let res = validator.validate(v6("2001:db8:1::/48"), 64496.into());
        assert_eq!(res.state, RpkiState::Valid);
        let res = validator.validate(v6("2001:db8::/32"), 64496.into());
        assert_eq!(res.state, RpkiState::Valid);
        // Same origin, beyond the maximum length: nothing covers it
        // with a foreign origin, so NotFound rather than Invalid.
        let res = validator.validate(v6("2001:db8::/64"), 64496.into());
        assert_eq!(res.state, RpkiState::NotFound);
        let res = validator.validate(v6("2001:db8::/64"), 64497.into());
        assert_eq!(res.state, RpkiState::Invalid);
    }

    #[test]
    fn allowlist_flips_invalid() {
        let mut allowlist = HashSet::new();
        allowlist.insert((v4("192.0.2.0/24"), Asn::from_u32(64497)));
        let validator = RpkiValidator::from_parts(
            VrpIndex::from_vrps(vec![vrp("192.0.2.0/24", 24, 64496)]),
            allowlist, false, true
        );

        let res = validator.validate(v4("192.0.2.0/24"), 64497.into());
        assert_eq!(res.state, RpkiState::Valid);
        assert!(res.allowlisted);

        // The allowlist never upgrades NotFound.
        let res = validator.validate(v4("203.0.113.0/24"), 64497.into());
        assert_eq!(res.state, RpkiState::NotFound);
        assert!(!res.allowlisted);
    }

    #[test]
    fn stale_fail_closed_errors_every_query() {
        let validator = RpkiValidator::from_parts(
            VrpIndex::from_vrps(vec![vrp("192.0.2.0/24", 24, 64496)]),
            HashSet::new(), true, true
        );
        let res = validator.validate(v4("192.0.2.0/24"), 64496.into());
        assert_eq!(res.state, RpkiState::Error);
    }

    #[test]
    fn stale_fail_open_still_validates() {
        let validator = RpkiValidator::from_parts(
            VrpIndex::from_vrps(vec![vrp("192.0.2.0/24", 24, 64496)]),
            HashSet::new(), true, false
        );
        let res = validator.validate(v4("192.0.2.0/24"), 64496.into());
        assert_eq!(res.state, RpkiState::Valid);
    }

    #[test]
    fn batch_preserves_order() {
        let validator = validator(vec![
            vrp("192.0.2.0/24", 24, 64496),
        ]);
        // Enough prefixes to trigger the parallel path.
        let mut prefixes = Vec::new();
        for i in 0..64u32 {
            prefixes.push(v4(&format!("10.{}.0.0/16", i)));
        }
        prefixes.push(v4("192.0.2.0/24"));
        let results = validator.validate_prefixes(
            &prefixes, 64496.into(), None
        );
        assert_eq!(results.len(), prefixes.len());
        for (result, prefix) in results.iter().zip(prefixes.iter()) {
            assert_eq!(result.prefix, *prefix);
        }
        assert_eq!(results.last().unwrap().state, RpkiState::Valid);
        assert_eq!(results[0].state, RpkiState::NotFound);
    }

    #[test]
    fn stats_single_pass() {
        let validator = validator(vec![
            vrp("192.0.2.0/24", 24, 64496),
        ]);
        let results = vec![
            validator.validate(v4("192.0.2.0/24"), 64496.into()),
            validator.validate(v4("192.0.2.0/24"), 64497.into()),
            validator.validate(v4("203.0.113.0/24"), 64496.into()),
        ];
        let stats = ValidationStats::from_results(&results);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.error, 0);
        assert_eq!(stats.total, 3);
        assert!((stats.invalid_percent() - 33.33).abs() < 0.1);
    }

    #[test]
    fn vrp_file_formats() {
        let dir = tempfile::tempdir().unwrap();

        // rpki-client / Routinator wrapper, string and numeric ASNs.
        let path = dir.path().join("wrapped.json");
        std::fs::write(&path, r#"{
            "roas": [
                {"asn": "AS64496", "prefix": "192.0.2.0/24",
                 "maxLength": 24, "ta": "ripe"},
                {"asn": 64497, "prefix": "2001:db8::/32",
                 "maxLength": 48}
            ]
        }"#).unwrap();
        let vrps = load_vrps(&path).unwrap();
        assert_eq!(vrps.len(), 2);
        assert_eq!(vrps[0].origin_as, Asn::from_u32(64496));
        assert_eq!(vrps[0].trust_anchor.as_deref(), Some("ripe"));
        assert_eq!(vrps[1].origin_as, Asn::from_u32(64497));

        // Bare array.
        let path = dir.path().join("bare.json");
        std::fs::write(&path, r#"[
            {"asn": 64496, "prefix": "192.0.2.0/24", "maxLength": 24}
        ]"#).unwrap();
        assert_eq!(load_vrps(&path).unwrap().len(), 1);

        // Malformed entries are skipped, not fatal.
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{
            "roas": [
                {"asn": 64496, "prefix": "not-a-prefix", "maxLength": 24},
                {"asn": 64496, "prefix": "192.0.2.0/24", "maxLength": 8},
                {"asn": 64496, "prefix": "192.0.2.0/24", "maxLength": 24}
            ]
        }"#).unwrap();
        assert_eq!(load_vrps(&path).unwrap().len(), 1);

        // Garbage is fatal.
        let path = dir.path().join("garbage.json");
        std::fs::write(&path, "nope").unwrap();
        assert!(load_vrps(&path).is_err());
    }

    #[test]
    fn allowlist_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowlist");
        std::fs::write(&path, "\
            # pairs we accept despite invalid state\n\
            192.0.2.0/24 AS64497\n\
            \n\
            2001:db8::/32 64498\n\
        ").unwrap();
        let allowlist = load_allowlist(&path).unwrap();
        assert_eq!(allowlist.len(), 2);
        assert!(allowlist.contains(
            &(v4("192.0.2.0/24"), Asn::from_u32(64497))
        ));

        // Anything but 'prefix asn' is rejected.
        std::fs::write(&path, "192.0.2.0/24 AS64497 extra\n").unwrap();
        assert!(load_allowlist(&path).is_err());
        std::fs::write(&path, "just-one-field\n").unwrap();
        assert!(load_allowlist(&path).is_err());
    }

    #[test]
    fn chunk_size_grows_sublinearly() {
        assert_eq!(chunk_size_for(100), 40);
        assert_eq!(chunk_size_for(10000), 400);
        // Non-perfect squares round the root up, not down.
        assert_eq!(chunk_size_for(20), 20);
        assert_eq!(chunk_size_for(101), 44);
        assert!(chunk_size_for(11) >= SEQUENTIAL_LIMIT);
    }
}
