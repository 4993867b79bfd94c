//! Generating prefix-list policies with bgpq4.
//!
//! The generator wraps the external `bgpq4` binary. Every invocation is
//! preceded by validation of the AS number and policy name, the argv is
//! assembled as a vector with no shell anywhere, and each run is bounded
//! by a timeout. Results are cached on disk keyed by everything that
//! influences the output.
//!
//! Batch generation fans out over a bounded worker pool with one child
//! process per AS, so a crash of one run cannot touch another. The batch
//! result preserves input order; a failed slot carries its error record.

pub mod cache;

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use crossbeam_queue::SegQueue;
use crossbeam_utils::thread;
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command as AsyncCommand;
use crate::asn::Asn;
use crate::config::{Bgpq4Conf, Bgpq4Mode, Config};
use crate::error::Failed;
use crate::proxy::ProxyManager;
use crate::utils::sync::{Cancel, Mutex};
use self::cache::{CacheKey, PolicyCache};


//------------ Constants -----------------------------------------------------

/// The maximum length of a policy name.
const MAX_POLICY_NAME_LEN: usize = 64;

/// Hard ceiling of the generation worker pool.
const MAX_WORKERS: usize = 8;

/// Batch sizes up to this run sequentially.
const SEQUENTIAL_LIMIT: usize = 2;

/// The container image used by the docker and podman backends.
const CONTAINER_IMAGE: &str = "ghcr.io/bgp/bgpq4:latest";


//------------ PrefixListPolicy ----------------------------------------------

/// A generated prefix-list policy for one AS.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct PrefixListPolicy {
    /// The AS number the policy was generated for.
    pub as_number: Asn,

    /// The sanitized policy name.
    pub policy_name: String,

    /// The verbatim stdout of the successful bgpq4 invocation.
    ///
    /// May be empty: an AS without registered routes yields an empty
    /// prefix-list body, which is a success, not a failure.
    pub content: String,

    /// When the policy was generated.
    pub generated_at: DateTime<Utc>,

    /// The cache key the policy is stored under.
    pub cache_key: String,
}


//------------ GenerateFailure -----------------------------------------------

/// Why generating a policy failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GenerateFailure {
    /// The input was not a 32-bit unsigned integer.
    AsOutOfRange(String),

    /// The supplied policy name failed validation.
    BadPolicyName(String),

    /// The bgpq4 invocation exceeded its timeout.
    Timeout,

    /// A required IRR proxy tunnel was unavailable.
    ProxyUnavailable(String),

    /// bgpq4 exited unsuccessfully.
    CommandFailed(String),
}

impl GenerateFailure {
    /// Returns the stable code of the failure kind.
    pub fn code(&self) -> &'static str {
        match self {
            GenerateFailure::AsOutOfRange(_) => "AS_OUT_OF_RANGE",
            GenerateFailure::BadPolicyName(_) => "BAD_POLICY_NAME",
            GenerateFailure::Timeout => "BGPQ4_TIMEOUT",
            GenerateFailure::ProxyUnavailable(_) => "PROXY_UNAVAILABLE",
            GenerateFailure::CommandFailed(_) => "BGPQ4_FAILED",
        }
    }
}

impl fmt::Display for GenerateFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GenerateFailure::AsOutOfRange(input) => {
                write!(f, "{}: '{}'", self.code(), input)
            }
            GenerateFailure::BadPolicyName(name) => {
                write!(f, "{}: '{}'", self.code(), name)
            }
            GenerateFailure::Timeout => f.write_str(self.code()),
            GenerateFailure::ProxyUnavailable(detail)
            | GenerateFailure::CommandFailed(detail) => {
                write!(f, "{}: {}", self.code(), detail)
            }
        }
    }
}


//------------ BatchTarget ---------------------------------------------------

/// One slot of a generation batch.
///
/// Carries the raw input so that a validation failure can reference it,
/// and the parse outcome so that no subprocess is ever started for an
/// invalid slot.
#[derive(Clone, Debug)]
pub struct BatchTarget {
    /// The raw input as given.
    pub input: String,

    /// The validated AS number, or the validation failure.
    pub parsed: Result<Asn, GenerateFailure>,
}

impl BatchTarget {
    /// Creates a target from a raw text input.
    ///
    /// Floats, negative numbers, and values above 2³²−1 are rejected.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();
        let digits = if trimmed.len() > 2
            && trimmed[..2].eq_ignore_ascii_case("as")
        {
            &trimmed[2..]
        }
        else {
            trimmed
        };
        let parsed = if digits.is_empty()
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            Err(GenerateFailure::AsOutOfRange(trimmed.into()))
        }
        else {
            match digits.parse::<u32>() {
                Ok(value) => Ok(Asn::from_u32(value)),
                Err(_) => {
                    Err(GenerateFailure::AsOutOfRange(trimmed.into()))
                }
            }
        };
        BatchTarget { input: trimmed.into(), parsed }
    }

    /// Creates a target from an already validated AS number.
    pub fn from_asn(asn: Asn) -> Self {
        BatchTarget {
            input: asn.to_string(),
            parsed: Ok(asn),
        }
    }
}


//------------ BatchEntry ----------------------------------------------------

/// The outcome of one slot of a generation batch.
#[derive(Clone, Debug)]
pub struct BatchEntry {
    /// The raw input of the slot.
    pub input: String,

    /// The generated policy or the failure record.
    pub result: Result<PrefixListPolicy, GenerateFailure>,
}


//------------ BatchStats ----------------------------------------------------

/// Aggregate statistics over a generation batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchStats {
    /// The number of policies generated, including cache hits.
    pub generated: usize,

    /// The number of failed slots.
    pub failed: usize,

    /// The wall-clock duration of the batch.
    pub duration: std::time::Duration,
}


//------------ BatchResult ---------------------------------------------------

/// The outcome of a generation batch.
///
/// The entries preserve input order and the result has exactly one entry
/// per input slot.
#[derive(Clone, Debug)]
pub struct BatchResult {
    /// Per-slot outcomes in input order.
    pub entries: Vec<BatchEntry>,

    /// Aggregate statistics.
    pub stats: BatchStats,
}

impl BatchResult {
    /// Returns an iterator over the successfully generated policies.
    pub fn policies(&self) -> impl Iterator<Item = &PrefixListPolicy> {
        self.entries.iter().filter_map(|entry| entry.result.as_ref().ok())
    }
}


//------------ Generator -----------------------------------------------------

/// Generates prefix-list policies by invoking bgpq4.
pub struct Generator {
    /// The prepared bgpq4 command.
    command: Bgpq4Command,

    /// The policy cache.
    cache: PolicyCache,

    /// The configuration slice.
    conf: Bgpq4Conf,

    /// The IRR proxy, if one is in use.
    proxy: Option<Arc<ProxyManager>>,
}

impl Generator {
    /// Creates a new generator.
    ///
    /// Probes the configured backend once; an unusable backend is a
    /// startup error, not a per-AS failure.
    pub fn new(
        config: &Config,
        proxy: Option<Arc<ProxyManager>>,
    ) -> Result<Self, Failed> {
        Ok(Generator {
            command: Bgpq4Command::new(&config.bgpq4)?,
            cache: PolicyCache::new(&config.cache_dir)?,
            conf: config.bgpq4.clone(),
            proxy,
        })
    }

    /// Returns the default policy name for an AS.
    pub fn default_policy_name(asn: Asn) -> String {
        format!("AS{}", asn.into_u32())
    }

    /// Validates a user-supplied policy name.
    pub fn validate_policy_name(name: &str) -> Result<(), GenerateFailure> {
        if name.is_empty()
            || name.len() > MAX_POLICY_NAME_LEN
            || !name.bytes().all(|b| {
                b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
            })
        {
            Err(GenerateFailure::BadPolicyName(name.into()))
        }
        else {
            Ok(())
        }
    }

    /// Generates the policy for a single AS.
    pub fn generate_one(
        &self,
        asn: Asn,
        policy_name: Option<&str>,
    ) -> Result<PrefixListPolicy, GenerateFailure> {
        let policy_name = match policy_name {
            Some(name) => {
                Self::validate_policy_name(name)?;
                name.to_string()
            }
            None => Self::default_policy_name(asn),
        };

        let key = CacheKey::new(
            asn, &policy_name, &self.command.mode_tag(),
            &self.conf.irr_source, self.conf.aggregate,
            self.conf.ipv4_enabled, self.conf.ipv6_enabled,
            self.command.version_tag(),
        );
        if let Some(policy) = self.cache.load(&key) {
            if policy.as_number == asn && policy.policy_name == policy_name {
                return Ok(policy)
            }
            warn!(
                "Cache entry for {} failed re-validation. Regenerating.",
                asn
            );
        }

        // One bgpq4 invocation per enabled address family. When both
        // families are on, the IPv6 list gets a name suffix so the two
        // prefix-lists don’t collide on the router.
        let mut content = String::new();
        if self.conf.ipv4_enabled || !self.conf.ipv6_enabled {
            let args = self.build_args(asn, &policy_name, "-4")?;
            content.push_str(&self.command.run(asn, args)?);
        }
        if self.conf.ipv6_enabled {
            let v6_name = if self.conf.ipv4_enabled {
                format!("{}-v6", policy_name)
            }
            else {
                policy_name.clone()
            };
            let args = self.build_args(asn, &v6_name, "-6")?;
            content.push_str(&self.command.run(asn, args)?);
        }
        let policy = PrefixListPolicy {
            as_number: asn,
            policy_name,
            content,
            generated_at: Utc::now(),
            cache_key: key.as_str().into(),
        };
        if self.cache.store(&key, &policy).is_err() {
            // A failed cache write only costs the next run a regeneration.
            warn!("Failed to cache policy for {}.", asn);
        }
        Ok(policy)
    }

    /// Assembles the bgpq4 arguments for one AS and address family.
    fn build_args(
        &self, asn: Asn, policy_name: &str, family: &str
    ) -> Result<Vec<String>, GenerateFailure> {
        let mut args: Vec<String> = Vec::new();
        args.push("-J".into());
        args.push(family.into());
        if self.conf.aggregate {
            args.push("-A".into());
        }
        args.push("-S".into());
        args.push(self.conf.irr_source.clone());
        args.push("-h".into());
        args.push(irr_host_of_source(&self.conf.irr_source).into());
        args.push("-l".into());
        args.push(policy_name.into());
        args.push(format!("AS{}", asn.into_u32()));

        match self.proxy.as_ref() {
            Some(proxy) => {
                let server = irr_host_of_source(&self.conf.irr_source);
                match proxy.wrap_bgpq4_args(&args, server) {
                    Ok(args) => Ok(args),
                    Err(err) => {
                        if proxy.allow_direct_fallback() {
                            warn!(
                                "IRR tunnel '{}' unavailable ({}); \
                                 falling back to direct access.",
                                err.tunnel, err.reason
                            );
                            Ok(args)
                        }
                        else {
                            Err(GenerateFailure::ProxyUnavailable(
                                format!("{}: {}", err.tunnel, err.reason)
                            ))
                        }
                    }
                }
            }
            None => Ok(args)
        }
    }

    /// Generates policies for a whole batch of targets.
    ///
    /// The pool size is `min(cpus, 8, targets)` unless overridden; small
    /// batches run sequentially since pool overhead dominates them. The
    /// result preserves input order. Invalid slots never reach a
    /// subprocess.
    pub fn generate_batch(
        &self,
        targets: Vec<BatchTarget>,
        cancel: &Cancel,
    ) -> BatchResult {
        let start = Instant::now();
        let worker_target = self.conf.max_workers
            .unwrap_or_else(|| num_cpus::get().min(MAX_WORKERS));
        let workers = worker_target.min(targets.len()).max(1);

        let entries = if targets.len() <= SEQUENTIAL_LIMIT || workers == 1 {
            targets.into_iter().map(|target| {
                self.generate_slot(target, cancel)
            }).collect()
        }
        else {
            self.generate_parallel(targets, workers, cancel)
        };

        let mut stats = BatchStats {
            duration: start.elapsed(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.result {
                Ok(_) => stats.generated += 1,
                Err(_) => stats.failed += 1,
            }
        }
        info!(
            "Generated {} policies ({} failures) in {:.1}s.",
            stats.generated, stats.failed,
            stats.duration.as_secs_f64()
        );
        BatchResult { entries, stats }
    }

    /// Runs a batch over the worker pool.
    fn generate_parallel(
        &self,
        targets: Vec<BatchTarget>,
        workers: usize,
        cancel: &Cancel,
    ) -> Vec<BatchEntry> {
        let tasks = SegQueue::new();
        let count = targets.len();
        for (index, target) in targets.into_iter().enumerate() {
            tasks.push((index, target));
        }
        let slots: Mutex<Vec<Option<BatchEntry>>> =
            Mutex::new((0..count).map(|_| None).collect());

        let res = thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    while let Some((index, target)) = tasks.pop() {
                        let entry = self.generate_slot(target, cancel);
                        slots.lock()[index] = Some(entry);
                    }
                });
            }
        });
        if res.is_err() {
            error!(
                "Generator failed after a worker thread has panicked. \
                 This is most assuredly a bug."
            );
        }

        slots.into_inner().into_iter()
            .map(|slot| slot.expect("all slots filled"))
            .collect()
    }

    /// Processes a single batch slot.
    fn generate_slot(
        &self,
        target: BatchTarget,
        cancel: &Cancel,
    ) -> BatchEntry {
        let result = match target.parsed {
            Ok(asn) => {
                if cancel.is_tripped() {
                    Err(GenerateFailure::CommandFailed(
                        "run canceled".into()
                    ))
                }
                else {
                    self.generate_one(asn, None)
                }
            }
            Err(err) => Err(err),
        };
        BatchEntry { input: target.input, result }
    }
}


//------------ Bgpq4Command --------------------------------------------------

/// The command to run bgpq4.
#[derive(Clone, Debug)]
struct Bgpq4Command {
    /// The resolved execution mode. Never `Auto`.
    mode: Bgpq4Mode,

    /// The program to execute.
    program: String,

    /// A fixed argv prefix, used by the container backends.
    prefix: Vec<String>,

    /// A tag identifying the backend version for the cache key.
    version: String,

    /// The invocation timeout.
    timeout: std::time::Duration,
}

impl Bgpq4Command {
    /// Creates a new bgpq4 command from the config.
    ///
    /// Probes the backend once. With mode `Auto`, the native binary is
    /// preferred and the container runtimes are tried in order.
    pub fn new(conf: &Bgpq4Conf) -> Result<Self, Failed> {
        let candidates: &[Bgpq4Mode] = match conf.mode {
            Bgpq4Mode::Auto => &[
                Bgpq4Mode::Native, Bgpq4Mode::Docker, Bgpq4Mode::Podman
            ],
            Bgpq4Mode::Native => &[Bgpq4Mode::Native],
            Bgpq4Mode::Docker => &[Bgpq4Mode::Docker],
            Bgpq4Mode::Podman => &[Bgpq4Mode::Podman],
        };
        for mode in candidates {
            if let Some(version) = Self::probe(*mode) {
                let (program, prefix) = Self::argv_prefix(*mode);
                debug!(
                    "Using bgpq4 backend '{}' ({}).", mode, version
                );
                return Ok(Bgpq4Command {
                    mode: *mode,
                    program,
                    prefix,
                    version,
                    timeout: conf.timeout,
                })
            }
        }
        error!(
            "No usable bgpq4 backend found for mode '{}'.", conf.mode
        );
        Err(Failed)
    }

    /// Probes a backend and returns its version tag if usable.
    fn probe(mode: Bgpq4Mode) -> Option<String> {
        let output = match mode {
            Bgpq4Mode::Native => {
                // bgpq4 with no arguments prints its usage, version
                // included, and exits unsuccessfully. A failure to spawn
                // is what marks the backend unusable.
                std::process::Command::new("bgpq4")
                    .stdin(Stdio::null())
                    .output().ok()?
            }
            Bgpq4Mode::Docker => {
                std::process::Command::new("docker")
                    .arg("--version")
                    .stdin(Stdio::null())
                    .output().ok()?
            }
            Bgpq4Mode::Podman => {
                std::process::Command::new("podman")
                    .arg("--version")
                    .stdin(Stdio::null())
                    .output().ok()?
            }
            Bgpq4Mode::Auto => return None,
        };
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );
        let hash = ring::digest::digest(
            &ring::digest::SHA256, text.as_bytes()
        );
        let mut tag = String::new();
        for byte in &hash.as_ref()[..8] {
            use std::fmt::Write;
            write!(tag, "{:02x}", byte).expect("writing to string");
        }
        Some(tag)
    }

    /// Returns program and argv prefix for a mode.
    fn argv_prefix(mode: Bgpq4Mode) -> (String, Vec<String>) {
        match mode {
            Bgpq4Mode::Native | Bgpq4Mode::Auto => {
                ("bgpq4".into(), Vec::new())
            }
            Bgpq4Mode::Docker => {
                ("docker".into(), vec![
                    "run".into(), "--rm".into(), CONTAINER_IMAGE.into()
                ])
            }
            Bgpq4Mode::Podman => {
                ("podman".into(), vec![
                    "run".into(), "--rm".into(), CONTAINER_IMAGE.into()
                ])
            }
        }
    }

    /// Returns the resolved mode as a cache key component.
    fn mode_tag(&self) -> String {
        self.mode.to_string()
    }

    /// Returns the version tag for the cache key.
    fn version_tag(&self) -> &str {
        &self.version
    }

    /// Runs bgpq4 with the given arguments and returns its stdout.
    ///
    /// One child per call. Exceeding the timeout kills the child and
    /// yields [`GenerateFailure::Timeout`].
    fn run(
        &self, asn: Asn, args: Vec<String>
    ) -> Result<String, GenerateFailure> {
        // Because we can’t have a timeout on a child process with just std,
        // we resort to Tokio here: We fire up a current-thread runtime and
        // use Tokio’s async process handling.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| GenerateFailure::CommandFailed(
                format!("failed to create runtime: {}", err)
            ))?;

        runtime.block_on(async {
            let mut command = AsyncCommand::new(&self.program);
            command.args(&self.prefix);
            command.args(&args);
            command.stdin(Stdio::null());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            command.kill_on_drop(true);

            let mut child = command.spawn().map_err(|err| {
                GenerateFailure::CommandFailed(
                    format!("failed to spawn {}: {}", self.program, err)
                )
            })?;
            let mut stdout_pipe =
                child.stdout.take().expect("piped stdout");
            let mut stderr_pipe =
                child.stderr.take().expect("piped stderr");

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let waited = tokio::time::timeout(self.timeout, async {
                tokio::try_join!(
                    child.wait(),
                    stdout_pipe.read_to_end(&mut stdout),
                    stderr_pipe.read_to_end(&mut stderr),
                )
            }).await;

            let status = match waited {
                Ok(Ok((status, _, _))) => status,
                Ok(Err(err)) => {
                    return Err(GenerateFailure::CommandFailed(
                        format!("waiting for bgpq4 failed: {}", err)
                    ))
                }
                Err(_) => {
                    if let Err(err) = child.kill().await {
                        warn!(
                            "{}: failed to kill bgpq4 process: {}",
                            asn, err
                        );
                    }
                    return Err(GenerateFailure::Timeout)
                }
            };

            if status.success() {
                String::from_utf8(stdout).map_err(|_| {
                    GenerateFailure::CommandFailed(
                        "bgpq4 output was not valid UTF-8".into()
                    )
                })
            }
            else {
                let stderr = String::from_utf8_lossy(&stderr);
                let detail = stderr.lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .unwrap_or("bgpq4 exited unsuccessfully");
                Err(GenerateFailure::CommandFailed(detail.into()))
            }
        })
    }
}


//------------ irr_host_of_source --------------------------------------------

/// Returns the whois host queried for an IRR source list.
///
/// bgpq4 resolves sources itself when talking to RADB’s mirror, which is
/// also the default host bgpq4 ships with.
fn irr_host_of_source(_source: &str) -> &'static str {
    "whois.radb.net"
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn policy_name_validation() {
        assert!(Generator::validate_policy_name("AS13335").is_ok());
        assert!(Generator::validate_policy_name("AS13335-v4_in").is_ok());
        assert!(Generator::validate_policy_name("").is_err());
        assert!(Generator::validate_policy_name("bad name").is_err());
        assert!(Generator::validate_policy_name("semi;colon").is_err());
        assert!(Generator::validate_policy_name(
            &"x".repeat(MAX_POLICY_NAME_LEN + 1)
        ).is_err());
        assert!(Generator::validate_policy_name(
            &"x".repeat(MAX_POLICY_NAME_LEN)
        ).is_ok());
    }

    #[test]
    fn default_policy_name_is_derived() {
        assert_eq!(
            Generator::default_policy_name(Asn::from_u32(13335)),
            "AS13335"
        );
    }

    #[test]
    fn batch_targets_reject_bad_input() {
        assert!(BatchTarget::from_input("13335").parsed.is_ok());
        assert!(BatchTarget::from_input("AS13335").parsed.is_ok());
        assert!(BatchTarget::from_input("  13335  ").parsed.is_ok());
        assert_eq!(
            BatchTarget::from_input("4294967295").parsed,
            Ok(Asn::from_u32(u32::MAX))
        );

        for input in ["4294967296", "-1", "13335.5", "", "cloudflare"] {
            let target = BatchTarget::from_input(input);
            match target.parsed {
                Err(GenerateFailure::AsOutOfRange(_)) => { }
                other => panic!("{}: unexpected {:?}", input, other),
            }
        }
    }

    #[test]
    fn batch_target_keeps_raw_input() {
        let target = BatchTarget::from_input("4294967296");
        assert_eq!(target.input, "4294967296");
    }
}
