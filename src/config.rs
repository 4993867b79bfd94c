//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used. It can be loaded both from a TOML formatted config
//! file and command line options.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use clap::{App, Arg, ArgMatches};
use log::{LevelFilter, error, warn};
#[cfg(unix)] use syslog::Facility;
use crate::error::Failed;


//------------ Defaults ------------------------------------------------------

/// The default maximum number of concurrent SSH sessions.
const DEFAULT_SSH_WORKERS: usize = 5;

/// The default SSH connect timeout.
const DEFAULT_SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The default SSH command timeout.
const DEFAULT_SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// The default timeout for a single bgpq4 invocation.
const DEFAULT_BGPQ4_TIMEOUT: Duration = Duration::from_secs(45);

/// The default timeout for a single NETCONF operation.
const DEFAULT_NETCONF_TIMEOUT: Duration = Duration::from_secs(60);

/// The default NETCONF port on Junos devices.
const DEFAULT_NETCONF_PORT: u16 = 830;

/// The default confirmed-commit timer in minutes.
const DEFAULT_CONFIRMED_COMMIT_MINUTES: u8 = 5;

/// The default commit comment prefix.
const DEFAULT_COMMIT_COMMENT_PREFIX: &str = "[Otto BGP]";

/// The default maximum age of the VRP cache in hours.
const DEFAULT_MAX_VRP_AGE_HOURS: u64 = 24;

/// The name of the default config file under the base directory.
const CONFIG_FILE_NAME: &str = "otto-bgp.conf";


//------------ Config --------------------------------------------------------

/// Otto BGP configuration.
///
/// The configuration is assembled in three layers: built-in defaults, an
/// optional TOML config file, and command line options, each overriding
/// the previous one. After assembly the value is immutable; subsystems
/// receive the sections they need by reference.
#[derive(Clone, Debug)]
pub struct Config {
    /// Operational mode.
    pub mode: Mode,

    /// Path to the directory output artifacts are written below.
    ///
    /// Policies go to `policies/`, discovery artifacts to `discovered/`,
    /// reports to `reports/`.
    pub output_dir: PathBuf,

    /// Path to the directory that contains the policy cache.
    pub cache_dir: PathBuf,

    /// Path of the concurrent-run lock file.
    pub lock_file: PathBuf,

    /// The log levels to be logged.
    pub log_level: LevelFilter,

    /// The target to log to.
    pub log_target: LogTarget,

    /// Whether router payloads include import-policy chain stubs.
    pub include_import_chains: bool,

    /// SSH collection settings.
    pub ssh: SshConf,

    /// bgpq4 invocation settings.
    pub bgpq4: Bgpq4Conf,

    /// RPKI validation settings.
    pub rpki: RpkiConf,

    /// Guardrail settings.
    pub guardrails: GuardrailConf,

    /// NETCONF apply settings.
    pub netconf: NetconfConf,

    /// IRR proxy settings.
    pub irr_proxy: IrrProxyConf,
}

impl Config {
    /// Adds the basic arguments to a clap app.
    ///
    /// The function follows clap’s builder pattern: it takes an app,
    /// adds a bunch of arguments to it and returns it at the end.
    pub fn config_args<'a: 'b, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app
        .arg(Arg::with_name("config")
             .short("c")
             .long("config")
             .takes_value(true)
             .value_name("PATH")
             .help("Read base configuration from this file")
        )
        .arg(Arg::with_name("mode")
             .long("mode")
             .takes_value(true)
             .possible_values(&["system", "autonomous"])
             .help("Operational mode")
        )
        .arg(Arg::with_name("output-dir")
             .long("output-dir")
             .takes_value(true)
             .value_name("DIR")
             .help("Directory to write artifacts below")
        )
        .arg(Arg::with_name("cache-dir")
             .long("cache-dir")
             .takes_value(true)
             .value_name("DIR")
             .help("Directory for the policy cache")
        )
        .arg(Arg::with_name("lock-file")
             .long("lock-file")
             .takes_value(true)
             .value_name("PATH")
             .help("Path of the concurrent-run lock file")
        )
        .arg(Arg::with_name("verbose")
             .short("v")
             .long("verbose")
             .multiple(true)
             .help("Log more information, twice for even more")
        )
        .arg(Arg::with_name("quiet")
             .short("q")
             .long("quiet")
             .multiple(true)
             .conflicts_with("verbose")
             .help("Log less information, twice for no information")
        )
        .arg(Arg::with_name("logfile")
             .long("logfile")
             .takes_value(true)
             .value_name("PATH")
             .help("Log to this file")
        )
        .arg(Arg::with_name("syslog")
             .long("syslog")
             .help("Log to syslog")
        )
        .arg(Arg::with_name("syslog-facility")
             .long("syslog-facility")
             .takes_value(true)
             .default_value("daemon")
             .help("Facility to use for syslog logging")
        )
    }

    /// Creates a configuration from command line matches.
    ///
    /// The function attempts to create configuration from the command line
    /// arguments provided via `matches`. It will try to read a config file
    /// if provided via the config file option (`-c` or `--config`) or a
    /// file in the default location otherwise. It will then apply all
    /// command line options to the resulting value.
    ///
    /// If you are running in a non-daemon mode, you might want to call
    /// [`switch_logging`][crate::log::Logger::switch_logging] with the
    /// resulting config.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = match matches.value_of("config") {
            Some(path) => {
                Self::from_config_file(
                    ConfigFile::read(&cur_dir.join(path))?
                )?
            }
            None => {
                let path = Self::default_config_path().join(CONFIG_FILE_NAME);
                match ConfigFile::try_read(&path)? {
                    Some(file) => Self::from_config_file(file)?,
                    None => Self::default_with_paths(
                        Self::default_config_path()
                    ),
                }
            }
        };
        res.apply_arg_matches(matches, cur_dir)?;
        Ok(res)
    }

    /// Applies the basic command line arguments to the configuration.
    fn apply_arg_matches(
        &mut self,
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        if let Some(value) = matches.value_of("mode") {
            self.mode = Mode::from_str(value).map_err(|_| {
                error!("Invalid mode '{}'.", value);
                Failed
            })?;
        }
        if let Some(dir) = matches.value_of("output-dir") {
            self.output_dir = cur_dir.join(dir);
        }
        if let Some(dir) = matches.value_of("cache-dir") {
            self.cache_dir = cur_dir.join(dir);
        }
        if let Some(path) = matches.value_of("lock-file") {
            self.lock_file = cur_dir.join(path);
        }
        self.apply_log_matches(matches, cur_dir)?;
        Ok(())
    }

    /// Applies the logging-related command line arguments.
    fn apply_log_matches(
        &mut self,
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        match (
            matches.occurrences_of("verbose"),
            matches.occurrences_of("quiet")
        ) {
            (0, 0) => { }
            (1, 0) => self.log_level = LevelFilter::Info,
            (_, 0) => self.log_level = LevelFilter::Debug,
            (0, 1) => self.log_level = LevelFilter::Error,
            (0, _) => self.log_level = LevelFilter::Off,
            _ => { }
        }

        #[cfg(unix)]
        if matches.is_present("syslog") {
            let facility = matches.value_of("syslog-facility").unwrap();
            self.log_target = LogTarget::Syslog(
                parse_syslog_facility(facility)?
            );
        }
        if let Some(path) = matches.value_of("logfile") {
            if path == "-" {
                self.log_target = LogTarget::Stderr;
            }
            else {
                self.log_target = LogTarget::File(cur_dir.join(path));
            }
        }
        Ok(())
    }

    /// Creates the correct base configuration for the given config file.
    fn from_config_file(mut file: ConfigFile) -> Result<Self, Failed> {
        let base_dir = file.dir.clone();
        let log_target = Self::log_target_from_config_file(&mut file)?;
        let res = Config {
            mode: file.take_from_str("mode")?.unwrap_or(Mode::System),
            output_dir: file.take_path("output-dir")?.unwrap_or_else(|| {
                base_dir.join("output")
            }),
            cache_dir: file.take_path("cache-dir")?.unwrap_or_else(|| {
                base_dir.join("cache")
            }),
            lock_file: file.take_path("lock-file")?.unwrap_or_else(|| {
                PathBuf::from("/var/run/otto-bgp.lock")
            }),
            log_level: {
                file.take_from_str("log-level")?
                    .unwrap_or(LevelFilter::Warn)
            },
            log_target,
            include_import_chains: file
                .take_bool("include-import-chains")?
                .unwrap_or(false),
            ssh: SshConf::from_config_file(&mut file)?,
            bgpq4: Bgpq4Conf::from_config_file(&mut file)?,
            rpki: RpkiConf::from_config_file(&mut file)?,
            guardrails: GuardrailConf::from_config_file(&mut file)?,
            netconf: NetconfConf::from_config_file(&mut file)?,
            irr_proxy: IrrProxyConf::from_config_file(&mut file)?,
        };
        file.check_exhausted()?;
        Ok(res)
    }

    /// Determines the log target from the config file.
    fn log_target_from_config_file(
        file: &mut ConfigFile
    ) -> Result<LogTarget, Failed> {
        let target = file.take_string("log")?;
        match target.as_deref() {
            #[cfg(unix)]
            Some("syslog") => {
                let facility = file.take_string("syslog-facility")?;
                let facility = match facility.as_deref() {
                    Some(value) => parse_syslog_facility(value)?,
                    None => Facility::LOG_DAEMON,
                };
                Ok(LogTarget::Syslog(facility))
            }
            Some("stderr") => Ok(LogTarget::Stderr),
            Some("file") => {
                match file.take_path("log-file")? {
                    Some(path) => Ok(LogTarget::File(path)),
                    None => {
                        error!(
                            "Failed in config file {}: \
                             log target \"file\" requires 'log-file'.",
                            file.path.display()
                        );
                        Err(Failed)
                    }
                }
            }
            Some(value) => {
                error!(
                    "Failed in config file {}: invalid log target '{}'.",
                    file.path.display(), value
                );
                Err(Failed)
            }
            None => Ok(LogTarget::default())
        }
    }

    /// Creates a default config with the given base paths.
    fn default_with_paths(base_dir: PathBuf) -> Self {
        Config {
            mode: Mode::System,
            output_dir: base_dir.join("output"),
            cache_dir: base_dir.join("cache"),
            lock_file: PathBuf::from("/var/run/otto-bgp.lock"),
            log_level: LevelFilter::Warn,
            log_target: LogTarget::default(),
            include_import_chains: false,
            ssh: SshConf::default(),
            bgpq4: Bgpq4Conf::default(),
            rpki: RpkiConf::default(),
            guardrails: GuardrailConf::default(),
            netconf: NetconfConf::default(),
            irr_proxy: IrrProxyConf::default(),
        }
    }

    /// Returns the default directory for config and state.
    fn default_config_path() -> PathBuf {
        match dirs::home_dir() {
            Some(dir) => dir.join(".otto-bgp"),
            None => PathBuf::from(".otto-bgp"),
        }
    }

    /// Returns the directory per-router policies are written below.
    pub fn policies_dir(&self) -> PathBuf {
        self.output_dir.join("policies")
    }

    /// Returns the directory discovery artifacts are written below.
    pub fn discovered_dir(&self) -> PathBuf {
        self.output_dir.join("discovered")
    }

    /// Returns the directory reports are written below.
    pub fn reports_dir(&self) -> PathBuf {
        self.output_dir.join("reports")
    }

    /// Returns the path of the audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.output_dir.join("audit.jsonl")
    }
}


//------------ Mode ----------------------------------------------------------

/// The operational mode of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Interactive operation with manual confirmation at apply time.
    System,

    /// Unattended operation with stricter guardrail thresholds.
    Autonomous,
}

impl Mode {
    /// Returns whether the mode is autonomous.
    pub fn is_autonomous(self) -> bool {
        matches!(self, Mode::Autonomous)
    }
}

impl FromStr for Mode {
    type Err = InvalidValue;

    fn from_str(value: &str) -> Result<Self, InvalidValue> {
        match value {
            "system" => Ok(Mode::System),
            "autonomous" => Ok(Mode::Autonomous),
            _ => Err(InvalidValue)
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Mode::System => "system",
            Mode::Autonomous => "autonomous",
        })
    }
}


//------------ InvalidValue --------------------------------------------------

/// A value could not be parsed into an enumerated option.
#[derive(Clone, Copy, Debug)]
pub struct InvalidValue;

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid value")
    }
}


//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug)]
pub enum LogTarget {
    /// Default.
    ///
    /// Logs to `Syslog(facility)` in daemon mode and `Stderr` otherwise.
    #[cfg(unix)]
    Default(Facility),

    /// Syslog.
    #[cfg(unix)]
    Syslog(Facility),

    /// Stderr.
    Stderr,

    /// A file.
    File(PathBuf),
}

#[cfg(unix)]
impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Default(Facility::LOG_DAEMON)
    }
}

#[cfg(not(unix))]
impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Stderr
    }
}

/// Parses a syslog facility name.
#[cfg(unix)]
fn parse_syslog_facility(value: &str) -> Result<Facility, Failed> {
    let res = match value {
        "kern" => Facility::LOG_KERN,
        "user" => Facility::LOG_USER,
        "daemon" => Facility::LOG_DAEMON,
        "syslog" => Facility::LOG_SYSLOG,
        "local0" => Facility::LOG_LOCAL0,
        "local1" => Facility::LOG_LOCAL1,
        "local2" => Facility::LOG_LOCAL2,
        "local3" => Facility::LOG_LOCAL3,
        "local4" => Facility::LOG_LOCAL4,
        "local5" => Facility::LOG_LOCAL5,
        "local6" => Facility::LOG_LOCAL6,
        "local7" => Facility::LOG_LOCAL7,
        _ => {
            error!("Invalid syslog facility '{}'.", value);
            return Err(Failed)
        }
    };
    Ok(res)
}


//------------ SshConf -------------------------------------------------------

/// Configuration of the SSH collection layer.
#[derive(Clone, Debug)]
pub struct SshConf {
    /// The user name to authenticate as.
    pub username: String,

    /// Path to the private key to authenticate with.
    pub key_path: Option<PathBuf>,

    /// A password to authenticate with.
    ///
    /// Password authentication is permitted but flagged as non-production
    /// in every log line using it.
    pub password: Option<String>,

    /// The connect timeout.
    pub connect_timeout: Duration,

    /// The timeout for running the show command.
    pub command_timeout: Duration,

    /// The maximum number of concurrent SSH sessions.
    pub max_workers: usize,

    /// The managed known-hosts file.
    pub known_hosts_file: PathBuf,

    /// Accept and record unknown host keys.
    ///
    /// This is the explicitly unsafe setup mode. Every connection made
    /// with it is flagged in the log.
    pub setup_mode: bool,
}

impl Default for SshConf {
    fn default() -> Self {
        SshConf {
            username: String::from("otto-bgp"),
            key_path: None,
            password: None,
            connect_timeout: DEFAULT_SSH_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_SSH_COMMAND_TIMEOUT,
            max_workers: DEFAULT_SSH_WORKERS,
            known_hosts_file: PathBuf::from(
                "/var/lib/otto-bgp/ssh-keys/known_hosts"
            ),
            setup_mode: false,
        }
    }
}

impl SshConf {
    fn from_config_file(file: &mut ConfigFile) -> Result<Self, Failed> {
        let mut section = match file.take_section("ssh")? {
            Some(section) => section,
            None => return Ok(Self::default()),
        };
        let default = Self::default();
        let res = SshConf {
            username: section.take_string("username")?
                .unwrap_or(default.username),
            key_path: section.take_path("key-path")?,
            password: section.take_string("password")?,
            connect_timeout: section.take_duration("connect-timeout")?
                .unwrap_or(default.connect_timeout),
            command_timeout: section.take_duration("command-timeout")?
                .unwrap_or(default.command_timeout),
            max_workers: section.take_usize("max-workers")?
                .unwrap_or(default.max_workers),
            known_hosts_file: section.take_path("known-hosts-file")?
                .unwrap_or(default.known_hosts_file),
            setup_mode: section.take_bool("setup-mode")?
                .unwrap_or(false),
        };
        section.check_exhausted()?;
        if res.password.is_some() {
            warn!(
                "SSH password authentication is configured. \
                 This is not recommended for production use."
            );
        }
        Ok(res)
    }
}


//------------ Bgpq4Mode -----------------------------------------------------

/// How the bgpq4 binary is executed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bgpq4Mode {
    /// Detect an available backend at startup, preferring native.
    Auto,

    /// A natively installed binary.
    Native,

    /// Through `docker run`.
    Docker,

    /// Through `podman run`.
    Podman,
}

impl FromStr for Bgpq4Mode {
    type Err = InvalidValue;

    fn from_str(value: &str) -> Result<Self, InvalidValue> {
        match value {
            "auto" => Ok(Bgpq4Mode::Auto),
            "native" => Ok(Bgpq4Mode::Native),
            "docker" => Ok(Bgpq4Mode::Docker),
            "podman" => Ok(Bgpq4Mode::Podman),
            _ => Err(InvalidValue)
        }
    }
}

impl fmt::Display for Bgpq4Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Bgpq4Mode::Auto => "auto",
            Bgpq4Mode::Native => "native",
            Bgpq4Mode::Docker => "docker",
            Bgpq4Mode::Podman => "podman",
        })
    }
}


//------------ Bgpq4Conf -----------------------------------------------------

/// Configuration of policy generation via bgpq4.
#[derive(Clone, Debug)]
pub struct Bgpq4Conf {
    /// How to execute the binary.
    pub mode: Bgpq4Mode,

    /// The timeout for a single invocation.
    pub timeout: Duration,

    /// The IRR source list handed to bgpq4, e.g. `RADB,RIPE,APNIC`.
    pub irr_source: String,

    /// Whether to aggregate prefixes.
    pub aggregate: bool,

    /// Whether to generate IPv4 prefix lists.
    pub ipv4_enabled: bool,

    /// Whether to generate IPv6 prefix lists.
    pub ipv6_enabled: bool,

    /// Override for the worker pool size.
    ///
    /// If this is `None`, the pool uses `min(cpus, 8, jobs)`.
    pub max_workers: Option<usize>,
}

impl Default for Bgpq4Conf {
    fn default() -> Self {
        Bgpq4Conf {
            mode: Bgpq4Mode::Auto,
            timeout: DEFAULT_BGPQ4_TIMEOUT,
            irr_source: String::from("RADB,RIPE,APNIC"),
            aggregate: true,
            ipv4_enabled: true,
            ipv6_enabled: false,
            max_workers: None,
        }
    }
}

impl Bgpq4Conf {
    fn from_config_file(file: &mut ConfigFile) -> Result<Self, Failed> {
        let mut section = match file.take_section("bgpq4")? {
            Some(section) => section,
            None => return Ok(Self::default()),
        };
        let default = Self::default();
        let res = Bgpq4Conf {
            mode: section.take_from_str("mode")?.unwrap_or(default.mode),
            timeout: section.take_duration("timeout")?
                .unwrap_or(default.timeout),
            irr_source: section.take_string("irr-source")?
                .unwrap_or(default.irr_source),
            aggregate: section.take_bool("aggregate")?
                .unwrap_or(default.aggregate),
            ipv4_enabled: section.take_bool("ipv4-enabled")?
                .unwrap_or(default.ipv4_enabled),
            ipv6_enabled: section.take_bool("ipv6-enabled")?
                .unwrap_or(default.ipv6_enabled),
            max_workers: section.take_usize("max-workers")?,
        };
        section.check_exhausted()?;
        Ok(res)
    }
}


//------------ RpkiConf ------------------------------------------------------

/// Configuration of RPKI origin validation.
#[derive(Clone, Debug)]
pub struct RpkiConf {
    /// Whether RPKI validation is enabled at all.
    pub enabled: bool,

    /// Path of the VRP cache file.
    pub vrp_cache_path: PathBuf,

    /// Maximum age of the VRP cache in hours.
    ///
    /// A cache exactly at the boundary is still fresh; one second past it
    /// is stale.
    pub max_vrp_age_hours: u64,

    /// Whether to treat a stale or unloadable cache as a hard failure.
    pub fail_closed: bool,

    /// Path of the allowlist file.
    pub allowlist_path: Option<PathBuf>,

    /// Percentage of INVALID results above which the guardrail escalates.
    pub max_invalid_percent: f64,

    /// Percentage of NOTFOUND results above which the guardrail escalates.
    pub max_notfound_percent: f64,
}

impl Default for RpkiConf {
    fn default() -> Self {
        RpkiConf {
            enabled: false,
            vrp_cache_path: PathBuf::from(
                "/var/lib/otto-bgp/rpki/vrp_cache.json"
            ),
            max_vrp_age_hours: DEFAULT_MAX_VRP_AGE_HOURS,
            fail_closed: true,
            allowlist_path: None,
            max_invalid_percent: 5.0,
            max_notfound_percent: 50.0,
        }
    }
}

impl RpkiConf {
    fn from_config_file(file: &mut ConfigFile) -> Result<Self, Failed> {
        let mut section = match file.take_section("rpki")? {
            Some(section) => section,
            None => return Ok(Self::default()),
        };
        let default = Self::default();
        let res = RpkiConf {
            enabled: section.take_bool("enabled")?
                .unwrap_or(default.enabled),
            vrp_cache_path: section.take_path("vrp-cache-path")?
                .unwrap_or(default.vrp_cache_path),
            max_vrp_age_hours: section.take_u64("max-vrp-age-hours")?
                .unwrap_or(default.max_vrp_age_hours),
            fail_closed: section.take_bool("fail-closed")?
                .unwrap_or(default.fail_closed),
            allowlist_path: section.take_path("allowlist-path")?,
            max_invalid_percent: section.take_f64("max-invalid-percent")?
                .unwrap_or(default.max_invalid_percent),
            max_notfound_percent: section.take_f64("max-notfound-percent")?
                .unwrap_or(default.max_notfound_percent),
        };
        section.check_exhausted()?;
        Ok(res)
    }
}


//------------ GuardrailConf -------------------------------------------------

/// Configuration of the guardrail engine.
#[derive(Clone, Debug)]
pub struct GuardrailConf {
    /// The names of explicitly enabled guardrails.
    ///
    /// An empty list enables the full built-in set. Critical guardrails
    /// are enabled regardless of this list.
    pub enabled_guardrails: Vec<String>,

    /// Override for the prefix-count warning threshold in percent.
    ///
    /// If `None`, the mode default applies: 25 in system mode, 10 in
    /// autonomous mode.
    pub prefix_count_warning_percent: Option<f64>,

    /// Override for the prefix-count critical threshold in percent.
    pub prefix_count_critical_percent: Option<f64>,
}

impl Default for GuardrailConf {
    fn default() -> Self {
        GuardrailConf {
            enabled_guardrails: Vec::new(),
            prefix_count_warning_percent: None,
            prefix_count_critical_percent: None,
        }
    }
}

impl GuardrailConf {
    fn from_config_file(file: &mut ConfigFile) -> Result<Self, Failed> {
        let mut section = match file.take_section("guardrails")? {
            Some(section) => section,
            None => return Ok(Self::default()),
        };
        let res = GuardrailConf {
            enabled_guardrails: section
                .take_string_array("enabled-guardrails")?
                .unwrap_or_default(),
            prefix_count_warning_percent: section
                .take_f64("prefix-count-warning-percent")?,
            prefix_count_critical_percent: section
                .take_f64("prefix-count-critical-percent")?,
        };
        section.check_exhausted()?;
        Ok(res)
    }
}


//------------ NetconfConf ---------------------------------------------------

/// Configuration of the NETCONF applier.
#[derive(Clone, Debug)]
pub struct NetconfConf {
    /// The user name to authenticate as.
    pub username: String,

    /// Path to the private key to authenticate with.
    pub key_path: Option<PathBuf>,

    /// The TCP port of the NETCONF-over-SSH subsystem.
    pub port: u16,

    /// The timeout for a single NETCONF operation.
    pub timeout: Duration,

    /// The confirmed-commit timer in minutes.
    pub confirmed_commit_minutes: u8,

    /// The prefix for commit comments.
    pub commit_comment_prefix: String,
}

impl Default for NetconfConf {
    fn default() -> Self {
        NetconfConf {
            username: String::from("otto-bgp"),
            key_path: None,
            port: DEFAULT_NETCONF_PORT,
            timeout: DEFAULT_NETCONF_TIMEOUT,
            confirmed_commit_minutes: DEFAULT_CONFIRMED_COMMIT_MINUTES,
            commit_comment_prefix: String::from(
                DEFAULT_COMMIT_COMMENT_PREFIX
            ),
        }
    }
}

impl NetconfConf {
    fn from_config_file(file: &mut ConfigFile) -> Result<Self, Failed> {
        let mut section = match file.take_section("netconf")? {
            Some(section) => section,
            None => return Ok(Self::default()),
        };
        let default = Self::default();
        let res = NetconfConf {
            username: section.take_string("username")?
                .unwrap_or(default.username),
            key_path: section.take_path("key-path")?,
            port: section.take_u16("port")?.unwrap_or(default.port),
            timeout: section.take_duration("timeout")?
                .unwrap_or(default.timeout),
            confirmed_commit_minutes: section
                .take_u8("confirmed-commit-minutes")?
                .unwrap_or(default.confirmed_commit_minutes),
            commit_comment_prefix: section
                .take_string("commit-comment-prefix")?
                .unwrap_or(default.commit_comment_prefix),
        };
        section.check_exhausted()?;
        Ok(res)
    }
}


//------------ IrrProxyConf --------------------------------------------------

/// Configuration of the IRR proxy tunnels.
#[derive(Clone, Debug, Default)]
pub struct IrrProxyConf {
    /// Whether the proxy is used at all.
    pub enabled: bool,

    /// The jump host to tunnel through.
    pub jump_host: Option<String>,

    /// The user on the jump host.
    pub jump_user: Option<String>,

    /// Path to the private key for the jump host.
    pub ssh_key_file: Option<PathBuf>,

    /// The known-hosts file for the jump host.
    pub known_hosts_file: Option<PathBuf>,

    /// The connect timeout for tunnel establishment.
    pub connection_timeout: Option<Duration>,

    /// Whether to fall back to direct IRR access if a tunnel is down.
    pub allow_direct_fallback: bool,

    /// The tunnels to maintain.
    pub tunnels: Vec<TunnelConf>,
}

impl IrrProxyConf {
    fn from_config_file(file: &mut ConfigFile) -> Result<Self, Failed> {
        let mut section = match file.take_section("irr-proxy")? {
            Some(section) => section,
            None => return Ok(Self::default()),
        };
        let res = IrrProxyConf {
            enabled: section.take_bool("enabled")?.unwrap_or(false),
            jump_host: section.take_string("jump-host")?,
            jump_user: section.take_string("jump-user")?,
            ssh_key_file: section.take_path("ssh-key-file")?,
            known_hosts_file: section.take_path("known-hosts-file")?,
            connection_timeout: section.take_duration("connection-timeout")?,
            allow_direct_fallback: section
                .take_bool("allow-direct-fallback")?
                .unwrap_or(false),
            tunnels: TunnelConf::vec_from_section(&mut section)?,
        };
        section.check_exhausted()?;
        if res.enabled && res.jump_host.is_none() {
            error!(
                "IRR proxy is enabled but 'jump-host' is missing."
            );
            return Err(Failed)
        }
        Ok(res)
    }
}


//------------ TunnelConf ----------------------------------------------------

/// A single IRR proxy tunnel definition.
#[derive(Clone, Debug)]
pub struct TunnelConf {
    /// The name of the tunnel. Used in logging and lookup.
    pub name: String,

    /// The local port to bind.
    pub local_port: u16,

    /// The remote host to forward to.
    pub remote_host: String,

    /// The remote port to forward to.
    pub remote_port: u16,
}

impl TunnelConf {
    fn vec_from_section(
        section: &mut ConfigFile
    ) -> Result<Vec<Self>, Failed> {
        let values = match section.take_array("tunnels")? {
            Some(values) => values,
            None => return Ok(Vec::new()),
        };
        let mut res = Vec::new();
        for value in values {
            let table = match value {
                toml::Value::Table(table) => table,
                _ => {
                    error!(
                        "Failed in config file {}: \
                         'tunnels' entries must be tables.",
                        section.path.display()
                    );
                    return Err(Failed)
                }
            };
            let mut entry = ConfigFile {
                content: table,
                path: section.path.clone(),
                dir: section.dir.clone(),
            };
            res.push(TunnelConf {
                name: entry.take_required_string("name")?,
                local_port: entry.take_u16("local-port")?.ok_or_else(|| {
                    error!(
                        "Failed in config file {}: \
                         tunnel entry without 'local-port'.",
                        entry.path.display()
                    );
                    Failed
                })?,
                remote_host: entry.take_required_string("remote-host")?,
                remote_port: entry.take_u16("remote-port")?.unwrap_or(43),
            });
            entry.check_exhausted()?;
        }
        Ok(res)
    }
}


//------------ ConfigFile ----------------------------------------------------

/// The content of a config file.
///
/// This is a thin wrapper around a TOML table to make dealing with it more
/// convenient. Values are taken out of the table as they are read so that
/// left-over keys can be reported as errors at the end.
#[derive(Clone, Debug)]
struct ConfigFile {
    /// The content of the file.
    content: toml::value::Table,

    /// The path to the config file.
    path: PathBuf,

    /// The directory we found the file in.
    ///
    /// This is used in relative paths.
    dir: PathBuf,
}

impl ConfigFile {
    /// Reads the config file at the given path.
    ///
    /// If there is no such file, returns `None`. If there is a file but it
    /// is broken, aborts.
    fn try_read(path: &Path) -> Result<Option<Self>, Failed> {
        match std::fs::read_to_string(path) {
            Ok(config) => Self::parse(&config, path).map(Some),
            Err(_) => Ok(None)
        }
    }

    /// Reads the config file at the given path.
    ///
    /// If there is no such file or the file is broken, aborts.
    fn read(path: &Path) -> Result<Self, Failed> {
        let config = match std::fs::read_to_string(path) {
            Ok(config) => config,
            Err(err) => {
                error!(
                    "Failed to read config file {}: {}",
                    path.display(), err
                );
                return Err(Failed);
            }
        };
        Self::parse(&config, path)
    }

    /// Parses the content of the file from a string.
    fn parse(content: &str, path: &Path) -> Result<Self, Failed> {
        let content = match toml::from_str(content) {
            Ok(toml::Value::Table(content)) => content,
            Ok(_) => {
                error!(
                    "Failed to parse config file {}: not a mapping.",
                    path.display()
                );
                return Err(Failed);
            }
            Err(err) => {
                error!(
                    "Failed to parse config file {}: {}",
                    path.display(), err
                );
                return Err(Failed);
            }
        };
        let dir = if path.is_relative() {
            path.join(Path::new(".."))
                .canonicalize()
                .unwrap_or_else(|_| Path::new(".").into())
        }
        else {
            match path.parent() {
                Some(dir) => dir.into(),
                None => Path::new("/").into(),
            }
        };
        Ok(ConfigFile {
            content,
            path: path.into(),
            dir,
        })
    }

    /// Takes a nested table out of the file’s content.
    fn take_section(&mut self, key: &str) -> Result<Option<Self>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Table(table)) => {
                Ok(Some(ConfigFile {
                    content: table,
                    path: self.path.clone(),
                    dir: self.dir.clone(),
                }))
            }
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be a section.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a boolean value from the config file.
    fn take_bool(&mut self, key: &str) -> Result<Option<bool>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Boolean(res)) => Ok(Some(res)),
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be a boolean.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes an unsigned integer value from the config file.
    fn take_u64(&mut self, key: &str) -> Result<Option<u64>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Integer(res)) => {
                if res < 0 {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be a positive integer.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
                else {
                    Ok(Some(res as u64))
                }
            }
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be an integer.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a u8 value from the config file.
    fn take_u8(&mut self, key: &str) -> Result<Option<u8>, Failed> {
        match self.take_u64(key)? {
            Some(value) => {
                if value > u64::from(u8::MAX) {
                    error!(
                        "Failed in config file {}: \
                         '{}' is too large.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
                else {
                    Ok(Some(value as u8))
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a u16 value from the config file.
    fn take_u16(&mut self, key: &str) -> Result<Option<u16>, Failed> {
        match self.take_u64(key)? {
            Some(value) => {
                if value > u64::from(u16::MAX) {
                    error!(
                        "Failed in config file {}: \
                         '{}' is too large.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
                else {
                    Ok(Some(value as u16))
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a usize value from the config file.
    fn take_usize(&mut self, key: &str) -> Result<Option<usize>, Failed> {
        Ok(self.take_u64(key)?.map(|value| value as usize))
    }

    /// Takes a float value from the config file.
    ///
    /// Accepts integers, too, for convenience.
    fn take_f64(&mut self, key: &str) -> Result<Option<f64>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Float(res)) => Ok(Some(res)),
            Some(toml::Value::Integer(res)) => Ok(Some(res as f64)),
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be a number.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a duration in seconds from the config file.
    fn take_duration(
        &mut self, key: &str
    ) -> Result<Option<Duration>, Failed> {
        Ok(self.take_u64(key)?.map(Duration::from_secs))
    }

    /// Takes a string value from the config file.
    fn take_string(&mut self, key: &str) -> Result<Option<String>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::String(res)) => Ok(Some(res)),
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be a string.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes a mandatory string value from the config file.
    fn take_required_string(&mut self, key: &str) -> Result<String, Failed> {
        match self.take_string(key)? {
            Some(res) => Ok(res),
            None => {
                error!(
                    "Failed in config file {}: missing required '{}'.",
                    self.path.display(), key
                );
                Err(Failed)
            }
        }
    }

    /// Takes a string encoded value from the config file.
    fn take_from_str<T>(&mut self, key: &str) -> Result<Option<T>, Failed>
    where T: FromStr, T::Err: fmt::Display {
        match self.take_string(key)? {
            Some(value) => {
                match T::from_str(&value) {
                    Ok(some) => Ok(Some(some)),
                    Err(err) => {
                        error!(
                            "Failed in config file {}: \
                             illegal value in '{}': {}.",
                            self.path.display(), key, err
                        );
                        Err(Failed)
                    }
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a path value from the config file.
    ///
    /// Relative paths are interpreted relative to the config file’s
    /// directory.
    fn take_path(&mut self, key: &str) -> Result<Option<PathBuf>, Failed> {
        self.take_string(key).map(|opt| {
            opt.map(|path| self.dir.join(path))
        })
    }

    /// Takes an array value from the config file.
    fn take_array(
        &mut self, key: &str
    ) -> Result<Option<Vec<toml::Value>>, Failed> {
        match self.content.remove(key) {
            Some(toml::Value::Array(res)) => Ok(Some(res)),
            Some(_) => {
                error!(
                    "Failed in config file {}: \
                     '{}' expected to be an array.",
                    self.path.display(), key
                );
                Err(Failed)
            }
            None => Ok(None)
        }
    }

    /// Takes an array of strings from the config file.
    fn take_string_array(
        &mut self, key: &str
    ) -> Result<Option<Vec<String>>, Failed> {
        let values = match self.take_array(key)? {
            Some(values) => values,
            None => return Ok(None)
        };
        let mut res = Vec::new();
        for value in values {
            match value {
                toml::Value::String(value) => res.push(value),
                _ => {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be an array of strings.",
                        self.path.display(), key
                    );
                    return Err(Failed);
                }
            }
        }
        Ok(Some(res))
    }

    /// Checks whether any keys are left in the file and errors out if so.
    fn check_exhausted(&self) -> Result<(), Failed> {
        let mut keys = self.content.keys();
        if let Some(key) = keys.next() {
            error!(
                "Failed in config file {}: unknown setting '{}'.",
                self.path.display(), key
            );
            Err(Failed)
        }
        else {
            Ok(())
        }
    }
}

impl FromStr for Config {
    type Err = Failed;

    /// Parses a config from a TOML string. Used in tests.
    fn from_str(content: &str) -> Result<Self, Failed> {
        Self::from_config_file(
            ConfigFile::parse(content, Path::new("test.conf"))?
        )
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn parse(content: &str) -> Config {
        Config::from_str(content).expect("config should parse")
    }

    #[test]
    fn empty_config_yields_defaults() {
        let config = parse("");
        assert_eq!(config.mode, Mode::System);
        assert_eq!(config.ssh.max_workers, DEFAULT_SSH_WORKERS);
        assert_eq!(config.bgpq4.timeout, DEFAULT_BGPQ4_TIMEOUT);
        assert_eq!(config.netconf.port, DEFAULT_NETCONF_PORT);
        assert_eq!(
            config.netconf.commit_comment_prefix,
            DEFAULT_COMMIT_COMMENT_PREFIX
        );
        assert!(!config.rpki.enabled);
        assert!(config.rpki.fail_closed);
    }

    #[test]
    fn sections_are_read() {
        let config = parse("\
            mode = \"autonomous\"\n\
            \n\
            [ssh]\n\
            username = \"netops\"\n\
            max-workers = 10\n\
            connect-timeout = 15\n\
            \n\
            [bgpq4]\n\
            mode = \"podman\"\n\
            irr-source = \"RADB\"\n\
            ipv6-enabled = true\n\
            \n\
            [rpki]\n\
            enabled = true\n\
            max-vrp-age-hours = 12\n\
            \n\
            [netconf]\n\
            port = 2222\n\
            confirmed-commit-minutes = 3\n\
        ");
        assert_eq!(config.mode, Mode::Autonomous);
        assert_eq!(config.ssh.username, "netops");
        assert_eq!(config.ssh.max_workers, 10);
        assert_eq!(
            config.ssh.connect_timeout, Duration::from_secs(15)
        );
        assert_eq!(config.bgpq4.mode, Bgpq4Mode::Podman);
        assert_eq!(config.bgpq4.irr_source, "RADB");
        assert!(config.bgpq4.ipv6_enabled);
        assert!(config.rpki.enabled);
        assert_eq!(config.rpki.max_vrp_age_hours, 12);
        assert_eq!(config.netconf.port, 2222);
        assert_eq!(config.netconf.confirmed_commit_minutes, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_str("no-such-setting = true\n").is_err());
        assert!(Config::from_str(
            "[ssh]\nno-such-setting = true\n"
        ).is_err());
    }

    #[test]
    fn invalid_mode_is_rejected() {
        assert!(Config::from_str("mode = \"manual\"\n").is_err());
    }

    #[test]
    fn tunnels_are_read() {
        let config = parse("\
            [irr-proxy]\n\
            enabled = true\n\
            jump-host = \"bastion.example.net\"\n\
            allow-direct-fallback = true\n\
            \n\
            [[irr-proxy.tunnels]]\n\
            name = \"radb\"\n\
            local-port = 43001\n\
            remote-host = \"whois.radb.net\"\n\
            remote-port = 43\n\
        ");
        assert!(config.irr_proxy.enabled);
        assert_eq!(config.irr_proxy.tunnels.len(), 1);
        let tunnel = &config.irr_proxy.tunnels[0];
        assert_eq!(tunnel.name, "radb");
        assert_eq!(tunnel.local_port, 43001);
        assert_eq!(tunnel.remote_host, "whois.radb.net");
        assert_eq!(tunnel.remote_port, 43);
    }

    #[test]
    fn proxy_without_jump_host_is_rejected() {
        assert!(Config::from_str("[irr-proxy]\nenabled = true\n").is_err());
    }
}
