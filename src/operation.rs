//! What Otto BGP can do for you.
//!
//! This module contains all the commands you can give to the executable.

use std::io::Read;
use std::path::{Path, PathBuf};
use clap::{App, Arg, ArgMatches, SubCommand};
use log::{error, info, warn};
use crate::adapter;
use crate::asn;
use crate::audit::AuditEvent;
use crate::collector::{CollectionResult, Collector};
use crate::config::Config;
use crate::error::{ExitError, Failed};
use crate::generator::{BatchTarget, Generator};
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::process::Process;
use crate::rollout::RolloutRun;
use crate::rpki;
use crate::utils::date::format_iso_date;
use crate::utils::fatal;


//------------ Operation -----------------------------------------------------

/// The command to run.
pub enum Operation {
    /// Collect raw BGP configuration from the fleet.
    Collect {
        devices: PathBuf,
    },

    /// Extract AS numbers from free-form text.
    Process {
        input: Option<PathBuf>,
        output: Option<PathBuf>,
        strict: bool,
    },

    /// Generate policies for an explicit list of AS numbers.
    Policy {
        targets: Vec<String>,
        from_file: Option<PathBuf>,
        policy_name: Option<String>,
        output_dir: Option<PathBuf>,
    },

    /// Discover BGP structure and refresh the mapping artifacts.
    Discover {
        devices: PathBuf,
    },

    /// Apply previously preparable policies to the fleet.
    Apply {
        devices: PathBuf,
        confirmed: bool,
        staged: Option<usize>,
        rollout_state: Option<PathBuf>,
    },

    /// The full pipeline: discover, generate, validate, apply.
    Pipeline {
        devices: PathBuf,
        apply: bool,
        confirmed: bool,
    },

    /// Check the RPKI VRP cache independently of a run.
    RpkiCheck,

    /// Render a notification email into the outbox.
    NotifyEmail {
        to: String,
    },
}

impl Operation {
    /// Adds the command configuration to a clap app.
    pub fn config_args<'a: 'b, 'b>(app: App<'a, 'b>) -> App<'a, 'b> {
        app
        .subcommand(SubCommand::with_name("collect")
            .about("Collects BGP configuration from all devices")
            .arg(Arg::with_name("devices")
                .value_name("CSV")
                .required(true)
                .help("device inventory file")
            )
        )
        .subcommand(SubCommand::with_name("process")
            .about("Extracts AS numbers from free-form text")
            .arg(Arg::with_name("input")
                .value_name("FILE")
                .help("input file, '-' or absent for stdin")
            )
            .arg(Arg::with_name("output")
                .short("o")
                .long("output")
                .value_name("FILE")
                .takes_value(true)
                .help("output file, '-' or absent for stdout")
            )
            .arg(Arg::with_name("no-strict")
                .long("no-strict")
                .help("keep values that look like IP octets")
            )
        )
        .subcommand(SubCommand::with_name("policy")
            .about("Generates prefix-list policies for AS numbers")
            .arg(Arg::with_name("as")
                .value_name("ASN")
                .multiple(true)
                .help("AS numbers, bare or in AS65000 notation")
            )
            .arg(Arg::with_name("from-file")
                .short("f")
                .long("from-file")
                .value_name("FILE")
                .takes_value(true)
                .help("read AS numbers from a file, one per line")
            )
            .arg(Arg::with_name("name")
                .short("l")
                .long("name")
                .value_name("NAME")
                .takes_value(true)
                .help("policy name; only valid with a single AS")
            )
            .arg(Arg::with_name("output-dir")
                .short("o")
                .long("output-dir")
                .value_name("DIR")
                .takes_value(true)
                .help("directory for the policy files")
            )
        )
        .subcommand(SubCommand::with_name("discover")
            .about("Discovers BGP structure and writes the mappings")
            .arg(Arg::with_name("devices")
                .value_name("CSV")
                .required(true)
                .help("device inventory file")
            )
        )
        .subcommand(SubCommand::with_name("apply")
            .about("Applies generated policies over NETCONF")
            .arg(Arg::with_name("devices")
                .value_name("CSV")
                .required(true)
                .help("device inventory file")
            )
            .arg(Arg::with_name("yes")
                .short("y")
                .long("yes")
                .help("confirm applies that need operator approval")
            )
            .arg(Arg::with_name("staged")
                .long("staged")
                .value_name("N")
                .takes_value(true)
                .help("roll out in stages of N routers")
            )
            .arg(Arg::with_name("rollout-state")
                .long("rollout-state")
                .value_name("FILE")
                .takes_value(true)
                .help("resume the rollout recorded in FILE")
            )
        )
        .subcommand(SubCommand::with_name("pipeline")
            .about("Runs the full pipeline")
            .arg(Arg::with_name("devices")
                .value_name("CSV")
                .required(true)
                .help("device inventory file")
            )
            .arg(Arg::with_name("apply")
                .long("apply")
                .help("apply the generated policies")
            )
            .arg(Arg::with_name("yes")
                .short("y")
                .long("yes")
                .help("confirm applies that need operator approval")
            )
        )
        .subcommand(SubCommand::with_name("rpki-check")
            .about("Checks that the VRP cache is present and fresh")
        )
        .subcommand(SubCommand::with_name("notify-email")
            .about("Renders a notification email into the outbox")
            .arg(Arg::with_name("to")
                .long("to")
                .value_name("ADDR")
                .required(true)
                .takes_value(true)
                .help("recipient address")
            )
        )
    }

    /// Creates a command from clap matches.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        Ok(match matches.subcommand() {
            ("collect", Some(matches)) => {
                Operation::Collect {
                    devices: cur_dir.join(
                        matches.value_of("devices").unwrap()
                    ),
                }
            }
            ("process", Some(matches)) => {
                Operation::Process {
                    input: match matches.value_of("input") {
                        None | Some("-") => None,
                        Some(path) => Some(cur_dir.join(path)),
                    },
                    output: match matches.value_of("output") {
                        None | Some("-") => None,
                        Some(path) => Some(cur_dir.join(path)),
                    },
                    strict: !matches.is_present("no-strict"),
                }
            }
            ("policy", Some(matches)) => {
                Operation::Policy {
                    targets: matches.values_of("as")
                        .map(|values| {
                            values.map(Into::into).collect()
                        })
                        .unwrap_or_default(),
                    from_file: matches.value_of("from-file")
                        .map(|path| cur_dir.join(path)),
                    policy_name: matches.value_of("name")
                        .map(Into::into),
                    output_dir: matches.value_of("output-dir")
                        .map(|path| cur_dir.join(path)),
                }
            }
            ("discover", Some(matches)) => {
                Operation::Discover {
                    devices: cur_dir.join(
                        matches.value_of("devices").unwrap()
                    ),
                }
            }
            ("apply", Some(matches)) => {
                Operation::Apply {
                    devices: cur_dir.join(
                        matches.value_of("devices").unwrap()
                    ),
                    confirmed: matches.is_present("yes"),
                    staged: match matches.value_of("staged") {
                        Some(value) => {
                            match value.parse::<usize>() {
                                Ok(n) if n > 0 => Some(n),
                                _ => {
                                    error!(
                                        "Invalid stage size '{}'.",
                                        value
                                    );
                                    return Err(Failed)
                                }
                            }
                        }
                        None => None,
                    },
                    rollout_state: matches.value_of("rollout-state")
                        .map(|path| cur_dir.join(path)),
                }
            }
            ("pipeline", Some(matches)) => {
                Operation::Pipeline {
                    devices: cur_dir.join(
                        matches.value_of("devices").unwrap()
                    ),
                    apply: matches.is_present("apply"),
                    confirmed: matches.is_present("yes"),
                }
            }
            ("rpki-check", _) => Operation::RpkiCheck,
            ("notify-email", Some(matches)) => {
                Operation::NotifyEmail {
                    to: matches.value_of("to").unwrap().into(),
                }
            }
            _ => {
                error!(
                    "No command given. Try 'otto-bgp help' for a list."
                );
                return Err(Failed)
            }
        })
    }

    /// Runs the command.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        let process = Process::new(config);
        match self {
            Operation::Collect { devices } => {
                Self::collect(process, &devices)
            }
            Operation::Process { input, output, strict } => {
                Self::process(process, input, output, strict)
            }
            Operation::Policy {
                targets, from_file, policy_name, output_dir
            } => {
                Self::policy(
                    process, targets, from_file, policy_name,
                    output_dir
                )
            }
            Operation::Discover { devices } => {
                Self::discover(process, &devices)
            }
            Operation::Apply {
                devices, confirmed, staged, rollout_state
            } => {
                Self::apply(
                    process, &devices, confirmed, staged, rollout_state
                )
            }
            Operation::Pipeline { devices, apply, confirmed } => {
                Self::pipeline(process, &devices, apply, confirmed)
            }
            Operation::RpkiCheck => Self::rpki_check(process),
            Operation::NotifyEmail { to } => {
                Self::notify_email(process, &to)
            }
        }
    }

    /// The collect command.
    ///
    /// Retrieves the BGP stanza from every device and stores the raw
    /// text per router.
    fn collect(
        process: Process, devices: &Path
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let runtime = process.runtime()?;
        process.spawn_signal_watcher(&runtime)?;

        let devices = crate::collector::load_devices(devices)?;
        let collector = Collector::new(process.config());
        let report = collector.collect(&devices, &process.cancel());

        let dir = process.config().output_dir.join("bgp-configs");
        for result in &report.results {
            if let CollectionResult::Collected(profile) = result {
                fatal::write_file(
                    &dir.join(format!("{}.txt", profile.hostname)),
                    profile.bgp_config.as_bytes()
                )?;
            }
        }
        info!(
            "Collected {} of {} devices.",
            report.stats.collected, report.results.len()
        );
        if report.stats.collected == 0 && !report.results.is_empty() {
            return Err(ExitError::Generic)
        }
        Ok(())
    }

    /// The process command.
    ///
    /// Extracts AS numbers from free-form text and prints one per line.
    fn process(
        process: Process,
        input: Option<PathBuf>,
        output: Option<PathBuf>,
        strict: bool,
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;

        let text = match input {
            Some(path) => fatal::read_to_string(&path)?,
            None => {
                let mut text = String::new();
                std::io::stdin().read_to_string(&mut text).map_err(
                    |err| {
                        error!("Failed to read stdin: {}", err);
                        ExitError::Generic
                    }
                )?;
                text
            }
        };

        let text = asn::clean_text(&text, asn::DEFAULT_NOISE);
        let extracted = asn::extract_as_numbers(&text, strict);
        for diagnostic in &extracted.diagnostics {
            warn!("{}", diagnostic);
        }

        let mut rendered = String::new();
        for asn in &extracted.as_numbers {
            rendered.push_str(&asn.to_string());
            rendered.push('\n');
        }
        match output {
            Some(path) => fatal::write_file(
                &path, rendered.as_bytes()
            )?,
            None => print!("{}", rendered),
        }
        Ok(())
    }

    /// The policy command.
    fn policy(
        process: Process,
        mut targets: Vec<String>,
        from_file: Option<PathBuf>,
        policy_name: Option<String>,
        output_dir: Option<PathBuf>,
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let runtime = process.runtime()?;
        process.spawn_signal_watcher(&runtime)?;
        let config = process.config();

        if let Some(path) = from_file {
            let content = fatal::read_to_string(&path)?;
            targets.extend(
                content.lines()
                    .map(str::trim)
                    .filter(|line| {
                        !line.is_empty() && !line.starts_with('#')
                    })
                    .map(Into::into)
            );
        }
        if targets.is_empty() {
            error!("No AS numbers given.");
            return Err(ExitError::Generic)
        }
        if policy_name.is_some() && targets.len() > 1 {
            error!("--name is only valid with a single AS number.");
            return Err(ExitError::Generic)
        }

        let proxy = match crate::proxy::ProxyManager::new(
            &config.irr_proxy
        ) {
            Some(proxy) => {
                proxy.start()?;
                Some(std::sync::Arc::new(proxy))
            }
            None => None,
        };
        let generator = Generator::new(config, proxy)?;

        let result = if let Some(name) = policy_name {
            // Single-AS path with an explicit name.
            let target = BatchTarget::from_input(&targets[0]);
            match target.parsed {
                Ok(asn) => {
                    match generator.generate_one(asn, Some(&name)) {
                        Ok(policy) => {
                            vec![crate::generator::BatchEntry {
                                input: target.input,
                                result: Ok(policy),
                            }]
                        }
                        Err(err) => {
                            vec![crate::generator::BatchEntry {
                                input: target.input,
                                result: Err(err),
                            }]
                        }
                    }
                }
                Err(err) => {
                    vec![crate::generator::BatchEntry {
                        input: target.input,
                        result: Err(err),
                    }]
                }
            }
        }
        else {
            let targets: Vec<BatchTarget> = targets.iter()
                .map(|input| BatchTarget::from_input(input))
                .collect();
            generator.generate_batch(targets, &process.cancel())
                .entries
        };

        let dir = output_dir.unwrap_or_else(|| config.policies_dir());
        let mut succeeded = 0usize;
        for entry in &result {
            match &entry.result {
                Ok(policy) => {
                    fatal::write_file(
                        &dir.join(adapter::policy_file_name(policy)),
                        policy.content.as_bytes()
                    )?;
                    succeeded += 1;
                }
                Err(err) => {
                    warn!("{}: {}", entry.input, err);
                }
            }
        }
        info!(
            "Wrote {} of {} policies to {}.",
            succeeded, result.len(), dir.display()
        );
        if succeeded == 0 {
            return Err(ExitError::Generic)
        }
        Ok(())
    }

    /// The discover command.
    fn discover(
        process: Process, devices: &Path
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let runtime = process.runtime()?;
        process.spawn_signal_watcher(&runtime)?;

        let pipeline = Pipeline::new(
            process.config(), process.cancel()
        )?;
        let report = pipeline.discover(devices)?;
        if report.stats.collected == 0 {
            return Err(ExitError::Generic)
        }
        Ok(())
    }

    /// The apply command.
    fn apply(
        process: Process,
        devices: &Path,
        confirmed: bool,
        staged: Option<usize>,
        rollout_state: Option<PathBuf>,
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let runtime = process.runtime()?;
        process.spawn_signal_watcher(&runtime)?;

        let pipeline = Pipeline::new(
            process.config(), process.cancel()
        )?;
        let options = PipelineOptions { apply: true, confirmed };
        let mut summary = Default::default();

        let report = pipeline.discover(devices)?;
        let work = pipeline.prepare(&report, &mut summary)?;

        match (staged, rollout_state) {
            (None, None) => {
                pipeline.apply_all(&work, &options, &mut summary);
            }
            (staged, state_path) => {
                let state_path = state_path.unwrap_or_else(|| {
                    process.config().output_dir.join("rollout.json")
                });
                let mut run = if state_path.exists() && staged.is_none()
                {
                    RolloutRun::load(&state_path)?
                }
                else {
                    let size = staged.unwrap_or(1);
                    let hostnames: Vec<String> = work.iter()
                        .map(|item| item.profile.hostname.clone())
                        .collect();
                    let stages = hostnames.chunks(size).enumerate()
                        .map(|(index, chunk)| {
                            (
                                format!("stage-{}", index + 1),
                                chunk.to_vec(),
                                size,
                            )
                        })
                        .collect::<Vec<_>>();
                    RolloutRun::new(stages)
                };
                pipeline.apply_rollout(
                    &mut run, &work, &options, &mut summary,
                    &state_path
                )?;
            }
        }

        Self::report_summary(&summary);
        summary.into_exit().map(|_| ())
    }

    /// The pipeline command.
    fn pipeline(
        process: Process,
        devices: &Path,
        apply: bool,
        confirmed: bool,
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let runtime = process.runtime()?;
        process.spawn_signal_watcher(&runtime)?;

        let pipeline = Pipeline::new(
            process.config(), process.cancel()
        )?;
        let options = PipelineOptions { apply, confirmed };
        let mut summary = Default::default();

        let report = pipeline.discover(devices)?;
        let work = pipeline.prepare(&report, &mut summary)?;
        pipeline.apply_all(&work, &options, &mut summary);

        Self::report_summary(&summary);
        summary.into_exit().map(|_| ())
    }

    /// The rpki-check command.
    fn rpki_check(process: Process) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        match rpki::preflight(&process.config().rpki) {
            Ok(report) => {
                info!(
                    "RPKI preflight passed: {} VRPs, cache {:.1} \
                     hours old.",
                    report.vrp_count, report.age_hours
                );
                Ok(())
            }
            Err(_) => {
                if let Ok(audit) = crate::audit::AuditLog::open(
                    &process.config().audit_log_path()
                ) {
                    audit.record(AuditEvent::new(
                        "rpki.preflight.failed", "failed",
                        "VRP cache absent, unreadable, or stale".into()
                    ));
                }
                Err(ExitError::RpkiPreflight)
            }
        }
    }

    /// The notify-email command.
    ///
    /// Renders a notification message from the latest artifacts into
    /// the outbox directory; delivery belongs to an external MTA.
    fn notify_email(
        process: Process, to: &str
    ) -> Result<(), ExitError> {
        process.switch_logging(false)?;
        let config = process.config();

        let summary_path = config.reports_dir()
            .join("deployment-summary.txt");
        let summary = std::fs::read_to_string(&summary_path)
            .unwrap_or_else(|_| {
                String::from("No deployment summary available.\n")
            });

        let now = chrono::Utc::now();
        let message = format!(
            "To: {}\r\n\
             From: otto-bgp <noreply@localhost>\r\n\
             Subject: [Otto BGP] deployment report {}\r\n\
             \r\n\
             {}",
            to, format_iso_date(now), summary
        );

        let outbox = config.reports_dir().join("outbox");
        let path = outbox.join(format!(
            "report-{}.eml",
            crate::utils::date::format_file_stamp(now)
        ));
        fatal::write_file(&path, message.as_bytes())?;

        let audit = crate::audit::AuditLog::open(
            &config.audit_log_path()
        )?;
        audit.record(AuditEvent::new(
            "notify.rendered", "ok",
            format!("outbox message for {}", to)
        ));
        info!("Rendered notification to {}.", path.display());
        Ok(())
    }

    /// Logs the final per-run summary.
    fn report_summary(summary: &crate::pipeline::PipelineSummary) {
        info!(
            "Run summary: {} collected, {} collect failures, \
             {} policies, {} generation failures, {} blocked, \
             {} applied, {} rolled back, {} awaiting confirmation.",
            summary.collected, summary.collect_failures,
            summary.policies, summary.generate_failures,
            summary.blocked, summary.applied, summary.rolled_back,
            summary.awaiting_confirmation
        );
        if summary.rolled_back > 0 {
            error!(
                "{} routers were rolled back; see the audit log.",
                summary.rolled_back
            );
        }
        if summary.blocked > 0 {
            error!(
                "{} routers were blocked by guardrails.",
                summary.blocked
            );
        }
    }
}
