//! The end-to-end pipeline.
//!
//! The orchestrator sequences collection, inspection, generation,
//! guardrail assessment, adaptation, and apply per router, maintains the
//! durable artifacts along the way, and owns the run-level policy: mode
//! gating, cancellation, the concurrent-run lock, and the exit code.
//!
//! Collection and generation fan out internally; applies run strictly
//! sequentially across routers so a misbehaving change never hits two
//! routers at once.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use crossbeam_queue::SegQueue;
use crossbeam_utils::thread;
use log::{error, info, warn};
use crate::adapter;
use crate::artifacts::{
    self, DeploymentMatrix, DiscoverySnapshot
};
use crate::audit::{AuditEvent, AuditLog};
use crate::collector::{CollectionReport, Collector, RouterProfile};
use crate::config::Config;
use crate::error::{ExitError, Failed};
use crate::generator::{BatchTarget, Generator};
use crate::guardrails::{
    Decision, GuardrailContext, GuardrailEngine, PrefixCounts,
};
use crate::netconf::NetconfApplier;
use crate::process::RunLock;
use crate::proxy::ProxyManager;
use crate::rollout::{RolloutRun, TargetState};
use crate::rpki::RpkiValidator;
use crate::utils::fatal;
use crate::utils::sync::{Cancel, Mutex};


//------------ PipelineOptions -----------------------------------------------

/// What a pipeline run should do.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Whether to apply the generated policies to the routers.
    pub apply: bool,

    /// Whether the operator already confirmed the run.
    ///
    /// In system mode, applies that need confirmation are skipped
    /// without this.
    pub confirmed: bool,
}


//------------ PipelineSummary -----------------------------------------------

/// The aggregate outcome of a pipeline run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineSummary {
    /// Routers collected successfully.
    pub collected: usize,

    /// Devices that failed collection.
    pub collect_failures: usize,

    /// Policies generated over all routers.
    pub policies: usize,

    /// Per-AS generation failures.
    pub generate_failures: usize,

    /// Routers blocked by guardrails.
    pub blocked: usize,

    /// Routers applied and confirmed.
    pub applied: usize,

    /// Routers rolled back or failed during apply.
    pub rolled_back: usize,

    /// Routers whose apply waits for operator confirmation.
    pub awaiting_confirmation: usize,
}

impl PipelineSummary {
    /// Resolves the run’s exit status.
    ///
    /// Apply failures dominate guardrail blocks; both dominate ordinary
    /// per-device failures, which never fail a run on their own.
    pub fn into_exit(self) -> Result<Self, ExitError> {
        if self.rolled_back > 0 {
            Err(ExitError::ApplyFailed)
        }
        else if self.blocked > 0 {
            Err(ExitError::SafetyBlock)
        }
        else {
            Ok(self)
        }
    }
}


//------------ RouterWork ----------------------------------------------------

/// Everything prepared for one router, ready to apply.
pub struct RouterWork {
    /// The router identity.
    pub profile: RouterProfile,

    /// The generated policies, one per discovered AS.
    pub policies: Vec<crate::generator::PrefixListPolicy>,

    /// The composed configuration payload.
    pub payload: String,

    /// The guardrail decision for this router.
    pub decision: Decision,

    /// The overall risk level behind the decision.
    pub risk: crate::guardrails::RiskLevel,
}


//------------ Pipeline ------------------------------------------------------

/// The pipeline orchestrator.
pub struct Pipeline<'a> {
    config: &'a Config,
    cancel: Cancel,
    audit: AuditLog,

    /// The concurrent-run lock, held for the lifetime of the run.
    ///
    /// `None` means acquisition failed; the guardrail blocks applies.
    lock: Option<RunLock>,
}

impl<'a> Pipeline<'a> {
    /// Creates the pipeline, acquiring the run lock.
    pub fn new(
        config: &'a Config, cancel: Cancel
    ) -> Result<Self, Failed> {
        let audit = AuditLog::open(&config.audit_log_path())?;
        let lock = RunLock::acquire(&config.lock_file)?;
        if lock.is_none() {
            audit.record(AuditEvent::new(
                "run.lock_conflict", "blocked",
                format!(
                    "lock {} held by another run",
                    config.lock_file.display()
                )
            ));
        }
        Ok(Pipeline { config, cancel, audit, lock })
    }

    /// Returns a reference to the audit log.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Collects from all devices in the inventory and persists the
    /// discovery artifacts.
    pub fn discover(
        &self, devices_path: &Path
    ) -> Result<CollectionReport, Failed> {
        let devices = crate::collector::load_devices(devices_path)?;
        if devices.is_empty() {
            error!("Device inventory is empty.");
            return Err(Failed)
        }
        let collector = Collector::new(self.config);
        let report = collector.collect(&devices, &self.cancel);

        for result in &report.results {
            match result {
                crate::collector::CollectionResult::Collected(
                    profile
                ) => {
                    self.audit.record(
                        AuditEvent::new(
                            "collect.completed", "ok",
                            format!(
                                "{} AS numbers in {} groups",
                                profile.discovered_as_numbers.len(),
                                profile.bgp_groups.len()
                            )
                        ).router(&profile.hostname)
                    );
                }
                crate::collector::CollectionResult::Failed {
                    device, kind, detail
                } => {
                    self.audit.record(
                        AuditEvent::new(
                            "collect.failed", "failed",
                            format!("{}: {}", kind, detail)
                        ).router(&device.hostname)
                    );
                }
            }
        }

        let snapshot = DiscoverySnapshot::from_profiles(
            report.profiles()
        );
        artifacts::write_discovery(
            &self.config.discovered_dir(), &snapshot
        )?;
        DeploymentMatrix::from_snapshot(&snapshot)
            .write(&self.config.reports_dir())?;
        Ok(report)
    }

    /// Prepares the work for every collected router.
    ///
    /// Generates policies, writes the per-AS artifacts, runs the
    /// guardrails, and composes the payloads. The RPKI validator is
    /// loaded once and shared; generation fans out per router.
    pub fn prepare(
        &self,
        report: &CollectionReport,
        summary: &mut PipelineSummary,
    ) -> Result<Vec<RouterWork>, ExitError> {
        summary.collected = report.stats.collected;
        summary.collect_failures = report.stats.failed;

        let proxy = match ProxyManager::new(&self.config.irr_proxy) {
            Some(proxy) => {
                proxy.start().map_err(|_| ExitError::Generic)?;
                Some(Arc::new(proxy))
            }
            None => None,
        };
        let generator = Generator::new(self.config, proxy)
            .map_err(|_| ExitError::Generic)?;

        let rpki = if self.config.rpki.enabled {
            // The preflight gate comes first: with fail-closed set, a
            // run never proceeds on an absent or stale cache.
            if crate::rpki::preflight(&self.config.rpki).is_err() {
                self.audit.record(AuditEvent::new(
                    "rpki.preflight.failed", "failed",
                    "VRP cache absent, unreadable, or stale".into()
                ));
                if self.config.rpki.fail_closed {
                    return Err(ExitError::RpkiPreflight)
                }
            }
            match RpkiValidator::load(&self.config.rpki) {
                Ok(validator) => Some(validator),
                Err(_) => {
                    warn!(
                        "RPKI validation disabled for this run: \
                         VRP cache could not be loaded."
                    );
                    None
                }
            }
        }
        else {
            None
        };

        let engine = GuardrailEngine::new(
            &self.config.guardrails, self.config.mode
        );
        let previous_counts = artifacts::load_prefix_counts(
            &self.config.reports_dir()
        );
        let mut new_counts: BTreeMap<String, PrefixCounts> =
            previous_counts.clone();

        let mut work = Vec::new();
        for profile in report.profiles() {
            if self.cancel.is_tripped() {
                warn!("Cancellation requested; stopping preparation.");
                break
            }

            let targets: Vec<BatchTarget> = profile
                .discovered_as_numbers.iter()
                .map(|asn| BatchTarget::from_asn(*asn))
                .collect();
            let batch = generator.generate_batch(
                targets, &self.cancel
            );
            summary.policies += batch.stats.generated;
            summary.generate_failures += batch.stats.failed;
            for entry in &batch.entries {
                if let Err(err) = &entry.result {
                    self.audit.record(
                        AuditEvent::new(
                            "generate.failed", "failed",
                            err.to_string()
                        ).router(&profile.hostname)
                    );
                    warn!(
                        "{}: generation failed for {}: {}",
                        profile.hostname, entry.input, err
                    );
                }
            }
            let policies: Vec<_> = batch.policies().cloned().collect();
            self.write_policy_files(&profile.hostname, &policies)?;

            let ctx = GuardrailContext {
                mode: self.config.mode,
                hostname: &profile.hostname,
                policies: &policies,
                previous_counts: previous_counts
                    .get(&profile.hostname).copied(),
                lock_held: self.lock.is_some(),
                cancel: &self.cancel,
                rpki: rpki.as_ref(),
                rpki_conf: if rpki.is_some() {
                    Some(&self.config.rpki)
                }
                else {
                    None
                },
            };
            let assessment = engine.assess(&ctx);
            for issue in assessment.issues() {
                warn!("{}", issue);
            }
            self.audit.record(
                AuditEvent::new(
                    "guardrails.assessed",
                    match assessment.decision {
                        Decision::Block => "blocked",
                        _ => "ok",
                    },
                    format!(
                        "risk {} decision {}",
                        assessment.level, assessment.decision
                    )
                ).router(&profile.hostname)
            );
            if assessment.decision == Decision::Block {
                summary.blocked += 1;
            }
            else {
                new_counts.insert(
                    profile.hostname.clone(),
                    PrefixCounts::of_policies(&policies)
                );
            }

            let payload = adapter::render_router_payload(
                &policies, self.config.include_import_chains
            );
            work.push(RouterWork {
                profile: profile.clone(),
                policies,
                payload,
                decision: assessment.decision,
                risk: assessment.level,
            });
        }

        if artifacts::store_prefix_counts(
            &self.config.reports_dir(), &new_counts
        ).is_err() {
            warn!("Failed to persist prefix counts for the next run.");
        }
        Ok(work)
    }

    /// Writes the per-AS artifact files for one router.
    fn write_policy_files(
        &self,
        hostname: &str,
        policies: &[crate::generator::PrefixListPolicy],
    ) -> Result<(), ExitError> {
        let dir = self.config.policies_dir().join(hostname);
        for policy in policies {
            let path = dir.join(adapter::policy_file_name(policy));
            fatal::write_file(&path, policy.content.as_bytes())
                .map_err(|_| ExitError::Generic)?;
        }
        let combined = adapter::render_combined(policies);
        fatal::write_file(
            &dir.join("combined_policies.txt"), combined.as_bytes()
        ).map_err(|_| ExitError::Generic)?;
        Ok(())
    }

    /// Applies the prepared work sequentially across routers.
    ///
    /// A blocked router is never applied. In autonomous mode applies are
    /// serialized by construction; a rollback or failure on one router
    /// does not keep the next from its own apply.
    pub fn apply_all(
        &self,
        work: &[RouterWork],
        options: &PipelineOptions,
        summary: &mut PipelineSummary,
    ) {
        let applier = NetconfApplier::new(
            &self.config.netconf, self.config.mode, &self.audit
        );
        for item in work {
            if self.cancel.is_tripped() {
                warn!("Cancellation requested; stopping applies.");
                break
            }
            self.apply_one(&applier, item, options, summary);
        }
    }

    /// Applies one router’s work if its decision allows.
    fn apply_one(
        &self,
        applier: &NetconfApplier,
        item: &RouterWork,
        options: &PipelineOptions,
        summary: &mut PipelineSummary,
    ) {
        match item.decision {
            Decision::Block => {
                info!(
                    "{}: blocked by guardrails, not applying.",
                    item.profile.hostname
                );
                return
            }
            Decision::ProceedWithConfirmation if !options.confirmed => {
                warn!(
                    "{}: risk {} requires confirmation; re-run with \
                     explicit confirmation to apply.",
                    item.profile.hostname, item.risk
                );
                summary.awaiting_confirmation += 1;
                return
            }
            _ => { }
        }
        if !options.apply {
            return
        }

        let report = applier.apply(
            &item.profile.hostname,
            &item.profile.address,
            &item.payload,
            options.confirmed,
            &self.cancel,
        );
        if report.confirmed() {
            summary.applied += 1;
        }
        else if report.state
            == crate::netconf::ApplierState::Previewed
        {
            summary.awaiting_confirmation += 1;
        }
        else {
            summary.rolled_back += 1;
            error!(
                "{}: apply did not confirm: {}",
                item.profile.hostname, report.detail
            );
        }
    }

    /// Executes a staged rollout over the prepared work.
    ///
    /// Stages run in order; within a stage, targets are applied in
    /// parallel up to the stage’s limit. A stage finishes only when all
    /// its targets are terminal. Pause or abort short-circuits the
    /// remaining stages; their targets are skipped.
    pub fn apply_rollout(
        &self,
        run: &mut RolloutRun,
        work: &[RouterWork],
        options: &PipelineOptions,
        summary: &mut PipelineSummary,
        state_path: &Path,
    ) -> Result<(), Failed> {
        let by_host: BTreeMap<&str, &RouterWork> = work.iter()
            .map(|item| (item.profile.hostname.as_str(), item))
            .collect();

        while let Some(stage_index) = run.next_stage() {
            if self.cancel.is_tripped() {
                run.abort("canceled by signal");
                break
            }
            let stage_name = run.stages[stage_index].name.clone();
            run.record(&format!("stage {} started", stage_name));
            info!("Rollout stage '{}' starting.", stage_name);

            self.run_stage(
                run, stage_index, &by_host, options, summary
            );

            run.record(&format!("stage {} finished", stage_name));
            run.save(state_path)?;

            if run.stages[stage_index].has_failures() {
                run.abort("stage had failures");
            }
        }

        // An aborted run skips whatever is still pending for good. A
        // paused run keeps its pending targets so it can be resumed.
        if run.state == crate::rollout::RunState::Aborted {
            for stage in &mut run.stages {
                for target in &mut stage.targets {
                    if target.state == TargetState::Pending {
                        let _ = target.transition(
                            TargetState::Skipped,
                            Some("run aborted".into())
                        );
                    }
                }
            }
        }
        run.finish_if_complete();
        run.save(state_path)?;
        Ok(())
    }

    /// Runs the targets of one stage with the stage’s parallelism.
    fn run_stage(
        &self,
        run: &mut RolloutRun,
        stage_index: usize,
        by_host: &BTreeMap<&str, &RouterWork>,
        options: &PipelineOptions,
        summary: &mut PipelineSummary,
    ) {
        let stage = &mut run.stages[stage_index];
        let workers = stage.max_parallel.min(stage.targets.len()).max(1);

        let tasks = SegQueue::new();
        for (index, target) in stage.targets.iter().enumerate() {
            if target.state == TargetState::Pending {
                tasks.push((index, target.hostname.clone()));
            }
        }

        // (target index, final state, detail, summary delta)
        let results: Mutex<
            Vec<(usize, TargetState, String, SummaryDelta)>
        > = Mutex::new(Vec::new());

        let applier = NetconfApplier::new(
            &self.config.netconf, self.config.mode, &self.audit
        );
        let res = thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| {
                    while let Some((index, hostname)) = tasks.pop() {
                        let outcome = self.rollout_target(
                            &applier, &hostname, by_host, options
                        );
                        results.lock().push((
                            index, outcome.0, outcome.1, outcome.2
                        ));
                    }
                });
            }
        });
        if res.is_err() {
            error!(
                "Rollout stage failed after a worker thread has \
                 panicked. This is most assuredly a bug."
            );
        }

        for (index, state, detail, delta) in results.into_inner() {
            let target = &mut stage.targets[index];
            let _ = target.transition(
                TargetState::InProgress, None
            );
            if let Err(err) = target.transition(
                state, Some(detail)
            ) {
                error!("{}: {}", target.hostname, err);
            }
            delta.apply(summary);
        }
    }

    /// Applies one rollout target and reports its outcome.
    fn rollout_target(
        &self,
        applier: &NetconfApplier,
        hostname: &str,
        by_host: &BTreeMap<&str, &RouterWork>,
        options: &PipelineOptions,
    ) -> (TargetState, String, SummaryDelta) {
        let item = match by_host.get(hostname) {
            Some(item) => *item,
            None => {
                return (
                    TargetState::Skipped,
                    "router not in prepared work".into(),
                    SummaryDelta::default(),
                )
            }
        };
        match item.decision {
            Decision::Block => {
                return (
                    TargetState::Skipped,
                    "blocked by guardrails".into(),
                    SummaryDelta::default(),
                )
            }
            Decision::ProceedWithConfirmation if !options.confirmed => {
                return (
                    TargetState::Skipped,
                    "awaiting operator confirmation".into(),
                    SummaryDelta {
                        awaiting_confirmation: 1,
                        ..Default::default()
                    },
                )
            }
            _ => { }
        }
        if self.cancel.is_tripped() {
            return (
                TargetState::Skipped,
                "canceled".into(),
                SummaryDelta::default(),
            )
        }

        let report = applier.apply(
            hostname,
            &item.profile.address,
            &item.payload,
            options.confirmed,
            &self.cancel,
        );
        if report.confirmed() {
            (
                TargetState::Completed,
                report.detail,
                SummaryDelta { applied: 1, ..Default::default() },
            )
        }
        else {
            (
                TargetState::Failed,
                report.detail,
                SummaryDelta { rolled_back: 1, ..Default::default() },
            )
        }
    }
}


//------------ SummaryDelta --------------------------------------------------

/// Summary counters produced on a worker thread.
#[derive(Clone, Copy, Debug, Default)]
struct SummaryDelta {
    applied: usize,
    rolled_back: usize,
    awaiting_confirmation: usize,
}

impl SummaryDelta {
    fn apply(self, summary: &mut PipelineSummary) {
        summary.applied += self.applied;
        summary.rolled_back += self.rolled_back;
        summary.awaiting_confirmation += self.awaiting_confirmation;
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_resolve_by_severity() {
        let summary = PipelineSummary::default();
        assert!(summary.into_exit().is_ok());

        let summary = PipelineSummary {
            blocked: 1, ..Default::default()
        };
        assert_eq!(
            summary.into_exit().unwrap_err(), ExitError::SafetyBlock
        );

        let summary = PipelineSummary {
            blocked: 1, rolled_back: 1, ..Default::default()
        };
        assert_eq!(
            summary.into_exit().unwrap_err(), ExitError::ApplyFailed
        );

        // Per-device failures alone never fail the run.
        let summary = PipelineSummary {
            collect_failures: 3, generate_failures: 2,
            ..Default::default()
        };
        assert!(summary.into_exit().is_ok());
    }
}
