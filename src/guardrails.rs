//! Safety guardrails over candidate policies.
//!
//! Every apply is preceded by a pass over the registered guardrails. A
//! guardrail looks at the candidate policies and the run context and
//! answers with a risk level plus the issues it found. The overall risk
//! of a run is the maximum over all guardrails; what happens at a given
//! level depends on the operational mode.
//!
//! Critical guardrails (bogon detection, the concurrent-run lock, signal
//! state) cannot be disabled through configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use ipnet::IpNet;
use log::warn;
use crate::asn::Asn;
use crate::config::{GuardrailConf, Mode, RpkiConf};
use crate::generator::PrefixListPolicy;
use crate::rpki::{RpkiState, RpkiValidator, ValidationStats};
use crate::utils::sync::Cancel;


//------------ RiskLevel -----------------------------------------------------

/// The severity of a guardrail finding.
#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd,
    serde::Deserialize, serde::Serialize
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        })
    }
}


//------------ GuardrailOutcome ----------------------------------------------

/// What a single guardrail found.
#[derive(Clone, Debug)]
pub struct GuardrailOutcome {
    /// The risk level.
    pub level: RiskLevel,

    /// Human-readable issues backing the level.
    pub issues: Vec<String>,
}

impl GuardrailOutcome {
    /// A low-risk outcome without issues.
    pub fn clear() -> Self {
        GuardrailOutcome { level: RiskLevel::Low, issues: Vec::new() }
    }

    /// An outcome at the given level with one issue.
    pub fn issue(level: RiskLevel, issue: String) -> Self {
        GuardrailOutcome { level, issues: vec![issue] }
    }
}


//------------ PrefixCounts --------------------------------------------------

/// Per-family prefix counts of a router’s policies.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq,
    serde::Deserialize, serde::Serialize
)]
pub struct PrefixCounts {
    pub ipv4: usize,
    pub ipv6: usize,
}

impl PrefixCounts {
    /// Counts the prefixes over a set of policies.
    pub fn of_policies(policies: &[PrefixListPolicy]) -> Self {
        let mut res = PrefixCounts::default();
        for policy in policies {
            for prefix in extract_prefixes(&policy.content) {
                match prefix {
                    IpNet::V4(_) => res.ipv4 += 1,
                    IpNet::V6(_) => res.ipv6 += 1,
                }
            }
        }
        res
    }
}


//------------ extract_prefixes ----------------------------------------------

/// Pulls the CIDR prefixes out of generated policy text.
///
/// bgpq4 output quotes each prefix on its own line inside the
/// prefix-list; anything that parses as a CIDR token counts.
pub fn extract_prefixes(content: &str) -> Vec<IpNet> {
    let mut res = Vec::new();
    for line in content.lines() {
        for token in line.split(|c: char| {
            c.is_whitespace() || c == ';' || c == '"'
        }) {
            if !token.contains('/') {
                continue
            }
            if let Ok(prefix) = IpNet::from_str(token) {
                res.push(prefix);
            }
        }
    }
    res
}


//------------ GuardrailContext ----------------------------------------------

/// Everything the guardrails may look at for one router.
pub struct GuardrailContext<'a> {
    /// The operational mode of the run.
    pub mode: Mode,

    /// The router the policies are destined for.
    pub hostname: &'a str,

    /// The candidate policies.
    pub policies: &'a [PrefixListPolicy],

    /// The prefix counts of the previous successful run, if known.
    pub previous_counts: Option<PrefixCounts>,

    /// Whether this process holds the concurrent-run lock.
    pub lock_held: bool,

    /// The run-wide cancellation token.
    pub cancel: &'a Cancel,

    /// The RPKI validator, when RPKI checking is enabled.
    pub rpki: Option<&'a RpkiValidator>,

    /// The RPKI configuration, when RPKI checking is enabled.
    pub rpki_conf: Option<&'a RpkiConf>,
}


//------------ Guardrail -----------------------------------------------------

/// A named safety check.
pub trait Guardrail: Send + Sync {
    /// The name of the guardrail, used in configuration and reports.
    fn name(&self) -> &'static str;

    /// Whether the guardrail can be disabled at runtime.
    ///
    /// Critical guardrails run regardless of the enabled list.
    fn critical(&self) -> bool;

    /// Runs the check.
    fn check(&self, ctx: &GuardrailContext) -> GuardrailOutcome;
}


//------------ PrefixCountGuardrail ------------------------------------------

/// Flags unusual swings in the total prefix count.
///
/// IPv4 and IPv6 are tracked separately and both contribute. The warning
/// threshold defaults to 25 percent in system mode and 10 percent in
/// autonomous mode.
pub struct PrefixCountGuardrail {
    warning_percent: f64,
    critical_percent: f64,
}

impl PrefixCountGuardrail {
    pub fn new(conf: &GuardrailConf, mode: Mode) -> Self {
        let warning = conf.prefix_count_warning_percent.unwrap_or(
            match mode {
                Mode::System => 25.,
                Mode::Autonomous => 10.,
            }
        );
        PrefixCountGuardrail {
            warning_percent: warning,
            critical_percent: conf.prefix_count_critical_percent
                .unwrap_or(50.),
        }
    }

    /// Returns the deviation of one family in percent.
    fn deviation(old: usize, new: usize) -> f64 {
        if old == 0 {
            if new == 0 {
                0.
            }
            else {
                100.
            }
        }
        else {
            (new as f64 - old as f64).abs() * 100. / old as f64
        }
    }
}

impl Guardrail for PrefixCountGuardrail {
    fn name(&self) -> &'static str {
        "prefix-count"
    }

    fn critical(&self) -> bool {
        false
    }

    fn check(&self, ctx: &GuardrailContext) -> GuardrailOutcome {
        let previous = match ctx.previous_counts {
            Some(previous) => previous,
            None => {
                // First run for this router, nothing to compare against.
                return GuardrailOutcome::clear()
            }
        };
        let current = PrefixCounts::of_policies(ctx.policies);
        let mut outcome = GuardrailOutcome::clear();
        for (family, old, new) in [
            ("IPv4", previous.ipv4, current.ipv4),
            ("IPv6", previous.ipv6, current.ipv6),
        ] {
            let deviation = Self::deviation(old, new);
            let level = if deviation > self.critical_percent {
                RiskLevel::Critical
            }
            else if deviation > self.warning_percent {
                RiskLevel::High
            }
            else {
                RiskLevel::Low
            };
            if level > RiskLevel::Low {
                outcome.issues.push(format!(
                    "{}: {} prefix count changed {} -> {} \
                     ({:.1}% deviation)",
                    ctx.hostname, family, old, new, deviation
                ));
            }
            outcome.level = outcome.level.max(level);
        }
        outcome
    }
}


//------------ BogonGuardrail ------------------------------------------------

/// Flags policies containing prefixes that must never be routed.
pub struct BogonGuardrail;

/// The IPv4 ranges that must never appear in a prefix list.
const BOGONS_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// The IPv6 equivalents, enforced with the same severity.
const BOGONS_V6: &[&str] = &[
    "::/8",
    "100::/64",
    "2001:2::/48",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// Returns the parsed bogon table.
fn bogon_table() -> &'static Vec<IpNet> {
    static TABLE: OnceLock<Vec<IpNet>> = OnceLock::new();
    TABLE.get_or_init(|| {
        BOGONS_V4.iter().chain(BOGONS_V6.iter()).map(|s| {
            IpNet::from_str(s).expect("bogon table entry parses")
        }).collect()
    })
}

/// Returns the bogon range a prefix overlaps, if any.
fn bogon_overlap(prefix: &IpNet) -> Option<&'static IpNet> {
    bogon_table().iter().find(|bogon| {
        bogon.contains(prefix) || prefix.contains(*bogon)
    })
}

impl Guardrail for BogonGuardrail {
    fn name(&self) -> &'static str {
        "bogon"
    }

    fn critical(&self) -> bool {
        true
    }

    fn check(&self, ctx: &GuardrailContext) -> GuardrailOutcome {
        let mut outcome = GuardrailOutcome::clear();
        for policy in ctx.policies {
            for prefix in extract_prefixes(&policy.content) {
                if let Some(bogon) = bogon_overlap(&prefix) {
                    outcome.level = RiskLevel::Critical;
                    outcome.issues.push(format!(
                        "{}: {} contains bogon {} (overlaps {})",
                        ctx.hostname, policy.policy_name, prefix, bogon
                    ));
                }
            }
        }
        outcome
    }
}


//------------ ConcurrentRunGuardrail ----------------------------------------

/// Reports whether this process owns the concurrent-run lock.
///
/// Acquisition itself happens in [`crate::process::RunLock`]; the
/// guardrail turns a missing lock into a blocking risk.
pub struct ConcurrentRunGuardrail;

impl Guardrail for ConcurrentRunGuardrail {
    fn name(&self) -> &'static str {
        "concurrent-run"
    }

    fn critical(&self) -> bool {
        true
    }

    fn check(&self, ctx: &GuardrailContext) -> GuardrailOutcome {
        if ctx.lock_held {
            GuardrailOutcome::clear()
        }
        else {
            GuardrailOutcome::issue(
                RiskLevel::Critical,
                "CONCURRENT_RUN: another instance holds the run lock"
                    .into()
            )
        }
    }
}


//------------ SignalGuardrail -----------------------------------------------

/// Blocks new applies once cancellation has been requested.
pub struct SignalGuardrail;

impl Guardrail for SignalGuardrail {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn critical(&self) -> bool {
        true
    }

    fn check(&self, ctx: &GuardrailContext) -> GuardrailOutcome {
        if ctx.cancel.is_tripped() {
            GuardrailOutcome::issue(
                RiskLevel::Critical,
                "cancellation requested, no new applies".into()
            )
        }
        else {
            GuardrailOutcome::clear()
        }
    }
}


//------------ RpkiGuardrail -------------------------------------------------

/// Validates every (prefix, origin) pair in the candidate policies.
pub struct RpkiGuardrail;

impl Guardrail for RpkiGuardrail {
    fn name(&self) -> &'static str {
        "rpki"
    }

    fn critical(&self) -> bool {
        false
    }

    fn check(&self, ctx: &GuardrailContext) -> GuardrailOutcome {
        let (validator, conf) = match (ctx.rpki, ctx.rpki_conf) {
            (Some(validator), Some(conf)) => (validator, conf),
            _ => return GuardrailOutcome::clear(),
        };

        let mut stats = ValidationStats::default();
        let mut invalid_samples: Vec<(IpNet, Asn)> = Vec::new();
        for policy in ctx.policies {
            let prefixes = extract_prefixes(&policy.content);
            let results = validator.validate_prefixes(
                &prefixes, policy.as_number, None
            );
            for result in &results {
                if result.state == RpkiState::Invalid
                    && invalid_samples.len() < 5
                {
                    invalid_samples.push((result.prefix, result.origin));
                }
            }
            let batch = ValidationStats::from_results(&results);
            stats.valid += batch.valid;
            stats.invalid += batch.invalid;
            stats.not_found += batch.not_found;
            stats.error += batch.error;
            stats.allowlisted += batch.allowlisted;
            stats.total += batch.total;
        }

        let mut outcome = GuardrailOutcome::clear();
        if stats.error > 0 && conf.fail_closed {
            outcome.level = RiskLevel::Critical;
            outcome.issues.push(format!(
                "{}: {} RPKI validations errored with fail-closed set",
                ctx.hostname, stats.error
            ));
        }
        let invalid = stats.invalid_percent();
        if invalid > conf.max_invalid_percent {
            let level = if invalid > conf.max_invalid_percent * 2. {
                RiskLevel::Critical
            }
            else {
                RiskLevel::High
            };
            outcome.level = outcome.level.max(level);
            outcome.issues.push(format!(
                "{}: {:.1}% of prefixes are RPKI invalid (limit {}%)",
                ctx.hostname, invalid, conf.max_invalid_percent
            ));
            for (prefix, origin) in &invalid_samples {
                outcome.issues.push(format!(
                    "  invalid: {} from {}", prefix, origin
                ));
            }
        }
        let not_found = stats.not_found_percent();
        if not_found > conf.max_notfound_percent {
            outcome.level = outcome.level.max(RiskLevel::High);
            outcome.issues.push(format!(
                "{}: {:.1}% of prefixes have no ROA (limit {}%)",
                ctx.hostname, not_found, conf.max_notfound_percent
            ));
        }
        outcome
    }
}


//------------ Decision ------------------------------------------------------

/// The mode-gated decision derived from the overall risk.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Proceed with the apply.
    Proceed,

    /// Proceed, but require an operator confirmation.
    ProceedWithConfirmation,

    /// Do not apply.
    Block,
}

impl Decision {
    /// Applies the decision matrix.
    pub fn from_level(mode: Mode, level: RiskLevel) -> Self {
        match (mode, level) {
            (Mode::System, RiskLevel::Low) => Decision::Proceed,
            (Mode::System, RiskLevel::Medium)
            | (Mode::System, RiskLevel::High) => {
                Decision::ProceedWithConfirmation
            }
            (Mode::System, RiskLevel::Critical) => Decision::Block,
            (Mode::Autonomous, RiskLevel::Low) => Decision::Proceed,
            (Mode::Autonomous, _) => Decision::Block,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Decision::Proceed => "PROCEED",
            Decision::ProceedWithConfirmation => {
                "PROCEED_WITH_CONFIRMATION"
            }
            Decision::Block => "BLOCK",
        })
    }
}


//------------ RiskAssessment ------------------------------------------------

/// The aggregated outcome of a guardrail pass.
#[derive(Debug)]
pub struct RiskAssessment {
    /// The overall risk: the maximum over all evaluated guardrails.
    pub level: RiskLevel,

    /// Per-guardrail outcomes in evaluation order.
    pub outcomes: Vec<(&'static str, GuardrailOutcome)>,

    /// The decision under the run’s mode.
    pub decision: Decision,
}

impl RiskAssessment {
    /// Returns all issues over all guardrails.
    pub fn issues(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().flat_map(|(_, outcome)| {
            outcome.issues.iter().map(String::as_str)
        })
    }
}


//------------ GuardrailEngine -----------------------------------------------

/// The registry of enabled guardrails.
pub struct GuardrailEngine {
    guardrails: Vec<Box<dyn Guardrail>>,
}

impl GuardrailEngine {
    /// Builds the engine from the configuration.
    ///
    /// An empty enabled list means the full built-in set. A critical
    /// guardrail missing from a non-empty list is enabled anyway with a
    /// warning.
    pub fn new(conf: &GuardrailConf, mode: Mode) -> Self {
        let builtins: Vec<Box<dyn Guardrail>> = vec![
            Box::new(PrefixCountGuardrail::new(conf, mode)),
            Box::new(BogonGuardrail),
            Box::new(ConcurrentRunGuardrail),
            Box::new(SignalGuardrail),
            Box::new(RpkiGuardrail),
        ];
        let guardrails = if conf.enabled_guardrails.is_empty() {
            builtins
        }
        else {
            builtins.into_iter().filter(|guardrail| {
                let listed = conf.enabled_guardrails.iter().any(|name| {
                    name == guardrail.name()
                });
                if !listed && guardrail.critical() {
                    warn!(
                        "Guardrail '{}' is critical and stays enabled.",
                        guardrail.name()
                    );
                }
                listed || guardrail.critical()
            }).collect()
        };
        GuardrailEngine { guardrails }
    }

    /// Runs all guardrails and aggregates the outcome.
    ///
    /// Evaluation order is unspecified; aggregation commutes.
    pub fn assess(&self, ctx: &GuardrailContext) -> RiskAssessment {
        let mut level = RiskLevel::Low;
        let mut outcomes = Vec::with_capacity(self.guardrails.len());
        for guardrail in &self.guardrails {
            let outcome = guardrail.check(ctx);
            level = level.max(outcome.level);
            outcomes.push((guardrail.name(), outcome));
        }
        RiskAssessment {
            level,
            outcomes,
            decision: Decision::from_level(ctx.mode, level),
        }
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    fn policy(content: &str) -> PrefixListPolicy {
        PrefixListPolicy {
            as_number: Asn::from_u32(64496),
            policy_name: "AS64496".into(),
            content: content.into(),
            generated_at: Utc::now(),
            cache_key: String::new(),
        }
    }

    fn context<'a>(
        policies: &'a [PrefixListPolicy],
        cancel: &'a Cancel,
    ) -> GuardrailContext<'a> {
        GuardrailContext {
            mode: Mode::System,
            hostname: "edge1",
            policies,
            previous_counts: None,
            lock_held: true,
            cancel,
            rpki: None,
            rpki_conf: None,
        }
    }

    const CLEAN_POLICY: &str = "\
        policy-options {\n\
        replace:\n\
         prefix-list AS64496 {\n\
            203.0.112.0/22;\n\
            41.78.188.0/22;\n\
         }\n\
        }\n\
    ";

    #[test]
    fn extracts_prefixes_from_policy_text() {
        let prefixes = extract_prefixes(CLEAN_POLICY);
        assert_eq!(prefixes.len(), 2);
        assert_eq!(prefixes[0].to_string(), "203.0.112.0/22");
    }

    #[test]
    fn bogon_detection_is_critical() {
        let policies = [policy(
            "prefix-list AS64496 {\n 10.0.0.0/8;\n}\n"
        )];
        let cancel = Cancel::new();
        let ctx = context(&policies, &cancel);
        let outcome = BogonGuardrail.check(&ctx);
        assert_eq!(outcome.level, RiskLevel::Critical);
        assert!(outcome.issues[0].contains("10.0.0.0/8"));

        // A more specific inside a bogon range trips too.
        let policies = [policy(
            "prefix-list AS64496 {\n 192.168.10.0/24;\n}\n"
        )];
        let ctx = context(&policies, &cancel);
        assert_eq!(
            BogonGuardrail.check(&ctx).level, RiskLevel::Critical
        );

        // IPv6 bogons carry the same severity.
        let policies = [policy(
            "prefix-list AS64496 {\n 2001:db8::/32;\n}\n"
        )];
        let ctx = context(&policies, &cancel);
        assert_eq!(
            BogonGuardrail.check(&ctx).level, RiskLevel::Critical
        );
    }

    #[test]
    fn clean_policy_passes_bogon_check() {
        let policies = [policy(CLEAN_POLICY)];
        let cancel = Cancel::new();
        let ctx = context(&policies, &cancel);
        let outcome = BogonGuardrail.check(&ctx);
        assert_eq!(outcome.level, RiskLevel::Low);
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn prefix_count_thresholds() {
        let conf = GuardrailConf::default();
        let guardrail = PrefixCountGuardrail::new(&conf, Mode::System);
        let policies = [policy(CLEAN_POLICY)];
        let cancel = Cancel::new();

        // No previous counts: first run passes.
        let ctx = context(&policies, &cancel);
        assert_eq!(guardrail.check(&ctx).level, RiskLevel::Low);

        // Small change passes.
        let mut ctx = context(&policies, &cancel);
        ctx.previous_counts = Some(PrefixCounts { ipv4: 2, ipv6: 0 });
        assert_eq!(guardrail.check(&ctx).level, RiskLevel::Low);

        // 50% drop in IPv4 exceeds the 25% system default.
        let mut ctx = context(&policies, &cancel);
        ctx.previous_counts = Some(PrefixCounts { ipv4: 4, ipv6: 0 });
        let outcome = guardrail.check(&ctx);
        assert_eq!(outcome.level, RiskLevel::High);
        assert!(outcome.issues[0].contains("IPv4"));

        // Beyond the critical threshold.
        let mut ctx = context(&policies, &cancel);
        ctx.previous_counts = Some(PrefixCounts { ipv4: 100, ipv6: 0 });
        assert_eq!(guardrail.check(&ctx).level, RiskLevel::Critical);
    }

    #[test]
    fn autonomous_default_is_stricter() {
        let conf = GuardrailConf::default();
        let autonomous = PrefixCountGuardrail::new(
            &conf, Mode::Autonomous
        );
        let system = PrefixCountGuardrail::new(&conf, Mode::System);
        assert_eq!(autonomous.warning_percent, 10.);
        assert_eq!(system.warning_percent, 25.);

        // A 20% swing passes the system default but not autonomous.
        assert_eq!(PrefixCountGuardrail::deviation(100, 80), 20.);
        let policies = [policy(CLEAN_POLICY)];
        let cancel = Cancel::new();
        let mut ctx = context(&policies, &cancel);
        ctx.mode = Mode::Autonomous;
        // The two clean prefixes against a previous count of 9 is a
        // deviation well past both thresholds.
        ctx.previous_counts = Some(PrefixCounts { ipv4: 9, ipv6: 0 });
        assert_eq!(autonomous.check(&ctx).level, RiskLevel::Critical);
    }

    #[test]
    fn concurrent_run_and_signal_block() {
        let policies = [policy(CLEAN_POLICY)];
        let cancel = Cancel::new();

        let mut ctx = context(&policies, &cancel);
        ctx.lock_held = false;
        let outcome = ConcurrentRunGuardrail.check(&ctx);
        assert_eq!(outcome.level, RiskLevel::Critical);
        assert!(outcome.issues[0].contains("CONCURRENT_RUN"));

        let ctx = context(&policies, &cancel);
        assert_eq!(SignalGuardrail.check(&ctx).level, RiskLevel::Low);
        cancel.trip();
        let ctx = context(&policies, &cancel);
        assert_eq!(
            SignalGuardrail.check(&ctx).level, RiskLevel::Critical
        );
    }

    #[test]
    fn decision_matrix() {
        use Decision::*;
        use RiskLevel::*;

        assert_eq!(Decision::from_level(Mode::System, Low), Proceed);
        assert_eq!(
            Decision::from_level(Mode::System, Medium),
            ProceedWithConfirmation
        );
        assert_eq!(
            Decision::from_level(Mode::System, High),
            ProceedWithConfirmation
        );
        assert_eq!(Decision::from_level(Mode::System, Critical), Block);
        assert_eq!(Decision::from_level(Mode::Autonomous, Low), Proceed);
        assert_eq!(Decision::from_level(Mode::Autonomous, Medium), Block);
        assert_eq!(Decision::from_level(Mode::Autonomous, High), Block);
        assert_eq!(
            Decision::from_level(Mode::Autonomous, Critical), Block
        );
    }

    #[test]
    fn aggregation_is_max() {
        let conf = GuardrailConf::default();
        let engine = GuardrailEngine::new(&conf, Mode::System);
        let policies = [policy(
            "prefix-list AS64496 {\n 10.0.0.0/8;\n}\n"
        )];
        let cancel = Cancel::new();
        let ctx = context(&policies, &cancel);
        let assessment = engine.assess(&ctx);
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert_eq!(assessment.decision, Decision::Block);
        assert!(assessment.issues().any(|issue| {
            issue.contains("bogon")
        }));
    }

    #[test]
    fn critical_guardrails_cannot_be_disabled() {
        let conf = GuardrailConf {
            enabled_guardrails: vec!["prefix-count".into()],
            ..Default::default()
        };
        let engine = GuardrailEngine::new(&conf, Mode::System);
        let names: Vec<&str> = engine.guardrails.iter()
            .map(|guardrail| guardrail.name()).collect();
        assert!(names.contains(&"bogon"));
        assert!(names.contains(&"concurrent-run"));
        assert!(names.contains(&"signal"));
        assert!(names.contains(&"prefix-count"));
        // The non-critical RPKI guardrail really is disabled.
        assert!(!names.contains(&"rpki"));
    }

    #[test]
    fn rpki_guardrail_thresholds() {
        use crate::rpki::VrpIndex;
        use crate::rpki::Vrp;
        use std::collections::HashSet;
        use std::str::FromStr;

        let index = VrpIndex::from_vrps(vec![
            Vrp {
                prefix: IpNet::from_str("203.0.112.0/22").unwrap(),
                max_length: 22,
                origin_as: Asn::from_u32(64499),
                trust_anchor: None,
            },
        ]);
        let validator = RpkiValidator::from_parts(
            index, HashSet::new(), false, true
        );
        let conf = RpkiConf {
            enabled: true,
            max_invalid_percent: 5.,
            max_notfound_percent: 90.,
            ..Default::default()
        };
        let policies = [policy(CLEAN_POLICY)];
        let cancel = Cancel::new();
        let mut ctx = context(&policies, &cancel);
        ctx.rpki = Some(&validator);
        ctx.rpki_conf = Some(&conf);

        // One of two prefixes is invalid: 50% > 2 * 5% -> critical.
        let outcome = RpkiGuardrail.check(&ctx);
        assert_eq!(outcome.level, RiskLevel::Critical);
        assert!(outcome.issues.iter().any(|issue| {
            issue.contains("RPKI invalid")
        }));
    }
}
