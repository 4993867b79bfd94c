//! Staged rollout plans.
//!
//! A rollout run is a durable plan for applying policies to a fleet in
//! waves: the run owns ordered stages, each stage owns one target per
//! router, and events are append-only. The plan is persisted as JSON so
//! an operator can pause or abort between stages and a crashed run can
//! be inspected afterwards.

use std::fmt;
use std::path::Path;
use chrono::{DateTime, Utc};
use log::error;
use uuid::Uuid;
use crate::error::Failed;
use crate::utils::fatal;


//------------ TargetState ---------------------------------------------------

/// The state of a single rollout target.
///
/// A target only ever moves pending → in_progress → one of the terminal
/// states.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TargetState {
    /// Returns whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TargetState::Completed
            | TargetState::Failed
            | TargetState::Skipped
        )
    }

    /// Returns whether a transition to `next` is allowed.
    ///
    /// A pending target may be skipped directly when its stage is
    /// short-circuited; everything else goes through in_progress.
    fn allows(self, next: TargetState) -> bool {
        match self {
            TargetState::Pending => {
                matches!(
                    next,
                    TargetState::InProgress | TargetState::Skipped
                )
            }
            TargetState::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TargetState::Pending => "pending",
            TargetState::InProgress => "in_progress",
            TargetState::Completed => "completed",
            TargetState::Failed => "failed",
            TargetState::Skipped => "skipped",
        })
    }
}


//------------ RolloutTarget -------------------------------------------------

/// One router inside a stage.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RolloutTarget {
    /// The router the target applies to.
    pub hostname: String,

    /// The current state.
    pub state: TargetState,

    /// Detail on the latest transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RolloutTarget {
    /// Creates a pending target.
    fn new(hostname: &str) -> Self {
        RolloutTarget {
            hostname: hostname.into(),
            state: TargetState::Pending,
            detail: None,
        }
    }

    /// Transitions the target, enforcing the state machine.
    pub fn transition(
        &mut self,
        next: TargetState,
        detail: Option<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.allows(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            })
        }
        self.state = next;
        self.detail = detail;
        Ok(())
    }
}


//------------ InvalidTransition ---------------------------------------------

/// A target transition violated the state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InvalidTransition {
    pub from: TargetState,
    pub to: TargetState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f, "invalid target transition {} -> {}", self.from, self.to
        )
    }
}


//------------ RolloutStage --------------------------------------------------

/// One wave of a rollout.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RolloutStage {
    /// The name of the stage.
    pub name: String,

    /// How many targets may be in progress at once.
    pub max_parallel: usize,

    /// The targets, one per router.
    pub targets: Vec<RolloutTarget>,
}

impl RolloutStage {
    /// Returns whether every target reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.targets.iter().all(|target| target.state.is_terminal())
    }

    /// Returns whether any target failed.
    pub fn has_failures(&self) -> bool {
        self.targets.iter().any(|target| {
            target.state == TargetState::Failed
        })
    }
}


//------------ RunState ------------------------------------------------------

/// The state of the whole rollout run.
#[derive(Clone, Copy, Debug, Eq, PartialEq,
    serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Active,
    Paused,
    Aborted,
    Completed,
}


//------------ RolloutEvent --------------------------------------------------

/// An append-only event on the run.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RolloutEvent {
    /// When the event happened.
    pub ts: DateTime<Utc>,

    /// What happened.
    pub detail: String,
}


//------------ RolloutRun ----------------------------------------------------

/// A durable rollout plan.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RolloutRun {
    /// The unique id of the run.
    pub id: String,

    /// When the run was created.
    pub created_at: DateTime<Utc>,

    /// The state of the run.
    pub state: RunState,

    /// The stages in execution order.
    pub stages: Vec<RolloutStage>,

    /// Append-only event trail.
    pub events: Vec<RolloutEvent>,
}

impl RolloutRun {
    /// Creates a new run from stage definitions.
    pub fn new(
        stages: impl IntoIterator<
            Item = (String, Vec<String>, usize)
        >
    ) -> Self {
        let mut run = RolloutRun {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state: RunState::Active,
            stages: stages.into_iter().map(|(name, hosts, parallel)| {
                RolloutStage {
                    name,
                    max_parallel: parallel.max(1),
                    targets: hosts.iter().map(|host| {
                        RolloutTarget::new(host)
                    }).collect(),
                }
            }).collect(),
            events: Vec::new(),
        };
        run.record("run created");
        run
    }

    /// Appends an event.
    pub fn record(&mut self, detail: &str) {
        self.events.push(RolloutEvent {
            ts: Utc::now(),
            detail: detail.into(),
        });
    }

    /// Pauses the run. Subsequent stages do not start.
    pub fn pause(&mut self) {
        if self.state == RunState::Active {
            self.state = RunState::Paused;
            self.record("run paused");
        }
    }

    /// Resumes a paused run.
    pub fn resume(&mut self) {
        if self.state == RunState::Paused {
            self.state = RunState::Active;
            self.record("run resumed");
        }
    }

    /// Aborts the run. Subsequent stages are skipped for good.
    pub fn abort(&mut self, reason: &str) {
        if matches!(self.state, RunState::Active | RunState::Paused) {
            self.state = RunState::Aborted;
            self.record(&format!("run aborted: {}", reason));
        }
    }

    /// Returns the index of the next stage to execute.
    ///
    /// `None` when the run is not active or all stages are complete.
    pub fn next_stage(&self) -> Option<usize> {
        if self.state != RunState::Active {
            return None
        }
        self.stages.iter().position(|stage| !stage.is_complete())
    }

    /// Marks the run completed if all stages are.
    pub fn finish_if_complete(&mut self) {
        if self.state == RunState::Active
            && self.stages.iter().all(RolloutStage::is_complete)
        {
            self.state = RunState::Completed;
            self.record("run completed");
        }
    }

    /// Persists the run as JSON.
    pub fn save(&self, path: &Path) -> Result<(), Failed> {
        let data = serde_json::to_vec_pretty(self).map_err(|err| {
            error!("Failed to serialize rollout run: {}", err);
            Failed
        })?;
        fatal::replace_file(path, &data)
    }

    /// Loads a run from its JSON state file.
    pub fn load(path: &Path) -> Result<Self, Failed> {
        let data = std::fs::read(path).map_err(|err| {
            error!(
                "Failed to read rollout run {}: {}",
                path.display(), err
            );
            Failed
        })?;
        serde_json::from_slice(&data).map_err(|err| {
            error!(
                "Failed to parse rollout run {}: {}",
                path.display(), err
            );
            Failed
        })
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    fn run() -> RolloutRun {
        RolloutRun::new(vec![
            (
                "canary".to_string(),
                vec!["edge1".to_string()],
                1
            ),
            (
                "fleet".to_string(),
                vec!["edge2".to_string(), "edge3".to_string()],
                2
            ),
        ])
    }

    #[test]
    fn targets_enforce_transitions() {
        let mut target = RolloutTarget::new("edge1");
        assert!(target.transition(
            TargetState::InProgress, None
        ).is_ok());
        assert!(target.transition(
            TargetState::Completed, None
        ).is_ok());
        // Terminal states are final.
        let err = target.transition(
            TargetState::InProgress, None
        ).unwrap_err();
        assert_eq!(err.from, TargetState::Completed);

        // Pending may be skipped directly.
        let mut target = RolloutTarget::new("edge2");
        assert!(target.transition(
            TargetState::Skipped, None
        ).is_ok());

        // completed -> failed is not a thing either.
        let mut target = RolloutTarget::new("edge3");
        target.transition(TargetState::InProgress, None).unwrap();
        target.transition(TargetState::Failed, None).unwrap();
        assert!(target.transition(
            TargetState::Completed, None
        ).is_err());
    }

    #[test]
    fn stages_execute_in_order() {
        let mut run = run();
        assert_eq!(run.next_stage(), Some(0));

        run.stages[0].targets[0]
            .transition(TargetState::InProgress, None).unwrap();
        assert_eq!(run.next_stage(), Some(0));

        run.stages[0].targets[0]
            .transition(TargetState::Completed, None).unwrap();
        assert_eq!(run.next_stage(), Some(1));

        for target in &mut run.stages[1].targets {
            target.transition(TargetState::Completed, None).unwrap();
        }
        assert_eq!(run.next_stage(), None);
        run.finish_if_complete();
        assert_eq!(run.state, RunState::Completed);
    }

    #[test]
    fn pause_and_abort_short_circuit() {
        let mut run = run();
        run.pause();
        assert_eq!(run.next_stage(), None);
        run.resume();
        assert_eq!(run.next_stage(), Some(0));
        run.abort("operator abort");
        assert_eq!(run.next_stage(), None);
        assert_eq!(run.state, RunState::Aborted);
        // Aborted is final.
        run.resume();
        assert_eq!(run.state, RunState::Aborted);
    }

    #[test]
    fn events_are_append_only() {
        let mut run = run();
        let before = run.events.len();
        run.record("stage canary started");
        assert_eq!(run.events.len(), before + 1);
        assert!(run.events.last().unwrap().detail.contains("canary"));
    }

    #[test]
    fn run_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollout.json");
        let mut run = run();
        run.stages[0].targets[0]
            .transition(TargetState::InProgress, None).unwrap();
        run.save(&path).unwrap();

        let loaded = RolloutRun::load(&path).unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(
            loaded.stages[0].targets[0].state,
            TargetState::InProgress
        );
        assert_eq!(loaded.events.len(), run.events.len());
    }
}
