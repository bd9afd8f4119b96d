//! Stage graph and pipeline runs.
//!
//! A [`Pipeline`] is the declarative list of stages in topological order,
//! each with its dependencies. It is validated once when built: names are
//! unique and every dependency is declared before its dependents. A run
//! ([`Pipeline::run`]) interprets a [`RunRequest`] against that list:
//!
//! ```text
//! requested steps ──► reorder to declared order ──► drop --skip-* ──► plan
//!      plan ──► [clear-state] ──► for each stage: dependency check ──► Stage::run
//! ```
//!
//! Runs are fail-fast. The first stage that errors stops the plan and the
//! [`PipelineFailure`] carries the report of everything that ran before it.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifact::remove_if_exists;
use crate::error::{PipelineError, Result};
use crate::stage::{RecomputePolicy, RunOptions, Stage, StageContext, StageOutcome, StageReport};

/// Static description of one stage.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StageSpec {
    pub name: &'static str,
    pub depends_on: Vec<&'static str>,
    pub policy: RecomputePolicy,
}

struct Entry {
    depends_on: Vec<&'static str>,
    stage: Box<dyn Stage>,
}

/// What the caller asked for in one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Stages to run; empty means all.
    pub steps: Vec<String>,
    pub skips: Vec<String>,
    pub force: bool,
    pub check_only: bool,
    pub clear_state: bool,
}

/// The stages a run will execute, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub stages: Vec<&'static str>,
    /// The caller listed steps in an order other than the declared one.
    pub reordered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub started_at: i64,
    pub duration_ms: u64,
    pub check_only: bool,
    pub force: bool,
    pub clear_state: bool,
    pub interrupted: bool,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    fn new(request: &RunRequest) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now().timestamp(),
            duration_ms: 0,
            check_only: request.check_only,
            force: request.force,
            clear_state: request.clear_state,
            interrupted: false,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// True when no stage did (or, in check-only mode, would do) any work.
    /// Every stage was up to date and nothing was skipped for errors.
    pub fn is_noop(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.outcome == StageOutcome::UpToDate && s.hash_errors == 0 && s.failed == 0)
    }
}

/// A run that stopped on an error.
#[derive(Debug)]
pub struct PipelineFailure {
    /// The stage that failed; `None` when the run failed before any stage started.
    pub stage: Option<String>,
    pub error: PipelineError,
    pub report: PipelineReport,
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "stage '{}' failed: {}", stage, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[derive(Default)]
pub struct Pipeline {
    entries: Vec<Entry>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. Its dependencies must already be declared.
    pub fn stage(mut self, stage: impl Stage + 'static, depends_on: &[&'static str]) -> Result<Self> {
        let name = stage.name();
        if self.position(name).is_some() {
            return Err(PipelineError::Definition(format!(
                "stage '{}' is declared twice",
                name
            )));
        }
        for dep in depends_on {
            if self.position(dep).is_none() {
                return Err(PipelineError::Definition(format!(
                    "stage '{}' depends on '{}', which is not declared before it",
                    name, dep
                )));
            }
        }
        self.entries.push(Entry {
            depends_on: depends_on.to_vec(),
            stage: Box::new(stage),
        });
        Ok(self)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.stage.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.stage.name()).collect()
    }

    pub fn specs(&self) -> Vec<StageSpec> {
        self.entries
            .iter()
            .map(|e| StageSpec {
                name: e.stage.name(),
                depends_on: e.depends_on.clone(),
                policy: e.stage.policy(),
            })
            .collect()
    }

    fn unknown(&self, name: &str) -> PipelineError {
        PipelineError::UnknownStage {
            name: name.to_string(),
            available: self.names().join(", "),
        }
    }

    /// Resolve requested steps and skips into the declared-order plan.
    pub fn plan(&self, steps: &[String], skips: &[String]) -> Result<Plan> {
        let mut requested = Vec::new();
        for step in steps {
            let idx = self.position(step).ok_or_else(|| self.unknown(step))?;
            if !requested.contains(&idx) {
                requested.push(idx);
            }
        }
        let mut skipped = HashSet::new();
        for skip in skips {
            skipped.insert(self.position(skip).ok_or_else(|| self.unknown(skip))?);
        }

        let reordered = requested.windows(2).any(|w| w[0] > w[1]);
        let indices: Vec<usize> = if requested.is_empty() {
            (0..self.entries.len()).collect()
        } else {
            let mut sorted = requested;
            sorted.sort_unstable();
            sorted
        };

        Ok(Plan {
            stages: indices
                .into_iter()
                .filter(|i| !skipped.contains(i))
                .map(|i| self.entries[i].stage.name())
                .collect(),
            reordered,
        })
    }

    /// Execute a run.
    pub async fn run(
        &self,
        ctx: &StageContext,
        request: &RunRequest,
    ) -> std::result::Result<PipelineReport, PipelineFailure> {
        let mut report = PipelineReport::new(request);
        let span = info_span!("pipeline", run_id = %report.run_id);
        let started = Instant::now();
        let result = self
            .run_plan(ctx, request, &mut report)
            .instrument(span)
            .await;
        report.duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => Ok(report),
            Err((stage, error)) => {
                if let Some(stage) = &stage {
                    error!(stage = %stage, error = %error, "Pipeline stopped");
                }
                Err(PipelineFailure {
                    stage,
                    error,
                    report,
                })
            }
        }
    }

    async fn run_plan(
        &self,
        ctx: &StageContext,
        request: &RunRequest,
        report: &mut PipelineReport,
    ) -> std::result::Result<(), (Option<String>, PipelineError)> {
        let plan = self
            .plan(&request.steps, &request.skips)
            .map_err(|e| (None, e))?;
        if plan.reordered {
            warn!(
                order = %plan.stages.join(" -> "),
                "Requested steps reordered to respect dependencies"
            );
        }
        info!(
            stages = plan.stages.len(),
            force = request.force,
            check_only = request.check_only,
            clear_state = request.clear_state,
            "Starting pipeline run"
        );

        if request.clear_state && !request.check_only {
            for name in &plan.stages {
                self.clear_stage(ctx, name)
                    .map_err(|e| (Some(name.to_string()), e))?;
            }
        }

        // A check-only run with --clear-state reports as if state were gone.
        let options = RunOptions {
            force: request.force || (request.clear_state && request.check_only),
            check_only: request.check_only,
        };

        let mut planned_before: HashSet<&str> = HashSet::new();
        for name in &plan.stages {
            let Some(entry) = self.position(name).map(|i| &self.entries[i]) else {
                continue;
            };

            if ctx.is_cancelled() {
                warn!(stage = name, "Run interrupted before stage started");
                report.interrupted = true;
                return Ok(());
            }

            let missing = entry.depends_on.iter().find(|dep| {
                !planned_before.contains(**dep) && !ctx.layout.has_committed_state(dep)
            });
            if let Some(dep) = missing {
                if request.check_only {
                    let mut blocked = StageReport::new(name, entry.stage.policy());
                    blocked.outcome = StageOutcome::Blocked;
                    report.stages.push(blocked);
                    planned_before.insert(name);
                    continue;
                }
                return Err((
                    Some(name.to_string()),
                    PipelineError::DependencyStale {
                        stage: name.to_string(),
                        dependency: dep.to_string(),
                    },
                ));
            }

            match entry.stage.run(ctx, options).await {
                Ok(stage_report) => {
                    let interrupted = stage_report.outcome == StageOutcome::Interrupted;
                    report.stages.push(stage_report);
                    if interrupted {
                        report.interrupted = true;
                        return Ok(());
                    }
                }
                Err(e) => {
                    let mut failed = StageReport::new(name, entry.stage.policy());
                    failed.outcome = StageOutcome::Failed;
                    report.stages.push(failed);
                    return Err((Some(name.to_string()), e));
                }
            }
            planned_before.insert(name);
        }
        Ok(())
    }

    fn clear_stage(&self, ctx: &StageContext, name: &str) -> Result<()> {
        ctx.layout.clear_stage(name)?;
        if let Some(entry) = self.position(name).map(|i| &self.entries[i]) {
            for path in entry.stage.owned_paths(&ctx.layout) {
                remove_if_exists(&path)?;
            }
        }
        info!(stage = name, "Cleared stage state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DataLayout;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct CountingStage {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for CountingStage {
        fn name(&self) -> &'static str {
            self.name
        }
        fn policy(&self) -> RecomputePolicy {
            RecomputePolicy::AppendOnly
        }
        async fn run(&self, ctx: &StageContext, _options: RunOptions) -> Result<StageReport> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::batch(self.name, "boom"));
            }
            crate::ledger::HashLedger::load(ctx.layout.ledger_path(self.name), self.name)?
                .commit(Vec::<String>::new(), 0)?;
            let mut report = StageReport::new(self.name, RecomputePolicy::AppendOnly);
            report.outcome = StageOutcome::Processed;
            Ok(report)
        }
    }

    fn counting(name: &'static str, runs: &Arc<AtomicUsize>) -> CountingStage {
        CountingStage {
            name,
            runs: runs.clone(),
            fail: false,
        }
    }

    fn abc(runs: &Arc<AtomicUsize>) -> Pipeline {
        Pipeline::new()
            .stage(counting("a", runs), &[])
            .unwrap()
            .stage(counting("b", runs), &["a"])
            .unwrap()
            .stage(counting("c", runs), &["b"])
            .unwrap()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dependencies_must_be_declared_first() {
        let runs = Arc::new(AtomicUsize::new(0));
        let err = Pipeline::new()
            .stage(counting("b", &runs), &["a"])
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Definition(_)));
    }

    #[test]
    fn plan_reorders_and_skips() {
        let runs = Arc::new(AtomicUsize::new(0));
        let pipeline = abc(&runs);

        let plan = pipeline.plan(&strings(&["c", "a"]), &[]).unwrap();
        assert_eq!(plan.stages, vec!["a", "c"]);
        assert!(plan.reordered);

        let plan = pipeline.plan(&[], &strings(&["b"])).unwrap();
        assert_eq!(plan.stages, vec!["a", "c"]);
        assert!(!plan.reordered);
    }

    #[test]
    fn unknown_step_lists_available() {
        let runs = Arc::new(AtomicUsize::new(0));
        let err = abc(&runs).plan(&strings(&["nope"]), &[]).unwrap_err();
        match err {
            PipelineError::UnknownStage { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, "a, b, c");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_dependency_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let ctx = StageContext::new(DataLayout::new(tmp.path()));
        let runs = Arc::new(AtomicUsize::new(0));
        let request = RunRequest {
            steps: strings(&["b"]),
            ..Default::default()
        };
        let failure = abc(&runs).run(&ctx, &request).await.unwrap_err();
        assert!(matches!(
            failure.error,
            PipelineError::DependencyStale { ref dependency, .. } if dependency == "a"
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn check_only_reports_blocked() {
        let tmp = TempDir::new().unwrap();
        let ctx = StageContext::new(DataLayout::new(tmp.path()));
        let runs = Arc::new(AtomicUsize::new(0));
        let request = RunRequest {
            steps: strings(&["c"]),
            check_only: true,
            ..Default::default()
        };
        let report = abc(&runs).run(&ctx, &request).await.unwrap();
        assert_eq!(report.stages[0].outcome, StageOutcome::Blocked);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_stops_remaining_stages() {
        let tmp = TempDir::new().unwrap();
        let ctx = StageContext::new(DataLayout::new(tmp.path()));
        let runs = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new()
            .stage(counting("a", &runs), &[])
            .unwrap()
            .stage(
                CountingStage {
                    name: "b",
                    runs: runs.clone(),
                    fail: true,
                },
                &["a"],
            )
            .unwrap()
            .stage(counting("c", &runs), &["b"])
            .unwrap();

        let failure = pipeline.run(&ctx, &RunRequest::default()).await.unwrap_err();
        assert_eq!(failure.stage.as_deref(), Some("b"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(failure.report.stages.len(), 2);
        assert!(ctx.layout.has_committed_state("a"));
    }
}
