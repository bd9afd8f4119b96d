//! The staged processing model.
//!
//! A stage is written against one of two traits, depending on whether its
//! work decomposes per unit:
//!
//! - [`AppendStage`]: each new input unit is processed on its own and its
//!   records are appended to the stage's artifact. Run through
//!   [`AppendOnly`], which owns the [`HashLedger`] bookkeeping: diffing,
//!   batching, per-batch commits, watermark recovery and forced rebuilds.
//! - [`RecomputeStage`]: the output is an aggregate over the whole corpus
//!   (clustering, layout, similarity). Run through [`FullRecompute`], which
//!   compares a single [`CorpusStamp`] and either does nothing or recomputes
//!   everything and replaces the artifact.
//!
//! Both wrappers implement the object-safe [`Stage`] trait the orchestrator
//! drives.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::error::{HashingError, PipelineError, ProcessingError, Result};
use crate::hashing::{corpus_hash, identity_hash, salted_corpus_hash};
use crate::layout::DataLayout;
use crate::ledger::{CorpusStamp, HashLedger};
use crate::progress::{NoProgress, StageProgressEvent, StageProgressReporter};

/// How a stage merges new work with what it computed before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputePolicy {
    AppendOnly,
    FullRecomputeOnDelta,
}

impl std::fmt::Display for RecomputePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecomputePolicy::AppendOnly => write!(f, "append_only"),
            RecomputePolicy::FullRecomputeOnDelta => write!(f, "full_recompute_on_delta"),
        }
    }
}

/// Per-stage switches of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Treat every candidate as new. Processed hashes are still committed.
    pub force: bool,
    /// Report what would be done without touching any file.
    pub check_only: bool,
}

/// One processable unit: its identity hash and its typed content.
#[derive(Debug, Clone)]
pub struct Unit<T> {
    pub hash: String,
    pub content: T,
}

/// One line of a stage artifact.
///
/// `source_hash` is the identity hash of the input unit that produced the
/// record (append-only stages) or the corpus hash of the aggregate
/// (recompute stages).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord<T> {
    pub source_hash: String,
    #[serde(flatten)]
    pub record: T,
}

pub type UnitResult<T> = std::result::Result<Vec<T>, ProcessingError>;

/// Cooperative cancellation checked at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a stage needs from its surroundings.
#[derive(Clone)]
pub struct StageContext {
    pub layout: DataLayout,
    pub batch_size: usize,
    pub concurrency: usize,
    cancel: CancelFlag,
    progress: Arc<dyn StageProgressReporter>,
}

impl StageContext {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            batch_size: 32,
            concurrency: 4,
            cancel: CancelFlag::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn StageProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report_progress(&self, event: StageProgressEvent) {
        self.progress.report(event);
    }

    /// Read the committed records of another stage's artifact.
    ///
    /// For append-only stages only the bytes covered by the ledger watermark
    /// are read, so a tail left behind by an interrupted batch is invisible
    /// downstream. A stage that never committed reads as empty.
    pub fn read_committed<T: DeserializeOwned>(&self, stage: &str) -> Result<Vec<StoredRecord<T>>> {
        let ledger_path = self.layout.ledger_path(stage);
        if ledger_path.exists() {
            let ledger = HashLedger::load(&ledger_path, stage)?;
            let staging = self.layout.rebuild_artifact(stage);
            let artifact = if ledger.rebuild_pending() && staging.exists() {
                staging
            } else {
                self.layout.artifact(stage)
            };
            return artifact.read_prefix(Some(ledger.output_bytes()));
        }
        if self.layout.stamp_path(stage).exists() {
            return self.layout.artifact(stage).read_all();
        }
        Ok(Vec::new())
    }

    /// [`StageContext::read_committed`] without the envelope.
    pub fn read_committed_records<T: DeserializeOwned>(&self, stage: &str) -> Result<Vec<T>> {
        Ok(self
            .read_committed(stage)?
            .into_iter()
            .map(|r| r.record)
            .collect())
    }
}

/// What happened to a stage during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Nothing new; the stage did no work.
    UpToDate,
    /// New units were processed and appended.
    Processed,
    /// The aggregate was recomputed and the artifact replaced.
    Recomputed,
    /// Check-only: new units are waiting.
    WouldProcess,
    /// Check-only: the corpus changed and would be recomputed.
    WouldRecompute,
    /// Stopped at a batch boundary by a cancellation request.
    Interrupted,
    /// Check-only: a dependency has no committed state yet.
    Blocked,
    Failed,
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageOutcome::UpToDate => "up to date",
            StageOutcome::Processed => "processed",
            StageOutcome::Recomputed => "recomputed",
            StageOutcome::WouldProcess => "would process",
            StageOutcome::WouldRecompute => "would recompute",
            StageOutcome::Interrupted => "interrupted",
            StageOutcome::Blocked => "blocked",
            StageOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Counts produced by one stage run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageReport {
    pub stage: String,
    pub policy: RecomputePolicy,
    pub outcome: StageOutcome,
    /// Distinct candidate units after hashing.
    pub candidates: usize,
    pub processed: usize,
    /// Already in the ledger (or unchanged corpus).
    pub skipped: usize,
    pub failed: usize,
    pub hash_errors: usize,
    /// Check-only: units that would be processed.
    pub pending: usize,
    pub records_written: usize,
    /// Output records dropped because an equal record already existed.
    pub deduplicated: usize,
    pub batches: usize,
    /// Bytes past the ledger watermark found at start (dropped unless check-only).
    pub uncommitted_bytes: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, u64>,
}

impl StageReport {
    pub fn new(stage: &str, policy: RecomputePolicy) -> Self {
        Self {
            stage: stage.to_string(),
            policy,
            outcome: StageOutcome::UpToDate,
            candidates: 0,
            processed: 0,
            skipped: 0,
            failed: 0,
            hash_errors: 0,
            pending: 0,
            records_written: 0,
            deduplicated: 0,
            batches: 0,
            uncommitted_bytes: 0,
            metrics: BTreeMap::new(),
        }
    }
}

/// Object-safe view of a stage, driven by the orchestrator.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn policy(&self) -> RecomputePolicy;

    /// Files besides ledger, stamp and artifact that this stage owns.
    fn owned_paths(&self, _layout: &DataLayout) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn run(&self, ctx: &StageContext, options: RunOptions) -> Result<StageReport>;
}

/// A stage whose work decomposes into independent per-unit steps.
#[async_trait]
pub trait AppendStage: Send + Sync {
    type Input: Serialize + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Candidate units from the input source, in source order.
    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<Self::Input>>;

    /// Identity hash of a unit. Defaults to the canonical hash of the whole input.
    fn identity(&self, input: &Self::Input) -> std::result::Result<String, HashingError> {
        identity_hash(input)
    }

    /// Process one unit into zero or more output records.
    async fn process(
        &self,
        ctx: &StageContext,
        unit: &Unit<Self::Input>,
    ) -> UnitResult<Self::Output>;

    /// Process a batch. Returns one result per unit, in order.
    ///
    /// The default fans out to [`AppendStage::process`] with at most
    /// `ctx.concurrency` units in flight. An `Err` here is a batch failure:
    /// nothing from the batch is committed and the stage aborts.
    async fn process_batch(
        &self,
        ctx: &StageContext,
        units: &[Unit<Self::Input>],
    ) -> Result<Vec<UnitResult<Self::Output>>> {
        let pending: Vec<_> = units.iter().map(|unit| self.process(ctx, unit)).collect();
        Ok(stream::iter(pending)
            .buffered(ctx.concurrency.max(1))
            .collect()
            .await)
    }

    /// Whether [`AppendStage::output_key`] is meaningful for this stage.
    fn keyed_outputs(&self) -> bool {
        false
    }

    /// Key under which an output record is written at most once.
    fn output_key(&self, _output: &Self::Output) -> Option<String> {
        None
    }

    /// Runs after every completed run that was neither check-only nor
    /// interrupted, including runs with nothing new to process.
    async fn finish(&self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }
}

/// Result of recomputing an aggregate.
#[derive(Debug)]
pub struct Recomputed<O> {
    pub records: Vec<O>,
    /// Units left out of the aggregate (retried on the next run).
    pub failed: Vec<String>,
    pub metrics: BTreeMap<String, u64>,
}

impl<O> Recomputed<O> {
    pub fn new(records: Vec<O>) -> Self {
        Self {
            records,
            failed: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }
}

/// A stage whose output is an aggregate over the whole corpus.
#[async_trait]
pub trait RecomputeStage: Send + Sync {
    type Input: Serialize + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn load_inputs(&self, ctx: &StageContext) -> Result<Vec<Self::Input>>;

    fn identity(&self, input: &Self::Input) -> std::result::Result<String, HashingError> {
        identity_hash(input)
    }

    /// Settings the aggregate depends on besides its inputs (model, thresholds).
    /// Folded into the corpus stamp, so changing them triggers a recompute.
    fn corpus_salt(&self) -> Option<String> {
        None
    }

    /// Recompute the aggregate from every unit of the corpus.
    async fn recompute(
        &self,
        ctx: &StageContext,
        units: &[Unit<Self::Input>],
        previous: Option<Vec<Self::Output>>,
    ) -> Result<Recomputed<Self::Output>>;

    fn owned_paths(&self, _layout: &DataLayout) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Hash inputs into units, dropping unhashable ones and duplicates.
fn hash_units<T, F>(stage: &str, inputs: Vec<T>, identity: F) -> (Vec<Unit<T>>, usize)
where
    F: Fn(&T) -> std::result::Result<String, HashingError>,
{
    let mut seen = HashSet::new();
    let mut units = Vec::with_capacity(inputs.len());
    let mut hash_errors = 0;
    for content in inputs {
        match identity(&content) {
            Ok(hash) => {
                if seen.insert(hash.clone()) {
                    units.push(Unit { hash, content });
                }
            }
            Err(e) => {
                warn!(stage, error = %e, "Skipping unit that cannot be hashed");
                hash_errors += 1;
            }
        }
    }
    (units, hash_errors)
}

/// Runs an [`AppendStage`] under the per-unit ledger.
pub struct AppendOnly<S>(pub S);

impl<S: AppendStage> AppendOnly<S> {
    pub fn new(stage: S) -> Self {
        Self(stage)
    }

    pub fn inner(&self) -> &S {
        &self.0
    }

    async fn append_new(
        &self,
        ctx: &StageContext,
        ledger: &mut HashLedger,
        artifact: &Artifact,
        units: Vec<Unit<S::Input>>,
        report: &mut StageReport,
    ) -> Result<()> {
        let stage = &self.0;
        let name = stage.name();
        let mut seen_keys = HashSet::new();
        if stage.keyed_outputs() {
            let existing: Vec<StoredRecord<S::Output>> =
                artifact.read_prefix(Some(ledger.output_bytes()))?;
            seen_keys.extend(existing.iter().filter_map(|r| stage.output_key(&r.record)));
        }

        let total = units.len() as u64;
        let mut done = 0u64;
        for batch in units.chunks(ctx.batch_size.max(1)) {
            if ctx.is_cancelled() {
                warn!(stage = name, committed = done, total, "Interrupted between batches");
                report.outcome = StageOutcome::Interrupted;
                return Ok(());
            }

            let results = stage.process_batch(ctx, batch).await?;
            if results.len() != batch.len() {
                return Err(PipelineError::batch(
                    name,
                    format!("{} results for {} units", results.len(), batch.len()),
                ));
            }

            let mut records = Vec::new();
            let mut committed = Vec::new();
            for (unit, result) in batch.iter().zip(results) {
                match result {
                    Ok(outputs) => {
                        for record in outputs {
                            if let Some(key) = stage.output_key(&record) {
                                if !seen_keys.insert(key) {
                                    report.deduplicated += 1;
                                    continue;
                                }
                            }
                            records.push(StoredRecord {
                                source_hash: unit.hash.clone(),
                                record,
                            });
                        }
                        committed.push(unit.hash.clone());
                    }
                    Err(e) => {
                        warn!(stage = name, error = %e, "Unit failed; it will be retried next run");
                        report.failed += 1;
                    }
                }
            }

            let output_bytes = if records.is_empty() {
                ledger.output_bytes()
            } else {
                artifact
                    .append(&records)
                    .map_err(|e| PipelineError::batch(name, e))?
            };
            ledger.commit(committed.iter().cloned(), output_bytes)?;

            report.processed += committed.len();
            report.records_written += records.len();
            report.batches += 1;
            done += batch.len() as u64;
            debug!(stage = name, batch = report.batches, units = batch.len(), "Batch committed");
            ctx.report_progress(StageProgressEvent::Processing {
                stage: name.to_string(),
                n: done,
                total,
            });
        }
        report.outcome = StageOutcome::Processed;
        Ok(())
    }

    /// Forced run: reprocess everything into a staged copy, then swap it in.
    async fn rebuild(
        &self,
        ctx: &StageContext,
        ledger: &mut HashLedger,
        artifact: &Artifact,
        staging: &Artifact,
        units: Vec<Unit<S::Input>>,
        report: &mut StageReport,
    ) -> Result<()> {
        let stage = &self.0;
        let name = stage.name();
        let previous: Vec<StoredRecord<S::Output>> =
            artifact.read_prefix(Some(ledger.output_bytes()))?;

        let total = units.len() as u64;
        let mut done = 0u64;
        let mut fresh = Vec::new();
        let mut reprocessed: Vec<String> = Vec::new();
        for batch in units.chunks(ctx.batch_size.max(1)) {
            if ctx.is_cancelled() {
                warn!(stage = name, "Forced rebuild interrupted; previous artifact kept");
                report.outcome = StageOutcome::Interrupted;
                return Ok(());
            }

            let results = stage.process_batch(ctx, batch).await?;
            if results.len() != batch.len() {
                return Err(PipelineError::batch(
                    name,
                    format!("{} results for {} units", results.len(), batch.len()),
                ));
            }
            for (unit, result) in batch.iter().zip(results) {
                match result {
                    Ok(outputs) => {
                        reprocessed.push(unit.hash.clone());
                        fresh.extend(outputs.into_iter().map(|record| StoredRecord {
                            source_hash: unit.hash.clone(),
                            record,
                        }));
                    }
                    Err(e) => {
                        warn!(stage = name, error = %e, "Unit failed; previous records kept");
                        report.failed += 1;
                    }
                }
            }
            report.batches += 1;
            done += batch.len() as u64;
            ctx.report_progress(StageProgressEvent::Processing {
                stage: name.to_string(),
                n: done,
                total,
            });
        }

        let replaced: HashSet<&str> = reprocessed.iter().map(String::as_str).collect();
        let mut seen_keys = HashSet::new();
        let mut assembled = Vec::with_capacity(previous.len() + fresh.len());
        for record in previous
            .into_iter()
            .filter(|r| !replaced.contains(r.source_hash.as_str()))
            .chain(fresh)
        {
            if let Some(key) = stage.output_key(&record.record) {
                if !seen_keys.insert(key) {
                    report.deduplicated += 1;
                    continue;
                }
            }
            if replaced.contains(record.source_hash.as_str()) {
                report.records_written += 1;
            }
            assembled.push(record);
        }

        let output_bytes = staging
            .replace(&assembled)
            .map_err(|e| PipelineError::batch(name, e))?;
        ledger.commit_rebuild(reprocessed.iter().cloned(), output_bytes)?;
        staging.promote_to(artifact)?;
        ledger.finish_rebuild()?;

        report.processed = reprocessed.len();
        report.outcome = StageOutcome::Processed;
        Ok(())
    }
}

/// Finish or discard a forced rebuild left behind by an earlier process.
fn recover_rebuild(
    name: &str,
    ledger: &mut HashLedger,
    artifact: &Artifact,
    staging: &Artifact,
) -> Result<()> {
    if ledger.rebuild_pending() {
        if staging.exists() {
            staging.promote_to(artifact)?;
            info!(stage = name, "Completed interrupted rebuild");
        }
        ledger.finish_rebuild()?;
    } else if staging.exists() {
        warn!(stage = name, "Discarding unfinished rebuild");
        staging.remove()?;
    }
    Ok(())
}

#[async_trait]
impl<S: AppendStage> Stage for AppendOnly<S> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn policy(&self) -> RecomputePolicy {
        RecomputePolicy::AppendOnly
    }

    async fn run(&self, ctx: &StageContext, options: RunOptions) -> Result<StageReport> {
        let stage = &self.0;
        let name = stage.name();
        let mut report = StageReport::new(name, RecomputePolicy::AppendOnly);
        let artifact = ctx.layout.artifact(name);
        let staging = ctx.layout.rebuild_artifact(name);
        let mut ledger = HashLedger::load(ctx.layout.ledger_path(name), name)?;

        if !options.check_only {
            recover_rebuild(name, &mut ledger, &artifact, &staging)?;
        }

        let on_disk = if ledger.rebuild_pending() && staging.exists() {
            staging.len_bytes()?
        } else {
            artifact.len_bytes()?
        };
        let committed = ledger.output_bytes();
        if on_disk < committed {
            return Err(PipelineError::LedgerCorruption {
                path: ledger.path().to_path_buf(),
                reason: format!(
                    "artifact {} holds {} bytes but the ledger committed {}",
                    artifact.path().display(),
                    on_disk,
                    committed
                ),
            });
        }
        report.uncommitted_bytes = on_disk - committed;
        if report.uncommitted_bytes > 0 && !options.check_only {
            warn!(
                stage = name,
                bytes = report.uncommitted_bytes,
                "Dropping output written after the last ledger commit"
            );
            artifact.truncate(committed)?;
        }

        ctx.report_progress(StageProgressEvent::Scanning {
            stage: name.to_string(),
        });
        let inputs = stage.load_inputs(ctx)?;
        let (units, hash_errors) = hash_units(name, inputs, |i| stage.identity(i));
        report.candidates = units.len();
        report.hash_errors = hash_errors;

        let new_units: Vec<Unit<S::Input>> = if options.force {
            units
        } else {
            let hashes: Vec<&str> = units.iter().map(|u| u.hash.as_str()).collect();
            let diff = ledger.diff(&hashes);
            report.skipped = diff.already_processed.len();
            let new: HashSet<String> = diff.new.into_iter().collect();
            units.into_iter().filter(|u| new.contains(&u.hash)).collect()
        };

        if options.check_only {
            report.pending = new_units.len();
            report.outcome = if new_units.is_empty() {
                StageOutcome::UpToDate
            } else {
                StageOutcome::WouldProcess
            };
            return Ok(report);
        }

        if new_units.is_empty() {
            info!(stage = name, skipped = report.skipped, "Up to date");
            stage.finish(ctx).await?;
            return Ok(report);
        }

        info!(
            stage = name,
            new = new_units.len(),
            skipped = report.skipped,
            force = options.force,
            "Processing new units"
        );
        if options.force {
            self.rebuild(ctx, &mut ledger, &artifact, &staging, new_units, &mut report)
                .await?;
        } else {
            self.append_new(ctx, &mut ledger, &artifact, new_units, &mut report)
                .await?;
        }
        if report.outcome != StageOutcome::Interrupted {
            stage.finish(ctx).await?;
        }

        info!(
            stage = name,
            processed = report.processed,
            failed = report.failed,
            records = report.records_written,
            outcome = %report.outcome,
            "Stage finished"
        );
        Ok(report)
    }
}

/// Runs a [`RecomputeStage`] under a corpus stamp.
pub struct FullRecompute<S>(pub S);

impl<S: RecomputeStage> FullRecompute<S> {
    pub fn new(stage: S) -> Self {
        Self(stage)
    }

    pub fn inner(&self) -> &S {
        &self.0
    }
}

#[async_trait]
impl<S: RecomputeStage> Stage for FullRecompute<S> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn policy(&self) -> RecomputePolicy {
        RecomputePolicy::FullRecomputeOnDelta
    }

    fn owned_paths(&self, layout: &DataLayout) -> Vec<PathBuf> {
        self.0.owned_paths(layout)
    }

    async fn run(&self, ctx: &StageContext, options: RunOptions) -> Result<StageReport> {
        let stage = &self.0;
        let name = stage.name();
        let mut report = StageReport::new(name, RecomputePolicy::FullRecomputeOnDelta);
        let artifact = ctx.layout.artifact(name);
        let stamp_path = ctx.layout.stamp_path(name);
        let previous = CorpusStamp::load(&stamp_path, name)?;

        ctx.report_progress(StageProgressEvent::Scanning {
            stage: name.to_string(),
        });
        let inputs = stage.load_inputs(ctx)?;
        let (units, hash_errors) = hash_units(name, inputs, |i| stage.identity(i));
        report.candidates = units.len();
        report.hash_errors = hash_errors;

        let salt = stage.corpus_salt();
        let corpus = salted_corpus_hash(
            &corpus_hash(units.iter().map(|u| u.hash.as_str())),
            salt.as_deref(),
        );
        let unchanged = previous
            .as_ref()
            .map(|s| s.corpus_hash == corpus)
            .unwrap_or(false);

        if unchanged && !options.force {
            report.skipped = units.len();
            if !options.check_only {
                info!(stage = name, units = units.len(), "Corpus unchanged");
            }
            return Ok(report);
        }

        if options.check_only {
            report.pending = units.len();
            report.outcome = StageOutcome::WouldRecompute;
            return Ok(report);
        }

        if ctx.is_cancelled() {
            report.outcome = StageOutcome::Interrupted;
            return Ok(report);
        }

        let prior = if previous.is_some() {
            let records: Vec<StoredRecord<S::Output>> = artifact.read_all()?;
            Some(records.into_iter().map(|r| r.record).collect())
        } else {
            None
        };

        info!(
            stage = name,
            units = units.len(),
            previous_units = previous.as_ref().map(|s| s.unit_count).unwrap_or(0),
            force = options.force,
            "Recomputing aggregate"
        );
        ctx.report_progress(StageProgressEvent::Recomputing {
            stage: name.to_string(),
            units: units.len() as u64,
        });
        let result = stage.recompute(ctx, &units, prior).await?;

        let failed: HashSet<&str> = result.failed.iter().map(String::as_str).collect();
        let included: Vec<&str> = units
            .iter()
            .map(|u| u.hash.as_str())
            .filter(|h| !failed.contains(h))
            .collect();
        let stamp_hash = salted_corpus_hash(&corpus_hash(included.iter().copied()), salt.as_deref());

        let records: Vec<StoredRecord<S::Output>> = result
            .records
            .into_iter()
            .map(|record| StoredRecord {
                source_hash: stamp_hash.clone(),
                record,
            })
            .collect();
        artifact.replace(&records)?;
        CorpusStamp::new(name, stamp_hash, included.len()).write(&stamp_path)?;

        if !failed.is_empty() {
            warn!(
                stage = name,
                failed = failed.len(),
                "Units left out of the aggregate; the next run recomputes"
            );
        }
        report.processed = included.len();
        report.failed = failed.len();
        report.records_written = records.len();
        report.batches = 1;
        report.metrics = result.metrics;
        report.outcome = StageOutcome::Recomputed;
        info!(
            stage = name,
            units = report.processed,
            records = report.records_written,
            "Aggregate replaced"
        );
        Ok(report)
    }
}
