//! Pipeline driver.
//!
//! Stages run strictly in order: normalize, stage, dimensions, resolve,
//! bridges, fact, audit. Each produces a `StageReport`; the first fatal
//! failure marks every later stage `Skipped`. Audit failures are reported but
//! never fatal.

use crate::audit::{AuditLog, AuditLogEntry};
use crate::dimension::DimensionSpec;
use crate::error::{PipelineError, PlanError};
use crate::fact::{FactCounts, FactPolicy, FactSpec};
use crate::normalizer::{
    NormalizedBatch, Normalizer, NormalizerConfig, RejectedRecord, SourceRecord, SourceWindow,
};
use crate::resolver::{BridgeSpec, ResolutionPlan, ResolveStep, StepReport};
use crate::schema::TableSchema;
use crate::staging::{StageCounts, StagingStore, WriteMode};
use crate::warehouse::{LoadCounts, Warehouse};
use chrono::NaiveDate;
use std::fmt;
use tracing::{error, info, warn};

/// Rejections kept on the normalize stage report.
pub const REJECTION_SAMPLES: usize = 5;

/// A validated pipeline. Every column a stage names has been checked against
/// the staging and target schemas.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub normalizer: Normalizer,
    pub window: Option<SourceWindow>,
    pub staging: StagingStore,
    pub write_mode: WriteMode,
    pub dimensions: Vec<DimensionSpec>,
    pub plan: ResolutionPlan,
    pub bridges: Vec<BridgeSpec>,
    pub fact: FactSpec,
    pub audit: bool,
}

impl PipelineDefinition {
    pub fn builder(name: &str, staging_table: &str, record_schema: TableSchema, fact: FactSpec) -> PipelineBuilder {
        PipelineBuilder {
            name: name.to_string(),
            staging_table: staging_table.to_string(),
            record_schema,
            normalizer: NormalizerConfig::default(),
            window: None,
            write_mode: WriteMode::Replace,
            dimensions: Vec::new(),
            steps: Vec::new(),
            bridges: Vec::new(),
            fact,
            audit: false,
        }
    }

    /// Stages in run order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Normalize, Stage::Stage];
        stages.extend(self.dimensions.iter().map(|d| Stage::Dimension(d.name().to_string())));
        stages.push(Stage::Resolve);
        stages.extend(self.bridges.iter().map(|b| Stage::Bridge(b.name().to_string())));
        stages.push(Stage::Fact);
        if self.audit {
            stages.push(Stage::Audit);
        }
        stages
    }
}

pub struct PipelineBuilder {
    name: String,
    staging_table: String,
    record_schema: TableSchema,
    normalizer: NormalizerConfig,
    window: Option<SourceWindow>,
    write_mode: WriteMode,
    dimensions: Vec<DimensionSpec>,
    steps: Vec<ResolveStep>,
    bridges: Vec<BridgeSpec>,
    fact: FactSpec,
    audit: bool,
}

impl PipelineBuilder {
    pub fn normalizer(mut self, config: NormalizerConfig) -> Self {
        self.normalizer = config;
        self
    }

    pub fn window(mut self, window: SourceWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn dimension(mut self, dimension: DimensionSpec) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn step(mut self, step: ResolveStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn bridge(mut self, bridge: BridgeSpec) -> Self {
        self.bridges.push(bridge);
        self
    }

    pub fn audit(mut self, enabled: bool) -> Self {
        self.audit = enabled;
        self
    }

    pub fn build(self) -> Result<PipelineDefinition, PlanError> {
        let normalizer = Normalizer::new(self.normalizer, self.record_schema)?;
        if let Some(window) = &self.window {
            normalizer.schema().require("window", &window.column)?;
        }

        let key_columns: Vec<&str> = self
            .steps
            .iter()
            .filter_map(|s| match s {
                ResolveStep::Lookup(l) => Some(l.key_column.as_str()),
                ResolveStep::Propagate(_) => None,
            })
            .collect();
        let staging = StagingStore::new(&self.staging_table, normalizer.schema(), &key_columns);

        for dimension in &self.dimensions {
            dimension.validate(staging.schema())?;
        }
        let dims: Vec<&DimensionSpec> = self.dimensions.iter().collect();
        let plan = ResolutionPlan::new(self.steps, staging.schema(), &dims)?;
        for bridge in &self.bridges {
            bridge.validate(staging.schema(), &plan)?;
        }
        self.fact.validate(staging.schema(), &plan)?;

        Ok(PipelineDefinition {
            name: self.name,
            normalizer,
            window: self.window,
            staging,
            write_mode: self.write_mode,
            dimensions: self.dimensions,
            plan,
            bridges: self.bridges,
            fact: self.fact,
            audit: self.audit,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Stage,
    Dimension(String),
    Resolve,
    Bridge(String),
    Fact,
    Audit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Normalize => write!(f, "normalize"),
            Stage::Stage => write!(f, "stage"),
            Stage::Dimension(name) => write!(f, "dimension {}", name),
            Stage::Resolve => write!(f, "resolve"),
            Stage::Bridge(name) => write!(f, "bridge {}", name),
            Stage::Fact => write!(f, "fact"),
            Stage::Audit => write!(f, "audit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageSummary {
    Normalized {
        rows: usize,
        rejected: usize,
        filtered: usize,
        /// The first few rejections, in source order.
        samples: Vec<RejectedRecord>,
    },
    Staged(StageCounts),
    Loaded(LoadCounts),
    Resolved(Vec<StepReport>),
    Fact(FactCounts),
    Audited(Vec<AuditLogEntry>),
}

#[derive(Debug)]
pub enum StageOutcome {
    Succeeded(StageSummary),
    Failed(PipelineError),
    Skipped,
}

#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

#[derive(Debug)]
pub struct RunReport {
    pub pipeline: String,
    pub run_date: NaiveDate,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// True when no stage other than audit failed.
    pub fn is_success(&self) -> bool {
        self.fatal().is_none()
    }

    pub fn fatal(&self) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|r| r.stage != Stage::Audit && matches!(r.outcome, StageOutcome::Failed(_)))
    }

    pub fn outcome(&self, stage: &Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|r| &r.stage == stage).map(|r| &r.outcome)
    }

    pub fn summary(&self, stage: &Stage) -> Option<&StageSummary> {
        match self.outcome(stage)? {
            StageOutcome::Succeeded(summary) => Some(summary),
            _ => None,
        }
    }

    fn skip_remaining(&mut self, planned: &[Stage]) {
        for stage in planned {
            if self.outcome(stage).is_none() {
                self.stages.push(StageReport {
                    stage: stage.clone(),
                    outcome: StageOutcome::Skipped,
                });
            }
        }
    }

    /// Record a stage result; hands back the value on success.
    fn settle<T>(
        &mut self,
        stage: Stage,
        result: Result<T, PipelineError>,
        summarize: impl FnOnce(&T) -> StageSummary,
    ) -> Option<T> {
        match result {
            Ok(value) => {
                info!(stage = %stage, "stage succeeded");
                let summary = summarize(&value);
                self.stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Succeeded(summary),
                });
                Some(value)
            }
            Err(e) => {
                error!(stage = %stage, error = %e, "stage failed");
                self.stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Failed(e),
                });
                None
            }
        }
    }
}

pub struct Pipeline<'a> {
    pub definition: &'a PipelineDefinition,
    pub run_date: NaiveDate,
}

impl<'a> Pipeline<'a> {
    pub fn new(definition: &'a PipelineDefinition, run_date: NaiveDate) -> Self {
        Self { definition, run_date }
    }

    fn normalize(&self, records: &[SourceRecord]) -> Result<NormalizedBatch, PipelineError> {
        let def = self.definition;
        let batch = match &def.window {
            Some(window) => def
                .normalizer
                .normalize_batch_where(records, |r| window.admits(r, self.run_date)),
            None => def.normalizer.normalize_batch(records),
        };
        for rejected in &batch.rejected {
            warn!(
                pipeline = %def.name,
                position = rejected.source_position,
                error = %rejected.error,
                "record rejected"
            );
        }
        if batch.rows.is_empty() && !batch.rejected.is_empty() {
            return Err(PipelineError::NothingStaged {
                rejected: batch.rejected.len(),
            });
        }
        Ok(batch)
    }

    pub async fn run(&self, warehouse: &dyn Warehouse, records: &[SourceRecord]) -> RunReport {
        let def = self.definition;
        let run_date = self.run_date;
        let planned = def.stages();
        let mut report = RunReport {
            pipeline: def.name.clone(),
            run_date,
            stages: Vec::new(),
        };
        info!(pipeline = %def.name, %run_date, records = records.len(), "run started");

        let Some(batch) = report.settle(Stage::Normalize, self.normalize(records), |b| StageSummary::Normalized {
            rows: b.rows.len(),
            rejected: b.rejected.len(),
            filtered: b.filtered,
            samples: b.rejected.iter().take(REJECTION_SAMPLES).cloned().collect(),
        }) else {
            report.skip_remaining(&planned);
            return report;
        };

        let staged = def
            .staging
            .write(warehouse, &batch.rows, run_date, def.write_mode)
            .await
            .map_err(PipelineError::from);
        if report.settle(Stage::Stage, staged, |c| StageSummary::Staged(*c)).is_none() {
            report.skip_remaining(&planned);
            return report;
        }

        let mut loaded: Vec<(&DimensionSpec, LoadCounts)> = Vec::new();
        for dimension in &def.dimensions {
            let result = dimension
                .load(warehouse, &def.staging, run_date)
                .await
                .map_err(PipelineError::from);
            let stage = Stage::Dimension(dimension.name().to_string());
            match report.settle(stage, result, |c| StageSummary::Loaded(*c)) {
                Some(counts) => loaded.push((dimension, counts)),
                None => {
                    report.skip_remaining(&planned);
                    return report;
                }
            }
        }

        let dims: Vec<&DimensionSpec> = def.dimensions.iter().collect();
        let resolved = def
            .plan
            .run(warehouse, &def.staging, &dims, run_date)
            .await
            .map_err(PipelineError::from);
        if report
            .settle(Stage::Resolve, resolved, |steps| StageSummary::Resolved(steps.clone()))
            .is_none()
        {
            report.skip_remaining(&planned);
            return report;
        }

        for bridge in &def.bridges {
            let result = bridge
                .load(warehouse, &def.staging, run_date)
                .await
                .map_err(PipelineError::from);
            let stage = Stage::Bridge(bridge.name().to_string());
            if report.settle(stage, result, |c| StageSummary::Loaded(*c)).is_none() {
                report.skip_remaining(&planned);
                return report;
            }
        }

        let fact = def
            .fact
            .load(warehouse, &def.staging, run_date)
            .await
            .map_err(PipelineError::from);
        let Some(fact_counts) = report.settle(Stage::Fact, fact, |c| StageSummary::Fact(*c)) else {
            report.skip_remaining(&planned);
            return report;
        };

        if def.audit {
            let audited = self.audit(warehouse, &loaded, &fact_counts).await;
            report.settle(Stage::Audit, audited, |entries| StageSummary::Audited(entries.clone()));
        }

        info!(pipeline = %def.name, success = report.is_success(), "run finished");
        report
    }

    async fn audit(
        &self,
        warehouse: &dyn Warehouse,
        loaded: &[(&DimensionSpec, LoadCounts)],
        fact: &FactCounts,
    ) -> Result<Vec<AuditLogEntry>, PipelineError> {
        let def = self.definition;
        let log = AuditLog::new();
        let window = StagingStore::batch(self.run_date);
        let mut entries = Vec::new();
        for (dimension, counts) in loaded {
            let staged = def
                .staging
                .count_distinct(warehouse, &window, &dimension.staging_key())
                .await?;
            entries.push(
                log.record(warehouse, dimension.name(), staged, counts.inserted, counts.updated, self.run_date)
                    .await?,
            );
        }
        let (inserted, updated) = match def.fact.policy {
            FactPolicy::Append => (fact.inserted, 0),
            FactPolicy::MergeOn(_) => (fact.inserted, fact.updated),
        };
        entries.push(
            log.record(warehouse, def.fact.name(), fact.candidates, inserted, updated, self.run_date)
                .await?,
        );
        Ok(entries)
    }
}
