//! Surrogate Key Resolver - back-fills dimension keys into staging, copies
//! them into referencing dimensions, and fills bridge tables.
//!
//! Steps run in the order they are declared. A propagation must come after
//! the lookup that fills the key it copies; this is checked when the plan is
//! built, before any statement runs.

use crate::dimension::DimensionSpec;
use crate::error::{PlanError, WarehouseError};
use crate::schema::{Column, ColumnType, TableSchema};
use crate::staging::{origin, StagingStore};
use crate::value::{Row, Value};
use crate::warehouse::{Assignment, Conflict, CreateMode, Filter, KeyMatch, LoadCounts, Warehouse};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Equality join of staging rows to a dimension. The dimension's surrogate
/// key is written into `key_column` of every matching staging row.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRef {
    pub dimension: String,
    /// `(staging column, dimension column)`.
    pub join: Vec<(String, String)>,
    pub key_column: String,
}

/// Copy an already-resolved staging key into a referencing dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Propagation {
    pub target: String,
    /// `(staging column, target column)` identifying the target row.
    pub match_on: Vec<(String, String)>,
    pub key_column: String,
    pub target_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveStep {
    Lookup(DimensionRef),
    Propagate(Propagation),
}

impl ResolveStep {
    pub fn lookup(dimension: &str, join: &[(&str, &str)], key_column: &str) -> Self {
        ResolveStep::Lookup(DimensionRef {
            dimension: dimension.to_string(),
            join: pairs(join),
            key_column: key_column.to_string(),
        })
    }

    pub fn propagate(target: &str, match_on: &[(&str, &str)], key_column: &str, target_column: &str) -> Self {
        ResolveStep::Propagate(Propagation {
            target: target.to_string(),
            match_on: pairs(match_on),
            key_column: key_column.to_string(),
            target_column: target_column.to_string(),
        })
    }

    pub fn describe(&self) -> String {
        match self {
            ResolveStep::Lookup(l) => format!("lookup {} -> {}", l.dimension, l.key_column),
            ResolveStep::Propagate(p) => format!("propagate {} -> {}.{}", p.key_column, p.target, p.target_column),
        }
    }
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveCounts {
    pub matched: u64,
    pub unmatched: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step: String,
    pub counts: ResolveCounts,
}

#[derive(Debug, Clone)]
pub struct ResolutionPlan {
    steps: Vec<ResolveStep>,
    resolved: HashSet<String>,
}

fn find<'a>(dimensions: &[&'a DimensionSpec], name: &str) -> Result<&'a DimensionSpec, PlanError> {
    dimensions
        .iter()
        .copied()
        .find(|d| d.name() == name)
        .ok_or_else(|| PlanError::Invalid(format!("unknown dimension '{}'", name)))
}

impl ResolutionPlan {
    pub fn new(
        steps: Vec<ResolveStep>,
        staging: &TableSchema,
        dimensions: &[&DimensionSpec],
    ) -> Result<Self, PlanError> {
        let mut resolved: HashSet<String> = HashSet::new();
        for step in &steps {
            let context = step.describe();
            match step {
                ResolveStep::Lookup(lookup) => {
                    let dim = find(dimensions, &lookup.dimension)?;
                    if dim.surrogate_key().is_none() {
                        return Err(PlanError::Invalid(format!("{}: dimension has no surrogate key", context)));
                    }
                    for (s, d) in &lookup.join {
                        staging.require(&context, s)?;
                        dim.schema.require(&context, d)?;
                    }
                    staging.require(&context, &lookup.key_column)?;
                    resolved.insert(lookup.key_column.clone());
                }
                ResolveStep::Propagate(propagation) => {
                    let target = find(dimensions, &propagation.target)?;
                    for (s, t) in &propagation.match_on {
                        staging.require(&context, s)?;
                        target.schema.require(&context, t)?;
                    }
                    staging.require(&context, &propagation.key_column)?;
                    target.schema.require(&context, &propagation.target_column)?;
                    if !resolved.contains(&propagation.key_column) {
                        return Err(PlanError::UnresolvedDependency {
                            target: propagation.target.clone(),
                            key_column: propagation.key_column.clone(),
                        });
                    }
                }
            }
        }
        Ok(Self { steps, resolved })
    }

    pub fn steps(&self) -> &[ResolveStep] {
        &self.steps
    }

    /// Whether some lookup fills `column`.
    pub fn resolves(&self, column: &str) -> bool {
        self.resolved.contains(column)
    }

    pub async fn run(
        &self,
        warehouse: &dyn Warehouse,
        staging: &StagingStore,
        dimensions: &[&DimensionSpec],
        run_date: NaiveDate,
    ) -> Result<Vec<StepReport>, WarehouseError> {
        let mut reports = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let counts = match step {
                ResolveStep::Lookup(lookup) => {
                    let dim = dimensions
                        .iter()
                        .find(|d| d.name() == lookup.dimension)
                        .ok_or_else(|| WarehouseError::schema(&lookup.dimension, "dimension not in plan"))?;
                    back_fill(warehouse, staging, dim, lookup, run_date).await?
                }
                ResolveStep::Propagate(propagation) => {
                    let target = dimensions
                        .iter()
                        .find(|d| d.name() == propagation.target)
                        .ok_or_else(|| WarehouseError::schema(&propagation.target, "dimension not in plan"))?;
                    propagate(warehouse, staging, target, propagation, run_date).await?
                }
            };
            info!(
                step = %step.describe(),
                matched = counts.matched,
                unmatched = counts.unmatched,
                "resolution step done"
            );
            reports.push(StepReport {
                step: step.describe(),
                counts,
            });
        }
        Ok(reports)
    }
}

/// The UPDATE .. FROM .. JOIN of staging against one dimension.
async fn back_fill(
    warehouse: &dyn Warehouse,
    staging: &StagingStore,
    dim: &DimensionSpec,
    lookup: &DimensionRef,
    run_date: NaiveDate,
) -> Result<ResolveCounts, WarehouseError> {
    let dim_columns: Vec<String> = lookup.join.iter().map(|(_, d)| d.clone()).collect();
    let staging_columns: Vec<String> = lookup.join.iter().map(|(s, _)| s.clone()).collect();
    let surrogate = dim.surrogate_key().unwrap_or_default();

    let mut keys: HashMap<Vec<String>, Value> = HashMap::new();
    for row in warehouse.select(&dim.schema, &Filter::All).await? {
        if let Some(tuple) = row.key_tuple(&dim_columns) {
            keys.entry(tuple).or_insert_with(|| row.get(surrogate).clone());
        }
    }

    let window = StagingStore::batch(run_date);
    let staged = staging.read(warehouse, &window).await?;
    let mut counts = ResolveCounts::default();
    let mut matches: BTreeMap<Vec<String>, KeyMatch> = BTreeMap::new();
    for row in &staged {
        let found = row
            .key_tuple(&staging_columns)
            .and_then(|tuple| keys.get(&tuple).map(|key| (tuple, key)));
        match found {
            Some((tuple, key)) => {
                counts.matched += 1;
                matches.entry(tuple).or_insert_with(|| KeyMatch {
                    conditions: staging_columns.iter().map(|c| (c.clone(), row.get(c).clone())).collect(),
                    value: key.clone(),
                });
            }
            None => counts.unmatched += 1,
        }
    }
    if counts.unmatched > 0 {
        debug!(
            staging = %staging.name(),
            dimension = %dim.name(),
            unmatched = counts.unmatched,
            "staged rows without a dimension match keep a null key"
        );
    }

    if !matches.is_empty() {
        let assignment = Assignment {
            column: lookup.key_column.clone(),
            matches: matches.into_values().collect(),
            scope: window,
        };
        warehouse.assign(staging.schema(), &assignment).await?;
    }
    Ok(counts)
}

/// Collapse staged candidates to one per target row (the most recent with a
/// non-null key) and write that key into the target dimension.
async fn propagate(
    warehouse: &dyn Warehouse,
    staging: &StagingStore,
    target: &DimensionSpec,
    propagation: &Propagation,
    run_date: NaiveDate,
) -> Result<ResolveCounts, WarehouseError> {
    let staging_columns: Vec<String> = propagation.match_on.iter().map(|(s, _)| s.clone()).collect();
    let staged = staging.read(warehouse, &StagingStore::batch(run_date)).await?;

    let mut latest: BTreeMap<Vec<String>, &Row> = BTreeMap::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    for row in &staged {
        let Some(tuple) = row.key_tuple(&staging_columns) else {
            continue;
        };
        seen.insert(tuple.clone());
        if row.get(&propagation.key_column).is_null() {
            continue;
        }
        let newer = latest
            .get(&tuple)
            .map_or(true, |current| origin(row) >= origin(current));
        if newer {
            latest.insert(tuple, row);
        }
    }

    let counts = ResolveCounts {
        matched: latest.len() as u64,
        unmatched: (seen.len() - latest.len()) as u64,
    };
    if latest.is_empty() {
        return Ok(counts);
    }

    let assignment = Assignment {
        column: propagation.target_column.clone(),
        matches: latest
            .values()
            .map(|row| KeyMatch {
                conditions: propagation
                    .match_on
                    .iter()
                    .map(|(s, t)| (t.clone(), row.get(s).clone()))
                    .collect(),
                value: row.get(&propagation.key_column).clone(),
            })
            .collect(),
        scope: Filter::All,
    };
    let written = warehouse.assign(&target.schema, &assignment).await?;
    debug!(target = %target.name(), written, "propagated keys written");
    Ok(counts)
}

/// Many-to-many association table filled from fully-resolved staging key pairs.
#[derive(Debug, Clone)]
pub struct BridgeSpec {
    pub schema: TableSchema,
    /// `(staging key column, bridge column)`.
    pub pairs: Vec<(String, String)>,
}

impl BridgeSpec {
    pub fn new(table: &str, pairs: &[(&str, &str)]) -> Self {
        let mut schema = TableSchema::new(table);
        for (_, column) in pairs {
            schema = schema.column(Column::required(column, ColumnType::KeyRef));
        }
        let key: Vec<&str> = pairs.iter().map(|(_, c)| *c).collect();
        Self {
            schema: schema.unique(&key),
            pairs: self::pairs(pairs),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn validate(&self, staging: &TableSchema, plan: &ResolutionPlan) -> Result<(), PlanError> {
        let context = format!("bridge {}", self.name());
        for (key_column, _) in &self.pairs {
            if !plan.resolves(key_column) {
                return Err(PlanError::UnresolvedDependency {
                    target: self.name().to_string(),
                    key_column: key_column.clone(),
                });
            }
            staging.require(&context, key_column)?;
        }
        Ok(())
    }

    pub async fn load(
        &self,
        warehouse: &dyn Warehouse,
        staging: &StagingStore,
        run_date: NaiveDate,
    ) -> Result<LoadCounts, WarehouseError> {
        warehouse.create_table(&self.schema, CreateMode::IfNotExists).await?;
        let staged = staging.read(warehouse, &StagingStore::batch(run_date)).await?;
        let staging_columns: Vec<String> = self.pairs.iter().map(|(s, _)| s.clone()).collect();

        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut unresolved = 0u64;
        let mut rows = Vec::new();
        for row in &staged {
            let Some(tuple) = row.key_tuple(&staging_columns) else {
                unresolved += 1;
                continue;
            };
            if seen.insert(tuple) {
                rows.push(
                    self.pairs
                        .iter()
                        .map(|(s, b)| (b.clone(), row.get(s).clone()))
                        .collect::<Row>(),
                );
            }
        }
        if unresolved > 0 {
            warn!(table = %self.name(), rows = unresolved, "staged rows with an unresolved key left out of bridge");
        }

        let counts = warehouse.insert_batch(&self.schema, &rows, Conflict::Skip).await?;
        info!(
            table = %self.name(),
            inserted = counts.inserted,
            skipped = counts.skipped,
            "bridge loaded"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionMode;

    fn staging_schema() -> TableSchema {
        let record = TableSchema::new("record").columns([
            Column::text("product_id"),
            Column::text("product_name"),
            Column::text("review_id"),
        ]);
        StagingStore::new("stg", &record, &["product_key", "review_key"])
            .schema()
            .clone()
    }

    fn product() -> DimensionSpec {
        DimensionSpec::new("dim_product", "product_key", DimensionMode::Upsert)
            .key("product_id", Column::new("product_id", ColumnType::Text))
            .attribute("product_name", Column::text("product_name"))
    }

    fn review() -> DimensionSpec {
        DimensionSpec::new("dim_review", "review_key", DimensionMode::Upsert)
            .key("review_id", Column::new("review_id", ColumnType::Text))
            .reference("product_key")
    }

    #[test]
    fn test_propagation_before_lookup_is_rejected() {
        let (p, r) = (product(), review());
        let steps = vec![
            ResolveStep::propagate("dim_review", &[("review_id", "review_id")], "product_key", "product_key"),
            ResolveStep::lookup("dim_product", &[("product_id", "product_id")], "product_key"),
        ];
        assert_eq!(
            ResolutionPlan::new(steps, &staging_schema(), &[&p, &r]).unwrap_err(),
            PlanError::UnresolvedDependency {
                target: "dim_review".to_string(),
                key_column: "product_key".to_string()
            }
        );
    }

    #[test]
    fn test_lookup_then_propagation_is_accepted() {
        let (p, r) = (product(), review());
        let steps = vec![
            ResolveStep::lookup("dim_product", &[("product_id", "product_id"), ("product_name", "product_name")], "product_key"),
            ResolveStep::propagate("dim_review", &[("review_id", "review_id")], "product_key", "product_key"),
        ];
        let plan = ResolutionPlan::new(steps, &staging_schema(), &[&p, &r]).unwrap();
        assert!(plan.resolves("product_key"));
        assert!(!plan.resolves("review_key"));
    }

    #[test]
    fn test_lookup_with_misspelled_join_column() {
        let p = product();
        let steps = vec![ResolveStep::lookup("dim_product", &[("product_id", "prod_id")], "product_key")];
        assert!(matches!(
            ResolutionPlan::new(steps, &staging_schema(), &[&p]),
            Err(PlanError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_bridge_requires_resolved_keys() {
        let p = product();
        let steps = vec![ResolveStep::lookup("dim_product", &[("product_id", "product_id")], "product_key")];
        let plan = ResolutionPlan::new(steps, &staging_schema(), &[&p]).unwrap();
        let bridge = BridgeSpec::new("product_review", &[("product_key", "product_key"), ("review_key", "review_key")]);
        assert!(matches!(
            bridge.validate(&staging_schema(), &plan),
            Err(PlanError::UnresolvedDependency { .. })
        ));
    }
}
