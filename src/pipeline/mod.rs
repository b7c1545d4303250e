//! Data-move pipeline
//!
//! Drives one run, object set by object set, each phase completing before the
//! next one starts:
//! 1. Load the script
//! 2. Prepare objects against both endpoint schemas
//! 3. Resolve referenced entities missing from the set
//! 4. Finalize field lists, mappings and master flags
//! 5. Compute the write and delete order
//! 6. Count records
//! 7. Delete obsolete target records
//! 8. Query master objects from source and target
//! 9. Query child objects from source by collected identifiers
//! 10. Query child objects from target by observed external IDs
//! 11. Write records to the target
//! 12. Patch lookups the writes could not resolve yet
//!
//! Object sets run strictly one after another and objects inside a set
//! strictly in the computed order, so a child's parents are always queried
//! (and written) before the child.

mod prepare;
mod query;
mod update;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::endpoint::{EndpointClient, EntityDescribe, QueryTransport, Record, WriteOperation};
use crate::engine::{QueryEngineChoice, suggest_update_engine};
use crate::error::Result;
use crate::order::apply_order;
use crate::query::ClauseLimits;
use crate::script::{ObjectSet, ObjectStats, Operation, SCRIPT_FILE_NAME, Script};
use crate::transfer::csv::value_to_text;
use crate::transfer::{TransferEngine, UpdateOutcome, WriteBatching};

/// Directory under the script directory holding staged files by default
pub const DEFAULT_WORKING_DIR: &str = ".datamove";

/// Settings of one run, computed once at startup
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Config,
    pub script_path: PathBuf,
    pub working_dir: PathBuf,
    pub show_progress: bool,
}

impl RunContext {
    /// Context for the script file of `script_dir`. The working directory
    /// comes from `[paths] working_dir` or defaults to `<script_dir>/.datamove`.
    pub fn new(config: Config, script_dir: &Path) -> Self {
        let working_dir = config
            .paths
            .working_dir
            .clone()
            .unwrap_or_else(|| script_dir.join(DEFAULT_WORKING_DIR));
        Self {
            config,
            script_path: script_dir.join(SCRIPT_FILE_NAME),
            working_dir,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

/// Outcome of one object
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub object_set: usize,
    pub entity: String,
    pub operation: Operation,
    pub completed: bool,
    pub stats: ObjectStats,
}

/// Outcome of a run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub objects: Vec<ObjectSummary>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn collect(&mut self, set: &ObjectSet) {
        for object in &set.objects {
            self.objects.push(ObjectSummary {
                object_set: set.index,
                entity: object.name().to_string(),
                operation: object.operation,
                completed: object.completed,
                stats: object.extra.stats,
            });
        }
    }

    pub fn object(&self, object_set: usize, entity: &str) -> Option<&ObjectSummary> {
        self.objects
            .iter()
            .find(|o| o.object_set == object_set && o.entity == entity)
    }

    /// Records that failed to write, over all objects
    pub fn failed(&self) -> u64 {
        self.objects.iter().map(|o| o.stats.failed).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn log(&self) {
        for object in &self.objects {
            let s = &object.stats;
            info!(
                "[{}] {} {}: queried {}/{}, deleted {}, inserted {}, updated {}, failed {}{}",
                object.object_set,
                object.entity,
                object.operation,
                s.source_queried,
                s.target_queried,
                s.deleted,
                s.inserted,
                s.updated,
                s.failed,
                if object.completed { "" } else { " (not completed)" }
            );
        }
        info!("Run finished in {} ms", self.elapsed_ms);
    }
}

/// Endpoint side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Target,
}

/// Moves records from a source endpoint to a target endpoint under a script
pub struct Pipeline {
    context: RunContext,
    source: Arc<dyn EndpointClient>,
    target: Arc<dyn EndpointClient>,
    transfer: TransferEngine,
    /// (endpoint label, entity) → schema
    describe_cache: HashMap<(String, String), EntityDescribe>,
}

impl Pipeline {
    pub fn new(context: RunContext, source: Arc<dyn EndpointClient>, target: Arc<dyn EndpointClient>) -> Self {
        let transfer = TransferEngine::new(context.config.transfer.clone(), context.config.polling.clone())
            .with_progress_bars(context.show_progress);
        Self {
            context,
            source,
            target,
            transfer,
            describe_cache: HashMap::new(),
        }
    }

    /// Load the script file of the run context and run it.
    pub async fn run(&mut self) -> Result<RunSummary> {
        info!("Phase 1: Loading script {}", self.context.script_path.display());
        let script = Script::load(&self.context.script_path, &self.context.working_dir)?;
        self.run_script(script).await
    }

    /// Run an already loaded script.
    pub async fn run_script(&mut self, mut script: Script) -> Result<RunSummary> {
        let start_time = Instant::now();
        info!(
            "Moving {} objects in {} object sets from {} to {}",
            script.object_count(),
            script.object_sets.len(),
            self.source.label(),
            self.target.label()
        );

        // Script errors are reported before any endpoint is contacted
        for set in &mut script.object_sets {
            prepare::validate_object_set(set)?;
        }

        let mut summary = RunSummary::default();
        for set in &mut script.object_sets {
            set.create_dirs()?;
            self.run_object_set(set).await?;
            summary.collect(set);
        }

        self.source.finish().await?;
        self.target.finish().await?;

        summary.elapsed_ms = start_time.elapsed().as_millis() as u64;
        summary.log();
        Ok(summary)
    }

    async fn run_object_set(&mut self, set: &mut ObjectSet) -> Result<()> {
        let index = set.index;

        info!("Object set {}: Phase 2: Preparing {} objects", index, set.objects.len());
        self.prepare_objects(set).await?;

        info!("Object set {}: Phase 3: Resolving references", index);
        self.resolve_references(set).await?;

        info!("Object set {}: Phase 4: Finalizing objects", index);
        self.finalize_objects(set)?;

        info!("Object set {}: Phase 5: Ordering objects", index);
        apply_order(set);
        info!("Object set {}: write order {:?}", index, set.update_objects_order);

        self.reset_working_files(set).await?;

        info!("Object set {}: Phase 6: Counting records", index);
        self.count_records(set).await?;

        info!("Object set {}: Phase 7: Deleting target records", index);
        self.delete_records(set).await?;

        info!("Object set {}: Phase 8: Querying master objects", index);
        self.query_master_objects(set).await?;

        info!("Object set {}: Phase 9: Querying child objects from source", index);
        self.query_child_objects(set).await?;

        info!("Object set {}: Phase 10: Querying child objects from target", index);
        self.query_target_child_objects(set).await?;

        info!("Object set {}: Phase 11: Updating target", index);
        self.update_target(set).await?;

        info!("Object set {}: Phase 12: Fixing lookups", index);
        self.fix_lookups(set).await?;

        let incomplete: Vec<&str> = set
            .objects
            .iter()
            .filter(|o| o.operation != Operation::Readonly && !o.completed)
            .map(|o| o.name())
            .collect();
        if !incomplete.is_empty() {
            warn!("Object set {}: not completed: {}", index, incomplete.join(", "));
        }
        Ok(())
    }

    fn endpoint(&self, side: Side) -> &Arc<dyn EndpointClient> {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    fn delimiter(&self) -> &str {
        &self.context.config.query.composite_id_delimiter
    }

    fn clause_limits(&self) -> ClauseLimits {
        ClauseLimits {
            max_clause_length: self.context.config.query.max_where_clause_length,
            max_query_length: self.context.config.query.max_query_length,
        }
    }

    /// Records read from a staged file per write call: one bulk job's worth.
    fn staged_batch_size(&self) -> usize {
        (self.context.config.engine.bulk_update_batch_size as usize).max(1)
    }

    /// Write records to the target through the cheaper update transport.
    async fn write_records(
        &self,
        entity: &str,
        operation: WriteOperation,
        records: Vec<Record>,
    ) -> Result<UpdateOutcome> {
        let engine = &self.context.config.engine;
        let choice = suggest_update_engine(records.len() as u64, engine);
        self.transfer
            .update_records(
                self.target.as_ref(),
                entity,
                operation,
                records,
                WriteBatching {
                    use_bulk: choice.use_bulk,
                    rest_batch_size: engine.rest_update_batch_size as usize,
                    bulk_batch_size: engine.bulk_update_batch_size as usize,
                },
            )
            .await
    }
}

fn transport_of(choice: &QueryEngineChoice) -> QueryTransport {
    if choice.use_bulk {
        QueryTransport::Bulk
    } else {
        QueryTransport::Rest
    }
}

/// Text of a record field; null and empty values count as absent.
pub fn record_text(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        value => Some(value_to_text(value)).filter(|text| !text.is_empty()),
    }
}

/// External ID value of a record: the text of every part joined with the
/// delimiter. Relationship parts are read from their flat `Rel.Field` columns.
pub fn external_id_value(record: &Record, external_id: &str, delimiter: &str) -> Option<String> {
    let parts: Vec<String> = external_id
        .split(delimiter)
        .map(|part| record_text(record, part.trim()).unwrap_or_default())
        .collect();
    if parts.iter().all(String::is_empty) {
        None
    } else {
        Some(parts.join(delimiter))
    }
}

/// Split a composite external ID into its trimmed parts
pub fn external_id_parts(external_id: &str, delimiter: &str) -> Vec<String> {
    external_id
        .split(delimiter)
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
