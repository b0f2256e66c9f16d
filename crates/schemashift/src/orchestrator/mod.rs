//! Migration orchestrator - main workflow coordinator.

use crate::columns::ColumnSynchronizer;
use crate::config::{Config, MigrationConfig};
use crate::constraints::ConstraintApplier;
use crate::copier::{CopyJob, CopyOptions, CopyResult, DataCopier};
use crate::error::{MigrateError, Result};
use crate::identifiers::{IdentifierTranslator, TableFilter};
use crate::plan::{build_plan, MigrationPlan, TablePlan};
use crate::progress::{spawn_tracker, Phase, ProgressEvent, ProgressReporter, ProgressSnapshot};
use crate::report::{
    final_status, ErrorScope, MigrationReport, RecordedError, TableReport, TableStatus,
};
use crate::schema::SchemaBuilder;
use crate::schema_def::SchemaDefinitions;
use crate::source::{MssqlPool, QualifiedName, SchemaMetadata, SourcePool};
use crate::target::{PgPool, TargetPool};
use crate::validate::validate_row_counts;
use crate::views::{create_views, write_view_errors, ViewTranslator};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-run options. Anything not set here comes from the config file.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Restrict the run to these tables. All discovered tables when `None`.
    pub tables: Option<TableFilter>,
    pub drop_existing: bool,
    pub batch_size: usize,
    pub schemas: Vec<String>,
    pub workers: usize,
}

impl MigrationOptions {
    /// Options taken from the migration section, loading `tables_file` if set.
    pub fn from_config(config: &MigrationConfig) -> Result<Self> {
        let tables = config
            .tables_file
            .as_ref()
            .map(TableFilter::load)
            .transpose()?;
        Ok(Self {
            tables,
            drop_existing: config.drop_existing,
            batch_size: config.batch_size,
            schemas: config.schemas.clone(),
            workers: config.get_workers(),
        })
    }
}

/// Handle on a migration running in the background.
pub struct RunHandle {
    pub run_id: String,
    cancel: CancellationToken,
    snapshots: watch::Receiver<ProgressSnapshot>,
    events: broadcast::Sender<ProgressEvent>,
    task: JoinHandle<Result<MigrationReport>>,
}

impl RunHandle {
    /// Latest progress snapshot.
    pub fn progress(&self) -> ProgressSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified on every progress change.
    pub fn watch(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshots.clone()
    }

    /// Stream of progress events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<MigrationReport> {
        self.task.await?
    }
}

/// Migration orchestrator.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    source: Arc<dyn SourcePool>,
    target: Arc<dyn TargetPool>,
}

impl Orchestrator {
    /// Connect to both databases. Either side being unreachable is a
    /// [`MigrateError::Connectivity`] error.
    pub async fn new(config: Config) -> Result<Self> {
        let source_pool_size = config.migration.get_max_source_connections() as u32;
        let source = MssqlPool::new(config.source.clone(), source_pool_size).await?;

        let target_pool_size = config.migration.get_max_target_connections();
        let target = PgPool::new(&config.target, target_pool_size)
            .await
            .map_err(into_connectivity)?;

        Ok(Self::with_pools(config, Arc::new(source), Arc::new(target)))
    }

    /// Build an orchestrator over existing pools.
    pub fn with_pools(
        config: Config,
        source: Arc<dyn SourcePool>,
        target: Arc<dyn TargetPool>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            target,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Round-trip both databases.
    pub async fn health_check(&self) -> Result<()> {
        self.source.ping().await.map_err(|e| {
            MigrateError::Connectivity(format!("{} source: {}", self.source.db_type(), e))
        })?;
        self.target.ping().await.map_err(|e| {
            MigrateError::Connectivity(format!("{} target: {}", self.target.db_type(), e))
        })?;
        Ok(())
    }

    /// Read the source and build the plan without touching the target.
    pub async fn plan(&self, options: &MigrationOptions) -> Result<MigrationPlan> {
        let translator = self.load_translator()?;
        let definitions = self.load_definitions()?;
        let (metadata, errors) = self.read_metadata(options, &ProgressReporter::disabled()).await?;
        for e in &errors {
            warn!("{}: {}", e.identifier, e.message);
        }
        Ok(build_plan(
            &metadata,
            &translator,
            &definitions,
            &self.config.migration.new_columns,
        ))
    }

    /// Start a run in the background.
    pub fn start_migration(&self, options: MigrationOptions) -> RunHandle {
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let tracker = spawn_tracker();

        let orchestrator = self.clone();
        let token = cancel.clone();
        let id = run_id.clone();
        let reporter = tracker.reporter;
        let task = tokio::spawn(async move { orchestrator.execute(id, options, token, reporter).await });

        RunHandle {
            run_id,
            cancel,
            snapshots: tracker.snapshots,
            events: tracker.events,
            task,
        }
    }

    /// Ask a running migration to stop. Batches in flight finish; nothing new starts.
    pub fn stop(&self, handle: &RunHandle) {
        info!("Stop requested for run {}", handle.run_id);
        handle.cancel.cancel();
    }

    /// Run the full pipeline in the calling task.
    pub async fn run(
        &self,
        options: MigrationOptions,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Result<MigrationReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.execute(run_id, options, cancel, progress).await
    }

    async fn execute(
        &self,
        run_id: String,
        options: MigrationOptions,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let migration = &self.config.migration;
        info!("Starting migration run: {}", run_id);

        let translator = self.load_translator()?;
        let definitions = self.load_definitions()?;
        let mut errors: Vec<RecordedError> = Vec::new();

        // Phase 1: Connectivity
        progress.phase(Phase::Connecting, "Checking connectivity");
        info!("Phase 1: Checking connectivity");
        self.health_check().await?;

        // Phase 2: Metadata
        progress.phase(Phase::FetchingMetadata, "Reading source metadata");
        info!("Phase 2: Reading source metadata for schemas {:?}", options.schemas);
        let (metadata, introspection_errors) = self.read_metadata(&options, &progress).await?;
        record(&mut errors, introspection_errors, &progress);

        let plan = build_plan(&metadata, &translator, &definitions, &migration.new_columns);
        for w in &plan.warnings {
            progress.warning(format!("{}: {}", w.table, w.message));
        }
        for cycle in &plan.resolution.cycles {
            progress.warning(cycle.message.clone());
        }
        info!(
            "Planned {} tables, {} views, {} deferred foreign keys",
            plan.tables.len(),
            metadata.views.len(),
            plan.resolution.deferred_edges.len()
        );

        // Phase 3: Schemas
        let builder = SchemaBuilder::new(self.target.as_ref(), options.drop_existing);
        progress.phase(Phase::CreatingSchemas, "Creating target schemas");
        info!("Phase 3: Creating target schemas");
        record(&mut errors, builder.create_schemas(&plan).await, &progress);

        // Phase 4: Tables
        progress.phase(Phase::CreatingTables, "Creating target tables");
        info!("Phase 4: Creating tables (drop_existing: {})", options.drop_existing);
        let (created, table_errors) = builder.create_tables(&plan, &cancel).await;
        let not_created: Vec<RecordedError> = table_errors.clone();
        record(&mut errors, table_errors, &progress);
        let keyless: Vec<RecordedError> = created.iter().filter_map(|c| c.keyless_warning()).collect();
        record(&mut errors, keyless, &progress);

        // Phase 5: Data
        progress.phase(Phase::CopyingData, "Copying data");
        info!("Phase 5: Copying data");
        let jobs: Vec<CopyJob> = created
            .iter()
            .filter_map(|c| {
                plan.table(&c.table).map(|t| CopyJob {
                    plan: Arc::new(t.clone()),
                    strategy: c.strategy.clone(),
                })
            })
            .collect();
        progress.tables_total(jobs.len());

        let mut copy_options = CopyOptions::from_config(migration);
        copy_options.batch_size = options.batch_size.max(1);
        let copier = DataCopier::new(
            self.source.clone(),
            self.target.clone(),
            copy_options,
            progress.clone(),
        );
        let results = copier
            .copy_all(jobs, &plan.resolution.dependencies, options.workers, &cancel)
            .await;
        for r in &results {
            record(&mut errors, r.errors.clone(), &progress);
        }

        let loaded: BTreeSet<QualifiedName> = results
            .iter()
            .filter(|r| r.status != TableStatus::Cancelled)
            .map(|r| r.table.clone())
            .collect();

        let mut added_columns = Vec::new();
        let mut views = Vec::new();
        if !cancel.is_cancelled() {
            // Phase 6: Validation
            progress.phase(Phase::Validating, "Comparing row counts");
            info!("Phase 6: Comparing source and target row counts");
            let validation = validate_row_counts(
                self.source.as_ref(),
                self.target.as_ref(),
                &plan,
                &results,
                &cancel,
            )
            .await;
            record(&mut errors, validation.errors, &progress);
        }

        if !cancel.is_cancelled() {
            // Phase 7: Columns
            progress.phase(Phase::SyncingColumns, "Synchronizing declared columns");
            info!("Phase 7: Synchronizing declared columns");
            let synchronizer = ColumnSynchronizer::new(self.target.as_ref());
            let loaded_plans: Vec<&TablePlan> = plan.tables.iter().filter(|t| loaded.contains(t.name())).collect();
            let sync = synchronizer
                .synchronize_all(
                    loaded_plans,
                    migration.schema_definition_file.as_deref(),
                    &cancel,
                )
                .await;
            record(&mut errors, sync.errors, &progress);
            added_columns = sync.added;
        }

        if !cancel.is_cancelled() {
            // Phase 8: Constraints
            progress.phase(Phase::ApplyingConstraints, "Applying constraints and indexes");
            info!("Phase 8: Applying constraints and indexes");
            let applier = ConstraintApplier::new(self.target.clone(), options.workers);
            let constraints = applier.apply_constraints(&plan, &loaded, &cancel).await;
            debug!("{} constraint outcomes", constraints.outcomes.len());
            record(&mut errors, constraints.errors, &progress);
        }

        if !cancel.is_cancelled() {
            // Phase 9: Views
            progress.phase(Phase::TranslatingViews, "Translating views");
            info!("Phase 9: Translating {} views", metadata.views.len());
            let view_translator = ViewTranslator::new(translator.clone()).with_tables(&plan.tables);
            let outcome =
                create_views(self.target.as_ref(), &view_translator, &metadata.views, &cancel).await;
            info!("Created {} of {} views", outcome.created, metadata.views.len());
            record(&mut errors, outcome.errors, &progress);

            if let Some(path) = &migration.view_errors_file {
                match write_view_errors(path, &outcome.results) {
                    Ok(n) => debug!("Wrote {} view errors to {}", n, path.display()),
                    Err(e) => warn!("Could not write view errors to {}: {}", path.display(), e),
                }
            }
            views = outcome.results;
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("Migration cancelled; remaining work skipped");
        }

        let report = self.build_report(ReportInputs {
            run_id,
            started_at,
            cancelled,
            plan: &plan,
            results: &results,
            not_created: &not_created,
            views,
            added_columns,
            errors,
        });

        progress.phase(
            Phase::Complete,
            format!("Migration finished with {} errors", report.errors.len()),
        );
        info!(
            "Migration {:?}: {} tables, {} rows in {:.1}s ({} rows/s), {} errors",
            report.status,
            report.tables_total,
            report.rows_transferred,
            report.duration_seconds,
            report.rows_per_second,
            report.errors.len()
        );

        if let Some(path) = &migration.report_file {
            if let Err(e) = report.save(path) {
                error!("Could not write report to {}: {}", path.display(), e);
            } else {
                info!("Report written to {}", path.display());
            }
        }

        Ok(report)
    }

    async fn read_metadata(
        &self,
        options: &MigrationOptions,
        progress: &ProgressReporter,
    ) -> Result<(SchemaMetadata, Vec<RecordedError>)> {
        let mut metadata = self
            .source
            .read_schema(&options.schemas)
            .await
            .map_err(into_connectivity)?;

        let errors: Vec<RecordedError> = metadata
            .failed_schemas
            .iter()
            .map(|f| {
                let err = MigrateError::Introspection {
                    schema: f.schema.clone(),
                    message: f.message.clone(),
                };
                RecordedError::from_error(ErrorScope::Schema, f.schema.clone(), &err)
            })
            .collect();

        if let Some(filter) = &options.tables {
            for missing in filter.unmatched(metadata.tables.keys()) {
                warn!("Table {} from the table filter was not found in the source", missing);
                progress.warning(format!("table {} not found in source", missing));
            }
            metadata.retain_tables(|name| filter.contains(name));
        }

        info!(
            "Found {} tables and {} views",
            metadata.tables.len(),
            metadata.views.len()
        );
        Ok((metadata, errors))
    }

    fn load_translator(&self) -> Result<IdentifierTranslator> {
        match &self.config.migration.translations_file {
            Some(path) => IdentifierTranslator::load(path),
            None => Ok(IdentifierTranslator::identity()),
        }
    }

    fn load_definitions(&self) -> Result<SchemaDefinitions> {
        match &self.config.migration.schema_definition_file {
            Some(path) => SchemaDefinitions::load_optional(path),
            None => Ok(SchemaDefinitions::default()),
        }
    }

    fn build_report(&self, inputs: ReportInputs<'_>) -> MigrationReport {
        let completed_at = Utc::now();
        let duration = (completed_at - inputs.started_at).num_milliseconds() as f64 / 1000.0;

        let mut tables: Vec<TableReport> = inputs.results.iter().map(CopyResult::to_report).collect();
        let by_name: BTreeMap<String, &RecordedError> = inputs
            .not_created
            .iter()
            .map(|e| (e.identifier.clone(), e))
            .collect();
        for table in &inputs.plan.tables {
            if let Some(err) = by_name.get(&table.name().to_string()) {
                tables.push(TableReport {
                    table: table.name().to_string(),
                    target: table.target_qualified().to_string(),
                    strategy: "none".to_string(),
                    rows_copied: 0,
                    rows_skipped: 0,
                    status: TableStatus::Failed,
                    error: Some(err.message.clone()),
                });
            }
        }

        let tables_failed = tables.iter().filter(|t| t.status == TableStatus::Failed).count();
        let tables_success = tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Completed | TableStatus::Skipped))
            .count();
        let failed_tables = tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .map(|t| t.table.clone())
            .collect();
        let rows_transferred: u64 = tables.iter().map(|t| t.rows_copied).sum();
        let rows_per_second = if duration > 0.0 {
            (rows_transferred as f64 / duration) as i64
        } else {
            0
        };

        MigrationReport {
            run_id: inputs.run_id,
            config_hash: self.config.hash(),
            status: final_status(inputs.cancelled, &inputs.errors),
            started_at: inputs.started_at,
            completed_at,
            duration_seconds: duration,
            tables_total: inputs.plan.tables.len(),
            tables_success,
            tables_failed,
            rows_transferred,
            rows_per_second,
            failed_tables,
            tables,
            views: inputs.views,
            added_columns: inputs.added_columns,
            cycles: inputs.plan.resolution.cycles.clone(),
            errors: inputs.errors,
        }
    }
}

struct ReportInputs<'a> {
    run_id: String,
    started_at: chrono::DateTime<Utc>,
    cancelled: bool,
    plan: &'a MigrationPlan,
    results: &'a [CopyResult],
    not_created: &'a [RecordedError],
    views: Vec<crate::views::TranslationResult>,
    added_columns: Vec<crate::columns::AddedColumn>,
    errors: Vec<RecordedError>,
}

/// Surface recorded errors as warning events and keep them for the report.
fn record(errors: &mut Vec<RecordedError>, new: Vec<RecordedError>, progress: &ProgressReporter) {
    for e in &new {
        progress.warning(format!("{}: {}", e.identifier, e.message));
    }
    errors.extend(new);
}

fn into_connectivity(err: MigrateError) -> MigrateError {
    if err.is_connection_error() && !matches!(err, MigrateError::Connectivity(_)) {
        MigrateError::Connectivity(err.to_string())
    } else {
        err
    }
}
