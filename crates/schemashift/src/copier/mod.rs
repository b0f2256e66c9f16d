//! Batched data copy from source to target.

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::plan::{CopyStrategy, TablePlan};
use crate::progress::ProgressReporter;
use crate::report::{ErrorKind, ErrorScope, RecordedError, TableReport, TableStatus};
use crate::source::{Batch, QualifiedName, ReadMode, SourcePool};
use crate::target::{ConflictPolicy, SqlValue, TargetPool, WriteTarget};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batches buffered between a streaming reader and the writer.
const READ_AHEAD: usize = 2;

/// Copier configuration.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Rows per source page and per target transaction.
    pub batch_size: usize,
    /// Emit a progress event every this many rows.
    pub progress_interval: u64,
    /// Wait before the single retry of a failed batch.
    pub retry_backoff: Duration,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            progress_interval: 1000,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl CopyOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            progress_interval: config.progress_interval.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// A table ready to copy.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub plan: Arc<TablePlan>,
    pub strategy: CopyStrategy,
}

/// Outcome of copying one table.
#[derive(Debug, Clone)]
pub struct CopyResult {
    pub table: QualifiedName,
    pub target: QualifiedName,
    pub strategy: CopyStrategy,
    pub rows_copied: u64,
    pub rows_skipped: u64,
    pub errors: Vec<RecordedError>,
    pub status: TableStatus,
    pub duration: Duration,
}

impl CopyResult {
    fn new(plan: &TablePlan, strategy: &CopyStrategy) -> Self {
        Self {
            table: plan.name().clone(),
            target: plan.target_qualified(),
            strategy: strategy.clone(),
            rows_copied: 0,
            rows_skipped: 0,
            errors: Vec::new(),
            status: TableStatus::Completed,
            duration: Duration::ZERO,
        }
    }

    fn cancelled(plan: &TablePlan, strategy: &CopyStrategy) -> Self {
        let mut result = Self::new(plan, strategy);
        result.status = TableStatus::Cancelled;
        result
    }

    fn record(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", self.table, message);
        self.errors.push(RecordedError::new(
            ErrorScope::Table,
            self.table.to_string(),
            kind,
            message,
        ));
    }

    fn fail(&mut self, err: &MigrateError) {
        self.status = TableStatus::Failed;
        let err = MigrateError::data_copy(
            self.table.to_string(),
            format!("after {} rows: {}", self.rows_copied, err),
        );
        self.record(ErrorKind::DataCopy, err.to_string());
    }

    /// First table-level failure message, if any.
    pub fn failure(&self) -> Option<&str> {
        self.errors
            .iter()
            .find(|e| e.kind == ErrorKind::DataCopy)
            .map(|e| e.message.as_str())
    }

    pub fn to_report(&self) -> TableReport {
        TableReport {
            table: self.table.to_string(),
            target: self.target.to_string(),
            strategy: self.strategy.as_str().to_string(),
            rows_copied: self.rows_copied,
            rows_skipped: self.rows_skipped,
            status: self.status,
            error: match (&self.strategy, self.status) {
                (CopyStrategy::Skip(reason), TableStatus::Skipped) => Some(reason.clone()),
                _ => self.failure().map(str::to_string),
            },
        }
    }
}

/// Remove NUL characters, which PostgreSQL rejects in text.
pub fn strip_nul(row: &mut [SqlValue]) {
    for value in row.iter_mut() {
        if let SqlValue::String(s) = value {
            if s.contains('\0') {
                s.retain(|c| c != '\0');
            }
        }
    }
}

/// Copies table data in batches, one transaction per batch.
#[derive(Clone)]
pub struct DataCopier {
    source: Arc<dyn SourcePool>,
    target: Arc<dyn TargetPool>,
    options: CopyOptions,
    progress: ProgressReporter,
}

impl DataCopier {
    pub fn new(
        source: Arc<dyn SourcePool>,
        target: Arc<dyn TargetPool>,
        options: CopyOptions,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            source,
            target,
            options,
            progress,
        }
    }

    /// Copy one table.
    ///
    /// Cancellation is checked between batches; a batch in flight finishes or
    /// rolls back on its own.
    pub async fn copy_table(
        &self,
        plan: &TablePlan,
        strategy: &CopyStrategy,
        cancel: &CancellationToken,
    ) -> CopyResult {
        let table_name = plan.name().to_string();
        let start = Instant::now();
        let mut result = CopyResult::new(plan, strategy);

        if let CopyStrategy::Skip(reason) = strategy {
            info!("{}: skipping data copy ({})", table_name, reason);
            result.status = TableStatus::Skipped;
            self.progress.table_finished(&table_name, 0, true);
            return result;
        }
        if cancel.is_cancelled() {
            return CopyResult::cancelled(plan, strategy);
        }

        info!(
            "Starting copy for {} -> {}.{} ({}, ~{} rows)",
            table_name,
            plan.target_schema,
            plan.target_name,
            strategy.as_str(),
            plan.row_estimate
        );
        self.progress.table_started(&table_name);

        let target = WriteTarget {
            schema: plan.target_schema.clone(),
            table: plan.target_name.clone(),
            columns: plan.target_columns(),
            conflict: match strategy {
                CopyStrategy::InsertIgnore => ConflictPolicy::DoNothing,
                _ => ConflictPolicy::Error,
            },
        };

        let read = match plan.source.read_mode(plan.custom_query.as_deref()) {
            ReadMode::Keyed(key) => self.copy_paged(plan, &key, &target, &mut result, cancel).await,
            ReadMode::SinglePass => self.copy_streamed(plan, &target, &mut result, cancel).await,
        };
        if let Err(e) = read {
            result.fail(&e);
        }

        if result.status == TableStatus::Completed {
            for column in plan.identity_columns() {
                if let Err(e) = self
                    .target
                    .reset_identity(&plan.target_schema, &plan.target_name, column)
                    .await
                {
                    result.record(
                        ErrorKind::Column,
                        format!("could not reset identity for column {}: {}", column, e),
                    );
                }
            }
        }

        result.duration = start.elapsed();
        let rows_per_sec = if result.duration.as_secs_f64() > 0.0 {
            (result.rows_copied as f64 / result.duration.as_secs_f64()) as i64
        } else {
            0
        };
        info!(
            "{}: copied {} rows, skipped {} in {:?} ({} rows/sec)",
            table_name, result.rows_copied, result.rows_skipped, result.duration, rows_per_sec
        );

        self.progress.table_finished(
            &table_name,
            result.rows_copied,
            result.status != TableStatus::Failed,
        );
        result
    }

    /// Offset paging over a unique key.
    async fn copy_paged(
        &self,
        plan: &TablePlan,
        key: &[String],
        target: &WriteTarget,
        result: &mut CopyResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut next_report = self.options.progress_interval;
        let mut offset: i64 = 0;

        loop {
            if cancel.is_cancelled() {
                info!("{}: cancelled after {} rows", plan.name(), result.rows_copied);
                result.status = TableStatus::Cancelled;
                return Ok(());
            }

            let batch = self.fetch_with_retry(plan, key, offset).await?;
            let fetched = batch.fetched;
            self.apply_batch(plan, target, batch, offset, result, &mut next_report)
                .await?;
            offset += fetched as i64;

            if fetched < self.options.batch_size {
                debug!("{}: no more rows to read", plan.name());
                return Ok(());
            }
        }
    }

    /// One streamed query for tables without a unique key and for custom
    /// queries, whose row order cannot be repeated across pages.
    ///
    /// A connection failure is retried once, and only while nothing has been
    /// written yet; after that a re-read would duplicate rows.
    async fn copy_streamed(
        &self,
        plan: &TablePlan,
        target: &WriteTarget,
        result: &mut CopyResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut retried = false;

        loop {
            let (tx, mut rx) = mpsc::channel::<Batch>(READ_AHEAD);
            let source = self.source.clone();
            let table = plan.source.clone();
            let query = plan.custom_query.clone();
            let batch_size = self.options.batch_size;
            let reader = tokio::spawn(async move {
                source
                    .stream_rows(&table, query.as_deref(), batch_size, tx)
                    .await
            });

            let mut next_report = self.options.progress_interval;
            let mut offset: i64 = 0;
            while let Some(batch) = rx.recv().await {
                if cancel.is_cancelled() {
                    info!("{}: cancelled after {} rows", plan.name(), result.rows_copied);
                    result.status = TableStatus::Cancelled;
                    reader.abort();
                    return Ok(());
                }
                let fetched = batch.fetched;
                if let Err(e) = self
                    .apply_batch(plan, target, batch, offset, result, &mut next_report)
                    .await
                {
                    reader.abort();
                    return Err(e);
                }
                offset += fetched as i64;
            }

            match reader.await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_connection_error() && offset == 0 && !retried => {
                    warn!(
                        "{}: read failed ({}), retrying in {:?}",
                        plan.name(),
                        e,
                        self.options.retry_backoff
                    );
                    retried = true;
                    tokio::time::sleep(self.options.retry_backoff).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(MigrateError::data_copy(plan.name().to_string(), e.to_string())),
            }
        }
    }

    /// Record rejected rows, write the rest and report progress.
    async fn apply_batch(
        &self,
        plan: &TablePlan,
        target: &WriteTarget,
        batch: Batch,
        offset: i64,
        result: &mut CopyResult,
        next_report: &mut u64,
    ) -> Result<()> {
        for rejected in &batch.rejected {
            result.rows_skipped += 1;
            result.record(
                ErrorKind::Row,
                format!("row {} skipped: {}", rejected.position, rejected.message),
            );
        }

        let mut rows = batch.rows;
        for row in rows.iter_mut() {
            strip_nul(row);
        }
        self.write_rows(target, &rows, offset, result).await?;

        if result.rows_copied >= *next_report {
            self.progress
                .rows(plan.name().to_string(), result.rows_copied, plan.row_estimate);
            while *next_report <= result.rows_copied {
                *next_report += self.options.progress_interval;
            }
        }
        Ok(())
    }

    async fn fetch_with_retry(&self, plan: &TablePlan, key: &[String], offset: i64) -> Result<Batch> {
        let fetch = || {
            self.source
                .fetch_batch(&plan.source, key, offset, self.options.batch_size)
        };
        match fetch().await {
            Err(e) if e.is_connection_error() => {
                warn!(
                    "{}: read at offset {} failed ({}), retrying in {:?}",
                    plan.name(),
                    offset,
                    e,
                    self.options.retry_backoff
                );
                tokio::time::sleep(self.options.retry_backoff).await;
                fetch().await
            }
            other => other,
        }
    }

    /// Write one batch. Connection errors get a single retry and then fail the
    /// table; data errors fall back to row-by-row writes so only the bad rows
    /// are skipped.
    async fn write_rows(
        &self,
        target: &WriteTarget,
        rows: &[Vec<SqlValue>],
        offset: i64,
        result: &mut CopyResult,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let first = match self.target.write_batch(target, rows).await {
            Err(e) if e.is_connection_error() => {
                warn!(
                    "{}: write failed ({}), retrying in {:?}",
                    result.table, e, self.options.retry_backoff
                );
                tokio::time::sleep(self.options.retry_backoff).await;
                self.target.write_batch(target, rows).await
            }
            other => other,
        };

        match first {
            Ok(inserted) => {
                result.rows_copied += inserted;
                result.rows_skipped += rows.len() as u64 - inserted.min(rows.len() as u64);
                Ok(())
            }
            Err(e) if e.is_connection_error() => Err(e),
            Err(e) => {
                debug!(
                    "{}: batch at offset {} rejected ({}), writing rows one at a time",
                    result.table, offset, e
                );
                for (i, row) in rows.iter().enumerate() {
                    match self.target.write_batch(target, std::slice::from_ref(row)).await {
                        Ok(n) => {
                            result.rows_copied += n;
                            result.rows_skipped += 1 - n.min(1);
                        }
                        Err(e) if e.is_connection_error() => return Err(e),
                        Err(e) => {
                            result.rows_skipped += 1;
                            result.record(
                                ErrorKind::Row,
                                format!("row {} skipped: {}", offset + i as i64, e),
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Copy many tables concurrently.
    ///
    /// A table starts once every parent it depends on has finished, whether or
    /// not that parent succeeded. At most `workers` tables copy at a time.
    /// Results come back in `jobs` order.
    pub async fn copy_all(
        &self,
        jobs: Vec<CopyJob>,
        dependencies: &BTreeMap<QualifiedName, BTreeSet<QualifiedName>>,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Vec<CopyResult> {
        let workers = workers.max(1);
        info!("Copying {} tables with up to {} workers", jobs.len(), workers);

        let in_scope: BTreeSet<QualifiedName> = jobs.iter().map(|j| j.plan.name().clone()).collect();
        let mut waiting_on: BTreeMap<QualifiedName, BTreeSet<QualifiedName>> = jobs
            .iter()
            .map(|j| {
                let name = j.plan.name();
                let parents = dependencies
                    .get(name)
                    .map(|ps| ps.intersection(&in_scope).cloned().collect())
                    .unwrap_or_default();
                (name.clone(), parents)
            })
            .collect();

        let order: Vec<QualifiedName> = jobs.iter().map(|j| j.plan.name().clone()).collect();
        let mut pending: Vec<CopyJob> = jobs;
        let mut finished: BTreeMap<QualifiedName, CopyResult> = BTreeMap::new();
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut running = FuturesUnordered::new();

        loop {
            if !cancel.is_cancelled() {
                let mut still_pending = Vec::with_capacity(pending.len());
                for job in pending.drain(..) {
                    let ready = waiting_on
                        .get(job.plan.name())
                        .map(|ps| ps.is_empty())
                        .unwrap_or(true);
                    if !ready {
                        still_pending.push(job);
                        continue;
                    }

                    let copier = self.clone();
                    let semaphore = semaphore.clone();
                    let cancel = cancel.clone();
                    let name = job.plan.name().clone();
                    let handle = tokio::spawn(async move {
                        let _permit = semaphore.acquire_owned().await;
                        copier.copy_table(&job.plan, &job.strategy, &cancel).await
                    });
                    running.push(async move { (name, handle.await) });
                }
                pending = still_pending;
            }

            let Some((name, joined)) = running.next().await else {
                break;
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("Copy task for {} panicked: {}", name, e);
                    let mut result = CopyResult {
                        table: name.clone(),
                        target: name.clone(),
                        strategy: CopyStrategy::Bulk,
                        rows_copied: 0,
                        rows_skipped: 0,
                        errors: Vec::new(),
                        status: TableStatus::Failed,
                        duration: Duration::ZERO,
                    };
                    result.fail(&MigrateError::data_copy(name.to_string(), e.to_string()));
                    result
                }
            };
            for parents in waiting_on.values_mut() {
                parents.remove(&name);
            }
            finished.insert(name, result);
        }

        // Anything still pending never started because the run was cancelled
        for job in pending {
            finished.insert(
                job.plan.name().clone(),
                CopyResult::cancelled(&job.plan, &job.strategy),
            );
        }

        order
            .into_iter()
            .filter_map(|name| finished.remove(&name))
            .collect()
    }
}
