//! Run progress.
//!
//! Workers never touch the progress state directly. They send updates over a
//! channel to a single task that owns [`ProgressState`], which publishes a
//! snapshot on a `watch` channel and every event on a `broadcast` channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Capacity of the event broadcast; slow subscribers miss old events.
const EVENT_BUFFER: usize = 1024;

/// Migration phase, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Connecting,
    FetchingMetadata,
    CreatingSchemas,
    CreatingTables,
    CopyingData,
    Validating,
    SyncingColumns,
    ApplyingConstraints,
    TranslatingViews,
    Complete,
}

impl Phase {
    /// Percentage reached when the phase starts.
    pub fn base_percentage(self) -> f64 {
        match self {
            Phase::Pending => 0.0,
            Phase::Connecting => 5.0,
            Phase::FetchingMetadata => 10.0,
            Phase::CreatingSchemas => 15.0,
            Phase::CreatingTables => 25.0,
            Phase::CopyingData => 35.0,
            Phase::Validating => 80.0,
            Phase::SyncingColumns => 82.0,
            Phase::ApplyingConstraints => 85.0,
            Phase::TranslatingViews => 90.0,
            Phase::Complete => 100.0,
        }
    }
}

/// Data copy spans 35% to 80%.
const COPY_START: f64 = 35.0;
const COPY_END: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
}

/// One progress event as seen by observers.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub percentage: f64,
    pub current_table: Option<String>,
    pub tables_total: usize,
    pub tables_completed: usize,
    pub level: EventLevel,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time copy of the progress state.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub message: String,
    pub percentage: f64,
    pub current_table: Option<String>,
    pub tables_total: usize,
    pub tables_completed: usize,
    pub tables_failed: usize,
    pub rows_copied: u64,
    pub warnings: usize,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Pending,
            message: String::new(),
            percentage: 0.0,
            current_table: None,
            tables_total: 0,
            tables_completed: 0,
            tables_failed: 0,
            rows_copied: 0,
            warnings: 0,
        }
    }
}

/// Message sent from workers to the progress task.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Phase { phase: Phase, message: String },
    TablesTotal(usize),
    TableStarted(String),
    Rows {
        table: String,
        rows_copied: u64,
        total_estimate: i64,
    },
    TableFinished {
        table: String,
        rows_copied: u64,
        success: bool,
    },
    Info(String),
    Warning(String),
}

/// The single owner of run progress.
#[derive(Debug, Default)]
pub struct ProgressState {
    snapshot: ProgressSnapshot,
    /// Rows copied by tables that already finished.
    finished_rows: u64,
}

impl ProgressState {
    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Apply an update and return the event describing it.
    ///
    /// Phase and percentage never move backwards.
    pub fn apply(&mut self, update: ProgressUpdate) -> ProgressEvent {
        let s = &mut self.snapshot;
        let mut level = EventLevel::Info;

        let message = match update {
            ProgressUpdate::Phase { phase, message } => {
                if phase > s.phase {
                    s.phase = phase;
                    s.current_table = None;
                }
                self.raise(phase.base_percentage());
                message
            }
            ProgressUpdate::TablesTotal(total) => {
                s.tables_total = total;
                format!("{} tables to migrate", total)
            }
            ProgressUpdate::TableStarted(table) => {
                let message = format!("Migrating {}", table);
                s.current_table = Some(table);
                message
            }
            ProgressUpdate::Rows {
                table,
                rows_copied,
                total_estimate,
            } => {
                s.rows_copied = self.finished_rows + rows_copied;
                let message = format!("{}: {}/{} rows", table, rows_copied, total_estimate.max(0));
                s.current_table = Some(table);
                message
            }
            ProgressUpdate::TableFinished {
                table,
                rows_copied,
                success,
            } => {
                s.tables_completed += 1;
                if !success {
                    s.tables_failed += 1;
                    level = EventLevel::Warning;
                    s.warnings += 1;
                }
                self.finished_rows += rows_copied;
                s.rows_copied = self.finished_rows;
                let pct = copy_percentage(s.tables_completed, s.tables_total);
                self.raise(pct);
                if success {
                    format!("Finished {} ({} rows)", table, rows_copied)
                } else {
                    format!("Failed {}", table)
                }
            }
            ProgressUpdate::Info(message) => message,
            ProgressUpdate::Warning(message) => {
                self.snapshot.warnings += 1;
                level = EventLevel::Warning;
                message
            }
        };

        let s = &mut self.snapshot;
        s.message = message.clone();
        ProgressEvent {
            phase: s.phase,
            message,
            percentage: s.percentage,
            current_table: s.current_table.clone(),
            tables_total: s.tables_total,
            tables_completed: s.tables_completed,
            level,
            timestamp: Utc::now(),
        }
    }

    fn raise(&mut self, percentage: f64) {
        if percentage > self.snapshot.percentage {
            self.snapshot.percentage = percentage.min(100.0);
        }
    }
}

fn copy_percentage(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return COPY_END;
    }
    let fraction = (completed.min(total) as f64) / (total as f64);
    COPY_START + (COPY_END - COPY_START) * fraction
}

/// Cheap, cloneable handle for sending updates. A disabled reporter drops
/// everything.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ProgressReporter {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.tx {
            // The receiver only goes away after the run has finished
            let _ = tx.send(update);
        }
    }

    pub fn phase(&self, phase: Phase, message: impl Into<String>) {
        self.send(ProgressUpdate::Phase {
            phase,
            message: message.into(),
        });
    }

    pub fn tables_total(&self, total: usize) {
        self.send(ProgressUpdate::TablesTotal(total));
    }

    pub fn table_started(&self, table: impl Into<String>) {
        self.send(ProgressUpdate::TableStarted(table.into()));
    }

    pub fn rows(&self, table: impl Into<String>, rows_copied: u64, total_estimate: i64) {
        self.send(ProgressUpdate::Rows {
            table: table.into(),
            rows_copied,
            total_estimate,
        });
    }

    pub fn table_finished(&self, table: impl Into<String>, rows_copied: u64, success: bool) {
        self.send(ProgressUpdate::TableFinished {
            table: table.into(),
            rows_copied,
            success,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(ProgressUpdate::Info(message.into()));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.send(ProgressUpdate::Warning(message.into()));
    }
}

/// Handles returned by [`spawn_tracker`].
pub struct ProgressTracker {
    pub reporter: ProgressReporter,
    pub snapshots: watch::Receiver<ProgressSnapshot>,
    pub events: broadcast::Sender<ProgressEvent>,
    /// Completes once every reporter clone has been dropped.
    pub task: JoinHandle<ProgressSnapshot>,
}

/// Start the task that owns [`ProgressState`].
pub fn spawn_tracker() -> ProgressTracker {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let (snap_tx, snap_rx) = watch::channel(ProgressSnapshot::default());
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let events = event_tx.clone();
    let task = tokio::spawn(async move {
        let mut state = ProgressState::default();
        while let Some(update) = rx.recv().await {
            let event = state.apply(update);
            debug!(
                phase = ?event.phase,
                percentage = event.percentage,
                "{}",
                event.message
            );
            let _ = snap_tx.send(state.snapshot().clone());
            // No subscribers is fine
            let _ = event_tx.send(event);
        }
        state.snapshot().clone()
    });

    ProgressTracker {
        reporter: ProgressReporter { tx: Some(tx) },
        snapshots: snap_rx,
        events,
        task,
    }
}
