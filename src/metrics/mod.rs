//! Metrics for monitoring migrations and placement record maintenance.
//!
//! Progress of a migration is not queryable beyond the completion callback,
//! so these counters (plus log events) are the observability surface.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     MigrationMetrics                         │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌──────────────┐  │
//! │  │  Counters      │  │   Gauges        │  │  Histograms  │  │
//! │  │ - started      │  │ - executors     │  │ - duration   │  │
//! │  │ - aborted      │  │ - clients       │  │              │  │
//! │  │ - delta sets   │  │ - shards active │  │              │  │
//! │  └────────────────┘  └─────────────────┘  └──────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{
    Histogram, HistogramSnapshot, MIGRATION_DURATION_BUCKETS, SYNC_LATENCY_BUCKETS,
};

use std::time::Duration;

/// Counters and gauges for the migration coordinator and its tasks.
#[derive(Debug)]
pub struct MigrationMetrics {
    /// Migrations started (orchestrator driven and resync).
    pub migrations_started: Counter,
    /// Migrations whose callback reported success.
    pub migrations_completed: Counter,
    /// Migrations aborted, by reason.
    pub migrations_aborted: LabeledCounter,
    /// Resyncs started.
    pub resyncs_started: Counter,
    /// Shard snapshots requested by executors.
    pub snapshots_requested: Counter,
    /// Filter sets sent to sources.
    pub filter_sets_sent: Counter,
    /// Delta sets sent by clients.
    pub delta_sets_sent: Counter,
    /// Delta sets applied by executors.
    pub delta_sets_applied: Counter,
    /// Objects sent by clients.
    pub objects_sent: Counter,
    /// Objects applied by executors.
    pub objects_applied: Counter,
    /// Fine tokens a source declined.
    pub tokens_declined: Counter,
    /// Live requests mirrored to destinations.
    pub forwarded_requests: Counter,
    /// Shard starts retried because the source was not ready.
    pub source_not_ready_retries: Counter,

    /// Shards currently migrating.
    pub shards_in_progress: Gauge,
    /// Live executors.
    pub executors: Gauge,
    /// Live clients.
    pub clients: Gauge,

    /// Wall time from start to callback.
    pub migration_duration: Histogram,
}

impl MigrationMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self {
            migrations_started: Counter::new("migrations_started_total", "Migrations started"),
            migrations_completed: Counter::new(
                "migrations_completed_total",
                "Migrations completed successfully",
            ),
            migrations_aborted: LabeledCounter::new(
                "migrations_aborted_total",
                "Migrations aborted",
                "reason",
            ),
            resyncs_started: Counter::new("resyncs_started_total", "Restart resyncs started"),
            snapshots_requested: Counter::new(
                "migration_snapshots_requested_total",
                "Shard snapshots requested",
            ),
            filter_sets_sent: Counter::new("filter_sets_sent_total", "Filter sets sent"),
            delta_sets_sent: Counter::new("delta_sets_sent_total", "Delta sets sent"),
            delta_sets_applied: Counter::new("delta_sets_applied_total", "Delta sets applied"),
            objects_sent: Counter::new("migration_objects_sent_total", "Objects sent"),
            objects_applied: Counter::new("migration_objects_applied_total", "Objects applied"),
            tokens_declined: Counter::new("tokens_declined_total", "Fine tokens declined"),
            forwarded_requests: Counter::new(
                "forwarded_requests_total",
                "Live requests mirrored to a destination",
            ),
            source_not_ready_retries: Counter::new(
                "source_not_ready_retries_total",
                "Shard starts retried after source not ready",
            ),
            shards_in_progress: Gauge::new("migration_shards_in_progress", "Shards migrating"),
            executors: Gauge::new("migration_executors", "Live executors"),
            clients: Gauge::new("migration_clients", "Live clients"),
            migration_duration: Histogram::with_buckets(
                "migration_duration_seconds",
                "Migration wall time",
                MIGRATION_DURATION_BUCKETS,
            ),
        }
    }

    /// Record the end of a migration.
    pub fn record_finished(&self, duration: Duration, error: Option<&str>) {
        match error {
            None => self.migrations_completed.inc(),
            Some(reason) => self.migrations_aborted.inc(reason),
        }
        self.migration_duration.observe_duration(duration);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MigrationMetricsSnapshot {
        MigrationMetricsSnapshot {
            migrations_started: self.migrations_started.get(),
            migrations_completed: self.migrations_completed.get(),
            migrations_aborted: self.migrations_aborted.all().values().sum(),
            resyncs_started: self.resyncs_started.get(),
            snapshots_requested: self.snapshots_requested.get(),
            filter_sets_sent: self.filter_sets_sent.get(),
            delta_sets_sent: self.delta_sets_sent.get(),
            delta_sets_applied: self.delta_sets_applied.get(),
            objects_sent: self.objects_sent.get(),
            objects_applied: self.objects_applied.get(),
            tokens_declined: self.tokens_declined.get(),
            forwarded_requests: self.forwarded_requests.get(),
            source_not_ready_retries: self.source_not_ready_retries.get(),
            shards_in_progress: self.shards_in_progress.get(),
            executors: self.executors.get(),
            clients: self.clients.get(),
            migration_duration: self.migration_duration.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.migrations_started);
        add_metric!("counter", self.migrations_completed);
        add_metric!("counter", self.resyncs_started);
        add_metric!("counter", self.snapshots_requested);
        add_metric!("counter", self.filter_sets_sent);
        add_metric!("counter", self.delta_sets_sent);
        add_metric!("counter", self.delta_sets_applied);
        add_metric!("counter", self.objects_sent);
        add_metric!("counter", self.objects_applied);
        add_metric!("counter", self.tokens_declined);
        add_metric!("counter", self.forwarded_requests);
        add_metric!("counter", self.source_not_ready_retries);
        add_metric!("gauge", self.shards_in_progress);
        add_metric!("gauge", self.executors);
        add_metric!("gauge", self.clients);

        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} counter\n",
            self.migrations_aborted.name(),
            self.migrations_aborted.help(),
            self.migrations_aborted.name()
        ));
        for (reason, value) in self.migrations_aborted.all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.migrations_aborted.name(),
                self.migrations_aborted.label(),
                reason,
                value
            ));
        }

        let duration = self.migration_duration.snapshot();
        output.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} histogram\n{name}_sum {}\n{name}_count {}\n",
            duration.sum,
            duration.count,
            name = self.migration_duration.name(),
            help = self.migration_duration.help(),
        ));

        output
    }
}

impl Default for MigrationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of migration metrics.
#[derive(Debug, Clone)]
pub struct MigrationMetricsSnapshot {
    pub migrations_started: u64,
    pub migrations_completed: u64,
    pub migrations_aborted: u64,
    pub resyncs_started: u64,
    pub snapshots_requested: u64,
    pub filter_sets_sent: u64,
    pub delta_sets_sent: u64,
    pub delta_sets_applied: u64,
    pub objects_sent: u64,
    pub objects_applied: u64,
    pub tokens_declined: u64,
    pub forwarded_requests: u64,
    pub source_not_ready_retries: u64,
    pub shards_in_progress: i64,
    pub executors: i64,
    pub clients: i64,
    pub migration_duration: HistogramSnapshot,
}

/// Counters for placement record maintenance.
#[derive(Debug)]
pub struct PlacementMetrics {
    /// Record syncs attempted.
    pub record_syncs: Counter,
    /// Per-disk record write failures.
    pub sync_failures: Counter,
    /// Reconciliations run.
    pub reconciles: Counter,
    /// Disks rewritten by reconciliation.
    pub reconcile_rewrites: Counter,
    /// Disk topology changes applied.
    pub topology_changes: Counter,
    /// Time to sync the record to every disk.
    pub sync_latency: Histogram,
}

impl PlacementMetrics {
    /// Create a zeroed metrics set.
    pub fn new() -> Self {
        Self {
            record_syncs: Counter::new("placement_record_syncs_total", "Record syncs"),
            sync_failures: Counter::new(
                "placement_sync_failures_total",
                "Per-disk record write failures",
            ),
            reconciles: Counter::new("placement_reconciles_total", "Reconciliations"),
            reconcile_rewrites: Counter::new(
                "placement_reconcile_rewrites_total",
                "Disks rewritten by reconciliation",
            ),
            topology_changes: Counter::new(
                "placement_topology_changes_total",
                "Disk topology changes",
            ),
            sync_latency: Histogram::with_buckets(
                "placement_sync_seconds",
                "Record sync latency",
                SYNC_LATENCY_BUCKETS,
            ),
        }
    }
}

impl Default for PlacementMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_snapshot() {
        let metrics = MigrationMetrics::new();
        metrics.migrations_started.inc();
        metrics.executors.inc();
        metrics.record_finished(Duration::from_secs(2), None);
        metrics.record_finished(Duration::from_secs(400), Some("timeout"));

        let snap = metrics.snapshot();
        assert_eq!(snap.migrations_started, 1);
        assert_eq!(snap.migrations_completed, 1);
        assert_eq!(snap.migrations_aborted, 1);
        assert_eq!(snap.executors, 1);
        assert_eq!(snap.migration_duration.count, 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = MigrationMetrics::new();
        metrics.forwarded_requests.inc_by(3);
        metrics.migrations_aborted.inc("source");

        let output = metrics.to_prometheus();
        assert!(output.contains("forwarded_requests_total 3"));
        assert!(output.contains("migrations_aborted_total{reason=\"source\"} 1"));
        assert!(output.contains("# TYPE migration_executors gauge"));
    }
}
