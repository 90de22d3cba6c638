//! Prometheus metrics for the script sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::FaultKind;

/// Label set for execution metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// "completed" or "failed".
    pub outcome: String,
}

/// Label set for error metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// A [`FaultKind`] label such as "timeout" or "runtime_fault".
    pub kind: String,
}

/// Prometheus metrics for script executions.
pub struct ScriptMetrics {
    /// Total executions by outcome.
    pub executions_total: Family<OutcomeLabels, Counter>,
    /// Execution duration in seconds.
    pub execution_duration_seconds: Histogram,
    /// Total failures by kind.
    pub errors_total: Family<ErrorLabels, Counter>,
}

impl ScriptMetrics {
    /// Create the metrics and register them with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "postrun_executions_total",
            "Total script executions",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0].into_iter());
        registry.register(
            "postrun_execution_duration_seconds",
            "Script execution duration",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "postrun_errors_total",
            "Total script failures by kind",
            errors_total.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
        }
    }

    /// Record a finished execution.
    pub fn record_execution(&self, completed: bool, duration_secs: f64) {
        let labels = OutcomeLabels {
            outcome: if completed { "completed" } else { "failed" }.to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        self.execution_duration_seconds.observe(duration_secs);
    }

    /// Record a failure.
    pub fn record_error(&self, kind: FaultKind) {
        let labels = ErrorLabels {
            kind: kind.as_str().to_string(),
        };
        self.errors_total.get_or_create(&labels).inc();
    }
}
