use shared::metrics_defs::{MetricDef, MetricKind};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    kind: MetricKind::Histogram,
    labels: &["status", "placement", "reason"],
    description: "Request duration in seconds.",
};

pub const ADMISSION_REJECTED: MetricDef = MetricDef {
    name: "admission.rejected",
    kind: MetricKind::Counter,
    labels: &["placement"],
    description: "Requests shed by the concurrency limit.",
};

pub const FAILOVERS: MetricDef = MetricDef {
    name: "failover.total",
    kind: MetricKind::Counter,
    labels: &["reason"],
    description: "One-step failovers taken.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, ADMISSION_REJECTED, FAILOVERS];
