use shared::metrics_defs::{MetricDef, MetricKind};

pub const CONFIG_RELOADS: MetricDef = MetricDef {
    name: "config.reloads",
    kind: MetricKind::Counter,
    labels: &["source", "outcome"],
    description: "Config replacement attempts.",
};

pub const PUSH_RECONNECTS: MetricDef = MetricDef {
    name: "controlplane.connects",
    kind: MetricKind::Counter,
    labels: &["outcome"],
    description: "Control plane connection attempts.",
};

pub const ALL_METRICS: &[MetricDef] = &[CONFIG_RELOADS, PUSH_RECONNECTS];
