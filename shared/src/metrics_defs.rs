//! Metric declarations. Each crate lists what it emits as `MetricDef`
//! constants so names, kinds, and label keys live in one auditable place.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricKind::Counter => "counter",
            MetricKind::Histogram => "histogram",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub kind: MetricKind,
    /// Label keys every recording site must supply.
    pub labels: &'static [&'static str],
    pub description: &'static str,
}

/// Renders metric definitions as a markdown table for docs tooling.
pub fn render_markdown_table(metrics: &[MetricDef]) -> String {
    let mut lines = vec![
        "| Metric | Kind | Labels | Description |".to_string(),
        "|--------|------|--------|-------------|".to_string(),
    ];
    for m in metrics {
        lines.push(format!(
            "| `{}` | {} | {} | {} |",
            m.name,
            m.kind,
            m.labels.join(", "),
            m.description
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_kind_and_labels() {
        let defs = [MetricDef {
            name: "request.duration",
            kind: MetricKind::Histogram,
            labels: &["status", "placement"],
            description: "Request duration in seconds",
        }];
        let table = render_markdown_table(&defs);
        assert!(table.contains("`request.duration`"));
        assert!(table.contains("histogram"));
        assert!(table.contains("status, placement"));
    }
}
