//! Exposición en formato de texto de Prometheus (0.0.4).

use crate::collector::{DimensionSnapshot, MetricsSnapshot};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Límites superiores (ms) de los buckets de latencia; `+Inf` se añade aparte.
pub const LATENCY_BUCKETS_MS: [f64; 8] = [10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn labels(d: &DimensionSnapshot) -> String {
    format!("dimension=\"{}\",name=\"{}\"", d.kind.as_str(), escape_label(&d.name))
}

pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str("# HELP nha_requests_total Calls recorded per dimension.\n");
    out.push_str("# TYPE nha_requests_total counter\n");
    for d in &snapshot.dimensions {
        out.push_str(&format!("nha_requests_total{{{}}} {}\n", labels(d), d.requests));
    }
    out.push_str("# HELP nha_errors_total Failed calls per dimension.\n");
    out.push_str("# TYPE nha_errors_total counter\n");
    for d in &snapshot.dimensions {
        out.push_str(&format!("nha_errors_total{{{}}} {}\n", labels(d), d.errors));
    }
    out.push_str("# HELP nha_skipped_total Skipped nodes per dimension.\n");
    out.push_str("# TYPE nha_skipped_total counter\n");
    for d in &snapshot.dimensions {
        out.push_str(&format!("nha_skipped_total{{{}}} {}\n", labels(d), d.skipped));
    }
    out.push('\n');

    out.push_str("# HELP nha_error_rate Error rate over the trailing window.\n");
    out.push_str("# TYPE nha_error_rate gauge\n");
    for d in &snapshot.dimensions {
        out.push_str(&format!("nha_error_rate{{{}}} {}\n", labels(d), d.error_rate));
    }
    out.push_str("# HELP nha_breaker_open 1 when the error rate is over the threshold.\n");
    out.push_str("# TYPE nha_breaker_open gauge\n");
    for d in &snapshot.dimensions {
        out.push_str(&format!("nha_breaker_open{{{}}} {}\n", labels(d), u8::from(d.breaker_open)));
    }
    out.push_str("# HELP nha_latency_p95_ms P95 latency over the sample window.\n");
    out.push_str("# TYPE nha_latency_p95_ms gauge\n");
    for d in &snapshot.dimensions {
        out.push_str(&format!("nha_latency_p95_ms{{{}}} {}\n", labels(d), d.p95_ms));
    }
    out.push('\n');

    // buckets acumulativos sobre la ventana de muestras
    out.push_str("# HELP nha_latency_ms Latency distribution over the sample window.\n");
    out.push_str("# TYPE nha_latency_ms histogram\n");
    for d in &snapshot.dimensions {
        let l = labels(d);
        for le in LATENCY_BUCKETS_MS {
            let count = d.samples_ms.iter().filter(|v| **v <= le).count();
            out.push_str(&format!("nha_latency_ms_bucket{{{l},le=\"{le}\"}} {count}\n"));
        }
        out.push_str(&format!("nha_latency_ms_bucket{{{l},le=\"+Inf\"}} {}\n", d.samples_ms.len()));
        let sum: f64 = d.samples_ms.iter().sum();
        out.push_str(&format!("nha_latency_ms_sum{{{l}}} {sum}\n"));
        out.push_str(&format!("nha_latency_ms_count{{{l}}} {}\n", d.samples_ms.len()));
    }
    out.push('\n');

    out.push_str("# HELP nha_flow_runs_total Finished flow runs by status.\n");
    out.push_str("# TYPE nha_flow_runs_total counter\n");
    for (status, count) in &snapshot.runs {
        out.push_str(&format!("nha_flow_runs_total{{status=\"{status}\"}} {count}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
