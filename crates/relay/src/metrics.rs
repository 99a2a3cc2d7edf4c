use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use concord_common::protocol::messages::{NackErrorType, Trace};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    #[error("latency metric {0} has no traces")]
    EmptyTraces(String),
    #[error("latency metric {metric} has traces out of order")]
    OutOfOrder { metric: String },
}

/// Destination for client round-trip latency traces.
pub trait LatencyMetricSink: Send + Sync {
    fn write_latency_metric(&self, metric: &str, traces: &[Trace]) -> Result<(), MetricError>;
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    latency_count: Mutex<HashMap<String, u64>>,
    latency_sum_ms: Mutex<HashMap<String, u64>>,
    nacks_total: Mutex<HashMap<String, u64>>,
    connected_clients: AtomicI64,
    sequencer_failures_total: AtomicU64,
}

const NACK_TYPES: [NackErrorType; 4] = [
    NackErrorType::ThrottlingError,
    NackErrorType::InvalidScopeError,
    NackErrorType::BadRequestError,
    NackErrorType::LimitExceededError,
];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        let mut nacks_total = HashMap::new();
        for nack_type in NACK_TYPES {
            nacks_total.insert(nack_type_label(nack_type).to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            latency_count: Mutex::new(HashMap::new()),
            latency_sum_ms: Mutex::new(HashMap::new()),
            nacks_total: Mutex::new(nacks_total),
            connected_clients: AtomicI64::new(0),
            sequencer_failures_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn increment_nacks_total(nack_type: NackErrorType) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_nacks_total(nack_type);
    }
}

pub fn add_connected_clients(delta: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.add_connected_clients(delta);
    }
}

pub fn increment_sequencer_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_sequencer_failures();
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        let normalized_endpoint = normalize_label(endpoint);
        increment_label_counter(&self.ws_rate_total, &normalized_endpoint, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized_endpoint, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized_endpoint, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized_endpoint, 1);
        }
    }

    pub fn increment_nacks_total(&self, nack_type: NackErrorType) {
        increment_label_counter(&self.nacks_total, nack_type_label(nack_type), 1);
    }

    pub fn add_connected_clients(&self, delta: i64) {
        self.connected_clients.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn increment_sequencer_failures(&self) {
        self.sequencer_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_rate_total Total websocket events by endpoint.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "endpoint", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket event errors by endpoint.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "endpoint",
            &self.ws_errors_total,
        );

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket event latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "endpoint",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by endpoint.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            "endpoint",
            &self.ws_duration_count,
        );

        output.push_str("# HELP client_latency_ms_sum Sum of client round-trip latency in milliseconds.\n");
        output.push_str("# TYPE client_latency_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "client_latency_ms_sum",
            "metric",
            &self.latency_sum_ms,
        );

        output.push_str("# HELP client_latency_ms_count Count of client round-trip latency samples.\n");
        output.push_str("# TYPE client_latency_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "client_latency_ms_count",
            "metric",
            &self.latency_count,
        );

        output.push_str("# HELP nacks_total Total nacks sent by error type.\n");
        output.push_str("# TYPE nacks_total counter\n");
        append_label_counter_lines(&mut output, "nacks_total", "type", &self.nacks_total);

        output.push_str("# HELP connected_clients Currently connected document clients.\n");
        output.push_str("# TYPE connected_clients gauge\n");
        output.push_str(&format!(
            "connected_clients {}\n",
            self.connected_clients.load(Ordering::SeqCst).max(0)
        ));

        output.push_str(
            "# HELP sequencer_failures_total Connections failed by the sequencer.\n",
        );
        output.push_str("# TYPE sequencer_failures_total counter\n");
        output.push_str(&format!(
            "sequencer_failures_total {}\n",
            self.sequencer_failures_total.load(Ordering::SeqCst)
        ));

        output
    }
}

impl LatencyMetricSink for RelayMetrics {
    /// Records the span between the first and last trace in milliseconds.
    fn write_latency_metric(&self, metric: &str, traces: &[Trace]) -> Result<(), MetricError> {
        let (Some(first), Some(last)) = (traces.first(), traces.last()) else {
            return Err(MetricError::EmptyTraces(metric.to_string()));
        };

        let elapsed = last.timestamp - first.timestamp;
        if !elapsed.is_finite() || elapsed < 0.0 {
            return Err(MetricError::OutOfOrder { metric: metric.to_string() });
        }

        let label = normalize_label(metric);
        increment_label_counter(&self.latency_sum_ms, &label, elapsed.round() as u64);
        increment_label_counter(&self.latency_count, &label, 1);
        Ok(())
    }
}

fn nack_type_label(nack_type: NackErrorType) -> &'static str {
    match nack_type {
        NackErrorType::ThrottlingError => "ThrottlingError",
        NackErrorType::InvalidScopeError => "InvalidScopeError",
        NackErrorType::BadRequestError => "BadRequestError",
        NackErrorType::LimitExceededError => "LimitExceededError",
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    let mut previous = "";
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        // Tenant and document ids are free-form; collapse them by position.
        if previous == "tenants" {
            normalized_segments.push("{tenant}".to_string());
        } else if previous == "documents" {
            normalized_segments.push("{document}".to_string());
        } else {
            normalized_segments.push(segment.to_string());
        }
        previous = segment;
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
