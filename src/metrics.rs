use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProgramLabels {
    pub program: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcLabels {
    pub method: String,
    pub code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MethodLabels {
    pub method: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SessionLabels {
    pub handler: String,
    pub exit_code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Transport {
    Ssh,
    Rpc,
    Http,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransportLabels {
    pub transport: Transport,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- subprocesses --
    pub processes_spawned_total: Family<ProgramLabels, Counter>,
    pub processes_outstanding: Gauge,

    // -- rpc --
    pub rpc_calls_total: Family<RpcLabels, Counter>,
    pub rpc_duration_seconds: Family<MethodLabels, Histogram>,

    // -- ssh --
    pub ssh_sessions_total: Family<SessionLabels, Counter>,

    // -- gauges --
    pub active_connections: Family<TransportLabels, Gauge>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let processes_spawned_total = Family::<ProgramLabels, Counter>::default();
        registry.register(
            "repostore_processes_spawned",
            "Subprocesses started, by program",
            processes_spawned_total.clone(),
        );

        let processes_outstanding: Gauge = Gauge::default();
        registry.register(
            "repostore_processes_outstanding",
            "Subprocesses started but not yet waited on",
            processes_outstanding.clone(),
        );

        let rpc_calls_total = Family::<RpcLabels, Counter>::default();
        registry.register(
            "repostore_rpc_calls",
            "Storage RPC calls by method and status code",
            rpc_calls_total.clone(),
        );

        let rpc_duration_seconds = Family::<MethodLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 14))
        });
        registry.register(
            "repostore_rpc_duration_seconds",
            "Storage RPC latency in seconds",
            rpc_duration_seconds.clone(),
        );

        let ssh_sessions_total = Family::<SessionLabels, Counter>::default();
        registry.register(
            "repostore_ssh_sessions",
            "SSH sessions by handler and exit code",
            ssh_sessions_total.clone(),
        );

        let active_connections = Family::<TransportLabels, Gauge>::default();
        registry.register(
            "repostore_active_connections",
            "Currently active connections by transport",
            active_connections.clone(),
        );

        Self {
            processes_spawned_total,
            processes_outstanding,
            rpc_calls_total,
            rpc_duration_seconds,
            ssh_sessions_total,
            active_connections,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cheaply clonable handle on the registry and its metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn record_rpc(&self, method: &str, code: &str, elapsed: std::time::Duration) {
        self.metrics
            .rpc_calls_total
            .get_or_create(&RpcLabels {
                method: method.to_string(),
                code: code.to_string(),
            })
            .inc();
        self.metrics
            .rpc_duration_seconds
            .get_or_create(&MethodLabels {
                method: method.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_ssh_session(&self, handler: &str, exit_code: u32) {
        self.metrics
            .ssh_sessions_total
            .get_or_create(&SessionLabels {
                handler: handler.to_string(),
                exit_code: exit_code.to_string(),
            })
            .inc();
    }

    /// Gauge tracking one open connection; decremented when dropped.
    pub fn connection(&self, transport: Transport) -> ConnectionGuard {
        let gauge = self
            .metrics
            .active_connections
            .get_or_create(&TransportLabels { transport })
            .clone();
        gauge.inc();
        ConnectionGuard { gauge }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionGuard {
    gauge: Gauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
