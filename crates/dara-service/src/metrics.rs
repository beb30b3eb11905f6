//! Provides access to the metrics system.
//!
//! Metrics are reported to statsd once [`configure_statsd`] was called, and dropped before that.
//! The [`metric!`](crate::metric) macro emits a metric with the global tags attached.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// The metrics prelude that is necessary to use the client.
pub mod prelude {
    pub use cadence::prelude::*;
}

#[derive(Debug)]
pub struct MetricsClient {
    statsd_client: StatsdClient,
    /// Tags sent with every metric.
    tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd_client
    }

    /// Attaches the global tags and sends the metric.
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.tags {
            metric = metric.with_tag(tag, value);
        }
        metric.send()
    }
}

/// Tell the metrics system to report to statsd.
///
/// Configuring the client twice is an error, the first configuration stays active.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host did not resolve to any address");
    };
    tracing::info!(%addr, prefix, "reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    METRICS_CLIENT
        .set(MetricsClient {
            statsd_client: StatsdClient::from_sink(prefix, sink),
            tags,
        })
        .map_err(|_| anyhow::anyhow!("metrics client already configured"))
}

/// Invokes `f` with the statsd client, if one is configured.
///
/// For the most part the [`metric!`](crate::metric) macro should be used instead.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = METRICS_CLIENT.get() {
        f(client);
    }
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("pool.tasks.submitted") += 1, "function" => name);
/// metric!(gauge("caches.store.size") = bytes);
/// metric!(timer("pool.tasks.duration") = elapsed, "outcome" => "ok");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(
                client.statsd().$method($id, $value)
                    $(.with_tag($k, $v))*
            );
        })
    }};
}

/// Receives the approximate size of everything held by a [`CacheStore`](crate::caching::CacheStore).
///
/// The store calls this after every mutating operation.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Publishes the current approximate number of cached bytes.
    fn update_store(&self, total_bytes: usize);
}

/// A [`MetricsSink`] reporting the store size as a statsd gauge.
#[derive(Debug, Default)]
pub struct StatsdSink;

impl MetricsSink for StatsdSink {
    fn update_store(&self, total_bytes: usize) {
        metric!(gauge("caches.store.size") = total_bytes as u64);
    }
}
