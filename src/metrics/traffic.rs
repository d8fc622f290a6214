//! Per-proxy traffic accounting
//!
//! Byte counters keyed by `(proxy_id, application_id)`. Counts are approximate:
//! they are drained as deltas and handed to an external sink, which owns
//! persistence.

use dashmap::DashMap;
use serde::Serialize;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::counters::METRICS;

/// Traffic delta for one proxy/application pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficSample {
    pub proxy_id: u64,
    pub application_id: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Live counters for one proxy/application pair
#[derive(Debug, Default)]
pub struct TrafficCounter {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficCounter {
    #[inline]
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
        METRICS.bytes_rx(n);
    }

    #[inline]
    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
        METRICS.bytes_tx(n);
    }
}

/// Aggregates traffic for every proxied pair
#[derive(Debug, Default)]
pub struct TrafficAccounting {
    counters: DashMap<(u64, u64), Arc<TrafficCounter>>,
}

impl TrafficAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Shared counter for a pair, created on first use
    pub fn counter(&self, proxy_id: u64, application_id: u64) -> Arc<TrafficCounter> {
        self.counters
            .entry((proxy_id, application_id))
            .or_default()
            .clone()
    }

    /// Record an incremental delta
    pub fn record_traffic(&self, proxy_id: u64, application_id: u64, bytes_in: u64, bytes_out: u64) {
        let counter = self.counter(proxy_id, application_id);
        if bytes_in > 0 {
            counter.add_in(bytes_in);
        }
        if bytes_out > 0 {
            counter.add_out(bytes_out);
        }
    }

    /// Drain every non-zero counter into samples, resetting it to zero
    pub fn take_samples(&self) -> Vec<TrafficSample> {
        self.counters
            .iter()
            .filter_map(|entry| {
                let (proxy_id, application_id) = *entry.key();
                let bytes_in = entry.value().bytes_in.swap(0, Ordering::Relaxed);
                let bytes_out = entry.value().bytes_out.swap(0, Ordering::Relaxed);
                (bytes_in > 0 || bytes_out > 0).then_some(TrafficSample {
                    proxy_id,
                    application_id,
                    bytes_in,
                    bytes_out,
                })
            })
            .collect()
    }

    /// Stop tracking a proxy, returning whatever it had not flushed yet
    pub fn remove_proxy(&self, proxy_id: u64) -> Vec<TrafficSample> {
        let keys: Vec<(u64, u64)> = self
            .counters
            .iter()
            .filter(|entry| entry.key().0 == proxy_id)
            .map(|entry| *entry.key())
            .collect();

        keys.into_iter()
            .filter_map(|key| self.counters.remove(&key))
            .map(|((proxy_id, application_id), counter)| TrafficSample {
                proxy_id,
                application_id,
                bytes_in: counter.bytes_in.swap(0, Ordering::Relaxed),
                bytes_out: counter.bytes_out.swap(0, Ordering::Relaxed),
            })
            .filter(|s| s.bytes_in > 0 || s.bytes_out > 0)
            .collect()
    }

    /// Number of live (proxy, application) counters
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// External accounting collaborator
pub trait TrafficSink: Send + Sync + 'static {
    fn record_traffic(&self, samples: &[TrafficSample]);
}

/// Sink that only logs samples
#[derive(Debug, Default)]
pub struct LogSink;

impl TrafficSink for LogSink {
    fn record_traffic(&self, samples: &[TrafficSample]) {
        for sample in samples {
            info!(
                proxy_id = sample.proxy_id,
                application_id = sample.application_id,
                bytes_in = sample.bytes_in,
                bytes_out = sample.bytes_out,
                "Traffic"
            );
        }
    }
}

/// Flush samples into `sink` every `interval`, and once more on shutdown
pub fn spawn_flush_task(
    accounting: Arc<TrafficAccounting>,
    sink: Arc<dyn TrafficSink>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let stopping = tokio::select! {
                _ = ticker.tick() => false,
                _ = shutdown.cancelled() => true,
            };

            let samples = accounting.take_samples();
            if !samples.is_empty() {
                debug!(count = samples.len(), "Flushing traffic samples");
                sink.record_traffic(&samples);
            }

            if stopping {
                break;
            }
        }
    })
}

/// Stream wrapper counting bytes read as "in" and bytes written as "out"
pub struct CountingStream<S> {
    inner: S,
    counter: Arc<TrafficCounter>,
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, counter: Arc<TrafficCounter>) -> Self {
        Self { inner, counter }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountingStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.counter.add_in(n as u64);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountingStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.counter.add_out(*n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
