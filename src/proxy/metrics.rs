//! Per-connection traffic metrics
//!
//! Every relayed byte and request is counted twice: on the upstream's
//! cumulative counters, and in a delta map that the aggregator flushes to
//! the commander.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use hyper::body::{Body, Frame, SizeHint};
use hyper::StatusCode;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant, Sleep};
use tracing::{debug, error, info, instrument};

use crate::commander::Commander;
use crate::error::{Result, RotorError};
use crate::models::{ProxyMetricsAdd, UpstreamProxy};
use crate::proxy::rotation::ConnectionGuard;
use crate::proxy::sockets::TunnelSocketSet;

/// 2xx and 3xx answers count as valid requests
pub fn is_valid_status(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

/// Collects counter deltas until the next flush
pub struct MetricsAggregator {
    commander: Arc<dyn Commander>,
    pending: DashMap<String, ProxyMetricsAdd>,
    flush_interval: Duration,
}

impl MetricsAggregator {
    pub fn new(commander: Arc<dyn Commander>, flush_interval: Duration) -> Self {
        Self {
            commander,
            pending: DashMap::new(),
            flush_interval,
        }
    }

    /// Metrics handle for one connection through `proxy`
    pub fn attach(self: &Arc<Self>, proxy: Arc<UpstreamProxy>) -> ConnectionMetrics {
        ConnectionMetrics {
            proxy,
            aggregator: self.clone(),
        }
    }

    fn record<F>(&self, proxy: &UpstreamProxy, update: F)
    where
        F: FnOnce(&mut ProxyMetricsAdd),
    {
        let mut entry = self
            .pending
            .entry(proxy.id.clone())
            .or_insert_with(|| ProxyMetricsAdd::empty(proxy));
        update(entry.value_mut());
    }

    /// Take every non-empty delta collected so far
    pub fn drain(&self) -> Vec<ProxyMetricsAdd> {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let now = Utc::now();

        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|(_, delta)| delta))
            .filter(|delta| !delta.is_empty())
            .map(|mut delta| {
                delta.reported_at = now;
                delta
            })
            .collect()
    }

    /// Send pending deltas to the commander
    ///
    /// A failed send puts the deltas back so the next flush retries them.
    pub async fn flush(&self) -> Result<usize> {
        let deltas = self.drain();
        if deltas.is_empty() {
            return Ok(0);
        }

        let count = deltas.len();
        if let Err(e) = self.commander.add_proxies_metrics(deltas.clone()).await {
            for delta in deltas {
                self.pending
                    .entry(delta.id.clone())
                    .and_modify(|pending| merge(pending, &delta))
                    .or_insert(delta);
            }
            return Err(e);
        }

        debug!(count, "Flushed proxy metrics");
        Ok(count)
    }

    /// Flush periodically until shutdown, then flush once more
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting metrics aggregator (interval: {}ms)",
            self.flush_interval.as_millis()
        );

        let mut ticker = interval(self.flush_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("Metrics flush failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.flush().await {
            error!("Final metrics flush failed: {}", e);
        }
        info!("Metrics aggregator shutting down");
    }
}

fn merge(into: &mut ProxyMetricsAdd, from: &ProxyMetricsAdd) {
    into.requests += from.requests;
    into.requests_valid += from.requests_valid;
    into.requests_invalid += from.requests_invalid;
    into.bytes_received += from.bytes_received;
    into.bytes_sent += from.bytes_sent;
}

/// Counters of one connection through one upstream
#[derive(Clone)]
pub struct ConnectionMetrics {
    proxy: Arc<UpstreamProxy>,
    aggregator: Arc<MetricsAggregator>,
}

impl ConnectionMetrics {
    pub fn proxy(&self) -> &Arc<UpstreamProxy> {
        &self.proxy
    }

    /// Bytes written towards the upstream
    pub fn add_sent(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.proxy.counters().add_sent(n);
        self.aggregator.record(&self.proxy, |d| d.bytes_sent += n);
    }

    /// Bytes read from the upstream
    pub fn add_received(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.proxy.counters().add_received(n);
        self.aggregator.record(&self.proxy, |d| d.bytes_received += n);
    }

    fn add_request(&self, valid: bool) {
        self.proxy.counters().add_request(valid);
        self.aggregator.record(&self.proxy, |d| {
            d.requests += 1;
            if valid {
                d.requests_valid += 1;
            } else {
                d.requests_invalid += 1;
            }
        });
    }

    pub fn record_response(&self, status: StatusCode) {
        self.add_request(is_valid_status(status));
    }

    /// A request that never got an answer (transport error, timeout)
    pub fn record_failure(&self) {
        self.add_request(false);
    }

    /// A tunnel counts as one request, valid when it closed cleanly
    pub fn record_tunnel(&self, clean: bool) {
        self.add_request(clean);
    }
}

impl std::fmt::Debug for ConnectionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMetrics")
            .field("proxy_id", &self.proxy.id)
            .finish()
    }
}

/// Which way a metered payload flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream
    Sent,
    /// Upstream to client
    Received,
}

/// Error type of metered bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct OutcomeInner {
    metrics: ConnectionMetrics,
    /// Upstream status once the head arrived, 0 before
    status: AtomicU16,
    settled: AtomicBool,
}

impl OutcomeInner {
    fn settle(&self, valid: Option<bool>) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        let valid = valid.unwrap_or_else(|| {
            StatusCode::from_u16(self.status.load(Ordering::Acquire))
                .map(is_valid_status)
                .unwrap_or(false)
        });
        self.metrics.add_request(valid);
    }
}

impl Drop for OutcomeInner {
    fn drop(&mut self) {
        self.settle(None);
    }
}

/// One forwarded request, counted exactly once
///
/// The status only decides validity once the response body ended. A body
/// that fails or stalls on the way turns the request invalid.
#[derive(Clone)]
pub struct RequestOutcome {
    inner: Arc<OutcomeInner>,
}

impl RequestOutcome {
    pub fn new(metrics: ConnectionMetrics) -> Self {
        Self {
            inner: Arc::new(OutcomeInner {
                metrics,
                status: AtomicU16::new(0),
                settled: AtomicBool::new(false),
            }),
        }
    }

    /// Remember the upstream status; counted when the body ends
    pub fn respond(&self, status: StatusCode) {
        self.inner.status.store(status.as_u16(), Ordering::Release);
    }

    /// Count the request invalid unless already counted
    pub fn fail(&self) {
        self.inner.settle(Some(false));
    }

    /// Count the request by its status unless already counted
    pub fn finish(&self) {
        self.inner.settle(None);
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }
}

pin_project! {
    /// Body wrapper counting data frames as they are polled
    ///
    /// Keeps the request's sockets and connection slot alive until the body
    /// is finished or dropped. With an idle timeout, a body that produces no
    /// frame for that long fails, closes the held sockets and fails the
    /// request.
    #[project = MeteredBodyProj]
    pub struct MeteredBody<B> {
        #[pin]
        inner: B,
        metrics: ConnectionMetrics,
        direction: Direction,
        outcome: Option<RequestOutcome>,
        idle: Option<Duration>,
        deadline: Option<Pin<Box<Sleep>>>,
        sockets: Option<TunnelSocketSet>,
        guard: Option<ConnectionGuard>,
    }
}

impl<B> MeteredBody<B> {
    pub fn new(inner: B, metrics: ConnectionMetrics, direction: Direction) -> Self {
        Self {
            inner,
            metrics,
            direction,
            outcome: None,
            idle: None,
            deadline: None,
            sockets: None,
            guard: None,
        }
    }

    pub fn holding(mut self, sockets: TunnelSocketSet, guard: Option<ConnectionGuard>) -> Self {
        self.sockets = Some(sockets);
        self.guard = guard;
        self
    }

    /// Tie the body to the request it belongs to. A received body settles
    /// the request when it ends.
    pub fn settling(mut self, outcome: RequestOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Fail the body after `idle` without a frame
    pub fn idle_after(mut self, idle: Duration) -> Self {
        self.idle = Some(idle);
        self.deadline = Some(Box::pin(sleep(idle)));
        self
    }
}

fn release<B>(this: &mut MeteredBodyProj<'_, B>, close: bool) {
    this.deadline.take();
    this.guard.take();
    if let Some(sockets) = this.sockets.take() {
        if close {
            sockets.close_all();
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        match this.inner.as_mut().poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    let n = data.len() as u64;
                    match this.direction {
                        Direction::Sent => this.metrics.add_sent(n),
                        Direction::Received => this.metrics.add_received(n),
                    }
                }
                if let (Some(idle), Some(deadline)) = (*this.idle, this.deadline.as_mut()) {
                    deadline.as_mut().reset(Instant::now() + idle);
                }
                if *this.direction == Direction::Received && this.inner.is_end_stream() {
                    if let Some(outcome) = this.outcome.take() {
                        outcome.finish();
                    }
                    release(&mut this, false);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(outcome) = this.outcome.take() {
                    outcome.fail();
                }
                release(&mut this, true);
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                if *this.direction == Direction::Received {
                    if let Some(outcome) = this.outcome.take() {
                        outcome.finish();
                    }
                }
                release(&mut this, false);
                Poll::Ready(None)
            }
            Poll::Pending => {
                let expired = match this.deadline.as_mut() {
                    Some(deadline) => deadline.as_mut().poll(cx).is_ready(),
                    None => false,
                };
                if !expired {
                    return Poll::Pending;
                }

                debug!(
                    proxy_id = %this.metrics.proxy().id,
                    direction = ?this.direction,
                    "Body idle timeout"
                );
                if let Some(outcome) = this.outcome.take() {
                    outcome.fail();
                }
                release(&mut this, true);
                let error: BoxError = Box::new(RotorError::Timeout);
                Poll::Ready(Some(Err(error)))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Stream wrapper counting bytes written to and read from an upstream
    pub struct MeteredStream<S> {
        #[pin]
        inner: S,
        metrics: ConnectionMetrics,
    }
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, metrics: ConnectionMetrics) -> Self {
        Self { inner, metrics }
    }
}

impl<S: AsyncRead> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.metrics
                .add_received((buf.filled().len() - before) as u64);
        }
        result
    }
}

impl<S: AsyncWrite> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.metrics.add_sent(*n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
