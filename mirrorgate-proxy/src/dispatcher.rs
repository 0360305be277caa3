//! Request dispatcher: serve from the baseline, mirror a sample to the candidate.
//!
//! # Request Flow
//!
//! ```text
//! Request<Body> ──► buffer body ──► baseline round trip
//!                                        │
//!                     ┌──────────────────┴──────────────────┐
//!                  failure                               success
//!                     │                                     │
//!              502 to client                   baseline response to client
//!              (no mirroring)                               │
//!                                           guardrail.should_mirror()?
//!                                           sampler (mirror_fraction)?
//!                                           in-flight permit available?
//!                                                           │
//!                                          spawn detached mirror task
//!                                                           │
//!                                     candidate round trip ► diff ► observe_pair
//! ```
//!
//! The mirror task runs on the dispatcher's [`TaskTracker`], outside the
//! client's request future: a client disconnect cancels the baseline call
//! but never a mirror already spawned. It carries its own timeout.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode};
use mirrorgate_core::config::{ConfigError, MirrorConfig};
use mirrorgate_core::differ::NormalizationRules;
use mirrorgate_core::guardrail::{Guardrail, MirrorSample, PairOutcome};
use mirrorgate_core::telemetry::{MirrorMetrics, Target};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::ProxyError;
use crate::upstream::{ForwardRequest, ProxyTarget, UpstreamClient, UpstreamResponse};

/// `mirror_dropped_total` reason when the in-flight limit is reached.
pub const DROP_SATURATED: &str = "saturated";

/// Route label for metrics and guardrail diagnostics: `"<METHOD> <path>"`.
pub fn route_label<B>(req: &Request<B>) -> String {
    format!("{} {}", req.method(), req.uri().path())
}

// ─────────────────────────────────────────────────────────────────────────────
// Sampling
// ─────────────────────────────────────────────────────────────────────────────

/// Independent Bernoulli draw per request.
#[derive(Debug, Clone, Copy)]
pub struct MirrorSampler {
    fraction: f64,
}

impl MirrorSampler {
    pub fn new(fraction: f64) -> Self {
        Self { fraction }
    }

    /// A fraction of zero or below never samples; one or above always does.
    pub fn sample(&self) -> bool {
        if self.fraction <= 0.0 {
            return false;
        }
        rand::rng().random::<f64>() < self.fraction
    }
}

/// Keeps `mirror_in_flight` accurate even if a mirror task panics.
struct InFlightGuard {
    metrics: Arc<MirrorMetrics>,
}

impl InFlightGuard {
    fn new(metrics: Arc<MirrorMetrics>) -> Self {
        metrics.mirror_started();
        Self { metrics }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.mirror_finished();
    }
}

/// Baseline facts the mirror task needs after the client has its response.
struct BaselineOutcome {
    status: StatusCode,
    latency: Duration,
    body: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

struct DispatcherInner {
    client: UpstreamClient,
    baseline: ProxyTarget,
    candidate: ProxyTarget,
    guardrail: Arc<Guardrail>,
    metrics: Arc<MirrorMetrics>,
    rules: NormalizationRules,
    sampler: MirrorSampler,
    baseline_timeout: Duration,
    mirror_timeout: Duration,
    /// `None` when the in-flight limit is disabled.
    mirror_permits: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
}

/// Catch-all handler for proxied traffic.
///
/// Cheap to clone; all clones share the client, guardrail and task tracker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Build a dispatcher from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if either upstream URL is malformed.
    pub fn new(
        config: &MirrorConfig,
        client: UpstreamClient,
        guardrail: Arc<Guardrail>,
        metrics: Arc<MirrorMetrics>,
    ) -> Result<Self, ConfigError> {
        let baseline = ProxyTarget::parse(Target::Baseline, &config.baseline_url)?;
        let candidate = ProxyTarget::parse(Target::Candidate, &config.candidate_url)?;

        let mirror_permits = match config.mirror_max_in_flight {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                client,
                baseline,
                candidate,
                guardrail,
                metrics,
                rules: NormalizationRules::default(),
                sampler: MirrorSampler::new(config.mirror_fraction),
                baseline_timeout: config.baseline_timeout,
                mirror_timeout: config.mirror_timeout,
                mirror_permits,
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Tracker owning every spawned mirror task. Used to drain on shutdown.
    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Serve one request from the baseline, then maybe mirror it.
    ///
    /// Mirror admission runs only after the baseline response has been fully
    /// assembled and never blocks, so the client observes the baseline
    /// outcome unchanged whether or not the request is mirrored.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let route = route_label(&req);
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let err = ProxyError::RequestBody(e.to_string());
                warn!(route = %route, error = %err, "Failed to read request body");
                return err.to_response().map(Body::new);
            }
        };
        let forward = ForwardRequest::from_parts(&parts, body);

        let start = Instant::now();
        let result = self
            .inner
            .client
            .send(&self.inner.baseline, &forward, self.inner.baseline_timeout)
            .await;
        let latency = match &result {
            Ok(response) => response.latency,
            Err(_) => start.elapsed(),
        };
        self.inner
            .metrics
            .record_upstream(&route, Target::Baseline, latency);

        let UpstreamResponse {
            status,
            headers,
            body,
            latency,
        } = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    route = %route,
                    target = %self.inner.baseline,
                    error = %err,
                    "Baseline request failed"
                );
                return err.to_response().map(Body::new);
            }
        };

        let mut response = Response::new(Body::from(body.clone()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        // The response is final from here on. Admission below only takes the
        // guardrail lock and a non-blocking permit before spawning, so it
        // neither alters the response nor holds it on candidate I/O.
        self.maybe_mirror(
            route,
            forward,
            BaselineOutcome {
                status,
                latency,
                body,
            },
        );

        response
    }

    /// Admission: guardrail first, then the sampler, then an in-flight permit.
    fn maybe_mirror(&self, route: String, forward: ForwardRequest, baseline: BaselineOutcome) {
        if !self.inner.guardrail.should_mirror() {
            return;
        }
        if !self.inner.sampler.sample() {
            return;
        }

        let permit = match self.try_acquire_permit() {
            Ok(permit) => permit,
            Err(()) => {
                self.inner.metrics.record_dropped(DROP_SATURATED);
                debug!(route = %route, "Mirror dropped, in-flight limit reached");
                return;
            }
        };

        let in_flight = InFlightGuard::new(self.inner.metrics.clone());
        let inner = self.inner.clone();
        let span = info_span!(parent: None, "mirror", route = %route);
        self.inner.tracker.spawn(
            async move {
                let _permit = permit;
                let _in_flight = in_flight;
                inner.mirror_to_candidate(route, forward, baseline).await;
            }
            .instrument(span),
        );
    }

    fn try_acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.inner.mirror_permits {
            None => Ok(None),
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| ()),
        }
    }
}

impl DispatcherInner {
    async fn mirror_to_candidate(
        &self,
        route: String,
        forward: ForwardRequest,
        baseline: BaselineOutcome,
    ) {
        let start = Instant::now();
        let result = self
            .client
            .send(&self.candidate, &forward, self.mirror_timeout)
            .await;

        let (candidate_latency, candidate_error, candidate_body) = match result {
            Ok(response) => (
                response.latency,
                response.status.as_u16() >= 500,
                response.body,
            ),
            Err(err) => {
                warn!(
                    route = %route,
                    target = %self.candidate,
                    error = %err,
                    "Candidate request failed"
                );
                (start.elapsed(), true, Bytes::new())
            }
        };
        self.metrics
            .record_upstream(&route, Target::Candidate, candidate_latency);

        if !baseline.body.is_empty() && !candidate_body.is_empty() {
            match self.rules.compare(&baseline.body, &candidate_body) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(route = %route, "Candidate response differs from baseline");
                    self.metrics.record_mismatch(&route);
                }
                Err(e) => {
                    warn!(route = %route, error = %e, "Diff failed");
                    self.metrics.record_diff_error(&route);
                }
            }
        }

        let outcome = self.guardrail.observe_pair(MirrorSample {
            route,
            baseline_latency: baseline.latency,
            candidate_latency,
            baseline_error: baseline.status.as_u16() >= 500,
            candidate_error,
        });
        if let PairOutcome::Breach { streak } = outcome {
            debug!(streak = streak, "Guardrail breach recorded");
        }
    }
}

impl Service<Request<Body>> for Dispatcher {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move { Ok(dispatcher.handle(req).await) })
    }
}
