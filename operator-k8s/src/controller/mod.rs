use std::fmt::Debug;
use std::iter::repeat;
use std::ops::Mul;
use std::sync::Arc;

use async_trait::async_trait;
use clippy_utilities::NumericCast;
use futures::future::BoxFuture;
use futures::{Future, FutureExt, StreamExt};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use prometheus::{Error, Histogram, HistogramOpts, HistogramTimer, IntCounterVec, Opts, Registry};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::consts::{DEFAULT_REQUEUE_DURATION, ERROR_REQUEUE_DURATION, EVENT_REPORTER};

/// `MysqlBackup` controller
pub(crate) mod backup;
/// Backup scheduler
pub(crate) mod backup_cron;
/// `MysqlCluster` controller
pub(crate) mod cluster;
/// Mysql pod initialization
pub(crate) mod node;
/// Periodic orchestrator reconcile
pub(crate) mod topology;

/// Metrics of a reconcile loop
pub(crate) trait Metrics {
    /// Register metrics
    fn register(&self, registry: &Registry) -> Result<(), Error>;

    /// Record duration
    fn record_duration(&self) -> HistogramTimer;

    /// Increment failed count
    fn record_failed_count(&self, labels: &[&str]);
}

/// Errors that can be labeled in the failed count metric
pub(crate) trait MetricsLabeled {
    /// The label values
    fn labels(&self) -> Vec<&str>;
}

impl MetricsLabeled for kube::Error {
    fn labels(&self) -> Vec<&str> {
        #[allow(clippy::wildcard_enum_match_arm)] // the reason is enough
        match *self {
            Self::Api(_) => vec!["api error"],
            Self::Service(_) => vec!["service error"],
            Self::FromUtf8(_) | Self::SerdeError(_) => vec!["encode/decode error"],
            Self::Auth(_) => vec!["authorization error"],
            Self::HyperError(_) | Self::HttpError(_) => vec!["http error"],
            _ => vec!["unknown"],
        }
    }
}

/// Returns true if the kube error is a 404
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(*err, kube::Error::Api(ref resp) if resp.code == 404)
}

/// Publish an event on `obj`, a failure is only logged
pub(crate) async fn publish_event<K>(
    kube_client: &Client,
    obj: &K,
    type_: EventType,
    reason: &str,
    note: String,
) where
    K: Resource<DynamicType = ()>,
{
    let reporter = Reporter {
        controller: EVENT_REPORTER.to_owned(),
        instance: None,
    };
    let recorder = Recorder::new(kube_client.clone(), reporter, obj.object_ref(&()));
    let event = Event {
        type_,
        reason: reason.to_owned(),
        note: Some(note),
        action: reason.to_owned(),
        secondary: None,
    };
    if let Err(err) = recorder.publish(event).await {
        warn!("failed to publish event {reason}: {err}");
    }
}

/// A reconciler driven by `kube::runtime::Controller`
#[async_trait]
pub(crate) trait Controller<R>: Sized + Send + Sync + 'static
where
    R: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// The reconcile error
    type Error: std::error::Error + MetricsLabeled + Send + Sync + 'static;
    /// The metrics of this controller
    type Metrics: Metrics + Send + Sync;

    /// The metrics
    fn metrics(&self) -> &Self::Metrics;

    /// Reconcile a resource once
    async fn reconcile_once(&self, resource: &Arc<R>) -> Result<(), Self::Error>;

    /// Handle a reconcile error
    fn handle_error(&self, resource: &Arc<R>, err: &Self::Error);

    /// The reconcile function used by `kube::runtime::Controller`
    fn reconcile(resource: Arc<R>, controller: Arc<Self>) -> BoxFuture<'static, Result<Action, Self::Error>> {
        async move {
            let _timer = controller.metrics().record_duration();
            controller.reconcile_once(&resource).await?;
            Ok(Action::requeue(DEFAULT_REQUEUE_DURATION))
        }
        .boxed()
    }

    /// The error policy used by `kube::runtime::Controller`
    fn on_error(resource: Arc<R>, err: &Self::Error, controller: Arc<Self>) -> Action {
        controller.metrics().record_failed_count(&err.labels());
        controller.handle_error(&resource, err);
        Action::requeue(ERROR_REQUEUE_DURATION)
    }

    /// Run the controller until `shutdown` resolves
    async fn run_with_shutdown<F>(
        controller: Arc<Self>,
        runtime: kube::runtime::Controller<R>,
        shutdown: F,
    ) where
        F: Future<Output = ()> + Send + Sync + 'static,
    {
        runtime
            .graceful_shutdown_on(shutdown)
            .run(Self::reconcile, Self::on_error, controller)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _action)) => debug!("reconciled {obj}"),
                    Err(err) => warn!("reconcile failed: {err}"),
                }
            })
            .await;
    }
}

/// Reconcile metrics of a controller
pub(crate) struct ControllerMetrics {
    /// Reconcile duration histogram
    reconcile_duration: Histogram,
    /// Reconcile failed count
    reconcile_failed_count: IntCounterVec,
}

impl Metrics for ControllerMetrics {
    fn register(&self, registry: &Registry) -> Result<(), Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.reconcile_failed_count.clone()))
    }

    fn record_duration(&self) -> HistogramTimer {
        self.reconcile_duration.start_timer()
    }

    fn record_failed_count(&self, labels: &[&str]) {
        self.reconcile_failed_count.with_label_values(labels).inc();
    }
}

impl ControllerMetrics {
    /// Create the metrics of the controller `name`, e.g. `mysqlcluster`
    #[allow(clippy::expect_used)] // the metric names are static and valid
    pub(crate) fn new(name: &str) -> Self {
        Self {
            reconcile_duration: Histogram::with_opts(
                HistogramOpts::new(
                    format!("{name}_reconcile_duration_seconds"),
                    format!("Duration of {name} reconcile loop in seconds"),
                )
                .buckets(exponential_time_bucket(0.1, 2.0, 10)),
            )
            .expect("failed to create reconcile duration histogram"),
            reconcile_failed_count: IntCounterVec::new(
                Opts::new(
                    format!("{name}_reconcile_failed_count"),
                    format!("Number of failed times the {name} reconcile loop has run"),
                ),
                &["reason"],
            )
            .expect("failed to create reconcile failed counter"),
        }
    }
}

/// Returns a vector of time buckets for the reconcile duration histogram.
fn exponential_time_bucket(start: f64, factor: f64, count: usize) -> Vec<f64> {
    repeat(factor)
        .enumerate()
        .take(count)
        .map(|(i, f)| start.mul(f.powi(i.numeric_cast())))
        .collect::<Vec<_>>()
}
