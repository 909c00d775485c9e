//! gRPC external scaler service.
//!
//! Implements the `ExternalScaler` interface the orchestrator polls:
//! `GetMetricSpec`, `GetMetrics`, `IsActive`, and the `StreamIsActive`
//! polling stream. The server is stateless across requests except
//! through the shared connection manager; metadata is resolved fresh on
//! every call.
//!
//! `GetMetrics` is the single source of truth for metric values —
//! `IsActive` runs the same path and compares the one returned value
//! against the target's activation threshold.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error};

use redscale_redis::{ConnectionManager, RedisConnectionManager, StoreError, StoreResult, evaluator};

use crate::metadata::{self, ScalerMetadata};
use crate::proto;
use crate::proto::external_scaler_server::{ExternalScaler, ExternalScalerServer};

/// Interval between activity re-evaluations on a stream.
const STREAM_TICK: Duration = Duration::from_secs(5);

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback type for executing the configured query on a connection.
pub type EvalFn<C> = Arc<dyn Fn(C, ScalerMetadata) -> BoxFuture<StoreResult<i64>> + Send + Sync>;

/// The external scaler service, generic over the connection type.
///
/// Production code uses the [`RedisScaler`] alias; the evaluator seam
/// also allows driving the protocol against an in-process fake.
pub struct ExternalScalerService<C> {
    connections: Arc<ConnectionManager<C>>,
    evaluate: EvalFn<C>,
}

/// The scaler service over real Redis connections.
pub type RedisScaler = ExternalScalerService<MultiplexedConnection>;

impl<C> Clone for ExternalScalerService<C> {
    fn clone(&self) -> Self {
        Self {
            connections: self.connections.clone(),
            evaluate: self.evaluate.clone(),
        }
    }
}

impl RedisScaler {
    /// Build the production service: multiplexed Redis connections,
    /// Lua script evaluation.
    pub fn new(connections: Arc<RedisConnectionManager>) -> Self {
        Self::with_evaluator(
            connections,
            Arc::new(|mut conn, metadata: ScalerMetadata| {
                Box::pin(async move {
                    let keys = evaluator::decode_string_list("keys", &metadata.keys)?;
                    let args = evaluator::decode_string_list("args", &metadata.args)?;
                    evaluator::run_script(&mut conn, &metadata.script, &keys, &args).await
                })
            }),
        )
    }

    /// Tonic service wrapper for mounting on a gRPC server.
    pub fn into_service(self) -> ExternalScalerServer<Self> {
        ExternalScalerServer::new(self)
    }
}

impl<C: Clone + Send + Sync + 'static> ExternalScalerService<C> {
    /// Build a service over a custom connection type and evaluator.
    pub fn with_evaluator(connections: Arc<ConnectionManager<C>>, evaluate: EvalFn<C>) -> Self {
        Self {
            connections,
            evaluate,
        }
    }

    /// One activity check: run the metrics path and compare the single
    /// returned value against the activation threshold. Strictly
    /// greater-than — a value equal to the threshold is not active.
    async fn check_active(&self, scaled_object: &proto::ScaledObjectRef) -> Result<bool, Status> {
        let metadata = resolve_or_log(scaled_object, "IsActive")?;

        let response = self
            .get_metrics(Request::new(proto::GetMetricsRequest {
                scaled_object_ref: Some(scaled_object.clone()),
                metric_name: String::new(),
            }))
            .await?;

        let values = response.into_inner().metric_values;
        if values.len() != 1 {
            error!(
                scaled_object = %metadata.full_name,
                count = values.len(),
                "GetMetrics must return exactly one value"
            );
            return Err(Status::internal("GetMetrics must return exactly one value"));
        }

        Ok(values[0].metric_value > metadata.activation_value)
    }
}

#[tonic::async_trait]
impl<C: Clone + Send + Sync + 'static> ExternalScaler for ExternalScalerService<C> {
    async fn is_active(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<proto::IsActiveResponse>, Status> {
        let scaled_object = request.into_inner();
        let result = self.check_active(&scaled_object).await?;

        Ok(Response::new(proto::IsActiveResponse { result }))
    }

    type StreamIsActiveStream = ReceiverStream<Result<proto::IsActiveResponse, Status>>;

    async fn stream_is_active(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<Self::StreamIsActiveStream>, Status> {
        let scaled_object = request.into_inner();
        // Fail the stream up front when the metadata cannot resolve.
        let metadata = resolve_or_log(&scaled_object, "StreamIsActive")?;

        let (tx, rx) = mpsc::channel(1);
        let scaler = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Cancellation wins over a due tick.
                    biased;
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(STREAM_TICK) => {}
                }

                match scaler.check_active(&scaled_object).await {
                    Ok(active) => {
                        let response = proto::IsActiveResponse { result: active };
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    Err(status) => {
                        error!(
                            scaled_object = %metadata.full_name,
                            error = %status,
                            "activity check failed, terminating stream"
                        );
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_metric_spec(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<proto::GetMetricSpecResponse>, Status> {
        let scaled_object = request.into_inner();
        let metadata = resolve_or_log(&scaled_object, "GetMetricSpec")?;

        Ok(Response::new(proto::GetMetricSpecResponse {
            metric_specs: vec![proto::MetricSpec {
                metric_name: metadata.metric_name,
                target_size: metadata.target_value,
            }],
        }))
    }

    async fn get_metrics(
        &self,
        request: Request<proto::GetMetricsRequest>,
    ) -> Result<Response<proto::GetMetricsResponse>, Status> {
        let req = request.into_inner();
        let scaled_object = req
            .scaled_object_ref
            .ok_or_else(|| Status::invalid_argument("scaledObjectRef is required"))?;
        let metadata = resolve_or_log(&scaled_object, "GetMetrics")?;

        let conn = self
            .connections
            .acquire(&metadata.cache_key(), &metadata.connect_options())
            .await
            .map_err(|e| {
                error!(
                    method = "GetMetrics",
                    scaled_object = %metadata.full_name,
                    error = %e,
                    "error acquiring store connection"
                );
                store_status(e)
            })?;

        let value = (self.evaluate)(conn, metadata.clone()).await.map_err(|e| {
            error!(
                method = "GetMetrics",
                scaled_object = %metadata.full_name,
                error = %e,
                "error evaluating metric"
            );
            store_status(e)
        })?;

        debug!(
            scaled_object = %metadata.full_name,
            metric_name = %req.metric_name,
            metric_value = value,
            "got metric value"
        );

        Ok(Response::new(proto::GetMetricsResponse {
            metric_values: vec![proto::MetricValue {
                metric_name: req.metric_name,
                metric_value: value,
            }],
        }))
    }
}

fn resolve_or_log(
    scaled_object: &proto::ScaledObjectRef,
    method: &'static str,
) -> Result<ScalerMetadata, Status> {
    metadata::resolve(scaled_object).map_err(|e| {
        let full_name = format!("{}/{}", scaled_object.namespace, scaled_object.name);
        error!(method, scaled_object = %full_name, error = %e, "error resolving metadata");
        Status::invalid_argument(e.to_string())
    })
}

/// Map a store error onto a gRPC status: configuration problems are the
/// caller's, everything else is internal.
fn store_status(err: StoreError) -> Status {
    if err.is_configuration() {
        Status::invalid_argument(err.to_string())
    } else {
        Status::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_stream::StreamExt;

    use super::*;

    /// Evaluator understanding scripts of the form `return N`; anything
    /// else fails like a script error would.
    fn script_evaluator(calls: Arc<AtomicUsize>) -> EvalFn<()> {
        Arc::new(move |_, metadata: ScalerMetadata| {
            let calls = calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                metadata
                    .script
                    .trim()
                    .strip_prefix("return ")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        StoreError::Redis(redis::RedisError::from((
                            redis::ErrorKind::ResponseError,
                            "script failed",
                        )))
                    })
            })
        })
    }

    struct TestHarness {
        service: ExternalScalerService<()>,
        connects: Arc<AtomicUsize>,
        evals: Arc<AtomicUsize>,
    }

    fn harness() -> TestHarness {
        let connects = Arc::new(AtomicUsize::new(0));
        let evals = Arc::new(AtomicUsize::new(0));

        let counter = connects.clone();
        let manager = ConnectionManager::with_connector(Box::new(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        TestHarness {
            service: ExternalScalerService::with_evaluator(
                Arc::new(manager),
                script_evaluator(evals.clone()),
            ),
            connects,
            evals,
        }
    }

    fn scaled_object(script: &str, activation_value: i64) -> proto::ScaledObjectRef {
        let mut fields = HashMap::new();
        fields.insert("host".to_string(), "localhost".to_string());
        fields.insert("script".to_string(), script.to_string());
        fields.insert("activationValue".to_string(), activation_value.to_string());
        proto::ScaledObjectRef {
            name: "api".to_string(),
            namespace: "default".to_string(),
            scaler_metadata: fields,
        }
    }

    #[tokio::test]
    async fn metric_spec_reports_name_and_target() {
        let h = harness();
        let mut scaled_object = scaled_object("return 1", 0);
        scaled_object
            .scaler_metadata
            .insert("targetValue".to_string(), "50".to_string());

        let response = h
            .service
            .get_metric_spec(Request::new(scaled_object))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.metric_specs.len(), 1);
        assert_eq!(response.metric_specs[0].metric_name, "redis-default-api");
        assert_eq!(response.metric_specs[0].target_size, 50);
    }

    #[tokio::test]
    async fn metric_spec_defaults_target_to_five() {
        let h = harness();
        let response = h
            .service
            .get_metric_spec(Request::new(scaled_object("return 1", 0)))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.metric_specs[0].target_size, 5);
    }

    #[tokio::test]
    async fn missing_script_fails_before_any_connection() {
        let h = harness();
        let scaled_object = proto::ScaledObjectRef {
            name: "api".to_string(),
            namespace: "default".to_string(),
            scaler_metadata: HashMap::new(),
        };

        let err = h
            .service
            .get_metric_spec(Request::new(scaled_object.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = h
            .service
            .get_metrics(Request::new(proto::GetMetricsRequest {
                scaled_object_ref: Some(scaled_object),
                metric_name: "m".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        assert_eq!(h.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn get_metrics_returns_one_tagged_value() {
        let h = harness();
        let response = h
            .service
            .get_metrics(Request::new(proto::GetMetricsRequest {
                scaled_object_ref: Some(scaled_object("return 10", 5)),
                metric_name: "queue-depth".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.metric_values.len(), 1);
        assert_eq!(response.metric_values[0].metric_name, "queue-depth");
        assert_eq!(response.metric_values[0].metric_value, 10);
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn active_above_activation_value() {
        let h = harness();
        let response = h
            .service
            .is_active(Request::new(scaled_object("return 10", 5)))
            .await
            .unwrap()
            .into_inner();
        assert!(response.result);
    }

    #[tokio::test]
    async fn inactive_at_activation_value() {
        let h = harness();
        let response = h
            .service
            .is_active(Request::new(scaled_object("return 5", 5)))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.result);
    }

    #[tokio::test]
    async fn script_failure_is_internal() {
        let h = harness();
        let err = h
            .service
            .is_active(Request::new(scaled_object("boom", 0)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_ticks_every_five_seconds_until_cancelled() {
        let h = harness();
        let start = tokio::time::Instant::now();

        let mut stream = h
            .service
            .stream_is_active(Request::new(scaled_object("return 10", 5)))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.result);
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.result);
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        // Cancel inside the third tick: the loop must stop evaluating.
        drop(stream);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(h.evals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_terminates_on_evaluation_error() {
        let h = harness();
        let mut stream = h
            .service
            .stream_is_active(Request::new(scaled_object("boom", 0)))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap();
        assert!(first.is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_rejects_unresolvable_metadata() {
        let h = harness();
        let err = h
            .service
            .stream_is_active(Request::new(proto::ScaledObjectRef {
                name: "api".to_string(),
                namespace: "default".to_string(),
                scaler_metadata: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
