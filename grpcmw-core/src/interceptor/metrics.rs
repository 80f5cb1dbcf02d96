//! Call metrics: the [`MetricsSink`] capability, an in-memory
//! [`MetricsRegistry`] implementing it, and the stage feeding it.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{
    FinishGuard, Interceptor, StreamingFunc, StreamingRequest, UnaryFunc, UnaryRequest,
    observe_stream,
};
use crate::context::{CallContext, Role};
use crate::descriptor::StreamKind;
use crate::error::{Code, SinkError};

/// One finished call, as reported to a sink.
#[derive(Debug, Clone, Copy)]
pub struct CallRecord<'a> {
    pub service: &'a str,
    pub method: &'a str,
    pub role: Role,
    pub kind: StreamKind,
    pub code: Code,
    pub duration: Duration,
}

/// Destination for call records.
///
/// Failures (returned errors and panics alike) are logged by the metrics
/// stage and never affect the call being recorded.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, record: &CallRecord<'_>) -> Result<(), SinkError>;
}

/// Aggregated counters for one method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodStats {
    pub request_count: u64,
    pub error_count: u64,
    /// Calls per status code name.
    pub codes: BTreeMap<String, u64>,
    pub total_latency_us: u64,
    pub max_latency_us: u64,
}

impl MethodStats {
    pub fn mean_latency(&self) -> Duration {
        if self.request_count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_us / self.request_count)
    }
}

/// Thread-safe per-method counters and latency totals.
///
/// Recording is a single mutex acquisition; methods are keyed by
/// `/<service>/<method>`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    methods: Mutex<HashMap<String, MethodStats>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, full_method: &str) -> Option<MethodStats> {
        self.methods.lock().get(full_method).cloned()
    }

    /// Copy of everything recorded so far, sorted by method.
    pub fn snapshot(&self) -> BTreeMap<String, MethodStats> {
        self.methods
            .lock()
            .iter()
            .map(|(method, stats)| (method.clone(), stats.clone()))
            .collect()
    }

    pub fn reset(&self) {
        self.methods.lock().clear();
    }
}

impl MetricsSink for MetricsRegistry {
    fn record(&self, record: &CallRecord<'_>) -> Result<(), SinkError> {
        let key = format!("/{}/{}", record.service, record.method);
        let micros = record.duration.as_micros().min(u128::from(u64::MAX)) as u64;

        let mut methods = self.methods.lock();
        let stats = methods.entry(key).or_default();
        stats.request_count = stats.request_count.saturating_add(1);
        if record.code != Code::Ok {
            stats.error_count = stats.error_count.saturating_add(1);
        }
        *stats.codes.entry(record.code.as_str().to_owned()).or_default() += 1;
        stats.total_latency_us = stats.total_latency_us.saturating_add(micros);
        stats.max_latency_us = stats.max_latency_us.max(micros);
        Ok(())
    }
}

/// Reports `(method, duration, outcome)` for every call to a sink.
#[derive(Clone)]
pub struct MetricsInterceptor {
    sink: Arc<dyn MetricsSink>,
}

impl MetricsInterceptor {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl std::fmt::Debug for MetricsInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsInterceptor").finish_non_exhaustive()
    }
}

fn report(sink: &dyn MetricsSink, ctx: &CallContext, code: Code, duration: Duration) {
    let record = CallRecord {
        service: ctx.service(),
        method: ctx.method(),
        role: ctx.role(),
        kind: ctx.kind(),
        code,
        duration,
    };
    match catch_unwind(AssertUnwindSafe(|| sink.record(&record))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(
                grpc.service = ctx.service(),
                grpc.method = ctx.method(),
                error = %err,
                "metrics sink failed to record call"
            );
        }
        Err(_) => {
            tracing::error!(
                grpc.service = ctx.service(),
                grpc.method = ctx.method(),
                "metrics sink panicked while recording call"
            );
        }
    }
}

/// Reports the call once it finishes, including when it is abandoned on a
/// deadline or cancellation before the inner stages return.
fn recorder(
    sink: Arc<dyn MetricsSink>,
    ctx: CallContext,
) -> FinishGuard<impl FnOnce(Code) + Send + 'static> {
    let start = Instant::now();
    FinishGuard::new(ctx.clone(), move |code| {
        report(sink.as_ref(), &ctx, code, start.elapsed())
    })
}

impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let sink = self.sink.clone();
        Arc::new(move |ctx: CallContext, request: UnaryRequest| {
            let next = next.clone();
            let sink = sink.clone();
            Box::pin(async move {
                ctx.check()?;
                let guard = recorder(sink, ctx.clone());
                let result = next(ctx, request).await;
                guard.finish(result.as_ref().map_or_else(|s| s.code(), |_| Code::Ok));
                result
            })
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        let sink = self.sink.clone();
        Arc::new(move |ctx: CallContext, request: StreamingRequest| {
            let next = next.clone();
            let sink = sink.clone();
            Box::pin(async move {
                ctx.check()?;
                let guard = recorder(sink, ctx.clone());
                match next(ctx, request).await {
                    Ok(mut response) => {
                        response.messages =
                            observe_stream(response.messages, move |code| guard.finish(code));
                        Ok(response)
                    }
                    Err(status) => {
                        guard.finish(status.code());
                        Err(status)
                    }
                }
            })
        })
    }
}
