//! Panic recovery: the outermost server stage.
//!
//! A panic anywhere inward (another stage, the handler, or while a response
//! stream is being polled) is caught on the polling task, logged with its
//! message, location and backtrace, and turned into `Internal`. The panicking
//! call's future is dropped; every other in-flight call is unaffected.
//!
//! Panic details come from a process-wide hook installed on first use. The
//! hook only records while a recovery stage is polling on the current thread
//! and otherwise defers to whatever hook was installed before it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{FutureExt, Stream};
use grpcmw_core::{
    CallContext, Interceptor, MessageStream, Status, StreamingFunc, StreamingRequest, UnaryFunc,
    UnaryRequest,
};

/// Message of the status returned for a recovered panic.
pub const RECOVERED_MESSAGE: &str = "recovered from panic";

/// What the hook saw when a panic was raised.
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: Option<String>,
}

impl PanicReport {
    fn from_payload(payload: &(dyn Any + Send)) -> Self {
        Self {
            message: panic_message(payload),
            location: None,
            backtrace: None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

thread_local! {
    /// Nesting depth of recovery polls on this thread; 0 means not capturing.
    static CAPTURE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static CAPTURE_BACKTRACE: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

fn install_panic_hook() {
    HOOK_INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURE_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let backtrace = CAPTURE_BACKTRACE
                .with(Cell::get)
                .then(|| Backtrace::force_capture().to_string());
            let report = PanicReport {
                message: panic_message(info.payload()),
                location: info.location().map(|loc| loc.to_string()),
                backtrace,
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
        }));
    });
}

/// Marks the current thread as capturing for the duration of one poll.
struct CaptureScope {
    previous_backtrace: bool,
}

impl CaptureScope {
    fn enter(backtrace: bool) -> Self {
        // A report left by a panic that was caught further in is stale.
        LAST_PANIC.with(|slot| slot.borrow_mut().take());
        CAPTURE_DEPTH.with(|d| d.set(d.get() + 1));
        let previous_backtrace = CAPTURE_BACKTRACE.with(|b| b.replace(backtrace));
        Self { previous_backtrace }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        CAPTURE_BACKTRACE.with(|b| b.set(self.previous_backtrace));
        CAPTURE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Run `f`, turning a panic into the hook's report for it.
fn guarded<T>(backtrace: bool, f: impl FnOnce() -> T) -> Result<T, PanicReport> {
    let _scope = CaptureScope::enter(backtrace);
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        // `resume_unwind` skips the hook, so the recorded report may belong
        // to an earlier panic that was caught inside `f`.
        match LAST_PANIC.with(|slot| slot.borrow_mut().take()) {
            Some(report) if report.message == message => report,
            _ => PanicReport::from_payload(payload.as_ref()),
        }
    })
}

fn recovered(ctx: &CallContext, report: &PanicReport) -> Status {
    tracing::error!(
        grpc.service = ctx.service(),
        grpc.method = ctx.method(),
        grpc.role = ctx.role().as_str(),
        panic.message = %report.message,
        panic.location = report.location.as_deref().unwrap_or("<unknown>"),
        panic.backtrace = report.backtrace.as_deref().unwrap_or("<disabled>"),
        "{}",
        RECOVERED_MESSAGE
    );
    Status::internal(RECOVERED_MESSAGE)
}

/// Logs calls whose future is dropped before producing a result.
struct CancelGuard {
    ctx: Option<CallContext>,
}

impl CancelGuard {
    fn new(ctx: &CallContext) -> Self {
        Self {
            ctx: Some(ctx.clone()),
        }
    }

    fn disarm(&mut self) {
        self.ctx = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            tracing::debug!(
                grpc.service = ctx.service(),
                grpc.method = ctx.method(),
                grpc.role = ctx.role().as_str(),
                "call dropped before completion"
            );
        }
    }
}

/// Polls an inner future, converting a panic during any poll into an error.
struct CatchPanic<F> {
    inner: F,
    backtrace: bool,
}

impl<F> Future for CatchPanic<F>
where
    F: Future + Unpin,
{
    type Output = Result<F::Output, PanicReport>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let backtrace = self.backtrace;
        match guarded(backtrace, || self.inner.poll_unpin(cx)) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(report) => Poll::Ready(Err(report)),
        }
    }
}

/// Response stream wrapper: a panic while polling ends the stream with
/// `Internal`.
struct RecoverStream {
    inner: Option<MessageStream>,
    ctx: CallContext,
    backtrace: bool,
}

impl Stream for RecoverStream {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let backtrace = self.backtrace;
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match guarded(backtrace, || inner.as_mut().poll_next(cx)) {
            Ok(poll) => poll,
            Err(report) => {
                self.inner = None;
                Poll::Ready(Some(Err(recovered(&self.ctx, &report))))
            }
        }
    }
}

/// Outermost server stage: converts panics into `Internal`.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryInterceptor {
    backtrace: bool,
}

impl RecoveryInterceptor {
    /// Installs the capturing panic hook if it is not installed yet.
    pub fn new() -> Self {
        install_panic_hook();
        Self { backtrace: true }
    }

    /// Whether recovered panics carry a backtrace. Capturing one is slow;
    /// defaults to on.
    pub fn with_backtrace(mut self, backtrace: bool) -> Self {
        self.backtrace = backtrace;
        self
    }
}

impl Default for RecoveryInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for RecoveryInterceptor {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn wrap_unary(&self, next: UnaryFunc) -> UnaryFunc {
        let backtrace = self.backtrace;
        Arc::new(move |ctx: CallContext, request: UnaryRequest| {
            let next = next.clone();
            Box::pin(async move {
                let mut guard = CancelGuard::new(&ctx);
                let result = match guarded(backtrace, || next(ctx.clone(), request)) {
                    Ok(inner) => CatchPanic { inner, backtrace }.await,
                    Err(report) => Err(report),
                };
                guard.disarm();
                result.unwrap_or_else(|report| Err(recovered(&ctx, &report)))
            })
        })
    }

    fn wrap_streaming(&self, next: StreamingFunc) -> StreamingFunc {
        let backtrace = self.backtrace;
        Arc::new(move |ctx: CallContext, request: StreamingRequest| {
            let next = next.clone();
            Box::pin(async move {
                let mut guard = CancelGuard::new(&ctx);
                let result = match guarded(backtrace, || next(ctx.clone(), request)) {
                    Ok(inner) => CatchPanic { inner, backtrace }.await,
                    Err(report) => Err(report),
                };
                guard.disarm();
                match result {
                    Ok(Ok(mut response)) => {
                        response.messages = Box::pin(RecoverStream {
                            inner: Some(response.messages),
                            ctx,
                            backtrace,
                        });
                        Ok(response)
                    }
                    Ok(Err(status)) => Err(status),
                    Err(report) => Err(recovered(&ctx, &report)),
                }
            })
        })
    }
}
