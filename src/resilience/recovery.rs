//! Panic recovery middleware.
//!
//! A panic raised anywhere below this layer, while the handler future is
//! being created or while it is polled, is caught and converted into an
//! `Error` through the configured fault handler. The panic never propagates
//! past the recovery boundary.
//!
//! Panics are observed through a process-wide hook, installed once, that
//! records the message, location and (optionally) a backtrace for the
//! recovery scope active on the panicking thread. Panics outside any recovery
//! scope are forwarded to the previously installed hook untouched.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context as TaskContext, Poll};

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{BoxFuture, Handler, Middleware};
use crate::observability::metrics;
use crate::transport::Side;

pub const DEFAULT_STACK_SIZE: usize = 4096;

/// Description of a recovered panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    /// Panic payload rendered as text.
    pub message: String,
    /// `file:line:column` of the panic, when known.
    pub location: Option<String>,
    /// Captured backtrace, truncated to the configured stack size.
    pub stack: Option<String>,
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

/// Converts a recovered fault into the error returned to the caller.
pub type FaultHandler = Arc<dyn Fn(&Context, FaultInfo) -> Error + Send + Sync>;

#[derive(Clone)]
pub struct RecoverySettings {
    disabled: bool,
    stack_size: usize,
    disable_stack: bool,
    disable_print: bool,
    fault_handler: FaultHandler,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            disabled: false,
            stack_size: DEFAULT_STACK_SIZE,
            disable_stack: false,
            disable_print: false,
            fault_handler: Arc::new(|_ctx, fault| Error::FaultRecovered(fault)),
        }
    }
}

impl fmt::Debug for RecoverySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverySettings")
            .field("disabled", &self.disabled)
            .field("stack_size", &self.stack_size)
            .field("disable_stack", &self.disable_stack)
            .field("disable_print", &self.disable_print)
            .finish_non_exhaustive()
    }
}

impl RecoverySettings {
    pub fn builder() -> RecoverySettingsBuilder {
        RecoverySettingsBuilder::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    fn captures_stack(&self) -> bool {
        !self.disable_stack && self.stack_size > 0
    }
}

#[derive(Default)]
pub struct RecoverySettingsBuilder {
    settings: RecoverySettings,
}

impl RecoverySettingsBuilder {
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.settings.disabled = disabled;
        self
    }

    /// Maximum number of backtrace bytes kept in `FaultInfo::stack`.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.settings.stack_size = bytes;
        self
    }

    /// Skip backtrace capture entirely.
    pub fn disable_stack(mut self, disable: bool) -> Self {
        self.settings.disable_stack = disable;
        self
    }

    /// Do not log recovered panics.
    pub fn disable_print(mut self, disable: bool) -> Self {
        self.settings.disable_print = disable;
        self
    }

    pub fn fault_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Context, FaultInfo) -> Error + Send + Sync + 'static,
    {
        self.settings.fault_handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> Result<RecoverySettings, Error> {
        let s = &self.settings;
        if !s.disable_stack && s.stack_size == 0 {
            return Err(Error::config(
                "recovery stack_size must be positive unless stack capture is disabled",
            ));
        }
        Ok(self.settings)
    }
}

/// Recovery middleware for inbound calls.
pub fn server<Req, Resp>(settings: RecoverySettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    recovery(Side::Server, settings)
}

/// Recovery middleware for outbound calls.
pub fn client<Req, Resp>(settings: RecoverySettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    recovery(Side::Client, settings)
}

fn recovery<Req, Resp>(side: Side, settings: RecoverySettings) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    if settings.disabled {
        return Middleware::identity();
    }
    install_panic_hook();

    let settings = Arc::new(settings);
    Middleware::new(move |next: Handler<Req, Resp>| {
        let settings = Arc::clone(&settings);
        Handler::new(move |ctx: Context, req: Req| {
            let next = next.clone();
            let settings = Arc::clone(&settings);
            async move {
                let capture = settings.captures_stack();
                let started = {
                    let _scope = CaptureScope::enter(capture);
                    let call_ctx = ctx.clone();
                    panic::catch_unwind(AssertUnwindSafe(move || next.call(call_ctx, req)))
                        .map_err(Fault::take)
                };
                let outcome = match started {
                    Ok(fut) => CatchPanic::new(fut, capture).await,
                    Err(fault) => Err(fault),
                };
                match outcome {
                    Ok(result) => result,
                    Err(fault) => Err(settings.recover(side, &ctx, fault)),
                }
            }
        })
    })
}

impl RecoverySettings {
    fn recover(&self, side: Side, ctx: &Context, fault: Fault) -> Error {
        let info = fault.into_info(self.stack_size);
        metrics::record_panic_recovered(side);
        if !self.disable_print {
            let operation = ctx
                .transport(side)
                .map(|tr| tr.operation().to_string())
                .unwrap_or_default();
            tracing::error!(
                side = %side,
                operation = %operation,
                panic = %info.message,
                location = info.location.as_deref().unwrap_or("unknown"),
                stack = info.stack.as_deref().unwrap_or(""),
                "Recovered from panic"
            );
        }
        (self.fault_handler)(ctx, info)
    }
}

/// Raw panic data gathered on the panicking thread.
struct Fault {
    message: String,
    location: Option<String>,
    stack: Option<String>,
}

impl Fault {
    fn take(payload: Box<dyn Any + Send>) -> Self {
        let captured = CAPTURED.with(|slot| slot.borrow_mut().take());
        let (location, stack) = match captured {
            Some(c) => (c.location, c.stack),
            None => (None, None),
        };
        Fault {
            message: payload_message(payload.as_ref()),
            location,
            stack,
        }
    }

    fn into_info(self, stack_size: usize) -> FaultInfo {
        FaultInfo {
            message: self.message,
            location: self.location,
            stack: self.stack.map(|s| truncate_at_char_boundary(s, stack_size)),
        }
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<Error>() {
        err.to_string()
    } else {
        "unknown panic payload".to_string()
    }
}

fn truncate_at_char_boundary(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// Polls the inner future inside `catch_unwind`, one recovery scope per poll.
struct CatchPanic<T> {
    inner: BoxFuture<T>,
    capture_stack: bool,
}

impl<T> CatchPanic<T> {
    fn new(inner: BoxFuture<T>, capture_stack: bool) -> Self {
        Self {
            inner,
            capture_stack,
        }
    }
}

impl<T> Future for CatchPanic<T> {
    type Output = Result<T, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let capture = self.capture_stack;
        let inner = &mut self.inner;
        let _scope = CaptureScope::enter(capture);
        match panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(Poll::Ready(out)) => Poll::Ready(Ok(out)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(Fault::take(payload))),
        }
    }
}

struct Captured {
    location: Option<String>,
    stack: Option<String>,
}

thread_local! {
    /// Stack of active recovery scopes on this thread; `true` captures a backtrace.
    static SCOPES: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    static CAPTURED: RefCell<Option<Captured>> = const { RefCell::new(None) };
}

struct CaptureScope;

impl CaptureScope {
    fn enter(capture_stack: bool) -> Self {
        // Drop data left behind by a panic that was caught elsewhere.
        CAPTURED.with(|slot| slot.borrow_mut().take());
        SCOPES.with(|scopes| scopes.borrow_mut().push(capture_stack));
        CaptureScope
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}

static HOOK: Once = Once::new();

fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let scope = SCOPES.with(|scopes| scopes.borrow().last().copied());
            match scope {
                Some(capture_stack) => {
                    let captured = Captured {
                        location: info.location().map(|l| l.to_string()),
                        stack: capture_stack.then(|| Backtrace::force_capture().to_string()),
                    };
                    CAPTURED.with(|slot| *slot.borrow_mut() = Some(captured));
                }
                None => previous(info),
            }
        }));
    });
}
