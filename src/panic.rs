//! Panic capture for work functions.
//!
//! A panicking work function must not take its followers down with it, so the
//! leader runs it under `catch_unwind` and turns the payload into
//! a [`PanicError`]. The unwind has already discarded the faulting stack by the
//! time `catch_unwind` returns, so the location and backtrace are recorded by a
//! panic hook while the stack is still live. The hook only does this for threads
//! that are currently inside a capture scope; everywhere else it hands the panic
//! to whichever hook was installed before it.

use core::future::Future;
use futures::future::poll_fn;
use futures::FutureExt;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::{Arc, Once};

use crate::utils::trim_backtrace;

thread_local! {
    // None outside every capture scope, Some(capture_backtrace) inside one.
    static SCOPE: Cell<Option<bool>> = const { Cell::new(None) };
    static FAULT: RefCell<Option<Fault>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

// Symbol prefix of the hook below, the first frame of every captured trace.
const HOOK_FRAME: &str = concat!(module_path!(), "::install_hook");

struct Fault {
    location: Option<String>,
    backtrace: Option<String>,
}

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let capture_backtrace = match SCOPE.try_with(Cell::get).ok().flatten() {
                Some(capture_backtrace) => capture_backtrace,
                None => return previous(info),
            };
            let backtrace = if capture_backtrace {
                let trace = Backtrace::force_capture();
                match trace.status() {
                    BacktraceStatus::Captured => {
                        Some(trim_backtrace(&trace.to_string(), HOOK_FRAME))
                    }
                    _ => None,
                }
            } else {
                None
            };
            let fault = Fault {
                location: info.location().map(|l| l.to_string()),
                backtrace,
            };
            let _ = FAULT.try_with(|slot| *slot.borrow_mut() = Some(fault));
        }));
    });
}

/// Marks the current thread as running work until dropped.
struct Scope {
    previous: Option<bool>,
}

impl Scope {
    fn enter(capture_backtrace: bool) -> Scope {
        install_hook();
        let previous = SCOPE.with(|scope| scope.replace(Some(capture_backtrace)));
        if previous.is_none() {
            FAULT.with(|slot| slot.borrow_mut().take());
        }
        Scope { previous }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = SCOPE.try_with(|scope| scope.set(previous));
    }
}

/// capture runs `f`, turning a panic into a `PanicError` instead of unwinding
/// further. Scopes nest: an inner capture handles its own panic and leaves the
/// outer one untouched.
pub(crate) fn capture<R, F>(capture_backtrace: bool, f: F) -> Result<R, PanicError>
where
    F: FnOnce() -> R,
{
    let scope = Scope::enter(capture_backtrace);
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    drop(scope);
    result.map_err(PanicError::from_payload)
}

/// capture_async is capture for futures: every poll of `fut` runs inside a
/// capture scope, so a panic in any poll becomes a `PanicError`.
pub(crate) async fn capture_async<F>(
    capture_backtrace: bool,
    fut: F,
) -> Result<F::Output, PanicError>
where
    F: Future,
{
    let mut fut = pin!(fut);
    let scoped = poll_fn(|cx| {
        let _scope = Scope::enter(capture_backtrace);
        fut.as_mut().poll(cx)
    });
    AssertUnwindSafe(scoped)
        .catch_unwind()
        .await
        .map_err(PanicError::from_payload)
}

/// PanicError describes a work function that panicked instead of returning.
///
/// Every caller waiting on the flight receives a clone of the same error.
/// When the panic value was an error (`std::io::Error`, `anyhow::Error` or a
/// boxed `dyn Error`), `source()` yields it and can be downcast to the original
/// type. Any other non-string value is kept as is and reachable through
/// [`PanicError::payload`].
#[derive(Clone)]
pub struct PanicError(Arc<Inner>);

struct Inner {
    message: String,
    cause: Option<Cause>,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
    location: Option<String>,
    backtrace: Option<String>,
}

enum Cause {
    Anyhow(anyhow::Error),
    Std(Box<dyn StdError + Send + Sync>),
}

impl Cause {
    fn as_error(&self) -> &(dyn StdError + 'static) {
        match self {
            Cause::Anyhow(e) => &**e,
            Cause::Std(e) => &**e,
        }
    }
}

impl PanicError {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> PanicError {
        let fault = FAULT.try_with(|slot| slot.borrow_mut().take()).ok().flatten();
        let (location, backtrace) = match fault {
            Some(fault) => (fault.location, fault.backtrace),
            None => (None, None),
        };

        let (message, cause, payload) = match payload.downcast::<&'static str>() {
            Ok(s) => (s.to_string(), None, None),
            Err(payload) => match payload.downcast::<String>() {
                Ok(s) => (*s, None, None),
                Err(payload) => match into_cause(payload) {
                    Ok(cause) => (cause.as_error().to_string(), Some(cause), None),
                    Err(payload) => {
                        ("non-string panic payload".to_string(), None, Some(payload))
                    }
                },
            },
        };

        PanicError(Arc::new(Inner {
            message,
            cause,
            payload: Mutex::new(payload),
            location,
            backtrace,
        }))
    }

    /// message is the panic message, or the error's message when the panic
    /// payload was an error.
    pub fn message(&self) -> &str {
        &self.0.message
    }

    /// location is the `file:line:column` the panic was raised at.
    pub fn location(&self) -> Option<&str> {
        self.0.location.as_deref()
    }

    /// backtrace starts at the panicking frame. None when capture was disabled
    /// or the platform cannot produce one.
    pub fn backtrace(&self) -> Option<&str> {
        self.0.backtrace.as_deref()
    }

    /// payload gives access to the value the work panicked with, when it was
    /// neither a string nor one of the error types exposed through `source()`.
    /// Returns None if there is no such value or it is not a `V`.
    pub fn payload<V: Any>(&self) -> Option<MappedMutexGuard<'_, V>> {
        MutexGuard::try_map(self.0.payload.lock(), |payload| {
            payload.as_mut().and_then(|p| p.downcast_mut::<V>())
        })
        .ok()
    }
}

fn into_cause(payload: Box<dyn Any + Send>) -> Result<Cause, Box<dyn Any + Send>> {
    let payload = match payload.downcast::<anyhow::Error>() {
        Ok(e) => return Ok(Cause::Anyhow(*e)),
        Err(payload) => payload,
    };
    let payload = match payload.downcast::<Box<dyn StdError + Send + Sync>>() {
        Ok(e) => return Ok(Cause::Std(*e)),
        Err(payload) => payload,
    };
    match payload.downcast::<std::io::Error>() {
        Ok(e) => Ok(Cause::Std(e)),
        Err(payload) => Err(payload),
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())?;
        if let Some(backtrace) = self.backtrace() {
            write!(f, "\n\n{}", backtrace)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicError")
            .field("message", &self.0.message)
            .field("cause", &self.0.cause.as_ref().map(Cause::as_error))
            .field("payload", &self.0.payload.lock().is_some())
            .field("location", &self.0.location)
            .field("backtrace", &self.0.backtrace.is_some())
            .finish()
    }
}

impl StdError for PanicError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.cause.as_ref().map(Cause::as_error)
    }
}

/// Equal when both come from the same captured panic.
impl PartialEq for PanicError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
