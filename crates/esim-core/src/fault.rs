use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Once,
};

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

struct PanicSite {
    location: Option<String>,
    trace: String,
}

/// A panic caught at an operation boundary.
#[derive(Clone, Debug)]
pub struct Fault {
    pub message: String,
    pub location: Option<String>,
    /// Stack of the panicking frame, captured regardless of `RUST_BACKTRACE`.
    pub trace: String,
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}

/// Chains a hook in front of the current one that records where the panic
/// happened for the thread's next [`contain`]. Runs once per process.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let site = PanicSite {
                location: info
                    .location()
                    .map(|loc| format!("{}:{}", loc.file(), loc.line())),
                trace: Backtrace::force_capture().to_string(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(site));
            previous(info);
        }));
    });
}

/// Runs `op`, turning a panic into a [`Fault`] so it only ends the current
/// operation.
pub fn contain<T>(op: impl FnOnce() -> T) -> Result<T, Fault> {
    install_panic_hook();
    LAST_PANIC.with(|slot| slot.borrow_mut().take());
    catch_unwind(AssertUnwindSafe(op)).map_err(|payload| {
        let site = LAST_PANIC.with(|slot| slot.borrow_mut().take());
        let (location, trace) = match site {
            Some(site) => (site.location, site.trace),
            None => (None, Backtrace::force_capture().to_string()),
        };
        Fault {
            message: panic_message(payload.as_ref()),
            location,
            trace,
        }
    })
}
