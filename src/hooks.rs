//! Process-wide defaults and hooks.
//!
//! The runtime keeps a deliberately small amount of global state: the default
//! prefetch/buffer size used by asynchronous-boundary operators, and the hook
//! that receives errors which can no longer be delivered downstream (a
//! terminal signal already happened). Setters are race-safe but intended for
//! early-process configuration only.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;

use crate::error::FlowError;

/// Default prefetch and queue capacity for asynchronous boundaries.
static BUFFER_SIZE: AtomicUsize = AtomicUsize::new(128);

/// Hook invoked with errors that arrive after the chain already terminated.
pub struct UndeliverableHook(Box<dyn Fn(&FlowError) + Send + Sync>);

fn hook_cell() -> &'static ArcSwap<UndeliverableHook> {
    static CELL: OnceLock<ArcSwap<UndeliverableHook>> = OnceLock::new();
    CELL.get_or_init(|| {
        ArcSwap::from_pointee(UndeliverableHook(Box::new(|err| {
            // Errors are never swallowed silently: without a custom hook they
            // land on standard error.
            eprintln!("flusso: undeliverable error: {err}");
        })))
    })
}

/// Returns the process-wide default buffer size (initially 128).
pub fn buffer_size() -> usize {
    BUFFER_SIZE.load(Ordering::Relaxed)
}

/// Overrides the process-wide default buffer size. Values below 1 are
/// clamped. Operators created after the call observe the new value.
pub fn set_buffer_size(n: usize) {
    BUFFER_SIZE.store(n.max(1), Ordering::Relaxed);
}

/// Replaces the undeliverable-error hook (atomic pointer swap).
pub fn set_undeliverable_hook(hook: impl Fn(&FlowError) + Send + Sync + 'static) {
    hook_cell().store(std::sync::Arc::new(UndeliverableHook(Box::new(hook))));
}

/// Routes a late error to the hook. Used by operators that observe an error
/// after the downstream already received its terminal signal.
pub fn on_undeliverable(err: FlowError) {
    log::debug!("late error routed to hook: {err}");
    (hook_cell().load().0)(&err);
}
