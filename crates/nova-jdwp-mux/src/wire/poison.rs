use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Registry and receiver bookkeeping stays structurally valid across a panic,
/// so a poisoned lock is logged and then used as-is.
#[track_caller]
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
              target = "nova.jdwp",
              context,
              file = loc.file(),
              line = loc.line(),
              column = loc.column(),
              error = %err,
              "mutex poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}
