//! Failure containment at the top of a pipeline.
//!
//! The capture subsystem cannot replay an event, and an error escaping into
//! its delivery thread would end the subscription. Stages directly below
//! the capture boundary therefore run their work through [`guarded`], which
//! logs both returned errors and panics.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::logging::LogScope;

/// Run `work`, logging an error or panic at error level instead of
/// propagating it.
pub fn guarded<F>(log: &LogScope, what: &str, work: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!(target: log.target(), "{}_FAILED error={:#}", what, e);
        }
        Err(panic) => {
            log::error!(
                target: log.target(),
                "{}_PANICKED panic={}",
                what,
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
