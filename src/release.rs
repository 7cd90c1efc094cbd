// Counted release of GPU objects: a nonzero count after release is a leak

use crate::backend::GpuObject;
use crate::error::{BridgeError, Result};
use crate::log_error;

/// Collects the outcome of a sequence of releases.
///
/// Releasing keeps going after a leak so every object still gets its
/// reference back; the first leak is reported by [`LeakCheck::finish`].
pub struct LeakCheck {
    abort_on_leak: bool,
    first_leak: Option<BridgeError>,
    leaks: usize,
}

impl LeakCheck {
    pub fn new(abort_on_leak: bool) -> Self {
        Self {
            abort_on_leak,
            first_leak: None,
            leaks: 0,
        }
    }

    pub fn release<O: GpuObject>(&mut self, object: &'static str, value: O) {
        let remaining = value.release();
        self.record(object, remaining);
    }

    pub fn release_opt<O: GpuObject>(&mut self, object: &'static str, value: Option<O>) {
        if let Some(value) = value {
            self.release(object, value);
        }
    }

    pub fn record(&mut self, object: &'static str, remaining: u32) {
        if remaining == 0 {
            return;
        }

        log_error!("{} leaked: {} reference(s) outstanding after release", object, remaining);
        if self.abort_on_leak {
            panic!("{} leaked: {} reference(s) outstanding after release", object, remaining);
        }

        self.leaks += 1;
        self.first_leak
            .get_or_insert(BridgeError::ResourceLeak { object, remaining });
    }

    /// Records a failure that is not a leak but should still surface once
    /// the release sequence is complete.
    pub fn record_error(&mut self, error: BridgeError) {
        log_error!("Release step failed: {}", error);
        self.first_leak.get_or_insert(error);
    }

    pub fn leaks(&self) -> usize {
        self.leaks
    }

    pub fn finish(self) -> Result<()> {
        match self.first_leak {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
