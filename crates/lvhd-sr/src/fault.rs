//! Fault-injection points
//!
//! Each journaled protocol step calls [`FaultPoints::fire`] with a
//! well-known name. Tests arm a point to make that step fail once,
//! exercising the rollback and recovery paths; in production nothing is
//! ever armed and `fire` is a no-op.

use lvhd_common::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use tracing::warn;

#[derive(Default)]
pub struct FaultPoints {
    armed: Mutex<HashSet<String>>,
}

impl FaultPoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a point; the next `fire` with this name fails once
    pub fn arm(&self, name: &str) {
        self.armed.lock().insert(name.to_string());
    }

    /// Fail if armed (one-shot), otherwise pass through
    pub fn fire(&self, name: &str) -> Result<()> {
        if self.armed.lock().remove(name) {
            warn!(point = name, "injected fault");
            return Err(io::Error::other(format!("injected fault at {name}")).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_is_one_shot() {
        let faults = FaultPoints::new();
        faults.arm("step");
        assert!(faults.fire("step").is_err());
        assert!(faults.fire("step").is_ok());
        assert!(faults.fire("other").is_ok());
    }
}
