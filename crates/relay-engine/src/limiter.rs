use std::collections::HashMap;

use parking_lot::Mutex;
use relay_identity::Identity;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("engine is shutting down")]
    Stopping,
    #[error("global splice capacity reached")]
    GlobalCapacityReached,
    #[error("lease's splice capacity reached")]
    LeaseCapacityReached,
}

struct LimiterState {
    stopping: bool,
    global_count: usize,
    per_lease_count: HashMap<Identity, usize>,
}

/// Guards the global and per-lease splice-worker counts together with the
/// `stopping` flag behind a single lock, so a splice either registers
/// strictly before shutdown is observed, or is rejected — never both.
pub(crate) struct SpliceLimiter {
    global_cap: Option<usize>,
    per_lease_cap: Option<usize>,
    state: Mutex<LimiterState>,
}

impl SpliceLimiter {
    pub(crate) fn new(global_cap: Option<usize>, per_lease_cap: Option<usize>) -> Self {
        Self {
            global_cap,
            per_lease_cap,
            state: Mutex::new(LimiterState {
                stopping: false,
                global_count: 0,
                per_lease_count: HashMap::new(),
            }),
        }
    }

    pub(crate) fn begin_stopping(&self) {
        self.state.lock().stopping = true;
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    /// Registers one worker slot for `lease_id`. Callers must call
    /// [`Self::release`] exactly once per successful `admit`.
    pub(crate) fn admit(&self, lease_id: &Identity) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();

        if state.stopping {
            return Err(AdmissionError::Stopping);
        }

        if let Some(cap) = self.global_cap {
            if state.global_count >= cap {
                return Err(AdmissionError::GlobalCapacityReached);
            }
        }

        let current = state.per_lease_count.get(lease_id).copied().unwrap_or(0);
        if let Some(cap) = self.per_lease_cap {
            if current >= cap {
                return Err(AdmissionError::LeaseCapacityReached);
            }
        }

        state.global_count += 1;
        state.per_lease_count.insert(lease_id.clone(), current + 1);

        Ok(())
    }

    pub(crate) fn release(&self, lease_id: &Identity) {
        let mut state = self.state.lock();
        state.global_count = state.global_count.saturating_sub(1);
        if let Some(count) = state.per_lease_count.get_mut(lease_id) {
            *count -= 1;
            if *count == 0 {
                state.per_lease_count.remove(lease_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_beyond_per_lease_cap() {
        let limiter = SpliceLimiter::new(None, Some(1));
        let id = Identity::from("H");

        assert!(limiter.admit(&id).is_ok());
        assert!(matches!(limiter.admit(&id), Err(AdmissionError::LeaseCapacityReached)));

        limiter.release(&id);
        assert!(limiter.admit(&id).is_ok());
    }

    #[test]
    fn rejects_after_stopping() {
        let limiter = SpliceLimiter::new(None, None);
        limiter.begin_stopping();
        assert!(matches!(limiter.admit(&Identity::from("H")), Err(AdmissionError::Stopping)));
    }
}
