//! Single-flight guard for sync cycles.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flight {
    Idle,
    Running { rerun: bool },
}

/// Allows at most one cycle at a time; overlapping requests collapse into a
/// single re-run flag.
#[derive(Debug)]
pub struct SingleFlight {
    state: Mutex<Flight>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlight {
    /// Creates an idle guard.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Flight::Idle),
        }
    }

    /// Claims the guard. Returns false, and flags a re-run, if a cycle is
    /// already running.
    pub fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            Flight::Idle => {
                *state = Flight::Running { rerun: false };
                true
            }
            Flight::Running { .. } => {
                *state = Flight::Running { rerun: true };
                false
            }
        }
    }

    /// Ends the current cycle. Returns true if a re-run was requested, in
    /// which case the guard stays claimed for that run.
    pub fn finish(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            Flight::Running { rerun: true } => {
                *state = Flight::Running { rerun: false };
                true
            }
            _ => {
                *state = Flight::Idle;
                false
            }
        }
    }

    /// Releases the guard, dropping any pending re-run.
    pub fn abandon(&self) {
        *self.state.lock() = Flight::Idle;
    }

    /// Returns true while a cycle holds the guard.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), Flight::Running { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_requests_coalesce() {
        let flight = SingleFlight::new();
        assert!(flight.try_begin());
        assert!(!flight.try_begin());
        assert!(!flight.try_begin());
        assert!(flight.is_running());

        assert!(flight.finish());
        assert!(flight.is_running());
        assert!(!flight.finish());
        assert!(!flight.is_running());
    }

    #[test]
    fn abandon_drops_rerun() {
        let flight = SingleFlight::new();
        assert!(flight.try_begin());
        assert!(!flight.try_begin());
        flight.abandon();
        assert!(!flight.is_running());
        assert!(flight.try_begin());
    }
}
