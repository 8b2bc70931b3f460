use std::sync::{Mutex, PoisonError};

/// Coordinator-issued group id shared by every slot of one worker process.
///
/// The first value observed under the lock wins; later candidates are ignored, so every read
/// after assignment is stable.
#[derive(Debug, Default)]
pub struct Session {
    id: Mutex<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<String> {
        self.id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `candidate` if no id is recorded yet. Returns whether it was stored.
    pub fn record(&self, candidate: &str) -> bool {
        let mut slot = self.id.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(candidate.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use super::*;

    #[test]
    fn first_writer_wins() {
        let s = Session::new();
        assert_eq!(s.id(), None);
        assert!(s.record("g-1"));
        assert!(!s.record("g-2"));
        assert_eq!(s.id().as_deref(), Some("g-1"));
    }

    #[test]
    fn concurrent_writers_leave_exactly_one_value() {
        let s = Arc::new(Session::new());
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let s = s.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    s.record(&format!("g-{i}"))
                })
            })
            .collect();

        let winners: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);

        let winner = winners.iter().position(|w| *w).unwrap();
        assert_eq!(s.id(), Some(format!("g-{winner}")));
    }
}
