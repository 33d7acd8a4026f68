use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

type Action = Box<dyn FnOnce() + Send>;

/// Join of a fixed number of parties. The last party to arrive runs the
/// completion action, exactly once, whatever the arrival order.
pub struct CompletionJoin {
    remaining: AtomicUsize,
    action: Mutex<Option<Action>>,
}

impl CompletionJoin {
    pub fn new<F>(parties: usize, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            remaining: AtomicUsize::new(parties),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Marks one party done. Returns `true` for the last arriver, after the
    /// action ran. Extra arrivals are ignored.
    pub fn arrive(&self) -> bool {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                let action = self.action.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(action) = action {
                    action();
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}
