use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic message id source for one router instance.
///
/// Ids have the form `"<name>.<nanoseconds since start>"`. Two calls never
/// return the same offset: when the clock has not advanced past the last
/// issued offset, the next offset is `last + 1`.
///
/// Uniqueness holds per instance only; routers sharing a `name` can collide.
#[derive(Debug)]
pub struct MessageIdGenerator {
    name: String,
    started: Instant,
    last: AtomicU64,
}

impl MessageIdGenerator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// Nanoseconds elapsed since this generator was created, strictly
    /// increasing across calls.
    pub fn next_offset(&self) -> u64 {
        let now = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    pub fn next_id(&self) -> String {
        format!("{}.{}", self.name, self.next_offset())
    }

    /// Name for a router's own listen queue when none is configured.
    pub fn listen_queue_name(&self) -> String {
        format!("{}-{}", self.name, self.next_offset())
    }
}
