//! Small synchronization primitives shared by the bounded-parallelism
//! spots in the crate (`tree::ops::grow`, the paired store's upload
//! pool) — plain `Condvar`-backed counting semaphores, matching the
//! teacher's avoidance of an async runtime in its synchronous code paths
//! (spec.md §5).

use std::sync::{Condvar, Mutex};

pub struct Semaphore {
    state: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            state: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then hold it until the guard
    /// drops.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut guard = self.state.lock().unwrap();
        while *guard == 0 {
            guard = self.cond.wait(guard).unwrap();
        }
        *guard -= 1;
        SemaphoreGuard { sem: self }
    }
}

pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.sem.state.lock().unwrap();
        *guard += 1;
        self.sem.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn limits_concurrent_holders() {
        let sem = Arc::new(Semaphore::new(2));
        let active = Arc::new(Mutex::new(0usize));
        let max_seen = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sem = sem.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(thread::spawn(move || {
                let _permit = sem.acquire();
                let mut a = active.lock().unwrap();
                *a += 1;
                let mut m = max_seen.lock().unwrap();
                *m = (*m).max(*a);
                drop(m);
                drop(a);
                thread::sleep(std::time::Duration::from_millis(5));
                *active.lock().unwrap() -= 1;
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(*max_seen.lock().unwrap() <= 2);
    }
}
