//! Shutdown rendezvous of the receive threads of one port group.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// Pause between two looks at the counter while waiting for peers.
pub const CHECK_IN_POLL_US: u32 = 10;

/// Time the leader gives the other threads to leave the wait loop before it
/// resets the counter.
pub const LEADER_GRACE_US: u32 = 20;

/// Outcome of [`WorkerSync::check_in`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckIn {
    /// Queue 0: every peer checked in, the shared device is ours to stop.
    Leader,
    Follower,
}

#[derive(Debug)]
pub struct WorkerSync {
    worker_cnt: u16,
    checked_in: AtomicU16,
    generation: AtomicU32,
}

impl WorkerSync {
    pub fn new(worker_cnt: u16) -> Self {
        Self {
            worker_cnt: worker_cnt.max(1),
            checked_in: AtomicU16::new(0),
            generation: AtomicU32::new(0),
        }
    }

    pub fn worker_cnt(&self) -> u16 {
        self.worker_cnt
    }

    pub fn checked_in(&self) -> u16 {
        self.checked_in.load(Ordering::Acquire)
    }

    /// Registers the calling worker and busy-waits until every worker of the
    /// group did the same.
    ///
    /// Queue 0 returns [`CheckIn::Leader`] after the grace delay, with the
    /// counter reset for the next round. A waiter that misses the saturated
    /// counter still leaves once the leader bumps the generation.
    pub fn check_in(&self, queue_id: u16, delay_us: impl Fn(u32)) -> CheckIn {
        let generation = self.generation.load(Ordering::Acquire);
        self.checked_in.fetch_add(1, Ordering::AcqRel);
        while self.checked_in.load(Ordering::Acquire) < self.worker_cnt
            && self.generation.load(Ordering::Acquire) == generation
        {
            delay_us(CHECK_IN_POLL_US);
        }

        if queue_id != 0 {
            return CheckIn::Follower;
        }

        delay_us(LEADER_GRACE_US);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.checked_in.store(0, Ordering::Release);
        CheckIn::Leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn sleep_us(us: u32) {
        thread::sleep(Duration::from_micros(us as u64));
    }

    #[test]
    fn test_single_worker_is_leader() {
        let sync = WorkerSync::new(1);
        assert_eq!(sync.check_in(0, |_| {}), CheckIn::Leader);
        assert_eq!(sync.checked_in(), 0);
    }

    #[test]
    fn test_device_stopped_once_after_all_check_ins() {
        const WORKERS: u16 = 6;
        let sync = Arc::new(WorkerSync::new(WORKERS));
        let arrived = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..WORKERS)
            .map(|queue| {
                let sync = Arc::clone(&sync);
                let arrived = Arc::clone(&arrived);
                let stops = Arc::clone(&stops);
                thread::spawn(move || {
                    // stagger arrivals, queue 0 first
                    sleep_us(queue as u32 * 500);
                    arrived.fetch_add(1, Ordering::SeqCst);
                    if sync.check_in(queue, sleep_us) == CheckIn::Leader {
                        assert_eq!(arrived.load(Ordering::SeqCst), WORKERS as usize);
                        stops.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(sync.checked_in(), 0);
    }

    #[test]
    fn test_waiter_released_by_generation_change() {
        let sync = WorkerSync::new(3);
        // pretend two peers already went through a round that got reset
        let generation = sync.generation.load(Ordering::Acquire);
        sync.generation.store(generation + 1, Ordering::Release);
        let sync = Arc::new(sync);

        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.check_in(2, sleep_us))
        };
        thread::sleep(Duration::from_millis(5));
        sync.generation.fetch_add(1, Ordering::AcqRel);
        assert_eq!(waiter.join().unwrap(), CheckIn::Follower);
    }
}
