//! Capture counters.
//!
//! Each receive thread counts into a plain [`ThreadCounters`] and copies it
//! into its [`SharedCounters`] only when a reader asked for fresh values, so
//! the hot loop never writes a cache line another core is reading.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// IP family of a packet, used to split bypass failure counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Totals of one capture interface, shared by all threads serving it.
#[derive(Default)]
pub struct LiveDevice {
    name: String,
    pkts: AtomicU64,
    drop: AtomicU64,
    invalid_checksums: AtomicU64,
    bypass_fail_v4: AtomicU64,
    bypass_fail_v6: AtomicU64,
}

impl LiveDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_pkts(&self, n: u64) {
        self.pkts.store(n, Ordering::Relaxed);
    }

    pub fn add_pkts(&self, n: u64) {
        self.pkts.fetch_add(n, Ordering::Relaxed);
    }

    pub fn pkts(&self) -> u64 {
        self.pkts.load(Ordering::Relaxed)
    }

    pub fn set_drop(&self, n: u64) {
        self.drop.store(n, Ordering::Relaxed);
    }

    pub fn drop_count(&self) -> u64 {
        self.drop.load(Ordering::Relaxed)
    }

    pub fn add_invalid_checksum(&self) {
        self.invalid_checksums.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_checksums(&self) -> u64 {
        self.invalid_checksums.load(Ordering::Relaxed)
    }

    pub fn add_bypass_fail(&self, family: IpFamily) {
        let counter = match family {
            IpFamily::V4 => &self.bypass_fail_v4,
            IpFamily::V6 => &self.bypass_fail_v6,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bypass_fail(&self, family: IpFamily) -> u64 {
        match family {
            IpFamily::V4 => self.bypass_fail_v4.load(Ordering::Relaxed),
            IpFamily::V6 => self.bypass_fail_v6.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for LiveDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveDevice")
            .field("name", &self.name)
            .field("pkts", &self.pkts())
            .field("drop", &self.drop_count())
            .finish()
    }
}

/// Per-thread capture counters, owned by the receive thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadCounters {
    pub pkts: u64,
    pub bytes: u64,
    pub rx_errs: u64,
    pub tx_errs: u64,
    pub imissed: u64,
    pub no_mbufs: u64,
    pub ierrors: u64,
}

/// Published copy of a thread's counters.
#[derive(Default)]
pub struct SharedCounters {
    sync_requested: AtomicBool,
    pkts: AtomicU64,
    bytes: AtomicU64,
    rx_errs: AtomicU64,
    tx_errs: AtomicU64,
    imissed: AtomicU64,
    no_mbufs: AtomicU64,
    ierrors: AtomicU64,
}

impl SharedCounters {
    /// Asks the owning thread to publish at its next iteration.
    pub fn request_sync(&self) {
        self.sync_requested.store(true, Ordering::Release);
    }

    /// Publishes `local` if a sync was requested since the last call.
    #[inline]
    pub fn sync_if_signalled(&self, local: &ThreadCounters) {
        if self.sync_requested.load(Ordering::Relaxed) {
            self.publish(local);
        }
    }

    pub fn publish(&self, local: &ThreadCounters) {
        self.pkts.store(local.pkts, Ordering::Relaxed);
        self.bytes.store(local.bytes, Ordering::Relaxed);
        self.rx_errs.store(local.rx_errs, Ordering::Relaxed);
        self.tx_errs.store(local.tx_errs, Ordering::Relaxed);
        self.imissed.store(local.imissed, Ordering::Relaxed);
        self.no_mbufs.store(local.no_mbufs, Ordering::Relaxed);
        self.ierrors.store(local.ierrors, Ordering::Relaxed);
        self.sync_requested.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> ThreadCounters {
        ThreadCounters {
            pkts: self.pkts.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            rx_errs: self.rx_errs.load(Ordering::Relaxed),
            tx_errs: self.tx_errs.load(Ordering::Relaxed),
            imissed: self.imissed.load(Ordering::Relaxed),
            no_mbufs: self.no_mbufs.load(Ordering::Relaxed),
            ierrors: self.ierrors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_only_when_signalled() {
        let shared = SharedCounters::default();
        let mut local = ThreadCounters::default();
        local.pkts = 10;
        shared.sync_if_signalled(&local);
        assert_eq!(shared.snapshot().pkts, 0);

        shared.request_sync();
        shared.sync_if_signalled(&local);
        assert_eq!(shared.snapshot().pkts, 10);

        local.pkts = 20;
        shared.sync_if_signalled(&local);
        assert_eq!(shared.snapshot().pkts, 10);
    }

    #[test]
    fn test_bypass_fail_per_family() {
        let dev = LiveDevice::new("eth0");
        dev.add_bypass_fail(IpFamily::V4);
        dev.add_bypass_fail(IpFamily::V6);
        dev.add_bypass_fail(IpFamily::V6);
        assert_eq!(dev.bypass_fail(IpFamily::V4), 1);
        assert_eq!(dev.bypass_fail(IpFamily::V6), 2);
    }
}
