//! In-memory poll-mode device.
//!
//! `SoftDevice` behaves like a multi-queue NIC without touching hardware:
//! frames are injected into per-queue RX queues, transmitted frames are kept
//! in a per-port capture queue and every frame comes from a fixed pool, so a
//! leaked or doubly released buffer shows up in [`SoftDevice::frames_in_use`].
//! It drives the demo binary and the tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::api::{
    BufferHandle, Burst, ChecksumFlags, CycleCounter, DeviceInfo, PollDevice, PortStats,
    ProcessRole, Result,
};
use crate::clock::MonotonicCounter;
use crate::errors::Error;
use crate::pool::{ObjectPool, Pooled, Reusable};

pub const DEFAULT_FRAME_SIZE: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftClock {
    /// Nanoseconds of the monotonic OS clock.
    Monotonic,
    /// Advanced only by [`SoftDevice::advance_clock`] and busy delays.
    Manual { hz: u64 },
}

#[derive(Clone, Debug)]
pub struct SoftConfig {
    pub ports: u16,
    pub queues: u16,
    /// Frames shared by all ports.
    pub frame_pool_size: usize,
    pub frame_size: usize,
    pub rx_queue_size: usize,
    /// Transmitted frames retained per port, older ones are released.
    pub tx_capture_size: usize,
    pub interrupts: bool,
    pub clock: SoftClock,
    pub role: ProcessRole,
    /// NUMA node reported for every port.
    pub socket_id: Option<u32>,
    /// NUMA node reported for the calling thread.
    pub thread_socket_id: Option<u32>,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            ports: 1,
            queues: 1,
            frame_pool_size: 4096,
            frame_size: DEFAULT_FRAME_SIZE,
            rx_queue_size: 1024,
            tx_capture_size: 1024,
            interrupts: true,
            clock: SoftClock::Monotonic,
            role: ProcessRole::Primary,
            socket_id: None,
            thread_socket_id: None,
        }
    }
}

#[derive(Debug)]
pub struct FrameData {
    bytes: Box<[u8]>,
    len: usize,
    segmented: bool,
    flags: ChecksumFlags,
}

impl Reusable for FrameData {
    fn recycle(&mut self) {
        self.len = 0;
        self.segmented = false;
        self.flags = ChecksumFlags::default();
    }
}

/// A frame of the soft device. Dropping it returns it to the frame pool.
#[derive(Debug)]
pub struct SoftFrame(Pooled<FrameData>);

impl SoftFrame {
    /// Marks the frame as spread over several segments.
    pub fn set_segmented(&mut self, segmented: bool) {
        self.0.segmented = segmented;
    }

    pub fn set_checksum_flags(&mut self, flags: ChecksumFlags) {
        self.0.flags = flags;
    }
}

impl BufferHandle for SoftFrame {
    fn data(&self) -> &[u8] {
        &self.0.bytes[..self.0.len]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let len = self.0.len;
        &mut self.0.bytes[..len]
    }

    fn pkt_len(&self) -> usize {
        self.0.len
    }

    fn is_contiguous(&self) -> bool {
        !self.0.segmented
    }

    fn checksum_flags(&self) -> ChecksumFlags {
        self.0.flags
    }
}

#[derive(Default)]
struct PortCounters {
    ipackets: AtomicU64,
    opackets: AtomicU64,
    ibytes: AtomicU64,
    obytes: AtomicU64,
    imissed: AtomicU64,
    oerrors: AtomicU64,
    rx_nombuf: AtomicU64,
}

impl PortCounters {
    fn snapshot(&self) -> PortStats {
        PortStats {
            ipackets: self.ipackets.load(Ordering::Relaxed),
            opackets: self.opackets.load(Ordering::Relaxed),
            ibytes: self.ibytes.load(Ordering::Relaxed),
            obytes: self.obytes.load(Ordering::Relaxed),
            imissed: self.imissed.load(Ordering::Relaxed),
            ierrors: 0,
            oerrors: self.oerrors.load(Ordering::Relaxed),
            rx_nombuf: self.rx_nombuf.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for c in [
            &self.ipackets,
            &self.opackets,
            &self.ibytes,
            &self.obytes,
            &self.imissed,
            &self.oerrors,
            &self.rx_nombuf,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct RxEvent {
    pending: Mutex<bool>,
    cv: Condvar,
}

struct SoftQueue {
    rx: ArrayQueue<SoftFrame>,
    intr_registered: AtomicBool,
    intr_enabled: AtomicBool,
    event: RxEvent,
}

struct SoftPort {
    name: String,
    queues: Box<[SoftQueue]>,
    tx: ArrayQueue<SoftFrame>,
    tx_fail_budget: AtomicU32,
    started: AtomicBool,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    close_calls: AtomicU32,
    post_start_calls: AtomicU32,
    counters: PortCounters,
}

enum Clock {
    Monotonic(MonotonicCounter),
    Manual { cycles: AtomicU64, hz: u64 },
}

pub struct SoftDevice {
    config: SoftConfig,
    frames: ObjectPool<FrameData>,
    ports: Box<[SoftPort]>,
    clock: Clock,
}

impl SoftDevice {
    pub fn new(config: SoftConfig) -> Self {
        let frame_size = config.frame_size;
        let frames = ObjectPool::new_with("soft_frames", config.frame_pool_size, || FrameData {
            bytes: vec![0; frame_size].into_boxed_slice(),
            len: 0,
            segmented: false,
            flags: ChecksumFlags::default(),
        });

        let ports = (0..config.ports.max(1))
            .map(|p| SoftPort {
                name: format!("soft{p}"),
                queues: (0..config.queues.max(1))
                    .map(|_| SoftQueue {
                        rx: ArrayQueue::new(config.rx_queue_size.max(1)),
                        intr_registered: AtomicBool::new(false),
                        intr_enabled: AtomicBool::new(false),
                        event: RxEvent::default(),
                    })
                    .collect(),
                tx: ArrayQueue::new(config.tx_capture_size.max(1)),
                tx_fail_budget: AtomicU32::new(0),
                started: AtomicBool::new(false),
                start_calls: AtomicU32::new(0),
                stop_calls: AtomicU32::new(0),
                close_calls: AtomicU32::new(0),
                post_start_calls: AtomicU32::new(0),
                counters: PortCounters::default(),
            })
            .collect();

        let clock = match config.clock {
            SoftClock::Monotonic => Clock::Monotonic(MonotonicCounter::new()),
            SoftClock::Manual { hz } => Clock::Manual {
                cycles: AtomicU64::new(0),
                hz,
            },
        };

        Self {
            config,
            frames,
            ports,
            clock,
        }
    }

    fn port(&self, port: u16) -> Result<&SoftPort> {
        self.ports
            .get(port as usize)
            .ok_or_else(|| Error::Config(format!("no such port {port}")))
    }

    fn queue(&self, port: u16, queue: u16) -> Option<&SoftQueue> {
        self.ports.get(port as usize)?.queues.get(queue as usize)
    }

    /// Allocates a frame holding a copy of `bytes`, truncated to the frame
    /// size. `None` when the pool is exhausted.
    pub fn alloc_frame(&self, bytes: &[u8]) -> Option<SoftFrame> {
        let mut data = self.frames.alloc()?;
        let len = bytes.len().min(data.bytes.len());
        data.bytes[..len].copy_from_slice(&bytes[..len]);
        data.len = len;
        Some(SoftFrame(data))
    }

    /// Delivers a frame to an RX queue as if it arrived on the wire.
    pub fn inject(&self, port: u16, queue: u16, bytes: &[u8]) -> Result<()> {
        self.inject_with(port, queue, bytes, ChecksumFlags::default())
    }

    pub fn inject_with(&self, port: u16, queue: u16, bytes: &[u8], flags: ChecksumFlags) -> Result<()> {
        let p = self.port(port)?;
        let q = self
            .queue(port, queue)
            .ok_or_else(|| Error::Config(format!("no such queue {port}:{queue}")))?;

        let Some(mut frame) = self.alloc_frame(bytes) else {
            p.counters.rx_nombuf.fetch_add(1, Ordering::Relaxed);
            return Err(Error::NoMemory);
        };
        frame.set_checksum_flags(flags);
        if q.rx.push(frame).is_err() {
            p.counters.imissed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if q.intr_enabled.load(Ordering::Acquire) {
            let mut pending = q.event.pending.lock();
            *pending = true;
            q.event.cv.notify_one();
        }
        Ok(())
    }

    /// Queues an already allocated frame on an RX queue. The frame is handed
    /// back when the queue is full.
    pub fn inject_frame(&self, port: u16, queue: u16, frame: SoftFrame) -> std::result::Result<(), SoftFrame> {
        match self.queue(port, queue) {
            Some(q) => q.rx.push(frame),
            None => Err(frame),
        }
    }

    /// Frames transmitted on `port` and not yet drained.
    pub fn tx_count(&self, port: u16) -> usize {
        self.ports.get(port as usize).map_or(0, |p| p.tx.len())
    }

    /// Takes every captured transmitted frame of `port`.
    pub fn drain_tx(&self, port: u16) -> Vec<SoftFrame> {
        let mut out = Vec::new();
        if let Some(p) = self.ports.get(port as usize) {
            while let Some(f) = p.tx.pop() {
                out.push(f);
            }
        }
        out
    }

    /// Makes the next `n` transmit attempts on `port` fail.
    pub fn fail_next_tx(&self, port: u16, n: u32) {
        if let Some(p) = self.ports.get(port as usize) {
            p.tx_fail_budget.store(n, Ordering::Relaxed);
        }
    }

    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    pub fn frame_pool(&self) -> &ObjectPool<FrameData> {
        &self.frames
    }

    pub fn is_started(&self, port: u16) -> bool {
        self.ports
            .get(port as usize)
            .is_some_and(|p| p.started.load(Ordering::Acquire))
    }

    pub fn start_calls(&self, port: u16) -> u32 {
        self.ports
            .get(port as usize)
            .map_or(0, |p| p.start_calls.load(Ordering::Acquire))
    }

    pub fn stop_calls(&self, port: u16) -> u32 {
        self.ports
            .get(port as usize)
            .map_or(0, |p| p.stop_calls.load(Ordering::Acquire))
    }

    pub fn close_calls(&self, port: u16) -> u32 {
        self.ports
            .get(port as usize)
            .map_or(0, |p| p.close_calls.load(Ordering::Acquire))
    }

    pub fn post_start_calls(&self, port: u16) -> u32 {
        self.ports
            .get(port as usize)
            .map_or(0, |p| p.post_start_calls.load(Ordering::Acquire))
    }

    pub fn rx_intr_enabled(&self, port: u16, queue: u16) -> bool {
        self.queue(port, queue)
            .is_some_and(|q| q.intr_enabled.load(Ordering::Acquire))
    }

    /// Moves a manual clock forward. No effect on a monotonic clock.
    pub fn advance_clock(&self, cycles: u64) {
        if let Clock::Manual { cycles: c, .. } = &self.clock {
            c.fetch_add(cycles, Ordering::AcqRel);
        }
    }
}

impl CycleCounter for SoftDevice {
    fn cycles(&self) -> u64 {
        match &self.clock {
            Clock::Monotonic(m) => m.cycles(),
            Clock::Manual { cycles, .. } => cycles.load(Ordering::Acquire),
        }
    }

    fn cycles_hz(&self) -> u64 {
        match &self.clock {
            Clock::Monotonic(m) => m.cycles_hz(),
            Clock::Manual { hz, .. } => *hz,
        }
    }
}

impl PollDevice for SoftDevice {
    type Buffer = SoftFrame;

    fn port_name(&self, port: u16) -> Result<String> {
        Ok(self.port(port)?.name.clone())
    }

    fn rx_burst(&self, port: u16, queue: u16, burst: &mut Burst<SoftFrame>) -> usize {
        let Some(q) = self.queue(port, queue) else {
            return 0;
        };
        let p = &self.ports[port as usize];
        let mut n = 0;
        let mut bytes = 0;
        while !burst.is_full() {
            match q.rx.pop() {
                Some(frame) => {
                    bytes += frame.pkt_len() as u64;
                    burst.push(frame);
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            p.counters.ipackets.fetch_add(n as u64, Ordering::Relaxed);
            p.counters.ibytes.fetch_add(bytes, Ordering::Relaxed);
        }
        n
    }

    fn tx_one(&self, port: u16, _queue: u16, buf: SoftFrame) -> std::result::Result<(), SoftFrame> {
        let Some(p) = self.ports.get(port as usize) else {
            return Err(buf);
        };
        let budget = p.tx_fail_budget.load(Ordering::Relaxed);
        if budget > 0 {
            p.tx_fail_budget.store(budget - 1, Ordering::Relaxed);
            p.counters.oerrors.fetch_add(1, Ordering::Relaxed);
            return Err(buf);
        }

        p.counters.opackets.fetch_add(1, Ordering::Relaxed);
        p.counters.obytes.fetch_add(buf.pkt_len() as u64, Ordering::Relaxed);
        // the capture keeps the newest frames
        drop(p.tx.force_push(buf));
        Ok(())
    }

    fn start(&self, port: u16) -> Result<()> {
        let p = self.port(port)?;
        p.start_calls.fetch_add(1, Ordering::AcqRel);
        p.started.store(true, Ordering::Release);
        debug!("{}: started", p.name);
        Ok(())
    }

    fn stop(&self, port: u16) -> Result<()> {
        let p = self.port(port)?;
        p.stop_calls.fetch_add(1, Ordering::AcqRel);
        p.started.store(false, Ordering::Release);
        debug!("{}: stopped", p.name);
        Ok(())
    }

    fn close(&self, port: u16) -> Result<()> {
        let p = self.port(port)?;
        p.close_calls.fetch_add(1, Ordering::AcqRel);
        debug!("{}: closed", p.name);
        Ok(())
    }

    fn info(&self, port: u16) -> Result<DeviceInfo> {
        self.port(port)?;
        Ok(DeviceInfo {
            driver_name: "net_soft".to_string(),
            socket_id: self.config.socket_id,
            max_rx_queues: self.config.queues,
            max_tx_queues: self.config.queues,
        })
    }

    fn stats(&self, port: u16) -> Result<PortStats> {
        Ok(self.port(port)?.counters.snapshot())
    }

    fn xstats(&self, port: u16) -> Result<Vec<(String, u64)>> {
        let s = self.stats(port)?;
        Ok(vec![
            ("rx_good_packets".to_string(), s.ipackets),
            ("tx_good_packets".to_string(), s.opackets),
            ("rx_good_bytes".to_string(), s.ibytes),
            ("tx_good_bytes".to_string(), s.obytes),
            ("rx_missed_errors".to_string(), s.imissed),
            ("tx_errors".to_string(), s.oerrors),
            ("rx_mbuf_allocation_errors".to_string(), s.rx_nombuf),
        ])
    }

    fn stats_reset(&self, port: u16) {
        if let Some(p) = self.ports.get(port as usize) {
            p.counters.reset();
        }
    }

    fn supports_rx_interrupts(&self, _port: u16) -> bool {
        self.config.interrupts
    }

    fn rx_intr_register(&self, port: u16, queue: u16) -> Result<()> {
        if !self.config.interrupts {
            return Err(Error::Unsupported("RX interrupts"));
        }
        let q = self
            .queue(port, queue)
            .ok_or_else(|| Error::Config(format!("no such queue {port}:{queue}")))?;
        q.intr_registered.store(true, Ordering::Release);
        Ok(())
    }

    fn rx_intr_enable(&self, port: u16, queue: u16) {
        if let Some(q) = self.queue(port, queue) {
            q.intr_enabled.store(true, Ordering::Release);
        }
    }

    fn rx_intr_disable(&self, port: u16, queue: u16) {
        if let Some(q) = self.queue(port, queue) {
            q.intr_enabled.store(false, Ordering::Release);
        }
    }

    fn wait_rx_event(&self, port: u16, queue: u16, timeout: Duration) -> bool {
        let Some(q) = self.queue(port, queue) else {
            return false;
        };
        if !q.intr_registered.load(Ordering::Acquire) {
            std::thread::sleep(timeout);
            return false;
        }

        let deadline = Instant::now() + timeout;
        let mut pending = q.event.pending.lock();
        while !*pending && q.rx.is_empty() {
            if q.event.cv.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        let woke = *pending || !q.rx.is_empty();
        *pending = false;
        woke
    }

    fn post_start(&self, port: u16, _info: &DeviceInfo, _threads: u16) {
        if let Some(p) = self.ports.get(port as usize) {
            p.post_start_calls.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn process_role(&self) -> ProcessRole {
        self.config.role
    }

    fn current_socket_id(&self) -> Option<u32> {
        self.config.thread_socket_id
    }

    fn delay_us(&self, us: u32) {
        match &self.clock {
            Clock::Manual { cycles, hz } => {
                cycles.fetch_add(us as u64 * (*hz / 1_000_000), Ordering::AcqRel);
                std::thread::yield_now();
            }
            Clock::Monotonic(_) => {
                let until = Instant::now() + Duration::from_micros(us as u64);
                while Instant::now() < until {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rx_burst_and_free() {
        let dev = SoftDevice::new(SoftConfig {
            frame_pool_size: 64,
            ..Default::default()
        });
        for i in 0..40u8 {
            dev.inject(0, 0, &[i; 60]).unwrap();
        }
        let mut burst = Burst::new();
        assert_eq!(dev.rx_burst(0, 0, &mut burst), 32);
        assert_eq!(burst[5].data()[0], 5);
        assert_eq!(dev.stats(0).unwrap().ipackets, 32);
        burst.clear();
        assert_eq!(dev.frames_in_use(), 8);
        assert_eq!(dev.rx_burst(0, 0, &mut burst), 8);
        drop(burst);
        assert_eq!(dev.frames_in_use(), 0);
    }

    #[test]
    fn test_exhaustion_and_overflow_are_counted() {
        let dev = SoftDevice::new(SoftConfig {
            frame_pool_size: 4,
            rx_queue_size: 2,
            ..Default::default()
        });
        dev.inject(0, 0, &[0; 60]).unwrap();
        dev.inject(0, 0, &[0; 60]).unwrap();
        dev.inject(0, 0, &[0; 60]).unwrap();
        assert_eq!(dev.stats(0).unwrap().imissed, 1);
        let _held: Vec<_> = (0..2).map(|_| dev.alloc_frame(&[1]).unwrap()).collect();
        assert!(matches!(dev.inject(0, 0, &[0; 60]), Err(Error::NoMemory)));
        assert_eq!(dev.stats(0).unwrap().rx_nombuf, 1);
    }

    #[test]
    fn test_rx_event_wakes_waiter() {
        let dev = Arc::new(SoftDevice::new(SoftConfig::default()));
        dev.rx_intr_register(0, 0).unwrap();
        dev.rx_intr_enable(0, 0);

        let waiter = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || dev.wait_rx_event(0, 0, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        dev.inject(0, 0, &[0; 60]).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let dev = SoftDevice::new(SoftConfig::default());
        dev.rx_intr_register(0, 0).unwrap();
        dev.rx_intr_enable(0, 0);
        assert!(!dev.wait_rx_event(0, 0, Duration::from_millis(5)));
    }

    #[test]
    fn test_manual_clock() {
        let dev = SoftDevice::new(SoftConfig {
            clock: SoftClock::Manual { hz: 1_000_000_000 },
            ..Default::default()
        });
        assert_eq!(dev.cycles(), 0);
        dev.delay_us(10);
        assert_eq!(dev.cycles(), 10_000);
        dev.advance_clock(5);
        assert_eq!(dev.cycles(), 10_005);
    }
}
