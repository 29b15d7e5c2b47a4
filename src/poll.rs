//! The receive loop.
//!
//! Every iteration fetches one burst without blocking, adapts to idle
//! queues, hands the burst to the pipeline packet by packet and does the
//! periodic bookkeeping. The stop flag is only looked at between bursts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arrayvec::ArrayVec;
use tracing::{debug, error};

use crate::api::{BufferHandle, Pipeline, PollDevice, Result, unlikely};
use crate::bypass::BypassChannel;
use crate::clock;
use crate::config::{IdlePolicy, OpMode};
use crate::errors::Error;
use crate::packet::{BypassPolicy, ReleasePolicy};
use crate::worker::ReceiveWorker;

/// Wall-clock period of the pipeline timeout callback on idle queues.
pub const IDLE_TIMEOUT_MS: u64 = 100;

/// What the loop does after a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleStep {
    /// Handle the burst.
    Process,
    /// Poll again right away.
    Retry,
    /// Busy-wait, then go on with the (empty) burst.
    DelayThenProcess(u32),
    /// Arm the RX interrupt, wait for it at most this long, then poll again.
    WaitForInterrupt(Duration),
}

/// Empty-poll streak tracking of one queue.
#[derive(Clone, Debug)]
pub struct IdleHeuristic {
    policy: IdlePolicy,
    interrupts: bool,
    zero_polls: u32,
}

impl IdleHeuristic {
    pub fn new(policy: IdlePolicy, interrupts: bool) -> Self {
        Self {
            policy,
            interrupts,
            zero_polls: 0,
        }
    }

    pub fn zero_polls(&self) -> u32 {
        self.zero_polls
    }

    /// Backoff for the current empty-poll streak.
    pub fn sleep_hint_us(&self) -> u32 {
        if self.zero_polls < self.policy.zero_poll_count_to_sleep {
            self.policy.min_sleep_us
        } else {
            self.policy.standard_sleep_us
        }
    }

    #[inline]
    pub fn on_poll(&mut self, nb_rx: usize) -> IdleStep {
        if nb_rx > 0 {
            self.zero_polls = 0;
            return IdleStep::Process;
        }
        if !self.interrupts {
            return IdleStep::Retry;
        }

        self.zero_polls = self.zero_polls.saturating_add(1);
        if self.zero_polls <= self.policy.min_zero_poll_count {
            return IdleStep::Retry;
        }

        let hint = self.sleep_hint_us();
        if hint < self.policy.standard_sleep_us {
            IdleStep::DelayThenProcess(hint)
        } else {
            IdleStep::WaitForInterrupt(self.policy.max_epoll_timeout)
        }
    }
}

/// Fires at most once per [`IDLE_TIMEOUT_MS`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeoutTicker {
    last_msec: u64,
}

impl TimeoutTicker {
    pub fn due(&mut self, now_msec: u64) -> bool {
        if now_msec > self.last_msec + IDLE_TIMEOUT_MS {
            self.last_msec = now_msec;
            return true;
        }
        false
    }
}

/// Fires whenever the whole second changes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DumpTicker {
    last_secs: u64,
}

impl DumpTicker {
    pub fn due(&mut self, now_secs: u64) -> bool {
        if now_secs != self.last_secs {
            self.last_secs = now_secs;
            return true;
        }
        false
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub submitted: usize,
    /// Buffers freed because no packet could be acquired for them.
    pub freed: usize,
}

/// Drains `burst` in order: each buffer is bound by `acquire` and handed to
/// `submit`. A buffer `acquire` hands back is dropped. The first submit
/// error stops the dispatch, the buffers not submitted yet are dropped.
pub fn dispatch_burst<B, P, E, const N: usize>(
    burst: &mut ArrayVec<B, N>,
    mut acquire: impl FnMut(B) -> std::result::Result<P, B>,
    mut submit: impl FnMut(P) -> std::result::Result<(), E>,
) -> std::result::Result<DispatchOutcome, E> {
    let mut outcome = DispatchOutcome::default();
    for buf in burst.drain(..) {
        match acquire(buf) {
            Ok(p) => {
                submit(p)?;
                outcome.submitted += 1;
            }
            Err(buf) => {
                drop(buf);
                outcome.freed += 1;
            }
        }
    }
    Ok(outcome)
}

impl<D: PollDevice> ReceiveWorker<D> {
    fn loop_init(&mut self) -> Result<()> {
        self.running = true;
        let port = self.settings.port_id;
        if self.settings.op_mode == OpMode::EthDev {
            self.device().stats_reset(port);
        }
        if self.settings.interrupts {
            self.manager.interrupts_rx_enable(port, self.queue_id)?;
        }
        Ok(())
    }

    fn handle_timeout_on_idle<P: Pipeline<D>>(&mut self, pipeline: &mut P) {
        let now = self.packets.machine_start().now(self.device());
        if self.timeout.due(now.as_millis()) {
            pipeline.handle_timeout();
        }
    }

    /// Polls the queue until `stop` is raised.
    ///
    /// In device mode the thread then waits at the shutdown barrier; in ring
    /// mode it keeps going until the RX ring is empty. A pipeline failure
    /// ends the loop with [`Error::Pipeline`].
    pub fn run<P: Pipeline<D>>(&mut self, pipeline: &mut P, stop: &AtomicBool) -> Result<()> {
        self.loop_init()?;
        let port = self.settings.port_id;
        let queue = self.queue_id;

        loop {
            if unlikely(stop.load(Ordering::Relaxed)) {
                match self.settings.op_mode {
                    OpMode::EthDev => {
                        debug!("{}-Q{}: stopping", self.settings.iface, queue);
                        self.handle_shutdown();
                        break;
                    }
                    OpMode::Ring if self.rx_ring().is_none_or(|r| r.is_empty()) => {
                        debug!("{}-Q{}: stopping", self.settings.iface, queue);
                        self.dump_counters();
                        break;
                    }
                    OpMode::Ring => {}
                }
            }

            let nb_rx = match self.settings.op_mode {
                OpMode::EthDev => {
                    let nb_rx = self.manager.device().rx_burst(port, queue, &mut self.burst);
                    if nb_rx == 0 {
                        self.handle_timeout_on_idle(pipeline);
                    }
                    match self.idle.on_poll(nb_rx) {
                        IdleStep::Process => {}
                        IdleStep::Retry => continue,
                        IdleStep::DelayThenProcess(us) => self.device().delay_us(us),
                        IdleStep::WaitForInterrupt(timeout) => {
                            self.manager.interrupts_turn_on_off(port, queue, true);
                            self.device().wait_rx_event(port, queue, timeout);
                            self.manager.interrupts_turn_on_off(port, queue, false);
                            continue;
                        }
                    }
                    nb_rx
                }
                OpMode::Ring => {
                    let nb_rx = match &self.rings {
                        Some(rings) => rings.rx.dequeue_burst(&mut self.burst),
                        None => 0,
                    };
                    if nb_rx == 0 {
                        self.handle_timeout_on_idle(pipeline);
                    }
                    nb_rx
                }
            };

            self.counters.pkts += nb_rx as u64;
            self.counters.bytes += self.burst.iter().map(|b| b.pkt_len() as u64).sum::<u64>();

            let tx_ring = self.rings.as_ref().and_then(|r| r.tx.clone());
            let bypass: Option<BypassChannel> = self.rings.as_ref().and_then(|r| r.bypass.clone());
            let packets = &mut self.packets;
            let dispatched = dispatch_burst(
                &mut self.burst,
                |buf| packets.acquire(buf),
                |mut p| {
                    if let Some(tx) = &tx_ring {
                        p.set_release_policy(ReleasePolicy::EnqueueThenFree(tx.clone()));
                    }
                    if let Some(channel) = &bypass {
                        p.set_bypass_policy(BypassPolicy::Active(channel.clone()));
                    }
                    pipeline.process(p)
                },
            );
            match dispatched {
                Ok(outcome) if outcome.freed > 0 => {
                    debug!(
                        "{}-Q{}: {} packets dropped, no packet object available",
                        self.settings.iface, queue, outcome.freed
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!("{}-Q{}: {}", self.settings.iface, queue, e);
                    self.running = false;
                    return Err(Error::Pipeline);
                }
            }

            if self.dump.due(clock::counter_secs(self.device())) {
                self.dump_counters();
            }
            self.shared.sync_if_signalled(&self.counters);
        }

        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CycleCounter, DeviceManager};
    use crate::config::{CopyMode, IfaceConfig, IfaceSettings, QueueRings};
    use crate::errors::PipelineError;
    use crate::packet::PooledPacket;
    use crate::ring::Ring;
    use crate::soft::{SoftClock, SoftConfig, SoftDevice};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_dispatch_skips_failed_acquisition() {
        let mut burst: ArrayVec<u32, 32> = [1, 2, 3, 4].into_iter().collect();
        let mut seen = Vec::new();
        let outcome = dispatch_burst(
            &mut burst,
            |b| if b == 3 { Err(b) } else { Ok(b * 10) },
            |p| {
                seen.push(p);
                Ok::<(), ()>(())
            },
        )
        .unwrap();
        assert_eq!(outcome, DispatchOutcome { submitted: 3, freed: 1 });
        assert_eq!(seen, vec![10, 20, 40]);
        assert!(burst.is_empty());
    }

    #[test]
    fn test_dispatch_stops_on_submit_error() {
        let mut burst: ArrayVec<u32, 32> = (0..8).collect();
        let mut seen = Vec::new();
        let rv = dispatch_burst(
            &mut burst,
            Ok,
            |p| {
                if p == 2 {
                    return Err("backpressure");
                }
                seen.push(p);
                Ok(())
            },
        );
        assert_eq!(rv, Err("backpressure"));
        assert_eq!(seen, vec![0, 1]);
        assert!(burst.is_empty());
    }

    #[test]
    fn test_idle_backoff_tiers() {
        let policy = IdlePolicy {
            min_zero_poll_count: 2,
            zero_poll_count_to_sleep: 5,
            min_sleep_us: 1,
            standard_sleep_us: 100,
            max_epoll_timeout: Duration::from_millis(500),
        };
        let mut h = IdleHeuristic::new(policy, true);
        assert_eq!(h.on_poll(0), IdleStep::Retry);
        assert_eq!(h.on_poll(0), IdleStep::Retry);
        assert_eq!(h.on_poll(0), IdleStep::DelayThenProcess(1));
        assert_eq!(h.on_poll(0), IdleStep::DelayThenProcess(1));
        for _ in 0..10 {
            assert_eq!(h.on_poll(0), IdleStep::WaitForInterrupt(Duration::from_millis(500)));
        }
        assert_eq!(h.on_poll(3), IdleStep::Process);
        assert_eq!(h.zero_polls(), 0);
        assert_eq!(h.on_poll(0), IdleStep::Retry);
    }

    #[test]
    fn test_default_policy_goes_straight_to_interrupts() {
        let mut h = IdleHeuristic::new(IdlePolicy::default(), true);
        for _ in 0..10 {
            assert_eq!(h.on_poll(0), IdleStep::Retry);
        }
        assert!(matches!(h.on_poll(0), IdleStep::WaitForInterrupt(_)));
    }

    #[test]
    fn test_polling_mode_never_backs_off() {
        let mut h = IdleHeuristic::new(IdlePolicy::default(), false);
        for _ in 0..100 {
            assert_eq!(h.on_poll(0), IdleStep::Retry);
        }
        assert_eq!(h.zero_polls(), 0);
    }

    #[test]
    fn test_tickers() {
        let mut t = TimeoutTicker::default();
        assert!(t.due(1000));
        assert!(!t.due(1100));
        assert!(t.due(1101));

        let mut d = DumpTicker::default();
        assert!(d.due(5));
        assert!(!d.due(5));
        assert!(d.due(6));
    }

    struct Counting {
        seen: Vec<usize>,
        stop_after: usize,
        fail_at: Option<usize>,
        timeouts: usize,
        stop: Arc<AtomicBool>,
    }

    impl Counting {
        fn new(stop: &Arc<AtomicBool>, stop_after: usize) -> Self {
            Self {
                seen: Vec::new(),
                stop_after,
                fail_at: None,
                timeouts: 0,
                stop: Arc::clone(stop),
            }
        }
    }

    impl<D: PollDevice> Pipeline<D> for Counting {
        fn process(&mut self, packet: PooledPacket<D>) -> std::result::Result<(), PipelineError> {
            if self.fail_at == Some(self.seen.len()) {
                return Err(PipelineError::new("full"));
            }
            self.seen.push(packet.data()[0] as usize);
            if self.seen.len() >= self.stop_after {
                self.stop.store(true, Ordering::Relaxed);
            }
            Ok(())
        }

        fn handle_timeout(&mut self) {
            self.timeouts += 1;
        }
    }

    fn worker(
        dev: SoftDevice,
        settings: IfaceSettings,
    ) -> (Arc<DeviceManager<SoftDevice>>, ReceiveWorker<SoftDevice>) {
        let mgr = Arc::new(DeviceManager::new(dev));
        let q = IfaceConfig::new(settings).into_queues().unwrap().pop().unwrap();
        let w = ReceiveWorker::init(Arc::clone(&mgr), q).unwrap();
        (mgr, w)
    }

    fn settings() -> IfaceSettings {
        IfaceSettings {
            iface: "soft0".into(),
            packet_pool_size: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_until_stopped() {
        let (mgr, mut w) = worker(SoftDevice::new(SoftConfig::default()), settings());
        for i in 0..40u8 {
            mgr.device().inject(0, 0, &[i; 64]).unwrap();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = Counting::new(&stop, 40);
        w.run(&mut pipeline, &stop).unwrap();

        assert_eq!(pipeline.seen, (0..40).collect::<Vec<_>>());
        assert_eq!(w.counters().pkts, 40);
        assert_eq!(w.counters().bytes, 40 * 64);
        assert_eq!(mgr.device().frames_in_use(), 0);
        assert_eq!(mgr.device().stop_calls(0), 1);
        assert!(!w.is_running());
    }

    #[test]
    fn test_pipeline_failure_frees_rest_of_burst() {
        let (mgr, mut w) = worker(SoftDevice::new(SoftConfig::default()), settings());
        for i in 0..10u8 {
            mgr.device().inject(0, 0, &[i; 64]).unwrap();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = Counting::new(&stop, usize::MAX);
        pipeline.fail_at = Some(4);
        assert!(matches!(w.run(&mut pipeline, &stop), Err(Error::Pipeline)));
        assert_eq!(pipeline.seen, vec![0, 1, 2, 3]);
        assert_eq!(mgr.device().frames_in_use(), 0);
        // no barrier on failure
        assert_eq!(mgr.device().stop_calls(0), 0);
    }

    #[test]
    fn test_exhausted_packet_pool_drops_buffers() {
        struct Hoarding {
            held: Vec<PooledPacket<SoftDevice>>,
            stop: Arc<AtomicBool>,
        }
        impl Pipeline<SoftDevice> for Hoarding {
            fn process(&mut self, p: PooledPacket<SoftDevice>) -> std::result::Result<(), PipelineError> {
                self.held.push(p);
                self.stop.store(true, Ordering::Relaxed);
                Ok(())
            }
        }

        let (mgr, mut w) = worker(SoftDevice::new(SoftConfig::default()), settings());
        for i in 0..12u8 {
            mgr.device().inject(0, 0, &[i; 64]).unwrap();
        }
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = Hoarding {
            held: Vec::new(),
            stop: Arc::clone(&stop),
        };
        w.run(&mut pipeline, &stop).unwrap();
        // pool of 8 packets: 8 submitted, 4 buffers freed
        assert_eq!(pipeline.held.len(), 8);
        assert_eq!(mgr.device().frames_in_use(), 8);
        drop(pipeline);
        assert_eq!(mgr.device().frames_in_use(), 0);
    }

    #[test]
    fn test_idle_timeout_fires_without_traffic() {
        struct Ticking {
            mgr: Arc<DeviceManager<SoftDevice>>,
            timeouts: usize,
            stop: Arc<AtomicBool>,
        }
        impl Pipeline<SoftDevice> for Ticking {
            fn process(&mut self, _p: PooledPacket<SoftDevice>) -> std::result::Result<(), PipelineError> {
                Ok(())
            }
            fn handle_timeout(&mut self) {
                self.timeouts += 1;
                // 101 ms, so the next empty poll fires again
                let hz = self.mgr.device().cycles_hz();
                self.mgr.device().advance_clock(hz / 1000 * 101);
                if self.timeouts == 3 {
                    self.stop.store(true, Ordering::Relaxed);
                }
            }
        }

        let dev = SoftDevice::new(SoftConfig {
            clock: SoftClock::Manual { hz: 1_000_000_000 },
            ..Default::default()
        });
        let (mgr, mut w) = worker(dev, settings());
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = Ticking {
            mgr: Arc::clone(&mgr),
            timeouts: 0,
            stop: Arc::clone(&stop),
        };
        w.run(&mut pipeline, &stop).unwrap();
        assert_eq!(pipeline.timeouts, 3);
    }

    #[test]
    fn test_interrupt_wakeup() {
        let (mgr, mut w) = worker(
            SoftDevice::new(SoftConfig::default()),
            IfaceSettings {
                interrupts: true,
                ..settings()
            },
        );
        let stop = Arc::new(AtomicBool::new(false));
        let mut pipeline = Counting::new(&stop, 1);
        let injector = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                mgr.device().inject(0, 0, &[7; 64]).unwrap();
            })
        };
        w.run(&mut pipeline, &stop).unwrap();
        injector.join().unwrap();
        assert_eq!(pipeline.seen, vec![7]);
        assert!(!mgr.device().rx_intr_enabled(0, 0));
    }

    #[test]
    fn test_ring_mode_drains_before_stopping() {
        let dev = Arc::new(SoftDevice::new(SoftConfig::default()));
        let rx = triomphe::Arc::new(Ring::new("rx0", 64));
        let tx = triomphe::Arc::new(Ring::new("tx0", 64));
        for i in 0..5u8 {
            rx.enqueue(dev.alloc_frame(&[i; 64]).unwrap()).unwrap();
        }
        let mgr = Arc::new(DeviceManager::from_arc(Arc::clone(&dev)));
        let cfg = IfaceConfig::new(IfaceSettings {
            op_mode: OpMode::Ring,
            copy_mode: CopyMode::Tap,
            ..settings()
        })
        .with_rings(vec![QueueRings::new(rx.clone()).with_tx(tx.clone())]);
        let q = cfg.into_queues().unwrap().pop().unwrap();
        let mut w = ReceiveWorker::init(Arc::clone(&mgr), q).unwrap();

        let stop = Arc::new(AtomicBool::new(true));
        let mut pipeline = Counting::new(&stop, usize::MAX);
        w.run(&mut pipeline, &stop).unwrap();
        assert_eq!(pipeline.seen, vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
        assert_eq!(tx.len(), 5);
        assert_eq!(dev.stop_calls(0), 0);
    }
}
