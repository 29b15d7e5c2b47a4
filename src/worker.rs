//! Receive thread state and lifecycle.
//!
//! The thread framework drives a [`ReceiveWorker`] through
//! [`ReceiveWorker::init`], [`ReceiveWorker::run`],
//! [`ReceiveWorker::exit_stats`] and [`ReceiveWorker::deinit`], in that
//! order, once per queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use tracing::{error, info, warn};
use triomphe::Arc as TArc;

use crate::api::{Burst, DeviceManager, PollDevice, Result};
use crate::barrier::{CheckIn, WorkerSync};
use crate::config::{CopyMode, IfaceSettings, OpMode, QueueConfig, QueueRings};
use crate::errors::Error;
use crate::packet::PacketManager;
use crate::poll::{DumpTicker, IdleHeuristic, TimeoutTicker};
use crate::ring::Ring;
use crate::stats::{LiveDevice, SharedCounters, ThreadCounters};

pub struct ReceiveWorker<D: PollDevice> {
    pub(crate) manager: Arc<DeviceManager<D>>,
    pub(crate) settings: IfaceSettings,
    pub(crate) queue_id: u16,
    pub(crate) rings: Option<QueueRings<D::Buffer>>,
    pub(crate) packets: PacketManager<D>,
    pub(crate) sync: Arc<WorkerSync>,
    pub(crate) livedev: Arc<LiveDevice>,
    pub(crate) counters: ThreadCounters,
    pub(crate) shared: Arc<SharedCounters>,
    pub(crate) idle: IdleHeuristic,
    pub(crate) timeout: TimeoutTicker,
    pub(crate) dump: DumpTicker,
    pub(crate) burst: Burst<D::Buffer>,
    pub(crate) running: bool,
}

impl<D: PollDevice> ReceiveWorker<D> {
    /// Sets up the thread serving `cfg.queue_id`.
    ///
    /// In device mode the last queue starts the port, so every queue must be
    /// initialized before any of them runs.
    pub fn init(manager: Arc<DeviceManager<D>>, cfg: QueueConfig<D::Buffer>) -> Result<Self> {
        let QueueConfig {
            settings,
            queue_id,
            rings,
            sync,
            livedev,
            numa_mismatch,
        } = cfg;
        let device = Arc::clone(manager.device());

        check_numa(&settings, &*device, &numa_mismatch);

        match settings.op_mode {
            OpMode::EthDev => {
                let port = settings.port_id;
                if queue_id + 1 == settings.threads {
                    device
                        .start(port)
                        .map_err(|e| startup_error(&settings.iface, "device start", e))?;
                    let info = device
                        .info(port)
                        .map_err(|e| startup_error(&settings.iface, "device info", e))?;
                    device.post_start(port, &info, settings.threads);
                }

                let info = device
                    .info(port)
                    .map_err(|e| startup_error(&settings.iface, "device info", e))?;
                let mismatched = numa_mismatch.load(Ordering::Acquire);
                match settings.socket_id.or(info.socket_id) {
                    Some(node) if mismatched > 0 => warn!(
                        "{}: NIC is on NUMA {}, {} threads on different NUMA node(s)",
                        settings.iface, node, mismatched
                    ),
                    None => info!(
                        "{}: unable to determine NIC's NUMA node, degraded performance can be expected",
                        settings.iface
                    ),
                    _ => {}
                }

                if settings.interrupts && !device.supports_rx_interrupts(port) {
                    error!("{}: interrupt mode is not supported by {}", settings.iface, info.driver_name);
                    return Err(Error::Unsupported("RX interrupts"));
                }
            }
            OpMode::Ring => {
                if rings.is_none() {
                    error!("{}: no rings for queue {}", settings.iface, queue_id);
                    return Err(Error::Config(format!(
                        "{}: no rings for queue {}",
                        settings.iface, queue_id
                    )));
                }
            }
        }

        let mut packets = PacketManager::new(
            &format!("{}_q{}", settings.iface, queue_id),
            settings.packet_pool_size,
            Arc::clone(&device),
            Arc::clone(&livedev),
            settings.copy_mode,
            settings.checksum_mode,
        )
        .with_port(settings.port_id);
        if settings.op_mode == OpMode::EthDev && settings.copy_mode != CopyMode::None {
            if let Some(out) = settings.out_port_id {
                packets = packets.with_tx_target(out, queue_id);
            }
        }

        let idle = IdleHeuristic::new(settings.idle, settings.interrupts);
        Ok(Self {
            manager,
            settings,
            queue_id,
            rings,
            packets,
            sync,
            livedev,
            counters: ThreadCounters::default(),
            shared: Arc::new(SharedCounters::default()),
            idle,
            timeout: TimeoutTicker::default(),
            dump: DumpTicker::default(),
            burst: Burst::new(),
            running: false,
        })
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn port_id(&self) -> u16 {
        self.settings.port_id
    }

    pub fn settings(&self) -> &IfaceSettings {
        &self.settings
    }

    pub fn counters(&self) -> &ThreadCounters {
        &self.counters
    }

    /// Published counters, refreshed after [`SharedCounters::request_sync`].
    pub fn shared_counters(&self) -> Arc<SharedCounters> {
        Arc::clone(&self.shared)
    }

    pub fn livedev(&self) -> &Arc<LiveDevice> {
        &self.livedev
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub(crate) fn device(&self) -> &D {
        self.manager.device()
    }

    pub(crate) fn rx_ring(&self) -> Option<&TArc<Ring<D::Buffer>>> {
        self.rings.as_ref().map(|r| &r.rx)
    }

    /// Checks in at the shutdown barrier. Queue 0 stops the peer port when
    /// packets are forwarded, its own port otherwise.
    ///
    /// [`ReceiveWorker::run`] does this itself on a regular stop. A thread
    /// that left the loop with an error must still check in, or its peers
    /// wait forever.
    pub fn handle_shutdown(&mut self) {
        let device = Arc::clone(self.manager.device());
        if self.sync.check_in(self.queue_id, |us| device.delay_us(us)) == CheckIn::Leader {
            let port = match (self.settings.copy_mode, self.settings.out_port_id) {
                (CopyMode::Tap | CopyMode::Ips, Some(out)) => out,
                _ => self.settings.port_id,
            };
            self.manager.stop_port(port);
        }
        self.dump_counters();
    }

    pub fn dump_counters(&mut self) {
        match self.settings.op_mode {
            OpMode::EthDev => self.dump_counters_ethdev(),
            OpMode::Ring => self.dump_counters_ring(),
        }
        self.shared.publish(&self.counters);
    }

    fn dump_counters_ethdev(&mut self) {
        // drops are only reported per port, so queue 0 accounts for them
        if self.queue_id != 0 {
            return;
        }
        let stats = match self.device().stats(self.settings.port_id) {
            Ok(s) => s,
            Err(e) => {
                error!("{}: failed to get stats: {}", self.settings.iface, e);
                return;
            }
        };
        let rx_errs = stats.imissed + stats.ierrors + stats.rx_nombuf;
        self.counters.rx_errs = rx_errs;
        self.counters.imissed = stats.imissed;
        self.counters.no_mbufs = stats.rx_nombuf;
        self.counters.ierrors = stats.ierrors;
        self.counters.tx_errs = stats.oerrors;
        self.livedev.set_pkts(stats.ipackets + rx_errs);
        self.livedev.set_drop(rx_errs);
    }

    fn dump_counters_ring(&mut self) {
        let Some(rings) = &self.rings else {
            return;
        };
        let rx = rings.rx.stats();
        self.counters.imissed = (rx.enq_success + rx.enq_fail).saturating_sub(rx.deq_success);
        if let Some(tx) = &rings.tx {
            self.counters.tx_errs = tx.stats().enq_fail;
        }
    }

    /// Packets as seen by the capture, drops included on queue 0.
    pub fn captured_packets(&self) -> u64 {
        match (self.settings.op_mode, self.queue_id) {
            (OpMode::EthDev, 0) => self.counters.pkts + self.counters.rx_errs,
            _ => self.counters.pkts,
        }
    }

    pub fn exit_stats(&mut self) {
        self.dump_counters();
        match self.settings.op_mode {
            OpMode::EthDev => self.exit_stats_ethdev(),
            OpMode::Ring => self.exit_stats_ring(),
        }
    }

    fn exit_stats_ethdev(&self) {
        if self.queue_id != 0 {
            return;
        }
        let iface = &self.settings.iface;
        let port = self.settings.port_id;
        match self.device().xstats(port) {
            Ok(xstats) => {
                for (name, value) in xstats.iter().filter(|(_, v)| *v > 0) {
                    info!("Port {} ({}) - {}: {}", port, iface, name, value);
                }
            }
            Err(e) => error!("{}: failed to get extended stats: {}", iface, e),
        }

        let stats = match self.device().stats(port) {
            Ok(s) => s,
            Err(e) => {
                error!("{}: failed to get stats ({})", iface, e);
                return;
            }
        };
        info!(
            "{}: total RX stats: packets {} bytes: {} missed: {} errors: {} nombufs: {}",
            iface, stats.ipackets, stats.ibytes, stats.imissed, stats.ierrors, stats.rx_nombuf
        );
        if matches!(self.settings.copy_mode, CopyMode::Tap | CopyMode::Ips) {
            info!(
                "{}: total TX stats: packets {} bytes: {} errors: {}",
                iface, stats.opackets, stats.obytes, stats.oerrors
            );
        }
    }

    fn exit_stats_ring(&self) {
        let pkts = self.captured_packets();
        self.livedev.add_pkts(pkts);
        let ring = self.rx_ring().map_or("?", |r| r.name());
        info!(
            "({}-Q{}): Total RX stats of {}: packets {}",
            self.settings.iface, self.queue_id, ring, pkts
        );
    }

    pub fn deinit(self) -> Result<()> {
        if self.settings.op_mode != OpMode::EthDev || self.queue_id != 0 {
            return Ok(());
        }
        let port = self.settings.port_id;
        let info = self.device().info(port).inspect_err(|e| {
            error!("{}: error ({}) when getting device info", self.settings.iface, e);
        })?;
        self.device().pre_stop(port, &info);
        self.manager.stop_port(port);
        if let (CopyMode::Tap | CopyMode::Ips, Some(out)) = (self.settings.copy_mode, self.settings.out_port_id) {
            self.manager.stop_port(out);
        }
        Ok(())
    }
}

fn check_numa<D: PollDevice>(settings: &IfaceSettings, device: &D, counter: &AtomicU16) {
    let port_node = settings.socket_id.or_else(|| device.info(settings.port_id).ok()?.socket_id);
    if let (Some(port_node), Some(thread_node)) = (port_node, device.current_socket_id()) {
        if port_node != thread_node {
            counter.fetch_add(1, Ordering::AcqRel);
            info!(
                "{}: NIC is on NUMA {}, thread on NUMA {}",
                settings.iface, port_node, thread_node
            );
        }
    }
}

fn startup_error(iface: &str, op: &'static str, e: Error) -> Error {
    error!("{}: error ({}) during {}", iface, e, op);
    match e {
        Error::Generic(source) => Error::device(iface, op, source),
        other => other,
    }
}
