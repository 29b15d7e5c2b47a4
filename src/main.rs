use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use etherparse::PacketBuilder;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use triomphe::Arc as TArc;

use pmd_capture::api::{DeviceManager, Pipeline, PollDevice};
use pmd_capture::bypass::{BypassChannel, FlowKey, OffloadKind};
use pmd_capture::config::{ChecksumMode, CopyMode, IfaceConfig, IfaceSettings, OpMode, QueueRings};
use pmd_capture::errors::{Error, PipelineError};
use pmd_capture::flow::{DEFAULT_FLOW_TIMEOUT_SECS, FlowTable};
use pmd_capture::packet::{BAD_CHECKSUM, PooledPacket};
use pmd_capture::ring::Ring;
use pmd_capture::soft::{SoftConfig, SoftDevice, SoftFrame};
use pmd_capture::stats::SharedCounters;
use pmd_capture::worker::ReceiveWorker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-memory NIC fed by a traffic generator.
    Soft,
    /// DPDK poll-mode driver (needs the `dpdk` feature).
    Dpdk,
}

/// Command line options.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, value_enum, default_value_t = Backend::Soft)]
    backend: Backend,

    /// Capture interface, the EAL device name with the dpdk backend.
    #[clap(short, long, default_value = "soft0")]
    interface: String,

    /// Peer interface for the tap and ips copy modes.
    #[clap(long)]
    out_interface: Option<String>,

    /// Number of receive threads, one per queue.
    #[clap(short, long)]
    threads: Option<u16>,

    /// none, tap or ips.
    #[clap(long, default_value = "none")]
    copy_mode: CopyMode,

    /// enable, disable or offload.
    #[clap(long, default_value = "enable")]
    checksum_mode: ChecksumMode,

    /// ethdev or ring.
    #[clap(long, default_value = "ethdev")]
    op_mode: OpMode,

    /// Sleep on RX interrupts when the queues are idle.
    #[clap(long)]
    interrupts: bool,

    /// Offload flows to the fast path after this many packets (ring mode).
    #[clap(long)]
    bypass_after: Option<u64>,

    /// Generated packets per second (soft backend).
    #[clap(long, default_value_t = 10_000)]
    rate: u64,

    /// Number of distinct generated flows (soft backend).
    #[clap(long, default_value_t = 64)]
    flows: u16,

    /// Stop after this many seconds.
    #[clap(long)]
    duration: Option<u64>,

    /// Print per-thread instead of aggregated statistics.
    #[clap(short = 'S', long)]
    per_thread_stats: bool,

    /// Arguments passed to the DPDK EAL.
    #[clap(last = true)]
    eal_args: Vec<String>,
}

impl Args {
    fn threads(&self) -> u16 {
        self.threads
            .unwrap_or_else(|| num_cpus::get().clamp(1, 4) as u16)
    }

    fn settings(&self, port_id: u16, out_port_id: Option<u16>) -> IfaceSettings {
        IfaceSettings {
            iface: self.interface.clone(),
            port_id,
            out_iface: self.out_interface.clone(),
            out_port_id,
            threads: self.threads(),
            copy_mode: self.copy_mode,
            checksum_mode: self.checksum_mode,
            interrupts: self.interrupts,
            op_mode: self.op_mode,
            ..Default::default()
        }
    }
}

/// Flow tracking pipeline standing in for the inspection engine.
struct DemoPipeline {
    flows: FlowTable,
    bypass_after: Option<u64>,
    last_age_secs: i64,
}

impl DemoPipeline {
    fn new(bypass_after: Option<u64>) -> Self {
        Self {
            flows: FlowTable::new(DEFAULT_FLOW_TIMEOUT_SECS, bypass_after.is_some()),
            bypass_after,
            last_age_secs: 0,
        }
    }
}

impl<D: PollDevice> Pipeline<D> for DemoPipeline {
    fn process(&mut self, mut packet: PooledPacket<D>) -> Result<(), PipelineError> {
        let bad = packet.l3_csum() == Some(BAD_CHECKSUM) || packet.l4_csum() == Some(BAD_CHECKSUM);
        if !packet.ignore_checksum() && bad {
            packet.livedev().add_invalid_checksum();
            if packet.copy_mode() == CopyMode::Ips {
                packet.set_drop();
            }
            return Ok(());
        }

        let now = packet.ts().secs() as i64;
        let len = packet.len();
        let Some(key) = packet.decode().and_then(|info| info.key) else {
            return Ok(());
        };
        let flow = self.flows.lookup_or_insert(key, now);
        flow.touch(now, len);
        let mature = self.bypass_after.is_some_and(|n| flow.pkts() >= n);
        if mature && !flow.is_bypassed() && packet.can_bypass() {
            packet.bypass(Some(flow));
        }
        Ok(())
    }

    fn handle_timeout(&mut self) {
        let now = unix_secs();
        if now <= self.last_age_secs {
            return;
        }
        self.last_age_secs = now;
        let report = self.flows.age(now);
        if report.evicted > 0 {
            debug!(
                "flow aging: {} flows, {} bypassed, {} evicted",
                report.scanned, report.bypassed, report.evicted
            );
        }
    }
}

fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Inits every queue, runs one thread per queue and tears down once all of
/// them stopped.
fn run_capture<D: PollDevice>(
    manager: Arc<DeviceManager<D>>,
    cfg: IfaceConfig<D::Buffer>,
    bypass_after: Option<u64>,
    stop: Arc<AtomicBool>,
    per_thread_stats: bool,
) -> Result<()> {
    let iface = cfg.settings.iface.clone();
    let mut ports = vec![cfg.settings.port_id];
    if let (CopyMode::Tap | CopyMode::Ips, Some(out)) = (cfg.settings.copy_mode, cfg.settings.out_port_id) {
        ports.push(out);
    }
    let eth_dev = cfg.settings.op_mode == OpMode::EthDev;
    let queues = cfg.into_queues()?;

    let mut workers = Vec::with_capacity(queues.len());
    for q in queues {
        let queue_id = q.queue_id;
        let worker = ReceiveWorker::init(Arc::clone(&manager), q)
            .with_context(|| format!("{iface}-Q{queue_id}: init failed"))?;
        workers.push(worker);
    }

    let shared: Vec<Arc<SharedCounters>> = workers.iter().map(|w| w.shared_counters()).collect();
    let meter = spawn_meter(shared, Arc::clone(&stop), per_thread_stats);

    let mut handles = Vec::with_capacity(workers.len());
    for mut worker in workers {
        let stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("W#{:02}-{}", worker.queue_id() + 1, iface))
            .spawn(move || {
                let mut pipeline = DemoPipeline::new(bypass_after);
                let rv = worker.run(&mut pipeline, &stop);
                if rv.is_err() {
                    stop.store(true, Ordering::SeqCst);
                    if worker.settings().op_mode == OpMode::EthDev {
                        worker.handle_shutdown();
                    }
                }
                (worker, rv)
            })?;
        handles.push(handle);
    }

    let mut failure = None;
    for handle in handles {
        let (mut worker, rv) = handle
            .join()
            .map_err(|_| anyhow!("receive thread panicked"))?;
        if let Err(e) = rv {
            error!("{}-Q{}: {}", iface, worker.queue_id(), e);
            failure.get_or_insert(e);
        }
        worker.exit_stats();
        info!("{}-Q{}: captured {} packets", iface, worker.queue_id(), worker.captured_packets());
        worker.deinit()?;
    }
    meter
        .join()
        .map_err(|_| anyhow!("stats thread panicked"))?;
    if eth_dev {
        for port in ports {
            manager.close_port(port);
        }
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn spawn_meter(
    shared: Vec<Arc<SharedCounters>>,
    stop: Arc<AtomicBool>,
    per_thread: bool,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut old: Vec<u64> = vec![0; shared.len()];
        while !stop.load(Ordering::SeqCst) {
            shared.iter().for_each(|s| s.request_sync());
            thread::sleep(Duration::from_secs(1));
            let now: Vec<u64> = shared.iter().map(|s| s.snapshot().pkts).collect();
            if per_thread {
                for (q, (n, o)) in now.iter().zip(&old).enumerate() {
                    info!("Queue {} pkt/sec: {}", q, n.saturating_sub(*o));
                }
            } else {
                let delta: u64 = now.iter().zip(&old).map(|(n, o)| n.saturating_sub(*o)).sum();
                info!("Aggregated pkt/sec: {}", delta);
            }
            old = now;
        }
    })
}

/// Pre-built frames of the generated flows.
struct Traffic {
    flows: Vec<(FlowKey, Vec<u8>)>,
}

impl Traffic {
    fn new(n: u16) -> Result<Self> {
        let dst = Ipv4Addr::new(192, 168, 0, 1);
        let flows = (0..n.max(1))
            .map(|i| {
                let src = Ipv4Addr::new(10, 0, (i >> 8) as u8, i as u8);
                let src_port = 1024 + i;
                let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
                    .ipv4(src.octets(), dst.octets(), 64);
                let payload = [0x5a; 64];
                let mut frame = Vec::new();
                let (proto, dst_port) = match i % 2 {
                    0 => {
                        let builder = builder.tcp(src_port, 80, 1, 64240);
                        frame.reserve(builder.size(payload.len()));
                        builder.write(&mut frame, &payload)?;
                        (6, 80)
                    }
                    _ => {
                        let builder = builder.udp(src_port, 53);
                        frame.reserve(builder.size(payload.len()));
                        builder.write(&mut frame, &payload)?;
                        (17, 53)
                    }
                };
                let key = FlowKey {
                    src: IpAddr::V4(src),
                    dst: IpAddr::V4(dst),
                    src_port,
                    dst_port,
                    proto,
                    vlan_id: [0; 2],
                };
                Ok((key, frame))
            })
            .collect::<Result<_>>()?;
        Ok(Self { flows })
    }

    /// Calls `deliver(flow index, key, frame)` at about `rate` frames per
    /// second until `stop` is set.
    fn generate(&self, rate: u64, stop: &AtomicBool, mut deliver: impl FnMut(usize, &FlowKey, &[u8])) {
        let mut rng = rand::rng();
        let started = Instant::now();
        let mut sent = 0u64;
        while !stop.load(Ordering::Relaxed) {
            let due = (started.elapsed().as_micros() as u64).saturating_mul(rate) / 1_000_000;
            while sent < due {
                let idx = rng.random_range(0..self.flows.len());
                let (key, frame) = &self.flows[idx];
                deliver(idx, key, frame);
                sent += 1;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn run_soft(args: &Args, stop: Arc<AtomicBool>) -> Result<()> {
    let threads = args.threads();
    let forwarding = args.copy_mode != CopyMode::None;
    let dev = Arc::new(SoftDevice::new(SoftConfig {
        ports: if forwarding && args.op_mode == OpMode::EthDev { 2 } else { 1 },
        queues: threads,
        ..Default::default()
    }));
    let manager = Arc::new(DeviceManager::from_arc(Arc::clone(&dev)));
    let traffic = Arc::new(Traffic::new(args.flows)?);

    match args.op_mode {
        OpMode::EthDev => {
            let out_port = forwarding.then_some(1);
            let cfg = IfaceConfig::new(args.settings(0, out_port));
            let generator = {
                let dev = Arc::clone(&dev);
                let traffic = Arc::clone(&traffic);
                let stop = Arc::clone(&stop);
                let rate = args.rate;
                thread::spawn(move || {
                    traffic.generate(rate, &stop, |idx, _, frame| {
                        // the pool is shared with the TX capture, keep it drained
                        if out_port.is_some() && idx % 64 == 0 {
                            drop(dev.drain_tx(1));
                        }
                        if dev.inject(0, (idx % threads as usize) as u16, frame).is_err() {
                            debug!("soft0: no free frame");
                        }
                    })
                })
            };
            let rv = run_capture(manager, cfg, None, Arc::clone(&stop), args.per_thread_stats);
            stop.store(true, Ordering::SeqCst);
            generator
                .join()
                .map_err(|_| anyhow!("generator thread panicked"))?;
            if let Some(out) = out_port {
                info!("{}: {} frames forwarded", dev.port_name(out)?, dev.stats(out)?.opackets);
            }
            rv
        }
        OpMode::Ring => run_soft_rings(args, dev, manager, traffic, stop),
    }
}

/// Ring mode on the soft device: this process plays the primary that owns
/// the NIC, feeding the RX rings and serving TX and offload task rings.
fn run_soft_rings(
    args: &Args,
    dev: Arc<SoftDevice>,
    manager: Arc<DeviceManager<SoftDevice>>,
    traffic: Arc<Traffic>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let threads = args.threads() as usize;
    let mut rings = Vec::with_capacity(threads);
    for q in 0..threads {
        let mut r = QueueRings::new(TArc::new(Ring::new(format!("rx_ring_{q}"), 1024)));
        if args.copy_mode != CopyMode::None {
            r = r.with_tx(TArc::new(Ring::new(format!("tx_ring_{q}"), 1024)));
        }
        if args.bypass_after.is_some() {
            r = r.with_bypass(BypassChannel::new(&format!("tasks_ring_{q}"), 1024, 1024));
        }
        rings.push(r);
    }
    let rx: Vec<TArc<Ring<SoftFrame>>> = rings.iter().map(|r| r.rx.clone()).collect();
    let tx: Vec<TArc<Ring<SoftFrame>>> = rings.iter().filter_map(|r| r.tx.clone()).collect();
    let tasks: Vec<BypassChannel> = rings.iter().filter_map(|r| r.bypass.clone()).collect();

    let offloaded = Arc::new(Mutex::new(HashSet::<FlowKey>::new()));
    let bypassed = Arc::new(AtomicU64::new(0));

    let feeder = {
        let (dev, traffic, stop) = (Arc::clone(&dev), Arc::clone(&traffic), Arc::clone(&stop));
        let (offloaded, bypassed) = (Arc::clone(&offloaded), Arc::clone(&bypassed));
        let rate = args.rate;
        thread::spawn(move || {
            traffic.generate(rate, &stop, |idx, key, frame| {
                if offloaded.lock().contains(key) {
                    bypassed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match dev.alloc_frame(frame) {
                    // a full ring hands the frame back, dropping frees it
                    Some(f) => drop(rx[idx % rx.len()].enqueue(f)),
                    None => debug!("primary: no free frame"),
                }
            })
        })
    };

    let fast_path_stop = Arc::new(AtomicBool::new(false));
    let fast_path = {
        let stop = Arc::clone(&fast_path_stop);
        let offloaded = Arc::clone(&offloaded);
        thread::spawn(move || {
            let mut forwarded = 0u64;
            let mut msgs = [0u64; 3];
            while !stop.load(Ordering::Relaxed) {
                let mut idle = true;
                for ring in &tx {
                    while let Some(frame) = ring.dequeue() {
                        drop(frame);
                        forwarded += 1;
                        idle = false;
                    }
                }
                for channel in &tasks {
                    while let Some(msg) = channel.tasks.dequeue() {
                        let mut set = offloaded.lock();
                        match msg.kind {
                            OffloadKind::Add => {
                                set.insert(msg.key);
                                msgs[0] += 1;
                            }
                            OffloadKind::SoftDelete => {
                                set.remove(&msg.key);
                                msgs[1] += 1;
                            }
                            OffloadKind::HardDelete => {
                                set.remove(&msg.key);
                                msgs[2] += 1;
                            }
                        }
                        idle = false;
                    }
                }
                if idle {
                    thread::sleep(Duration::from_micros(100));
                }
            }
            info!(
                "fast path: {} forwarded, bypass messages add {} soft delete {} hard delete {}",
                forwarded, msgs[0], msgs[1], msgs[2]
            );
        })
    };

    let cfg = IfaceConfig::new(args.settings(0, None)).with_rings(rings);
    let rv = run_capture(manager, cfg, args.bypass_after, Arc::clone(&stop), args.per_thread_stats);
    stop.store(true, Ordering::SeqCst);
    feeder.join().map_err(|_| anyhow!("feeder thread panicked"))?;
    fast_path_stop.store(true, Ordering::SeqCst);
    fast_path
        .join()
        .map_err(|_| anyhow!("fast path thread panicked"))?;
    info!("fast path: {} packets bypassed", bypassed.load(Ordering::Relaxed));
    rv
}

#[cfg(feature = "dpdk")]
fn run_dpdk(args: &Args, stop: Arc<AtomicBool>) -> Result<()> {
    use pmd_capture::dpdk::{DpdkDevice, DpdkPortSpec};
    use pmd_capture::hugepages;

    if args.op_mode == OpMode::Ring {
        return Err(Error::Unsupported("ring mode with the dpdk backend").into());
    }

    let threads = args.threads();
    let mut specs = vec![DpdkPortSpec {
        rx_interrupts: args.interrupts,
        ..DpdkPortSpec::new(args.interface.as_str(), threads)
    }];
    if let Some(out) = &args.out_interface {
        specs.push(DpdkPortSpec::new(out.as_str(), threads));
    }
    let mut eal_args = vec!["pmd-capture".to_string()];
    eal_args.extend(args.eal_args.iter().cloned());

    let (dev, ports) = DpdkDevice::new(&eal_args, &specs)?;
    hugepages::evaluate(hugepages::MEMINFO_PATH);

    let manager = Arc::new(DeviceManager::new(dev));
    let cfg = IfaceConfig::new(args.settings(ports[0], ports.get(1).copied()));
    run_capture(manager, cfg, None, stop, args.per_thread_stats)
}

#[cfg(not(feature = "dpdk"))]
fn run_dpdk(_args: &Args, _stop: Arc<AtomicBool>) -> Result<()> {
    Err(Error::Unsupported("dpdk backend, rebuild with --features dpdk").into())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(
        "{} started: backend {:?}, {} threads, {:?} mode, copy mode {:?}",
        args.interface,
        args.backend,
        args.threads(),
        args.op_mode,
        args.copy_mode
    );

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("Error setting Ctrl-C handler")?;
    }
    if let Some(secs) = args.duration {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            stop.store(true, Ordering::SeqCst);
        });
    }

    match args.backend {
        Backend::Soft => run_soft(&args, stop),
        Backend::Dpdk => run_dpdk(&args, stop),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmd_capture::packet::PacketInfo;

    #[test]
    fn test_traffic_alternates_tcp_and_udp() {
        let traffic = Traffic::new(4).unwrap();
        assert_eq!(traffic.flows.len(), 4);
        for (i, (key, frame)) in traffic.flows.iter().enumerate() {
            let (proto, dst_port) = if i % 2 == 0 { (6, 80) } else { (17, 53) };
            assert_eq!((key.proto, key.dst_port), (proto, dst_port));
            let decoded = PacketInfo::decode(frame).unwrap().key.unwrap();
            assert_eq!(decoded, *key);
        }
    }
}
