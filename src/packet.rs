//! Packet objects and their release.
//!
//! A [`Packet`] wraps one received buffer while it travels through the
//! inspection pipeline. Packets live in a per-thread [`ObjectPool`] and the
//! buffer is disposed of when the pooled packet is dropped: transmitted to
//! the peer port, posted on the TX ring or freed, depending on the
//! [`ReleasePolicy`] and the verdict. Dropping is the only way to release, so
//! every packet is released exactly once on every path.

use std::fmt;
use std::sync::Arc;

use etherparse::{NetHeaders, PacketHeaders, TransportHeader, VlanHeader};
use tracing::{debug, warn};

use crate::api::{BufferHandle, CksumStatus, PollDevice, ProcessRole};
use crate::bypass::{self, BypassChannel, BypassFlow, FlowKey};
use crate::clock::{MachineStart, Timestamp};
use crate::config::{ChecksumMode, CopyMode};
use crate::pool::{ObjectPool, Pooled, Reusable};
use crate::ring::Ring;
use crate::stats::{IpFamily, LiveDevice};

/// Value the software checksum fields are set to when the NIC reported the
/// checksum as bad.
pub const BAD_CHECKSUM: u16 = 0;

/// ICMPv6 multicast listener report (MLDv2)
pub const ICMPV6_MLD_V2_REPORT: u8 = 143;

/// Delay before the single transmit retry.
pub const TX_RETRY_DELAY_US: u32 = 1;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_IPIP: u8 = 4;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_IPV6: u8 = 41;
const IPPROTO_GRE: u8 = 47;
const IPPROTO_ICMPV6: u8 = 58;
const VXLAN_PORT: u16 = 4789;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum L4Proto {
    #[default]
    None,
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

/// Decoded header summary of a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub family: Option<IpFamily>,
    pub l4: L4Proto,
    pub tunnel: bool,
    pub icmpv6_type: Option<u8>,
    pub key: Option<FlowKey>,
}

impl PacketInfo {
    /// Decodes an Ethernet frame. Returns `None` for truncated or malformed
    /// headers.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let headers = PacketHeaders::from_ethernet_slice(frame).ok()?;

        let vlan_id = match &headers.vlan {
            Some(VlanHeader::Single(h)) => [h.vlan_id.value(), 0],
            Some(VlanHeader::Double(h)) => [h.outer.vlan_id.value(), h.inner.vlan_id.value()],
            None => [0, 0],
        };

        let mut info = PacketInfo::default();
        let (src, dst, proto) = match &headers.net {
            Some(NetHeaders::Ipv4(h, exts)) => {
                info.family = Some(IpFamily::V4);
                let proto = exts.auth.as_ref().map_or(h.protocol, |a| a.next_header);
                (h.source.into(), h.destination.into(), proto.0)
            }
            Some(NetHeaders::Ipv6(h, exts)) => {
                info.family = Some(IpFamily::V6);
                // last header of the extension chain
                let proto = exts.next_header(h.next_header).unwrap_or(h.next_header);
                (h.source.into(), h.destination.into(), proto.0)
            }
            _ => return Some(info),
        };
        info.tunnel = matches!(proto, IPPROTO_IPIP | IPPROTO_IPV6 | IPPROTO_GRE);

        let (src_port, dst_port, proto) = match &headers.transport {
            Some(TransportHeader::Tcp(h)) => {
                info.l4 = L4Proto::Tcp;
                (h.source_port, h.destination_port, IPPROTO_TCP)
            }
            Some(TransportHeader::Udp(h)) => {
                info.l4 = L4Proto::Udp;
                info.tunnel |= h.destination_port == VXLAN_PORT;
                (h.source_port, h.destination_port, IPPROTO_UDP)
            }
            Some(TransportHeader::Icmpv4(_)) => {
                info.l4 = L4Proto::Icmp;
                (0, 0, IPPROTO_ICMP)
            }
            Some(TransportHeader::Icmpv6(h)) => {
                info.l4 = L4Proto::Icmpv6;
                info.icmpv6_type = Some(h.icmp_type.type_u8());
                (0, 0, IPPROTO_ICMPV6)
            }
            None => {
                info.l4 = L4Proto::Other(proto);
                (0, 0, proto)
            }
        };

        info.key = Some(FlowKey {
            src,
            dst,
            src_port,
            dst_port,
            proto,
            vlan_id,
        });
        Some(info)
    }

    pub fn is_mld_report(&self) -> bool {
        self.l4 == L4Proto::Icmpv6 && self.icmpv6_type == Some(ICMPV6_MLD_V2_REPORT)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Forward,
    Drop,
}

/// How the buffer of a packet is disposed of on release.
pub enum ReleasePolicy<B> {
    DirectFree,
    /// Forward out of the peer port, device mode with Tap or Ips.
    TransmitThenFree { port: u16, queue: u16 },
    /// Post on the queue's TX ring, ring mode.
    EnqueueThenFree(triomphe::Arc<Ring<B>>),
}

impl<B> fmt::Debug for ReleasePolicy<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleasePolicy::DirectFree => write!(f, "DirectFree"),
            ReleasePolicy::TransmitThenFree { port, queue } => {
                write!(f, "TransmitThenFree({port}:{queue})")
            }
            ReleasePolicy::EnqueueThenFree(ring) => write!(f, "EnqueueThenFree({})", ring.name()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum BypassPolicy {
    #[default]
    None,
    Active(BypassChannel),
}

pub type PooledPacket<D> = Pooled<Packet<D>>;

pub struct Packet<D: PollDevice> {
    device: Arc<D>,
    livedev: Arc<LiveDevice>,
    copy_mode: CopyMode,
    buffer: Option<D::Buffer>,
    ts: Timestamp,
    ignore_checksum: bool,
    l3_csum: Option<u16>,
    l4_csum: Option<u16>,
    disposition: Disposition,
    release: ReleasePolicy<D::Buffer>,
    bypass: BypassPolicy,
    info: Option<PacketInfo>,
}

impl<D: PollDevice> Packet<D> {
    fn new(device: Arc<D>, livedev: Arc<LiveDevice>, copy_mode: CopyMode) -> Self {
        Self {
            device,
            livedev,
            copy_mode,
            buffer: None,
            ts: Timestamp::default(),
            ignore_checksum: false,
            l3_csum: None,
            l4_csum: None,
            disposition: Disposition::Forward,
            release: ReleasePolicy::DirectFree,
            bypass: BypassPolicy::None,
            info: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |b| b.data())
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.buffer.as_mut() {
            Some(b) => b.data_mut(),
            None => &mut [],
        }
    }

    /// Length of the whole packet, all segments included.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.pkt_len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Set when checksums need no software verification.
    pub fn ignore_checksum(&self) -> bool {
        self.ignore_checksum
    }

    /// Pre-computed L3 checksum, [`BAD_CHECKSUM`] when the NIC flagged it.
    pub fn l3_csum(&self) -> Option<u16> {
        self.l3_csum
    }

    pub fn l4_csum(&self) -> Option<u16> {
        self.l4_csum
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn set_drop(&mut self) {
        self.disposition = Disposition::Drop;
    }

    pub fn is_dropped(&self) -> bool {
        self.disposition == Disposition::Drop
    }

    pub fn copy_mode(&self) -> CopyMode {
        self.copy_mode
    }

    pub fn livedev(&self) -> &LiveDevice {
        &self.livedev
    }

    pub fn release_policy(&self) -> &ReleasePolicy<D::Buffer> {
        &self.release
    }

    pub fn set_release_policy(&mut self, release: ReleasePolicy<D::Buffer>) {
        self.release = release;
    }

    pub fn set_bypass_policy(&mut self, bypass: BypassPolicy) {
        self.bypass = bypass;
    }

    pub fn can_bypass(&self) -> bool {
        matches!(self.bypass, BypassPolicy::Active(_))
    }

    /// Decodes the headers on first use.
    pub fn decode(&mut self) -> Option<&PacketInfo> {
        if self.info.is_none() {
            self.info = PacketInfo::decode(self.data());
        }
        self.info.as_ref()
    }

    pub fn info(&self) -> Option<&PacketInfo> {
        self.info.as_ref()
    }

    /// Offloads the packet's flow to the fast path.
    pub fn bypass<F: BypassFlow>(&mut self, flow: Option<&mut F>) -> bool {
        let Some(info) = self.decode().copied() else {
            return false;
        };
        match &self.bypass {
            BypassPolicy::Active(channel) => bypass::add(flow, &info, channel, &self.livedev),
            BypassPolicy::None => false,
        }
    }

    fn is_mld_report(&self, buf: &D::Buffer) -> bool {
        match &self.info {
            Some(info) => info.is_mld_report(),
            None => PacketInfo::decode(buf.data()).is_some_and(|i| i.is_mld_report()),
        }
    }

    fn release(&mut self) {
        let Some(buf) = self.buffer.take() else {
            return;
        };

        match &self.release {
            ReleasePolicy::TransmitThenFree { port, queue } => {
                let forward = match self.copy_mode {
                    CopyMode::Tap => true,
                    CopyMode::Ips => !self.is_dropped(),
                    CopyMode::None => false,
                };
                if forward && !self.is_mld_report(&buf) {
                    if let Err(buf) = self.device.tx_one(*port, *queue, buf) {
                        self.device.delay_us(TX_RETRY_DELAY_US);
                        if let Err(buf) = self.device.tx_one(*port, *queue, buf) {
                            debug!("port {}-Q{}: transmit failed twice, freeing", port, queue);
                            drop(buf);
                        }
                    }
                }
            }
            ReleasePolicy::EnqueueThenFree(ring) => {
                if !(self.copy_mode == CopyMode::Ips && self.is_dropped()) {
                    if let Err(buf) = ring.enqueue(buf) {
                        debug!("{}: ring full, freeing", ring.name());
                        drop(buf);
                    }
                }
            }
            ReleasePolicy::DirectFree => drop(buf),
        }

        self.reset();
    }

    fn reset(&mut self) {
        self.ts = Timestamp::default();
        self.ignore_checksum = false;
        self.l3_csum = None;
        self.l4_csum = None;
        self.disposition = Disposition::Forward;
        self.release = ReleasePolicy::DirectFree;
        self.bypass = BypassPolicy::None;
        self.info = None;
    }
}

impl<D: PollDevice> Reusable for Packet<D> {
    fn recycle(&mut self) {
        self.release();
    }
}

impl<D: PollDevice> fmt::Debug for Packet<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("ts", &self.ts)
            .field("disposition", &self.disposition)
            .field("release", &self.release)
            .finish()
    }
}

/// Per-thread factory binding received buffers to pooled packets.
pub struct PacketManager<D: PollDevice> {
    pool: ObjectPool<Packet<D>>,
    device: Arc<D>,
    checksum_mode: ChecksumMode,
    tx_target: Option<(u16, u16)>,
    machine_start: MachineStart,
    port: u16,
    segmented_warned: bool,
}

impl<D: PollDevice> PacketManager<D> {
    pub fn new(
        name: &str,
        size: usize,
        device: Arc<D>,
        livedev: Arc<LiveDevice>,
        copy_mode: CopyMode,
        checksum_mode: ChecksumMode,
    ) -> Self {
        let pool = {
            let device = Arc::clone(&device);
            ObjectPool::new_with(format!("{name}_packets"), size, move || {
                Packet::new(Arc::clone(&device), Arc::clone(&livedev), copy_mode)
            })
        };
        let machine_start = MachineStart::record(&*device);
        Self {
            pool,
            device,
            checksum_mode,
            tx_target: None,
            machine_start,
            port: 0,
            segmented_warned: false,
        }
    }

    /// Transmits released packets on `queue` of `port` instead of freeing
    /// them.
    pub fn with_tx_target(mut self, port: u16, queue: u16) -> Self {
        self.tx_target = Some((port, queue));
        self
    }

    /// Port the received buffers come from, for diagnostics.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn pool(&self) -> &ObjectPool<Packet<D>> {
        &self.pool
    }

    pub fn machine_start(&self) -> MachineStart {
        self.machine_start
    }

    /// Binds `buf` to a packet. When the packet pool is exhausted the buffer
    /// is handed back.
    pub fn acquire(&mut self, buf: D::Buffer) -> Result<PooledPacket<D>, D::Buffer> {
        let Some(mut p) = self.pool.alloc() else {
            return Err(buf);
        };

        self.segmented_warning(&buf);

        p.ts = self.machine_start.now(&*self.device);
        p.release = match self.tx_target {
            Some((port, queue)) => ReleasePolicy::TransmitThenFree { port, queue },
            None => ReleasePolicy::DirectFree,
        };

        match self.checksum_mode {
            ChecksumMode::Disable => p.ignore_checksum = true,
            ChecksumMode::Offload => {
                let flags = buf.checksum_flags();
                if flags.ip == CksumStatus::Good && flags.l4 == CksumStatus::Good {
                    p.ignore_checksum = true;
                } else {
                    if flags.ip == CksumStatus::Bad {
                        p.l3_csum = Some(BAD_CHECKSUM);
                    }
                    if flags.l4 == CksumStatus::Bad {
                        p.l4_csum = Some(BAD_CHECKSUM);
                    }
                }
            }
            ChecksumMode::Enable => {}
        }

        p.buffer = Some(buf);
        Ok(p)
    }

    fn segmented_warning(&mut self, buf: &D::Buffer) {
        if self.segmented_warned || buf.is_contiguous() {
            return;
        }
        warn!(
            "port {}: segmented buffers detected, check your configuration. To avoid segmented buffers, {}",
            self.port,
            segmented_advice(self.device.process_role())
        );
        self.segmented_warned = true;
    }
}

fn segmented_advice(role: ProcessRole) -> &'static str {
    match role {
        ProcessRole::Secondary => "try to increase mbuf size in your primary application",
        ProcessRole::Primary => "try to increase MTU in your configuration",
    }
}
