//! Flow offload to the external fast path.
//!
//! Once a flow needs no more inspection, the receive thread asks the fast
//! path to handle its packets by posting an [`OffloadKind::Add`] message on
//! the tasks ring. The flow manager later probes the flow on its aging scan
//! with [`update`]: a soft delete lets the fast path evict the flow when it
//! went idle, a hard delete tears it down when the flow is being released.
//!
//! Messages travel over a bounded ring that may fill up. Every message sent
//! for a flow bumps its pending pressure and every probe that finds the flow
//! too recent lowers it again, so a flow that keeps being probed is probed
//! less and less often.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, warn};
use triomphe::Arc;

use crate::packet::{L4Proto, PacketInfo};
use crate::pool::{ObjectPool, Pooled, Reusable};
use crate::ring::Ring;
use crate::stats::{IpFamily, LiveDevice};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OffloadKind {
    #[default]
    Add,
    SoftDelete,
    HardDelete,
}

/// 5-tuple plus VLAN tags identifying a flow on the fast path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub vlan_id: [u16; 2],
}

impl Default for FlowKey {
    fn default() -> Self {
        Self {
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            proto: 0,
            vlan_id: [0; 2],
        }
    }
}

impl FlowKey {
    pub fn family(&self) -> IpFamily {
        match self.src {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Same key with source and destination swapped.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..*self
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} > {}:{} proto {} vlan {}/{}",
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
            self.proto,
            self.vlan_id[0],
            self.vlan_id[1]
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OffloadMessage {
    pub kind: OffloadKind,
    pub key: FlowKey,
    pub seq: u32,
}

impl Reusable for OffloadMessage {
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

pub type MessagePool = ObjectPool<OffloadMessage>;

pub type TaskRing = Ring<Pooled<OffloadMessage>>;

/// Where offload messages of a queue are allocated and posted.
#[derive(Clone)]
pub struct BypassChannel {
    pub tasks: Arc<TaskRing>,
    pub msg_pool: MessagePool,
}

impl BypassChannel {
    pub fn new(name: &str, ring_size: usize, pool_size: usize) -> Self {
        Self {
            tasks: Arc::new(Ring::new(format!("{name}_tasks"), ring_size)),
            msg_pool: ObjectPool::new(format!("{name}_msg_pool"), pool_size),
        }
    }

    /// Allocates, fills and posts one message. The message goes back to the
    /// pool when any step fails.
    fn send(&self, kind: OffloadKind, key: Option<FlowKey>, seq: u32) -> Result<(), SendError> {
        let mut msg = self.msg_pool.alloc().ok_or(SendError::NoMessage)?;
        msg.kind = kind;
        msg.key = key.ok_or(SendError::NoKey)?;
        msg.seq = seq;
        self.tasks.enqueue(msg).map_err(|_| SendError::RingFull)
    }
}

impl fmt::Debug for BypassChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BypassChannel")
            .field("tasks", &self.tasks)
            .field("msg_pool", &self.msg_pool)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendError {
    NoMessage,
    NoKey,
    RingFull,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NoMessage => write!(f, "message pool exhausted"),
            SendError::NoKey => write!(f, "no flow key"),
            SendError::RingFull => write!(f, "tasks ring full"),
        }
    }
}

/// Offload bookkeeping of one bypassed flow.
#[derive(Debug)]
pub struct FlowBypassState {
    channel: BypassChannel,
    pending_msgs: AtomicU8,
    next_seq: u32,
}

impl FlowBypassState {
    fn new(channel: BypassChannel) -> Self {
        Self {
            channel,
            pending_msgs: AtomicU8::new(0),
            next_seq: 1,
        }
    }

    pub fn pending_msgs(&self) -> u8 {
        self.pending_msgs.load(Ordering::Acquire)
    }

    pub fn set_pending_msgs(&self, n: u8) {
        self.pending_msgs.store(n, Ordering::Release);
    }

    pub fn channel(&self) -> &BypassChannel {
        &self.channel
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn inc_pending(&self) {
        let _ = self
            .pending_msgs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_add(1)));
    }

    fn dec_pending(&self) {
        let _ = self
            .pending_msgs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(1)));
    }
}

/// Content of a flow's bypass slot.
#[derive(Debug, Default)]
pub enum BypassState {
    #[default]
    None,
    Active(FlowBypassState),
}

impl BypassState {
    pub fn is_active(&self) -> bool {
        matches!(self, BypassState::Active(_))
    }

    pub fn active(&self) -> Option<&FlowBypassState> {
        match self {
            BypassState::Active(state) => Some(state),
            BypassState::None => None,
        }
    }
}

/// What the offload engine needs from a flow.
pub trait BypassFlow {
    fn flow_key(&self) -> Option<FlowKey>;

    /// The flow's bypass slot, `None` when the flow has no slot registered.
    fn bypass_slot(&mut self) -> Option<&mut BypassState>;

    /// Seconds timestamp of the last packet seen on the flow.
    fn last_seen_secs(&self) -> i64;

    /// Timeout in seconds of the flow's current state.
    fn timeout_policy(&self) -> u32;

    /// Set when the flow is being released while bypassed.
    fn release_requires_bypass_teardown(&self) -> bool;

    /// Keeps workers from touching the flow until the fast path answers.
    fn set_workers_locked(&mut self);
}

/// Quiet period a flow must show before the next soft delete is sent.
pub fn pressure_timeout(timeout_policy: u32, pending_msgs: u8) -> i64 {
    let p = pending_msgs as i64;
    timeout_policy as i64 * (1 + p) * p / 2
}

/// Offloads the flow of a decoded packet.
///
/// Only TCP and UDP flows without tunnel encapsulation are offloaded, and
/// only once. Returns `true` when the flow got bypassed by this call.
pub fn add<F: BypassFlow>(
    flow: Option<&mut F>,
    info: &PacketInfo,
    channel: &BypassChannel,
    livedev: &LiveDevice,
) -> bool {
    if !matches!(info.l4, L4Proto::Tcp | L4Proto::Udp) {
        return false;
    }
    let Some(flow) = flow else {
        return false;
    };
    if info.tunnel {
        return false;
    }

    let key = flow.flow_key();
    let Some(slot) = flow.bypass_slot() else {
        return false;
    };
    if slot.is_active() {
        return false;
    }

    let mut state = FlowBypassState::new(channel.clone());
    let seq = state.take_seq();
    match channel.send(OffloadKind::Add, key, seq) {
        Ok(()) => {
            if let Some(key) = key {
                debug!("Add bypass msg {}", key);
            }
            *slot = BypassState::Active(state);
            true
        }
        Err(e) => {
            debug!("Unable to post bypass add: {}", e);
            if let Some(family) = info.family {
                livedev.add_bypass_fail(family);
            }
            false
        }
    }
}

/// Probes a bypassed flow for eviction. Returns whether a message was sent.
pub fn soft_delete<F: BypassFlow>(flow: &mut F, tsec: i64) -> bool {
    let key = flow.flow_key();
    let last_seen = flow.last_seen_secs();
    let policy = flow.timeout_policy();
    let Some(BypassState::Active(state)) = flow.bypass_slot() else {
        return false;
    };

    let pressure = pressure_timeout(policy, state.pending_msgs());
    debug!(
        "cur time {} next upd {} last seen {} pending msgs {} timeout policy {}",
        tsec,
        last_seen + pressure,
        last_seen,
        state.pending_msgs(),
        policy
    );
    if tsec < last_seen + pressure {
        state.dec_pending();
        return false;
    }

    let seq = state.take_seq();
    match state.channel.send(OffloadKind::SoftDelete, key, seq) {
        Ok(()) => {
            state.inc_pending();
            if let Some(key) = key {
                debug!("Soft Delete bypass msg {}", key);
            }
            flow.set_workers_locked();
            true
        }
        Err(e) => {
            log_send_failure(e);
            false
        }
    }
}

/// Tells the fast path to forget a flow that is being released. The bypass
/// state is removed whatever the outcome. Returns whether a message was sent.
pub fn hard_delete<F: BypassFlow>(flow: &mut F) -> bool {
    let key = flow.flow_key();
    let Some(slot) = flow.bypass_slot() else {
        return false;
    };
    let BypassState::Active(mut state) = std::mem::take(slot) else {
        return false;
    };

    let seq = state.take_seq();
    match state.channel.send(OffloadKind::HardDelete, key, seq) {
        Ok(()) => {
            if let Some(key) = key {
                debug!("Hard Delete bypass msg {}", key);
            }
            flow.set_workers_locked();
            true
        }
        Err(e) => {
            log_send_failure(e);
            false
        }
    }
}

/// Aging scan entry point. Returns `true` while the flow stays bypassed.
pub fn update<F: BypassFlow>(flow: &mut F, tsec: i64) -> bool {
    match flow.bypass_slot() {
        None | Some(BypassState::None) => return false,
        Some(BypassState::Active(_)) => {}
    }

    if flow.release_requires_bypass_teardown() {
        hard_delete(flow);
        return false;
    }

    soft_delete(flow, tsec);
    true
}

fn log_send_failure(e: SendError) {
    match e {
        SendError::RingFull => debug!("Unable to enqueue message object"),
        SendError::NoMessage => warn!("Unable to get message object"),
        SendError::NoKey => warn!("Unable to init flow key from flow"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[derive(Default)]
    struct TestFlow {
        key: Option<FlowKey>,
        slot: Option<BypassState>,
        last_seen: i64,
        timeout: u32,
        release: bool,
        locked: bool,
    }

    impl TestFlow {
        fn registered() -> Self {
            Self {
                key: Some(FlowKey {
                    src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                    dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                    src_port: 1234,
                    dst_port: 80,
                    proto: 6,
                    vlan_id: [0; 2],
                }),
                slot: Some(BypassState::None),
                timeout: 10,
                ..Default::default()
            }
        }

        fn state(&self) -> &FlowBypassState {
            self.slot.as_ref().and_then(|s| s.active()).unwrap()
        }
    }

    impl BypassFlow for TestFlow {
        fn flow_key(&self) -> Option<FlowKey> {
            self.key
        }
        fn bypass_slot(&mut self) -> Option<&mut BypassState> {
            self.slot.as_mut()
        }
        fn last_seen_secs(&self) -> i64 {
            self.last_seen
        }
        fn timeout_policy(&self) -> u32 {
            self.timeout
        }
        fn release_requires_bypass_teardown(&self) -> bool {
            self.release
        }
        fn set_workers_locked(&mut self) {
            self.locked = true;
        }
    }

    fn tcp_info(family: IpFamily) -> PacketInfo {
        PacketInfo {
            family: Some(family),
            l4: L4Proto::Tcp,
            ..Default::default()
        }
    }

    fn bypassed(channel: &BypassChannel) -> TestFlow {
        let mut flow = TestFlow::registered();
        let dev = LiveDevice::new("test");
        assert!(add(Some(&mut flow), &tcp_info(IpFamily::V4), channel, &dev));
        channel.tasks.dequeue().unwrap();
        flow
    }

    #[test]
    fn test_add_installs_state() {
        let channel = BypassChannel::new("q0", 8, 8);
        let dev = LiveDevice::new("test");
        let mut flow = TestFlow::registered();
        assert!(add(Some(&mut flow), &tcp_info(IpFamily::V4), &channel, &dev));
        assert_eq!(flow.state().pending_msgs(), 0);

        let msg = channel.tasks.dequeue().unwrap();
        assert_eq!(msg.kind, OffloadKind::Add);
        assert_eq!(Some(msg.key), flow.key);

        // second add on the same flow is a no-op
        assert!(!add(Some(&mut flow), &tcp_info(IpFamily::V4), &channel, &dev));
        assert!(channel.tasks.is_empty());
    }

    #[test]
    fn test_add_filters() {
        let channel = BypassChannel::new("q0", 8, 8);
        let dev = LiveDevice::new("test");

        let icmp = PacketInfo {
            family: Some(IpFamily::V4),
            l4: L4Proto::Icmp,
            ..Default::default()
        };
        assert!(!add(Some(&mut TestFlow::registered()), &icmp, &channel, &dev));

        let tunneled = PacketInfo {
            tunnel: true,
            ..tcp_info(IpFamily::V4)
        };
        assert!(!add(Some(&mut TestFlow::registered()), &tunneled, &channel, &dev));

        let mut unregistered = TestFlow {
            slot: None,
            ..TestFlow::registered()
        };
        assert!(!add(Some(&mut unregistered), &tcp_info(IpFamily::V4), &channel, &dev));
        assert!(!add::<TestFlow>(None, &tcp_info(IpFamily::V4), &channel, &dev));

        assert!(channel.tasks.is_empty());
        assert_eq!(channel.msg_pool.available(), 8);
        assert_eq!(dev.bypass_fail(IpFamily::V4), 0);
    }

    #[test]
    fn test_add_failures_are_counted_per_family() {
        let channel = BypassChannel::new("q0", 1, 8);
        let dev = LiveDevice::new("test");
        // fill the ring
        let mut first = TestFlow::registered();
        assert!(add(Some(&mut first), &tcp_info(IpFamily::V4), &channel, &dev));

        let mut v6 = TestFlow::registered();
        v6.key = Some(FlowKey {
            src: IpAddr::V6(Ipv6Addr::LOCALHOST),
            dst: IpAddr::V6(Ipv6Addr::LOCALHOST),
            ..Default::default()
        });
        assert!(!add(Some(&mut v6), &tcp_info(IpFamily::V6), &channel, &dev));
        assert_eq!(dev.bypass_fail(IpFamily::V6), 1);
        assert!(!v6.slot.as_ref().unwrap().is_active());
        // the failed message went back to the pool
        assert_eq!(channel.msg_pool.in_use(), 1);

        let mut no_key = TestFlow {
            key: None,
            ..TestFlow::registered()
        };
        channel.tasks.dequeue().unwrap();
        assert!(!add(Some(&mut no_key), &tcp_info(IpFamily::V4), &channel, &dev));
        assert_eq!(dev.bypass_fail(IpFamily::V4), 1);
        assert_eq!(channel.msg_pool.in_use(), 0);
    }

    #[test]
    fn test_add_on_exhausted_pool() {
        let channel = BypassChannel::new("q0", 8, 1);
        let dev = LiveDevice::new("test");
        let _held = channel.msg_pool.alloc().unwrap();
        let mut flow = TestFlow::registered();
        assert!(!add(Some(&mut flow), &tcp_info(IpFamily::V4), &channel, &dev));
        assert_eq!(dev.bypass_fail(IpFamily::V4), 1);
        assert!(!flow.slot.unwrap().is_active());
    }

    #[test]
    fn test_soft_delete_pressure_cadence() {
        let channel = BypassChannel::new("q0", 8, 8);
        let mut flow = bypassed(&channel);
        flow.state().set_pending_msgs(2);

        // 10 * 3 * 2 / 2 = 30 s of quiet needed
        assert_eq!(pressure_timeout(10, 2), 30);
        assert!(update(&mut flow, 29));
        assert_eq!(flow.state().pending_msgs(), 1);
        assert!(channel.tasks.is_empty());
        assert!(!flow.locked);

        flow.state().set_pending_msgs(2);
        assert!(update(&mut flow, 31));
        assert_eq!(flow.state().pending_msgs(), 3);
        assert!(flow.locked);
        let msg = channel.tasks.dequeue().unwrap();
        assert_eq!(msg.kind, OffloadKind::SoftDelete);
    }

    #[test]
    fn test_pending_stays_bounded() {
        let channel = BypassChannel::new("q0", 1024, 1024);
        let mut flow = bypassed(&channel);
        flow.timeout = 0;
        for t in 0..400 {
            soft_delete(&mut flow, t);
            while channel.tasks.dequeue().is_some() {}
        }
        assert_eq!(flow.state().pending_msgs(), u8::MAX);

        flow.timeout = 10;
        flow.last_seen = i64::MAX / 4;
        for _ in 0..300 {
            assert!(!soft_delete(&mut flow, 0));
        }
        assert_eq!(flow.state().pending_msgs(), 0);
    }

    #[test]
    fn test_pending_updates_from_many_threads() {
        let channel = BypassChannel::new("q0", 16, 16);
        let flow = bypassed(&channel);
        let state = flow.state();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| (0..50).for_each(|_| state.inc_pending()));
            }
        });
        assert_eq!(state.pending_msgs(), 200);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| (0..60).for_each(|_| state.dec_pending()));
            }
        });
        assert_eq!(state.pending_msgs(), 0);
    }

    #[test]
    fn test_soft_delete_send_condition() {
        let channel = BypassChannel::new("q0", 1024, 1024);
        let mut flow = bypassed(&channel);
        flow.last_seen = 100;
        for p in [0u8, 1, 5, 40, 255] {
            let need = pressure_timeout(flow.timeout, p);
            flow.state().set_pending_msgs(p);
            assert!(!soft_delete(&mut flow, 100 + need - 1));
            flow.state().set_pending_msgs(p);
            assert!(soft_delete(&mut flow, 100 + need));
            while channel.tasks.dequeue().is_some() {}
        }
    }

    #[test]
    fn test_hard_delete_on_release() {
        let channel = BypassChannel::new("q0", 8, 8);
        let mut flow = bypassed(&channel);
        flow.state().set_pending_msgs(200);
        flow.last_seen = 1_000_000;
        flow.release = true;

        assert!(!update(&mut flow, 0));
        assert!(!flow.slot.as_ref().unwrap().is_active());
        assert!(flow.locked);
        let msg = channel.tasks.dequeue().unwrap();
        assert_eq!(msg.kind, OffloadKind::HardDelete);

        // state is gone, nothing else is sent
        assert!(!update(&mut flow, 0));
        assert!(channel.tasks.is_empty());
    }

    #[test]
    fn test_hard_delete_with_full_ring_still_unbypasses() {
        let channel = BypassChannel::new("q0", 1, 8);
        let mut flow = bypassed(&channel);
        channel.tasks.enqueue(channel.msg_pool.alloc().unwrap()).unwrap();
        flow.release = true;
        assert!(!update(&mut flow, 0));
        assert!(!flow.slot.as_ref().unwrap().is_active());
        assert_eq!(channel.msg_pool.in_use(), 1);
    }

    #[test]
    fn test_update_without_slot() {
        let mut flow = TestFlow {
            slot: None,
            ..TestFlow::registered()
        };
        assert!(!update(&mut flow, 0));
    }
}
