//! Minimal flow tracking for the bypass engine.
//!
//! Flows are keyed by their 5-tuple in either direction. The aging scan
//! drives the bypass state of offloaded flows and evicts idle ones.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::debug;

use crate::bypass::{self, BypassFlow, BypassState, FlowKey};

pub const DEFAULT_FLOW_TIMEOUT_SECS: u32 = 30;

#[derive(Debug)]
pub struct Flow {
    key: FlowKey,
    bypass: Option<BypassState>,
    last_seen_secs: i64,
    timeout_secs: u32,
    releasing: bool,
    workers_locked: bool,
    pkts: u64,
    bytes: u64,
}

impl Flow {
    pub fn new(key: FlowKey, now_secs: i64, timeout_secs: u32, bypass_slot: bool) -> Self {
        Self {
            key,
            bypass: bypass_slot.then(BypassState::default),
            last_seen_secs: now_secs,
            timeout_secs,
            releasing: false,
            workers_locked: false,
            pkts: 0,
            bytes: 0,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn touch(&mut self, now_secs: i64, len: usize) {
        self.last_seen_secs = self.last_seen_secs.max(now_secs);
        self.pkts += 1;
        self.bytes += len as u64;
        self.workers_locked = false;
    }

    pub fn pkts(&self) -> u64 {
        self.pkts
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass.as_ref().is_some_and(BypassState::is_active)
    }

    pub fn bypass_state(&self) -> Option<&BypassState> {
        self.bypass.as_ref()
    }

    pub fn workers_locked(&self) -> bool {
        self.workers_locked
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs > self.last_seen_secs + self.timeout_secs as i64
    }

    pub fn mark_release(&mut self) {
        self.releasing = true;
    }
}

impl BypassFlow for Flow {
    fn flow_key(&self) -> Option<FlowKey> {
        Some(self.key)
    }

    fn bypass_slot(&mut self) -> Option<&mut BypassState> {
        self.bypass.as_mut()
    }

    fn last_seen_secs(&self) -> i64 {
        self.last_seen_secs
    }

    fn timeout_policy(&self) -> u32 {
        self.timeout_secs
    }

    fn release_requires_bypass_teardown(&self) -> bool {
        self.releasing && self.is_bypassed()
    }

    fn set_workers_locked(&mut self) {
        self.workers_locked = true;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AgingReport {
    pub scanned: usize,
    pub bypassed: usize,
    pub evicted: usize,
}

pub struct FlowTable {
    flows: HashMap<FlowKey, Flow>,
    timeout_secs: u32,
    bypass_slots: bool,
}

impl FlowTable {
    /// `bypass_slots` registers a bypass slot on every new flow.
    pub fn new(timeout_secs: u32, bypass_slots: bool) -> Self {
        Self {
            flows: HashMap::new(),
            timeout_secs,
            bypass_slots,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&Flow> {
        self.flows
            .get(key)
            .or_else(|| self.flows.get(&key.reversed()))
    }

    /// The flow of `key` in either direction, created when unknown.
    pub fn lookup_or_insert(&mut self, key: FlowKey, now_secs: i64) -> &mut Flow {
        let key = if !self.flows.contains_key(&key) && self.flows.contains_key(&key.reversed()) {
            key.reversed()
        } else {
            key
        };
        match self.flows.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Flow::new(key, now_secs, self.timeout_secs, self.bypass_slots)),
        }
    }

    /// Runs the bypass update on every offloaded flow and drops flows idle
    /// past their timeout. Expired bypassed flows are torn down first.
    pub fn age(&mut self, now_secs: i64) -> AgingReport {
        let mut report = AgingReport {
            scanned: self.flows.len(),
            ..Default::default()
        };
        self.flows.retain(|key, flow| {
            let expired = flow.is_expired(now_secs);
            if flow.is_bypassed() {
                if expired {
                    flow.mark_release();
                }
                if bypass::update(flow, now_secs) {
                    report.bypassed += 1;
                    return true;
                }
            }
            if expired {
                debug!("evicting flow {}", key);
                report.evicted += 1;
                return false;
            }
            true
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::{BypassChannel, OffloadKind};
    use crate::packet::{L4Proto, PacketInfo};
    use crate::stats::{IpFamily, LiveDevice};
    use std::net::{IpAddr, Ipv4Addr};

    fn key(sport: u16) -> FlowKey {
        FlowKey {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: sport,
            dst_port: 80,
            proto: 6,
            vlan_id: [0; 2],
        }
    }

    fn tcp(k: FlowKey) -> PacketInfo {
        PacketInfo {
            family: Some(IpFamily::V4),
            l4: L4Proto::Tcp,
            tunnel: false,
            icmpv6_type: None,
            key: Some(k),
        }
    }

    #[test]
    fn test_both_directions_share_a_flow() {
        let mut table = FlowTable::new(DEFAULT_FLOW_TIMEOUT_SECS, false);
        table.lookup_or_insert(key(1000), 0).touch(0, 60);
        table.lookup_or_insert(key(1000).reversed(), 1).touch(1, 40);
        assert_eq!(table.len(), 1);
        let flow = table.get(&key(1000).reversed()).unwrap();
        assert_eq!((flow.pkts(), flow.bytes()), (2, 100));
        assert_eq!(flow.key(), &key(1000));
    }

    #[test]
    fn test_aging_evicts_idle_flows() {
        let mut table = FlowTable::new(10, false);
        table.lookup_or_insert(key(1), 0);
        table.lookup_or_insert(key(2), 8);
        let report = table.age(11);
        assert_eq!(report, AgingReport { scanned: 2, bypassed: 0, evicted: 1 });
        assert!(table.get(&key(2)).is_some());
    }

    #[test]
    fn test_aging_drives_bypassed_flows() {
        let channel = BypassChannel::new("tasks", 16, 16);
        let livedev = LiveDevice::new("ring0");
        let mut table = FlowTable::new(30, true);
        let flow = table.lookup_or_insert(key(7), 100);
        assert!(bypass::add(Some(flow), &tcp(key(7)), &channel, &livedev));
        assert_eq!(channel.tasks.dequeue().unwrap().kind, OffloadKind::Add);

        // quiet long enough for a soft delete, but not expired
        let report = table.age(120);
        assert_eq!(report.bypassed, 1);
        assert_eq!(channel.tasks.dequeue().unwrap().kind, OffloadKind::SoftDelete);
        assert!(table.get(&key(7)).unwrap().workers_locked());

        // expired: hard delete then eviction
        let report = table.age(131);
        assert_eq!(report, AgingReport { scanned: 1, bypassed: 0, evicted: 1 });
        assert_eq!(channel.tasks.dequeue().unwrap().kind, OffloadKind::HardDelete);
        assert!(table.is_empty());
    }

    #[test]
    fn test_flows_without_slot_are_not_bypassed() {
        let channel = BypassChannel::new("tasks", 16, 16);
        let livedev = LiveDevice::new("ring0");
        let mut table = FlowTable::new(30, false);
        let flow = table.lookup_or_insert(key(7), 100);
        assert!(!bypass::add(Some(flow), &tcp(key(7)), &channel, &livedev));
        assert!(channel.tasks.is_empty());
    }
}
