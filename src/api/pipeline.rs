//! Inspection pipeline entry point.

use super::device::PollDevice;
use crate::errors::PipelineError;
use crate::packet::PooledPacket;

/// Consumer of captured packets.
///
/// The pipeline takes ownership of each packet. Dropping the packet, now or
/// later and on any thread, releases it: the buffer is transmitted, queued or
/// freed according to the packet's release policy.
pub trait Pipeline<D: PollDevice> {
    /// Inspects one packet. An error is fatal for the current burst and ends
    /// the receive loop.
    fn process(&mut self, packet: PooledPacket<D>) -> Result<(), PipelineError>;

    /// Periodic flow/timer maintenance, also called when no traffic arrives.
    fn handle_timeout(&mut self) {}
}
