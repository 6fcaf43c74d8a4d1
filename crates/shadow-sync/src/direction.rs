//! The Direction Wrapper (§4.8): a single-reader, many-observers mutable
//! enum consulted at enqueue time to gate which side is allowed to push
//! sync requests. Modeled as an `ArcSwap`-free atomic enum, following
//! `at_integrations::linear::sync::SyncDirection`'s plain mutable setting
//! guarded by a lock rather than a full pub/sub bus.

use std::sync::atomic::{AtomicU8, Ordering};

use shadow_queue::SyncRequest;

/// Which side is currently allowed to originate sync traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Both local-to-cloud and cloud-to-local requests are allowed.
    BetweenDeviceAndCloud,
    /// Only local changes flow to the cloud; inbound cloud changes are
    /// dropped at enqueue time.
    DeviceToCloud,
    /// Only cloud changes flow to the device; outbound local changes are
    /// dropped at enqueue time.
    CloudToDevice,
}

impl Direction {
    fn encode(self) -> u8 {
        match self {
            Direction::BetweenDeviceAndCloud => 0,
            Direction::DeviceToCloud => 1,
            Direction::CloudToDevice => 2,
        }
    }

    fn decode(value: u8) -> Self {
        match value {
            1 => Direction::DeviceToCloud,
            2 => Direction::CloudToDevice,
            _ => Direction::BetweenDeviceAndCloud,
        }
    }

    /// Whether a request of this kind is allowed to enqueue under this
    /// direction. `FullSync`/`Overwrite*`/`MergedFullSync` are never gated —
    /// they're always operator- or startup-driven, not direction traffic.
    fn allows(self, request: &SyncRequest) -> bool {
        match self {
            Direction::BetweenDeviceAndCloud => true,
            Direction::DeviceToCloud => !matches!(
                request,
                SyncRequest::LocalUpdate { .. } | SyncRequest::LocalDelete { .. }
            ),
            Direction::CloudToDevice => !matches!(
                request,
                SyncRequest::CloudUpdate { .. } | SyncRequest::CloudDelete { .. }
            ),
        }
    }
}

/// Thread-safe holder for the current [`Direction`], consulted by every
/// enqueue path before a request reaches the queue.
#[derive(Debug)]
pub struct DirectionGate {
    current: AtomicU8,
}

impl DirectionGate {
    pub fn new(initial: Direction) -> Self {
        Self {
            current: AtomicU8::new(initial.encode()),
        }
    }

    pub fn get(&self) -> Direction {
        Direction::decode(self.current.load(Ordering::Acquire))
    }

    /// Update the direction, returning the previous one so the caller (the
    /// Sync Handler) can decide whether a change actually occurred and
    /// trigger a full-sync enqueue.
    pub fn set(&self, new: Direction) -> Direction {
        let previous = self.current.swap(new.encode(), Ordering::AcqRel);
        Direction::decode(previous)
    }

    /// Whether `request` may be enqueued under the current direction.
    pub fn allows(&self, request: &SyncRequest) -> bool {
        self.get().allows(request)
    }
}

impl Default for DirectionGate {
    fn default() -> Self {
        Self::new(Direction::BetweenDeviceAndCloud)
    }
}
