//! Node-local time keeping: a Lamport logical clock piggybacked on every
//! inter-node message, and an adjustable-offset physical clock driven by the
//! berkeley synchronization rounds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::utils::RookeryError;

/// Lamport logical clock. Strictly increasing within a node; merged with
/// received timestamps before any message is dispatched.
#[derive(Debug, Default)]
pub struct LogicalClock {
    count: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        LogicalClock {
            count: AtomicU64::new(0),
        }
    }

    /// Advances the clock for a local send event and returns the new value.
    pub fn tick(&self) -> u64 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merges a timestamp received from another node:
    /// `clock = max(clock, received) + 1`.
    pub fn observe(&self, received: u64) -> u64 {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            let next = current.max(received) + 1;
            match self.count.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(seen) => current = seen,
            }
        }
    }

    /// Reads the current value without advancing.
    pub fn read(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Adjustable-offset wall clock. `now_ms()` is system time plus the signed
/// offset accumulated from clock adjustments.
#[derive(Debug, Default)]
pub struct PhysicalClock {
    offset_ms: AtomicI64,
}

impl PhysicalClock {
    pub fn new(offset_ms: i64) -> Self {
        PhysicalClock {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// Raw system time in milliseconds since the unix epoch.
    pub fn system_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Adjusted time: system time plus the current offset.
    pub fn now_ms(&self) -> i64 {
        self.system_ms() + self.offset()
    }

    pub fn offset(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    /// Applies a relative adjustment to the offset and returns the new value.
    pub fn shift(&self, delta_ms: i64) -> i64 {
        self.offset_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

/// Bundles the two clocks, plus optional persistence of the physical offset
/// so that a restarted node keeps its last-known adjustment.
#[derive(Debug)]
pub struct ClockManager {
    logical: LogicalClock,
    physical: PhysicalClock,
    offset_path: Option<PathBuf>,
}

impl ClockManager {
    /// Creates a clock manager with no persistence (tests, balancer).
    pub fn new_ephemeral() -> Self {
        ClockManager {
            logical: LogicalClock::new(),
            physical: PhysicalClock::new(0),
            offset_path: None,
        }
    }

    /// Creates a clock manager that persists the physical offset at the
    /// given path, loading any previously saved value.
    pub fn new_persistent(offset_path: PathBuf) -> Self {
        let offset = std::fs::read_to_string(&offset_path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if offset != 0 {
            pf_info!("restored physical clock offset {} ms", offset);
        }
        ClockManager {
            logical: LogicalClock::new(),
            physical: PhysicalClock::new(offset),
            offset_path: Some(offset_path),
        }
    }

    pub fn logical(&self) -> &LogicalClock {
        &self.logical
    }

    pub fn physical(&self) -> &PhysicalClock {
        &self.physical
    }

    /// Shifts the physical offset and saves the new value if persistence is
    /// configured.
    pub fn shift_physical(&self, delta_ms: i64) -> Result<i64, RookeryError> {
        let new_offset = self.physical.shift(delta_ms);
        if let Some(path) = &self.offset_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, new_offset.to_string())?;
        }
        Ok(new_offset)
    }
}
