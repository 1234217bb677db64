//! Port blocks for concurrently running task slots
//!
//! Every task slot gets four ports: live log GET, live log PUT, interactive
//! shell and local proxy. Slot `n` uses `base + n * 4` for each role, so
//! blocks of different slots never overlap.

use crate::config::schema::PortsConfig;
use crate::error::{WardenError, WardenResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Distance between the ports of consecutive slots
pub const PORTS_PER_SLOT: u16 = 4;

/// Base ports of slot 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBases {
    pub live_log: u16,
    pub interactive: u16,
    pub proxy: u16,
}

impl From<&PortsConfig> for PortBases {
    fn from(config: &PortsConfig) -> Self {
        Self {
            live_log: config.live_log_base,
            interactive: config.interactive_base,
            proxy: config.proxy_base,
        }
    }
}

/// Ports assigned to one task slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortBlock {
    pub live_log_get: u16,
    pub live_log_put: u16,
    pub interactive: u16,
    pub proxy: u16,
}

impl PortBlock {
    fn for_slot(bases: &PortBases, slot: u16) -> Self {
        let offset = slot * PORTS_PER_SLOT;
        Self {
            live_log_get: bases.live_log + offset,
            live_log_put: bases.live_log + offset + 1,
            interactive: bases.interactive + offset,
            proxy: bases.proxy + offset,
        }
    }

    /// `[live_log_get, live_log_put, interactive, proxy]`
    pub fn ports(&self) -> [u16; 4] {
        [
            self.live_log_get,
            self.live_log_put,
            self.interactive,
            self.proxy,
        ]
    }
}

/// Hands out port blocks to at most `capacity` tasks at a time
#[derive(Debug)]
pub struct PortAllocator {
    capacity: usize,
    bases: PortBases,
    allocated: Mutex<HashMap<String, PortBlock>>,
}

impl PortAllocator {
    /// Create an allocator, failing if the highest slot would run past
    /// port 65535
    pub fn new(capacity: usize, bases: PortBases) -> WardenResult<Self> {
        let span = capacity as u32 * u32::from(PORTS_PER_SLOT);
        for (role, base) in [
            ("live log", bases.live_log),
            ("interactive", bases.interactive),
            ("proxy", bases.proxy),
        ] {
            if capacity == 0 || u32::from(base) + span > 65536 {
                return Err(WardenError::internal(format!(
                    "{} base port {} cannot fit {} task slots",
                    role, base, capacity
                )));
            }
        }
        Ok(Self {
            capacity,
            bases,
            allocated: Mutex::new(HashMap::new()),
        })
    }

    /// Allocator for the configured capacity and bases
    pub fn from_config(config: &PortsConfig) -> WardenResult<Self> {
        Self::new(config.capacity, PortBases::from(config))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block that slot `slot` would receive
    pub fn block_for_slot(&self, slot: usize) -> Option<PortBlock> {
        (slot < self.capacity).then(|| PortBlock::for_slot(&self.bases, slot as u16))
    }

    /// Ports for `task_id`. Allocating twice for the same task returns the
    /// same block.
    pub fn allocate(&self, task_id: &str) -> WardenResult<PortBlock> {
        let mut allocated = self.lock();
        if let Some(block) = allocated.get(task_id) {
            return Ok(*block);
        }

        let mut used = vec![false; self.capacity];
        for block in allocated.values() {
            let slot = usize::from((block.live_log_get - self.bases.live_log) / PORTS_PER_SLOT);
            if let Some(in_use) = used.get_mut(slot) {
                *in_use = true;
            }
        }
        let slot = used
            .iter()
            .position(|in_use| !in_use)
            .ok_or(WardenError::PortsExhausted {
                capacity: self.capacity,
            })?;

        let block = PortBlock::for_slot(&self.bases, slot as u16);
        debug!(task_id = %task_id, slot, ports = ?block.ports(), "Allocated port block");
        allocated.insert(task_id.to_string(), block);
        Ok(block)
    }

    /// Free the ports of `task_id`. Returns whether it had any.
    pub fn release(&self, task_id: &str) -> bool {
        let released = self.lock().remove(task_id).is_some();
        if released {
            debug!(task_id = %task_id, "Released port block");
        }
        released
    }

    /// Number of tasks holding a block
    pub fn allocated(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PortBlock>> {
        self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
