//! Shared-memory regions for large invocation payloads.
//!
//! When shared-memory transfer is negotiated, the host writes eligible
//! inputs into a named region and sends only a descriptor over the wire;
//! the worker does the same for outputs. Regions are reference counted:
//! the allocator holds the first reference, the function data cache may
//! take another to pin an output for reuse, and a region is dropped when
//! the count reaches zero.

use dashmap::DashMap;
use meridian_proto::{RpcSharedMemory, SharedMemoryDataType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{CoreError, Result};

/// Default payload size above which transfer switches to shared memory (1 MB).
pub const DEFAULT_TRANSFER_THRESHOLD: usize = 1024 * 1024;

struct Region {
    bytes: Vec<u8>,
    refs: usize,
}

/// Process-wide owner of named shared-memory regions.
///
/// Writer discipline is single-writer per region: the allocating side
/// fills the region once, readers only copy out.
#[derive(Default)]
pub struct SharedMemoryManager {
    regions: DashMap<String, Region>,
    counter: AtomicU64,
}

impl SharedMemoryManager {
    /// Creates a new manager with no regions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Allocates a region holding a copy of `payload` and returns its
    /// descriptor. The region starts with one reference.
    pub fn allocate(&self, payload: &[u8], data_type: SharedMemoryDataType) -> RpcSharedMemory {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("meridian-region-{sequence}-{}", uuid::Uuid::new_v4());

        trace!(region = %name, len = payload.len(), "allocated shared memory region");

        self.regions.insert(
            name.clone(),
            Region {
                bytes: payload.to_vec(),
                refs: 1,
            },
        );

        RpcSharedMemory {
            name,
            offset: 0,
            count: payload.len() as u64,
            data_type,
        }
    }

    /// Copies the payload a descriptor points at out of its region.
    pub fn read(&self, descriptor: &RpcSharedMemory) -> Result<Vec<u8>> {
        let region = self
            .regions
            .get(&descriptor.name)
            .ok_or_else(|| CoreError::RegionNotFound(descriptor.name.clone()))?;

        let start = usize::try_from(descriptor.offset).map_err(|_| CoreError::RegionOutOfRange {
            name: descriptor.name.clone(),
            offset: descriptor.offset,
            count: descriptor.count,
            len: region.bytes.len(),
        })?;
        let count = usize::try_from(descriptor.count).map_err(|_| CoreError::RegionOutOfRange {
            name: descriptor.name.clone(),
            offset: descriptor.offset,
            count: descriptor.count,
            len: region.bytes.len(),
        })?;

        let end = start.checked_add(count).filter(|end| *end <= region.bytes.len());
        let Some(end) = end else {
            return Err(CoreError::RegionOutOfRange {
                name: descriptor.name.clone(),
                offset: descriptor.offset,
                count: descriptor.count,
                len: region.bytes.len(),
            });
        };

        Ok(region.bytes[start..end].to_vec())
    }

    /// Takes an additional reference on a region.
    pub fn retain(&self, name: &str) -> Result<()> {
        let mut region = self
            .regions
            .get_mut(name)
            .ok_or_else(|| CoreError::RegionNotFound(name.to_owned()))?;
        region.refs += 1;
        Ok(())
    }

    /// Releases one reference; the region is dropped at zero.
    ///
    /// Releasing an unknown region is a no-op so double releases on
    /// failure paths stay harmless.
    pub fn release(&self, name: &str) {
        let drop_region = {
            let Some(mut region) = self.regions.get_mut(name) else {
                return;
            };
            region.refs = region.refs.saturating_sub(1);
            region.refs == 0
        };

        if drop_region {
            debug!(region = %name, "dropping shared memory region");
            self.regions.remove(name);
        }
    }

    /// Returns the number of live regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

/// Process-wide cache pinning worker outputs for reuse by later
/// invocations.
///
/// A put retains the backing region; eviction releases it. Capacity is
/// bounded; inserting past it evicts the oldest entry.
pub struct FunctionDataCache {
    manager: Arc<SharedMemoryManager>,
    entries: DashMap<String, RpcSharedMemory>,
    order: Mutex<Vec<String>>,
    capacity: usize,
    enabled: bool,
}

impl FunctionDataCache {
    /// Creates a cache over the given manager.
    #[must_use]
    pub fn new(manager: Arc<SharedMemoryManager>, capacity: usize, enabled: bool) -> Self {
        Self {
            manager,
            entries: DashMap::new(),
            order: Mutex::new(Vec::new()),
            capacity,
            enabled,
        }
    }

    /// Creates a disabled cache, for hosts that never pin outputs.
    #[must_use]
    pub fn disabled(manager: Arc<SharedMemoryManager>) -> Self {
        Self::new(manager, 0, false)
    }

    /// True if pinning is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pins a descriptor's region under `key`. Returns false when the
    /// cache is disabled or the region is gone.
    pub fn put(&self, key: impl Into<String>, descriptor: RpcSharedMemory) -> bool {
        if !self.enabled {
            return false;
        }
        if self.manager.retain(&descriptor.name).is_err() {
            return false;
        }

        let key = key.into();

        if let Some(previous) = self.entries.insert(key.clone(), descriptor) {
            self.manager.release(&previous.name);
        }

        let evict = {
            let mut order = self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            order.retain(|k| k != &key);
            order.push(key);
            if order.len() > self.capacity {
                Some(order.remove(0))
            } else {
                None
            }
        };

        if let Some(oldest) = evict {
            self.evict(&oldest);
        }

        true
    }

    /// Looks up a pinned descriptor.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<RpcSharedMemory> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Evicts an entry, releasing its region reference.
    pub fn evict(&self, key: &str) {
        if let Some((_, descriptor)) = self.entries.remove(key) {
            let mut order = self.order.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            order.retain(|k| k != key);
            drop(order);
            self.manager.release(&descriptor.name);
        }
    }

    /// Number of pinned entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is pinned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
