// This file is part of Loess.
//
// Loess is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Loess is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Loess.  If not, see <http://www.gnu.org/licenses/>.
use crate::{descriptor::ResourceDesc, device::DeviceResource, locator::ResourceLocator};
use fxhash::FxHashMap;
use log::trace;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Unused count per signature above which the reaper starts trimming.
    pub high_water: usize,
    /// Frames a pooled resource must sit idle before it can be reaped.
    pub idle_frames: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            high_water: 32,
            idle_frames: 120,
        }
    }
}

struct PooledEntry {
    resource: Arc<dyn DeviceResource>,
    idle_since: u64,
}

/// Recycles retired GPU resources by descriptor signature. A resource is
/// always in exactly one place: on a shelf here, inside one locator, or on
/// its way to destruction.
pub struct ResourcePool {
    config: PoolConfig,
    frame: AtomicU64,
    shelves: Mutex<FxHashMap<u64, Vec<PooledEntry>>>,
}

impl ResourcePool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            frame: AtomicU64::new(0),
            shelves: Mutex::new(FxHashMap::default()),
        })
    }

    /// A pooled resource with exactly this descriptor, if one is shelved.
    /// The caller owns it until the returned locator drops.
    pub fn acquire(self: &Arc<Self>, desc: &ResourceDesc) -> Option<ResourceLocator> {
        let marker = desc.signature_hash();
        let mut shelves = self.shelves.lock();
        let shelf = shelves.get_mut(&marker)?;
        let entry = shelf.pop()?;
        // Hash collisions across signatures would hand back the wrong
        // shape; check the full descriptor before trusting the shelf.
        if entry.resource.desc() != desc {
            shelf.push(entry);
            return None;
        }
        trace!("pool: reusing {} ({:016x})", desc.label, marker);
        Some(ResourceLocator::new_pooled(entry.resource, self, marker))
    }

    pub(crate) fn give_back(&self, marker: u64, resource: Arc<dyn DeviceResource>) {
        let idle_since = self.frame.load(Ordering::Relaxed);
        self.shelves
            .lock()
            .entry(marker)
            .or_default()
            .push(PooledEntry {
                resource,
                idle_since,
            });
    }

    /// Trim shelves that grew past the high-water mark, oldest idlers
    /// first. Called once per frame.
    pub fn reap(&self, frame: u64) {
        self.frame.store(frame, Ordering::Relaxed);
        let mut shelves = self.shelves.lock();
        for (marker, shelf) in shelves.iter_mut() {
            if shelf.len() <= self.config.high_water {
                continue;
            }
            shelf.sort_by_key(|e| e.idle_since);
            let excess = shelf.len() - self.config.high_water;
            let idle_limit = frame.saturating_sub(self.config.idle_frames);
            let mut dropped = 0;
            shelf.retain(|entry| {
                if dropped < excess && entry.idle_since <= idle_limit {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
            if dropped > 0 {
                trace!("pool: reaped {} of shelf {:016x}", dropped, marker);
            }
        }
        shelves.retain(|_, shelf| !shelf.is_empty());
    }

    pub fn pooled_count(&self) -> usize {
        self.shelves.lock().values().map(Vec::len).sum()
    }
}
