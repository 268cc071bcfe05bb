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
use crate::{
    descriptor::ResourceDesc,
    device::DeviceResource,
    pool::ResourcePool,
};
use std::{
    fmt,
    sync::{Arc, Weak},
};

struct LocatorShared {
    resource: Arc<dyn DeviceResource>,
    offset: u64,
    size: u64,
    pool: Weak<ResourcePool>,
    pool_marker: u64,
}

impl Drop for LocatorShared {
    fn drop(&mut self) {
        // Pool-backed allocations go home instead of dying. If the pool is
        // already gone the Arc free below is the only cleanup needed.
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(self.pool_marker, self.resource.clone());
        }
    }
}

/// Shared handle to a GPU resource, optionally narrowed to a byte range of
/// the parent. When the last holder drops, the allocation returns to the
/// pool that produced it.
#[derive(Clone)]
pub struct ResourceLocator {
    shared: Arc<LocatorShared>,
}

impl ResourceLocator {
    pub fn new_unpooled(resource: Arc<dyn DeviceResource>) -> Self {
        let size = resource.desc().byte_count();
        Self {
            shared: Arc::new(LocatorShared {
                resource,
                offset: 0,
                size,
                pool: Weak::new(),
                pool_marker: 0,
            }),
        }
    }

    pub(crate) fn new_pooled(
        resource: Arc<dyn DeviceResource>,
        pool: &Arc<ResourcePool>,
        pool_marker: u64,
    ) -> Self {
        let size = resource.desc().byte_count();
        Self {
            shared: Arc::new(LocatorShared {
                resource,
                offset: 0,
                size,
                pool: Arc::downgrade(pool),
                pool_marker,
            }),
        }
    }

    pub fn resource(&self) -> &Arc<dyn DeviceResource> {
        &self.shared.resource
    }

    pub fn desc(&self) -> &ResourceDesc {
        self.shared.resource.desc()
    }

    pub fn offset(&self) -> u64 {
        self.shared.offset
    }

    pub fn size(&self) -> u64 {
        self.shared.size
    }

    pub fn is_entire_resource(&self) -> bool {
        self.shared.offset == 0 && self.shared.size == self.desc().byte_count()
    }
}

impl fmt::Debug for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceLocator({} +{}:{})",
            self.desc().label,
            self.shared.offset,
            self.shared.size
        )
    }
}
