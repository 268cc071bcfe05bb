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

// GPU resource plumbing: descriptors and views, data packets, the resource
// pool, and the asynchronous upload queue that marshals CPU-produced bytes
// into device resources. The device itself is abstract; hardware backends
// implement the traits in `device`, and the in-tree `software` backend runs
// the same command stream on the CPU for tools and tests.

mod descriptor;
mod device;
mod locator;
mod packet;
mod pool;
pub mod software;
mod upload;

pub use crate::{
    descriptor::{
        AllocationRules, BindFlags, Box2d, CpuAccess, GpuAccess, PartialResource, ResourceDesc,
        ResourceShape, SampleFormat, SubResource, TextureDimension, TextureShape,
    },
    device::{
        CommandContext, ComputeDispatch, Device, DeviceResource, FenceValue, ResourceViews,
        ShaderResourceView, UnorderedAccessView, ViewKinds,
    },
    locator::ResourceLocator,
    packet::{BasicPacket, DataPacket, EmptyPacket, FailingPacket, FilePacket, TexturePitches},
    pool::{PoolConfig, ResourcePool},
    upload::{TransactionFlags, TransactionId, TransactionStatus, UploadConfig, UploadQueue},
};
