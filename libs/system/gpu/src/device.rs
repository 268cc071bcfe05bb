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
use crate::descriptor::{Box2d, ResourceDesc, SampleFormat, SubResource};
use anyhow::Result;
use bitflags::bitflags;
use std::{any::Any, fmt, sync::Arc};

/// Monotonic per-device submission marker. A fence is "completed" once the
/// device has retired all work submitted at or before it.
pub type FenceValue = u64;

pub trait DeviceResource: Send + Sync + fmt::Debug {
    fn desc(&self) -> &ResourceDesc;
    fn as_any(&self) -> &dyn Any;
}

bitflags! {
    pub struct ViewKinds: u32 {
        const SRV = 1 << 0;
        const UAV = 1 << 1;
        const RTV = 1 << 2;
        const DSV = 1 << 3;
    }
}

/// Read-only view of a resource, optionally reinterpreted or narrowed to a
/// single array layer.
#[derive(Clone, Debug)]
pub struct ShaderResourceView {
    pub resource: Arc<dyn DeviceResource>,
    pub format_override: Option<SampleFormat>,
    pub layer: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct UnorderedAccessView {
    pub resource: Arc<dyn DeviceResource>,
    pub format_override: Option<SampleFormat>,
    pub layer: Option<u32>,
}

/// The views a resource was born with; only the kinds its consumer asked
/// for are populated.
#[derive(Clone, Debug, Default)]
pub struct ResourceViews {
    pub srv: Option<ShaderResourceView>,
    pub uav: Option<UnorderedAccessView>,
}

impl ResourceViews {
    pub fn for_resource(resource: &Arc<dyn DeviceResource>, kinds: ViewKinds) -> Self {
        Self {
            srv: kinds.contains(ViewKinds::SRV).then(|| ShaderResourceView {
                resource: resource.clone(),
                format_override: None,
                layer: None,
            }),
            uav: kinds.contains(ViewKinds::UAV).then(|| UnorderedAccessView {
                resource: resource.clone(),
                format_override: None,
                layer: None,
            }),
        }
    }
}

/// One compute invocation over a destination rectangle, with an optional
/// source view and an optional auxiliary per-slot record target.
#[derive(Clone, Debug)]
pub struct ComputeDispatch {
    pub shader: String,
    pub constants: Vec<u8>,
    pub input: Option<(ShaderResourceView, Box2d)>,
    pub output: (UnorderedAccessView, Box2d),
    pub aux: Option<(UnorderedAccessView, u32)>,
}

/// Records copy and compute work; all recorded work becomes visible in
/// submission order once the returned fence completes.
pub trait CommandContext: Send {
    fn copy_bytes_to_resource(
        &mut self,
        target: Arc<dyn DeviceResource>,
        sub: SubResource,
        dst_box: Option<Box2d>,
        row_pitch: u32,
        data: Vec<u8>,
    );

    fn copy_resource(&mut self, source: Arc<dyn DeviceResource>, target: Arc<dyn DeviceResource>);

    fn dispatch(&mut self, dispatch: ComputeDispatch);

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

pub trait Device: Send + Sync + fmt::Debug {
    /// Reject descriptors the device cannot realize. Surfaces the
    /// invalid-descriptor error kind from create paths.
    fn validate(&self, desc: &ResourceDesc) -> Result<()>;

    fn create_resource(&self, desc: &ResourceDesc) -> Result<Arc<dyn DeviceResource>>;

    fn begin_commands(&self) -> Box<dyn CommandContext>;

    fn submit(&self, commands: Box<dyn CommandContext>) -> FenceValue;

    fn fence_completed(&self, fence: FenceValue) -> bool;

    /// Blocks; only the documented stall points use this.
    fn wait_fence(&self, fence: FenceValue);

    /// Synchronous GPU->CPU copy of one subresource. Documented stall.
    fn read_back(&self, resource: &Arc<dyn DeviceResource>, sub: SubResource) -> Result<Vec<u8>>;
}
