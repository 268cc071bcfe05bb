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

// A CPU realization of the device traits. Copies execute at submit; compute
// dispatches run named shader closures registered by the embedder. Tools
// and tests drive the full streaming pipeline against this backend; real
// hardware backends live outside the workspace.

use crate::{
    descriptor::{Box2d, ResourceDesc, ResourceShape, SubResource},
    device::{
        CommandContext, ComputeDispatch, Device, DeviceResource, FenceValue, ShaderResourceView,
    },
};
use anyhow::{anyhow, bail, ensure, Result};
use fxhash::FxHashMap;
use log::{trace, warn};
use parking_lot::Mutex;
use std::{any::Any, fmt, sync::Arc};

pub type ShaderFn = Arc<dyn Fn(&mut ShaderIo) -> Result<()> + Send + Sync>;

pub struct SoftwareDevice {
    fences: Mutex<FenceState>,
    shaders: Mutex<FxHashMap<String, ShaderFn>>,
}

#[derive(Default)]
struct FenceState {
    next: FenceValue,
    completed: FenceValue,
}

impl fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SoftwareDevice")
    }
}

impl SoftwareDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fences: Mutex::new(FenceState::default()),
            shaders: Mutex::new(FxHashMap::default()),
        })
    }

    /// Bind a compute shader body to a dispatch name.
    pub fn register_shader<S, F>(&self, name: S, body: F)
    where
        S: Into<String>,
        F: Fn(&mut ShaderIo) -> Result<()> + Send + Sync + 'static,
    {
        self.shaders.lock().insert(name.into(), Arc::new(body));
    }

    fn run_dispatch(&self, dispatch: &ComputeDispatch) -> Result<()> {
        let shader = self
            .shaders
            .lock()
            .get(&dispatch.shader)
            .cloned()
            .ok_or_else(|| anyhow!("no shader registered as {}", dispatch.shader))?;

        // Snapshot the input region first so that input and output may
        // alias the same resource without deadlocking the layer locks.
        let input = match &dispatch.input {
            Some((view, rect)) => Some(snapshot_view(view, *rect)?),
            None => None,
        };

        let (out_view, out_rect) = &dispatch.output;
        let out_res = software_resource(&out_view.resource)?;
        let out_layer = out_view.layer.unwrap_or(0);
        let (out_width, out_height) = out_res.layer_extent();
        let mut out_guard = out_res.lock_layer(SubResource::layer(out_layer))?;

        let mut aux_guard = match &dispatch.aux {
            Some((aux_view, _slot)) => {
                let aux_res = software_resource(&aux_view.resource)?;
                Some(aux_res.lock_layer(SubResource::base())?)
            }
            None => None,
        };

        let output = GridMut {
            data: out_guard.as_mut_slice(),
            width: out_width,
            height: out_height,
            sample_bytes: out_res.sample_bytes(),
            rect: *out_rect,
        };
        let aux_slot = dispatch.aux.as_ref().map(|(_, slot)| *slot).unwrap_or(0);
        let aux = aux_guard.as_mut().map(|guard| AuxMut {
            data: guard.as_mut_slice(),
            slot: aux_slot,
        });
        let mut io = ShaderIo {
            constants: &dispatch.constants,
            input,
            output,
            aux,
        };
        shader(&mut io)
    }
}

impl Device for SoftwareDevice {
    fn validate(&self, desc: &ResourceDesc) -> Result<()> {
        match &desc.shape {
            ResourceShape::LinearBuffer { byte_count } => {
                ensure!(*byte_count > 0, "zero-length buffer descriptor");
            }
            ResourceShape::Texture(shape) => {
                ensure!(
                    shape.width > 0 && shape.height > 0 && shape.depth_or_layers > 0,
                    "degenerate texture descriptor {}x{}x{}",
                    shape.width,
                    shape.height,
                    shape.depth_or_layers
                );
                ensure!(shape.mip_count >= 1, "texture descriptor without mips");
                ensure!(
                    shape.sample_count == 1,
                    "software backend does not realize multisampled textures"
                );
            }
        }
        Ok(())
    }

    fn create_resource(&self, desc: &ResourceDesc) -> Result<Arc<dyn DeviceResource>> {
        self.validate(desc)?;
        Ok(Arc::new(SoftwareResource::new(desc.clone())))
    }

    fn begin_commands(&self) -> Box<dyn CommandContext> {
        Box::new(SoftwareCommands { ops: Vec::new() })
    }

    fn submit(&self, commands: Box<dyn CommandContext>) -> FenceValue {
        let commands = commands
            .into_any()
            .downcast::<SoftwareCommands>()
            .expect("submitted commands from a different backend");
        for op in commands.ops {
            if let Err(err) = self.execute(op) {
                // A hardware queue would device-lost here; absorbing with a
                // warning keeps streaming tests observable.
                warn!("software submit dropped op: {}", err);
            }
        }
        let mut fences = self.fences.lock();
        fences.next += 1;
        fences.completed = fences.next;
        fences.next
    }

    fn fence_completed(&self, fence: FenceValue) -> bool {
        fence <= self.fences.lock().completed
    }

    fn wait_fence(&self, fence: FenceValue) {
        // Submission completes synchronously; nothing to wait on.
        debug_assert!(self.fence_completed(fence));
    }

    fn read_back(&self, resource: &Arc<dyn DeviceResource>, sub: SubResource) -> Result<Vec<u8>> {
        software_resource(resource)?.read_layer(sub)
    }
}

impl SoftwareDevice {
    fn execute(&self, op: RecordedOp) -> Result<()> {
        match op {
            RecordedOp::WriteBytes {
                target,
                sub,
                dst_box,
                row_pitch,
                data,
            } => {
                let res = software_resource(&target)?;
                res.write_bytes(sub, dst_box, row_pitch, &data)
            }
            RecordedOp::CopyResource { source, target } => {
                let src = software_resource(&source)?;
                let dst = software_resource(&target)?;
                ensure!(
                    src.desc() == dst.desc(),
                    "whole-resource copy between mismatched descriptors"
                );
                for index in 0..src.sub_count() {
                    let bytes = src.read_index(index)?;
                    dst.write_index(index, bytes)?;
                }
                Ok(())
            }
            RecordedOp::Dispatch(dispatch) => {
                trace!("software dispatch {}", dispatch.shader);
                self.run_dispatch(&dispatch)
            }
        }
    }
}

enum RecordedOp {
    WriteBytes {
        target: Arc<dyn DeviceResource>,
        sub: SubResource,
        dst_box: Option<Box2d>,
        row_pitch: u32,
        data: Vec<u8>,
    },
    CopyResource {
        source: Arc<dyn DeviceResource>,
        target: Arc<dyn DeviceResource>,
    },
    Dispatch(ComputeDispatch),
}

pub struct SoftwareCommands {
    ops: Vec<RecordedOp>,
}

impl CommandContext for SoftwareCommands {
    fn copy_bytes_to_resource(
        &mut self,
        target: Arc<dyn DeviceResource>,
        sub: SubResource,
        dst_box: Option<Box2d>,
        row_pitch: u32,
        data: Vec<u8>,
    ) {
        self.ops.push(RecordedOp::WriteBytes {
            target,
            sub,
            dst_box,
            row_pitch,
            data,
        });
    }

    fn copy_resource(&mut self, source: Arc<dyn DeviceResource>, target: Arc<dyn DeviceResource>) {
        self.ops.push(RecordedOp::CopyResource { source, target });
    }

    fn dispatch(&mut self, dispatch: ComputeDispatch) {
        self.ops.push(RecordedOp::Dispatch(dispatch));
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Backing store: one zero-initialized buffer per (mip, layer).
pub struct SoftwareResource {
    desc: ResourceDesc,
    subs: Vec<Mutex<Vec<u8>>>,
}

impl fmt::Debug for SoftwareResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SoftwareResource({})", self.desc.label)
    }
}

impl SoftwareResource {
    fn new(desc: ResourceDesc) -> Self {
        let mut subs = Vec::new();
        match &desc.shape {
            ResourceShape::LinearBuffer { byte_count } => {
                subs.push(Mutex::new(vec![0u8; *byte_count as usize]));
            }
            ResourceShape::Texture(shape) => {
                for mip in 0..shape.mip_count as u32 {
                    for _layer in 0..shape.layer_count() {
                        subs.push(Mutex::new(vec![0u8; shape.layer_byte_count(mip) as usize]));
                    }
                }
            }
        }
        Self { desc, subs }
    }

    fn layer_count(&self) -> u32 {
        match &self.desc.shape {
            ResourceShape::LinearBuffer { .. } => 1,
            ResourceShape::Texture(shape) => shape.layer_count(),
        }
    }

    fn sub_count(&self) -> usize {
        self.subs.len()
    }

    fn sub_index(&self, sub: SubResource) -> Result<usize> {
        let index = sub.mip as usize * self.layer_count() as usize + sub.layer as usize;
        ensure!(
            index < self.subs.len(),
            "subresource {:?} outside of {}",
            sub,
            self.desc.label
        );
        Ok(index)
    }

    fn layer_extent(&self) -> (u32, u32) {
        match &self.desc.shape {
            ResourceShape::LinearBuffer { byte_count } => (*byte_count as u32, 1),
            ResourceShape::Texture(shape) => (shape.width, shape.height),
        }
    }

    fn sample_bytes(&self) -> u32 {
        match &self.desc.shape {
            ResourceShape::LinearBuffer { .. } => 1,
            ResourceShape::Texture(shape) => shape.format.sample_bytes(),
        }
    }

    fn lock_layer(&self, sub: SubResource) -> Result<parking_lot::MutexGuard<'_, Vec<u8>>> {
        Ok(self.subs[self.sub_index(sub)?].lock())
    }

    pub fn read_layer(&self, sub: SubResource) -> Result<Vec<u8>> {
        Ok(self.lock_layer(sub)?.clone())
    }

    fn read_index(&self, index: usize) -> Result<Vec<u8>> {
        Ok(self.subs[index].lock().clone())
    }

    fn write_index(&self, index: usize, bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.subs[index].lock();
        ensure!(guard.len() == bytes.len(), "copy size mismatch");
        *guard = bytes;
        Ok(())
    }

    fn write_bytes(
        &self,
        sub: SubResource,
        dst_box: Option<Box2d>,
        row_pitch: u32,
        data: &[u8],
    ) -> Result<()> {
        let (width, height) = self.layer_extent();
        let sample_bytes = self.sample_bytes();
        let mut guard = self.lock_layer(sub)?;
        let dst_box = dst_box.unwrap_or(Box2d::new([0, 0], [width, height]));
        ensure!(
            dst_box.max[0] <= width && dst_box.max[1] <= height,
            "destination box outside of {}",
            self.desc.label
        );
        let row_bytes = (dst_box.width() * sample_bytes) as usize;
        let src_pitch = if row_pitch == 0 { row_bytes } else { row_pitch as usize };
        let dst_pitch = (width * sample_bytes) as usize;
        for y in 0..dst_box.height() as usize {
            let src_start = y * src_pitch;
            ensure!(
                src_start + row_bytes <= data.len(),
                "packet bytes shorter than destination box"
            );
            let dst_start = (dst_box.min[1] as usize + y) * dst_pitch
                + dst_box.min[0] as usize * sample_bytes as usize;
            guard[dst_start..dst_start + row_bytes]
                .copy_from_slice(&data[src_start..src_start + row_bytes]);
        }
        Ok(())
    }
}

impl DeviceResource for SoftwareResource {
    fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn software_resource(resource: &Arc<dyn DeviceResource>) -> Result<&SoftwareResource> {
    match resource.as_any().downcast_ref::<SoftwareResource>() {
        Some(res) => Ok(res),
        None => bail!("resource belongs to a different backend"),
    }
}

fn snapshot_view(view: &ShaderResourceView, rect: Box2d) -> Result<GridSnapshot> {
    let res = software_resource(&view.resource)?;
    let (width, height) = res.layer_extent();
    let data = res.read_layer(SubResource::layer(view.layer.unwrap_or(0)))?;
    Ok(GridSnapshot {
        data,
        width,
        height,
        sample_bytes: res.sample_bytes(),
        rect,
    })
}

/// Read-only snapshot of a source layer, taken before the shader runs.
pub struct GridSnapshot {
    data: Vec<u8>,
    width: u32,
    height: u32,
    sample_bytes: u32,
    pub rect: Box2d,
}

impl GridSnapshot {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample(&self, x: u32, y: u32) -> &[u8] {
        debug_assert!(x < self.width && y < self.height);
        let start = (y as usize * self.width as usize + x as usize) * self.sample_bytes as usize;
        &self.data[start..start + self.sample_bytes as usize]
    }

    pub fn sample_f32(&self, x: u32, y: u32) -> f32 {
        let raw = self.sample(x, y);
        f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }
}

/// Mutable window over the destination layer.
pub struct GridMut<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
    sample_bytes: u32,
    pub rect: Box2d,
}

impl<'a> GridMut<'a> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_bytes(&self) -> u32 {
        self.sample_bytes
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        (y as usize * self.width as usize + x as usize) * self.sample_bytes as usize
    }

    pub fn sample(&self, x: u32, y: u32) -> &[u8] {
        let start = self.offset(x, y);
        &self.data[start..start + self.sample_bytes as usize]
    }

    pub fn sample_mut(&mut self, x: u32, y: u32) -> &mut [u8] {
        let start = self.offset(x, y);
        &mut self.data[start..start + self.sample_bytes as usize]
    }

    pub fn sample_f32(&self, x: u32, y: u32) -> f32 {
        let raw = self.sample(x, y);
        f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    pub fn write_f32(&mut self, x: u32, y: u32, value: f32) {
        self.sample_mut(x, y).copy_from_slice(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, x: u32, y: u32, value: u16) {
        self.sample_mut(x, y).copy_from_slice(&value.to_le_bytes());
    }
}

/// One record of a linear auxiliary buffer, addressed by slot.
pub struct AuxMut<'a> {
    data: &'a mut [u8],
    pub slot: u32,
}

impl<'a> AuxMut<'a> {
    pub fn record_mut(&mut self, stride: usize) -> &mut [u8] {
        let start = self.slot as usize * stride;
        &mut self.data[start..start + stride]
    }
}

pub struct ShaderIo<'a> {
    pub constants: &'a [u8],
    pub input: Option<GridSnapshot>,
    pub output: GridMut<'a>,
    pub aux: Option<AuxMut<'a>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{BindFlags, SampleFormat},
        device::UnorderedAccessView,
    };

    fn r32_desc(label: &str) -> ResourceDesc {
        ResourceDesc::texture_2d(
            4,
            4,
            SampleFormat::R32Float,
            BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS,
            label,
        )
    }

    #[test]
    fn test_boxed_write_and_read_back() {
        let device = SoftwareDevice::new();
        let res = device
            .create_resource(&ResourceDesc::texture_2d(
                4,
                4,
                SampleFormat::R8Unorm,
                BindFlags::SHADER_RESOURCE,
                "t",
            ))
            .unwrap();
        let mut ctx = device.begin_commands();
        ctx.copy_bytes_to_resource(
            res.clone(),
            SubResource::base(),
            Some(Box2d::new([1, 1], [3, 3])),
            2,
            vec![7u8, 8, 9, 10],
        );
        let fence = device.submit(ctx);
        assert!(device.fence_completed(fence));
        let bytes = device.read_back(&res, SubResource::base()).unwrap();
        assert_eq!(bytes[4 + 1], 7);
        assert_eq!(bytes[4 + 2], 8);
        assert_eq!(bytes[8 + 1], 9);
        assert_eq!(bytes[8 + 2], 10);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn test_dispatch_runs_registered_shader() {
        let device = SoftwareDevice::new();
        device.register_shader("fill", |io: &mut ShaderIo| {
            let rect = io.output.rect;
            for y in rect.min[1]..rect.max[1] {
                for x in rect.min[0]..rect.max[0] {
                    io.output.write_f32(x, y, 42f32);
                }
            }
            Ok(())
        });
        let res = device.create_resource(&r32_desc("t")).unwrap();
        let uav = UnorderedAccessView {
            resource: res.clone(),
            format_override: None,
            layer: None,
        };
        let mut ctx = device.begin_commands();
        ctx.dispatch(ComputeDispatch {
            shader: "fill".to_owned(),
            constants: Vec::new(),
            input: None,
            output: (uav, Box2d::new([0, 0], [2, 2])),
            aux: None,
        });
        device.submit(ctx);
        let bytes = device.read_back(&res, SubResource::base()).unwrap();
        let sample = |x: usize, y: usize| {
            let s = (y * 4 + x) * 4;
            f32::from_le_bytes([bytes[s], bytes[s + 1], bytes[s + 2], bytes[s + 3]])
        };
        assert_eq!(sample(0, 0), 42f32);
        assert_eq!(sample(1, 1), 42f32);
        assert_eq!(sample(2, 2), 0f32);
    }

    #[test]
    fn test_self_referencing_dispatch_snapshots_input() {
        let device = SoftwareDevice::new();
        device.register_shader("shift", |io: &mut ShaderIo| {
            let input = io.input.as_ref().expect("input bound");
            let rect = io.output.rect;
            for y in rect.min[1]..rect.max[1] {
                for x in rect.min[0]..rect.max[0] {
                    let v = input.sample_f32(x, y) + 1f32;
                    io.output.write_f32(x, y, v);
                }
            }
            Ok(())
        });
        let res = device.create_resource(&r32_desc("t")).unwrap();
        let srv = ShaderResourceView {
            resource: res.clone(),
            format_override: None,
            layer: None,
        };
        let uav = UnorderedAccessView {
            resource: res.clone(),
            format_override: None,
            layer: None,
        };
        let rect = Box2d::new([0, 0], [4, 4]);
        let mut ctx = device.begin_commands();
        ctx.dispatch(ComputeDispatch {
            shader: "shift".to_owned(),
            constants: Vec::new(),
            input: Some((srv, rect)),
            output: (uav, rect),
            aux: None,
        });
        device.submit(ctx);
        let bytes = device.read_back(&res, SubResource::base()).unwrap();
        assert_eq!(
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            1f32
        );
    }
}
