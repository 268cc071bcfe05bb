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

// Interactive editing over the uber surface. Edits run as compute work on
// a bounded GPU cache of the locked region; the mapped file stays
// authoritative and is only touched by `flush_lock_to_disk`. At any
// instant there is either no cache or one cache covering a rectangle;
// edits outside it report outside-lock and do nothing.

use crate::{
    bridge::{ShortCircuitBridge, ShortCircuitSource, ShortCircuitUpdate},
    progress::{NullProgress, Progress},
    store::UberSurface,
};
use anyhow::{ensure, Result};
use gpu::{
    BasicPacket, BindFlags, Box2d, CommandContext, ComputeDispatch, Device, ResourceDesc,
    ResourceLocator, ResourceViews, ShaderResourceView, SubResource, TexturePitches, UploadQueue,
    ViewKinds,
};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use zerocopy::{AsBytes, FromBytes};

#[derive(Clone, Copy, Debug)]
pub struct EditorConfig {
    /// Extra samples cached around a requested lock so small brush strokes
    /// nearby do not force a flush and re-prepare.
    pub cache_margin: u32,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self { cache_margin: 512 }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ToolResult {
    Success,
    /// No GPU cache covers the requested rectangle; no work was performed.
    OutsideLock,
    Failed,
}

/// Uniform block every tool shader receives; extra per-tool constants are
/// appended after it.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
pub struct ToolConstants {
    pub center: [f32; 2],
    pub radius: f32,
    pub strength: f32,
    pub cache_min: [u32; 2],
    pub cache_max: [u32; 2],
    pub adj_min: [u32; 2],
    pub adj_max: [u32; 2],
}

struct GpuCache {
    target: ResourceLocator,
    // Tools that sample their own neighborhood read from last frame's
    // snapshot while writing the target.
    copy: ResourceLocator,
    views: ResourceViews,
    min: [u32; 2],
    max: [u32; 2],
}

impl GpuCache {
    fn covers(&self, adj_min: [u32; 2], adj_max: [u32; 2]) -> bool {
        adj_min[0] >= self.min[0]
            && adj_min[1] >= self.min[1]
            && adj_max[0] <= self.max[0]
            && adj_max[1] <= self.max[1]
    }

    fn to_cache(&self, p: [u32; 2]) -> [u32; 2] {
        [p[0] - self.min[0], p[1] - self.min[1]]
    }
}

struct EditorState {
    surface: UberSurface,
    cache: Option<GpuCache>,
}

pub struct SurfaceEditor {
    device: Arc<dyn Device>,
    uploads: Arc<UploadQueue>,
    bridge: Arc<ShortCircuitBridge>,
    config: EditorConfig,
    state: Mutex<EditorState>,
}

impl SurfaceEditor {
    pub fn new(
        surface: UberSurface,
        uploads: Arc<UploadQueue>,
        bridge: Arc<ShortCircuitBridge>,
        config: EditorConfig,
    ) -> Arc<Self> {
        let device = uploads.device().clone();
        Arc::new(Self {
            device,
            uploads,
            bridge,
            config,
            state: Mutex::new(EditorState {
                surface,
                cache: None,
            }),
        })
    }

    /// Register this editor as the bridge's short-circuit source.
    pub fn bind_to_bridge(self: &Arc<Self>) {
        let weak: Weak<dyn ShortCircuitSource> = Arc::downgrade(&(self.clone() as Arc<dyn ShortCircuitSource>));
        self.bridge.set_source(weak);
    }

    pub fn bridge(&self) -> &Arc<ShortCircuitBridge> {
        &self.bridge
    }

    pub fn surface_extent(&self) -> [u32; 2] {
        let state = self.state.lock();
        [state.surface.width(), state.surface.height()]
    }

    pub fn cache_rect(&self) -> Option<([u32; 2], [u32; 2])> {
        self.state
            .lock()
            .cache
            .as_ref()
            .map(|cache| (cache.min, cache.max))
    }

    pub fn with_surface<R>(&self, f: impl FnOnce(&UberSurface) -> R) -> R {
        f(&self.state.lock().surface)
    }

    /// Ensure a GPU cache covers [adj_min, adj_max). A covering cache is a
    /// no-op; otherwise any current cache flushes to disk first and a new
    /// region around the request is uploaded.
    pub fn prepare_cache(&self, adj_min: [u32; 2], adj_max: [u32; 2]) -> Result<()> {
        let mut state = self.state.lock();
        ensure!(
            adj_min[0] < adj_max[0] && adj_min[1] < adj_max[1],
            "degenerate lock rectangle"
        );
        ensure!(
            adj_max[0] <= state.surface.width() && adj_max[1] <= state.surface.height(),
            "lock rectangle outside of surface"
        );
        if let Some(cache) = &state.cache {
            if cache.covers(adj_min, adj_max) {
                return Ok(());
            }
            self.flush_locked(&mut state, &mut NullProgress)?;
        }

        let margin = self.config.cache_margin;
        let center = [
            (adj_min[0] + adj_max[0]) / 2,
            (adj_min[1] + adj_max[1]) / 2,
        ];
        let min = [
            adj_min[0].min(center[0].saturating_sub(margin)),
            adj_min[1].min(center[1].saturating_sub(margin)),
        ];
        let max = [
            adj_max[0].max((center[0] + margin).min(state.surface.width())),
            adj_max[1].max((center[1] + margin).min(state.surface.height())),
        ];

        ensure!(
            state.surface.array_count() == 1,
            "GPU edit cache requires single-plane samples"
        );
        let width = max[0] - min[0];
        let height = max[1] - min[1];
        let desc = ResourceDesc::texture_2d(
            width,
            height,
            state.surface.format(),
            BindFlags::SHADER_RESOURCE
                | BindFlags::UNORDERED_ACCESS
                | BindFlags::TRANSFER_SRC
                | BindFlags::TRANSFER_DST,
            "uber-surface-edit-cache",
        );
        let bytes = state.surface.read_region(min, max)?;
        let pitches = TexturePitches::tight(width, height, state.surface.sample_bytes());
        // Synchronous on purpose: acquiring an edit lock is a cold-start
        // path and the caller expects the cache to be usable on return.
        let target = self
            .uploads
            .immediate(desc.clone(), &mut BasicPacket::new(bytes.clone(), pitches))?;
        let copy = self
            .uploads
            .immediate(desc, &mut BasicPacket::new(bytes, pitches))?;
        let views = ResourceViews::for_resource(target.resource(), ViewKinds::SRV | ViewKinds::UAV);
        debug!(
            "editor: prepared cache {:?}..{:?} for lock {:?}..{:?}",
            min, max, adj_min, adj_max
        );
        state.cache = Some(GpuCache {
            target,
            copy,
            views,
            min,
            max,
        });
        Ok(())
    }

    /// Run one tool dispatch over [adj_min, adj_max) and queue the matching
    /// short-circuit refresh.
    pub fn apply_tool(
        &self,
        adj_min: [u32; 2],
        adj_max: [u32; 2],
        shader: &str,
        center: [f32; 2],
        radius: f32,
        strength: f32,
        extra_constants: &[u8],
    ) -> ToolResult {
        {
            let state = self.state.lock();
            let cache = match &state.cache {
                Some(cache) if cache.covers(adj_min, adj_max) => cache,
                _ => return ToolResult::OutsideLock,
            };

            let mut constants = ToolConstants {
                center,
                radius,
                strength,
                cache_min: cache.min,
                cache_max: cache.max,
                adj_min,
                adj_max,
            }
            .as_bytes()
            .to_vec();
            constants.extend_from_slice(extra_constants);

            let rect = Box2d::new(cache.to_cache(adj_min), cache.to_cache(adj_max));
            let input_srv = ShaderResourceView {
                resource: cache.copy.resource().clone(),
                format_override: None,
                layer: None,
            };
            let output_uav = match &cache.views.uav {
                Some(uav) => uav.clone(),
                None => return ToolResult::Failed,
            };

            let mut ctx = self.device.begin_commands();
            // Snapshot for tools that sample their input neighborhood.
            ctx.copy_resource(cache.target.resource().clone(), cache.copy.resource().clone());
            ctx.dispatch(ComputeDispatch {
                shader: shader.to_owned(),
                constants,
                input: Some((input_srv, rect)),
                output: (output_uav, rect),
                aux: None,
            });
            let fence = self.device.submit(ctx);
            if !self.device.fence_completed(fence) {
                self.device.wait_fence(fence);
            }
        }
        self.bridge.queue_update(adj_min, adj_max);
        ToolResult::Success
    }

    /// Read the cache back into the mapped file, drop the cache, and steer
    /// the tile cache to reload from disk. Blocks on the GPU read-back.
    pub fn flush_lock_to_disk(&self, progress: &mut dyn Progress) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state, progress)
    }

    /// Drop the cache without persisting; visible tiles revert to disk
    /// state via abandons.
    pub fn abandon_lock(&self) {
        let rect = {
            let mut state = self.state.lock();
            state.cache.take().map(|cache| (cache.min, cache.max))
        };
        if let Some((min, max)) = rect {
            debug!("editor: abandoned lock {:?}..{:?}", min, max);
            self.bridge.queue_abandon(min, max);
        }
    }

    fn flush_locked(&self, state: &mut EditorState, progress: &mut dyn Progress) -> Result<()> {
        let cache = match state.cache.take() {
            Some(cache) => cache,
            None => return Ok(()),
        };
        let bytes = self
            .device
            .read_back(cache.target.resource(), SubResource::base())?;
        let row_pitch = (cache.max[0] - cache.min[0]) as usize
            * state.surface.sample_bytes() as usize;
        state
            .surface
            .write_region(cache.min, cache.max, &bytes, row_pitch)?;
        state.surface.flush()?;
        debug!("editor: flushed lock {:?}..{:?}", cache.min, cache.max);

        // Flush any queued refreshes of rolled-up edit state, then have the
        // renderer pick the cells back up from the authoritative file.
        self.bridge.queue_abandon(cache.min, cache.max);
        self.bridge.write_cells(cache.min, cache.max, progress)?;
        Ok(())
    }
}

impl ShortCircuitSource for SurfaceEditor {
    fn short_circuit(&self, uber_min: [u32; 2], uber_max: [u32; 2]) -> Option<ShortCircuitUpdate> {
        let state = self.state.lock();
        let cache = state.cache.as_ref()?;
        let min = [uber_min[0].max(cache.min[0]), uber_min[1].max(cache.min[1])];
        let max = [uber_max[0].min(cache.max[0]), uber_max[1].min(cache.max[1])];
        if min[0] >= max[0] || min[1] >= max[1] {
            return None;
        }
        let srv = match &cache.views.srv {
            Some(srv) => srv.clone(),
            None => {
                warn!("editor: cache resource born without an SRV");
                return None;
            }
        };
        Some(ShortCircuitUpdate {
            srv,
            min_in_resource: cache.to_cache(min),
            max_in_resource: cache.to_cache(max),
            uber_min: min,
            uber_max: max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools;
    use gpu::{software::SoftwareDevice, PoolConfig, ResourcePool, UploadConfig};

    fn editor_fixture(width: u32, height: u32) -> (Arc<SurfaceEditor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edit.uber");
        UberSurface::create_empty(&path, width, height, gpu::SampleFormat::R32Float, 1).unwrap();
        let surface = UberSurface::open(&path).unwrap();

        let device = SoftwareDevice::new();
        tools::register_software_tools(&device);
        let pool = ResourcePool::new(PoolConfig::default());
        let uploads = UploadQueue::new(device, pool, UploadConfig::default());
        let bridge = Arc::new(ShortCircuitBridge::new());
        let editor = SurfaceEditor::new(surface, uploads, bridge, EditorConfig::default());
        editor.bind_to_bridge();
        (editor, dir)
    }

    #[test]
    fn test_tool_outside_lock_does_nothing() {
        let (editor, _dir) = editor_fixture(256, 256);
        let result = editor.apply_tool(
            [0, 0],
            [16, 16],
            tools::SHADER_SET_VALUE,
            [8f32, 8f32],
            0f32,
            1f32,
            &[],
        );
        assert_eq!(result, ToolResult::OutsideLock);

        editor.prepare_cache([64, 64], [128, 128]).unwrap();
        let (min, max) = editor.cache_rect().unwrap();
        // Outside the cached rectangle still reports outside-lock.
        let result = editor.apply_tool(
            [min[0], min[1]],
            [max[0] + 1, max[1]],
            tools::SHADER_SET_VALUE,
            [0f32, 0f32],
            0f32,
            1f32,
            &[],
        );
        assert_eq!(result, ToolResult::OutsideLock);
    }

    #[test]
    fn test_edit_flush_and_reopen() {
        // prepare_cache on (64,64)-(128,128), set the box to 42, flush, and
        // the file must hold 42 inside the box and 0 outside it.
        let (editor, dir) = editor_fixture(256, 256);
        editor.prepare_cache([64, 64], [128, 128]).unwrap();
        let result = editor.apply_tool(
            [64, 64],
            [128, 128],
            tools::SHADER_SET_VALUE,
            [96f32, 96f32],
            0f32,
            42f32,
            &[],
        );
        assert_eq!(result, ToolResult::Success);
        editor.flush_lock_to_disk(&mut NullProgress).unwrap();
        assert!(editor.cache_rect().is_none());

        let surface = UberSurface::open(dir.path().join("edit.uber")).unwrap();
        assert_eq!(surface.sample_f32(96, 96), 42f32);
        assert_eq!(surface.sample_f32(32, 32), 0f32);
        assert_eq!(surface.sample_f32(128, 128), 0f32);
    }

    #[test]
    fn test_abandon_reverts_without_write() {
        let (editor, dir) = editor_fixture(128, 128);
        editor.prepare_cache([0, 0], [64, 64]).unwrap();
        editor.apply_tool(
            [0, 0],
            [64, 64],
            tools::SHADER_SET_VALUE,
            [32f32, 32f32],
            0f32,
            9f32,
            &[],
        );
        editor.abandon_lock();
        assert!(editor.cache_rect().is_none());
        let surface = UberSurface::open(dir.path().join("edit.uber")).unwrap();
        assert_eq!(surface.sample_f32(32, 32), 0f32);
    }

    #[test]
    fn test_short_circuit_reflects_live_cache() {
        let (editor, _dir) = editor_fixture(256, 256);
        assert!(editor.short_circuit([0, 0], [64, 64]).is_none());
        editor.prepare_cache([32, 32], [96, 96]).unwrap();
        let update = editor.short_circuit([32, 32], [96, 96]).expect("covered");
        assert!(!update.is_degenerate());
        let (cache_min, _) = editor.cache_rect().unwrap();
        assert_eq!(update.min_in_resource, [32 - cache_min[0], 32 - cache_min[1]]);
    }

    #[test]
    fn test_raise_tool_accumulates() {
        let (editor, _dir) = editor_fixture(128, 128);
        editor.prepare_cache([0, 0], [128, 128]).unwrap();
        for _ in 0..3 {
            let result = editor.apply_tool(
                [24, 24],
                [40, 40],
                tools::SHADER_RAISE,
                [32f32, 32f32],
                8f32,
                1f32,
                &[],
            );
            assert_eq!(result, ToolResult::Success);
        }
        editor.flush_lock_to_disk(&mut NullProgress).unwrap();
        editor.with_surface(|surface| {
            assert!(surface.sample_f32(32, 32) > 2.9f32);
            assert_eq!(surface.sample_f32(100, 100), 0f32);
        });
    }
}
