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

// The cell render cache: per frame it culls cells, collapses the LOD
// quadtree for the current view, makes the surviving nodes' tiles resident
// (or queues them), applies short-circuit edits to tiles that already are,
// and emits draw records. All of it runs on the render thread; the only
// concurrency is inside the upload queue it feeds.
//
// Frame order matters and is fixed: upload completions land first, then
// short-circuit abandons, then short-circuit updates, then the cull and
// collapse pass, then new upload scheduling.

mod collapse;
mod scaffold;
mod short_circuit;
mod tile;

pub use crate::{
    collapse::{neighbours, CollapseCell, CollapseContext, CollapseNode, NodeId, MAX_LOD_LEVELS},
    scaffold::{
        CellFileBuilder, CellFileHeader, CellScaffold, FieldRecord, NodeDesc, NodeRecord,
        CELL_FILE_MAGIC, CELL_FILE_VERSION, NODE_HOLE,
    },
    short_circuit::{
        make_refresh_dispatch, register_software_shaders, TileCopyConstants,
        SHADER_HEIGHT_TILE_COPY, SHADER_TILE_COPY, TILE_INFO_STRIDE,
    },
    tile::{NodeCoverageInfo, TextureTile, TextureTileSet, TileAddress, TileSetDesc, TileSetError},
};

use anyhow::Result;
use bitflags::bitflags;
use catalog::{Catalog, FileId};
use float_ord::FloatOrd;
use fxhash::FxHashMap;
use geometry::{cull_aabb, Aabb};
use gpu::{CommandContext, Device, SampleFormat, UnorderedAccessView, UploadQueue};
use log::{debug, trace, warn};
use nalgebra::{Matrix4, Point3, Vector3};
use smallvec::SmallVec;
use std::sync::Arc;
use uber_surface::{ResolvedUpdate, ShortCircuitBridge};

pub const MAX_COVERAGE_LAYERS: usize = 4;

#[derive(Clone, Debug)]
pub struct CoverageLayerDef {
    pub id: u32,
    pub format: SampleFormat,
    pub element_size: u32,
}

#[derive(Clone, Debug)]
pub struct TerrainConfig {
    pub heights_element_size: u32,
    pub heights_format: SampleFormat,
    pub coverage_layers: Vec<CoverageLayerDef>,
    /// Tile set shape shared by all layers.
    pub elements_per_layer: [u32; 2],
    pub layer_count: u32,
    pub screen_edge_threshold: f32,
    pub start_lod: usize,
    pub frame_upload_limit: usize,
    pub active_upload_limit: usize,
    pub cached_cell_limit: usize,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            heights_element_size: 32,
            heights_format: SampleFormat::R16Uint,
            coverage_layers: Vec::new(),
            elements_per_layer: [8, 8],
            layer_count: 4,
            screen_edge_threshold: 384f32,
            start_lod: 1,
            frame_upload_limit: 500,
            active_upload_limit: 1000,
            cached_cell_limit: 64,
        }
    }
}

/// How downstream code names a cell to the cache. Cells can overlap or
/// swap in and out over time; the hash is the identity.
#[derive(Clone, Debug)]
pub struct CellId {
    pub hash: u64,
    pub cell_to_world: Matrix4<f32>,
    pub aabb_min: [f32; 3],
    pub aabb_max: [f32; 3],
    pub heights_file: String,
    pub coverage_files: Vec<(u32, String)>,
}

#[derive(Clone, Debug)]
pub struct ViewContext {
    pub world_to_projection: Matrix4<f32>,
    pub view_position: [f32; 3],
    pub viewport: [u32; 2],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LayerKind {
    Heights,
    Coverage(u32),
}

bitflags! {
    pub struct QueuedNodeFlags: u32 {
        const HAS_VALID_DATA = 1 << 0;
        const NEEDS_HEIGHT_UPLOAD = 1 << 1;
        const NEEDS_COVERAGE_UPLOAD0 = 1 << 2;
        const NEEDS_COVERAGE_UPLOAD1 = 1 << 3;
        const NEEDS_COVERAGE_UPLOAD2 = 1 << 4;
        const NEEDS_COVERAGE_UPLOAD3 = 1 << 5;
    }
}

impl QueuedNodeFlags {
    fn coverage(index: usize) -> Self {
        Self::from_bits(Self::NEEDS_COVERAGE_UPLOAD0.bits() << index).expect("within layer cap")
    }
}

#[derive(Clone, Debug)]
pub struct QueuedNode {
    pub cell_hash: u64,
    pub node_index: u32,
    pub lod_field: u32,
    pub flags: QueuedNodeFlags,
    /// Squared distance from node center to the camera; lower uploads
    /// sooner.
    pub priority: f32,
    pub neighbour_lod_diff: [i8; 4],
}

/// Everything the draw callback needs to render one node.
#[derive(Clone, Debug)]
pub struct NodeDrawRecord {
    pub cell_hash: u64,
    pub node_index: u32,
    pub lod_field: u32,
    pub local_to_world: Matrix4<f32>,
    pub heights_slot: TileAddress,
    pub coverage_slots: SmallVec<[(u32, Option<TileAddress>); 4]>,
    pub neighbour_lod_diff: [i8; 4],
    pub element_size: u32,
    pub overlap: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CompletedUpload {
    pub cell_hash: u64,
    pub node_index: u32,
    pub layer: LayerKind,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct FrameStats {
    pub cells_active: usize,
    pub nodes_queued: usize,
    pub uploads_started: usize,
    pub uploads_completed: usize,
    pub updates_applied: usize,
    pub abandons_applied: usize,
}

struct CellCoverage {
    /// Index into `TerrainConfig::coverage_layers` and the parallel tile
    /// set list.
    layer_index: usize,
    fid: FileId,
    scaffold: Arc<CellScaffold>,
    tiles: Vec<NodeCoverageInfo>,
}

struct CellRenderInfo {
    cell_to_world: Matrix4<f32>,
    scaffold: Arc<CellScaffold>,
    heights_fid: FileId,
    height_tiles: Vec<NodeCoverageInfo>,
    coverage: Vec<CellCoverage>,
    last_used_frame: u64,
}

pub struct TerrainCellRenderer {
    config: TerrainConfig,
    catalog: Arc<Catalog>,
    uploads: Arc<UploadQueue>,
    device: Arc<dyn Device>,

    heights_tiles: TextureTileSet,
    coverage_tiles: Vec<TextureTileSet>,

    cells: FxHashMap<u64, CellRenderInfo>,
    pending_uploads: Vec<(u64, u32, LayerKind)>,
    queued: Vec<QueuedNode>,
    bridges: Vec<(LayerKind, Arc<ShortCircuitBridge>)>,
    frame: u64,
}

impl TerrainCellRenderer {
    pub fn new(
        config: TerrainConfig,
        catalog: Arc<Catalog>,
        uploads: Arc<UploadQueue>,
    ) -> Result<Self> {
        anyhow::ensure!(
            config.coverage_layers.len() <= MAX_COVERAGE_LAYERS,
            "at most {} coverage layers",
            MAX_COVERAGE_LAYERS
        );
        let device = uploads.device().clone();
        let heights_tiles = TextureTileSet::new(
            uploads.clone(),
            TileSetDesc {
                element_size: [config.heights_element_size, config.heights_element_size],
                elements_per_layer: config.elements_per_layer,
                layer_count: config.layer_count,
                format: config.heights_format,
                allow_modification: true,
                label: "terrain-heights-tiles".to_owned(),
            },
        )?;
        let mut coverage_tiles = Vec::new();
        for def in &config.coverage_layers {
            coverage_tiles.push(TextureTileSet::new(
                uploads.clone(),
                TileSetDesc {
                    element_size: [def.element_size, def.element_size],
                    elements_per_layer: config.elements_per_layer,
                    layer_count: config.layer_count,
                    format: def.format,
                    allow_modification: true,
                    label: format!("terrain-coverage-{}-tiles", def.id),
                },
            )?);
        }
        Ok(Self {
            config,
            catalog,
            uploads,
            device,
            heights_tiles,
            coverage_tiles,
            cells: FxHashMap::default(),
            pending_uploads: Vec::new(),
            queued: Vec::new(),
            bridges: Vec::new(),
            frame: 0,
        })
    }

    /// Route a layer's short-circuit traffic into this cache.
    pub fn attach_bridge(&mut self, layer: LayerKind, bridge: Arc<ShortCircuitBridge>) {
        self.bridges.retain(|(existing, _)| *existing != layer);
        self.bridges.push((layer, bridge));
    }

    pub fn heights_tiles(&self) -> &TextureTileSet {
        &self.heights_tiles
    }

    pub fn coverage_tiles(&self, id: u32) -> Option<&TextureTileSet> {
        let index = self
            .config
            .coverage_layers
            .iter()
            .position(|def| def.id == id)?;
        self.coverage_tiles.get(index)
    }

    pub fn cached_cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn pending_upload_count(&self) -> usize {
        self.pending_uploads.len()
    }

    pub fn queued_nodes(&self) -> &[QueuedNode] {
        &self.queued
    }

    /// Run one frame of cache maintenance in the fixed order: completions,
    /// abandons, updates, cull/collapse, upload scheduling.
    pub fn frame(&mut self, frame: u64, view: &ViewContext, cells: &[CellId]) -> FrameStats {
        self.frame = frame;
        self.heights_tiles.begin_frame(frame);
        for tiles in &mut self.coverage_tiles {
            tiles.begin_frame(frame);
        }
        self.uploads.tick(frame);

        let completed = self.complete_pending_uploads();
        let (abandons_applied, updates_applied) = self.apply_short_circuits();
        self.cull_nodes(view, cells);
        let uploads_started = self.queue_uploads();

        let stats = FrameStats {
            cells_active: self.cells.len(),
            nodes_queued: self.queued.len(),
            uploads_started,
            uploads_completed: completed.len(),
            updates_applied,
            abandons_applied,
        };
        trace!(
            "terrain frame {}: cells:{} queued:{} started:{} done:{} sc:{}/{}",
            frame,
            stats.cells_active,
            stats.nodes_queued,
            stats.uploads_started,
            stats.uploads_completed,
            stats.abandons_applied,
            stats.updates_applied,
        );
        stats
    }

    /// Poll every in-flight tile upload; successful ones promote pending to
    /// visible. Returns the uploads finalized this frame.
    pub fn complete_pending_uploads(&mut self) -> Vec<CompletedUpload> {
        let pending = std::mem::take(&mut self.pending_uploads);
        let mut still_pending = Vec::with_capacity(pending.len());
        let mut completed = Vec::new();
        for (cell_hash, node_index, layer) in pending {
            let cell = match self.cells.get_mut(&cell_hash) {
                Some(cell) => cell,
                // The cell was evicted with its transactions ended.
                None => continue,
            };
            let done = match layer {
                LayerKind::Heights => cell.height_tiles[node_index as usize]
                    .complete_upload(&mut self.heights_tiles),
                LayerKind::Coverage(id) => {
                    match cell.coverage.iter_mut().find(|c| {
                        self.config.coverage_layers[c.layer_index].id == id
                    }) {
                        Some(coverage) => coverage.tiles[node_index as usize]
                            .complete_upload(&mut self.coverage_tiles[coverage.layer_index]),
                        None => true,
                    }
                }
            };
            if done {
                completed.push(CompletedUpload {
                    cell_hash,
                    node_index,
                    layer,
                });
            } else {
                still_pending.push((cell_hash, node_index, layer));
            }
        }
        self.pending_uploads = still_pending;
        completed
    }

    /// Pull this frame's short-circuit traffic from the attached bridges.
    /// Abandons run strictly before updates.
    pub fn apply_short_circuits(&mut self) -> (usize, usize) {
        let bridges = self.bridges.clone();
        let mut abandons = 0;
        for (layer, bridge) in &bridges {
            for region in bridge.pending_abandons() {
                self.abandon_short_circuit(
                    region.cell_hash,
                    *layer,
                    region.cell_min,
                    region.cell_max,
                );
                abandons += 1;
            }
        }
        let mut updates = 0;
        let mut ctx: Option<Box<dyn CommandContext>> = None;
        for (layer, bridge) in &bridges {
            for resolved in bridge.pending_updates() {
                updates += self.apply_resolved_update(*layer, &resolved, &mut ctx);
            }
        }
        if let Some(ctx) = ctx {
            self.device.submit(ctx);
        }
        (abandons, updates)
    }

    /// Drop the tiles covering a cell rectangle so they reload from the
    /// authoritative file instead of possibly rolled-back edit state.
    pub fn abandon_short_circuit(
        &mut self,
        cell_hash: u64,
        layer: LayerKind,
        cell_min: [f32; 2],
        cell_max: [f32; 2],
    ) {
        let cell = match self.cells.get_mut(&cell_hash) {
            Some(cell) => cell,
            None => return,
        };
        match layer {
            LayerKind::Heights => {
                let scaffold = cell.scaffold.clone();
                abandon_tiles(
                    &mut cell.height_tiles,
                    &mut self.heights_tiles,
                    &scaffold,
                    cell_min,
                    cell_max,
                );
            }
            LayerKind::Coverage(id) => {
                let config = &self.config;
                if let Some(coverage) = cell
                    .coverage
                    .iter_mut()
                    .find(|c| config.coverage_layers[c.layer_index].id == id)
                {
                    let scaffold = coverage.scaffold.clone();
                    abandon_tiles(
                        &mut coverage.tiles,
                        &mut self.coverage_tiles[coverage.layer_index],
                        &scaffold,
                        cell_min,
                        cell_max,
                    );
                }
            }
        }
    }

    /// Refresh one resident node from the live edit cache, bypassing disk.
    pub fn short_circuit(&mut self, cell_hash: u64, layer: LayerKind, node_index: u32) {
        let bridge = match self.bridges.iter().find(|(l, _)| *l == layer) {
            Some((_, bridge)) => bridge.clone(),
            None => return,
        };
        let (rect_min, rect_max) = {
            let cell = match self.cells.get(&cell_hash) {
                Some(cell) => cell,
                None => return,
            };
            let scaffold = match layer {
                LayerKind::Heights => &cell.scaffold,
                LayerKind::Coverage(id) => {
                    match cell.coverage.iter().find(|c| {
                        self.config.coverage_layers[c.layer_index].id == id
                    }) {
                        Some(coverage) => &coverage.scaffold,
                        None => return,
                    }
                }
            };
            let lod = match scaffold.lod_of(node_index) {
                Some(lod) => lod,
                None => return,
            };
            scaffold.node_cell_rect(lod, node_index)
        };
        if let Some(resolved) = bridge.resolve(cell_hash, rect_min, rect_max) {
            let mut ctx: Option<Box<dyn CommandContext>> = None;
            self.apply_resolved_update(layer, &resolved, &mut ctx);
            if let Some(ctx) = ctx {
                self.device.submit(ctx);
            }
        }
    }

    fn apply_resolved_update(
        &mut self,
        layer: LayerKind,
        resolved: &ResolvedUpdate,
        ctx: &mut Option<Box<dyn CommandContext>>,
    ) -> usize {
        let window_extent = [
            resolved.window_max[0] - resolved.window_min[0],
            resolved.window_max[1] - resolved.window_min[1],
        ];
        if window_extent[0] <= 0f32 || window_extent[1] <= 0f32 {
            return 0;
        }
        let cell = match self.cells.get_mut(&resolved.region.cell_hash) {
            Some(cell) => cell,
            None => return 0,
        };
        let (tiles, tile_set, scaffold, shader) = match layer {
            LayerKind::Heights => (
                &mut cell.height_tiles,
                &mut self.heights_tiles,
                cell.scaffold.clone(),
                SHADER_HEIGHT_TILE_COPY,
            ),
            LayerKind::Coverage(id) => {
                let config = &self.config;
                match cell
                    .coverage
                    .iter_mut()
                    .find(|c| config.coverage_layers[c.layer_index].id == id)
                {
                    Some(coverage) => {
                        let layer_index = coverage.layer_index;
                        let scaffold = coverage.scaffold.clone();
                        (
                            &mut coverage.tiles,
                            &mut self.coverage_tiles[layer_index],
                            scaffold,
                            SHADER_TILE_COPY,
                        )
                    }
                    None => return 0,
                }
            }
        };
        let atlas_uav = match &tile_set.views().uav {
            Some(uav) => uav.clone(),
            None => return 0,
        };
        let tile_info_uav = match layer {
            LayerKind::Heights => tile_set.tile_info().map(|info| UnorderedAccessView {
                resource: info.resource().clone(),
                format_override: None,
                layer: None,
            }),
            LayerKind::Coverage(_) => None,
        };
        let element_size = tile_set.element_size();
        let res_min = resolved.update.min_in_resource;
        let res_extent = [
            (resolved.update.max_in_resource[0] - res_min[0]) as f32,
            (resolved.update.max_in_resource[1] - res_min[1]) as f32,
        ];

        let mut applied = 0;
        for lod in 0..scaffold.field_count() {
            let field = *scaffold.field(lod);
            for node_index in field.node_begin..field.node_end {
                let (node_min, node_max) = scaffold.node_cell_rect(lod, node_index);
                let overlap_min = [
                    node_min[0]
                        .max(resolved.region.cell_min[0])
                        .max(resolved.window_min[0]),
                    node_min[1]
                        .max(resolved.region.cell_min[1])
                        .max(resolved.window_min[1]),
                ];
                let overlap_max = [
                    node_max[0]
                        .min(resolved.region.cell_max[0])
                        .min(resolved.window_max[0]),
                    node_max[1]
                        .min(resolved.region.cell_max[1])
                        .min(resolved.window_max[1]),
                ];
                if overlap_min[0] >= overlap_max[0] || overlap_min[1] >= overlap_max[1] {
                    continue;
                }
                let info = &mut tiles[node_index as usize];
                if !tile_set.is_valid(&info.visible) {
                    // Not resident; it will pick up the edit when streamed.
                    continue;
                }
                let address = info.visible.address().expect("valid tile has an address");
                let slot_box = tile_set.tile_pixel_box(address);

                let to_src = |t: [f32; 2]| {
                    [
                        res_min[0]
                            + ((t[0] - resolved.window_min[0]) / window_extent[0]
                                * res_extent[0]) as u32,
                        res_min[1]
                            + ((t[1] - resolved.window_min[1]) / window_extent[1]
                                * res_extent[1]) as u32,
                    ]
                };
                let node_extent = [node_max[0] - node_min[0], node_max[1] - node_min[1]];
                let to_dst = |t: [f32; 2]| {
                    [
                        slot_box.min[0]
                            + ((t[0] - node_min[0]) / node_extent[0] * element_size[0] as f32)
                                as u32,
                        slot_box.min[1]
                            + ((t[1] - node_min[1]) / node_extent[1] * element_size[1] as f32)
                                as u32,
                    ]
                };
                let src_box = gpu::Box2d {
                    min: to_src(overlap_min),
                    max: to_src(overlap_max),
                };
                let dst_box = gpu::Box2d {
                    min: to_dst(overlap_min),
                    max: to_dst(overlap_max),
                };
                if src_box.is_degenerate() || dst_box.is_degenerate() {
                    continue;
                }
                let aux = tile_info_uav
                    .clone()
                    .map(|uav| (uav, tile_set.slot_linear(address)));
                ctx.get_or_insert_with(|| self.device.begin_commands())
                    .dispatch(make_refresh_dispatch(
                        shader,
                        resolved.update.srv.clone(),
                        src_box,
                        atlas_uav.clone(),
                        address.layer,
                        dst_box,
                        aux,
                    ));
                applied += 1;
            }
        }
        applied
    }

    /// Cull cells and nodes for the view and rebuild the queued node list.
    pub fn cull_nodes(&mut self, view: &ViewContext, cells: &[CellId]) {
        self.queued.clear();
        let mut context = CollapseContext::new(
            self.config.start_lod,
            self.config.screen_edge_threshold,
            [view.viewport[0] as f32, view.viewport[1] as f32],
        );
        for cell_id in cells {
            let world_aabb = Aabb::from_bounds(
                Point3::new(cell_id.aabb_min[0], cell_id.aabb_min[1], cell_id.aabb_min[2]),
                Point3::new(cell_id.aabb_max[0], cell_id.aabb_max[1], cell_id.aabb_max[2]),
            );
            if cull_aabb(&view.world_to_projection, &world_aabb) {
                // Off-screen cells stay cached but age toward eviction.
                continue;
            }
            if !self.ensure_cell(cell_id) {
                continue;
            }
            let cell = self.cells.get_mut(&cell_id.hash).expect("ensured above");
            cell.last_used_frame = self.frame;
            cell.cell_to_world = cell_id.cell_to_world;
            let slot = context.add_cell(CollapseCell {
                hash: cell_id.hash,
                scaffold: cell.scaffold.clone(),
                cell_to_world: cell_id.cell_to_world,
                cell_to_projection: view.world_to_projection * cell_id.cell_to_world,
                view_position: Vector3::new(
                    view.view_position[0],
                    view.view_position[1],
                    view.view_position[2],
                ),
            });
            context.seed_cell(slot);
        }
        context.collapse();
        self.write_queued_nodes(&context);
        self.evict_stale_cells();
    }

    fn write_queued_nodes(&mut self, context: &CollapseContext) {
        for node in context.surviving_nodes() {
            let collapse_cell = &context.cells[node.id.cell_slot as usize];
            let cell_hash = collapse_cell.hash;
            let (flags, priority) = {
                let cell = match self.cells.get_mut(&cell_hash) {
                    Some(cell) => cell,
                    None => continue,
                };
                let node_index = node.id.node_index as usize;
                let mut flags = QueuedNodeFlags::empty();

                let height_info = &cell.height_tiles[node_index];
                let height_valid = self.heights_tiles.is_valid(&height_info.visible);
                if height_valid {
                    flags |= QueuedNodeFlags::HAS_VALID_DATA;
                } else if !self.heights_tiles.is_valid(&height_info.pending) {
                    flags |= QueuedNodeFlags::NEEDS_HEIGHT_UPLOAD;
                }

                for coverage in &cell.coverage {
                    let layer_index = coverage.layer_index;
                    if node.id.lod_field as usize >= coverage.scaffold.field_count() {
                        continue;
                    }
                    if node_index >= coverage.scaffold.node_count()
                        || !coverage.scaffold.node(node.id.node_index).has_payload()
                    {
                        continue;
                    }
                    let tile_set = &mut self.coverage_tiles[layer_index];
                    let info = &coverage.tiles[node_index];
                    if !tile_set.is_valid(&info.visible) && !tile_set.is_valid(&info.pending) {
                        flags |= QueuedNodeFlags::coverage(layer_index);
                    }
                }

                let desc = cell.scaffold.node(node.id.node_index);
                let center_world = (collapse_cell.cell_to_world * desc.local_to_cell)
                    .transform_point(&Point3::new(0.5f32, 0.5f32, 0f32));
                let to_camera = center_world - Point3::from(collapse_cell.view_position);
                (flags, to_camera.norm_squared())
            };
            self.queued.push(QueuedNode {
                cell_hash,
                node_index: node.id.node_index,
                lod_field: node.id.lod_field,
                flags,
                priority,
                neighbour_lod_diff: node.neighbour_lod_diffs(),
            });
        }
    }

    /// Start the most important missing uploads, closest first, bounded by
    /// the per-frame and total in-flight limits.
    pub fn queue_uploads(&mut self) -> usize {
        self.queued.sort_by_key(|node| FloatOrd(node.priority));
        let mut started = 0;
        for at in 0..self.queued.len() {
            if started >= self.config.frame_upload_limit {
                break;
            }
            if self.pending_uploads.len() >= self.config.active_upload_limit {
                break;
            }
            let queued = self.queued[at].clone();
            let cell = match self.cells.get_mut(&queued.cell_hash) {
                Some(cell) => cell,
                None => continue,
            };
            let node_index = queued.node_index as usize;
            if queued.flags.contains(QueuedNodeFlags::NEEDS_HEIGHT_UPLOAD) {
                let desc = cell.scaffold.node(queued.node_index).clone();
                if desc.has_payload() {
                    let result = cell.height_tiles[node_index].queue(
                        &mut self.heights_tiles,
                        &self.catalog,
                        cell.heights_fid,
                        desc.payload_offset,
                        desc.payload_size as u64,
                    );
                    match result {
                        Ok(()) => {
                            started += 1;
                            self.pending_uploads.push((
                                queued.cell_hash,
                                queued.node_index,
                                LayerKind::Heights,
                            ));
                        }
                        // Transient; drop the request and retry next frame.
                        Err(err) => trace!("height upload dropped: {}", err),
                    }
                }
            }
            for coverage_at in 0..cell.coverage.len() {
                let layer_index = cell.coverage[coverage_at].layer_index;
                if !queued.flags.contains(QueuedNodeFlags::coverage(layer_index)) {
                    continue;
                }
                if started >= self.config.frame_upload_limit
                    || self.pending_uploads.len() >= self.config.active_upload_limit
                {
                    break;
                }
                let coverage = &mut cell.coverage[coverage_at];
                if queued.node_index as usize >= coverage.scaffold.node_count() {
                    continue;
                }
                let desc = coverage.scaffold.node(queued.node_index).clone();
                if !desc.has_payload() {
                    continue;
                }
                let layer_id = self.config.coverage_layers[layer_index].id;
                let result = coverage.tiles[node_index].queue(
                    &mut self.coverage_tiles[layer_index],
                    &self.catalog,
                    coverage.fid,
                    desc.payload_offset,
                    desc.payload_size as u64,
                );
                match result {
                    Ok(()) => {
                        started += 1;
                        self.pending_uploads.push((
                            queued.cell_hash,
                            queued.node_index,
                            LayerKind::Coverage(layer_id),
                        ));
                    }
                    Err(err) => trace!("coverage upload dropped: {}", err),
                }
            }
        }
        started
    }

    /// Walk the queued nodes and hand each resident one to the draw
    /// callback.
    pub fn render(&mut self, on_draw_node: &mut dyn FnMut(&NodeDrawRecord)) {
        let queued = std::mem::take(&mut self.queued);
        for node in &queued {
            if !node.flags.contains(QueuedNodeFlags::HAS_VALID_DATA) {
                // Not resident this frame; a coarser ancestor covers it.
                continue;
            }
            let record = self.build_draw_record(node);
            if let Some(record) = record {
                on_draw_node(&record);
            }
        }
        self.queued = queued;
    }

    fn build_draw_record(&mut self, node: &QueuedNode) -> Option<NodeDrawRecord> {
        let cell = self.cells.get_mut(&node.cell_hash)?;
        let node_index = node.node_index as usize;
        let height_info = &cell.height_tiles[node_index];
        if !self.heights_tiles.is_valid(&height_info.visible) {
            return None;
        }
        let heights_slot = height_info.visible.address()?;
        let mut coverage_slots = SmallVec::new();
        for coverage in &cell.coverage {
            let id = self.config.coverage_layers[coverage.layer_index].id;
            let info = &coverage.tiles[node_index];
            let slot = if self.coverage_tiles[coverage.layer_index].is_valid(&info.visible) {
                info.visible.address()
            } else {
                None
            };
            coverage_slots.push((id, slot));
        }
        let desc = cell.scaffold.node(node.node_index);
        Some(NodeDrawRecord {
            cell_hash: node.cell_hash,
            node_index: node.node_index,
            lod_field: node.lod_field,
            local_to_world: cell.cell_to_world * desc.local_to_cell,
            heights_slot,
            coverage_slots,
            neighbour_lod_diff: node.neighbour_lod_diff,
            element_size: cell.scaffold.element_size(),
            overlap: cell.scaffold.overlap(),
        })
    }

    fn ensure_cell(&mut self, cell_id: &CellId) -> bool {
        let needs_load = match self.cells.get(&cell_id.hash) {
            // A renamed or vanished backing file invalidates the whole
            // cell; it is rebuilt from scratch on demand.
            Some(info) => self.catalog.lookup(&cell_id.heights_file) != Some(info.heights_fid),
            None => true,
        };
        if !needs_load {
            return true;
        }
        self.remove_cell(cell_id.hash);
        match load_cell(&self.config, &self.catalog, cell_id, self.frame) {
            Ok(info) => {
                debug!(
                    "terrain: loaded cell {:016x} ({} nodes)",
                    cell_id.hash,
                    info.scaffold.node_count()
                );
                self.cells.insert(cell_id.hash, info);
                true
            }
            Err(err) => {
                warn!("terrain: cell {:016x} unavailable: {:#}", cell_id.hash, err);
                false
            }
        }
    }

    fn remove_cell(&mut self, cell_hash: u64) {
        if let Some(mut cell) = self.cells.remove(&cell_hash) {
            for info in &mut cell.height_tiles {
                info.end_transactions(&mut self.heights_tiles);
            }
            for coverage in &mut cell.coverage {
                for info in &mut coverage.tiles {
                    info.end_transactions(&mut self.coverage_tiles[coverage.layer_index]);
                }
            }
            self.pending_uploads.retain(|(hash, _, _)| *hash != cell_hash);
            debug!("terrain: evicted cell {:016x}", cell_hash);
        }
    }

    fn evict_stale_cells(&mut self) {
        while self.cells.len() > self.config.cached_cell_limit {
            let victim = self
                .cells
                .iter()
                .filter(|(_, cell)| cell.last_used_frame < self.frame)
                .min_by_key(|(_, cell)| cell.last_used_frame)
                .map(|(hash, _)| *hash);
            match victim {
                Some(hash) => self.remove_cell(hash),
                // Everything left was referenced this frame.
                None => break,
            }
        }
    }
}

fn abandon_tiles(
    tiles: &mut [NodeCoverageInfo],
    tile_set: &mut TextureTileSet,
    scaffold: &CellScaffold,
    cell_min: [f32; 2],
    cell_max: [f32; 2],
) {
    for lod in 0..scaffold.field_count() {
        let field = *scaffold.field(lod);
        for node_index in field.node_begin..field.node_end {
            let (node_min, node_max) = scaffold.node_cell_rect(lod, node_index);
            if node_min[0] >= cell_max[0]
                || node_max[0] <= cell_min[0]
                || node_min[1] >= cell_max[1]
                || node_max[1] <= cell_min[1]
            {
                continue;
            }
            tiles[node_index as usize].end_transactions(tile_set);
        }
    }
}

fn load_cell(
    config: &TerrainConfig,
    catalog: &Catalog,
    cell_id: &CellId,
    frame: u64,
) -> Result<CellRenderInfo> {
    let heights_fid = match catalog.lookup(&cell_id.heights_file) {
        Some(fid) => fid,
        None => anyhow::bail!("no streaming source named {}", cell_id.heights_file),
    };
    let scaffold = Arc::new(CellScaffold::from_catalog(catalog, heights_fid)?);
    let height_tiles = vec![NodeCoverageInfo::default(); scaffold.node_count()];

    let mut coverage = Vec::new();
    for (layer_id, name) in &cell_id.coverage_files {
        let layer_index = match config
            .coverage_layers
            .iter()
            .position(|def| def.id == *layer_id)
        {
            Some(index) => index,
            None => continue,
        };
        // A missing coverage layer is non-fatal; the cell renders without
        // that layer.
        let fid = match catalog.lookup(name) {
            Some(fid) => fid,
            None => {
                debug!("terrain: cell {:016x} has no {}", cell_id.hash, name);
                continue;
            }
        };
        match CellScaffold::from_catalog(catalog, fid) {
            Ok(cov_scaffold) => {
                let tiles = vec![NodeCoverageInfo::default(); cov_scaffold.node_count()];
                coverage.push(CellCoverage {
                    layer_index,
                    fid,
                    scaffold: Arc::new(cov_scaffold),
                    tiles,
                });
            }
            Err(err) => {
                warn!("terrain: coverage {} unreadable: {:#}", name, err);
            }
        }
    }

    Ok(CellRenderInfo {
        cell_to_world: cell_id.cell_to_world,
        scaffold,
        heights_fid,
        height_tiles,
        coverage,
        last_used_frame: frame,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::MemoryDrawer;
    use gpu::{software::SoftwareDevice, PoolConfig, ResourcePool, SubResource, UploadConfig};
    use nalgebra::Perspective3;
    use std::{thread, time::Duration};
    use uber_surface::{EditorConfig, SurfaceEditor, ToolResult, UberSurface};

    const ELEMENT: u32 = 4;

    fn heights_payload(field: u32, x: u32, y: u32) -> Vec<u8> {
        let value = (field * 1000 + y * 100 + x) as u16;
        let mut data = Vec::with_capacity((ELEMENT * ELEMENT * 2) as usize);
        for _ in 0..ELEMENT * ELEMENT {
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    fn build_cell_file(field_count: u32) -> Vec<u8> {
        let mut builder = CellFileBuilder::new(field_count, ELEMENT, 1, SampleFormat::R16Uint);
        builder.fill_payloads(heights_payload);
        builder.build()
    }

    fn world_with_cells(names: &[&str]) -> Arc<Catalog> {
        let mut drawer = MemoryDrawer::new("world", 0);
        for name in names {
            drawer.add_file(*name, build_cell_file(3));
        }
        Arc::new(Catalog::with_drawers(vec![Box::new(drawer)]).unwrap())
    }

    fn small_config() -> TerrainConfig {
        TerrainConfig {
            heights_element_size: ELEMENT,
            heights_format: SampleFormat::R16Uint,
            coverage_layers: Vec::new(),
            elements_per_layer: [4, 4],
            layer_count: 2,
            // High threshold: stay at the starting LOD.
            screen_edge_threshold: 100_000f32,
            start_lod: 1,
            frame_upload_limit: 500,
            active_upload_limit: 1000,
            cached_cell_limit: 64,
        }
    }

    fn renderer_with(
        catalog: Arc<Catalog>,
        config: TerrainConfig,
    ) -> (TerrainCellRenderer, Arc<SoftwareDevice>, Arc<UploadQueue>) {
        let device = SoftwareDevice::new();
        register_software_shaders(&device);
        uber_surface::tools::register_software_tools(&device);
        let device_dyn: Arc<dyn Device> = device.clone();
        let pool = ResourcePool::new(PoolConfig::default());
        let uploads = UploadQueue::new(device_dyn, pool, UploadConfig::default());
        let renderer = TerrainCellRenderer::new(config, catalog, uploads.clone()).unwrap();
        (renderer, device, uploads)
    }

    fn projection() -> Matrix4<f32> {
        let depth_fix = Matrix4::new_nonuniform_scaling(&Vector3::new(1f32, 1f32, 0.5))
            .append_translation(&Vector3::new(0f32, 0f32, 0.5));
        depth_fix
            * Perspective3::new(1f32, std::f32::consts::FRAC_PI_2, 0.1, 10_000f32).as_matrix()
    }

    fn view_at(distance: f32) -> ViewContext {
        ViewContext {
            world_to_projection: projection()
                * Matrix4::new_translation(&Vector3::new(0f32, 0f32, -distance)),
            view_position: [0f32, 0f32, distance],
            viewport: [1280, 768],
        }
    }

    fn cell_id(hash: u64, heights_file: &str) -> CellId {
        CellId {
            hash,
            cell_to_world: Matrix4::new_translation(&Vector3::new(-0.5f32, -0.5f32, 0f32)),
            aabb_min: [-0.5f32, -0.5f32, 0f32],
            aabb_max: [0.5f32, 0.5f32, 1f32],
            heights_file: heights_file.to_owned(),
            coverage_files: Vec::new(),
        }
    }

    fn draw_records(renderer: &mut TerrainCellRenderer) -> Vec<NodeDrawRecord> {
        let mut records = Vec::new();
        renderer.render(&mut |record| records.push(record.clone()));
        records
    }

    fn stream_until_drawn(
        renderer: &mut TerrainCellRenderer,
        view: &ViewContext,
        cells: &[CellId],
        expected: usize,
        frame: &mut u64,
    ) -> Vec<NodeDrawRecord> {
        for _ in 0..500 {
            renderer.frame(*frame, view, cells);
            *frame += 1;
            let records = draw_records(renderer);
            if records.len() == expected {
                return records;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("streaming never produced {} draw records", expected);
    }

    #[test]
    fn test_cold_boot_streams_start_lod() {
        let catalog = world_with_cells(&["cell-a.heights"]);
        let (mut renderer, _device, uploads) = renderer_with(catalog, small_config());
        let view = view_at(3f32);
        let cells = vec![cell_id(1, "cell-a.heights")];

        let mut frame = 0u64;
        let records = stream_until_drawn(&mut renderer, &view, &cells, 4, &mut frame);
        for record in &records {
            assert_eq!(record.lod_field, 1);
            assert_eq!(record.element_size, ELEMENT);
            assert_eq!(record.overlap, 1);
        }
        // Four distinct slots.
        let mut slots = records.iter().map(|r| r.heights_slot).collect::<Vec<_>>();
        slots.sort_by_key(|s| (s.layer, s.y, s.x));
        slots.dedup();
        assert_eq!(slots.len(), 4);

        // The atlas actually holds the streamed payloads: find the record
        // of field-1 node (0,0) and check its slot's first sample. Field 1
        // starts at node index 1.
        let atlas = renderer
            .heights_tiles()
            .resource()
            .unwrap()
            .resource()
            .clone();
        let node_00 = records
            .iter()
            .find(|r| r.node_index == 1)
            .expect("node (0,0) drawn");
        let slot_box = renderer.heights_tiles().tile_pixel_box(node_00.heights_slot);
        let layer = uploads
            .device()
            .read_back(&atlas, SubResource::layer(node_00.heights_slot.layer))
            .unwrap();
        let atlas_width = renderer.heights_tiles().desc().elements_per_layer[0] * ELEMENT;
        let at = ((slot_box.min[1] * atlas_width + slot_box.min[0]) * 2) as usize;
        let value = u16::from_le_bytes([layer[at], layer[at + 1]]);
        assert_eq!(value, 1000);
    }

    #[test]
    fn test_culled_view_draws_nothing() {
        let catalog = world_with_cells(&["cell-a.heights"]);
        let (mut renderer, _device, _uploads) = renderer_with(catalog, small_config());
        let cells = vec![cell_id(1, "cell-a.heights")];

        // Cell is behind this camera.
        let away = ViewContext {
            world_to_projection: projection()
                * Matrix4::new_translation(&Vector3::new(0f32, 0f32, 50f32)),
            view_position: [0f32, 0f32, -50f32],
            viewport: [1280, 768],
        };
        let stats = renderer.frame(0, &away, &cells);
        assert_eq!(stats.nodes_queued, 0);
        assert!(draw_records(&mut renderer).is_empty());
    }

    #[test]
    fn test_upload_limits_are_respected() {
        let catalog = world_with_cells(&["cell-a.heights"]);
        let mut config = small_config();
        config.start_lod = 2; // 16 nodes to stream
        config.frame_upload_limit = 2;
        config.active_upload_limit = 3;
        let (mut renderer, _device, _uploads) = renderer_with(catalog, config);
        let view = view_at(3f32);
        let cells = vec![cell_id(1, "cell-a.heights")];

        let mut drawn = 0;
        for frame in 0..500u64 {
            let stats = renderer.frame(frame, &view, &cells);
            assert!(stats.uploads_started <= 2);
            assert!(renderer.pending_upload_count() <= 3);
            drawn = draw_records(&mut renderer).len();
            if drawn == 16 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(drawn, 16);
    }

    #[test]
    fn test_missing_heights_source_invalidates_cell() {
        let catalog = world_with_cells(&["cell-a.heights"]);
        let (mut renderer, _device, _uploads) = renderer_with(catalog, small_config());
        let view = view_at(3f32);
        let stats = renderer.frame(0, &view, &[cell_id(9, "missing.heights")]);
        assert_eq!(stats.cells_active, 0);
        assert_eq!(stats.nodes_queued, 0);
    }

    #[test]
    fn test_cell_cache_lru_eviction() {
        let catalog = world_with_cells(&["cell-a.heights", "cell-b.heights"]);
        let mut config = small_config();
        config.cached_cell_limit = 1;
        let (mut renderer, _device, _uploads) = renderer_with(catalog, config);
        let view = view_at(3f32);

        renderer.frame(1, &view, &[cell_id(1, "cell-a.heights")]);
        assert_eq!(renderer.cached_cell_count(), 1);
        renderer.frame(2, &view, &[cell_id(2, "cell-b.heights")]);
        // Cell a was not referenced this frame and fell off.
        assert_eq!(renderer.cached_cell_count(), 1);
    }

    fn noop_write_back() -> uber_surface::WriteBackFn {
        Box::new(|_, _, _| Ok(()))
    }

    #[test]
    fn test_short_circuit_update_idempotence_and_abandon() {
        let catalog = world_with_cells(&["cell-a.heights"]);
        let (mut renderer, _device, uploads) = renderer_with(catalog, small_config());
        let view = view_at(3f32);
        let cells = vec![cell_id(1, "cell-a.heights")];
        let mut frame = 0u64;
        stream_until_drawn(&mut renderer, &view, &cells, 4, &mut frame);

        // Wire an editor over a 64x64 surface registered as this cell.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heights.uber");
        UberSurface::create_empty(&path, 64, 64, SampleFormat::R32Float, 1).unwrap();
        let surface = UberSurface::open(&path).unwrap();
        let bridge = Arc::new(ShortCircuitBridge::new());
        bridge
            .register_cell(1, [0, 0], [64, 64], noop_write_back())
            .unwrap();
        let editor = SurfaceEditor::new(
            surface,
            uploads.clone(),
            bridge.clone(),
            EditorConfig { cache_margin: 16 },
        );
        editor.bind_to_bridge();
        renderer.attach_bridge(LayerKind::Heights, bridge.clone());

        editor.prepare_cache([0, 0], [64, 64]).unwrap();
        let result = editor.apply_tool(
            [0, 0],
            [64, 64],
            uber_surface::tools::SHADER_SET_VALUE,
            [32f32, 32f32],
            0f32,
            7.5f32,
            &[],
        );
        assert_eq!(result, ToolResult::Success);

        let stats = renderer.frame(frame, &view, &cells);
        frame += 1;
        assert_eq!(stats.updates_applied, 4);

        // The refresh recorded each tile's decompression range.
        let records = draw_records(&mut renderer);
        let info = renderer
            .heights_tiles()
            .tile_info()
            .expect("tile info created")
            .resource()
            .clone();
        let info_bytes = uploads.device().read_back(&info, SubResource::base()).unwrap();
        for record in &records {
            let slot = renderer.heights_tiles().slot_linear(record.heights_slot) as usize;
            let at = slot * TILE_INFO_STRIDE;
            let min = f32::from_le_bytes([
                info_bytes[at],
                info_bytes[at + 1],
                info_bytes[at + 2],
                info_bytes[at + 3],
            ]);
            assert_eq!(min, 7.5f32);
        }

        // Applying the same update again yields identical visible content.
        let atlas = renderer
            .heights_tiles()
            .resource()
            .unwrap()
            .resource()
            .clone();
        let before = uploads.device().read_back(&atlas, SubResource::base()).unwrap();
        let result = editor.apply_tool(
            [0, 0],
            [64, 64],
            uber_surface::tools::SHADER_SET_VALUE,
            [32f32, 32f32],
            0f32,
            7.5f32,
            &[],
        );
        assert_eq!(result, ToolResult::Success);
        let stats = renderer.frame(frame, &view, &cells);
        frame += 1;
        assert_eq!(stats.updates_applied, 4);
        let after = uploads.device().read_back(&atlas, SubResource::base()).unwrap();
        assert_eq!(before, after);

        // Abandoning the lock reverts the tiles to disk state.
        editor.abandon_lock();
        let stats = renderer.frame(frame, &view, &cells);
        frame += 1;
        assert!(stats.abandons_applied >= 1);

        let records = stream_until_drawn(&mut renderer, &view, &cells, 4, &mut frame);
        let node_00 = records.iter().find(|r| r.node_index == 1).unwrap();
        let slot_box = renderer.heights_tiles().tile_pixel_box(node_00.heights_slot);
        let layer = uploads
            .device()
            .read_back(&atlas, SubResource::layer(node_00.heights_slot.layer))
            .unwrap();
        let atlas_width = renderer.heights_tiles().desc().elements_per_layer[0] * ELEMENT;
        let at = ((slot_box.min[1] * atlas_width + slot_box.min[0]) * 2) as usize;
        let value = u16::from_le_bytes([layer[at], layer[at + 1]]);
        assert_eq!(value, 1000);
    }
}
