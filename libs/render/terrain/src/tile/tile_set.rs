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

// A set of texture tiles, all the same size, cached in one 2D-array
// texture. Slots are claimed from per-layer bit heaps while any are free,
// then by evicting the least recently used unlocked slot. Every overwrite
// bumps the slot's generation, which is what invalidates stale handles;
// nothing ever chases handles to notify them.

use crate::tile::{TextureTile, TileAddress};
use anyhow::Result;
use catalog::{Catalog, FileId};
use gpu::{
    BindFlags, Box2d, CommandContext, FilePacket, PartialResource, ResourceDesc, ResourceLocator,
    ResourceViews, SampleFormat, SubResource, TexturePitches, TransactionFlags, TransactionId,
    UploadQueue, ViewKinds,
};
use heap::{BitHeap, LruQueue};
use log::{debug, trace};
use std::{fmt, sync::Arc};

#[derive(Debug)]
pub enum TileSetError {
    /// The backing atlas is still being created; retry next frame.
    NotReady,
    /// No free slot and every eviction candidate is locked this frame.
    Exhausted,
}

impl fmt::Display for TileSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "tile set resource not yet created"),
            Self::Exhausted => write!(f, "tile set exhausted; no evictable slot this frame"),
        }
    }
}

impl std::error::Error for TileSetError {}

#[derive(Clone, Debug)]
pub struct TileSetDesc {
    pub element_size: [u32; 2],
    pub elements_per_layer: [u32; 2],
    pub layer_count: u32,
    pub format: SampleFormat,
    /// Adds an unordered-access view so short-circuit refreshes can write
    /// slots in place.
    pub allow_modification: bool,
    pub label: String,
}

impl TileSetDesc {
    pub fn slots_per_layer(&self) -> usize {
        (self.elements_per_layer[0] * self.elements_per_layer[1]) as usize
    }

    pub fn slot_count(&self) -> usize {
        self.slots_per_layer() * self.layer_count as usize
    }

    fn atlas_desc(&self) -> ResourceDesc {
        let mut bind = BindFlags::SHADER_RESOURCE | BindFlags::TRANSFER_DST;
        if self.allow_modification {
            bind |= BindFlags::UNORDERED_ACCESS;
        }
        ResourceDesc::texture_2d_array(
            self.elements_per_layer[0] * self.element_size[0],
            self.elements_per_layer[1] * self.element_size[1],
            self.layer_count,
            self.format,
            bind,
            self.label.clone(),
        )
    }

    fn tile_info_desc(&self) -> ResourceDesc {
        // Two f32 (min/max) per slot, read during decompression.
        ResourceDesc::linear_buffer(
            self.slot_count() as u64 * 8,
            BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS,
            format!("{}-tile-info", self.label),
        )
    }
}

struct LayerSlice {
    allocation: BitHeap,
}

pub struct TextureTileSet {
    desc: TileSetDesc,
    uploads: Arc<UploadQueue>,

    slices: Vec<LayerSlice>,
    // Generation stamp per linearized slot; bumped on every overwrite.
    upload_ids: Vec<u32>,
    // Live upload transactions targeting each slot; locked against eviction.
    inflight: Vec<u32>,
    // Last frame each slot was allocated or validated; used-this-frame
    // slots are not eviction candidates.
    touched_frame: Vec<u64>,
    lru: LruQueue,

    resource: Option<ResourceLocator>,
    views: ResourceViews,
    tile_info: Option<ResourceLocator>,
    creation_atlas: Option<TransactionId>,
    creation_info: Option<TransactionId>,

    priority_mode: bool,
    frame: u64,
}

impl fmt::Debug for TextureTileSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TextureTileSet({})", self.desc.label)
    }
}

impl TextureTileSet {
    /// Creation is deferred through the upload queue; call
    /// `complete_creation` (or just `begin_upload`, which does) until the
    /// atlas exists.
    pub fn new(uploads: Arc<UploadQueue>, desc: TileSetDesc) -> Result<Self> {
        let creation_atlas =
            uploads.begin_create(desc.atlas_desc(), None, TransactionFlags::empty())?;
        let creation_info =
            uploads.begin_create(desc.tile_info_desc(), None, TransactionFlags::empty())?;
        let slot_count = desc.slot_count();
        let slices = (0..desc.layer_count)
            .map(|_| LayerSlice {
                allocation: BitHeap::with_capacity(desc.slots_per_layer()),
            })
            .collect();
        debug!(
            "tile-set {}: {} slots of {}x{}",
            desc.label, slot_count, desc.element_size[0], desc.element_size[1]
        );
        Ok(Self {
            desc,
            uploads,
            slices,
            upload_ids: vec![0u32; slot_count],
            inflight: vec![0u32; slot_count],
            touched_frame: vec![u64::MAX; slot_count],
            lru: LruQueue::with_capacity(slot_count),
            resource: None,
            views: ResourceViews::default(),
            tile_info: None,
            creation_atlas: Some(creation_atlas),
            creation_info: Some(creation_info),
            priority_mode: false,
            frame: 0,
        })
    }

    pub fn desc(&self) -> &TileSetDesc {
        &self.desc
    }

    pub fn uploads(&self) -> &Arc<UploadQueue> {
        &self.uploads
    }

    pub fn format(&self) -> SampleFormat {
        self.desc.format
    }

    pub fn element_size(&self) -> [u32; 2] {
        self.desc.element_size
    }

    pub fn set_priority_mode(&mut self, priority_mode: bool) {
        self.priority_mode = priority_mode;
    }

    pub fn priority_mode(&self) -> bool {
        self.priority_mode
    }

    /// The atlas resource, once creation completed.
    pub fn resource(&self) -> Option<&ResourceLocator> {
        self.resource.as_ref()
    }

    pub fn views(&self) -> &ResourceViews {
        &self.views
    }

    pub fn tile_info(&self) -> Option<&ResourceLocator> {
        self.tile_info.as_ref()
    }

    /// Pixel rectangle of a slot within its array layer.
    pub fn tile_pixel_box(&self, address: TileAddress) -> Box2d {
        Box2d::new(
            [
                address.x * self.desc.element_size[0],
                address.y * self.desc.element_size[1],
            ],
            [
                (address.x + 1) * self.desc.element_size[0],
                (address.y + 1) * self.desc.element_size[1],
            ],
        )
    }

    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
    }

    /// Finish the deferred atlas creation if the queue is done with it.
    /// Returns true once the atlas is usable.
    pub fn complete_creation(&mut self) -> bool {
        let uploads = self.uploads.clone();
        if let Some(tid) = self.creation_atlas {
            if !uploads.is_completed(tid) {
                return false;
            }
            self.resource = uploads.resource_of(tid);
            uploads.end(tid);
            self.creation_atlas = None;
            if let Some(locator) = &self.resource {
                let kinds = if self.desc.allow_modification {
                    ViewKinds::SRV | ViewKinds::UAV
                } else {
                    ViewKinds::SRV
                };
                self.views = ResourceViews::for_resource(locator.resource(), kinds);
            }
        }
        if let Some(tid) = self.creation_info {
            if !uploads.is_completed(tid) {
                return false;
            }
            self.tile_info = uploads.resource_of(tid);
            uploads.end(tid);
            self.creation_info = None;
        }
        self.resource.is_some()
    }

    /// True while the handle's generation matches its slot; also promotes
    /// the slot to most recently used.
    pub fn is_valid(&mut self, tile: &TextureTile) -> bool {
        let address = match tile.address {
            Some(address) => address,
            None => return false,
        };
        let linear = self.linear(address);
        if self.upload_ids[linear] != tile.upload_id {
            // Another tile was uploaded over this slot.
            return false;
        }
        self.lru.bring_to_front(linear);
        self.touched_frame[linear] = self.frame;
        true
    }

    /// Claim a slot and start streaming `size` bytes at `offset` of the
    /// given file into it. The handle is stamped with the slot's new
    /// generation and the in-flight transaction id.
    pub fn begin_upload(
        &mut self,
        tile: &mut TextureTile,
        catalog: &Arc<Catalog>,
        fid: FileId,
        offset: u64,
        size: u64,
    ) -> Result<(), TileSetError> {
        if !self.complete_creation() {
            return Err(TileSetError::NotReady);
        }
        let address = self.claim_slot()?;
        let linear = self.linear(address);
        self.lru.bring_to_front(linear);
        self.touched_frame[linear] = self.frame;
        self.upload_ids[linear] = self.upload_ids[linear].wrapping_add(1);

        let pixel_box = self.tile_pixel_box(address);
        let pitches = TexturePitches::tight(
            self.desc.element_size[0],
            self.desc.element_size[1],
            self.desc.format.sample_bytes(),
        );
        let packet = FilePacket::new(catalog.clone(), fid, offset..offset + size, pitches);
        let region = PartialResource::boxed(SubResource::layer(address.layer), pixel_box);
        let locator = self.resource.clone().expect("creation completed above");

        if self.priority_mode {
            // Interactive edits want same-frame residency; pay the stall.
            let mut packet = packet;
            let mut ctx = self.uploads.device().begin_commands();
            match gpu::DataPacket::take(&mut packet, region.sub) {
                Ok(bytes) => {
                    ctx.copy_bytes_to_resource(
                        locator.resource().clone(),
                        region.sub,
                        region.dst_box,
                        pitches.row,
                        bytes,
                    );
                    let fence = self.uploads.device().submit(ctx);
                    self.uploads.device().wait_fence(fence);
                }
                Err(err) => {
                    log::warn!("tile-set {}: priority read failed: {:#}", self.desc.label, err);
                }
            }
            tile.address = Some(address);
            tile.upload_id = self.upload_ids[linear];
            tile.transaction = None;
            return Ok(());
        }

        // Re-chasing the same node keeps its transaction; otherwise attach
        // a new one to the atlas.
        let tid = match tile.transaction {
            Some(tid) => tid,
            None => self.uploads.begin_update(&locator),
        };
        self.uploads.update_data(tid, Box::new(packet), region);
        self.inflight[linear] += 1;

        if let Some(previous) = tile.address {
            if tile.transaction.is_some() {
                let previous_linear = self.linear(previous);
                self.inflight[previous_linear] = self.inflight[previous_linear].saturating_sub(1);
            }
        }

        tile.address = Some(address);
        tile.upload_id = self.upload_ids[linear];
        tile.transaction = Some(tid);
        trace!(
            "tile-set {}: upload gen {} -> ({},{},{})",
            self.desc.label,
            tile.upload_id,
            address.x,
            address.y,
            address.layer
        );
        Ok(())
    }

    pub(crate) fn note_upload_finished(&mut self, address: TileAddress) {
        let linear = self.linear(address);
        self.inflight[linear] = self.inflight[linear].saturating_sub(1);
    }

    pub fn slot_generation(&self, address: TileAddress) -> u32 {
        self.upload_ids[self.linear(address)]
    }

    /// Linearized slot id; indexes the tile-info buffer.
    pub fn slot_linear(&self, address: TileAddress) -> u32 {
        self.linear(address) as u32
    }

    fn claim_slot(&mut self) -> Result<TileAddress, TileSetError> {
        // Free space first.
        for (layer, slice) in self.slices.iter_mut().enumerate() {
            if let Some(slot) = slice.allocation.allocate() {
                return Ok(TileAddress {
                    x: slot as u32 % self.desc.elements_per_layer[0],
                    y: slot as u32 / self.desc.elements_per_layer[0],
                    layer: layer as u32,
                });
            }
        }
        // Evict the oldest slot that is neither mid-upload nor already used
        // this frame. A locked head is skipped, not waited on.
        let candidate = self.lru.iter_oldest_first().find(|&linear| {
            self.inflight[linear] == 0 && self.touched_frame[linear] != self.frame
        });
        match candidate {
            Some(linear) => Ok(self.address_of(linear)),
            None => Err(TileSetError::Exhausted),
        }
    }

    fn linear(&self, address: TileAddress) -> usize {
        (address.layer as usize * self.desc.slots_per_layer())
            + (address.y as usize * self.desc.elements_per_layer[0] as usize)
            + address.x as usize
    }

    fn address_of(&self, linear: usize) -> TileAddress {
        let per_layer = self.desc.slots_per_layer();
        let layer = (linear / per_layer) as u32;
        let slot = linear % per_layer;
        TileAddress {
            x: slot as u32 % self.desc.elements_per_layer[0],
            y: slot as u32 / self.desc.elements_per_layer[0],
            layer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::NodeCoverageInfo;
    use catalog::MemoryDrawer;
    use gpu::{software::SoftwareDevice, PoolConfig, ResourcePool, UploadConfig};
    use std::{thread, time::Duration};

    struct Fixture {
        catalog: Arc<Catalog>,
        uploads: Arc<UploadQueue>,
        fid: FileId,
    }

    fn fixture(tile_bytes: usize, tile_count: usize) -> Fixture {
        let mut drawer = MemoryDrawer::new("tiles", 0);
        let mut blob = Vec::new();
        for i in 0..tile_count {
            blob.extend(std::iter::repeat(i as u8 + 1).take(tile_bytes));
        }
        drawer.add_file("cell.heights", blob);
        let catalog = Arc::new(Catalog::with_drawers(vec![Box::new(drawer)]).unwrap());
        let fid = catalog.lookup("cell.heights").unwrap();
        let device = SoftwareDevice::new();
        let pool = ResourcePool::new(PoolConfig::default());
        let uploads = UploadQueue::new(device, pool, UploadConfig::default());
        Fixture {
            catalog,
            uploads,
            fid,
        }
    }

    fn tile_set(fixture: &Fixture, elements: [u32; 2], layers: u32) -> TextureTileSet {
        TextureTileSet::new(
            fixture.uploads.clone(),
            TileSetDesc {
                element_size: [4, 4],
                elements_per_layer: elements,
                layer_count: layers,
                format: SampleFormat::R8Unorm,
                allow_modification: false,
                label: "test-tiles".to_owned(),
            },
        )
        .unwrap()
    }

    fn pump_tile(
        fixture: &Fixture,
        tile_set: &mut TextureTileSet,
        node: &mut NodeCoverageInfo,
    ) {
        for frame in 0..1000u64 {
            fixture.uploads.tick(frame);
            if node.complete_upload(tile_set) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("tile upload never completed");
    }

    const TILE_BYTES: u64 = 4 * 4;

    #[test]
    fn test_cold_boot_single_tile() {
        // Atlas of 4x4 slots in one layer; one streamed tile must land in
        // slot (0,0,0) with generation 1 and validate.
        let fixture = fixture(TILE_BYTES as usize, 4);
        let mut tiles = tile_set(&fixture, [4, 4], 1);
        fixture.uploads.tick(0);
        assert!(tiles.complete_creation());

        let mut node = NodeCoverageInfo::default();
        node.queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES)
            .unwrap();
        assert!(node.pending.has_transaction());
        pump_tile(&fixture, &mut tiles, &mut node);

        assert!(tiles.is_valid(&node.visible));
        let address = node.visible.address().unwrap();
        assert_eq!(address, TileAddress { x: 0, y: 0, layer: 0 });
        assert_eq!(tiles.slot_generation(address), 1);
        assert_eq!(node.visible.generation(), 1);

        // The streamed bytes are in the slot.
        let atlas = tiles.resource().unwrap().resource().clone();
        let bytes = fixture
            .uploads
            .device()
            .read_back(&atlas, SubResource::base())
            .unwrap();
        assert_eq!(bytes[0], 1);
    }

    #[test]
    fn test_eviction_under_pressure() {
        // Two slots, three tiles: the first handle must die, the other two
        // stay valid, and the reused slot's generation is at least 2.
        let fixture = fixture(TILE_BYTES as usize, 3);
        let mut tiles = tile_set(&fixture, [2, 1], 1);
        fixture.uploads.tick(0);
        assert!(tiles.complete_creation());

        let mut nodes = (0..3).map(|_| NodeCoverageInfo::default()).collect::<Vec<_>>();
        for (i, node) in nodes.iter_mut().enumerate() {
            // Separate frames so eviction is allowed to touch older slots.
            tiles.begin_frame(i as u64 + 1);
            node.queue(
                &mut tiles,
                &fixture.catalog,
                fixture.fid,
                i as u64 * TILE_BYTES,
                TILE_BYTES,
            )
            .unwrap();
            pump_tile(&fixture, &mut tiles, node);
            assert!(tiles.is_valid(&node.visible));
        }

        assert!(!tiles.is_valid(&nodes[0].visible));
        assert!(tiles.is_valid(&nodes[1].visible));
        assert!(tiles.is_valid(&nodes[2].visible));
        let reused = nodes[2].visible.address().unwrap();
        assert_eq!(reused, nodes[0].visible.address().unwrap());
        assert!(tiles.slot_generation(reused) >= 2);
    }

    #[test]
    fn test_generation_is_strictly_monotonic() {
        let fixture = fixture(TILE_BYTES as usize, 8);
        let mut tiles = tile_set(&fixture, [1, 1], 1);
        fixture.uploads.tick(0);
        assert!(tiles.complete_creation());

        let address = TileAddress { x: 0, y: 0, layer: 0 };
        let mut last = tiles.slot_generation(address);
        for i in 0..4u64 {
            tiles.begin_frame(i + 1);
            let mut node = NodeCoverageInfo::default();
            node.queue(
                &mut tiles,
                &fixture.catalog,
                fixture.fid,
                i * TILE_BYTES,
                TILE_BYTES,
            )
            .unwrap();
            pump_tile(&fixture, &mut tiles, &mut node);
            let generation = tiles.slot_generation(address);
            assert!(generation > last);
            last = generation;
        }
    }

    #[test]
    fn test_promoted_slots_are_not_evicted_this_frame() {
        // Both slots validated this frame: allocation must fail instead of
        // tearing a tile out from under the current frame's draw set.
        let fixture = fixture(TILE_BYTES as usize, 4);
        let mut tiles = tile_set(&fixture, [2, 1], 1);
        fixture.uploads.tick(0);
        assert!(tiles.complete_creation());

        let mut a = NodeCoverageInfo::default();
        let mut b = NodeCoverageInfo::default();
        tiles.begin_frame(1);
        a.queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES)
            .unwrap();
        b.queue(&mut tiles, &fixture.catalog, fixture.fid, TILE_BYTES, TILE_BYTES)
            .unwrap();
        pump_tile(&fixture, &mut tiles, &mut a);
        pump_tile(&fixture, &mut tiles, &mut b);

        tiles.begin_frame(2);
        assert!(tiles.is_valid(&a.visible));
        assert!(tiles.is_valid(&b.visible));
        let mut c = NodeCoverageInfo::default();
        match c.queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES) {
            Err(TileSetError::Exhausted) => {}
            other => panic!("expected exhaustion, got {:?}", other.err()),
        }

        // Next frame the oldest becomes evictable again.
        tiles.begin_frame(3);
        assert!(c
            .queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES)
            .is_ok());
    }

    #[test]
    fn test_in_flight_slots_are_locked() {
        let fixture = fixture(TILE_BYTES as usize, 4);
        let mut tiles = tile_set(&fixture, [1, 1], 1);
        fixture.uploads.tick(0);
        assert!(tiles.complete_creation());

        tiles.begin_frame(1);
        let mut a = NodeCoverageInfo::default();
        a.queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES)
            .unwrap();
        // Upload still in flight; the only slot is locked even on a later
        // frame.
        tiles.begin_frame(2);
        let mut b = NodeCoverageInfo::default();
        match b.queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES) {
            Err(TileSetError::Exhausted) => {}
            other => panic!("expected exhaustion, got {:?}", other.err()),
        }

        pump_tile(&fixture, &mut tiles, &mut a);
        tiles.begin_frame(3);
        assert!(b
            .queue(&mut tiles, &fixture.catalog, fixture.fid, 0, TILE_BYTES)
            .is_ok());
    }

    #[test]
    fn test_priority_mode_is_resident_immediately() {
        let fixture = fixture(TILE_BYTES as usize, 2);
        let mut tiles = tile_set(&fixture, [2, 2], 1);
        fixture.uploads.tick(0);
        assert!(tiles.complete_creation());

        tiles.set_priority_mode(true);
        let mut node = NodeCoverageInfo::default();
        tiles
            .begin_upload(&mut node.visible, &fixture.catalog, fixture.fid, 0, TILE_BYTES)
            .unwrap();
        assert!(!node.visible.has_transaction());
        assert!(tiles.is_valid(&node.visible));
    }
}
