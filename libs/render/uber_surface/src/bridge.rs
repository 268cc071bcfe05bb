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

// Translates rectangles of uber-surface edits into per-cell refresh events
// for the tile cache. Pending rectangles are merged conservatively by
// axis-aligned union, so a merge can over-refresh but never miss. Abandons
// dominate updates: once a region is abandoned, its tiles must reload from
// authoritative disk, so any still-queued in-memory refresh for those
// cells is dropped first.
//
// The source and the write-back callbacks are always invoked with the
// bridge lock released; they take their own locks.

use crate::progress::Progress;
use anyhow::{bail, Result};
use gpu::ShaderResourceView;
use log::trace;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Read-only window into the GPU copy of an edited uber-surface region.
/// The same rectangle is described twice: in the view's pixel coordinates
/// and in absolute uber coordinates.
#[derive(Clone, Debug)]
pub struct ShortCircuitUpdate {
    pub srv: ShaderResourceView,
    pub min_in_resource: [u32; 2],
    pub max_in_resource: [u32; 2],
    pub uber_min: [u32; 2],
    pub uber_max: [u32; 2],
}

impl ShortCircuitUpdate {
    pub fn is_degenerate(&self) -> bool {
        self.min_in_resource[0] >= self.max_in_resource[0]
            || self.min_in_resource[1] >= self.max_in_resource[1]
    }
}

/// Supplies the GPU-resident view of an uber region, when one exists.
pub trait ShortCircuitSource: Send + Sync {
    fn short_circuit(&self, uber_min: [u32; 2], uber_max: [u32; 2]) -> Option<ShortCircuitUpdate>;
}

/// Persists one registered cell's samples back to its tile file.
pub type WriteBackFn =
    Box<dyn Fn([u32; 2], [u32; 2], &mut dyn Progress) -> Result<()> + Send + Sync>;

/// One cell's pending rectangle, in cell-normalized [0,1] coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellRegion {
    pub cell_hash: u64,
    pub cell_min: [f32; 2],
    pub cell_max: [f32; 2],
}

/// A consumed pending update: the dirty region, the cell-normalized window
/// the source view covers, and the view itself.
#[derive(Clone, Debug)]
pub struct ResolvedUpdate {
    pub region: CellRegion,
    pub window_min: [f32; 2],
    pub window_max: [f32; 2],
    pub update: ShortCircuitUpdate,
}

struct RegisteredCell {
    uber_min: [u32; 2],
    uber_max: [u32; 2],
    write_back: WriteBackFn,
}

impl RegisteredCell {
    fn overlaps(&self, uber_min: [u32; 2], uber_max: [u32; 2]) -> bool {
        !(self.uber_min[0] >= uber_max[0]
            || self.uber_max[0] <= uber_min[0]
            || self.uber_min[1] >= uber_max[1]
            || self.uber_max[1] <= uber_min[1])
    }

    fn normalize(&self, uber_min: [u32; 2], uber_max: [u32; 2]) -> ([f32; 2], [f32; 2]) {
        let extent = [
            (self.uber_max[0] - self.uber_min[0]) as f32,
            (self.uber_max[1] - self.uber_min[1]) as f32,
        ];
        let rel =
            |value: u32, axis: usize| (value as f32 - self.uber_min[axis] as f32) / extent[axis];
        (
            [rel(uber_min[0], 0).max(0f32), rel(uber_min[1], 1).max(0f32)],
            [rel(uber_max[0], 0).min(1f32), rel(uber_max[1], 1).min(1f32)],
        )
    }
}

#[derive(Default)]
struct BridgeState {
    // Sorted by cell hash so pending merges stay cheap.
    cells: Vec<(u64, Arc<RegisteredCell>)>,
    pending_updates: Vec<CellRegion>,
    pending_abandons: Vec<CellRegion>,
}

impl BridgeState {
    fn cell(&self, cell_hash: u64) -> Option<&Arc<RegisteredCell>> {
        match self.cells.binary_search_by_key(&cell_hash, |(h, _)| *h) {
            Ok(at) => Some(&self.cells[at].1),
            Err(_) => None,
        }
    }
}

pub struct ShortCircuitBridge {
    state: Mutex<BridgeState>,
    source: Mutex<Weak<dyn ShortCircuitSource>>,
}

impl Default for ShortCircuitBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ShortCircuitBridge {
    pub fn new() -> Self {
        let unbound: Weak<dyn ShortCircuitSource> = Weak::<NeverSource>::new();
        Self {
            state: Mutex::new(BridgeState::default()),
            source: Mutex::new(unbound),
        }
    }

    pub fn set_source(&self, source: Weak<dyn ShortCircuitSource>) {
        *self.source.lock() = source;
    }

    /// Associate a cell hash with its rectangle of the uber surface and the
    /// callback that persists it. Duplicate hashes are a programmer error:
    /// either a hash conflict or overlapping cell setup.
    pub fn register_cell(
        &self,
        cell_hash: u64,
        uber_min: [u32; 2],
        uber_max: [u32; 2],
        write_back: WriteBackFn,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let at = match state.cells.binary_search_by_key(&cell_hash, |(h, _)| *h) {
            Ok(_) => bail!(
                "cell {:016x} registered twice on the short-circuit bridge",
                cell_hash
            ),
            Err(at) => at,
        };
        state.cells.insert(
            at,
            (
                cell_hash,
                Arc::new(RegisteredCell {
                    uber_min,
                    uber_max,
                    write_back,
                }),
            ),
        );
        Ok(())
    }

    pub fn unregister_cell(&self, cell_hash: u64) {
        let mut state = self.state.lock();
        if let Ok(at) = state.cells.binary_search_by_key(&cell_hash, |(h, _)| *h) {
            state.cells.remove(at);
        }
    }

    pub fn registered_cell_count(&self) -> usize {
        self.state.lock().cells.len()
    }

    /// Queue a refresh for every registered cell the rectangle touches.
    pub fn queue_update(&self, uber_min: [u32; 2], uber_max: [u32; 2]) {
        let mut state = self.state.lock();
        let mut regions = Vec::new();
        for (hash, cell) in &state.cells {
            if !cell.overlaps(uber_min, uber_max) {
                continue;
            }
            let (cell_min, cell_max) = cell.normalize(uber_min, uber_max);
            regions.push(CellRegion {
                cell_hash: *hash,
                cell_min,
                cell_max,
            });
        }
        for region in regions {
            merge_region(&mut state.pending_updates, region);
        }
    }

    /// Queue a reload-from-disk for every registered cell the rectangle
    /// touches, erasing any pending update those cells had.
    pub fn queue_abandon(&self, uber_min: [u32; 2], uber_max: [u32; 2]) {
        let mut state = self.state.lock();
        let mut regions = Vec::new();
        for (hash, cell) in &state.cells {
            if !cell.overlaps(uber_min, uber_max) {
                continue;
            }
            let (cell_min, cell_max) = cell.normalize(uber_min, uber_max);
            regions.push(CellRegion {
                cell_hash: *hash,
                cell_min,
                cell_max,
            });
        }
        for region in regions {
            state
                .pending_updates
                .retain(|update| update.cell_hash != region.cell_hash);
            merge_region(&mut state.pending_abandons, region);
        }
    }

    /// Consume pending updates, resolving each against the source. Called
    /// once per frame by the cell render cache, after abandons.
    pub fn pending_updates(&self) -> Vec<ResolvedUpdate> {
        let source = match self.source.lock().upgrade() {
            Some(source) => source,
            None => {
                self.state.lock().pending_updates.clear();
                return Vec::new();
            }
        };
        let pending = {
            let mut state = self.state.lock();
            let taken = std::mem::take(&mut state.pending_updates);
            taken
                .into_iter()
                .filter_map(|region| {
                    state
                        .cell(region.cell_hash)
                        .map(|cell| (region, cell.clone()))
                })
                .collect::<Vec<_>>()
        };
        let mut resolved = Vec::with_capacity(pending.len());
        for (region, cell) in pending {
            if let Some(update) = source.short_circuit(cell.uber_min, cell.uber_max) {
                if !update.is_degenerate() {
                    let (window_min, window_max) =
                        cell.normalize(update.uber_min, update.uber_max);
                    resolved.push(ResolvedUpdate {
                        region,
                        window_min,
                        window_max,
                        update,
                    });
                }
            }
        }
        trace!("bridge: {} short-circuit updates resolved", resolved.len());
        resolved
    }

    /// Consume pending abandons. Called once per frame, before updates.
    pub fn pending_abandons(&self) -> Vec<CellRegion> {
        std::mem::take(&mut self.state.lock().pending_abandons)
    }

    /// Resolve the GPU view of one registered cell's sub-rectangle.
    pub fn short_circuit(
        &self,
        cell_hash: u64,
        cell_min: [f32; 2],
        cell_max: [f32; 2],
    ) -> Option<ShortCircuitUpdate> {
        let source = self.source.lock().upgrade()?;
        let (uber_min, uber_max) = {
            let state = self.state.lock();
            let cell = state.cell(cell_hash)?;
            let lerp = |axis: usize, t: f32| {
                cell.uber_min[axis]
                    + ((cell.uber_max[axis] - cell.uber_min[axis]) as f32 * t) as u32
            };
            (
                [lerp(0, cell_min[0]), lerp(1, cell_min[1])],
                [lerp(0, cell_max[0]), lerp(1, cell_max[1])],
            )
        };
        source.short_circuit(uber_min, uber_max)
    }

    /// Resolve one cell sub-rectangle into a ready-to-apply update, the
    /// same shape the pending queue produces.
    pub fn resolve(
        &self,
        cell_hash: u64,
        cell_min: [f32; 2],
        cell_max: [f32; 2],
    ) -> Option<ResolvedUpdate> {
        let update = self.short_circuit(cell_hash, cell_min, cell_max)?;
        if update.is_degenerate() {
            return None;
        }
        let (window_min, window_max) = {
            let state = self.state.lock();
            let cell = state.cell(cell_hash)?;
            cell.normalize(update.uber_min, update.uber_max)
        };
        Some(ResolvedUpdate {
            region: CellRegion {
                cell_hash,
                cell_min,
                cell_max,
            },
            window_min,
            window_max,
            update,
        })
    }

    /// Persist all registered cells intersecting the rectangle.
    pub fn write_cells(
        &self,
        uber_min: [u32; 2],
        uber_max: [u32; 2],
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let touched = {
            let state = self.state.lock();
            state
                .cells
                .iter()
                .filter(|(_, cell)| cell.overlaps(uber_min, uber_max))
                .map(|(hash, cell)| (*hash, cell.clone()))
                .collect::<Vec<_>>()
        };
        progress.begin_phase("write-cells", touched.len());
        for (hash, cell) in touched {
            trace!("bridge: writing back cell {:016x}", hash);
            (cell.write_back)(cell.uber_min, cell.uber_max, progress)?;
            progress.advance();
        }
        Ok(())
    }
}

// Placeholder target for the source weak reference before `set_source`.
struct NeverSource;

impl ShortCircuitSource for NeverSource {
    fn short_circuit(&self, _: [u32; 2], _: [u32; 2]) -> Option<ShortCircuitUpdate> {
        None
    }
}

fn merge_region(pending: &mut Vec<CellRegion>, region: CellRegion) {
    match pending.binary_search_by(|probe| probe.cell_hash.cmp(&region.cell_hash)) {
        Ok(at) => {
            let merged = &mut pending[at];
            merged.cell_min[0] = merged.cell_min[0].min(region.cell_min[0]);
            merged.cell_min[1] = merged.cell_min[1].min(region.cell_min[1]);
            merged.cell_max[0] = merged.cell_max[0].max(region.cell_max[0]);
            merged.cell_max[1] = merged.cell_max[1].max(region.cell_max[1]);
        }
        Err(at) => pending.insert(at, region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use gpu::{BindFlags, Device, ResourceDesc, SampleFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_write_back() -> WriteBackFn {
        Box::new(|_, _, _| Ok(()))
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let bridge = ShortCircuitBridge::new();
        bridge
            .register_cell(42, [0, 0], [128, 128], noop_write_back())
            .unwrap();
        assert!(bridge
            .register_cell(42, [128, 0], [256, 128], noop_write_back())
            .is_err());
    }

    #[test]
    fn test_update_then_abandon_leaves_only_abandon() {
        // Register cell C over (0,0)-(128,128); update a small box; abandon
        // the lower-left quadrant. The update must vanish and the abandon
        // must arrive normalized to (0..0.5, 0..0.5).
        let bridge = ShortCircuitBridge::new();
        bridge
            .register_cell(7, [0, 0], [128, 128], noop_write_back())
            .unwrap();
        bridge.queue_update([10, 10], [20, 20]);
        bridge.queue_abandon([0, 0], [64, 64]);

        assert!(bridge.pending_updates().is_empty());
        let abandons = bridge.pending_abandons();
        assert_eq!(abandons.len(), 1);
        assert_eq!(abandons[0].cell_hash, 7);
        assert_eq!(abandons[0].cell_min, [0f32, 0f32]);
        assert_eq!(abandons[0].cell_max, [0.5f32, 0.5f32]);

        // Consuming clears.
        assert!(bridge.pending_abandons().is_empty());
    }

    #[test]
    fn test_abandon_dominates_interleaved_updates() {
        let bridge = ShortCircuitBridge::new();
        bridge
            .register_cell(7, [0, 0], [100, 100], noop_write_back())
            .unwrap();
        bridge.queue_abandon([0, 0], [100, 100]);
        bridge.queue_update([10, 10], [20, 20]);
        bridge.queue_abandon([0, 0], [100, 100]);
        bridge.queue_update([30, 30], [40, 40]);
        bridge.queue_abandon([25, 25], [50, 50]);
        assert!(bridge.pending_updates().is_empty());
        assert_eq!(bridge.pending_abandons().len(), 1);
    }

    struct WholeSource;

    impl ShortCircuitSource for WholeSource {
        fn short_circuit(
            &self,
            uber_min: [u32; 2],
            uber_max: [u32; 2],
        ) -> Option<ShortCircuitUpdate> {
            let device = gpu::software::SoftwareDevice::new();
            let res = device
                .create_resource(&ResourceDesc::texture_2d(
                    uber_max[0] - uber_min[0],
                    uber_max[1] - uber_min[1],
                    SampleFormat::R32Float,
                    BindFlags::SHADER_RESOURCE,
                    "sc",
                ))
                .unwrap();
            Some(ShortCircuitUpdate {
                srv: ShaderResourceView {
                    resource: res,
                    format_override: None,
                    layer: None,
                },
                min_in_resource: [0, 0],
                max_in_resource: [uber_max[0] - uber_min[0], uber_max[1] - uber_min[1]],
                uber_min,
                uber_max,
            })
        }
    }

    #[test]
    fn test_update_merge_is_union() {
        let bridge = ShortCircuitBridge::new();
        bridge
            .register_cell(1, [0, 0], [100, 100], noop_write_back())
            .unwrap();
        bridge.queue_update([10, 10], [20, 20]);
        bridge.queue_update([80, 80], [90, 90]);
        let source: Arc<dyn ShortCircuitSource> = Arc::new(WholeSource);
        bridge.set_source(Arc::downgrade(&source));
        let updates = bridge.pending_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].region.cell_min, [0.1f32, 0.1f32]);
        assert_eq!(updates[0].region.cell_max, [0.9f32, 0.9f32]);
        assert_eq!(updates[0].window_min, [0f32, 0f32]);
        assert_eq!(updates[0].window_max, [1f32, 1f32]);
    }

    #[test]
    fn test_updates_without_source_are_dropped() {
        let bridge = ShortCircuitBridge::new();
        bridge
            .register_cell(1, [0, 0], [100, 100], noop_write_back())
            .unwrap();
        bridge.queue_update([0, 0], [50, 50]);
        assert!(bridge.pending_updates().is_empty());
    }

    #[test]
    fn test_write_cells_hits_intersecting_registrations() {
        let bridge = ShortCircuitBridge::new();
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..4u64 {
            let count = count.clone();
            bridge
                .register_cell(
                    i,
                    [i as u32 * 100, 0],
                    [(i as u32 + 1) * 100, 100],
                    Box::new(move |_, _, _| {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        bridge
            .write_cells([50, 0], [250, 100], &mut NullProgress)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
