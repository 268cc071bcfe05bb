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

mod tile_set;

pub use tile_set::{TextureTileSet, TileSetDesc, TileSetError};

use catalog::FileId;
use gpu::TransactionId;
use std::sync::Arc;

/// Slot coordinates inside a tile set: element grid position plus array
/// layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TileAddress {
    pub x: u32,
    pub y: u32,
    pub layer: u32,
}

/// A generation-stamped reference to one slot of a tile set. The handle is
/// readable while its generation matches the slot's; an overwrite of the
/// slot silently invalidates every older handle.
#[derive(Clone, Debug, Default)]
pub struct TextureTile {
    pub(crate) address: Option<TileAddress>,
    pub(crate) upload_id: u32,
    pub(crate) transaction: Option<TransactionId>,
}

impl TextureTile {
    pub fn address(&self) -> Option<TileAddress> {
        self.address
    }

    pub fn generation(&self) -> u32 {
        self.upload_id
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

/// The visible/pending tile pair one node holds per layer. An upload lands
/// in `pending` and is promoted to `visible` on completion, so the visible
/// tile keeps rendering while its replacement streams in.
#[derive(Clone, Debug, Default)]
pub struct NodeCoverageInfo {
    pub visible: TextureTile,
    pub pending: TextureTile,
}

impl NodeCoverageInfo {
    /// Begin streaming this node's payload into a freshly claimed slot.
    pub fn queue(
        &mut self,
        tile_set: &mut TextureTileSet,
        catalog: &Arc<catalog::Catalog>,
        fid: FileId,
        offset: u64,
        size: u64,
    ) -> Result<(), TileSetError> {
        tile_set.begin_upload(&mut self.pending, catalog, fid, offset, size)
    }

    /// Poll the pending upload. Returns true once there is nothing left in
    /// flight for this node; on success the pending tile becomes visible.
    pub fn complete_upload(&mut self, tile_set: &mut TextureTileSet) -> bool {
        let tid = match self.pending.transaction {
            Some(tid) => tid,
            // Nothing pending; synchronous (priority-mode) uploads land
            // directly in `visible`.
            None => return true,
        };
        let uploads = tile_set.uploads().clone();
        if !uploads.is_completed(tid) {
            return false;
        }
        let committed = uploads.status_of(tid) == Some(gpu::TransactionStatus::Committed);
        uploads.end(tid);
        self.pending.transaction = None;
        if let Some(address) = self.pending.address {
            tile_set.note_upload_finished(address);
        }
        if committed {
            std::mem::swap(&mut self.visible, &mut self.pending);
        }
        self.pending = TextureTile::default();
        true
    }

    /// Cancel and release anything in flight and drop both handles; the
    /// node reloads from disk the next time it is queued.
    pub fn end_transactions(&mut self, tile_set: &mut TextureTileSet) {
        let uploads = tile_set.uploads().clone();
        if let Some(tid) = self.pending.transaction.take() {
            uploads.cancel(tid);
            uploads.end(tid);
            if let Some(address) = self.pending.address {
                tile_set.note_upload_finished(address);
            }
        }
        self.pending = TextureTile::default();
        self.visible = TextureTile::default();
    }
}
