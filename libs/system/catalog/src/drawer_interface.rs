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
use anyhow::Result;
use std::{collections::HashMap, ops::Range, path::PathBuf};

// Files are identified by an id internally.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DrawerFileId(u32);

impl DrawerFileId {
    pub fn from_u32(i: u32) -> Self {
        DrawerFileId(i)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
pub struct DrawerFileMetadata {
    pub drawer_file_id: DrawerFileId,
    pub name: String,
    pub size: u64,
    pub path: Option<PathBuf>,
}

// A drawer is one related section of a catalog: a uniform interface over a
// group of named files. Streaming callers hold on to ids and read byte
// ranges; the blocking reads here are expected to be driven from worker
// threads, never from the render thread.
pub trait DrawerInterface: Send + Sync {
    // Every name that can be loaded from this drawer. The catalog only calls
    // this once, then refers to files by id.
    fn index(&self) -> Result<HashMap<DrawerFileId, String>>;

    // Files from drawers with a higher priority mask lower-priority names.
    fn priority(&self) -> i64;

    fn name(&self) -> &str;

    fn stat_sync(&self, id: DrawerFileId) -> Result<DrawerFileMetadata>;

    // Whole-file read, blocking.
    fn read_sync(&self, id: DrawerFileId) -> Result<Vec<u8>>;

    // Positioned byte-range read, blocking. This is the streaming hot path.
    fn read_slice_sync(&self, id: DrawerFileId, extent: Range<u64>) -> Result<Vec<u8>>;
}
