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
use crate::{DrawerFileId, DrawerFileMetadata, DrawerInterface};
use anyhow::{ensure, Result};
use std::{collections::HashMap, ops::Range, sync::Arc};

/// A drawer over owned buffers. Tests and tools use this to assemble a
/// catalog without touching the filesystem.
pub struct MemoryDrawer {
    name: String,
    priority: i64,
    names: HashMap<DrawerFileId, String>,
    data: HashMap<DrawerFileId, Arc<[u8]>>,
}

impl MemoryDrawer {
    pub fn new<S: Into<String>>(name: S, priority: i64) -> Self {
        Self {
            name: name.into(),
            priority,
            names: HashMap::new(),
            data: HashMap::new(),
        }
    }

    pub fn add_file<S: Into<String>, D: Into<Arc<[u8]>>>(&mut self, name: S, data: D) {
        let id = DrawerFileId::from_u32(self.names.len() as u32);
        self.names.insert(id, name.into());
        self.data.insert(id, data.into());
    }

    fn file(&self, id: DrawerFileId) -> Result<&Arc<[u8]>> {
        ensure!(self.data.contains_key(&id), "file not found in drawer");
        Ok(&self.data[&id])
    }
}

impl DrawerInterface for MemoryDrawer {
    fn index(&self) -> Result<HashMap<DrawerFileId, String>> {
        Ok(self.names.clone())
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stat_sync(&self, id: DrawerFileId) -> Result<DrawerFileMetadata> {
        let data = self.file(id)?;
        Ok(DrawerFileMetadata {
            drawer_file_id: id,
            name: self.names[&id].clone(),
            size: data.len() as u64,
            path: None,
        })
    }

    fn read_sync(&self, id: DrawerFileId) -> Result<Vec<u8>> {
        Ok(self.file(id)?.to_vec())
    }

    fn read_slice_sync(&self, id: DrawerFileId, extent: Range<u64>) -> Result<Vec<u8>> {
        let data = self.file(id)?;
        ensure!(
            extent.start <= extent.end && extent.end <= data.len() as u64,
            "read extent {}..{} outside of file with {} bytes",
            extent.start,
            extent.end,
            data.len()
        );
        Ok(data[extent.start as usize..extent.end as usize].to_vec())
    }
}
