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
use crate::{DrawerFileId, DrawerInterface, FileMetadata};
use anyhow::{bail, ensure, Result};
use glob::{MatchOptions, Pattern};
use log::debug;
use smallvec::SmallVec;
use std::{collections::HashMap, ops::Range};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
struct DrawerId(u16);

/// A stable handle to one file somewhere in the catalog.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FileId {
    drawer_id: DrawerId,
    drawer_file_id: DrawerFileId,
}

// A catalog is a uniform, indexed interface to a collection of drawers. It
// lets the streaming layers reference tile and surface files by id and pull
// byte ranges out of them without knowing whether the bytes come from loose
// files on disk, a packed archive, or an in-memory fixture.
pub struct Catalog {
    drawers: Vec<Box<dyn DrawerInterface>>,
    index: HashMap<String, FileId>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::empty()
    }
}

impl Catalog {
    pub fn empty() -> Self {
        Self {
            drawers: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_drawers(drawers: Vec<Box<dyn DrawerInterface>>) -> Result<Self> {
        let mut catalog = Self::empty();
        for drawer in drawers {
            catalog.add_drawer(drawer)?;
        }
        Ok(catalog)
    }

    /// Add a drawer full of files to the catalog. Names already present are
    /// only masked if the new drawer has a higher priority.
    pub fn add_drawer(&mut self, drawer: Box<dyn DrawerInterface>) -> Result<()> {
        ensure!(self.drawers.len() < u16::MAX as usize);
        let drawer_id = DrawerId(self.drawers.len() as u16);
        let drawer_index = drawer.index()?;
        debug!(
            "catalog: adding drawer {} with {} files",
            drawer.name(),
            drawer_index.len()
        );
        for (drawer_file_id, name) in drawer_index {
            let fid = FileId {
                drawer_id,
                drawer_file_id,
            };
            match self.index.get(&name) {
                Some(existing) => {
                    let existing_priority = self.drawers[existing.drawer_id.0 as usize].priority();
                    if drawer.priority() > existing_priority {
                        self.index.insert(name, fid);
                    }
                }
                None => {
                    self.index.insert(name, fid);
                }
            }
        }
        self.drawers.push(drawer);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<FileId> {
        self.index.get(name).copied()
    }

    /// All files whose name matches the given glob. If `with_extension` is
    /// provided, names are pre-filtered by extension, which is much faster
    /// than matching the full pattern.
    pub fn find_matching(
        &self,
        glob: &str,
        with_extension: Option<&str>,
    ) -> Result<SmallVec<[FileId; 4]>> {
        let pattern = Pattern::new(glob)?;
        let opts = MatchOptions {
            case_sensitive: false,
            require_literal_leading_dot: false,
            require_literal_separator: true,
        };
        let mut matching = SmallVec::new();
        for (name, &fid) in &self.index {
            if let Some(ext) = with_extension {
                if !name.to_lowercase().ends_with(&ext.to_lowercase()) {
                    continue;
                }
            }
            if pattern.matches_with(name, opts) {
                matching.push(fid);
            }
        }
        matching.sort();
        Ok(matching)
    }

    pub fn stat(&self, fid: FileId) -> Result<FileMetadata> {
        let drawer_meta = self.drawer(fid)?.stat_sync(fid.drawer_file_id)?;
        Ok(FileMetadata::from_drawer(fid, drawer_meta))
    }

    pub fn read_name(&self, name: &str) -> Result<Vec<u8>> {
        match self.lookup(name) {
            Some(fid) => self.read(fid),
            None => bail!("no file in catalog named {}", name),
        }
    }

    pub fn read(&self, fid: FileId) -> Result<Vec<u8>> {
        self.drawer(fid)?.read_sync(fid.drawer_file_id)
    }

    pub fn read_slice(&self, fid: FileId, extent: Range<u64>) -> Result<Vec<u8>> {
        self.drawer(fid)?.read_slice_sync(fid.drawer_file_id, extent)
    }

    fn drawer(&self, fid: FileId) -> Result<&dyn DrawerInterface> {
        match self.drawers.get(fid.drawer_id.0 as usize) {
            Some(drawer) => Ok(drawer.as_ref()),
            None => bail!("file id references an unknown drawer"),
        }
    }
}
