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
use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    io::{Read, Seek, SeekFrom},
    ops::Range,
    path::PathBuf,
};

/// Exposes the files of one directory. Streaming reads re-open the backing
/// file per request; the open is cheap next to the seek-and-read and keeps
/// the drawer free of shared mutable state.
pub struct DirectoryDrawer {
    name: String,
    priority: i64,
    path: PathBuf,
    index: HashMap<DrawerFileId, String>,
}

impl DirectoryDrawer {
    pub fn from_directory<S: AsRef<OsStr> + ?Sized>(
        priority: i64,
        path_name: &S,
    ) -> Result<Box<dyn DrawerInterface>> {
        Self::from_directory_with_extension(priority, path_name, "")
    }

    pub fn from_directory_with_extension<S: AsRef<OsStr> + ?Sized>(
        priority: i64,
        path_name: &S,
        only_extension: &str,
    ) -> Result<Box<dyn DrawerInterface>> {
        let path = PathBuf::from(path_name);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_owned());
        let mut drawer = Self {
            name,
            priority,
            path,
            index: HashMap::new(),
        };
        drawer.populate(only_extension)?;
        Ok(Box::new(drawer))
    }

    fn populate(&mut self, only_extension: &str) -> Result<()> {
        for (i, entry) in fs::read_dir(&self.path)?.enumerate() {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(raw_name) = entry.path().file_name() {
                let name = raw_name.to_string_lossy().to_string();
                if !only_extension.is_empty()
                    && !name.to_lowercase().ends_with(&only_extension.to_lowercase())
                {
                    continue;
                }
                self.index.insert(DrawerFileId::from_u32(i as u32), name);
            }
        }
        Ok(())
    }

    fn file_path(&self, id: DrawerFileId) -> Result<PathBuf> {
        ensure!(self.index.contains_key(&id), "file not found in drawer");
        let mut global_path = self.path.clone();
        global_path.push(&self.index[&id]);
        Ok(global_path)
    }
}

impl DrawerInterface for DirectoryDrawer {
    fn index(&self) -> Result<HashMap<DrawerFileId, String>> {
        Ok(self.index.clone())
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stat_sync(&self, id: DrawerFileId) -> Result<DrawerFileMetadata> {
        let path = self.file_path(id)?;
        let meta = fs::metadata(&path)?;
        Ok(DrawerFileMetadata {
            drawer_file_id: id,
            name: self.index[&id].clone(),
            size: meta.len(),
            path: Some(path),
        })
    }

    fn read_sync(&self, id: DrawerFileId) -> Result<Vec<u8>> {
        let mut fp = fs::File::open(self.file_path(id)?)?;
        let mut content = Vec::new();
        fp.read_to_end(&mut content)?;
        Ok(content)
    }

    fn read_slice_sync(&self, id: DrawerFileId, extent: Range<u64>) -> Result<Vec<u8>> {
        ensure!(extent.end >= extent.start, "negative read extent");
        let mut fp = fs::File::open(self.file_path(id)?)?;
        fp.seek(SeekFrom::Start(extent.start))?;
        let mut content = vec![0u8; (extent.end - extent.start) as usize];
        fp.read_exact(&mut content)?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_directory_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fp = fs::File::create(dir.path().join("tile.bin"))?;
        fp.write_all(&[0u8, 1, 2, 3, 4, 5, 6, 7])?;
        drop(fp);

        let drawer = DirectoryDrawer::from_directory(0, dir.path().as_os_str())?;
        let index = drawer.index()?;
        assert_eq!(index.len(), 1);
        let id = *index.keys().next().unwrap();
        assert_eq!(drawer.read_sync(id)?.len(), 8);
        assert_eq!(drawer.read_slice_sync(id, 4..8)?, vec![4, 5, 6, 7]);
        assert_eq!(drawer.stat_sync(id)?.size, 8);
        Ok(())
    }

    #[test]
    fn test_read_past_end_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("tiny.bin"), [1u8, 2])?;
        let drawer = DirectoryDrawer::from_directory(0, dir.path().as_os_str())?;
        let id = *drawer.index()?.keys().next().unwrap();
        assert!(drawer.read_slice_sync(id, 0..16).is_err());
        Ok(())
    }
}
