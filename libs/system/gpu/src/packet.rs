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
use crate::descriptor::SubResource;
use anyhow::{anyhow, bail, Result};
use catalog::{Catalog, FileId};
use std::{fmt, ops::Range, sync::Arc};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TexturePitches {
    pub row: u32,
    pub slice: u32,
}

impl TexturePitches {
    pub fn new(row: u32, slice: u32) -> Self {
        Self { row, slice }
    }

    pub fn tight(width: u32, height: u32, sample_bytes: u32) -> Self {
        Self {
            row: width * sample_bytes,
            slice: width * height * sample_bytes,
        }
    }
}

/// An abstract source of bytes for one upload. Packets are finite and
/// read-once: `take` consumes the payload for a subresource; a second take
/// of the same subresource is an error. I/O failures surface here and
/// cancel the owning transaction.
pub trait DataPacket: Send + fmt::Debug {
    fn pitches(&self, sub: SubResource) -> TexturePitches;
    fn take(&mut self, sub: SubResource) -> Result<Vec<u8>>;
}

/// Owned bytes for the base subresource.
#[derive(Debug)]
pub struct BasicPacket {
    data: Option<Vec<u8>>,
    pitches: TexturePitches,
}

impl BasicPacket {
    pub fn new(data: Vec<u8>, pitches: TexturePitches) -> Self {
        Self {
            data: Some(data),
            pitches,
        }
    }
}

impl DataPacket for BasicPacket {
    fn pitches(&self, _sub: SubResource) -> TexturePitches {
        self.pitches
    }

    fn take(&mut self, sub: SubResource) -> Result<Vec<u8>> {
        if sub != SubResource::base() {
            bail!("basic packet only carries the base subresource");
        }
        self.data
            .take()
            .ok_or_else(|| anyhow!("basic packet consumed twice"))
    }
}

/// A byte range of a catalog file. The read happens on the worker thread
/// that consumes the packet, keeping file I/O off the render thread. Often
/// many packets reference disjoint ranges of one streaming file.
pub struct FilePacket {
    catalog: Arc<Catalog>,
    fid: FileId,
    extent: Range<u64>,
    pitches: TexturePitches,
    consumed: bool,
}

impl FilePacket {
    pub fn new(
        catalog: Arc<Catalog>,
        fid: FileId,
        extent: Range<u64>,
        pitches: TexturePitches,
    ) -> Self {
        Self {
            catalog,
            fid,
            extent,
            pitches,
            consumed: false,
        }
    }
}

impl fmt::Debug for FilePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FilePacket({:?} @ {}..{})",
            self.fid, self.extent.start, self.extent.end
        )
    }
}

impl DataPacket for FilePacket {
    fn pitches(&self, _sub: SubResource) -> TexturePitches {
        self.pitches
    }

    fn take(&mut self, _sub: SubResource) -> Result<Vec<u8>> {
        if self.consumed {
            bail!("file packet consumed twice");
        }
        self.consumed = true;
        self.catalog.read_slice(self.fid, self.extent.clone())
    }
}

/// Zero-filled bytes; serves any subresource.
#[derive(Debug)]
pub struct EmptyPacket {
    byte_count: usize,
    pitches: TexturePitches,
}

impl EmptyPacket {
    pub fn new(byte_count: usize, pitches: TexturePitches) -> Self {
        Self { byte_count, pitches }
    }
}

impl DataPacket for EmptyPacket {
    fn pitches(&self, _sub: SubResource) -> TexturePitches {
        self.pitches
    }

    fn take(&mut self, _sub: SubResource) -> Result<Vec<u8>> {
        Ok(vec![0u8; self.byte_count])
    }
}

/// Always fails to produce bytes. Exercises the cancellation path of the
/// upload queue the way a vanished or truncated streaming file would.
#[derive(Debug)]
pub struct FailingPacket;

impl DataPacket for FailingPacket {
    fn pitches(&self, _sub: SubResource) -> TexturePitches {
        TexturePitches::new(0, 0)
    }

    fn take(&mut self, _sub: SubResource) -> Result<Vec<u8>> {
        bail!("packet source unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::MemoryDrawer;

    #[test]
    fn test_basic_packet_single_use() {
        let mut packet = BasicPacket::new(vec![1, 2, 3], TexturePitches::new(3, 3));
        assert_eq!(packet.take(SubResource::base()).unwrap(), vec![1, 2, 3]);
        assert!(packet.take(SubResource::base()).is_err());
        assert!(BasicPacket::new(vec![], TexturePitches::new(0, 0))
            .take(SubResource::layer(1))
            .is_err());
    }

    #[test]
    fn test_file_packet_reads_range() {
        let mut drawer = MemoryDrawer::new("t", 0);
        drawer.add_file("blob", (0u8..32).collect::<Vec<u8>>());
        let catalog = Arc::new(Catalog::with_drawers(vec![Box::new(drawer)]).unwrap());
        let fid = catalog.lookup("blob").unwrap();
        let mut packet = FilePacket::new(catalog, fid, 8..12, TexturePitches::new(4, 16));
        assert_eq!(packet.take(SubResource::base()).unwrap(), vec![8, 9, 10, 11]);
        assert!(packet.take(SubResource::base()).is_err());
    }

    #[test]
    fn test_empty_packet_zero_fill() {
        let mut packet = EmptyPacket::new(16, TexturePitches::new(4, 16));
        assert_eq!(packet.take(SubResource::base()).unwrap(), vec![0u8; 16]);
    }
}
