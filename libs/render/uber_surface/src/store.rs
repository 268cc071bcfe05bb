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
use anyhow::{bail, ensure, Result};
use gpu::SampleFormat;
use log::debug;
use memmap::MmapMut;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    mem,
    path::{Path, PathBuf},
};
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

const UBER_MAGIC: u32 = u32::from_le_bytes(*b"LSRF");

// The on-disk format is just this header followed by width*height samples
// in row-major order.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
struct UberHeader {
    magic: u32,
    width: u32,
    height: u32,
    sample_type: u32,
    sample_array_count: u32,
    reserved: [u32; 3],
}

/// The single source of truth for persisted surface content: a memory
/// mapped 2D array of samples. Shared-read, exclusive-write; only the
/// editor's flush mutates the mapping.
pub struct UberSurface {
    map: MmapMut,
    // Keeps the mapping valid for the life of the surface.
    #[allow(unused)]
    file: File,
    path: PathBuf,
    width: u32,
    height: u32,
    format: SampleFormat,
    array_count: u32,
}

impl UberSurface {
    /// Write a zero-filled surface file.
    pub fn create_empty<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        format: SampleFormat,
        array_count: u32,
    ) -> Result<()> {
        ensure!(width > 0 && height > 0, "degenerate surface dimensions");
        ensure!(array_count >= 1, "surface needs at least one sample plane");
        let header = UberHeader {
            magic: UBER_MAGIC,
            width,
            height,
            sample_type: format.to_raw(),
            sample_array_count: array_count,
            reserved: [0; 3],
        };
        let mut fp = File::create(path.as_ref())?;
        fp.write_all(header.as_bytes())?;
        let row = vec![0u8; width as usize * (format.sample_bytes() * array_count) as usize];
        for _ in 0..height {
            fp.write_all(&row)?;
        }
        fp.sync_all()?;
        debug!(
            "uber-surface: created {}x{} at {:?}",
            width,
            height,
            path.as_ref()
        );
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        ensure!(
            map.len() >= mem::size_of::<UberHeader>(),
            "surface file too small for its header: {:?}",
            path.as_ref()
        );
        let header = *LayoutVerified::<&[u8], UberHeader>::new(
            &map[..mem::size_of::<UberHeader>()],
        )
        .expect("header is packed and aligned")
        .into_ref();
        ensure!(
            header.magic == UBER_MAGIC,
            "not an uber-surface file: {:?}",
            path.as_ref()
        );
        let format = match SampleFormat::from_raw(header.sample_type) {
            Some(format) => format,
            None => bail!("unknown sample type {} in {:?}", header.sample_type, path.as_ref()),
        };
        let sample_bytes = (format.sample_bytes() * header.sample_array_count) as u64;
        let expected =
            mem::size_of::<UberHeader>() as u64 + header.width as u64 * header.height as u64 * sample_bytes;
        ensure!(
            map.len() as u64 >= expected,
            "surface file shorter than its header claims: {:?}",
            path.as_ref()
        );
        Ok(Self {
            map,
            file,
            path: path.as_ref().to_owned(),
            width: header.width,
            height: header.height,
            format,
            array_count: header.sample_array_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn array_count(&self) -> u32 {
        self.array_count
    }

    pub fn sample_bytes(&self) -> u32 {
        self.format.sample_bytes() * self.array_count
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.sample_bytes() as usize
    }

    pub fn sample(&self, x: u32, y: u32) -> &[u8] {
        debug_assert!(x < self.width && y < self.height);
        let start = mem::size_of::<UberHeader>()
            + y as usize * self.stride()
            + x as usize * self.sample_bytes() as usize;
        &self.map[start..start + self.sample_bytes() as usize]
    }

    pub fn sample_f32(&self, x: u32, y: u32) -> f32 {
        let raw = self.sample(x, y);
        f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    /// Tightly packed rows of the rectangle [min, max).
    pub fn read_region(&self, min: [u32; 2], max: [u32; 2]) -> Result<Vec<u8>> {
        ensure!(
            min[0] < max[0] && min[1] < max[1] && max[0] <= self.width && max[1] <= self.height,
            "region {:?}..{:?} outside of {}x{} surface",
            min,
            max,
            self.width,
            self.height
        );
        let row_bytes = (max[0] - min[0]) as usize * self.sample_bytes() as usize;
        let mut out = Vec::with_capacity((max[1] - min[1]) as usize * row_bytes);
        for y in min[1]..max[1] {
            let start = mem::size_of::<UberHeader>()
                + y as usize * self.stride()
                + min[0] as usize * self.sample_bytes() as usize;
            out.extend_from_slice(&self.map[start..start + row_bytes]);
        }
        Ok(out)
    }

    /// Copy rows into the rectangle [min, max). `src_row_pitch` is the byte
    /// distance between source rows.
    pub fn write_region(
        &mut self,
        min: [u32; 2],
        max: [u32; 2],
        data: &[u8],
        src_row_pitch: usize,
    ) -> Result<()> {
        ensure!(
            min[0] < max[0] && min[1] < max[1] && max[0] <= self.width && max[1] <= self.height,
            "region {:?}..{:?} outside of {}x{} surface",
            min,
            max,
            self.width,
            self.height
        );
        let row_bytes = (max[0] - min[0]) as usize * self.sample_bytes() as usize;
        let stride = self.stride();
        let sample_bytes = self.sample_bytes() as usize;
        for (row, y) in (min[1]..max[1]).enumerate() {
            let src_start = row * src_row_pitch;
            ensure!(
                src_start + row_bytes <= data.len(),
                "write data shorter than region"
            );
            let dst_start =
                mem::size_of::<UberHeader>() + y as usize * stride + min[0] as usize * sample_bytes;
            self.map[dst_start..dst_start + row_bytes]
                .copy_from_slice(&data[src_start..src_start + row_bytes]);
        }
        Ok(())
    }

    /// Push dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_open_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.uber");
        UberSurface::create_empty(&path, 64, 32, SampleFormat::R32Float, 1)?;
        let surface = UberSurface::open(&path)?;
        assert_eq!(surface.width(), 64);
        assert_eq!(surface.height(), 32);
        assert_eq!(surface.format(), SampleFormat::R32Float);
        assert_eq!(surface.sample_f32(10, 10), 0f32);
        Ok(())
    }

    #[test]
    fn test_write_region_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.uber");
        UberSurface::create_empty(&path, 16, 16, SampleFormat::R32Float, 1)?;
        {
            let mut surface = UberSurface::open(&path)?;
            let row_pitch = 4 * 4;
            let mut data = Vec::new();
            for _ in 0..4 * 4 {
                data.extend_from_slice(&7f32.to_le_bytes());
            }
            surface.write_region([4, 4], [8, 8], &data, row_pitch)?;
            surface.flush()?;
        }
        let surface = UberSurface::open(&path)?;
        assert_eq!(surface.sample_f32(5, 5), 7f32);
        assert_eq!(surface.sample_f32(3, 4), 0f32);
        assert_eq!(surface.sample_f32(8, 8), 0f32);
        Ok(())
    }

    #[test]
    fn test_rejects_foreign_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, vec![0xABu8; 256])?;
        assert!(UberSurface::open(&path).is_err());
        Ok(())
    }
}
