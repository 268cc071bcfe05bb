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

// Per-cell tile files: a header, the quadtree field table, a flat per-node
// metadata table, then the tile payloads. Field f holds 2^f x 2^f nodes,
// so each field has four times the nodes of the previous one. The scaffold
// is the parsed index; payloads stream later by byte range.

use anyhow::{bail, ensure, Result};
use catalog::{Catalog, FileId};
use gpu::SampleFormat;
use nalgebra::{Matrix4, Vector3};
use std::mem;
use zerocopy::{AsBytes, FromBytes};

pub const CELL_FILE_MAGIC: u32 = u32::from_le_bytes(*b"LSCF");
pub const CELL_FILE_VERSION: u32 = 1;

/// Marks a node without payload (a hole in the source data).
pub const NODE_HOLE: u64 = u64::MAX;

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
pub struct CellFileHeader {
    pub magic: u32,
    pub version: u32,
    pub field_count: u32,
    pub node_count: u32,
    /// Samples along one edge of every tile payload.
    pub element_size: u32,
    /// Border samples shared with adjacent tiles for seamless filtering.
    pub overlap: u32,
    pub sample_format: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
pub struct FieldRecord {
    pub width_in_nodes: u32,
    pub height_in_nodes: u32,
    pub node_begin: u32,
    pub node_end: u32,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
pub struct NodeRecord {
    /// Column-major unit-square-to-cell transform.
    pub local_to_cell: [f32; 16],
    pub payload_offset: u64,
    pub payload_size: u32,
    pub width_in_elements: u32,
}

#[derive(Clone, Debug)]
pub struct NodeDesc {
    pub local_to_cell: Matrix4<f32>,
    pub payload_offset: u64,
    pub payload_size: u32,
    pub width_in_elements: u32,
}

impl NodeDesc {
    pub fn has_payload(&self) -> bool {
        self.payload_offset != NODE_HOLE && self.payload_size > 0
    }
}

/// The parsed index of one cell tile file.
#[derive(Debug)]
pub struct CellScaffold {
    fid: FileId,
    element_size: u32,
    overlap: u32,
    sample_format: SampleFormat,
    fields: Vec<FieldRecord>,
    nodes: Vec<NodeDesc>,
}

impl CellScaffold {
    pub fn from_catalog(catalog: &Catalog, fid: FileId) -> Result<Self> {
        let header_bytes = catalog.read_slice(fid, 0..mem::size_of::<CellFileHeader>() as u64)?;
        let header = CellFileHeader::read_from(header_bytes.as_slice())
            .expect("sliced exactly one header");
        ensure!(header.magic == CELL_FILE_MAGIC, "not a cell tile file");
        ensure!(
            header.version == CELL_FILE_VERSION,
            "unsupported cell tile file version {}",
            header.version
        );
        let sample_format = match SampleFormat::from_raw(header.sample_format) {
            Some(format) => format,
            None => bail!("unknown sample format {} in cell file", header.sample_format),
        };

        let fields_start = mem::size_of::<CellFileHeader>() as u64;
        let nodes_start =
            fields_start + header.field_count as u64 * mem::size_of::<FieldRecord>() as u64;
        let nodes_end = nodes_start + header.node_count as u64 * mem::size_of::<NodeRecord>() as u64;

        let field_bytes = catalog.read_slice(fid, fields_start..nodes_start)?;
        let mut fields = Vec::with_capacity(header.field_count as usize);
        for chunk in field_bytes.chunks_exact(mem::size_of::<FieldRecord>()) {
            fields.push(FieldRecord::read_from(chunk).expect("exact chunk"));
        }

        let node_bytes = catalog.read_slice(fid, nodes_start..nodes_end)?;
        let mut nodes = Vec::with_capacity(header.node_count as usize);
        for chunk in node_bytes.chunks_exact(mem::size_of::<NodeRecord>()) {
            let record = NodeRecord::read_from(chunk).expect("exact chunk");
            nodes.push(NodeDesc {
                local_to_cell: Matrix4::from_column_slice(&record.local_to_cell),
                payload_offset: record.payload_offset,
                payload_size: record.payload_size,
                width_in_elements: record.width_in_elements,
            });
        }

        for (i, field) in fields.iter().enumerate() {
            ensure!(
                field.node_end as usize <= nodes.len() && field.node_begin <= field.node_end,
                "field {} references nodes outside of the node table",
                i
            );
        }

        Ok(Self {
            fid,
            element_size: header.element_size,
            overlap: header.overlap,
            sample_format,
            fields,
            nodes,
        })
    }

    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, lod: usize) -> &FieldRecord {
        &self.fields[lod]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: u32) -> &NodeDesc {
        &self.nodes[index as usize]
    }

    /// The field holding an absolute node index.
    pub fn lod_of(&self, index: u32) -> Option<usize> {
        self.fields
            .iter()
            .position(|field| index >= field.node_begin && index < field.node_end)
    }

    /// Grid position of a node within its field.
    pub fn node_xy(&self, lod: usize, index: u32) -> [i32; 2] {
        let field = &self.fields[lod];
        let offset = index - field.node_begin;
        [
            (offset % field.width_in_nodes) as i32,
            (offset / field.width_in_nodes) as i32,
        ]
    }

    /// Absolute node index at a grid position, or None outside the field.
    pub fn node_index(&self, lod: usize, xy: [i32; 2]) -> Option<u32> {
        let field = &self.fields[lod];
        if xy[0] < 0
            || xy[1] < 0
            || xy[0] >= field.width_in_nodes as i32
            || xy[1] >= field.height_in_nodes as i32
        {
            return None;
        }
        Some(field.node_begin + xy[1] as u32 * field.width_in_nodes + xy[0] as u32)
    }

    /// The cell-normalized rectangle a node covers.
    pub fn node_cell_rect(&self, lod: usize, index: u32) -> ([f32; 2], [f32; 2]) {
        let field = &self.fields[lod];
        let xy = self.node_xy(lod, index);
        let extent = [
            1f32 / field.width_in_nodes as f32,
            1f32 / field.height_in_nodes as f32,
        ];
        (
            [xy[0] as f32 * extent[0], xy[1] as f32 * extent[1]],
            [(xy[0] + 1) as f32 * extent[0], (xy[1] + 1) as f32 * extent[1]],
        )
    }
}

/// Assembles cell tile files; the terrain compiler and the tests both
/// write through this.
pub struct CellFileBuilder {
    field_count: u32,
    element_size: u32,
    overlap: u32,
    format: SampleFormat,
    payloads: Vec<Option<Vec<u8>>>,
    transforms: Vec<Matrix4<f32>>,
    field_dims: Vec<(u32, u32)>,
    node_begins: Vec<u32>,
}

impl CellFileBuilder {
    pub fn new(field_count: u32, element_size: u32, overlap: u32, format: SampleFormat) -> Self {
        assert!(field_count >= 1);
        let mut field_dims = Vec::new();
        let mut node_begins = Vec::new();
        let mut cursor = 0u32;
        for f in 0..field_count {
            let per_side = 1u32 << f;
            field_dims.push((per_side, per_side));
            node_begins.push(cursor);
            cursor += per_side * per_side;
        }
        let node_count = cursor as usize;
        let mut transforms = Vec::with_capacity(node_count);
        for f in 0..field_count {
            let per_side = 1u32 << f;
            let scale = 1f32 / per_side as f32;
            for y in 0..per_side {
                for x in 0..per_side {
                    let transform = Matrix4::new_translation(&Vector3::new(
                        x as f32 * scale,
                        y as f32 * scale,
                        0f32,
                    )) * Matrix4::new_nonuniform_scaling(&Vector3::new(scale, scale, 1f32));
                    transforms.push(transform);
                }
            }
        }
        Self {
            field_count,
            element_size,
            overlap,
            format,
            payloads: vec![None; node_count],
            transforms,
            field_dims,
            node_begins,
        }
    }

    pub fn node_count(&self) -> usize {
        self.payloads.len()
    }

    pub fn payload_byte_count(&self) -> usize {
        (self.element_size * self.element_size * self.format.sample_bytes()) as usize
    }

    fn node_index(&self, field: u32, x: u32, y: u32) -> usize {
        let (w, _) = self.field_dims[field as usize];
        (self.node_begins[field as usize] + y * w + x) as usize
    }

    pub fn set_payload(&mut self, field: u32, x: u32, y: u32, data: Vec<u8>) {
        assert_eq!(data.len(), self.payload_byte_count());
        let index = self.node_index(field, x, y);
        self.payloads[index] = Some(data);
    }

    /// Fill every node's payload from a generator.
    pub fn fill_payloads(&mut self, f: impl Fn(u32, u32, u32) -> Vec<u8>) {
        for field in 0..self.field_count {
            let (w, h) = self.field_dims[field as usize];
            for y in 0..h {
                for x in 0..w {
                    let data = f(field, x, y);
                    self.set_payload(field, x, y, data);
                }
            }
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let node_count = self.node_count() as u32;
        let header = CellFileHeader {
            magic: CELL_FILE_MAGIC,
            version: CELL_FILE_VERSION,
            field_count: self.field_count,
            node_count,
            element_size: self.element_size,
            overlap: self.overlap,
            sample_format: self.format.to_raw(),
            reserved: 0,
        };
        let payload_start = mem::size_of::<CellFileHeader>()
            + self.field_count as usize * mem::size_of::<FieldRecord>()
            + node_count as usize * mem::size_of::<NodeRecord>();

        let mut out = Vec::new();
        out.extend_from_slice(header.as_bytes());
        for (f, &(w, h)) in self.field_dims.iter().enumerate() {
            let record = FieldRecord {
                width_in_nodes: w,
                height_in_nodes: h,
                node_begin: self.node_begins[f],
                node_end: self.node_begins[f] + w * h,
            };
            out.extend_from_slice(record.as_bytes());
        }
        let mut payload_cursor = payload_start as u64;
        for (index, payload) in self.payloads.iter().enumerate() {
            let (offset, size) = match payload {
                Some(data) => {
                    let at = payload_cursor;
                    payload_cursor += data.len() as u64;
                    (at, data.len() as u32)
                }
                None => (NODE_HOLE, 0),
            };
            let mut local_to_cell = [0f32; 16];
            local_to_cell.copy_from_slice(self.transforms[index].as_slice());
            let record = NodeRecord {
                local_to_cell,
                payload_offset: offset,
                payload_size: size,
                width_in_elements: self.element_size,
            };
            out.extend_from_slice(record.as_bytes());
        }
        for payload in self.payloads.iter().flatten() {
            out.extend_from_slice(payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::MemoryDrawer;

    fn build_catalog(data: Vec<u8>) -> (Catalog, FileId) {
        let mut drawer = MemoryDrawer::new("cells", 0);
        drawer.add_file("c0.heights", data);
        let catalog = Catalog::with_drawers(vec![Box::new(drawer)]).unwrap();
        let fid = catalog.lookup("c0.heights").unwrap();
        (catalog, fid)
    }

    #[test]
    fn test_builder_scaffold_round_trip() {
        let mut builder = CellFileBuilder::new(3, 4, 1, SampleFormat::R16Uint);
        assert_eq!(builder.node_count(), 1 + 4 + 16);
        builder.fill_payloads(|field, x, y| {
            let value = (field * 100 + y * 10 + x) as u16;
            let mut data = Vec::new();
            for _ in 0..16 {
                data.extend_from_slice(&value.to_le_bytes());
            }
            data
        });
        let (catalog, fid) = build_catalog(builder.build());

        let scaffold = CellScaffold::from_catalog(&catalog, fid).unwrap();
        assert_eq!(scaffold.field_count(), 3);
        assert_eq!(scaffold.node_count(), 21);
        assert_eq!(scaffold.element_size(), 4);
        assert_eq!(scaffold.sample_format(), SampleFormat::R16Uint);

        // Field 2 is a 4x4 grid following fields 0 and 1.
        let field = scaffold.field(2);
        assert_eq!(field.width_in_nodes, 4);
        assert_eq!(field.node_begin, 5);
        assert_eq!(field.node_end, 21);

        // Node addressing round-trips.
        let index = scaffold.node_index(2, [3, 2]).unwrap();
        assert_eq!(scaffold.node_xy(2, index), [3, 2]);
        assert_eq!(scaffold.node_index(2, [-1, 0]), None);
        assert_eq!(scaffold.node_index(2, [4, 0]), None);

        // Payloads are addressable and distinct.
        let node = scaffold.node(index).clone();
        assert!(node.has_payload());
        let bytes = catalog
            .read_slice(
                fid,
                node.payload_offset..node.payload_offset + node.payload_size as u64,
            )
            .unwrap();
        let value = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(value, 223);
    }

    #[test]
    fn test_node_cell_rect_and_transform_agree() {
        let builder = CellFileBuilder::new(2, 4, 0, SampleFormat::R32Float);
        let (catalog, fid) = build_catalog(builder.build());
        let scaffold = CellScaffold::from_catalog(&catalog, fid).unwrap();

        let index = scaffold.node_index(1, [1, 0]).unwrap();
        let (rect_min, rect_max) = scaffold.node_cell_rect(1, index);
        assert_eq!(rect_min, [0.5f32, 0f32]);
        assert_eq!(rect_max, [1f32, 0.5f32]);

        // The stored transform maps the unit square onto the same rect.
        let node = scaffold.node(index);
        let origin = node.local_to_cell.transform_point(&nalgebra::Point3::origin());
        assert!((origin.x - 0.5).abs() < 1e-6);
        assert!((origin.y - 0.0).abs() < 1e-6);
        let corner = node
            .local_to_cell
            .transform_point(&nalgebra::Point3::new(1f32, 1f32, 0f32));
        assert!((corner.x - 1.0).abs() < 1e-6);
        assert!((corner.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_holes_are_preserved() {
        let mut builder = CellFileBuilder::new(1, 2, 0, SampleFormat::R8Unorm);
        // Leave the single node empty.
        let (catalog, fid) = build_catalog(builder.build());
        let scaffold = CellScaffold::from_catalog(&catalog, fid).unwrap();
        assert!(!scaffold.node(0).has_payload());

        builder.set_payload(0, 0, 0, vec![7u8; 4]);
        let (catalog, fid) = build_catalog(builder.build());
        let scaffold = CellScaffold::from_catalog(&catalog, fid).unwrap();
        assert!(scaffold.node(0).has_payload());
    }

    #[test]
    fn test_rejects_truncated_files() {
        let builder = CellFileBuilder::new(2, 4, 0, SampleFormat::R16Uint);
        let mut data = builder.build();
        data[0] ^= 0xFF;
        let (catalog, fid) = build_catalog(data);
        assert!(CellScaffold::from_catalog(&catalog, fid).is_err());
    }
}
