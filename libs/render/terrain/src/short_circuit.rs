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

// Tile refresh dispatches for the short-circuit path: copy a window of the
// edit cache's view into one atlas slot. Height tiles additionally reduce
// the window to a min/max pair, quantize samples against it, and store the
// pair in the tile-info record so reads can decompress. Hardware backends
// ship these as compute kernels under the same names; the software bodies
// here keep the path testable headless.

use anyhow::{bail, ensure, Result};
use gpu::{
    software::{ShaderIo, SoftwareDevice},
    Box2d, ComputeDispatch, ShaderResourceView, UnorderedAccessView,
};
use zerocopy::{AsBytes, FromBytes};

pub const SHADER_TILE_COPY: &str = "tile_short_circuit_copy";
pub const SHADER_HEIGHT_TILE_COPY: &str = "tile_short_circuit_copy_heights";

/// Per-slot record in the tile-info buffer: the decompression range of a
/// height tile.
pub const TILE_INFO_STRIDE: usize = 8;

#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
pub struct TileCopyConstants {
    pub src_min: [u32; 2],
    pub src_max: [u32; 2],
}

pub fn make_refresh_dispatch(
    shader: &str,
    srv: ShaderResourceView,
    src_box: Box2d,
    atlas: UnorderedAccessView,
    layer: u32,
    dst_box: Box2d,
    tile_info: Option<(UnorderedAccessView, u32)>,
) -> ComputeDispatch {
    let constants = TileCopyConstants {
        src_min: src_box.min,
        src_max: src_box.max,
    };
    let atlas_layer = UnorderedAccessView {
        resource: atlas.resource,
        format_override: atlas.format_override,
        layer: Some(layer),
    };
    ComputeDispatch {
        shader: shader.to_owned(),
        constants: constants.as_bytes().to_vec(),
        input: Some((srv, src_box)),
        output: (atlas_layer, dst_box),
        aux: tile_info,
    }
}

pub fn register_software_shaders(device: &SoftwareDevice) {
    device.register_shader(SHADER_TILE_COPY, tile_copy);
    device.register_shader(SHADER_HEIGHT_TILE_COPY, height_tile_copy);
}

fn source_pixel(src: &Box2d, dst: &Box2d, x: u32, y: u32) -> (u32, u32) {
    // Nearest sampling; the source window may be a different size than the
    // destination window when tile and cache resolutions differ.
    let fx = (x - dst.min[0]) as f32 / dst.width() as f32;
    let fy = (y - dst.min[1]) as f32 / dst.height() as f32;
    let sx = src.min[0] + (fx * src.width() as f32) as u32;
    let sy = src.min[1] + (fy * src.height() as f32) as u32;
    (sx.min(src.max[0] - 1), sy.min(src.max[1] - 1))
}

/// Raw same-format copy from the source window into the slot window.
fn tile_copy(io: &mut ShaderIo) -> Result<()> {
    let input = match io.input.as_ref() {
        Some(input) => input,
        None => bail!("tile copy dispatched without a source view"),
    };
    let src = input.rect;
    let dst = io.output.rect;
    ensure!(!src.is_degenerate() && !dst.is_degenerate(), "degenerate copy window");
    let sample_bytes = io.output.sample_bytes() as usize;
    for y in dst.min[1]..dst.max[1] {
        for x in dst.min[0]..dst.max[0] {
            let (sx, sy) = source_pixel(&src, &dst, x, y);
            let value = input.sample(sx, sy).to_vec();
            ensure!(value.len() == sample_bytes, "source format mismatch");
            io.output.sample_mut(x, y).copy_from_slice(&value);
        }
    }
    Ok(())
}

/// Height variant: f32 source samples are reduced to the window's min/max,
/// quantized to u16 against that range, and the range lands in the
/// tile-info record for this slot.
fn height_tile_copy(io: &mut ShaderIo) -> Result<()> {
    let input = match io.input.as_ref() {
        Some(input) => input,
        None => bail!("height tile copy dispatched without a source view"),
    };
    let src = input.rect;
    let dst = io.output.rect;
    ensure!(!src.is_degenerate() && !dst.is_degenerate(), "degenerate copy window");

    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for y in src.min[1]..src.max[1] {
        for x in src.min[0]..src.max[0] {
            let v = input.sample_f32(x, y);
            min = min.min(v);
            max = max.max(v);
        }
    }
    let range = (max - min).max(f32::EPSILON);

    for y in dst.min[1]..dst.max[1] {
        for x in dst.min[0]..dst.max[0] {
            let (sx, sy) = source_pixel(&src, &dst, x, y);
            let v = input.sample_f32(sx, sy);
            let quantized = (((v - min) / range) * u16::MAX as f32) as u16;
            io.output.write_u16(x, y, quantized);
        }
    }

    if let Some(aux) = io.aux.as_mut() {
        let record = aux.record_mut(TILE_INFO_STRIDE);
        record[0..4].copy_from_slice(&min.to_le_bytes());
        record[4..8].copy_from_slice(&max.to_le_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu::{BindFlags, CommandContext, Device, ResourceDesc, SampleFormat, SubResource};

    #[test]
    fn test_height_copy_quantizes_and_records_range() {
        let device = SoftwareDevice::new();
        register_software_shaders(&device);

        let cache = device
            .create_resource(&ResourceDesc::texture_2d(
                8,
                8,
                SampleFormat::R32Float,
                BindFlags::SHADER_RESOURCE,
                "cache",
            ))
            .unwrap();
        let atlas = device
            .create_resource(&ResourceDesc::texture_2d_array(
                8,
                8,
                2,
                SampleFormat::R16Uint,
                BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS,
                "atlas",
            ))
            .unwrap();
        let info = device
            .create_resource(&ResourceDesc::linear_buffer(
                4 * TILE_INFO_STRIDE as u64,
                BindFlags::UNORDERED_ACCESS,
                "info",
            ))
            .unwrap();

        // Seed the cache with a gradient 0..64.
        let mut seed = Vec::new();
        for y in 0..8u32 {
            for x in 0..8u32 {
                seed.extend_from_slice(&((y * 8 + x) as f32).to_le_bytes());
            }
        }
        let mut ctx = device.begin_commands();
        ctx.copy_bytes_to_resource(cache.clone(), SubResource::base(), None, 32, seed);
        ctx.dispatch(make_refresh_dispatch(
            SHADER_HEIGHT_TILE_COPY,
            ShaderResourceView {
                resource: cache.clone(),
                format_override: None,
                layer: None,
            },
            Box2d::new([0, 0], [8, 8]),
            UnorderedAccessView {
                resource: atlas.clone(),
                format_override: None,
                layer: None,
            },
            1,
            Box2d::new([0, 0], [8, 8]),
            Some((
                UnorderedAccessView {
                    resource: info.clone(),
                    format_override: None,
                    layer: None,
                },
                2,
            )),
        ));
        device.submit(ctx);

        let layer = device.read_back(&atlas, SubResource::layer(1)).unwrap();
        let sample = |x: usize, y: usize| u16::from_le_bytes([layer[(y * 8 + x) * 2], layer[(y * 8 + x) * 2 + 1]]);
        assert_eq!(sample(0, 0), 0);
        assert_eq!(sample(7, 7), u16::MAX);
        assert!(sample(4, 4) > sample(1, 1));

        let info_bytes = device.read_back(&info, SubResource::base()).unwrap();
        let record = &info_bytes[2 * TILE_INFO_STRIDE..3 * TILE_INFO_STRIDE];
        let min = f32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let max = f32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        assert_eq!(min, 0f32);
        assert_eq!(max, 63f32);
    }

    #[test]
    fn test_tile_copy_scales_between_windows() {
        let device = SoftwareDevice::new();
        register_software_shaders(&device);
        let src = device
            .create_resource(&ResourceDesc::texture_2d(
                4,
                4,
                SampleFormat::R8Unorm,
                BindFlags::SHADER_RESOURCE,
                "src",
            ))
            .unwrap();
        let dst = device
            .create_resource(&ResourceDesc::texture_2d_array(
                8,
                8,
                1,
                SampleFormat::R8Unorm,
                BindFlags::UNORDERED_ACCESS,
                "dst",
            ))
            .unwrap();
        let mut ctx = device.begin_commands();
        ctx.copy_bytes_to_resource(
            src.clone(),
            SubResource::base(),
            None,
            4,
            (0u8..16).collect(),
        );
        ctx.dispatch(make_refresh_dispatch(
            SHADER_TILE_COPY,
            ShaderResourceView {
                resource: src.clone(),
                format_override: None,
                layer: None,
            },
            Box2d::new([0, 0], [4, 4]),
            UnorderedAccessView {
                resource: dst.clone(),
                format_override: None,
                layer: None,
            },
            0,
            Box2d::new([0, 0], [8, 8]),
            None,
        ));
        device.submit(ctx);
        let bytes = device.read_back(&dst, SubResource::base()).unwrap();
        // 2x upscale: each source pixel appears in a 2x2 block.
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[1], 0);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[8], 0);
        assert_eq!(bytes[8 * 7 + 7], 15);
    }
}
