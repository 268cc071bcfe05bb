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

// Standard edit tool shaders, as software bodies for the headless backend.
// A hardware backend ships the same tool set as compute kernels keyed by
// the same names; the dispatch contract is identical: constants start with
// `ToolConstants`, coordinates in the ShaderIo are cache-local pixels, and
// `cache_min` maps them back to uber coordinates.

use crate::editor::ToolConstants;
use anyhow::{ensure, Result};
use gpu::software::{ShaderIo, SoftwareDevice};
use std::mem;
use zerocopy::FromBytes;

pub const SHADER_SET_VALUE: &str = "surface_tool_set_value";
pub const SHADER_RAISE: &str = "surface_tool_raise";
pub const SHADER_SMOOTH: &str = "surface_tool_smooth";

pub fn register_software_tools(device: &SoftwareDevice) {
    device.register_shader(SHADER_SET_VALUE, set_value);
    device.register_shader(SHADER_RAISE, raise);
    device.register_shader(SHADER_SMOOTH, smooth);
}

fn unpack_constants(io: &ShaderIo) -> Result<ToolConstants> {
    ensure!(
        io.constants.len() >= mem::size_of::<ToolConstants>(),
        "tool dispatch without ToolConstants"
    );
    Ok(ToolConstants::read_from_prefix(io.constants).expect("length checked above"))
}

// Distance falloff shared by the brush-shaped tools: 1 at the center,
// 0 at the radius. A non-positive radius means "no falloff".
fn falloff(constants: &ToolConstants, ux: f32, uy: f32) -> f32 {
    if constants.radius <= 0f32 {
        return 1f32;
    }
    let dx = ux - constants.center[0];
    let dy = uy - constants.center[1];
    let dist = (dx * dx + dy * dy).sqrt();
    (1f32 - dist / constants.radius).max(0f32)
}

/// Overwrite every sample in the adjusted box (inside the brush radius,
/// when one is set) with `strength`.
fn set_value(io: &mut ShaderIo) -> Result<()> {
    let constants = unpack_constants(io)?;
    let rect = io.output.rect;
    for y in rect.min[1]..rect.max[1] {
        for x in rect.min[0]..rect.max[0] {
            let ux = (constants.cache_min[0] + x) as f32;
            let uy = (constants.cache_min[1] + y) as f32;
            if falloff(&constants, ux, uy) > 0f32 {
                match io.output.sample_bytes() {
                    4 => io.output.write_f32(x, y, constants.strength),
                    1 => io.output.sample_mut(x, y)[0] = constants.strength as u8,
                    _ => io.output.write_u16(x, y, constants.strength as u16),
                }
            }
        }
    }
    Ok(())
}

/// Add `strength`, scaled by brush falloff, to every covered sample.
fn raise(io: &mut ShaderIo) -> Result<()> {
    let constants = unpack_constants(io)?;
    let rect = io.output.rect;
    for y in rect.min[1]..rect.max[1] {
        for x in rect.min[0]..rect.max[0] {
            let ux = (constants.cache_min[0] + x) as f32;
            let uy = (constants.cache_min[1] + y) as f32;
            let weight = falloff(&constants, ux, uy);
            if weight > 0f32 {
                let current = io.output.sample_f32(x, y);
                io.output
                    .write_f32(x, y, current + constants.strength * weight);
            }
        }
    }
    Ok(())
}

/// 3x3 box blur from the input snapshot, blended by brush falloff.
fn smooth(io: &mut ShaderIo) -> Result<()> {
    let constants = unpack_constants(io)?;
    let input = match io.input.as_ref() {
        Some(input) => input,
        None => anyhow::bail!("smooth tool needs its input snapshot bound"),
    };
    let rect = io.output.rect;
    for y in rect.min[1]..rect.max[1] {
        for x in rect.min[0]..rect.max[0] {
            let ux = (constants.cache_min[0] + x) as f32;
            let uy = (constants.cache_min[1] + y) as f32;
            let weight = falloff(&constants, ux, uy) * constants.strength.clamp(0f32, 1f32);
            if weight <= 0f32 {
                continue;
            }
            let mut total = 0f32;
            let mut count = 0f32;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let sx = x as i64 + dx;
                    let sy = y as i64 + dy;
                    if sx < 0
                        || sy < 0
                        || sx >= input.width() as i64
                        || sy >= input.height() as i64
                    {
                        continue;
                    }
                    total += input.sample_f32(sx as u32, sy as u32);
                    count += 1f32;
                }
            }
            let blurred = total / count;
            let current = input.sample_f32(x, y);
            io.output
                .write_f32(x, y, current + (blurred - current) * weight);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu::{
        Box2d, CommandContext, ComputeDispatch, Device, ResourceDesc, SampleFormat,
        ShaderResourceView, SubResource, UnorderedAccessView,
    };
    use zerocopy::AsBytes;

    fn dispatch_tool(
        shader: &str,
        constants: ToolConstants,
        seed: impl Fn(u32, u32) -> f32,
        extent: u32,
    ) -> Vec<f32> {
        let device = SoftwareDevice::new();
        register_software_tools(&device);
        let desc = ResourceDesc::texture_2d(
            extent,
            extent,
            SampleFormat::R32Float,
            gpu::BindFlags::SHADER_RESOURCE | gpu::BindFlags::UNORDERED_ACCESS,
            "tool-test",
        );
        let res = device.create_resource(&desc).unwrap();
        let mut seed_bytes = Vec::new();
        for y in 0..extent {
            for x in 0..extent {
                seed_bytes.extend_from_slice(&seed(x, y).to_le_bytes());
            }
        }
        let mut ctx = device.begin_commands();
        ctx.copy_bytes_to_resource(
            res.clone(),
            SubResource::base(),
            None,
            extent * 4,
            seed_bytes,
        );
        ctx.dispatch(ComputeDispatch {
            shader: shader.to_owned(),
            constants: constants.as_bytes().to_vec(),
            input: Some((
                ShaderResourceView {
                    resource: res.clone(),
                    format_override: None,
                    layer: None,
                },
                Box2d::new([0, 0], [extent, extent]),
            )),
            output: (
                UnorderedAccessView {
                    resource: res.clone(),
                    format_override: None,
                    layer: None,
                },
                Box2d::new(constants.adj_min, constants.adj_max),
            ),
            aux: None,
        });
        device.submit(ctx);
        let bytes = device.read_back(&res, SubResource::base()).unwrap();
        bytes
            .chunks(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn constants(adj_min: [u32; 2], adj_max: [u32; 2], radius: f32, strength: f32) -> ToolConstants {
        ToolConstants {
            center: [8f32, 8f32],
            radius,
            strength,
            cache_min: [0, 0],
            cache_max: [16, 16],
            adj_min,
            adj_max,
        }
    }

    #[test]
    fn test_set_value_fills_box() {
        let samples = dispatch_tool(
            SHADER_SET_VALUE,
            constants([4, 4], [12, 12], 0f32, 42f32),
            |_, _| 0f32,
            16,
        );
        assert_eq!(samples[5 * 16 + 5], 42f32);
        assert_eq!(samples[0], 0f32);
        assert_eq!(samples[12 * 16 + 12], 0f32);
    }

    #[test]
    fn test_raise_respects_falloff() {
        let samples = dispatch_tool(
            SHADER_RAISE,
            ToolConstants {
                center: [8f32, 8f32],
                radius: 6f32,
                strength: 10f32,
                cache_min: [0, 0],
                cache_max: [16, 16],
                adj_min: [0, 0],
                adj_max: [16, 16],
            },
            |_, _| 0f32,
            16,
        );
        let center = samples[8 * 16 + 8];
        let edge = samples[8 * 16 + 12];
        assert!(center > edge);
        assert!(edge > 0f32);
        assert_eq!(samples[0], 0f32);
    }

    #[test]
    fn test_smooth_pulls_toward_neighborhood() {
        let samples = dispatch_tool(
            SHADER_SMOOTH,
            ToolConstants {
                center: [8f32, 8f32],
                radius: 0f32,
                strength: 1f32,
                cache_min: [0, 0],
                cache_max: [16, 16],
                adj_min: [7, 7],
                adj_max: [10, 10],
            },
            |x, y| if x == 8 && y == 8 { 9f32 } else { 0f32 },
            16,
        );
        let center = samples[8 * 16 + 8];
        assert!(center < 9f32);
        assert!(center > 0f32);
    }
}
