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

// Frustum classification in clip space. Boxes are tested through a combined
// local-to-projection matrix so that the per-node cull works directly on the
// unit cube, without materializing world-space bounds. Depth uses the
// [0, w] convention.

use crate::Aabb;
use nalgebra::{Matrix4, Vector4};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Containment {
    Outside,
    Intersecting,
    Inside,
}

const PLANE_COUNT: usize = 6;

fn outcode(clip: &Vector4<f32>) -> u32 {
    let mut code = 0u32;
    if clip.x < -clip.w {
        code |= 1 << 0;
    }
    if clip.x > clip.w {
        code |= 1 << 1;
    }
    if clip.y < -clip.w {
        code |= 1 << 2;
    }
    if clip.y > clip.w {
        code |= 1 << 3;
    }
    if clip.z < 0f32 {
        code |= 1 << 4;
    }
    if clip.z > clip.w {
        code |= 1 << 5;
    }
    code
}

/// Classify `aabb` (in the matrix's local space) against the frustum.
pub fn classify_aabb(local_to_projection: &Matrix4<f32>, aabb: &Aabb) -> Containment {
    let mut all = u32::MAX;
    let mut any = 0u32;
    for corner in &aabb.corners() {
        let code = outcode(&(local_to_projection * corner.to_homogeneous()));
        all &= code;
        any |= code;
    }
    if all != 0 {
        // Every corner is outside one shared plane.
        return Containment::Outside;
    }
    if any == 0 {
        return Containment::Inside;
    }
    // Corner outcodes cannot prove containment for boxes that straddle a
    // frustum corner; treating those as intersecting is conservative.
    debug_assert!(any.count_ones() <= PLANE_COUNT as u32);
    Containment::Intersecting
}

/// True when the box is provably outside the frustum.
pub fn cull_aabb(local_to_projection: &Matrix4<f32>, aabb: &Aabb) -> bool {
    classify_aabb(local_to_projection, aabb) == Containment::Outside
}

/// The longest edge, in pixels, of the node's base quad after projection.
/// Used to decide LOD refinement; larger on screen means more subdivision.
/// Returns f32::MAX when a corner reaches behind the projection plane so
/// close-up nodes always refine.
pub fn screen_space_edge_length(
    local_to_projection: &Matrix4<f32>,
    viewport_width: f32,
    viewport_height: f32,
) -> f32 {
    let corners = [
        Vector4::new(0f32, 0f32, 0f32, 1f32),
        Vector4::new(1f32, 0f32, 0f32, 1f32),
        Vector4::new(1f32, 1f32, 0f32, 1f32),
        Vector4::new(0f32, 1f32, 0f32, 1f32),
    ];
    let mut projected = [[0f32; 2]; 4];
    for (i, corner) in corners.iter().enumerate() {
        let clip = local_to_projection * corner;
        if clip.w <= 0f32 {
            return f32::MAX;
        }
        projected[i] = [
            clip.x / clip.w * 0.5 * viewport_width,
            clip.y / clip.w * 0.5 * viewport_height,
        ];
    }
    let mut longest = 0f32;
    for i in 0..4 {
        let a = projected[i];
        let b = projected[(i + 1) % 4];
        let d = (a[0] - b[0]).hypot(a[1] - b[1]);
        if d > longest {
            longest = d;
        }
    }
    longest
}
