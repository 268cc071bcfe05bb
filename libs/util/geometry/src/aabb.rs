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
use nalgebra::Point3;

#[derive(Clone, Copy, Debug)]
pub struct Aabb {
    lo: Point3<f32>,
    hi: Point3<f32>,
}

impl Aabb {
    pub fn from_bounds(lo: Point3<f32>, hi: Point3<f32>) -> Self {
        debug_assert!(lo.x <= hi.x && lo.y <= hi.y && lo.z <= hi.z);
        Self { lo, hi }
    }

    /// The unit cube [0,1]^3; node bounds in cell-local space.
    pub fn unit() -> Self {
        Self {
            lo: Point3::origin(),
            hi: Point3::new(1f32, 1f32, 1f32),
        }
    }

    pub fn lo(&self) -> &Point3<f32> {
        &self.lo
    }

    pub fn hi(&self) -> &Point3<f32> {
        &self.hi
    }

    pub fn span(&self, axis: usize) -> f32 {
        self.hi[axis] - self.lo[axis]
    }

    pub fn corners(&self) -> [Point3<f32>; 8] {
        let (l, h) = (self.lo, self.hi);
        [
            Point3::new(l.x, l.y, l.z),
            Point3::new(h.x, l.y, l.z),
            Point3::new(l.x, h.y, l.z),
            Point3::new(h.x, h.y, l.z),
            Point3::new(l.x, l.y, h.z),
            Point3::new(h.x, l.y, h.z),
            Point3::new(l.x, h.y, h.z),
            Point3::new(h.x, h.y, h.z),
        ]
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.lo.x < other.hi.x
            && self.hi.x > other.lo.x
            && self.lo.y < other.hi.y
            && self.hi.y > other.lo.y
            && self.lo.z < other.hi.z
            && self.hi.z > other.lo.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap() {
        let a = Aabb::unit();
        let b = Aabb::from_bounds(Point3::new(0.5, 0.5, 0.5), Point3::new(2., 2., 2.));
        let c = Aabb::from_bounds(Point3::new(1.5, 0., 0.), Point3::new(2., 1., 1.));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
    }
}
