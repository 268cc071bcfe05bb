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

/// Feedback channel for long write-back operations (saving edits touches
/// every intersecting cell file).
pub trait Progress {
    fn begin_phase(&mut self, name: &str, step_count: usize);
    fn advance(&mut self);
}

pub struct NullProgress;

impl Progress for NullProgress {
    fn begin_phase(&mut self, _name: &str, _step_count: usize) {}
    fn advance(&mut self) {}
}
