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

// The authoritative side of terrain content: a memory-mapped 2D sample
// store (the "uber surface"), a bounded GPU working cache for interactive
// edits, and the short-circuit bridge that forwards those edits into the
// live tile cache without a disk round trip.

mod bridge;
mod editor;
mod progress;
mod store;
pub mod tools;

pub use crate::{
    bridge::{
        CellRegion, ResolvedUpdate, ShortCircuitBridge, ShortCircuitSource, ShortCircuitUpdate,
        WriteBackFn,
    },
    editor::{EditorConfig, SurfaceEditor, ToolConstants, ToolResult},
    progress::{NullProgress, Progress},
    store::UberSurface,
};
