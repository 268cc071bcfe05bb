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

// Small allocation helpers shared by the resource caches. Both structures
// are fixed capacity and index based so that callers can store plain u32
// handles instead of pointers.

mod bit_heap;
mod lru_queue;

pub use bit_heap::BitHeap;
pub use lru_queue::LruQueue;
