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

// The per-frame LOD decision. Cells seed the context with their coarsest
// field's unculled nodes; the promote pass then splits any node whose
// projected edge length exceeds the threshold into its four children,
// repairing neighbor references as it goes. Neighbors are tracked per
// half-edge (two references per side), which is exactly enough to express
// the one-LOD-step constraint: a node's neighbor is either one node of the
// same size, or the two half-size nodes sharing that edge.

use crate::scaffold::CellScaffold;
use geometry::{classify_aabb, screen_space_edge_length, Aabb, Containment};
use nalgebra::{Matrix4, Vector3};
use std::sync::Arc;

pub const MAX_LOD_LEVELS: usize = 8;

/// Neighbor reference slots, clockwise pairs per edge.
pub mod neighbours {
    pub const TOP_EDGE_LEFT: usize = 0;
    pub const TOP_EDGE_RIGHT: usize = 1;
    pub const RIGHT_EDGE_TOP: usize = 2;
    pub const RIGHT_EDGE_BOTTOM: usize = 3;
    pub const BOTTOM_EDGE_RIGHT: usize = 4;
    pub const BOTTOM_EDGE_LEFT: usize = 5;
    pub const LEFT_EDGE_BOTTOM: usize = 6;
    pub const LEFT_EDGE_TOP: usize = 7;
    pub const COUNT: usize = 8;

    /// The slot on the adjacent node that points back at us.
    pub const MIRROR: [usize; COUNT] = [
        BOTTOM_EDGE_LEFT,
        BOTTOM_EDGE_RIGHT,
        LEFT_EDGE_TOP,
        LEFT_EDGE_BOTTOM,
        TOP_EDGE_RIGHT,
        TOP_EDGE_LEFT,
        RIGHT_EDGE_BOTTOM,
        RIGHT_EDGE_TOP,
    ];

    /// Which child of a split node touches each neighbor slot. Children
    /// are indexed (0,0) (1,0) (0,1) (1,1).
    pub const ATTACH_CHILD: [usize; COUNT] = [0, 1, 1, 3, 3, 2, 2, 0];
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeId {
    pub lod_field: u32,
    pub node_index: u32,
    pub cell_slot: u32,
}

impl NodeId {
    pub const NONE: NodeId = NodeId {
        lod_field: u32::MAX,
        node_index: u32::MAX,
        cell_slot: u32::MAX,
    };

    pub fn new(lod_field: u32, node_index: u32, cell_slot: u32) -> Self {
        Self {
            lod_field,
            node_index,
            cell_slot,
        }
    }

    pub fn is_none(&self) -> bool {
        self.node_index == u32::MAX
    }
}

#[derive(Clone, Debug)]
pub struct CollapseNode {
    pub id: NodeId,
    pub neighbours: [NodeId; neighbours::COUNT],
    pub screen_space_edge_length: f32,
    pub entirely_within_frustum: bool,
    pub lod_promoted: bool,
}

impl CollapseNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            neighbours: [NodeId::NONE; neighbours::COUNT],
            screen_space_edge_length: 0f32,
            entirely_within_frustum: false,
            lod_promoted: false,
        }
    }

    /// The per-edge LOD difference against our neighbors, clamped to one
    /// step. Order: top, right, bottom, left.
    pub fn neighbour_lod_diffs(&self) -> [i8; 4] {
        let mut diffs = [0i8; 4];
        for edge in 0..4 {
            let n0 = &self.neighbours[edge * 2];
            let n1 = &self.neighbours[edge * 2 + 1];
            let mut diff = 0i64;
            if !n0.is_none() {
                diff = n0.lod_field as i64 - self.id.lod_field as i64;
            }
            if !n1.is_none() {
                let other = n1.lod_field as i64 - self.id.lod_field as i64;
                if n0.is_none() || other.abs() > diff.abs() {
                    diff = other;
                }
            }
            diffs[edge] = diff.clamp(-1, 1) as i8;
        }
        diffs
    }
}

/// Per-cell data registered for one frame's collapse.
pub struct CollapseCell {
    pub hash: u64,
    pub scaffold: Arc<CellScaffold>,
    pub cell_to_world: Matrix4<f32>,
    pub cell_to_projection: Matrix4<f32>,
    pub view_position: Vector3<f32>,
}

pub struct CollapseContext {
    pub start_lod: usize,
    pub screen_edge_threshold: f32,
    pub viewport: [f32; 2],
    pub active_nodes: Vec<Vec<CollapseNode>>,
    pub cells: Vec<CollapseCell>,
}

impl CollapseContext {
    pub fn new(start_lod: usize, screen_edge_threshold: f32, viewport: [f32; 2]) -> Self {
        Self {
            start_lod,
            screen_edge_threshold,
            viewport,
            active_nodes: (0..MAX_LOD_LEVELS).map(|_| Vec::new()).collect(),
            cells: Vec::new(),
        }
    }

    pub fn add_cell(&mut self, cell: CollapseCell) -> u32 {
        self.cells.push(cell);
        self.cells.len() as u32 - 1
    }

    pub fn add_node(&mut self, node: CollapseNode) {
        self.active_nodes[node.id.lod_field as usize].push(node);
    }

    /// All surviving (un-promoted) nodes, coarse levels first.
    pub fn surviving_nodes(&self) -> impl Iterator<Item = &CollapseNode> {
        self.active_nodes
            .iter()
            .flatten()
            .filter(|node| !node.lod_promoted)
    }

    /// Seed the context with one cell's nodes at the starting LOD. Nodes
    /// without payload (holes) and culled nodes are skipped; neighbor
    /// references are wired between surviving same-field nodes.
    pub fn seed_cell(&mut self, cell_slot: u32) {
        let cell = &self.cells[cell_slot as usize];
        let scaffold = cell.scaffold.clone();
        let cell_to_projection = cell.cell_to_projection;
        let lod = self.start_lod.min(scaffold.field_count() - 1);
        let field = *scaffold.field(lod);
        let node_span = (field.node_end - field.node_begin) as usize;

        let mut cull_results = vec![Containment::Outside; node_span];
        let mut edge_lengths = vec![f32::MAX; node_span];
        for offset in 0..node_span {
            let node_index = field.node_begin + offset as u32;
            let desc = scaffold.node(node_index);
            if !desc.has_payload() {
                continue;
            }
            let local_to_projection = cell_to_projection * desc.local_to_cell;
            let containment = classify_aabb(&local_to_projection, &Aabb::unit());
            cull_results[offset] = containment;
            if containment != Containment::Outside {
                edge_lengths[offset] = if lod + 1 < scaffold.field_count() {
                    screen_space_edge_length(
                        &local_to_projection,
                        self.viewport[0],
                        self.viewport[1],
                    )
                } else {
                    f32::MAX
                };
            }
        }

        for offset in 0..node_span {
            if cull_results[offset] == Containment::Outside {
                continue;
            }
            let node_index = field.node_begin + offset as u32;
            let id = NodeId::new(lod as u32, node_index, cell_slot);
            let mut node = CollapseNode::new(id);
            node.entirely_within_frustum = cull_results[offset] == Containment::Inside;
            node.screen_space_edge_length = edge_lengths[offset];

            // Neighbors within this cell's field; cross-cell references
            // stay empty.
            let xy = scaffold.node_xy(lod, node_index);
            let mut wire = |dir: [i32; 2], slots: [usize; 2], node: &mut CollapseNode| {
                if let Some(adjacent) = scaffold.node_index(lod, [xy[0] + dir[0], xy[1] + dir[1]]) {
                    let adjacent_offset = (adjacent - field.node_begin) as usize;
                    if cull_results[adjacent_offset] != Containment::Outside {
                        let adjacent_id = NodeId::new(lod as u32, adjacent, cell_slot);
                        node.neighbours[slots[0]] = adjacent_id;
                        node.neighbours[slots[1]] = adjacent_id;
                    }
                }
            };
            wire(
                [0, -1],
                [neighbours::TOP_EDGE_LEFT, neighbours::TOP_EDGE_RIGHT],
                &mut node,
            );
            wire(
                [1, 0],
                [neighbours::RIGHT_EDGE_TOP, neighbours::RIGHT_EDGE_BOTTOM],
                &mut node,
            );
            wire(
                [0, 1],
                [neighbours::BOTTOM_EDGE_RIGHT, neighbours::BOTTOM_EDGE_LEFT],
                &mut node,
            );
            wire(
                [-1, 0],
                [neighbours::LEFT_EDGE_BOTTOM, neighbours::LEFT_EDGE_TOP],
                &mut node,
            );
            self.add_node(node);
        }
    }

    /// Run the promote pass over every level, coarse to fine.
    pub fn collapse(&mut self) {
        for lod in self.start_lod..MAX_LOD_LEVELS - 1 {
            self.attempt_lod_promote(lod);
            if self.active_nodes[lod + 1].is_empty() {
                break;
            }
        }
    }

    /// Split any node of `start_lod` whose projected edge exceeds the
    /// threshold, provided all its neighbors are at this LOD or finer (a
    /// coarser neighbor would end up more than one step away).
    fn attempt_lod_promote(&mut self, start_lod: usize) {
        debug_assert!(self.active_nodes[start_lod + 1].is_empty());
        let mut collapsed_field: Vec<CollapseNode> = Vec::new();

        for node_at in 0..self.active_nodes[start_lod].len() {
            let snapshot = self.active_nodes[start_lod][node_at].clone();
            let cell_slot = snapshot.id.cell_slot as usize;
            let scaffold = self.cells[cell_slot].scaffold.clone();
            if scaffold.field_count() <= start_lod + 1 {
                continue;
            }

            let do_collapse = snapshot.screen_space_edge_length > self.screen_edge_threshold
                // A missing neighbor reads as "no constraint".
                && snapshot.neighbours[neighbours::TOP_EDGE_LEFT].lod_field >= start_lod as u32
                && snapshot.neighbours[neighbours::RIGHT_EDGE_TOP].lod_field >= start_lod as u32
                && snapshot.neighbours[neighbours::BOTTOM_EDGE_RIGHT].lod_field >= start_lod as u32
                && snapshot.neighbours[neighbours::LEFT_EDGE_BOTTOM].lod_field >= start_lod as u32;
            if !do_collapse {
                continue;
            }

            self.active_nodes[start_lod][node_at].lod_promoted = true;

            let child_lod = start_lod + 1;
            let child_field = child_lod as u32;
            let base_xy = scaffold.node_xy(start_lod, snapshot.id.node_index);
            let child_offsets = [[0, 0], [1, 0], [0, 1], [1, 1]];
            let mut new_nodes: [CollapseNode; 4] = [
                CollapseNode::new(NodeId::NONE),
                CollapseNode::new(NodeId::NONE),
                CollapseNode::new(NodeId::NONE),
                CollapseNode::new(NodeId::NONE),
            ];
            for (c, offset) in child_offsets.iter().enumerate() {
                let child_xy = [base_xy[0] * 2 + offset[0], base_xy[1] * 2 + offset[1]];
                let child_index = match scaffold.node_index(child_lod, child_xy) {
                    Some(index) => index,
                    None => continue,
                };
                let desc = scaffold.node(child_index);
                if !desc.has_payload() {
                    continue;
                }
                let mut child = CollapseNode::new(NodeId::new(
                    child_field,
                    child_index,
                    snapshot.id.cell_slot,
                ));
                let local_to_projection =
                    self.cells[cell_slot].cell_to_projection * desc.local_to_cell;
                if snapshot.entirely_within_frustum {
                    // The parent is inside, so every child is too.
                    child.entirely_within_frustum = true;
                } else {
                    match classify_aabb(&local_to_projection, &Aabb::unit()) {
                        Containment::Outside => continue,
                        Containment::Inside => child.entirely_within_frustum = true,
                        Containment::Intersecting => child.entirely_within_frustum = false,
                    }
                }
                child.screen_space_edge_length = if child_lod + 1 < scaffold.field_count() {
                    screen_space_edge_length(
                        &local_to_projection,
                        self.viewport[0],
                        self.viewport[1],
                    )
                } else {
                    f32::MAX
                };
                new_nodes[c] = child;
            }

            // Internal references among the four children.
            use neighbours::*;
            let ids = [
                new_nodes[0].id,
                new_nodes[1].id,
                new_nodes[2].id,
                new_nodes[3].id,
            ];
            new_nodes[0].neighbours[RIGHT_EDGE_TOP] = ids[1];
            new_nodes[0].neighbours[RIGHT_EDGE_BOTTOM] = ids[1];
            new_nodes[0].neighbours[BOTTOM_EDGE_LEFT] = ids[2];
            new_nodes[0].neighbours[BOTTOM_EDGE_RIGHT] = ids[2];
            new_nodes[1].neighbours[LEFT_EDGE_TOP] = ids[0];
            new_nodes[1].neighbours[LEFT_EDGE_BOTTOM] = ids[0];
            new_nodes[1].neighbours[BOTTOM_EDGE_LEFT] = ids[3];
            new_nodes[1].neighbours[BOTTOM_EDGE_RIGHT] = ids[3];
            new_nodes[2].neighbours[RIGHT_EDGE_TOP] = ids[3];
            new_nodes[2].neighbours[RIGHT_EDGE_BOTTOM] = ids[3];
            new_nodes[2].neighbours[TOP_EDGE_LEFT] = ids[0];
            new_nodes[2].neighbours[TOP_EDGE_RIGHT] = ids[0];
            new_nodes[3].neighbours[LEFT_EDGE_TOP] = ids[2];
            new_nodes[3].neighbours[LEFT_EDGE_BOTTOM] = ids[2];
            new_nodes[3].neighbours[TOP_EDGE_LEFT] = ids[1];
            new_nodes[3].neighbours[TOP_EDGE_RIGHT] = ids[1];

            // External references inherited from the parent's half-edges.
            new_nodes[0].neighbours[TOP_EDGE_LEFT] = snapshot.neighbours[TOP_EDGE_LEFT];
            new_nodes[0].neighbours[TOP_EDGE_RIGHT] = snapshot.neighbours[TOP_EDGE_LEFT];
            new_nodes[0].neighbours[LEFT_EDGE_TOP] = snapshot.neighbours[LEFT_EDGE_TOP];
            new_nodes[0].neighbours[LEFT_EDGE_BOTTOM] = snapshot.neighbours[LEFT_EDGE_TOP];
            new_nodes[1].neighbours[TOP_EDGE_LEFT] = snapshot.neighbours[TOP_EDGE_RIGHT];
            new_nodes[1].neighbours[TOP_EDGE_RIGHT] = snapshot.neighbours[TOP_EDGE_RIGHT];
            new_nodes[1].neighbours[RIGHT_EDGE_TOP] = snapshot.neighbours[RIGHT_EDGE_TOP];
            new_nodes[1].neighbours[RIGHT_EDGE_BOTTOM] = snapshot.neighbours[RIGHT_EDGE_TOP];
            new_nodes[2].neighbours[BOTTOM_EDGE_LEFT] = snapshot.neighbours[BOTTOM_EDGE_LEFT];
            new_nodes[2].neighbours[BOTTOM_EDGE_RIGHT] = snapshot.neighbours[BOTTOM_EDGE_LEFT];
            new_nodes[2].neighbours[LEFT_EDGE_TOP] = snapshot.neighbours[LEFT_EDGE_BOTTOM];
            new_nodes[2].neighbours[LEFT_EDGE_BOTTOM] = snapshot.neighbours[LEFT_EDGE_BOTTOM];
            new_nodes[3].neighbours[RIGHT_EDGE_TOP] = snapshot.neighbours[RIGHT_EDGE_BOTTOM];
            new_nodes[3].neighbours[RIGHT_EDGE_BOTTOM] = snapshot.neighbours[RIGHT_EDGE_BOTTOM];
            new_nodes[3].neighbours[BOTTOM_EDGE_LEFT] = snapshot.neighbours[BOTTOM_EDGE_RIGHT];
            new_nodes[3].neighbours[BOTTOM_EDGE_RIGHT] = snapshot.neighbours[BOTTOM_EDGE_RIGHT];

            for child in new_nodes.iter() {
                if !child.id.is_none() {
                    collapsed_field.push(child.clone());
                }
            }

            // Repair the adjacent nodes' references to the vanished parent.
            // An uncollapsed adjacent updates the single half-edge that
            // pointed at us; a collapsed one carries two references for
            // this edge and both now point at the attaching child.
            for c in 0..COUNT {
                let target = snapshot.neighbours[c];
                let replacement = new_nodes[ATTACH_CHILD[c]].id;
                let adjacent = find_neighbour_mut(
                    &mut self.active_nodes,
                    &mut collapsed_field,
                    (start_lod + 1) as u32,
                    target,
                );
                if let Some(adjacent) = adjacent {
                    if adjacent.id.lod_field as usize == start_lod {
                        adjacent.neighbours[MIRROR[c]] = replacement;
                    } else {
                        let n0 = MIRROR[c] & !1;
                        adjacent.neighbours[n0] = replacement;
                        adjacent.neighbours[n0 + 1] = replacement;
                    }
                }
            }
        }

        self.active_nodes[start_lod + 1] = collapsed_field;
    }
}

fn find_neighbour_mut<'a>(
    active_nodes: &'a mut [Vec<CollapseNode>],
    working_field: &'a mut Vec<CollapseNode>,
    working_lod: u32,
    id: NodeId,
) -> Option<&'a mut CollapseNode> {
    if id.is_none() {
        return None;
    }
    let field = if id.lod_field == working_lod {
        working_field
    } else {
        &mut active_nodes[id.lod_field as usize]
    };
    field.iter_mut().find(|node| node.id == id)
}
