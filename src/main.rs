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

// Headless streaming demo: builds a synthetic world, flies a camera over
// it against the software device, edits the surface mid-flight through
// the short-circuit path, and saves the edit back to disk. Useful for
// watching the whole pipeline breathe without a GPU attached.

use anyhow::Result;
use catalog::{Catalog, MemoryDrawer};
use gpu::{
    software::SoftwareDevice, Device, PoolConfig, ResourcePool, SampleFormat, UploadConfig,
    UploadQueue,
};
use log::info;
use nalgebra::{Matrix4, Perspective3, Vector3};
use std::sync::Arc;
use structopt::StructOpt;
use terrain::{
    CellFileBuilder, CellId, LayerKind, TerrainCellRenderer, TerrainConfig, ViewContext,
};
use uber_surface::{
    EditorConfig, NullProgress, ShortCircuitBridge, SurfaceEditor, ToolResult, UberSurface,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "loess", about = "Headless terrain streaming demo.")]
struct Opt {
    /// Number of frames to simulate.
    #[structopt(long, default_value = "240")]
    frames: u64,

    /// Uber-surface edge length in samples.
    #[structopt(long, default_value = "128")]
    surface_size: u32,

    /// Quadtree depth of the synthetic cell.
    #[structopt(long, default_value = "4")]
    field_count: u32,
}

const ELEMENT: u32 = 8;
const CELL_HASH: u64 = 0x6c6f_6573_7300_0001;

fn build_world(field_count: u32) -> Result<Arc<Catalog>> {
    let mut builder = CellFileBuilder::new(field_count, ELEMENT, 1, SampleFormat::R16Uint);
    builder.fill_payloads(|field, x, y| {
        // A deterministic ridge pattern, finer per field.
        let mut data = Vec::with_capacity((ELEMENT * ELEMENT * 2) as usize);
        for sy in 0..ELEMENT {
            for sx in 0..ELEMENT {
                let h = ((x * ELEMENT + sx) ^ (y * ELEMENT + sy)) as u16 * (field as u16 + 1);
                data.extend_from_slice(&h.to_le_bytes());
            }
        }
        data
    });
    let mut drawer = MemoryDrawer::new("demo-world", 0);
    drawer.add_file("demo-cell.heights", builder.build());
    Ok(Arc::new(Catalog::with_drawers(vec![Box::new(drawer)])?))
}

fn projection() -> Matrix4<f32> {
    let depth_fix = Matrix4::new_nonuniform_scaling(&Vector3::new(1f32, 1f32, 0.5))
        .append_translation(&Vector3::new(0f32, 0f32, 0.5));
    depth_fix
        * Perspective3::new(16f32 / 9f32, std::f32::consts::FRAC_PI_2, 0.1, 10_000f32).as_matrix()
}

fn view_for_frame(frame: u64, total: u64) -> ViewContext {
    // Swoop from far out down toward the surface and back.
    let t = frame as f32 / total.max(1) as f32;
    let distance = 6f32 - 5.2f32 * (t * std::f32::consts::PI).sin();
    ViewContext {
        world_to_projection: projection()
            * Matrix4::new_translation(&Vector3::new(0f32, 0f32, -distance)),
        view_position: [0f32, 0f32, distance],
        viewport: [1920, 1080],
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let catalog = build_world(opt.field_count)?;
    let device = SoftwareDevice::new();
    terrain::register_software_shaders(&device);
    uber_surface::tools::register_software_tools(&device);
    let device_dyn: Arc<dyn Device> = device.clone();
    let pool = ResourcePool::new(PoolConfig::default());
    let uploads = UploadQueue::new(device_dyn, pool, UploadConfig::default());

    let mut renderer = TerrainCellRenderer::new(
        TerrainConfig {
            heights_element_size: ELEMENT,
            screen_edge_threshold: 256f32,
            ..TerrainConfig::default()
        },
        catalog,
        uploads.clone(),
    )?;

    // The editable authority behind the cell.
    let dir = tempfile::tempdir()?;
    let surface_path = dir.path().join("demo.uber");
    UberSurface::create_empty(
        &surface_path,
        opt.surface_size,
        opt.surface_size,
        SampleFormat::R32Float,
        1,
    )?;
    let surface = UberSurface::open(&surface_path)?;
    let bridge = Arc::new(ShortCircuitBridge::new());
    bridge.register_cell(
        CELL_HASH,
        [0, 0],
        [opt.surface_size, opt.surface_size],
        Box::new(|_, _, _| Ok(())),
    )?;
    let editor = SurfaceEditor::new(
        surface,
        uploads.clone(),
        bridge.clone(),
        EditorConfig::default(),
    );
    editor.bind_to_bridge();
    renderer.attach_bridge(LayerKind::Heights, bridge);

    let cells = vec![CellId {
        hash: CELL_HASH,
        cell_to_world: Matrix4::new_translation(&Vector3::new(-0.5f32, -0.5f32, 0f32)),
        aabb_min: [-0.5f32, -0.5f32, 0f32],
        aabb_max: [0.5f32, 0.5f32, 1f32],
        heights_file: "demo-cell.heights".to_owned(),
        coverage_files: Vec::new(),
    }];

    let mut drawn_total = 0usize;
    for frame in 0..opt.frames {
        let view = view_for_frame(frame, opt.frames);
        let stats = renderer.frame(frame, &view, &cells);

        let mut drawn = 0usize;
        renderer.render(&mut |_record| drawn += 1);
        drawn_total += drawn;

        if frame == opt.frames / 2 {
            // Raise a hill through the short-circuit path.
            let center = opt.surface_size / 2;
            let min = [center - center / 2, center - center / 2];
            let max = [center + center / 2, center + center / 2];
            editor.prepare_cache(min, max)?;
            let result = editor.apply_tool(
                min,
                max,
                uber_surface::tools::SHADER_RAISE,
                [center as f32, center as f32],
                center as f32 / 2f32,
                25f32,
                &[],
            );
            info!("frame {}: edit applied: {:?}", frame, result);
            assert_eq!(result, ToolResult::Success);
        }
        if frame == opt.frames * 3 / 4 {
            editor.flush_lock_to_disk(&mut NullProgress)?;
            info!("frame {}: edit flushed to {:?}", frame, surface_path);
        }

        if frame % 30 == 0 {
            info!(
                "frame {:>4}: drew {:>3} nodes, {} queued, {} started, {} completed, sc {}/{}",
                frame,
                drawn,
                stats.nodes_queued,
                stats.uploads_started,
                stats.uploads_completed,
                stats.abandons_applied,
                stats.updates_applied,
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    uploads.flush();
    let flushed = UberSurface::open(&surface_path)?;
    let center = opt.surface_size / 2;
    info!(
        "done: {} node draws over {} frames; surface[{},{}] = {:.2}",
        drawn_total,
        opt.frames,
        center,
        center,
        flushed.sample_f32(center, center)
    );
    Ok(())
}
