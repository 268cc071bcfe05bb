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
use anyhow::{bail, Result};
use gpu::SampleFormat;
use std::path::PathBuf;
use structopt::StructOpt;
use uber_surface::UberSurface;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "dump-uber-surface",
    about = "Create and inspect uber-surface files."
)]
enum Opt {
    /// Write a new zero-filled surface file.
    Create {
        #[structopt(long, default_value = "1024")]
        width: u32,

        #[structopt(long, default_value = "1024")]
        height: u32,

        /// One of: r8, r16, f32.
        #[structopt(long, default_value = "f32")]
        format: String,

        #[structopt(parse(from_os_str))]
        output: PathBuf,
    },

    /// Show the header and basic statistics of a surface file.
    Info {
        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },

    /// Print one sample.
    Sample {
        #[structopt(long)]
        x: u32,

        #[structopt(long)]
        y: u32,

        #[structopt(parse(from_os_str))]
        input: PathBuf,
    },
}

fn parse_format(name: &str) -> Result<SampleFormat> {
    Ok(match name {
        "r8" => SampleFormat::R8Unorm,
        "r16" => SampleFormat::R16Uint,
        "f32" => SampleFormat::R32Float,
        other => bail!("unknown format {}; expected r8, r16 or f32", other),
    })
}

fn main() -> Result<()> {
    match Opt::from_args() {
        Opt::Create {
            width,
            height,
            format,
            output,
        } => {
            UberSurface::create_empty(&output, width, height, parse_format(&format)?, 1)?;
            println!("wrote {}x{} {} surface to {:?}", width, height, format, output);
        }
        Opt::Info { input } => {
            let surface = UberSurface::open(&input)?;
            println!("path:    {:?}", surface.path());
            println!("size:    {}x{}", surface.width(), surface.height());
            println!("format:  {:?} x{}", surface.format(), surface.array_count());
            println!("stride:  {} bytes", surface.stride());
            if surface.format() == SampleFormat::R32Float && surface.array_count() == 1 {
                let mut min = f32::MAX;
                let mut max = f32::MIN;
                for y in 0..surface.height() {
                    for x in 0..surface.width() {
                        let v = surface.sample_f32(x, y);
                        min = min.min(v);
                        max = max.max(v);
                    }
                }
                println!("range:   {} .. {}", min, max);
            }
        }
        Opt::Sample { x, y, input } => {
            let surface = UberSurface::open(&input)?;
            if x >= surface.width() || y >= surface.height() {
                bail!(
                    "({}, {}) outside of {}x{} surface",
                    x,
                    y,
                    surface.width(),
                    surface.height()
                );
            }
            if surface.format() == SampleFormat::R32Float && surface.array_count() == 1 {
                println!("{}", surface.sample_f32(x, y));
            } else {
                println!("{:02x?}", surface.sample(x, y));
            }
        }
    }
    Ok(())
}
