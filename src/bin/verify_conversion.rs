use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use motion_bridge_lib::motion::npz::NpzArchive;
use motion_bridge_lib::motion::{ClipConverter, RawCapture};

/// Converts a capture file and reports what the viewers would receive.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Capture to convert (.npz)
    input: PathBuf,

    /// Write the canonical artifact here
    #[arg(long)]
    out: Option<PathBuf>,

    /// Print the viewer clip as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let converter = ClipConverter::humanoid();

    println!("Reading {}...", args.input.display());
    let archive = NpzArchive::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    println!("Members: {:?}", archive.keys());

    let raw = RawCapture::detect(&archive)?;
    println!("Layout: {}", raw.layout());

    let clip = converter.normalize(raw)?;
    println!("Frames: {}  Joints: {}  FPS: {}", clip.frame_count(), clip.joint_count(), clip.fps);
    println!("dof_pos  {:?}", clip.dof_pos.shape());
    println!("root_pos {:?}", clip.root_pos.shape());
    println!("root_rot {:?}", clip.root_rot.shape());

    let web = clip.to_web_clip();
    web.check_shape()?;
    if let Some(first) = web.root_quat.first() {
        println!("First root_quat (w, x, y, z): {:?}", first);
    }

    if let Some(out) = &args.out {
        clip.to_npz()
            .write_to(out)
            .with_context(|| format!("failed to write {}", out.display()))?;
        let reloaded = converter.load_file(out)?;
        if reloaded != clip {
            anyhow::bail!("written artifact does not load back identically");
        }
        println!("Wrote {} (verified)", out.display());
    }

    if args.json {
        println!("{}", serde_json::to_string(&web)?);
    }

    println!("SUCCESS");
    Ok(())
}
