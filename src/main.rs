// SPDX-License-Identifier: GPL-3.0-only

use clap::Parser;
use remapvid::BackendKind;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "remapvid")]
#[command(about = "Remap camera frames on the GPU and encode them to H.264")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Remap map file
    #[arg(short, long)]
    map: Option<PathBuf>,

    /// Precompiled remap kernel
    #[arg(short = 'k', long)]
    kernel: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Camera number
    #[arg(short, long)]
    camera: Option<u32>,

    /// Side-by-side stereoscopic capture
    #[arg(long)]
    stereo: bool,

    /// Bitrate in bits per second
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Capture framerate
    #[arg(short, long)]
    framerate: Option<u32>,

    /// Frames between keyframes
    #[arg(short = 'g', long)]
    keyframe: Option<u32>,

    /// Camera sensor mode
    #[arg(short, long)]
    sensor: Option<u32>,

    /// Repeat stream headers before every keyframe
    #[arg(long)]
    inline_header: bool,

    /// Emit timing information in the SPS
    #[arg(long)]
    sps_timing: bool,

    /// Flip the camera horizontally
    #[arg(long)]
    hflip: bool,

    /// Flip the camera vertically
    #[arg(long)]
    vflip: bool,

    /// JSON config file with base settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture and encode backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Run the remap on the host emulator instead of the GPU
    #[arg(long)]
    emulate: bool,
}

fn main() -> ExitCode {
    // Logs go to stderr; stdout may carry the bitstream.
    // Set RUST_LOG to control the level, e.g. RUST_LOG=remapvid=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();

    let args = Cli::parse();

    match cli::run(args) {
        Ok(stats) => {
            eprintln!(
                "Stopped after {} frames ({} dropped), {} bytes written",
                stats.remapped, stats.dropped, stats.encoded_bytes
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("ERROR [{}]: {}", e.stage(), e);
            ExitCode::from(e.exit_code())
        }
    }
}
