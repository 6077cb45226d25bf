//! Ember GPU probe
//!
//! Builds a real Vulkan device and pushes a few frames of uploads through the
//! resource pools: staged buffer copies from two recording contexts, a
//! descriptor set that follows a buffer reallocated every frame, and deferred
//! destruction of the buffers it replaces.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-probe -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames <N>`: Number of frames to run (default: 8)
//! - `--back-buffers <N>`: Frames in flight (default: 3)
//! - `--no-validation`: Disable validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod probe;

use anyhow::Context;
use ember_gpu::{GpuContextBuilder, GpuResources, ResourceConfig};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::probe::Probe;

struct Options {
    frames: u32,
    back_buffers: u32,
    validation: bool,
}

impl Options {
    fn parse() -> anyhow::Result<Self> {
        let mut options = Self {
            frames: 8,
            back_buffers: 3,
            validation: cfg!(debug_assertions),
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--frames" => options.frames = parse_value(&arg, args.next())?,
                "--back-buffers" => options.back_buffers = parse_value(&arg, args.next())?,
                "--no-validation" => options.validation = false,
                other => anyhow::bail!("unknown option {other}, see --help"),
            }
        }

        Ok(options)
    }
}

fn parse_value(flag: &str, value: Option<String>) -> anyhow::Result<u32> {
    let value = value.with_context(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .with_context(|| format!("invalid value for {flag}: {value}"))
}

fn main() -> anyhow::Result<()> {
    // Check for help flag before touching the GPU
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }
    let options = Options::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let gpu = Arc::new(
        GpuContextBuilder::new()
            .app_name("Ember Probe")
            .validation(options.validation)
            .build()
            .context("failed to create GPU context")?,
    );

    let config = ResourceConfig::new().with_back_buffer_count(options.back_buffers);
    let device = gpu.device_context(config.back_buffer_count);
    let resources = GpuResources::new(device, gpu.queue(), gpu.queue_family(), config)?;

    info!(
        frames = options.frames,
        back_buffers = options.back_buffers,
        "running probe"
    );

    let mut probe = Probe::new(&gpu, &resources)?;
    for frame in 0..options.frames {
        probe.frame(frame)?;
        let slot = resources.end_frame()?;
        debug!(frame, slot, "frame done");
    }
    probe.finish()?;

    info!(
        submissions = resources.submission_count(),
        contexts = resources.context_count(),
        "probe finished"
    );

    drop(resources);
    info!(
        live_allocations = gpu.live_allocations(),
        "resource pools released"
    );

    Ok(())
}

fn print_help() {
    eprintln!(
        "Ember GPU probe

USAGE:
    cargo run -p ember-probe -- [OPTIONS]

OPTIONS:
    --frames <N>        Number of frames to run (default: 8)
    --back-buffers <N>  Frames in flight (default: 3)
    --no-validation     Disable validation layers
    -h, --help          Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
