//! Lumen memory check
//!
//! Exercises the GPU memory layer end to end: typed views through a staging
//! allocator, concurrent updates from worker threads, one-shot uploads and a
//! reusable staging buffer.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lumen-memcheck -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--headless`: Use the software device instead of Vulkan
//! - `--elements <N>`: Elements per vector (default: 1024)
//! - `--threads <N>`: Worker threads (default: 4)
//! - `-h, --help`: Print help message
//!
//! Falls back to the software device when no Vulkan device is available.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;

use anyhow::{ensure, Context};
use ash::vk;
use lumen_gpu::{
    upload, Allocator, GpuContext, GpuContextBuilder, HeadlessConfig, HeadlessDevice,
    StagingBuffer, Tuple, Vector,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Per-frame constants as a shader would see them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameConstants {
    view_projection: [[f32; 4]; 4],
    time: f32,
    frame: u32,
    _padding: [u32; 2],
}

#[derive(Debug, Clone, Copy)]
struct MemcheckConfig {
    headless: bool,
    elements: usize,
    threads: usize,
}

impl Default for MemcheckConfig {
    fn default() -> Self {
        Self {
            headless: false,
            elements: 1024,
            threads: 4,
        }
    }
}

impl MemcheckConfig {
    fn from_args() -> Self {
        let mut config = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--headless" => config.headless = true,
                "--elements" => {
                    if i + 1 < args.len() {
                        if let Ok(v) = args[i + 1].parse() {
                            config.elements = v;
                        }
                        i += 1;
                    }
                }
                "--threads" => {
                    if i + 1 < args.len() {
                        if let Ok(v) = args[i + 1].parse() {
                            config.threads = v;
                        }
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }

        config.elements = config.elements.max(1);
        config.threads = config.threads.max(1);
        config
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MemcheckConfig::from_args();
    let (context, headless) = create_context(config.headless)?;
    info!(backend = ?context.backend(), ?config, "memcheck starting");

    let alignment = context.capabilities().min_storage_buffer_offset_alignment;
    let allocator = Allocator::device(&context, alignment);

    check_vector(&allocator, config.elements)?;
    check_workers(&allocator, config)?;
    check_constants(&context)?;
    check_uploads(&context, &allocator, config.elements)?;

    ensure!(allocator.size() == 0, "allocations leaked: {} bytes", allocator.size());
    if let Some(device) = headless {
        let stats = device.stats();
        info!(
            submissions = device.submissions().len(),
            flushes = device.flushes().len(),
            live_buffers = stats.buffers,
            "headless device summary"
        );
    }

    info!("memcheck passed");
    Ok(())
}

fn create_context(headless: bool) -> anyhow::Result<(Arc<GpuContext>, Option<Arc<HeadlessDevice>>)> {
    if !headless {
        match GpuContextBuilder::new().app_name("lumen-memcheck").build() {
            Ok(context) => return Ok((context, None)),
            Err(e) => warn!("Vulkan unavailable ({e}), using the headless device"),
        }
    }

    let device = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
    let context = GpuContextBuilder::new()
        .app_name("lumen-memcheck")
        .build_headless(Arc::clone(&device))
        .context("failed to create headless context")?;
    Ok((context, Some(device)))
}

fn check_vector(allocator: &Arc<Allocator>, elements: usize) -> anyhow::Result<()> {
    let mut vector = Vector::<u32>::filled(
        allocator,
        elements,
        0x5eed,
        vk::BufferUsageFlags::STORAGE_BUFFER,
    )?;
    ensure!(vector.iter().all(|v| v == 0x5eed), "fill did not reach every element");

    let last = elements - 1;
    vector.update(last, |v| *v = u32::MAX)?;
    ensure!(vector.at(last) == u32::MAX, "update was lost");

    info!(
        elements,
        stride = vector.stride(),
        bytes = vector.buffer().size(),
        allocator_bytes = allocator.size(),
        "vector check passed"
    );
    Ok(())
}

fn check_workers(allocator: &Arc<Allocator>, config: MemcheckConfig) -> anyhow::Result<()> {
    std::thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|worker| {
                s.spawn(move || -> anyhow::Result<()> {
                    let seed = worker as u32 * 1_000_000;
                    let values: Vec<u32> = (0..config.elements as u32).map(|i| seed + i).collect();
                    let mut vector =
                        Vector::from_slice(allocator, &values, vk::BufferUsageFlags::STORAGE_BUFFER)?;

                    for i in (0..config.elements).step_by(7) {
                        vector.update(i, |v| *v = !*v)?;
                    }
                    for (i, v) in vector.iter().enumerate() {
                        let expected = if i % 7 == 0 { !values[i] } else { values[i] };
                        ensure!(v == expected, "worker {worker}: element {i} is {v}, expected {expected}");
                    }
                    Ok(())
                })
            })
            .collect();

        for worker in workers {
            worker
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }
        Ok::<_, anyhow::Error>(())
    })?;

    info!(threads = config.threads, "worker check passed");
    Ok(())
}

fn check_constants(context: &Arc<GpuContext>) -> anyhow::Result<()> {
    let alignment = context.capabilities().min_uniform_buffer_offset_alignment;
    let allocator = Allocator::host(context, alignment);
    let mut constants = Tuple::<(FrameConstants, u32)>::new(
        &allocator,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
    )?;

    constants.update::<0, _>(|c| {
        c.time = 1.5;
        c.frame = 42;
    })?;
    constants.set::<1>(7)?;

    ensure!(constants.get::<0>().frame == 42, "frame constants were lost");
    ensure!(
        constants.offset(1) == allocator.align_size(std::mem::size_of::<FrameConstants>() as u64),
        "unexpected field layout"
    );

    info!(
        second_field_offset = constants.offset(1),
        bytes = constants.buffer().size(),
        "tuple check passed"
    );
    Ok(())
}

fn check_uploads(
    context: &Arc<GpuContext>,
    allocator: &Arc<Allocator>,
    elements: usize,
) -> anyhow::Result<()> {
    let indices: Vec<u32> = (0..elements as u32).collect();
    let buffer = upload(allocator, &indices, vk::BufferUsageFlags::INDEX_BUFFER)?;

    let device = allocator
        .as_device()
        .context("memcheck expects a device allocator")?;
    ensure!(device.size_on_host() == 0, "staging memory survived a one-shot upload");
    info!(
        on_device = device.size_on_device(),
        on_host = device.size_on_host(),
        "upload check passed"
    );

    let mut staging = StagingBuffer::new(context, 16)?;
    staging.write(0, &[9u32, 8, 7, 6])?;
    let patch = buffer.size().min(staging.size());
    staging.sync(&buffer, 0, 0, patch)?;

    info!(patched_bytes = patch, "staging check passed");
    Ok(())
}

fn print_help() {
    eprintln!(
        "Lumen memory check

Usage: lumen-memcheck [OPTIONS]

Options:
      --headless      Use the software device instead of Vulkan
      --elements <N>  Elements per vector (default: 1024)
      --threads <N>   Worker threads (default: 4)
  -h, --help          Print this help message

Environment:
  RUST_LOG            Log filter (default: info)"
    );
}
