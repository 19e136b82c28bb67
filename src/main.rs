//! # Quarry
//!
//! Streams every mesh and texture of a data directory into GPU memory
//! through strata, then releases them again. It is a smoke test for a
//! device and a data set:
//!
//! * resources are requested all at once and uploaded in batches by
//!   pumping `update` like a render loop would.
//! * per resource load times and heap statistics are logged.
//! * `--headless` runs the same path on the in process device with a
//!   generated data set, no GPU needed.
extern crate utils;

use clap::Parser;
use strata as st;
use utils::timing::{get_current_millis, StopWatch};
use utils::{anyhow, Context};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "quarry", version)]
#[command(about = "Stream a data directory into GPU memory", long_about = None)]
struct Args {
    /// Directory holding data.db and the blobs it lists
    #[arg(long, default_value = ".")]
    data: PathBuf,
    /// Bytes per buddy allocator leaf, must be a power of two
    #[arg(long, default_value_t = st::GPU_MEMORY_CHUNK_SIZE)]
    chunk_size: u64,
    /// Leaves per arena, must be a power of two
    #[arg(long, default_value_t = st::GPU_MEMORY_ARENA_CHUNK_COUNT)]
    chunk_count: u64,
    /// Use the in process device and a generated data set
    #[arg(long)]
    headless: bool,
    /// Number of meshes and textures to generate in headless mode
    #[arg(long, default_value_t = 16)]
    generate: u32,
    /// Seconds to wait for all uploads
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    #[arg(long)]
    validation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Mesh,
    Texture,
}

/// A `size` x `size` grid of quads in the xy plane
fn grid_mesh(size: u32) -> (Vec<st::Vertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();
    let step = 1.0 / size as f32;

    for y in 0..=size {
        for x in 0..=size {
            let (u, v) = (x as f32 * step, y as f32 * step);
            vertices.push(st::Vertex::new(
                [u, v, 0.0],
                [u, v, 1.0 - u],
                [0.0, 0.0, 1.0],
                [u, v],
            ));
        }
    }

    let row = size + 1;
    for y in 0..size {
        for x in 0..size {
            let i = y * row + x;
            indices.extend_from_slice(&[i, i + 1, i + row + 1, i + row + 1, i + row, i]);
        }
    }

    (vertices, indices)
}

fn checkerboard(size: u32, tint: u8) -> Vec<u8> {
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let on = ((x / 8) + (y / 8)) % 2 == 0;
            let c = if on { 255 } else { tint };
            texels.extend_from_slice(&[c, c, tint, 255]);
        }
    }
    texels
}

/// Fill `data` with `count` meshes and textures of growing size
fn generate_scene(data: &st::MemorySource, count: u32) -> st::Result<Vec<(st::ResourceId, Kind)>> {
    let mut scene = Vec::new();

    for i in 0..count {
        let (vertices, indices) = grid_mesh(4 + i * 4);
        let mut blob = Vec::new();
        st::write_mesh_blob(&mut blob, &vertices, &indices)?;
        scene.push((data.insert_content(blob), Kind::Mesh));

        let size = 16 << (i % 6);
        let mut blob = Vec::new();
        st::write_texture_blob(&mut blob, size, size, &checkerboard(size, (i * 13) as u8))?;
        scene.push((data.insert_content(blob), Kind::Texture));
    }

    Ok(scene)
}

/// Sort database entries by file extension
fn database_scene(db: &st::FileDatabase) -> Vec<(st::ResourceId, Kind)> {
    let mut scene = Vec::new();

    for id in db.ids() {
        let path = match db.path_of(id) {
            Some(p) => p,
            None => continue,
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some("mesh") => scene.push((id, Kind::Mesh)),
            Some("tex") | Some("texture") => scene.push((id, Kind::Texture)),
            _ => log::warn!("Skipping {} ({})", id, path.display()),
        }
    }

    scene
}

fn run(args: &Args) -> utils::Result<()> {
    let info = st::CreateInfo::builder()
        .arena_chunk_size(args.chunk_size)
        .arena_chunk_count(args.chunk_count)
        .enable_validation(args.validation)
        .application_name("quarry")
        .build();
    info.check_arena_size()
        .context("--chunk-size and --chunk-count must be powers of two")?;

    let (dev, data, scene): (
        Arc<dyn st::GpuDevice>,
        Arc<dyn st::DataSource>,
        Vec<(st::ResourceId, Kind)>,
    ) = match args.headless {
        true => {
            let dev: Arc<dyn st::GpuDevice> = Arc::new(st::HeadlessDevice::auto_signal());
            let data = Arc::new(st::MemorySource::new());
            let scene = generate_scene(&data, args.generate)?;
            let data: Arc<dyn st::DataSource> = data;
            (dev, data, scene)
        }
        false => {
            let db = st::FileDatabase::open(&args.data)
                .with_context(|| format!("Could not open database in {}", args.data.display()))?;
            let scene = database_scene(&db);
            let dev: Arc<dyn st::GpuDevice> =
                Arc::new(st::VkDevice::new(&info).context("Could not create Vulkan device")?);
            let data: Arc<dyn st::DataSource> = Arc::new(db);
            (dev, data, scene)
        }
    };
    log::info!("Loading {} resources", scene.len());

    let ctx = Arc::new(st::GpuContext::new(dev, data, &info)?);
    let mut resources = st::ResourceManager::new(ctx.clone())?;

    let mut watch = StopWatch::new();
    watch.start();
    let begin = get_current_millis();

    for (id, kind) in scene.iter() {
        match kind {
            Kind::Mesh => {
                resources
                    .acquire_mesh(*id)
                    .with_context(|| format!("Could not load mesh {}", id))?;
            }
            Kind::Texture => {
                resources
                    .acquire_texture(*id)
                    .with_context(|| format!("Could not load texture {}", id))?;
            }
        }
    }

    // ------------ pump uploads -------------
    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut waiting: Vec<(st::ResourceId, Kind)> = scene.clone();
    let mut ticks = 0;

    while !waiting.is_empty() {
        resources.update()?;
        ticks += 1;

        waiting.retain(|(id, kind)| {
            if !resources.is_loaded(*id) {
                return true;
            }
            log::info!(
                "{:?} {} loaded after {} ms",
                kind,
                id,
                get_current_millis() - begin
            );
            false
        });

        if Instant::now() > deadline {
            return Err(anyhow!(
                "{} resources still loading after {} seconds",
                waiting.len(),
                args.timeout
            ));
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    watch.end();
    let stats = ctx.heap().stats();
    log::info!(
        "Loaded {} resources in {} ms over {} updates",
        scene.len(),
        watch.get_duration().as_millis(),
        ticks
    );
    log::info!(
        "Heap: {} arenas, {} of {} bytes in use by {} allocations",
        stats.arenas,
        stats.bytes_in_use,
        stats.bytes_reserved,
        stats.live_allocations
    );

    // ------------ release -------------
    for (id, kind) in scene.iter() {
        match kind {
            Kind::Mesh => resources.release_mesh(*id)?,
            Kind::Texture => resources.release_texture(*id)?,
        }
    }
    resources.wait_idle()?;

    let released = ctx.heap().release_unused_arenas();
    let stats = ctx.heap().stats();
    log::info!(
        "Released {} arenas, {} allocations left",
        released,
        stats.live_allocations
    );

    Ok(())
}

fn main() {
    utils::logging::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
