use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use orrery_common::{Aabb, SplitMix64};
use orrery_kernel::BodyRegistry;
use orrery_spatial::{Octree, OctreeConfig};
use orrery_stream::{
    HeightfieldGenerator, StreamError, StreamingConfig, TerrainStreamer, TilePriority, TileRequest,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orrery-cli", about = "Spatial index and terrain streaming demos")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML or JSON file overriding the default tuning values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Print the effective configuration as YAML
    Config,
    /// Scatter bodies, move some, and query the octree
    Octree {
        /// Number of bodies to spawn
        #[arg(short, long, default_value = "1000")]
        bodies: usize,
        /// RNG seed for body placement and motion
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// Radius of the demo query around the origin
        #[arg(short, long, default_value = "250")]
        radius: f32,
    },
    /// Stream a square of heightfield tiles around a viewer
    Stream {
        /// Tiles per edge of the square
        #[arg(short, long, default_value = "8")]
        tiles: u32,
        /// Edge length of one tile in world units
        #[arg(long, default_value = "256")]
        tile_size: f32,
        /// Samples per tile edge
        #[arg(long, default_value = "33")]
        resolution: u32,
    },
}

/// Everything the demos can be tuned with. Missing sections keep defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DemoConfig {
    /// Half edge length of the cubic world the octree covers.
    world_half_extent: f32,
    octree: OctreeConfig,
    streaming: StreamingConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            world_half_extent: 1000.0,
            octree: OctreeConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl DemoConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text, path.extension().and_then(|e| e.to_str()))
            .with_context(|| format!("parsing config {}", path.display()))
    }

    fn parse(text: &str, extension: Option<&str>) -> anyhow::Result<Self> {
        let config: Self = match extension {
            Some("yaml" | "yml") => serde_yaml::from_str(text)?,
            _ => serde_json::from_str(text)?,
        };
        config.streaming.validate()?;
        config.octree.validate()?;
        anyhow::ensure!(
            config.world_half_extent > 0.0,
            "world_half_extent must be positive, got {}",
            config.world_half_extent
        );
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => DemoConfig::load(path)?,
        None => DemoConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("orrery-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", orrery_common::crate_info());
            println!("spatial: {}", orrery_spatial::crate_info());
            println!("stream: {}", orrery_stream::crate_info());
        }
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Commands::Octree {
            bodies,
            seed,
            radius,
        } => run_octree(&config, bodies, seed, radius),
        Commands::Stream {
            tiles,
            tile_size,
            resolution,
        } => run_stream(&config, tiles, tile_size, resolution)?,
    }

    Ok(())
}

fn run_octree(config: &DemoConfig, bodies: usize, seed: u64, radius: f32) {
    let world = Aabb::cube(config.world_half_extent);
    println!("Octree demo: bodies={bodies}, seed={seed}, world=±{}", config.world_half_extent);

    let mut registry = BodyRegistry::new();
    let mut tree = Octree::with_bounds(config.octree, world);
    let ids = registry.scatter(bodies, world, seed);
    tree.apply_events(&registry.drain_events());
    let stats = tree.stats();
    println!(
        "Built: bodies={}, nodes={}, leaves={}, depth={}",
        stats.body_count, stats.node_count, stats.leaf_count, stats.max_depth
    );

    // Move a quarter of the bodies and despawn every tenth.
    let mut rng = SplitMix64::new(seed ^ 0x5eed);
    for id in ids.iter().step_by(4) {
        registry.set_position(*id, rng.point_in(world.min, world.max));
    }
    for id in ids.iter().step_by(10) {
        registry.despawn(*id);
    }
    tree.apply_events(&registry.drain_events());
    println!("After moves: bodies={}, nodes={}", tree.body_count(), tree.node_count());

    let start = Instant::now();
    let reinserted = tree.rebuild_from(&registry);
    println!(
        "Rebuilt: bodies={reinserted}, nodes={}, took {:?}",
        tree.node_count(),
        start.elapsed()
    );

    let result = tree.query_bodies_in_radius(Vec3::ZERO, radius);
    let brute = registry
        .iter()
        .filter(|(_, p)| p.distance(Vec3::ZERO) <= radius)
        .count();
    println!(
        "Query r={radius}: found={}, brute force={brute}, nodes visited={}, took {:?}",
        result.len(),
        result.nodes_visited,
        result.elapsed
    );
}

fn run_stream(
    config: &DemoConfig,
    tiles: u32,
    tile_size: f32,
    resolution: u32,
) -> anyhow::Result<()> {
    let mut streamer =
        TerrainStreamer::with_config(HeightfieldGenerator::default(), config.streaming.clone())?;
    let viewer = Vec3::splat(tiles as f32 * tile_size * 0.5).with_z(0.0);
    println!(
        "Stream demo: {tiles}x{tiles} tiles, size={tile_size}, resolution={resolution}, workers={}",
        streamer.worker_count()
    );

    let mut queue: Vec<TileRequest> = (0..tiles * tiles)
        .map(|i| {
            let origin = Vec3::new((i % tiles) as f32, (i / tiles) as f32, 0.0) * tile_size;
            let center = origin + Vec3::new(tile_size, tile_size, 0.0) * 0.5;
            let priority = match (center.distance(viewer) / tile_size) as u32 {
                0 => TilePriority::Critical,
                1 => TilePriority::High,
                2..=3 => TilePriority::Normal,
                _ => TilePriority::Low,
            };
            TileRequest::new(origin, tile_size, 0, resolution).with_priority(priority)
        })
        .collect();
    queue.reverse();

    let mut in_flight = Vec::new();
    let mut loaded = 0usize;
    let mut frames = 0u64;
    let frame = Duration::from_millis(16);
    let start = Instant::now();
    while !queue.is_empty() || !in_flight.is_empty() {
        // Submit until the streamer pushes back; retry the rest next frame.
        while let Some(request) = queue.pop() {
            match streamer.request_tile_load(request.clone(), viewer) {
                Ok(id) => in_flight.push(id),
                Err(StreamError::Backpressure { .. }) => {
                    queue.push(request);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        streamer.update(frame);
        frames += 1;
        let mut still_waiting = Vec::with_capacity(in_flight.len());
        for id in in_flight {
            if streamer.is_tile_ready(id) {
                let tile = streamer.get_loaded_tile(id)?;
                tracing::debug!(%id, position = ?tile.position, "tile loaded");
                loaded += 1;
            } else {
                still_waiting.push(id);
            }
        }
        in_flight = still_waiting;
        if streamer.worker_count() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let stats = streamer.stats();
    println!("Loaded {loaded} tiles in {frames} frames ({:?})", start.elapsed());
    println!(
        "Stats: completed={}, failed={}, rejected={}, cached={}, avg load={:?}, hit rate={:.2}",
        stats.completed_requests,
        stats.failed_requests,
        stats.rejected_requests,
        stats.cached_tiles,
        stats.average_load_time,
        stats.cache_hit_rate()
    );
    streamer.shutdown();
    Ok(())
}
