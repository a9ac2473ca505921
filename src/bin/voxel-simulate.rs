#![warn(clippy::all, rust_2018_idioms)]

use anyhow::Context;
use clap::{Parser, ValueHint};
use lightsheet_voxels::volume::CoordinateTransformer;
use lightsheet_voxels::{AcquisitionSession, CombineMode, StagePosition, StorageConfig, VoxelStorage};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Streams synthetic frames into a voxel storage while a refresh task renders display volumes.
#[derive(Parser, Debug, Clone)]
#[command(name = "voxel-simulate")]
struct Args {
    /// JSON storage configuration, defaults are used when omitted
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 200)]
    frames: usize,

    /// Frame width and height in pixels
    #[arg(long, default_value_t = 128)]
    frame_size: usize,

    #[arg(long, default_value_t = 0)]
    channel: usize,

    #[arg(long, default_value = "maximum")]
    mode: CombineMode,

    /// Relative placement: display volumes follow the stage from the first frame
    #[arg(long)]
    live_view: bool,

    /// Pause between frames
    #[arg(long, default_value_t = 5)]
    frame_ms: u64,

    #[arg(long, default_value_t = 100)]
    refresh_ms: u64,
}

/// Bright sphere centred in the acquired stack, `z` being the frame offset from the middle.
fn synthetic_intensity(row: f64, col: f64, z: f64, frame_size: usize, max_value: f32) -> f32 {
    let c = frame_size as f64 / 2.0;
    let radius = frame_size as f64 / 3.0;
    let d = ((row - c).powi(2) + (col - c).powi(2) + z.powi(2)).sqrt();
    if d >= radius {
        0.0
    } else {
        (max_value as f64 * (1.0 - d / radius)) as f32
    }
}

fn acquire(
    storage: &VoxelStorage,
    args: &Args,
    start: StagePosition,
    stage_tx: watch::Sender<StagePosition>,
) -> anyhow::Result<(usize, usize)> {
    let pixels = CoordinateTransformer::pixel_grid(args.frame_size, args.frame_size);
    let pixel_size_um = storage.config().storage_voxel_size_um;
    let step_mm = pixel_size_um / 1000.0;
    let fov_mm = args.frame_size as f64 * step_mm;
    let max_value = storage.config().max_value();
    let (mut accepted, mut rejected) = (0, 0);

    for i in 0..args.frames {
        let offset = i as f64 - args.frames as f64 / 2.0;
        let drift_mm = if args.live_view { i as f64 * step_mm } else { 0.0 };
        let stage = StagePosition::new(start.x + drift_mm, start.y, start.z + offset * step_mm, start.r);
        stage_tx.send_replace(stage);

        let world = storage.camera_to_world(&pixels, stage.z, [stage.x, stage.y], pixel_size_um, fov_mm)?;
        let values: Vec<f32> = pixels
            .iter()
            .map(|[row, col]| synthetic_intensity(*row, *col, offset, args.frame_size, max_value))
            .collect();
        let report = storage.update(args.channel, &world, &values, i as f64, args.mode)?;
        accepted += report.accepted;
        rejected += report.rejected;
        debug!("frame {}: {:?}", i, report);

        std::thread::sleep(Duration::from_millis(args.frame_ms));
    }
    Ok((accepted, rejected))
}

#[cfg(not(target_arch = "wasm32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => StorageConfig::from_json_file(path)?,
        None => StorageConfig::default(),
    };
    let storage = Arc::new(VoxelStorage::new(config)?);
    let mut session = AcquisitionSession::new(storage.clone());

    let center = storage.get_region_bounds().center_um;
    let start = StagePosition::new(center[2] / 1000.0, center[1] / 1000.0, center[0] / 1000.0, 0.0);
    if args.live_view {
        session.start_live_view(start)?;
    } else {
        session.start_tile_acquisition()?;
    }

    let (stage_tx, mut stage_rx) = watch::channel(start);
    let acquisition = tokio::task::spawn_blocking({
        let storage = storage.clone();
        let args = args.clone();
        move || acquire(&storage, &args, start, stage_tx)
    });

    let holder = storage.world_to_display_voxel(center);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.refresh_ms.max(1)));
    let mut refreshes = 0usize;
    loop {
        ticker.tick().await;
        // the sender is dropped once acquisition is over
        let finished = stage_rx.has_changed().is_err();
        let stage = *stage_rx.borrow_and_update();
        let storage = storage.clone();
        let volume = tokio::task::spawn_blocking(move || {
            storage.get_display_volume_transformed(args.channel, &stage, holder)
        })
        .await??;
        refreshes += 1;
        debug!(
            "refresh {}: stage {:?}, {} populated display voxels",
            refreshes,
            stage,
            volume.nonzero_count()
        );
        if finished {
            break;
        }
    }

    let (accepted, rejected) = acquisition.await.context("acquisition task failed")??;
    info!(
        "{} frames: {} samples stored, {} outside the sample region, {} refreshes",
        args.frames, accepted, rejected, refreshes
    );

    if args.live_view {
        session.stop_live_view()?;
    } else {
        session.stop_tile_acquisition()?;
    }

    let volume = storage.get_display_volume(args.channel)?;
    info!(
        "display volume {:?}: max {} at {:?}",
        volume.shape(),
        volume.max_value(),
        volume.argmax()
    );
    println!("{}", serde_json::to_string_pretty(&storage.get_memory_usage())?);
    Ok(())
}
