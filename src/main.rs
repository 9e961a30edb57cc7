use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nalgebra::{Point3, Vector3};
use rand::Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use team_slam::io::{load_settings, Settings};
use team_slam::map::{
    Descriptor, KeyFrame, KeyFrameData, KeyPoint, MapPoint, MapPointId, Pose, ScalePyramid,
    DESCRIPTOR_LEN,
};
use team_slam::mapper::{IdAllocator, Mapper, MapperClient, MapperError, MapperServer};
use team_slam::optimizer::{OptimizationProblem, OptimizationResult, OptimizationScope, Optimizer};

/// Features per synthetic keyframe.
const FEATURES: usize = 20;
/// Slots filled with new points by the tracker.
const NEW_POINTS: usize = 10;
/// Slots left free for the background mapper.
const MAPPER_SLOTS: std::ops::Range<usize> = 15..20;
/// Synthetic points lie on this plane.
const GROUND_Z: f64 = 5.0;

/// Pulls points toward the ground plane of the synthetic scene.
struct PlaneOptimizer {
    iterations: usize,
}

impl Optimizer for PlaneOptimizer {
    fn optimize(
        &mut self,
        problem: &OptimizationProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationResult> {
        let error = |points: &[(MapPointId, Vector3<f64>)]| -> f64 {
            points.iter().map(|(_, p)| (p.z - GROUND_Z).powi(2)).sum()
        };

        let mut points: Vec<(MapPointId, Vector3<f64>)> = problem
            .map_points
            .iter()
            .map(|p| (p.id, p.position))
            .collect();
        let initial_error = error(&points);

        for _ in 0..self.iterations {
            if should_stop() {
                return None;
            }
            for (_, p) in &mut points {
                p.z += 0.5 * (GROUND_Z - p.z);
            }
        }

        Some(OptimizationResult {
            poses: Vec::new(),
            final_error: error(&points),
            points,
            iterations: self.iterations,
            initial_error,
        })
    }
}

/// Retry a call while it fails with back-pressure.
fn retry<T>(mut call: impl FnMut() -> Result<T, MapperError>) -> Result<T, MapperError> {
    loop {
        match call() {
            Err(e) if e.is_retryable() => thread::sleep(Duration::from_millis(2)),
            other => return other,
        }
    }
}

fn synthetic_keyframe(
    alloc: &IdAllocator,
    pose: Pose,
    timestamp: f64,
    pyramid: ScalePyramid,
    rng: &mut impl Rng,
) -> Result<Arc<KeyFrame>> {
    let id = alloc
        .next_keyframe_id()
        .context("tracker lease without a keyframe space")?;
    let keypoints = (0..FEATURES)
        .map(|_| {
            KeyPoint::new(
                rng.gen_range(0.0..640.0),
                rng.gen_range(0.0..480.0),
                rng.gen_range(0..pyramid.levels),
            )
        })
        .collect();
    let descriptors = (0..FEATURES)
        .map(|_| {
            let mut bytes = [0u8; DESCRIPTOR_LEN];
            rng.fill(&mut bytes[..]);
            Descriptor(bytes)
        })
        .collect();
    Ok(Arc::new(KeyFrame::new(
        id,
        pose,
        KeyFrameData::monocular(timestamp, keypoints, descriptors, pyramid),
    )))
}

/// Build a keyframe with new points in front of the camera, sharing some
/// points already in the replica.
fn next_keyframe(
    mapper: &dyn Mapper,
    alloc: &IdAllocator,
    pose: Pose,
    timestamp: f64,
    pyramid: ScalePyramid,
    rng: &mut impl Rng,
) -> Result<(Arc<KeyFrame>, Vec<Arc<MapPoint>>)> {
    let kf = synthetic_keyframe(alloc, pose, timestamp, pyramid, rng)?;
    let center = pose.inverse() * Point3::origin();

    let mut new_points = Vec::with_capacity(NEW_POINTS);
    for idx in 0..NEW_POINTS {
        let position = Vector3::new(
            center.x + rng.gen_range(-2.0..2.0),
            center.y + rng.gen_range(-2.0..2.0),
            GROUND_Z + rng.gen_range(-0.3..0.3),
        );
        let mp = Arc::new(MapPoint::new(alloc.next_map_point_id(), position, kf.id()));
        kf.add_map_point(idx, mp.id());
        new_points.push(mp);
    }

    // Re-observe the most recent good points of the replica.
    let mut known: Vec<Arc<MapPoint>> = mapper
        .map()
        .all_map_points()
        .into_iter()
        .filter(|mp| !mp.is_bad() && !mp.is_placeholder())
        .collect();
    known.sort_by_key(|mp| std::cmp::Reverse(mp.id()));
    for (idx, mp) in (NEW_POINTS..MAPPER_SLOTS.start).zip(known) {
        kf.add_map_point(idx, mp.id());
    }

    Ok((kf, new_points))
}

fn run_tracker(
    server: Arc<MapperServer>,
    pivot: Pose,
    frames: usize,
    pyramid: ScalePyramid,
) -> Result<usize> {
    let client = MapperClient::new(server)?;
    let login = retry(|| client.login_tracker(pivot))?;
    let alloc = IdAllocator::new(login.lease);
    let mut rng = rand::thread_rng();
    let offset = f64::from(login.tracker.0) * 3.0;

    for frame in 0..frames {
        let pose = Pose::translation(-(offset + frame as f64 * 0.25), 0.0, 0.0) * pivot.inverse();
        let timestamp = frame as f64 / 20.0;
        client.update_pose(login.tracker, pose)?;

        let (kf, points) = next_keyframe(&client, &alloc, pose, timestamp, pyramid, &mut rng)?;
        if !client.is_initialized() {
            match client.initialize(login.tracker, vec![Arc::clone(&kf)], points.clone()) {
                Ok(()) => continue,
                // Another tracker won the race; fall back to insertion.
                Err(MapperError::AlreadyInitialized) => {}
                Err(e) => return Err(e.into()),
            }
        }
        retry(|| client.insert_keyframe(login.tracker, Arc::clone(&kf), points.clone()))?;
        thread::sleep(Duration::from_millis(1));
    }

    client.sync()?;
    let replica = client.map();
    info!(
        "{} done: replica holds {} keyframes, {} map points",
        login.tracker,
        replica.keyframes_in_map(),
        replica.map_points_in_map()
    );
    client.logout_tracker(login.tracker)?;
    Ok(frames)
}

fn run_mapper(server: &MapperServer, done: &AtomicBool) -> Result<usize> {
    let alloc = IdAllocator::new(server.local_mapper_lease());
    let mut optimizer = PlaneOptimizer { iterations: 5 };
    let mut runs = 0;

    while !done.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(5));
        if !server.is_initialized() {
            continue;
        }

        // Triangulate one point in the newest keyframe's free slots.
        if let Some(kf) = server.map().all_keyframes().pop() {
            if let Some(slot) = MAPPER_SLOTS.clone().find(|s| kf.map_point(*s).is_none()) {
                let mp = Arc::new(MapPoint::new(
                    alloc.next_map_point_id(),
                    Vector3::new(0.0, 0.0, GROUND_Z),
                    kf.id(),
                ));
                mp.add_observation(&kf, slot);
                match server.insert_mapper_points(vec![mp]) {
                    Ok(()) => {}
                    // The keyframe disappeared in a reset.
                    Err(MapperError::UnresolvedKeyFrame { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        server.request_pause();
        let report = server.run_optimization(&mut optimizer, OptimizationScope::Global);
        server.release_pause();
        if report.is_some() {
            runs += 1;
        }
    }
    Ok(runs)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => load_settings(&path)?,
        None => Settings::default(),
    };
    let frames: usize = match std::env::args().nth(2) {
        Some(n) => n.parse().context("frame count must be a number")?,
        None => 30,
    };

    let config = settings.mapper_config();
    let mut pivots = settings.pivots()?;
    pivots.resize(config.max_trackers as usize, Pose::identity());
    println!(
        "Running {} trackers for {} keyframes each",
        config.max_trackers, frames
    );

    let server = Arc::new(MapperServer::new(config));
    let done = AtomicBool::new(false);

    let (inserted, runs) = thread::scope(|s| -> Result<(usize, usize)> {
        let mapper = s.spawn(|| run_mapper(&server, &done));
        let trackers: Vec<_> = pivots
            .iter()
            .map(|pivot| {
                let server = Arc::clone(&server);
                let pivot = *pivot;
                s.spawn(move || run_tracker(server, pivot, frames, config.pyramid))
            })
            .collect();

        let results: Vec<Result<usize>> = trackers
            .into_iter()
            .map(|t| match t.join() {
                Ok(result) => result,
                Err(_) => {
                    warn!("Tracker thread panicked");
                    Ok(0)
                }
            })
            .collect();
        done.store(true, Ordering::SeqCst);

        let mut inserted = 0;
        for result in results {
            inserted += result?;
        }
        let runs = match mapper.join() {
            Ok(result) => result?,
            Err(_) => {
                warn!("Mapper thread panicked");
                0
            }
        };
        Ok((inserted, runs))
    })?;

    let snapshot = server.map().consistent_snapshot();
    let bad = snapshot.map_points.iter().filter(|mp| mp.is_bad()).count();
    println!(
        "Inserted {} keyframes; map holds {} keyframes, {} map points ({} bad); {} optimizations, big change {}",
        inserted,
        snapshot.keyframes.len(),
        snapshot.map_points.len(),
        bad,
        runs,
        snapshot.big_change_idx
    );
    Ok(())
}
