use clap::Parser;
use glam::{DVec3, Vec3};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use scenesync::builder::MaterialCache;
use scenesync::demos::{self, ProxyCounter};
use scenesync::dispatch::Dispatcher;
use scenesync::dispatch::requests::RequestOutcome;
use scenesync::manager::SceneManager;
use scenesync::registry::factory::{initialize_scene_system, uninitialize_scene_system};
use scenesync::settings::{CliArgs, DispatchSettings, ManagerSettings};
use scenesync::source::StaticSceneSource;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    #[cfg(feature = "tracy")]
    tracy_client::Client::start();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let source = StaticSceneSource::new().with_map(demos::CITY_URL, demos::city());
    let manager = SceneManager::new(source, ManagerSettings::default());
    manager.set_omni_traverse(args.omni_traverse);
    manager.position_camera(args.camera.into(), Vec3::new(0.0, -10.0, 0.0), 60.0, 45.0);
    manager.run()?;

    let factories = initialize_scene_system();
    let counter = Arc::new(ProxyCounter::default());
    if let Err(err) = demos::register_logging_factories(&factories, counter.clone()) {
        warn!("{}", err);
    }

    let settings = DispatchSettings {
        max_builds_per_tick: args.max_builds,
        fetch_timeout: Duration::from_millis(50),
        ..DispatchSettings::default()
    };
    let resources = Arc::new(MaterialCache::new());
    let mut dispatcher = Dispatcher::new(manager, factories, resources.clone(), settings);

    dispatcher.manager().initialize(false)?;
    for map in &args.maps {
        dispatcher.manager().add_map(map.as_str())?;
    }

    for _ in 0..args.ticks {
        dispatcher.tick();
        profiling::finish_frame!();
    }

    let camera: DVec3 = args.camera.into();
    match dispatcher.request_ground_clamp_position_blocking(camera.x, camera.y, 1.8, true) {
        Ok(RequestOutcome::GroundClamp { position, normal }) => {
            info!("Ground below the camera: {} (normal {})", position, normal)
        }
        Ok(other) => warn!("Unexpected answer {:?}", other),
        Err(err) => error!("Ground clamp failed: {}", err),
    }

    let stats = dispatcher.stats();
    info!(
        "{} frames, {} proxies built, {} live, {} materials, {} skipped, {} errors",
        stats.frames,
        stats.built,
        counter.live(),
        resources.live_materials(),
        stats.skipped,
        stats.registry_errors + stats.dispatch_errors
    );

    dispatcher.shutdown();
    uninitialize_scene_system();
    Ok(())
}
