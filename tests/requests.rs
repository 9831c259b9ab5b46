mod common;

use glam::{DVec3, Vec3};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scenesync::builder::MaterialCache;
use scenesync::commands::{MessageLevel, RequestId};
use scenesync::demos::CITY_URL;
use scenesync::dispatch::Dispatcher;
use scenesync::dispatch::requests::{RequestError, RequestOutcome};
use scenesync::manager::SceneManager;
use scenesync::registry::factory::FactoryRegistry;
use scenesync::settings::{DispatchSettings, ManagerSettings};
use scenesync::source::StaticSceneSource;

use common::harness;

fn idle_dispatcher(request_timeout: Duration) -> Dispatcher {
    // the producer is never started, nothing will ever answer
    let manager = SceneManager::new(StaticSceneSource::new(), ManagerSettings::default());
    Dispatcher::new(
        manager,
        Arc::new(FactoryRegistry::new()),
        Arc::new(MaterialCache::new()),
        DispatchSettings {
            request_timeout,
            ..DispatchSettings::default()
        },
    )
}

#[test_log::test]
fn unanswered_request_times_out_once() {
    let mut dispatcher = idle_dispatcher(Duration::from_millis(50));
    let calls = Arc::new(AtomicUsize::new(0));
    let result = Arc::new(Mutex::new(None));

    let start = Instant::now();
    let (counter, slot) = (calls.clone(), result.clone());
    dispatcher.request_ground_clamp_position(59.33, 18.12, 1000.0, false, move |outcome| {
        counter.fetch_add(1, Ordering::AcqRel);
        *slot.lock().unwrap() = Some((outcome, start.elapsed()));
    });

    while dispatcher.pending_requests() > 0 {
        assert!(start.elapsed() < Duration::from_secs(2), "the request never expired");
        dispatcher.tick();
        std::thread::sleep(Duration::from_millis(1));
    }
    for _ in 0..10 {
        dispatcher.tick();
    }

    assert_eq!(calls.load(Ordering::Acquire), 1);
    let (outcome, elapsed) = result.lock().unwrap().take().expect("continuation ran");
    assert!(matches!(outcome, Err(RequestError::TimedOut(_))));
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(60), "{:?}", elapsed);
}

#[test_log::test]
fn blocking_request_gives_up_at_its_deadline() {
    let mut dispatcher = idle_dispatcher(Duration::from_millis(50));
    let start = Instant::now();
    let result = dispatcher.request_ground_clamp_position_blocking(1.0, 2.0, 3.0, true);
    assert!(matches!(result, Err(RequestError::TimedOut(_))));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(60), "{:?}", elapsed);
    assert_eq!(dispatcher.pending_requests(), 0);
}

#[test_log::test]
fn camera_position_is_answered() {
    let mut h = harness(DispatchSettings::default());
    let position = DVec3::new(10.0, 20.0, 30.0);
    let hpr = Vec3::new(90.0, -10.0, 0.0);
    h.dispatcher.manager().position_camera(position, hpr, 60.0, 45.0);

    let result = h.dispatcher.request_camera_position_blocking();
    assert_eq!(result, Ok(RequestOutcome::CameraPosition { position, hpr }));
}

#[test_log::test]
fn ground_clamp_waits_for_streamed_data() {
    let mut h = harness(DispatchSettings::default());
    h.dispatcher.manager().initialize(false).unwrap();
    h.dispatcher.manager().add_map(CITY_URL).unwrap();

    // answered once a refresh has streamed the city, the blocking loop ticks for it
    match h.dispatcher.request_ground_clamp_position_blocking(5.0, 6.0, 1.8, true) {
        Ok(RequestOutcome::GroundClamp { position, normal }) => {
            assert_eq!(normal, Vec3::Z);
            assert_eq!((position.x, position.y), (5.0, 6.0));
            assert!((position.z - 14.3).abs() < 1e-9, "{}", position);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test_log::test]
fn ground_clamp_without_data_is_reported() {
    let mut h = harness(DispatchSettings::default());
    let reported = Arc::new(AtomicUsize::new(0));
    let sink = reported.clone();
    h.dispatcher
        .set_error_sink(move |_level: MessageLevel, _message: &str, _ref_id: Option<RequestId>| {
            sink.fetch_add(1, Ordering::AcqRel);
        });
    h.dispatcher.manager().initialize(false).unwrap();
    h.dispatcher.manager().add_map(CITY_URL).unwrap();

    let result = h.dispatcher.request_ground_clamp_position_blocking(5.0, 6.0, 1.8, false);
    assert!(
        matches!(
            result,
            Err(RequestError::Producer {
                level: MessageLevel::Warning,
                ..
            })
        ),
        "{:?}",
        result
    );
    assert_eq!(reported.load(Ordering::Acquire), 1);
}

#[test_log::test]
fn intersect_hits_the_terrain() {
    let mut h = harness(DispatchSettings::default());
    h.dispatcher.manager().initialize(false).unwrap();
    h.dispatcher.manager().add_map(CITY_URL).unwrap();

    let start = DVec3::new(0.0, 0.0, 112.5);
    let hits = match h.dispatcher.intersect_blocking(start, DVec3::NEG_Z, true, 1) {
        Ok(RequestOutcome::Intersect { hits }) => hits,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(hits.len(), 1);
    assert!((hits[0].distance - 100.0).abs() < 1e-9);

    // the terrain bit is not part of the mask
    let misses = h.dispatcher.intersect_blocking(start, DVec3::NEG_Z, true, 2);
    assert_eq!(misses, Ok(RequestOutcome::Intersect { hits: vec![] }));
}

#[test_log::test]
fn requests_fail_when_the_manager_stops() {
    let mut h = harness(DispatchSettings::default());
    h.dispatcher.manager().shutdown();
    let result = h.dispatcher.request_camera_position_blocking();
    assert_eq!(result, Err(RequestError::ManagerStopped));
}

#[test_log::test(tokio::test)]
async fn async_requests_resolve_while_ticking() {
    let mut h = harness(DispatchSettings::default());
    let position = DVec3::new(1.0, 2.0, 3.0);
    h.dispatcher.manager().position_camera(position, Vec3::ZERO, 60.0, 45.0);

    let receiver = h.dispatcher.request_camera_position_async();
    let mut dispatcher = h.dispatcher;
    let driver = tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        while dispatcher.pending_requests() > 0 && start.elapsed() < Duration::from_secs(5) {
            dispatcher.tick();
            std::thread::sleep(Duration::from_millis(1));
        }
        dispatcher
    });

    let result = receiver.await.expect("the continuation always runs");
    assert_eq!(
        result,
        Ok(RequestOutcome::CameraPosition {
            position,
            hpr: Vec3::ZERO
        })
    );

    let mut dispatcher = driver.await.expect("driver finished");
    dispatcher.shutdown();
}
