//! Maximum power point programs against the simulated cell.
//!
//! The simulated cell draws `I = (V - Voc) / R`, so `V * I` is most negative
//! at `Voc / 2`.

use echem_core::mpp::{max_power_voltage, TimeoutKind};
use echem_core::{
    DeviceRegistry, EngineConfig, ExecutorState, Mpp, MppCycles, MppParams, MppTracker, MppTrackingParams, Program,
    RetryPolicy, TechniqueId,
};
use echem_driver_mock::{CellModel, ErrorConfig, MockPotentiostat};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    }
}

fn tracking(start_voltage: f64, run_time: f64) -> MppTrackingParams {
    MppTrackingParams {
        perturb_step: 0.02,
        perturb_points: 3,
        perturb_interval: 0.06,
        record_interval: 0.01,
        ..MppTrackingParams::new(start_voltage, run_time)
    }
}

fn mpp_params(run_time: f64) -> MppParams {
    MppParams {
        tracking: MppTrackingParams {
            perturb_step: 0.01,
            ..tracking(0.0, run_time)
        },
        voc_time: 0.3,
        ..MppParams::new(run_time)
    }
}

/// Potential of maximum power of the relaxed default cell.
fn optimum() -> f64 {
    CellModel::default().ocv / 2.0
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tracking_climbs_to_max_power() {
    let mock = Arc::new(MockPotentiostat::builder().noise(0.0).build());
    let device = DeviceRegistry::new().device("10.0.0.40", mock.clone());
    let mut tracker = MppTracker::new(device.clone(), 0, tracking(0.1, 1.2), config()).unwrap();

    tracker.run().await.unwrap();

    assert_eq!(tracker.channel_state(), ExecutorState::Stopped);
    assert_eq!(mock.loaded(0), vec![TechniqueId::CaLimit]);
    let trace = tracker.trace();
    assert!(trace.len() >= 6, "only {} cycles", trace.len());
    assert!((trace[0] - 0.12).abs() < 1e-9, "first move {}", trace[0]);
    assert!(
        (tracker.voltage() - optimum()).abs() <= 0.045,
        "ended at {} V, optimum {} V",
        tracker.voltage(),
        optimum()
    );

    // rows follow the live potential updates
    let first = tracker.records()[0].voltage.unwrap();
    assert!((first - 0.1).abs() < 1e-6);
    assert!(tracker.records().iter().any(|r| r.voltage.unwrap() > 0.2));
    assert_eq!(device.sessions(), 0);
    assert!(!device.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_callbacks_run_between_cycles() {
    let mock = Arc::new(MockPotentiostat::builder().noise(0.0).build());
    let device = DeviceRegistry::new().device("10.0.0.41", mock);
    let mut tracker = MppTracker::new(device, 0, tracking(0.2, 1.0), config()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.on_timeout(
        Duration::from_millis(100),
        Some(3),
        TimeoutKind::Interval,
        Box::new(move |status| sink.lock().push(*status)),
    );

    tracker.run().await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|s| s.channel == 0 && s.elapsed >= Duration::from_millis(100)));
    assert!(seen.windows(2).all(|w| w[0].cycles <= w[1].cycles && w[0].elapsed < w[1].elapsed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_tracker_ends_early() {
    let mock = Arc::new(MockPotentiostat::new());
    let device = DeviceRegistry::new().device("10.0.0.42", mock);
    let mut tracker = MppTracker::new(device, 0, tracking(0.2, 60.0), config()).unwrap();
    let stop = tracker.stop_signal();

    let run = tokio::spawn(async move {
        tracker.run().await.map(|()| tracker)
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop.trigger();

    let tracker = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("tracker ignored the stop")
        .unwrap()
        .unwrap();
    assert_eq!(tracker.channel_state(), ExecutorState::Stopped);
    assert!(!tracker.trace().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpp_scans_then_tracks_on_one_connection() {
    let errors = ErrorConfig::none();
    let mock = Arc::new(MockPotentiostat::builder().noise(0.0).errors(errors.clone()).build());
    let device = DeviceRegistry::new().device("10.0.0.43", mock.clone());
    let mut mpp = Mpp::new(device.clone(), 2, mpp_params(0.6), config()).unwrap();

    mpp.run().await.unwrap();

    assert_eq!(mpp.channel_state(), ExecutorState::Stopped);
    let voc = mpp.voc().unwrap();
    assert!((voc - CellModel::default().ocv).abs() < 0.01, "voc {voc}");
    assert!(mpp.ocv_records().iter().all(|r| r.technique == TechniqueId::Ocv));
    assert!(mpp.scan_records().iter().all(|r| r.technique == TechniqueId::Cv));

    let scanned = max_power_voltage(mpp.scan_records()).unwrap();
    assert!((scanned - optimum()).abs() < 0.01, "scan optimum {scanned}");
    let tracker = mpp.tracker().unwrap();
    let held = tracker.records()[0].voltage.unwrap();
    assert!((held - scanned).abs() < 1e-6, "tracking started at {held}");
    assert!((tracker.voltage() - optimum()).abs() <= 0.03);

    let total = mpp.ocv_records().len() + mpp.scan_records().len() + tracker.records().len();
    assert_eq!(mpp.records().len(), total);

    assert_eq!(errors.calls("connect"), 1);
    assert_eq!(device.sessions(), 0);
    assert!(!device.is_connected());
    assert_eq!(mock.connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpp_stop_during_rest_skips_later_stages() {
    let mock = Arc::new(MockPotentiostat::builder().noise(0.0).build());
    let device = DeviceRegistry::new().device("10.0.0.44", mock.clone());
    let params = MppParams {
        voc_time: 30.0,
        ..mpp_params(10.0)
    };
    let mut mpp = Mpp::new(device, 0, params, config()).unwrap();
    let stop = mpp.stop_signal();

    let run = tokio::spawn(async move { mpp.run().await.map(|()| mpp) });
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.trigger();
    let mpp = run.await.unwrap().unwrap();

    assert_eq!(mpp.channel_state(), ExecutorState::Stopped);
    assert!(mpp.voc().is_some());
    assert!(mpp.scan_records().is_empty());
    assert!(mpp.tracker().is_none());
    assert_eq!(mock.loaded(0), vec![TechniqueId::Ocv]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mpp_cycles_rescan_each_interval() {
    let errors = ErrorConfig::none();
    let mock = Arc::new(MockPotentiostat::builder().noise(0.0).errors(errors.clone()).build());
    let device = DeviceRegistry::new().device("10.0.0.45", mock);
    let params = MppParams {
        voc_time: 0.2,
        ..mpp_params(0.5)
    };
    let mut cycles = MppCycles::new(device.clone(), 1, params, 0.3, config()).unwrap();
    assert_eq!(cycles.durations().len(), 2);

    cycles.run().await.unwrap();

    assert_eq!(cycles.channel_state(), ExecutorState::Stopped);
    assert_eq!(cycles.cycles().len(), 2);
    for mpp in cycles.cycles() {
        assert_eq!(mpp.channel_state(), ExecutorState::Stopped);
        assert!(!mpp.scan_records().is_empty());
        assert_eq!(mpp.tracker().unwrap().channel_state(), ExecutorState::Stopped);
    }
    let last = cycles.cycles()[1].tracker().unwrap().records();
    let span = last.last().unwrap().elapsed - last[0].elapsed;
    assert!(span < 0.3, "last cycle tracked for {span} s");
    assert_eq!(errors.calls("connect"), 1);
    assert!(!device.is_connected());
}
