//! Loading of the shipped configuration directory.

use std::path::{Path, PathBuf};
use std::time::Duration;
use xyscan_daq::config::{AppConfig, BenchConfig};
use xyscan_daq::data::StorageBackend;
use xyscan_daq::experiment::geometry::expand_axis;
use xyscan_daq::experiment::grid::Schedule;
use xyscan_daq::experiment::ExperimentKind;
use xyscan_daq::orchestrator::state::{State, Trigger};

fn config_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn test_shipped_config_loads() {
    let bench = BenchConfig::load(&config_dir()).unwrap();

    assert_eq!(bench.app.storage_backend().unwrap(), StorageBackend::Json);
    assert_eq!(
        bench.app.orchestrator.instrument_timeout,
        Duration::from_secs(60)
    );
    assert_eq!(
        bench.topology.experiment_for_page(2),
        Some(ExperimentKind::Decay)
    );
    assert_eq!(bench.ui.general.substrate, "quartz_25");
    assert_eq!(
        bench.transitions.resolve(State::Waiting, Trigger::InitExperiment).map(|t| t.dest),
        Some(State::Connecting)
    );
}

#[test]
fn test_shipped_settings_build_schedules() {
    let bench = BenchConfig::load(&config_dir()).unwrap();
    let substrate = bench.topology.substrate(&bench.ui.general.substrate).unwrap();

    for kind in [
        ExperimentKind::Transmission,
        ExperimentKind::ExcitationEmission,
        ExperimentKind::Decay,
    ] {
        bench.ui.validate_for(kind).unwrap();
        let positions = bench.ui.positions(kind).unwrap();
        let (x_axis, y_axis) = substrate.axes(kind).unwrap();
        let x = expand_axis("x", positions.x_input(), x_axis).unwrap();
        let y = expand_axis("y", positions.y_input(), y_axis).unwrap();
        let wavelengths = bench.ui.wavelengths(kind).unwrap();
        let schedule = Schedule::build(kind, Some(&x), Some(&y), &wavelengths).unwrap();

        let grid = positions.xnum * positions.ynum * wavelengths.len().max(1);
        assert_eq!(schedule.len(), grid + kind.reference_points(), "{}", kind);
    }
}

#[test]
fn test_environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.toml");
    std::fs::write(
        &path,
        "[retry]\nmax_attempts = 2\ninitial_backoff = \"50ms\"\n",
    )
    .unwrap();

    std::env::set_var("XYSCAN_RETRY__MAX_ATTEMPTS", "7");
    let config = AppConfig::load_from(&path);
    std::env::remove_var("XYSCAN_RETRY__MAX_ATTEMPTS");

    let config = config.unwrap();
    assert_eq!(config.retry.max_attempts, 7);
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(50));
}

#[test]
fn test_missing_substrate_is_reported() {
    let bench = BenchConfig::load(&config_dir()).unwrap();
    let err = bench.topology.substrate("no_such_holder").unwrap_err();
    assert!(err.to_string().contains("no_such_holder"));
}
