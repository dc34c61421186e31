//! Configuration loading from TOML files and the environment

use spim_daq::acquisition::MemorySink;
use spim_daq::config::{AppConfig, DriftMethod};
use spim_daq::drift::ReferencePolicy;
use spim_daq::hardware::DriverRegistry;
use spim_daq::sequence::Axis;
use spim_daq::AcquisitionError;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[application]
name = "bench-scope"
log_level = "debug"

[hardware]
camera = "cam"
illumination = "laser"
x = "stage_x"
z = "stage_z"

[[hardware.devices]]
id = "cam"
driver = "mock_camera"
[hardware.devices.config]
width = 32
height = 32

[[hardware.devices]]
id = "laser"
driver = "mock_shutter"

[[hardware.devices]]
id = "stage_x"
driver = "mock_stage"

[[hardware.devices]]
id = "stage_z"
driver = "mock_stage"
[hardware.devices.config]
speed_um_per_sec = 200.0

[[hardware.devices]]
id = "probe"
driver = "mock_readable"

[acquisition]
time_points = 4
interval_secs = 1.5
step_timeout_ms = 2500
abort_on_delay = false
metadata_devices = ["probe"]

[acquisition.drift]
method = "centroid"
reference = "first"
pixel_size_um = 0.65
invert_x = true

[[acquisition.rows]]
x = "150"
z = "0:2:20"

[[acquisition.rows]]
x = "300"
z = "5:1:9"
invert_x = false
"#;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_configuration() {
    let file = write_config(CONFIG);
    let config = AppConfig::load(file.path()).unwrap();

    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.hardware.devices.len(), 5);
    let axes: Vec<Axis> = config.hardware.axis_assignments().map(|(a, _)| a).collect();
    assert_eq!(axes, vec![Axis::X, Axis::Z]);

    let acquisition = &config.acquisition;
    assert_eq!(acquisition.time_points, 4);
    assert!(!acquisition.abort_on_delay);

    let drift = acquisition.drift.as_ref().unwrap();
    assert_eq!(drift.method, DriftMethod::Centroid);
    assert_eq!(drift.reference, ReferencePolicy::First);

    let rows = acquisition.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].z_steps(), 11);
    assert!(rows[0].handoff.invert_x);
    assert!(!rows[1].handoff.invert_x);
    assert_eq!(rows[1].handoff.pixel_size, 0.65);
}

#[test]
fn test_params_from_configuration() {
    let file = write_config(CONFIG);
    let config = AppConfig::load(file.path()).unwrap();

    let params = config.acquisition.to_params(Arc::new(MemorySink::new())).unwrap();

    assert_eq!(params.time_points, 4);
    assert_eq!(params.interval, Duration::from_millis(1500));
    assert_eq!(params.step_timeout, Duration::from_millis(2500));
    assert!(!params.abort_on_delay);
    assert!(params.drift.is_some());
    assert_eq!(params.metadata_devices, vec!["probe".to_string()]);
}

#[tokio::test]
async fn test_configuration_assembles_and_validates() {
    let file = write_config(CONFIG);
    let config = AppConfig::load(file.path()).unwrap();

    let devices = DriverRegistry::with_mock_drivers()
        .assemble(&config.hardware)
        .await
        .unwrap();
    let params = config.acquisition.to_params(Arc::new(MemorySink::new())).unwrap();

    params.validate(&devices).unwrap();
}

#[test]
fn test_environment_overrides_file() {
    let file = write_config(CONFIG);
    std::env::set_var("SPIM_DAQ_APPLICATION__NAME", "from-env");
    std::env::set_var("SPIM_DAQ_ACQUISITION__SETTLE_DELAY_MS", "25");

    let loaded = AppConfig::load(file.path());

    std::env::remove_var("SPIM_DAQ_APPLICATION__NAME");
    std::env::remove_var("SPIM_DAQ_ACQUISITION__SETTLE_DELAY_MS");

    let config = loaded.unwrap();
    assert_eq!(config.application.name, "from-env");
    assert_eq!(config.acquisition.settle_delay_ms, 25);
}

#[test]
fn test_missing_hardware_section_is_a_load_error() {
    let file = write_config("[application]\nlog_level = \"info\"\n");
    let err = AppConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, AcquisitionError::ConfigLoad(_)), "{err}");
    assert!(err.is_configuration());
}

#[test]
fn test_bad_value_set_is_a_load_error() {
    let broken = CONFIG.replace("z = \"0:2:20\"", "z = \"0:0:20\"");
    let file = write_config(&broken);
    assert!(matches!(
        AppConfig::load(file.path()),
        Err(AcquisitionError::ConfigLoad(_))
    ));
}

#[test]
fn test_undeclared_metadata_device_rejected() {
    let broken = CONFIG.replace(
        "metadata_devices = [\"probe\"]",
        "metadata_devices = [\"thermo\"]",
    );
    let file = write_config(&broken);
    let err = AppConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, AcquisitionError::Configuration(_)));
    assert!(err.to_string().contains("thermo"));
}

#[test]
fn test_example_configuration_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/acquisition.example.toml");
    let config = AppConfig::load(path).unwrap();
    assert!(!config.acquisition.rows.is_empty());
}

#[test]
fn test_unrepresentable_interval_rejected() {
    for interval in ["inf", "nan", "-1.0", "1e300"] {
        let broken = CONFIG.replace(
            "interval_secs = 1.5",
            &format!("interval_secs = {interval}"),
        );
        let file = write_config(&broken);
        let err = AppConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, AcquisitionError::Configuration(_)), "{interval}: {err}");
        assert!(err.to_string().contains("interval_secs"), "{err}");

        let unchecked = AppConfig::load_from(file.path()).unwrap();
        assert!(unchecked
            .acquisition
            .to_params(Arc::new(MemorySink::new()))
            .is_err());
    }
}

#[test]
fn test_oversized_step_count_rejected() {
    let broken = CONFIG.replace("z = \"0:2:20\"", "z = \"0:1e-12:1e6\"");
    let file = write_config(&broken);
    assert!(matches!(
        AppConfig::load(file.path()),
        Err(AcquisitionError::ConfigLoad(_))
    ));
}
