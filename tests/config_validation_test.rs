//! Station configuration loading and validation.

use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;
use volume_station::config::StationConfig;
use volume_station::StationError;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_bundled_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/station.toml");
    let config = StationConfig::load_validated(path).unwrap();
    assert_eq!(config.devices.camera.name, "fake");
    assert!(config.devices.scales.is_some());
    assert_eq!(config.http.bind_address(), "0.0.0.0:8080");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config("[http]\nport = 9090\n\n[algorithm]\nrequired_sample_count = 3\n");

    std::env::set_var("VOLUME_STATION_HTTP__PORT", "9191");
    let result = StationConfig::load_validated(file.path());
    std::env::remove_var("VOLUME_STATION_HTTP__PORT");

    let config = result.unwrap();
    assert_eq!(config.http.port, 9191);
    assert_eq!(config.algorithm.required_sample_count, 3);
}

#[test]
#[serial]
fn test_empty_file_uses_defaults() {
    let file = write_config("");
    let config = StationConfig::load_validated(file.path()).unwrap();
    assert_eq!(config.http.request_timeout_ms, 15_000);
    assert_eq!(config.algorithm.required_sample_count, 5);
    assert!(config.devices.scanners.is_empty());
    assert!(config.devices.io_circuit.is_none());
}

#[test]
#[serial]
fn test_malformed_file_is_rejected() {
    let file = write_config("[http]\nport = \"not a port\"\n");
    let err = StationConfig::load_from(file.path()).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[logging]\nlevel = \"chatty\"\n",
        "[logging]\nformat = \"xml\"\n",
        "[devices]\ncamera_fps = 0.0\n",
        "[algorithm]\npallet_weight_g = -5.0\n",
        "[algorithm]\nframe_timeout_ms = 0\n",
        "[http]\nlogin = \"operator\"\n",
        "[devices.scales]\nname = \"casm\"\nport = \"/dev/ttyS0\"\nsettings = { min_weight_g = -2 }\n",
    ];
    for contents in cases {
        let file = write_config(contents);
        let err = StationConfig::load_validated(file.path()).unwrap_err();
        assert!(
            matches!(err, StationError::Configuration(_)),
            "expected a validation error for {contents:?}, got {err}"
        );
    }
}
