use fdmlink_core::MachineFamily;
use fdmlink_settings::{Config, SettingsError};

#[test]
fn test_toml_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let mut config = Config::new();
    config.connection.port = "/dev/ttyACM0".to_string();
    config.connection.baud_rate = 115200;
    config.streaming.window_capacity = 96;
    config.motion.park_command = "G28 X0".to_string();
    config.machine.family = Some("bcn3dsigmax".to_string());
    config.save_to_file(&path).unwrap();

    let loaded = Config::load_from_file(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.machine.family(), Some(MachineFamily::SigmaX));
}

#[test]
fn test_json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let mut config = Config::new();
    config.firmware.isp_settle_ms = 250;
    config.save_to_file(&path).unwrap();
    assert_eq!(Config::load_from_file(&path).unwrap(), config);
}

#[test]
fn test_partial_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[connection]\nport = \"COM4\"\n\n[streaming]\nprime_lines = 8\n",
    )
    .unwrap();

    let config = Config::load_from_file(&path).unwrap();
    assert_eq!(config.connection.port, "COM4");
    assert_eq!(config.connection.baud_rate, 250000);
    assert_eq!(config.streaming.prime_lines, 8);
    assert_eq!(config.streaming.window_capacity, 128);
    assert_eq!(config.motion.finish_command, "M605 S3");
}

#[test]
fn test_invalid_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[streaming]\nwindow_capacity = 4\n").unwrap();
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::Config(_))
    ));

    std::fs::write(&path, "[streaming\n").unwrap();
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::TomlError(_))
    ));
}

#[test]
fn test_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, Config::default());
}
