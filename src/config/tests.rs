use super::settings::Settings;
use super::{load_config, load_config_from};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.url(), "ws://127.0.0.1:8080");
    assert_eq!(settings.broker.prefetch, 1);
    assert_eq!(settings.broker.data_dir, None);
    assert!(settings.broker.sync_writes);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn load_config_without_sources_yields_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let missing = tmp.path().join("config").join("default");

    // An explicit path that is absent is an error, the implicit one is not.
    assert!(load_config_from(Some(missing.to_str().unwrap())).is_err());

    temp_env::with_vars_unset(["POPQ_SERVER__PORT", "POPQ_BROKER__PREFETCH"], || {
        let cfg = load_config().expect("load_config failed");
        assert_eq!(cfg.broker.prefetch, Settings::default().broker.prefetch);
    });
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("popq.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [broker]
        prefetch = 4
        data_dir = "/var/lib/popq"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(Some(path.to_str().unwrap())).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.broker.prefetch, 4);
    assert_eq!(cfg.broker.data_dir.as_deref(), Some("/var/lib/popq"));
    // untouched keys keep their defaults
    assert!(cfg.broker.sync_writes);
    assert_eq!(cfg.logging.level, "info");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("popq.toml");
    fs::write(&path, "[server]\nport = 9000\n").expect("write config file");

    temp_env::with_vars(
        [
            ("POPQ_SERVER__PORT", Some("9100")),
            ("POPQ_LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let cfg = load_config_from(Some(path.to_str().unwrap())).expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.logging.level, "debug");
        },
    );
}
