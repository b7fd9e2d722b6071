use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use agrovision_kiosk::config::{EngineBackend, KioskConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "AGROVISION_CONFIG",
        "AGROVISION_DB_PATH",
        "AGROVISION_SOURCE",
        "AGROVISION_TEXT_MODEL",
        "AGROVISION_CLASSIFIER_MODEL",
        "AGROVISION_CONFIRM_FRAMES",
        "AGROVISION_DETECT_THRESHOLD",
        "AGROVISION_RETENTION_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "kiosk_prod.db",
        "source": { "location": "/dev/video2", "target_fps": 15 },
        "engines": {
            "classifier": { "labels": ["tomato", "onion"] }
        },
        "fusion": {
            "confirm_frames": 4,
            "detect_threshold": 0.75,
            "window_ms": 1000,
            "window_capacity": 10
        },
        "timeouts": { "text_ms": 500, "classifier_ms": 250 },
        "lighting": { "min_luminance": 30.0 },
        "retention": { "seconds": 43200 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("AGROVISION_CONFIG", file.path());
    std::env::set_var("AGROVISION_SOURCE", "stub://counter");
    std::env::set_var("AGROVISION_RETENTION_SECS", "86400");

    let cfg = KioskConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "kiosk_prod.db");
    assert_eq!(cfg.source.location, "stub://counter");
    assert_eq!(cfg.source.target_fps, 15);
    assert_eq!(cfg.classifier_engine.backend, EngineBackend::Stub);
    assert_eq!(cfg.classifier_engine.labels, vec!["tomato", "onion"]);
    assert_eq!(cfg.fusion.required_agreeing, 4);
    assert!((cfg.fusion.detect_threshold - 0.75).abs() < f32::EPSILON);
    assert_eq!(cfg.fusion.window_max_age, Duration::from_millis(1000));
    assert_eq!(cfg.fusion.window_capacity, 10);
    assert_eq!(cfg.fusion.cooldown, Duration::from_millis(1000));
    assert_eq!(cfg.text_timeout, Duration::from_millis(500));
    assert_eq!(cfg.classifier_timeout, Duration::from_millis(250));
    assert!((cfg.min_luminance - 30.0).abs() < f32::EPSILON);
    assert_eq!(cfg.retention.as_secs(), 86400);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
db_path = "kiosk.db"
catalog_path = "/etc/agrovision/catalog.json"

[engines.text]
backend = "disabled"

[store]
retry_backoff_ms = 50
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("AGROVISION_CONFIG", file.path());

    let cfg = KioskConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "kiosk.db");
    assert_eq!(
        cfg.catalog_path.as_deref(),
        Some(std::path::Path::new("/etc/agrovision/catalog.json"))
    );
    assert_eq!(cfg.text_engine.backend, EngineBackend::Disabled);
    assert_eq!(cfg.store_retry_backoff, Duration::from_millis(50));

    clear_env();
}

#[test]
fn rejects_window_smaller_than_confirmation_count() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "fusion": { "confirm_frames": 5, "window_capacity": 3 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("AGROVISION_CONFIG", file.path());

    let err = KioskConfig::load().expect_err("window too small");
    assert!(err.to_string().contains("window_capacity"));

    clear_env();
}

#[test]
fn rejects_invalid_env_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AGROVISION_DETECT_THRESHOLD", "very");
    assert!(KioskConfig::load().is_err());

    std::env::set_var("AGROVISION_DETECT_THRESHOLD", "1.5");
    let err = KioskConfig::load().expect_err("threshold out of range");
    assert!(err.to_string().contains("detect_threshold"));

    clear_env();
}

#[test]
fn tract_model_env_requires_labels() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("AGROVISION_CLASSIFIER_MODEL", "/models/items.onnx");
    let err = KioskConfig::load().expect_err("tract classifier without labels");
    assert!(err.to_string().contains("labels"));

    clear_env();
}
