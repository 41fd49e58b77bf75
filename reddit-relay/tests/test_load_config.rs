use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

use reddit_relay::load_config::{load_config, Secrets, CONSTRAINED_HOST, DEFAULT_USER_AGENT};

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

#[test]
#[serial]
fn yaml_sections_override_defaults() {
    env::remove_var(CONSTRAINED_HOST);
    let file = config_file(
        r#"
database_path: ./tmp/relay.db
scheduler:
  max_concurrent_cycles: 2
lifecycle:
  approval_timeout_secs: 3600
  per_rule_processing_limit: 3
pipeline:
  max_concurrent_jobs: 4
  work_dir: ./tmp/work
  encode_timeout_secs: 120
delivery:
  attempts: 5
"#,
    );

    let config = load_config(file.path()).expect("config should load");

    assert_eq!(config.database_path, PathBuf::from("./tmp/relay.db"));
    assert_eq!(config.scheduler.max_concurrent_cycles, 2);
    assert_eq!(config.scheduler.degraded_after_failures, 3);
    assert_eq!(config.lifecycle.approval_timeout, Duration::from_secs(3600));
    assert_eq!(config.lifecycle.per_rule_processing_limit, 3);
    assert_eq!(config.pipeline.max_concurrent_jobs, 4);
    assert_eq!(config.pipeline.work_dir, PathBuf::from("./tmp/work"));
    assert_eq!(config.pipeline.encode_timeout, Duration::from_secs(120));
    assert_eq!(config.delivery.attempts, 5);
    assert!(!config.constrained_host);
}

#[test]
#[serial]
fn empty_file_gives_the_defaults() {
    env::remove_var(CONSTRAINED_HOST);
    let file = config_file("");
    let config = load_config(file.path()).unwrap();
    assert_eq!(config.database_path, PathBuf::from("./data/relay.db"));
    assert_eq!(config.pipeline.max_concurrent_jobs, 2);
}

#[test]
#[serial]
fn constrained_host_env_applies_the_low_power_preset() {
    let file = config_file("pipeline:\n  max_concurrent_jobs: 4\n  encode_timeout_secs: 100\n");
    env::set_var(CONSTRAINED_HOST, "true");
    let config = load_config(file.path());
    env::remove_var(CONSTRAINED_HOST);

    let config = config.unwrap();
    assert!(config.constrained_host);
    assert_eq!(config.pipeline.max_concurrent_jobs, 1);
    assert_eq!(config.pipeline.encode_timeout, Duration::from_secs(200));
    assert_eq!(config.pipeline.encoder_preset, "ultrafast");
}

#[test]
#[serial]
fn unreadable_or_invalid_files_are_reported() {
    let missing = load_config("/definitely/not/here.yaml").unwrap_err();
    assert!(missing.to_string().contains("Failed to read config file"));

    let file = config_file("scheduler: [not, a, map]\n");
    let invalid = load_config(file.path()).unwrap_err();
    assert!(invalid.to_string().contains("Failed to parse config YAML"));
}

#[test]
#[serial]
fn zero_sweep_interval_is_rejected() {
    env::remove_var(CONSTRAINED_HOST);
    let file = config_file("lifecycle:\n  sweep_interval_secs: 0\n");
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("Invalid config file"));
    assert!(err.to_string().contains("lifecycle.sweep_interval_secs"));

    let file = config_file("pipeline:\n  download_attempts: 0\n");
    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("pipeline.download_attempts"));
}

#[test]
#[serial]
fn secrets_come_from_the_environment() {
    env::set_var("TELEGRAM_BOT_TOKEN", "123:abc");
    env::set_var("REDDIT_CLIENT_ID", "client");
    env::set_var("REDDIT_CLIENT_SECRET", "shh");
    env::remove_var("REDDIT_USER_AGENT");

    let secrets = Secrets::from_env().expect("all secrets set");
    assert_eq!(secrets.telegram_bot_token, "123:abc");
    assert_eq!(secrets.reddit_user_agent, DEFAULT_USER_AGENT);
    assert!(!format!("{secrets:?}").contains("shh"));

    env::remove_var("REDDIT_CLIENT_SECRET");
    let err = Secrets::from_env().unwrap_err();
    assert!(err.to_string().contains("REDDIT_CLIENT_SECRET"));

    env::remove_var("TELEGRAM_BOT_TOKEN");
    env::remove_var("REDDIT_CLIENT_ID");
}
