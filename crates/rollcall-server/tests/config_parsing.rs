use std::{env, fs};

use rollcall_server::RedisMode;
use rollcall_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("rollcall.toml");

    let toml_content = r#"
[proxy]
id = "eu-west-1"
online_mode = false

[redis]
mode = "cluster"
cluster_nodes = ["redis://10.0.0.1:7000", "redis://10.0.0.2:7000"]
pool_size = 4
retry_backoff_ms = 100

[presence]
heartbeat_interval_secs = 2
staleness_secs = 10

[identity]
authority_url = "http://authority.internal"

[logging]
level = "debug"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses, unset sections fall back to defaults
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.proxy.id, "eu-west-1");
    assert!(!cfg.proxy.online_mode);
    assert_eq!(cfg.redis.mode, RedisMode::Cluster);
    assert_eq!(cfg.redis.cluster_nodes.len(), 2);
    assert_eq!(cfg.redis.pubsub_url(), Some("redis://10.0.0.1:7000"));
    assert_eq!(cfg.redis.pool_size, 4);
    assert_eq!(cfg.presence.heartbeat_interval_secs, 2);
    assert_eq!(cfg.presence.staleness_secs, 10);
    assert_eq!(cfg.identity.authority_url, "http://authority.internal");
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");
    assert!(!cfg.metrics.enabled);

    // 2) Env override should win over file
    unsafe {
        env::set_var("ROLLCALL__PRESENCE__SWEEP_INTERVAL_SECS", "7");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.presence.sweep_interval_secs, 7);
    unsafe {
        env::remove_var("ROLLCALL__PRESENCE__SWEEP_INTERVAL_SECS");
    }

    // 3) Staleness must cover several heartbeats
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[presence]
heartbeat_interval_secs = 10
staleness_secs = 5
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.to_string().contains("staleness"));

    // 4) Cluster mode without seed nodes is rejected
    let no_nodes = dir.path().join("no_nodes.toml");
    fs::write(&no_nodes, "[redis]\nmode = \"cluster\"\n").expect("write toml");
    let err = load_config(no_nodes.to_str()).expect_err("expected validation error");
    assert!(err.to_string().contains("cluster_nodes"));
}

#[test]
fn missing_file_uses_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");
    let cfg = load_config(path.to_str()).expect("defaults are valid");
    assert_eq!(cfg.redis.mode, RedisMode::Single);
    assert_eq!(cfg.redis.url, "redis://localhost:6379");
    assert!(cfg.proxy.online_mode);
    assert_eq!(cfg.identity.cache_ttl_secs, 259_200);
}
