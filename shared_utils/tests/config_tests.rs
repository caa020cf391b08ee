use shared_utils::config::{
    Config, ConfigError, ConfigManager, InstanceMode, OffloadMode, Topology, DEFAULT_ROUTE_METRIC,
};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_server_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        log_level = "debug"

        [dco]
        offload = "required"
        control_node = "/run/coentro/dco.sock"
        module_paths = ["/sys/module/ovpn"]
        route_metric = 100

        [tunnel]
        mode = "server"
        topology = "subnet"
        data_ciphers = ["AES-128-GCM"]
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.log_level, "debug");
    assert_eq!(config.dco.offload, OffloadMode::Required);
    assert_eq!(config.dco.control_node, "/run/coentro/dco.sock");
    assert_eq!(config.dco.module_paths, vec!["/sys/module/ovpn".to_string()]);
    assert_eq!(config.dco.route_metric, 100);
    assert_eq!(config.tunnel.mode, InstanceMode::Server);
    assert_eq!(config.tunnel.topology, Topology::Subnet);
    assert_eq!(config.tunnel.data_ciphers, vec!["AES-128-GCM".to_string()]);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = NamedTempFile::new().unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.dco.offload, OffloadMode::Auto);
    assert_eq!(config.dco.route_metric, DEFAULT_ROUTE_METRIC);
    assert_eq!(config.tunnel.dev_type, "tun");
    assert_eq!(config.tunnel.fragment, None);
}

#[test]
fn test_invalid_offload_mode() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[dco]\noffload = \"sometimes\"\n").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_invalid_max_payload() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"[dco]\nmax_payload = 0\n").unwrap();

    let result = Config::load(file.path());
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dco.toml");

    let mut config = Config::default();
    config.tunnel.compression = true;
    config.tunnel.http_proxy = Some("proxy.example:3128".to_string());
    config.save(&path).unwrap();

    let mut manager = ConfigManager::load(&path).unwrap();
    assert!(manager.config().tunnel.compression);
    assert_eq!(manager.config_path(), path.as_path());

    manager.config_mut().tunnel.compression = false;
    manager.save().unwrap();
    manager.config_mut().tunnel.compression = true;
    manager.reload().unwrap();

    assert!(!manager.config().tunnel.compression);
    assert_eq!(
        manager.config().tunnel.http_proxy.as_deref(),
        Some("proxy.example:3128")
    );
}
