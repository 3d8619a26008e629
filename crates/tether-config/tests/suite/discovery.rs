use std::ffi::OsString;

use tempfile::tempdir;
use tether_config::{
    discover_config_path, load_for_workspace, with_config_env_lock, TetherConfig,
    TETHER_CONFIG_ENV_VAR,
};

struct EnvVarGuard {
    key: &'static str,
    prev: Option<OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &std::path::Path) -> Self {
        let prev = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, prev }
    }

    fn unset(key: &'static str) -> Self {
        let prev = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

#[test]
fn discovers_tether_toml_in_workspace_root() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(TETHER_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("tether.toml");
        std::fs::write(&config_path, "[debugger]\nstop_timeout_ms = 2500\n").unwrap();

        let discovered = discover_config_path(dir.path()).expect("tether.toml should be found");
        assert_eq!(discovered, config_path.canonicalize().unwrap_or(config_path));

        let (config, path) = load_for_workspace(dir.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.debugger.stop_timeout_ms, 2500);
    });
}

#[test]
fn falls_back_to_dot_tether_directory() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(TETHER_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".tether")).unwrap();
        std::fs::write(dir.path().join(".tether/config.toml"), "").unwrap();

        let discovered = discover_config_path(dir.path()).unwrap();
        assert!(discovered.ends_with(".tether/config.toml"), "{discovered:?}");
    });
}

#[test]
fn env_var_overrides_discovery() {
    with_config_env_lock(|| {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("tether.toml"), "").unwrap();
        let custom = dir.path().join("custom.toml");
        std::fs::write(&custom, "[hot_swap]\nredefinition_chunk_size = 7\n").unwrap();
        let _env = EnvVarGuard::set(TETHER_CONFIG_ENV_VAR, &custom);

        let (config, path) = load_for_workspace(dir.path()).unwrap();
        assert_eq!(path, Some(custom.canonicalize().unwrap_or(custom)));
        assert_eq!(config.hot_swap.redefinition_chunk_size, 7);
    });
}

#[test]
fn missing_config_yields_defaults() {
    with_config_env_lock(|| {
        let _env = EnvVarGuard::unset(TETHER_CONFIG_ENV_VAR);
        let dir = tempdir().unwrap();
        let (config, path) = load_for_workspace(dir.path()).unwrap();
        assert_eq!(path, None);
        assert_eq!(config, TetherConfig::default());
    });
}

#[test]
fn unreadable_path_is_an_io_error() {
    let dir = tempdir().unwrap();
    let err = TetherConfig::load_from_path(dir.path().join("missing.toml")).unwrap_err();
    assert!(err.to_string().contains("missing.toml"), "{err}");
}
