use tether_config::{ConfigWarning, TetherConfig};

#[test]
fn reports_unknown_keys_with_full_paths() {
    let text = r#"
        [debugger]
        stop_timeout = 5000
        threads_refresh_delay_ms = 0

        [hot_swap]
        chunk = 10
    "#;

    let (config, diagnostics) = TetherConfig::load_from_str_with_diagnostics(text).unwrap();
    assert_eq!(
        diagnostics.unknown_keys,
        vec!["debugger.stop_timeout".to_string(), "hot_swap.chunk".to_string()]
    );
    assert!(diagnostics.warnings.is_empty());
    assert_eq!(config.debugger.threads_refresh_delay_ms, 0);
    assert_eq!(config.debugger.stop_timeout_ms, 10_000);
}

#[test]
fn zero_values_are_reported_and_replaced_by_defaults() {
    let text = r#"
        [debugger]
        stop_timeout_ms = 0
        suspend_poll_interval_ms = 0

        [hot_swap]
        redefinition_chunk_size = 0
    "#;

    let (config, diagnostics) = TetherConfig::load_from_str_with_diagnostics(text).unwrap();
    let paths: Vec<_> = diagnostics
        .warnings
        .iter()
        .filter_map(|warning| match warning {
            ConfigWarning::InvalidValue { toml_path, .. } => Some(toml_path.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        paths,
        vec![
            "debugger.stop_timeout_ms",
            "debugger.suspend_poll_interval_ms",
            "hot_swap.redefinition_chunk_size",
        ]
    );
    assert_eq!(config.debugger.stop_timeout_ms, 10_000);
    assert_eq!(config.debugger.suspend_poll_interval_ms, 10);
    assert_eq!(config.hot_swap.redefinition_chunk_size, 100);
}

#[test]
fn invalid_logging_level_is_a_warning() {
    let (_config, diagnostics) =
        TetherConfig::load_from_str_with_diagnostics("[logging]\nlevel = \"tether=verbose\"\n")
            .unwrap();
    assert!(matches!(
        diagnostics.warnings.as_slice(),
        [ConfigWarning::LoggingLevelInvalid { .. }]
    ));
}

#[test]
fn type_errors_fail_to_load() {
    let err = TetherConfig::load_from_str_with_diagnostics("[hot_swap]\nredefinition_chunk_size = \"many\"\n")
        .unwrap_err();
    assert!(err.to_string().starts_with("failed to parse toml config"), "{err}");
}
