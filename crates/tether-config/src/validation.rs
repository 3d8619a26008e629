use crate::diagnostics::ConfigWarning;
use crate::{DebuggerConfig, HotSwapConfig, LoggingConfig, TetherConfig};

impl TetherConfig {
    /// Report values that cannot be used as configured.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        validate_logging(&self.logging, &mut out);
        validate_debugger(&self.debugger, &mut out);
        validate_hot_swap(&self.hot_swap, &mut out);
        out
    }

    /// Replace every value [`TetherConfig::validate`] would warn about with
    /// its default.
    pub fn normalize(&mut self) {
        let defaults = DebuggerConfig::default();
        let debugger = &mut self.debugger;
        if debugger.stop_timeout_ms == 0 {
            debugger.stop_timeout_ms = defaults.stop_timeout_ms;
        }
        if debugger.suspend_poll_interval_ms == 0 {
            debugger.suspend_poll_interval_ms = defaults.suspend_poll_interval_ms;
        }
        if debugger.suspend_poll_max_attempts == 0 {
            debugger.suspend_poll_max_attempts = defaults.suspend_poll_max_attempts;
        }
        debugger
            .dispatch_thread_prefixes
            .retain(|prefix| !prefix.trim().is_empty());

        if self.hot_swap.redefinition_chunk_size == 0 {
            self.hot_swap.redefinition_chunk_size =
                HotSwapConfig::default().redefinition_chunk_size;
        }
        if self.logging.buffer_lines == 0 {
            self.logging.buffer_lines = LoggingConfig::default().buffer_lines;
        }
    }
}

fn invalid(out: &mut Vec<ConfigWarning>, toml_path: &str, message: &str) {
    out.push(ConfigWarning::InvalidValue {
        toml_path: toml_path.to_string(),
        message: message.to_string(),
    });
}

fn validate_logging(logging: &LoggingConfig, out: &mut Vec<ConfigWarning>) {
    let normalized = LoggingConfig::normalize_level_directives(&logging.level);
    if !logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.push(ConfigWarning::LoggingLevelInvalid {
            value: logging.level.clone(),
            normalized,
        });
    }
    if logging.buffer_lines == 0 {
        invalid(out, "logging.buffer_lines", "must be >= 1");
    }
}

fn validate_debugger(debugger: &DebuggerConfig, out: &mut Vec<ConfigWarning>) {
    if debugger.stop_timeout_ms == 0 {
        invalid(out, "debugger.stop_timeout_ms", "must be >= 1");
    }
    if debugger.suspend_poll_interval_ms == 0 {
        invalid(out, "debugger.suspend_poll_interval_ms", "must be >= 1");
    }
    if debugger.suspend_poll_max_attempts == 0 {
        invalid(out, "debugger.suspend_poll_max_attempts", "must be >= 1");
    }
    for (idx, prefix) in debugger.dispatch_thread_prefixes.iter().enumerate() {
        if prefix.trim().is_empty() {
            invalid(
                out,
                &format!("debugger.dispatch_thread_prefixes[{idx}]"),
                "must not be empty",
            );
        }
    }
}

fn validate_hot_swap(hot_swap: &HotSwapConfig, out: &mut Vec<ConfigWarning>) {
    if hot_swap.redefinition_chunk_size == 0 {
        invalid(out, "hot_swap.redefinition_chunk_size", "must be >= 1");
    }
}
