use std::time::Duration;

use crate::logging::LogLevel;

pub const DEFAULT_MINIMUM_PACKAGE_AGE_HOURS: u64 = 24;
pub const DEFAULT_PRESCAN_TIMEOUT: Duration = Duration::from_secs(30);

const WRAPPER_FLAG_PREFIX: &str = "--safe-chain-";

/// Which registry family the wrapped command talks to. Selected once per
/// invocation from the child command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecosystem {
    Js,
    Py,
}

impl Ecosystem {
    pub fn for_command(command: &str) -> Ecosystem {
        let base = command
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(command)
            .to_ascii_lowercase();
        let base = base.strip_suffix(".exe").unwrap_or(&base);
        match base {
            "pip" | "pip3" | "uv" => Ecosystem::Py,
            _ => Ecosystem::Js,
        }
    }
}

/// Run-scoped configuration threaded through the proxy and orchestrator.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub ecosystem: Ecosystem,
    pub log_level: LogLevel,
    pub minimum_package_age_hours: u64,
    pub age_check_enabled: bool,
    pub exempt_packages: Vec<String>,
    pub include_python: bool,
    pub prescan_timeout: Duration,
    /// A corporate proxy from the caller's own environment, if any. Upstream
    /// replays tunnel through it.
    pub outer_proxy: Option<String>,
}

impl RunConfig {
    /// Split wrapper flags out of the raw argument list. Returns the
    /// configuration and the remaining child command. Wrapper flags match
    /// the `--safe-chain-` prefix case-insensitively; when a flag repeats,
    /// the last occurrence wins.
    pub fn from_args(args: &[String]) -> (RunConfig, Vec<String>) {
        let mut log_level = LogLevel::Silent;
        let mut minimum_package_age_hours = DEFAULT_MINIMUM_PACKAGE_AGE_HOURS;
        let mut age_check_enabled = true;
        let mut include_python = false;
        let mut child_command = Vec::new();

        for arg in args {
            let lowered = arg.to_ascii_lowercase();
            if let Some(flag) = lowered.strip_prefix(WRAPPER_FLAG_PREFIX) {
                if let Some(value) = flag.strip_prefix("logging=") {
                    if let Some(parsed) = LogLevel::parse(value) {
                        log_level = parsed;
                    }
                } else if flag == "skip-minimum-package-age" {
                    age_check_enabled = false;
                } else if let Some(value) = flag.strip_prefix("minimum-package-age-hours=") {
                    if let Ok(hours) = value.parse::<u64>() {
                        minimum_package_age_hours = hours;
                    }
                }
                // Unknown --safe-chain-* flags are stripped either way so
                // they never reach the child.
                continue;
            }
            if arg == "--include-python" {
                include_python = true;
                continue;
            }
            child_command.push(arg.clone());
        }

        let ecosystem = child_command
            .first()
            .map(|command| Ecosystem::for_command(command))
            .unwrap_or(Ecosystem::Js);

        let config = RunConfig {
            ecosystem,
            log_level,
            minimum_package_age_hours,
            age_check_enabled,
            exempt_packages: exempt_packages_from_env(),
            include_python,
            prescan_timeout: DEFAULT_PRESCAN_TIMEOUT,
            outer_proxy: outer_proxy_from_env(),
        };
        (config, child_command)
    }
}

fn exempt_packages_from_env() -> Vec<String> {
    match std::env::var("SAFE_CHAIN_EXEMPT_PACKAGES") {
        Ok(raw) => raw
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn outer_proxy_from_env() -> Option<String> {
    for name in ["HTTPS_PROXY", "https_proxy"] {
        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}
