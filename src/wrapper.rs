use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;

use crate::audit::{audit_changes, counters_snapshot, DisallowedChange, PackageChange};
use crate::certs::{CaPaths, CertificateAuthority};
use crate::child_env::{build_child_env, ChildEnv};
use crate::config::RunConfig;
use crate::log;
use crate::logging::{self, LogLevel};
use crate::oracle::{DatasetOracle, MalwareOracle};
use crate::proxy::controller::ProxyController;
use crate::proxy::server::{OuterProxy, ProxyShared, UpstreamConnector};
use crate::registry::npm::npm_interceptor;
use crate::registry::pypi::pypi_interceptor;
use crate::registry::Router;
use crate::rewriter::AgePolicy;

/// Predicts the dependency changes a package-manager command will make.
/// Implementations live with the individual package managers; the built-in
/// default supports no commands, which skips the pre-scan.
pub trait DependencyResolver: Send + Sync {
    fn is_supported_command(&self, command: &[String]) -> bool;
    fn dependency_updates(
        &self,
        command: &[String],
    ) -> Result<Vec<PackageChange>, Box<dyn std::error::Error + Send + Sync>>;
}

pub struct NoopResolver;

impl DependencyResolver for NoopResolver {
    fn is_supported_command(&self, _command: &[String]) -> bool {
        false
    }

    fn dependency_updates(
        &self,
        _command: &[String],
    ) -> Result<Vec<PackageChange>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Vec::new())
    }
}

/// Entry point: split the arguments, stand up the guard, run the child.
pub async fn run(args: Vec<String>) -> i32 {
    let (config, child_command) = RunConfig::from_args(&args);
    logging::set_level(config.log_level);

    if child_command.is_empty() {
        logging::always(
            "Usage: safe-chain [--safe-chain-logging=<silent|normal|verbose>] <command> [args...]"
                .to_string(),
        );
        return 1;
    }

    let wrapper = match Wrapper::new(config) {
        Ok(wrapper) => wrapper,
        Err(error) => {
            logging::always(format!("safe-chain failed to start: {}", error));
            return 1;
        }
    };
    wrapper.run(child_command).await
}

enum Prescan {
    NotSupported,
    Clean,
    Disallowed(Vec<DisallowedChange>),
    Fatal(String),
}

pub struct Wrapper {
    config: RunConfig,
    oracle: Arc<dyn MalwareOracle>,
    resolver: Arc<dyn DependencyResolver>,
    ca_paths: CaPaths,
}

impl Wrapper {
    pub fn new(config: RunConfig) -> Result<Wrapper, Box<dyn std::error::Error>> {
        let ca_paths = CaPaths::default_user_paths()
            .ok_or("could not determine the user's home directory")?;
        let oracle = load_oracle()?;
        Ok(Wrapper {
            config,
            oracle: Arc::new(oracle),
            resolver: Arc::new(NoopResolver),
            ca_paths,
        })
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn MalwareOracle>) -> Wrapper {
        self.oracle = oracle;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Wrapper {
        self.resolver = resolver;
        self
    }

    pub fn with_ca_paths(mut self, ca_paths: CaPaths) -> Wrapper {
        self.ca_paths = ca_paths;
        self
    }

    pub async fn run(&self, child_command: Vec<String>) -> i32 {
        let certs = match CertificateAuthority::ensure_root(self.ca_paths.clone()) {
            Ok(certs) => Arc::new(certs),
            Err(error) => {
                logging::always(format!("Certificate authority unavailable: {}", error));
                return 1;
            }
        };
        let bundle = match certs.write_combined_bundle() {
            Ok(path) => path,
            Err(error) => {
                logging::always(format!("Could not write the CA bundle: {}", error));
                return 1;
            }
        };

        let mut controller = ProxyController::new();
        let state = controller.state();
        let router = Router::new(
            self.config.ecosystem,
            npm_interceptor(Arc::clone(&self.oracle), self.age_policy(), state.clone()),
            pypi_interceptor(Arc::clone(&self.oracle), state.clone()),
        );
        let outer_proxy = self
            .config
            .outer_proxy
            .as_deref()
            .and_then(OuterProxy::parse);
        let shared = Arc::new(ProxyShared {
            router,
            certs: Arc::clone(&certs),
            upstream: UpstreamConnector::new(outer_proxy),
        });

        if let Err(error) = controller.start(shared).await {
            logging::always(format!("Could not start the proxy: {}", error));
            return 1;
        }

        let exit_code = self
            .guarded_run(&controller, &certs, &bundle, &child_command)
            .await;

        // Cleanup runs regardless of how the guarded section went.
        controller.stop().await;
        exit_code
    }

    async fn guarded_run(
        &self,
        controller: &ProxyController,
        certs: &CertificateAuthority,
        bundle: &Path,
        child_command: &[String],
    ) -> i32 {
        match self.prescan(child_command).await {
            Prescan::Disallowed(disallowed) => {
                logging::always("Refusing to continue; these changes are malicious:".to_string());
                for entry in &disallowed {
                    logging::always(format!(
                        "  {}@{} ({})",
                        entry.change.name, entry.change.version, entry.reason
                    ));
                }
                return 1;
            }
            Prescan::Fatal(reason) => {
                logging::always(format!("Dependency scan failed: {}", reason));
                return 1;
            }
            Prescan::NotSupported | Prescan::Clean => {}
        }

        let proxy_url = controller.proxy_url().unwrap_or_default();
        let parent_env: Vec<(String, String)> = std::env::vars().collect();
        let child_env = match build_child_env(
            &parent_env,
            &proxy_url,
            certs.cert_path(),
            bundle,
            self.config.ecosystem,
        ) {
            Ok(env) => env,
            Err(error) => {
                logging::always(format!("Could not prepare the child environment: {}", error));
                return 1;
            }
        };

        logging::set_buffered(true);
        let child_result = run_child(child_command, &child_env).await;
        logging::set_buffered(false);
        drop(child_env);

        let child_code = match child_result {
            Ok(code) => code,
            Err(error) => {
                logging::always(format!("Failed to run {}: {}", child_command[0], error));
                1
            }
        };

        let proxy_blocked = !controller.verify_no_malicious_packages();
        if !proxy_blocked {
            let counters = counters_snapshot();
            log!(
                LogLevel::Normal,
                "Audited {} package change(s): {} safe, {} malicious",
                counters.total,
                counters.safe,
                counters.malware
            );
            if controller.has_suppressed_versions() {
                log!(
                    LogLevel::Normal,
                    "Some versions newer than {} hours were hidden by the package age policy",
                    self.config.minimum_package_age_hours
                );
            }
        }
        compute_exit_code(false, false, proxy_blocked, child_code)
    }

    async fn prescan(&self, command: &[String]) -> Prescan {
        if !self.resolver.is_supported_command(command) {
            return Prescan::NotSupported;
        }
        let resolver = Arc::clone(&self.resolver);
        let command = command.to_vec();
        let updates = tokio::time::timeout(
            self.config.prescan_timeout,
            tokio::task::spawn_blocking(move || resolver.dependency_updates(&command)),
        )
        .await;
        match updates {
            Err(_) => Prescan::Fatal("dependency update scan timed out".to_string()),
            Ok(Err(join_error)) => {
                Prescan::Fatal(format!("dependency update scan crashed: {}", join_error))
            }
            Ok(Ok(Err(error))) => Prescan::Fatal(error.to_string()),
            Ok(Ok(Ok(changes))) => {
                let result = audit_changes(self.oracle.as_ref(), &changes);
                if result.is_allowed() {
                    Prescan::Clean
                } else {
                    Prescan::Disallowed(result.disallowed)
                }
            }
        }
    }

    fn age_policy(&self) -> Option<AgePolicy> {
        if !self.config.age_check_enabled {
            return None;
        }
        Some(AgePolicy {
            minimum_age_hours: self.config.minimum_package_age_hours,
            exempt_packages: self.config.exempt_packages.clone(),
        })
    }
}

/// Final-exit precedence: fatal paths return earlier, pre-scan failures
/// beat proxy blocks, proxy blocks beat the child's own status.
pub(crate) fn compute_exit_code(
    prescan_disallowed: bool,
    prescan_timed_out: bool,
    proxy_blocked: bool,
    child_status: i32,
) -> i32 {
    if prescan_disallowed || prescan_timed_out || proxy_blocked {
        return 1;
    }
    child_status
}

async fn run_child(command: &[String], env: &ChildEnv) -> std::io::Result<i32> {
    let mut child = Command::new(&command[0]);
    child.args(&command[1..]);
    child.env_clear();
    for (name, value) in env.vars() {
        child.env(name, value);
    }
    let mut running = child.spawn()?;

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    loop {
        #[cfg(unix)]
        {
            let term_signal = async {
                match terminate.as_mut() {
                    Some(signal) => {
                        signal.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                status = running.wait() => return Ok(exit_code(status?)),
                _ = tokio::signal::ctrl_c() => logging::flush(),
                _ = term_signal => logging::flush(),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                status = running.wait() => return Ok(exit_code(status?)),
                _ = tokio::signal::ctrl_c() => logging::flush(),
            }
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    // A signal death maps onto the generic failure code.
    status.code().unwrap_or(1)
}

fn load_oracle() -> Result<DatasetOracle, Box<dyn std::error::Error>> {
    let path = std::env::var("SAFE_CHAIN_MALWARE_DB")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|home| home.join(".safe-chain").join("malware-db.json")));
    match path {
        Some(path) if path.exists() => Ok(DatasetOracle::load(&path)?),
        _ => {
            log!(
                LogLevel::Normal,
                "No malware database found; auditing against an empty set"
            );
            Ok(DatasetOracle::new())
        }
    }
}
