use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::interceptor::{InterceptEvents, MalwareBlocked};
use crate::log;
use crate::logging::{self, LogLevel};
use crate::proxy::server::{handle_client, ProxyShared};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// One blocked download, as reported to the user at the end of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRequest {
    pub package_name: String,
    pub version: String,
    pub url: String,
}

/// Aggregate run state fed by interception events. Single writer per event
/// through the mutex; read once at shutdown.
#[derive(Default)]
pub struct ProxyState {
    blocked: Mutex<Vec<BlockedRequest>>,
    suppressed: AtomicBool,
}

impl ProxyState {
    pub fn blocked_requests(&self) -> Vec<BlockedRequest> {
        self.blocked.lock().map(|list| list.clone()).unwrap_or_default()
    }

    pub fn has_suppressed_versions(&self) -> bool {
        self.suppressed.load(Ordering::Acquire)
    }
}

impl InterceptEvents for ProxyState {
    fn malware_blocked(&self, event: MalwareBlocked) {
        log!(
            LogLevel::Verbose,
            "Blocked {}@{} ({})",
            event.package_name,
            event.version,
            event.target_url
        );
        if let Ok(mut blocked) = self.blocked.lock() {
            blocked.push(BlockedRequest {
                package_name: event.package_name,
                version: event.version,
                url: event.target_url,
            });
        }
    }

    fn versions_suppressed(&self) {
        self.suppressed.store(true, Ordering::Release);
    }
}

/// Owns the listening socket and the accept loop. The proxy binds to an
/// OS-assigned loopback port; only the wrapped child is expected to use it.
pub struct ProxyController {
    state: Arc<ProxyState>,
    port: Option<u16>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl ProxyController {
    pub fn new() -> ProxyController {
        ProxyController {
            state: Arc::new(ProxyState::default()),
            port: None,
            shutdown: None,
            accept_task: None,
        }
    }

    pub fn state(&self) -> Arc<ProxyState> {
        Arc::clone(&self.state)
    }

    pub fn proxy_url(&self) -> Option<String> {
        self.port.map(|port| format!("http://localhost:{}", port))
    }

    /// Bind the loopback listener and start accepting connections.
    pub async fn start(&mut self, shared: Arc<ProxyShared>) -> std::io::Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        self.port = Some(port);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let shared = Arc::clone(&shared);
                                tokio::spawn(async move {
                                    handle_client(stream, shared).await;
                                });
                            }
                            Err(error) => {
                                log!(LogLevel::Verbose, "Accept failed: {}", error);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        log!(LogLevel::Verbose, "Proxy listening on 127.0.0.1:{}", port);
        Ok(port)
    }

    /// Stop accepting connections. Waits briefly for the accept loop, then
    /// force-resolves so shutdown can never hang on a stuck socket.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(mut task) = self.accept_task.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                task.abort();
                log!(LogLevel::Verbose, "Proxy stop timed out; aborting accept loop");
            }
        }
        self.port = None;
    }

    /// True when nothing was blocked. Prints the offending downloads
    /// otherwise.
    pub fn verify_no_malicious_packages(&self) -> bool {
        let blocked = self.state.blocked_requests();
        if blocked.is_empty() {
            return true;
        }
        logging::always("Blocked malicious package downloads:".to_string());
        for entry in &blocked {
            logging::always(format!(
                "  {}@{} ({})",
                entry.package_name, entry.version, entry.url
            ));
        }
        false
    }

    pub fn has_suppressed_versions(&self) -> bool {
        self.state.has_suppressed_versions()
    }
}

impl Default for ProxyController {
    fn default() -> Self {
        ProxyController::new()
    }
}
