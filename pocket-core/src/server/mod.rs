//! Callback server lifecycle
//!
//! One callback server per internal port is shared across everything in the
//! process that needs it. Owners hold a [`ServerHandle`]; the server starts
//! on the first acquire and shuts down when the last handle drops.

mod proxy;
mod routes;

pub use proxy::ensure_certificate;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{pocket_root, PocketConfig};
use crate::error::{PocketError, Result};

const STARTUP_DEADLINE: Duration = Duration::from_secs(10);

static REGISTRY: Lazy<Mutex<HashMap<u16, ServerEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

struct ServerEntry {
    refcount: usize,
    shutdown: CancellationToken,
}

/// Shared ownership of one running callback server. Dropping the last handle
/// for a port stops that server.
pub struct ServerHandle {
    port: u16,
}

impl ServerHandle {
    /// Start the callback server for `config`, or join the one already
    /// running on its internal port. Blocks until the internal listener is
    /// bound, so callers can hand out redirect URIs immediately after.
    pub fn acquire(config: Arc<PocketConfig>) -> Result<ServerHandle> {
        let port = config.internal_server_port;

        {
            let mut registry = REGISTRY.lock().expect("server registry poisoned");
            if let Some(entry) = registry.get_mut(&port) {
                entry.refcount += 1;
                return Ok(ServerHandle { port });
            }
            let shutdown = CancellationToken::new();
            registry.insert(
                port,
                ServerEntry {
                    refcount: 1,
                    shutdown: shutdown.clone(),
                },
            );
            spawn_server_thread(config, shutdown.clone());
        }

        // Registry lock released while the thread starts up; a failed start
        // rolls the entry back so the next acquire can retry.
        match wait_ready(port) {
            Ok(()) => {
                info!(%port, "callback server ready");
                Ok(ServerHandle { port })
            }
            Err(e) => {
                let mut registry = REGISTRY.lock().expect("server registry poisoned");
                if let Some(entry) = registry.remove(&port) {
                    entry.shutdown.cancel();
                }
                Err(e)
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock().expect("server registry poisoned");
        if let Some(entry) = registry.get_mut(&self.port) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                entry.shutdown.cancel();
                registry.remove(&self.port);
                info!(port = self.port, "last handle dropped, stopping callback server");
            }
        }
    }
}

static READINESS: Lazy<Mutex<HashMap<u16, std::sync::mpsc::Receiver<std::result::Result<(), String>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn wait_ready(port: u16) -> Result<()> {
    let receiver = READINESS
        .lock()
        .expect("readiness registry poisoned")
        .remove(&port)
        .ok_or_else(|| PocketError::ServerInit("server thread never registered".to_string()))?;
    match receiver.recv_timeout(STARTUP_DEADLINE) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(reason)) => Err(PocketError::ServerInit(reason)),
        Err(_) => Err(PocketError::ServerInit(
            "callback server did not come up in time".to_string(),
        )),
    }
}

fn spawn_server_thread(config: Arc<PocketConfig>, shutdown: CancellationToken) {
    let port = config.internal_server_port;
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    READINESS
        .lock()
        .expect("readiness registry poisoned")
        .insert(port, ready_rx);

    let result = std::thread::Builder::new()
        .name(format!("pocket-callback-{}", port))
        .spawn(move || run_server(config, shutdown, ready_tx));
    if let Err(e) = result {
        error!(%port, error = %e, "failed to spawn callback server thread");
    }
}

fn run_server(
    config: Arc<PocketConfig>,
    shutdown: CancellationToken,
    ready_tx: std::sync::mpsc::Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("runtime build failed: {}", e)));
            return;
        }
    };

    runtime.block_on(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.internal_server_port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("bind {} failed: {}", addr, e)));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));
        info!(%addr, "internal callback server listening");

        let internal = axum::serve(listener, routes::router())
            .with_graceful_shutdown(shutdown.clone().cancelled_owned());

        if config.enable_local_callback_proxy {
            let cert_dir = pocket_root().join("callback_server");
            match proxy::ensure_certificate(&cert_dir).await {
                Ok((cert, key)) => {
                    let proxy_task =
                        proxy::serve(config.clone(), cert, key, shutdown.clone());
                    let (internal_result, proxy_result) =
                        tokio::join!(async { internal.await }, proxy_task);
                    if let Err(e) = internal_result {
                        error!(error = %e, "internal callback server failed");
                    }
                    if let Err(e) = proxy_result {
                        error!(error = %e, "callback proxy failed");
                    }
                }
                Err(e) => {
                    error!(error = %e, "certificate setup failed, proxy disabled");
                    if let Err(e) = internal.await {
                        error!(error = %e, "internal callback server failed");
                    }
                }
            }
        } else if let Err(e) = internal.await {
            error!(error = %e, "internal callback server failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> Arc<PocketConfig> {
        Arc::new(PocketConfig {
            internal_server_port: port,
            enable_local_callback_proxy: false,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn acquire_serves_health_and_shuts_down_on_drop() {
        let handle = tokio::task::spawn_blocking(|| ServerHandle::acquire(config(18731)))
            .await
            .expect("join")
            .expect("acquire");

        let body = reqwest::get("http://localhost:18731/health")
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        drop(handle);
        // The listener goes away once the shutdown token fires.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(reqwest::get("http://localhost:18731/health").await.is_err());
    }

    #[tokio::test]
    async fn second_acquire_shares_the_server() {
        let first = tokio::task::spawn_blocking(|| ServerHandle::acquire(config(18732)))
            .await
            .expect("join")
            .expect("acquire");
        let second = tokio::task::spawn_blocking(|| ServerHandle::acquire(config(18732)))
            .await
            .expect("join")
            .expect("acquire");

        drop(first);
        // Still up: the second handle keeps it alive.
        let status = reqwest::get("http://localhost:18732/health")
            .await
            .expect("request")
            .status();
        assert!(status.is_success());
        drop(second);
    }

    #[tokio::test]
    async fn failed_bind_reports_server_init() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:18733").expect("bind");
        let result =
            tokio::task::spawn_blocking(|| ServerHandle::acquire(config(18733))).await.expect("join");
        assert!(matches!(result, Err(PocketError::ServerInit(_))));
        drop(blocker);
    }
}
