//! Local HTTPS proxy in front of the internal callback server
//!
//! OAuth providers require an https redirect URI even for localhost. The
//! proxy terminates TLS with a self-signed certificate and forwards
//! `/{prefix}/...` to the internal HTTP server with the prefix stripped.

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PocketConfig;
use crate::error::{PocketError, Result};

/// Self-signed certificate for the proxy, generated once under the pocket
/// root and reused afterwards.
pub async fn ensure_certificate(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let cert = dir.join("callback_server.crt");
    let key = dir.join("callback_server.key");
    if cert.exists() && key.exists() {
        return Ok((cert, key));
    }

    tokio::fs::create_dir_all(dir).await?;
    info!(dir = %dir.display(), "generating self-signed proxy certificate");
    let output = Command::new("openssl")
        .args([
            "req", "-x509", "-newkey", "rsa:2048", "-nodes", "-days", "365", "-subj",
            "/CN=localhost",
        ])
        .arg("-keyout")
        .arg(&key)
        .arg("-out")
        .arg(&cert)
        .output()
        .await
        .map_err(|e| PocketError::ServerInit(format!("failed to run openssl: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PocketError::ServerInit(format!(
            "certificate generation failed: {}",
            stderr.trim()
        )));
    }
    Ok((cert, key))
}

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    internal_base: String,
    prefix: String,
}

pub fn proxy_router(internal_base: String, prefix: String) -> Router {
    let state = ProxyState {
        client: reqwest::Client::new(),
        internal_base,
        prefix,
    };
    Router::new().fallback(forward).with_state(state)
}

async fn forward(
    State(state): State<ProxyState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> impl IntoResponse {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let wanted = format!("/{}/", state.prefix);
    let Some(rest) = path_and_query.strip_prefix(wanted.as_str()) else {
        return (
            StatusCode::NOT_FOUND,
            format!("path must start with /{}/", state.prefix),
        )
            .into_response();
    };

    let target = format!("{}/{}", state.internal_base, rest);
    debug!(%target, "forwarding callback request");

    let Ok(method) = reqwest::Method::from_bytes(method.as_str().as_bytes()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let result = state
        .client
        .request(method, &target)
        .body(body.to_vec())
        .send()
        .await;

    match result {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = resp.bytes().await.unwrap_or_default();
            (status, bytes.to_vec()).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, format!("proxy error: {}", e)).into_response(),
    }
}

/// Serve the HTTPS proxy until `shutdown` fires.
pub async fn serve(
    config: Arc<PocketConfig>,
    cert: PathBuf,
    key: PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| PocketError::ServerInit(format!("tls setup failed: {}", e)))?;

    let router = proxy_router(
        config.internal_base_url(),
        config.callback_url_rewrite_prefix.clone(),
    );
    let addr = SocketAddr::from(([0, 0, 0, 0], config.public_server_port));

    let handle = axum_server::Handle::new();
    let graceful = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        graceful.shutdown();
    });

    info!(%addr, "https callback proxy listening");
    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(router.into_make_service())
        .await
        .map_err(|e| PocketError::ServerInit(format!("proxy server failed: {}", e)))
}
