//! TLS termination and server bootstrap.
//!
//! Key and certificate are read once at startup; failure to read either
//! file is fatal, before any background loop starts. Without TLS paths
//! the proxy serves plain HTTP, which exists for local development only.

use std::net::SocketAddr;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use crate::config::ProxyConfig;
use crate::error::ServerError;

/// Read the configured TLS material. `None` means plain HTTP.
pub async fn load_tls(config: &ProxyConfig) -> Result<Option<RustlsConfig>, ServerError> {
    let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) else {
        return Ok(None);
    };
    RustlsConfig::from_pem_file(cert, key)
        .await
        .map(Some)
        .map_err(|e| ServerError::Tls(format!("cannot load TLS material: {e}")))
}

/// Bind and serve until the process ends.
pub async fn serve(
    router: Router,
    config: &ProxyConfig,
    tls: Option<RustlsConfig>,
) -> Result<(), ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port)
        .parse()
        .map_err(|e| ServerError::Config(format!("invalid listen address: {e}")))?;

    let make_service = router.into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        Some(tls) => {
            info!(%addr, "proxy listening with TLS");
            axum_server::bind_rustls(addr, tls)
                .serve(make_service)
                .await
                .map_err(|e| ServerError::Serve(e.to_string()))
        }
        None => {
            info!(%addr, "proxy listening without TLS (development mode)");
            axum_server::bind(addr)
                .serve(make_service)
                .await
                .map_err(|e| ServerError::Serve(e.to_string()))
        }
    }
}
