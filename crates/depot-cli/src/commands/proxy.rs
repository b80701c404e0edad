use super::{Depot, EXIT_FAILURE, EXIT_SUCCESS};
use crate::config::DepotConfig;
use depot_httprox::ProxyServer;
use tokio::net::TcpListener;
use tracing::info;

/// Serve HTTProx until interrupted.
pub async fn run(depot: &Depot, config: &DepotConfig) -> Result<u8, String> {
    let httprox = &config.httprox;
    if !httprox.enabled {
        eprintln!("httprox is disabled; set [httprox] enabled = true in depot.toml");
        return Ok(EXIT_FAILURE);
    }
    let addr = httprox
        .listen_addr()
        .map_err(|e| format!("config error: {e}"))?;
    let server = ProxyServer::builder(httprox.clone(), depot.registry.clone(), depot.content.clone())
        .build()
        .map_err(|e| format!("config error: {e}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("cannot bind {addr}: {e}"))?;
    let local = listener
        .local_addr()
        .map_err(|e| format!("cannot bind {addr}: {e}"))?;
    info!(
        "HTTProx listening on {local} (secured: {}, MITM: {})",
        httprox.secured,
        httprox.mitm_enabled()
    );
    println!("listening on {local}");
    server
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("cannot listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(EXIT_SUCCESS)
}
