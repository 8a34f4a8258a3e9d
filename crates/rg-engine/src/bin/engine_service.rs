use rg_engine::StreamlinedRiskManager;
use rg_store::{InMemoryConnector, InMemoryStore};
use rg_types::{EventEmitter, RiskGateConfig};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<RiskGateConfig> {
    match std::env::var("RISKGATE_CONFIG") {
        Ok(path) => {
            info!(%path, "Loading configuration");
            Ok(RiskGateConfig::from_json_file(&path)?)
        }
        Err(_) => Ok(RiskGateConfig::default()),
    }
}

fn response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let addr = std::env::var("RISKGATE_ADDR").unwrap_or_else(|_| "0.0.0.0:8082".to_string());

    let store = InMemoryStore::shared();
    let manager = Arc::new(StreamlinedRiskManager::from_config(
        config,
        Arc::new(InMemoryConnector::new(store)),
        EventEmitter::disabled(),
    )?);
    manager.start()?;

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "RiskGate engine service listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            accepted = listener.accept() => {
                let (mut socket, peer) = accepted?;
                let manager = manager.clone();

                tokio::spawn(async move {
                    let mut buffer = [0u8; 1024];
                    let read = socket.read(&mut buffer).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buffer[..read]);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/");
                    debug!(%peer, path, "HTTP request");

                    let reply = match path {
                        "/health" => serde_json::to_string(&manager.health_check().await)
                            .map(|body| response("200 OK", &body)),
                        "/stats" => serde_json::to_string(&manager.stats())
                            .map(|body| response("200 OK", &body)),
                        _ => Ok(response("404 Not Found", r#"{"error":"not found"}"#)),
                    };
                    let reply = reply.unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to encode response");
                        response("500 Internal Server Error", r#"{"error":"internal"}"#)
                    });

                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
