//! Running an axum router until the process is told to stop.
//!
//! SIGHUP and SIGTERM (and ^C) stop the accept loop; requests in flight then get a grace period to
//! finish before `serve` returns regardless.

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Serve `router` on all interfaces at `port` until signalled.

pub async fn serve(port: u16, router: Router) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    tracing::info!(%addr, "listening");
    serve_until(listener, router, wait_for_signal(), SHUTDOWN_GRACE).await
}

pub async fn serve_until<F>(
    listener: TcpListener,
    router: Router,
    stop: F,
    grace: Duration,
) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    tokio::select! {
        r = &mut server => {
            // The server only ends on its own if it failed.
            r.context("Server task failed")?.context("Server failed")?;
            return Ok(());
        }
        r = stop => {
            r?;
        }
    }

    tracing::info!("shutting down");
    let _ = stop_tx.send(());
    match tokio::time::timeout(grace, &mut server).await {
        Ok(r) => r.context("Server task failed")?.context("Server failed")?,
        Err(_) => {
            tracing::warn!("requests still in flight after grace period");
            server.abort();
        }
    }
    Ok(())
}

/// Resolves on SIGHUP, SIGTERM or SIGINT.

pub async fn wait_for_signal() -> Result<()> {
    let mut hup = signal(SignalKind::hangup()).context("Installing SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    tokio::select! {
        _ = hup.recv() => tracing::info!("SIGHUP"),
        _ = term.recv() => tracing::info!("SIGTERM"),
        r = tokio::signal::ctrl_c() => { r.context("Waiting for ^C")?; tracing::info!("SIGINT") },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_serve_until_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = Router::new().route("/", get(|| async { "hi" }));
        let (tx, rx) = oneshot::channel::<()>();
        let stop = async move {
            let _ = rx.await;
            Ok(())
        };
        let handle = tokio::spawn(serve_until(listener, router, stop, Duration::from_millis(100)));
        tx.send(()).unwrap();
        let r = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(r.is_ok());
    }
}
