//! livedata-server binary entry point.
//!
//! Usage:
//! ```bash
//! livedata-server --config livedata.toml
//! ```
//!
//! Runs a self-contained demo: a fenced write flows through an observer, and
//! the resulting frames go out over a session on an in-process transport.

use std::path::PathBuf;
use std::sync::Arc;

use live_core::{CursorDescription, Selector};
use live_types::Document;
use livedata_server::config::Config;
use livedata_server::telemetry::init_tracing;
use livedata_server::{change_frame, DocumentStore, LivedataServer, MockTransport, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("livedata-server v{}", env!("CARGO_PKG_VERSION"));

    let path = get_config_path();
    let config = if path.exists() {
        Config::from_file(&path)?
    } else {
        tracing::info!("no config at {}, using defaults", path.display());
        Config::default()
    };

    let server = LivedataServer::new(config);

    // A session stands in for one connected client.
    let transport = MockTransport::new();
    transport.connect("demo-client").await?;
    let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::unbounded_channel();
    let (session, handle) = server.open_session(Arc::new(transport.clone()), inbound_tx);

    let mut observer = server
        .observe(CursorDescription::new("lists", Selector::All))
        .await?;

    let store = Arc::clone(server.store());
    let outcome = server
        .run_method("1", || async move {
            let mut doc = Document::new();
            doc.insert("name".into(), "groceries".into());
            store.insert("lists", "l1".into(), doc).await
        })
        .await?;
    outcome.result?;

    for event in observer.drain() {
        handle.send(change_frame("lists", event))?;
    }
    handle.send(outcome.updated)?;

    let pump = tokio::spawn(async move { server.serve(session).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    for frame in transport.sent_frames() {
        tracing::info!("sent {}", frame.to_json()?);
    }

    handle.shutdown();
    let end = pump.await?;
    tracing::info!("demo finished: {}", end);
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("livedata.toml"))
}
