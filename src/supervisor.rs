//! Process supervisor: wires the subsystems together and runs them
//! concurrently, mirroring the teacher's `main.rs`/`lib.rs` split between
//! one graceful-shutdown-aware server future and a handful of background
//! tasks driven by `tokio::select!`.

use tracing::info;

use crate::config::Config;
use crate::fanout;
use crate::http;
use crate::moderation::{Classifier, HttpClassifier, LocalClassifier};
use crate::name_store::NameStore;
use crate::state::AppState;
use crate::{cleanup, tailer};

pub async fn run(config: Config) -> anyhow::Result<()> {
    let name_store = NameStore::load(config.name_map_path.clone())?;
    let classifier = match &config.moderator_endpoint {
        Some(endpoint) => Classifier::Http(HttpClassifier::new(endpoint.clone())),
        None => Classifier::Local(LocalClassifier),
    };
    let log_path = config.log_path.clone();
    let bind_addr = config.bind_addr;
    let state = AppState::new(config, name_store, classifier);

    tailer::replay_cold_start(&state, &log_path).await?;

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "telemetry server listening");

    let router = http::build_router(state.clone());
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = server => {
            result?;
        }
        () = tailer::run(state.clone(), log_path) => {}
        () = fanout::run_flusher(state.fanout.clone()) => {}
        () = cleanup::run(state.clone()) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received, draining connections");
}
