//! Start a supervised opencode server and log its event stream until Ctrl+C.
//!
//! Usage: `opencode-serve-example [config-dir]`
//!
//! With `config-dir` every file below it is staged into a fresh isolation
//! root. `OPENCODE_BIN`, `OPENCODE_API_KEY` and `OPENCODE_CONFIG_DIR` are
//! honored as well.

use std::time::Duration;

use anyhow::Context;
use opencode_client::{CancellationToken, Event};
use opencode_supervisor::{ChildOutput, Config, Environment, OpenCode, VirtualFileSet};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let env = Environment::capture();
    let mut config = Config::from_environment(&env).with_output(ChildOutput::Trace);
    if let Some(dir) = std::env::args().nth(1) {
        let files = VirtualFileSet::from_dir(&dir)
            .with_context(|| format!("Failed to read config directory {dir}"))?;
        tracing::info!(dir = %dir, files = files.len(), "Loaded config files");
        config = config.with_config_files(files);
    }

    let opencode = OpenCode::with_environment(config, env);
    opencode.start().await.context("Failed to start opencode")?;

    let attempts = match opencode.wait_for_ready(READY_TIMEOUT).await {
        Ok(attempts) => attempts,
        Err(e) => {
            if let Err(stop) = opencode.shutdown().await {
                tracing::warn!(error = %stop, "Failed to shut down");
            }
            return Err(e).context("opencode never became ready");
        }
    };
    tracing::info!("opencode ready on http://{} after {attempts} probes", opencode.addr());

    let client = opencode.client();
    match client.list_sessions().await {
        Ok(sessions) => tracing::info!(count = sessions.len(), "Existing sessions"),
        Err(e) => tracing::warn!(error = %e, "Failed to list sessions"),
    }

    let cancel = CancellationToken::new();
    let stream = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            client
                .stream_events(&cancel, |event| match &event {
                    Event::Unknown { kind, .. } => tracing::debug!(kind = %kind, "Event"),
                    _ => tracing::info!(
                        kind = event.kind(),
                        session = event.session_id().unwrap_or("-"),
                        "Event"
                    ),
                })
                .await
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutting down");

    cancel.cancel();
    match stream.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Event stream ended with error"),
        Err(e) => tracing::warn!(error = %e, "Event stream task failed"),
    }

    opencode.shutdown().await.context("Failed to shut down opencode")?;
    Ok(())
}
