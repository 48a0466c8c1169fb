use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use essay_eval::config::Config;
use essay_eval::llm::create_backend;
use essay_eval::pipeline::{PromptProcessor, PromptTemplate};
use essay_eval::queue::{InMemoryQueue, feed_lines};
use essay_eval::worker::{Consumer, ShutdownHandle, StopRequest};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Startup failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %config.queue.queue_name,
        provider = %config.provider.provider_type,
        max_concurrency = config.consumer.max_concurrency,
        "essay-eval starting"
    );

    // Template: fetched and parsed once, shared by every worker
    let store = config.template_source.store();
    info!(
        template = %config.template_name,
        source = %store.describe(),
        "Fetching prompt template"
    );
    let bytes = store
        .fetch(&config.template_name)
        .await
        .context("fetching prompt template")?;
    let template = Arc::new(
        PromptTemplate::from_yaml(bytes, &config.template_name)
            .context("parsing prompt template")?,
    );

    // Backend and processor: all validation happens before the first receive
    let backend = Arc::new(
        create_backend(&config.provider, config.policy).context("configuring AI backend")?,
    );
    let processor = Arc::new(
        PromptProcessor::new(template, backend, config.backend_timeout)
            .context("preparing prompt processor")?,
    );

    // Local mode: one JSON message body per stdin line
    let queue = InMemoryQueue::new();
    if config.queue.connection.is_some() {
        warn!(
            queue = %config.queue.queue_name,
            "No broker transport is built in; ignoring SERVICE_BUS_CONNECTION_STR"
        );
    }
    info!("Reading messages from stdin, one JSON body per line");
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            if let Err(e) = feed_lines(&queue, stdin).await {
                error!(error = %e, "Failed to read stdin");
            }
        });
    }

    let consumer = Consumer::new(queue, processor, config.consumer.clone())
        .context("configuring consumer")?;
    spawn_signal_listener(consumer.shutdown_handle());

    let summary = consumer.start().await;
    info!(
        completed = summary.completed,
        dead_lettered = summary.dead_lettered,
        abandoned = summary.abandoned,
        "Shut down cleanly"
    );
    Ok(())
}

/// First signal drains, second cancels in-flight work.
fn spawn_signal_listener(shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                error!(error = %e, "Failed to listen for shutdown signals");
                return;
            }
            shutdown.stop();
            if shutdown.requested() == StopRequest::Immediate {
                return;
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
