use anyhow::{Context, Result};
use clap::Parser;
use spawn_tracer::{CollectorBuilder, CollectorConfig, JsonLinesSink, DEFAULT_PIPE_NAME};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "spawn-tracer")]
#[command(about = "Collect process spawn traces and print finished invocations as JSON lines")]
struct Opts {
    /// Channel name or full socket/pipe path
    #[arg(long, env = "SPAWN_TRACER_PIPE", default_value = DEFAULT_PIPE_NAME)]
    pipe: String,

    /// Stop on unknown message kinds instead of dropping the offending connection
    #[arg(long, env = "SPAWN_TRACER_STRICT")]
    strict: bool,
}

impl Opts {
    fn config(&self) -> CollectorConfig {
        CollectorConfig {
            pipe_name: self.pipe.clone(),
            strict_protocol: self.strict,
            ..CollectorConfig::default()
        }
    }
}

/// Logs go to stderr, stdout carries the JSON records.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(opts: Opts) -> Result<()> {
    let (sink, output) = JsonLinesSink::spawn(tokio::io::stdout());
    let collector = CollectorBuilder::new()
        .config(opts.config())
        .observer(sink)
        .start()
        .await
        .with_context(|| format!("failed to start collector on '{}'", opts.pipe))?;

    let cancel = collector.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            cancel.cancel();
        }
    });

    let tree = collector.wait().await.context("collector stopped")?;
    output
        .await
        .context("record writer panicked")?
        .context("failed to write records")?;
    tracing::info!("Recorded {} processes", tree.len());
    Ok(())
}

#[tokio::main]
async fn main() {
    init_logging();
    let opts = Opts::parse();

    match run(opts).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
