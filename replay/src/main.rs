use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weft_contract::{DisplayMode, KvBackend};
use weft_runtime::{ReplayClient, StreamOrchestrator, SubmitOptions, WeftConfig};
use weft_store_adapters::FileKv;

#[derive(Debug, Parser)]
#[command(name = "weft-replay")]
struct Args {
    /// JSON-lines file of `{event, data, id?}` stream parts.
    #[arg(long)]
    events: PathBuf,

    /// Thread to replay into. A fresh id is created when omitted.
    #[arg(long, env = "WEFT_THREAD_ID")]
    thread_id: Option<String>,

    #[arg(long, env = "WEFT_STORAGE_DIR", default_value = "./weft-cache")]
    storage_dir: PathBuf,

    #[arg(long, env = "WEFT_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the config's display mode (`append` or `hold`).
    #[arg(long)]
    display_mode: Option<DisplayMode>,

    /// Run input as JSON, e.g. `{"messages": [...]}`.
    #[arg(long)]
    input: Option<String>,

    /// Print cached thread ids after the replay.
    #[arg(long)]
    list_cached: bool,
}

fn load_config(path: Option<&PathBuf>) -> WeftConfig {
    let Some(path) = path else {
        return WeftConfig::default();
    };
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to read config {}: {e}", path.display());
            std::process::exit(2);
        }
    };
    match WeftConfig::from_json_str(&raw) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_ref());
    if let Some(mode) = args.display_mode {
        config.display_mode = mode;
    }

    let raw_events = match std::fs::read_to_string(&args.events) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to read events {}: {e}", args.events.display());
            std::process::exit(2);
        }
    };
    let client = match ReplayClient::from_jsonl(&raw_events) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to parse events {}: {e}", args.events.display());
            std::process::exit(2);
        }
    };
    let input = match args.input.as_deref().map(serde_json::from_str::<Value>) {
        None => Value::Null,
        Some(Ok(v)) => v,
        Some(Err(e)) => {
            eprintln!("failed to parse input (JSON): {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(parts = client.parts().len(), "loaded stream parts");

    let backend: Arc<dyn KvBackend> = Arc::new(FileKv::new(args.storage_dir));
    let mut builder = StreamOrchestrator::builder(Arc::new(client))
        .with_config(config)
        .with_backend(backend);
    if let Some(thread_id) = args.thread_id {
        builder = builder.with_thread_id(thread_id);
    }
    let orch = builder.build();
    orch.hydrate_active().await;

    let outcome = orch.submit(input, SubmitOptions::default()).await;

    match serde_json::to_string_pretty(&orch.values()) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to encode snapshot: {e}"),
    }
    if args.list_cached {
        for thread_id in orch.cached_threads().await {
            eprintln!("cached: {thread_id}");
        }
    }
    if let Err(e) = outcome {
        eprintln!("replay failed: {e}");
        std::process::exit(1);
    }
}
