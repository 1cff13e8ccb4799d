use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use grove_analyst::cache::{FileStore, MemoryStore};
use grove_analyst::client::{
    ControllerEvent, DiagnosticsReporter, HttpTransport, RetryController, RetryPolicy, SessionTracker,
};
use grove_analyst::config::{resolve_api_key, validate_api_key_format, Config};
use grove_analyst::gateway::Backend;
use grove_analyst::item::Item;
use grove_analyst::models::Mode;
use grove_analyst::orchestrator::{AnalysisOrchestrator, ConnectionState};
use grove_analyst::profile::Profile;
use grove_analyst::{keyring, server};
use serde_json::Value;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "grove",
    about = "Cache-first AI product analysis with cost accounting",
    version
)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.config/grove/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the analysis server
    Serve(ServeArgs),
    /// Analyze one item through a running server
    Analyze(AnalyzeArgs),
    /// Show spend for a session, or all-time totals
    Costs(CostsArgs),
    /// Check that the server can reach the AI backend
    TestConnection,
    /// Store an Anthropic API key in the system keychain
    Setup,
    /// Print the version fingerprint of a profile file
    VersionProfile { file: PathBuf },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on (overrides config)
    #[arg(long)]
    bind: Option<String>,
    /// Keep everything in memory; nothing is written to disk
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    url: String,
    /// JSON file with the extracted item fields
    #[arg(long)]
    payload: PathBuf,
    /// JSON file with the preference profile (required unless --basic)
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Generic analysis on the smaller model, no profile
    #[arg(long)]
    basic: bool,
    /// Skip the local analysis cache
    #[arg(long)]
    no_cache: bool,
    /// Print the full response envelope
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CostsArgs {
    /// Session id to report on; all-time totals otherwise
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path);
            config.apply_env();
            config
        }
        None => Config::load(),
    };
    config.validate()?;

    match cli.command {
        Commands::Serve(args) => serve(config, args).await,
        Commands::Analyze(args) => analyze(&config, args).await,
        Commands::Costs(args) => costs(&config, args).await,
        Commands::TestConnection => test_connection(&config).await,
        Commands::Setup => setup(&config),
        Commands::VersionProfile { file } => {
            let profile = read_profile(&file)?;
            println!("{}", profile.version());
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grove=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    let api_key = resolve_api_key();
    if api_key.is_none() {
        tracing::warn!("no Anthropic API key configured; analyses will fail until `grove setup` is run");
    }
    let gateway = Arc::new(Backend::from_config(&config, api_key)?);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;

    if args.ephemeral {
        tracing::info!("using in-memory store");
        let orchestrator = AnalysisOrchestrator::new(gateway, Arc::new(MemoryStore::new()));
        server::serve(listener, orchestrator, server::shutdown_signal()).await?;
    } else {
        let dir = config.data_dir();
        let store = FileStore::open(&dir).with_context(|| format!("Failed to open store at {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), "using file store");
        let orchestrator = AnalysisOrchestrator::new(gateway, Arc::new(store));
        server::serve(listener, orchestrator, server::shutdown_signal()).await?;
    }
    Ok(())
}

fn controller(config: &Config) -> Result<RetryController<HttpTransport>> {
    let transport = Arc::new(HttpTransport::new(&config.client)?);
    Ok(RetryController::new(
        transport,
        RetryPolicy::from_config(&config.client),
        SessionTracker::new(config.client.session_idle_minutes),
    ))
}

async fn analyze(config: &Config, args: AnalyzeArgs) -> Result<()> {
    let item = read_item(&args.url, &args.payload)?;
    let mode = if args.basic { Mode::Basic } else { Mode::Full };
    let profile = match (&args.profile, mode) {
        (Some(path), _) => Some(read_profile(path)?),
        (None, Mode::Full) => bail!("--profile is required unless --basic is given"),
        (None, Mode::Basic) => None,
    };

    let transport = Arc::new(HttpTransport::new(&config.client)?);
    let reporter = DiagnosticsReporter::spawn(Arc::clone(&transport));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let controller = Arc::new(
        RetryController::new(
            transport,
            RetryPolicy::from_config(&config.client),
            SessionTracker::new(config.client.session_idle_minutes),
        )
        .with_events(events_tx)
        .with_reporter(reporter),
    );

    let progress = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let ControllerEvent::RetryScheduled { .. } = event {
                    eprintln!("{}", controller.status_line());
                }
            }
        })
    };

    let outcome = controller.analyze(item, profile, mode, !args.no_cache).await;
    let status_line = controller.status_line();
    let session_id = controller.session_id();
    progress.abort();
    let _ = progress.await;
    if let Ok(controller) = Arc::try_unwrap(controller) {
        controller.shutdown().await;
    }

    let response = match outcome {
        Ok(response) => response,
        Err(err) => bail!("{} ({})", status_line, err),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&response.result)?);
        eprintln!(
            "{} | {} | {} | session {}",
            if response.cached { "cached" } else { "fresh" },
            response.model_used,
            response.cost_usd,
            session_id
        );
    }
    Ok(())
}

async fn costs(config: &Config, args: CostsArgs) -> Result<()> {
    let controller = controller(config)?;
    match args.session {
        Some(session_id) => {
            let report = controller.session_costs(Some(session_id)).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("Session {}", report.session_id);
            println!("  total:     {}", report.total_cost);
            println!("  requests:  {} ({} cached)", report.request_count, report.cache_hits);
            println!("  saved:     {}", report.cached_savings);
            for (model, cost) in &report.per_model {
                println!("  {:<28} {}", model, cost);
            }
        }
        None => {
            let totals = controller.total_costs().await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&totals)?);
                return Ok(());
            }
            println!("All sessions");
            println!("  total:     {}", totals.total_cost);
            println!("  requests:  {}", totals.total_requests);
            println!("  tokens:    {}", totals.total_tokens);
            println!("  average:   {}", totals.average_cost_per_request);
        }
    }
    Ok(())
}

async fn test_connection(config: &Config) -> Result<()> {
    let status = controller(config)?.test_connection().await?;
    println!("{}: {}", status.provider, status.message);
    if status.status == ConnectionState::Error {
        bail!("connection test failed");
    }
    Ok(())
}

fn setup(config: &Config) -> Result<()> {
    print!("Anthropic API key (starts with sk-ant-): ");
    io::stdout().flush()?;
    let mut key = String::new();
    io::stdin().read_line(&mut key)?;
    let key = key.trim();

    if key.is_empty() {
        println!("No key entered. Run `grove setup` again when you have one.");
        return Ok(());
    }
    if !validate_api_key_format(key) {
        print!("That doesn't look like an Anthropic key. Save anyway? [y/N]: ");
        io::stdout().flush()?;
        let mut confirm = String::new();
        io::stdin().read_line(&mut confirm)?;
        if !confirm.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    keyring::set_api_key(key).map_err(|e| anyhow::anyhow!(e))?;
    println!("API key saved to the system keychain.");

    let location = Config::config_location();
    if !Path::new(&location).exists() {
        config.save()?;
        println!("Wrote default config to {}", location);
    } else {
        println!("Config location: {}", location);
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn read_item(url: &str, payload: &Path) -> Result<Item> {
    let Value::Object(mut fields) = read_json(payload)? else {
        bail!("{} must contain a JSON object", payload.display());
    };
    fields.insert("url".to_string(), Value::String(url.to_string()));
    serde_json::from_value(Value::Object(fields)).context("Invalid item payload")
}

fn read_profile(path: &Path) -> Result<Profile> {
    Ok(Profile::from_value(read_json(path)?)?)
}
