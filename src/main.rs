// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mediagate::downloader::validate;
use mediagate::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mediagate")]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip sponsor side effects on gate clicks
    #[arg(long)]
    no_sponsor: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Inline,
    Remote,
    Async,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Category {
    General,
    Restricted,
}

impl From<Category> for ContentCategory {
    fn from(c: Category) -> Self {
        match c {
            Category::General => ContentCategory::General,
            Category::Restricted => ContentCategory::Restricted,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe every configured backend and print the selection
    Probe,
    /// Download through the click gate
    Download {
        /// Downloader page route, e.g. youtube-downloader
        #[arg(short, long)]
        page: String,
        /// Source media URL
        #[arg(short, long)]
        url: String,
        #[arg(short, long, default_value = "mp4")]
        format: String,
        #[arg(short, long, default_value = "best")]
        quality: String,
        #[arg(short, long, value_enum, default_value = "inline")]
        mode: Mode,
        #[arg(long)]
        strip_watermark: bool,
        /// Count this as a conversion action
        #[arg(long)]
        conversion: bool,
        /// Directory for inline files
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Register one gate click
    Click {
        #[arg(value_enum, default_value = "general")]
        category: Category,
        #[arg(long)]
        conversion: bool,
    },
    /// Print the persisted gate state
    GateStatus,
    /// Forget all gate progress
    GateReset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("failed to install log subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = ClientConfig::resolve(file_config)?;

    match cli_args.command {
        Command::Probe => {
            let prober = ConnectionProber::new(&config)?;
            let selected = prober.detect_best_connection().await;
            println!("api:      {}", selected.api_base_url);
            println!("realtime: {}", selected.realtime_base_url);
            println!("reason:   {:?}", selected.selection_reason);
        }
        Command::Click { category, conversion } => {
            let gate = open_gate(&config, cli_args.no_sponsor).await?;
            let outcome = gate.register_click(category.into(), conversion).await;
            if outcome.proceed {
                println!("gate open");
            } else {
                println!("{} click(s) left", outcome.state.clicks_left());
            }
        }
        Command::GateStatus => {
            let gate = open_gate(&config, true).await?;
            match gate.snapshot().await {
                Some(state) => println!(
                    "{}/{} clicks, category {}, conversion {}, complete {}",
                    state.clicks_so_far,
                    state.clicks_required,
                    state.category.as_str(),
                    state.is_conversion_action,
                    state.is_complete
                ),
                None => println!("no gate progress"),
            }
        }
        Command::GateReset => {
            let gate = open_gate(&config, true).await?;
            gate.clear().await;
            println!("gate progress cleared");
        }
        Command::Download { page, url, format, quality, mode, strip_watermark, conversion, output } => {
            let mut request = DownloadRequest::new(url).format(format).quality(quality);
            request = match mode {
                Mode::Inline => request.inline_file(),
                Mode::Remote => request.remote_storage(),
                Mode::Async => request,
            };
            if strip_watermark {
                request = request.strip_watermark();
            }
            if let Err(e) = validate(&page, &request) {
                bail!("{e}");
            }

            let gate = open_gate(&config, cli_args.no_sponsor).await?;
            let prober = Arc::new(ConnectionProber::new(&config)?);
            let client = DownloadClient::new(&config, prober)?;

            let guarded = client
                .download_gated(&gate, &page, &request, conversion, |p| {
                    if let Progress::Fraction(f) = p {
                        eprint!("\r{:>5.1}%", f * 100.0);
                    }
                })
                .await;

            match guarded {
                Guarded::Pending { clicks_left } => println!("{clicks_left} click(s) left before download"),
                Guarded::Ran(DownloadOutcome::Failure { kind, message }) => bail!("download failed: {kind:?}: {message}"),
                Guarded::Ran(outcome) => report(&client, outcome, &output).await?,
            }
        }
    }

    Ok(())
}

async fn open_gate(config: &ClientConfig, no_sponsor: bool) -> Result<MonetizationGate> {
    let store = SqliteGateStore::new(&config.state_db_path)
        .await
        .with_context(|| format!("opening state db {:?}", config.state_db_path))?;
    let sponsor: Arc<dyn SponsorAction> = if no_sponsor {
        Arc::new(NoopSponsor)
    } else {
        Arc::new(HttpSponsor::new(config.sponsors.clone()))
    };
    Ok(MonetizationGate::open(Arc::new(store), sponsor, config.thresholds).await)
}

async fn report(client: &DownloadClient, outcome: DownloadOutcome, output: &std::path::Path) -> Result<()> {
    match outcome {
        DownloadOutcome::BinaryPayload { bytes, suggested_file_name } => {
            let path = output.join(&suggested_file_name);
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("writing {:?}", path))?;
            eprintln!();
            println!("saved {} bytes to {:?}", bytes.len(), path);
        }
        DownloadOutcome::RemoteReference { public_url, expiry } => {
            println!("available at {public_url}");
            if let Some(expiry) = expiry {
                println!("expires {expiry}");
            }
        }
        DownloadOutcome::AsyncHandle { progress_channel_id } => {
            println!("batch {progress_channel_id} queued, waiting for completion");
            let finished = client
                .await_batch(&progress_channel_id, |p| {
                    if let Progress::Fraction(f) = p {
                        eprint!("\r{:>5.1}%", f * 100.0);
                    }
                })
                .await;
            eprintln!();
            match finished {
                DownloadOutcome::Failure { kind, message } => bail!("batch failed ({kind:?}): {message}"),
                DownloadOutcome::RemoteReference { public_url, .. } => println!("available at {public_url}"),
                other => println!("{other:?}"),
            }
        }
        DownloadOutcome::Failure { kind, message } => bail!("{kind:?}: {message}"),
    }
    Ok(())
}
