use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tw_adapters::{JsonBatchSource, KeywordRegistry};
use tw_pipeline::{
    compact_ledger, maybe_build_scheduler, FileDropNotifier, GoogleWebTranslator, NoopTranslator,
    Pipeline, PipelineConfig, Translator,
};
use tw_storage::{LedgerStore, LocalLedgerStore, RemoteLedgerStore};
use tw_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "tenderwatch")]
#[command(about = "Tender scraping and notification pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape → report → notify workflow pass and exit.
    Run,
    /// Serve the HTTP trigger API (plus the cron scheduler when enabled).
    Serve {
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
    /// Drop ledger entries whose bid deadline is long past.
    Compact {
        #[arg(long, default_value_t = 90)]
        retain_days: u64,
    },
}

fn build_store(config: &PipelineConfig) -> Result<Arc<dyn LedgerStore>> {
    let timeout = Duration::from_secs(config.http_timeout_secs);
    Ok(match &config.ledger_url {
        Some(url) => Arc::new(RemoteLedgerStore::new(url.clone(), timeout)?),
        None => Arc::new(LocalLedgerStore::new(config.ledger_path.clone())),
    })
}

fn build_translator(config: &PipelineConfig) -> Result<Arc<dyn Translator>> {
    if config.translate_enabled {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        Ok(Arc::new(GoogleWebTranslator::new(timeout)?))
    } else {
        Ok(Arc::new(NoopTranslator))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let store = build_store(&config)?;
    let translator = build_translator(&config)?;
    let registry = Arc::new(
        KeywordRegistry::from_yaml_file(&config.keywords_file)
            .context("loading keyword registry")?,
    );
    let source = Arc::new(JsonBatchSource::new(config.batches_dir.clone()));
    let notifier = Arc::new(FileDropNotifier::new(config.outbox_dir.clone()));
    let pipeline = Arc::new(Pipeline::new(config, store.clone()).with_translator(translator));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = pipeline
                .run_workflow(source.as_ref(), &registry, notifier.as_ref(), Utc::now())
                .await?;
            println!(
                "run complete: run_id={} canonical={} active={} fresh={} committed={} reports={}",
                summary.run_id,
                summary.canonical,
                summary.active,
                summary.recent_unnotified,
                summary.committed,
                summary.reports_dir
            );
        }
        Commands::Serve { port } => {
            let scheduler = maybe_build_scheduler(
                pipeline.clone(),
                registry.clone(),
                source.clone(),
                notifier.clone(),
            )
            .await?;
            if let Some(mut sched) = scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("cron scheduler started");
            }
            info!(port, "serving http trigger api");
            tw_web::serve(
                AppState {
                    pipeline,
                    registry,
                    source,
                    notifier,
                },
                port,
            )
            .await?;
        }
        Commands::Compact { retain_days } => {
            let mut ledger = store.load().await?;
            let before = ledger.len();
            let dropped = compact_ledger(&mut ledger, Utc::now().date_naive(), retain_days);
            store.replace(&ledger).await?;
            println!(
                "compaction complete: kept={} dropped={}",
                before - dropped,
                dropped
            );
        }
    }

    Ok(())
}
