//! Operator entry point. Wires a database pool, an LLM dispatcher, and
//! the two engines together; either runs them on the scheduler's
//! cadences (`serve`) or drives the Merge Engine directly from the
//! command line (`merge`) (`spec.md` §6).

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aggr_engine::{AggregationEngine, AggregationEngineConfig, MergeEngine, MergeEngineConfig};
use aggr_llm::{Dispatcher, OpenAiClient};
use aggr_scheduler::{cadence, Scheduler};
use aggr_store_postgres::PostgresStore;
use config::Config;

#[derive(Parser)]
#[command(name = "aggr", about = "Hot-news event aggregation and merge pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and keep running until signalled.
    Serve,
    /// Drive the Merge Engine directly, bypassing the scheduler.
    Merge {
        #[command(subcommand)]
        mode: MergeMode,
    },
}

#[derive(Subcommand)]
enum MergeMode {
    /// Same algorithm as the scheduled daily run, invoked on demand.
    Incremental,
    /// Same algorithm as `incremental`; named separately so the daily
    /// scheduled job and the ad hoc operator command read distinctly
    /// in logs and shell history.
    Daily,
    /// Like `incremental`, but overriding the recent-event window and
    /// confidence threshold for one run.
    Custom {
        #[arg(long)]
        recent_event_limit: Option<usize>,
        #[arg(long)]
        confidence_threshold: Option<f32>,
    },
    /// Skip the LLM; merge the given event ids directly, `event_ids[0]`
    /// as primary.
    Manual {
        #[arg(value_delimiter = ',')]
        event_ids: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aggr_engine=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Command::Serve => {
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Merge { mode } => run_merge(config, mode).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("connecting to database");
    let store = Arc::new(
        PostgresStore::new(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );
    tracing::info!("database connected, migrations applied");

    let aggregation_dispatcher = Arc::new(Dispatcher::new(
        OpenAiClient::new(config.openai_api_key.clone()),
        config.dispatcher_config(),
    ));
    let merge_dispatcher = Arc::new(Dispatcher::new(
        OpenAiClient::new(config.openai_api_key.clone()),
        config.merge_dispatcher_config(),
    ));
    let context_cache = Arc::new(aggr_cache::Cache::new());

    let mut scheduler = Scheduler::new().await.context("failed to start scheduler")?;

    {
        let store = Arc::clone(&store);
        let dispatcher = Arc::clone(&aggregation_dispatcher);
        let cache = Arc::clone(&context_cache);
        let engine_config = AggregationEngineConfig {
            context_event_limit: config.recent_events_count,
            excluded_news_types: config.excluded_news_types.clone(),
            ..AggregationEngineConfig::default()
        };
        scheduler
            .register(
                "aggregation-incremental",
                cadence::AGGREGATION,
                Duration::from_secs(15 * 60),
                Arc::new(move || {
                    let store = Arc::clone(&store);
                    let dispatcher = Arc::clone(&dispatcher);
                    let cache = Arc::clone(&cache);
                    let engine_config = engine_config.clone();
                    Box::pin(async move {
                        let engine =
                            AggregationEngine::new(&*store, &dispatcher, &cache, engine_config);
                        let summary = engine.run(None).await.map_err(|e| e.to_string())?;
                        serde_json::to_value(summary).map_err(|e| e.to_string())
                    })
                }),
            )
            .await
            .context("failed to register aggregation job")?;
    }

    {
        let store = Arc::clone(&store);
        let dispatcher = Arc::clone(&merge_dispatcher);
        let engine_config = MergeEngineConfig {
            recent_event_limit: config.event_combine_count,
            confidence_threshold: config.event_combine_confidence_threshold,
        };
        scheduler
            .register(
                "merge-daily",
                cadence::MERGE,
                Duration::from_secs(30 * 60),
                Arc::new(move || {
                    let store = Arc::clone(&store);
                    let dispatcher = Arc::clone(&dispatcher);
                    let engine_config = engine_config.clone();
                    Box::pin(async move {
                        let engine = MergeEngine::new(&*store, &dispatcher, engine_config);
                        let summary = engine.run().await.map_err(|e| e.to_string())?;
                        serde_json::to_value(summary).map_err(|e| e.to_string())
                    })
                }),
            )
            .await
            .context("failed to register merge job")?;
    }

    scheduler.start().await.context("failed to start scheduler")?;
    tracing::info!("scheduler running");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    scheduler.shutdown().await.context("scheduler shutdown failed")?;
    Ok(())
}

async fn run_merge(config: Config, mode: MergeMode) -> Result<ExitCode> {
    let store = PostgresStore::new(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let client = OpenAiClient::new(config.openai_api_key.clone());
    let dispatcher = Dispatcher::new(client, config.merge_dispatcher_config());

    match mode {
        MergeMode::Incremental | MergeMode::Daily => {
            let engine_config = MergeEngineConfig {
                recent_event_limit: config.event_combine_count,
                confidence_threshold: config.event_combine_confidence_threshold,
            };
            let engine = MergeEngine::new(&store, &dispatcher, engine_config);
            report_merge_run(engine.run().await)
        }
        MergeMode::Custom {
            recent_event_limit,
            confidence_threshold,
        } => {
            let mut engine_config = MergeEngineConfig {
                recent_event_limit: config.event_combine_count,
                confidence_threshold: config.event_combine_confidence_threshold,
            };
            if let Some(limit) = recent_event_limit {
                engine_config.recent_event_limit = limit;
            }
            if let Some(threshold) = confidence_threshold {
                engine_config.confidence_threshold = threshold;
            }
            let engine = MergeEngine::new(&store, &dispatcher, engine_config);
            report_merge_run(engine.run().await)
        }
        MergeMode::Manual { event_ids } => {
            if event_ids.len() < 2 {
                println!("need at least two event ids to merge, got {}", event_ids.len());
                return Ok(ExitCode::SUCCESS);
            }
            let engine_config = MergeEngineConfig::default();
            let engine = MergeEngine::new(&store, &dispatcher, engine_config);
            match engine.manual_merge(event_ids).await {
                Ok(primary) => {
                    println!("merged into event {}", primary.id);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("manual merge failed: {e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

fn report_merge_run(result: aggr_domain::Result<aggr_domain::MergeRunSummary>) -> Result<ExitCode> {
    match result {
        Ok(summary) if summary.suggestions_count == 0 => {
            println!("nothing to merge this run");
            Ok(ExitCode::SUCCESS)
        }
        Ok(summary) => {
            println!(
                "{} suggestion(s), {} merged, {} failed",
                summary.suggestions_count, summary.merged_count, summary.failed_count
            );
            if summary.failed_count > 0 {
                for failed in &summary.failed_merges {
                    eprintln!("  merge of {:?} failed: {}", failed.events_to_merge, failed.reason);
                }
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(e) => {
            eprintln!("merge run failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
