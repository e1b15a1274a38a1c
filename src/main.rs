//! llm-taskq - queue worker, offload scheduler, sweeper and operator CLI.
//!
//! ```text
//! llm-taskq worker    [--once] [--max-tasks N]
//! llm-taskq offload   [--once]
//! llm-taskq sweep     [--once] [--dry-run] [--no-drain] [--no-retry] [--stale-seconds N]
//! llm-taskq retention [--confirm] [--prune-days N]
//! llm-taskq status
//! llm-taskq approve|rerun|reenqueue|reset <task-id> --actor NAME
//! ```
//!
//! Every mode also accepts `--db-path PATH`; everything else comes from the
//! environment (see [`llm_taskq::config`]).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use llm_taskq::alerts::check_alerts;
use llm_taskq::config::Config;
use llm_taskq::executor::{enqueue_registry, QueueWorker, RetryPolicy, TaskExecutor};
use llm_taskq::llm::{GeminiProvider, OllamaProvider};
use llm_taskq::offload::{run_retention, LlamaServerRuntime, OffloadScheduler};
use llm_taskq::review::{OperatorList, ReviewService};
use llm_taskq::router::ProviderRouter;
use llm_taskq::sanitizer::Sanitizer;
use llm_taskq::store::{JobStore, SqliteJobStore};
use llm_taskq::sweeper::RetirementSweeper;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Args {
    mode: String,
    task_id: Option<i64>,
    actor: Option<String>,
    once: bool,
    confirm: bool,
    dry_run: bool,
    no_drain: bool,
    no_retry: bool,
    max_tasks: Option<usize>,
    db_path: Option<PathBuf>,
    stale_seconds: Option<u64>,
    prune_days: Option<u32>,
}

fn parse_args(mut argv: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args {
        mode: argv.next().unwrap_or_else(|| "worker".to_string()),
        ..Args::default()
    };

    fn value<T: std::str::FromStr>(
        flag: &str,
        argv: &mut impl Iterator<Item = String>,
    ) -> anyhow::Result<T> {
        let raw = argv.next().ok_or_else(|| anyhow!("{} needs a value", flag))?;
        raw.parse()
            .map_err(|_| anyhow!("invalid value for {}: {}", flag, raw))
    }

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--once" => args.once = true,
            "--confirm" => args.confirm = true,
            "--dry-run" => args.dry_run = true,
            "--no-drain" => args.no_drain = true,
            "--no-retry" => args.no_retry = true,
            "--max-tasks" => args.max_tasks = Some(value(&arg, &mut argv)?),
            "--db-path" => args.db_path = Some(value(&arg, &mut argv)?),
            "--stale-seconds" => args.stale_seconds = Some(value(&arg, &mut argv)?),
            "--prune-days" => args.prune_days = Some(value(&arg, &mut argv)?),
            "--actor" => args.actor = Some(value(&arg, &mut argv)?),
            other if args.task_id.is_none() && !other.starts_with("--") => {
                args.task_id = Some(
                    other
                        .parse()
                        .with_context(|| format!("invalid task id: {}", other))?,
                );
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_taskq=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let mut config = Config::from_env()?;
    if let Some(path) = &args.db_path {
        config.db_path = path.clone();
    }

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("run", run_id = %run_id, mode = %args.mode);
    run(args, config).instrument(span).await
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing in-flight work");
            trigger.cancel();
        }
    });
    cancel
}

fn build_router(config: &Config) -> ProviderRouter {
    let mut router = ProviderRouter::new(config.router.clone());
    match GeminiProvider::new(config.gemini.clone()) {
        Ok(provider) => router = router.with_provider(Arc::new(provider)),
        Err(e) => warn!("Gemini provider disabled: {}", e),
    }
    match OllamaProvider::new(config.ollama.clone()) {
        Ok(provider) => router = router.with_provider(Arc::new(provider)),
        Err(e) => warn!("Ollama provider disabled: {}", e),
    }
    router
}

fn build_worker(
    config: &Config,
    store: Arc<dyn JobStore>,
    cancel: &CancellationToken,
) -> anyhow::Result<QueueWorker> {
    let registry = enqueue_registry(store.clone())?;
    let executor = TaskExecutor::new(
        registry,
        RetryPolicy::default(),
        config.worker.concurrency,
        cancel.clone(),
    );

    Ok(QueueWorker::new(
        store,
        Arc::new(build_router(config)),
        Arc::new(Sanitizer::new(config.sanitizer.clone())),
        Arc::new(executor),
        config.worker.clone(),
    ))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(args: Args, mut config: Config) -> anyhow::Result<()> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&config.db_path).await?);
    info!(db = %config.db_path.display(), "Opened task store");

    match args.mode.as_str() {
        "worker" => {
            if let Some(max) = args.max_tasks {
                config.worker.max_tasks = max;
            }
            let cancel = shutdown_token();
            let worker = build_worker(&config, store, &cancel)?;
            if args.once {
                let report = worker.drain_once(config.worker.max_tasks, &cancel).await;
                worker.shutdown().await;
                print_json(&report?)?;
            } else {
                worker.run(cancel).await;
            }
        }
        "offload" => {
            if let Some(max) = args.max_tasks {
                config.offload.max_tasks = max;
            }
            let cancel = shutdown_token();
            let runtime = LlamaServerRuntime::new(config.llama_server.clone())?;
            let scheduler = OffloadScheduler::new(
                store,
                Box::new(runtime),
                Arc::new(Sanitizer::new(config.sanitizer.clone())),
                config.offload.clone(),
            );
            if args.once {
                let report = scheduler.poll_once(&cancel).await?;
                scheduler.handle().unload().await;
                print_json(&report)?;
            } else {
                scheduler.run(cancel).await;
            }
        }
        "sweep" => {
            let sweep = &mut config.sweeper;
            sweep.dry_run |= args.dry_run;
            sweep.skip_drain |= args.no_drain;
            sweep.skip_retry |= args.no_retry;
            if let Some(secs) = args.stale_seconds {
                sweep.stale_after = std::time::Duration::from_secs(secs);
            }
            if let Some(max) = args.max_tasks {
                sweep.drain_max_tasks = max;
            }

            let cancel = shutdown_token();
            let worker = build_worker(&config, store.clone(), &cancel)?;
            let sweeper =
                RetirementSweeper::new(store, config.sweeper.clone()).with_drain(Arc::new(worker));
            if args.once {
                let report = sweeper.run_once(&cancel).await?;
                print_json(&report)?;
            } else {
                sweeper.run(cancel).await;
            }
        }
        "retention" => {
            if let Some(days) = args.prune_days {
                config.retention.prune_days = days;
            }
            let report = run_retention(
                store.as_ref(),
                &config.offload.models_dir,
                &config.retention,
                args.confirm && !config.dry_run,
            )
            .await?;
            print_json(&report)?;
        }
        "status" => {
            let counts = store.counts_by_status().await?;
            let alerts = check_alerts(store.as_ref(), &config.alerts).await?;
            print_json(&serde_json::json!({
                "counts": counts,
                "queue_length": counts.pending,
                "alerts": alerts,
            }))?;
        }
        "approve" | "rerun" | "reenqueue" | "reset" => {
            let task_id = args
                .task_id
                .ok_or_else(|| anyhow!("{} needs a task id", args.mode))?;
            let actor = args
                .actor
                .ok_or_else(|| anyhow!("{} needs --actor", args.mode))?;
            let review = ReviewService::new(
                store,
                Arc::new(OperatorList::new(config.operators.clone())),
                config.approval_policy,
            );
            match args.mode.as_str() {
                "approve" => review.approve(task_id, &actor).await?,
                "rerun" => {
                    let new_id = review.rerun(task_id, &actor).await?;
                    println!("{}", new_id);
                }
                "reenqueue" => review.reenqueue(task_id, &actor).await?,
                _ => review.reset_attempts(task_id, &actor).await?,
            }
        }
        other => bail!("unknown mode: {}", other),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_to_worker_mode() {
        let parsed = args(&[]).unwrap();
        assert_eq!(parsed.mode, "worker");
        assert!(!parsed.once);
    }

    #[test]
    fn review_commands_take_an_id_and_actor() {
        let parsed = args(&["approve", "42", "--actor", "alice"]).unwrap();
        assert_eq!(parsed.task_id, Some(42));
        assert_eq!(parsed.actor.as_deref(), Some("alice"));
    }

    #[test]
    fn sweep_flags_parse() {
        let parsed = args(&["sweep", "--once", "--dry-run", "--stale-seconds", "60"]).unwrap();
        assert!(parsed.once && parsed.dry_run);
        assert_eq!(parsed.stale_seconds, Some(60));
        assert!(args(&["sweep", "--stale-seconds", "soon"]).is_err());
        assert!(args(&["sweep", "--bogus"]).is_err());
    }
}
