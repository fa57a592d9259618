mod anthropic;
mod cli;
mod clock;
mod config;
mod draft;
mod error;
mod pipeline;
mod server;
mod store;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use anthropic::AnthropicClient;
use cli::{AddArgs, Cli, Command};
use clock::SystemClock;
use config::PipelineConfig;
use draft::SourceItem;
use error::PipelineError;
use pipeline::{LockManager, StageHandlers, StepDispatcher, WorkerId};
use store::DraftStore;

fn init_tracing(verbose: bool) {
    let default = if verbose { "draftline=debug" } else { "draftline=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// File and env settings with command-line overrides applied on top.
fn resolve_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(worker) = &cli.worker_id {
        config.worker_id = Some(worker.clone());
    }
    if let Some(max) = cli.max_attempts {
        config.retry.max_attempts = max;
    }
    config.validate()?;
    Ok(config)
}

fn build_dispatcher(
    config: &PipelineConfig,
    store: &DraftStore,
) -> Result<StepDispatcher<AnthropicClient>> {
    if config.api_key.is_empty() {
        bail!("no API key: set ANTHROPIC_API_KEY or api_key in draftline.toml");
    }
    let worker = config
        .worker_id
        .clone()
        .map(WorkerId::new)
        .unwrap_or_else(WorkerId::generate);
    info!(worker = %worker, db = %config.db_path.display(), "worker ready");

    let client = AnthropicClient::new(config.api_key.clone(), config.request_timeout())?;
    let locks = LockManager::new(
        store.clone(),
        worker,
        config.lock_timeout(),
        Arc::new(SystemClock),
    );
    Ok(StepDispatcher::new(
        store.clone(),
        locks,
        StageHandlers::new(client, config.authoring.clone()),
        config.retry.clone(),
    ))
}

fn add_draft(store: &DraftStore, args: AddArgs) -> Result<()> {
    let raw_content = match (&args.content, &args.content_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => String::new(),
    };
    let source = SourceItem {
        title: args.title,
        source_link: args.link,
        category: args.category,
        raw_content,
    };
    let now = Utc::now();
    let draft = store.insert(&source, now)?;
    if args.queue {
        store.queue(&draft.id, now)?;
    }
    println!("{}", draft.id);
    Ok(())
}

fn require_draft(store: &DraftStore, id: &str) -> Result<(), PipelineError> {
    match store.get(id)? {
        Some(_) => Ok(()),
        None => Err(PipelineError::DraftNotFound(id.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = resolve_config(&cli)?;
    let store = DraftStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    match cli.command {
        Command::Add(args) => add_draft(&store, args)?,
        Command::Queue { id } => {
            require_draft(&store, &id)?;
            if !store.queue(&id, Utc::now())? {
                bail!("draft {id} is not NEW");
            }
            println!("{id} queued");
        }
        Command::Step { draft_id } => {
            let dispatcher = build_dispatcher(&config, &store)?;
            let report = dispatcher.process_step_report(draft_id.as_deref()).await?;
            ui::print_report(&report);
        }
        Command::Run { max_steps } => {
            let dispatcher = build_dispatcher(&config, &store)?;
            let mut progress = ui::RunProgress::start(dispatcher.locks().worker().as_str());
            let result = dispatcher.drain(max_steps, |o| progress.step(o)).await;
            progress.finish();
            result?;
        }
        Command::Status { limit } => {
            let counts = store.count_by_stage()?;
            let drafts = store.list(limit)?;
            ui::print_status(&counts, &drafts, config.retry.max_attempts);
        }
        Command::Show { id } => match store.get(&id)? {
            Some(draft) => ui::print_draft(&draft),
            None => return Err(PipelineError::DraftNotFound(id).into()),
        },
        Command::Release { id } => {
            require_draft(&store, &id)?;
            let locks = LockManager::new(
                store.clone(),
                WorkerId::new("operator"),
                config.lock_timeout(),
                Arc::new(SystemClock),
            );
            if locks.force_release(&id)? {
                println!("{id} released");
            } else {
                println!("{id} was not locked");
            }
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let dispatcher = build_dispatcher(&config, &store)?;
            let state = Arc::new(server::AppState {
                dispatcher,
                store: store.clone(),
            });
            server::serve(state, &bind).await?;
        }
    }

    Ok(())
}
