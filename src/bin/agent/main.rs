use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use cart_pilot::analysis::{Analysis, analyze_page};
use cart_pilot::brain::Brain;
use cart_pilot::catalog::SiteCatalog;
use cart_pilot::config::AgentConfig;
use cart_pilot::controller::{Collaborators, SessionController, SessionSignals, fail_before_start};
use cart_pilot::driver::PageDriver;
use cart_pilot::error::{FailureKind, Stage, StageFailure};
use cart_pilot::face::{self, AgentEvent, MissionCommand, PublicConfig};
use cart_pilot::guard::{CheckoutClassifier, VisionClassifier};
use cart_pilot::hands::ChromePage;
use cart_pilot::llm;
use cart_pilot::observability::{LogConfig, LogFormat, init_logging};
use cart_pilot::registry::SessionRegistry;
use cart_pilot::session::Session;

#[derive(Debug, Parser)]
#[command(name = "agent", about = "Vision-guided shopping agent with human checkout approval")]
struct Cli {
    /// YAML, TOML or JSON config file.
    #[arg(long, env = "CART_PILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `server.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Show the browser window.
    #[arg(long)]
    headed: bool,

    /// JSON log lines instead of text.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let log_dir = init_logging(LogConfig {
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Text
        },
        ..LogConfig::default()
    })?;

    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.headed {
        config.browser.headless = false;
    }
    let config = Arc::new(config);
    tracing::info!(target: "agent.loop", log_dir = %log_dir.display(), model = %config.llm.model_name(), "starting agent");

    let model = llm::from_settings(&config.llm).context("configuring the vision model")?;
    let reasoner = Arc::new(Brain::new(
        model.clone(),
        config.agent.reasoning_attempts,
        Duration::from_millis(config.agent.backoff_base_ms),
    ));
    let classifier: Arc<dyn CheckoutClassifier> = Arc::new(VisionClassifier::new(model));
    let catalog = Arc::new(SiteCatalog::new(config.sites.clone()));

    let registry = SessionRegistry::new();
    let public = PublicConfig {
        max_iterations: config.agent.max_iterations,
        headless: config.browser.headless,
        model: config.llm.model_name(),
        model_configured: config.llm.resolve_api_key().is_some(),
    };
    let (mut cmd_rx, event_tx, addr) = face::start_server(&config.server, registry.clone(), public)
        .await
        .context("starting progress server")?;
    tracing::info!(target: "agent.web", "open http://{addr}/events for progress; POST /missions to start");

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(MissionCommand::Start { session, signals }) => {
                    let pruned = registry.prune_finished();
                    tracing::debug!(target: "agent.loop", pruned, "finished sessions pruned");
                    let config = config.clone();
                    let reasoner = reasoner.clone();
                    let classifier = classifier.clone();
                    let catalog = catalog.clone();
                    let events = event_tx.clone();
                    tokio::spawn(async move {
                        run_mission(&config, session, signals, reasoner, classifier, catalog, events).await;
                    });
                }
                Some(MissionCommand::Analyze { goal, url, reply }) => {
                    let config = config.clone();
                    let reasoner = reasoner.clone();
                    let catalog = catalog.clone();
                    tokio::spawn(async move {
                        let outcome = run_analysis(&config, &goal, &url, reasoner, catalog).await;
                        // the requester may have gone away
                        let _ = reply.send(outcome);
                    });
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "agent.loop", "shutting down");
                for snapshot in registry.list() {
                    let _ = registry.cancel(snapshot.id);
                }
                break;
            }
        }
    }

    Ok(())
}

async fn launch(config: &AgentConfig, id: Uuid) -> Result<ChromePage, StageFailure> {
    let settings = config.browser.clone();
    tokio::task::spawn_blocking(move || ChromePage::launch(&settings, id))
        .await
        .map_err(|e| anyhow::anyhow!("browser launch panicked: {e}"))
        .and_then(|r| r)
        .map_err(|e| StageFailure::new(Stage::Launch, FailureKind::BrowserUnavailable, format!("{e:#}")))
}

async fn run_analysis(
    config: &AgentConfig,
    goal: &str,
    url: &str,
    reasoner: Arc<Brain>,
    catalog: Arc<SiteCatalog>,
) -> Result<Analysis, StageFailure> {
    let page = launch(config, Uuid::new_v4()).await?;
    analyze_page(
        &page,
        &*reasoner,
        catalog,
        goal,
        url,
        config.browser.navigation_timeout(),
        Duration::from_millis(config.browser.settle_ms),
    )
    .await
}

async fn run_mission(
    config: &AgentConfig,
    session: Session,
    signals: SessionSignals,
    reasoner: Arc<Brain>,
    classifier: Arc<dyn CheckoutClassifier>,
    catalog: Arc<SiteCatalog>,
    events: broadcast::Sender<AgentEvent>,
) {
    let page: Arc<dyn PageDriver> = match launch(config, session.id).await {
        Ok(page) => Arc::new(page),
        Err(failure) => {
            fail_before_start(session, failure, &events, &signals.snapshot);
            return;
        }
    };

    let controller = SessionController::new(
        config,
        session,
        Collaborators {
            page,
            reasoner,
            classifier,
            catalog,
        },
        events,
        signals,
    );
    let finished = controller.run().await;
    tracing::info!(
        target: "agent.loop",
        session_id = %finished.id,
        status = finished.status.as_str(),
        "browser released"
    );
}
