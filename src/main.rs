use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pdp_cua::brain::GeminiBrain;
use pdp_cua::cobrowse::{CobrowseOptions, RuleEvaluator, cobrowse};
use pdp_cua::config::{
    DEFAULT_CUA_MODEL, DEFAULT_PDP_URL_REGEX, DEFAULT_VARIANT_SIGNALS, MinimumsPolicy, PdpBudget,
    RetryPolicy, SessionConfig, WaitPolicy,
};
use pdp_cua::confirm::{AutoConfirm, Confirmer, StdinConfirmer};
use pdp_cua::hands::{BrowserControl, ChromeBrowser, ChromeOptions, LoadState};
use pdp_cua::logging;
use pdp_cua::output::RunDirectory;
use pdp_cua::rules::RuleSet;
use pdp_cua::session::{Session, TerminationReason};
use pdp_cua::types::ProposedAction;

#[derive(Parser)]
#[command(name = "pdp-cua", version, about = "Explore a shop with a computer-use model and record its product pages")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Let the model browse from a start URL and capture the PDPs it visits.
    Explore(ExploreArgs),
    /// Evaluate authored rules against the page you are browsing.
    Cobrowse(CobrowseArgs),
}

#[derive(Args)]
struct ExploreArgs {
    #[arg(long)]
    start_url: String,
    /// Task text for the model. Derived from the PDP budget when omitted.
    #[arg(long, default_value = "")]
    goal: String,
    #[arg(long = "exclude-action")]
    excluded_actions: Vec<String>,
    #[arg(long, default_value = DEFAULT_CUA_MODEL)]
    cua_model: String,
    #[arg(long, default_value_t = 1)]
    min_variant_pdp: usize,
    #[arg(long, default_value_t = 0)]
    min_variantless_pdp: usize,
    #[arg(long, default_value_t = 2)]
    max_pdp: usize,
    /// Keep exploring until --max-pdp once both minimums are met.
    #[arg(long)]
    explore_to_max: bool,
    #[arg(long, default_value_t = 60)]
    max_steps: usize,
    #[arg(long, default_value = DEFAULT_PDP_URL_REGEX)]
    pdp_url_regex: String,
    /// CSS selector hinting that a PDP has variants. Replaces the built-in list.
    #[arg(long = "variant-signal")]
    variant_signals: Vec<String>,
    #[arg(long, value_enum, default_value_t = LoadState::Load)]
    wait_load_state: LoadState,
    #[arg(long, default_value_t = 5000)]
    wait_timeout_ms: u64,
    #[arg(long, default_value_t = 1000)]
    post_action_sleep_ms: u64,
    /// Pass model coordinates through unscaled.
    #[arg(long)]
    no_normalize_coords: bool,
    #[arg(long)]
    headless: bool,
    #[arg(long, default_value = "outputs")]
    out_dir: PathBuf,
    #[arg(long)]
    run_name: Option<String>,
    /// Approve every action the model flags for confirmation.
    #[arg(long)]
    auto_confirm: bool,
    #[arg(long, default_value_t = 120)]
    model_timeout_secs: u64,
    #[arg(long, default_value_t = 3)]
    model_retries: u32,
}

impl ExploreArgs {
    fn session_config(&self) -> SessionConfig {
        let variant_signals = if self.variant_signals.is_empty() {
            DEFAULT_VARIANT_SIGNALS.iter().map(|s| s.to_string()).collect()
        } else {
            self.variant_signals.clone()
        };
        SessionConfig {
            start_url: self.start_url.trim().to_string(),
            goal: self.goal.clone(),
            excluded_actions: self.excluded_actions.clone(),
            model: self.cua_model.clone(),
            budget: PdpBudget {
                min_variant: self.min_variant_pdp,
                min_variantless: self.min_variantless_pdp,
                max_pdp: self.max_pdp,
                on_minimums_met: if self.explore_to_max {
                    MinimumsPolicy::ExploreToMax
                } else {
                    MinimumsPolicy::Stop
                },
            },
            wait: WaitPolicy {
                load_state: self.wait_load_state,
                timeout: Duration::from_millis(self.wait_timeout_ms),
                settle: Duration::from_millis(self.post_action_sleep_ms),
            },
            max_steps: self.max_steps,
            normalize_coords: !self.no_normalize_coords,
            pdp_url_regex: self.pdp_url_regex.clone(),
            variant_signals,
            model_timeout: Duration::from_secs(self.model_timeout_secs),
            model_retry: RetryPolicy {
                max_attempts: self.model_retries,
                ..RetryPolicy::default()
            },
            ..SessionConfig::default()
        }
    }
}

#[derive(Args)]
struct CobrowseArgs {
    /// Run directory containing rules.json.
    #[arg(long, required_unless_present = "rules", conflicts_with = "rules")]
    run_dir: Option<PathBuf>,
    #[arg(long)]
    rules: Option<PathBuf>,
    /// Page to open first. Otherwise start blank and browse manually.
    #[arg(long)]
    url: Option<String>,
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    #[arg(long)]
    headless: bool,
    /// Click add-to-cart once per page when it is found and clickable.
    #[arg(long)]
    interactive: bool,
    #[arg(long)]
    once: bool,
}

/// Confirmation gate picked on the command line.
enum Gate {
    Auto(AutoConfirm),
    Prompt(StdinConfirmer),
}

impl Confirmer for Gate {
    fn confirm(&mut self, action: &ProposedAction) -> impl Future<Output = bool> + Send {
        async move {
            match self {
                Gate::Auto(gate) => gate.confirm(action).await,
                Gate::Prompt(gate) => gate.confirm(action).await,
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    logging::init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping");
            token.cancel();
        }
    });

    match cli.command {
        Command::Explore(args) => explore(args, cancel).await,
        Command::Cobrowse(args) => run_cobrowse(args, cancel).await,
    }
}

async fn launch(headless: bool) -> Result<ChromeBrowser> {
    let options = ChromeOptions {
        headless,
        ..ChromeOptions::default()
    };
    tokio::task::spawn_blocking(move || ChromeBrowser::launch(&options))
        .await
        .map_err(|e| anyhow::anyhow!("Browser launch panicked: {}", e))?
}

async fn explore(args: ExploreArgs, cancel: CancellationToken) -> Result<()> {
    let config = args.session_config();
    config.validate()?;

    let brain = GeminiBrain::from_env(config.model.clone())?;
    let run = RunDirectory::create(&args.out_dir, &config.start_url, args.run_name.as_deref())?;
    let root = run.root().to_path_buf();
    let gate = if args.auto_confirm {
        Gate::Auto(AutoConfirm)
    } else {
        Gate::Prompt(StdinConfirmer)
    };
    let browser = launch(args.headless).await?;

    let mut session = Session::new(config, browser, brain, gate, run)?;
    let record = session.run(cancel).await;

    println!("run directory: {}", root.display());
    println!(
        "pdps: {} ({} with variants, {} without)",
        record.counts.total(), record.counts.variant, record.counts.variantless
    );
    match record.termination {
        TerminationReason::FatalError { message } => anyhow::bail!("run failed: {message}"),
        reason => {
            println!("termination: {reason:?}");
            Ok(())
        }
    }
}

async fn run_cobrowse(args: CobrowseArgs, cancel: CancellationToken) -> Result<()> {
    let source = args
        .rules
        .or(args.run_dir)
        .context("either --rules or --run-dir is required")?;
    let rules = RuleSet::load(&source)?;
    let mut evaluator = RuleEvaluator::new(rules).interactive(args.interactive);

    let mut browser = launch(args.headless).await?;
    if let Some(url) = &args.url {
        browser.navigate(url).with_context(|| format!("opening {url}"))?;
    }

    let options = CobrowseOptions {
        interval: Duration::from_millis(args.interval_ms),
        once: args.once,
    };
    let outcome = cobrowse(&mut browser, &mut evaluator, options, &cancel, |result| {
        match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "could not serialize evaluation"),
        }
    })
    .await;

    if let Err(e) = browser.close() {
        warn!(error = %e, "closing browser failed");
    }
    let passes = outcome?;
    info!(passes, "co-browse finished");
    Ok(())
}
