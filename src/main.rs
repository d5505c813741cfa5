use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use socialgraph::crawl::{validate_seed, CancelFlag, Crawler, MaxDepth};
use socialgraph::db::Checkpoint;
use socialgraph::fetch::{InstagramFetcher, PagedFetcher};
use socialgraph::output::write_outputs;
use socialgraph::{Config, Retrier};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "socialgraph")]
#[command(about = "Extract follower/following graphs from a social network")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the follow graph around a seed account
    Graph {
        /// Seed account: numeric id or username
        seed: String,

        /// Maximum hops from the seed (e.g. 2, or 1.5 for edges-only last hop)
        #[arg(short, long)]
        depth: Option<MaxDepth>,

        /// Maximum followers/followees to page through per account (0 = no limit)
        #[arg(short, long)]
        max_follow: Option<usize>,

        /// Where to write the id -> username mapping
        #[arg(long)]
        users_file: Option<PathBuf>,

        /// Where to write the follower -> followed edges
        #[arg(long)]
        graph_file: Option<PathBuf>,

        /// SQLite checkpoint database
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Continue the run stored in the checkpoint
        #[arg(long)]
        resume: bool,
    },

    /// Look up account ids by username
    Id {
        username: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();

    let mut config = Config::load()?;
    log::debug!("Configuration loaded");

    match args.command {
        Command::Graph {
            seed,
            depth,
            max_follow,
            users_file,
            graph_file,
            checkpoint,
            resume,
        } => {
            if let Some(depth) = depth {
                config.crawl.max_depth = depth;
            }
            if let Some(max_follow) = max_follow {
                config.crawl.max_follow = max_follow;
            }
            if let Some(path) = users_file {
                config.output.users_file = path;
            }
            if let Some(path) = graph_file {
                config.output.graph_file = path;
            }
            if checkpoint.is_some() {
                config.output.checkpoint_db = checkpoint;
            }
            config.validate()?;

            run_graph(&config, &seed, resume).await
        }
        Command::Id { username } => run_id(&config, &username).await,
    }
}

async fn run_graph(config: &Config, seed: &str, resume: bool) -> Result<()> {
    let seed = validate_seed(seed)?;
    let options = config.crawl_options();
    let policy = config.retry_policy();
    let fetcher = InstagramFetcher::from_env(&config.instagram, options.max_follow)?;

    let checkpoint = match &config.output.checkpoint_db {
        Some(path) => Some(
            Checkpoint::open(path)
                .await
                .with_context(|| format!("Failed to open checkpoint {}", path.display()))?,
        ),
        None => None,
    };

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, finishing the current account (press again to quit)");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }

    let crawler = if resume {
        let checkpoint = checkpoint
            .as_ref()
            .context("--resume needs a checkpoint database")?;
        let state = checkpoint
            .load()
            .await?
            .with_context(|| format!("No crawl stored in {}", checkpoint.path().display()))?;

        Crawler::resume(&fetcher, state, seed, options, policy)?.with_checkpoint(checkpoint)
    } else {
        let retrier = Retrier::new(policy.clone());
        let seed = retrier
            .execute(&format!("lookup of {}", seed), || fetcher.resolve_seed(seed))
            .await?;
        log::info!("Seed: {} ({})", seed.username, seed.external_id);

        let crawler = Crawler::new(&fetcher, seed, options, policy);
        match &checkpoint {
            Some(checkpoint) => crawler.with_checkpoint(checkpoint),
            None => crawler,
        }
    };

    let outcome = crawler.with_cancel_flag(cancel).run().await?;

    write_outputs(
        &outcome.registry,
        &outcome.edges,
        &config.output.users_file,
        &config.output.graph_file,
    )?;

    if outcome.report.interrupted {
        log::warn!("Crawl was interrupted; outputs are partial");
        if let Some(checkpoint) = &checkpoint {
            log::info!(
                "{} account(s) still pending; rerun with --resume to continue",
                checkpoint.pending_count().await?
            );
        }
    }
    for failure in &outcome.report.failures {
        log::warn!(
            "Incomplete: {} of {}: {}",
            failure.direction,
            failure.external_id,
            failure.error
        );
    }

    println!("Finished: {} nodes", outcome.registry.len());
    Ok(())
}

async fn run_id(config: &Config, username: &str) -> Result<()> {
    let fetcher = InstagramFetcher::from_env(&config.instagram, None)?;
    let retrier = Retrier::new(config.retry_policy());

    let accounts = retrier
        .execute(&format!("search for {}", username), || fetcher.search(username))
        .await?;

    if accounts.is_empty() {
        log::warn!("No accounts match '{}'", username);
    }
    for account in accounts {
        println!("{:>20} {}", account.username, account.external_id);
    }
    Ok(())
}
