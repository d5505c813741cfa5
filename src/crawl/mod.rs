//! Breadth-first crawl of the follow graph.
//!
//! The crawler expands one level at a time: every node at hop `d` has both its
//! "following" and "followers" pages fetched before any node at hop `d + 1`
//! starts. All network calls go through the [`Retrier`]; the crawler itself
//! never retries.

mod depth;
mod frontier;

pub use depth::{ExpansionMode, MaxDepth};
pub use frontier::{Frontier, FrontierEntry};

use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::db::{Checkpoint, CheckpointBatch, CrawlState};
use crate::error::{Result, SocialGraphError};
use crate::fetch::{Account, Direction, PagedFetcher};
use crate::graph::{AccountRegistry, Edge, EdgeSet};
use crate::retry::{Retrier, RetryPolicy};

/// What to do when a page fetch runs out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the loss, skip the rest of that node, keep crawling.
    #[default]
    SkipNode,
    /// Stop the whole run.
    Abort,
}

/// Per-run crawl settings.
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub max_depth: MaxDepth,
    /// Stop paging a node/direction once this many accounts were returned.
    /// May overshoot by up to one page.
    pub max_follow: Option<usize>,
    pub failure_policy: FailurePolicy,
}

/// Shared flag checked between node expansions.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A node/direction whose expansion was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedExpansion {
    pub external_id: String,
    pub direction: Direction,
    pub error: String,
}

/// Counters and losses of a finished crawl.
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    pub nodes_expanded: usize,
    pub pages_fetched: usize,
    /// Deepest hop whose nodes were all expanded, if any.
    pub deepest_level: Option<u32>,
    pub failures: Vec<FailedExpansion>,
    /// Stopped early through the cancel flag.
    pub interrupted: bool,
}

/// Result of a crawl: the registry and edges for the output writer.
#[derive(Debug)]
pub struct CrawlOutcome {
    pub seed: Account,
    pub registry: AccountRegistry,
    pub edges: EdgeSet,
    pub report: CrawlReport,
}

/// BFS driver over a [`PagedFetcher`].
pub struct Crawler<'a, F> {
    fetcher: &'a F,
    retrier: Retrier,
    options: CrawlOptions,
    seed: Account,
    registry: AccountRegistry,
    edges: EdgeSet,
    frontier: Frontier,
    visited: HashSet<String>,
    report: CrawlReport,
    cancel: Option<CancelFlag>,
    checkpoint: Option<&'a Checkpoint>,
    resumed: bool,
    // checkpoint bookkeeping
    flushed_edges: usize,
    unflushed_enqueued: Vec<FrontierEntry>,
}

impl<'a, F: PagedFetcher> Crawler<'a, F> {
    /// Start a fresh crawl from `seed`, which becomes account 1.
    pub fn new(fetcher: &'a F, seed: Account, options: CrawlOptions, policy: RetryPolicy) -> Self {
        let mut registry = AccountRegistry::new();
        let seed_id = registry.resolve(&seed.external_id, &seed.username);
        let frontier = Frontier::with_seed(&seed.external_id, seed_id);

        Self {
            fetcher,
            retrier: Retrier::new(policy),
            options,
            seed,
            registry,
            edges: EdgeSet::new(),
            frontier,
            visited: HashSet::new(),
            report: CrawlReport::default(),
            cancel: None,
            checkpoint: None,
            resumed: false,
            flushed_edges: 0,
            unflushed_enqueued: Vec::new(),
        }
    }

    /// Continue a checkpointed crawl. `requested_seed` (external id or
    /// username) must name the checkpoint's seed. The stored depth wins over
    /// `options.max_depth`, so hops stay consistent with what was enqueued.
    pub fn resume(
        fetcher: &'a F,
        state: CrawlState,
        requested_seed: &str,
        mut options: CrawlOptions,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let requested_seed = validate_seed(requested_seed)?;
        if state.seed.external_id != requested_seed
            && !state.seed.username.eq_ignore_ascii_case(requested_seed)
        {
            return Err(SocialGraphError::Config(format!(
                "checkpoint was started from {} ({}), not {}",
                state.seed.username, state.seed.external_id, requested_seed
            )));
        }

        if options.max_depth != state.max_depth {
            log::warn!(
                "Checkpoint was started with depth {}, ignoring requested depth {}",
                state.max_depth,
                options.max_depth
            );
            options.max_depth = state.max_depth;
        }

        let registry = AccountRegistry::restore(state.accounts)?;
        if registry.get(&state.seed.external_id) != Some(1) {
            return Err(SocialGraphError::Config(format!(
                "checkpoint seed {} is not account 1",
                state.seed.external_id
            )));
        }

        let edges: EdgeSet = state.edges.into_iter().collect();
        if let Some(edge) = edges
            .iter()
            .find(|e| registry.username(e.follower).is_none() || registry.username(e.followed).is_none())
        {
            return Err(SocialGraphError::Config(format!(
                "checkpoint edge {} -> {} references an unknown account",
                edge.follower, edge.followed
            )));
        }

        let visited = state
            .frontier
            .iter()
            .filter(|(_, expanded)| *expanded)
            .map(|(entry, _)| entry.external_id.clone())
            .collect();
        let frontier = Frontier::restore(state.frontier)?;
        let flushed_edges = edges.len();

        log::info!(
            "Resuming run {} (started {}): {} accounts, {} edges, {} pending at hop {}",
            state.run_id,
            state.started_at,
            registry.len(),
            edges.len(),
            frontier.current_len() + frontier.next_len(),
            frontier.level()
        );

        Ok(Self {
            fetcher,
            retrier: Retrier::new(policy),
            options,
            seed: state.seed,
            registry,
            edges,
            frontier,
            visited,
            report: CrawlReport::default(),
            cancel: None,
            checkpoint: None,
            resumed: true,
            flushed_edges,
            unflushed_enqueued: Vec::new(),
        })
    }

    /// Commit progress to `checkpoint` after every node.
    pub fn with_checkpoint(mut self, checkpoint: &'a Checkpoint) -> Self {
        self.registry.track_changes();
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Stop at the next node boundary once `cancel` is set.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Drive the crawl to completion (or to a controlled stop).
    pub async fn run(mut self) -> Result<CrawlOutcome> {
        let start = Instant::now();

        if let (Some(checkpoint), false) = (self.checkpoint, self.resumed) {
            let run_id = checkpoint.start_run(&self.seed, self.options.max_depth).await?;
            log::info!("Checkpointing run {} to {}", run_id, checkpoint.path().display());
        }

        log::info!(
            "Crawling from {} ({}) with max depth {}",
            self.seed.username,
            self.seed.external_id,
            self.options.max_depth
        );

        'levels: loop {
            let level = self.frontier.level();
            let Some(mode) = self.options.max_depth.mode_at(level) else {
                break;
            };
            let total = self.frontier.current_len();
            if total == 0 {
                break;
            }

            log::info!(
                "Hop {}: expanding {} account(s){}",
                level,
                total,
                if mode == ExpansionMode::EdgesOnly { " (edges only)" } else { "" }
            );

            let mut index = 0;
            loop {
                if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                    log::warn!("Crawl interrupted; stopping before the next expansion");
                    self.report.interrupted = true;
                    break 'levels;
                }
                let Some(entry) = self.frontier.pop_current() else {
                    break;
                };
                index += 1;
                if self.visited.contains(&entry.external_id) {
                    log::debug!("{} already expanded, skipping", entry.external_id);
                    continue;
                }
                log::info!(
                    "[{}/{}] Expanding {} (hop {})",
                    index,
                    total,
                    self.registry.username(entry.id).unwrap_or(&entry.external_id),
                    entry.hop
                );

                self.expand(&entry, mode).await?;
                self.visited.insert(entry.external_id.clone());
                self.report.nodes_expanded += 1;
                self.flush_checkpoint(&entry).await?;
            }

            self.report.deepest_level = Some(level);
            log::info!(
                "Finished hop {}: {} accounts, {} edges so far",
                level,
                self.registry.len(),
                self.edges.len()
            );

            if !self.frontier.advance() {
                break;
            }
        }

        log::info!(
            "Crawl finished in {:?}: {} nodes expanded, {} pages, {} accounts, {} edges",
            start.elapsed(),
            self.report.nodes_expanded,
            self.report.pages_fetched,
            self.registry.len(),
            self.edges.len()
        );
        if !self.report.failures.is_empty() {
            log::warn!(
                "{} expansion(s) were incomplete; the graph is partial",
                self.report.failures.len()
            );
        }

        Ok(CrawlOutcome {
            seed: self.seed,
            registry: self.registry,
            edges: self.edges,
            report: self.report,
        })
    }

    async fn expand(&mut self, entry: &FrontierEntry, mode: ExpansionMode) -> Result<()> {
        for direction in Direction::BOTH {
            match self.expand_direction(entry, direction, mode).await {
                Ok(count) => {
                    log::debug!("{} {}: {} account(s)", entry.external_id, direction, count);
                }
                Err(err @ SocialGraphError::RetriesExhausted { .. })
                    if self.options.failure_policy == FailurePolicy::SkipNode =>
                {
                    log::warn!(
                        "Skipping rest of {} after {} failed: {}",
                        entry.external_id,
                        direction,
                        err
                    );
                    self.report.failures.push(FailedExpansion {
                        external_id: entry.external_id.clone(),
                        direction,
                        error: err.to_string(),
                    });
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Page through one direction of `entry`. Returns the number of account
    /// records seen.
    async fn expand_direction(
        &mut self,
        entry: &FrontierEntry,
        direction: Direction,
        mode: ExpansionMode,
    ) -> Result<usize> {
        let fetcher = self.fetcher;
        let external_id = entry.external_id.as_str();
        let what = format!("{} of {}", direction, external_id);
        let mut cursor: Option<String> = None;
        let mut requested_cursors: HashSet<String> = HashSet::new();
        let mut seen = 0;

        loop {
            let current = cursor.as_deref();
            let page = self
                .retrier
                .execute(&what, move || fetcher.fetch_page(external_id, direction, current))
                .await?;
            self.report.pages_fetched += 1;
            seen += page.accounts.len();

            for account in &page.accounts {
                self.record(entry, direction, account, mode);
            }

            if let Some(limit) = self.options.max_follow {
                if seen >= limit {
                    log::debug!("{}: reached max_follow ({})", what, limit);
                    break;
                }
            }
            let Some(next) = page.next_cursor else {
                break;
            };
            // A cursor already requested means the service is cycling.
            if !requested_cursors.insert(next.clone()) {
                log::warn!("{}: service repeated cursor {}, stopping", what, next);
                break;
            }
            cursor = Some(next);
        }

        Ok(seen)
    }

    fn record(&mut self, node: &FrontierEntry, direction: Direction, account: &Account, mode: ExpansionMode) {
        let other = match mode {
            ExpansionMode::Full => self.registry.resolve(&account.external_id, &account.username),
            ExpansionMode::EdgesOnly => match self.registry.get(&account.external_id) {
                Some(id) => id,
                None => return,
            },
        };

        let edge = match direction {
            Direction::Following => Edge::new(node.id, other),
            Direction::Followers => Edge::new(other, node.id),
        };
        self.edges.insert(edge);

        if mode == ExpansionMode::Full && self.options.max_depth.mode_at(node.hop + 1).is_some() {
            if let Some(queued) = self.frontier.enqueue_next(&account.external_id, other) {
                if self.checkpoint.is_some() {
                    self.unflushed_enqueued.push(queued.clone());
                }
            }
        }
    }

    async fn flush_checkpoint(&mut self, expanded: &FrontierEntry) -> Result<()> {
        let Some(checkpoint) = self.checkpoint else {
            return Ok(());
        };

        let batch = CheckpointBatch {
            accounts: self.registry.take_changes(),
            edges: self.edges.as_slice()[self.flushed_edges..].to_vec(),
            enqueued: std::mem::take(&mut self.unflushed_enqueued),
            expanded: Some(expanded.external_id.clone()),
        };
        checkpoint.commit(batch).await?;
        self.flushed_edges = self.edges.len();
        Ok(())
    }
}

/// Check a seed identifier before any network call. Returns it trimmed.
pub fn validate_seed(identifier: &str) -> Result<&str> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(SocialGraphError::Config(
            "a seed account (id or username) is required".to_string(),
        ));
    }
    Ok(identifier)
}

/// Crawl from `seed` without checkpointing or cancellation.
pub async fn crawl<F: PagedFetcher>(
    fetcher: &F,
    seed: Account,
    options: CrawlOptions,
    policy: RetryPolicy,
) -> Result<CrawlOutcome> {
    Crawler::new(fetcher, seed, options, policy).run().await
}
