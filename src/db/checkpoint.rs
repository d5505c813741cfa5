//! Crawl checkpoint: per-node commits of registry, edges and frontier so an
//! interrupted crawl can resume where it stopped.

use chrono::Utc;
use rusqlite::params;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use super::{migrate, Db};
use crate::crawl::{FrontierEntry, MaxDepth};
use crate::error::{Result, SocialGraphError};
use crate::fetch::Account;
use crate::graph::{Edge, RegistryEntry};

/// Everything a resumed crawl needs.
#[derive(Debug, Clone)]
pub struct CrawlState {
    pub run_id: String,
    pub started_at: String,
    pub seed: Account,
    pub max_depth: MaxDepth,
    pub accounts: Vec<RegistryEntry>,
    /// Edges in discovery order.
    pub edges: Vec<Edge>,
    /// Frontier entries in enqueue order, with their expanded flag.
    pub frontier: Vec<(FrontierEntry, bool)>,
}

/// Changes produced by one node expansion, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct CheckpointBatch {
    /// New accounts and renamed ones.
    pub accounts: Vec<RegistryEntry>,
    pub edges: Vec<Edge>,
    pub enqueued: Vec<FrontierEntry>,
    /// External id of the node whose expansion finished.
    pub expanded: Option<String>,
}

impl CheckpointBatch {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.edges.is_empty()
            && self.enqueued.is_empty()
            && self.expanded.is_none()
    }
}

/// SQLite-backed checkpoint for a single crawl.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    db: Db,
}

impl Checkpoint {
    /// Open (or create) the checkpoint database and apply its schema.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = Db::new(path);
        db.with_connection(migrate::run_migrations).await?;
        Ok(Self { db })
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    /// Discard any previous run and record the seed as account 1 at hop 0.
    /// Returns the new run id.
    pub async fn start_run(&self, seed: &Account, max_depth: MaxDepth) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();
        let seed = seed.clone();
        let meta = vec![
            ("run_id", run_id.clone()),
            ("started_at", started_at),
            ("seed_external_id", seed.external_id.clone()),
            ("seed_username", seed.username.clone()),
            ("max_depth", max_depth.to_string()),
        ];

        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(
                    "DELETE FROM edges; DELETE FROM frontier; DELETE FROM accounts; DELETE FROM crawl_meta;",
                )?;
                for (key, value) in &meta {
                    tx.execute(
                        "INSERT INTO crawl_meta (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                tx.execute(
                    "INSERT INTO accounts (numeric_id, external_id, username) VALUES (1, ?1, ?2)",
                    params![seed.external_id, seed.username],
                )?;
                tx.execute(
                    "INSERT INTO frontier (external_id, numeric_id, hop) VALUES (?1, 1, 0)",
                    params![seed.external_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(run_id)
    }

    /// Commit one node's changes in a single transaction.
    pub async fn commit(&self, batch: CheckpointBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut upsert_account = tx.prepare(
                        "INSERT INTO accounts (numeric_id, external_id, username) VALUES (?1, ?2, ?3) \
                         ON CONFLICT(numeric_id) DO UPDATE SET username = excluded.username",
                    )?;
                    for entry in &batch.accounts {
                        upsert_account.execute(params![entry.id as i64, entry.external_id, entry.username])?;
                    }

                    let mut insert_edge = tx.prepare(
                        "INSERT OR IGNORE INTO edges (follower, followed) VALUES (?1, ?2)",
                    )?;
                    for edge in &batch.edges {
                        insert_edge.execute(params![edge.follower as i64, edge.followed as i64])?;
                    }

                    let mut insert_frontier = tx.prepare(
                        "INSERT OR IGNORE INTO frontier (external_id, numeric_id, hop) VALUES (?1, ?2, ?3)",
                    )?;
                    for entry in &batch.enqueued {
                        insert_frontier.execute(params![entry.external_id, entry.id as i64, entry.hop])?;
                    }

                    if let Some(external_id) = &batch.expanded {
                        tx.execute(
                            "UPDATE frontier SET expanded = 1 WHERE external_id = ?1",
                            params![external_id],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Load the stored run, or `None` if no run was started.
    pub async fn load(&self) -> Result<Option<CrawlState>> {
        self.db
            .with_connection(|conn| {
                let mut meta = HashMap::new();
                {
                    let mut stmt = conn.prepare("SELECT key, value FROM crawl_meta")?;
                    let rows = stmt.query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    for row in rows {
                        let (key, value) = row?;
                        meta.insert(key, value);
                    }
                }
                if meta.is_empty() {
                    return Ok(None);
                }

                let mut take = |key: &str| {
                    meta.remove(key).ok_or_else(|| {
                        SocialGraphError::Config(format!("checkpoint is missing '{}'", key))
                    })
                };
                let run_id = take("run_id")?;
                let started_at = take("started_at")?;
                let seed = Account {
                    external_id: take("seed_external_id")?,
                    username: take("seed_username")?,
                };
                let max_depth: MaxDepth = take("max_depth")?.parse()?;

                let accounts = conn
                    .prepare("SELECT numeric_id, external_id, username FROM accounts ORDER BY numeric_id")?
                    .query_map([], |row| {
                        Ok(RegistryEntry {
                            id: row.get::<_, i64>(0)? as u64,
                            external_id: row.get(1)?,
                            username: row.get(2)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

                let edges = conn
                    .prepare("SELECT follower, followed FROM edges ORDER BY seq")?
                    .query_map([], |row| {
                        Ok(Edge::new(row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

                let frontier = conn
                    .prepare("SELECT external_id, numeric_id, hop, expanded FROM frontier ORDER BY seq")?
                    .query_map([], |row| {
                        Ok((
                            FrontierEntry {
                                external_id: row.get(0)?,
                                id: row.get::<_, i64>(1)? as u64,
                                hop: row.get(2)?,
                            },
                            row.get::<_, i64>(3)? != 0,
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

                Ok(Some(CrawlState {
                    run_id,
                    started_at,
                    seed,
                    max_depth,
                    accounts,
                    edges,
                    frontier,
                }))
            })
            .await
    }

    /// Number of frontier entries not yet expanded.
    pub async fn pending_count(&self) -> Result<usize> {
        self.db
            .with_connection(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM frontier WHERE expanded = 0", [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed() -> Account {
        Account::new("100", "alice").unwrap()
    }

    #[tokio::test]
    async fn test_load_without_run_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::open(temp_dir.path().join("crawl.db")).await.unwrap();
        assert!(checkpoint.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_run_records_seed() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::open(temp_dir.path().join("crawl.db")).await.unwrap();
        let run_id = checkpoint.start_run(&seed(), MaxDepth::with_half_hop(2)).await.unwrap();

        let state = checkpoint.load().await.unwrap().unwrap();
        assert_eq!(state.run_id, run_id);
        assert_eq!(state.seed, seed());
        assert_eq!(state.max_depth, MaxDepth::with_half_hop(2));
        assert_eq!(state.accounts.len(), 1);
        assert_eq!(state.accounts[0].id, 1);
        assert_eq!(state.frontier.len(), 1);
        assert_eq!(state.frontier[0].0.hop, 0);
        assert!(!state.frontier[0].1);
        assert_eq!(checkpoint.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_persists_batch_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::open(temp_dir.path().join("crawl.db")).await.unwrap();
        checkpoint.start_run(&seed(), MaxDepth::new(2)).await.unwrap();

        checkpoint
            .commit(CheckpointBatch {
                accounts: vec![
                    RegistryEntry { id: 2, external_id: "200".into(), username: "bob".into() },
                    RegistryEntry { id: 3, external_id: "300".into(), username: "carol".into() },
                ],
                edges: vec![Edge::new(1, 3), Edge::new(1, 2), Edge::new(1, 3)],
                enqueued: vec![
                    FrontierEntry { external_id: "300".into(), id: 3, hop: 1 },
                    FrontierEntry { external_id: "200".into(), id: 2, hop: 1 },
                ],
                expanded: Some("100".into()),
            })
            .await
            .unwrap();
        checkpoint
            .commit(CheckpointBatch {
                accounts: vec![RegistryEntry { id: 2, external_id: "200".into(), username: "bobby".into() }],
                ..Default::default()
            })
            .await
            .unwrap();

        let state = checkpoint.load().await.unwrap().unwrap();
        assert_eq!(
            state.accounts.iter().map(|a| a.username.as_str()).collect::<Vec<_>>(),
            vec!["alice", "bobby", "carol"]
        );
        assert_eq!(state.edges, vec![Edge::new(1, 3), Edge::new(1, 2)]);
        let frontier: Vec<_> = state
            .frontier
            .iter()
            .map(|(e, expanded)| (e.external_id.as_str(), *expanded))
            .collect();
        assert_eq!(frontier, vec![("100", true), ("300", false), ("200", false)]);
        assert_eq!(checkpoint.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_start_run_discards_previous_run() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::open(temp_dir.path().join("crawl.db")).await.unwrap();
        checkpoint.start_run(&seed(), MaxDepth::new(1)).await.unwrap();
        checkpoint
            .commit(CheckpointBatch {
                accounts: vec![RegistryEntry { id: 2, external_id: "200".into(), username: "bob".into() }],
                edges: vec![Edge::new(1, 2)],
                ..Default::default()
            })
            .await
            .unwrap();

        let other = Account::new("900", "zed").unwrap();
        checkpoint.start_run(&other, MaxDepth::new(3)).await.unwrap();

        let state = checkpoint.load().await.unwrap().unwrap();
        assert_eq!(state.seed, other);
        assert_eq!(state.accounts.len(), 1);
        assert!(state.edges.is_empty());
    }
}
