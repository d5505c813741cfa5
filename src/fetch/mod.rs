//! Fetcher contract: the shape every per-service client implements.
//!
//! A fetcher returns one page of "following" or "followers" records per call
//! and tags every failure so the retrier can dispatch on it.

pub mod instagram;

pub use instagram::InstagramFetcher;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// An account as reported by a service: external identifier plus username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub external_id: String,
    pub username: String,
}

impl Account {
    /// Build an account record, rejecting values that cannot be written to
    /// the tab-separated outputs.
    pub fn new(external_id: impl Into<String>, username: impl Into<String>) -> Result<Self, FetchError> {
        let external_id = external_id.into();
        let username = username.into();

        if external_id.trim().is_empty() {
            return Err(FetchError::Fatal(format!(
                "account record for '{}' has an empty id",
                username
            )));
        }
        if [&external_id, &username]
            .iter()
            .any(|s| s.contains(['\t', '\n', '\r']))
        {
            return Err(FetchError::Fatal(format!(
                "account record {:?} contains tab or newline characters",
                external_id
            )));
        }

        Ok(Self { external_id, username })
    }
}

/// Which side of the follow relation a page lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accounts the node follows: edges node -> account.
    Following,
    /// Accounts following the node: edges account -> node.
    Followers,
}

impl Direction {
    /// Expansion order for a node.
    pub const BOTH: [Direction; 2] = [Direction::Following, Direction::Followers];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Following => "following",
            Direction::Followers => "followers",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of accounts. `next_cursor == None` means no more pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub accounts: Vec<Account>,
    pub next_cursor: Option<String>,
}

/// Tagged failure of a single network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The service asked us to slow down; `retry_after` is its hint, if any.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Timeouts, resets, 5xx responses.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Auth failures, unknown accounts, malformed responses.
    #[error("{0}")]
    Fatal(String),
}

/// A per-service client the crawler drives.
///
/// Implementations own their session/credentials; the crawler only sees
/// account records and cursors.
#[allow(async_fn_in_trait)]
pub trait PagedFetcher {
    /// Fetch one page of `direction` for `external_id`. `cursor == None`
    /// requests the first page.
    async fn fetch_page(
        &self,
        external_id: &str,
        direction: Direction,
        cursor: Option<&str>,
    ) -> Result<Page, FetchError>;

    /// Look up the seed account from an identifier or username.
    async fn resolve_seed(&self, identifier: &str) -> Result<Account, FetchError>;
}
