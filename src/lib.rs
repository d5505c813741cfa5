pub mod config;
pub mod error;
pub mod fetch;
pub mod retry;
pub mod graph;
pub mod crawl;
pub mod db;
pub mod output;

pub use config::Config;
pub use crawl::{crawl, validate_seed, CancelFlag, CrawlOptions, CrawlOutcome, Crawler, FailurePolicy, MaxDepth};
pub use error::{Result, SocialGraphError};
pub use fetch::{Account, Direction, FetchError, Page, PagedFetcher};
pub use graph::{AccountRegistry, Edge, EdgeSet};
pub use retry::{Retrier, RetryPolicy};
