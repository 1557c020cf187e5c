//! gleaner — a feed aggregation engine.
//!
//! The crate is organized around a single pipeline that the scheduler runs
//! per due source:
//!
//! - [`storage`] - Registry of sources, posts, enclosures, tags, categories
//!   and proxy addresses on SQLite
//! - [`poll`] - Fetcher (conditional GET, redirects, Cloudflare/proxy
//!   fallback), parser (RSS/Atom/JSON-feed normalization), dedup/indexing
//!   and the scheduler itself
//! - [`health`] - Derived, display-independent source state (name fallback,
//!   staleness)
//! - [`config`] - TOML configuration with defaults

pub mod config;
pub mod health;
pub mod poll;
pub mod storage;
