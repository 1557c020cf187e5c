//! The poll scheduler: pulls due sources from the registry and runs the
//! fetch → parse → ingest pipeline for each with bounded parallelism.
//!
//! Every pipeline error is caught here, recorded on its own source and never
//! allowed to disturb another source's poll.

use futures::stream::{self, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::poll::fetcher::{FetchError, FetchOutcome, Fetcher};
use crate::poll::ingest;
use crate::poll::parser::{self, ParseError};
use crate::poll::proxy_pool::ProxyPool;
use crate::storage::{Database, Source, StorageError};

/// Backoff exponent cap: 2^6 = 64x the base interval, before the absolute cap.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Anything that can go wrong while polling one source.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PollError {
    fn status(&self) -> Option<u16> {
        match self {
            PollError::Fetch(err) => err.status(),
            _ => None,
        }
    }

    /// Short free-text summary recorded into the source's `last_result`.
    fn summary(&self) -> String {
        let text = self.to_string();
        if text.len() > 255 {
            return text.chars().take(255).collect();
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSuccess {
    pub status: u16,
    pub new_posts: usize,
    /// Entries the parser had to drop for lack of identity.
    pub skipped: usize,
    /// True for a 304: nothing was parsed or ingested.
    pub unchanged: bool,
}

/// Per-source result of one poll cycle.
#[derive(Debug)]
pub struct PollOutcome {
    pub source_id: i64,
    pub result: Result<PollSuccess, PollError>,
}

/// Backoff applied to `due_at` after `failures` consecutive failures.
/// The base interval is never mutated; only the effective wait grows.
fn backoff_secs(interval_secs: i64, failures: i64, cap_secs: i64) -> i64 {
    let shift = failures.clamp(1, MAX_BACKOFF_SHIFT as i64) as u32;
    let backoff = interval_secs
        .max(1)
        .saturating_mul(1i64 << shift);
    backoff.min(cap_secs.max(1)).max(1)
}

/// Poll every live source due at `now`, oldest-due first.
///
/// Returns one outcome per polled source. When `shutdown` flips during the
/// cycle, sources not yet started are left for the next cycle; their
/// `due_at` is untouched.
pub async fn poll_due_sources(
    db: &Database,
    fetcher: &Fetcher,
    proxies: &ProxyPool,
    config: &Config,
    now: i64,
    shutdown: Option<&watch::Receiver<bool>>,
) -> Result<Vec<PollOutcome>, StorageError> {
    let due = db.due_sources(now).await?;
    if due.is_empty() {
        return Ok(Vec::new());
    }
    tracing::info!(due = due.len(), "Polling due sources");

    let outcomes: Vec<Option<PollOutcome>> = stream::iter(due.into_iter())
        .map(|source| async move {
            if shutdown.is_some_and(|s| *s.borrow()) {
                tracing::debug!(source = %source.feed_url, "Shutdown requested, skipping source");
                return None;
            }
            let source_id = source.id;
            let result = poll_one(db, fetcher, proxies, config, &source, now).await;
            Some(PollOutcome { source_id, result })
        })
        .buffer_unordered(config.workers.max(1))
        .collect()
        .await;

    Ok(outcomes.into_iter().flatten().collect())
}

/// Run the pipeline for one source and record its outcome. Never lets an
/// error escape unrecorded.
async fn poll_one(
    db: &Database,
    fetcher: &Fetcher,
    proxies: &ProxyPool,
    config: &Config,
    source: &Source,
    now: i64,
) -> Result<PollSuccess, PollError> {
    match pipeline(db, fetcher, proxies, source, now).await {
        Ok(success) => {
            tracing::debug!(
                source = %source.feed_url,
                status = success.status,
                new_posts = success.new_posts,
                "Poll complete"
            );
            Ok(success)
        }
        Err(err) => {
            tracing::warn!(source = %source.feed_url, error = %err, "Poll failed");

            let failures = source.consecutive_failures + 1;
            let backoff = backoff_secs(source.interval_secs, failures, config.max_backoff_secs);
            let suspend = failures >= config.failure_threshold;
            if suspend {
                tracing::warn!(
                    source = %source.feed_url,
                    failures = failures,
                    "Suspending source after consecutive failures"
                );
            }
            if let Err(db_err) = db
                .record_failure(source.id, now, &err.summary(), err.status(), now + backoff, suspend)
                .await
            {
                tracing::error!(
                    source_id = source.id,
                    error = %db_err,
                    "Failed to record poll failure"
                );
            }
            Err(err)
        }
    }
}

async fn pipeline(
    db: &Database,
    fetcher: &Fetcher,
    proxies: &ProxyPool,
    source: &Source,
    now: i64,
) -> Result<PollSuccess, PollError> {
    match fetcher.fetch(source, proxies).await? {
        FetchOutcome::NotModified { status } => {
            // Unchanged feed: no parse, no ingest, but the clock advances
            db.record_unchanged(source.id, now, status).await?;
            Ok(PollSuccess {
                status,
                new_posts: 0,
                skipped: 0,
                unchanged: true,
            })
        }
        FetchOutcome::Fetched(feed) => {
            let parsed = parser::parse(&feed.body)?;
            if parsed.skipped > 0 {
                tracing::warn!(
                    source = %source.feed_url,
                    skipped = parsed.skipped,
                    "Entries without derivable identity skipped"
                );
            }
            let skipped = parsed.skipped;

            let new_posts = ingest::ingest(db, source.id, parsed.entries, now).await?;

            if let Some(target) = &feed.redirected_to {
                db.note_redirect(source.id, target, now).await?;
            }
            if feed.via_proxy && !source.is_cloudflare {
                tracing::info!(source = %source.feed_url, "Marking source as Cloudflare-fronted");
                db.set_cloudflare(source.id, true).await?;
            }
            db.backfill_metadata(source.id, parsed.title.as_deref(), parsed.site_url.as_deref())
                .await?;
            db.record_success(
                source.id,
                now,
                feed.status,
                feed.etag.as_deref(),
                feed.last_modified.as_deref(),
                new_posts,
            )
            .await?;

            Ok(PollSuccess {
                status: feed.status,
                new_posts,
                skipped,
                unchanged: false,
            })
        }
    }
}

/// Daemon loop: poll due sources every `tick_secs` until shutdown.
///
/// The shutdown signal is honored between sources as well as between
/// cycles; an in-flight pipeline always finishes its commit-or-nothing
/// recording before the loop exits.
pub async fn run(
    db: Database,
    fetcher: Fetcher,
    proxies: ProxyPool,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), StorageError> {
    let mut tick = tokio::time::interval(Duration::from_secs(config.tick_secs.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Read-only view handed to the cycle so workers can stop mid-queue,
    // while the loop below waits on the original receiver.
    let shutdown_view = shutdown.clone();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = chrono::Utc::now().timestamp();
                match poll_due_sources(&db, &fetcher, &proxies, &config, now, Some(&shutdown_view)).await {
                    Ok(outcomes) if !outcomes.is_empty() => {
                        let ok = outcomes.iter().filter(|o| o.result.is_ok()).count();
                        let new_posts: usize = outcomes
                            .iter()
                            .filter_map(|o| o.result.as_ref().ok())
                            .map(|s| s.new_posts)
                            .sum();
                        tracing::info!(
                            polled = outcomes.len(),
                            ok = ok,
                            failed = outcomes.len() - ok,
                            new_posts = new_posts,
                            "Poll cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "Poll cycle failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        // 400s base: 800, 1600, 3200, ...
        assert_eq!(backoff_secs(400, 1, 86_400), 800);
        assert_eq!(backoff_secs(400, 2, 86_400), 1600);
        assert_eq!(backoff_secs(400, 3, 86_400), 3200);
        // Shift saturates at 2^6
        assert_eq!(backoff_secs(400, 6, 86_400), 25_600);
        assert_eq!(backoff_secs(400, 20, 86_400), 25_600);
        // Absolute cap wins over the exponent
        assert_eq!(backoff_secs(400, 20, 10_000), 10_000);
    }

    #[test]
    fn test_backoff_is_always_positive() {
        assert!(backoff_secs(0, 1, 86_400) >= 1);
        assert!(backoff_secs(1, 1, 1) >= 1);
        // Pathological inputs still cannot schedule into the past
        assert!(backoff_secs(i64::MAX, 20, 86_400) >= 1);
    }

    #[test]
    fn test_error_summary_is_bounded() {
        let err = PollError::Fetch(FetchError::Http(404));
        assert_eq!(err.summary(), "HTTP error: status 404");
        assert_eq!(err.status(), Some(404));

        let err = PollError::Fetch(FetchError::Timeout);
        assert_eq!(err.status(), None);
        assert!(err.summary().len() <= 255);
    }
}
