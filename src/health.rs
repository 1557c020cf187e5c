//! Derived source state, computed on demand from plain fields.
//!
//! These are pure functions so the presentation layer (whatever it ends up
//! being) can call them without the storage layer knowing about display
//! concerns. Color rendering is intentionally not done here.

/// Staleness signal for a source, derived from its polling history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Polling is suspended (`live = false`).
    Suspended,
    /// The source has never completed a successful poll.
    NeverSucceeded,
    /// Days since the feed last produced a new post. 0 = fresh.
    Aging { days: i64 },
}

/// Compute the health of a source from its raw timestamps (Unix seconds).
///
/// A source that is alive but has neither a recorded success nor a recorded
/// change has never been polled successfully, which reads as the worst state
/// short of suspension.
pub fn health(live: bool, last_success: Option<i64>, last_change: Option<i64>, now: i64) -> Health {
    if !live {
        return Health::Suspended;
    }
    match (last_success, last_change) {
        (Some(_), Some(change)) => {
            let days = (now - change).max(0) / 86_400;
            Health::Aging { days }
        }
        _ => Health::NeverSucceeded,
    }
}

/// The site link if the source has one, else the feed URL.
pub fn best_link<'a>(site_url: Option<&'a str>, feed_url: &'a str) -> &'a str {
    match site_url {
        Some(url) if !url.trim().is_empty() => url,
        _ => feed_url,
    }
}

/// Human-facing name for a source: the configured name, else its best link.
pub fn display_name<'a>(name: Option<&'a str>, site_url: Option<&'a str>, feed_url: &'a str) -> &'a str {
    match name {
        Some(n) if !n.trim().is_empty() => n,
        _ => best_link(site_url, feed_url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;

    #[test]
    fn test_suspended_wins_over_everything() {
        let h = health(false, Some(100), Some(100), 100 + 30 * DAY);
        assert_eq!(h, Health::Suspended);
    }

    #[test]
    fn test_never_succeeded() {
        assert_eq!(health(true, None, None, 1000), Health::NeverSucceeded);
        // A success without a recorded change still counts as never-changed
        assert_eq!(health(true, Some(500), None, 1000), Health::NeverSucceeded);
    }

    #[test]
    fn test_aging_days() {
        let start = 1_700_000_000;
        assert_eq!(
            health(true, Some(start), Some(start), start + 3 * DAY + 5),
            Health::Aging { days: 3 }
        );
        assert_eq!(
            health(true, Some(start), Some(start), start),
            Health::Aging { days: 0 }
        );
    }

    #[test]
    fn test_clock_skew_is_not_negative() {
        let start = 1_700_000_000;
        assert_eq!(
            health(true, Some(start), Some(start), start - DAY),
            Health::Aging { days: 0 }
        );
    }

    #[test]
    fn test_best_link_prefers_site_url() {
        assert_eq!(best_link(Some("https://a.example"), "https://a.example/feed"), "https://a.example");
        assert_eq!(best_link(None, "https://a.example/feed"), "https://a.example/feed");
        assert_eq!(best_link(Some("  "), "https://a.example/feed"), "https://a.example/feed");
    }

    #[test]
    fn test_display_name_fallback_chain() {
        assert_eq!(display_name(Some("My Feed"), None, "https://f/rss"), "My Feed");
        assert_eq!(display_name(Some(""), Some("https://f"), "https://f/rss"), "https://f");
        assert_eq!(display_name(None, None, "https://f/rss"), "https://f/rss");
    }
}
