//! Feed normalization over `feed-rs`, which understands RSS, Atom and
//! JSON-feed. A single degenerate entry never aborts the rest of the feed:
//! entries with no derivable identity are skipped and counted.

use feed_rs::model::Entry;
use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The body was not recognizable as any feed format
    #[error("Parse error: {0}")]
    Malformed(#[from] parser::ParseFeedError),
}

/// A normalized feed entry, ready for dedup. `guid` is always non-empty:
/// entries for which no identity could be derived never make it out of the
/// parser.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub guid: String,
    pub link: Option<String>,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    /// Unix seconds from the entry's published (or updated) element.
    pub published: Option<i64>,
    pub enclosures: Vec<RawEnclosure>,
}

#[derive(Debug, Clone)]
pub struct RawEnclosure {
    pub href: String,
    pub length: i64,
    pub mime_type: Option<String>,
    /// `image` / `audio` / `video` when the MIME type makes it obvious.
    pub medium: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug)]
pub struct ParsedFeed {
    /// Feed-level title, used to backfill unnamed sources.
    pub title: Option<String>,
    /// The feed's alternate (site) link.
    pub site_url: Option<String>,
    /// Entries in the order the feed listed them (typically newest first).
    pub entries: Vec<RawEntry>,
    /// Entries dropped because no identity could be derived for them.
    pub skipped: usize,
}

/// Parse feed bytes into normalized entries.
pub fn parse(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| t.content)
        .filter(|t| !t.trim().is_empty());
    // Prefer the alternate link over the feed's self link
    let site_url = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.clone());

    let mut entries = Vec::with_capacity(feed.entries.len());
    let mut skipped = 0;
    for entry in feed.entries {
        match normalize(entry) {
            Some(e) => entries.push(e),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::debug!(skipped, "entries without derivable identity");
    }

    Ok(ParsedFeed {
        title,
        site_url,
        entries,
        skipped,
    })
}

fn normalize(entry: Entry) -> Option<RawEntry> {
    let link = entry.links.first().map(|l| l.href.clone());
    let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let title = entry.title.map(|t| t.content).unwrap_or_default();
    let body = entry
        .content
        .and_then(|c| c.body)
        .or(entry.summary.map(|s| s.content))
        .unwrap_or_default();
    let author = entry
        .authors
        .first()
        .map(|p| p.name.clone())
        .filter(|n| !n.trim().is_empty());

    let guid = derive_guid(&entry.id, link.as_deref(), &title, published, &body)?;

    let mut enclosures = Vec::new();
    for media in entry.media {
        let description = media.description.as_ref().map(|d| d.content.clone());
        for content in media.content {
            let Some(url) = content.url else { continue };
            let mime_type = content.content_type.map(|m| m.to_string());
            let medium = mime_type
                .as_deref()
                .and_then(|m| m.split('/').next())
                .filter(|prefix| matches!(*prefix, "image" | "audio" | "video"))
                .map(str::to_string);
            enclosures.push(RawEnclosure {
                href: url.to_string(),
                length: content.size.map(|s| s as i64).unwrap_or(0),
                mime_type,
                medium,
                description: description.clone(),
            });
        }
    }

    Some(RawEntry {
        guid,
        link,
        title,
        body,
        author,
        published,
        enclosures,
    })
}

/// Stable identity for an entry, doubling as the dedup key.
///
/// Fallback chain: the feed-provided id, else the entry link, else a SHA-256
/// over title, timestamp and body. An entry with none of those has nothing
/// to key on and is skipped by the caller.
fn derive_guid(
    id: &str,
    link: Option<&str>,
    title: &str,
    published: Option<i64>,
    body: &str,
) -> Option<String> {
    let trimmed = id.trim();
    if !trimmed.is_empty() {
        return Some(trimmed.to_string());
    }
    if let Some(link) = link {
        if !link.trim().is_empty() {
            return Some(link.trim().to_string());
        }
    }
    if title.is_empty() && body.is_empty() && published.is_none() {
        return None;
    }
    let input = format!(
        "{}|{}|{}",
        title,
        published.map(|p| p.to_string()).unwrap_or_default(),
        body
    );
    let hash = Sha256::digest(input.as_bytes());
    Some(format!("{:x}", hash))
}
