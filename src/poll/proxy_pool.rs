//! Shared pool of candidate proxy addresses for Cloudflare-blocked fetches.
//!
//! Selection is score-based rather than exclusive: a failing proxy drifts to
//! the back of the candidate order but stays available, since public proxies
//! come and go and a transient failure says little.

use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ProxyPool {
    entries: Mutex<Vec<ProxyEntry>>,
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    address: String,
    failures: u32,
}

impl ProxyPool {
    pub fn new(addresses: Vec<String>) -> Self {
        let entries = addresses
            .into_iter()
            .map(|address| ProxyEntry {
                address,
                failures: 0,
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("proxy pool lock poisoned").is_empty()
    }

    /// Candidate addresses, least-failed first. Ties keep registration order.
    pub fn candidates(&self) -> Vec<String> {
        let mut entries = self
            .entries
            .lock()
            .expect("proxy pool lock poisoned")
            .clone();
        entries.sort_by_key(|e| e.failures);
        entries.into_iter().map(|e| e.address).collect()
    }

    pub fn record_failure(&self, address: &str) {
        let mut entries = self.entries.lock().expect("proxy pool lock poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.address == address) {
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    /// A success clears the score; the proxy has proven itself again.
    pub fn record_success(&self, address: &str) {
        let mut entries = self.entries.lock().expect("proxy pool lock poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.address == address) {
            entry.failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ProxyPool {
        ProxyPool::new(vec![
            "http://a:8080".to_string(),
            "http://b:8080".to_string(),
            "http://c:8080".to_string(),
        ])
    }

    #[test]
    fn test_candidates_keep_registration_order_initially() {
        let p = pool();
        assert_eq!(p.candidates(), vec!["http://a:8080", "http://b:8080", "http://c:8080"]);
    }

    #[test]
    fn test_failures_deprioritize_without_removing() {
        let p = pool();
        p.record_failure("http://a:8080");
        p.record_failure("http://a:8080");
        p.record_failure("http://b:8080");

        assert_eq!(p.candidates(), vec!["http://c:8080", "http://b:8080", "http://a:8080"]);
        assert_eq!(p.candidates().len(), 3, "failed proxies stay in the pool");
    }

    #[test]
    fn test_success_resets_score() {
        let p = pool();
        p.record_failure("http://a:8080");
        p.record_failure("http://a:8080");
        p.record_success("http://a:8080");

        assert_eq!(p.candidates()[0], "http://a:8080");
    }

    #[test]
    fn test_empty_pool() {
        let p = ProxyPool::new(Vec::new());
        assert!(p.is_empty());
        assert!(p.candidates().is_empty());
    }
}
