//! Post-restart reclaim window (`spec.md` §4.6): a grace period during
//! which only `reclaim=true` lock/open requests are accepted.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tracks whether the server is still inside its post-restart grace
/// period, and per-client reclaim bookkeeping so the window can close
/// early once every client expected to reclaim has done so.
pub struct GraceManager {
    started_at: Instant,
    duration: Duration,
    expected_clients: usize,
    reclaimed: Mutex<HashSet<String>>,
    forced_exit: Mutex<bool>,
}

impl GraceManager {
    pub fn new(duration: Duration, expected_clients: usize) -> Self {
        Self {
            started_at: Instant::now(),
            duration,
            expected_clients,
            reclaimed: Mutex::new(HashSet::new()),
            forced_exit: Mutex::new(false),
        }
    }

    /// True if the window is still open: the duration has not elapsed and
    /// not every expected client has reclaimed, and nobody forced an exit.
    pub fn is_active(&self) -> bool {
        if *self.forced_exit.lock().unwrap() {
            return false;
        }
        if self.started_at.elapsed() >= self.duration {
            return false;
        }
        if self.expected_clients > 0 {
            let reclaimed = self.reclaimed.lock().unwrap();
            if reclaimed.len() >= self.expected_clients {
                return false;
            }
        }
        true
    }

    /// Record that `client_id` has issued at least one reclaim this grace
    /// period. Once every expected client has reclaimed, the window exits
    /// early on the next `is_active` check.
    pub fn note_reclaim(&self, client_id: &str) {
        self.reclaimed.lock().unwrap().insert(client_id.to_string());
    }

    /// Administratively end the grace period (e.g. operator override).
    pub fn force_exit(&self) {
        *self.forced_exit.lock().unwrap() = true;
    }

    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.started_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exits_early_once_all_expected_clients_reclaim() {
        let grace = GraceManager::new(Duration::from_secs(90), 2);
        assert!(grace.is_active());
        grace.note_reclaim("client-a");
        assert!(grace.is_active());
        grace.note_reclaim("client-b");
        assert!(!grace.is_active());
    }

    #[test]
    fn duplicate_reclaims_from_one_client_do_not_count_twice() {
        let grace = GraceManager::new(Duration::from_secs(90), 2);
        grace.note_reclaim("client-a");
        grace.note_reclaim("client-a");
        assert!(grace.is_active());
    }

    #[test]
    fn force_exit_closes_window_immediately() {
        let grace = GraceManager::new(Duration::from_secs(90), 5);
        assert!(grace.is_active());
        grace.force_exit();
        assert!(!grace.is_active());
    }

    #[test]
    fn expires_after_duration_elapses() {
        let grace = GraceManager::new(Duration::from_millis(10), 5);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!grace.is_active());
    }
}
