use std::collections::HashSet;

use crate::path::StatePath;

/// Paths already subscribed on the current socket, plus those waiting to be
/// sent in the next `Register` command.
#[derive(Debug, Default)]
pub struct Registrations {
    registered: HashSet<StatePath>,
    pending: Vec<StatePath>,
}

impl Registrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, path: &StatePath) -> bool {
        self.registered.contains(path)
    }

    pub fn is_pending(&self, path: &StatePath) -> bool {
        self.pending.contains(path)
    }

    /// Queue `path` unless it is registered or already queued. Returns true
    /// if it was newly queued.
    pub fn request(&mut self, path: &StatePath) -> bool {
        if self.is_registered(path) || self.is_pending(path) {
            return false;
        }
        self.pending.push(path.clone());
        true
    }

    pub fn pending(&self) -> &[StatePath] {
        &self.pending
    }

    /// Drain the pending list into the registered set, returning what should
    /// go out in one `Register` command.
    pub fn take_batch(&mut self) -> Option<Vec<StatePath>> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.pending);
        self.registered.extend(batch.iter().cloned());
        Some(batch)
    }

    /// Put back a batch that could not be sent, ahead of anything queued
    /// since.
    pub fn requeue(&mut self, batch: Vec<StatePath>) {
        for path in &batch {
            self.registered.remove(path);
        }
        let newer = std::mem::replace(&mut self.pending, batch);
        for path in newer {
            if !self.pending.contains(&path) {
                self.pending.push(path);
            }
        }
    }

    /// A new socket knows nothing of the old one's subscriptions. Paths are
    /// re-registered lazily on their next read.
    pub fn forget_registered(&mut self) {
        self.registered.clear();
    }

    pub fn clear(&mut self) {
        self.registered.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> StatePath {
        StatePath::parse(s)
    }

    #[test]
    fn duplicate_requests_collapse() {
        let mut regs = Registrations::new();
        assert!(regs.request(&p("Game(g1).Score")));
        assert!(!regs.request(&p("Game(g1).Score")));
        assert_eq!(regs.take_batch(), Some(vec![p("Game(g1).Score")]));
    }

    #[test]
    fn batch_moves_paths_to_registered() {
        let mut regs = Registrations::new();
        regs.request(&p("A"));
        regs.request(&p("B"));
        let batch = regs.take_batch().unwrap();
        assert_eq!(batch, vec![p("A"), p("B")]);
        assert!(regs.pending().is_empty());
        assert!(regs.is_registered(&p("A")));
        assert!(!regs.request(&p("B")));
        assert_eq!(regs.take_batch(), None);
    }

    #[test]
    fn forgetting_keeps_pending() {
        let mut regs = Registrations::new();
        regs.request(&p("A"));
        regs.take_batch();
        regs.request(&p("B"));
        regs.forget_registered();
        assert!(!regs.is_registered(&p("A")));
        assert!(regs.is_pending(&p("B")));
        assert!(regs.request(&p("A")));
    }

    #[test]
    fn requeued_batch_goes_first_and_is_unregistered() {
        let mut regs = Registrations::new();
        regs.request(&p("A"));
        regs.request(&p("B"));
        let batch = regs.take_batch().unwrap();
        regs.request(&p("C"));
        regs.requeue(batch);
        assert!(!regs.is_registered(&p("A")));
        assert_eq!(regs.pending(), &[p("A"), p("B"), p("C")]);
        assert!(!regs.request(&p("A")));
    }

    #[test]
    fn clear_drops_everything() {
        let mut regs = Registrations::new();
        regs.request(&p("A"));
        regs.take_batch();
        regs.request(&p("B"));
        regs.clear();
        assert!(!regs.is_registered(&p("A")));
        assert!(regs.pending().is_empty());
    }
}
