//! # Backtrackable Store
//!
//! A trail of undo events with `store`/`restore` bracket semantics. Every
//! backtrackable piece of state (domains, bounds, cost tables, counters)
//! records an undo event on the trail when it changes; restoring to a saved
//! depth replays the events in reverse through an undo closure.

/// A trail of undo events representing the changes to a data structure, with
/// save points to backtrack to.
///
/// Events pushed before the first save point are discarded, as there is no
/// state to restore them to.
#[derive(Debug, Clone)]
pub struct Trail<Event> {
    events: Vec<Event>,
    saved: Vec<usize>,
}

impl<Event> Default for Trail<Event> {
    fn default() -> Self {
        Trail::new()
    }
}

impl<Event> Trail<Event> {
    /// Creates a new empty trail
    #[must_use]
    pub fn new() -> Self {
        Trail {
            events: vec![],
            saved: vec![],
        }
    }

    /// Records an undo event. The event is dropped if no save point exists
    /// yet, since nothing could be restored to.
    pub fn push(&mut self, event: Event) {
        if !self.saved.is_empty() {
            self.events.push(event);
        }
    }

    /// Pushes a save point and returns the depth to restore to
    pub fn store(&mut self) -> usize {
        self.saved.push(self.events.len());
        self.saved.len() - 1
    }

    /// The current number of save points
    #[must_use]
    pub fn depth(&self) -> usize {
        self.saved.len()
    }

    /// Restores to the given depth, applying `undo` to each event in reverse
    /// recording order
    ///
    /// # Panics
    ///
    /// If `depth` is larger than the current [`Trail::depth`].
    pub fn restore(&mut self, depth: usize, mut undo: impl FnMut(Event)) {
        assert!(depth <= self.saved.len(), "restoring to an unsaved depth");
        while self.saved.len() > depth {
            let mark = self.saved.pop().expect("no save point left");
            while self.events.len() > mark {
                let event = self.events.pop().expect("trail shorter than save point");
                undo(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Trail;

    #[test]
    fn store_restore_brackets() {
        let mut val = 0_i32;
        let mut trail = Trail::new();
        let depth = trail.store();
        trail.push(0);
        val = 1;
        trail.store();
        trail.push(1);
        val = 2;
        trail.restore(depth, |old| val = old);
        assert_eq!(val, 0);
        assert_eq!(trail.depth(), 0);
    }

    #[test]
    fn events_before_first_store_dropped() {
        let mut trail: Trail<i32> = Trail::new();
        trail.push(42);
        let depth = trail.store();
        trail.push(43);
        let mut undone = vec![];
        trail.restore(depth, |e| undone.push(e));
        assert_eq!(undone, vec![43]);
    }
}
