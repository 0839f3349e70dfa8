//! Apply a change locally at once, then confirm it or replay its inverse
//! once the remote side answers.
//!
//! ```text
//! begin(change) ──► state updated, Ticket issued
//!        │
//!        ├── settle(ticket, true)  ──► change kept
//!        └── settle(ticket, false) ──► change.revert()
//! ```

use std::collections::HashMap;

/// A change that knows how to undo itself.
pub trait Reversible<S> {
    fn apply(&self, state: &mut S);
    fn revert(&self, state: &mut S);
}

/// Handle for an in-flight change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

pub struct Optimistic<S, C: Reversible<S>> {
    state: S,
    pending: HashMap<Ticket, C>,
    next_ticket: u64,
}

impl<S, C: Reversible<S>> Optimistic<S, C> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            pending: HashMap::new(),
            next_ticket: 0,
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_inner(self) -> S {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn begin(&mut self, change: C) -> Ticket {
        change.apply(&mut self.state);
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(ticket, change);
        ticket
    }

    /// Resolve a ticket. Returns false if it was already settled.
    pub fn settle(&mut self, ticket: Ticket, confirmed: bool) -> bool {
        let Some(change) = self.pending.remove(&ticket) else {
            return false;
        };
        if !confirmed {
            log::debug!("Rolling back optimistic change {:?}", ticket);
            change.revert(&mut self.state);
        }
        true
    }
}
