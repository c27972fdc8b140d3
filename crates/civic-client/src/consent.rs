use std::collections::HashMap;

use uuid::Uuid;

use civic_types::events::LiveEvent;
use civic_types::models::ConsentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    state: ConsentState,
    /// False while an optimistic answer waits for the server.
    confirmed: bool,
}

/// Client-side mirror of the caller's consent requests. A cache for the
/// prompt UI only; the server decides.
#[derive(Debug, Clone, Default)]
pub struct ConsentInbox {
    entries: HashMap<Uuid, Entry>,
}

impl ConsentInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a live event in. Returns true if it changed the inbox.
    pub fn apply(&mut self, event: &LiveEvent) -> bool {
        match *event {
            LiveEvent::IssueConsentRequest { issue_id } => {
                if self.entries.get(&issue_id).is_some_and(|e| e.state.is_terminal()) {
                    return false;
                }
                self.set(issue_id, ConsentState::Pending, true)
            }
            LiveEvent::IssueConsentUpdated { issue_id, consent } => {
                self.set(issue_id, ConsentState::from_answer(consent), true)
            }
            _ => false,
        }
    }

    /// Replace the pending set with the server's list, e.g. after reconnect.
    /// Decided entries are kept.
    pub fn sync_pending(&mut self, pending: impl IntoIterator<Item = Uuid>) {
        self.entries.retain(|_, e| e.state.is_terminal());
        for issue_id in pending {
            self.entries.insert(
                issue_id,
                Entry {
                    state: ConsentState::Pending,
                    confirmed: true,
                },
            );
        }
    }

    /// Record an answer before the server confirms it. Returns the state to
    /// roll back to if the request fails.
    pub fn answer_optimistically(&mut self, issue_id: Uuid, accept: bool) -> ConsentState {
        let previous = self.state(issue_id);
        self.set(issue_id, ConsentState::from_answer(accept), false);
        previous
    }

    /// Apply the server's authoritative answer.
    pub fn confirm(&mut self, issue_id: Uuid, state: ConsentState) {
        self.set(issue_id, state, true);
    }

    pub fn rollback(&mut self, issue_id: Uuid, previous: ConsentState) {
        if previous == ConsentState::None {
            self.entries.remove(&issue_id);
        } else {
            self.set(issue_id, previous, true);
        }
    }

    pub fn state(&self, issue_id: Uuid) -> ConsentState {
        self.entries.get(&issue_id).map_or(ConsentState::None, |e| e.state)
    }

    pub fn is_confirmed(&self, issue_id: Uuid) -> bool {
        self.entries.get(&issue_id).is_none_or(|e| e.confirmed)
    }

    /// Requests still awaiting an answer, sorted for stable display.
    pub fn pending(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == ConsentState::Pending)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn set(&mut self, issue_id: Uuid, state: ConsentState, confirmed: bool) -> bool {
        let entry = Entry { state, confirmed };
        self.entries.insert(issue_id, entry) != Some(entry)
    }
}
