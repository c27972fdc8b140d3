use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use civic_types::events::LiveEvent;
use civic_types::models::{ChatMessage, Issue};

/// Local view of one thread: fetched history plus a bounded live tail,
/// merged into one chronological list with no duplicate ids.
///
/// The cap bounds the live tail only. History pages are kept whole.
#[derive(Debug, Clone)]
pub struct ChatBuffer {
    history: Vec<ChatMessage>,
    live: VecDeque<ChatMessage>,
    known: HashSet<Uuid>,
    live_window: usize,
    merged: Vec<ChatMessage>,
}

impl ChatBuffer {
    pub fn new(live_window: usize) -> Self {
        Self {
            history: Vec::new(),
            live: VecDeque::new(),
            known: HashSet::new(),
            live_window: live_window.max(1),
            merged: Vec::new(),
        }
    }

    /// Add a fetched page (any page, in any order). Returns how many
    /// messages were new.
    pub fn add_history(&mut self, page: impl IntoIterator<Item = ChatMessage>) -> usize {
        let mut added = 0;
        for message in page {
            if self.known.insert(message.id) {
                added += 1;
            } else if let Some(pos) = self.live.iter().position(|m| m.id == message.id) {
                // History is uncapped; move it out of the live window.
                self.live.remove(pos);
            } else {
                continue;
            }
            self.history.push(message);
        }
        self.rebuild();
        added
    }

    /// Add a live message. Returns false if its id is already known.
    pub fn push_live(&mut self, message: ChatMessage) -> bool {
        if !self.known.insert(message.id) {
            return false;
        }

        self.live.push_back(message);
        while self.live.len() > self.live_window {
            if let Some(evicted) = self.live.pop_front() {
                self.known.remove(&evicted.id);
            }
        }
        self.rebuild();
        true
    }

    /// Merged display list, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.merged
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.known.contains(&id)
    }

    /// Drop everything; refetching afterwards is safe since ids are stable.
    pub fn reset(&mut self) {
        self.history.clear();
        self.live.clear();
        self.known.clear();
        self.merged.clear();
    }

    fn rebuild(&mut self) {
        self.merged.clear();
        self.merged.extend(self.history.iter().cloned());
        self.merged.extend(self.live.iter().cloned());
        self.merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
}

/// Buffers for every open thread, keyed by thread (canonical issue) id.
#[derive(Debug, Clone)]
pub struct ChatBuffers {
    buffers: HashMap<Uuid, ChatBuffer>,
    live_window: usize,
}

impl ChatBuffers {
    pub fn new(live_window: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            live_window,
        }
    }

    /// The thread an issue's chat lives in.
    pub fn thread_of(issue: &Issue) -> Uuid {
        issue.canonical_issue_id.unwrap_or(issue.id)
    }

    pub fn open(&mut self, thread_id: Uuid) -> &mut ChatBuffer {
        let live_window = self.live_window;
        self.buffers
            .entry(thread_id)
            .or_insert_with(|| ChatBuffer::new(live_window))
    }

    pub fn close(&mut self, thread_id: Uuid) {
        self.buffers.remove(&thread_id);
    }

    pub fn get(&self, thread_id: Uuid) -> Option<&ChatBuffer> {
        self.buffers.get(&thread_id)
    }

    /// Route a live event into its open buffer. Messages for threads that
    /// are not open are dropped; they are fetched when the view opens.
    pub fn apply(&mut self, event: &LiveEvent) -> bool {
        match event {
            LiveEvent::IssueChatMessage { issue_id, message } => self
                .buffers
                .get_mut(issue_id)
                .is_some_and(|buffer| buffer.push_live(message.clone())),
            _ => false,
        }
    }

    /// Reset every open buffer, e.g. after the live channel reconnects.
    pub fn reset_all(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.reset();
        }
    }
}
