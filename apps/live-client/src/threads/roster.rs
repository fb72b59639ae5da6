//! Display-name resolution for message senders.

use std::collections::HashMap;

use crate::models::participant::Participant;

/// Participant labels for one event, fetched once per open board.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    names: HashMap<String, String>,
    loaded: bool,
}

impl Roster {
    pub fn from_participants(participants: Vec<Participant>) -> Self {
        let names = participants
            .into_iter()
            .filter_map(|p| {
                let label = p.label()?.to_string();
                Some((p.id, label))
            })
            .collect();
        Self { names, loaded: true }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Label for `user_id`. Never blank: unknown ids get a stable placeholder.
    pub fn display_name(&self, user_id: &str) -> String {
        match self.names.get(user_id) {
            Some(name) => name.clone(),
            None => placeholder_name(user_id),
        }
    }
}

/// Stable label derived from the id itself.
pub fn placeholder_name(user_id: &str) -> String {
    let id = user_id.trim();
    if id.is_empty() {
        return "Unknown participant".to_string();
    }
    let tail: String = id
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("Participant #{tail}")
}
