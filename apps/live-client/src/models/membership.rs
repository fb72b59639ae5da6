use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Response of the event-membership collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEvents {
    #[serde(default)]
    pub created_event_ids: Vec<String>,
    #[serde(default)]
    pub participating_event_ids: Vec<String>,
}

impl UserEvents {
    /// Created ∪ participating, without blanks or duplicates.
    pub fn event_ids(&self) -> BTreeSet<String> {
        self.created_event_ids
            .iter()
            .chain(&self.participating_event_ids)
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .collect()
    }
}
