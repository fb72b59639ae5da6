use serde::{Deserialize, Serialize};

/// Event participant as returned by the roster collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "_id", alias = "userId")]
    pub id: String,
    #[serde(default, alias = "fullName")]
    pub name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Participant {
    /// Best non-blank label the roster has for this participant.
    pub fn label(&self) -> Option<&str> {
        [self.name.as_deref(), self.username.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}
