/// Authenticated identity handed to the core by the auth collaborator.
///
/// The core only reads it. A session without a token cannot connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub auth_token: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_token: Some(auth_token.into()),
        }
    }

    /// A session whose token was lost or expired.
    pub fn without_token(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_token: None,
        }
    }

    /// The bearer token, if present and non-blank.
    pub fn token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}
