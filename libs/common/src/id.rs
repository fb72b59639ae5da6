use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = hackhub_common::id::prefixed_ulid("cmsg");
/// assert!(id.starts_with("cmsg_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that carry a client-generated prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Returns true if `id` looks like an ID minted by [`prefixed_ulid`] with `prefix`.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|ulid| Ulid::from_string(ulid).is_ok())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Idempotency key attached to an outgoing Q&A message.
    pub const CLIENT_MESSAGE: &str = "cmsg";
    /// One live connection attempt (log correlation only).
    pub const CONNECTION: &str = "conn";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ulid_format() {
        let id = prefixed_ulid(prefix::CLIENT_MESSAGE);
        assert!(id.starts_with("cmsg_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn test_uniqueness() {
        let a = prefixed_ulid("conn");
        let b = prefixed_ulid("conn");
        assert_ne!(a, b);
    }

    #[test]
    fn has_prefix_checks_both_parts() {
        let id = prefixed_ulid(prefix::CLIENT_MESSAGE);
        assert!(has_prefix(&id, prefix::CLIENT_MESSAGE));
        assert!(!has_prefix(&id, prefix::CONNECTION));
        assert!(!has_prefix("cmsg_not-a-ulid", prefix::CLIENT_MESSAGE));
        assert!(!has_prefix("cmsg", prefix::CLIENT_MESSAGE));
    }
}
