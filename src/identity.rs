//! The assistant's own user identity

use std::fmt;

/// A fully qualified user identity such as `@henry:example.org`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    full: String,
    local_end: usize,
}

impl Identity {
    /// Parse an identity
    ///
    /// An identity without a `:` separator has no domain; the whole string
    /// (minus a leading `@`) is used as the local name.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        let full = user_id.into();
        let local_end = full.find(':').unwrap_or(full.len());
        Self { full, local_end }
    }

    /// The qualified form, exactly as configured
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The local name (`henry` for `@henry:example.org`)
    #[must_use]
    pub fn local_name(&self) -> &str {
        let local = &self.full[..self.local_end];
        local.strip_prefix('@').unwrap_or(local)
    }

    /// The server name, if the identity has one
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.full.get(self.local_end + 1..).filter(|d| !d.is_empty())
    }

    /// Whether `user_id` names this identity
    #[must_use]
    pub fn is(&self, user_id: &str) -> bool {
        self.full == user_id
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Whether `user_id` belongs to `domain`
///
/// The user id must split on `:` into exactly a local part and a server name.
#[must_use]
pub fn is_from_domain(user_id: &str, domain: &str) -> bool {
    let mut parts = user_id.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(server), None) => server == domain,
        _ => false,
    }
}
