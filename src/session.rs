//! Authenticated session identity and owner key derivation.

/// The host application's authenticated identity for one login.
///
/// `user_id` is always present. `org_id` is set when the account acts on
/// behalf of an organization (the employer side of the product). Owner keys
/// derived from a session are stable for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub user_id: String,
  pub org_id: Option<String>,
}

impl Session {
  /// Session for an individual account (job seeker).
  pub fn user(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      org_id: None,
    }
  }

  /// Session for an account acting on behalf of an organization.
  pub fn with_org(user_id: impl Into<String>, org_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      org_id: Some(org_id.into()),
    }
  }

  /// Owner key for user-scoped domains, e.g. `user:u-118`.
  pub fn user_key(&self) -> String {
    format!("user:{}", self.user_id)
  }

  /// Owner key for organization-scoped domains, if the session has one.
  pub fn org_key(&self) -> Option<String> {
    self.org_id.as_ref().map(|org| format!("org:{}", org))
  }
}

/// Strip the scope prefix from an owner key, recovering the raw identifier
/// that remote rows are filtered by.
pub fn owner_id(owner_key: &str) -> &str {
  owner_key
    .split_once(':')
    .map(|(_, id)| id)
    .unwrap_or(owner_key)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_user_key_format() {
    let session = Session::user("u-118");
    assert_eq!(session.user_key(), "user:u-118");
    assert_eq!(session.org_key(), None);
  }

  #[test]
  fn test_org_key_requires_org() {
    let session = Session::with_org("u-9", "acme");
    assert_eq!(session.user_key(), "user:u-9");
    assert_eq!(session.org_key(), Some("org:acme".to_string()));
  }

  #[test]
  fn test_owner_id_strips_scope_prefix() {
    assert_eq!(owner_id("user:u-118"), "u-118");
    assert_eq!(owner_id("org:acme"), "acme");
    assert_eq!(owner_id("bare"), "bare");
  }

  #[test]
  fn test_owner_id_keeps_colons_in_identifier() {
    assert_eq!(owner_id("user:auth0:abc"), "auth0:abc");
  }
}
