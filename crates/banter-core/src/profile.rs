//! Account profile types and the identity-store seam.

use serde::{Deserialize, Serialize};

/// Authoritative profile data for one account. The email doubles as the
/// account identifier; the hub caches a copy of this per session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub email: String,
    pub username: String,
    #[serde(default)]
    pub photo_url: String,
}

/// Partial update applied to a profile. `None` fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProfileChanges {
    pub username: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

impl ProfileChanges {
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email.is_none() && self.photo_url.is_none()
    }
}

/// The hub's view of the identity store: resolve an account identifier
/// (possibly a recently superseded one) to its current profile.
pub trait IdentityStore: Send + Sync {
    fn lookup(&self, account: &str) -> Option<ProfileRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_serde_roundtrip() {
        let record = ProfileRecord {
            email: "ada@example.com".into(),
            username: "ada".into(),
            photo_url: "/uploads/ada.jpg".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ProfileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn photo_url_defaults_empty() {
        let record: ProfileRecord =
            serde_json::from_str(r#"{"email":"a@x.com","username":"a"}"#).unwrap();
        assert!(record.photo_url.is_empty());
    }

    #[test]
    fn empty_changes() {
        assert!(ProfileChanges::default().is_empty());
        let changes = ProfileChanges {
            username: Some("b".into()),
            ..Default::default()
        };
        assert!(!changes.is_empty());
    }
}
