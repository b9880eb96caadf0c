//! In-memory authoritative account directory.
//!
//! Records are keyed by their current email (the account identifier).
//! When an update changes an email, a forwarding entry old → new is kept
//! so that a lookup by the superseded identifier still resolves; the hub
//! relies on this when reconciling an identity-change signal that carries
//! the previous email. Forwarding chains are collapsed on write, so a
//! lookup follows at most one hop.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use banter_core::profile::{IdentityStore, ProfileChanges, ProfileRecord};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("account {0} already exists")]
    EmailTaken(String),
    #[error("no account for {0}")]
    UnknownAccount(String),
}

/// Result of a successful profile update.
#[derive(Clone, Debug, Serialize)]
pub struct ProfileUpdate {
    /// The email the record was keyed by before the update.
    pub previous_email: String,
    pub record: ProfileRecord,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, ProfileRecord>,
    /// Superseded email → current email.
    forwards: HashMap<String, String>,
}

/// The identity-store collaborator. Shared behind an `Arc`; all access
/// goes through short read/write lock sections.
#[derive(Default)]
pub struct Directory {
    inner: RwLock<Inner>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a new account.
    pub fn create(&self, record: ProfileRecord) -> Result<(), DirectoryError> {
        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.email) {
            return Err(DirectoryError::EmailTaken(record.email));
        }
        debug!(email = %record.email, username = %record.username, "account created");
        inner.records.insert(record.email.clone(), record);
        Ok(())
    }

    /// Fetch a record by its current email. Does not follow forwards.
    pub fn get(&self, email: &str) -> Option<ProfileRecord> {
        self.inner.read().records.get(email).cloned()
    }

    /// Apply a partial update. On an email change the record is re-keyed
    /// and a forwarding entry is left behind for the old identifier.
    pub fn update(
        &self,
        email: &str,
        changes: ProfileChanges,
    ) -> Result<ProfileUpdate, DirectoryError> {
        let mut inner = self.inner.write();

        let mut record = inner
            .records
            .get(email)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownAccount(email.to_owned()))?;

        let new_email = changes.email.as_deref().unwrap_or(email);
        if new_email != email && inner.records.contains_key(new_email) {
            return Err(DirectoryError::EmailTaken(new_email.to_owned()));
        }

        if let Some(username) = changes.username {
            record.username = username;
        }
        if let Some(photo_url) = changes.photo_url {
            record.photo_url = photo_url;
        }

        if new_email != email {
            record.email = new_email.to_owned();
            inner.records.remove(email);
            // Collapse any chain ending at the old key, then forward it.
            for target in inner.forwards.values_mut() {
                if target == email {
                    *target = new_email.to_owned();
                }
            }
            inner.forwards.remove(new_email);
            inner
                .forwards
                .insert(email.to_owned(), new_email.to_owned());
        }

        inner.records.insert(record.email.clone(), record.clone());
        debug!(previous = email, current = %record.email, "account updated");

        Ok(ProfileUpdate {
            previous_email: email.to_owned(),
            record,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

impl IdentityStore for Directory {
    /// Resolve an account identifier, following a forwarding entry if the
    /// identifier was recently superseded by an email change.
    fn lookup(&self, account: &str) -> Option<ProfileRecord> {
        let inner = self.inner.read();
        if let Some(record) = inner.records.get(account) {
            return Some(record.clone());
        }
        let current = inner.forwards.get(account)?;
        inner.records.get(current).cloned()
    }
}
