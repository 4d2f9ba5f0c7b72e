// In-memory credential store with optional write-through persistence

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};

use super::credentials::CredentialPersistence;
use super::types::{Credentials, Role};

/// Single source of truth for the current session.
///
/// Every mutation replaces the whole snapshot under one write lock, so a
/// reader never sees a new access token paired with an old refresh token.
/// `generation` identifies the token pair: it changes whenever tokens are
/// installed or cleared, never on a role change.
///
/// Saving to persistence happens after the lock is released. Saves are
/// ordered by `revision`; a snapshot older than the last one written is
/// dropped instead of overwriting it.
pub struct CredentialStore {
    current: RwLock<Credentials>,
    /// Bumped under the write lock on every mutation
    revision: AtomicU64,
    /// Revision of the last snapshot handed to persistence
    saved_revision: Mutex<u64>,
    persistence: Option<Arc<dyn CredentialPersistence>>,
}

impl CredentialStore {
    /// Empty store with no session
    pub fn new(default_role: Role) -> Self {
        Self::from_initial(Credentials::signed_out(default_role), None)
    }

    /// Store seeded from (and writing through to) `persistence`
    pub fn with_persistence(persistence: Arc<dyn CredentialPersistence>, default_role: Role) -> Self {
        let initial = match persistence.load() {
            Ok(Some(mut creds)) => {
                tracing::info!(
                    role = %creds.role,
                    valid = creds.valid,
                    "Loaded saved session"
                );
                creds.generation = 1;
                creds
            }
            Ok(None) => Credentials::signed_out(default_role),
            Err(e) => {
                tracing::warn!("Failed to load saved session, starting signed out: {:#}", e);
                Credentials::signed_out(default_role)
            }
        };

        Self::from_initial(initial, Some(persistence))
    }

    fn from_initial(
        initial: Credentials,
        persistence: Option<Arc<dyn CredentialPersistence>>,
    ) -> Self {
        Self {
            current: RwLock::new(initial),
            revision: AtomicU64::new(0),
            saved_revision: Mutex::new(0),
            persistence,
        }
    }

    /// Current snapshot
    pub fn get(&self) -> Credentials {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the token pair. A missing refresh token keeps the stored one.
    /// Returns the new generation.
    pub fn set(&self, access_token: String, refresh_token: Option<String>) -> u64 {
        let (snapshot, revision) = {
            let mut creds = self.write();
            install_tokens(&mut creds, access_token, refresh_token);
            self.snapshot(&creds)
        };
        self.persist(&snapshot, revision);
        snapshot.generation
    }

    /// Replace the token pair only if nobody changed the tokens since
    /// `expected_generation`. Returns the new generation on success.
    pub fn set_if_generation(
        &self,
        expected_generation: u64,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Option<u64> {
        let (snapshot, revision) = {
            let mut creds = self.write();
            if creds.generation != expected_generation {
                return None;
            }
            install_tokens(&mut creds, access_token, refresh_token);
            self.snapshot(&creds)
        };
        self.persist(&snapshot, revision);
        Some(snapshot.generation)
    }

    /// Install a brand new session
    pub fn login(&self, access_token: String, refresh_token: String, role: Role) -> u64 {
        let (snapshot, revision) = {
            let mut creds = self.write();
            creds.role = role;
            install_tokens(&mut creds, access_token, Some(refresh_token));
            self.snapshot(&creds)
        };
        self.persist(&snapshot, revision);
        snapshot.generation
    }

    /// Drop the session; `valid` stays false until the next login
    pub fn clear(&self) -> u64 {
        let (snapshot, revision) = {
            let mut creds = self.write();
            clear_tokens(&mut creds);
            self.snapshot(&creds)
        };
        self.persist(&snapshot, revision);
        snapshot.generation
    }

    /// Drop the session only if its tokens are still those of
    /// `expected_generation`
    pub fn clear_if_generation(&self, expected_generation: u64) -> bool {
        let (snapshot, revision) = {
            let mut creds = self.write();
            if creds.generation != expected_generation {
                return false;
            }
            clear_tokens(&mut creds);
            self.snapshot(&creds)
        };
        self.persist(&snapshot, revision);
        true
    }

    /// Change the role tag. Affects the next refresh cycle only.
    pub fn set_role(&self, role: Role) {
        let (snapshot, revision) = {
            let mut creds = self.write();
            creds.role = role;
            self.snapshot(&creds)
        };
        self.persist(&snapshot, revision);
    }

    fn write(&self) -> RwLockWriteGuard<'_, Credentials> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of a just-mutated session, tagged with its revision.
    /// Must be called with the write lock held.
    fn snapshot(&self, creds: &Credentials) -> (Credentials, u64) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        (creds.clone(), revision)
    }

    /// Never called with the credentials lock held
    fn persist(&self, creds: &Credentials, revision: u64) {
        let Some(ref persistence) = self.persistence else {
            return;
        };

        let mut saved = self
            .saved_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *saved >= revision {
            tracing::debug!(revision, saved = *saved, "Skipping outdated session save");
            return;
        }

        match persistence.save(creds) {
            Ok(()) => *saved = revision,
            Err(e) => tracing::warn!("Failed to persist session: {:#}", e),
        }
    }
}

fn install_tokens(creds: &mut Credentials, access_token: String, refresh_token: Option<String>) {
    creds.access_token = access_token;
    if let Some(refresh_token) = refresh_token {
        creds.refresh_token = refresh_token;
    }
    creds.valid = true;
    creds.generation += 1;
    creds.updated_at = Some(Utc::now());
}

fn clear_tokens(creds: &mut Credentials) {
    creds.access_token.clear();
    creds.refresh_token.clear();
    creds.valid = false;
    creds.generation += 1;
    creds.updated_at = Some(Utc::now());
}
