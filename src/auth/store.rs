//! File-backed credential store.
//!
//! The whole table lives in memory behind one `RwLock` and is written back to
//! `<data_dir>/users.json` on every mutation, before the write lock is released.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{
    password,
    user::{PublicUser, Role, UserRecord},
};

/// The non-removable account created on first run.
pub const BOOTSTRAP_USERNAME: &str = "admin";
pub const BOOTSTRAP_PASSWORD: &str = "admin";

const USERS_FILE: &str = "users.json";

lazy_static! {
    /// Stand-in hash for usernames that do not exist.
    static ref DUMMY_HASH: String =
        password::hash_password("unknown-user").unwrap_or_default();
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("user already exists")]
    AlreadyExists,
    #[error("user not found")]
    NotFound,
    #[error("the default administrator account cannot be deleted")]
    Protected,
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("invalid role")]
    InvalidRole,
    #[error("user store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("user store encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("password hashing failed: {0}")]
    Hash(#[from] anyhow::Error),
}

/// On-disk layout of `users.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsersTable {
    enabled: bool,
    #[serde(default)]
    users: BTreeMap<String, UserRecord>,
}

impl UsersTable {
    fn insert_bootstrap(&mut self, password_hash: String) {
        self.users.insert(
            BOOTSTRAP_USERNAME.to_string(),
            UserRecord::new(BOOTSTRAP_USERNAME, password_hash, Role::Admin),
        );
        self.enabled = true;
    }
}

pub struct UserStore {
    dir: PathBuf,
    table: RwLock<UsersTable>,
}

impl UserStore {
    /// Opens the store in `data_dir`, creating the bootstrap account when no file exists yet.
    ///
    /// Never fails: if the file cannot be created or read, authentication is disabled and
    /// the rest of the panel keeps working without login enforcement.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Self {
        let store = Self {
            dir: data_dir.into(),
            table: RwLock::new(UsersTable::default()),
        };
        if let Err(e) = store.load().await {
            error!(error = %e, path = %store.path().display(), "failed to load user store");
            warn!("authentication is disabled");
            store.table.write().await.enabled = false;
        }
        store
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(USERS_FILE)
    }

    async fn load(&self) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut loaded: UsersTable = match serde_json::from_slice(&bytes) {
                    Ok(table) => table,
                    Err(e) => {
                        // keep the unreadable file out of the way of the next persist
                        let aside = self.dir.join(format!("{USERS_FILE}.corrupt"));
                        match tokio::fs::rename(&path, &aside).await {
                            Ok(()) => warn!(path = %aside.display(), "unreadable user store moved aside"),
                            Err(re) => error!(error = %re, "failed to move unreadable user store aside"),
                        }
                        return Err(e.into());
                    }
                };
                for (name, rec) in loaded.users.iter_mut() {
                    rec.username = name.clone();
                }
                if loaded.users.is_empty() {
                    warn!("user store is empty; recreating the default administrator");
                    loaded.insert_bootstrap(hash_blocking(BOOTSTRAP_PASSWORD).await?);
                    persist(&self.dir, &loaded).await?;
                }
                debug!(users = loaded.users.len(), enabled = loaded.enabled, "user store loaded");
                *table = loaded;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "user store not found, creating default configuration");
                let mut fresh = UsersTable::default();
                fresh.insert_bootstrap(hash_blocking(BOOTSTRAP_PASSWORD).await?);
                persist(&self.dir, &fresh).await?;
                info!(username = BOOTSTRAP_USERNAME, "default administrator created");
                *table = fresh;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Applies `f` to a copy of the table, persists the copy, then commits it.
    /// A failed write leaves the in-memory table untouched.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut UsersTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut table = self.table.write().await;
        let mut next = table.clone();
        let out = f(&mut next)?;
        persist(&self.dir, &next).await?;
        *table = next;
        Ok(out)
    }

    pub async fn is_enabled(&self) -> bool {
        self.table.read().await.enabled
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.mutate(|t| {
            t.enabled = enabled;
            Ok(())
        })
        .await?;
        info!(enabled, "authentication toggled");
        Ok(())
    }

    /// Checks a login attempt.
    ///
    /// `Ok(None)` means authentication is disabled and no login is required. Unknown
    /// users and wrong passwords fail with the same error.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<PublicUser>, StoreError> {
        let record = {
            let table = self.table.read().await;
            if !table.enabled {
                return Ok(None);
            }
            table.users.get(username).cloned()
        };
        check(record, password).await.map(Some)
    }

    /// Like [`authenticate`](Self::authenticate) but ignores the enabled flag.
    pub async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<PublicUser, StoreError> {
        let record = self.table.read().await.users.get(username).cloned();
        check(record, password).await
    }

    pub async fn get(&self, username: &str) -> Option<PublicUser> {
        self.table.read().await.users.get(username).map(UserRecord::public)
    }

    pub async fn create(&self, username: &str, password: &str, role: &str) -> Result<(), StoreError> {
        if username.is_empty() || password.is_empty() {
            return Err(StoreError::InvalidInput("username and password must not be empty"));
        }
        let role = Role::parse(role).unwrap_or(Role::User);
        let hash = hash_blocking(password).await?;

        self.mutate(|t| {
            if t.users.contains_key(username) {
                return Err(StoreError::AlreadyExists);
            }
            t.users
                .insert(username.to_string(), UserRecord::new(username, hash, role));
            Ok(())
        })
        .await?;
        info!(%username, %role, "user created");
        Ok(())
    }

    /// Empty `new_password` or `new_role` leave that field unchanged.
    pub async fn update(
        &self,
        username: &str,
        new_password: &str,
        new_role: &str,
    ) -> Result<(), StoreError> {
        let role = match new_role {
            "" => None,
            r => Some(Role::parse(r).ok_or(StoreError::InvalidRole)?),
        };
        let hash = match new_password {
            "" => None,
            p => Some(hash_blocking(p).await?),
        };

        self.mutate(|t| {
            let user = t.users.get_mut(username).ok_or(StoreError::NotFound)?;
            if let Some(hash) = hash {
                user.password_hash = hash;
            }
            if let Some(role) = role {
                user.role = role;
            }
            Ok(())
        })
        .await?;
        info!(%username, role = ?role, "user updated");
        Ok(())
    }

    pub async fn delete(&self, username: &str) -> Result<(), StoreError> {
        if username == BOOTSTRAP_USERNAME {
            return Err(StoreError::Protected);
        }
        self.mutate(|t| t.users.remove(username).map(|_| ()).ok_or(StoreError::NotFound))
            .await?;
        info!(%username, "user deleted");
        Ok(())
    }

    /// All users ordered by username.
    pub async fn list(&self) -> Vec<PublicUser> {
        self.table
            .read()
            .await
            .users
            .values()
            .map(UserRecord::public)
            .collect()
    }

    pub async fn record_login(&self, username: &str) -> Result<(), StoreError> {
        self.mutate(|t| {
            let user = t.users.get_mut(username).ok_or(StoreError::NotFound)?;
            user.last_login_at = Some(OffsetDateTime::now_utc());
            Ok(())
        })
        .await
    }

    /// True while the bootstrap account still accepts the bootstrap password.
    pub async fn uses_default_password(&self) -> bool {
        let hash = match self.table.read().await.users.get(BOOTSTRAP_USERNAME) {
            Some(admin) => admin.password_hash.clone(),
            None => return false,
        };
        verify_blocking(BOOTSTRAP_PASSWORD, Some(hash)).await
    }
}

/// Unknown users are verified against the dummy hash so both failure paths cost one argon2 run.
async fn check(record: Option<UserRecord>, password: &str) -> Result<PublicUser, StoreError> {
    let hash = record.as_ref().map(|r| r.password_hash.clone());
    let matched = verify_blocking(password, hash).await;
    match record {
        Some(record) if matched => Ok(record.public()),
        _ => Err(StoreError::InvalidCredentials),
    }
}

async fn hash_blocking(plain: &str) -> Result<String, StoreError> {
    let plain = plain.to_string();
    let hash = tokio::task::spawn_blocking(move || password::hash_password(&plain))
        .await
        .map_err(|e| anyhow::anyhow!(e))??;
    Ok(hash)
}

/// A malformed stored hash counts as a mismatch. `None` checks against the dummy hash.
async fn verify_blocking(plain: &str, hash: Option<String>) -> bool {
    let plain = plain.to_string();
    let task = tokio::task::spawn_blocking(move || {
        let hash = hash.as_deref().unwrap_or(DUMMY_HASH.as_str());
        password::verify_password(&plain, hash)
    });
    match task.await {
        Ok(Ok(ok)) => ok,
        Ok(Err(_)) => false,
        Err(e) => {
            error!(error = %e, "password verification task failed");
            false
        }
    }
}

/// Writes `users.json.tmp` and renames it over `users.json`.
async fn persist(dir: &Path, table: &UsersTable) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(table)?;
    let path = dir.join(USERS_FILE);
    let tmp = dir.join(format!("{USERS_FILE}.tmp"));

    tokio::fs::write(&tmp, &data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp, &path).await?;
    debug!(path = %path.display(), bytes = data.len(), "user store saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path().join("data")).await;
        (dir, store)
    }

    #[tokio::test]
    async fn bootstrap_creates_enabled_admin() {
        let (_dir, store) = fresh().await;
        assert!(store.is_enabled().await);
        assert!(store.path().exists());
        let users = store.list().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "admin");
        assert_eq!(users[0].role, Role::Admin);
        assert!(store.uses_default_password().await);
    }

    #[tokio::test]
    async fn created_user_can_authenticate_with_role() {
        let (_dir, store) = fresh().await;
        store.create("alice", "wonderland", "user").await.unwrap();
        store.create("bob", "builder1", "admin").await.unwrap();

        let alice = store.authenticate("alice", "wonderland").await.unwrap().unwrap();
        assert_eq!(alice.role, Role::User);
        let bob = store.authenticate("bob", "builder1").await.unwrap().unwrap();
        assert_eq!(bob.role, Role::Admin);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_fail_alike() {
        let (_dir, store) = fresh().await;
        store.create("alice", "wonderland", "user").await.unwrap();

        let wrong = store.authenticate("alice", "nope").await.unwrap_err();
        let missing = store.authenticate("mallory", "nope").await.unwrap_err();
        assert!(matches!(wrong, StoreError::InvalidCredentials));
        assert!(matches!(missing, StoreError::InvalidCredentials));
        assert_eq!(wrong.to_string(), missing.to_string());
    }

    #[tokio::test]
    async fn usernames_are_case_sensitive() {
        let (_dir, store) = fresh().await;
        store.create("Alice", "wonderland", "user").await.unwrap();
        assert!(store.authenticate("alice", "wonderland").await.is_err());
        store.create("alice", "other-pass", "user").await.unwrap();
        assert_eq!(store.list().await.len(), 3);
    }

    #[tokio::test]
    async fn create_validates_input() {
        let (_dir, store) = fresh().await;
        assert!(matches!(
            store.create("", "pw", "user").await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.create("carol", "", "user").await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.create("admin", "whatever", "admin").await,
            Err(StoreError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn unknown_role_is_normalized_to_user() {
        let (_dir, store) = fresh().await;
        store.create("dave", "password", "superuser").await.unwrap();
        assert_eq!(store.get("dave").await.unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn update_changes_only_supplied_fields() {
        let (_dir, store) = fresh().await;
        store.create("erin", "first-pass", "user").await.unwrap();

        store.update("erin", "", "admin").await.unwrap();
        let erin = store.authenticate("erin", "first-pass").await.unwrap().unwrap();
        assert_eq!(erin.role, Role::Admin);

        store.update("erin", "second-pass", "").await.unwrap();
        assert!(store.authenticate("erin", "first-pass").await.is_err());
        let erin = store.authenticate("erin", "second-pass").await.unwrap().unwrap();
        assert_eq!(erin.role, Role::Admin);
    }

    #[tokio::test]
    async fn update_rejects_missing_user_and_bad_role() {
        let (_dir, store) = fresh().await;
        assert!(matches!(
            store.update("ghost", "x", "").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.update("admin", "", "root").await,
            Err(StoreError::InvalidRole)
        ));
    }

    #[tokio::test]
    async fn admin_is_protected_from_deletion() {
        let (_dir, store) = fresh().await;
        for name in ["u1", "u2", "u3"] {
            store.create(name, "password", "admin").await.unwrap();
        }
        assert!(matches!(store.delete("admin").await, Err(StoreError::Protected)));
        store.delete("u2").await.unwrap();
        assert!(matches!(store.delete("u2").await, Err(StoreError::NotFound)));
        assert!(matches!(store.delete("admin").await, Err(StoreError::Protected)));
        assert!(store.get("admin").await.is_some());
    }

    #[tokio::test]
    async fn disabled_store_skips_login() {
        let (_dir, store) = fresh().await;
        store.set_enabled(false).await.unwrap();
        assert!(store.authenticate("nobody", "nothing").await.unwrap().is_none());
        // explicit password checks still apply
        assert!(store.verify_password("admin", "wrong").await.is_err());
        assert!(store.verify_password("admin", "admin").await.is_ok());
    }

    #[tokio::test]
    async fn changes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = UserStore::open(dir.path()).await;
            store.create("frank", "persisted", "admin").await.unwrap();
            store.update("admin", "newpass9", "").await.unwrap();
            store.record_login("frank").await.unwrap();
        }
        let store = UserStore::open(dir.path()).await;
        assert!(store.is_enabled().await);
        assert!(!store.uses_default_password().await);
        let frank = store.authenticate("frank", "persisted").await.unwrap().unwrap();
        assert_eq!(frank.role, Role::Admin);
        assert!(frank.last_login_at.is_some());
        assert!(!dir.path().join("users.json.tmp").exists());
    }

    #[tokio::test]
    async fn default_password_flag_tracks_admin_password() {
        let (_dir, store) = fresh().await;
        assert!(store.uses_default_password().await);
        store.update("admin", "newpass9", "").await.unwrap();
        assert!(!store.uses_default_password().await);
        assert!(store.authenticate("admin", "admin").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_file_disables_auth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.json"), b"{not json").unwrap();
        let store = UserStore::open(dir.path()).await;
        assert!(!store.is_enabled().await);
        assert!(store.authenticate("admin", "admin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_preserved_before_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.json"), b"{not json").unwrap();
        let store = UserStore::open(dir.path()).await;

        let aside = dir.path().join("users.json.corrupt");
        assert_eq!(std::fs::read(&aside).unwrap(), b"{not json");

        store.create("zoe", "zoe-pass", "admin").await.unwrap();
        store.set_enabled(true).await.unwrap();
        assert_eq!(std::fs::read(&aside).unwrap(), b"{not json");
        let reopened = UserStore::open(dir.path()).await;
        assert!(reopened.get("zoe").await.is_some());
    }

    #[tokio::test]
    async fn concurrent_creates_are_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(UserStore::open(dir.path()).await);

        let mut set = tokio::task::JoinSet::new();
        for i in 0..8 {
            let store = store.clone();
            set.spawn(async move { store.create(&format!("user{i}"), "password", "user").await });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(store.list().await.len(), 9);

        let reopened = UserStore::open(dir.path()).await;
        let names: Vec<String> = reopened.list().await.into_iter().map(|u| u.username).collect();
        assert_eq!(names.len(), 9);
        for i in 0..8 {
            assert!(names.contains(&format!("user{i}")));
        }
    }

    #[test]
    fn dummy_hash_is_a_verifiable_argon2_hash() {
        assert!(argon2::PasswordHash::new(&DUMMY_HASH).is_ok());
        assert!(!password::verify_password("admin", &DUMMY_HASH).unwrap());
    }

    #[tokio::test]
    async fn unknown_user_costs_a_full_verify() {
        let (_dir, store) = fresh().await;
        // first use computes the dummy hash
        let _ = store.authenticate("warmup", "x").await;

        let started = std::time::Instant::now();
        assert!(store.authenticate("nosuchuser", "x").await.is_err());
        let unknown = started.elapsed();

        let started = std::time::Instant::now();
        assert!(store.authenticate("admin", "x").await.is_err());
        let wrong = started.elapsed();

        assert!(
            unknown * 4 >= wrong,
            "unknown user took {unknown:?}, wrong password took {wrong:?}"
        );
    }

    #[tokio::test]
    async fn empty_table_gets_bootstrap_admin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("users.json"),
            br#"{"enabled": false, "users": {}}"#,
        )
        .unwrap();
        let store = UserStore::open(dir.path()).await;
        assert!(store.is_enabled().await);
        assert!(store.authenticate("admin", "admin").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reads_file_with_unix_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let hash = password::hash_password("gamer").unwrap();
        let body = serde_json::json!({
            "enabled": true,
            "users": {
                "admin": {
                    "username": "admin",
                    "password_hash": hash,
                    "role": "admin",
                    "created_at": 1_700_000_000,
                    "last_login_at": 1_700_000_100
                }
            }
        });
        std::fs::write(dir.path().join("users.json"), body.to_string()).unwrap();

        let store = UserStore::open(dir.path()).await;
        let admin = store.authenticate("admin", "gamer").await.unwrap().unwrap();
        assert_eq!(admin.created_at.unix_timestamp(), 1_700_000_000);
        assert!(!store.uses_default_password().await);
    }
}
