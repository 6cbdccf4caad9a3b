use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;

use super::{CredentialProvider, Role, UserProfile};

pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const USER_DATA_KEY: &str = "user_data";

/// File-backed key-value store shared by every command of this process.
///
/// Every read goes to disk, so another process logging in or out is picked
/// up on the next access.
#[derive(Clone, Debug)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt session file {}", self.path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read session file {}", self.path.display())),
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create session directory {}", parent.display())
                })?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        let raw = serde_json::to_vec_pretty(entries)?;
        fs::write(&tmp_path, raw)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move session file {} into place at {}",
                tmp_path.display(),
                self.path.display()
            )
        })
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> anyhow::Result<()> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.into());
        self.save(&entries)
    }

    pub fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.save(&entries)?;
        }
        Ok(())
    }

    /// Persists a freshly authenticated session.
    pub fn store_session(&self, token: &str, profile: &UserProfile) -> anyhow::Result<()> {
        let mut entries = self.load()?;
        entries.insert(AUTH_TOKEN_KEY.to_string(), token.to_string());
        entries.insert(USER_DATA_KEY.to_string(), serde_json::to_string(profile)?);
        self.save(&entries)
    }

    /// Returns the logged-in profile, if both the token and a readable
    /// profile are present.
    pub fn restore(&self) -> anyhow::Result<Option<UserProfile>> {
        let entries = self.load()?;
        let (Some(_token), Some(user_data)) =
            (entries.get(AUTH_TOKEN_KEY), entries.get(USER_DATA_KEY))
        else {
            return Ok(None);
        };

        match serde_json::from_str(user_data) {
            Ok(profile) => Ok(Some(profile)),
            Err(err) => {
                log::warn!("ignoring unreadable stored profile: {err}");
                Ok(None)
            }
        }
    }

    /// Logs out.
    pub fn clear(&self) -> anyhow::Result<()> {
        let mut entries = self.load()?;
        let had_token = entries.remove(AUTH_TOKEN_KEY).is_some();
        let had_profile = entries.remove(USER_DATA_KEY).is_some();
        if had_token || had_profile {
            self.save(&entries)?;
        }
        Ok(())
    }

    pub fn has_role(&self, roles: &[Role]) -> bool {
        match self.restore() {
            Ok(Some(profile)) => profile.has_role(roles),
            Ok(None) => false,
            Err(err) => {
                log::warn!("failed to read session: {err:?}");
                false
            }
        }
    }
}

impl CredentialProvider for SessionStore {
    fn bearer_token(&self) -> Option<String> {
        match self.get(AUTH_TOKEN_KEY) {
            Ok(token) => token,
            Err(err) => {
                log::warn!("failed to read auth token: {err:?}");
                None
            }
        }
    }
}
