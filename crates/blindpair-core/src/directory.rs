use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::profile::{Profile, Uid};

/// Identity collaborator: resolves a uid to its profile.
#[async_trait]
pub trait ProfileDirectory: Send + Sync + 'static {
    /// `Ok(None)` when no profile exists for `uid`.
    async fn lookup(&self, uid: &str) -> Result<Option<Profile>, StoreError>;
}

/// Fixed in-memory directory.
#[derive(Default)]
pub struct StaticDirectory {
    profiles: RwLock<HashMap<Uid, Profile>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = Profile>) -> Self {
        let dir = Self::new();
        for profile in profiles {
            dir.insert(profile);
        }
        dir
    }

    pub fn insert(&self, profile: Profile) {
        let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        profiles.insert(profile.uid.clone(), profile);
    }

    /// Flips verification on an existing profile. Returns false if unknown.
    pub fn set_verified(&self, uid: &str, verified: bool) -> bool {
        let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        match profiles.get_mut(uid) {
            Some(profile) => {
                profile.is_verified = verified;
                true
            },
            None => false,
        }
    }
}

#[async_trait]
impl ProfileDirectory for StaticDirectory {
    async fn lookup(&self, uid: &str) -> Result<Option<Profile>, StoreError> {
        let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
        Ok(profiles.get(uid).cloned())
    }
}
