use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque identifier for one party. Nothing else about a user is assumed.
pub type Uid = String;

/// Free-form grouping labels shown to a partner (e.g. affiliation, category).
pub type GroupAttributes = BTreeMap<String, String>;

/// The public slice of a profile that a partner is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub uid: Uid,
    pub display_name: String,
    #[serde(default)]
    pub group_attributes: GroupAttributes,
}

/// Profile as returned by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub uid: Uid,
    pub display_name: String,
    pub group_attributes: GroupAttributes,
    pub is_verified: bool,
}

impl Profile {
    pub fn new(uid: impl Into<Uid>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            group_attributes: GroupAttributes::new(),
            is_verified: false,
        }
    }

    #[must_use]
    pub fn verified(mut self) -> Self {
        self.is_verified = true;
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.group_attributes.insert(key.into(), value.into());
        self
    }

    pub fn public(&self) -> PublicProfile {
        PublicProfile {
            uid: self.uid.clone(),
            display_name: self.display_name.clone(),
            group_attributes: self.group_attributes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_profile_drops_verification() {
        let profile = Profile::new("u1", "Ana")
            .verified()
            .with_attribute("affiliation", "North College");
        let public = profile.public();
        assert_eq!(public.uid, "u1");
        assert_eq!(
            public.group_attributes.get("affiliation").map(String::as_str),
            Some("North College")
        );
    }

    #[test]
    fn public_profile_uses_camel_case() {
        let public = Profile::new("u1", "Ana").public();
        let json = serde_json::to_value(&public).unwrap();
        assert_eq!(json["displayName"], "Ana");
        assert!(json.get("groupAttributes").is_some());
    }
}
