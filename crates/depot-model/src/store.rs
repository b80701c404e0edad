use crate::types::{PackageType, StoreName, MAVEN_PKG_KEY};
use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three kinds of content location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Hosted,
    Remote,
    Group,
}

impl StoreType {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreType::Hosted => "hosted",
            StoreType::Remote => "remote",
            StoreType::Group => "group",
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hosted" => Ok(StoreType::Hosted),
            "remote" => Ok(StoreType::Remote),
            "group" => Ok(StoreType::Group),
            other => Err(ModelError::InvalidStoreType(other.to_owned())),
        }
    }
}

/// Identifies a content store. Equality and hashing cover all three fields.
///
/// The textual form is `<package>:<type>:<name>`; the two-part form
/// `<type>:<name>` is accepted on input and implies the `maven` package type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreKey {
    pub package_type: PackageType,
    #[serde(rename = "type")]
    pub store_type: StoreType,
    pub name: StoreName,
}

impl StoreKey {
    pub fn new(
        package_type: impl Into<PackageType>,
        store_type: StoreType,
        name: impl Into<StoreName>,
    ) -> Self {
        Self {
            package_type: package_type.into(),
            store_type,
            name: name.into(),
        }
    }

    pub fn hosted(package_type: impl Into<PackageType>, name: impl Into<StoreName>) -> Self {
        Self::new(package_type, StoreType::Hosted, name)
    }

    pub fn remote(package_type: impl Into<PackageType>, name: impl Into<StoreName>) -> Self {
        Self::new(package_type, StoreType::Remote, name)
    }

    pub fn group(package_type: impl Into<PackageType>, name: impl Into<StoreName>) -> Self {
        Self::new(package_type, StoreType::Group, name)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.package_type, self.store_type, self.name)
    }
}

impl FromStr for StoreKey {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (pkg, ty, name) = match parts.as_slice() {
            [pkg, ty, name] => (*pkg, *ty, *name),
            [ty, name] => (MAVEN_PKG_KEY, *ty, *name),
            _ => return Err(ModelError::InvalidStoreKey(s.to_owned())),
        };
        if pkg.is_empty() || name.is_empty() {
            return Err(ModelError::InvalidStoreKey(s.to_owned()));
        }
        Ok(Self::new(pkg, ty.parse()?, name))
    }
}

/// Type-specific part of a store definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreKind {
    Hosted {
        #[serde(default)]
        read_only: bool,
    },
    Remote {
        url: String,
    },
    Group {
        #[serde(default)]
        constituents: Vec<StoreKey>,
    },
}

/// A store definition as held by the store registry.
///
/// Values are immutable in practice: "update" helpers return a modified copy
/// which the registry swaps in atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStore {
    pub key: StoreKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub metadata: std::collections::BTreeMap<String, String>,
    #[serde(flatten)]
    pub kind: StoreKind,
}

pub const METADATA_ORIGIN: &str = "origin";
pub const METADATA_TRACKING_ID: &str = "tracking-id";

impl ArtifactStore {
    pub fn hosted(key: StoreKey) -> Self {
        Self {
            key,
            description: None,
            metadata: std::collections::BTreeMap::new(),
            kind: StoreKind::Hosted { read_only: false },
        }
    }

    pub fn remote(key: StoreKey, url: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            metadata: std::collections::BTreeMap::new(),
            kind: StoreKind::Remote { url: url.into() },
        }
    }

    pub fn group(key: StoreKey, constituents: Vec<StoreKey>) -> Self {
        Self {
            key,
            description: None,
            metadata: std::collections::BTreeMap::new(),
            kind: StoreKind::Group { constituents },
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.kind, StoreKind::Hosted { read_only: true })
    }

    pub fn remote_url(&self) -> Option<&str> {
        match &self.kind {
            StoreKind::Remote { url } => Some(url),
            _ => None,
        }
    }

    /// Group members in lookup order. Empty for non-group stores.
    pub fn constituents(&self) -> &[StoreKey] {
        match &self.kind {
            StoreKind::Group { constituents } => constituents,
            _ => &[],
        }
    }

    /// Copy of this group with `member` appended. Already-present members and
    /// non-group stores are returned unchanged.
    #[must_use]
    pub fn with_constituent(&self, member: &StoreKey) -> Self {
        let mut copy = self.clone();
        if let StoreKind::Group { constituents } = &mut copy.kind {
            if !constituents.contains(member) {
                constituents.push(member.clone());
            }
        }
        copy
    }

    /// Copy of this group with `member` removed.
    #[must_use]
    pub fn without_constituent(&self, member: &StoreKey) -> Self {
        let mut copy = self.clone();
        if let StoreKind::Group { constituents } = &mut copy.kind {
            constituents.retain(|k| k != member);
        }
        copy
    }

    /// Copy of a hosted store with its read-only flag set.
    #[must_use]
    pub fn with_read_only(&self, read_only: bool) -> Self {
        let mut copy = self.clone();
        if let StoreKind::Hosted { read_only: ro } = &mut copy.kind {
            *ro = read_only;
        }
        copy
    }
}

/// Who changed a store definition and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub user: String,
    pub summary: String,
}

pub const SYSTEM_USER: &str = "system";

impl ChangeSummary {
    pub fn new(user: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            summary: summary.into(),
        }
    }

    pub fn system(summary: impl Into<String>) -> Self {
        Self::new(SYSTEM_USER, summary)
    }
}
