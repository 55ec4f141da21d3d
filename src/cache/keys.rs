//! Cache key construction and group classification.
//!
//! A key is `prefix + scope:group:sanitized(raw)`. Global groups use the scope
//! token `global`, which no numeric scope can produce.

use std::borrow::Cow;
use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

/// Group used when the caller has no better name.
pub const DEFAULT_GROUP: &str = "default";

const GLOBAL_SCOPE: &str = "global";
const MAX_PLAIN_KEY_LEN: usize = 32;

/// How a group is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupClass {
    /// Local cache only, never sent to the backend.
    Ignored,
    /// Persisted and shared by every scope.
    Global,
    /// Persisted under the current scope.
    Default,
}

impl GroupClass {
    pub fn is_persisted(self) -> bool {
        !matches!(self, GroupClass::Ignored)
    }
}

/// Mutable sets of global and ignored group names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupRegistry {
    global: BTreeSet<String>,
    ignored: BTreeSet<String>,
}

impl GroupRegistry {
    pub fn new<G, I, S, T>(global: G, ignored: I) -> Self
    where
        G: IntoIterator<Item = S>,
        I: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            global: global.into_iter().map(Into::into).collect(),
            ignored: ignored.into_iter().map(Into::into).collect(),
        }
    }

    /// Ignored wins over global so nothing ignored ever reaches the backend.
    pub fn classify(&self, group: &str) -> GroupClass {
        if self.ignored.contains(group) {
            GroupClass::Ignored
        } else if self.global.contains(group) {
            GroupClass::Global
        } else {
            GroupClass::Default
        }
    }

    pub fn is_global(&self, group: &str) -> bool {
        self.global.contains(group)
    }

    pub fn is_ignored(&self, group: &str) -> bool {
        self.ignored.contains(group)
    }

    pub fn add_global<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global.extend(groups.into_iter().map(Into::into));
    }

    pub fn add_ignored<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(groups.into_iter().map(Into::into));
    }

    /// Route every global group to the local cache. Used once the backend is down.
    pub fn demote_global(&mut self) {
        self.ignored.extend(self.global.iter().cloned());
    }

    pub fn global_groups(&self) -> impl Iterator<Item = &str> {
        self.global.iter().map(String::as_str)
    }

    pub fn ignored_groups(&self) -> impl Iterator<Item = &str> {
        self.ignored.iter().map(String::as_str)
    }
}

/// Builds full cache keys for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `global` selects the shared scope token; persistence is decided elsewhere.
    pub fn build(&self, scope: u64, global: bool, group: &str, raw_key: &str) -> String {
        let raw = sanitize(raw_key);
        if global {
            format!("{}{GLOBAL_SCOPE}:{group}:{raw}", self.prefix)
        } else {
            format!("{}{scope}:{group}:{raw}", self.prefix)
        }
    }

    /// Prefix shared by every non-global key of `scope`.
    pub fn scope_prefix(&self, scope: u64) -> String {
        format!("{}{scope}:", self.prefix)
    }
}

/// Short alphanumeric keys pass through; everything else becomes a SHA-256 hex digest.
pub fn sanitize(raw_key: &str) -> Cow<'_, str> {
    if raw_key.len() <= MAX_PLAIN_KEY_LEN && raw_key.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Cow::Borrowed(raw_key)
    } else {
        Cow::Owned(hash_hex(raw_key.as_bytes()))
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn hash_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
