//! Branch identity types.
//!
//! A verdict history is keyed by (project, test_id, variant_hash, ref_hash):
//! the same test and variant tracked on two source branches is two
//! independent histories. The ref hash is derived from the source ref so
//! the key stays stable across renames of nothing but the row payload.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// A gitiles branch: host, repository, and ref name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GitilesRef {
    pub host: String,
    pub project: String,
    /// Fully qualified ref, e.g. `refs/heads/main`.
    pub ref_name: String,
}

/// The source branch a verdict history is tracked against.
///
/// Externally tagged so the serialized form mirrors the upstream oneof
/// (`{"gitiles": {...}}`), leaving room for other source kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRef {
    Gitiles(GitilesRef),
}

impl SourceRef {
    pub fn gitiles(host: &str, project: &str, ref_name: &str) -> Self {
        SourceRef::Gitiles(GitilesRef {
            host: host.to_string(),
            project: project.to_string(),
            ref_name: ref_name.to_string(),
        })
    }

    /// Derives the stable hash identifying this ref.
    pub fn ref_hash(&self) -> RefHash {
        match self {
            SourceRef::Gitiles(g) => {
                let mut hasher = Sha256::new();
                hasher.update(b"gitiles");
                hasher.update([0u8]);
                hasher.update(g.host.as_bytes());
                hasher.update([0u8]);
                hasher.update(g.project.as_bytes());
                hasher.update([0u8]);
                hasher.update(g.ref_name.as_bytes());
                let digest = hasher.finalize();
                let mut bytes = [0u8; RefHash::LEN];
                bytes.copy_from_slice(&digest[..RefHash::LEN]);
                RefHash(bytes)
            }
        }
    }
}

/// Truncated digest of a source ref, rendered as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefHash(pub [u8; RefHash::LEN]);

impl RefHash {
    pub const LEN: usize = 8;

    /// Parses the lowercase hex form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; RefHash::LEN] = decoded.try_into().ok()?;
        Some(RefHash(bytes))
    }
}

impl fmt::Display for RefHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for RefHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for RefHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RefHash::parse(&s).ok_or_else(|| D::Error::custom(format!("invalid ref hash: {s}")))
    }
}

/// Test variant definition: key/value pairs, kept sorted.
///
/// The map form is what callers supply; `to_json_string` is the canonical
/// rendering used in reporting rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variant(pub BTreeMap<String, String>);

impl Variant {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Variant(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Renders the definition as a JSON object string with sorted keys.
    pub fn to_json_string(&self) -> String {
        // BTreeMap iteration order gives sorted keys; string-to-string maps
        // cannot fail to serialize.
        serde_json::to_string(&self.0).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Store key for one verdict history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BranchKey {
    pub project: String,
    pub test_id: String,
    pub variant_hash: String,
    pub ref_hash: RefHash,
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project, self.test_id, self.variant_hash, self.ref_hash
        )
    }
}
