//! Index Records and Predicates
//!
//! One columnar row per known fingerprint: identity, size, the location set
//! (the authoritative answer to "where is it?"), a heat snapshot, timestamps,
//! and optional descriptive metadata. Deletion is a tombstone row, never a
//! physical erase.

use crate::cache::heat::now_ms;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Location Set
// =============================================================================

/// Presence of a fingerprint on one backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationEntry {
    /// Backend reported the content present
    pub present: bool,
    /// Backend holds a pin for it
    pub pinned: bool,
    /// When presence was last confirmed (unix millis)
    pub last_verified_ms: u64,
}

// =============================================================================
// Index Record
// =============================================================================

/// Columnar row describing one fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    // identity
    pub fingerprint: Fingerprint,
    pub codec: String,
    pub hash_algorithm: String,

    // size
    pub size_bytes: u64,
    pub block_count: u64,

    /// backend name → presence/pin state
    pub location_set: BTreeMap<String, LocationEntry>,

    // heat snapshot (may lag the live tracker; refreshed on next write)
    pub access_count: u64,
    pub last_access_ms: u64,
    pub heat_score: f64,

    // temporal
    pub created_at_ms: u64,
    pub updated_at_ms: u64,

    // descriptive metadata
    pub mime_type: Option<String>,
    pub name: Option<String>,
    pub tags: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,

    /// Set on tombstones
    pub deleted_at_ms: Option<u64>,
}

impl IndexRecord {
    /// Fresh record for a newly observed fingerprint
    pub fn new(fingerprint: Fingerprint, size_bytes: u64) -> Self {
        let now = now_ms();
        Self {
            codec: fingerprint.codec().as_str().to_string(),
            hash_algorithm: fingerprint.hash_algorithm().as_str().to_string(),
            fingerprint,
            size_bytes,
            block_count: 1,
            location_set: BTreeMap::new(),
            access_count: 0,
            last_access_ms: 0,
            heat_score: 0.0,
            created_at_ms: now,
            updated_at_ms: now,
            mime_type: None,
            name: None,
            tags: BTreeSet::new(),
            properties: BTreeMap::new(),
            deleted_at_ms: None,
        }
    }

    /// Tombstone: empty location set, `deleted_at` stamped
    pub fn tombstone(fingerprint: Fingerprint) -> Self {
        let now = now_ms();
        let mut record = Self::new(fingerprint, 0);
        record.deleted_at_ms = Some(now);
        record
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_at_ms.is_some()
    }

    /// Mark presence on a backend, refreshing `last_verified`
    pub fn mark_present(&mut self, backend: &str) {
        let entry = self.location_set.entry(backend.to_string()).or_default();
        entry.present = true;
        entry.last_verified_ms = now_ms();
    }

    /// Mark absence on a backend (eviction, corruption)
    pub fn mark_absent(&mut self, backend: &str) {
        let entry = self.location_set.entry(backend.to_string()).or_default();
        entry.present = false;
        entry.pinned = false;
        entry.last_verified_ms = now_ms();
    }

    /// Flip the pin flag for a backend
    pub fn set_pinned(&mut self, backend: &str, pinned: bool) {
        let entry = self.location_set.entry(backend.to_string()).or_default();
        entry.pinned = pinned;
    }

    /// Backends currently reporting presence
    pub fn present_on(&self) -> Vec<&str> {
        self.location_set
            .iter()
            .filter(|(_, e)| e.present)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_pinned_on(&self, backend: &str) -> bool {
        self.location_set
            .get(backend)
            .map(|e| e.pinned)
            .unwrap_or(false)
    }

    /// Refresh the heat snapshot columns from the live tracker
    pub fn refresh_heat(&mut self, record: &crate::cache::HeatRecord) {
        self.access_count = record.access_count;
        self.last_access_ms = record.last_access_ms;
        self.heat_score = record.heat_score;
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// Comparison operator in a query predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

/// Typed scalar a predicate compares against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    U64(u64),
    F64(f64),
}

impl FieldValue {
    pub(crate) fn compare(&self, other: &FieldValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (FieldValue::Str(a), FieldValue::Str(b)) => Some(a.cmp(b)),
            (FieldValue::U64(a), FieldValue::U64(b)) => Some(a.cmp(b)),
            (FieldValue::F64(a), FieldValue::F64(b)) => a.partial_cmp(b),
            (FieldValue::U64(a), FieldValue::F64(b)) => (*a as f64).partial_cmp(b),
            (FieldValue::F64(a), FieldValue::U64(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

/// One `(column, op, value)` filter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: CompareOp,
    pub values: Vec<FieldValue>,
}

impl Predicate {
    /// Comparison predicate with a single value
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<FieldValue>) -> Self {
        Self {
            column: column.into(),
            op,
            values: vec![value.into()],
        }
    }

    /// Membership predicate (`in`)
    pub fn any_of(column: impl Into<String>, values: Vec<FieldValue>) -> Self {
        Self {
            column: column.into(),
            op: CompareOp::In,
            values,
        }
    }

    /// Reject unknown columns and malformed shapes up front
    pub fn validate(&self) -> Result<()> {
        if !QUERYABLE_COLUMNS.contains(&self.column.as_str()) {
            return Err(Error::Configuration(format!(
                "unknown query column: {}",
                self.column
            )));
        }
        match self.op {
            CompareOp::In => {
                if self.values.is_empty() {
                    return Err(Error::Configuration("`in` requires at least one value".into()));
                }
            }
            _ => {
                if self.values.len() != 1 {
                    return Err(Error::Configuration(format!(
                        "{:?} requires exactly one value",
                        self.op
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Columns addressable from query predicates
pub const QUERYABLE_COLUMNS: &[&str] = &[
    "fingerprint",
    "codec",
    "hash_algorithm",
    "size_bytes",
    "block_count",
    "access_count",
    "last_access_ms",
    "heat_score",
    "created_at_ms",
    "updated_at_ms",
    "mime_type",
    "name",
    "tags",
];

impl IndexRecord {
    /// Scalar value of a queryable column; `None` for unset optionals
    pub fn field(&self, column: &str) -> Option<FieldValue> {
        match column {
            "fingerprint" => Some(FieldValue::Str(self.fingerprint.to_canonical_string())),
            "codec" => Some(FieldValue::Str(self.codec.clone())),
            "hash_algorithm" => Some(FieldValue::Str(self.hash_algorithm.clone())),
            "size_bytes" => Some(FieldValue::U64(self.size_bytes)),
            "block_count" => Some(FieldValue::U64(self.block_count)),
            "access_count" => Some(FieldValue::U64(self.access_count)),
            "last_access_ms" => Some(FieldValue::U64(self.last_access_ms)),
            "heat_score" => Some(FieldValue::F64(self.heat_score)),
            "created_at_ms" => Some(FieldValue::U64(self.created_at_ms)),
            "updated_at_ms" => Some(FieldValue::U64(self.updated_at_ms)),
            "mime_type" => self.mime_type.clone().map(FieldValue::Str),
            "name" => self.name.clone().map(FieldValue::Str),
            _ => None,
        }
    }

    /// Evaluate one predicate against this record
    pub fn matches(&self, predicate: &Predicate) -> bool {
        // Tag membership is a set operation, not a scalar compare
        if predicate.column == "tags" {
            return match predicate.op {
                CompareOp::In | CompareOp::Eq => predicate.values.iter().any(|v| match v {
                    FieldValue::Str(tag) => self.tags.contains(tag),
                    _ => false,
                }),
                CompareOp::Ne => !predicate.values.iter().any(|v| match v {
                    FieldValue::Str(tag) => self.tags.contains(tag),
                    _ => false,
                }),
                _ => false,
            };
        }

        let field = match self.field(&predicate.column) {
            Some(f) => f,
            // An unset optional matches nothing except inequality
            None => return predicate.op == CompareOp::Ne,
        };

        match predicate.op {
            CompareOp::In => predicate.values.iter().any(|v| field == *v),
            op => {
                let value = &predicate.values[0];
                match field.compare(value) {
                    None => false,
                    Some(ord) => match op {
                        CompareOp::Eq => ord.is_eq(),
                        CompareOp::Ne => ord.is_ne(),
                        CompareOp::Lt => ord.is_lt(),
                        CompareOp::Le => ord.is_le(),
                        CompareOp::Gt => ord.is_gt(),
                        CompareOp::Ge => ord.is_ge(),
                        CompareOp::In => unreachable!(),
                    },
                }
            }
        }
    }

    /// Evaluate a conjunction of predicates
    pub fn matches_all(&self, predicates: &[Predicate]) -> bool {
        predicates.iter().all(|p| self.matches(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u64) -> IndexRecord {
        IndexRecord::new(Fingerprint::of(format!("record-{}", size).as_bytes()), size)
    }

    #[test]
    fn test_record_identity_from_fingerprint() {
        let r = record(42);
        assert_eq!(r.codec, "raw");
        assert_eq!(r.hash_algorithm, "sha2-256");
        assert_eq!(r.size_bytes, 42);
        assert!(!r.is_tombstone());
    }

    #[test]
    fn test_tombstone() {
        let t = IndexRecord::tombstone(Fingerprint::of(b"gone"));
        assert!(t.is_tombstone());
        assert!(t.location_set.is_empty());
    }

    #[test]
    fn test_location_set_transitions() {
        let mut r = record(1);
        r.mark_present("object-store");
        assert_eq!(r.present_on(), vec!["object-store"]);

        r.set_pinned("object-store", true);
        assert!(r.is_pinned_on("object-store"));

        r.mark_absent("object-store");
        assert!(r.present_on().is_empty());
        assert!(!r.is_pinned_on("object-store"));
    }

    #[test]
    fn test_scalar_predicates() {
        let mut r = record(100);
        r.name = Some("photo.jpg".into());

        assert!(r.matches(&Predicate::new("size_bytes", CompareOp::Eq, 100u64)));
        assert!(r.matches(&Predicate::new("size_bytes", CompareOp::Le, 100u64)));
        assert!(r.matches(&Predicate::new("size_bytes", CompareOp::Gt, 99u64)));
        assert!(!r.matches(&Predicate::new("size_bytes", CompareOp::Lt, 100u64)));
        assert!(r.matches(&Predicate::new("name", CompareOp::Eq, "photo.jpg")));
        assert!(r.matches(&Predicate::new("codec", CompareOp::Ne, "dag-pb")));
    }

    #[test]
    fn test_in_predicate() {
        let r = record(7);
        let p = Predicate::any_of(
            "size_bytes",
            vec![FieldValue::U64(5), FieldValue::U64(7), FieldValue::U64(9)],
        );
        assert!(r.matches(&p));

        let p_miss = Predicate::any_of("size_bytes", vec![FieldValue::U64(8)]);
        assert!(!r.matches(&p_miss));
    }

    #[test]
    fn test_tags_membership() {
        let mut r = record(1);
        r.tags.insert("video".into());
        r.tags.insert("archive".into());

        assert!(r.matches(&Predicate::new("tags", CompareOp::Eq, "video")));
        assert!(r.matches(&Predicate::any_of(
            "tags",
            vec![FieldValue::Str("missing".into()), FieldValue::Str("archive".into())]
        )));
        assert!(!r.matches(&Predicate::new("tags", CompareOp::Eq, "audio")));
        assert!(r.matches(&Predicate::new("tags", CompareOp::Ne, "audio")));
    }

    #[test]
    fn test_unset_optional_matches_only_ne() {
        let r = record(1);
        assert!(!r.matches(&Predicate::new("mime_type", CompareOp::Eq, "text/plain")));
        assert!(r.matches(&Predicate::new("mime_type", CompareOp::Ne, "text/plain")));
    }

    #[test]
    fn test_predicate_validation() {
        assert!(Predicate::new("size_bytes", CompareOp::Eq, 1u64).validate().is_ok());
        assert!(Predicate::new("no_such_column", CompareOp::Eq, 1u64)
            .validate()
            .is_err());
        assert!(Predicate::any_of("tags", vec![]).validate().is_err());
    }

    #[test]
    fn test_conjunction() {
        let mut r = record(100);
        r.tags.insert("cold".into());
        let preds = vec![
            Predicate::new("size_bytes", CompareOp::Ge, 50u64),
            Predicate::new("tags", CompareOp::Eq, "cold"),
        ];
        assert!(r.matches_all(&preds));

        let preds_miss = vec![
            Predicate::new("size_bytes", CompareOp::Ge, 50u64),
            Predicate::new("tags", CompareOp::Eq, "hot"),
        ];
        assert!(!r.matches_all(&preds_miss));
    }
}
