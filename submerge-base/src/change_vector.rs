use crate::{err, DatabaseId, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A vector-clock over per-database etags: `dbId:etag[,dbId:etag]*`.
///
/// Wire and storage representation is always the canonical string form
/// (entries sorted by [`DatabaseId`]), matching §3/§6 of the replication
/// contract: the change vector travels as a plain string field inside JSON
/// control messages and `ChangeLogEntry` headers.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeVector(BTreeMap<DatabaseId, u64>);

impl ChangeVector {
    pub fn new() -> Self {
        ChangeVector(BTreeMap::new())
    }

    pub fn etag_for(&self, db: &DatabaseId) -> u64 {
        self.0.get(db).copied().unwrap_or(0)
    }

    pub fn set(&mut self, db: DatabaseId, etag: u64) {
        self.0
            .entry(db)
            .and_modify(|e| *e = (*e).max(etag))
            .or_insert(etag);
    }

    /// Merge `other` into `self`, taking the max etag per database id.
    pub fn merge(&mut self, other: &ChangeVector) {
        for (db, etag) in other.0.iter() {
            self.set(db.clone(), *etag);
        }
    }

    /// True iff `other` has a strictly greater etag for at least one
    /// database id that `self` does not dominate. Used by §4.8's
    /// change-vector jump rule to detect an administrator-issued cursor jump.
    pub fn dominates(&self, other: &ChangeVector) -> bool {
        other.0.iter().all(|(db, etag)| self.etag_for(db) >= *etag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DatabaseId, &u64)> {
        self.0.iter()
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (db, etag) in self.0.iter() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}:{}", db, etag)?;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(ChangeVector(map));
        }
        for part in trimmed.split(',') {
            let (db, etag) = part
                .split_once(':')
                .ok_or_else(|| err(format!("malformed change vector entry: {part:?}")))?;
            let etag: u64 = etag
                .parse()
                .map_err(|_| err(format!("malformed change vector etag: {etag:?}")))?;
            map.insert(DatabaseId(db.to_string()), etag);
        }
        Ok(ChangeVector(map))
    }
}

impl TryFrom<String> for ChangeVector {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<ChangeVector> for String {
    fn from(cv: ChangeVector) -> String {
        cv.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let cv: ChangeVector = "A:3,B:7".parse().unwrap();
        assert_eq!(cv.to_string(), "A:3,B:7");
        assert_eq!(cv.etag_for(&DatabaseId::from("A")), 3);
        assert_eq!(cv.etag_for(&DatabaseId::from("C")), 0);
    }

    #[test]
    fn merge_takes_max_per_db() {
        let mut a: ChangeVector = "A:3,B:7".parse().unwrap();
        let b: ChangeVector = "A:5,C:1".parse().unwrap();
        a.merge(&b);
        assert_eq!(a.to_string(), "A:5,B:7,C:1");
    }

    #[test]
    fn dominates_detects_jump() {
        let low: ChangeVector = "A:3".parse().unwrap();
        let high: ChangeVector = "A:13".parse().unwrap();
        assert!(!low.dominates(&high));
        assert!(high.dominates(&low));
    }
}
