//! Backup labels.
//!
//! A label encodes the backup's type and its place in time:
//! `20240315-102030F` for a full, `20240315-102030F_20240316-010203D` for a
//! differential, `..I` for an incremental. Plain string ordering is
//! chronological, and a dependent backup always sorts immediately after its
//! full because the full's label is a strict prefix.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{8}-\d{6}F(_\d{8}-\d{6}[DI])?$").expect("label regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    fn suffix(self) -> char {
        match self {
            BackupType::Full => 'F',
            BackupType::Diff => 'D',
            BackupType::Incr => 'I',
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Diff => write!(f, "diff"),
            BackupType::Incr => write!(f, "incr"),
        }
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => Err(Error::ParamInvalid(format!(
                "'{s}' is not a backup type (full, diff, incr)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupLabel(String);

impl BackupLabel {
    /// Mint a label for a backup starting now. Dependent backups carry their
    /// full's label as the prefix.
    pub fn generate(
        backup_type: BackupType,
        now: DateTime<Utc>,
        parent_full: Option<&BackupLabel>,
    ) -> BackupLabel {
        let stamp = now.format("%Y%m%d-%H%M%S");
        match backup_type {
            BackupType::Full => BackupLabel(format!("{stamp}{}", backup_type.suffix())),
            BackupType::Diff | BackupType::Incr => {
                let parent = parent_full.expect("dependent backups have a parent full");
                BackupLabel(format!(
                    "{}_{stamp}{}",
                    parent.full_part(),
                    backup_type.suffix()
                ))
            }
        }
    }

    pub fn backup_type(&self) -> BackupType {
        match self.0.chars().last() {
            Some('F') => BackupType::Full,
            Some('D') => BackupType::Diff,
            Some('I') => BackupType::Incr,
            _ => unreachable!("labels are validated on construction"),
        }
    }

    /// The full-backup prefix of this label (the whole label for a full).
    pub fn full_part(&self) -> &str {
        match self.0.split_once('_') {
            Some((full, _)) => full,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BackupLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !LABEL_RE.is_match(s) {
            return Err(Error::Format(format!("'{s}' is not a backup label")));
        }
        Ok(BackupLabel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generate_and_parse() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 20, 30).unwrap();
        let full = BackupLabel::generate(BackupType::Full, now, None);
        assert_eq!(full.as_str(), "20240315-102030F");
        assert_eq!(full.backup_type(), BackupType::Full);

        let later = Utc.with_ymd_and_hms(2024, 3, 16, 1, 2, 3).unwrap();
        let incr = BackupLabel::generate(BackupType::Incr, later, Some(&full));
        assert_eq!(incr.as_str(), "20240315-102030F_20240316-010203I");
        assert_eq!(incr.backup_type(), BackupType::Incr);
        assert_eq!(incr.full_part(), "20240315-102030F");

        assert_eq!(incr.as_str().parse::<BackupLabel>().unwrap(), incr);
        assert!("garbage".parse::<BackupLabel>().is_err());
        assert!("20240315-102030X".parse::<BackupLabel>().is_err());
    }

    #[test]
    fn dependents_sort_after_their_full_and_before_next_full() {
        let full: BackupLabel = "20240315-102030F".parse().unwrap();
        let incr: BackupLabel = "20240315-102030F_20240316-010203I".parse().unwrap();
        let next_full: BackupLabel = "20240401-000000F".parse().unwrap();

        assert!(full < incr);
        assert!(incr < next_full);
        // the full's label is a strict prefix of its dependents
        assert!(incr.as_str().starts_with(full.as_str()));
    }

    #[test]
    fn backup_type_parse() {
        assert_eq!("full".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!("diff".parse::<BackupType>().unwrap(), BackupType::Diff);
        assert_eq!("incr".parse::<BackupType>().unwrap(), BackupType::Incr);
        assert!("partial".parse::<BackupType>().is_err());
    }
}
