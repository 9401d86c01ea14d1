//! Selective restore: narrowing a restore to chosen databases or relations.
//!
//! The selector file lists one tuple per line as
//! `db-oid[/tablespace-oid[/relfilenode]]`; blank lines and `#` comments are
//! ignored. A tuple without a relfilenode selects the whole database.
//! Relation files excluded by the selector are restored as zero-length so
//! the catalog stays navigable; everything that is not user relation data
//! (global catalog, configuration, and system tables of any database) is
//! always restored in full.

use std::str::FromStr;

use camino::Utf8Path;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Error, Result};

/// First OID assigned to user objects; anything below is a system table.
const FIRST_NORMAL_OBJECT_ID: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SelectorTuple {
    db_oid: u32,
    tablespace_oid: Option<u32>,
    relfilenode: Option<u32>,
}

impl FromStr for SelectorTuple {
    type Err = Error;

    fn from_str(s: &str) -> Result<SelectorTuple> {
        let mut parts = s.split('/');
        let parse = |part: Option<&str>, what: &str| -> Result<Option<u32>> {
            part.map(|p| {
                p.parse::<u32>()
                    .map_err(|_| Error::Format(format!("selector {what} '{p}' is not an oid")))
            })
            .transpose()
        };

        let db_oid = parse(parts.next(), "db-oid")?
            .ok_or_else(|| Error::Format("selector line is empty".into()))?;
        let second = parse(parts.next(), "tablespace-oid")?;
        let third = parse(parts.next(), "relfilenode")?;
        if parts.next().is_some() {
            return Err(Error::Format(format!("selector line '{s}' has too many fields")));
        }

        // two-field form is db/relfilenode
        let (tablespace_oid, relfilenode) = match (second, third) {
            (Some(rel), None) => (None, Some(rel)),
            other => other,
        };

        Ok(SelectorTuple {
            db_oid,
            tablespace_oid,
            relfilenode,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSelector {
    tuples: Vec<SelectorTuple>,
}

static RELATION_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    // base/<db-oid>/<relfilenode>[_fork][.segment]
    // pg_tblspc/<ts-oid>/<catalog-version>/<db-oid>/<relfilenode>...
    Regex::new(
        r"^(?:base/(?P<db>[0-9]+)|pg_tblspc/(?P<ts>[0-9]+)/[^/]+/(?P<tsdb>[0-9]+))/(?P<rel>[0-9]+)(?:_[a-z]+)?(?:\.[0-9]+)?$",
    )
    .expect("relation path regex is valid")
});

impl RestoreSelector {
    pub fn from_file(path: &Utf8Path) -> Result<RestoreSelector> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::FileOpen(format!("selector file '{path}': {e}")))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<RestoreSelector> {
        let mut tuples = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            tuples.push(line.parse()?);
        }
        if tuples.is_empty() {
            return Err(Error::Format("selector file selects nothing".into()));
        }
        Ok(RestoreSelector { tuples })
    }

    /// Whether the cluster-relative path should be restored with content.
    /// Non-relation files and system tables always are.
    pub fn restores_content(&self, cluster_path: &str) -> bool {
        let Some(captures) = RELATION_PATH_RE.captures(cluster_path) else {
            return true; // not user relation data
        };

        let db_oid: u32 = captures
            .name("db")
            .or_else(|| captures.name("tsdb"))
            .expect("regex guarantees a db group")
            .as_str()
            .parse()
            .expect("regex matched digits");
        let tablespace_oid: Option<u32> =
            captures.name("ts").map(|m| m.as_str().parse().expect("digits"));
        let relfilenode: u32 = captures
            .name("rel")
            .expect("regex guarantees a rel group")
            .as_str()
            .parse()
            .expect("regex matched digits");

        // System tables of any database are always restored.
        if relfilenode < FIRST_NORMAL_OBJECT_ID {
            return true;
        }

        self.tuples.iter().any(|t| {
            t.db_oid == db_oid
                && (t.tablespace_oid.is_none() || t.tablespace_oid == tablespace_oid)
                && (t.relfilenode.is_none() || t.relfilenode == Some(relfilenode))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_database_selection() {
        let selector = RestoreSelector::parse("16384\n").unwrap();
        // selected database: user tables restored
        assert!(selector.restores_content("base/16384/16400"));
        // other database: user tables zeroed
        assert!(!selector.restores_content("base/16500/16401"));
        // system tables of the other database still restored
        assert!(selector.restores_content("base/16500/1259"));
        // non-relation data always restored
        assert!(selector.restores_content("global/pg_control"));
        assert!(selector.restores_content("PG_VERSION"));
    }

    #[test]
    fn single_relation_selection() {
        let selector = RestoreSelector::parse("16384/16400").unwrap();
        assert!(selector.restores_content("base/16384/16400"));
        assert!(selector.restores_content("base/16384/16400.1"));
        assert!(selector.restores_content("base/16384/16400_fsm"));
        assert!(!selector.restores_content("base/16384/16401"));
    }

    #[test]
    fn tablespace_tuples() {
        let selector = RestoreSelector::parse("16384/1663/16400").unwrap();
        assert!(selector.restores_content("pg_tblspc/1663/PG_16_202307071/16384/16400"));
        assert!(!selector.restores_content("pg_tblspc/1664/PG_16_202307071/16384/16400"));
    }

    #[test]
    fn comments_and_blanks() {
        let selector = RestoreSelector::parse("# prod database\n\n16384\n").unwrap();
        assert!(selector.restores_content("base/16384/99999"));
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert!(RestoreSelector::parse("").is_err());
        assert!(RestoreSelector::parse("not-an-oid").is_err());
        assert!(RestoreSelector::parse("1/2/3/4").is_err());
    }
}
