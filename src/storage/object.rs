//! Parsing of raw git object text: commits, signatures, ref listings and
//! tree listings.  Nothing in here touches the filesystem.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::StorageError;

static SIGNATURE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+) <(.+)> (\d+) ([+-])(\d{2})(\d{2})$").expect("signature regex is valid")
});

const HEADS_PREFIX: &str = "refs/heads/";

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Author or committer line of a commit: `name <email> epoch ±HHMM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub date: DateTime<FixedOffset>,
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            name: String::new(),
            email: String::new(),
            date: DateTime::<Utc>::default().fixed_offset(),
        }
    }
}

impl Signature {
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.name.is_empty() {
            return Err(StorageError::Parse("signature has no name".into()));
        }
        if self.email.is_empty() {
            return Err(StorageError::Parse("signature has no email".into()));
        }
        if self.date.timestamp() < 0 {
            return Err(StorageError::Parse("signature date is before the epoch".into()));
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offset = self.date.offset().local_minus_utc();
        let sign = if offset < 0 { '-' } else { '+' };
        let offset = offset.abs();
        write!(
            f,
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.date.timestamp(),
            sign,
            offset / 3600,
            offset / 60 % 60,
        )
    }
}

/// Parse one signature line.  The instant is kept in the zone named by the
/// line's own offset, so formatting it again yields the original text.
pub fn parse_signature(line: &str) -> Result<Signature, StorageError> {
    let caps = SIGNATURE_LINE
        .captures(line)
        .ok_or_else(|| StorageError::Parse(format!("could not parse signature {line:?}")))?;

    let secs: i64 = caps[3]
        .parse()
        .map_err(|e| StorageError::Parse(format!("bad timestamp in {line:?}: {e}")))?;
    let hours: i32 = caps[5]
        .parse()
        .map_err(|e| StorageError::Parse(format!("bad offset in {line:?}: {e}")))?;
    let minutes: i32 = caps[6]
        .parse()
        .map_err(|e| StorageError::Parse(format!("bad offset in {line:?}: {e}")))?;

    let mut offset = hours * 3600 + minutes * 60;
    if &caps[4] == "-" {
        offset = -offset;
    }
    let zone = FixedOffset::east_opt(offset)
        .ok_or_else(|| StorageError::Parse(format!("offset out of range in {line:?}")))?;
    let date = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StorageError::Parse(format!("timestamp out of range in {line:?}")))?
        .with_timezone(&zone);

    let signature = Signature {
        name: caps[1].to_string(),
        email: caps[2].to_string(),
        date,
    };
    signature.validate()?;
    Ok(signature)
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub tree: String,
    pub parent: String,
    /// Subject line.
    pub message: String,
    pub body: String,
    pub author: Signature,
    pub committer: Signature,
}

enum Section {
    Header,
    Subject,
    Body,
}

/// Parse the output of `git cat-file -p <commit>`.
///
/// Unknown header lines (`gpgsig`, `encoding`, continuation lines, ...) are
/// skipped.  For merge commits the last `parent` line wins.  The subject is
/// the first non-blank line after the header.
pub fn parse_commit(text: &str, hash: &str) -> Result<Commit, StorageError> {
    let mut commit = Commit {
        hash: hash.to_string(),
        ..Commit::default()
    };
    let mut section = Section::Header;

    for line in text.lines() {
        match section {
            Section::Header => {
                if line.is_empty() {
                    section = Section::Subject;
                } else if let Some(tree) = line.strip_prefix("tree ") {
                    commit.tree = tree.to_string();
                } else if let Some(parent) = line.strip_prefix("parent ") {
                    commit.parent = parent.to_string();
                } else if let Some(author) = line.strip_prefix("author ") {
                    commit.author = parse_signature(author)?;
                } else if let Some(committer) = line.strip_prefix("committer ") {
                    commit.committer = parse_signature(committer)?;
                }
            }
            Section::Subject => {
                if !line.is_empty() {
                    commit.message = line.to_string();
                    section = Section::Body;
                }
            }
            Section::Body => {
                commit.body.push('\n');
                commit.body.push_str(line);
            }
        }
    }

    commit.body = commit.body.trim_start_matches('\n').to_string();
    Ok(commit)
}

// ---------------------------------------------------------------------------
// Refs and trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub sha1: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Parse one line of `for-each-ref --format='%(objectname) %(objecttype) %(refname)'`.
pub fn parse_branch_line(line: &str) -> Result<Branch, StorageError> {
    let fields: Vec<&str> = line.split(' ').collect();
    let [sha1, kind, refname] = fields.as_slice() else {
        return Err(StorageError::Parse(format!(
            "expected 3 fields in ref line, got {}: {line:?}",
            fields.len()
        )));
    };
    Ok(Branch {
        name: refname.strip_prefix(HEADS_PREFIX).unwrap_or(*refname).to_string(),
        sha1: sha1.to_string(),
        kind: kind.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub object: String,
    pub path: String,
}

/// Parse one line of `git ls-tree`: `<mode> <type> <object>\t<path>`.
pub fn parse_tree_entry(line: &str) -> Result<TreeEntry, StorageError> {
    let (meta, path) = line
        .split_once('\t')
        .ok_or_else(|| StorageError::Parse(format!("tree entry without path: {line:?}")))?;
    let fields: Vec<&str> = meta.split(' ').collect();
    let [mode, kind, object] = fields.as_slice() else {
        return Err(StorageError::Parse(format!(
            "expected 3 fields in tree entry, got {}: {line:?}",
            fields.len()
        )));
    };
    Ok(TreeEntry {
        mode: mode.to_string(),
        kind: kind.to_string(),
        object: object.to_string(),
        path: path.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT: &str = "tree 40279100b292dd26bfda150adf1c4fd5a4e52ffe
parent ae51e9d1b987f9086cbc65e694f06759bc62e743
author First Lastname <first.lastname@example.com> 1505935797 -0700
committer Second Lastname <second.lastname@example.com> 1505935797 -0700
something Foobar

do something very useful to conquer the world

my
awesome

body
";

    fn at(secs: i64, offset: i32) -> DateTime<FixedOffset> {
        DateTime::from_timestamp(secs, 0)
            .unwrap()
            .with_timezone(&FixedOffset::east_opt(offset).unwrap())
    }

    #[test]
    fn parses_commit() {
        let c = parse_commit(COMMIT, "abc123").unwrap();

        assert_eq!(c.hash, "abc123");
        assert_eq!(c.tree, "40279100b292dd26bfda150adf1c4fd5a4e52ffe");
        assert_eq!(c.parent, "ae51e9d1b987f9086cbc65e694f06759bc62e743");
        assert_eq!(c.author.name, "First Lastname");
        assert_eq!(c.author.email, "first.lastname@example.com");
        assert_eq!(c.author.date.timestamp(), 1505935797);
        assert_eq!(c.author.date.offset().local_minus_utc(), -7 * 3600);
        assert_eq!(c.committer.name, "Second Lastname");
        assert_eq!(c.message, "do something very useful to conquer the world");
        assert_eq!(c.body, "my\nawesome\n\nbody");
    }

    #[test]
    fn commit_without_body() {
        let text = "tree 4027\nauthor A <a@b.c> 1 +0000\ncommitter A <a@b.c> 1 +0000\n\nsubject only\n";
        let c = parse_commit(text, "h").unwrap();
        assert_eq!(c.message, "subject only");
        assert_eq!(c.body, "");
        assert_eq!(c.parent, "");
    }

    #[test]
    fn subject_skips_blank_lines_after_header() {
        let text = "tree 4027\nauthor A <a@b.c> 1 +0000\ncommitter A <a@b.c> 1 +0000\n\n\n\nsubject\n\nbody\n";
        let c = parse_commit(text, "h").unwrap();
        assert_eq!(c.message, "subject");
        assert_eq!(c.body, "body");
    }

    #[test]
    fn commit_with_bad_author_fails() {
        let text = "tree 4027\nauthor nobody\n\nsubject\n";
        assert!(matches!(
            parse_commit(text, "h"),
            Err(StorageError::Parse(_))
        ));
    }

    #[test]
    fn formats_signature() {
        let s = Signature {
            name: "Foo Bar".into(),
            email: "foo@bar.com".into(),
            date: at(1505935797, -7 * 3600),
        };
        assert_eq!(s.to_string(), "Foo Bar <foo@bar.com> 1505935797 -0700");
    }

    #[test]
    fn formats_positive_and_half_hour_offsets() {
        let s = Signature {
            name: "A".into(),
            email: "a@b".into(),
            date: at(100, 5 * 3600 + 30 * 60),
        };
        assert_eq!(s.to_string(), "A <a@b> 100 +0530");

        let s = Signature {
            date: at(100, -(30 * 60)),
            ..s
        };
        assert_eq!(s.to_string(), "A <a@b> 100 -0030");
    }

    #[test]
    fn signature_round_trips() {
        for line in [
            "Foo Bar <foo@bar.com> 1505925797 -0700",
            "Jane <jane@example.org> 0 +0000",
            "Some Body <sb@x.y> 1700000000 +0545",
        ] {
            let parsed = parse_signature(line).unwrap();
            assert_eq!(parsed.to_string(), line);
            assert_eq!(parse_signature(&parsed.to_string()).unwrap(), parsed);
        }
    }

    #[test]
    fn rejects_invalid_signature_lines() {
        for line in [
            "",
            "Foo Bar <foo@bar.com> 1505925797",
            "Foo Bar <> 1505925797 -0700",
            "<foo@bar.com> 1505925797 -0700",
        ] {
            assert!(parse_signature(line).is_err(), "{line:?} should not parse");
        }
    }

    #[test]
    fn validate_rejects_missing_fields_and_pre_epoch_dates() {
        let valid = Signature {
            name: "Foo".into(),
            email: "foo@bar.com".into(),
            date: at(1, 0),
        };
        assert!(valid.validate().is_ok());

        let no_name = Signature {
            name: String::new(),
            ..valid.clone()
        };
        assert!(no_name.validate().is_err());

        let no_email = Signature {
            email: String::new(),
            ..valid.clone()
        };
        assert!(no_email.validate().is_err());

        let before_epoch = Signature {
            date: at(-1, 0),
            ..valid
        };
        assert!(before_epoch.validate().is_err());
    }

    #[test]
    fn parses_branch_lines() {
        let b = parse_branch_line("ae51e9d1b987f9086cbc65e694f06759bc62e743 commit refs/heads/main")
            .unwrap();
        assert_eq!(b.name, "main");
        assert_eq!(b.sha1, "ae51e9d1b987f9086cbc65e694f06759bc62e743");
        assert_eq!(b.kind, "commit");

        let nested = parse_branch_line("ae51 commit refs/heads/feature/x").unwrap();
        assert_eq!(nested.name, "feature/x");

        assert!(parse_branch_line("ae51 commit").is_err());
        assert!(parse_branch_line("ae51 commit refs/heads/a extra").is_err());
    }

    #[test]
    fn parses_tree_entries() {
        let e = parse_tree_entry(
            "100644 blob dc2a1e6aeb5b1cf6f71666e4beb410457bdc114b\tGopkg.lock",
        )
        .unwrap();
        assert_eq!(e.mode, "100644");
        assert_eq!(e.kind, "blob");
        assert_eq!(e.object, "dc2a1e6aeb5b1cf6f71666e4beb410457bdc114b");
        assert_eq!(e.path, "Gopkg.lock");

        let d = parse_tree_entry(
            "040000 tree da792716f0b647e79fbfbff6c2462308791a7ea7\tvendor",
        )
        .unwrap();
        assert_eq!(d.kind, "tree");
        assert_eq!(d.path, "vendor");

        assert!(parse_tree_entry("100644 blob abc").is_err());
        assert!(parse_tree_entry("100644 blob\tfile").is_err());
    }
}
