// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory record database.
//!
//! A [`Repository`] maps host names in browser form to the stack of records
//! answering for them.  It is not synchronized: the server task mutates a
//! private deep clone and publishes it atomically, so readers always see a
//! stable snapshot (see `server`).  Every stack in the map is non-empty;
//! names whose last record is removed are dropped from the map.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::host::Host;
use crate::record::{Record, RecordStack};

#[derive(Clone, Debug, Default)]
pub struct Repository {
    stacks: HashMap<String, RecordStack>,
}

impl Repository {
    pub fn new() -> Repository {
        Repository::default()
    }

    /// Inserts `rec` as the active record for `host`.
    pub fn add(&mut self, host: &Host, rec: Record) {
        self.stacks
            .entry(host.browser().to_string())
            .or_default()
            .push_front(rec);
    }

    /// Removes all records inserted by the source named `source`.  Names
    /// left with no records are removed completely.
    pub fn delete_source(&mut self, source: &str) {
        self.stacks.retain(|_, stack| stack.delete_source(source) > 0);
    }

    /// Returns the active record for `host`, if any.  On an exact miss the
    /// wildcard entries are consulted and the first whose pattern matches
    /// wins; the iteration order among wildcards is unspecified.
    pub fn get(&self, host: &Host) -> Option<&Record> {
        if let Some(stack) = self.stacks.get(host.browser()) {
            return stack.head();
        }
        for (key, stack) in &self.stacks {
            let pattern = Host::from(key.as_str());
            if !pattern.is_wildcard() {
                continue;
            }
            if pattern.matches(host) {
                return stack.head();
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Writes the repository contents in hosts format to `w`.
    ///
    /// One line per record: `<destination>\t<name>`, with shadowed records
    /// commented out with `# `.  Lines are ordered by destination, then by
    /// the active destination of the name (the group), then stack position,
    /// then name, so the output is stable across runs.
    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        let mut flat: Vec<FlatRecord<'_>> = Vec::new();
        for (name, stack) in &self.stacks {
            let Some(head) = stack.head() else {
                continue;
            };
            let group = head.target();
            for (pos, rec) in stack.iter().enumerate() {
                flat.push(FlatRecord {
                    pos,
                    group,
                    dst: rec.target(),
                    name: name.as_str(),
                });
            }
        }
        flat.sort_by(|a, b| {
            (a.dst, a.group, a.pos, a.name).cmp(&(b.dst, b.group, b.pos, b.name))
        });
        for f in flat {
            if f.pos > 0 {
                writeln!(w, "# {}\t{}", f.dst, f.name)?;
            } else {
                writeln!(w, "{}\t{}", f.dst, f.name)?;
            }
        }
        Ok(())
    }
}

/// One dump line before sorting.  Entries of the same name share a group
/// (the active record's destination) and are ordered within it by stack
/// position.
struct FlatRecord<'a> {
    pos: usize,
    group: &'a str,
    dst: &'a str,
    name: &'a str,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    fn rec(shost: &str, ip: &str, origin: &str) -> Record {
        let ip: Ipv4Addr = ip.parse().unwrap();
        Record::new(
            Host::from(shost),
            Host::from(ip.to_string()),
            false,
            Some(ip),
            None,
            Duration::from_secs(3600),
            Arc::from(origin),
        )
        .unwrap()
    }

    #[test]
    fn test_add_get_exact() {
        let mut repo = Repository::new();
        repo.add(&Host::from("foo.lan"), rec("foo.lan", "1.2.3.4", "s"));
        let got = repo.get(&Host::from("foo.lan")).unwrap();
        assert_eq!(got.target(), "1.2.3.4");
        // Trailing dot in the query resolves to the same browser-form key.
        assert!(repo.get(&Host::from("foo.lan.")).is_some());
        assert!(repo.get(&Host::from("bar.lan")).is_none());
    }

    #[test]
    fn test_shadowing_and_delete_isolation() {
        let mut repo = Repository::new();
        let x = Host::from("x.lan");
        repo.add(&x, rec("x.lan", "1.1.1.1", "a"));
        repo.add(&x, rec("x.lan", "2.2.2.2", "b"));

        assert_eq!(repo.get(&x).unwrap().target(), "2.2.2.2");

        repo.delete_source("b");
        assert_eq!(repo.get(&x).unwrap().target(), "1.1.1.1");

        repo.delete_source("a");
        assert!(repo.get(&x).is_none());
        assert!(repo.is_empty());
    }

    #[test]
    fn test_wildcard_fallback_and_precedence() {
        let mut repo = Repository::new();
        repo.add(
            &Host::from("*.test.lan"),
            rec("*.test.lan", "1.2.3.4", "w"),
        );
        repo.add(&Host::from("a.test.lan"), rec("a.test.lan", "9.9.9.9", "e"));

        // Exact match wins over any wildcard.
        assert_eq!(repo.get(&Host::from("a.test.lan")).unwrap().target(), "9.9.9.9");
        // Wildcard serves the rest of the label.
        assert_eq!(repo.get(&Host::from("foo.test.lan")).unwrap().target(), "1.2.3.4");
        // One label only.
        assert!(repo.get(&Host::from("foo.bar.test.lan")).is_none());
    }

    #[test]
    fn test_clone_isolation() {
        let mut repo = Repository::new();
        repo.add(&Host::from("foo.lan"), rec("foo.lan", "1.2.3.4", "a"));

        let mut copy = repo.clone();
        copy.add(&Host::from("bar.lan"), rec("bar.lan", "5.6.7.8", "b"));
        copy.delete_source("a");

        // The original is untouched by mutations of the clone.
        assert!(repo.get(&Host::from("foo.lan")).is_some());
        assert!(repo.get(&Host::from("bar.lan")).is_none());
        assert!(copy.get(&Host::from("foo.lan")).is_none());
    }

    #[test]
    fn test_dump_format() {
        let mut repo = Repository::new();
        let x = Host::from("x.lan");
        repo.add(&x, rec("x.lan", "1.1.1.1", "a"));
        repo.add(&x, rec("x.lan", "2.2.2.2", "b"));
        repo.add(&Host::from("foo.lan"), rec("foo.lan", "1.2.3.4", "s"));

        let mut out = Vec::new();
        repo.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        // Ordered by destination; the shadowed record is commented.
        assert_eq!(
            text,
            "# 1.1.1.1\tx.lan\n1.2.3.4\tfoo.lan\n2.2.2.2\tx.lan\n"
        );
    }
}
