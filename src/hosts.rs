// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parser for the hosts-style dump format.
//!
//! Each line carries an address followed by one or more names; `#` starts a
//! comment, so the shadowed lines of a repository dump are skipped.  Later
//! lines win when a name repeats.

use std::collections::HashMap;
use std::io::{self, BufRead};

/// Mapping from name to address as recovered from a dump.
pub type Hosts = HashMap<String, String>;

/// Parses hosts-format text from `r`.
pub fn parse<R: BufRead>(r: R) -> io::Result<Hosts> {
    let mut hosts = Hosts::new();
    for line in r.lines() {
        let line = line?;
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let Some(addr) = fields.next() else {
            continue;
        };
        for name in fields {
            hosts.insert(name.to_string(), addr.to_string());
        }
    }
    Ok(hosts)
}
