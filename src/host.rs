// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical DNS host names and wildcard-aware matching.
//!
//! A [`Host`] is kept in whatever form it arrived in; the two canonical
//! spellings are produced on demand: the *browser* form (no trailing dot),
//! used as the repository map key, and the *wire* form (trailing dot), used
//! as the owner name of resource records.  A host containing `*` is a
//! wildcard host; wildcards are matched lazily at query time rather than
//! materialized, since the match set can be unbounded.

use std::fmt;

/// A FQDN or common representation of a DNS address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Host(String);

impl Host {
    /// The FQDN without the trailing dot.
    pub fn browser(&self) -> &str {
        self.0.strip_suffix('.').unwrap_or(&self.0)
    }

    /// The FQDN with the trailing dot.
    pub fn wire(&self) -> String {
        if self.0.ends_with('.') {
            self.0.clone()
        } else {
            format!("{}.", self.0)
        }
    }

    /// True if `self` ends with `suffix`, compared on browser forms.
    pub fn has_suffix(&self, suffix: &Host) -> bool {
        self.browser().ends_with(suffix.browser())
    }

    /// True if this host contains a `*` anywhere.
    pub fn is_wildcard(&self) -> bool {
        self.0.contains('*')
    }

    /// Matches host `self` with host `other`.  Either can be a wildcard
    /// host.  If both are wildcards, they match only when they are the exact
    /// same string.
    pub fn matches(&self, other: &Host) -> bool {
        if self.is_wildcard() {
            if other.is_wildcard() {
                return self.0 == other.0;
            }
            return match_wildcard_host(self, other);
        }
        if other.is_wildcard() {
            return match_wildcard_host(other, self);
        }
        self.0 == other.0
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Host {
        Host(s.to_string())
    }
}

impl From<String> for Host {
    fn from(s: String) -> Host {
        Host(s)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Matches wildcard host `pattern` against non-wildcard host `name`,
/// label by label.  The label counts must be equal.
fn match_wildcard_host(pattern: &Host, name: &Host) -> bool {
    let plabels: Vec<&str> = pattern.browser().split('.').collect();
    let nlabels: Vec<&str> = name.browser().split('.').collect();
    if plabels.len() != nlabels.len() {
        return false;
    }
    plabels
        .iter()
        .zip(nlabels.iter())
        .all(|(p, n)| match_wildcard_label(p, n))
}

/// Matches a single wildcard label `pattern` against plain label `name`.
/// At most one `*` is supported per label; it matches any prefix, suffix,
/// or middle.  Labels with more than one `*` never match.
fn match_wildcard_label(pattern: &str, name: &str) -> bool {
    match pattern.matches('*').count() {
        0 => pattern == name,
        1 => {
            if pattern == "*" {
                return true;
            }
            // Exactly one star, so split_once always succeeds.
            let Some((prefix, suffix)) = pattern.split_once('*') else {
                return false;
            };
            if prefix.is_empty() {
                return name.ends_with(suffix);
            }
            if suffix.is_empty() {
                return name.starts_with(prefix);
            }
            name.starts_with(prefix) && name.ends_with(suffix)
        }
        _ => false,
    }
}
