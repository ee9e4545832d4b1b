// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The access ruleset: loading, validation, and matching.
//!
//! Rules are evaluated in file order and the last matching rule wins, so a
//! policy reads as a stack of narrower overrides on a coarser base, the way
//! firewall rulesets are written. User and group names resolve through the
//! system databases at load time, before privileges are dropped.

use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Who a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Everyone.
    Any,
    /// Connections owned by this uid.
    Uid(u32),
    /// Connections whose owner is in this group.
    Gid(u32),
}

/// A single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub selector: Selector,
    pub prefix: String,
    pub allow: bool,
}

/// An ordered ruleset; the last matching rule decides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

#[derive(Error, Debug)]
pub enum ConfError {
    #[error("could not read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration rule at line {line}: {text}")]
    Syntax { line: usize, text: String },

    #[error("user not found at line {line}: {name}")]
    UnknownUser { line: usize, name: String },

    #[error("group not found at line {line}: {name}")]
    UnknownGroup { line: usize, name: String },

    #[error("name service lookup failed: {0}")]
    Lookup(#[from] nix::Error),
}

impl Ruleset {
    /// Build a ruleset directly from rules (primarily for tests; loading a
    /// file is the production path).
    #[must_use]
    pub fn from_rules(rules: Vec<Rule>) -> Ruleset {
        Ruleset { rules }
    }

    /// Read and parse the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Any I/O failure, syntax error, or unknown user/group name is fatal.
    pub fn load(path: &Path) -> Result<Ruleset, ConfError> {
        Ruleset::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse configuration text: one rule per line, `#` comments and blank
    /// lines ignored.
    ///
    /// # Errors
    ///
    /// As for [`Ruleset::load`].
    pub fn parse(text: &str) -> Result<Ruleset, ConfError> {
        let mut rules = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = lineno + 1;
            let text = raw.trim_end_matches(['\r', '\n']);
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            match parse_rule(text, line)? {
                Some(rule) => rules.push(rule),
                None => {
                    warn!("invalid configuration rule: {text}");
                    return Err(ConfError::Syntax {
                        line,
                        text: text.to_string(),
                    });
                }
            }
        }
        Ok(Ruleset { rules })
    }

    /// Decide whether `uid` (with groups `gids`) may request `path`.
    ///
    /// Every rule is consulted in order; each match overwrites the verdict,
    /// and the default is deny.
    #[must_use]
    pub fn check(&self, path: &str, uid: u32, gids: &[u32]) -> bool {
        let mut allow = false;
        for rule in &self.rules {
            match rule.selector {
                Selector::Uid(u) if u != uid => continue,
                Selector::Gid(g) if !gids.contains(&g) => continue,
                _ => {}
            }
            if path_match(path, &rule.prefix) {
                allow = rule.allow;
            }
        }
        allow
    }
}

/// Parse one rule line. `Ok(None)` means a syntax error (reported with the
/// line by the caller); name lookups fail with their own errors.
fn parse_rule(text: &str, line: usize) -> Result<Option<Rule>, ConfError> {
    /* Allow or Deny? */
    let (allow, rest) = if let Some(rest) = text.strip_prefix("Allow ") {
        (true, rest)
    } else if let Some(rest) = text.strip_prefix("Deny ") {
        (false, rest)
    } else {
        return Ok(None);
    };

    /* Is there a user/group restriction? */
    let (selector, rest) = if let Some(rest) = rest.strip_prefix("user ") {
        let Some((name, rest)) = rest.split_once(' ') else {
            return Ok(None);
        };
        let user = nix::unistd::User::from_name(name)?.ok_or_else(|| ConfError::UnknownUser {
            line,
            name: name.to_string(),
        })?;
        (Selector::Uid(user.uid.as_raw()), rest)
    } else if let Some(rest) = rest.strip_prefix("group ") {
        let Some((name, rest)) = rest.split_once(' ') else {
            return Ok(None);
        };
        let group = nix::unistd::Group::from_name(name)?.ok_or_else(|| ConfError::UnknownGroup {
            line,
            name: name.to_string(),
        })?;
        (Selector::Gid(group.gid.as_raw()), rest)
    } else {
        (Selector::Any, rest)
    };

    /* We should have a quoted string, and nothing after it. */
    let Some(prefix) = rest
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
    else {
        return Ok(None);
    };
    if prefix.contains('"') {
        return Ok(None);
    }

    /* Make sure that there aren't any bogus wildcards. */
    let bytes = prefix.as_bytes();
    for (i, &c) in bytes.iter().enumerate() {
        if c == b'*' {
            /* Must follow a '/' character. */
            if i == 0 || bytes[i - 1] != b'/' {
                return Ok(None);
            }
            /*
             * Must precede a '/' character or be at the end of the string
             * (which is nonetheless pointless, since we match prefixes).
             */
            if i + 1 < bytes.len() && bytes[i + 1] != b'/' {
                return Ok(None);
            }
        }
    }

    Ok(Some(Rule {
        selector,
        prefix: prefix.to_string(),
        allow,
    }))
}

/// Match `prefix` against the start of `path`; a `*` consumes one path
/// segment. The loader guarantees a `*` is always a whole segment, so this
/// walk cannot run past a dangling wildcard.
fn path_match(path: &str, prefix: &str) -> bool {
    let path = path.as_bytes();
    let mut pi = 0;

    /* Scan through the prefix one character at a time. */
    for &pc in prefix.as_bytes() {
        /* A '*' matches until the next '/' or the end. */
        if pc == b'*' {
            while pi < path.len() && path[pi] != b'/' {
                pi += 1;
            }
            continue;
        }

        /* Anything else only matches itself. */
        if pi >= path.len() || path[pi] != pc {
            return false;
        }
        pi += 1;
    }

    /* The entire prefix matches the provided path. */
    true
}

#[cfg(test)]
mod test {
    use super::{Rule, Ruleset, Selector, path_match};

    const ALICE: u32 = 1001;
    const BOB: u32 = 1002;

    fn scenario_rules() -> Ruleset {
        Ruleset::from_rules(vec![
            Rule {
                selector: Selector::Any,
                prefix: "/".to_string(),
                allow: false,
            },
            Rule {
                selector: Selector::Uid(ALICE),
                prefix: "/meta/".to_string(),
                allow: true,
            },
            Rule {
                selector: Selector::Uid(ALICE),
                prefix: "/meta/secret".to_string(),
                allow: false,
            },
        ])
    }

    #[test]
    fn last_matching_rule_wins() {
        let rules = scenario_rules();
        assert!(rules.check("/meta/data", ALICE, &[ALICE]));
        assert!(!rules.check("/meta/secret/key", ALICE, &[ALICE]));
        assert!(!rules.check("/meta/data", BOB, &[BOB]));
    }

    #[test]
    fn default_is_deny() {
        let rules = Ruleset::from_rules(vec![]);
        assert!(!rules.check("/", 0, &[0]));
    }

    #[test]
    fn appending_a_matching_rule_flips_the_decision() {
        let base = scenario_rules();
        for allow in [true, false] {
            let mut rules = base.clone();
            rules.rules.push(Rule {
                selector: Selector::Any,
                prefix: "/meta/".to_string(),
                allow,
            });
            assert_eq!(rules.check("/meta/data", ALICE, &[ALICE]), allow);
            assert_eq!(rules.check("/meta/data", BOB, &[BOB]), allow);
        }
    }

    #[test]
    fn group_rules_match_any_member() {
        let rules = Ruleset::from_rules(vec![Rule {
            selector: Selector::Gid(20),
            prefix: "/".to_string(),
            allow: true,
        }]);
        assert!(rules.check("/x", ALICE, &[1001, 20]));
        assert!(!rules.check("/x", ALICE, &[1001, 21]));
    }

    #[test]
    fn prefixes_match_prefixes() {
        assert!(path_match("/meta/data", "/meta/"));
        assert!(path_match("/meta/data", "/meta/data"));
        assert!(path_match("/metadata", "/meta"));
        assert!(!path_match("/meta", "/meta/"));
        assert!(!path_match("/other", "/meta"));
        assert!(path_match("/anything", "/"));
    }

    #[test]
    fn wildcards_consume_one_segment() {
        assert!(path_match("/a/b/c", "/a/*/c"));
        assert!(path_match("/a//c", "/a/*/c"));
        assert!(!path_match("/a/b/d", "/a/*/c"));
        assert!(!path_match("/a/b/c/d", "/a/*/d"));
        assert!(path_match("/a/b", "/*/"));
        assert!(path_match("/a", "/*"));
    }

    #[test]
    fn parses_the_grammar() {
        let rules = Ruleset::parse(
            "# comment\n\
             \n\
             Deny \"/\"\n\
             Allow \"/latest/meta-data/\"\n\
             Deny \"/latest/*/secret\"\n",
        )
        .unwrap();
        assert!(rules.check("/latest/meta-data/ami-id", 1, &[1]));
        assert!(!rules.check("/latest/anything/secret", 1, &[1]));
        assert!(!rules.check("/other", 1, &[1]));
    }

    #[test]
    fn resolves_user_and_group_names() {
        // root is uid/gid 0 everywhere we run tests.
        let rules = Ruleset::parse("Allow user root \"/\"\nDeny group root \"/x\"\n").unwrap();
        assert_eq!(
            rules,
            Ruleset::from_rules(vec![
                Rule {
                    selector: Selector::Uid(0),
                    prefix: "/".to_string(),
                    allow: true,
                },
                Rule {
                    selector: Selector::Gid(0),
                    prefix: "/x".to_string(),
                    allow: false,
                },
            ])
        );
    }

    #[test]
    fn unknown_names_are_fatal() {
        assert!(Ruleset::parse("Allow user no-such-user-here \"/\"\n").is_err());
        assert!(Ruleset::parse("Allow group no-such-group-here \"/\"\n").is_err());
    }

    #[test]
    fn rejects_bad_syntax() {
        for text in [
            "Permit \"/\"",            // unknown action
            "Allow",                   // nothing after the action
            "Allow /x",                // unquoted prefix
            "Allow \"/x",              // unterminated quote
            "Allow \"/x\" trailing",   // junk after the prefix
            "Allow  \"/x\"",           // two spaces between tokens
            "Allow\t\"/x\"",           // tab separator
            "Allow user root\t\"/\"",  // tab after name
            "Allow \"/a\"b\"",         // interior quote
        ] {
            assert!(Ruleset::parse(text).is_err(), "accepted: {text}");
        }
    }

    #[test]
    fn rejects_bogus_wildcards() {
        for text in [
            "Allow \"*\"",
            "Allow \"/a*\"",
            "Allow \"/*x/\"",
            "Allow \"/a/*b\"",
        ] {
            assert!(Ruleset::parse(text).is_err(), "accepted: {text}");
        }
        // A whole-segment wildcard is legal, trailing or not.
        assert!(Ruleset::parse("Allow \"/a/*/b\"").is_ok());
        assert!(Ruleset::parse("Allow \"/a/*\"").is_ok());
    }

    #[test]
    fn reparsing_preserves_decisions() {
        let text = "Deny \"/\"\nAllow \"/meta/\"\nDeny \"/meta/secret\"\n";
        let first = Ruleset::parse(text).unwrap();
        let second = Ruleset::parse(text).unwrap();
        for path in ["/", "/meta/data", "/meta/secret/key", "/other"] {
            assert_eq!(first.check(path, 1, &[1]), second.check(path, 1, &[1]));
        }
    }
}
