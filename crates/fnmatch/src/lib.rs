// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Shell-style glob matching for build rules.
//!
//! `?` matches one character within a path component, `*` matches a
//! run of characters within a component, `**` crosses component
//! boundaries. Everything else is literal, and matches are anchored
//! to the whole path.

use std::{
    iter::Peekable,
    str::{Chars, FromStr},
};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, PartialEq, Eq)]
enum Fragment {
    /// `?`
    MatchOne,

    /// `*`
    MatchAny,

    /// `**` at the end of a pattern
    MatchPath,

    /// `**/`, zero or more whole components
    MatchComponents,

    /// Normal text.
    Text(String),
}

fn fragments_from_string(s: &str) -> Vec<Fragment> {
    let mut walker: Peekable<Chars<'_>> = s.chars().peekable();
    let mut builder = vec![];
    let mut text = String::new();

    while let Some(ch) = walker.next() {
        let next_token = match ch {
            '?' => Some(Fragment::MatchOne),
            '*' => {
                if walker.peek() == Some(&'*') {
                    walker.next();
                    // Swallow a trailing separator so `a/**/b` can
                    // also match `a/b`
                    if walker.peek() == Some(&'/') {
                        walker.next();
                        Some(Fragment::MatchComponents)
                    } else {
                        Some(Fragment::MatchPath)
                    }
                } else {
                    Some(Fragment::MatchAny)
                }
            }
            _ => {
                text.push(ch);
                None
            }
        };

        if let Some(token) = next_token {
            if !text.is_empty() {
                builder.push(Fragment::Text(std::mem::take(&mut text)));
            }
            builder.push(token);
        }
    }

    if !text.is_empty() {
        builder.push(Fragment::Text(text));
    }

    builder
}

fn fragment_to_regex_str(fragment: &Fragment) -> String {
    match fragment {
        Fragment::MatchOne => "[^/]".into(),
        Fragment::MatchAny => "[^/]*".into(),
        Fragment::MatchPath => ".*".into(),
        Fragment::MatchComponents => "(?:[^/]*/)*".into(),
        Fragment::Text(t) => regex::escape(t),
    }
}

/// A compiled glob pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    pub pattern: String,
    regex: Regex,
}

impl Pattern {
    /// Returns true if `path` matches the whole pattern
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compiled = fragments_from_string(s)
            .iter()
            .map(fragment_to_regex_str)
            .collect::<String>();

        Ok(Self {
            pattern: s.into(),
            regex: Regex::new(&format!("^{compiled}$"))?,
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
}
