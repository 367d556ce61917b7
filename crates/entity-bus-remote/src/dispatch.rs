//! Path-based command lookup.
//!
//! Paths are split on `/`. A registered path is one of three kinds:
//! - static: matched by exact string
//! - variable: contains `{name}` segments, each matching one segment
//! - wildcard: contains a `*` segment, matching one or more segments
//!
//! Static paths win over variable paths, which win over wildcard paths.
//! Within a kind, the first registered match wins. Captured segments are
//! written into the request metainfo as `PATH_<name>`.

use std::{collections::HashMap, sync::Arc};

use entity_bus_core::Metainfo;

use crate::{messages::StructValue, request_context::RequestContext};

/// Metainfo key prefix for captured path segments.
pub const PATH_PREFIX: &str = "PATH_";

/// Metainfo key for a bare `*` capture.
pub const PATH_WILDCARD: &str = "PATH_*";

/// Type-erased request handler.
pub type CommandFn = Arc<dyn Fn(RequestContext, StructValue) + Send + Sync>;

/// A registered handler and the type it expects.
#[derive(Clone)]
pub struct Command {
    pub type_name: String,
    pub func: CommandFn,
}

struct PatternCommand {
    path: String,
    segments: Vec<String>,
    command: Command,
}

/// Commands of one entity.
#[derive(Default)]
pub struct CommandTable {
    statics: HashMap<String, Command>,
    variables: Vec<PatternCommand>,
    wildcards: Vec<PatternCommand>,
}

fn capture_key(segment: &str, open: char, close: char) -> Option<String> {
    let name = segment.strip_prefix(open)?.strip_suffix(close)?;
    (!name.is_empty()).then(|| format!("{PATH_PREFIX}{name}"))
}

fn match_variable(pattern: &[String], entries: &[&str]) -> Option<Vec<(String, String)>> {
    if pattern.len() != entries.len() {
        return None;
    }
    let mut captures = Vec::new();
    for (segment, entry) in pattern.iter().zip(entries) {
        if segment.starts_with('{') && segment.ends_with('}') && segment.len() >= 2 {
            if let Some(key) = capture_key(segment, '{', '}') {
                captures.push((key, (*entry).to_owned()));
            }
        } else if segment != entry {
            return None;
        }
    }
    Some(captures)
}

/// A `*` consumes entries up to the next literal segment of the pattern,
/// or to the end of the path when it is the last segment.
fn match_wildcard(pattern: &[String], entries: &[&str]) -> Option<Vec<(String, String)>> {
    let mut captures = Vec::new();
    let mut j = 0;
    let mut i = 0;
    while i < pattern.len() {
        let segment = &pattern[i];
        if segment.starts_with('*') {
            i += 1;
            let next = pattern.get(i);
            let mut value = String::new();
            let mut matched = false;
            while j < entries.len() && !matched {
                let entry = entries[j];
                let is_next = next.is_some_and(|n| n == entry);
                let is_last = next.is_none() && j + 1 == entries.len();
                if !is_next {
                    if !value.is_empty() {
                        value.push('/');
                    }
                    value.push_str(entry);
                }
                if is_next || is_last {
                    let key = capture_key(segment, '*', '*')
                        .unwrap_or_else(|| PATH_WILDCARD.to_owned());
                    captures.push((key, value.clone()));
                    matched = true;
                }
                j += 1;
            }
            if !matched {
                return None;
            }
        } else {
            if entries.get(j) != Some(&segment.as_str()) {
                return None;
            }
            j += 1;
        }
        i += 1;
    }
    (j == entries.len()).then_some(captures)
}

impl CommandTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering a static path again replaces it.
    pub fn register(&mut self, path: &str, command: Command) {
        let segments: Vec<String> = path.split('/').map(str::to_owned).collect();
        let pattern = |command| PatternCommand {
            path: path.to_owned(),
            segments,
            command,
        };
        if path.contains('{') {
            self.variables.push(pattern(command));
        } else if path.contains('*') {
            self.wildcards.push(pattern(command));
        } else {
            self.statics.insert(path.to_owned(), command);
        }
    }

    /// Type expected by the handler at exactly `path`.
    #[must_use]
    pub fn type_of(&self, path: &str) -> Option<&str> {
        self.statics
            .get(path)
            .or_else(|| {
                self.variables
                    .iter()
                    .chain(&self.wildcards)
                    .find(|p| p.path == path)
                    .map(|p| &p.command)
            })
            .map(|command| command.type_name.as_str())
    }

    /// Find the handler for `path`, writing captures into `metainfo`.
    #[must_use]
    pub fn resolve(&self, path: &str, metainfo: &mut Metainfo) -> Option<Command> {
        if let Some(command) = self.statics.get(path) {
            return Some(command.clone());
        }
        let entries: Vec<&str> = path.split('/').collect();
        let found = self
            .variables
            .iter()
            .find_map(|p| match_variable(&p.segments, &entries).map(|c| (c, p)))
            .or_else(|| {
                self.wildcards
                    .iter()
                    .find_map(|p| match_wildcard(&p.segments, &entries).map(|c| (c, p)))
            });
        let (captures, pattern) = found?;
        metainfo.extend(captures);
        Some(pattern.command.clone())
    }
}
