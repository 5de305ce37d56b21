//! The stored expected-output file.
//!
//! Entries are grouped by authoring group and keyed by program text:
//!
//! ```text
//! ##builtins.c#Output.IgnoreWhitespace#
//! #argv <- list(1L);c(argv)<<<NEWLINE>>>c(2L)
//! [1] 1
//! [1] 2
//! ```
//!
//! The header names the group followed by `#`-terminated traits, the second
//! line is the program with newlines escaped, and every following line up to
//! the next header is the reference transcript.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rc_types::{CaseDescriptor, Expectation, IgnoreCategory, WhitespacePolicy};

use crate::IoError;

pub const NEWLINE_ESCAPE: &str = "<<<NEWLINE>>>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedEntry {
    pub group: String,
    pub traits: Vec<String>,
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedOutputFile {
    groups: BTreeMap<String, BTreeMap<String, ExpectedEntry>>,
}

impl ExpectedOutputFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self, IoError> {
        let mut file = Self::new();
        let mut lines = text.lines().enumerate().peekable();

        while let Some((idx, header)) = lines.next() {
            let Some(header) = header.strip_prefix("##") else {
                return Err(IoError::Format {
                    line: idx + 1,
                    detail: "expected line to start with ##".to_owned(),
                });
            };
            let mut parts = header.split('#');
            let group = parts.next().unwrap_or_default().to_owned();
            let traits = parts
                .filter(|part| !part.is_empty())
                .map(str::to_owned)
                .collect();

            let input = match lines.next() {
                Some((_, line)) if line.starts_with('#') => unescape_input(&line[1..]),
                Some((input_idx, _)) => {
                    return Err(IoError::Format {
                        line: input_idx + 1,
                        detail: "expected input line to start with #".to_owned(),
                    });
                }
                None => {
                    return Err(IoError::Format {
                        line: idx + 2,
                        detail: format!("entry for group {group} has no input line"),
                    });
                }
            };

            let mut output_lines = Vec::new();
            while let Some((_, line)) = lines.next_if(|(_, line)| !line.starts_with("##")) {
                output_lines.push(line);
            }

            file.insert(ExpectedEntry {
                group,
                traits,
                input,
                output: output_lines.join("\n"),
            });
        }
        Ok(file)
    }

    /// Reads `path`, treating a missing file as empty.
    pub fn load(path: &Path) -> Result<Self, IoError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            out.push_str("##");
            out.push_str(&entry.group);
            out.push('#');
            for trait_name in &entry.traits {
                out.push_str(trait_name);
                out.push('#');
            }
            out.push('\n');
            out.push('#');
            out.push_str(&escape_input(&entry.input));
            out.push('\n');
            out.push_str(&entry.output);
            out.push('\n');
        }
        out
    }

    #[must_use]
    pub fn lookup(&self, group: &str, input: &str) -> Option<&ExpectedEntry> {
        self.groups.get(group).and_then(|entries| entries.get(input))
    }

    /// First entry for `input` in any group, in group order.
    #[must_use]
    pub fn find_input(&self, input: &str) -> Option<&ExpectedEntry> {
        self.groups.values().find_map(|entries| entries.get(input))
    }

    /// Inserts or replaces the entry for `(group, input)`.
    pub fn insert(&mut self, entry: ExpectedEntry) -> Option<ExpectedEntry> {
        self.groups
            .entry(entry.group.clone())
            .or_default()
            .insert(entry.input.clone(), entry)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ExpectedEntry> {
        self.groups.values().flat_map(BTreeMap::values)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait labels recorded in an entry header. They describe the case for a
/// human reader; lookups never depend on them.
#[must_use]
pub fn case_traits(case: &CaseDescriptor) -> Vec<String> {
    let mut traits = Vec::new();
    if case.disposition.is_ignored() {
        let category = case.disposition.category.unwrap_or(IgnoreCategory::Unknown);
        traits.push(format!("Ignored.{}", pascal_case(category.as_str())));
    }
    match case.policy.whitespace {
        WhitespacePolicy::Strict => {}
        WhitespacePolicy::TrimTrailing => traits.push("Output.TrimTrailing".to_owned()),
        WhitespacePolicy::IgnoreWhitespace => traits.push("Output.IgnoreWhitespace".to_owned()),
    }
    if case.policy.ignore_error_context {
        traits.push("Output.IgnoreErrorContext".to_owned());
    }
    if case.policy.ignore_warning_context {
        traits.push("Output.IgnoreWarningContext".to_owned());
    }
    match case.expectation {
        Expectation::ContainsError => traits.push("Output.ContainsError".to_owned()),
        Expectation::ContainsWarning => traits.push("Output.ContainsWarning".to_owned()),
        _ => {}
    }
    traits
}

/// Writes `content` to `path` when it differs from what is there. Returns
/// whether the content changed; with `check_only` nothing is written.
pub fn write_if_changed(path: &Path, content: &str, check_only: bool) -> Result<bool, IoError> {
    let previous = if path.exists() {
        Some(fs::read_to_string(path)?)
    } else {
        None
    };
    if previous.as_deref() == Some(content) {
        return Ok(false);
    }
    if !check_only {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(true)
}

/// Lists every entry of `expected` whose output differs in `candidate`, or
/// `None` when the two agree. Entries absent from `candidate` show `MISSING`.
#[must_use]
pub fn render_diff(
    expected: &ExpectedOutputFile,
    candidate: &ExpectedOutputFile,
    expected_name: &str,
    candidate_name: &str,
) -> Option<String> {
    let mut out = String::new();
    for entry in expected.entries() {
        let other = candidate.lookup(&entry.group, &entry.input);
        if other.is_some_and(|other| other.output == entry.output) {
            continue;
        }
        out.push_str(&format!(
            "##{}\n#{}\n#{expected_name}\n{}\n#{candidate_name}\n{}\n",
            entry.group,
            escape_input(&entry.input),
            entry.output,
            other.map_or("MISSING", |other| other.output.as_str()),
        ));
    }
    if out.is_empty() { None } else { Some(out) }
}

/// Writes the diff file when the two differ. Returns `true` when they match.
pub fn write_diff(
    path: &Path,
    expected: &ExpectedOutputFile,
    candidate: &ExpectedOutputFile,
    expected_name: &str,
    candidate_name: &str,
) -> Result<bool, IoError> {
    match render_diff(expected, candidate, expected_name, candidate_name) {
        Some(diff) => {
            write_if_changed(path, &diff, false)?;
            Ok(false)
        }
        None => Ok(true),
    }
}

fn escape_input(input: &str) -> String {
    input.replace('\n', NEWLINE_ESCAPE)
}

fn unescape_input(input: &str) -> String {
    input.replace(NEWLINE_ESCAPE, "\n")
}

fn pascal_case(snake: &str) -> String {
    snake
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
