#![forbid(unsafe_code)]

use std::collections::HashSet;

use rc_types::{CaseDescriptor, Expectation, Snippet, hash_hex};
use thiserror::Error;

/// Structural shapes exercised by [`test_combine`], as `(template, arity)`.
pub const COMBINE_BATTERY: [(&str, usize); 12] = [
    ("{ c(%s) }", 1),
    ("{ c(%s, %s) }", 2),
    ("{ c(c(%s,%s), %s) }", 3),
    ("{ c(%s, c(%s,%s)) }", 3),
    ("{ c(NULL, c(%s,%s)) }", 2),
    ("{ c(c(%s,%s), NULL) }", 2),
    ("{ c(NULL, %s, NULL) }", 1),
    ("{ c(NULL, %s) }", 1),
    ("{ c(%s, NULL) }", 1),
    ("{ c(c(%s,%s), c(%s,%s)) }", 4),
    ("{ c(c(%s,%s), %s, c(%s,%s)) }", 5),
    ("{ c(c(%s,%s), c(%s,%s), c(%s,%s)) }", 6),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("invalid generator input: {0}")]
    InvalidInput(String),
}

/// Returns exactly `size` values, cycling through `values` when it is shorter.
pub fn repeat<S: AsRef<str>>(size: usize, values: &[S]) -> Result<Vec<String>, GenerateError> {
    if size == 0 {
        return Ok(Vec::new());
    }
    if values.is_empty() {
        return Err(GenerateError::InvalidInput(format!(
            "cannot fill {size} slots from an empty value list"
        )));
    }
    Ok((0..size)
        .map(|idx| values[idx % values.len()].as_ref().to_owned())
        .collect())
}

#[must_use]
pub fn placeholder_count(template: &str) -> usize {
    let mut count = 0;
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            continue;
        }
        match chars.peek() {
            Some('s') => {
                count += 1;
                chars.next();
            }
            Some('%') => {
                chars.next();
            }
            _ => {}
        }
    }
    count
}

/// Substitutes `%s` placeholders left to right. `%%` yields a literal `%`;
/// any other `%` is copied through unchanged.
pub fn format_template<S: AsRef<str>>(template: &str, values: &[S]) -> Result<String, GenerateError> {
    let expected = placeholder_count(template);
    if expected != values.len() {
        return Err(GenerateError::InvalidInput(format!(
            "template {template:?} has {expected} placeholders but {} values were supplied",
            values.len()
        )));
    }

    let mut out = String::with_capacity(template.len());
    let mut next_value = values.iter();
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('s') => {
                chars.next();
                if let Some(value) = next_value.next() {
                    out.push_str(value.as_ref());
                }
            }
            Some('%') => {
                chars.next();
                out.push('%');
            }
            _ => out.push('%'),
        }
    }
    Ok(out)
}

/// Builds one reference-compared case from `template` filled with `arity`
/// cycled values.
pub fn gen_test<S: AsRef<str>>(
    group: &str,
    template: &str,
    arity: usize,
    values: &[S],
) -> Result<CaseDescriptor, GenerateError> {
    if values.is_empty() {
        return Err(GenerateError::InvalidInput(format!(
            "no substitution values supplied for template {template:?}"
        )));
    }
    let filled = repeat(arity, values)?;
    let source = format_template(template, &filled)?;
    Ok(reference_case(group, source))
}

/// Runs every shape of [`COMBINE_BATTERY`] over the same value list.
pub fn test_combine<S: AsRef<str>>(
    group: &str,
    values: &[S],
) -> Result<Vec<CaseDescriptor>, GenerateError> {
    COMBINE_BATTERY
        .iter()
        .map(|(template, arity)| gen_test(group, template, *arity, values))
        .collect()
}

/// Cartesian expansion of `%0`, `%1`, ... placeholders. The first parameter
/// list varies fastest.
#[must_use]
pub fn template_product<S: AsRef<str>>(template: &str, parameters: &[Vec<S>]) -> Vec<String> {
    let total = parameters.iter().map(Vec::len).product::<usize>();
    let mut out = Vec::with_capacity(total);
    let mut positions = vec![0usize; parameters.len()];

    for _ in 0..total {
        let mut current = template.to_owned();
        for (idx, param) in parameters.iter().enumerate().rev() {
            current = current.replace(&format!("%{idx}"), param[positions[idx]].as_ref());
        }
        out.push(current);

        for (idx, param) in parameters.iter().enumerate() {
            positions[idx] += 1;
            if positions[idx] == param.len() {
                positions[idx] = 0;
            } else {
                break;
            }
        }
    }
    out
}

/// Concatenates expression lists, dropping repeats and keeping first-seen order.
#[must_use]
pub fn join_unique(lists: &[Vec<String>]) -> Vec<String> {
    let mut seen = HashSet::new();
    lists
        .iter()
        .flatten()
        .filter(|expr| seen.insert(expr.as_str()))
        .cloned()
        .collect()
}

#[must_use]
pub fn template_cases<S: AsRef<str>>(
    group: &str,
    template: &str,
    parameters: &[Vec<S>],
) -> Vec<CaseDescriptor> {
    template_product(template, parameters)
        .into_iter()
        .map(|source| reference_case(group, source))
        .collect()
}

fn reference_case(group: &str, source: String) -> CaseDescriptor {
    let digest = hash_hex(source.as_bytes());
    let id = if group.is_empty() {
        digest[..16].to_owned()
    } else {
        format!("{group}/{}", &digest[..16])
    };
    CaseDescriptor::new(id, Snippet::new(source), Expectation::ReferenceEquivalence).in_group(group)
}
