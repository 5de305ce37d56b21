use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rc_generate::{gen_test, template_cases, test_combine};
use rc_types::{
    ArgBinding, CaseDescriptor, Disposition, Expectation, MatchPolicy, Snippet,
};
use serde::{Deserialize, Serialize};

use crate::IoError;

const CASE_EXTENSIONS: [&str; 4] = ["json", "yaml", "yml", "jsonl"];

/// One authored case. `source` is shorthand for a leading single snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<ArgBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snippets: Vec<Snippet>,
    #[serde(default)]
    pub expectation: Expectation,
    #[serde(default)]
    pub disposition: Disposition,
    #[serde(default)]
    pub policy: MatchPolicy,
}

impl CaseEntry {
    #[must_use]
    pub fn into_case(self, group: &str) -> CaseDescriptor {
        let mut snippets = Vec::with_capacity(self.snippets.len() + 1);
        if let Some(source) = self.source {
            snippets.push(Snippet::with_bindings(source, self.bindings));
        }
        snippets.extend(self.snippets);
        CaseDescriptor {
            id: qualified_id(group, &self.id),
            group: group.to_owned(),
            snippets,
            expectation: self.expectation,
            disposition: self.disposition,
            policy: self.policy,
        }
    }
}

/// A generator row. Exactly one of `template`, `combine` or `product` is set:
///
/// - `template` + `arity` + `values` expands through `gen_test`
/// - `combine` runs the whole combine battery over its values
/// - `product` + `parameters` takes the cartesian product over `%0..%n`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arity: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Vec<String>>,
    #[serde(default)]
    pub disposition: Disposition,
    #[serde(default)]
    pub policy: MatchPolicy,
}

impl GeneratorEntry {
    pub fn expand(&self, group: &str, path: &Path) -> Result<Vec<CaseDescriptor>, IoError> {
        let generated = match (&self.template, &self.combine, &self.product) {
            (Some(template), None, None) => {
                let arity = self.arity.unwrap_or_else(|| rc_generate::placeholder_count(template));
                vec![
                    gen_test(group, template, arity, &self.values).map_err(|source| {
                        IoError::Generate {
                            path: path.to_path_buf(),
                            source,
                        }
                    })?,
                ]
            }
            (None, Some(values), None) => {
                test_combine(group, values).map_err(|source| IoError::Generate {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            (None, None, Some(template)) => template_cases(group, template, &self.parameters),
            _ => {
                return Err(IoError::Table {
                    path: path.to_path_buf(),
                    detail: "generator must set exactly one of template, combine or product"
                        .to_owned(),
                });
            }
        };
        Ok(generated
            .into_iter()
            .map(|case| {
                case.with_disposition(self.disposition.clone())
                    .with_policy(self.policy)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseTable {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub cases: Vec<CaseEntry>,
    #[serde(default)]
    pub generators: Vec<GeneratorEntry>,
}

impl CaseTable {
    /// Expands authored entries and generators into validated cases.
    ///
    /// Generators that produce the same program yield one case: the first
    /// generator to emit it keeps its disposition and policy.
    pub fn into_cases(self, path: &Path) -> Result<Vec<CaseDescriptor>, IoError> {
        let mut out = Vec::with_capacity(self.cases.len());
        let mut generated = HashSet::new();
        for generator in &self.generators {
            for case in generator.expand(&self.group, path)? {
                if generated.insert(case.id.clone()) {
                    out.push(case);
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        path = %path.display(),
                        case_id = %case.id,
                        "duplicate generated program skipped"
                    );
                }
            }
        }
        let group = self.group;
        out.extend(self.cases.into_iter().map(|entry| entry.into_case(&group)));
        validate_all(&out, path)?;
        Ok(out)
    }
}

pub fn parse_case_table(body: &str, path: &Path) -> Result<CaseTable, IoError> {
    let is_yaml = path
        .extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml");
    if is_yaml {
        serde_yaml::from_str(body).map_err(|source| IoError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_json::from_str(body).map_err(|source| IoError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Parses one full `CaseDescriptor` per non-blank line.
pub fn parse_case_stream(body: &str, path: &Path) -> Result<Vec<CaseDescriptor>, IoError> {
    let mut cases = Vec::new();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let case: CaseDescriptor = serde_json::from_str(line).map_err(|source| IoError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        cases.push(case);
    }
    validate_all(&cases, path)?;
    Ok(cases)
}

pub fn load_case_file(path: &Path) -> Result<Vec<CaseDescriptor>, IoError> {
    let body = fs::read_to_string(path)?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("jsonl") => parse_case_stream(&body, path),
        Some("json" | "yaml" | "yml") => parse_case_table(&body, path)?.into_cases(path),
        _ => Err(IoError::UnsupportedExtension(path.to_path_buf())),
    }
}

/// Loads every case file under `root` (or `root` itself when it is a file),
/// failing on the first bad table. Cases come back sorted by id.
pub fn load_case_tables(root: &Path) -> Result<Vec<CaseDescriptor>, IoError> {
    let mut cases = Vec::new();
    let mut seen = HashSet::new();
    for path in list_case_files(root)? {
        let loaded = load_case_file(&path)?;
        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), cases = loaded.len(), "loaded case file");
        for case in loaded {
            if !seen.insert(case.id.clone()) {
                return Err(IoError::DuplicateId { id: case.id, path });
            }
            cases.push(case);
        }
    }
    cases.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(cases)
}

/// Like [`load_case_tables`], but a bad file is reported and skipped while
/// the remaining files still load. Duplicate ids keep their first definition.
pub fn load_case_tables_lenient(
    root: &Path,
) -> Result<(Vec<CaseDescriptor>, Vec<IoError>), IoError> {
    let mut cases = Vec::new();
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for path in list_case_files(root)? {
        match load_case_file(&path) {
            Ok(loaded) => {
                for case in loaded {
                    if seen.insert(case.id.clone()) {
                        cases.push(case);
                    } else {
                        errors.push(IoError::DuplicateId {
                            id: case.id,
                            path: path.clone(),
                        });
                    }
                }
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(path = %path.display(), error = %err, "skipping case file");
                errors.push(err);
            }
        }
    }
    cases.sort_by(|a, b| a.id.cmp(&b.id));
    Ok((cases, errors))
}

pub fn list_case_files(root: &Path) -> Result<Vec<PathBuf>, IoError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| CASE_EXTENSIONS.contains(&ext))
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn qualified_id(group: &str, id: &str) -> String {
    if group.is_empty() || id.starts_with(&format!("{group}/")) {
        id.to_owned()
    } else {
        format!("{group}/{id}")
    }
}

fn validate_all(cases: &[CaseDescriptor], path: &Path) -> Result<(), IoError> {
    for case in cases {
        case.validate().map_err(|source| IoError::Case {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}
