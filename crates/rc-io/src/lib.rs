#![forbid(unsafe_code)]

use std::path::PathBuf;

use rc_generate::GenerateError;
use rc_types::CaseError;
use thiserror::Error;

pub mod cases;
pub mod expected;

pub use cases::{
    CaseEntry, CaseTable, GeneratorEntry, list_case_files, load_case_file, load_case_tables,
    load_case_tables_lenient, parse_case_table, parse_case_stream,
};
pub use expected::{
    ExpectedEntry, ExpectedOutputFile, NEWLINE_ESCAPE, case_traits, render_diff, write_diff,
    write_if_changed,
};

#[derive(Debug, Error)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{}: {source}", path.display())]
    Generate {
        path: PathBuf,
        #[source]
        source: GenerateError,
    },
    #[error("{}: {source}", path.display())]
    Case {
        path: PathBuf,
        #[source]
        source: CaseError,
    },
    #[error("{}: invalid case table: {detail}", path.display())]
    Table { path: PathBuf, detail: String },
    #[error("duplicate case id {id} in {}", path.display())]
    DuplicateId { id: String, path: PathBuf },
    #[error("unsupported case file extension: {}", .0.display())]
    UnsupportedExtension(PathBuf),
    #[error("expected-output file line {line}: {detail}")]
    Format { line: usize, detail: String },
}
