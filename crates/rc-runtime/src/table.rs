use std::collections::HashMap;
use std::sync::Arc;

use rc_types::Output;

use crate::{Runtime, RuntimeError, Session};

/// Replays recorded outputs keyed by rendered snippet text.
#[derive(Debug, Clone, Default)]
pub struct TableRuntime {
    name: String,
    outputs: Arc<HashMap<String, Output>>,
}

impl TableRuntime {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: Arc::default(),
        }
    }

    #[must_use]
    pub fn from_pairs<I, S>(name: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Output)>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            outputs: Arc::new(
                pairs
                    .into_iter()
                    .map(|(snippet, output)| (snippet.into(), output))
                    .collect(),
            ),
        }
    }

    #[must_use]
    pub fn with_output(mut self, snippet: impl Into<String>, output: Output) -> Self {
        Arc::make_mut(&mut self.outputs).insert(snippet.into(), output);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

struct TableSession {
    outputs: Arc<HashMap<String, Output>>,
}

impl Session for TableSession {
    fn run_snippet(&mut self, source: &str) -> Result<Output, RuntimeError> {
        self.outputs
            .get(source)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownSnippet(source.to_owned()))
    }
}

impl Runtime for TableRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_session(&self) -> Result<Box<dyn Session>, RuntimeError> {
        Ok(Box::new(TableSession {
            outputs: Arc::clone(&self.outputs),
        }))
    }
}

#[cfg(test)]
mod tests {
    use rc_types::Output;

    use super::TableRuntime;
    use crate::{Runtime, RuntimeError};

    #[test]
    fn replays_recorded_output_and_rejects_unknown() {
        let runtime = TableRuntime::new("fixture").with_output("1+1", Output::text("[1] 2\n"));
        let mut session = runtime.open_session().expect("session");
        assert_eq!(session.run_snippet("1+1").expect("known").text, "[1] 2\n");
        assert!(matches!(
            session.run_snippet("2+2"),
            Err(RuntimeError::UnknownSnippet(snippet)) if snippet == "2+2"
        ));
    }

    #[test]
    fn from_pairs_builds_the_table() {
        let runtime = TableRuntime::from_pairs(
            "pairs",
            [("a", Output::text("1")), ("b", Output::text("2"))],
        );
        assert_eq!(runtime.len(), 2);
        assert!(!runtime.is_empty());
    }
}
