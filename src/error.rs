//! Error taxonomy for the template compiler and evaluator.
//!
//! Four kinds are distinguished, matching the points of failure in the data
//! flow (source text -> Parser -> AST -> Evaluator -> rendered text):
//! [`Error::Syntax`] (parse time), [`Error::Execution`] (render time),
//! [`Error::NotFound`] (a Loader could not resolve an `#include`/`#parse`
//! target) and [`Error::Host`] (an exception surfaced by a host method call).
//!
//! Syntax errors carry enough position information to render a source
//! snippet with `annotate-snippets`, in the same spirit as a compiler
//! diagnostic.

use std::fmt;
use std::sync::Arc;

use annotate_snippets::display_list::{DisplayList, FormatOptions};
use annotate_snippets::snippet::{Annotation, AnnotationType, Slice, Snippet, SourceAnnotation};

/// A 1-based line/column pair into a template's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Position { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Top level error type returned by every fallible operation in the crate.
#[derive(Debug, Clone)]
pub enum Error {
    /// Parse-time failure. Carries the offending template's name, position,
    /// and a human-readable expectation message.
    Syntax {
        name: Option<Arc<str>>,
        pos: Position,
        message: String,
        /// Full source text, kept only so a caller can ask for a pretty
        /// annotated snippet; not consulted for equality or matching.
        source: Arc<str>,
    },
    /// Render-time evaluation failure: unresolved method, arity mismatch,
    /// type mismatch in arithmetic/comparison, illegal assignment target,
    /// division by zero. `#stop` is explicitly not an error.
    Execution {
        name: Option<Arc<str>>,
        pos: Position,
        message: String,
    },
    /// A Loader could not resolve a name referenced by `#include`, `#parse`
    /// or `#evaluate`.
    NotFound { name: String },
    /// An exception surfaced by a host method call, wrapped with path/line
    /// context and re-raised.
    Host {
        name: Option<Arc<str>>,
        pos: Position,
        message: String,
    },
}

impl Error {
    pub fn syntax(name: Option<Arc<str>>, pos: Position, source: Arc<str>, message: impl Into<String>) -> Self {
        Error::Syntax { name, pos, message: message.into(), source }
    }

    pub fn execution(name: Option<Arc<str>>, pos: Position, message: impl Into<String>) -> Self {
        Error::Execution { name, pos, message: message.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Error::NotFound { name: name.into() }
    }

    pub fn host(name: Option<Arc<str>>, pos: Position, message: impl Into<String>) -> Self {
        Error::Host { name, pos, message: message.into() }
    }

    /// Renders a multi-line, source-annotated version of the error, for
    /// kinds that carry source text (currently only [`Error::Syntax`]).
    /// Falls back to [`fmt::Display`] for the other kinds.
    pub fn pretty(&self) -> String {
        match self {
            Error::Syntax { name, pos, message, source } => {
                let origin = name.as_deref().unwrap_or("<template>");
                let line_start = line_start_offset(source, pos.line);
                let line_text = source[line_start..]
                    .lines()
                    .next()
                    .unwrap_or("");
                let snippet = Snippet {
                    title: Some(Annotation {
                        label: Some(message.as_str()),
                        id: None,
                        annotation_type: AnnotationType::Error,
                    }),
                    footer: vec![],
                    slices: vec![Slice {
                        source: line_text,
                        line_start: pos.line as usize,
                        origin: Some(origin),
                        fold: false,
                        annotations: vec![SourceAnnotation {
                            label: "here",
                            annotation_type: AnnotationType::Error,
                            range: (
                                (pos.column.saturating_sub(1)) as usize,
                                (pos.column as usize).max(1),
                            ),
                        }],
                    }],
                    opt: FormatOptions { color: false, ..Default::default() },
                };
                DisplayList::from(snippet).to_string()
            }
            other => other.to_string(),
        }
    }
}

fn line_start_offset(source: &str, line: u32) -> usize {
    if line <= 1 {
        return 0;
    }
    let mut seen = 1u32;
    for (idx, ch) in source.char_indices() {
        if ch == '\n' {
            seen += 1;
            if seen == line {
                return idx + 1;
            }
        }
    }
    source.len()
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syntax { name, pos, message, .. } => write!(
                f,
                "template syntax error in {}: {} at {}",
                name.as_deref().unwrap_or("<template>"),
                message,
                pos
            ),
            Error::Execution { name, pos, message } => write!(
                f,
                "template execution error in {}: {} at {}",
                name.as_deref().unwrap_or("<template>"),
                message,
                pos
            ),
            Error::NotFound { name } => write!(f, "template not found: {}", name),
            Error::Host { name, pos, message } => write!(
                f,
                "host error in {}: {} at {}",
                name.as_deref().unwrap_or("<template>"),
                message,
                pos
            ),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
