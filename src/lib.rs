//! Airspeed: a Rust implementation of the Velocity Template Language (VTL)
//! compiler and evaluator.
//!
//! ```
//! use airspeed::{Namespace, Options, Template, Value};
//!
//! let template = Template::compile("Hello, $name!", None).unwrap();
//! let mut root = std::collections::HashMap::new();
//! root.insert("name".to_string(), Value::str("World"));
//! let ns = Namespace::new(Value::map(
//!     root.into_iter().map(|(k, v)| (airspeed::ValueKey::Str(k.into()), v)).collect(),
//! ));
//! let mut out = String::new();
//! template.render(ns, &mut out, None, &Options::default()).unwrap();
//! assert_eq!(out, "Hello, World!");
//! ```

pub mod ast;
pub mod cache;
pub mod config;
pub mod error;
pub mod eval;
pub mod loader;
pub mod namespace;
pub mod parser;
pub mod value;

pub use ast::Template as RawTemplate;
pub use cache::Cache;
pub use config::Options;
pub use error::{Error, Position, Result};
pub use eval::Sink;
pub use loader::{FileLoader, Loader, NullLoader, StringLoader};
pub use namespace::Namespace;
pub use value::{HostObject, Value, ValueKey};

use std::sync::Arc;

/// A parsed, immutable template. `Send + Sync`: the same `Template` can be
/// rendered concurrently from many threads, each with its own [`Namespace`].
#[derive(Debug, Clone)]
pub struct Template {
    inner: Arc<ast::Template>,
}

impl Template {
    /// Parses `source` into a `Template`. `name` is used only for
    /// diagnostics (syntax errors, `#parse`/`#include` error context).
    pub fn compile(source: &str, name: Option<&str>) -> Result<Template> {
        let name = name.map(Arc::from);
        let raw = parser::parse(source, name)?;
        Ok(Template { inner: Arc::new(raw) })
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Renders this template to `sink`, consuming `ns` as the live
    /// namespace for the render. `cache` resolves `#include`/`#parse`/
    /// `#evaluate` targets; pass `None` if the template uses none of those.
    pub fn render(&self, mut ns: Namespace, sink: &mut dyn Sink, cache: Option<&Cache>, options: &Options) -> Result<()> {
        eval::render(&self.inner, &mut ns, sink, cache, options)
    }

    /// Convenience for the common case: render against a root value and
    /// return the output as a `String`.
    pub fn render_to_string(&self, root: Value, cache: Option<&Cache>, options: &Options) -> Result<String> {
        let ns = Namespace::new(root);
        let mut out = String::new();
        self.render(ns, &mut out, cache, options)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn root_map(pairs: Vec<(&str, Value)>) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert(ValueKey::Str(k.into()), v);
        }
        Value::map(m)
    }

    #[test]
    fn renders_plain_text_unchanged() {
        let t = Template::compile("just some text, no directives here", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "just some text, no directives here");
    }

    #[test]
    fn interpolates_a_reference() {
        let t = Template::compile("Hello, $name!", None).unwrap();
        let root = root_map(vec![("name", Value::str("World"))]);
        let out = t.render_to_string(root, None, &Options::default()).unwrap();
        assert_eq!(out, "Hello, World!");
    }

    #[test]
    fn undefined_non_strict_reference_echoes_literally() {
        let t = Template::compile("Hello, $stranger!", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "Hello, $stranger!");
    }

    #[test]
    fn undefined_strict_reference_is_an_error() {
        let t = Template::compile("Hello, $stranger!", None).unwrap();
        let opts = Options { strict_references: true, ..Options::default() };
        let err = t.render_to_string(Value::Null, None, &opts).unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }

    #[test]
    fn quiet_reference_absorbs_undefined() {
        let t = Template::compile("Hello, $!stranger!", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "Hello, !");
    }

    #[test]
    fn foreach_binds_loop_metadata() {
        let t = Template::compile("#foreach($i in [1..3])$i:$velocityCount:$foreach.hasNext;#end", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "1:1:true;2:2:true;3:3:false;");
    }

    #[test]
    fn if_elseif_else_picks_one_branch() {
        let t = Template::compile("#if($x == 1)one#elseif($x == 2)two#else?#end", None).unwrap();
        let root = root_map(vec![("x", Value::Int(2))]);
        let out = t.render_to_string(root, None, &Options::default()).unwrap();
        assert_eq!(out, "two");
    }

    #[test]
    fn set_creates_a_local_binding() {
        let t = Template::compile("#set($x = 1 + 2)$x", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "3");
    }

    #[test]
    fn macro_call_binds_parameters_in_a_fresh_frame() {
        let t = Template::compile("#macro(greet $who)Hi, $who#end#greet(\"Ada\")", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "Hi, Ada");
    }

    #[test]
    fn macro_does_not_see_caller_locals() {
        let t = Template::compile("#macro(m)<$i>#end#foreach($i in [1,2])#m()#end", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "<$i><$i>");
    }

    #[test]
    fn stop_halts_rendering() {
        let t = Template::compile("before#{stop}after", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "before");
    }

    #[test]
    fn arithmetic_integer_division_truncates() {
        let t = Template::compile("#set($r = 7 / 2)$r", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "3");
    }

    #[test]
    fn define_expands_lazily_against_live_namespace() {
        let t = Template::compile("#set($x = 1)#define($greeting)x is $x#end#set($x = 2)$greeting", None).unwrap();
        let out = t.render_to_string(Value::Null, None, &Options::default()).unwrap();
        assert_eq!(out, "x is 2");
    }
}
