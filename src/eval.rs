//! The Evaluator: walks a [`Template`]'s AST and renders it to a [`Sink`].
//!
//! This is a tree-walking interpreter, not a bytecode VM -- directives
//! dispatch directly on the `Node` they hold, and every reference chain
//! goes through the Value Protocol in `crate::value` rather than any
//! special-cased type switch here. `#stop` is modeled as a [`Flow`] signal
//! threaded back up through every `exec_*` call rather than an error, per
//! the error taxonomy's explicit carve-out.

use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use tinyvec::TinyVec;

use crate::ast::{BinOp, Branch, Expr, InterpPart, Node, Path, Scalar, Template, UnOp};
use crate::cache::Cache;
use crate::config::Options;
use crate::error::{Error, Position, Result};
use crate::namespace::{LoopRecord, Namespace};
use crate::value::{self, ArithError, Invoke, Lookup, SetOutcome, Value, ValueKey};

/// Where rendered output goes. Blanket-implemented for any [`io::Write`]
/// (files, sockets, `Vec<u8>`) and implemented directly for `String`, which
/// is not an `io::Write` itself.
pub trait Sink {
    fn emit(&mut self, s: &str) -> Result<()>;
}

impl Sink for String {
    fn emit(&mut self, s: &str) -> Result<()> {
        self.push_str(s);
        Ok(())
    }
}

impl<W: io::Write> Sink for W {
    fn emit(&mut self, s: &str) -> Result<()> {
        self.write_all(s.as_bytes()).map_err(|e| Error::execution(None, Position::default(), e.to_string()))
    }
}

/// Control-flow result of executing a node sequence: either it ran to
/// completion, or a `#stop` unwound it. `Stop` is caught at a `#parse`
/// boundary (and at the top-level `render` call); it never reaches a caller
/// as an `Error`.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Stop,
}

pub struct Evaluator<'a> {
    cache: Option<&'a Cache>,
    options: &'a Options,
}

/// Renders `template` into `sink` using `ns` as the live namespace. `cache`
/// resolves `#include`/`#parse`/`#evaluate` targets; `None` means those
/// directives fail with "no loader configured".
pub fn render(
    template: &Template,
    ns: &mut Namespace,
    sink: &mut dyn Sink,
    cache: Option<&Cache>,
    options: &Options,
) -> Result<()> {
    let mut ev = Evaluator { cache, options };
    ev.exec_nodes(&template.body, ns, sink, template)?;
    Ok(())
}

impl<'a> Evaluator<'a> {
    fn exec_nodes(&mut self, nodes: &[Node], ns: &mut Namespace, out: &mut dyn Sink, tpl: &Template) -> Result<Flow> {
        for node in nodes {
            if self.exec_node(node, ns, out, tpl)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_node(&mut self, node: &Node, ns: &mut Namespace, out: &mut dyn Sink, tpl: &Template) -> Result<Flow> {
        match node {
            Node::Text(text) => {
                out.emit(text)?;
                Ok(Flow::Normal)
            }
            Node::Block(nodes) => self.exec_nodes(nodes, ns, out, tpl),
            Node::Reference { path, quiet, silent, pos } => {
                let absorb = *quiet || *silent;
                match self.lookup_path(path, *pos, ns, tpl)? {
                    Some(v) => {
                        let v = self.expand_defined(v, ns, tpl)?;
                        out.emit(&v.to_string())?;
                    }
                    None if absorb => {}
                    None if self.options.strict_references => {
                        return Err(Error::execution(
                            tpl.name.clone(),
                            *pos,
                            format!("undefined reference {}", path_to_source(path, *quiet)),
                        ));
                    }
                    None => out.emit(&path_to_source(path, *quiet))?,
                }
                Ok(Flow::Normal)
            }
            Node::If { branches, else_body } => self.exec_if(branches, else_body, ns, out, tpl),
            Node::Foreach { var, iterable, body, pos } => self.exec_foreach(var, iterable, body, *pos, ns, out, tpl),
            Node::Set { path, value, pos } => {
                let v = self.eval_expr(value, ns, tpl)?;
                self.assign(path, v, *pos, ns, tpl)?;
                Ok(Flow::Normal)
            }
            Node::MacroDef { name, params, body, pos } => {
                ns.define_macro(crate::namespace::MacroDef {
                    name: name.to_string(),
                    params: params.iter().map(|p| p.name.clone()).collect(),
                    body: body.clone(),
                    pos: *pos,
                });
                Ok(Flow::Normal)
            }
            Node::MacroCall { name, args, pos } => self.exec_macro_call(name, args, *pos, ns, out, tpl),
            Node::Include { exprs, pos } => self.exec_include(exprs, *pos, ns, out, tpl),
            Node::Parse { expr, pos } => self.exec_parse(expr, *pos, ns, out, tpl),
            Node::Define { name, body } => {
                ns.define_local(name.clone(), Value::Defined(Rc::new(body.clone())));
                Ok(Flow::Normal)
            }
            Node::Evaluate { expr, pos } => self.exec_evaluate(expr, *pos, ns, out, tpl),
            Node::Noescape { body } => self.exec_nodes(body, ns, out, tpl),
            Node::Stop => Ok(Flow::Stop),
        }
    }

    fn exec_if(
        &mut self,
        branches: &[Branch],
        else_body: &Option<Vec<Node>>,
        ns: &mut Namespace,
        out: &mut dyn Sink,
        tpl: &Template,
    ) -> Result<Flow> {
        for branch in branches {
            if self.eval_expr(&branch.cond, ns, tpl)?.truthy() {
                return self.exec_nodes(&branch.body, ns, out, tpl);
            }
        }
        match else_body {
            Some(body) => self.exec_nodes(body, ns, out, tpl),
            None => Ok(Flow::Normal),
        }
    }

    fn exec_foreach(
        &mut self,
        var: &Arc<str>,
        iterable: &Expr,
        body: &[Node],
        pos: Position,
        ns: &mut Namespace,
        out: &mut dyn Sink,
        tpl: &Template,
    ) -> Result<Flow> {
        let iterable_value = self.eval_expr(iterable, ns, tpl)?;
        let items = value::iter(&iterable_value)
            .ok_or_else(|| Error::execution(tpl.name.clone(), pos, format!("cannot iterate over a {}", iterable_value.kind_name())))?;

        ns.push_frame();
        let len = items.len();
        let mut flow = Flow::Normal;
        for (idx, item) in items.into_iter().enumerate() {
            let parent = ns.current_loop();
            let record = LoopRecord {
                count: idx as i64 + 1,
                index: idx as i64,
                has_next: idx + 1 < len,
                first: idx == 0,
                last: idx + 1 == len,
                parent,
            };
            let handle = ns.push_loop(record);
            ns.define_local(var.clone(), item);
            ns.define_local(Arc::from("velocityCount"), Value::Int(idx as i64 + 1));
            ns.define_local(Arc::from("foreach"), Value::Host(handle));
            flow = self.exec_nodes(body, ns, out, tpl)?;
            ns.pop_loop();
            if flow == Flow::Stop {
                break;
            }
        }
        ns.pop_frame();
        Ok(flow)
    }

    fn exec_macro_call(
        &mut self,
        name: &str,
        args: &[Expr],
        pos: Position,
        ns: &mut Namespace,
        out: &mut dyn Sink,
        tpl: &Template,
    ) -> Result<Flow> {
        let macro_def = ns
            .lookup_macro(name)
            .ok_or_else(|| Error::execution(tpl.name.clone(), pos, format!("unknown macro #{name}")))?;
        if args.len() != macro_def.params.len() {
            return Err(Error::execution(
                tpl.name.clone(),
                pos,
                format!("macro #{name} expects {} argument(s), got {}", macro_def.params.len(), args.len()),
            ));
        }
        let mut argv: TinyVec<[Value; 4]> = TinyVec::with_capacity(args.len());
        for a in args {
            argv.push(self.eval_expr(a, ns, tpl)?);
        }
        ns.push_frame_barrier();
        for (param, value) in macro_def.params.iter().zip(argv) {
            ns.define_local(param.clone(), value);
        }
        let flow = self.exec_nodes(&macro_def.body, ns, out, tpl);
        ns.pop_frame();
        flow
    }

    fn exec_include(&mut self, exprs: &[Expr], pos: Position, ns: &mut Namespace, out: &mut dyn Sink, tpl: &Template) -> Result<Flow> {
        let cache = self
            .cache
            .ok_or_else(|| Error::execution(tpl.name.clone(), pos, "#include requires a configured loader"))?;
        for expr in exprs {
            let v = self.eval_expr(expr, ns, tpl)?;
            let name = expect_string(&v, "#include", pos, tpl)?;
            let text = cache.load_text(&name)?;
            out.emit(&text)?;
        }
        Ok(Flow::Normal)
    }

    fn exec_parse(&mut self, expr: &Expr, pos: Position, ns: &mut Namespace, out: &mut dyn Sink, tpl: &Template) -> Result<Flow> {
        let cache = self
            .cache
            .ok_or_else(|| Error::execution(tpl.name.clone(), pos, "#parse requires a configured loader"))?;
        let v = self.eval_expr(expr, ns, tpl)?;
        let name = expect_string(&v, "#parse", pos, tpl)?;
        let nested = cache.get_template(&name)?;
        // `#parse` shares the live namespace (its locals are visible to and
        // mutable by the nested template); `#stop` inside it unwinds only to
        // this boundary, not the whole render.
        self.exec_nodes(&nested.body, ns, out, &nested)?;
        Ok(Flow::Normal)
    }

    fn exec_evaluate(&mut self, expr: &Expr, pos: Position, ns: &mut Namespace, out: &mut dyn Sink, tpl: &Template) -> Result<Flow> {
        let v = self.eval_expr(expr, ns, tpl)?;
        let source = v.to_string();
        let parsed = crate::parser::parse(&source, tpl.name.clone())?;
        self.exec_nodes(&parsed.body, ns, out, &parsed)?;
        Ok(Flow::Normal)
    }

    /// Expands a `Value::Defined` binding (installed by `#define`) by
    /// re-rendering its body against the live namespace, guarding against a
    /// definition that transitively references itself.
    fn expand_defined(&mut self, v: Value, ns: &mut Namespace, tpl: &Template) -> Result<Value> {
        let body = match &v {
            Value::Defined(body) => body.clone(),
            _ => return Ok(v),
        };
        let key = Rc::as_ptr(&body) as usize;
        if !ns.enter_define(key) {
            return Err(Error::execution(tpl.name.clone(), Position::default(), "cyclic #define expansion"));
        }
        let mut buf = String::new();
        let result = self.exec_nodes(&body, ns, &mut buf, tpl);
        ns.exit_define(key);
        result?;
        Ok(Value::str(buf))
    }

    fn assign(&mut self, path: &Path, value: Value, pos: Position, ns: &mut Namespace, tpl: &Template) -> Result<()> {
        match path {
            Path::Root(name) => {
                ns.set(name.clone(), value);
                Ok(())
            }
            Path::Property(parent, member) => {
                let base = self
                    .lookup_path(parent, pos, ns, tpl)?
                    .ok_or_else(|| Error::execution(tpl.name.clone(), pos, "cannot set a property on an undefined reference"))?;
                match value::set_property(&base, member, value) {
                    SetOutcome::Ok => Ok(()),
                    SetOutcome::Unsupported => Err(Error::execution(
                        tpl.name.clone(),
                        pos,
                        format!("cannot set property '{member}' on a {}", base.kind_name()),
                    )),
                }
            }
            Path::Index(parent, idx_expr) => {
                let base = self
                    .lookup_path(parent, pos, ns, tpl)?
                    .ok_or_else(|| Error::execution(tpl.name.clone(), pos, "cannot index into an undefined reference"))?;
                let key = self.eval_expr(idx_expr, ns, tpl)?;
                match value::set_index(&base, &key, value) {
                    SetOutcome::Ok => Ok(()),
                    SetOutcome::Unsupported => {
                        Err(Error::execution(tpl.name.clone(), pos, format!("cannot index-assign into a {}", base.kind_name())))
                    }
                }
            }
            Path::Call(..) => Err(Error::execution(tpl.name.clone(), pos, "cannot assign to a method call")),
        }
    }

    /// Resolves a reference chain against the namespace and the Value
    /// Protocol. `None` means "missing" at some step (not an error unless a
    /// host raised); callers decide what missing means in their context.
    fn lookup_path(&mut self, path: &Path, pos: Position, ns: &Namespace, tpl: &Template) -> Result<Option<Value>> {
        match path {
            Path::Root(name) => Ok(ns.get(name)),
            Path::Property(parent, member) => match self.lookup_path(parent, pos, ns, tpl)? {
                None => Ok(None),
                Some(base) => match value::get_property(&base, member) {
                    Lookup::Found(v) => Ok(Some(v)),
                    Lookup::Missing => self.bean_accessor_fallback(&base, member, pos, tpl),
                },
            },
            Path::Index(parent, idx_expr) => match self.lookup_path(parent, pos, ns, tpl)? {
                None => Ok(None),
                Some(base) => {
                    let key = self.eval_expr(idx_expr, ns, tpl)?;
                    match value::get_index(&base, &key) {
                        Lookup::Found(v) => Ok(Some(v)),
                        Lookup::Missing => Ok(None),
                    }
                }
            },
            Path::Call(parent, name, args) => match self.lookup_path(parent, pos, ns, tpl)? {
                None => Ok(None),
                Some(base) => {
                    let mut argv: TinyVec<[Value; 4]> = TinyVec::with_capacity(args.len());
                    for a in args {
                        argv.push(self.eval_expr(a, ns, tpl)?);
                    }
                    match value::invoke(&base, name, &argv) {
                        Invoke::Ok(v) => Ok(Some(v)),
                        Invoke::NoSuchMethod => Ok(None),
                        Invoke::Err(msg) => Err(Error::host(tpl.name.clone(), pos, msg)),
                    }
                }
            },
        }
    }

    /// `get_property` missed: retry as a zero-arg method named `member`,
    /// then the bean-style accessors `get_member`/`getMember`/`isMember`, in
    /// that order, matching how a reflective host binding typically exposes
    /// its object model.
    fn bean_accessor_fallback(&mut self, base: &Value, member: &str, pos: Position, tpl: &Template) -> Result<Option<Value>> {
        if !matches!(base, Value::Host(_)) {
            return Ok(None);
        }
        let capitalized = capitalize(member);
        for candidate in [member.to_string(), format!("get_{member}"), format!("get{capitalized}"), format!("is{capitalized}")] {
            match value::invoke(base, &candidate, &[]) {
                Invoke::Ok(v) => return Ok(Some(v)),
                Invoke::Err(msg) => return Err(Error::host(tpl.name.clone(), pos, msg)),
                Invoke::NoSuchMethod => continue,
            }
        }
        Ok(None)
    }

    fn eval_expr(&mut self, expr: &Expr, ns: &mut Namespace, tpl: &Template) -> Result<Value> {
        match expr {
            Expr::Literal(scalar) => Ok(scalar_to_value(scalar)),
            Expr::Reference { path, quiet, pos } => match self.lookup_path(path, *pos, ns, tpl)? {
                Some(v) => self.expand_defined(v, ns, tpl),
                None if *quiet => Ok(Value::Null),
                None if self.options.strict_references => Err(Error::execution(
                    tpl.name.clone(),
                    *pos,
                    format!("undefined reference {}", path_to_source(path, *quiet)),
                )),
                None => Ok(Value::Null),
            },
            Expr::Interp(parts) => {
                let mut s = String::new();
                for part in parts {
                    match part {
                        InterpPart::Text(t) => s.push_str(t),
                        InterpPart::Ref(path, quiet, pos) => match self.lookup_path(path, *pos, ns, tpl)? {
                            Some(v) => {
                                let v = self.expand_defined(v, ns, tpl)?;
                                s.push_str(&v.to_string());
                            }
                            None if *quiet => {}
                            None if self.options.strict_references => {
                                return Err(Error::execution(
                                    tpl.name.clone(),
                                    *pos,
                                    format!("undefined reference {}", path_to_source(path, *quiet)),
                                ));
                            }
                            None => s.push_str(&path_to_source(path, *quiet)),
                        },
                    }
                }
                Ok(Value::str(s))
            }
            Expr::List(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.eval_expr(item, ns, tpl)?);
                }
                Ok(Value::seq(vals))
            }
            Expr::Map(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for (k, v) in entries {
                    let kv = self.eval_expr(k, ns, tpl)?;
                    let vv = self.eval_expr(v, ns, tpl)?;
                    let key = ValueKey::from_value(&kv)
                        .ok_or_else(|| Error::execution(tpl.name.clone(), Position::default(), format!("a {} cannot be a map key", kv.kind_name())))?;
                    map.insert(key, vv);
                }
                Ok(Value::map(map))
            }
            Expr::Range(lo, hi, pos) => {
                let lo = self.eval_expr(lo, ns, tpl)?;
                let hi = self.eval_expr(hi, ns, tpl)?;
                match (lo, hi) {
                    (Value::Int(a), Value::Int(b)) => Ok(Value::Range(a, b, true)),
                    (lo, hi) => Err(Error::execution(
                        tpl.name.clone(),
                        *pos,
                        format!("range bounds must be integers, got {} and {}", lo.kind_name(), hi.kind_name()),
                    )),
                }
            }
            Expr::Binary(op, l, r, pos) => self.eval_binary(*op, l, r, *pos, ns, tpl),
            Expr::Unary(op, x, pos) => {
                let xv = self.eval_expr(x, ns, tpl)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!xv.truthy())),
                    UnOp::Neg => match xv {
                        Value::Int(i) => Ok(Value::Int(-i)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(Error::execution(tpl.name.clone(), *pos, format!("cannot negate a {}", other.kind_name()))),
                    },
                }
            }
        }
    }

    fn eval_binary(&mut self, op: BinOp, l: &Expr, r: &Expr, pos: Position, ns: &mut Namespace, tpl: &Template) -> Result<Value> {
        match op {
            BinOp::Or => {
                let lv = self.eval_expr(l, ns, tpl)?;
                if lv.truthy() {
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(self.eval_expr(r, ns, tpl)?.truthy()))
                }
            }
            BinOp::And => {
                let lv = self.eval_expr(l, ns, tpl)?;
                if !lv.truthy() {
                    Ok(Value::Bool(false))
                } else {
                    Ok(Value::Bool(self.eval_expr(r, ns, tpl)?.truthy()))
                }
            }
            BinOp::Eq | BinOp::Ne => {
                let lv = self.eval_expr(l, ns, tpl)?;
                let rv = self.eval_expr(r, ns, tpl)?;
                let eq = value::values_equal(&lv, &rv);
                Ok(Value::Bool(if op == BinOp::Eq { eq } else { !eq }))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let lv = self.eval_expr(l, ns, tpl)?;
                let rv = self.eval_expr(r, ns, tpl)?;
                let ord = value::values_compare(&lv, &rv).ok_or_else(|| {
                    Error::execution(tpl.name.clone(), pos, format!("cannot compare a {} with a {}", lv.kind_name(), rv.kind_name()))
                })?;
                use std::cmp::Ordering::*;
                let result = match op {
                    BinOp::Lt => ord == Less,
                    BinOp::Le => ord != Greater,
                    BinOp::Gt => ord == Greater,
                    BinOp::Ge => ord != Less,
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let lv = self.eval_expr(l, ns, tpl)?;
                let rv = self.eval_expr(r, ns, tpl)?;
                let op_str = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Mod => "%",
                    _ => unreachable!(),
                };
                value::arithmetic(op_str, &lv, &rv, self.options.strict_math).map_err(|e| {
                    let msg = match e {
                        ArithError::DivisionByZero => "division by zero".to_string(),
                        ArithError::NullOperand => "arithmetic on a null operand".to_string(),
                        ArithError::TypeMismatch => format!("cannot apply '{op_str}' to a {} and a {}", lv.kind_name(), rv.kind_name()),
                    };
                    Error::execution(tpl.name.clone(), pos, msg)
                })
            }
        }
    }
}

fn expect_string(v: &Value, directive: &str, pos: Position, tpl: &Template) -> Result<String> {
    match v {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(Error::execution(tpl.name.clone(), pos, format!("{directive} target must be a string, got a {}", other.kind_name()))),
    }
}

fn scalar_to_value(s: &Scalar) -> Value {
    match s {
        Scalar::Int(i) => Value::Int(*i),
        Scalar::Float(f) => Value::Float(*f),
        Scalar::Str(s) => Value::str(s.as_ref()),
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::Null => Value::Null,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

/// Best-effort reconstruction of a reference's source form, used to echo an
/// undefined non-strict, non-quiet reference back literally (e.g. `$foo.bar`).
/// Index and call arguments are not byte-exact reconstructions of the
/// original source; see the Non-goal on whitespace/echo fidelity.
fn path_to_source(path: &Path, quiet: bool) -> String {
    let mut s = String::from("$");
    if quiet {
        s.push('!');
    }
    write_path(&mut s, path);
    s
}

fn write_path(s: &mut String, path: &Path) {
    match path {
        Path::Root(name) => s.push_str(name),
        Path::Property(parent, member) => {
            write_path(s, parent);
            s.push('.');
            s.push_str(member);
        }
        Path::Index(parent, _) => {
            write_path(s, parent);
            s.push_str("[..]");
        }
        Path::Call(parent, member, args) => {
            write_path(s, parent);
            s.push('.');
            s.push_str(member);
            s.push('(');
            for i in 0..args.len() {
                if i > 0 {
                    s.push_str(", ");
                }
                s.push_str("..");
            }
            s.push(')');
        }
    }
}

impl fmt::Debug for Evaluator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}
