//! Namespace & Scoping.
//!
//! A [`Namespace`] is a stack of [`Frame`]s plus a separate macro table,
//! shared by one render. `#foreach` and macro calls push a frame and
//! `define_local` their locals; `#parse`d templates share the current
//! `Namespace` (so includes see and may mutate local bindings per the
//! `#set` rules) while `#include` does not.
//!
//! The root frame is supplied by the caller and is never mutated in place:
//! bare-name `#set` always targets a local frame, shadowing but never
//! writing through to the root. This resolves the open question in the
//! spec's Design Notes -- see `DESIGN.md`.

use std::rc::Rc;

use fnv::{FnvHashMap, FnvHashSet};

use crate::ast::Node;
use crate::error::Position;
use crate::value::{get_property, Lookup, Value};

/// A macro definition captured by name in the render-wide macro table.
/// Macro bodies are referentially transparent to their call site: at call
/// time a fresh frame binds parameter names to the argument values, and
/// nothing from the definition site's locals leaks in.
#[derive(Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<std::sync::Arc<str>>,
    pub body: Vec<Node>,
    pub pos: Position,
}

/// The implicit context object exposed inside an active `#foreach`.
#[derive(Debug)]
pub struct LoopRecord {
    pub count: i64,
    pub index: i64,
    pub has_next: bool,
    pub first: bool,
    pub last: bool,
    pub parent: Option<Rc<LoopRecord>>,
}

impl crate::value::HostObject for LoopRecord {
    fn get_property(&self, name: &str) -> Lookup {
        match name {
            "count" => Lookup::Found(Value::Int(self.count)),
            "index" => Lookup::Found(Value::Int(self.index)),
            "hasNext" => Lookup::Found(Value::Bool(self.has_next)),
            "first" => Lookup::Found(Value::Bool(self.first)),
            "last" => Lookup::Found(Value::Bool(self.last)),
            "parent" => match &self.parent {
                Some(p) => Lookup::Found(Value::Host(p.clone())),
                None => Lookup::Found(Value::Null),
            },
            _ => Lookup::Missing,
        }
    }
}

/// One level of name bindings, pushed by `#foreach` and macro calls.
#[derive(Debug, Default)]
pub struct Frame {
    vars: FnvHashMap<std::sync::Arc<str>, Value>,
    /// A macro call's frame: `get`/`set` stop here instead of continuing
    /// past it into the caller's locals. Macro bodies capture nothing from
    /// the definition *or* the call site except their own parameters.
    barrier: bool,
}

impl Frame {
    pub fn new() -> Self {
        Frame { vars: FnvHashMap::default(), barrier: false }
    }

    pub fn new_barrier() -> Self {
        Frame { vars: FnvHashMap::default(), barrier: true }
    }
}

pub struct Namespace {
    /// The caller-supplied mapping. Read-only: no operation in this module
    /// ever mutates it, only `set_property`/`set_index` through the Value
    /// Protocol on a value *returned* from it (that's the caller's value to
    /// mutate, not ours).
    root: Value,
    frames: Vec<Frame>,
    macros: FnvHashMap<std::sync::Arc<str>, Rc<MacroDef>>,
    loop_stack: Vec<Rc<LoopRecord>>,
    /// Reentry guard for `#define`d values that transitively reference
    /// themselves; see the Design Notes' cyclic-namespace guidance.
    defining: FnvHashSet<usize>,
}

impl Namespace {
    pub fn new(root: Value) -> Self {
        Namespace {
            root,
            frames: vec![Frame::new()],
            macros: FnvHashMap::default(),
            loop_stack: Vec::new(),
            defining: FnvHashSet::default(),
        }
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Frame::new());
    }

    /// Pushes a scope barrier frame, as used for a macro call: `get`/`set`
    /// below will see this frame and the root, but not any frame beneath it.
    pub fn push_frame_barrier(&mut self) {
        self.frames.push(Frame::new_barrier());
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
        debug_assert!(!self.frames.is_empty(), "popped the outermost local frame");
    }

    /// `get(name)`: search local frames top-down, then the root mapping.
    /// Stops at the first barrier frame encountered -- a macro call's own
    /// frame -- rather than continuing into the caller's locals below it.
    pub fn get(&self, name: &str) -> Option<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.vars.get(name) {
                return Some(v.clone());
            }
            if frame.barrier {
                break;
            }
        }
        match get_property(&self.root, name) {
            Lookup::Found(v) => Some(v),
            Lookup::Missing => None,
        }
    }

    /// `set(name, v)`: rebind in the first local frame that already defines
    /// `name`, otherwise define in the top local frame. The root is never a
    /// candidate target -- only local frames up to and including the nearest
    /// barrier are searched or written.
    pub fn set(&mut self, name: std::sync::Arc<str>, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if frame.vars.contains_key(&name) {
                frame.vars.insert(name, value);
                return;
            }
            if frame.barrier {
                break;
            }
        }
        self.define_local(name, value);
    }

    /// `define_local(name, v)`: always binds in the top frame, used by
    /// `#foreach` and macro calls to introduce their locals.
    pub fn define_local(&mut self, name: std::sync::Arc<str>, value: Value) {
        self.frames
            .last_mut()
            .expect("namespace always has at least one frame")
            .vars
            .insert(name, value);
    }

    pub fn define_macro(&mut self, def: MacroDef) {
        self.macros.insert(std::sync::Arc::from(def.name.as_str()), Rc::new(def));
    }

    pub fn lookup_macro(&self, name: &str) -> Option<Rc<MacroDef>> {
        self.macros.get(name).cloned()
    }

    pub fn push_loop(&mut self, record: LoopRecord) -> Rc<LoopRecord> {
        let rc = Rc::new(record);
        self.loop_stack.push(rc.clone());
        rc
    }

    pub fn pop_loop(&mut self) {
        self.loop_stack.pop();
    }

    /// The innermost currently-active `#foreach`, if any; becomes a new
    /// `LoopRecord`'s `parent` so `$foreach.parent` can walk outward.
    pub fn current_loop(&self) -> Option<Rc<LoopRecord>> {
        self.loop_stack.last().cloned()
    }

    /// Enters a `#define` expansion, returning `false` (and refusing entry)
    /// if this definition is already being expanded higher up the call
    /// stack -- i.e. it transitively references itself.
    pub fn enter_define(&mut self, body_ptr: usize) -> bool {
        self.defining.insert(body_ptr)
    }

    pub fn exit_define(&mut self, body_ptr: usize) {
        self.defining.remove(&body_ptr);
    }
}
