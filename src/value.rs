//! The Value Protocol.
//!
//! The evaluator never inspects host values directly; every property read,
//! index, iteration or method call passes through the free functions in this
//! module, which dispatch uniformly across the built-in [`Value`] kinds and
//! user-supplied [`HostObject`] implementations. A host-language binding
//! provides exactly one `HostObject` impl for its own object model; the
//! evaluator is oblivious to what's behind it.
//!
//! `Value` itself is *not* required to be `Send`: a render walks one
//! template on one thread with its own [`crate::namespace::Namespace`], so
//! the mutable list/map containers below use `Rc<RefCell<_>>` rather than
//! `Arc<Mutex<_>>`. `HostObject` is the seam where a host may plug in
//! `Send + Sync` state if it wants the same object reachable from
//! concurrently-rendering templates; see its definition below.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use itertools::Itertools;

/// Outcome of [`get_property`]/[`get_index`]: either a value, or "missing",
/// which is not an error -- the caller decides whether that's quiet,
/// literal-rendered, or a hard `TemplateExecutionError` per `strict_references`.
pub enum Lookup {
    Found(Value),
    Missing,
}

/// Outcome of [`invoke`].
pub enum Invoke {
    Ok(Value),
    /// No method by that name/arity exists.
    NoSuchMethod,
    /// The method existed and was called, but the host raised.
    Err(String),
}

/// Outcome of `set_property`/`set_index`.
pub enum SetOutcome {
    Ok,
    Unsupported,
}

/// A key usable in a [`Value::Map`]: any hashable scalar kind. Composite
/// values (`Seq`, `Map`, `Range`) are not hashable and cannot be used as map
/// keys; constructing one produces an execution error at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Stored as bits so the key type can derive `Hash`/`Eq`; float map keys
    /// are an edge case Velocity itself discourages, but we support them
    /// rather than silently coercing.
    FloatBits(u64),
    Str(Rc<str>),
}

impl ValueKey {
    pub fn from_value(v: &Value) -> Option<ValueKey> {
        match v {
            Value::Null => Some(ValueKey::Null),
            Value::Bool(b) => Some(ValueKey::Bool(*b)),
            Value::Int(i) => Some(ValueKey::Int(*i)),
            Value::Float(f) => Some(ValueKey::FloatBits(f.to_bits())),
            Value::Str(s) => Some(ValueKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ValueKey::Null => Value::Null,
            ValueKey::Bool(b) => Value::Bool(*b),
            ValueKey::Int(i) => Value::Int(*i),
            ValueKey::FloatBits(bits) => Value::Float(f64::from_bits(*bits)),
            ValueKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// The dynamic value kind the evaluator operates on.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Seq(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<IndexMap<ValueKey, Value>>>),
    Range(i64, i64, bool),
    Macro(Rc<crate::namespace::MacroDef>),
    /// The binding installed by `#define(name) ... #end`: a block of nodes
    /// that re-renders against whatever namespace is live at *reference*
    /// time, not at definition time. Expanded by the evaluator, not here.
    Defined(Rc<Vec<crate::ast::Node>>),
    Host(Rc<dyn HostObject>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn seq(items: Vec<Value>) -> Value {
        Value::Seq(Rc::new(RefCell::new(items)))
    }

    pub fn map(entries: IndexMap<ValueKey, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    /// Truthiness per the Data Model: `Null` -> false, `Bool` -> self,
    /// numeric -> nonzero, `Str` -> non-empty, `Seq`/`Map`/`Range` ->
    /// non-empty, `HostObject` -> true unless the host signals otherwise.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Seq(s) => !s.borrow().is_empty(),
            Value::Map(m) => !m.borrow().is_empty(),
            Value::Range(lo, hi, inclusive) => range_len(*lo, *hi, *inclusive) > 0,
            Value::Macro(_) => true,
            Value::Defined(_) => true,
            Value::Host(h) => h.truthy(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Seq(_) => "list",
            Value::Map(_) => "map",
            Value::Range(..) => "range",
            Value::Macro(_) => "macro",
            Value::Defined(_) => "define",
            Value::Host(_) => "object",
        }
    }
}

fn range_len(lo: i64, hi: i64, inclusive: bool) -> i64 {
    if lo <= hi {
        hi - lo + if inclusive { 1 } else { 0 }
    } else {
        // Velocity ranges may count down; [5..1] yields 5,4,3,2,1.
        lo - hi + if inclusive { 1 } else { 0 }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fv) => write!(f, "{}", fv),
            Value::Str(s) => write!(f, "{}", s),
            Value::Seq(items) => {
                write!(f, "[{}]", items.borrow().iter().map(|v| v.to_string()).join(", "))
            }
            Value::Map(entries) => {
                write!(f, "{{{}}}", entries.borrow().iter().map(|(k, v)| format!("{k}: {v}")).join(", "))
            }
            Value::Range(lo, hi, inclusive) => {
                write!(f, "[{}..{}{}]", lo, hi, if *inclusive { "" } else { ")" })
            }
            Value::Macro(m) => write!(f, "#macro({})", m.name),
            Value::Defined(_) => write!(f, ""),
            Value::Host(h) => write!(f, "{}", h.display()),
        }
    }
}

/// The protocol a host-language object implements to participate in
/// property lookup, indexing, method dispatch and iteration. A binding for
/// a specific embedding language writes exactly one impl of this trait; the
/// evaluator never special-cases a concrete host type.
///
/// Unlike `Template`/`Node` (which must be `Send + Sync` to support
/// concurrent rendering), `HostObject` carries no such bound: each render
/// gets its own `Namespace` built from a root value supplied by whichever
/// thread calls `merge`, so host objects never need to cross a thread
/// boundary themselves.
pub trait HostObject: fmt::Debug {
    /// Lookup order for the evaluator's `get_property` is, for host objects:
    /// (i) a mapping-like key, (ii) an attribute/field, (iii) a zero-arg
    /// method `name`, (iv) a zero-arg bean accessor `get_name`/`getName`/
    /// `isName`. A single impl typically only needs to implement the subset
    /// relevant to its own object model; returning `Missing` for the rest is
    /// always safe, the evaluator does not retry beyond what this method
    /// returns.
    fn get_property(&self, name: &str) -> Lookup {
        let _ = name;
        Lookup::Missing
    }

    fn get_index(&self, key: &Value) -> Lookup {
        let _ = key;
        Lookup::Missing
    }

    fn invoke(&self, name: &str, args: &[Value]) -> Invoke {
        let _ = (name, args);
        Invoke::NoSuchMethod
    }

    fn set_property(&self, name: &str, value: Value) -> SetOutcome {
        let _ = (name, value);
        SetOutcome::Unsupported
    }

    fn set_index(&self, key: &Value, value: Value) -> SetOutcome {
        let _ = (key, value);
        SetOutcome::Unsupported
    }

    /// A finite ordered view for `#foreach`, or `None` if this object does
    /// not advertise iterability.
    fn iter(&self) -> Option<Vec<Value>> {
        None
    }

    /// Truthiness override; defaults to always-true per the Data Model.
    fn truthy(&self) -> bool {
        true
    }

    fn display(&self) -> String {
        format!("{:?}", self)
    }
}

/// `get_property(obj, name)`: mapping key, then attribute/method, per §4.1.
pub fn get_property(obj: &Value, name: &str) -> Lookup {
    match obj {
        Value::Map(entries) => {
            let key = ValueKey::Str(Rc::from(name));
            match entries.borrow().get(&key) {
                Some(v) => Lookup::Found(v.clone()),
                None => Lookup::Missing,
            }
        }
        Value::Host(h) => h.get_property(name),
        _ => Lookup::Missing,
    }
}

/// `get_index(obj, key)`: sequences (non-negative integer key), mappings
/// (any hashable key), strings (integer key -> one-char string).
pub fn get_index(obj: &Value, key: &Value) -> Lookup {
    match obj {
        Value::Seq(items) => {
            if let Value::Int(i) = key {
                if *i >= 0 {
                    if let Some(v) = items.borrow().get(*i as usize) {
                        return Lookup::Found(v.clone());
                    }
                }
            }
            Lookup::Missing
        }
        Value::Str(s) => {
            if let Value::Int(i) = key {
                if *i >= 0 {
                    if let Some(c) = s.chars().nth(*i as usize) {
                        return Lookup::Found(Value::str(c.to_string()));
                    }
                }
            }
            Lookup::Missing
        }
        Value::Map(entries) => match ValueKey::from_value(key) {
            Some(k) => match entries.borrow().get(&k) {
                Some(v) => Lookup::Found(v.clone()),
                None => Lookup::Missing,
            },
            None => Lookup::Missing,
        },
        Value::Range(lo, hi, inclusive) => {
            if let Value::Int(i) = key {
                let items = materialize_range(*lo, *hi, *inclusive);
                if *i >= 0 {
                    if let Some(v) = items.get(*i as usize) {
                        return Lookup::Found(v.clone());
                    }
                }
            }
            Lookup::Missing
        }
        Value::Host(h) => h.get_index(key),
        _ => Lookup::Missing,
    }
}

/// `set_property`/`set_index`, used by `#set` only when the lhs path has
/// length greater than one.
pub fn set_property(obj: &Value, name: &str, value: Value) -> SetOutcome {
    match obj {
        Value::Map(entries) => {
            entries.borrow_mut().insert(ValueKey::Str(Rc::from(name)), value);
            SetOutcome::Ok
        }
        Value::Host(h) => h.set_property(name, value),
        _ => SetOutcome::Unsupported,
    }
}

pub fn set_index(obj: &Value, key: &Value, value: Value) -> SetOutcome {
    match obj {
        Value::Seq(items) => {
            if let Value::Int(i) = key {
                if *i >= 0 {
                    let mut items = items.borrow_mut();
                    let idx = *i as usize;
                    if idx < items.len() {
                        items[idx] = value;
                        return SetOutcome::Ok;
                    }
                }
            }
            SetOutcome::Unsupported
        }
        Value::Map(entries) => match ValueKey::from_value(key) {
            Some(k) => {
                entries.borrow_mut().insert(k, value);
                SetOutcome::Ok
            }
            None => SetOutcome::Unsupported,
        },
        Value::Host(h) => h.set_index(key, value),
        _ => SetOutcome::Unsupported,
    }
}

/// `iter(obj)`: a finite ordered sequence view. Defined on `Seq`, `Map`
/// (yields keys in insertion order), `Range`, `Str` (by character), and host
/// objects advertising iterability.
pub fn iter(obj: &Value) -> Option<Vec<Value>> {
    match obj {
        Value::Seq(items) => Some(items.borrow().clone()),
        Value::Map(entries) => Some(entries.borrow().keys().map(ValueKey::to_value).collect()),
        Value::Range(lo, hi, inclusive) => Some(materialize_range(*lo, *hi, *inclusive)),
        Value::Str(s) => Some(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Host(h) => h.iter(),
        _ => None,
    }
}

fn materialize_range(lo: i64, hi: i64, inclusive: bool) -> Vec<Value> {
    let mut out = Vec::new();
    if lo <= hi {
        let end = if inclusive { hi + 1 } else { hi };
        let mut i = lo;
        while i < end {
            out.push(Value::Int(i));
            i += 1;
        }
    } else {
        let end = if inclusive { hi - 1 } else { hi };
        let mut i = lo;
        while i > end {
            out.push(Value::Int(i));
            i -= 1;
        }
    }
    out
}

/// `invoke(obj, name, args)`: built-in kinds expose a small set of
/// Velocity-style convenience methods (`size`, `isEmpty`, `get`, `contains`);
/// anything else is delegated to `HostObject::invoke`. Arity is matched
/// first; kind-overload resolution beyond that is unspecified by design.
pub fn invoke(obj: &Value, name: &str, args: &[Value]) -> Invoke {
    match obj {
        Value::Seq(items) => match (name, args.len()) {
            ("size", 0) => Invoke::Ok(Value::Int(items.borrow().len() as i64)),
            ("isEmpty", 0) => Invoke::Ok(Value::Bool(items.borrow().is_empty())),
            ("get", 1) => match &args[0] {
                Value::Int(i) if *i >= 0 => match items.borrow().get(*i as usize) {
                    Some(v) => Invoke::Ok(v.clone()),
                    None => Invoke::Err(format!("index {} out of range", i)),
                },
                _ => Invoke::NoSuchMethod,
            },
            ("contains", 1) => Invoke::Ok(Value::Bool(items.borrow().iter().any(|v| values_equal(v, &args[0])))),
            ("add", 1) => {
                items.borrow_mut().push(args[0].clone());
                Invoke::Ok(Value::Bool(true))
            }
            _ => Invoke::NoSuchMethod,
        },
        Value::Map(entries) => match (name, args.len()) {
            ("size", 0) => Invoke::Ok(Value::Int(entries.borrow().len() as i64)),
            ("isEmpty", 0) => Invoke::Ok(Value::Bool(entries.borrow().is_empty())),
            ("containsKey", 1) => match ValueKey::from_value(&args[0]) {
                Some(k) => Invoke::Ok(Value::Bool(entries.borrow().contains_key(&k))),
                None => Invoke::Ok(Value::Bool(false)),
            },
            ("get", 1) => match get_index(obj, &args[0]) {
                Lookup::Found(v) => Invoke::Ok(v),
                Lookup::Missing => Invoke::Ok(Value::Null),
            },
            ("keySet", 0) => Invoke::Ok(Value::seq(entries.borrow().keys().map(ValueKey::to_value).collect())),
            ("put", 2) => match ValueKey::from_value(&args[0]) {
                Some(k) => {
                    let prev = entries.borrow_mut().insert(k, args[1].clone());
                    Invoke::Ok(prev.unwrap_or(Value::Null))
                }
                None => Invoke::Err("unhashable map key".into()),
            },
            _ => Invoke::NoSuchMethod,
        },
        Value::Str(s) => match (name, args.len()) {
            ("length", 0) => Invoke::Ok(Value::Int(s.chars().count() as i64)),
            ("isEmpty", 0) => Invoke::Ok(Value::Bool(s.is_empty())),
            ("toUpperCase", 0) => Invoke::Ok(Value::str(s.to_uppercase())),
            ("toLowerCase", 0) => Invoke::Ok(Value::str(s.to_lowercase())),
            ("trim", 0) => Invoke::Ok(Value::str(s.trim().to_string())),
            ("contains", 1) => match &args[0] {
                Value::Str(needle) => Invoke::Ok(Value::Bool(s.contains(needle.as_ref()))),
                _ => Invoke::NoSuchMethod,
            },
            ("substring", 2) => match (&args[0], &args[1]) {
                (Value::Int(a), Value::Int(b)) if *a >= 0 && *b >= *a => {
                    let chars: Vec<char> = s.chars().collect();
                    let a = *a as usize;
                    let b = (*b as usize).min(chars.len());
                    if a <= b && a <= chars.len() {
                        Invoke::Ok(Value::str(chars[a..b].iter().collect::<String>()))
                    } else {
                        Invoke::Err("substring index out of range".into())
                    }
                }
                _ => Invoke::NoSuchMethod,
            },
            _ => Invoke::NoSuchMethod,
        },
        Value::Host(h) => h.invoke(name, args),
        _ => Invoke::NoSuchMethod,
    }
}

/// Arithmetic promotion: `Int` x `Float` -> `Float`. `Null` participates as
/// zero unless the caller enforces `strict_math`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    DivisionByZero,
    NullOperand,
    TypeMismatch,
}

fn as_number(v: &Value, strict_math: bool) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        Value::Null if !strict_math => Some(Num::Int(0)),
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

pub fn arithmetic(op: &str, l: &Value, r: &Value, strict_math: bool) -> Result<Value, ArithError> {
    if matches!(l, Value::Null) && strict_math {
        return Err(ArithError::NullOperand);
    }
    if matches!(r, Value::Null) && strict_math {
        return Err(ArithError::NullOperand);
    }
    let ln = as_number(l, strict_math).ok_or(ArithError::TypeMismatch)?;
    let rn = as_number(r, strict_math).ok_or(ArithError::TypeMismatch)?;
    match (ln, rn) {
        (Num::Int(a), Num::Int(b)) => match op {
            "+" => Ok(Value::Int(a.wrapping_add(b))),
            "-" => Ok(Value::Int(a.wrapping_sub(b))),
            "*" => Ok(Value::Int(a.wrapping_mul(b))),
            "/" => {
                if b == 0 {
                    Err(ArithError::DivisionByZero)
                } else {
                    Ok(Value::Int(a / b))
                }
            }
            "%" => {
                if b == 0 {
                    Err(ArithError::DivisionByZero)
                } else {
                    // `%` follows the sign of the dividend, matching Rust's `%`.
                    Ok(Value::Int(a % b))
                }
            }
            _ => unreachable!("unknown arithmetic operator {op}"),
        },
        (a, b) => {
            let a = to_f64(a);
            let b = to_f64(b);
            match op {
                "+" => Ok(Value::Float(a + b)),
                "-" => Ok(Value::Float(a - b)),
                "*" => Ok(Value::Float(a * b)),
                "/" => {
                    if b == 0.0 {
                        Err(ArithError::DivisionByZero)
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                "%" => {
                    if b == 0.0 {
                        Err(ArithError::DivisionByZero)
                    } else {
                        Ok(Value::Float(a % b))
                    }
                }
                _ => unreachable!("unknown arithmetic operator {op}"),
            }
        }
    }
}

fn to_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

/// `==` compares numerically across Int/Float and structurally across
/// strings/sequences/maps; `null == null` is true; unlike kinds compare
/// false rather than erroring.
pub fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Seq(a), Value::Seq(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Map(a), Value::Map(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).map_or(false, |bv| values_equal(v, bv)))
        }
        // Numeric-vs-string comparison in non-strict mode is false, not an
        // error; see the open question in the Design Notes.
        _ => false,
    }
}

/// Partial ordering for `<`, `<=`, `>`, `>=`. Numeric kinds compare
/// numerically, strings compare lexicographically; anything else (including
/// cross-kind comparisons) has no ordering.
pub fn values_compare(l: &Value, r: &Value) -> Option<std::cmp::Ordering> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
