//! Recursive-descent parser.
//!
//! Single-pass, one-character lookahead, with bounded backtracking at
//! exactly three sites: the `#`-directive prefix (commit only once a known
//! directive name has matched), the `$`-reference prefix (commit only once
//! an identifier start has been seen), and `{ }` disambiguation inside
//! `${...}`. There is no separate tokenization pass -- `$`/`#` escapes,
//! literal text runs and quoted-string interpolation all have
//! context-dependent boundaries that a token stream would have to encode
//! awkwardly, so the parser reads characters directly (mirroring the
//! teacher crate's single-pass statement scanner).

use std::sync::Arc;

use lazy_static::lazy_static;

use crate::ast::{BinOp, Branch, Expr, InterpPart, MacroParam, Node, Path, Scalar, Template, UnOp};
use crate::error::{Error, Position, Result};

lazy_static! {
    static ref DIRECTIVE_KEYWORDS: fnv::FnvHashSet<&'static str> = [
        "if", "elseif", "else", "end", "foreach", "set", "macro", "include", "parse", "stop",
        "define", "evaluate", "noescape",
    ]
    .iter()
    .copied()
    .collect();
}

#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: u32,
    col: u32,
    line_has_nonws: bool,
}

pub struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    name: Option<Arc<str>>,
    source: Arc<str>,
    /// Whether anything other than horizontal whitespace has been scanned
    /// since the start of the current line; used to decide whether a
    /// directive sits alone on its line for whitespace gobbling purposes.
    line_has_nonws: bool,
    /// Stack of (directive name, position) for the `#end`-matching
    /// diagnostics ("expected `#end` closing `#foreach` opened at 12:3").
    open_stack: Vec<(&'static str, Position)>,
}

pub fn parse(source: &str, name: Option<Arc<str>>) -> Result<Template> {
    let mut p = Parser::new(source, name.clone());
    let body = p.parse_nodes(&[])?;
    if let Some((kind, pos)) = p.open_stack.last() {
        return Err(p.err(*pos, format!("unterminated `#{kind}` opened at {pos}")));
    }
    Ok(Template { name, source: Arc::from(source), body })
}

impl Parser {
    fn new(source: &str, name: Option<Arc<str>>) -> Self {
        Parser {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            name,
            source: Arc::from(source),
            line_has_nonws: false,
            open_stack: Vec::new(),
        }
    }

    // --- cursor primitives ---

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn eof(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
            self.line_has_nonws = false;
        } else {
            self.col += 1;
            if c != ' ' && c != '\t' && c != '\r' {
                self.line_has_nonws = true;
            }
        }
        Some(c)
    }

    fn pos_here(&self) -> Position {
        Position::new(self.line, self.col)
    }

    fn mark(&self) -> Mark {
        Mark { pos: self.pos, line: self.line, col: self.col, line_has_nonws: self.line_has_nonws }
    }

    fn restore(&mut self, m: Mark) {
        self.pos = m.pos;
        self.line = m.line;
        self.col = m.col;
        self.line_has_nonws = m.line_has_nonws;
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn err(&self, pos: Position, message: impl Into<String>) -> Error {
        Error::syntax(self.name.clone(), pos, self.source.clone(), message)
    }

    fn err_here(&self, message: impl Into<String>) -> Error {
        self.err(self.pos_here(), message)
    }

    fn skip_hspace(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\r')) {
            self.bump();
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn is_ident_start(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }

    fn is_ident_continue(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    fn scan_ident(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if s.is_empty() {
                if Self::is_ident_start(c) {
                    s.push(c);
                    self.bump();
                } else {
                    break;
                }
            } else if Self::is_ident_continue(c) {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        s
    }

    /// Consumes trailing horizontal whitespace and a newline after a
    /// directive tag, if (and only if) nothing but whitespace preceded the
    /// directive on its own line and nothing but whitespace follows before
    /// the next newline. This is Velocity's "standalone directive line"
    /// gobbling rule.
    fn maybe_gobble_line(&mut self, line_was_blank: bool) {
        if !line_was_blank {
            return;
        }
        let save = self.mark();
        self.skip_hspace();
        match self.peek() {
            Some('\n') => {
                self.bump();
            }
            None => {}
            _ => self.restore(save),
        }
    }

    // --- top level ---

    /// Parses nodes until EOF or one of `terminators` is seen as an
    /// upcoming directive keyword (without consuming it).
    fn parse_nodes(&mut self, terminators: &[&'static str]) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        macro_rules! flush_text {
            () => {
                if !text.is_empty() {
                    nodes.push(Node::Text(Arc::from(text.as_str())));
                    text.clear();
                }
            };
        }

        loop {
            if self.eof() {
                flush_text!();
                if !terminators.is_empty() {
                    return Err(self.err_here("unexpected end of template"));
                }
                break;
            }

            if self.peek() == Some('#') {
                if let Some(word) = self.peek_directive_word() {
                    if terminators.iter().any(|t| *t == word.as_str()) {
                        flush_text!();
                        break;
                    }
                }
            }

            let line_was_blank = !self.line_has_nonws && text_blank_tail(&text);

            match self.peek().unwrap() {
                '\\' => self.scan_escape(&mut text),
                '$' => {
                    if let Some(node) = self.try_parse_reference_node()? {
                        flush_text!();
                        nodes.push(node);
                    } else {
                        self.bump();
                        text.push('$');
                    }
                }
                '#' => {
                    if let Some(node) = self.try_parse_directive(line_was_blank)? {
                        flush_text!();
                        if let Some(node) = node {
                            nodes.push(node);
                        }
                    } else {
                        self.bump();
                        text.push('#');
                    }
                }
                c => {
                    self.bump();
                    text.push(c);
                }
            }
        }

        Ok(nodes)
    }

    /// Scans a single backslash-escape run in plain text, per the
    /// escape-soundness rule: a run of `n` backslashes before `$` collapses
    /// to `n/2` literal backslashes, and an odd run also forces the
    /// following `$` to be literal rather than attempting a reference.
    fn scan_escape(&mut self, text: &mut String) {
        let start = self.mark();
        let mut n = 0;
        while self.peek() == Some('\\') {
            self.bump();
            n += 1;
        }
        if self.peek() == Some('$') {
            for _ in 0..(n / 2) {
                text.push('\\');
            }
            if n % 2 == 1 {
                self.bump();
                text.push('$');
            }
            // else: leave the `$` for the main loop to parse as a reference.
        } else {
            self.restore(start);
            self.bump();
            text.push('\\');
        }
    }

    /// Looks ahead past `#`/`#{` to see whether a reserved directive name
    /// follows, without consuming anything.
    fn peek_directive_word(&self) -> Option<String> {
        let mut offset = 1; // past '#'
        if self.peek_at(offset) == Some('{') {
            offset += 1;
        }
        let mut word = String::new();
        let mut i = offset;
        while let Some(c) = self.peek_at(i) {
            if word.is_empty() {
                if Self::is_ident_start(c) {
                    word.push(c);
                } else {
                    break;
                }
            } else if Self::is_ident_continue(c) {
                word.push(c);
            } else {
                break;
            }
            i += 1;
        }
        if DIRECTIVE_KEYWORDS.contains(word.as_str()) {
            Some(word)
        } else {
            None
        }
    }

    /// Attempts to parse a `#`-construct at the cursor (which is at `#`).
    /// Returns `Ok(None)` if `#` does not introduce a recognized
    /// directive/comment/macro-call (the caller then treats `#` as a
    /// literal character). Returns `Ok(Some(None))` for comments, which
    /// produce no node. Returns `Ok(Some(Some(node)))` otherwise.
    #[allow(clippy::type_complexity)]
    fn try_parse_directive(&mut self, line_was_blank: bool) -> Result<Option<Option<Node>>> {
        let start = self.mark();
        let pos = self.pos_here();
        self.bump(); // '#'

        if self.peek() == Some('#') {
            // Line comment: `## ... \n`.
            while !matches!(self.peek(), Some('\n') | None) {
                self.bump();
            }
            if self.peek() == Some('\n') {
                self.bump();
            }
            return Ok(Some(None));
        }
        if self.peek() == Some('*') {
            self.bump();
            loop {
                if self.eof() {
                    return Err(self.err(pos, "unterminated block comment `#*`"));
                }
                if self.peek() == Some('*') && self.peek_at(1) == Some('#') {
                    self.bump();
                    self.bump();
                    break;
                }
                self.bump();
            }
            return Ok(Some(None));
        }

        let braced = self.peek() == Some('{');
        if braced {
            self.bump();
        }
        let word = self.scan_ident();

        if DIRECTIVE_KEYWORDS.contains(word.as_str()) {
            if braced {
                if self.peek() == Some('}') {
                    self.bump();
                } else {
                    return Err(self.err_here(format!("expected '}}' closing '#{{{word}'")));
                }
            }
            let node = self.parse_known_directive(&word, pos, line_was_blank)?;
            return Ok(Some(node));
        }

        if !word.is_empty() && self.peek() == Some('(') {
            // `#name(args)`: a macro call. Not validated against a known
            // macro table here -- macro definitions register at render
            // time, possibly after this call site in template order.
            self.bump();
            let args = self.parse_arglist(')')?;
            if self.peek() != Some(')') {
                return Err(self.err_here("expected ')' closing macro call arguments"));
            }
            self.bump();
            self.maybe_gobble_line(line_was_blank);
            return Ok(Some(Some(Node::MacroCall { name: Arc::from(word.as_str()), args, pos })));
        }

        // Not a directive or a macro call: `#` (and whatever we
        // tentatively scanned) is literal text. Roll all the way back to
        // just after `#` was scanned at the top of this function -- but we
        // haven't consumed `#` in our caller, so restore to `start` and let
        // the caller push the `#` literal itself.
        self.restore(start);
        Ok(None)
    }

    fn parse_known_directive(&mut self, word: &str, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        match word {
            "if" => self.parse_if(pos, line_was_blank),
            "foreach" => self.parse_foreach(pos, line_was_blank),
            "set" => self.parse_set(pos, line_was_blank),
            "macro" => self.parse_macro_def(pos, line_was_blank),
            "include" => self.parse_include(pos, line_was_blank),
            "parse" => self.parse_parse(pos, line_was_blank),
            "stop" => {
                self.maybe_gobble_line(line_was_blank);
                Ok(Some(Node::Stop))
            }
            "define" => self.parse_define(pos, line_was_blank),
            "evaluate" => self.parse_evaluate(pos, line_was_blank),
            "noescape" => self.parse_noescape(pos, line_was_blank),
            "elseif" | "else" | "end" => {
                Err(self.err(pos, format!("unexpected `#{word}` with no matching opening directive")))
            }
            _ => unreachable!("directive keyword {word} not handled"),
        }
    }

    fn expect_paren_expr(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.err_here("expected '('"));
        }
        self.bump();
        self.skip_ws();
        let e = self.parse_expr()?;
        self.skip_ws();
        if self.peek() != Some(')') {
            return Err(self.err_here("expected ')'"));
        }
        self.bump();
        Ok(e)
    }

    fn parse_if(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.open_stack.push(("if", pos));
        let cond = self.expect_paren_expr()?;
        self.maybe_gobble_line(line_was_blank);
        let mut branches = vec![Branch { cond, body: self.parse_nodes(&["elseif", "else", "end"])? }];
        let mut else_body = None;
        loop {
            let tag_pos = self.pos_here();
            let tag_blank = !self.line_has_nonws;
            let word = self.expect_directive_tag()?;
            match word.as_str() {
                "elseif" => {
                    let cond = self.expect_paren_expr()?;
                    self.maybe_gobble_line(tag_blank);
                    branches.push(Branch { cond, body: self.parse_nodes(&["elseif", "else", "end"])? });
                }
                "else" => {
                    self.maybe_gobble_line(tag_blank);
                    else_body = Some(self.parse_nodes(&["end"])?);
                    let _ = self.expect_directive_tag()?; // consumes "end"
                    self.maybe_gobble_line(tag_blank);
                    break;
                }
                "end" => {
                    self.maybe_gobble_line(tag_blank);
                    break;
                }
                other => return Err(self.err(tag_pos, format!("unexpected `#{other}` inside `#if`"))),
            }
        }
        self.open_stack.pop();
        Ok(Some(Node::If { branches, else_body }))
    }

    /// Consumes a bare `#word` (no parens) directive tag, used to read the
    /// `#elseif`/`#else`/`#end` that terminate a body. Assumes the cursor
    /// sits at `#` (braced form also accepted).
    fn expect_directive_tag(&mut self) -> Result<String> {
        if self.peek() != Some('#') {
            return Err(self.err_here("expected a directive"));
        }
        self.bump();
        let braced = self.peek() == Some('{');
        if braced {
            self.bump();
        }
        let word = self.scan_ident();
        if braced {
            if self.peek() == Some('}') {
                self.bump();
            } else {
                return Err(self.err_here("expected '}' closing directive name"));
            }
        }
        Ok(word)
    }

    fn parse_foreach(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.open_stack.push(("foreach", pos));
        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.err_here("expected '(' after `#foreach`"));
        }
        self.bump();
        self.skip_ws();
        if self.peek() != Some('$') {
            return Err(self.err_here("expected '$var' in `#foreach`"));
        }
        self.bump();
        if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
            return Err(self.err_here("expected identifier after '$' in `#foreach`"));
        }
        let var = self.scan_ident();
        self.skip_ws();
        if self.scan_ident() != "in" {
            return Err(self.err_here("expected 'in' in `#foreach`"));
        }
        self.skip_ws();
        let iterable = self.parse_expr()?;
        self.skip_ws();
        if self.peek() != Some(')') {
            return Err(self.err_here("expected ')' closing `#foreach`"));
        }
        self.bump();
        self.maybe_gobble_line(line_was_blank);
        let body = self.parse_nodes(&["end"])?;
        let tag_blank = !self.line_has_nonws;
        let end = self.expect_directive_tag()?;
        if end != "end" {
            return Err(self.err_here(format!("expected `#end` closing `#foreach` opened at {pos}, found `#{end}`")));
        }
        self.maybe_gobble_line(tag_blank);
        self.open_stack.pop();
        Ok(Some(Node::Foreach { var: Arc::from(var.as_str()), iterable, body, pos }))
    }

    fn parse_path(&mut self) -> Result<Path> {
        match self.try_parse_path()? {
            Some(path) => Ok(path),
            None => Err(self.err_here("expected a reference")),
        }
    }

    fn parse_set(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.err_here("expected '(' after `#set`"));
        }
        self.bump();
        self.skip_ws();
        if self.peek() != Some('$') {
            return Err(self.err_here("expected a settable reference in `#set`"));
        }
        self.bump();
        let path = self.parse_path()?;
        self.skip_ws();
        if self.peek() != Some('=') {
            return Err(self.err_here("expected '=' in `#set`"));
        }
        self.bump();
        self.skip_ws();
        let value = self.parse_expr()?;
        self.skip_ws();
        if self.peek() != Some(')') {
            return Err(self.err_here("expected ')' closing `#set`"));
        }
        self.bump();
        self.maybe_gobble_line(line_was_blank);
        Ok(Some(Node::Set { path, value, pos }))
    }

    fn parse_macro_def(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.open_stack.push(("macro", pos));
        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.err_here("expected '(' after `#macro`"));
        }
        self.bump();
        self.skip_ws();
        if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
            return Err(self.err_here("expected a macro name"));
        }
        let name = self.scan_ident();
        let mut params = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(')') {
                break;
            }
            if self.peek() != Some('$') {
                return Err(self.err_here("expected '$param' in `#macro` parameter list"));
            }
            self.bump();
            if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
                return Err(self.err_here("expected identifier after '$' in macro parameter"));
            }
            let p = self.scan_ident();
            params.push(MacroParam { name: Arc::from(p.as_str()) });
        }
        self.bump(); // ')'
        self.maybe_gobble_line(line_was_blank);
        let body = self.parse_nodes(&["end"])?;
        let tag_blank = !self.line_has_nonws;
        let end = self.expect_directive_tag()?;
        if end != "end" {
            return Err(self.err_here(format!("expected `#end` closing `#macro` opened at {pos}, found `#{end}`")));
        }
        self.maybe_gobble_line(tag_blank);
        self.open_stack.pop();
        Ok(Some(Node::MacroDef { name: Arc::from(name.as_str()), params, body, pos }))
    }

    fn parse_include(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.err_here("expected '(' after `#include`"));
        }
        self.bump();
        let mut exprs = Vec::new();
        loop {
            self.skip_ws();
            exprs.push(self.parse_expr()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(')') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.err_here("expected ',' or ')' in `#include`")),
            }
        }
        self.maybe_gobble_line(line_was_blank);
        Ok(Some(Node::Include { exprs, pos }))
    }

    fn parse_parse(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        let expr = self.expect_paren_expr()?;
        self.maybe_gobble_line(line_was_blank);
        Ok(Some(Node::Parse { expr, pos }))
    }

    fn parse_evaluate(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        let expr = self.expect_paren_expr()?;
        self.maybe_gobble_line(line_was_blank);
        Ok(Some(Node::Evaluate { expr, pos }))
    }

    fn parse_define(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.open_stack.push(("define", pos));
        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.err_here("expected '(' after `#define`"));
        }
        self.bump();
        self.skip_ws();
        if self.peek() != Some('$') {
            return Err(self.err_here("expected '$name' in `#define`"));
        }
        self.bump();
        if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
            return Err(self.err_here("expected identifier after '$' in `#define`"));
        }
        let name = self.scan_ident();
        self.skip_ws();
        if self.peek() != Some(')') {
            return Err(self.err_here("expected ')' closing `#define`"));
        }
        self.bump();
        self.maybe_gobble_line(line_was_blank);
        let body = self.parse_nodes(&["end"])?;
        let tag_blank = !self.line_has_nonws;
        let end = self.expect_directive_tag()?;
        if end != "end" {
            return Err(self.err_here(format!("expected `#end` closing `#define` opened at {pos}, found `#{end}`")));
        }
        self.maybe_gobble_line(tag_blank);
        self.open_stack.pop();
        Ok(Some(Node::Define { name: Arc::from(name.as_str()), body }))
    }

    fn parse_noescape(&mut self, pos: Position, line_was_blank: bool) -> Result<Option<Node>> {
        self.open_stack.push(("noescape", pos));
        self.maybe_gobble_line(line_was_blank);
        let body = self.parse_raw_until_end()?;
        self.open_stack.pop();
        Ok(Some(Node::Noescape { body }))
    }

    /// `#noescape ... #end`: emits body characters verbatim; `$`/`#` are
    /// not interpreted at all (not even for finding `#end` by directive
    /// matching -- we look for the literal `#end` token only).
    fn parse_raw_until_end(&mut self) -> Result<Vec<Node>> {
        let mut text = String::new();
        loop {
            if self.eof() {
                return Err(self.err_here("unterminated `#noescape`"));
            }
            if self.starts_with("#end") {
                self.bump();
                self.bump();
                self.bump();
                self.bump();
                break;
            }
            if self.starts_with("#{end}") {
                for _ in 0.."#{end}".len() {
                    self.bump();
                }
                break;
            }
            text.push(self.bump().unwrap());
        }
        let mut nodes = Vec::new();
        if !text.is_empty() {
            nodes.push(Node::Text(Arc::from(text.as_str())));
        }
        Ok(nodes)
    }

    // --- references ---

    fn try_parse_reference_node(&mut self) -> Result<Option<Node>> {
        let pos = self.pos_here();
        match self.try_parse_reference_parts()? {
            Some((path, quiet)) => Ok(Some(Node::Reference { path, quiet, silent: quiet, pos })),
            None => Ok(None),
        }
    }

    /// Assumes the cursor is at `$`. Consumes it and attempts the full
    /// reference grammar; on failure restores the cursor to `$` (exclusive
    /// of having consumed it) and returns `None`.
    fn try_parse_reference_parts(&mut self) -> Result<Option<(Path, bool)>> {
        let start = self.mark();
        self.bump(); // '$'
        let mut quiet = false;
        if self.peek() == Some('!') {
            quiet = true;
            self.bump();
        }
        let braced = self.peek() == Some('{');
        if braced {
            self.bump();
        }
        if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
            self.restore(start);
            return Ok(None);
        }
        let path = self.parse_path()?;
        if braced {
            if self.peek() == Some('}') {
                self.bump();
            } else {
                return Err(self.err_here("expected '}' closing '${'"));
            }
        }
        Ok(Some((path, quiet)))
    }

    /// Parses a reference chain body (after any `$`/`!`/`{` prefix has
    /// already been consumed by the caller): `ident ('.' ident ('(' args
    /// ')')? | '[' expr ']')*`.
    fn try_parse_path(&mut self) -> Result<Option<Path>> {
        if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
            return Ok(None);
        }
        let name = self.scan_ident();
        let mut path = Path::Root(Arc::from(name.as_str()));
        loop {
            let save = self.mark();
            match self.peek() {
                Some('.') => {
                    self.bump();
                    if !self.peek().map(Self::is_ident_start).unwrap_or(false) {
                        self.restore(save);
                        break;
                    }
                    let member = self.scan_ident();
                    if self.peek() == Some('(') {
                        self.bump();
                        let args = self.parse_arglist(')')?;
                        if self.peek() != Some(')') {
                            return Err(self.err_here("expected ')' closing method call"));
                        }
                        self.bump();
                        path = Path::Call(Box::new(path), Arc::from(member.as_str()), args);
                    } else {
                        path = Path::Property(Box::new(path), Arc::from(member.as_str()));
                    }
                }
                Some('[') => {
                    self.bump();
                    self.skip_ws();
                    let idx = self.parse_expr()?;
                    self.skip_ws();
                    if self.peek() != Some(']') {
                        return Err(self.err_here("expected ']' closing index"));
                    }
                    self.bump();
                    path = Path::Index(Box::new(path), Box::new(idx));
                }
                _ => break,
            }
        }
        Ok(Some(path))
    }

    fn parse_arglist(&mut self, close: char) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek() == Some(close) {
            return Ok(args);
        }
        loop {
            self.skip_ws();
            args.push(self.parse_expr()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                _ => break,
            }
        }
        Ok(args)
    }

    // --- expressions, by precedence (tightest at `unary`) ---

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut l = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.starts_with("||") {
                let pos = self.pos_here();
                self.bump();
                self.bump();
                self.skip_ws();
                let r = self.parse_and()?;
                l = Expr::Binary(BinOp::Or, Box::new(l), Box::new(r), pos);
            } else {
                break;
            }
        }
        Ok(l)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut l = self.parse_not()?;
        loop {
            self.skip_ws();
            if self.starts_with("&&") {
                let pos = self.pos_here();
                self.bump();
                self.bump();
                self.skip_ws();
                let r = self.parse_not()?;
                l = Expr::Binary(BinOp::And, Box::new(l), Box::new(r), pos);
            } else {
                break;
            }
        }
        Ok(l)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.peek() == Some('!') && self.peek_at(1) != Some('=') {
            let pos = self.pos_here();
            self.bump();
            self.skip_ws();
            let x = self.parse_not()?;
            return Ok(Expr::Unary(UnOp::Not, Box::new(x), pos));
        }
        self.parse_rel()
    }

    fn parse_rel(&mut self) -> Result<Expr> {
        let l = self.parse_add()?;
        self.skip_ws();
        let op = if self.starts_with("==") {
            Some(BinOp::Eq)
        } else if self.starts_with("!=") {
            Some(BinOp::Ne)
        } else if self.starts_with("<=") {
            Some(BinOp::Le)
        } else if self.starts_with(">=") {
            Some(BinOp::Ge)
        } else if self.peek() == Some('<') {
            Some(BinOp::Lt)
        } else if self.peek() == Some('>') {
            Some(BinOp::Gt)
        } else {
            None
        };
        match op {
            Some(op) => {
                let pos = self.pos_here();
                let width = match op {
                    BinOp::Eq | BinOp::Ne | BinOp::Le | BinOp::Ge => 2,
                    _ => 1,
                };
                for _ in 0..width {
                    self.bump();
                }
                self.skip_ws();
                let r = self.parse_add()?;
                Ok(Expr::Binary(op, Box::new(l), Box::new(r), pos))
            }
            None => Ok(l),
        }
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut l = self.parse_mul()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('+') => Some(BinOp::Add),
                Some('-') => Some(BinOp::Sub),
                _ => None,
            };
            match op {
                Some(op) => {
                    let pos = self.pos_here();
                    self.bump();
                    self.skip_ws();
                    let r = self.parse_mul()?;
                    l = Expr::Binary(op, Box::new(l), Box::new(r), pos);
                }
                None => break,
            }
        }
        Ok(l)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut l = self.parse_unary()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some('*') => Some(BinOp::Mul),
                Some('/') => Some(BinOp::Div),
                Some('%') => Some(BinOp::Mod),
                _ => None,
            };
            match op {
                Some(op) => {
                    let pos = self.pos_here();
                    self.bump();
                    self.skip_ws();
                    let r = self.parse_unary()?;
                    l = Expr::Binary(op, Box::new(l), Box::new(r), pos);
                }
                None => break,
            }
        }
        Ok(l)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.peek() == Some('-') && !self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            let pos = self.pos_here();
            self.bump();
            self.skip_ws();
            let x = self.parse_unary()?;
            return Ok(Expr::Unary(UnOp::Neg, Box::new(x), pos));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.peek() {
            Some(c) if c.is_ascii_digit() => self.parse_number(),
            Some('-') => self.parse_number(),
            Some('\'') => self.parse_single_quoted(),
            Some('"') => self.parse_double_quoted(),
            Some('$') => match self.try_parse_reference_parts()? {
                Some((path, quiet)) => {
                    let pos = self.pos_here();
                    Ok(Expr::Reference { path, quiet, pos })
                }
                None => Err(self.err_here("expected a reference after '$'")),
            },
            Some('(') => {
                self.bump();
                self.skip_ws();
                let e = self.parse_expr()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.err_here("expected ')'"));
                }
                self.bump();
                Ok(e)
            }
            Some('[') => self.parse_list_or_range(),
            Some('{') => self.parse_map(),
            Some(c) if Self::is_ident_start(c) => {
                let pos = self.pos_here();
                let word = self.scan_ident();
                match word.as_str() {
                    "true" => Ok(Expr::Literal(Scalar::Bool(true))),
                    "false" => Ok(Expr::Literal(Scalar::Bool(false))),
                    "null" | "void" => Ok(Expr::Literal(Scalar::Null)),
                    _ => Err(self.err(pos, format!("unexpected identifier '{word}' in expression"))),
                }
            }
            Some(c) => Err(self.err_here(format!("unexpected character '{c}' in expression"))),
            None => Err(self.err_here("unexpected end of template in expression")),
        }
    }

    fn parse_number(&mut self) -> Result<Expr> {
        let mut s = String::new();
        if self.peek() == Some('-') {
            s.push('-');
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            is_float = true;
            s.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    s.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if is_float {
            s.parse::<f64>()
                .map(|f| Expr::Literal(Scalar::Float(f)))
                .map_err(|_| self.err_here("invalid float literal"))
        } else {
            s.parse::<i64>()
                .map(|i| Expr::Literal(Scalar::Int(i)))
                .map_err(|_| self.err_here("invalid integer literal"))
        }
    }

    fn parse_single_quoted(&mut self) -> Result<Expr> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.peek() {
                None => return Err(self.err_here("unterminated single-quoted string")),
                Some('\'') => {
                    self.bump();
                    break;
                }
                Some('\\') if matches!(self.peek_at(1), Some('\'') | Some('\\')) => {
                    self.bump();
                    s.push(self.bump().unwrap());
                }
                Some(c) => {
                    self.bump();
                    s.push(c);
                }
            }
        }
        Ok(Expr::Literal(Scalar::Str(Arc::from(s.as_str()))))
    }

    fn parse_double_quoted(&mut self) -> Result<Expr> {
        self.bump(); // opening quote
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut has_ref = false;
        loop {
            match self.peek() {
                None => return Err(self.err_here("unterminated double-quoted string")),
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') if matches!(self.peek_at(1), Some('"') | Some('\\')) => {
                    self.bump();
                    text.push(self.bump().unwrap());
                }
                Some('$') => {
                    let pos = self.pos_here();
                    match self.try_parse_reference_parts()? {
                        Some((path, quiet)) => {
                            if !text.is_empty() {
                                parts.push(InterpPart::Text(Arc::from(text.as_str())));
                                text.clear();
                            }
                            parts.push(InterpPart::Ref(path, quiet, pos));
                            has_ref = true;
                        }
                        None => {
                            self.bump();
                            text.push('$');
                        }
                    }
                }
                Some(c) => {
                    self.bump();
                    text.push(c);
                }
            }
        }
        if !text.is_empty() {
            parts.push(InterpPart::Text(Arc::from(text.as_str())));
        }
        if has_ref {
            Ok(Expr::Interp(parts))
        } else {
            let joined: String = parts
                .into_iter()
                .map(|p| match p {
                    InterpPart::Text(t) => t.to_string(),
                    InterpPart::Ref(..) => unreachable!(),
                })
                .collect();
            Ok(Expr::Literal(Scalar::Str(Arc::from(joined.as_str()))))
        }
    }

    fn parse_list_or_range(&mut self) -> Result<Expr> {
        let pos = self.pos_here();
        self.bump(); // '['
        self.skip_ws();
        if self.peek() == Some(']') {
            self.bump();
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expr()?;
        self.skip_ws();
        if self.starts_with("..") {
            self.bump();
            self.bump();
            self.skip_ws();
            let hi = self.parse_expr()?;
            self.skip_ws();
            if self.peek() != Some(']') {
                return Err(self.err_here("expected ']' closing range"));
            }
            self.bump();
            return Ok(Expr::Range(Box::new(first), Box::new(hi), pos));
        }
        let mut items = vec![first];
        loop {
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                    self.skip_ws();
                    items.push(self.parse_expr()?);
                }
                Some(']') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.err_here("expected ',' or ']' in list literal")),
            }
        }
        Ok(Expr::List(items))
    }

    fn parse_map(&mut self) -> Result<Expr> {
        self.bump(); // '{'
        self.skip_ws();
        let mut entries = Vec::new();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(Expr::Map(entries));
        }
        loop {
            self.skip_ws();
            let k = self.parse_expr()?;
            self.skip_ws();
            if self.peek() != Some(':') {
                return Err(self.err_here("expected ':' in map literal"));
            }
            self.bump();
            self.skip_ws();
            let v = self.parse_expr()?;
            entries.push((k, v));
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {
                    self.bump();
                    break;
                }
                _ => return Err(self.err_here("expected ',' or '}' in map literal")),
            }
        }
        Ok(Expr::Map(entries))
    }
}

/// True if the tail of `text` since its last newline (or its start) is
/// blank. Used alongside `Parser::line_has_nonws` to decide whether a
/// directive is alone on its source line.
fn text_blank_tail(text: &str) -> bool {
    match text.rfind('\n') {
        Some(idx) => text[idx + 1..].trim().is_empty(),
        None => text.trim().is_empty(),
    }
}
