//! # Module Script Evaluator
//!
//! Loads the functions of a bundled module so that a [`Dispatcher`] can run
//! them in-process. The supported language is a small subset:
//!
//! - `function name(a, b = 1) { ... }`, `const name = (a) => expr` and
//!   `const name = function (a) { ... }` definitions, found anywhere in the
//!   source (the bundle wrapper included)
//! - `const`/`let`/`var`, assignment (`=`, `+=`, `-=`), `if`/`else`,
//!   `return`, `throw` and expression statements
//! - integer arithmetic (checked), string concatenation, comparisons, logical
//!   and conditional operators, template literals, array and object literals
//! - calls between module functions, a few string and array methods,
//!   `String`, `Number`, `Boolean`, `Error`, `JSON.stringify/parse` and
//!   `Math.min/max/abs`
//! - `sql` tagged templates, run through the [`SqlRuntime`] of the call
//!
//! A function that uses anything else still loads; calling it reports the
//! construct it could not read.

use super::{Dispatcher, SqlRuntime, Template};
use crate::{BindValue, MleError};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Nested module calls allowed before a call fails.
const MAX_CALL_DEPTH: usize = 64;

/// Longest first, so that `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "=>", "==", "!=", "<=", ">=", "&&", "||", "??", "+=", "-=", "(", ")", "{", "}",
    "[", "]", ",", ";", ":", "?", ".", "+", "-", "*", "/", "%", "<", ">", "=", "!",
];

// =============================================================================
// TOKENS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(i64),
    Str(String),
    /// Cooked literal parts and the source of each `${...}` between them.
    Template { parts: Vec<String>, exprs: Vec<String> },
    Ident(String),
    Punct(&'static str),
    Unsupported(String),
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => n.to_string(),
        Token::Str(s) => format!("'{s}'"),
        Token::Template { .. } => "template literal".to_string(),
        Token::Ident(name) => name.clone(),
        Token::Punct(p) => format!("`{p}`"),
        Token::Unsupported(text) => format!("unsupported syntax `{text}`"),
    }
}

fn tokenize(src: &str) -> Vec<Token> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
            continue;
        }
        if c == '\'' || c == '"' {
            let (text, end) = quoted(&chars, i);
            tokens.push(Token::Str(text));
            i = end;
            continue;
        }
        if c == '`' {
            let (token, end) = template(&chars, i);
            tokens.push(token);
            i = end;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '_' | '.')) {
                i += 1;
            }
            let text: String = chars[start..i].iter().filter(|&&d| d != '_').collect();
            tokens.push(text.parse().map_or(Token::Unsupported(text), Token::Number));
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$')) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }

        let ahead: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match PUNCTUATORS.iter().find(|p| ahead.starts_with(**p)) {
            Some(&p) => {
                tokens.push(Token::Punct(p));
                i += p.len();
            }
            None => {
                tokens.push(Token::Unsupported(c.to_string()));
                i += 1;
            }
        }
    }
    tokens
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

fn quoted(chars: &[char], open: usize) -> (String, usize) {
    let quote = chars[open];
    let mut text = String::new();
    let mut i = open + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                if let Some(&escaped) = chars.get(i + 1) {
                    text.push(unescape(escaped));
                }
                i += 2;
            }
            c if c == quote => return (text, i + 1),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    (text, i)
}

fn template(chars: &[char], open: usize) -> (Token, usize) {
    let mut parts = vec![String::new()];
    let mut exprs = Vec::new();
    let mut i = open + 1;

    while i < chars.len() {
        match chars[i] {
            '`' => return (Token::Template { parts, exprs }, i + 1),
            '\\' => {
                if let (Some(part), Some(&escaped)) = (parts.last_mut(), chars.get(i + 1)) {
                    part.push(unescape(escaped));
                }
                i += 2;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let start = i + 2;
                let mut depth = 1usize;
                i = start;
                while i < chars.len() {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' if depth == 1 => break,
                        '}' => depth -= 1,
                        '\'' | '"' => {
                            i = quoted(chars, i).1;
                            continue;
                        }
                        _ => {}
                    }
                    i += 1;
                }
                exprs.push(chars[start..i.min(chars.len())].iter().collect());
                parts.push(String::new());
                i += 1;
            }
            c => {
                if let Some(part) = parts.last_mut() {
                    part.push(c);
                }
                i += 1;
            }
        }
    }
    (Token::Unsupported("unterminated template literal".to_string()), i)
}

// =============================================================================
// SYNTAX
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Or,
    Nullish,
    And,
    StrictEq,
    StrictNe,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Binary operators by precedence, loosest first.
const LEVELS: &[&[(&str, Op)]] = &[
    &[("||", Op::Or), ("??", Op::Nullish)],
    &[("&&", Op::And)],
    &[("===", Op::StrictEq), ("!==", Op::StrictNe), ("==", Op::Eq), ("!=", Op::Ne)],
    &[("<=", Op::Le), (">=", Op::Ge), ("<", Op::Lt), (">", Op::Gt)],
    &[("+", Op::Add), ("-", Op::Sub)],
    &[("*", Op::Mul), ("/", Op::Div), ("%", Op::Rem)],
];

#[derive(Debug, Clone, Copy)]
enum Unary {
    Not,
    Neg,
    Plus,
    TypeOf,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Template(Vec<String>, Vec<Expr>),
    Sql(Vec<String>, Vec<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(Unary, Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Declare(String, Expr),
    Assign(String, Option<Op>, Expr),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    Block(Vec<Stmt>),
    Return(Option<Expr>),
    Throw(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone)]
struct Function {
    params: Vec<(String, Option<Expr>)>,
    body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    /// `function name(...) { ... }` and `function (...) { ... }`
    Declaration,
    /// `(...) => ...`
    Arrow,
    /// `x => ...`
    BareArrow,
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token], pos: usize) -> Self {
        Self { tokens, pos }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, punct: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(p)) if *p == punct)
    }

    fn eat(&mut self, punct: &str) -> bool {
        let found = self.at(punct);
        if found {
            self.pos += 1;
        }
        found
    }

    fn eat_word(&mut self, word: &str) -> bool {
        let found = matches!(self.peek(), Some(Token::Ident(w)) if w == word);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect(&mut self, punct: &str) -> Result<(), String> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{punct}`")))
        }
    }

    fn unexpected(&self, wanted: &str) -> String {
        let found = self.peek().map_or_else(|| "end of input".to_string(), describe);
        format!("expected {wanted}, found {found}")
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn function(mut self, shape: Shape) -> Result<Function, String> {
        let params = match shape {
            Shape::BareArrow => vec![(self.ident()?, None)],
            Shape::Declaration | Shape::Arrow => {
                self.expect("(")?;
                self.params()?
            }
        };
        if let Shape::Declaration = shape {
            self.expect("{")?;
            return Ok(Function {
                params,
                body: self.block()?,
            });
        }

        self.expect("=>")?;
        let body = if self.eat("{") {
            self.block()?
        } else {
            vec![Stmt::Return(Some(self.expression()?))]
        };
        Ok(Function { params, body })
    }

    fn params(&mut self) -> Result<Vec<(String, Option<Expr>)>, String> {
        let mut params = Vec::new();
        while !self.eat(")") {
            let name = self.ident()?;
            let default = if self.eat("=") {
                Some(self.expression()?)
            } else {
                None
            };
            params.push((name, default));
            if !self.eat(",") {
                self.expect(")")?;
                break;
            }
        }
        Ok(params)
    }

    // -------------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------------

    fn block(&mut self) -> Result<Vec<Stmt>, String> {
        let mut body = Vec::new();
        while !self.eat("}") {
            if self.peek().is_none() {
                return Err("unterminated block".to_string());
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        if self.eat("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        if self.eat(";") {
            return Ok(Stmt::Block(Vec::new()));
        }
        if self.eat_word("return") {
            let value = if self.at(";") || self.at("}") {
                None
            } else {
                Some(self.expression()?)
            };
            self.eat(";");
            return Ok(Stmt::Return(value));
        }
        if self.eat_word("throw") {
            let value = self.expression()?;
            self.eat(";");
            return Ok(Stmt::Throw(value));
        }
        if self.eat_word("if") {
            self.expect("(")?;
            let test = self.expression()?;
            self.expect(")")?;
            let then = Box::new(self.statement()?);
            let otherwise = if self.eat_word("else") {
                Some(Box::new(self.statement()?))
            } else {
                None
            };
            return Ok(Stmt::If(test, then, otherwise));
        }
        if self.eat_word("const") || self.eat_word("let") || self.eat_word("var") {
            let name = self.ident()?;
            let value = if self.eat("=") {
                self.expression()?
            } else {
                Expr::Literal(Value::Null)
            };
            self.eat(";");
            return Ok(Stmt::Declare(name, value));
        }
        if let (Some(Token::Ident(name)), Some(Token::Punct(op @ ("=" | "+=" | "-=")))) =
            (self.peek(), self.tokens.get(self.pos + 1))
        {
            let compound = match *op {
                "+=" => Some(Op::Add),
                "-=" => Some(Op::Sub),
                _ => None,
            };
            self.pos += 2;
            let value = self.expression()?;
            self.eat(";");
            return Ok(Stmt::Assign(name.clone(), compound, value));
        }

        let value = self.expression()?;
        self.eat(";");
        Ok(Stmt::Expr(value))
    }

    // -------------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr, String> {
        let test = self.binary(0)?;
        if !self.eat("?") {
            return Ok(test);
        }
        let then = self.expression()?;
        self.expect(":")?;
        let otherwise = self.expression()?;
        Ok(Expr::Conditional(Box::new(test), Box::new(then), Box::new(otherwise)))
    }

    fn binary(&mut self, level: usize) -> Result<Expr, String> {
        let Some(ops) = LEVELS.get(level) else {
            return self.unary();
        };
        let mut left = self.binary(level + 1)?;
        while let Some(op) = ops.iter().find(|(p, _)| self.at(p)).map(|(_, op)| *op) {
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        for (punct, op) in [("!", Unary::Not), ("-", Unary::Neg), ("+", Unary::Plus)] {
            if self.eat(punct) {
                return Ok(Expr::Unary(op, Box::new(self.unary()?)));
            }
        }
        if self.eat_word("typeof") {
            return Ok(Expr::Unary(Unary::TypeOf, Box::new(self.unary()?)));
        }
        // `new Error(m)` evaluates as the call `Error(m)`.
        if self.eat_word("new") {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                expr = Expr::Member(Box::new(expr), self.ident()?);
            } else if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat("(") {
                expr = Expr::Call(Box::new(expr), self.list(")")?);
            } else {
                return Ok(expr);
            }
        }
    }

    fn list(&mut self, close: &str) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.expression()?);
            if !self.eat(",") {
                self.expect(close)?;
                break;
            }
        }
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let Some(token) = self.bump() else {
            return Err("unexpected end of input".to_string());
        };
        match token {
            Token::Number(n) => Ok(Expr::Literal(Value::from(*n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s.clone()))),
            Token::Template { parts, exprs } => Ok(Expr::Template(parts.clone(), embedded(exprs)?)),
            Token::Punct("(") => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::Array(self.list("]")?)),
            Token::Punct("{") => self.object(),
            Token::Ident(word) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                "sql" => match self.peek() {
                    Some(Token::Template { parts, exprs }) => {
                        self.pos += 1;
                        Expr::Sql(parts.clone(), embedded(exprs)?)
                    }
                    _ => Expr::Ident(word.clone()),
                },
                _ => Expr::Ident(word.clone()),
            }),
            other => Err(format!("unexpected {}", describe(other))),
        }
    }

    fn object(&mut self) -> Result<Expr, String> {
        let mut fields = Vec::new();
        while !self.eat("}") {
            let key = match self.bump() {
                Some(Token::Ident(key) | Token::Str(key)) => key.clone(),
                Some(Token::Number(n)) => n.to_string(),
                other => {
                    let found = other.map_or_else(|| "end of input".to_string(), describe);
                    return Err(format!("expected a property name, found {found}"));
                }
            };
            let value = if self.eat(":") {
                self.expression()?
            } else {
                Expr::Ident(key.clone())
            };
            fields.push((key, value));
            if !self.eat(",") {
                self.expect("}")?;
                break;
            }
        }
        Ok(Expr::Object(fields))
    }
}

/// Parse the `${...}` sources of a template literal.
fn embedded(sources: &[String]) -> Result<Vec<Expr>, String> {
    sources
        .iter()
        .map(|src| {
            let tokens = tokenize(src);
            let mut parser = Parser::new(&tokens, 0);
            let expr = parser.expression()?;
            if parser.pos < tokens.len() {
                return Err(parser.unexpected("end of template expression"));
            }
            Ok(expr)
        })
        .collect()
}

fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::Punct("(") => depth += 1,
            Token::Punct(")") => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// A named function definition starting at token `at`: its name, the token its
/// parameters start at, and its shape.
fn definition_at(tokens: &[Token], at: usize) -> Option<(String, usize, Shape)> {
    let is_word = |i: usize, word: &str| matches!(tokens.get(i), Some(Token::Ident(w)) if w == word);
    let is_punct = |i: usize, punct: &str| matches!(tokens.get(i), Some(Token::Punct(p)) if *p == punct);
    let Some(Token::Ident(name)) = tokens.get(at + 1) else {
        return None;
    };

    if is_word(at, "function") && is_punct(at + 2, "(") {
        return Some((name.clone(), at + 2, Shape::Declaration));
    }
    let binding = is_word(at, "const") || is_word(at, "let") || is_word(at, "var");
    if !binding || !is_punct(at + 2, "=") {
        return None;
    }

    let mut start = at + 3;
    if is_word(start, "async") {
        start += 1;
    }
    if is_word(start, "function") {
        start += 1;
        if matches!(tokens.get(start), Some(Token::Ident(_))) {
            start += 1;
        }
        return is_punct(start, "(").then(|| (name.clone(), start, Shape::Declaration));
    }
    if is_punct(start, "(") {
        let close = matching_paren(tokens, start)?;
        return is_punct(close + 1, "=>").then(|| (name.clone(), start, Shape::Arrow));
    }
    let bare = matches!(tokens.get(start), Some(Token::Ident(_))) && is_punct(start + 1, "=>");
    bare.then(|| (name.clone(), start, Shape::BareArrow))
}

// =============================================================================
// SCRIPT
// =============================================================================

/// The functions of one loaded module.
#[derive(Debug, Default)]
pub struct Script {
    functions: BTreeMap<String, Result<Function, String>>,
}

impl Script {
    /// Load every function definition found in `src`. Later definitions of a
    /// name replace earlier ones.
    #[must_use]
    pub fn parse(src: &str) -> Self {
        let tokens = tokenize(src);
        let mut functions = BTreeMap::new();
        for at in 0..tokens.len() {
            if let Some((name, start, shape)) = definition_at(&tokens, at) {
                functions.insert(name, Parser::new(&tokens, start).function(shape));
            }
        }
        Self { functions }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Run `name` with positional arguments. Missing arguments take their
    /// default, or `null`.
    pub fn call(
        &self,
        runtime: &SqlRuntime<'_>,
        name: &str,
        args: &[Value],
    ) -> Result<Value, MleError> {
        self.invoke(runtime, name, args.to_vec(), 0)
    }

    /// The dispatch table exposing `names`. Names the script does not define
    /// are left out.
    #[must_use]
    pub fn into_dispatcher<I, S>(self, names: I) -> Dispatcher
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = Arc::new(self);
        let mut dispatcher = Dispatcher::new();
        for name in names.into_iter().map(Into::into) {
            if !script.functions.contains_key(&name) {
                continue;
            }
            let script = Arc::clone(&script);
            let target = name.clone();
            dispatcher.register(name, move |runtime, args| script.call(runtime, &target, args));
        }
        dispatcher
    }

    fn invoke(
        &self,
        runtime: &SqlRuntime<'_>,
        name: &str,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Value, MleError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(script_error(format!("maximum call depth exceeded in {name}")));
        }
        let function = match self.functions.get(name) {
            Some(Ok(function)) => function,
            Some(Err(reason)) => {
                return Err(script_error(format!("{name} uses unsupported syntax: {reason}")));
            }
            None => return Err(script_error(format!("{name} is not defined"))),
        };

        let mut frame = Frame {
            script: self,
            runtime,
            depth,
            locals: BTreeMap::new(),
        };
        let mut args = args.into_iter();
        for (param, default) in &function.params {
            let value = match (args.next(), default) {
                (Some(value), _) => value,
                (None, Some(default)) => frame.eval(default)?,
                (None, None) => Value::Null,
            };
            frame.locals.insert(param.clone(), value);
        }

        match frame.run(&function.body)? {
            Flow::Return(value) => Ok(value),
            Flow::Next => Ok(Value::Null),
        }
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

enum Flow {
    Next,
    Return(Value),
}

struct Frame<'a, 'r> {
    script: &'a Script,
    runtime: &'a SqlRuntime<'r>,
    depth: usize,
    locals: BTreeMap<String, Value>,
}

impl Frame<'_, '_> {
    fn run(&mut self, body: &[Stmt]) -> Result<Flow, MleError> {
        for stmt in body {
            if let Flow::Return(value) = self.exec(stmt)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, MleError> {
        match stmt {
            Stmt::Declare(name, value) => {
                let value = self.eval(value)?;
                self.locals.insert(name.clone(), value);
            }
            Stmt::Assign(name, compound, value) => {
                let value = self.eval(value)?;
                let current = self.lookup(name)?;
                let next = match compound {
                    Some(op) => binary(*op, current, value)?,
                    None => value,
                };
                self.locals.insert(name.clone(), next);
            }
            Stmt::If(test, then, otherwise) => {
                if truthy(&self.eval(test)?) {
                    return self.exec(then);
                }
                if let Some(otherwise) = otherwise {
                    return self.exec(otherwise);
                }
            }
            Stmt::Block(body) => return self.run(body),
            Stmt::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(value)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Throw(value) => return Err(script_error(display(&self.eval(value)?))),
            Stmt::Expr(value) => {
                self.eval(value)?;
            }
        }
        Ok(Flow::Next)
    }

    fn lookup(&self, name: &str) -> Result<Value, MleError> {
        self.locals
            .get(name)
            .cloned()
            .ok_or_else(|| script_error(format!("{name} is not defined")))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, MleError> {
        Ok(match expr {
            Expr::Literal(value) => value.clone(),
            Expr::Ident(name) => self.lookup(name)?,
            Expr::Template(parts, exprs) => {
                let mut text = String::new();
                for (idx, part) in parts.iter().enumerate() {
                    text.push_str(part);
                    if let Some(expr) = exprs.get(idx) {
                        text.push_str(&display(&self.eval(expr)?));
                    }
                }
                Value::String(text)
            }
            Expr::Sql(parts, exprs) => {
                let args = exprs
                    .iter()
                    .map(|expr| self.eval(expr).and_then(|v| BindValue::from_json(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                let template = Template::new(parts.iter().cloned(), args)?;
                self.runtime.sql(&template)?.to_value()
            }
            Expr::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                Value::Object(map)
            }
            Expr::Unary(op, operand) => {
                let operand = self.eval(operand)?;
                unary(*op, operand)?
            }
            Expr::Binary(Op::And, left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) { self.eval(right)? } else { left }
            }
            Expr::Binary(Op::Or, left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) { left } else { self.eval(right)? }
            }
            Expr::Binary(Op::Nullish, left, right) => {
                let left = self.eval(left)?;
                if left.is_null() { self.eval(right)? } else { left }
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, left, right)?
            }
            Expr::Conditional(test, then, otherwise) => {
                if truthy(&self.eval(test)?) {
                    self.eval(then)?
                } else {
                    self.eval(otherwise)?
                }
            }
            Expr::Member(object, name) => property(&self.eval(object)?, name),
            Expr::Index(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                element(&object, &index)
            }
            Expr::Call(callee, args) => self.call(callee, args)?,
        })
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value, MleError> {
        let args = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;

        match callee {
            Expr::Member(object, method) => {
                if let Expr::Ident(namespace) = object.as_ref() {
                    if !self.locals.contains_key(namespace)
                        && matches!(namespace.as_str(), "JSON" | "Math")
                    {
                        return static_call(namespace, method, &args);
                    }
                }
                let target = self.eval(object)?;
                method_call(&target, method, &args)
            }
            Expr::Ident(name)
                if !self.locals.contains_key(name) && self.script.functions.contains_key(name) =>
            {
                self.script.invoke(self.runtime, name, args, self.depth + 1)
            }
            Expr::Ident(name) => global_call(name, &args),
            _ => Err(script_error("only named functions can be called")),
        }
    }
}

fn script_error(message: impl Into<String>) -> MleError {
    MleError::Script(message.into())
}

fn overflow() -> MleError {
    script_error("integer overflow")
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() != Some(0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String conversion as concatenation performs it.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| if item.is_null() { String::new() } else { display(item) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
        other => other.to_string(),
    }
}

fn integer(value: &Value) -> Result<i64, MleError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| script_error(format!("{n} is not an integer"))),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Null => Ok(0),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| script_error(format!("'{s}' is not a number"))),
        other => Err(script_error(format!("{} is not a number", display(other)))),
    }
}

fn is_textual(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Array(_) | Value::Object(_))
}

fn binary(op: Op, left: Value, right: Value) -> Result<Value, MleError> {
    let checked = |result: Option<i64>| result.map(Value::from).ok_or_else(overflow);
    match op {
        Op::Add if is_textual(&left) || is_textual(&right) => {
            Ok(Value::String(display(&left) + &display(&right)))
        }
        Op::Add => checked(integer(&left)?.checked_add(integer(&right)?)),
        Op::Sub => checked(integer(&left)?.checked_sub(integer(&right)?)),
        Op::Mul => checked(integer(&left)?.checked_mul(integer(&right)?)),
        Op::Div | Op::Rem => {
            let (l, r) = (integer(&left)?, integer(&right)?);
            if r == 0 {
                return Err(script_error("division by zero"));
            }
            if op == Op::Rem {
                return checked(l.checked_rem(r));
            }
            if l.checked_rem(r) != Some(0) {
                return Err(script_error(format!("{l} / {r} has no integer result")));
            }
            checked(l.checked_div(r))
        }
        Op::StrictEq => Ok(Value::Bool(left == right)),
        Op::StrictNe => Ok(Value::Bool(left != right)),
        Op::Eq => Ok(Value::Bool(loose_equals(&left, &right))),
        Op::Ne => Ok(Value::Bool(!loose_equals(&left, &right))),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            let ordering = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                Op::Lt => ordering.is_lt(),
                Op::Le => ordering.is_le(),
                Op::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        // Short-circuiting operators are resolved before both sides exist.
        Op::And | Op::Or | Op::Nullish => Ok(right),
    }
}

fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_)) => match (integer(left), integer(right)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, MleError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Ok(integer(left)?.cmp(&integer(right)?)),
    }
}

fn unary(op: Unary, value: Value) -> Result<Value, MleError> {
    match op {
        Unary::Not => Ok(Value::Bool(!truthy(&value))),
        Unary::Neg => integer(&value)?
            .checked_neg()
            .map(Value::from)
            .ok_or_else(overflow),
        Unary::Plus => integer(&value).map(Value::from),
        Unary::TypeOf => {
            let name = match value {
                Value::Bool(_) => "boolean",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Null | Value::Array(_) | Value::Object(_) => "object",
            };
            Ok(Value::String(name.to_string()))
        }
    }
}

fn property(value: &Value, name: &str) -> Value {
    match (value, name) {
        (Value::String(s), "length") => Value::from(s.chars().count()),
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::Object(map), key) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn element(value: &Value, index: &Value) -> Value {
    let position = index.as_u64().and_then(|i| usize::try_from(i).ok());
    match (value, position) {
        (Value::Array(items), Some(i)) => items.get(i).cloned().unwrap_or(Value::Null),
        (Value::String(s), Some(i)) => s
            .chars()
            .nth(i)
            .map_or(Value::Null, |c| Value::String(c.to_string())),
        (Value::Object(map), _) => map.get(&display(index)).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn method_call(target: &Value, method: &str, args: &[Value]) -> Result<Value, MleError> {
    let text_arg = || args.first().map(display).unwrap_or_default();
    match (target, method) {
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "includes") => Ok(Value::Bool(s.contains(text_arg().as_str()))),
        (Value::String(s), "startsWith") => Ok(Value::Bool(s.starts_with(text_arg().as_str()))),
        (Value::String(s), "endsWith") => Ok(Value::Bool(s.ends_with(text_arg().as_str()))),
        (Value::Array(items), "join") => {
            let separator = args.first().map_or_else(|| ",".to_string(), display);
            let joined = items.iter().map(display).collect::<Vec<_>>().join(&separator);
            Ok(Value::String(joined))
        }
        (Value::Array(items), "includes") => {
            Ok(Value::Bool(items.contains(args.first().unwrap_or(&Value::Null))))
        }
        (_, "toString") => Ok(Value::String(display(target))),
        _ => Err(script_error(format!("{method} is not a function"))),
    }
}

fn static_call(namespace: &str, method: &str, args: &[Value]) -> Result<Value, MleError> {
    let first = args.first().unwrap_or(&Value::Null);
    match (namespace, method) {
        ("JSON", "stringify") => serde_json::to_string(first)
            .map(Value::String)
            .map_err(|e| MleError::Serialization(e.to_string())),
        ("JSON", "parse") => {
            serde_json::from_str(&display(first)).map_err(|e| script_error(e.to_string()))
        }
        ("Math", "abs") => integer(first)?
            .checked_abs()
            .map(Value::from)
            .ok_or_else(overflow),
        ("Math", "max" | "min") => {
            let values = args.iter().map(integer).collect::<Result<Vec<_>, _>>()?;
            let picked = if method == "max" {
                values.into_iter().max()
            } else {
                values.into_iter().min()
            };
            picked
                .map(Value::from)
                .ok_or_else(|| script_error(format!("Math.{method} needs an argument")))
        }
        _ => Err(script_error(format!("{namespace}.{method} is not a function"))),
    }
}

fn global_call(name: &str, args: &[Value]) -> Result<Value, MleError> {
    let first = args.first().unwrap_or(&Value::Null);
    match name {
        "String" | "Error" => Ok(Value::String(display(first))),
        "Number" | "parseInt" => integer(first).map(Value::from),
        "Boolean" => Ok(Value::Bool(truthy(first))),
        _ => Err(script_error(format!("{name} is not a function"))),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{QueryOutcome, RowSet, SchemaCache, SqlConnection};
    use crate::EngineError;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Rows {
        binds: RefCell<Vec<BindValue>>,
    }

    impl SqlConnection for Rows {
        fn execute(&self, sql: &str, binds: &[BindValue]) -> Result<QueryOutcome, EngineError> {
            if sql.contains("ALL_TAB_COLUMNS") {
                return Ok(QueryOutcome::Rows(RowSet {
                    columns: vec!["COLUMN_NAME".into(), "DATA_TYPE".into()],
                    rows: vec![vec![json!("ID"), json!("NUMBER")]],
                }));
            }
            self.binds.borrow_mut().extend_from_slice(binds);
            Ok(QueryOutcome::Rows(RowSet {
                columns: vec!["ID".into()],
                rows: vec![vec![json!(7)]],
            }))
        }
    }

    fn run(src: &str, name: &str, args: &[Value]) -> Result<Value, MleError> {
        let conn = Rows::default();
        let cache = SchemaCache::default();
        Script::parse(src).call(&SqlRuntime::new(&conn, &cache), name, args)
    }

    const BUNDLE: &str = "(function (global, factory) {\n\
        \ttypeof exports === 'object' && typeof module !== 'undefined' ? factory(exports) :\n\
        \t(global = global || self, factory(global.app = {}));\n\
        }(this, function (exports) { 'use strict';\n\
        function double(x) { return x * 2; }\n\
        function quad(x) { return double(double(x)); }\n\
        const label = (id, prefix = 'n') => prefix + id;\n\
        exports.quad = quad;\n\
        exports.label = label;\n\
        }));\n";

    #[test]
    fn finds_functions_inside_the_bundle_wrapper() {
        let script = Script::parse(BUNDLE);
        assert_eq!(script.names().collect::<Vec<_>>(), vec!["double", "label", "quad"]);
        assert_eq!(run(BUNDLE, "quad", &[json!(3)]).expect("quad"), json!(12));
        assert_eq!(run(BUNDLE, "label", &[json!(7)]).expect("label"), json!("n7"));
        assert_eq!(run(BUNDLE, "label", &[json!(7), json!("#")]).expect("label"), json!("#7"));
    }

    #[test]
    fn dispatcher_exposes_only_requested_names() {
        let dispatcher = Script::parse(BUNDLE).into_dispatcher(["quad", "missing"]);
        assert_eq!(dispatcher.names().collect::<Vec<_>>(), vec!["quad"]);

        let conn = Rows::default();
        let cache = SchemaCache::default();
        let runtime = SqlRuntime::new(&conn, &cache);
        assert_eq!(dispatcher.evaluate(&runtime, "quad", &[json!(5)]).expect("quad"), "20");
    }

    #[test]
    fn statements_branch_assign_and_throw() {
        let src = "function grade(score, pass = 50) {\n\
                     let label = 'fail';\n\
                     if (score < 0) { throw new Error('negative score'); }\n\
                     else if (score >= pass) label = 'pass';\n\
                     label += '!';\n\
                     return `${label}:${score}`;\n\
                   }";
        assert_eq!(run(src, "grade", &[json!(70)]).expect("pass"), json!("pass!:70"));
        assert_eq!(run(src, "grade", &[json!(70), json!(80)]).expect("fail"), json!("fail!:70"));

        let err = run(src, "grade", &[json!(-1)]).expect_err("throws");
        assert_eq!(err.to_string(), "Script error: negative score");
    }

    #[test]
    fn arithmetic_is_integral_and_checked() {
        let src = "function half(n) { return n / 2; }\n\
                   function big() { return 9223372036854775807 + 1; }\n\
                   function rest(n) { return n % 4 - -1; }";
        assert_eq!(run(src, "half", &[json!(8)]).expect("half"), json!(4));
        assert!(run(src, "half", &[json!(3)]).is_err());
        assert_eq!(run(src, "big", &[]).expect_err("overflow").to_string(), "Script error: integer overflow");
        assert_eq!(run(src, "rest", &[json!(10)]).expect("rest"), json!(3));
    }

    #[test]
    fn objects_strings_and_builtins() {
        let src = "const describe = (name, tags) => ({\n\
                     name: name.toUpperCase(),\n\
                     count: tags.length,\n\
                     joined: tags.join('-'),\n\
                     first: tags[0] ?? 'none',\n\
                     widest: Math.max(1, tags.length, 2),\n\
                   });\n\
                   const encode = v => JSON.stringify({ v });";
        assert_eq!(
            run(src, "describe", &[json!("ada"), json!(["x", "y", "z"])]).expect("describe"),
            json!({ "name": "ADA", "count": 3, "joined": "x-y-z", "first": "x", "widest": 3 })
        );
        assert_eq!(run(src, "encode", &[json!(1)]).expect("encode"), json!("{\"v\":1}"));
    }

    #[test]
    fn sql_templates_bind_their_arguments() {
        let src = "function byId(id) { return sql`select * from t where id = ${id}`; }";
        let conn = Rows::default();
        let cache = SchemaCache::default();
        let value = Script::parse(src)
            .call(&SqlRuntime::new(&conn, &cache), "byId", &[json!(7)])
            .expect("query");

        assert_eq!(value, json!([{ "id": 7 }]));
        assert_eq!(conn.binds.borrow().as_slice(), &[BindValue::from(7)]);
    }

    #[test]
    fn unreadable_function_loads_but_fails_when_called() {
        let src = "function ratio(a) { return a * 1.5; }\nfunction one() { return 1; }";
        assert_eq!(run(src, "one", &[]).expect("one"), json!(1));

        let err = run(src, "ratio", &[json!(2)]).expect_err("unsupported");
        assert!(err.to_string().contains("ratio uses unsupported syntax"));
        assert!(run(src, "absent", &[]).is_err());
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        let src = "function forever(n) { return forever(n + 1); }";
        let err = run(src, "forever", &[json!(0)]).expect_err("depth");
        assert!(err.to_string().contains("maximum call depth"));
    }
}
