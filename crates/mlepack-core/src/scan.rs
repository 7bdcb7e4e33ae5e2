//! # Declaration Scanner
//!
//! Produces the [`Module`] syntax tree the signature extractor consumes from
//! module source text. Only declarations are recognised; statement bodies are
//! skipped by bracket matching.
//!
//! Recognised shapes (each optionally prefixed with `export`):
//! - `function name(params): Ret { ... }` (also `async`, generic, `default`)
//! - `const name = function (params): Ret { ... }`
//! - `const name = (params): Ret => ...` and `const name = x => ...`
//! - `namespace Name { ... }` / `module Name { ... }`, scanned recursively
//!
//! Comments and string literals are skipped so that braces inside them do not
//! disturb nesting.

use crate::MleError;
use crate::signature::{Expr, FunctionNode, Item, Module, ParamNode};
use regex::Regex;
use std::sync::LazyLock;

static FUNCTION_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(export\s+)?(?:default\s+)?(?:declare\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*(?:<[^>]*>)?\s*\(",
    )
    .expect("function declaration pattern")
});

static BINDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*")
        .expect("binding pattern")
});

static BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(export\s+)?(?:declare\s+)?(?:namespace|module)\s+([A-Za-z_$][\w$.]*)\s*\{")
        .expect("block pattern")
});

static FUNCTION_EXPR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?function\b\s*\*?\s*(?:[A-Za-z_$][\w$]*)?\s*(?:<[^>]*>)?\s*\(")
        .expect("function expression pattern")
});

static ARROW_PARENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?(?:<[^>]*>\s*)?\(").expect("arrow pattern")
});

static ARROW_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?([A-Za-z_$][\w$]*)\s*=>").expect("bare arrow pattern")
});

/// Scan module source into a syntax tree.
pub fn parse_module(src: &str) -> Result<Module, MleError> {
    Ok(Module {
        items: scan_items(src)?,
    })
}

fn scan_items(src: &str) -> Result<Vec<Item>, MleError> {
    let bytes = src.as_bytes();
    let mut items = Vec::new();
    let mut pos = 0;
    let mut depth = 0usize;
    let mut statement_start = true;

    while pos < bytes.len() {
        let c = bytes[pos];

        if let Some(end) = skip_comment(bytes, pos) {
            pos = end;
            continue;
        }
        if c.is_ascii_whitespace() {
            if c == b'\n' && depth == 0 {
                statement_start = true;
            }
            pos += 1;
            continue;
        }
        if depth == 0 && statement_start {
            if let Some((item, end)) = scan_item(src, pos)? {
                items.push(item);
                pos = end;
                statement_start = true;
                continue;
            }
        }
        statement_start = false;

        match c {
            b'"' | b'\'' | b'`' => {
                pos = skip_string(bytes, pos);
                continue;
            }
            b'{' | b'(' | b'[' => depth += 1,
            b'}' | b')' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && c == b'}' {
                    statement_start = true;
                }
            }
            b';' if depth == 0 => statement_start = true,
            _ => {}
        }
        pos += 1;
    }

    Ok(items)
}

/// Try to recognise a declaration starting at `pos`. Returns the item and the
/// position scanning should resume from.
fn scan_item(src: &str, pos: usize) -> Result<Option<(Item, usize)>, MleError> {
    let rest = &src[pos..];
    let bytes = src.as_bytes();

    if let Some(caps) = FUNCTION_DECL.captures(rest) {
        let exported = caps.get(1).is_some();
        let name = caps.get(2).map(|m| m.as_str().to_string());
        let open = pos + caps.get(0).map_or(0, |m| m.end()) - 1;
        let (params, close) = parse_params(src, open)?;
        let (return_annotation, after) = parse_return(src, close + 1, ReturnEnd::Body);

        let mut end = skip_ws(bytes, after);
        if bytes.get(end) == Some(&b'{') {
            end = find_close(bytes, end)
                .ok_or_else(|| unbalanced(end))?
                + 1;
        } else if bytes.get(end) == Some(&b';') {
            end += 1;
        }

        let function = FunctionNode {
            name,
            params,
            return_annotation,
        };
        return Ok(Some((Item::Function { exported, function }, end)));
    }

    if let Some(caps) = BLOCK.captures(rest) {
        let exported = caps.get(1).is_some();
        let name = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let open = pos + caps.get(0).map_or(0, |m| m.end()) - 1;
        let close = find_close(bytes, open).ok_or_else(|| unbalanced(open))?;
        let items = scan_items(&src[open + 1..close])?;
        return Ok(Some((
            Item::Block {
                exported,
                name,
                items,
            },
            close + 1,
        )));
    }

    if let Some(caps) = BINDING.captures(rest) {
        let exported = caps.get(1).is_some();
        let name = caps.get(2).map_or("", |m| m.as_str()).to_string();
        let init = pos + caps.get(0).map_or(0, |m| m.end());
        let (init_expr, end) = scan_initializer(src, init)?;
        return Ok(Some((
            Item::Binding {
                exported,
                name,
                init: init_expr,
            },
            end,
        )));
    }

    Ok(None)
}

fn scan_initializer(src: &str, init: usize) -> Result<(Expr, usize), MleError> {
    let rest = &src[init..];
    let bytes = src.as_bytes();

    if let Some(m) = FUNCTION_EXPR.find(rest) {
        let open = init + m.end() - 1;
        let (params, close) = parse_params(src, open)?;
        let (return_annotation, after) = parse_return(src, close + 1, ReturnEnd::Body);
        let function = FunctionNode {
            name: None,
            params,
            return_annotation,
        };
        return Ok((Expr::Function(function), after));
    }

    if let Some(m) = ARROW_PARENS.find(rest) {
        let open = init + m.end() - 1;
        let (params, close) = parse_params(src, open)?;
        let (return_annotation, after) = parse_return(src, close + 1, ReturnEnd::Arrow);
        let arrow = skip_ws(bytes, after);
        if src[arrow..].starts_with("=>") {
            let function = FunctionNode {
                name: None,
                params,
                return_annotation,
            };
            return Ok((Expr::Function(function), arrow + 2));
        }
        return Ok((Expr::Other, init));
    }

    if let Some(caps) = ARROW_BARE.captures(rest) {
        let param = ParamNode {
            name: caps.get(1).map_or("", |m| m.as_str()).to_string(),
            annotation: None,
        };
        let function = FunctionNode {
            name: None,
            params: vec![param],
            return_annotation: None,
        };
        let end = init + caps.get(0).map_or(0, |m| m.end());
        return Ok((Expr::Function(function), end));
    }

    Ok((Expr::Other, init))
}

// =============================================================================
// SIGNATURE PIECES
// =============================================================================

fn parse_params(src: &str, open: usize) -> Result<(Vec<ParamNode>, usize), MleError> {
    let close = find_close(src.as_bytes(), open).ok_or_else(|| unbalanced(open))?;
    let params = split_top_level(&src[open + 1..close], b',')
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(parse_param)
        .collect();
    Ok((params, close))
}

fn parse_param(text: &str) -> ParamNode {
    let text = text.trim_start_matches("...");
    let text = ["public ", "private ", "protected ", "readonly "]
        .iter()
        .fold(text, |t, m| t.strip_prefix(m).unwrap_or(t))
        .trim();

    let bytes = text.as_bytes();
    let name_end = find_top_level(bytes, |b, _| matches!(b, b'?' | b':' | b'='))
        .unwrap_or(bytes.len());
    let name = text[..name_end].trim().to_string();

    let annotation = find_top_level(bytes, |b, _| b == b':').map(|colon| {
        let ty = &text[colon + 1..];
        let ty_end = find_top_level(ty.as_bytes(), |b, next| b == b'=' && next != Some(b'>'))
            .unwrap_or(ty.len());
        ty[..ty_end].trim().to_string()
    });

    ParamNode { name, annotation }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReturnEnd {
    /// Annotation ends where the `{ ... }` body (or `;`) begins.
    Body,
    /// Annotation ends at `=>`.
    Arrow,
}

/// Parse an optional `: Type` after a parameter list.
pub(crate) fn parse_return(src: &str, from: usize, until: ReturnEnd) -> (Option<String>, usize) {
    let bytes = src.as_bytes();
    let colon = skip_ws(bytes, from);
    if bytes.get(colon) != Some(&b':') {
        return (None, from);
    }

    let start = colon + 1;
    let mut i = skip_ws(bytes, start);
    if bytes.get(i) == Some(&b'{') {
        // Object-literal type: consume it whole.
        i = find_close(bytes, i).map_or(bytes.len(), |c| c + 1);
    }

    let mut depth = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match b {
            b'(' | b'[' | b'<' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b'>' if i > 0 && bytes[i - 1] != b'=' => depth = depth.saturating_sub(1),
            b'{' | b';' if depth == 0 && until == ReturnEnd::Body => break,
            b'=' if depth == 0 && next == Some(b'>') && until == ReturnEnd::Arrow => break,
            _ => {}
        }
        i += 1;
    }

    let ty = src[start..i].trim();
    if ty.is_empty() {
        (None, i)
    } else {
        (Some(ty.to_string()), i)
    }
}

// =============================================================================
// LEXICAL HELPERS
// =============================================================================

pub(crate) fn unbalanced(at: usize) -> MleError {
    MleError::Resolve(format!("unbalanced brackets starting at byte {at}"))
}

pub(crate) fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// If a comment starts at `pos`, return the position just past it.
pub(crate) fn skip_comment(bytes: &[u8], pos: usize) -> Option<usize> {
    if bytes.get(pos) != Some(&b'/') {
        return None;
    }
    match bytes.get(pos + 1) {
        Some(b'/') => Some(
            bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |n| pos + n),
        ),
        Some(b'*') => Some(
            bytes[pos + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(bytes.len(), |n| pos + 2 + n + 2),
        ),
        _ => None,
    }
}

/// Skip a quoted literal starting at `pos`; returns the position after the closing quote.
pub(crate) fn skip_string(bytes: &[u8], pos: usize) -> usize {
    let quote = bytes[pos];
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Find the bracket closing the one at `open`, skipping strings and comments.
pub(crate) fn find_close(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some(end) = skip_comment(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'{' | b'(' | b'[' => depth += 1,
            b'}' | b')' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// First position at bracket depth zero where `pred(byte, next)` holds.
pub(crate) fn find_top_level(bytes: &[u8], pred: impl Fn(u8, Option<u8>) -> bool) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        let next = bytes.get(i + 1).copied();
        if depth == 0 && pred(b, next) {
            return Some(i);
        }
        match b {
            b'(' | b'[' | b'{' | b'<' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b'>' if i > 0 && bytes[i - 1] != b'=' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

pub(crate) fn split_top_level(s: &str, sep: u8) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = s;
    while let Some(at) = find_top_level(rest.as_bytes(), |b, _| b == sep) {
        parts.push(&rest[..at]);
        rest = &rest[at + 1..];
    }
    parts.push(rest);
    parts
}

// =============================================================================
// TESTS
// =============================================================================
