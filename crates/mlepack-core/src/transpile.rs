//! # Type Stripping
//!
//! Lowers annotated module source to plain script by erasing the type syntax
//! the declaration scanner understands:
//! - parameter and return annotations, optional `?` markers and parameter
//!   modifiers on functions and parenthesised arrows
//! - annotations on `const`, `let` and `var` bindings
//! - generic parameter lists on functions
//! - `interface`, `type` alias, `declare` and `import type` statements
//! - `as Type` casts
//!
//! Comments and string literals are copied through untouched, as are class
//! members and object-literal methods.

use crate::MleError;
use crate::scan::{
    ReturnEnd, find_close, find_top_level, parse_return, skip_comment, skip_string, skip_ws,
    split_top_level, unbalanced,
};
use regex::Regex;
use std::sync::LazyLock;

static INTERFACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:export\s+)?(?:declare\s+)?interface\s+[A-Za-z_$][\w$]*[^{]*\{")
        .expect("interface pattern")
});

static TYPE_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:export\s+)?(?:declare\s+)?type\s+[A-Za-z_$][\w$]*\s*(?:<[^>]*>)?\s*=[^=]")
        .expect("type alias pattern")
});

static TYPE_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:import\s+type\b|export\s+type\s*\{)").expect("type-only clause pattern")
});

static DECLARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:export\s+)?declare\s+").expect("declare pattern"));

static MODULE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:import\s*[\w$*{'"]|export\s*[{*])"#).expect("module clause pattern")
});

static FUNCTION_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?function\b\s*\*?\s*(?:[A-Za-z_$][\w$]*)?\s*")
        .expect("function head pattern")
});

static BINDING_ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:const|let|var)\s+[A-Za-z_$][\w$]*\s*:").expect("binding annotation pattern")
});

static CAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+as\s+(?:const\b|[A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)")
        .expect("cast pattern")
});

const MODIFIERS: [&str; 4] = ["public ", "private ", "protected ", "readonly "];

/// Words after which a parenthesised list can still open an arrow function.
const ARROW_LEADERS: [&[u8]; 8] = [
    b"async", b"return", b"yield", b"await", b"case", b"else", b"in", b"of",
];

/// Erase type syntax from `src`.
pub fn strip_types(src: &str) -> Result<String, MleError> {
    let bytes = src.as_bytes();
    let mut out = String::with_capacity(src.len());
    let mut copied = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        if let Some(end) = skip_comment(bytes, pos) {
            pos = end;
            continue;
        }
        let c = bytes[pos];
        if matches!(c, b'"' | b'\'' | b'`') {
            pos = skip_string(bytes, pos);
            continue;
        }
        if !c.is_ascii() {
            pos += 1;
            continue;
        }
        let Some((replacement, end)) = rewrite_at(src, pos)? else {
            pos += 1;
            continue;
        };
        out.push_str(&src[copied..pos]);
        out.push_str(&replacement);
        copied = end;
        pos = end;
    }

    out.push_str(&src[copied..]);
    Ok(out)
}

fn rewrite_at(src: &str, pos: usize) -> Result<Option<(String, usize)>, MleError> {
    let bytes = src.as_bytes();
    let c = bytes[pos];
    if c == b'(' {
        return arrow_params(src, pos);
    }
    if c.is_ascii_whitespace() {
        return Ok(cast_end(src, pos).map(|end| (String::new(), end)));
    }
    if !is_word_start(bytes, pos) {
        return Ok(None);
    }

    let rest = &src[pos..];
    if at_statement_start(bytes, pos) {
        if let Some(m) = INTERFACE.find(rest) {
            let open = pos + m.end() - 1;
            let close = find_close(bytes, open).ok_or_else(|| unbalanced(open))?;
            return Ok(Some((String::new(), close + 1)));
        }
        if TYPE_ALIAS.is_match(rest) || TYPE_ONLY.is_match(rest) {
            return Ok(Some((String::new(), statement_end(bytes, pos, false))));
        }
        if DECLARE.is_match(rest) {
            return Ok(Some((String::new(), statement_end(bytes, pos, true))));
        }
        if MODULE_CLAUSE.is_match(rest) {
            let end = statement_end(bytes, pos, false);
            return Ok(Some((src[pos..end].to_string(), end)));
        }
    }
    if FUNCTION_HEAD.is_match(rest) {
        return function(src, pos);
    }
    if let Some(m) = BINDING_ANNOTATION.find(rest) {
        return Ok(Some(binding(src, pos, pos + m.end() - 1)));
    }
    Ok(None)
}

// =============================================================================
// FUNCTIONS AND BINDINGS
// =============================================================================

fn function(src: &str, pos: usize) -> Result<Option<(String, usize)>, MleError> {
    let bytes = src.as_bytes();
    let Some(m) = FUNCTION_HEAD.find(&src[pos..]) else {
        return Ok(None);
    };
    let head = &src[pos..pos + m.end()];
    let mut open = pos + m.end();
    if bytes.get(open) == Some(&b'<') {
        open = skip_angle(bytes, open)
            .map(|after| skip_ws(bytes, after))
            .ok_or_else(|| unbalanced(open))?;
    }
    if bytes.get(open) != Some(&b'(') {
        return Ok(None);
    }

    let close = find_close(bytes, open).ok_or_else(|| unbalanced(open))?;
    let mut text = format!("{head}({})", strip_params(&src[open + 1..close])?);
    let (annotation, after) = parse_return(src, close + 1, ReturnEnd::Body);
    if annotation.is_none() {
        return Ok(Some((text, close + 1)));
    }
    text.push(' ');
    Ok(Some((text, after)))
}

fn arrow_params(src: &str, open: usize) -> Result<Option<(String, usize)>, MleError> {
    let bytes = src.as_bytes();
    if follows_callee(bytes, open) {
        return Ok(None);
    }
    let Some(close) = find_close(bytes, open) else {
        return Ok(None);
    };
    let (annotation, after) = parse_return(src, close + 1, ReturnEnd::Arrow);
    let arrow = skip_ws(bytes, after);
    if !bytes[arrow..].starts_with(b"=>") || annotation.as_deref().is_some_and(|a| a.contains(';'))
    {
        return Ok(None);
    }

    let mut text = format!("({})", strip_params(&src[open + 1..close])?);
    if annotation.is_none() {
        return Ok(Some((text, close + 1)));
    }
    text.push(' ');
    Ok(Some((text, arrow)))
}

fn binding(src: &str, pos: usize, colon: usize) -> (String, usize) {
    let bytes = src.as_bytes();
    let ty = &bytes[colon + 1..];
    let ty_end = find_top_level(ty, |b, next| {
        (b == b'=' && next != Some(b'>')) || matches!(b, b';' | b',' | b'\n' | b')')
    })
    .unwrap_or(ty.len());

    let end = colon + 1 + ty_end;
    let mut text = src[pos..colon].trim_end().to_string();
    if bytes.get(end) == Some(&b'=') {
        text.push(' ');
    }
    (text, end)
}

fn strip_params(list: &str) -> Result<String, MleError> {
    let mut params = Vec::new();
    for part in split_top_level(list, b',') {
        if let Some(param) = strip_param(part)? {
            params.push(param);
        }
    }
    Ok(params.join(", "))
}

fn strip_param(text: &str) -> Result<Option<String>, MleError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let (spread, text) = text.strip_prefix("...").map_or(("", text), |t| ("...", t));
    let text = MODIFIERS
        .iter()
        .fold(text, |t, m| t.strip_prefix(m).map_or(t, str::trim_start));

    let bytes = text.as_bytes();
    let name_end = find_top_level(bytes, |b, _| matches!(b, b'?' | b':' | b'='))
        .unwrap_or(bytes.len());
    let name = text[..name_end].trim();
    if name == "this" {
        return Ok(None);
    }

    let mut param = format!("{spread}{name}");
    if let Some(eq) = find_top_level(bytes, |b, next| b == b'=' && next != Some(b'>')) {
        param.push_str(" = ");
        param.push_str(&strip_types(text[eq + 1..].trim())?);
    }
    Ok(Some(param))
}

// =============================================================================
// CASTS AND STATEMENTS
// =============================================================================

fn cast_end(src: &str, pos: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let prev = bytes[..pos].last().copied()?;
    if !(is_ident(prev) || matches!(prev, b')' | b']' | b'"' | b'\'' | b'`')) {
        return None;
    }
    let m = CAST.find(&src[pos..])?;
    let mut end = pos + m.end();
    if bytes.get(end) == Some(&b'<') {
        end = skip_angle(bytes, end)?;
    }
    while bytes[end..].starts_with(b"[]") {
        end += 2;
    }
    Some(end)
}

/// End of the statement starting at `pos`: past a top-level `;`, or at a line
/// break that does not continue it. With `blocks`, a top-level `{ ... }` that
/// is not a type literal also closes the statement.
fn statement_end(bytes: &[u8], pos: usize, blocks: bool) -> usize {
    let mut depth = 0usize;
    let mut last = None;
    let mut i = pos;

    while i < bytes.len() {
        if let Some(end) = skip_comment(bytes, i) {
            i = end;
            continue;
        }
        let b = bytes[i];
        match b {
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i);
                last = Some(b);
                continue;
            }
            b'{' if depth == 0
                && blocks
                && !matches!(last, Some(b':' | b'=' | b'|' | b'&' | b'<' | b',')) =>
            {
                return find_close(bytes, i).map_or(bytes.len(), |c| c + 1);
            }
            b'(' | b'[' | b'{' | b'<' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b'>' if i > 0 && bytes[i - 1] != b'=' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => return i + 1,
            b'\n' if depth == 0 && !continues(last, bytes, i) => return i,
            _ => {}
        }
        if !b.is_ascii_whitespace() {
            last = Some(b);
        }
        i += 1;
    }
    bytes.len()
}

fn continues(last: Option<u8>, bytes: &[u8], newline: usize) -> bool {
    let next = bytes.get(skip_ws(bytes, newline)).copied();
    matches!(last, Some(b'=' | b'|' | b'&' | b',')) || matches!(next, Some(b'|' | b'&'))
}

// =============================================================================
// LEXICAL HELPERS
// =============================================================================

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn is_word_start(bytes: &[u8], pos: usize) -> bool {
    let c = bytes[pos];
    let starts = c.is_ascii_alphabetic() || c == b'_' || c == b'$';
    starts && !bytes[..pos].last().is_some_and(|&b| is_ident(b) || b == b'.')
}

fn at_statement_start(bytes: &[u8], pos: usize) -> bool {
    let before = &bytes[..pos];
    match before.iter().rposition(|b| !b.is_ascii_whitespace()) {
        None => true,
        Some(at) => matches!(before[at], b';' | b'{' | b'}') || before[at + 1..].contains(&b'\n'),
    }
}

/// A `(` directly after a callee opens an argument list, not arrow parameters.
fn follows_callee(bytes: &[u8], open: usize) -> bool {
    let before = &bytes[..open];
    let Some(at) = before.iter().rposition(|b| !b.is_ascii_whitespace()) else {
        return false;
    };
    match before[at] {
        b'?' | b')' | b']' => true,
        b if is_ident(b) => {
            let start = before[..at].iter().rposition(|&b| !is_ident(b)).map_or(0, |p| p + 1);
            !ARROW_LEADERS.contains(&&before[start..=at])
        }
        _ => false,
    }
}

/// Position just past the `>` closing the `<` at `open`.
fn skip_angle(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'<' => depth += 1,
            b'>' if i > 0 && bytes[i - 1] != b'=' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(src: &str) -> String {
        strip_types(src).expect("strip")
    }

    #[test]
    fn strips_parameter_and_return_annotations() {
        assert_eq!(
            strip("export function add(a: number, b: number): number { return a + b; }"),
            "export function add(a, b) { return a + b; }"
        );
    }

    #[test]
    fn strips_arrow_binding() {
        assert_eq!(
            strip("export const greet = (who: string): string => 'hi ' + who;"),
            "export const greet = (who) => 'hi ' + who;"
        );
    }

    #[test]
    fn optional_markers_and_modifiers_are_dropped() {
        assert_eq!(
            strip("function f(this: Ctx, a?: number, readonly b: string, ...rest: number[]) {}"),
            "function f(a, b, ...rest) {}"
        );
    }

    #[test]
    fn generics_are_dropped_from_functions() {
        assert_eq!(
            strip("function id<T extends object>(x: T): T { return x; }"),
            "function id(x) { return x; }"
        );
    }

    #[test]
    fn defaults_keep_their_stripped_value() {
        assert_eq!(
            strip("function f(cb: (n: number) => number = (n: number) => n) {}"),
            "function f(cb = (n) => n) {}"
        );
    }

    #[test]
    fn type_declarations_disappear() {
        let out = strip(
            "interface Opts {\n  a: number;\n}\n\
             type Id = number\n  | string;\n\
             import type { Row } from './row';\n\
             declare const host: { name: string };\n\
             export function f(o?: Opts): Id { return 1; }\n",
        );
        assert!(!out.contains("interface"));
        assert!(!out.contains("type Id"));
        assert!(!out.contains("import type"));
        assert!(!out.contains("declare"));
        assert!(out.contains("export function f(o) { return 1; }"));
    }

    #[test]
    fn binding_annotations_and_casts_are_removed() {
        assert_eq!(
            strip("const n: number = (x as number) + 1;\nlet s: Array<string>;"),
            "const n = (x) + 1;\nlet s;"
        );
        assert_eq!(strip("const v = raw as unknown as Foo[];"), "const v = raw;");
    }

    #[test]
    fn calls_and_ternaries_are_not_arrows() {
        let src = "const r = ok ? f(x) : g(y);\nconst h = (v) => v;";
        assert_eq!(strip(src), src);
    }

    #[test]
    fn strings_comments_and_import_renames_are_untouched() {
        let src = "import { a as b } from './x';\n\
                   const s = \"(x: number): number\"; // function f(y: string) {}\n\
                   /* const z: number = 1 */";
        assert_eq!(strip(src), src);
    }

    #[test]
    fn nested_functions_are_stripped() {
        assert_eq!(
            strip("function outer(a: number) { const inner = function (b: string): string { return b; }; }"),
            "function outer(a) { const inner = function (b) { return b; }; }"
        );
    }
}
