//! Pre-pass: constant classification and box analysis (§4.3).

use crate::ast::Expr;
use crate::env::FreeVarList;
use std::collections::HashSet;

/// A top-level `define` becomes a constant iff its value is a non-list,
/// compile-time-computable immediate (fixnum, char, bool, nil) *and* no
/// `(set! name ...)` occurs anywhere in the program.
pub fn classify_constants(program_exprs: &[Expr]) -> HashSet<String> {
    let set_targets = collect_set_targets(program_exprs);
    let mut constants = HashSet::new();
    for e in program_exprs {
        if let Some(items) = e.as_list() {
            if items.first().and_then(|h| h.as_symbol()) != Some("define") {
                continue;
            }
            // Long form `(define (name args...) body...)` is always a
            // mutable function binding, never a constant.
            if items.len() >= 2 && items[1].as_list().is_some() {
                continue;
            }
            if items.len() != 3 {
                continue;
            }
            let Some(name) = items[1].as_symbol() else {
                continue;
            };
            if set_targets.contains(name) {
                continue;
            }
            if is_immediate_literal(&items[2]) {
                constants.insert(name.to_string());
            }
        }
    }
    constants
}

fn is_immediate_literal(e: &Expr) -> bool {
    matches!(
        e,
        Expr::Fixnum(..)
            | Expr::AsciiChar(..)
            | Expr::UnicodeChar(..)
            | Expr::Boolean(..)
            | Expr::Null(..)
    )
}

fn collect_set_targets(exprs: &[Expr]) -> HashSet<String> {
    let mut targets = HashSet::new();
    for e in exprs {
        walk_for_set(e, &mut targets);
    }
    targets
}

fn walk_for_set(e: &Expr, targets: &mut HashSet<String>) {
    if let Some(items) = e.as_list() {
        if items.first().and_then(|h| h.as_symbol()) == Some("set!") {
            if let Some(name) = items.get(1).and_then(|e| e.as_symbol()) {
                targets.insert(name.to_string());
            }
        }
        for item in items {
            walk_for_set(item, targets);
        }
    }
}

/// Per-lambda box analysis: find every `set!` in `body` whose target is
/// not resolved by `locals` (meaning it is captured from an enclosing
/// lambda) and mark the corresponding entry in `free_vars` as boxed.
///
/// Invoked by the generator when it enters a lambda body, per spec.
pub fn mark_boxed_captures(body: &[Expr], locals: &HashSet<String>, free_vars: &mut FreeVarList) {
    for e in body {
        walk_for_boxing(e, locals, free_vars);
    }
}

fn walk_for_boxing(e: &Expr, locals: &HashSet<String>, free_vars: &mut FreeVarList) {
    if let Some(items) = e.as_list() {
        if items.first().and_then(|h| h.as_symbol()) == Some("set!") {
            if let Some(name) = items.get(1).and_then(|e| e.as_symbol()) {
                if !locals.contains(name) {
                    free_vars.capture(name);
                    free_vars.mark_boxed(name);
                }
            }
        }
        // Don't descend into nested lambda bodies via the generic walk:
        // a `set!` inside them targeting *this* scope's locals still
        // needs the box indirection at our binding site, handled
        // separately; their own fresh capture list is built when the
        // generator enters them.
        if items.first().and_then(|h| h.as_symbol()) == Some("lambda") {
            continue_after_lambda_header(items, locals, free_vars);
            return;
        }
        for item in items {
            walk_for_boxing(item, locals, free_vars);
        }
    }
}

/// Nested lambdas still contribute captures of the *outer* scope's locals
/// if they reference them without redeclaring; we only need to know that a
/// `set!` inside a nested lambda targeting an outer-local forces boxing
/// here too, since the box indirection must exist at the binding site.
fn continue_after_lambda_header(items: &[Expr], locals: &HashSet<String>, free_vars: &mut FreeVarList) {
    let bound: HashSet<String> = items
        .get(1)
        .and_then(|e| e.as_list())
        .map(|params| {
            params
                .iter()
                .filter_map(|p| p.as_symbol().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    for stmt in items.iter().skip(2) {
        walk_for_boxing_excluding(stmt, locals, &bound, free_vars);
    }
}

fn walk_for_boxing_excluding(
    e: &Expr,
    outer_locals: &HashSet<String>,
    shadowed: &HashSet<String>,
    free_vars: &mut FreeVarList,
) {
    if let Some(items) = e.as_list() {
        if items.first().and_then(|h| h.as_symbol()) == Some("set!") {
            if let Some(name) = items.get(1).and_then(|e| e.as_symbol()) {
                if outer_locals.contains(name) && !shadowed.contains(name) {
                    free_vars.capture(name);
                    free_vars.mark_boxed(name);
                }
            }
        }
        for item in items {
            walk_for_boxing_excluding(item, outer_locals, shadowed, free_vars);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn parse(src: &str) -> Vec<Expr> {
        Parser::new(src).parse().unwrap().exprs
    }

    #[test]
    fn immutable_immediate_define_is_constant() {
        let exprs = parse("(define x 42)");
        let consts = classify_constants(&exprs);
        assert!(consts.contains("x"));
    }

    #[test]
    fn define_with_set_is_not_constant() {
        let exprs = parse("(define x 42) (set! x 43)");
        let consts = classify_constants(&exprs);
        assert!(!consts.contains("x"));
    }

    #[test]
    fn function_define_is_never_constant() {
        let exprs = parse("(define (f n) n)");
        let consts = classify_constants(&exprs);
        assert!(!consts.contains("f"));
    }

    #[test]
    fn non_immediate_define_is_not_constant() {
        let exprs = parse("(define x (+ 1 2))");
        let consts = classify_constants(&exprs);
        assert!(!consts.contains("x"));
    }

    #[test]
    fn box_pass_marks_captured_set_targets() {
        let body = parse("(set! x (+ x 1)) x");
        let locals: HashSet<String> = HashSet::new();
        let mut fv = FreeVarList::new();
        mark_boxed_captures(&body, &locals, &mut fv);
        assert!(fv.entries().iter().any(|e| e.name == "x" && e.boxed));
    }

    #[test]
    fn box_pass_ignores_local_set_targets() {
        let body = parse("(set! x (+ x 1)) x");
        let mut locals: HashSet<String> = HashSet::new();
        locals.insert("x".to_string());
        let mut fv = FreeVarList::new();
        mark_boxed_captures(&body, &locals, &mut fv);
        assert!(fv.entries().is_empty());
    }
}
