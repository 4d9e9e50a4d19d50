//! Primitive table (§4.4.2): arity, produced kind, and an emission sketch
//! for every primitive the generator recognizes.
//!
//! A lazily built `HashMap<&str, Signature>`, keyed by arity + result
//! `Kind` instead of a stack-effect row-polymorphic type, since this
//! language has no type system beyond the tag discriminant.

use crate::env::Kind;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == *k,
            Arity::AtLeast(k) => n >= *k,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub arity: Arity,
    pub kind: Kind,
}

fn sig(arity: Arity, kind: Kind) -> Signature {
    Signature { arity, kind }
}

pub fn primitive_signature(name: &str) -> Option<Signature> {
    primitive_table().get(name).copied()
}

pub fn is_primitive(name: &str) -> bool {
    primitive_table().contains_key(name)
}

fn primitive_table() -> &'static HashMap<&'static str, Signature> {
    static TABLE: OnceLock<HashMap<&'static str, Signature>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use Arity::*;
        use Kind::*;
        let mut m = HashMap::new();

        m.insert("1+", sig(Exactly(1), Unknown));
        m.insert("1-", sig(Exactly(1), Unknown));
        m.insert("+", sig(AtLeast(2), Unknown));
        m.insert("-", sig(AtLeast(2), Unknown));
        m.insert("and", sig(AtLeast(2), Unknown));
        m.insert("or", sig(AtLeast(2), Unknown));
        m.insert("*", sig(Exactly(2), Unknown));
        m.insert("/", sig(Exactly(2), Unknown));
        m.insert("modulo", sig(Exactly(2), Unknown));

        for op in ["=", "<", "<=", ">", ">="] {
            m.insert(op, sig(Exactly(2), Boolean));
        }
        for op in ["zero?", "one?", "null?", "pair?", "vector?", "string?"] {
            m.insert(op, sig(Exactly(1), Boolean));
        }

        m.insert("cons", sig(Exactly(2), Cons));
        m.insert("car", sig(Exactly(1), Unknown));
        m.insert("cdr", sig(Exactly(1), Unknown));
        for combo in ["caar", "cadr", "cdar", "cddr"] {
            m.insert(combo, sig(Exactly(1), Unknown));
        }
        m.insert("set-car!", sig(Exactly(2), Nil));
        m.insert("set-cdr!", sig(Exactly(2), Nil));

        m.insert("make-vector", sig(AtLeast(1), Vector));
        m.insert("vector", sig(AtLeast(0), Vector));
        m.insert("vector-ref", sig(Exactly(2), Unknown));
        m.insert("vector-set!", sig(Exactly(3), Nil));
        m.insert("vector-length", sig(Exactly(1), Fixnum));

        m.insert("make-string", sig(AtLeast(1), Str));
        m.insert("string", sig(AtLeast(0), Str));
        m.insert("string-ref", sig(Exactly(2), Char));
        m.insert("string-set!", sig(Exactly(3), Nil));
        m.insert("string-length", sig(Exactly(1), Fixnum));

        m.insert("exit", sig(Exactly(0), Unknown));

        m
    })
}

/// `ca[ad]r`/`cd[ad]r` field-access sequence, innermost-first: `cadr`
/// reads `car` of `cdr` of its argument, so the offsets are applied
/// `cdr`, then `car`.
pub fn cxr_path(name: &str) -> Option<Vec<bool>> {
    // true = car, false = cdr
    let body = name.strip_prefix('c')?.strip_suffix('r')?;
    if body.is_empty() || !body.chars().all(|c| c == 'a' || c == 'd') {
        return None;
    }
    Some(body.chars().rev().map(|c| c == 'a').collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_primitives_have_signatures() {
        assert!(is_primitive("cons"));
        assert!(is_primitive("vector-ref"));
        assert!(!is_primitive("frobnicate"));
    }

    #[test]
    fn arity_checks() {
        let s = primitive_signature("+").unwrap();
        assert!(s.arity.accepts(2));
        assert!(s.arity.accepts(5));
        assert!(!s.arity.accepts(1));
    }

    #[test]
    fn cxr_path_applies_innermost_first() {
        // (cadr x) = (car (cdr x)): apply cdr first, then car.
        let path = cxr_path("cadr").unwrap();
        assert_eq!(path, vec![false, true]);
    }

    #[test]
    fn cxr_path_handles_single_level() {
        assert_eq!(cxr_path("car"), Some(vec![true]));
        assert_eq!(cxr_path("cdr"), Some(vec![false]));
    }

    #[test]
    fn cxr_rejects_non_cxr_names() {
        assert!(cxr_path("cons").is_none());
    }
}
