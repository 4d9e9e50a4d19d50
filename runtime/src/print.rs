//! The `print` entry point compiled programs call on every top-level
//! expression's result. Formatting mirrors the tag layout in
//! `crate::value`, not Rust's own `Debug`/`Display` conventions.

use crate::value::{self, Value};
use std::io::Write;

/// Writes a tagged value's printed representation followed by a newline
/// to stdout. Takes the raw tagged word directly in `%rdi`, matching
/// every other single-argument entry point in this crate.
///
/// # Safety
/// `raw` must be a tagged word previously produced by compiler-generated
/// code or by this crate's own allocation routines; an unrecognized tag
/// pattern is treated as runtime corruption and aborts the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn print(raw: i64) {
    let mut out = String::new();
    unsafe { write_value(&mut out, raw) };
    out.push('\n');
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(out.as_bytes()).ok();
}

unsafe fn write_value(out: &mut String, raw: i64) {
    match value::decode(raw) {
        Value::Fixnum(n) => out.push_str(&n.to_string()),
        Value::Boolean(true) => out.push_str("#t"),
        Value::Boolean(false) => out.push_str("#f"),
        Value::Nil => out.push_str("()"),
        Value::AsciiChar(c) => out.push_str(&format!("#\\x{c:02X}")),
        Value::UnicodeChar(c) => out.push_str(&format!("#\\x{c:04X}")),
        Value::Cons(base) => unsafe { write_cons(out, base) },
        Value::Vector(base) => unsafe { write_vector(out, base) },
        Value::Str(base) => unsafe { write_string(out, base) },
        Value::Symbol(base) => unsafe { write_symbol(out, base) },
        Value::Closure(base) => unsafe { write_closure(out, base) },
        Value::Invalid(bits) => {
            eprintln!("seq-runtime: print: corrupt tagged value (bits = {bits:#x})");
            std::process::exit(1);
        }
    }
}

/// `(a b . c)` for improper lists, `(a b c)` for proper ones, matching
/// the reader's own external representation.
unsafe fn write_cons(out: &mut String, base: *mut u8) {
    out.push('(');
    let mut raw = (base as i64) | value::CONS_TAG;
    let mut first = true;
    loop {
        let Value::Cons(cell) = value::decode(raw) else {
            // Dotted tail: anything other than another cons or nil.
            out.push_str(" . ");
            unsafe { write_value(out, raw) };
            break;
        };
        if !first {
            out.push(' ');
        }
        first = false;
        let car = unsafe { std::ptr::read((cell as *const i64).add(0)) };
        unsafe { write_value(out, car) };
        let cdr = unsafe { std::ptr::read((cell as *const i64).add(1)) };
        if cdr == value::NIL {
            break;
        }
        raw = cdr;
    }
    out.push(')');
}

unsafe fn write_vector(out: &mut String, base: *mut u8) {
    let len = unsafe { std::ptr::read(base as *const i64) } >> value::FIXNUM_SHIFT;
    let data = unsafe { base.add(value::offsets::VECTOR_DATA as usize) } as *const i64;
    out.push_str("#(");
    for i in 0..len {
        if i > 0 {
            out.push(' ');
        }
        let element = unsafe { std::ptr::read(data.add(i as usize)) };
        unsafe { write_value(out, element) };
    }
    out.push(')');
}

unsafe fn write_string(out: &mut String, base: *mut u8) {
    let len = unsafe { std::ptr::read(base as *const i64) } >> value::FIXNUM_SHIFT;
    let data = unsafe { base.add(value::offsets::STRING_DATA as usize) };
    let bytes = unsafe { std::slice::from_raw_parts(data, len as usize) };
    let s = String::from_utf8_lossy(bytes);
    out.push('"');
    out.push_str(&s);
    out.push('"');
}

/// Bare, unquoted name -- unlike `write_string`, which wraps its output
/// in `"..."`.
unsafe fn write_symbol(out: &mut String, base: *mut u8) {
    let len = unsafe { std::ptr::read(base as *const i64) } >> value::FIXNUM_SHIFT;
    let data = unsafe { base.add(value::offsets::SYMBOL_DATA as usize) };
    let bytes = unsafe { std::slice::from_raw_parts(data, len as usize) };
    out.push_str(&String::from_utf8_lossy(bytes));
}

unsafe fn write_closure(out: &mut String, base: *mut u8) {
    let arity = unsafe { std::ptr::read((base as *const i64).add(value::offsets::CLOSURE_ARITY as usize / 8)) };
    out.push_str(&format!(
        "<Lambda>(ref={:#x}, arity={arity})",
        base as usize
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn rendered(raw: i64) -> String {
        let mut out = String::new();
        unsafe { write_value(&mut out, raw) };
        out
    }

    #[test]
    fn prints_fixnum() {
        assert_eq!(unsafe { rendered(value::tag_fixnum(42)) }, "42");
        assert_eq!(unsafe { rendered(value::tag_fixnum(-3)) }, "-3");
    }

    #[test]
    fn prints_immediates() {
        assert_eq!(unsafe { rendered(value::BOOL_TRUE) }, "#t");
        assert_eq!(unsafe { rendered(value::BOOL_FALSE) }, "#f");
        assert_eq!(unsafe { rendered(value::NIL) }, "()");
    }

    #[test]
    fn prints_proper_list() {
        // (1 2) as nested cons cells, backed by stack-local storage.
        let mut second: [i64; 2] = [value::tag_fixnum(2), value::NIL];
        let second_ptr = second.as_mut_ptr() as *mut u8;
        let second_raw = (second_ptr as i64) | value::CONS_TAG;

        let mut first: [i64; 2] = [value::tag_fixnum(1), second_raw];
        let first_ptr = first.as_mut_ptr() as *mut u8;
        let first_raw = (first_ptr as i64) | value::CONS_TAG;

        assert_eq!(unsafe { rendered(first_raw) }, "(1 2)");
    }

    #[test]
    fn prints_dotted_pair() {
        let mut cell: [i64; 2] = [value::tag_fixnum(1), value::tag_fixnum(2)];
        let ptr = cell.as_mut_ptr() as *mut u8;
        let raw = (ptr as i64) | value::CONS_TAG;
        assert_eq!(unsafe { rendered(raw) }, "(1 . 2)");
    }

    #[test]
    fn prints_vector() {
        let mut storage: [i64; 3] = [value::tag_fixnum(2), value::tag_fixnum(10), value::tag_fixnum(20)];
        let ptr = storage.as_mut_ptr() as *mut u8;
        let raw = (ptr as i64) | value::VECTOR_TAG;
        assert_eq!(unsafe { rendered(raw) }, "#(10 20)");
    }

    #[test]
    fn prints_symbol_bare_without_quotes() {
        let len = value::tag_fixnum(4);
        let mut storage: Vec<u8> = Vec::new();
        storage.extend_from_slice(&len.to_ne_bytes());
        storage.extend_from_slice(b"done");
        let raw = (storage.as_mut_ptr() as i64) | value::SYMBOL_TAG;
        assert_eq!(unsafe { rendered(raw) }, "done");
    }

    #[test]
    fn prints_string() {
        let len = value::tag_fixnum(5);
        let mut storage: Vec<u8> = Vec::new();
        storage.extend_from_slice(&len.to_ne_bytes());
        storage.extend_from_slice(b"hello");
        let raw = (storage.as_mut_ptr() as i64) | value::STRING_TAG;
        assert_eq!(unsafe { rendered(raw) }, "\"hello\"");
    }
}
