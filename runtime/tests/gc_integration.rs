//! Integration tests for the generational collector's public `extern "C"`
//! surface, exercised directly against the Rust API (compiled assembly is
//! never produced or linked in this test suite).

use seq_runtime::heap::{cleanup, collect, init_gc};
use seq_runtime::value;
use std::ptr;

/// A fresh, small heap: enough room for a handful of cons cells, small
/// enough that promoting more than a couple of generations' worth of
/// objects forces a gen1 flip.
fn fresh_small_heap() -> seq_runtime::heap::GcInit {
    unsafe { init_gc(64, 512) }
}

#[test]
fn allocating_without_collecting_leaves_roots_untouched() {
    let init = fresh_small_heap();

    let car = value::tag_fixnum(1);
    let cdr = value::NIL;
    unsafe {
        ptr::write((init.heap_ptr as *mut i64).add(0), car);
        ptr::write((init.heap_ptr as *mut i64).add(1), cdr);
    }
    let cons_value = (init.heap_ptr as i64) | value::CONS_TAG;

    match value::decode(cons_value) {
        value::Value::Cons(base) => unsafe {
            assert_eq!(ptr::read((base as *const i64).add(0)), car);
        },
        other => panic!("expected a cons cell, got {other:?}"),
    }

    unsafe { cleanup() };
}

#[test]
fn minor_collection_promotes_a_chain_of_live_cons_cells() {
    let init = fresh_small_heap();

    // Build (1 . (2 . ())) directly in the nursery via two bump-and-tag
    // allocations, as compiler-generated code would.
    let tail_base = init.heap_ptr;
    unsafe {
        ptr::write((tail_base as *mut i64).add(0), value::tag_fixnum(2));
        ptr::write((tail_base as *mut i64).add(1), value::NIL);
    }
    let tail_value = (tail_base as i64) | value::CONS_TAG;

    let head_base = unsafe { tail_base.add(16) };
    unsafe {
        ptr::write((head_base as *mut i64).add(0), value::tag_fixnum(1));
        ptr::write((head_base as *mut i64).add(1), tail_value);
    }
    let head_value = (head_base as i64) | value::CONS_TAG;

    unsafe { ptr::write(init.root_stack_top as *mut i64, head_value) };
    let root_top = unsafe { init.root_stack_top.add(8) };

    let result = unsafe { collect(root_top) };
    assert_eq!(result.root_stack_top, unsafe {
        init.root_stack_top.add(8)
    });

    let promoted = unsafe { ptr::read(init.root_stack_top as *const i64) };
    match value::decode(promoted) {
        value::Value::Cons(head) => unsafe {
            assert_eq!(ptr::read((head as *const i64).add(0)), value::tag_fixnum(1));
            let cdr = ptr::read((head as *const i64).add(1));
            match value::decode(cdr) {
                value::Value::Cons(tail) => {
                    assert_eq!(ptr::read((tail as *const i64).add(0)), value::tag_fixnum(2));
                    assert_eq!(ptr::read((tail as *const i64).add(1)), value::NIL);
                }
                other => panic!("expected a promoted tail cons cell, got {other:?}"),
            }
        },
        other => panic!("expected a promoted head cons cell, got {other:?}"),
    }

    unsafe { cleanup() };
}

#[test]
fn repeated_minor_collections_eventually_flip_gen1() {
    let init = fresh_small_heap();
    let mut root_top = init.root_stack_top;

    // Promote several independent cons cells across several minor
    // collections; gen1 has no from-space room to spare at this heap size,
    // so at least one of these collections must flip gen1's semispaces
    // rather than simply bump-allocate into it.
    for n in 0..6 {
        unsafe {
            ptr::write((init.heap_ptr as *mut i64).add(0), value::tag_fixnum(n));
            ptr::write((init.heap_ptr as *mut i64).add(1), value::NIL);
        }
        let cons_value = (init.heap_ptr as i64) | value::CONS_TAG;
        unsafe { ptr::write(root_top as *mut i64, cons_value) };
        let bumped = unsafe { root_top.add(8) };

        let result = unsafe { collect(bumped) };
        root_top = result.root_stack_top;

        // This iteration's cell is the most recently appended root slot.
        let this_slot = unsafe { (init.root_stack_top as *const i64).add(n as usize) };
        let promoted = unsafe { ptr::read(this_slot) };
        match value::decode(promoted) {
            value::Value::Cons(base) => unsafe {
                assert_eq!(ptr::read((base as *const i64).add(0)), value::tag_fixnum(n));
            },
            other => panic!("expected a promoted cons cell on iteration {n}, got {other:?}"),
        }
    }

    unsafe { cleanup() };
}
