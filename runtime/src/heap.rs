//! Generational copying collector.
//!
//! Two generations:
//!
//! - gen0 (the nursery) is a single bump-allocated buffer. A minor
//!   collection never copies survivors back into a fresh gen0 semispace;
//!   it walks the root stack and promotes every live object straight into
//!   gen1, then resets the nursery bump pointer to its base. This avoids
//!   the usual two-nursery-semispace dance at the cost of promoting
//!   everything a minor collection finds live, nursery-only garbage or
//!   not.
//! - gen1 is a classic Cheney two-semispace collector: a major collection
//!   flips from-space and to-space and copies everything reachable from
//!   the root stack (plus anything just promoted from gen0) across.
//!
//! Both generations have a fixed capacity decided once, at `init_gc`
//! time. Neither grows. Exhausting gen1 during a major collection is a
//! fatal condition, not a trigger for `realloc`: the process prints a
//! diagnostic and exits with status 1, matching the compiler's own
//! diagnostics-to-stderr convention rather than panicking or aborting.

use crate::value;
use std::cell::RefCell;
use std::ptr;

struct Semispace {
    base: *mut u8,
    limit: *mut u8,
}

impl Semispace {
    unsafe fn alloc(capacity: usize) -> Semispace {
        let base = unsafe { libc::malloc(capacity) } as *mut u8;
        if base.is_null() {
            eprintln!("seq-runtime: failed to allocate {capacity} bytes for heap semispace");
            std::process::exit(1);
        }
        Semispace {
            base,
            limit: unsafe { base.add(capacity) },
        }
    }
}

struct GcState {
    nursery: Semispace,
    nursery_capacity: usize,

    gen1_from: Semispace,
    gen1_to: Semispace,
    gen1_capacity: usize,
    /// Bump pointer within `gen1_from`: the next free byte for objects
    /// promoted out of the nursery, or copied during a major collection.
    gen1_ptr: *mut u8,

    root_stack_base: *mut u8,
    root_stack_limit: *mut u8,
}

thread_local! {
    static GC: RefCell<Option<GcState>> = const { RefCell::new(None) };
}

/// Two-word struct returned from `init_gc` in `%rax`/`%rdx` per the SysV
/// small-aggregate convention: `heap_ptr` is the nursery bump pointer the
/// compiler keeps pinned in `%r15`, `root_stack_top` is the root-stack
/// cursor pinned in `%rbp`.
#[repr(C)]
pub struct GcInit {
    pub heap_ptr: *mut u8,
    pub root_stack_top: *mut u8,
}

/// Allocates the nursery, both gen1 semispaces, and the root stack, and
/// returns the two pointers the compiler's `main:` prologue pins into its
/// reserved registers.
///
/// The nursery gets a quarter of `heap_size`; the remaining three
/// quarters split evenly between gen1's from-space and to-space.
///
/// # Safety
/// Must be called at most once per process, before any other function in
/// this module.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn init_gc(root_stack_size: i64, heap_size: i64) -> GcInit {
    assert!(heap_size > 0, "init_gc: heap_size must be positive");
    assert!(root_stack_size > 0, "init_gc: root_stack_size must be positive");

    let heap_size = heap_size as usize;
    let nursery_capacity = (heap_size / 4).max(value::offsets::CONS_SIZE);
    let gen1_capacity = ((heap_size - nursery_capacity) / 2).max(value::offsets::CONS_SIZE);

    let nursery = unsafe { Semispace::alloc(nursery_capacity) };
    let gen1_from = unsafe { Semispace::alloc(gen1_capacity) };
    let gen1_to = unsafe { Semispace::alloc(gen1_capacity) };
    let root_stack = unsafe { Semispace::alloc(root_stack_size as usize * 8) };

    let heap_ptr = nursery.base;
    let root_stack_top = root_stack.base;
    let gen1_ptr = gen1_from.base;

    let state = GcState {
        nursery,
        nursery_capacity,
        gen1_from,
        gen1_to,
        gen1_capacity,
        gen1_ptr,
        root_stack_base: root_stack.base,
        root_stack_limit: root_stack.limit,
    };
    GC.with(|cell| *cell.borrow_mut() = Some(state));

    GcInit {
        heap_ptr,
        root_stack_top,
    }
}

/// Frees every region `init_gc` allocated. Called once from the
/// compiler's `main:` epilogue.
///
/// # Safety
/// Must be called at most once, and only after `init_gc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cleanup() {
    GC.with(|cell| {
        if let Some(state) = cell.borrow_mut().take() {
            unsafe {
                libc::free(state.nursery.base as *mut libc::c_void);
                libc::free(state.gen1_from.base as *mut libc::c_void);
                libc::free(state.gen1_to.base as *mut libc::c_void);
                libc::free(state.root_stack_base as *mut libc::c_void);
            }
        }
    });
}

/// Two-word struct returned from `collect` in `%rax`/`%rdx`: the
/// compiler reloads its reserved registers from these after any call
/// that may have triggered a collection.
#[repr(C)]
pub struct GcResult {
    pub heap_ptr: *mut u8,
    pub root_stack_top: *mut u8,
}

/// Runs a minor collection: walks every tagged word between
/// `root_stack_base` and `root_stack_top`, promotes everything reachable
/// into gen1, and resets the nursery.
///
/// If gen1 does not have room for the promoted set, this instead runs a
/// major collection (flipping gen1's two semispaces) before promoting. If
/// gen1 still can't fit the promoted set after that, this is a fatal
/// out-of-memory condition.
///
/// # Safety
/// `root_stack_top` must lie within the root stack `init_gc` allocated,
/// and every word below it must be a valid tagged value or heap pointer
/// previously produced by compiler-generated code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn collect(root_stack_top: *mut u8) -> GcResult {
    GC.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let state = borrow
            .as_mut()
            .expect("collect: GC state not initialized; init_gc must run first");

        let root_base = state.root_stack_base as *mut i64;
        let root_len = unsafe { (root_stack_top as *mut i64).offset_from(root_base) } as usize;
        let mut roots: Vec<i64> =
            unsafe { std::slice::from_raw_parts(root_base, root_len) }.to_vec();

        let promoted_size: usize = roots.iter().map(|&raw| reachable_size(raw)).sum();
        let gen1_used = unsafe { state.gen1_ptr.offset_from(state.gen1_from.base) as usize };
        if state.gen1_capacity - gen1_used < promoted_size {
            unsafe { major_collect(state, &mut roots) };
        }

        let mut forwarded = std::collections::HashMap::new();
        for raw in roots.iter_mut() {
            *raw = unsafe { promote(state, *raw, &mut forwarded) };
        }
        for (slot, value) in roots.iter().enumerate() {
            unsafe { ptr::write(root_base.add(slot), *value) };
        }

        GcResult {
            heap_ptr: state.nursery.base,
            root_stack_top: unsafe { state.root_stack_base.add(roots.len() * 8) },
        }
    })
}

/// Conservatively sizes the object a raw tagged word points to, so a
/// minor collection can decide up front whether gen1 has room for
/// everything it is about to promote. Immediates contribute nothing.
fn reachable_size(raw: i64) -> usize {
    match value::decode(raw) {
        value::Value::Cons(_) => value::offsets::CONS_SIZE,
        value::Value::Vector(base) => unsafe {
            let len = ptr::read((base as *const i64).add(0)) >> value::FIXNUM_SHIFT;
            value::offsets::VECTOR_DATA as usize + (len as usize) * 8
        },
        value::Value::Str(base) => unsafe {
            let len = ptr::read((base as *const i64).add(0)) >> value::FIXNUM_SHIFT;
            value::offsets::STRING_DATA as usize + (len as usize).div_ceil(8) * 8
        },
        value::Value::Closure(base) => unsafe {
            let free_count =
                ptr::read((base as *const i64).add(value::offsets::CLOSURE_FREE_COUNT as usize / 8));
            value::offsets::CLOSURE_FREE_VARS as usize + (free_count as usize) * 8
        },
        _ => 0,
    }
}

/// Copies `raw`'s referent into gen1 (if it is a heap pointer and has not
/// already been copied this collection), rewriting nested pointers
/// transitively, and returns the updated tagged word. A closure's tagged
/// pointer targets its `arity` field, not its box cells, so copying a
/// closure record never needs to know how many of its captures are
/// boxed; the box cells themselves are only reachable indirectly,
/// through the pointers stored in `cap_i` fields for boxed captures,
/// which this also follows and promotes like any other heap pointer.
unsafe fn promote(
    state: &mut GcState,
    raw: i64,
    forwarded: &mut std::collections::HashMap<*mut u8, *mut u8>,
) -> i64 {
    let (base, tag) = match value::decode(raw) {
        value::Value::Cons(b) => (b, value::CONS_TAG),
        value::Value::Vector(b) => (b, value::VECTOR_TAG),
        value::Value::Str(b) => (b, value::STRING_TAG),
        value::Value::Closure(b) => (b, value::CLOSURE_TAG),
        _ => return raw,
    };

    if let Some(&new_base) = forwarded.get(&base) {
        return (new_base as i64) | tag;
    }

    let size = reachable_size(raw);
    let new_base = state.gen1_ptr;
    unsafe {
        ptr::copy_nonoverlapping(base, new_base, size);
        state.gen1_ptr = state.gen1_ptr.add(size);
    }
    forwarded.insert(base, new_base);

    match tag {
        t if t == value::CONS_TAG => unsafe {
            let car = ptr::read((new_base as *const i64).add(0));
            let cdr = ptr::read((new_base as *const i64).add(1));
            let car = promote(state, car, forwarded);
            let cdr = promote(state, cdr, forwarded);
            ptr::write((new_base as *mut i64).add(0), car);
            ptr::write((new_base as *mut i64).add(1), cdr);
        },
        t if t == value::VECTOR_TAG => unsafe {
            let len = ptr::read(new_base as *const i64) >> value::FIXNUM_SHIFT;
            let data = new_base.add(value::offsets::VECTOR_DATA as usize) as *mut i64;
            for i in 0..len {
                let v = ptr::read(data.add(i as usize));
                let v = promote(state, v, forwarded);
                ptr::write(data.add(i as usize), v);
            }
        },
        t if t == value::CLOSURE_TAG => unsafe {
            let free_count = ptr::read(
                (new_base as *const i64).add(value::offsets::CLOSURE_FREE_COUNT as usize / 8),
            );
            let data = new_base.add(value::offsets::CLOSURE_FREE_VARS as usize) as *mut i64;
            for i in 0..free_count {
                let v = ptr::read(data.add(i as usize));
                let v = promote(state, v, forwarded);
                ptr::write(data.add(i as usize), v);
            }
        },
        _ => {}
    }

    (new_base as i64) | tag
}

/// Flips gen1's two semispaces and copies everything currently reachable
/// (both from the root set and from what's already resident in
/// from-space) into the fresh to-space, compacting away garbage accrued
/// over prior minor collections.
///
/// Exits the process with status 1 if the live set still doesn't fit
/// after the flip: gen1 has a fixed capacity and never grows.
unsafe fn major_collect(state: &mut GcState, roots: &mut [i64]) {
    std::mem::swap(&mut state.gen1_from, &mut state.gen1_to);
    state.gen1_ptr = state.gen1_from.base;

    let mut forwarded = std::collections::HashMap::new();
    for raw in roots.iter_mut() {
        *raw = unsafe { promote(state, *raw, &mut forwarded) };
    }

    let used = unsafe { state.gen1_ptr.offset_from(state.gen1_from.base) as usize };
    if used > state.gen1_capacity {
        eprintln!("seq-runtime: Not enough space on the major heap");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::tag_fixnum;

    fn fresh() -> (GcInit, GcResult) {
        let init = unsafe { init_gc(256, 4096) };
        (init, GcResult { heap_ptr: init.heap_ptr, root_stack_top: init.root_stack_top })
    }

    #[test]
    fn init_gc_returns_nonnull_pointers() {
        let (init, _) = fresh();
        assert!(!init.heap_ptr.is_null());
        assert!(!init.root_stack_top.is_null());
        unsafe { cleanup() };
    }

    #[test]
    fn collect_with_no_roots_resets_nursery() {
        let (init, _) = fresh();
        let result = unsafe { collect(init.root_stack_top) };
        assert_eq!(result.root_stack_top, init.root_stack_top);
        unsafe { cleanup() };
    }

    #[test]
    fn collect_promotes_a_live_cons_cell() {
        let (init, _) = fresh();
        // Allocate one cons cell directly in the nursery, as compiler-
        // generated code would via a bump-and-tag sequence.
        let car = tag_fixnum(7);
        let cdr = value::NIL;
        unsafe {
            ptr::write((init.heap_ptr as *mut i64).add(0), car);
            ptr::write((init.heap_ptr as *mut i64).add(1), cdr);
        }
        let cons_value = (init.heap_ptr as i64) | value::CONS_TAG;

        // Push it as the sole root-stack entry.
        unsafe {
            ptr::write(init.root_stack_top as *mut i64, cons_value);
        }
        let bumped_root_top = unsafe { init.root_stack_top.add(8) };

        let result = unsafe { collect(bumped_root_top) };
        assert_eq!(result.root_stack_top, unsafe { init.root_stack_top.add(8) });

        let promoted_raw = unsafe { ptr::read(init.root_stack_top as *const i64) };
        match value::decode(promoted_raw) {
            value::Value::Cons(base) => unsafe {
                assert_eq!(ptr::read((base as *const i64).add(0)), car);
                assert_eq!(ptr::read((base as *const i64).add(1)), cdr);
            },
            other => panic!("expected a promoted cons cell, got {other:?}"),
        }
        unsafe { cleanup() };
    }
}
