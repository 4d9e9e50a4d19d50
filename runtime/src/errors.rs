//! Runtime traps for violations the compiler can only catch at call time:
//! a closure invoked with a different argument count than it was built
//! with. Most tag/shape mismatches are left as undefined behavior per the
//! runtime's minimality, but a bad arity is cheap to check inline (the
//! compiler already emits the comparison against the closure's stored
//! arity -- see `codegen::closures::emit_call_through_closure`) and a
//! silent wrong-arity call would otherwise read or write past the
//! argument registers the callee actually expects, so it gets a real
//! diagnostic instead.

/// Reached by a `jne` off the compiler's inline arity check. Never
/// returns.
#[unsafe(no_mangle)]
pub extern "C" fn seq_arity_error() -> ! {
    eprintln!("seq-runtime: closure called with the wrong number of arguments");
    std::process::exit(1);
}
