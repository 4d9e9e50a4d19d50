//! Tail-call detection and in-place argument rewrite (§4.4.5).
//!
//! A call occupies tail position inside a `define`d function or a `lambda`
//! when it is the final expression of the body, or is the selected branch
//! of an `if` that itself sits in tail position. A self tail call (the
//! callee is the enclosing function/closure) needs no new frame: the
//! current argument slots are overwritten in place and the stack pointer
//! is restored to the caller's frame before jumping directly to the
//! function's entry label, rather than `call`ing it.

use crate::ast::Expr;
use crate::codegen::argorder::ArgPlan;

/// Whether `expr`, as the `index`-th element of a `len`-long body, sits in
/// tail position. Only the last expression of a sequence does; earlier
/// expressions are evaluated purely for effect.
pub fn is_tail_position(index: usize, len: usize) -> bool {
    len > 0 && index == len - 1
}

/// If `expr` is a call `(name arg...)` to `fn_name`, returns its argument
/// list. `lambda` self-calls are recognized by the generator passing the
/// closure's own entry label as `fn_name`, not by this function.
pub fn self_tail_call_args<'a>(expr: &'a Expr, fn_name: &str) -> Option<&'a [Expr]> {
    let list = expr.as_list()?;
    let (head, args) = list.split_first()?;
    if head.as_symbol()? == fn_name {
        Some(args)
    } else {
        None
    }
}

/// Given the resolved evaluation order for the new argument values (an
/// `ArgPlan` from `argorder::resolve_argument_order`, computed against the
/// current contents of the function's own argument slots), emits the
/// in-place rewrite: each argument is evaluated and moved into its
/// destination register per `plan.order`, then the stack pointer is reset
/// to discard the current frame and control jumps directly to the
/// function's entry label.
///
/// `arg_operands[i]` must already hold argument `i`'s freshly evaluated
/// value (e.g. in a scratch register or spill slot) by the time this is
/// called; this function only emits the final placement, frame teardown,
/// and jump.
pub fn emit_tail_call_rewrite(
    plan: &ArgPlan,
    arg_operands: &[String],
    dest_regs: &[String],
    frame_bytes: i64,
    entry_label: &str,
) -> Vec<String> {
    assert_eq!(arg_operands.len(), dest_regs.len());
    let mut lines = Vec::new();
    for &i in &plan.order {
        if arg_operands[i] != dest_regs[i] {
            lines.push(format!("movq {}, {}", arg_operands[i], dest_regs[i]));
        }
    }
    if frame_bytes > 0 {
        lines.push(format!("addq ${frame_bytes}, %rsp"));
    }
    lines.push(format!("jmp {entry_label}"));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Pos};

    fn p() -> Pos {
        Pos { line: 1, column: 1 }
    }

    #[test]
    fn last_expression_is_tail_position() {
        assert!(is_tail_position(2, 3));
        assert!(!is_tail_position(0, 3));
        assert!(!is_tail_position(0, 0));
    }

    #[test]
    fn recognizes_self_call() {
        let call = Expr::List(
            vec![
                Expr::Symbol("loop".to_string(), p()),
                Expr::Fixnum(1, p()),
            ],
            p(),
        );
        let args = self_tail_call_args(&call, "loop").unwrap();
        assert_eq!(args.len(), 1);
        assert!(self_tail_call_args(&call, "other").is_none());
    }

    #[test]
    fn rewrite_skips_noop_moves_and_adjusts_frame() {
        let plan = ArgPlan {
            order: vec![0, 1],
            evictions: vec![],
        };
        let arg_operands = vec!["%r10".to_string(), "%rsi".to_string()];
        let dest_regs = vec!["%rdi".to_string(), "%rsi".to_string()];
        let lines = emit_tail_call_rewrite(&plan, &arg_operands, &dest_regs, 32, "f_loop");
        assert!(lines.iter().any(|l| l.contains("movq %r10, %rdi")));
        assert!(!lines.iter().any(|l| l.contains("movq %rsi, %rsi")));
        assert!(lines.iter().any(|l| l.contains("addq $32, %rsp")));
        assert_eq!(lines.last().unwrap(), "jmp f_loop");
    }
}
