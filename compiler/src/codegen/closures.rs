//! Closure construction and invocation (§4.4.4).
//!
//! A lambda with `m` free variables allocates `m*8 + 24 + 8*b` bytes, where
//! `b` is the number of boxed captures, laid out as:
//!
//! ```text
//! [ box_0 ] ... [ box_{b-1} ]  [ arity ] [ free_count ] [ code_ptr ] [ cap_0 ] ... [ cap_{m-1} ]
//! ```
//!
//! Each boxed capture's `cap_i` holds the address of its `box_j`; loads
//! through a boxed capture do one extra indirection. The closure pointer
//! itself is tagged `CLOSURE_TAG` and targets the `arity` field, not
//! `box_0` -- the collector needs `free_count` to walk a closure's
//! captures without knowing ahead of time how many of them are boxed, and
//! finding it at a fixed offset from the tagged pointer means the
//! collector never needs to see `b`.

use crate::env::FreeVarList;
use crate::value_tags::{offsets, CLOSURE_TAG, PTR_TAG_MASK};

#[derive(Debug, Clone, Copy)]
pub struct ClosureLayout {
    pub free_count: usize,
    pub boxed_count: usize,
    pub total_bytes: i64,
}

impl ClosureLayout {
    pub fn compute(free_vars: &FreeVarList) -> Self {
        let free_count = free_vars.entries().len();
        let boxed_count = free_vars.boxed_count();
        let total_bytes =
            (free_count as i64) * 8 + offsets::CLOSURE_FREE_VARS + (boxed_count as i64) * offsets::BOXED_CELL_SIZE;
        ClosureLayout {
            free_count,
            boxed_count,
            total_bytes,
        }
    }
}

/// Where a single captured variable's current value (or, if boxed, its
/// box cell's address) can be read from at construction time.
#[derive(Debug, Clone)]
pub struct CaptureSource {
    pub name: String,
    pub boxed: bool,
    pub operand: String,
}

/// Emits the instruction sequence that builds a closure record at the
/// current `heap_ptr_reg` bump pointer and leaves the *untagged* base
/// address in `scratch`. The caller is responsible for tagging the
/// pointer, moving it to its destination, and bumping `heap_ptr_reg` by
/// `layout.total_bytes`.
pub fn emit_closure_construction(
    layout: &ClosureLayout,
    captures: &[CaptureSource],
    code_label: &str,
    arity: usize,
    heap_ptr_reg: &str,
    scratch: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("movq {heap_ptr_reg}, {scratch}"));

    let mut box_offset = 0i64;
    let mut cap_offsets = Vec::with_capacity(captures.len());
    for c in captures {
        if c.boxed {
            cap_offsets.push(Some(box_offset));
            box_offset += offsets::BOXED_CELL_SIZE;
        } else {
            cap_offsets.push(None);
        }
    }
    let header_base = (layout.boxed_count as i64) * offsets::BOXED_CELL_SIZE;

    // Write the box cells for boxed captures, storing each one's current
    // value from its capture source operand.
    let mut next_box = 0i64;
    for c in captures.iter().filter(|c| c.boxed) {
        let off = next_box;
        lines.push(format!(
            "movq {}, {off}({scratch})",
            c.operand
        ));
        next_box += offsets::BOXED_CELL_SIZE;
    }

    lines.push(format!(
        "movq ${arity}, {}({scratch})",
        header_base + offsets::CLOSURE_ARITY
    ));
    lines.push(format!(
        "movq ${}, {}({scratch})",
        captures.len(),
        header_base + offsets::CLOSURE_FREE_COUNT
    ));
    lines.push(format!(
        "leaq {code_label}(%rip), {scratch2}",
        scratch2 = "%r11"
    ));
    lines.push(format!(
        "movq %r11, {}({scratch})",
        header_base + offsets::CLOSURE_CODE_PTR
    ));

    for (idx, c) in captures.iter().enumerate() {
        let field_off = header_base + offsets::CLOSURE_FREE_VARS + (idx as i64) * 8;
        match cap_offsets[idx] {
            Some(box_off) => {
                // cap_i holds the address of its own box cell.
                lines.push(format!("leaq {box_off}({scratch}), %r11"));
                lines.push(format!("movq %r11, {field_off}({scratch})"));
            }
            None => {
                lines.push(format!("movq {}, {field_off}({scratch})", c.operand));
            }
        }
    }

    lines
}

/// Advances `scratch` past the box-cell region to the closure's header
/// (where `arity` lives), tags it `CLOSURE_TAG`, and moves the tagged
/// value into `dest`. `boxed_count` is `layout.boxed_count` from the same
/// `ClosureLayout` passed to `emit_closure_construction`.
pub fn emit_tag_closure(scratch: &str, dest: &str, boxed_count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    if boxed_count > 0 {
        lines.push(format!(
            "addq ${}, {scratch}",
            (boxed_count as i64) * offsets::BOXED_CELL_SIZE
        ));
    }
    lines.push(format!("orq ${CLOSURE_TAG}, {scratch}"));
    lines.push(format!("movq {scratch}, {dest}"));
    lines
}

/// Loads a boxed capture's current value: one indirection through the
/// capture slot (which holds the box cell's address) to the stored value.
pub fn emit_load_boxed_capture(capture_operand: &str, dest: &str) -> Vec<String> {
    vec![format!("movq ({capture_operand}), {dest}")]
}

/// Stores through a boxed capture's indirection, making the write visible
/// to every closure sharing the binding.
pub fn emit_store_boxed_capture(capture_operand: &str, value_operand: &str) -> Vec<String> {
    vec![format!("movq {value_operand}, ({capture_operand})")]
}

/// Call sequence through a closure value already materialized in
/// `closure_operand`: pin it in the reserved closure-env register, check
/// its stored arity, and indirect-call through its code pointer. Argument
/// placement into the argument registers is the caller's responsibility
/// (via `argorder`); this only emits the pin/check/call/untag sequence.
pub fn emit_call_through_closure(
    closure_operand: &str,
    closure_env_reg: &str,
    expected_arity: usize,
    arity_mismatch_label: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("movq {closure_operand}, {closure_env_reg}"));
    lines.push(format!("movq {closure_env_reg}, %r11"));
    lines.push(format!("andq ${}, %r11", !PTR_TAG_MASK & 0xFF));
    lines.push(format!(
        "cmpq ${expected_arity}, {}(%r11)",
        offsets::CLOSURE_ARITY
    ));
    lines.push(format!("jne {arity_mismatch_label}"));
    lines.push(format!("call *{}(%r11)", offsets::CLOSURE_CODE_PTR));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FreeVarList;

    #[test]
    fn layout_accounts_for_boxed_captures() {
        let mut fv = FreeVarList::new();
        fv.capture("a");
        fv.capture("b");
        fv.mark_boxed("a");
        let layout = ClosureLayout::compute(&fv);
        assert_eq!(layout.free_count, 2);
        assert_eq!(layout.boxed_count, 1);
        // 2 captures * 8 + header(24) + 1 boxed cell * 8
        assert_eq!(layout.total_bytes, 2 * 8 + 24 + 8);
    }

    #[test]
    fn construction_emits_one_line_per_field() {
        let captures = vec![
            CaptureSource {
                name: "a".to_string(),
                boxed: true,
                operand: "%rdi".to_string(),
            },
            CaptureSource {
                name: "b".to_string(),
                boxed: false,
                operand: "%rsi".to_string(),
            },
        ];
        let mut fv = FreeVarList::new();
        fv.capture("a");
        fv.capture("b");
        fv.mark_boxed("a");
        let layout = ClosureLayout::compute(&fv);
        let lines = emit_closure_construction(&layout, &captures, "lambda_0", 1, "%r15", "%r10");
        assert!(lines.iter().any(|l| l.contains("lambda_0")));
        assert!(!lines.is_empty());
    }

    #[test]
    fn call_sequence_checks_arity() {
        let lines = emit_call_through_closure("%rax", "%r14", 2, "arity_err");
        assert!(lines.iter().any(|l| l.contains("cmpq $2")));
        assert!(lines.iter().any(|l| l.contains("jne arity_err")));
    }
}
