//! Register naming: maps environment slot indices to AT&T-syntax operand
//! text for the System V AMD64 register contract (§9, "Runtime registers").

use crate::env::{
    FIRST_SPILL_SLOT, RESERVED_CLOSURE_ENV, RESERVED_HEAP_PTR, RESERVED_ROOT_STACK_TOP,
};

/// Fixed return register: the tagged result of every expression.
pub const RETURN_REG: &str = "%rax";

/// Scratch register free for use within a single emission (never lives
/// across a call boundary).
pub const SCRATCH_REG: &str = "%r10";
pub const SCRATCH_REG2: &str = "%r11";

const SLOT_REGS: [&str; FIRST_SPILL_SLOT] = [
    "%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9", // 0-5: SysV args
    "%rbx", "%r12", "%r13", // 6-8: non-volatile scratch
    "%r14", "%r15", "%rbp", // 9-11: reserved (closure env, heap ptr, root stack top)
];

/// AT&T operand text for a register/slot index. Spill-slot offsets are
/// counted up from the current `%rsp` (slot `FIRST_SPILL_SLOT` sits at
/// offset 0), so they stay valid no matter when during emission they're
/// computed -- unlike an offset counted down from the frame's eventual
/// size, which would go stale every time a later instruction grows the
/// frame. The `frame_size` parameter is kept only so call sites don't all
/// need updating in lockstep; it no longer affects the result.
pub fn operand(slot: usize, _frame_size: usize) -> String {
    if slot < FIRST_SPILL_SLOT {
        SLOT_REGS[slot].to_string()
    } else {
        let offset = ((slot - FIRST_SPILL_SLOT) as i64) * 8;
        format!("{offset}(%rsp)")
    }
}

/// Total bytes a frame must reserve to hold spill slots up to (exclusive)
/// `frame_slots`, rounded up to the 16-byte SysV stack alignment.
pub fn frame_bytes(frame_slots: usize) -> i64 {
    if frame_slots <= FIRST_SPILL_SLOT {
        return 0;
    }
    let raw = ((frame_slots - FIRST_SPILL_SLOT) as i64) * 8;
    (raw + 15) & !15
}

pub fn closure_env_reg() -> &'static str {
    SLOT_REGS[RESERVED_CLOSURE_ENV]
}

pub fn heap_ptr_reg() -> &'static str {
    SLOT_REGS[RESERVED_HEAP_PTR]
}

pub fn root_stack_top_reg() -> &'static str {
    SLOT_REGS[RESERVED_ROOT_STACK_TOP]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_slots_return_hardware_names() {
        assert_eq!(operand(0, 20), "%rdi");
        assert_eq!(operand(9, 20), closure_env_reg());
    }

    #[test]
    fn spill_slots_return_stack_operands() {
        assert_eq!(operand(12, 20), "0(%rsp)");
        assert_eq!(operand(13, 20), "8(%rsp)");
    }

    #[test]
    fn frame_bytes_rounds_up_to_16() {
        assert_eq!(frame_bytes(12), 0);
        assert_eq!(frame_bytes(13), 16);
        assert_eq!(frame_bytes(14), 16);
        assert_eq!(frame_bytes(15), 32);
    }
}
