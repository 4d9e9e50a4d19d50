//! Compiler environment: register/slot table and variable table (§4.2).
//!
//! Two parallel tables, pushed and popped as the code generator enters and
//! leaves lexical scopes: a handful of counters and maps mutated as
//! generation proceeds, widened to the slot/variable bookkeeping the
//! register allocator needs.

use std::collections::HashMap;

/// SysV argument registers occupy slots 0..=5 (volatile). 6..=8 are
/// non-volatile scratch. 9, 10, 11 are reserved: closure env, GC alloc
/// pointer, root-stack pointer. 12.. are stack-frame spill slots.
pub const ARG_SLOTS: usize = 6;
pub const NONVOLATILE_START: usize = 6;
pub const NONVOLATILE_END: usize = 9; // exclusive
pub const RESERVED_CLOSURE_ENV: usize = 9;
pub const RESERVED_HEAP_PTR: usize = 10;
pub const RESERVED_ROOT_STACK_TOP: usize = 11;
pub const FIRST_SPILL_SLOT: usize = 12;

/// The compile-time-known kind of a value occupying a slot or held by a
/// variable, used to specialize emission (e.g. ASCII vs. UTF-8 string
/// operations) and to validate tail-call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unknown,
    Fixnum,
    Boolean,
    Char,
    Nil,
    Cons,
    Vector,
    Str,
    Symbol,
    Closure,
}

#[derive(Debug, Clone)]
pub struct SlotEntry {
    pub kind: Kind,
    /// True while this slot currently holds the value of some variable.
    pub occupied: bool,
    /// Set while the slot's value must be rooted across a GC-triggering call.
    pub pointer_spill: bool,
    /// Set while the slot is being preserved across a nested call.
    pub arg_spill: bool,
}

impl SlotEntry {
    fn free() -> Self {
        SlotEntry {
            kind: Kind::Unknown,
            occupied: false,
            pointer_spill: false,
            arg_spill: false,
        }
    }
}

/// Result of a free-slot query that may require evicting a currently live
/// argument-register occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRequest {
    Slot(usize),
    /// No volatile slot was free; the caller must move the occupant of
    /// `evict` into a fresh non-volatile slot before reusing it.
    NeedsEviction { evict: usize },
}

#[derive(Debug, Clone)]
pub struct VarEntry {
    pub name: String,
    pub kind: Kind,
    pub is_constant: bool,
    pub is_function: bool,
    pub active: bool,
    /// For a constant: index into the `.data` constant pool. For a mutable
    /// binding: index into the register/slot table.
    pub location: Location,
    /// True when this binding is a captured variable whose slot holds a
    /// box cell's *address* rather than its value directly; reads and
    /// writes against it go through one extra indirection (§4.3).
    pub boxed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    ConstPool(usize),
    Slot(usize),
}

pub struct Environment {
    slots: Vec<SlotEntry>,
    variables: Vec<VarEntry>,
    next_const_index: usize,
}

impl Environment {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(FIRST_SPILL_SLOT);
        for _ in 0..FIRST_SPILL_SLOT {
            slots.push(SlotEntry::free());
        }
        Environment {
            slots,
            variables: Vec::new(),
            next_const_index: 0,
        }
    }

    fn is_reserved(slot: usize) -> bool {
        (RESERVED_CLOSURE_ENV..=RESERVED_ROOT_STACK_TOP).contains(&slot)
    }

    fn ensure_capacity(&mut self, slot: usize) {
        while self.slots.len() <= slot {
            self.slots.push(SlotEntry::free());
        }
    }

    /// Lowest-indexed unused, non-reserved slot, preferring registers
    /// (lower indices) over stack spill slots, expanding the table as
    /// needed.
    pub fn get_free_slot(&mut self) -> usize {
        self.get_free_slot_after(0)
    }

    /// Same as `get_free_slot`, skipping slots `< n`.
    pub fn get_free_slot_after(&mut self, n: usize) -> usize {
        let mut i = n;
        loop {
            if Self::is_reserved(i) {
                i += 1;
                continue;
            }
            self.ensure_capacity(i);
            if !self.slots[i].occupied {
                self.slots[i].occupied = true;
                return i;
            }
            i += 1;
        }
    }

    /// Used when argument ordering forces eviction of a currently occupied
    /// argument register: if no volatile slot below `n` is free, returns a
    /// request to relocate the occupant of the conflicting slot.
    pub fn get_free_slot_before(&mut self, n: usize) -> SlotRequest {
        for i in 0..n {
            if Self::is_reserved(i) {
                continue;
            }
            if !self.slots[i].occupied {
                self.slots[i].occupied = true;
                return SlotRequest::Slot(i);
            }
        }
        SlotRequest::NeedsEviction { evict: n.max(1) - 1 }
    }

    /// Copies the logical occupant of slot `i` into a freshly allocated
    /// slot `>= n`, clears `i`, and retargets any variable-table entry
    /// pointing at `i`.
    pub fn reassign_after(&mut self, i: usize, n: usize) -> usize {
        let new_slot = self.get_free_slot_after(n);
        let kind = self.slots[i].kind;
        self.slots[new_slot].kind = kind;
        self.slots[i] = SlotEntry::free();
        for var in self.variables.iter_mut() {
            if var.location == Location::Slot(i) {
                var.location = Location::Slot(new_slot);
            }
        }
        new_slot
    }

    pub fn free_slot(&mut self, i: usize) {
        if i < self.slots.len() {
            self.slots[i] = SlotEntry::free();
        }
    }

    pub fn slot(&self, i: usize) -> &SlotEntry {
        &self.slots[i]
    }

    pub fn slot_mut(&mut self, i: usize) -> &mut SlotEntry {
        self.ensure_capacity(i);
        &mut self.slots[i]
    }

    /// Byte offset from `%rsp` of spill slot `i` (`i >= FIRST_SPILL_SLOT`).
    /// Counted up from slot `FIRST_SPILL_SLOT` rather than down from the
    /// frame's final size, so it never goes stale as the frame grows
    /// during emission; mirrors `regs::operand`.
    pub fn spill_offset(i: usize) -> i64 {
        ((i - FIRST_SPILL_SLOT) as i64) * 8
    }

    // -- Variable table --------------------------------------------------

    pub fn push_variable(&mut self, name: &str, kind: Kind, location: Location, is_constant: bool) {
        self.variables.push(VarEntry {
            name: name.to_string(),
            kind,
            is_constant,
            is_function: false,
            active: true,
            location,
            boxed: false,
        });
    }

    /// Binds a captured free variable at its assigned slot. `boxed` marks
    /// slots that hold a box cell's address rather than the value itself.
    pub fn push_captured_variable(&mut self, name: &str, kind: Kind, slot: usize, boxed: bool) {
        self.variables.push(VarEntry {
            name: name.to_string(),
            kind,
            is_constant: false,
            is_function: false,
            active: true,
            location: Location::Slot(slot),
            boxed,
        });
    }

    pub fn push_function(&mut self, name: &str, location: Location) {
        self.variables.push(VarEntry {
            name: name.to_string(),
            kind: Kind::Closure,
            is_constant: false,
            is_function: true,
            active: true,
            location,
            boxed: false,
        });
    }

    /// Pop the most recently pushed variable; if it was mutable, its slot
    /// is freed.
    pub fn pop_variable(&mut self) -> Option<VarEntry> {
        let var = self.variables.pop()?;
        if !var.is_constant {
            if let Location::Slot(s) = var.location {
                self.free_slot(s);
            }
        }
        Some(var)
    }

    /// Latest-wins lookup: last pushed binding with this name wins.
    pub fn find_active_variable(&self, name: &str) -> Option<&VarEntry> {
        self.variables.iter().rev().find(|v| v.active && v.name == name)
    }

    pub fn rfind_active_variable(&self, name: &str) -> Option<&VarEntry> {
        self.find_active_variable(name)
    }

    pub fn alloc_const_index(&mut self) -> usize {
        let idx = self.next_const_index;
        self.next_const_index += 1;
        idx
    }

    pub fn active_constants(&self) -> Vec<VarEntry> {
        self.variables
            .iter()
            .filter(|v| v.active && v.is_constant)
            .cloned()
            .collect()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh environment for a lambda body inherits only the active
/// constants of its parent; its free-variable list is resolved against
/// the parent on exit by the caller (see `codegen::closures`).
pub fn child_environment(parent: &Environment) -> Environment {
    let mut env = Environment::new();
    for c in parent.active_constants() {
        env.variables.push(c);
    }
    env
}

/// Per-lambda growable list of captured names, each possibly boxed.
#[derive(Debug, Default)]
pub struct FreeVarList {
    entries: Vec<FreeVar>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct FreeVar {
    pub name: String,
    pub boxed: bool,
}

impl FreeVarList {
    pub fn new() -> Self {
        FreeVarList::default()
    }

    /// Record (or find) a capture; returns its index in capture order.
    pub fn capture(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.entries.len();
        self.entries.push(FreeVar {
            name: name.to_string(),
            boxed: false,
        });
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Force the box flag for a captured name (called when a `set!`
    /// targets it from within the capturing lambda).
    pub fn mark_boxed(&mut self, name: &str) {
        if let Some(&idx) = self.index.get(name) {
            self.entries[idx].boxed = true;
        }
    }

    pub fn entries(&self) -> &[FreeVar] {
        &self.entries
    }

    pub fn boxed_count(&self) -> usize {
        self.entries.iter().filter(|f| f.boxed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_slot_skips_reserved_registers() {
        let mut env = Environment::new();
        for _ in 0..NONVOLATILE_END {
            env.get_free_slot();
        }
        let next = env.get_free_slot();
        assert!(next >= FIRST_SPILL_SLOT || !(RESERVED_CLOSURE_ENV..=RESERVED_ROOT_STACK_TOP).contains(&next));
    }

    #[test]
    fn reassign_after_retargets_variable() {
        let mut env = Environment::new();
        let s = env.get_free_slot();
        env.push_variable("x", Kind::Fixnum, Location::Slot(s), false);
        let new_slot = env.reassign_after(s, NONVOLATILE_START);
        assert_eq!(
            env.find_active_variable("x").unwrap().location,
            Location::Slot(new_slot)
        );
        assert!(!env.slot(s).occupied);
    }

    #[test]
    fn pop_variable_frees_mutable_slot() {
        let mut env = Environment::new();
        let s = env.get_free_slot();
        env.push_variable("x", Kind::Fixnum, Location::Slot(s), false);
        env.pop_variable();
        assert!(!env.slot(s).occupied);
    }

    #[test]
    fn latest_wins_lookup() {
        let mut env = Environment::new();
        let s1 = env.get_free_slot();
        env.push_variable("x", Kind::Fixnum, Location::Slot(s1), false);
        let s2 = env.get_free_slot();
        env.push_variable("x", Kind::Boolean, Location::Slot(s2), false);
        assert_eq!(
            env.find_active_variable("x").unwrap().location,
            Location::Slot(s2)
        );
    }

    #[test]
    fn free_var_list_tracks_boxing() {
        let mut fv = FreeVarList::new();
        let idx = fv.capture("x");
        assert!(!fv.entries()[idx].boxed);
        fv.mark_boxed("x");
        assert!(fv.entries()[idx].boxed);
        assert_eq!(fv.boxed_count(), 1);
    }

    #[test]
    fn spill_offset_formula() {
        assert_eq!(Environment::spill_offset(12), 0);
        assert_eq!(Environment::spill_offset(13), 8);
    }
}
