//! Central code generator (§4.4): walks the parsed program and emits
//! x86-64 AT&T assembly text into the buffered `Sections`, threading an
//! `Environment` and a growable `Diagnostics` list through the recursion.
//! A single struct owns counters and mutable state; its methods return the
//! statically-known `Kind` of their result for specialization downstream.

pub mod argorder;
pub mod closures;
pub mod primitives;
pub mod sections;
pub mod tailcalls;

use std::collections::HashSet;

use crate::ast::{Expr, Pos, Program};
use crate::config::CompilerConfig;
use crate::diagnostics::{Diagnostics, Kind as DiagKind};
use crate::env::{self, child_environment, Environment, FreeVarList, Kind, Location};
use crate::prepass;
use crate::regs;
use crate::value_tags::{self, offsets};

use self::argorder::resolve_argument_order;
use self::closures::{CaptureSource, ClosureLayout};
use self::primitives::Arity;
use self::sections::Sections;

/// Per-function bookkeeping needed to recognize and rewrite a self tail
/// call: the function's own entry label, parameter count, and the
/// parameter slots a tail call must overwrite.
struct TailContext {
    name: String,
    entry_label: String,
    param_slots: Vec<usize>,
}

/// A directly callable named function: `(define (name ...) ...)` compiles
/// to its own label and is called with `call`, bypassing the closure
/// indirection that lambda *values* need (it has no free variables and
/// its identity is never passed around as data).
struct NamedFunction {
    name: String,
    label: String,
    arity: usize,
}

pub struct CodeGen {
    env: Environment,
    sections: Sections,
    pub diagnostics: Diagnostics,
    label_counter: usize,
    max_frame_slots: usize,
    tail_ctx: Vec<TailContext>,
    quote_counter: usize,
    functions: Vec<NamedFunction>,
    /// Nesting depth of function/lambda bodies currently being emitted;
    /// `push_line` consults this (not `tail_ctx`, which only tracks named
    /// self-recursive contexts) to route into the `fun` buffer instead of
    /// the top-level `main` buffer.
    fn_depth: usize,
}

impl CodeGen {
    pub fn new() -> Self {
        CodeGen {
            env: Environment::new(),
            sections: Sections::new(),
            diagnostics: Diagnostics::new(),
            label_counter: 0,
            max_frame_slots: 0,
            tail_ctx: Vec::new(),
            quote_counter: 0,
            functions: Vec::new(),
            fn_depth: 0,
        }
    }

    fn new_label(&mut self, prefix: &str) -> String {
        let n = self.label_counter;
        self.label_counter += 1;
        format!(".L{prefix}_{n}")
    }

    fn err(&mut self, pos: Pos, kind: DiagKind) {
        self.diagnostics.push(pos, kind);
    }

    fn frame_size(&self) -> usize {
        self.max_frame_slots
    }

    fn operand(&mut self, slot: usize) -> String {
        if slot >= self.max_frame_slots {
            self.max_frame_slots = slot + 1;
        }
        regs::operand(slot, self.frame_size())
    }

    /// Pushes every occupied slot -- register-resident (0..NONVOLATILE_END)
    /// and stack-spilled (>= FIRST_SPILL_SLOT) alike -- onto the root stack
    /// ahead of a call that might clobber it. Registers
    /// (0..NONVOLATILE_END) are pushed because none of %rdi/%rsi/%rdx/%rcx/
    /// %r8/%r9 survive a call under the SysV contract, and %rbx/%r12/%r13,
    /// while nominally callee-saved, are never actually saved by this
    /// compiler's own generated functions. Stack-spill slots (>=
    /// FIRST_SPILL_SLOT) are pushed too, for a different reason: a
    /// callee's own frame sits below the caller's and never overwrites a
    /// live spill slot's memory, but a *relocating* collector still has to
    /// see every live heap pointer to rewrite it after a copy, wherever
    /// that pointer physically lives. The root stack doubles as the spill
    /// area for both concerns, rather than keeping a separate
    /// machine-stack spill region as architecturally distinct from GC
    /// rooting, because both problems disappear with the same
    /// push-before/pop-after discipline and every value live across a call
    /// boundary might itself be a pointer the collector needs to see.
    fn spill_live_across_call(&mut self) -> Vec<usize> {
        let rs = regs::root_stack_top_reg();
        let mut spilled = Vec::new();
        let frame_slots = self.max_frame_slots;
        for i in (0..env::NONVOLATILE_END).chain(env::FIRST_SPILL_SLOT..frame_slots) {
            if self.env.slot(i).occupied {
                let operand = self.operand(i);
                self.push_line(&format!("    movq {operand}, ({rs})"));
                self.push_line(&format!("    addq $8, {rs}"));
                spilled.push(i);
            }
        }
        spilled
    }

    /// Undoes `spill_live_across_call`, popping values back in reverse push
    /// order into the same slots they came from.
    fn restore_live_across_call(&mut self, spilled: &[usize]) {
        let rs = regs::root_stack_top_reg();
        for &i in spilled.iter().rev() {
            self.push_line(&format!("    subq $8, {rs}"));
            let operand = self.operand(i);
            self.push_line(&format!("    movq ({rs}), {operand}"));
        }
    }

    /// Checkpoints the collector ahead of an allocation that might not fit
    /// in the nursery (§4.5): every live register slot is rooted on the
    /// root stack, `collect` runs (which may relocate anything reachable
    /// from it), and the refreshed heap/root-stack pointers and slot
    /// values are reloaded afterward.
    fn emit_gc_checkpoint(&mut self) {
        let spilled = self.spill_live_across_call();
        self.push_line(&format!("    movq {}, %rdi", regs::root_stack_top_reg()));
        self.push_line("    call collect@PLT");
        self.push_line(&format!("    movq %rax, {}", regs::heap_ptr_reg()));
        self.push_line(&format!("    movq %rdx, {}", regs::root_stack_top_reg()));
        self.restore_live_across_call(&spilled);
    }

    // -- Top-level entry --------------------------------------------------

    /// Compiles an entire program, returning finished assembly text or the
    /// diagnostics collected along the way.
    pub fn generate(program: &Program, config: &CompilerConfig) -> Result<String, Diagnostics> {
        let mut cg = CodeGen::new();
        cg.emit_main_header(config);
        let frame_insert_at = cg.sections.main_prologue.len();
        cg.run_program(program);
        let frame_bytes = regs::frame_bytes(cg.max_frame_slots);
        if frame_bytes > 0 {
            cg.sections
                .main_prologue
                .insert_str(frame_insert_at, &format!("    subq ${frame_bytes}, %rsp\n"));
        }
        cg.emit_main_footer(frame_bytes);
        if cg.diagnostics.is_empty() {
            Ok(cg.sections.assemble())
        } else {
            Err(cg.diagnostics)
        }
    }

    /// `main:` prologue: initializes the GC (gen0/gen1 from-space and
    /// to-space, and the root stack) and pins the two reserved runtime
    /// registers to the values it returns.
    fn emit_main_header(&mut self, config: &CompilerConfig) {
        self.sections.push_main("main:");
        self.sections.push_main("    pushq %rbp");
        self.sections.push_main(&format!(
            "    movq ${}, %rdi",
            config.root_stack_size
        ));
        self.sections
            .push_main(&format!("    movq ${}, %rsi", config.heap_size));
        self.sections.push_main("    call init_gc@PLT");
        self.sections
            .push_main(&format!("    movq %rax, {}", regs::heap_ptr_reg()));
        self.sections
            .push_main(&format!("    movq %rdx, {}", regs::root_stack_top_reg()));
    }

    /// `print(value)` runs exactly once, here, against whatever the last
    /// top-level form left in the return register -- never once per
    /// top-level expression.
    fn emit_main_footer(&mut self, frame_bytes: i64) {
        self.sections
            .push_end(&format!("    movq {}, %rdi", regs::RETURN_REG));
        self.sections.push_end("    call print@PLT");
        if frame_bytes > 0 {
            self.sections.push_end(&format!("    addq ${frame_bytes}, %rsp"));
        }
        self.sections.push_end("    call cleanup@PLT");
        self.sections.push_end("    movq $0, %rax");
        self.sections.push_end("    popq %rbp");
        self.sections.push_end("    ret");
    }

    fn run_program(&mut self, program: &Program) {
        let constants = prepass::classify_constants(&program.exprs);
        for e in &program.exprs {
            if let Some(items) = e.as_list() {
                if items.first().and_then(|h| h.as_symbol()) == Some("define") {
                    self.emit_top_level_define(items, e.pos(), &constants);
                    continue;
                }
            }
            self.emit_top_level_expr(e);
        }
    }

    /// Only the program's last top-level form has its value printed, and
    /// that single `print` call lives in `emit_main_footer`; here we only
    /// evaluate, leaving the result in the return register for whichever
    /// top-level form follows (or for the epilogue, if this was the last).
    fn emit_top_level_expr(&mut self, e: &Expr) {
        self.emit_to_return_register(e, false);
    }

    fn emit_top_level_define(&mut self, items: &[Expr], pos: Pos, constants: &HashSet<String>) {
        // Long form: (define (name args...) body...)
        if items.len() >= 2 {
            if let Some(header) = items[1].as_list() {
                let Some(name) = header.first().and_then(|h| h.as_symbol()) else {
                    self.err(pos, DiagKind::NonSymbolInFunctionPosition);
                    return;
                };
                let params: Vec<&str> = header[1..].iter().filter_map(|p| p.as_symbol()).collect();
                self.emit_function_definition(name, &params, &items[2..], pos);
                return;
            }
        }
        // Short form: (define name value)
        if items.len() != 3 {
            self.err(pos, DiagKind::ExpectedBinary);
            return;
        }
        let Some(name) = items[1].as_symbol() else {
            self.err(pos, DiagKind::NonSymbolInFunctionPosition);
            return;
        };
        if constants.contains(name) {
            let idx = self.env.alloc_const_index();
            let kind = self.classify_literal(&items[2]);
            self.emit_const_definition(idx, &items[2]);
            self.env
                .push_variable(name, kind, Location::ConstPool(idx), true);
            return;
        }
        let kind = self.emit_to_return_register(&items[2], false);
        let slot = self.env.get_free_slot();
        let dest = self.operand(slot);
        self.sections
            .push_main(&format!("    movq {}, {dest}", regs::RETURN_REG));
        self.env.push_variable(name, kind, Location::Slot(slot), false);
    }

    fn classify_literal(&self, e: &Expr) -> Kind {
        match e {
            Expr::Fixnum(..) => Kind::Fixnum,
            Expr::Boolean(..) => Kind::Boolean,
            Expr::AsciiChar(..) | Expr::UnicodeChar(..) => Kind::Char,
            Expr::Null(..) => Kind::Nil,
            _ => Kind::Unknown,
        }
    }

    fn emit_const_definition(&mut self, idx: usize, e: &Expr) {
        let label = format!("const_{idx}");
        let value = match e {
            Expr::Fixnum(n, _) => value_tags::tag_fixnum(*n),
            Expr::Boolean(b, _) => value_tags::tag_bool(*b),
            Expr::AsciiChar(c, _) => value_tags::tag_char(*c as i64),
            Expr::UnicodeChar(c, _) => value_tags::tag_char(*c as i64),
            Expr::Null(_) => value_tags::NIL,
            _ => 0,
        };
        self.sections.push_data(&format!("{label}: .quad {value}"));
    }

    // -- Function definitions ---------------------------------------------

    fn emit_function_definition(&mut self, name: &str, params: &[&str], body: &[Expr], pos: Pos) {
        let entry_label = format!("fn_{name}");
        let saved_env = std::mem::replace(&mut self.env, child_environment(&self.env));
        let saved_max = self.max_frame_slots;
        self.max_frame_slots = 0;

        let mut param_slots = Vec::with_capacity(params.len());
        for (i, p) in params.iter().enumerate() {
            self.env.get_free_slot();
            self.env
                .push_variable(p, Kind::Unknown, Location::Slot(i), false);
            param_slots.push(i);
        }
        self.max_frame_slots = self.max_frame_slots.max(params.len());

        self.tail_ctx.push(TailContext {
            name: name.to_string(),
            entry_label: entry_label.clone(),
            param_slots,
        });
        // Registered before the body is emitted so that ordinary
        // (non-tail) recursive calls resolve to a direct `call`, not a
        // closure-value lookup.
        self.functions.push(NamedFunction {
            name: name.to_string(),
            label: entry_label.clone(),
            arity: params.len(),
        });

        self.sections.enter_lambda();
        self.sections.push_fun_line(&format!("{entry_label}:"));
        self.fn_depth += 1;
        self.emit_body(body, true);
        self.fn_depth -= 1;
        let frame_bytes = regs::frame_bytes(self.max_frame_slots);
        self.sections
            .replace_in_current_fun("__FRAME_BYTES__", &frame_bytes.to_string());
        self.sections.push_fun_line("    ret");
        self.sections.exit_lambda_with_frame(frame_bytes);

        self.tail_ctx.pop();
        self.env = saved_env;
        self.max_frame_slots = saved_max;
        let _ = pos;
    }

    /// Emits a body (sequence of expressions), only the last of which is
    /// evaluated for its value; `tail` marks whether that last expression
    /// sits in tail position of an enclosing function.
    fn emit_body(&mut self, body: &[Expr], tail: bool) -> Kind {
        if body.is_empty() {
            self.sections
                .push_fun_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
            return Kind::Nil;
        }
        for (i, e) in body.iter().enumerate() {
            let is_last = tailcalls::is_tail_position(i, body.len());
            if is_last {
                return self.emit_to_return_register(e, tail);
            }
            self.emit_to_return_register(e, false);
        }
        unreachable!()
    }

    // -- Expression dispatch ------------------------------------------------

    /// Emits code leaving the expression's value in the fixed return
    /// register. `tail` is true only when this expression is in tail
    /// position of the function/lambda currently being generated.
    fn emit_to_return_register(&mut self, e: &Expr, tail: bool) -> Kind {
        match e {
            Expr::Fixnum(n, _) => {
                self.push_line(&format!(
                    "    movq ${}, {}",
                    value_tags::tag_fixnum(*n),
                    regs::RETURN_REG
                ));
                Kind::Fixnum
            }
            Expr::Boolean(b, _) => {
                self.push_line(&format!(
                    "    movq ${}, {}",
                    value_tags::tag_bool(*b),
                    regs::RETURN_REG
                ));
                Kind::Boolean
            }
            Expr::AsciiChar(c, _) => {
                self.push_line(&format!(
                    "    movq ${}, {}",
                    value_tags::tag_char(*c as i64),
                    regs::RETURN_REG
                ));
                Kind::Char
            }
            Expr::UnicodeChar(c, _) => {
                self.push_line(&format!(
                    "    movq ${}, {}",
                    value_tags::tag_char(*c as i64),
                    regs::RETURN_REG
                ));
                Kind::Char
            }
            Expr::Null(_) => {
                self.push_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
                Kind::Nil
            }
            Expr::Str(s, _) => self.emit_string_literal(&s.text),
            Expr::Symbol(name, pos) => self.emit_variable_reference(name, *pos),
            Expr::Vector(_, pos) => {
                self.err(*pos, DiagKind::ExpectedList);
                Kind::Unknown
            }
            Expr::List(items, pos) => self.emit_list(items, *pos, tail),
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.fn_depth == 0 {
            self.sections.push_main(line);
        } else {
            self.sections.push_fun_line(line);
        }
    }

    fn emit_string_literal(&mut self, text: &str) -> Kind {
        let label = self.build_quoted_string_record(text);
        self.push_line(&format!("    leaq {label}(%rip), {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::STRING_TAG,
            regs::RETURN_REG
        ));
        Kind::Str
    }

    fn emit_variable_reference(&mut self, name: &str, pos: Pos) -> Kind {
        let Some(var) = self.env.find_active_variable(name) else {
            self.err(pos, DiagKind::UndefinedSymbol(name.to_string()));
            return Kind::Unknown;
        };
        let kind = var.kind;
        match var.location {
            Location::ConstPool(idx) => {
                self.push_line(&format!(
                    "    movq const_{idx}(%rip), {}",
                    regs::RETURN_REG
                ));
            }
            Location::Slot(slot) => {
                let operand = self.operand(slot);
                self.push_line(&format!("    movq {operand}, {}", regs::RETURN_REG));
                if var.boxed {
                    for line in closures::emit_load_boxed_capture(regs::RETURN_REG, regs::RETURN_REG) {
                        self.push_line(&format!("    {line}"));
                    }
                }
            }
        }
        kind
    }

    fn emit_list(&mut self, items: &[Expr], pos: Pos, tail: bool) -> Kind {
        let Some(head) = items.first() else {
            self.err(pos, DiagKind::EmptyList);
            return Kind::Unknown;
        };
        if let Some(name) = head.as_symbol() {
            match name {
                "if" => return self.emit_if(items, pos, tail),
                "begin" => return self.emit_body(&items[1..], tail),
                "let" => return self.emit_let(items, pos, tail, false),
                "let*" => return self.emit_let(items, pos, tail, true),
                "lambda" => return self.emit_lambda_literal(items, pos),
                "set!" => return self.emit_set(items, pos),
                "quote" => return self.emit_quote(&items[1], pos),
                _ => {}
            }
            if let Some(sig) = primitives::primitive_signature(name) {
                return self.emit_primitive_call(name, sig.arity, &items[1..], pos);
            }
            return self.emit_call(name, &items[1..], pos, tail);
        }
        self.err(pos, DiagKind::NonSymbolInFunctionPosition);
        Kind::Unknown
    }

    fn emit_if(&mut self, items: &[Expr], pos: Pos, tail: bool) -> Kind {
        if items.len() != 3 && items.len() != 4 {
            self.err(pos, DiagKind::ExpectedTernary);
            return Kind::Unknown;
        }
        self.emit_to_return_register(&items[1], false);
        let else_label = self.new_label("if_else");
        let end_label = self.new_label("if_end");
        self.push_line(&format!("    cmpq ${}, {}", value_tags::BOOL_FALSE, regs::RETURN_REG));
        self.push_line(&format!("    je {else_label}"));
        let then_kind = self.emit_to_return_register(&items[2], tail);
        self.push_line(&format!("    jmp {end_label}"));
        self.push_line(&format!("{else_label}:"));
        let else_kind = if items.len() == 4 {
            self.emit_to_return_register(&items[3], tail)
        } else {
            self.push_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
            Kind::Nil
        };
        self.push_line(&format!("{end_label}:"));
        if then_kind == else_kind {
            then_kind
        } else {
            Kind::Unknown
        }
    }

    fn emit_let(&mut self, items: &[Expr], pos: Pos, tail: bool, sequential: bool) -> Kind {
        let Some(bindings) = items.get(1).and_then(|e| e.as_list()) else {
            self.err(pos, DiagKind::ExpectedList);
            return Kind::Unknown;
        };
        let mut names = Vec::with_capacity(bindings.len());
        if sequential {
            // `let*`: each binding's initializer is resolved against an
            // environment that already includes every binding before it, so
            // push right after evaluating.
            for b in bindings {
                let Some((name, kind, slot)) = self.emit_let_binding(b) else {
                    continue;
                };
                self.env.push_variable(name, kind, Location::Slot(slot), false);
                names.push(name.to_string());
            }
        } else {
            // `let`: every initializer is resolved against the environment as
            // it stood before this form, so no binding can see a sibling's
            // new name. Evaluate all of them first, then push the new
            // variables only once every initializer has run.
            let mut pending = Vec::with_capacity(bindings.len());
            for b in bindings {
                let Some((name, kind, slot)) = self.emit_let_binding(b) else {
                    continue;
                };
                pending.push((name.to_string(), kind, slot));
            }
            for (name, kind, slot) in pending {
                self.env.push_variable(&name, kind, Location::Slot(slot), false);
                names.push(name);
            }
        }
        let result = self.emit_body(&items[2..], tail);
        for _ in &names {
            self.env.pop_variable();
        }
        result
    }

    /// Validates and evaluates one `(name value)` binding of a `let`/`let*`
    /// into a fresh slot, without touching the variable table -- the caller
    /// decides when (and in what order) the new binding becomes visible.
    fn emit_let_binding<'e>(&mut self, b: &'e Expr) -> Option<(&'e str, Kind, usize)> {
        let Some(pair) = b.as_list() else {
            self.err(b.pos(), DiagKind::ExpectedList);
            return None;
        };
        let (Some(name_expr), Some(value_expr)) = (pair.first(), pair.get(1)) else {
            self.err(b.pos(), DiagKind::ExpectedBinary);
            return None;
        };
        let Some(name) = name_expr.as_symbol() else {
            self.err(name_expr.pos(), DiagKind::NonSymbolInFunctionPosition);
            return None;
        };
        let kind = self.emit_to_return_register(value_expr, false);
        let slot = self.env.get_free_slot();
        let dest = self.operand(slot);
        self.push_line(&format!("    movq {}, {dest}", regs::RETURN_REG));
        Some((name, kind, slot))
    }

    fn emit_set(&mut self, items: &[Expr], pos: Pos) -> Kind {
        if items.len() != 3 {
            self.err(pos, DiagKind::ExpectedBinary);
            return Kind::Unknown;
        }
        let Some(name) = items[1].as_symbol() else {
            self.err(pos, DiagKind::NonSymbolInFunctionPosition);
            return Kind::Unknown;
        };
        self.emit_to_return_register(&items[2], false);
        let Some(var) = self.env.find_active_variable(name) else {
            self.err(pos, DiagKind::UndefinedSymbol(name.to_string()));
            return Kind::Unknown;
        };
        match var.location {
            Location::Slot(slot) if var.boxed => {
                let box_addr = self.operand(slot);
                self.push_line(&format!("    movq {box_addr}, {}", regs::SCRATCH_REG));
                for line in
                    closures::emit_store_boxed_capture(regs::SCRATCH_REG, regs::RETURN_REG)
                {
                    self.push_line(&format!("    {line}"));
                }
            }
            Location::Slot(slot) => {
                let dest = self.operand(slot);
                self.push_line(&format!("    movq {}, {dest}", regs::RETURN_REG));
            }
            Location::ConstPool(_) => {
                self.err(pos, DiagKind::UndefinedSymbol(name.to_string()));
            }
        }
        Kind::Nil
    }

    fn emit_quote(&mut self, e: &Expr, pos: Pos) -> Kind {
        let _ = pos;
        match e {
            Expr::Fixnum(..) | Expr::Boolean(..) | Expr::AsciiChar(..) | Expr::UnicodeChar(..) | Expr::Null(..) => {
                self.emit_to_return_register(e, false)
            }
            Expr::Str(s, _) => self.emit_string_literal(&s.text),
            Expr::List(items, _) => self.emit_quoted_cons_chain(items),
            Expr::Vector(items, _) => self.emit_quoted_vector(items),
            Expr::Symbol(name, _) => self.emit_quoted_symbol(name),
        }
    }

    /// The `.quad`-literal operand for one element nested inside a quoted
    /// list or vector: a leaf literal's own tagged value, or -- recursing
    /// into its own static record in the `quotes`/`data` section -- the
    /// tagged address of a nested string, symbol, list, or vector. Every
    /// `Expr` variant is quotable, so this never falls back to a
    /// placeholder value.
    fn quoted_literal_operand(&mut self, item: &Expr) -> String {
        match item {
            Expr::Fixnum(..) | Expr::Boolean(..) | Expr::AsciiChar(..) | Expr::UnicodeChar(..) | Expr::Null(..) => {
                literal_tagged_value(item)
                    .expect("leaf literal kinds always have a tagged value")
                    .to_string()
            }
            Expr::Str(s, _) => {
                let label = self.build_quoted_string_record(&s.text);
                format!("{label} + {}", value_tags::STRING_TAG)
            }
            Expr::Symbol(name, _) => {
                let label = self.build_quoted_symbol_record(name);
                format!("{label} + {}", value_tags::SYMBOL_TAG)
            }
            Expr::List(items, _) => match self.build_quoted_cons_chain(items) {
                Some(label) => format!("{label} + {}", value_tags::CONS_TAG),
                None => value_tags::NIL.to_string(),
            },
            Expr::Vector(items, _) => {
                let label = self.build_quoted_vector_record(items);
                format!("{label} + {}", value_tags::VECTOR_TAG)
            }
        }
    }

    /// Writes a string's length-prefixed byte record to `.data` and
    /// returns its label, without emitting any instructions -- shared by
    /// top-level `(quote "...")` (`emit_string_literal`, which also pins
    /// the tagged address into the return register) and by
    /// `quoted_literal_operand`, which only needs the label to build a
    /// `label + tag` reference inside an enclosing record.
    fn build_quoted_string_record(&mut self, text: &str) -> String {
        let label = format!("str_{}", self.quote_counter);
        self.quote_counter += 1;
        self.sections.push_data(&format!(
            "{label}: .quad {}",
            value_tags::tag_fixnum(text.len() as i64)
        ));
        self.sections.push_data(&format!("    .ascii \"{}\"", escape_asm_string(text)));
        label
    }

    /// A quoted symbol materializes as a tagged pointer into a static,
    /// read-only name record (length-prefixed bytes, same shape as a
    /// string literal's data) rather than a heap allocation: the data
    /// model marks the symbol tag "reserved... not implemented in GC
    /// copy", which this reads as "lives outside the semispaces the
    /// collector ever scans" rather than "unsupported". A static record
    /// never moves, so the collector never needs to trace or forward it.
    fn build_quoted_symbol_record(&mut self, name: &str) -> String {
        let label = format!("sym_{}", self.quote_counter);
        self.quote_counter += 1;
        self.sections.push_data(&format!(
            "{label}: .quad {}",
            value_tags::tag_fixnum(name.len() as i64)
        ));
        self.sections
            .push_data(&format!("    .ascii \"{}\"", escape_asm_string(name)));
        label
    }

    fn emit_quoted_symbol(&mut self, name: &str) -> Kind {
        let label = self.build_quoted_symbol_record(name);
        self.push_line(&format!("    leaq {label}(%rip), {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::SYMBOL_TAG,
            regs::RETURN_REG
        ));
        Kind::Symbol
    }

    /// Writes a quoted proper list's cons cells to the `quotes` section,
    /// recursing into `quoted_literal_operand` for each element (so a
    /// nested list, vector, string, or symbol gets its own static record
    /// rather than a placeholder), and returns the head cell's label, or
    /// `None` for the empty list (which has no cell -- it's just `NIL`).
    fn build_quoted_cons_chain(&mut self, items: &[Expr]) -> Option<String> {
        if items.is_empty() {
            return None;
        }
        let label = format!("quote_{}", self.quote_counter);
        self.quote_counter += 1;
        let mut cell_labels = Vec::with_capacity(items.len());
        for i in 0..items.len() {
            cell_labels.push(format!("{label}_cell_{i}"));
        }
        for i in 0..items.len() {
            let car_value = self.quoted_literal_operand(&items[i]);
            let cdr_ref = if i + 1 < items.len() {
                format!("{} + {}", cell_labels[i + 1], value_tags::CONS_TAG)
            } else {
                value_tags::NIL.to_string()
            };
            self.sections
                .push_quote(&format!("{}: .quad {car_value}", cell_labels[i]));
            self.sections.push_quote(&format!("    .quad {cdr_ref}"));
        }
        Some(cell_labels[0].clone())
    }

    fn emit_quoted_cons_chain(&mut self, items: &[Expr]) -> Kind {
        let Some(head_label) = self.build_quoted_cons_chain(items) else {
            self.push_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
            return Kind::Nil;
        };
        self.push_line(&format!("    leaq {head_label}(%rip), {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::CONS_TAG,
            regs::RETURN_REG
        ));
        Kind::Cons
    }

    /// Writes a quoted vector's length header and elements to the
    /// `quotes` section, recursing into `quoted_literal_operand` for each
    /// element, and returns its label.
    fn build_quoted_vector_record(&mut self, items: &[Expr]) -> String {
        let label = format!("quote_{}", self.quote_counter);
        self.quote_counter += 1;
        self.sections
            .push_quote(&format!("{label}: .quad {}", value_tags::tag_fixnum(items.len() as i64)));
        for i in 0..items.len() {
            let v = self.quoted_literal_operand(&items[i]);
            self.sections.push_quote(&format!("    .quad {v}"));
        }
        let _ = offsets::VECTOR_DATA;
        label
    }

    fn emit_quoted_vector(&mut self, items: &[Expr]) -> Kind {
        let label = self.build_quoted_vector_record(items);
        self.push_line(&format!("    leaq {label}(%rip), {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::VECTOR_TAG,
            regs::RETURN_REG
        ));
        Kind::Vector
    }

    // -- Lambdas and closures -----------------------------------------------

    fn emit_lambda_literal(&mut self, items: &[Expr], pos: Pos) -> Kind {
        let Some(params) = items.get(1).and_then(|e| e.as_list()) else {
            self.err(pos, DiagKind::ExpectedList);
            return Kind::Unknown;
        };
        let param_names: Vec<&str> = params.iter().filter_map(|p| p.as_symbol()).collect();
        let body = &items[2..];

        let locals: HashSet<String> = param_names.iter().map(|s| s.to_string()).collect();
        let mut free_vars = FreeVarList::new();
        prepass::mark_boxed_captures(body, &locals, &mut free_vars);
        collect_free_variable_references(body, &locals, &mut free_vars);

        let code_label = self.new_label("lambda");
        let arity = param_names.len();

        let captures: Vec<CaptureSource> = free_vars
            .entries()
            .iter()
            .map(|fv| {
                let operand = self
                    .env
                    .find_active_variable(&fv.name)
                    .map(|v| match v.location {
                        Location::Slot(s) => regs::operand(s, self.max_frame_slots),
                        Location::ConstPool(idx) => format!("const_{idx}(%rip)"),
                    })
                    .unwrap_or_else(|| "$0".to_string());
                CaptureSource {
                    name: fv.name.clone(),
                    boxed: fv.boxed,
                    operand,
                }
            })
            .collect();
        let layout = ClosureLayout::compute(&free_vars);

        self.emit_gc_checkpoint();

        for line in closures::emit_closure_construction(
            &layout,
            &captures,
            &code_label,
            arity,
            regs::heap_ptr_reg(),
            regs::SCRATCH_REG,
        ) {
            self.push_line(&format!("    {line}"));
        }
        for line in
            closures::emit_tag_closure(regs::SCRATCH_REG, regs::RETURN_REG, layout.boxed_count)
        {
            self.push_line(&format!("    {line}"));
        }
        self.push_line(&format!(
            "    addq ${}, {}",
            layout.total_bytes,
            regs::heap_ptr_reg()
        ));

        // Emit the lambda body into its own `fun` buffer.
        let saved_env = std::mem::replace(&mut self.env, child_environment(&self.env));
        let saved_max = self.max_frame_slots;
        self.max_frame_slots = 0;
        for (i, p) in param_names.iter().enumerate() {
            self.env.get_free_slot();
            self.env.push_variable(p, Kind::Unknown, Location::Slot(i), false);
        }
        let mut capture_slots = Vec::with_capacity(free_vars.entries().len());
        for fv in free_vars.entries() {
            let slot = self.env.get_free_slot_after(param_names.len());
            self.env.push_captured_variable(&fv.name, Kind::Unknown, slot, fv.boxed);
            capture_slots.push(slot);
        }
        self.max_frame_slots = self.max_frame_slots.max(param_names.len());

        self.sections.enter_lambda();
        self.sections.push_fun_line(&format!("{code_label}:"));
        self.fn_depth += 1;

        // Untag the closure-env register and load every captured field
        // into its assigned slot. Boxed captures load the box cell's
        // *address* (the field itself); `emit_variable_reference`/
        // `emit_set` add the extra indirection to reach the value.
        if !capture_slots.is_empty() {
            self.push_line(&format!(
                "    movq {}, {}",
                regs::closure_env_reg(),
                regs::SCRATCH_REG
            ));
            self.push_line(&format!(
                "    andq ${}, {}",
                !value_tags::PTR_TAG_MASK & 0xFF,
                regs::SCRATCH_REG
            ));
            for (i, &slot) in capture_slots.iter().enumerate() {
                let field_off = offsets::CLOSURE_FREE_VARS + (i as i64) * 8;
                let dest = self.operand(slot);
                self.push_line(&format!(
                    "    movq {field_off}({}), {dest}",
                    regs::SCRATCH_REG
                ));
            }
        }

        self.emit_body(body, true);
        self.fn_depth -= 1;
        self.sections.push_fun_line("    ret");
        self.sections
            .exit_lambda_with_frame(regs::frame_bytes(self.max_frame_slots));

        self.env = saved_env;
        self.max_frame_slots = saved_max;

        Kind::Closure
    }

    // -- Calls ---------------------------------------------------------------

    fn emit_primitive_call(&mut self, name: &str, arity: Arity, args: &[Expr], pos: Pos) -> Kind {
        if !arity.accepts(args.len()) {
            self.err(
                pos,
                DiagKind::ArityMismatch {
                    expected: format!("{arity:?}"),
                    got: args.len(),
                },
            );
            return Kind::Unknown;
        }
        if let Some(path) = primitives::cxr_path(name) {
            self.emit_to_return_register(&args[0], false);
            for is_car in path {
                let offset = if is_car {
                    value_tags::offsets::CONS_CAR
                } else {
                    value_tags::offsets::CONS_CDR
                };
                self.push_line(&format!(
                    "    andq ${}, {}",
                    !value_tags::PTR_TAG_MASK & 0xFF,
                    regs::RETURN_REG
                ));
                self.push_line(&format!(
                    "    movq {offset}({}), {}",
                    regs::RETURN_REG,
                    regs::RETURN_REG
                ));
            }
            return Kind::Unknown;
        }
        match name {
            "+" | "-" | "*" | "/" | "modulo" => self.emit_arithmetic(name, args),
            "1+" | "1-" => self.emit_increment(name, &args[0]),
            "=" | "<" | "<=" | ">" | ">=" => self.emit_comparison(name, args),
            "cons" => self.emit_cons(&args[0], &args[1]),
            "zero?" => self.emit_predicate_against_immediate(&args[0], value_tags::tag_fixnum(0)),
            "one?" => self.emit_predicate_against_immediate(&args[0], value_tags::tag_fixnum(1)),
            "null?" => self.emit_predicate_against_immediate(&args[0], value_tags::NIL),
            "pair?" => self.emit_tag_predicate(&args[0], value_tags::CONS_TAG),
            "vector?" => self.emit_tag_predicate(&args[0], value_tags::VECTOR_TAG),
            "string?" => self.emit_tag_predicate(&args[0], value_tags::STRING_TAG),
            "and" => self.emit_and(args),
            "or" => self.emit_or(args),
            "set-car!" => self.emit_set_field(&args[0], &args[1], offsets::CONS_CAR),
            "set-cdr!" => self.emit_set_field(&args[0], &args[1], offsets::CONS_CDR),
            "make-vector" => self.emit_make_vector(args),
            "vector" => self.emit_vector_literal(args),
            "vector-ref" => self.emit_vector_ref(&args[0], &args[1]),
            "vector-set!" => self.emit_vector_set(&args[0], &args[1], &args[2]),
            "vector-length" => self.emit_length_header(&args[0]),
            "make-string" => self.emit_make_string(args),
            "string" => self.emit_string_ctor(args),
            "string-ref" => self.emit_string_ref(&args[0], &args[1]),
            "string-set!" => self.emit_string_set(&args[0], &args[1], &args[2], pos),
            "string-length" => self.emit_string_length(&args[0]),
            "exit" => self.emit_exit(),
            _ => {
                // Every primitive in `primitives::primitive_table` is
                // specialized above; anything else reaching here is a
                // parser/resolution bug, not a missing primitive.
                for a in args {
                    self.emit_to_return_register(a, false);
                }
                Kind::Unknown
            }
        }
    }

    /// `pair?`/`vector?`/`string?`: mask the low 3 bits and compare against
    /// the object's pointer tag. Immediates never collide with these
    /// patterns (fixnums clear the low 2 bits; char/bool/nil occupy a
    /// distinct low-byte pattern), so a bare tag compare is sufficient.
    fn emit_tag_predicate(&mut self, arg: &Expr, tag: i64) -> Kind {
        self.emit_to_return_register(arg, false);
        self.push_line(&format!(
            "    andq ${}, {}",
            value_tags::PTR_TAG_MASK,
            regs::RETURN_REG
        ));
        self.push_line(&format!("    cmpq ${tag}, {}", regs::RETURN_REG));
        let set_true = self.new_label("pred_true");
        let end = self.new_label("pred_end");
        self.push_line(&format!("    je {set_true}"));
        self.push_line(&format!("    movq ${}, {}", value_tags::BOOL_FALSE, regs::RETURN_REG));
        self.push_line(&format!("    jmp {end}"));
        self.push_line(&format!("{set_true}:"));
        self.push_line(&format!("    movq ${}, {}", value_tags::BOOL_TRUE, regs::RETURN_REG));
        self.push_line(&format!("{end}:"));
        Kind::Boolean
    }

    /// Short-circuiting `and`: stop at the first false value.
    fn emit_and(&mut self, args: &[Expr]) -> Kind {
        let end = self.new_label("and_end");
        for (i, a) in args.iter().enumerate() {
            self.emit_to_return_register(a, false);
            if i + 1 < args.len() {
                self.push_line(&format!("    cmpq ${}, {}", value_tags::BOOL_FALSE, regs::RETURN_REG));
                self.push_line(&format!("    je {end}"));
            }
        }
        self.push_line(&format!("{end}:"));
        Kind::Unknown
    }

    /// Short-circuiting `or`: stop at the first truthy value.
    fn emit_or(&mut self, args: &[Expr]) -> Kind {
        let end = self.new_label("or_end");
        for (i, a) in args.iter().enumerate() {
            self.emit_to_return_register(a, false);
            if i + 1 < args.len() {
                self.push_line(&format!("    cmpq ${}, {}", value_tags::BOOL_FALSE, regs::RETURN_REG));
                self.push_line(&format!("    jne {end}"));
            }
        }
        self.push_line(&format!("{end}:"));
        Kind::Unknown
    }

    /// `set-car!`/`set-cdr!`: write `value` into a cons field, return nil.
    fn emit_set_field(&mut self, cons_expr: &Expr, value_expr: &Expr, offset: i64) -> Kind {
        self.emit_to_return_register(cons_expr, false);
        let cons_slot = self.env.get_free_slot();
        let cons_operand = self.operand(cons_slot);
        self.push_line(&format!("    movq {}, {cons_operand}", regs::RETURN_REG));
        self.emit_to_return_register(value_expr, false);
        self.push_line(&format!("    movq {cons_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    movq {}, {offset}({})",
            regs::RETURN_REG,
            regs::SCRATCH_REG
        ));
        self.env.free_slot(cons_slot);
        self.push_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
        Kind::Nil
    }

    /// `make-vector`: the size argument's tagged representation already
    /// equals `n << FIXNUM_SHIFT`, so it doubles as both the vector's
    /// length header and (after one more left shift) the byte count to
    /// fill and to bump the allocation pointer by — no untagging needed.
    fn emit_make_vector(&mut self, args: &[Expr]) -> Kind {
        self.emit_to_return_register(&args[0], false);
        let size_slot = self.env.get_free_slot();
        let size_operand = self.operand(size_slot);
        self.push_line(&format!("    movq {}, {size_operand}", regs::RETURN_REG));

        let fill_slot = if args.len() > 1 {
            self.emit_to_return_register(&args[1], false);
            let slot = self.env.get_free_slot();
            let operand = self.operand(slot);
            self.push_line(&format!("    movq {}, {operand}", regs::RETURN_REG));
            Some(slot)
        } else {
            None
        };

        self.emit_gc_checkpoint();

        let heap = regs::heap_ptr_reg();
        self.push_line(&format!(
            "    movq {size_operand}, {}({heap})",
            offsets::VECTOR_LEN
        ));
        self.push_line(&format!("    movq {size_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    shlq $1, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    leaq {}({heap}), {}",
            offsets::VECTOR_DATA,
            regs::SCRATCH_REG2
        ));
        let fill_src = match fill_slot {
            Some(slot) => self.operand(slot),
            None => format!("${}", value_tags::tag_fixnum(0)),
        };
        let loop_start = self.new_label("vecfill");
        let loop_end = self.new_label("vecfill_end");
        self.push_line(&format!("{loop_start}:"));
        self.push_line(&format!("    cmpq $0, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    je {loop_end}"));
        self.push_line(&format!("    movq {fill_src}, ({})", regs::SCRATCH_REG2));
        self.push_line(&format!("    addq $8, {}", regs::SCRATCH_REG2));
        self.push_line(&format!("    subq $8, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    jmp {loop_start}"));
        self.push_line(&format!("{loop_end}:"));

        self.push_line(&format!("    movq {heap}, {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::VECTOR_TAG,
            regs::RETURN_REG
        ));
        self.push_line(&format!("    movq {size_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    shlq $1, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    addq ${}, {}",
            offsets::VECTOR_DATA,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!("    addq {}, {heap}", regs::SCRATCH_REG));

        self.env.free_slot(size_slot);
        if let Some(slot) = fill_slot {
            self.env.free_slot(slot);
        }
        Kind::Vector
    }

    /// `(vector e...)`: element count is compile-time known, so each slot
    /// is written directly rather than looped.
    fn emit_vector_literal(&mut self, args: &[Expr]) -> Kind {
        let mut slots = Vec::with_capacity(args.len());
        for a in args {
            self.emit_to_return_register(a, false);
            let slot = self.env.get_free_slot();
            let operand = self.operand(slot);
            self.push_line(&format!("    movq {}, {operand}", regs::RETURN_REG));
            slots.push(slot);
        }

        self.emit_gc_checkpoint();

        let heap = regs::heap_ptr_reg();
        self.push_line(&format!(
            "    movq ${}, {}({heap})",
            value_tags::tag_fixnum(args.len() as i64),
            offsets::VECTOR_LEN
        ));
        for (i, slot) in slots.iter().enumerate() {
            let operand = self.operand(*slot);
            let off = offsets::VECTOR_DATA + (i as i64) * 8;
            self.push_line(&format!("    movq {operand}, {off}({heap})"));
        }
        self.push_line(&format!("    movq {heap}, {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::VECTOR_TAG,
            regs::RETURN_REG
        ));
        let total = offsets::VECTOR_DATA + (args.len() as i64) * 8;
        self.push_line(&format!("    addq ${total}, {heap}"));
        for slot in slots {
            self.env.free_slot(slot);
        }
        Kind::Vector
    }

    /// `vector-ref`: byte offset is `index_tagged * 2` (since
    /// `index_tagged == index << 2` and elements are 8 bytes wide).
    fn emit_vector_ref(&mut self, vec_expr: &Expr, idx_expr: &Expr) -> Kind {
        self.emit_to_return_register(vec_expr, false);
        let v_slot = self.env.get_free_slot();
        let v_operand = self.operand(v_slot);
        self.push_line(&format!("    movq {}, {v_operand}", regs::RETURN_REG));
        self.emit_to_return_register(idx_expr, false);
        self.push_line(&format!("    shlq $1, {}", regs::RETURN_REG));
        self.push_line(&format!("    movq {v_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    addq {}, {}",
            regs::RETURN_REG,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    movq {}({}), {}",
            offsets::VECTOR_DATA,
            regs::SCRATCH_REG,
            regs::RETURN_REG
        ));
        self.env.free_slot(v_slot);
        Kind::Unknown
    }

    fn emit_vector_set(&mut self, vec_expr: &Expr, idx_expr: &Expr, value_expr: &Expr) -> Kind {
        self.emit_to_return_register(vec_expr, false);
        let v_slot = self.env.get_free_slot();
        let v_operand = self.operand(v_slot);
        self.push_line(&format!("    movq {}, {v_operand}", regs::RETURN_REG));
        self.emit_to_return_register(idx_expr, false);
        let idx_slot = self.env.get_free_slot();
        let idx_operand = self.operand(idx_slot);
        self.push_line(&format!("    movq {}, {idx_operand}", regs::RETURN_REG));
        self.emit_to_return_register(value_expr, false);
        self.push_line(&format!("    movq {idx_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    shlq $1, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    movq {v_operand}, {}", regs::SCRATCH_REG2));
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::SCRATCH_REG2
        ));
        self.push_line(&format!(
            "    addq {}, {}",
            regs::SCRATCH_REG,
            regs::SCRATCH_REG2
        ));
        self.push_line(&format!(
            "    movq {}, {}({})",
            regs::RETURN_REG,
            offsets::VECTOR_DATA,
            regs::SCRATCH_REG2
        ));
        self.env.free_slot(v_slot);
        self.env.free_slot(idx_slot);
        self.push_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
        Kind::Nil
    }

    /// `vector-length`: the header field already holds `n << FIXNUM_SHIFT`.
    fn emit_length_header(&mut self, expr: &Expr) -> Kind {
        self.emit_to_return_register(expr, false);
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::RETURN_REG
        ));
        self.push_line(&format!(
            "    movq {}({}), {}",
            offsets::VECTOR_LEN,
            regs::RETURN_REG,
            regs::RETURN_REG
        ));
        Kind::Fixnum
    }

    /// `make-string`: ASCII only (one byte per requested character); the
    /// length header holds the byte count exactly like a vector's.
    fn emit_make_string(&mut self, args: &[Expr]) -> Kind {
        self.emit_to_return_register(&args[0], false);
        let size_slot = self.env.get_free_slot();
        let size_operand = self.operand(size_slot);
        self.push_line(&format!("    movq {}, {size_operand}", regs::RETURN_REG));

        let fill_byte = if args.len() > 1 {
            self.emit_to_return_register(&args[1], false);
            self.push_line(&format!(
                "    sarq ${}, {}",
                value_tags::CHAR_PAYLOAD_SHIFT,
                regs::RETURN_REG
            ));
            let slot = self.env.get_free_slot();
            let operand = self.operand(slot);
            self.push_line(&format!("    movq {}, {operand}", regs::RETURN_REG));
            Some(slot)
        } else {
            None
        };

        self.emit_gc_checkpoint();

        let heap = regs::heap_ptr_reg();
        self.push_line(&format!(
            "    movq {size_operand}, {}({heap})",
            offsets::STRING_LEN_FLAG
        ));
        self.push_line(&format!("    movq {size_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    sarq ${}, {}",
            value_tags::FIXNUM_SHIFT,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    leaq {}({heap}), {}",
            offsets::STRING_DATA,
            regs::SCRATCH_REG2
        ));
        // Loaded once into %al so the per-byte store is always a register
        // operand, regardless of whether the fill value itself spilled to
        // the stack.
        match fill_byte {
            Some(slot) => {
                let op = self.operand(slot);
                self.push_line(&format!("    movq {op}, %rax"));
            }
            None => self.push_line("    movq $0x20, %rax"), // ASCII space
        }
        let loop_start = self.new_label("strfill");
        let loop_end = self.new_label("strfill_end");
        self.push_line(&format!("{loop_start}:"));
        self.push_line(&format!("    cmpq $0, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    je {loop_end}"));
        self.push_line(&format!("    movb %al, ({})", regs::SCRATCH_REG2));
        self.push_line(&format!("    addq $1, {}", regs::SCRATCH_REG2));
        self.push_line(&format!("    subq $1, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    jmp {loop_start}"));
        self.push_line(&format!("{loop_end}:"));

        self.push_line(&format!("    movq {heap}, {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::STRING_TAG,
            regs::RETURN_REG
        ));
        self.push_line(&format!("    movq {size_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    sarq ${}, {}",
            value_tags::FIXNUM_SHIFT,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    addq ${}, {}",
            offsets::STRING_DATA,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!("    addq {}, {heap}", regs::SCRATCH_REG));

        self.env.free_slot(size_slot);
        if let Some(slot) = fill_byte {
            self.env.free_slot(slot);
        }
        Kind::Str
    }

    /// `(string c...)`: one ASCII byte per argument, matching
    /// `make-string`'s simplification.
    fn emit_string_ctor(&mut self, args: &[Expr]) -> Kind {
        let mut slots = Vec::with_capacity(args.len());
        for a in args {
            self.emit_to_return_register(a, false);
            self.push_line(&format!(
                "    sarq ${}, {}",
                value_tags::CHAR_PAYLOAD_SHIFT,
                regs::RETURN_REG
            ));
            let slot = self.env.get_free_slot();
            let operand = self.operand(slot);
            self.push_line(&format!("    movq {}, {operand}", regs::RETURN_REG));
            slots.push(slot);
        }

        self.emit_gc_checkpoint();

        let heap = regs::heap_ptr_reg();
        self.push_line(&format!(
            "    movq ${}, {}({heap})",
            value_tags::tag_fixnum(args.len() as i64),
            offsets::STRING_LEN_FLAG
        ));
        for (i, slot) in slots.iter().enumerate() {
            let operand = self.operand(*slot);
            let off = offsets::STRING_DATA + i as i64;
            // Route through %al so the byte store never takes a 64-bit
            // register or a stack-spilled operand directly.
            self.push_line(&format!("    movq {operand}, %rax"));
            self.push_line(&format!("    movb %al, {off}({heap})"));
        }
        self.push_line(&format!("    movq {heap}, {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::STRING_TAG,
            regs::RETURN_REG
        ));
        let total = offsets::STRING_DATA + args.len() as i64;
        self.push_line(&format!("    addq ${total}, {heap}"));
        for slot in slots {
            self.env.free_slot(slot);
        }
        Kind::Str
    }

    /// Scans a string's bytes from its first data byte, counting lead
    /// bytes (any byte whose top two bits are not `10`), and leaves the
    /// untagged cursor pointing at the byte count-th lead byte (or just
    /// past the last byte if `target` is never reached) in `SCRATCH_REG2`,
    /// with the running count in `SCRATCH_REG`.
    fn emit_codepoint_scan(&mut self, s_operand: &str, target_operand: &str) -> (usize, usize) {
        let count_slot = self.env.get_free_slot();
        let count_operand = self.operand(count_slot);
        let cursor_slot = self.env.get_free_slot();
        let cursor_operand = self.operand(cursor_slot);

        self.push_line(&format!("    movq ${}, {count_operand}", 0));
        self.push_line(&format!("    movq {s_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    addq ${}, {}",
            offsets::STRING_DATA,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!("    movq {}, {cursor_operand}", regs::SCRATCH_REG));

        let outer = self.new_label("strscan");
        let advance = self.new_label("strscan_adv");
        let skip_cont = self.new_label("strscan_cont");
        let done = self.new_label("strscan_done");
        self.push_line(&format!("{outer}:"));
        self.push_line(&format!("    movq {count_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    cmpq {target_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    jge {done}"));
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG));
        self.push_line("    addq $1, %r10");
        self.push_line(&format!("    movq {}, {cursor_operand}", regs::SCRATCH_REG));
        self.push_line(&format!("{advance}:"));
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG2));
        self.push_line("    movzbl (%r11), %eax");
        self.push_line("    andb $0xC0, %al");
        self.push_line("    cmpb $0x80, %al");
        self.push_line(&format!("    jne {skip_cont}"));
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG));
        self.push_line("    addq $1, %r10");
        self.push_line(&format!("    movq {}, {cursor_operand}", regs::SCRATCH_REG));
        self.push_line(&format!("    jmp {advance}"));
        self.push_line(&format!("{skip_cont}:"));
        self.push_line(&format!("    movq {count_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    addq $1, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    movq {}, {count_operand}", regs::SCRATCH_REG));
        self.push_line(&format!("    jmp {outer}"));
        self.push_line(&format!("{done}:"));
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG2));

        (count_slot, cursor_slot)
    }

    /// `string-length` on a UTF-8 string counts code points (lead bytes);
    /// on an ASCII string this is the same as the byte count. Unlike
    /// `string-ref`/`string-set!`, there is no target code-point index to
    /// scan toward here -- the stopping condition is the cursor reaching
    /// the end of the string's byte buffer, not the running count
    /// reaching some caller-supplied bound, so this uses
    /// `emit_codepoint_count_to_end` rather than `emit_codepoint_scan`.
    fn emit_string_length(&mut self, expr: &Expr) -> Kind {
        self.emit_to_return_register(expr, false);
        let s_slot = self.env.get_free_slot();
        let s_operand = self.operand(s_slot);
        self.push_line(&format!("    movq {}, {s_operand}", regs::RETURN_REG));
        self.push_line(&format!("    movq {s_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::SCRATCH_REG
        ));
        let byte_len_slot = self.env.get_free_slot();
        let byte_len_operand = self.operand(byte_len_slot);
        self.push_line(&format!(
            "    movq {}({}), {}",
            offsets::STRING_LEN_FLAG,
            regs::SCRATCH_REG,
            regs::RETURN_REG
        ));
        self.push_line(&format!(
            "    sarq ${}, {}",
            value_tags::FIXNUM_SHIFT,
            regs::RETURN_REG
        ));
        self.push_line(&format!("    movq {}, {byte_len_operand}", regs::RETURN_REG));

        let count_slot = self.emit_codepoint_count_to_end(&s_operand, &byte_len_operand);
        let count_operand = self.operand(count_slot);
        self.push_line(&format!("    movq {count_operand}, {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    shlq ${}, {}",
            value_tags::FIXNUM_SHIFT,
            regs::RETURN_REG
        ));
        self.env.free_slot(s_slot);
        self.env.free_slot(byte_len_slot);
        self.env.free_slot(count_slot);
        Kind::Fixnum
    }

    /// Counts code points (lead bytes: any byte whose top two bits are not
    /// `10`) in a string's byte buffer, stopping when the cursor reaches
    /// `s_operand`'s data start plus `byte_len_operand` rather than when
    /// some running count reaches a caller-supplied target -- the total
    /// code-point count is exactly what's unknown going in, so nothing
    /// else is available to scan toward. Unlike `emit_codepoint_scan`
    /// (which only ever needs to read up to, never past, the code point
    /// it's looking for), this one must count the buffer's *last* code
    /// point too, so the buffer-end check is re-checked immediately before
    /// every byte read in the inner continuation-byte loop, not only once
    /// per outer iteration -- otherwise the read that decides whether a
    /// final multi-byte sequence has ended runs one byte past the heap
    /// object's data.
    fn emit_codepoint_count_to_end(&mut self, s_operand: &str, byte_len_operand: &str) -> usize {
        let count_slot = self.env.get_free_slot();
        let count_operand = self.operand(count_slot);
        let cursor_slot = self.env.get_free_slot();
        let cursor_operand = self.operand(cursor_slot);
        let end_slot = self.env.get_free_slot();
        let end_operand = self.operand(end_slot);

        self.push_line(&format!("    movq ${}, {count_operand}", 0));
        self.push_line(&format!("    movq {s_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!(
            "    andq ${}, {}",
            !value_tags::PTR_TAG_MASK & 0xFF,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!(
            "    addq ${}, {}",
            offsets::STRING_DATA,
            regs::SCRATCH_REG
        ));
        self.push_line(&format!("    movq {}, {cursor_operand}", regs::SCRATCH_REG));
        self.push_line(&format!("    addq {byte_len_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    movq {}, {end_operand}", regs::SCRATCH_REG));

        let outer = self.new_label("strcnt");
        let advance = self.new_label("strcnt_adv");
        let skip_cont = self.new_label("strcnt_cont");
        let done = self.new_label("strcnt_done");
        self.push_line(&format!("{outer}:"));
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    cmpq {end_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    jge {done}"));
        self.push_line(&format!("    addq $1, {cursor_operand}"));
        self.push_line(&format!("{advance}:"));
        // `advance` may re-enter itself after consuming a continuation
        // byte, so the buffer-end check has to be repeated here every time
        // before the read below, not just once at `outer`'s top -- a
        // multi-byte code point that ends exactly at the string's last
        // byte would otherwise fall through to `movzbl` one byte past the
        // end of the heap object on its final iteration.
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    cmpq {end_operand}, {}", regs::SCRATCH_REG));
        self.push_line(&format!("    jge {skip_cont}"));
        self.push_line(&format!("    movq {cursor_operand}, {}", regs::SCRATCH_REG2));
        self.push_line("    movzbl (%r11), %eax");
        self.push_line("    andb $0xC0, %al");
        self.push_line("    cmpb $0x80, %al");
        self.push_line(&format!("    jne {skip_cont}"));
        self.push_line(&format!("    addq $1, {cursor_operand}"));
        self.push_line(&format!("    jmp {advance}"));
        self.push_line(&format!("{skip_cont}:"));
        self.push_line(&format!("    addq $1, {count_operand}"));
        self.push_line(&format!("    jmp {outer}"));
        self.push_line(&format!("{done}:"));

        self.env.free_slot(cursor_slot);
        self.env.free_slot(end_slot);
        count_slot
    }

    /// `string-ref`: scan to the k-th code point's lead byte, then decode
    /// a variable-width UTF-8 sequence (1 to 4 bytes) starting there.
    fn emit_string_ref(&mut self, s_expr: &Expr, k_expr: &Expr) -> Kind {
        self.emit_to_return_register(s_expr, false);
        let s_slot = self.env.get_free_slot();
        let s_operand = self.operand(s_slot);
        self.push_line(&format!("    movq {}, {s_operand}", regs::RETURN_REG));
        self.emit_to_return_register(k_expr, false);
        self.push_line(&format!(
            "    sarq ${}, {}",
            value_tags::FIXNUM_SHIFT,
            regs::RETURN_REG
        ));
        let target_slot = self.env.get_free_slot();
        let target_operand = self.operand(target_slot);
        self.push_line(&format!("    movq {}, {target_operand}", regs::RETURN_REG));

        let (count_slot, cursor_slot) = self.emit_codepoint_scan(&s_operand, &target_operand);
        let cursor_operand = self.operand(cursor_slot);
        let cont_slot = self.env.get_free_slot();
        let cont_operand = self.operand(cont_slot);

        // %r11 = cursor to the lead byte; decode into %rax. %r10 is reused
        // as a one-off byte temp outside the loop and as the per-iteration
        // continuation-byte temp inside it; the remaining-continuations
        // counter lives in `cont_operand` so it survives those reuses.
        self.push_line(&format!("    movq {cursor_operand}, %r11"));
        self.push_line("    movzbl (%r11), %eax");
        let ascii = self.new_label("strref_ascii");
        let two = self.new_label("strref_two");
        let three = self.new_label("strref_three");
        let decode_cont = self.new_label("strref_cont");
        let done = self.new_label("strref_done");
        self.push_line("    cmpb $0x80, %al");
        self.push_line(&format!("    jb {ascii}"));
        self.push_line("    movq %rax, %r10");
        self.push_line("    andb $0xE0, %r10b");
        self.push_line("    cmpb $0xC0, %r10b");
        self.push_line(&format!("    je {two}"));
        self.push_line("    movq %rax, %r10");
        self.push_line("    andb $0xF0, %r10b");
        self.push_line("    cmpb $0xE0, %r10b");
        self.push_line(&format!("    je {three}"));
        // 4-byte sequence.
        self.push_line("    andb $0x07, %al");
        self.push_line("    movzbl %al, %eax");
        self.push_line(&format!("    movq $3, {cont_operand}"));
        self.push_line(&format!("    jmp {decode_cont}"));
        self.push_line(&format!("{three}:"));
        self.push_line("    andb $0x0F, %al");
        self.push_line("    movzbl %al, %eax");
        self.push_line(&format!("    movq $2, {cont_operand}"));
        self.push_line(&format!("    jmp {decode_cont}"));
        self.push_line(&format!("{two}:"));
        self.push_line("    andb $0x1F, %al");
        self.push_line("    movzbl %al, %eax");
        self.push_line(&format!("    movq $1, {cont_operand}"));
        let cont_loop = self.new_label("strref_contloop");
        self.push_line(&format!("{decode_cont}:"));
        self.push_line(&format!("{cont_loop}:"));
        self.push_line(&format!("    movq {cont_operand}, %r10"));
        self.push_line("    cmpq $0, %r10");
        self.push_line(&format!("    je {done}"));
        self.push_line("    addq $1, %r11");
        self.push_line("    movzbl (%r11), %r10d");
        self.push_line("    andb $0x3F, %r10b");
        self.push_line("    movzbl %r10b, %r10d");
        self.push_line("    shlq $6, %rax");
        self.push_line("    orq %r10, %rax");
        self.push_line(&format!("    movq {cont_operand}, %r10"));
        self.push_line("    subq $1, %r10");
        self.push_line(&format!("    movq %r10, {cont_operand}"));
        self.push_line(&format!("    jmp {cont_loop}"));
        self.push_line(&format!("{ascii}:"));
        self.push_line(&format!("{done}:"));
        self.push_line(&format!(
            "    shlq ${}, %rax",
            value_tags::CHAR_PAYLOAD_SHIFT
        ));
        self.push_line(&format!(
            "    orq ${}, %rax",
            value_tags::CHAR_TAG
        ));
        self.push_line(&format!("    movq %rax, {}", regs::RETURN_REG));

        self.env.free_slot(s_slot);
        self.env.free_slot(target_slot);
        self.env.free_slot(count_slot);
        self.env.free_slot(cursor_slot);
        self.env.free_slot(cont_slot);
        Kind::Char
    }

    /// `string-set!`: ASCII replacement only — a literal Unicode character
    /// argument is rejected at compile time, since overwriting a single
    /// code-point slot with a wider encoding would require resizing the
    /// string.
    fn emit_string_set(&mut self, s_expr: &Expr, k_expr: &Expr, value_expr: &Expr, pos: Pos) -> Kind {
        if let Expr::UnicodeChar(..) = value_expr {
            self.err(pos, DiagKind::ExpectedNonUnicodeChar);
            return Kind::Nil;
        }
        self.emit_to_return_register(s_expr, false);
        let s_slot = self.env.get_free_slot();
        let s_operand = self.operand(s_slot);
        self.push_line(&format!("    movq {}, {s_operand}", regs::RETURN_REG));
        self.emit_to_return_register(k_expr, false);
        self.push_line(&format!(
            "    sarq ${}, {}",
            value_tags::FIXNUM_SHIFT,
            regs::RETURN_REG
        ));
        let target_slot = self.env.get_free_slot();
        let target_operand = self.operand(target_slot);
        self.push_line(&format!("    movq {}, {target_operand}", regs::RETURN_REG));

        let (count_slot, cursor_slot) = self.emit_codepoint_scan(&s_operand, &target_operand);
        let cursor_operand = self.operand(cursor_slot);

        self.emit_to_return_register(value_expr, false);
        self.push_line(&format!(
            "    sarq ${}, {}",
            value_tags::CHAR_PAYLOAD_SHIFT,
            regs::RETURN_REG
        ));
        self.push_line(&format!("    movq {cursor_operand}, %r11"));
        self.push_line("    movb %al, (%r11)");

        self.env.free_slot(s_slot);
        self.env.free_slot(target_slot);
        self.env.free_slot(count_slot);
        self.env.free_slot(cursor_slot);
        self.push_line(&format!("    movq ${}, {}", value_tags::NIL, regs::RETURN_REG));
        Kind::Nil
    }

    /// `exit`: flush nothing (the runtime owns stdout buffering per
    /// `print` call), free the GC heap, and terminate via libc.
    fn emit_exit(&mut self) -> Kind {
        self.push_line("    call cleanup@PLT");
        self.push_line("    movl $0, %edi");
        self.push_line("    call exit@PLT");
        Kind::Unknown
    }

    fn emit_arithmetic(&mut self, op: &str, args: &[Expr]) -> Kind {
        self.emit_to_return_register(&args[0], false);
        let lhs_slot = self.env.get_free_slot();
        let lhs_operand = self.operand(lhs_slot);
        self.push_line(&format!("    movq {}, {lhs_operand}", regs::RETURN_REG));
        for rhs in &args[1..] {
            self.emit_to_return_register(rhs, false);
            let lhs_operand = self.operand(lhs_slot);
            match op {
                "+" => self.push_line(&format!("    addq {}, {lhs_operand}", regs::RETURN_REG)),
                "-" => {
                    self.push_line(&format!("    movq {lhs_operand}, {}", regs::SCRATCH_REG));
                    self.push_line(&format!("    subq {}, {}", regs::RETURN_REG, regs::SCRATCH_REG));
                    self.push_line(&format!("    movq {}, {lhs_operand}", regs::SCRATCH_REG));
                }
                "*" => {
                    self.push_line(&format!("    sarq $2, {}", regs::RETURN_REG));
                    self.push_line(&format!("    imulq {}, {lhs_operand}", regs::RETURN_REG));
                }
                "/" => {
                    // %rdx is slot 2 (the 3rd SysV arg register); cqto/idivq
                    // clobber it regardless of whether this expression owns
                    // it, so a live occupant other than our own lhs_slot has
                    // to be saved across the divide and restored after.
                    let rdx_live = lhs_slot != 2 && self.env.slot(2).occupied;
                    if rdx_live {
                        self.push_line("    pushq %rdx");
                    }
                    // Stash the freshly evaluated rhs (still in the return
                    // register) before it's clobbered by loading the
                    // accumulator as the dividend.
                    self.push_line(&format!("    movq {}, {}", regs::RETURN_REG, regs::SCRATCH_REG));
                    self.push_line(&format!("    movq {lhs_operand}, %rax"));
                    self.push_line("    cqto");
                    self.push_line(&format!("    sarq $2, {}", regs::SCRATCH_REG));
                    self.push_line(&format!("    idivq {}", regs::SCRATCH_REG));
                    self.push_line(&format!("    movq %rax, {lhs_operand}"));
                    if rdx_live {
                        self.push_line("    popq %rdx");
                    }
                }
                "modulo" => {
                    let rdx_live = lhs_slot != 2 && self.env.slot(2).occupied;
                    if rdx_live {
                        self.push_line("    pushq %rdx");
                    }
                    self.push_line(&format!("    movq {}, {}", regs::RETURN_REG, regs::SCRATCH_REG));
                    self.push_line(&format!("    movq {lhs_operand}, %rax"));
                    self.push_line("    cqto");
                    self.push_line(&format!("    idivq {}", regs::SCRATCH_REG));
                    self.push_line(&format!("    movq %rdx, {lhs_operand}"));
                    if rdx_live {
                        self.push_line("    popq %rdx");
                    }
                }
                _ => unreachable!(),
            }
        }
        let lhs_operand = self.operand(lhs_slot);
        self.push_line(&format!("    movq {lhs_operand}, {}", regs::RETURN_REG));
        self.env.free_slot(lhs_slot);
        Kind::Fixnum
    }

    fn emit_increment(&mut self, op: &str, arg: &Expr) -> Kind {
        self.emit_to_return_register(arg, false);
        let delta = value_tags::tag_fixnum(1);
        let instr = if op == "1+" { "addq" } else { "subq" };
        self.push_line(&format!("    {instr} ${delta}, {}", regs::RETURN_REG));
        Kind::Fixnum
    }

    fn emit_comparison(&mut self, op: &str, args: &[Expr]) -> Kind {
        self.emit_to_return_register(&args[0], false);
        let lhs_slot = self.env.get_free_slot();
        let lhs_operand = self.operand(lhs_slot);
        self.push_line(&format!("    movq {}, {lhs_operand}", regs::RETURN_REG));
        self.emit_to_return_register(&args[1], false);
        self.push_line(&format!("    cmpq {}, {lhs_operand}", regs::RETURN_REG));
        let set_true = self.new_label("cmp_true");
        let end = self.new_label("cmp_end");
        let jump = match op {
            "=" => "je",
            "<" => "jl",
            "<=" => "jle",
            ">" => "jg",
            ">=" => "jge",
            _ => unreachable!(),
        };
        self.push_line(&format!("    {jump} {set_true}"));
        self.push_line(&format!("    movq ${}, {}", value_tags::BOOL_FALSE, regs::RETURN_REG));
        self.push_line(&format!("    jmp {end}"));
        self.push_line(&format!("{set_true}:"));
        self.push_line(&format!("    movq ${}, {}", value_tags::BOOL_TRUE, regs::RETURN_REG));
        self.push_line(&format!("{end}:"));
        self.env.free_slot(lhs_slot);
        Kind::Boolean
    }

    fn emit_predicate_against_immediate(&mut self, arg: &Expr, immediate: i64) -> Kind {
        self.emit_to_return_register(arg, false);
        self.push_line(&format!("    cmpq ${immediate}, {}", regs::RETURN_REG));
        let set_true = self.new_label("pred_true");
        let end = self.new_label("pred_end");
        self.push_line(&format!("    je {set_true}"));
        self.push_line(&format!("    movq ${}, {}", value_tags::BOOL_FALSE, regs::RETURN_REG));
        self.push_line(&format!("    jmp {end}"));
        self.push_line(&format!("{set_true}:"));
        self.push_line(&format!("    movq ${}, {}", value_tags::BOOL_TRUE, regs::RETURN_REG));
        self.push_line(&format!("{end}:"));
        Kind::Boolean
    }

    fn emit_cons(&mut self, car: &Expr, cdr: &Expr) -> Kind {
        self.emit_to_return_register(car, false);
        let car_slot = self.env.get_free_slot();
        let car_operand = self.operand(car_slot);
        self.push_line(&format!("    movq {}, {car_operand}", regs::RETURN_REG));
        self.emit_to_return_register(cdr, false);
        let cdr_slot = self.env.get_free_slot();
        let cdr_operand = self.operand(cdr_slot);
        self.push_line(&format!("    movq {}, {cdr_operand}", regs::RETURN_REG));

        self.emit_gc_checkpoint();

        let heap_ptr = regs::heap_ptr_reg();
        self.push_line(&format!(
            "    movq {car_operand}, {}({heap_ptr})",
            offsets::CONS_CAR
        ));
        self.push_line(&format!(
            "    movq {cdr_operand}, {}({heap_ptr})",
            offsets::CONS_CDR
        ));
        self.push_line(&format!("    movq {heap_ptr}, {}", regs::RETURN_REG));
        self.push_line(&format!(
            "    orq ${}, {}",
            value_tags::CONS_TAG,
            regs::RETURN_REG
        ));
        self.push_line(&format!("    addq ${}, {heap_ptr}", offsets::CONS_SIZE));
        self.env.free_slot(car_slot);
        self.env.free_slot(cdr_slot);
        Kind::Cons
    }

    /// A call to a named function or a variable holding a closure value.
    /// Evaluates each argument through the `argorder` resolver so that no
    /// argument's evaluation clobbers another argument's not-yet-read
    /// source slot, then dispatches through `codegen::closures`.
    fn emit_call(&mut self, name: &str, args: &[Expr], pos: Pos, tail: bool) -> Kind {
        if let Some(ctx_idx) = self
            .tail_ctx
            .iter()
            .position(|c| c.name == name && c.param_slots.len() == args.len())
        {
            if tail {
                return self.emit_self_tail_call(ctx_idx, args, pos);
            }
        }

        let k = args.len();

        // Resolve the callee and, for a closure value, pin it into the
        // reserved closure-env register *before* any argument is written
        // into its destination register. A closure bound to a
        // low-numbered slot (e.g. the same register `args[0]` will be
        // placed into) would otherwise be read too late, after its own
        // value had already been overwritten by the argument-placement
        // step below.
        let call_through_closure = if let Some(f) = self.functions.iter().find(|f| f.name == name) {
            if f.arity != k {
                self.err(
                    pos,
                    DiagKind::ArityMismatch {
                        expected: f.arity.to_string(),
                        got: k,
                    },
                );
                return Kind::Unknown;
            }
            false
        } else {
            let Some(var) = self.env.find_active_variable(name) else {
                self.err(pos, DiagKind::UndefinedSymbol(name.to_string()));
                return Kind::Unknown;
            };
            match var.location {
                Location::Slot(slot) => {
                    let closure_operand = self.operand(slot);
                    self.push_line(&format!(
                        "    movq {closure_operand}, {}",
                        regs::closure_env_reg()
                    ));
                    true
                }
                Location::ConstPool(_) => {
                    self.err(pos, DiagKind::UndefinedSymbol(name.to_string()));
                    return Kind::Unknown;
                }
            }
        };

        let depends: Vec<HashSet<usize>> = vec![HashSet::new(); k];
        let plan = resolve_argument_order(k, &depends);

        let mut evaluated = Vec::with_capacity(k);
        for &i in &plan.order {
            self.emit_to_return_register(&args[i], false);
            let slot = self.env.get_free_slot();
            let operand = self.operand(slot);
            self.push_line(&format!("    movq {}, {operand}", regs::RETURN_REG));
            evaluated.push((i, slot));
        }
        evaluated.sort_by_key(|(i, _)| *i);
        for (arg_index, slot) in &evaluated {
            let dest = regs::operand(*arg_index, self.max_frame_slots);
            let src = self.operand(*slot);
            if src != dest {
                self.push_line(&format!("    movq {src}, {dest}"));
            }
        }
        for (_, slot) in &evaluated {
            self.env.free_slot(*slot);
        }

        // Every value still held in a live register slot must be rooted
        // and protected across this call, whether it's a direct call to
        // our own compiled code or an indirect one through a closure:
        // neither preserves caller registers.
        let spilled = self.spill_live_across_call();

        if call_through_closure {
            let env_reg = regs::closure_env_reg();
            let arity_err = self.new_label("arity_err");
            for line in closures::emit_call_through_closure(env_reg, env_reg, k, &arity_err) {
                self.push_line(&format!("    {line}"));
            }
            let after = self.new_label("call_end");
            self.push_line(&format!("    jmp {after}"));
            self.push_line(&format!("{arity_err}:"));
            self.push_line("    call seq_arity_error@PLT");
            self.push_line(&format!("{after}:"));
        } else {
            let label = self
                .functions
                .iter()
                .find(|f| f.name == name)
                .expect("resolved above")
                .label
                .clone();
            self.push_line(&format!("    call {label}"));
        }

        self.restore_live_across_call(&spilled);
        Kind::Unknown
    }

    fn emit_self_tail_call(&mut self, ctx_idx: usize, args: &[Expr], _pos: Pos) -> Kind {
        let param_slots = self.tail_ctx[ctx_idx].param_slots.clone();
        let entry_label = self.tail_ctx[ctx_idx].entry_label.clone();
        let k = args.len();

        let depends: Vec<HashSet<usize>> = vec![HashSet::new(); k];
        let plan = resolve_argument_order(k, &depends);

        let mut arg_operands = vec![String::new(); k];
        for &i in &plan.order {
            self.emit_to_return_register(&args[i], false);
            let scratch_slot = self.env.get_free_slot();
            let scratch_operand = self.operand(scratch_slot);
            self.push_line(&format!("    movq {}, {scratch_operand}", regs::RETURN_REG));
            arg_operands[i] = scratch_operand;
        }
        let dest_regs: Vec<String> = param_slots
            .iter()
            .map(|&s| regs::operand(s, self.max_frame_slots))
            .collect();

        // The enclosing function's peak spill-slot usage -- and so the
        // frame size this rewrite must undo before jumping back to the
        // entry label, which re-establishes it -- isn't known until the
        // whole body has been emitted. `__FRAME_BYTES__` is patched to the
        // final value once it is, in `emit_function_definition` (the only
        // place a `TailContext` is pushed, so the only kind of call this
        // rewrite ever fires for).
        let mut lines =
            tailcalls::emit_tail_call_rewrite(&plan, &arg_operands, &dest_regs, 0, &entry_label);
        let jmp_line = lines.pop().expect("tail call rewrite always emits a jmp");
        lines.push("addq $__FRAME_BYTES__, %rsp".to_string());
        lines.push(jmp_line);
        for line in lines {
            self.push_line(&format!("    {line}"));
        }
        Kind::Unknown
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

/// The static tagged value of a self-contained immediate `Expr` (fixnum,
/// boolean, char, or nil), used when laying out `.data`/`quotes`-section
/// structures at compile time. Returns `None` for strings, symbols,
/// lists, and vectors, which have no single-word tagged form --
/// `quoted_literal_operand` handles those by recursing into their own
/// static record instead of calling this.
fn literal_tagged_value(e: &Expr) -> Option<i64> {
    match e {
        Expr::Fixnum(n, _) => Some(value_tags::tag_fixnum(*n)),
        Expr::Boolean(b, _) => Some(value_tags::tag_bool(*b)),
        Expr::AsciiChar(c, _) => Some(value_tags::tag_char(*c as i64)),
        Expr::UnicodeChar(c, _) => Some(value_tags::tag_char(*c as i64)),
        Expr::Null(_) => Some(value_tags::NIL),
        _ => None,
    }
}

/// Walks a lambda body collecting references to names that are neither
/// its own parameters nor already-known locals, so that they are captured
/// by the enclosing closure's free-variable list even when never the
/// target of a `set!` (pure reads still need a capture slot).
fn collect_free_variable_references(body: &[Expr], locals: &HashSet<String>, free_vars: &mut FreeVarList) {
    for e in body {
        walk_for_references(e, locals, free_vars);
    }
}

fn walk_for_references(e: &Expr, locals: &HashSet<String>, free_vars: &mut FreeVarList) {
    match e {
        Expr::Symbol(name, _) => {
            if !locals.contains(name) && !is_known_form_keyword(name) {
                free_vars.capture(name);
            }
        }
        Expr::List(items, _) => {
            if items.first().and_then(|h| h.as_symbol()) == Some("lambda") {
                let nested_params: HashSet<String> = items
                    .get(1)
                    .and_then(|p| p.as_list())
                    .map(|params| {
                        params
                            .iter()
                            .filter_map(|p| p.as_symbol().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut combined = locals.clone();
                combined.extend(nested_params);
                for stmt in items.iter().skip(2) {
                    walk_for_references(stmt, &combined, free_vars);
                }
                return;
            }
            if items.first().and_then(|h| h.as_symbol()) == Some("quote") {
                return;
            }
            for item in items {
                walk_for_references(item, locals, free_vars);
            }
        }
        Expr::Vector(items, _) => {
            for item in items {
                walk_for_references(item, locals, free_vars);
            }
        }
        _ => {}
    }
}

fn is_known_form_keyword(name: &str) -> bool {
    matches!(
        name,
        "if" | "begin" | "let" | "let*" | "lambda" | "define" | "set!" | "quote"
    ) || primitives::is_primitive(name)
}

fn escape_asm_string(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> Result<String, Diagnostics> {
        let program = Parser::new(src).parse().expect("parse should succeed");
        CodeGen::generate(&program, &CompilerConfig::default())
    }

    #[test]
    fn compiles_fixnum_literal() {
        let asm = compile("42").unwrap();
        assert!(asm.contains("movq $168"));
    }

    #[test]
    fn compiles_if_expression() {
        let asm = compile("(if #t 1 2)").unwrap();
        assert!(asm.contains("cmpq $31"));
    }

    #[test]
    fn compiles_arithmetic_chain() {
        let asm = compile("(+ 1 2 3)").unwrap();
        assert!(asm.contains("addq"));
    }

    #[test]
    fn division_tags_divisor_once_and_dividend_not_at_all() {
        let asm = compile("(/ 8 4)").unwrap();
        // the rhs must be captured into the scratch register before the
        // accumulator overwrites the return register as the dividend.
        assert!(asm.contains("movq %rax, %r10"));
        assert!(asm.contains("sarq $2, %r10"));
        assert!(asm.contains("idivq %r10"));
        // no re-tagging shl after idivq: the tagged dividend divided by
        // the untagged divisor already lands on a correctly tagged quotient.
        assert!(!asm.contains("shlq $2, %rax"));
    }

    #[test]
    fn modulo_does_not_shift_either_operand() {
        let asm = compile("(modulo 7 3)").unwrap();
        assert!(asm.contains("idivq %r10"));
        assert!(asm.contains("movq %rdx,"));
        assert!(!asm.contains("sarq $2, %r10"));
    }

    #[test]
    fn division_spills_rdx_around_a_live_third_argument() {
        let asm = compile("(define (f a b c) (/ a b))").unwrap();
        assert!(asm.contains("pushq %rdx"));
        assert!(asm.contains("popq %rdx"));
    }

    #[test]
    fn compiles_function_definition_and_call() {
        let asm = compile("(define (f x) (+ x 1)) (f 2)").unwrap();
        assert!(asm.contains("fn_f:"));
    }

    #[test]
    fn undefined_symbol_is_a_diagnostic() {
        let result = compile("totally-undefined-name");
        assert!(result.is_err());
    }

    #[test]
    fn tail_self_call_rewrites_in_place() {
        let asm = compile("(define (loop n) (if (zero? n) n (loop (1- n))))").unwrap();
        assert!(asm.contains("jmp fn_loop"));
    }

    #[test]
    fn lambda_literal_allocates_a_closure() {
        let asm = compile("(lambda (x) x)").unwrap();
        assert!(asm.contains("orq $6"));
    }

    #[test]
    fn quoted_list_materializes_static_cons_chain() {
        let asm = compile("'(1 2 3)").unwrap();
        assert!(asm.contains("quote_0_cell_0:"));
    }

    #[test]
    fn quoted_symbol_materializes_static_name_record() {
        let asm = compile("'done").unwrap();
        assert!(asm.contains("sym_0: .quad"));
        assert!(asm.contains(".ascii \"done\""));
        assert!(asm.contains("orq $5"));
    }

    #[test]
    fn tail_loop_with_quoted_symbol_base_case_compiles() {
        let asm = compile("(define (loop n) (if (zero? n) 'done (loop (1- n))))").unwrap();
        assert!(asm.contains("jmp fn_loop"));
        assert!(asm.contains(".ascii \"done\""));
    }

    #[test]
    fn string_length_scans_to_byte_buffer_end_not_codepoint_count() {
        let asm = compile("(string-length \"abc\")").unwrap();
        assert!(asm.contains("strcnt"));
    }

    #[test]
    fn pair_predicate_masks_low_three_bits() {
        let asm = compile("(pair? (cons 1 2))").unwrap();
        assert!(asm.contains("andq $7"));
        assert!(asm.contains("cmpq $1"));
    }

    #[test]
    fn and_short_circuits_on_false() {
        let asm = compile("(and #t #f)").unwrap();
        assert!(asm.contains("cmpq $31"));
        assert!(asm.contains("je .Land_end"));
    }

    #[test]
    fn or_short_circuits_on_truthy() {
        let asm = compile("(or #f 1)").unwrap();
        assert!(asm.contains("jne .Lor_end"));
    }

    #[test]
    fn set_car_writes_through_masked_pointer() {
        let asm = compile("(set-car! (cons 1 2) 9)").unwrap();
        assert!(asm.contains("movq %rax, 0(%r10)"));
    }

    #[test]
    fn make_vector_emits_a_fill_loop() {
        let asm = compile("(make-vector 3 0)").unwrap();
        assert!(asm.contains(".Lvecfill_"));
    }

    #[test]
    fn vector_literal_allocates_and_tags() {
        let asm = compile("(vector 1 2 3)").unwrap();
        assert!(asm.contains("orq $2"));
    }

    #[test]
    fn vector_length_reads_header_without_shifting() {
        let asm = compile("(vector-length (vector 1 2))").unwrap();
        assert!(asm.contains("movq 0(%rax), %rax"));
    }

    #[test]
    fn string_ref_scans_for_continuation_bytes() {
        let asm = compile(r#"(string-ref "hi" 0)"#).unwrap();
        assert!(asm.contains("andb $0xC0, %al"));
    }

    #[test]
    fn string_set_rejects_literal_unicode_char() {
        let result = compile(r#"(string-set! "hi" 0 #\x3c0)"#);
        assert!(result.is_err());
    }

    #[test]
    fn exit_calls_cleanup_then_libc_exit() {
        let asm = compile("(exit)").unwrap();
        assert!(asm.contains("call cleanup@PLT"));
        assert!(asm.contains("call exit@PLT"));
    }

    #[test]
    fn let_bindings_are_resolved_against_the_outer_scope_not_each_other() {
        // `y`'s initializer must read the *outer* `x` (bound to %rdi,
        // the first free slot), not the inner let's own `x` (bound to
        // %rsi) -- `let` resolves every binding in parallel against the
        // environment as it stood before the form, so a sibling binding's
        // new name is never visible to another binding's initializer.
        let asm = compile("(let ((x 1)) (let ((x 2) (y x)) y))").unwrap();
        assert!(asm.contains("movq %rdi, %rax"));
        assert!(!asm.contains("movq %rsi, %rax"));
    }

    #[test]
    fn let_star_bindings_see_earlier_siblings() {
        // `y`'s initializer sees `x` at the slot `let*` already bound it
        // to (%rdi) by the time `y`'s binding is processed.
        let asm = compile("(let* ((x 1) (y x)) y)").unwrap();
        assert!(asm.contains("movq %rdi, %rax"));
    }

    #[test]
    fn quoted_list_recurses_into_nested_list_elements() {
        let asm = compile("'((1 2) 3)").unwrap();
        assert!(asm.contains("quote_0_cell_0: .quad quote_1_cell_0 + 1"));
        assert!(asm.contains("quote_1_cell_0: .quad 4"));
    }

    #[test]
    fn quoted_list_recurses_into_nested_symbols() {
        let asm = compile("'(a b)").unwrap();
        assert!(asm.contains("quote_0_cell_0: .quad sym_1 + 5"));
        assert!(asm.contains("sym_1: .quad"));
        assert!(asm.contains(".ascii \"a\""));
    }

    #[test]
    fn codepoint_count_rechecks_buffer_end_before_each_continuation_byte_read() {
        // The fix for the out-of-bounds `string-length` scan: the
        // advance loop must re-test the cursor against the buffer end
        // immediately before every `movzbl`, not just once per outer
        // iteration, or the last code point's terminating read runs past
        // the heap object's data.
        let asm = compile(r#"(string-length "abc")"#).unwrap();
        let adv_label = asm
            .find(".Lstrcnt_adv_0:")
            .expect("strcnt_adv label should be emitted");
        let movzbl_offset = asm[adv_label..]
            .find("movzbl")
            .expect("a continuation-byte read should follow the label");
        let between = &asm[adv_label..adv_label + movzbl_offset];
        assert!(
            between.contains("jge"),
            "expected a buffer-end check between the advance label and the byte read:\n{between}"
        );
    }
}
