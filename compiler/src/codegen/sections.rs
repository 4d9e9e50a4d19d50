//! Output assembler: the seven labeled buffers of §4.4.6 and their fixed
//! concatenation order.
//!
//! The `fun` section additionally uses a stack of buffers rather than one
//! flat append queue (§9, "Buffered emission with nested lambdas"):
//! entering a lambda pushes a fresh buffer, and on exit the finished buffer
//! is promoted back onto its parent, preserving source textual order of
//! function definitions even when lambdas are defined lexically inside
//! other lambdas.

#[derive(Debug, Default)]
pub struct Sections {
    pub bss: String,
    pub data: String,
    fun_stack: Vec<String>,
    pub main_prologue: String,
    pub quotes: String,
    pub body: String,
    pub end: String,
}

impl Sections {
    pub fn new() -> Self {
        Sections {
            bss: String::new(),
            data: String::new(),
            fun_stack: vec![String::new()],
            main_prologue: String::new(),
            quotes: String::new(),
            body: String::new(),
            end: String::new(),
        }
    }

    pub fn enter_lambda(&mut self) {
        self.fun_stack.push(String::new());
    }

    /// Finish the innermost lambda's buffer and splice it into its parent,
    /// preserving textual order: the inner function's complete text is
    /// appended to the parent buffer before the parent continues.
    pub fn exit_lambda(&mut self) {
        self.exit_lambda_with_frame(0);
    }

    /// Like `exit_lambda`, but first wraps the finished buffer's body in a
    /// stack-frame allocation: a `subq $frame_bytes, %rsp` right after the
    /// entry label, and a matching `addq $frame_bytes, %rsp` right before
    /// the trailing `ret`. Callers only know a function's peak spill-slot
    /// usage once its whole body has been emitted, so this surgery happens
    /// after the fact on the completed buffer rather than at `enter_lambda`
    /// time.
    pub fn exit_lambda_with_frame(&mut self, frame_bytes: i64) {
        let mut finished = self
            .fun_stack
            .pop()
            .expect("exit_lambda called without a matching enter_lambda");
        if frame_bytes > 0 {
            let label_end = finished
                .find('\n')
                .expect("lambda buffer must start with its entry label line");
            finished.insert_str(label_end + 1, &format!("    subq ${frame_bytes}, %rsp\n"));
            let ret_pos = finished
                .rfind("    ret\n")
                .expect("lambda buffer must end with a ret instruction");
            finished.insert_str(ret_pos, &format!("    addq ${frame_bytes}, %rsp\n"));
        }
        let parent = self
            .fun_stack
            .last_mut()
            .expect("fun section buffer stack must never be empty");
        parent.push_str(&finished);
    }

    /// Replaces every occurrence of `from` with `to` in the innermost
    /// (currently open) `fun` buffer. Used to patch a placeholder frame
    /// size left by a self tail call emitted before the function's peak
    /// spill-slot usage -- and so its final frame size -- was known.
    pub fn replace_in_current_fun(&mut self, from: &str, to: &str) {
        let buf = self
            .fun_stack
            .last_mut()
            .expect("fun section buffer stack must never be empty");
        if buf.contains(from) {
            *buf = buf.replace(from, to);
        }
    }

    pub fn push_fun_line(&mut self, line: &str) {
        self.fun_stack
            .last_mut()
            .expect("fun section buffer stack must never be empty")
            .push_str(line);
        self.fun_stack.last_mut().unwrap().push('\n');
    }

    pub fn push_bss(&mut self, line: &str) {
        self.bss.push_str(line);
        self.bss.push('\n');
    }

    pub fn push_data(&mut self, line: &str) {
        self.data.push_str(line);
        self.data.push('\n');
    }

    pub fn push_main(&mut self, line: &str) {
        self.main_prologue.push_str(line);
        self.main_prologue.push('\n');
    }

    pub fn push_quote(&mut self, line: &str) {
        self.quotes.push_str(line);
        self.quotes.push('\n');
    }

    pub fn push_body(&mut self, line: &str) {
        self.body.push_str(line);
        self.body.push('\n');
    }

    pub fn push_end(&mut self, line: &str) {
        self.end.push_str(line);
        self.end.push('\n');
    }

    /// Concatenate every section into final assembly text, in the fixed
    /// order `bss | data | fun | main | quotes | body | end`, threading in
    /// the `.section` directives an assembler needs at each code/data
    /// boundary (the buffers themselves hold only the content, not the
    /// directives, so nested lambdas can be spliced without duplicating
    /// `.text` markers).
    pub fn assemble(&self) -> String {
        assert_eq!(
            self.fun_stack.len(),
            1,
            "unbalanced enter_lambda/exit_lambda calls"
        );
        let mut out = String::new();
        out.push_str(".section .bss\n");
        out.push_str(&self.bss);
        out.push_str(".section .data\n");
        out.push_str(&self.data);
        out.push_str(".section .text\n");
        out.push_str(".globl main\n");
        out.push_str(&self.fun_stack[0]);
        out.push_str(&self.main_prologue);
        out.push_str(".section .data\n");
        out.push_str(&self.quotes);
        out.push_str(".section .text\n");
        out.push_str(&self.body);
        out.push_str(&self.end);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_lambdas_preserve_textual_order() {
        let mut s = Sections::new();
        s.push_fun_line("outer_start:");
        s.enter_lambda();
        s.push_fun_line("inner:");
        s.exit_lambda();
        s.push_fun_line("outer_end:");
        let asm = s.assemble();
        let inner_pos = asm.find("inner:").unwrap();
        let outer_end_pos = asm.find("outer_end:").unwrap();
        assert!(inner_pos < outer_end_pos);
    }

    #[test]
    fn section_order_is_fixed() {
        let mut s = Sections::new();
        s.push_bss(".lcomment_bss");
        s.push_data(".lcomment_data");
        s.push_fun_line(".lcomment_fun");
        s.push_main(".lcomment_main");
        s.push_quote(".lcomment_quotes");
        s.push_body(".lcomment_body");
        s.push_end(".lcomment_end");
        let asm = s.assemble();
        let positions: Vec<usize> = [
            ".lcomment_bss",
            ".lcomment_data",
            ".lcomment_fun",
            ".lcomment_main",
            ".lcomment_quotes",
            ".lcomment_body",
            ".lcomment_end",
        ]
        .iter()
        .map(|needle| asm.find(needle).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}
