//! Compiler configuration.
//!
//! This language has no module/extension system, so the knobs here are
//! just the two runtime sizing parameters the generated `main` prologue
//! passes to `init_gc`.

/// Default minor-generation size, in bytes, used when a program does not
/// override it.
pub const DEFAULT_HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Default root-stack capacity, in entries, used when a program does not
/// override it.
pub const DEFAULT_ROOT_STACK_SIZE: usize = 64 * 1024;

/// Configuration for a single compilation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Bytes reserved for each of gen0's from-space and to-space.
    pub heap_size: usize,
    /// Number of root-stack entries reserved.
    pub root_stack_size: usize,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    pub fn with_root_stack_size(mut self, entries: usize) -> Self {
        self.root_stack_size = entries;
        self
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            heap_size: DEFAULT_HEAP_SIZE,
            root_stack_size: DEFAULT_ROOT_STACK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_documented_sizes() {
        let c = CompilerConfig::new();
        assert_eq!(c.heap_size, DEFAULT_HEAP_SIZE);
        assert_eq!(c.root_stack_size, DEFAULT_ROOT_STACK_SIZE);
    }

    #[test]
    fn builder_overrides_sizes() {
        let c = CompilerConfig::new()
            .with_heap_size(4096)
            .with_root_stack_size(256);
        assert_eq!(c.heap_size, 4096);
        assert_eq!(c.root_stack_size, 256);
    }
}
