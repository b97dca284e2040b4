/// Engine settings for a [`Runtime`](super::runtime::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Run functions through the compiled closure chain.
    pub compile: bool,
    pub max_call_depth: usize,
    /// Upper bound for `memory.grow`, on top of the memory's own maximum.
    pub max_memory_pages: u32,
    /// Loop back-edges allowed per instance; `None` is unbounded.
    pub fuel: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compile: true,
            max_call_depth: 1024,
            max_memory_pages: 65536,
            fuel: None,
        }
    }
}

impl Config {
    pub fn compile(mut self, compile: bool) -> Self {
        self.compile = compile;
        self
    }

    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }

    pub fn fuel(mut self, fuel: Option<u64>) -> Self {
        self.fuel = fuel;
        self
    }
}
