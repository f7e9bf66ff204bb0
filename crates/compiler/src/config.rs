//! Evaluation configuration
//!
//! Reader limits and VM capacities, with builder-style construction and
//! TOML loading for the CLI's `--config` flag.
//!
//! ```toml
//! [reader]
//! max_depth = 128
//! max_collection = 100000
//! max_string_bytes = 1048576
//!
//! [vm]
//! stack_slots = 32768
//! frame_slots = 1024
//! ```

use serde::Deserialize;
use std::path::Path;

/// Caps enforced by the tokenizer and reader, even on malformed input.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReadLimits {
    /// Maximum nesting depth of collections and reader macros.
    pub max_depth: usize,
    /// Maximum element count of one collection literal.
    pub max_collection: usize,
    /// Maximum byte length of one string literal.
    pub max_string_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        ReadLimits {
            max_depth: 256,
            max_collection: 1_000_000,
            max_string_bytes: 1024 * 1024,
        }
    }
}

/// Operand/frame stack capacities handed to the VM.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct VmLimits {
    pub stack_slots: usize,
    pub frame_slots: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        VmLimits {
            stack_slots: clove_runtime::STACK_CAPACITY,
            frame_slots: clove_runtime::FRAME_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub reader: ReadLimits,
    pub vm: VmLimits,
}

impl EvalConfig {
    pub fn new() -> Self {
        EvalConfig::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.reader.max_depth = depth;
        self
    }

    pub fn with_max_collection(mut self, count: usize) -> Self {
        self.reader.max_collection = count;
        self
    }

    pub fn with_max_string_bytes(mut self, bytes: usize) -> Self {
        self.reader.max_string_bytes = bytes;
        self
    }

    pub fn with_stack_slots(mut self, slots: usize) -> Self {
        self.vm.stack_slots = slots;
        self
    }

    pub fn with_frame_slots(mut self, slots: usize) -> Self {
        self.vm.frame_slots = slots;
        self
    }

    /// Load from a TOML file; missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&text).map_err(|e| format!("invalid config {}: {}", path.display(), e))
    }
}
