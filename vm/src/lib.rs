pub mod alloc;
pub mod cache;
pub mod codeheap;
pub mod interp;
pub mod loader;
pub mod opcode;
pub mod runtime;

use std::collections::HashMap;
use std::path::PathBuf;

use heap::{Heap, HeapSettings};
use object::Value;
use rustc_hash::FxHashMap;

use crate::cache::ICaches;
use crate::codeheap::{BlockVersion, CodeHeap, ExecStack};
use crate::opcode::Opcode;

/// A recoverable execution failure carrying a message.
///
/// Structural errors (malformed program graphs) and runtime errors
/// (stack underflow, bad operand types, out-of-bounds access) both
/// surface as this one type and bubble out of the evaluator. `abort`
/// and internal invariant violations terminate the process instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    msg: String,
}

impl RunError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for RunError {}

/// The VM owns the value heap and every process-lived cache.
///
/// All of this state is single-threaded. The caches are write-once per
/// key and never invalidated: the program graph is immutable once the
/// loader has produced it.
pub struct VM {
    pub heap: Heap,
    /// Interned strings: Rust string → heap `Str` value.
    pub intern_table: HashMap<String, Value>,
    /// Decoded opcodes keyed by instruction-object identity.
    pub op_cache: FxHashMap<u64, Opcode>,
    /// The interpreter's per-call-site field inline caches.
    pub ics: ICaches,
    /// Single-character strings keyed by byte value. UNDEF marks an
    /// unfilled slot; UNDEF can never be a `get_char` result.
    pub char_strings: [Value; 256],
    /// Loaded packages keyed by logical name.
    pub packages: HashMap<String, Value>,
    /// Directories `import` searches for `<name>.zim`.
    pub pkg_dirs: Vec<PathBuf>,
    /// Compiled block versions keyed by block-object identity, one
    /// version per block.
    pub version_map: FxHashMap<u64, BlockVersion>,
    pub code_heap: CodeHeap,
    /// Persistent value stack for the code-heap executor.
    pub exec_stack: ExecStack,
}

impl VM {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            heap: Heap::new(settings),
            intern_table: HashMap::new(),
            op_cache: FxHashMap::default(),
            ics: ICaches::new(),
            char_strings: [Value::UNDEF; 256],
            packages: HashMap::new(),
            pkg_dirs: vec![PathBuf::from("packages"), PathBuf::from(".")],
            version_map: FxHashMap::default(),
            code_heap: CodeHeap::new(),
            exec_stack: ExecStack::new(),
        }
    }
}
