use object::{Obj, Value};

use crate::RunError;

/// Per-call-site inline cache for one fixed field name.
///
/// Monomorphic in the field name, polymorphic across objects: the slot
/// hint is shared by every object that flows through the site, relying
/// on objects with equal layouts answering from the same slot and
/// objects with different layouts tolerating a stale hint (they
/// re-resolve by name and overwrite it).
pub struct ICache {
    field: &'static str,
    slot: u32,
}

impl ICache {
    pub const fn new(field: &'static str) -> Self {
        Self { field, slot: 0 }
    }

    #[inline]
    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Read the cached field from `obj`.
    pub fn get(&mut self, obj: Value) -> Result<Value, RunError> {
        debug_assert!(obj.is_object());
        let o: &Obj = unsafe { obj.as_ref() };
        match unsafe { o.get_field(self.field.as_bytes(), &mut self.slot) } {
            Some(val) => Ok(val),
            None => Err(RunError::new(format!(
                "missing field \"{}\"",
                self.field
            ))),
        }
    }

    pub fn get_int64(&mut self, obj: Value) -> Result<i64, RunError> {
        let val = self.get(obj)?;
        assert!(
            val.is_int64(),
            "field \"{}\" expects int64 value",
            self.field
        );
        Ok(unsafe { val.as_i64() })
    }

    pub fn get_str(&mut self, obj: Value) -> Result<Value, RunError> {
        let val = self.get(obj)?;
        assert!(
            val.is_string(),
            "field \"{}\" expects string value",
            self.field
        );
        Ok(val)
    }

    pub fn get_obj(&mut self, obj: Value) -> Result<Value, RunError> {
        let val = self.get(obj)?;
        assert!(
            val.is_object(),
            "field \"{}\" expects object value",
            self.field
        );
        Ok(val)
    }

    pub fn get_arr(&mut self, obj: Value) -> Result<Value, RunError> {
        let val = self.get(obj)?;
        assert!(
            val.is_array(),
            "field \"{}\" expects array value",
            self.field
        );
        Ok(val)
    }
}

/// The evaluator's call sites, one cache each. The original keeps these
/// as function-local statics; Rust statics are immutable, so they live
/// in the VM instead.
pub struct ICaches {
    pub decode_op: ICache,

    // call() function header reads
    pub fn_num_params: ICache,
    pub fn_num_locals: ICache,
    pub fn_entry: ICache,
    pub branch_instrs: ICache,

    // per-opcode operand reads
    pub get_local_idx: ICache,
    pub set_local_idx: ICache,
    pub push_val: ICache,
    pub dup_idx: ICache,
    pub has_tag_tag: ICache,
    pub jump_to: ICache,
    pub if_then: ICache,
    pub if_else: ICache,
    pub call_ret_to: ICache,
    pub call_num_args: ICache,
    pub callee_num_params: ICache,

    // code-heap path
    pub compile_instrs: ICache,
    pub compile_op: ICache,
    pub compile_val: ICache,
    pub entry_num_params: ICache,
    pub entry_num_locals: ICache,
    pub entry_block: ICache,
}

impl ICaches {
    pub fn new() -> Self {
        Self {
            decode_op: ICache::new("op"),
            fn_num_params: ICache::new("num_params"),
            fn_num_locals: ICache::new("num_locals"),
            fn_entry: ICache::new("entry"),
            branch_instrs: ICache::new("instrs"),
            get_local_idx: ICache::new("idx"),
            set_local_idx: ICache::new("idx"),
            push_val: ICache::new("val"),
            dup_idx: ICache::new("idx"),
            has_tag_tag: ICache::new("tag"),
            jump_to: ICache::new("to"),
            if_then: ICache::new("then"),
            if_else: ICache::new("else"),
            call_ret_to: ICache::new("ret_to"),
            call_num_args: ICache::new("num_args"),
            callee_num_params: ICache::new("num_params"),
            compile_instrs: ICache::new("instrs"),
            compile_op: ICache::new("op"),
            compile_val: ICache::new("val"),
            entry_num_params: ICache::new("num_params"),
            entry_num_locals: ICache::new("num_locals"),
            entry_block: ICache::new("entry"),
        }
    }
}

impl Default for ICaches {
    fn default() -> Self {
        Self::new()
    }
}
