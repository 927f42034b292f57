use object::{Str, Value};

use crate::{RunError, VM};

/// Decoded instruction opcodes.
///
/// `Swap`, `GetTag` and the `_Stub` branch variants are carried in the
/// enum without a decoder mapping; no instruction object currently
/// decodes to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    GetLocal,
    SetLocal,

    // Stack manipulation
    Push,
    Pop,
    Dup,
    Swap,

    // 64-bit integer operations
    AddI64,
    SubI64,
    MulI64,
    LtI64,
    LeI64,
    GtI64,
    GeI64,
    EqI64,

    // String operations
    StrLen,
    GetChar,
    GetCharCode,
    StrCat,
    EqStr,

    // Object operations
    NewObject,
    HasField,
    SetField,
    GetField,
    EqObj,

    // Miscellaneous
    EqBool,
    HasTag,
    GetTag,

    // Array operations
    NewArray,
    ArrayLen,
    ArrayPush,
    GetElem,
    SetElem,

    // Branch instructions
    // Note: the opcode for a stub branch is opcode + 1
    Jump,
    JumpStub,
    IfTrue,
    IfTrueStub,
    Call,
    Ret,

    Import,
    Abort,
}

impl Opcode {
    /// # Safety
    ///
    /// `raw` must have been produced by `as u16` on a valid variant.
    #[inline(always)]
    pub unsafe fn from_u16_unchecked(raw: u16) -> Self {
        debug_assert!(raw <= Opcode::Abort as u16);
        std::mem::transmute::<u16, Opcode>(raw)
    }
}

/// Map an instruction object to its opcode, memoized by instruction
/// identity. Caching without invalidation is safe: instructions are
/// immutable once loaded.
pub fn decode(vm: &mut VM, instr: Value) -> Result<Opcode, RunError> {
    let key = instr.word();
    if let Some(&op) = vm.op_cache.get(&key) {
        return Ok(op);
    }

    // Get the opcode string for this instruction
    let op_val = vm.ics.decode_op.get_str(instr)?;
    let op_str = unsafe { op_val.as_ref::<Str>().as_str() };

    let op = match op_str {
        // Local variable access
        "get_local" => Opcode::GetLocal,
        "set_local" => Opcode::SetLocal,

        // Stack manipulation
        "push" => Opcode::Push,
        "pop" => Opcode::Pop,
        "dup" => Opcode::Dup,

        // 64-bit integer operations
        "add_i64" => Opcode::AddI64,
        "sub_i64" => Opcode::SubI64,
        "mul_i64" => Opcode::MulI64,
        "lt_i64" => Opcode::LtI64,
        "le_i64" => Opcode::LeI64,
        "gt_i64" => Opcode::GtI64,
        "ge_i64" => Opcode::GeI64,
        "eq_i64" => Opcode::EqI64,

        // String operations
        "str_len" => Opcode::StrLen,
        "get_char" => Opcode::GetChar,
        "get_char_code" => Opcode::GetCharCode,
        "str_cat" => Opcode::StrCat,
        "eq_str" => Opcode::EqStr,

        // Object operations
        "new_object" => Opcode::NewObject,
        "has_field" => Opcode::HasField,
        "set_field" => Opcode::SetField,
        "get_field" => Opcode::GetField,
        "eq_obj" => Opcode::EqObj,

        // Array operations
        "new_array" => Opcode::NewArray,
        "array_len" => Opcode::ArrayLen,
        "array_push" => Opcode::ArrayPush,
        "get_elem" => Opcode::GetElem,
        "set_elem" => Opcode::SetElem,

        // Miscellaneous
        "eq_bool" => Opcode::EqBool,
        "has_tag" => Opcode::HasTag,

        // Branch instructions
        "jump" => Opcode::Jump,
        "if_true" => Opcode::IfTrue,
        "call" => Opcode::Call,
        "ret" => Opcode::Ret,

        // VM interface
        "import" => Opcode::Import,
        "abort" => Opcode::Abort,

        _ => {
            return Err(RunError::new(format!(
                "unknown op in decode \"{op_str}\""
            )))
        }
    };

    vm.op_cache.insert(key, op);
    Ok(op)
}
