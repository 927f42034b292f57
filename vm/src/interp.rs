use object::{Array, Obj, Str, Tag, Value};

use crate::alloc;
use crate::opcode::{decode, Opcode};
use crate::runtime::{self, HostFn};
use crate::{RunError, VM};

/// Format a `src_pos` object as `<src_name>@<line_no>:<col_no>`.
pub fn pos_to_string(src_pos: Value) -> Result<String, RunError> {
    if !src_pos.is_object() {
        return Err(RunError::new("src_pos must be an object"));
    }
    let obj: &Obj = unsafe { src_pos.as_ref() };
    let line_no = pos_field_int(obj, "line_no")?;
    let col_no = pos_field_int(obj, "col_no")?;
    let src_name = unsafe { obj.field_by_name(b"src_name") }
        .ok_or_else(|| RunError::new("missing field \"src_name\""))?;
    if !src_name.is_string() {
        return Err(RunError::new("src_pos src_name must be a string"));
    }
    let name: &Str = unsafe { src_name.as_ref() };
    Ok(format!("{}@{}:{}", unsafe { name.as_str() }, line_no, col_no))
}

fn pos_field_int(obj: &Obj, field: &str) -> Result<i64, RunError> {
    let val = unsafe { obj.field_by_name(field.as_bytes()) }
        .ok_or_else(|| RunError::new(format!("missing field \"{field}\"")))?;
    if !val.is_int64() {
        return Err(RunError::new(format!(
            "src_pos {field} must be an int64"
        )));
    }
    Ok(unsafe { val.as_i64() })
}

// ── Stack helpers ──────────────────────────────────────────────────

fn pop_val(stack: &mut Vec<Value>) -> Result<Value, RunError> {
    stack
        .pop()
        .ok_or_else(|| RunError::new("op cannot pop value, stack empty"))
}

fn pop_bool(stack: &mut Vec<Value>) -> Result<bool, RunError> {
    let val = pop_val(stack)?;
    if !val.is_bool() {
        return Err(RunError::new("op expects boolean value"));
    }
    Ok(unsafe { val.as_bool() })
}

fn pop_int64(stack: &mut Vec<Value>) -> Result<i64, RunError> {
    let val = pop_val(stack)?;
    if !val.is_int64() {
        return Err(RunError::new("op expects int64 value"));
    }
    Ok(unsafe { val.as_i64() })
}

fn pop_str(stack: &mut Vec<Value>) -> Result<Value, RunError> {
    let val = pop_val(stack)?;
    if !val.is_string() {
        return Err(RunError::new("op expects string value"));
    }
    Ok(val)
}

fn pop_array(stack: &mut Vec<Value>) -> Result<Value, RunError> {
    let val = pop_val(stack)?;
    if !val.is_array() {
        return Err(RunError::new("op expects array value"));
    }
    Ok(val)
}

fn pop_obj(stack: &mut Vec<Value>) -> Result<Value, RunError> {
    let val = pop_val(stack)?;
    if !val.is_object() {
        return Err(RunError::new("op expects object value"));
    }
    Ok(val)
}

fn push_bool(stack: &mut Vec<Value>, val: bool) {
    stack.push(Value::from_bool(val));
}

/// Make `target` the current block.
///
/// Only legal when the just-executed instruction was the last in its
/// block: exactly one branch per block, and it comes last.
fn branch_to(
    vm: &mut VM,
    instrs: &mut Value,
    num_instrs: &mut usize,
    instr_idx: &mut usize,
    target: Value,
) -> Result<(), RunError> {
    if *instr_idx != *num_instrs {
        return Err(RunError::new(format!(
            "only the last instruction in a block can be a branch \
             (instrIdx={}, numInstrs={})",
            *instr_idx, *num_instrs
        )));
    }

    let instr_arr = vm.ics.branch_instrs.get_arr(target)?;
    let arr: &Array = unsafe { instr_arr.as_ref() };

    *instrs = instr_arr;
    *num_instrs = arr.len() as usize;
    *instr_idx = 0;

    if *num_instrs == 0 {
        return Err(RunError::new("target basic block is empty"));
    }
    Ok(())
}

/// Run a function object to completion.
///
/// Calls re-enter this function recursively, so the host call stack
/// bounds the VM call depth.
pub fn call(vm: &mut VM, fun: Value, args: &[Value]) -> Result<Value, RunError> {
    let num_params = vm.ics.fn_num_params.get_int64(fun)?;
    let num_locals = vm.ics.fn_num_locals.get_int64(fun)?;
    assert!(
        args.len() as i64 <= num_params,
        "call received more arguments than parameters"
    );
    assert!(num_params <= num_locals, "num_params exceeds num_locals");

    let mut locals = vec![Value::UNDEF; num_locals as usize];
    locals[..args.len()].copy_from_slice(args);

    // Temporary value stack
    let mut stack: Vec<Value> = Vec::new();

    // Current block: instruction array, its length, next index
    let mut instrs = Value::UNDEF;
    let mut num_instrs = 0usize;
    let mut instr_idx = 0usize;

    // Branch to the entry block
    let entry = vm.ics.fn_entry.get_obj(fun)?;
    branch_to(vm, &mut instrs, &mut num_instrs, &mut instr_idx, entry)?;

    loop {
        assert!(
            instr_idx < num_instrs,
            "ran off the end of a basic block"
        );

        let instr = {
            let instr_arr: &Array = unsafe { instrs.as_ref() };
            unsafe { instr_arr.element(instr_idx as u32) }
        };
        assert!(instr.is_object(), "instruction must be an object");
        instr_idx += 1;

        let op = decode(vm, instr)?;

        match op {
            // Read a local variable and push it on the stack
            Opcode::GetLocal => {
                let local_idx = vm.ics.get_local_idx.get_int64(instr)?;
                assert!(
                    (local_idx as u64) < locals.len() as u64,
                    "get_local index out of range"
                );
                stack.push(locals[local_idx as usize]);
            }

            // Set a local variable
            Opcode::SetLocal => {
                let local_idx = vm.ics.set_local_idx.get_int64(instr)?;
                assert!(
                    (local_idx as u64) < locals.len() as u64,
                    "set_local index out of range"
                );
                locals[local_idx as usize] = pop_val(&mut stack)?;
            }

            Opcode::Push => {
                let val = vm.ics.push_val.get(instr)?;
                stack.push(val);
            }

            Opcode::Pop => {
                if stack.pop().is_none() {
                    return Err(RunError::new("pop failed, stack empty"));
                }
            }

            // Duplicate a value relative to the top of the stack
            Opcode::Dup => {
                let idx = vm.ics.dup_idx.get_int64(instr)?;
                if idx as u64 >= stack.len() as u64 {
                    return Err(RunError::new(
                        "stack underflow, invalid index for dup",
                    ));
                }
                let val = stack[stack.len() - 1 - idx as usize];
                stack.push(val);
            }

            // Swap the topmost two stack elements
            Opcode::Swap => {
                let v0 = pop_val(&mut stack)?;
                let v1 = pop_val(&mut stack)?;
                stack.push(v0);
                stack.push(v1);
            }

            //
            // 64-bit integer operations
            //
            Opcode::AddI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                stack.push(Value::from_i64(arg0.wrapping_add(arg1)));
            }

            Opcode::SubI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                stack.push(Value::from_i64(arg0.wrapping_sub(arg1)));
            }

            Opcode::MulI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                stack.push(Value::from_i64(arg0.wrapping_mul(arg1)));
            }

            Opcode::LtI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                push_bool(&mut stack, arg0 < arg1);
            }

            Opcode::LeI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                push_bool(&mut stack, arg0 <= arg1);
            }

            Opcode::GtI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                push_bool(&mut stack, arg0 > arg1);
            }

            Opcode::GeI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                push_bool(&mut stack, arg0 >= arg1);
            }

            Opcode::EqI64 => {
                let arg1 = pop_int64(&mut stack)?;
                let arg0 = pop_int64(&mut stack)?;
                push_bool(&mut stack, arg0 == arg1);
            }

            //
            // String operations
            //
            Opcode::StrLen => {
                let str_val = pop_str(&mut stack)?;
                let s: &Str = unsafe { str_val.as_ref() };
                stack.push(Value::from_i64(s.len() as i64));
            }

            Opcode::GetChar => {
                let idx = pop_int64(&mut stack)?;
                let str_val = pop_str(&mut stack)?;
                let s: &Str = unsafe { str_val.as_ref() };

                if idx < 0 || idx as u64 >= s.len() as u64 {
                    return Err(RunError::new(
                        "get_char, index out of bounds",
                    ));
                }

                let ch = unsafe { s.byte(idx as u32) } as usize;

                // Cache single-character strings
                if vm.char_strings[ch].is_undef() {
                    vm.char_strings[ch] =
                        alloc::alloc_str(&mut vm.heap, &[ch as u8]);
                }

                stack.push(vm.char_strings[ch]);
            }

            Opcode::GetCharCode => {
                let idx = pop_int64(&mut stack)?;
                let str_val = pop_str(&mut stack)?;
                let s: &Str = unsafe { str_val.as_ref() };

                if idx < 0 || idx as u64 >= s.len() as u64 {
                    return Err(RunError::new(
                        "get_char_code, index out of bounds",
                    ));
                }

                let ch = unsafe { s.byte(idx as u32) };
                stack.push(Value::from_i64(ch as i64));
            }

            Opcode::StrCat => {
                let a = pop_str(&mut stack)?;
                let b = pop_str(&mut stack)?;
                // Concatenation preserves push order: b was pushed first.
                let bytes = {
                    let a_str: &Str = unsafe { a.as_ref() };
                    let b_str: &Str = unsafe { b.as_ref() };
                    let mut buf = Vec::with_capacity(
                        (a_str.len() + b_str.len()) as usize,
                    );
                    buf.extend_from_slice(unsafe { b_str.bytes() });
                    buf.extend_from_slice(unsafe { a_str.bytes() });
                    buf
                };
                stack.push(alloc::alloc_str(&mut vm.heap, &bytes));
            }

            Opcode::EqStr => {
                let arg1 = pop_str(&mut stack)?;
                let arg0 = pop_str(&mut stack)?;
                let s1: &Str = unsafe { arg1.as_ref() };
                let s0: &Str = unsafe { arg0.as_ref() };
                push_bool(&mut stack, unsafe { s0.bytes() == s1.bytes() });
            }

            //
            // Object operations
            //
            Opcode::NewObject => {
                let capacity = pop_int64(&mut stack)?;
                let obj =
                    alloc::alloc_obj(&mut vm.heap, capacity.max(0) as u32);
                stack.push(obj);
            }

            Opcode::HasField => {
                let field_name = pop_str(&mut stack)?;
                let obj = pop_obj(&mut stack)?;
                let name: &Str = unsafe { field_name.as_ref() };
                let o: &Obj = unsafe { obj.as_ref() };
                let found = unsafe { o.has_field(name.bytes()) };
                push_bool(&mut stack, found);
            }

            Opcode::SetField => {
                let val = pop_val(&mut stack)?;
                let field_name = pop_str(&mut stack)?;
                let obj = pop_obj(&mut stack)?;

                let name: &Str = unsafe { field_name.as_ref() };
                if !runtime::is_valid_ident(unsafe { name.bytes() }) {
                    return Err(RunError::new(format!(
                        "invalid identifier in set_field \"{}\"",
                        String::from_utf8_lossy(unsafe { name.bytes() })
                    )));
                }

                alloc::obj_set_field(&mut vm.heap, obj, field_name, val);
            }

            // Reading a field that is not present fails; the running
            // program is expected to test with has_field first.
            Opcode::GetField => {
                let field_name = pop_str(&mut stack)?;
                let obj = pop_obj(&mut stack)?;

                let name: &Str = unsafe { field_name.as_ref() };
                let o: &Obj = unsafe { obj.as_ref() };
                match unsafe { o.field_by_name(name.bytes()) } {
                    Some(val) => stack.push(val),
                    None => {
                        return Err(RunError::new(format!(
                            "get_field failed, missing field \"{}\"",
                            String::from_utf8_lossy(unsafe { name.bytes() })
                        )));
                    }
                }
            }

            Opcode::EqObj => {
                let arg1 = pop_val(&mut stack)?;
                let arg0 = pop_val(&mut stack)?;
                push_bool(&mut stack, arg0 == arg1);
            }

            //
            // Array operations
            //
            Opcode::NewArray => {
                let len = pop_int64(&mut stack)?;
                let len = len.max(0) as u32;
                stack.push(alloc::alloc_array(&mut vm.heap, len, len));
            }

            Opcode::ArrayLen => {
                let arr = pop_array(&mut stack)?;
                let a: &Array = unsafe { arr.as_ref() };
                stack.push(Value::from_i64(a.len() as i64));
            }

            Opcode::ArrayPush => {
                let val = pop_val(&mut stack)?;
                let arr = pop_array(&mut stack)?;
                alloc::array_push(&mut vm.heap, arr, val);
            }

            Opcode::SetElem => {
                let val = pop_val(&mut stack)?;
                let idx = pop_int64(&mut stack)?;
                let mut arr = pop_array(&mut stack)?;

                let a: &mut Array = unsafe { arr.as_mut() };
                if idx < 0 || idx as u64 >= a.len() as u64 {
                    return Err(RunError::new(
                        "set_elem, index out of bounds",
                    ));
                }
                unsafe { a.set_element(idx as u32, val) };
            }

            Opcode::GetElem => {
                let idx = pop_int64(&mut stack)?;
                let arr = pop_array(&mut stack)?;

                let a: &Array = unsafe { arr.as_ref() };
                if idx < 0 || idx as u64 >= a.len() as u64 {
                    return Err(RunError::new(
                        "get_elem, index out of bounds",
                    ));
                }
                stack.push(unsafe { a.element(idx as u32) });
            }

            Opcode::EqBool => {
                let arg1 = pop_bool(&mut stack)?;
                let arg0 = pop_bool(&mut stack)?;
                push_bool(&mut stack, arg0 == arg1);
            }

            // Test if a value has a given tag
            Opcode::HasTag => {
                let tag = pop_val(&mut stack)?.tag();
                let tag_val = vm.ics.has_tag_tag.get_str(instr)?;
                let tag_str: &Str = unsafe { tag_val.as_ref() };
                let tag_name = unsafe { tag_str.bytes() };

                let matches = match tag {
                    Tag::Undef => tag_name == b"undef",
                    Tag::Bool => tag_name == b"bool",
                    Tag::Int64 => tag_name == b"int64",
                    Tag::String => tag_name == b"string",
                    Tag::Array => tag_name == b"array",
                    Tag::Object => tag_name == b"object",
                    _ => {
                        return Err(RunError::new(
                            "unknown value type in has_tag",
                        ));
                    }
                };
                push_bool(&mut stack, matches);
            }

            Opcode::Jump => {
                let target = vm.ics.jump_to.get_obj(instr)?;
                branch_to(
                    vm,
                    &mut instrs,
                    &mut num_instrs,
                    &mut instr_idx,
                    target,
                )?;
            }

            Opcode::IfTrue => {
                let then_bb = vm.ics.if_then.get_obj(instr)?;
                let else_bb = vm.ics.if_else.get_obj(instr)?;
                let arg0 = pop_val(&mut stack)?;
                // Anything but the boolean TRUE takes the else branch.
                let target =
                    if arg0 == Value::TRUE { then_bb } else { else_bb };
                branch_to(
                    vm,
                    &mut instrs,
                    &mut num_instrs,
                    &mut instr_idx,
                    target,
                )?;
            }

            // Regular function call
            Opcode::Call => {
                let ret_to = vm.ics.call_ret_to.get_obj(instr)?;
                let num_args = vm.ics.call_num_args.get_int64(instr)?;
                assert!(num_args >= 0, "negative num_args at call site");

                let callee = pop_val(&mut stack)?;

                if (stack.len() as i64) < num_args {
                    return Err(RunError::new("stack underflow at call"));
                }

                // Copy the arguments into a vector, undoing the pop order
                let num_args = num_args as usize;
                let mut args = vec![Value::UNDEF; num_args];
                for i in 0..num_args {
                    args[num_args - 1 - i] = pop_val(&mut stack)?;
                }

                let num_params = if callee.is_object() {
                    vm.ics.callee_num_params.get_int64(callee)? as usize
                } else if callee.is_host_fn() {
                    let host_fn: &HostFn = unsafe { callee.as_ref() };
                    host_fn.num_params()
                } else {
                    return Err(RunError::new("invalid callee at call site"));
                };

                if num_args != num_params {
                    let instr_obj: &Obj = unsafe { instr.as_ref() };
                    let src_pos_str = match unsafe {
                        instr_obj.field_by_name(b"src_pos")
                    } {
                        Some(pos) => format!("{} - ", pos_to_string(pos)?),
                        None => String::new(),
                    };

                    return Err(RunError::new(format!(
                        "{src_pos_str}incorrect argument count in call, \
                         received {num_args}, expected {num_params}"
                    )));
                }

                let ret_val = if callee.is_object() {
                    // Perform the call
                    call(vm, callee, &args)?
                } else {
                    let host_fn: &HostFn = unsafe { callee.as_ref() };
                    match num_args {
                        0 => host_fn.call0(vm)?,
                        1 => host_fn.call1(vm, args[0])?,
                        2 => host_fn.call2(vm, args[0], args[1])?,
                        3 => host_fn.call3(vm, args[0], args[1], args[2])?,
                        _ => unreachable!(
                            "host functions take at most 3 arguments"
                        ),
                    }
                };

                // Push the return value on the stack
                stack.push(ret_val);

                // Jump to the return basic block
                branch_to(
                    vm,
                    &mut instrs,
                    &mut num_instrs,
                    &mut instr_idx,
                    ret_to,
                )?;
            }

            Opcode::Ret => {
                let val = pop_val(&mut stack)?;
                return Ok(val);
            }

            Opcode::Import => {
                let pkg_name_val = pop_str(&mut stack)?;
                let pkg_name = {
                    let s: &Str = unsafe { pkg_name_val.as_ref() };
                    String::from_utf8_lossy(unsafe { s.bytes() })
                        .into_owned()
                };
                let pkg = runtime::import(vm, &pkg_name)?;
                stack.push(pkg);
            }

            Opcode::Abort => {
                let err_msg = pop_str(&mut stack)?;

                // If a source position was specified
                let instr_obj: &Obj = unsafe { instr.as_ref() };
                if let Some(pos) =
                    unsafe { instr_obj.field_by_name(b"src_pos") }
                {
                    print!("{} - ", pos_to_string(pos)?);
                }

                let msg: &Str = unsafe { err_msg.as_ref() };
                let msg_bytes = unsafe { msg.bytes() };
                if !msg_bytes.is_empty() {
                    println!(
                        "aborting execution due to error: {}",
                        String::from_utf8_lossy(msg_bytes)
                    );
                } else {
                    println!("aborting execution due to error");
                }

                std::process::exit(-1);
            }

            Opcode::GetTag | Opcode::JumpStub | Opcode::IfTrueStub => {
                unreachable!("unhandled op in interpreter: {op:?}")
            }
        }
    }
}

/// Call a function exported by a package.
pub fn call_export_fn(
    vm: &mut VM,
    pkg: Value,
    fn_name: &str,
    args: &[Value],
) -> Result<Value, RunError> {
    if !pkg.is_object() {
        return Err(RunError::new("package must be an object"));
    }
    let fn_val = {
        let pkg_obj: &Obj = unsafe { pkg.as_ref() };
        unsafe { pkg_obj.field_by_name(fn_name.as_bytes()) }.ok_or_else(
            || RunError::new(format!("package has no export \"{fn_name}\"")),
        )?
    };
    if !fn_val.is_object() {
        return Err(RunError::new(format!(
            "export \"{fn_name}\" is not a function object"
        )));
    }
    call(vm, fn_val, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader;
    use heap::HeapSettings;
    use std::path::Path;

    fn test_settings() -> HeapSettings {
        HeapSettings {
            heap_size: 4 * 1024 * 1024,
        }
    }

    fn run_image(src: &str) -> Result<Value, RunError> {
        let mut vm = VM::new(test_settings());
        let pkg = loader::parse_str(&mut vm, src, "test").expect("parse error");
        call_export_fn(&mut vm, pkg, "main", &[])
    }

    fn run_image_with_vm(src: &str) -> (VM, Result<Value, RunError>) {
        let mut vm = VM::new(test_settings());
        let pkg = loader::parse_str(&mut vm, src, "test").expect("parse error");
        let result = call_export_fn(&mut vm, pkg, "main", &[]);
        (vm, result)
    }

    fn int_result(src: &str) -> i64 {
        let value = run_image(src).expect("interpret error");
        assert!(value.is_int64(), "expected int64, got {value:?}");
        unsafe { value.as_i64() }
    }

    fn str_result(src: &str) -> String {
        let value = run_image(src).expect("interpret error");
        assert!(value.is_string(), "expected string, got {value:?}");
        let s: &Str = unsafe { value.as_ref() };
        String::from_utf8_lossy(unsafe { s.bytes() }).into_owned()
    }

    /// Wrap a single straight-line block body (without `ret`) into a
    /// complete image whose `main` runs it and returns the final value.
    fn one_block(body: &str) -> String {
        format!(
            "f_main = {{ num_params: 0, num_locals: 0, entry: @b0 }};\n\
             b0 = {{ name: \"entry\", instrs: [ {body}, {{ op: \"ret\" }} ] }};\n\
             exports = {{ main: @f_main }};"
        )
    }

    #[test]
    fn returns_constant() {
        let src = one_block("{ op: \"push\", val: 777 }");
        assert_eq!(int_result(&src), 777);
    }

    #[test]
    fn arithmetic_image() {
        // (2 + 3) * 2
        let src = one_block(
            "{ op: \"push\", val: 2 }, { op: \"push\", val: 3 }, \
             { op: \"add_i64\" }, { op: \"push\", val: 2 }, \
             { op: \"mul_i64\" }",
        );
        assert_eq!(int_result(&src), 10);
    }

    #[test]
    fn wrapping_add() {
        let src = one_block(
            "{ op: \"push\", val: 9223372036854775807 }, \
             { op: \"push\", val: 1 }, { op: \"add_i64\" }",
        );
        assert_eq!(int_result(&src), i64::MIN);
    }

    #[test]
    fn comparisons() {
        let src = one_block(
            "{ op: \"push\", val: 2 }, { op: \"push\", val: 3 }, \
             { op: \"lt_i64\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);

        let src = one_block(
            "{ op: \"push\", val: 2 }, { op: \"push\", val: 3 }, \
             { op: \"ge_i64\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::FALSE);
    }

    #[test]
    fn locals_round_trip() {
        let src = "f_main = { num_params: 0, num_locals: 1, entry: @b0 };\n\
                   b0 = { name: \"entry\", instrs: [\n\
                       { op: \"push\", val: 41 },\n\
                       { op: \"set_local\", idx: 0 },\n\
                       { op: \"get_local\", idx: 0 },\n\
                       { op: \"push\", val: 1 },\n\
                       { op: \"add_i64\" },\n\
                       { op: \"ret\" }\n\
                   ] };\n\
                   exports = { main: @f_main };";
        assert_eq!(int_result(src), 42);
    }

    #[test]
    fn dup_copies_below_top() {
        let src = one_block(
            "{ op: \"push\", val: 5 }, { op: \"push\", val: 6 }, \
             { op: \"dup\", idx: 1 }",
        );
        assert_eq!(int_result(&src), 5);
    }

    #[test]
    fn dup_out_of_range() {
        let src = one_block("{ op: \"push\", val: 5 }, { op: \"dup\", idx: 2 }");
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "stack underflow, invalid index for dup");
    }

    #[test]
    fn pop_empty_stack() {
        let src = one_block("{ op: \"push\", val: 0 }, { op: \"pop\" }, { op: \"pop\" }");
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "pop failed, stack empty");
    }

    #[test]
    fn pop_type_mismatch() {
        let src = one_block(
            "{ op: \"push\", val: \"x\" }, { op: \"push\", val: 1 }, \
             { op: \"add_i64\" }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "op expects int64 value");
    }

    #[test]
    fn underflow_message() {
        let src = one_block("{ op: \"add_i64\" }");
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "op cannot pop value, stack empty");
    }

    // ── Strings ────────────────────────────────────────────────────

    #[test]
    fn str_len_is_byte_length() {
        let src = one_block(
            "{ op: \"push\", val: \"hello\" }, { op: \"str_len\" }",
        );
        assert_eq!(int_result(&src), 5);
    }

    #[test]
    fn str_cat_preserves_push_order() {
        let src = one_block(
            "{ op: \"push\", val: \"foo\" }, { op: \"push\", val: \"bar\" }, \
             { op: \"str_cat\" }",
        );
        assert_eq!(str_result(&src), "foobar");
    }

    #[test]
    fn eq_str_compares_content() {
        let src = one_block(
            "{ op: \"push\", val: \"ab\" }, { op: \"push\", val: \"cd\" }, \
             { op: \"eq_str\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::FALSE);
    }

    #[test]
    fn get_char_code_reads_byte() {
        let src = one_block(
            "{ op: \"push\", val: \"hi\" }, { op: \"push\", val: 0 }, \
             { op: \"get_char_code\" }",
        );
        assert_eq!(int_result(&src), 'h' as i64);
    }

    #[test]
    fn get_char_out_of_bounds() {
        let src = one_block(
            "{ op: \"push\", val: \"hi\" }, { op: \"push\", val: 2 }, \
             { op: \"get_char\" }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "get_char, index out of bounds");
    }

    #[test]
    fn char_cache_returns_identical_strings() {
        // Two get_char ops over the same byte must yield the same
        // string object; eq_obj compares identity.
        let src = one_block(
            "{ op: \"push\", val: \"hi\" }, { op: \"push\", val: 0 }, \
             { op: \"get_char\" }, \
             { op: \"push\", val: \"hat\" }, { op: \"push\", val: 0 }, \
             { op: \"get_char\" }, \
             { op: \"eq_obj\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);
    }

    // ── Objects ────────────────────────────────────────────────────

    #[test]
    fn object_field_round_trip() {
        let src = one_block(
            "{ op: \"push\", val: 4 }, { op: \"new_object\" }, \
             { op: \"dup\", idx: 0 }, \
             { op: \"push\", val: \"x\" }, { op: \"push\", val: 42 }, \
             { op: \"set_field\" }, \
             { op: \"push\", val: \"x\" }, { op: \"get_field\" }",
        );
        assert_eq!(int_result(&src), 42);
    }

    #[test]
    fn has_field_answers_false() {
        let src = one_block(
            "{ op: \"push\", val: 1 }, { op: \"new_object\" }, \
             { op: \"push\", val: \"nope\" }, { op: \"has_field\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::FALSE);
    }

    #[test]
    fn get_field_missing_fails() {
        let src = one_block(
            "{ op: \"push\", val: 1 }, { op: \"new_object\" }, \
             { op: \"push\", val: \"nope\" }, { op: \"get_field\" }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "get_field failed, missing field \"nope\"");
    }

    #[test]
    fn set_field_rejects_invalid_identifier() {
        let src = one_block(
            "{ op: \"push\", val: 1 }, { op: \"new_object\" }, \
             { op: \"push\", val: \"1bad\" }, { op: \"push\", val: 0 }, \
             { op: \"set_field\" }, { op: \"push\", val: 0 }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "invalid identifier in set_field \"1bad\"");
    }

    #[test]
    fn eq_obj_is_identity() {
        let src = one_block(
            "{ op: \"push\", val: 0 }, { op: \"new_object\" }, \
             { op: \"push\", val: 0 }, { op: \"new_object\" }, \
             { op: \"eq_obj\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::FALSE);

        let src = one_block(
            "{ op: \"push\", val: 0 }, { op: \"new_object\" }, \
             { op: \"dup\", idx: 0 }, { op: \"eq_obj\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);
    }

    // ── Arrays ─────────────────────────────────────────────────────

    #[test]
    fn new_array_len_and_undef_fill() {
        let src = one_block(
            "{ op: \"push\", val: 3 }, { op: \"new_array\" }, \
             { op: \"array_len\" }",
        );
        assert_eq!(int_result(&src), 3);

        let src = one_block(
            "{ op: \"push\", val: 3 }, { op: \"new_array\" }, \
             { op: \"push\", val: 0 }, { op: \"get_elem\" }",
        );
        assert!(run_image(&src).unwrap().is_undef());
    }

    #[test]
    fn array_push_and_get() {
        let src = one_block(
            "{ op: \"push\", val: 0 }, { op: \"new_array\" }, \
             { op: \"dup\", idx: 0 }, { op: \"push\", val: 7 }, \
             { op: \"array_push\" }, \
             { op: \"push\", val: 0 }, { op: \"get_elem\" }",
        );
        assert_eq!(int_result(&src), 7);
    }

    #[test]
    fn set_elem_out_of_bounds() {
        let src = one_block(
            "{ op: \"push\", val: 1 }, { op: \"new_array\" }, \
             { op: \"push\", val: 5 }, { op: \"push\", val: 0 }, \
             { op: \"set_elem\" }, { op: \"push\", val: 0 }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "set_elem, index out of bounds");
    }

    // ── Tags and booleans ──────────────────────────────────────────

    #[test]
    fn has_tag_matches() {
        let src = one_block(
            "{ op: \"push\", val: 5 }, { op: \"has_tag\", tag: \"int64\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);

        let src = one_block(
            "{ op: \"push\", val: 5 }, { op: \"has_tag\", tag: \"string\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::FALSE);

        let src = one_block(
            "{ op: \"push\", val: $undef }, { op: \"has_tag\", tag: \"undef\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);
    }

    #[test]
    fn eq_bool() {
        let src = one_block(
            "{ op: \"push\", val: $true }, { op: \"push\", val: $false }, \
             { op: \"eq_bool\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::FALSE);
    }

    // ── Control flow ───────────────────────────────────────────────

    fn if_true_image(cond: &str) -> String {
        format!(
            "f_main = {{ num_params: 0, num_locals: 0, entry: @b0 }};\n\
             b0 = {{ name: \"entry\", instrs: [\n\
                 {{ op: \"push\", val: {cond} }},\n\
                 {{ op: \"if_true\", then: @b_then, else: @b_else }}\n\
             ] }};\n\
             b_then = {{ name: \"then\", instrs: [ {{ op: \"push\", val: 1 }}, {{ op: \"ret\" }} ] }};\n\
             b_else = {{ name: \"else\", instrs: [ {{ op: \"push\", val: 2 }}, {{ op: \"ret\" }} ] }};\n\
             exports = {{ main: @f_main }};"
        )
    }

    #[test]
    fn if_true_takes_then_only_for_true() {
        assert_eq!(int_result(&if_true_image("$true")), 1);
        assert_eq!(int_result(&if_true_image("$false")), 2);
        assert_eq!(int_result(&if_true_image("$undef")), 2);
        assert_eq!(int_result(&if_true_image("1")), 2);
        assert_eq!(int_result(&if_true_image("\"true\"")), 2);
    }

    #[test]
    fn loop_counts_down_to_zero() {
        let src = "f_main = { num_params: 0, num_locals: 1, entry: @b_init };\n\
                   b_init = { name: \"init\", instrs: [\n\
                       { op: \"push\", val: 8 },\n\
                       { op: \"set_local\", idx: 0 },\n\
                       { op: \"jump\", to: @b_test }\n\
                   ] };\n\
                   b_test = { name: \"test\", instrs: [\n\
                       { op: \"get_local\", idx: 0 },\n\
                       { op: \"push\", val: 0 },\n\
                       { op: \"gt_i64\" },\n\
                       { op: \"if_true\", then: @b_body, else: @b_done }\n\
                   ] };\n\
                   b_body = { name: \"body\", instrs: [\n\
                       { op: \"get_local\", idx: 0 },\n\
                       { op: \"push\", val: 1 },\n\
                       { op: \"sub_i64\" },\n\
                       { op: \"set_local\", idx: 0 },\n\
                       { op: \"jump\", to: @b_test }\n\
                   ] };\n\
                   b_done = { name: \"done\", instrs: [\n\
                       { op: \"get_local\", idx: 0 },\n\
                       { op: \"ret\" }\n\
                   ] };\n\
                   exports = { main: @f_main };";
        assert_eq!(int_result(src), 0);
    }

    #[test]
    fn branch_must_be_last_in_block() {
        let src = "f_main = { num_params: 0, num_locals: 0, entry: @b0 };\n\
                   b0 = { name: \"entry\", instrs: [\n\
                       { op: \"jump\", to: @b1 },\n\
                       { op: \"push\", val: 0 },\n\
                       { op: \"ret\" }\n\
                   ] };\n\
                   b1 = { name: \"next\", instrs: [ { op: \"push\", val: 0 }, { op: \"ret\" } ] };\n\
                   exports = { main: @f_main };";
        let err = run_image(src).unwrap_err();
        assert!(
            err.msg().starts_with(
                "only the last instruction in a block can be a branch"
            ),
            "unexpected message: {}",
            err.msg()
        );
    }

    #[test]
    fn empty_target_block_fails() {
        let src = "f_main = { num_params: 0, num_locals: 0, entry: @b0 };\n\
                   b0 = { name: \"entry\", instrs: [ { op: \"jump\", to: @b_empty } ] };\n\
                   b_empty = { name: \"empty\", instrs: [] };\n\
                   exports = { main: @f_main };";
        let err = run_image(src).unwrap_err();
        assert_eq!(err.msg(), "target basic block is empty");
    }

    // ── Calls ──────────────────────────────────────────────────────

    const FACT_IMAGE: &str = "\
f_main = { num_params: 0, num_locals: 0, entry: @m0 };\n\
m0 = { name: \"entry\", instrs: [\n\
    { op: \"push\", val: 7 },\n\
    { op: \"push\", val: @f_fact },\n\
    { op: \"call\", ret_to: @m1, num_args: 1 }\n\
] };\n\
m1 = { name: \"after\", instrs: [ { op: \"ret\" } ] };\n\
f_fact = { num_params: 1, num_locals: 1, entry: @f0 };\n\
f0 = { name: \"entry\", instrs: [\n\
    { op: \"get_local\", idx: 0 },\n\
    { op: \"push\", val: 1 },\n\
    { op: \"le_i64\" },\n\
    { op: \"if_true\", then: @f_base, else: @f_rec }\n\
] };\n\
f_base = { name: \"base\", instrs: [ { op: \"push\", val: 1 }, { op: \"ret\" } ] };\n\
f_rec = { name: \"rec\", instrs: [\n\
    { op: \"get_local\", idx: 0 },\n\
    { op: \"get_local\", idx: 0 },\n\
    { op: \"push\", val: 1 },\n\
    { op: \"sub_i64\" },\n\
    { op: \"push\", val: @f_fact },\n\
    { op: \"call\", ret_to: @f_after, num_args: 1 }\n\
] };\n\
f_after = { name: \"after\", instrs: [ { op: \"mul_i64\" }, { op: \"ret\" } ] };\n\
exports = { main: @f_main };";

    #[test]
    fn recursive_factorial() {
        assert_eq!(int_result(FACT_IMAGE), 5040);
    }

    #[test]
    fn argument_order_reaches_locals() {
        // f(a, b) = b: arguments land in locals left-to-right.
        let src = "f_main = { num_params: 0, num_locals: 0, entry: @m0 };\n\
                   m0 = { name: \"entry\", instrs: [\n\
                       { op: \"push\", val: 10 },\n\
                       { op: \"push\", val: 20 },\n\
                       { op: \"push\", val: @f_snd },\n\
                       { op: \"call\", ret_to: @m1, num_args: 2 }\n\
                   ] };\n\
                   m1 = { name: \"after\", instrs: [ { op: \"ret\" } ] };\n\
                   f_snd = { num_params: 2, num_locals: 2, entry: @s0 };\n\
                   s0 = { name: \"entry\", instrs: [\n\
                       { op: \"get_local\", idx: 1 },\n\
                       { op: \"ret\" }\n\
                   ] };\n\
                   exports = { main: @f_main };";
        assert_eq!(int_result(src), 20);
    }

    #[test]
    fn argument_count_mismatch_with_src_pos() {
        let src = "f_main = { num_params: 0, num_locals: 0, entry: @m0 };\n\
                   m0 = { name: \"entry\", instrs: [\n\
                       { op: \"push\", val: @f_one },\n\
                       { op: \"call\", ret_to: @m1, num_args: 0,\n\
                         src_pos: { line_no: 5, col_no: 3, src_name: \"t.zim\" } }\n\
                   ] };\n\
                   m1 = { name: \"after\", instrs: [ { op: \"ret\" } ] };\n\
                   f_one = { num_params: 1, num_locals: 1, entry: @o0 };\n\
                   o0 = { name: \"entry\", instrs: [ { op: \"push\", val: 0 }, { op: \"ret\" } ] };\n\
                   exports = { main: @f_main };";
        let err = run_image(src).unwrap_err();
        assert_eq!(
            err.msg(),
            "t.zim@5:3 - incorrect argument count in call, \
             received 0, expected 1"
        );
    }

    #[test]
    fn call_stack_underflow() {
        let src = "f_main = { num_params: 0, num_locals: 0, entry: @m0 };\n\
                   m0 = { name: \"entry\", instrs: [\n\
                       { op: \"push\", val: 1 },\n\
                       { op: \"push\", val: @f_two },\n\
                       { op: \"call\", ret_to: @m1, num_args: 2 }\n\
                   ] };\n\
                   m1 = { name: \"after\", instrs: [ { op: \"ret\" } ] };\n\
                   f_two = { num_params: 2, num_locals: 2, entry: @t0 };\n\
                   t0 = { name: \"entry\", instrs: [ { op: \"push\", val: 0 }, { op: \"ret\" } ] };\n\
                   exports = { main: @f_main };";
        let err = run_image(src).unwrap_err();
        assert_eq!(err.msg(), "stack underflow at call");
    }

    #[test]
    fn invalid_callee() {
        let src = one_block(
            "{ op: \"push\", val: 5 }, \
             { op: \"call\", ret_to: @b0, num_args: 0 }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "invalid callee at call site");
    }

    // ── Import ─────────────────────────────────────────────────────

    #[test]
    fn import_io_package() {
        let src = one_block(
            "{ op: \"push\", val: \"io\" }, { op: \"import\" }, \
             { op: \"push\", val: \"print_str\" }, { op: \"has_field\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);
    }

    #[test]
    fn import_is_cached() {
        let src = one_block(
            "{ op: \"push\", val: \"io\" }, { op: \"import\" }, \
             { op: \"push\", val: \"io\" }, { op: \"import\" }, \
             { op: \"eq_obj\" }",
        );
        assert_eq!(run_image(&src).unwrap(), Value::TRUE);
    }

    #[test]
    fn import_unknown_package() {
        let src = one_block(
            "{ op: \"push\", val: \"no_such_pkg\" }, { op: \"import\" }",
        );
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "failed to import package \"no_such_pkg\"");
    }

    // ── Decoder behavior through the evaluator ─────────────────────

    #[test]
    fn unknown_op_in_decode() {
        let src = one_block("{ op: \"swap\" }");
        let err = run_image(&src).unwrap_err();
        assert_eq!(err.msg(), "unknown op in decode \"swap\"");
    }

    // ── End-to-end images ──────────────────────────────────────────

    fn run_image_file(name: &str) -> Value {
        let mut vm = VM::new(test_settings());
        let path =
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../images").join(name);
        let pkg = loader::parse_file(&mut vm, &path)
            .unwrap_or_else(|e| panic!("load {name} failed: {e}"));
        call_export_fn(&mut vm, pkg, "main", &[])
            .unwrap_or_else(|e| panic!("run {name} failed: {e}"))
    }

    #[test]
    fn example_images_return_expected_values() {
        for (name, expected) in [
            ("ex_ret_cst.zim", 777),
            ("ex_loop_cnt.zim", 0),
            ("ex_image.zim", 10),
            ("ex_rec_fact.zim", 5040),
            ("ex_fibonacci.zim", 377),
        ] {
            let value = run_image_file(name);
            assert!(value.is_int64(), "{name} returned {value:?}");
            assert_eq!(unsafe { value.as_i64() }, expected, "{name}");
        }
    }

    #[test]
    fn stack_effects_balance_across_calls() {
        // Re-running the same function on one VM exercises the warmed
        // opcode and inline caches.
        let (mut vm, first) = run_image_with_vm(FACT_IMAGE);
        let first = first.expect("interpret error");
        let pkg = loader::parse_str(&mut vm, FACT_IMAGE, "again")
            .expect("parse error");
        let second =
            call_export_fn(&mut vm, pkg, "main", &[]).expect("interpret");
        assert_eq!(first, second);
    }
}
