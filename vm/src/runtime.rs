use std::io::{self, BufRead, Write};

use object::{Str, Tag, Value};

use crate::alloc;
use crate::loader;
use crate::{RunError, VM};

// ── Host functions ─────────────────────────────────────────────────

/// Host call target by arity. Arities above three are unrepresentable.
pub enum HostCall {
    F0(fn(&mut VM) -> Result<Value, RunError>),
    F1(fn(&mut VM, Value) -> Result<Value, RunError>),
    F2(fn(&mut VM, Value, Value) -> Result<Value, RunError>),
    F3(fn(&mut VM, Value, Value, Value) -> Result<Value, RunError>),
}

/// A function the host exposes to program code.
///
/// Descriptors are `'static`; a HOSTFN value carries the descriptor's
/// address, which is stable for the life of the process.
pub struct HostFn {
    pub name: &'static str,
    pub call: HostCall,
}

impl HostFn {
    pub fn num_params(&self) -> usize {
        match self.call {
            HostCall::F0(_) => 0,
            HostCall::F1(_) => 1,
            HostCall::F2(_) => 2,
            HostCall::F3(_) => 3,
        }
    }

    pub fn call0(&self, vm: &mut VM) -> Result<Value, RunError> {
        match self.call {
            HostCall::F0(f) => f(vm),
            _ => unreachable!("{} is not a 0-parameter host function", self.name),
        }
    }

    pub fn call1(&self, vm: &mut VM, a0: Value) -> Result<Value, RunError> {
        match self.call {
            HostCall::F1(f) => f(vm, a0),
            _ => unreachable!("{} is not a 1-parameter host function", self.name),
        }
    }

    pub fn call2(
        &self,
        vm: &mut VM,
        a0: Value,
        a1: Value,
    ) -> Result<Value, RunError> {
        match self.call {
            HostCall::F2(f) => f(vm, a0, a1),
            _ => unreachable!("{} is not a 2-parameter host function", self.name),
        }
    }

    pub fn call3(
        &self,
        vm: &mut VM,
        a0: Value,
        a1: Value,
        a2: Value,
    ) -> Result<Value, RunError> {
        match self.call {
            HostCall::F3(f) => f(vm, a0, a1, a2),
            _ => unreachable!("{} is not a 3-parameter host function", self.name),
        }
    }
}

fn host_fn_value(host_fn: &'static HostFn) -> Value {
    Value::from_ptr(host_fn as *const HostFn, Tag::HostFn)
}

// ── Builtin io package ─────────────────────────────────────────────

static PRINT_STR: HostFn = HostFn {
    name: "print_str",
    call: HostCall::F1(print_str),
};

static PRINT_INT64: HostFn = HostFn {
    name: "print_int64",
    call: HostCall::F1(print_int64),
};

static READ_LINE: HostFn = HostFn {
    name: "read_line",
    call: HostCall::F0(read_line),
};

fn print_str(_vm: &mut VM, val: Value) -> Result<Value, RunError> {
    if !val.is_string() {
        return Err(RunError::new("print_str expects string value"));
    }
    let s: &Str = unsafe { val.as_ref() };
    let mut out = io::stdout();
    out.write_all(unsafe { s.bytes() })
        .and_then(|_| out.flush())
        .map_err(|e| RunError::new(format!("print_str failed: {e}")))?;
    Ok(Value::UNDEF)
}

fn print_int64(_vm: &mut VM, val: Value) -> Result<Value, RunError> {
    if !val.is_int64() {
        return Err(RunError::new("print_int64 expects int64 value"));
    }
    let n = unsafe { val.as_i64() };
    let mut out = io::stdout();
    out.write_all(n.to_string().as_bytes())
        .and_then(|_| out.flush())
        .map_err(|e| RunError::new(format!("print_int64 failed: {e}")))?;
    Ok(Value::UNDEF)
}

fn read_line(vm: &mut VM) -> Result<Value, RunError> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| RunError::new(format!("read_line failed: {e}")))?;
    Ok(alloc::alloc_str(&mut vm.heap, line.as_bytes()))
}

fn build_io_pkg(vm: &mut VM) -> Value {
    let pkg = alloc::alloc_obj(&mut vm.heap, 3);
    for host_fn in [&PRINT_STR, &PRINT_INT64, &READ_LINE] {
        let name = alloc::intern(vm, host_fn.name);
        alloc::obj_set_field(&mut vm.heap, pkg, name, host_fn_value(host_fn));
    }
    pkg
}

// ── Package import ─────────────────────────────────────────────────

/// Load and return a package by logical name, caching the result for
/// the life of the process. Builtin packages win over the filesystem.
pub fn import(vm: &mut VM, name: &str) -> Result<Value, RunError> {
    if let Some(&pkg) = vm.packages.get(name) {
        return Ok(pkg);
    }

    let pkg = match name {
        "io" => build_io_pkg(vm),
        _ => load_pkg_file(vm, name)?,
    };

    vm.packages.insert(name.to_string(), pkg);
    Ok(pkg)
}

fn load_pkg_file(vm: &mut VM, name: &str) -> Result<Value, RunError> {
    let dirs = vm.pkg_dirs.clone();
    for dir in dirs {
        let path = dir.join(format!("{name}.zim"));
        if path.is_file() {
            return loader::parse_file(vm, &path).map_err(|e| {
                RunError::new(format!(
                    "import of package \"{name}\" failed: {e}"
                ))
            });
        }
    }
    Err(RunError::new(format!("failed to import package \"{name}\"")))
}

// ── Identifier validation ──────────────────────────────────────────

/// Field identifiers: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_ident(name: &[u8]) -> bool {
    let Some((&first, rest)) = name.split_first() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == b'_') {
        return false;
    }
    rest.iter()
        .all(|&byte| byte.is_ascii_alphanumeric() || byte == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::HeapSettings;
    use object::Obj;

    fn test_vm() -> VM {
        VM::new(HeapSettings {
            heap_size: 1024 * 1024,
        })
    }

    #[test]
    fn ident_validation() {
        assert!(is_valid_ident(b"x"));
        assert!(is_valid_ident(b"_private"));
        assert!(is_valid_ident(b"num_params"));
        assert!(is_valid_ident(b"Field9"));

        assert!(!is_valid_ident(b""));
        assert!(!is_valid_ident(b"9lives"));
        assert!(!is_valid_ident(b"has space"));
        assert!(!is_valid_ident(b"dash-ed"));
    }

    #[test]
    fn io_package_exposes_host_fns() {
        let mut vm = test_vm();
        let pkg = import(&mut vm, "io").expect("import io");
        let obj: &Obj = unsafe { pkg.as_ref() };
        for name in ["print_str", "print_int64", "read_line"] {
            let val = unsafe { obj.field_by_name(name.as_bytes()) }
                .unwrap_or_else(|| panic!("io missing {name}"));
            assert!(val.is_host_fn());
        }
    }

    #[test]
    fn import_caches_by_name() {
        let mut vm = test_vm();
        let a = import(&mut vm, "io").unwrap();
        let b = import(&mut vm, "io").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn import_failure_message() {
        let mut vm = test_vm();
        let err = import(&mut vm, "does_not_exist").unwrap_err();
        assert_eq!(
            err.msg(),
            "failed to import package \"does_not_exist\""
        );
    }

    #[test]
    fn host_fn_arity() {
        assert_eq!(PRINT_STR.num_params(), 1);
        assert_eq!(READ_LINE.num_params(), 0);
    }
}
