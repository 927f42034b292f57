use std::alloc::Layout;
use std::ptr;

use heap::Heap;
use object::{
    init_array, init_obj, init_str, str_allocation_size, Array, FieldPair,
    Obj, Str, Tag, Value,
};

use crate::VM;

/// Allocate an empty object with room for `capacity` fields.
pub fn alloc_obj(heap: &mut Heap, capacity: u32) -> Value {
    let entries = if capacity == 0 {
        ptr::null_mut()
    } else {
        alloc_entries(heap, capacity)
    };
    let obj_ptr = heap.allocate(Layout::new::<Obj>()).as_ptr() as *mut Obj;
    unsafe { init_obj(obj_ptr, entries, capacity) };
    Value::from_ptr(obj_ptr, Tag::Object)
}

fn alloc_entries(heap: &mut Heap, cap: u32) -> *mut FieldPair {
    let layout =
        Layout::array::<FieldPair>(cap as usize).expect("field table layout");
    heap.allocate(layout).as_ptr() as *mut FieldPair
}

/// Allocate an array of `len` UNDEF elements with room for `cap`.
pub fn alloc_array(heap: &mut Heap, len: u32, cap: u32) -> Value {
    let cap = cap.max(len);
    let elems = if cap == 0 {
        ptr::null_mut()
    } else {
        alloc_elems(heap, cap)
    };
    let arr_ptr = heap.allocate(Layout::new::<Array>()).as_ptr() as *mut Array;
    unsafe { init_array(arr_ptr, elems, len, cap) };
    Value::from_ptr(arr_ptr, Tag::Array)
}

fn alloc_elems(heap: &mut Heap, cap: u32) -> *mut Value {
    let layout =
        Layout::array::<Value>(cap as usize).expect("element buffer layout");
    heap.allocate(layout).as_ptr() as *mut Value
}

/// Allocate a string with the given content.
pub fn alloc_str(heap: &mut Heap, bytes: &[u8]) -> Value {
    let layout = Layout::from_size_align(str_allocation_size(bytes.len()), 8)
        .expect("string layout");
    let str_ptr = heap.allocate(layout).as_ptr() as *mut Str;
    unsafe { init_str(str_ptr, bytes) };
    Value::from_ptr(str_ptr, Tag::String)
}

/// Intern a string: one heap `Str` per distinct content.
pub fn intern(vm: &mut VM, s: &str) -> Value {
    if let Some(&val) = vm.intern_table.get(s) {
        return val;
    }
    let val = alloc_str(&mut vm.heap, s.as_bytes());
    vm.intern_table.insert(s.to_string(), val);
    val
}

/// Set (or overwrite) a field. `name` must be a `Str` value. The
/// object's address is unchanged even when the field table grows; only
/// the side buffer is reallocated.
pub fn obj_set_field(heap: &mut Heap, obj_val: Value, name: Value, value: Value) {
    debug_assert!(obj_val.is_object());
    debug_assert!(name.is_string());
    let obj = unsafe { &mut *(obj_val.word() as *mut Obj) };
    let name_str: &Str = unsafe { name.as_ref() };
    let name_bytes = unsafe { name_str.bytes() };

    if let Some(index) = unsafe { obj.field_index(name_bytes) } {
        unsafe { obj.set_value(index, value) };
        return;
    }

    if obj.len() == obj.capacity() {
        let new_cap = (obj.capacity() * 2).max(4);
        let new_entries = alloc_entries(heap, new_cap);
        unsafe {
            let old = obj.entries();
            if !old.is_empty() {
                ptr::copy_nonoverlapping(
                    old.as_ptr(),
                    new_entries,
                    old.len(),
                );
            }
            obj.replace_entries(new_entries, new_cap);
        }
    }
    unsafe { obj.push_field(name, value) };
}

/// Append to an array, growing the element buffer as needed.
pub fn array_push(heap: &mut Heap, arr_val: Value, value: Value) {
    debug_assert!(arr_val.is_array());
    let arr = unsafe { &mut *(arr_val.word() as *mut Array) };

    if arr.len() == arr.capacity() {
        let new_cap = (arr.capacity() * 2).max(4);
        let new_elems = alloc_elems(heap, new_cap);
        unsafe {
            let old = arr.elements();
            if !old.is_empty() {
                ptr::copy_nonoverlapping(old.as_ptr(), new_elems, old.len());
            }
            arr.replace_elems(new_elems, new_cap);
        }
    }
    unsafe { arr.push(value) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap::HeapSettings;

    fn test_vm() -> VM {
        VM::new(HeapSettings {
            heap_size: 1024 * 1024,
        })
    }

    #[test]
    fn object_grows_past_capacity_without_moving() {
        let mut vm = test_vm();
        let obj = alloc_obj(&mut vm.heap, 1);
        let addr = obj.word();

        for (i, name) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            let name_val = intern(&mut vm, name);
            obj_set_field(
                &mut vm.heap,
                obj,
                name_val,
                Value::from_i64(i as i64),
            );
        }

        assert_eq!(obj.word(), addr);
        let o: &Obj = unsafe { obj.as_ref() };
        assert_eq!(o.len(), 6);
        assert_eq!(unsafe { o.field_by_name(b"f") }, Some(Value::from_i64(5)));
        // Slot indices are append-ordered and stable.
        assert_eq!(unsafe { o.field_index(b"a") }, Some(0));
        assert_eq!(unsafe { o.field_index(b"f") }, Some(5));
    }

    #[test]
    fn set_field_overwrites_in_place() {
        let mut vm = test_vm();
        let obj = alloc_obj(&mut vm.heap, 2);
        let name = intern(&mut vm, "x");
        obj_set_field(&mut vm.heap, obj, name, Value::from_i64(1));
        obj_set_field(&mut vm.heap, obj, name, Value::from_i64(2));

        let o: &Obj = unsafe { obj.as_ref() };
        assert_eq!(o.len(), 1);
        assert_eq!(unsafe { o.field_by_name(b"x") }, Some(Value::from_i64(2)));
    }

    #[test]
    fn array_push_grows_from_zero() {
        let mut vm = test_vm();
        let arr = alloc_array(&mut vm.heap, 0, 0);
        let addr = arr.word();
        for i in 0..10 {
            array_push(&mut vm.heap, arr, Value::from_i64(i));
        }
        assert_eq!(arr.word(), addr);
        let a: &Array = unsafe { arr.as_ref() };
        assert_eq!(a.len(), 10);
        assert_eq!(unsafe { a.element(9) }, Value::from_i64(9));
    }

    #[test]
    fn intern_returns_identical_values() {
        let mut vm = test_vm();
        let a = intern(&mut vm, "name");
        let b = intern(&mut vm, "name");
        let c = intern(&mut vm, "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
