use crate::header::{Header, ObjectType};
use crate::Value;

// ── Obj ────────────────────────────────────────────────────────────

/// One named field of an [`Obj`]: an interned-or-program [`Str`] name
/// and its value.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FieldPair {
    pub name: Value,
    pub value: Value,
}

/// An object with named fields.
///
/// ```text
/// [Header 8B] [cap: u32] [len: u32] [entries: *mut FieldPair]
/// ```
///
/// The field table lives in a side buffer so the object's own address —
/// the identity every process-lived cache is keyed by — survives field
/// growth. Fields only append; a field's position in the table is its
/// slot index, which is stable for the object's lifetime.
#[repr(C)]
pub struct Obj {
    pub header: Header,
    cap: u32,
    len: u32,
    entries: *mut FieldPair,
}

const _: () = assert!(size_of::<Obj>() == 24);

impl Obj {
    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.cap
    }

    /// Access the field table.
    ///
    /// # Safety
    ///
    /// The side buffer must contain `len()` valid [`FieldPair`]s.
    #[inline(always)]
    pub unsafe fn entries(&self) -> &[FieldPair] {
        if self.len == 0 {
            return &[];
        }
        core::slice::from_raw_parts(self.entries, self.len as usize)
    }

    /// # Safety
    ///
    /// `index < len()` and the side buffer must be valid.
    #[inline(always)]
    pub unsafe fn entry(&self, index: u32) -> &FieldPair {
        debug_assert!(index < self.len);
        &*self.entries.add(index as usize)
    }

    /// Resolve a field name to its slot index by scanning the table.
    /// Names compare byte-wise; program strings need not be UTF-8.
    ///
    /// # Safety
    ///
    /// The side buffer and every field-name string must be valid.
    pub unsafe fn field_index(&self, name: &[u8]) -> Option<u32> {
        for (i, pair) in self.entries().iter().enumerate() {
            let field: &Str = pair.name.as_ref();
            if field.bytes() == name {
                return Some(i as u32);
            }
        }
        None
    }

    /// Slot-hinted field read. If `slot` already names this field the
    /// value is returned without a scan; otherwise the field is
    /// resolved by name and the new slot index is written back into
    /// `slot`. Returns `None` when the field does not exist.
    ///
    /// # Safety
    ///
    /// The side buffer and every field-name string must be valid.
    pub unsafe fn get_field(
        &self,
        name: &[u8],
        slot: &mut u32,
    ) -> Option<Value> {
        let hint = *slot;
        if hint < self.len {
            let pair = self.entry(hint);
            let field: &Str = pair.name.as_ref();
            if field.bytes() == name {
                return Some(pair.value);
            }
        }
        let index = self.field_index(name)?;
        *slot = index;
        Some(self.entry(index).value)
    }

    /// # Safety
    ///
    /// Same requirements as [`field_index`](Self::field_index).
    #[inline(always)]
    pub unsafe fn has_field(&self, name: &[u8]) -> bool {
        self.field_index(name).is_some()
    }

    /// Unhinted field read.
    ///
    /// # Safety
    ///
    /// Same requirements as [`field_index`](Self::field_index).
    #[inline(always)]
    pub unsafe fn field_by_name(&self, name: &[u8]) -> Option<Value> {
        self.field_index(name).map(|i| self.entry(i).value)
    }

    /// Overwrite the value of an existing field in place.
    ///
    /// # Safety
    ///
    /// `index < len()` and the side buffer must be valid.
    #[inline(always)]
    pub unsafe fn set_value(&mut self, index: u32, value: Value) {
        debug_assert!(index < self.len);
        (*self.entries.add(index as usize)).value = value;
    }

    /// Append a field. The caller must have ensured spare capacity.
    ///
    /// # Safety
    ///
    /// `len() < capacity()` and the side buffer must be valid.
    #[inline(always)]
    pub unsafe fn push_field(&mut self, name: Value, value: Value) {
        debug_assert!(self.len < self.cap);
        self.entries
            .add(self.len as usize)
            .write(FieldPair { name, value });
        self.len += 1;
    }

    /// Swap in a larger side buffer. Existing entries must already have
    /// been copied into it by the caller.
    ///
    /// # Safety
    ///
    /// `entries` must point to at least `cap` writable [`FieldPair`]
    /// slots, the first `len()` of which are initialized.
    #[inline(always)]
    pub unsafe fn replace_entries(&mut self, entries: *mut FieldPair, cap: u32) {
        debug_assert!(cap >= self.len);
        self.entries = entries;
        self.cap = cap;
    }
}

/// Initialize an [`Obj`] at a raw allocation.
///
/// # Safety
///
/// `ptr` must point to `size_of::<Obj>()` bytes of writable memory, and
/// `entries` must point to `cap` writable [`FieldPair`] slots (or be
/// null when `cap == 0`).
pub unsafe fn init_obj(ptr: *mut Obj, entries: *mut FieldPair, cap: u32) {
    ptr.write(Obj {
        header: Header::new(ObjectType::Object),
        cap,
        len: 0,
        entries,
    });
}

// ── Array ──────────────────────────────────────────────────────────

/// A growable array of tagged values.
///
/// ```text
/// [Header 8B] [cap: u32] [len: u32] [elems: *mut Value]
/// ```
///
/// Same side-buffer scheme as [`Obj`]: `push` may reallocate the
/// element buffer but never the array object itself.
#[repr(C)]
pub struct Array {
    pub header: Header,
    cap: u32,
    len: u32,
    elems: *mut Value,
}

const _: () = assert!(size_of::<Array>() == 24);

impl Array {
    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.cap
    }

    /// # Safety
    ///
    /// The side buffer must contain `len()` valid elements.
    #[inline(always)]
    pub unsafe fn elements(&self) -> &[Value] {
        if self.len == 0 {
            return &[];
        }
        core::slice::from_raw_parts(self.elems, self.len as usize)
    }

    /// # Safety
    ///
    /// `index < len()` and the side buffer must be valid.
    #[inline(always)]
    pub unsafe fn element(&self, index: u32) -> Value {
        debug_assert!(index < self.len);
        *self.elems.add(index as usize)
    }

    /// # Safety
    ///
    /// `index < len()` and the side buffer must be valid.
    #[inline(always)]
    pub unsafe fn set_element(&mut self, index: u32, value: Value) {
        debug_assert!(index < self.len);
        self.elems.add(index as usize).write(value);
    }

    /// Append an element. The caller must have ensured spare capacity.
    ///
    /// # Safety
    ///
    /// `len() < capacity()` and the side buffer must be valid.
    #[inline(always)]
    pub unsafe fn push(&mut self, value: Value) {
        debug_assert!(self.len < self.cap);
        self.elems.add(self.len as usize).write(value);
        self.len += 1;
    }

    /// Swap in a larger element buffer; see
    /// [`Obj::replace_entries`].
    ///
    /// # Safety
    ///
    /// `elems` must point to at least `cap` writable [`Value`] slots,
    /// the first `len()` of which are initialized.
    #[inline(always)]
    pub unsafe fn replace_elems(&mut self, elems: *mut Value, cap: u32) {
        debug_assert!(cap >= self.len);
        self.elems = elems;
        self.cap = cap;
    }
}

/// Initialize an [`Array`] at a raw allocation with `len` elements of
/// UNDEF.
///
/// # Safety
///
/// `ptr` must point to `size_of::<Array>()` bytes of writable memory,
/// and `elems` must point to `cap >= len` writable [`Value`] slots (or
/// be null when `cap == 0`).
pub unsafe fn init_array(
    ptr: *mut Array,
    elems: *mut Value,
    len: u32,
    cap: u32,
) {
    debug_assert!(len <= cap);
    for i in 0..len as usize {
        elems.add(i).write(Value::UNDEF);
    }
    ptr.write(Array {
        header: Header::new(ObjectType::Array),
        cap,
        len,
        elems,
    });
}

// ── Str ────────────────────────────────────────────────────────────

/// An immutable byte string with inline data.
///
/// ```text
/// [Header 8B] [len: u32] [pad: u32] [byte_0] [byte_1] ...
/// ```
///
/// Indexing is byte-wise; `get_char` hands out one-byte strings, so the
/// content is not required to be UTF-8.
#[repr(C)]
pub struct Str {
    pub header: Header,
    len: u32,
    _pad: u32,
}

const _: () = assert!(size_of::<Str>() == 16);

impl Str {
    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len()` bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        let ptr = (self as *const Str).add(1) as *const u8;
        core::slice::from_raw_parts(ptr, self.len as usize)
    }

    /// # Safety
    ///
    /// `index < len()` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn byte(&self, index: u32) -> u8 {
        debug_assert!(index < self.len);
        *((self as *const Str).add(1) as *const u8).add(index as usize)
    }

    /// View the content as `&str`. Only valid for strings known to be
    /// UTF-8 (identifiers, opcode names, source text).
    ///
    /// # Safety
    ///
    /// The inline memory must be valid and hold UTF-8 bytes.
    #[inline(always)]
    pub unsafe fn as_str(&self) -> &str {
        core::str::from_utf8_unchecked(self.bytes())
    }
}

/// Compute the total allocation size for a [`Str`] holding `len` bytes.
pub const fn str_allocation_size(len: usize) -> usize {
    size_of::<Str>() + len
}

/// Initialize a [`Str`] at a raw allocation and copy `bytes` after it.
///
/// # Safety
///
/// `ptr` must point to at least `str_allocation_size(bytes.len())`
/// bytes of writable memory.
pub unsafe fn init_str(ptr: *mut Str, bytes: &[u8]) {
    ptr.write(Str {
        header: Header::new(ObjectType::Str),
        len: bytes.len() as u32,
        _pad: 0,
    });
    if !bytes.is_empty() {
        let dst = ptr.add(1) as *mut u8;
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }
}
