mod value;
mod header;
mod objects;

pub use value::{Tag, Value};
pub use header::{Header, ObjectType};
pub use objects::{
    init_array, init_obj, init_str, str_allocation_size, Array, FieldPair,
    Obj, Str,
};
