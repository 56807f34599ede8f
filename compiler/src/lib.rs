mod chunk;
mod compiler;
mod error;
mod gc;
mod object;
mod table;
mod value;

pub use chunk::{Chunk, OpCode};
pub use compiler::compile;
pub use error::{CompileError, CompileErrors};
pub use gc::{Gc, MarkRoots};
pub use object::{
    GcRef, HeapObject, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader,
    ObjInstance, ObjKind, ObjNative, ObjString, ObjUpvalue,
};
pub use table::Table;
pub use value::Value;
