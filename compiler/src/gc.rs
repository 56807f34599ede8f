use crate::object::{
    GcRef, HeapObject, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader,
    ObjInstance, ObjNative, ObjString, ObjUpvalue,
};
use crate::table::Table;
use crate::value::Value;
use std::ptr::NonNull;

const GC_HEAP_GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

/// Interns the very first string ("init") before a [`Gc`] fully exists, so
/// `Gc::new` never needs a placeholder value for `init_string`.
fn bootstrap_intern(
    objects: &mut *mut ObjHeader,
    strings: &mut Table,
    bytes_allocated: &mut usize,
    chars: &str,
) -> GcRef<ObjString> {
    let hash = hash_string(chars);
    let boxed = Box::new(ObjString::new(chars.into(), hash));
    let header_ptr = Box::into_raw(boxed) as *mut ObjHeader;
    unsafe {
        (*header_ptr).next = *objects;
    }
    *objects = header_ptr;
    *bytes_allocated += std::mem::size_of::<ObjString>();
    let reference = GcRef::from_header(NonNull::new(header_ptr).expect("freshly boxed pointer is non-null"));
    strings.set(reference, Value::Nil);
    reference
}

fn hash_string(s: &str) -> u32 {
    // FNV-1a.
    let mut hash: u32 = 2166136261;
    for byte in s.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Implemented by whichever side of the crate boundary is currently holding
/// live roots: the compiler (its local/upvalue tables and any function
/// object under construction) or the VM (its value stack, call frames, open
/// upvalues and globals). `Gc::collect_garbage` never knows which; it just
/// asks the `MarkRoots` it was handed.
pub trait MarkRoots {
    fn mark_roots(&mut self, gc: &mut Gc);
}

/// Mark-sweep collector and allocator. Owns every heap object
/// ever allocated through it, threaded together via each object's
/// `ObjHeader::next` pointer so the sweep phase can walk them without a
/// side table.
pub struct Gc {
    objects: *mut ObjHeader,
    pub strings: Table,
    gray_stack: Vec<NonNull<ObjHeader>>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Interned `"init"`, checked on every method call to detect constructors
    /// (constructor-call detection at `OP_INVOKE`) without re-interning it.
    pub init_string: GcRef<ObjString>,
}

impl Gc {
    pub fn new() -> Self {
        let mut objects: *mut ObjHeader = std::ptr::null_mut();
        let mut strings = Table::new();
        let mut bytes_allocated = 0usize;
        let init_string = bootstrap_intern(&mut objects, &mut strings, &mut bytes_allocated, "init");
        Self {
            objects,
            strings,
            gray_stack: Vec::new(),
            bytes_allocated,
            next_gc: INITIAL_NEXT_GC,
            init_string,
        }
    }

    fn register<T: HeapObject>(&mut self, object: T) -> GcRef<T> {
        let boxed = Box::new(object);
        let raw = Box::into_raw(boxed);
        let header_ptr = raw as *mut ObjHeader;
        unsafe {
            (*header_ptr).next = self.objects;
        }
        self.objects = header_ptr;
        self.bytes_allocated += std::mem::size_of::<T>();
        #[cfg(feature = "verbose")]
        eprintln!(
            "gc: alloc {:?} ({} bytes), {} total",
            T::KIND,
            std::mem::size_of::<T>(),
            self.bytes_allocated
        );
        GcRef::from_header(NonNull::new(header_ptr).expect("freshly boxed pointer is non-null"))
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Lowers the collection threshold so tests can force a cycle on the
    /// very next [`Gc::should_collect`] check instead of allocating
    /// megabytes of filler first.
    #[cfg(test)]
    pub(crate) fn force_next_gc(&mut self, threshold: usize) {
        self.next_gc = threshold;
    }

    /// Allocate-or-reuse a string: interning makes `==` on
    /// strings a pointer comparison, so every path that produces a string
    /// value funnels through here.
    pub fn intern(&mut self, chars: &str) -> GcRef<ObjString> {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }
        let obj = ObjString::new(chars.into(), hash);
        let reference = self.register(obj);
        self.strings.set(reference, Value::Nil);
        reference
    }

    /// Like [`Gc::intern`] but takes ownership of an already-built `String`,
    /// avoiding a copy for values produced by concatenation.
    pub fn intern_owned(&mut self, chars: String) -> GcRef<ObjString> {
        let hash = hash_string(&chars);
        if let Some(existing) = self.strings.find_string(&chars, hash) {
            return existing;
        }
        let obj = ObjString::new(chars.into_boxed_str(), hash);
        let reference = self.register(obj);
        self.strings.set(reference, Value::Nil);
        reference
    }

    pub fn alloc_function(&mut self, name: Option<GcRef<ObjString>>) -> GcRef<ObjFunction> {
        self.register(ObjFunction::new(name))
    }

    pub fn alloc_native(&mut self, name: &'static str, arity: u8, function: NativeFn) -> GcRef<ObjNative> {
        self.register(ObjNative::new(name, arity, function))
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> GcRef<ObjUpvalue> {
        self.register(ObjUpvalue::new(location))
    }

    pub fn alloc_closure(&mut self, function: GcRef<ObjFunction>) -> GcRef<ObjClosure> {
        self.register(ObjClosure::new(function))
    }

    pub fn alloc_class(&mut self, name: GcRef<ObjString>) -> GcRef<ObjClass> {
        self.register(ObjClass::new(name))
    }

    pub fn alloc_instance(&mut self, class: GcRef<ObjClass>) -> GcRef<ObjInstance> {
        self.register(ObjInstance::new(class))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: GcRef<ObjClosure>) -> GcRef<ObjBoundMethod> {
        self.register(ObjBoundMethod::new(receiver, method))
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, object: GcRef<Obj>) {
        let header = object.header_ptr();
        unsafe {
            if (*header).is_marked {
                return;
            }
            (*header).is_marked = true;
        }
        self.gray_stack.push(NonNull::new(header).unwrap());
    }

    fn mark_table(&mut self, table: &Table) {
        let entries: Vec<(GcRef<ObjString>, Value)> = table.iter().collect();
        for (key, value) in entries {
            self.mark_object(key.erase());
            self.mark_value(value);
        }
    }

    /// Trace one gray object's references, turning it black, and enqueueing
    /// anything it points at that isn't already gray or black
    /// (the trace phase).
    fn blacken_object(&mut self, header: NonNull<ObjHeader>) {
        let object: GcRef<Obj> = GcRef::from_header(header);
        match object.kind() {
            crate::object::ObjKind::String | crate::object::ObjKind::Native => {}
            crate::object::ObjKind::Function => {
                let function = object.as_function().unwrap();
                if let Some(name) = function.as_ref().name {
                    self.mark_object(name.erase());
                }
                let constants: Vec<Value> = function.as_ref().chunk.constants.clone();
                for constant in constants {
                    self.mark_value(constant);
                }
            }
            crate::object::ObjKind::Upvalue => {
                self.mark_value(object.as_upvalue().unwrap().as_ref().get());
            }
            crate::object::ObjKind::Closure => {
                let closure = object.as_closure().unwrap();
                self.mark_object(closure.as_ref().function.erase());
                let upvalues = closure.as_ref().upvalues.clone();
                for upvalue in upvalues {
                    self.mark_object(upvalue.erase());
                }
            }
            crate::object::ObjKind::Class => {
                let class = object.as_class().unwrap();
                self.mark_object(class.as_ref().name.erase());
                self.mark_table(&class.as_ref().methods);
            }
            crate::object::ObjKind::Instance => {
                let instance = object.as_instance().unwrap();
                self.mark_object(instance.as_ref().class.erase());
                self.mark_table(&instance.as_ref().fields);
            }
            crate::object::ObjKind::BoundMethod => {
                let bound = object.as_bound_method().unwrap();
                self.mark_value(bound.as_ref().receiver);
                self.mark_object(bound.as_ref().method.erase());
            }
        }
    }

    fn trace_references(&mut self) {
        while let Some(header) = self.gray_stack.pop() {
            self.blacken_object(header);
        }
    }

    /// Free every unmarked object, dropping its Rust destructor and removing
    /// it from the intrusive list. Runs after [`Table::remove_unmarked_keys`]
    /// has already pruned the (weak) intern table so no dangling `GcRef`
    /// survives in it.
    fn sweep(&mut self) {
        let mut previous: *mut ObjHeader = std::ptr::null_mut();
        let mut current = self.objects;
        while !current.is_null() {
            let is_marked = unsafe { (*current).is_marked };
            let next = unsafe { (*current).next };
            if is_marked {
                unsafe {
                    (*current).is_marked = false;
                }
                previous = current;
                current = next;
            } else {
                if previous.is_null() {
                    self.objects = next;
                } else {
                    unsafe {
                        (*previous).next = next;
                    }
                }
                self.free(current);
                current = next;
            }
        }
    }

    fn free(&mut self, header: *mut ObjHeader) {
        unsafe {
            let kind = (*header).kind;
            macro_rules! drop_as {
                ($ty:ty) => {{
                    self.bytes_allocated -= std::mem::size_of::<$ty>();
                    drop(Box::from_raw(header as *mut $ty));
                }};
            }
            match kind {
                crate::object::ObjKind::String => drop_as!(ObjString),
                crate::object::ObjKind::Function => drop_as!(ObjFunction),
                crate::object::ObjKind::Native => drop_as!(ObjNative),
                crate::object::ObjKind::Closure => drop_as!(ObjClosure),
                crate::object::ObjKind::Upvalue => drop_as!(ObjUpvalue),
                crate::object::ObjKind::Class => drop_as!(ObjClass),
                crate::object::ObjKind::Instance => drop_as!(ObjInstance),
                crate::object::ObjKind::BoundMethod => drop_as!(ObjBoundMethod),
            }
        }
    }

    /// Full mark-sweep cycle: mark every root reachable through
    /// `roots`, trace the gray worklist to black, prune the weak intern
    /// table, then sweep.
    pub fn collect_garbage(&mut self, roots: &mut dyn MarkRoots) {
        #[cfg(feature = "verbose")]
        eprintln!("gc: begin, {} bytes allocated", self.bytes_allocated);
        self.mark_object(self.init_string.erase());
        roots.mark_roots(self);
        self.trace_references();
        self.strings.remove_unmarked_keys();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        #[cfg(feature = "verbose")]
        eprintln!(
            "gc: end, {} bytes allocated, next at {}",
            self.bytes_allocated, self.next_gc
        );
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let mut current = self.objects;
        while !current.is_null() {
            let next = unsafe { (*current).next };
            self.free(current);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_content_twice_returns_the_same_object() {
        let mut gc = Gc::new();
        let a = gc.intern("hello");
        let b = gc.intern("hello");
        assert!(a.same_object(&b));
    }

    #[test]
    fn distinct_content_interns_distinct_objects() {
        let mut gc = Gc::new();
        let a = gc.intern("hello");
        let b = gc.intern("world");
        assert!(!a.same_object(&b));
    }

    struct NoRoots;
    impl MarkRoots for NoRoots {
        fn mark_roots(&mut self, _gc: &mut Gc) {}
    }

    #[test]
    fn unreachable_objects_are_collected() {
        let mut gc = Gc::new();
        let _kept = gc.intern("kept");
        gc.intern("garbage");
        gc.mark_object(_kept.erase());
        let mut roots = NoRoots;
        // `init_string` and `_kept` are marked; "garbage" and its table slot
        // are not, so remove_unmarked_keys prunes it out of `strings` before
        // sweep would otherwise free it while still referenced from the table.
        gc.collect_garbage(&mut roots);
        assert!(gc.strings.find_string("garbage", hash_string("garbage")).is_none());
        assert!(gc.strings.find_string("kept", hash_string("kept")).is_some());
    }
}
