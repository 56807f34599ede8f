use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Tag stored in every heap object's header so a generic `*mut ObjHeader`
/// (as found walking the intrusive all-objects list) can be downcast back to
/// its concrete representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

/// Common header every heap object carries: a type tag, the
/// mark-sweep mark bit, and the intrusive "next" link that roots the
/// all-objects list at the [`crate::gc::Gc`].
#[repr(C)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub is_marked: bool,
    pub next: *mut ObjHeader,
}

impl ObjHeader {
    fn new(kind: ObjKind) -> Self {
        Self {
            kind,
            is_marked: false,
            next: std::ptr::null_mut(),
        }
    }
}

/// Implemented by every concrete heap payload (`ObjString`, `ObjFunction`,
/// ...). Every implementor is `#[repr(C)]` with `header` as its first field,
/// so a pointer to the payload and a pointer to its header share an address;
/// that's what lets [`GcRef`] erase to/from [`Obj`] with a plain pointer cast.
pub trait HeapObject {
    const KIND: ObjKind;
    fn header(&self) -> &ObjHeader;
    fn header_mut(&mut self) -> &mut ObjHeader;
}

macro_rules! heap_object {
    ($ty:ty, $kind:expr) => {
        impl HeapObject for $ty {
            const KIND: ObjKind = $kind;
            fn header(&self) -> &ObjHeader {
                &self.header
            }
            fn header_mut(&mut self) -> &mut ObjHeader {
                &mut self.header
            }
        }
    };
}

/// Marker type used as `GcRef<Obj>`, i.e. "a reference to some heap object of
/// unknown concrete type". Never instantiated.
pub enum Obj {}

/// A GC-managed reference. `GcRef<Obj>` is the type-erased form stored in
/// `Value::Obj`; `GcRef<ObjString>` etc. are the narrowed forms used once the
/// kind is known (after a successful `as_string()` etc.).
pub struct GcRef<T> {
    ptr: NonNull<ObjHeader>,
    _marker: PhantomData<*const T>,
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcRef<T> {}

impl<T> GcRef<T> {
    pub(crate) fn from_header(ptr: NonNull<ObjHeader>) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    pub fn header(&self) -> &ObjHeader {
        unsafe { self.ptr.as_ref() }
    }

    pub fn header_ptr(&self) -> *mut ObjHeader {
        self.ptr.as_ptr()
    }

    pub fn kind(&self) -> ObjKind {
        self.header().kind
    }

    pub fn same_object(&self, other: &GcRef<T>) -> bool {
        self.ptr == other.ptr
    }

    pub fn erase(self) -> GcRef<Obj> {
        GcRef::from_header(self.ptr)
    }
}

impl<T: HeapObject> GcRef<T> {
    pub fn as_ref(&self) -> &T {
        debug_assert_eq!(self.kind(), T::KIND);
        unsafe { &*(self.ptr.as_ptr() as *const T) }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn as_mut(&mut self) -> &mut T {
        debug_assert_eq!(self.kind(), T::KIND);
        unsafe { &mut *(self.ptr.as_ptr() as *mut T) }
    }
}

impl GcRef<Obj> {
    fn narrow<T: HeapObject>(self) -> Option<GcRef<T>> {
        if self.kind() == T::KIND {
            Some(GcRef::from_header(self.ptr))
        } else {
            None
        }
    }

    pub fn as_string(self) -> Option<GcRef<ObjString>> {
        self.narrow()
    }
    pub fn as_function(self) -> Option<GcRef<ObjFunction>> {
        self.narrow()
    }
    pub fn as_native(self) -> Option<GcRef<ObjNative>> {
        self.narrow()
    }
    pub fn as_closure(self) -> Option<GcRef<ObjClosure>> {
        self.narrow()
    }
    pub fn as_upvalue(self) -> Option<GcRef<ObjUpvalue>> {
        self.narrow()
    }
    pub fn as_class(self) -> Option<GcRef<ObjClass>> {
        self.narrow()
    }
    pub fn as_instance(self) -> Option<GcRef<ObjInstance>> {
        self.narrow()
    }
    pub fn as_bound_method(self) -> Option<GcRef<ObjBoundMethod>> {
        self.narrow()
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            ObjKind::String => "string",
            ObjKind::Function => "function",
            ObjKind::Native => "native function",
            ObjKind::Closure => "function",
            ObjKind::Upvalue => "upvalue",
            ObjKind::Class => "class",
            ObjKind::Instance => "instance",
            ObjKind::BoundMethod => "function",
        }
    }
}

impl fmt::Display for GcRef<Obj> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            ObjKind::String => write!(f, "{}", self.narrow::<ObjString>().unwrap().as_ref().chars),
            ObjKind::Function => {
                write!(f, "{}", function_display_name(self.narrow::<ObjFunction>().unwrap()))
            }
            ObjKind::Native => write!(f, "<native fn {}>", self.narrow::<ObjNative>().unwrap().as_ref().name),
            ObjKind::Closure => {
                let closure = self.narrow::<ObjClosure>().unwrap();
                write!(f, "{}", function_display_name(closure.as_ref().function))
            }
            ObjKind::Upvalue => write!(f, "<upvalue>"),
            ObjKind::Class => write!(f, "{}", self.narrow::<ObjClass>().unwrap().as_ref().name.as_ref()),
            ObjKind::Instance => {
                let instance = self.narrow::<ObjInstance>().unwrap();
                write!(f, "{} instance", instance.as_ref().class.as_ref().name.as_ref())
            }
            ObjKind::BoundMethod => {
                let bound = self.narrow::<ObjBoundMethod>().unwrap();
                write!(f, "{}", function_display_name(bound.as_ref().method.as_ref().function))
            }
        }
    }
}

fn function_display_name(function: GcRef<ObjFunction>) -> String {
    match function.as_ref().name {
        Some(name) => format!("<fn {}>", name.as_ref()),
        None => "<script>".to_string(),
    }
}

// ---------------------------------------------------------------------
// Concrete heap payloads. Each starts with `header: ObjHeader` and derives
// its erased form purely through that shared prefix (see HeapObject above).
// ---------------------------------------------------------------------

#[repr(C)]
pub struct ObjString {
    header: ObjHeader,
    pub hash: u32,
    pub chars: Box<str>,
}
heap_object!(ObjString, ObjKind::String);

impl fmt::Display for ObjString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.chars)
    }
}

impl ObjString {
    pub(crate) fn new(chars: Box<str>, hash: u32) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::String),
            hash,
            chars,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

impl AsRef<str> for ObjString {
    fn as_ref(&self) -> &str {
        &self.chars
    }
}

#[repr(C)]
pub struct ObjFunction {
    header: ObjHeader,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    pub name: Option<GcRef<ObjString>>,
}
heap_object!(ObjFunction, ObjKind::Function);

impl ObjFunction {
    pub(crate) fn new(name: Option<GcRef<ObjString>>) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::Function),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[repr(C)]
pub struct ObjNative {
    header: ObjHeader,
    pub function: NativeFn,
    pub name: &'static str,
    pub arity: u8,
}
heap_object!(ObjNative, ObjKind::Native);

impl ObjNative {
    pub(crate) fn new(name: &'static str, arity: u8, function: NativeFn) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::Native),
            function,
            name,
            arity,
        }
    }
}

/// `location` points either at a live slot on the VM's operand stack (open)
/// or at `closed` itself, once the upvalue has been closed.
#[repr(C)]
pub struct ObjUpvalue {
    header: ObjHeader,
    pub location: *mut Value,
    pub closed: Value,
    pub next_open: Option<GcRef<ObjUpvalue>>,
}
heap_object!(ObjUpvalue, ObjKind::Upvalue);

impl ObjUpvalue {
    pub(crate) fn new(location: *mut Value) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::Upvalue),
            location,
            closed: Value::Nil,
            next_open: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !std::ptr::eq(self.location, &self.closed as *const Value)
    }

    pub fn get(&self) -> Value {
        unsafe { *self.location }
    }

    pub fn set(&mut self, value: Value) {
        unsafe {
            *self.location = value;
        }
    }

    pub fn close(&mut self) {
        self.closed = unsafe { *self.location };
        self.location = &mut self.closed as *mut Value;
    }
}

#[repr(C)]
pub struct ObjClosure {
    header: ObjHeader,
    pub function: GcRef<ObjFunction>,
    pub upvalues: Vec<GcRef<ObjUpvalue>>,
}
heap_object!(ObjClosure, ObjKind::Closure);

impl ObjClosure {
    pub(crate) fn new(function: GcRef<ObjFunction>) -> Self {
        let upvalue_count = function.as_ref().upvalue_count as usize;
        Self {
            header: ObjHeader::new(ObjKind::Closure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}

#[repr(C)]
pub struct ObjClass {
    header: ObjHeader,
    pub name: GcRef<ObjString>,
    pub methods: Table,
}
heap_object!(ObjClass, ObjKind::Class);

impl ObjClass {
    pub(crate) fn new(name: GcRef<ObjString>) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::Class),
            name,
            methods: Table::new(),
        }
    }
}

#[repr(C)]
pub struct ObjInstance {
    header: ObjHeader,
    pub class: GcRef<ObjClass>,
    pub fields: Table,
}
heap_object!(ObjInstance, ObjKind::Instance);

impl ObjInstance {
    pub(crate) fn new(class: GcRef<ObjClass>) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::Instance),
            class,
            fields: Table::new(),
        }
    }
}

#[repr(C)]
pub struct ObjBoundMethod {
    header: ObjHeader,
    pub receiver: Value,
    pub method: GcRef<ObjClosure>,
}
heap_object!(ObjBoundMethod, ObjKind::BoundMethod);

impl ObjBoundMethod {
    pub(crate) fn new(receiver: Value, method: GcRef<ObjClosure>) -> Self {
        Self {
            header: ObjHeader::new(ObjKind::BoundMethod),
            receiver,
            method,
        }
    }
}
