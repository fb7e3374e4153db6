/// Heap object model.
///
/// Every heap slot holds an `ObjHeader` (class pointer, GC mark bit,
/// generation tag, shape id, lazily-assigned stable object id) and an
/// `ObjData` payload — one of the ~20 object variants the runtime knows.
/// Values reference objects by `HeapId`; the payloads own their element
/// storage directly, so tracing an object is a match over its variant.

use std::any::Any;
use std::collections::HashMap;

use indexmap::IndexMap;

use crate::value::{DictKey, HeapId, Value};

// ---------------------------------------------------------------------------
// Native call contract
// ---------------------------------------------------------------------------

pub type NativeResult = Result<Value, NativeError>;

/// How a native signals failure: either a named exception class plus a
/// message (the common case), or an exception instance it already built.
/// Both enter the normal propagation machinery.
#[derive(Debug)]
pub enum NativeError {
    Throw { class: &'static str, message: String },
    Propagate(Value),
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> NativeResult;
pub type NativeMethodFn = fn(&mut crate::vm::Vm, Value, &[Value]) -> NativeResult;

// ---------------------------------------------------------------------------
// Object header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ObjHeader {
    /// Class of the object. `None` for kinds whose class is resolved through
    /// the core class table (strings, arrays, functions, ...); always set
    /// for instances, value instances and exceptions.
    pub class: Option<HeapId>,
    pub marked: bool,
    pub generation: u8,
    pub shape_id: u32,
    /// Stable identity, assigned on first request and never reused.
    pub obj_id: Option<u64>,
}

impl ObjHeader {
    pub fn new(class: Option<HeapId>) -> Self {
        ObjHeader {
            class,
            marked: false,
            generation: 0,
            shape_id: 0,
            obj_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Behaviors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorKind {
    Standard,
    Trait,
    Metaclass,
}

/// Interceptor methods recognized at registration time. `Init` drives
/// construction; the undefined-access hooks fire on lookup misses. The
/// invoke wrappers are stored but dispatched only on their narrow paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptorKind {
    Init,
    BeforeInvoke,
    AfterInvoke,
    UndefinedInvoke,
    UndefinedGet,
    UndefinedSet,
}

pub struct ClassObj {
    pub name: HeapId,
    pub full_name: HeapId,
    pub superclass: Option<HeapId>,
    /// Method table keyed by interned selector. Populated during class
    /// definition (inheritance copy, trait application, own methods) and
    /// read-only afterwards.
    pub methods: IndexMap<HeapId, Value>,
    pub class_var_indexes: IndexMap<HeapId, usize>,
    pub class_vars: Vec<Value>,
    pub traits: Vec<HeapId>,
    /// Monotonically assigned; keys METHOD and CVAR inline caches.
    pub behavior_id: u32,
    pub kind: BehaviorKind,
    pub interceptors: HashMap<InterceptorKind, Value>,
    pub is_native: bool,
}

// ---------------------------------------------------------------------------
// Functions and closures
// ---------------------------------------------------------------------------

pub struct FunctionObj {
    pub name: Option<HeapId>,
    /// −1 marks a variadic function; the interpreter packs the arguments
    /// into an array at call time.
    pub arity: i32,
    pub upvalue_count: usize,
    /// Index into the VM's chunk table.
    pub chunk: u32,
    pub is_generator: bool,
    pub is_async: bool,
}

pub struct ClosureObj {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
    /// Module whose bindings GET_GLOBAL/SET_GLOBAL resolve against.
    pub module: HeapId,
}

pub struct NativeFunctionObj {
    pub name: String,
    pub arity: i32,
    pub is_async: bool,
    pub func: NativeFn,
}

pub struct NativeMethodObj {
    pub class: HeapId,
    pub name: String,
    pub arity: i32,
    pub is_async: bool,
    pub func: NativeMethodFn,
}

/// An upvalue is open (pointing at a live absolute stack slot) xor closed
/// (owning the lifted value). The transition happens exactly once.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

// ---------------------------------------------------------------------------
// Frames, generators, promises
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub class: HeapId,
    pub handler_addr: u16,
    /// `u16::MAX` when the try statement has no finally block.
    pub finally_addr: u16,
    /// Operand-stack height relative to the frame base at TRY time; catching
    /// restores the frame to this height before pushing the exception.
    pub stack_depth: usize,
}

/// The saved form of a call frame, owned by a generator while suspended.
/// Live slots and the handler substack travel with it.
#[derive(Debug, Clone)]
pub struct SavedFrame {
    pub closure: HeapId,
    pub ip: usize,
    pub slots: Vec<Value>,
    pub handlers: Vec<ExceptionHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    Start,
    Resume,
    Yield,
    Return,
    Error,
    Throw,
}

pub struct GeneratorObj {
    /// Frame object holding the suspended activation.
    pub frame: HeapId,
    pub state: GeneratorState,
    /// Last yielded (or final) value.
    pub value: Value,
    /// Exception stashed by `throws`; re-thrown at the suspended yield on
    /// the next resume.
    pub pending_exception: Value,
    /// Delegating generator, when this one runs under a `yield from`.
    pub outer: Option<HeapId>,
    /// Inner generator currently delegated to by `yield from`.
    pub inner: Option<HeapId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Continuation resuming a suspended async frame when a promise settles.
#[derive(Debug, Clone, Copy)]
pub struct AwaitContinuation {
    pub generator: HeapId,
    /// Promise to settle with the async function's result, if the suspended
    /// frame belongs to an async call (absent for the top-level script).
    pub driver: Option<HeapId>,
}

pub struct PromiseObj {
    pub id: u64,
    pub state: PromiseState,
    pub value: Value,
    pub exception: Value,
    pub executor: Value,
    /// User handlers attached with `then`, fired in attachment order.
    pub handlers: Vec<Value>,
    pub on_catch: Value,
    pub on_finally: Value,
    /// Context dictionary for passing values to combinator callbacks.
    pub captures: HeapId,
    pub continuations: Vec<AwaitContinuation>,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

pub struct TimerObj {
    pub closure: Value,
    pub delay_ms: u64,
    pub interval_ms: u64,
    /// Loop handle while scheduled.
    pub timer_id: Option<u64>,
    pub running: bool,
}

pub struct FileObj {
    pub path: HeapId,
    pub mode: String,
    pub is_open: bool,
    pub offset: u64,
    pub handle: Option<std::fs::File>,
}

/// Opaque pointer to externally managed state, used to embed library
/// internals (e.g. RNG state) behind a class.
pub struct RecordObj {
    pub data: Box<dyn Any>,
}

// ---------------------------------------------------------------------------
// The payload union
// ---------------------------------------------------------------------------

pub struct StrObj {
    pub chars: Box<str>,
    pub hash: u32,
}

pub struct DictObj {
    pub entries: IndexMap<DictKey, Value>,
}

pub struct NamespaceObj {
    pub short_name: HeapId,
    pub full_name: HeapId,
    pub enclosing: Option<HeapId>,
    pub values: IndexMap<HeapId, Value>,
}

pub struct ModuleObj {
    pub path: HeapId,
    pub closure: Option<HeapId>,
    pub val_indexes: IndexMap<HeapId, usize>,
    pub val_fields: Vec<Value>,
    pub var_indexes: IndexMap<HeapId, usize>,
    pub var_fields: Vec<Value>,
    pub is_native: bool,
}

pub enum ObjData {
    Str(StrObj),
    Array(Vec<Value>),
    Dict(DictObj),
    Entry { key: Value, value: Value },
    Range { from: i32, to: i32 },
    Node { element: Value, prev: Option<HeapId>, next: Option<HeapId> },
    Function(FunctionObj),
    Closure(ClosureObj),
    NativeFunction(NativeFunctionObj),
    NativeMethod(NativeMethodObj),
    BoundMethod { receiver: Value, method: Value },
    Upvalue(UpvalueState),
    Class(ClassObj),
    Instance { fields: Vec<Value> },
    ValueInstance { value: Value },
    Namespace(NamespaceObj),
    Module(ModuleObj),
    Exception { message: Value, stacktrace: Value },
    Frame(Box<SavedFrame>),
    Generator(GeneratorObj),
    Promise(PromiseObj),
    Timer(TimerObj),
    File(FileObj),
    Record(RecordObj),
}

impl ObjData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::Str(_) => "String",
            ObjData::Array(_) => "Array",
            ObjData::Dict(_) => "Dictionary",
            ObjData::Entry { .. } => "Entry",
            ObjData::Range { .. } => "Range",
            ObjData::Node { .. } => "Node",
            ObjData::Function(_) => "Function",
            ObjData::Closure(_) => "Function",
            ObjData::NativeFunction(_) => "Function",
            ObjData::NativeMethod(_) => "Method",
            ObjData::BoundMethod { .. } => "BoundMethod",
            ObjData::Upvalue(_) => "Upvalue",
            ObjData::Class(_) => "Class",
            ObjData::Instance { .. } => "Instance",
            ObjData::ValueInstance { .. } => "Instance",
            ObjData::Namespace(_) => "Namespace",
            ObjData::Module(_) => "Module",
            ObjData::Exception { .. } => "Exception",
            ObjData::Frame(_) => "Frame",
            ObjData::Generator(_) => "Generator",
            ObjData::Promise(_) => "Promise",
            ObjData::Timer(_) => "Timer",
            ObjData::File(_) => "File",
            ObjData::Record(_) => "Record",
        }
    }

    /// Rough payload size in bytes, used for per-generation accounting.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<ObjData>();
        base + match self {
            ObjData::Str(s) => s.chars.len(),
            ObjData::Array(elements) => elements.len() * std::mem::size_of::<Value>(),
            ObjData::Dict(d) => d.entries.len() * 2 * std::mem::size_of::<Value>(),
            ObjData::Instance { fields } => fields.len() * std::mem::size_of::<Value>(),
            ObjData::Class(c) => {
                (c.methods.len() + c.class_vars.len()) * 2 * std::mem::size_of::<Value>()
            }
            ObjData::Frame(f) => f.slots.len() * std::mem::size_of::<Value>(),
            ObjData::Closure(c) => c.upvalues.len() * std::mem::size_of::<HeapId>(),
            ObjData::Module(m) => {
                (m.val_fields.len() + m.var_fields.len()) * 2 * std::mem::size_of::<Value>()
            }
            _ => 0,
        }
    }

    /// Appends every heap reference held by this payload to `gray`.
    pub fn trace(&self, gray: &mut Vec<HeapId>) {
        fn value(v: Value, gray: &mut Vec<HeapId>) {
            if let Value::Obj(id) = v {
                gray.push(id);
            }
        }

        match self {
            ObjData::Str(_) => {}
            ObjData::Array(elements) => {
                for &v in elements {
                    value(v, gray);
                }
            }
            ObjData::Dict(d) => {
                for (k, &v) in &d.entries {
                    value(k.0, gray);
                    value(v, gray);
                }
            }
            ObjData::Entry { key, value: val } => {
                value(*key, gray);
                value(*val, gray);
            }
            ObjData::Range { .. } => {}
            ObjData::Node { element, prev, next } => {
                value(*element, gray);
                gray.extend(prev.iter().copied());
                gray.extend(next.iter().copied());
            }
            ObjData::Function(f) => {
                gray.extend(f.name.iter().copied());
            }
            ObjData::Closure(c) => {
                gray.push(c.function);
                gray.extend(c.upvalues.iter().copied());
                gray.push(c.module);
            }
            ObjData::NativeFunction(_) => {}
            ObjData::NativeMethod(m) => gray.push(m.class),
            ObjData::BoundMethod { receiver, method } => {
                value(*receiver, gray);
                value(*method, gray);
            }
            ObjData::Upvalue(state) => {
                if let UpvalueState::Closed(v) = state {
                    value(*v, gray);
                }
            }
            ObjData::Class(c) => {
                gray.push(c.name);
                gray.push(c.full_name);
                gray.extend(c.superclass.iter().copied());
                for (&name, &method) in &c.methods {
                    gray.push(name);
                    value(method, gray);
                }
                for (&name, _) in &c.class_var_indexes {
                    gray.push(name);
                }
                for &v in &c.class_vars {
                    value(v, gray);
                }
                gray.extend(c.traits.iter().copied());
                for v in c.interceptors.values() {
                    value(*v, gray);
                }
            }
            ObjData::Instance { fields } => {
                for &v in fields {
                    value(v, gray);
                }
            }
            ObjData::ValueInstance { value: v } => value(*v, gray),
            ObjData::Namespace(ns) => {
                gray.push(ns.short_name);
                gray.push(ns.full_name);
                gray.extend(ns.enclosing.iter().copied());
                for (&name, &v) in &ns.values {
                    gray.push(name);
                    value(v, gray);
                }
            }
            ObjData::Module(m) => {
                gray.push(m.path);
                gray.extend(m.closure.iter().copied());
                for (&name, _) in &m.val_indexes {
                    gray.push(name);
                }
                for (&name, _) in &m.var_indexes {
                    gray.push(name);
                }
                for &v in m.val_fields.iter().chain(m.var_fields.iter()) {
                    value(v, gray);
                }
            }
            ObjData::Exception { message, stacktrace } => {
                value(*message, gray);
                value(*stacktrace, gray);
            }
            ObjData::Frame(f) => {
                gray.push(f.closure);
                for &v in &f.slots {
                    value(v, gray);
                }
                for h in &f.handlers {
                    gray.push(h.class);
                }
            }
            ObjData::Generator(g) => {
                gray.push(g.frame);
                value(g.value, gray);
                value(g.pending_exception, gray);
                gray.extend(g.outer.iter().copied());
                gray.extend(g.inner.iter().copied());
            }
            ObjData::Promise(p) => {
                value(p.value, gray);
                value(p.exception, gray);
                value(p.executor, gray);
                for &h in &p.handlers {
                    value(h, gray);
                }
                value(p.on_catch, gray);
                value(p.on_finally, gray);
                gray.push(p.captures);
                for c in &p.continuations {
                    gray.push(c.generator);
                    gray.extend(c.driver.iter().copied());
                }
            }
            ObjData::Timer(t) => value(t.closure, gray),
            ObjData::File(f) => gray.push(f.path),
            ObjData::Record(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_collects_container_references() {
        let data = ObjData::Array(vec![
            Value::Int(1),
            Value::Obj(HeapId(7)),
            Value::Obj(HeapId(9)),
        ]);
        let mut gray = Vec::new();
        data.trace(&mut gray);
        assert_eq!(gray, vec![HeapId(7), HeapId(9)]);
    }

    #[test]
    fn test_trace_follows_saved_frame_handlers() {
        let frame = SavedFrame {
            closure: HeapId(1),
            ip: 0,
            slots: vec![Value::Obj(HeapId(2))],
            handlers: vec![ExceptionHandler {
                class: HeapId(3),
                handler_addr: 0,
                finally_addr: u16::MAX,
                stack_depth: 0,
            }],
        };
        let mut gray = Vec::new();
        ObjData::Frame(Box::new(frame)).trace(&mut gray);
        assert_eq!(gray, vec![HeapId(1), HeapId(2), HeapId(3)]);
    }
}
