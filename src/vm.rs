/// The stack-based bytecode interpreter.
///
/// One contiguous value stack (64 frames × 256 slots), a frame stack, and a
/// fetch-decode-execute loop. Reentrant entries (natives calling back into
/// script code, generator resumption, promise settlement, event-loop
/// callbacks) recurse into `run` with a frame floor; the loop returns when
/// the frame count drops below its floor.
///
/// Unwinding travels through `Unwind`:
///   • `Thrown` — an exception found no handler above the current floor;
///     outer run levels continue the search, the host turns it fatal
///   • `NonLocal` — a lambda `return` still crossing frames
///   • `Fatal` — unrecoverable host-level failure
///
/// Runtime errors (type mismatches, bad arity, bounds) are thrown as
/// catchable exceptions of the core classes; only exceptions that escape
/// every handler reach the host.

use std::time::Instant;

use indexmap::IndexMap;

use crate::chunk::{CacheKind, Chunk, InlineCache, OpCode};
use crate::conf::Configuration;
use crate::errors::{FrontendError, KesError, RuntimeFatal};
use crate::event_loop::{EventLoop, LoopTask};
use crate::heap::{Heap, GEN_TENURED};
use crate::object::{
    BehaviorKind, ClassObj, ClosureObj, DictObj, ExceptionHandler, GeneratorObj, GeneratorState,
    InterceptorKind, ModuleObj, NamespaceObj, NativeError, ObjData, PromiseObj, PromiseState,
    SavedFrame, UpvalueState,
};
use crate::shape::ShapeTree;
use crate::value::{DictKey, HeapId, Value};

pub const FRAMES_MAX: usize = 64;
pub const SLOTS_PER_FRAME: usize = 256;
pub const STACK_MAX: usize = FRAMES_MAX * SLOTS_PER_FRAME;
pub const MAX_HANDLERS: usize = 15;

pub const EXC_TYPE: &str = "kestrel.lang.TypeException";
pub const EXC_ARGUMENT: &str = "kestrel.lang.ArgumentException";
pub const EXC_INDEX: &str = "kestrel.lang.IndexException";
pub const EXC_ARITHMETIC: &str = "kestrel.lang.ArithmeticException";
pub const EXC_REFERENCE: &str = "kestrel.lang.ReferenceException";
pub const EXC_STACK_OVERFLOW: &str = "kestrel.lang.StackOverflowException";
pub const EXC_IO: &str = "kestrel.lang.IOException";

#[derive(Debug)]
pub enum Unwind {
    Thrown(Value),
    NonLocal { remaining: usize, value: Value },
    Fatal(RuntimeFatal),
}

pub type RunResult<T> = Result<T, Unwind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    FramePushed,
    Completed,
}

/// What a suspended generator is resumed with.
#[derive(Debug, Clone, Copy)]
pub enum ResumeInput {
    Value(Value),
    Throw(Value),
}

pub struct CallFrame {
    pub closure: HeapId,
    pub chunk: u32,
    pub ip: usize,
    pub base: usize,
    pub handlers: Vec<ExceptionHandler>,
}

/// Heap ids of the built-in classes, filled during native registration.
#[derive(Default, Clone, Copy)]
pub struct CoreClasses {
    pub object: HeapId,
    pub class_class: HeapId,
    pub trait_class: HeapId,
    pub nil: HeapId,
    pub bool_class: HeapId,
    pub number: HeapId,
    pub int: HeapId,
    pub float: HeapId,
    pub string: HeapId,
    pub function: HeapId,
    pub method: HeapId,
    pub bound_method: HeapId,
    pub array: HeapId,
    pub dictionary: HeapId,
    pub entry: HeapId,
    pub range: HeapId,
    pub node: HeapId,
    pub linked_list: HeapId,
    pub namespace: HeapId,
    pub module: HeapId,
    pub exception: HeapId,
    pub generator: HeapId,
    pub promise: HeapId,
    pub timer: HeapId,
    pub file: HeapId,
    pub random: HeapId,
}

pub struct Vm {
    pub conf: Configuration,
    pub heap: Heap,
    pub shapes: ShapeTree,
    pub chunks: Vec<Chunk>,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues sorted by stack slot, highest first.
    pub open_upvalues: Vec<HeapId>,
    /// Immutable global bindings shared by every module (native catalog).
    pub builtins: IndexMap<HeapId, Value>,
    pub modules: IndexMap<String, HeapId>,
    pub current_module: HeapId,
    pub root_namespace: HeapId,
    pub current_namespace: HeapId,
    pub core: CoreClasses,
    pub running_generator: Option<HeapId>,
    pub api_depth: usize,
    pub event_loop: EventLoop,
    behavior_count: u32,
    promise_count: u64,
    pub init_string: HeapId,
    /// Frame floor of the innermost active `run`; exception propagation
    /// stops unwinding here and delegates upward.
    run_floor: usize,
    started: Instant,
}

impl Vm {
    pub fn new(conf: Configuration) -> Vm {
        let mut heap = Heap::new(
            conf.gc_heap_size,
            conf.gc_growth_factor,
            conf.gc_stress_mode,
            conf.debug_gc,
        );
        let init_string = heap.copy_string("init");
        let root_short = heap.copy_string("kestrel");
        let root_namespace = heap.alloc(
            ObjData::Namespace(NamespaceObj {
                short_name: root_short,
                full_name: root_short,
                enclosing: None,
                values: IndexMap::new(),
            }),
            None,
        );
        let event_loop = match EventLoop::new() {
            Ok(event_loop) => event_loop,
            Err(e) => {
                eprintln!("Not enough resources to create event loop: {}.", e);
                std::process::exit(74);
            }
        };

        let mut vm = Vm {
            conf,
            heap,
            shapes: ShapeTree::new(),
            chunks: Vec::new(),
            stack: Vec::with_capacity(SLOTS_PER_FRAME),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            builtins: IndexMap::new(),
            modules: IndexMap::new(),
            current_module: HeapId(0),
            root_namespace,
            current_namespace: root_namespace,
            core: CoreClasses::default(),
            running_generator: None,
            api_depth: 0,
            event_loop,
            behavior_count: 0,
            promise_count: 0,
            init_string,
            run_floor: 0,
            started: Instant::now(),
        };
        crate::stdlib::register_core(&mut vm);
        vm.current_module = vm.new_module("main");
        vm
    }

    // ── Stack primitives ─────────────────────────────────────────────────────

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => panic!("pop from empty VM stack"),
        }
    }

    #[inline]
    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[inline]
    fn set_top(&mut self, distance: usize, value: Value) {
        let index = self.stack.len() - 1 - distance;
        self.stack[index] = value;
    }

    fn read_byte(&mut self) -> u8 {
        let fi = self.frames.len() - 1;
        let chunk = self.frames[fi].chunk as usize;
        let ip = self.frames[fi].ip;
        self.frames[fi].ip = ip + 1;
        self.chunks[chunk].code[ip]
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_identifier(&mut self) -> (usize, Value) {
        let index = self.read_byte() as usize;
        let fi = self.frames.len() - 1;
        let chunk = self.frames[fi].chunk as usize;
        (index, self.chunks[chunk].identifiers[index])
    }

    fn current_chunk_index(&self) -> usize {
        self.frames[self.frames.len() - 1].chunk as usize
    }

    fn current_module_of_frame(&self) -> HeapId {
        let closure = self.frames[self.frames.len() - 1].closure;
        match self.heap.data(closure) {
            ObjData::Closure(c) => c.module,
            _ => self.current_module,
        }
    }

    // ── Classes and dispatch helpers ────────────────────────────────────────

    pub fn class_of(&self, value: Value) -> HeapId {
        match value {
            Value::Nil => self.core.nil,
            Value::Bool(_) => self.core.bool_class,
            Value::Int(_) => self.core.int,
            Value::Float(_) => self.core.float,
            Value::Obj(id) => {
                if let Some(class) = self.heap.header(id).class {
                    return class;
                }
                match self.heap.data(id) {
                    ObjData::Str(_) => self.core.string,
                    ObjData::Array(_) => self.core.array,
                    ObjData::Dict(_) => self.core.dictionary,
                    ObjData::Entry { .. } => self.core.entry,
                    ObjData::Range { .. } => self.core.range,
                    ObjData::Node { .. } => self.core.node,
                    ObjData::Function(_) | ObjData::Closure(_) | ObjData::NativeFunction(_) => {
                        self.core.function
                    }
                    ObjData::NativeMethod(_) => self.core.method,
                    ObjData::BoundMethod { .. } => self.core.bound_method,
                    ObjData::Class(c) => match c.kind {
                        BehaviorKind::Trait => self.core.trait_class,
                        _ => self.core.class_class,
                    },
                    ObjData::Namespace(_) => self.core.namespace,
                    ObjData::Module(_) => self.core.module,
                    ObjData::Exception { .. } => self.core.exception,
                    ObjData::Generator(_) => self.core.generator,
                    ObjData::Promise(_) => self.core.promise,
                    ObjData::Timer(_) => self.core.timer,
                    ObjData::File(_) => self.core.file,
                    _ => self.core.object,
                }
            }
        }
    }

    pub fn class_data(&self, id: HeapId) -> &ClassObj {
        match self.heap.data(id) {
            ObjData::Class(c) => c,
            other => panic!("expected Class, found {}", other.kind_name()),
        }
    }

    fn class_data_mut(&mut self, id: HeapId) -> &mut ClassObj {
        match self.heap.data_mut(id) {
            ObjData::Class(c) => c,
            other => panic!("expected Class, found {}", other.kind_name()),
        }
    }

    /// Instance-of check: walks the superclass chain and the applied traits.
    pub fn instance_of(&self, value: Value, class: HeapId) -> bool {
        let mut current = Some(self.class_of(value));
        while let Some(id) = current {
            if id == class {
                return true;
            }
            let data = self.class_data(id);
            if data.traits.contains(&class) {
                return true;
            }
            current = data.superclass;
        }
        false
    }

    pub fn class_name(&self, class: HeapId) -> &str {
        self.heap.str(self.class_data(class).name)
    }

    pub fn class_full_name(&self, class: HeapId) -> &str {
        self.heap.str(self.class_data(class).full_name)
    }

    /// Creates a class plus its metaclass; publishes neither.
    pub fn create_class(
        &mut self,
        name: &str,
        full_name: &str,
        kind: BehaviorKind,
        is_native: bool,
    ) -> HeapId {
        let name_id = self.heap.copy_string(name);
        let full_id = self.heap.copy_string(full_name);
        self.behavior_count += 1;
        let behavior_id = self.behavior_count;
        let class = self.heap.alloc(
            ObjData::Class(ClassObj {
                name: name_id,
                full_name: full_id,
                superclass: None,
                methods: IndexMap::new(),
                class_var_indexes: IndexMap::new(),
                class_vars: Vec::new(),
                traits: Vec::new(),
                behavior_id,
                kind,
                interceptors: std::collections::HashMap::new(),
                is_native,
            }),
            None,
        );
        if kind == BehaviorKind::Standard {
            let meta_name = format!("{} class", name);
            let meta_full = format!("{} class", full_name);
            let meta_name_id = self.heap.copy_string(&meta_name);
            let meta_full_id = self.heap.copy_string(&meta_full);
            self.behavior_count += 1;
            let meta_behavior = self.behavior_count;
            let metaclass = self.heap.alloc(
                ObjData::Class(ClassObj {
                    name: meta_name_id,
                    full_name: meta_full_id,
                    superclass: None,
                    methods: IndexMap::new(),
                    class_var_indexes: IndexMap::new(),
                    class_vars: Vec::new(),
                    traits: Vec::new(),
                    behavior_id: meta_behavior,
                    kind: BehaviorKind::Metaclass,
                    interceptors: std::collections::HashMap::new(),
                    is_native,
                }),
                None,
            );
            self.heap.header_mut(class).class = Some(metaclass);
            // The metaclass of a metaclass closes the chain at Class itself,
            // resolved lazily once the root hierarchy exists.
            if self.core.class_class.0 != 0 {
                self.heap.header_mut(metaclass).class = Some(self.core.class_class);
            }
        }
        class
    }

    // ── Exceptions ──────────────────────────────────────────────────────────

    /// `in <function> from <module path> at line <n>` per live frame,
    /// innermost first.
    pub fn capture_stack_trace(&self) -> Vec<String> {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let (function_name, module) = match self.heap.data(frame.closure) {
                ObjData::Closure(c) => {
                    let name = match self.heap.data(c.function) {
                        ObjData::Function(f) => f
                            .name
                            .map(|n| self.heap.str(n).to_string())
                            .unwrap_or_else(|| "script".to_string()),
                        _ => "script".to_string(),
                    };
                    (name, c.module)
                }
                _ => ("script".to_string(), self.current_module),
            };
            let path = match self.heap.data(module) {
                ObjData::Module(m) => self.heap.str(m.path).to_string(),
                _ => "?".to_string(),
            };
            let chunk = &self.chunks[frame.chunk as usize];
            let line = chunk.line_at(frame.ip.saturating_sub(1));
            trace.push(format!(
                "in {}() from {} at line {}",
                function_name, path, line
            ));
        }
        trace
    }

    /// Resolves a dotted exception-class name through the namespace tree;
    /// falls back to the root Exception class.
    pub fn lookup_class_by_full_name(&self, full_name: &str) -> HeapId {
        let mut current = self.root_namespace;
        let mut segments = full_name.split('.').peekable();
        // Skip the root namespace's own name.
        if segments.peek() == Some(&"kestrel") {
            segments.next();
        }
        for segment in segments {
            let ns = match self.heap.data(current) {
                ObjData::Namespace(ns) => ns,
                _ => return self.core.exception,
            };
            let mut found = None;
            for (&name, &value) in &ns.values {
                if self.heap.str(name) == segment {
                    found = Some(value);
                    break;
                }
            }
            match found {
                Some(Value::Obj(id)) => match self.heap.data(id) {
                    ObjData::Namespace(_) => current = id,
                    ObjData::Class(_) => return id,
                    _ => return self.core.exception,
                },
                _ => return self.core.exception,
            }
        }
        self.core.exception
    }

    pub fn create_exception(&mut self, class: HeapId, message: String) -> Value {
        let message_id = self.heap.take_string(message);
        let trace = self.capture_stack_trace();
        let trace_values: Vec<Value> = trace
            .into_iter()
            .map(|entry| Value::Obj(self.heap.take_string(entry)))
            .collect();
        let trace_array = self.heap.alloc(ObjData::Array(trace_values), None);
        let exception = self.heap.alloc(
            ObjData::Exception {
                message: Value::Obj(message_id),
                stacktrace: Value::Obj(trace_array),
            },
            Some(class),
        );
        Value::Obj(exception)
    }

    pub fn throw_named(&mut self, class_full_name: &str, message: String) -> RunResult<()> {
        let class = self.lookup_class_by_full_name(class_full_name);
        let exception = self.create_exception(class, message);
        self.propagate(exception)
    }

    /// Walks frames top-down and each frame's handler stack most-recent
    /// first. A matching catch resumes at its handler address with the frame
    /// restored to the recorded stack height and the exception pushed; a
    /// pending finally runs its exceptional copy. Unwound frames close their
    /// open upvalues. Unwinding stops at the innermost run's frame floor;
    /// the remaining search is delegated upward as `Unwind::Thrown`, which
    /// outer run levels feed back into propagation.
    pub fn propagate(&mut self, exception: Value) -> RunResult<()> {
        loop {
            if self.frames.is_empty() || self.frames.len() < self.run_floor {
                return Err(Unwind::Thrown(exception));
            }
            let fi = self.frames.len() - 1;
            while let Some(handler) = self.frames[fi].handlers.last().copied() {
                if self.instance_of(exception, handler.class) {
                    let base = self.frames[fi].base;
                    self.close_upvalues(base + handler.stack_depth);
                    self.stack.truncate(base + handler.stack_depth);
                    self.push(exception);
                    self.frames[fi].ip = handler.handler_addr as usize;
                    return Ok(());
                }
                self.frames[fi].handlers.pop();
                if handler.finally_addr != u16::MAX {
                    let base = self.frames[fi].base;
                    self.close_upvalues(base + handler.stack_depth);
                    self.stack.truncate(base + handler.stack_depth);
                    self.push(exception);
                    self.frames[fi].ip = handler.finally_addr as usize;
                    return Ok(());
                }
            }
            let base = self.frames[fi].base;
            self.close_upvalues(base);
            self.stack.truncate(base);
            self.frames.pop();
        }
    }

    /// Formats the fatal report for an exception that escaped everything.
    pub fn unhandled(&mut self, exception: Value) -> Unwind {
        let (message, trace) = match exception {
            Value::Obj(id) => match self.heap.data(id) {
                ObjData::Exception { message, stacktrace } => {
                    let class = self.class_of(exception);
                    let class_name = self.class_full_name(class).to_string();
                    let text = match message {
                        Value::Obj(m) => self.heap.str(*m).to_string(),
                        other => other.to_string(),
                    };
                    let trace = match stacktrace {
                        Value::Obj(t) => match self.heap.data(*t) {
                            ObjData::Array(entries) => entries
                                .iter()
                                .filter_map(|v| match v {
                                    Value::Obj(s) => Some(self.heap.str(*s).to_string()),
                                    _ => None,
                                })
                                .collect(),
                            _ => Vec::new(),
                        },
                        _ => Vec::new(),
                    };
                    (format!("{}: {}", class_name, text), trace)
                }
                other => (format!("value of type {}", other.kind_name()), Vec::new()),
            },
            other => (other.to_string(), Vec::new()),
        };
        Unwind::Fatal(RuntimeFatal {
            message,
            stack_trace: trace,
        })
    }

    // ── Upvalues ────────────────────────────────────────────────────────────

    /// Finds or creates the open upvalue for an absolute stack slot; the
    /// list stays sorted by slot, highest first.
    pub fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &id) in self.open_upvalues.iter().enumerate() {
            match self.heap.data(id) {
                ObjData::Upvalue(UpvalueState::Open(existing)) => {
                    if *existing == slot {
                        return id;
                    }
                    if *existing < slot {
                        insert_at = i;
                        break;
                    }
                }
                _ => {}
            }
        }
        let upvalue = self
            .heap
            .alloc(ObjData::Upvalue(UpvalueState::Open(slot)), None);
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from`: the stack slot's value
    /// moves into the upvalue, exactly once per upvalue.
    pub fn close_upvalues(&mut self, from: usize) {
        while let Some(&id) = self.open_upvalues.first() {
            let slot = match self.heap.data(id) {
                ObjData::Upvalue(UpvalueState::Open(slot)) => *slot,
                _ => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.data_mut(id) = ObjData::Upvalue(UpvalueState::Closed(value));
            self.open_upvalues.remove(0);
        }
    }

    // ── Garbage collection ──────────────────────────────────────────────────

    pub fn collect_garbage(&mut self, max_gen: u8) {
        let mut roots: Vec<HeapId> = Vec::with_capacity(self.stack.len() + 64);
        let add_value = |roots: &mut Vec<HeapId>, v: Value| {
            if let Value::Obj(id) = v {
                roots.push(id);
            }
        };

        for &v in &self.stack {
            add_value(&mut roots, v);
        }
        for frame in &self.frames {
            roots.push(frame.closure);
            for handler in &frame.handlers {
                roots.push(handler.class);
            }
        }
        roots.extend(self.open_upvalues.iter().copied());
        for (&name, &v) in &self.builtins {
            roots.push(name);
            add_value(&mut roots, v);
        }
        roots.extend(self.modules.values().copied());
        roots.push(self.root_namespace);
        roots.push(self.current_namespace);
        if self.heap.is_live(self.current_module) {
            roots.push(self.current_module);
        }
        roots.push(self.init_string);
        if let Some(generator) = self.running_generator {
            roots.push(generator);
        }
        let core = self.core;
        for id in [
            core.object, core.class_class, core.trait_class, core.nil, core.bool_class,
            core.number, core.int, core.float, core.string, core.function, core.method,
            core.bound_method, core.array, core.dictionary, core.entry, core.range, core.node,
            core.linked_list, core.namespace, core.module, core.exception, core.generator,
            core.promise, core.timer, core.file, core.random,
        ] {
            roots.push(id);
        }
        // Chunk pools stay live for the life of the VM: constants and the
        // identifier pool (names plus nested function objects).
        for chunk in &self.chunks {
            for &v in chunk.constants.iter().chain(chunk.identifiers.iter()) {
                add_value(&mut roots, v);
            }
        }
        self.shapes.roots(&mut roots);
        self.event_loop.roots(&mut roots);

        self.heap.collect(max_gen, &roots);
    }

    fn gc_safe_point(&mut self) {
        if let Some(gen) = self.heap.should_collect() {
            let gen = gen.min(GEN_TENURED);
            self.collect_garbage(gen);
        }
    }

    // ── Modules ─────────────────────────────────────────────────────────────

    pub fn new_module(&mut self, path: &str) -> HeapId {
        let path_id = self.heap.copy_string(path);
        let module = self.heap.alloc(
            ObjData::Module(ModuleObj {
                path: path_id,
                closure: None,
                val_indexes: IndexMap::new(),
                val_fields: Vec::new(),
                var_indexes: IndexMap::new(),
                var_fields: Vec::new(),
                is_native: false,
            }),
            None,
        );
        self.modules.insert(path.to_string(), module);
        module
    }

    fn module_of(&self, id: HeapId) -> &ModuleObj {
        match self.heap.data(id) {
            ObjData::Module(m) => m,
            other => panic!("expected Module, found {}", other.kind_name()),
        }
    }

    fn module_of_mut(&mut self, id: HeapId) -> &mut ModuleObj {
        match self.heap.data_mut(id) {
            ObjData::Module(m) => m,
            other => panic!("expected Module, found {}", other.kind_name()),
        }
    }

    // ── Value display ───────────────────────────────────────────────────────

    /// Non-reentrant rendering; instances show `<Name instance>` (printing
    /// natives try a user `toString` first).
    pub fn display_value(&self, value: Value) -> String {
        match value {
            Value::Obj(id) => match self.heap.data(id) {
                ObjData::Str(s) => s.chars.to_string(),
                ObjData::Array(elements) => {
                    let parts: Vec<String> =
                        elements.iter().map(|&v| self.display_value_quoted(v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                ObjData::Dict(d) => {
                    let parts: Vec<String> = d
                        .entries
                        .iter()
                        .map(|(k, &v)| {
                            format!(
                                "{}: {}",
                                self.display_value_quoted(k.0),
                                self.display_value_quoted(v)
                            )
                        })
                        .collect();
                    format!("[{}]", parts.join(", "))
                }
                ObjData::Entry { key, value } => format!(
                    "{}: {}",
                    self.display_value_quoted(*key),
                    self.display_value_quoted(*value)
                ),
                ObjData::Range { from, to } => format!("{}..{}", from, to),
                ObjData::Node { element, .. } => self.display_value(*element),
                ObjData::Function(f) => match f.name {
                    Some(name) => format!("<fn {}>", self.heap.str(name)),
                    None => "<script>".to_string(),
                },
                ObjData::Closure(c) => self.display_value(Value::Obj(c.function)),
                ObjData::NativeFunction(f) => format!("<native fn {}>", f.name),
                ObjData::NativeMethod(m) => format!("<native method {}>", m.name),
                ObjData::BoundMethod { method, .. } => self.display_value(*method),
                ObjData::Class(c) => format!("<class {}>", self.heap.str(c.full_name)),
                ObjData::Instance { .. } | ObjData::ValueInstance { .. } => {
                    let class = self.class_of(value);
                    format!("<{} instance>", self.class_name(class))
                }
                ObjData::Namespace(ns) => {
                    format!("<namespace {}>", self.heap.str(ns.full_name))
                }
                ObjData::Module(m) => format!("<module {}>", self.heap.str(m.path)),
                ObjData::Exception { message, .. } => {
                    let class = self.class_of(value);
                    format!(
                        "<{}: {}>",
                        self.class_full_name(class),
                        self.display_value(*message)
                    )
                }
                ObjData::Frame(_) => "<frame>".to_string(),
                ObjData::Generator(_) => "<generator>".to_string(),
                ObjData::Promise(p) => format!("<promise #{}>", p.id),
                ObjData::Timer(_) => "<timer>".to_string(),
                ObjData::File(f) => format!("<file {}>", self.heap.str(f.path)),
                ObjData::Record(_) => "<record>".to_string(),
                ObjData::Upvalue(_) => "<upvalue>".to_string(),
            },
            other => other.to_string(),
        }
    }

    fn display_value_quoted(&self, value: Value) -> String {
        match value {
            Value::Obj(id) => {
                if let ObjData::Str(s) = self.heap.data(id) {
                    return format!("\"{}\"", s.chars);
                }
                self.display_value(value)
            }
            other => other.to_string(),
        }
    }

    // ── Reentrant calls ─────────────────────────────────────────────────────

    /// Calls a callable with arguments from native code or the event loop,
    /// returning its result. Re-enters the dispatch loop under api-depth
    /// tracking.
    pub fn call_function_value(&mut self, callee: Value, args: &[Value]) -> RunResult<Value> {
        self.api_depth += 1;
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        let result = match self.call_value(callee, args.len() as u8) {
            Ok(CallOutcome::Completed) => Ok(self.pop()),
            Ok(CallOutcome::FramePushed) => self.run(self.frames.len()),
            Err(e) => Err(e),
        };
        self.api_depth -= 1;
        result
    }

    /// Calls `method` with an explicit receiver in slot zero.
    pub fn call_method_value(
        &mut self,
        receiver: Value,
        method: Value,
        args: &[Value],
    ) -> RunResult<Value> {
        self.api_depth += 1;
        self.push(receiver);
        for &arg in args {
            self.push(arg);
        }
        let result = match self.call_method(method, args.len() as u8) {
            Ok(CallOutcome::Completed) => Ok(self.pop()),
            Ok(CallOutcome::FramePushed) => self.run(self.frames.len()),
            Err(e) => Err(e),
        };
        self.api_depth -= 1;
        result
    }

    // ── Calls ───────────────────────────────────────────────────────────────

    fn call_closure(&mut self, closure: HeapId, argc: u8) -> RunResult<CallOutcome> {
        let (is_generator, is_async, arity, chunk) = {
            let c = match self.heap.data(closure) {
                ObjData::Closure(c) => c,
                other => panic!("call_closure on {}", other.kind_name()),
            };
            match self.heap.data(c.function) {
                ObjData::Function(f) => (f.is_generator, f.is_async, f.arity, f.chunk),
                other => panic!("closure wraps {}", other.kind_name()),
            }
        };

        let mut argc = argc as usize;
        if arity < 0 {
            // Variadic: every argument packs into one array.
            let base = self.stack.len() - argc;
            let packed: Vec<Value> = self.stack[base..].to_vec();
            self.stack.truncate(base);
            let array = self.heap.alloc(ObjData::Array(packed), None);
            self.push(Value::Obj(array));
            argc = 1;
        } else if arity as usize != argc {
            self.throw_named(
                EXC_ARGUMENT,
                format!("Expected {} arguments but got {}.", arity, argc),
            )?;
            return Ok(CallOutcome::FramePushed);
        }

        if is_generator && !is_async {
            let generator = self.make_generator(closure, argc);
            self.push(Value::Obj(generator));
            return Ok(CallOutcome::Completed);
        }
        if is_async {
            let generator = self.make_generator(closure, argc);
            let promise = self.new_pending_promise();
            self.push(Value::Obj(promise));
            self.drive_async(generator, Some(promise), ResumeInput::Value(Value::Nil))?;
            return Ok(CallOutcome::Completed);
        }

        if self.frames.len() >= FRAMES_MAX {
            self.throw_named(EXC_STACK_OVERFLOW, "Stack overflow.".to_string())?;
            return Ok(CallOutcome::FramePushed);
        }
        let base = self.stack.len() - argc - 1;
        if base + SLOTS_PER_FRAME > STACK_MAX {
            self.throw_named(EXC_STACK_OVERFLOW, "Value stack overflow.".to_string())?;
            return Ok(CallOutcome::FramePushed);
        }
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            base,
            handlers: Vec::new(),
        });
        Ok(CallOutcome::FramePushed)
    }

    fn call_native_function(&mut self, native: HeapId, argc: u8) -> RunResult<CallOutcome> {
        let (arity, func, name) = match self.heap.data(native) {
            ObjData::NativeFunction(f) => (f.arity, f.func, f.name.clone()),
            other => panic!("call_native_function on {}", other.kind_name()),
        };
        let argc = argc as usize;
        if arity >= 0 && arity as usize != argc {
            self.throw_named(
                EXC_ARGUMENT,
                format!(
                    "Function {} expects {} argument(s) but got {}.",
                    name, arity, argc
                ),
            )?;
            return Ok(CallOutcome::FramePushed);
        }
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base - 1);
        match func(self, &args) {
            Ok(result) => {
                self.push(result);
                Ok(CallOutcome::Completed)
            }
            Err(e) => {
                self.raise_native_error(e)?;
                Ok(CallOutcome::FramePushed)
            }
        }
    }

    fn call_native_method(
        &mut self,
        native: HeapId,
        receiver: Value,
        argc: u8,
    ) -> RunResult<CallOutcome> {
        let (arity, func, name) = match self.heap.data(native) {
            ObjData::NativeMethod(m) => (m.arity, m.func, m.name.clone()),
            other => panic!("call_native_method on {}", other.kind_name()),
        };
        let argc = argc as usize;
        if arity >= 0 && arity as usize != argc {
            self.throw_named(
                EXC_ARGUMENT,
                format!(
                    "Method {} expects {} argument(s) but got {}.",
                    name, arity, argc
                ),
            )?;
            return Ok(CallOutcome::FramePushed);
        }
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[base..].to_vec();
        // Pop the arguments and the receiver slot.
        self.stack.truncate(base - 1);
        match func(self, receiver, &args) {
            Ok(result) => {
                self.push(result);
                Ok(CallOutcome::Completed)
            }
            Err(e) => {
                self.raise_native_error(e)?;
                Ok(CallOutcome::FramePushed)
            }
        }
    }

    pub fn raise_native_error(&mut self, error: NativeError) -> RunResult<()> {
        match error {
            NativeError::Throw { class, message } => self.throw_named(class, message),
            NativeError::Propagate(exception) => self.propagate(exception),
        }
    }

    /// Finds the nearest class in the chain carrying an `Init` interceptor.
    fn find_init_interceptor(&self, class: HeapId) -> Option<Value> {
        let mut current = Some(class);
        while let Some(id) = current {
            let data = self.class_data(id);
            if let Some(&init) = data.interceptors.get(&InterceptorKind::Init) {
                return Some(init);
            }
            current = data.superclass;
        }
        None
    }

    fn find_primitive_ancestor(&self, class: HeapId) -> Option<HeapId> {
        let primitives = [
            self.core.int,
            self.core.float,
            self.core.string,
            self.core.bool_class,
            self.core.number,
        ];
        let mut current = self.class_data(class).superclass;
        while let Some(id) = current {
            if primitives.contains(&id) {
                return Some(id);
            }
            current = self.class_data(id).superclass;
        }
        None
    }

    fn call_class(&mut self, class: HeapId, argc: u8) -> RunResult<CallOutcome> {
        // Native construction goes through the INIT interceptor.
        if let Some(init) = self.find_init_interceptor(class) {
            if let Value::Obj(native) = init {
                return self.call_native_method(native, Value::Obj(class), argc);
            }
        }

        // A user class under a boxed primitive produces a value instance.
        if self.find_primitive_ancestor(class).is_some() {
            if argc != 1 {
                self.throw_named(
                    EXC_ARGUMENT,
                    "Boxed value constructor expects exactly 1 argument.".to_string(),
                )?;
                return Ok(CallOutcome::FramePushed);
            }
            let value = self.pop();
            self.pop();
            let boxed = self
                .heap
                .alloc(ObjData::ValueInstance { value }, Some(class));
            self.push(Value::Obj(boxed));
            return Ok(CallOutcome::Completed);
        }

        let instance = self
            .heap
            .alloc(ObjData::Instance { fields: Vec::new() }, Some(class));
        self.set_top(argc as usize, Value::Obj(instance));

        let init_name = self.init_string;
        let init = self.class_data(class).methods.get(&init_name).copied();
        match init {
            Some(init_method) => self.call_method(init_method, argc),
            None => {
                if argc != 0 {
                    self.throw_named(
                        EXC_ARGUMENT,
                        format!("Expected 0 arguments but got {}.", argc),
                    )?;
                    return Ok(CallOutcome::FramePushed);
                }
                Ok(CallOutcome::Completed)
            }
        }
    }

    /// Dispatches a call with `argc` arguments above the callee slot.
    pub fn call_value(&mut self, callee: Value, argc: u8) -> RunResult<CallOutcome> {
        let Value::Obj(id) = callee else {
            self.throw_named(
                EXC_TYPE,
                "Can only call functions and classes.".to_string(),
            )?;
            return Ok(CallOutcome::FramePushed);
        };
        enum Kind {
            Closure,
            NativeFunction,
            NativeMethod,
            Bound { receiver: Value, method: Value },
            Class,
            Other,
        }
        let kind = match self.heap.data(id) {
            ObjData::Closure(_) => Kind::Closure,
            ObjData::NativeFunction(_) => Kind::NativeFunction,
            ObjData::NativeMethod(_) => Kind::NativeMethod,
            ObjData::BoundMethod { receiver, method } => Kind::Bound {
                receiver: *receiver,
                method: *method,
            },
            ObjData::Class(_) => Kind::Class,
            _ => Kind::Other,
        };
        match kind {
            Kind::Closure => self.call_closure(id, argc),
            Kind::NativeFunction => self.call_native_function(id, argc),
            Kind::NativeMethod => {
                let receiver = self.peek(argc as usize);
                self.call_native_method(id, receiver, argc)
            }
            Kind::Bound { receiver, method } => {
                self.set_top(argc as usize, receiver);
                self.call_method(method, argc)
            }
            Kind::Class => self.call_class(id, argc),
            Kind::Other => {
                self.throw_named(
                    EXC_TYPE,
                    "Can only call functions and classes.".to_string(),
                )?;
                Ok(CallOutcome::FramePushed)
            }
        }
    }

    /// Calls a method value whose receiver already sits in the callee slot.
    pub fn call_method(&mut self, method: Value, argc: u8) -> RunResult<CallOutcome> {
        let Value::Obj(id) = method else {
            self.throw_named(EXC_TYPE, "Method is not callable.".to_string())?;
            return Ok(CallOutcome::FramePushed);
        };
        enum Kind {
            Closure,
            Native,
            Bound { receiver: Value, method: Value },
            Other,
        }
        let kind = match self.heap.data(id) {
            ObjData::Closure(_) => Kind::Closure,
            ObjData::NativeMethod(_) | ObjData::NativeFunction(_) => Kind::Native,
            ObjData::BoundMethod { receiver, method } => Kind::Bound {
                receiver: *receiver,
                method: *method,
            },
            _ => Kind::Other,
        };
        match kind {
            Kind::Closure => self.call_closure(id, argc),
            Kind::Native => match self.heap.data(id) {
                ObjData::NativeMethod(_) => {
                    let receiver = self.peek(argc as usize);
                    self.call_native_method(id, receiver, argc)
                }
                _ => self.call_native_function(id, argc),
            },
            Kind::Bound { receiver, method } => {
                self.set_top(argc as usize, receiver);
                self.call_method(method, argc)
            }
            Kind::Other => {
                self.throw_named(EXC_TYPE, "Method is not callable.".to_string())?;
                Ok(CallOutcome::FramePushed)
            }
        }
    }

    /// Method dispatch for INVOKE: looks `name` up in the receiver's class,
    /// preferring the method inline cache keyed by behavior id. Instance
    /// fields shadow methods.
    fn invoke(&mut self, name: Value, cache_site: usize, argc: u8) -> RunResult<CallOutcome> {
        let receiver = self.peek(argc as usize);
        let name_id = match name {
            Value::Obj(id) => id,
            _ => panic!("method name is not a string"),
        };

        // A field holding a callable shadows the method table.
        if let Value::Obj(rid) = receiver {
            let is_instance = matches!(self.heap.data(rid), ObjData::Instance { .. });
            if is_instance {
                let shape = self.heap.header(rid).shape_id;
                if let Some(slot) = self.shapes.index_of(shape, name_id) {
                    let field = match self.heap.data(rid) {
                        ObjData::Instance { fields } => fields[slot],
                        _ => Value::Nil,
                    };
                    self.set_top(argc as usize, field);
                    return self.call_value(field, argc);
                }
            }
        }

        let class = self.class_of(receiver);
        let method = self.lookup_method_cached(class, name_id, cache_site);
        match method {
            Some(method) => self.call_method(method, argc),
            None => {
                // UNDEFINED_INVOKE interceptor gets a chance before failure.
                let interceptor = self
                    .class_data(class)
                    .interceptors
                    .get(&InterceptorKind::UndefinedInvoke)
                    .copied();
                if let Some(Value::Obj(native)) = interceptor {
                    return self.call_native_method(native, receiver, argc);
                }
                let class_name = self.class_name(class).to_string();
                let method_name = self.heap.str(name_id).to_string();
                self.throw_named(
                    EXC_REFERENCE,
                    format!("Undefined method '{}' on {}.", method_name, class_name),
                )?;
                Ok(CallOutcome::FramePushed)
            }
        }
    }

    fn lookup_method_cached(
        &mut self,
        class: HeapId,
        name: HeapId,
        cache_site: usize,
    ) -> Option<Value> {
        let behavior_id = self.class_data(class).behavior_id;
        let chunk = self.current_chunk_index();
        let cache = self.chunks[chunk].caches[cache_site];
        if cache.kind == CacheKind::Method && cache.id == behavior_id {
            if let Some((_, &method)) = self
                .class_data(class)
                .methods
                .get_index(cache.index as usize)
            {
                return Some(method);
            }
        }
        let found = self.class_data(class).methods.get_index_of(&name);
        match found {
            Some(index) => {
                self.chunks[chunk].caches[cache_site] = InlineCache {
                    kind: CacheKind::Method,
                    id: behavior_id,
                    index: index as u32,
                };
                self.class_data(class)
                    .methods
                    .get_index(index)
                    .map(|(_, &m)| m)
            }
            None => None,
        }
    }

    pub fn lookup_method(&self, class: HeapId, name: HeapId) -> Option<Value> {
        self.class_data(class).methods.get(&name).copied()
    }

    fn bind_method(&mut self, class: HeapId, name: HeapId, receiver: Value) -> Option<Value> {
        let method = self.lookup_method(class, name)?;
        let bound = self.heap.alloc(
            ObjData::BoundMethod {
                receiver,
                method,
            },
            None,
        );
        Some(Value::Obj(bound))
    }

    // ── Property access ─────────────────────────────────────────────────────

    fn get_property(
        &mut self,
        name: Value,
        cache_site: usize,
        optional: bool,
    ) -> RunResult<()> {
        let receiver = self.peek(0);
        let name_id = match name {
            Value::Obj(id) => id,
            _ => panic!("property name is not a string"),
        };

        if receiver.is_nil() {
            if optional {
                self.set_top(0, Value::Nil);
                return Ok(());
            }
            let property = self.heap.str(name_id).to_string();
            return self.throw_named(
                EXC_TYPE,
                format!("Cannot read property '{}' of nil.", property),
            );
        }

        if let Value::Obj(id) = receiver {
            enum Target {
                Instance,
                Class,
                Exception,
                Entry,
                RangeObj,
                NamespaceObj,
                Other,
            }
            let target = match self.heap.data(id) {
                ObjData::Instance { .. } => Target::Instance,
                ObjData::Class(_) => Target::Class,
                ObjData::Exception { .. } => Target::Exception,
                ObjData::Entry { .. } => Target::Entry,
                ObjData::Range { .. } => Target::RangeObj,
                ObjData::Namespace(_) => Target::NamespaceObj,
                _ => Target::Other,
            };
            match target {
                Target::Instance => {
                    let shape = self.heap.header(id).shape_id;
                    let chunk = self.current_chunk_index();
                    let cache = self.chunks[chunk].caches[cache_site];
                    if cache.kind == CacheKind::IVar && cache.id == shape {
                        if let ObjData::Instance { fields } = self.heap.data(id) {
                            let value = fields[cache.index as usize];
                            self.set_top(0, value);
                            return Ok(());
                        }
                    }
                    if let Some(slot) = self.shapes.index_of(shape, name_id) {
                        self.chunks[chunk].caches[cache_site] = InlineCache {
                            kind: CacheKind::IVar,
                            id: shape,
                            index: slot as u32,
                        };
                        if let ObjData::Instance { fields } = self.heap.data(id) {
                            let value = fields[slot];
                            self.set_top(0, value);
                            return Ok(());
                        }
                    }
                }
                Target::Class => {
                    let behavior_id = self.class_data(id).behavior_id;
                    let chunk = self.current_chunk_index();
                    let cache = self.chunks[chunk].caches[cache_site];
                    if cache.kind == CacheKind::CVar && cache.id == behavior_id {
                        let value = self.class_data(id).class_vars[cache.index as usize];
                        self.set_top(0, value);
                        return Ok(());
                    }
                    if let Some(&slot) = self.class_data(id).class_var_indexes.get(&name_id) {
                        self.chunks[chunk].caches[cache_site] = InlineCache {
                            kind: CacheKind::CVar,
                            id: behavior_id,
                            index: slot as u32,
                        };
                        let value = self.class_data(id).class_vars[slot];
                        self.set_top(0, value);
                        return Ok(());
                    }
                }
                Target::Exception => {
                    let property = self.heap.str(name_id);
                    let value = match self.heap.data(id) {
                        ObjData::Exception { message, stacktrace } => match property {
                            "message" => Some(*message),
                            "stacktrace" => Some(*stacktrace),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(value) = value {
                        self.set_top(0, value);
                        return Ok(());
                    }
                }
                Target::Entry => {
                    let property = self.heap.str(name_id);
                    let value = match self.heap.data(id) {
                        ObjData::Entry { key, value } => match property {
                            "key" => Some(*key),
                            "value" => Some(*value),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(value) = value {
                        self.set_top(0, value);
                        return Ok(());
                    }
                }
                Target::RangeObj => {
                    let property = self.heap.str(name_id);
                    let value = match self.heap.data(id) {
                        ObjData::Range { from, to } => match property {
                            "from" => Some(Value::Int(*from)),
                            "to" => Some(Value::Int(*to)),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(value) = value {
                        self.set_top(0, value);
                        return Ok(());
                    }
                }
                Target::NamespaceObj => {
                    let value = match self.heap.data(id) {
                        ObjData::Namespace(ns) => ns.values.get(&name_id).copied(),
                        _ => None,
                    };
                    if let Some(value) = value {
                        self.set_top(0, value);
                        return Ok(());
                    }
                }
                Target::Other => {}
            }
        }

        // Fall back to binding a method of the receiver's class.
        let class = self.class_of(receiver);
        if let Some(bound) = self.bind_method(class, name_id, receiver) {
            self.set_top(0, bound);
            return Ok(());
        }
        // UNDEFINED_GET interceptor.
        let interceptor = self
            .class_data(class)
            .interceptors
            .get(&InterceptorKind::UndefinedGet)
            .copied();
        if let Some(Value::Obj(native)) = interceptor {
            let name_value = Value::Obj(name_id);
            self.push(name_value);
            return match self.call_native_method(native, receiver, 1) {
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
        }
        if optional {
            self.set_top(0, Value::Nil);
            return Ok(());
        }
        let property = self.heap.str(name_id).to_string();
        let class_name = self.class_name(class).to_string();
        self.throw_named(
            EXC_REFERENCE,
            format!("Undefined property '{}' on {}.", property, class_name),
        )
    }

    fn set_property(&mut self, name: Value, cache_site: usize) -> RunResult<()> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let name_id = match name {
            Value::Obj(id) => id,
            _ => panic!("property name is not a string"),
        };

        let Value::Obj(id) = receiver else {
            return self.throw_named(
                EXC_TYPE,
                "Only instances and classes have settable properties.".to_string(),
            );
        };

        enum Target {
            Instance,
            Class,
            Exception,
            Other,
        }
        let target = match self.heap.data(id) {
            ObjData::Instance { .. } => Target::Instance,
            ObjData::Class(_) => Target::Class,
            ObjData::Exception { .. } => Target::Exception,
            _ => Target::Other,
        };
        match target {
            Target::Instance => {
                let shape = self.heap.header(id).shape_id;
                let chunk = self.current_chunk_index();
                let cache = self.chunks[chunk].caches[cache_site];
                if cache.kind == CacheKind::IVar && cache.id == shape {
                    if let ObjData::Instance { fields } = self.heap.data_mut(id) {
                        fields[cache.index as usize] = value;
                    }
                } else if let Some(slot) = self.shapes.index_of(shape, name_id) {
                    self.chunks[chunk].caches[cache_site] = InlineCache {
                        kind: CacheKind::IVar,
                        id: shape,
                        index: slot as u32,
                    };
                    if let ObjData::Instance { fields } = self.heap.data_mut(id) {
                        fields[slot] = value;
                    }
                } else {
                    // New field: transition to the child shape.
                    let (child, slot) = self.shapes.transition(shape, name_id);
                    self.heap.header_mut(id).shape_id = child;
                    if let ObjData::Instance { fields } = self.heap.data_mut(id) {
                        if slot == fields.len() {
                            fields.push(value);
                        } else {
                            while fields.len() <= slot {
                                fields.push(Value::Nil);
                            }
                            fields[slot] = value;
                        }
                    }
                }
                self.heap.write_barrier(id, value);
            }
            Target::Class => {
                let behavior_id = self.class_data(id).behavior_id;
                let chunk = self.current_chunk_index();
                let cache = self.chunks[chunk].caches[cache_site];
                let existing = if cache.kind == CacheKind::CVar && cache.id == behavior_id {
                    Some(cache.index as usize)
                } else {
                    self.class_data(id).class_var_indexes.get(&name_id).copied()
                };
                match existing {
                    Some(slot) => {
                        self.chunks[chunk].caches[cache_site] = InlineCache {
                            kind: CacheKind::CVar,
                            id: behavior_id,
                            index: slot as u32,
                        };
                        self.class_data_mut(id).class_vars[slot] = value;
                    }
                    None => {
                        let class = self.class_data_mut(id);
                        let slot = class.class_vars.len();
                        class.class_var_indexes.insert(name_id, slot);
                        class.class_vars.push(value);
                    }
                }
                self.heap.write_barrier(id, value);
            }
            Target::Exception => {
                let property = self.heap.str(name_id).to_string();
                match self.heap.data_mut(id) {
                    ObjData::Exception { message, stacktrace } => match property.as_str() {
                        "message" => *message = value,
                        "stacktrace" => *stacktrace = value,
                        _ => {
                            return self.throw_named(
                                EXC_REFERENCE,
                                format!("Undefined property '{}' on Exception.", property),
                            )
                        }
                    },
                    _ => {}
                }
                self.heap.write_barrier(id, value);
            }
            Target::Other => {
                // UNDEFINED_SET interceptor, then failure.
                let class = self.class_of(receiver);
                let interceptor = self
                    .class_data(class)
                    .interceptors
                    .get(&InterceptorKind::UndefinedSet)
                    .copied();
                if let Some(Value::Obj(native)) = interceptor {
                    let args_value = self.pop();
                    self.pop();
                    let name_value = Value::Obj(name_id);
                    self.push(receiver);
                    self.push(name_value);
                    self.push(args_value);
                    self.call_native_method(native, receiver, 2)?;
                    return Ok(());
                }
                return self.throw_named(
                    EXC_TYPE,
                    "Only instances and classes have settable properties.".to_string(),
                );
            }
        }
        // Pop value and receiver; the assigned value is the result.
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    // ── Globals ─────────────────────────────────────────────────────────────

    fn get_global(&mut self, name: Value, cache_site: usize) -> RunResult<()> {
        let name_id = match name {
            Value::Obj(id) => id,
            _ => panic!("global name is not a string"),
        };
        let module = self.current_module_of_frame();
        let chunk = self.current_chunk_index();
        let cache = self.chunks[chunk].caches[cache_site];

        let value = match cache.kind {
            CacheKind::GVal if cache.id == cache_site as u32 => {
                Some(self.module_of(module).val_fields[cache.index as usize])
            }
            CacheKind::GVar if cache.id == cache_site as u32 => {
                Some(self.module_of(module).var_fields[cache.index as usize])
            }
            _ => None,
        };
        if let Some(value) = value {
            self.push(value);
            return Ok(());
        }

        if let Some(&slot) = self.module_of(module).val_indexes.get(&name_id) {
            self.chunks[chunk].caches[cache_site] = InlineCache {
                kind: CacheKind::GVal,
                id: cache_site as u32,
                index: slot as u32,
            };
            let value = self.module_of(module).val_fields[slot];
            self.push(value);
            return Ok(());
        }
        if let Some(&slot) = self.module_of(module).var_indexes.get(&name_id) {
            self.chunks[chunk].caches[cache_site] = InlineCache {
                kind: CacheKind::GVar,
                id: cache_site as u32,
                index: slot as u32,
            };
            let value = self.module_of(module).var_fields[slot];
            self.push(value);
            return Ok(());
        }
        // Builtins copy into the module's immutable bindings on first use so
        // later reads hit the GVAL cache.
        if let Some(&value) = self.builtins.get(&name_id) {
            let module_obj = self.module_of_mut(module);
            let slot = module_obj.val_fields.len();
            module_obj.val_indexes.insert(name_id, slot);
            module_obj.val_fields.push(value);
            self.chunks[chunk].caches[cache_site] = InlineCache {
                kind: CacheKind::GVal,
                id: cache_site as u32,
                index: slot as u32,
            };
            self.push(value);
            return Ok(());
        }
        let variable = self.heap.str(name_id).to_string();
        self.throw_named(EXC_REFERENCE, format!("Undefined variable '{}'.", variable))
    }

    fn set_global(&mut self, name: Value, cache_site: usize) -> RunResult<()> {
        let name_id = match name {
            Value::Obj(id) => id,
            _ => panic!("global name is not a string"),
        };
        let module = self.current_module_of_frame();
        let chunk = self.current_chunk_index();
        let cache = self.chunks[chunk].caches[cache_site];
        let value = self.peek(0);

        if cache.kind == CacheKind::GVar && cache.id == cache_site as u32 {
            self.module_of_mut(module).var_fields[cache.index as usize] = value;
            self.heap.write_barrier(module, value);
            return Ok(());
        }
        if let Some(&slot) = self.module_of(module).var_indexes.get(&name_id) {
            self.chunks[chunk].caches[cache_site] = InlineCache {
                kind: CacheKind::GVar,
                id: cache_site as u32,
                index: slot as u32,
            };
            self.module_of_mut(module).var_fields[slot] = value;
            self.heap.write_barrier(module, value);
            return Ok(());
        }
        let variable = self.heap.str(name_id).to_string();
        if self.module_of(module).val_indexes.contains_key(&name_id)
            || self.builtins.contains_key(&name_id)
        {
            return self.throw_named(
                EXC_TYPE,
                format!("Cannot assign to immutable variable '{}'.", variable),
            );
        }
        self.throw_named(EXC_REFERENCE, format!("Undefined variable '{}'.", variable))
    }

    // ── Binary operations ───────────────────────────────────────────────────

    fn binary_add(&mut self) -> RunResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match x.checked_add(y) {
                Some(n) => Value::Int(n),
                // int32 overflow promotes to float.
                None => Value::Float(x as f64 + y as f64),
            },
            (Value::Int(x), Value::Float(y)) => Value::Float(x as f64 + y),
            (Value::Float(x), Value::Int(y)) => Value::Float(x + y as f64),
            (Value::Float(x), Value::Float(y)) => Value::Float(x + y),
            (Value::Obj(x), Value::Obj(y)) => {
                let concatenated = match (self.heap.data(x), self.heap.data(y)) {
                    (ObjData::Str(sa), ObjData::Str(sb)) => {
                        Some(format!("{}{}", sa.chars, sb.chars))
                    }
                    _ => None,
                };
                match concatenated {
                    Some(s) => Value::Obj(self.heap.take_string(s)),
                    None => {
                        return self.throw_named(
                            EXC_TYPE,
                            "Operands must be two numbers or two strings.".to_string(),
                        )
                    }
                }
            }
            _ => {
                return self.throw_named(
                    EXC_TYPE,
                    "Operands must be two numbers or two strings.".to_string(),
                )
            }
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn binary_numeric(&mut self, op: OpCode) -> RunResult<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return self.throw_named(EXC_TYPE, "Operands must be numbers.".to_string());
        }
        let result = match op {
            OpCode::Subtract => match (a, b) {
                (Value::Int(x), Value::Int(y)) => match x.checked_sub(y) {
                    Some(n) => Value::Int(n),
                    None => Value::Float(x as f64 - y as f64),
                },
                _ => Value::Float(a.as_f64() - b.as_f64()),
            },
            OpCode::Multiply => match (a, b) {
                (Value::Int(x), Value::Int(y)) => match x.checked_mul(y) {
                    Some(n) => Value::Int(n),
                    None => Value::Float(x as f64 * y as f64),
                },
                _ => Value::Float(a.as_f64() * b.as_f64()),
            },
            OpCode::Divide => {
                if b.as_f64() == 0.0 {
                    return self
                        .throw_named(EXC_ARITHMETIC, "Division by zero.".to_string());
                }
                Value::Float(a.as_f64() / b.as_f64())
            }
            OpCode::Modulo => match (a, b) {
                (Value::Int(x), Value::Int(y)) => {
                    if y == 0 {
                        return self
                            .throw_named(EXC_ARITHMETIC, "Division by zero.".to_string());
                    }
                    Value::Int(x.wrapping_rem(y))
                }
                _ => Value::Float(a.as_f64() % b.as_f64()),
            },
            OpCode::Greater => Value::Bool(a.as_f64() > b.as_f64()),
            OpCode::Less => Value::Bool(a.as_f64() < b.as_f64()),
            _ => unreachable!("non-numeric opcode in binary_numeric"),
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn subscript_get(&mut self, optional: bool) -> RunResult<()> {
        let index = self.peek(0);
        let receiver = self.peek(1);
        if receiver.is_nil() && optional {
            self.pop();
            self.pop();
            self.push(Value::Nil);
            return Ok(());
        }
        let Value::Obj(id) = receiver else {
            return self.throw_named(EXC_TYPE, "Value does not support subscripts.".to_string());
        };
        enum Out {
            Value(Value),
            BadIndex(String),
            NotSubscriptable,
            MakeChar(char),
        }
        let out = match self.heap.data(id) {
            ObjData::Array(elements) => match index {
                Value::Int(i) => {
                    if i >= 0 && (i as usize) < elements.len() {
                        Out::Value(elements[i as usize])
                    } else {
                        Out::BadIndex(format!(
                            "Array index {} out of bounds for length {}.",
                            i,
                            elements.len()
                        ))
                    }
                }
                _ => Out::BadIndex("Array index must be an integer.".to_string()),
            },
            ObjData::Str(s) => match index {
                Value::Int(i) => {
                    let ch = s.chars.chars().nth(i.max(0) as usize);
                    match ch {
                        Some(ch) if i >= 0 => Out::MakeChar(ch),
                        _ => Out::BadIndex(format!(
                            "String index {} out of bounds.",
                            i
                        )),
                    }
                }
                _ => Out::BadIndex("String index must be an integer.".to_string()),
            },
            ObjData::Dict(d) => match index {
                Value::Obj(key) if matches!(self.heap.data(key), ObjData::Str(_)) => {
                    Out::Value(d.entries.get(&DictKey(index)).copied().unwrap_or(Value::Nil))
                }
                _ => Out::BadIndex("Dictionary key must be a string.".to_string()),
            },
            _ => Out::NotSubscriptable,
        };
        match out {
            Out::Value(value) => {
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Out::MakeChar(ch) => {
                let s = self.heap.copy_string(&ch.to_string());
                self.pop();
                self.pop();
                self.push(Value::Obj(s));
                Ok(())
            }
            Out::BadIndex(message) => self.throw_named(EXC_INDEX, message),
            Out::NotSubscriptable => {
                self.throw_named(EXC_TYPE, "Value does not support subscripts.".to_string())
            }
        }
    }

    fn subscript_set(&mut self) -> RunResult<()> {
        let value = self.peek(0);
        let index = self.peek(1);
        let receiver = self.peek(2);
        let Value::Obj(id) = receiver else {
            return self.throw_named(EXC_TYPE, "Value does not support subscripts.".to_string());
        };
        enum Out {
            Ok,
            BadIndex(String),
            NotSubscriptable,
        }
        let is_string_key = match index {
            Value::Obj(key) => matches!(self.heap.data(key), ObjData::Str(_)),
            _ => false,
        };
        let out = match self.heap.data_mut(id) {
            ObjData::Array(elements) => match index {
                Value::Int(i) => {
                    if i >= 0 && (i as usize) < elements.len() {
                        elements[i as usize] = value;
                        Out::Ok
                    } else {
                        let len = elements.len();
                        Out::BadIndex(format!(
                            "Array index {} out of bounds for length {}.",
                            i, len
                        ))
                    }
                }
                _ => Out::BadIndex("Array index must be an integer.".to_string()),
            },
            ObjData::Dict(d) => {
                if is_string_key {
                    d.entries.insert(DictKey(index), value);
                    Out::Ok
                } else {
                    Out::BadIndex("Dictionary key must be a string.".to_string())
                }
            }
            _ => Out::NotSubscriptable,
        };
        match out {
            Out::Ok => {
                self.heap.write_barrier(id, value);
                if let Value::Obj(_) = index {
                    self.heap.write_barrier(id, index);
                }
                self.pop();
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Out::BadIndex(message) => self.throw_named(EXC_INDEX, message),
            Out::NotSubscriptable => {
                self.throw_named(EXC_TYPE, "Value does not support subscripts.".to_string())
            }
        }
    }

    // ── Class definition opcodes ────────────────────────────────────────────

    /// Publishes a class or namespace value under the current namespace.
    fn publish_to_namespace(&mut self, name: HeapId, value: Value) {
        let namespace = self.current_namespace;
        if let ObjData::Namespace(ns) = self.heap.data_mut(namespace) {
            ns.values.insert(name, value);
        }
        if let Value::Obj(id) = value {
            self.heap.write_barrier(namespace, Value::Obj(id));
        }
    }

    fn define_behavior(&mut self, name: Value, kind: BehaviorKind) -> RunResult<()> {
        let name_id = match name {
            Value::Obj(id) => id,
            _ => panic!("behavior name is not a string"),
        };
        let short = self.heap.str(name_id).to_string();
        let ns_full = match self.heap.data(self.current_namespace) {
            ObjData::Namespace(ns) => self.heap.str(ns.full_name).to_string(),
            _ => "kestrel".to_string(),
        };
        let full = format!("{}.{}", ns_full, short);
        let class = self.create_class(&short, &full, kind, false);
        self.publish_to_namespace(name_id, Value::Obj(class));
        self.push(Value::Obj(class));
        Ok(())
    }

    /// INHERIT: stack is [class, superclass]; copies the superclass's
    /// methods (and its metaclass's methods) into the class in one pass.
    fn inherit(&mut self) -> RunResult<()> {
        let superclass_value = self.peek(0);
        let class_value = self.peek(1);
        let (Value::Obj(superclass), Value::Obj(class)) = (superclass_value, class_value) else {
            return self.throw_named(EXC_TYPE, "Superclass must be a class.".to_string());
        };
        let valid = matches!(
            self.heap.data(superclass),
            ObjData::Class(c) if c.kind == BehaviorKind::Standard
        );
        if !valid {
            return self.throw_named(EXC_TYPE, "Superclass must be a class.".to_string());
        }

        let methods: Vec<(HeapId, Value)> = self
            .class_data(superclass)
            .methods
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect();
        let traits = self.class_data(superclass).traits.clone();
        {
            let class_obj = self.class_data_mut(class);
            class_obj.superclass = Some(superclass);
            for (name, method) in methods {
                class_obj.methods.insert(name, method);
            }
            class_obj.traits = traits;
        }
        self.heap.write_barrier(class, Value::Obj(superclass));

        // Class-side inheritance: the metaclass chains to the superclass's
        // metaclass and copies its methods.
        let meta = self.heap.header(class).class;
        let super_meta = self.heap.header(superclass).class;
        if let (Some(meta), Some(super_meta)) = (meta, super_meta) {
            let meta_methods: Vec<(HeapId, Value)> = self
                .class_data(super_meta)
                .methods
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect();
            let meta_obj = self.class_data_mut(meta);
            meta_obj.superclass = Some(super_meta);
            for (name, method) in meta_methods {
                meta_obj.methods.insert(name, method);
            }
        }
        Ok(())
    }

    /// IMPLEMENT n: pops n traits; the class is at the new stack top.
    /// Trait methods override inherited methods, may not collide with an
    /// earlier trait in the same application, and are themselves overridden
    /// by the class's own methods (emitted afterwards).
    fn implement_traits(&mut self, count: u8) -> RunResult<()> {
        let count = count as usize;
        let base = self.stack.len() - count;
        let traits: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);
        let class_value = self.peek(0);
        let Value::Obj(class) = class_value else {
            return self.throw_named(EXC_TYPE, "Traits apply to classes.".to_string());
        };

        let mut fresh: Vec<HeapId> = Vec::new();
        for trait_value in traits {
            let Value::Obj(trait_id) = trait_value else {
                return self.throw_named(EXC_TYPE, "Can only apply traits.".to_string());
            };
            let is_trait = matches!(
                self.heap.data(trait_id),
                ObjData::Class(c) if c.kind == BehaviorKind::Trait
            );
            if !is_trait {
                return self.throw_named(EXC_TYPE, "Can only apply traits.".to_string());
            }
            let methods: Vec<(HeapId, Value)> = self
                .class_data(trait_id)
                .methods
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect();
            for (name, method) in methods {
                let collides = {
                    let class_obj = self.class_data(class);
                    fresh.iter().any(|&earlier| {
                        self.class_data(earlier).methods.contains_key(&name)
                    }) && class_obj.methods.contains_key(&name)
                };
                if collides {
                    let method_name = self.heap.str(name).to_string();
                    return self.throw_named(
                        EXC_TYPE,
                        format!(
                            "Conflicting definitions of '{}' between applied traits.",
                            method_name
                        ),
                    );
                }
                self.class_data_mut(class).methods.insert(name, method);
                self.heap.write_barrier(class, method);
            }
            self.class_data_mut(class).traits.push(trait_id);
            fresh.push(trait_id);
        }
        Ok(())
    }

    // ── Namespaces ──────────────────────────────────────────────────────────

    fn namespace_child(&mut self, parent: HeapId, name: HeapId) -> HeapId {
        let existing = match self.heap.data(parent) {
            ObjData::Namespace(ns) => ns.values.get(&name).copied(),
            _ => None,
        };
        if let Some(Value::Obj(id)) = existing {
            if matches!(self.heap.data(id), ObjData::Namespace(_)) {
                return id;
            }
        }
        let parent_full = match self.heap.data(parent) {
            ObjData::Namespace(ns) => self.heap.str(ns.full_name).to_string(),
            _ => "kestrel".to_string(),
        };
        let short = self.heap.str(name).to_string();
        let full = format!("{}.{}", parent_full, short);
        let full_id = self.heap.copy_string(&full);
        let child = self.heap.alloc(
            ObjData::Namespace(NamespaceObj {
                short_name: name,
                full_name: full_id,
                enclosing: Some(parent),
                values: IndexMap::new(),
            }),
            None,
        );
        if let ObjData::Namespace(ns) = self.heap.data_mut(parent) {
            ns.values.insert(name, Value::Obj(child));
        }
        child
    }

    fn declare_namespace(&mut self, depth: u8) -> RunResult<()> {
        let depth = depth as usize;
        let base = self.stack.len() - depth;
        let segments: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);
        let mut namespace = self.root_namespace;
        for segment in segments {
            let Value::Obj(name) = segment else { continue };
            namespace = self.namespace_child(namespace, name);
        }
        self.current_namespace = namespace;
        Ok(())
    }

    fn get_namespace(&mut self, depth: u8) -> RunResult<()> {
        let depth = depth as usize;
        let base = self.stack.len() - depth;
        let segments: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);

        match self.resolve_namespace_chain(&segments) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => {
                // A dotted reference may name an unloaded module file under
                // the search root; load it and retry once.
                let dotted: Vec<String> = segments
                    .iter()
                    .filter_map(|segment| match segment {
                        Value::Obj(name) => Some(self.heap.str(*name).to_string()),
                        _ => None,
                    })
                    .collect();
                let dotted = dotted.join(".");
                if crate::module_loader::load_namespace(self, &dotted)? {
                    if let Some(value) = self.resolve_namespace_chain(&segments) {
                        self.push(value);
                        return Ok(());
                    }
                }
                self.throw_named(
                    EXC_REFERENCE,
                    format!("Undefined namespace member '{}'.", dotted),
                )
            }
        }
    }

    fn resolve_namespace_chain(&self, segments: &[Value]) -> Option<Value> {
        let mut current = Value::Obj(self.root_namespace);
        for segment in segments {
            let Value::Obj(name) = segment else { continue };
            let next = match current {
                Value::Obj(id) => match self.heap.data(id) {
                    ObjData::Namespace(ns) => ns.values.get(name).copied(),
                    _ => None,
                },
                _ => None,
            };
            current = next?;
        }
        Some(current)
    }

    fn using_namespace(&mut self, alias: Value) -> RunResult<()> {
        let value = self.pop();
        let alias_id = match alias {
            Value::Obj(id) => id,
            _ => panic!("using alias is not a string"),
        };
        let module = self.current_module_of_frame();
        let module_obj = self.module_of_mut(module);
        let slot = match module_obj.val_indexes.get(&alias_id) {
            Some(&slot) => slot,
            None => {
                let slot = module_obj.val_fields.len();
                module_obj.val_indexes.insert(alias_id, slot);
                module_obj.val_fields.push(Value::Nil);
                slot
            }
        };
        self.module_of_mut(module).val_fields[slot] = value;
        self.heap.write_barrier(module, value);
        Ok(())
    }

    // ── The dispatch loop ───────────────────────────────────────────────────

    /// Runs until the frame count drops below `floor`; returns the value
    /// produced by the frame that closed the run (function result or
    /// yielded value).
    pub fn run(&mut self, floor: usize) -> RunResult<Value> {
        let saved_floor = self.run_floor;
        self.run_floor = floor;
        let result = self.run_dispatch(floor);
        self.run_floor = saved_floor;
        result
    }

    fn run_dispatch(&mut self, floor: usize) -> RunResult<Value> {
        loop {
            self.gc_safe_point();

            let op = OpCode::from_byte({
                let fi = self.frames.len() - 1;
                let chunk = self.frames[fi].chunk as usize;
                let ip = self.frames[fi].ip;
                self.frames[fi].ip = ip + 1;
                self.chunks[chunk].code[ip]
            });

            match op {
                OpCode::Constant => {
                    let index = self.read_byte() as usize;
                    let chunk = self.current_chunk_index();
                    let value = self.chunks[chunk].constants[index];
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => self.push(self.peek(0)),

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames[self.frames.len() - 1].base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames[self.frames.len() - 1].base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames[self.frames.len() - 1].closure;
                    let upvalue = match self.heap.data(closure) {
                        ObjData::Closure(c) => c.upvalues[slot],
                        _ => panic!("frame closure is not a closure"),
                    };
                    let value = match self.heap.data(upvalue) {
                        ObjData::Upvalue(UpvalueState::Open(stack_slot)) => {
                            self.stack[*stack_slot]
                        }
                        ObjData::Upvalue(UpvalueState::Closed(value)) => *value,
                        _ => Value::Nil,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frames[self.frames.len() - 1].closure;
                    let upvalue = match self.heap.data(closure) {
                        ObjData::Closure(c) => c.upvalues[slot],
                        _ => panic!("frame closure is not a closure"),
                    };
                    let value = self.peek(0);
                    match self.heap.data(upvalue) {
                        ObjData::Upvalue(UpvalueState::Open(stack_slot)) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        ObjData::Upvalue(UpvalueState::Closed(_)) => {
                            *self.heap.data_mut(upvalue) =
                                ObjData::Upvalue(UpvalueState::Closed(value));
                            self.heap.write_barrier(upvalue, value);
                        }
                        _ => {}
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::DefineGlobalVal | OpCode::DefineGlobalVar => {
                    let (_, name) = self.read_identifier();
                    let name_id = match name {
                        Value::Obj(id) => id,
                        _ => panic!("global name is not a string"),
                    };
                    let value = self.pop();
                    let module = self.current_module_of_frame();
                    let mutable = op == OpCode::DefineGlobalVar;
                    let module_obj = self.module_of_mut(module);
                    if mutable {
                        let slot = match module_obj.var_indexes.get(&name_id) {
                            Some(&slot) => slot,
                            None => {
                                let slot = module_obj.var_fields.len();
                                module_obj.var_indexes.insert(name_id, slot);
                                module_obj.var_fields.push(Value::Nil);
                                slot
                            }
                        };
                        module_obj.var_fields[slot] = value;
                    } else {
                        let slot = match module_obj.val_indexes.get(&name_id) {
                            Some(&slot) => slot,
                            None => {
                                let slot = module_obj.val_fields.len();
                                module_obj.val_indexes.insert(name_id, slot);
                                module_obj.val_fields.push(Value::Nil);
                                slot
                            }
                        };
                        module_obj.val_fields[slot] = value;
                    }
                    self.heap.write_barrier(module, value);
                }
                OpCode::GetGlobal => {
                    let (site, name) = self.read_identifier();
                    self.get_global(name, site)?;
                }
                OpCode::SetGlobal => {
                    let (site, name) = self.read_identifier();
                    self.set_global(name, site)?;
                }

                OpCode::GetProperty => {
                    let (site, name) = self.read_identifier();
                    self.get_property(name, site, false)?;
                }
                OpCode::GetPropertyOptional => {
                    let (site, name) = self.read_identifier();
                    self.get_property(name, site, true)?;
                }
                OpCode::SetProperty => {
                    let (site, name) = self.read_identifier();
                    self.set_property(name, site)?;
                }
                OpCode::GetSubscript => self.subscript_get(false)?,
                OpCode::GetSubscriptOptional => self.subscript_get(true)?,
                OpCode::SetSubscript => self.subscript_set()?,
                OpCode::GetSuper => {
                    let (_, name) = self.read_identifier();
                    let name_id = match name {
                        Value::Obj(id) => id,
                        _ => panic!("method name is not a string"),
                    };
                    let superclass = self.pop();
                    let receiver = self.peek(0);
                    let Value::Obj(superclass) = superclass else {
                        self.throw_named(EXC_TYPE, "Superclass must be a class.".to_string())?;
                        continue;
                    };
                    match self.bind_method(superclass, name_id, receiver) {
                        Some(bound) => self.set_top(0, bound),
                        None => {
                            let method = self.heap.str(name_id).to_string();
                            self.throw_named(
                                EXC_REFERENCE,
                                format!("Undefined method '{}' on superclass.", method),
                            )?;
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.equals(b)));
                }
                OpCode::Greater | OpCode::Less => self.binary_numeric(op)?,
                OpCode::Add => self.binary_add()?,
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide | OpCode::Modulo => {
                    self.binary_numeric(op)?
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    let negated = match value {
                        Value::Int(n) => match n.checked_neg() {
                            Some(m) => Value::Int(m),
                            None => Value::Float(-(n as f64)),
                        },
                        Value::Float(f) => Value::Float(-f),
                        _ => {
                            self.throw_named(EXC_TYPE, "Operand must be a number.".to_string())?;
                            continue;
                        }
                    };
                    self.pop();
                    self.push(negated);
                }
                OpCode::Range => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Int(from), Value::Int(to)) => {
                            let range = self.heap.alloc(ObjData::Range { from, to }, None);
                            self.pop();
                            self.pop();
                            self.push(Value::Obj(range));
                        }
                        _ => {
                            self.throw_named(
                                EXC_TYPE,
                                "Range endpoints must be integers.".to_string(),
                            )?;
                        }
                    }
                }
                OpCode::NilCoalescing => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(if a.is_nil() { b } else { a });
                }
                OpCode::Elvis => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(if a.is_falsey() { b } else { a });
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    let fi = self.frames.len() - 1;
                    self.frames[fi].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        let fi = self.frames.len() - 1;
                        self.frames[fi].ip += offset;
                    }
                }
                OpCode::JumpIfEmpty => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_nil() {
                        let fi = self.frames.len() - 1;
                        self.frames[fi].ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    let fi = self.frames.len() - 1;
                    self.frames[fi].ip -= offset;
                }
                OpCode::End => {
                    // Loop compilers rewrite END into JUMP before execution.
                    let _ = self.read_u16();
                }

                OpCode::Call => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::OptionalCall => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    if callee.is_nil() {
                        self.stack.truncate(self.stack.len() - argc as usize - 1);
                        self.push(Value::Nil);
                    } else {
                        self.call_value(callee, argc)?;
                    }
                }
                OpCode::Invoke => {
                    let (site, name) = self.read_identifier();
                    let argc = self.read_byte();
                    self.invoke(name, site, argc)?;
                }
                OpCode::OptionalInvoke => {
                    let (site, name) = self.read_identifier();
                    let argc = self.read_byte();
                    let receiver = self.peek(argc as usize);
                    if receiver.is_nil() {
                        self.stack.truncate(self.stack.len() - argc as usize - 1);
                        self.push(Value::Nil);
                    } else {
                        self.invoke(name, site, argc)?;
                    }
                }
                OpCode::SuperInvoke => {
                    let (_, name) = self.read_identifier();
                    let argc = self.read_byte();
                    let name_id = match name {
                        Value::Obj(id) => id,
                        _ => panic!("method name is not a string"),
                    };
                    let superclass = self.pop();
                    let Value::Obj(superclass) = superclass else {
                        self.throw_named(EXC_TYPE, "Superclass must be a class.".to_string())?;
                        continue;
                    };
                    match self.lookup_method(superclass, name_id) {
                        Some(method) => {
                            self.call_method(method, argc)?;
                        }
                        None => {
                            let method = self.heap.str(name_id).to_string();
                            self.throw_named(
                                EXC_REFERENCE,
                                format!("Undefined method '{}' on superclass.", method),
                            )?;
                        }
                    }
                }

                OpCode::Closure => {
                    let (_, function_value) = self.read_identifier();
                    let function = match function_value {
                        Value::Obj(id) => id,
                        _ => panic!("closure target is not a function"),
                    };
                    let upvalue_count = match self.heap.data(function) {
                        ObjData::Function(f) => f.upvalue_count,
                        other => panic!("closure wraps {}", other.kind_name()),
                    };
                    let module = self.current_module_of_frame();
                    let enclosing = self.frames[self.frames.len() - 1].closure;
                    let base = self.frames[self.frames.len() - 1].base;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let parent_upvalue = match self.heap.data(enclosing) {
                                ObjData::Closure(c) => c.upvalues[index],
                                _ => panic!("frame closure is not a closure"),
                            };
                            upvalues.push(parent_upvalue);
                        }
                    }
                    let closure = self.heap.alloc(
                        ObjData::Closure(ClosureObj {
                            function,
                            upvalues,
                            module,
                        }),
                        None,
                    );
                    self.push(Value::Obj(closure));
                }

                OpCode::Class => {
                    let (_, name) = self.read_identifier();
                    self.define_behavior(name, BehaviorKind::Standard)?;
                }
                OpCode::Trait => {
                    let (_, name) = self.read_identifier();
                    self.define_behavior(name, BehaviorKind::Trait)?;
                }
                OpCode::Anonymous => {
                    let kind = self.read_byte();
                    let behavior_kind = if kind == 1 {
                        BehaviorKind::Trait
                    } else {
                        BehaviorKind::Standard
                    };
                    let class =
                        self.create_class("@anonymous", "@anonymous", behavior_kind, false);
                    if behavior_kind == BehaviorKind::Standard {
                        // Anonymous classes inherit Object at creation.
                        let object = self.core.object;
                        let methods: Vec<(HeapId, Value)> = self
                            .class_data(object)
                            .methods
                            .iter()
                            .map(|(&k, &v)| (k, v))
                            .collect();
                        let class_obj = self.class_data_mut(class);
                        class_obj.superclass = Some(object);
                        for (name, method) in methods {
                            class_obj.methods.insert(name, method);
                        }
                    }
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Implement => {
                    let count = self.read_byte();
                    self.implement_traits(count)?;
                }
                OpCode::InstanceMethod | OpCode::ClassMethod => {
                    let (_, name) = self.read_identifier();
                    let name_id = match name {
                        Value::Obj(id) => id,
                        _ => panic!("method name is not a string"),
                    };
                    let method = self.pop();
                    let class_value = self.peek(0);
                    let Value::Obj(class) = class_value else {
                        self.throw_named(EXC_TYPE, "Methods belong to classes.".to_string())?;
                        continue;
                    };
                    let target = if op == OpCode::ClassMethod {
                        match self.heap.header(class).class {
                            Some(meta) => meta,
                            None => class,
                        }
                    } else {
                        class
                    };
                    self.class_data_mut(target).methods.insert(name_id, method);
                    self.heap.write_barrier(target, method);
                }

                OpCode::Array => {
                    let count = self.read_byte() as usize;
                    let base = self.stack.len() - count;
                    let elements: Vec<Value> = self.stack[base..].to_vec();
                    self.stack.truncate(base);
                    let array = self.heap.alloc(ObjData::Array(elements), None);
                    self.push(Value::Obj(array));
                }
                OpCode::Dictionary => {
                    let count = self.read_byte() as usize;
                    let base = self.stack.len() - count * 2;
                    let mut entries = IndexMap::with_capacity(count);
                    let mut bad_key = false;
                    for i in 0..count {
                        let key = self.stack[base + i * 2];
                        let value = self.stack[base + i * 2 + 1];
                        if key.is_nil() {
                            bad_key = true;
                            break;
                        }
                        entries.insert(DictKey(key), value);
                    }
                    self.stack.truncate(base);
                    if bad_key {
                        self.throw_named(
                            EXC_TYPE,
                            "Dictionary keys may not be nil.".to_string(),
                        )?;
                        continue;
                    }
                    let dict = self.heap.alloc(ObjData::Dict(DictObj { entries }), None);
                    self.push(Value::Obj(dict));
                }

                OpCode::Require => {
                    let path = self.pop();
                    crate::module_loader::require(self, path)?;
                }
                OpCode::Namespace => {
                    let (_, name) = self.read_identifier();
                    self.push(name);
                }
                OpCode::DeclareNamespace => {
                    let depth = self.read_byte();
                    self.declare_namespace(depth)?;
                }
                OpCode::GetNamespace => {
                    let depth = self.read_byte();
                    self.get_namespace(depth)?;
                }
                OpCode::UsingNamespace => {
                    let (_, alias) = self.read_identifier();
                    self.using_namespace(alias)?;
                }

                OpCode::Throw => {
                    let exception = self.pop();
                    let valid = matches!(exception, Value::Obj(id)
                        if matches!(self.heap.data(id), ObjData::Exception { .. }));
                    if !valid {
                        self.throw_named(
                            EXC_TYPE,
                            "Can only throw exception instances.".to_string(),
                        )?;
                        continue;
                    }
                    self.fill_stacktrace(exception);
                    self.propagate(exception)?;
                }
                OpCode::Try => {
                    let (_, class_name) = self.read_identifier();
                    let handler_addr = self.read_u16();
                    let finally_addr = self.read_u16();
                    let class_name_id = match class_name {
                        Value::Obj(id) => id,
                        _ => panic!("exception class name is not a string"),
                    };
                    let Some(class) = self.resolve_exception_class(class_name_id)? else {
                        // The class-resolution throw was caught; continue at
                        // the handler.
                        continue;
                    };
                    let fi = self.frames.len() - 1;
                    if self.frames[fi].handlers.len() >= MAX_HANDLERS {
                        self.throw_named(
                            EXC_STACK_OVERFLOW,
                            "Too many nested exception handlers.".to_string(),
                        )?;
                        continue;
                    }
                    let depth = self.stack.len() - self.frames[fi].base;
                    self.frames[fi].handlers.push(ExceptionHandler {
                        class,
                        handler_addr,
                        finally_addr,
                        stack_depth: depth,
                    });
                }
                OpCode::Catch => {
                    let fi = self.frames.len() - 1;
                    self.frames[fi].handlers.pop();
                }
                OpCode::Finally => {
                    let exception = self.pop();
                    self.propagate(exception)?;
                }

                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frames[self.frames.len() - 1].base;
                    self.close_upvalues(base);
                    self.stack.truncate(base);
                    self.frames.pop();
                    if self.frames.len() < floor {
                        return Ok(result);
                    }
                    self.push(result);
                }
                OpCode::ReturnNonlocal => {
                    // Returns through the whole lambda nest: pops `depth`
                    // frames (the innermost lambda plus its enclosing
                    // lambda frames) and delivers the value to the caller
                    // beneath them.
                    let depth = self.read_byte() as usize;
                    let value = self.pop();
                    match self.unwind_nonlocal(depth.max(1), value, floor)? {
                        Some(result) => return Ok(result),
                        None => {}
                    }
                }
                OpCode::Yield => {
                    let value = self.pop();
                    let result = self.suspend_generator(value, 0)?;
                    if self.frames.len() < floor {
                        return Ok(result);
                    }
                    // A yield always unwinds to the resumer's floor.
                    self.push(result);
                }
                OpCode::YieldFrom => {
                    if let Some(result) = self.yield_from(floor)? {
                        return Ok(result);
                    }
                }
                OpCode::Await => {
                    if let Some(result) = self.await_value(floor)? {
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// Pops `count` frames for a non-local lambda return. Returns the value
    /// when the unwind closed this run level.
    fn unwind_nonlocal(
        &mut self,
        count: usize,
        value: Value,
        floor: usize,
    ) -> RunResult<Option<Value>> {
        let mut remaining = count;
        while remaining > 0 {
            if self.frames.is_empty() || self.frames.len() < floor {
                return Err(Unwind::NonLocal { remaining, value });
            }
            let base = self.frames[self.frames.len() - 1].base;
            self.close_upvalues(base);
            self.stack.truncate(base);
            self.frames.pop();
            remaining -= 1;
        }
        if self.frames.len() < floor {
            return Ok(Some(value));
        }
        self.push(value);
        Ok(None)
    }

    fn fill_stacktrace(&mut self, exception: Value) {
        let Value::Obj(id) = exception else { return };
        let needs_trace = match self.heap.data(id) {
            ObjData::Exception { stacktrace, .. } => match stacktrace {
                Value::Obj(t) => matches!(self.heap.data(*t), ObjData::Array(a) if a.is_empty()),
                _ => true,
            },
            _ => false,
        };
        if !needs_trace {
            return;
        }
        let trace = self.capture_stack_trace();
        let values: Vec<Value> = trace
            .into_iter()
            .map(|entry| Value::Obj(self.heap.take_string(entry)))
            .collect();
        let array = self.heap.alloc(ObjData::Array(values), None);
        if let ObjData::Exception { stacktrace, .. } = self.heap.data_mut(id) {
            *stacktrace = Value::Obj(array);
        }
    }

    /// Resolves the TRY operand's class name: module binding first, then the
    /// builtin catalog. `None` means the resolution failure was thrown and
    /// caught somewhere; the caller resumes dispatch.
    fn resolve_exception_class(&mut self, name: HeapId) -> RunResult<Option<HeapId>> {
        let module = self.current_module_of_frame();
        let value = {
            let module_obj = self.module_of(module);
            match module_obj.val_indexes.get(&name) {
                Some(&slot) => Some(module_obj.val_fields[slot]),
                None => match module_obj.var_indexes.get(&name) {
                    Some(&slot) => Some(module_obj.var_fields[slot]),
                    None => None,
                },
            }
        };
        let value = value.or_else(|| self.builtins.get(&name).copied());
        match value {
            Some(Value::Obj(id)) if matches!(self.heap.data(id), ObjData::Class(_)) => {
                Ok(Some(id))
            }
            _ => {
                let class_name = self.heap.str(name).to_string();
                self.throw_named(
                    EXC_TYPE,
                    format!("'{}' is not an exception class.", class_name),
                )?;
                Ok(None)
            }
        }
    }

    // ── Host entry ──────────────────────────────────────────────────────────

    /// Full pipeline for one source unit in the given module: lex, parse,
    /// resolve, compile, execute.
    pub fn interpret_in_module(
        &mut self,
        source: &str,
        module: HeapId,
    ) -> Result<Value, KesError> {
        let function = self.compile_in_module(source, module)?;
        self.execute_module(function, module)
    }

    /// Front-end phases only: source → top-level function, with the
    /// configuration-gated phase dumps along the way.
    pub fn compile_in_module(
        &mut self,
        source: &str,
        module: HeapId,
    ) -> Result<HeapId, KesError> {
        if self.conf.debug_token {
            let (tokens, _) = crate::lexer::Lexer::tokenize(source);
            crate::debug::print_tokens(&tokens);
        }

        let (mut ast, lex_errors, parse_errors) = crate::parser::Parser::new(source).parse();
        let mut frontend: Vec<FrontendError> = Vec::new();
        frontend.extend(lex_errors.into_iter().map(FrontendError::Lex));
        frontend.extend(parse_errors.into_iter().map(FrontendError::Parse));
        if !frontend.is_empty() {
            return Err(KesError::Compile(frontend));
        }
        if self.conf.debug_ast {
            crate::debug::print_ast(&ast);
        }

        let resolver = crate::resolver::Resolver::new(&self.conf);
        let output = match resolver.resolve(&mut ast) {
            Ok(output) => output,
            Err(errors) => {
                return Err(KesError::Compile(
                    errors.into_iter().map(FrontendError::Resolve).collect(),
                ))
            }
        };
        for warning in &output.warnings {
            eprintln!("Warning: {}", warning);
        }
        if self.conf.debug_symtab {
            crate::debug::print_symtabs(&output.tables);
        }

        let function =
            match crate::compiler::compile(self, &ast, module, output.script_is_async) {
                Ok(function) => function,
                Err(errors) => {
                    return Err(KesError::Compile(
                        errors.into_iter().map(FrontendError::Compile).collect(),
                    ))
                }
            };
        if self.conf.debug_code {
            let chunk_id = match self.heap.data(function) {
                ObjData::Function(f) => f.chunk as usize,
                _ => 0,
            };
            crate::debug::disassemble_chunk(&self.chunks[chunk_id], "script", &self.heap);
        }
        Ok(function)
    }

    /// Top-level host entry: interprets the source as a fresh module, then
    /// drains the event loop and reports an async script's rejection as an
    /// unhandled error.
    pub fn interpret(&mut self, source: &str, path: &str) -> Result<Value, KesError> {
        let module = self.new_module(path);
        let previous = self.current_module;
        let result = self.interpret_in_module(source, module);
        self.current_module = previous;
        let value = result?;
        self.finish_run(value)
    }

    /// Drains the event loop to idle and checks the script promise.
    pub fn finish_run(&mut self, value: Value) -> Result<Value, KesError> {
        if let Err(unwind) = self.run_loop_until_idle() {
            return Err(self.unwind_error_for_host(unwind));
        }
        if let Value::Obj(id) = value {
            let rejection = match self.heap.data(id) {
                ObjData::Promise(p) if p.state == PromiseState::Rejected => Some(p.exception),
                _ => None,
            };
            if let Some(exception) = rejection {
                let unwind = self.unhandled(exception);
                return Err(self.unwind_error_for_host(unwind));
            }
        }
        Ok(value)
    }

    /// Runs a compiled module closure without draining the event loop (a
    /// required module runs in the middle of its requirer).
    pub fn execute_module_raw(&mut self, function: HeapId, module: HeapId) -> RunResult<Value> {
        let closure = self.heap.alloc(
            ObjData::Closure(ClosureObj {
                function,
                upvalues: Vec::new(),
                module,
            }),
            None,
        );
        if let ObjData::Module(m) = self.heap.data_mut(module) {
            m.closure = Some(closure);
        }
        let previous_module = self.current_module;
        let previous_namespace = self.current_namespace;
        self.current_module = module;
        let result = self.call_function_value(Value::Obj(closure), &[]);
        self.current_module = previous_module;
        self.current_namespace = previous_namespace;
        result
    }

    fn execute_module(&mut self, function: HeapId, module: HeapId) -> Result<Value, KesError> {
        match self.execute_module_raw(function, module) {
            Ok(value) => Ok(value),
            Err(unwind) => Err(self.unwind_error_for_host(unwind)),
        }
    }

    /// Propagation with an explicit floor, for callers outside the dispatch
    /// loop (generator resume with a pending throw).
    pub fn propagate_at_floor(&mut self, exception: Value, floor: usize) -> RunResult<()> {
        let saved = self.run_floor;
        self.run_floor = floor;
        let result = self.propagate(exception);
        self.run_floor = saved;
        result
    }

    pub fn unwind_error_for_host(&mut self, unwind: Unwind) -> KesError {
        match unwind {
            Unwind::Fatal(fatal) => KesError::Runtime(fatal),
            Unwind::Thrown(exception) => match self.unhandled(exception) {
                Unwind::Fatal(fatal) => KesError::Runtime(fatal),
                _ => KesError::Runtime(RuntimeFatal {
                    message: "unhandled exception".into(),
                    stack_trace: Vec::new(),
                }),
            },
            Unwind::NonLocal { value, .. } => KesError::Runtime(RuntimeFatal {
                message: format!(
                    "non-local return escaped all frames with value {}",
                    self.display_value(value)
                ),
                stack_trace: Vec::new(),
            }),
        }
    }

    // ── Event loop integration ──────────────────────────────────────────────

    /// Runs queued callbacks and due timers until the loop has nothing left.
    /// Timer callbacks re-enter the interpreter between resumptions.
    pub fn run_loop_until_idle(&mut self) -> RunResult<()> {
        loop {
            while let Some(task) = self.event_loop.next_ready_task() {
                self.dispatch_loop_task(task)?;
            }
            if !self.event_loop.has_pending_work() {
                return Ok(());
            }
            self.event_loop.wait_for_next_timer();
        }
    }

    fn dispatch_loop_task(&mut self, task: LoopTask) -> RunResult<()> {
        match task {
            LoopTask::Timer { timer } => {
                let (closure, interval, running) = match self.heap.data(timer) {
                    ObjData::Timer(t) => (t.closure, t.interval_ms, t.running),
                    _ => return Ok(()),
                };
                if !running {
                    return Ok(());
                }
                if interval == 0 {
                    if let ObjData::Timer(t) = self.heap.data_mut(timer) {
                        t.running = false;
                        t.timer_id = None;
                    }
                }
                self.api_depth += 1;
                let result = self.call_function_value(closure, &[]);
                self.api_depth -= 1;
                result.map(|_| ())
            }
            LoopTask::Settle {
                promise,
                value,
                reject,
            } => {
                if reject {
                    self.reject_promise(promise, value)
                } else {
                    self.fulfill_promise(promise, value)
                }
            }
        }
    }

    // ── Promise and generator plumbing used across modules ──────────────────

    pub fn new_pending_promise(&mut self) -> HeapId {
        self.promise_count += 1;
        let id = self.promise_count;
        let captures = self.heap.alloc(
            ObjData::Dict(DictObj {
                entries: IndexMap::new(),
            }),
            None,
        );
        self.heap.alloc(
            ObjData::Promise(PromiseObj {
                id,
                state: PromiseState::Pending,
                value: Value::Nil,
                exception: Value::Nil,
                executor: Value::Nil,
                handlers: Vec::new(),
                on_catch: Value::Nil,
                on_finally: Value::Nil,
                captures,
                continuations: Vec::new(),
            }),
            Some(self.core.promise),
        )
    }

    pub fn make_generator(&mut self, closure: HeapId, argc: usize) -> HeapId {
        let base = self.stack.len() - argc - 1;
        let slots: Vec<Value> = self.stack[base..].to_vec();
        self.stack.truncate(base);
        let frame = self.heap.alloc(
            ObjData::Frame(Box::new(SavedFrame {
                closure,
                ip: 0,
                slots,
                handlers: Vec::new(),
            })),
            None,
        );
        self.heap.alloc(
            ObjData::Generator(GeneratorObj {
                frame,
                state: GeneratorState::Start,
                value: Value::Nil,
                pending_exception: Value::Nil,
                outer: None,
                inner: None,
            }),
            Some(self.core.generator),
        )
    }

    pub fn generator_data(&self, id: HeapId) -> &GeneratorObj {
        match self.heap.data(id) {
            ObjData::Generator(g) => g,
            other => panic!("expected Generator, found {}", other.kind_name()),
        }
    }

    pub fn generator_data_mut(&mut self, id: HeapId) -> &mut GeneratorObj {
        match self.heap.data_mut(id) {
            ObjData::Generator(g) => g,
            other => panic!("expected Generator, found {}", other.kind_name()),
        }
    }

    /// Reads a module-level binding by name (immutable bindings first).
    pub fn global_value(&mut self, module: HeapId, name: &str) -> Option<Value> {
        let name_id = self.heap.copy_string(name);
        let module_obj = self.module_of(module);
        match module_obj.val_indexes.get(&name_id) {
            Some(&slot) => Some(module_obj.val_fields[slot]),
            None => module_obj
                .var_indexes
                .get(&name_id)
                .map(|&slot| module_obj.var_fields[slot]),
        }
    }

    pub fn clock_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn clock_micros(&self) -> i64 {
        self.started.elapsed().as_micros() as i64
    }
}
