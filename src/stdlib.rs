/// Core native catalog, registered against the object model at VM init.
///
/// Namespaces: `kestrel.lang` (root classes, exceptions, Generator,
/// Promise), `kestrel.collection` (Array, Dictionary, Entry, Range,
/// LinkedList), `kestrel.util` (Timer, Random), `kestrel.io` (File). Short
/// names also bind as globals so scripts reach them without `using`.
///
/// Iteration follows the `next`/`nextValue` protocol the for-loop desugars
/// to: `next(index)` produces the successor index or nil when exhausted,
/// `nextValue(index)` the element at that index.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::event_loop::LoopTask;
use crate::intern::utf8_char_count;
use crate::native::{
    assert_arity, assert_array, assert_callable, assert_index_bounds, assert_int, assert_string,
};
use crate::object::{
    FileObj, GeneratorState, InterceptorKind, NativeError, NativeResult, ObjData, PromiseState,
    RecordObj, TimerObj,
};
use crate::promise::to_native_result;
use crate::value::{DictKey, HeapId, Value};
use crate::vm::{ResumeInput, Vm, EXC_ARGUMENT, EXC_IO, EXC_TYPE};

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn ok(value: Value) -> NativeResult {
    Ok(value)
}

fn throw(class: &'static str, message: String) -> NativeResult {
    Err(NativeError::Throw { class, message })
}

fn receiver_id(receiver: Value) -> HeapId {
    match receiver {
        Value::Obj(id) => id,
        _ => panic!("native method receiver is not an object"),
    }
}

/// Reentrant-aware rendering: instances get their `toString` called.
pub fn stringify(vm: &mut Vm, value: Value) -> Result<String, NativeError> {
    if let Value::Obj(id) = value {
        let wants_to_string = matches!(
            vm.heap.data(id),
            ObjData::Instance { .. } | ObjData::ValueInstance { .. } | ObjData::Exception { .. }
        );
        if wants_to_string {
            let name = vm.heap.copy_string("toString");
            let class = vm.class_of(value);
            if let Some(method) = vm.lookup_method(class, name) {
                let result = to_native_result(vm.call_method_value(value, method, &[]))?;
                if let Value::Obj(sid) = result {
                    if let ObjData::Str(s) = vm.heap.data(sid) {
                        return Ok(s.chars.to_string());
                    }
                }
                return Ok(vm.display_value(result));
            }
        }
    }
    Ok(vm.display_value(value))
}

fn instance_field(vm: &Vm, id: HeapId, name: HeapId) -> Value {
    let shape = vm.heap.header(id).shape_id;
    match vm.shapes.index_of(shape, name) {
        Some(slot) => match vm.heap.data(id) {
            ObjData::Instance { fields } => fields[slot],
            _ => Value::Nil,
        },
        None => Value::Nil,
    }
}

fn set_instance_field(vm: &mut Vm, id: HeapId, name: HeapId, value: Value) {
    let shape = vm.heap.header(id).shape_id;
    match vm.shapes.index_of(shape, name) {
        Some(slot) => {
            if let ObjData::Instance { fields } = vm.heap.data_mut(id) {
                fields[slot] = value;
            }
        }
        None => {
            let (child, slot) = vm.shapes.transition(shape, name);
            vm.heap.header_mut(id).shape_id = child;
            if let ObjData::Instance { fields } = vm.heap.data_mut(id) {
                while fields.len() <= slot {
                    fields.push(Value::Nil);
                }
                fields[slot] = value;
            }
        }
    }
    vm.heap.write_barrier(id, value);
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub fn register_core(vm: &mut Vm) {
    let root = vm.root_namespace;
    let lang = vm.define_native_namespace("lang", root);
    let collection = vm.define_native_namespace("collection", root);
    let util = vm.define_native_namespace("util", root);
    let io = vm.define_native_namespace("io", root);

    // Root of the hierarchy first: Object's method catalogs must exist
    // before any class copies them at creation.
    let object = vm.define_native_class("Object", lang, None);
    vm.core.object = object;
    register_object_methods(vm, object);
    let object_meta = vm.metaclass_of(object);
    register_metaclass_methods(vm, object_meta);

    // The metaclass chain terminates at Class: Object's metaclass (and every
    // metaclass after it) is an instance of Class, and Class's own metaclass
    // closes on itself.
    let class_class = vm.define_native_class("Class", lang, Some(object));
    vm.core.class_class = class_class;
    vm.heap.header_mut(object_meta).class = Some(class_class);
    let class_meta = vm.metaclass_of(class_class);
    vm.heap.header_mut(class_meta).class = Some(class_class);

    let trait_class = vm.define_native_class("Trait", lang, Some(object));
    vm.core.trait_class = trait_class;

    // Value classes.
    let number = vm.define_native_class("Number", lang, Some(object));
    vm.core.number = number;
    register_number_methods(vm, number);
    let int = vm.define_native_class("Int", lang, Some(number));
    vm.core.int = int;
    register_int_methods(vm, int);
    let float = vm.define_native_class("Float", lang, Some(number));
    vm.core.float = float;
    register_float_methods(vm, float);
    let bool_class = vm.define_native_class("Bool", lang, Some(object));
    vm.core.bool_class = bool_class;
    let nil_class = vm.define_native_class("Nil", lang, Some(object));
    vm.core.nil = nil_class;
    let string = vm.define_native_class("String", lang, Some(object));
    vm.core.string = string;
    register_string_methods(vm, string);
    let function = vm.define_native_class("Function", lang, Some(object));
    vm.core.function = function;
    let method = vm.define_native_class("Method", lang, Some(object));
    vm.core.method = method;
    let bound_method = vm.define_native_class("BoundMethod", lang, Some(object));
    vm.core.bound_method = bound_method;
    let namespace = vm.define_native_class("Namespace", lang, Some(object));
    vm.core.namespace = namespace;
    let module = vm.define_native_class("Module", lang, Some(object));
    vm.core.module = module;

    // Collections.
    let array = vm.define_native_class("Array", collection, Some(object));
    vm.core.array = array;
    register_array_methods(vm, array);
    let dictionary = vm.define_native_class("Dictionary", collection, Some(object));
    vm.core.dictionary = dictionary;
    register_dictionary_methods(vm, dictionary);
    let entry = vm.define_native_class("Entry", collection, Some(object));
    vm.core.entry = entry;
    register_entry_methods(vm, entry);
    let range = vm.define_native_class("Range", collection, Some(object));
    vm.core.range = range;
    register_range_methods(vm, range);
    let node = vm.define_native_class("Node", collection, Some(object));
    vm.core.node = node;
    let linked_list = vm.define_native_class("LinkedList", collection, Some(object));
    vm.core.linked_list = linked_list;
    register_linked_list_methods(vm, linked_list);

    // Exceptions.
    let exception = vm.define_native_class("Exception", lang, Some(object));
    vm.core.exception = exception;
    register_exception_methods(vm, exception);
    for name in [
        "TypeException",
        "ArgumentException",
        "IndexException",
        "ArithmeticException",
        "ReferenceException",
        "StackOverflowException",
        "IOException",
        "NotImplementedException",
        "PromiseRejectionException",
    ] {
        vm.define_native_class(name, lang, Some(exception));
    }
    // `Error` aliases the root exception class globally.
    let error_name = vm.heap.copy_string("Error");
    vm.builtins.insert(error_name, Value::Obj(exception));

    // Suspension types.
    let generator = vm.define_native_class("Generator", lang, Some(object));
    vm.core.generator = generator;
    register_generator_methods(vm, generator);
    let promise = vm.define_native_class("Promise", lang, Some(object));
    vm.core.promise = promise;
    register_promise_methods(vm, promise);

    // Resources.
    let timer = vm.define_native_class("Timer", util, Some(object));
    vm.core.timer = timer;
    register_timer_methods(vm, timer);
    let random = vm.define_native_class("Random", util, Some(object));
    vm.core.random = random;
    register_random_methods(vm, random);
    let file = vm.define_native_class("File", io, Some(object));
    vm.core.file = file;
    register_file_methods(vm, file);

    register_free_functions(vm);
}

// ---------------------------------------------------------------------------
// Object and metaclass
// ---------------------------------------------------------------------------

fn register_object_methods(vm: &mut Vm, object: HeapId) {
    vm.define_native_method(object, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
    vm.define_native_method(object, "hashCode", 0, false, |vm, receiver, _args| {
        let hash = match receiver {
            Value::Nil => 0,
            Value::Bool(b) => b as i32,
            Value::Int(n) => n,
            Value::Float(f) => f.to_bits() as i32,
            Value::Obj(id) => match vm.heap.data(id) {
                ObjData::Str(s) => s.hash as i32,
                _ => vm.heap.object_id(id) as i32,
            },
        };
        ok(Value::Int(hash))
    });
    vm.define_native_method(object, "instanceId", 0, false, |vm, receiver, _args| {
        match receiver {
            Value::Obj(id) => ok(Value::Int(vm.heap.object_id(id) as i32)),
            _ => ok(Value::Int(0)),
        }
    });
    vm.define_native_method(object, "getClass", 0, false, |vm, receiver, _args| {
        ok(Value::Obj(vm.class_of(receiver)))
    });
    vm.define_native_method(object, "instanceOf", 1, false, |vm, receiver, args| {
        match args[0] {
            Value::Obj(id) if matches!(vm.heap.data(id), ObjData::Class(_)) => {
                ok(Value::Bool(vm.instance_of(receiver, id)))
            }
            _ => throw(EXC_ARGUMENT, "instanceOf expects a class.".to_string()),
        }
    });
    vm.define_native_method(object, "memberOf", 1, false, |vm, receiver, args| {
        match args[0] {
            Value::Obj(id) if matches!(vm.heap.data(id), ObjData::Class(_)) => {
                ok(Value::Bool(vm.class_of(receiver) == id))
            }
            _ => throw(EXC_ARGUMENT, "memberOf expects a class.".to_string()),
        }
    });
}

/// Class-side helpers inherited by every metaclass.
fn register_metaclass_methods(vm: &mut Vm, object_meta: HeapId) {
    vm.define_native_method(object_meta, "name", 0, false, |vm, receiver, _args| {
        let class = receiver_id(receiver);
        let name = vm.class_data(class).name;
        ok(Value::Obj(name))
    });
    vm.define_native_method(object_meta, "fullName", 0, false, |vm, receiver, _args| {
        let class = receiver_id(receiver);
        let name = vm.class_data(class).full_name;
        ok(Value::Obj(name))
    });
    vm.define_native_method(object_meta, "superclass", 0, false, |vm, receiver, _args| {
        let class = receiver_id(receiver);
        match vm.class_data(class).superclass {
            Some(superclass) => ok(Value::Obj(superclass)),
            None => ok(Value::Nil),
        }
    });
    vm.define_native_method(object_meta, "behaviorId", 0, false, |vm, receiver, _args| {
        let class = receiver_id(receiver);
        ok(Value::Int(vm.class_data(class).behavior_id as i32))
    });
    vm.define_native_method(object_meta, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

fn register_number_methods(vm: &mut Vm, number: HeapId) {
    vm.define_native_method(number, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
    vm.define_native_method(number, "sqrt", 0, false, |_vm, receiver, _args| {
        ok(Value::Float(receiver.as_f64().sqrt()))
    });
    vm.define_native_method(number, "pow", 1, false, |_vm, receiver, args| {
        let exponent = match args[0] {
            v if v.is_number() => v.as_f64(),
            _ => return throw(EXC_ARGUMENT, "pow expects a number.".to_string()),
        };
        ok(Value::Float(receiver.as_f64().powf(exponent)))
    });
}

fn register_int_methods(vm: &mut Vm, int: HeapId) {
    vm.define_native_method(int, "abs", 0, false, |_vm, receiver, _args| {
        match receiver {
            Value::Int(n) => match n.checked_abs() {
                Some(a) => ok(Value::Int(a)),
                None => ok(Value::Float((n as f64).abs())),
            },
            other => ok(other),
        }
    });
    vm.define_native_method(int, "toFloat", 0, false, |_vm, receiver, _args| {
        ok(Value::Float(receiver.as_f64()))
    });
}

fn register_float_methods(vm: &mut Vm, float: HeapId) {
    vm.define_native_method(float, "floor", 0, false, |_vm, receiver, _args| {
        ok(Value::Float(receiver.as_f64().floor()))
    });
    vm.define_native_method(float, "ceil", 0, false, |_vm, receiver, _args| {
        ok(Value::Float(receiver.as_f64().ceil()))
    });
    vm.define_native_method(float, "round", 0, false, |_vm, receiver, _args| {
        ok(Value::Float(receiver.as_f64().round()))
    });
    vm.define_native_method(float, "toInt", 0, false, |_vm, receiver, _args| {
        ok(Value::Int(receiver.as_f64() as i32))
    });
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

fn receiver_str(vm: &Vm, receiver: Value) -> String {
    match receiver {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Str(s) => s.chars.to_string(),
            _ => String::new(),
        },
        _ => String::new(),
    }
}

fn register_string_methods(vm: &mut Vm, string: HeapId) {
    vm.define_native_method(string, "toString", 0, false, |_vm, receiver, _args| {
        ok(receiver)
    });
    vm.define_native_method(string, "length", 0, false, |vm, receiver, _args| {
        let s = receiver_str(vm, receiver);
        ok(Value::Int(utf8_char_count(&s) as i32))
    });
    vm.define_native_method(string, "byteLength", 0, false, |vm, receiver, _args| {
        let s = receiver_str(vm, receiver);
        ok(Value::Int(s.len() as i32))
    });
    vm.define_native_method(string, "upper", 0, false, |vm, receiver, _args| {
        let s = receiver_str(vm, receiver).to_uppercase();
        ok(Value::Obj(vm.heap.take_string(s)))
    });
    vm.define_native_method(string, "lower", 0, false, |vm, receiver, _args| {
        let s = receiver_str(vm, receiver).to_lowercase();
        ok(Value::Obj(vm.heap.take_string(s)))
    });
    vm.define_native_method(string, "trim", 0, false, |vm, receiver, _args| {
        let s = receiver_str(vm, receiver).trim().to_string();
        ok(Value::Obj(vm.heap.take_string(s)))
    });
    vm.define_native_method(string, "reverse", 0, false, |vm, receiver, _args| {
        let s: String = receiver_str(vm, receiver).chars().rev().collect();
        ok(Value::Obj(vm.heap.take_string(s)))
    });
    vm.define_native_method(string, "split", 1, false, |vm, receiver, args| {
        let separator_id = assert_string(vm, "String::split", args, 0)?;
        let separator = vm.heap.str(separator_id).to_string();
        let s = receiver_str(vm, receiver);
        let parts: Vec<String> = if separator.is_empty() {
            s.chars().map(|c| c.to_string()).collect()
        } else {
            s.split(&separator).map(|p| p.to_string()).collect()
        };
        let elements: Vec<Value> = parts
            .into_iter()
            .map(|p| Value::Obj(vm.heap.take_string(p)))
            .collect();
        ok(Value::Obj(vm.heap.alloc(ObjData::Array(elements), None)))
    });
    vm.define_native_method(string, "indexOf", 1, false, |vm, receiver, args| {
        let needle_id = assert_string(vm, "String::indexOf", args, 0)?;
        let needle = vm.heap.str(needle_id).to_string();
        let s = receiver_str(vm, receiver);
        match s.find(&needle) {
            Some(byte_index) => ok(Value::Int(utf8_char_count(&s[..byte_index]) as i32)),
            None => ok(Value::Int(-1)),
        }
    });
    vm.define_native_method(string, "contains", 1, false, |vm, receiver, args| {
        let needle_id = assert_string(vm, "String::contains", args, 0)?;
        let needle = vm.heap.str(needle_id).to_string();
        ok(Value::Bool(receiver_str(vm, receiver).contains(&needle)))
    });
    vm.define_native_method(string, "substring", 2, false, |vm, receiver, args| {
        let from = assert_int("String::substring", args, 0)?;
        let to = assert_int("String::substring", args, 1)?;
        let s = receiver_str(vm, receiver);
        let count = utf8_char_count(&s) as i32;
        if from < 0 || to > count || from > to {
            return throw(
                crate::vm::EXC_INDEX,
                format!("Substring range {}..{} out of bounds for length {}.", from, to, count),
            );
        }
        let result: String = s
            .chars()
            .skip(from as usize)
            .take((to - from) as usize)
            .collect();
        ok(Value::Obj(vm.heap.take_string(result)))
    });
    vm.define_native_method(string, "replace", 2, false, |vm, receiver, args| {
        let from_id = assert_string(vm, "String::replace", args, 0)?;
        let to_id = assert_string(vm, "String::replace", args, 1)?;
        let from = vm.heap.str(from_id).to_string();
        let to = vm.heap.str(to_id).to_string();
        let s = receiver_str(vm, receiver).replace(&from, &to);
        ok(Value::Obj(vm.heap.take_string(s)))
    });
    vm.define_native_method(string, "startsWith", 1, false, |vm, receiver, args| {
        let prefix_id = assert_string(vm, "String::startsWith", args, 0)?;
        let prefix = vm.heap.str(prefix_id).to_string();
        ok(Value::Bool(receiver_str(vm, receiver).starts_with(&prefix)))
    });
    vm.define_native_method(string, "endsWith", 1, false, |vm, receiver, args| {
        let suffix_id = assert_string(vm, "String::endsWith", args, 0)?;
        let suffix = vm.heap.str(suffix_id).to_string();
        ok(Value::Bool(receiver_str(vm, receiver).ends_with(&suffix)))
    });

    // Printf-style construction lives on the class side.
    let string_meta = vm.metaclass_of(string);
    vm.define_native_method(string_meta, "format", -1, false, |vm, _receiver, args| {
        if args.is_empty() {
            return throw(EXC_ARGUMENT, "String.format expects a format string.".to_string());
        }
        let format_id = assert_string(vm, "String.format", args, 0)?;
        let format = vm.heap.str(format_id).to_string();
        let mut output = String::with_capacity(format.len());
        let mut arg_index = 1;
        let mut chars = format.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                output.push(ch);
                continue;
            }
            match chars.next() {
                Some('%') => output.push('%'),
                Some('s') => {
                    let value = args.get(arg_index).copied().unwrap_or(Value::Nil);
                    arg_index += 1;
                    output.push_str(&stringify(vm, value)?);
                }
                Some('d') => {
                    let value = args.get(arg_index).copied().unwrap_or(Value::Nil);
                    arg_index += 1;
                    match value {
                        Value::Int(n) => output.push_str(&n.to_string()),
                        Value::Float(f) => output.push_str(&(f as i64).to_string()),
                        _ => {
                            return throw(
                                EXC_ARGUMENT,
                                "String.format %d expects a number.".to_string(),
                            )
                        }
                    }
                }
                Some('f') => {
                    let value = args.get(arg_index).copied().unwrap_or(Value::Nil);
                    arg_index += 1;
                    if !value.is_number() {
                        return throw(
                            EXC_ARGUMENT,
                            "String.format %f expects a number.".to_string(),
                        );
                    }
                    output.push_str(&format!("{}", value.as_f64()));
                }
                other => {
                    return throw(
                        EXC_ARGUMENT,
                        format!("String.format does not understand %{}.", other.unwrap_or(' ')),
                    )
                }
            }
        }
        ok(Value::Obj(vm.heap.take_string(output)))
    });
}

// ---------------------------------------------------------------------------
// Array
// ---------------------------------------------------------------------------

fn array_elements(vm: &Vm, receiver: Value) -> Vec<Value> {
    match receiver {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Array(elements) => elements.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn register_array_methods(vm: &mut Vm, array: HeapId) {
    vm.define_native_method(array, "length", 0, false, |vm, receiver, _args| {
        ok(Value::Int(array_elements(vm, receiver).len() as i32))
    });
    vm.define_native_method(array, "append", 1, false, |vm, receiver, args| {
        let id = receiver_id(receiver);
        if let ObjData::Array(elements) = vm.heap.data_mut(id) {
            elements.push(args[0]);
        }
        vm.heap.write_barrier(id, args[0]);
        ok(receiver)
    });
    vm.define_native_method(array, "insertAt", 2, false, |vm, receiver, args| {
        let index = assert_int("Array::insertAt", args, 0)?;
        let id = receiver_id(receiver);
        let length = array_elements(vm, receiver).len();
        if index < 0 || index as usize > length {
            return throw(
                crate::vm::EXC_INDEX,
                format!("Array index {} out of bounds for length {}.", index, length),
            );
        }
        if let ObjData::Array(elements) = vm.heap.data_mut(id) {
            elements.insert(index as usize, args[1]);
        }
        vm.heap.write_barrier(id, args[1]);
        ok(receiver)
    });
    vm.define_native_method(array, "removeAt", 1, false, |vm, receiver, args| {
        let index = assert_int("Array::removeAt", args, 0)?;
        let id = receiver_id(receiver);
        let length = array_elements(vm, receiver).len();
        let index = assert_index_bounds("Array::removeAt", index, length)?;
        let removed = match vm.heap.data_mut(id) {
            ObjData::Array(elements) => elements.remove(index),
            _ => Value::Nil,
        };
        ok(removed)
    });
    vm.define_native_method(array, "indexOf", 1, false, |vm, receiver, args| {
        let elements = array_elements(vm, receiver);
        for (i, &element) in elements.iter().enumerate() {
            if element.equals(args[0]) {
                return ok(Value::Int(i as i32));
            }
        }
        ok(Value::Int(-1))
    });
    vm.define_native_method(array, "contains", 1, false, |vm, receiver, args| {
        let elements = array_elements(vm, receiver);
        ok(Value::Bool(elements.iter().any(|e| e.equals(args[0]))))
    });
    vm.define_native_method(array, "clear", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        if let ObjData::Array(elements) = vm.heap.data_mut(id) {
            elements.clear();
        }
        ok(receiver)
    });
    vm.define_native_method(array, "clone", 0, false, |vm, receiver, _args| {
        let elements = array_elements(vm, receiver);
        ok(Value::Obj(vm.heap.alloc(ObjData::Array(elements), None)))
    });
    vm.define_native_method(array, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
    vm.define_native_method(array, "next", 1, false, |vm, receiver, args| {
        let length = array_elements(vm, receiver).len();
        let next = match args[0] {
            Value::Nil => {
                if length > 0 {
                    Value::Int(0)
                } else {
                    Value::Nil
                }
            }
            Value::Int(i) => {
                if (i + 1) >= 0 && ((i + 1) as usize) < length {
                    Value::Int(i + 1)
                } else {
                    Value::Nil
                }
            }
            _ => Value::Nil,
        };
        ok(next)
    });
    vm.define_native_method(array, "nextValue", 1, false, |vm, receiver, args| {
        let index = assert_int("Array::nextValue", args, 0)?;
        let elements = array_elements(vm, receiver);
        let index = assert_index_bounds("Array::nextValue", index, elements.len())?;
        ok(elements[index])
    });
}

// ---------------------------------------------------------------------------
// Dictionary and Entry
// ---------------------------------------------------------------------------

fn register_dictionary_methods(vm: &mut Vm, dictionary: HeapId) {
    vm.define_native_method(dictionary, "length", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let length = match vm.heap.data(id) {
            ObjData::Dict(d) => d.entries.len(),
            _ => 0,
        };
        ok(Value::Int(length as i32))
    });
    vm.define_native_method(dictionary, "containsKey", 1, false, |vm, receiver, args| {
        if args[0].is_nil() {
            return throw(EXC_TYPE, "Dictionary keys may not be nil.".to_string());
        }
        let id = receiver_id(receiver);
        let present = match vm.heap.data(id) {
            ObjData::Dict(d) => d.entries.contains_key(&DictKey(args[0])),
            _ => false,
        };
        ok(Value::Bool(present))
    });
    vm.define_native_method(dictionary, "getAt", 1, false, |vm, receiver, args| {
        if args[0].is_nil() {
            return throw(EXC_TYPE, "Dictionary keys may not be nil.".to_string());
        }
        let id = receiver_id(receiver);
        let value = match vm.heap.data(id) {
            ObjData::Dict(d) => d.entries.get(&DictKey(args[0])).copied().unwrap_or(Value::Nil),
            _ => Value::Nil,
        };
        ok(value)
    });
    vm.define_native_method(dictionary, "putAt", 2, false, |vm, receiver, args| {
        if args[0].is_nil() {
            return throw(EXC_TYPE, "Dictionary keys may not be nil.".to_string());
        }
        let id = receiver_id(receiver);
        if let ObjData::Dict(d) = vm.heap.data_mut(id) {
            d.entries.insert(DictKey(args[0]), args[1]);
        }
        vm.heap.write_barrier(id, args[0]);
        vm.heap.write_barrier(id, args[1]);
        ok(receiver)
    });
    vm.define_native_method(dictionary, "removeAt", 1, false, |vm, receiver, args| {
        let id = receiver_id(receiver);
        let removed = match vm.heap.data_mut(id) {
            ObjData::Dict(d) => d
                .entries
                .shift_remove(&DictKey(args[0]))
                .unwrap_or(Value::Nil),
            _ => Value::Nil,
        };
        ok(removed)
    });
    vm.define_native_method(dictionary, "clear", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        if let ObjData::Dict(d) = vm.heap.data_mut(id) {
            d.entries.clear();
        }
        ok(receiver)
    });
    vm.define_native_method(dictionary, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
    vm.define_native_method(dictionary, "next", 1, false, |vm, receiver, args| {
        let id = receiver_id(receiver);
        let length = match vm.heap.data(id) {
            ObjData::Dict(d) => d.entries.len(),
            _ => 0,
        };
        let next = match args[0] {
            Value::Nil => {
                if length > 0 {
                    Value::Int(0)
                } else {
                    Value::Nil
                }
            }
            Value::Int(i) => {
                if (i + 1) >= 0 && ((i + 1) as usize) < length {
                    Value::Int(i + 1)
                } else {
                    Value::Nil
                }
            }
            _ => Value::Nil,
        };
        ok(next)
    });
    vm.define_native_method(dictionary, "nextValue", 1, false, |vm, receiver, args| {
        let index = assert_int("Dictionary::nextValue", args, 0)?;
        let id = receiver_id(receiver);
        let pair = match vm.heap.data(id) {
            ObjData::Dict(d) => d
                .entries
                .get_index(index as usize)
                .map(|(k, &v)| (k.0, v)),
            _ => None,
        };
        match pair {
            Some((key, value)) => {
                let entry = vm.heap.alloc(ObjData::Entry { key, value }, None);
                ok(Value::Obj(entry))
            }
            None => throw(
                crate::vm::EXC_INDEX,
                format!("Dictionary iteration index {} out of bounds.", index),
            ),
        }
    });
}

fn register_entry_methods(vm: &mut Vm, entry: HeapId) {
    vm.define_native_method(entry, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
}

// ---------------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------------

fn range_bounds(vm: &Vm, receiver: Value) -> (i32, i32) {
    match receiver {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Range { from, to } => (*from, *to),
            _ => (0, 0),
        },
        _ => (0, 0),
    }
}

fn range_length(from: i32, to: i32) -> i64 {
    (to as i64 - from as i64).abs() + 1
}

fn register_range_methods(vm: &mut Vm, range: HeapId) {
    vm.define_native_method(range, "length", 0, false, |vm, receiver, _args| {
        let (from, to) = range_bounds(vm, receiver);
        ok(Value::Int(range_length(from, to) as i32))
    });
    vm.define_native_method(range, "contains", 1, false, |vm, receiver, args| {
        let n = assert_int("Range::contains", args, 0)?;
        let (from, to) = range_bounds(vm, receiver);
        let (low, high) = if from <= to { (from, to) } else { (to, from) };
        ok(Value::Bool(n >= low && n <= high))
    });
    vm.define_native_method(range, "toArray", 0, false, |vm, receiver, _args| {
        let (from, to) = range_bounds(vm, receiver);
        let mut elements = Vec::new();
        if from <= to {
            for n in from..=to {
                elements.push(Value::Int(n));
            }
        } else {
            for n in (to..=from).rev() {
                elements.push(Value::Int(n));
            }
        }
        ok(Value::Obj(vm.heap.alloc(ObjData::Array(elements), None)))
    });
    vm.define_native_method(range, "toString", 0, false, |vm, receiver, _args| {
        let text = vm.display_value(receiver);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
    vm.define_native_method(range, "next", 1, false, |vm, receiver, args| {
        let (from, to) = range_bounds(vm, receiver);
        let length = range_length(from, to);
        let next = match args[0] {
            Value::Nil => {
                if length > 0 {
                    Value::Int(0)
                } else {
                    Value::Nil
                }
            }
            Value::Int(i) => {
                if ((i + 1) as i64) < length {
                    Value::Int(i + 1)
                } else {
                    Value::Nil
                }
            }
            _ => Value::Nil,
        };
        ok(next)
    });
    vm.define_native_method(range, "nextValue", 1, false, |vm, receiver, args| {
        let index = assert_int("Range::nextValue", args, 0)?;
        let (from, to) = range_bounds(vm, receiver);
        if (index as i64) >= range_length(from, to) || index < 0 {
            return throw(
                crate::vm::EXC_INDEX,
                format!("Range iteration index {} out of bounds.", index),
            );
        }
        let value = if from <= to { from + index } else { from - index };
        ok(Value::Int(value))
    });
}

// ---------------------------------------------------------------------------
// LinkedList (doubly-linked, built from Node objects)
// ---------------------------------------------------------------------------

fn register_linked_list_methods(vm: &mut Vm, linked_list: HeapId) {
    vm.define_native_interceptor(linked_list, InterceptorKind::Init, -1, |vm, receiver, args| {
        assert_arity("LinkedList::init", 0, args.len())?;
        let class = receiver_id(receiver);
        let instance = vm.heap.alloc(ObjData::Instance { fields: Vec::new() }, Some(class));
        let head = vm.heap.copy_string("head");
        let tail = vm.heap.copy_string("tail");
        let length = vm.heap.copy_string("length");
        set_instance_field(vm, instance, head, Value::Nil);
        set_instance_field(vm, instance, tail, Value::Nil);
        set_instance_field(vm, instance, length, Value::Int(0));
        ok(Value::Obj(instance))
    });
    vm.define_native_method(linked_list, "length", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let length = vm.heap.copy_string("length");
        ok(instance_field(vm, id, length))
    });
    vm.define_native_method(linked_list, "append", 1, false, |vm, receiver, args| {
        let id = receiver_id(receiver);
        let head_name = vm.heap.copy_string("head");
        let tail_name = vm.heap.copy_string("tail");
        let length_name = vm.heap.copy_string("length");
        let tail = instance_field(vm, id, tail_name);
        let node = vm.heap.alloc(
            ObjData::Node {
                element: args[0],
                prev: tail.as_obj(),
                next: None,
            },
            None,
        );
        match tail {
            Value::Obj(tail_id) => {
                if let ObjData::Node { next, .. } = vm.heap.data_mut(tail_id) {
                    *next = Some(node);
                }
                vm.heap.write_barrier(tail_id, Value::Obj(node));
            }
            _ => set_instance_field(vm, id, head_name, Value::Obj(node)),
        }
        set_instance_field(vm, id, tail_name, Value::Obj(node));
        let length = match instance_field(vm, id, length_name) {
            Value::Int(n) => n,
            _ => 0,
        };
        set_instance_field(vm, id, length_name, Value::Int(length + 1));
        ok(receiver)
    });
    vm.define_native_method(linked_list, "prepend", 1, false, |vm, receiver, args| {
        let id = receiver_id(receiver);
        let head_name = vm.heap.copy_string("head");
        let tail_name = vm.heap.copy_string("tail");
        let length_name = vm.heap.copy_string("length");
        let head = instance_field(vm, id, head_name);
        let node = vm.heap.alloc(
            ObjData::Node {
                element: args[0],
                prev: None,
                next: head.as_obj(),
            },
            None,
        );
        match head {
            Value::Obj(head_id) => {
                if let ObjData::Node { prev, .. } = vm.heap.data_mut(head_id) {
                    *prev = Some(node);
                }
                vm.heap.write_barrier(head_id, Value::Obj(node));
            }
            _ => set_instance_field(vm, id, tail_name, Value::Obj(node)),
        }
        set_instance_field(vm, id, head_name, Value::Obj(node));
        let length = match instance_field(vm, id, length_name) {
            Value::Int(n) => n,
            _ => 0,
        };
        set_instance_field(vm, id, length_name, Value::Int(length + 1));
        ok(receiver)
    });
    vm.define_native_method(linked_list, "next", 1, false, |vm, receiver, args| {
        let id = receiver_id(receiver);
        match args[0] {
            Value::Nil => {
                let head_name = vm.heap.copy_string("head");
                ok(instance_field(vm, id, head_name))
            }
            Value::Obj(node_id) => match vm.heap.data(node_id) {
                ObjData::Node { next, .. } => match next {
                    Some(next_id) => ok(Value::Obj(*next_id)),
                    None => ok(Value::Nil),
                },
                _ => ok(Value::Nil),
            },
            _ => ok(Value::Nil),
        }
    });
    vm.define_native_method(linked_list, "nextValue", 1, false, |vm, _receiver, args| {
        match args[0] {
            Value::Obj(node_id) => match vm.heap.data(node_id) {
                ObjData::Node { element, .. } => ok(*element),
                _ => ok(Value::Nil),
            },
            _ => ok(Value::Nil),
        }
    });
    vm.define_native_method(linked_list, "toString", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let head_name = vm.heap.copy_string("head");
        let mut parts = Vec::new();
        let mut current = instance_field(vm, id, head_name).as_obj();
        while let Some(node_id) = current {
            match vm.heap.data(node_id) {
                ObjData::Node { element, next, .. } => {
                    parts.push(vm.display_value(*element));
                    current = *next;
                }
                _ => break,
            }
        }
        let text = format!("[{}]", parts.join(" -> "));
        ok(Value::Obj(vm.heap.take_string(text)))
    });
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

fn register_exception_methods(vm: &mut Vm, exception: HeapId) {
    // Constructor: Error("message") builds an exception carrying the
    // message; the stack trace fills in at throw time.
    vm.define_native_interceptor(exception, InterceptorKind::Init, -1, |vm, receiver, args| {
        let class = receiver_id(receiver);
        let message = match args.first() {
            Some(&value) => stringify(vm, value)?,
            None => String::new(),
        };
        ok(vm.create_exception(class, message))
    });
    vm.define_native_method(exception, "toString", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let class = vm.class_of(receiver);
        let class_name = vm.class_full_name(class).to_string();
        let message = match vm.heap.data(id) {
            ObjData::Exception { message, .. } => vm.display_value(*message),
            _ => String::new(),
        };
        let text = format!("{}: {}", class_name, message);
        ok(Value::Obj(vm.heap.take_string(text)))
    });
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

fn generator_receiver(vm: &Vm, receiver: Value) -> Result<HeapId, NativeError> {
    match receiver {
        Value::Obj(id) if matches!(vm.heap.data(id), ObjData::Generator(_)) => Ok(id),
        _ => Err(NativeError::Throw {
            class: EXC_TYPE,
            message: "Receiver is not a generator.".to_string(),
        }),
    }
}

fn register_generator_methods(vm: &mut Vm, generator: HeapId) {
    // Iteration protocol: `next(index)` resumes and produces the next index
    // or nil once exhausted; `nextValue(index)` reads the yielded value.
    vm.define_native_method(generator, "next", 1, false, |vm, receiver, args| {
        let id = generator_receiver(vm, receiver)?;
        let state = vm.generator_data(id).state;
        if state == GeneratorState::Return || state == GeneratorState::Error {
            return ok(Value::Nil);
        }
        to_native_result(vm.resume_generator(id, ResumeInput::Value(args[0])))?;
        if vm.generator_data(id).state == GeneratorState::Return {
            return ok(Value::Nil);
        }
        let next = match args[0] {
            Value::Int(i) => Value::Int(i + 1),
            _ => Value::Int(0),
        };
        ok(next)
    });
    vm.define_native_method(generator, "nextValue", 1, false, |vm, receiver, _args| {
        let id = generator_receiver(vm, receiver)?;
        ok(vm.generator_data(id).value)
    });
    vm.define_native_method(generator, "send", 1, false, |vm, receiver, args| {
        let id = generator_receiver(vm, receiver)?;
        let state = vm.generator_data(id).state;
        if state == GeneratorState::Return || state == GeneratorState::Error {
            return throw(EXC_TYPE, "Cannot resume a finished generator.".to_string());
        }
        let result = to_native_result(vm.resume_generator(id, ResumeInput::Value(args[0])))?;
        ok(result)
    });
    vm.define_native_method(generator, "throws", 1, false, |vm, receiver, args| {
        let id = generator_receiver(vm, receiver)?;
        let valid = matches!(args[0], Value::Obj(e)
            if matches!(vm.heap.data(e), ObjData::Exception { .. }));
        if !valid {
            return throw(EXC_TYPE, "Can only throw exception instances.".to_string());
        }
        to_native_result(vm.throw_into_generator(id, args[0]).map(|_| Value::Nil))?;
        let result = to_native_result(vm.resume_generator(id, ResumeInput::Value(Value::Nil)))?;
        ok(result)
    });
    vm.define_native_method(generator, "returns", 1, false, |vm, receiver, args| {
        let id = generator_receiver(vm, receiver)?;
        let generator_obj = vm.generator_data_mut(id);
        generator_obj.state = GeneratorState::Return;
        generator_obj.value = args[0];
        ok(args[0])
    });
    vm.define_native_method(generator, "isFinished", 0, false, |vm, receiver, _args| {
        let id = generator_receiver(vm, receiver)?;
        let state = vm.generator_data(id).state;
        ok(Value::Bool(
            state == GeneratorState::Return || state == GeneratorState::Error,
        ))
    });
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

fn promise_receiver(vm: &Vm, receiver: Value) -> Result<HeapId, NativeError> {
    match receiver {
        Value::Obj(id) if matches!(vm.heap.data(id), ObjData::Promise(_)) => Ok(id),
        _ => Err(NativeError::Throw {
            class: EXC_TYPE,
            message: "Receiver is not a promise.".to_string(),
        }),
    }
}

fn promise_array_arg(vm: &Vm, method: &str, args: &[Value]) -> Result<Vec<Value>, NativeError> {
    let array = assert_array(vm, method, args, 0)?;
    match vm.heap.data(array) {
        ObjData::Array(elements) => Ok(elements.clone()),
        _ => Ok(Vec::new()),
    }
}

fn register_promise_methods(vm: &mut Vm, promise: HeapId) {
    // Cold construction: `Promise(executor)` runs the executor synchronously
    // with resolve/reject closures bound to the new promise.
    vm.define_native_interceptor(promise, InterceptorKind::Init, 1, |vm, receiver, args| {
        let class = receiver_id(receiver);
        let executor = assert_callable(vm, "Promise::init", args, 0)?;
        let p = vm.new_pending_promise();
        vm.heap.header_mut(p).class = Some(class);
        if let ObjData::Promise(promise_obj) = vm.heap.data_mut(p) {
            promise_obj.executor = executor;
        }
        let fulfill_name = vm.heap.copy_string("fulfill");
        let reject_name = vm.heap.copy_string("reject");
        let fulfill = vm.lookup_method(vm.core.promise, fulfill_name).unwrap_or(Value::Nil);
        let reject = vm.lookup_method(vm.core.promise, reject_name).unwrap_or(Value::Nil);
        let resolve_bound = vm.heap.alloc(
            ObjData::BoundMethod { receiver: Value::Obj(p), method: fulfill },
            None,
        );
        let reject_bound = vm.heap.alloc(
            ObjData::BoundMethod { receiver: Value::Obj(p), method: reject },
            None,
        );
        to_native_result(vm.call_function_value(
            executor,
            &[Value::Obj(resolve_bound), Value::Obj(reject_bound)],
        ))?;
        ok(Value::Obj(p))
    });

    vm.define_native_method(promise, "then", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        let handler = assert_callable(vm, "Promise::then", args, 0)?;
        to_native_result(vm.promise_then(id, handler).map(|_| receiver))
    });
    vm.define_native_method(promise, "catch", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        let handler = assert_callable(vm, "Promise::catch", args, 0)?;
        to_native_result(vm.promise_catch(id, handler).map(|_| receiver))
    });
    vm.define_native_method(promise, "finally", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        let handler = assert_callable(vm, "Promise::finally", args, 0)?;
        to_native_result(vm.promise_finally(id, handler).map(|_| receiver))
    });
    vm.define_native_method(promise, "fulfill", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        to_native_result(vm.fulfill_promise(id, args[0]).map(|_| receiver))
    });
    vm.define_native_method(promise, "reject", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        let exception = match args[0] {
            Value::Obj(e) if matches!(vm.heap.data(e), ObjData::Exception { .. }) => args[0],
            other => {
                let class = vm.lookup_class_by_full_name(
                    "kestrel.lang.PromiseRejectionException",
                );
                let message = stringify(vm, other)?;
                vm.create_exception(class, message)
            }
        };
        to_native_result(vm.reject_promise(id, exception).map(|_| receiver))
    });
    vm.define_native_method(promise, "isSettled", 0, false, |vm, receiver, _args| {
        let id = promise_receiver(vm, receiver)?;
        ok(Value::Bool(vm.promise_state(id) != PromiseState::Pending))
    });

    // Internal combinator hooks; context rides in the capture dictionary.
    vm.define_native_method(promise, "thenAll", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        let all = vm.promise_captured(id, "all");
        let results = vm.promise_captured(id, "results");
        let index = vm.promise_captured(id, "index");
        let (Value::Obj(all_id), Value::Obj(results_id), Value::Int(index)) =
            (all, results, index)
        else {
            return ok(Value::Nil);
        };
        if let ObjData::Array(elements) = vm.heap.data_mut(results_id) {
            if (index as usize) < elements.len() {
                elements[index as usize] = args[0];
            }
        }
        vm.heap.write_barrier(results_id, args[0]);
        let remaining = match vm.promise_captured(all_id, "remaining") {
            Value::Int(n) => n - 1,
            _ => 0,
        };
        vm.promise_capture(all_id, "remaining", Value::Int(remaining));
        if remaining <= 0 {
            to_native_result(
                vm.fulfill_promise(all_id, Value::Obj(results_id)).map(|_| Value::Nil),
            )?;
        }
        ok(Value::Nil)
    });
    vm.define_native_method(promise, "catchAll", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        if let Value::Obj(all_id) = vm.promise_captured(id, "all") {
            to_native_result(vm.reject_promise(all_id, args[0]).map(|_| Value::Nil))?;
        }
        ok(Value::Nil)
    });
    vm.define_native_method(promise, "raceAll", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        if let Value::Obj(race_id) = vm.promise_captured(id, "race") {
            to_native_result(vm.fulfill_promise(race_id, args[0]).map(|_| Value::Nil))?;
        }
        ok(Value::Nil)
    });
    vm.define_native_method(promise, "catchRace", 1, false, |vm, receiver, args| {
        let id = promise_receiver(vm, receiver)?;
        if let Value::Obj(race_id) = vm.promise_captured(id, "race") {
            to_native_result(vm.reject_promise(race_id, args[0]).map(|_| Value::Nil))?;
        }
        ok(Value::Nil)
    });
    // Timer hook used by `sleep`.
    vm.define_native_method(promise, "settleSleep", 0, false, |vm, receiver, _args| {
        let id = promise_receiver(vm, receiver)?;
        to_native_result(vm.fulfill_promise(id, Value::Nil).map(|_| Value::Nil))
    });

    // Class-side combinators.
    let promise_meta = vm.metaclass_of(promise);
    vm.define_native_method(promise_meta, "all", 1, false, |vm, _receiver, args| {
        let promises = promise_array_arg(vm, "Promise.all", args)?;
        let all = to_native_result(
            vm.promise_all(&promises).map(Value::Obj),
        )?;
        ok(all)
    });
    vm.define_native_method(promise_meta, "race", 1, false, |vm, _receiver, args| {
        let promises = promise_array_arg(vm, "Promise.race", args)?;
        let race = to_native_result(vm.promise_race(&promises).map(Value::Obj))?;
        ok(race)
    });
    vm.define_native_method(promise_meta, "fulfilled", 1, false, |vm, _receiver, args| {
        let p = vm.new_pending_promise();
        to_native_result(vm.fulfill_promise(p, args[0]).map(|_| Value::Obj(p)))
    });
    vm.define_native_method(promise_meta, "rejected", 1, false, |vm, _receiver, args| {
        let p = vm.new_pending_promise();
        let exception = match args[0] {
            Value::Obj(e) if matches!(vm.heap.data(e), ObjData::Exception { .. }) => args[0],
            other => {
                let class = vm.lookup_class_by_full_name(
                    "kestrel.lang.PromiseRejectionException",
                );
                let message = stringify(vm, other)?;
                vm.create_exception(class, message)
            }
        };
        to_native_result(vm.reject_promise(p, exception).map(|_| Value::Obj(p)))
    });
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

fn register_timer_methods(vm: &mut Vm, timer: HeapId) {
    vm.define_native_interceptor(timer, InterceptorKind::Init, 3, |vm, receiver, args| {
        let class = receiver_id(receiver);
        let closure = assert_callable(vm, "Timer::init", args, 0)?;
        let delay = assert_int("Timer::init", args, 1)?;
        let interval = assert_int("Timer::init", args, 2)?;
        if delay < 0 || interval < 0 {
            return throw(EXC_ARGUMENT, "Timer delays must be non-negative.".to_string());
        }
        let t = vm.heap.alloc(
            ObjData::Timer(TimerObj {
                closure,
                delay_ms: delay as u64,
                interval_ms: interval as u64,
                timer_id: None,
                running: false,
            }),
            Some(class),
        );
        ok(Value::Obj(t))
    });
    vm.define_native_method(timer, "run", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let (delay, interval, running) = match vm.heap.data(id) {
            ObjData::Timer(t) => (t.delay_ms, t.interval_ms, t.running),
            _ => return throw(EXC_TYPE, "Receiver is not a timer.".to_string()),
        };
        if running {
            return throw(EXC_TYPE, "Timer is already running.".to_string());
        }
        let handle = vm.event_loop.schedule_timer(id, delay, interval);
        if let ObjData::Timer(t) = vm.heap.data_mut(id) {
            t.timer_id = Some(handle);
            t.running = true;
        }
        ok(receiver)
    });
    vm.define_native_method(timer, "stop", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let handle = match vm.heap.data_mut(id) {
            ObjData::Timer(t) => {
                t.running = false;
                t.timer_id.take()
            }
            _ => None,
        };
        if let Some(handle) = handle {
            vm.event_loop.cancel_timer(handle);
        }
        ok(receiver)
    });
    vm.define_native_method(timer, "isRunning", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let running = match vm.heap.data(id) {
            ObjData::Timer(t) => t.running,
            _ => false,
        };
        ok(Value::Bool(running))
    });
}

// ---------------------------------------------------------------------------
// Random (external RNG state embedded through a Record)
// ---------------------------------------------------------------------------

fn random_rng<'a>(vm: &'a mut Vm, receiver: Value) -> Result<&'a mut SmallRng, NativeError> {
    let id = receiver_id(receiver);
    match vm.heap.data_mut(id) {
        ObjData::Record(record) => match record.data.downcast_mut::<SmallRng>() {
            Some(rng) => Ok(rng),
            None => Err(NativeError::Throw {
                class: EXC_TYPE,
                message: "Record does not hold RNG state.".to_string(),
            }),
        },
        _ => Err(NativeError::Throw {
            class: EXC_TYPE,
            message: "Receiver is not a Random.".to_string(),
        }),
    }
}

fn register_random_methods(vm: &mut Vm, random: HeapId) {
    vm.define_native_interceptor(random, InterceptorKind::Init, -1, |vm, receiver, args| {
        let class = receiver_id(receiver);
        let rng = match args.first() {
            Some(Value::Int(seed)) => SmallRng::seed_from_u64(*seed as u64),
            None => SmallRng::from_entropy(),
            _ => {
                return throw(EXC_ARGUMENT, "Random seed must be an integer.".to_string());
            }
        };
        let record = vm.heap.alloc(
            ObjData::Record(RecordObj {
                data: Box::new(rng),
            }),
            Some(class),
        );
        ok(Value::Obj(record))
    });
    vm.define_native_method(random, "nextInt", 0, false, |vm, receiver, _args| {
        let rng = random_rng(vm, receiver)?;
        ok(Value::Int(rng.gen::<i32>()))
    });
    vm.define_native_method(random, "nextIntBounded", 1, false, |vm, receiver, args| {
        let bound = assert_int("Random::nextIntBounded", args, 0)?;
        if bound <= 0 {
            return throw(EXC_ARGUMENT, "Bound must be positive.".to_string());
        }
        let rng = random_rng(vm, receiver)?;
        ok(Value::Int(rng.gen_range(0..bound)))
    });
    vm.define_native_method(random, "nextFloat", 0, false, |vm, receiver, _args| {
        let rng = random_rng(vm, receiver)?;
        ok(Value::Float(rng.gen::<f64>()))
    });
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

fn file_read_to_string(vm: &mut Vm, id: HeapId) -> Result<String, NativeError> {
    use std::io::{Read, Seek, SeekFrom};
    match vm.heap.data_mut(id) {
        ObjData::File(file) => {
            if !file.is_open {
                return Err(NativeError::Throw {
                    class: EXC_IO,
                    message: "File is closed.".to_string(),
                });
            }
            let offset = file.offset;
            match file.handle.as_mut() {
                Some(handle) => {
                    let mut contents = String::new();
                    handle
                        .seek(SeekFrom::Start(offset))
                        .and_then(|_| handle.read_to_string(&mut contents))
                        .map_err(|e| NativeError::Throw {
                            class: EXC_IO,
                            message: format!("Read failed: {}.", e),
                        })?;
                    file.offset = offset + contents.len() as u64;
                    Ok(contents)
                }
                None => Err(NativeError::Throw {
                    class: EXC_IO,
                    message: "File is closed.".to_string(),
                }),
            }
        }
        _ => Err(NativeError::Throw {
            class: EXC_TYPE,
            message: "Receiver is not a file.".to_string(),
        }),
    }
}

fn file_write_str(vm: &mut Vm, id: HeapId, text: &str) -> Result<usize, NativeError> {
    use std::io::Write;
    match vm.heap.data_mut(id) {
        ObjData::File(file) => {
            if !file.is_open {
                return Err(NativeError::Throw {
                    class: EXC_IO,
                    message: "File is closed.".to_string(),
                });
            }
            match file.handle.as_mut() {
                Some(handle) => {
                    handle
                        .write_all(text.as_bytes())
                        .and_then(|_| handle.flush())
                        .map_err(|e| NativeError::Throw {
                            class: EXC_IO,
                            message: format!("Write failed: {}.", e),
                        })?;
                    file.offset += text.len() as u64;
                    Ok(text.len())
                }
                None => Err(NativeError::Throw {
                    class: EXC_IO,
                    message: "File is closed.".to_string(),
                }),
            }
        }
        _ => Err(NativeError::Throw {
            class: EXC_TYPE,
            message: "Receiver is not a file.".to_string(),
        }),
    }
}

fn register_file_methods(vm: &mut Vm, file: HeapId) {
    vm.define_native_interceptor(file, InterceptorKind::Init, 2, |vm, receiver, args| {
        use std::fs::OpenOptions;
        let class = receiver_id(receiver);
        let path_id = assert_string(vm, "File::init", args, 0)?;
        let mode_id = assert_string(vm, "File::init", args, 1)?;
        let path = vm.heap.str(path_id).to_string();
        let mode = vm.heap.str(mode_id).to_string();
        let handle = match mode.as_str() {
            "r" => OpenOptions::new().read(true).open(&path),
            "w" => OpenOptions::new().write(true).create(true).truncate(true).open(&path),
            "a" => OpenOptions::new().append(true).create(true).open(&path),
            other => {
                return throw(
                    EXC_ARGUMENT,
                    format!("Unsupported file mode '{}'.", other),
                )
            }
        };
        let handle = handle.map_err(|e| NativeError::Throw {
            class: EXC_IO,
            message: format!("Cannot open '{}': {}.", path, e),
        })?;
        let f = vm.heap.alloc(
            ObjData::File(FileObj {
                path: path_id,
                mode,
                is_open: true,
                offset: 0,
                handle: Some(handle),
            }),
            Some(class),
        );
        ok(Value::Obj(f))
    });
    vm.define_native_method(file, "read", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let contents = file_read_to_string(vm, id)?;
        ok(Value::Obj(vm.heap.take_string(contents)))
    });
    vm.define_native_method(file, "readLine", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let remaining = file_read_to_string(vm, id)?;
        let line_length = match remaining.find('\n') {
            Some(pos) => pos + 1,
            None => remaining.len(),
        };
        // Rewind past what we over-read.
        if let ObjData::File(f) = vm.heap.data_mut(id) {
            f.offset = f.offset - remaining.len() as u64 + line_length as u64;
        }
        let line = remaining[..line_length].trim_end_matches('\n').to_string();
        ok(Value::Obj(vm.heap.take_string(line)))
    });
    vm.define_native_method(file, "write", 1, false, |vm, receiver, args| {
        let text_id = assert_string(vm, "File::write", args, 0)?;
        let text = vm.heap.str(text_id).to_string();
        let id = receiver_id(receiver);
        let written = file_write_str(vm, id, &text)?;
        ok(Value::Int(written as i32))
    });
    vm.define_native_method(file, "close", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        // Idempotent: closing a closed file is a no-op.
        if let ObjData::File(f) = vm.heap.data_mut(id) {
            f.is_open = false;
            f.handle = None;
        }
        ok(Value::Nil)
    });
    vm.define_native_method(file, "isOpen", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let open = match vm.heap.data(id) {
            ObjData::File(f) => f.is_open,
            _ => false,
        };
        ok(Value::Bool(open))
    });
    vm.define_native_method(file, "size", 0, false, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let path = match vm.heap.data(id) {
            ObjData::File(f) => vm.heap.str(f.path).to_string(),
            _ => return throw(EXC_TYPE, "Receiver is not a file.".to_string()),
        };
        let length = std::fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| NativeError::Throw {
                class: EXC_IO,
                message: format!("Cannot stat '{}': {}.", path, e),
            })?;
        if length <= i32::MAX as u64 {
            ok(Value::Int(length as i32))
        } else {
            ok(Value::Float(length as f64))
        }
    });
    // Async variants settle a promise through the event loop, preserving
    // the loop's FIFO ordering relative to timers.
    vm.define_native_method(file, "readAsync", 0, true, |vm, receiver, _args| {
        let id = receiver_id(receiver);
        let promise = vm.new_pending_promise();
        match file_read_to_string(vm, id) {
            Ok(contents) => {
                let value = Value::Obj(vm.heap.take_string(contents));
                vm.event_loop.enqueue(LoopTask::Settle {
                    promise,
                    value,
                    reject: false,
                });
            }
            Err(NativeError::Throw { class, message }) => {
                let class = vm.lookup_class_by_full_name(class);
                let exception = vm.create_exception(class, message);
                vm.event_loop.enqueue(LoopTask::Settle {
                    promise,
                    value: exception,
                    reject: true,
                });
            }
            Err(NativeError::Propagate(exception)) => {
                vm.event_loop.enqueue(LoopTask::Settle {
                    promise,
                    value: exception,
                    reject: true,
                });
            }
        }
        ok(Value::Obj(promise))
    });
    vm.define_native_method(file, "writeAsync", 1, true, |vm, receiver, args| {
        let text_id = assert_string(vm, "File::writeAsync", args, 0)?;
        let text = vm.heap.str(text_id).to_string();
        let id = receiver_id(receiver);
        let promise = vm.new_pending_promise();
        match file_write_str(vm, id, &text) {
            Ok(written) => {
                vm.event_loop.enqueue(LoopTask::Settle {
                    promise,
                    value: Value::Int(written as i32),
                    reject: false,
                });
            }
            Err(NativeError::Throw { class, message }) => {
                let class = vm.lookup_class_by_full_name(class);
                let exception = vm.create_exception(class, message);
                vm.event_loop.enqueue(LoopTask::Settle {
                    promise,
                    value: exception,
                    reject: true,
                });
            }
            Err(NativeError::Propagate(exception)) => {
                vm.event_loop.enqueue(LoopTask::Settle {
                    promise,
                    value: exception,
                    reject: true,
                });
            }
        }
        ok(Value::Obj(promise))
    });

    let file_meta = vm.metaclass_of(file);
    vm.define_native_method(file_meta, "exists", 1, false, |vm, _receiver, args| {
        let path_id = assert_string(vm, "File.exists", args, 0)?;
        let path = vm.heap.str(path_id).to_string();
        ok(Value::Bool(std::path::Path::new(&path).exists()))
    });
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

fn register_free_functions(vm: &mut Vm) {
    vm.define_native_function("print", -1, false, |vm, args| {
        let mut parts = Vec::with_capacity(args.len());
        for &arg in args {
            parts.push(stringify(vm, arg)?);
        }
        println!("{}", parts.join(" "));
        ok(Value::Nil)
    });
    vm.define_native_function("println", -1, false, |vm, args| {
        let mut parts = Vec::with_capacity(args.len());
        for &arg in args {
            parts.push(stringify(vm, arg)?);
        }
        println!("{}", parts.join(" "));
        ok(Value::Nil)
    });
    vm.define_native_function("version", 0, false, |vm, _args| {
        let version = vm.conf.version.clone();
        ok(Value::Obj(vm.heap.take_string(version)))
    });
    vm.define_native_function("clock", 0, false, |vm, _args| {
        ok(Value::Float(vm.clock_seconds()))
    });
    vm.define_native_function("microseconds", 0, false, |vm, _args| {
        ok(Value::Float(vm.clock_micros() as f64))
    });
    // Async: fulfills with nil after `ms` milliseconds.
    vm.define_native_function("sleep", 1, true, |vm, args| {
        let ms = assert_int("sleep", args, 0)?;
        if ms < 0 {
            return throw(EXC_ARGUMENT, "sleep expects a non-negative delay.".to_string());
        }
        let promise = vm.new_pending_promise();
        let settle_name = vm.heap.copy_string("settleSleep");
        let settle = vm
            .lookup_method(vm.core.promise, settle_name)
            .unwrap_or(Value::Nil);
        let bound = vm.heap.alloc(
            ObjData::BoundMethod {
                receiver: Value::Obj(promise),
                method: settle,
            },
            None,
        );
        let timer = vm.heap.alloc(
            ObjData::Timer(TimerObj {
                closure: Value::Obj(bound),
                delay_ms: ms as u64,
                interval_ms: 0,
                timer_id: None,
                running: true,
            }),
            Some(vm.core.timer),
        );
        let handle = vm.event_loop.schedule_timer(timer, ms as u64, 0);
        if let ObjData::Timer(t) = vm.heap.data_mut(timer) {
            t.timer_id = Some(handle);
        }
        ok(Value::Obj(promise))
    });
}
