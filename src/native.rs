/// Native interop: registration of native functions, methods and
/// interceptors against classes and namespaces, plus the standard argument
/// assertions native code validates its inputs with.
///
/// Natives receive copied argument vectors and may return a value, raise an
/// exception (entering normal propagation), or return a promise when
/// registered async.

use crate::object::{
    BehaviorKind, InterceptorKind, NativeError, NativeFn, NativeMethodFn, ObjData,
};
use crate::value::{HeapId, Value};
use crate::vm::{Vm, EXC_ARGUMENT};

impl Vm {
    /// Registers a global native function under `name`.
    pub fn define_native_function(
        &mut self,
        name: &str,
        arity: i32,
        is_async: bool,
        func: NativeFn,
    ) {
        let native = self.heap.alloc(
            ObjData::NativeFunction(crate::object::NativeFunctionObj {
                name: name.to_string(),
                arity,
                is_async,
                func,
            }),
            None,
        );
        let name_id = self.heap.copy_string(name);
        self.builtins.insert(name_id, Value::Obj(native));
    }

    /// Registers a native method on a class's method table.
    pub fn define_native_method(
        &mut self,
        class: HeapId,
        name: &str,
        arity: i32,
        is_async: bool,
        func: NativeMethodFn,
    ) {
        let native = self.heap.alloc(
            ObjData::NativeMethod(crate::object::NativeMethodObj {
                class,
                name: name.to_string(),
                arity,
                is_async,
                func,
            }),
            None,
        );
        let name_id = self.heap.copy_string(name);
        if let ObjData::Class(c) = self.heap.data_mut(class) {
            c.methods.insert(name_id, Value::Obj(native));
        }
    }

    /// Registers an interceptor method (INIT drives construction; the
    /// undefined-access kinds hook lookup misses).
    pub fn define_native_interceptor(
        &mut self,
        class: HeapId,
        kind: InterceptorKind,
        arity: i32,
        func: NativeMethodFn,
    ) {
        let name = match kind {
            InterceptorKind::Init => "INIT",
            InterceptorKind::BeforeInvoke => "BEFORE_INVOKE",
            InterceptorKind::AfterInvoke => "AFTER_INVOKE",
            InterceptorKind::UndefinedInvoke => "UNDEFINED_INVOKE",
            InterceptorKind::UndefinedGet => "UNDEFINED_GET",
            InterceptorKind::UndefinedSet => "UNDEFINED_SET",
        };
        let native = self.heap.alloc(
            ObjData::NativeMethod(crate::object::NativeMethodObj {
                class,
                name: name.to_string(),
                arity,
                is_async: false,
                func,
            }),
            None,
        );
        if let ObjData::Class(c) = self.heap.data_mut(class) {
            c.interceptors.insert(kind, Value::Obj(native));
        }
    }

    /// Creates a native class under `namespace`, copying the superclass's
    /// instance and class-side methods, and binds its short name globally.
    pub fn define_native_class(
        &mut self,
        name: &str,
        namespace: HeapId,
        superclass: Option<HeapId>,
    ) -> HeapId {
        let ns_full = match self.heap.data(namespace) {
            ObjData::Namespace(ns) => self.heap.str(ns.full_name).to_string(),
            _ => "kestrel".to_string(),
        };
        let full = format!("{}.{}", ns_full, name);
        let class = self.create_class(name, &full, BehaviorKind::Standard, true);

        if let Some(superclass) = superclass {
            let methods: Vec<(HeapId, Value)> = self
                .class_data(superclass)
                .methods
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect();
            let interceptors: Vec<(InterceptorKind, Value)> = self
                .class_data(superclass)
                .interceptors
                .iter()
                .map(|(&k, &v)| (k, v))
                .collect();
            {
                let class_obj = match self.heap.data_mut(class) {
                    ObjData::Class(c) => c,
                    _ => unreachable!("create_class returns a class"),
                };
                class_obj.superclass = Some(superclass);
                for (method_name, method) in methods {
                    class_obj.methods.insert(method_name, method);
                }
                for (kind, interceptor) in interceptors {
                    class_obj.interceptors.insert(kind, interceptor);
                }
            }
            // Class-side chain.
            let meta = self.heap.header(class).class;
            let super_meta = self.heap.header(superclass).class;
            if let (Some(meta), Some(super_meta)) = (meta, super_meta) {
                let meta_methods: Vec<(HeapId, Value)> = self
                    .class_data(super_meta)
                    .methods
                    .iter()
                    .map(|(&k, &v)| (k, v))
                    .collect();
                if let ObjData::Class(c) = self.heap.data_mut(meta) {
                    c.superclass = Some(super_meta);
                    for (method_name, method) in meta_methods {
                        c.methods.insert(method_name, method);
                    }
                }
            }
        }

        let name_id = self.heap.copy_string(name);
        if let ObjData::Namespace(ns) = self.heap.data_mut(namespace) {
            ns.values.insert(name_id, Value::Obj(class));
        }
        self.builtins.insert(name_id, Value::Obj(class));
        class
    }

    /// Creates (or finds) a child namespace of `enclosing`.
    pub fn define_native_namespace(&mut self, name: &str, enclosing: HeapId) -> HeapId {
        let name_id = self.heap.copy_string(name);
        let existing = match self.heap.data(enclosing) {
            ObjData::Namespace(ns) => ns.values.get(&name_id).copied(),
            _ => None,
        };
        if let Some(Value::Obj(id)) = existing {
            if matches!(self.heap.data(id), ObjData::Namespace(_)) {
                return id;
            }
        }
        let parent_full = match self.heap.data(enclosing) {
            ObjData::Namespace(ns) => self.heap.str(ns.full_name).to_string(),
            _ => "kestrel".to_string(),
        };
        let full = format!("{}.{}", parent_full, name);
        let full_id = self.heap.copy_string(&full);
        let namespace = self.heap.alloc(
            ObjData::Namespace(crate::object::NamespaceObj {
                short_name: name_id,
                full_name: full_id,
                enclosing: Some(enclosing),
                values: indexmap::IndexMap::new(),
            }),
            None,
        );
        if let ObjData::Namespace(ns) = self.heap.data_mut(enclosing) {
            ns.values.insert(name_id, Value::Obj(namespace));
        }
        namespace
    }

    /// The metaclass of a class object, where class-side methods live.
    pub fn metaclass_of(&self, class: HeapId) -> HeapId {
        self.heap.header(class).class.unwrap_or(self.core.class_class)
    }
}

// ---------------------------------------------------------------------------
// Argument assertions
// ---------------------------------------------------------------------------

fn argument_error(method: &str, message: String) -> NativeError {
    NativeError::Throw {
        class: EXC_ARGUMENT,
        message: format!("Method {} {}", method, message),
    }
}

pub fn assert_arity(method: &str, expected: usize, actual: usize) -> Result<(), NativeError> {
    if expected != actual {
        return Err(argument_error(
            method,
            format!("expects {} argument(s) but got {} instead.", expected, actual),
        ));
    }
    Ok(())
}

pub fn assert_int(method: &str, args: &[Value], index: usize) -> Result<i32, NativeError> {
    match args.get(index) {
        Some(Value::Int(n)) => Ok(*n),
        _ => Err(argument_error(
            method,
            format!("expects argument {} to be an integer number.", index + 1),
        )),
    }
}

pub fn assert_number(method: &str, args: &[Value], index: usize) -> Result<f64, NativeError> {
    match args.get(index) {
        Some(v) if v.is_number() => Ok(v.as_f64()),
        _ => Err(argument_error(
            method,
            format!("expects argument {} to be a number.", index + 1),
        )),
    }
}

pub fn assert_string(
    vm: &Vm,
    method: &str,
    args: &[Value],
    index: usize,
) -> Result<HeapId, NativeError> {
    match args.get(index) {
        Some(Value::Obj(id)) if matches!(vm.heap.data(*id), ObjData::Str(_)) => Ok(*id),
        _ => Err(argument_error(
            method,
            format!("expects argument {} to be a string.", index + 1),
        )),
    }
}

pub fn assert_array(
    vm: &Vm,
    method: &str,
    args: &[Value],
    index: usize,
) -> Result<HeapId, NativeError> {
    match args.get(index) {
        Some(Value::Obj(id)) if matches!(vm.heap.data(*id), ObjData::Array(_)) => Ok(*id),
        _ => Err(argument_error(
            method,
            format!("expects argument {} to be an array.", index + 1),
        )),
    }
}

pub fn assert_callable(
    vm: &Vm,
    method: &str,
    args: &[Value],
    index: usize,
) -> Result<Value, NativeError> {
    match args.get(index) {
        Some(Value::Obj(id))
            if matches!(
                vm.heap.data(*id),
                ObjData::Closure(_)
                    | ObjData::NativeFunction(_)
                    | ObjData::NativeMethod(_)
                    | ObjData::BoundMethod { .. }
            ) =>
        {
            Ok(args[index])
        }
        _ => Err(argument_error(
            method,
            format!("expects argument {} to be a callable.", index + 1),
        )),
    }
}

pub fn assert_index_bounds(
    method: &str,
    index: i32,
    length: usize,
) -> Result<usize, NativeError> {
    if index >= 0 && (index as usize) < length {
        Ok(index as usize)
    } else {
        Err(NativeError::Throw {
            class: crate::vm::EXC_INDEX,
            message: format!(
                "Method {} index {} out of bounds for length {}.",
                method, index, length
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_arity_mismatch_formats_message() {
        let err = assert_arity("Array::insertAt", 2, 1).expect_err("mismatch");
        match err {
            NativeError::Throw { class, message } => {
                assert_eq!(class, EXC_ARGUMENT);
                assert!(message.contains("expects 2 argument(s) but got 1"));
            }
            _ => panic!("expected a throw"),
        }
    }

    #[test]
    fn test_assert_int_rejects_floats() {
        let err = assert_int("Range::contains", &[Value::Float(1.5)], 0).expect_err("float");
        assert!(matches!(err, NativeError::Throw { .. }));
    }

    #[test]
    fn test_assert_index_bounds() {
        assert_eq!(assert_index_bounds("Array::getAt", 2, 5).ok(), Some(2));
        assert!(assert_index_bounds("Array::getAt", 5, 5).is_err());
        assert!(assert_index_bounds("Array::getAt", -1, 5).is_err());
    }
}
