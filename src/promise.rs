/// Promise state machine and combinators.
///
/// A promise settles exactly once: later settlements are ignored, so
/// attached handlers never re-fire with a different value. Handlers attach
/// through `then`/`catch`/`finally` and run in attachment order once the
/// promise settles (immediately on attach when it already has). Await
/// continuations parked by the async driver resume their generator on the
/// settlement path.
///
/// `Promise.all` and `Promise.race` wire internal `thenAll`/`catchAll`/
/// `raceAll` hooks whose context travels in each promise's capture
/// dictionary (input index, results array, outer promise, remaining count).

use crate::object::{ObjData, PromiseState};
use crate::value::{DictKey, HeapId, Value};
use crate::vm::{RunResult, Unwind, Vm};

impl Vm {
    pub fn promise_state(&self, promise: HeapId) -> PromiseState {
        match self.heap.data(promise) {
            ObjData::Promise(p) => p.state,
            other => panic!("expected Promise, found {}", other.kind_name()),
        }
    }

    /// Settles a promise as fulfilled: runs `then` handlers in attachment
    /// order, the finally hook, then resumes parked await continuations.
    pub fn fulfill_promise(&mut self, promise: HeapId, value: Value) -> RunResult<()> {
        let (handlers, on_finally, continuations) = {
            let p = match self.heap.data_mut(promise) {
                ObjData::Promise(p) => p,
                other => panic!("expected Promise, found {}", other.kind_name()),
            };
            if p.state != PromiseState::Pending {
                return Ok(());
            }
            p.state = PromiseState::Fulfilled;
            p.value = value;
            (
                std::mem::take(&mut p.handlers),
                p.on_finally,
                std::mem::take(&mut p.continuations),
            )
        };
        self.heap.write_barrier(promise, value);

        for handler in handlers {
            self.call_function_value(handler, &[value])?;
        }
        if !on_finally.is_nil() {
            self.call_function_value(on_finally, &[value])?;
        }
        for continuation in continuations {
            self.drive_async(
                continuation.generator,
                continuation.driver,
                crate::vm::ResumeInput::Value(value),
            )?;
        }
        Ok(())
    }

    /// Settles a promise as rejected: runs the catch and finally hooks, then
    /// throws into parked await continuations.
    pub fn reject_promise(&mut self, promise: HeapId, exception: Value) -> RunResult<()> {
        let (on_catch, on_finally, continuations) = {
            let p = match self.heap.data_mut(promise) {
                ObjData::Promise(p) => p,
                other => panic!("expected Promise, found {}", other.kind_name()),
            };
            if p.state != PromiseState::Pending {
                return Ok(());
            }
            p.state = PromiseState::Rejected;
            p.exception = exception;
            (
                p.on_catch,
                p.on_finally,
                std::mem::take(&mut p.continuations),
            )
        };
        self.heap.write_barrier(promise, exception);

        if !on_catch.is_nil() {
            self.call_function_value(on_catch, &[exception])?;
        }
        if !on_finally.is_nil() {
            self.call_function_value(on_finally, &[Value::Nil])?;
        }
        for continuation in continuations {
            self.drive_async(
                continuation.generator,
                continuation.driver,
                crate::vm::ResumeInput::Throw(exception),
            )?;
        }
        Ok(())
    }

    /// Attaches a fulfillment handler; fires immediately when already
    /// fulfilled.
    pub fn promise_then(&mut self, promise: HeapId, handler: Value) -> RunResult<()> {
        let state = self.promise_state(promise);
        match state {
            PromiseState::Pending => {
                if let ObjData::Promise(p) = self.heap.data_mut(promise) {
                    p.handlers.push(handler);
                }
                self.heap.write_barrier(promise, handler);
                Ok(())
            }
            PromiseState::Fulfilled => {
                let value = match self.heap.data(promise) {
                    ObjData::Promise(p) => p.value,
                    _ => Value::Nil,
                };
                self.call_function_value(handler, &[value]).map(|_| ())
            }
            PromiseState::Rejected => Ok(()),
        }
    }

    pub fn promise_catch(&mut self, promise: HeapId, handler: Value) -> RunResult<()> {
        let state = self.promise_state(promise);
        match state {
            PromiseState::Pending => {
                if let ObjData::Promise(p) = self.heap.data_mut(promise) {
                    p.on_catch = handler;
                }
                self.heap.write_barrier(promise, handler);
                Ok(())
            }
            PromiseState::Rejected => {
                let exception = match self.heap.data(promise) {
                    ObjData::Promise(p) => p.exception,
                    _ => Value::Nil,
                };
                self.call_function_value(handler, &[exception]).map(|_| ())
            }
            PromiseState::Fulfilled => Ok(()),
        }
    }

    pub fn promise_finally(&mut self, promise: HeapId, handler: Value) -> RunResult<()> {
        let state = self.promise_state(promise);
        match state {
            PromiseState::Pending => {
                if let ObjData::Promise(p) = self.heap.data_mut(promise) {
                    p.on_finally = handler;
                }
                self.heap.write_barrier(promise, handler);
                Ok(())
            }
            _ => {
                let value = match self.heap.data(promise) {
                    ObjData::Promise(p) => p.value,
                    _ => Value::Nil,
                };
                self.call_function_value(handler, &[value]).map(|_| ())
            }
        }
    }

    // ── Capture dictionary ──────────────────────────────────────────────────

    pub fn promise_capture(&mut self, promise: HeapId, key: &str, value: Value) {
        let key_id = self.heap.copy_string(key);
        let captures = match self.heap.data(promise) {
            ObjData::Promise(p) => p.captures,
            other => panic!("expected Promise, found {}", other.kind_name()),
        };
        if let ObjData::Dict(d) = self.heap.data_mut(captures) {
            d.entries.insert(DictKey(Value::Obj(key_id)), value);
        }
        self.heap.write_barrier(captures, value);
    }

    pub fn promise_captured(&mut self, promise: HeapId, key: &str) -> Value {
        let key_id = self.heap.copy_string(key);
        let captures = match self.heap.data(promise) {
            ObjData::Promise(p) => p.captures,
            other => panic!("expected Promise, found {}", other.kind_name()),
        };
        match self.heap.data(captures) {
            ObjData::Dict(d) => d
                .entries
                .get(&DictKey(Value::Obj(key_id)))
                .copied()
                .unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    // ── Combinators ─────────────────────────────────────────────────────────

    /// `Promise.all`: resolves with the input values in input order once
    /// every promise fulfills; rejects on the first rejection.
    pub fn promise_all(&mut self, promises: &[Value]) -> RunResult<HeapId> {
        let all = self.new_pending_promise();
        let count = promises.len();
        let results = vec![Value::Nil; count];
        let results_array = self.heap.alloc(ObjData::Array(results), None);
        self.promise_capture(all, "remaining", Value::Int(count as i32));

        if count == 0 {
            self.fulfill_promise(all, Value::Obj(results_array))?;
            return Ok(all);
        }

        for (index, &input) in promises.iter().enumerate() {
            let Value::Obj(input_id) = input else {
                self.reject_all_with_type_error(all)?;
                return Ok(all);
            };
            if !matches!(self.heap.data(input_id), ObjData::Promise(_)) {
                self.reject_all_with_type_error(all)?;
                return Ok(all);
            }
            self.promise_capture(input_id, "all", Value::Obj(all));
            self.promise_capture(input_id, "results", Value::Obj(results_array));
            self.promise_capture(input_id, "index", Value::Int(index as i32));

            let then_all = self.bind_promise_hook(input_id, "thenAll");
            self.promise_then(input_id, then_all)?;
            let catch_all = self.bind_promise_hook(input_id, "catchAll");
            self.promise_catch(input_id, catch_all)?;
        }
        Ok(all)
    }

    /// `Promise.race`: settles with the first settlement among the inputs.
    pub fn promise_race(&mut self, promises: &[Value]) -> RunResult<HeapId> {
        let race = self.new_pending_promise();
        for &input in promises {
            let Value::Obj(input_id) = input else {
                self.reject_all_with_type_error(race)?;
                return Ok(race);
            };
            if !matches!(self.heap.data(input_id), ObjData::Promise(_)) {
                self.reject_all_with_type_error(race)?;
                return Ok(race);
            }
            self.promise_capture(input_id, "race", Value::Obj(race));
            let race_all = self.bind_promise_hook(input_id, "raceAll");
            self.promise_then(input_id, race_all)?;
            let catch_race = self.bind_promise_hook(input_id, "catchRace");
            self.promise_catch(input_id, catch_race)?;
        }
        Ok(race)
    }

    fn reject_all_with_type_error(&mut self, promise: HeapId) -> RunResult<()> {
        let class = self.lookup_class_by_full_name(crate::vm::EXC_TYPE);
        let exception =
            self.create_exception(class, "Expected an array of promises.".to_string());
        self.reject_promise(promise, exception)
    }

    /// Binds one of the internal combinator hook methods to a promise.
    fn bind_promise_hook(&mut self, promise: HeapId, name: &str) -> Value {
        let name_id = self.heap.copy_string(name);
        let method = self
            .lookup_method(self.core.promise, name_id)
            .unwrap_or(Value::Nil);
        let bound = self.heap.alloc(
            ObjData::BoundMethod {
                receiver: Value::Obj(promise),
                method,
            },
            None,
        );
        Value::Obj(bound)
    }
}

/// Maps a reentrant call result into the native-call contract: thrown
/// exceptions re-enter propagation, anything else becomes a throw.
pub fn to_native_result(result: RunResult<Value>) -> crate::object::NativeResult {
    match result {
        Ok(value) => Ok(value),
        Err(Unwind::Thrown(exception)) => Err(crate::object::NativeError::Propagate(exception)),
        Err(Unwind::NonLocal { .. }) => Err(crate::object::NativeError::Throw {
            class: crate::vm::EXC_TYPE,
            message: "Non-local return escaped its function.".to_string(),
        }),
        Err(Unwind::Fatal(fatal)) => Err(crate::object::NativeError::Throw {
            class: crate::vm::EXC_TYPE,
            message: fatal.message,
        }),
    }
}
