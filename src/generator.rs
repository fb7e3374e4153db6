/// Generator runtime: frame save/restore for yield, the resume protocol,
/// yield-from delegation, and the async driver that pumps async-function
/// generators against the promise machinery.
///
/// A call to a generator function never runs the body; it builds a
/// `Generator` whose saved frame holds the closure, a fresh ip, the receiver
/// in slot 0 and the arguments after it. Resuming pushes the saved slots
/// back onto the VM stack, restores the handler substack, and re-enters the
/// dispatch loop; `yield` copies the live slots back out and unwinds to the
/// resumer.

use crate::object::{GeneratorState, ObjData, PromiseState, SavedFrame};
use crate::value::{HeapId, Value};
use crate::vm::{
    CallFrame, ResumeInput, RunResult, Unwind, Vm, EXC_TYPE, FRAMES_MAX, EXC_STACK_OVERFLOW,
};

impl Vm {
    /// Saves the running generator's live frame and unwinds it. Returns the
    /// yielded value, which `run` hands to whoever resumed.
    pub fn suspend_generator(&mut self, value: Value, ip_rewind: usize) -> RunResult<Value> {
        let Some(generator) = self.running_generator else {
            return self
                .throw_named(EXC_TYPE, "Cannot yield outside of a generator.".to_string())
                .map(|_| Value::Nil);
        };

        let fi = self.frames.len() - 1;
        let base = self.frames[fi].base;
        let ip = self.frames[fi].ip - ip_rewind;
        let closure = self.frames[fi].closure;
        let handlers = self.frames[fi].handlers.clone();
        let slots: Vec<Value> = self.stack[base..].to_vec();

        let frame_id = self.generator_data(generator).frame;
        *self.heap.data_mut(frame_id) = ObjData::Frame(Box::new(SavedFrame {
            closure,
            ip,
            slots,
            handlers,
        }));

        {
            let generator_obj = self.generator_data_mut(generator);
            generator_obj.state = GeneratorState::Yield;
            generator_obj.value = value;
        }

        // Unwind the suspended frame; captured locals are lifted first.
        self.close_upvalues(base);
        self.stack.truncate(base);
        self.frames.pop();
        Ok(value)
    }

    /// Loads a suspended generator's frame and runs it until the next yield
    /// or return. `input` becomes the result of the suspended yield, or is
    /// thrown into the generator at that point.
    pub fn resume_generator(&mut self, generator: HeapId, input: ResumeInput) -> RunResult<Value> {
        let state = self.generator_data(generator).state;
        if state == GeneratorState::Return || state == GeneratorState::Error {
            return self
                .throw_named(EXC_TYPE, "Cannot resume a finished generator.".to_string())
                .map(|_| Value::Nil);
        }
        if state == GeneratorState::Resume {
            return self
                .throw_named(EXC_TYPE, "Generator is already running.".to_string())
                .map(|_| Value::Nil);
        }
        if self.frames.len() >= FRAMES_MAX {
            return self
                .throw_named(EXC_STACK_OVERFLOW, "Stack overflow.".to_string())
                .map(|_| Value::Nil);
        }

        let frame_id = self.generator_data(generator).frame;
        let (closure, ip, slots, handlers) = match self.heap.data(frame_id) {
            ObjData::Frame(frame) => (
                frame.closure,
                frame.ip,
                frame.slots.clone(),
                frame.handlers.clone(),
            ),
            other => panic!("generator frame is {}", other.kind_name()),
        };
        let chunk = match self.heap.data(closure) {
            ObjData::Closure(c) => match self.heap.data(c.function) {
                ObjData::Function(f) => f.chunk,
                other => panic!("closure wraps {}", other.kind_name()),
            },
            other => panic!("generator closure is {}", other.kind_name()),
        };

        let base = self.stack.len();
        self.stack.extend_from_slice(&slots);
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip,
            base,
            handlers,
        });
        let floor = self.frames.len();

        let delegating = self.generator_data(generator).inner.is_some();
        let pending_throw = match (state, input) {
            (GeneratorState::Throw, _) => Some(self.generator_data(generator).pending_exception),
            (_, ResumeInput::Throw(exception)) => Some(exception),
            _ => None,
        };
        if pending_throw.is_none() {
            if let ResumeInput::Value(value) = input {
                if state != GeneratorState::Start {
                    if delegating {
                        // The send value is forwarded to the inner generator
                        // when YIELD_FROM re-executes.
                        self.generator_data_mut(generator).value = value;
                    } else {
                        self.push(value);
                    }
                }
            }
        }
        self.generator_data_mut(generator).state = GeneratorState::Resume;

        let previous_running = self.running_generator.replace(generator);

        // A pending exception re-throws at the suspended yield, giving the
        // generator's own handlers the first chance. Propagation is bounded
        // by this resume's floor, so an uncaught exception unwinds only the
        // generator frame and surfaces to the resumer.
        let propagated = match pending_throw {
            Some(exception) => {
                self.generator_data_mut(generator).pending_exception = Value::Nil;
                self.propagate_at_floor(exception, floor)
            }
            None => Ok(()),
        };
        let result = match propagated {
            Ok(()) => self.run(floor),
            Err(unwind) => Err(unwind),
        };
        self.running_generator = previous_running;

        match result {
            Ok(value) => {
                let generator_obj = self.generator_data_mut(generator);
                if generator_obj.state == GeneratorState::Resume {
                    // The frame returned normally: the generator is spent.
                    generator_obj.state = GeneratorState::Return;
                    generator_obj.value = value;
                }
                Ok(value)
            }
            Err(unwind) => {
                self.generator_data_mut(generator).state = GeneratorState::Error;
                Err(unwind)
            }
        }
    }

    /// Stores an exception to re-throw at the suspended yield on the next
    /// resume (the `throws` native).
    pub fn throw_into_generator(&mut self, generator: HeapId, exception: Value) -> RunResult<()> {
        let state = self.generator_data(generator).state;
        if state == GeneratorState::Return || state == GeneratorState::Error {
            return self.throw_named(
                EXC_TYPE,
                "Cannot throw into a finished generator.".to_string(),
            );
        }
        let generator_obj = self.generator_data_mut(generator);
        generator_obj.state = GeneratorState::Throw;
        generator_obj.pending_exception = exception;
        Ok(())
    }

    /// YIELD_FROM: delegates to the inner generator on the stack top. While
    /// the inner one yields, the outer generator re-executes this opcode on
    /// every resume; when the inner completes, its final value becomes the
    /// result of the delegation. Returns `Some` when this run level
    /// suspended.
    pub fn yield_from(&mut self, floor: usize) -> RunResult<Option<Value>> {
        let inner_value = self.peek(0);
        let Some(outer) = self.running_generator else {
            self.throw_named(EXC_TYPE, "Cannot yield outside of a generator.".to_string())?;
            return Ok(None);
        };
        let Value::Obj(inner) = inner_value else {
            self.throw_named(EXC_TYPE, "Can only yield from a generator.".to_string())?;
            return Ok(None);
        };
        if !matches!(self.heap.data(inner), ObjData::Generator(_)) {
            self.throw_named(EXC_TYPE, "Can only yield from a generator.".to_string())?;
            return Ok(None);
        }

        // Delegation completed earlier: replace the inner generator with its
        // final value and move on.
        if self.generator_data(inner).state == GeneratorState::Return {
            let final_value = self.generator_data(inner).value;
            self.generator_data_mut(outer).inner = None;
            self.pop();
            self.push(final_value);
            return Ok(None);
        }

        let send = {
            let outer_obj = self.generator_data_mut(outer);
            let was_delegating = outer_obj.inner.is_some();
            outer_obj.inner = Some(inner);
            if was_delegating {
                std::mem::replace(&mut outer_obj.value, Value::Nil)
            } else {
                Value::Nil
            }
        };
        self.generator_data_mut(inner).outer = Some(outer);

        let yielded = match self.resume_generator(inner, ResumeInput::Value(send)) {
            Ok(value) => value,
            Err(Unwind::Thrown(exception)) => {
                // The inner generator threw out: the outer generator's own
                // handlers get the next chance.
                self.generator_data_mut(outer).inner = None;
                self.propagate(exception)?;
                return Ok(None);
            }
            Err(other) => return Err(other),
        };

        if self.generator_data(inner).state == GeneratorState::Return {
            // Inner finished on this resume: its result flows to the outer
            // frame without suspending.
            self.generator_data_mut(outer).inner = None;
            self.pop();
            self.push(yielded);
            return Ok(None);
        }

        // Inner suspended: the outer suspends too, re-executing YIELD_FROM
        // on resume (the opcode is a single byte, so rewind by one).
        let value = self.suspend_generator(yielded, 1)?;
        if self.frames.len() < floor {
            return Ok(Some(value));
        }
        self.push(value);
        Ok(None)
    }

    /// AWAIT: settled values continue immediately; a pending promise
    /// suspends the current async frame and registers a continuation that
    /// the settlement path resumes. Returns `Some` when this run level
    /// suspended.
    pub fn await_value(&mut self, floor: usize) -> RunResult<Option<Value>> {
        let awaited = self.peek(0);
        let Value::Obj(id) = awaited else {
            return Ok(None); // Non-promise: the value itself is the result.
        };
        let state = match self.heap.data(id) {
            ObjData::Promise(p) => p.state,
            _ => return Ok(None),
        };
        match state {
            PromiseState::Fulfilled => {
                let value = match self.heap.data(id) {
                    ObjData::Promise(p) => p.value,
                    _ => Value::Nil,
                };
                self.pop();
                self.push(value);
                Ok(None)
            }
            PromiseState::Rejected => {
                let exception = match self.heap.data(id) {
                    ObjData::Promise(p) => p.exception,
                    _ => Value::Nil,
                };
                self.pop();
                self.propagate(exception)?;
                Ok(None)
            }
            PromiseState::Pending => {
                if self.running_generator.is_none() {
                    self.throw_named(
                        EXC_TYPE,
                        "Can only await inside async functions or top level code.".to_string(),
                    )?;
                    return Ok(None);
                }
                self.pop();
                let value = self.suspend_generator(Value::Obj(id), 0)?;
                if self.frames.len() < floor {
                    return Ok(Some(value));
                }
                self.push(value);
                Ok(None)
            }
        }
    }

    /// Pumps an async-function generator: resumes it until it either
    /// completes (settling the driver promise) or suspends on a pending
    /// promise (attaching a continuation for the settlement path).
    pub fn drive_async(
        &mut self,
        generator: HeapId,
        driver: Option<HeapId>,
        input: ResumeInput,
    ) -> RunResult<()> {
        let mut input = input;
        loop {
            let result = self.resume_generator(generator, input);
            match result {
                Ok(value) => {
                    if self.generator_data(generator).state == GeneratorState::Return {
                        if let Some(promise) = driver {
                            self.fulfill_promise(promise, value)?;
                        }
                        return Ok(());
                    }
                    // Suspended. A pending promise parks the frame until
                    // settlement; anything else resumes immediately.
                    if let Value::Obj(id) = value {
                        let pending = matches!(
                            self.heap.data(id),
                            ObjData::Promise(p) if p.state == PromiseState::Pending
                        );
                        if pending {
                            if let ObjData::Promise(p) = self.heap.data_mut(id) {
                                p.continuations.push(crate::object::AwaitContinuation {
                                    generator,
                                    driver,
                                });
                            }
                            return Ok(());
                        }
                        let settled = match self.heap.data(id) {
                            ObjData::Promise(p) => Some((p.state, p.value, p.exception)),
                            _ => None,
                        };
                        if let Some((state, fulfilled, exception)) = settled {
                            input = if state == PromiseState::Rejected {
                                ResumeInput::Throw(exception)
                            } else {
                                ResumeInput::Value(fulfilled)
                            };
                            continue;
                        }
                    }
                    input = ResumeInput::Value(value);
                }
                Err(Unwind::Thrown(exception)) => {
                    // The async body threw past its own handlers: reject the
                    // driver promise instead of unwinding the caller.
                    if let Some(promise) = driver {
                        self.reject_promise(promise, exception)?;
                        return Ok(());
                    }
                    return Err(Unwind::Thrown(exception));
                }
                Err(other) => return Err(other),
            }
        }
    }
}
