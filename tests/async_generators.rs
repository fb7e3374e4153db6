/// Generator protocol, yield-from delegation, throw-into semantics, and the
/// promise/event-loop runtime.
use kestrel::conf::Configuration;
use kestrel::errors::KesError;
use kestrel::object::ObjData;
use kestrel::value::{HeapId, Value};
use kestrel::vm::Vm;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run_script(source: &str) -> (Vm, HeapId) {
    let mut vm = Vm::new(Configuration::default());
    let module = vm.new_module("async.kes");
    let value = vm
        .interpret_in_module(source, module)
        .unwrap_or_else(|e| panic!("script should run: {}", e));
    vm.finish_run(value)
        .unwrap_or_else(|e| panic!("event loop should settle: {}", e));
    (vm, module)
}

fn global(vm: &mut Vm, module: HeapId, name: &str) -> Value {
    vm.global_value(module, name)
        .unwrap_or_else(|| panic!("global '{}' should exist", name))
}

fn global_int(vm: &mut Vm, module: HeapId, name: &str) -> i32 {
    match global(vm, module, name) {
        Value::Int(n) => n,
        other => panic!("global '{}' should be an int, got {:?}", name, other),
    }
}

fn global_str(vm: &mut Vm, module: HeapId, name: &str) -> String {
    match global(vm, module, name) {
        Value::Obj(id) => vm.heap.str(id).to_string(),
        other => panic!("global '{}' should be a string, got {:?}", name, other),
    }
}

fn global_ints(vm: &mut Vm, module: HeapId, name: &str) -> Vec<i32> {
    match global(vm, module, name) {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Array(elements) => elements
                .iter()
                .map(|v| match v {
                    Value::Int(n) => *n,
                    other => panic!("expected int element, got {:?}", other),
                })
                .collect(),
            other => panic!("expected array, got {}", other.kind_name()),
        },
        other => panic!("expected array, got {:?}", other),
    }
}

// ─── Generators ───────────────────────────────────────────────────────────────

#[test]
fn test_generator_for_loop_yields_in_order() {
    let (mut vm, module) = run_script(
        r#"
        fun gen() { yield 1; yield 2; yield 3; }
        var items = [];
        for (v : gen()) { items.append(v); }
        "#,
    );
    assert_eq!(global_ints(&mut vm, module, "items"), vec![1, 2, 3]);
}

#[test]
fn test_calling_a_generator_does_not_run_it() {
    let (mut vm, module) = run_script(
        r#"
        var ran = false;
        fun gen() { ran = true; yield 1; }
        val g = gen();
        val before = ran;
        g.next(nil);
        val after = ran;
        "#,
    );
    assert!(matches!(global(&mut vm, module, "before"), Value::Bool(false)));
    assert!(matches!(global(&mut vm, module, "after"), Value::Bool(true)));
}

#[test]
fn test_generator_send_delivers_value_to_yield() {
    let (mut vm, module) = run_script(
        r#"
        fun echo() {
            val got = yield "ready";
            yield "got:" + got;
        }
        val g = echo();
        val first = g.send(nil);
        val second = g.send("x");
        val finished = g.isFinished();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "first"), "ready");
    assert_eq!(global_str(&mut vm, module, "second"), "got:x");
    assert!(matches!(global(&mut vm, module, "finished"), Value::Bool(false)));
}

#[test]
fn test_exhausted_generator_stays_exhausted() {
    let (mut vm, module) = run_script(
        r#"
        fun gen() { yield 1; }
        val g = gen();
        g.next(nil);
        val more = g.next(0);
        val evenMore = g.next(0);
        val finished = g.isFinished();
        "#,
    );
    assert!(global(&mut vm, module, "more").is_nil());
    assert!(global(&mut vm, module, "evenMore").is_nil());
    assert!(matches!(global(&mut vm, module, "finished"), Value::Bool(true)));
}

#[test]
fn test_yield_from_delegates_to_inner_generator() {
    let (mut vm, module) = run_script(
        r#"
        fun inner() { yield 1; yield 2; }
        fun outer() {
            yield 0;
            yield from inner();
            yield 3;
        }
        var items = [];
        for (v : outer()) { items.append(v); }
        "#,
    );
    assert_eq!(global_ints(&mut vm, module, "items"), vec![0, 1, 2, 3]);
}

#[test]
fn test_throw_into_generator_resumes_at_yield() {
    let (mut vm, module) = run_script(
        r#"
        fun guarded() {
            try {
                yield 1;
            } catch (Error e) {
                yield "caught:" + e.message;
            }
            yield "end";
        }
        val g = guarded();
        g.send(nil);
        val caught = g.throws(Error("boom"));
        val tail = g.send(nil);
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "caught"), "caught:boom");
    assert_eq!(global_str(&mut vm, module, "tail"), "end");
}

#[test]
fn test_uncaught_throw_into_generator_escapes_to_resumer() {
    let (mut vm, module) = run_script(
        r#"
        fun fragile() { yield 1; yield 2; }
        val g = fragile();
        g.send(nil);
        var escaped = "";
        try {
            g.throws(Error("ka"));
        } catch (Error e) {
            escaped = e.message;
        }
        val finished = g.isFinished();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "escaped"), "ka");
    assert!(matches!(global(&mut vm, module, "finished"), Value::Bool(true)));
}

#[test]
fn test_generator_returns_forces_completion() {
    let (mut vm, module) = run_script(
        r#"
        fun gen() { yield 1; yield 2; }
        val g = gen();
        g.send(nil);
        g.returns(99);
        val finished = g.isFinished();
        val residue = g.next(nil);
        "#,
    );
    assert!(matches!(global(&mut vm, module, "finished"), Value::Bool(true)));
    assert!(global(&mut vm, module, "residue").is_nil());
}

// ─── Promises ─────────────────────────────────────────────────────────────────

#[test]
fn test_executor_runs_synchronously() {
    let (mut vm, module) = run_script(
        r#"
        var order = "";
        val p = Promise(fun(resolve, reject) { order = order + "e"; resolve(1); });
        order = order + "a";
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "order"), "ea");
}

#[test]
fn test_then_handlers_fire_in_attachment_order() {
    let (mut vm, module) = run_script(
        r#"
        var order = [];
        val p = Promise(fun(resolve, reject) {
            Timer(fun() { resolve(7); }, 5, 0).run();
        });
        p.then(fun(v) { order.append(v + 1); return nil; });
        p.then(fun(v) { order.append(v + 2); return nil; });
        "#,
    );
    assert_eq!(global_ints(&mut vm, module, "order"), vec![8, 9]);
}

#[test]
fn test_settled_promise_never_resettles() {
    let (mut vm, module) = run_script(
        r#"
        var seen = [];
        val p = Promise(fun(resolve, reject) { resolve(1); resolve(2); });
        p.then(fun(v) { seen.append(v); return nil; });
        val settled = p.isSettled();
        "#,
    );
    assert_eq!(global_ints(&mut vm, module, "seen"), vec![1]);
    assert!(matches!(global(&mut vm, module, "settled"), Value::Bool(true)));
}

#[test]
fn test_catch_handler_receives_rejection() {
    let (mut vm, module) = run_script(
        r#"
        var message = "";
        val p = Promise(fun(resolve, reject) { reject(Error("nope")); });
        p.catch(fun(e) { message = e.message; return nil; });
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "message"), "nope");
}

// ─── Async / await ────────────────────────────────────────────────────────────

#[test]
fn test_await_timer_fulfilled_promise() {
    // A promise fulfilled with 42 by a 10 ms timer, awaited inside an
    // async function.
    let (mut vm, module) = run_script(
        r#"
        var result = 0;
        async fun main() {
            val v = await Promise(fun(resolve, reject) {
                Timer(fun() { resolve(42); }, 10, 0).run();
            });
            result = v;
        }
        main();
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 42);
}

#[test]
fn test_await_non_promise_continues_immediately() {
    let (mut vm, module) = run_script(
        r#"
        var result = 0;
        async fun main() { result = await 5; }
        main();
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 5);
}

#[test]
fn test_async_call_returns_a_promise() {
    let (mut vm, module) = run_script(
        r#"
        async fun compute() { return 21 * 2; }
        val p = compute();
        var result = 0;
        p.then(fun(v) { result = v; return nil; });
        val settled = p.isSettled();
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 42);
    assert!(matches!(global(&mut vm, module, "settled"), Value::Bool(true)));
}

#[test]
fn test_await_rejected_promise_throws_into_async_frame() {
    let (mut vm, module) = run_script(
        r#"
        var caught = "";
        async fun main() {
            try {
                await Promise(fun(resolve, reject) {
                    Timer(fun() { reject(Error("late")); }, 5, 0).run();
                });
            } catch (Error e) {
                caught = e.message;
            }
        }
        main();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "caught"), "late");
}

#[test]
fn test_async_rejection_propagates_through_returned_promise() {
    let mut vm = Vm::new(Configuration::default());
    let module = vm.new_module("async.kes");
    let value = vm
        .interpret_in_module(
            r#"
            async fun main() { throw Error("sunk"); }
            val p = main();
            await p;
            "#,
            module,
        )
        .expect("compiles and starts");
    match vm.finish_run(value) {
        Err(KesError::Runtime(fatal)) => assert!(fatal.message.contains("sunk")),
        Ok(_) => panic!("awaiting a rejected promise at top level should fail"),
        Err(other) => panic!("expected runtime error, got {}", other),
    }
}

#[test]
fn test_sleep_sequences_after_timer() {
    let (mut vm, module) = run_script(
        r#"
        var order = [];
        async fun main() {
            order.append(1);
            await sleep(5);
            order.append(3);
        }
        main();
        order.append(2);
        "#,
    );
    assert_eq!(global_ints(&mut vm, module, "order"), vec![1, 2, 3]);
}

#[test]
fn test_promise_all_preserves_input_order() {
    let (mut vm, module) = run_script(
        r#"
        fun delayed(value, ms) {
            return Promise(fun(resolve, reject) {
                Timer(fun() { resolve(value); }, ms, 0).run();
            });
        }
        var results = nil;
        async fun main() {
            results = await Promise.all([delayed("slow", 20), delayed("fast", 5)]);
        }
        main();
        "#,
    );
    let results = match global(&mut vm, module, "results") {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Array(elements) => elements.clone(),
            other => panic!("expected array, got {}", other.kind_name()),
        },
        other => panic!("expected array, got {:?}", other),
    };
    assert_eq!(results.len(), 2);
    let first = match results[0] {
        Value::Obj(id) => vm.heap.str(id).to_string(),
        other => panic!("expected string, got {:?}", other),
    };
    let second = match results[1] {
        Value::Obj(id) => vm.heap.str(id).to_string(),
        other => panic!("expected string, got {:?}", other),
    };
    // Input order, not settlement order.
    assert_eq!(first, "slow");
    assert_eq!(second, "fast");
}

#[test]
fn test_promise_race_settles_with_first() {
    let (mut vm, module) = run_script(
        r#"
        fun delayed(value, ms) {
            return Promise(fun(resolve, reject) {
                Timer(fun() { resolve(value); }, ms, 0).run();
            });
        }
        var winner = "";
        async fun main() {
            winner = await Promise.race([delayed("slow", 30), delayed("fast", 5)]);
        }
        main();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "winner"), "fast");
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let (mut vm, module) = run_script(
        r#"
        var order = [];
        Timer(fun() { order.append(2); return nil; }, 20, 0).run();
        Timer(fun() { order.append(1); return nil; }, 5, 0).run();
        "#,
    );
    assert_eq!(global_ints(&mut vm, module, "order"), vec![1, 2]);
}

#[test]
fn test_stopped_timer_never_fires() {
    let (mut vm, module) = run_script(
        r#"
        var fired = false;
        val t = Timer(fun() { fired = true; return nil; }, 5, 0);
        t.run();
        t.stop();
        val running = t.isRunning();
        "#,
    );
    assert!(matches!(global(&mut vm, module, "fired"), Value::Bool(false)));
    assert!(matches!(global(&mut vm, module, "running"), Value::Bool(false)));
}

#[test]
fn test_top_level_await_lifts_script_to_async() {
    let (mut vm, module) = run_script(
        r#"
        var result = 0;
        val v = await Promise(fun(resolve, reject) {
            Timer(fun() { resolve(9); }, 5, 0).run();
        });
        result = v;
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 9);
}

#[test]
fn test_file_read_async_settles_through_the_loop() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("kestrel_async_{}.txt", std::process::id()));
    std::fs::write(&path, "payload").expect("fixture write");
    let source = format!(
        r#"
        var content = "";
        async fun main() {{
            val f = File("{path}", "r");
            content = await f.readAsync();
            f.close();
        }}
        main();
        "#,
        path = path.to_string_lossy()
    );
    let (mut vm, module) = run_script(&source);
    assert_eq!(global_str(&mut vm, module, "content"), "payload");
    let _ = std::fs::remove_file(path);
}
