/// End-to-end language tests: run a script in a fresh VM and inspect its
/// module bindings.
///
/// These cover:
///   • Arithmetic, strings and interpolation
///   • Closures and upvalue capture
///   • Classes, inheritance, super dispatch, class variables, traits
///   • Exceptions with catch and finally
///   • Collections, ranges and the iteration protocol
///   • Optional access operators and control flow
use kestrel::conf::Configuration;
use kestrel::errors::KesError;
use kestrel::object::ObjData;
use kestrel::value::{HeapId, Value};
use kestrel::vm::Vm;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run_script(source: &str) -> (Vm, HeapId) {
    let mut vm = Vm::new(Configuration::default());
    let module = vm.new_module("test.kes");
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

fn global_array(vm: &mut Vm, module: HeapId, name: &str) -> Vec<Value> {
    match global(vm, module, name) {
        Value::Obj(id) => match vm.heap.data(id) {
            ObjData::Array(elements) => elements.clone(),
            other => panic!("global '{}' should be an array, got {}", name, other.kind_name()),
        },
        other => panic!("global '{}' should be an array, got {:?}", name, other),
    }
}

fn runtime_error(source: &str) -> String {
    let mut vm = Vm::new(Configuration::default());
    let module = vm.new_module("test.kes");
    let result = vm
        .interpret_in_module(source, module)
        .and_then(|value| vm.finish_run(value));
    match result {
        Err(KesError::Runtime(fatal)) => fatal.message,
        Ok(_) => panic!("script should fail at runtime"),
        Err(other) => panic!("expected a runtime error, got {}", other),
    }
}

// ─── Arithmetic and strings ───────────────────────────────────────────────────

#[test]
fn test_arithmetic_and_string_concatenation() {
    let (mut vm, module) = run_script(
        r#"
        val sum = 1 + 2;
        val cat = "a" + "b";
        val quotient = 6 / 4;
        val product = 6 * 7;
        val remainder = 7 % 3;
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "sum"), 3);
    assert_eq!(global_str(&mut vm, module, "cat"), "ab");
    assert!(matches!(global(&mut vm, module, "quotient"), Value::Float(f) if f == 1.5));
    assert_eq!(global_int(&mut vm, module, "product"), 42);
    assert_eq!(global_int(&mut vm, module, "remainder"), 1);
}

#[test]
fn test_string_interpolation_invokes_to_string() {
    let (mut vm, module) = run_script(
        r#"
        val x = 3;
        val s = "a ${x + 1} b";
        val nested = "v=${"[" + "${x}" + "]"}";
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "s"), "a 4 b");
    assert_eq!(global_str(&mut vm, module, "nested"), "v=[3]");
}

#[test]
fn test_string_methods() {
    let (mut vm, module) = run_script(
        r#"
        val s = "  Hello World  ";
        val trimmed = s.trim();
        val upper = trimmed.upper();
        val parts = trimmed.split(" ");
        val index = trimmed.indexOf("World");
        val piece = trimmed.substring(0, 5);
        val formatted = String.format("%s-%d", "x", 7);
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "trimmed"), "Hello World");
    assert_eq!(global_str(&mut vm, module, "upper"), "HELLO WORLD");
    assert_eq!(global_array(&mut vm, module, "parts").len(), 2);
    assert_eq!(global_int(&mut vm, module, "index"), 6);
    assert_eq!(global_str(&mut vm, module, "piece"), "Hello");
    assert_eq!(global_str(&mut vm, module, "formatted"), "x-7");
}

// ─── Closures ─────────────────────────────────────────────────────────────────

#[test]
fn test_closure_counter_counts() {
    let (mut vm, module) = run_script(
        r#"
        fun makeCounter() {
            var i = 0;
            return fun() { i = i + 1; return i; };
        }
        val counter = makeCounter();
        val a = counter();
        val b = counter();
        val c = counter();
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "a"), 1);
    assert_eq!(global_int(&mut vm, module, "b"), 2);
    assert_eq!(global_int(&mut vm, module, "c"), 3);
}

#[test]
fn test_closures_capture_independent_cells() {
    let (mut vm, module) = run_script(
        r#"
        fun makeAdder(n) {
            return fun(x) { return x + n; };
        }
        val add5 = makeAdder(5);
        val add10 = makeAdder(10);
        val r1 = add5(3);
        val r2 = add10(7);
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "r1"), 8);
    assert_eq!(global_int(&mut vm, module, "r2"), 17);
}

#[test]
fn test_three_level_capture() {
    let (mut vm, module) = run_script(
        r#"
        fun outer(a) {
            return fun(b) {
                return fun(c) { return a + b + c; };
            };
        }
        val result = outer(1)(2)(3);
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 6);
}

// ─── Classes ──────────────────────────────────────────────────────────────────

#[test]
fn test_inheritance_and_super_dispatch() {
    let (mut vm, module) = run_script(
        r#"
        class A {
            greet() { return "hi"; }
        }
        class B : A {
            greet() { return super.greet() + "!"; }
        }
        val result = B().greet();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "result"), "hi!");
}

#[test]
fn test_initializer_and_fields() {
    let (mut vm, module) = run_script(
        r#"
        class Point {
            init(x, y) {
                this.x = x;
                this.y = y;
            }
            length2() { return this.x * this.x + this.y * this.y; }
        }
        val p = Point(3, 4);
        val len2 = p.length2();
        val x = p.x;
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "len2"), 25);
    assert_eq!(global_int(&mut vm, module, "x"), 3);
}

#[test]
fn test_shapes_share_layout_across_instances() {
    let (mut vm, module) = run_script(
        r#"
        class Pair { init(a, b) { this.a = a; this.b = b; } }
        val p1 = Pair(1, 2);
        val p2 = Pair(3, 4);
        val total = p1.a + p1.b + p2.a + p2.b;
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "total"), 10);
    // Both instances took the same field-addition path, so they share a shape.
    let p1 = match global(&mut vm, module, "p1") {
        Value::Obj(id) => id,
        other => panic!("expected object, got {:?}", other),
    };
    let p2 = match global(&mut vm, module, "p2") {
        Value::Obj(id) => id,
        other => panic!("expected object, got {:?}", other),
    };
    assert_eq!(vm.heap.header(p1).shape_id, vm.heap.header(p2).shape_id);
}

#[test]
fn test_class_variables() {
    let (mut vm, module) = run_script(
        r#"
        class Counter {
            var count = 0;
        }
        Counter.count = Counter.count + 1;
        Counter.count = Counter.count + 1;
        val total = Counter.count;
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "total"), 2);
}

#[test]
fn test_class_methods_live_on_the_metaclass() {
    let (mut vm, module) = run_script(
        r#"
        class Registry {
            class make() { return "made"; }
        }
        val result = Registry.make();
        val name = Registry.name();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "result"), "made");
    assert_eq!(global_str(&mut vm, module, "name"), "Registry");
}

#[test]
fn test_traits_mix_methods_into_classes() {
    let (mut vm, module) = run_script(
        r#"
        trait Doubler {
            double(x) { return x * 2; }
        }
        trait Shouter {
            shout(s) { return s.upper(); }
        }
        class Util with Doubler, Shouter { }
        val u = Util();
        val d = u.double(21);
        val s = u.shout("hey");
        val isDoubler = u.instanceOf(Doubler);
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "d"), 42);
    assert_eq!(global_str(&mut vm, module, "s"), "HEY");
    assert!(matches!(global(&mut vm, module, "isDoubler"), Value::Bool(true)));
}

#[test]
fn test_method_bound_to_receiver() {
    let (mut vm, module) = run_script(
        r#"
        class Greeter {
            init(name) { this.name = name; }
            greet() { return "hi " + this.name; }
        }
        val m = Greeter("kes").greet;
        val result = m();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "result"), "hi kes");
}

// ─── Exceptions ───────────────────────────────────────────────────────────────

#[test]
fn test_catch_receives_thrown_exception() {
    let (mut vm, module) = run_script(
        r#"
        var message = "";
        try {
            throw Error("x");
        } catch (Error e) {
            message = e.message;
        }
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "message"), "x");
}

#[test]
fn test_finally_runs_on_both_paths() {
    let (mut vm, module) = run_script(
        r#"
        var log = "";
        try {
            log = log + "t";
        } catch (Error e) {
            log = log + "c";
        } finally {
            log = log + "f";
        }
        try {
            try {
                throw Error("boom");
            } catch (TypeException e) {
                log = log + "wrong";
            } finally {
                log = log + "F";
            }
        } catch (Error e) {
            log = log + "C";
        }
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "log"), "tfFC");
}

#[test]
fn test_runtime_type_errors_are_catchable() {
    let (mut vm, module) = run_script(
        r#"
        var kind = "";
        try {
            val x = 1 + "a";
        } catch (TypeException e) {
            kind = "type";
        }
        var zero = "";
        try {
            val y = 1 / 0;
        } catch (ArithmeticException e) {
            zero = "div";
        }
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "kind"), "type");
    assert_eq!(global_str(&mut vm, module, "zero"), "div");
}

#[test]
fn test_unhandled_exception_reports_class_and_trace() {
    let message = runtime_error(
        r#"
        fun boom() { throw Error("kaput"); }
        boom();
        "#,
    );
    assert!(message.contains("Exception"), "got: {}", message);
    assert!(message.contains("kaput"), "got: {}", message);
}

#[test]
fn test_exception_propagates_across_frames() {
    let (mut vm, module) = run_script(
        r#"
        fun level3() { throw Error("deep"); }
        fun level2() { level3(); }
        fun level1() { level2(); }
        var caught = "";
        try {
            level1();
        } catch (Error e) {
            caught = e.message;
        }
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "caught"), "deep");
}

// ─── Collections and iteration ────────────────────────────────────────────────

#[test]
fn test_array_literals_and_methods() {
    let (mut vm, module) = run_script(
        r#"
        val a = [1, 2, 3];
        a.append(4);
        val len = a.length();
        val second = a[1];
        a[0] = 10;
        val first = a[0];
        val found = a.indexOf(3);
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "len"), 4);
    assert_eq!(global_int(&mut vm, module, "second"), 2);
    assert_eq!(global_int(&mut vm, module, "first"), 10);
    assert_eq!(global_int(&mut vm, module, "found"), 2);
}

#[test]
fn test_dictionary_iteration_yields_entries_in_order() {
    let (mut vm, module) = run_script(
        r#"
        val d = {"a": 1, "b": 2};
        d["c"] = 3;
        var keys = "";
        var total = 0;
        for (entry : d) {
            keys = keys + entry.key;
            total = total + entry.value;
        }
        val b = d["b"];
        val missing = d["zzz"];
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "keys"), "abc");
    assert_eq!(global_int(&mut vm, module, "total"), 6);
    assert_eq!(global_int(&mut vm, module, "b"), 2);
    assert!(global(&mut vm, module, "missing").is_nil());
}

#[test]
fn test_range_iteration() {
    let (mut vm, module) = run_script(
        r#"
        var items = [];
        for (v : 1..4) { items.append(v); }
        val len = (1..4).length();
        val within = (1..4).contains(3);
        "#,
    );
    let items = global_array(&mut vm, module, "items");
    assert_eq!(items.len(), 4);
    assert!(matches!(items[0], Value::Int(1)));
    assert!(matches!(items[3], Value::Int(4)));
    assert_eq!(global_int(&mut vm, module, "len"), 4);
    assert!(matches!(global(&mut vm, module, "within"), Value::Bool(true)));
}

#[test]
fn test_linked_list_iterates_through_nodes() {
    let (mut vm, module) = run_script(
        r#"
        val list = LinkedList();
        list.append(1);
        list.append(2);
        list.prepend(0);
        var items = [];
        for (v : list) { items.append(v); }
        val len = list.length();
        "#,
    );
    let items = global_array(&mut vm, module, "items");
    assert_eq!(items.len(), 3);
    assert!(matches!(items[0], Value::Int(0)));
    assert!(matches!(items[2], Value::Int(2)));
    assert_eq!(global_int(&mut vm, module, "len"), 3);
}

#[test]
fn test_for_loop_with_index_and_value() {
    let (mut vm, module) = run_script(
        r#"
        var sum = 0;
        for (i, v : [10, 20, 30]) {
            sum = sum + i + v;
        }
        "#,
    );
    // Indices 0+1+2 plus values 10+20+30.
    assert_eq!(global_int(&mut vm, module, "sum"), 63);
}

// ─── Control flow and operators ───────────────────────────────────────────────

#[test]
fn test_while_with_break_and_continue() {
    let (mut vm, module) = run_script(
        r#"
        var total = 0;
        var i = 0;
        while (true) {
            i = i + 1;
            if (i > 10) { break; }
            if (i % 2 == 0) { continue; }
            total = total + i;
        }
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "total"), 25);
}

#[test]
fn test_switch_selects_matching_case() {
    let (mut vm, module) = run_script(
        r#"
        fun pick(x) {
            var r = "";
            switch (x) {
                case 1:
                    r = "one";
                case 2:
                    r = "two";
                default:
                    r = "other";
            }
            return r;
        }
        val a = pick(1);
        val b = pick(2);
        val c = pick(99);
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "a"), "one");
    assert_eq!(global_str(&mut vm, module, "b"), "two");
    assert_eq!(global_str(&mut vm, module, "c"), "other");
}

#[test]
fn test_optional_access_and_coalescing() {
    let (mut vm, module) = run_script(
        r#"
        val missing = nil;
        val a = missing?.anything;
        val b = missing ?? 9;
        val c = false ?: "fallback";
        val d = missing?.call?(1, 2);
        val e = nil?[3];
        val ternary = 1 < 2 ? "yes" : "no";
        "#,
    );
    assert!(global(&mut vm, module, "a").is_nil());
    assert_eq!(global_int(&mut vm, module, "b"), 9);
    assert_eq!(global_str(&mut vm, module, "c"), "fallback");
    assert!(global(&mut vm, module, "d").is_nil());
    assert!(global(&mut vm, module, "e").is_nil());
    assert_eq!(global_str(&mut vm, module, "ternary"), "yes");
}

#[test]
fn test_logical_operators_short_circuit() {
    let (mut vm, module) = run_script(
        r#"
        var calls = 0;
        fun bump() { calls = calls + 1; return true; }
        val a = false and bump();
        val b = true or bump();
        val c = true and bump();
        "#,
    );
    assert!(matches!(global(&mut vm, module, "a"), Value::Bool(false)));
    assert!(matches!(global(&mut vm, module, "b"), Value::Bool(true)));
    assert!(matches!(global(&mut vm, module, "c"), Value::Bool(true)));
    assert_eq!(global_int(&mut vm, module, "calls"), 1);
}

#[test]
fn test_variadic_function_packs_arguments() {
    let (mut vm, module) = run_script(
        r#"
        fun total(xs..) {
            var sum = 0;
            for (x : xs) { sum = sum + x; }
            return sum;
        }
        val result = total(1, 2, 3, 4);
        val empty = total();
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 10);
    assert_eq!(global_int(&mut vm, module, "empty"), 0);
}

#[test]
fn test_lambda_return_is_nonlocal_only_through_lambdas() {
    let (mut vm, module) = run_script(
        r#"
        fun runTwice(f) { f(); f(); return "done"; }
        var count = 0;
        val outcome = runTwice(fun() { count = count + 1; return nil; });
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "count"), 2);
    assert_eq!(global_str(&mut vm, module, "outcome"), "done");
}

#[test]
fn test_backtick_identifiers_escape_keywords() {
    let (mut vm, module) = run_script(
        r#"
        val `class` = 5;
        val result = `class` + 1;
        "#,
    );
    assert_eq!(global_int(&mut vm, module, "result"), 6);
}

// ─── Namespaces ───────────────────────────────────────────────────────────────

#[test]
fn test_using_binds_core_classes_by_dotted_path() {
    let (mut vm, module) = run_script(
        r#"
        using lang.Exception as Ex;
        var caught = "";
        try {
            throw Ex("ns");
        } catch (Ex e) {
            caught = e.message;
        }
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "caught"), "ns");
}

#[test]
fn test_namespace_declaration_qualifies_classes() {
    let (mut vm, module) = run_script(
        r#"
        namespace demo.app;
        class Widget { }
        val full = Widget.fullName();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "full"), "kestrel.demo.app.Widget");
}

// ─── Natives ──────────────────────────────────────────────────────────────────

#[test]
fn test_random_is_deterministic_per_seed() {
    let (mut vm, module) = run_script(
        r#"
        val r1 = Random(42);
        val r2 = Random(42);
        val a = r1.nextIntBounded(1000);
        val b = r2.nextIntBounded(1000);
        val f = r1.nextFloat();
        val inRange = a >= 0 and a < 1000;
        "#,
    );
    let a = global_int(&mut vm, module, "a");
    let b = global_int(&mut vm, module, "b");
    assert_eq!(a, b);
    assert!(matches!(global(&mut vm, module, "inRange"), Value::Bool(true)));
    assert!(matches!(global(&mut vm, module, "f"), Value::Float(f) if (0.0..1.0).contains(&f)));
}

#[test]
fn test_file_round_trip() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("kestrel_e2e_{}.txt", std::process::id()));
    let path_text = path.to_string_lossy().to_string();
    let source = format!(
        r#"
        val out = File("{path}", "w");
        out.write("line one\nline two");
        out.close();
        val wasOpen = out.isOpen();
        val f = File("{path}", "r");
        val first = f.readLine();
        val rest = f.read();
        f.close();
        val exists = File.exists("{path}");
        "#,
        path = path_text
    );
    let (mut vm, module) = run_script(&source);
    assert_eq!(global_str(&mut vm, module, "first"), "line one");
    assert_eq!(global_str(&mut vm, module, "rest"), "line two");
    assert!(matches!(global(&mut vm, module, "wasOpen"), Value::Bool(false)));
    assert!(matches!(global(&mut vm, module, "exists"), Value::Bool(true)));
    let _ = std::fs::remove_file(path);
}

#[test]
fn test_object_protocol() {
    let (mut vm, module) = run_script(
        r#"
        class Box { }
        val b = Box();
        val cls = b.getClass().name();
        val isBox = b.instanceOf(Box);
        val id1 = b.instanceId();
        val id2 = b.instanceId();
        val stable = id1 == id2;
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "cls"), "Box");
    assert!(matches!(global(&mut vm, module, "isBox"), Value::Bool(true)));
    assert!(matches!(global(&mut vm, module, "stable"), Value::Bool(true)));
}

#[test]
fn test_subclassing_a_boxed_primitive_wraps_the_value() {
    let (mut vm, module) = run_script(
        r#"
        class Tag : String { }
        val t = Tag("x");
        val isTag = t.instanceOf(Tag);
        val isString = t.instanceOf(String);
        "#,
    );
    assert!(matches!(global(&mut vm, module, "isTag"), Value::Bool(true)));
    assert!(matches!(global(&mut vm, module, "isString"), Value::Bool(true)));
    let boxed = match global(&mut vm, module, "t") {
        Value::Obj(id) => id,
        other => panic!("expected object, got {:?}", other),
    };
    match vm.heap.data(boxed) {
        ObjData::ValueInstance { value } => match value {
            Value::Obj(inner) => assert_eq!(vm.heap.str(*inner), "x"),
            other => panic!("expected boxed string, got {:?}", other),
        },
        other => panic!("expected a value instance, got {}", other.kind_name()),
    }
}

#[test]
fn test_anonymous_class_expression() {
    let (mut vm, module) = run_script(
        r#"
        val greeter = (class {
            greet() { return "anon"; }
        })();
        val result = greeter.greet();
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "result"), "anon");
}

#[test]
fn test_user_to_string_drives_interpolation() {
    let (mut vm, module) = run_script(
        r#"
        class Money {
            init(amount) { this.amount = amount; }
            toString() { return "$" + "${this.amount}"; }
        }
        val label = "cost: ${Money(5)}";
        "#,
    );
    assert_eq!(global_str(&mut vm, module, "label"), "cost: $5");
}
