/// Boundary behaviors: compiler limits, numeric promotion, frame budget.
use kestrel::conf::Configuration;
use kestrel::errors::KesError;
use kestrel::value::Value;
use kestrel::vm::Vm;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn run(source: &str) -> Result<(Vm, kestrel::value::HeapId), KesError> {
    let mut vm = Vm::new(Configuration::default());
    let module = vm.new_module("limits.kes");
    let value = vm.interpret_in_module(source, module)?;
    vm.finish_run(value)?;
    Ok((vm, module))
}

fn compile_error_messages(source: &str) -> Vec<String> {
    match run(source) {
        Err(KesError::Compile(errors)) => errors.iter().map(|e| e.to_string()).collect(),
        Ok(_) => panic!("source should fail to compile"),
        Err(other) => panic!("expected compile errors, got {}", other),
    }
}

// ─── Local-slot budget ────────────────────────────────────────────────────────

fn script_with_locals(count: usize) -> String {
    let mut source = String::from("fun f() {\n");
    for i in 0..count {
        source.push_str(&format!("var l{} = {};\n", i, i));
    }
    source.push_str("}\n");
    source
}

#[test]
fn test_locals_fill_the_frame_but_do_not_overflow_it() {
    // Slot 0 is the reserved receiver slot; 255 declared locals fill the
    // 256-slot frame exactly.
    assert!(run(&script_with_locals(255)).is_ok());
}

#[test]
fn test_one_local_too_many_is_a_compile_error() {
    let errors = compile_error_messages(&script_with_locals(256));
    assert!(errors
        .iter()
        .any(|e| e.contains("Too many local variables")));
}

// ─── Jump width ───────────────────────────────────────────────────────────────

#[test]
fn test_jump_wider_than_u16_is_a_compile_error() {
    // A then-branch so large its exit jump cannot encode in 16 bits.
    let mut source = String::from("var x = 0;\nif (true) {\n");
    for _ in 0..12_000 {
        source.push_str("x = x + 1;\n");
    }
    source.push_str("}\n");
    let errors = compile_error_messages(&source);
    assert!(errors.iter().any(|e| e.contains("Too much code to jump over")));
}

// ─── Arity ────────────────────────────────────────────────────────────────────

fn function_with_params(count: usize) -> String {
    let params: Vec<String> = (0..count).map(|i| format!("p{}", i)).collect();
    format!("fun wide({}) {{ return 0; }}\n", params.join(", "))
}

#[test]
fn test_arity_255_compiles() {
    assert!(run(&function_with_params(255)).is_ok());
}

#[test]
fn test_arity_256_fails() {
    match run(&function_with_params(256)) {
        Err(KesError::Compile(errors)) => {
            assert!(errors
                .iter()
                .any(|e| e.to_string().contains("more than 255 parameters")));
        }
        Ok(_) => panic!("256 parameters should not compile"),
        Err(other) => panic!("expected compile errors, got {}", other),
    }
}

#[test]
fn test_wrong_call_arity_is_a_runtime_error() {
    let (mut vm, module) = run(
        r#"
        fun add(a, b) { return a + b; }
        var message = "";
        try {
            add(1, 2, 3);
        } catch (ArgumentException e) {
            message = e.message;
        }
        "#,
    )
    .expect("script should run");
    let message = match vm.global_value(module, "message") {
        Some(Value::Obj(id)) => vm.heap.str(id).to_string(),
        other => panic!("expected message string, got {:?}", other),
    };
    assert!(message.contains("Expected 2 arguments but got 3"));
}

// ─── Numeric boundaries ───────────────────────────────────────────────────────

#[test]
fn test_int32_overflow_promotes_to_float() {
    let (mut vm, module) = run(
        r#"
        val max = 2147483647;
        val promoted = max + 1;
        val stillInt = max + 0;
        val negated = -(0 - 2147483647);
        "#,
    )
    .expect("script should run");
    assert!(matches!(
        vm.global_value(module, "promoted"),
        Some(Value::Float(f)) if f == 2147483648.0
    ));
    assert!(matches!(
        vm.global_value(module, "stillInt"),
        Some(Value::Int(2147483647))
    ));
    assert!(matches!(
        vm.global_value(module, "negated"),
        Some(Value::Int(2147483647))
    ));
}

// ─── Frame budget ─────────────────────────────────────────────────────────────

#[test]
fn test_unbounded_recursion_overflows_the_frame_stack() {
    match run(
        r#"
        fun dive(n) { return dive(n + 1); }
        dive(0);
        "#,
    ) {
        Err(KesError::Runtime(fatal)) => {
            assert!(
                fatal.message.contains("StackOverflow"),
                "got: {}",
                fatal.message
            );
        }
        Ok(_) => panic!("unbounded recursion should overflow"),
        Err(other) => panic!("expected a runtime error, got {}", other),
    }
}

#[test]
fn test_stack_overflow_is_catchable() {
    let (mut vm, module) = run(
        r#"
        fun dive(n) { return dive(n + 1); }
        var caught = false;
        try {
            dive(0);
        } catch (StackOverflowException e) {
            caught = true;
        }
        "#,
    )
    .expect("script should run");
    assert!(matches!(
        vm.global_value(module, "caught"),
        Some(Value::Bool(true))
    ));
}

// ─── Front-end limits ─────────────────────────────────────────────────────────

#[test]
fn test_interpolation_nesting_limit_is_a_lex_error() {
    let mut source = String::from("val s = ");
    for _ in 0..16 {
        source.push_str("\"${");
    }
    source.push('1');
    match run(&source) {
        Err(KesError::Compile(errors)) => {
            assert!(errors
                .iter()
                .any(|e| e.to_string().contains("nested too deeply")));
        }
        Ok(_) => panic!("16 interpolation levels should fail to lex"),
        Err(other) => panic!("expected compile errors, got {}", other),
    }
}

#[test]
fn test_resolver_rejects_top_level_return() {
    let errors = compile_error_messages("return 1;");
    assert!(errors.iter().any(|e| e.contains("top-level code")));
}

#[test]
fn test_compile_rejects_global_redeclaration() {
    let errors = compile_error_messages("val x = 1;\nval x = 2;\n");
    assert!(errors.iter().any(|e| e.contains("redeclare")
        || e.contains("Already a variable")));
}
