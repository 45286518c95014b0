// Integration tests for the Ember VM
//
// These tests drive complete Ember programs through the embedding API
// and check results, printed output, error kinds, and VM invariants:
// - arithmetic, conditionals, loops, functions, closures
// - try/catch/finally ordering and handler-count restoration
// - the VFS sandbox and the module install/import round trip
// - garbage collection under allocation stress

use ember::errors::ErrorKind;
use ember::value::Value;
use ember::vfs::MountMode;
use ember::vm::Vm;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let dir = std::env::temp_dir().join(format!(
        "ember_it_{}_{}_{}",
        prefix,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).expect("failed to create temp dir");
    dir
}

fn run(source: &str) -> (Vm, Result<Value, ember::EmberError>) {
    let mut vm = Vm::new();
    vm.capture_output();
    let result = vm.eval(source);
    (vm, result)
}

fn run_output(source: &str) -> String {
    let (mut vm, result) = run(source);
    result.expect("program should succeed");
    vm.take_output()
}

// === Scenario 1: arithmetic and printing ===

#[test]
fn test_arithmetic_and_printing() {
    assert_eq!(run_output("print(2 + 3 * 4)"), "14\n");
}

// === Scenario 2: conditional expression ===

#[test]
fn test_conditional_expression() {
    assert_eq!(run_output("x = 10; y = 0; print(if x > y \"pos\" else \"neg\")"), "pos\n");
}

// === Scenario 3: try/catch/finally order ===

#[test]
fn test_try_catch_finally_order() {
    let (mut vm, result) = run(
        "try { throw \"oops\" } catch (e) { print(\"caught \" + e) } finally { print(\"done\") }",
    );
    result.unwrap();
    assert_eq!(vm.take_output(), "caught oops\ndone\n");
    assert_eq!(vm.exception_handler_count(), 0);
    assert_eq!(vm.finally_block_count(), 0);
}

// === Scenario 4: division by zero is catchable ===

#[test]
fn test_division_by_zero_is_catchable() {
    assert_eq!(run_output("try { x = 10 / 0 } catch (e) { print(\"err\") }"), "err\n");
}

#[test]
fn test_uncaught_division_by_zero() {
    let (_, result) = run("x = 10 / 0");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "Division by zero");
}

// === Scenario 5: array bounds ===

#[test]
fn test_array_out_of_bounds() {
    let (_, result) = run("arr = [1,2,3]; v = arr[10]");
    let err = result.unwrap_err();
    assert!(err.message.contains("out of bounds"));
}

// === Scenario 6: VFS escape refused ===

#[test]
fn test_vfs_escape_refused() {
    let sandbox = unique_temp_dir("sandbox");
    let mut vm = Vm::new();
    vm.capture_output();
    vm.mount("/app", &sandbox, MountMode::ReadWrite).unwrap();

    let result = vm.eval("write_file(\"/app/../etc/passwd\", \"x\")");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Security);
    assert!(!sandbox.join("../etc/passwd").exists());
    fs::remove_dir_all(&sandbox).ok();
}

#[test]
fn test_vfs_read_write_inside_mount() {
    let sandbox = unique_temp_dir("rw");
    let mut vm = Vm::new();
    vm.capture_output();
    vm.mount("/data", &sandbox, MountMode::ReadWrite).unwrap();

    vm.eval(
        "write_file(\"/data/out.txt\", \"hello\")\n\
         append_file(\"/data/out.txt\", \" world\")\n\
         print(read_file(\"/data/out.txt\"))\n\
         print(file_exists(\"/data/out.txt\"))\n\
         print(file_exists(\"/data/missing.txt\"))",
    )
    .unwrap();
    assert_eq!(vm.take_output(), "hello world\ntrue\nfalse\n");
    fs::remove_dir_all(&sandbox).ok();
}

// === Scenario 7: module install + import round trip ===

#[test]
fn test_module_import_via_module_path() {
    let dir = unique_temp_dir("modules");
    fs::write(
        dir.join("mathx.ember"),
        "function square(n) { return n * n }\nanswer = 42\n",
    )
    .unwrap();

    let mut vm = Vm::new();
    vm.capture_output();
    vm.mount("/lib", &dir, MountMode::ReadOnly).unwrap();
    vm.add_module_path("/lib").unwrap();

    let result = vm.eval("import mathx\nprint(square(6))\nprint(answer)").unwrap();
    assert_eq!(result, Value::Nil);
    assert_eq!(vm.take_output(), "36\n42\n");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_second_import_uses_cache() {
    let dir = unique_temp_dir("cache");
    // The module appends to a file on every top-level execution, so a
    // re-parse would be visible.
    fs::write(
        dir.join("tracer.ember"),
        "append_file(\"/scratch/loads.txt\", \"L\")\nfunction ping() { return \"pong\" }\n",
    )
    .unwrap();
    let scratch = unique_temp_dir("scratch");

    let mut vm = Vm::new();
    vm.capture_output();
    vm.mount("/lib", &dir, MountMode::ReadOnly).unwrap();
    vm.mount("/scratch", &scratch, MountMode::ReadWrite).unwrap();
    vm.add_module_path("/lib").unwrap();

    vm.eval("import tracer\nimport tracer\nprint(ping())").unwrap();
    assert_eq!(vm.take_output(), "pong\n");
    assert_eq!(fs::read_to_string(scratch.join("loads.txt")).unwrap(), "L");
    fs::remove_dir_all(&dir).ok();
    fs::remove_dir_all(&scratch).ok();
}

#[test]
fn test_install_and_import_package() {
    if std::env::var_os("HOME").is_none() {
        return;
    }
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let name = format!(
        "itlib_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );

    let staging = unique_temp_dir("pkg_src");
    let source_path = staging.join("src.ember");
    fs::write(&source_path, "function greet(who) { return \"hi \" + who }\n").unwrap();

    let installed =
        ember::package::install_library(&name, source_path.to_str().unwrap()).unwrap();
    assert!(installed.ends_with("package.ember"));

    // A fresh VM resolves the installed package by name.
    let mut vm = Vm::new();
    vm.capture_output();
    vm.eval(&format!("import {}\nprint(greet(\"ember\"))", name)).unwrap();
    assert_eq!(vm.take_output(), "hi ember\n");

    let package_dir = ember::package::packages_root().unwrap().join(&name);
    fs::remove_dir_all(&package_dir).ok();
    fs::remove_dir_all(&staging).ok();
}

#[test]
fn test_import_error_propagates_and_is_not_cached() {
    let dir = unique_temp_dir("badmod");
    fs::write(dir.join("broken.ember"), "function (").unwrap();

    let mut vm = Vm::new();
    vm.capture_output();
    vm.mount("/lib", &dir, MountMode::ReadOnly).unwrap();
    vm.add_module_path("/lib").unwrap();

    let err = vm.eval("import broken").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Import);
    // Still not loaded on a second attempt
    let err = vm.eval("import broken").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Import);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_import_missing_module() {
    let (_, result) = run("import no_such_module_here");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Import);
    assert!(err.message.contains("not found"));
}

#[test]
fn test_import_rejects_hostile_names() {
    for name in ["\"../evil\"", "\"a;b\"", "\"-x\""] {
        let (_, result) = run(&format!("import {}", name));
        assert_eq!(result.unwrap_err().kind, ErrorKind::Security, "name {}", name);
    }
}

// === Scenario 8: GC stress ===

#[test]
fn test_gc_stress_ten_thousand_strings() {
    let (mut vm, result) = run(
        "kept = \"anchor\"\n\
         for (i = 0; i < 10000; i = i + 1) { s = \"str-\" + str(i) }\n\
         nil",
    );
    result.unwrap();
    vm.collect_garbage();
    // Only globals (and module/native tables) still root objects.
    assert!(vm.heap_live_count() < 50, "live = {}", vm.heap_live_count());
    // The VM is still fully functional afterwards.
    let v = vm.eval("kept + \"!\"").unwrap();
    assert_eq!(vm.get_string(&v), Some("anchor!"));
}

#[test]
fn test_gc_preserves_cyclic_structures_reachable_from_globals() {
    let (mut vm, result) = run(
        "a = [1]\nb = {inner: a}\npush(a, b)\nnil",
    );
    result.unwrap();
    vm.collect_garbage();
    let v = vm.eval("len(a)").unwrap();
    assert_eq!(v, Value::Number(2.0));
}

// === Universal invariants ===

#[test]
fn test_stack_top_zero_after_statement_eval() {
    let (vm, result) = run("x = 5");
    result.unwrap();
    assert_eq!(vm.stack_top(), 0);
}

#[test]
fn test_handler_counts_restored_on_success_and_failure() {
    let mut vm = Vm::new();
    vm.capture_output();
    let before = (vm.exception_handler_count(), vm.finally_block_count());

    vm.eval("try { x = 1 } catch (e) { x = 2 } finally { x = 3 }").unwrap();
    assert_eq!((vm.exception_handler_count(), vm.finally_block_count()), before);

    let _ = vm.eval("try { throw \"a\" } finally { throw \"b\" }");
    assert_eq!((vm.exception_handler_count(), vm.finally_block_count()), before);
}

#[test]
fn test_equality_properties() {
    let cases = [
        ("1 == 1", true),
        ("\"a\" == \"a\"", true),
        ("nil == nil", true),
        ("[1, {k: 2}] == [1, {k: 2}]", true),
        ("1 == \"1\"", false),
        ("(0 / 0) == (0 / 0)", false), // NaN is unequal to itself
    ];
    for (source, expected) in cases {
        // 0/0 raises division by zero, so build NaN differently
        let source = source.replace("(0 / 0)", "num(\"nan\")");
        let (_, result) = run(&source);
        assert_eq!(result.unwrap(), Value::Bool(expected), "case {}", source);
    }
}

#[test]
fn test_bool_conversion_is_idempotent() {
    for literal in ["0", "1", "nil", "true", "false", "\"\"", "\"x\"", "[]"] {
        let (_, a) = run(&format!("bool({})", literal));
        let (_, b) = run(&format!("bool(bool({}))", literal));
        assert_eq!(a.unwrap(), b.unwrap(), "bool idempotence for {}", literal);
    }
}

#[test]
fn test_str_num_round_trip() {
    for literal in ["0", "1", "12.5", "-3", "123456", "0.25"] {
        let (vm, result) = run(&format!("str(num(str({})))", literal));
        let value = result.unwrap();
        let (vm2, expected) = run(&format!("str({})", literal));
        let expected = expected.unwrap();
        assert_eq!(
            vm.get_string(&value).unwrap(),
            vm2.get_string(&expected).unwrap(),
            "round trip for {}",
            literal
        );
    }
}

#[test]
fn test_split_join_properties() {
    let (_, result) = run("len(split(\"a,b,,c,\", \",\"))");
    assert_eq!(result.unwrap(), Value::Number(5.0));

    let (vm, result) = run("join(split(\"x:y::z\", \":\"), \":\")");
    let value = result.unwrap();
    assert_eq!(vm.get_string(&value), Some("x:y::z"));
}

// === Language behavior beyond the numbered scenarios ===

#[test]
fn test_print_value_formats() {
    assert_eq!(run_output("print(nil)"), "nil\n");
    assert_eq!(run_output("print(true)"), "true\n");
    assert_eq!(run_output("print(1.5)"), "1.5\n");
    assert_eq!(run_output("print(\"raw text\")"), "raw text\n");
    assert_eq!(run_output("print([1, \"two\", [3]])"), "[1, \"two\", [3]]\n");
    assert_eq!(run_output("print({a: 1})"), "{\"a\": 1}\n");
}

#[test]
fn test_nested_function_calls_and_closures() {
    let out = run_output(
        "function make_adder(n) { return function (x) { return x + n } }\n\
         add2 = make_adder(2)\nadd10 = make_adder(10)\n\
         print(add2(1))\nprint(add10(1))\nprint(add2(add10(0)))",
    );
    assert_eq!(out, "3\n11\n12\n");
}

#[test]
fn test_while_and_for_loops() {
    let out = run_output(
        "total = 0\nfor (i = 1; i <= 4; i = i + 1) { total = total + i }\nprint(total)\n\
         n = 3\nwhile n > 0 { print(n)\nn = n - 1 }",
    );
    assert_eq!(out, "10\n3\n2\n1\n");
}

#[test]
fn test_maps_sets_and_builtins() {
    let out = run_output(
        "m = {name: \"ember\", version: 4}\n\
         print(len(m))\nprint(m.name)\nprint(m[\"version\"])\nprint(has(m, \"name\"))\n\
         s = set(1, 2, 2, 3)\nprint(len(s))\nprint(contains(s, 2))",
    );
    assert_eq!(out, "2\nember\n4\ntrue\n3\ntrue\n");
}

#[test]
fn test_error_object_accessible_in_catch() {
    let out = run_output(
        "try { arr = [1]\nv = arr[5] } catch (e) { print(type(e))\nprint(str(e)) }",
    );
    assert!(out.starts_with("error\n"));
    assert!(out.contains("out of bounds"));
}

#[test]
fn test_rethrow_from_catch() {
    let (_, result) = run(
        "try { throw \"inner\" } catch (e) { throw \"outer: \" + e }",
    );
    let err = result.unwrap_err();
    assert!(err.message.contains("outer: inner"));
}

#[test]
fn test_finally_without_catch_propagates() {
    let (mut vm, result) = run(
        "try { throw \"up\" } finally { print(\"cleanup\") }",
    );
    let err = result.unwrap_err();
    assert!(err.message.contains("up"));
    assert_eq!(vm.take_output(), "cleanup\n");
}

#[test]
fn test_nested_try_blocks() {
    let out = run_output(
        "try {\n\
           try { throw \"deep\" } catch (inner) { print(\"inner: \" + inner)\nthrow \"again\" }\n\
         } catch (outer) { print(\"outer: \" + outer) }",
    );
    assert_eq!(out, "inner: deep\nouter: again\n");
}

#[test]
fn test_stack_depth_security_error() {
    let (_, result) = run("function f() { return f() }\nf()");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Security);
    assert!(err.message.contains("[SECURITY] stack depth exceeded"));
}

#[test]
fn test_security_error_is_catchable() {
    let out = run_output(
        "function f() { return f() }\n\
         try { f() } catch (e) { print(\"caught: \" + type(e)) }",
    );
    assert_eq!(out, "caught: error\n");
}

#[test]
fn test_crypto_builtins_from_script() {
    let out = run_output(
        "print(sha256(\"abc\"))\nprint(len(secure_random(8)))\n\
         print(hmac_sha256(\"Jefe\", \"what do ya want for nothing?\"))",
    );
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(
        lines[0],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(lines[1], "16");
    assert_eq!(
        lines[2],
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
    );
}

#[test]
fn test_json_builtins_from_script() {
    let out = run_output(
        "data = json_parse(\"{\\\"n\\\": 2, \\\"tags\\\": [\\\"a\\\"]}\")\n\
         print(data.n)\nprint(data.tags[0])\n\
         print(json_validate(\"[1,2]\"))\nprint(json_validate(\"{oops\"))\n\
         print(json_stringify([1, true, nil]))",
    );
    assert_eq!(out, "2\na\ntrue\nfalse\n[1,true,null]\n");
}

#[test]
fn test_math_and_string_builtins_from_script() {
    let out = run_output(
        "print(abs(0 - 7))\nprint(pow(2, 8))\nprint(max(3, 9))\nprint(floor(2.9))\n\
         print(substr(\"embers\", 0, 5))\nprint(upper(\"go\"))\nprint(index_of(\"hello\", \"llo\"))",
    );
    assert_eq!(out, "7\n256\n9\n2\nember\nGO\n2\n");
}

#[test]
fn test_lenient_arity_policy_returns_nil() {
    let out = run_output("print(type(abs()))\nprint(type(sqrt(\"x\")))\nprint(type(len()))");
    assert_eq!(out, "nil\nnil\nnil\n");
}

#[test]
fn test_eval_error_replaced_by_next_eval() {
    let mut vm = Vm::new();
    vm.capture_output();
    let _ = vm.eval("1 / 0");
    assert!(vm.has_error());
    vm.eval("1 + 1").unwrap();
    assert!(!vm.has_error());
}

#[test]
fn test_shebang_script() {
    assert_eq!(run_output("#!/usr/bin/env ember\nprint(\"ran\")"), "ran\n");
}

#[test]
fn test_syntax_error_has_location() {
    let (_, result) = run("x = (1 +");
    let err = result.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert!(err.location.line >= 1);
}
