use sable::reporter::{Report, Reporter};
use sable::vm::{InterpretError, RuntimeError, Vm};
use std::{cell::RefCell, io, rc::Rc};

#[derive(Clone)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn new() -> Self {
        SharedBuf(Rc::new(RefCell::new(Vec::new())))
    }

    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ErrorsTracker {
    errors: Vec<Report>,
}

impl ErrorsTracker {
    fn new() -> Self {
        ErrorsTracker { errors: Vec::new() }
    }
}

impl Reporter for ErrorsTracker {
    fn warning(&mut self, _report: Report) {}

    fn error(&mut self, report: Report) {
        self.errors.push(report);
    }
}

fn run_with(source: &str, gc_stress: bool) -> String {
    let buf = SharedBuf::new();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    vm.set_gc_stress(gc_stress);
    let mut reporter = ErrorsTracker::new();
    if let Err(err) = vm.interpret(source, &mut reporter) {
        panic!("interpret failed: {:?}, reports: {:?}", err, reporter.errors);
    }
    buf.contents()
}

fn run(source: &str) -> String {
    run_with(source, false)
}

fn runtime_error(source: &str) -> RuntimeError {
    let buf = SharedBuf::new();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    let mut reporter = ErrorsTracker::new();
    match vm.interpret(source, &mut reporter) {
        Err(InterpretError::Runtime(err)) => err,
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn arithmetic() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run("print 7 / 2 - 1;"), "2.5\n");
    assert_eq!(run("print -(3 - 5);"), "2\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("print \"foo\" + \"bar\";"), "foobar\n");
    assert_eq!(run("print \"foo\" + \"bar\" == \"foobar\";"), "true\n");
}

#[test]
fn equality_works_on_every_type_pair() {
    assert_eq!(run("print 1 == 1;"), "true\n");
    assert_eq!(run("print 1 == \"1\";"), "false\n");
    assert_eq!(run("print nil == nil;"), "true\n");
    assert_eq!(run("print nil == false;"), "false\n");
    assert_eq!(run("print true != 1;"), "true\n");
}

#[test]
fn comparison_and_not() {
    assert_eq!(run("print 1 < 2; print 2 <= 2; print 3 > 4; print !nil;"), "true\ntrue\nfalse\ntrue\n");
}

#[test]
fn globals_and_assignment() {
    assert_eq!(run("var a = 1; a = a + 2; print a;"), "3\n");
    assert_eq!(run("var a; print a;"), "nil\n");
    assert_eq!(run("var a; var b; a = b = 2; print a + b;"), "4\n");
}

#[test]
fn blocks_shadow_locals() {
    assert_eq!(
        run("var a = \"global\"; { var a = \"local\"; print a; } print a;"),
        "local\nglobal\n"
    );
}

#[test]
fn if_else() {
    assert_eq!(run("if (1 < 2) print \"then\"; else print \"else\";"), "then\n");
    assert_eq!(run("if (nil) print \"then\"; else print \"else\";"), "else\n");
}

#[test]
fn while_loop() {
    assert_eq!(
        run("var i = 0; var sum = 0; while (i < 5) { i = i + 1; sum = sum + i; } print sum;"),
        "15\n"
    );
}

#[test]
fn for_loop() {
    assert_eq!(run("for (var i = 0; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
    assert_eq!(run("for (var i = 0; i < 0; i = i + 1) print i; print \"done\";"), "done\n");
}

#[test]
fn short_circuit() {
    assert_eq!(
        run("fun boom() { print \"boom\"; return true; }\nprint false and boom();\nprint true or boom();"),
        "false\ntrue\n"
    );
    assert_eq!(run("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run("print 1 and 2;"), "2\n");
}

#[test]
fn functions_and_returns() {
    assert_eq!(
        run("fun add(a, b) { return a + b; } print add(1, 2);"),
        "3\n"
    );
    assert_eq!(run("fun noisy() { print \"hi\"; } print noisy();"), "hi\nnil\n");
    assert_eq!(run("fun f() { return; print \"unreachable\"; } print f();"), "nil\n");
}

#[test]
fn recursion() {
    assert_eq!(
        run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
        "55\n"
    );
}

#[test]
fn closure_over_mutated_local() {
    assert_eq!(
        run("fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }\nvar n = makeCounter();\nprint n(); print n(); print n();"),
        "1\n2\n3\n"
    );
}

#[test]
fn two_closures_share_one_upvalue() {
    assert_eq!(
        run("var get; var set;\nfun setup() { var x = 10; fun g() { return x; } fun s(v) { x = v; } get = g; set = s; }\nsetup(); set(5); print get();"),
        "5\n"
    );
}

#[test]
fn captured_block_local_survives_its_scope() {
    assert_eq!(
        run("var f; { var text = \"kept\"; fun show() { print text; } f = show; } f();"),
        "kept\n"
    );
}

#[test]
fn deeply_nested_closures_resolve_through_the_chain() {
    let depth = 64;
    let mut source = String::from("var result; fun f0() { var v = 42; ");
    for i in 1..=depth {
        source += &format!("fun f{}() {{ ", i);
    }
    source += "result = v; ";
    for i in (1..=depth).rev() {
        source += &format!("}} f{}(); ", i);
    }
    source += "} f0(); print result;";
    assert_eq!(run(&source), "42\n");
}

#[test]
fn classes_and_fields() {
    assert_eq!(
        run("class P { init(x) { this.x = x; } }\nprint P(42).x;"),
        "42\n"
    );
    assert_eq!(
        run("class Bag {}\nvar b = Bag();\nb.item = \"pin\";\nprint b.item;"),
        "pin\n"
    );
    assert_eq!(run("class Bag {}\nprint Bag;\nprint Bag();"), "Bag\nBag instance\n");
}

#[test]
fn methods_bind_this() {
    assert_eq!(
        run("class P { init(x) { this.x = x; } getx() { return this.x; } }\nvar p = P(9);\nvar m = p.getx;\nprint m();"),
        "9\n"
    );
}

#[test]
fn initializer_returns_this_implicitly() {
    assert_eq!(
        run("class C { init() { this.n = 1; return; } }\nprint C().n;"),
        "1\n"
    );
}

#[test]
fn inheritance_and_super() {
    assert_eq!(
        run("class A { greet() { print \"A\"; } }\nclass B < A { greet() { super.greet(); print \"B\"; } }\nB().greet();"),
        "A\nB\n"
    );
}

#[test]
fn inherited_methods_dispatch_on_the_subclass() {
    assert_eq!(
        run("class A { hello() { print \"hello\"; } }\nclass B < A {}\nB().hello();"),
        "hello\n"
    );
}

#[test]
fn super_resolves_on_the_static_superclass() {
    assert_eq!(
        run("class A { method() { print \"A method\"; } }\nclass B < A { method() { print \"B method\"; } test() { super.method(); } }\nclass C < B {}\nC().test();"),
        "A method\n"
    );
}

#[test]
fn a_field_shadows_a_method_on_invoke() {
    assert_eq!(
        run("class A { m() { print \"method\"; } }\nfun shout() { print \"field\"; }\nvar a = A();\na.m = shout;\na.m();"),
        "field\n"
    );
}

#[test]
fn clock_is_registered() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
}

#[test]
fn output_does_not_depend_on_gc_schedule() {
    let source = "\
class Node { init(value) { this.value = value; } }\n\
fun describe(node) { return \"node \" + node.value; }\n\
var i = 0;\n\
while (i < 20) {\n\
  var n = Node(\"x\");\n\
  n.value = n.value + \"y\";\n\
  print describe(n);\n\
  i = i + 1;\n\
}\n";
    assert_eq!(run_with(source, false), run_with(source, true));
}

#[test]
fn closures_survive_forced_collections() {
    let source = "\
fun makeCounter() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }\n\
var n = makeCounter();\n\
print n(); print n(); print n();";
    assert_eq!(run_with(source, true), "1\n2\n3\n");
}

#[test]
fn the_vm_keeps_globals_between_runs() {
    let buf = SharedBuf::new();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    let mut reporter = ErrorsTracker::new();
    vm.interpret("fun double(n) { return n * 2; } var x = 21;", &mut reporter)
        .unwrap();
    vm.interpret("print double(x);", &mut reporter).unwrap();
    assert_eq!(buf.contents(), "42\n");
}

#[test]
fn the_vm_recovers_after_a_runtime_error() {
    let buf = SharedBuf::new();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    let mut reporter = ErrorsTracker::new();
    vm.interpret("var greeting = \"back\";", &mut reporter).unwrap();
    assert!(matches!(
        vm.interpret("print missing;", &mut reporter),
        Err(InterpretError::Runtime(_))
    ));
    vm.interpret("print greeting;", &mut reporter).unwrap();
    assert_eq!(buf.contents(), "back\n");
}

#[test]
fn arity_mismatch_names_both_counts() {
    let err = runtime_error("fun one(a) { return a; } one(1, 2);");
    assert_eq!(err.message(), "Expected 1 arguments but got 2.");
}

#[test]
fn class_without_init_rejects_arguments() {
    let err = runtime_error("class C {}\nC(1);");
    assert_eq!(err.message(), "Expected 0 arguments but got 1.");
}

#[test]
fn calling_a_non_callable_fails() {
    let err = runtime_error("var x = 3; x();");
    assert_eq!(err.message(), "Can only call functions and classes.");
}

#[test]
fn undefined_variable_and_property() {
    assert_eq!(
        runtime_error("print missing;").message(),
        "Undefined variable 'missing'."
    );
    assert_eq!(
        runtime_error("missing = 1;").message(),
        "Undefined variable 'missing'."
    );
    assert_eq!(
        runtime_error("class C {}\nprint C().absent;").message(),
        "Undefined property 'absent'."
    );
}

#[test]
fn type_errors() {
    assert_eq!(
        runtime_error("print -\"s\";").message(),
        "Operand must be a number."
    );
    assert_eq!(
        runtime_error("print 1 < \"s\";").message(),
        "Operands must be numbers."
    );
    assert_eq!(
        runtime_error("print 1 + \"s\";").message(),
        "Operands must be two numbers or two strings."
    );
    assert_eq!(
        runtime_error("var x = 1; print x.field;").message(),
        "Only instances have properties."
    );
    assert_eq!(
        runtime_error("var notclass = 1; class C < notclass {}").message(),
        "Superclass must be a class."
    );
}

#[test]
fn unbounded_recursion_overflows_the_frame_stack() {
    let err = runtime_error("fun loop() { loop(); } loop();");
    assert_eq!(err.message(), "Stack overflow.");
}

#[test]
fn runtime_errors_carry_a_stack_trace() {
    let err = runtime_error("fun a() {\n  b();\n}\nfun b() {\n  bad();\n}\na();");
    assert_eq!(
        err.to_string(),
        "Undefined variable 'bad'.\n[line 5] in b()\n[line 2] in a()\n[line 7] in script\n"
    );
}

#[test]
fn number_formatting() {
    assert_eq!(run("print 7; print 2.5; print 10 / 4;"), "7\n2.5\n2.5\n");
}
