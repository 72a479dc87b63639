//! End-to-end evaluator behavior over parsed source.

use ophid::{EvalError, Evaluator, Value, ValueTag};

fn run(source: &str) -> Result<Value, EvalError> {
    Evaluator::default().eval_source(source)
}

fn run_ok(source: &str) -> Value {
    run(source).unwrap_or_else(|e| panic!("'{source}' failed: {e}"))
}

fn run_int(source: &str) -> i64 {
    run_ok(source).as_int().unwrap_or_else(|e| panic!("'{source}' not an int: {e}"))
}

#[test]
fn literals_self_evaluate() {
    assert_eq!(run_int("42"), 42);
    assert_eq!(run_ok("2.5").as_real().unwrap(), 2.5);
    assert_eq!(run_ok("\"hi\"").as_string().unwrap(), "hi");
    assert_eq!(run_ok("{1 2}").tag(), ValueTag::BraceList);
    assert_eq!(run_ok("'9").tag(), ValueTag::Some);
    assert_eq!(run_ok("@(\"payload\")").tag(), ValueTag::Error);
}

#[test]
fn empty_instruction_is_none() {
    // `()` yields the none value, not a call.
    assert_eq!(run_ok("()").tag(), ValueTag::None);
}

#[test]
fn unbound_symbols_remain_names() {
    let v = run_ok("mystery");
    assert_eq!(v.tag(), ValueTag::Symbol);
    assert_eq!(v.symbol_text().unwrap().as_ref(), "mystery");
}

#[test]
fn def_binds_and_returns_the_value() {
    assert_eq!(run_int("[ (def x 5) x ]"), 5);
    assert!(matches!(run("[ (def x 1) (def x 2) ]"), Err(EvalError::Redefinition(_))));
}

#[test]
fn block_scope_does_not_leak() {
    // x is bound inside the inner block only.
    let v = run_ok("[ [ (def x 1) ] x ]");
    assert_eq!(v.tag(), ValueTag::Symbol);
}

#[test]
fn block_result_is_the_last_element() {
    assert_eq!(run_int("[ 1 2 3 ]"), 3);
    assert_eq!(run_ok("[]").tag(), ValueTag::None);
}

#[test]
fn lambda_identity_survives_binding() {
    // Two identical definitions are still two lambdas.
    assert_eq!(run_int("[ (def f (fn () :int [0])) (def g (fn () :int [0])) (eq f f) ]"), 1);
    assert_eq!(run_int("[ (def f (fn () :int [0])) (def g (fn () :int [0])) (eq f g) ]"), 0);
}

#[test]
fn lambdas_capture_lexically() {
    assert_eq!(run_int("[ (def x 10) (def get (fn () :int [ x ])) (get) ]"), 10);
    // A lambda returned out of its defining scope keeps the capture.
    assert_eq!(
        run_int("[ (def make (fn () :fn [ [ (def secret 7) (fn () :int [ secret ]) ] ])) (def got (make)) (got) ]"),
        7
    );
}

#[test]
fn call_scope_is_isolated_from_the_caller() {
    let v = run_ok("[ (def f (fn () :int [ (def inner 5) inner ])) (f) inner ]");
    // `inner` is not visible after the call; it stays a name.
    assert_eq!(v.tag(), ValueTag::Symbol);
}

#[test]
fn parameters_shadow_and_bind() {
    assert_eq!(run_int("[ (def pick (fn (a :int b :int) :int [ b ])) (pick 1 2) ]"), 2);
    assert_eq!(run_int("[ (def any-of (fn (x :any) :int [ 1 ])) (any-of \"s\") ]"), 1);
}

#[test]
fn variadic_tail_arrives_as_a_brace_list() {
    assert_eq!(run_ok("[ (def rest (fn (xs :int..) :list-c [ xs ])) (rest 1 2 3) ]").as_list().unwrap().len(), 3);
    assert_eq!(run_ok("[ (def rest (fn (xs :int..) :list-c [ xs ])) (rest) ]").as_list().unwrap().len(), 0);
}

#[test]
fn arity_violations_are_fatal() {
    let result = run("[ (def f (fn (a :int) :int [ a ])) (f 1 2) ]");
    assert!(matches!(result, Err(EvalError::Arity { .. })));
}

#[test]
fn argument_type_violations_raise_catchably() {
    assert_eq!(run_int("[ (def f (fn (a :int) :int [ a ])) (try (f \"no\") 77) ]"), 77);
}

#[test]
fn if_selects_on_nonzero_integers() {
    assert_eq!(run_int("(if 1 10 20)"), 10);
    assert_eq!(run_int("(if 0 10 20)"), 20);
    assert_eq!(run_ok("(if 0 10)").tag(), ValueTag::None);
    // Non-integer condition raises.
    assert!(matches!(run("(if \"s\" 1 2)"), Err(EvalError::Unhandled(_))));
}

#[test]
fn match_is_structural_first_wins() {
    assert_eq!(run_ok("(match 2 (1 \"one\") (2 \"two\"))").as_string().unwrap(), "two");
    assert_eq!(run_ok("(match \"b\" (\"a\" 1) (\"b\" 2))").as_int().unwrap(), 2);
    // Missing arm yields none, not an error.
    assert_eq!(run_ok("(match 9 (1 \"one\"))").tag(), ValueTag::None);
}

#[test]
fn reflect_dispatches_on_runtime_tags() {
    assert_eq!(run_int("(reflect \"s\" (:int 1) (:str 2))"), 2);
    assert_eq!(run_int("(reflect 3.5 (:int 1) (:any 9))"), 9);
    assert_eq!(run_ok("(reflect 'x (:int 1))").tag(), ValueTag::None);
}

#[test]
fn do_runs_until_done() {
    assert_eq!(run_int("(do [ (done 42) ])"), 42);
    // The loop body re-runs until done fires: flip a storage slot.
    let source = "[
        (at 0 0)
        (do [
            (if (eq (at 0) 1) (done \"finished\") (at 0 1))
        ])
    ]";
    assert_eq!(run_ok(source).as_string().unwrap(), "finished");
}

#[test]
fn done_outside_do_is_fatal() {
    assert!(matches!(run("(done 1)"), Err(EvalError::DoneOutsideLoop)));
}

#[test]
fn try_recovers_the_same_shape() {
    assert_eq!(run_int("(try 1 2)"), 1);
    assert_eq!(run_int("(try (assert 0 \"boom\") 5)"), 5);
}

#[test]
fn recover_binds_the_exception_payload() {
    // Scenario: a failing cast inside the body selects the handler.
    assert_eq!(run_int("[ (def r (recover [ (cast :int \"nope\") 99 ] [ 42 ])) r ]"), 42);

    let payload = run_ok("(recover [ (assert 0 \"boom\") ] [ $exception ])");
    assert_eq!(payload.tag(), ValueTag::Error);
    let items = payload.as_list().unwrap();
    assert_eq!(items.get(0).unwrap().as_string().unwrap(), "boom");
}

#[test]
fn assert_raises_with_its_message() {
    assert_eq!(run_ok("(assert 1 \"fine\")").tag(), ValueTag::None);
    match run("(assert 0 \"boom\")") {
        Err(EvalError::Unhandled(rendered)) => assert!(rendered.contains("boom")),
        other => panic!("expected unhandled error, got {other:?}"),
    }
}

#[test]
fn eq_laws_hold() {
    assert_eq!(run_int("(eq 3 3)"), 1);
    assert_eq!(run_int("(eq 3 4)"), 0);
    assert_eq!(run_int("(eq 3 3.0)"), 0);
    assert_eq!(run_int("(eq \"a\" \"a\")"), 1);
    assert_eq!(run_int("(eq {1 2 3} {1 2 3})"), 1);
    // List shape is part of identity.
    assert_eq!(run_int("(eq '(1 2 3) {1 2 3})"), 0);
    assert_eq!(run_int("(eq '(1 2 3) '(1 2 3))"), 1);
}

#[test]
fn datum_equality_compares_one_level_in() {
    // Both datums peel to their inner instruction lists.
    assert_eq!(run_int("(eq #(5 6) #(5 6))"), 1);
    // After the unwrap the left side is a paren list, the right a SOME.
    assert_eq!(run_int("(eq #(1 2) '(1 2))"), 0);
}

#[test]
fn cast_moves_between_numerics() {
    assert_eq!(run_int("(cast :int 3.9)"), 3);
    assert_eq!(run_int("(cast :int -3.9)"), -3);
    assert_eq!(run_ok("(cast :real 4)").as_real().unwrap(), 4.0);
    assert_eq!(run_int("(cast :int (cast :rune 65))"), 65);
}

#[test]
fn cast_unwraps_some_once() {
    assert_eq!(run_int("(cast :int '5)"), 5);
}

#[test]
fn cast_forges_strings_and_back() {
    // Scenario: byte list -> string -> byte list.
    let source = "[ (def ints {72 101 108 108 111}) (def s (cast :str ints)) (cast :list-b s) ]";
    let bytes = run_ok(source);
    assert_eq!(bytes.tag(), ValueTag::BracketList);
    let items = bytes.as_list().unwrap();
    let collected: Vec<i64> = items.iter().map(|v| v.as_int().unwrap()).collect();
    assert_eq!(collected, vec![72, 101, 108, 108, 111]);

    assert_eq!(run_ok("(cast :str {72 101 108 108 111})").as_string().unwrap(), "Hello");
    // Embedded strings concatenate; integers reduce mod 256.
    assert_eq!(run_ok("(cast :str {\"He\" 108 \"lo\"})").as_string().unwrap(), "Hello");
    assert_eq!(run_ok("(cast :str {328})").as_string().unwrap(), "H");
}

#[test]
fn incompatible_casts_raise() {
    assert!(matches!(run("(cast :int \"nope\")"), Err(EvalError::Unhandled(_))));
    assert!(matches!(run("(cast :rune -1)"), Err(EvalError::Unhandled(_))));
}

#[test]
fn at_reads_and_writes_object_storage() {
    assert_eq!(run_ok("[ (at 7 \"stored\") (at 7) ]").as_string().unwrap(), "stored");
    assert_eq!(run_ok("(at 12345)").tag(), ValueTag::None);
    assert_eq!(run_ok("[ (at 1 2) ]").tag(), ValueTag::None);
}

#[test]
fn apply_spreads_a_brace_list() {
    assert_eq!(run_int("[ (def pick (fn (a :int b :int) :int [ b ])) (apply pick {1 2}) ]"), 2);
    assert!(matches!(run("(apply 5 {1})"), Err(EvalError::Unhandled(_))));
}

#[test]
fn eval_runs_in_the_current_scope() {
    assert_eq!(run_int("(eval \"42\")"), 42);
    assert_eq!(run_int("[ (eval \"(def z 9)\") z ]"), 9);
    assert_eq!(run_int("[ (def x 4) (eval \"x\") ]"), 4);
    // Malformed source raises rather than killing the session.
    assert_eq!(run_int("(try (eval \"(unclosed\") 8)"), 8);
}

#[test]
fn eval_source_is_equivalent_to_direct_evaluation() {
    let program = "(eq {1 2} {1 2})";
    let direct = run_ok(program);
    let quoted = run_ok(&format!("(eval \"{}\")", program.replace('"', "\\\"")));
    assert!(direct.structural_eq(&quoted));
}

#[test]
fn error_values_flow_until_raised() {
    // An ERROR literal is plain data: it can be bound and compared.
    assert_eq!(run_int("[ (def e @(\"x\")) (eq e e) ]"), 1);
}

#[test]
fn export_outside_module_is_fatal() {
    assert!(matches!(run("(export x 1)"), Err(EvalError::ExportOutsideModule)));
}

#[test]
fn recursion_is_bounded() {
    let result = run("[ (def f (fn () :int [ (f) ])) (f) ]");
    assert!(matches!(result, Err(EvalError::RecursionLimit(_))));
}
