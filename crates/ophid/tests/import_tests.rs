//! Imports: exports, caching, cycles, and the one-shot lock.

use std::fs;

use ophid::{Checker, EvalError, Evaluator, KernelManager, SourcePaths, SymbolTable, ValueTag, parse};

fn workspace() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

fn write(dir: &tempfile::TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

fn evaluator(dir: &tempfile::TempDir) -> Evaluator {
    Evaluator::new(SourcePaths::new(dir.path()))
}

#[test]
fn value_exports_are_visible_under_the_prefix() {
    let dir = workspace();
    write(&dir, "lib.sxs", "[ (export answer 42) (export greeting \"hey\") ]");

    let mut ev = evaluator(&dir);
    let v = ev.eval_source("[ #(import m \"lib.sxs\") m/answer ]").unwrap();
    assert_eq!(v.as_int().unwrap(), 42);
    let v = ev.eval_source("m/greeting").unwrap();
    assert_eq!(v.as_string().unwrap(), "hey");
}

#[test]
fn lambda_exports_stay_callable() {
    let dir = workspace();
    write(&dir, "lib.sxs", "[ (def pick (fn (a :int b :int) :int [ b ])) (export second pick) ]");

    let mut ev = evaluator(&dir);
    let v = ev.eval_source("[ #(import m \"lib.sxs\") (m/second 1 9) ]").unwrap();
    assert_eq!(v.as_int().unwrap(), 9);
}

#[test]
fn module_internals_do_not_leak() {
    let dir = workspace();
    write(&dir, "lib.sxs", "[ (def hidden 5) (export shown 1) ]");

    let mut ev = evaluator(&dir);
    let v = ev.eval_source("[ #(import m \"lib.sxs\") m/hidden ]").unwrap();
    // Unexported names stay bare symbols on the importer side.
    assert_eq!(v.tag(), ValueTag::Symbol);
}

#[test]
fn imports_chain_through_modules() {
    let dir = workspace();
    write(&dir, "inner.sxs", "(export base 7)");
    write(&dir, "outer.sxs", "[ #(import i \"inner.sxs\") (export forwarded i/base) ]");

    let mut ev = evaluator(&dir);
    let v = ev.eval_source("[ #(import o \"outer.sxs\") o/forwarded ]").unwrap();
    assert_eq!(v.as_int().unwrap(), 7);
}

#[test]
fn import_cycles_fail_to_import() {
    let dir = workspace();
    write(&dir, "a.sxs", "[ #(import b \"b.sxs\") (export from-a 1) ]");
    write(&dir, "b.sxs", "[ #(import a \"a.sxs\") (export from-b 2) ]");

    let mut ev = evaluator(&dir);
    let err = ev.eval_source("#(import a \"a.sxs\")").unwrap_err();
    assert!(err.to_string().contains("failed to import"), "got: {err}");
}

#[test]
fn missing_modules_fail_to_import() {
    let dir = workspace();
    let mut ev = evaluator(&dir);
    let err = ev.eval_source("#(import m \"missing.sxs\")").unwrap_err();
    assert!(err.to_string().contains("failed to import"));
}

#[test]
fn imports_lock_after_the_first_instruction() {
    let dir = workspace();
    write(&dir, "lib.sxs", "(export answer 42)");

    let mut ev = evaluator(&dir);
    let err = ev
        .eval_source("[ (eq 1 1) #(import m \"lib.sxs\") ]")
        .unwrap_err();
    assert!(matches!(err, EvalError::ImportAfterLock(_)));

    // Imports before any other instruction are fine, in any number.
    write(&dir, "lib2.sxs", "(export other 1)");
    let mut ev = evaluator(&dir);
    let v = ev
        .eval_source("[ #(import m \"lib.sxs\") #(import n \"lib2.sxs\") (eq m/answer 42) ]")
        .unwrap();
    assert_eq!(v.as_int().unwrap(), 1);
}

#[test]
fn loaded_modules_are_cached() {
    let dir = workspace();
    write(&dir, "lib.sxs", "(export answer 42)");

    let mut ev = evaluator(&dir);
    ev.eval_source("#(import m \"lib.sxs\")").unwrap();
    // Re-importing after the file changed serves the cached module:
    // module initialization runs once per context.
    write(&dir, "lib.sxs", "(export answer 0)");
    let v = ev.eval_source("[ #(import n \"lib.sxs\") n/answer ]").unwrap();
    assert_eq!(v.as_int().unwrap(), 42);
}

#[test]
fn failing_modules_fail_the_import() {
    let dir = workspace();
    write(&dir, "bad.sxs", "(assert 0 \"module init failed\")");

    let mut ev = evaluator(&dir);
    let err = ev.eval_source("#(import m \"bad.sxs\")").unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("failed to import"));
    assert!(rendered.contains("module init failed"));
}

#[test]
fn checker_follows_imports() {
    let dir = workspace();
    write(&dir, "lib.sxs", "[ (def pick (fn (a :int b :int) :int [ b ])) (export second pick) (export answer 42) ]");

    let paths = SourcePaths::new(dir.path());
    let symbols = SymbolTable::new();
    let kernels = std::sync::Arc::new(KernelManager::new(paths.clone()));

    let source = "[ #(import m \"lib.sxs\") (m/second 1 m/answer) ]";
    let parsed = parse(source, &symbols).unwrap();
    let mut checker = Checker::new(symbols.clone(), kernels.clone(), paths.clone());
    let found = checker.check(&parsed, source).unwrap();
    assert_eq!(found.base, ValueTag::Integer);

    let bad = "[ #(import m \"lib.sxs\") (m/second 1 \"no\") ]";
    let parsed = parse(bad, &symbols).unwrap();
    let mut checker = Checker::new(symbols, kernels, paths);
    let err = checker.check(&parsed, bad).unwrap_err();
    assert!(err.message.contains("argument 1"));
}

#[test]
fn checker_detects_import_cycles() {
    let dir = workspace();
    write(&dir, "a.sxs", "[ #(import b \"b.sxs\") (export from-a 1) ]");
    write(&dir, "b.sxs", "[ #(import a \"a.sxs\") (export from-b 2) ]");

    let paths = SourcePaths::new(dir.path());
    let symbols = SymbolTable::new();
    let kernels = std::sync::Arc::new(KernelManager::new(paths.clone()));

    let source = "#(import a \"a.sxs\")";
    let parsed = parse(source, &symbols).unwrap();
    let mut checker = Checker::new(symbols, kernels, paths);
    let err = checker.check(&parsed, source).unwrap_err();
    assert!(err.message.contains("failed to import"));
}
