/// Exception-system behaviour: matching through the class hierarchy,
/// finally on every exit path, trace capture and preservation, and the
/// split between catchable runtime exceptions and fatal VM errors.

use prism::vm::run_source;
use prism::VmConfig;

fn run(src: &str) -> String {
    run_source(src, VmConfig::default()).unwrap_or_else(|e| panic!("run failed: {}\nsource:\n{}", e, src))
}

fn run_err(src: &str) -> String {
    run_source(src, VmConfig::default()).expect_err("expected an error")
}

#[test]
fn catch_binds_the_exception_object() {
    let src = r#"
        try { throw new Exception("boom"); }
        catch (Exception $e) { echo "got:" + $e->getMessage(); }
    "#;
    assert_eq!(run(src), "got:boom\n");
}

#[test]
fn derived_exception_matches_base_catch() {
    let src = r#"
        class AppError extends Exception {}
        try { throw new AppError("specific"); }
        catch (Exception $e) { echo "base caught " + $e->getMessage(); }
    "#;
    assert_eq!(run(src), "base caught specific\n");
}

#[test]
fn base_exception_does_not_match_derived_catch() {
    let src = r#"
        class AppError extends Exception {}
        try {
            try { throw new Exception("generic"); }
            catch (AppError $e) { echo "wrong"; }
        } catch (Exception $e) { echo "outer"; }
    "#;
    assert_eq!(run(src), "outer\n");
}

#[test]
fn first_matching_catch_wins() {
    let src = r#"
        class AppError extends Exception {}
        try { throw new AppError("x"); }
        catch (AppError $e) { echo "derived"; }
        catch (Exception $e) { echo "base"; }
    "#;
    assert_eq!(run(src), "derived\n");
}

#[test]
fn finally_runs_on_fall_through() {
    let src = r#"
        try { echo "body|"; } finally { echo "fin"; }
    "#;
    assert_eq!(run(src), "body|fin\n");
}

#[test]
fn finally_runs_on_throw_path_then_rethrows() {
    let src = r#"
        try {
            try { throw new Exception("up"); } finally { echo "inner-fin|"; }
        } catch (Exception $e) { echo "caught " + $e->getMessage(); }
    "#;
    assert_eq!(run(src), "inner-fin|caught up\n");
}

#[test]
fn finally_runs_when_catch_body_throws() {
    let src = r#"
        try {
            try { throw new Exception("first"); }
            catch (Exception $e) { throw new Exception("second"); }
            finally { echo "fin|"; }
        } catch (Exception $e) { echo $e->getMessage(); }
    "#;
    assert_eq!(run(src), "fin|second\n");
}

#[test]
fn finally_runs_on_return_and_break_and_continue() {
    let src = r#"
        function f(): int {
            try { return 5; } finally { echo "R"; }
        }
        echo f();
        for (int $i = 0; $i < 3; $i++) {
            try {
                if ($i == 1) { continue; }
                if ($i == 2) { break; }
            } finally { echo "L"; }
        }
    "#;
    assert_eq!(run(src), "R5LLL\n");
}

#[test]
fn unwinding_crosses_frames() {
    let src = r#"
        function deep(int $n): int {
            if ($n == 0) { throw new Exception("bottom"); }
            return deep($n - 1);
        }
        try { deep(5); } catch (Exception $e) { echo "caught " + $e->getMessage(); }
    "#;
    assert_eq!(run(src), "caught bottom\n");
}

#[test]
fn trace_names_the_frames() {
    let src = r#"
        function inner(): int { throw new Exception("t"); }
        function middle(): int { $r := inner(); return $r; }
        try { middle(); }
        catch (Exception $e) {
            $t := $e->getTrace();
            echo $t->length() >= 3 ? "full" : "partial";
        }
    "#;
    assert_eq!(run(src), "full\n");
}

#[test]
fn rethrow_keeps_original_trace() {
    let src = r#"
        function thrower(): int { throw new Exception("orig"); }
        function relay(): int {
            try { return thrower(); }
            catch (Exception $e) { throw $e; }
        }
        try { relay(); }
        catch (Exception $e) {
            // The trace was captured at the original throw, inside thrower.
            $t := $e->getTrace();
            echo $t->length() >= 3 ? "original" : "rewritten";
        }
    "#;
    assert_eq!(run(src), "original\n");
}

#[test]
fn runtime_kinds_are_catchable_by_name() {
    let src = r#"
        try { echo 1 / 0; } catch (DivideByZero $e) { echo "dz|"; }
        $a := [1];
        try { echo $a[-1]; } catch (ArrayIndexOutOfBounds $e) { echo "oob|"; }
        try { $x := "nope" as int; echo $x; } catch (InvalidCast $e) { echo "cast"; }
    "#;
    assert_eq!(run(src), "dz|oob|cast\n");
}

#[test]
fn runtime_kinds_are_catchable_as_base_exception() {
    let src = r#"
        try { echo 1 / 0; } catch (Exception $e) { echo "as base"; }
    "#;
    assert_eq!(run(src), "as base\n");
}

#[test]
fn uncaught_exception_terminates_with_trace() {
    let err = run_err(r#"function f(): int { throw new Exception("done for"); } f();"#);
    assert!(err.contains("done for"), "got: {}", err);
    assert!(err.contains("f"), "got: {}", err);
}

#[test]
fn fatal_stack_overflow_is_never_caught() {
    let src = r#"
        function r(): int { return 1 + r(); }
        try { r(); } catch (Exception $e) { echo "caught"; }
    "#;
    let err = run_err(src);
    assert!(err.contains("stack overflow"), "got: {}", err);
}

#[test]
fn fatal_instruction_cap_is_never_caught() {
    let mut config = VmConfig::default();
    config.instruction_cap = 5_000;
    let err = run_source(
        r#"try { while (true) { } } catch (Exception $e) { echo "caught"; }"#,
        config,
    )
    .expect_err("cap must abort");
    assert!(err.contains("instruction cap"), "got: {}", err);
}

#[test]
fn null_reference_on_member_of_null() {
    let src = r#"
        class Box { public int $v = 1; }
        function f(?Box $b): int {
            if ($b != null) { return $b->v; }
            // Force the runtime path through a cast that strips nothing.
            $o := $b as? Box;
            if ($o != null) { return 99; }
            throw new NullReference("empty box");
        }
        try { f(null); } catch (NullReference $e) { echo $e->getMessage(); }
    "#;
    assert_eq!(run(src), "empty box\n");
}
