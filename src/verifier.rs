/// Bytecode verifier.
///
/// Walks a function's code once with a work-list, simulating abstract
/// operand-stack depth. Every path into an instruction must agree on depth,
/// jump targets must land inside the chunk on instruction boundaries,
/// operand indices must be in range, and no path may fall off the end of
/// the chunk. Exception handlers are seeded from the region table: a catch
/// entry starts at its region's entry depth plus the pushed exception, a
/// finally pad at the entry depth itself. Chunks loaded from a bytecode
/// image are not executable until they pass this check.

use crate::bytecode::{Chunk, Function, Op};
use crate::errors::VerifyError;

/// Net or branching stack effect of one instruction.
enum Flow {
    /// Continue to pc+1 with a depth delta (pops, pushes).
    Next(isize),
    /// Conditional branch: pops, then both successors.
    Branch { pops: isize, target: usize },
    /// Unconditional jump.
    Goto(usize),
    /// IterNext: fallthrough pushes 2, branch target keeps depth.
    IterSplit { target: usize },
    /// Leaves the function; requires at least `needs` values.
    Exit { needs: usize },
}

pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    if func.native.is_some() {
        return Ok(());
    }
    verify_chunk(&func.name, &func.chunk, func.locals as usize)
}

pub fn verify_program(functions: &[Function]) -> Result<(), VerifyError> {
    for f in functions {
        verify_function(f)?;
    }
    Ok(())
}

fn verify_chunk(name: &str, chunk: &Chunk, locals: usize) -> Result<(), VerifyError> {
    let len = chunk.code.len();
    if len == 0 {
        return Err(VerifyError::MissingReturn { func: name.to_string() });
    }

    for (i, r) in chunk.regions.iter().enumerate() {
        if r.start as usize > r.end as usize || r.end as usize > len {
            return Err(VerifyError::BadRegion { func: name.to_string(), region: i });
        }
        for (_, handler) in &r.catches {
            if *handler as usize >= len {
                return Err(VerifyError::BadRegion { func: name.to_string(), region: i });
            }
        }
        if let Some(f) = r.finally {
            if f as usize >= len {
                return Err(VerifyError::BadRegion { func: name.to_string(), region: i });
            }
        }
    }

    let mut depths: Vec<Option<usize>> = vec![None; len];
    let mut work: Vec<(usize, usize)> = vec![(0, 0)];

    let mut visit = |work: &mut Vec<(usize, usize)>,
                     depths: &mut Vec<Option<usize>>,
                     at: usize,
                     pc: usize,
                     depth: usize|
     -> Result<(), VerifyError> {
        if pc >= len {
            return Err(VerifyError::JumpOutOfBounds { func: name.to_string(), at, target: pc as isize });
        }
        match depths[pc] {
            None => {
                depths[pc] = Some(depth);
                work.push((pc, depth));
                Ok(())
            }
            Some(existing) if existing == depth => Ok(()),
            Some(existing) => Err(VerifyError::DepthMismatch {
                func: name.to_string(),
                at: pc,
                first: existing,
                second: depth,
            }),
        }
    };

    depths[0] = Some(0);

    while let Some((pc, depth)) = work.pop() {
        let op = &chunk.code[pc];
        check_operands(name, chunk, locals, pc, op)?;

        // Entering a try seeds its handlers with the entry depth.
        if let Op::EnterTry(r) = op {
            let region = &chunk.regions[*r as usize];
            for (_, handler) in &region.catches {
                visit(&mut work, &mut depths, pc, *handler as usize, depth + 1)?;
            }
            if let Some(pad) = region.finally {
                visit(&mut work, &mut depths, pc, pad as usize, depth)?;
            }
        }

        let flow = flow_of(op, pc);
        match flow {
            Flow::Next(delta) => {
                let next_depth = apply(name, pc, depth, delta)?;
                if pc + 1 >= len {
                    return Err(VerifyError::MissingReturn { func: name.to_string() });
                }
                visit(&mut work, &mut depths, pc, pc + 1, next_depth)?;
            }
            Flow::Branch { pops, target } => {
                let next_depth = apply(name, pc, depth, pops)?;
                visit(&mut work, &mut depths, pc, target, next_depth)?;
                if pc + 1 >= len {
                    return Err(VerifyError::MissingReturn { func: name.to_string() });
                }
                visit(&mut work, &mut depths, pc, pc + 1, next_depth)?;
            }
            Flow::Goto(target) => {
                visit(&mut work, &mut depths, pc, target, depth)?;
            }
            Flow::IterSplit { target } => {
                if depth == 0 {
                    return Err(VerifyError::StackUnderflow { func: name.to_string(), at: pc });
                }
                visit(&mut work, &mut depths, pc, target, depth)?;
                if pc + 1 >= len {
                    return Err(VerifyError::MissingReturn { func: name.to_string() });
                }
                visit(&mut work, &mut depths, pc, pc + 1, depth + 2)?;
            }
            Flow::Exit { needs } => {
                if depth < needs {
                    return Err(VerifyError::StackUnderflow { func: name.to_string(), at: pc });
                }
            }
        }
    }

    Ok(())
}

fn apply(name: &str, pc: usize, depth: usize, delta: isize) -> Result<usize, VerifyError> {
    let next = depth as isize + delta;
    if next < 0 {
        return Err(VerifyError::StackUnderflow { func: name.to_string(), at: pc });
    }
    Ok(next as usize)
}

fn flow_of(op: &Op, pc: usize) -> Flow {
    use Op::*;
    match op {
        Push(_) | Dup | LoadLocal(_) | LoadGlobal(_) | LoadUpval(_) | NewObject(_)
        | GetStatic { .. } | MakeClosure { .. } => Flow::Next(1),
        Pop | StoreLocal(_) | StoreGlobal(_) | StoreUpval(_) | Echo | SetStatic { .. } => Flow::Next(-1),
        Swap | Neg | Not | BitNot | Inc | Dec | ToStr | GetField(_) | IterNew | EnterTry(_)
        | LeaveTry | EnterCatch(_) | EnterFinally | EndFinally | CheckType(_) | Cast(_)
        | CastSafe(_) | Nop => Flow::Next(0),
        Add | Sub | Mul | Div | Mod | Concat | BitAnd | BitOr | BitXor | Shl | Shr | Eq | Ne
        | Lt | Le | Gt | Ge | ArrayGet | MapGet | SuperGet => Flow::Next(-1),
        SetField(_) => Flow::Next(-2),
        ArraySet | MapSet | SuperSet => Flow::Next(-3),
        NewArray(n) => Flow::Next(1 - *n as isize),
        NewMap(n) | NewSuperArray(n) => Flow::Next(1 - 2 * *n as isize),
        Jump(off) => Flow::Goto(pc + 1 + *off as usize),
        JumpIfFalse(off) => Flow::Branch { pops: -1, target: pc + 1 + *off as usize },
        Loop(off) => Flow::Goto(pc + 1 - *off as usize),
        Call(argc) => Flow::Next(-(*argc as isize)),
        CallN { argc, rets } => Flow::Next(*rets as isize - *argc as isize - 1),
        CallMethod { argc, .. } => Flow::Next(-(*argc as isize)),
        CallStatic { argc, .. } => Flow::Next(-(*argc as isize)),
        TailCall(argc) => Flow::Exit { needs: *argc as usize + 1 },
        Return(k) => Flow::Exit { needs: *k as usize },
        Throw => Flow::Exit { needs: 1 },
        IterNext(off) => Flow::IterSplit { target: pc + 1 + *off as usize },
    }
}

fn check_operands(name: &str, chunk: &Chunk, locals: usize, pc: usize, op: &Op) -> Result<(), VerifyError> {
    use Op::*;
    let const_ok = |idx: u16| -> Result<(), VerifyError> {
        if idx as usize >= chunk.consts.len() {
            Err(VerifyError::BadConstIndex { func: name.to_string(), at: pc, index: idx as usize })
        } else {
            Ok(())
        }
    };
    let type_ok = |idx: u16| -> Result<(), VerifyError> {
        if idx as usize >= chunk.types.len() {
            Err(VerifyError::BadConstIndex { func: name.to_string(), at: pc, index: idx as usize })
        } else {
            Ok(())
        }
    };
    let local_ok = |slot: u16| -> Result<(), VerifyError> {
        if slot as usize >= locals {
            Err(VerifyError::BadLocalSlot { func: name.to_string(), at: pc, slot: slot as usize })
        } else {
            Ok(())
        }
    };
    let jump_ok = |target: isize| -> Result<(), VerifyError> {
        if target < 0 || target as usize > chunk.code.len() {
            Err(VerifyError::JumpOutOfBounds { func: name.to_string(), at: pc, target })
        } else {
            Ok(())
        }
    };

    match op {
        Push(i) => const_ok(*i),
        LoadLocal(s) | StoreLocal(s) => local_ok(*s),
        LoadGlobal(i) | StoreGlobal(i) | GetField(i) | SetField(i) | NewObject(i) => const_ok(*i),
        GetStatic { class, name: n } | SetStatic { class, name: n } => {
            const_ok(*class)?;
            const_ok(*n)
        }
        CallMethod { name: n, .. } => const_ok(*n),
        CallStatic { class, name: n, .. } => {
            const_ok(*class)?;
            const_ok(*n)
        }
        CheckType(i) | Cast(i) | CastSafe(i) => type_ok(*i),
        Jump(off) | JumpIfFalse(off) | IterNext(off) => jump_ok(pc as isize + 1 + *off as isize),
        Loop(off) => jump_ok(pc as isize + 1 - *off as isize),
        EnterTry(r) | EnterCatch(r) => {
            if *r as usize >= chunk.regions.len() {
                Err(VerifyError::BadRegion { func: name.to_string(), region: *r as usize })
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Const, Function};
    use crate::parser::parse_source;

    fn func(code: Vec<Op>, consts: Vec<Const>, locals: u16) -> Function {
        let mut f = Function { name: "t".into(), locals, ..Function::default() };
        for op in code {
            f.chunk.emit(op, 1);
        }
        f.chunk.consts = consts;
        f
    }

    #[test]
    fn balanced_function_verifies() {
        let f = func(
            vec![Op::Push(0), Op::Push(0), Op::Add, Op::Return(1)],
            vec![Const::Int(1)],
            1,
        );
        assert!(verify_function(&f).is_ok());
    }

    #[test]
    fn stack_underflow_detected() {
        let f = func(vec![Op::Pop, Op::Return(0)], vec![], 1);
        assert!(matches!(verify_function(&f), Err(VerifyError::StackUnderflow { .. })));
    }

    #[test]
    fn depth_mismatch_detected() {
        // One path pushes before the join, the other does not.
        let f = func(
            vec![
                Op::Push(0),        // 0: cond
                Op::JumpIfFalse(1), // 1: -> 3
                Op::Push(0),        // 2: depth 1 at join
                Op::Return(1),      // 3: join — depth 0 vs 1
            ],
            vec![Const::Bool(true)],
            1,
        );
        assert!(matches!(verify_function(&f), Err(VerifyError::DepthMismatch { .. })));
    }

    #[test]
    fn jump_out_of_bounds_detected() {
        let f = func(vec![Op::Jump(99), Op::Return(0)], vec![], 1);
        assert!(matches!(verify_function(&f), Err(VerifyError::JumpOutOfBounds { .. })));
    }

    #[test]
    fn bad_const_index_detected() {
        let f = func(vec![Op::Push(7), Op::Return(0)], vec![], 1);
        assert!(matches!(verify_function(&f), Err(VerifyError::BadConstIndex { .. })));
    }

    #[test]
    fn bad_local_slot_detected() {
        let f = func(vec![Op::LoadLocal(9), Op::Return(1)], vec![], 1);
        assert!(matches!(verify_function(&f), Err(VerifyError::BadLocalSlot { .. })));
    }

    #[test]
    fn missing_return_detected() {
        let f = func(vec![Op::Push(0)], vec![Const::Int(1)], 1);
        assert!(matches!(verify_function(&f), Err(VerifyError::MissingReturn { .. })));
    }

    #[test]
    fn every_compiled_function_verifies() {
        let srcs = [
            "echo 1 + 2;",
            "int $s = 0; for (int $i = 0; $i < 10; $i++) { $s = $s + $i; } echo $s;",
            "function fib(int $n): int { if ($n < 2) { return $n; } return fib($n - 1) + fib($n - 2); } echo fib(10);",
            r#"try { throw new Exception("x"); } catch (Exception $e) { echo $e->getMessage(); } finally { echo "|end"; }"#,
            r#"$a := [1,2,3]; foreach ($a as $k => $v) { echo $k; echo $v; }"#,
            r#"$m := match (3) { 1 => "a", 2 => "b", _ => "c" }; echo $m;"#,
            r#"
            class Counter {
                private int $n = 0;
                public function bump(): int { $this->n = $this->n + 1; return $this->n; }
            }
            $c := new Counter();
            echo $c->bump();
            "#,
            r#"
            function divmod(int $a, int $b): (int, int) { return $a / $b, $a % $b; }
            int $q, int $r = divmod(7, 2);
            echo $q; echo $r;
            "#,
            r#"
            int $outer = 10;
            $f := function (int $x) use ($outer): int { return $x + $outer; };
            echo $f(5);
            "#,
            r#"
            switch (2) {
                case 1: echo "one"; break;
                case 2, 3: echo "few"; break;
                default: echo "many";
            }
            "#,
        ];
        for src in srcs {
            let (file, lex, parse) = parse_source(src, 0);
            assert!(lex.is_empty() && parse.is_empty(), "front-end errors in {:?}", src);
            let program = crate::compiler::compile(&[file]).expect("compiles");
            for f in &program.functions {
                verify_function(f).unwrap_or_else(|e| {
                    panic!("verify failed for '{}' in {:?}: {}\n{}", f.name, src, e, f.chunk.disassemble(&f.name))
                });
            }
        }
    }
}
