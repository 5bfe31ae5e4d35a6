//! The recursive expression compiler.
//!
//! `compile_expr` walks the ANF tree with an accumulator discipline: every
//! expression leaves its value in `eax`, `ebx` is scratch, and let-bound
//! intermediates live in frame slots handed out by [`CodegenEnv`]. Function
//! bodies are emitted out of line, guarded by a jump, and followed by the
//! closure allocation that captures the enclosing frame's free variables.

use thiserror::Error;

use crate::ast::{Expr, Prim1, Prim2, Span};

use super::analysis::{count_vars, free_vars};
use super::asserts::{self, RuntimeError};
use super::env::{slot_arg, CodegenEnv};
use super::heap;
use super::instr::{Arg, Instr, Reg};
use super::value::{repr_bool, repr_int, Ty, BOOL_FALSE};

/// Emit-time failures. Both variants are upstream bugs (the scope checker
/// and normalizer should make them unreachable), reported with the span of
/// the offending node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("unbound variable `{name}` at {span}")]
    UnboundVariable { name: String, span: Span },
    #[error("expected an immediate expression at {span}")]
    NotImmediate { span: Span },
}

/// Compile the program body. The caller wraps the result with [`wrap`]
/// using the tree's [`count_vars`] as the local count.
pub fn compile(prog: &Expr) -> Result<Vec<Instr>, CompileError> {
    compile_expr(&CodegenEnv::new(), prog)
}

/// Function prologue and epilogue around a body stream. `locals` is the
/// number of frame slots the body may touch; the prologue also realigns
/// the stack to 16 bytes for the benefit of C-ABI callees.
pub fn wrap(locals: usize, body: Vec<Instr>) -> Vec<Instr> {
    let mut out = vec![
        Instr::Push(Arg::Reg(Reg::Ebp)),
        Instr::Mov(Arg::Reg(Reg::Ebp), Arg::Reg(Reg::Esp)),
        Instr::Sub(Arg::Reg(Reg::Esp), Arg::Const(4 * locals as i32)),
        Instr::And(Arg::Reg(Reg::Esp), Arg::HexConst(0xFFFF_FFF0)),
    ];
    out.extend(body);
    out.push(Instr::Mov(Arg::Reg(Reg::Esp), Arg::Reg(Reg::Ebp)));
    out.push(Instr::Pop(Arg::Reg(Reg::Ebp)));
    out.push(Instr::Ret);
    out
}

/// Operand for an immediate expression: literals become constants,
/// identifiers become their frame slot.
fn imm_arg(env: &CodegenEnv, expr: &Expr) -> Result<Arg, CompileError> {
    match expr {
        Expr::Number { value, .. } => Ok(Arg::Const(repr_int(*value))),
        Expr::Bool { value, .. } => Ok(Arg::HexConst(repr_bool(*value))),
        Expr::Id { name, tag } => lookup_slot(env, name, tag.span),
        _ => Err(CompileError::NotImmediate { span: expr.span() }),
    }
}

fn lookup_slot(env: &CodegenEnv, name: &str, span: Span) -> Result<Arg, CompileError> {
    env.lookup(name).map(slot_arg).ok_or_else(|| {
        CompileError::UnboundVariable {
            name: name.to_string(),
            span,
        }
    })
}

fn if_true_label(tag: u32) -> String {
    format!("if_true_{}", tag)
}

fn if_done_label(tag: u32) -> String {
    format!("if_done_{}", tag)
}

pub fn compile_expr(env: &CodegenEnv, expr: &Expr) -> Result<Vec<Instr>, CompileError> {
    match expr {
        Expr::Number { .. } | Expr::Bool { .. } | Expr::Id { .. } => {
            let arg = imm_arg(env, expr)?;
            Ok(vec![Instr::Mov(Arg::Reg(Reg::Eax), arg)])
        }

        Expr::Let { .. } => compile_let(env, expr),

        Expr::If { cond, then_branch, else_branch, tag } => {
            let test = imm_arg(env, cond)?;
            let mut out = asserts::assert_type(&test, Ty::Bool);
            // `je` over false lands on the block holding the then-arm, so
            // the then-arm runs exactly when the test is false; a true test
            // falls through into the else-arm.
            out.push(Instr::Cmp(Arg::Reg(Reg::Eax), Arg::HexConst(BOOL_FALSE)));
            out.push(Instr::Je(if_true_label(tag.id)));
            out.extend(compile_expr(env, else_branch)?);
            out.push(Instr::Jmp(if_done_label(tag.id)));
            out.push(Instr::Label(if_true_label(tag.id)));
            out.extend(compile_expr(env, then_branch)?);
            out.push(Instr::Label(if_done_label(tag.id)));
            Ok(out)
        }

        Expr::Prim1 { op, arg, tag } => {
            let v = imm_arg(env, arg)?;
            match op {
                Prim1::Add1 => Ok(compile_arith(v, Arg::Const(repr_int(1)), Prim2::Plus)),
                Prim1::Sub1 => Ok(compile_arith(v, Arg::Const(repr_int(1)), Prim2::Minus)),
                Prim1::IsNum => Ok(compile_is_type(tag.id, v, Ty::Number)),
                Prim1::IsBool => Ok(compile_is_type(tag.id, v, Ty::Bool)),
                Prim1::Print => Ok(vec![
                    Instr::Mov(Arg::Reg(Reg::Eax), v),
                    Instr::Push(Arg::Reg(Reg::Eax)),
                    Instr::Call(Arg::Label("print".to_string())),
                    Instr::Add(Arg::Reg(Reg::Esp), Arg::Const(4)),
                ]),
            }
        }

        Expr::Prim2 { op, lhs, rhs, tag } => {
            let a = imm_arg(env, lhs)?;
            let b = imm_arg(env, rhs)?;
            match op {
                Prim2::Plus | Prim2::Minus | Prim2::Times => Ok(compile_arith(a, b, *op)),
                Prim2::Less => Ok(compile_compare(tag.id, a, b, Instr::Jl, true)),
                Prim2::Greater => Ok(compile_compare(tag.id, a, b, Instr::Jg, true)),
                // raw word comparison: distinct kinds have distinct
                // encodings, so cross-type equality is false without a check
                Prim2::Equal => Ok(compile_compare(tag.id, a, b, Instr::Je, false)),
            }
        }

        Expr::Tuple { elems, tag: _ } => {
            let fields = elems
                .iter()
                .map(|e| imm_arg(env, e))
                .collect::<Result<Vec<_>, _>>()?;
            let mut out = heap::tuple_alloc(fields.len());
            out.extend(heap::heap_write(&fields, 1));
            out.extend(heap::add_pad(fields.len() + 1));
            out.extend(heap::set_tag(Reg::Eax, Ty::Tuple));
            Ok(out)
        }

        Expr::GetItem { tuple, index, tag: _ } => {
            let tup = imm_arg(env, tuple)?;
            let idx = imm_arg(env, index)?;
            let mut out = asserts::assert_type(&tup, Ty::Tuple);
            out.extend(asserts::assert_type(&idx, Ty::Number));
            out.extend(asserts::assert_bounds(&tup, &idx));
            out.push(Instr::Mov(Arg::Reg(Reg::Ebx), tup));
            out.push(Instr::Sub(Arg::Reg(Reg::Ebx), Arg::Const(Ty::Tuple.tag() as i32)));
            out.push(Instr::Mov(Arg::Reg(Reg::Eax), idx));
            out.push(Instr::Sar(Arg::Reg(Reg::Eax), Arg::Const(1)));
            // word 0 is the size header
            out.push(Instr::Add(Arg::Reg(Reg::Eax), Arg::Const(1)));
            out.push(Instr::Mov(
                Arg::Reg(Reg::Eax),
                Arg::RegIndex(Reg::Ebx, Reg::Eax),
            ));
            Ok(out)
        }

        Expr::Lam { params, body, tag } => {
            let start = format!("lambda_start_{}", tag.id);
            let end = format!("lambda_end_{}", tag.id);
            compile_lambda(env, expr, None, params, body, &start, &end)
        }

        Expr::Fun { name, params, body, tag } => {
            let start = format!("fun_{}_start_{}", name, tag.id);
            let end = format!("fun_{}_end_{}", name, tag.id);
            compile_lambda(env, expr, Some(name), params, body, &start, &end)
        }

        Expr::App { func, args, tag: _ } => {
            let callee = imm_arg(env, func)?;
            let actuals = args
                .iter()
                .map(|a| imm_arg(env, a))
                .collect::<Result<Vec<_>, _>>()?;
            let mut out = asserts::assert_type(&callee, Ty::Closure);
            out.extend(asserts::assert_arity(&callee, actuals.len()));
            // code address sits behind the arity word
            out.push(Instr::Mov(Arg::Reg(Reg::Eax), callee.clone()));
            out.push(Instr::Sub(Arg::Reg(Reg::Eax), Arg::Const(Ty::Closure.tag() as i32)));
            out.push(Instr::Mov(Arg::Reg(Reg::Eax), Arg::RegOffset(Reg::Eax, 4)));
            for a in actuals.iter().rev() {
                out.push(Instr::Push(a.clone()));
            }
            // self-closure goes on top; the callee prologue reads its
            // captures back out of it
            out.push(Instr::Push(callee));
            out.push(Instr::Call(Arg::Reg(Reg::Eax)));
            out.push(Instr::Add(
                Arg::Reg(Reg::Esp),
                Arg::Const(4 * (actuals.len() as i32 + 1)),
            ));
            Ok(out)
        }
    }
}

/// A right-leaning chain of lets compiles as one frame-slot walk: each rhs
/// is evaluated under the bindings so far, stored, and the environment
/// extended, strictly left to right.
fn compile_let(env: &CodegenEnv, expr: &Expr) -> Result<Vec<Instr>, CompileError> {
    let mut scope = env.clone();
    let mut out = Vec::new();
    let mut cur = expr;
    while let Expr::Let { name, value, body, .. } = cur {
        out.extend(compile_expr(&scope, value)?);
        let (slot, extended) = scope.push(name);
        out.push(Instr::Mov(slot_arg(slot), Arg::Reg(Reg::Eax)));
        scope = extended;
        cur = body;
    }
    out.extend(compile_expr(&scope, cur)?);
    Ok(out)
}

/// Shared arithmetic shape: both operands are checked, the operation runs
/// on `eax`, and overflow traps. `Times` needs a corrective shift because
/// both inputs carry the `<<1` encoding.
fn compile_arith(a: Arg, b: Arg, op: Prim2) -> Vec<Instr> {
    let mut out = asserts::assert_type(&a, Ty::Number);
    out.extend(asserts::assert_type(&b, Ty::Number));
    out.push(Instr::Mov(Arg::Reg(Reg::Eax), a));
    out.push(match op {
        Prim2::Plus => Instr::Add(Arg::Reg(Reg::Eax), b),
        Prim2::Minus => Instr::Sub(Arg::Reg(Reg::Eax), b),
        Prim2::Times => Instr::IMul(Arg::Reg(Reg::Eax), b),
        _ => unreachable!("not an arithmetic operator"),
    });
    out.push(Instr::Jo(RuntimeError::Overflow.stub().to_string()));
    if op == Prim2::Times {
        out.push(Instr::Sar(Arg::Reg(Reg::Eax), Arg::Const(1)));
    }
    out
}

/// Compare `a` against `b` and materialize a boolean from the given
/// conditional jump.
fn compile_compare(
    tag: u32,
    a: Arg,
    b: Arg,
    jump: fn(String) -> Instr,
    numeric: bool,
) -> Vec<Instr> {
    let mut out = Vec::new();
    if numeric {
        out.extend(asserts::assert_type(&a, Ty::Number));
        out.extend(asserts::assert_type(&b, Ty::Number));
    }
    out.push(Instr::Mov(Arg::Reg(Reg::Eax), a));
    out.push(Instr::Cmp(Arg::Reg(Reg::Eax), b));
    out.extend(bool_branch(tag, jump));
    out
}

fn compile_is_type(tag: u32, v: Arg, ty: Ty) -> Vec<Instr> {
    let mut out = asserts::type_test(&v, ty);
    out.extend(bool_branch(tag, Instr::Je));
    out
}

/// Materialize `true`/`false` in `eax` from the flags: the branch skeleton
/// of `If`, with the arms replaced by the two boolean loads.
fn bool_branch(tag: u32, jump: fn(String) -> Instr) -> Vec<Instr> {
    vec![
        jump(if_true_label(tag)),
        Instr::Mov(Arg::Reg(Reg::Eax), Arg::HexConst(repr_bool(false))),
        Instr::Jmp(if_done_label(tag)),
        Instr::Label(if_true_label(tag)),
        Instr::Mov(Arg::Reg(Reg::Eax), Arg::HexConst(repr_bool(true))),
        Instr::Label(if_done_label(tag)),
    ]
}

/// Emit a function: its code out of line behind a guard jump, then the
/// closure record allocation in the enclosing frame.
///
/// Inside the body, parameters sit at slots -3, -4, ... (below the return
/// address and self-closure), the function's own name - when it has one -
/// at slot -2 pointing straight at the self-closure word, and each capture
/// at the positive slot matching its position in sorted free-variable
/// order. The prologue restores captures from the self-closure into those
/// slots before the body runs, mirroring the field order the allocation
/// site wrote them in.
fn compile_lambda(
    env: &CodegenEnv,
    whole: &Expr,
    name: Option<&str>,
    params: &[String],
    body: &Expr,
    start: &str,
    end: &str,
) -> Result<Vec<Instr>, CompileError> {
    let captures = free_vars(whole);
    let arity = params.len();

    let mut slots: Vec<(String, i32)> = Vec::new();
    if let Some(f) = name {
        slots.push((f.to_string(), -2));
    }
    for (j, p) in params.iter().enumerate() {
        slots.push((p.clone(), -(3 + j as i32)));
    }
    for (i, c) in captures.iter().enumerate() {
        slots.push((c.clone(), i as i32 + 1));
    }
    let inner = CodegenEnv::from_slots(slots);
    let locals = captures.len() + count_vars(body);

    let mut inner_body = Vec::new();
    for i in 1..=captures.len() as i32 {
        inner_body.push(Instr::Mov(Arg::Reg(Reg::Ebx), Arg::RegOffset(Reg::Ebp, 8)));
        inner_body.push(Instr::Sub(Arg::Reg(Reg::Ebx), Arg::Const(Ty::Closure.tag() as i32)));
        inner_body.push(Instr::Mov(
            Arg::Reg(Reg::Eax),
            Arg::RegOffset(Reg::Ebx, 4 * (i + 1)),
        ));
        inner_body.push(Instr::Mov(slot_arg(i), Arg::Reg(Reg::Eax)));
    }
    inner_body.extend(compile_expr(&inner, body)?);

    let mut out = vec![Instr::Jmp(end.to_string()), Instr::Label(start.to_string())];
    out.extend(wrap(locals, inner_body));
    out.push(Instr::Label(end.to_string()));

    out.extend(heap::closure_alloc(arity, start, captures.len()));
    let capture_args = captures
        .iter()
        .map(|c| lookup_slot(env, c, whole.span()))
        .collect::<Result<Vec<_>, _>>()?;
    out.extend(heap::heap_write(&capture_args, 2));
    out.extend(heap::add_pad(2 + captures.len()));
    out.extend(heap::set_tag(Reg::Eax, Ty::Closure));
    Ok(out)
}
