//! Dynamic check sequences.
//!
//! Every checked operation is a forward branch to a named error stub the
//! runtime links in; control never falls through a failed check. The stubs
//! take no arguments and terminate the process with a distinguished exit
//! code, so the generated code only has to reach them.

use super::instr::{Arg, Instr, Reg};
use super::value::Ty;

/// The runtime error taxonomy. One stub per variant; adding a check means
/// adding a stub here and in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeError {
    NonNumber,
    NonBool,
    NonTuple,
    NonClosure,
    Overflow,
    IndexLow,
    IndexHigh,
    Arity,
}

impl RuntimeError {
    /// Label of the runtime stub for this error.
    pub fn stub(self) -> &'static str {
        match self {
            RuntimeError::NonNumber => "error_non_number",
            RuntimeError::NonBool => "error_non_boolean",
            RuntimeError::NonTuple => "error_non_tuple",
            RuntimeError::NonClosure => "error_non_closure",
            RuntimeError::Overflow => "error_arith_overflow",
            RuntimeError::IndexLow => "error_index_low",
            RuntimeError::IndexHigh => "error_index_high",
            RuntimeError::Arity => "error_arity",
        }
    }

    fn for_ty(ty: Ty) -> RuntimeError {
        match ty {
            Ty::Number => RuntimeError::NonNumber,
            Ty::Bool => RuntimeError::NonBool,
            Ty::Tuple => RuntimeError::NonTuple,
            Ty::Closure => RuntimeError::NonClosure,
        }
    }
}

/// Load `value` into `eax` and leave the flags holding the result of its
/// type test: ZF set iff the value carries `ty`'s tag. `ebx` is clobbered,
/// `eax` still holds the value afterwards.
pub(crate) fn type_test(value: &Arg, ty: Ty) -> Vec<Instr> {
    vec![
        Instr::Mov(Arg::Reg(Reg::Eax), value.clone()),
        Instr::Mov(Arg::Reg(Reg::Ebx), Arg::Reg(Reg::Eax)),
        Instr::And(Arg::Reg(Reg::Ebx), Arg::HexConst(ty.mask())),
        Instr::Cmp(Arg::Reg(Reg::Ebx), Arg::HexConst(ty.tag())),
    ]
}

/// Trap to the matching type-error stub unless `value` carries `ty`'s tag.
pub fn assert_type(value: &Arg, ty: Ty) -> Vec<Instr> {
    let mut out = type_test(value, ty);
    out.push(Instr::Jne(RuntimeError::for_ty(ty).stub().to_string()));
    out
}

/// Range-check an index against a tuple's size header.
///
/// The lower bound decodes the index and compares against zero. The upper
/// bound compares the still-encoded index against the encoded size word, so
/// nothing needs re-encoding; an index equal to the size is out of range.
pub fn assert_bounds(tuple: &Arg, index: &Arg) -> Vec<Instr> {
    vec![
        Instr::Mov(Arg::Reg(Reg::Eax), index.clone()),
        Instr::Sar(Arg::Reg(Reg::Eax), Arg::Const(1)),
        Instr::Cmp(Arg::Reg(Reg::Eax), Arg::Const(0)),
        Instr::Jl(RuntimeError::IndexLow.stub().to_string()),
        Instr::Mov(Arg::Reg(Reg::Eax), index.clone()),
        Instr::Mov(Arg::Reg(Reg::Ebx), tuple.clone()),
        Instr::Sub(Arg::Reg(Reg::Ebx), Arg::Const(Ty::Tuple.tag() as i32)),
        Instr::Cmp(Arg::Reg(Reg::Eax), Arg::RegOffset(Reg::Ebx, 0)),
        Instr::Jge(RuntimeError::IndexHigh.stub().to_string()),
    ]
}

/// Trap to the arity stub unless the closure's header equals `arity`.
/// `closure` must already have passed the closure type check.
pub fn assert_arity(closure: &Arg, arity: usize) -> Vec<Instr> {
    vec![
        Instr::Mov(Arg::Reg(Reg::Eax), closure.clone()),
        Instr::Sub(Arg::Reg(Reg::Eax), Arg::Const(Ty::Closure.tag() as i32)),
        Instr::Mov(Arg::Reg(Reg::Eax), Arg::RegOffset(Reg::Eax, 0)),
        Instr::Cmp(Arg::Reg(Reg::Eax), Arg::Const(arity as i32)),
        Instr::Jne(RuntimeError::Arity.stub().to_string()),
    ]
}
