//! Bump-allocation sequences for tuples and closures.
//!
//! The allocator state is the single register `esi`, pointing at the next
//! free byte of a runtime-provided region. An allocation copies `esi` into
//! `eax`, writes the header word(s), advances `esi` past the whole record,
//! then fills fields through `eax`. Records are padded to an even number of
//! words so `esi` stays 8-byte aligned and the low three bits of every heap
//! address remain available for tagging.
//!
//! Record layouts:
//!
//! ```text
//! tuple(k):   [ k<<1 | e1 | .. | ek | pad? ]
//! closure(a): [ a | code | cap1 | .. | capm | pad? ]
//! ```
//!
//! The tuple header is the arity stored as an encoded number (so bounds
//! checks compare it against encoded indices directly); the closure header
//! is the raw arity.

use super::instr::{Arg, Instr, Reg};
use super::value::{repr_int, Ty};

/// Round a word count up to the next even number.
pub fn round_to_even(words: usize) -> usize {
    (words + 1) & !1
}

/// Reserve a tuple of `count` fields: `eax` gets the record address, the
/// size header is written, and `esi` moves past the padded record.
pub fn tuple_alloc(count: usize) -> Vec<Instr> {
    vec![
        Instr::Mov(Arg::Reg(Reg::Eax), Arg::Reg(Reg::Esi)),
        Instr::Mov(Arg::RegOffset(Reg::Eax, 0), Arg::Const(repr_int(count as i32))),
        Instr::Add(
            Arg::Reg(Reg::Esi),
            Arg::Const((4 * round_to_even(count + 1)) as i32),
        ),
    ]
}

/// Reserve a closure record: raw arity at word 0, code address at word 1,
/// room for `captures` captured values behind them.
pub fn closure_alloc(arity: usize, code: &str, captures: usize) -> Vec<Instr> {
    vec![
        Instr::Mov(Arg::Reg(Reg::Eax), Arg::Reg(Reg::Esi)),
        Instr::Mov(Arg::RegOffset(Reg::Eax, 0), Arg::Const(arity as i32)),
        Instr::Mov(Arg::RegOffset(Reg::Eax, 4), Arg::Label(code.to_string())),
        Instr::Add(
            Arg::Reg(Reg::Esi),
            Arg::Const((4 * round_to_even(captures + 2)) as i32),
        ),
    ]
}

/// Move each field value through the scratch register into consecutive
/// words of the record at `eax`, starting at word `start`.
pub fn heap_write(fields: &[Arg], start: usize) -> Vec<Instr> {
    let mut out = Vec::with_capacity(fields.len() * 2);
    for (i, field) in fields.iter().enumerate() {
        out.push(Instr::Mov(Arg::Reg(Reg::Ebx), field.clone()));
        out.push(Instr::Mov(
            Arg::RegOffset(Reg::Eax, (4 * (start + i)) as i32),
            Arg::Reg(Reg::Ebx),
        ));
    }
    out
}

/// Zero the pad word of a record holding `content` words of header+fields.
/// Even-sized records need none.
pub fn add_pad(content: usize) -> Vec<Instr> {
    if content % 2 == 1 {
        vec![Instr::Mov(
            Arg::RegOffset(Reg::Eax, (4 * content) as i32),
            Arg::Const(0),
        )]
    } else {
        Vec::new()
    }
}

/// Fold the type tag into the address held in `reg`.
pub fn set_tag(reg: Reg, ty: Ty) -> Vec<Instr> {
    vec![Instr::Or(Arg::Reg(reg), Arg::HexConst(ty.tag()))]
}
