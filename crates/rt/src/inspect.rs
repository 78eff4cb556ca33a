//! Diagnostic rendering of values and stacks.
//!
//! These produce strings rather than printing, so callers can route the
//! output wherever their diagnostics go.

use std::fmt::Write;

use crate::machine::Context;
use crate::value::{CellTag, Value};

/// Render one value, descending into constructor arguments.
pub fn dump_value(ctx: &Context, v: Value) -> String {
    let mut out = String::new();
    write_value(ctx, v, &mut out);
    out
}

fn write_value(ctx: &Context, v: Value, out: &mut String) {
    if v.is_null() {
        out.push_str("null");
        return;
    }
    if v.is_int() {
        let _ = write!(out, "{}", v.as_int());
        return;
    }
    if v.is_nullary() {
        let _ = write!(out, "{}[]", v.nullary_tag());
        return;
    }
    match ctx.cell_tag(v) {
        CellTag::Con => {
            let _ = write!(out, "{}[", ctx.con_tag(v));
            for i in 0..ctx.con_arity(v) {
                if i > 0 {
                    out.push(' ');
                }
                write_value(ctx, ctx.con_arg(v, i), out);
            }
            out.push(']');
        }
        CellTag::Str | CellTag::Slice => {
            let _ = write!(out, "STR[{}]", ctx.get_str(v));
        }
        CellTag::Float => {
            let _ = write!(out, "FLT[{}]", ctx.get_float(v));
        }
        CellTag::Ptr => {
            let _ = write!(out, "PTR[{:#x}]", ctx.get_ptr(v));
        }
        CellTag::Managed => {
            let _ = write!(out, "BUF[{}]", ctx.buffer_len(v));
        }
        CellTag::Blob => {
            let _ = write!(out, "BLOB[{}]", ctx.buffer_len(v));
        }
        CellTag::BigInt => {
            let _ = write!(out, "BIG[{}]", ctx.get_bigint(v));
        }
        CellTag::Bits8 => {
            let _ = write!(out, "B8[{}]", ctx.get_bits8(v));
        }
        CellTag::Bits16 => {
            let _ = write!(out, "B16[{}]", ctx.get_bits16(v));
        }
        CellTag::Bits32 => {
            let _ = write!(out, "B32[{}]", ctx.get_bits32(v));
        }
        CellTag::Bits64 => {
            let _ = write!(out, "B64[{}]", ctx.get_bits64(v));
        }
        CellTag::Native => {
            let _ = write!(out, "NATIVE[{}]", ctx.native_ref(v).0);
        }
        CellTag::Fwd => out.push_str("FWD"),
    }
}

/// Render the live stack region, one numbered slot per line, then the
/// result register.
pub fn dump_stack(ctx: &Context) -> String {
    let mut out = String::new();
    for i in 0..ctx.stack.top() {
        let _ = write!(out, "{}: ", i);
        write_value(ctx, ctx.stack.slot(i), &mut out);
        out.push('\n');
    }
    out.push_str("RET: ");
    write_value(ctx, ctx.ret, &mut out);
    out.push('\n');
    out
}
