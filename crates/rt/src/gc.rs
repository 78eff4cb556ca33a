//! Copying collector for the machine heap.
//!
//! Evacuation is two-space: live cells are copied chunk-for-chunk into a
//! fresh region, a forwarding word is left behind in the old region, and
//! a Cheney scan walks the new region by its in-band size headers, fixing
//! child references as it goes. Roots are the value stack below `top`,
//! the `ret` and `reg1` registers, and every value pending in the
//! machine's inbox.
//!
//! Native-heap items are not roots: they stay alive exactly as long as
//! some live cell references them. The scan marks referenced items and
//! the sweep afterwards finalizes the rest.
//!
//! If the surviving data plus the pending request does not fit the
//! region, the region grows by the configured factor and evacuation runs
//! again from the already-consistent new space.

use crate::heap::{round8, HEADER_SIZE, WORD};
use crate::machine::Context;
use crate::native::NativeHeap;
use crate::value::{CellTag, Value};

/// Collect the context's heap, guaranteeing room for a further `need`
/// bytes (chunk header included) afterwards.
pub(crate) fn collect(ctx: &mut Context, need: usize) {
    ctx.heap.stats.collections += 1;
    let debug = ctx.heap.config.debug;
    if debug {
        eprintln!(
            "[gc] collection #{} starting, {} of {} bytes used",
            ctx.heap.stats.collections,
            ctx.heap.used(),
            ctx.heap.end()
        );
    }

    let mut size = ctx.heap.end();
    evacuate_all(ctx, size);
    while ctx.heap.used() + need > ctx.heap.end() {
        size = grown(size, ctx.heap.config.growth_factor, ctx.heap.used() + need);
        evacuate_all(ctx, size);
    }

    let live = ctx.heap.used();
    ctx.heap.stats.bytes_copied += live as u64;
    if live > ctx.heap.stats.peak_live_bytes {
        ctx.heap.stats.peak_live_bytes = live;
    }
    if debug {
        eprintln!(
            "[gc] collection #{} done, {} bytes live in {}",
            ctx.heap.stats.collections,
            live,
            ctx.heap.end()
        );
    }
}

fn grown(current: usize, factor: f64, min_fit: usize) -> usize {
    let mut size = current.max(HEADER_SIZE + WORD);
    while size < min_fit {
        size = round8(((size as f64) * factor.max(1.5)) as usize).max(size + WORD);
    }
    size
}

/// One full evacuation pass into a fresh region of `to_size` bytes.
fn evacuate_all(ctx: &mut Context, to_size: usize) {
    let mut ev = Evacuator {
        from: std::mem::take(&mut ctx.heap.data),
        to: vec![0; to_size],
        next: 0,
    };

    for slot in ctx.stack.live_slots_mut() {
        *slot = ev.evacuate(*slot);
    }
    ctx.ret = ev.evacuate(ctx.ret);
    ctx.reg1 = ev.evacuate(ctx.reg1);

    // Pending messages live in this heap too; senders and receivers are
    // shut out by the inbox lock while their references are rewritten.
    if let Some(machine) = ctx.owner.upgrade() {
        let mut inbox = machine.inbox.lock();
        for msg in inbox.pending_mut() {
            msg.value = ev.evacuate(msg.value);
        }
    }

    ctx.native.clear_marks();
    ev.scan(&mut ctx.native);

    ctx.heap.data = ev.to;
    ctx.heap.next = ev.next;
    ctx.native.sweep();
}

struct Evacuator {
    from: Vec<u8>,
    to: Vec<u8>,
    next: usize,
}

impl Evacuator {
    #[inline]
    fn from_word(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.from[off..off + WORD].try_into().unwrap())
    }

    #[inline]
    fn write_from_word(&mut self, off: usize, w: u64) {
        self.from[off..off + WORD].copy_from_slice(&w.to_le_bytes());
    }

    #[inline]
    fn to_word(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.to[off..off + WORD].try_into().unwrap())
    }

    #[inline]
    fn write_to_word(&mut self, off: usize, w: u64) {
        self.to[off..off + WORD].copy_from_slice(&w.to_le_bytes());
    }

    /// Move one cell to the new region, or chase its forwarding word.
    /// Immediates pass through untouched.
    fn evacuate(&mut self, v: Value) -> Value {
        if !v.is_cell() {
            return v;
        }
        let off = v.offset();
        let header = self.from_word(off);
        if (header & 0xff) as u8 == CellTag::Fwd as u8 {
            return Value::cell((header >> 8) as usize);
        }
        let chunk = self.from_word(off - HEADER_SIZE) as usize;
        let new_off = self.next;
        self.to[new_off..new_off + chunk]
            .copy_from_slice(&self.from[off - HEADER_SIZE..off - HEADER_SIZE + chunk]);
        self.next += chunk;
        let new_cell = new_off + HEADER_SIZE;
        // The forwarding word fits the smallest cell: tag byte plus the
        // new offset packed above it.
        self.write_from_word(off, CellTag::Fwd as u64 | ((new_cell as u64) << 8));
        Value::cell(new_cell)
    }

    /// Cheney scan: walk the new region by chunk headers, evacuating the
    /// children of every copied cell and marking referenced native items.
    fn scan(&mut self, native: &mut NativeHeap) {
        let mut at = 0;
        while at < self.next {
            let chunk = self.to_word(at) as usize;
            let cell = at + HEADER_SIZE;
            let header = self.to_word(cell);
            match CellTag::from_u8((header & 0xff) as u8) {
                CellTag::Con => {
                    let arity = ((header >> 8) & 0xff_ffff) as usize;
                    for i in 0..arity {
                        let slot = cell + WORD * (1 + i);
                        let child = self.evacuate(Value::from_raw(self.to_word(slot)));
                        self.write_to_word(slot, child.raw());
                    }
                }
                CellTag::Slice => {
                    let slot = cell + WORD;
                    let root = self.evacuate(Value::from_raw(self.to_word(slot)));
                    self.write_to_word(slot, root.raw());
                }
                CellTag::Native => {
                    native.mark(self.to_word(cell + WORD) as usize);
                }
                CellTag::Fwd => unreachable!("forwarding word in evacuated region"),
                _ => {}
            }
            at += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineConfig};

    fn small_machine() -> std::sync::Arc<Machine> {
        Machine::new(MachineConfig::for_tests())
    }

    #[test]
    fn test_unrooted_cells_are_collected() {
        let m = small_machine();
        let mut ctx = m.context();
        for _ in 0..64 {
            ctx.make_str("transient");
        }
        let used = ctx.heap.used();
        collect(&mut ctx, 64);
        assert!(ctx.heap.used() < used);
        assert_eq!(ctx.heap.used(), 0);
    }

    #[test]
    fn test_stack_roots_survive_with_identical_payload() {
        let m = small_machine();
        let mut ctx = m.context();
        let mut expected = Vec::new();
        for i in 0..10 {
            let s = format!("string number {}", i);
            let v = ctx.make_str(&s);
            ctx.stack.push(v);
            expected.push(s);
        }
        // Churn until several collections have happened.
        while ctx.heap.stats().collections < 3 {
            ctx.make_str("garbage garbage garbage");
        }
        for i in (0..10).rev() {
            let v = ctx.stack.pop();
            assert_eq!(ctx.get_str(v), expected[i]);
        }
    }

    #[test]
    fn test_registers_are_roots() {
        let m = small_machine();
        let mut ctx = m.context();
        let r = ctx.make_str("kept in ret");
        let r1 = ctx.make_float(6.5);
        ctx.ret = r;
        ctx.reg1 = r1;
        collect(&mut ctx, 64);
        assert_eq!(ctx.get_str(ctx.ret), "kept in ret");
        assert_eq!(ctx.get_float(ctx.reg1), 6.5);
    }

    #[test]
    fn test_constructor_graph_survives() {
        let m = small_machine();
        let mut ctx = m.context();
        let leaf = ctx.make_str("leaf");
        let inner = ctx.make_con(300, &[leaf, Value::int(9)]);
        let outer = ctx.make_con(301, &[inner, Value::nullary(4)]);
        ctx.stack.push(outer);
        collect(&mut ctx, 64);
        let outer = ctx.stack.pop();
        assert_eq!(ctx.con_tag(outer), 301);
        assert_eq!(ctx.con_arg(outer, 1), Value::nullary(4));
        let inner = ctx.con_arg(outer, 0);
        assert_eq!(ctx.con_arg(inner, 1).as_int(), 9);
        assert_eq!(ctx.get_str(ctx.con_arg(inner, 0)), "leaf");
    }

    #[test]
    fn test_slice_root_traced_together() {
        let m = small_machine();
        let mut ctx = m.context();
        let s = ctx.make_str("abcdef");
        let t = ctx.str_tail(s);
        ctx.stack.push(t);
        collect(&mut ctx, 64);
        let t = ctx.stack.pop();
        assert_eq!(ctx.cell_tag(t), CellTag::Slice);
        assert_eq!(ctx.get_str(t), "bcdef");
    }

    #[test]
    fn test_sharing_preserved_across_collection() {
        let m = small_machine();
        let mut ctx = m.context();
        let shared = ctx.make_str("shared");
        let pair = ctx.make_con(400, &[shared, shared]);
        ctx.stack.push(pair);
        collect(&mut ctx, 64);
        let pair = ctx.stack.pop();
        // Both children forwarded to the same copy.
        assert_eq!(ctx.con_arg(pair, 0), ctx.con_arg(pair, 1));
    }

    #[test]
    fn test_region_grows_when_live_data_needs_it() {
        let m = small_machine();
        let mut ctx = m.context();
        let initial = ctx.heap.end();
        let mut keep = Vec::new();
        for i in 0..64 {
            let v = ctx.make_str(&format!("live data that accumulates {}", i));
            ctx.stack.push(v);
            keep.push(format!("live data that accumulates {}", i));
        }
        assert!(ctx.heap.end() > initial);
        for i in (0..64).rev() {
            let v = ctx.stack.pop();
            assert_eq!(ctx.get_str(v), keep[i]);
        }
    }

    #[test]
    fn test_inbox_contents_are_roots() {
        let m = small_machine();
        {
            let mut ctx = m.context();
            let v = ctx.make_str("queued");
            ctx.stack.push(v);
        }
        // Self-send queues a copy in the machine's own inbox.
        let msg = m.context().stack.pop();
        m.send(&m, msg).unwrap();
        {
            let mut ctx = m.context();
            while ctx.heap.stats().collections < 2 {
                ctx.make_str("churn churn churn");
            }
        }
        let got = m.recv();
        assert_eq!(m.context().get_str(got.value()), "queued");
    }
}
