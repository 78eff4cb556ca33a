//! Byte-buffer primitives.
//!
//! These operate on cells that own their bytes: managed buffers, raw
//! blobs from the generic allocation API, and native-heap items. All
//! offsets are byte offsets into the payload and every access is bounds
//! checked; multi-byte reads and writes are little-endian and need no
//! alignment.

use crate::heap::WORD;
use crate::machine::Context;
use crate::value::{CellTag, Value};

impl Context {
    /// Generic allocation: a zeroed raw blob of `size` bytes.
    pub fn make_blob(&mut self, size: usize) -> Value {
        let cell = self.alloc_cell(WORD + size);
        self.heap.init_header(cell, CellTag::Blob, size as u64);
        Value::cell(cell)
    }

    /// Reallocate a blob, copying the common prefix.
    pub fn realloc_blob(&mut self, old: Value, new_size: usize) -> Value {
        // The old blob must survive the allocation of the new one.
        self.stack.push(old);
        let fresh = self.make_blob(new_size);
        let old = self.stack.pop();
        let n = self.buffer_len(old).min(new_size);
        let prefix = self.buffer_bytes(old)[..n].to_vec();
        self.buffer_bytes_mut(fresh)[..n].copy_from_slice(&prefix);
        fresh
    }

    /// Payload length of a managed buffer, blob, or native item.
    pub fn buffer_len(&self, v: Value) -> usize {
        match self.heap.cell_tag(v) {
            CellTag::Managed | CellTag::Blob => self.heap.cell_len(v),
            CellTag::Native => self.native.bytes(self.native_ref(v)).len(),
            t => panic!("not a byte buffer: {:?}", t),
        }
    }

    pub fn buffer_bytes(&self, v: Value) -> &[u8] {
        match self.heap.cell_tag(v) {
            CellTag::Managed | CellTag::Blob => {
                let len = self.heap.cell_len(v);
                self.heap.bytes(v.offset() + WORD, len)
            }
            CellTag::Native => self.native.bytes(self.native_ref(v)),
            t => panic!("not a byte buffer: {:?}", t),
        }
    }

    pub fn buffer_bytes_mut(&mut self, v: Value) -> &mut [u8] {
        match self.heap.cell_tag(v) {
            CellTag::Managed | CellTag::Blob => {
                let len = self.heap.cell_len(v);
                self.heap.bytes_mut(v.offset() + WORD, len)
            }
            CellTag::Native => {
                let r = self.native_ref(v);
                self.native.bytes_mut(r)
            }
            t => panic!("not a byte buffer: {:?}", t),
        }
    }

    pub fn peek(&self, v: Value, off: usize) -> u8 {
        self.buffer_bytes(v)[off]
    }

    pub fn poke(&mut self, v: Value, off: usize, byte: u8) {
        self.buffer_bytes_mut(v)[off] = byte;
    }

    pub fn peek_word(&self, v: Value, off: usize) -> u64 {
        let b = self.buffer_bytes(v);
        u64::from_le_bytes(b[off..off + 8].try_into().expect("word read in range"))
    }

    pub fn poke_word(&mut self, v: Value, off: usize, w: u64) {
        self.buffer_bytes_mut(v)[off..off + 8].copy_from_slice(&w.to_le_bytes());
    }

    pub fn peek_double(&self, v: Value, off: usize) -> f64 {
        f64::from_bits(self.peek_word(v, off))
    }

    pub fn poke_double(&mut self, v: Value, off: usize, f: f64) {
        self.poke_word(v, off, f.to_bits());
    }

    pub fn peek_single(&self, v: Value, off: usize) -> f32 {
        let b = self.buffer_bytes(v);
        f32::from_le_bytes(b[off..off + 4].try_into().expect("single read in range"))
    }

    pub fn poke_single(&mut self, v: Value, off: usize, f: f32) {
        self.buffer_bytes_mut(v)[off..off + 4].copy_from_slice(&f.to_le_bytes());
    }

    pub fn memset(&mut self, v: Value, off: usize, byte: u8, len: usize) {
        self.buffer_bytes_mut(v)[off..off + len].fill(byte);
    }

    /// Copy `len` bytes between buffers; source and destination may be
    /// the same cell with overlapping ranges.
    pub fn memmove(&mut self, dst: Value, src: Value, dst_off: usize, src_off: usize, len: usize) {
        if dst == src {
            self.buffer_bytes_mut(dst)
                .copy_within(src_off..src_off + len, dst_off);
        } else {
            let bytes = self.buffer_bytes(src)[src_off..src_off + len].to_vec();
            self.buffer_bytes_mut(dst)[dst_off..dst_off + len].copy_from_slice(&bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineConfig};

    fn machine() -> std::sync::Arc<Machine> {
        Machine::new(MachineConfig::for_tests())
    }

    #[test]
    fn test_blob_starts_zeroed() {
        let m = machine();
        let mut ctx = m.context();
        let b = ctx.make_blob(32);
        assert_eq!(ctx.buffer_len(b), 32);
        assert!(ctx.buffer_bytes(b).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_peek_poke() {
        let m = machine();
        let mut ctx = m.context();
        let b = ctx.make_blob(16);
        ctx.poke(b, 3, 0xab);
        assert_eq!(ctx.peek(b, 3), 0xab);
        ctx.poke_word(b, 8, 0xdead_beef_0000_0001);
        assert_eq!(ctx.peek_word(b, 8), 0xdead_beef_0000_0001);
    }

    #[test]
    fn test_doubles_and_singles() {
        let m = machine();
        let mut ctx = m.context();
        let b = ctx.make_blob(16);
        ctx.poke_double(b, 0, -2.5);
        assert_eq!(ctx.peek_double(b, 0), -2.5);
        ctx.poke_single(b, 12, 1.5);
        assert_eq!(ctx.peek_single(b, 12), 1.5);
    }

    #[test]
    fn test_memset_and_memmove() {
        let m = machine();
        let mut ctx = m.context();
        let a = ctx.make_blob(8);
        let b = ctx.make_blob(8);
        ctx.memset(a, 0, 0x11, 4);
        ctx.memset(a, 4, 0x22, 4);
        ctx.memmove(b, a, 0, 2, 4);
        assert_eq!(&ctx.buffer_bytes(b)[..4], &[0x11, 0x11, 0x22, 0x22]);
        // Overlapping move within one buffer.
        ctx.memmove(a, a, 1, 0, 6);
        assert_eq!(
            ctx.buffer_bytes(a),
            &[0x11, 0x11, 0x11, 0x11, 0x11, 0x22, 0x22, 0x22]
        );
    }

    #[test]
    fn test_realloc_copies_prefix() {
        let m = machine();
        let mut ctx = m.context();
        let a = ctx.make_blob(4);
        ctx.memset(a, 0, 0x5a, 4);
        let bigger = ctx.realloc_blob(a, 8);
        assert_eq!(ctx.buffer_len(bigger), 8);
        assert_eq!(&ctx.buffer_bytes(bigger)[..4], &[0x5a; 4]);
        assert_eq!(&ctx.buffer_bytes(bigger)[4..], &[0; 4]);
    }

    #[test]
    fn test_managed_and_native_buffers() {
        let m = machine();
        let mut ctx = m.context();
        let managed = ctx.make_managed(&[9, 8, 7]);
        assert_eq!(ctx.buffer_bytes(managed), &[9, 8, 7]);
        let native = ctx.native_alloc(4, None);
        ctx.poke(native, 0, 0x42);
        assert_eq!(ctx.peek(native, 0), 0x42);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_access_panics() {
        let m = machine();
        let mut ctx = m.context();
        let b = ctx.make_blob(4);
        ctx.peek(b, 4);
    }
}
