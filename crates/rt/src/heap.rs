//! Managed heap: a contiguous byte region with a bump allocator.
//!
//! Cells are laid out as `[size header][cell header][payload...]`. The
//! size header is one word recording the chunk length including itself,
//! so the collector can walk the region; the cell header packs the
//! `CellTag` in its low byte with tag-specific metadata above it.
//! Every chunk is a multiple of 8 bytes and payloads are zeroed on
//! allocation.
//!
//! Allocation never moves data by itself. When a request does not fit,
//! the owning context runs a collection (see `gc`) and retries; inside a
//! `require_alloc` window the collector is off-limits and exceeding the
//! reservation is fatal.

use num_bigint::BigInt;

use crate::machine::Context;
use crate::native::NativeRef;
use crate::value::{CellTag, Value, NULLARY_TAGS};

/// One machine word, also the cell alignment.
pub(crate) const WORD: usize = 8;

/// Size of the in-band chunk header.
pub const HEADER_SIZE: usize = 8;

/// Round a byte count up to the cell alignment.
#[inline]
pub fn round8(n: usize) -> usize {
    (n + 7) & !7
}

/// Heap sizing and collector knobs.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Initial size of the region in bytes.
    pub heap_size: usize,
    /// Region growth factor applied when live data outgrows the region.
    pub growth_factor: f64,
    /// Print collection activity to stderr.
    pub debug: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            heap_size: 4_096_000,
            growth_factor: 2.0,
            debug: false,
        }
    }
}

impl HeapConfig {
    /// A small heap, useful for exercising the collector in tests.
    pub fn small() -> Self {
        Self {
            heap_size: 2048,
            growth_factor: 2.0,
            debug: false,
        }
    }
}

/// Allocation and collection counters.
#[derive(Clone, Debug, Default)]
pub struct HeapStats {
    /// Number of chunks handed out.
    pub allocations: u64,
    /// Total bytes handed out, headers included.
    pub bytes_allocated: u64,
    /// Number of collections performed.
    pub collections: u64,
    /// Total bytes evacuated by the collector.
    pub bytes_copied: u64,
    /// Largest live size observed after a collection.
    pub peak_live_bytes: usize,
}

/// The managed byte region of one machine.
pub struct Heap {
    pub(crate) data: Vec<u8>,
    /// Bump cursor; every live cell lies below it.
    pub(crate) next: usize,
    /// An active allocation reservation forbids collection.
    reserved: bool,
    pub(crate) config: HeapConfig,
    pub(crate) stats: HeapStats,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Heap {
        let size = round8(config.heap_size.max(HEADER_SIZE + WORD));
        Heap {
            data: vec![0; size],
            next: 0,
            reserved: false,
            config,
            stats: HeapStats::default(),
        }
    }

    /// End of the region in bytes.
    #[inline]
    pub fn end(&self) -> usize {
        self.data.len()
    }

    /// Bytes consumed so far, headers included.
    #[inline]
    pub fn used(&self) -> usize {
        self.next
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Non-invasive capacity check: would `size` payload bytes fit
    /// without a collection?
    #[inline]
    pub fn space(&self, size: usize) -> bool {
        self.next + round8(size) + HEADER_SIZE <= self.end()
    }

    #[inline]
    pub(crate) fn reserved(&self) -> bool {
        self.reserved
    }

    #[inline]
    pub(crate) fn set_reserved(&mut self, r: bool) {
        self.reserved = r;
    }

    /// Bump-allocate `size` payload bytes. The caller has already
    /// checked `space`; this never collects.
    pub(crate) fn bump(&mut self, size: usize) -> usize {
        let size = round8(size);
        let chunk = size + HEADER_SIZE;
        debug_assert!(self.next + chunk <= self.end());
        let off = self.next;
        self.write_word(off, chunk as u64);
        let cell = off + HEADER_SIZE;
        self.data[cell..cell + size].fill(0);
        self.next += chunk;
        self.stats.allocations += 1;
        self.stats.bytes_allocated += chunk as u64;
        cell
    }

    #[inline]
    pub(crate) fn word(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.data[off..off + WORD].try_into().unwrap())
    }

    #[inline]
    pub(crate) fn write_word(&mut self, off: usize, w: u64) {
        self.data[off..off + WORD].copy_from_slice(&w.to_le_bytes());
    }

    #[inline]
    pub(crate) fn bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.data[off..off + len]
    }

    #[inline]
    pub(crate) fn bytes_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        &mut self.data[off..off + len]
    }

    /// Tag of the cell referenced by `v`.
    pub(crate) fn cell_tag(&self, v: Value) -> CellTag {
        CellTag::from_u8((self.word(v.offset()) & 0xff) as u8)
    }

    /// Length field packed above the tag byte (strings, buffers, blobs,
    /// bigints).
    #[inline]
    pub(crate) fn cell_len(&self, v: Value) -> usize {
        (self.word(v.offset()) >> 8) as usize
    }

    #[inline]
    pub(crate) fn init_header(&mut self, cell: usize, tag: CellTag, meta: u64) {
        self.write_word(cell, tag as u64 | (meta << 8));
    }
}

/// Cell constructors and accessors.
///
/// Constructors allocate on the machine's heap and may trigger a
/// collection, except inside a `require_alloc` window, where they are
/// guaranteed not to. Accessors assume the tag they are named for.
impl Context {
    /// Allocate a cell, collecting first if the request does not fit.
    pub(crate) fn alloc_cell(&mut self, size: usize) -> usize {
        if !self.heap.space(size) {
            if self.heap.reserved() {
                panic!("heap exhausted inside an allocation reservation");
            }
            crate::gc::collect(self, round8(size) + HEADER_SIZE);
        }
        if !self.heap.space(size) {
            panic!("heap exhausted: region too small after collection");
        }
        self.heap.bump(size)
    }

    /// Reserve room for `size` payload bytes: collect now if needed, then
    /// forbid collection until `done_alloc`. Raw cell offsets obtained
    /// inside the window stay valid for its whole extent.
    pub fn require_alloc(&mut self, size: usize) {
        if !self.heap.space(size) {
            crate::gc::collect(self, round8(size) + HEADER_SIZE);
        }
        self.heap.set_reserved(true);
    }

    /// Close the reservation opened by `require_alloc`.
    pub fn done_alloc(&mut self) {
        self.heap.set_reserved(false);
    }

    /// Construct a constructor cell. Zero-arity constructors with small
    /// tags are interned immediates and allocate nothing.
    pub fn make_con(&mut self, tag: u32, args: &[Value]) -> Value {
        if args.is_empty() && tag < NULLARY_TAGS {
            return Value::nullary(tag);
        }
        let size = WORD * (1 + args.len());
        if self.heap.space(size) || self.heap.reserved() {
            let cell = self.alloc_cell(size);
            self.heap
                .init_header(cell, CellTag::Con, args.len() as u64 | (tag as u64) << 24);
            for (i, &a) in args.iter().enumerate() {
                self.heap.write_word(cell + WORD * (1 + i), a.raw());
            }
            return Value::cell(cell);
        }
        // A collection is coming; the children survive it as stack roots.
        for &a in args {
            self.stack.push(a);
        }
        crate::gc::collect(self, round8(size) + HEADER_SIZE);
        let cell = self.heap.bump(size);
        self.heap
            .init_header(cell, CellTag::Con, args.len() as u64 | (tag as u64) << 24);
        for i in (0..args.len()).rev() {
            let a = self.stack.pop();
            self.heap.write_word(cell + WORD * (1 + i), a.raw());
        }
        Value::cell(cell)
    }

    /// True for both interned and heap-allocated constructors.
    pub fn is_con(&self, v: Value) -> bool {
        v.is_nullary() || (v.is_cell() && self.heap.cell_tag(v) == CellTag::Con)
    }

    pub fn con_tag(&self, v: Value) -> u32 {
        if v.is_nullary() {
            return v.nullary_tag();
        }
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Con);
        (self.heap.word(v.offset()) >> 32) as u32
    }

    pub fn con_arity(&self, v: Value) -> usize {
        if v.is_nullary() {
            return 0;
        }
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Con);
        ((self.heap.word(v.offset()) >> 8) & 0xff_ffff) as usize
    }

    pub fn con_arg(&self, v: Value, i: usize) -> Value {
        let arity = self.con_arity(v);
        assert!(i < arity, "constructor argument {} out of {}", i, arity);
        Value::from_raw(self.heap.word(v.offset() + WORD * (1 + i)))
    }

    /// Construct a string cell with the bytes inline after the header.
    pub fn make_str(&mut self, s: &str) -> Value {
        let len = s.len();
        let cell = self.alloc_cell(WORD + len);
        self.heap.init_header(cell, CellTag::Str, len as u64);
        self.heap.bytes_mut(cell + WORD, len).copy_from_slice(s.as_bytes());
        Value::cell(cell)
    }

    pub fn make_float(&mut self, f: f64) -> Value {
        let cell = self.alloc_cell(2 * WORD);
        self.heap.init_header(cell, CellTag::Float, 0);
        self.heap.write_word(cell + WORD, f.to_bits());
        Value::cell(cell)
    }

    pub fn get_float(&self, v: Value) -> f64 {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Float);
        f64::from_bits(self.heap.word(v.offset() + WORD))
    }

    /// Construct an opaque-pointer cell. The address is carried, never
    /// dereferenced by the runtime.
    pub fn make_ptr(&mut self, addr: u64) -> Value {
        let cell = self.alloc_cell(2 * WORD);
        self.heap.init_header(cell, CellTag::Ptr, 0);
        self.heap.write_word(cell + WORD, addr);
        Value::cell(cell)
    }

    pub fn get_ptr(&self, v: Value) -> u64 {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Ptr);
        self.heap.word(v.offset() + WORD)
    }

    /// Construct a managed buffer cell, copying the bytes in.
    pub fn make_managed(&mut self, bytes: &[u8]) -> Value {
        let cell = self.alloc_cell(WORD + bytes.len());
        self.heap.init_header(cell, CellTag::Managed, bytes.len() as u64);
        self.heap
            .bytes_mut(cell + WORD, bytes.len())
            .copy_from_slice(bytes);
        Value::cell(cell)
    }

    pub fn make_bigint(&mut self, n: &BigInt) -> Value {
        let bytes = n.to_signed_bytes_le();
        let cell = self.alloc_cell(WORD + bytes.len());
        self.heap.init_header(cell, CellTag::BigInt, bytes.len() as u64);
        self.heap
            .bytes_mut(cell + WORD, bytes.len())
            .copy_from_slice(&bytes);
        Value::cell(cell)
    }

    pub fn get_bigint(&self, v: Value) -> BigInt {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::BigInt);
        let len = self.heap.cell_len(v);
        BigInt::from_signed_bytes_le(self.heap.bytes(v.offset() + WORD, len))
    }

    pub fn make_bits8(&mut self, b: u8) -> Value {
        self.make_word_cell(CellTag::Bits8, b as u64)
    }

    pub fn make_bits16(&mut self, b: u16) -> Value {
        self.make_word_cell(CellTag::Bits16, b as u64)
    }

    pub fn make_bits32(&mut self, b: u32) -> Value {
        self.make_word_cell(CellTag::Bits32, b as u64)
    }

    pub fn make_bits64(&mut self, b: u64) -> Value {
        self.make_word_cell(CellTag::Bits64, b)
    }

    fn make_word_cell(&mut self, tag: CellTag, payload: u64) -> Value {
        let cell = self.alloc_cell(2 * WORD);
        self.heap.init_header(cell, tag, 0);
        self.heap.write_word(cell + WORD, payload);
        Value::cell(cell)
    }

    pub fn get_bits8(&self, v: Value) -> u8 {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Bits8);
        self.heap.word(v.offset() + WORD) as u8
    }

    pub fn get_bits16(&self, v: Value) -> u16 {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Bits16);
        self.heap.word(v.offset() + WORD) as u16
    }

    pub fn get_bits32(&self, v: Value) -> u32 {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Bits32);
        self.heap.word(v.offset() + WORD) as u32
    }

    pub fn get_bits64(&self, v: Value) -> u64 {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Bits64);
        self.heap.word(v.offset() + WORD)
    }

    /// Construct a native-handle cell referencing a finalizer-tracked
    /// item. Room for the cell is secured before the caller registers the
    /// item, so the pairing in `native_alloc` cannot be split by a
    /// collection.
    pub(crate) fn make_native_cell(&mut self, item: NativeRef) -> Value {
        let cell = self.alloc_cell(2 * WORD);
        self.heap.init_header(cell, CellTag::Native, 0);
        self.heap.write_word(cell + WORD, item.0 as u64);
        Value::cell(cell)
    }

    pub fn native_ref(&self, v: Value) -> NativeRef {
        debug_assert_eq!(self.heap.cell_tag(v), CellTag::Native);
        NativeRef(self.heap.word(v.offset() + WORD) as usize)
    }

    /// Tag of a heap cell. Panics on immediates; discriminate with
    /// `Value::is_int` / `Value::is_nullary` first.
    pub fn cell_tag(&self, v: Value) -> CellTag {
        self.heap.cell_tag(v)
    }
}
