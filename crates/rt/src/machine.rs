//! Machines: the per-thread execution contexts of the runtime.
//!
//! A machine owns a value stack, a managed heap, a native heap, two
//! result registers, and an inbox. Machines are self-contained: a value
//! never references another machine's heap, and the only inter-machine
//! traffic is the deep copy performed by the mailbox. One OS thread
//! drives one machine; peers reach into it only under its context lock
//! (to copy a message in) or its inbox lock (to enqueue or receive).
//!
//! Teardown empties the storage and flips the machine inactive but keeps
//! the record itself alive, so a late sender observes an inactive
//! machine and drops its message instead of crashing.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::heap::{Heap, HeapConfig, HeapStats};
use crate::mailbox::Inbox;
use crate::native::{Finalizer, NativeHeap};
use crate::value::Value;

static NEXT_MACHINE_ID: AtomicU64 = AtomicU64::new(1);

/// Sizing for a new machine.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Capacity of the value stack, in slots.
    pub stack_size: usize,
    /// Advisory cap on peers this machine will spawn; carried for the
    /// embedder, not enforced here.
    pub max_peers: usize,
    pub heap: HeapConfig,
}

impl MachineConfig {
    pub fn new(stack_size: usize, heap_size: usize, max_peers: usize) -> Self {
        Self {
            stack_size,
            max_peers,
            heap: HeapConfig {
                heap_size,
                ..HeapConfig::default()
            },
        }
    }

    /// Small sizes that force frequent collections.
    pub fn for_tests() -> Self {
        Self {
            stack_size: 1024,
            max_peers: 4,
            heap: HeapConfig::small(),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stack_size: 4_096_000,
            max_peers: 1,
            heap: HeapConfig::default(),
        }
    }
}

/// The value stack: a preallocated slot array with a call base and an
/// allocation cursor. Overflow is fatal.
pub struct ValStack {
    slots: Vec<Value>,
    base: usize,
    top: usize,
}

impl ValStack {
    pub fn new(capacity: usize) -> ValStack {
        ValStack {
            slots: vec![Value::NULL; capacity],
            base: 0,
            top: 0,
        }
    }

    #[inline]
    pub fn push(&mut self, v: Value) {
        if self.top == self.slots.len() {
            panic!("value stack overflow ({} slots)", self.slots.len());
        }
        self.slots[self.top] = v;
        self.top += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        debug_assert!(self.top > self.base, "pop below the activation base");
        self.top -= 1;
        let v = self.slots[self.top];
        self.slots[self.top] = Value::NULL;
        v
    }

    /// Read a slot by absolute index.
    #[inline]
    pub fn slot(&self, i: usize) -> Value {
        debug_assert!(i < self.top);
        self.slots[i]
    }

    #[inline]
    pub fn set_slot(&mut self, i: usize, v: Value) {
        debug_assert!(i < self.top);
        self.slots[i] = v;
    }

    /// Slot `n` below the cursor.
    #[inline]
    pub fn peek(&self, n: usize) -> Value {
        debug_assert!(n < self.top);
        self.slots[self.top - 1 - n]
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Move the activation base; the call protocol owns this.
    #[inline]
    pub fn set_base(&mut self, base: usize) {
        debug_assert!(base <= self.top);
        self.base = base;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// The root region handed to the collector.
    pub(crate) fn live_slots_mut(&mut self) -> &mut [Value] {
        &mut self.slots[..self.top]
    }

    fn release(&mut self) {
        self.slots = Vec::new();
        self.base = 0;
        self.top = 0;
    }
}

/// Everything a machine owns that allocation and collection touch,
/// guarded as one unit by the machine's context lock.
pub struct Context {
    pub(crate) owner: Weak<Machine>,
    pub stack: ValStack,
    pub heap: Heap,
    pub native: NativeHeap,
    /// Result register; a collector root.
    pub ret: Value,
    /// Scratch register; a collector root.
    pub reg1: Value,
}

impl Context {
    /// Register a fresh zeroed native payload and return a native-handle
    /// cell referencing it. Heap room is secured first so no collection
    /// can separate the item from its referencing cell.
    pub fn native_alloc(&mut self, size: usize, finalizer: Option<Finalizer>) -> Value {
        self.reserve_native_cell();
        let item = self.native.allocate(size, finalizer);
        self.make_native_cell(item)
    }

    /// Register an existing payload, as `native_alloc`.
    pub fn native_manage(&mut self, data: Vec<u8>, finalizer: Option<Finalizer>) -> Value {
        self.reserve_native_cell();
        let item = self.native.manage(data, finalizer);
        self.make_native_cell(item)
    }

    fn reserve_native_cell(&mut self) {
        let cell_size = 2 * crate::heap::WORD;
        if !self.heap.space(cell_size) && !self.heap.reserved() {
            crate::gc::collect(self, cell_size + crate::heap::HEADER_SIZE);
        }
    }

    fn release(&mut self) {
        self.stack.release();
        self.heap.data = Vec::new();
        self.heap.next = 0;
        self.native.finalize_all();
        self.ret = Value::NULL;
        self.reg1 = Value::NULL;
    }
}

/// The shared machine record. Lives in an `Arc`; peers hold it to send,
/// the owning thread holds it to run.
pub struct Machine {
    id: u64,
    config: MachineConfig,
    ctx: Mutex<Context>,
    pub(crate) inbox: Mutex<Inbox>,
    pub(crate) inbox_waiting: Condvar,
    active: AtomicBool,
    /// Peers actively coupled to this machine.
    processes: AtomicUsize,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Arc<Machine> {
        Arc::new_cyclic(|weak: &Weak<Machine>| Machine {
            id: NEXT_MACHINE_ID.fetch_add(1, Ordering::Relaxed),
            ctx: Mutex::new(Context {
                owner: weak.clone(),
                stack: ValStack::new(config.stack_size),
                heap: Heap::new(config.heap.clone()),
                native: NativeHeap::new(),
                ret: Value::NULL,
                reg1: Value::NULL,
            }),
            inbox: Mutex::new(Inbox::new()),
            inbox_waiting: Condvar::new(),
            active: AtomicBool::new(true),
            processes: AtomicUsize::new(0),
            config,
        })
    }

    /// Process-unique machine id, also the lock-ordering key.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Lock and return the machine's execution context. Drop the guard
    /// before calling `send`, `spawn` or the other messaging operations;
    /// they take this lock internally.
    pub fn context(&self) -> MutexGuard<'_, Context> {
        self.ctx.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn processes(&self) -> usize {
        self.processes.load(Ordering::SeqCst)
    }

    /// Release stack, heap, native heap and inbox, flip the machine
    /// inactive, and return its statistics. The record itself survives
    /// so late senders observe the inactive flag.
    pub fn terminate(&self) -> HeapStats {
        let mut ctx = self.ctx.lock();
        let stats = ctx.heap.stats.clone();
        ctx.release();
        self.inbox.lock().clear();
        self.active.store(false, Ordering::SeqCst);
        stats
    }

    /// Run `body` on a fresh peer machine bound to a new OS thread.
    ///
    /// The argument is copied into the peer and pushed as its first
    /// stack slot before the thread starts. The parent's `processes`
    /// count rises for the peer's lifetime; the peer is terminated when
    /// the body returns.
    pub fn spawn<F>(self: &Arc<Self>, body: F, arg: Value) -> Arc<Machine>
    where
        F: FnOnce(&Arc<Machine>) + Send + 'static,
    {
        let peer = Machine::new(self.config.clone());
        // The peer can message its parent from its first instruction.
        peer.processes.store(1, Ordering::SeqCst);

        let copied = crate::mailbox::copy_for_spawn(self, &peer, arg);
        {
            let mut ctx = peer.ctx.lock();
            ctx.stack.push(copied);
            ctx.stack.set_base(0);
        }

        self.processes.fetch_add(1, Ordering::SeqCst);
        let parent = Arc::clone(self);
        let child = Arc::clone(&peer);
        thread::spawn(move || {
            bind_current(&child);
            body(&child);
            parent.processes.fetch_sub(1, Ordering::SeqCst);
            child.terminate();
        });
        peer
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("processes", &self.processes())
            .finish()
    }
}

thread_local! {
    static CURRENT_MACHINE: RefCell<Option<Arc<Machine>>> = const { RefCell::new(None) };
}

/// Bind `m` as this thread's current machine.
pub fn bind_current(m: &Arc<Machine>) {
    CURRENT_MACHINE.with(|c| *c.borrow_mut() = Some(Arc::clone(m)));
}

/// The machine bound to this thread, if any.
pub fn current_machine() -> Option<Arc<Machine>> {
    CURRENT_MACHINE.with(|c| c.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_push_pop() {
        let mut stack = ValStack::new(8);
        stack.push(Value::int(1));
        stack.push(Value::int(2));
        assert_eq!(stack.top(), 2);
        assert_eq!(stack.peek(0).as_int(), 2);
        assert_eq!(stack.peek(1).as_int(), 1);
        assert_eq!(stack.pop().as_int(), 2);
        assert_eq!(stack.pop().as_int(), 1);
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "value stack overflow")]
    fn test_stack_overflow_is_fatal() {
        let mut stack = ValStack::new(4);
        for i in 0.. {
            stack.push(Value::int(i));
        }
    }

    #[test]
    fn test_machine_ids_are_unique() {
        let a = Machine::new(MachineConfig::for_tests());
        let b = Machine::new(MachineConfig::for_tests());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_terminate_leaves_inactive_husk() {
        let m = Machine::new(MachineConfig::for_tests());
        {
            let mut ctx = m.context();
            let v = ctx.make_str("soon gone");
            ctx.stack.push(v);
        }
        assert!(m.is_active());
        let stats = m.terminate();
        assert!(!m.is_active());
        assert!(stats.allocations > 0);
        // The record is still addressable.
        assert_eq!(m.processes(), 0);
    }

    #[test]
    fn test_terminate_runs_native_finalizers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let m = Machine::new(MachineConfig::for_tests());
        {
            let mut ctx = m.context();
            let f = fired.clone();
            let v = ctx.native_alloc(8, Some(Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })));
            ctx.stack.push(v);
        }
        m.terminate();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreferenced_native_item_is_finalized_by_gc() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let m = Machine::new(MachineConfig::for_tests());
        let mut ctx = m.context();
        let f = fired.clone();
        // Handle cell is never rooted, so the next collection drops both
        // the cell and the item behind it.
        ctx.native_alloc(8, Some(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        crate::gc::collect(&mut ctx, 64);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ctx.native.is_empty());
    }

    #[test]
    fn test_referenced_native_item_survives_gc() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fired = Arc::new(AtomicUsize::new(0));
        let m = Machine::new(MachineConfig::for_tests());
        let mut ctx = m.context();
        let f = fired.clone();
        let v = ctx.native_alloc(8, Some(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        ctx.stack.push(v);
        crate::gc::collect(&mut ctx, 64);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let v = ctx.stack.pop();
        assert_eq!(ctx.native.bytes(ctx.native_ref(v)).len(), 8);
    }

    #[test]
    fn test_thread_binding() {
        let m = Machine::new(MachineConfig::for_tests());
        bind_current(&m);
        let got = current_machine().expect("bound machine");
        assert_eq!(got.id(), m.id());
    }
}
