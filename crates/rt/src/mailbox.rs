//! Inbox and cross-machine messaging.
//!
//! Sending copies the message tree into the recipient's heap under the
//! recipient's context lock, then appends `(sender, copy)` to the
//! recipient's bounded inbox and signals its condition variable. The
//! copy is a plain depth-first traversal; small integers and interned
//! nullary constructors transfer as immediates, everything else is
//! reallocated in the destination.
//!
//! A collection on the destination (triggered by the copy's own
//! allocations) invalidates the attempt's raw offsets. The copy watches
//! the destination's collection counter after every allocation and
//! aborts before touching a stale offset; the send retries from scratch
//! once, on the assumption that the collection has made room. A second
//! interruption is fatal.
//!
//! Lock order: context locks are taken in machine-id order, the inbox
//! lock is a leaf. Receivers touch only the inbox lock, so a receiver
//! parked in `recv` never blocks a sender's copy.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;

use crate::heap::WORD;
use crate::machine::{Context, Machine};
use crate::value::{CellTag, SendError, Value};

/// Fixed inbox capacity. Filling it is fatal: the runtime has no
/// backpressure story for a receiver that never drains.
pub const INBOX_CAPACITY: usize = 1024;

/// Liveness backstop for blocking receive: the wait wakes up at this
/// interval and rescans even without a signal.
const RECV_BACKSTOP: Duration = Duration::from_secs(3);

pub(crate) struct Message {
    pub(crate) sender: Arc<Machine>,
    pub(crate) value: Value,
}

/// Pending messages of one machine, oldest first.
pub(crate) struct Inbox {
    pending: Vec<Message>,
}

impl Inbox {
    pub(crate) fn new() -> Inbox {
        Inbox {
            pending: Vec::with_capacity(INBOX_CAPACITY),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn pending_mut(&mut self) -> &mut [Message] {
        &mut self.pending
    }

    fn position(&self, filter: Option<&Machine>) -> Option<usize> {
        self.pending
            .iter()
            .position(|m| filter.map_or(true, |s| s.id() == m.sender.id()))
    }
}

/// A received message: the sender and a value living in the receiver's
/// heap. Root the value before the receiver allocates again.
pub struct Msg {
    sender: Arc<Machine>,
    value: Value,
}

impl Msg {
    pub fn value(&self) -> Value {
        self.value
    }

    pub fn sender(&self) -> &Arc<Machine> {
        &self.sender
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("sender", &self.sender.id())
            .field("value", &self.value)
            .finish()
    }
}

impl Machine {
    /// Send a copy of `msg` to `dest`. Returns `Err(Inactive)` and drops
    /// the message silently when the recipient has been terminated.
    pub fn send(self: &Arc<Self>, dest: &Arc<Machine>, msg: Value) -> Result<(), SendError> {
        if !dest.is_active() {
            return Err(SendError::Inactive);
        }
        if Arc::ptr_eq(self, dest) {
            return self.send_local(msg);
        }

        let (src_guard, mut dest_guard) = lock_pair(self, dest);
        if !dest.is_active() {
            return Err(SendError::Inactive);
        }
        let copied = copy_with_retry(&mut dest_guard, Src::Remote(&src_guard), msg);

        // Enqueue while the context lock is still held: a collection on
        // the destination cannot slip between copy and enqueue.
        let mut inbox = dest.inbox.lock();
        if inbox.len() >= INBOX_CAPACITY {
            panic!("inbox full on machine {}", dest.id());
        }
        inbox.pending.push(Message {
            sender: Arc::clone(self),
            value: copied,
        });
        dest.inbox_waiting.notify_one();
        Ok(())
    }

    /// Send to self: the message is rooted on the own stack so a
    /// collection during the copy relocates rather than kills it.
    fn send_local(self: &Arc<Self>, msg: Value) -> Result<(), SendError> {
        let mut ctx = self.context();
        ctx.stack.push(msg);
        let mut copied = None;
        for _ in 0..2 {
            let epoch = ctx.heap.stats().collections;
            let root = ctx.stack.peek(0);
            if let Ok(v) = copy_tree(&mut ctx, Src::Local, root, epoch) {
                copied = Some(v);
                break;
            }
        }
        let copied =
            copied.unwrap_or_else(|| panic!("message copy interrupted by collection twice"));
        ctx.stack.pop();

        let mut inbox = self.inbox.lock();
        if inbox.len() >= INBOX_CAPACITY {
            panic!("inbox full on machine {}", self.id());
        }
        inbox.pending.push(Message {
            sender: Arc::clone(self),
            value: copied,
        });
        self.inbox_waiting.notify_one();
        Ok(())
    }

    /// Non-blocking scan for a pending message, optionally from one
    /// sender. Returns the sender of the first match.
    pub fn check_from(&self, sender: Option<&Machine>) -> Option<Arc<Machine>> {
        let inbox = self.inbox.lock();
        inbox.position(sender).map(|i| Arc::clone(&inbox.pending[i].sender))
    }

    pub fn check(&self) -> Option<Arc<Machine>> {
        self.check_from(None)
    }

    /// As `check`, but when the inbox is empty, wait up to `delay` for a
    /// sender's signal before rescanning once.
    pub fn check_timeout(&self, delay: Duration) -> Option<Arc<Machine>> {
        let mut inbox = self.inbox.lock();
        if let Some(i) = inbox.position(None) {
            return Some(Arc::clone(&inbox.pending[i].sender));
        }
        self.inbox_waiting.wait_for(&mut inbox, delay);
        inbox.position(None).map(|i| Arc::clone(&inbox.pending[i].sender))
    }

    /// Block until a message (optionally from `sender`) is pending, take
    /// it out, and compact the inbox in order.
    pub fn recv_from(&self, sender: Option<&Machine>) -> Msg {
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(i) = inbox.position(sender) {
                // Vec::remove slides every later message down one slot,
                // keeping arrival order intact.
                let m = inbox.pending.remove(i);
                return Msg {
                    sender: m.sender,
                    value: m.value,
                };
            }
            self.inbox_waiting.wait_for(&mut inbox, RECV_BACKSTOP);
        }
    }

    pub fn recv(&self) -> Msg {
        self.recv_from(None)
    }

    /// Number of pending messages; diagnostic only.
    pub fn pending_messages(&self) -> usize {
        self.inbox.lock().len()
    }
}

/// Copy `arg` from the parent into a freshly spawned peer.
pub(crate) fn copy_for_spawn(parent: &Arc<Machine>, peer: &Arc<Machine>, arg: Value) -> Value {
    let (parent_guard, mut peer_guard) = lock_pair(parent, peer);
    copy_with_retry(&mut peer_guard, Src::Remote(&parent_guard), arg)
}

/// Acquire two context locks in machine-id order, returning them as
/// `(a, b)` regardless of which was taken first.
fn lock_pair<'a>(
    a: &'a Machine,
    b: &'a Machine,
) -> (MutexGuard<'a, Context>, MutexGuard<'a, Context>) {
    if a.id() < b.id() {
        let ga = a.context();
        let gb = b.context();
        (ga, gb)
    } else {
        let gb = b.context();
        let ga = a.context();
        (ga, gb)
    }
}

/// Where the copy reads its source cells from.
#[derive(Clone, Copy)]
enum Src<'a> {
    /// Source and destination are the same context (self-send).
    Local,
    Remote(&'a Context),
}

struct CopyInterrupted;

fn copy_with_retry(dest: &mut Context, src: Src<'_>, v: Value) -> Value {
    for _ in 0..2 {
        let epoch = dest.heap.stats().collections;
        if let Ok(copied) = copy_tree(dest, src, v, epoch) {
            return copied;
        }
    }
    panic!("message copy interrupted by collection twice");
}

fn src_word(dest: &Context, src: Src<'_>, off: usize) -> u64 {
    match src {
        Src::Local => dest.heap.word(off),
        Src::Remote(c) => c.heap.word(off),
    }
}

fn src_bytes(dest: &Context, src: Src<'_>, off: usize, len: usize) -> Vec<u8> {
    match src {
        Src::Local => dest.heap.bytes(off, len).to_vec(),
        Src::Remote(c) => c.heap.bytes(off, len).to_vec(),
    }
}

/// Depth-first structural copy. Every destination allocation is followed
/// by a collection-counter check; `Err` means the attempt must be
/// abandoned because raw offsets from before the collection are dead.
fn copy_tree(
    dest: &mut Context,
    src: Src<'_>,
    v: Value,
    epoch: u64,
) -> Result<Value, CopyInterrupted> {
    if !v.is_cell() {
        // Integers, nullary constructors and null carry themselves.
        return Ok(v);
    }
    let off = v.offset();
    let header = src_word(dest, src, off);
    match CellTag::from_u8((header & 0xff) as u8) {
        CellTag::Con => {
            let arity = ((header >> 8) & 0xff_ffff) as usize;
            let tag = (header >> 32) as u32;
            let cell = dest.alloc_cell(WORD * (1 + arity));
            if dest.heap.stats().collections != epoch {
                return Err(CopyInterrupted);
            }
            dest.heap
                .init_header(cell, CellTag::Con, arity as u64 | (tag as u64) << 24);
            for i in 0..arity {
                let child = Value::from_raw(src_word(dest, src, off + WORD * (1 + i)));
                let copied = copy_tree(dest, src, child, epoch)?;
                dest.heap.write_word(cell + WORD * (1 + i), copied.raw());
            }
            Ok(Value::cell(cell))
        }
        tag @ (CellTag::Str | CellTag::Managed | CellTag::BigInt | CellTag::Blob) => {
            let len = (header >> 8) as usize;
            let payload = src_bytes(dest, src, off + WORD, len);
            let cell = dest.alloc_cell(WORD + len);
            if dest.heap.stats().collections != epoch {
                return Err(CopyInterrupted);
            }
            dest.heap.init_header(cell, tag, len as u64);
            dest.heap.bytes_mut(cell + WORD, len).copy_from_slice(&payload);
            Ok(Value::cell(cell))
        }
        tag @ (CellTag::Float
        | CellTag::Ptr
        | CellTag::Bits8
        | CellTag::Bits16
        | CellTag::Bits32
        | CellTag::Bits64) => {
            let payload = src_word(dest, src, off + WORD);
            let cell = dest.alloc_cell(2 * WORD);
            if dest.heap.stats().collections != epoch {
                return Err(CopyInterrupted);
            }
            dest.heap.init_header(cell, tag, 0);
            dest.heap.write_word(cell + WORD, payload);
            Ok(Value::cell(cell))
        }
        CellTag::Slice => {
            let root = Value::from_raw(src_word(dest, src, off + WORD));
            let byte_off = src_word(dest, src, off + 2 * WORD);
            let new_root = copy_tree(dest, src, root, epoch)?;
            let cell = dest.alloc_cell(3 * WORD);
            if dest.heap.stats().collections != epoch {
                return Err(CopyInterrupted);
            }
            dest.heap.init_header(cell, CellTag::Slice, 0);
            dest.heap.write_word(cell + WORD, new_root.raw());
            dest.heap.write_word(cell + 2 * WORD, byte_off);
            Ok(Value::cell(cell))
        }
        CellTag::Native => panic!("cannot copy a foreign-heap handle between machines"),
        CellTag::Fwd => panic!("invalid cell tag in message copy"),
    }
}
