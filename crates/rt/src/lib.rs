//! Kyma runtime core.
//!
//! The runtime is a set of machines. Each machine is self-contained: it
//! owns a value stack, a bump-allocated managed heap with a copying
//! collector, a finalizer-tracked native heap, and a bounded message
//! inbox. Machines interact only by deep-copying a value tree into a
//! peer's heap and enqueuing it there; a value never references another
//! machine's heap.
//!
//! - `value` / `heap`: the tagged value word, cell layout, bump
//!   allocator, and the `require_alloc` reservation protocol
//! - `gc`: the copying collector behind allocation
//! - `machine`: contexts, lifecycle, per-thread binding, spawn
//! - `mailbox`: send, check, timed check, blocking filtered receive
//! - `strings` / `buffers`: string and byte-buffer primitives
//! - `native`: externally owned payloads with collection-driven
//!   finalization

pub mod heap;
pub mod inspect;
pub mod machine;
pub mod mailbox;
pub mod native;
pub mod value;

mod buffers;
mod gc;
mod strings;

pub use heap::{round8, Heap, HeapConfig, HeapStats, HEADER_SIZE};
pub use inspect::{dump_stack, dump_value};
pub use machine::{bind_current, current_machine, Context, Machine, MachineConfig, ValStack};
pub use mailbox::{Msg, INBOX_CAPACITY};
pub use native::{Finalizer, NativeHeap, NativeRef};
pub use value::{CellTag, SendError, Value, NULLARY_TAGS};
