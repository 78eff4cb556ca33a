//! Finalizer-tracked auxiliary heap.
//!
//! Payloads that the managed heap cannot hold inline (externally
//! produced buffers, handles that need teardown code) are registered
//! here and referenced from native-handle cells. The collector marks
//! items referenced by live cells during its scan; the sweep finalizes
//! and drops the rest. Terminating a machine finalizes everything still
//! registered.

use std::fmt;

/// Teardown hook run exactly once, when the item becomes unreachable or
/// its machine terminates.
pub type Finalizer = Box<dyn FnMut(&mut [u8]) + Send>;

/// Stable handle to a native-heap item.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NativeRef(pub(crate) usize);

struct NativeItem {
    data: Box<[u8]>,
    finalizer: Option<Finalizer>,
    marked: bool,
}

/// Slab of registered payloads belonging to one machine.
pub struct NativeHeap {
    items: Vec<Option<NativeItem>>,
    free: Vec<usize>,
}

impl NativeHeap {
    pub(crate) fn new() -> NativeHeap {
        NativeHeap {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Register a fresh zeroed payload of `size` bytes.
    pub fn allocate(&mut self, size: usize, finalizer: Option<Finalizer>) -> NativeRef {
        self.manage(vec![0; size], finalizer)
    }

    /// Register an existing payload, taking ownership of its bytes.
    pub fn manage(&mut self, data: Vec<u8>, finalizer: Option<Finalizer>) -> NativeRef {
        let item = NativeItem {
            data: data.into_boxed_slice(),
            finalizer,
            marked: false,
        };
        let index = if let Some(i) = self.free.pop() {
            self.items[i] = Some(item);
            i
        } else {
            self.items.push(Some(item));
            self.items.len() - 1
        };
        NativeRef(index)
    }

    pub fn bytes(&self, r: NativeRef) -> &[u8] {
        &self.items[r.0].as_ref().expect("stale native handle").data
    }

    pub fn bytes_mut(&mut self, r: NativeRef) -> &mut [u8] {
        &mut self.items[r.0].as_mut().expect("stale native handle").data
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear_marks(&mut self) {
        for item in self.items.iter_mut().flatten() {
            item.marked = false;
        }
    }

    pub(crate) fn mark(&mut self, index: usize) {
        if let Some(item) = self.items.get_mut(index).and_then(|i| i.as_mut()) {
            item.marked = true;
        }
    }

    /// Finalize and drop every unmarked item.
    pub(crate) fn sweep(&mut self) {
        for i in 0..self.items.len() {
            let dead = matches!(&self.items[i], Some(item) if !item.marked);
            if dead {
                let mut item = self.items[i].take().expect("checked above");
                if let Some(mut f) = item.finalizer.take() {
                    f(&mut item.data);
                }
                self.free.push(i);
            }
        }
    }

    /// Finalize and drop everything; used at machine teardown.
    pub(crate) fn finalize_all(&mut self) {
        for i in 0..self.items.len() {
            if let Some(mut item) = self.items[i].take() {
                if let Some(mut f) = item.finalizer.take() {
                    f(&mut item.data);
                }
                self.free.push(i);
            }
        }
    }
}

impl fmt::Debug for NativeHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHeap")
            .field("live", &self.len())
            .field("slots", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_allocate_is_zeroed_and_writable() {
        let mut heap = NativeHeap::new();
        let r = heap.allocate(16, None);
        assert!(heap.bytes(r).iter().all(|&b| b == 0));
        heap.bytes_mut(r)[3] = 0x7f;
        assert_eq!(heap.bytes(r)[3], 0x7f);
    }

    #[test]
    fn test_manage_takes_bytes() {
        let mut heap = NativeHeap::new();
        let r = heap.manage(vec![1, 2, 3], None);
        assert_eq!(heap.bytes(r), &[1, 2, 3]);
    }

    #[test]
    fn test_sweep_finalizes_unmarked_only() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut heap = NativeHeap::new();
        let f1 = fired.clone();
        let kept = heap.allocate(4, Some(Box::new(move |_| {
            f1.fetch_add(1, Ordering::SeqCst);
        })));
        let f2 = fired.clone();
        let _dead = heap.allocate(4, Some(Box::new(move |_| {
            f2.fetch_add(10, Ordering::SeqCst);
        })));
        heap.clear_marks();
        heap.mark(kept.0);
        heap.sweep();
        assert_eq!(fired.load(Ordering::SeqCst), 10);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.bytes(kept).len(), 4);
    }

    #[test]
    fn test_finalize_all() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut heap = NativeHeap::new();
        for _ in 0..3 {
            let f = fired.clone();
            heap.allocate(1, Some(Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })));
        }
        heap.finalize_all();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_slots_are_reused() {
        let mut heap = NativeHeap::new();
        let a = heap.allocate(1, None);
        heap.clear_marks();
        heap.sweep();
        let b = heap.allocate(1, None);
        assert_eq!(a.0, b.0);
    }
}
