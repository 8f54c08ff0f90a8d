use crate::BufferHandle;

/// Buffers linked into the descriptor list, in capture order.
///
/// The links mirror the hardware list but are kept as arena indices.
pub(crate) struct PendingChain<const N: usize> {
    head: Option<BufferHandle>,
    tail: Option<BufferHandle>,
    next: [Option<BufferHandle>; N],
    len: usize,
}

impl<const N: usize> PendingChain<N> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            next: [None; N],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<BufferHandle> {
        self.head
    }

    pub fn back(&self) -> Option<BufferHandle> {
        self.tail
    }

    pub fn push_back(&mut self, handle: BufferHandle) {
        debug_assert!(self.next[handle.index()].is_none());
        match self.tail {
            Some(tail) => self.next[tail.index()] = Some(handle),
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<BufferHandle> {
        let head = self.head?;
        self.head = self.next[head.index()].take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    pub fn iter(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        core::iter::successors(self.head, |h| self.next[h.index()])
    }
}
