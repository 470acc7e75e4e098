use netmap_sys::{netmap_ring, netmap_slot};

/// A netmap ring in the shared-memory region of an open [`Port`].
///
/// The pointer stays valid while the port is open; holders must not
/// outlive it.
///
/// [`Port`]: crate::Port
pub struct RawRing {
    inner: *mut netmap_ring,
    index: usize,
}

unsafe impl Send for RawRing {}

/// Mutable fields of one slot plus its buffer.
pub struct SlotRef<'a> {
    pub buf: &'a mut [u8],
    pub len: &'a mut u16,
    pub flags: &'a mut u16,
    pub ptr: &'a mut u64,
}

impl RawRing {
    /// # Safety
    /// `inner` must point to a mapped `netmap_ring` that outlives the value.
    pub unsafe fn from_raw(inner: *mut netmap_ring, index: usize) -> Self {
        Self { inner, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn num_slots(&self) -> u32 {
        unsafe { (*self.inner).num_slots }
    }

    #[inline(always)]
    pub fn buf_size(&self) -> usize {
        unsafe { (*self.inner).nr_buf_size as usize }
    }

    #[inline(always)]
    pub fn cur(&self) -> u32 {
        unsafe { (*self.inner).cur }
    }

    #[inline(always)]
    pub fn head(&self) -> u32 {
        unsafe { (*self.inner).head }
    }

    #[inline(always)]
    pub fn tail(&self) -> u32 {
        unsafe { std::ptr::read_volatile(&raw const (*self.inner).tail) }
    }

    #[inline(always)]
    pub fn next(&self, i: u32) -> u32 {
        if i + 1 == self.num_slots() { 0 } else { i + 1 }
    }

    /// Slots between `cur` and `tail`.
    #[inline(always)]
    pub fn space(&self) -> u32 {
        let (cur, tail) = (self.cur(), self.tail());
        if tail >= cur {
            tail - cur
        } else {
            tail + self.num_slots() - cur
        }
    }

    /// Whether the kernel still has slots of this TX ring to send.
    #[inline(always)]
    pub fn tx_pending(&self) -> bool {
        self.next(self.tail()) != self.head()
    }

    /// Moves `head` and `cur` forward by `n` slots.
    #[inline(always)]
    pub fn advance(&mut self, n: u32) {
        let to = (self.cur() + n) % self.num_slots();
        unsafe {
            (*self.inner).head = to;
            (*self.inner).cur = to;
        }
    }

    #[inline(always)]
    fn raw_slot(&self, idx: u32) -> *mut netmap_slot {
        assert!(idx < self.num_slots(), "slot {idx} out of range");
        unsafe { (*self.inner).slot.as_mut_ptr().add(idx as usize) }
    }

    /// The slot at `idx` with its current buffer.
    pub fn slot(&mut self, idx: u32) -> SlotRef<'_> {
        let slot = self.raw_slot(idx);
        unsafe {
            let ring = self.inner as *mut u8;
            let size = self.buf_size();
            let buf = ring
                .offset((*self.inner).buf_ofs as isize)
                .add((*slot).buf_idx as usize * size);
            SlotRef {
                buf: std::slice::from_raw_parts_mut(buf, size),
                len: &mut (*slot).len,
                flags: &mut (*slot).flags,
                ptr: &mut (*slot).ptr,
            }
        }
    }
}
