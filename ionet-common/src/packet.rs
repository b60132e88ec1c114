use core::{marker::PhantomData, mem, ptr};

/// A read would have gone past the end of the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfBounds;

/// Checked view over the bytes of one packet.
///
/// Every access goes through [`PacketReader::check`], which compares the
/// requested range against the packet end before any pointer is formed. The
/// comparison is written against the raw `data` / `data_end` addresses so the
/// kernel verifier can follow it.
#[derive(Clone, Copy)]
pub struct PacketReader<'a> {
    start: usize,
    end: usize,
    _packet: PhantomData<&'a [u8]>,
}

impl<'a> PacketReader<'a> {
    pub fn new(packet: &'a [u8]) -> Self {
        let start = packet.as_ptr() as usize;
        Self {
            start,
            end: start + packet.len(),
            _packet: PhantomData,
        }
    }

    /// Build a reader from the `data` / `data_end` pair of a socket buffer.
    ///
    /// # Safety
    ///
    /// `[start, end)` must be readable memory for the lifetime `'a`.
    #[inline(always)]
    pub unsafe fn from_raw(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            _packet: PhantomData,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Address of `offset`, provided `count` bytes starting there lie inside
    /// the packet.
    #[inline(always)]
    pub fn check(&self, offset: usize, count: usize) -> Result<usize, OutOfBounds> {
        let at = self.start + offset;
        if at + count > self.end {
            return Err(OutOfBounds);
        }
        Ok(at)
    }

    /// Pointer to a `T` at `offset`, bounds-checked for its full size.
    #[inline(always)]
    pub fn ptr_at<T>(&self, offset: usize) -> Result<*const T, OutOfBounds> {
        Ok(self.check(offset, mem::size_of::<T>())? as *const T)
    }

    /// Copy a `T` out of the packet. No alignment is assumed.
    #[inline(always)]
    pub fn read<T: Copy>(&self, offset: usize) -> Result<T, OutOfBounds> {
        let p = self.ptr_at::<T>(offset)?;
        // SAFETY: `ptr_at` checked that size_of::<T>() bytes at `p` are in the packet.
        Ok(unsafe { ptr::read_unaligned(p) })
    }

    #[inline(always)]
    pub fn u8_at(&self, offset: usize) -> Result<u8, OutOfBounds> {
        self.read::<u8>(offset)
    }

    /// Big-endian u16 converted to host order.
    #[inline(always)]
    pub fn be16_at(&self, offset: usize) -> Result<u16, OutOfBounds> {
        self.read::<u16>(offset).map(u16::from_be)
    }

    /// u32 left exactly as the bytes sit in the packet.
    #[inline(always)]
    pub fn raw32_at(&self, offset: usize) -> Result<u32, OutOfBounds> {
        self.read::<u32>(offset)
    }

    #[inline(always)]
    pub fn bytes_at<const N: usize>(&self, offset: usize) -> Result<[u8; N], OutOfBounds> {
        self.read::<[u8; N]>(offset)
    }
}
