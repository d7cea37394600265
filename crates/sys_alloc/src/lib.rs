use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system
/// page size. Reservation sizes should be aligned to this granularity.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// One contiguous range of reserved virtual address space.
///
/// A reservation holds address space only; no physical pages back it until a
/// sub-range is committed with [`Reservation::commit`]. Committed sub-ranges
/// can be returned to the OS with [`Reservation::uncommit`] while the address
/// range stays reserved. The whole range is released when the handle drops.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Reserves `len` bytes of virtual address space without committing any
    /// physical memory.
    ///
    /// `len` is rounded up to the allocation granularity.
    pub fn new(len: usize) -> io::Result<Reservation> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let gran = allocation_granularity();
        let len = len.div_ceil(gran) * gran;
        let inner = os::ReservationInner::reserve(len)?;
        Ok(Reservation { inner })
    }

    /// Returns a pointer to the start of the reserved range.
    ///
    /// Dereferencing any part of the range is only valid while that part is
    /// committed.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reserved range in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Commits physical memory for `[offset, offset + len)`.
    ///
    /// Both `offset` and `len` must be multiples of [`page_size`] and the
    /// range must lie inside the reservation. Committing an already-committed
    /// range is allowed and idempotent.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range is inside our own reservation.
        unsafe { self.inner.commit(offset, len) }
    }

    /// Returns the physical memory backing `[offset, offset + len)` to the OS.
    ///
    /// The address range stays reserved and may be committed again later.
    /// Contents are lost.
    ///
    /// # Safety
    ///
    /// Any pointer into the uncommitted range becomes invalid until the range
    /// is committed again; the caller must guarantee no live references into
    /// the range exist.
    pub unsafe fn uncommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: the range is inside our own reservation; caller guarantees
        // no live references into it.
        unsafe { self.inner.uncommit(offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let ps = page_size();
        if offset % ps != 0 || len % ps != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset and length must be page-aligned",
            ));
        }
        let in_bounds = offset
            .checked_add(len)
            .map(|end| end <= self.len())
            .unwrap_or(false);
        if len == 0 || !in_bounds {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside reservation",
            ));
        }
        Ok(())
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(
            ag & (ag - 1),
            0,
            "Allocation granularity should be power of 2"
        );
        assert!(ag >= page_size());
    }

    #[test]
    fn test_reserve_commit_write() {
        let ps = page_size();
        let rs = Reservation::new(4 * ps).expect("failed to reserve");
        assert!(!rs.ptr().is_null());
        assert!(rs.len() >= 4 * ps);
        assert_eq!(rs.ptr() as usize % ps, 0);

        rs.commit(0, ps).expect("failed to commit first page");
        unsafe {
            ptr::write_volatile(rs.ptr(), 42);
            assert_eq!(ptr::read_volatile(rs.ptr()), 42);
        }
    }

    #[test]
    fn test_commit_is_idempotent() {
        let ps = page_size();
        let rs = Reservation::new(2 * ps).expect("failed to reserve");

        rs.commit(0, ps).expect("first commit");
        unsafe { ptr::write_volatile(rs.ptr(), 7) };
        rs.commit(0, ps).expect("second commit of same range");
        unsafe {
            assert_eq!(
                ptr::read_volatile(rs.ptr()),
                7,
                "re-commit must not clobber committed contents"
            );
        }
    }

    #[test]
    fn test_uncommit_then_recommit() {
        let ps = page_size();
        let rs = Reservation::new(2 * ps).expect("failed to reserve");

        rs.commit(ps, ps).expect("commit second page");
        let p = unsafe { rs.ptr().add(ps) };
        unsafe { ptr::write_volatile(p, 99) };

        unsafe { rs.uncommit(ps, ps) }.expect("uncommit");
        rs.commit(ps, ps).expect("recommit");
        unsafe {
            assert_eq!(
                ptr::read_volatile(p),
                0,
                "recommitted pages must read as zero"
            );
        }
    }

    #[test]
    fn test_unaligned_range_rejected() {
        let ps = page_size();
        let rs = Reservation::new(2 * ps).expect("failed to reserve");

        assert!(rs.commit(1, ps).is_err(), "unaligned offset must fail");
        assert!(rs.commit(0, ps + 1).is_err(), "unaligned length must fail");
        assert!(rs.commit(0, 4 * ps).is_err(), "range past the end must fail");
        assert!(rs.commit(0, 0).is_err(), "empty range must fail");
    }
}
