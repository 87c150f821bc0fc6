//! Locked plaintext buffers.
//!
//! A [`LockedBuffer`] is the only place decrypted bytes are directly
//! addressable.  The layout is
//!
//! ```text
//! | guard page | canary fill … data | guard page |
//! ```
//!
//! The inner pages are `mlock`ed (never swapped) and excluded from core
//! dumps.  Data is right-aligned against the trailing guard page so an
//! overrun faults immediately; the slack before it is filled with a
//! process-wide random canary that is verified when the buffer is dropped.
//! Dropping zeroes the inner pages before unmapping — in Rust the drop is
//! the single destruction point, so a double-destroy is unrepresentable.

use std::slice;
use std::sync::OnceLock;

use rand::RngCore;
use zeroize::Zeroize;

use crate::error::MemoryError;

const CANARY_LEN: usize = 16;

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no side effects.
    (unsafe { libc::sysconf(libc::_SC_PAGESIZE) }) as usize
}

/// Process-wide canary pattern, generated once.
fn canary() -> &'static [u8; CANARY_LEN] {
    static CANARY: OnceLock<[u8; CANARY_LEN]> = OnceLock::new();
    CANARY.get_or_init(|| {
        let mut c = [0u8; CANARY_LEN];
        rand::thread_rng().fill_bytes(&mut c);
        c
    })
}

/// Zero an arbitrary caller-owned slice using volatile writes.
pub fn wipe(bytes: &mut [u8]) {
    bytes.zeroize();
}

/// An mlocked, guard-paged region holding plaintext.
///
/// Not `Sync`: a buffer has a single owner, though its `bytes()` view may
/// be read until the buffer is dropped.
pub struct LockedBuffer {
    base: *mut u8,
    total: usize,
    data: *mut u8,
    len: usize,
}

// The buffer owns its mapping exclusively; moving it between threads is
// safe, shared mutation is not offered.
unsafe impl Send for LockedBuffer {}

impl LockedBuffer {
    /// Map and lock a new zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        let page = page_size();
        let inner = (CANARY_LEN + len).div_ceil(page).max(1) * page;
        let total = inner + 2 * page;

        // SAFETY: anonymous private mapping; the result is checked below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::Map(std::io::Error::last_os_error()));
        }
        let base = base.cast::<u8>();

        // SAFETY: every range below lies within the mapping created above.
        unsafe {
            if libc::mprotect(base.cast(), page, libc::PROT_NONE) != 0
                || libc::mprotect(base.add(page + inner).cast(), page, libc::PROT_NONE) != 0
            {
                let err = std::io::Error::last_os_error();
                libc::munmap(base.cast(), total);
                return Err(MemoryError::Protect(err));
            }
            if libc::mlock(base.add(page).cast(), inner) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(base.cast(), total);
                return Err(MemoryError::Lock(err));
            }
            // Best-effort: keep the locked pages out of core dumps.
            libc::madvise(base.add(page).cast(), inner, libc::MADV_DONTDUMP);
        }

        let data = unsafe { base.add(page + inner - len) };
        let pattern = canary();
        // SAFETY: the prefix range is the writable slack before `data`.
        unsafe {
            let prefix = slice::from_raw_parts_mut(base.add(page), inner - len);
            for (i, b) in prefix.iter_mut().enumerate() {
                *b = pattern[i % CANARY_LEN];
            }
        }

        Ok(Self { base, total, data, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The plaintext view.  Valid until the buffer is dropped.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: data..data+len lies inside the live, readable mapping.
        unsafe { slice::from_raw_parts(self.data, self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.data, self.len) }
    }

    /// The plaintext as UTF-8.
    pub fn as_str(&self) -> Result<&str, MemoryError> {
        std::str::from_utf8(self.bytes()).map_err(|_| MemoryError::NotUtf8)
    }

    /// Explicitly destroy the buffer: verify the canary, zero, unmap.
    ///
    /// Equivalent to dropping; provided so call sites can mark the point
    /// where plaintext ceases to exist.
    pub fn destroy(self) {}
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        let page = page_size();
        let inner = self.total - 2 * page;
        let pattern = canary();
        // SAFETY: the mapping is live until the munmap at the end; the
        // prefix and inner ranges are the ones initialised in `new`.
        unsafe {
            let prefix = slice::from_raw_parts(self.base.add(page), inner - self.len);
            let intact = prefix
                .iter()
                .enumerate()
                .all(|(i, b)| *b == pattern[i % CANARY_LEN]);
            if !intact {
                // An underflow wrote over the canary: secrets may have been
                // smeared into unknown memory.  Nothing sane left to do.
                tracing::error!("locked buffer canary check failed, aborting");
                std::process::abort();
            }

            slice::from_raw_parts_mut(self.base.add(page), inner).zeroize();
            libc::munlock(self.base.add(page).cast(), inner);
            libc::munmap(self.base.cast(), self.total);
        }
    }
}

impl std::fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let mut buf = LockedBuffer::new(11).unwrap();
        buf.bytes_mut().copy_from_slice(b"hello world");
        assert_eq!(buf.bytes(), b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.as_str().unwrap(), "hello world");
        buf.destroy();
    }

    #[test]
    fn zero_length_buffer() {
        let buf = LockedBuffer::new(0).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), b"");
    }

    #[test]
    fn page_sized_boundaries() {
        // Exercise lengths around the page size so the right-alignment
        // arithmetic is covered for single and multi page inner regions.
        for len in [1usize, 4095, 4096, 4097, 3 * 4096] {
            let mut buf = LockedBuffer::new(len).unwrap();
            buf.bytes_mut().fill(0xAB);
            assert!(buf.bytes().iter().all(|&b| b == 0xAB));
        }
    }

    #[test]
    fn fresh_buffer_is_zeroed() {
        let buf = LockedBuffer::new(64).unwrap();
        assert!(buf.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn non_utf8_reports_error() {
        let mut buf = LockedBuffer::new(2).unwrap();
        buf.bytes_mut().copy_from_slice(&[0xFF, 0xFE]);
        assert!(buf.as_str().is_err());
    }

    #[test]
    fn wipe_zeroes_slice() {
        let mut data = vec![0x41u8; 32];
        wipe(&mut data);
        assert!(data.iter().all(|&b| b == 0));
    }
}
