//! Host backing store for guest RAM
//!
//! On unix the arena is an anonymous mapping with an inaccessible guard region
//! after the RAM window, so host code that runs past the end faults instead of
//! touching unrelated memory. Elsewhere it falls back to a heap allocation.

use std::ptr::NonNull;

use gk_core::error::MemoryError;

use crate::constants::{GUARD_SIZE, PAGE_SIZE};

enum Storage {
    #[cfg(unix)]
    Mapped { mapping_len: usize },
    Heap(#[allow(dead_code)] Vec<u8>),
}

/// Guard-paged RAM arena
pub struct FastmemArena {
    ptr: NonNull<u8>,
    len: usize,
    storage: Storage,
}

// SAFETY: the arena exclusively owns its mapping; shared access only hands
// out `&[u8]` and mutation requires `&mut self`.
unsafe impl Send for FastmemArena {}
unsafe impl Sync for FastmemArena {}

impl FastmemArena {
    /// Reserve a zero-filled arena of `len` bytes
    pub fn new(len: usize) -> Result<Self, MemoryError> {
        if len == 0 || len % PAGE_SIZE as usize != 0 {
            return Err(MemoryError::ArenaAllocation(format!(
                "size 0x{len:x} is not a non-zero multiple of the page size"
            )));
        }

        #[cfg(unix)]
        {
            match Self::map_guarded(len) {
                Ok(arena) => return Ok(arena),
                Err(err) => {
                    tracing::warn!("Guarded RAM mapping failed ({}), using heap arena", err);
                }
            }
        }

        Ok(Self::heap(len))
    }

    #[cfg(unix)]
    fn map_guarded(len: usize) -> Result<Self, MemoryError> {
        let mapping_len = len + GUARD_SIZE;
        // SAFETY: anonymous private mapping with no address hint; the result
        // is checked against MAP_FAILED before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::ArenaAllocation(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        // SAFETY: [base, base + len) lies inside the mapping created above.
        let rc = unsafe { libc::mprotect(base, len, libc::PROT_READ | libc::PROT_WRITE) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: unmapping the region we just mapped.
            unsafe { libc::munmap(base, mapping_len) };
            return Err(MemoryError::ArenaAllocation(err.to_string()));
        }

        let ptr = NonNull::new(base as *mut u8)
            .ok_or_else(|| MemoryError::ArenaAllocation("mmap returned null".into()))?;
        Ok(Self {
            ptr,
            len,
            storage: Storage::Mapped { mapping_len },
        })
    }

    fn heap(len: usize) -> Self {
        let mut buf = vec![0u8; len];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            storage: Storage::Heap(buf),
        }
    }

    /// Size of the RAM window
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length arena (never constructed)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when a guard region follows the RAM window
    pub fn is_guarded(&self) -> bool {
        match self.storage {
            #[cfg(unix)]
            Storage::Mapped { .. } => true,
            Storage::Heap(_) => false,
        }
    }

    /// Host address of the RAM window
    pub fn host_base(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// RAM contents
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len readable bytes for the arena lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable RAM contents
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len writable bytes and `&mut self` makes
        // the borrow unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Zero the whole RAM window
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for FastmemArena {
    fn drop(&mut self) {
        match self.storage {
            #[cfg(unix)]
            Storage::Mapped { mapping_len } => {
                // SAFETY: the mapping was created by `map_guarded` with this length.
                unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, mapping_len) };
            }
            Storage::Heap(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_zero_filled() {
        let arena = FastmemArena::new(0x10_0000).unwrap();
        assert_eq!(arena.len(), 0x10_0000);
        assert!(arena.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_arena_read_write() {
        let mut arena = FastmemArena::new(0x1000).unwrap();
        arena.as_mut_slice()[0xFFF] = 0xAB;
        assert_eq!(arena.as_slice()[0xFFF], 0xAB);
        arena.clear();
        assert_eq!(arena.as_slice()[0xFFF], 0);
    }

    #[test]
    fn test_arena_rejects_bad_size() {
        assert!(FastmemArena::new(0).is_err());
        assert!(FastmemArena::new(0x1234).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_arena_guarded_on_unix() {
        let arena = FastmemArena::new(0x2000).unwrap();
        assert!(arena.is_guarded());
    }
}
