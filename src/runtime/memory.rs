// src/runtime/memory.rs
//
// Sandboxed guest linear memory. A contiguous virtual range of
// `address_space_max` bytes (a power of two) is reserved PROT_NONE;
// `initial` bytes are committed at offset zero and grown with sbrk.
// Generated code masks every byte index into [0, address_space_max),
// so a wild guest address can only ever land inside the reservation.

use std::cell::Cell;

use crate::errors::LinkError;

/// Result of an out-of-range sbrk.
pub const SBRK_FAILURE: i32 = -1;

pub struct LinearMemory {
    base: *mut u8,
    address_space_max: usize,
    max_bytes: usize,
    committed: Cell<usize>,
}

// The base pointer is owned by this value for its whole life; guest
// execution is single-threaded.
unsafe impl Send for LinearMemory {}

impl LinearMemory {
    /// Reserve address space for a guest with the given initial and
    /// maximum sizes and commit the initial bytes.
    pub fn new(initial_bytes: u64, max_bytes: u64) -> Result<Self, LinkError> {
        // The mask needs a power-of-two address space at least as
        // large as the maximum the module can grow to.
        let address_space_max = (max_bytes.max(4096) as usize).next_power_of_two();

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                address_space_max,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(LinkError::Finalize(format!(
                "couldn't reserve {} bytes of guest address space",
                address_space_max
            )));
        }

        let memory = Self {
            base: base as *mut u8,
            address_space_max,
            max_bytes: max_bytes as usize,
            committed: Cell::new(0),
        };

        if initial_bytes > 0 && memory.sbrk(initial_bytes as i64) == SBRK_FAILURE as i64 {
            return Err(LinkError::Finalize(format!(
                "couldn't commit {} bytes of initial guest memory",
                initial_bytes
            )));
        }

        Ok(memory)
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Power-of-two size of the reserved (maskable) address range.
    pub fn address_space_max(&self) -> usize {
        self.address_space_max
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed.get()
    }

    /// Grow or shrink the committed region. Returns the previous end of
    /// committed memory, or -1 if the request leaves [0, max].
    pub fn sbrk(&self, delta: i64) -> i64 {
        let previous = self.committed.get() as i64;
        let new_end = previous + delta;
        if new_end < 0 || new_end as usize > self.max_bytes {
            return SBRK_FAILURE as i64;
        }
        if delta > 0 {
            let ok = unsafe {
                libc::mprotect(
                    self.base.add(previous as usize) as *mut libc::c_void,
                    delta as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if ok != 0 {
                return SBRK_FAILURE as i64;
            }
        } else if delta < 0 {
            unsafe {
                libc::mprotect(
                    self.base.add(new_end as usize) as *mut libc::c_void,
                    (-delta) as usize,
                    libc::PROT_NONE,
                );
            }
        }
        self.committed.set(new_end as usize);
        previous
    }

    /// Copy bytes into guest memory. The range must be committed.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<(), LinkError> {
        let end = address
            .checked_add(bytes.len() as u64)
            .filter(|&end| end <= self.committed.get() as u64);
        if end.is_none() {
            return Err(LinkError::Finalize(format!(
                "data segment [{}, {}+{}) exceeds committed guest memory",
                address,
                address,
                bytes.len()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(address as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Bounds-checked view of guest memory for host intrinsics. Guest
    /// pointers are integer offsets; anything outside the committed
    /// region is rejected, never dereferenced.
    pub fn slice(&self, address: u32, len: u32) -> Option<&[u8]> {
        let end = (address as usize).checked_add(len as usize)?;
        if end > self.committed.get() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.base.add(address as usize), len as usize) })
    }

    /// Bounds-checked mutable view of guest memory.
    ///
    /// # Safety
    /// The caller must be the only accessor of the range for the
    /// duration of the borrow. Guest execution is single-threaded, so
    /// host intrinsics running inside a guest call satisfy this.
    pub unsafe fn slice_mut(&self, address: u32, len: u32) -> Option<&mut [u8]> {
        let end = (address as usize).checked_add(len as usize)?;
        if end > self.committed.get() {
            return None;
        }
        Some(unsafe {
            std::slice::from_raw_parts_mut(self.base.add(address as usize), len as usize)
        })
    }

    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let bytes = self.slice(address, 4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Option<()> {
        let bytes = unsafe { self.slice_mut(address, 4)? };
        bytes.copy_from_slice(&value.to_le_bytes());
        Some(())
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.address_space_max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_is_a_power_of_two_covering_max() {
        let memory = LinearMemory::new(1024, 100_000).unwrap();
        assert!(memory.address_space_max().is_power_of_two());
        assert!(memory.address_space_max() >= 100_000);
    }

    #[test]
    fn sbrk_returns_previous_end() {
        let memory = LinearMemory::new(0, 1 << 20).unwrap();
        assert_eq!(memory.sbrk(4096), 0);
        assert_eq!(memory.sbrk(4096), 4096);
        assert_eq!(memory.committed_bytes(), 8192);
    }

    #[test]
    fn sbrk_out_of_range_returns_sentinel() {
        let memory = LinearMemory::new(0, 8192).unwrap();
        assert_eq!(memory.sbrk(1 << 30), SBRK_FAILURE as i64);
        assert_eq!(memory.sbrk(-1), SBRK_FAILURE as i64);
    }

    #[test]
    fn committed_memory_reads_and_writes() {
        let memory = LinearMemory::new(4096, 4096).unwrap();
        memory.write(10, b"abc").unwrap();
        assert_eq!(memory.slice(10, 3).unwrap(), b"abc");
        // Committed memory starts zeroed.
        assert_eq!(memory.slice(0, 4).unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn out_of_bounds_slices_are_rejected() {
        let memory = LinearMemory::new(4096, 4096).unwrap();
        assert!(memory.slice(4095, 2).is_none());
        assert!(memory.slice(u32::MAX, 2).is_none());
    }

    #[test]
    fn data_segment_past_committed_is_rejected() {
        let memory = LinearMemory::new(4, 4096).unwrap();
        assert!(memory.write(2, b"abc").is_err());
    }
}
