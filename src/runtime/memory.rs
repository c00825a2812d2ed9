//! Raw memory access for hook installation, behavior patches and image snapshots.
//!
//! All code and data writes into the hosting runtime go through [`MemoryAccess`] so that the
//! same hook, patch and snapshot logic can run against the live process
//! ([`ProcessMemory`]) or against an owned buffer placed at a chosen base address
//! ([`BufferMemory`]), e.g. an offline copy of a runtime module.

use std::cell::RefCell;

use crate::{
    file::io::{read_le, write_le},
    Error, Result,
};

#[cfg(windows)]
mod platform {
    use windows_sys::Win32::System::{
        Diagnostics::Debug::FlushInstructionCache,
        Memory::{
            VirtualAlloc, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
            MEM_FREE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
        },
        Threading::GetCurrentProcess,
    };

    /// Makes `[address, address + size)` writable, runs `write`, flushes the instruction
    /// cache for the range, then restores the previous protection.
    pub unsafe fn with_writable(address: usize, size: usize, write: impl FnOnce()) -> bool {
        let mut old_protect = 0;
        if unsafe {
            VirtualProtect(
                address as *const _,
                size,
                PAGE_EXECUTE_READWRITE,
                &mut old_protect,
            )
        } == 0
        {
            return false;
        }

        write();
        unsafe { FlushInstructionCache(GetCurrentProcess(), address as *const _, size) };

        let mut ignored = 0;
        unsafe { VirtualProtect(address as *const _, size, old_protect, &mut ignored) != 0 }
    }

    /// Commits `size` executable bytes at exactly `address` if that range is free.
    pub unsafe fn allocate_at(address: usize, size: usize) -> Option<usize> {
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let queried = unsafe {
            VirtualQuery(
                address as *const _,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if queried == 0 || info.State != MEM_FREE {
            return None;
        }

        let allocated = unsafe {
            VirtualAlloc(
                address as *const _,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        (allocated as usize == address).then_some(address)
    }
}

#[cfg(unix)]
mod platform {
    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    /// Protection of every mapping overlapping `[start, end)`, clipped to the range.
    ///
    /// `None` where the process maps are not exposed through procfs.
    pub fn protections(start: usize, end: usize) -> Option<Vec<(usize, usize, libc::c_int)>> {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        let mut ranges = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let (low, high) = fields.next()?.split_once('-')?;
            let low = usize::from_str_radix(low, 16).ok()?;
            let high = usize::from_str_radix(high, 16).ok()?;
            if high <= start || low >= end {
                continue;
            }

            let perms = fields.next()?.as_bytes();
            let mut protection = libc::PROT_NONE;
            if perms.first() == Some(&b'r') {
                protection |= libc::PROT_READ;
            }
            if perms.get(1) == Some(&b'w') {
                protection |= libc::PROT_WRITE;
            }
            if perms.get(2) == Some(&b'x') {
                protection |= libc::PROT_EXEC;
            }
            ranges.push((low.max(start), high.min(end), protection));
        }
        Some(ranges)
    }

    /// Makes the pages covering `[address, address + size)` writable, runs `write`, then
    /// restores the protection each page had before.
    ///
    /// Without procfs the previous protection is unknown and the pages stay
    /// read-write-execute.
    pub unsafe fn with_writable(address: usize, size: usize, write: impl FnOnce()) -> bool {
        let page = page_size();
        let start = address & !(page - 1);
        let end = (address + size + page - 1) & !(page - 1);
        let previous = protections(start, end);
        if unsafe {
            libc::mprotect(
                start as *mut _,
                end - start,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            )
        } != 0
        {
            return false;
        }

        write();

        previous.unwrap_or_default().into_iter().all(|(low, high, protection)| {
            unsafe { libc::mprotect(low as *mut _, high - low, protection) == 0 }
        })
    }

    /// Maps `size` executable bytes at exactly `address` if that range is free.
    pub unsafe fn allocate_at(address: usize, size: usize) -> Option<usize> {
        let mapped = unsafe {
            libc::mmap(
                address as *mut _,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return None;
        }
        if mapped as usize != address {
            unsafe { libc::munmap(mapped, size) };
            return None;
        }
        Some(address)
    }
}

/// Distance from a `rel32` operand within which [`MemoryAccess::allocate_near`] places
/// allocations.
pub const NEAR_RANGE: usize = 0x7FF0_0000;

const NEAR_STEP: usize = 0x1_0000;

/// Allocation-granular addresses around `near`, nearest first, alternating above and below.
fn near_candidates(near: usize) -> impl Iterator<Item = usize> {
    let base = near & !(NEAR_STEP - 1);
    (1..NEAR_RANGE / NEAR_STEP)
        .flat_map(move |step| {
            let distance = step * NEAR_STEP;
            [base.checked_add(distance), base.checked_sub(distance)]
        })
        .flatten()
        .filter(|candidate| *candidate != 0)
}

/// Byte-level access to an address space.
///
/// Writes take `&self`: the address space is shared with the runtime, so exclusive access
/// cannot be expressed through the borrow checker anyway.
pub trait MemoryAccess {
    /// Fills `buffer` with the bytes starting at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn read(&self, address: usize, buffer: &mut [u8]) -> Result<()>;

    /// Writes `data` at `address`, lifting page protection if necessary.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn write(&self, address: usize, data: &[u8]) -> Result<()>;

    /// Allocates `size` zeroed, executable bytes within [`NEAR_RANGE`] of `near`.
    ///
    /// Allocations live for the rest of the process.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if no free range is close enough.
    fn allocate_near(&self, near: usize, size: usize) -> Result<usize>;

    /// Reads `length` bytes starting at `address`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn read_vec(&self, address: usize, length: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        self.read(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Reads one byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the address is not accessible.
    fn read_u8(&self, address: usize) -> Result<u8> {
        let mut buffer = [0u8; 1];
        self.read(address, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a little-endian `i32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn read_i32(&self, address: usize) -> Result<i32> {
        let mut buffer = [0u8; 4];
        self.read(address, &mut buffer)?;
        read_le::<i32>(&buffer)
    }

    /// Writes a little-endian `i32`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn write_i32(&self, address: usize, value: i32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Reads a pointer of `pointer_size` bytes (4 or 8).
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn read_pointer(&self, address: usize, pointer_size: usize) -> Result<usize> {
        let mut buffer = [0u8; 8];
        self.read(address, &mut buffer[..pointer_size])?;
        Ok(read_le::<u64>(&buffer)? as usize)
    }

    /// Writes a pointer of `pointer_size` bytes (4 or 8).
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range is not accessible.
    fn write_pointer(&self, address: usize, pointer_size: usize, value: usize) -> Result<()> {
        let mut buffer = [0u8; 8];
        write_le(&mut buffer, value as u64)?;
        self.write(address, &buffer[..pointer_size])
    }
}

/// Direct access to the current process.
pub struct ProcessMemory {
    _private: (),
}

impl ProcessMemory {
    /// Creates an accessor for the current process.
    ///
    /// # Safety
    ///
    /// Every address later passed to [`MemoryAccess::read`] or [`MemoryAccess::write`] must be
    /// mapped for the full length of the access, and writes must not race with code executing
    /// the modified bytes.
    #[must_use]
    pub unsafe fn new() -> Self {
        ProcessMemory { _private: () }
    }
}

impl MemoryAccess for ProcessMemory {
    fn read(&self, address: usize, buffer: &mut [u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::Memory {
                address,
                message: "null address".to_string(),
            });
        }

        // SAFETY: the constructor's contract covers every address handed to this accessor.
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        if address == 0 {
            return Err(Error::Memory {
                address,
                message: "null address".to_string(),
            });
        }

        // SAFETY: the constructor's contract covers every address handed to this accessor.
        let written = unsafe {
            platform::with_writable(address, data.len(), || {
                std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
            })
        };

        if written {
            Ok(())
        } else {
            Err(Error::Memory {
                address,
                message: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    fn allocate_near(&self, near: usize, size: usize) -> Result<usize> {
        near_candidates(near)
            // SAFETY: only free ranges are taken and nothing else refers to them yet.
            .find_map(|candidate| unsafe { platform::allocate_at(candidate, size) })
            .ok_or_else(|| Error::Memory {
                address: near,
                message: format!("no free {size} bytes within rel32 range"),
            })
    }
}

struct Region {
    base: usize,
    bytes: Vec<u8>,
}

/// An address space made of owned buffers mapped at chosen base addresses.
#[derive(Default)]
pub struct BufferMemory {
    regions: RefCell<Vec<Region>>,
}

impl BufferMemory {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if the range overlaps an existing region.
    pub fn map(&self, base: usize, bytes: Vec<u8>) -> Result<()> {
        let end = base + bytes.len();
        let mut regions = self.regions.borrow_mut();
        if regions
            .iter()
            .any(|region| base < region.base + region.bytes.len() && region.base < end)
        {
            return Err(Error::Memory {
                address: base,
                message: "region overlaps an existing mapping".to_string(),
            });
        }

        regions.push(Region { base, bytes });
        Ok(())
    }

    fn with_region<T>(
        &self,
        address: usize,
        length: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T> {
        let mut regions = self.regions.borrow_mut();
        let region = regions.iter_mut().find(|region| {
            address >= region.base && address + length <= region.base + region.bytes.len()
        });

        match region {
            Some(region) => {
                let start = address - region.base;
                Ok(f(&mut region.bytes[start..start + length]))
            }
            None => Err(Error::Memory {
                address,
                message: format!("{length} bytes are not mapped"),
            }),
        }
    }
}

impl MemoryAccess for BufferMemory {
    fn read(&self, address: usize, buffer: &mut [u8]) -> Result<()> {
        self.with_region(address, buffer.len(), |bytes| buffer.copy_from_slice(bytes))
    }

    fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        self.with_region(address, data.len(), |bytes| bytes.copy_from_slice(data))
    }

    fn allocate_near(&self, near: usize, size: usize) -> Result<usize> {
        near_candidates(near)
            .find(|candidate| self.map(*candidate, vec![0u8; size]).is_ok())
            .ok_or_else(|| Error::Memory {
                address: near,
                message: format!("no free {size} bytes within rel32 range"),
            })
    }
}
