// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Shared anonymous mappings
//!
//! Workers are forked, so the only memory they share with the supervisor
//! and with each other is memory mapped `MAP_SHARED | MAP_ANONYMOUS` before
//! the fork. [`SharedMapping`] owns one such region; [`Shared`] places a
//! single typed value at its start.
//!
//! Values stored in a [`Shared`] are observed by several processes at once,
//! so they must only be mutated through atomics or other interior-mutable
//! types that tolerate concurrent access.
//!
//!```
//!     use std::sync::atomic::{AtomicU32, Ordering};
//!     use stress_harness::Shared;
//!
//!     #[derive(Default)]
//!     struct Pinned {
//!         cpu: AtomicU32,
//!     }
//!
//!     let pinned = Shared::<Pinned>::new().unwrap();
//!     pinned.cpu.store(3, Ordering::Relaxed);
//!     assert_eq!(pinned.cpu.load(Ordering::Relaxed), 3);
//!```

use crate::HarnessError;
use crate::Result;
use nix::errno::Errno;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

lazy_static! {
    pub static ref PAGE_SIZE: usize = {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    };
}

/// Round `len` up to a whole number of pages. Zero rounds up to one page.
pub fn page_align(len: usize) -> usize {
    let page = *PAGE_SIZE;
    len.max(1).div_ceil(page) * page
}

/// An anonymous `MAP_SHARED` region, zero-filled on creation and unmapped on
/// drop. A forked child inherits the mapping; dropping the parent's handle
/// only unmaps it from the parent.
#[derive(Debug)]
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain memory; what is stored in it decides whether
// concurrent access is sound.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    pub fn new(len: usize) -> Result<Self> {
        let len = page_align(len);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(HarnessError::resource("shared mapping", Errno::last()));
        }
        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => Ok(Self { ptr, len }),
            None => Err(HarnessError::resource("shared mapping", Errno::EFAULT)),
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped length in bytes, always a multiple of the page size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// One `T` living in its own shared mapping.
pub struct Shared<T: Sync> {
    map: SharedMapping,
    _marker: PhantomData<T>,
}

impl<T: Default + Sync> Shared<T> {
    pub fn new() -> Result<Self> {
        Self::with_value(T::default())
    }
}

impl<T: Sync> Shared<T> {
    pub fn with_value(value: T) -> Result<Self> {
        debug_assert!(std::mem::align_of::<T>() <= *PAGE_SIZE);
        let map = SharedMapping::new(std::mem::size_of::<T>())?;
        unsafe {
            std::ptr::write(map.as_ptr() as *mut T, value);
        }
        Ok(Self {
            map,
            _marker: PhantomData,
        })
    }

    pub fn mapping(&self) -> &SharedMapping {
        &self.map
    }
}

impl<T: Sync> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*(self.map.as_ptr() as *const T) }
    }
}

impl<T: Sync> Drop for Shared<T> {
    fn drop(&mut self) {
        unsafe {
            std::ptr::drop_in_place(self.map.as_ptr() as *mut T);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_page_align() {
        let page = *PAGE_SIZE;
        assert_eq!(page_align(0), page);
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn test_mapping_is_zeroed() {
        let map = SharedMapping::new(100).unwrap();
        assert_eq!(map.len(), *PAGE_SIZE);
        let bytes = unsafe { std::slice::from_raw_parts(map.as_ptr(), map.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_shared_visible_across_fork() {
        let shared = Shared::<AtomicU64>::new().unwrap();
        match unsafe { nix::unistd::fork() }.unwrap() {
            nix::unistd::ForkResult::Child => {
                shared.store(42, Ordering::Relaxed);
                unsafe { libc::_exit(0) };
            }
            nix::unistd::ForkResult::Parent { child } => {
                nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(shared.load(Ordering::Relaxed), 42);
            }
        }
    }
}
