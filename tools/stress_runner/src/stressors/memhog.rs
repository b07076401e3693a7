// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Maps and dirties anonymous memory until a byte budget is reached, then
//! gives it all back. Workers volunteer for the OOM killer and are replaced
//! when it takes them.

use anyhow::bail;
use anyhow::Result;
use log::trace;
use std::ptr::NonNull;
use stress_harness::ExitStatus;
use stress_harness::Help;
use stress_harness::OomPolicy;
use stress_harness::Respawn;
use stress_harness::Stressor;
use stress_harness::StressorArgs;
use stress_harness::StressorClass;
use stress_harness::WorkerBody;
use stress_harness::WorkerContext;

const DEFAULT_BYTES: usize = 64 << 20;
const CHUNK_BYTES: usize = 1 << 20;

const HELP: &[Help] = &[Help {
    opt: "memhog-bytes=N",
    description: "bytes each worker maps and touches per round (default 64M)",
}];

pub struct Memhog;

/// A private anonymous mapping, unmapped on drop.
struct Chunk {
    ptr: NonNull<u8>,
    len: usize,
}

impl Chunk {
    fn map(len: usize) -> Option<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr as *mut u8).map(|ptr| Self { ptr, len })
    }

    /// Write one byte per page so every page is really backed.
    fn touch(&mut self, page_size: usize, val: u8) {
        for off in (0..self.len).step_by(page_size) {
            unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(off), val) };
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

struct MemhogBody {
    bytes: usize,
}

impl WorkerBody for MemhogBody {
    fn run(&self, ctx: &mut WorkerContext) -> ExitStatus {
        let page_size = ctx.page_size();
        let mut chunks = Vec::with_capacity(self.bytes.div_ceil(CHUNK_BYTES));
        let mut mapped = 0;

        while mapped < self.bytes && ctx.keep_stressing() {
            let len = CHUNK_BYTES.min(self.bytes - mapped);
            let Some(mut chunk) = Chunk::map(len) else {
                trace!("{}: mmap of {} bytes failed after {}", ctx.name(), len, mapped);
                break;
            };
            chunk.touch(page_size, ctx.counter() as u8);
            mapped += len;
            chunks.push(chunk);
            ctx.inc();
        }
        ExitStatus::Success
    }
}

impl Stressor for Memhog {
    fn name(&self) -> &'static str {
        "memhog"
    }

    fn class(&self) -> StressorClass {
        StressorClass::MEMORY | StressorClass::VM
    }

    fn help(&self) -> &'static [Help] {
        HELP
    }

    fn respawn(&self) -> Respawn {
        Respawn::OnOomKill
    }

    fn oom_policy(&self) -> Option<OomPolicy> {
        Some(OomPolicy::QUIET.union(OomPolicy::DROP_CAP))
    }

    fn prepare(&self, args: &StressorArgs) -> Result<Box<dyn WorkerBody>> {
        let bytes = args.setting::<usize>("memhog-bytes")?.unwrap_or(DEFAULT_BYTES);
        if bytes == 0 {
            bail!("memhog-bytes must be greater than zero");
        }
        Ok(Box::new(MemhogBody { bytes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_touch() {
        let page_size = *stress_harness::PAGE_SIZE;
        let mut chunk = Chunk::map(4 * page_size).unwrap();
        chunk.touch(page_size, 0xa5);
        let first = unsafe { *chunk.ptr.as_ptr() };
        let last = unsafe { *chunk.ptr.as_ptr().add(3 * page_size) };
        assert_eq!((first, last), (0xa5, 0xa5));
    }

    #[test]
    fn test_zero_bytes_rejected() {
        let args = StressorArgs::new("memhog").with_setting("memhog-bytes", "0");
        assert!(Memhog.prepare(&args).is_err());
    }
}
