//! Everything the collector asks of the operating system: moving mappings out of the way,
//! registering ranges for fault interception, installing finished pages and releasing memory.
//!
//! [`LinuxKernel`](linux::LinuxKernel) talks to userfaultfd directly. [`EmulatedKernel`](emulated::EmulatedKernel)
//! models the same contract in process and is what runs where userfaultfd is not available.
pub mod emulated;
pub mod linux;

use std::sync::Arc;

use crate::{
    error::{IoctlError, OrFatal, Result},
    globals::page_size,
};

/// What faults a registered range reports.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterMode {
    /// Faults on pages that have no backing at all.
    Missing,
    /// Additionally faults on pages whose backing exists (through an alias) but is not mapped
    /// at the faulting address yet.
    Minor,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AdviseKind {
    /// Drop private pages. They read back as zero (or fault, if registered).
    DontNeed,
    /// Punch a hole in shared backing memory.
    Remove,
}

/// A page fault reported on a registered range.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FaultEvent {
    pub addr: usize,
    pub minor: bool,
}

/// Called on the faulting thread in SIGBUS mode. Returns false if the address is not one the
/// collector knows how to resolve.
pub type SigbusHandler = Arc<dyn Fn(usize) -> bool + Send + Sync>;

/// What the kernel under the collector can do. Computed once per backend and never changed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Capabilities {
    pub mremap_dontunmap: bool,
    pub uffd: bool,
    /// Faults on registered ranges can be delivered as SIGBUS to the faulting thread.
    pub sigbus: bool,
    /// Minor faults on shared anonymous memory.
    pub minor_fault: bool,
    /// A thread woken with `UFFDIO_WAKE` retries its access instead of failing it.
    pub fault_retry: bool,
}

impl Capabilities {
    /// No fault interception at all. Only stop-the-world compaction is possible.
    pub const fn none() -> Self {
        Self {
            mremap_dontunmap: false,
            uffd: false,
            sigbus: false,
            minor_fault: false,
            fault_retry: false,
        }
    }

    pub const fn full() -> Self {
        Self {
            mremap_dontunmap: true,
            uffd: true,
            sigbus: true,
            minor_fault: true,
            fault_retry: true,
        }
    }
}

pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Moves the pages of `[src, src + len)` to `dst`, leaving `src` mapped but empty. With an
    /// `alias`, `src` is afterwards backed by the shared memory mapped at `alias`; its pages are
    /// then installed with [`Kernel::install_minor`].
    fn move_pages(&self, src: usize, dst: usize, len: usize, alias: Option<usize>) -> Result<()>;

    /// Replaces `[addr, addr + len)` with fresh shared anonymous memory.
    fn remap_shared(&self, addr: usize, len: usize) -> Result<()>;

    fn register(&self, begin: usize, len: usize, mode: RegisterMode) -> Result<()>;

    /// Stops intercepting faults on the range. Threads blocked on it are woken up.
    fn unregister(&self, begin: usize, len: usize) -> Result<()>;

    /// Atomically installs `len` bytes from `src` at the missing pages starting at `dst`.
    fn copy(&self, dst: usize, src: usize, len: usize) -> std::result::Result<(), IoctlError>;

    /// Installs zero pages at `[dst, dst + len)`.
    fn zeropage(&self, dst: usize, len: usize) -> std::result::Result<(), IoctlError>;

    /// Maps the already present alias pages of `[dst, dst + len)`.
    fn install_minor(&self, dst: usize, len: usize) -> std::result::Result<(), IoctlError>;

    /// Wakes threads blocked on a fault in the range without resolving it.
    fn wake(&self, begin: usize, len: usize) -> Result<()>;

    /// Blocks until a fault is reported on a registered range.
    fn read_fault(&self) -> Result<FaultEvent>;

    fn advise(&self, begin: usize, len: usize, kind: AdviseKind) -> Result<()>;

    /// Announces a mutator access to `addr`. Returns once the page can be read.
    ///
    /// Real hardware faults make this a no-op on Linux.
    fn touch(&self, addr: usize);

    fn install_sigbus_handler(&self, handler: Option<SigbusHandler>);
}

/// Installs `len` bytes, retrying after partial progress. `EEXIST`/`ENOENT` are only accepted
/// when the caller says so, anything else is fatal.
///
/// Returns the number of bytes this call installed.
pub fn copy_pages(
    kernel: &dyn Kernel,
    dst: usize,
    src: usize,
    len: usize,
    tolerate_enoent: bool,
) -> usize {
    let mut done = 0;
    while done < len {
        match kernel.copy(dst + done, src + done, len - done) {
            Ok(()) => return len,
            Err(IoctlError::Again(progress)) => {
                crate::gc_check!(
                    progress >= page_size(),
                    "UFFDIO_COPY at {:#x} made no progress",
                    dst + done
                );
                done += progress;
            }
            Err(IoctlError::NoEnt) if tolerate_enoent => return done,
            Err(err) => Err::<(), _>(err).or_fatal(&format!(
                "UFFDIO_COPY at {:#x} of {} bytes",
                dst + done,
                len - done
            )),
        }
    }
    done
}

pub fn zero_pages(
    kernel: &dyn Kernel,
    dst: usize,
    len: usize,
    tolerate_eexist: bool,
    tolerate_enoent: bool,
) {
    let mut done = 0;
    while done < len {
        match kernel.zeropage(dst + done, len - done) {
            Ok(()) => return,
            Err(IoctlError::Again(progress)) => {
                crate::gc_check!(
                    progress >= page_size(),
                    "UFFDIO_ZEROPAGE at {:#x} made no progress",
                    dst + done
                );
                done += progress;
            }
            Err(IoctlError::Exists(_)) if tolerate_eexist => return,
            Err(IoctlError::NoEnt) if tolerate_enoent => return,
            Err(err) => Err::<(), _>(err).or_fatal(&format!(
                "UFFDIO_ZEROPAGE at {:#x} of {} bytes",
                dst + done,
                len - done
            )),
        }
    }
}

pub fn continue_pages(kernel: &dyn Kernel, dst: usize, len: usize, tolerate_enoent: bool) {
    let mut done = 0;
    while done < len {
        match kernel.install_minor(dst + done, len - done) {
            Ok(()) => return,
            Err(IoctlError::Again(progress)) => {
                crate::gc_check!(
                    progress >= page_size(),
                    "UFFDIO_CONTINUE at {:#x} made no progress",
                    dst + done
                );
                done += progress;
            }
            // A page already mapped by a racing fault is exactly what we wanted.
            Err(IoctlError::Exists(progress)) => done += progress + page_size(),
            Err(IoctlError::NoEnt) if tolerate_enoent => return,
            Err(err) => Err::<(), _>(err).or_fatal(&format!(
                "UFFDIO_CONTINUE at {:#x} of {} bytes",
                dst + done,
                len - done
            )),
        }
    }
}

/// The backend used when nothing is configured: Linux if it offers userfaultfd, the in-process
/// model otherwise. Without `sigbus` faults are always delivered to fault workers.
pub fn default_kernel(sigbus: bool) -> Arc<dyn Kernel> {
    let mut caps = *linux::CAPABILITIES;
    caps.sigbus &= sigbus;
    if caps.uffd {
        match linux::LinuxKernel::new(caps) {
            Ok(kernel) => return Arc::new(kernel),
            Err(err) => log::warn!("{}; using the emulated kernel", err),
        }
    }
    Arc::new(emulated::EmulatedKernel::new(Capabilities {
        sigbus,
        ..Capabilities::full()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mmap::MemMap;

    #[test]
    fn copy_retries_after_partial_progress() {
        let kernel = emulated::EmulatedKernel::new(Capabilities::full());
        let page = page_size();
        let to = MemMap::map_anonymous("copy to", 4 * page).unwrap();
        let from = MemMap::map_anonymous("copy from", 4 * page).unwrap();
        unsafe {
            from.as_mut_ptr().write_bytes(0xab, 4 * page);
        }
        let scratch = MemMap::map_anonymous("copy scratch", 4 * page).unwrap();
        kernel
            .move_pages(to.begin(), scratch.begin(), 4 * page, None)
            .unwrap();
        kernel.register(to.begin(), 4 * page, RegisterMode::Missing).unwrap();
        kernel.inject_again(2);

        assert_eq!(copy_pages(&kernel, to.begin(), from.begin(), 4 * page, false), 4 * page);
        unsafe {
            assert_eq!(*to.as_mut_ptr().add(3 * page + 17), 0xab);
        }
        // Every page was installed exactly once.
        assert_eq!(kernel.installed_pages(), 4);
        zero_pages(&kernel, to.begin(), page, true, false);
    }
}
