//! userfaultfd, mremap and madvise as provided by Linux.
use std::{io, os::unix::io::RawFd, ptr::null_mut};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;

use super::{AdviseKind, Capabilities, FaultEvent, Kernel, RegisterMode, SigbusHandler};
use crate::{
    error::{Error, IoctlError, Result},
    globals::page_size,
    util::mmap::madvise,
};

const UFFD_API: u64 = 0xaa;
const UFFD_USER_MODE_ONLY: libc::c_int = 1;

const UFFD_FEATURE_MISSING_SHMEM: u64 = 1 << 5;
const UFFD_FEATURE_SIGBUS: u64 = 1 << 7;
const UFFD_FEATURE_MINOR_SHMEM: u64 = 1 << 10;
const FEATURES_FOR_MINOR_FAULT: u64 = UFFD_FEATURE_MISSING_SHMEM | UFFD_FEATURE_MINOR_SHMEM;

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1;
const UFFDIO_REGISTER_MODE_MINOR: u64 = 1 << 2;

const UFFD_EVENT_PAGEFAULT: u8 = 0x12;
const UFFD_PAGEFAULT_FLAG_MINOR: u64 = 1 << 2;

const UFFDIO_API: libc::c_ulong = 0xc018_aa3f;
const UFFDIO_REGISTER: libc::c_ulong = 0xc020_aa00;
const UFFDIO_UNREGISTER: libc::c_ulong = 0x8010_aa01;
const UFFDIO_WAKE: libc::c_ulong = 0x8010_aa02;
const UFFDIO_COPY: libc::c_ulong = 0xc028_aa03;
const UFFDIO_ZEROPAGE: libc::c_ulong = 0xc020_aa04;
const UFFDIO_CONTINUE: libc::c_ulong = 0xc020_aa07;

const MREMAP_DONTUNMAP: libc::c_int = 4;
const MAP_FIXED_NOREPLACE: libc::c_int = 0x10_0000;
const BUS_ADRERR: libc::c_int = 2;

#[repr(C)]
#[derive(Default)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioZeropage {
    range: UffdioRange,
    mode: u64,
    zeropage: i64,
}

#[repr(C)]
#[derive(Default)]
struct UffdioContinue {
    range: UffdioRange,
    mode: u64,
    mapped: i64,
}

/// `struct uffd_msg`, reduced to the page-fault view.
#[repr(C)]
#[derive(Default)]
struct UffdMsg {
    event: u8,
    reserved1: u8,
    reserved2: u16,
    reserved3: u32,
    flags: u64,
    address: u64,
    ptid: u32,
    reserved4: u32,
}

fn open_uffd() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_userfaultfd,
            libc::O_CLOEXEC | UFFD_USER_MODE_ONLY,
        )
    };
    if fd >= 0 {
        return Ok(fd as RawFd);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINVAL) {
        return Err(err);
    }
    // Kernels without the user-mode-only restriction.
    let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, libc::O_CLOEXEC) };
    if fd >= 0 {
        Ok(fd as RawFd)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn api_handshake(fd: RawFd, features: u64) -> io::Result<u64> {
    let mut api = UffdioApi {
        api: UFFD_API,
        features,
        ioctls: 0,
    };
    if unsafe { libc::ioctl(fd, UFFDIO_API, &mut api) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(api.features)
}

fn have_mremap_dontunmap() -> bool {
    let page = page_size();
    unsafe {
        let old = libc::mmap(
            null_mut(),
            page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_SHARED,
            -1,
            0,
        );
        if old == libc::MAP_FAILED {
            return false;
        }
        let addr = libc::mremap(old, page, page, libc::MREMAP_MAYMOVE | MREMAP_DONTUNMAP);
        libc::munmap(old, page);
        if addr == libc::MAP_FAILED {
            false
        } else {
            libc::munmap(addr, page);
            true
        }
    }
}

fn kernel_version() -> Option<(u32, u32)> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release: String = uts
        .release
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8 as char)
        .collect();
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn probe() -> Capabilities {
    let version = kernel_version().unwrap_or((0, 0));
    let mremap_dontunmap = version >= (5, 13) || have_mremap_dontunmap();
    let mut caps = Capabilities {
        mremap_dontunmap,
        fault_retry: version >= (5, 7),
        ..Capabilities::none()
    };
    if !mremap_dontunmap {
        return caps;
    }
    let fd = match open_uffd() {
        Ok(fd) => fd,
        Err(err) => {
            log::warn!(
                "userfaultfd isn't supported (reason: {}), compaction will stop the world",
                err
            );
            return caps;
        }
    };
    // Asking for no features reports every feature the kernel has.
    if let Ok(features) = api_handshake(fd, 0) {
        caps.uffd = true;
        caps.sigbus = features & UFFD_FEATURE_SIGBUS != 0;
        caps.minor_fault = features & FEATURES_FOR_MINOR_FAULT == FEATURES_FOR_MINOR_FAULT;
    }
    unsafe {
        libc::close(fd);
    }
    caps
}

/// What this machine's kernel offers. Probed on first use.
pub static CAPABILITIES: Lazy<Capabilities> = Lazy::new(probe);

static SIGBUS_HANDLER: RwLock<Option<SigbusHandler>> = parking_lot::const_rwlock(None);
static SIGBUS_INSTALLED: OnceCell<()> = OnceCell::new();

extern "C" fn on_sigbus(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let handled = unsafe {
        if (*info).si_code != BUS_ADRERR {
            false
        } else {
            let addr = (*info).si_addr() as usize;
            match SIGBUS_HANDLER.try_read() {
                Some(handler) => handler.as_ref().map(|h| h(addr)).unwrap_or(false),
                None => false,
            }
        }
    };
    if !handled {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
}

pub struct LinuxKernel {
    caps: Capabilities,
    fd: RawFd,
}

impl LinuxKernel {
    pub fn new(caps: Capabilities) -> Result<Self> {
        if !caps.uffd {
            return Err(Error::UffdUnavailable("kernel lacks userfaultfd".to_string()));
        }
        let fd = open_uffd().map_err(|err| Error::UffdUnavailable(err.to_string()))?;
        let mut features = 0;
        if caps.sigbus {
            features |= UFFD_FEATURE_SIGBUS;
        }
        if caps.minor_fault {
            features |= FEATURES_FOR_MINOR_FAULT;
        }
        if let Err(err) = api_handshake(fd, features) {
            unsafe {
                libc::close(fd);
            }
            return Err(Error::UffdUnavailable(format!("UFFDIO_API: {}", err)));
        }
        Ok(Self { caps, fd })
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        if unsafe { libc::ioctl(self.fd, request, arg as *mut T) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn mremap_fixed(&self, from: usize, to: usize, len: usize) -> Result<()> {
        let mut flags = libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED;
        if self.caps.mremap_dontunmap {
            flags |= MREMAP_DONTUNMAP;
        }
        let ret = unsafe { libc::mremap(from as *mut _, len, len, flags, to as *mut libc::c_void) };
        if ret != to as *mut libc::c_void {
            return Err(Error::syscall("mremap", from, len));
        }
        Ok(())
    }

    fn mmap_fixed(&self, addr: usize, len: usize, flags: libc::c_int) -> Result<()> {
        let ret = unsafe {
            libc::mmap(
                addr as *mut _,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret != addr as *mut libc::c_void {
            return Err(Error::syscall("mmap", addr, len));
        }
        Ok(())
    }
}

impl Drop for LinuxKernel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn ioctl_error(progress: i64) -> IoctlError {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let progress = progress.max(0) as usize;
    match errno {
        libc::EAGAIN => IoctlError::Again(progress),
        libc::EEXIST => IoctlError::Exists(progress),
        libc::ENOENT => IoctlError::NoEnt,
        errno => IoctlError::Errno(errno),
    }
}

impl Kernel for LinuxKernel {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn move_pages(&self, src: usize, dst: usize, len: usize, alias: Option<usize>) -> Result<()> {
        self.mremap_fixed(src, dst, len)?;
        match alias {
            // A shared mapping that stays behind already aliases its new home.
            Some(alias) if alias == dst => Ok(()),
            Some(alias) => self.mremap_fixed(alias, src, len),
            None if !self.caps.mremap_dontunmap => {
                self.mmap_fixed(src, len, libc::MAP_PRIVATE | MAP_FIXED_NOREPLACE)
            }
            None => Ok(()),
        }
    }

    fn remap_shared(&self, addr: usize, len: usize) -> Result<()> {
        self.mmap_fixed(addr, len, libc::MAP_SHARED | libc::MAP_FIXED)
    }

    fn register(&self, begin: usize, len: usize, mode: RegisterMode) -> Result<()> {
        let mut reg = UffdioRegister {
            range: UffdioRange {
                start: begin as u64,
                len: len as u64,
            },
            mode: match mode {
                RegisterMode::Missing => UFFDIO_REGISTER_MODE_MISSING,
                RegisterMode::Minor => UFFDIO_REGISTER_MODE_MISSING | UFFDIO_REGISTER_MODE_MINOR,
            },
            ioctls: 0,
        };
        self.ioctl(UFFDIO_REGISTER, &mut reg)
            .map_err(|source| Error::Syscall {
                op: "UFFDIO_REGISTER",
                begin,
                end: begin + len,
                source,
            })
    }

    fn unregister(&self, begin: usize, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start: begin as u64,
            len: len as u64,
        };
        self.ioctl(UFFDIO_UNREGISTER, &mut range)
            .map_err(|source| Error::Syscall {
                op: "UFFDIO_UNREGISTER",
                begin,
                end: begin + len,
                source,
            })?;
        // Unregistering only wakes waiters of missing faults.
        if self.caps.minor_fault {
            self.wake(begin, len)?;
        }
        Ok(())
    }

    fn copy(&self, dst: usize, src: usize, len: usize) -> std::result::Result<(), IoctlError> {
        let mut copy = UffdioCopy {
            dst: dst as u64,
            src: src as u64,
            len: len as u64,
            mode: 0,
            copy: 0,
        };
        match self.ioctl(UFFDIO_COPY, &mut copy) {
            Ok(()) => Ok(()),
            Err(_) => Err(ioctl_error(copy.copy)),
        }
    }

    fn zeropage(&self, dst: usize, len: usize) -> std::result::Result<(), IoctlError> {
        let mut zero = UffdioZeropage {
            range: UffdioRange {
                start: dst as u64,
                len: len as u64,
            },
            ..Default::default()
        };
        match self.ioctl(UFFDIO_ZEROPAGE, &mut zero) {
            Ok(()) => Ok(()),
            Err(_) => Err(ioctl_error(zero.zeropage)),
        }
    }

    fn install_minor(&self, dst: usize, len: usize) -> std::result::Result<(), IoctlError> {
        let mut cont = UffdioContinue {
            range: UffdioRange {
                start: dst as u64,
                len: len as u64,
            },
            ..Default::default()
        };
        match self.ioctl(UFFDIO_CONTINUE, &mut cont) {
            Ok(()) => Ok(()),
            Err(_) => Err(ioctl_error(cont.mapped)),
        }
    }

    fn wake(&self, begin: usize, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start: begin as u64,
            len: len as u64,
        };
        self.ioctl(UFFDIO_WAKE, &mut range)
            .map_err(|source| Error::Syscall {
                op: "UFFDIO_WAKE",
                begin,
                end: begin + len,
                source,
            })
    }

    fn read_fault(&self) -> Result<FaultEvent> {
        let mut msg = UffdMsg::default();
        let size = std::mem::size_of::<UffdMsg>();
        loop {
            let nread =
                unsafe { libc::read(self.fd, &mut msg as *mut UffdMsg as *mut libc::c_void, size) };
            if nread < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Syscall {
                    op: "read(userfaultfd)",
                    begin: 0,
                    end: 0,
                    source: err,
                });
            }
            crate::gc_check!(
                nread as usize == size && msg.event == UFFD_EVENT_PAGEFAULT,
                "unexpected userfaultfd event {} ({} bytes)",
                msg.event,
                nread
            );
            return Ok(FaultEvent {
                addr: msg.address as usize,
                minor: msg.flags & UFFD_PAGEFAULT_FLAG_MINOR != 0,
            });
        }
    }

    fn advise(&self, begin: usize, len: usize, kind: AdviseKind) -> Result<()> {
        let advice = match kind {
            AdviseKind::DontNeed => libc::MADV_DONTNEED,
            AdviseKind::Remove => libc::MADV_REMOVE,
        };
        madvise(begin, len, advice)
    }

    fn touch(&self, _addr: usize) {}

    fn install_sigbus_handler(&self, handler: Option<SigbusHandler>) {
        *SIGBUS_HANDLER.write() = handler;
        SIGBUS_INSTALLED.get_or_init(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_sigbus as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGBUS, &action, null_mut()) != 0 {
                log::error!("failed to install SIGBUS handler: {}", io::Error::last_os_error());
            }
        });
    }
}
