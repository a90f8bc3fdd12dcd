//! In-process model of userfaultfd.
//!
//! Pages of registered ranges are either present or missing. Moving a range away or releasing
//! it makes its pages missing; the install calls make them present again. Mutators announce
//! their accesses with [`Kernel::touch`], which blocks (or runs the SIGBUS handler) exactly where
//! the real kernel would fault.
use ahash::{AHashMap, AHashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;

use super::{AdviseKind, Capabilities, FaultEvent, Kernel, RegisterMode, SigbusHandler};
use crate::{
    error::{Error, IoctlError, Result},
    globals::page_size,
    util::{align_down, backoff::PageBackoff, mmap::madvise, Region},
};

#[derive(Default)]
struct State {
    registrations: Vec<(Region, RegisterMode)>,
    missing: AHashSet<usize>,
    aliases: Vec<(Region, usize)>,
    faults: VecDeque<FaultEvent>,
    wakes: AHashMap<usize, u64>,
    again_budget: usize,
    installed: usize,
    released: Vec<Region>,
}

impl State {
    fn registration(&self, page: usize) -> Option<RegisterMode> {
        self.registrations
            .iter()
            .find(|(region, _)| region.contains(page))
            .map(|(_, mode)| *mode)
    }

    fn faults_on(&self, page: usize) -> bool {
        self.registration(page).is_some() && self.missing.contains(&page)
    }

    fn alias_of(&self, page: usize) -> Option<usize> {
        self.aliases
            .iter()
            .find(|(region, _)| region.contains(page))
            .map(|(region, alias)| alias + (page - region.begin))
    }

    fn drop_registrations(&mut self, range: Region) {
        let mut kept = Vec::with_capacity(self.registrations.len() + 1);
        for (region, mode) in self.registrations.drain(..) {
            if region.end <= range.begin || region.begin >= range.end {
                kept.push((region, mode));
                continue;
            }
            if region.begin < range.begin {
                kept.push((Region::new(region.begin, range.begin), mode));
            }
            if region.end > range.end {
                kept.push((Region::new(range.end, region.end), mode));
            }
        }
        self.registrations = kept;
    }

    fn unregister(&mut self, range: Region) {
        self.drop_registrations(range);
        // Aliased pages share their backing, so whatever the alias holds shows through.
        let page_len = page_size();
        let exposed: Vec<(usize, usize)> = self
            .missing
            .iter()
            .filter(|page| range.contains(**page))
            .filter_map(|page| self.alias_of(*page).map(|alias| (*page, alias)))
            .collect();
        for (page, alias) in exposed {
            unsafe {
                std::ptr::copy_nonoverlapping(alias as *const u8, page as *mut u8, page_len);
            }
        }
        self.missing.retain(|page| !range.contains(*page));
    }

    /// Runs `install` on every page of `[dst, dst + len)`, stopping at the first page that
    /// cannot be installed.
    fn install_range(
        &mut self,
        dst: usize,
        len: usize,
        mut install: impl FnMut(&Self, usize, usize) -> std::result::Result<(), IoctlError>,
    ) -> std::result::Result<(), IoctlError> {
        let page = page_size();
        let mut done = 0;
        while done < len {
            let addr = dst + done;
            if self.registration(addr).is_none() {
                return Err(if done == 0 {
                    IoctlError::NoEnt
                } else {
                    IoctlError::Again(done)
                });
            }
            if !self.missing.contains(&addr) {
                return Err(IoctlError::Exists(done));
            }
            if done > 0 && self.again_budget > 0 {
                self.again_budget -= 1;
                return Err(IoctlError::Again(done));
            }
            install(self, addr, done)?;
            self.missing.remove(&addr);
            self.installed += 1;
            done += page;
        }
        Ok(())
    }
}

pub struct EmulatedKernel {
    caps: Capabilities,
    state: Mutex<State>,
    cond: Condvar,
    sigbus: RwLock<Option<SigbusHandler>>,
}

impl EmulatedKernel {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            sigbus: RwLock::new(None),
        }
    }

    /// Makes the next `count` multi-page installs stop after their first page with `EAGAIN`,
    /// the way contention on the mmap lock does.
    pub fn inject_again(&self, count: usize) {
        self.state.lock().again_budget += count;
    }

    pub fn installed_pages(&self) -> usize {
        self.state.lock().installed
    }

    /// Every range released with [`Kernel::advise`] so far.
    pub fn released(&self) -> Vec<Region> {
        self.state.lock().released.clone()
    }

    pub fn is_missing(&self, addr: usize) -> bool {
        let state = self.state.lock();
        state.faults_on(align_down(addr, page_size()))
    }

    pub fn pending_faults(&self) -> usize {
        self.state.lock().faults.len()
    }

    fn touch_with_handler(&self, addr: usize, page: usize, handler: SigbusHandler) {
        let mut backoff = PageBackoff::new();
        loop {
            if !handler(addr) {
                crate::gc_fatal!("unhandled SIGBUS at {:#x}", addr);
            }
            if !self.state.lock().faults_on(page) {
                return;
            }
            backoff.wait();
        }
    }
}

fn release(begin: usize, len: usize, kind: AdviseKind) -> Result<()> {
    match kind {
        AdviseKind::DontNeed => madvise(begin, len, libc::MADV_DONTNEED),
        // Private memory has no hole to punch.
        AdviseKind::Remove => madvise(begin, len, libc::MADV_REMOVE)
            .or_else(|_| madvise(begin, len, libc::MADV_DONTNEED)),
    }
}

impl Kernel for EmulatedKernel {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn move_pages(&self, src: usize, dst: usize, len: usize, alias: Option<usize>) -> Result<()> {
        let page = page_size();
        let mut state = self.state.lock();
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, len);
        }
        release(src, len, AdviseKind::Remove)?;
        let range = Region::new(src, src + len);
        let target = Region::new(dst, dst + len);
        state.missing.retain(|p| !target.contains(*p));
        let mut addr = src;
        while addr < range.end {
            state.missing.insert(addr);
            addr += page;
        }
        state
            .aliases
            .retain(|(region, _)| region.end <= range.begin || region.begin >= range.end);
        if let Some(alias) = alias {
            state.aliases.push((range, alias));
        }
        Ok(())
    }

    fn remap_shared(&self, addr: usize, len: usize) -> Result<()> {
        let _state = self.state.lock();
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0, len);
        }
        Ok(())
    }

    fn register(&self, begin: usize, len: usize, mode: RegisterMode) -> Result<()> {
        if !self.caps.uffd {
            return Err(Error::UffdUnavailable(
                "emulated kernel configured without userfaultfd".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let range = Region::new(begin, begin + len);
        // Registration keeps the current presence of every page.
        let missing: Vec<usize> = state
            .missing
            .iter()
            .copied()
            .filter(|page| range.contains(*page))
            .collect();
        state.drop_registrations(range);
        state.missing.extend(missing);
        state.registrations.push((range, mode));
        Ok(())
    }

    fn unregister(&self, begin: usize, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.unregister(Region::new(begin, begin + len));
        self.cond.notify_all();
        Ok(())
    }

    fn copy(&self, dst: usize, src: usize, len: usize) -> std::result::Result<(), IoctlError> {
        let page = page_size();
        let mut state = self.state.lock();
        let result = state.install_range(dst, len, |_, addr, done| {
            unsafe {
                std::ptr::copy_nonoverlapping((src + done) as *const u8, addr as *mut u8, page);
            }
            Ok(())
        });
        self.cond.notify_all();
        result
    }

    fn zeropage(&self, dst: usize, len: usize) -> std::result::Result<(), IoctlError> {
        let page = page_size();
        let mut state = self.state.lock();
        let result = state.install_range(dst, len, |_, addr, _| {
            unsafe {
                std::ptr::write_bytes(addr as *mut u8, 0, page);
            }
            Ok(())
        });
        self.cond.notify_all();
        result
    }

    fn install_minor(&self, dst: usize, len: usize) -> std::result::Result<(), IoctlError> {
        let page = page_size();
        let mut state = self.state.lock();
        let result = state.install_range(dst, len, |state, addr, _| {
            let alias = state.alias_of(addr).ok_or(IoctlError::Errno(libc::EINVAL))?;
            unsafe {
                std::ptr::copy_nonoverlapping(alias as *const u8, addr as *mut u8, page);
            }
            Ok(())
        });
        self.cond.notify_all();
        result
    }

    fn wake(&self, begin: usize, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        let mut addr = begin;
        while addr < begin + len {
            *state.wakes.entry(addr).or_insert(0) += 1;
            addr += page_size();
        }
        self.cond.notify_all();
        Ok(())
    }

    fn read_fault(&self) -> Result<FaultEvent> {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.faults.pop_front() {
                return Ok(event);
            }
            self.cond.wait(&mut state);
        }
    }

    fn advise(&self, begin: usize, len: usize, kind: AdviseKind) -> Result<()> {
        let page = page_size();
        let mut state = self.state.lock();
        release(begin, len, kind)?;
        let mut addr = begin;
        while addr < begin + len {
            if state.registration(addr).is_some() {
                state.missing.insert(addr);
            }
            addr += page;
        }
        state.released.push(Region::new(begin, begin + len));
        Ok(())
    }

    fn touch(&self, addr: usize) {
        let page = align_down(addr, page_size());
        let mut state = self.state.lock();
        if !state.faults_on(page) {
            return;
        }
        let handler = self.sigbus.read().clone();
        if let Some(handler) = handler {
            drop(state);
            self.touch_with_handler(addr, page, handler);
            return;
        }
        let mut queued_for = None;
        loop {
            if !state.faults_on(page) {
                return;
            }
            let wakes = state.wakes.get(&page).copied().unwrap_or(0);
            if queued_for != Some(wakes) {
                let minor = state.registration(page) == Some(RegisterMode::Minor)
                    && state.alias_of(page).is_some();
                state.faults.push_back(FaultEvent { addr, minor });
                queued_for = Some(wakes);
                self.cond.notify_all();
            }
            self.cond.wait(&mut state);
        }
    }

    fn install_sigbus_handler(&self, handler: Option<SigbusHandler>) {
        *self.sigbus.write() = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::mmap::MemMap;
    use std::sync::Arc;

    #[test]
    fn faults_block_until_installed() {
        let kernel = Arc::new(EmulatedKernel::new(Capabilities::full()));
        let page = page_size();
        let space = MemMap::map_anonymous("emulated space", 2 * page).unwrap();
        let from = MemMap::map_anonymous("emulated from", 2 * page).unwrap();
        unsafe { space.as_mut_ptr().write(42) };
        kernel.move_pages(space.begin(), from.begin(), 2 * page, None).unwrap();
        kernel.register(space.begin(), 2 * page, RegisterMode::Missing).unwrap();
        assert!(kernel.is_missing(space.begin()));
        assert_eq!(unsafe { from.as_mut_ptr().read() }, 42);

        let toucher = {
            let kernel = kernel.clone();
            let addr = space.begin() + 8;
            std::thread::spawn(move || kernel.touch(addr))
        };
        let event = kernel.read_fault().unwrap();
        assert_eq!(event.addr, space.begin() + 8);
        assert!(!event.minor);
        kernel.copy(space.begin(), from.begin(), page).unwrap();
        toucher.join().unwrap();
        assert_eq!(unsafe { space.as_mut_ptr().read() }, 42);
        assert_eq!(kernel.copy(space.begin(), from.begin(), page), Err(IoctlError::Exists(0)));

        kernel.unregister(space.begin(), 2 * page).unwrap();
        assert_eq!(kernel.zeropage(space.begin() + page, page), Err(IoctlError::NoEnt));
        // Unregistered pages never fault.
        kernel.touch(space.begin() + page);
    }

    #[test]
    fn minor_installs_copy_from_alias() {
        let kernel = EmulatedKernel::new(Capabilities::full());
        let page = page_size();
        let space = MemMap::map_anonymous("minor space", page).unwrap();
        let from = MemMap::map_anonymous("minor from", page).unwrap();
        let shadow = MemMap::map_shared_anonymous("minor shadow", page).unwrap();
        kernel
            .move_pages(space.begin(), from.begin(), page, Some(shadow.begin()))
            .unwrap();
        kernel.register(space.begin(), page, RegisterMode::Minor).unwrap();
        unsafe { shadow.as_mut_ptr().add(16).write(9) };
        kernel.install_minor(space.begin(), page).unwrap();
        assert_eq!(unsafe { space.as_mut_ptr().add(16).read() }, 9);
        assert!(!kernel.is_missing(space.begin()));
    }
}
