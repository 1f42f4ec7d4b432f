// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An emulated multiprocessor for hosted tests.
//!
//! Every processor has its own tag-matched TLB. The data cache is virtually indexed and
//! write-back: a physical page can sit in several lines at once (one per cache color), which is
//! exactly the aliasing hazard the pmap layer has to manage. Main memory is allocated lazily.
//!
//! Which processor a thread runs as is thread-local state, see [`bind_current_thread`] and
//! [`run_on`]. Rendezvous requests run the action synchronously in the target's context.

use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::boxed::Box;
use std::collections::BTreeMap;
use std::sync::Arc;

use lock_api::{Mutex, RawMutex};

use crate::pte::PageTableEntry;
use crate::{Arch, Asid, CpuId, CpuMask, PhysicalAddress, PmapConfig, VirtualAddress};

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

/// Makes the calling thread act as processor `cpu` from now on.
pub fn bind_current_thread(cpu: CpuId) {
    CURRENT_CPU.with(|current| current.set(cpu.get()));
}

/// Runs `f` as processor `cpu`, restoring the previous processor afterwards.
pub fn run_on<T>(cpu: CpuId, f: impl FnOnce() -> T) -> T {
    struct Restore(usize);
    impl Drop for Restore {
        fn drop(&mut self) {
            CURRENT_CPU.with(|current| current.set(self.0));
        }
    }

    let _restore = Restore(CURRENT_CPU.with(|current| current.replace(cpu.get())));
    f()
}

/// A memory access that could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No translation for the address is loaded in the TLB.
    TlbMiss,
    /// The loaded translation is not valid.
    Invalid,
    /// A write hit a translation without the dirty bit.
    Modified,
}

/// The emulated machine. Cheap to clone, all clones share the same hardware.
pub struct Machine<R: RawMutex> {
    inner: Arc<Inner<R>>,
}

struct Inner<R: RawMutex> {
    page_size: usize,
    alias_mask: usize,
    config: PmapConfig,
    cpus: Box<[Mutex<R, Cpu>]>,
    running: AtomicU64,
    memory: Mutex<R, Memory>,
    dcache: Mutex<R, DataCache>,
    rendezvous: AtomicUsize,
}

#[derive(Debug, Default)]
struct Cpu {
    asid: u16,
    /// Translations keyed by page and tag. Global translations use tag zero.
    tlb: BTreeMap<(usize, u16), PageTableEntry>,
    full_flushes: usize,
    icache_invalidations: usize,
    icache_syncs: usize,
}

impl Cpu {
    fn lookup(&self, page: usize) -> Option<((usize, u16), PageTableEntry)> {
        [(page, self.asid), (page, 0)]
            .into_iter()
            .find_map(|key| Some((key, *self.tlb.get(&key)?)))
    }

    fn key(page: usize, asid: Asid, entry: PageTableEntry) -> (usize, u16) {
        if entry.is_global() {
            (page, 0)
        } else {
            (page, asid.get())
        }
    }
}

#[derive(Debug)]
struct Memory {
    page_size: usize,
    frames: BTreeMap<usize, Box<[u8]>>,
}

impl Memory {
    fn frame(&mut self, pa: PhysicalAddress) -> &mut [u8] {
        let page_size = self.page_size;
        self.frames
            .entry(pa.align_down(page_size).get())
            .or_insert_with(|| std::vec![0; page_size].into_boxed_slice())
    }
}

#[derive(Debug)]
struct Line {
    data: Box<[u8]>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct DataCache {
    /// Lines keyed by cache color and physical page.
    lines: BTreeMap<(usize, usize), Line>,
}

impl DataCache {
    fn line<'a>(&'a mut self, key: (usize, usize), memory: &mut Memory) -> &'a mut Line {
        self.lines.entry(key).or_insert_with(|| Line {
            data: memory.frame(PhysicalAddress::new(key.1)).to_vec().into_boxed_slice(),
            dirty: false,
        })
    }

    fn write_back(&mut self, key: (usize, usize), memory: &mut Memory) {
        if let Some(line) = self.lines.remove(&key)
            && line.dirty
        {
            memory
                .frame(PhysicalAddress::new(key.1))
                .copy_from_slice(&line.data);
        }
    }
}

impl<R: RawMutex> Clone for Machine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RawMutex> fmt::Debug for Machine<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("cpus", &self.inner.cpus.len())
            .field("running", &CpuMask::from_bits(self.inner.running.load(Ordering::SeqCst)))
            .field("rendezvous", &self.inner.rendezvous.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<R: RawMutex> Machine<R> {
    pub fn new(config: &PmapConfig) -> Self {
        let cpus = (0..config.cpus())
            .map(|_| Mutex::new(Cpu::default()))
            .collect();

        Self {
            inner: Arc::new(Inner {
                page_size: config.page_size(),
                alias_mask: config.cache_alias_mask(),
                config: config.clone(),
                cpus,
                running: AtomicU64::new(CpuMask::first(config.cpus()).bits()),
                memory: Mutex::new(Memory {
                    page_size: config.page_size(),
                    frames: BTreeMap::new(),
                }),
                dcache: Mutex::new(DataCache::default()),
                rendezvous: AtomicUsize::new(0),
            }),
        }
    }

    fn current(&self) -> &Mutex<R, Cpu> {
        let cpu = CURRENT_CPU.with(Cell::get);
        self.inner
            .cpus
            .get(cpu)
            .unwrap_or_else(|| panic!("cpu #{cpu} does not exist"))
    }

    fn cpu(&self, cpu: CpuId) -> &Mutex<R, Cpu> {
        &self.inner.cpus[cpu.get()]
    }

    fn page(&self, va: VirtualAddress) -> usize {
        va.align_down(self.inner.page_size).get()
    }

    fn color(&self, va: VirtualAddress) -> usize {
        va.get() & self.inner.alias_mask
    }

    fn cache_key(&self, va: VirtualAddress, pa: PhysicalAddress) -> (usize, usize) {
        (self.color(va), pa.align_down(self.inner.page_size).get())
    }

    /// Marks `cpu` as running or stopped. Stopped processors are skipped by rendezvous.
    pub fn set_running(&self, cpu: CpuId, running: bool) {
        let bit = CpuMask::single(cpu).bits();
        if running {
            self.inner.running.fetch_or(bit, Ordering::SeqCst);
        } else {
            self.inner.running.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    /// Translation of `va` for `asid` currently loaded in `cpu`'s TLB.
    pub fn tlb_entry(&self, cpu: CpuId, va: VirtualAddress, asid: Asid) -> Option<PageTableEntry> {
        let page = self.page(va);
        let cpu = self.cpu(cpu).lock();
        [(page, asid.get()), (page, 0)]
            .into_iter()
            .find_map(|key| cpu.tlb.get(&key).copied())
    }

    /// Tag currently programmed on `cpu`.
    pub fn current_asid(&self, cpu: CpuId) -> Asid {
        let asid = self.cpu(cpu).lock().asid;
        Asid(core::num::NonZeroU16::new(asid))
    }

    /// Number of full TLB flushes `cpu` performed.
    pub fn full_flushes(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).lock().full_flushes
    }

    /// Number of instruction cache invalidations `cpu` performed.
    pub fn icache_invalidations(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).lock().icache_invalidations
    }

    /// Number of instruction cache synchronisations `cpu` performed.
    pub fn icache_syncs(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).lock().icache_syncs
    }

    /// Number of rendezvous requests issued so far.
    pub fn rendezvous_count(&self) -> usize {
        self.inner.rendezvous.load(Ordering::SeqCst)
    }

    /// Reads main memory, bypassing the data cache.
    pub fn read_physical(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        let offset = pa.offset_in(self.inner.page_size);
        let mut memory = self.inner.memory.lock();
        buf.copy_from_slice(&memory.frame(pa)[offset..offset + buf.len()]);
    }

    /// Writes main memory, bypassing the data cache.
    pub fn write_physical(&self, pa: PhysicalAddress, data: &[u8]) {
        let offset = pa.offset_in(self.inner.page_size);
        let mut memory = self.inner.memory.lock();
        memory.frame(pa)[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Translates `va` through the current processor's TLB.
    fn translate(&self, va: VirtualAddress, write: bool) -> Result<PageTableEntry, Fault> {
        let cpu = self.current().lock();
        let (_, entry) = cpu.lookup(self.page(va)).ok_or(Fault::TlbMiss)?;
        if !entry.is_valid() {
            return Err(Fault::Invalid);
        }
        if write && !entry.is_dirty() {
            return Err(Fault::Modified);
        }
        Ok(entry)
    }

    /// Stores `data` at `va` as the current processor would.
    pub fn store(&self, va: VirtualAddress, data: &[u8]) -> Result<(), Fault> {
        let offset = va.offset_in(self.inner.page_size);
        assert!(offset + data.len() <= self.inner.page_size, "store crosses a page");

        let entry = self.translate(va, true)?;
        let pa = entry.address().add(offset);
        if entry.is_cached() {
            self.cache_write(va, pa, data);
        } else {
            self.write_physical(pa, data);
        }
        Ok(())
    }

    /// Loads `buf.len()` bytes from `va` as the current processor would.
    pub fn load(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), Fault> {
        let offset = va.offset_in(self.inner.page_size);
        assert!(offset + buf.len() <= self.inner.page_size, "load crosses a page");

        let entry = self.translate(va, false)?;
        let pa = entry.address().add(offset);
        if entry.is_cached() {
            self.cache_read(va, pa, buf);
        } else {
            self.read_physical(pa, buf);
        }
        Ok(())
    }

    fn cache_write(&self, va: VirtualAddress, pa: PhysicalAddress, data: &[u8]) {
        let offset = pa.offset_in(self.inner.page_size);
        let mut memory = self.inner.memory.lock();
        let mut dcache = self.inner.dcache.lock();
        let line = dcache.line(self.cache_key(va, pa), &mut memory);
        line.data[offset..offset + data.len()].copy_from_slice(data);
        line.dirty = true;
    }

    fn cache_read(&self, va: VirtualAddress, pa: PhysicalAddress, buf: &mut [u8]) {
        let offset = pa.offset_in(self.inner.page_size);
        let mut memory = self.inner.memory.lock();
        let mut dcache = self.inner.dcache.lock();
        let line = dcache.line(self.cache_key(va, pa), &mut memory);
        buf.copy_from_slice(&line.data[offset..offset + buf.len()]);
    }

    fn direct_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        let Some(pa) = self.inner.config.direct_to_phys(va) else {
            panic!("{va} is not a direct-mapped address")
        };
        pa
    }

    fn pages(&self, va: VirtualAddress, len: usize) -> impl Iterator<Item = VirtualAddress> {
        let page_size = self.inner.page_size;
        let start = va.align_down(page_size);
        let end = va.add(len).align_up(page_size);
        (0..end.offset_from_unsigned(start) / page_size).map(move |n| start.add(n * page_size))
    }
}

impl<R: RawMutex + Send + Sync> Arch for Machine<R> {
    fn cpu_id(&self) -> CpuId {
        CpuId::new(CURRENT_CPU.with(Cell::get))
    }

    fn running_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.inner.running.load(Ordering::SeqCst))
    }

    fn set_asid(&self, asid: Asid) {
        self.current().lock().asid = asid.get();
    }

    fn tlb_invalidate(&self, va: VirtualAddress, asid: Asid) {
        let page = self.page(va);
        let mut cpu = self.current().lock();
        cpu.tlb.remove(&(page, asid.get()));
        cpu.tlb.remove(&(page, 0));
    }

    fn tlb_update(&self, va: VirtualAddress, asid: Asid, entry: PageTableEntry) {
        let page = self.page(va);
        let mut cpu = self.current().lock();
        let present = [(page, asid.get()), (page, 0)]
            .into_iter()
            .find(|key| cpu.tlb.contains_key(key));
        if let Some(key) = present {
            cpu.tlb.remove(&key);
            cpu.tlb.insert(Cpu::key(page, asid, entry), entry);
        }
    }

    fn tlb_load(&self, va: VirtualAddress, asid: Asid, entry: PageTableEntry) {
        let page = self.page(va);
        let mut cpu = self.current().lock();
        cpu.tlb.insert(Cpu::key(page, asid, entry), entry);
    }

    fn tlb_flush_all(&self) {
        let mut cpu = self.current().lock();
        cpu.tlb.clear();
        cpu.full_flushes += 1;
    }

    fn sync_dcache_page(&self, va: VirtualAddress, pa: PhysicalAddress) {
        let mut memory = self.inner.memory.lock();
        self.inner
            .dcache
            .lock()
            .write_back(self.cache_key(va, pa), &mut memory);
    }

    fn hit_sync_dcache_page(&self, va: VirtualAddress, pa: PhysicalAddress) {
        self.sync_dcache_page(va, pa);
    }

    fn hit_invalidate_dcache(&self, va: VirtualAddress, len: usize) {
        for page in self.pages(va, len) {
            let pa = match self.inner.config.direct_to_phys(page) {
                Some(pa) => pa,
                None => match self.current().lock().lookup(self.page(page)) {
                    Some((_, entry)) if entry.is_valid() => entry.address(),
                    _ => continue,
                },
            };
            self.inner.dcache.lock().lines.remove(&self.cache_key(page, pa));
        }
    }

    fn invalidate_icache(&self, _va: VirtualAddress, _len: usize) {
        self.current().lock().icache_invalidations += 1;
    }

    fn sync_icache(&self) {
        self.current().lock().icache_syncs += 1;
    }

    unsafe fn zero(&self, va: VirtualAddress, len: usize) {
        let page_size = self.inner.page_size;
        let zeroes = std::vec![0; page_size];
        for page in self.pages(va, len) {
            let start = core::cmp::max(page, va);
            let end = core::cmp::min(page.add(page_size), va.add(len));
            let chunk = end.offset_from_unsigned(start);
            self.cache_write(start, self.direct_to_phys(start), &zeroes[..chunk]);
        }
    }

    unsafe fn copy(&self, src: VirtualAddress, dst: VirtualAddress, len: usize) {
        let page_size = self.inner.page_size;
        let mut buf = std::vec![0; page_size];
        let mut done = 0;
        while done < len {
            let src = src.add(done);
            let dst = dst.add(done);
            let chunk = (len - done)
                .min(page_size - src.offset_in(page_size))
                .min(page_size - dst.offset_in(page_size));

            self.cache_read(src, self.direct_to_phys(src), &mut buf[..chunk]);
            self.cache_write(dst, self.direct_to_phys(dst), &buf[..chunk]);
            done += chunk;
        }
    }

    fn rendezvous(&self, targets: CpuMask, action: &(dyn Fn() + Sync)) {
        self.inner.rendezvous.fetch_add(1, Ordering::SeqCst);
        let running = self.running_cpus();
        for cpu in targets.iter() {
            if !running.contains(cpu) {
                log::warn!("rendezvous target {cpu} is not running");
                continue;
            }
            run_on(cpu, action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Machine = super::Machine<parking_lot::RawMutex>;

    const PA: PhysicalAddress = PhysicalAddress::new(0x7000);

    fn rw(pa: PhysicalAddress) -> PageTableEntry {
        PageTableEntry::read_write_page().with_address(pa)
    }

    #[test]
    fn tlb_is_tag_matched() {
        let machine = Machine::new(&PmapConfig::new("test"));
        let va = VirtualAddress::new(0x1000);
        let one = Asid::new(core::num::NonZeroU16::MIN);

        machine.tlb_load(va, one, rw(PA));
        assert_eq!(machine.store(va, &[1]), Err(Fault::TlbMiss));

        machine.set_asid(one);
        machine.store(va, &[1]).unwrap();

        machine.tlb_invalidate(va, one);
        assert_eq!(machine.store(va, &[1]), Err(Fault::TlbMiss));
    }

    #[test]
    fn update_only_rewrites_present_entries() {
        let machine = Machine::new(&PmapConfig::new("test"));
        let va = VirtualAddress::new(0x1000);

        machine.tlb_update(va, Asid::global(), rw(PA));
        assert!(machine.tlb_entry(CpuId::new(0), va, Asid::global()).is_none());

        machine.tlb_load(va, Asid::global(), PageTableEntry::read_only_page().with_address(PA));
        assert_eq!(machine.store(va, &[1]), Err(Fault::Modified));
        machine.tlb_update(va, Asid::global(), rw(PA));
        machine.store(va, &[1]).unwrap();
    }

    #[test]
    fn cached_writes_reach_memory_on_sync() {
        let machine = Machine::new(&PmapConfig::new("test"));
        let va = VirtualAddress::new(0x1000);
        machine.tlb_load(va, Asid::global(), rw(PA));

        machine.store(va.add(8), &[0xaa; 4]).unwrap();
        let mut buf = [0; 4];
        machine.read_physical(PA.add(8), &mut buf);
        assert_eq!(buf, [0; 4]);

        machine.sync_dcache_page(va, PA);
        machine.read_physical(PA.add(8), &mut buf);
        assert_eq!(buf, [0xaa; 4]);
    }

    #[test]
    fn aliased_lines_diverge() {
        let config = PmapConfig::new("test").with_cache_alias_mask(0x3000);
        let machine = Machine::new(&config);
        let a = VirtualAddress::new(0x1000);
        let b = VirtualAddress::new(0x2000);
        machine.tlb_load(a, Asid::global(), rw(PA));
        machine.tlb_load(b, Asid::global(), rw(PA));

        machine.store(a, &[1]).unwrap();
        let mut buf = [0];
        machine.load(b, &mut buf).unwrap();
        assert_eq!(buf, [0]);
    }

    #[test]
    fn rendezvous_runs_in_target_context() {
        let machine = Machine::new(&PmapConfig::new("test").with_cpus(3));
        machine.set_running(CpuId::new(2), false);

        let seen = std::sync::Mutex::new(std::vec::Vec::new());
        machine.rendezvous(CpuMask::first(3), &|| {
            seen.lock().unwrap().push(machine.cpu_id());
        });

        assert_eq!(*seen.lock().unwrap(), [CpuId::new(0), CpuId::new(1)]);
        assert_eq!(machine.cpu_id(), CpuId::new(0));
        assert_eq!(machine.rendezvous_count(), 1);
    }

    #[test]
    fn copy_goes_through_the_direct_map() {
        let config = PmapConfig::new("test");
        let machine = Machine::new(&config);
        let src = PhysicalAddress::new(0x1000);
        let dst = PhysicalAddress::new(0x2000);
        machine.write_physical(src, &[7; 16]);

        // Safety: the emulated direct map has no aliasing Rust references
        unsafe {
            machine.copy(config.phys_to_direct(src), config.phys_to_direct(dst), 4096);
        }
        machine.sync_dcache_page(config.phys_to_direct(dst), dst);

        let mut buf = [0; 16];
        machine.read_physical(dst, &mut buf);
        assert_eq!(buf, [7; 16]);
    }
}
