//! The simulator host: lifecycle state machine, the worker thread, the
//! breakpoint table, and the symbol map.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::csr;
use crate::memory::MemoryMap;
use crate::processor::{Processor, Trap};
use crate::program::{ElfImage, LoadError, Symbol, SymbolMap, ELF_EXTENSION};

/// Lifecycle states of the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SimState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Terminated = 3,
}

impl SimState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Terminated,
        }
    }
}

/// Atomic cell holding a [`SimState`]. Every lifecycle predicate, and the
/// worker's exit test, goes through acquire/release pairs on this cell.
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: SimState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> SimState {
        SimState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: SimState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: SimState, to: SimState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The machine proper: everything the worker owns while running.
pub struct Machine {
    pub memory: MemoryMap,
    pub processor: Processor,
}

/// Errors from the host control surface.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    #[error("executable already running")]
    AlreadyRunning,
}

/// Errors from the breakpoint table.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointError {
    /// The address already carries a breakpoint.
    #[error("breakpoint at address {addr:#x} already exists: breakpoint {existing}")]
    Duplicate { addr: u32, existing: u32 },
    /// No breakpoint carries this id.
    #[error("breakpoint number {0} not found")]
    NotFound(u32),
}

/// Host breakpoints, keyed by address. Ids start at 1, grow
/// monotonically, and are never reused within a session, even across
/// [`BreakpointTable::clear`].
#[derive(Debug, Default)]
pub struct BreakpointTable {
    by_addr: HashMap<u32, u32>,
    assigned: u32,
}

impl BreakpointTable {
    pub fn add(&mut self, addr: u32) -> Result<u32, BreakpointError> {
        if let Some(&existing) = self.by_addr.get(&addr) {
            return Err(BreakpointError::Duplicate { addr, existing });
        }
        self.assigned += 1;
        self.by_addr.insert(addr, self.assigned);
        Ok(self.assigned)
    }

    pub fn remove(&mut self, id: u32) -> Result<(), BreakpointError> {
        let addr = self
            .by_addr
            .iter()
            .find(|&(_, &num)| num == id)
            .map(|(&addr, _)| addr)
            .ok_or(BreakpointError::NotFound(id))?;
        self.by_addr.remove(&addr);
        Ok(())
    }

    /// Drops every breakpoint. The id counter is not reset.
    pub fn clear(&mut self) {
        self.by_addr.clear();
    }

    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<u32> {
        self.by_addr.get(&addr).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.by_addr.iter().map(|(&addr, &id)| (addr, id))
    }
}

/// Owns the assembled machine and drives the simulation lifecycle.
///
/// Exactly one worker thread exists while the state is `Running`. The
/// console side is expected to inspect the machine only while it is not;
/// the machine sits behind a mutex so even a contract violation stays
/// memory-safe. The worker is joined lazily: before the next `run`,
/// during `pause` and `reset`, and on drop.
pub struct SimHost {
    machine: Arc<Mutex<Machine>>,
    state: Arc<StateCell>,
    breakpoints: Arc<Mutex<BreakpointTable>>,
    symbols: SymbolMap,
    loaded_path: Option<PathBuf>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            machine: Arc::new(Mutex::new(Machine {
                memory: MemoryMap::default(),
                processor: Processor::new(),
            })),
            state: Arc::new(StateCell::new(SimState::Idle)),
            breakpoints: Arc::new(Mutex::new(BreakpointTable::default())),
            symbols: SymbolMap::default(),
            loaded_path: None,
            worker: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SimState {
        self.state.load()
    }

    /// Locks the machine for inspection or mutation.
    ///
    /// The console contract only permits this while the state is not
    /// `Running`; during a run the worker holds the lock for each step.
    pub fn machine(&self) -> MutexGuard<'_, Machine> {
        lock(&self.machine)
    }

    /// Loads an executable, replacing memory, processor state, and
    /// symbols. A running simulation is paused first.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), LoadError> {
        let path = path.as_ref();
        self.pause();

        if !path.exists() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }
        let extension = path.extension().and_then(OsStr::to_str).unwrap_or_default();
        if extension != ELF_EXTENSION {
            return Err(LoadError::UnsupportedFormat(extension.to_string()));
        }

        info!("loading executable {}", path.display());
        let image = ElfImage::new(std::fs::read(path)?)?;

        // one binary at a time: the previous image and symbols go away
        {
            let mut machine = lock(&self.machine);
            machine.memory.clear();
            machine.processor.reset();
            self.symbols.clear();
            image.load_into(&mut machine.memory, &mut self.symbols)?;
        }

        self.loaded_path = Some(path.to_path_buf());
        self.state.store(SimState::Idle);
        Ok(())
    }

    /// Path of the last loaded executable, kept to support [`SimHost::reset`].
    #[must_use]
    pub fn loaded_path(&self) -> Option<&Path> {
        self.loaded_path.as_deref()
    }

    /// Starts the worker. `max_instructions == 0` runs unbounded.
    pub fn run(&mut self, max_instructions: u64) -> Result<(), SimError> {
        if self.state.load() == SimState::Running {
            return Err(SimError::AlreadyRunning);
        }
        // a previous worker that stopped on its own still holds a handle
        self.reap_worker();

        debug!(max_instructions, "starting simulation worker");
        self.state.store(SimState::Running);
        let machine = Arc::clone(&self.machine);
        let state = Arc::clone(&self.state);
        let breakpoints = Arc::clone(&self.breakpoints);
        let handle =
            std::thread::spawn(move || run_worker(&machine, &state, &breakpoints, max_instructions));
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    /// Cooperatively stops a running worker and joins it. Safe to call
    /// from any thread and idempotent; pausing an idle or terminated
    /// simulation changes nothing.
    pub fn pause(&self) {
        if self.state.transition(SimState::Running, SimState::Paused) {
            info!("pausing simulation");
        }
        self.reap_worker();
    }

    /// Returns to `Idle`: clears memory, resets the processor, and
    /// reloads the last-loaded binary.
    pub fn reset(&mut self) -> Result<(), LoadError> {
        self.state.store(SimState::Idle);
        self.reap_worker();

        {
            let mut machine = self.machine();
            machine.memory.clear();
            machine.processor.reset();
        }
        self.symbols.clear();

        if let Some(path) = self.loaded_path.clone() {
            info!("reloading binary {}", path.display());
            self.load_file(path)?;
        }
        Ok(())
    }

    /// Registers a breakpoint and returns its id.
    pub fn add_breakpoint(&self, addr: u32) -> Result<u32, BreakpointError> {
        let id = lock(&self.breakpoints).add(addr)?;
        debug!(id, addr = format_args!("{addr:#010x}"), "breakpoint added");
        Ok(id)
    }

    /// Removes the breakpoint with the given id.
    pub fn remove_breakpoint(&self, id: u32) -> Result<(), BreakpointError> {
        lock(&self.breakpoints).remove(id)
    }

    /// Drops all breakpoints, keeping the id counter.
    pub fn clear_breakpoints(&self) {
        lock(&self.breakpoints).clear();
    }

    /// Snapshot of `(address, id)` pairs, ordered by id.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<(u32, u32)> {
        let mut all: Vec<_> = lock(&self.breakpoints).iter().collect();
        all.sort_by_key(|&(_, id)| id);
        all
    }

    /// The loaded executable's symbols.
    #[must_use]
    pub fn symbols(&self) -> &SymbolMap {
        &self.symbols
    }

    /// Looks up one symbol by name.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Enables the per-step instruction trace.
    pub fn set_verbose(&self, verbose: bool) {
        self.machine().processor.set_verbose(verbose);
    }

    fn reap_worker(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("simulation worker panicked");
            }
        }
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        self.pause();
    }
}

/// Locks a mutex, riding over poisoning: a panicking worker must not take
/// the console down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The worker loop: steps the processor until the state leaves `Running`,
/// checking the instruction budget, fatal and breakpoint traps, and host
/// breakpoints between steps.
fn run_worker(
    machine: &Mutex<Machine>,
    state: &StateCell,
    breakpoints: &Mutex<BreakpointTable>,
    max_instructions: u64,
) {
    let mut executed = 0u64;

    while state.load() == SimState::Running {
        let mut guard = lock(machine);
        let Machine { memory, processor } = &mut *guard;

        if let Err(err) = processor.step(memory) {
            warn!("memory fault at pc={:#010x}: {err}", processor.pc());
            state.store(SimState::Terminated);
            continue;
        }
        executed += 1;

        if max_instructions > 0 && executed == max_instructions {
            debug!(executed, "instruction budget reached");
            state.store(SimState::Paused);
            continue;
        }

        let mcause = processor.csr(csr::MCAUSE).unwrap_or(0);
        if mcause & 0xF == Trap::IllegalInstruction.code() {
            info!("illegal instruction at pc={:#010x}", processor.pc());
            state.store(SimState::Terminated);
            continue;
        }
        if mcause & 0xF == Trap::Breakpoint.code() {
            info!("machine breakpoint at pc={:#010x}", processor.pc());
            state.store(SimState::Paused);
            continue;
        }

        if let Some(id) = lock(breakpoints).lookup(processor.pc()) {
            info!("breakpoint {id} hit");
            state.store(SimState::Paused);
        }
    }
}
