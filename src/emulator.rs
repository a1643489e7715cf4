//! High-level coordinator owning the CPU, physical memory and the I/O
//! fabric, plus snapshot save/restore for hosts that want determinism
//! across runs.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cpu::Cpu;
use crate::io::IoFabric;
use crate::memory::{Memory, MemoryError};
use crate::mmu::{PAGE_SIZE, PTE_PRESENT};
use crate::regs::Registers;
use crate::Trap;

/// Memory size used by [`Emulator::new`]; enough for the conformance
/// programs and small guests while staying light on the host.
pub const DEFAULT_MEMORY_BYTES: usize = 16 * 1024 * 1024;

/// One XR-32 machine instance.
///
/// The CPU owns the register file; memory and I/O are owned here and lent
/// to the CPU one step at a time, so no component holds a long-lived
/// reference to another.
pub struct Emulator {
    pub cpu: Cpu,
    pub mem: Memory,
    pub io: IoFabric,

    halted: bool,
    last_trap: Option<Trap>,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("halted", &self.halted)
            .field("last_trap", &self.last_trap)
            .finish()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Self::with_memory(DEFAULT_MEMORY_BYTES)
    }

    pub fn with_memory(bytes: usize) -> Self {
        Self {
            cpu: Cpu::new(),
            mem: Memory::new(bytes),
            io: IoFabric::new(),
            halted: false,
            last_trap: None,
        }
    }

    /// Reinitialise registers and zero memory. Port mappings are host
    /// property and survive a reset.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.mem.reset();
        self.halted = false;
        self.last_trap = None;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn last_trap(&self) -> Option<&Trap> {
        self.last_trap.as_ref()
    }

    /// Copy a program image to physical memory at `base`.
    pub fn load_image(&mut self, image: &[u8], base: u32) -> Result<(), MemoryError> {
        log::debug!("loading {} bytes at {:#010x}", image.len(), base);
        self.mem.write_bytes(base, image)
    }

    /// Build identity page tables covering all of physical memory at
    /// `table_base` and point TPDR at them. Firmware would normally do
    /// this; hosts that run bare images call it before the first step.
    pub fn install_flat_page_tables(&mut self, table_base: u32) -> Result<(), MemoryError> {
        let pages = (self.mem.size() as u32) / PAGE_SIZE;
        let tables = pages.div_ceil(1024);
        for table in 0..tables {
            let table_addr = table_base + PAGE_SIZE * (1 + table);
            self.mem.store_32(table_base + table * 4, table_addr | PTE_PRESENT)?;
            for slot in 0..1024 {
                let page = table * 1024 + slot;
                if page >= pages {
                    break;
                }
                self.mem.store_32(table_addr + slot * 4, (page << 12) | PTE_PRESENT)?;
            }
        }
        self.cpu.regs.tpdr = table_base;
        Ok(())
    }

    /// [`install_flat_page_tables`](Self::install_flat_page_tables) with
    /// the tables sized and placed at the top of physical memory. Returns
    /// the directory base.
    pub fn install_default_page_tables(&mut self) -> Result<u32, MemoryError> {
        let size = self.mem.size() as u32;
        let tables = (size / PAGE_SIZE).div_ceil(1024);
        let table_bytes = (tables + 1) * PAGE_SIZE;
        let base = size.saturating_sub(table_bytes) & !(PAGE_SIZE - 1);
        self.install_flat_page_tables(base)?;
        Ok(base)
    }

    /// Execute one instruction. Architectural faults are handled inside the
    /// CPU; `Err` here means the machine stopped (`Halted`) or the host
    /// state is broken (`Fatal`).
    pub fn step(&mut self) -> Result<(), Trap> {
        match self.cpu.step(&mut self.mem, &mut self.io) {
            Ok(()) => Ok(()),
            Err(trap) => {
                if trap == Trap::Halted {
                    self.halted = true;
                }
                self.last_trap = Some(trap.clone());
                Err(trap)
            }
        }
    }

    /// Step until HLT or `max_steps`. Returns the number of executed
    /// instructions; `Fatal` errors propagate.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<u64, Trap> {
        let mut executed = 0u64;
        loop {
            if self.halted || max_steps.is_some_and(|limit| executed >= limit) {
                return Ok(executed);
            }
            match self.step() {
                Ok(()) => executed += 1,
                Err(Trap::Halted) => {
                    executed += 1;
                    log::info!("guest halted after {executed} instructions");
                    return Ok(executed);
                }
                Err(trap) => return Err(trap),
            }
        }
    }

    /// Human-readable register dump for diagnostics.
    pub fn dump_state(&self) -> String {
        let regs = &self.cpu.regs;
        let mut out = String::new();
        out.push_str(&format!(
            "i0={:#010x} s0={:#010x} s1={:#010x} fr={:#04x} msr={:#010x}\n",
            regs.i0, regs.s0, regs.s1, regs.fr, regs.msr
        ));
        out.push_str(&format!(
            "ivtr={:#010x} tpdr={:#010x} tsp={:#010x} prr={:#04x}\n",
            regs.ivtr, regs.tpdr, regs.tsp, regs.prr
        ));
        out.push_str(&format!(
            "ie0={:#04x} ie1={:#010x} ie2={:#010x} ie3={:#04x} ie4={:#010x}\n",
            regs.ie0, regs.ie1, regs.ie2, regs.ie3, regs.ie4
        ));
        for (i, value) in regs.r.iter().enumerate() {
            out.push_str(&format!("r{:<2}={:#010x}", i, value));
            out.push(if i % 4 == 3 { '\n' } else { ' ' });
        }
        out
    }
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

const SNAPSHOT_VERSION: &str = "1.0";

/// Serializable CPU state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub registers: Registers,
}

/// Physical memory image with an integrity hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemSnapshot {
    pub size: u64,
    pub hash: String,
    pub data: Vec<u8>,
}

/// Full machine snapshot. I/O port mappings are live host closures and are
/// deliberately absent; hosts re-register devices after a restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub cpu: CpuSnapshot,
    pub memory: MemSnapshot,
}

impl Emulator {
    /// Capture a complete snapshot of the machine state.
    pub fn snapshot(&self) -> Snapshot {
        let mut hasher = Sha256::new();
        hasher.update(self.mem.data());
        Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            cpu: CpuSnapshot { registers: self.cpu.regs.clone() },
            memory: MemSnapshot {
                size: self.mem.size() as u64,
                hash: hex::encode(hasher.finalize()),
                data: self.mem.data().to_vec(),
            },
        }
    }

    /// Restore a previously captured snapshot into this instance.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), String> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(format!(
                "snapshot version mismatch: expected {SNAPSHOT_VERSION}, found {}",
                snapshot.version
            ));
        }
        if snapshot.memory.data.len() as u64 != snapshot.memory.size {
            return Err("snapshot memory region is inconsistent".to_string());
        }

        let mut hasher = Sha256::new();
        hasher.update(&snapshot.memory.data);
        let hash = hex::encode(hasher.finalize());
        if hash != snapshot.memory.hash {
            return Err("snapshot memory hash mismatch".to_string());
        }

        self.mem
            .set_data(&snapshot.memory.data)
            .map_err(|e| format!("snapshot memory: {e}"))?;
        self.cpu.regs = snapshot.cpu.registers.clone();
        self.cpu.last_interrupt = None;
        self.halted = false;
        self.last_trap = None;
        Ok(())
    }

    /// Construct a fresh machine from a snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, String> {
        let mut emu = Emulator::with_memory(snapshot.memory.size as usize);
        emu.apply_snapshot(snapshot)?;
        Ok(emu)
    }

    pub fn save_snapshot_to_path<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let snapshot = self.snapshot();
        let mut file = File::create(path)?;
        bincode::serialize_into(&mut file, &snapshot)?;
        file.flush()?;
        Ok(())
    }

    pub fn load_snapshot_from_path<P: AsRef<Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let file = File::open(path)?;
        let snapshot: Snapshot = bincode::deserialize_from(file)?;
        Ok(Self::from_snapshot(&snapshot).map_err(std::io::Error::other)?)
    }
}
