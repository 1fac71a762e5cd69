//! Register map shared by the scan cycle and the field-bus server
//!
//! Four banks mirror the address spaces of a Modbus slave: holding registers
//! (the only bank the process logic uses), input registers, coils and discrete
//! inputs. The last three are inert storage kept for address compatibility.
//!
//! Every single-address read or write is atomic and never blocks. A read of
//! several addresses is **not** a snapshot by default: the scan cycle may land
//! writes between two reads, so a master can observe LIMIT_SWITCH and
//! LEVEL_SENSOR values that no single tick produced. Switch to
//! [`Consistency::TickSnapshot`] to make range reads see whole ticks.

pub mod scan;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::atomic::{fence, AtomicBool, AtomicU16, AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use scan::{ProcessImage, ScanRegisters};

/// Register address (0-based, no protocol offset)
pub type Address = u16;

/// Register value
pub type Word = u16;

/// Default number of registers in every bank
pub const DEFAULT_BANK_SIZE: usize = 100;

/// Largest bank addressable with 16-bit addresses
pub const MAX_BANK_SIZE: usize = 1 << 16;

/// Registers with a meaning in the bottling process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Bottle present at the fill position
    LimitSwitch,
    /// Fill level reached
    LevelSensor,
    /// Conveyor motor command
    Motor,
    /// Fill valve command
    Nozzle,
    /// Process enable
    Run,
}

impl Tag {
    pub const ALL: [Tag; 5] = [
        Tag::LimitSwitch,
        Tag::LevelSensor,
        Tag::Motor,
        Tag::Nozzle,
        Tag::Run,
    ];

    pub const fn address(self) -> Address {
        match self {
            Tag::LimitSwitch => 0x1,
            Tag::LevelSensor => 0x2,
            Tag::Motor => 0x3,
            Tag::Nozzle => 0x4,
            Tag::Run => 0x10,
        }
    }

    pub fn from_address(address: Address) -> Option<Tag> {
        Tag::ALL.into_iter().find(|tag| tag.address() == address)
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::LimitSwitch => "LIMIT_SWITCH",
            Tag::LevelSensor => "LEVEL_SENSOR",
            Tag::Motor => "MOTOR",
            Tag::Nozzle => "NOZZLE",
            Tag::Run => "RUN",
        }
    }

    /// Smallest bank that can hold every reserved address
    pub fn required_bank_size() -> usize {
        Tag::ALL
            .iter()
            .map(|tag| tag.address() as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#04x}", self.name(), self.address())
    }
}

/// What a multi-register access is allowed to observe
///
/// Serialized as a plain string: `"per_address"` or `"tick_snapshot"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Each address is consistent on its own; range reads may mix ticks
    #[default]
    PerAddress,
    /// The scan cycle publishes its writes as one unit at the end of a tick
    /// and range reads/writes never interleave with a publish
    TickSnapshot,
}

impl Consistency {
    pub const ALL: [Consistency; 2] = [Consistency::PerAddress, Consistency::TickSnapshot];

    pub fn name(self) -> &'static str {
        match self {
            Consistency::PerAddress => "per_address",
            Consistency::TickSnapshot => "tick_snapshot",
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Consistency::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| format!("unknown consistency `{s}`, expected per_address or tick_snapshot"))
    }
}

impl Serialize for Consistency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Consistency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("{count} registers from {address} exceed a bank of {size}")]
    OutOfRange {
        address: Address,
        count: usize,
        size: usize,
    },

    #[error("bank size {size} outside {min}..={max}")]
    InvalidBankSize { size: usize, min: usize, max: usize },
}

fn bank_range(address: Address, count: usize, size: usize) -> Result<Range<usize>, RegisterError> {
    let start = address as usize;
    let end = start + count;
    if end > size {
        return Err(RegisterError::OutOfRange {
            address,
            count,
            size,
        });
    }
    Ok(start..end)
}

struct WordBank {
    cells: Box<[AtomicU16]>,
}

impl WordBank {
    fn new(size: usize) -> Self {
        Self {
            cells: (0..size).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    fn load(&self, range: Range<usize>) -> Vec<Word> {
        self.cells[range]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect()
    }

    fn store(&self, start: usize, values: &[Word]) {
        for (cell, value) in self.cells[start..start + values.len()].iter().zip(values) {
            cell.store(*value, Ordering::Relaxed);
        }
    }
}

struct BitBank {
    cells: Box<[AtomicBool]>,
}

impl BitBank {
    fn new(size: usize) -> Self {
        Self {
            cells: (0..size).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn load(&self, range: Range<usize>) -> Vec<bool> {
        self.cells[range]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect()
    }

    fn store(&self, start: usize, values: &[bool]) {
        for (cell, value) in self.cells[start..start + values.len()].iter().zip(values) {
            cell.store(*value, Ordering::Relaxed);
        }
    }
}

/// Thread-safe register banks handed to both the control loop and the
/// field-bus server at construction
pub struct RegisterMap {
    holding: WordBank,
    input: WordBank,
    coils: BitBank,
    discrete: BitBank,
    size: usize,
    consistency: Consistency,
    /// Write count per holding register
    revisions: Box<[AtomicU64]>,
    /// Publish sequence; odd while a guarded write is in flight
    sequence: AtomicU64,
}

impl RegisterMap {
    /// Create zeroed banks of `size` registers each
    pub fn new(size: usize, consistency: Consistency) -> Result<Self, RegisterError> {
        let min = Tag::required_bank_size();
        if size < min || size > MAX_BANK_SIZE {
            return Err(RegisterError::InvalidBankSize {
                size,
                min,
                max: MAX_BANK_SIZE,
            });
        }

        Ok(Self {
            holding: WordBank::new(size),
            input: WordBank::new(size),
            coils: BitBank::new(size),
            discrete: BitBank::new(size),
            size,
            consistency,
            revisions: (0..size).map(|_| AtomicU64::new(0)).collect(),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// Read one holding register
    pub fn read(&self, address: Address) -> Result<Word, RegisterError> {
        let range = bank_range(address, 1, self.size)?;
        Ok(self.holding.cells[range.start].load(Ordering::Acquire))
    }

    /// Overwrite one holding register; any address inside the bank is accepted
    pub fn write(&self, address: Address, value: Word) -> Result<(), RegisterError> {
        let range = bank_range(address, 1, self.size)?;
        self.holding.cells[range.start].store(value, Ordering::Release);
        self.touch(range);
        Ok(())
    }

    /// Read a reserved register. Reserved addresses are always inside the bank.
    pub fn tag(&self, tag: Tag) -> Word {
        self.holding.cells[tag.address() as usize].load(Ordering::Acquire)
    }

    pub fn set_tag(&self, tag: Tag, value: Word) {
        let index = tag.address() as usize;
        self.holding.cells[index].store(value, Ordering::Release);
        self.touch(index..index + 1);
    }

    /// Number of writes a reserved register has received, whatever the value
    pub fn revision(&self, tag: Tag) -> u64 {
        self.revisions[tag.address() as usize].load(Ordering::Acquire)
    }

    /// Field-bus primitive: read `count` holding registers from `address`
    pub fn get(&self, address: Address, count: u16) -> Result<Vec<Word>, RegisterError> {
        let range = bank_range(address, count as usize, self.size)?;
        Ok(match self.consistency {
            Consistency::PerAddress => self.holding.load(range),
            Consistency::TickSnapshot => self.read_guarded(|| self.holding.load(range.clone())),
        })
    }

    /// Field-bus primitive: write consecutive holding registers from `address`
    pub fn set(&self, address: Address, values: &[Word]) -> Result<(), RegisterError> {
        let range = bank_range(address, values.len(), self.size)?;
        match self.consistency {
            Consistency::PerAddress => self.holding.store(range.start, values),
            Consistency::TickSnapshot => {
                self.write_guarded(|| self.holding.store(range.start, values))
            }
        }
        self.touch(range);
        Ok(())
    }

    /// Consistent copy of the whole holding bank
    pub fn snapshot(&self) -> Vec<Word> {
        self.read_guarded(|| self.holding.load(0..self.size))
    }

    /// Publish a tick's writes as one unit
    pub(crate) fn publish(&self, writes: &[(Address, Word)]) {
        if writes.is_empty() {
            return;
        }
        self.write_guarded(|| {
            for &(address, value) in writes {
                if let Some(cell) = self.holding.cells.get(address as usize) {
                    cell.store(value, Ordering::Relaxed);
                }
            }
        });
        for &(address, _) in writes {
            if let Some(revision) = self.revisions.get(address as usize) {
                revision.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn input_registers(&self, address: Address, count: u16) -> Result<Vec<Word>, RegisterError> {
        let range = bank_range(address, count as usize, self.size)?;
        Ok(self.input.load(range))
    }

    pub fn set_input_registers(&self, address: Address, values: &[Word]) -> Result<(), RegisterError> {
        let range = bank_range(address, values.len(), self.size)?;
        self.input.store(range.start, values);
        Ok(())
    }

    pub fn coils(&self, address: Address, count: u16) -> Result<Vec<bool>, RegisterError> {
        let range = bank_range(address, count as usize, self.size)?;
        Ok(self.coils.load(range))
    }

    pub fn set_coils(&self, address: Address, values: &[bool]) -> Result<(), RegisterError> {
        let range = bank_range(address, values.len(), self.size)?;
        self.coils.store(range.start, values);
        Ok(())
    }

    pub fn discrete_inputs(&self, address: Address, count: u16) -> Result<Vec<bool>, RegisterError> {
        let range = bank_range(address, count as usize, self.size)?;
        Ok(self.discrete.load(range))
    }

    pub fn set_discrete_inputs(&self, address: Address, values: &[bool]) -> Result<(), RegisterError> {
        let range = bank_range(address, values.len(), self.size)?;
        self.discrete.store(range.start, values);
        Ok(())
    }

    fn touch(&self, range: Range<usize>) {
        for revision in &self.revisions[range] {
            revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Run `write` while holding the publish sequence odd
    fn write_guarded(&self, write: impl FnOnce()) {
        let mut current = self.sequence.load(Ordering::Relaxed);
        loop {
            if current & 1 == 1 {
                std::hint::spin_loop();
                current = self.sequence.load(Ordering::Relaxed);
                continue;
            }
            match self.sequence.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        fence(Ordering::Release);
        write();
        self.sequence.store(current + 2, Ordering::Release);
    }

    /// Retry `read` until it did not overlap a guarded write
    fn read_guarded<T>(&self, mut read: impl FnMut() -> T) -> T {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let value = read();
            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) == before {
                return value;
            }
            std::hint::spin_loop();
        }
    }
}

impl fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for tag in Tag::ALL {
            map.entry(&tag.name(), &self.tag(tag));
        }
        map.finish()
    }
}
