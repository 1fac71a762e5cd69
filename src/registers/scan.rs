//! Per-tick view of the register map used by the scan cycle

use super::{Address, Consistency, RegisterMap, Tag, Word};

/// Reserved registers as seen by the process logic
pub trait ProcessImage {
    fn get(&self, tag: Tag) -> Word;
    fn set(&mut self, tag: Tag, value: Word);

    fn is_on(&self, tag: Tag) -> bool {
        self.get(tag) == 1
    }
}

/// Buffered copy of the holding bank for tick-snapshot consistency
struct Frame {
    words: Vec<Word>,
    dirty: Vec<Address>,
}

/// Register access for one scan cycle
///
/// With [`Consistency::PerAddress`] every access goes straight to the shared
/// bank, so the field-bus side sees each write as soon as it happens and the
/// loop sees external writes mid-tick. With [`Consistency::TickSnapshot`] the
/// tick works on a copy taken at [`ScanRegisters::begin`] and its writes land
/// together in [`ScanRegisters::commit`].
pub struct ScanRegisters<'a> {
    map: &'a RegisterMap,
    frame: Option<Frame>,
    writes: Vec<(Tag, Word)>,
}

impl<'a> ScanRegisters<'a> {
    pub fn begin(map: &'a RegisterMap) -> Self {
        let frame = match map.consistency() {
            Consistency::PerAddress => None,
            Consistency::TickSnapshot => Some(Frame {
                words: map.snapshot(),
                dirty: Vec::new(),
            }),
        };
        Self {
            map,
            frame,
            writes: Vec::new(),
        }
    }

    /// Write count of a reserved register in the shared map
    pub fn revision(&self, tag: Tag) -> u64 {
        self.map.revision(tag)
    }

    /// Writes issued so far this tick, in order
    pub fn writes(&self) -> &[(Tag, Word)] {
        &self.writes
    }

    /// Publish buffered writes (if any) and return every write of the tick
    pub fn commit(self) -> Vec<(Tag, Word)> {
        if let Some(frame) = self.frame {
            let mut published: Vec<(Address, Word)> = Vec::with_capacity(frame.dirty.len());
            for address in frame.dirty {
                published.push((address, frame.words[address as usize]));
            }
            self.map.publish(&published);
        }
        self.writes
    }
}

impl ProcessImage for ScanRegisters<'_> {
    fn get(&self, tag: Tag) -> Word {
        match &self.frame {
            Some(frame) => frame.words[tag.address() as usize],
            None => self.map.tag(tag),
        }
    }

    fn set(&mut self, tag: Tag, value: Word) {
        match &mut self.frame {
            Some(frame) => {
                let address = tag.address();
                frame.words[address as usize] = value;
                if !frame.dirty.contains(&address) {
                    frame.dirty.push(address);
                }
            }
            None => self.map.set_tag(tag, value),
        }
        self.writes.push((tag, value));
    }
}
