use std::iter;

use crate::{config::Geometry, protocol::LineState};

/// An address split into the pieces the store is indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineAddr {
    pub word: usize,
    pub index: usize,
    pub tag: u32,
}

#[derive(Debug, Clone, Copy)]
struct BitSection {
    shift: u32,
    mask: u32,
}

impl BitSection {
    fn apply(&self, num: u32) -> u32 {
        num.checked_shr(self.shift).unwrap_or(0) & self.mask
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLine {
    pub tag: u32,
    pub state: LineState,
    /// Set while the line has been touched inside an open transaction.
    pub transactional: bool,
    pub words: Vec<i32>,
}

impl CacheLine {
    fn empty(words_per_line: usize) -> Self {
        CacheLine {
            tag: 0,
            state: LineState::Invalid,
            transactional: false,
            words: vec![0; words_per_line],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state != LineState::Invalid
    }
}

/// Direct-mapped private store of one controller.
#[derive(Debug)]
pub struct CacheLineStore {
    lines: Vec<CacheLine>,
    word_sec: BitSection,
    index_sec: BitSection,
    tag_sec: BitSection,
}

impl CacheLineStore {
    pub fn new(geometry: Geometry) -> Self {
        let word_sec = BitSection {
            shift: 2,
            mask: geometry.words_per_line as u32 - 1,
        };
        let index_sec = BitSection {
            shift: geometry.block_bits,
            mask: geometry.lines() as u32 - 1,
        };
        let tag_shift = geometry.block_bits + geometry.line_bits;
        let tag_sec = BitSection {
            shift: tag_shift,
            mask: u32::MAX.checked_shr(tag_shift).unwrap_or(0),
        };

        CacheLineStore {
            lines: iter::repeat_with(|| CacheLine::empty(geometry.words_per_line))
                .take(geometry.lines())
                .collect(),
            word_sec,
            index_sec,
            tag_sec,
        }
    }

    pub fn split_addr(&self, address: i32) -> LineAddr {
        let address = address as u32;
        LineAddr {
            word: self.word_sec.apply(address) as usize,
            index: self.index_sec.apply(address) as usize,
            tag: self.tag_sec.apply(address),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn words_per_line(&self) -> usize {
        self.lines.first().map_or(0, |line| line.words.len())
    }

    pub fn lookup(&self, index: usize) -> &CacheLine {
        &self.lines[index]
    }

    pub fn lines(&self) -> impl Iterator<Item = &CacheLine> {
        self.lines.iter()
    }

    /// A line hits only when its tag matches and it holds valid data.
    pub fn hit(&self, index: usize, tag: u32) -> bool {
        let line = &self.lines[index];
        line.tag == tag && line.is_valid()
    }

    /// Reads a word if the address currently hits.
    pub fn read(&self, addr: LineAddr) -> Option<i32> {
        self.hit(addr.index, addr.tag)
            .then(|| self.lines[addr.index].words[addr.word])
    }

    /// Overwrites a line with refill data. `words` must hold exactly one line.
    pub fn install(&mut self, index: usize, tag: u32, state: LineState, words: &[i32]) {
        let line = &mut self.lines[index];
        line.tag = tag;
        line.state = state;
        line.transactional = false;
        line.words.copy_from_slice(words);
    }

    pub fn set_state(&mut self, index: usize, state: LineState) {
        self.lines[index].state = state;
    }

    pub fn write_word(&mut self, index: usize, offset: usize, value: i32) {
        self.lines[index].words[offset] = value;
    }

    pub fn mark_transactional(&mut self, index: usize) {
        self.lines[index].transactional = true;
    }

    pub fn clear_transactional(&mut self) {
        for line in &mut self.lines {
            line.transactional = false;
        }
    }

    /// Applies a coordinator invalidate. Returns `false` for an index this
    /// store does not have.
    pub fn invalidate(&mut self, index: usize) -> bool {
        match self.lines.get_mut(index) {
            Some(line) => {
                line.state = LineState::Invalid;
                line.transactional = false;
                true
            }
            None => false,
        }
    }
}
