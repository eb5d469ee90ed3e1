use crate::constants::{LONG, SHORT};
use crate::types::Position;

/// Fixed-capacity set of symbol indices; iteration is always ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolSet {
    words: Vec<u64>,
    capacity: usize,
}

impl SymbolSet {
    pub fn with_capacity(capacity: usize) -> Self {
        SymbolSet {
            words: vec![0; (capacity + 63) / 64],
            capacity,
        }
    }

    #[inline(always)]
    pub fn contains(&self, idx: usize) -> bool {
        idx < self.capacity && self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    /// Returns true if `idx` was not already present.
    #[inline(always)]
    pub fn insert(&mut self, idx: usize) -> bool {
        debug_assert!(idx < self.capacity, "symbol index {} out of range", idx);
        let was_present = self.contains(idx);
        self.words[idx / 64] |= 1u64 << (idx % 64);
        !was_present
    }

    /// Returns true if `idx` was present.
    #[inline(always)]
    pub fn remove(&mut self, idx: usize) -> bool {
        let was_present = self.contains(idx);
        if was_present {
            self.words[idx / 64] &= !(1u64 << (idx % 64));
        }
        was_present
    }

    pub fn set(&mut self, idx: usize, present: bool) {
        if present {
            self.insert(idx);
        } else {
            self.remove(idx);
        }
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| {
                let mut bits = word;
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(word_idx * 64 + bit)
                })
            })
    }
}

/// Per-side position arena indexed by symbol, with open-position membership kept in step.
#[derive(Debug, Clone)]
pub struct Ledger {
    long: Vec<Position>,
    short: Vec<Position>,
    open_long: SymbolSet,
    open_short: SymbolSet,
}

impl Ledger {
    pub fn new(n_symbols: usize) -> Self {
        Ledger {
            long: vec![Position::default(); n_symbols],
            short: vec![Position::default(); n_symbols],
            open_long: SymbolSet::with_capacity(n_symbols),
            open_short: SymbolSet::with_capacity(n_symbols),
        }
    }

    pub fn n_symbols(&self) -> usize {
        self.long.len()
    }

    #[inline(always)]
    pub fn get(&self, pside: usize, idx: usize) -> Position {
        match pside {
            LONG => self.long[idx],
            SHORT => self.short[idx],
            _ => unreachable!(),
        }
    }

    /// Commits a position; an emptied position is stored as (0, 0).
    pub fn set(&mut self, pside: usize, idx: usize, position: Position) {
        let position = if position.size == 0.0 {
            Position::default()
        } else {
            position
        };
        let (slots, open) = match pside {
            LONG => (&mut self.long, &mut self.open_long),
            SHORT => (&mut self.short, &mut self.open_short),
            _ => unreachable!(),
        };
        slots[idx] = position;
        open.set(idx, position.is_open());
    }

    pub fn positions(&self, pside: usize) -> &[Position] {
        match pside {
            LONG => &self.long,
            SHORT => &self.short,
            _ => unreachable!(),
        }
    }

    pub fn open_positions(&self, pside: usize) -> &SymbolSet {
        match pside {
            LONG => &self.open_long,
            SHORT => &self.open_short,
            _ => unreachable!(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StuckSets {
    long: SymbolSet,
    short: SymbolSet,
}

impl StuckSets {
    pub fn new(n_symbols: usize) -> Self {
        StuckSets {
            long: SymbolSet::with_capacity(n_symbols),
            short: SymbolSet::with_capacity(n_symbols),
        }
    }

    pub fn get(&self, pside: usize) -> &SymbolSet {
        match pside {
            LONG => &self.long,
            SHORT => &self.short,
            _ => unreachable!(),
        }
    }

    pub fn set(&mut self, pside: usize, idx: usize, stuck: bool) {
        match pside {
            LONG => self.long.set(idx, stuck),
            SHORT => self.short.set(idx, stuck),
            _ => unreachable!(),
        }
    }

    pub fn any(&self) -> bool {
        !self.long.is_empty() || !self.short.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_set_iterates_ascending_across_words() {
        let mut set = SymbolSet::with_capacity(130);
        for idx in [129, 3, 64, 0, 63] {
            assert!(set.insert(idx));
        }
        assert!(!set.insert(64));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 3, 63, 64, 129]);
        assert_eq!(set.len(), 5);
        assert!(set.remove(63));
        assert!(!set.remove(63));
        assert!(!set.contains(63));
        assert!(!set.contains(500));
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_ledger_tracks_open_positions() {
        let mut ledger = Ledger::new(3);
        ledger.set(
            LONG,
            2,
            Position {
                size: 1.0,
                price: 10.0,
            },
        );
        ledger.set(
            SHORT,
            0,
            Position {
                size: -2.0,
                price: 20.0,
            },
        );
        assert_eq!(ledger.open_positions(LONG).iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(ledger.open_positions(SHORT).iter().collect::<Vec<_>>(), vec![0]);
        ledger.set(
            LONG,
            2,
            Position {
                size: 0.0,
                price: 10.0,
            },
        );
        assert_eq!(ledger.get(LONG, 2), Position::default());
        assert!(ledger.open_positions(LONG).is_empty());
    }

    #[test]
    fn test_stuck_sets() {
        let mut stuck = StuckSets::new(4);
        assert!(!stuck.any());
        stuck.set(SHORT, 3, true);
        assert!(stuck.any());
        assert_eq!(stuck.get(SHORT).iter().collect::<Vec<_>>(), vec![3]);
        assert!(stuck.get(LONG).is_empty());
        stuck.set(SHORT, 3, false);
        assert!(!stuck.any());
    }
}
