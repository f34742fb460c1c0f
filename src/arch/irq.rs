use core::fmt;

use log::{debug, warn};
use snafu::ensure;
use spin::Mutex;

use crate::arch::x86::interrupts::{CriticalSection, CriticalSectionGuard};
use crate::config::IdtConfig;
use crate::{IdtError, InvalidPrioritySnafu, VectorUnavailableSnafu};

pub const MAX_VECTORS: u16 = 256;
pub const VECTORS_PER_PRIORITY: u16 = 16;
pub const VECTORS_PER_WORD: usize = 32;
/// Vectors below this one are reserved for processor exceptions.
pub const FIRST_DEVICE_VECTOR: Vector = Vector(32);

const MAX_WORDS: usize = MAX_VECTORS as usize / VECTORS_PER_WORD;

/// Index into the interrupt descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Vector(u8);

impl Vector {
    pub const fn new(vector: u8) -> Self {
        Self(vector)
    }

    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    pub const fn priority(&self) -> Priority {
        Priority(self.0 >> 4)
    }

    const fn word_index(&self) -> usize {
        self.0 as usize / VECTORS_PER_WORD
    }

    const fn bit(&self) -> u32 {
        1 << (self.0 as usize % VECTORS_PER_WORD)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Interrupt priority level. Level `n` owns vectors `16n..16n + 16`, the higher the vector the
/// higher its priority within the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const fn new(priority: u8) -> Self {
        Self(priority)
    }

    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Allocation word shared with the neighbouring level.
    const fn word_index(&self) -> usize {
        (self.0 >> 1) as usize
    }

    /// Even levels live in the lower half of their word, odd ones in the upper half.
    const fn is_lower_half(&self) -> bool {
        self.0 % 2 == 0
    }

    const fn half_mask(&self) -> u32 {
        if self.is_lower_half() {
            0x0000_FFFF
        } else {
            0xFFFF_0000
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Board-level interrupt request line. The board maps these onto physical controller inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Irq(pub u32);

impl Irq {
    /// Software generated interrupt, not backed by any controller input.
    pub const SOFTWARE: Irq = Irq(u32::MAX);
}

impl fmt::Display for Irq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::SOFTWARE {
            write!(f, "software IRQ")
        } else {
            write!(f, "IRQ{}", self.0)
        }
    }
}

/// Tracks which vectors are free, one bit per vector with a set bit meaning free.
///
/// Every access to the bitset happens inside a critical section supplied by `C`, so allocation
/// is safe against interrupt handlers on the current processor as well as other processors.
pub struct VectorAllocator<C: CriticalSection> {
    config: IdtConfig,
    words: Mutex<[u32; MAX_WORDS]>,
    critical_section: C,
}

impl<C: CriticalSection> VectorAllocator<C> {
    pub fn new(config: IdtConfig, critical_section: C) -> Result<Self, IdtError> {
        config.validate()?;

        let mut words = [0u32; MAX_WORDS];
        words[..config.word_count()].fill(u32::MAX);

        Ok(Self {
            config,
            words: Mutex::new(words),
            critical_section,
        })
    }

    pub fn config(&self) -> &IdtConfig {
        &self.config
    }

    /// Allocates a free vector at `priority`.
    ///
    /// Even priorities hand out the lowest free vector of their level and odd priorities the
    /// highest one, so both levels sharing a word grow towards each other from opposite ends.
    pub fn allocate(&self, priority: Priority) -> Result<Vector, IdtError> {
        let strict = self.config.validation.is_strict();

        ensure!(
            !strict || self.config.covers(priority),
            InvalidPrioritySnafu { priority }
        );

        let entry = priority.word_index();

        let vector = {
            let _interrupts = CriticalSectionGuard::new(&self.critical_section);
            let mut words = self.words.lock();

            // Priorities past the table have no word, treat them as fully allocated
            let word = words.get(entry).copied().unwrap_or(0);

            // Bit positions are 1-based, 0 means no bit is set
            let position = if priority.is_lower_half() {
                find_first_set(word)
            } else {
                find_last_set(word)
            };

            let in_half = if priority.is_lower_half() {
                (1..=16).contains(&position)
            } else {
                (17..=32).contains(&position)
            };

            if position == 0 || (strict && !in_half) {
                None
            } else {
                let bit = position - 1;
                words[entry] &= !(1 << bit);

                Some(Vector((entry * VECTORS_PER_WORD) as u8 + bit as u8))
            }
        };

        match vector {
            Some(vector) => {
                debug!("Allocated vector {vector} at priority {priority}");

                Ok(vector)
            }
            None => {
                warn!("No free vector at priority {priority}");

                VectorUnavailableSnafu { priority }.fail()
            }
        }
    }

    /// Reserves a vector assigned by other means, e.g. a vector fixed by the interrupt controller.
    pub fn mark_allocated(&self, vector: Vector) {
        let _interrupts = CriticalSectionGuard::new(&self.critical_section);

        self.words.lock()[vector.word_index()] &= !vector.bit();
    }

    pub fn mark_free(&self, vector: Vector) {
        let _interrupts = CriticalSectionGuard::new(&self.critical_section);

        self.words.lock()[vector.word_index()] |= vector.bit();
    }

    pub fn is_free(&self, vector: Vector) -> bool {
        let _interrupts = CriticalSectionGuard::new(&self.critical_section);

        self.words.lock()[vector.word_index()] & vector.bit() != 0
    }

    /// Number of free vectors left at `priority`.
    pub fn free_count(&self, priority: Priority) -> u32 {
        let _interrupts = CriticalSectionGuard::new(&self.critical_section);

        let words = self.words.lock();

        words
            .get(priority.word_index())
            .map_or(0, |word| (word & priority.half_mask()).count_ones())
    }
}

fn find_first_set(word: u32) -> u32 {
    if word == 0 {
        0
    } else {
        word.trailing_zeros() + 1
    }
}

fn find_last_set(word: u32) -> u32 {
    u32::BITS - word.leading_zeros()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::*;
    use crate::config::ValidationMode;

    #[derive(Default)]
    struct CountingCriticalSection {
        depth: AtomicIsize,
        entries: AtomicUsize,
    }

    impl CriticalSection for CountingCriticalSection {
        type State = ();

        fn enter(&self) {
            self.depth.fetch_add(1, Ordering::SeqCst);
            self.entries.fetch_add(1, Ordering::SeqCst);
        }

        fn exit(&self, _state: ()) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn allocator(validation: ValidationMode) -> VectorAllocator<CountingCriticalSection> {
        VectorAllocator::new(
            IdtConfig::new().with_validation(validation),
            CountingCriticalSection::default(),
        )
        .unwrap()
    }

    fn drain(allocator: &VectorAllocator<CountingCriticalSection>, priority: Priority) {
        while allocator.allocate(priority).is_ok() {}
    }

    #[test]
    fn test_fresh_allocator_has_every_vector_free() {
        let allocator = allocator(ValidationMode::Strict);

        for vector in 0..=255u8 {
            assert!(allocator.is_free(Vector::new(vector)));
        }
    }

    #[test]
    fn test_partial_last_word_starts_free() {
        let allocator = VectorAllocator::new(
            IdtConfig::new().with_vector_count(40),
            CountingCriticalSection::default(),
        )
        .unwrap();

        for vector in 0..40u8 {
            assert!(allocator.is_free(Vector::new(vector)));
        }
        assert!(!allocator.is_free(Vector::new(64)));
    }

    #[test]
    fn test_even_priority_allocates_ascending() {
        let allocator = allocator(ValidationMode::Strict);
        let priority = Priority::new(4);

        let vectors: Vec<u8> = (0..16)
            .map(|_| allocator.allocate(priority).unwrap().as_u8())
            .collect();

        assert_eq!(vectors, (64..80).collect::<Vec<u8>>());
    }

    #[test]
    fn test_odd_priority_allocates_descending() {
        let allocator = allocator(ValidationMode::Strict);
        let priority = Priority::new(5);

        let vectors: Vec<u8> = (0..16)
            .map(|_| allocator.allocate(priority).unwrap().as_u8())
            .collect();

        assert_eq!(vectors, (80..96).rev().collect::<Vec<u8>>());
    }

    #[test]
    fn test_allocated_vector_matches_priority() {
        let allocator = allocator(ValidationMode::Strict);

        for priority in 2..16 {
            let vector = allocator.allocate(Priority::new(priority)).unwrap();

            assert_eq!(vector.priority(), Priority::new(priority));
        }
    }

    #[test]
    fn test_exhausted_priority_is_reported_without_side_effects() {
        let allocator = allocator(ValidationMode::Strict);
        let priority = Priority::new(6);

        drain(&allocator, priority);

        let words_before = *allocator.words.lock();

        assert_eq!(
            allocator.allocate(priority),
            Err(IdtError::VectorUnavailable { priority })
        );
        assert_eq!(*allocator.words.lock(), words_before);
        assert_eq!(allocator.free_count(priority), 0);
    }

    #[test]
    fn test_halves_are_independent() {
        let allocator = allocator(ValidationMode::Strict);

        drain(&allocator, Priority::new(2));

        assert_eq!(allocator.free_count(Priority::new(3)), 16);
        assert_eq!(allocator.allocate(Priority::new(3)), Ok(Vector::new(63)));

        allocator.mark_free(Vector::new(40));

        assert_eq!(allocator.free_count(Priority::new(3)), 15);
        assert_eq!(allocator.allocate(Priority::new(2)), Ok(Vector::new(40)));
    }

    #[test]
    fn test_strict_mode_does_not_borrow_from_neighbouring_half() {
        let allocator = allocator(ValidationMode::Strict);

        drain(&allocator, Priority::new(8));

        assert!(allocator.allocate(Priority::new(8)).is_err());
        assert_eq!(allocator.free_count(Priority::new(9)), 16);
    }

    #[test]
    fn test_trusting_mode_borrows_from_neighbouring_half() {
        let allocator = allocator(ValidationMode::Trusting);

        drain(&allocator, Priority::new(8));

        // Both halves of the word end up empty since the even priority keeps scanning upwards
        assert_eq!(allocator.free_count(Priority::new(9)), 0);
        assert_eq!(
            allocator.allocate(Priority::new(9)),
            Err(IdtError::VectorUnavailable {
                priority: Priority::new(9)
            })
        );
    }

    #[test]
    fn test_strict_mode_odd_priority_does_not_borrow_from_lower_half() {
        let allocator = allocator(ValidationMode::Strict);
        let priority = Priority::new(9);

        drain(&allocator, priority);

        let words_before = *allocator.words.lock();

        assert_eq!(
            allocator.allocate(priority),
            Err(IdtError::VectorUnavailable { priority })
        );
        assert_eq!(*allocator.words.lock(), words_before);
        assert_eq!(allocator.free_count(Priority::new(8)), 16);
        assert_eq!(allocator.allocate(Priority::new(8)), Ok(Vector::new(128)));
    }

    #[test]
    fn test_trusting_mode_odd_priority_borrows_from_lower_half() {
        let allocator = allocator(ValidationMode::Trusting);
        let priority = Priority::new(9);

        for _ in 0..16 {
            allocator.allocate(priority).unwrap();
        }

        assert_eq!(allocator.free_count(priority), 0);
        assert_eq!(allocator.allocate(priority), Ok(Vector::new(143)));
        assert_eq!(allocator.free_count(Priority::new(8)), 15);
    }

    #[test]
    fn test_reserved_exception_vectors_are_skipped() {
        let allocator = allocator(ValidationMode::Strict);

        for vector in 0..FIRST_DEVICE_VECTOR.as_u8() {
            allocator.mark_allocated(Vector::new(vector));
        }

        assert_eq!(allocator.free_count(Priority::new(0)), 0);
        assert_eq!(allocator.free_count(Priority::new(1)), 0);
        assert!(allocator.allocate(Priority::new(1)).is_err());
        assert_eq!(allocator.allocate(Priority::new(2)), Ok(FIRST_DEVICE_VECTOR));
    }

    #[test]
    fn test_invalid_priority_in_strict_mode() {
        let allocator = VectorAllocator::new(
            IdtConfig::new()
                .with_vector_count(64)
                .with_validation(ValidationMode::Strict),
            CountingCriticalSection::default(),
        )
        .unwrap();

        assert_eq!(
            allocator.allocate(Priority::new(4)),
            Err(IdtError::InvalidPriority {
                priority: Priority::new(4)
            })
        );
        assert!(allocator.allocate(Priority::new(3)).is_ok());
    }

    #[test]
    fn test_trusting_mode_skips_priority_check() {
        let allocator = VectorAllocator::new(
            IdtConfig::new()
                .with_vector_count(64)
                .with_validation(ValidationMode::Trusting),
            CountingCriticalSection::default(),
        )
        .unwrap();

        // Word 2 lies past the configured table and is never free
        assert_eq!(
            allocator.allocate(Priority::new(4)),
            Err(IdtError::VectorUnavailable {
                priority: Priority::new(4)
            })
        );
        assert_eq!(
            allocator.allocate(Priority::new(200)),
            Err(IdtError::VectorUnavailable {
                priority: Priority::new(200)
            })
        );
    }

    #[test]
    fn test_mark_round_trip_restores_vector() {
        let allocator = allocator(ValidationMode::Strict);
        let vector = Vector::new(50);

        allocator.mark_allocated(vector);
        assert!(!allocator.is_free(vector));

        allocator.mark_free(vector);
        assert!(allocator.is_free(vector));
    }

    #[test]
    fn test_freed_vector_is_allocated_again() {
        let allocator = allocator(ValidationMode::Strict);
        let priority = Priority::new(2);

        let first = allocator.allocate(priority).unwrap();
        let second = allocator.allocate(priority).unwrap();
        assert_eq!((first.as_u8(), second.as_u8()), (32, 33));

        allocator.mark_free(first);

        assert_eq!(allocator.allocate(priority), Ok(first));
    }

    #[test]
    fn test_marking_is_idempotent() {
        let allocator = allocator(ValidationMode::Strict);
        let vector = Vector::new(77);

        allocator.mark_allocated(vector);
        allocator.mark_allocated(vector);
        assert!(!allocator.is_free(vector));
        assert_eq!(allocator.free_count(vector.priority()), 15);

        allocator.mark_free(vector);
        allocator.mark_free(vector);
        assert!(allocator.is_free(vector));
        assert_eq!(allocator.free_count(vector.priority()), 16);
    }

    #[test]
    fn test_marked_vector_is_skipped_by_allocation() {
        let allocator = allocator(ValidationMode::Strict);

        allocator.mark_allocated(Vector::new(32));
        allocator.mark_allocated(Vector::new(63));

        assert_eq!(allocator.allocate(Priority::new(2)), Ok(Vector::new(33)));
        assert_eq!(allocator.allocate(Priority::new(3)), Ok(Vector::new(62)));
    }

    #[test]
    fn test_critical_section_is_balanced() {
        let allocator = allocator(ValidationMode::Strict);

        allocator.allocate(Priority::new(2)).unwrap();
        allocator.mark_allocated(Vector::new(90));
        allocator.mark_free(Vector::new(90));
        drain(&allocator, Priority::new(2));

        let section = &allocator.critical_section;
        assert_eq!(section.depth.load(Ordering::SeqCst), 0);
        assert_eq!(section.entries.load(Ordering::SeqCst), 19);
    }

    #[test]
    fn test_concurrent_allocation_hands_out_distinct_vectors() {
        let allocator = Arc::new(allocator(ValidationMode::Strict));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);

                thread::spawn(move || {
                    (0..8)
                        .filter_map(|_| allocator.allocate(Priority::new(10)).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let vectors: Vec<Vector> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        let unique: HashSet<Vector> = vectors.iter().copied().collect();

        assert_eq!(vectors.len(), 16);
        assert_eq!(unique.len(), 16);
        assert!(unique
            .iter()
            .all(|vector| (160..176).contains(&vector.as_u8())));
    }

    #[test]
    fn test_bit_scan_positions() {
        assert_eq!(find_first_set(0), 0);
        assert_eq!(find_last_set(0), 0);
        assert_eq!(find_first_set(1), 1);
        assert_eq!(find_last_set(1), 1);
        assert_eq!(find_first_set(0x8000_0000), 32);
        assert_eq!(find_last_set(0x8000_0000), 32);
        assert_eq!(find_first_set(0x0001_0100), 9);
        assert_eq!(find_last_set(0x0001_0100), 17);
    }
}
