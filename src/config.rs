use bitflags::bitflags;
use snafu::ensure;

use crate::arch::irq::{Priority, MAX_VECTORS, VECTORS_PER_PRIORITY, VECTORS_PER_WORD};
use crate::{IdtError, InvalidConfigurationSnafu};

/// Configuration shared by the vector allocator and the interrupt connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdtConfig {
    /// Number of vectors in the interrupt descriptor table, at most 256 on IA-32.
    pub vector_count: u16,
    pub validation: ValidationMode,
    /// Callouts the board's interrupt controllers can request from a synthesized stub.
    pub callouts: CalloutSupport,
}

impl IdtConfig {
    pub const fn new() -> Self {
        Self {
            vector_count: MAX_VECTORS,
            validation: ValidationMode::for_build(),
            callouts: CalloutSupport::all(),
        }
    }

    pub const fn with_vector_count(mut self, vector_count: u16) -> Self {
        self.vector_count = vector_count;
        self
    }

    pub const fn with_validation(mut self, validation: ValidationMode) -> Self {
        self.validation = validation;
        self
    }

    pub const fn with_callouts(mut self, callouts: CalloutSupport) -> Self {
        self.callouts = callouts;
        self
    }

    pub fn validate(&self) -> Result<(), IdtError> {
        ensure!(
            self.vector_count != 0 && self.vector_count <= MAX_VECTORS,
            InvalidConfigurationSnafu {
                vector_count: self.vector_count
            }
        );

        Ok(())
    }

    /// Number of allocation words needed to cover every configured vector.
    pub const fn word_count(&self) -> usize {
        (self.vector_count as usize).div_ceil(VECTORS_PER_WORD)
    }

    /// Whether every vector of `priority` fits into the configured table.
    pub const fn covers(&self, priority: Priority) -> bool {
        ((priority.as_u8() as u16) << 4) + (VECTORS_PER_PRIORITY - 1) <= self.vector_count
    }
}

impl Default for IdtConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Selects whether caller-supplied priorities and scan results are checked.
///
/// `Trusting` reproduces the unchecked release-kernel contract: an out-of-range priority is not
/// rejected and an exhausted priority half may hand out a vector from the neighbouring half of
/// the same allocation word. Callers opting into it must guarantee their requests are satisfiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Trusting,
}

impl ValidationMode {
    /// `Strict` for debug builds, `Trusting` for release builds.
    pub const fn for_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Trusting
        }
    }

    pub const fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

impl Default for ValidationMode {
    fn default() -> Self {
        Self::for_build()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CalloutSupport: u8 {
        /// Begin-of-interrupt callout before the handler runs.
        const BOI = 1;
        /// End-of-interrupt callout after the handler returns.
        const EOI = 1 << 1;
    }
}
