//! Interrupt vector management for the IA-32 kernel layer
//!
//! Contains the priority-aware vector allocator, the interrupt descriptor table installer, the
//! interrupt stub synthesizer and the `connect` operation binding a hardware interrupt to a handler.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod connect;

use snafu::Snafu;

pub use arch::irq::{Irq, Priority, Vector, VectorAllocator};
pub use arch::x86::idt::{GateDescriptor, GateType, InterruptDescriptorTable};
pub use arch::x86::interrupts::{CriticalSection, CriticalSectionGuard, LocalInterruptMask};
pub use arch::x86::stub::{
    decode, Callout, CodeAddress, Instruction, IsrRoutine, KernelEntryPoints, StubMemory,
    StubRequest, StubSynthesizer, INT_STUB_SIZE,
};
pub use config::{CalloutSupport, IdtConfig, ValidationMode};
pub use connect::{BoardInterruptController, InterruptConnector, VectorAssignment};

/// `IdtError` is an enum representing the errors reported by vector allocation and interrupt
/// connection. None of them leave partial side effects behind.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum IdtError {
    #[snafu(display("No free vector left at priority {priority}"))]
    VectorUnavailable { priority: Priority },

    #[snafu(display("Priority {priority} lies outside of the configured vector range"))]
    InvalidPriority { priority: Priority },

    #[snafu(display("Board layer could not assign a vector to {irq} at priority {priority}"))]
    BoardAllocation { irq: Irq, priority: Priority },

    #[snafu(display("Invalid vector count {vector_count}, expected 1 to 256"))]
    InvalidConfiguration { vector_count: u16 },
}
