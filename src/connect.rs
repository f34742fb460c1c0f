use log::{debug, warn};
use x86_64::PrivilegeLevel;

use crate::arch::irq::{Irq, Priority, Vector};
use crate::arch::x86::idt::InterruptDescriptorTable;
use crate::arch::x86::stub::{
    Callout, CodeAddress, KernelEntryPoints, StubMemory, StubRequest, StubSynthesizer,
};
use crate::config::IdtConfig;
use crate::IdtError;

/// Vector handed out by the board layer together with the callouts its interrupt controller
/// needs around the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorAssignment {
    pub vector: Vector,
    pub boi: Callout,
    pub eoi: Callout,
}

impl VectorAssignment {
    pub const fn new(vector: Vector) -> Self {
        Self {
            vector,
            boi: Callout::NONE,
            eoi: Callout::NONE,
        }
    }
}

/// Board support side of interrupt connection.
///
/// # Safety
///
/// Every vector returned by `allocate_vector` must lie within the interrupt descriptor table the
/// connector installs into.
///
/// A vector must not be returned again while an earlier `connect` to it may still be running,
/// since both would write its gate at the same time. Controllers with fixed vectors have to
/// serialize connects to the same `irq`.
pub unsafe trait BoardInterruptController {
    /// Picks a vector for `irq` honouring `priority`, usually through a `VectorAllocator`, and
    /// programs the interrupt controller so that `irq` raises it.
    ///
    /// Controllers with fixed vectors return the vector wired to `irq` regardless of
    /// `priority`.
    fn allocate_vector(&self, irq: Irq, priority: Priority) -> Result<VectorAssignment, IdtError>;
}

/// Connects interrupt service routines to board interrupts through synthesized stubs.
pub struct InterruptConnector<B: BoardInterruptController> {
    board: B,
    table: InterruptDescriptorTable,
    synthesizer: StubSynthesizer,
}

impl<B: BoardInterruptController> InterruptConnector<B> {
    pub fn new(
        config: &IdtConfig,
        board: B,
        table: InterruptDescriptorTable,
        entry_points: KernelEntryPoints,
    ) -> Self {
        Self {
            board,
            table,
            synthesizer: StubSynthesizer::new(config.callouts, entry_points),
        }
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn table(&self) -> &InterruptDescriptorTable {
        &self.table
    }

    /// Connects `routine` to `irq` and returns the vector it was assigned.
    ///
    /// When `irq` fires, the stub written to `stub` enters the kernel, runs the controller's
    /// begin-of-interrupt callout, calls `routine` with `parameter`, runs the end-of-interrupt
    /// callout and leaves through the kernel's exit path. Nothing is written when the board
    /// cannot assign a vector.
    ///
    /// Connecting again with the same `stub` rewrites it, which is only sound once its previous
    /// vector can no longer fire.
    pub fn connect(
        &self,
        irq: Irq,
        priority: Priority,
        routine: CodeAddress,
        parameter: u32,
        stub: &'static mut StubMemory,
    ) -> Result<Vector, IdtError> {
        let assignment = self
            .board
            .allocate_vector(irq, priority)
            .inspect_err(|error| warn!("Failed to connect {irq}: {error}"))?;

        let base = CodeAddress::of_stub(stub);
        let request = StubRequest {
            routine,
            parameter,
            boi: assignment.boi,
            eoi: assignment.eoi,
        };

        self.synthesizer.synthesize(stub, base, &request);

        // SAFETY: Board controllers only assign vectors inside the table
        unsafe {
            self.table
                .install(assignment.vector, base.as_u32(), PrivilegeLevel::Ring0);
        }

        debug!(
            "Connected {irq} at priority {priority} to vector {}",
            assignment.vector
        );

        Ok(assignment.vector)
    }

    /// Points `vector` straight at `routine`, bypassing vector allocation and stub synthesis.
    ///
    /// # Safety
    ///
    /// See [`InterruptDescriptorTable::install`].
    pub unsafe fn install_descriptor(
        &self,
        vector: Vector,
        routine: CodeAddress,
        privilege_level: PrivilegeLevel,
    ) {
        self.table.install(vector, routine.as_u32(), privilege_level);
    }
}
