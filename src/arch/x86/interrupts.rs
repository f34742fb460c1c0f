/// Mutual exclusion primitive guarding the vector bitset.
///
/// `enter` masks whatever could interleave with the caller and returns the state `exit` needs to
/// restore it. Sections nest, the state of the outermost one is restored last.
pub trait CriticalSection {
    type State;

    fn enter(&self) -> Self::State;
    fn exit(&self, state: Self::State);
}

/// Holds a critical section open until dropped, restoring the previous state on every exit path.
pub struct CriticalSectionGuard<'a, C: CriticalSection> {
    section: &'a C,
    state: Option<C::State>,
}

impl<'a, C: CriticalSection> CriticalSectionGuard<'a, C> {
    pub fn new(section: &'a C) -> Self {
        let state = section.enter();

        Self {
            section,
            state: Some(state),
        }
    }
}

impl<C: CriticalSection> Drop for CriticalSectionGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.section.exit(state);
        }
    }
}

/// Masks maskable interrupts on the current processor, re-enabling them on exit only if they
/// were enabled on entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalInterruptMask;

#[cfg(target_arch = "x86")]
impl CriticalSection for LocalInterruptMask {
    type State = bool;

    fn enter(&self) -> bool {
        use super::asm;

        let were_enabled = asm::interrupts_enabled();
        asm::cli();

        were_enabled
    }

    fn exit(&self, were_enabled: bool) {
        if were_enabled {
            super::asm::sti();
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl CriticalSection for LocalInterruptMask {
    type State = bool;

    fn enter(&self) -> bool {
        use x86_64::instructions::interrupts;

        let were_enabled = interrupts::are_enabled();
        interrupts::disable();

        were_enabled
    }

    fn exit(&self, were_enabled: bool) {
        if were_enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
}
