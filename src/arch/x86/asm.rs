use core::arch::asm;

const INTERRUPT_FLAG: u32 = 1 << 9;

#[inline]
pub fn read_eflags() -> u32 {
    let eflags: u32;

    unsafe {
        asm!(
            "pushfd",
            "pop {eflags}",
            eflags = out(reg) eflags,
            options(nomem, preserves_flags),
        );
    }

    eflags
}

#[inline]
pub fn interrupts_enabled() -> bool {
    read_eflags() & INTERRUPT_FLAG != 0
}

#[inline]
pub fn cli() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

#[inline]
pub fn sti() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}
