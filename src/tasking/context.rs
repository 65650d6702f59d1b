/// Registers a descheduled process needs back: the System V callee-saved
/// set plus the stack pointer and resume address.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Placeholder for the boot task. Its first switch away fills it in.
    pub fn empty() -> Self {
        Context {
            rsp: 0, rbp: 0, rbx: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0,
        }
    }

    /// Context for a fresh kernel task.
    ///
    /// The task starts in `trampoline` with `entry` in r12; the trampoline
    /// enables interrupts, calls `entry` and exits the task when it returns.
    pub fn new(trampoline: u64, entry: u64, stack_top: u64) -> Self {
        Context {
            // `call` inside the trampoline pushes the return address, leaving
            // the callee with the ABI-mandated rsp % 16 == 8.
            rsp: stack_top & !0xF,
            rbp: 0,
            rbx: 0,
            r12: entry,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: trampoline,
        }
    }
}

#[cfg(not(test))]
pub use self::switch::{switch_context, task_trampoline};

#[cfg(not(test))]
mod switch {
    use core::arch::naked_asm;
    use core::mem::offset_of;
    use super::Context;

    /// Park the running process in `old` and resume the one in `new`.
    ///
    /// `old` continues at the local label when it is next switched to, which
    /// returns into `tasking::schedule()` of the process that was descheduled.
    ///
    /// # Safety
    /// `old` must be writable and `new` must hold a context captured by this
    /// function or built by `Context::new` on a live stack.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_context(old: *mut Context, new: *const Context) {
        naked_asm!(
            "mov [rdi + {rsp}], rsp",
            "mov [rdi + {rbp}], rbp",
            "mov [rdi + {rbx}], rbx",
            "mov [rdi + {r12}], r12",
            "mov [rdi + {r13}], r13",
            "mov [rdi + {r14}], r14",
            "mov [rdi + {r15}], r15",
            "lea rax, [rip + 2f]",
            "mov [rdi + {rip}], rax",

            "mov rsp, [rsi + {rsp}]",
            "mov rbp, [rsi + {rbp}]",
            "mov rbx, [rsi + {rbx}]",
            "mov r12, [rsi + {r12}]",
            "mov r13, [rsi + {r13}]",
            "mov r14, [rsi + {r14}]",
            "mov r15, [rsi + {r15}]",
            "jmp [rsi + {rip}]",

            "2:",
            "ret",
            rsp = const offset_of!(Context, rsp),
            rbp = const offset_of!(Context, rbp),
            rbx = const offset_of!(Context, rbx),
            r12 = const offset_of!(Context, r12),
            r13 = const offset_of!(Context, r13),
            r14 = const offset_of!(Context, r14),
            r15 = const offset_of!(Context, r15),
            rip = const offset_of!(Context, rip),
        );
    }

    /// First code a new kernel task runs. r12 holds the entry function.
    #[unsafe(naked)]
    pub extern "C" fn task_trampoline() -> ! {
        naked_asm!(
            "sti",
            "call r12",
            "xor edi, edi",
            "jmp {exit}",
            exit = sym crate::tasking::task_exit,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_layout_matches_switch_offsets() {
        assert_eq!(offset_of!(Context, rsp), 0x00);
        assert_eq!(offset_of!(Context, rip), 0x38);
        assert_eq!(core::mem::size_of::<Context>(), 0x40);
    }

    #[test]
    fn test_fresh_task_stack_is_aligned() {
        let ctx = Context::new(0x1000, 0x2000, 0x8000_0007);
        assert_eq!(ctx.rsp % 16, 0);
        assert_eq!((ctx.rip, ctx.r12), (0x1000, 0x2000));
    }
}
