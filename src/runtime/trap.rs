// src/runtime/trap.rs
//
// Converts guest failures into host error values. Guest code has no
// unwinding: hardware faults (masked-address wildness cannot occur,
// but division by zero and guest aborts can) arrive as signals, so the
// guest entry point runs under a sigsetjmp trampoline and the signal
// handler longjmps back out with a trap code.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[error("guest trap: {message}")]
pub struct Trap {
    pub message: String,
}

/// siglongjmp value used by `raise_trap`, distinct from signal numbers.
const RAISED_TRAP: i32 = 128;

// Platform jmp_buf. Sized generously; glibc's sigjmp_buf is 200 bytes
// on x86_64.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct JmpBuf {
    _data: [u8; 256],
}

impl JmpBuf {
    pub const fn zeroed() -> Self {
        JmpBuf { _data: [0; 256] }
    }
}

unsafe extern "C" {
    // sigsetjmp returns 0 on the direct call and the siglongjmp value
    // when control returns through the buffer. On Linux the real
    // symbol is __sigsetjmp.
    #[cfg(target_os = "linux")]
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp(buf: *mut JmpBuf, savemask: libc::c_int) -> libc::c_int;

    #[cfg(not(target_os = "linux"))]
    fn sigsetjmp(buf: *mut JmpBuf, savemask: libc::c_int) -> libc::c_int;

    fn siglongjmp(buf: *mut JmpBuf, val: libc::c_int) -> !;
}

thread_local! {
    static GUEST_JMP_BUF: Cell<*mut JmpBuf> = const { Cell::new(std::ptr::null_mut()) };
    static TRAP_MESSAGE: Cell<Option<String>> = const { Cell::new(None) };
}

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

fn install_trap_handler() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = trap_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        for sig in [libc::SIGSEGV, libc::SIGBUS, libc::SIGFPE, libc::SIGILL] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
}

extern "C" fn trap_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let buf = GUEST_JMP_BUF.with(|b| b.get());
    if !buf.is_null() {
        unsafe { siglongjmp(buf, sig) };
    }
    // Fault outside a guest call: restore the default disposition and
    // take the signal again.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &action, std::ptr::null_mut());
        libc::raise(sig);
    }
}

fn describe_signal(sig: i32) -> &'static str {
    match sig {
        libc::SIGFPE => "integer divide error",
        libc::SIGSEGV => "memory access violation",
        libc::SIGBUS => "bus error",
        libc::SIGILL => "illegal instruction",
        _ => "fault",
    }
}

/// Abort the current guest call with a message. Called by host
/// intrinsics (guest abort, assertion failure). Never returns; control
/// resumes at the `catch_traps` trampoline.
pub fn raise_trap(message: impl Into<String>) -> ! {
    let message = message.into();
    let buf = GUEST_JMP_BUF.with(|b| b.get());
    if buf.is_null() {
        eprintln!("guest trap outside a guest call: {}", message);
        std::process::abort();
    }
    TRAP_MESSAGE.with(|m| m.set(Some(message)));
    unsafe { siglongjmp(buf, RAISED_TRAP) }
}

/// Run a guest entry under the trap trampoline. Faults and raised
/// traps surface as `Err(Trap)`; everything else passes through.
pub fn catch_traps<R>(f: impl FnOnce() -> R) -> Result<R, Trap> {
    install_trap_handler();

    let mut buf = JmpBuf::zeroed();
    let previous = GUEST_JMP_BUF.with(|b| b.replace(&mut buf));

    // savemask=1 so the signal mask is restored when the handler
    // longjmps out mid-delivery.
    let code = unsafe { sigsetjmp(&mut buf, 1) };
    if code == 0 {
        let result = f();
        GUEST_JMP_BUF.with(|b| b.set(previous));
        Ok(result)
    } else {
        GUEST_JMP_BUF.with(|b| b.set(previous));
        let message = TRAP_MESSAGE.with(|m| m.take());
        Err(Trap {
            message: message.unwrap_or_else(|| describe_signal(code).to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_calls_pass_through() {
        let result = catch_traps(|| 7);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn raised_traps_surface_as_errors() {
        let result: Result<i32, Trap> = catch_traps(|| {
            raise_trap("abort() called");
        });
        let trap = result.unwrap_err();
        assert!(trap.message.contains("abort"));
    }

    #[test]
    fn trampoline_restores_outer_context() {
        let outer = catch_traps(|| {
            let inner: Result<i32, Trap> = catch_traps(|| raise_trap("inner"));
            assert!(inner.is_err());
            11
        });
        assert_eq!(outer.unwrap(), 11);
    }
}
