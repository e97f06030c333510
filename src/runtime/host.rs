// src/runtime/host.rs
//
// Host-side intrinsics callable from guest code, plus the runtime
// helpers the code generator links against. Guest pointers are integer
// offsets into the sandboxed linear memory and every dereference here
// is bounds-checked against the committed size.

use std::cell::{Cell, UnsafeCell};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ast::types::{FunctionType, TypeId};
use crate::runtime::intrinsics;
use crate::runtime::memory::LinearMemory;
use crate::runtime::trap::raise_trap;

thread_local! {
    static CURRENT_MEMORY: Cell<*const LinearMemory> = const { Cell::new(std::ptr::null()) };
}

/// Makes a guest memory visible to host intrinsics for the duration of
/// a guest call. Restores the previous memory on drop so nested
/// invokes across instances behave.
pub struct MemoryScope {
    previous: *const LinearMemory,
}

pub fn enter_memory(memory: &LinearMemory) -> MemoryScope {
    let previous = CURRENT_MEMORY.with(|m| m.replace(memory as *const LinearMemory));
    MemoryScope { previous }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        CURRENT_MEMORY.with(|m| m.set(self.previous));
    }
}

fn with_memory<R>(f: impl FnOnce(&LinearMemory) -> R) -> R {
    let ptr = CURRENT_MEMORY.with(|m| m.get());
    if ptr.is_null() {
        raise_trap("host intrinsic called outside a guest call");
    }
    f(unsafe { &*ptr })
}

// --- runtime helpers linked directly by generated code ---------------

/// Float remainder; the backend has no frem instruction.
pub extern "C" fn marmot_frem(a: f64, b: f64) -> f64 {
    a % b
}

pub extern "C" fn marmot_fremf(a: f32, b: f32) -> f32 {
    a % b
}

// --- host intrinsics -------------------------------------------------

extern "C" fn host_sbrk(num_bytes: i32) -> i32 {
    with_memory(|memory| memory.sbrk(num_bytes as i64) as i32)
}

extern "C" fn host_time(address: i32) -> i32 {
    let now = unsafe { libc::time(std::ptr::null_mut()) } as i32;
    if address != 0 {
        with_memory(|memory| {
            if memory.write_u32(address as u32, now as u32).is_none() {
                raise_trap("_time: out-of-bounds guest pointer");
            }
        });
    }
    now
}

extern "C" fn host_abort() {
    raise_trap("abort() called");
}

extern "C" fn host_assert_fail(condition: i32, _filename: i32, line: i32, _function: i32) {
    raise_trap(format!(
        "assertion failed (condition={}, line={})",
        condition, line
    ));
}

extern "C" fn host_errno_location() -> i32 {
    0
}

extern "C" fn host_putchar(ch: i32) -> i32 {
    let byte = [ch as u8];
    let _ = std::io::stdout().write_all(&byte);
    ch
}

extern "C" fn host_write(fd: i32, address: i32, len: i32) -> i32 {
    if len < 0 {
        return -1;
    }
    with_memory(|memory| {
        let Some(bytes) = memory.slice(address as u32, len as u32) else {
            raise_trap("_write: out-of-bounds guest pointer");
        };
        let written = match fd {
            1 => std::io::stdout().write(bytes),
            2 => std::io::stderr().write(bytes),
            _ => return -1,
        };
        written.map(|n| n as i32).unwrap_or(-1)
    })
}

// Stable storage for intrinsic values bound to imported globals.
struct ValueStorage(UnsafeCell<i32>);

// Guest execution is single-threaded; these cells are only written
// through the one executing guest.
unsafe impl Sync for ValueStorage {}

static STACKTOP: ValueStorage = ValueStorage(UnsafeCell::new(512 * 1024));
static STACK_MAX: ValueStorage = ValueStorage(UnsafeCell::new(5 * 1024 * 1024));
static ABORT_FLAG: ValueStorage = ValueStorage(UnsafeCell::new(0));
static TEMP_DOUBLE_PTR: ValueStorage = ValueStorage(UnsafeCell::new(0));

/// Register the standard host intrinsics with the process-wide
/// registry. Idempotent; called at module load time.
pub fn register_host_intrinsics() {
    static REGISTERED: AtomicBool = AtomicBool::new(false);
    if REGISTERED.swap(true, Ordering::SeqCst) {
        return;
    }

    let i32_ty = TypeId::I32;
    intrinsics::register_function(
        "_sbrk",
        FunctionType::new(i32_ty, vec![i32_ty]),
        host_sbrk as *const u8,
    );
    intrinsics::register_function(
        "_time",
        FunctionType::new(i32_ty, vec![i32_ty]),
        host_time as *const u8,
    );
    intrinsics::register_function(
        "_abort",
        FunctionType::new(TypeId::Void, vec![]),
        host_abort as *const u8,
    );
    intrinsics::register_function(
        "___assert_fail",
        FunctionType::new(TypeId::Void, vec![i32_ty, i32_ty, i32_ty, i32_ty]),
        host_assert_fail as *const u8,
    );
    intrinsics::register_function(
        "___errno_location",
        FunctionType::new(i32_ty, vec![]),
        host_errno_location as *const u8,
    );
    intrinsics::register_function(
        "_putchar",
        FunctionType::new(i32_ty, vec![i32_ty]),
        host_putchar as *const u8,
    );
    intrinsics::register_function(
        "_write",
        FunctionType::new(i32_ty, vec![i32_ty, i32_ty, i32_ty]),
        host_write as *const u8,
    );

    intrinsics::register_value("STACKTOP", i32_ty, STACKTOP.0.get() as *mut u8);
    intrinsics::register_value("STACK_MAX", i32_ty, STACK_MAX.0.get() as *mut u8);
    intrinsics::register_value("ABORT", i32_ty, ABORT_FLAG.0.get() as *mut u8);
    intrinsics::register_value("tempDoublePtr", i32_ty, TEMP_DOUBLE_PTR.0.get() as *mut u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::trap::catch_traps;

    #[test]
    fn sbrk_intrinsic_grows_the_scoped_memory() {
        let memory = LinearMemory::new(0, 1 << 20).unwrap();
        let _scope = enter_memory(&memory);
        assert_eq!(host_sbrk(4096), 0);
        assert_eq!(host_sbrk(0), 4096);
    }

    #[test]
    fn abort_intrinsic_traps() {
        let memory = LinearMemory::new(0, 4096).unwrap();
        let _scope = enter_memory(&memory);
        let result = catch_traps(|| {
            host_abort();
        });
        assert!(result.unwrap_err().message.contains("abort"));
    }

    #[test]
    fn write_checks_guest_bounds() {
        let memory = LinearMemory::new(4096, 4096).unwrap();
        let _scope = enter_memory(&memory);
        let result = catch_traps(|| host_write(1, 0, 1 << 20));
        assert!(result.is_err());
    }

    #[test]
    fn registration_is_idempotent() {
        register_host_intrinsics();
        register_host_intrinsics();
        let sbrk = intrinsics::find_function("_sbrk").expect("registered");
        assert_eq!(sbrk.ty.parameters, vec![TypeId::I32]);
    }

    #[test]
    fn frem_helper_matches_ieee_remainder() {
        assert_eq!(marmot_frem(7.5, 2.0), 1.5);
        assert_eq!(marmot_fremf(-7.5, 2.0), -1.5);
    }
}
