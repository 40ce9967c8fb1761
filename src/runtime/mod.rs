//! Per-thread execution context for calling into a loaded image.
//!
//! Exported functions of the synthesizer are translated 32-bit code that
//! takes a single argument, a pointer to the caller's [`CpuState`]. Integer
//! parameters travel in ECX/EDX and on an emulated stack, and the result comes
//! back in EAX. Every OS thread that calls into the image owns one context:
//! a 1MB stack below 2GB with the register block stored near its top.
//!
//! ```text
//! bottom                                   bottom + 1020K   bottom + 1022K
//!   | <------------- stack grows down ------- | (reserved) ----| CpuState |
//! ```

pub mod cpu;
pub mod x87;

pub use cpu::{CpuState, FpuState};

use crate::sys::{AddressSpace, LowMemory};
use crate::{Error, Result};
use cpu::reg;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Size of the emulated stack mapping.
pub const STACK_SIZE: usize = 1024 * 1024;

/// Offset of the register block inside the stack mapping.
const CPU_OFFSET: usize = 1024 * 1022;

/// Offset ESP starts at (and is reset to before each call).
const STACK_TOP_OFFSET: usize = 1024 * 1020;

/// Signature of every translated entry point.
pub type TranslatedFn = unsafe extern "C" fn(*mut CpuState);

/// A thread's emulated stack and registers.
pub struct ExecutionContext {
    stack: LowMemory,
    space: Arc<dyn AddressSpace>,
    cpu: *mut CpuState,
}

impl ExecutionContext {
    pub fn new(space: &Arc<dyn AddressSpace>) -> Result<Self> {
        let mut stack = LowMemory::new(space, STACK_SIZE)?;
        let bottom = stack.addr();
        let stack_top = bottom + STACK_TOP_OFFSET as u64;
        let esp = space.to_guest(stack_top)?;

        let cpu = unsafe { stack.as_mut_ptr().add(CPU_OFFSET) } as *mut CpuState;
        unsafe {
            cpu.write(CpuState::new(bottom, stack_top, esp));
        }
        debug!(
            "Execution context: stack at 0x{:016x}, esp=0x{:08x}",
            bottom, esp
        );
        Ok(Self {
            stack,
            space: space.clone(),
            cpu,
        })
    }

    pub fn state(&self) -> &CpuState {
        unsafe { &*self.cpu }
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        unsafe { &mut *self.cpu }
    }

    pub fn as_ptr(&mut self) -> *mut CpuState {
        self.cpu
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    /// Host address of the bottom of the stack mapping.
    pub fn stack_bottom(&self) -> u64 {
        self.stack.addr()
    }

    /// Discard anything left on the emulated stack.
    pub fn reset_stack(&mut self) -> Result<()> {
        let top = self.state().stack_top;
        let esp = self.space.to_guest(top)?;
        self.state_mut().regs[reg::ESP] = esp;
        Ok(())
    }

    /// Push a 32-bit value onto the emulated stack.
    pub fn push(&mut self, value: u32) -> Result<()> {
        let esp = self.state().esp().wrapping_sub(4);
        let addr = self.space.from_guest(esp);
        if addr < self.stack_bottom() {
            return Err(Error::Bridge("emulated stack overflow".to_string()));
        }
        unsafe {
            (addr as *mut u32).write_unaligned(value);
        }
        self.state_mut().regs[reg::ESP] = esp;
        Ok(())
    }

    /// Read the 32-bit value at the top of the emulated stack.
    pub fn peek(&self) -> u32 {
        let addr = self.space.from_guest(self.state().esp());
        unsafe { (addr as *const u32).read_unaligned() }
    }

    /// Call a translated function with the `__fastcall` convention: the first
    /// two arguments in ECX and EDX, the rest pushed right to left.
    ///
    /// # Safety
    ///
    /// `func` must be the address of a translated entry point in a loaded
    /// image, and pointer arguments must be window-relative addresses of
    /// memory that stays valid for the duration of the call.
    pub unsafe fn fastcall(&mut self, func: u64, ecx: u32, edx: u32, stack: &[u32]) -> Result<u32> {
        if func == 0 {
            return Err(Error::Bridge("call through a null entry point".to_string()));
        }
        self.reset_stack()?;
        for &value in stack.iter().rev() {
            self.push(value)?;
        }
        {
            let state = self.state_mut();
            state.regs[reg::ECX] = ecx;
            state.regs[reg::EDX] = edx;
        }
        trace!(
            "fastcall 0x{:016x} ecx=0x{:08x} edx=0x{:08x} stack={:?}",
            func, ecx, edx, stack
        );
        let entry: TranslatedFn = unsafe { std::mem::transmute(func as usize) };
        unsafe { entry(self.cpu) };
        Ok(self.state().eax())
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// Create this thread's context in `space` if it does not exist yet.
pub fn initialize(space: &Arc<dyn AddressSpace>) -> Result<()> {
    with_context(space, |_| ())
}

/// Release this thread's context. Does nothing if there is none, and keeps
/// it when called from inside [`with_context`].
pub fn deinitialize() {
    CONTEXT.with(|slot| match slot.try_borrow_mut() {
        Ok(mut slot) => {
            if let Some(ctx) = slot.take() {
                debug!("Releasing execution context at 0x{:016x}", ctx.stack_bottom());
            }
        }
        Err(_) => warn!("execution context is in use, not releasing it"),
    });
}

pub fn is_initialized() -> bool {
    CONTEXT.with(|slot| slot.try_borrow().map(|s| s.is_some()).unwrap_or(true))
}

/// Run `f` with this thread's context, creating it on first use.
///
/// Fails if the context is already borrowed further up the stack or lives
/// in a different address window.
pub fn with_context<R>(
    space: &Arc<dyn AddressSpace>,
    f: impl FnOnce(&mut ExecutionContext) -> R,
) -> Result<R> {
    CONTEXT.with(|slot| {
        let mut slot = slot
            .try_borrow_mut()
            .map_err(|_| Error::Bridge("execution context is already in use".to_string()))?;
        if slot.is_none() {
            *slot = Some(ExecutionContext::new(space)?);
        }
        let ctx = slot
            .as_mut()
            .ok_or_else(|| Error::Bridge("no execution context".to_string()))?;
        if ctx.space().window_base() != space.window_base() {
            return Err(Error::Bridge(format!(
                "execution context belongs to the window at 0x{:x}",
                ctx.space().window_base()
            )));
        }
        Ok(f(ctx))
    })
}
