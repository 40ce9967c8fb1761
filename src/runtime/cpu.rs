//! Emulated 32-bit register file and x87 register stack.

/// Index of each general-purpose register in [`CpuState::regs`].
pub mod reg {
    pub const EAX: usize = 0;
    pub const ECX: usize = 1;
    pub const EDX: usize = 2;
    pub const EBX: usize = 3;
    pub const ESP: usize = 4;
    pub const EBP: usize = 5;
    pub const ESI: usize = 6;
    pub const EDI: usize = 7;
}

/// Condition code bits of the x87 status word.
pub const FPU_C0: u16 = 0x0100;
pub const FPU_C2: u16 = 0x0400;
pub const FPU_C3: u16 = 0x4000;

/// Control word after `finit`: all exceptions masked, 64-bit precision,
/// round to nearest.
pub const FPU_DEFAULT_CW: u16 = 0x037f;

/// Initial EFLAGS: IF set, IOPL 3.
pub const DEFAULT_EFLAGS: u32 = 0x3202;

/// x87 register stack.
///
/// Registers are held as `f64`; `st(i)` is `st[(top + i) & 7]`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FpuState {
    pub st: [f64; 8],
    pub top: u32,
    /// C0/C2/C3 bits as they appear in the status word.
    pub sw_cond: u32,
    pub cw: u32,
}

impl Default for FpuState {
    fn default() -> Self {
        Self {
            st: [0.0; 8],
            top: 0,
            sw_cond: 0,
            cw: u32::from(FPU_DEFAULT_CW),
        }
    }
}

/// Rounding mode selected by the RC field of the control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Nearest,
    Down,
    Up,
    Truncate,
}

impl FpuState {
    fn slot(&self, i: u32) -> usize {
        ((self.top + i) & 7) as usize
    }

    pub fn st(&self, i: u32) -> f64 {
        self.st[self.slot(i)]
    }

    pub fn set_st(&mut self, i: u32, value: f64) {
        let slot = self.slot(i);
        self.st[slot] = value;
    }

    pub fn push(&mut self, value: f64) {
        self.top = (self.top + 7) & 7;
        let slot = self.top as usize;
        self.st[slot] = value;
    }

    pub fn pop(&mut self) -> f64 {
        let value = self.st(0);
        self.top = (self.top + 1) & 7;
        value
    }

    pub fn rounding(&self) -> Rounding {
        match (self.cw >> 10) & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Truncate,
        }
    }

    /// `fnstsw`: condition bits plus TOP in bits 11-13.
    pub fn status_word(&self) -> u16 {
        (self.sw_cond as u16 & (FPU_C0 | FPU_C2 | FPU_C3)) | ((self.top as u16 & 7) << 11)
    }

    /// `fcom`/`fucom`: compare `st(0)` with `other`.
    pub fn compare(&mut self, other: f64) {
        let st0 = self.st(0);
        self.sw_cond = u32::from(if st0.is_nan() || other.is_nan() {
            FPU_C0 | FPU_C2 | FPU_C3
        } else if st0 > other {
            0
        } else if st0 < other {
            FPU_C0
        } else {
            FPU_C3
        });
    }

    /// Round `value` to an integer with the current rounding mode.
    pub fn round(&self, value: f64) -> f64 {
        match self.rounding() {
            Rounding::Nearest => value.round_ties_even(),
            Rounding::Down => value.floor(),
            Rounding::Up => value.ceil(),
            Rounding::Truncate => value.trunc(),
        }
    }

    /// `fist` conversion. NaN and out-of-range values produce the integer
    /// indefinite (the most negative value).
    pub fn to_i16(&self, value: f64) -> i16 {
        let r = self.round(value);
        if r.is_nan() || r < f64::from(i16::MIN) || r > f64::from(i16::MAX) {
            i16::MIN
        } else {
            r as i16
        }
    }

    pub fn to_i32(&self, value: f64) -> i32 {
        let r = self.round(value);
        if r.is_nan() || r < f64::from(i32::MIN) || r > f64::from(i32::MAX) {
            i32::MIN
        } else {
            r as i32
        }
    }

    pub fn to_i64(&self, value: f64) -> i64 {
        let r = self.round(value);
        // 2^63 is exactly representable; anything at or above it overflows.
        if r.is_nan() || r < -9_223_372_036_854_775_808.0 || r >= 9_223_372_036_854_775_808.0 {
            i64::MIN
        } else {
            r as i64
        }
    }
}

/// Register state seen by translated code.
///
/// The struct lives inside the thread's emulated stack mapping; translated
/// functions receive a pointer to it as their only argument.
#[derive(Debug)]
#[repr(C)]
pub struct CpuState {
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI
    pub regs: [u32; 8],

    pub eflags: u32,

    pub fpu: FpuState,

    /// Host address of the stack mapping.
    pub stack_bottom: u64,

    /// Host address ESP is reset to before each call.
    pub stack_top: u64,
}

impl CpuState {
    pub fn new(stack_bottom: u64, stack_top: u64, esp: u32) -> Self {
        let mut regs = [0; 8];
        regs[reg::ESP] = esp;
        Self {
            regs,
            eflags: DEFAULT_EFLAGS,
            fpu: FpuState::default(),
            stack_bottom,
            stack_top,
        }
    }

    pub fn eax(&self) -> u32 {
        self.regs[reg::EAX]
    }

    pub fn esp(&self) -> u32 {
        self.regs[reg::ESP]
    }
}
