//! x87 floating-point helpers imported by translated code.
//!
//! Translated code keeps the FPU register stack in its [`CpuState`] and calls
//! one helper per x87 instruction. Memory operands are passed by value (and
//! returned by value for stores); register operands are passed as the `st(i)`
//! index. Arithmetic is carried out in `f64`.

use super::cpu::{CpuState, FpuState};
use websynth_macros::host_symbol;

fn fpu<'a>(cpu: *mut CpuState) -> &'a mut FpuState {
    // SAFETY: translated code always passes the pointer it was called with,
    // which points at the calling thread's live register block.
    unsafe { &mut (*cpu).fpu }
}

// Loads

#[host_symbol]
pub fn x87_fld_float(cpu: *mut CpuState, value: f64) {
    fpu(cpu).push(value);
}

#[host_symbol]
pub fn x87_fld_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    let value = fpu.st(i);
    fpu.push(value);
}

#[host_symbol]
pub fn x87_fild_int32(cpu: *mut CpuState, value: i32) {
    fpu(cpu).push(f64::from(value));
}

#[host_symbol]
pub fn x87_fild_int64(cpu: *mut CpuState, value: i64) {
    fpu(cpu).push(value as f64);
}

#[host_symbol]
pub fn x87_fldz_void(cpu: *mut CpuState) {
    fpu(cpu).push(0.0);
}

// Stores

#[host_symbol]
pub fn x87_fst_float(cpu: *mut CpuState) -> f64 {
    fpu(cpu).st(0)
}

#[host_symbol]
pub fn x87_fstp_float(cpu: *mut CpuState) -> f64 {
    fpu(cpu).pop()
}

#[host_symbol]
pub fn x87_fst_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    let value = fpu.st(0);
    fpu.set_st(i, value);
}

#[host_symbol]
pub fn x87_fstp_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    let value = fpu.st(0);
    fpu.set_st(i, value);
    fpu.pop();
}

#[host_symbol]
pub fn x87_fist_int32(cpu: *mut CpuState) -> i32 {
    let fpu = fpu(cpu);
    fpu.to_i32(fpu.st(0))
}

#[host_symbol]
pub fn x87_fistp_int32(cpu: *mut CpuState) -> i32 {
    let fpu = fpu(cpu);
    let value = fpu.pop();
    fpu.to_i32(value)
}

#[host_symbol]
pub fn x87_fistp_int16(cpu: *mut CpuState) -> i16 {
    let fpu = fpu(cpu);
    let value = fpu.pop();
    fpu.to_i16(value)
}

/// `_ftol`: truncate `st(0)` to a 64-bit integer and pop, whatever the
/// rounding mode.
#[host_symbol]
pub fn x87_ftol_int64(cpu: *mut CpuState) -> i64 {
    let value = fpu(cpu).pop().trunc();
    if value.is_nan() || value < -9_223_372_036_854_775_808.0 || value >= 9_223_372_036_854_775_808.0 {
        i64::MIN
    } else {
        value as i64
    }
}

#[host_symbol]
pub fn x87_fxch_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    let st0 = fpu.st(0);
    let sti = fpu.st(i);
    fpu.set_st(0, sti);
    fpu.set_st(i, st0);
}

// Arithmetic with a memory operand: st(0) = st(0) op value

#[host_symbol]
pub fn x87_fadd_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) + value);
}

#[host_symbol]
pub fn x87_fsub_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) - value);
}

#[host_symbol]
pub fn x87_fsubr_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.set_st(0, value - fpu.st(0));
}

#[host_symbol]
pub fn x87_fmul_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) * value);
}

#[host_symbol]
pub fn x87_fdiv_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) / value);
}

#[host_symbol]
pub fn x87_fdivr_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.set_st(0, value / fpu.st(0));
}

#[host_symbol]
pub fn x87_fiadd_int32(cpu: *mut CpuState, value: i32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) + f64::from(value));
}

#[host_symbol]
pub fn x87_fisub_int32(cpu: *mut CpuState, value: i32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) - f64::from(value));
}

#[host_symbol]
pub fn x87_fimul_int32(cpu: *mut CpuState, value: i32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) * f64::from(value));
}

#[host_symbol]
pub fn x87_fidiv_int32(cpu: *mut CpuState, value: i32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) / f64::from(value));
}

// Arithmetic between registers

#[host_symbol]
pub fn x87_fadd_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) + fpu.st(i));
}

#[host_symbol]
pub fn x87_faddp_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(i, fpu.st(i) + fpu.st(0));
    fpu.pop();
}

#[host_symbol]
pub fn x87_fsub_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) - fpu.st(i));
}

#[host_symbol]
pub fn x87_fsubp_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(i, fpu.st(i) - fpu.st(0));
    fpu.pop();
}

#[host_symbol]
pub fn x87_fmul_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0) * fpu.st(i));
}

/// `fmul st(i), st(0)`
#[host_symbol]
pub fn x87_fmul_to_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(i, fpu.st(i) * fpu.st(0));
}

#[host_symbol]
pub fn x87_fmulp_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(i, fpu.st(i) * fpu.st(0));
    fpu.pop();
}

#[host_symbol]
pub fn x87_fdivp_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.set_st(i, fpu.st(i) / fpu.st(0));
    fpu.pop();
}

// Unary

#[host_symbol]
pub fn x87_fabs_void(cpu: *mut CpuState) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0).abs());
}

#[host_symbol]
pub fn x87_fchs_void(cpu: *mut CpuState) {
    let fpu = fpu(cpu);
    fpu.set_st(0, -fpu.st(0));
}

#[host_symbol]
pub fn x87_fsin_void(cpu: *mut CpuState) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0).sin());
}

/// `fptan`: replace `st(0)` with its tangent, then push 1.0.
#[host_symbol]
pub fn x87_fptan_void(cpu: *mut CpuState) {
    let fpu = fpu(cpu);
    fpu.set_st(0, fpu.st(0).tan());
    fpu.push(1.0);
}

// Comparisons

#[host_symbol]
pub fn x87_fcom_float(cpu: *mut CpuState, value: f64) {
    fpu(cpu).compare(value);
}

#[host_symbol]
pub fn x87_fcomp_float(cpu: *mut CpuState, value: f64) {
    let fpu = fpu(cpu);
    fpu.compare(value);
    fpu.pop();
}

#[host_symbol]
pub fn x87_fucom_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.compare(fpu.st(i));
}

#[host_symbol]
pub fn x87_fucomp_st(cpu: *mut CpuState, i: u32) {
    let fpu = fpu(cpu);
    fpu.compare(fpu.st(i));
    fpu.pop();
}

// Control and status

#[host_symbol]
pub fn x87_fldcw_uint16(cpu: *mut CpuState, cw: u16) {
    fpu(cpu).cw = u32::from(cw);
}

#[host_symbol]
pub fn x87_fnstcw_void(cpu: *mut CpuState) -> u16 {
    fpu(cpu).cw as u16
}

#[host_symbol]
pub fn x87_fnstsw_void(cpu: *mut CpuState) -> u16 {
    fpu(cpu).status_word()
}
