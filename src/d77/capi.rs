//! `D77_*` functions with C linkage.
//!
//! These mirror the synthesizer's own interface over one process-wide
//! [`Synth`]. Pointer arguments must point into memory obtained from
//! [`D77_AllocateMemory`]. Calling a facade function with no library loaded
//! is fatal (exit status 3), as is a failure of the execution bridge (exit
//! status 2).

#![allow(non_snake_case)]

use super::{Effect, Synth};
use crate::sys::{self, LowMemory};
use crate::Result;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::process;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, warn};

static SYNTH: Mutex<Option<Synth>> = Mutex::new(None);

/// Blocks handed out by `D77_AllocateMemory`.
static ALLOCATIONS: Mutex<Vec<LowMemory>> = Mutex::new(Vec::new());

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn with_synth<R>(f: impl FnOnce(&Synth) -> Result<R>) -> R {
    let guard = lock(&SYNTH);
    let Some(synth) = guard.as_ref() else {
        error!("synthesizer library is not loaded");
        process::exit(3);
    };
    match f(synth) {
        Ok(value) => value,
        Err(err) => {
            error!("{}", err);
            process::exit(2);
        }
    }
}

fn guest(synth: &Synth, ptr: *const c_void) -> Result<u32> {
    if ptr.is_null() {
        return Ok(0);
    }
    synth.space().to_guest(ptr as u64)
}

/// Load the synthesizer library. Returns 0 if it cannot be loaded, lacks an
/// entry point, or a library is already loaded.
///
/// # Safety
///
/// `path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn D77_LoadLibrary(path: *const c_char) -> c_int {
    let mut slot = lock(&SYNTH);
    if slot.is_some() || path.is_null() {
        return 0;
    }
    let path = unsafe { CStr::from_ptr(path) };
    let Ok(path) = path.to_str() else {
        error!("library path is not valid UTF-8");
        return 0;
    };
    match Synth::load(path) {
        Ok(synth) => {
            *slot = Some(synth);
            1
        }
        Err(_) => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_FreeLibrary() {
    let synth = lock(&SYNTH).take();
    drop(synth);
}

/// Allocate `size` bytes of zeroed memory below 2GB, or null.
#[unsafe(no_mangle)]
pub extern "C" fn D77_AllocateMemory(size: c_uint) -> *mut c_void {
    match sys::map_memory(size, false) {
        Ok(mut mem) => {
            let ptr = mem.as_mut_ptr() as *mut c_void;
            lock(&ALLOCATIONS).push(mem);
            ptr
        }
        Err(err) => {
            error!("{}", err);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_FreeMemory(mem: *mut c_void, size: c_uint) {
    if mem.is_null() {
        return;
    }
    let mut allocations = lock(&ALLOCATIONS);
    match allocations.iter().position(|m| m.addr() == mem as u64) {
        Some(index) => {
            let block = allocations.swap_remove(index);
            if block.len() != size as usize {
                warn!(
                    "freeing 0x{:x} bytes at {:p} allocated as 0x{:x} bytes",
                    size,
                    mem,
                    block.len()
                );
            }
            sys::unmap_memory(block);
        }
        None => warn!("freeing unknown block at {:p}", mem),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_ValidateSettings(settings: *mut c_void) {
    with_synth(|synth| synth.validate_settings(guest(synth, settings)?));
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeDataFile(data: *mut u8, len: u32) -> u32 {
    with_synth(|synth| {
        let ok = synth.initialize_data_file(guest(synth, data as *const c_void)?, len)?;
        Ok(u32::from(ok))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeSynth(sampling_freq: u32, polyphony: u32, time_reso: u32) -> u32 {
    with_synth(|synth| Ok(u32::from(synth.initialize_synth(sampling_freq, polyphony, time_reso)?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeUnknown(value: u32) {
    with_synth(|synth| synth.initialize_unknown(value));
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeEffect(effect: u32, enabled: u32) {
    with_synth(|synth| {
        if Effect::try_from(effect).is_err() {
            warn!("unknown effect {}, passing it to the library", effect);
        }
        synth.initialize_effect_id(effect, enabled != 0)
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeCpuLoad(low: u32, high: u32) {
    with_synth(|synth| synth.initialize_cpu_load(low, high));
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeParameters(parameters: *const c_void) {
    with_synth(|synth| synth.initialize_parameters(guest(synth, parameters)?));
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_InitializeMasterVolume(volume: u32) {
    with_synth(|synth| synth.initialize_master_volume(volume));
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_GetRenderedSamplesPerCall() -> u32 {
    with_synth(|synth| synth.rendered_samples_per_call())
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_MidiMessageShort(message: u32) -> u32 {
    with_synth(|synth| synth.midi_message_short(message))
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_MidiMessageLong(message: *const u8, len: u32) -> u32 {
    with_synth(|synth| synth.midi_message_long(guest(synth, message as *const c_void)?, len))
}

#[unsafe(no_mangle)]
pub extern "C" fn D77_RenderSamples(samples: *mut i16) -> u32 {
    with_synth(|synth| {
        let ok = synth.render_samples(guest(synth, samples as *const c_void)?)?;
        Ok(u32::from(ok))
    })
}

/// Whether a library is currently loaded through this interface.
pub fn is_loaded() -> bool {
    lock(&SYNTH).is_some()
}
