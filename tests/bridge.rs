//! Calls into loaded code through the per-thread execution context.

#![cfg(all(target_arch = "x86_64", unix))]

mod common;

use common::{Image, RETURN_ECX, RETURN_EDX, RETURN_STACK_ARG};
use std::thread;
use websynth::runtime::{self, STACK_SIZE};
use websynth::{Library, Synth, find_symbol, load_library};

fn echo_library(dir: &std::path::Path) -> Library {
    let image = Image::new()
        .function("echo_ecx", RETURN_ECX)
        .function("echo_edx", RETURN_EDX)
        .function("echo_stack", RETURN_STACK_ARG);
    load_library(common::write(dir, "echo.so", &common::elf(&image))).unwrap()
}

fn call(lib: &Library, name: &str, ecx: u32, edx: u32, stack: &[u32]) -> u32 {
    let entry = find_symbol(lib, name).unwrap();
    runtime::with_context(lib.space(), |ctx| unsafe { ctx.fastcall(entry, ecx, edx, stack) })
        .unwrap()
        .unwrap()
}

#[test]
fn test_register_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let lib = echo_library(dir.path());
    for value in [0, 1, 0x7fff_ffff, 0x8000_0000, u32::MAX] {
        assert_eq!(call(&lib, "echo_ecx", value, 0xdead, &[]), value);
        assert_eq!(call(&lib, "echo_edx", 0xbeef, value, &[]), value);
    }
}

#[test]
fn test_stack_arguments_are_pushed_right_to_left() {
    let dir = tempfile::tempdir().unwrap();
    let lib = echo_library(dir.path());
    assert_eq!(call(&lib, "echo_stack", 1, 2, &[0x1234_5678, 9, 10]), 0x1234_5678);
    assert_eq!(call(&lib, "echo_stack", 1, 2, &[0]), 0);

    let esp = runtime::with_context(lib.space(), |ctx| {
        let entry = find_symbol(&lib, "echo_stack").unwrap();
        unsafe { ctx.fastcall(entry, 0, 0, &[7, 8]) }.unwrap();
        assert_eq!(ctx.peek(), 7);
        let top = lib.space().to_guest(ctx.state().stack_top).unwrap();
        (top, ctx.state().esp())
    })
    .unwrap();
    assert_eq!(esp.1, esp.0 - 8);
}

#[test]
fn test_context_lives_in_low_window() {
    let dir = tempfile::tempdir().unwrap();
    let lib = echo_library(dir.path());
    call(&lib, "echo_ecx", 0, 0, &[]);
    assert!(runtime::is_initialized());
    runtime::with_context(lib.space(), |ctx| {
        let bottom = ctx.stack_bottom();
        assert!(bottom + STACK_SIZE as u64 <= websynth::sys::WINDOW_SIZE);
        assert!(ctx.state().stack_top > bottom);
        assert!(ctx.state().stack_top <= bottom + STACK_SIZE as u64);
    })
    .unwrap();
    runtime::deinitialize();
    assert!(!runtime::is_initialized());
    // A fresh context is created on the next call.
    assert_eq!(call(&lib, "echo_ecx", 5, 0, &[]), 5);
}

#[test]
fn test_threads_have_independent_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let lib = echo_library(dir.path());
    thread::scope(|s| {
        for t in 0..4u32 {
            let lib = &lib;
            s.spawn(move || {
                for i in 0..1000u32 {
                    let value = (t << 24) | i;
                    assert_eq!(call(lib, "echo_ecx", value, 0, &[]), value);
                    assert_eq!(call(lib, "echo_stack", 0, 0, &[value, t]), value);
                }
                runtime::deinitialize();
            });
        }
    });
}

#[test]
fn test_synth_entry_points() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "d77_lib.so", &common::elf(&Image::synth()));
    let synth = Synth::load(&path).unwrap();

    assert_eq!(synth.midi_message_short(0x007f_3c90).unwrap(), 0x007f_3c90);
    assert_eq!(synth.midi_message_short(0).unwrap(), 0);
    assert_eq!(synth.midi_message_long(0x1000, 11).unwrap(), 11);
    assert_eq!(synth.rendered_samples_per_call().unwrap(), 64);
    assert!(synth.initialize_synth(44100, 64, 80).unwrap());
    assert!(synth.initialize_data_file(0x1000, 16).unwrap());
    synth.initialize_effect(websynth::Effect::Reverb, true).unwrap();
    synth.initialize_effect_id(7, false).unwrap();
}

#[test]
fn test_missing_entry_point_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = Image::synth();
    image.functions.retain(|(name, _)| name != "c_RenderSamples_asm");
    let path = common::write(dir.path(), "partial.so", &common::elf(&image));
    match Synth::load(&path) {
        Err(websynth::Error::MissingExport(name)) => assert_eq!(name, "c_RenderSamples_asm"),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}
