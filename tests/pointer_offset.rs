//! Loading and calling through a window that does not start at address zero.

#![cfg(all(target_arch = "x86_64", unix))]

mod common;

use common::{Image, RETURN_ECX};
use std::sync::Arc;
use std::thread;
use websynth::sys::{self, WINDOW_SIZE};
use websynth::{AddressSpace, HostAddressSpace, Loader, LowMemory, runtime};

#[test]
fn test_load_and_call_in_offset_window() {
    let dir = tempfile::tempdir().unwrap();
    let space: Arc<dyn AddressSpace> = Arc::new(HostAddressSpace::with_pointer_offset().unwrap());
    let base = space.window_base();
    assert_eq!(base % space.page_size(), 0);

    let image = Image::new().function("echo", RETURN_ECX).variable("value", 42);
    let path = common::write(dir.path(), "offset.so", &common::elf(&image));
    let lib = Loader::new(space.clone()).load(&path).unwrap();
    assert_eq!(lib.space().window_base(), base);
    assert!(lib.base() >= base);
    assert!(lib.base() + lib.size() <= base + WINDOW_SIZE);
    let echo = lib.find_symbol("echo").unwrap();
    assert_eq!(lib.read_u32(lib.find_symbol("value").unwrap()).unwrap(), 42);

    let block = LowMemory::new(&space, 0x1000).unwrap();
    let guest = block.guest_addr().unwrap();
    assert_eq!(u64::from(guest), block.addr() - base);
    assert_eq!(space.to_guest(block.addr()).unwrap(), guest);
    assert_eq!(space.from_guest(guest), block.addr());

    // A fresh thread, so that its context is created in this window.
    thread::scope(|s| {
        s.spawn(|| {
            runtime::with_context(&space, |ctx| {
                let echoed = unsafe { ctx.fastcall(echo, guest, 0, &[]) }.unwrap();
                assert_eq!(space.from_guest(echoed), block.addr());

                // The emulated ESP is window-relative too.
                let state = ctx.state();
                assert_eq!(u64::from(state.esp()), state.stack_top - base);
                assert_eq!(space.from_guest(state.esp()), state.stack_top);
                assert!(ctx.stack_bottom() >= base);
            })
            .unwrap();

            if base != 0 {
                // The context belongs to the offset window.
                assert!(matches!(
                    runtime::with_context(&sys::host(), |_| ()),
                    Err(websynth::Error::Bridge(_))
                ));
                assert!(space.to_guest(base - 1).is_err());
            }
            assert!(space.to_guest(base + WINDOW_SIZE).is_err());
            runtime::deinitialize();
        });
    });
}
