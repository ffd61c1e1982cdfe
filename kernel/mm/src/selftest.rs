//! Boot-time self-tests.
//!
//! Cheap smoke tests run once at boot to catch a miswired allocator or
//! walker before anything depends on it. Each returns `true` on pass and
//! logs the verdict.

use muon_core::addr::VirtAddr;

use crate::PAGE_SIZE;
use crate::manager::MemoryManager;
use crate::mapper::{MapFlags, PhysAccess};

/// Frame allocator smoke test: distinct frames, and a freed frame is the
/// next one handed out.
pub fn pfa_self_test(mm: &mut MemoryManager) -> bool {
    let mut ok = true;

    let (p1, p2, p3) = match (mm.allocate_frame(), mm.allocate_frame(), mm.allocate_frame()) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => {
            log::error!("pfa self-test FAIL: allocation failed");
            return false;
        }
    };
    ok &= p1 != p2 && p2 != p3 && p1 != p3;

    // SAFETY: p2 was allocated above and never mapped.
    unsafe { mm.free_frame(p2.start_address()) };
    let p4 = mm.allocate_frame();
    ok &= p4 == Some(p2);

    // SAFETY: Test frames, never mapped.
    unsafe {
        mm.free_frame(p1.start_address());
        mm.free_frame(p3.start_address());
        if let Some(p4) = p4 {
            mm.free_frame(p4.start_address());
        }
    }

    report("pfa", ok)
}

/// Page table smoke test: a fixed mapping translates with the page offset
/// preserved and disappears on unmap.
pub fn ptm_self_test(mm: &mut MemoryManager) -> bool {
    let mut ok = true;
    let virt = VirtAddr::new(0xB000_0000);
    let kernel = mm.kernel_space();

    let Some(frame) = mm.allocate_frame() else {
        log::error!("ptm self-test FAIL: allocation failed");
        return false;
    };
    if mm
        .map_fixed(kernel, virt, frame.start_address(), PAGE_SIZE as u32, MapFlags::WRITABLE)
        .is_err()
    {
        log::error!("ptm self-test FAIL: map_fixed failed");
        // SAFETY: Never mapped.
        unsafe { mm.free_frame(frame.start_address()) };
        return false;
    }

    ok &= mm.translate(kernel, virt + 0x123) == Some(frame.start_address() + 0x123);
    mm.unmap_fixed(kernel, virt, PAGE_SIZE as u32);
    ok &= mm.translate(kernel, virt).is_none();

    // SAFETY: Unmapped above.
    unsafe { mm.free_frame(frame.start_address()) };
    report("ptm", ok)
}

/// Kernel heap smoke test: fresh pages are mapped and zeroed, and freeing
/// returns the data frames.
pub fn vma_self_test(mm: &mut MemoryManager) -> bool {
    let mut ok = true;
    let before = mm.free_frames_count();

    let base = match mm.allocate(PAGE_SIZE as u32 * 2, MapFlags::WRITABLE) {
        Ok(base) => base,
        Err(err) => {
            log::error!("vma self-test FAIL: allocate: {err}");
            return false;
        }
    };

    let Some(phys) = mm.translate(mm.kernel_space(), base) else {
        log::error!("vma self-test FAIL: allocation not mapped");
        return false;
    };
    // SAFETY: The frame backs the allocation just made.
    let bytes = unsafe {
        core::slice::from_raw_parts(mm.mapper().frame_ptr(phys), PAGE_SIZE)
    };
    ok &= bytes.iter().all(|&b| b == 0);

    mm.free(base, PAGE_SIZE as u32 * 2);
    ok &= mm.translate(mm.kernel_space(), base).is_none();
    // The data frames come back; a page table created for the heap window
    // stays resident.
    let after = mm.free_frames_count();
    ok &= after == before || after == before - 1;

    report("vma", ok)
}

fn report(name: &str, ok: bool) -> bool {
    if ok {
        log::info!("{name} self-test PASS");
    } else {
        log::error!("{name} self-test FAIL");
    }
    ok
}
