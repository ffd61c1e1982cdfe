//! Page fault diagnosis.
//!
//! Without demand paging every page fault is fatal. The handler's job is
//! to turn the raw error code and faulting address into a report that
//! names the access kind, the privilege level, and the layout region the
//! address falls in, then panic.
//!
//! A sticky guard makes a fault taken while already handling one
//! immediately fatal, without re-entering the diagnosis path. That second
//! fault would mean the handler itself touched an unmapped page.

use core::sync::atomic::{AtomicBool, Ordering};

use muon_core::addr::VirtAddr;
use muon_core::arch::x86::structures::PageFaultErrorCode;

use crate::layout::FaultRegion;
use crate::manager;

static IN_FAULT: AtomicBool = AtomicBool::new(false);

/// Reports a page fault at `addr` with the given error code and panics.
///
/// Called from the arch interrupt stub with the faulting address read from
/// CR2.
pub fn handle_page_fault(addr: VirtAddr, code: PageFaultErrorCode) -> ! {
    if IN_FAULT.swap(true, Ordering::SeqCst) {
        panic!("PAGE FAULT while handling a page fault, at {addr:#x}");
    }

    let access = if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        "instruction fetch"
    } else if code.contains(PageFaultErrorCode::WRITE) {
        "write"
    } else {
        "read"
    };
    let cause = if code.contains(PageFaultErrorCode::PRESENT) {
        "protection violation"
    } else {
        "page not present"
    };
    let mode = if code.contains(PageFaultErrorCode::USER) {
        "user"
    } else {
        "kernel"
    };

    if code.contains(PageFaultErrorCode::RESERVED_WRITE) {
        log::error!("page fault: reserved bit set, page tables are corrupted");
    }

    let region = FaultRegion::identify(addr);
    log::error!(
        "page fault: {access} at {addr:#x} ({}) from {mode} mode, {cause}",
        region.as_str(),
    );

    // try_with: the faulting code may hold the manager lock; a blocked
    // fault handler would never return.
    if let Some(Some(phys)) = manager::try_with(|mm| {
        let space = mm.active_space();
        mm.translate(space, addr)
    }) {
        log::error!("page fault: {addr:#x} maps to {phys:#x}, flags forbid the access");
    }

    panic!("PAGE FAULT: {access} at {addr:#x} from {mode} mode, {cause}");
}

#[cfg(test)]
mod tests {
    use super::*;

    // The fault guard is process-global and sticky, so exactly one test
    // exercises the handler.
    #[test]
    #[should_panic(expected = "PAGE FAULT")]
    fn fault_panics_with_diagnosis() {
        handle_page_fault(
            VirtAddr::new(0xDEAD_0000),
            PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
        );
    }
}
