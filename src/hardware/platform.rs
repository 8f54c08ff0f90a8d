//! Reset and bootloader control
//!
//! A request for the next boot is kept in the `_bootflag` word, a RAM location that survives a
//! system reset and is not touched by the runtime initialization.
use num_enum::{FromPrimitive, IntoPrimitive};

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum BootRequest {
    #[num_enum(default)]
    Application = 0,
    /// Enter the DFU bootloader in system memory.
    Dfu = 0xDEAD_BEEF,
}

/// System memory address of the ST bootloader vector table.
const SYSTEM_BOOTLOADER: u32 = 0x1FF0_9800;

fn bootflag() -> *mut u32 {
    extern "C" {
        static mut _bootflag: u8;
    }

    // Note(unsafe): Only the address of the linker provided word is taken.
    unsafe { core::ptr::addr_of_mut!(_bootflag).cast::<u32>() }
}

/// Reset the device and act on `request` at the next boot.
pub fn reboot(request: BootRequest) -> ! {
    // Note(unsafe): The boot flag word is reserved for this purpose in the linker script.
    unsafe {
        core::ptr::write_volatile(bootflag(), request.into());
    }
    cortex_m::peripheral::SCB::sys_reset();
}

/// Read and clear the request left by the previous boot.
pub fn take_boot_request() -> BootRequest {
    // Note(unsafe): See `reboot()`. Clearing the flag keeps it from sticking across resets.
    unsafe {
        let request = core::ptr::read_volatile(bootflag());
        core::ptr::write_volatile(bootflag(), 0);
        BootRequest::from(request)
    }
}

/// Execute the DFU bootloader stored in system memory.
///
/// # Note
/// This must be called before any system configuration is performed, as the bootloader expects
/// the system in its reset state.
pub fn execute_system_bootloader() -> ! {
    cortex_m::interrupt::disable();

    // Note(unsafe): Interrupts are disabled and the application is abandoned. SysTick and all
    // NVIC enables and pending bits are returned to their reset values.
    unsafe {
        let systick = &*cortex_m::peripheral::SYST::PTR;
        systick.csr.write(0);
        systick.rvr.write(0);
        systick.cvr.write(0);

        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        for (icer, icpr) in nvic.icer.iter().zip(nvic.icpr.iter()) {
            icer.write(u32::MAX);
            icpr.write(u32::MAX);
        }

        cortex_m::interrupt::enable();

        log::info!("Jumping to DFU");
        cortex_m::asm::bootload(SYSTEM_BOOTLOADER as *const u32)
    }
}
