//! Jump into the application on Cortex-M hardware

use cortex_m::peripheral::SCB;

use super::launcher::Jumper;
use crate::image::VectorTable;

/// Leave the bootloader on a Cortex-M core without TrustZone
///
/// `restore` resets the peripherals the bootloader configured (GPIO, UART)
/// so the application starts from reset state.
pub struct CortexMJumper<R> {
    restore: R,
}

impl<R: FnMut()> CortexMJumper<R> {
    pub fn new(restore: R) -> Self {
        CortexMJumper { restore }
    }
}

impl<R: FnMut()> Jumper for CortexMJumper<R> {
    fn restore_hardware(&mut self) {
        (self.restore)()
    }

    unsafe fn boot(&mut self, vector_table: u32, table: VectorTable) -> ! {
        unsafe {
            (*SCB::PTR).vtor.write(vector_table);
            cortex_m::asm::bootstrap(
                table.stack_pointer as *const u32,
                table.reset_vector as *const u32,
            )
        }
    }

    fn halt(&mut self) -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }
}
