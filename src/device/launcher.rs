//! Hand control over to the application

use log::{error, info};

use super::{FlashController, Status, StatusIndicator};
use crate::{
    error::PlacementError,
    image::{ResetRegion, VectorTable},
    layout::{MemoryLayout, PC_OFFSET, SP_OFFSET},
};

/// Mechanism for leaving the bootloader
pub trait Jumper {
    /// Undo the peripheral configuration done by the bootloader
    fn restore_hardware(&mut self);

    /// Install the vector table at `vector_table`, load the stack pointer and
    /// jump to the reset vector.
    ///
    /// # Safety
    ///
    /// `table` must describe a valid application; nothing of the bootloader
    /// survives the jump.
    unsafe fn boot(&mut self, vector_table: u32, table: VectorTable) -> !;

    /// Stop forever
    fn halt(&mut self) -> !;
}

/// Read the relocated vector table back from flash and check it
pub fn validate<F: FlashController>(
    flash: &mut F,
    layout: &MemoryLayout,
) -> Result<VectorTable, PlacementError> {
    let base = layout.vector_table();
    let table = VectorTable {
        stack_pointer: flash.read_word(base + SP_OFFSET),
        reset_vector: flash.read_word(base + PC_OFFSET),
    };

    table.validate(layout, ResetRegion::Flash)?;
    Ok(table)
}

/// Start the application if its vector table is valid, otherwise show the
/// error status and halt
pub fn launch<F, S, J>(flash: &mut F, indicator: &mut S, jumper: &mut J, layout: &MemoryLayout) -> !
where
    F: FlashController,
    S: StatusIndicator,
    J: Jumper,
{
    match validate(flash, layout) {
        Ok(table) => {
            info!(
                "Starting application, SP {:#010x}, reset {:#010x}",
                table.stack_pointer, table.reset_vector
            );
            jumper.restore_hardware();

            // SAFETY: the stack pointer points into RAM and the reset vector
            // into flash
            unsafe { jumper.boot(layout.vector_table(), table) }
        }
        Err(err) => {
            error!("Refusing to start application: {}", err);
            indicator.show(Status::Error);
            jumper.halt()
        }
    }
}
