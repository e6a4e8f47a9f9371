//! Pre-transmission checks of a memory image
//!
//! An image is only sent to the device once it is known not to overwrite the
//! bootloader and to carry a plausible vector table.

use log::debug;

use super::{MemoryImage, ResetRegion, VectorTable};
use crate::{error::PlacementError, layout::ERASED_BYTE};

/// Check an image against its memory layout, short-circuiting on the first
/// failure
///
/// 1. The bootloader reservation must be entirely erased.
/// 2. The initial stack pointer must point into RAM.
/// 3. The reset vector must point into application flash.
pub fn verify(image: &MemoryImage) -> Result<VectorTable, PlacementError> {
    let layout = image.layout();
    let start = layout.flash_base;
    let end = layout.app_base();

    if let Some(index) = image
        .range(start, end)
        .iter()
        .position(|&byte| byte != ERASED_BYTE)
    {
        return Err(PlacementError::OverlapsBootloader {
            start,
            end: end - 1,
            address: start + index as u32,
        });
    }

    let table = image.vector_table();
    table.validate(layout, ResetRegion::Application)?;

    debug!(
        "Vector table: SP {:#010x}, reset {:#010x}",
        table.stack_pointer, table.reset_vector
    );

    Ok(table)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::layout::MemoryLayout;

    fn image(sp: u32, pc: u32) -> MemoryImage {
        let mut image = MemoryImage::new(MemoryLayout::default());
        for (offset, byte) in sp.to_le_bytes().into_iter().chain(pc.to_le_bytes()).enumerate() {
            image.set(0x1000 + offset as u32, byte);
        }
        image
    }

    #[test]
    fn accepts_valid_image() {
        let table = verify(&image(0x2000_8000 - 8, 0x0000_1201)).unwrap();

        assert_eq!(table.stack_pointer, 0x2000_7FF8);
        assert_eq!(table.reset_vector, 0x0000_1201);
    }

    #[test]
    fn rejects_bootloader_overlap() {
        let mut image = image(0x2000_0100, 0x1201);
        image.set(0x0FFF, 0x00);

        assert!(matches!(
            verify(&image),
            Err(PlacementError::OverlapsBootloader {
                start: 0,
                end: 0x0FFF,
                address: 0x0FFF
            })
        ));
    }

    #[test]
    fn stack_pointer_lower_bound_is_inclusive() {
        assert!(matches!(
            verify(&image(0x1FFF_FFFF, 0x1201)),
            Err(PlacementError::InvalidStackPointer {
                location: 0x1000,
                value: 0x1FFF_FFFF
            })
        ));
        assert!(verify(&image(0x2000_0000, 0x1201)).is_ok());
    }

    #[test]
    fn stack_pointer_upper_bound_is_exclusive() {
        assert!(verify(&image(0x2000_7FFF, 0x1201)).is_ok());
        assert!(verify(&image(0x2000_8000, 0x1201)).is_err());
    }

    #[test]
    fn reset_vector_must_point_into_application_flash() {
        assert!(matches!(
            verify(&image(0x2000_0100, 0x0000_0401)),
            Err(PlacementError::InvalidResetVector {
                location: 0x1004,
                value: 0x401
            })
        ));
        assert!(matches!(
            verify(&image(0x2000_0100, 0x0004_0001)),
            Err(PlacementError::InvalidResetVector { .. })
        ));
    }

    #[test]
    fn erased_vector_table_is_rejected() {
        let image = MemoryImage::new(MemoryLayout::default());

        assert!(matches!(
            verify(&image),
            Err(PlacementError::InvalidStackPointer {
                value: 0xFFFF_FFFF,
                ..
            })
        ));
    }
}
