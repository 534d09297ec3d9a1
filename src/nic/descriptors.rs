use bitflags::bitflags;
use packed_struct::derive::PackedStruct;
use packed_struct::prelude::*;
use packed_struct::PackingResult;

use crate::NicHardware;

// Each descriptor is 16 bytes long: next link, status, buffer address, length and control bits
pub const DESCRIPTOR_LENGTH: usize = 16;

// Rings start on a 16 byte boundary, descriptors only need 4
pub const RING_ALIGNMENT: u32 = 16;

// Status word: length in bits 0..13, error code in 16..24, flags in 28..32.
// The control word keeps the same length field under its own flags.
const LENGTH_MASK: u32 = 0x1FFF;
const ERROR_CODE_SHIFT: u32 = 16;

bitflags! {
    /// Status word, written back by the adapter (or by software for programmed I/O)
    #[derive(Default)]
    pub struct StatusFlags: u32 {
        const FIRST = 0x1000_0000;
        const LAST = 0x2000_0000;
        const ERROR = 0x4000_0000;
        const COMPLETE = 0x8000_0000;
    }
}

bitflags! {
    /// Control bits in the upper half of the length word, set by software when posting
    #[derive(Default)]
    pub struct ControlFlags: u32 {
        const LAST_FRAGMENT = 0x4000_0000;
        const INTERRUPT_REQUESTED = 0x8000_0000;
    }
}

bitflags! {
    /// Error code carried in bits 16..24 of the status word
    #[derive(Default)]
    pub struct ErrorCode: u8 {
        const OVERRUN = 0x01;
        const CRC = 0x02;
        const FRAME = 0x04;
        const TIMEOUT = 0x08;
        const UNDERRUN = 0x10;
        const COLLISION = 0x20;
        const ADAPTER_FAILURE = 0x40;
    }
}

#[derive(PackedStruct, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "16", endian = "lsb")]
pub struct Descriptor {
    #[packed_field(bytes = "0:3")]
    pub next: u32, // Physical address of the following descriptor

    #[packed_field(bytes = "4:7")]
    pub status: u32,

    #[packed_field(bytes = "8:11")]
    pub buffer_address: u32,

    #[packed_field(bytes = "12:15")]
    pub length_and_flags: u32,
}

impl Descriptor {
    /// Fresh descriptor as software hands it to the adapter
    pub fn posted(next: u32, buffer_address: u32, length: u16, want_interrupt: bool) -> Self {
        let mut control = ControlFlags::LAST_FRAGMENT;
        if want_interrupt {
            control |= ControlFlags::INTERRUPT_REQUESTED;
        }

        Descriptor {
            next,
            status: 0,
            buffer_address,
            length_and_flags: (length as u32 & LENGTH_MASK) | control.bits(),
        }
    }

    /// Idle descriptor, only keeps the ring linked
    pub fn unused(next: u32) -> Self {
        Descriptor {
            next,
            ..Default::default()
        }
    }

    pub fn read_from(hw: &dyn NicHardware, address: u32) -> PackingResult<Self> {
        let mut data = [0u8; DESCRIPTOR_LENGTH];
        hw.dma_read(address, &mut data);
        Descriptor::unpack(&data)
    }

    pub fn write_to(&self, hw: &dyn NicHardware, address: u32) -> PackingResult<()> {
        let data = self.pack()?;
        hw.dma_write(address, &data);
        Ok(())
    }

    pub fn status_flags(&self) -> StatusFlags {
        StatusFlags::from_bits_truncate(self.status)
    }

    pub fn control_flags(&self) -> ControlFlags {
        ControlFlags::from_bits_truncate(self.length_and_flags)
    }

    pub fn is_complete(&self) -> bool {
        self.status_flags().contains(StatusFlags::COMPLETE)
    }

    /// Error code of a completed descriptor.
    /// An error flag without any known code is reported as an adapter failure.
    pub fn error_code(&self) -> ErrorCode {
        if !self.status_flags().contains(StatusFlags::ERROR) {
            return ErrorCode::empty();
        }

        let code = ErrorCode::from_bits_truncate((self.status >> ERROR_CODE_SHIFT) as u8);
        if code.is_empty() {
            ErrorCode::ADAPTER_FAILURE
        } else {
            code
        }
    }

    /// Bytes the adapter reported in the status word
    pub fn completed_length(&self) -> u16 {
        (self.status & LENGTH_MASK) as u16
    }

    /// Bytes software posted in the control word
    pub fn buffer_length(&self) -> u16 {
        (self.length_and_flags & LENGTH_MASK) as u16
    }

    /// Write-back as the adapter would do it
    pub fn complete(&mut self, length: u16, error: ErrorCode) {
        let mut flags = StatusFlags::COMPLETE | StatusFlags::FIRST | StatusFlags::LAST;
        let mut code = 0;
        if !error.is_empty() {
            flags |= StatusFlags::ERROR;
            code = (error.bits() as u32) << ERROR_CODE_SHIFT;
        }

        self.status = flags.bits() | code | (length as u32 & LENGTH_MASK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian_and_in_field_order() {
        let descriptor = Descriptor {
            next: 0x0403_0201,
            status: 0x0807_0605,
            buffer_address: 0x0C0B_0A09,
            length_and_flags: 0x100F_0E0D,
        };

        let packed = descriptor.pack().unwrap();
        let expected: Vec<u8> = (1..=16).collect();
        assert_eq!(packed.as_slice(), expected.as_slice());
        assert_eq!(Descriptor::unpack(&packed).unwrap(), descriptor);
    }

    #[test]
    fn posted_descriptor_is_owned_by_adapter() {
        let descriptor = Descriptor::posted(0x1010, 0x2000, 1514, true);
        assert!(!descriptor.is_complete());
        assert_eq!(descriptor.buffer_length(), 1514);
        assert!(descriptor
            .control_flags()
            .contains(ControlFlags::INTERRUPT_REQUESTED | ControlFlags::LAST_FRAGMENT));

        let quiet = Descriptor::posted(0x1010, 0x2000, 60, false);
        assert!(!quiet.control_flags().contains(ControlFlags::INTERRUPT_REQUESTED));
    }

    #[test]
    fn write_back_carries_length_and_error() {
        let mut descriptor = Descriptor::posted(0, 0x2000, 1600, true);
        descriptor.complete(64, ErrorCode::empty());
        assert!(descriptor.is_complete());
        assert_eq!(descriptor.completed_length(), 64);
        assert!(descriptor.error_code().is_empty());

        descriptor.complete(64, ErrorCode::CRC);
        assert!(descriptor.status_flags().contains(StatusFlags::ERROR));
        assert_eq!(descriptor.error_code(), ErrorCode::CRC);
        assert_eq!(descriptor.completed_length(), 64);
    }

    #[test]
    fn flags_and_error_code_leave_length_intact() {
        let mut descriptor = Descriptor::posted(0, 0x2000, 1600, true);
        for length in [1u16, 60, 64, 1514, 1600, LENGTH_MASK as u16] {
            descriptor.complete(length, ErrorCode::empty());
            assert!(descriptor
                .status_flags()
                .contains(StatusFlags::FIRST | StatusFlags::LAST | StatusFlags::COMPLETE));
            assert_eq!(descriptor.completed_length(), length);

            descriptor.complete(length, ErrorCode::all());
            assert_eq!(descriptor.completed_length(), length);
            assert_eq!(descriptor.error_code(), ErrorCode::all());
        }

        // Status flags never alias the length bits
        assert_eq!(StatusFlags::all().bits() & LENGTH_MASK, 0);
        assert_eq!(StatusFlags::all().bits() & (0xFF << ERROR_CODE_SHIFT), 0);
    }

    #[test]
    fn error_flag_without_code_is_adapter_failure() {
        let descriptor = Descriptor {
            status: (StatusFlags::COMPLETE | StatusFlags::ERROR).bits(),
            ..Default::default()
        };
        assert_eq!(descriptor.error_code(), ErrorCode::ADAPTER_FAILURE);
    }
}
