//! # Bonsai Bucket Pointer
//!
//! A bucket inside a bonsai file is addressed by page index plus byte
//! offset within the page. The pointer also carries the binary version of
//! the layout that wrote it, so a future layout revision can coexist in one
//! file.
//!
//! Two encodings exist on disk:
//!
//! - **Header fields** (free-list pointer, siblings) store the full 16-byte
//!   form: `page_index: i64`, `page_offset: i32`, `version: i32`.
//! - **Child pointers inside internal entries** store the 12-byte form
//!   without the version; the version is recovered from the containing
//!   bucket's context.
//!
//! A pointer with a negative page index is the NULL pointer. The system
//! bucket lives at the fixed pointer (0, 0).

pub const BINARY_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BonsaiPointer {
    pub page_index: i64,
    pub page_offset: i32,
    pub version: i32,
}

impl BonsaiPointer {
    /// On-disk size of the full header encoding.
    pub const SIZE: usize = 16;

    /// On-disk size of the child encoding inside internal entries.
    pub const CHILD_SIZE: usize = 12;

    pub const NULL: Self = Self {
        page_index: -1,
        page_offset: 0,
        version: 0,
    };

    pub fn new(page_index: i64, page_offset: i32) -> Self {
        Self {
            page_index,
            page_offset,
            version: BINARY_VERSION,
        }
    }

    /// The system bucket's fixed location at the head of the file.
    pub fn system() -> Self {
        Self::new(0, 0)
    }

    pub fn is_valid(self) -> bool {
        self.page_index >= 0
    }

    pub fn write_to(self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.page_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.version.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            page_index: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            page_offset: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            version: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.write_to(&mut buf);
        buf
    }

    pub fn write_child(self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.page_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_offset.to_le_bytes());
    }

    /// Reads the 12-byte child form; the version comes from context.
    pub fn read_child(buf: &[u8]) -> Self {
        Self {
            page_index: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            page_offset: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            version: BINARY_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_pointer_is_invalid() {
        assert!(!BonsaiPointer::NULL.is_valid());
        assert!(BonsaiPointer::system().is_valid());
        assert!(BonsaiPointer::new(3, 8192).is_valid());
    }

    #[test]
    fn header_encoding_round_trips() {
        let pointer = BonsaiPointer::new(42, 8192);
        let bytes = pointer.to_bytes();

        assert_eq!(BonsaiPointer::read_from(&bytes), pointer);
    }

    #[test]
    fn child_encoding_recovers_version_from_context() {
        let pointer = BonsaiPointer::new(7, 0);
        let mut buf = [0u8; BonsaiPointer::CHILD_SIZE];
        pointer.write_child(&mut buf);

        let decoded = BonsaiPointer::read_child(&buf);

        assert_eq!(decoded, pointer);
        assert_eq!(decoded.version, BINARY_VERSION);
    }

    #[test]
    fn null_round_trips_through_header_form() {
        let bytes = BonsaiPointer::NULL.to_bytes();

        assert!(!BonsaiPointer::read_from(&bytes).is_valid());
    }
}
