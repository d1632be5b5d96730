//! sdfat32 - Useful macros for parsing on-disk structures.
//!
//! Every structure using these macros provides a `fn data(&self) -> &[u8]`.
//! All multi-byte fields are little-endian.

macro_rules! define_field {
    ($name:ident, u8, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the `", stringify!($name), "` field"),
            pub fn $name(&self) -> u8 {
                self.data()[$offset]
            }
        }
    };

    ($name:ident, u16, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the `", stringify!($name), "` field"),
            pub fn $name(&self) -> u16 {
                let d = self.data();
                u16::from_le_bytes([d[$offset], d[$offset + 1]])
            }
        }
    };

    ($name:ident, u32, $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get the value of the `", stringify!($name), "` field"),
            pub fn $name(&self) -> u32 {
                let d = self.data();
                u32::from_le_bytes([d[$offset], d[$offset + 1], d[$offset + 2], d[$offset + 3]])
            }
        }
    };

    ($name:ident, [u8; $len:expr], $offset:expr) => {
        doc_comment::doc_comment! {
            concat!("Get a copy of the `", stringify!($name), "` byte array"),
            pub fn $name(&self) -> [u8; $len] {
                let mut out = [0u8; $len];
                out.copy_from_slice(&self.data()[$offset..$offset + $len]);
                out
            }
        }
    };
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
