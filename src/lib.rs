//! # sdfat32
//!
//! > An SD card and FAT32 read stack written in Embedded Rust
//!
//! This crate is intended to allow you to read files from a FAT32 formatted SD
//! card on your Rust Embedded device. It is written in pure-Rust, is
//! `#![no_std]` and does not use `alloc` or `collections` to keep the memory
//! footprint low: a file is read through a cursor that keeps a handful of
//! cluster numbers, whatever the size of the file. In the first instance it is
//! designed for readability and simplicity over performance.
//!
//! ## Using the crate
//!
//! You will need something that implements the `BlockDevice` trait, which can
//! read and write the 512-byte blocks (or sectors) from your card. We supply
//! `SdCard`, which talks to SD, SDHC and SDXC cards over SPI, and
//! `MemoryBlockDevice` for disk images held in RAM.
//!
//! ```rust,ignore
//! use sdfat32::{sdmmc::InitOptions, BlockDevice, SdCard, Volume};
//!
//! let card = match SdCard::new(spi, cs).init(InitOptions::default()) {
//!     Ok(card) => card,
//!     Err((e, _card)) => panic!("Card init failed: {:?}", e),
//! };
//! let mut volume = Volume::open_first_fat32(card)?;
//! let entry = volume.find_path("/LOGS/BOOT.TXT")?;
//! let mut file = volume.open_file(&entry)?;
//! let mut buffer = [0u8; 64];
//! while file.read(&mut volume, &mut buffer)? != 0 {
//!     // ...
//! }
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//! * `refcell-blockdevice`: `BlockDevice` for `RefCell<T>` and `&RefCell<T>`, so one card can
//! back several volumes.
//! * `lfn`: assemble long file names. Without it only 8.3 names are reported.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
mod structure;

pub mod block_device;
pub mod fat;
pub mod mbr;
pub mod sdmmc;

pub use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice, MemoryError,
};
pub use crate::fat::{DirEntry, File, MountError, Volume};
pub use crate::sdmmc::Error as SdCardError;
pub use crate::sdmmc::SdCard;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
