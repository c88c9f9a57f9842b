//! Traits that abstract away the specifics of individual storage devices
//! and the controllers that host them.
//!
//! A driver for a concrete device (e.g., an ATA disk) implements
//! [`StorageDevice`] and hands out [`StorageDeviceRef`]s; a driver for a
//! multi-device controller (e.g., an IDE controller) implements
//! [`StorageController`] so that a storage manager can enumerate the devices
//! it hosts without knowing what kind of controller it is.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;
use block_io::{BlockIo, BlockReader, BlockWriter, KnownLength};

/// A trait that represents one storage device attached to a storage controller.
///
/// The block-granular I/O operations themselves come from the supertraits;
/// this trait only adds the device-level notion of a total size in blocks.
pub trait StorageDevice: BlockIo + BlockReader + BlockWriter + KnownLength + Send {
    /// Returns the total number of blocks (sectors) on this device.
    fn size_in_blocks(&self) -> usize;
}

/// A shareable reference to any storage device.
pub type StorageDeviceRef = Arc<Mutex<dyn StorageDevice>>;

/// A trait that represents one storage controller,
/// i.e., a hardware device that can host one or more storage devices.
pub trait StorageController {
    /// Returns an iterator over all the storage devices attached to this controller.
    fn devices<'c>(&'c self) -> Box<dyn Iterator<Item = StorageDeviceRef> + 'c>;
}
