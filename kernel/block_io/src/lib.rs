//! Traits and types for expressing I/O transfers of block-wise granularity.
//!
//! The important items are summarized below:
//! * [`BlockReader`], [`BlockWriter`]: traits that represent I/O streams which
//!   can be read from or written to at the granularity of a single block.
//! * [`BlockIo`]: a parent trait that specifies the size in bytes of each block
//!   in a block-based I/O stream.
//! * [`KnownLength`]: a trait that represents an I/O stream with a known
//!   length, such as a disk drive.
//!
//! These traits represent "stateless" access into I/O streams or devices, in
//! that successive read/write operations do not advance any kind of "offset".

#![no_std]

extern crate alloc;

use alloc::boxed::Box;

/// Errors that can be returned from I/O operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoError {
    /// An input parameter or argument was incorrect or invalid.
    InvalidInput,
    /// The I/O operation attempted to access data beyond the bounds of this I/O stream.
    OutOfBounds,
    /// The I/O operation timed out and was canceled.
    TimedOut,
    /// The I/O operation is not supported by this device, e.g., writing to read-only media.
    Unsupported,
    /// The underlying device reported a failure while executing the I/O operation.
    DeviceError,
}

impl From<IoError> for &'static str {
    fn from(io_error: IoError) -> Self {
        match io_error {
            IoError::InvalidInput => "IoError: invalid input",
            IoError::OutOfBounds  => "IoError: out of bounds",
            IoError::TimedOut     => "IoError: timed out",
            IoError::Unsupported  => "IoError: unsupported operation",
            IoError::DeviceError  => "IoError: device error",
        }
    }
}

/// A parent trait used to specify the block size (in bytes)
/// of I/O transfers (read and write operations).
/// See its use in [`BlockReader`] and [`BlockWriter`].
pub trait BlockIo {
    /// Returns the size in bytes of a single block (i.e., sector),
    /// the minimum granularity of I/O transfers.
    fn block_size(&self) -> usize;
}

impl<B> BlockIo for Box<B> where B: BlockIo + ?Sized {
    fn block_size(&self) -> usize { (**self).block_size() }
}
impl<B> BlockIo for &mut B where B: BlockIo + ?Sized {
    fn block_size(&self) -> usize { (**self).block_size() }
}

/// A trait that represents an I/O stream that has a known length, e.g., a disk drive.
pub trait KnownLength {
    /// Returns the length (size in bytes) of this I/O stream or device.
    fn len(&self) -> usize;
}

impl<KL> KnownLength for Box<KL> where KL: KnownLength + ?Sized {
    fn len(&self) -> usize { (**self).len() }
}
impl<KL> KnownLength for &mut KL where KL: KnownLength + ?Sized {
    fn len(&self) -> usize { (**self).len() }
}

/// A trait that represents an I/O stream (e.g., an I/O device) that can be read from in blocks.
/// The block size specifies the minimum granularity of each transfer,
/// as given by the [`BlockIo::block_size()`] function.
///
/// A `BlockReader` is not aware of any current offset into the stream;
/// thus, each read operation requires a starting offset:
/// the number of blocks from the beginning of the I/O stream at which the read should start.
pub trait BlockReader: BlockIo {
    /// Reads blocks of data from this reader into the given `buffer`.
    ///
    /// The number of blocks read is dictated by the length of the given `buffer`,
    /// which must be a multiple of the block size.
    ///
    /// If successful, returns the number of blocks read into the given `buffer`.
    fn read_blocks(&mut self, buffer: &mut [u8], block_offset: usize) -> Result<usize, IoError>;
}

impl<R> BlockReader for Box<R> where R: BlockReader + ?Sized {
    fn read_blocks(&mut self, buffer: &mut [u8], block_offset: usize) -> Result<usize, IoError> {
        (**self).read_blocks(buffer, block_offset)
    }
}
impl<R> BlockReader for &mut R where R: BlockReader + ?Sized {
    fn read_blocks(&mut self, buffer: &mut [u8], block_offset: usize) -> Result<usize, IoError> {
        (**self).read_blocks(buffer, block_offset)
    }
}

/// A trait that represents an I/O stream (e.g., an I/O device) that can be written to in blocks.
/// The block size specifies the minimum granularity of each transfer,
/// as given by the [`BlockIo::block_size()`] function.
///
/// A `BlockWriter` is not aware of any current offset into the stream;
/// thus, each write operation requires a starting offset:
/// the number of blocks from the beginning of the I/O stream at which the write should start.
pub trait BlockWriter: BlockIo {
    /// Writes blocks of data from the given `buffer` to this writer.
    ///
    /// The number of blocks written is dictated by the length of the given `buffer`,
    /// which must be a multiple of the block size.
    ///
    /// If successful, returns the number of blocks written to this writer.
    fn write_blocks(&mut self, buffer: &[u8], block_offset: usize) -> Result<usize, IoError>;

    /// Flushes this entire writer's output stream,
    /// ensuring all contents in intermediate buffers are fully written out.
    fn flush(&mut self) -> Result<(), IoError>;
}

impl<W> BlockWriter for Box<W> where W: BlockWriter + ?Sized {
    fn write_blocks(&mut self, buffer: &[u8], block_offset: usize) -> Result<usize, IoError> {
        (**self).write_blocks(buffer, block_offset)
    }
    fn flush(&mut self) -> Result<(), IoError> { (**self).flush() }
}
impl<W> BlockWriter for &mut W where W: BlockWriter + ?Sized {
    fn write_blocks(&mut self, buffer: &[u8], block_offset: usize) -> Result<usize, IoError> {
        (**self).write_blocks(buffer, block_offset)
    }
    fn flush(&mut self) -> Result<(), IoError> { (**self).flush() }
}
