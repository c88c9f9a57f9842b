//! Byte-granular access on top of block-granular drives, and the device
//! nodes the driver exports for a filesystem layer to mount.
//!
//! Drives only transfer whole sectors, so an arbitrary `(offset, length)`
//! request is synthesized from up to three pieces: an unaligned head fragment
//! served through a scratch sector, a run of directly-transferred whole
//! sectors, and an unaligned tail fragment served through another scratch
//! sector. For writes, the head and tail scratch sectors are
//! read-modified-written so the untouched bytes of those sectors survive.

use core::cmp::min;
use alloc::string::String;
use alloc::vec;
use bitflags::bitflags;
use block_io::{BlockReader, BlockWriter, IoError, KnownLength};

use crate::DriveSlot;

bitflags! {
	/// The kind bits a filesystem layer consults when mounting a node.
	pub struct NodeFlags: u32 {
		const BLOCK_DEVICE = 0x04;
	}
}

/// A named device node exported for one detected drive.
///
/// The node refers to its drive by [`DriveSlot`] index into the controller's
/// drive table rather than by pointer; all I/O goes through the controller,
/// which owns the drives.
pub struct BlockDeviceNode {
	/// The device name, e.g. `hda` or `cdrom0`. A filesystem layer would
	/// typically mount this under `/dev`.
	pub name: String,
	pub flags: NodeFlags,
	/// The device length in bytes.
	pub length: u64,
	pub(crate) slot: DriveSlot,
	pub(crate) writable: bool,
}

impl BlockDeviceNode {
	pub fn slot(&self) -> DriveSlot {
		self.slot
	}

	/// Whether the node accepts writes. ATAPI media are read-only.
	pub fn is_writable(&self) -> bool {
		self.writable
	}
}

/// Reads `buffer.len()` bytes starting at byte `offset` of the device,
/// returning how many bytes were actually read.
///
/// Requests starting at or past the end of the device read nothing; requests
/// running past the end are truncated and return the short count.
pub(crate) fn read_bytes_at<D>(device: &mut D, offset: u64, buffer: &mut [u8]) -> Result<usize, IoError>
	where D: BlockReader + KnownLength
{
	let sector_size = device.block_size() as u64;
	let length = device.len() as u64;
	if buffer.is_empty() || offset >= length {
		return Ok(0);
	}
	let size = min(buffer.len() as u64, length - offset) as usize;

	let mut start = offset / sector_size;
	let mut end = (offset + size as u64 - 1) / sector_size;
	let mut x = 0usize;

	// Head fragment: the request starts partway into its first sector.
	if offset % sector_size != 0 {
		let offset_in_sector = (offset % sector_size) as usize;
		let prefix = min(sector_size as usize - offset_in_sector, size);
		let mut tmp = vec![0u8; sector_size as usize];
		device.read_blocks(&mut tmp, start as usize)?;
		buffer[..prefix].copy_from_slice(&tmp[offset_in_sector..offset_in_sector + prefix]);
		if start == end {
			return Ok(size);
		}
		x += prefix;
		start += 1;
	}

	// Tail fragment: the request ends partway into its last sector.
	if (offset + size as u64) % sector_size != 0 && start <= end {
		let postfix = ((offset + size as u64) % sector_size) as usize;
		let mut tmp = vec![0u8; sector_size as usize];
		device.read_blocks(&mut tmp, end as usize)?;
		buffer[size - postfix..size].copy_from_slice(&tmp[..postfix]);
		if start == end {
			return Ok(size);
		}
		end -= 1;
	}

	// Whole sectors in the middle transfer directly into the caller's buffer.
	while start <= end {
		device.read_blocks(&mut buffer[x..x + sector_size as usize], start as usize)?;
		x += sector_size as usize;
		start += 1;
	}

	Ok(size)
}

/// Writes `buffer.len()` bytes starting at byte `offset` of the device,
/// returning how many bytes were actually written.
///
/// Same truncation rules as [`read_bytes_at`]; unaligned head and tail
/// sectors are read-modified-written.
pub(crate) fn write_bytes_at<D>(device: &mut D, offset: u64, buffer: &[u8]) -> Result<usize, IoError>
	where D: BlockReader + BlockWriter + KnownLength
{
	let sector_size = device.block_size() as u64;
	let length = device.len() as u64;
	if buffer.is_empty() || offset >= length {
		return Ok(0);
	}
	let size = min(buffer.len() as u64, length - offset) as usize;

	let mut start = offset / sector_size;
	let mut end = (offset + size as u64 - 1) / sector_size;
	let mut x = 0usize;

	if offset % sector_size != 0 {
		let offset_in_sector = (offset % sector_size) as usize;
		let prefix = min(sector_size as usize - offset_in_sector, size);
		let mut tmp = vec![0u8; sector_size as usize];
		device.read_blocks(&mut tmp, start as usize)?;
		tmp[offset_in_sector..offset_in_sector + prefix].copy_from_slice(&buffer[..prefix]);
		device.write_blocks(&tmp, start as usize)?;
		if start == end {
			return Ok(size);
		}
		x += prefix;
		start += 1;
	}

	if (offset + size as u64) % sector_size != 0 && start <= end {
		let postfix = ((offset + size as u64) % sector_size) as usize;
		let mut tmp = vec![0u8; sector_size as usize];
		device.read_blocks(&mut tmp, end as usize)?;
		tmp[..postfix].copy_from_slice(&buffer[size - postfix..size]);
		device.write_blocks(&tmp, end as usize)?;
		if start == end {
			return Ok(size);
		}
		end -= 1;
	}

	while start <= end {
		device.write_blocks(&buffer[x..x + sector_size as usize], start as usize)?;
		x += sector_size as usize;
		start += 1;
	}

	Ok(size)
}
