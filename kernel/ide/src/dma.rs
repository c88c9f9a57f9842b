//! Bus-master DMA support: physically contiguous buffers, the PRDT wire
//! format, and the per-channel bus-master register block found at BAR4.

use core::mem::size_of;
use core::ptr::NonNull;
use alloc::sync::Arc;
use bitflags::bitflags;
use port_io::{Port, PortIo};
use zerocopy::{AsBytes, FromBytes};

/// Marks a PRDT entry as the final entry of the table.
pub const PRDT_LAST_ENTRY: u16 = 0x8000;

/// The size of the per-drive DMA sector buffer.
///
/// One page is more than enough for the single 512-byte sector transferred
/// per command, and keeps the buffer 4 KiB-aligned by construction.
pub const DMA_BUFFER_SIZE_IN_BYTES: usize = 4096;

/// One entry of a Physical Region Descriptor Table, in the exact little-endian
/// layout consumed by the IDE bus master.
///
/// A `byte_count` of `0` means 65536 bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C, packed)]
pub struct PrdtEntry {
	pub phys_addr: u32,
	pub byte_count: u16,
	pub flags: u16,
}
const _: () = assert!(size_of::<PrdtEntry>() == 8);

impl PrdtEntry {
	fn from_le_bytes(bytes: &[u8]) -> PrdtEntry {
		PrdtEntry {
			phys_addr: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
			byte_count: u16::from_le_bytes([bytes[4], bytes[5]]),
			flags: u16::from_le_bytes([bytes[6], bytes[7]]),
		}
	}
}

/// A physically contiguous region of memory suitable for device DMA.
///
/// The pointer/length pair is the kernel-virtual view of the region and
/// `phys_addr` is where the device sees it.
pub struct DmaBuffer {
	ptr: NonNull<u8>,
	len: usize,
	phys_addr: u32,
}

// The raw pointer is to memory exclusively owned by this buffer.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
	/// Wraps an already-mapped region of physically contiguous memory.
	///
	/// # Safety
	/// `ptr` must point to `len` bytes of mapped, physically contiguous memory
	/// starting at physical address `phys_addr`, exclusively owned by the
	/// returned buffer and valid for the buffer's entire lifetime.
	pub unsafe fn new(ptr: *mut u8, len: usize, phys_addr: u32) -> Result<DmaBuffer, &'static str> {
		let ptr = NonNull::new(ptr).ok_or("DmaBuffer::new(): pointer was null")?;
		Ok(DmaBuffer { ptr, len, phys_addr })
	}

	pub fn phys_addr(&self) -> u32 {
		self.phys_addr
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn as_slice(&self) -> &[u8] {
		unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
	}
}

/// The allocator for DMA-capable memory, provided by the platform.
///
/// Regions handed out must be physically contiguous and must not straddle a
/// 64 KiB boundary, which is a limitation of the IDE bus master.
pub trait DmaAllocator: Send + Sync {
	fn create_contiguous_mapping(&self, len: usize) -> Result<DmaBuffer, &'static str>;
}

/// The DMA resources owned by one ATA drive: a one-entry PRDT and the
/// sector buffer it points at.
pub struct DmaResources {
	prdt: DmaBuffer,
	buffer: DmaBuffer,
}

impl DmaResources {
	/// Allocates the PRDT and sector buffer and writes the single PRDT entry
	/// `{ buffer_phys, 512, last }` into place.
	pub fn allocate(allocator: &dyn DmaAllocator, transfer_size: u16) -> Result<DmaResources, &'static str> {
		let mut prdt = allocator.create_contiguous_mapping(size_of::<PrdtEntry>())?;
		let buffer = allocator.create_contiguous_mapping(DMA_BUFFER_SIZE_IN_BYTES)?;
		for region in [&prdt, &buffer].iter() {
			if (region.phys_addr() as u64 % 0x1_0000) + region.len() as u64 > 0x1_0000 {
				return Err("DMA region straddles a 64 KiB boundary");
			}
		}

		let entry = PrdtEntry {
			phys_addr: buffer.phys_addr(),
			byte_count: transfer_size,
			flags: PRDT_LAST_ENTRY,
		};
		prdt.as_mut_slice()[..size_of::<PrdtEntry>()].copy_from_slice(entry.as_bytes());

		debug!("DMA setup: prdt at {:#010x}, sector buffer at {:#010x}",
			prdt.phys_addr(), buffer.phys_addr());
		Ok(DmaResources { prdt, buffer })
	}

	/// The physical address of the PRDT, to be programmed into the bus master.
	pub fn prdt_phys_addr(&self) -> u32 {
		self.prdt.phys_addr()
	}

	/// The current contents of the single PRDT entry.
	pub fn prdt_entry(&self) -> PrdtEntry {
		PrdtEntry::from_le_bytes(&self.prdt.as_slice()[..size_of::<PrdtEntry>()])
	}

	/// The sector buffer the bus master transfers into.
	pub fn buffer(&self) -> &[u8] {
		self.buffer.as_slice()
	}
}

bitflags! {
	/// The bits of the bus-master status register (BAR4 + 2 / BAR4 + 10).
	pub struct BusMasterStatus: u8 {
		/// The bus master is actively transferring.
		const ACTIVE    = 0x01;
		/// The bus master encountered a transfer error. Write `1` to clear.
		const ERROR     = 0x02;
		/// The IDE device raised its interrupt line. Write `1` to clear.
		const INTERRUPT = 0x04;
	}
}

/// Starts a transfer when written to the bus-master command register.
const BUS_MASTER_START: u8 = 0x01;
/// Selects device-to-memory direction in the bus-master command register.
const BUS_MASTER_READ: u8 = 0x08;

/// One channel's bus-master register block.
///
/// For the primary channel this lives at BAR4 + 0,
/// for the secondary at BAR4 + 8.
#[derive(Debug)]
pub struct BusMaster {
	command: Port<u8>,
	status: Port<u8>,
	prdt_address: Port<u32>,
}

impl BusMaster {
	pub fn new(io: &Arc<dyn PortIo>, base: u16) -> BusMaster {
		BusMaster {
			command: Port::new(io, base),
			status: Port::new(io, base + 2),
			prdt_address: Port::new(io, base + 4),
		}
	}

	/// Halts any in-flight transfer.
	pub fn stop(&self) {
		unsafe { self.command.write(0x00); }
	}

	/// Points the bus master at the PRDT to use for the next transfer.
	pub fn set_prdt(&self, prdt_phys_addr: u32) {
		unsafe { self.prdt_address.write(prdt_phys_addr); }
	}

	pub fn status(&self) -> BusMasterStatus {
		BusMasterStatus::from_bits_truncate(self.status.read())
	}

	/// Clears any latched interrupt and error indications by writing their
	/// (write-1-to-clear) bits back to the status register.
	pub fn ack_interrupt_and_error(&self) {
		let status = self.status.read();
		unsafe { self.status.write(status | (BusMasterStatus::INTERRUPT | BusMasterStatus::ERROR).bits()); }
	}

	/// Sets device-to-memory direction without starting the transfer.
	pub fn prepare_read(&self) {
		unsafe { self.command.write(BUS_MASTER_READ); }
	}

	/// Starts the prepared device-to-memory transfer.
	pub fn start_read(&self) {
		unsafe { self.command.write(BUS_MASTER_READ | BUS_MASTER_START); }
	}
}
