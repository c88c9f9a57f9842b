//! Driver for the classical PCI IDE controller pair, exposing PATA disks and
//! ATAPI optical drives as block-granular storage devices.
//!
//! The primary structs of interest are [`IdeController`] and [`AtaDrive`].
//!
//! PATA sector reads go through the controller's PCI bus master (one-entry
//! PRDT, single-sector DMA transfers); PATA writes use PIO with a
//! read-back-and-verify loop; ATAPI reads use 12-byte packet commands whose
//! completion interrupt wakes the issuing request. All addressing is 48-bit
//! LBA. Byte-granular access on top of the sector operations is provided by
//! the exported [`BlockDeviceNode`]s.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

mod dma;
mod identify;
mod interrupt;
mod node;

pub use dma::{BusMaster, BusMasterStatus, DmaAllocator, DmaBuffer, DmaResources, PrdtEntry, PRDT_LAST_ENTRY};
pub use identify::{AtaFirmwareVersion, AtaIdentifyData, AtaModelNumber, AtaSerialNumber};
pub use interrupt::{ChannelInterrupt, CompletionEvent, ATAPI_COMPLETION_TIMEOUT_POLLS};
pub use node::{BlockDeviceNode, NodeFlags};

use core::cmp::min;
use core::fmt;
use alloc::{boxed::Box, format, string::{String, ToString}, sync::Arc, vec::Vec};
use bitflags::bitflags;
use spin::Mutex;
use port_io::{Port, PortIo, PortReadOnly, PortWriteOnly};
use pci::{PciConfigSpace, PciDevice};
use block_io::{BlockIo, BlockReader, BlockWriter, IoError, KnownLength};
use storage_device::{StorageController, StorageDevice, StorageDeviceRef};


const SECTOR_SIZE_IN_BYTES: usize = 512;

const DEFAULT_PRIMARY_CHANNEL_DATA_PORT:      u16 = 0x1F0;
const DEFAULT_PRIMARY_CHANNEL_CONTROL_PORT:   u16 = 0x3F6;
const DEFAULT_SECONDARY_CHANNEL_DATA_PORT:    u16 = 0x170;
const DEFAULT_SECONDARY_CHANNEL_CONTROL_PORT: u16 = 0x376;

/// To use a BAR as a Port address, you must mask out the lowest 2 bits.
const PCI_BAR_PORT_MASK: u16 = 0xFFFC;

/// How long detection waits for a candidate drive to come out of BUSY.
/// Absent drives float the status lines high, so this must be bounded.
const DETECTION_POLL_LIMIT: u32 = 10_000;

/// Poll budget for the status-register waits inside an issued command.
const COMMAND_POLL_LIMIT: u32 = 10_000_000;

/// Poll budget for bus-master DMA completion.
const DMA_POLL_LIMIT: u32 = 50_000_000;

/// How many times a failed write verification is retried before the write
/// is surfaced as a device error.
const WRITE_VERIFY_MAX_ATTEMPTS: u32 = 16;


bitflags! {
	/// The possible error values found in an ATA drive's error port.
	pub struct AtaError: u8 {
		const BAD_BLOCK              = 0x80;
		const UNCORRECTABLE_DATA     = 0x40;
		const MEDIA_CHANGED          = 0x20;
		const ID_MARK_NOT_FOUND      = 0x10;
		const MEDIA_CHANGE_REQUEST   = 0x08;
		const COMMAND_ABORTED        = 0x04;
		const TRACK_0_NOT_FOUND      = 0x02;
		const ADDRESS_MARK_NOT_FOUND = 0x01;
	}
}

bitflags! {
	/// The possible status values found in an ATA drive's status port.
	pub struct AtaStatus: u8 {
		/// When set, the drive's port values are still changing, so ports shouldn't be accessed.
		const BUSY                 = 0x80;
		/// When set, the drive is on. When cleared, the drive is sleeping or "spun down".
		const DRIVE_READY          = 0x40;
		const DRIVE_WRITE_FAULT    = 0x20;
		const DRIVE_SEEK_COMPLETE  = 0x10;
		/// When set, the drive is ready to transfer data words through the data port.
		const DATA_REQUEST_READY   = 0x08;
		const CORRECTED_DATA       = 0x04;
		const INDEX                = 0x02;
		const ERROR                = 0x01;
	}
}

bitflags! {
	/// The possible control values used in an ATA drive's control port.
	struct AtaControl: u8 {
		/// Set this to read back the High Order Byte of the last-written LBA48 value.
		const HOB   = 0x80;
		/// Software reset
		const SRST  = 0x04;
		/// No interrupt enable -- set this to disable interrupts from the device.
		const NIEN  = 0x02;
		// all other bits are reserved
	}
}

/// The commands this driver issues to a drive's command port.
/// More esoteric commands (nearly a full list) are here: <https://wiki.osdev.org/ATA_Command_Matrix>.
#[derive(Copy, Clone)]
#[repr(u8)]
enum AtaCommand {
	/// Read sectors using DMA (48-bit LBA).
	ReadDmaExt      = 0x25,
	/// Write sectors using PIO.
	WritePio        = 0x30,
	/// Flush the drive's write cache. This is to be used after each write.
	CacheFlush      = 0xE7,
	/// Sends a packet, for ATAPI devices using the packet interface (PI).
	Packet          = 0xA0,
	/// Get identifying details of an ATAPI drive.
	IdentifyPacket  = 0xA1,
	/// Get identifying details of an ATA drive.
	IdentifyDevice  = 0xEC,
}

/// The SCSI operation codes this driver tunnels through ATAPI packets.
const SCSI_READ_CAPACITY: u8 = 0x25;
const SCSI_READ_12:       u8 = 0xA8;

/// The possible types of drive devices that can be attached to an IDE controller,
/// as identified by the signature bytes left in the LBA mid/high ports after a reset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AtaDeviceType {
	/// A parallel ATA (PATA) drive, like a hard drive.
	/// This is the type previously known as just "ATA" before SATA existed.
	Pata,
	/// A parallel ATA (PATA) drive that uses the packet interface,
	/// like an optical CD-ROM drive.
	PataPi,
	/// A serial ATA (SATA) drive that is operating in legacy IDE emulation mode,
	/// **not the standard AHCI interface for SATA**.
	Sata,
	/// A serial ATA (SATA) drive that is operating in legacy IDE emulation mode
	/// and uses the packet interface.
	SataPi,
}
impl AtaDeviceType {
	/// Determines the ATA device type based on the values of the LBA mid and LBA high
	/// ports after a software reset and drive select.
	fn from_signature(lba_mid: u8, lba_high: u8) -> Option<AtaDeviceType> {
		match (lba_mid, lba_high) {
			(0x00, 0x00) => Some(AtaDeviceType::Pata),
			(0x14, 0xEB) => Some(AtaDeviceType::PataPi),
			(0x3C, 0xC3) => Some(AtaDeviceType::Sata),
			(0x69, 0x96) => Some(AtaDeviceType::SataPi),
			_ => None,
		}
	}

	/// Whether this device speaks the ATAPI packet interface.
	fn is_packet_interface(&self) -> bool {
		matches!(self, AtaDeviceType::PataPi | AtaDeviceType::SataPi)
	}
}

/// The two types of ATA drives that may exist on one channel.
/// The value is the bitmask used to select either master or slave
/// in the ATA drive's `drive_select` port.
#[derive(Copy, Clone, Debug)]
#[repr(u8)]
pub enum BusDriveSelect {
	Master = 0 << 4,
	Slave  = 1 << 4,
}

/// Which of the four canonical drive positions on an IDE controller
/// a drive (or its exported node) occupies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriveSlot {
	PrimaryMaster,
	PrimarySlave,
	SecondaryMaster,
	SecondarySlave,
}

impl DriveSlot {
	/// The iteration successor in canonical order.
	fn next(&self) -> Option<DriveSlot> {
		match self {
			DriveSlot::PrimaryMaster   => Some(DriveSlot::PrimarySlave),
			DriveSlot::PrimarySlave    => Some(DriveSlot::SecondaryMaster),
			DriveSlot::SecondaryMaster => Some(DriveSlot::SecondarySlave),
			DriveSlot::SecondarySlave  => None,
		}
	}
}


/// There are two ATA buses (channels) on an IDE controller,
/// and each one can have two drives attached to it:
/// one master drive and one slave drive.
///
/// Although a bus logically "contains" one to two drives,
/// we don't model the structs that way.
/// Instead, each `AtaDrive` contains a shared reference
/// to whatever bus it is connected to,
/// which ensures that commands destined for two different drives
/// on the same bus do not interfere or interleave with each other.
#[derive(Debug)]
struct AtaBus {
	/// The port that holds the data to be written or the data from a read.
	/// Located at `BAR0 + 0`.
	data: Port<u16>,
	/// The error port, shared with the `features` port.
	/// Located at `BAR0 + 1`.
	error: PortReadOnly<u8>,
	/// The features port, shared with the `error` port.
	/// Located at `BAR0 + 1`.
	features: PortWriteOnly<u8>,
	/// The number of sectors to read or write.
	/// Located at `BAR0 + 2`.
	sector_count: Port<u8>,
	/// The low byte `[0:8)` of the linear block address (LBA) of the sector that we want to read or write.
	/// Located at `BAR0 + 3`.
	lba_low: Port<u8>,
	/// The middle byte `[8:16)` of the linear block address (LBA) of the sector that we want to read or write.
	/// Located at `BAR0 + 4`.
	lba_mid: Port<u8>,
	/// The high byte `[16:24)` of the linear block address (LBA) of the sector that we want to read or write.
	/// Located at `BAR0 + 5`.
	lba_high: Port<u8>,
	/// `HDDEVSEL`, used for selecting a drive in the bus.
	/// Located at `BAR0 + 6`.
	drive_select: Port<u8>,
	/// The command port, shared with the `status` port.
	/// Located at `BAR0 + 7`.
	command: PortWriteOnly<u8>,
	/// The status port, shared with the `command` port.
	/// Located at `BAR0 + 7`.
	status: PortReadOnly<u8>,

	/// Another status port.
	/// Has the same value as the `status` port, but reading this does not affect interrupts.
	/// This port is mostly used for a polling wait, as reading it takes approximately 100ns.
	/// Located at `BAR1 + 2`.
	alternate_status: PortReadOnly<u8>,
	/// The control port, shared with the `alternate_status` port.
	/// Located at `BAR1 + 2`.
	control: PortWriteOnly<u8>,

	/// This channel's half of the controller's bus-master function,
	/// present only if BAR4 reported a usable I/O-space register block.
	bus_master: Option<BusMaster>,
}

impl AtaBus {
	/// Creates a new ATA bus at the location specified by the given data and control BARs,
	/// with the given half of the controller's bus-master register block.
	fn new(io: &Arc<dyn PortIo>, data_bar: u16, control_bar: u16, bus_master: Option<BusMaster>) -> AtaBus {
		let data_bar = data_bar & PCI_BAR_PORT_MASK;
		let control_bar = control_bar & PCI_BAR_PORT_MASK;
		AtaBus {
			data: Port::new(io, data_bar),
			error: PortReadOnly::new(io, data_bar + 1),
			features: PortWriteOnly::new(io, data_bar + 1),
			sector_count: Port::new(io, data_bar + 2),
			lba_low: Port::new(io, data_bar + 3),
			lba_mid: Port::new(io, data_bar + 4),
			lba_high: Port::new(io, data_bar + 5),
			drive_select: Port::new(io, data_bar + 6),
			command: PortWriteOnly::new(io, data_bar + 7),
			status: PortReadOnly::new(io, data_bar + 7),

			alternate_status: PortReadOnly::new(io, control_bar + 2),
			control: PortWriteOnly::new(io, control_bar + 2),

			bus_master,
		}
	}

	/// Reads the `status` port and returns the value as an `AtaStatus` bitfield.
	/// Because some buses operate (change wire values) very slowly,
	/// this undergoes the standard procedure of reading the alternate status port
	/// and discarding it 4 times before reading the real status port value.
	/// Each read is a 100ns delay, so the total delay of 400ns is proper.
	fn status(&self) -> AtaStatus {
		self.io_delay();
		AtaStatus::from_bits_truncate(self.status.read())
	}

	/// Reads the `error` port and returns the value as an `AtaError` bitfield.
	fn error(&self) -> AtaError {
		AtaError::from_bits_truncate(self.error.read())
	}

	/// Waits ~400ns by reading the alternate status port four times.
	fn io_delay(&self) {
		self.alternate_status.read();
		self.alternate_status.read();
		self.alternate_status.read();
		self.alternate_status.read();
	}

	/// Issues a software reset to this bus, which resets *both* ATA drives on this bus,
	/// the master AND the slave. A reset *cannot* be issued to only a single drive on the bus.
	///
	/// This should only be used to clear leftover error values before identifying the drive,
	/// or when the drive is stuck in the BUSY status.
	fn software_reset(&mut self) {
		// Procedure is (1) set the SRST bit, (2) wait ~400ns, (3) clear the SRST bit.
		unsafe { self.control.write(AtaControl::SRST.bits()); }
		self.io_delay();
		unsafe { self.control.write(0); }
	}

	/// Polls the raw status port until the BUSY bit clears,
	/// giving up after `max_polls` reads.
	fn wait_until_not_busy(&self, max_polls: u32) -> Result<(), ()> {
		for _ in 0..max_polls {
			if self.status.read() & AtaStatus::BUSY.bits() == 0 {
				return Ok(());
			}
		}
		Err(())
	}

	/// Waits until the bus is ready to transfer data (either read or write).
	/// This is intended to be used **after** commands have been issued.
	///
	/// This performs a blocking poll that reads the bus's status
	/// until it is no longer busy and data is ready to be transferred
	/// (`AtaStatus::BUSY` is `0` and `AtaStatus::DATA_REQUEST_READY` is `1`).
	///
	/// Returns an error if the `status` port indicates an error
	/// or if the poll budget is exhausted.
	fn wait_for_data_ready(&self) -> Result<(), ()> {
		let mut loop_counter = 0;
		loop {
			let status = self.status();
			loop_counter += 1;
			if status.intersects(AtaStatus::ERROR | AtaStatus::DRIVE_WRITE_FAULT) {
				return Err(());
			}
			if loop_counter >= COMMAND_POLL_LIMIT {
				warn!("AtaBus::wait_for_data_ready() exhausted its poll budget (status: {:?})", status);
				return Err(());
			}
			if status.intersects(AtaStatus::BUSY) {
				continue;
			}
			if status.intersects(AtaStatus::DATA_REQUEST_READY) {
				return Ok(()); // ready to go!
			}
		}
	}

	/// Waits until this bus is finished transferring data (either read or write),
	/// in other words, until there is no pending data to be transferred.
	/// This is intended to be used **before** commands are issued.
	///
	/// Performs a blocking poll that reads the bus's status
	/// until it is no longer busy and there is no data waiting to be transferred
	/// (`AtaStatus::BUSY` is `0` and `AtaStatus::DATA_REQUEST_READY` is `0`).
	///
	/// Returns an error if the `status` port indicates an error
	/// or if the poll budget is exhausted.
	fn wait_for_data_done(&self) -> Result<(), ()> {
		let mut loop_counter = 0;
		loop {
			let status = self.status();
			loop_counter += 1;
			if status.intersects(AtaStatus::ERROR | AtaStatus::DRIVE_WRITE_FAULT) {
				return Err(());
			}
			if loop_counter >= COMMAND_POLL_LIMIT {
				warn!("AtaBus::wait_for_data_done() exhausted its poll budget (status: {:?})", status);
				return Err(());
			}
			if status.intersects(AtaStatus::BUSY) {
				continue;
			}
			if !status.intersects(AtaStatus::DATA_REQUEST_READY) {
				return Ok(()); // ready to go!
			}
		}
	}

	/// Polls the raw status port until the selected drive leaves BUSY and
	/// raises at least one of the given `ready` bits, failing on ERROR.
	/// This is the wait discipline used between ATAPI packet phases.
	fn wait_for_packet_phase(&self, ready: AtaStatus) -> Result<(), IoError> {
		for _ in 0..COMMAND_POLL_LIMIT {
			let status = AtaStatus::from_bits_truncate(self.status.read());
			if status.intersects(AtaStatus::ERROR) {
				warn!("ATAPI command aborted with error {:?}", self.error());
				return Err(IoError::DeviceError);
			}
			if !status.intersects(AtaStatus::BUSY) && status.intersects(ready) {
				return Ok(());
			}
		}
		Err(IoError::TimedOut)
	}

	/// Performs the per-drive portion of the detection handshake:
	/// resets the bus, selects the given drive, waits out BUSY (bounded,
	/// because absent drives float the status lines), and returns the
	/// signature bytes latched in the LBA mid/high ports.
	fn detect_signature(&mut self, which: BusDriveSelect) -> (u8, u8) {
		self.software_reset();
		self.io_delay();
		unsafe { self.drive_select.write(0xA0 | which as u8); }
		self.io_delay();
		let _ = self.wait_until_not_busy(DETECTION_POLL_LIMIT);
		(self.lba_mid.read(), self.lba_high.read())
	}

	/// Issues an ATA identify command (`IdentifyDevice` for PATA drives,
	/// `IdentifyPacket` for ATAPI drives) to probe the drive
	/// and query its characteristics.
	///
	/// See this link: <https://wiki.osdev.org/ATA_PIO_Mode#IDENTIFY_command>
	fn identify_drive(&mut self, which: BusDriveSelect, command: AtaCommand) -> Result<AtaIdentifyData, &'static str> {
		unsafe {
			// Quiesce interrupt generation on the device side for the probe.
			self.features.write(1);
			self.control.write(0);
			self.drive_select.write(0xA0 | which as u8);
		}
		self.io_delay();
		unsafe { self.command.write(command as u8); }
		self.io_delay();

		// a status of 0 means that a drive was not attached
		if self.status().is_empty() {
			return Err("drive did not exist");
		}
		self.wait_until_not_busy(COMMAND_POLL_LIMIT)
			.map_err(|_| "drive stayed busy after the identify command")?;
		self.wait_for_data_ready().map_err(|_| "error before identify data read")?;

		// we're ready to read the actual identify data, it's just one sector (256 words).
		let mut words = [0u16; 256];
		for word in words.iter_mut() {
			*word = self.data.read();
		}
		self.wait_for_data_done().map_err(|_| "error after identify data read")?;
		Ok(AtaIdentifyData::from_words(&words))
	}

	/// Selects the given drive (in LBA mode) and lets the selection settle.
	fn select_drive(&mut self, which: BusDriveSelect) {
		unsafe { self.drive_select.write(0xE0 | which as u8); }
		self.io_delay();
	}

	/// Programs the already-selected drive's task-file registers for a
	/// one-sector transfer at the given 48-bit LBA.
	///
	/// The high bytes of the sector count and LBA must be written *before*
	/// the low bytes.
	fn program_lba48(&mut self, lba: u64) {
		unsafe {
			self.features.write(0);
			// write the high bytes
			self.sector_count.write(0);
			self.lba_high.write((lba >> 40) as u8);
			self.lba_mid.write((lba >> 32) as u8);
			self.lba_low.write((lba >> 24) as u8);
			// write the low bytes
			self.sector_count.write(1);
			self.lba_high.write((lba >> 16) as u8);
			self.lba_mid.write((lba >> 8) as u8);
			self.lba_low.write(lba as u8);
		}
	}

	/// Reads the sector at `lba` into `buffer` using the channel's bus master.
	///
	/// The transfer lands in the drive's DMA sector buffer first and is copied
	/// into `buffer` once the bus master signals completion. Completion is
	/// detected by polling the bus-master status register; the channel
	/// interrupt is not involved.
	fn read_dma(&mut self, dma: &mut DmaResources, which: BusDriveSelect, lba: u64, buffer: &mut [u8]) -> Result<(), IoError> {
		self.wait_for_data_done().map_err(|_| IoError::DeviceError)?;

		let bus_master = self.bus_master.as_ref().ok_or(IoError::Unsupported)?;
		bus_master.stop();
		bus_master.set_prdt(dma.prdt_phys_addr());
		bus_master.ack_interrupt_and_error();
		bus_master.prepare_read();

		self.wait_until_not_busy(COMMAND_POLL_LIMIT).map_err(|_| IoError::TimedOut)?;
		unsafe { self.control.write(0); }
		self.select_drive(which);
		self.program_lba48(lba);

		// The drive must be out of BUSY and assert DRIVE_READY before the command is issued.
		let mut drive_ready = false;
		for _ in 0..COMMAND_POLL_LIMIT {
			let status = AtaStatus::from_bits_truncate(self.status.read());
			if !status.intersects(AtaStatus::BUSY) && status.intersects(AtaStatus::DRIVE_READY) {
				drive_ready = true;
				break;
			}
		}
		if !drive_ready {
			return Err(IoError::TimedOut);
		}
		unsafe { self.command.write(AtaCommand::ReadDmaExt as u8); }
		self.io_delay();

		let bus_master = self.bus_master.as_ref().ok_or(IoError::Unsupported)?;
		bus_master.start_read();

		let mut completed = false;
		for _ in 0..DMA_POLL_LIMIT {
			let bm_status = bus_master.status();
			if bm_status.intersects(BusMasterStatus::ERROR) {
				warn!("bus master reported an error during DMA read of lba {}", lba);
				bus_master.ack_interrupt_and_error();
				return Err(IoError::DeviceError);
			}
			if !bm_status.intersects(BusMasterStatus::INTERRUPT) {
				continue;
			}
			let drive_status = AtaStatus::from_bits_truncate(self.status.read());
			if !drive_status.intersects(AtaStatus::BUSY) {
				completed = true;
				break;
			}
		}
		if !completed {
			warn!("DMA read of lba {} did not complete within the poll budget", lba);
			return Err(IoError::TimedOut);
		}

		// Copy from the DMA buffer to the caller's buffer.
		buffer[..SECTOR_SIZE_IN_BYTES].copy_from_slice(&dma.buffer()[..SECTOR_SIZE_IN_BYTES]);

		// Inform the bus master we are done with this transfer.
		bus_master.ack_interrupt_and_error();
		Ok(())
	}

	/// Writes `buffer` to the sector at `lba` using PIO.
	/// A cache flush is issued after the data transfer.
	///
	/// This does *not* verify the write; see [`AtaDrive::write_sector_with_verify`].
	fn write_pio_sector(&mut self, which: BusDriveSelect, lba: u64, buffer: &[u8]) -> Result<(), IoError> {
		unsafe { self.control.write(AtaControl::NIEN.bits()); }
		self.wait_for_data_done().map_err(|_| IoError::DeviceError)?;
		self.select_drive(which);
		// The drive must come out of BUSY after the selection before its
		// task-file registers may be programmed.
		self.wait_until_not_busy(COMMAND_POLL_LIMIT).map_err(|_| IoError::TimedOut)?;
		self.program_lba48(lba);
		unsafe { self.command.write(AtaCommand::WritePio as u8); }

		self.wait_for_data_ready().map_err(|_| IoError::DeviceError)?;
		for chunk in buffer[..SECTOR_SIZE_IN_BYTES].chunks_exact(2) {
			// ATA PIO works by writing one 16-bit word at a time,
			// so one 16-bit write covers two bytes of the buffer.
			let word = (chunk[1] as u16) << 8 | (chunk[0] as u16);
			unsafe { self.data.write(word); }
		}

		// Flush the drive's cache after each write command.
		unsafe { self.command.write(AtaCommand::CacheFlush as u8); }
		self.wait_for_data_done().map_err(|_| IoError::DeviceError)?;
		Ok(())
	}

	/// Transmits a 12-byte packet command as six 16-bit words through the data port.
	fn write_packet(&mut self, packet: &[u8; 12]) {
		for chunk in packet.chunks_exact(2) {
			let word = u16::from_le_bytes([chunk[0], chunk[1]]);
			unsafe { self.data.write(word); }
		}
	}

	/// Selects the given ATAPI drive and opens a packet command transaction,
	/// advertising `byte_limit` as the maximum transfer length per DRQ phase.
	/// On success the drive is ready to receive the 12 packet bytes.
	fn start_packet_command(&mut self, which: BusDriveSelect, byte_limit: u16) -> Result<(), IoError> {
		unsafe { self.drive_select.write(0xA0 | which as u8); }
		self.io_delay();
		unsafe {
			self.features.write(0);
			self.lba_mid.write(byte_limit as u8);
			self.lba_high.write((byte_limit >> 8) as u8);
			self.command.write(AtaCommand::Packet as u8);
		}
		self.wait_for_packet_phase(AtaStatus::DATA_REQUEST_READY)
	}

	/// Reads one block at `lba` from an ATAPI drive via a READ(12) packet.
	///
	/// After the packet bytes are sent, the drive raises the channel interrupt
	/// when its data is ready; this function arms `chan` before sending the
	/// packet and then waits (bounded) for the ISR path to signal completion.
	///
	/// Returns the number of bytes the drive actually transferred.
	fn read_atapi(&mut self, chan: &ChannelInterrupt, which: BusDriveSelect, sector_size: u32, lba: u64, buffer: &mut [u8]) -> Result<usize, IoError> {
		self.start_packet_command(which, sector_size as u16)?;

		chan.begin_atapi_wait();
		let packet: [u8; 12] = [
			SCSI_READ_12, 0,
			(lba >> 24) as u8, (lba >> 16) as u8, (lba >> 8) as u8, lba as u8,
			0, 0, 0,
			1, // transfer length: one block
			0, 0,
		];
		self.write_packet(&packet);
		let wait_result = chan.wait_for_completion();
		chan.end_atapi_wait();
		if wait_result.is_err() {
			warn!("ATAPI read of lba {} timed out waiting for its interrupt", lba);
			return Err(IoError::TimedOut);
		}

		self.wait_for_packet_phase(AtaStatus::DATA_REQUEST_READY)?;

		// The drive reports how many bytes it will actually transfer.
		let byte_count = ((self.lba_high.read() as usize) << 8) | self.lba_mid.read() as usize;
		let transfer_len = min(byte_count, buffer.len());
		for chunk in buffer[..transfer_len].chunks_exact_mut(2) {
			let word: u16 = self.data.read();
			chunk[0] = word as u8;
			chunk[1] = (word >> 8) as u8;
		}

		self.wait_for_packet_phase(AtaStatus::DRIVE_READY)?;
		Ok(transfer_len)
	}

	/// Issues a READ CAPACITY packet to an ATAPI drive and returns
	/// `(last_lba, block_size_in_bytes)`.
	///
	/// This runs during detection, before the platform has necessarily wired
	/// up the channel ISRs, so it polls for the response instead of waiting
	/// for the interrupt.
	fn atapi_read_capacity(&mut self, which: BusDriveSelect) -> Result<(u32, u32), &'static str> {
		let mut packet = [0u8; 12];
		packet[0] = SCSI_READ_CAPACITY;

		self.start_packet_command(which, 0x0808)
			.map_err(|_| "ATAPI error before the READ CAPACITY packet was sent")?;
		self.write_packet(&packet);
		self.wait_for_packet_phase(AtaStatus::DRIVE_READY | AtaStatus::DATA_REQUEST_READY)
			.map_err(|_| "ATAPI error reading capacity; no medium?")?;

		let mut response = [0u8; 8];
		for chunk in response.chunks_exact_mut(2) {
			let word: u16 = self.data.read();
			chunk[0] = word as u8;
			chunk[1] = (word >> 8) as u8;
		}
		let last_lba = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
		let block_size = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
		if last_lba == 0 {
			return Err("ATAPI drive reported no medium");
		}
		Ok((last_lba, block_size))
	}
}


/// The media-specific half of an [`AtaDrive`]: either a PATA disk with its
/// DMA resources, or an ATAPI drive with its probed geometry.
enum DriveMedia {
	Pata {
		dma: DmaResources,
	},
	Atapi {
		/// The last addressable block, from READ CAPACITY.
		last_lba: u32,
		/// Bytes per block, from READ CAPACITY (typically 2048).
		sector_size: u32,
	},
}

/// A single ATA or ATAPI drive, either a master or a slave,
/// which sits on one of two buses within a larger IDE controller.
pub struct AtaDrive {
	/// A reference to the bus that this drive sits on,
	/// shared with the other AtaDrive that also sits on this bus.
	bus: Arc<Mutex<AtaBus>>,
	/// This bus's interrupt-side state, shared with the controller's ISR entry point.
	chan: Arc<ChannelInterrupt>,
	/// Data that represents the characteristics of the drive.
	identify_data: AtaIdentifyData,
	/// Whether this drive is a master or slave on the bus.
	master_slave: BusDriveSelect,
	/// PATA or ATAPI specifics.
	media: DriveMedia,
}

impl AtaDrive {
	/// Looks for a drive at the given position on the given `bus`, and if one
	/// responds, probes and initializes it and returns an object representing it.
	///
	/// Since two drives (one master and one slave) may exist on one bus, the
	/// caller must specify *which* one to search for.
	fn new(
		bus: Arc<Mutex<AtaBus>>,
		chan: Arc<ChannelInterrupt>,
		which: BusDriveSelect,
		dma_allocator: &dyn DmaAllocator,
		bus_master_present: bool,
	) -> Result<AtaDrive, &'static str> {
		// Issue a preliminary software reset of the bus, then read the
		// signature the reset left behind to learn what, if anything, is there.
		let (lba_mid, lba_high) = bus.lock().detect_signature(which);
		if lba_mid == 0xFF && lba_high == 0xFF {
			return Err("drive did not exist");
		}
		let device_type = AtaDeviceType::from_signature(lba_mid, lba_high)
			.ok_or("drive had an unknown device signature")?;

		let (identify_data, media) = if device_type.is_packet_interface() {
			let identify_data = bus.lock().identify_drive(which, AtaCommand::IdentifyPacket)?;
			let (last_lba, sector_size) = bus.lock().atapi_read_capacity(which)?;
			debug!("ATAPI drive {:?}: last lba {:#x}, {} bytes per block", identify_data.model_number, last_lba, sector_size);
			(identify_data, DriveMedia::Atapi { last_lba, sector_size })
		} else {
			let identify_data = bus.lock().identify_drive(which, AtaCommand::IdentifyDevice)?;
			// Check to see that the drive supports LBA,
			// because we don't support the ancient CHS (cylinder-head-sector) addressing scheme.
			if !identify_data.supports_lba() {
				return Err("drive is an ancient CHS device that doesn't support LBA addressing mode, but we don't support CHS.");
			}
			if !bus_master_present {
				return Err("no usable bus master, so the drive cannot be read via DMA");
			}
			debug!("ATA drive {:?}: {} sectors (48-bit), {} sectors (28-bit)",
				identify_data.model_number, identify_data.sectors_48, identify_data.sectors_28);
			let dma = DmaResources::allocate(dma_allocator, SECTOR_SIZE_IN_BYTES as u16)?;
			(identify_data, DriveMedia::Pata { dma })
		};

		Ok(AtaDrive {
			bus,
			chan,
			identify_data,
			master_slave: which,
			media,
		})
	}

	/// Returns `true` if this drive uses the ATAPI packet interface.
	pub fn is_atapi(&self) -> bool {
		matches!(self.media, DriveMedia::Atapi { .. })
	}

	/// Returns `true` if this drive is the master, or `false` if it is the slave
	/// on its IDE controller bus.
	pub fn is_master(&self) -> bool {
		match self.master_slave {
			BusDriveSelect::Master => true,
			BusDriveSelect::Slave => false,
		}
	}

	/// The drive's parsed identify data.
	pub fn identify_data(&self) -> &AtaIdentifyData {
		&self.identify_data
	}

	/// The current contents of the drive's single PRDT entry,
	/// or `None` for ATAPI drives, which don't use DMA.
	pub fn prdt_entry(&self) -> Option<PrdtEntry> {
		match &self.media {
			DriveMedia::Pata { dma } => Some(dma.prdt_entry()),
			DriveMedia::Atapi { .. } => None,
		}
	}

	/// Reads one sector/block at `lba` into `buffer` (which must be exactly
	/// one block long), dispatching on the drive's media type.
	fn read_one_block(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), IoError> {
		match &mut self.media {
			DriveMedia::Pata { dma } => {
				self.bus.lock().read_dma(dma, self.master_slave, lba, buffer)
			}
			DriveMedia::Atapi { sector_size, .. } => {
				let sector_size = *sector_size;
				self.bus.lock()
					.read_atapi(&self.chan, self.master_slave, sector_size, lba, buffer)
					.map(|_| ())
			}
		}
	}

	/// Writes `buffer` to the sector at `lba`, then reads the sector back and
	/// compares; a mismatch causes the whole write to be reissued, up to
	/// [`WRITE_VERIFY_MAX_ATTEMPTS`] times before giving up.
	fn write_sector_with_verify(&mut self, lba: u64, buffer: &[u8]) -> Result<(), IoError> {
		let mut readback = [0u8; SECTOR_SIZE_IN_BYTES];
		for attempt in 1..=WRITE_VERIFY_MAX_ATTEMPTS {
			self.bus.lock().write_pio_sector(self.master_slave, lba, buffer)?;
			self.read_one_block(lba, &mut readback)?;
			if readback[..] == buffer[..SECTOR_SIZE_IN_BYTES] {
				return Ok(());
			}
			warn!("write of lba {} failed verification (attempt {}), rewriting", lba, attempt);
		}
		error!("write of lba {} failed verification {} times, giving up", lba, WRITE_VERIFY_MAX_ATTEMPTS);
		Err(IoError::DeviceError)
	}
}

impl fmt::Debug for AtaDrive {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("AtaDrive")
			.field("model", &self.identify_data.model_number)
			.field("master_slave", &self.master_slave)
			.field("is_atapi", &self.is_atapi())
			.field("size_in_blocks", &self.size_in_blocks())
			.finish()
	}
}

impl StorageDevice for AtaDrive {
	fn size_in_blocks(&self) -> usize {
		match &self.media {
			DriveMedia::Pata { .. } => {
				if self.identify_data.sectors_48 != 0 {
					self.identify_data.sectors_48 as usize
				} else {
					self.identify_data.sectors_28 as usize
				}
			}
			DriveMedia::Atapi { last_lba, .. } => *last_lba as usize + 1,
		}
	}
}
impl BlockIo for AtaDrive {
	fn block_size(&self) -> usize {
		match &self.media {
			DriveMedia::Pata { .. } => SECTOR_SIZE_IN_BYTES,
			DriveMedia::Atapi { sector_size, .. } => *sector_size as usize,
		}
	}
}
impl KnownLength for AtaDrive {
	fn len(&self) -> usize {
		self.block_size() * self.size_in_blocks()
	}
}
impl BlockReader for AtaDrive {
	fn read_blocks(&mut self, buffer: &mut [u8], block_offset: usize) -> Result<usize, IoError> {
		let block_size = self.block_size();
		if buffer.len() % block_size != 0 {
			return Err(IoError::InvalidInput);
		}
		let block_count = buffer.len() / block_size;
		if block_offset + block_count > self.size_in_blocks() {
			return Err(IoError::OutOfBounds);
		}
		for (i, chunk) in buffer.chunks_exact_mut(block_size).enumerate() {
			self.read_one_block((block_offset + i) as u64, chunk)?;
		}
		Ok(block_count)
	}
}
impl BlockWriter for AtaDrive {
	fn write_blocks(&mut self, buffer: &[u8], block_offset: usize) -> Result<usize, IoError> {
		if self.is_atapi() {
			return Err(IoError::Unsupported);
		}
		let block_size = self.block_size();
		if buffer.len() % block_size != 0 {
			return Err(IoError::InvalidInput);
		}
		let block_count = buffer.len() / block_size;
		if block_offset + block_count > self.size_in_blocks() {
			return Err(IoError::OutOfBounds);
		}
		for (i, chunk) in buffer.chunks_exact(block_size).enumerate() {
			self.write_sector_with_verify((block_offset + i) as u64, chunk)?;
		}
		Ok(block_count)
	}

	fn flush(&mut self) -> Result<(), IoError> { Ok(()) }
}

pub type AtaDriveRef = Arc<Mutex<AtaDrive>>;


/// A single IDE controller has two buses with up to two drives attached to each bus,
/// for a total of up to four drives.
pub struct IdeController {
	pub primary_master:   Option<AtaDriveRef>,
	pub primary_slave:    Option<AtaDriveRef>,
	pub secondary_master: Option<AtaDriveRef>,
	pub secondary_slave:  Option<AtaDriveRef>,
	/// Interrupt-side state for the primary (index 0, IRQ 14)
	/// and secondary (index 1, IRQ 15) channels.
	channels: [Arc<ChannelInterrupt>; 2],
	/// One exported node per detected drive, in detection order.
	nodes: Vec<BlockDeviceNode>,
}

impl IdeController {
	/// Creates a new instance of an IDE controller based on the given PCI device,
	/// probing all four drive positions.
	///
	/// `io` is the machine's port-access backend and `dma_allocator` provides
	/// the physically contiguous memory that PATA drives need for their
	/// bus-master transfers.
	pub fn new(
		pci_device: &PciDevice,
		pci_config: &PciConfigSpace,
		io: &Arc<dyn PortIo>,
		dma_allocator: &dyn DmaAllocator,
	) -> Result<IdeController, &'static str> {
		let primary_channel_data_port = match pci_device.bars[0] {
			0x0 | 0x1 => DEFAULT_PRIMARY_CHANNEL_DATA_PORT,
			other => {
				warn!("Untested rare condition: ATA drive PCI BAR0 was special address value: {:#X}", other);
				other as u16
			}
		};
		let primary_channel_control_port = match pci_device.bars[1] {
			0x0 | 0x1 => DEFAULT_PRIMARY_CHANNEL_CONTROL_PORT,
			other => {
				warn!("Untested rare condition: ATA drive PCI BAR1 was special address value: {:#X}", other);
				other as u16
			}
		};
		let secondary_channel_data_port = match pci_device.bars[2] {
			0x0 | 0x1 => DEFAULT_SECONDARY_CHANNEL_DATA_PORT,
			other => {
				warn!("Untested rare condition: ATA drive PCI BAR2 was special address value: {:#X}", other);
				other as u16
			}
		};
		let secondary_channel_control_port = match pci_device.bars[3] {
			0x0 | 0x1 => DEFAULT_SECONDARY_CHANNEL_CONTROL_PORT,
			other => {
				warn!("Untested rare condition: ATA drive PCI BAR3 was special address value: {:#X}", other);
				other as u16
			}
		};

		// The controller may only perform DMA once its PCI function is a bus master.
		pci_device.enable_bus_mastering(pci_config);

		// BAR4 locates the bus-master register block; the low bit must report
		// I/O space for this driver to be able to drive it.
		let bus_master_base = if pci_device.bars[4] & 0x1 != 0 {
			Some((pci_device.bars[4] as u16) & PCI_BAR_PORT_MASK)
		} else {
			warn!("BAR4 ({:#X}) is not in I/O space; DMA is unavailable, so ATA disks will not be usable",
				pci_device.bars[4]);
			None
		};
		let bus_master_present = bus_master_base.is_some();

		let primary_chan = Arc::new(ChannelInterrupt::new(
			io, (primary_channel_data_port & PCI_BAR_PORT_MASK) + 7));
		let secondary_chan = Arc::new(ChannelInterrupt::new(
			io, (secondary_channel_data_port & PCI_BAR_PORT_MASK) + 7));

		let primary_bus = Arc::new(Mutex::new(AtaBus::new(
			io,
			primary_channel_data_port,
			primary_channel_control_port,
			bus_master_base.map(|base| BusMaster::new(io, base)),
		)));
		let secondary_bus = Arc::new(Mutex::new(AtaBus::new(
			io,
			secondary_channel_data_port,
			secondary_channel_control_port,
			bus_master_base.map(|base| BusMaster::new(io, base + 8)),
		)));

		let primary_master = AtaDrive::new(
			Arc::clone(&primary_bus), Arc::clone(&primary_chan),
			BusDriveSelect::Master, dma_allocator, bus_master_present);
		let primary_slave = AtaDrive::new(
			primary_bus, Arc::clone(&primary_chan),
			BusDriveSelect::Slave, dma_allocator, bus_master_present);
		let secondary_master = AtaDrive::new(
			Arc::clone(&secondary_bus), Arc::clone(&secondary_chan),
			BusDriveSelect::Master, dma_allocator, bus_master_present);
		let secondary_slave = AtaDrive::new(
			secondary_bus, Arc::clone(&secondary_chan),
			BusDriveSelect::Slave, dma_allocator, bus_master_present);

		let drive_fmt = |drive: &Result<AtaDrive, &str>| -> String {
			match drive {
				Ok(d)  => format!("drive initialized, size: {} blocks", d.size_in_blocks()),
				Err(e) => e.to_string(),
			}
		};
		info!("IDE controller at {}: \n\
			--> primary master:   {} \n\
			--> primary slave:    {} \n\
			--> secondary master: {} \n\
			--> secondary slave:  {}",
			pci_device.location,
			drive_fmt(&primary_master),
			drive_fmt(&primary_slave),
			drive_fmt(&secondary_master),
			drive_fmt(&secondary_slave),
		);

		// Export one named node per detected drive: disks get `hda`, `hdb`, ...
		// and optical drives get `cdrom0`, `cdrom1`, ..., in detection order.
		let mut drive_letter = b'a';
		let mut cdrom_number = 0;
		let mut nodes = Vec::new();
		let mut register = |slot: DriveSlot, drive: Result<AtaDrive, &'static str>| -> Option<AtaDriveRef> {
			let drive = drive.ok()?;
			let (name, writable) = if drive.is_atapi() {
				let name = format!("cdrom{}", cdrom_number);
				cdrom_number += 1;
				(name, false)
			} else {
				let name = format!("hd{}", drive_letter as char);
				drive_letter += 1;
				(name, true)
			};
			info!("Exporting block device node \"{}\" ({} bytes)", name, drive.len());
			nodes.push(BlockDeviceNode {
				name,
				flags: NodeFlags::BLOCK_DEVICE,
				length: drive.len() as u64,
				slot,
				writable,
			});
			Some(Arc::new(Mutex::new(drive)))
		};

		let primary_master   = register(DriveSlot::PrimaryMaster, primary_master);
		let primary_slave    = register(DriveSlot::PrimarySlave, primary_slave);
		let secondary_master = register(DriveSlot::SecondaryMaster, secondary_master);
		let secondary_slave  = register(DriveSlot::SecondarySlave, secondary_slave);
		drop(register);

		Ok(IdeController {
			primary_master,
			primary_slave,
			secondary_master,
			secondary_slave,
			channels: [primary_chan, secondary_chan],
			nodes,
		})
	}

	/// The ISR entry point for the primary channel (IRQ 14).
	/// The platform's handler must acknowledge its interrupt controller after this returns.
	pub fn handle_primary_interrupt(&self) {
		self.channels[0].handle_interrupt();
	}

	/// The ISR entry point for the secondary channel (IRQ 15).
	/// The platform's handler must acknowledge its interrupt controller after this returns.
	pub fn handle_secondary_interrupt(&self) {
		self.channels[1].handle_interrupt();
	}

	/// The nodes exported for the detected drives, in detection order.
	pub fn nodes(&self) -> &[BlockDeviceNode] {
		&self.nodes
	}

	/// Returns the drive occupying the given slot, if one was detected.
	pub fn drive(&self, slot: DriveSlot) -> Option<&AtaDriveRef> {
		match slot {
			DriveSlot::PrimaryMaster   => self.primary_master.as_ref(),
			DriveSlot::PrimarySlave    => self.primary_slave.as_ref(),
			DriveSlot::SecondaryMaster => self.secondary_master.as_ref(),
			DriveSlot::SecondarySlave  => self.secondary_slave.as_ref(),
		}
	}

	/// Reads up to `buffer.len()` bytes starting at byte `offset` of the
	/// device behind `node`, returning the number of bytes actually read.
	///
	/// Requests starting at or past the end of the device read 0 bytes;
	/// requests extending past the end are truncated.
	pub fn read(&self, node: &BlockDeviceNode, offset: u64, buffer: &mut [u8]) -> Result<usize, IoError> {
		let drive = self.drive(node.slot).ok_or(IoError::InvalidInput)?;
		let mut drive = drive.lock();
		node::read_bytes_at(&mut *drive, offset, buffer)
	}

	/// Writes up to `buffer.len()` bytes starting at byte `offset` of the
	/// device behind `node`, returning the number of bytes actually written.
	///
	/// Same truncation rules as [`IdeController::read`]. Writes to read-only
	/// nodes (ATAPI drives) are rejected with [`IoError::Unsupported`].
	pub fn write(&self, node: &BlockDeviceNode, offset: u64, buffer: &[u8]) -> Result<usize, IoError> {
		if !node.writable {
			return Err(IoError::Unsupported);
		}
		let drive = self.drive(node.slot).ok_or(IoError::InvalidInput)?;
		let mut drive = drive.lock();
		node::write_bytes_at(&mut *drive, offset, buffer)
	}

	/// Opening a node is a no-op; the drive needs no per-open state.
	pub fn open(&self, _node: &BlockDeviceNode) {}

	/// Closing a node is a no-op.
	pub fn close(&self, _node: &BlockDeviceNode) {}

	/// Returns an `Iterator` over all of the `AtaDrive`s
	/// that exist (and are supported) in this `IdeController`.
	/// The order of iteration is:
	/// primary master, primary slave, secondary master, and secondary slave;
	/// any devices that do not exist are skipped.
	pub fn iter(&self) -> IdeControllerIter {
		IdeControllerIter {
			next: Some(DriveSlot::PrimaryMaster),
			controller: self,
		}
	}
}

impl StorageController for IdeController {
	fn devices<'c>(&'c self) -> Box<(dyn Iterator<Item = StorageDeviceRef> + 'c)> {
		Box::new(
			self.iter().map(|ata_drive_ref| Arc::clone(ata_drive_ref) as StorageDeviceRef)
		)
	}
}

/// Provides an iterator over all `AtaDrive`s in an `IdeController`.
/// See the [`IdeController::iter()`] method.
#[derive(Clone)]
pub struct IdeControllerIter<'c> {
	/// which drive slot will be examined on the next call to `next()`
	next: Option<DriveSlot>,
	controller: &'c IdeController,
}
impl<'c> Iterator for IdeControllerIter<'c> {
	type Item = &'c AtaDriveRef;

	fn next(&mut self) -> Option<Self::Item> {
		while let Some(slot) = self.next {
			self.next = slot.next();
			if let Some(drive) = self.controller.drive(slot) {
				return Some(drive);
			}
		}
		None
	}
}
