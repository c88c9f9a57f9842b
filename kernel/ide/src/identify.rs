//! Parsing of the 512-byte response to the ATA IDENTIFY (and ATAPI
//! IDENTIFY PACKET) commands.
//!
//! Only the words this driver actually consumes are pulled out of the
//! response; the word indices follow the ATA/ATAPI command set specification.
//! Fuller documentation of the full 256-word layout is available here:
//! <https://docs.microsoft.com/en-us/windows-hardware/drivers/ddi/content/ata/ns-ata-_identify_device_data#members>

use core::fmt;

/// Information that describes an ATA drive,
/// obtained from the response to an identify command.
#[derive(Copy, Clone, Debug, Default)]
pub struct AtaIdentifyData {
	/// Word 0: general configuration bits; bit 15 clear for ATA devices.
	pub general_configuration: u16,
	/// Word 47 (low byte): maximum number of blocks per transfer.
	/// Sometimes referred to as "sectors per int".
	pub max_blocks_per_transfer: u8,
	/// Word 49: capability bits; bit 9 set means the drive supports LBA.
	pub capabilities: u16,
	/// Words 10-19: the drive's serial number.
	pub serial_number: AtaSerialNumber,
	/// Words 23-26: the drive's firmware version.
	pub firmware_version: AtaFirmwareVersion,
	/// Words 27-46: the drive's model string.
	pub model_number: AtaModelNumber,
	/// Words 60-61: number of sectors in the drive, if using 28-bit LBA.
	/// If zero, use `sectors_48` instead.
	pub sectors_28: u32,
	/// Words 100-103: number of sectors in the drive, if using 48-bit LBA.
	pub sectors_48: u64,
}

impl AtaIdentifyData {
	/// Extracts the identified details of a drive out of the 256 words
	/// returned by an identify command.
	///
	/// The drive transfers its ASCII strings with the two bytes of each word
	/// swapped, so the serial, firmware, and model strings are flipped
	/// pairwise here to restore their natural order.
	pub fn from_words(words: &[u16; 256]) -> AtaIdentifyData {
		let mut serial_number = AtaSerialNumber::default();
		copy_words_to_bytes(&words[10..20], &mut serial_number.0);
		let mut firmware_version = AtaFirmwareVersion::default();
		copy_words_to_bytes(&words[23..27], &mut firmware_version.0);
		let mut model_number = AtaModelNumber::default();
		copy_words_to_bytes(&words[27..47], &mut model_number.0);
		flip_bytes(&mut serial_number.0);
		flip_bytes(&mut firmware_version.0);
		flip_bytes(&mut model_number.0);

		AtaIdentifyData {
			general_configuration: words[0],
			max_blocks_per_transfer: words[47] as u8,
			capabilities: words[49],
			serial_number,
			firmware_version,
			model_number,
			sectors_28: (words[60] as u32) | ((words[61] as u32) << 16),
			sectors_48: (words[100] as u64)
				| ((words[101] as u64) << 16)
				| ((words[102] as u64) << 32)
				| ((words[103] as u64) << 48),
		}
	}

	/// Returns `true` if the drive supports LBA addressing.
	/// Drives without it only speak the ancient CHS scheme, which we don't support.
	pub fn supports_lba(&self) -> bool {
		self.capabilities & 0x200 != 0
	}
}

/// Copies identify words into a byte array in the order the drive sent them.
fn copy_words_to_bytes(words: &[u16], bytes: &mut [u8]) {
	for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
		chunk[0] = *word as u8;
		chunk[1] = (*word >> 8) as u8;
	}
}

/// Flips pairs of bytes to rectify quasi-endianness issues in the ATA identify response.
fn flip_bytes(bytes: &mut [u8]) {
	for pair in bytes.chunks_mut(2) {
		pair.swap(0, 1);
	}
}

/// An ATA drive's serial number is a 20-byte string.
#[derive(Copy, Clone, Default)]
pub struct AtaSerialNumber(pub(crate) [u8; 20]);

/// An ATA drive's firmware version is an 8-byte string.
#[derive(Copy, Clone, Default)]
pub struct AtaFirmwareVersion(pub(crate) [u8; 8]);

/// An ATA drive's model number is a 40-byte string.
#[derive(Copy, Clone)]
pub struct AtaModelNumber(pub(crate) [u8; 40]);

impl Default for AtaModelNumber {
	fn default() -> Self {
		AtaModelNumber([0; 40])
	}
}

impl AtaModelNumber {
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

macro_rules! impl_identify_string {
	($name:ident) => {
		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				core::str::from_utf8(&self.0)
					.map_err(|_| fmt::Error)
					.and_then(|s| write!(f, "{}", s.trim_end()))
			}
		}
		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
				write!(f, "\"{}\"", self)
			}
		}
	};
}
impl_identify_string!(AtaSerialNumber);
impl_identify_string!(AtaFirmwareVersion);
impl_identify_string!(AtaModelNumber);
