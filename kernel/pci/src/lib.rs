//! Access to the PCI configuration space through the legacy `0xCF8`/`0xCFC`
//! port pair, plus a brute-force bus scan.
//!
//! The main entry points are [`PciConfigSpace`] for register-level access,
//! [`scan_bus`] to enumerate every function on the bus, and
//! [`find_ide_controller`] to locate the legacy IDE function that the ATA
//! driver operates on.

#![no_std]

#[macro_use] extern crate log;
extern crate alloc;

use core::fmt;
use alloc::sync::Arc;
use alloc::vec::Vec;
use port_io::{Port, PortIo};
use spin::Mutex;

/// Data written here selects which configuration register `CONFIG_DATA` accesses.
const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

/// Writing the address with this bit set enables the configuration cycle.
const CONFIG_ENABLE: u32 = 0x8000_0000;

pub const PCI_VENDOR_ID:   u8 = 0x00;
pub const PCI_DEVICE_ID:   u8 = 0x02;
pub const PCI_COMMAND:     u8 = 0x04;
pub const PCI_REVISION_ID: u8 = 0x08;
pub const PCI_PROG_IF:     u8 = 0x09;
pub const PCI_SUBCLASS:    u8 = 0x0A;
pub const PCI_CLASS:       u8 = 0x0B;
pub const PCI_HEADER_TYPE: u8 = 0x0E;
pub const PCI_BAR0:        u8 = 0x10;
pub const PCI_BAR4:        u8 = 0x20;

/// Bit 2 of the COMMAND register; the device may act as a bus master when set.
pub const PCI_COMMAND_BUS_MASTER: u16 = 1 << 2;

/// Class/subclass pair of an IDE controller (mass storage, IDE interface).
const CLASS_MASS_STORAGE: u8 = 0x01;
const SUBCLASS_IDE: u8 = 0x01;

/// The bus/slot/function triple that addresses one PCI function.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PciLocation {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
}

impl PciLocation {
    fn config_address(&self, offset: u8) -> u32 {
        CONFIG_ENABLE
            | ((self.bus as u32) << 16)
            | ((self.slot as u32) << 11)
            | ((self.func as u32) << 8)
            | ((offset as u32) & 0xFC)
    }
}

impl fmt::Display for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.slot, self.func)
    }
}
impl fmt::Debug for PciLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// The two configuration ports, guarded by one lock because every access is
/// an address write followed by a data access.
struct ConfigPorts {
    address: Port<u32>,
    data: Port<u32>,
}

/// Register-level access to the PCI configuration space.
pub struct PciConfigSpace {
    ports: Mutex<ConfigPorts>,
}

impl PciConfigSpace {
    pub fn new(io: &Arc<dyn PortIo>) -> PciConfigSpace {
        PciConfigSpace {
            ports: Mutex::new(ConfigPorts {
                address: Port::new(io, CONFIG_ADDRESS),
                data: Port::new(io, CONFIG_DATA),
            }),
        }
    }

    /// Reads the 32-bit configuration register at the given (4-byte aligned) offset.
    pub fn read(&self, location: PciLocation, offset: u8) -> u32 {
        let ports = self.ports.lock();
        unsafe { ports.address.write(location.config_address(offset)); }
        ports.data.read()
    }

    /// Writes the 32-bit configuration register at the given (4-byte aligned) offset.
    pub fn write(&self, location: PciLocation, offset: u8, value: u32) {
        let ports = self.ports.lock();
        unsafe {
            ports.address.write(location.config_address(offset));
            ports.data.write(value);
        }
    }

    /// Reads a 16-bit configuration register.
    pub fn read_u16(&self, location: PciLocation, offset: u8) -> u16 {
        (self.read(location, offset) >> ((offset & 0x2) * 8)) as u16
    }

    /// Reads an 8-bit configuration register.
    pub fn read_u8(&self, location: PciLocation, offset: u8) -> u8 {
        (self.read(location, offset) >> ((offset & 0x3) * 8)) as u8
    }

    /// Read-modify-writes a 16-bit configuration register in the low half of
    /// its containing dword (COMMAND lives at offset 0x04, which qualifies).
    fn write_u16_low(&self, location: PciLocation, offset: u8, value: u16) {
        let dword = self.read(location, offset);
        self.write(location, offset, (dword & 0xFFFF_0000) | value as u32);
    }
}

/// A single function found during a PCI bus scan.
#[derive(Clone, Debug)]
pub struct PciDevice {
    pub location: PciLocation,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub bars: [u32; 6],
}

impl PciDevice {
    /// Reads one function's header out of the configuration space.
    fn probe(config: &PciConfigSpace, location: PciLocation) -> Option<PciDevice> {
        let vendor_id = config.read_u16(location, PCI_VENDOR_ID);
        if vendor_id == 0xFFFF {
            return None;
        }
        let mut bars = [0u32; 6];
        for (i, bar) in bars.iter_mut().enumerate() {
            *bar = config.read(location, PCI_BAR0 + (i as u8) * 4);
        }
        Some(PciDevice {
            location,
            vendor_id,
            device_id: config.read_u16(location, PCI_DEVICE_ID),
            class: config.read_u8(location, PCI_CLASS),
            subclass: config.read_u8(location, PCI_SUBCLASS),
            prog_if: config.read_u8(location, PCI_PROG_IF),
            bars,
        })
    }

    /// Sets the bus-master bit in this function's COMMAND register,
    /// skipping the write if the bit is already set.
    pub fn enable_bus_mastering(&self, config: &PciConfigSpace) {
        let command = config.read_u16(self.location, PCI_COMMAND);
        if command & PCI_COMMAND_BUS_MASTER != 0 {
            debug!("PCI device {}: bus mastering already enabled", self.location);
            return;
        }
        config.write_u16_low(self.location, PCI_COMMAND, command | PCI_COMMAND_BUS_MASTER);
        debug!("PCI device {}: enabled bus mastering (COMMAND {:#06x} -> {:#06x})",
            self.location, command, config.read_u16(self.location, PCI_COMMAND));
    }
}

/// Enumerates every function on every bus by brute-force configuration reads.
pub fn scan_bus(config: &PciConfigSpace) -> Vec<PciDevice> {
    let mut devices = Vec::new();
    for bus in 0..=255u8 {
        for slot in 0..32u8 {
            let zero = PciLocation { bus, slot, func: 0 };
            let device = match PciDevice::probe(config, zero) {
                Some(d) => d,
                None => continue,
            };
            // Bit 7 of the header type marks a multi-function device.
            let multi_function = config.read_u8(zero, PCI_HEADER_TYPE) & 0x80 != 0;
            devices.push(device);
            if multi_function {
                for func in 1..8u8 {
                    let location = PciLocation { bus, slot, func };
                    if let Some(d) = PciDevice::probe(config, location) {
                        devices.push(d);
                    }
                }
            }
        }
    }
    devices
}

/// Finds the first IDE controller function (class 0x01, subclass 0x01) on the bus.
pub fn find_ide_controller(config: &PciConfigSpace) -> Option<PciDevice> {
    let device = scan_bus(config)
        .into_iter()
        .find(|d| d.class == CLASS_MASS_STORAGE && d.subclass == SUBCLASS_IDE);
    match &device {
        Some(d) => info!("Found IDE controller {:04x}:{:04x} at {}", d.vendor_id, d.device_id, d.location),
        None => warn!("No IDE controller found on the PCI bus"),
    }
    device
}
