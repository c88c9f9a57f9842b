//! A software model of a PC with one PCI IDE controller, used to exercise the
//! driver without hardware.
//!
//! The model implements the driver's two platform seams: it is the `PortIo`
//! backend behind every port the driver touches (command block, control
//! block, bus-master block, and the PCI configuration ports), and it provides
//! the `DmaAllocator` whose fake physical address space the modeled bus
//! master transfers into. Completed ATAPI packets raise the channel's
//! interrupt, which is delivered to the controller's ISR entry points exactly
//! as a platform interrupt handler would.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ide::{DmaAllocator, DmaBuffer, IdeController};
use pci::PciConfigSpace;
use port_io::PortIo;

/// Where the model places the bus-master register block (BAR4).
pub const BM_BASE: u16 = 0xC000;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

// ATA status bits.
const BSY: u8 = 0x80;
const DRDY: u8 = 0x40;
const DRQ: u8 = 0x08;
const ERR: u8 = 0x01;

// ---------------------------------------------------------------------------
// Fake physical memory
// ---------------------------------------------------------------------------

/// The fake physical address space shared by the DMA allocator (which maps
/// regions into it) and the modeled bus master (which transfers into it).
#[derive(Clone, Default)]
pub struct PhysMemory {
    regions: Arc<Mutex<Vec<(u32, usize, usize)>>>, // (phys, host pointer, len)
}

impl PhysMemory {
    fn register(&self, phys: u32, ptr: usize, len: usize) {
        self.regions.lock().unwrap().push((phys, ptr, len));
    }

    fn locate(&self, phys: u32, len: usize) -> Option<*mut u8> {
        for (base, ptr, region_len) in self.regions.lock().unwrap().iter() {
            let offset = phys.wrapping_sub(*base) as usize;
            if phys >= *base && offset + len <= *region_len {
                return Some((*ptr + offset) as *mut u8);
            }
        }
        None
    }

    pub fn read(&self, phys: u32, out: &mut [u8]) {
        let ptr = self.locate(phys, out.len()).expect("DMA read from unmapped fake-physical address");
        unsafe { std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len()) };
    }

    pub fn write(&self, phys: u32, data: &[u8]) {
        let ptr = self.locate(phys, data.len()).expect("DMA write to unmapped fake-physical address");
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
    }
}

/// Hands out leaked host allocations tagged with bump-allocated fake physical
/// addresses. Never hands out a region that straddles a 64 KiB boundary.
pub struct StubDmaAllocator {
    memory: PhysMemory,
    next_phys: Mutex<u32>,
    /// Every allocation made, in order, as `(phys, len)`.
    pub allocations: Mutex<Vec<(u32, usize)>>,
}

impl StubDmaAllocator {
    fn new(memory: PhysMemory) -> StubDmaAllocator {
        StubDmaAllocator {
            memory,
            next_phys: Mutex::new(0x0010_0000),
            allocations: Mutex::new(Vec::new()),
        }
    }

    pub fn allocation(&self, index: usize) -> (u32, usize) {
        self.allocations.lock().unwrap()[index]
    }
}

impl DmaAllocator for StubDmaAllocator {
    fn create_contiguous_mapping(&self, len: usize) -> Result<DmaBuffer, &'static str> {
        let size = (len.max(1) + 4095) & !4095;
        let mut next = self.next_phys.lock().unwrap();
        let mut phys = *next;
        if (phys as usize % 0x1_0000) + size > 0x1_0000 {
            phys = (phys + 0xFFFF) & !0xFFFF;
        }
        *next = phys + size as u32;

        let region: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
        let ptr = region.as_mut_ptr();
        self.memory.register(phys, ptr as usize, size);
        self.allocations.lock().unwrap().push((phys, size));
        unsafe { DmaBuffer::new(ptr, size, phys) }
    }
}

// ---------------------------------------------------------------------------
// Modeled drives
// ---------------------------------------------------------------------------

pub enum StubMedia {
    Ata {
        image: Vec<u8>,
    },
    Atapi {
        image: Vec<u8>,
        block_len: u32,
        /// The raw 8-byte READ CAPACITY response.
        capacity: [u8; 8],
        /// When false, completed packets never raise the channel interrupt,
        /// modeling a lost IRQ.
        deliver_irq: bool,
    },
}

pub struct StubDrive {
    pub media: StubMedia,
    identify: [u16; 256],
    /// Corrupt this many upcoming PIO sector writes (one flipped byte each).
    pub corrupt_next_writes: u32,
    pub pio_writes: u32,
    pub cache_flushes: u32,
    pub dma_reads: u32,
    pub packet_reads: u32,
}

impl StubDrive {
    /// An ATA disk whose capacity is `image.len() / 512` sectors.
    pub fn ata(image: Vec<u8>) -> StubDrive {
        assert_eq!(image.len() % 512, 0);
        let sectors = (image.len() / 512) as u64;
        StubDrive {
            identify: ata_identify_words("QEMU HARDDISK", sectors),
            media: StubMedia::Ata { image },
            corrupt_next_writes: 0,
            pio_writes: 0,
            cache_flushes: 0,
            dma_reads: 0,
            packet_reads: 0,
        }
    }

    pub fn ata_with_model(image: Vec<u8>, model: &str) -> StubDrive {
        let mut drive = StubDrive::ata(image);
        let sectors = match &drive.media { StubMedia::Ata { image } => (image.len() / 512) as u64, _ => unreachable!() };
        drive.identify = ata_identify_words(model, sectors);
        drive
    }

    /// An ATAPI drive whose READ CAPACITY response is derived from the image.
    pub fn atapi(image: Vec<u8>, block_len: u32) -> StubDrive {
        assert_eq!(image.len() % block_len as usize, 0);
        let last_lba = (image.len() as u32 / block_len).saturating_sub(1);
        let mut capacity = [0u8; 8];
        capacity[..4].copy_from_slice(&last_lba.to_be_bytes());
        capacity[4..].copy_from_slice(&block_len.to_be_bytes());
        StubDrive {
            identify: atapi_identify_words("STUB DVD-ROM"),
            media: StubMedia::Atapi { image, block_len, capacity, deliver_irq: true },
            corrupt_next_writes: 0,
            pio_writes: 0,
            cache_flushes: 0,
            dma_reads: 0,
            packet_reads: 0,
        }
    }

    /// An ATAPI drive with a hand-rolled READ CAPACITY response.
    pub fn atapi_with_capacity(block_len: u32, capacity: [u8; 8]) -> StubDrive {
        let mut drive = StubDrive::atapi(vec![0u8; block_len as usize], block_len);
        match &mut drive.media {
            StubMedia::Atapi { capacity: c, .. } => *c = capacity,
            _ => unreachable!(),
        }
        drive
    }

    pub fn without_irq(mut self) -> StubDrive {
        match &mut self.media {
            StubMedia::Atapi { deliver_irq, .. } => *deliver_irq = false,
            _ => panic!("only ATAPI reads wait for interrupts"),
        }
        self
    }

    pub fn corrupting_first_writes(mut self, count: u32) -> StubDrive {
        self.corrupt_next_writes = count;
        self
    }

    fn read_media(&self, byte_offset: usize, out: &mut [u8]) {
        let image = match &self.media {
            StubMedia::Ata { image } => image,
            StubMedia::Atapi { image, .. } => image,
        };
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = image.get(byte_offset + i).copied().unwrap_or(0);
        }
    }

    fn write_media(&mut self, byte_offset: usize, data: &[u8]) {
        let image = match &mut self.media {
            StubMedia::Ata { image } => image,
            StubMedia::Atapi { image, .. } => image,
        };
        if image.len() < byte_offset + data.len() {
            image.resize(byte_offset + data.len(), 0);
        }
        image[byte_offset..byte_offset + data.len()].copy_from_slice(data);
    }

    pub fn image(&self) -> &[u8] {
        match &self.media {
            StubMedia::Ata { image } => image,
            StubMedia::Atapi { image, .. } => image,
        }
    }
}

/// Builds the 256-word IDENTIFY DEVICE response for an LBA-capable ATA disk.
fn ata_identify_words(model: &str, sectors_48: u64) -> [u16; 256] {
    let mut words = [0u16; 256];
    words[0] = 0x0040; // ATA device
    pack_identify_string(&mut words[10..20], "STUB00000001");
    pack_identify_string(&mut words[23..27], "1.0");
    pack_identify_string(&mut words[27..47], model);
    words[47] = 0x8010; // up to 16 sectors per multiple-transfer
    words[49] = 0x0200; // LBA supported
    let sectors_28 = sectors_48.min((1 << 28) - 1) as u32;
    words[60] = sectors_28 as u16;
    words[61] = (sectors_28 >> 16) as u16;
    words[100] = sectors_48 as u16;
    words[101] = (sectors_48 >> 16) as u16;
    words[102] = (sectors_48 >> 32) as u16;
    words[103] = (sectors_48 >> 48) as u16;
    words
}

fn atapi_identify_words(model: &str) -> [u16; 256] {
    let mut words = [0u16; 256];
    words[0] = 0x8580; // ATAPI device, removable, 12-byte packets
    pack_identify_string(&mut words[10..20], "STUBCD000001");
    pack_identify_string(&mut words[23..27], "1.0");
    pack_identify_string(&mut words[27..47], model);
    words[49] = 0x0200;
    words
}

/// ASCII strings in identify data are space-padded and byte-swapped per word.
fn pack_identify_string(words: &mut [u16], value: &str) {
    let mut bytes = vec![b' '; words.len() * 2];
    bytes[..value.len()].copy_from_slice(value.as_bytes());
    for (word, pair) in words.iter_mut().zip(bytes.chunks_exact(2)) {
        *word = ((pair[0] as u16) << 8) | pair[1] as u16;
    }
}

// ---------------------------------------------------------------------------
// Channel and machine state
// ---------------------------------------------------------------------------

/// The task-file registers that take two writes for a 48-bit command keep the
/// previous value around, like the real hardware's two-deep FIFO.
#[derive(Default, Clone, Copy)]
struct Shadow {
    cur: u8,
    prev: u8,
}

impl Shadow {
    fn push(&mut self, value: u8) {
        self.prev = self.cur;
        self.cur = value;
    }
}

enum DataSink {
    None,
    PioWrite,
    Packet,
}

struct Channel {
    drives: [Option<StubDrive>; 2],
    selected: usize,
    features: u8,
    control: u8,
    error: u8,
    status: u8,
    sector_count: Shadow,
    lba_low: Shadow,
    lba_mid: Shadow,
    lba_high: Shadow,
    /// What reads of the LBA mid/high ports return: the device signature
    /// after a reset/select, or the packet byte count during an ATAPI transfer.
    out_lba_mid: u8,
    out_lba_high: u8,
    data_in: VecDeque<u8>,
    data_out: Vec<u8>,
    data_out_expect: usize,
    sink: DataSink,
    write_lba: u64,
    /// Armed by READ DMA EXT: `(drive index, lba)` awaiting a bus-master start.
    pending_dma: Option<(usize, u64)>,
    bm_command: u8,
    bm_status: u8,
    bm_prdt: u32,
}

impl Channel {
    fn new(master: Option<StubDrive>, slave: Option<StubDrive>) -> Channel {
        Channel {
            drives: [master, slave],
            selected: 0,
            features: 0,
            control: 0,
            error: 0,
            status: 0,
            sector_count: Shadow::default(),
            lba_low: Shadow::default(),
            lba_mid: Shadow::default(),
            lba_high: Shadow::default(),
            out_lba_mid: 0,
            out_lba_high: 0,
            data_in: VecDeque::new(),
            data_out: Vec::new(),
            data_out_expect: 0,
            sink: DataSink::None,
            write_lba: 0,
            pending_dma: None,
            bm_command: 0,
            bm_status: 0,
            bm_prdt: 0,
        }
    }

    fn selected_drive(&mut self) -> Option<&mut StubDrive> {
        self.drives[self.selected].as_mut()
    }

    /// Re-latches the signature and idle status of the selected drive,
    /// as happens after a reset or a drive select.
    fn refresh_selected(&mut self) {
        match &self.drives[self.selected] {
            None => {
                // Nothing drives the bus, so reads float high.
                self.status = 0xFF;
                self.out_lba_mid = 0xFF;
                self.out_lba_high = 0xFF;
            }
            Some(drive) => {
                self.status = DRDY;
                let (mid, high) = match drive.media {
                    StubMedia::Ata { .. } => (0x00, 0x00),
                    StubMedia::Atapi { .. } => (0x14, 0xEB),
                };
                self.out_lba_mid = mid;
                self.out_lba_high = high;
            }
        }
    }

    fn lba48(&self) -> u64 {
        (self.lba_low.cur as u64)
            | (self.lba_mid.cur as u64) << 8
            | (self.lba_high.cur as u64) << 16
            | (self.lba_low.prev as u64) << 24
            | (self.lba_mid.prev as u64) << 32
            | (self.lba_high.prev as u64) << 40
    }

    fn write_control(&mut self, value: u8) {
        // A software reset re-selects the master and re-latches signatures.
        if value & 0x04 != 0 {
            self.selected = 0;
            self.data_in.clear();
            self.sink = DataSink::None;
            self.refresh_selected();
        }
        self.control = value;
    }

    fn write_command(&mut self, command: u8) {
        let selected = self.selected;
        match command {
            0xEC | 0xA1 => {
                let identify = match &self.drives[selected] {
                    None => {
                        self.status = 0;
                        return;
                    }
                    Some(drive) => {
                        let is_atapi = matches!(drive.media, StubMedia::Atapi { .. });
                        if (command == 0xA1) != is_atapi {
                            self.status = DRDY | ERR;
                            self.error = 0x04; // aborted
                            return;
                        }
                        drive.identify
                    }
                };
                self.data_in.clear();
                for word in identify.iter() {
                    self.data_in.push_back(*word as u8);
                    self.data_in.push_back((*word >> 8) as u8);
                }
                self.status = DRDY | DRQ;
            }
            0x25 => {
                // READ DMA EXT; the transfer happens when the bus master starts.
                self.pending_dma = Some((selected, self.lba48()));
                self.status = DRDY;
            }
            0x30 => {
                self.write_lba = self.lba48();
                self.sink = DataSink::PioWrite;
                self.data_out.clear();
                self.data_out_expect = 512;
                self.status = DRDY | DRQ;
            }
            0xE7 => {
                if let Some(drive) = self.selected_drive() {
                    drive.cache_flushes += 1;
                }
                self.status = DRDY;
            }
            0xA0 => {
                self.sink = DataSink::Packet;
                self.data_out.clear();
                self.data_out_expect = 12;
                self.status = DRDY | DRQ;
            }
            _ => {
                self.status = DRDY | ERR;
                self.error = 0x04; // aborted
            }
        }
    }

    /// Host-to-device data-port word. Returns `true` when a completed packet
    /// wants to raise the channel interrupt.
    fn write_data(&mut self, word: u16) -> bool {
        match self.sink {
            DataSink::None => false,
            DataSink::PioWrite | DataSink::Packet => {
                self.data_out.push(word as u8);
                self.data_out.push((word >> 8) as u8);
                if self.data_out.len() < self.data_out_expect {
                    return false;
                }
                let payload = std::mem::take(&mut self.data_out);
                match std::mem::replace(&mut self.sink, DataSink::None) {
                    DataSink::PioWrite => {
                        self.finish_pio_write(payload);
                        false
                    }
                    DataSink::Packet => self.execute_packet(&payload),
                    DataSink::None => false,
                }
            }
        }
    }

    fn finish_pio_write(&mut self, mut payload: Vec<u8>) {
        let lba = self.write_lba;
        if let Some(drive) = self.selected_drive() {
            if drive.corrupt_next_writes > 0 {
                drive.corrupt_next_writes -= 1;
                payload[0] ^= 0xFF;
            }
            drive.write_media(lba as usize * 512, &payload);
            drive.pio_writes += 1;
        }
        self.status = DRDY;
    }

    /// Runs a received 12-byte packet. Returns `true` if the channel
    /// interrupt should be raised.
    fn execute_packet(&mut self, packet: &[u8]) -> bool {
        let drive = match self.selected_drive() {
            Some(d) => d,
            None => {
                self.status = DRDY | ERR;
                return false;
            }
        };
        let (block_len, capacity, deliver_irq) = match &drive.media {
            StubMedia::Atapi { block_len, capacity, deliver_irq, .. } => (*block_len, *capacity, *deliver_irq),
            StubMedia::Ata { .. } => {
                self.status = DRDY | ERR;
                self.error = 0x04;
                return false;
            }
        };
        match packet[0] {
            0x25 => {
                // READ CAPACITY
                self.data_in.clear();
                self.data_in.extend(capacity.iter().copied());
                self.out_lba_mid = 8;
                self.out_lba_high = 0;
                self.status = DRDY | DRQ;
                deliver_irq
            }
            0xA8 => {
                // READ(12)
                let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
                let blocks = packet[9] as usize;
                let byte_count = blocks * block_len as usize;
                let mut data = vec![0u8; byte_count];
                drive.read_media(lba as usize * block_len as usize, &mut data);
                drive.packet_reads += 1;
                self.data_in.clear();
                self.data_in.extend(data);
                self.out_lba_mid = byte_count as u8;
                self.out_lba_high = (byte_count >> 8) as u8;
                self.status = DRDY | DRQ;
                deliver_irq
            }
            _ => {
                self.status = DRDY | ERR;
                self.error = 0x04;
                false
            }
        }
    }

    /// Device-to-host data-port word.
    fn read_data(&mut self) -> u16 {
        let lo = self.data_in.pop_front().unwrap_or(0);
        let hi = self.data_in.pop_front().unwrap_or(0);
        if self.data_in.is_empty() {
            self.status = DRDY;
        }
        u16::from_le_bytes([lo, hi])
    }

    /// A bus-master command-register write. Returns the armed DMA transfer
    /// when the start bit (with read direction) goes live.
    fn write_bus_master_command(&mut self, value: u8) -> Option<(usize, u64)> {
        self.bm_command = value;
        if value & 0x01 != 0 && value & 0x08 != 0 {
            self.pending_dma.take()
        } else {
            None
        }
    }
}

pub struct MachineState {
    config_address: u32,
    pci_command: u16,
    channels: [Channel; 2],
}

pub struct StubMachine {
    state: Mutex<MachineState>,
    memory: PhysMemory,
    allocator: Arc<StubDmaAllocator>,
    irq_handler: Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>,
}

/// Configures the four drive positions of a [`StubMachine`].
pub struct StubMachineBuilder {
    drives: [[Option<StubDrive>; 2]; 2],
}

impl StubMachineBuilder {
    pub fn new() -> StubMachineBuilder {
        StubMachineBuilder { drives: [[None, None], [None, None]] }
    }

    pub fn primary_master(mut self, drive: StubDrive) -> Self {
        self.drives[0][0] = Some(drive);
        self
    }
    pub fn primary_slave(mut self, drive: StubDrive) -> Self {
        self.drives[0][1] = Some(drive);
        self
    }
    pub fn secondary_master(mut self, drive: StubDrive) -> Self {
        self.drives[1][0] = Some(drive);
        self
    }
    pub fn secondary_slave(mut self, drive: StubDrive) -> Self {
        self.drives[1][1] = Some(drive);
        self
    }

    pub fn build(self) -> Arc<StubMachine> {
        let [primary, secondary] = self.drives;
        let [pm, ps] = primary;
        let [sm, ss] = secondary;
        let memory = PhysMemory::default();
        Arc::new(StubMachine {
            state: Mutex::new(MachineState {
                config_address: 0,
                pci_command: 0,
                channels: [Channel::new(pm, ps), Channel::new(sm, ss)],
            }),
            allocator: Arc::new(StubDmaAllocator::new(memory.clone())),
            memory,
            irq_handler: Mutex::new(None),
        })
    }
}

impl StubMachine {
    pub fn allocator(&self) -> Arc<StubDmaAllocator> {
        Arc::clone(&self.allocator)
    }

    /// Locates the modeled IDE function, runs the driver's full init and
    /// detection flow against this machine, and wires the controller's ISR
    /// entry points up to the modeled interrupt lines.
    pub fn init_controller(self: &Arc<Self>) -> Arc<IdeController> {
        let io: Arc<dyn PortIo> = Arc::clone(self) as Arc<dyn PortIo>;
        let config = PciConfigSpace::new(&io);
        let pci_device = pci::find_ide_controller(&config).expect("stub machine exposes no IDE function");
        let allocator = self.allocator();
        let controller = IdeController::new(&pci_device, &config, &io, &*allocator)
            .expect("IDE controller initialization failed");
        let controller = Arc::new(controller);

        let isr_target = Arc::clone(&controller);
        *self.irq_handler.lock().unwrap() = Some(Box::new(move |channel| match channel {
            0 => isr_target.handle_primary_interrupt(),
            _ => isr_target.handle_secondary_interrupt(),
        }));
        controller
    }

    /// Runs `f` against the modeled drive at the given channel/position.
    pub fn with_drive<R>(&self, channel: usize, position: usize, f: impl FnOnce(&mut StubDrive) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(state.channels[channel].drives[position].as_mut().expect("no drive at that position"))
    }

    pub fn pci_command(&self) -> u16 {
        self.state.lock().unwrap().pci_command
    }

    fn deliver_irq(&self, channel: usize) {
        if let Some(handler) = &*self.irq_handler.lock().unwrap() {
            handler(channel);
        }
    }

    /// Decodes a port into `(channel, register)` where registers 0-7 are the
    /// command block and 8 is the control/alt-status port.
    fn decode_channel_port(port: u16) -> Option<(usize, u16)> {
        match port {
            0x1F0..=0x1F7 => Some((0, port - 0x1F0)),
            0x3F6 => Some((0, 8)),
            0x170..=0x177 => Some((1, port - 0x170)),
            0x376 => Some((1, 8)),
            _ => None,
        }
    }

    fn pci_config_read(state: &MachineState) -> u32 {
        let address = state.config_address;
        let bus = (address >> 16) & 0xFF;
        let slot = (address >> 11) & 0x1F;
        let func = (address >> 8) & 0x7;
        if (bus, slot, func) != (0, 1, 0) {
            return 0xFFFF_FFFF;
        }
        match address & 0xFC {
            0x00 => 0x7010_8086,                        // device/vendor: PIIX3 IDE
            0x04 => 0x0280_0000 | state.pci_command as u32,
            0x08 => 0x0101_8000,                        // class 01, subclass 01, prog if 0x80
            0x20 => (BM_BASE as u32) | 0x1,             // BAR4: I/O space
            _ => 0,
        }
    }
}

impl PortIo for StubMachine {
    fn read_u8(&self, port: u16) -> u8 {
        let mut state = self.state.lock().unwrap();
        if let Some((index, reg)) = Self::decode_channel_port(port) {
            let channel = &mut state.channels[index];
            return match reg {
                1 => channel.error,
                4 => channel.out_lba_mid,
                5 => channel.out_lba_high,
                7 | 8 => channel.status,
                _ => 0,
            };
        }
        match port {
            p if p >= BM_BASE && p < BM_BASE + 16 => {
                let channel = &mut state.channels[((p - BM_BASE) / 8) as usize];
                match (p - BM_BASE) % 8 {
                    0 => channel.bm_command,
                    2 => channel.bm_status,
                    _ => 0,
                }
            }
            _ => 0xFF,
        }
    }

    fn write_u8(&self, port: u16, value: u8) {
        let mut state = self.state.lock().unwrap();
        if let Some((index, reg)) = Self::decode_channel_port(port) {
            let channel = &mut state.channels[index];
            match reg {
                1 => channel.features = value,
                2 => channel.sector_count.push(value),
                3 => channel.lba_low.push(value),
                4 => channel.lba_mid.push(value),
                5 => channel.lba_high.push(value),
                6 => {
                    channel.selected = ((value >> 4) & 1) as usize;
                    channel.refresh_selected();
                }
                7 => channel.write_command(value),
                8 => channel.write_control(value),
                _ => {}
            }
            return;
        }
        if port >= BM_BASE && port < BM_BASE + 16 {
            let index = ((port - BM_BASE) / 8) as usize;
            match (port - BM_BASE) % 8 {
                0 => {
                    if let Some((drive_index, lba)) = state.channels[index].write_bus_master_command(value) {
                        Self::run_dma_transfer(&mut *state, &self.memory, index, drive_index, lba);
                    }
                }
                2 => {
                    // Interrupt and error bits are write-1-to-clear.
                    let cleared = value & 0x06;
                    state.channels[index].bm_status &= !cleared;
                }
                _ => {}
            }
        }
    }

    fn read_u16(&self, port: u16) -> u16 {
        if let Some((index, 0)) = Self::decode_channel_port(port) {
            let mut state = self.state.lock().unwrap();
            return state.channels[index].read_data();
        }
        self.read_u8(port) as u16
    }

    fn write_u16(&self, port: u16, value: u16) {
        if let Some((index, 0)) = Self::decode_channel_port(port) {
            let raise = {
                let mut state = self.state.lock().unwrap();
                state.channels[index].write_data(value)
            };
            // Delivered outside the state lock, the way a real interrupt
            // arrives after the device finishes its work.
            if raise {
                self.deliver_irq(index);
            }
            return;
        }
        self.write_u8(port, value as u8);
    }

    fn read_u32(&self, port: u16) -> u32 {
        let state = self.state.lock().unwrap();
        match port {
            CONFIG_DATA => Self::pci_config_read(&state),
            p if p >= BM_BASE && p < BM_BASE + 16 && (p - BM_BASE) % 8 == 4 => {
                state.channels[((p - BM_BASE) / 8) as usize].bm_prdt
            }
            _ => 0,
        }
    }

    fn write_u32(&self, port: u16, value: u32) {
        let mut state = self.state.lock().unwrap();
        match port {
            CONFIG_ADDRESS => state.config_address = value,
            CONFIG_DATA => {
                if state.config_address & 0xFC == 0x04 {
                    state.pci_command = value as u16;
                }
            }
            p if p >= BM_BASE && p < BM_BASE + 16 && (p - BM_BASE) % 8 == 4 => {
                state.channels[((p - BM_BASE) / 8) as usize].bm_prdt = value;
            }
            _ => {}
        }
    }
}

impl StubMachine {
    /// Executes an armed single-sector DMA read: walks the (one-entry) PRDT
    /// out of fake physical memory and transfers the sector into the region
    /// it describes.
    fn run_dma_transfer(state: &mut MachineState, memory: &PhysMemory, channel_index: usize, drive_index: usize, lba: u64) {
        let channel = &mut state.channels[channel_index];
        let mut prdt = [0u8; 8];
        memory.read(channel.bm_prdt, &mut prdt);
        let target_phys = u32::from_le_bytes([prdt[0], prdt[1], prdt[2], prdt[3]]);
        let raw_count = u16::from_le_bytes([prdt[4], prdt[5]]);
        let byte_count = if raw_count == 0 { 0x1_0000 } else { raw_count as usize };

        let transfer_len = byte_count.min(512);
        let mut sector = vec![0u8; transfer_len];
        if let Some(drive) = channel.drives[drive_index].as_mut() {
            drive.read_media(lba as usize * 512, &mut sector);
            drive.dma_reads += 1;
        }
        memory.write(target_phys, &sector);
        channel.bm_status |= 0x04; // interrupt pending
        channel.status = DRDY;
    }
}
