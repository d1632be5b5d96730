//! Test helpers: a scripted SD card on a fake SPI bus, and FAT32 images.

#![allow(dead_code)]

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use sdfat32::sdmmc::proto::{crc16, crc7};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ****************************************************************************
//
// SD card model
//
// ****************************************************************************

#[derive(Debug, Clone, PartialEq)]
enum State {
    Command,
    AwaitWriteToken { block: usize },
    WriteData { block: usize, received: Vec<u8> },
}

/// Plays the card side of the SPI protocol, one byte exchange at a time.
/// The knobs decide how it answers.
pub struct CardModel {
    pub storage: Vec<u8>,
    /// Block addressing (SDHC) or byte addressing (SDSC)
    pub high_capacity: bool,
    /// R1 answer to CMD0, `None` to stay silent
    pub cmd0_response: Option<u8>,
    /// Answer CMD8 with illegal command, like a v1 card
    pub legacy: bool,
    pub cmd8_crc_error: bool,
    pub cmd8_voltage: Option<u8>,
    pub cmd8_pattern: Option<u8>,
    pub cmd58_illegal: bool,
    /// ACMD41 calls answered with idle before the card is ready
    pub acmd41_busy_count: u32,
    pub power_up_never: bool,
    pub read_error_token: Option<u8>,
    pub read_token_never: bool,
    pub corrupt_read_crc: bool,
    /// Data response token forced on writes
    pub write_response: Option<u8>,
    pub busy_bytes: usize,
    pub busy_forever: bool,
    /// Second byte of the CMD13 answer
    pub status_byte: u8,
    /// C_SIZE reported in the CSD instead of the storage size
    pub csd_c_size: Option<u32>,

    pub selected: bool,
    pub select_count: usize,
    pub commands: Vec<u8>,
    pub acmd41_args: Vec<u32>,
    /// Arguments of CMD17 and CMD24, as sent
    pub addresses: Vec<u32>,
    pub bytes_clocked: usize,

    state: State,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    app_cmd: bool,
    acmd41_seen: u32,
    initialized: bool,
    busy_left: usize,
}

impl CardModel {
    pub fn new(blocks: usize) -> Self {
        Self::with_storage(vec![0u8; blocks * 512])
    }

    pub fn with_storage(storage: Vec<u8>) -> Self {
        CardModel {
            storage,
            high_capacity: true,
            cmd0_response: Some(0x01),
            legacy: false,
            cmd8_crc_error: false,
            cmd8_voltage: None,
            cmd8_pattern: None,
            cmd58_illegal: false,
            acmd41_busy_count: 3,
            power_up_never: false,
            read_error_token: None,
            read_token_never: false,
            corrupt_read_crc: false,
            write_response: None,
            busy_bytes: 4,
            busy_forever: false,
            status_byte: 0,
            csd_c_size: None,
            selected: false,
            select_count: 0,
            commands: Vec::new(),
            acmd41_args: Vec::new(),
            addresses: Vec::new(),
            bytes_clocked: 0,
            state: State::Command,
            rx: Vec::new(),
            tx: VecDeque::new(),
            app_cmd: false,
            acmd41_seen: 0,
            initialized: false,
            busy_left: 0,
        }
    }

    pub fn block(&self, idx: usize) -> &[u8] {
        &self.storage[idx * 512..(idx + 1) * 512]
    }

    fn set_selected(&mut self, selected: bool) {
        if selected && !self.selected {
            self.select_count += 1;
        }
        if !selected {
            self.state = State::Command;
            self.rx.clear();
            self.tx.clear();
            self.busy_left = 0;
        }
        self.selected = selected;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        self.bytes_clocked += 1;
        if !self.selected {
            return 0xFF;
        }
        let miso = if let Some(b) = self.tx.pop_front() {
            b
        } else if self.busy_left > 0 {
            self.busy_left -= 1;
            0x00
        } else if self.busy_forever && self.state == State::Command && self.commands.last() == Some(&24) {
            0x00
        } else {
            0xFF
        };
        self.receive(mosi);
        miso
    }

    fn r1(&self) -> u8 {
        if self.initialized {
            0x00
        } else {
            0x01
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.tx.push_back(0xFF);
        self.tx.extend(bytes.iter().cloned());
    }

    fn block_for(&self, arg: u32) -> usize {
        if self.high_capacity {
            arg as usize
        } else {
            arg as usize / 512
        }
    }

    fn receive(&mut self, mosi: u8) {
        match &mut self.state {
            State::Command => {
                if self.rx.is_empty() && mosi & 0xC0 != 0x40 {
                    return;
                }
                self.rx.push(mosi);
                if self.rx.len() == 6 {
                    let frame: Vec<u8> = self.rx.drain(..).collect();
                    self.command(&frame);
                }
            }
            State::AwaitWriteToken { block } => {
                let block = *block;
                if mosi == 0xFE {
                    self.state = State::WriteData {
                        block,
                        received: Vec::new(),
                    };
                }
            }
            State::WriteData { block, received } => {
                received.push(mosi);
                if received.len() == 514 {
                    let block = *block;
                    let data = received[..512].to_vec();
                    let crc = u16::from_be_bytes([received[512], received[513]]);
                    self.state = State::Command;
                    let token = match self.write_response {
                        Some(token) => token,
                        None if crc != crc16(&data) => 0xEB,
                        None => 0xE5,
                    };
                    if token & 0x1F == 0x05 {
                        self.storage[block * 512..(block + 1) * 512].copy_from_slice(&data);
                    }
                    self.tx.push_back(token);
                    self.busy_left = self.busy_bytes;
                }
            }
        }
    }

    fn command(&mut self, frame: &[u8]) {
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push(cmd);
        let app_cmd = std::mem::replace(&mut self.app_cmd, false);

        if frame[5] != crc7(&frame[..5]) {
            let r1 = self.r1() | 0x08;
            self.respond(&[r1]);
            return;
        }

        match cmd {
            0 => {
                self.initialized = false;
                self.acmd41_seen = 0;
                if let Some(r1) = self.cmd0_response {
                    self.respond(&[r1]);
                }
            }
            8 => {
                if self.legacy {
                    self.respond(&[0x05]);
                } else {
                    let r1 = if self.cmd8_crc_error { 0x09 } else { 0x01 };
                    let voltage = self.cmd8_voltage.unwrap_or(((arg >> 8) & 0x0F) as u8);
                    let pattern = self.cmd8_pattern.unwrap_or(arg as u8);
                    self.respond(&[r1, 0x00, 0x00, voltage, pattern]);
                }
            }
            9 => {
                let blocks = (self.storage.len() / 512) as u32;
                let c_size = self
                    .csd_c_size
                    .unwrap_or_else(|| (blocks / 1024).saturating_sub(1));
                let mut csd = [0u8; 16];
                csd[0] = 0x40;
                csd[7] = ((c_size >> 16) & 0x3F) as u8;
                csd[8] = (c_size >> 8) as u8;
                csd[9] = c_size as u8;
                let crc = crc16(&csd);
                let mut answer = vec![0x00, 0xFF, 0xFE];
                answer.extend_from_slice(&csd);
                answer.extend_from_slice(&crc.to_be_bytes());
                self.respond(&answer);
            }
            13 => {
                let status = self.status_byte;
                self.respond(&[self.r1(), status]);
            }
            16 | 59 => {
                let r1 = self.r1();
                self.respond(&[r1]);
            }
            17 => {
                self.addresses.push(arg);
                let block = self.block_for(arg);
                if (block + 1) * 512 > self.storage.len() {
                    self.respond(&[0x20]);
                } else if let Some(token) = self.read_error_token {
                    self.respond(&[0x00, 0xFF, token]);
                } else if self.read_token_never {
                    self.respond(&[0x00]);
                } else {
                    let data = self.block(block).to_vec();
                    let mut crc = crc16(&data);
                    if self.corrupt_read_crc {
                        crc ^= 0x0101;
                    }
                    let mut answer = vec![0x00, 0xFF, 0xFE];
                    answer.extend_from_slice(&data);
                    answer.extend_from_slice(&crc.to_be_bytes());
                    self.respond(&answer);
                }
            }
            24 => {
                self.addresses.push(arg);
                let block = self.block_for(arg);
                if (block + 1) * 512 > self.storage.len() {
                    self.respond(&[0x20]);
                } else {
                    self.respond(&[0x00]);
                    self.state = State::AwaitWriteToken { block };
                }
            }
            41 if app_cmd => {
                self.acmd41_args.push(arg);
                self.acmd41_seen += 1;
                if self.acmd41_seen > self.acmd41_busy_count {
                    self.initialized = true;
                }
                let r1 = self.r1();
                self.respond(&[r1]);
            }
            55 => {
                self.app_cmd = true;
                let r1 = self.r1();
                self.respond(&[r1]);
            }
            58 => {
                if self.cmd58_illegal {
                    let r1 = self.r1() | 0x04;
                    self.respond(&[r1]);
                    return;
                }
                let mut ocr: u32 = 0x00FF_8000;
                if self.initialized && !self.power_up_never {
                    ocr |= 1 << 31;
                    if self.high_capacity {
                        ocr |= 1 << 30;
                    }
                }
                let mut answer = vec![self.r1()];
                answer.extend_from_slice(&ocr.to_be_bytes());
                self.respond(&answer);
            }
            _ => {
                let r1 = self.r1() | 0x04;
                self.respond(&[r1]);
            }
        }
    }
}

pub type SharedCard = Rc<RefCell<CardModel>>;

pub struct FakeSpi(pub SharedCard);

impl embedded_hal::blocking::spi::Transfer<u8> for FakeSpi {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(words)
    }
}

pub struct FakeCs(pub SharedCard);

impl embedded_hal::digital::v2::OutputPin for FakeCs {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        self.0.borrow_mut().set_selected(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        self.0.borrow_mut().set_selected(false);
        Ok(())
    }
}

pub fn fake_card(model: CardModel) -> (FakeSpi, FakeCs, SharedCard) {
    let shared = Rc::new(RefCell::new(model));
    (FakeSpi(shared.clone()), FakeCs(shared.clone()), shared)
}

// ****************************************************************************
//
// FAT32 images
//
// ****************************************************************************

pub const PARTITION_START: u32 = 8;
pub const SECTORS_PER_CLUSTER: u32 = 2;
pub const RESERVED_SECTORS: u32 = 32;
pub const NUM_FATS: u32 = 2;
pub const FAT_SIZE: u32 = 4;
pub const CLUSTERS: u32 = 400;
pub const VOLUME_SECTORS: u32 =
    RESERVED_SECTORS + NUM_FATS * FAT_SIZE + SECTORS_PER_CLUSTER * CLUSTERS;
pub const CLUSTER_BYTES: usize = SECTORS_PER_CLUSTER as usize * 512;
/// Absolute sector of cluster 2.
pub const DATA_START: u32 = PARTITION_START + RESERVED_SECTORS + NUM_FATS * FAT_SIZE;

pub const EOF: u32 = 0x0FFF_FFFF;
pub const BAD: u32 = 0x0FFF_FFF7;

pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_VOLUME_ID: u8 = 0x08;

const LFN_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// A directory being filled, slot by slot.
pub struct DirBuilder {
    pub clusters: Vec<u32>,
    next_slot: usize,
}

impl DirBuilder {
    pub fn first_cluster(&self) -> u32 {
        self.clusters[0]
    }
}

/// An MBR partitioned disk image with one FAT32 volume: 400 clusters of
/// two sectors, two FATs of four sectors, root directory in cluster 2.
pub struct FatImage {
    pub data: Vec<u8>,
}

impl FatImage {
    pub fn new() -> Self {
        let total = (PARTITION_START + VOLUME_SECTORS) as usize;
        let mut image = FatImage {
            data: vec![0u8; total * 512],
        };

        // MBR, partition 1
        {
            let mbr = image.sector(0);
            let entry = &mut mbr[446..462];
            entry[0] = 0x80;
            entry[4] = 0x0C;
            entry[8..12].copy_from_slice(&PARTITION_START.to_le_bytes());
            entry[12..16].copy_from_slice(&VOLUME_SECTORS.to_le_bytes());
            mbr[510] = 0x55;
            mbr[511] = 0xAA;
        }

        // Boot sector
        {
            let bs = image.volume_sector(0);
            bs[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
            bs[3..11].copy_from_slice(b"SDFAT32 ");
            bs[11..13].copy_from_slice(&512u16.to_le_bytes());
            bs[13] = SECTORS_PER_CLUSTER as u8;
            bs[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
            bs[16] = NUM_FATS as u8;
            bs[21] = 0xF8;
            bs[28..32].copy_from_slice(&PARTITION_START.to_le_bytes());
            bs[32..36].copy_from_slice(&VOLUME_SECTORS.to_le_bytes());
            bs[36..40].copy_from_slice(&FAT_SIZE.to_le_bytes());
            bs[44..48].copy_from_slice(&2u32.to_le_bytes());
            bs[48..50].copy_from_slice(&1u16.to_le_bytes());
            bs[50..52].copy_from_slice(&6u16.to_le_bytes());
            bs[66] = 0x29;
            bs[67..71].copy_from_slice(&0x1234_5678u32.to_le_bytes());
            bs[71..82].copy_from_slice(b"SDFAT32    ");
            bs[82..90].copy_from_slice(b"FAT32   ");
            bs[510] = 0x55;
            bs[511] = 0xAA;
        }

        // FSInfo
        {
            let info = image.volume_sector(1);
            info[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
            info[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
            info[488..492].copy_from_slice(&350u32.to_le_bytes());
            info[492..496].copy_from_slice(&3u32.to_le_bytes());
            info[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        }

        image.set_fat(0, 0x0FFF_FFF8);
        image.set_fat(1, EOF);
        image.set_fat(2, EOF);
        image
    }

    pub fn sector(&mut self, idx: u32) -> &mut [u8] {
        let start = idx as usize * 512;
        &mut self.data[start..start + 512]
    }

    pub fn volume_sector(&mut self, idx: u32) -> &mut [u8] {
        self.sector(PARTITION_START + idx)
    }

    pub fn set_fat_copy(&mut self, fat: u32, cluster: u32, value: u32) {
        let sector = RESERVED_SECTORS + fat * FAT_SIZE + cluster / 128;
        let offset = (cluster % 128) as usize * 4;
        self.volume_sector(sector)[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Write an entry into every FAT copy.
    pub fn set_fat(&mut self, cluster: u32, value: u32) {
        for fat in 0..NUM_FATS {
            self.set_fat_copy(fat, cluster, value);
        }
    }

    pub fn chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = clusters.last() {
            self.set_fat(last, EOF);
        }
    }

    pub fn cluster(&mut self, cluster: u32) -> &mut [u8] {
        let start = (DATA_START + (cluster - 2) * SECTORS_PER_CLUSTER) as usize * 512;
        &mut self.data[start..start + CLUSTER_BYTES]
    }

    /// Spread `contents` over `clusters`, in order.
    pub fn write_data(&mut self, clusters: &[u32], contents: &[u8]) {
        for (&cluster, chunk) in clusters.iter().zip(contents.chunks(CLUSTER_BYTES)) {
            self.cluster(cluster)[..chunk.len()].copy_from_slice(chunk);
        }
    }

    pub fn root(&self) -> DirBuilder {
        DirBuilder {
            clusters: vec![2],
            next_slot: 0,
        }
    }

    pub fn push_slot(&mut self, dir: &mut DirBuilder, slot: [u8; 32]) {
        let per_cluster = CLUSTER_BYTES / 32;
        let cluster = dir.clusters[dir.next_slot / per_cluster];
        let offset = (dir.next_slot % per_cluster) * 32;
        self.cluster(cluster)[offset..offset + 32].copy_from_slice(&slot);
        dir.next_slot += 1;
    }

    /// Add a file; `long` adds long name slots in front of the entry.
    pub fn add_file(
        &mut self,
        dir: &mut DirBuilder,
        long: Option<&str>,
        short: &[u8; 11],
        clusters: &[u32],
        contents: &[u8],
    ) {
        if let Some(long) = long {
            for slot in lfn_slots(long, short) {
                self.push_slot(dir, slot);
            }
        }
        let first = clusters.first().cloned().unwrap_or(0);
        self.push_slot(
            dir,
            short_slot(short, ATTR_ARCHIVE, first, contents.len() as u32),
        );
        self.chain(clusters);
        self.write_data(clusters, contents);
    }

    /// Add a subdirectory with its `.` and `..` entries.
    pub fn add_dir(
        &mut self,
        parent: &mut DirBuilder,
        long: Option<&str>,
        short: &[u8; 11],
        clusters: &[u32],
    ) -> DirBuilder {
        if let Some(long) = long {
            for slot in lfn_slots(long, short) {
                self.push_slot(parent, slot);
            }
        }
        self.push_slot(parent, short_slot(short, ATTR_DIRECTORY, clusters[0], 0));
        self.chain(clusters);
        for &cluster in clusters {
            for b in self.cluster(cluster).iter_mut() {
                *b = 0;
            }
        }

        let mut dir = DirBuilder {
            clusters: clusters.to_vec(),
            next_slot: 0,
        };
        let parent_cluster = if parent.first_cluster() == 2 {
            0
        } else {
            parent.first_cluster()
        };
        self.push_slot(&mut dir, short_slot(b".          ", ATTR_DIRECTORY, clusters[0], 0));
        self.push_slot(&mut dir, short_slot(b"..         ", ATTR_DIRECTORY, parent_cluster, 0));
        dir
    }
}

pub fn short_slot(name: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut slot = [0u8; 32];
    slot[..11].copy_from_slice(name);
    slot[11] = attr;
    slot[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
    // 2021-09-01 12:00:00
    slot[22..24].copy_from_slice(&0x6000u16.to_le_bytes());
    slot[24..26].copy_from_slice(&0x5321u16.to_le_bytes());
    slot[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
    slot[28..32].copy_from_slice(&size.to_le_bytes());
    slot
}

pub fn short_name_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// Long name slots in on-disk order: highest ordinal first.
pub fn lfn_slots(name: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
    let checksum = short_name_checksum(short);
    let units: Vec<u16> = name.encode_utf16().collect();
    let count = (units.len() + 12) / 13;
    let mut slots = Vec::new();
    for ordinal in (1..=count).rev() {
        let mut slot = [0u8; 32];
        slot[0] = ordinal as u8 | if ordinal == count { 0x40 } else { 0 };
        slot[11] = 0x0F;
        slot[13] = checksum;
        for (i, &offset) in LFN_OFFSETS.iter().enumerate() {
            let idx = (ordinal - 1) * 13 + i;
            let unit = if idx < units.len() {
                units[idx]
            } else if idx == units.len() {
                0x0000
            } else {
                0xFFFF
            };
            slot[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
        }
        slots.push(slot);
    }
    slots
}

/// Recognisable file contents.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

/// The image used by most volume tests:
///
/// ```text
/// /SDFAT32        volume label
/// /HELLO.TXT      "Hello, world!\n", cluster 3
/// /Readme Notes.txt  3000 bytes over clusters 10, 11, 30
/// (deleted "Old stuff.bin" with its long name)
/// /DOCS/          cluster 5
///     Notes For Later.txt  700 bytes, cluster 6
///     EMPTY.DAT   0 bytes
/// /TRUNC.BIN      5000 bytes claimed, one cluster (40)
/// /BADCHAIN.BIN   3000 bytes, clusters 50 -> bad
/// /FREECHN.BIN    3000 bytes, clusters 60 -> free
/// ```
pub fn sample_image() -> FatImage {
    let mut image = FatImage::new();
    let mut root = image.root();

    image.push_slot(&mut root, short_slot(b"SDFAT32    ", ATTR_VOLUME_ID, 0, 0));
    image.add_file(&mut root, None, b"HELLO   TXT", &[3], b"Hello, world!\n");
    image.add_file(
        &mut root,
        Some("Readme Notes.txt"),
        b"README~1TXT",
        &[10, 11, 30],
        &pattern(3000, 0x11),
    );

    let mut deleted = lfn_slots("Old stuff.bin", b"OLDSTU~1BIN");
    for slot in deleted.iter_mut() {
        slot[0] = 0xE5;
    }
    for slot in deleted {
        image.push_slot(&mut root, slot);
    }
    let mut old = short_slot(b"OLDSTU~1BIN", ATTR_ARCHIVE, 20, 100);
    old[0] = 0xE5;
    image.push_slot(&mut root, old);

    let mut docs = image.add_dir(&mut root, None, b"DOCS       ", &[5]);
    image.add_file(
        &mut docs,
        Some("Notes For Later.txt"),
        b"NOTESF~1TXT",
        &[6],
        &pattern(700, 0x22),
    );
    image.add_file(&mut docs, None, b"EMPTY   DAT", &[], &[]);

    image.add_file(&mut root, None, b"TRUNC   BIN", &[40], &pattern(1024, 0x33));
    let trunc = short_slot(b"TRUNC   BIN", ATTR_ARCHIVE, 40, 5000);
    // Overwrite the size of the entry just written.
    root.next_slot -= 1;
    image.push_slot(&mut root, trunc);

    image.add_file(&mut root, None, b"BADCHAINBIN", &[50, 51], &pattern(3000, 0x44));
    image.set_fat(51, BAD);
    image.add_file(&mut root, None, b"FREECHN BIN", &[60, 61], &pattern(3000, 0x55));
    image.set_fat(61, 0);

    image
}
