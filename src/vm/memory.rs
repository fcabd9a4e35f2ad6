/// 16-bit address space of the 8-bit machine.
pub const ADDR_MASK: u16 = 0xFFFF;
const BANK_SIZE: usize = 1 << 16;

/// Number of banks a banked configuration exposes to the guest.
pub const MAX_BANKS: u8 = 8;
/// Addresses at or above this are shared by every bank.
pub const DEFAULT_COMMON: u16 = 0xC000;

/// Byte-addressed memory as seen by port devices doing DMA.
pub trait Memory {
    fn read_byte(&self, addr: u16) -> u8;
    fn write_byte(&mut self, addr: u16, value: u8);

    /// Installed memory in bytes.
    fn size(&self) -> usize {
        BANK_SIZE
    }

    /// Number of banks, 0 when memory is not banked.
    fn banks(&self) -> u8 {
        0
    }

    fn bank(&self) -> u8 {
        0
    }

    fn select_bank(&mut self, _bank: u8) {}

    /// Base address of the memory shared between banks.
    fn common_base(&self) -> u16 {
        DEFAULT_COMMON
    }

    fn read_block(&self, addr: u16, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_byte(addr.wrapping_add(i as u16));
        }
    }

    fn write_block(&mut self, addr: u16, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.write_byte(addr.wrapping_add(i as u16), byte);
        }
    }
}

/// Flat 64K memory, optionally split into banks below `common`.
pub struct FlatMemory {
    banks: Vec<Box<[u8; BANK_SIZE]>>,
    selected: u8,
    common: u16,
    size: usize,
}

impl FlatMemory {
    pub fn new() -> Self {
        Self {
            banks: vec![Box::new([0; BANK_SIZE])],
            selected: 0,
            common: DEFAULT_COMMON,
            size: BANK_SIZE,
        }
    }

    /// Unbanked memory reporting `size` bytes installed.
    pub fn with_size(size: usize) -> Self {
        Self {
            size: size.min(BANK_SIZE),
            ..Self::new()
        }
    }

    pub fn banked(banks: u8, common: u16) -> Self {
        let banks = banks.clamp(1, MAX_BANKS);
        Self {
            banks: (0..banks).map(|_| Box::new([0; BANK_SIZE])).collect(),
            selected: 0,
            common,
            size: BANK_SIZE,
        }
    }

    fn locate(&self, addr: u16) -> usize {
        if addr >= self.common {
            0
        } else {
            self.selected as usize
        }
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory for FlatMemory {
    #[inline]
    fn read_byte(&self, addr: u16) -> u8 {
        self.banks[self.locate(addr)][addr as usize]
    }

    #[inline]
    fn write_byte(&mut self, addr: u16, value: u8) {
        let bank = self.locate(addr);
        self.banks[bank][addr as usize] = value;
    }

    fn size(&self) -> usize {
        self.size
    }

    fn banks(&self) -> u8 {
        if self.banks.len() > 1 {
            self.banks.len() as u8
        } else {
            0
        }
    }

    fn bank(&self) -> u8 {
        self.selected
    }

    fn select_bank(&mut self, bank: u8) {
        if (bank as usize) < self.banks.len() {
            self.selected = bank;
        }
    }

    fn common_base(&self) -> u16 {
        self.common
    }
}

/// 18-bit words.
pub const WORD_MASK: u32 = 0o777777;
/// Largest core the 18-bit machines address.
pub const MAX_CORE: u32 = 0o400000;
pub const CORE_ADDR_MASK: u32 = MAX_CORE - 1;

/// Word-addressed core of the 18-bit machine driving the tape controller.
pub trait WordMemory {
    fn read_word(&self, addr: u32) -> u32;
    fn write_word(&mut self, addr: u32, value: u32);
    /// Number of words present; addresses at or above are not backed.
    fn size(&self) -> u32;

    fn contains(&self, addr: u32) -> bool {
        addr < self.size()
    }
}

pub struct CoreMemory {
    words: Vec<u32>,
}

impl CoreMemory {
    pub fn new(size: u32) -> Self {
        Self {
            words: vec![0; size as usize],
        }
    }

    /// Address mask for a power-of-two sized core.
    pub fn addr_mask(&self) -> u32 {
        (self.words.len() as u32).next_power_of_two() - 1
    }
}

impl WordMemory for CoreMemory {
    fn read_word(&self, addr: u32) -> u32 {
        self.words.get(addr as usize).copied().unwrap_or(0)
    }

    fn write_word(&mut self, addr: u32, value: u32) {
        if let Some(word) = self.words.get_mut(addr as usize) {
            *word = value & WORD_MASK;
        }
    }

    fn size(&self) -> u32 {
        self.words.len() as u32
    }
}
