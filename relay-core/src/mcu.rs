use crate::{RelayError, Result};

use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;

use relay_common::{HW_TYPE_V1, HW_TYPE_V2};

/// Microcontroller generation, decides flash layout and firmware images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McuType {
    F4,
    H7,
}

/// Flash layout and images for one MCU family
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct McuConfig {
    #[getset(get = "pub")]
    sector_sizes: Vec<u32>,
    #[getset(get_copy = "pub")]
    flash_base: u32,
    #[getset(get_copy = "pub")]
    bootstub_address: u32,
    #[getset(get_copy = "pub")]
    app_address: u32,
    /// DfuSe download block size
    #[getset(get_copy = "pub")]
    block_size: usize,
    #[getset(get = "pub")]
    app_fn: String,
    #[getset(get = "pub")]
    bootstub_fn: String,
}

impl McuConfig {
    pub fn sector_count(&self) -> usize {
        self.sector_sizes.len()
    }

    pub fn sector_address(&self, sector: usize) -> u32 {
        self.flash_base + self.sector_sizes.iter().take(sector).sum::<u32>()
    }
}

lazy_static! {
    static ref F4_CONFIG: McuConfig = McuConfig {
        sector_sizes: {
            let mut sizes = vec![0x4000; 4];
            sizes.push(0x10000);
            sizes.extend_from_slice(&[0x20000; 7]);
            sizes
        },
        flash_base: 0x0800_0000,
        bootstub_address: 0x0800_0000,
        app_address: 0x0800_4000,
        block_size: 0x800,
        app_fn: "relay.bin.signed".to_owned(),
        bootstub_fn: "bootstub.relay.bin".to_owned(),
    };
    static ref H7_CONFIG: McuConfig = McuConfig {
        sector_sizes: vec![0x20000; 8],
        flash_base: 0x0800_0000,
        bootstub_address: 0x0800_0000,
        app_address: 0x0802_0000,
        block_size: 0x400,
        app_fn: "relay_h7.bin.signed".to_owned(),
        bootstub_fn: "bootstub.relay_h7.bin".to_owned(),
    };
}

impl McuType {
    pub const ALL: [McuType; 2] = [McuType::F4, McuType::H7];

    pub fn config(&self) -> &'static McuConfig {
        match self {
            McuType::F4 => &F4_CONFIG,
            McuType::H7 => &H7_CONFIG,
        }
    }

    pub fn from_hw_type(hw_type: u8) -> Result<Self> {
        match hw_type {
            HW_TYPE_V1 => Ok(McuType::F4),
            HW_TYPE_V2 => Ok(McuType::H7),
            other => Err(RelayError::UnknownHardwareType(other)),
        }
    }

    /// The bootloader only tells us how many sectors it sees
    pub fn from_sector_count(count: usize) -> Result<Self> {
        McuType::ALL
            .iter()
            .copied()
            .find(|mcu| mcu.config().sector_count() == count)
            .ok_or(RelayError::UnknownMcu(count))
    }
}
