//! Register window backed by a memory mapping of the FPGA user BAR.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tracing::info;

use super::RegisterAccess;
use crate::error::{CaptureError, Result};

/// Volatile 32-bit access to a mapped register bank, e.g. a PCI
/// `resourceN` file in sysfs.
pub struct MmioRegisters {
    map: MmapMut,
}

impl MmioRegisters {
    pub fn open(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // SAFETY: the BAR resource file is device memory; nothing else in this
        // process maps it, and all access goes through volatile reads/writes.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        info!(path = %path.display(), len, "mapped register window");
        Self::from_map(map)
    }

    /// Anonymous window, useful when no hardware is present.
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::from_map(MmapOptions::new().len(len).map_anon()?)
    }

    fn from_map(map: MmapMut) -> Result<Self> {
        if map.len() < 4 || map.as_ptr() as usize % 4 != 0 {
            return Err(CaptureError::InvalidArgument(format!(
                "register window of {} bytes is unusable",
                map.len()
            )));
        }
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn slot(&self, offset: u32) -> Option<*mut u32> {
        let off = offset as usize;
        if off % 4 != 0 || off + 4 > self.map.len() {
            return None;
        }
        Some(self.map.as_ptr().wrapping_add(off) as *mut u32)
    }
}

impl RegisterAccess for MmioRegisters {
    fn read32(&self, offset: u32) -> u32 {
        match self.slot(offset) {
            // SAFETY: slot() bounds-checks and aligns the offset within the mapping.
            Some(p) => unsafe { p.read_volatile() },
            None => u32::MAX,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if let Some(p) = self.slot(offset) {
            // SAFETY: as for read32; the mapping is writable.
            unsafe { p.write_volatile(value) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::regs;

    #[test]
    fn anonymous_window_round_trips_registers() {
        let mmio = MmioRegisters::anonymous(regs::USER_BAR_SIZE).unwrap();
        mmio.write32(regs::REG_CONTROL, regs::CTRL_ENABLE);
        assert_eq!(mmio.read32(regs::REG_CONTROL), regs::CTRL_ENABLE);
        assert_eq!(mmio.read32(regs::REG_CAPS), 0);
    }

    #[test]
    fn out_of_range_reads_float_high() {
        let mmio = MmioRegisters::anonymous(0x100).unwrap();
        assert_eq!(mmio.read32(0x100), u32::MAX);
        assert_eq!(mmio.read32(0x2), u32::MAX);
        mmio.write32(0x1000, 1);
    }

    #[test]
    fn open_maps_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(0x1000).unwrap();
        let mmio = MmioRegisters::open(file.path(), 0x1000).unwrap();
        mmio.write32(regs::REG_VID_FORMAT, regs::VID_FMT_YUV422);
        assert_eq!(mmio.read32(regs::REG_VID_FORMAT), regs::VID_FMT_YUV422);
        assert_eq!(mmio.len(), 0x1000);
    }
}
