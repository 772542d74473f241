//! Activation dump file header.

/// Fixed-size header preceding the little-endian f32 payload of a `.bin` dump.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct DumpHeader {
    pub magic: u32,
    pub version: u32,
    pub dtype: u32,
    pub rank: u32,
    /// Unused trailing dimensions are 1.
    pub dims: [u32; 4],
    /// Fraction bits of the stored integers, or [`FLOAT_DOMAIN`] for real values.
    pub frac_bits: i32,
    pub reserved: u32,
}

pub const MAGIC_DUMP: u32 = 0x4441_5147; // "GQAD" little-endian
pub const VERSION: u32 = 1;
pub const DTYPE_F32: u32 = 0x20;
pub const FLOAT_DOMAIN: i32 = -1;
