use byteorder::{ByteOrder, LittleEndian};

/// Wire layout of one pixel in a captured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// 16-bit word, red in the low 5 bits, then 6 green, then 5 blue
    OldDs565,

    /// 16-bit word, blue in the low 5 bits, then 6 green, then 5 red
    Optimize565,

    /// Three bytes, red first
    Rgb888,
}

impl PixelLayout {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Rgb888 => 3,
            _ => 2,
        }
    }

    /// Raw channel values of pixel `index`, at their native bit widths.
    pub fn decode(&self, data: &[u8], index: usize) -> Option<PixelChannels> {
        let start = index * self.bytes_per_pixel();
        let bytes = data.get(start..start + self.bytes_per_pixel())?;

        let channels = match self {
            PixelLayout::OldDs565 => {
                let word = LittleEndian::read_u16(bytes);
                PixelChannels::new(bits(word, 0, 5), bits(word, 5, 6), bits(word, 11, 5))
            }
            PixelLayout::Optimize565 => {
                let word = LittleEndian::read_u16(bytes);
                PixelChannels::new(bits(word, 11, 5), bits(word, 5, 6), bits(word, 0, 5))
            }
            PixelLayout::Rgb888 => PixelChannels::new(bytes[0], bytes[1], bytes[2]),
        };

        Some(channels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelChannels {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PixelChannels {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

fn bits(word: u16, shift: u32, width: u32) -> u8 {
    ((word >> shift) & ((1 << width) - 1)) as u8
}
