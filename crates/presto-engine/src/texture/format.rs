/// Storage class of a texture format, independent of component order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BaseFormat {
    U8,
    S8,
    P8,
    U4U4U4U4,
    U8U3U3U2,
    U1U5U5U5,
    U5U6U5,
    S5S5U6,
    U8U8,
    S8S8,
    U8U8U8,
    S8S8S8,
    U8U8U8U8,
    S8S8S8S8,
    F32,
    U32,
    S32,
}

impl BaseFormat {
    /// 8-bit formats take one byte, packed 16-bit formats two, 24-bit three,
    /// everything else four.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            BaseFormat::U8 | BaseFormat::S8 | BaseFormat::P8 => 1,
            BaseFormat::U4U4U4U4
            | BaseFormat::U8U3U3U2
            | BaseFormat::U1U5U5U5
            | BaseFormat::U5U6U5
            | BaseFormat::S5S5U6
            | BaseFormat::U8U8
            | BaseFormat::S8S8 => 2,
            BaseFormat::U8U8U8 | BaseFormat::S8S8S8 => 3,
            BaseFormat::U8U8U8U8
            | BaseFormat::S8S8S8S8
            | BaseFormat::F32
            | BaseFormat::U32
            | BaseFormat::S32 => 4,
        }
    }

    pub const fn is_paletted(self) -> bool {
        matches!(self, BaseFormat::P8)
    }
}

/// Pixel formats a texture can be created with.
///
/// Names list components from the most significant bits down, so
/// `A8B8G8R8` stores R in the lowest byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8-bit luminance.
    L8,
    /// 8-bit index into a 256-entry A8B8G8R8 palette.
    P8Abgr,
    A4R4G4B4,
    A1R5G5B5,
    R5G6B5,
    /// Luminance + alpha, 8 bits each.
    L8A8,
    /// Packed 24-bit RGB, red in the most significant byte.
    Rgb888,
    A8B8G8R8,
    A8R8G8B8,
    /// Single 32-bit float channel.
    R32F,
}

impl TextureFormat {
    pub const ALL: [TextureFormat; 10] = [
        TextureFormat::L8,
        TextureFormat::P8Abgr,
        TextureFormat::A4R4G4B4,
        TextureFormat::A1R5G5B5,
        TextureFormat::R5G6B5,
        TextureFormat::L8A8,
        TextureFormat::Rgb888,
        TextureFormat::A8B8G8R8,
        TextureFormat::A8R8G8B8,
        TextureFormat::R32F,
    ];

    pub const fn base(self) -> BaseFormat {
        match self {
            TextureFormat::L8 => BaseFormat::U8,
            TextureFormat::P8Abgr => BaseFormat::P8,
            TextureFormat::A4R4G4B4 => BaseFormat::U4U4U4U4,
            TextureFormat::A1R5G5B5 => BaseFormat::U1U5U5U5,
            TextureFormat::R5G6B5 => BaseFormat::U5U6U5,
            TextureFormat::L8A8 => BaseFormat::U8U8,
            TextureFormat::Rgb888 => BaseFormat::U8U8U8,
            TextureFormat::A8B8G8R8 | TextureFormat::A8R8G8B8 => BaseFormat::U8U8U8U8,
            TextureFormat::R32F => BaseFormat::F32,
        }
    }

    #[inline]
    pub const fn bytes_per_pixel(self) -> u32 {
        self.base().bytes_per_pixel()
    }

    #[inline]
    pub const fn is_paletted(self) -> bool {
        self.base().is_paletted()
    }

    /// Row pitch in bytes: the width padded to 8 pixels.
    #[inline]
    pub const fn stride(self, width: u32) -> u32 {
        padded_width(width) * self.bytes_per_pixel()
    }

    /// Bytes needed for a `width` x `height` linear image.
    #[inline]
    pub const fn footprint(self, width: u32, height: u32) -> usize {
        self.stride(width) as usize * height as usize
    }
}

/// Rounds `width` up to the 8-pixel boundary linear textures require.
#[inline]
pub const fn padded_width(width: u32) -> u32 {
    (width + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_pads_width_to_eight_pixels() {
        for format in TextureFormat::ALL {
            let bpp = format.bytes_per_pixel();
            for width in [1u32, 7, 8, 9, 63, 64, 320, 961] {
                let expected = width.div_ceil(8) * 8 * bpp;
                assert_eq!(format.stride(width), expected, "{format:?} width {width}");
            }
        }
    }

    #[test]
    fn footprint_is_stride_times_height() {
        for format in TextureFormat::ALL {
            assert_eq!(format.footprint(13, 5), format.stride(13) as usize * 5);
            assert_eq!(format.footprint(64, 0), 0);
        }
    }

    #[test]
    fn bytes_per_pixel_by_storage_class() {
        assert_eq!(TextureFormat::L8.bytes_per_pixel(), 1);
        assert_eq!(TextureFormat::P8Abgr.bytes_per_pixel(), 1);
        assert_eq!(TextureFormat::R5G6B5.bytes_per_pixel(), 2);
        assert_eq!(TextureFormat::A1R5G5B5.bytes_per_pixel(), 2);
        assert_eq!(TextureFormat::L8A8.bytes_per_pixel(), 2);
        assert_eq!(TextureFormat::Rgb888.bytes_per_pixel(), 3);
        assert_eq!(TextureFormat::A8B8G8R8.bytes_per_pixel(), 4);
        assert_eq!(TextureFormat::R32F.bytes_per_pixel(), 4);
        assert_eq!(BaseFormat::S32.bytes_per_pixel(), 4);
    }

    #[test]
    fn only_p8_is_paletted() {
        let paletted: Vec<_> = TextureFormat::ALL.into_iter().filter(|f| f.is_paletted()).collect();
        assert_eq!(paletted, vec![TextureFormat::P8Abgr]);
    }
}
