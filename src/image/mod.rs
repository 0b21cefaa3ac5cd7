// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Image layout computation.
//!
//! An [`Image`](crate::image::Image) describes where every pixel of a
//! (possibly mipmapped, possibly multisampled, possibly tiled) image lives
//! within its allocation. The layout is computed once at image-creation time
//! from the extent/format/usage tuple and is immutable afterwards; the
//! descriptor encoders consume it to build GPU-readable views.
//!
//! # Units
//!
//! Extent and offset conversions are unit-explicit and chained, and every
//! function name carries the unit it operates in:
//!
//! - `px`: pixels, the unit the API speaks.
//! - `sa`: samples. A multisampled pixel covers a small grid of samples
//!   (see [`SampleLayout`]).
//! - `el`: elements, the unit the hardware addresses. For block-compressed
//!   formats one element is one compression block.
//! - `b`: bytes.
//! - `gob`: GOBs ("groups of bytes"), the fixed 64-byte-wide building block
//!   of the tiled layout.
//! - `tl`: tiles, power-of-two stacks of GOBs (see [`Tiling`]).

mod layout;
mod tiling;

pub use layout::{Image, ImageCreateInfo, ImageLevel, MAX_MIP_LEVELS};
pub use tiling::{
    gob_height, sparse_block_extent_px, Tiling, GOB_DEPTH, GOB_WIDTH_B,
};

use crate::format::Format;

/// An extent in four dimensions: width, height, depth and array length.
///
/// The unit of the first three dimensions depends on context (see the module
/// documentation); the array length is always in layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent4D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_len: u32,
}

impl Extent4D {
    #[inline]
    pub const fn new(width: u32, height: u32, depth: u32, array_len: u32) -> Extent4D {
        Extent4D {
            width,
            height,
            depth,
            array_len,
        }
    }

    /// The extent of mip level `level`, where `self` is the level-0 extent.
    pub(crate) fn minify(self, level: u32) -> Extent4D {
        Extent4D {
            width: u32::max(1, self.width >> level),
            height: u32::max(1, self.height >> level),
            depth: u32::max(1, self.depth >> level),
            array_len: self.array_len,
        }
    }

    pub(crate) fn div_round_up(self, denom: Extent4D) -> Extent4D {
        Extent4D {
            width: self.width.div_ceil(denom.width),
            height: self.height.div_ceil(denom.height),
            depth: self.depth.div_ceil(denom.depth),
            array_len: self.array_len.div_ceil(denom.array_len),
        }
    }

    pub(crate) fn mul(self, other: Extent4D) -> Extent4D {
        Extent4D {
            width: self.width * other.width,
            height: self.height * other.height,
            depth: self.depth * other.depth,
            array_len: self.array_len * other.array_len,
        }
    }

    pub(crate) fn align(self, alignment: Extent4D) -> Extent4D {
        Extent4D {
            width: crate::align_up_u32(self.width, alignment.width),
            height: crate::align_up_u32(self.height, alignment.height),
            depth: crate::align_up_u32(self.depth, alignment.depth),
            array_len: crate::align_up_u32(self.array_len, alignment.array_len),
        }
    }

    pub(crate) fn px_to_sa(self, sample_layout: SampleLayout) -> Extent4D {
        self.mul(sample_layout.px_extent_sa())
    }

    pub(crate) fn px_to_el(self, format: Format, sample_layout: SampleLayout) -> Extent4D {
        self.px_to_sa(sample_layout).div_round_up(el_extent_sa(format))
    }

    pub(crate) fn el_to_b(self, b_per_el: u32) -> Extent4D {
        Extent4D {
            width: self.width * b_per_el,
            ..self
        }
    }

    pub(crate) fn px_to_b(self, format: Format, sample_layout: SampleLayout) -> Extent4D {
        self.px_to_el(format, sample_layout)
            .el_to_b(format.block_size())
    }

    pub(crate) fn b_to_gob(self, gob_height_8: bool) -> Extent4D {
        self.div_round_up(Extent4D::new(
            GOB_WIDTH_B,
            gob_height(gob_height_8),
            GOB_DEPTH,
            1,
        ))
    }

    pub(crate) fn b_to_tl(self, tiling: Tiling) -> Extent4D {
        self.div_round_up(tiling.extent_b())
    }

    pub(crate) fn px_to_tl(
        self,
        tiling: Tiling,
        format: Format,
        sample_layout: SampleLayout,
    ) -> Extent4D {
        self.px_to_b(format, sample_layout).b_to_tl(tiling)
    }
}

/// An offset in four dimensions. Same unit conventions as [`Extent4D`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Offset4D {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub a: u32,
}

impl Offset4D {
    #[inline]
    pub const fn new(x: u32, y: u32, z: u32, a: u32) -> Offset4D {
        Offset4D { x, y, z, a }
    }

    fn div_round_down(self, denom: Extent4D) -> Offset4D {
        Offset4D {
            x: self.x / denom.width,
            y: self.y / denom.height,
            z: self.z / denom.depth,
            a: self.a / denom.array_len,
        }
    }

    fn mul(self, other: Extent4D) -> Offset4D {
        Offset4D {
            x: self.x * other.width,
            y: self.y * other.height,
            z: self.z * other.depth,
            a: self.a * other.array_len,
        }
    }

    pub fn px_to_el(self, format: Format, sample_layout: SampleLayout) -> Offset4D {
        self.mul(sample_layout.px_extent_sa())
            .div_round_down(el_extent_sa(format))
    }

    pub fn px_to_b(self, format: Format, sample_layout: SampleLayout) -> Offset4D {
        let mut offset_b = self.px_to_el(format, sample_layout);
        offset_b.x *= format.block_size();
        offset_b
    }

    pub fn px_to_tl(
        self,
        tiling: Tiling,
        format: Format,
        sample_layout: SampleLayout,
    ) -> Offset4D {
        self.px_to_b(format, sample_layout)
            .div_round_down(tiling.extent_b())
    }
}

/// The extent of one element in samples.
fn el_extent_sa(format: Format) -> Extent4D {
    let desc = format.desc();
    Extent4D::new(desc.block_width, desc.block_height, 1, 1)
}

/// How the samples of a multisampled pixel are laid out in the underlying
/// sample grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleLayout {
    S1x1,
    S2x1,
    S2x2,
    S4x2,
    S4x4,
}

impl SampleLayout {
    /// Chooses the layout for a sample count.
    ///
    /// # Panics
    ///
    /// - Panics if `samples` is not 1, 2, 4, 8 or 16. Unsupported sample counts
    ///   are a programming error, not a runtime condition.
    pub fn from_samples(samples: u32) -> SampleLayout {
        match samples {
            1 => SampleLayout::S1x1,
            2 => SampleLayout::S2x1,
            4 => SampleLayout::S2x2,
            8 => SampleLayout::S4x2,
            16 => SampleLayout::S4x4,
            _ => unreachable!("unsupported sample count"),
        }
    }

    /// The extent of one pixel in samples.
    pub fn px_extent_sa(self) -> Extent4D {
        match self {
            SampleLayout::S1x1 => Extent4D::new(1, 1, 1, 1),
            SampleLayout::S2x1 => Extent4D::new(2, 1, 1, 1),
            SampleLayout::S2x2 => Extent4D::new(2, 2, 1, 1),
            SampleLayout::S4x2 => Extent4D::new(4, 2, 1, 1),
            SampleLayout::S4x4 => Extent4D::new(4, 4, 1, 1),
        }
    }

    /// The number of samples per pixel.
    pub fn samples(self) -> u32 {
        let extent = self.px_extent_sa();
        extent.width * extent.height
    }
}

/// The dimensionality of an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageDim {
    Dim1D,
    Dim2D,
    Dim3D,
}

/// Usage flags that influence the layout of an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageUsage {
    /// Lay the image out linearly (row-major) instead of tiled. Restricted to
    /// 2D, single-level, single-sample images.
    pub linear: bool,
    /// The image may be viewed as 2D slices; forces single-GOB-deep tiles.
    pub view_2d: bool,
    /// The image will be sparsely bound; forces the standard sparse tile shape
    /// and 64 KiB alignment.
    pub sparse_residency: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minify_clamps_to_one() {
        let extent = Extent4D::new(963, 256, 1, 6);
        assert_eq!(extent.minify(0), extent);
        assert_eq!(extent.minify(1), Extent4D::new(481, 128, 1, 6));
        assert_eq!(extent.minify(10), Extent4D::new(1, 1, 1, 6));
    }

    #[test]
    fn px_to_el_rounds_up_blocks() {
        // A 10x10 BC1 image covers 3x3 blocks.
        let extent = Extent4D::new(10, 10, 1, 1);
        assert_eq!(
            extent.px_to_el(Format::Bc1RgbaUnorm, SampleLayout::S1x1),
            Extent4D::new(3, 3, 1, 1)
        );
    }

    #[test]
    fn px_to_b_chains_through_samples() {
        // 4 samples lay out as a 2x2 grid, so a 8x8 px R8 image is 16x16 bytes.
        let extent = Extent4D::new(8, 8, 1, 1);
        assert_eq!(
            extent.px_to_b(Format::R8Unorm, SampleLayout::S2x2),
            Extent4D::new(16, 16, 1, 1)
        );
    }

    #[test]
    fn sample_layout_counts() {
        for (samples, layout) in [
            (1, SampleLayout::S1x1),
            (2, SampleLayout::S2x1),
            (4, SampleLayout::S2x2),
            (8, SampleLayout::S4x2),
            (16, SampleLayout::S4x4),
        ] {
            assert_eq!(SampleLayout::from_samples(samples), layout);
            assert_eq!(layout.samples(), samples);
        }
    }

    #[test]
    #[should_panic]
    fn sample_layout_rejects_unsupported_counts() {
        let _ = SampleLayout::from_samples(3);
    }
}
