// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{Extent4D, ImageDim, ImageUsage, SampleLayout};
use crate::format::Format;

/// Width of a GOB in bytes.
pub const GOB_WIDTH_B: u32 = 64;
/// Depth of a GOB.
pub const GOB_DEPTH: u32 = 1;

/// Height of a GOB in rows.
#[inline]
pub const fn gob_height(gob_height_8: bool) -> u32 {
    if gob_height_8 {
        8
    } else {
        4
    }
}

/// The tiling parameters of one mip level.
///
/// A tile is a 3D stack of GOBs, `1 << x_log2` GOBs wide, `1 << y_log2` high and
/// `1 << z_log2` deep. Tile dimensions are stored as log2 extents because the
/// hardware only supports power-of-two stacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tiling {
    pub is_tiled: bool,
    /// Whether the GOBs are 8 rows high (the default) or 4.
    pub gob_height_8: bool,
    pub x_log2: u8,
    pub y_log2: u8,
    pub z_log2: u8,
}

impl Tiling {
    /// Row-major linear layout.
    pub const LINEAR: Tiling = Tiling {
        is_tiled: false,
        gob_height_8: false,
        x_log2: 0,
        y_log2: 0,
        z_log2: 0,
    };

    /// The extent of one tile in bytes.
    pub fn extent_b(self) -> Extent4D {
        if self.is_tiled {
            Extent4D {
                width: GOB_WIDTH_B << self.x_log2,
                height: gob_height(self.gob_height_8) << self.y_log2,
                depth: GOB_DEPTH << self.z_log2,
                array_len: 1,
            }
        } else {
            // Linear layouts are handled in Image::new.
            Extent4D::new(1, 1, 1, 1)
        }
    }

    /// The size of one tile in bytes.
    pub fn size_b(self) -> u32 {
        let extent_b = self.extent_b();
        extent_b.width * extent_b.height * extent_b.depth * extent_b.array_len
    }

    /// Clamps the tiling to less than 2x the given extent in each dimension.
    ///
    /// The hardware applies this operation at each LOD: the moment a level is
    /// smaller than a tile, the tile width collapses to a single GOB and the
    /// height/depth log2s are capped to the level's extent in GOBs.
    pub fn clamp(self, extent_b: Extent4D) -> Tiling {
        let mut tiling = self;

        if !tiling.is_tiled {
            return tiling;
        }

        let tiling_extent_b = tiling.extent_b();

        if extent_b.width < tiling_extent_b.width
            || extent_b.height < tiling_extent_b.height
            || extent_b.depth < tiling_extent_b.depth
        {
            tiling.x_log2 = 0;
        }

        let extent_gob = extent_b.b_to_gob(tiling.gob_height_8);

        tiling.y_log2 = u8::min(tiling.y_log2, crate::log2_ceil(extent_gob.height) as u8);
        tiling.z_log2 = u8::min(tiling.z_log2, crate::log2_ceil(extent_gob.depth) as u8);

        tiling
    }
}

/// Chooses the tiling for a freshly created image.
pub(crate) fn choose_tiling(
    extent_px: Extent4D,
    format: Format,
    sample_layout: SampleLayout,
    usage: ImageUsage,
) -> Tiling {
    if usage.linear {
        return Tiling::LINEAR;
    }

    let mut tiling = Tiling {
        is_tiled: true,
        gob_height_8: true,
        x_log2: 0,
        y_log2: 5,
        z_log2: 5,
    };

    if usage.view_2d {
        tiling.z_log2 = 0;
    }

    let extent_b = extent_px.px_to_b(format, sample_layout);

    tiling.clamp(extent_b)
}

/// The standard sparse block shape for a format, in elements.
fn sparse_block_extent_el(format: Format, dim: ImageDim) -> Extent4D {
    // One sparse block is always 64 KiB; the shape depends on the texel size.
    match dim {
        ImageDim::Dim2D => match format.bits_per_block() {
            8 => Extent4D::new(256, 256, 1, 1),
            16 => Extent4D::new(256, 128, 1, 1),
            32 => Extent4D::new(128, 128, 1, 1),
            64 => Extent4D::new(128, 64, 1, 1),
            128 => Extent4D::new(64, 64, 1, 1),
            _ => unreachable!("invalid texel size"),
        },
        ImageDim::Dim3D => match format.bits_per_block() {
            8 => Extent4D::new(64, 32, 32, 1),
            16 => Extent4D::new(32, 32, 32, 1),
            32 => Extent4D::new(32, 32, 16, 1),
            64 => Extent4D::new(32, 16, 16, 1),
            128 => Extent4D::new(16, 16, 16, 1),
            _ => unreachable!("invalid texel size"),
        },
        ImageDim::Dim1D => unreachable!("1D images cannot be sparse"),
    }
}

/// The standard sparse block shape for a format, in pixels.
pub fn sparse_block_extent_px(
    format: Format,
    dim: ImageDim,
    sample_layout: SampleLayout,
) -> Extent4D {
    let block_extent_el = sparse_block_extent_el(format, dim);
    let desc = format.desc();
    let block_extent_sa =
        block_extent_el.mul(Extent4D::new(desc.block_width, desc.block_height, 1, 1));

    block_extent_sa.div_round_up(sample_layout.px_extent_sa())
}

fn sparse_block_extent_b(format: Format, dim: ImageDim) -> Extent4D {
    sparse_block_extent_el(format, dim).el_to_b(format.block_size())
}

/// The tiling matching the standard sparse block shape, so that one tile is
/// exactly one sparse binding unit.
pub(crate) fn sparse_tiling(format: Format, dim: ImageDim) -> Tiling {
    let block_extent_b = sparse_block_extent_b(format, dim);

    assert!(block_extent_b.width.is_power_of_two());
    assert!(block_extent_b.height.is_power_of_two());
    assert!(block_extent_b.depth.is_power_of_two());

    let gob_height_8 = true;
    let block_extent_gob = block_extent_b.b_to_gob(gob_height_8);

    Tiling {
        is_tiled: true,
        gob_height_8,
        x_log2: block_extent_gob.width.trailing_zeros() as u8,
        y_log2: block_extent_gob.height.trailing_zeros() as u8,
        z_log2: block_extent_gob.depth.trailing_zeros() as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_extent_and_size() {
        let tiling = Tiling {
            is_tiled: true,
            gob_height_8: true,
            x_log2: 0,
            y_log2: 5,
            z_log2: 0,
        };
        assert_eq!(tiling.extent_b(), Extent4D::new(64, 256, 1, 1));
        assert_eq!(tiling.size_b(), 64 * 256);
        assert_eq!(Tiling::LINEAR.extent_b(), Extent4D::new(1, 1, 1, 1));
    }

    #[test]
    fn clamp_collapses_width_first() {
        let tiling = Tiling {
            is_tiled: true,
            gob_height_8: true,
            x_log2: 2,
            y_log2: 5,
            z_log2: 0,
        };

        // Smaller than one tile in every dimension: width goes to a single GOB
        // and the height log2 is capped at ceil(log2(extent in GOBs)).
        let clamped = tiling.clamp(Extent4D::new(128, 24, 1, 1));
        assert_eq!(clamped.x_log2, 0);
        assert_eq!(clamped.y_log2, 2); // 24 rows = 3 GOBs -> ceil(log2(3)) = 2
        assert_eq!(clamped.z_log2, 0);

        // Larger than a tile in every dimension: unchanged.
        let unclamped = tiling.clamp(Extent4D::new(4096, 4096, 1, 1));
        assert_eq!(unclamped, tiling);
    }

    #[test]
    fn sparse_blocks_are_64k() {
        for format in [
            Format::R8Unorm,
            Format::R16Float,
            Format::R8G8B8A8Unorm,
            Format::R32G32Float,
            Format::R32G32B32A32Float,
        ] {
            for dim in [ImageDim::Dim2D, ImageDim::Dim3D] {
                let extent_b = sparse_block_extent_b(format, dim);
                assert_eq!(
                    extent_b.width * extent_b.height * extent_b.depth,
                    65536,
                    "{:?} {:?}",
                    format,
                    dim
                );
                // The matching tiling covers exactly one sparse block.
                assert_eq!(sparse_tiling(format, dim).size_b(), 65536);
            }
        }
    }
}
