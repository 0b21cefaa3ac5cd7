// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{bits, map_swizzle, BitField, ChannelSelect};
use crate::{
    device::GfxLevel,
    format::{buffer_data_format, buffer_num_format, unified_img_format},
    image::{Image, ImageDim, SampleLayout},
};

/// The hardware resource type of an image view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ImageViewType {
    D1 = 8,
    D2 = 9,
    D3 = 10,
    Cube = 11,
    D1Array = 12,
    D2Array = 13,
    D2Msaa = 14,
    D2MsaaArray = 15,
}

/// The state an image-view descriptor is encoded from.
///
/// The layout half of the view comes from a computed [`Image`]; the selection
/// half (levels, layers, swizzle) is per-view.
#[derive(Clone, Copy, Debug)]
pub struct ImageViewState<'a> {
    pub image: &'a Image,
    /// GPU virtual address of the image allocation.
    pub va: u64,
    pub view_type: ImageViewType,
    pub swizzle: [ChannelSelect; 4],
    pub base_level: u32,
    pub last_level: u32,
    pub first_layer: u32,
    pub last_layer: u32,
}

// Word 1.
pub(crate) const BASE_ADDRESS_HI: BitField = bits(0, 8);
pub(crate) const IMG_DATA_FORMAT: BitField = bits(20, 6);
pub(crate) const IMG_NUM_FORMAT: BitField = bits(26, 4);
pub(crate) const IMG_FORMAT_GFX10: BitField = bits(20, 8);

// Word 2.
pub(crate) const WIDTH: BitField = bits(0, 14);
pub(crate) const HEIGHT: BitField = bits(14, 14);
pub(crate) const RESOURCE_LEVEL: BitField = bits(31, 1);

// Word 3.
pub(crate) const DST_SEL_X: BitField = bits(0, 3);
pub(crate) const DST_SEL_Y: BitField = bits(3, 3);
pub(crate) const DST_SEL_Z: BitField = bits(6, 3);
pub(crate) const DST_SEL_W: BitField = bits(9, 3);
pub(crate) const BASE_LEVEL: BitField = bits(12, 4);
pub(crate) const LAST_LEVEL: BitField = bits(16, 4);
pub(crate) const SW_MODE: BitField = bits(20, 5);
pub(crate) const TYPE: BitField = bits(28, 4);

// Word 4.
pub(crate) const DEPTH: BitField = bits(0, 13);
pub(crate) const PITCH_GFX6: BitField = bits(13, 14);
pub(crate) const PITCH_MSB_GFX103: BitField = bits(13, 3);
pub(crate) const DEPTH_GFX12: BitField = bits(0, 14);
pub(crate) const PITCH_MSB_GFX12: BitField = bits(14, 2);
pub(crate) const BASE_ARRAY_GFX10: BitField = bits(16, 13);

// Word 5.
pub(crate) const BASE_ARRAY_GFX6: BitField = bits(0, 13);
pub(crate) const LAST_ARRAY: BitField = bits(13, 13);
pub(crate) const MIP_TAIL_FIRST_LOD: BitField = bits(0, 4);
pub(crate) const TILE_MODE: BitField = bits(8, 12);

/// The swizzle-mode select: bit 4 distinguishes tiled from linear, the low bits
/// carry the tile-height log2.
fn sw_mode(image: &Image) -> u32 {
    let tiling = image.levels()[0].tiling;
    if tiling.is_tiled {
        0x10 | tiling.y_log2 as u32
    } else {
        0
    }
}

/// Encodes an image-view descriptor for the given generation.
///
/// Every word is fully written; words 6 and 7 are zero until compression
/// metadata is attached (see [`encode_fmask_descriptor`]).
///
/// [`encode_fmask_descriptor`]: super::encode_fmask_descriptor
pub fn encode_image_descriptor(gfx_level: GfxLevel, state: &ImageViewState<'_>) -> [u32; 8] {
    type BandFn = fn(GfxLevel, &ImageViewState<'_>) -> [u32; 8];

    const BANDS: &[(GfxLevel, BandFn)] = &[
        (GfxLevel::Gfx10, encode_gfx10),
        (GfxLevel::Gfx8, encode_gfx8),
    ];

    for &(min_level, band) in BANDS {
        if gfx_level >= min_level {
            return band(gfx_level, state);
        }
    }

    unreachable!("no image encoder band for {:?}", gfx_level);
}

/// Words 0 and 3, which are shared between the bands.
fn encode_common(state: &ImageViewState<'_>) -> [u32; 8] {
    let image = state.image;
    let extent = image.extent_px();

    assert!(state.base_level <= state.last_level);
    assert!((state.last_level as usize) < image.num_levels() as usize);
    assert!(state.first_layer <= state.last_layer);
    assert!(state.last_layer < extent.array_len);

    // For multisampled views the last-level field carries log2(samples) instead.
    let last_level = if image.sample_layout() != SampleLayout::S1x1 {
        image.sample_layout().samples().trailing_zeros()
    } else {
        state.last_level
    };

    let mut desc = [0u32; 8];
    desc[0] = (state.va >> 8) as u32;
    desc[3] = DST_SEL_X.place(map_swizzle(state.swizzle[0]))
        | DST_SEL_Y.place(map_swizzle(state.swizzle[1]))
        | DST_SEL_Z.place(map_swizzle(state.swizzle[2]))
        | DST_SEL_W.place(map_swizzle(state.swizzle[3]))
        | BASE_LEVEL.place(state.base_level)
        | LAST_LEVEL.place(last_level)
        | SW_MODE.place(sw_mode(image))
        | TYPE.place(state.view_type as u32);
    desc
}

fn encode_gfx8(_gfx_level: GfxLevel, state: &ImageViewState<'_>) -> [u32; 8] {
    let image = state.image;
    let extent = image.extent_px();
    let level0 = image.levels()[0];

    let mut desc = encode_common(state);

    desc[1] = BASE_ADDRESS_HI.place(((state.va >> 40) as u32) & BASE_ADDRESS_HI.max())
        | IMG_DATA_FORMAT.place(buffer_data_format(image.format()))
        | IMG_NUM_FORMAT.place(buffer_num_format(image.format()));
    desc[2] = WIDTH.place(extent.width - 1) | HEIGHT.place(extent.height - 1);

    let depth = match image.dim() {
        ImageDim::Dim3D => extent.depth - 1,
        _ => state.last_layer,
    };
    // Pitch in elements; for linear images this is the padded row stride.
    let pitch = level0.row_stride_b / image.format().block_size();
    desc[4] = DEPTH.place(depth) | PITCH_GFX6.place(pitch - 1);
    desc[5] = BASE_ARRAY_GFX6.place(state.first_layer) | LAST_ARRAY.place(state.last_layer);

    desc
}

fn encode_gfx10(gfx_level: GfxLevel, state: &ImageViewState<'_>) -> [u32; 8] {
    let image = state.image;
    let extent = image.extent_px();
    let level0 = image.levels()[0];

    let mut desc = encode_common(state);

    desc[1] = BASE_ADDRESS_HI.place(((state.va >> 40) as u32) & BASE_ADDRESS_HI.max())
        | IMG_FORMAT_GFX10.place(unified_img_format(image.format()));
    desc[2] = WIDTH.place(extent.width - 1)
        | HEIGHT.place(extent.height - 1)
        | RESOURCE_LEVEL.place_bool(gfx_level < GfxLevel::Gfx11);

    let depth = match image.dim() {
        ImageDim::Dim3D => extent.depth - 1,
        _ => state.last_layer,
    };
    desc[4] = BASE_ARRAY_GFX10.place(state.first_layer);

    if !level0.tiling.is_tiled && gfx_level >= GfxLevel::Gfx10_3 {
        // Gfx10.3+ can program a custom pitch for linear images, but it must stay
        // aligned to the minimum row-pitch granularity.
        let min_alignment = if gfx_level >= GfxLevel::Gfx12 { 128 } else { 256 };
        assert!(level0.row_stride_b % min_alignment == 0);
        let pitch = level0.row_stride_b / image.format().block_size();

        if gfx_level >= GfxLevel::Gfx12 {
            // DEPTH carries the low bits of PITCH.
            desc[4] |= DEPTH_GFX12.place((pitch - 1) & DEPTH_GFX12.max())
                | PITCH_MSB_GFX12.place((pitch - 1) >> 14);
        } else {
            desc[4] |= DEPTH.place((pitch - 1) & DEPTH.max())
                | PITCH_MSB_GFX103.place((pitch - 1) >> 13);
        }
    } else {
        desc[4] |= DEPTH.place(depth);
    }

    desc[5] = MIP_TAIL_FIRST_LOD.place(image.mip_tail_first_lod().min(MIP_TAIL_FIRST_LOD.max()))
        | TILE_MODE.place(image.tile_mode() as u32);

    desc
}
