// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    bits,
    image::{
        BASE_ADDRESS_HI, BASE_ARRAY_GFX10, BASE_ARRAY_GFX6, DEPTH, DST_SEL_W, DST_SEL_X,
        DST_SEL_Y, DST_SEL_Z, HEIGHT, IMG_DATA_FORMAT, IMG_FORMAT_GFX10, IMG_NUM_FORMAT,
        LAST_ARRAY, PITCH_GFX6, RESOURCE_LEVEL, SW_MODE, TYPE, WIDTH,
    },
    BitField, ImageViewType,
};
use crate::device::GfxLevel;

/// The state a multisample-compression-metadata (FMASK) descriptor is encoded
/// from.
///
/// FMASK is the per-pixel sample-to-fragment mapping of a compressed
/// multisampled surface. It only exists below Gfx11; newer generations dropped
/// the dedicated metadata surface.
#[derive(Clone, Copy, Debug)]
pub struct FmaskState {
    /// GPU virtual address of the owning image allocation.
    pub va: u64,
    /// Byte offset of the FMASK surface within the allocation.
    pub fmask_offset: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub first_layer: u32,
    pub last_layer: u32,
    pub num_samples: u32,
    pub num_storage_samples: u32,
    pub view_type: ImageViewType,
    /// Swizzle mode of the FMASK surface (Gfx9 and Gfx10 bands).
    pub swizzle_mode: u32,
    /// Tiling index of the FMASK surface (pre-Gfx9 band).
    pub tiling_index: u32,
    /// Pitch of the FMASK surface in elements.
    pub pitch: u32,
    /// Whether sample-compression (CMASK) metadata is attached.
    pub tc_compat_cmask: bool,
    /// Byte offset of the CMASK surface within the allocation.
    pub cmask_offset: u64,
}

// Word 5 metadata fields (Gfx9 band).
pub(crate) const META_DATA_ADDRESS: BitField = bits(16, 8);
pub(crate) const META_PIPE_ALIGNED: BitField = bits(29, 1);
pub(crate) const META_RB_ALIGNED: BitField = bits(30, 1);

// Word 6.
pub(crate) const COMPRESSION_EN: BitField = bits(0, 1);
pub(crate) const META_PIPE_ALIGNED_GFX10: BitField = bits(1, 1);
pub(crate) const META_DATA_ADDRESS_LO_GFX10: BitField = bits(8, 24);

/// Maps a (samples, storage-samples) pair onto the shared FMASK format index.
///
/// # Panics
///
/// Unsupported combinations are a programming error and unreachable; the set of
/// valid pairs is fixed by the hardware.
fn fmask_format_index(num_samples: u32, num_storage_samples: u32) -> u32 {
    let key = (u32::max(1, num_samples), u32::max(1, num_storage_samples));

    match key {
        (2, 1) => 0,
        (2, 2) => 1,
        (4, 1) => 2,
        (4, 2) => 3,
        (4, 4) => 4,
        (8, 1) => 5,
        (8, 2) => 6,
        (8, 4) => 7,
        (8, 8) => 8,
        (16, 1) => 9,
        (16, 2) => 10,
        (16, 4) => 11,
        (16, 8) => 12,
        _ => unreachable!("invalid sample count"),
    }
}

// Band-specific bases for the shared format index.
const FMASK_DATA_FORMAT_GFX6_BASE: u32 = 0x10;
const FMASK_FORMAT_GFX10_BASE: u32 = 0x50;
/// The Gfx9 band keeps a single FMASK data format and moves the sample layout
/// into the numeric format.
const FMASK_DATA_FORMAT_GFX9: u32 = 0x2c;
const NUM_FORMAT_UINT: u32 = 4;

/// Encodes an FMASK descriptor for the given generation.
///
/// # Panics
///
/// - Panics if `gfx_level` is [`GfxLevel::Gfx11`] or newer; FMASK does not exist
///   there.
/// - Panics on invalid (samples, storage-samples) combinations.
pub fn encode_fmask_descriptor(gfx_level: GfxLevel, state: &FmaskState) -> [u32; 8] {
    assert!(gfx_level < GfxLevel::Gfx11);

    if gfx_level >= GfxLevel::Gfx10 {
        encode_gfx10(state)
    } else {
        encode_gfx6(gfx_level, state)
    }
}

fn encode_gfx6(gfx_level: GfxLevel, state: &FmaskState) -> [u32; 8] {
    let va = state.va + state.fmask_offset;
    let index = fmask_format_index(state.num_samples, state.num_storage_samples);

    let (data_format, num_format) = if gfx_level == GfxLevel::Gfx9 {
        (FMASK_DATA_FORMAT_GFX9, index)
    } else {
        (FMASK_DATA_FORMAT_GFX6_BASE + index, NUM_FORMAT_UINT)
    };

    let mut desc = [0u32; 8];
    desc[0] = (va >> 8) as u32;
    desc[1] = BASE_ADDRESS_HI.place(((va >> 40) as u32) & BASE_ADDRESS_HI.max())
        | IMG_DATA_FORMAT.place(data_format)
        | IMG_NUM_FORMAT.place(num_format);
    desc[2] = WIDTH.place(state.width - 1) | HEIGHT.place(state.height - 1);
    // FMASK fetches broadcast the single channel.
    desc[3] = DST_SEL_X.place(4)
        | DST_SEL_Y.place(4)
        | DST_SEL_Z.place(4)
        | DST_SEL_W.place(4)
        | TYPE.place(state.view_type as u32);

    if gfx_level == GfxLevel::Gfx9 {
        desc[3] |= SW_MODE.place(state.swizzle_mode);
        desc[4] = DEPTH.place(state.last_layer) | PITCH_GFX6.place(state.pitch - 1);
        desc[5] = BASE_ARRAY_GFX6.place(state.first_layer)
            | META_PIPE_ALIGNED.place(1)
            | META_RB_ALIGNED.place(1);

        if state.tc_compat_cmask {
            let cmask_va = state.va + state.cmask_offset;

            desc[5] |= META_DATA_ADDRESS.place(((cmask_va >> 40) as u32) & META_DATA_ADDRESS.max());
            desc[6] |= COMPRESSION_EN.place(1);
            desc[7] |= (cmask_va >> 8) as u32;
        }
    } else {
        desc[3] |= SW_MODE.place(state.tiling_index);
        desc[4] = DEPTH.place(state.depth - 1) | PITCH_GFX6.place(state.pitch - 1);
        desc[5] = BASE_ARRAY_GFX6.place(state.first_layer) | LAST_ARRAY.place(state.last_layer);

        if state.tc_compat_cmask {
            let cmask_va = state.va + state.cmask_offset;

            desc[6] |= COMPRESSION_EN.place(1);
            desc[7] |= (cmask_va >> 8) as u32;
        }
    }

    desc
}

fn encode_gfx10(state: &FmaskState) -> [u32; 8] {
    let va = state.va + state.fmask_offset;
    let index = fmask_format_index(state.num_samples, state.num_storage_samples);

    let mut desc = [0u32; 8];
    desc[0] = (va >> 8) as u32;
    desc[1] = BASE_ADDRESS_HI.place(((va >> 40) as u32) & BASE_ADDRESS_HI.max())
        | IMG_FORMAT_GFX10.place(FMASK_FORMAT_GFX10_BASE + index);
    desc[2] = WIDTH.place(state.width - 1)
        | HEIGHT.place(state.height - 1)
        | RESOURCE_LEVEL.place(1);
    desc[3] = DST_SEL_X.place(4)
        | DST_SEL_Y.place(4)
        | DST_SEL_Z.place(4)
        | DST_SEL_W.place(4)
        | SW_MODE.place(state.swizzle_mode)
        | TYPE.place(state.view_type as u32);
    desc[4] = DEPTH.place(state.last_layer) | BASE_ARRAY_GFX10.place(state.first_layer);
    desc[6] = META_PIPE_ALIGNED_GFX10.place(1);

    if state.tc_compat_cmask {
        let cmask_va = state.va + state.cmask_offset;

        desc[6] |= COMPRESSION_EN.place(1)
            | META_DATA_ADDRESS_LO_GFX10
                .place(((cmask_va >> 8) as u32) & META_DATA_ADDRESS_LO_GFX10.max());
        desc[7] |= (cmask_va >> 16) as u32;
    }

    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FmaskState {
        FmaskState {
            va: 0x1_0000_0000,
            fmask_offset: 0x20000,
            width: 512,
            height: 256,
            depth: 1,
            first_layer: 0,
            last_layer: 0,
            num_samples: 8,
            num_storage_samples: 4,
            view_type: ImageViewType::D2Msaa,
            swizzle_mode: 0x15,
            tiling_index: 3,
            pitch: 512,
            tc_compat_cmask: false,
            cmask_offset: 0,
        }
    }

    #[test]
    fn format_index_covers_all_valid_pairs() {
        let mut seen = Vec::new();
        for (s, f) in [
            (2, 1),
            (2, 2),
            (4, 1),
            (4, 2),
            (4, 4),
            (8, 1),
            (8, 2),
            (8, 4),
            (8, 8),
            (16, 1),
            (16, 2),
            (16, 4),
            (16, 8),
        ] {
            let index = fmask_format_index(s, f);
            assert!(!seen.contains(&index));
            seen.push(index);
        }
    }

    #[test]
    #[should_panic]
    fn invalid_sample_count_is_unreachable() {
        let _ = fmask_format_index(32, 1);
    }

    #[test]
    #[should_panic]
    fn fmask_does_not_exist_at_gfx11() {
        let _ = encode_fmask_descriptor(GfxLevel::Gfx11, &state());
    }

    #[test]
    fn bands_pick_distinct_format_fields() {
        let state = state();

        let gfx8 = encode_fmask_descriptor(GfxLevel::Gfx8, &state);
        assert_eq!(
            gfx8[1] & IMG_NUM_FORMAT.mask(),
            IMG_NUM_FORMAT.place(NUM_FORMAT_UINT)
        );

        let gfx9 = encode_fmask_descriptor(GfxLevel::Gfx9, &state);
        assert_eq!(
            gfx9[1] & IMG_DATA_FORMAT.mask(),
            IMG_DATA_FORMAT.place(FMASK_DATA_FORMAT_GFX9)
        );
        // Gfx9 moves the sample layout into the numeric format.
        assert_eq!(
            gfx9[1] & IMG_NUM_FORMAT.mask(),
            IMG_NUM_FORMAT.place(fmask_format_index(8, 4))
        );

        let gfx10 = encode_fmask_descriptor(GfxLevel::Gfx10, &state);
        assert_eq!(
            gfx10[1] & IMG_FORMAT_GFX10.mask(),
            IMG_FORMAT_GFX10.place(FMASK_FORMAT_GFX10_BASE + fmask_format_index(8, 4))
        );
    }

    #[test]
    fn fmask_address_includes_offset() {
        let state = state();
        let desc = encode_fmask_descriptor(GfxLevel::Gfx10, &state);
        assert_eq!(desc[0], ((0x1_0000_0000u64 + 0x20000) >> 8) as u32);
    }

    #[test]
    fn cmask_metadata_is_optional() {
        let mut state = state();
        let without = encode_fmask_descriptor(GfxLevel::Gfx10, &state);
        assert_eq!(without[6] & COMPRESSION_EN.mask(), 0);
        assert_eq!(without[7], 0);

        state.tc_compat_cmask = true;
        state.cmask_offset = 0x40000;
        let with = encode_fmask_descriptor(GfxLevel::Gfx10, &state);
        assert_ne!(with[6] & COMPRESSION_EN.mask(), 0);
        assert_ne!(with[7], 0);
    }
}
