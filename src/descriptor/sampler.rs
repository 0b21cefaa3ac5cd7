// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{bits, signed_fixed, unsigned_fixed, BitField};
use crate::device::GfxLevel;

/// How out-of-range texture coordinates are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AddressMode {
    Wrap = 0,
    Mirror = 1,
    ClampToEdge = 2,
    MirrorClampToEdge = 3,
    ClampToBorder = 6,
}

/// Comparison operator for depth-compare samplers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CompareFunc {
    Never = 0,
    Less = 1,
    Equal = 2,
    LessOrEqual = 3,
    Greater = 4,
    NotEqual = 5,
    GreaterOrEqual = 6,
    Always = 7,
}

/// How samples are combined across a filter footprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FilterMode {
    /// Weighted average.
    Blend = 0,
    Min = 1,
    Max = 2,
}

/// Magnification/minification filter within one mipmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Filter {
    Point = 0,
    Linear = 1,
}

/// Filter between mipmaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MipFilter {
    None = 0,
    Point = 1,
    Linear = 2,
}

/// Border color selection for the clamp-to-border address modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BorderColor {
    TransparentBlack = 0,
    OpaqueBlack = 1,
    OpaqueWhite = 2,
    /// Fetched from the border-color table at [`SamplerState::border_color_ptr`].
    Custom = 3,
}

/// The state a sampler descriptor is encoded from.
///
/// Plain bounded-width fields; the encoder quantizes the floating-point LOD
/// fields to the generation's fixed-point ranges.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerState {
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    /// log2 of the maximum anisotropy ratio, `0..=4`. 0 disables anisotropy.
    pub max_aniso_ratio: u32,
    pub depth_compare_func: CompareFunc,
    pub unnormalized_coords: bool,
    pub cube_wrap: bool,
    pub trunc_coord: bool,
    pub filter_mode: FilterMode,
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: MipFilter,
    /// Sample only the base level when anisotropic filtering is enabled.
    pub aniso_single_level: bool,
    pub border_color_type: BorderColor,
    /// Index into the border-color table; used with [`BorderColor::Custom`].
    pub border_color_ptr: u32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub lod_bias: f32,
}

impl Default for SamplerState {
    #[inline]
    fn default() -> Self {
        SamplerState {
            address_mode_u: AddressMode::Wrap,
            address_mode_v: AddressMode::Wrap,
            address_mode_w: AddressMode::Wrap,
            max_aniso_ratio: 0,
            depth_compare_func: CompareFunc::Never,
            unnormalized_coords: false,
            cube_wrap: true,
            trunc_coord: false,
            filter_mode: FilterMode::Blend,
            mag_filter: Filter::Point,
            min_filter: Filter::Point,
            mip_filter: MipFilter::None,
            aniso_single_level: false,
            border_color_type: BorderColor::TransparentBlack,
            border_color_ptr: 0,
            min_lod: 0.0,
            max_lod: 0.0,
            lod_bias: 0.0,
        }
    }
}

// Word 0, identical across generations.
pub(crate) const CLAMP_X: BitField = bits(0, 3);
pub(crate) const CLAMP_Y: BitField = bits(3, 3);
pub(crate) const CLAMP_Z: BitField = bits(6, 3);
pub(crate) const MAX_ANISO_RATIO: BitField = bits(9, 3);
pub(crate) const DEPTH_COMPARE_FUNC: BitField = bits(12, 3);
pub(crate) const FORCE_UNNORMALIZED: BitField = bits(15, 1);
pub(crate) const ANISO_THRESHOLD: BitField = bits(16, 3);
pub(crate) const ANISO_BIAS: BitField = bits(19, 6);
pub(crate) const DISABLE_CUBE_WRAP: BitField = bits(25, 1);
pub(crate) const COMPAT_MODE: BitField = bits(26, 1);
pub(crate) const FILTER_MODE: BitField = bits(27, 2);
pub(crate) const TRUNC_COORD: BitField = bits(29, 1);

// Word 1. The LOD clamp fields widened from 12 to 13 bits at Gfx12, pushing
// PERF_MIP out into words 2 and 3.
pub(crate) const MIN_LOD: BitField = bits(0, 12);
pub(crate) const MAX_LOD: BitField = bits(12, 12);
pub(crate) const PERF_MIP: BitField = bits(24, 4);
pub(crate) const MIN_LOD_GFX12: BitField = bits(0, 13);
pub(crate) const MAX_LOD_GFX12: BitField = bits(13, 13);

// Word 2.
pub(crate) const LOD_BIAS: BitField = bits(0, 14);
pub(crate) const PERF_MIP_LO_GFX12: BitField = bits(14, 2);
pub(crate) const XY_MAG_FILTER: BitField = bits(20, 2);
pub(crate) const XY_MIN_FILTER: BitField = bits(22, 2);
pub(crate) const MIP_FILTER: BitField = bits(26, 2);
pub(crate) const DISABLE_LSB_CEIL: BitField = bits(28, 1);
pub(crate) const FILTER_PREC_FIX: BitField = bits(29, 1);
pub(crate) const ANISO_OVERRIDE_GFX8: BitField = bits(30, 1);
pub(crate) const ANISO_OVERRIDE_GFX10: BitField = bits(31, 1);

// Word 3.
pub(crate) const BORDER_COLOR_PTR_GFX6: BitField = bits(0, 12);
pub(crate) const BORDER_COLOR_PTR_GFX11: BitField = bits(0, 16);
pub(crate) const PERF_MIP_HI_GFX12: BitField = bits(20, 2);
pub(crate) const BORDER_COLOR_TYPE: BitField = bits(30, 2);

/// Encodes a sampler descriptor for the given generation.
///
/// The dispatch is an ordered `>=` cascade from the newest band to the oldest;
/// callers must not rely on any band being the default.
pub fn encode_sampler_descriptor(gfx_level: GfxLevel, state: &SamplerState) -> [u32; 4] {
    type BandFn = fn(GfxLevel, &SamplerState) -> [u32; 4];

    const BANDS: &[(GfxLevel, BandFn)] = &[
        (GfxLevel::Gfx12, encode_gfx12),
        (GfxLevel::Gfx11, encode_gfx11),
        (GfxLevel::Gfx10, encode_gfx10),
        (GfxLevel::Gfx8, encode_gfx8),
    ];

    for &(min_level, band) in BANDS {
        if gfx_level >= min_level {
            return band(gfx_level, state);
        }
    }

    unreachable!("no sampler encoder band for {:?}", gfx_level);
}

fn perf_mip(state: &SamplerState) -> u32 {
    if state.max_aniso_ratio != 0 {
        state.max_aniso_ratio + 6
    } else {
        0
    }
}

/// The generation-independent parts: word 0 and the filter fields of word 2.
fn encode_common(gfx_level: GfxLevel, state: &SamplerState) -> [u32; 4] {
    let compat_mode = gfx_level == GfxLevel::Gfx8 || gfx_level == GfxLevel::Gfx9;

    let word0 = CLAMP_X.place(state.address_mode_u as u32)
        | CLAMP_Y.place(state.address_mode_v as u32)
        | CLAMP_Z.place(state.address_mode_w as u32)
        | MAX_ANISO_RATIO.place(state.max_aniso_ratio)
        | DEPTH_COMPARE_FUNC.place(state.depth_compare_func as u32)
        | FORCE_UNNORMALIZED.place_bool(state.unnormalized_coords)
        | ANISO_THRESHOLD.place(state.max_aniso_ratio >> 1)
        | ANISO_BIAS.place(state.max_aniso_ratio)
        | DISABLE_CUBE_WRAP.place_bool(!state.cube_wrap)
        | COMPAT_MODE.place_bool(compat_mode)
        | FILTER_MODE.place(state.filter_mode as u32)
        | TRUNC_COORD.place_bool(state.trunc_coord);

    let word2 = XY_MAG_FILTER.place(state.mag_filter as u32)
        | XY_MIN_FILTER.place(state.min_filter as u32)
        | MIP_FILTER.place(state.mip_filter as u32);

    let word3 = BORDER_COLOR_TYPE.place(state.border_color_type as u32);

    [word0, 0, word2, word3]
}

fn lod_fixed(value: f32, max: f32) -> u32 {
    unsigned_fixed(value.clamp(0.0, max), 8)
}

fn lod_bias_fixed(value: f32, min: f32, max: f32) -> i32 {
    signed_fixed(value.clamp(min, max), 8)
}

fn encode_gfx8(gfx_level: GfxLevel, state: &SamplerState) -> [u32; 4] {
    let mut desc = encode_common(gfx_level, state);

    desc[1] |= MIN_LOD.place(lod_fixed(state.min_lod, 15.0))
        | MAX_LOD.place(lod_fixed(state.max_lod, 15.0))
        | PERF_MIP.place(perf_mip(state));

    desc[2] |= LOD_BIAS.place_signed(lod_bias_fixed(state.lod_bias, -16.0, 16.0))
        | DISABLE_LSB_CEIL.place_bool(gfx_level <= GfxLevel::Gfx8)
        | FILTER_PREC_FIX.place(1)
        | ANISO_OVERRIDE_GFX8
            .place_bool(gfx_level >= GfxLevel::Gfx8 && !state.aniso_single_level);

    desc[3] |= BORDER_COLOR_PTR_GFX6.place(state.border_color_ptr);

    desc
}

fn encode_gfx10(gfx_level: GfxLevel, state: &SamplerState) -> [u32; 4] {
    let mut desc = encode_common(gfx_level, state);

    desc[1] |= MIN_LOD.place(lod_fixed(state.min_lod, 15.0))
        | MAX_LOD.place(lod_fixed(state.max_lod, 15.0))
        | PERF_MIP.place(perf_mip(state));

    desc[2] |= LOD_BIAS.place_signed(lod_bias_fixed(state.lod_bias, -32.0, 31.0))
        | ANISO_OVERRIDE_GFX10.place_bool(!state.aniso_single_level);

    desc[3] |= BORDER_COLOR_PTR_GFX6.place(state.border_color_ptr);

    desc
}

fn encode_gfx11(gfx_level: GfxLevel, state: &SamplerState) -> [u32; 4] {
    let mut desc = encode_common(gfx_level, state);

    desc[1] |= MIN_LOD.place(lod_fixed(state.min_lod, 15.0))
        | MAX_LOD.place(lod_fixed(state.max_lod, 15.0))
        | PERF_MIP.place(perf_mip(state));

    desc[2] |= LOD_BIAS.place_signed(lod_bias_fixed(state.lod_bias, -32.0, 31.0))
        | ANISO_OVERRIDE_GFX10.place_bool(!state.aniso_single_level);

    desc[3] |= BORDER_COLOR_PTR_GFX11.place(state.border_color_ptr);

    desc
}

fn encode_gfx12(gfx_level: GfxLevel, state: &SamplerState) -> [u32; 4] {
    let mut desc = encode_common(gfx_level, state);
    let perf_mip = perf_mip(state);

    desc[1] |= MIN_LOD_GFX12.place(lod_fixed(state.min_lod, 17.0))
        | MAX_LOD_GFX12.place(lod_fixed(state.max_lod, 17.0));

    desc[2] |= LOD_BIAS.place_signed(lod_bias_fixed(state.lod_bias, -32.0, 31.0))
        | PERF_MIP_LO_GFX12.place(perf_mip & 0x3)
        | ANISO_OVERRIDE_GFX10.place_bool(!state.aniso_single_level);

    desc[3] |= BORDER_COLOR_PTR_GFX11.place(state.border_color_ptr)
        | PERF_MIP_HI_GFX12.place(perf_mip >> 2);

    desc
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_LEVELS: [GfxLevel; 6] = [
        GfxLevel::Gfx8,
        GfxLevel::Gfx9,
        GfxLevel::Gfx10,
        GfxLevel::Gfx10_3,
        GfxLevel::Gfx11,
        GfxLevel::Gfx12,
    ];

    /// A state with every bounded field at its maximum.
    fn saturated_state() -> SamplerState {
        SamplerState {
            address_mode_u: AddressMode::ClampToBorder,
            address_mode_v: AddressMode::ClampToBorder,
            address_mode_w: AddressMode::ClampToBorder,
            max_aniso_ratio: 4,
            depth_compare_func: CompareFunc::Always,
            unnormalized_coords: true,
            cube_wrap: false,
            trunc_coord: true,
            filter_mode: FilterMode::Max,
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mip_filter: MipFilter::Linear,
            aniso_single_level: false,
            border_color_type: BorderColor::Custom,
            border_color_ptr: 0xfff,
            min_lod: 1000.0,
            max_lod: 1000.0,
            lod_bias: 1000.0,
        }
    }

    /// The bits a generation band is allowed to produce.
    fn defined_mask(gfx_level: GfxLevel) -> [u32; 4] {
        let word0 = CLAMP_X.mask()
            | CLAMP_Y.mask()
            | CLAMP_Z.mask()
            | MAX_ANISO_RATIO.mask()
            | DEPTH_COMPARE_FUNC.mask()
            | FORCE_UNNORMALIZED.mask()
            | ANISO_THRESHOLD.mask()
            | ANISO_BIAS.mask()
            | DISABLE_CUBE_WRAP.mask()
            | COMPAT_MODE.mask()
            | FILTER_MODE.mask()
            | TRUNC_COORD.mask();

        let word1 = if gfx_level >= GfxLevel::Gfx12 {
            MIN_LOD_GFX12.mask() | MAX_LOD_GFX12.mask()
        } else {
            MIN_LOD.mask() | MAX_LOD.mask() | PERF_MIP.mask()
        };

        let mut word2 =
            LOD_BIAS.mask() | XY_MAG_FILTER.mask() | XY_MIN_FILTER.mask() | MIP_FILTER.mask();
        if gfx_level >= GfxLevel::Gfx12 {
            word2 |= PERF_MIP_LO_GFX12.mask() | ANISO_OVERRIDE_GFX10.mask();
        } else if gfx_level >= GfxLevel::Gfx10 {
            word2 |= ANISO_OVERRIDE_GFX10.mask();
        } else {
            word2 |= DISABLE_LSB_CEIL.mask() | FILTER_PREC_FIX.mask() | ANISO_OVERRIDE_GFX8.mask();
        }

        let mut word3 = BORDER_COLOR_TYPE.mask();
        if gfx_level >= GfxLevel::Gfx12 {
            word3 |= BORDER_COLOR_PTR_GFX11.mask() | PERF_MIP_HI_GFX12.mask();
        } else if gfx_level >= GfxLevel::Gfx11 {
            word3 |= BORDER_COLOR_PTR_GFX11.mask();
        } else {
            word3 |= BORDER_COLOR_PTR_GFX6.mask();
        }

        [word0, word1, word2, word3]
    }

    #[test]
    fn every_bit_is_accounted_for() {
        for gfx_level in ALL_LEVELS {
            let zero = encode_sampler_descriptor(gfx_level, &SamplerState::default());
            let ones = encode_sampler_descriptor(gfx_level, &saturated_state());
            let mask = defined_mask(gfx_level);

            for word in 0..4 {
                assert_eq!(
                    (zero[word] | ones[word]) & !mask[word],
                    0,
                    "{:?} word {} has bits outside the defined mask",
                    gfx_level,
                    word
                );
            }
        }
    }

    #[test]
    fn lod_clamps_per_generation() {
        let state = SamplerState {
            min_lod: 100.0,
            max_lod: 100.0,
            ..Default::default()
        };

        // Pre-Gfx12 clamps to [0, 15] in 8-bit-fraction fixed point.
        let desc = encode_sampler_descriptor(GfxLevel::Gfx11, &state);
        assert_eq!(desc[1] & MIN_LOD.mask(), MIN_LOD.place(15 << 8));
        assert_eq!(desc[1] & MAX_LOD.mask(), MAX_LOD.place(15 << 8));

        // Gfx12 widens the clamp to [0, 17].
        let desc = encode_sampler_descriptor(GfxLevel::Gfx12, &state);
        assert_eq!(desc[1] & MIN_LOD_GFX12.mask(), MIN_LOD_GFX12.place(17 << 8));
        assert_eq!(desc[1] & MAX_LOD_GFX12.mask(), MAX_LOD_GFX12.place(17 << 8));
    }

    #[test]
    fn lod_bias_clamps_per_generation() {
        let state = SamplerState {
            lod_bias: -100.0,
            ..Default::default()
        };

        // Pre-Gfx10 clamps the bias to [-16, 16].
        let desc = encode_sampler_descriptor(GfxLevel::Gfx9, &state);
        assert_eq!(
            desc[2] & LOD_BIAS.mask(),
            LOD_BIAS.place_signed(-16 << 8)
        );

        // Gfx10 widened it to [-32, 31].
        let desc = encode_sampler_descriptor(GfxLevel::Gfx10, &state);
        assert_eq!(
            desc[2] & LOD_BIAS.mask(),
            LOD_BIAS.place_signed(-32 << 8)
        );
    }

    #[test]
    fn compat_mode_is_gfx8_and_gfx9_only() {
        let state = SamplerState::default();

        for gfx_level in ALL_LEVELS {
            let desc = encode_sampler_descriptor(gfx_level, &state);
            let expected = matches!(gfx_level, GfxLevel::Gfx8 | GfxLevel::Gfx9);
            assert_eq!(
                desc[0] & COMPAT_MODE.mask() != 0,
                expected,
                "{:?}",
                gfx_level
            );
        }
    }

    #[test]
    fn perf_mip_splits_at_gfx12() {
        let state = SamplerState {
            max_aniso_ratio: 4,
            ..Default::default()
        };
        // perf_mip = 4 + 6 = 10 = 0b1010.
        let desc = encode_sampler_descriptor(GfxLevel::Gfx11, &state);
        assert_eq!(desc[1] & PERF_MIP.mask(), PERF_MIP.place(10));

        let desc = encode_sampler_descriptor(GfxLevel::Gfx12, &state);
        assert_eq!(
            desc[2] & PERF_MIP_LO_GFX12.mask(),
            PERF_MIP_LO_GFX12.place(0b10)
        );
        assert_eq!(
            desc[3] & PERF_MIP_HI_GFX12.mask(),
            PERF_MIP_HI_GFX12.place(0b10)
        );
    }

    #[test]
    fn gfx10_3_shares_the_gfx10_band() {
        let state = saturated_state();
        assert_eq!(
            encode_sampler_descriptor(GfxLevel::Gfx10, &state),
            encode_sampler_descriptor(GfxLevel::Gfx10_3, &state)
        );
    }
}
