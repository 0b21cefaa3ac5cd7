// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{bits, map_swizzle, BitField, ChannelSelect, IDENTITY_SWIZZLE};
use crate::{
    device::GfxLevel,
    format::{buffer_data_format, buffer_num_format, unified_img_format, Format},
};

/// Which out-of-bounds check the buffer unit applies.
///
/// - [`Structured`](OobSelect::Structured): `index >= num_records`, or the offset
///   exceeds the stride.
/// - [`Index`](OobSelect::Index): `index >= num_records` only.
/// - [`NumRecords`](OobSelect::NumRecords): out of bounds iff `num_records == 0`.
/// - [`Raw`](OobSelect::Raw): the byte offset is checked against `num_records`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum OobSelect {
    Structured = 0,
    Index = 1,
    NumRecords = 2,
    Raw = 3,
}

/// The state a buffer-view descriptor is encoded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferState {
    /// GPU virtual address of the first record.
    pub va: u64,
    /// Number of records.
    pub size: u32,
    /// Byte stride between records; 0 for raw buffers.
    pub stride: u32,
    pub format: Format,
    pub swizzle: [ChannelSelect; 4],
    /// Non-zero enables address swizzling; at Gfx11+ the value encodes the
    /// element-size class.
    pub swizzle_enable: u32,
    pub index_stride: u32,
    /// Adds the thread id to the address computation.
    pub add_tid: bool,
    /// Element-size class; only encoded below Gfx10.
    pub element_size: u32,
    /// Out-of-bounds check select; only encoded at Gfx10 and above.
    pub oob_select: OobSelect,
}

impl Default for BufferState {
    #[inline]
    fn default() -> Self {
        BufferState {
            va: 0,
            size: 0,
            stride: 0,
            format: Format::R32Float,
            swizzle: IDENTITY_SWIZZLE,
            swizzle_enable: 0,
            index_stride: 0,
            add_tid: false,
            element_size: 0,
            oob_select: OobSelect::Structured,
        }
    }
}

// Word 1.
pub(crate) const BASE_ADDRESS_HI: BitField = bits(0, 16);
pub(crate) const STRIDE: BitField = bits(16, 14);
pub(crate) const SWIZZLE_ENABLE_GFX6: BitField = bits(31, 1);
pub(crate) const SWIZZLE_ENABLE_GFX11: BitField = bits(30, 2);

// Word 3.
pub(crate) const DST_SEL_X: BitField = bits(0, 3);
pub(crate) const DST_SEL_Y: BitField = bits(3, 3);
pub(crate) const DST_SEL_Z: BitField = bits(6, 3);
pub(crate) const DST_SEL_W: BitField = bits(9, 3);
pub(crate) const NUM_FORMAT: BitField = bits(12, 3);
pub(crate) const DATA_FORMAT: BitField = bits(15, 4);
pub(crate) const ELEMENT_SIZE: BitField = bits(19, 2);
pub(crate) const FORMAT_GFX10: BitField = bits(12, 7);
pub(crate) const FORMAT_GFX12: BitField = bits(12, 8);
pub(crate) const INDEX_STRIDE: BitField = bits(21, 2);
pub(crate) const ADD_TID_ENABLE: BitField = bits(23, 1);
pub(crate) const RESOURCE_LEVEL: BitField = bits(24, 1);
pub(crate) const OOB_SELECT: BitField = bits(28, 2);

/// Encodes a buffer-view descriptor for the given generation.
pub fn encode_buffer_descriptor(gfx_level: GfxLevel, state: &BufferState) -> [u32; 4] {
    type BandFn = fn(&BufferState) -> (u32, u32);

    const BANDS: &[(GfxLevel, BandFn)] = &[
        (GfxLevel::Gfx12, encode_gfx12),
        (GfxLevel::Gfx11, encode_gfx11),
        (GfxLevel::Gfx10, encode_gfx10),
        (GfxLevel::Gfx8, encode_gfx8),
    ];

    let (word1_band, word3_band) = 'band: {
        for &(min_level, band) in BANDS {
            if gfx_level >= min_level {
                break 'band band(state);
            }
        }
        unreachable!("no buffer encoder band for {:?}", gfx_level);
    };

    let word1 = BASE_ADDRESS_HI.place(((state.va >> 32) as u32) & BASE_ADDRESS_HI.max())
        | STRIDE.place(state.stride)
        | word1_band;

    let word3 = DST_SEL_X.place(map_swizzle(state.swizzle[0]))
        | DST_SEL_Y.place(map_swizzle(state.swizzle[1]))
        | DST_SEL_Z.place(map_swizzle(state.swizzle[2]))
        | DST_SEL_W.place(map_swizzle(state.swizzle[3]))
        | INDEX_STRIDE.place(state.index_stride)
        | ADD_TID_ENABLE.place_bool(state.add_tid)
        | word3_band;

    [state.va as u32, word1, state.size, word3]
}

fn encode_gfx8(state: &BufferState) -> (u32, u32) {
    let num_format = buffer_num_format(state.format);

    // DATA_FORMAT aliases the stride MSBs when ADD_TID_ENABLE is set.
    let data_format = if state.add_tid {
        0
    } else {
        buffer_data_format(state.format)
    };

    (
        SWIZZLE_ENABLE_GFX6.place_bool(state.swizzle_enable != 0),
        NUM_FORMAT.place(num_format)
            | DATA_FORMAT.place(data_format)
            | ELEMENT_SIZE.place(state.element_size),
    )
}

fn encode_gfx10(state: &BufferState) -> (u32, u32) {
    (
        SWIZZLE_ENABLE_GFX6.place_bool(state.swizzle_enable != 0),
        FORMAT_GFX10.place(unified_img_format(state.format))
            | OOB_SELECT.place(state.oob_select as u32)
            | RESOURCE_LEVEL.place(1),
    )
}

fn encode_gfx11(state: &BufferState) -> (u32, u32) {
    (
        SWIZZLE_ENABLE_GFX11.place(state.swizzle_enable),
        FORMAT_GFX10.place(unified_img_format(state.format))
            | OOB_SELECT.place(state.oob_select as u32),
    )
}

fn encode_gfx12(state: &BufferState) -> (u32, u32) {
    (
        SWIZZLE_ENABLE_GFX11.place(state.swizzle_enable),
        FORMAT_GFX12.place(unified_img_format(state.format))
            | OOB_SELECT.place(state.oob_select as u32),
    )
}

/// Encodes the descriptor for a raw byte-addressed buffer.
///
/// This is exactly the general encoder applied to an `R32Float` view with the
/// identity swizzle and the raw out-of-bounds check.
pub fn encode_raw_buffer_descriptor(gfx_level: GfxLevel, va: u64, size: u32) -> [u32; 4] {
    let state = BufferState {
        va,
        size,
        format: Format::R32Float,
        swizzle: IDENTITY_SWIZZLE,
        oob_select: OobSelect::Raw,
        ..Default::default()
    };

    encode_buffer_descriptor(gfx_level, &state)
}

/// Encodes the descriptor for the attribute ring buffer.
///
/// # Panics
///
/// - Panics if `gfx_level` is below [`GfxLevel::Gfx11`]; older generations have
///   no attribute ring.
pub fn encode_attr_ring_descriptor(gfx_level: GfxLevel, va: u64, size: u32) -> [u32; 4] {
    assert!(gfx_level >= GfxLevel::Gfx11);

    let state = BufferState {
        va,
        size,
        format: Format::R32G32B32A32Float,
        swizzle: IDENTITY_SWIZZLE,
        oob_select: OobSelect::Structured,
        swizzle_enable: 3, // 16B elements
        index_stride: 2,   // 32 elements
        ..Default::default()
    };

    encode_buffer_descriptor(gfx_level, &state)
}
