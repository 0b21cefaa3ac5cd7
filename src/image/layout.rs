// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    tiling::{choose_tiling, sparse_tiling},
    Extent4D, ImageDim, ImageUsage, SampleLayout, Tiling,
};
use crate::{device::GfxLevel, format::Format, DeviceSize, NonExhaustive};
use smallvec::SmallVec;

/// The maximum number of mip levels an image can have.
pub const MAX_MIP_LEVELS: usize = 16;

/// The layout of one mip level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageLevel {
    /// Byte offset of the level within one array layer.
    pub offset_b: DeviceSize,
    /// The level's tiling; the base tiling clamped to the level's extent.
    pub tiling: Tiling,
    /// Byte stride between rows. Only meaningful for linear levels.
    pub row_stride_b: u32,
}

/// Parameters to compute an image layout.
#[derive(Clone, Debug)]
pub struct ImageCreateInfo {
    /// The dimensionality of the image.
    ///
    /// The default value is [`ImageDim::Dim2D`].
    pub dim: ImageDim,

    /// The format of the image.
    ///
    /// The default value is [`Format::R8G8B8A8Unorm`].
    pub format: Format,

    /// The extent of the base level, in pixels.
    ///
    /// The default value is `1x1x1`, one layer.
    pub extent_px: Extent4D,

    /// The number of mip levels.
    ///
    /// The default value is `1`.
    pub levels: u32,

    /// The number of samples per pixel.
    ///
    /// The default value is `1`.
    pub samples: u32,

    /// Usage flags influencing the layout.
    ///
    /// The default value is empty.
    pub usage: ImageUsage,

    pub _ne: NonExhaustive,
}

impl Default for ImageCreateInfo {
    #[inline]
    fn default() -> Self {
        ImageCreateInfo {
            dim: ImageDim::Dim2D,
            format: Format::R8G8B8A8Unorm,
            extent_px: Extent4D::new(1, 1, 1, 1),
            levels: 1,
            samples: 1,
            usage: ImageUsage::default(),
            _ne: NonExhaustive(()),
        }
    }
}

/// The complete layout of an image.
///
/// Computed once at creation time and immutable afterwards. Level offsets are
/// strictly monotonic and aligned to their level's tile size, so levels never
/// overlap.
#[derive(Clone, Debug)]
pub struct Image {
    dim: ImageDim,
    format: Format,
    extent_px: Extent4D,
    sample_layout: SampleLayout,
    num_levels: u32,
    levels: SmallVec<[ImageLevel; MAX_MIP_LEVELS]>,
    array_stride_b: DeviceSize,
    align_b: DeviceSize,
    size_b: DeviceSize,
    tile_mode: u16,
    page_kind: u8,
    mip_tail_first_lod: u32,
}

impl Image {
    /// Computes the layout of a new image.
    ///
    /// # Panics
    ///
    /// Invalid dimension/usage combinations are programming errors:
    ///
    /// - Panics if a 1D image has a non-unit height, depth or sample count.
    /// - Panics if a 2D image has a non-unit depth.
    /// - Panics if a 3D image has array layers or a non-unit sample count.
    /// - Panics if a linear image is not 2D, single-level, single-sample.
    /// - Panics if `levels` is 0 or greater than [`MAX_MIP_LEVELS`].
    pub fn new(gfx_level: GfxLevel, create_info: &ImageCreateInfo) -> Image {
        let ImageCreateInfo {
            dim,
            format,
            extent_px,
            levels,
            samples,
            usage,
            _ne: _,
        } = *create_info;

        assert!(levels >= 1 && levels as usize <= MAX_MIP_LEVELS);

        match dim {
            ImageDim::Dim1D => {
                assert!(extent_px.height == 1);
                assert!(extent_px.depth == 1);
                assert!(samples == 1);
            }
            ImageDim::Dim2D => {
                assert!(extent_px.depth == 1);
            }
            ImageDim::Dim3D => {
                assert!(extent_px.array_len == 1);
                assert!(samples == 1);
            }
        }

        let sample_layout = SampleLayout::from_samples(samples);

        let tiling = if usage.sparse_residency {
            sparse_tiling(format, dim)
        } else {
            choose_tiling(extent_px, format, sample_layout, usage)
        };

        let mut image = Image {
            dim,
            format,
            extent_px,
            sample_layout,
            num_levels: levels,
            levels: SmallVec::new(),
            array_stride_b: 0,
            align_b: 0,
            size_b: 0,
            tile_mode: 0,
            page_kind: 0,
            // Defaults to the level count ("no tail") and is clamped downward to
            // the first level whose tiling degrades.
            mip_tail_first_lod: levels,
        };

        let mut layer_size_b: DeviceSize = 0;
        for level in 0..levels {
            let lvl_ext_b = image.level_extent_b(level);
            if tiling.is_tiled {
                let lvl_tiling = tiling.clamp(lvl_ext_b);

                if tiling != lvl_tiling {
                    image.mip_tail_first_lod = u32::min(image.mip_tail_first_lod, level);
                }

                image.levels.push(ImageLevel {
                    offset_b: layer_size_b,
                    tiling: lvl_tiling,
                    row_stride_b: lvl_ext_b.align(lvl_tiling.extent_b()).width,
                });
            } else {
                // Linear images need to be 2D.
                assert!(dim == ImageDim::Dim2D);
                // Linear and mipmapping are incompatible.
                assert!(levels == 1);
                // So are linear and multisampling.
                assert!(sample_layout == SampleLayout::S1x1);

                image.levels.push(ImageLevel {
                    offset_b: layer_size_b,
                    tiling,
                    // Row stride needs to be aligned to 128B for render to work.
                    row_stride_b: crate::align_up_u32(lvl_ext_b.width, 128),
                });
            }
            layer_size_b += image.level_size_b(level);
        }

        // Use the level-0 tiling rather than the tiling selected above: with
        // sparse residency on small images, level 0 may have been clamped below
        // what we asked for, and the level-0 tiling is what gets programmed into
        // the hardware, so it is what array strides must be aligned to.
        let lvl0_tiling_size_b = image.levels[0].tiling.size_b() as DeviceSize;

        image.array_stride_b = crate::align_up(layer_size_b, lvl0_tiling_size_b);
        image.size_b = image.array_stride_b * extent_px.array_len as DeviceSize;
        image.align_b = lvl0_tiling_size_b;

        // Sparse binding requires 64 KiB alignment regardless of whether a 64 KiB
        // tile shape was actually selected.
        if usage.sparse_residency {
            image.align_b = DeviceSize::max(image.align_b, 1 << 16);
        }

        if image.levels[0].tiling.is_tiled {
            image.tile_mode = (image.levels[0].tiling.y_log2 as u16) << 4
                | (image.levels[0].tiling.z_log2 as u16) << 8;

            // Compression is never enabled yet.
            image.page_kind = choose_page_kind(gfx_level, format, samples, false);

            image.align_b = DeviceSize::max(image.align_b, 4096);
            if (0x0b..=0x0e).contains(&image.page_kind) {
                image.align_b = DeviceSize::max(image.align_b, 1 << 16);
            }
        } else {
            // Linear images need to be aligned to 128B for render to work.
            image.align_b = DeviceSize::max(image.align_b, 128);
        }

        image.size_b = crate::align_up(image.size_b, image.align_b);
        image
    }

    #[inline]
    pub fn dim(&self) -> ImageDim {
        self.dim
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    #[inline]
    pub fn extent_px(&self) -> Extent4D {
        self.extent_px
    }

    #[inline]
    pub fn sample_layout(&self) -> SampleLayout {
        self.sample_layout
    }

    #[inline]
    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    #[inline]
    pub fn levels(&self) -> &[ImageLevel] {
        &self.levels
    }

    /// Byte stride between array layers.
    #[inline]
    pub fn array_stride_b(&self) -> DeviceSize {
        self.array_stride_b
    }

    /// Required alignment of the allocation backing the image.
    #[inline]
    pub fn align_b(&self) -> DeviceSize {
        self.align_b
    }

    /// Total size of the allocation backing the image.
    #[inline]
    pub fn size_b(&self) -> DeviceSize {
        self.size_b
    }

    /// The tile-mode word programmed into image descriptors.
    #[inline]
    pub fn tile_mode(&self) -> u16 {
        self.tile_mode
    }

    /// The page-kind byte programmed into page tables for this image.
    #[inline]
    pub fn page_kind(&self) -> u8 {
        self.page_kind
    }

    /// The first level at which the tiling degrades from the base tiling.
    #[inline]
    pub fn mip_tail_first_lod(&self) -> u32 {
        self.mip_tail_first_lod
    }

    /// The extent of the given level in pixels.
    pub fn level_extent_px(&self, level: u32) -> Extent4D {
        assert!(level == 0 || self.sample_layout == SampleLayout::S1x1);

        self.extent_px.minify(level)
    }

    /// The extent of the given level in samples.
    pub fn level_extent_sa(&self, level: u32) -> Extent4D {
        self.level_extent_px(level).px_to_sa(self.sample_layout)
    }

    fn level_extent_b(&self, level: u32) -> Extent4D {
        self.level_extent_px(level)
            .px_to_b(self.format, self.sample_layout)
    }

    /// The size of one level within one array layer, in bytes.
    pub fn level_size_b(&self, level: u32) -> DeviceSize {
        assert!(level < self.num_levels);

        let mut lvl_ext_b = self.level_extent_b(level);
        let lvl_tiling = self.levels[level as usize].tiling;

        if lvl_tiling.is_tiled {
            lvl_ext_b = lvl_ext_b.align(lvl_tiling.extent_b());

            lvl_ext_b.width as DeviceSize
                * lvl_ext_b.height as DeviceSize
                * lvl_ext_b.depth as DeviceSize
        } else {
            assert!(lvl_ext_b.depth == 1);
            self.levels[level as usize].row_stride_b as DeviceSize * lvl_ext_b.height as DeviceSize
        }
    }

    /// Byte stride between z slices of the given level.
    pub fn level_depth_stride_b(&self, level: u32) -> DeviceSize {
        assert!(level < self.num_levels);

        let lvl_tiling = self.levels[level as usize].tiling;
        let lvl_ext_b = self.level_extent_b(level).align(lvl_tiling.extent_b());

        lvl_ext_b.width as DeviceSize * lvl_ext_b.height as DeviceSize
    }

    /// Offset of the given z slice within the level.
    pub fn level_z_offset_b(&self, level: u32, z: u32) -> DeviceSize {
        assert!(level < self.num_levels);
        let lvl_extent_px = self.level_extent_px(level);
        assert!(z < lvl_extent_px.depth);

        let lvl_tiling = self.levels[level as usize].tiling;

        let z_tl = z >> lvl_tiling.z_log2;
        let z_gob = z & ((1 << lvl_tiling.z_log2) - 1);

        let lvl_extent_tl =
            lvl_extent_px.px_to_tl(lvl_tiling, self.format, self.sample_layout);
        let mut offset_b = lvl_extent_tl.width as DeviceSize
            * lvl_extent_tl.height as DeviceSize
            * z_tl as DeviceSize
            * lvl_tiling.size_b() as DeviceSize;

        let tiling_extent_b = lvl_tiling.extent_b();
        offset_b += (tiling_extent_b.width * tiling_extent_b.height * z_gob) as DeviceSize;

        offset_b
    }

    /// Carves the given level out as a single-level image.
    ///
    /// Returns the level image together with its byte offset within `self`.
    pub fn level_image(&self, level: u32) -> (Image, DeviceSize) {
        assert!(level < self.num_levels);

        let lvl_extent_px = self.level_extent_px(level);
        let mut lvl = self.levels[level as usize];
        let align_b = lvl.tiling.size_b() as DeviceSize;

        let mut size_b = self.size_b - lvl.offset_b;
        if level + 1 < self.num_levels {
            // Levels are tightly packed in decreasing-alignment order, so the next
            // level's offset bounds this one.
            let next_lvl_offset_b = self.levels[level as usize + 1].offset_b;
            assert!(next_lvl_offset_b > lvl.offset_b);
            size_b -= next_lvl_offset_b - lvl.offset_b;
        }

        let offset_b = lvl.offset_b;
        lvl.offset_b = 0;

        let mut levels = SmallVec::new();
        levels.push(lvl);

        (
            Image {
                dim: self.dim,
                format: self.format,
                extent_px: lvl_extent_px,
                sample_layout: self.sample_layout,
                num_levels: 1,
                levels,
                array_stride_b: self.array_stride_b,
                align_b,
                size_b,
                tile_mode: self.tile_mode,
                page_kind: self.page_kind,
                mip_tail_first_lod: if level < self.mip_tail_first_lod { 1 } else { 0 },
            },
            offset_b,
        )
    }

    /// Returns a view of the given level with an uncompressed format of the same
    /// texel size, one element per pixel.
    pub fn level_as_uncompressed(&self, level: u32) -> (Image, DeviceSize) {
        assert!(self.sample_layout == SampleLayout::S1x1);

        // The exact format is arbitrary. Pick one with the right number of bits.
        let uc_format = format_for_bits(self.format.bits_per_block());

        let (lvl_image, offset_b) = self.level_image(level);

        let extent_el = lvl_image
            .extent_px
            .px_to_el(lvl_image.format, lvl_image.sample_layout);

        let mut uc_image = lvl_image;
        uc_image.format = uc_format;
        uc_image.extent_px = extent_el;
        (uc_image, offset_b)
    }

    /// Returns a view of one level of a 3D image as a 2D array image, one layer
    /// per z slice.
    pub fn level_3d_as_2d_array(&self, level: u32) -> (Image, DeviceSize) {
        assert!(self.dim == ImageDim::Dim3D);
        assert!(self.extent_px.array_len == 1);
        assert!(self.sample_layout == SampleLayout::S1x1);

        let (lvl_image, offset_b) = self.level_image(level);

        assert!(lvl_image.num_levels == 1);
        assert!(
            !lvl_image.levels[0].tiling.is_tiled || lvl_image.levels[0].tiling.z_log2 == 0
        );

        let z_stride = lvl_image.level_depth_stride_b(0);

        let mut image_2d = lvl_image;
        image_2d.dim = ImageDim::Dim2D;
        image_2d.extent_px.array_len = image_2d.extent_px.depth;
        image_2d.extent_px.depth = 1;
        image_2d.array_stride_b = z_stride;
        (image_2d, offset_b)
    }

    /// For a multisampled image, returns the equivalent supersampled
    /// single-sample image: each pixel of the original covers a grid of pixels
    /// according to its sample layout.
    pub fn msaa_as_samples(&self) -> Image {
        assert!(self.dim == ImageDim::Dim2D);
        assert!(self.num_levels == 1);

        let extent_sa = self.extent_px.px_to_sa(self.sample_layout);

        let mut image_sa = self.clone();
        image_sa.extent_px = extent_sa;
        image_sa.sample_layout = SampleLayout::S1x1;
        image_sa
    }
}

fn format_for_bits(bits: u32) -> Format {
    match bits {
        32 => Format::R32Uint,
        64 => Format::R32G32Uint,
        128 => Format::R32G32B32A32Uint,
        _ => unreachable!("no uncompressed format with this size"),
    }
}

/// Chooses the page-table kind for a tiled image.
///
/// The two bands mirror the two MMU generations: newer parts collapsed the
/// per-sample-count kinds into a handful of compression-class kinds.
fn choose_page_kind(gfx_level: GfxLevel, format: Format, samples: u32, compressed: bool) -> u8 {
    if gfx_level >= GfxLevel::Gfx11 {
        match format {
            Format::Z16Unorm => {
                if compressed {
                    0x0b
                } else {
                    0x01
                }
            }
            Format::Z24S8Unorm => {
                if compressed {
                    0x0c
                } else {
                    0x03
                }
            }
            Format::Z32FloatS8Uint => {
                if compressed {
                    0x0d
                } else {
                    0x04
                }
            }
            Format::Z32Float => 0x06,
            _ => 0,
        }
    } else {
        let ms = samples.trailing_zeros() as u8;

        match format {
            Format::Z16Unorm => {
                if compressed {
                    0x02 + ms
                } else {
                    0x01
                }
            }
            Format::Z24S8Unorm => {
                if compressed {
                    0x17 + ms
                } else {
                    0x11
                }
            }
            Format::Z32Float => {
                if compressed {
                    0x86 + ms
                } else {
                    0x7b
                }
            }
            Format::Z32FloatS8Uint => {
                if compressed {
                    0xce + ms
                } else {
                    0xc3
                }
            }
            _ => match format.bits_per_block() {
                128 => {
                    if compressed {
                        0xf4 + ms * 2
                    } else {
                        0xfe
                    }
                }
                64 => {
                    if compressed {
                        match samples {
                            1 => 0xe6,
                            2 => 0xeb,
                            4 => 0xed,
                            8 => 0xf2,
                            _ => 0,
                        }
                    } else {
                        0xfe
                    }
                }
                32 => {
                    if compressed && ms > 0 {
                        match samples {
                            2 => 0xdd,
                            4 => 0xdf,
                            8 => 0xe4,
                            _ => 0,
                        }
                    } else {
                        0xfe
                    }
                }
                16 | 8 => 0xfe,
                _ => 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::GOB_WIDTH_B;

    fn image_2d(
        format: Format,
        width: u32,
        height: u32,
        levels: u32,
        usage: ImageUsage,
    ) -> Image {
        Image::new(
            GfxLevel::Gfx11,
            &ImageCreateInfo {
                format,
                extent_px: Extent4D::new(width, height, 1, 1),
                levels,
                usage,
                ..Default::default()
            },
        )
    }

    #[test]
    fn level_offsets_are_monotonic_and_non_overlapping() {
        let image = image_2d(
            Format::R8G8B8A8Unorm,
            1024,
            600,
            8,
            ImageUsage::default(),
        );

        for level in 0..7 {
            let this = image.levels()[level as usize];
            let next = image.levels()[level as usize + 1];
            assert!(
                next.offset_b >= this.offset_b + image.level_size_b(level),
                "level {} overlaps level {}",
                level,
                level + 1
            );
            // Offsets are aligned to the level's tile size.
            assert_eq!(
                this.offset_b % this.tiling.size_b() as u64,
                0,
                "level {} misaligned",
                level
            );
        }
    }

    #[test]
    fn mip_tail_starts_where_tiling_degrades() {
        let image = image_2d(
            Format::R8G8B8A8Unorm,
            2048,
            2048,
            10,
            ImageUsage::default(),
        );

        let base = image.levels()[0].tiling;
        let tail = image.mip_tail_first_lod();
        for (level, lvl) in image.levels().iter().enumerate() {
            if (level as u32) < tail {
                assert_eq!(lvl.tiling, base);
            }
        }
        assert!(tail < image.num_levels());
        assert_ne!(image.levels()[tail as usize].tiling, base);
    }

    #[test]
    fn small_sparse_image_is_64k_aligned() {
        let image = image_2d(
            Format::R8G8B8A8Unorm,
            4,
            4,
            1,
            ImageUsage {
                sparse_residency: true,
                ..Default::default()
            },
        );

        assert!(image.align_b() >= 65536);
        assert_eq!(image.size_b() % 65536, 0);
        assert!(image.size_b() >= 65536);
    }

    #[test]
    fn linear_row_stride_is_128b_aligned() {
        let image = image_2d(
            Format::R8G8B8A8Unorm,
            33,
            10,
            1,
            ImageUsage {
                linear: true,
                ..Default::default()
            },
        );

        // 33 px * 4 B = 132 B, aligned up to 256.
        assert_eq!(image.levels()[0].row_stride_b, 256);
        assert_eq!(image.level_size_b(0), 256 * 10);
        assert_eq!(image.align_b(), 128);
    }

    #[test]
    #[should_panic]
    fn linear_mipmapping_is_rejected() {
        let _ = image_2d(
            Format::R8G8B8A8Unorm,
            64,
            64,
            2,
            ImageUsage {
                linear: true,
                ..Default::default()
            },
        );
    }

    #[test]
    #[should_panic]
    fn multisampled_3d_is_rejected() {
        let _ = Image::new(
            GfxLevel::Gfx11,
            &ImageCreateInfo {
                dim: ImageDim::Dim3D,
                extent_px: Extent4D::new(16, 16, 16, 1),
                samples: 4,
                ..Default::default()
            },
        );
    }

    #[test]
    fn array_stride_is_tile_aligned() {
        let image = Image::new(
            GfxLevel::Gfx11,
            &ImageCreateInfo {
                format: Format::R8G8B8A8Unorm,
                extent_px: Extent4D::new(100, 100, 1, 7),
                levels: 5,
                ..Default::default()
            },
        );

        let lvl0_tile = image.levels()[0].tiling.size_b() as u64;
        assert_eq!(image.array_stride_b() % lvl0_tile, 0);
        assert_eq!(image.size_b() % image.align_b(), 0);
        assert!(image.size_b() >= image.array_stride_b() * 7);
    }

    #[test]
    fn level_image_matches_parent_layout() {
        let image = image_2d(
            Format::R8G8B8A8Unorm,
            512,
            512,
            6,
            ImageUsage::default(),
        );

        let (lvl_image, offset_b) = image.level_image(2);
        assert_eq!(offset_b, image.levels()[2].offset_b);
        assert_eq!(lvl_image.num_levels(), 1);
        assert_eq!(lvl_image.extent_px(), image.extent_px().minify(2));
        assert_eq!(lvl_image.levels()[0].offset_b, 0);
        assert_eq!(lvl_image.levels()[0].tiling, image.levels()[2].tiling);
    }

    #[test]
    fn msaa_as_samples_is_supersampled() {
        let image = Image::new(
            GfxLevel::Gfx11,
            &ImageCreateInfo {
                format: Format::R8G8B8A8Unorm,
                extent_px: Extent4D::new(32, 32, 1, 1),
                samples: 4,
                ..Default::default()
            },
        );

        let sa = image.msaa_as_samples();
        assert_eq!(sa.sample_layout(), SampleLayout::S1x1);
        assert_eq!(sa.extent_px(), Extent4D::new(64, 64, 1, 1));
    }

    #[test]
    fn uncompressed_view_covers_blocks() {
        let image = image_2d(Format::Bc3RgbaUnorm, 64, 64, 1, ImageUsage::default());

        let (uc, _) = image.level_as_uncompressed(0);
        assert_eq!(uc.format(), Format::R32G32B32A32Uint);
        assert_eq!(uc.extent_px(), Extent4D::new(16, 16, 1, 1));
    }

    #[test]
    fn z_offsets_advance_by_gob_planes() {
        let image = Image::new(
            GfxLevel::Gfx11,
            &ImageCreateInfo {
                dim: ImageDim::Dim3D,
                format: Format::R8Unorm,
                extent_px: Extent4D::new(64, 64, 8, 1),
                ..Default::default()
            },
        );

        assert_eq!(image.level_z_offset_b(0, 0), 0);
        let tiling = image.levels()[0].tiling;
        // Within one tile, consecutive z slices advance by one GOB plane.
        assert_eq!(
            image.level_z_offset_b(0, 1),
            (GOB_WIDTH_B << tiling.x_log2) as u64 * (8u64 << tiling.y_log2)
        );
    }
}
