use image::{ImageEncoder as _, RgbaImage, imageops::FilterType};

use crate::{
    compute::backend::FrameRGBA,
    foundation::{
        config::WorkerConfig,
        error::{WorkerError, WorkerResult},
    },
};

/// Face layout of a texture resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Planar,
    Cube,
}

impl Topology {
    pub fn faces(self) -> u32 {
        match self {
            Self::Planar => 1,
            Self::Cube => 6,
        }
    }
}

/// Decoded image with its mip chain, ready to upload to a compute queue.
#[derive(Clone, Debug)]
pub struct MipImage {
    /// Level 0 width of one face.
    pub width: u32,
    /// Level 0 height of one face.
    pub height: u32,
    pub topology: Topology,
    /// RGBA8 (linear, straight alpha) per level. Faces are concatenated in canonical order
    /// 0..5, rows tightly packed.
    pub levels: Vec<Vec<u8>>,
}

impl MipImage {
    pub fn mip_count(&self) -> u32 {
        self.levels.len() as u32
    }

    pub fn face_bytes(&self, level: u32, face: u32) -> &[u8] {
        let (w, h) = level_extent(self.width, self.height, level);
        let face_len = (w as usize) * (h as usize) * 4;
        let start = face as usize * face_len;
        &self.levels[level as usize][start..start + face_len]
    }
}

/// Import policy for payloads handed to the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecOpts {
    pub generate_mips: bool,
    pub cube_strips: bool,
}

impl Default for CodecOpts {
    fn default() -> Self {
        Self {
            generate_mips: false,
            cube_strips: true,
        }
    }
}

impl From<&WorkerConfig> for CodecOpts {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            generate_mips: cfg.generate_mips,
            cube_strips: cfg.cube_strips,
        }
    }
}

/// Extent of mip `level` for a `width` x `height` base.
pub fn level_extent(width: u32, height: u32, level: u32) -> (u32, u32) {
    let shrink = |d: u32| d.checked_shr(level).unwrap_or(0).max(1);
    (shrink(width), shrink(height))
}

/// Number of levels in a complete chain down to 1x1.
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Decode a picture payload into linear RGBA8 levels.
///
/// The sRGB flag carried in container metadata is deliberately not applied here; it is forwarded
/// to the compute kernel.
pub fn decode_image(bytes: &[u8], opts: CodecOpts) -> WorkerResult<MipImage> {
    let dyn_img = image::load_from_memory(bytes)
        .map_err(|e| WorkerError::decode(format!("image payload rejected: {e}")))?;
    let rgba = dyn_img.to_rgba8();
    let (width, full_height) = rgba.dimensions();
    if width == 0 || full_height == 0 {
        return Err(WorkerError::decode("image payload has zero extent"));
    }

    let topology = if opts.cube_strips && width.checked_mul(6) == Some(full_height) {
        Topology::Cube
    } else {
        Topology::Planar
    };
    let height = full_height / topology.faces();

    let faces: Vec<RgbaImage> = match topology {
        Topology::Planar => vec![rgba],
        Topology::Cube => (0..6)
            .map(|f| image::imageops::crop_imm(&rgba, 0, f * height, width, height).to_image())
            .collect(),
    };

    let mip_count = if opts.generate_mips {
        full_mip_count(width, height)
    } else {
        1
    };

    let mut levels = Vec::with_capacity(mip_count as usize);
    for level in 0..mip_count {
        let (lw, lh) = level_extent(width, height, level);
        let mut data = Vec::with_capacity((lw as usize) * (lh as usize) * 4 * faces.len());
        for face in &faces {
            if level == 0 {
                data.extend_from_slice(face.as_raw());
            } else {
                let scaled = image::imageops::resize(face, lw, lh, FilterType::Triangle);
                data.extend_from_slice(scaled.as_raw());
            }
        }
        levels.push(data);
    }

    Ok(MipImage {
        width,
        height,
        topology,
        levels,
    })
}

/// Encode an RGBA8 readback as PNG.
pub fn encode_png(frame: &FrameRGBA) -> WorkerResult<Vec<u8>> {
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(
            &frame.data,
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgba8,
        )
        .map_err(|e| WorkerError::backend(format!("png encode failed: {e}")))?;
    Ok(out)
}
