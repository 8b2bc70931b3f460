//! Texel contract of the compute kernel, shared by the CPU backend and the WGSL source.
//!
//! Per texel: optionally linearize sRGB-encoded input, scale RGB by brightness, derive an 8-bit
//! channel level from the brightest component, and accumulate statistics. Texels excluded by
//! the auxiliary mask never touch the statistics.

use crate::compute::backend::UniformParams;

/// Outcome of shading one texel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TexelOutput {
    pub rgba: [u8; 4],
    /// Channel level contributed to the signal statistic, if the texel is counted.
    pub level: Option<i32>,
    pub matched: bool,
}

fn unorm(v: u8) -> f32 {
    v as f32 / 255.0
}

fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Shade one texel. `mask` is the auxiliary red channel sampled at the matching location.
pub fn shade_texel(texel: [u8; 4], params: &UniformParams, mask: Option<u8>) -> TexelOutput {
    let mut rgb = [unorm(texel[0]), unorm(texel[1]), unorm(texel[2])];
    if params.srgb_flag != 0 {
        rgb = rgb.map(srgb_to_linear);
    }
    let rgb = rgb.map(|c| (c * params.brightness).clamp(0.0, 1.0));
    let level = (rgb[0].max(rgb[1]).max(rgb[2]) * 255.0).round() as i32;

    let counted = mask.is_none_or(|m| unorm(m) >= 0.5);
    if !counted {
        return TexelOutput {
            rgba: [0, 0, 0, texel[3]],
            level: None,
            matched: false,
        };
    }

    let matched = level >= params.threshold;
    let rgba = if matched {
        [to_unorm8(rgb[0]), to_unorm8(rgb[1]), to_unorm8(rgb[2]), texel[3]]
    } else {
        [0, 0, 0, texel[3]]
    };
    TexelOutput {
        rgba,
        level: Some(level),
        matched,
    }
}

/// Map a destination texel to the auxiliary texel covering it.
pub fn aux_coord(x: u32, y: u32, dst: (u32, u32), aux: (u32, u32)) -> (u32, u32) {
    let ax = (x as u64 * aux.0 as u64 / dst.0 as u64) as u32;
    let ay = (y as u64 * aux.1 as u64 / dst.1 as u64) as u32;
    (ax.min(aux.0 - 1), ay.min(aux.1 - 1))
}

/// WGSL source of the kernel. `{{WG_X}}`/`{{WG_Y}}` are replaced with the group size the
/// backend derived from its limits.
pub const KERNEL_WGSL: &str = r#"
struct Params {
  brightness: f32,
  _pad0: f32,
  target_size: vec2<f32>,
  threshold: i32,
  srgb: i32,
  has_aux: u32,
  _pad1: u32,
};

struct Stats {
  level: atomic<i32>,
  count: atomic<i32>,
};

@group(0) @binding(0) var src: texture_2d<f32>;
@group(0) @binding(1) var dst: texture_storage_2d<rgba8unorm, write>;
@group(0) @binding(2) var<uniform> params: Params;
@group(0) @binding(3) var<storage, read_write> stats: Stats;
@group(0) @binding(4) var aux: texture_2d<f32>;

fn srgb_to_linear(c: vec3<f32>) -> vec3<f32> {
  let lo = c / 12.92;
  let hi = pow((c + vec3<f32>(0.055)) / 1.055, vec3<f32>(2.4));
  return select(hi, lo, c <= vec3<f32>(0.04045));
}

@compute @workgroup_size({{WG_X}}, {{WG_Y}}, 1)
fn compute(@builtin(global_invocation_id) gid: vec3<u32>) {
  let size = textureDimensions(dst);
  if (gid.x >= size.x || gid.y >= size.y) {
    return;
  }
  let xy = vec2<i32>(gid.xy);
  let texel = textureLoad(src, xy, 0);

  var rgb = texel.rgb;
  if (params.srgb != 0) {
    rgb = srgb_to_linear(rgb);
  }
  rgb = clamp(rgb * params.brightness, vec3<f32>(0.0), vec3<f32>(1.0));
  let level = i32(round(max(rgb.r, max(rgb.g, rgb.b)) * 255.0));

  var counted = true;
  if (params.has_aux != 0u) {
    let aux_size = textureDimensions(aux);
    let axy = min((gid.xy * aux_size) / size, aux_size - vec2<u32>(1u));
    counted = textureLoad(aux, vec2<i32>(axy), 0).r >= 0.5;
  }

  var out = vec4<f32>(0.0, 0.0, 0.0, texel.a);
  if (counted) {
    atomicMax(&stats.level, level);
    if (level >= params.threshold) {
      atomicAdd(&stats.count, 1);
      out = vec4<f32>(rgb, texel.a);
    }
  }
  textureStore(dst, xy, out);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn params(threshold: i32) -> UniformParams {
        UniformParams {
            brightness: 1.0,
            target_width: 4.0,
            target_height: 4.0,
            threshold,
            srgb_flag: 0,
        }
    }

    #[test]
    fn bright_texel_matches_and_keeps_colour() {
        let out = shade_texel([255, 10, 10, 200], &params(187), None);
        assert_eq!(out.level, Some(255));
        assert!(out.matched);
        assert_eq!(out.rgba, [255, 10, 10, 200]);
    }

    #[test]
    fn dim_texel_is_blacked_out_but_counted() {
        let out = shade_texel([100, 100, 100, 255], &params(187), None);
        assert_eq!(out.level, Some(100));
        assert!(!out.matched);
        assert_eq!(out.rgba, [0, 0, 0, 255]);
    }

    #[test]
    fn brightness_scales_before_thresholding() {
        let p = UniformParams {
            brightness: 2.0,
            ..params(187)
        };
        let out = shade_texel([100, 0, 0, 255], &p, None);
        assert_eq!(out.level, Some(200));
        assert!(out.matched);
    }

    #[test]
    fn srgb_flag_linearizes_input() {
        let p = UniformParams {
            srgb_flag: 1,
            ..params(0)
        };
        let out = shade_texel([128, 128, 128, 255], &p, None);
        assert_eq!(out.level, Some(55));
    }

    #[test]
    fn masked_texel_is_excluded() {
        let out = shade_texel([255, 255, 255, 255], &params(0), Some(0));
        assert_eq!(out.level, None);
        assert!(!out.matched);
        let out = shade_texel([255, 255, 255, 255], &params(0), Some(255));
        assert_eq!(out.level, Some(255));
    }

    #[test]
    fn aux_coord_scales_and_clamps() {
        assert_eq!(aux_coord(3, 3, (4, 4), (2, 2)), (1, 1));
        assert_eq!(aux_coord(0, 1, (4, 4), (1, 1)), (0, 0));
        assert_eq!(aux_coord(1, 1, (2, 2), (8, 8)), (4, 4));
    }
}
