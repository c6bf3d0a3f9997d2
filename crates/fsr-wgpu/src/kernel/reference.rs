//! CPU implementation of the filter kernel
//!
//! Mirrors `wgsl/fsr.wgsl` operation for operation so that it can stand in for the GPU on hosts without an
//! adapter and serve as the reference the GPU output is verified against. Pixels are processed in the same
//! 16x16 tile order the GPU dispatch uses.

use image::Rgba32FImage;

use super::{KernelOp, KernelParams, WORKGROUP_SIZE, dispatch_grid};
use crate::{
    FsrError, Result,
    buffer::{Extent, PixelRange},
    config::UpsampleMode,
};

type Rgba = [f32; 4];

const SHARPEN_LOBE_LIMIT: f32 = 0.1875;

/// Runs one invocation described by `params` from `source` into `destination`
///
/// `destination` must already have the output extent encoded in `params`.
pub fn dispatch(params: &KernelParams, source: &Rgba32FImage, destination: &mut Rgba32FImage) -> Result<()> {
    let output = params.output_extent();
    if destination.dimensions() != (output.width, output.height) {
        return Err(FsrError::Dispatch(format!(
            "destination is {}x{} but the invocation writes {output}",
            destination.width(),
            destination.height()
        )));
    }
    let limit = params.sample_limit();
    let limit = Extent::new(limit.width.min(source.width()), limit.height.min(source.height()));
    if limit.is_empty() {
        return Err(FsrError::InvalidDimensions {
            width: limit.width,
            height: limit.height,
        });
    }

    let sampler = Sampler { params, source, limit };
    let (groups_x, groups_y) = dispatch_grid(output);
    for group_y in 0..groups_y {
        for group_x in 0..groups_x {
            for local_y in 0..WORKGROUP_SIZE {
                for local_x in 0..WORKGROUP_SIZE {
                    let x = group_x * WORKGROUP_SIZE + local_x;
                    let y = group_y * WORKGROUP_SIZE + local_y;
                    if x >= output.width || y >= output.height {
                        continue;
                    }
                    let color = sampler.shade(x, y);
                    destination.put_pixel(x, y, image::Rgba(color));
                }
            }
        }
    }

    Ok(())
}

/// Resamples the `viewport` region of `source` to `output`
pub fn upsample(source: &Rgba32FImage, viewport: Extent, output: Extent, mode: UpsampleMode) -> Result<Rgba32FImage> {
    let input_image = Extent::new(source.width(), source.height());
    let op = KernelOp::Upsample {
        mode,
        input_viewport: viewport,
        input_image,
    };
    let params = KernelParams::encode(op, input_image, output, PixelRange::Standard)?;
    let mut destination = Rgba32FImage::new(output.width, output.height);
    dispatch(&params, source, &mut destination)?;
    Ok(destination)
}

/// Sharpens `source` with a caller-facing strength in [0, 2]
pub fn sharpen(source: &Rgba32FImage, strength: f32, range: PixelRange) -> Result<Rgba32FImage> {
    let extent = Extent::new(source.width(), source.height());
    let params = KernelParams::encode(KernelOp::Sharpen { strength }, extent, extent, range)?;
    let mut destination = Rgba32FImage::new(extent.width, extent.height);
    dispatch(&params, source, &mut destination)?;
    Ok(destination)
}

struct Sampler<'a> {
    params: &'a KernelParams,
    source: &'a Rgba32FImage,
    limit: Extent,
}

impl Sampler<'_> {
    fn shade(&self, x: u32, y: u32) -> Rgba {
        if self.params.is_sharpen() {
            self.sharpen(x, y)
        } else if self.params.upsample_mode == 0 {
            self.upsample_edge_adaptive(x, y)
        } else {
            self.upsample_bilinear(x, y)
        }
    }

    fn load(&self, x: i32, y: i32) -> Rgba {
        let x = x.clamp(0, self.limit.width as i32 - 1) as u32;
        let y = y.clamp(0, self.limit.height as i32 - 1) as u32;
        self.source.get_pixel(x, y).0
    }

    fn output_to_input(&self, x: u32, y: u32) -> (f32, f32) {
        let params = self.params;
        let scale_x = params.input_viewport_width as f32 / params.output_image_width as f32;
        let scale_y = params.input_viewport_height as f32 / params.output_image_height as f32;
        ((x as f32 + 0.5) * scale_x - 0.5, (y as f32 + 0.5) * scale_y - 0.5)
    }

    fn upsample_edge_adaptive(&self, x: u32, y: u32) -> Rgba {
        let (px, py) = self.output_to_input(x, y);
        let (fx, fy) = (px.floor(), py.floor());
        let (px, py) = (px - fx, py - fy);
        let (ox, oy) = (fx as i32, fy as i32);

        //    b c
        //  e f g h
        //  i j k l
        //    n o
        let tb = self.load(ox, oy - 1);
        let tc = self.load(ox + 1, oy - 1);
        let te = self.load(ox - 1, oy);
        let tf = self.load(ox, oy);
        let tg = self.load(ox + 1, oy);
        let th = self.load(ox + 2, oy);
        let ti = self.load(ox - 1, oy + 1);
        let tj = self.load(ox, oy + 1);
        let tk = self.load(ox + 1, oy + 1);
        let tl = self.load(ox + 2, oy + 1);
        let tn = self.load(ox, oy + 2);
        let to = self.load(ox + 1, oy + 2);

        let (lb, lc, le, lf, lg, lh) = (luma(tb), luma(tc), luma(te), luma(tf), luma(tg), luma(th));
        let (li, lj, lk, ll, ln, lo) = (luma(ti), luma(tj), luma(tk), luma(tl), luma(tn), luma(to));

        let mut dir = (0.0f32, 0.0f32);
        let mut edge_len = 0.0f32;
        accumulate_direction(&mut dir, &mut edge_len, (1.0 - px) * (1.0 - py), lb, le, lf, lg, lj);
        accumulate_direction(&mut dir, &mut edge_len, px * (1.0 - py), lc, lf, lg, lh, lk);
        accumulate_direction(&mut dir, &mut edge_len, (1.0 - px) * py, lf, li, lj, lk, ln);
        accumulate_direction(&mut dir, &mut edge_len, px * py, lg, lj, lk, ll, lo);

        let dir_r = dir.0 * dir.0 + dir.1 * dir.1;
        let is_flat = dir_r < 1.0 / 32768.0;
        let dir_scale = if is_flat { 1.0 } else { 1.0 / dir_r.sqrt() };
        if is_flat {
            dir.0 = 1.0;
        }
        let dir = (dir.0 * dir_scale, dir.1 * dir_scale);

        let edge_len = edge_len * 0.5;
        let edge_len = edge_len * edge_len;

        let stretch = (dir.0 * dir.0 + dir.1 * dir.1) / dir.0.abs().max(dir.1.abs());
        let len2 = (1.0 + (stretch - 1.0) * edge_len, 1.0 - 0.5 * edge_len);
        let lob = 0.5 - 0.29 * edge_len;
        let window = Window { dir, len2, lob, clp: 1.0 / lob };

        let mut acc = Accumulator::default();
        for (offset, color) in [
            ((0.0, -1.0), tb),
            ((1.0, -1.0), tc),
            ((-1.0, 1.0), ti),
            ((0.0, 1.0), tj),
            ((0.0, 0.0), tf),
            ((-1.0, 0.0), te),
            ((1.0, 1.0), tk),
            ((2.0, 1.0), tl),
            ((2.0, 0.0), th),
            ((1.0, 0.0), tg),
            ((1.0, 2.0), to),
            ((0.0, 2.0), tn),
        ] {
            acc.add(&window, (offset.0 - px, offset.1 - py), color);
        }

        let resolved = if acc.weight > 0.0 { acc.color.map(|v| v / acc.weight) } else { tf };
        // Deringing: stay inside the 2x2 neighbourhood
        std::array::from_fn(|i| {
            let low = tf[i].min(tg[i]).min(tj[i].min(tk[i]));
            let high = tf[i].max(tg[i]).max(tj[i].max(tk[i]));
            high.min(low.max(resolved[i]))
        })
    }

    fn upsample_bilinear(&self, x: u32, y: u32) -> Rgba {
        let (px, py) = self.output_to_input(x, y);
        let (fx, fy) = (px.floor(), py.floor());
        let (tx, ty) = (px - fx, py - fy);
        let (ox, oy) = (fx as i32, fy as i32);

        let c00 = self.load(ox, oy);
        let c10 = self.load(ox + 1, oy);
        let c01 = self.load(ox, oy + 1);
        let c11 = self.load(ox + 1, oy + 1);

        std::array::from_fn(|i| {
            let top = c00[i] + (c10[i] - c00[i]) * tx;
            let bottom = c01[i] + (c11[i] - c01[i]) * tx;
            top + (bottom - top) * ty
        })
    }

    fn sharpen(&self, x: u32, y: u32) -> Rgba {
        let (x, y) = (x as i32, y as i32);

        //   b
        // d e f
        //   h
        let b = self.load(x, y - 1);
        let d = self.load(x - 1, y);
        let e = self.load(x, y);
        let f = self.load(x + 1, y);
        let h = self.load(x, y + 1);

        let (bl, dl, el, fl, hl) = (luma(b), luma(d), luma(e), luma(f), luma(h));

        let luma_range = bl.max(dl).max(el.max(fl)).max(hl) - bl.min(dl).min(el.min(fl)).min(hl);
        let nz = 0.25 * (bl + dl + fl + hl) - el;
        let nz = if luma_range > 0.0 { (nz.abs() / luma_range).clamp(0.0, 1.0) } else { 0.0 };
        let nz = 1.0 - 0.5 * nz;

        let mut lobe_max = f32::NEG_INFINITY;
        for i in 0..3 {
            let mn4 = b[i].min(d[i]).min(f[i].min(h[i]));
            let mx4 = b[i].max(d[i]).max(f[i].max(h[i]));
            let hit_min = mn4.min(e[i]) / (4.0 * mx4).max(1e-6);
            let hit_max = (1.0 - mx4.max(e[i])) / (4.0 * mn4 - 4.0).min(-1e-6);
            lobe_max = lobe_max.max((-hit_min).max(hit_max));
        }

        let con = self.params.sharpness.clamp(0.0, 2.0) * 0.5;
        let lobe = (-SHARPEN_LOBE_LIMIT).max(lobe_max.min(0.0)) * con * nz;

        let extended = self.params.extended_range != 0;
        let mut out = e;
        for i in 0..3 {
            let value = (lobe * (b[i] + d[i] + f[i] + h[i]) + e[i]) / (4.0 * lobe + 1.0);
            out[i] = if extended { value.max(0.0) } else { value.clamp(0.0, 1.0) };
        }
        out
    }
}

fn luma(c: Rgba) -> f32 {
    c[1] + 0.5 * (c[0] + c[2])
}

/// Accumulates direction and edge length from one 5-tap cross
///
/// ```text
///     a
///   b c d
///     e
/// ```
#[allow(clippy::too_many_arguments)]
fn accumulate_direction(dir: &mut (f32, f32), edge_len: &mut f32, w: f32, la: f32, lb: f32, lc: f32, ld: f32, le: f32) {
    let axis = |near: f32, centre: f32, far: f32| {
        let delta = far - near;
        let span = (far - centre).abs().max((centre - near).abs());
        let len = if span > 0.0 { (delta.abs() / span).clamp(0.0, 1.0) } else { 0.0 };
        (delta, len * len)
    };
    let (dir_x, len_x) = axis(lb, lc, ld);
    let (dir_y, len_y) = axis(la, lc, le);

    dir.0 += dir_x * w;
    dir.1 += dir_y * w;
    *edge_len += (len_x + len_y) * w;
}

struct Window {
    dir: (f32, f32),
    len2: (f32, f32),
    lob: f32,
    clp: f32,
}

#[derive(Default)]
struct Accumulator {
    color: Rgba,
    weight: f32,
}

impl Accumulator {
    fn add(&mut self, window: &Window, offset: (f32, f32), color: Rgba) {
        let (dx, dy) = window.dir;
        let vx = (offset.0 * dx + offset.1 * dy) * window.len2.0;
        let vy = (offset.0 * -dy + offset.1 * dx) * window.len2.1;
        let d2 = (vx * vx + vy * vy).min(window.clp);

        let wb = 0.4 * d2 - 1.0;
        let wa = window.lob * d2 - 1.0;
        let w = (1.5625 * wb * wb - 0.5625) * (wa * wa);

        for (acc, value) in self.color.iter_mut().zip(color) {
            *acc += value * w;
        }
        self.weight += w;
    }
}
