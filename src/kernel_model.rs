//! Fits and applies the per-pixel linear correction model over a sliding
//! kernel: gain, gain with a block-scalar offset, and gain+offset with
//! R²-gated offset inpainting.

use ndarray::Array2;

use crate::boxfilter::{box_count, box_sum};
use crate::config::{Method, Resampling};
use crate::error::{RastFuseError, Result};
use crate::inpaint::idw_fill;
use crate::raster_array::RasterArray;
use crate::raster_pair::ResolvedProcCrs;
use crate::utils::validate_kernel_shape;

const INPAINT_SEARCH_RADIUS: i64 = 8;

/// Configuration governing a single fit/apply pass.
#[derive(Debug, Clone)]
pub struct KernelModelConfig {
    pub method: Method,
    pub kernel_shape: (usize, usize),
    pub r2_inpaint_thresh: f64,
    pub mask_partial: bool,
    pub upsampling: Resampling,
    pub downsampling: Resampling,
    pub proc_crs: ResolvedProcCrs,
}

fn make_odd(v: usize) -> usize {
    if v % 2 == 0 {
        v + 1
    } else {
        v
    }
}

pub struct KernelModel {
    config: KernelModelConfig,
}

fn nan_eq(a: f32, b: f32) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn percentile_1(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64 - 1.0) * 0.01).round() as usize;
    sorted[idx]
}

impl KernelModel {
    pub fn new(config: KernelModelConfig) -> Result<Self> {
        validate_kernel_shape(config.kernel_shape, config.method)?;
        Ok(KernelModel { config })
    }

    /// Fits the model over `src`/`ref_` and returns a parameter array with
    /// 1/2/3 bands according to the configured method. `src` and `ref_` may
    /// arrive on different grids (their native resolutions); whichever one
    /// is not the configured processing grid is resampled onto the other
    /// before fitting.
    pub fn fit(&self, src: &RasterArray, ref_: &RasterArray) -> Result<RasterArray> {
        let (src, ref_, kernel_shape) = self.reconcile_grids(src, ref_)?;
        let (src, ref_) = (&src, &ref_);
        if src.width() != ref_.width() || src.height() != ref_.height() {
            return Err(RastFuseError::Shape("source and reference blocks must share a grid to fit".to_string()));
        }
        let (h, w) = (src.height(), src.width());

        let mask_s = band0_mask(src);
        let mask_r = band0_mask(ref_);
        let valid = &mask_s & &mask_r;

        let s = zeroed_where_invalid(src, &valid);
        let r = zeroed_where_invalid(ref_, &valid);

        let n = box_count(&valid, kernel_shape);
        let sum_s = box_sum(&s, kernel_shape);
        let sum_r = box_sum(&r, kernel_shape);
        let sum_sr = box_sum(&(&s * &r), kernel_shape);
        let sum_s2 = box_sum(&(&s * &s), kernel_shape);
        let sum_r2 = box_sum(&(&r * &r), kernel_shape);

        let moments = Moments { n, sum_s, sum_r, sum_sr, sum_s2, sum_r2 };

        let param = match self.config.method {
            Method::Gain => self.fit_gain(&moments, h, w),
            Method::GainBlkOffset => self.fit_gain_blk_offset(&moments, &s, &r, &valid, h, w),
            Method::GainOffset => self.fit_gain_offset(&moments, &s, &r, h, w, kernel_shape),
        };

        RasterArray::construct(param, ref_.crs().clone(), *ref_.transform(), f32::NAN, None)
    }

    /// Brings `src` and `ref_` onto a common grid before fitting. When
    /// `proc_crs` names the reference side, the source is downsampled onto
    /// the reference grid. When it names the source side, the reference is
    /// upsampled onto the source grid and the kernel is scaled up by the
    /// reference/source resolution ratio so it still spans a comparable
    /// ground footprint.
    fn reconcile_grids(&self, src: &RasterArray, ref_: &RasterArray) -> Result<(RasterArray, RasterArray, (usize, usize))> {
        let same_grid = src.width() == ref_.width() && src.height() == ref_.height() && src.crs().to_wkt().ok() == ref_.crs().to_wkt().ok();
        if same_grid {
            return Ok((src.clone(), ref_.clone(), self.config.kernel_shape));
        }
        match self.config.proc_crs {
            ResolvedProcCrs::Ref => {
                let resampled_src =
                    src.reproject(ref_.crs(), ref_.transform(), (ref_.height(), ref_.width()), src.nodata(), self.config.downsampling.to_gdal())?;
                Ok((resampled_src, ref_.clone(), self.config.kernel_shape))
            }
            ResolvedProcCrs::Src => {
                let resampled_ref =
                    ref_.reproject(src.crs(), src.transform(), (src.height(), src.width()), ref_.nodata(), self.config.upsampling.to_gdal())?;
                let (src_res_x, src_res_y) = src.res();
                let (ref_res_x, ref_res_y) = ref_.res();
                let ratio_h = if src_res_y > 0.0 { (ref_res_y / src_res_y).round().max(1.0) as usize } else { 1 };
                let ratio_w = if src_res_x > 0.0 { (ref_res_x / src_res_x).round().max(1.0) as usize } else { 1 };
                let scaled = (make_odd(self.config.kernel_shape.0 * ratio_h), make_odd(self.config.kernel_shape.1 * ratio_w));
                Ok((src.clone(), resampled_ref, scaled))
            }
        }
    }

    fn fit_gain(&self, m: &Moments, h: usize, w: usize) -> ndarray::Array3<f32> {
        let gain = gain_from_moments(m, h, w);
        let mut out = ndarray::Array3::from_elem((1, h, w), f32::NAN);
        out.index_axis_mut(ndarray::Axis(0), 0).assign(&gain);
        out
    }

    fn fit_gain_blk_offset(&self, m: &Moments, s: &Array2<f32>, r: &Array2<f32>, valid: &Array2<bool>, h: usize, w: usize) -> ndarray::Array3<f32> {
        let gain = gain_from_moments(m, h, w);

        let mut s_valid = Vec::new();
        let mut r_valid = Vec::new();
        for idx in 0..h * w {
            let (row, col) = (idx / w, idx % w);
            if valid[[row, col]] {
                s_valid.push(s[[row, col]]);
                r_valid.push(r[[row, col]]);
            }
        }
        let total_s: f64 = s_valid.iter().map(|&v| v as f64).sum();
        let total_r: f64 = r_valid.iter().map(|&v| v as f64).sum();
        let global_gain = if total_s > 0.0 { (total_r / total_s) as f32 } else { f32::NAN };
        let offset = percentile_1(&r_valid) - global_gain * percentile_1(&s_valid);

        let mut out = ndarray::Array3::from_elem((2, h, w), f32::NAN);
        out.index_axis_mut(ndarray::Axis(0), 0).assign(&gain);
        out.index_axis_mut(ndarray::Axis(0), 1).fill(offset);
        out
    }

    fn fit_gain_offset(&self, m: &Moments, s: &Array2<f32>, r: &Array2<f32>, h: usize, w: usize, kernel_shape: (usize, usize)) -> ndarray::Array3<f32> {
        let mut gain = Array2::from_elem((h, w), f32::NAN);
        let mut offset = Array2::from_elem((h, w), f32::NAN);

        for row in 0..h {
            for col in 0..w {
                let n = m.n[[row, col]];
                if n < 1.0 {
                    continue;
                }
                let den_s = (n * m.sum_s2[[row, col]] - m.sum_s[[row, col]] * m.sum_s[[row, col]]) as f64;
                if den_s <= 0.0 {
                    continue;
                }
                let num = (n * m.sum_sr[[row, col]] - m.sum_s[[row, col]] * m.sum_r[[row, col]]) as f64;
                let g = (num / den_s) as f32;
                let o = ((m.sum_r[[row, col]] - g * m.sum_s[[row, col]]) / n) as f32;
                gain[[row, col]] = g;
                offset[[row, col]] = o;
            }
        }

        let mut resid2 = Array2::from_elem((h, w), 0.0f32);
        for row in 0..h {
            for col in 0..w {
                if gain[[row, col]].is_nan() {
                    continue;
                }
                let resid = gain[[row, col]] * s[[row, col]] + offset[[row, col]] - r[[row, col]];
                resid2[[row, col]] = resid * resid;
            }
        }
        let ss_res_box = box_sum(&resid2, kernel_shape);

        let mut r2 = Array2::from_elem((h, w), f32::NAN);
        for row in 0..h {
            for col in 0..w {
                if gain[[row, col]].is_nan() {
                    continue;
                }
                let n = m.n[[row, col]];
                let ss_res = (n * ss_res_box[[row, col]]) as f64;
                let ss_tot = (n * m.sum_r2[[row, col]] - m.sum_r[[row, col]] * m.sum_r[[row, col]]) as f64;
                r2[[row, col]] = if ss_tot > 0.0 { (1.0 - ss_res / ss_tot) as f32 } else { f32::NAN };
            }
        }

        self.inpaint_offsets(&mut gain, &mut offset, &r2, m);

        let mut out = ndarray::Array3::from_elem((3, h, w), f32::NAN);
        out.index_axis_mut(ndarray::Axis(0), 0).assign(&gain);
        out.index_axis_mut(ndarray::Axis(0), 1).assign(&offset);
        out.index_axis_mut(ndarray::Axis(0), 2).assign(&r2);
        out
    }

    fn inpaint_offsets(&self, gain: &mut Array2<f32>, offset: &mut Array2<f32>, r2: &Array2<f32>, m: &Moments) {
        let (h, w) = gain.dim();
        let mut flagged = Array2::from_elem((h, w), false);
        for row in 0..h {
            for col in 0..w {
                if gain[[row, col]].is_nan() {
                    continue;
                }
                let low_r2 = r2[[row, col]].is_nan() || (r2[[row, col]] as f64) < self.config.r2_inpaint_thresh;
                if low_r2 || gain[[row, col]] < 0.0 {
                    flagged[[row, col]] = true;
                }
            }
        }

        let filled_offset = idw_fill(offset, &flagged, INPAINT_SEARCH_RADIUS);

        for row in 0..h {
            for col in 0..w {
                if !flagged[[row, col]] {
                    continue;
                }
                let new_o = filled_offset[[row, col]];
                if nan_eq(new_o, offset[[row, col]]) {
                    continue;
                }
                offset[[row, col]] = new_o;
                let sum_s = m.sum_s[[row, col]];
                if sum_s > 0.0 {
                    gain[[row, col]] = (m.sum_r[[row, col]] - m.n[[row, col]] * new_o) / sum_s;
                }
            }
        }
    }

    /// Applies a fitted parameter array to `src` (its native grid), moving
    /// the parameters onto that grid first if they were fit on a different
    /// one. Source nodata pixels remain nodata in the output.
    pub fn apply(&self, src: &RasterArray, param: &RasterArray) -> Result<RasterArray> {
        let same_grid = src.width() == param.width() && src.height() == param.height() && src.crs().to_wkt().ok() == param.crs().to_wkt().ok();

        let resample_alg = if param.width() * param.height() <= src.width() * src.height() {
            self.config.upsampling.to_gdal()
        } else {
            self.config.downsampling.to_gdal()
        };

        let moved_param = if same_grid {
            param.clone()
        } else {
            param.reproject(src.crs(), src.transform(), (src.height(), src.width()), f32::NAN, resample_alg)?
        };

        let (h, w) = (src.height(), src.width());
        let mut out = ndarray::Array3::from_elem((1, h, w), src.nodata());
        for row in 0..h {
            for col in 0..w {
                let s = src.array()[[0, row, col]];
                if nan_eq(s, src.nodata()) {
                    continue;
                }
                let g = moved_param.array()[[0, row, col]];
                if g.is_nan() {
                    continue;
                }
                let value = if param.count() >= 2 {
                    let o = moved_param.array()[[1, row, col]];
                    if o.is_nan() {
                        continue;
                    }
                    g * s + o
                } else {
                    g * s
                };
                out[[0, row, col]] = value;
            }
        }

        let mut result = RasterArray::construct(out, src.crs().clone(), *src.transform(), src.nodata(), None)?;

        if self.config.mask_partial {
            let partial_mask = param_coverage_mask(&moved_param);
            let dilated = dilate(&partial_mask, self.dilation_radius(param, src));
            let mut mask = result.mask();
            for row in 0..h {
                for col in 0..w {
                    if !dilated[[row, col]] {
                        mask[[row, col]] = false;
                    }
                }
            }
            result.set_mask(&mask);
        }

        Ok(result)
    }

    /// Half-extent of the structuring element used to erode the output mask
    /// at partial-kernel-coverage pixels: the configured kernel's own
    /// half-extent, scaled by how many source pixels fit across one
    /// reference/parameter pixel.
    fn dilation_radius(&self, param: &RasterArray, src: &RasterArray) -> (i64, i64) {
        let (param_res_x, param_res_y) = param.res();
        let (src_res_x, src_res_y) = src.res();
        let ratio_x = if src_res_x > 0.0 { param_res_x / src_res_x } else { 1.0 };
        let ratio_y = if src_res_y > 0.0 { param_res_y / src_res_y } else { 1.0 };
        let base_y = ((self.config.kernel_shape.0 / 2).max(1)) as f64;
        let base_x = ((self.config.kernel_shape.1 / 2).max(1)) as f64;
        ((base_y * ratio_y).round().max(1.0) as i64, (base_x * ratio_x).round().max(1.0) as i64)
    }
}

struct Moments {
    n: Array2<f32>,
    sum_s: Array2<f32>,
    sum_r: Array2<f32>,
    sum_sr: Array2<f32>,
    sum_s2: Array2<f32>,
    sum_r2: Array2<f32>,
}

fn gain_from_moments(m: &Moments, h: usize, w: usize) -> Array2<f32> {
    let mut gain = Array2::from_elem((h, w), f32::NAN);
    for row in 0..h {
        for col in 0..w {
            if m.n[[row, col]] < 1.0 {
                continue;
            }
            let sum_s = m.sum_s[[row, col]];
            if sum_s > 0.0 {
                gain[[row, col]] = m.sum_r[[row, col]] / sum_s;
            }
        }
    }
    gain
}

fn band0_mask(ra: &RasterArray) -> Array2<bool> {
    let (h, w) = (ra.height(), ra.width());
    let mut mask = Array2::from_elem((h, w), true);
    for row in 0..h {
        for col in 0..w {
            if nan_eq(ra.array()[[0, row, col]], ra.nodata()) {
                mask[[row, col]] = false;
            }
        }
    }
    mask
}

fn zeroed_where_invalid(ra: &RasterArray, valid: &Array2<bool>) -> Array2<f32> {
    let (h, w) = (ra.height(), ra.width());
    let mut out = Array2::from_elem((h, w), 0.0f32);
    for row in 0..h {
        for col in 0..w {
            if valid[[row, col]] {
                out[[row, col]] = ra.array()[[0, row, col]];
            }
        }
    }
    out
}

fn param_coverage_mask(param: &RasterArray) -> Array2<bool> {
    let (h, w) = (param.height(), param.width());
    let mut mask = Array2::from_elem((h, w), true);
    for row in 0..h {
        for col in 0..w {
            if param.array()[[0, row, col]].is_nan() {
                mask[[row, col]] = false;
            }
        }
    }
    mask
}

/// Morphological erosion of `mask` by a `(2*radius.0+1, 2*radius.1+1)`
/// rectangular structuring element, expressed as a dilation of the invalid
/// region.
fn dilate(mask: &Array2<bool>, radius: (i64, i64)) -> Array2<bool> {
    let (radius_y, radius_x) = radius;
    let (h, w) = mask.dim();
    let mut out = mask.clone();
    for row in 0..h {
        for col in 0..w {
            if mask[[row, col]] {
                continue;
            }
            for dr in -radius_y..=radius_y {
                for dc in -radius_x..=radius_x {
                    let r = row as i64 + dr;
                    let c = col as i64 + dc;
                    if r >= 0 && c >= 0 && (r as usize) < h && (c as usize) < w {
                        out[[r as usize, c as usize]] = false;
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdal::spatial_ref::SpatialRef;
    use ndarray::Array3;
    use testutils::assert_float_eq;

    fn wgs84() -> SpatialRef {
        SpatialRef::from_epsg(4326).unwrap()
    }

    fn identity_transform() -> GeoTransform {
        GeoTransform::from_gdal([0.0, 1.0, 0.0, 0.0, 0.0, -1.0])
    }

    fn make_ra(data: Vec<f32>, h: usize, w: usize) -> RasterArray {
        let arr = Array3::from_shape_vec((1, h, w), data).unwrap();
        RasterArray::construct(arr, wgs84(), identity_transform(), f32::NAN, None).unwrap()
    }

    #[test]
    fn gain_recovers_scale_factor() {
        let src = make_ra(vec![10.0; 25], 5, 5);
        let ref_ = make_ra(vec![5.0; 25], 5, 5);
        let model = KernelModel::new(KernelModelConfig {
            method: Method::Gain,
            kernel_shape: (1, 1),
            r2_inpaint_thresh: 0.0,
            mask_partial: false,
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            proc_crs: ResolvedProcCrs::Ref,
        })
        .unwrap();
        let param = model.fit(&src, &ref_).unwrap();
        assert_float_eq(param.array()[[0, 2, 2]] as f64, 0.5, 1e-6);
    }

    #[test]
    fn gain_offset_recovers_affine_relationship() {
        let mut src_data = Vec::new();
        let mut ref_data = Vec::new();
        for i in 0..49 {
            let v = 10.0 + i as f32;
            src_data.push(v);
            ref_data.push(0.8 * v + 10.0);
        }
        let src = make_ra(src_data, 7, 7);
        let ref_ = make_ra(ref_data, 7, 7);
        let model = KernelModel::new(KernelModelConfig {
            method: Method::GainOffset,
            kernel_shape: (5, 5),
            r2_inpaint_thresh: 0.0,
            mask_partial: false,
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            proc_crs: ResolvedProcCrs::Ref,
        })
        .unwrap();
        let param = model.fit(&src, &ref_).unwrap();
        assert_float_eq(param.array()[[0, 3, 3]] as f64, 0.8, 1e-3);
        assert_float_eq(param.array()[[1, 3, 3]] as f64, 10.0, 1e-2);
        assert_float_eq(param.array()[[2, 3, 3]] as f64, 1.0, 1e-3);
    }

    #[test]
    fn odd_kernel_is_enforced() {
        let result = KernelModel::new(KernelModelConfig {
            method: Method::Gain,
            kernel_shape: (4, 5),
            r2_inpaint_thresh: 0.0,
            mask_partial: false,
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            proc_crs: ResolvedProcCrs::Ref,
        });
        assert!(result.is_err());
    }

    #[test]
    fn gain_offset_min_5x5_is_enforced() {
        let result = KernelModel::new(KernelModelConfig {
            method: Method::GainOffset,
            kernel_shape: (3, 3),
            r2_inpaint_thresh: 0.0,
            mask_partial: false,
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            proc_crs: ResolvedProcCrs::Ref,
        });
        assert!(result.is_err());
    }

    #[test]
    fn apply_preserves_source_nodata_mask() {
        let mut src = make_ra(vec![10.0; 9], 3, 3);
        src.array_mut()[[0, 1, 1]] = f32::NAN;
        let param = make_ra(vec![2.0; 9], 3, 3);
        let model = KernelModel::new(KernelModelConfig {
            method: Method::Gain,
            kernel_shape: (1, 1),
            r2_inpaint_thresh: 0.0,
            mask_partial: false,
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            proc_crs: ResolvedProcCrs::Ref,
        })
        .unwrap();
        let out = model.apply(&src, &param).unwrap();
        assert!(out.array()[[0, 1, 1]].is_nan());
        assert_float_eq(out.array()[[0, 0, 0]] as f64, 20.0, 1e-6);
    }

    #[test]
    fn mask_partial_erodes_around_a_coverage_gap() {
        let src = make_ra(vec![10.0; 49], 7, 7);
        let mut param = make_ra(vec![2.0; 49], 7, 7);
        // An irregular, single-pixel gap in the fitted parameter coverage
        // (e.g. a kernel that found no valid support there).
        param.array_mut()[[0, 3, 3]] = f32::NAN;

        let model = KernelModel::new(KernelModelConfig {
            method: Method::Gain,
            kernel_shape: (3, 3),
            r2_inpaint_thresh: 0.0,
            mask_partial: true,
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            proc_crs: ResolvedProcCrs::Ref,
        })
        .unwrap();
        let out = model.apply(&src, &param).unwrap();
        let mask = out.mask();

        for row in 2..=4 {
            for col in 2..=4 {
                assert!(!mask[[row, col]], "expected ({row},{col}) eroded by the coverage gap at (3,3)");
            }
        }
        assert!(mask[[0, 0]]);
        assert!(mask[[6, 6]]);
    }
}
