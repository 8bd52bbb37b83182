//! An in-memory, georeferenced banded pixel buffer, read and written through
//! windowed GDAL dataset access.

use gdal::raster::ResampleAlg;
use gdal::spatial_ref::SpatialRef;
use gdal::Dataset;
use ndarray::Array3;

use crate::error::{RastFuseError, Result};
use crate::geom::{GeoTransform, Window};

pub const DEFAULT_NODATA: f32 = f32::NAN;

fn nan_eq(a: f32, b: f32) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// A `(bands, rows, cols)` pixel buffer with a CRS, affine transform and
/// nodata value. Bands always share one grid, one CRS and one nodata value;
/// a pixel is masked out only when every band at that location equals
/// nodata.
#[derive(Debug, Clone)]
pub struct RasterArray {
    array: Array3<f32>,
    crs: SpatialRef,
    transform: GeoTransform,
    nodata: f32,
}

impl RasterArray {
    /// Construct directly from a buffer. If `window` is given, `transform`
    /// is offset so pixel (0,0) of `array` lands at `window`'s origin.
    pub fn construct(
        array: Array3<f32>,
        crs: SpatialRef,
        transform: GeoTransform,
        nodata: f32,
        window: Option<&Window>,
    ) -> Result<Self> {
        let (_, h, w) = array.dim();
        if let Some(win) = window {
            if win.height != h as i64 || win.width != w as i64 {
                return Err(RastFuseError::Shape(format!(
                    "window {}x{} does not match array {}x{}",
                    win.width, win.height, w, h
                )));
            }
        }
        let transform = match window {
            Some(win) => transform.windowed(win),
            None => transform,
        };
        Ok(RasterArray { array, crs, transform, nodata })
    }

    /// Allocate a buffer filled with `nodata` (if `array` is `None`) or wrap
    /// `array`, from a profile-like description.
    pub fn from_profile(
        array: Option<Array3<f32>>,
        crs: SpatialRef,
        transform: GeoTransform,
        nodata: f32,
        shape: Option<(usize, usize, usize)>,
        window: Option<&Window>,
    ) -> Result<Self> {
        let array = match array {
            Some(a) => a,
            None => {
                let (count, height, width) = shape.ok_or_else(|| {
                    RastFuseError::Format("from_profile requires a shape when array is None".to_string())
                })?;
                Array3::from_elem((count, height, width), nodata)
            }
        };
        Self::construct(array, crs, transform, nodata, window)
    }

    /// Windowed read from an open dataset. `window` may extend past the
    /// dataset's raster bounds; out-of-bounds pixels are filled with nodata
    /// rather than rejected.
    pub fn from_dataset(ds: &Dataset, indexes: &[usize], window: &Window) -> Result<Self> {
        let (raster_w, raster_h) = ds.raster_size();
        let (raster_w, raster_h) = (raster_w as i64, raster_h as i64);

        let bounded = window.clip_to(raster_w, raster_h);
        let nodata = DEFAULT_NODATA;

        let mut array = Array3::from_elem((indexes.len(), window.height as usize, window.width as usize), nodata);

        if !bounded.is_empty() {
            let dst_col0 = (bounded.col_off - window.col_off) as usize;
            let dst_row0 = (bounded.row_off - window.row_off) as usize;

            for (bi, &index) in indexes.iter().enumerate() {
                let band = ds.rasterband(index as isize)?;
                let buf = band.read_as::<f32>(
                    (bounded.col_off as isize, bounded.row_off as isize),
                    (bounded.width as usize, bounded.height as usize),
                    (bounded.width as usize, bounded.height as usize),
                    Some(ResampleAlg::NearestNeighbour),
                )?;
                let data = buf.data;
                for r in 0..bounded.height as usize {
                    for c in 0..bounded.width as usize {
                        array[[bi, dst_row0 + r, dst_col0 + c]] = data[r * bounded.width as usize + c];
                    }
                }
                if let Some(band_nodata) = band.no_data_value() {
                    let band_nodata = band_nodata as f32;
                    for r in 0..bounded.height as usize {
                        for c in 0..bounded.width as usize {
                            let v = array[[bi, dst_row0 + r, dst_col0 + c]];
                            if nan_eq(v, band_nodata) {
                                array[[bi, dst_row0 + r, dst_col0 + c]] = nodata;
                            }
                        }
                    }
                }
            }

            // Consult the dataset/alpha mask regardless of whether the band
            // also carries an explicit nodata value: 0 = invalid.
            let base_band = ds.rasterband(indexes[0] as isize)?;
            if let Ok(mask_band) = base_band.open_mask_band() {
                if let Ok(mask_buf) = mask_band.read_as::<u8>(
                    (bounded.col_off as isize, bounded.row_off as isize),
                    (bounded.width as usize, bounded.height as usize),
                    (bounded.width as usize, bounded.height as usize),
                    Some(ResampleAlg::NearestNeighbour),
                ) {
                    let mdata = mask_buf.data;
                    for r in 0..bounded.height as usize {
                        for c in 0..bounded.width as usize {
                            if mdata[r * bounded.width as usize + c] == 0 {
                                for bi in 0..indexes.len() {
                                    array[[bi, dst_row0 + r, dst_col0 + c]] = nodata;
                                }
                            }
                        }
                    }
                }
            }
        }

        let crs = ds.spatial_ref()?;
        let gt = ds.geo_transform()?;
        let transform = GeoTransform::from_gdal(gt).windowed(window);
        Ok(RasterArray { array, crs, transform, nodata })
    }

    /// Write into an open dataset, cropping the caller's window to the
    /// dataset's bounds and cropping this array to match.
    pub fn to_dataset(&self, ds: &Dataset, indexes: &[usize], window: Option<&Window>) -> Result<()> {
        let ds_crs = ds.spatial_ref()?;
        if ds_crs.to_proj4().ok() != self.crs.to_proj4().ok() {
            return Err(RastFuseError::Format("dataset CRS does not match RasterArray CRS".to_string()));
        }
        let (ds_count, _) = (ds.raster_count(), ());
        if indexes.iter().any(|&i| i > ds_count as usize) {
            return Err(RastFuseError::Format(format!("band index exceeds dataset band count {ds_count}")));
        }

        let (raster_w, raster_h) = ds.raster_size();
        let full_window = Window::new(0, 0, self.width() as i64, self.height() as i64);
        let target_window = window.copied().unwrap_or(full_window);
        let clipped = target_window.clip_to(raster_w as i64, raster_h as i64);

        let src_col0 = (clipped.col_off - target_window.col_off) as usize;
        let src_row0 = (clipped.row_off - target_window.row_off) as usize;
        if clipped.is_empty() {
            return Err(RastFuseError::Shape("cropped array has a zero-length dimension".to_string()));
        }

        for (bi, &index) in indexes.iter().enumerate() {
            let mut band = ds.rasterband(index as isize)?;
            let mut buf = vec![0f32; clipped.width as usize * clipped.height as usize];
            for r in 0..clipped.height as usize {
                for c in 0..clipped.width as usize {
                    buf[r * clipped.width as usize + c] = self.array[[bi, src_row0 + r, src_col0 + c]];
                }
            }
            let mut gdal_buf = gdal::raster::Buffer::new((clipped.width as usize, clipped.height as usize), buf);
            band.write(
                (clipped.col_off as isize, clipped.row_off as isize),
                (clipped.width as usize, clipped.height as usize),
                &mut gdal_buf,
            )?;
        }
        Ok(())
    }

    /// A new `RasterArray` indexed by the integer-rounded window containing
    /// the requested bounds.
    pub fn slice_to_window(&self, window: &Window) -> Result<RasterArray> {
        let clipped = window.clip_to(self.width() as i64, self.height() as i64);
        if clipped.is_empty() {
            return Err(RastFuseError::Shape("slice window is empty".to_string()));
        }
        let mut out = Array3::from_elem((self.count(), clipped.height as usize, clipped.width as usize), self.nodata);
        for b in 0..self.count() {
            for r in 0..clipped.height as usize {
                for c in 0..clipped.width as usize {
                    out[[b, r, c]] = self.array[[b, clipped.row_off as usize + r, clipped.col_off as usize + c]];
                }
            }
        }
        RasterArray::construct(out, self.crs.clone(), self.transform, self.nodata, Some(&clipped))
    }

    /// Resamples this array onto a different grid (possibly a different
    /// CRS, transform and shape), sampling each destination pixel's world
    /// position back into this array's pixel space. Used to move a fitted
    /// parameter array between the processing grid and the grid being
    /// corrected.
    pub fn reproject(
        &self,
        crs: &SpatialRef,
        transform: &GeoTransform,
        shape: (usize, usize),
        nodata: f32,
        resampling: ResampleAlg,
    ) -> Result<RasterArray> {
        let (dst_h, dst_w) = shape;
        let same_crs = self.crs.to_wkt().ok() == crs.to_wkt().ok();
        let coord_transform = if same_crs { None } else { Some(gdal::spatial_ref::CoordTransform::new(crs, &self.crs)?) };

        let mut out = Array3::from_elem((self.count(), dst_h, dst_w), nodata);
        for r in 0..dst_h {
            for c in 0..dst_w {
                let (mut x, mut y) = transform.pixel_to_world(c as f64, r as f64);
                if let Some(ct) = &coord_transform {
                    let mut xs = [x];
                    let mut ys = [y];
                    let mut zs = [0.0];
                    if ct.transform_coords(&mut xs, &mut ys, &mut zs).is_err() {
                        continue;
                    }
                    x = xs[0];
                    y = ys[0];
                }
                let (src_col, src_row) = self.transform.world_to_pixel(x, y);
                for b in 0..self.count() {
                    let value = match resampling {
                        ResampleAlg::NearestNeighbour => self.sample_nearest(b, src_col, src_row),
                        _ => self.sample_bilinear(b, src_col, src_row),
                    };
                    if let Some(v) = value {
                        out[[b, r, c]] = v;
                    }
                }
            }
        }
        RasterArray::construct(out, crs.clone(), *transform, nodata, None)
    }

    fn sample_nearest(&self, band: usize, col: f64, row: f64) -> Option<f32> {
        let c = col.round();
        let r = row.round();
        if c < 0.0 || r < 0.0 || c as usize >= self.width() || r as usize >= self.height() {
            return None;
        }
        let v = self.array[[band, r as usize, c as usize]];
        if nan_eq(v, self.nodata) {
            None
        } else {
            Some(v)
        }
    }

    fn sample_bilinear(&self, band: usize, col: f64, row: f64) -> Option<f32> {
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let c0 = col.floor() as i64;
        let r0 = row.floor() as i64;
        let c1 = c0 + 1;
        let r1 = r0 + 1;
        if c1 as usize >= self.width() || r1 as usize >= self.height() {
            return self.sample_nearest(band, col, row);
        }
        let fc = col - c0 as f64;
        let fr = row - r0 as f64;
        let corners = [
            self.array[[band, r0 as usize, c0 as usize]],
            self.array[[band, r0 as usize, c1 as usize]],
            self.array[[band, r1 as usize, c0 as usize]],
            self.array[[band, r1 as usize, c1 as usize]],
        ];
        if corners.iter().any(|&v| nan_eq(v, self.nodata)) {
            return self.sample_nearest(band, col, row);
        }
        let top = corners[0] as f64 * (1.0 - fc) + corners[1] as f64 * fc;
        let bottom = corners[2] as f64 * (1.0 - fc) + corners[3] as f64 * fc;
        Some((top * (1.0 - fr) + bottom * fr) as f32)
    }

    pub fn array(&self) -> &Array3<f32> {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut Array3<f32> {
        &mut self.array
    }

    pub fn crs(&self) -> &SpatialRef {
        &self.crs
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn width(&self) -> usize {
        self.array.dim().2
    }

    pub fn height(&self) -> usize {
        self.array.dim().1
    }

    pub fn count(&self) -> usize {
        self.array.dim().0
    }

    pub fn res(&self) -> (f64, f64) {
        self.transform.resolution()
    }

    pub fn nodata(&self) -> f32 {
        self.nodata
    }

    /// Rewrites existing nodata cells to `value`, keeping the mask stable
    /// across the change.
    pub fn set_nodata(&mut self, value: f32) {
        if nan_eq(value, self.nodata) {
            self.nodata = value;
            return;
        }
        let old_nodata = self.nodata;
        self.array.mapv_inplace(|v| if nan_eq(v, old_nodata) { value } else { v });
        self.nodata = value;
    }

    /// 2D mask, logical-AND over bands of `array != nodata` (NaN-aware).
    pub fn mask(&self) -> ndarray::Array2<bool> {
        let (bands, h, w) = self.array.dim();
        let mut mask = ndarray::Array2::from_elem((h, w), true);
        for b in 0..bands {
            for r in 0..h {
                for c in 0..w {
                    if nan_eq(self.array[[b, r, c]], self.nodata) {
                        mask[[r, c]] = false;
                    }
                }
            }
        }
        mask
    }

    /// Writes `nodata` at all `false` positions of `mask`.
    pub fn set_mask(&mut self, mask: &ndarray::Array2<bool>) {
        let (bands, h, w) = self.array.dim();
        for r in 0..h {
            for c in 0..w {
                if !mask[[r, c]] {
                    for b in 0..bands {
                        self.array[[b, r, c]] = self.nodata;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wgs84() -> SpatialRef {
        SpatialRef::from_epsg(4326).unwrap()
    }

    fn identity_transform() -> GeoTransform {
        GeoTransform::from_gdal([0.0, 1.0, 0.0, 0.0, 0.0, -1.0])
    }

    #[test]
    fn nodata_rewrite_preserves_mask() {
        let arr = Array3::from_shape_vec((1, 2, 2), vec![1.0, f32::NAN, 3.0, 4.0]).unwrap();
        let mut ra = RasterArray::construct(arr, wgs84(), identity_transform(), f32::NAN, None).unwrap();
        let before = ra.mask();
        ra.set_nodata(-9999.0);
        let after = ra.mask();
        assert_eq!(before, after);
        assert_eq!(ra.array()[[0, 0, 1]], -9999.0);
    }

    #[test]
    fn mask_is_and_over_bands() {
        let arr = Array3::from_shape_vec((2, 1, 2), vec![1.0, f32::NAN, 2.0, 3.0]).unwrap();
        let ra = RasterArray::construct(arr, wgs84(), identity_transform(), f32::NAN, None).unwrap();
        let mask = ra.mask();
        assert!(!mask[[0, 0]]);
        assert!(mask[[0, 1]]);
    }

    #[test]
    fn set_mask_writes_nodata() {
        let arr = Array3::from_elem((1, 2, 2), 5.0f32);
        let mut ra = RasterArray::construct(arr, wgs84(), identity_transform(), f32::NAN, None).unwrap();
        let mut mask = ndarray::Array2::from_elem((2, 2), true);
        mask[[0, 0]] = false;
        ra.set_mask(&mask);
        assert!(ra.array()[[0, 0, 0]].is_nan());
        assert_eq!(ra.array()[[0, 1, 1]], 5.0);
    }
}
