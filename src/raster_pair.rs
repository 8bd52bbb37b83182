//! Opens a source/reference dataset pair, validates them against each
//! other, resolves the processing CRS, and iterates aligned block pairs
//! whose halos survive reprojection between the two grids.

use std::path::Path;
use std::sync::Mutex;

use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::Dataset;
use log::warn;

use crate::config::ProcCrs;
use crate::error::{RastFuseError, Result};
use crate::geom::{expand_window_to_grid, BoundingBox, GeoTransform, Window};
use crate::raster_array::RasterArray;
use crate::utils::{covers_bounds, non_alpha_band_indexes, reconcile_band_counts};

/// `proc_crs` resolved to a concrete side; `ProcCrs::Auto` never survives
/// past [`RasterPairReader::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProcCrs {
    Src,
    Ref,
}

/// One unit of work for the fusion driver: a band, its input windows (with
/// halo) and output windows (halo-free, tiling exactly) on both grids.
#[derive(Debug, Clone)]
pub struct BlockPair {
    pub band_index: usize,
    pub band_position: usize,
    pub src_in: Window,
    pub ref_in: Window,
    pub src_out: Window,
    pub ref_out: Window,
    pub outer: bool,
}

struct GridInfo {
    crs: SpatialRef,
    transform: GeoTransform,
    width: i64,
    height: i64,
}

// `SpatialRef` wraps a GDAL/OGR handle and isn't marked `Send`/`Sync` by the
// `gdal` crate, but it is only ever read (never mutated) after
// `RasterPairReader::open` returns, matching the read-only, multi-threaded
// `read()` access the design calls for.
unsafe impl Send for GridInfo {}
unsafe impl Sync for GridInfo {}

pub struct RasterPairReader {
    src_ds: Mutex<Dataset>,
    ref_ds: Mutex<Dataset>,
    pub src_bands: Vec<usize>,
    pub ref_bands: Vec<usize>,
    src_grid: GridInfo,
    ref_grid: GridInfo,
    proc_crs: ResolvedProcCrs,
}

fn crs_equal(a: &SpatialRef, b: &SpatialRef) -> bool {
    match (a.to_wkt(), b.to_wkt()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn reproject_bbox(bbox: &BoundingBox, from: &SpatialRef, to: &SpatialRef) -> Result<BoundingBox> {
    let transform = CoordTransform::new(from, to)?;
    let mut xs = [bbox.xmin, bbox.xmax, bbox.xmin, bbox.xmax];
    let mut ys = [bbox.ymin, bbox.ymin, bbox.ymax, bbox.ymax];
    let mut zs = [0.0; 4];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
    let points: Vec<(f64, f64)> = xs.iter().zip(ys.iter()).map(|(&x, &y)| (x, y)).collect();
    Ok(BoundingBox::from_points(&points))
}

fn warp_bbox(window: &Window, from: &GridInfo, to: &GridInfo) -> Result<BoundingBox> {
    let bbox = BoundingBox::from_window(window, &from.transform);
    if crs_equal(&from.crs, &to.crs) {
        Ok(bbox)
    } else {
        reproject_bbox(&bbox, &from.crs, &to.crs)
    }
}

/// Warps `window` onto `to`'s grid, expanding outward to the enclosing
/// integer cells so the result has full support (used for halo windows).
fn warp_window_expand(window: &Window, from: &GridInfo, to: &GridInfo) -> Result<Window> {
    Ok(warp_bbox(window, from, to)?.to_window(&to.transform))
}

/// Warps `window` onto `to`'s grid, rounding to the nearest integer cell so
/// consecutive output tiles abut exactly (used for output tile windows).
fn warp_window_round(window: &Window, from: &GridInfo, to: &GridInfo) -> Result<Window> {
    Ok(warp_bbox(window, from, to)?.to_window_rounded(&to.transform))
}

impl RasterPairReader {
    pub fn open(src_path: &Path, ref_path: &Path, proc_crs: ProcCrs) -> Result<Self> {
        let src_ds = Dataset::open(src_path)?;
        let ref_ds = Dataset::open(ref_path)?;

        Self::validate_readable(&src_ds)?;
        Self::validate_readable(&ref_ds)?;

        let src_bands = non_alpha_band_indexes(&src_ds)?;
        let ref_bands_all = non_alpha_band_indexes(&ref_ds)?;
        let (ref_bands, truncated) = reconcile_band_counts(&src_bands, &ref_bands_all)?;
        if truncated {
            warn!(
                "reference has {} non-alpha bands, more than source's {}; truncating",
                ref_bands_all.len(),
                src_bands.len()
            );
        }

        Self::warn_if_unmasked(&src_ds, "source")?;
        Self::warn_if_unmasked(&ref_ds, "reference")?;

        let src_crs = src_ds.spatial_ref()?;
        let ref_crs = ref_ds.spatial_ref()?;
        if !crs_equal(&src_crs, &ref_crs) {
            warn!("source and reference CRS differ; reconciling via reprojected windows");
        }

        let src_transform = GeoTransform::from_gdal(src_ds.geo_transform()?);
        let ref_transform = GeoTransform::from_gdal(ref_ds.geo_transform()?);
        let (src_w, src_h) = src_ds.raster_size();
        let (ref_w, ref_h) = ref_ds.raster_size();

        let src_grid = GridInfo { crs: src_crs, transform: src_transform, width: src_w as i64, height: src_h as i64 };
        let ref_grid = GridInfo { crs: ref_crs, transform: ref_transform, width: ref_w as i64, height: ref_h as i64 };

        let src_bbox = BoundingBox::from_window(&Window::new(0, 0, src_grid.width, src_grid.height), &src_grid.transform);
        let ref_bbox = BoundingBox::from_window(&Window::new(0, 0, ref_grid.width, ref_grid.height), &ref_grid.transform);
        let src_bbox_in_ref = if crs_equal(&src_grid.crs, &ref_grid.crs) {
            src_bbox
        } else {
            reproject_bbox(&src_bbox, &src_grid.crs, &ref_grid.crs)?
        };
        if !covers_bounds(&ref_bbox, &src_bbox_in_ref) {
            return Err(RastFuseError::Content("reference bounds do not cover source bounds".to_string()));
        }

        let src_res = src_grid.transform.resolution();
        let ref_res = ref_grid.transform.resolution();
        let src_pixel_smaller = (src_res.0 * src_res.1) <= (ref_res.0 * ref_res.1);
        let resolved = match proc_crs {
            ProcCrs::Auto => {
                if src_pixel_smaller {
                    ResolvedProcCrs::Ref
                } else {
                    ResolvedProcCrs::Src
                }
            }
            ProcCrs::Src => {
                if src_pixel_smaller {
                    warn!("proc_crs=src contradicts the resolution heuristic (reference has the larger pixels)");
                }
                ResolvedProcCrs::Src
            }
            ProcCrs::Ref => {
                if !src_pixel_smaller {
                    warn!("proc_crs=ref contradicts the resolution heuristic (source has the larger pixels)");
                }
                ResolvedProcCrs::Ref
            }
        };

        Ok(RasterPairReader {
            src_ds: Mutex::new(src_ds),
            ref_ds: Mutex::new(ref_ds),
            src_bands,
            ref_bands,
            src_grid,
            ref_grid,
            proc_crs: resolved,
        })
    }

    fn validate_readable(ds: &Dataset) -> Result<()> {
        let band = ds.rasterband(1).map_err(RastFuseError::from)?;
        let (w, h) = ds.raster_size();
        let probe = (1usize.min(w), 1usize.min(h));
        band.read_as::<f32>((0, 0), probe, probe, None)
            .map_err(|e| RastFuseError::UnsupportedImage(format!("cannot decode first block: {e}")))?;
        Ok(())
    }

    fn warn_if_unmasked(ds: &Dataset, label: &str) -> Result<()> {
        let band = ds.rasterband(1)?;
        let has_mask = band.open_mask_band().is_ok();
        if band.no_data_value().is_none() && !has_mask {
            warn!("{label} image has no nodata value and no dataset/alpha mask");
        }
        Ok(())
    }

    pub fn proc_crs(&self) -> ResolvedProcCrs {
        self.proc_crs
    }

    fn proc_grid(&self) -> &GridInfo {
        match self.proc_crs {
            ResolvedProcCrs::Src => &self.src_grid,
            ResolvedProcCrs::Ref => &self.ref_grid,
        }
    }

    fn other_grid(&self) -> &GridInfo {
        match self.proc_crs {
            ResolvedProcCrs::Src => &self.ref_grid,
            ResolvedProcCrs::Ref => &self.src_grid,
        }
    }

    /// Starting from the full proc-grid extent, halves the longer side
    /// until the block fits in `max_block_mem` megabytes (rescaled by the
    /// resolution ratio between the two grids, so the budget always refers
    /// to the higher-resolution image's byte cost).
    pub fn auto_block_shape(&self, max_block_mem: f64, overlap: (i64, i64)) -> Result<(i64, i64)> {
        let proc = self.proc_grid();
        let other = self.other_grid();
        let proc_area = {
            let (rw, rh) = proc.transform.resolution();
            rw * rh
        };
        let other_area = {
            let (rw, rh) = other.transform.resolution();
            rw * rh
        };
        // proc is always the lower-resolution (larger pixel area) grid, so
        // this ratio is <= 1.
        let mem_scale = (other_area / proc_area).min(1.0);

        let mut shape = (proc.height, proc.width);
        let budget_bytes = max_block_mem * 1e6 * mem_scale;
        while (shape.0 * shape.1) as f64 * std::mem::size_of::<f32>() as f64 > budget_bytes {
            if shape.0 >= shape.1 {
                shape.0 = (shape.0 + 1) / 2;
            } else {
                shape.1 = (shape.1 + 1) / 2;
            }
            if shape.0 <= 1 && shape.1 <= 1 {
                break;
            }
        }

        if shape.0 < 1 || shape.1 < 1 || shape.0 < overlap.0 || shape.1 < overlap.1 {
            return Err(RastFuseError::BlockSize(format!(
                "auto block shape {:?} is smaller than a pixel or the halo {:?}",
                shape, overlap
            )));
        }
        let high_res_equivalent = ((shape.0 * shape.1) as f64 / mem_scale.max(1e-12)).sqrt();
        if high_res_equivalent < 256.0 {
            warn!("auto block shape is smaller than 256x256 in the high-resolution image");
        }
        Ok(shape)
    }

    /// Iterates `BlockPair`s in band-major, then row-major proc-grid order.
    pub fn block_pairs(&self, kernel_shape: (i64, i64), block_shape: (i64, i64)) -> Result<Vec<BlockPair>> {
        let proc = self.proc_grid();
        let other = self.other_grid();
        let overlap = (kernel_shape.0 / 2, kernel_shape.1 / 2);

        let bands = self.src_bands.len();
        let mut pairs = Vec::new();

        for band_index in 0..bands {
            let mut row = 0i64;
            while row < proc.height {
                let mut col = 0i64;
                let block_h = block_shape.0.min(proc.height - row);
                while col < proc.width {
                    let block_w = block_shape.1.min(proc.width - col);
                    let proc_out = Window::new(col, row, block_w, block_h);
                    let proc_in = expand_window_to_grid(proc_out, overlap).clip_to(proc.width, proc.height);
                    let other_in = warp_window_expand(&proc_in, proc, other)?;
                    let other_out = warp_window_round(&proc_out, proc, other)?;
                    let outer = proc_in.touches_edge(proc.width, proc.height);

                    let (src_in, ref_in, src_out, ref_out) = match self.proc_crs {
                        ResolvedProcCrs::Src => (proc_in, other_in, proc_out, other_out),
                        ResolvedProcCrs::Ref => (other_in, proc_in, other_out, proc_out),
                    };

                    pairs.push(BlockPair {
                        band_index: self.src_bands[band_index],
                        band_position: band_index,
                        src_in,
                        ref_in,
                        src_out,
                        ref_out,
                        outer,
                    });
                    col += block_w;
                }
                row += block_h;
            }
        }
        Ok(pairs)
    }

    /// Thread-safe windowed read of both grids for one block.
    pub fn read(&self, pair: &BlockPair) -> Result<(RasterArray, RasterArray)> {
        let src_ds = self.src_ds.lock().expect("src dataset lock poisoned");
        let src_ra = RasterArray::from_dataset(&src_ds, &[pair.band_index], &pair.src_in)?;
        drop(src_ds);

        let ref_ds = self.ref_ds.lock().expect("ref dataset lock poisoned");
        let ref_band_index = self.ref_bands[self.src_bands.iter().position(|&b| b == pair.band_index).unwrap_or(0)];
        let ref_ra = RasterArray::from_dataset(&ref_ds, &[ref_band_index], &pair.ref_in)?;
        drop(ref_ds);

        Ok((src_ra, ref_ra))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_and_warp_helpers_round_trip_on_identity_crs() {
        let crs = SpatialRef::from_epsg(4326).unwrap();
        let transform = GeoTransform::from_gdal([0.0, 1.0, 0.0, 0.0, 0.0, -1.0]);
        let grid = GridInfo { crs: crs.clone(), transform, width: 10, height: 10 };
        let window = Window::new(2, 2, 4, 4);
        assert_eq!(warp_window_expand(&window, &grid, &grid).unwrap(), window);
        assert_eq!(warp_window_round(&window, &grid, &grid).unwrap(), window);
    }
}
