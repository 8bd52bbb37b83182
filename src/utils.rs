//! Small validation and naming helpers shared across the raster pair reader,
//! kernel model and fusion driver.

use std::path::{Path, PathBuf};

use gdal::Dataset;

use crate::config::Method;
use crate::error::{RastFuseError, Result};
use crate::geom::BoundingBox;

/// Validates a kernel shape is odd x odd, and (for `gain_offset`) at least
/// 5x5 in both dimensions.
pub fn validate_kernel_shape(shape: (usize, usize), method: Method) -> Result<()> {
    let (h, w) = shape;
    if h % 2 == 0 || w % 2 == 0 {
        return Err(RastFuseError::Config(format!("kernel shape {h}x{w} must be odd in both dimensions")));
    }
    if method == Method::GainOffset && (h < 5 || w < 5) {
        return Err(RastFuseError::Config(format!(
            "kernel shape {h}x{w} must be at least 5x5 for gain_offset"
        )));
    }
    Ok(())
}

/// Indexes (1-based, GDAL convention) of the non-alpha bands of `ds`, in
/// raster order. A band is treated as an alpha channel when its GDAL color
/// interpretation is `AlphaBand`.
pub fn non_alpha_band_indexes(ds: &Dataset) -> Result<Vec<usize>> {
    let count = ds.raster_count();
    let mut indexes = Vec::with_capacity(count as usize);
    for i in 1..=count {
        let band = ds.rasterband(i as isize)?;
        if band.color_interpretation() != gdal::raster::ColorInterpretation::AlphaBand {
            indexes.push(i as usize);
        }
    }
    Ok(indexes)
}

/// Reconciles source/reference non-alpha band counts: fails if the
/// reference has fewer bands than the source, otherwise returns the
/// (possibly truncated) reference band list plus a flag indicating whether
/// truncation happened (caller logs the warning, since this module has no
/// opinion on log formatting for its callers' contexts).
pub fn reconcile_band_counts(src_bands: &[usize], ref_bands: &[usize]) -> Result<(Vec<usize>, bool)> {
    if ref_bands.len() < src_bands.len() {
        return Err(RastFuseError::Content(format!(
            "reference has {} non-alpha bands, fewer than source's {}",
            ref_bands.len(),
            src_bands.len()
        )));
    }
    let truncated = ref_bands.len() > src_bands.len();
    let bands = ref_bands[..src_bands.len()].to_vec();
    Ok((bands, truncated))
}

/// True if `outer` fully covers `inner` (reference must cover source).
pub fn covers_bounds(outer: &BoundingBox, inner: &BoundingBox) -> bool {
    outer.covers(inner)
}

/// Builds `<srcstem>_FUSE_c<proc>_m<method>_k<h>_<w><ext>` in `out_dir`.
pub fn create_out_postfix(src_path: &Path, out_dir: &Path, proc_crs: &str, method: Method, kernel_shape: (usize, usize), ext: &str) -> PathBuf {
    let stem = src_path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let (h, w) = kernel_shape;
    out_dir.join(format!("{stem}_FUSE_c{proc_crs}_m{}_k{h}_{w}{ext}", method.as_str()))
}

/// Builds `<stem>_PARAMS<ext>` alongside a corrected output path.
pub fn create_param_filename(out_path: &Path) -> PathBuf {
    let ext = out_path.extension().and_then(|e| e.to_str()).map(|e| format!(".{e}")).unwrap_or_default();
    let stem = out_path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    out_path.with_file_name(format!("{stem}_PARAMS{ext}"))
}

/// Resolves `threads = 0` to the available parallelism; passes explicit
/// values through unchanged (a validation error only if `threads` exceeds
/// what the machine could ever use is not worth failing on; the semaphore
/// just caps concurrency at an inert number).
pub fn resolve_thread_count(threads: usize) -> usize {
    if threads == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_shape_rejects_even() {
        assert!(validate_kernel_shape((4, 5), Method::Gain).is_err());
        assert!(validate_kernel_shape((5, 5), Method::Gain).is_ok());
    }

    #[test]
    fn kernel_shape_enforces_min_5_for_gain_offset() {
        assert!(validate_kernel_shape((3, 3), Method::GainOffset).is_err());
        assert!(validate_kernel_shape((5, 5), Method::GainOffset).is_ok());
    }

    #[test]
    fn reconcile_bands_truncates_and_flags() {
        let (bands, truncated) = reconcile_band_counts(&[1, 2], &[1, 2, 3]).unwrap();
        assert_eq!(bands, vec![1, 2]);
        assert!(truncated);
    }

    #[test]
    fn reconcile_bands_fails_when_reference_short() {
        assert!(reconcile_band_counts(&[1, 2, 3], &[1, 2]).is_err());
    }

    #[test]
    fn out_postfix_matches_convention() {
        let path = create_out_postfix(
            Path::new("/data/ortho.tif"),
            Path::new("/out"),
            "ref",
            Method::GainOffset,
            (5, 5),
            ".tif",
        );
        assert_eq!(path, PathBuf::from("/out/ortho_FUSE_cref_mgain_offset_k5_5.tif"));
    }

    #[test]
    fn param_filename_matches_convention() {
        let path = create_param_filename(Path::new("/out/ortho_FUSE_cref_mgain_k5_5.tif"));
        assert_eq!(path, PathBuf::from("/out/ortho_FUSE_cref_mgain_k5_5_PARAMS.tif"));
    }
}
