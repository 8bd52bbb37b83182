//! Inverse-distance-weighted fill for flagged pixels, used by the
//! `gain_offset` method to replace low-R² offsets with values drawn from
//! their valid neighbors. Search grows outward ring by ring from each
//! flagged pixel rather than scanning the whole array, so cost scales with
//! how far a pixel actually is from valid data instead of array size.

use ndarray::Array2;

/// Fills `values[p]` wherever `flagged[p]` is true, using an inverse-distance
/// weighted average of the nearest valid (non-flagged) pixels within
/// `max_radius`. Pixels with no valid neighbor within `max_radius` are left
/// untouched (caller decides nodata policy for those).
pub fn idw_fill(values: &Array2<f32>, flagged: &Array2<bool>, max_radius: i64) -> Array2<f32> {
    let (h, w) = values.dim();
    let mut out = values.clone();

    for r in 0..h {
        for c in 0..w {
            if !flagged[[r, c]] {
                continue;
            }
            if let Some(filled) = idw_at(values, flagged, (r as i64, c as i64), max_radius) {
                out[[r, c]] = filled;
            }
        }
    }
    out
}

fn idw_at(values: &Array2<f32>, flagged: &Array2<bool>, center: (i64, i64), max_radius: i64) -> Option<f32> {
    let (h, w) = values.dim();
    let (cr, cc) = center;
    let mut weighted_sum = 0f64;
    let mut weight_total = 0f64;
    let mut found_ring_with_data = false;

    for radius in 1..=max_radius {
        for (r, c) in ring(cr, cc, radius) {
            if r < 0 || c < 0 || r as usize >= h || c as usize >= w {
                continue;
            }
            let (ru, cu) = (r as usize, c as usize);
            if flagged[[ru, cu]] {
                continue;
            }
            let dist = (((r - cr).pow(2) + (c - cc).pow(2)) as f64).sqrt();
            let weight = 1.0 / dist.max(1e-6);
            weighted_sum += weight * values[[ru, cu]] as f64;
            weight_total += weight;
            found_ring_with_data = true;
        }
        // Stop at the first ring that contributed any valid pixel: farther
        // rings would only dilute the estimate with more distant samples.
        if found_ring_with_data {
            break;
        }
    }

    if weight_total > 0.0 {
        Some((weighted_sum / weight_total) as f32)
    } else {
        None
    }
}

/// The square ring of pixels at Chebyshev distance exactly `radius` from
/// `(cr, cc)`.
fn ring(cr: i64, cc: i64, radius: i64) -> Vec<(i64, i64)> {
    let mut pts = Vec::with_capacity((8 * radius) as usize);
    for c in (cc - radius)..=(cc + radius) {
        pts.push((cr - radius, c));
        pts.push((cr + radius, c));
    }
    for r in (cr - radius + 1)..=(cr + radius - 1) {
        pts.push((r, cc - radius));
        pts.push((r, cc + radius));
    }
    pts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_from_nearest_valid_neighbors() {
        let values = Array2::from_shape_vec((3, 3), vec![1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        let mut flagged = Array2::from_elem((3, 3), false);
        flagged[[1, 1]] = true;
        let filled = idw_fill(&values, &flagged, 2);
        assert!((filled[[1, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn leaves_pixel_untouched_without_neighbors_in_radius() {
        let values = Array2::from_elem((5, 5), 0.0f32);
        let mut flagged = Array2::from_elem((5, 5), true);
        flagged[[0, 0]] = false;
        let filled = idw_fill(&values, &flagged, 1);
        // (4,4) is Chebyshev distance 4 from the only valid pixel.
        assert_eq!(filled[[4, 4]], 0.0);
    }

    #[test]
    fn unflagged_pixels_are_unchanged() {
        let values = Array2::from_shape_vec((2, 2), vec![5.0, 6.0, 7.0, 8.0]).unwrap();
        let flagged = Array2::from_elem((2, 2), false);
        let filled = idw_fill(&values, &flagged, 2);
        assert_eq!(filled, values);
    }
}
