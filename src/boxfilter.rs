//! Separable box-filter sums: the windowed-sum primitive the kernel model
//! builds its moment accumulation on. Implemented via a summed-area table so
//! each pixel's kernel sum costs O(1) regardless of kernel size, with
//! `BORDER_CONSTANT = 0` semantics (out-of-image contributions are zero,
//! not reflected or clamped).

use ndarray::Array2;

/// Windowed sum of `src` over an odd `(kh, kw)` kernel centered at each
/// pixel, zero-padded at the border.
pub fn box_sum(src: &Array2<f32>, kernel_shape: (usize, usize)) -> Array2<f32> {
    let (h, w) = src.dim();
    let (kh, kw) = kernel_shape;
    debug_assert!(kh % 2 == 1 && kw % 2 == 1, "box_sum kernel must be odd x odd");
    let half_h = (kh / 2) as i64;
    let half_w = (kw / 2) as i64;

    // Summed-area table with a zero row/col of padding so range queries
    // never need a bounds check.
    let mut integral = Array2::<f64>::zeros((h + 1, w + 1));
    for r in 0..h {
        let mut row_sum = 0f64;
        for c in 0..w {
            row_sum += src[[r, c]] as f64;
            integral[[r + 1, c + 1]] = integral[[r, c + 1]] + row_sum;
        }
    }

    let mut out = Array2::<f32>::zeros((h, w));
    for r in 0..h as i64 {
        for c in 0..w as i64 {
            let r0 = (r - half_h).max(0);
            let r1 = (r + half_h + 1).min(h as i64);
            let c0 = (c - half_w).max(0);
            let c1 = (c + half_w + 1).min(w as i64);
            if r0 >= r1 || c0 >= c1 {
                continue;
            }
            let sum = integral[[r1 as usize, c1 as usize]] - integral[[r0 as usize, c1 as usize]]
                - integral[[r1 as usize, c0 as usize]]
                + integral[[r0 as usize, c0 as usize]];
            out[[r as usize, c as usize]] = sum as f32;
        }
    }
    out
}

/// `box_sum` over a boolean mask, counting `true` as 1.
pub fn box_count(mask: &Array2<bool>, kernel_shape: (usize, usize)) -> Array2<f32> {
    let float_mask = mask.mapv(|m| if m { 1.0 } else { 0.0 });
    box_sum(&float_mask, kernel_shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutils::assert_slice_float_eq;

    #[test]
    fn box_sum_uniform_interior_matches_kernel_area() {
        let src = Array2::from_elem((9, 9), 1.0f32);
        let sums = box_sum(&src, (3, 3));
        assert_eq!(sums[[4, 4]], 9.0);
    }

    #[test]
    fn box_sum_zero_pads_at_border() {
        let src = Array2::from_elem((5, 5), 1.0f32);
        let sums = box_sum(&src, (3, 3));
        // Corner pixel only has a 2x2 in-bounds neighborhood.
        assert_eq!(sums[[0, 0]], 4.0);
        assert_eq!(sums[[0, 2]], 6.0);
    }

    #[test]
    fn box_sum_1x1_is_identity() {
        let src = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let sums = box_sum(&src, (1, 1));
        assert_slice_float_eq(sums.as_slice().unwrap(), src.as_slice().unwrap(), 1e-9);
    }

    #[test]
    fn box_count_counts_true_only() {
        let mut mask = Array2::from_elem((3, 3), true);
        mask[[1, 1]] = false;
        let counts = box_count(&mask, (3, 3));
        assert_eq!(counts[[1, 1]], 8.0);
    }
}
