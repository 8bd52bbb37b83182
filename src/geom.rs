//! Pixel/world coordinate vocabulary shared by the raster array, pair reader
//! and kernel model: windows in pixel space, an affine georeferencing
//! transform, and world-space bounding boxes.

/// A rectangular region in pixel space, column/row offset plus width/height.
/// Offsets may be negative and width/height are not required to be positive
/// when a window is still being assembled (callers clip before using it for
/// an actual read).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub col_off: i64,
    pub row_off: i64,
    pub width: i64,
    pub height: i64,
}

impl Window {
    pub fn new(col_off: i64, row_off: i64, width: i64, height: i64) -> Self {
        Window { col_off, row_off, width, height }
    }

    pub fn from_corners(ul_col: i64, ul_row: i64, br_col: i64, br_row: i64) -> Self {
        Window { col_off: ul_col, row_off: ul_row, width: br_col - ul_col, height: br_row - ul_row }
    }

    pub fn col_end(&self) -> i64 {
        self.col_off + self.width
    }

    pub fn row_end(&self) -> i64 {
        self.row_off + self.height
    }

    /// Clip this window to the (0,0)-(width,height) bounds of a raster.
    pub fn clip_to(&self, width: i64, height: i64) -> Window {
        let col_off = self.col_off.max(0);
        let row_off = self.row_off.max(0);
        let col_end = self.col_end().min(width);
        let row_end = self.row_end().min(height);
        Window::from_corners(col_off, row_off, col_end.max(col_off), row_end.max(row_off))
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// True if this window touches the boundary of a raster of the given shape.
    pub fn touches_edge(&self, width: i64, height: i64) -> bool {
        self.col_off <= 0 || self.row_off <= 0 || self.col_end() >= width || self.row_end() >= height
    }
}

/// Affine georeferencing transform, GDAL's 6-coefficient convention:
/// `x = origin_x + col*pixel_width + row*row_rotation`
/// `y = origin_y + col*col_rotation + row*pixel_height`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub row_rotation: f64,
    pub origin_y: f64,
    pub col_rotation: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        GeoTransform {
            origin_x: gt[0],
            pixel_width: gt[1],
            row_rotation: gt[2],
            origin_y: gt[3],
            col_rotation: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(self) -> [f64; 6] {
        [self.origin_x, self.pixel_width, self.row_rotation, self.origin_y, self.col_rotation, self.pixel_height]
    }

    /// Offset this transform so that pixel (0,0) of the returned transform
    /// corresponds to pixel `(window.col_off, window.row_off)` of `self`.
    pub fn windowed(&self, window: &Window) -> GeoTransform {
        let (x, y) = self.pixel_to_world(window.col_off as f64, window.row_off as f64);
        GeoTransform { origin_x: x, origin_y: y, ..*self }
    }

    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.origin_x + col * self.pixel_width + row * self.row_rotation;
        let y = self.origin_y + col * self.col_rotation + row * self.pixel_height;
        (x, y)
    }

    /// Inverse of [`Self::pixel_to_world`]. Fails only for a degenerate
    /// (non-invertible) transform, which never occurs for a valid raster.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.row_rotation * self.col_rotation;
        let dx = x - self.origin_x;
        let dy = y - self.origin_y;
        let col = (dx * self.pixel_height - dy * self.row_rotation) / det;
        let row = (dy * self.pixel_width - dx * self.col_rotation) / det;
        (col, row)
    }

    /// Resolution as `(|pixel_width|, |pixel_height|)`.
    pub fn resolution(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }
}

/// A world-space bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn from_window(window: &Window, transform: &GeoTransform) -> BoundingBox {
        let corners = [
            transform.pixel_to_world(window.col_off as f64, window.row_off as f64),
            transform.pixel_to_world(window.col_end() as f64, window.row_off as f64),
            transform.pixel_to_world(window.col_off as f64, window.row_end() as f64),
            transform.pixel_to_world(window.col_end() as f64, window.row_end() as f64),
        ];
        Self::from_points(&corners)
    }

    pub fn from_points(points: &[(f64, f64)]) -> BoundingBox {
        let mut xmin = f64::INFINITY;
        let mut ymin = f64::INFINITY;
        let mut xmax = f64::NEG_INFINITY;
        let mut ymax = f64::NEG_INFINITY;
        for &(x, y) in points {
            xmin = xmin.min(x);
            ymin = ymin.min(y);
            xmax = xmax.max(x);
            ymax = ymax.max(y);
        }
        BoundingBox { xmin, ymin, xmax, ymax }
    }

    fn pixel_corner_bounds(&self, transform: &GeoTransform) -> (f64, f64, f64, f64) {
        let corners = [
            transform.world_to_pixel(self.xmin, self.ymin),
            transform.world_to_pixel(self.xmax, self.ymin),
            transform.world_to_pixel(self.xmin, self.ymax),
            transform.world_to_pixel(self.xmax, self.ymax),
        ];
        let mut col_min = f64::INFINITY;
        let mut row_min = f64::INFINITY;
        let mut col_max = f64::NEG_INFINITY;
        let mut row_max = f64::NEG_INFINITY;
        for &(c, r) in &corners {
            col_min = col_min.min(c);
            row_min = row_min.min(r);
            col_max = col_max.max(c);
            row_max = row_max.max(r);
        }
        (col_min, row_min, col_max, row_max)
    }

    /// Pixel-space window (in `transform`'s grid) covering this bounding box,
    /// expanded outward to the enclosing integer cells. Use for a window that
    /// must have full support (a halo, a kernel footprint).
    pub fn to_window(&self, transform: &GeoTransform) -> Window {
        let (col_min, row_min, col_max, row_max) = self.pixel_corner_bounds(transform);
        Window::new(col_min.floor() as i64, row_min.floor() as i64, (col_max - col_min).ceil() as i64, (row_max - row_min).ceil() as i64)
    }

    /// Pixel-space window covering this bounding box, rounded to the nearest
    /// integer cell rather than expanded outward. Use for an output tile
    /// boundary, where neighbouring tiles must abut with no gap or overlap.
    pub fn to_window_rounded(&self, transform: &GeoTransform) -> Window {
        let (col_min, row_min, col_max, row_max) = self.pixel_corner_bounds(transform);
        Window::from_corners(col_min.round() as i64, row_min.round() as i64, col_max.round() as i64, row_max.round() as i64)
    }

    /// True if `self` covers `other` (with GDAL-style inclusive boundary).
    pub fn covers(&self, other: &BoundingBox) -> bool {
        self.xmin <= other.xmin && self.ymin <= other.ymin && self.xmax >= other.xmax && self.ymax >= other.ymax
    }
}

/// Expands a window outward by `expand.0` rows and `expand.1` columns on
/// each side, e.g. to grow a read window by a kernel's half-width so the
/// kernel has full support at the edge of the region of interest.
pub fn expand_window_to_grid(win: Window, expand: (i64, i64)) -> Window {
    Window::from_corners(win.col_off - expand.1, win.row_off - expand.0, win.col_end() + expand.1, win.row_end() + expand.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutils::assert_float_eq;

    #[test]
    fn pixel_world_roundtrip() {
        let gt = GeoTransform::from_gdal([100.0, 2.0, 0.0, 200.0, 0.0, -2.0]);
        let (x, y) = gt.pixel_to_world(5.0, 3.0);
        let (col, row) = gt.world_to_pixel(x, y);
        assert_float_eq(col, 5.0, 1e-9);
        assert_float_eq(row, 3.0, 1e-9);
    }

    #[test]
    fn bounding_box_covers() {
        let outer = BoundingBox { xmin: 0.0, ymin: 0.0, xmax: 10.0, ymax: 10.0 };
        let inner = BoundingBox { xmin: 1.0, ymin: 1.0, xmax: 9.0, ymax: 9.0 };
        assert!(outer.covers(&inner));
        assert!(!inner.covers(&outer));
    }

    #[test]
    fn window_touches_edge() {
        let w = Window::new(0, 5, 10, 10);
        assert!(w.touches_edge(100, 100));
        let w2 = Window::new(5, 5, 10, 10);
        assert!(!w2.touches_edge(100, 100));
    }
}
