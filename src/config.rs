//! Tagged-variant configuration types recognized by the fusion driver.
//! Parsing a config file into these types is an external collaborator's job;
//! this module only defines the shapes and their defaults.

use std::collections::HashMap;

#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Gain,
    GainBlkOffset,
    GainOffset,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Gain => "gain",
            Method::GainBlkOffset => "gain_blk_offset",
            Method::GainOffset => "gain_offset",
        }
    }

    /// Number of parameter bands this method produces: `[gain]`,
    /// `[gain, offset]`, or `[gain, offset, r2]`.
    pub fn param_band_count(&self) -> usize {
        match self {
            Method::Gain => 1,
            Method::GainBlkOffset => 2,
            Method::GainOffset => 3,
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcCrs {
    Src,
    Ref,
    Auto,
}

impl ProcCrs {
    pub fn name(&self) -> &'static str {
        match self {
            ProcCrs::Src => "src",
            ProcCrs::Ref => "ref",
            ProcCrs::Auto => "auto",
        }
    }
}

/// Resampling algorithms recognized at the config boundary; mapped onto
/// `gdal::raster::ResampleAlg` at the point of use.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resampling {
    NearestNeighbour,
    Bilinear,
    CubicSpline,
    Average,
    Lanczos,
}

impl Resampling {
    pub fn to_gdal(self) -> gdal::raster::ResampleAlg {
        use gdal::raster::ResampleAlg::*;
        match self {
            Resampling::NearestNeighbour => NearestNeighbour,
            Resampling::Bilinear => Bilinear,
            Resampling::CubicSpline => CubicSpline,
            Resampling::Average => Average,
            Resampling::Lanczos => Lanczos,
        }
    }
}

/// Top-level driver configuration: parameter image output and concurrency.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct HomoConfig {
    pub param_image: bool,
    /// 0 means "use all CPUs".
    pub threads: usize,
    pub max_block_mem: f64,
}

impl Default for HomoConfig {
    fn default() -> Self {
        HomoConfig { param_image: false, threads: 0, max_block_mem: 100.0 }
    }
}

/// Controls over the fitted linear model: resampling and R²-gated offset
/// inpainting.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub upsampling: Resampling,
    pub downsampling: Resampling,
    pub r2_inpaint_thresh: f64,
    pub mask_partial: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            upsampling: Resampling::CubicSpline,
            downsampling: Resampling::Average,
            r2_inpaint_thresh: 0.0,
            mask_partial: false,
        }
    }
}

impl ModelConfig {
    /// `FUSE_MODEL_<KEY>` metadata tags describing this model for the
    /// output dataset.
    pub fn as_tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("UPSAMPLING".to_string(), format!("{:?}", self.upsampling));
        tags.insert("DOWNSAMPLING".to_string(), format!("{:?}", self.downsampling));
        tags.insert("R2_INPAINT_THRESH".to_string(), self.r2_inpaint_thresh.to_string());
        tags.insert("MASK_PARTIAL".to_string(), self.mask_partial.to_string());
        tags
    }
}

/// Output dataset driver, pixel type, nodata value and creation options.
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub driver: String,
    pub dtype: String,
    pub nodata: f64,
    pub creation_options: HashMap<String, String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let mut creation_options = HashMap::new();
        creation_options.insert("TILED".to_string(), "YES".to_string());
        creation_options.insert("BLOCKXSIZE".to_string(), "512".to_string());
        creation_options.insert("BLOCKYSIZE".to_string(), "512".to_string());
        creation_options.insert("COMPRESS".to_string(), "DEFLATE".to_string());
        creation_options.insert("INTERLEAVE".to_string(), "BAND".to_string());
        OutputConfig { driver: "GTiff".to_string(), dtype: "Float32".to_string(), nodata: f64::NAN, creation_options }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_param_band_counts() {
        assert_eq!(Method::Gain.param_band_count(), 1);
        assert_eq!(Method::GainBlkOffset.param_band_count(), 2);
        assert_eq!(Method::GainOffset.param_band_count(), 3);
    }

    #[test]
    fn default_configs_are_sane() {
        let homo = HomoConfig::default();
        assert_eq!(homo.threads, 0);
        let model = ModelConfig::default();
        assert_eq!(model.r2_inpaint_thresh, 0.0);
        assert!(!model.mask_partial);
    }
}
