//! The fusion driver: owns the output (and optional parameter) datasets,
//! schedules block processing across a bounded pool of blocking tasks, and
//! writes metadata and overviews once processing completes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use gdal::raster::RasterCreationOption;
use gdal::{Dataset, DriverManager, Metadata};
use log::info;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{HomoConfig, Method, ModelConfig, OutputConfig, ProcCrs};
use crate::error::{RastFuseError, Result};
use crate::kernel_model::{KernelModel, KernelModelConfig};
use crate::raster_pair::{BlockPair, RasterPairReader, ResolvedProcCrs};
use crate::utils::{create_out_postfix, create_param_filename, non_alpha_band_indexes, resolve_thread_count};

const DEFAULT_MAX_OVERVIEW_LEVEL: u32 = 8;
const MIN_OVERVIEW_SIZE: u32 = 256;

pub enum OutputTarget {
    Directory(PathBuf),
    File(PathBuf),
}

pub struct RasterFuse {
    reader: Arc<RasterPairReader>,
    kernel_model: Arc<KernelModel>,
    homo: HomoConfig,
    out_dataset: Arc<Mutex<Dataset>>,
    param_dataset: Option<Arc<Mutex<Dataset>>>,
    src_band_count: usize,
    out_path: PathBuf,
    param_path: Option<PathBuf>,
}

fn creation_options(opts: &HashMap<String, String>) -> Vec<RasterCreationOption<'_>> {
    opts.iter()
        .map(|(key, value)| RasterCreationOption { key, value })
        .collect()
}

impl RasterFuse {
    /// Opens the source/reference pair, resolves the output path(s), and
    /// creates the output (and optional parameter) datasets up front.
    pub fn create(
        src_path: &Path,
        ref_path: &Path,
        out: OutputTarget,
        method: Method,
        kernel_shape: (usize, usize),
        proc_crs: ProcCrs,
        homo: HomoConfig,
        model: ModelConfig,
        output: OutputConfig,
        overwrite: bool,
    ) -> Result<Self> {
        let reader = RasterPairReader::open(src_path, ref_path, proc_crs)?;
        let src_band_count = reader.src_bands.len();

        let resolved_proc_crs_name = match reader.proc_crs() {
            ResolvedProcCrs::Src => "src",
            ResolvedProcCrs::Ref => "ref",
        };

        let out_path = match out {
            OutputTarget::File(path) => path,
            OutputTarget::Directory(dir) => create_out_postfix(src_path, &dir, resolved_proc_crs_name, method, kernel_shape, ".tif"),
        };
        if out_path.exists() && !overwrite {
            return Err(RastFuseError::FileExists(out_path));
        }
        let param_path = if homo.param_image {
            let p = create_param_filename(&out_path);
            if p.exists() && !overwrite {
                return Err(RastFuseError::FileExists(p));
            }
            Some(p)
        } else {
            None
        };

        let src_ds = Dataset::open(src_path)?;
        let (src_w, src_h) = src_ds.raster_size();

        let driver = DriverManager::get_driver_by_name(&output.driver)?;
        let options = creation_options(&output.creation_options);
        let mut out_ds = driver.create_with_band_type_with_options::<f32, _>(
            &out_path,
            src_w as isize,
            src_h as isize,
            src_band_count as isize,
            &options,
        )?;
        out_ds.set_spatial_ref(&src_ds.spatial_ref()?)?;
        out_ds.set_geo_transform(&src_ds.geo_transform()?)?;
        for i in 1..=src_band_count {
            let mut band = out_ds.rasterband(i as isize)?;
            band.set_no_data_value(Some(output.nodata))?;
        }

        let param_dataset = if let Some(ref p) = param_path {
            let proc_ds = match reader.proc_crs() {
                ResolvedProcCrs::Src => Dataset::open(src_path)?,
                ResolvedProcCrs::Ref => Dataset::open(ref_path)?,
            };
            let (pw, ph) = proc_ds.raster_size();
            let param_bands = src_band_count * method.param_band_count();
            let mut param_ds = driver.create_with_band_type_with_options::<f32, _>(p, pw as isize, ph as isize, param_bands as isize, &options)?;
            param_ds.set_spatial_ref(&proc_ds.spatial_ref()?)?;
            param_ds.set_geo_transform(&proc_ds.geo_transform()?)?;
            for i in 1..=param_bands {
                let mut band = param_ds.rasterband(i as isize)?;
                band.set_no_data_value(Some(f64::NAN))?;
            }
            Some(Arc::new(Mutex::new(param_ds)))
        } else {
            None
        };

        let kernel_model = KernelModel::new(KernelModelConfig {
            method,
            kernel_shape,
            r2_inpaint_thresh: model.r2_inpaint_thresh,
            mask_partial: model.mask_partial,
            upsampling: model.upsampling,
            downsampling: model.downsampling,
            proc_crs: reader.proc_crs(),
        })?;

        let mut fuse = RasterFuse {
            reader: Arc::new(reader),
            kernel_model: Arc::new(kernel_model),
            homo,
            out_dataset: Arc::new(Mutex::new(out_ds)),
            param_dataset,
            src_band_count,
            out_path,
            param_path,
        };
        fuse.set_metadata(src_path, ref_path, resolved_proc_crs_name, method, kernel_shape, &model)?;
        Ok(fuse)
    }

    fn set_metadata(&mut self, src_path: &Path, ref_path: &Path, proc_crs_name: &str, method: Method, kernel_shape: (usize, usize), model: &ModelConfig) -> Result<()> {
        let tags: Vec<(String, String)> = vec![
            ("FUSE_SRC_FILE".to_string(), src_path.display().to_string()),
            ("FUSE_REF_FILE".to_string(), ref_path.display().to_string()),
            ("FUSE_PROC_CRS".to_string(), proc_crs_name.to_string()),
            ("FUSE_METHOD".to_string(), method.as_str().to_string()),
            ("FUSE_KERNEL_SHAPE".to_string(), format!("({}, {})", kernel_shape.0, kernel_shape.1)),
            ("FUSE_MAX_BLOCK_MEM".to_string(), self.homo.max_block_mem.to_string()),
            ("FUSE_THREADS".to_string(), self.homo.threads.to_string()),
        ];
        for (key, value) in &model.as_tags() {
            let tags_extra = (format!("FUSE_MODEL_{key}"), value.clone());
            self.write_tag(&tags_extra.0, &tags_extra.1)?;
        }
        for (key, value) in &tags {
            self.write_tag(key, value)?;
        }

        let src_ds = Dataset::open(src_path)?;
        let ref_ds = Dataset::open(ref_path)?;
        let src_bands = non_alpha_band_indexes(&src_ds)?;
        let ref_bands = non_alpha_band_indexes(&ref_ds)?;
        let mut out_ds = self.out_dataset.lock().expect("output dataset lock poisoned");
        for (i, &src_band) in src_bands.iter().enumerate() {
            if let Some(desc) = src_ds.rasterband(src_band as isize)?.description().ok().filter(|d| !d.is_empty()) {
                out_ds.rasterband((i + 1) as isize)?.set_description(&desc)?;
            }
        }
        drop(out_ds);

        if let Some(param_ds) = &self.param_dataset {
            let mut param_ds = param_ds.lock().expect("param dataset lock poisoned");
            let planes = ["GAIN", "OFFSET", "R2"];
            for (p, plane) in planes.iter().take(method.param_band_count()).enumerate() {
                for (b, &ref_band) in ref_bands.iter().take(self.src_band_count).enumerate() {
                    let band_index = p * self.src_band_count + b + 1;
                    let ref_name = ref_ds
                        .rasterband(ref_band as isize)
                        .ok()
                        .and_then(|band| band.description().ok())
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| format!("band{}", b + 1));
                    param_ds.rasterband(band_index as isize)?.set_description(&format!("{ref_name}_{plane}"))?;
                }
            }
        }
        Ok(())
    }

    fn write_tag(&self, key: &str, value: &str) -> Result<()> {
        let mut out_ds = self.out_dataset.lock().expect("output dataset lock poisoned");
        out_ds.set_metadata_item(key, value, "")?;
        drop(out_ds);
        if let Some(param_ds) = &self.param_dataset {
            param_ds.lock().expect("param dataset lock poisoned").set_metadata_item(key, value, "")?;
        }
        Ok(())
    }

    /// Runs the block processing loop to completion: pulls all block pairs,
    /// dispatches each through `spawn_blocking` bounded by a semaphore sized
    /// to the configured thread count, and re-raises the first task error
    /// encountered (after draining the rest).
    pub async fn process(&self, overlap: (i64, i64), max_block_mem: f64) -> Result<()> {
        let block_shape = self.reader.auto_block_shape(max_block_mem, overlap)?;
        let pairs = self.reader.block_pairs((overlap.0 * 2 + 1, overlap.1 * 2 + 1), block_shape)?;
        let total = pairs.len();

        let threads = resolve_thread_count(self.homo.threads);
        if threads == 1 {
            for pair in &pairs {
                self.process_block(pair)?;
            }
        } else {
            let semaphore = Arc::new(Semaphore::new(threads));
            let mut tasks = JoinSet::new();
            let mut first_error = None;
            let mut pairs = pairs.into_iter();

            loop {
                // Stop submitting new blocks as soon as a task has failed;
                // still drain the ones already in flight.
                if first_error.is_none() {
                    if let Some(pair) = pairs.next() {
                        let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
                        let reader = self.reader.clone();
                        let kernel_model = self.kernel_model.clone();
                        let out_dataset = self.out_dataset.clone();
                        let param_dataset = self.param_dataset.clone();
                        let src_band_count = self.src_band_count;
                        tasks.spawn_blocking(move || {
                            let _permit = permit;
                            process_block_static(&reader, &kernel_model, &out_dataset, &param_dataset, src_band_count, &pair)
                        });
                        continue;
                    }
                }
                let Some(result) = tasks.join_next().await else { break };
                let outcome = result.expect("worker task panicked");
                if let Err(e) = outcome {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        info!("processed {total} blocks");
        Ok(())
    }

    fn process_block(&self, pair: &BlockPair) -> Result<()> {
        process_block_static(&self.reader, &self.kernel_model, &self.out_dataset, &self.param_dataset, self.src_band_count, pair)
    }

    /// Builds power-of-two overview levels down to `MIN_OVERVIEW_SIZE`, up
    /// to `DEFAULT_MAX_OVERVIEW_LEVEL` levels, using average resampling.
    pub fn build_overviews(&self) -> Result<()> {
        for ds in [Some(&self.out_dataset), self.param_dataset.as_ref()].into_iter().flatten() {
            let mut ds = ds.lock().expect("dataset lock poisoned");
            let (w, h) = ds.raster_size();
            let mut levels = Vec::new();
            let mut level = 2u32;
            while levels.len() < DEFAULT_MAX_OVERVIEW_LEVEL as usize && (w as u32 / level) >= MIN_OVERVIEW_SIZE && (h as u32 / level) >= MIN_OVERVIEW_SIZE {
                levels.push(level as i32);
                level *= 2;
            }
            if !levels.is_empty() {
                ds.build_overviews("AVERAGE", &levels, &[])?;
            }
        }
        Ok(())
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn param_path(&self) -> Option<&Path> {
        self.param_path.as_deref()
    }
}

fn process_block_static(
    reader: &RasterPairReader,
    kernel_model: &KernelModel,
    out_dataset: &Mutex<Dataset>,
    param_dataset: &Option<Arc<Mutex<Dataset>>>,
    src_band_count: usize,
    pair: &BlockPair,
) -> Result<()> {
    let (src_ra, ref_ra) = reader.read(pair)?;
    let param = kernel_model.fit(&src_ra, &ref_ra)?;
    let corrected = kernel_model.apply(&src_ra, &param)?;

    {
        let out_ds = out_dataset.lock().expect("output dataset lock poisoned");
        corrected.to_dataset(&out_ds, &[pair.band_index], Some(&pair.src_out))?;
    }

    if let Some(param_ds) = param_dataset {
        let indexes: Vec<usize> = (0..param.count()).map(|p| p * src_band_count + pair.band_position + 1).collect();
        let param_ds = param_ds.lock().expect("param dataset lock poisoned");
        param.to_dataset(&param_ds, &indexes, Some(&pair.ref_out))?;
    }

    Ok(())
}
