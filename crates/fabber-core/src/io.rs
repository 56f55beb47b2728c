//! Voxel data loading and saving.
//!
//! The engine works on a T×V data matrix: one column of T timepoints per
//! voxel inside the mask, plus integer lattice coordinates for each voxel.
//! On disk, volumes are 4-D `.npy` arrays laid out (x, y, z, t); masks are
//! 3-D arrays where a voxel is selected when its value is > 0.
//!
//! Multiple data files (`--data1`, `--data2`, …) are combined according to
//! `--data-order`: `interleave` takes the first volume from each file, then
//! the second, and so on; `concatenate` appends whole files; `singlefile`
//! requires exactly one file. A lone `--data` behaves as `singlefile`.
//!
//! Result volumes are written back through the mask, with voxels outside
//! the mask left at zero.

use std::fs::File;
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, DVector};
use ndarray::{Array3, Array4};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use tracing::info;

use crate::error::{FabberError, FabberResult};
use crate::options::RunOptions;

/// How multiple data files are merged into one timeseries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrder {
    /// First volume from each file, then second from each, etc.
    Interleave,
    /// Whole files appended one after the other.
    Concatenate,
    /// Exactly one file, used as-is.
    SingleFile,
}

impl DataOrder {
    /// Parse the `--data-order` option value.
    pub fn from_option(value: &str) -> FabberResult<Self> {
        match value {
            "interleave" => Ok(Self::Interleave),
            "concatenate" => Ok(Self::Concatenate),
            "singlefile" => Ok(Self::SingleFile),
            other => Err(FabberError::invalid_option(
                "data-order",
                other,
                "value not recognized (interleave, concatenate, singlefile)",
            )),
        }
    }
}

/// The masked data a run operates on.
#[derive(Debug, Clone)]
pub struct VoxelData {
    /// T×V data matrix: one column per voxel
    main: DMatrix<f64>,
    /// Lattice coordinates of each voxel
    coords: Vec<[i32; 3]>,
    /// Full volume extent (nx, ny, nz), for output reinflation
    extent: [usize; 3],
}

impl VoxelData {
    /// Wrap a T×V matrix whose voxels cover a full (nx, ny, nz) grid.
    ///
    /// Coordinates are generated in the same x-major order used when
    /// flattening volumes.
    pub fn from_matrix(main: DMatrix<f64>, extent: [usize; 3]) -> FabberResult<Self> {
        let n_voxels = extent[0] * extent[1] * extent[2];
        if main.ncols() != n_voxels {
            return Err(FabberError::dimension_mismatch(
                "voxel data",
                format!("{n_voxels} voxels for extent {extent:?}"),
                main.ncols().to_string(),
            ));
        }
        let mut coords = Vec::with_capacity(n_voxels);
        for x in 0..extent[0] {
            for y in 0..extent[1] {
                for z in 0..extent[2] {
                    coords.push([x as i32, y as i32, z as i32]);
                }
            }
        }
        Ok(Self {
            main,
            coords,
            extent,
        })
    }

    /// Wrap a T×V matrix with explicit voxel coordinates.
    pub fn from_matrix_with_coords(
        main: DMatrix<f64>,
        coords: Vec<[i32; 3]>,
        extent: [usize; 3],
    ) -> FabberResult<Self> {
        if main.ncols() != coords.len() {
            return Err(FabberError::dimension_mismatch(
                "voxel coordinates",
                main.ncols().to_string(),
                coords.len().to_string(),
            ));
        }
        Ok(Self {
            main,
            coords,
            extent,
        })
    }

    /// Number of timepoints T.
    #[must_use]
    pub fn n_timepoints(&self) -> usize {
        self.main.nrows()
    }

    /// Number of voxels V.
    #[must_use]
    pub fn n_voxels(&self) -> usize {
        self.main.ncols()
    }

    /// The T×V data matrix.
    #[must_use]
    pub fn main(&self) -> &DMatrix<f64> {
        &self.main
    }

    /// The timeseries of one voxel.
    #[must_use]
    pub fn voxel_timeseries(&self, voxel: usize) -> DVector<f64> {
        self.main.column(voxel).into_owned()
    }

    /// Lattice coordinates of every voxel.
    #[must_use]
    pub fn coords(&self) -> &[[i32; 3]] {
        &self.coords
    }

    /// Lattice coordinates of one voxel.
    #[must_use]
    pub fn coord(&self, voxel: usize) -> [i32; 3] {
        self.coords[voxel]
    }

    /// Full volume extent (nx, ny, nz).
    #[must_use]
    pub fn extent(&self) -> [usize; 3] {
        self.extent
    }
}

fn open_npy(path: &Path) -> FabberResult<File> {
    if !path.exists() {
        return Err(FabberError::data_not_found(path.display().to_string()));
    }
    File::open(path).map_err(|e| FabberError::data_load(path, e.to_string()))
}

/// Read a 4-D (x, y, z, t) volume from a `.npy` file.
pub fn read_volume4(path: &Path) -> FabberResult<Array4<f64>> {
    let file = open_npy(path)?;
    Array4::<f64>::read_npy(file).map_err(|e| FabberError::data_load(path, e.to_string()))
}

/// Read a 3-D (x, y, z) volume from a `.npy` file.
pub fn read_volume3(path: &Path) -> FabberResult<Array3<f64>> {
    let file = open_npy(path)?;
    Array3::<f64>::read_npy(file).map_err(|e| FabberError::data_load(path, e.to_string()))
}

/// Flatten a 4-D volume to a T×V matrix over the masked voxels.
///
/// Voxels are visited x-major (x outermost, z innermost), matching the
/// coordinate order produced everywhere else in this module.
fn flatten_masked(vol: &Array4<f64>, mask: Option<&Array3<f64>>) -> (DMatrix<f64>, Vec<[i32; 3]>) {
    let (nx, ny, nz, nt) = vol.dim();
    let mut columns: Vec<f64> = Vec::new();
    let mut coords = Vec::new();
    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                if let Some(m) = mask {
                    if m[[x, y, z]] <= 0.0 {
                        continue;
                    }
                }
                coords.push([x as i32, y as i32, z as i32]);
                for t in 0..nt {
                    columns.push(vol[[x, y, z, t]]);
                }
            }
        }
    }
    let n_voxels = coords.len();
    // Columns were pushed voxel-by-voxel, so build column-major directly
    let main = DMatrix::from_vec(nt, n_voxels, columns);
    (main, coords)
}

/// Combine per-file T×V matrices according to the data order.
fn combine_matrices(sets: &[DMatrix<f64>], order: DataOrder) -> FabberResult<DMatrix<f64>> {
    match order {
        DataOrder::SingleFile => {
            if sets.len() > 1 {
                return Err(FabberError::invalid_option(
                    "data-order",
                    "singlefile",
                    "more than one file specified",
                ));
            }
            Ok(sets[0].clone())
        }
        DataOrder::Concatenate => {
            let n_voxels = sets[0].ncols();
            let total: usize = sets.iter().map(DMatrix::nrows).sum();
            let mut out = DMatrix::zeros(total, n_voxels);
            let mut row = 0;
            for set in sets {
                out.rows_mut(row, set.nrows()).copy_from(set);
                row += set.nrows();
            }
            Ok(out)
        }
        DataOrder::Interleave => {
            let n_times = sets[0].nrows();
            let n_voxels = sets[0].ncols();
            for set in sets {
                if set.nrows() != n_times {
                    return Err(FabberError::invalid_option(
                        "data-order",
                        "interleave",
                        "data sets must all have the same number of time points",
                    ));
                }
            }
            let n_sets = sets.len();
            let mut out = DMatrix::zeros(n_times * n_sets, n_voxels);
            for i in 0..n_times {
                for (j, set) in sets.iter().enumerate() {
                    out.row_mut(n_sets * i + j).copy_from(&set.row(i));
                }
            }
            Ok(out)
        }
    }
}

/// Load the main voxel data, mask, and coordinates described by the run
/// options.
pub fn load_voxel_data(options: &RunOptions) -> FabberResult<VoxelData> {
    // Optional mask volume
    let mask_file = options.get_str_default("mask", "");
    let mask = if mask_file.is_empty() {
        None
    } else {
        info!("Loading mask data from '{mask_file}'");
        Some(read_volume3(Path::new(mask_file))?)
    };

    // Collect the data file paths
    let mut paths: Vec<PathBuf> = Vec::new();
    let single = options.have_key("data");
    if single {
        paths.push(PathBuf::from(options.get_str("data")?));
    } else {
        let mut n = 1;
        while options.have_key(&format!("data{n}")) {
            paths.push(PathBuf::from(options.get_str(&format!("data{n}"))?));
            n += 1;
        }
    }
    if paths.is_empty() {
        return Err(FabberError::data_not_found("data"));
    }

    // A lone --data is used as-is; multi-file runs default to interleave
    let order = if single && !options.have_key("data-order") {
        DataOrder::SingleFile
    } else {
        DataOrder::from_option(options.get_str_default("data-order", "interleave"))?
    };

    let mut extent = None;
    let mut sets = Vec::new();
    let mut coords = Vec::new();
    for path in &paths {
        info!("Loading data from '{}'", path.display());
        let vol = read_volume4(path)?;
        let (nx, ny, nz, nt) = vol.dim();
        info!("Dimensions: x={nx}, y={ny}, z={nz}, vols={nt}");
        match extent {
            None => {
                if let Some(m) = &mask {
                    if m.dim() != (nx, ny, nz) {
                        return Err(FabberError::dimension_mismatch(
                            "mask vs data",
                            format!("{:?}", m.dim()),
                            format!("{:?}", (nx, ny, nz)),
                        ));
                    }
                }
                extent = Some([nx, ny, nz]);
            }
            Some(e) if e != [nx, ny, nz] => {
                return Err(FabberError::dimension_mismatch(
                    format!("data file '{}'", path.display()),
                    format!("{e:?}"),
                    format!("{:?}", [nx, ny, nz]),
                ));
            }
            Some(_) => {}
        }
        let (matrix, file_coords) = flatten_masked(&vol, mask.as_ref());
        sets.push(matrix);
        coords = file_coords;
    }

    let main = combine_matrices(&sets, order)?;
    info!(
        "Done loading data, size = {} timepoints by {} voxels",
        main.nrows(),
        main.ncols()
    );
    VoxelData::from_matrix_with_coords(main, coords, extent.unwrap_or([0, 0, 0]))
}

/// Load a 3-D image volume and extract its value at every masked voxel.
///
/// Used for image priors, where an external volume supplies a per-voxel
/// prior mean.
pub fn load_image_vector(path: &Path, data: &VoxelData) -> FabberResult<DVector<f64>> {
    let vol = read_volume3(path)?;
    let extent = data.extent();
    if vol.dim() != (extent[0], extent[1], extent[2]) {
        return Err(FabberError::dimension_mismatch(
            format!("image volume '{}'", path.display()),
            format!("{extent:?}"),
            format!("{:?}", vol.dim()),
        ));
    }
    Ok(DVector::from_fn(data.n_voxels(), |v, _| {
        let [x, y, z] = data.coord(v);
        vol[[x as usize, y as usize, z as usize]]
    }))
}

/// Write an R×V result matrix back into a 4-D volume `.npy` file.
///
/// Voxels outside the mask are written as zero. The file is named
/// `<name>.npy` under `dir`.
pub fn write_volume(
    dir: &Path,
    name: &str,
    rows: &DMatrix<f64>,
    data: &VoxelData,
) -> FabberResult<PathBuf> {
    if rows.ncols() != data.n_voxels() {
        return Err(FabberError::dimension_mismatch(
            format!("output '{name}'"),
            data.n_voxels().to_string(),
            rows.ncols().to_string(),
        ));
    }
    let [nx, ny, nz] = data.extent();
    let n_rows = rows.nrows();
    let mut vol = Array4::<f64>::zeros((nx.max(1), ny.max(1), nz.max(1), n_rows));
    for (v, coord) in data.coords().iter().enumerate() {
        let [x, y, z] = *coord;
        for r in 0..n_rows {
            vol[[x as usize, y as usize, z as usize, r]] = rows[(r, v)];
        }
    }
    let path = dir.join(format!("{name}.npy"));
    info!("Saving volume: {}", path.display());
    let file = File::create(&path).map_err(|e| FabberError::data_load(&path, e.to_string()))?;
    vol.write_npy(file)
        .map_err(|e| FabberError::data_load(&path, e.to_string()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn write_npy4(path: &Path, vol: &Array4<f64>) {
        vol.write_npy(File::create(path).unwrap()).unwrap();
    }

    fn write_npy3(path: &Path, vol: &Array3<f64>) {
        vol.write_npy(File::create(path).unwrap()).unwrap();
    }

    #[test]
    fn test_single_file_load_without_mask() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.npy");
        let mut vol = Array4::<f64>::zeros((2, 1, 1, 3));
        for t in 0..3 {
            vol[[0, 0, 0, t]] = t as f64;
            vol[[1, 0, 0, t]] = 10.0 + t as f64;
        }
        write_npy4(&path, &vol);

        let mut opts = RunOptions::new();
        opts.set("data", path.to_str().unwrap());
        let data = load_voxel_data(&opts).unwrap();

        assert_eq!(data.n_voxels(), 2);
        assert_eq!(data.n_timepoints(), 3);
        assert_relative_eq!(data.main()[(2, 1)], 12.0);
        assert_eq!(data.coord(0), [0, 0, 0]);
        assert_eq!(data.coord(1), [1, 0, 0]);
    }

    #[test]
    fn test_mask_selects_voxels() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data.npy");
        let mask_path = dir.path().join("mask.npy");

        let mut vol = Array4::<f64>::zeros((2, 2, 1, 2));
        vol[[1, 1, 0, 0]] = 5.0;
        write_npy4(&data_path, &vol);

        let mut mask = Array3::<f64>::zeros((2, 2, 1));
        mask[[1, 1, 0]] = 1.0;
        write_npy3(&mask_path, &mask);

        let mut opts = RunOptions::new();
        opts.set("data", data_path.to_str().unwrap());
        opts.set("mask", mask_path.to_str().unwrap());
        let data = load_voxel_data(&opts).unwrap();

        assert_eq!(data.n_voxels(), 1);
        assert_eq!(data.coord(0), [1, 1, 0]);
        assert_relative_eq!(data.main()[(0, 0)], 5.0);
    }

    #[test]
    fn test_missing_file_is_data_not_found() {
        let mut opts = RunOptions::new();
        opts.set("data", "/nonexistent/path.npy");
        let err = load_voxel_data(&opts).unwrap_err();
        assert!(matches!(err, FabberError::DataNotFound { .. }));
    }

    #[test]
    fn test_interleave_combines_alternating_volumes() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_row_slice(2, 1, &[10.0, 20.0]);
        let out = combine_matrices(&[a, b], DataOrder::Interleave).unwrap();
        assert_eq!(out.nrows(), 4);
        assert_relative_eq!(out[(0, 0)], 1.0);
        assert_relative_eq!(out[(1, 0)], 10.0);
        assert_relative_eq!(out[(2, 0)], 2.0);
        assert_relative_eq!(out[(3, 0)], 20.0);
    }

    #[test]
    fn test_interleave_rejects_unequal_lengths() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]);
        assert!(combine_matrices(&[a, b], DataOrder::Interleave).is_err());
    }

    #[test]
    fn test_interleave_is_order_equivariant() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_row_slice(2, 1, &[10.0, 20.0]);
        let ab = combine_matrices(&[a.clone(), b.clone()], DataOrder::Interleave).unwrap();
        let ba = combine_matrices(&[b, a], DataOrder::Interleave).unwrap();
        // Swapping the file order swaps the corresponding timepoints
        for i in 0..2 {
            assert_relative_eq!(ab[(2 * i, 0)], ba[(2 * i + 1, 0)]);
            assert_relative_eq!(ab[(2 * i + 1, 0)], ba[(2 * i, 0)]);
        }
    }

    #[test]
    fn test_concatenate_appends_files() {
        let a = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let b = DMatrix::from_row_slice(1, 1, &[3.0]);
        let out = combine_matrices(&[a, b], DataOrder::Concatenate).unwrap();
        assert_eq!(out.nrows(), 3);
        assert_relative_eq!(out[(2, 0)], 3.0);
    }

    #[test]
    fn test_singlefile_rejects_multiple_files() {
        let a = DMatrix::zeros(2, 1);
        let b = DMatrix::zeros(2, 1);
        assert!(combine_matrices(&[a, b], DataOrder::SingleFile).is_err());
    }

    #[test]
    fn test_volume_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = VoxelData::from_matrix(DMatrix::zeros(3, 4), [2, 2, 1]).unwrap();

        let rows = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let path = write_volume(dir.path(), "mean_c0", &rows, &data).unwrap();

        let back = read_volume4(&path).unwrap();
        assert_eq!(back.dim(), (2, 2, 1, 2));
        // Voxel 3 is at (1, 1, 0) in x-major order
        assert_relative_eq!(back[[1, 1, 0, 0]], 4.0);
        assert_relative_eq!(back[[1, 1, 0, 1]], 8.0);
    }

    #[test]
    fn test_image_vector_respects_mask_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.npy");
        let mut img = Array3::<f64>::zeros((2, 1, 1));
        img[[0, 0, 0]] = 7.0;
        img[[1, 0, 0]] = 9.0;
        write_npy3(&path, &img);

        let data = VoxelData::from_matrix(DMatrix::zeros(2, 2), [2, 1, 1]).unwrap();
        let vec = load_image_vector(&path, &data).unwrap();
        assert_relative_eq!(vec[0], 7.0);
        assert_relative_eq!(vec[1], 9.0);
    }
}
