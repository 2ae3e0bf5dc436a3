/*
This code is part of the WhiteboxTools geospatial analysis library.
Authors: Dr. John Lindsay
Created: 12/06/2023
Last Modified: 21/07/2023
License: MIT
*/

use crate::point_data::{ColourData, NormalData, Point3D, PointData};
use nalgebra::Vector3;
use std::collections::HashMap;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// The combined position and colour dispersion of a supervoxel: one variance
/// value for each spatial axis and one for each colour channel, each the mean
/// squared deviation of the member points from the representative centroid
/// and colour. Colour variances are f64 regardless of the channel storage
/// width, since a squared channel deviation can exceed the channel range.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub struct CentroidVariance {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

/// Data structure representing a supervoxel, i.e. a region of spatially and
/// perceptually similar points within a segmented point cloud. The clustering
/// process that decides point membership populates the representative values
/// and the member point set; a subsequent call to `finalize` computes the
/// friction, normal, and centroid statistics of the region, after which the
/// supervoxel is treated as read-only by downstream consumers.
#[derive(Default, Debug, Clone)]
pub struct Supervoxel {
    /// The representative position of the points contained in the supervoxel.
    pub centroid: Point3D,
    /// The representative colour of the points contained in the supervoxel.
    pub colour: ColourData,
    /// The representative surface normal of the points contained in the supervoxel.
    pub normal: NormalData,
    /// The mean friction calculated for the points contained in the supervoxel.
    pub friction: f64,
    point_indices: Vec<usize>,
    friction_variance: f64,
    normal_variance: NormalData,
    centroid_variance: CentroidVariance,
    finalized: bool,
}

impl Supervoxel {
    /// Creates a new empty Supervoxel. The representative fields are set by
    /// the clustering process and the statistics remain unset until
    /// `finalize` is called.
    pub fn new() -> Supervoxel {
        Supervoxel {
            centroid: Point3D::new(0f64, 0f64, 0f64),
            colour: Default::default(),
            normal: NormalData::new(0f64, 0f64, 0f64),
            friction: 0f64,
            point_indices: vec![],
            friction_variance: 0f64,
            normal_variance: NormalData::new(0f64, 0f64, 0f64),
            centroid_variance: Default::default(),
            finalized: false,
        }
    }

    /// Creates a supervoxel from the representative values and member list
    /// produced by an external clustering process, finalizing it before it
    /// is returned. A supervoxel imported through this path can never be
    /// observed with its statistics uncomputed.
    pub fn from_cluster(
        centroid: Point3D,
        colour: ColourData,
        normal: NormalData,
        point_indices: Vec<usize>,
        points: &[PointData],
    ) -> Result<Supervoxel, Error> {
        let mut sv = Supervoxel::new();
        sv.centroid = centroid;
        sv.colour = colour;
        sv.normal = normal;
        sv.point_indices = point_indices;
        sv.finalize(points)?;
        Ok(sv)
    }

    /// Assigns the point at 'index' within the source cloud to this
    /// supervoxel. Population invalidates any previously computed statistics.
    pub fn add_point(&mut self, index: usize) {
        self.point_indices.push(index);
        self.finalized = false;
    }

    /// Assigns each of the points at 'indices' within the source cloud to
    /// this supervoxel.
    pub fn add_points(&mut self, indices: &[usize]) {
        for index in indices {
            self.point_indices.push(*index);
        }
        self.finalized = false;
    }

    /// Returns the number of points assigned to the supervoxel.
    pub fn num_points(&self) -> usize {
        self.point_indices.len()
    }

    /// Returns true if no points have been assigned to the supervoxel.
    pub fn is_empty(&self) -> bool {
        self.point_indices.is_empty()
    }

    /// Returns the indices of the member points, in assignment order.
    pub fn point_indices(&self) -> &[usize] {
        &self.point_indices
    }

    /// Returns true once `finalize` has computed the region statistics.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The friction variance calculated for the points contained in the
    /// supervoxel, or None if the supervoxel has not been finalized.
    pub fn friction_variance(&self) -> Option<f64> {
        if self.finalized {
            return Some(self.friction_variance);
        }
        None
    }

    /// The normal variance calculated for the points contained in the
    /// supervoxel, or None if the supervoxel has not been finalized. Each
    /// axis holds the variance of that axis across the member normals; the
    /// record is not a direction and is not unit length.
    pub fn normal_variance(&self) -> Option<NormalData> {
        if self.finalized {
            return Some(self.normal_variance);
        }
        None
    }

    /// The centroid variance of the supervoxel, in both position and colour,
    /// or None if the supervoxel has not been finalized.
    pub fn centroid_variance(&self) -> Option<CentroidVariance> {
        if self.finalized {
            return Some(self.centroid_variance);
        }
        None
    }

    /// Computes the friction, normal, and centroid statistics of the
    /// supervoxel from its member points in 'points'. The representative
    /// friction is always recomputed as the mean friction of the member
    /// points, replacing any value assigned during clustering; each variance
    /// is the mean squared deviation of the member values from the
    /// corresponding representative value. A supervoxel with a single member
    /// finalizes with all variances equal to zero.
    pub fn finalize(&mut self, points: &[PointData]) -> Result<(), Error> {
        if self.point_indices.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "The supervoxel contains no member points; statistics over an empty region are undefined.",
            ));
        }
        for index in &self.point_indices {
            if *index >= points.len() {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "Member point index {} is beyond the end of the source point cloud ({} points).",
                        index,
                        points.len()
                    ),
                ));
            }
        }

        let (mean, variance) = self.friction_statistics(points);
        self.friction = mean;
        self.friction_variance = variance;
        self.normal_variance = self.compute_normal_variance(points);
        self.centroid_variance = self.compute_centroid_variance(points);
        self.finalized = true;

        Ok(())
    }

    /// Calculates the mean and variance of the member frictions. The
    /// variance is taken about the recomputed mean.
    fn friction_statistics(&self, points: &[PointData]) -> (f64, f64) {
        let n = self.point_indices.len() as f64;
        let mut sum = 0f64;
        for index in &self.point_indices {
            sum += points[*index].friction;
        }
        let mean = sum / n;

        let mut sq_dev_sum = 0f64;
        for index in &self.point_indices {
            let dev = points[*index].friction - mean;
            sq_dev_sum += dev * dev;
        }
        (mean, sq_dev_sum / n)
    }

    /// Calculates the per-axis variance of the member normals about the
    /// representative normal.
    fn compute_normal_variance(&self, points: &[PointData]) -> NormalData {
        let n = self.point_indices.len() as f64;
        let mut sq_dev_sum: Vector3<f64> = Vector3::zeros();
        for index in &self.point_indices {
            let normal = points[*index].normal;
            let dev = Vector3::new(
                normal.x - self.normal.x,
                normal.y - self.normal.y,
                normal.z - self.normal.z,
            );
            sq_dev_sum += dev.component_mul(&dev);
        }
        NormalData::from_vector3(sq_dev_sum / n)
    }

    /// Calculates the variance of the member positions and colours about the
    /// representative centroid and colour, independently per spatial axis
    /// and per colour channel. Colour deviations are taken in f64 so that
    /// squared deviations of wide channel values cannot overflow.
    fn compute_centroid_variance(&self, points: &[PointData]) -> CentroidVariance {
        let n = self.point_indices.len() as f64;
        let mut cv = CentroidVariance::default();
        for index in &self.point_indices {
            let p = points[*index];
            let dx = p.x - self.centroid.x;
            let dy = p.y - self.centroid.y;
            let dz = p.z - self.centroid.z;
            cv.x += dx * dx;
            cv.y += dy * dy;
            cv.z += dz * dz;

            let dr = p.colour.red as f64 - self.colour.red as f64;
            let dg = p.colour.green as f64 - self.colour.green as f64;
            let db = p.colour.blue as f64 - self.colour.blue as f64;
            let da = p.colour.alpha as f64 - self.colour.alpha as f64;
            cv.red += dr * dr;
            cv.green += dg * dg;
            cv.blue += db * db;
            cv.alpha += da * da;
        }
        cv.x /= n;
        cv.y /= n;
        cv.z /= n;
        cv.red /= n;
        cv.green /= n;
        cv.blue /= n;
        cv.alpha /= n;
        cv
    }
}

impl fmt::Display for Supervoxel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(centroid=({}, {}, {}), friction={}, num. points={}, finalized={})",
            self.centroid.x,
            self.centroid.y,
            self.centroid.z,
            self.friction,
            self.num_points(),
            self.finalized
        )
    }
}

// Per-label running sums used by supervoxels_from_labels.
struct RegionSums {
    sum_position: Vector3<f64>,
    sum_normal: Vector3<f64>,
    sum_red: f64,
    sum_green: f64,
    sum_blue: f64,
    sum_alpha: f64,
    point_indices: Vec<usize>,
}

impl RegionSums {
    fn new() -> RegionSums {
        RegionSums {
            sum_position: Vector3::zeros(),
            sum_normal: Vector3::zeros(),
            sum_red: 0f64,
            sum_green: 0f64,
            sum_blue: 0f64,
            sum_alpha: 0f64,
            point_indices: vec![],
        }
    }
}

/// Aggregates a labelled point cloud into supervoxels. 'labels' assigns each
/// point in 'points' to a region; which point belongs to which region has
/// already been decided by the segmentation process, and labels need not be
/// contiguous. Each returned supervoxel carries representative values
/// computed as the means of its members (the mean normal is rescaled to unit
/// length unless it is degenerate) and is finalized before return.
/// Supervoxels are returned in order of first appearance of their label.
pub fn supervoxels_from_labels(
    points: &[PointData],
    labels: &[usize],
) -> Result<Vec<Supervoxel>, Error> {
    if points.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "The source point cloud contains no points.",
        ));
    }
    if labels.len() != points.len() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "The number of labels ({}) does not match the number of points ({}).",
                labels.len(),
                points.len()
            ),
        ));
    }

    let mut slot_for_label: HashMap<usize, usize> = HashMap::new();
    let mut sums: Vec<RegionSums> = vec![];
    for (index, label) in labels.iter().enumerate() {
        let slot = match slot_for_label.get(label) {
            Some(slot) => *slot,
            None => {
                slot_for_label.insert(*label, sums.len());
                sums.push(RegionSums::new());
                sums.len() - 1
            }
        };
        let p = points[index];
        let region = &mut sums[slot];
        region.sum_position += Vector3::new(p.x, p.y, p.z);
        region.sum_normal += p.normal.to_vector3();
        region.sum_red += p.colour.red as f64;
        region.sum_green += p.colour.green as f64;
        region.sum_blue += p.colour.blue as f64;
        region.sum_alpha += p.colour.alpha as f64;
        region.point_indices.push(index);
    }

    let mut supervoxels: Vec<Supervoxel> = Vec::with_capacity(sums.len());
    for region in sums {
        let n = region.point_indices.len() as f64;
        let mut mean_normal = region.sum_normal / n;
        if mean_normal.norm_squared() > 1e-12 {
            mean_normal = mean_normal.normalize();
        }
        let colour = ColourData {
            red: (region.sum_red / n).round() as u16,
            green: (region.sum_green / n).round() as u16,
            blue: (region.sum_blue / n).round() as u16,
            alpha: (region.sum_alpha / n).round() as u16,
        };
        supervoxels.push(Supervoxel::from_cluster(
            Point3D::from_vector3(region.sum_position / n),
            colour,
            NormalData::from_vector3(mean_normal),
            region.point_indices,
            points,
        )?);
    }
    Ok(supervoxels)
}

/// Finalizes every supervoxel in 'supervoxels' that has not yet been
/// finalized, spreading the regions across one worker thread per processor.
/// The source cloud is shared read-only between the workers. Failures are
/// returned as (index, error) pairs, ordered by index; a failed region does
/// not interrupt the finalization of its siblings, and the caller decides
/// whether any failure is fatal to the run.
pub fn finalize_all(
    supervoxels: &mut [Supervoxel],
    points: &Arc<Vec<PointData>>,
) -> Vec<(usize, Error)> {
    let mut jobs: Vec<(usize, Supervoxel)> = vec![];
    for (index, sv) in supervoxels.iter().enumerate() {
        if !sv.is_finalized() {
            jobs.push((index, sv.clone()));
        }
    }
    if jobs.is_empty() {
        return vec![];
    }

    let num_jobs = jobs.len();
    let jobs = Arc::new(jobs);
    let num_procs = num_cpus::get();
    let (tx, rx) = mpsc::channel();
    for tid in 0..num_procs {
        let jobs = jobs.clone();
        let points = points.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            for j in (0..jobs.len()).filter(|j| j % num_procs == tid) {
                let index = jobs[j].0;
                let mut sv = jobs[j].1.clone();
                let res = sv.finalize(points.as_slice());
                tx.send((index, sv, res)).unwrap();
            }
        });
    }

    let mut failures: Vec<(usize, Error)> = vec![];
    for _ in 0..num_jobs {
        let (index, sv, res) = rx.recv().unwrap();
        match res {
            Ok(_) => supervoxels[index] = sv,
            Err(e) => failures.push((index, e)),
        }
    }
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    failures
}
