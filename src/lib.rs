// private sub-modules defined in other files
mod point_data;
mod supervoxel;

// exports identifiers from private sub-modules in the current module namespace
pub use self::point_data::{ColourData, NormalData, Point3D, PointData};
pub use self::supervoxel::{
    finalize_all, supervoxels_from_labels, CentroidVariance, Supervoxel,
};
