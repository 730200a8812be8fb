//! The principal-component machinery: per-seed streaming PCA, the global
//! basis merger and the metrics defined on top of it.

pub mod distance;
pub mod dynpca;
pub mod merge;
pub mod region;

pub use dynpca::{DynPca, DynPcaParams, Phase};
pub use merge::MergedBasis;
