//! Bundle adjustment of the finished reconstruction.

pub mod bundle_adjustment;

pub use bundle_adjustment::{
    BaObservation, BaProblem, BaSolution, BundleAdjustmentConfig, BundleAdjustmentRefiner,
    LmBundleAdjuster, RefinementOutcome, apply_solution, collect_problem,
};
