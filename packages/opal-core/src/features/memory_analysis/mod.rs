//! The analysis suite: escape, ownership, liveness, shape, reuse, region,
//! interprocedural summaries and concurrency inference

pub mod domain;
pub mod infrastructure;

pub use domain::{
    AllocSite, AllocTag, AnalysisContext, EscapeClass, FnSummary, Ownership, ParamMode,
    ParamSummary, RegionInfo, ReturnOwnership, ReuseCandidate, Shape, SummaryMap, ThreadClass,
    VarUsage,
};
pub use infrastructure::concurrency::analyze_concurrency;
pub use infrastructure::escape::analyze_escape;
pub use infrastructure::liveness::analyze_liveness;
pub use infrastructure::ownership::analyze_ownership;
pub use infrastructure::region::analyze_regions;
pub use infrastructure::reuse::analyze_reuse;
pub use infrastructure::shape::{
    analyze_type_shapes, refine_var_shapes, weak_split_is_acyclic, TypeShape,
};
pub use infrastructure::summaries::compute_summaries;
