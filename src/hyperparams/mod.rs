pub mod space;
pub mod value;

pub use space::{
    log_grid, ExpBase, FixedParams, HyperparameterSet, SearchSpace, SearchSpec, LOG_GRID_POINTS,
};
pub use value::{HyperValue, ParamInput};
