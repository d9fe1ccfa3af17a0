pub mod cli;
pub mod config;
pub mod cross_training;
pub mod dataset;
pub mod dem;
pub mod dist;
pub mod error;
pub mod evaluate;
pub mod hindcast;
pub mod hyperparams;
pub mod model;
pub mod network;
pub mod pipeline;
pub mod search;

pub use dataset::Dataset;
pub use dem::DeepEnsembleModel;
pub use dist::{DistributionMode, MixtureForecast};
pub use error::{DemError, DemResult};
pub use model::ForecastModel;
