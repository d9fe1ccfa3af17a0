pub mod early_stopping;
pub mod layer;
pub mod member;
pub mod optim;

pub use early_stopping::{EarlyStopping, StopDecision};
pub use layer::{Activation, Dense, DenseGrad, Regularizer};
pub use member::{EnsembleMember, MemberConfig, TrainReport};
pub use optim::Adam;
