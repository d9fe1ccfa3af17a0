pub mod history;
pub mod randomized;

pub use history::{SearchHistory, SearchRecord};
pub use randomized::{fit_randomized_search, SearchOutcome};
