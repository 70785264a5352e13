pub mod co2;
pub mod collapser;
pub mod features;
pub mod insights;
pub mod pipeline;
pub mod predictor;
pub mod scheduler;
pub mod weather;
