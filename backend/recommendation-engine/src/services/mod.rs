pub mod clustering;
pub mod collaborative;
pub mod ctr;
pub mod evaluation;
pub mod features;
pub mod orchestrator;
