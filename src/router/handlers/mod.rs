pub mod functions;
pub mod health;
pub mod instances;
pub mod invoke;
pub mod stats;
