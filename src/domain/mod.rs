pub mod error;
pub mod training;
