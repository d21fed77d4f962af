pub mod repositories;

pub use repositories::TrainingDb;
