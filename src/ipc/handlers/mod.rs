pub mod certificates;
pub mod core;
pub mod enrollment;
pub mod grades;
pub mod honors;
pub mod scores;
pub mod setup;
