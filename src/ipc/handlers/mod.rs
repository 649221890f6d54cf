pub mod backup;
pub mod benchmarks;
pub mod core;
pub mod level_tests;
pub mod setup;
