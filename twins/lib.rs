#![deny(dead_code)]
#![allow(non_snake_case)]

pub mod cache;
pub mod config;
pub mod dataset;
pub mod masks;
pub mod pairs;
pub mod pipeline;
pub mod progress;
pub mod standardize;
pub mod stats;
pub mod table;

// Numerical core: fits, embedding and the Gaussian process.
#[path = "../estimate/lib.rs"]
pub mod estimate;

pub use config::{AnalysisSettings, ConfigError, GpFit};
pub use dataset::{Dataset, DataError, Spectrum, Subset, Target};
pub use pipeline::{AnalysisError, AnalysisReport, run_analysis};
pub use standardize::StandardizationKind;
pub use table::SpectrumTable;
