//! Analytic engine boundary
//!
//! The pipeline talks to the engine through the narrow `AnalyticEngine`
//! contract; the production implementation runs SQL over columnar files
//! with polars.

pub mod engine;
pub mod polars_engine;
pub mod result;

pub use engine::AnalyticEngine;
pub use polars_engine::PolarsEngine;
pub use result::QueryResult;
