//! Star-schema loader: normalise extracted records, stage them, load
//! dimensions, back-fill surrogate keys, then load facts.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod dimension;
pub mod error;
pub mod fact;
pub mod landing;
pub mod normalizer;
pub mod pipeline;
pub mod resolver;
pub mod schema;
pub mod source;
pub mod staging;
pub mod value;
pub mod warehouse;

pub use error::{PipelineError, PlanError, TransformError, WarehouseError};
pub use pipeline::{Pipeline, PipelineDefinition, RunReport};
pub use warehouse::Warehouse;
