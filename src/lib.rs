#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::missing_panics_doc
)]

pub mod adjacency;
pub mod batch;
pub mod cache;
pub mod clustering;
pub mod config;
pub mod graph;
pub mod observability;
pub mod pipeline;
pub(crate) mod util;
