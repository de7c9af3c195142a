pub mod context;
pub mod retrieval;

pub use retrieval::{HttpRetrievalService, RetrievalOutcome, RetrievalQuery, RetrievalService};
