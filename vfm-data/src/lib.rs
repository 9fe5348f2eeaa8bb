//! Sparse design matrices and minibatch loading for factorization
//! machines over user/item rating data.

pub mod common_io;
pub mod data_loader;
pub mod schema;
pub mod sparse_row;
pub mod triplets;

pub use data_loader::{DataLoader, InMemoryData, Minibatches};
pub use schema::{FeatureSchema, UserItemLayout};
pub use sparse_row::{Batch, PaddedRows, SparseRow};
pub use triplets::{RatingTriplets, Vocabulary};
