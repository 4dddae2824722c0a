//! Statistical hypothesis testing for feature enrichment.

pub mod fisher;

pub use fisher::{fisher_exact_greater, test_fisher, FisherResult};
