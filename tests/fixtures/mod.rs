//! Reusable multi-node setups.

pub mod nat;
pub mod two_node;

pub use nat::{LossyMapping, RandomNat};
pub use two_node::TwoNodeFixture;
