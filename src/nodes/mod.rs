pub mod directory;

pub use directory::{NodeChange, NodeDirectory};
