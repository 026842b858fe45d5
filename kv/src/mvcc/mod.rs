pub mod store;

pub use store::{MVCCStore, Status};
