//! Command implementations.

mod evaluate;
mod info;
mod predict;
mod setup;
mod train;
mod validate;

pub use evaluate::run_evaluate;
pub use info::run_info;
pub use predict::run_predict;
pub use train::run_train;
pub use validate::run_validate;
