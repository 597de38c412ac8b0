mod aggregator;
mod broker;
mod error;
mod fanout;
mod idgen;
mod model;
mod pool;
mod store;
mod time;

pub use crate::aggregator::*;
pub use crate::broker::*;
pub use crate::error::*;
pub use crate::fanout::*;
pub use crate::idgen::*;
pub use crate::model::*;
pub use crate::pool::*;
pub use crate::store::*;
pub use crate::time::*;
