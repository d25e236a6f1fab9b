pub mod state;
pub mod store;
pub mod traits;
pub mod transaction;

pub use state::{Change, Row, StoreState};
pub use store::*;
pub use traits::*;
pub use transaction::Transaction;
