pub use crate::config::LoadTestConfiguration;
pub use crate::metrics::LoadTestMetrics;
pub use crate::scenario::{
    Scenario, Transaction, TransactionError, TransactionFunction, TransactionResult,
};
pub use crate::user::SimulatedUser;
pub use crate::{scenario, transaction, LoadTest, LoadTestError};
