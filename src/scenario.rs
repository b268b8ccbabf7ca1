//! Scenarios and the transactions they run.
//!
//! - [`Scenario`] a weighted, ordered list of transactions assigned to simulated users.
//! - [`Transaction`] an async function run by a [`SimulatedUser`] that makes one or more
//!   requests.
//!
//! ## Creating a scenario
//!
//! ```rust
//! use milmove_loadtest::prelude::*;
//!
//! let scenario = scenario!("Visitor")
//!     .set_weight(5)
//!     .expect("weight is not 0")
//!     .register_transaction(transaction!(front_page).set_name("index"));
//!
//! async fn front_page(user: &mut SimulatedUser) -> TransactionResult {
//!     let _response = user.get("/").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Transactions run in the order they are registered. Transactions flagged with
//! [`Transaction::set_on_start`] run once when the user starts, those flagged with
//! [`Transaction::set_on_stop`] run once when the user stops.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::user::SimulatedUser;
use crate::LoadTestError;

/// The result of running a transaction.
pub type TransactionResult = Result<(), TransactionError>;

/// The async function a transaction invokes.
pub type TransactionFunction = Arc<
    dyn for<'r> Fn(
            &'r mut SimulatedUser,
        ) -> Pin<Box<dyn Future<Output = TransactionResult> + Send + 'r>>
        + Send
        + Sync,
>;

/// Errors a transaction can return. They are logged and counted, never fatal.
#[derive(Debug)]
pub enum TransactionError {
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
    Url(url::ParseError),
    /// A response body that should have been JSON could not be decoded.
    InvalidJson {
        /// The path that returned the body.
        path: String,
        /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
        source: serde_json::Error,
    },
    /// A value an earlier transaction should have stored in the session is missing.
    MissingSessionField {
        /// The missing field.
        field: String,
    },
}

impl TransactionError {
    fn describe(&self) -> &str {
        match *self {
            TransactionError::Reqwest(_) => "reqwest::Error",
            TransactionError::Url(_) => "url::ParseError",
            TransactionError::InvalidJson { .. } => "invalid json in response body",
            TransactionError::MissingSessionField { .. } => "missing session field",
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransactionError::Reqwest(ref source) => {
                write!(f, "TransactionError: {} ({})", self.describe(), source)
            }
            TransactionError::Url(ref source) => {
                write!(f, "TransactionError: {} ({})", self.describe(), source)
            }
            TransactionError::InvalidJson {
                ref path,
                ref source,
            } => write!(
                f,
                "TransactionError: {} from {} ({})",
                self.describe(),
                path,
                source
            ),
            TransactionError::MissingSessionField { ref field } => {
                write!(f, "TransactionError: {} ({})", self.describe(), field)
            }
        }
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            TransactionError::Reqwest(ref source) => Some(source),
            TransactionError::Url(ref source) => Some(source),
            TransactionError::InvalidJson { ref source, .. } => Some(source),
            TransactionError::MissingSessionField { .. } => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for TransactionError {
    fn from(err: reqwest::Error) -> TransactionError {
        TransactionError::Reqwest(err)
    }
}

/// Auto-convert Url errors.
impl From<url::ParseError> for TransactionError {
    fn from(err: url::ParseError) -> TransactionError {
        TransactionError::Url(err)
    }
}

/// `transaction!(foo)` expands to `Transaction::new(foo)`, boxing the async function.
#[macro_export]
macro_rules! transaction {
    ($transaction_func:ident) => {
        $crate::scenario::Transaction::new(std::sync::Arc::new(move |s| {
            std::boxed::Box::pin($transaction_func(s))
        }))
    };
}

/// `scenario!("foo")` expands to `Scenario::new("foo")`.
#[macro_export]
macro_rules! scenario {
    ($name:expr) => {
        $crate::scenario::Scenario::new($name)
    };
}

/// A weighted, ordered collection of transactions.
#[derive(Clone)]
pub struct Scenario {
    /// The name of the scenario.
    pub name: String,
    /// Where this scenario lives in the load test's list of scenarios.
    pub scenarios_index: usize,
    /// How often this scenario is assigned to users relative to other scenarios.
    pub weight: usize,
    /// Minimum and maximum time to wait after each transaction.
    pub transaction_wait: Option<(Duration, Duration)>,
    /// All transactions, in registration order.
    pub transactions: Vec<Transaction>,
    /// Optional host, overridden by `--host`.
    pub host: Option<String>,
}

impl Scenario {
    /// Create a new scenario with a weight of 1 and no transactions.
    pub fn new(name: &str) -> Self {
        trace!("new scenario: name: {}", &name);
        Scenario {
            name: name.to_string(),
            scenarios_index: usize::MAX,
            weight: 1,
            transaction_wait: None,
            transactions: Vec::new(),
            host: None,
        }
    }

    /// Register a transaction. Transactions run in the order they are registered.
    pub fn register_transaction(mut self, mut transaction: Transaction) -> Self {
        trace!("{} register_transaction: {}", self.name, transaction.name);
        transaction.transactions_index = self.transactions.len();
        self.transactions.push(transaction);
        self
    }

    /// Set how often this scenario is assigned to users. A weight of 0 is invalid.
    pub fn set_weight(mut self, weight: usize) -> Result<Self, LoadTestError> {
        trace!("{} set_weight: {}", self.name, weight);
        if weight == 0 {
            return Err(LoadTestError::InvalidWeight {
                weight,
                detail: "Weight must be set to at least 1.".to_string(),
            });
        }
        self.weight = weight;
        Ok(self)
    }

    /// Set a default host for this scenario, used when `--host` is not set.
    pub fn set_host(mut self, host: &str) -> Self {
        trace!("{} set_host: {}", self.name, host);
        self.host = Some(host.to_string());
        self
    }

    /// Sleep a random time between `min_wait` and `max_wait` after each transaction.
    /// Equal values give a fixed wait.
    pub fn set_wait_time(
        mut self,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Result<Self, LoadTestError> {
        trace!(
            "{} set_wait time: min: {:?} max: {:?}",
            self.name,
            min_wait,
            max_wait
        );
        if min_wait > max_wait {
            return Err(LoadTestError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail: "The min_wait option can not be set to a larger value than the max_wait option.".to_string(),
            });
        }
        self.transaction_wait = Some((min_wait, max_wait));
        Ok(self)
    }

    /// Transactions that run once when a user starts, in order.
    pub fn on_start_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|t| t.on_start)
    }

    /// Transactions that run repeatedly while a user is running, in order.
    pub fn looping_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions
            .iter()
            .filter(|t| !t.on_start && !t.on_stop)
    }

    /// Transactions that run once when a user stops, in order.
    pub fn on_stop_transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|t| t.on_stop)
    }
}

/// An individual transaction within a [`Scenario`].
#[derive(Clone)]
pub struct Transaction {
    /// Where this transaction lives in its scenario's list of transactions.
    pub transactions_index: usize,
    /// Name used in logs and metrics.
    pub name: String,
    /// Runs once when the user starts.
    pub on_start: bool,
    /// Runs once when the user stops.
    pub on_stop: bool,
    /// The function executed each time this transaction runs.
    pub function: TransactionFunction,
}

impl Transaction {
    /// Create a transaction running `function`, usually through the
    /// [`transaction!`](crate::transaction) macro. It is unnamed and runs in the main
    /// loop until configured otherwise.
    pub fn new(function: TransactionFunction) -> Self {
        trace!("new transaction");
        Transaction {
            transactions_index: usize::MAX,
            name: "".to_string(),
            on_start: false,
            on_stop: false,
            function,
        }
    }

    /// Set a name for the transaction, shown in logs and metrics.
    pub fn set_name(mut self, name: &str) -> Self {
        trace!("[{}] set_name: {}", self.transactions_index, name);
        self.name = name.to_string();
        self
    }

    /// Run this transaction once when the user starts, ie to fetch a CSRF token.
    pub fn set_on_start(mut self) -> Self {
        trace!("{} [{}] set_on_start", self.name, self.transactions_index);
        self.on_start = true;
        self
    }

    /// Run this transaction once when the user stops.
    pub fn set_on_stop(mut self) -> Self {
        trace!("{} [{}] set_on_stop", self.name, self.transactions_index);
        self.on_stop = true;
        self
    }
}
