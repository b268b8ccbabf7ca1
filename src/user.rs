//! Simulated users: one HTTP session per user, and the loop that runs its scenario.

use downcast_rs::{impl_downcast, Downcast};
use rand::Rng;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::metrics::TransactionMetric;
use crate::scenario::{Scenario, Transaction, TransactionError};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Never sleep longer than this between checks for an exit command.
const MAXIMUM_SLEEP: Duration = Duration::from_millis(500);

/// Commands the driver sends to running users.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    /// Finish the current transaction, run on_stop transactions, and exit.
    Exit,
}

/// Typed per-user session data, set and read by transactions.
pub trait SessionData: Downcast + Send + Sync + 'static {}
impl<T: Send + Sync + 'static> SessionData for T {}
impl_downcast!(SessionData);

/// A simulated user: its own client, cookie jar, default headers and session data.
pub struct SimulatedUser {
    /// Which scenario this user runs.
    pub scenarios_index: usize,
    /// Unique index of this user, assigned when it is allocated.
    pub weighted_users_index: usize,
    /// The base URL all relative paths are joined to.
    pub base_url: Url,
    /// How many complete passes through the scenario this user has made.
    pub iterations: usize,
    client: Client,
    cookies: Arc<Jar>,
    headers: HeaderMap,
    session_data: Option<Box<dyn SessionData>>,
}

impl SimulatedUser {
    /// Create a user with an empty cookie jar and no default headers.
    pub fn new(scenarios_index: usize, base_url: Url) -> Result<Self, reqwest::Error> {
        trace!("new user");
        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .cookie_provider(cookies.clone())
            .gzip(true)
            .build()?;
        Ok(SimulatedUser {
            scenarios_index,
            weighted_users_index: usize::MAX,
            base_url,
            iterations: 0,
            client,
            cookies,
            headers: HeaderMap::new(),
            session_data: None,
        })
    }

    /// Join `path` to the base URL. A `path` that already includes a host is used as is.
    pub fn build_url(&self, path: &str) -> Result<Url, url::ParseError> {
        if let Ok(url) = Url::parse(path) {
            if url.host().is_some() {
                return Ok(url);
            }
        }
        self.base_url.join(path)
    }

    /// Get a request builder for `path`, with the default headers applied.
    pub fn request_builder(
        &self,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, url::ParseError> {
        let url = self.build_url(path)?;
        Ok(self
            .client
            .request(method, url)
            .headers(self.headers.clone()))
    }

    /// Send a request. Status codes are not inspected.
    pub async fn send(&self, request_builder: RequestBuilder) -> Result<Response, reqwest::Error> {
        let request = request_builder.build()?;
        let method = request.method().clone();
        let path = request.url().path().to_string();
        let response = self.client.execute(request).await;
        match &response {
            Ok(r) => debug!(
                "[user {}] {} {}: status_code {}",
                self.weighted_users_index,
                method,
                path,
                r.status()
            ),
            Err(e) => warn!(
                "[user {}] {} {}: {}",
                self.weighted_users_index, method, path, e
            ),
        }
        response
    }

    /// GET `path`.
    pub async fn get(&self, path: &str) -> Result<Response, TransactionError> {
        let request_builder = self.request_builder(Method::GET, path)?;
        Ok(self.send(request_builder).await?)
    }

    /// POST `path` with an empty body.
    pub async fn post(&self, path: &str) -> Result<Response, TransactionError> {
        let request_builder = self.request_builder(Method::POST, path)?;
        Ok(self.send(request_builder).await?)
    }

    /// POST `path` with a JSON body.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        json: &T,
    ) -> Result<Response, TransactionError> {
        let request_builder = self.request_builder(Method::POST, path)?.json(json);
        Ok(self.send(request_builder).await?)
    }

    /// PATCH `path` with a JSON body.
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        json: &T,
    ) -> Result<Response, TransactionError> {
        let request_builder = self.request_builder(Method::PATCH, path)?.json(json);
        Ok(self.send(request_builder).await?)
    }

    /// Look up the value of cookie `name` as it would be sent with a request to `path`.
    pub fn cookie(&self, name: &str, path: &str) -> Option<String> {
        let url = self.build_url(path).ok()?;
        let header = self.cookies.cookies(&url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            if key == name {
                Some(value.to_string())
            } else {
                None
            }
        })
    }

    /// Set a header sent with every subsequent request.
    pub fn set_header(&mut self, name: &'static str, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(HeaderName::from_static(name), value);
                true
            }
            Err(e) => {
                warn!("invalid value for header {}: {}", name, e);
                false
            }
        }
    }

    /// Stop sending a default header.
    pub fn remove_header(&mut self, name: &'static str) {
        self.headers.remove(HeaderName::from_static(name));
    }

    /// Headers sent with every request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Store typed session data, replacing anything already stored.
    pub fn set_session_data<T: SessionData>(&mut self, data: T) {
        self.session_data.replace(Box::new(data));
    }

    /// Borrow session data of type `T`, if any was stored.
    pub fn get_session_data<T: SessionData>(&self) -> Option<&T> {
        self.session_data.as_deref()?.downcast_ref::<T>()
    }

    /// Mutably borrow session data of type `T`, if any was stored.
    pub fn get_session_data_mut<T: SessionData>(&mut self) -> Option<&mut T> {
        self.session_data.as_deref_mut()?.downcast_mut::<T>()
    }
}

/// Run one user until it is told to exit or completes `iterations` passes through
/// its scenario (0 means no limit).
pub(crate) async fn user_main(
    thread_number: usize,
    thread_scenario: Arc<Scenario>,
    mut thread_user: SimulatedUser,
    thread_receiver: flume::Receiver<UserCommand>,
    metrics: flume::Sender<TransactionMetric>,
    iterations: usize,
) {
    info!(
        "launching user {} from {}...",
        thread_number, thread_scenario.name
    );

    for transaction in thread_scenario.on_start_transactions() {
        debug!(
            "[user {}]: launching on_start {} transaction from {}",
            thread_number, transaction.name, thread_scenario.name
        );
        invoke_transaction_function(&thread_scenario, transaction, &mut thread_user, &metrics)
            .await;
    }

    let looping: Vec<&Transaction> = thread_scenario.looping_transactions().collect();
    if !looping.is_empty() {
        'launch_transactions: loop {
            for transaction in &looping {
                if received_exit(&thread_receiver) {
                    break 'launch_transactions;
                }
                debug!(
                    "[user {}]: launching {} transaction from {}",
                    thread_number, transaction.name, thread_scenario.name
                );
                invoke_transaction_function(
                    &thread_scenario,
                    transaction,
                    &mut thread_user,
                    &metrics,
                )
                .await;

                if let Some((min, max)) = thread_scenario.transaction_wait {
                    if wait(thread_number, min, max, &thread_receiver).await {
                        break 'launch_transactions;
                    }
                }
            }

            thread_user.iterations += 1;
            if iterations > 0 && thread_user.iterations >= iterations {
                info!(
                    "user {} from {} completed {} iterations",
                    thread_number, thread_scenario.name, thread_user.iterations
                );
                break;
            }
        }
    }

    for transaction in thread_scenario.on_stop_transactions() {
        debug!(
            "[user {}]: launching on_stop {} transaction from {}",
            thread_number, transaction.name, thread_scenario.name
        );
        invoke_transaction_function(&thread_scenario, transaction, &mut thread_user, &metrics)
            .await;
    }

    info!(
        "exiting user {} from {}...",
        thread_number, thread_scenario.name
    );
}

// Sleep a random time between min and max in short slices, returning true if an exit
// command arrived meanwhile.
async fn wait(
    thread_number: usize,
    min: Duration,
    max: Duration,
    thread_receiver: &flume::Receiver<UserCommand>,
) -> bool {
    let mut wait_time = if min == max {
        min
    } else {
        let millis = rand::rng().random_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(millis as u64)
    };
    debug!("user {} sleeping {:?} ...", thread_number, wait_time);

    while !wait_time.is_zero() {
        if received_exit(thread_receiver) {
            return true;
        }
        let sleep_duration = wait_time.min(MAXIMUM_SLEEP);
        wait_time -= sleep_duration;
        tokio::time::sleep(sleep_duration).await;
    }
    received_exit(thread_receiver)
}

// Determine if the driver has sent UserCommand::Exit, or has gone away.
fn received_exit(thread_receiver: &flume::Receiver<UserCommand>) -> bool {
    match thread_receiver.try_recv() {
        Ok(UserCommand::Exit) | Err(flume::TryRecvError::Disconnected) => true,
        Err(flume::TryRecvError::Empty) => false,
    }
}

// Invoke the transaction function, logging failures and reporting the outcome.
async fn invoke_transaction_function(
    scenario: &Scenario,
    transaction: &Transaction,
    thread_user: &mut SimulatedUser,
    metrics: &flume::Sender<TransactionMetric>,
) {
    let result = (transaction.function)(thread_user).await;
    if let Err(e) = &result {
        warn!(
            "[user {}] {} {} failed: {}",
            thread_user.weighted_users_index, scenario.name, transaction.name, e
        );
    }

    // Best effort metrics.
    let _ = metrics.send(TransactionMetric {
        scenario_name: scenario.name.clone(),
        transaction_name: transaction.name.clone(),
        transactions_index: transaction.transactions_index,
        success: result.is_ok(),
    });
}
