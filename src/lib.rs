//! # MilMove load test
//!
//! Replays two populations of simulated users against a MilMove host:
//!
//! - `AnonymousUser` (weight 5) repeatedly loads the front page.
//! - `MilMoveUser` (weight 1) fetches a CSRF token, then loops through the service
//!   member onboarding sequence: log in, load the logged in user, create a service
//!   member, fill in the profile and name, and log out.
//!
//! Each simulated user runs in its own tokio task with its own
//! [`reqwest`](https://docs.rs/reqwest/) client and cookie jar, so no state is shared
//! between users.
//!
//! ## Running the load test
//!
//! ```bash
//! $ cargo run --release -- --host http://milmovelocal:8080 -u 12 -r 2 -t 5m -v
//! ```
//!
//! `-u` sets how many users to launch, `-r` how many to launch per second, and `-t` how
//! long to run before stopping. Pass `-h` to see all options.
//!
//! ## Defining scenarios
//!
//! Scenarios are built from async transaction functions, see the [`scenario`] module
//! and [`milmove`] for the MilMove scenarios.

#[macro_use]
extern crate log;

pub mod config;
pub mod metrics;
pub mod milmove;
pub mod prelude;
pub mod scenario;
pub mod user;
pub mod util;

use chrono::Local;
use gumdrop::Options;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, io};
use tokio::task::JoinHandle;

use crate::config::LoadTestConfiguration;
use crate::metrics::{LoadTestMetrics, TransactionMetric};
use crate::scenario::Scenario;
use crate::user::{SimulatedUser, UserCommand};

/// Set by the ctrl-c handler, checked by the driver loop.
pub(crate) static CANCELED: AtomicBool = AtomicBool::new(false);

/// How often the driver wakes to launch users and check whether to stop.
const DRIVER_TICK: Duration = Duration::from_millis(100);

/// An enumeration of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum LoadTestError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://docs.rs/tokio/*/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error.
        option: String,
        /// The invalid value that caused this error.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid wait time specified.
    InvalidWaitTime {
        /// The specified minimum wait time.
        min_wait: Duration,
        /// The specified maximum wait time.
        max_wait: Duration,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid weight specified.
    InvalidWeight {
        /// The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`LoadTest`] has no [`Scenario`] registered.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
}

impl LoadTestError {
    fn describe(&self) -> &str {
        match *self {
            LoadTestError::Io(_) => "io::Error",
            LoadTestError::Reqwest(_) => "reqwest::Error",
            LoadTestError::TokioJoin(_) => "tokio::task::JoinError",
            LoadTestError::InvalidHost { .. } => "failed to parse hostname",
            LoadTestError::InvalidOption { .. } => "invalid option or value specified",
            LoadTestError::InvalidWaitTime { .. } => "invalid wait_time specified",
            LoadTestError::InvalidWeight { .. } => "invalid weight specified",
            LoadTestError::NoScenarios { .. } => "no scenarios defined",
        }
    }
}

impl fmt::Display for LoadTestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LoadTestError::Io(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::Reqwest(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::TokioJoin(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::InvalidHost {
                ref host,
                ref parse_error,
                ..
            } => write!(
                f,
                "LoadTestError: {} {} ({})",
                self.describe(),
                host,
                parse_error
            ),
            LoadTestError::InvalidOption {
                ref option,
                ref detail,
                ..
            } => write!(f, "LoadTestError: {} {}: {}", self.describe(), option, detail),
            _ => write!(f, "LoadTestError: {}", self.describe()),
        }
    }
}

impl std::error::Error for LoadTestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadTestError::Io(ref source) => Some(source),
            LoadTestError::Reqwest(ref source) => Some(source),
            LoadTestError::TokioJoin(ref source) => Some(source),
            LoadTestError::InvalidHost {
                ref parse_error, ..
            } => Some(parse_error),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for LoadTestError {
    fn from(err: reqwest::Error) -> LoadTestError {
        LoadTestError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for LoadTestError {
    fn from(err: io::Error) -> LoadTestError {
        LoadTestError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for LoadTestError {
    fn from(err: tokio::task::JoinError) -> LoadTestError {
        LoadTestError::TokioJoin(err)
    }
}

/// A load test: registered scenarios plus the configuration to run them with.
pub struct LoadTest {
    scenarios: Vec<Scenario>,
    configuration: LoadTestConfiguration,
}

impl LoadTest {
    /// Load configuration from the command line and initialize the logger.
    pub fn initialize() -> Result<LoadTest, LoadTestError> {
        let configuration = LoadTestConfiguration::parse_args_default_or_exit();
        LoadTest::initialize_with_config(configuration)
    }

    /// Initialize a load test with an already loaded configuration.
    pub fn initialize_with_config(
        configuration: LoadTestConfiguration,
    ) -> Result<LoadTest, LoadTestError> {
        configuration.initialize_logger()?;
        Ok(LoadTest {
            scenarios: Vec::new(),
            configuration,
        })
    }

    /// Register a scenario. Users are allocated to scenarios by weight.
    pub fn register_scenario(mut self, mut scenario: Scenario) -> Self {
        scenario.scenarios_index = self.scenarios.len();
        self.scenarios.push(scenario);
        self
    }

    /// Scenario indexes in the order users are allocated to them.
    ///
    /// Weights are reduced by their greatest common divisor, then one user is taken
    /// from each scenario in turn until all are exhausted.
    fn allocate_scenarios(&self) -> Vec<usize> {
        let u = self
            .scenarios
            .iter()
            .fold(0, |u, scenario| util::gcd(u, scenario.weight));
        debug!("gcd: {}", u);

        let mut available_scenarios: Vec<usize> = self
            .scenarios
            .iter()
            .map(|scenario| {
                let weight = scenario.weight / u.max(1);
                trace!(
                    "{}: {} has weight of {} (reduced with gcd to {})",
                    scenario.scenarios_index,
                    scenario.name,
                    scenario.weight,
                    weight
                );
                weight
            })
            .collect();

        let mut weighted_scenarios = Vec::new();
        while available_scenarios.iter().any(|remaining| *remaining > 0) {
            for (scenarios_index, remaining) in available_scenarios.iter_mut().enumerate() {
                if *remaining > 0 {
                    *remaining -= 1;
                    weighted_scenarios.push(scenarios_index);
                }
            }
        }
        weighted_scenarios
    }

    /// The host a scenario runs against: `--host`, then the scenario's own host.
    fn scenario_host(&self, scenario: &Scenario) -> Result<url::Url, LoadTestError> {
        let host = if !self.configuration.host.is_empty() {
            self.configuration.host.clone()
        } else if let Some(host) = scenario.host.as_ref() {
            host.clone()
        } else {
            return Err(LoadTestError::InvalidOption {
                option: "--host".to_string(),
                value: "".to_string(),
                detail: format!(
                    "A host must be defined via the --host option or Scenario::set_host() (no host defined for {}).",
                    scenario.name
                ),
            });
        };
        util::parse_host(&host)
    }

    /// Allocate one [`SimulatedUser`] per configured user, weighted across scenarios.
    fn weight_scenario_users(&self, users: usize) -> Result<Vec<SimulatedUser>, LoadTestError> {
        let weighted_scenarios = self.allocate_scenarios();

        info!("initializing {} user states...", users);
        let mut weighted_users = Vec::with_capacity(users);
        for (weighted_users_index, scenarios_index) in
            weighted_scenarios.iter().cycle().take(users).enumerate()
        {
            let scenario = &self.scenarios[*scenarios_index];
            let mut user = SimulatedUser::new(*scenarios_index, self.scenario_host(scenario)?)?;
            user.weighted_users_index = weighted_users_index;
            debug!(
                "created user state {} ({})",
                weighted_users_index, scenario.name
            );
            weighted_users.push(user);
        }
        Ok(weighted_users)
    }

    /// Run the load test until `--run-time` expires, ctrl-c is pressed, or every user
    /// has completed `--iterations`.
    pub async fn execute(mut self) -> Result<LoadTestMetrics, LoadTestError> {
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        if self.scenarios.is_empty() {
            return Err(LoadTestError::NoScenarios {
                detail: "No scenarios are defined.".to_string(),
            });
        }

        if self.configuration.list {
            println!("Available scenarios:");
            for scenario in &self.scenarios {
                println!(" - {} (weight: {})", scenario.name, scenario.weight);
                for transaction in &scenario.transactions {
                    println!("    o {}", transaction.name);
                }
            }
            std::process::exit(0);
        }

        self.configuration.configure();
        self.configuration.validate()?;
        // Users are always set by configure().
        let users = self.configuration.users.unwrap_or(1);
        let weighted_users = self.weight_scenario_users(users)?;

        util::setup_ctrlc_handler();

        let run_time = util::parse_timespan(&self.configuration.run_time);
        let hatch_rate = util::get_hatch_rate(self.configuration.hatch_rate.clone());
        let spawn_every = util::hatch_interval(hatch_rate)?;
        info!("run_time = {}", run_time);
        info!("hatch_rate = {}", hatch_rate);

        let scenarios: Vec<Arc<Scenario>> = self.scenarios.drain(..).map(Arc::new).collect();
        let mut metrics = LoadTestMetrics {
            started: Some(Local::now()),
            ..Default::default()
        };
        let (metrics_tx, metrics_rx) = flume::unbounded::<TransactionMetric>();
        let mut user_channels: Vec<flume::Sender<UserCommand>> = Vec::new();
        let mut user_handles: Vec<JoinHandle<()>> = Vec::new();
        let mut pending_users = weighted_users.into_iter();
        let mut next_user = pending_users.next();

        let started = Instant::now();
        let mut next_spawn = Instant::now();
        loop {
            for metric in metrics_rx.try_iter() {
                metrics.record(metric);
            }

            if CANCELED.load(Ordering::SeqCst) {
                info!("load test canceled, stopping...");
                break;
            }
            if util::timer_expired(started, run_time) {
                info!("stopping after {} seconds...", started.elapsed().as_secs());
                break;
            }

            while next_user.is_some() && Instant::now() >= next_spawn {
                if let Some(thread_user) = next_user.take() {
                    let (parent_sender, thread_receiver) = flume::unbounded();
                    user_channels.push(parent_sender);
                    let thread_scenario = scenarios[thread_user.scenarios_index].clone();
                    *metrics
                        .scenario_users
                        .entry(thread_scenario.name.clone())
                        .or_insert(0) += 1;

                    // Number users from 1 as they're human-visible in the logs.
                    let thread_number = metrics.users + 1;
                    user_handles.push(tokio::spawn(user::user_main(
                        thread_number,
                        thread_scenario,
                        thread_user,
                        thread_receiver,
                        metrics_tx.clone(),
                        self.configuration.iterations,
                    )));
                    metrics.users += 1;
                    next_spawn += spawn_every;
                }
                next_user = pending_users.next();
                if next_user.is_none() {
                    info!("launched {} users...", metrics.users);
                }
            }

            if next_user.is_none() && user_handles.iter().all(|handle| handle.is_finished()) {
                info!("all users completed their iterations, stopping...");
                break;
            }

            tokio::time::sleep(DRIVER_TICK).await;
        }

        for channel in &user_channels {
            // A user that already exited has dropped its receiver.
            let _ = channel.send(UserCommand::Exit);
        }
        for result in futures::future::join_all(user_handles).await {
            result?;
        }

        drop(metrics_tx);
        for metric in metrics_rx.drain() {
            metrics.record(metric);
        }
        metrics.duration = started.elapsed();

        if !self.configuration.no_print_metrics {
            metrics.print();
        }

        Ok(metrics)
    }
}
