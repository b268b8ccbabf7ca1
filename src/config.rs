//! Runtime configuration for a load test.
//!
//! All options are parsed from the command line by [`gumdrop`](https://docs.rs/gumdrop/),
//! which also derives the `-h` help output from [`LoadTestConfiguration`].

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;

use crate::util;
use crate::LoadTestError;

/// Runtime options available when launching the load test.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Replays anonymous and onboarding service member traffic against MilMove.

The following runtime options are available:"#
)]
pub struct LoadTestConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all scenarios and transactions and exits
    #[options(short = "l", help = "Lists all scenarios and transactions and exits\n")]
    pub list: bool,

    /// Defines host to load test (ie http://milmovelocal:8080)
    #[options(short = "H")]
    pub host: String,
    /// Sets concurrent users (default: number of CPUs)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets how many times each user runs its scenario then exits
    #[options(no_short)]
    pub iterations: usize,
    /// Doesn't display metrics at end of load test
    #[options(no_short, help = "Doesn't display metrics at end of load test\n")]
    pub no_print_metrics: bool,

    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

impl LoadTestConfiguration {
    /// Fill in defaults for options that weren't set on the command line.
    pub(crate) fn configure(&mut self) {
        if self.users.is_none() {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            info!("concurrent users defaulted to {} (number of CPUs)", cpus);
            self.users = Some(cpus);
        }
    }

    /// Confirm the configuration is usable before launching any users.
    pub(crate) fn validate(&self) -> Result<(), LoadTestError> {
        if let Some(users) = self.users {
            if users == 0 {
                return Err(LoadTestError::InvalidOption {
                    option: "--users".to_string(),
                    value: users.to_string(),
                    detail: "At least 1 user is required.".to_string(),
                });
            }
        }

        if let Some(hatch_rate) = self.hatch_rate.as_ref() {
            util::hatch_interval(util::get_hatch_rate(Some(hatch_rate.to_string())))?;
        }

        if !self.run_time.is_empty() && util::parse_timespan(&self.run_time) == 0 {
            warn!(
                "--run-time {} parses to 0 seconds, the load test will run until canceled",
                self.run_time
            );
        }

        if !self.host.is_empty() {
            util::parse_host(&self.host)?;
        }

        Ok(())
    }

    /// Initialize the logger which writes to standard out and optionally to a log file.
    pub(crate) fn initialize_logger(&self) -> Result<(), LoadTestError> {
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];

        let log_file = if self.log_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.log_file))
        };
        if let Some(path) = log_file.as_ref() {
            let file = std::fs::File::create(path)?;
            loggers.push(WriteLogger::new(log_level, Config::default(), file));
        }

        // Fails when a logger is already installed, ie when running several load tests
        // in the same process.
        if let Err(e) = CombinedLogger::init(loggers) {
            debug!("failed to initialize CombinedLogger: {}", e);
            return Ok(());
        }

        if let Some(path) = log_file {
            info!("Writing to log file: {}", path.display());
        }
        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);

        Ok(())
    }
}
