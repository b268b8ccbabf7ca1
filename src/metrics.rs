//! Transaction counts collected while the load test runs.
//!
//! Each user sends a [`TransactionMetric`] to the driver after every transaction. The
//! driver folds them into [`LoadTestMetrics`], which [`LoadTest::execute`](../struct.LoadTest.html#method.execute)
//! returns. Only counts are kept.

use chrono::{DateTime, Local};
use num_format::{Locale, ToFormattedString};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// The outcome of running one transaction once.
#[derive(Debug, Clone)]
pub struct TransactionMetric {
    pub scenario_name: String,
    pub transaction_name: String,
    pub transactions_index: usize,
    pub success: bool,
}

/// Success and failure counts for one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionMetricAggregate {
    pub success_count: usize,
    pub fail_count: usize,
}

/// Counts gathered over a whole load test.
#[derive(Debug, Clone, Default)]
pub struct LoadTestMetrics {
    /// When users started launching.
    pub started: Option<DateTime<Local>>,
    /// How long the load test ran.
    pub duration: Duration,
    /// How many users were launched.
    pub users: usize,
    /// Users launched per scenario.
    pub scenario_users: BTreeMap<String, usize>,
    /// Keyed by (scenario name, transaction index), holding the transaction name and counts.
    pub transactions: BTreeMap<(String, usize), (String, TransactionMetricAggregate)>,
}

impl LoadTestMetrics {
    pub(crate) fn record(&mut self, metric: TransactionMetric) {
        let TransactionMetric {
            scenario_name,
            transaction_name,
            transactions_index,
            success,
        } = metric;
        let entry = self
            .transactions
            .entry((scenario_name, transactions_index))
            .or_insert_with(|| (transaction_name, TransactionMetricAggregate::default()));
        if success {
            entry.1.success_count += 1;
        } else {
            entry.1.fail_count += 1;
        }
    }

    /// Counts for a named transaction in a named scenario.
    pub fn transaction(
        &self,
        scenario_name: &str,
        transaction_name: &str,
    ) -> Option<&TransactionMetricAggregate> {
        self.transactions
            .iter()
            .find(|((scenario, _), (name, _))| {
                scenario.as_str() == scenario_name && name.as_str() == transaction_name
            })
            .map(|(_, (_, aggregate))| aggregate)
    }

    /// Print a summary of the load test to stdout.
    pub fn print(&self) {
        println!("{}", self);
    }
}

impl fmt::Display for LoadTestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "\n === PER TRANSACTION METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            f,
            " {:<52} | {:>10} | {:>10}",
            "Name", "# ok", "# fail"
        )?;
        writeln!(
            f,
            " ------------------------------------------------------------------------------"
        )?;
        let mut previous_scenario: Option<&str> = None;
        for ((scenario, index), (name, aggregate)) in &self.transactions {
            if previous_scenario != Some(scenario.as_str()) {
                let users = self.scenario_users.get(scenario).copied().unwrap_or(0);
                writeln!(f, " {} ({} users)", scenario, users)?;
                previous_scenario = Some(scenario.as_str());
            }
            writeln!(
                f,
                "   {:<50} | {:>10} | {:>10}",
                format!("{}: {}", index + 1, name),
                aggregate.success_count.to_formatted_string(&Locale::en),
                aggregate.fail_count.to_formatted_string(&Locale::en),
            )?;
        }
        writeln!(
            f,
            " ------------------------------------------------------------------------------"
        )?;
        if let Some(started) = self.started {
            writeln!(f, " Started: {}", started.format("%Y-%m-%d %H:%M:%S"))?;
        }
        write!(
            f,
            " Users: {}, duration: {} seconds",
            self.users.to_formatted_string(&Locale::en),
            self.duration.as_secs()
        )
    }
}
