use gumdrop::Options;
use httpmock::MockServer;
use url::Url;

use milmove_loadtest::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --host <mock-server>
///  --users 1
///  --hatch-rate 100
///  --run-time 10
///  --no-print-metrics
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> LoadTestConfiguration {
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    configuration.extend_from_slice(&custom);

    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }
    if !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--users", "1"]);
    }
    // Launch users quickly so tests don't wait on the hatch rate.
    if !configuration.contains(&"--hatch-rate") {
        configuration.extend_from_slice(&["--hatch-rate", "100"]);
    }
    // A safety net: tests normally stop on --iterations long before this.
    if !configuration.contains(&"--run-time") {
        configuration.extend_from_slice(&["--run-time", "10"]);
    }
    configuration.push("--no-print-metrics");

    LoadTestConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Run a load test with the given scenarios, returning the metrics.
#[allow(dead_code)]
pub async fn run_load_test(
    configuration: LoadTestConfiguration,
    scenarios: Vec<Scenario>,
) -> LoadTestMetrics {
    let mut load_test =
        LoadTest::initialize_with_config(configuration).expect("load test initializes");
    for scenario in scenarios {
        load_test = load_test.register_scenario(scenario);
    }
    load_test.execute().await.expect("load test runs")
}

/// A user pointed at the mock server, for running transactions directly.
#[allow(dead_code)]
pub fn build_user(server: &MockServer) -> SimulatedUser {
    let base_url = Url::parse(&server.base_url()).expect("mock server url is valid");
    SimulatedUser::new(0, base_url).expect("client builds")
}
