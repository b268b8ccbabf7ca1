use httpmock::{Method::GET, Method::PATCH, Method::POST, Mock, MockServer};
use serde_json::json;
use serial_test::serial;

mod common;

use milmove_loadtest::milmove;
use milmove_loadtest::prelude::*;

// Indexes into the vector of mock endpoints.
const INDEX_KEY: usize = 0;
const LOGIN_KEY: usize = 1;
const LOGGED_IN_KEY: usize = 2;
const SERVICE_MEMBER_KEY: usize = 3;
const PATCH_KEY: usize = 4;
const LOGOUT_KEY: usize = 5;

// The onboarding transactions, in the order they must run.
const ONBOARDING: [&str; 6] = [
    "login",
    "retrieve_user",
    "create_service_member",
    "create_profile",
    "create_name",
    "logout",
];

// A minimal MilMove.
fn setup_mock_server_endpoints(server: &MockServer) -> Vec<Mock> {
    vec![
        server.mock(|when, then| {
            when.method(GET).path(milmove::INDEX_PATH);
            then.status(200)
                .header("Set-Cookie", "masked_gorilla_csrf=abc123; Path=/");
        }),
        server.mock(|when, then| {
            when.method(POST).path(milmove::LOGIN_PATH);
            then.status(200)
                .header("Set-Cookie", "mil_session_token=tok; Path=/")
                .json_body(json!({"id": "u1"}));
        }),
        server.mock(|when, then| {
            when.method(GET).path(milmove::LOGGED_IN_PATH);
            then.status(200).json_body(json!({"id": "u1"}));
        }),
        server.mock(|when, then| {
            when.method(POST)
                .path(milmove::SERVICE_MEMBERS_PATH)
                .json_body(json!({"id": "u1"}));
            then.status(201).json_body(json!({"id": "sm1"}));
        }),
        server.mock(|when, then| {
            when.method(PATCH)
                .path("/internal/service_members/sm1")
                .header(milmove::CSRF_HEADER, "abc123");
            then.status(200);
        }),
        server.mock(|when, then| {
            when.method(GET).path(milmove::LOGOUT_PATH);
            then.status(200);
        }),
    ]
}

// The MilMove scenarios without think time, so tests finish quickly.
fn without_wait(mut scenario: Scenario) -> Scenario {
    scenario.transaction_wait = None;
    scenario
}

fn authenticated() -> Scenario {
    without_wait(milmove::authenticated_scenario().expect("valid scenario"))
}

fn anonymous() -> Scenario {
    without_wait(milmove::anonymous_scenario().expect("valid scenario"))
}

// One authenticated user runs the onboarding sequence exactly twice.
#[tokio::test]
#[serial]
async fn authenticated_iterations() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration = common::build_configuration(&server, vec!["--iterations", "2"]);
    let metrics = common::run_load_test(configuration, vec![authenticated()]).await;

    assert_eq!(metrics.users, 1);
    // The front page is only loaded once, to fetch the CSRF token.
    mock_endpoints[INDEX_KEY].assert_hits(1);
    mock_endpoints[LOGIN_KEY].assert_hits(2);
    mock_endpoints[LOGGED_IN_KEY].assert_hits(2);
    mock_endpoints[SERVICE_MEMBER_KEY].assert_hits(2);
    // Profile and name each patch the service member once per iteration.
    mock_endpoints[PATCH_KEY].assert_hits(4);
    mock_endpoints[LOGOUT_KEY].assert_hits(2);

    for name in ONBOARDING.iter() {
        let aggregate = metrics
            .transaction("MilMoveUser", name)
            .expect("transaction ran");
        assert_eq!(aggregate.success_count, 2, "{}", name);
        assert_eq!(aggregate.fail_count, 0, "{}", name);
    }
    for name in ["bootstrap", "stop"].iter() {
        let aggregate = metrics
            .transaction("MilMoveUser", name)
            .expect("transaction ran");
        assert_eq!(aggregate.success_count, 1, "{}", name);
    }

    // Metrics are keyed by transaction index, which follows registration order.
    let recorded: Vec<&str> = metrics
        .transactions
        .values()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(
        recorded,
        vec![
            "bootstrap",
            "login",
            "retrieve_user",
            "create_service_member",
            "create_profile",
            "create_name",
            "logout",
            "stop"
        ]
    );
}

// Users are split five anonymous to one authenticated.
#[tokio::test]
#[serial]
async fn weighted_scenarios() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration =
        common::build_configuration(&server, vec!["--users", "6", "--iterations", "2"]);
    let metrics = common::run_load_test(configuration, vec![anonymous(), authenticated()]).await;

    assert_eq!(metrics.users, 6);
    assert_eq!(metrics.scenario_users.get("AnonymousUser"), Some(&5));
    assert_eq!(metrics.scenario_users.get("MilMoveUser"), Some(&1));

    // 5 anonymous users load the front page twice, the authenticated user once.
    mock_endpoints[INDEX_KEY].assert_hits(11);
    mock_endpoints[LOGIN_KEY].assert_hits(2);
    assert_eq!(
        metrics
            .transaction("AnonymousUser", "index")
            .map(|a| a.success_count),
        Some(10)
    );
}

// Without an iteration limit, users run until the run time expires.
#[tokio::test]
#[serial]
async fn run_time_stops_users() {
    let server = MockServer::start();
    let mock_endpoints = setup_mock_server_endpoints(&server);

    let configuration =
        common::build_configuration(&server, vec!["--users", "2", "--run-time", "1"]);
    let anonymous = milmove::anonymous_scenario().expect("valid scenario");
    let metrics = common::run_load_test(configuration, vec![anonymous]).await;

    assert_eq!(metrics.users, 2);
    assert!(mock_endpoints[INDEX_KEY].hits() >= 2);
    assert!(metrics.duration.as_secs() >= 1);
}

// A host that can't be reached fails every transaction without stopping any user.
#[tokio::test]
#[serial]
async fn unreachable_host() {
    let server = MockServer::start();

    let configuration = common::build_configuration(
        &server,
        vec!["--host", "http://127.0.0.1:1", "--iterations", "1"],
    );
    let metrics = common::run_load_test(configuration, vec![authenticated()]).await;

    assert_eq!(metrics.users, 1);
    for name in ["bootstrap", "login", "retrieve_user", "logout"].iter() {
        let aggregate = metrics
            .transaction("MilMoveUser", name)
            .expect("transaction ran");
        assert_eq!(aggregate.fail_count, 1, "{}", name);
    }
    // Later steps fail before sending anything, the sequence still completes.
    for name in ["create_service_member", "create_profile", "create_name"].iter() {
        let aggregate = metrics
            .transaction("MilMoveUser", name)
            .expect("transaction ran");
        assert_eq!(aggregate.fail_count, 1, "{}", name);
    }
    assert_eq!(
        metrics
            .transaction("MilMoveUser", "stop")
            .map(|a| a.success_count),
        Some(1)
    );
}

#[tokio::test]
#[serial]
async fn invalid_host() {
    let server = MockServer::start();

    let configuration = common::build_configuration(&server, vec!["--host", "milmovelocal"]);
    let result = LoadTest::initialize_with_config(configuration)
        .expect("load test initializes")
        .register_scenario(authenticated())
        .execute()
        .await;
    assert!(matches!(result, Err(LoadTestError::InvalidHost { .. })));
}

// Hatch rates that can't be turned into a launch interval are rejected up front.
#[tokio::test]
#[serial]
async fn invalid_hatch_rate() {
    let server = MockServer::start();

    for rate in &["NaN", "1e-30"] {
        let configuration = common::build_configuration(
            &server,
            vec!["--hatch-rate", *rate, "--iterations", "1"],
        );
        let result = LoadTest::initialize_with_config(configuration)
            .expect("load test initializes")
            .register_scenario(authenticated())
            .execute()
            .await;
        assert!(
            matches!(result, Err(LoadTestError::InvalidOption { .. })),
            "{}",
            rate
        );
    }
}
