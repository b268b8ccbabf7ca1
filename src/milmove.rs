//! MilMove scenarios.
//!
//! Two populations of users, weighted five to one:
//!
//! - [`anonymous_scenario`] loads the front page.
//! - [`authenticated_scenario`] logs in through the local dev login and walks a new
//!   service member through onboarding, then logs out and starts over.
//!
//! Status codes are not checked by any transaction, and only the login response is
//! guarded against a body that isn't JSON: a broken session adds noise to the results
//! but never stops a user.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::prelude::*;

/// Host used when `--host` is not set.
pub const DEFAULT_HOST: &str = "http://milmovelocal:8080";

pub const ANONYMOUS_WEIGHT: usize = 5;
pub const AUTHENTICATED_WEIGHT: usize = 1;

/// Anonymous users wait a fixed second between page loads.
pub const ANONYMOUS_WAIT: Duration = Duration::from_millis(1_000);
pub const AUTHENTICATED_MIN_WAIT: Duration = Duration::from_millis(1_000);
pub const AUTHENTICATED_MAX_WAIT: Duration = Duration::from_millis(5_000);

pub const CSRF_COOKIE: &str = "masked_gorilla_csrf";
pub const SESSION_COOKIE: &str = "mil_session_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

pub const INDEX_PATH: &str = "/";
pub const LOGIN_PATH: &str = "/devlocal-auth/create";
pub const LOGGED_IN_PATH: &str = "/internal/users/logged_in";
pub const SERVICE_MEMBERS_PATH: &str = "/internal/service_members";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Per-user state of an authenticated MilMove session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MilMoveSession {
    /// Value of the `masked_gorilla_csrf` cookie when the user started.
    pub csrf_token: Option<String>,
    /// The decoded login response.
    pub login_gov_user: Option<Value>,
    /// Value of the `mil_session_token` cookie after logging in.
    pub session_token: Option<String>,
    /// The logged in user, with a `service_member` object once one is created.
    pub authenticated_user: Map<String, Value>,
}

impl MilMoveSession {
    /// The id of the logged in user.
    pub fn user_id(&self) -> Option<&Value> {
        self.authenticated_user.get("id")
    }

    /// The id of the service member created for the logged in user.
    pub fn service_member_id(&self) -> Option<&str> {
        self.authenticated_user
            .get("service_member")?
            .get("id")?
            .as_str()
    }

    /// Forget everything learned since logging in. The CSRF token is kept.
    pub fn reset(&mut self) {
        self.login_gov_user = None;
        self.session_token = None;
        self.authenticated_user.clear();
    }
}

/// Profile fields sent when creating a service member.
// The values are fixed: affiliation and rank could rotate, edipi and ssn be random.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMemberProfile {
    pub affiliation: String,
    pub edipi: String,
    pub rank: String,
    pub social_security_number: String,
}

impl Default for ServiceMemberProfile {
    fn default() -> Self {
        ServiceMemberProfile {
            affiliation: "NAVY".to_string(),
            edipi: "3333333333".to_string(),
            rank: "E_5".to_string(),
            social_security_number: "333-33-3333".to_string(),
        }
    }
}

/// Name fields sent when creating a service member.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMemberName {
    pub first_name: String,
    pub last_name: String,
    pub middle_name: String,
    pub suffix: String,
}

impl Default for ServiceMemberName {
    fn default() -> Self {
        ServiceMemberName {
            first_name: "Alice".to_string(),
            last_name: "Bob".to_string(),
            middle_name: "Carol".to_string(),
            suffix: "".to_string(),
        }
    }
}

/// Anonymous visitors repeatedly loading the front page.
pub fn anonymous_scenario() -> Result<Scenario, LoadTestError> {
    Ok(scenario!("AnonymousUser")
        .set_weight(ANONYMOUS_WEIGHT)?
        .set_host(DEFAULT_HOST)
        .set_wait_time(ANONYMOUS_WAIT, ANONYMOUS_WAIT)?
        .register_transaction(transaction!(index).set_name("index")))
}

/// Service members logging in and onboarding, in a fixed order.
pub fn authenticated_scenario() -> Result<Scenario, LoadTestError> {
    Ok(scenario!("MilMoveUser")
        .set_weight(AUTHENTICATED_WEIGHT)?
        .set_host(DEFAULT_HOST)
        .set_wait_time(AUTHENTICATED_MIN_WAIT, AUTHENTICATED_MAX_WAIT)?
        .register_transaction(transaction!(bootstrap).set_name("bootstrap").set_on_start())
        .register_transaction(transaction!(login).set_name("login"))
        .register_transaction(transaction!(retrieve_user).set_name("retrieve_user"))
        .register_transaction(
            transaction!(create_service_member).set_name("create_service_member"),
        )
        .register_transaction(transaction!(create_profile).set_name("create_profile"))
        .register_transaction(transaction!(create_name).set_name("create_name"))
        .register_transaction(transaction!(logout).set_name("logout"))
        .register_transaction(transaction!(stop).set_name("stop").set_on_stop()))
}

/// Load the front page.
pub async fn index(user: &mut SimulatedUser) -> TransactionResult {
    let _response = user.get(INDEX_PATH).await?;

    Ok(())
}

/// Load the front page to be issued a CSRF cookie, and send it back as a header on
/// every following request. Without the cookie the header is simply not sent.
pub async fn bootstrap(user: &mut SimulatedUser) -> TransactionResult {
    let _response = user.get(INDEX_PATH).await?;

    let csrf_token = user.cookie(CSRF_COOKIE, INDEX_PATH);
    match csrf_token.as_deref() {
        Some(token) => {
            user.set_header(CSRF_HEADER, token);
        }
        None => {
            debug!(
                "[user {}] no {} cookie, not setting {}",
                user.weighted_users_index, CSRF_COOKIE, CSRF_HEADER
            );
            user.remove_header(CSRF_HEADER);
        }
    }

    user.set_session_data(MilMoveSession {
        csrf_token,
        ..Default::default()
    });

    Ok(())
}

/// Log in as a new local dev user.
///
/// A response that isn't JSON is logged together with the request headers, and the
/// sequence carries on.
pub async fn login(user: &mut SimulatedUser) -> TransactionResult {
    let body = user.post(LOGIN_PATH).await?.text().await?;

    match serde_json::from_str::<Value>(&body) {
        Ok(login_gov_user) => {
            let session_token = user.cookie(SESSION_COOKIE, LOGIN_PATH);
            let session = session_mut(user)?;
            session.login_gov_user = Some(login_gov_user);
            session.session_token = session_token;
        }
        Err(e) => {
            warn!(
                "[user {}] failed to decode login response: {}",
                user.weighted_users_index, e
            );
            warn!("Headers: {:?}", user.headers());
            warn!("{}", body);
        }
    }

    Ok(())
}

/// Load the logged in user.
pub async fn retrieve_user(user: &mut SimulatedUser) -> TransactionResult {
    let body = user.get(LOGGED_IN_PATH).await?.text().await?;
    let authenticated_user = decode::<Map<String, Value>>(LOGGED_IN_PATH, &body)?;
    session_mut(user)?.authenticated_user = authenticated_user;

    Ok(())
}

/// Create a service member for the logged in user.
pub async fn create_service_member(user: &mut SimulatedUser) -> TransactionResult {
    let user_id = session_mut(user)?
        .user_id()
        .cloned()
        .ok_or_else(|| missing("id"))?;

    let body = user
        .post_json(SERVICE_MEMBERS_PATH, &json!({ "id": user_id }))
        .await?
        .text()
        .await?;
    let service_member = decode::<Value>(SERVICE_MEMBERS_PATH, &body)?;
    session_mut(user)?
        .authenticated_user
        .insert("service_member".to_string(), service_member);

    Ok(())
}

/// Fill in the service member's profile.
pub async fn create_profile(user: &mut SimulatedUser) -> TransactionResult {
    let path = service_member_path(user)?;
    let _response = user
        .patch_json(&path, &ServiceMemberProfile::default())
        .await?;

    Ok(())
}

/// Fill in the service member's name.
pub async fn create_name(user: &mut SimulatedUser) -> TransactionResult {
    let path = service_member_path(user)?;
    let _response = user
        .patch_json(&path, &ServiceMemberName::default())
        .await?;

    Ok(())
}

/// Log out, forgetting the session even if the request failed.
pub async fn logout(user: &mut SimulatedUser) -> TransactionResult {
    let response = user.get(LOGOUT_PATH).await;
    session_mut(user)?.reset();
    response?;

    Ok(())
}

/// Runs when the user stops. Nothing to clean up yet.
pub async fn stop(_user: &mut SimulatedUser) -> TransactionResult {
    Ok(())
}

/// The service member resource of the logged in user.
pub fn service_member_path(user: &SimulatedUser) -> Result<String, TransactionError> {
    let service_member_id = user
        .get_session_data::<MilMoveSession>()
        .and_then(|session| session.service_member_id())
        .ok_or_else(|| missing("service_member.id"))?;
    Ok(format!("{}/{}", SERVICE_MEMBERS_PATH, service_member_id))
}

// The session is normally created by bootstrap, create it if a transaction runs first.
fn session_mut(user: &mut SimulatedUser) -> Result<&mut MilMoveSession, TransactionError> {
    if user.get_session_data::<MilMoveSession>().is_none() {
        user.set_session_data(MilMoveSession::default());
    }
    user.get_session_data_mut::<MilMoveSession>()
        .ok_or_else(|| missing("session"))
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, body: &str) -> Result<T, TransactionError> {
    serde_json::from_str(body).map_err(|source| TransactionError::InvalidJson {
        path: path.to_string(),
        source,
    })
}

fn missing(field: &str) -> TransactionError {
    TransactionError::MissingSessionField {
        field: field.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn user() -> SimulatedUser {
        SimulatedUser::new(0, Url::parse(DEFAULT_HOST).expect("valid host")).expect("client builds")
    }

    #[test]
    fn transaction_order() {
        let scenario = authenticated_scenario().expect("valid scenario");
        assert_eq!(scenario.weight, 1);
        assert_eq!(
            scenario.transaction_wait,
            Some((Duration::from_millis(1_000), Duration::from_millis(5_000)))
        );

        let on_start: Vec<&str> = scenario
            .on_start_transactions()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(on_start, vec!["bootstrap"]);

        let looping: Vec<&str> = scenario
            .looping_transactions()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(
            looping,
            vec![
                "login",
                "retrieve_user",
                "create_service_member",
                "create_profile",
                "create_name",
                "logout"
            ]
        );

        let on_stop: Vec<&str> = scenario
            .on_stop_transactions()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(on_stop, vec!["stop"]);
    }

    #[test]
    fn anonymous() {
        let scenario = anonymous_scenario().expect("valid scenario");
        assert_eq!(scenario.weight, 5);
        assert_eq!(scenario.host.as_deref(), Some(DEFAULT_HOST));
        assert_eq!(
            scenario.transaction_wait,
            Some((ANONYMOUS_WAIT, ANONYMOUS_WAIT))
        );
        assert_eq!(scenario.looping_transactions().count(), 1);
    }

    #[test]
    fn payloads() {
        assert_eq!(
            serde_json::to_value(ServiceMemberProfile::default()).expect("serializes"),
            json!({
                "affiliation": "NAVY",
                "edipi": "3333333333",
                "rank": "E_5",
                "social_security_number": "333-33-3333",
            })
        );
        assert_eq!(
            serde_json::to_value(ServiceMemberName::default()).expect("serializes"),
            json!({
                "first_name": "Alice",
                "last_name": "Bob",
                "middle_name": "Carol",
                "suffix": "",
            })
        );
    }

    #[test]
    fn session_reset() {
        let mut session = MilMoveSession {
            csrf_token: Some("csrf".to_string()),
            login_gov_user: Some(json!({"id": "u1"})),
            session_token: Some("token".to_string()),
            ..Default::default()
        };
        session
            .authenticated_user
            .insert("id".to_string(), json!("u1"));
        session
            .authenticated_user
            .insert("service_member".to_string(), json!({"id": "sm1"}));
        assert_eq!(session.user_id(), Some(&json!("u1")));
        assert_eq!(session.service_member_id(), Some("sm1"));

        session.reset();
        assert_eq!(session.login_gov_user, None);
        assert_eq!(session.session_token, None);
        assert!(session.authenticated_user.is_empty());
        assert_eq!(session.csrf_token.as_deref(), Some("csrf"));
    }

    #[test]
    fn service_member_resource() {
        let mut user = user();
        assert!(matches!(
            service_member_path(&user),
            Err(TransactionError::MissingSessionField { .. })
        ));

        let mut session = MilMoveSession::default();
        session
            .authenticated_user
            .insert("service_member".to_string(), json!({"id": "sm1"}));
        user.set_session_data(session);
        assert_eq!(
            service_member_path(&user).expect("service member exists"),
            "/internal/service_members/sm1"
        );
    }
}
