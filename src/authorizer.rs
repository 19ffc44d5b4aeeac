//! The per-request authorization pipeline.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    authz::PolicyEvaluator,
    config::{AuthorizeConfig, Policy},
    identity::{IdentityCache, IdentitySync, SyncError},
    request::{AttributeBundle, EvaluatorRequest, handle_forward_auth, translate},
    session::{SessionDecoder, SessionState, session_token},
};

/// Options that can be swapped while requests are in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeOptions {
    pub forward_auth_url: Option<Url>,
    pub cookie_name: String,
    pub policies: Vec<Policy>,
}

impl AuthorizeOptions {
    pub fn from_config(config: &AuthorizeConfig) -> Self {
        Self {
            forward_auth_url: config.authorize.forward_auth_url.clone(),
            cookie_name: config.authorize.cookie_name.clone(),
            policies: config.policies.clone(),
        }
    }
}

/// Answer returned to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    /// HTTP status: 200 when allowed
    pub status: u16,
    pub reason: String,
    /// Headers to add to the upstream request
    pub headers: BTreeMap<String, String>,
}

/// Options together with the evaluator built for them. Swapped as one unit.
struct Generation {
    options: Arc<AuthorizeOptions>,
    evaluator: Arc<dyn PolicyEvaluator>,
}

/// Runs the authorization pipeline for each request:
/// decode session → forward-auth rewrite → identity sync → translate → evaluate.
pub struct Authorizer {
    current: RwLock<Arc<Generation>>,
    decoder: Arc<dyn SessionDecoder>,
    sync: Arc<IdentitySync>,
}

impl Authorizer {
    pub fn new(
        options: AuthorizeOptions,
        decoder: Arc<dyn SessionDecoder>,
        sync: Arc<IdentitySync>,
        evaluator: Arc<dyn PolicyEvaluator>,
    ) -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation {
                options: Arc::new(options),
                evaluator,
            })),
            decoder,
            sync,
        }
    }

    fn current(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read())
    }

    /// Current options. Requests already in flight keep the options they started with.
    pub fn options(&self) -> Arc<AuthorizeOptions> {
        Arc::clone(&self.current().options)
    }

    /// Atomically replace the options together with the evaluator built for them.
    pub fn update(&self, options: AuthorizeOptions, evaluator: Arc<dyn PolicyEvaluator>) {
        let policies = options.policies.len();
        let forward_auth = options.forward_auth_url.is_some();
        *self.current.write() = Arc::new(Generation {
            options: Arc::new(options),
            evaluator,
        });
        tracing::info!(policies, forward_auth, "Authorization options updated");
    }

    pub fn identity_cache(&self) -> &Arc<IdentityCache> {
        self.sync.cache()
    }

    /// Translate a bundle using the current route policies.
    pub fn evaluator_request(
        &self,
        bundle: &AttributeBundle,
        session: Option<&SessionState>,
    ) -> EvaluatorRequest {
        translate(bundle, session, &self.options().policies)
    }

    /// Authorize one request.
    ///
    /// `token` overrides the session token carried in the request headers.
    /// Only a failure to sync the session's identity is an error; everything
    /// else results in an allow or deny response.
    #[tracing::instrument(
        name = "authorize.check",
        skip_all,
        fields(request_id = %bundle.http.id, host = %bundle.http.host)
    )]
    pub async fn check(
        &self,
        mut bundle: AttributeBundle,
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CheckResponse, SyncError> {
        let current = self.current();
        let options = &current.options;
        let evaluator = &current.evaluator;

        let session = self.decode_session(&bundle, token, &options.cookie_name);

        if handle_forward_auth(Some(&mut bundle), options.forward_auth_url.as_ref()) {
            tracing::debug!(
                host = %bundle.http.host,
                path = %bundle.http.path,
                "Authorizing forwarded request"
            );
        }

        self.sync.force_sync(cancel, session.as_ref()).await?;

        let request = translate(&bundle, session.as_ref(), &options.policies);

        let decision = match evaluator.evaluate(&request, self.sync.cache()).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, url = %request.http.url, "Policy evaluator failed");
                crate::authz::Decision::deny(format!("Policy evaluation failed: {e}"))
            }
        };

        let status = if decision.allowed {
            200
        } else {
            decision
                .status
                .unwrap_or(if session.is_some() { 403 } else { 401 })
        };

        tracing::debug!(
            allowed = decision.allowed,
            status,
            url = %request.http.url,
            reason = %decision.reason,
            "Authorization decision"
        );

        Ok(CheckResponse {
            allowed: decision.allowed,
            status,
            reason: decision.reason,
            headers: decision.headers,
        })
    }

    fn decode_session(
        &self,
        bundle: &AttributeBundle,
        token: Option<&str>,
        cookie_name: &str,
    ) -> Option<SessionState> {
        let token = token
            .filter(|t| !t.is_empty())
            .or_else(|| session_token(&bundle.http, cookie_name))?;

        match self.decoder.decode(token) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring invalid session token");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        authz::{CelEvaluator, Decision, HEADER_AUTHORIZE_EMAIL},
        config::{AuthorizeSettings, SubPolicy},
        identity::{
            IdentityRecord, IdentityStoreClient, IdentityStoreError, SESSION_TYPE_URL,
            USER_TYPE_URL,
        },
        request::HttpAttributes,
        session::JwtSessionDecoder,
    };

    const SHARED_SECRET: &str = "gXK6ggrlIW2HyKyUF9rUO4azrDgxhDPWqw9y+lJU7B8=";

    /// Store knowing session S1 owned by U1.
    struct Store;

    #[async_trait]
    impl IdentityStoreClient for Store {
        async fn get(
            &self,
            type_url: &str,
            id: &str,
        ) -> Result<IdentityRecord, IdentityStoreError> {
            let data = match (type_url, id) {
                (SESSION_TYPE_URL, "S1") => json!({ "id": "S1", "user_id": "U1" }),
                (USER_TYPE_URL, "U1") => json!({ "id": "U1", "email": "foo@example.com" }),
                _ => {
                    return Err(IdentityStoreError::NotFound {
                        type_url: type_url.to_string(),
                        id: id.to_string(),
                    });
                }
            };
            Ok(IdentityRecord {
                version: "1".to_string(),
                type_url: type_url.to_string(),
                id: id.to_string(),
                data,
            })
        }
    }

    /// Evaluator returning a fixed decision and recording what it saw.
    struct Fixed {
        decision: Decision,
        seen: parking_lot::Mutex<Vec<EvaluatorRequest>>,
    }

    impl Fixed {
        fn new(decision: Decision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                seen: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PolicyEvaluator for Fixed {
        async fn evaluate(
            &self,
            request: &EvaluatorRequest,
            _identity: &IdentityCache,
        ) -> Result<Decision, crate::authz::AuthzError> {
            self.seen.lock().push(request.clone());
            Ok(self.decision.clone())
        }
    }

    fn decoder() -> Arc<JwtSessionDecoder> {
        Arc::new(JwtSessionDecoder::from_base64_secret(SHARED_SECRET).unwrap())
    }

    fn token(session_id: &str) -> String {
        decoder()
            .encode(&SessionState {
                id: session_id.to_string(),
                impersonate_email: Some("admin@example.com".to_string()),
                ..Default::default()
            })
            .unwrap()
    }

    fn options() -> AuthorizeOptions {
        AuthorizeOptions {
            forward_auth_url: Some(Url::parse("https://forward-auth.example.com").unwrap()),
            cookie_name: "_authorize".to_string(),
            policies: vec![Policy {
                from: Url::parse("https://app.example.com").unwrap(),
                sub_policies: vec![SubPolicy {
                    name: None,
                    rego: vec!["user != null && user.email == 'foo@example.com'".to_string()],
                }],
            }],
        }
    }

    fn authorizer(evaluator: Arc<dyn PolicyEvaluator>) -> Authorizer {
        let sync = IdentitySync::new(
            Arc::new(Store),
            Arc::new(IdentityCache::new()),
            Duration::from_secs(5),
        );
        Authorizer::new(options(), decoder(), Arc::new(sync), evaluator)
    }

    fn cel_authorizer() -> Authorizer {
        let evaluator =
            CelEvaluator::new(&options().policies, &AuthorizeSettings::default()).unwrap();
        authorizer(Arc::new(evaluator))
    }

    fn bundle(host: &str, path: &str, headers: &[(&str, &str)]) -> AttributeBundle {
        AttributeBundle {
            http: HttpAttributes {
                id: "req-1".to_string(),
                method: "GET".to_string(),
                host: host.to_string(),
                path: path.to_string(),
                scheme: "https".to_string(),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<HashMap<_, _>>(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allowed_with_session_cookie() {
        let cookie = format!("_authorize={}", token("S1"));
        let response = cel_authorizer()
            .check(
                bundle("app.example.com", "/", &[("cookie", cookie.as_str())]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.allowed, "{}", response.reason);
        assert_eq!(response.status, 200);
        assert_eq!(response.headers[HEADER_AUTHORIZE_EMAIL], "admin@example.com");
    }

    #[tokio::test]
    async fn test_no_session_denied_with_401() {
        let response = cel_authorizer()
            .check(
                bundle("app.example.com", "/", &[]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!response.allowed);
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn test_invalid_token_treated_as_no_session() {
        let response = cel_authorizer()
            .check(
                bundle("app.example.com", "/", &[]),
                Some("garbage"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn test_session_denied_with_403() {
        let evaluator = Fixed::new(Decision::deny("nope"));
        let response = authorizer(evaluator)
            .check(
                bundle("app.example.com", "/", &[]),
                Some(token("S1").as_str()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!response.allowed);
        assert_eq!(response.status, 403);
        assert_eq!(response.reason, "nope");
    }

    #[tokio::test]
    async fn test_explicit_deny_status_is_kept() {
        let evaluator = Fixed::new(Decision {
            status: Some(429),
            ..Decision::deny("slow down")
        });
        let response = authorizer(evaluator)
            .check(
                bundle("app.example.com", "/", &[]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 429);
    }

    #[tokio::test]
    async fn test_unknown_session_is_an_error() {
        let result = cel_authorizer()
            .check(
                bundle("app.example.com", "/", &[]),
                Some(token("S404").as_str()),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(SyncError::SessionNotFound { id, .. }) if id == "S404"
        ));
    }

    #[tokio::test]
    async fn test_forward_auth_request_is_rewritten_before_translation() {
        let evaluator = Fixed::new(Decision::allow("ok"));
        let authorizer = authorizer(Arc::clone(&evaluator) as Arc<dyn PolicyEvaluator>);

        authorizer
            .check(
                bundle(
                    "forward-auth.example.com",
                    "/verify?uri=https%3A%2F%2Fapp.example.com%2Fdashboard%3Fx%3D1",
                    &[],
                ),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let seen = evaluator.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].http.url, "https://app.example.com/dashboard?x=1");
        assert_eq!(seen[0].custom_policies.len(), 1);
    }

    /// Allows only requests carrying exactly the snippet it was built for.
    struct Expects(&'static str);

    #[async_trait]
    impl PolicyEvaluator for Expects {
        async fn evaluate(
            &self,
            request: &EvaluatorRequest,
            _identity: &IdentityCache,
        ) -> Result<Decision, crate::authz::AuthzError> {
            Ok(if request.custom_policies == [self.0] {
                Decision::allow(self.0)
            } else {
                Decision::deny(format!("{:?} evaluated by '{}'", request.custom_policies, self.0))
            })
        }
    }

    fn options_with_snippet(snippet: &str) -> AuthorizeOptions {
        let mut options = options();
        options.policies[0].sub_policies[0].rego = vec![snippet.to_string()];
        options
    }

    #[tokio::test]
    async fn test_check_sees_one_generation_during_updates() {
        let authorizer = Arc::new(authorizer(Arc::new(Expects("a"))));
        authorizer.update(options_with_snippet("a"), Arc::new(Expects("a")));

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let updater = {
            let authorizer = Arc::clone(&authorizer);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let mut flip = false;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let snippet = if flip { "a" } else { "b" };
                    authorizer.update(options_with_snippet(snippet), Arc::new(Expects(snippet)));
                    flip = !flip;
                }
            })
        };

        for _ in 0..500 {
            let response = authorizer
                .check(
                    bundle("app.example.com", "/", &[]),
                    None,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(response.allowed, "{}", response.reason);
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        updater.join().unwrap();
    }

    #[tokio::test]
    async fn test_update_swaps_policies() {
        let authorizer = cel_authorizer();
        let request = bundle("other.example.com", "/", &[]);
        assert!(
            authorizer
                .evaluator_request(&request, None)
                .custom_policies
                .is_empty()
        );

        let mut options = options();
        options.policies[0].from = Url::parse("https://other.example.com").unwrap();
        let evaluator = CelEvaluator::new(&options.policies, &AuthorizeSettings::default()).unwrap();
        authorizer.update(options, Arc::new(evaluator));

        assert_eq!(
            authorizer.evaluator_request(&request, None).custom_policies.len(),
            1
        );
    }
}
