//! Policy evaluation using CEL.

use std::{collections::HashMap, panic, sync::Arc};

use async_trait::async_trait;
use cel_interpreter::{Context, Program, Value, to_value};

use super::{
    AuthzError, Decision, HEADER_AUTHORIZE_EMAIL, HEADER_AUTHORIZE_GROUPS,
    HEADER_AUTHORIZE_SESSION, HEADER_AUTHORIZE_USER, PolicyEvaluator,
};
use crate::{
    config::{AuthorizeSettings, Policy, PolicyEffect},
    identity::{IdentityCache, SessionIdentity, UserIdentity},
    request::EvaluatorRequest,
};

/// Policy evaluator treating custom policy snippets as CEL expressions.
///
/// Expressions see three variables:
/// - `request`: the translated request (`request.http.url`, `request.session.id`, ...)
/// - `session`: the cached session record for `request.session.id`, or `null`
/// - `user`: the cached user record owning that session, or `null`
pub struct CelEvaluator {
    /// Programs compiled from the configured route policies, keyed by source text
    programs: HashMap<String, Arc<Program>>,
    default_effect: PolicyEffect,
    pass_identity_headers: bool,
    max_expression_length: usize,
}

impl CelEvaluator {
    /// Compile every snippet of the given route policies.
    pub fn new(policies: &[Policy], settings: &AuthorizeSettings) -> Result<Self, AuthzError> {
        let mut programs = HashMap::new();

        for policy in policies {
            for snippet in policy.snippets() {
                if programs.contains_key(snippet) {
                    continue;
                }
                let program = compile(snippet, settings.max_expression_length).map_err(|e| {
                    AuthzError::InvalidExpression(format!("Policy for '{}': {}", policy.from, e))
                })?;
                programs.insert(snippet.to_string(), Arc::new(program));
            }
        }

        Ok(Self {
            programs,
            default_effect: settings.default_effect,
            pass_identity_headers: settings.pass_identity_headers,
            max_expression_length: settings.max_expression_length,
        })
    }

    /// Number of distinct compiled expressions.
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Validate an expression without evaluating it.
    pub fn validate_expression(expression: &str, max_length: usize) -> Result<(), AuthzError> {
        compile(expression, max_length).map(|_| ())
    }

    fn program(&self, snippet: &str) -> Result<Arc<Program>, AuthzError> {
        match self.programs.get(snippet) {
            Some(program) => Ok(Arc::clone(program)),
            None => compile(snippet, self.max_expression_length).map(Arc::new),
        }
    }

    fn decide(
        &self,
        request: &EvaluatorRequest,
        session: Option<&SessionIdentity>,
        user: Option<&UserIdentity>,
    ) -> Result<Decision, AuthzError> {
        if request.custom_policies.is_empty() {
            return Ok(match self.default_effect {
                PolicyEffect::Allow => Decision::allow("No matching policy (default allow)"),
                PolicyEffect::Deny => Decision::deny("No matching policy (default deny)"),
            });
        }

        let mut ctx = Context::default();
        add_variables(&mut ctx, request, session, user)?;
        let mut first_error = None;

        for snippet in &request.custom_policies {
            let outcome = self
                .program(snippet)
                .and_then(|program| evaluate_condition(&program, &ctx));

            match outcome {
                Ok(true) => {
                    tracing::debug!(policy = %snippet, "Policy allowed request");
                    return Ok(Decision::allow(format!("Allowed by policy '{snippet}'")));
                }
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(policy = %snippet, error = %e, "Policy evaluation error");
                    first_error.get_or_insert((snippet, e));
                }
            }
        }

        Ok(match first_error {
            Some((snippet, e)) => {
                Decision::deny(format!("Policy '{snippet}' failed to evaluate: {e}"))
            }
            None => Decision::deny("No policy allowed the request"),
        })
    }
}

#[async_trait]
impl PolicyEvaluator for CelEvaluator {
    async fn evaluate(
        &self,
        request: &EvaluatorRequest,
        identity: &IdentityCache,
    ) -> Result<Decision, AuthzError> {
        let session = Some(request.session.id.as_str())
            .filter(|id| !id.is_empty())
            .and_then(|id| identity.get_session(id));
        let user = session
            .as_ref()
            .and_then(|session| identity.get_user(&session.user_id));

        let mut decision = self.decide(request, session.as_ref(), user.as_ref())?;
        if decision.allowed && self.pass_identity_headers {
            add_identity_headers(&mut decision, request, session.as_ref(), user.as_ref());
        }
        Ok(decision)
    }
}

fn add_identity_headers(
    decision: &mut Decision,
    request: &EvaluatorRequest,
    session: Option<&SessionIdentity>,
    user: Option<&UserIdentity>,
) {
    let user_id = session.map(|s| s.user_id.clone()).unwrap_or_default();
    let email = if request.session.impersonate_email.is_empty() {
        user.map(|u| u.email.clone()).unwrap_or_default()
    } else {
        request.session.impersonate_email.clone()
    };

    let headers = [
        (HEADER_AUTHORIZE_USER, user_id),
        (HEADER_AUTHORIZE_EMAIL, email),
        (
            HEADER_AUTHORIZE_GROUPS,
            request.session.impersonate_groups.join(","),
        ),
        (HEADER_AUTHORIZE_SESSION, request.session.id.clone()),
    ];
    for (name, value) in headers {
        if !value.is_empty() {
            decision.headers.insert(name.to_string(), value);
        }
    }
}

fn add_variables(
    ctx: &mut Context,
    request: &EvaluatorRequest,
    session: Option<&SessionIdentity>,
    user: Option<&UserIdentity>,
) -> Result<(), AuthzError> {
    let request_value = to_value(request).map_err(|e| {
        AuthzError::PolicyEvaluation(format!("Failed to serialize request: {}", e))
    })?;
    ctx.add_variable("request", request_value);

    let session_value = to_value(session).map_err(|e| {
        AuthzError::PolicyEvaluation(format!("Failed to serialize session: {}", e))
    })?;
    ctx.add_variable("session", session_value);

    let user_value = to_value(user)
        .map_err(|e| AuthzError::PolicyEvaluation(format!("Failed to serialize user: {}", e)))?;
    ctx.add_variable("user", user_value);

    Ok(())
}

/// Compile an expression.
///
/// The underlying parser can panic on certain malformed expressions instead of
/// returning an error, so compilation runs under `catch_unwind`.
fn compile(expression: &str, max_length: usize) -> Result<Program, AuthzError> {
    if max_length > 0 && expression.len() > max_length {
        return Err(AuthzError::InvalidExpression(format!(
            "CEL expression length ({} bytes) exceeds maximum ({} bytes)",
            expression.len(),
            max_length
        )));
    }

    match panic::catch_unwind(panic::AssertUnwindSafe(|| Program::compile(expression))) {
        Ok(Ok(program)) => Ok(program),
        Ok(Err(e)) => Err(AuthzError::InvalidExpression(format!("{}", e))),
        Err(_) => Err(AuthzError::InvalidExpression(
            "CEL expression parsing failed (malformed syntax)".to_string(),
        )),
    }
}

fn evaluate_condition(program: &Program, ctx: &Context) -> Result<bool, AuthzError> {
    // Execution can also panic on edge cases
    let exec_result = panic::catch_unwind(panic::AssertUnwindSafe(|| program.execute(ctx)));

    match exec_result {
        Ok(Ok(Value::Bool(b))) => Ok(b),
        Ok(Ok(_)) => Err(AuthzError::PolicyEvaluation(
            "Policy condition must evaluate to boolean".to_string(),
        )),
        Ok(Err(e)) => Err(AuthzError::PolicyEvaluation(format!(
            "Execution error: {}",
            e
        ))),
        Err(_) => Err(AuthzError::PolicyEvaluation(
            "CEL expression execution failed (internal error)".to_string(),
        )),
    }
}
