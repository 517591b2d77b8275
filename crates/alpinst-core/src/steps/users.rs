use crate::context::PlanContext;
use crate::step::{ApplyScope, ExecutionError, Findings, StepController, StepKind, ValidationError};
use alpinst_runtime::accounts;
use alpinst_schema::InstallPlan;
use std::collections::HashSet;
use tracing::info;

pub struct UsersStep;

const MAX_NAME_LEN: usize = 32;

pub(crate) fn implied(plan: &InstallPlan) -> Vec<&'static str> {
    match plan.users() {
        Some(users) if !users.is_empty() => vec!["sudo"],
        _ => Vec::new(),
    }
}

/// `[a-z_][a-z0-9_-]*`, as `adduser` accepts.
pub fn is_valid_username(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        && name.len() <= MAX_NAME_LEN
}

/// A crypt(3) hash (`$id$...`) or a locked entry (`!`, `*`).
fn is_password_hash(value: &str) -> bool {
    value.starts_with('$') || value.starts_with('!') || value == "*"
}

impl StepController for UsersStep {
    fn kind(&self) -> StepKind {
        StepKind::Users
    }

    fn validate(&self, plan: &InstallPlan, _ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Users);
        let Some(users) = plan.users() else {
            f.constraint("users", "not answered");
            return f.finish();
        };

        let mut seen = HashSet::new();
        for user in users {
            let name = user.name.as_str();
            if name.is_empty() {
                f.constraint("name", "empty");
            } else if accounts::RESERVED_NAMES.contains(&name) {
                f.constraint("name", format!("'{name}' is reserved"));
            } else if !is_valid_username(name) {
                f.constraint("name", format!("'{name}' must match [a-z_][a-z0-9_-]*"));
            } else if !seen.insert(name) {
                f.constraint("name", format!("'{name}' declared twice"));
            }

            if user.password.is_empty() {
                f.constraint("password", "empty");
            } else if user.password.contains([':', '\n']) {
                f.constraint("password", "must not contain ':' or newlines");
            } else if !is_password_hash(&user.password) {
                f.constraint("password", "must be a crypt(3) hash, not plain text");
            }

            if let Some(gecos) = &user.gecos {
                if gecos.contains([':', '\n']) {
                    f.constraint("gecos", "must not contain ':' or newlines");
                }
            }
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let users = plan
            .users()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Users))?;
        info!("creating {} account(s); root stays locked", users.len());
        accounts::create_accounts(scope.session, scope.staging, users)
            .map_err(|e| ExecutionError::new(StepKind::Users, e))
    }
}
