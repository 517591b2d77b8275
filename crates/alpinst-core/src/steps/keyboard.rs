use crate::context::PlanContext;
use crate::step::{ApplyScope, ExecutionError, Findings, StepController, StepKind, ValidationError};
use alpinst_runtime::target_config;
use alpinst_schema::InstallPlan;
use tracing::info;

pub struct KeyboardStep;

pub(crate) fn implied(plan: &InstallPlan) -> Vec<&'static str> {
    if plan.keyboard().is_some() {
        vec!["kbd-bkeymaps"]
    } else {
        Vec::new()
    }
}

/// `ll_CC[.charset][@modifier]`, or the portable `C`/`POSIX` locales.
pub fn is_valid_locale(locale: &str) -> bool {
    let base = locale.split(['.', '@']).next().unwrap_or_default();
    if matches!(base, "C" | "POSIX") {
        return true;
    }
    let Some((lang, country)) = base.split_once('_') else {
        return false;
    };
    let charset_ok = locale
        .split_once('.')
        .map_or(true, |(_, rest)| {
            let cs = rest.split('@').next().unwrap_or_default();
            !cs.is_empty() && cs.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    (2..=3).contains(&lang.len())
        && lang.chars().all(|c| c.is_ascii_lowercase())
        && country.len() == 2
        && country.chars().all(|c| c.is_ascii_uppercase())
        && charset_ok
}

/// `UTC` or a zoneinfo path such as `Europe/Rome` or
/// `America/Argentina/Buenos_Aires`.
pub fn is_valid_timezone(tz: &str) -> bool {
    if tz == "UTC" {
        return true;
    }
    let parts: Vec<&str> = tz.split('/').collect();
    parts.len() >= 2
        && parts.iter().all(|p| {
            p.starts_with(|c: char| c.is_ascii_uppercase())
                && p.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'))
        })
}

impl StepController for KeyboardStep {
    fn kind(&self) -> StepKind {
        StepKind::Keyboard
    }

    fn validate(&self, plan: &InstallPlan, _ctx: &PlanContext) -> Result<(), Vec<ValidationError>> {
        let mut f = Findings::new(StepKind::Keyboard);
        let Some(kb) = plan.keyboard() else {
            f.constraint("keyboard", "not answered");
            return f.finish();
        };
        if !target_config::is_known_keymap(&kb.layout) {
            f.constraint("layout", format!("unknown keymap layout '{}'", kb.layout));
        }
        if let Some(variant) = &kb.layout_variant {
            let ok = !variant.is_empty()
                && variant
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
            if !ok {
                f.constraint("layout_variant", format!("invalid keymap variant '{variant}'"));
            }
        }
        if !is_valid_locale(&kb.locale) {
            f.constraint("locale", format!("'{}' is not of the form ll_CC[.charset]", kb.locale));
        }
        if let Some(tz) = &kb.timezone {
            if !is_valid_timezone(tz) {
                f.constraint("timezone", format!("'{tz}' is not Region/City or UTC"));
            }
        }
        f.finish()
    }

    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError> {
        let fail = |e| ExecutionError::new(StepKind::Keyboard, e);
        let kb = plan
            .keyboard()
            .ok_or_else(|| ExecutionError::not_answered(StepKind::Keyboard))?;
        info!("console keymap {} locale {}", kb.layout, kb.locale);
        scope.staging.ensure_exists().map_err(fail)?;
        target_config::write_keyboard(scope.staging, kb).map_err(fail)
    }
}
