//! Shared sign-in flow for sites that need an account.

use crate::browser::{Browser, WaitCondition};
use crate::ledger::CheckpointStep;
use crate::otp::{CodeSource, OTP_FIELD_SELECTORS};
use crate::vault::Secrets;

use super::{DriverError, StepContext};

/// Credential fields tried, in order, for the account identifier.
const USER_KEYS: &[&str] = &["email", "username", "member_id", "login_id"];

/// Selectors and URLs for one site's login form.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoginForm {
    pub url: &'static str,
    /// Present only when a user is signed in.
    pub signed_in: &'static str,
    pub user_field: &'static str,
    /// Button between the identifier and password pages, if the site splits them.
    pub continue_button: Option<&'static str>,
    pub password_field: &'static str,
    pub submit: &'static str,
    pub otp_source: CodeSource,
}

/// Sign in unless the session already is. Returns whether a login was
/// performed.
pub(crate) async fn ensure_signed_in(
    scx: &StepContext<'_>,
    browser: &dyn Browser,
    form: &LoginForm,
) -> Result<bool, DriverError> {
    if scx.is_present(browser, form.signed_in).await? {
        tracing::debug!(task_id = scx.task_id, service = scx.service, "already signed in");
        return Ok(false);
    }

    let credentials = scx
        .credentials
        .ok_or_else(|| DriverError::LoginRejected(format!("no credentials for {}", scx.service)))?;
    let user = account_identifier(credentials)
        .ok_or_else(|| DriverError::LoginRejected("credentials lack an account identifier".to_string()))?;
    let password = credentials
        .get("password")
        .ok_or_else(|| DriverError::LoginRejected("credentials lack a password".to_string()))?;

    tracing::info!(task_id = scx.task_id, service = scx.service, "signing in");
    scx.navigate(browser, form.url).await?;
    if !scx
        .wait_until(browser, WaitCondition::selector(form.user_field))
        .await?
    {
        return Err(DriverError::step_failed(
            CheckpointStep::Authenticated,
            "login form did not appear",
        ));
    }
    scx.fill(browser, form.user_field, user).await?;

    if let Some(button) = form.continue_button {
        if scx.is_present(browser, button).await? {
            scx.click(browser, button).await?;
            scx.wait_until(browser, WaitCondition::Loaded).await?;
        }
    }
    if !scx
        .wait_until(browser, WaitCondition::selector(form.password_field))
        .await?
    {
        return Err(DriverError::step_failed(
            CheckpointStep::Authenticated,
            "password field did not appear",
        ));
    }
    scx.fill(browser, form.password_field, password).await?;
    let mut landed = vec![form.signed_in];
    landed.extend_from_slice(OTP_FIELD_SELECTORS);
    scx.click_to_commit(browser, form.submit, &landed).await?;
    scx.wait_until(browser, WaitCondition::Loaded).await?;

    if let Some(field) = otp_field(scx, browser).await? {
        tracing::info!(task_id = scx.task_id, service = scx.service, "second factor requested");
        let code = scx.await_code(form.otp_source).await?;
        scx.fill(browser, field, &code).await?;
        scx.click_to_commit(browser, form.submit, &[form.signed_in]).await?;
        scx.wait_until(browser, WaitCondition::Loaded).await?;
    }

    if !scx.is_present(browser, form.signed_in).await? {
        return Err(DriverError::LoginRejected(format!(
            "still signed out of {} after submitting credentials",
            scx.service
        )));
    }
    Ok(true)
}

fn account_identifier(credentials: &Secrets) -> Option<&str> {
    USER_KEYS.iter().find_map(|key| credentials.get(key))
}

/// The first second-factor input on the page, if any.
async fn otp_field(scx: &StepContext<'_>, browser: &dyn Browser) -> Result<Option<&'static str>, DriverError> {
    for selector in OTP_FIELD_SELECTORS {
        if scx.is_present(browser, selector).await? {
            return Ok(Some(*selector));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_identifier_order() {
        let secrets = Secrets::new()
            .with("member_id", "1234")
            .with("email", "a@example.com");
        assert_eq!(account_identifier(&secrets), Some("a@example.com"));

        let secrets = Secrets::new().with("member_id", "1234");
        assert_eq!(account_identifier(&secrets), Some("1234"));

        assert_eq!(account_identifier(&Secrets::new()), None);
    }
}
