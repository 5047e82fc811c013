//! Train and highway-bus reservations. The run walks up to the booking
//! confirmation screen and stops without committing the reservation.

use serde_json::json;

use crate::browser::{Browser, WaitCondition};
use crate::config::service_display_name;
use crate::ledger::CheckpointStep;
use crate::otp::CodeSource;

use super::login::{self, LoginForm};
use super::{staging_reference, DriverError, ExecutionResult, StepContext};

/// Supported reservation sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationSite {
    /// Tokaido/Sanyo shinkansen.
    SmartEx,
    /// WILLER EXPRESS highway buses.
    Willer,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReservationProfile {
    pub login: LoginForm,
    pub search_url: &'static str,
    pub departure_field: &'static str,
    pub arrival_field: &'static str,
    pub date_field: &'static str,
    pub time_field: Option<&'static str>,
    pub search_button: &'static str,
    pub result_item: &'static str,
    pub select_button: &'static str,
    /// Present on the final confirmation screen.
    pub confirm_screen: &'static str,
    pub default_route: (&'static str, &'static str),
    pub manage_url: &'static str,
}

const SMART_EX: ReservationProfile = ReservationProfile {
    login: LoginForm {
        url: "https://expy.jp/member/login/",
        signed_in: r#"a[href*="logout"], .member-name"#,
        user_field: r#"input[name="memberId"], input[name="userId"], #memberId"#,
        continue_button: None,
        password_field: r#"input[name="password"], input[type="password"], #password"#,
        submit: r#"button[type="submit"], input[type="submit"], .login-submit"#,
        otp_source: CodeSource::Email,
    },
    search_url: "https://expy.jp/reservation/",
    departure_field: r#"select[name="departure"], #departureStation, input[name="from"]"#,
    arrival_field: r#"select[name="arrival"], #arrivalStation, input[name="to"]"#,
    date_field: r#"input[name="date"], input[type="date"], #reservationDate"#,
    time_field: Some(r#"input[name="time"], select[name="hour"], #departureTime"#),
    search_button: r#".search-button, button[name="search"]"#,
    result_item: ".train-item, tr.train-row, .result-item",
    select_button: r#".reserve-button, a[href*="reserve"]"#,
    confirm_screen: ".confirm-button, .reservation-confirm",
    default_route: ("東京", "新大阪"),
    manage_url: "https://expy.jp/member/mypage/",
};

const WILLER: ReservationProfile = ReservationProfile {
    login: LoginForm {
        url: "https://travel.willer.co.jp/dy/3/common/pc/login/",
        signed_in: r#"a[href*="logout"]"#,
        user_field: r#"input[name*="mail"], input[type="email"]"#,
        continue_button: None,
        password_field: r#"input[name*="pass"], input[type="password"]"#,
        submit: r#"button[type="submit"], input[type="submit"]"#,
        otp_source: CodeSource::Email,
    },
    search_url: "https://travel.willer.co.jp/",
    departure_field: r#"select[name*="dep"], #departure"#,
    arrival_field: r#"select[name*="arr"], #arrival"#,
    date_field: r#"input[name*="date"], input[placeholder*="日付"]"#,
    time_field: None,
    search_button: r#".search-button, button[name="search"]"#,
    result_item: r#".bus-item, [class*="result"]"#,
    select_button: r#".book-button, a[href*="reserve"]"#,
    confirm_screen: r#".reservation-confirm, [class*="confirm"]"#,
    default_route: ("東京", "大阪"),
    manage_url: "https://travel.willer.co.jp/dy/3/common/pc/mypage/menu/index",
};

impl ReservationSite {
    pub fn service(&self) -> &'static str {
        match self {
            ReservationSite::SmartEx => "ex_reservation",
            ReservationSite::Willer => "willer",
        }
    }

    pub(crate) fn profile(&self) -> &'static ReservationProfile {
        match self {
            ReservationSite::SmartEx => &SMART_EX,
            ReservationSite::Willer => &WILLER,
        }
    }
}

pub(crate) async fn drive(
    scx: &StepContext<'_>,
    browser: &dyn Browser,
    site: ReservationSite,
) -> Result<ExecutionResult, DriverError> {
    let profile = site.profile();
    let target = scx.target;
    let url = target.url.as_deref().unwrap_or(profile.search_url);
    let departure = target.detail_str("departure").unwrap_or(profile.default_route.0);
    let arrival = target.detail_str("arrival").unwrap_or(profile.default_route.1);
    let date = target.detail_str("date").unwrap_or_default();
    let time = target.detail_str("time").unwrap_or_default();

    scx.navigate(browser, url).await?;
    scx.checkpoint(CheckpointStep::OpenedTarget, json!({ "url": url }))
        .await?;

    if login::ensure_signed_in(scx, browser, &profile.login).await? {
        scx.navigate(browser, url).await?;
    }
    scx.checkpoint(CheckpointStep::Authenticated, json!({ "logged_in": true }))
        .await?;

    // A previous attempt may already have reached the confirmation screen
    let resumed = scx.is_present(browser, profile.confirm_screen).await?;
    if resumed {
        tracing::info!(task_id = scx.task_id, service = scx.service, "already on the confirmation screen");
    } else {
        enter_route(scx, browser, profile, [departure, arrival, date, time]).await?;
    }
    scx.checkpoint(
        CheckpointStep::EnteredDetails,
        json!({ "departure": departure, "arrival": arrival, "date": date, "time": time }),
    )
    .await?;

    if !resumed {
        if !scx
            .wait_until(browser, WaitCondition::selector(profile.select_button))
            .await?
        {
            return Err(DriverError::step_failed(
                CheckpointStep::SelectedItem,
                "no bookable option in the results",
            ));
        }
        scx.click_to_commit(browser, profile.select_button, &[profile.confirm_screen])
            .await?;
        if !scx
            .wait_until(browser, WaitCondition::selector(profile.confirm_screen))
            .await?
        {
            return Err(DriverError::step_failed(
                CheckpointStep::SelectedItem,
                "the confirmation screen did not appear",
            ));
        }
    }
    scx.checkpoint(CheckpointStep::SelectedItem, json!({ "selected": true, "resumed": resumed }))
        .await?;
    scx.checkpoint(CheckpointStep::Confirmed, json!({ "stopped_before_commit": true }))
        .await?;

    let reservation_id = staging_reference("RSV");
    scx.checkpoint(CheckpointStep::Completed, json!({ "reservation_id": reservation_id }))
        .await?;

    Ok(ExecutionResult::success(format!(
        "Reached the reservation confirmation screen. Please complete the booking manually on {}.",
        service_display_name(site.service())
    ))
    .with_confirmation_id(reservation_id)
    .with_detail("departure", departure)
    .with_detail("arrival", arrival)
    .with_detail("date", date)
    .with_detail("time", time)
    .with_detail("title", target.title.clone())
    .with_detail("reservation_url", profile.manage_url))
}

/// Fill the search form and wait for results. Fields missing from the
/// page are skipped.
async fn enter_route(
    scx: &StepContext<'_>,
    browser: &dyn Browser,
    profile: &ReservationProfile,
    [departure, arrival, date, time]: [&str; 4],
) -> Result<(), DriverError> {
    let mut fields = vec![
        (profile.departure_field, departure),
        (profile.arrival_field, arrival),
        (profile.date_field, date),
    ];
    if let Some(time_field) = profile.time_field {
        fields.push((time_field, time));
    }

    for (selector, value) in fields {
        if value.is_empty() {
            continue;
        }
        if scx.is_present(browser, selector).await? {
            scx.fill(browser, selector, value).await?;
        }
    }

    if scx.is_present(browser, profile.search_button).await? {
        scx.click(browser, profile.search_button).await?;
        scx.wait_until(browser, WaitCondition::Loaded).await?;
    }
    if !scx
        .wait_until(browser, WaitCondition::selector(profile.result_item))
        .await?
    {
        return Err(DriverError::step_failed(
            CheckpointStep::EnteredDetails,
            "no departures found; check the route and date",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::executor::{Executor, FailureKind, RunRequest};
    use crate::ledger::ExecutionStatus;
    use crate::otp::InboundMessage;
    use crate::search::{SearchCategory, SearchResult};
    use crate::testing::{executor_context, BrowserScript, RecordingBrowserProvider};
    use crate::vault::Secrets;

    fn signed_in_script(profile: &ReservationProfile) -> BrowserScript {
        BrowserScript::default()
            .present(profile.login.signed_in)
            .present(profile.departure_field)
            .present(profile.arrival_field)
            .present(profile.search_button)
            .reveal_on_click(profile.search_button, profile.result_item)
            .reveal_on_click(profile.search_button, profile.select_button)
            .reveal_on_click(profile.select_button, profile.confirm_screen)
    }

    fn shinkansen() -> SearchResult {
        SearchResult::new("r0", SearchCategory::Train, "のぞみ 東京→新大阪")
            .with_detail("departure", "東京")
            .with_detail("arrival", "新大阪")
            .with_detail("date", "2025-03-01")
            .with_price(14720)
    }

    fn member() -> Secrets {
        Secrets::new()
            .with("member_id", "1234567890")
            .with("password", "pw-secret")
    }

    #[tokio::test]
    async fn test_reaches_confirmation_screen() {
        let profile = ReservationSite::SmartEx.profile();
        let provider = Arc::new(RecordingBrowserProvider::new(signed_in_script(profile)));
        let cx = executor_context(provider.clone());

        let request = RunRequest::new("task-rsv", "alice", shinkansen()).with_credentials(member());
        let result = Executor::Reservation(ReservationSite::SmartEx).run(&cx, request).await;

        assert!(result.success, "{}", result.message);
        assert!(result.confirmation_id.as_deref().unwrap().starts_with("RSV-"));
        assert_eq!(result.details["arrival"], "新大阪");

        let calls = provider.calls();
        assert!(calls.contains(&format!("navigate {}", profile.search_url)));
        assert!(calls.contains(&format!("fill {}", profile.departure_field)));
        // The final commit button is never pressed
        assert!(!calls.contains(&format!("click {}", profile.confirm_screen)));

        let state = cx.ledger.status("task-rsv").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(state.steps_completed, CheckpointStep::RESERVATION.to_vec());
    }

    #[tokio::test]
    async fn test_driver_error_records_failure_with_screenshot() {
        let profile = ReservationSite::SmartEx.profile();
        let script = signed_in_script(profile).fail_click(profile.select_button);
        let provider = Arc::new(RecordingBrowserProvider::new(script));
        let cx = executor_context(provider.clone());

        let request = RunRequest::new("task-err", "alice", shinkansen()).with_credentials(member());
        let result = Executor::Reservation(ReservationSite::SmartEx).run(&cx, request).await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::StepFailed));
        assert!(result.details.contains_key("screenshot"));

        let state = cx.ledger.status("task-err").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
        assert_eq!(state.current_step, Some(CheckpointStep::SelectedItem));
        assert!(state.error_message.is_some());
        assert!(state.screenshot_ref.is_some());
        assert!(provider.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn test_second_factor_uses_broker_code() {
        let profile = ReservationSite::Willer.profile();
        let form = profile.login;
        let otp_field = crate::otp::OTP_FIELD_SELECTORS[0];
        let script = BrowserScript::default()
            .present(form.user_field)
            .present(form.password_field)
            .present(form.submit)
            .reveal_on_click(form.submit, otp_field)
            .reveal_on_click(form.submit, form.signed_in)
            .present(profile.result_item)
            .present(profile.select_button)
            .reveal_on_click(profile.select_button, profile.confirm_screen);
        let provider = Arc::new(RecordingBrowserProvider::new(script));
        let cx = executor_context(provider.clone());

        cx.otp
            .ingest(InboundMessage::new(
                "carol",
                CodeSource::Email,
                "no-reply@willer.co.jp",
                "認証コード: 774411",
            ))
            .await;

        let target = SearchResult::new("r0", SearchCategory::Bus, "WILLER 東京→大阪");
        let request = RunRequest::new("task-bus", "carol", target).with_credentials(
            Secrets::new()
                .with("email", "carol@example.com")
                .with("password", "pw"),
        );
        let result = Executor::Reservation(ReservationSite::Willer).run(&cx, request).await;

        assert!(result.success, "{}", result.message);
        assert!(provider.calls().contains(&format!("fill {}", otp_field)));
        let codes = cx.otp.history("carol", 5).await;
        assert_eq!(codes.len(), 1);
        assert!(codes[0].used);
    }

    #[tokio::test]
    async fn test_resumes_from_confirmation_screen() {
        let profile = ReservationSite::SmartEx.profile();
        let script = BrowserScript::default()
            .present(profile.login.signed_in)
            .present(profile.confirm_screen);
        let provider = Arc::new(RecordingBrowserProvider::new(script));
        let cx = executor_context(provider.clone());

        let request = RunRequest::new("task-resume", "alice", shinkansen()).with_credentials(member());
        let result = Executor::Reservation(ReservationSite::SmartEx).run(&cx, request).await;

        assert!(result.success, "{}", result.message);
        assert!(!provider.calls().iter().any(|c| c.starts_with("click")));
    }
}
