//! Marketplace purchases. The item is added to the cart and the run stops
//! there; checkout is left to the user.

use serde_json::json;

use crate::browser::{Browser, WaitCondition};
use crate::config::service_display_name;
use crate::ledger::CheckpointStep;
use crate::otp::CodeSource;

use super::login::{self, LoginForm};
use super::{staging_reference, DriverError, ExecutionResult, StepContext};

/// Supported marketplaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketplaceSite {
    Amazon,
    Rakuten,
}

/// Page structure of a marketplace.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MarketplaceProfile {
    pub login: LoginForm,
    pub add_to_cart: &'static str,
    /// Present once the item is in the cart.
    pub added_marker: &'static str,
    pub cart_url: &'static str,
}

const AMAZON: MarketplaceProfile = MarketplaceProfile {
    login: LoginForm {
        url: "https://www.amazon.co.jp/ap/signin?openid.assoc_handle=jpflex&openid.mode=checkid_setup&openid.ns=http%3A%2F%2Fspecs.openid.net%2Fauth%2F2.0",
        signed_in: "#nav-link-accountList-nav-line-1",
        user_field: r#"#ap_email, input[name="email"]"#,
        continue_button: Some(r#"#continue, input[name="continue"]"#),
        password_field: r#"#ap_password, input[name="password"]"#,
        submit: r#"#signInSubmit, input[name="signInSubmit"]"#,
        otp_source: CodeSource::Email,
    },
    add_to_cart: "#add-to-cart-button",
    added_marker: "#sw-atc-confirmation, #NATC_SMART_WAGON_CONF_MSG_SUCCESS, #attachDisplayAddBaseAlert",
    cart_url: "https://www.amazon.co.jp/gp/cart/view.html",
};

const RAKUTEN: MarketplaceProfile = MarketplaceProfile {
    login: LoginForm {
        url: "https://grp01.id.rakuten.co.jp/rms/nid/vc?__event=login&service_id=top",
        signed_in: r#".member-name, [class*="memberName"]"#,
        user_field: r#"#loginInner_u, input[name="u"]"#,
        continue_button: None,
        password_field: r#"#loginInner_p, input[name="p"]"#,
        submit: r#"input[type="submit"], button[type="submit"]"#,
        otp_source: CodeSource::Email,
    },
    add_to_cart: r#"button[data-testid="add-to-cart"], .add-to-cart-button"#,
    added_marker: r#".cart-added, [class*="addedToCart"]"#,
    cart_url: "https://basket.step.rakuten.co.jp/rms/basket/",
};

impl MarketplaceSite {
    pub fn service(&self) -> &'static str {
        match self {
            MarketplaceSite::Amazon => "amazon",
            MarketplaceSite::Rakuten => "rakuten",
        }
    }

    pub(crate) fn profile(&self) -> &'static MarketplaceProfile {
        match self {
            MarketplaceSite::Amazon => &AMAZON,
            MarketplaceSite::Rakuten => &RAKUTEN,
        }
    }
}

pub(crate) async fn drive(
    scx: &StepContext<'_>,
    browser: &dyn Browser,
    site: MarketplaceSite,
) -> Result<ExecutionResult, DriverError> {
    let profile = site.profile();
    let target = scx.target;
    let url = target
        .url
        .as_deref()
        .or_else(|| target.detail_str("booking_url"))
        .ok_or_else(|| DriverError::step_failed(CheckpointStep::OpenedTarget, "product URL not specified"))?;

    scx.navigate(browser, url).await?;
    scx.checkpoint(CheckpointStep::OpenedTarget, json!({ "url": url }))
        .await?;

    // Signing in lands on the account pages, so go back to the product
    if login::ensure_signed_in(scx, browser, &profile.login).await? {
        scx.navigate(browser, url).await?;
    }
    scx.checkpoint(CheckpointStep::Authenticated, json!({ "logged_in": true }))
        .await?;

    if scx.is_present(browser, profile.added_marker).await? {
        tracing::info!(task_id = scx.task_id, service = scx.service, "item already in cart");
    } else {
        if !scx
            .wait_until(browser, WaitCondition::selector(profile.add_to_cart))
            .await?
        {
            return Err(DriverError::step_failed(
                CheckpointStep::EnteredDetails,
                "add to cart button not found; the product may be out of stock",
            ));
        }
        scx.click_to_commit(browser, profile.add_to_cart, &[profile.added_marker])
            .await?;
        if !scx
            .wait_until(browser, WaitCondition::selector(profile.added_marker))
            .await?
        {
            return Err(DriverError::step_failed(
                CheckpointStep::EnteredDetails,
                "the cart did not confirm the item",
            ));
        }
    }
    scx.checkpoint(CheckpointStep::EnteredDetails, json!({ "action": "added_to_cart" }))
        .await?;
    scx.checkpoint(CheckpointStep::Confirmed, json!({ "cart_verified": true }))
        .await?;

    let cart_id = staging_reference("CART");
    scx.checkpoint(CheckpointStep::Completed, json!({ "cart_id": cart_id }))
        .await?;

    Ok(ExecutionResult::success(format!(
        "Product added to cart. Please complete the purchase manually on {}.",
        service_display_name(site.service())
    ))
    .with_confirmation_id(cart_id)
    .with_detail("product_name", target.title.clone())
    .with_detail("price", target.price)
    .with_detail("url", url)
    .with_detail("cart_url", profile.cart_url))
}
