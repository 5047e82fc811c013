//! Money transfers. Only the simulated bank exists; real banks are not
//! automated.

use serde_json::json;

use crate::ledger::CheckpointStep;
use crate::search::format_price;

use super::{staging_reference, DriverError, ExecutionResult, StepContext};

/// Supported transfer back ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Simulation,
}

impl TransferKind {
    pub fn service(&self) -> &'static str {
        match self {
            TransferKind::Simulation => "bank_simulation",
        }
    }
}

pub(crate) async fn simulate(scx: &StepContext<'_>, kind: TransferKind) -> Result<ExecutionResult, DriverError> {
    let target = scx.target;
    let amount = target.price;
    let recipient = target
        .detail_str("recipient")
        .or_else(|| target.detail_str("account_holder"))
        .unwrap_or("unknown");

    scx.checkpoint(CheckpointStep::OpenedTarget, json!({ "bank": kind.service(), "simulated": true }))
        .await?;
    scx.checkpoint(CheckpointStep::Authenticated, json!({ "simulated": true }))
        .await?;
    scx.checkpoint(
        CheckpointStep::EnteredDetails,
        json!({ "recipient": recipient, "amount": amount }),
    )
    .await?;
    scx.checkpoint(CheckpointStep::Confirmed, json!({ "simulated": true }))
        .await?;

    let transaction_id = staging_reference("SIM");
    scx.checkpoint(CheckpointStep::Completed, json!({ "transaction_id": transaction_id }))
        .await?;

    let message = match amount {
        Some(amount) => format!("Simulated transfer of {} to {} completed", format_price(amount), recipient),
        None => format!("Simulated transfer to {} completed", recipient),
    };
    Ok(ExecutionResult::success(message)
        .with_confirmation_id(transaction_id)
        .with_detail("amount", amount)
        .with_detail("recipient", recipient)
        .with_detail("simulated", true))
}
