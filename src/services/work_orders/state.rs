//! Which commands each work-order status accepts.

use crate::{entities::work_order::WorkOrderStatus, errors::ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendQuotation,
    WaitForParts,
    Authorize,
    AssignTechnician,
    ReplaceLines,
    EditLines,
    Start,
    Finish,
    Deliver,
    Cancel,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::SendQuotation => "send the quotation of",
            Action::WaitForParts => "put on hold for parts",
            Action::Authorize => "authorize",
            Action::AssignTechnician => "assign a technician to",
            Action::ReplaceLines => "replace the lines of",
            Action::EditLines => "edit the lines of",
            Action::Start => "start",
            Action::Finish => "finish",
            Action::Deliver => "deliver",
            Action::Cancel => "cancel",
            Action::Delete => "delete",
        }
    }

    pub fn allowed(self, status: WorkOrderStatus) -> bool {
        use WorkOrderStatus::*;
        match self {
            Action::SendQuotation => status == Pending,
            Action::WaitForParts => matches!(status, Pending | Quoted),
            Action::Authorize => matches!(status, Pending | Quoted | WaitingAuth),
            Action::ReplaceLines => status == Pending,
            Action::Start => is_pre_start(status),
            Action::AssignTechnician | Action::EditLines => {
                is_pre_start(status) || status == InProcess
            }
            Action::Finish => status == InProcess,
            Action::Deliver => status == Completed,
            Action::Cancel => !matches!(status, Delivered | Cancelled),
            Action::Delete => status == Cancelled,
        }
    }
}

/// States in which work has not begun and no stock was consumed.
pub fn is_pre_start(status: WorkOrderStatus) -> bool {
    matches!(
        status,
        WorkOrderStatus::Pending
            | WorkOrderStatus::Quoted
            | WorkOrderStatus::WaitingAuth
            | WorkOrderStatus::WaitingParts
    )
}

/// Status reached once the quotation goes out.
pub fn quote_target(requires_authorization: bool) -> WorkOrderStatus {
    if requires_authorization {
        WorkOrderStatus::WaitingAuth
    } else {
        WorkOrderStatus::Quoted
    }
}

pub fn ensure(status: WorkOrderStatus, action: Action) -> Result<(), ServiceError> {
    if action.allowed(status) {
        Ok(())
    } else {
        Err(ServiceError::IllegalTransition(format!(
            "Cannot {} a work order that is {}",
            action.as_str(),
            status
        )))
    }
}
