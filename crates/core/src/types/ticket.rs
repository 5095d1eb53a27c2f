//! The ticket wire record and the inputs that create and change it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Category, Email, Phone, Priority, TicketId, TicketStatus};

/// A support ticket as stored and delivered to viewers.
///
/// `id`, `created_by`, `version` and both timestamps are server-assigned.
/// `version` starts at 1 and increases by exactly one on every accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub category: Category,
    pub status: TicketStatus,
    pub created_by: Email,
    pub assigned_to: Option<String>,
    pub contact_email: Email,
    pub phone: Phone,
    pub attachment_ref: Option<String>,
    pub agent_remarks: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Whether `identity` created this ticket.
    #[must_use]
    pub fn is_owned_by(&self, identity: &Email) -> bool {
        &self.created_by == identity
    }
}

/// Unvalidated input for creating a ticket.
///
/// Contact fields are raw strings; the store validates them on create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketDraft {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub category: Category,
    pub contact_email: String,
    pub phone: String,
    /// Support-only at creation.
    pub assigned_to: Option<String>,
    /// Support-only at creation.
    pub agent_remarks: Option<String>,
    pub attachment_ref: Option<String>,
}

impl TicketDraft {
    /// Whether the draft pre-sets any field only support may write.
    #[must_use]
    pub const fn sets_support_fields(&self) -> bool {
        self.assigned_to.is_some() || self.agent_remarks.is_some()
    }
}

/// A partial change to an existing ticket. `None` leaves a field untouched.
///
/// `assigned_to` is doubly optional: `Some(None)` unassigns the ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TicketPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TicketStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_remarks: Option<String>,
}

impl TicketPatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.touches_content_fields() && !self.touches_support_fields()
    }

    /// Whether the patch writes a field that only support may change.
    #[must_use]
    pub const fn touches_support_fields(&self) -> bool {
        self.status.is_some()
            || self.priority.is_some()
            || self.assigned_to.is_some()
            || self.agent_remarks.is_some()
    }

    /// Whether the patch writes a creator-editable content field.
    #[must_use]
    pub const fn touches_content_fields(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || self.category.is_some()
            || self.attachment_ref.is_some()
    }

    /// Copy every set field onto `ticket`.
    ///
    /// Only field values change; `version` and timestamps are left to the caller.
    pub fn apply_to(&self, ticket: &mut Ticket) {
        if let Some(title) = &self.title {
            ticket.title.clone_from(title);
        }
        if let Some(description) = &self.description {
            ticket.description.clone_from(description);
        }
        if let Some(category) = self.category {
            ticket.category = category;
        }
        if let Some(attachment_ref) = &self.attachment_ref {
            ticket.attachment_ref = Some(attachment_ref.clone());
        }
        if let Some(status) = self.status {
            ticket.status = status;
        }
        if let Some(priority) = self.priority {
            ticket.priority = priority;
        }
        if let Some(assigned_to) = &self.assigned_to {
            ticket.assigned_to.clone_from(assigned_to);
        }
        if let Some(agent_remarks) = &self.agent_remarks {
            ticket.agent_remarks = Some(agent_remarks.clone());
        }
    }
}
