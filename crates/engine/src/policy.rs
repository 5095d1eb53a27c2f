//! Role-based read/write policy.
//!
//! | Action | Customer | Support |
//! |---|---|---|
//! | create (as self) | allow, no support-only fields | allow |
//! | read | own tickets only | any |
//! | change status, priority, assignee, remarks | deny | allow |
//! | change title, description, category, attachment | own, while `Open` | any, while `Open` |
//! | delete | own tickets only | any |
//!
//! Status changes must also follow a legal edge of the ticket state machine.

use serde::{Deserialize, Serialize};

use ticket_desk_core::{Email, Role, Ticket, TicketDraft, TicketPatch, TicketStatus};

use crate::error::{AuthError, TicketError, ValidationError};

/// An operation a viewer wants to perform, with its target.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    Create(&'a TicketDraft),
    Read(&'a Ticket),
    Update {
        ticket: &'a Ticket,
        patch: &'a TicketPatch,
    },
    Delete(&'a Ticket),
}

/// Why an action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Forbidden(&'static str),
    IllegalTransition { from: TicketStatus, to: TicketStatus },
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    /// Whether the action may proceed.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert a denial into the error surfaced to the caller.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` or `ValidationError::IllegalTransition`
    /// when the decision is a denial.
    pub fn into_result(self) -> Result<(), TicketError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(Denial::Forbidden(reason)) => {
                Err(AuthError::Forbidden(reason.to_string()).into())
            }
            Self::Deny(Denial::IllegalTransition { from, to }) => {
                Err(ValidationError::IllegalTransition { from, to }.into())
            }
        }
    }
}

/// Which tickets a viewer asks to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryScope {
    /// Tickets created by the caller.
    #[serde(rename = "self")]
    Own,
    /// Every ticket. Support only.
    All,
}

/// A resolved filter over tickets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopePredicate {
    CreatedBy(Email),
    All,
}

impl ScopePredicate {
    /// Whether `ticket` falls inside this scope.
    #[must_use]
    pub fn matches(&self, ticket: &Ticket) -> bool {
        match self {
            Self::CreatedBy(identity) => ticket.is_owned_by(identity),
            Self::All => true,
        }
    }
}

/// Stateless policy evaluator.
pub struct AuthorizationGate;

impl AuthorizationGate {
    /// Decide whether `actor` holding `role` may perform `action`.
    #[must_use]
    pub fn authorize(role: Role, actor: &Email, action: Action<'_>) -> Decision {
        match action {
            Action::Create(draft) => {
                if role == Role::Customer && draft.sets_support_fields() {
                    return Decision::Deny(Denial::Forbidden(
                        "customers may not set assignment or agent remarks",
                    ));
                }
                Decision::Allow
            }
            Action::Read(ticket) => {
                if role == Role::Customer && !ticket.is_owned_by(actor) {
                    return Decision::Deny(Denial::Forbidden(
                        "customers may only read their own tickets",
                    ));
                }
                Decision::Allow
            }
            Action::Update { ticket, patch } => Self::authorize_update(role, actor, ticket, patch),
            Action::Delete(ticket) => {
                if role == Role::Customer && !ticket.is_owned_by(actor) {
                    return Decision::Deny(Denial::Forbidden(
                        "customers may only delete their own tickets",
                    ));
                }
                Decision::Allow
            }
        }
    }

    fn authorize_update(
        role: Role,
        actor: &Email,
        ticket: &Ticket,
        patch: &TicketPatch,
    ) -> Decision {
        if role == Role::Customer && !ticket.is_owned_by(actor) {
            return Decision::Deny(Denial::Forbidden(
                "customers may only edit their own tickets",
            ));
        }

        if patch.touches_support_fields() && role != Role::Support {
            return Decision::Deny(Denial::Forbidden(
                "only support may change status, priority, assignment or remarks",
            ));
        }

        if patch.touches_content_fields() && ticket.status != TicketStatus::Open {
            return Decision::Deny(Denial::Forbidden(
                "ticket content can only be edited while the ticket is open",
            ));
        }

        if let Some(to) = patch.status {
            if let Err(denial) = Self::check_transition(ticket.status, to) {
                return Decision::Deny(denial);
            }
        }

        Decision::Allow
    }

    /// Check a status change against the state machine.
    ///
    /// Setting the current status again is not a transition and passes.
    ///
    /// # Errors
    ///
    /// Returns `Denial::IllegalTransition` for any edge outside
    /// `Open -> InProgress -> Closed` and `InProgress -> Open`.
    pub fn check_transition(from: TicketStatus, to: TicketStatus) -> Result<(), Denial> {
        if from == to || from.can_transition_to(to) {
            Ok(())
        } else {
            Err(Denial::IllegalTransition { from, to })
        }
    }

    /// Resolve a requested query scope into the filter the server applies.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Forbidden` if a customer asks for every ticket.
    pub fn scope_for(role: Role, actor: &Email, scope: QueryScope) -> Result<ScopePredicate, AuthError> {
        match (role, scope) {
            (_, QueryScope::Own) => Ok(ScopePredicate::CreatedBy(actor.clone())),
            (Role::Support, QueryScope::All) => Ok(ScopePredicate::All),
            (Role::Customer, QueryScope::All) => Err(AuthError::Forbidden(
                "customers may only query their own tickets".to_string(),
            )),
        }
    }
}
