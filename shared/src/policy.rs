use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Manager,
    Admin,
}

impl FromStr for Role {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(PolicyError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ReadCatalog,
    WriteCatalog,
    UseCart,
    PlaceOrder,
    CancelOwnOrder,
    ViewOwnOrders,
    ManageOrders,
    ViewOrdersFeed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("role {role:?} may not {action:?}")]
    Denied { role: Role, action: Action },
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

const EVERYONE: &[Role] = &[Role::User, Role::Manager, Role::Admin];
const STAFF: &[Role] = &[Role::Manager, Role::Admin];
const ADMIN: &[Role] = &[Role::Admin];

const POLICY: &[(Action, &[Role])] = &[
    (Action::ReadCatalog, EVERYONE),
    (Action::WriteCatalog, ADMIN),
    (Action::UseCart, EVERYONE),
    (Action::PlaceOrder, EVERYONE),
    (Action::CancelOwnOrder, EVERYONE),
    (Action::ViewOwnOrders, EVERYONE),
    (Action::ManageOrders, STAFF),
    (Action::ViewOrdersFeed, STAFF),
];

pub fn is_allowed(role: Role, action: Action) -> bool {
    POLICY
        .iter()
        .find(|(a, _)| *a == action)
        .map(|(_, roles)| roles.contains(&role))
        .unwrap_or(false)
}

pub fn authorize(role: Role, action: Action) -> Result<(), PolicyError> {
    if is_allowed(role, action) {
        Ok(())
    } else {
        Err(PolicyError::Denied { role, action })
    }
}
