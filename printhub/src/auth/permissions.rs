//! Role-based access control.
//!
//! Each [`Role`] grants a fixed set of `(Resource, Operation)` pairs. `*All` operations imply the
//! matching `*Own` operation; `is_admin` users pass every check.

use crate::{
    api::models::users::{CurrentUser, Role},
    errors::{Error, Result},
    types::{Operation, Permission, Resource, UserId},
};

use Operation::*;
use Resource::*;

/// The unrestricted counterpart of an operation
fn widen(operation: Operation) -> Operation {
    match operation {
        CreateOwn | CreateAll => CreateAll,
        ReadOwn | ReadAll => ReadAll,
        UpdateOwn | UpdateAll => UpdateAll,
        DeleteOwn | DeleteAll => DeleteAll,
    }
}

/// The owner-restricted counterpart of an operation
fn narrow(operation: Operation) -> Operation {
    match operation {
        CreateOwn | CreateAll => CreateOwn,
        ReadOwn | ReadAll => ReadOwn,
        UpdateOwn | UpdateAll => UpdateOwn,
        DeleteOwn | DeleteAll => DeleteOwn,
    }
}

fn grants(role: Role) -> &'static [(Resource, Operation)] {
    match role {
        Role::Customer => &[
            (Users, ReadOwn),
            (Users, UpdateOwn),
            (Orders, CreateOwn),
            (Orders, ReadOwn),
            (Orders, UpdateOwn),
            (Payments, CreateOwn),
            (Payments, ReadOwn),
            (Credits, CreateOwn),
            (Credits, ReadOwn),
            (Appointments, CreateOwn),
            (Appointments, ReadOwn),
            (Appointments, UpdateOwn),
            (DesignRequests, CreateOwn),
            (DesignRequests, ReadOwn),
            (Files, CreateOwn),
            (Files, ReadOwn),
            (Files, DeleteOwn),
            (Materials, ReadAll),
        ],
        Role::OrderManager => &[
            (Users, ReadAll),
            (Orders, ReadAll),
            (Orders, UpdateAll),
            (Payments, ReadAll),
            (Appointments, ReadAll),
            (Appointments, UpdateAll),
            (DesignRequests, ReadAll),
            (DesignRequests, UpdateAll),
            (Files, ReadAll),
            (Printers, ReadAll),
            (Dashboard, ReadAll),
        ],
        Role::PrintOperator => &[
            (Orders, ReadAll),
            (Orders, UpdateAll),
            (Printers, ReadAll),
            (Printers, UpdateAll),
            (Files, ReadAll),
            (Dashboard, ReadAll),
        ],
        Role::BillingManager => &[
            (Users, ReadAll),
            (Orders, ReadAll),
            (Payments, ReadAll),
            (Payments, UpdateAll),
            (Credits, ReadAll),
            (Credits, CreateAll),
            (Dashboard, ReadAll),
        ],
        Role::ShopAdmin => &[
            (Users, ReadAll),
            (Users, UpdateAll),
            (Users, DeleteAll),
            (Orders, ReadAll),
            (Orders, UpdateAll),
            (Payments, ReadAll),
            (Appointments, ReadAll),
            (Appointments, UpdateAll),
            (DesignRequests, ReadAll),
            (DesignRequests, UpdateAll),
            (Files, ReadAll),
            (Materials, CreateAll),
            (Materials, ReadAll),
            (Materials, UpdateAll),
            (Materials, DeleteAll),
            (Printers, CreateAll),
            (Printers, ReadAll),
            (Printers, UpdateAll),
            (Printers, DeleteAll),
            (Settings, ReadAll),
            (Settings, UpdateAll),
            (Dashboard, ReadAll),
        ],
    }
}

pub fn role_has_permission(role: Role, resource: Resource, operation: Operation) -> bool {
    let granted = grants(role);
    granted.contains(&(resource, operation))
        || (narrow(operation) == operation && granted.contains(&(resource, widen(operation))))
}

pub fn has_permission(user: &CurrentUser, resource: Resource, operation: Operation) -> bool {
    user.is_admin || user.roles.iter().any(|role| role_has_permission(*role, resource, operation))
}

pub fn is_satisfied(user: &CurrentUser, permission: &Permission) -> bool {
    match permission {
        Permission::Allow(resource, operation) => has_permission(user, *resource, *operation),
        Permission::Any(options) => options.iter().any(|p| is_satisfied(user, p)),
    }
}

/// Fail with 403 unless the user holds the permission.
pub fn require(user: &CurrentUser, resource: Resource, operation: Operation) -> Result<()> {
    if has_permission(user, resource, operation) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            required: Permission::Allow(resource, operation),
            action: operation,
            resource: resource.to_string(),
        })
    }
}

/// True if the user may act on every entity of the resource, not just their own.
pub fn can_access_all(user: &CurrentUser, resource: Resource, operation: Operation) -> bool {
    has_permission(user, resource, widen(operation))
}

/// Allow the `*All` permission, or the `*Own` permission when `owner` is the user.
pub fn require_access(user: &CurrentUser, resource: Resource, operation: Operation, owner: Option<UserId>) -> Result<()> {
    let permission = Permission::Any(vec![
        Permission::Allow(resource, widen(operation)),
        Permission::Allow(resource, narrow(operation)),
    ]);
    let owns = owner == Some(user.id);

    if can_access_all(user, resource, operation) || (owns && is_satisfied(user, &permission)) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            required: permission,
            action: operation,
            resource: resource.to_string(),
        })
    }
}
