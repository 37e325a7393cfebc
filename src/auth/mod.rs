pub mod middleware;
pub mod password;
pub mod session;
pub mod token;
pub mod users;

use std::str::FromStr;

/// Operator roles, closed set. Policy content beyond this mapping lives
/// outside the core; handlers only ask `check_permission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "operator" => Ok(Self::Operator),
            "viewer" => Ok(Self::Viewer),
            other => Err(anyhow::anyhow!("unknown role: {other}")),
        }
    }
}

/// The permission predicate the core consumes. `action` is one of
/// `read`, `exec`, `write`, `admin`.
pub fn check_permission(role: Role, _resource: &str, action: &str) -> bool {
    match role {
        Role::Admin => true,
        Role::Operator => matches!(action, "read" | "exec"),
        Role::Viewer => action == "read",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip() {
        for role in [Role::Admin, Role::Operator, Role::Viewer] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn permission_matrix() {
        assert!(check_permission(Role::Admin, "recordings", "admin"));
        assert!(check_permission(Role::Operator, "terminal", "exec"));
        assert!(!check_permission(Role::Operator, "recordings", "admin"));
        assert!(check_permission(Role::Viewer, "audit", "read"));
        assert!(!check_permission(Role::Viewer, "terminal", "exec"));
    }
}
