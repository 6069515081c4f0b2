//! Request headers understood by the garita server.
//!
//! ```text
//! Garita-Ingest-Secret: {plaintext secret}     (panel relays)
//! Garita-Caller-Id:     {uuid}                 (set by the upstream auth layer)
//! Garita-Caller-Roles:  1,2                    (role codes, comma separated)
//! ```

use crate::objects::codes::{CodeError, Role};

/// Header carrying the shared secret of panel relays.
pub const INGEST_SECRET_HEADER: &str = "Garita-Ingest-Secret";

/// Header carrying the authenticated caller id.
pub const CALLER_ID_HEADER: &str = "Garita-Caller-Id";

/// Header carrying the caller's role codes.
pub const CALLER_ROLES_HEADER: &str = "Garita-Caller-Roles";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RolesHeaderError {
    #[error("invalid role code {0:?}")]
    NotANumber(String),
    #[error(transparent)]
    Unknown(#[from] CodeError),
}

/// Parse a `Garita-Caller-Roles` value. Blank entries are ignored.
pub fn parse_roles(value: &str) -> Result<Vec<Role>, RolesHeaderError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let code: i16 = s
                .parse()
                .map_err(|_| RolesHeaderError::NotANumber(s.to_string()))?;
            Ok(Role::try_from(code)?)
        })
        .collect()
}

/// Format roles for the `Garita-Caller-Roles` header.
pub fn format_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|r| r.code().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roles() {
        assert_eq!(
            parse_roles("1, 2,,10").unwrap(),
            vec![Role::Admin, Role::Reception, Role::Visitor]
        );
        assert!(parse_roles("").unwrap().is_empty());
        assert!(matches!(
            parse_roles("admin"),
            Err(RolesHeaderError::NotANumber(_))
        ));
        assert!(matches!(parse_roles("3"), Err(RolesHeaderError::Unknown(_))));
    }

    #[test]
    fn test_format_roles() {
        assert_eq!(format_roles(&[Role::Internal, Role::Validator]), "4,7");
    }
}
