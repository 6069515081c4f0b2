//! Closed code enumerations shared by the API, the database and the panels.
//!
//! Every code travels as a small integer on the wire and in storage. Decoding
//! an integer that is not listed here fails with [`CodeError`] instead of
//! being carried around as an opaque number.

use serde::{Deserialize, Serialize};

/// An integer that does not name any known variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} code: {code}")]
pub struct CodeError {
    pub kind: &'static str,
    pub code: i16,
}

macro_rules! closed_code {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "i16", into = "i16")]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const fn code(self) -> i16 {
                self as i16
            }
        }

        impl TryFrom<i16> for $name {
            type Error = CodeError;

            fn try_from(code: i16) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok($name::$variant),)+
                    _ => Err(CodeError { kind: $kind, code }),
                }
            }
        }

        impl From<$name> for i16 {
            fn from(value: $name) -> i16 {
                value.code()
            }
        }
    };
}

closed_code! {
    /// Event type (`tipo_check`).
    CheckType, "check type" {
        Invalid = 0,
        Pending = 1,
        Granted = 2,
        Rejected = 3,
        /// Waiting for the host to validate the visit.
        AwaitingValidation = 4,
        Entry = 5,
        Exit = 6,
        Undefined = 7,
        Cancelled = 8,
        Finalized = 9,
        AutoFinalized = 10,
        AutoCancelled = 12,
    }
}

impl CheckType {
    /// Terminal types deactivate the registration they are appended to.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            CheckType::Cancelled
                | CheckType::Finalized
                | CheckType::AutoFinalized
                | CheckType::AutoCancelled
        )
    }

    /// Physical movement through an access point.
    pub const fn is_movement(self) -> bool {
        matches!(self, CheckType::Entry | CheckType::Exit)
    }
}

closed_code! {
    /// Origin of an event (`tipo_dispositivo`).
    DeviceKind, "device kind" {
        System = 1,
        Qr = 2,
        Panel = 3,
        Mobile = 4,
    }
}

closed_code! {
    /// How an access point is enforced.
    AccessMode, "access mode" {
        /// Reception or QR gate only; never mirrored to hardware.
        EntryOnly = 1,
        /// Gate backed by a facial-recognition panel.
        Panel = 2,
    }
}

closed_code! {
    Role, "role" {
        Admin = 1,
        Reception = 2,
        Internal = 4,
        Reports = 5,
        Attendance = 6,
        Validator = 7,
        Visitor = 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_codes_are_rejected() {
        assert_eq!(CheckType::try_from(11).unwrap_err().code, 11);
        assert!(DeviceKind::try_from(0).is_err());
        assert!(AccessMode::try_from(3).is_err());
        assert!(Role::try_from(3).is_err());
    }

    #[test]
    fn test_terminal_types() {
        let terminal: Vec<i16> = CheckType::ALL
            .iter()
            .filter(|c| c.is_terminal())
            .map(|c| c.code())
            .collect();
        assert_eq!(terminal, vec![8, 9, 10, 12]);
    }

    #[test]
    fn test_serde_uses_numeric_codes() {
        let json = serde_json::to_string(&CheckType::AutoCancelled).unwrap();
        assert_eq!(json, "12");
        let parsed: DeviceKind = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, DeviceKind::Panel);
        assert!(serde_json::from_str::<CheckType>("11").is_err());
    }
}
