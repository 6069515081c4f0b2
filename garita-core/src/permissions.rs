//! Derived permissions. Nothing here is persisted; every read recomputes.

use crate::config::LifecycleConfig;
use crate::entities::{AccessGrant, CheckType, Event, Registration, Role};
use garita_sdk::objects::Validity;
use itertools::Itertools;
use time::OffsetDateTime;
use uuid::Uuid;

/// Whether `requesting` is one of the registration's access points. A
/// visitor caller is always refused.
pub fn permitir_acceso(accesos: &[AccessGrant], roles: &[Role], requesting: Uuid) -> bool {
    if roles.contains(&Role::Visitor) {
        return false;
    }
    !accesos.is_empty() && accesos.iter().any(|a| a.id_acceso == requesting)
}

/// Every assigned access point has at least one entry and one exit.
///
/// Counts are not compared: two exits after one entry still qualify.
pub fn se_puede_finalizar(accesos: &[AccessGrant], events: &[Event]) -> bool {
    if accesos.is_empty() {
        return false;
    }
    accesos.iter().map(|a| a.id_acceso).unique().all(|id| {
        let at_point = || events.iter().filter(move |e| e.id_acceso == Some(id));
        at_point().any(|e| e.tipo_check == CheckType::Entry)
            && at_point().any(|e| e.tipo_check == CheckType::Exit)
    })
}

/// Gate-side decision for a presented code. `events` are in `estatus` order.
pub fn check_validity(
    registration: &Registration,
    events: &[Event],
    config: &LifecycleConfig,
    now: OffsetDateTime,
) -> Validity {
    let status = events.last().map(|e| e.tipo_check);
    match status {
        Some(CheckType::Finalized | CheckType::AutoFinalized) => return Validity::Finalized,
        Some(CheckType::Cancelled | CheckType::AutoCancelled) => return Validity::Cancelled,
        _ if !registration.activo => return Validity::Cancelled,
        None => return Validity::NoHistory,
        Some(CheckType::Pending) => return Validity::NotAuthorized,
        Some(CheckType::Rejected) => return Validity::Rejected,
        Some(CheckType::AwaitingValidation) => return Validity::AwaitingValidation,
        Some(CheckType::Invalid) => return Validity::Invalid,
        Some(CheckType::Granted | CheckType::Entry | CheckType::Exit | CheckType::Undefined) => {}
    }

    let entry = config.entry_tolerance.duration();
    let cancel = config.cancellation_tolerance.duration();
    let exit = config.exit_tolerance.duration();

    if now < registration.fecha_entrada - entry {
        return Validity::NotYetOpen;
    }
    let entered = events.iter().any(|e| e.tipo_check == CheckType::Entry);
    if !entered && now > registration.fecha_entrada + entry + cancel {
        return Validity::EntryExpired;
    }
    if registration
        .fecha_salida
        .is_some_and(|salida| now > salida + exit + cancel)
    {
        return Validity::WindowClosed;
    }
    Validity::Valid
}
