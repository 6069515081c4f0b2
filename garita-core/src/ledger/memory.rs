//! In-memory store for tests, with failure injection.

use super::store::{
    AppendCommit, CommitOutcome, DocumentStore, LedgerStore, PanelStore, StoreError,
};
use crate::entities::document::DocumentValidity;
use crate::entities::event::ClockSample;
use crate::entities::{
    AccessGrant, AccessMode, AccessPanel, CheckType, Event, PanelEventKey, Registration,
    SyncAction, SyncIntent,
};
use crate::utils::clock::{ClockCalibration, SkewObservation};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use uuid::Uuid;

/// Access point backed by a panel in every fixture registration.
pub const PANEL_GATE: Uuid = Uuid::from_u128(0xA1);
/// Reception-only access point in every fixture registration.
pub const RECEPTION_GATE: Uuid = Uuid::from_u128(0xA2);

#[derive(Default)]
struct State {
    registrations: HashMap<Uuid, Registration>,
    events: HashMap<Uuid, Event>,
    panels: HashMap<Uuid, AccessPanel>,
    outbox: HashMap<(Uuid, Uuid), SyncIntent>,
    documents: HashMap<Uuid, DocumentValidity>,
    pending_conflicts: u32,
    pending_post_commit_failures: u32,
    stale_report_reads: u32,
    failing_reads: HashSet<Uuid>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

pub fn registration_fixture(n: u128, fecha_entrada: OffsetDateTime) -> Registration {
    Registration {
        id: Uuid::from_u128(n),
        codigo: format!("VST{n:04}").into(),
        nombre: format!("Visitante {n}"),
        img_usuario: None,
        accesos: smallvec::smallvec![
            AccessGrant {
                id_acceso: PANEL_GATE,
                modo: AccessMode::Panel,
            },
            AccessGrant {
                id_acceso: RECEPTION_GATE,
                modo: AccessMode::EntryOnly,
            },
        ],
        estatus: Vec::new(),
        activo: true,
        fecha_entrada,
        fecha_salida: None,
        fecha_modificacion: fecha_entrada,
        version: 0,
    }
}

pub fn panel_fixture(n: u128, id_acceso: Uuid, contrasena: String) -> AccessPanel {
    AccessPanel {
        id: Uuid::from_u128(0xB000 + n),
        nombre: format!("Panel {n}"),
        id_acceso,
        direccion_ip: format!("10.0.0.{n}"),
        usuario: "admin".into(),
        contrasena,
        activo: true,
        habilitar_citas: true,
        reloj_offset_segundos: 0,
        reloj_alerta_activa: false,
        reloj_ultimo_desfase_segundos: None,
        reloj_ultima_muestra: None,
    }
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_registration(&self, registration: Registration) {
        self.lock()
            .registrations
            .insert(registration.id, registration);
    }

    pub fn insert_panel(&self, panel: AccessPanel) {
        self.lock().panels.insert(panel.id, panel);
    }

    pub fn insert_document(&self, document: DocumentValidity) {
        self.lock().documents.insert(document.id, document);
    }

    pub fn document_snapshot(&self, id: Uuid) -> Option<DocumentValidity> {
        self.lock().documents.get(&id).cloned()
    }

    pub fn update_panel(&self, id: Uuid, f: impl FnOnce(&mut AccessPanel)) {
        if let Some(panel) = self.lock().panels.get_mut(&id) {
            f(panel);
        }
    }

    pub fn update_registration(&self, id: Uuid, f: impl FnOnce(&mut Registration)) {
        if let Some(registration) = self.lock().registrations.get_mut(&id) {
            f(registration);
        }
    }

    pub fn registration_snapshot(&self, id: Uuid) -> Option<Registration> {
        self.lock().registrations.get(&id).cloned()
    }

    pub fn panel_snapshot(&self, id: Uuid) -> Option<AccessPanel> {
        self.lock().panels.get(&id).cloned()
    }

    pub fn events_of(&self, id_registro: Uuid) -> Vec<Event> {
        let state = self.lock();
        linked_events(&state, id_registro)
    }

    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn sync_intent(&self, id_registro: Uuid, id_panel: Uuid) -> Option<SyncIntent> {
        self.lock().outbox.get(&(id_registro, id_panel)).cloned()
    }

    pub fn outbox_len(&self) -> usize {
        self.lock().outbox.len()
    }

    /// Make the next `n` commits lose a version race.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().pending_conflicts = n;
    }

    /// Make the next `n` commits land but report a transient failure.
    pub fn fail_after_commit(&self, n: u32) {
        self.lock().pending_post_commit_failures = n;
    }

    /// Let the next `n` panel reports read the history as it was before any
    /// of them committed: the duplicate and last-movement lookups find
    /// nothing. Each last-movement lookup consumes one.
    pub fn stale_report_reads(&self, n: u32) {
        self.lock().stale_report_reads = n;
    }

    /// Make history reads for a registration fail.
    pub fn fail_reads_for(&self, id_registro: Uuid) {
        self.lock().failing_reads.insert(id_registro);
    }
}

fn linked_events(state: &State, id_registro: Uuid) -> Vec<Event> {
    state
        .registrations
        .get(&id_registro)
        .map(|r| {
            r.estatus
                .iter()
                .filter_map(|id| state.events.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn panel_time(event: &Event) -> Option<OffsetDateTime> {
    event.skew.map(|s| s.fecha_panel)
}

/// Key covered by the unique panel report index; events without a panel
/// reading are not indexed.
fn report_key(event: &Event) -> Option<PanelEventKey> {
    Some(PanelEventKey {
        id_panel: Some(event.id_panel?),
        id_registro: event.registration_id()?,
        tipo_check: event.tipo_check,
        tipo_dispositivo: event.tipo_dispositivo,
        fecha_panel: panel_time(event)?,
    })
}

fn same_report(event: &Event, key: &PanelEventKey) -> bool {
    event.id_panel == key.id_panel
        && event.registration_id() == Some(key.id_registro)
        && event.tipo_check == key.tipo_check
        && event.tipo_dispositivo == key.tipo_dispositivo
        && panel_time(event) == Some(key.fecha_panel)
}

fn panel_matches(event: &Event, id_panel: Option<Uuid>) -> bool {
    id_panel.is_none() || event.id_panel == id_panel
}

fn check_reads(state: &State, id_registro: Uuid) -> Result<(), StoreError> {
    if state.failing_reads.contains(&id_registro) {
        return Err(StoreError::Unavailable(format!(
            "history of {id_registro} is unreadable"
        )));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn registration(&self, id: Uuid) -> Result<Option<Registration>, StoreError> {
        Ok(self.lock().registrations.get(&id).cloned())
    }

    async fn registration_by_code(
        &self,
        codigo: &str,
    ) -> Result<Option<Registration>, StoreError> {
        Ok(self
            .lock()
            .registrations
            .values()
            .find(|r| r.codigo == codigo)
            .cloned())
    }

    async fn active_registrations(&self) -> Result<Vec<Registration>, StoreError> {
        let mut active: Vec<_> = self
            .lock()
            .registrations
            .values()
            .filter(|r| r.activo)
            .cloned()
            .collect();
        active.sort_by_key(|r| (r.fecha_entrada, r.id));
        Ok(active)
    }

    async fn recent_events(
        &self,
        id_registro: Uuid,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let state = self.lock();
        check_reads(&state, id_registro)?;
        let mut events = linked_events(&state, id_registro);
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn registration_events(&self, id_registro: Uuid) -> Result<Vec<Event>, StoreError> {
        let state = self.lock();
        check_reads(&state, id_registro)?;
        Ok(linked_events(&state, id_registro))
    }

    async fn panel_event_exists(&self, key: &PanelEventKey) -> Result<bool, StoreError> {
        let state = self.lock();
        if state.stale_report_reads > 0 {
            return Ok(false);
        }
        Ok(state.events.values().any(|e| same_report(e, key)))
    }

    async fn last_panel_movement(
        &self,
        id_registro: Uuid,
        id_panel: Option<Uuid>,
        until: OffsetDateTime,
    ) -> Result<Option<Event>, StoreError> {
        let mut state = self.lock();
        if state.stale_report_reads > 0 {
            state.stale_report_reads -= 1;
            return Ok(None);
        }
        Ok(state
            .events
            .values()
            .filter(|e| {
                e.registration_id() == Some(id_registro)
                    && panel_matches(e, id_panel)
                    && e.tipo_check.is_movement()
                    && panel_time(e).is_some_and(|t| t <= until)
            })
            .max_by_key(|e| panel_time(e))
            .cloned())
    }

    async fn has_entry_between(
        &self,
        id_registro: Uuid,
        id_panel: Option<Uuid>,
        since: OffsetDateTime,
        until: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().events.values().any(|e| {
            e.registration_id() == Some(id_registro)
                && panel_matches(e, id_panel)
                && e.tipo_check == CheckType::Entry
                && panel_time(e).is_some_and(|t| since <= t && t <= until)
        }))
    }

    async fn commit_append(&self, commit: AppendCommit) -> Result<CommitOutcome, StoreError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(id_registro) = commit.event.registration_id() else {
            return Ok(CommitOutcome::Missing);
        };
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            if let Some(registration) = state.registrations.get_mut(&id_registro) {
                registration.version += 1;
            }
            return Ok(CommitOutcome::VersionConflict);
        }
        if state.events.contains_key(&commit.event.id) {
            return Err(StoreError::Unavailable(format!(
                "duplicate event id {}",
                commit.event.id
            )));
        }
        let Some(registration) = state.registrations.get_mut(&id_registro) else {
            return Ok(CommitOutcome::Missing);
        };
        if registration.version != commit.expected_version {
            return Ok(CommitOutcome::VersionConflict);
        }
        let duplicate = report_key(&commit.event)
            .is_some_and(|key| state.events.values().any(|e| same_report(e, &key)));
        if duplicate {
            return Ok(CommitOutcome::DuplicateReport);
        }

        registration.estatus.push(commit.event.id);
        if commit.deactivate {
            registration.activo = false;
        }
        if commit.record_exit {
            registration.fecha_salida = Some(commit.event.fecha_creacion);
        }
        registration.fecha_modificacion = commit.event.fecha_creacion;
        registration.version += 1;
        state.events.insert(commit.event.id, commit.event);

        if state.pending_post_commit_failures > 0 {
            state.pending_post_commit_failures -= 1;
            return Err(StoreError::Unavailable("connection lost after commit".into()));
        }
        Ok(CommitOutcome::Committed)
    }
}

#[async_trait]
impl PanelStore for MemoryStore {
    async fn panels(&self) -> Result<Vec<AccessPanel>, StoreError> {
        let mut panels: Vec<_> = self.lock().panels.values().cloned().collect();
        panels.sort_by(|a, b| a.nombre.cmp(&b.nombre));
        Ok(panels)
    }

    async fn panel(&self, id: Uuid) -> Result<Option<AccessPanel>, StoreError> {
        Ok(self.lock().panels.get(&id).cloned())
    }

    async fn sync_panels_for(&self, access_ids: &[Uuid]) -> Result<Vec<AccessPanel>, StoreError> {
        let mut panels: Vec<_> = self
            .lock()
            .panels
            .values()
            .filter(|p| p.syncs_for(access_ids))
            .cloned()
            .collect();
        panels.sort_by(|a, b| a.nombre.cmp(&b.nombre));
        Ok(panels)
    }

    async fn clock_samples(
        &self,
        id_panel: Uuid,
        since: OffsetDateTime,
    ) -> Result<Vec<ClockSample>, StoreError> {
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| e.id_panel == Some(id_panel))
            .filter_map(|e| e.skew)
            .filter(|s| s.fecha_servidor_recepcion >= since)
            .map(|s| ClockSample {
                desfase_reloj_segundos: s.desfase_segundos,
                fecha_servidor_recepcion: s.fecha_servidor_recepcion,
            })
            .collect())
    }

    async fn save_calibration(
        &self,
        id_panel: Uuid,
        calibration: ClockCalibration,
    ) -> Result<(), StoreError> {
        self.update_panel(id_panel, |panel| {
            panel.reloj_offset_segundos = calibration.offset_segundos;
            panel.reloj_alerta_activa = calibration.alerta;
            panel.reloj_ultimo_desfase_segundos = Some(calibration.ultimo_desfase_segundos);
            panel.reloj_ultima_muestra = Some(calibration.ultima_muestra);
        });
        Ok(())
    }

    async fn record_skew(
        &self,
        id_panel: Uuid,
        observation: SkewObservation,
    ) -> Result<(), StoreError> {
        self.update_panel(id_panel, |panel| {
            panel.reloj_alerta_activa = observation.alerta;
            panel.reloj_ultimo_desfase_segundos = Some(observation.desfase_segundos);
            panel.reloj_ultima_muestra = Some(observation.muestra);
            if let Some(offset) = observation.offset_detectado {
                panel.reloj_offset_segundos = offset;
            }
        });
        Ok(())
    }

    async fn record_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        accion: SyncAction,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.lock().outbox.insert(
            (id_registro, id_panel),
            SyncIntent {
                id_registro,
                id_panel,
                accion,
                intentos: 0,
                ultimo_error: None,
                siguiente_intento: now,
            },
        );
        Ok(())
    }

    async fn confirm_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        accion: SyncAction,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let key = (id_registro, id_panel);
        if state.outbox.get(&key).is_some_and(|i| i.accion == accion) {
            state.outbox.remove(&key);
        }
        Ok(())
    }

    async fn defer_sync_intent(
        &self,
        id_registro: Uuid,
        id_panel: Uuid,
        error: String,
        next_attempt: OffsetDateTime,
    ) -> Result<(), StoreError> {
        if let Some(intent) = self.lock().outbox.get_mut(&(id_registro, id_panel)) {
            intent.intentos += 1;
            intent.ultimo_error = Some(error);
            intent.siguiente_intento = next_attempt;
        }
        Ok(())
    }

    async fn drop_sync_intent(&self, id_registro: Uuid, id_panel: Uuid) -> Result<(), StoreError> {
        self.lock().outbox.remove(&(id_registro, id_panel));
        Ok(())
    }

    async fn due_sync_intents(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<SyncIntent>, StoreError> {
        let mut due: Vec<_> = self
            .lock()
            .outbox
            .values()
            .filter(|i| i.siguiente_intento <= now)
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.siguiente_intento, i.id_registro, i.id_panel));
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn expire_documents(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let mut expired = 0;
        for document in state.documents.values_mut() {
            if document.is_expired(now) {
                document.activo = false;
                expired += 1;
            }
        }
        Ok(expired)
    }
}
