pub mod codes;
pub mod registration;
pub mod ws;

pub use codes::{AccessMode, CheckType, CodeError, DeviceKind, Role};
pub use registration::{
    AppendEventRequest, CloseRegistrationRequest, ErrorResponse, EventResponse, IngestStatus,
    PanelEventAck, PanelEventReport, PanelSyncResponse, RegistrationStatusResponse, Validity,
    ValidityResponse,
};
