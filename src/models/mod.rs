// src/models/mod.rs

pub mod device;
pub mod event;
pub mod pairing;
pub mod session;
pub mod transfer;

pub use device::{Device, DeviceInfo};
pub use event::{EventEnvelope, EventKind};
pub use pairing::{PairingDecision, PairingTicket};
pub use session::OperatorSession;
pub use transfer::{ConflictPolicy, TransferDirection, TransferSession, TransferState};
