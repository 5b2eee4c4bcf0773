pub mod access;
pub mod challenge;
pub mod event;
pub mod session;

pub use access::{
    AccessContext, AccessDecision, Condition, Permission, PermissionOverride, Role, RoleDefinition,
};
pub use challenge::{MfaChallenge, MfaEnrollment, MfaMethod, MfaSetup, MfaVerification};
pub use event::{SecurityEvent, SecurityEventKind, Severity};
pub use session::{
    CreateSessionOptions, DeviceInput, DeviceProfile, GeoLocation, Session, SessionFlag,
    SessionFlagKind,
};
