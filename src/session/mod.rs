//! Session core: identity provider gateway, session ledger, lifecycle manager,
//! bearer validation and request admission.

pub mod admission;
pub mod bearer;
pub mod clock;
pub mod error;
pub mod idp;
pub mod ledger;
pub mod manager;
pub mod model;

pub use admission::{Admission, AdmissionControl};
pub use bearer::{BearerValidator, IdpBearerValidator, LocalKeyValidator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SessionError;
pub use idp::{IdentityClaims, IdentityProvider, IdpError, IdpTokens, Rejection};
pub use ledger::{AccountStore, SessionLedger};
pub use manager::{LifecycleConfig, TokenLifecycleManager};
pub use model::{Account, RefreshRecord, TokenBundle};
