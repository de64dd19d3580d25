pub mod backend;
pub mod connection;
pub mod session;
pub mod simulated;
pub mod status;
pub mod template;

pub use backend::{LedgerBackend, SessionHandle};
pub use connection::LedgerConnection;
pub use session::LedgerSession;
pub use simulated::SimulatedLedger;
pub use status::StatusDocument;
pub use template::{AccountInfo, AccountKind, LedgerTemplate, PayloadSummary, TemplateAccount};
