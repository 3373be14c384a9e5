pub use config::*;
pub use edit::{is_provisional_id, provisional_record, EditHandle, LocalEdit, PROVISIONAL_ID_PREFIX};
pub use policy::ConflictPolicy;
pub use reconciled::ReconciledView;

pub mod config;
pub mod edit;
pub mod policy;
pub mod reconciled;
