pub mod diff;
pub mod enums;
pub mod event;
pub mod file;
pub mod ids;
pub mod io;
pub mod session;

pub use diff::{CodeModeDiff, DiffMap};
pub use enums::{DiffKind, ErrorKind, SessionStatus};
pub use event::IntegrationEvent;
pub use file::{FileBuffer, FileSummary, language_for_path};
pub use ids::{FileId, IdError, SessionId};
pub use io::{CodeModeRequest, CodeModeResponse, FileFailure};
pub use session::{Session, SessionStats};
