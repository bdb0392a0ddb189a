use cm_core::types::{
    CodeModeDiff, CodeModeRequest, CodeModeResponse, DiffKind, ErrorKind, FileBuffer, FileFailure,
    FileId, FileSummary, IntegrationEvent, Session, SessionId, SessionStats, SessionStatus,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "code mode", description = "Request, response and event types"),
    components(schemas(
        CodeModeRequest,
        CodeModeResponse,
        CodeModeDiff,
        FileBuffer,
        FileSummary,
        FileFailure,
        Session,
        SessionStats,
        IntegrationEvent,
        SessionId,
        FileId,
        SessionStatus,
        DiffKind,
        ErrorKind
    ))
)]
struct ApiDoc;

pub fn generate() -> String {
    ApiDoc::openapi()
        .to_pretty_json()
        .unwrap_or_else(|_| "{}".to_string())
}
