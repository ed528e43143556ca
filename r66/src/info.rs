//! Transfer info exchanged as the free-form "user content" of a request.

use common::model::{TransferInfo, TransferStep};
use common::pipeline::Pipeline;
use common::TransferError;

use crate::protocol::UpdateInfo;

/// Key under which non-JSON user content is kept.
pub const USER_CONTENT: &str = "__userContent__";
/// Key of the follow id, never sent back to the partner.
pub const FOLLOW_ID: &str = "__followID__";

/// Merges the user content of a request into `info`.
///
/// A JSON object is merged key by key; any other text is kept verbatim under
/// [`USER_CONTENT`]. Text that starts like an object but does not parse is an error.
pub fn update_transfer_info(info: &mut TransferInfo, content: &str) -> Result<(), serde_json::Error> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    if !trimmed.starts_with('{') {
        info.insert(USER_CONTENT.to_string(), serde_json::Value::String(content.to_string()));
        return Ok(());
    }
    let map: TransferInfo = serde_json::from_str(trimmed)?;
    info.extend(map);
    Ok(())
}

/// Builds the user content sent to the partner from the transfer info.
pub fn make_user_content(info: &TransferInfo) -> String {
    if let Some(serde_json::Value::String(content)) = info.get(USER_CONTENT) {
        return content.clone();
    }
    let mut map = info.clone();
    map.remove(FOLLOW_ID);
    if map.is_empty() {
        return String::new();
    }
    serde_json::Value::Object(map).to_string()
}

/// Merges the user content of a request into the transfer info of `pip`.
/// Ignored once the data step is reached.
pub fn update_pipeline_info(pip: &mut Pipeline, content: &str) -> Result<(), TransferError> {
    if pip.transfer().step >= TransferStep::Data {
        return Ok(());
    }
    if let Err(err) = update_transfer_info(&mut pip.ctx.transfer.transfer_info, content) {
        tracing::error!("failed to parse transfer info: {err}");
        return Err(TransferError::internal("failed to parse transfer info"));
    }
    pip.update_trans()
}

/// Applies the file metadata sent by the partner: new file name relative to
/// the rule's remote directory, and the file size when known.
pub fn apply_update_info(pip: &mut Pipeline, info: &UpdateInfo) -> Result<(), TransferError> {
    if pip.transfer().step >= TransferStep::Data {
        return Ok(());
    }
    if !info.filename.is_empty() {
        let remote_dir = pip.ctx.rule.remote_dir.trim_matches('/');
        let name = info.filename.trim_start_matches('/');
        let name = name.strip_prefix(remote_dir).unwrap_or(name).trim_start_matches('/');
        let name = name.to_string();
        pip.rebuild_filepaths(&name)?;
    }
    if info.filesize >= 0 {
        pip.ctx.transfer.filesize = info.filesize;
    }
    update_pipeline_info(pip, &info.user_content)
}
