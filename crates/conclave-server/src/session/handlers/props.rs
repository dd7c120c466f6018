//! Workspace and user property changes.
//!
//! All SET-* commands funnel into one procedure that applies the change,
//! emits the property-change event, and reports whether the file store
//! must be resynchronized and the possibly-updated login type.

use conclave_proto::atom;

use super::{CommandCtx, HandlerFail, HandlerResult};
use crate::{backend::BackendConn, process};

/// Handle any property-change command.
pub async fn prop_change<C: BackendConn>(ctx: &mut CommandCtx<'_, C>) -> HandlerResult {
    let mut extra = bytes::BytesMut::new();
    atom::write_u32(&mut extra, ctx.cmd.msg_type);

    let rest = ctx.bound_query("handle_kws_prop_change", &extra).await?;

    let mut buf = &rest[..];
    let sync_store = atom::read_u32(&mut buf)?;
    let new_login_type = atom::read_u32(&mut buf)?;

    // The procedure may have upgraded or downgraded the session's login.
    let kws = ctx.kws()?;
    if let Some(login_type) = conclave_proto::types::LoginType::from_u32(new_login_type) {
        if let Some(entry) = ctx.workspaces.get_mut(&kws.kws_id) {
            entry.login_type = login_type;
        }
    }

    if sync_store != 0 {
        let outcome = process::run_helper(
            &ctx.shared.config.helper_path,
            &["--sync-store", &kws.kws_id.to_string()],
            None,
            std::time::Duration::from_secs(60),
        )
        .await
        .map_err(|e| {
            HandlerFail::Backend(crate::backend::BackendError::Db(format!(
                "cannot run store sync helper: {e}"
            )))
        })?;
        process::log_output("store-sync", &outcome);
        if !outcome.success() {
            return Err(HandlerFail::Backend(crate::backend::BackendError::Db(
                "store sync helper failed".to_owned(),
            )));
        }
    }

    Ok(())
}
