//! open-iscsi initiator driven through `iscsiadm`.
//!
//! All invocations are serialized behind one lock: concurrent `iscsiadm`
//! processes contend on the node database and fail with `ISCSI_ERR_IDBM`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::Status;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::platform::{CommandRunner, PlatformResult};
use crate::volume_context::IscsiContext;

/// Default iSCSI port appended to portals given without one.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

/// Node database busy
const ISCSI_ERR_IDBM: i32 = 6;
/// Session already exists
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// No records/sessions found
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

const IDBM_ATTEMPTS: usize = 3;
const IDBM_BACKOFF: Duration = Duration::from_millis(100);

/// `host` → `host:3260`; portals that already carry a port are kept.
pub fn normalize_portal(portal: &str) -> String {
    let has_port = match portal.strip_prefix('[') {
        Some(rest) => rest.contains("]:"),
        None => portal.contains(':'),
    };
    if has_port {
        portal.to_string()
    } else {
        format!("{}:{}", portal, DEFAULT_ISCSI_PORT)
    }
}

/// udev by-path node for LUN 0 of `target` reached through `portal`.
pub fn by_path_device(by_path_root: &Path, portal: &str, target: &str) -> PathBuf {
    by_path_root.join(format!(
        "ip-{}-iscsi-{}-lun-0",
        normalize_portal(portal),
        target
    ))
}

/// Poll until `device` exists or `timeout` elapses.
pub async fn wait_for_device(device: &Path, timeout: Duration, interval: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(device).await.unwrap_or(false) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

pub struct Initiator {
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
    backoff: Duration,
}

impl Initiator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            lock: Mutex::new(()),
            backoff: IDBM_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `iscsiadm`, treating `tolerated` as success and retrying a busy
    /// node database.
    async fn iscsiadm(&self, args: &[&str], tolerated: Option<i32>) -> PlatformResult<()> {
        let _guard = self.lock.lock().await;

        let mut attempt = 1;
        loop {
            let output = self.runner.run("iscsiadm", args).await.map_err(|e| {
                error!(error = %e, "Failed to execute iscsiadm");
                Status::unavailable(format!("Failed to execute iscsiadm: {}", e))
            })?;

            match output.code {
                Some(0) => return Ok(()),
                Some(code) if Some(code) == tolerated => {
                    debug!(code, args = ?redact(args), "iscsiadm exit status tolerated");
                    return Ok(());
                }
                Some(ISCSI_ERR_IDBM) if attempt < IDBM_ATTEMPTS => {
                    warn!(attempt, "iscsiadm node database busy, retrying");
                    metrics::record_iscsiadm_retry("node");
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                code => {
                    error!(code = ?code, args = ?redact(args), stderr = %output.stderr.trim(), "iscsiadm failed");
                    return Err(Status::unavailable(format!(
                        "iscsiadm failed ({:?}): {}",
                        code,
                        output.stderr.trim()
                    )));
                }
            }
        }
    }

    async fn update(&self, target: &str, key: &str, value: &str) -> PlatformResult<()> {
        self.iscsiadm(
            &["-m", "node", "-T", target, "-o", "update", "-n", key, "-v", value],
            None,
        )
        .await
    }

    /// Create the node record and apply session settings and CHAP credentials.
    pub async fn add_node(&self, ctx: &IscsiContext) -> PlatformResult<()> {
        let target = ctx.target.as_str();
        info!(target = %target, portal = %ctx.portal, "Adding iSCSI node record");

        self.iscsiadm(
            &["-m", "node", "-T", target, "-p", ctx.portal.as_str(), "-o", "new"],
            None,
        )
        .await?;

        let mut settings = vec![
            ("node.startup", "manual"),
            ("node.session.timeo.replacement_timeout", "0"),
        ];
        if let Some(auth) = &ctx.in_auth {
            settings.push(("node.session.auth.authmethod", "CHAP"));
            settings.push(("node.session.auth.username", auth.username.as_str()));
            settings.push(("node.session.auth.password", auth.password.as_str()));

            if let Some(out) = &ctx.out_auth {
                settings.push(("node.session.auth.username_in", out.username.as_str()));
                settings.push(("node.session.auth.password_in", out.password.as_str()));
            }
        }

        for (key, value) in settings {
            self.update(target, key, value).await?;
        }
        Ok(())
    }

    pub async fn login(&self, target: &str) -> PlatformResult<()> {
        info!(target = %target, "Logging in to iSCSI target");
        self.iscsiadm(&["-m", "node", "-T", target, "-l"], Some(ISCSI_ERR_SESS_EXISTS))
            .await
    }

    pub async fn logout(&self, target: &str) -> PlatformResult<()> {
        info!(target = %target, "Logging out of iSCSI target");
        self.iscsiadm(&["-m", "node", "-T", target, "-u"], Some(ISCSI_ERR_NO_OBJS_FOUND))
            .await
    }

    pub async fn delete_node(&self, target: &str) -> PlatformResult<()> {
        info!(target = %target, "Deleting iSCSI node record");
        self.iscsiadm(
            &["-m", "node", "-T", target, "-o", "delete"],
            Some(ISCSI_ERR_NO_OBJS_FOUND),
        )
        .await
    }
}

/// Blank out the value following a `*.password*` key.
fn redact(args: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut secret_next = false;
    let mut password_key = false;
    for arg in args {
        if secret_next {
            out.push("<redacted>".to_string());
            secret_next = false;
            continue;
        }
        if *arg == "-v" && password_key {
            secret_next = true;
        }
        if arg.contains("password") {
            password_key = true;
        }
        out.push(arg.to_string());
    }
    out
}
