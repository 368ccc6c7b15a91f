//! CJS export oracle.
//!
//! A single long-lived Node.js child hosts a registry of named services
//! spoken to over a line-framed JSON protocol: requests go to the child's
//! stdin as `{invokeId, service, input}` records, replies come back as
//! `<invokeId><json>` lines where the invoke id is the 8-hex-char
//! little-endian rendering of an atomic 32-bit counter. The child signals
//! readiness with a single `READY` line; requests queue until then.
//!
//! The only service the engine requires is `parseCJSModuleExports`, used
//! to enumerate the named exports of a CommonJS entry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{EsmdError, Result};
use crate::install::PackageInstaller;

/// The service used to enumerate CommonJS named exports.
pub const PARSE_CJS_EXPORTS_SERVICE: &str = "parseCJSModuleExports";

/// Queued requests the dispatcher will accept before callers are rejected.
const CHANNEL_CAPACITY: usize = 1000;

/// In-flight invoke ids above this are treated as a stuck child.
const MAX_PENDING: usize = 10_000;

/// The sidecar program. `__SERVICES__` is replaced with a JSON array of
/// package names whose exports are merged into the service registry.
const NS_APP_TEMPLATE: &str = r#"
const readline = require('readline')
const rl = readline.createInterface({
  input: process.stdin,
  historySize: 0,
  crlfDelay: Infinity
})
const services = {
  test: async input => ({ ...input })
}
const register = __SERVICES__

for (const name of register) {
  Object.assign(services, require(name))
}

rl.on('line', async line => {
  if (line.charAt(0) === '{' && line.charAt(line.length - 1) === '}') {
    try {
      const { service, invokeId, input } = JSON.parse(line)
      if (typeof invokeId === 'string') {
        let output = null
        if (typeof service === 'string' && service in services) {
          try {
            output = await services[service](input)
          } catch (e) {
            output = { error: e.message }
          }
        } else {
          output = { error: 'service not found' }
        }
        process.stdout.write(invokeId)
        process.stdout.write(JSON.stringify(output))
        process.stdout.write('\n')
      }
    } catch (e) {}
  }
})

setTimeout(() => {
  process.stdout.write('READY\n')
}, 0)
"#;

/// Result of a `parseCJSModuleExports` call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CjsModuleExports {
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

struct ServiceTask {
    service: String,
    input: serde_json::Value,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Handle to the running sidecar.
pub struct NodeServices {
    sender: mpsc::Sender<ServiceTask>,
    pending: Arc<DashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl NodeServices {
    /// Materialise the service packages into `wd`, spawn the child, and
    /// start the dispatcher and reader loops. Calls made before the child
    /// reports `READY` are held in the dispatcher queue.
    pub async fn start(
        wd: &Path,
        services: &[String],
        installer: &PackageInstaller,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(wd).await?;

        let services_inject = if services.is_empty() {
            "[]".to_string()
        } else {
            installer.add(wd, services).await?;
            debug!("node services {:?} installed", services);
            serde_json::to_string(services)?
        };

        let app = NS_APP_TEMPLATE.replace("__SERVICES__", &services_inject);
        tokio::fs::write(wd.join("ns.js"), app).await?;

        let pid_file = wd.join("ns.pid");
        kill_previous(&pid_file);

        let mut child = Command::new("node")
            .arg("ns.js")
            .current_dir(wd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| EsmdError::Oracle(format!("spawn node: {}", e)))?;

        let mut stdin = child.stdin.take().expect("child stdin piped");
        let stdout = child.stdout.take().expect("child stdout piped");
        let stderr = child.stderr.take().expect("child stderr piped");

        if let Some(pid) = child.id() {
            debug!("node services process started, pid is {}", pid);
            let _ = tokio::fs::write(&pid_file, pid.to_string()).await;
        }

        let pending: Arc<DashMap<String, oneshot::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
        let ready = Arc::new(AtomicBool::new(false));
        let invoke_index = Arc::new(AtomicU32::new(0));
        let (sender, mut receiver) = mpsc::channel::<ServiceTask>(CHANNEL_CAPACITY);

        // Dispatcher: hold requests until READY, then frame and write them.
        {
            let pending = pending.clone();
            let ready = ready.clone();
            let invoke_index = invoke_index.clone();
            tokio::spawn(async move {
                loop {
                    if !ready.load(Ordering::Acquire) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    let Some(task) = receiver.recv().await else {
                        break;
                    };
                    let invoke_id = invoke_id_hex(invoke_index.fetch_add(1, Ordering::SeqCst) + 1);
                    let record = serde_json::json!({
                        "invokeId": invoke_id,
                        "service": task.service,
                        "input": task.input,
                    });
                    let mut line = record.to_string().into_bytes();
                    line.push(b'\n');
                    pending.insert(invoke_id.clone(), task.reply);
                    if stdin.write_all(&line).await.is_err() {
                        pending.remove(&invoke_id);
                    }
                }
            });
        }

        // Reader: flip READY, route replies by invoke id, drop orphans.
        {
            let pending = pending.clone();
            let ready = ready.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line == "READY" {
                        ready.store(true, Ordering::Release);
                    } else if line.len() > 8 {
                        let (invoke_id, body) = line.split_at(8);
                        if let Some((_, reply)) = pending.remove(invoke_id) {
                            // a caller that timed out dropped its receiver;
                            // the late reply is discarded here
                            let _ = reply.send(body.as_bytes().to_vec());
                        }
                    }
                }
            });
        }

        // Supervisor: report the stderr buffer when the child exits.
        tokio::spawn(async move {
            let mut err_buf = Vec::new();
            let mut stderr_lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = stderr_lines.next_line().await {
                err_buf.extend_from_slice(line.as_bytes());
                err_buf.push(b'\n');
            }
            match child.wait().await {
                Ok(status) if err_buf.is_empty() => {
                    warn!("node services exited: {}", status);
                }
                Ok(_) => {
                    error!(
                        "node services exited: {}",
                        String::from_utf8_lossy(&err_buf).trim()
                    );
                }
                Err(e) => error!("node services wait: {}", e),
            }
        });

        Ok(Arc::new(Self { sender, pending }))
    }

    /// Invoke a named service. On timeout the call yields a synthetic
    /// `{"error":"timeout"}` and the in-flight invoke id is abandoned.
    pub async fn invoke(
        &self,
        service: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        if self.pending.len() > MAX_PENDING {
            return Err(EsmdError::Oracle(
                "too many in-flight service calls".to_string(),
            ));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ServiceTask {
                service: service.to_string(),
                input,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EsmdError::Oracle("service channel closed".to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(bytes)) => Ok(serde_json::from_slice(&bytes)?),
            Ok(Err(_)) => Err(EsmdError::Oracle("service reply dropped".to_string())),
            Err(_) => Ok(serde_json::json!({ "error": "timeout" })),
        }
    }

    /// Enumerate the named exports of a CommonJS entry.
    pub async fn parse_cjs_module_exports(
        &self,
        wd: &Path,
        import_path: &str,
        node_env: &str,
        timeout: Duration,
    ) -> Result<CjsModuleExports> {
        let output = self
            .invoke(
                PARSE_CJS_EXPORTS_SERVICE,
                serde_json::json!({
                    "cwd": wd.to_string_lossy(),
                    "importPath": import_path,
                    "nodeEnv": node_env,
                }),
                timeout,
            )
            .await?;
        Ok(serde_json::from_value(output)?)
    }
}

/// Render an invoke id as the 8-hex-char little-endian form the child
/// echoes back as the reply prefix.
pub fn invoke_id_hex(id: u32) -> String {
    let mut out = String::with_capacity(8);
    for b in id.to_le_bytes() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Best-effort kill of a previously recorded sidecar process.
fn kill_previous(pid_file: &PathBuf) {
    let Ok(content) = std::fs::read_to_string(pid_file) else {
        return;
    };
    let Ok(pid) = content.trim().parse::<u32>() else {
        return;
    };
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status();
    }
    #[cfg(not(unix))]
    let _ = pid;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_id_hex_little_endian() {
        assert_eq!(invoke_id_hex(1), "01000000");
        assert_eq!(invoke_id_hex(256), "00010000");
        assert_eq!(invoke_id_hex(0xdeadbeef), "efbeadde");
        assert_eq!(invoke_id_hex(u32::MAX), "ffffffff");
    }

    #[test]
    fn test_reply_frame_split() {
        let line = format!("{}{}", invoke_id_hex(7), r#"{"exports":["join"]}"#);
        let (id, body) = line.split_at(8);
        assert_eq!(id, "07000000");
        let parsed: CjsModuleExports = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.exports, vec!["join"]);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_services_inject() {
        let app = NS_APP_TEMPLATE.replace("__SERVICES__", r#"["esm-node-services"]"#);
        assert!(app.contains(r#"const register = ["esm-node-services"]"#));
        assert!(!app.contains("__SERVICES__"));
    }
}
